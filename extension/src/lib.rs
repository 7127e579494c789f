// GPS Beacon browser bindings
//
// One wasm module, loaded twice:
// - the page instantiates PageController (sensor, settings form, toasts)
// - the service worker instantiates BackgroundAgent (throttle + relay calls)
// JavaScript is only glue between these types and the browser events.

use wasm_bindgen::prelude::*;

mod background;
mod page;
pub mod services;

pub use background::BackgroundAgent;
pub use page::PageController;

#[wasm_bindgen(start)]
pub fn run() {
    wasm_logger::init(wasm_logger::Config::default());
    log::info!("GPS Beacon module loaded");
}

pub(crate) fn to_js(error: impl std::fmt::Display) -> JsValue {
    JsValue::from_str(&error.to_string())
}
