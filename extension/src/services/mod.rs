pub mod geolocation;
pub mod relay_client;
pub mod storage;

pub use geolocation::BrowserGeolocation;
pub use relay_client::HttpRelay;
pub use storage::LocalStorage;

use beacon_core::Clock;

/// `Date.now()`
#[derive(Debug, Clone, Copy, Default)]
pub struct BrowserClock;

impl Clock for BrowserClock {
    fn now_ms(&self) -> u64 {
        js_sys::Date::now() as u64
    }
}
