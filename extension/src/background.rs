// Background forwarding agent for the service worker
// Works with --target no-modules; the worker script is just glue that feeds
// client messages in and hands each page a callback for replies.

use beacon_core::{AgentMessage, ChannelError, ClientId, ClientPort, ForwardingAgent};
use std::rc::Rc;
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::future_to_promise;

use crate::services::{BrowserClock, HttpRelay};
use crate::to_js;

/// Reply path to one page: a JS function taking the JSON text
struct JsPort {
    client: ClientId,
    post: js_sys::Function,
}

impl ClientPort for JsPort {
    fn send(&self, message: &AgentMessage) -> Result<(), ChannelError> {
        let json = message
            .to_json()
            .map_err(|e| ChannelError::Malformed(e.to_string()))?;

        self.post
            .call1(&JsValue::NULL, &JsValue::from_str(&json))
            .map(|_| ())
            .map_err(|_| ChannelError::Disconnected(self.client.clone()))
    }
}

#[wasm_bindgen]
pub struct BackgroundAgent {
    agent: Rc<ForwardingAgent<HttpRelay, BrowserClock>>,
}

#[wasm_bindgen]
impl BackgroundAgent {
    /// `relay_url` is the base URL of the relay service
    #[wasm_bindgen(constructor)]
    pub fn new(relay_url: &str) -> Result<BackgroundAgent, JsValue> {
        let relay = HttpRelay::new(relay_url).map_err(to_js)?;
        log::info!("Background agent ready, relaying via {}", relay.endpoint());

        Ok(Self {
            agent: Rc::new(ForwardingAgent::new(relay, BrowserClock)),
        })
    }

    /// Register (or refresh) the reply callback of a page
    pub fn connect(&self, client_id: String, post: js_sys::Function) {
        let port = JsPort {
            client: client_id.clone(),
            post,
        };
        self.agent.connect(client_id, Box::new(port));
    }

    pub fn disconnect(&self, client_id: &str) -> bool {
        self.agent.disconnect(client_id)
    }

    #[wasm_bindgen(js_name = clientCount)]
    pub fn client_count(&self) -> usize {
        self.agent.clients().len()
    }

    /// Handle one raw control message; resolves once the command is done
    ///
    /// The worker should pass the promise to `event.waitUntil` so the browser
    /// keeps it alive while a delivery is outstanding.
    #[wasm_bindgen(js_name = handleMessage)]
    pub fn handle_message(&self, client_id: String, raw: String) -> js_sys::Promise {
        let agent = self.agent.clone();
        future_to_promise(async move {
            agent.handle_json(client_id, &raw).await;
            Ok(JsValue::UNDEFINED)
        })
    }

    #[wasm_bindgen(js_name = isForwarding)]
    pub fn is_forwarding(&self) -> bool {
        self.agent.is_forwarding_enabled()
    }

    /// Counters as JSON, for the debug panel
    pub fn stats(&self) -> Result<String, JsValue> {
        serde_json::to_string(&self.agent.stats()).map_err(to_js)
    }
}
