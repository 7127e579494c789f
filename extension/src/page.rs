// Foreground page controller
//
// Owns the settings store and the location watcher. The JS glue wires:
// - the agent link: a function posting JSON to the service worker
// - the notice callback: toasts, log panel, status badge
// - messages from the service worker into handleAgentMessage

use beacon_core::config::{parse_interval, ConfigError};
use beacon_core::{
    AgentLink, AgentMessage, ChannelError, ConfigStore, ConfigUpdate, LocationWatcher, Notice,
    Notifier, PageCommand,
};
use futures::StreamExt;
use serde::Serialize;
use std::cell::RefCell;
use std::rc::Rc;
use wasm_bindgen::prelude::*;

use crate::services::{BrowserGeolocation, LocalStorage};
use crate::to_js;

/// Page -> service worker
struct JsAgentLink {
    post: js_sys::Function,
}

impl AgentLink for JsAgentLink {
    fn post(&self, command: PageCommand) -> Result<(), ChannelError> {
        let json = command
            .to_json()
            .map_err(|e| ChannelError::Malformed(e.to_string()))?;

        // the glue returns false when no service worker controls the page
        match self.post.call1(&JsValue::NULL, &JsValue::from_str(&json)) {
            Ok(posted) if posted.as_bool() == Some(false) => Err(ChannelError::Inactive),
            Ok(_) => Ok(()),
            Err(e) => {
                log::warn!("Posting to the service worker threw: {:?}", e);
                Err(ChannelError::Inactive)
            }
        }
    }
}

#[derive(Clone)]
struct JsNotifier {
    callback: js_sys::Function,
}

impl Notifier for JsNotifier {
    fn notify(&self, notice: Notice) {
        let json = match serde_json::to_string(&notice) {
            Ok(json) => json,
            Err(e) => {
                log::error!("Failed to encode notice: {}", e);
                return;
            }
        };

        // Deferred: the callback may re-enter the controller while the watcher is borrowed
        let callback = self.callback.clone();
        wasm_bindgen_futures::spawn_local(async move {
            if let Err(e) = callback.call1(&JsValue::NULL, &JsValue::from_str(&json)) {
                log::warn!("Notice callback threw: {:?}", e);
            }
        });
    }
}

type PageWatcher = LocationWatcher<BrowserGeolocation, JsAgentLink, JsNotifier>;

#[derive(Serialize)]
struct FieldError {
    field: &'static str,
    message: String,
}

impl From<&ConfigError> for FieldError {
    fn from(error: &ConfigError) -> Self {
        Self {
            field: error.field().key(),
            message: error.to_string(),
        }
    }
}

#[wasm_bindgen]
pub struct PageController {
    watcher: Rc<RefCell<PageWatcher>>,
    store: RefCell<ConfigStore<LocalStorage>>,
}

#[wasm_bindgen]
impl PageController {
    /// `post_to_agent(json) -> bool` and `on_notice(json)` come from the glue
    #[wasm_bindgen(constructor)]
    pub fn new(post_to_agent: js_sys::Function, on_notice: js_sys::Function) -> PageController {
        let notifier = JsNotifier {
            callback: on_notice,
        };

        let mut store = ConfigStore::new(LocalStorage::open());
        let config = store.load();
        if store.is_degraded() {
            notifier.notify(Notice::Error {
                message: "Settings cannot be stored in this browser and will be lost on reload"
                    .to_string(),
            });
        }

        let watcher = LocationWatcher::new(
            BrowserGeolocation::default(),
            JsAgentLink {
                post: post_to_agent,
            },
            notifier,
            config,
        );

        Self {
            watcher: Rc::new(RefCell::new(watcher)),
            store: RefCell::new(store),
        }
    }

    /// Current settings as JSON
    pub fn settings(&self) -> Result<String, JsValue> {
        serde_json::to_string(self.watcher.borrow().config()).map_err(to_js)
    }

    /// Save the form fields that were edited (None = untouched)
    ///
    /// Valid fields are persisted and, while tracking, sent to the agent.
    /// Returns a JSON list of `{field, message}` for the rejected ones.
    #[wasm_bindgen(js_name = saveSettings)]
    pub fn save_settings(
        &self,
        device_id: Option<String>,
        server_url: Option<String>,
        interval: Option<String>,
    ) -> Result<String, JsValue> {
        let mut errors = Vec::new();

        let sampling_interval_seconds = match interval.as_deref().map(parse_interval) {
            Some(Ok(seconds)) => Some(seconds),
            Some(Err(e)) => {
                errors.push(e);
                None
            }
            None => None,
        };
        let update = ConfigUpdate {
            device_identifier: device_id,
            server_endpoint: server_url,
            sampling_interval_seconds,
        };

        let (valid, invalid) = update.validated();
        errors.extend(invalid);
        if !valid.is_empty() {
            self.store.borrow_mut().save(valid.clone());
            self.watcher.borrow_mut().update_config(valid);
        }

        let report: Vec<FieldError> = errors.iter().map(FieldError::from).collect();
        serde_json::to_string(&report).map_err(to_js)
    }

    /// Validate settings and start watching; rejects with the reason
    pub fn start(&self) -> Result<(), JsValue> {
        let mut events = self.watcher.borrow_mut().start().map_err(to_js)?;

        // ends once the watch is cancelled and its callbacks are dropped
        let watcher = self.watcher.clone();
        wasm_bindgen_futures::spawn_local(async move {
            while let Some(event) = events.next().await {
                watcher.borrow_mut().handle_sensor_event(event);
            }
            log::debug!("Sensor event pump finished");
        });

        Ok(())
    }

    pub fn stop(&self) {
        self.watcher.borrow_mut().stop();
    }

    /// Feed a JSON message received from the service worker
    #[wasm_bindgen(js_name = handleAgentMessage)]
    pub fn handle_agent_message(&self, raw: &str) -> Result<(), JsValue> {
        let message = AgentMessage::from_json(raw).map_err(to_js)?;
        self.watcher.borrow_mut().handle_agent_message(message);
        Ok(())
    }

    #[wasm_bindgen(js_name = requestStatus)]
    pub fn request_status(&self) {
        self.watcher.borrow_mut().request_status();
    }

    #[wasm_bindgen(js_name = isWatching)]
    pub fn is_watching(&self) -> bool {
        self.watcher.borrow().state().is_watching_position
    }

    #[wasm_bindgen(js_name = lastError)]
    pub fn last_error(&self) -> Option<String> {
        self.watcher.borrow().state().last_known_error.clone()
    }
}
