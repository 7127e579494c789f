// GPS Beacon - location forwarding pipeline
//
// Platform-independent core shared by the browser page, the background
// forwarding agent (service worker) and the HTTP relay server.
//
// Flow:
// 1. Page loads TrackingConfiguration from the ConfigStore
// 2. LocationWatcher subscribes to the device sensor and pushes every fix
// 3. ForwardingAgent throttles, guards the single in-flight delivery,
//    calls the DeliveryRelay and reports back over the control channel

pub mod agent;
pub mod channel;
pub mod clock;
pub mod config;
pub mod protocol;
pub mod relay;
pub mod sample;
pub mod watcher;

pub use agent::{DeliveryState, ForwardingAgent, ForwardingState, ForwardingStats};
pub use channel::{AgentLink, ChannelError, ClientId, ClientPort, ClientRegistry};
pub use clock::{Clock, ManualClock};
pub use config::{ConfigError, ConfigStore, ConfigUpdate, KeyValueStorage, TrackingConfiguration};
pub use protocol::{AgentMessage, LocationUpdate, PageCommand};
pub use relay::{DeliveryFailure, DeliveryRelay, Destination, FailureKind};
pub use sample::LocationSample;
pub use watcher::{LocationSensor, LocationWatcher, Notice, Notifier, SensorError, SensorEvent};
