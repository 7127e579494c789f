// Foreground location watcher
//
// Idle -> RequestingPermission -> Watching -> Idle
//
// The sensor is push-driven: it delivers SensorEvents into a channel and the
// page pumps them into `handle_sensor_event`. Permission denied is the only
// sensor error that ends a watch; unavailable/timeout are reported and the
// subscription keeps running.

use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use serde::Serialize;
use thiserror::Error;

use crate::channel::{AgentLink, ChannelError};
use crate::config::{ConfigError, ConfigUpdate, TrackingConfiguration};
use crate::protocol::{AgentMessage, LocationUpdate, PageCommand};
use crate::sample::LocationSample;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SensorError {
    #[error("Location permission denied")]
    PermissionDenied,

    #[error("Position unavailable: {0}")]
    PositionUnavailable(String),

    #[error("Timed out waiting for a position fix")]
    Timeout,

    #[error("Geolocation is not supported by this browser")]
    Unsupported,
}

impl SensorError {
    /// Ends the watch; everything else is retried by the sensor itself
    pub fn is_fatal(&self) -> bool {
        matches!(self, SensorError::PermissionDenied | SensorError::Unsupported)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SensorEvent {
    Fix(LocationSample),
    Error(SensorError),
}

pub type SensorSink = UnboundedSender<SensorEvent>;
pub type SensorEvents = UnboundedReceiver<SensorEvent>;

/// Cancellation handle of an active sensor subscription
pub trait WatchHandle {
    fn cancel(self: Box<Self>);
}

pub trait LocationSensor {
    /// Start continuous watching; events are pushed into `sink` until cancelled
    fn watch(&self, sink: SensorSink) -> Result<Box<dyn WatchHandle>, SensorError>;
}

/// What the page shows the user (toasts, log panel, status badge)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "level", rename_all = "snake_case")]
pub enum Notice {
    Info { message: String },
    Success { message: String },
    Error { message: String },
    Tracking { is_tracking: bool, message: String },
}

pub trait Notifier {
    fn notify(&self, notice: Notice);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchPhase {
    Idle,
    RequestingPermission,
    Watching,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageTrackingState {
    pub is_watching_position: bool,
    pub last_known_error: Option<String>,
    /// Last on/off state reported by the agent
    pub agent_tracking: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatchError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Sensor(#[from] SensorError),

    #[error("Tracking is already active")]
    AlreadyActive,
}

pub struct LocationWatcher<S, L, N> {
    sensor: S,
    link: L,
    notifier: N,
    config: TrackingConfiguration,
    phase: WatchPhase,
    subscription: Option<Box<dyn WatchHandle>>,
    state: PageTrackingState,
    /// start-tracking posted, agent has not confirmed yet
    awaiting_start_ack: bool,
}

impl<S: LocationSensor, L: AgentLink, N: Notifier> LocationWatcher<S, L, N> {
    pub fn new(sensor: S, link: L, notifier: N, config: TrackingConfiguration) -> Self {
        Self {
            sensor,
            link,
            notifier,
            config,
            phase: WatchPhase::Idle,
            subscription: None,
            state: PageTrackingState::default(),
            awaiting_start_ack: false,
        }
    }

    pub fn phase(&self) -> WatchPhase {
        self.phase
    }

    pub fn state(&self) -> &PageTrackingState {
        &self.state
    }

    pub fn config(&self) -> &TrackingConfiguration {
        &self.config
    }

    /// Validate settings and subscribe to the sensor
    ///
    /// The agent is only contacted once the first fix proves permission.
    pub fn start(&mut self) -> Result<SensorEvents, WatchError> {
        if self.phase != WatchPhase::Idle {
            return Err(WatchError::AlreadyActive);
        }

        if let Err(e) = self.config.validate() {
            self.report_error(format!("Cannot start tracking: {}", e));
            return Err(e.into());
        }

        let (sink, events) = mpsc::unbounded();
        match self.sensor.watch(sink) {
            Ok(handle) => {
                self.subscription = Some(handle);
                self.phase = WatchPhase::RequestingPermission;
                self.notifier.notify(Notice::Info {
                    message: "Requesting location permission".to_string(),
                });
                Ok(events)
            }
            Err(e) => {
                self.report_error(e.to_string());
                Err(e.into())
            }
        }
    }

    /// User-initiated stop
    pub fn stop(&mut self) {
        let was_watching = self.phase == WatchPhase::Watching;
        if self.phase == WatchPhase::Idle {
            return;
        }

        self.go_idle();
        if was_watching {
            self.post(PageCommand::StopTracking);
        }
        self.notifier.notify(Notice::Info {
            message: "Location tracking stopped".to_string(),
        });
    }

    pub fn handle_sensor_event(&mut self, event: SensorEvent) {
        match (self.phase, event) {
            (WatchPhase::Idle, _) => {
                log::debug!("Ignoring sensor event while idle");
            }
            (WatchPhase::RequestingPermission, SensorEvent::Fix(sample)) => {
                self.phase = WatchPhase::Watching;
                self.state.is_watching_position = true;
                self.state.last_known_error = None;

                let start = PageCommand::StartTracking {
                    config: self.config.clone(),
                };
                if let Err(e) = self.link.post(start) {
                    // nothing can be forwarded without the agent
                    self.go_idle();
                    self.report_error(e.to_string());
                    return;
                }
                self.awaiting_start_ack = true;
                self.relay_sample(sample);
            }
            (WatchPhase::Watching, SensorEvent::Fix(sample)) => self.relay_sample(sample),
            (WatchPhase::RequestingPermission, SensorEvent::Error(e)) if e.is_fatal() => {
                self.go_idle();
                self.report_error(e.to_string());
            }
            (WatchPhase::Watching, SensorEvent::Error(e)) if e.is_fatal() => {
                self.go_idle();
                self.post(PageCommand::StopTracking);
                self.report_error(e.to_string());
            }
            (_, SensorEvent::Error(e)) => {
                log::warn!("Transient location error: {}", e);
                self.report_error(e.to_string());
            }
        }
    }

    /// Apply settings edits; forwarded to the agent while watching
    pub fn update_config(&mut self, update: ConfigUpdate) -> Vec<ConfigError> {
        let (valid, errors) = update.validated();
        if valid.is_empty() {
            return errors;
        }

        // valid fields only, so apply() cannot reject anything here
        self.config.apply(valid.clone());
        if self.phase == WatchPhase::Watching {
            self.post(PageCommand::UpdateConfig(valid));
        }
        errors
    }

    pub fn request_status(&mut self) {
        self.post(PageCommand::GetStatus);
    }

    pub fn handle_agent_message(&mut self, message: AgentMessage) {
        match message {
            AgentMessage::Status { message } => self.notifier.notify(Notice::Info { message }),
            AgentMessage::Success { message } => {
                self.state.last_known_error = None;
                self.notifier.notify(Notice::Success { message });
            }
            AgentMessage::Error { message } => self.report_error(message),
            AgentMessage::TrackingStatus {
                is_tracking,
                message,
            } => {
                self.state.agent_tracking = Some(is_tracking);

                if is_tracking {
                    self.awaiting_start_ack = false;
                } else if self.phase == WatchPhase::Watching && !self.awaiting_start_ack {
                    // stopped elsewhere (another tab); follow without echoing a stop
                    log::info!("Agent stopped forwarding, releasing location watch");
                    self.go_idle();
                }

                self.notifier.notify(Notice::Tracking {
                    is_tracking,
                    message,
                });
            }
        }
    }

    fn relay_sample(&mut self, sample: LocationSample) {
        let update = PageCommand::LocationUpdate(LocationUpdate {
            sample,
            destination: self.config.destination(),
        });
        self.post(update);
    }

    fn post(&mut self, command: PageCommand) {
        if let Err(e) = self.link.post(command) {
            self.report_channel_error(e);
        }
    }

    fn report_channel_error(&mut self, error: ChannelError) {
        log::warn!("Agent unreachable: {}", error);
        self.report_error(error.to_string());
    }

    fn report_error(&mut self, message: String) {
        self.state.last_known_error = Some(message.clone());
        self.notifier.notify(Notice::Error { message });
    }

    fn go_idle(&mut self) {
        if let Some(handle) = self.subscription.take() {
            handle.cancel();
        }
        self.phase = WatchPhase::Idle;
        self.state.is_watching_position = false;
        self.awaiting_start_ack = false;
    }
}
