// Background forwarding agent
//
// Owns the forwarding on/off flag and decides, per incoming sample, whether
// to attempt a delivery:
// - throttle: at least `samplingIntervalSeconds` between attempts
//   (measured from the last attempt, not the last success)
// - in-flight guard: at most one outstanding relay call; samples that
//   arrive meanwhile are dropped, never queued
//
// Single-threaded: state lives in a RefCell and is never borrowed across an
// await, so concurrent `handle` futures interleave only at the relay call.

use futures::{Stream, StreamExt};
use serde::Serialize;
use std::cell::RefCell;

use crate::channel::{ClientId, ClientPort, ClientRegistry, Envelope};
use crate::clock::Clock;
use crate::config::{ConfigUpdate, TrackingConfiguration};
use crate::protocol::{AgentMessage, LocationUpdate, PageCommand};
use crate::relay::DeliveryRelay;
use crate::sample::LocationSample;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryState {
    #[default]
    Idle,
    InFlight {
        /// Forwarding session the call belongs to
        session: u64,
        started_ms: u64,
    },
}

impl DeliveryState {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, DeliveryState::InFlight { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardingStats {
    pub attempts: u64,
    pub delivered: u64,
    pub failed: u64,
    pub throttled: u64,
    pub dropped_in_flight: u64,
    /// Results that came back after the session was stopped or replaced
    pub discarded: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ForwardingState {
    pub config: ConfigUpdate,
    pub enabled: bool,
    pub last_attempt_ms: Option<u64>,
    pub delivery: DeliveryState,
    /// Bumped on every accepted start
    pub session: u64,
    pub stats: ForwardingStats,
}

pub struct ForwardingAgent<R, C> {
    relay: R,
    clock: C,
    clients: ClientRegistry,
    state: RefCell<ForwardingState>,
}

impl<R: DeliveryRelay, C: Clock> ForwardingAgent<R, C> {
    pub fn new(relay: R, clock: C) -> Self {
        Self {
            relay,
            clock,
            clients: ClientRegistry::new(),
            state: RefCell::new(ForwardingState::default()),
        }
    }

    pub fn connect(&self, client: impl Into<ClientId>, port: Box<dyn ClientPort>) {
        self.clients.connect(client, port);
    }

    pub fn disconnect(&self, client: &str) -> bool {
        self.clients.disconnect(client)
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    pub fn state(&self) -> ForwardingState {
        self.state.borrow().clone()
    }

    pub fn is_forwarding_enabled(&self) -> bool {
        self.state.borrow().enabled
    }

    pub fn delivery_state(&self) -> DeliveryState {
        self.state.borrow().delivery
    }

    pub fn stats(&self) -> ForwardingStats {
        self.state.borrow().stats
    }

    /// Process commands as they arrive; deliveries of different commands overlap
    pub async fn serve(&self, commands: impl Stream<Item = Envelope>) {
        commands
            .for_each_concurrent(None, |envelope| self.handle(envelope.from, envelope.command))
            .await;
        log::info!("Command channel closed, agent idle");
    }

    /// Decode a raw control message and handle it
    pub async fn handle_json(&self, from: ClientId, raw: &str) {
        match PageCommand::from_json(raw) {
            Ok(command) => self.handle(from, command).await,
            Err(e) => {
                log::warn!("Malformed command from {}: {}", from, e);
                self.clients
                    .reply(&from, AgentMessage::error(format!("Malformed command: {}", e)));
            }
        }
    }

    pub async fn handle(&self, from: ClientId, command: PageCommand) {
        log::info!("Command '{}' from page {}", command.name(), from);

        match command {
            PageCommand::StartTracking { config } => self.start(&from, config),
            PageCommand::StopTracking => self.stop(),
            PageCommand::LocationUpdate(update) => self.location_update(&from, update).await,
            PageCommand::UpdateConfig(update) => self.update_config(&from, update),
            PageCommand::GetStatus => self.report_status(),
        }
    }

    fn start(&self, from: &str, config: TrackingConfiguration) {
        if let Err(e) = config.validate() {
            log::warn!("Refusing to start with invalid settings: {}", e);
            self.clients
                .reply(from, AgentMessage::error(format!("Cannot start tracking: {}", e)));
            return;
        }

        let message = format!(
            "Tracking started for {} (every {}s)",
            config.device_identifier, config.sampling_interval_seconds
        );

        {
            let mut state = self.state.borrow_mut();
            state.config = ConfigUpdate::from(config);
            state.enabled = true;
            state.last_attempt_ms = None;
            state.session += 1;
        }

        self.clients.broadcast(AgentMessage::tracking(true, message));
    }

    fn stop(&self) {
        {
            let mut state = self.state.borrow_mut();
            state.enabled = false;
            state.delivery = DeliveryState::Idle;
        }

        self.clients
            .broadcast(AgentMessage::tracking(false, "Tracking stopped"));
    }

    fn update_config(&self, from: &str, update: ConfigUpdate) {
        let (valid, errors) = update.validated();
        if !valid.is_empty() {
            self.state.borrow_mut().config.merge(valid);
            log::info!("Settings updated");
        }

        if !errors.is_empty() {
            let reasons: Vec<String> = errors.iter().map(ToString::to_string).collect();
            self.clients.reply(
                from,
                AgentMessage::error(format!("Ignored invalid settings: {}", reasons.join("; "))),
            );
        }
    }

    fn report_status(&self) {
        let message = {
            let state = self.state.borrow();
            match (state.enabled, state.config.complete()) {
                (true, Ok(config)) => format!(
                    "Forwarding to {} as {} every {}s ({} sent, {} failed)",
                    config.server_endpoint,
                    config.device_identifier,
                    config.sampling_interval_seconds,
                    state.stats.delivered,
                    state.stats.failed
                ),
                (true, Err(e)) => format!("Forwarding enabled but settings incomplete: {}", e),
                (false, _) => "Forwarding inactive".to_string(),
            }
        };

        let enabled = self.is_forwarding_enabled();
        self.clients.broadcast(AgentMessage::tracking(enabled, message));
    }

    async fn location_update(&self, from: &str, update: LocationUpdate) {
        let LocationUpdate {
            sample,
            destination,
        } = update;
        let now = self.clock.now_ms();

        let (config, session) = {
            let mut state = self.state.borrow_mut();
            if !state.enabled {
                log::debug!("Forwarding disabled, ignoring sample");
                return;
            }

            let config = match state.config.complete() {
                Ok(config) => config,
                Err(e) => {
                    log::debug!("Settings incomplete ({}), ignoring sample", e);
                    return;
                }
            };
            if destination != config.destination() {
                log::debug!(
                    "Sample tagged for {} as {}, sending with active settings",
                    destination.server_endpoint,
                    destination.device_identifier
                );
            }

            if let Some(last) = state.last_attempt_ms {
                let elapsed = now.saturating_sub(last);
                if elapsed < config.interval_ms() {
                    state.stats.throttled += 1;
                    log::debug!(
                        "Throttled: {}ms since last attempt, interval {}ms",
                        elapsed,
                        config.interval_ms()
                    );
                    return;
                }
            }

            state.last_attempt_ms = Some(now);
            (config, state.session)
        };

        self.deliver(from, sample, config, session, now).await;
    }

    async fn deliver(
        &self,
        from: &str,
        sample: LocationSample,
        config: TrackingConfiguration,
        session: u64,
        now: u64,
    ) {
        let in_flight = DeliveryState::InFlight {
            session,
            started_ms: now,
        };

        {
            let mut state = self.state.borrow_mut();
            if state.delivery.is_in_flight() {
                state.stats.dropped_in_flight += 1;
                log::debug!("Delivery already in flight, dropping sample");
                return;
            }
            state.delivery = in_flight;
            state.stats.attempts += 1;
        }

        // Clears the in-flight mark on every exit, including a dropped future
        let _guard = InFlightGuard {
            state: &self.state,
            mark: in_flight,
        };

        self.clients.reply(
            from,
            AgentMessage::status(format!("Sending position to {}", config.server_endpoint)),
        );

        let outcome = self.relay.deliver(&sample, &config.destination()).await;

        let current = {
            let mut state = self.state.borrow_mut();
            if state.delivery == in_flight {
                state.delivery = DeliveryState::Idle;
            }

            let current = state.enabled && state.session == session;
            if !current {
                state.stats.discarded += 1;
            } else if outcome.is_ok() {
                state.stats.delivered += 1;
            } else {
                state.stats.failed += 1;
            }
            current
        };

        if !current {
            log::debug!("Discarding result of a delivery from a stopped session");
            return;
        }

        match outcome {
            Ok(()) => {
                log::info!(
                    "Position ({:.6}, {:.6}) delivered to {}",
                    sample.latitude,
                    sample.longitude,
                    config.server_endpoint
                );
                self.clients.reply(
                    from,
                    AgentMessage::success(format!(
                        "Position sent ({:.6}, {:.6})",
                        sample.latitude, sample.longitude
                    )),
                );
            }
            Err(failure) => {
                log::warn!("Delivery failed ({:?}): {}", failure.kind, failure.reason);
                self.clients.reply(
                    from,
                    AgentMessage::error(format!("Failed to send position: {}", failure)),
                );
            }
        }
    }
}

struct InFlightGuard<'a> {
    state: &'a RefCell<ForwardingState>,
    mark: DeliveryState,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.try_borrow_mut() {
            if state.delivery == self.mark {
                state.delivery = DeliveryState::Idle;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::client_port;
    use crate::clock::ManualClock;
    use crate::relay::{DeliveryFailure, Destination, FailureKind};
    use async_trait::async_trait;
    use futures::channel::{mpsc::UnboundedReceiver, oneshot};
    use std::cell::Cell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    /// Relay whose calls complete only when the test releases them
    #[derive(Default)]
    struct GatedRelay {
        gates: RefCell<VecDeque<oneshot::Receiver<Result<(), DeliveryFailure>>>>,
        calls: Cell<usize>,
        destinations: RefCell<Vec<Destination>>,
    }

    impl GatedRelay {
        fn gate(&self) -> oneshot::Sender<Result<(), DeliveryFailure>> {
            let (tx, rx) = oneshot::channel();
            self.gates.borrow_mut().push_back(rx);
            tx
        }
    }

    #[async_trait(?Send)]
    impl DeliveryRelay for Rc<GatedRelay> {
        async fn deliver(
            &self,
            _sample: &LocationSample,
            destination: &Destination,
        ) -> Result<(), DeliveryFailure> {
            self.calls.set(self.calls.get() + 1);
            self.destinations.borrow_mut().push(destination.clone());
            let gate = self.gates.borrow_mut().pop_front();
            match gate {
                Some(rx) => rx
                    .await
                    .unwrap_or_else(|_| Err(DeliveryFailure::new(FailureKind::Relay))),
                None => Ok(()),
            }
        }
    }

    fn config() -> TrackingConfiguration {
        TrackingConfiguration::new("dev1", "http://example.com:5055", 5)
    }

    fn update(lat: f64) -> PageCommand {
        PageCommand::LocationUpdate(LocationUpdate {
            sample: LocationSample::new(lat, 13.4, 1_700_000_000),
            destination: config().destination(),
        })
    }

    fn drain(rx: &mut UnboundedReceiver<AgentMessage>) -> Vec<AgentMessage> {
        let mut messages = Vec::new();
        while let Ok(Some(message)) = rx.try_next() {
            messages.push(message);
        }
        messages
    }

    fn agent() -> (
        ForwardingAgent<Rc<GatedRelay>, ManualClock>,
        Rc<GatedRelay>,
        ManualClock,
        UnboundedReceiver<AgentMessage>,
    ) {
        let relay = Rc::new(GatedRelay::default());
        let clock = ManualClock::new(0);
        let agent = ForwardingAgent::new(relay.clone(), clock.clone());
        let (port, rx) = client_port("page");
        agent.connect("page", Box::new(port));
        (agent, relay, clock, rx)
    }

    #[tokio::test]
    async fn test_sample_ignored_until_started() {
        let (agent, relay, _clock, mut rx) = agent();

        agent.handle("page".into(), update(52.5)).await;

        assert_eq!(relay.calls.get(), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_start_allows_immediate_delivery() {
        let (agent, relay, clock, mut rx) = agent();
        clock.set(1_000_000);

        agent
            .handle("page".into(), PageCommand::StartTracking { config: config() })
            .await;
        agent.handle("page".into(), update(52.5)).await;

        assert_eq!(relay.calls.get(), 1);
        let messages = drain(&mut rx);
        assert!(matches!(
            messages[0],
            AgentMessage::TrackingStatus {
                is_tracking: true,
                ..
            }
        ));
        assert!(matches!(messages[1], AgentMessage::Status { .. }));
        assert!(matches!(messages[2], AgentMessage::Success { .. }));
        assert_eq!(messages.len(), 3);
    }

    #[tokio::test]
    async fn test_second_sample_dropped_while_in_flight() {
        let (agent, relay, clock, mut rx) = agent();
        agent
            .handle("page".into(), PageCommand::StartTracking { config: config() })
            .await;
        drain(&mut rx);

        let release = relay.gate();
        let first = agent.handle("page".into(), update(1.0));
        let second = async {
            // past the throttle window, still blocked by the in-flight guard
            clock.set(60_000);
            assert!(agent.delivery_state().is_in_flight());
            agent.handle("page".into(), update(2.0)).await;
            release.send(Ok(())).unwrap();
        };
        futures::join!(first, second);

        assert_eq!(relay.calls.get(), 1);
        assert_eq!(agent.stats().dropped_in_flight, 1);
        assert_eq!(agent.delivery_state(), DeliveryState::Idle);

        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 2, "{:?}", messages);
        assert!(matches!(messages[0], AgentMessage::Status { .. }));
        assert!(matches!(messages[1], AgentMessage::Success { .. }));
    }

    #[tokio::test]
    async fn test_result_after_stop_is_discarded() {
        let (agent, relay, _clock, mut rx) = agent();
        agent
            .handle("page".into(), PageCommand::StartTracking { config: config() })
            .await;

        let release = relay.gate();
        let delivery = agent.handle("page".into(), update(1.0));
        let stop = async {
            agent.handle("page".into(), PageCommand::StopTracking).await;
            assert_eq!(agent.delivery_state(), DeliveryState::Idle);
            release.send(Ok(())).unwrap();
        };
        futures::join!(delivery, stop);

        assert_eq!(agent.stats().discarded, 1);
        assert_eq!(agent.stats().delivered, 0);
        let messages = drain(&mut rx);
        assert!(messages.iter().all(|m| !m.is_terminal()), "{:?}", messages);
        assert_eq!(
            messages.last(),
            Some(&AgentMessage::tracking(false, "Tracking stopped"))
        );
    }

    #[tokio::test]
    async fn test_stale_completion_keeps_new_session_in_flight() {
        let (agent, relay, clock, mut rx) = agent();
        agent
            .handle("page".into(), PageCommand::StartTracking { config: config() })
            .await;

        let release_old = relay.gate();
        let release_new = relay.gate();
        let old = agent.handle("page".into(), update(1.0));
        let restart = async {
            agent.handle("page".into(), PageCommand::StopTracking).await;
            agent
                .handle("page".into(), PageCommand::StartTracking { config: config() })
                .await;
            clock.advance(100);
            let new = agent.handle("page".into(), update(2.0));
            let finish = async {
                // the old call finishes while the new one is still outstanding
                release_old.send(Ok(())).unwrap();
                futures::future::ready(()).await;
                assert!(agent.delivery_state().is_in_flight());
                release_new
                    .send(Err(DeliveryFailure::new(FailureKind::Timeout)))
                    .unwrap();
            };
            futures::join!(new, finish);
        };
        futures::join!(old, restart);

        let stats = agent.stats();
        assert_eq!(stats.attempts, 2);
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.failed, 1);
        assert!(agent.is_forwarding_enabled());

        let terminal: Vec<_> = drain(&mut rx).into_iter().filter(|m| m.is_terminal()).collect();
        assert_eq!(terminal.len(), 1);
        assert!(terminal[0].message().contains("did not respond in time"));
    }

    #[tokio::test]
    async fn test_invalid_start_is_rejected() {
        let (agent, _relay, _clock, mut rx) = agent();

        let bad = TrackingConfiguration::new("dev1", "not-a-url", 5);
        agent
            .handle("page".into(), PageCommand::StartTracking { config: bad })
            .await;

        assert!(!agent.is_forwarding_enabled());
        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 1);
        assert!(matches!(messages[0], AgentMessage::Error { .. }));
    }

    #[tokio::test]
    async fn test_update_config_keeps_throttle_timer() {
        let (agent, relay, clock, mut rx) = agent();
        agent
            .handle("page".into(), PageCommand::StartTracking { config: config() })
            .await;
        agent.handle("page".into(), update(1.0)).await;

        agent
            .handle(
                "page".into(),
                PageCommand::UpdateConfig(ConfigUpdate {
                    sampling_interval_seconds: Some(60),
                    server_endpoint: Some("::bad::".into()),
                    ..Default::default()
                }),
            )
            .await;

        clock.set(10_000);
        agent.handle("page".into(), update(2.0)).await;
        assert_eq!(relay.calls.get(), 1);

        clock.set(60_000);
        agent.handle("page".into(), update(3.0)).await;
        assert_eq!(relay.calls.get(), 2);

        let state = agent.state();
        assert_eq!(state.config.server_endpoint.as_deref(), Some("http://example.com:5055"));
        assert!(drain(&mut rx)
            .iter()
            .any(|m| m.message().starts_with("Ignored invalid settings")));
    }

    #[tokio::test]
    async fn test_get_status_is_broadcast_without_side_effects() {
        let (agent, _relay, _clock, mut rx) = agent();
        let (other_port, mut other_rx) = client_port("other");
        agent.connect("other", Box::new(other_port));

        agent.handle("page".into(), PageCommand::GetStatus).await;

        assert!(!agent.is_forwarding_enabled());
        let expected = AgentMessage::tracking(false, "Forwarding inactive");
        assert_eq!(drain(&mut rx), vec![expected.clone()]);
        assert_eq!(drain(&mut other_rx), vec![expected]);
    }

    #[tokio::test]
    async fn test_malformed_command_gets_error_reply() {
        let (agent, _relay, _clock, mut rx) = agent();

        agent.handle_json("page".into(), r#"{"command":"explode"}"#).await;

        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].message().starts_with("Malformed command"));
    }

    #[tokio::test]
    async fn test_sample_destination_does_not_change_settings() {
        let (agent, relay, _clock, _rx) = agent();
        agent
            .handle("page".into(), PageCommand::StartTracking { config: config() })
            .await;

        agent
            .handle(
                "page".into(),
                PageCommand::LocationUpdate(LocationUpdate {
                    sample: LocationSample::new(1.0, 2.0, 1_700_000_000),
                    destination: Destination {
                        server_endpoint: "http://elsewhere.example:8082".into(),
                        device_identifier: "someone-else".into(),
                    },
                }),
            )
            .await;

        assert_eq!(
            relay.destinations.borrow().as_slice(),
            &[config().destination()]
        );
        assert_eq!(agent.state().config, ConfigUpdate::from(config()));
    }

    #[tokio::test]
    async fn test_start_and_stop_reach_every_page() {
        let (agent, _relay, _clock, mut rx) = agent();
        let (other_port, mut other_rx) = client_port("other");
        agent.connect("other", Box::new(other_port));

        agent
            .handle("page".into(), PageCommand::StartTracking { config: config() })
            .await;
        for inbox in [&mut rx, &mut other_rx] {
            let messages = drain(inbox);
            assert_eq!(messages.len(), 1, "{:?}", messages);
            assert!(matches!(
                messages[0],
                AgentMessage::TrackingStatus {
                    is_tracking: true,
                    ..
                }
            ));
        }

        // stopped from the other tab, still heard by the first one
        agent.handle("other".into(), PageCommand::StopTracking).await;
        let stopped = AgentMessage::tracking(false, "Tracking stopped");
        assert_eq!(drain(&mut rx), vec![stopped.clone()]);
        assert_eq!(drain(&mut other_rx), vec![stopped]);
    }
}
