// Control channel plumbing
//
// Each page talks to the single agent through an AgentLink; the agent keeps
// one ClientPort per connected page. Replies go to the page that sent the
// command, tracking state goes to every page.

use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use std::cell::RefCell;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::protocol::{AgentMessage, PageCommand};

pub type ClientId = String;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("Background service is inactive; reload the page to reactivate it")]
    Inactive,

    #[error("Page {0} is no longer connected")]
    Disconnected(ClientId),

    #[error("Malformed message: {0}")]
    Malformed(String),
}

/// Agent -> one page
pub trait ClientPort {
    fn send(&self, message: &AgentMessage) -> Result<(), ChannelError>;
}

/// Page -> agent
pub trait AgentLink {
    fn post(&self, command: PageCommand) -> Result<(), ChannelError>;
}

/// Pages currently connected to the agent
#[derive(Default)]
pub struct ClientRegistry {
    ports: RefCell<BTreeMap<ClientId, Box<dyn ClientPort>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a page; reconnecting with the same id replaces the old port
    pub fn connect(&self, client: impl Into<ClientId>, port: Box<dyn ClientPort>) {
        let client = client.into();
        log::debug!("Page {} connected", client);
        self.ports.borrow_mut().insert(client, port);
    }

    pub fn disconnect(&self, client: &str) -> bool {
        self.ports.borrow_mut().remove(client).is_some()
    }

    pub fn len(&self) -> usize {
        self.ports.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.borrow().is_empty()
    }

    pub fn reply(&self, client: &str, message: AgentMessage) {
        let result = match self.ports.borrow().get(client) {
            Some(port) => port.send(&message),
            None => {
                log::debug!("No port for page {}, dropping '{}'", client, message.message());
                return;
            }
        };

        if let Err(e) = result {
            log::warn!("Reply to {} failed: {}", client, e);
            self.disconnect(client);
        }
    }

    pub fn broadcast(&self, message: AgentMessage) {
        let failed: Vec<ClientId> = self
            .ports
            .borrow()
            .iter()
            .filter_map(|(client, port)| match port.send(&message) {
                Ok(()) => None,
                Err(e) => {
                    log::warn!("Broadcast to {} failed: {}", client, e);
                    Some(client.clone())
                }
            })
            .collect();

        for client in failed {
            self.disconnect(&client);
        }
    }
}

/// In-process port backed by an unbounded channel
pub struct MpscPort {
    client: ClientId,
    tx: UnboundedSender<AgentMessage>,
}

impl ClientPort for MpscPort {
    fn send(&self, message: &AgentMessage) -> Result<(), ChannelError> {
        self.tx
            .unbounded_send(message.clone())
            .map_err(|_| ChannelError::Disconnected(self.client.clone()))
    }
}

pub fn client_port(client: impl Into<ClientId>) -> (MpscPort, UnboundedReceiver<AgentMessage>) {
    let (tx, rx) = mpsc::unbounded();
    (
        MpscPort {
            client: client.into(),
            tx,
        },
        rx,
    )
}

/// A command together with the page that sent it
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub from: ClientId,
    pub command: PageCommand,
}

/// In-process link from one page into the agent's command queue
#[derive(Clone)]
pub struct MpscLink {
    client: ClientId,
    tx: UnboundedSender<Envelope>,
}

impl MpscLink {
    pub fn new(client: impl Into<ClientId>, tx: UnboundedSender<Envelope>) -> Self {
        Self {
            client: client.into(),
            tx,
        }
    }
}

impl AgentLink for MpscLink {
    fn post(&self, command: PageCommand) -> Result<(), ChannelError> {
        self.tx
            .unbounded_send(Envelope {
                from: self.client.clone(),
                command,
            })
            .map_err(|_| ChannelError::Inactive)
    }
}

pub fn command_queue() -> (UnboundedSender<Envelope>, UnboundedReceiver<Envelope>) {
    mpsc::unbounded()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_reaches_only_the_sender() {
        let registry = ClientRegistry::new();
        let (port_a, mut rx_a) = client_port("a");
        let (port_b, mut rx_b) = client_port("b");
        registry.connect("a", Box::new(port_a));
        registry.connect("b", Box::new(port_b));

        registry.reply("a", AgentMessage::status("hello"));

        assert_eq!(rx_a.try_next().unwrap(), Some(AgentMessage::status("hello")));
        assert!(rx_b.try_next().is_err());
    }

    #[test]
    fn test_broadcast_prunes_closed_pages() {
        let registry = ClientRegistry::new();
        let (port_a, mut rx_a) = client_port("a");
        let (port_b, rx_b) = client_port("b");
        registry.connect("a", Box::new(port_a));
        registry.connect("b", Box::new(port_b));
        drop(rx_b);

        registry.broadcast(AgentMessage::tracking(false, "stopped"));

        assert_eq!(
            rx_a.try_next().unwrap(),
            Some(AgentMessage::tracking(false, "stopped"))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_link_reports_inactive_agent() {
        let (tx, rx) = command_queue();
        let link = MpscLink::new("page", tx);
        assert!(link.post(PageCommand::GetStatus).is_ok());

        drop(rx);
        assert_eq!(link.post(PageCommand::GetStatus), Err(ChannelError::Inactive));
    }
}
