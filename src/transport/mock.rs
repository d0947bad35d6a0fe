//! Scripted in-memory transport for tests and examples.
//!
//! [`MockTransport`] implements [`Transport`](super::Transport) against a
//! shared state cell. The paired [`MockHandle`] scripts the remote side:
//! inject connect failures, push notifications, trigger disconnects, and
//! inspect every write the session issued.
//!
//! # Example
//!
//! ```ignore
//! let (transport, handle) = MockTransport::with_mtu("hub-01", 128);
//! let mut session = Session::with_config(transport, SessionConfig::default());
//! session.open(&DeviceSelector::Name("hub-01".into())).await?;
//! assert_eq!(session.max_payload(), 128);
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{LinkError, Result};
use crate::protocol::MTU_QUERY_COMMAND;

use super::{DeviceSelector, Transport, TransportEvent};

/// Scripted responder: maps an outbound write to inbound notifications.
pub type Responder = Box<dyn FnMut(&[u8]) -> Vec<Bytes> + Send>;

const EVENT_CAPACITY: usize = 64;

struct MockState {
    advertised_name: String,
    held: Option<String>,
    link_open: bool,
    resolved: bool,
    connect_failures: VecDeque<LinkError>,
    link_failures: VecDeque<LinkError>,
    connect_attempts: usize,
    writes: Vec<Vec<u8>>,
    responder: Option<Responder>,
    events: Option<mpsc::Sender<TransportEvent>>,
}

/// In-memory [`Transport`] double backed by shared scripted state.
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

/// Cloneable control handle for the paired [`MockTransport`].
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Create a transport advertising `name`, with no responder scripted.
    pub fn new(name: &str) -> (Self, MockHandle) {
        let state = Arc::new(Mutex::new(MockState {
            advertised_name: name.to_string(),
            held: None,
            link_open: false,
            resolved: false,
            connect_failures: VecDeque::new(),
            link_failures: VecDeque::new(),
            connect_attempts: 0,
            writes: Vec::new(),
            responder: None,
            events: None,
        }));
        let handle = MockHandle {
            state: state.clone(),
        };
        (Self { state }, handle)
    }

    /// Create a transport whose scripted remote answers the handshake's
    /// transmission-size query with `mtu` and ignores everything else.
    pub fn with_mtu(name: &str, mtu: usize) -> (Self, MockHandle) {
        let (transport, handle) = Self::new(name);
        handle.respond_with(move |bytes| {
            if bytes == MTU_QUERY_COMMAND.as_bytes() {
                vec![Bytes::from(mtu.to_string())]
            } else {
                Vec::new()
            }
        });
        (transport, handle)
    }
}

impl MockHandle {
    /// Install or replace the scripted responder.
    ///
    /// The responder sees every outbound write (control bytes included)
    /// and returns the notifications the fake remote emits in reply.
    pub fn respond_with(&self, responder: impl FnMut(&[u8]) -> Vec<Bytes> + Send + 'static) {
        self.state.lock().unwrap().responder = Some(Box::new(responder));
    }

    /// Queue an error for the next `connect` call.
    pub fn fail_next_connect(&self, err: LinkError) {
        self.state.lock().unwrap().connect_failures.push_back(err);
    }

    /// Queue an error for the next `open_link` call.
    pub fn fail_next_open_link(&self, err: LinkError) {
        self.state.lock().unwrap().link_failures.push_back(err);
    }

    /// Every write issued so far, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().writes.clone()
    }

    /// Number of `connect` calls observed, failures included.
    pub fn connect_attempts(&self) -> usize {
        self.state.lock().unwrap().connect_attempts
    }

    /// Whether the transport currently holds a peripheral handle.
    pub fn holds_device(&self) -> bool {
        self.state.lock().unwrap().held.is_some()
    }

    /// Deliver an unsolicited notification, as the real remote would.
    pub async fn push_notification(&self, bytes: impl Into<Bytes>) {
        let sender = self.state.lock().unwrap().events.clone();
        if let Some(tx) = sender {
            let _ = tx.send(TransportEvent::Notification(bytes.into())).await;
        }
    }

    /// Drop the link from the remote side.
    pub async fn trigger_disconnect(&self) {
        let sender = {
            let mut state = self.state.lock().unwrap();
            state.link_open = false;
            state.resolved = false;
            state.events.take()
        };
        if let Some(tx) = sender {
            let _ = tx.send(TransportEvent::Disconnected).await;
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self, selector: &DeviceSelector) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.connect_attempts += 1;
        if let Some(err) = state.connect_failures.pop_front() {
            return Err(err);
        }
        let matched = match selector {
            DeviceSelector::Name(name) => *name == state.advertised_name,
            DeviceSelector::NamePrefix(prefix) => state.advertised_name.starts_with(prefix.as_str()),
            DeviceSelector::ServiceOnly => true,
        };
        if !matched {
            return Err(LinkError::SelectionFailed(format!(
                "no peripheral matching {selector:?}"
            )));
        }
        state.held = Some(state.advertised_name.clone());
        Ok(state.advertised_name.clone())
    }

    fn held_device(&self) -> Option<String> {
        self.state.lock().unwrap().held.clone()
    }

    fn forget_device(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.held = None;
        state.link_open = false;
        state.resolved = false;
        state.events = None;
    }

    async fn open_link(&mut self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.held.is_none() {
            return Err(LinkError::Connection("no peripheral held".to_string()));
        }
        if let Some(err) = state.link_failures.pop_front() {
            return Err(err);
        }
        state.link_open = true;
        Ok(())
    }

    async fn resolve_characteristics(&mut self, _service: Uuid, _tx: Uuid, _rx: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.link_open {
            return Err(LinkError::Connection("GATT server is disconnected".to_string()));
        }
        state.resolved = true;
        Ok(())
    }

    async fn subscribe(&mut self) -> Result<mpsc::Receiver<TransportEvent>> {
        let mut state = self.state.lock().unwrap();
        if !state.resolved {
            return Err(LinkError::Connection(
                "characteristics not resolved".to_string(),
            ));
        }
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        state.events = Some(tx);
        Ok(rx)
    }

    async fn write_with_response(&mut self, bytes: &[u8]) -> Result<()> {
        let (replies, sender) = {
            let mut state = self.state.lock().unwrap();
            if !state.link_open {
                return Err(LinkError::Connection(
                    "GATT server is disconnected".to_string(),
                ));
            }
            state.writes.push(bytes.to_vec());
            let replies = match state.responder.as_mut() {
                Some(responder) => responder(bytes),
                None => Vec::new(),
            };
            (replies, state.events.clone())
        };
        if let Some(tx) = sender {
            for reply in replies {
                let _ = tx.send(TransportEvent::Notification(reply)).await;
            }
        }
        Ok(())
    }

    async fn release(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.link_open = false;
        state.resolved = false;
        state.events = None;
    }

    async fn disconnect(&mut self) {
        let sender = {
            let mut state = self.state.lock().unwrap();
            state.link_open = false;
            state.resolved = false;
            state.events.take()
        };
        if let Some(tx) = sender {
            let _ = tx.send(TransportEvent::Disconnected).await;
        }
    }
}
