//! Response correlation over the single notification stream.
//!
//! The remote multiplexes two logical response channels over one inbound
//! characteristic, distinguished by the leading type tag:
//!
//! ```text
//!                      ┌─► tag == 0x01 ─► binary channel (tag stripped)
//! notification bytes ──┤
//!                      └─► anything else ─► text channel (whole buffer,
//!                                           decoded as UTF-8)
//! ```
//!
//! Each channel has a single-slot pending waiter and an optional observer.
//! A matching inbound message resolves the waiter (if any) *and* invokes
//! the observer; the two are independent. A second awaited request on a
//! busy channel is rejected with `ChannelBusy` rather than silently
//! replacing the first waiter.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::error::{LinkError, Result};
use crate::protocol::BINARY_TAG;

/// The two logical response channels multiplexed over one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// UTF-8 interpreter output.
    Text,
    /// Tag-prefixed binary data responses.
    Binary,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Text => f.write_str("text"),
            Channel::Binary => f.write_str("binary"),
        }
    }
}

type TextObserver = Arc<dyn Fn(&str) + Send + Sync>;
type BinaryObserver = Arc<dyn Fn(&[u8]) + Send + Sync>;

#[derive(Default)]
struct Waiters {
    text: Option<oneshot::Sender<String>>,
    binary: Option<oneshot::Sender<Bytes>>,
}

#[derive(Default)]
struct Observers {
    text: Option<TextObserver>,
    binary: Option<BinaryObserver>,
}

/// Demultiplexes inbound notifications and resolves pending waiters.
///
/// Safe to drive from the notification pump while awaited calls run on
/// other tasks; the waiter slots are mutex-protected and resolution is
/// exactly-once per issued waiter.
#[derive(Default)]
pub struct ResponseCorrelator {
    waiters: Mutex<Waiters>,
    observers: Mutex<Observers>,
}

impl ResponseCorrelator {
    /// Create a correlator with no waiters and no observers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify and dispatch one inbound notification.
    ///
    /// Empty notifications are dropped. Never blocks and never panics, so
    /// it is safe to call from the transport's delivery context.
    pub fn handle_inbound(&self, raw: Bytes) {
        if raw.is_empty() {
            tracing::trace!("dropping empty notification");
            return;
        }

        if raw[0] == BINARY_TAG {
            let payload = raw.slice(1..);
            tracing::trace!(len = payload.len(), "binary response");
            let waiter = self.waiters.lock().unwrap().binary.take();
            if let Some(tx) = waiter {
                let _ = tx.send(payload.clone());
            }
            // invoked outside the lock so an observer may re-register
            let observer = self.observers.lock().unwrap().binary.clone();
            if let Some(cb) = observer {
                if catch_unwind(AssertUnwindSafe(|| cb(&payload))).is_err() {
                    tracing::error!("binary observer panicked");
                }
            }
        } else {
            // the tag byte is part of the text; only binary is tag-prefixed
            let text = String::from_utf8_lossy(&raw).into_owned();
            tracing::trace!(len = text.len(), "text response");
            let waiter = self.waiters.lock().unwrap().text.take();
            if let Some(tx) = waiter {
                let _ = tx.send(text.clone());
            }
            let observer = self.observers.lock().unwrap().text.clone();
            if let Some(cb) = observer {
                if catch_unwind(AssertUnwindSafe(|| cb(&text))).is_err() {
                    tracing::error!("text observer panicked");
                }
            }
        }
    }

    /// Claim the text waiter slot.
    ///
    /// Claim before writing the request so a fast response cannot slip past
    /// the waiter. Release with [`cancel_text`](Self::cancel_text) if the
    /// write fails.
    pub fn claim_text(&self) -> Result<oneshot::Receiver<String>> {
        let mut waiters = self.waiters.lock().unwrap();
        if waiters.text.is_some() {
            return Err(LinkError::ChannelBusy(Channel::Text));
        }
        let (tx, rx) = oneshot::channel();
        waiters.text = Some(tx);
        Ok(rx)
    }

    /// Claim the binary waiter slot. See [`claim_text`](Self::claim_text).
    pub fn claim_binary(&self) -> Result<oneshot::Receiver<Bytes>> {
        let mut waiters = self.waiters.lock().unwrap();
        if waiters.binary.is_some() {
            return Err(LinkError::ChannelBusy(Channel::Binary));
        }
        let (tx, rx) = oneshot::channel();
        waiters.binary = Some(tx);
        Ok(rx)
    }

    /// Release a claimed but unused text slot.
    pub fn cancel_text(&self) {
        self.waiters.lock().unwrap().text.take();
    }

    /// Release a claimed but unused binary slot.
    pub fn cancel_binary(&self) {
        self.waiters.lock().unwrap().binary.take();
    }

    /// Await a claimed text response with a deadline.
    ///
    /// On expiry the slot is cleared under the lock, so either the timeout
    /// wins and a late message goes only to the observer, or the message
    /// wins and the timer is a no-op, never both.
    pub async fn wait_text(&self, mut rx: oneshot::Receiver<String>, deadline: Duration) -> Result<String> {
        match timeout(deadline, &mut rx).await {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(_)) => Err(LinkError::Disconnected),
            Err(_) => {
                let cleared = self.waiters.lock().unwrap().text.take().is_some();
                if cleared {
                    Err(LinkError::Timeout)
                } else {
                    // resolved between expiry and cleanup; take the value
                    rx.try_recv().map_err(|_| LinkError::Timeout)
                }
            }
        }
    }

    /// Await a claimed binary response. See [`wait_text`](Self::wait_text).
    pub async fn wait_binary(&self, mut rx: oneshot::Receiver<Bytes>, deadline: Duration) -> Result<Bytes> {
        match timeout(deadline, &mut rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(LinkError::Disconnected),
            Err(_) => {
                let cleared = self.waiters.lock().unwrap().binary.take().is_some();
                if cleared {
                    Err(LinkError::Timeout)
                } else {
                    rx.try_recv().map_err(|_| LinkError::Timeout)
                }
            }
        }
    }

    /// Claim and await a text response in one call.
    pub async fn await_text(&self, deadline: Duration) -> Result<String> {
        let rx = self.claim_text()?;
        self.wait_text(rx, deadline).await
    }

    /// Claim and await a binary response in one call.
    pub async fn await_binary(&self, deadline: Duration) -> Result<Bytes> {
        let rx = self.claim_binary()?;
        self.wait_binary(rx, deadline).await
    }

    /// Fail both pending waiters, if any. Called on disconnect so awaited
    /// calls resolve with `Disconnected` instead of hanging.
    pub fn fail_pending(&self) {
        let mut waiters = self.waiters.lock().unwrap();
        if waiters.text.take().is_some() {
            tracing::debug!("failing pending text waiter");
        }
        if waiters.binary.take().is_some() {
            tracing::debug!("failing pending binary waiter");
        }
        // dropped senders resolve the receivers with a closed-channel error
    }

    /// Register or replace the text-response observer.
    ///
    /// Safe to call from inside a running observer; the replacement takes
    /// effect from the next notification.
    pub fn set_text_observer(&self, observer: impl Fn(&str) + Send + Sync + 'static) {
        self.observers.lock().unwrap().text = Some(Arc::new(observer));
    }

    /// Register or replace the binary-response observer.
    pub fn set_binary_observer(&self, observer: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.observers.lock().unwrap().binary = Some(Arc::new(observer));
    }
}
