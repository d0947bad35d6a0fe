//! Session facade: lifecycle, command primitives, and bulk transfer.
//!
//! A [`Session`] owns one [`Transport`] and drives the full lifecycle:
//!
//! 1. `open()` runs the bounded retry loop: device selection, GATT setup,
//!    notification subscription, break signal, transmission-size handshake.
//! 2. Command primitives ([`execute`](Session::execute),
//!    [`send_payload`](Session::send_payload), break/reset signals) move
//!    single writes under the negotiated ceiling.
//! 3. Bulk transfer ([`send_large_payload`](Session::send_large_payload),
//!    [`write_remote_file`](Session::write_remote_file)) layers the chunking
//!    protocols on top.
//!
//! Inbound notifications are pumped by a spawned task into the
//! [`ResponseCorrelator`]; awaited calls suspend until their response
//! arrives, the deadline elapses, or the link drops.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{LinkState, RetryPolicy};
use crate::correlator::ResponseCorrelator;
use crate::error::{LinkError, Result};
use crate::protocol::{
    chunked, escape, framed_chunks, FrameCaps, BINARY_TAG, BREAK_SIGNAL, DEFAULT_MAX_PAYLOAD,
    FILE_CLOSE_COMMAND, FILE_OPEN_PREFIX, FILE_OPEN_SUFFIX, FILE_WRITE_OVERHEAD,
    FILE_WRITE_PREFIX, FILE_WRITE_SUFFIX, MTU_QUERY_COMMAND, REMOTE_OK, RESET_SIGNAL,
};
use crate::transport::{
    DeviceSelector, Transport, TransportEvent, RX_CHARACTERISTIC_UUID, SERVICE_UUID,
    TX_CHARACTERISTIC_UUID,
};

/// Default deadline for awaited responses.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Empirical delay after break/reset giving the remote interpreter time to
/// reach steady state. Not a protocol acknowledgment.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(200);

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Connection retry policy.
    pub retry: RetryPolicy,
    /// Deadline for awaited responses (handshake and file operations).
    pub response_timeout: Duration,
    /// Settle delay after break/reset signals.
    pub settle_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

type DisconnectObserver = Arc<dyn Fn() + Send + Sync>;

/// State shared between the session and its notification pump.
struct Shared {
    correlator: ResponseCorrelator,
    state: Mutex<LinkState>,
    max_payload: AtomicUsize,
    on_disconnect: Mutex<Option<DisconnectObserver>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            correlator: ResponseCorrelator::new(),
            state: Mutex::new(LinkState::Idle),
            max_payload: AtomicUsize::new(DEFAULT_MAX_PAYLOAD),
            on_disconnect: Mutex::new(None),
        }
    }

    /// Single disconnect path: identical for requested and external drops.
    ///
    /// During `Connecting` the open loop owns cleanup; only pending waiters
    /// are failed so the handshake does not hang on a dead link.
    fn handle_disconnect(&self) {
        let established = {
            let mut state = self.state.lock().unwrap();
            match *state {
                LinkState::Ready | LinkState::Disconnecting => {
                    *state = LinkState::Idle;
                    true
                }
                LinkState::Connecting => false,
                LinkState::Idle => return,
            }
        };
        if !established {
            // the open loop owns cleanup while connecting; just unblock
            // whatever is awaiting the dead link
            self.correlator.fail_pending();
            return;
        }

        info!("link disconnected");
        self.max_payload
            .store(DEFAULT_MAX_PAYLOAD, Ordering::Release);
        self.correlator.fail_pending();

        // invoked outside the lock so an observer may re-register
        let observer = self.on_disconnect.lock().unwrap().clone();
        if let Some(cb) = observer {
            if catch_unwind(AssertUnwindSafe(|| cb())).is_err() {
                tracing::error!("disconnect observer panicked");
            }
        }
    }
}

/// One session per physical connection attempt sequence.
pub struct Session<T: Transport> {
    transport: T,
    shared: Arc<Shared>,
    config: SessionConfig,
    pump: Option<JoinHandle<()>>,
}

impl<T: Transport> Session<T> {
    /// Create a session over the given transport with default settings.
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, SessionConfig::default())
    }

    /// Create a session with explicit configuration.
    pub fn with_config(transport: T, config: SessionConfig) -> Self {
        Self {
            transport,
            shared: Arc::new(Shared::new()),
            config,
            pump: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LinkState {
        *self.shared.state.lock().unwrap()
    }

    /// Negotiated maximum payload size in bytes.
    ///
    /// Holds the placeholder default until `open()` completes a handshake.
    pub fn max_payload(&self) -> usize {
        self.shared.max_payload.load(Ordering::Acquire)
    }

    /// Register or replace the text-response observer.
    pub fn set_text_observer(&self, observer: impl Fn(&str) + Send + Sync + 'static) {
        self.shared.correlator.set_text_observer(observer);
    }

    /// Register or replace the binary-response observer.
    pub fn set_binary_observer(&self, observer: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.shared.correlator.set_binary_observer(observer);
    }

    /// Register or replace the disconnect observer.
    ///
    /// Fires on every Ready → Idle transition, requested or external.
    pub fn set_disconnect_observer(&self, observer: impl Fn() + Send + Sync + 'static) {
        *self.shared.on_disconnect.lock().unwrap() = Some(Arc::new(observer));
    }

    /// Connect, subscribe and handshake, retrying transient link failures.
    ///
    /// Returns the identifier of the connected device. On final failure the
    /// session is back in the pre-connect state: no held peripheral, so a
    /// subsequent `open()` re-runs device selection.
    pub async fn open(&mut self, selector: &DeviceSelector) -> Result<String> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if *state != LinkState::Idle {
                return Err(LinkError::Connection("session is already open".to_string()));
            }
            *state = LinkState::Connecting;
        }

        let attempts = self.config.retry.attempts.max(1);
        let mut attempt = 1u32;
        loop {
            match self.try_open(selector).await {
                Ok(device) => {
                    *self.shared.state.lock().unwrap() = LinkState::Ready;
                    info!(device = %device, max_payload = self.max_payload(), "session ready");
                    return Ok(device);
                }
                Err(err) => {
                    self.teardown_attempt().await;
                    if err.is_retryable() && attempt < attempts {
                        warn!(attempt, error = %err, "connection attempt failed, retrying");
                        tokio::time::sleep(self.config.retry.delay).await;
                        attempt += 1;
                        continue;
                    }
                    self.transport.forget_device();
                    *self.shared.state.lock().unwrap() = LinkState::Idle;
                    return Err(err);
                }
            }
        }
    }

    /// One connection attempt: the five setup steps, in order.
    async fn try_open(&mut self, selector: &DeviceSelector) -> Result<String> {
        // 1. resolve peripheral (reuse the held handle on reconnect)
        let device = match self.transport.held_device() {
            Some(id) => id,
            None => self.transport.connect(selector).await?,
        };
        debug!(device = %device, "peripheral resolved");

        // 2-3. GATT link, characteristics, notification subscription
        self.transport.open_link().await?;
        self.transport
            .resolve_characteristics(SERVICE_UUID, TX_CHARACTERISTIC_UUID, RX_CHARACTERISTIC_UUID)
            .await?;
        let events = self.transport.subscribe().await?;
        self.pump = Some(spawn_pump(self.shared.clone(), events));

        // 4. force the interpreter into a known idle state
        self.send_break().await?;

        // 5. negotiate the transmission ceiling
        let reply = self
            .request_text(MTU_QUERY_COMMAND, self.config.response_timeout)
            .await?;
        let max: usize = reply.trim().parse().map_err(|_| {
            LinkError::Protocol(format!("invalid transmission size response: {reply:?}"))
        })?;
        if max == 0 {
            return Err(LinkError::Protocol(
                "remote reported a zero transmission size".to_string(),
            ));
        }
        self.shared.max_payload.store(max, Ordering::Release);
        debug!(max_payload = max, "transmission ceiling negotiated");

        Ok(device)
    }

    /// Restore the clean precondition between attempts: no pump, no
    /// subscription, no link, no stranded waiters. Keeps the peripheral.
    async fn teardown_attempt(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.transport.release().await;
        self.shared.correlator.fail_pending();
        self.shared
            .max_payload
            .store(DEFAULT_MAX_PAYLOAD, Ordering::Release);
    }

    /// Request disconnection if a link is active.
    ///
    /// State clearing and the disconnect observer both run on the single
    /// disconnect path driven by the notification pump, so a requested
    /// close and an external drop behave identically.
    pub async fn close(&mut self) {
        let requested = {
            let mut state = self.shared.state.lock().unwrap();
            if *state == LinkState::Ready {
                *state = LinkState::Disconnecting;
                true
            } else {
                false
            }
        };
        if requested {
            self.transport.disconnect().await;
        }
    }

    /// Execute a command and await its text response.
    pub async fn execute(&mut self, command: &str, deadline: Duration) -> Result<String> {
        self.ensure_ready()?;
        self.check_command_size(command)?;
        self.request_text(command, deadline).await
    }

    /// Send a command without awaiting any response.
    pub async fn execute_unawaited(&mut self, command: &str) -> Result<()> {
        self.ensure_ready()?;
        self.check_command_size(command)?;
        self.transport.write_with_response(command.as_bytes()).await
    }

    /// Send a binary payload and await the binary response.
    ///
    /// The payload is prefixed with the binary type tag, which consumes one
    /// byte of the per-write ceiling.
    pub async fn send_payload(&mut self, payload: &[u8], deadline: Duration) -> Result<Bytes> {
        self.ensure_ready()?;
        self.write_binary_awaited(payload, deadline).await
    }

    /// Send a binary payload without awaiting a response.
    pub async fn send_payload_unawaited(&mut self, payload: &[u8]) -> Result<()> {
        self.ensure_ready()?;
        let frame = self.tagged_frame(payload)?;
        self.transport.write_with_response(&frame).await
    }

    /// Send a logical payload of up to 65535 bytes as framed chunks.
    ///
    /// Strictly sequential: each chunk's binary acknowledgment is awaited
    /// before the next chunk goes out, which is what gives reassembly its
    /// ordering guarantee absent an explicit sequence number.
    pub async fn send_large_payload(
        &mut self,
        code: u8,
        payload: &[u8],
        deadline: Duration,
    ) -> Result<()> {
        self.ensure_ready()?;
        let caps = FrameCaps::from_max_payload(self.max_payload())?;
        let chunks = framed_chunks(code, payload, &caps)?;
        debug!(code, total = payload.len(), chunks = chunks.len(), "sending framed payload");
        for chunk in &chunks {
            self.write_binary_awaited(chunk, deadline).await?;
        }
        Ok(())
    }

    /// Interrupt whatever the remote interpreter is running.
    ///
    /// Unawaited; followed by the settle delay.
    pub async fn send_break(&mut self) -> Result<()> {
        self.transport.write_with_response(&[BREAK_SIGNAL]).await?;
        tokio::time::sleep(self.config.settle_delay).await;
        Ok(())
    }

    /// Reset the remote interpreter state.
    ///
    /// Unawaited; followed by the settle delay.
    pub async fn send_reset(&mut self) -> Result<()> {
        self.transport.write_with_response(&[RESET_SIGNAL]).await?;
        tokio::time::sleep(self.config.settle_delay).await;
        Ok(())
    }

    /// Write `content` to a file on the remote device.
    ///
    /// Opens a remote handle, streams escaped chunks through the fixed
    /// append command, then closes the handle. The close runs even when a
    /// write fails mid-stream.
    pub async fn write_remote_file(&mut self, content: &str, path: &str) -> Result<()> {
        self.ensure_ready()?;

        let open_cmd = format!("{FILE_OPEN_PREFIX}{path}{FILE_OPEN_SUFFIX}");
        self.check_command_size(&open_cmd)?;
        let reply = self
            .request_text(&open_cmd, self.config.response_timeout)
            .await?;
        if reply.trim_end() != REMOTE_OK {
            return Err(LinkError::RemoteWrite(format!(
                "remote failed to open {path:?}"
            )));
        }

        let escaped = escape(content);
        let capacity = self.max_payload().saturating_sub(FILE_WRITE_OVERHEAD);
        let written = self.write_escaped_chunks(&escaped, capacity).await;

        // the handle is closed no matter how the writes went
        let closed = self.close_remote_file().await;
        written.and(closed)
    }

    async fn write_escaped_chunks(&mut self, escaped: &str, capacity: usize) -> Result<()> {
        let chunks = chunked(escaped, capacity)?;
        debug!(chunks = chunks.len(), bytes = escaped.len(), "writing file chunks");
        for chunk in chunks {
            let cmd = format!("{FILE_WRITE_PREFIX}{chunk}{FILE_WRITE_SUFFIX}");
            let reply = self
                .request_text(&cmd, self.config.response_timeout)
                .await?;
            if reply.trim_end() != REMOTE_OK {
                return Err(LinkError::RemoteWrite(format!(
                    "remote rejected a {} byte chunk",
                    chunk.len()
                )));
            }
        }
        Ok(())
    }

    async fn close_remote_file(&mut self) -> Result<()> {
        let reply = self
            .request_text(FILE_CLOSE_COMMAND, self.config.response_timeout)
            .await?;
        if reply.trim_end() != REMOTE_OK {
            return Err(LinkError::RemoteWrite(
                "remote failed to close the file handle".to_string(),
            ));
        }
        Ok(())
    }

    /// Write a command and await its text response. The waiter is claimed
    /// before the write so a fast response cannot race past it.
    async fn request_text(&mut self, command: &str, deadline: Duration) -> Result<String> {
        let rx = self.shared.correlator.claim_text()?;
        if let Err(err) = self.transport.write_with_response(command.as_bytes()).await {
            self.shared.correlator.cancel_text();
            return Err(err);
        }
        self.shared.correlator.wait_text(rx, deadline).await
    }

    /// Write a tagged binary frame and await its acknowledgment.
    async fn write_binary_awaited(&mut self, payload: &[u8], deadline: Duration) -> Result<Bytes> {
        let frame = self.tagged_frame(payload)?;
        let rx = self.shared.correlator.claim_binary()?;
        if let Err(err) = self.transport.write_with_response(&frame).await {
            self.shared.correlator.cancel_binary();
            return Err(err);
        }
        self.shared.correlator.wait_binary(rx, deadline).await
    }

    fn tagged_frame(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let ceiling = self.max_payload().saturating_sub(1);
        if payload.len() > ceiling {
            return Err(LinkError::PayloadTooLarge {
                size: payload.len(),
                max: ceiling,
            });
        }
        let mut frame = Vec::with_capacity(1 + payload.len());
        frame.push(BINARY_TAG);
        frame.extend_from_slice(payload);
        Ok(frame)
    }

    fn check_command_size(&self, command: &str) -> Result<()> {
        let max = self.max_payload();
        if command.len() > max {
            return Err(LinkError::PayloadTooLarge {
                size: command.len(),
                max,
            });
        }
        Ok(())
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.state().is_ready() {
            Ok(())
        } else {
            Err(LinkError::Connection("no active link".to_string()))
        }
    }
}

/// Pump transport events into the correlator until the stream ends.
fn spawn_pump(shared: Arc<Shared>, mut events: mpsc::Receiver<TransportEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Notification(bytes) => shared.correlator.handle_inbound(bytes),
                TransportEvent::Disconnected => break,
            }
        }
        // a closed stream without an explicit event is still a disconnect
        shared.handle_disconnect();
    })
}
