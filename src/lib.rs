//! # lualink
//!
//! Client session library for BLE devices running a Lua interpreter.
//!
//! BLE notification/write characteristics offer only unordered, size-limited,
//! fire-and-forget delivery. This crate layers a usable session on top of a
//! single pair of characteristics:
//!
//! - **Response correlation**: two logical response channels (text and
//!   binary) multiplexed over one notification stream by a leading type tag.
//! - **Connection lifecycle**: device selection, GATT setup, post-connect
//!   handshake, and a bounded retry loop for transient link failures.
//! - **Framing**: chunked transfer for payloads larger than the negotiated
//!   transmission ceiling, and escape-safe chunking for file uploads.
//!
//! ## Example
//!
//! ```ignore
//! use lualink::{DeviceSelector, Session};
//! use lualink::transport::MockTransport;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> lualink::Result<()> {
//!     let (transport, _handle) = MockTransport::with_mtu("hub-01", 128);
//!     let mut session = Session::new(transport);
//!     session.open(&DeviceSelector::NamePrefix("hub".into())).await?;
//!     let reply = session.execute("print('hi')", Duration::from_secs(5)).await?;
//!     println!("{reply}");
//!     session.close().await;
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod correlator;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transport;

pub use connection::{LinkState, RetryPolicy};
pub use correlator::{Channel, ResponseCorrelator};
pub use error::{LinkError, Result};
pub use session::{Session, SessionConfig};
pub use transport::{DeviceSelector, Transport, TransportEvent};
