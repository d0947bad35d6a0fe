//! Wire protocol constants and payload framing.
//!
//! Everything on the wire is one of three shapes:
//!
//! - a raw command string for the remote Lua interpreter,
//! - a single control byte ([`BREAK_SIGNAL`] or [`RESET_SIGNAL`]),
//! - a binary message: [`BINARY_TAG`] ‖ optional framing header ‖ payload.
//!
//! Inbound notifications are classified by their first byte: [`BINARY_TAG`]
//! marks a binary response (remainder is the payload); anything else is a
//! UTF-8 text response, delivered whole.

pub mod escape;
pub mod framing;

pub use escape::{chunked, escape};
pub use framing::{framed_chunks, FrameAssembler, FrameCaps};

/// Leading byte marking a binary message in either direction.
pub const BINARY_TAG: u8 = 0x01;

/// Control byte interrupting whatever the remote interpreter is running.
pub const BREAK_SIGNAL: u8 = 0x03;

/// Control byte resetting the remote interpreter state.
pub const RESET_SIGNAL: u8 = 0x04;

/// Placeholder transmission ceiling until the handshake negotiates one.
pub const DEFAULT_MAX_PAYLOAD: usize = 60;

/// Largest logical payload the framing protocol can carry (u16 size header).
pub const MAX_FRAMED_PAYLOAD: usize = 65535;

/// Handshake command querying the remote's maximum transmission length.
///
/// The remote replies with a decimal integer on the text channel.
pub const MTU_QUERY_COMMAND: &str = "print(ble.mtu())";

/// Remote success sentinel. File operations print exactly this on success;
/// anything else is a failure, never inferred from absence of an error.
pub const REMOTE_OK: &str = "1";

/// Opens the remote file handle for writing: prefix ‖ path ‖ suffix.
pub const FILE_OPEN_PREFIX: &str = "_f=io.open('";
/// See [`FILE_OPEN_PREFIX`].
pub const FILE_OPEN_SUFFIX: &str = "','wb') print(_f and 1 or 0)";

/// Appends one escaped chunk to the open handle: prefix ‖ chunk ‖ suffix.
pub const FILE_WRITE_PREFIX: &str = "print(_f:write('";
/// See [`FILE_WRITE_PREFIX`].
pub const FILE_WRITE_SUFFIX: &str = "') and 1 or 0)";

/// Closes the remote file handle. Safe to send even if the open failed.
pub const FILE_CLOSE_COMMAND: &str = "print(_f and _f:close() and 1 or 0) _f=nil";

/// Fixed wrapper cost of one file-write command, in bytes.
pub const FILE_WRITE_OVERHEAD: usize = FILE_WRITE_PREFIX.len() + FILE_WRITE_SUFFIX.len();
