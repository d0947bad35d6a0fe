//! Control-message framing for payloads larger than one write.
//!
//! A logical payload of up to 65535 bytes is split into wire chunks:
//!
//! ```text
//! first chunk       [ code │ size hi │ size lo │ payload slice ]
//! every other chunk [ code │ payload slice ]
//! ```
//!
//! The protocol carries no chunk index. Ordering is guaranteed by the
//! sender: every chunk goes out over write-with-response and its binary
//! acknowledgment is awaited before the next chunk is issued. The receiver
//! reassembles strictly sequentially ([`FrameAssembler`]).

use crate::error::{LinkError, Result};

use super::MAX_FRAMED_PAYLOAD;

/// Per-chunk payload capacities derived from the transmission ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCaps {
    /// Payload bytes the first chunk can carry (after code + size header).
    pub first: usize,
    /// Payload bytes every subsequent chunk can carry (after code).
    pub rest: usize,
}

impl FrameCaps {
    /// Derive chunk capacities from the negotiated maximum payload size.
    ///
    /// The binary type tag consumes one byte of every write, the message
    /// code one more, and the first chunk additionally carries the two-byte
    /// total-size header.
    ///
    /// # Errors
    ///
    /// `Configuration` if the negotiated size leaves no room for payload
    /// bytes in either chunk shape.
    pub fn from_max_payload(max_payload: usize) -> Result<Self> {
        let binary_ceiling = max_payload.saturating_sub(1);
        if binary_ceiling <= 3 {
            return Err(LinkError::Configuration(format!(
                "transmission ceiling of {max_payload} bytes is too small for framed messages"
            )));
        }
        Ok(Self {
            first: binary_ceiling - 3,
            rest: binary_ceiling - 1,
        })
    }
}

/// Split a logical payload into framed wire chunks.
///
/// Chunks are greedy and maximal under `caps`. An empty payload still
/// produces the header-only first chunk so the receiver learns the total
/// size. The message code range is enforced by the `u8` parameter type.
///
/// # Errors
///
/// `InvalidArgument` if the payload exceeds [`MAX_FRAMED_PAYLOAD`].
pub fn framed_chunks(code: u8, payload: &[u8], caps: &FrameCaps) -> Result<Vec<Vec<u8>>> {
    if payload.len() > MAX_FRAMED_PAYLOAD {
        return Err(LinkError::InvalidArgument(format!(
            "framed payload of {} bytes exceeds the {MAX_FRAMED_PAYLOAD} byte limit",
            payload.len()
        )));
    }

    let total = payload.len() as u16;
    let first_len = payload.len().min(caps.first);

    let mut chunks = Vec::with_capacity(1 + payload.len().saturating_sub(first_len) / caps.rest.max(1));

    let mut chunk = Vec::with_capacity(3 + first_len);
    chunk.push(code);
    chunk.extend_from_slice(&total.to_be_bytes());
    chunk.extend_from_slice(&payload[..first_len]);
    chunks.push(chunk);

    let mut offset = first_len;
    while offset < payload.len() {
        let take = (payload.len() - offset).min(caps.rest);
        let mut chunk = Vec::with_capacity(1 + take);
        chunk.push(code);
        chunk.extend_from_slice(&payload[offset..offset + take]);
        chunks.push(chunk);
        offset += take;
    }

    Ok(chunks)
}

/// Sequential reassembler for the receiving side of the framing protocol.
///
/// Chunks must be pushed in delivery order. The assembler validates the
/// message code on every chunk and completes once the total announced by
/// the first chunk has been accumulated.
#[derive(Debug)]
pub struct FrameAssembler {
    code: u8,
    total: Option<usize>,
    buf: Vec<u8>,
}

impl FrameAssembler {
    /// Create an assembler expecting chunks with the given message code.
    pub fn new(code: u8) -> Self {
        Self {
            code,
            total: None,
            buf: Vec::new(),
        }
    }

    /// Feed the next wire chunk.
    ///
    /// Returns `Ok(Some(payload))` once the final chunk completes the
    /// message, `Ok(None)` while more chunks are expected.
    ///
    /// # Errors
    ///
    /// `Protocol` on an unexpected code, a short chunk, or more payload
    /// bytes than the announced total.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>> {
        let (code, body, total) = match self.total {
            None => {
                if chunk.len() < 3 {
                    return Err(LinkError::Protocol(format!(
                        "first framed chunk of {} bytes is missing its size header",
                        chunk.len()
                    )));
                }
                let total = u16::from_be_bytes([chunk[1], chunk[2]]) as usize;
                self.total = Some(total);
                self.buf.reserve(total);
                (chunk[0], &chunk[3..], total)
            }
            Some(total) => {
                if chunk.is_empty() {
                    return Err(LinkError::Protocol("empty framed chunk".to_string()));
                }
                (chunk[0], &chunk[1..], total)
            }
        };

        if code != self.code {
            return Err(LinkError::Protocol(format!(
                "framed chunk carries code {code}, expected {}",
                self.code
            )));
        }
        if self.buf.len() + body.len() > total {
            return Err(LinkError::Protocol(format!(
                "framed payload overruns its announced total of {total} bytes"
            )));
        }
        self.buf.extend_from_slice(body);

        if self.buf.len() == total {
            Ok(Some(std::mem::take(&mut self.buf)))
        } else {
            Ok(None)
        }
    }
}
