//! The binary wire format spoken between clients and the server.
//!
//! Every message is a 1-byte type discriminant followed by its fields,
//! concatenated with no padding or delimiter. Integers are big-endian;
//! strings are a 1-byte length prefix followed by that many raw bytes.
//!
//! Client-to-server messages are [`ClientMessage`]s, decoded incrementally
//! from the connection's receive buffer; server-to-client messages are
//! [`ServerMessage`]s. A type discriminant the client is not allowed to
//! send - including the server-to-client ones - is a protocol error.

use bytes::{Buf, BufMut, Bytes, BytesMut};

const TYPE_ERROR: u8 = 0x10;
const TYPE_PLATE: u8 = 0x20;
const TYPE_TICKET: u8 = 0x21;
const TYPE_WANT_HEARTBEAT: u8 = 0x40;
const TYPE_HEARTBEAT: u8 = 0x41;
const TYPE_I_AM_CAMERA: u8 = 0x80;
const TYPE_I_AM_DISPATCHER: u8 = 0x81;

/// A message sent by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// A camera observed a number plate.
    Plate {
        /// Observed plate, at most 255 bytes.
        plate: Bytes,
        /// Observation time, in seconds.
        timestamp: u32,
    },
    /// The client wants a heartbeat every `interval` deciseconds.
    WantHeartbeat {
        /// Interval in deciseconds; 0 disables heartbeats.
        interval: u32,
    },
    /// The client identifies as a camera.
    IAmCamera {
        /// Road the camera is on.
        road: u16,
        /// Mile marker of the camera.
        mile: u16,
        /// Speed limit of the road, in miles per hour.
        limit: u16,
    },
    /// The client identifies as a ticket dispatcher.
    IAmDispatcher {
        /// Roads this dispatcher is responsible for.
        roads: Vec<u16>,
    },
}

/// A message sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// The client broke the protocol; the connection closes after this.
    Error {
        /// Human-readable reason.
        msg: String,
    },
    /// A speeding ticket, sent to a dispatcher.
    Ticket(Ticket),
    /// Periodic liveness signal, sent on request.
    Heartbeat,
}

/// A speeding ticket for one plate over one observation pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    /// Ticketed plate.
    pub plate: Bytes,
    /// Road both observations were made on.
    pub road: u16,
    /// Mile marker of the earlier observation.
    pub mile1: u16,
    /// Timestamp of the earlier observation.
    pub timestamp1: u32,
    /// Mile marker of the later observation.
    pub mile2: u16,
    /// Timestamp of the later observation.
    pub timestamp2: u32,
    /// Average speed, in hundredths of a mile per hour.
    pub speed: u16,
}

/// Error when decoding a [`ClientMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The type discriminant is not one a client may send.
    #[error("unknown message type 0x{0:02x}")]
    UnknownType(u8),
}

impl ClientMessage {
    /// Decodes a single message from the front of `src`, consuming its
    /// bytes.
    ///
    /// Returns `Ok(None)` if `src` does not yet hold a complete message;
    /// nothing is consumed in that case.
    ///
    /// # Errors
    ///
    /// Errors if the type discriminant is not a client-to-server message.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, DecodeError> {
        let mut reader = Reader {
            buf: &src[..],
            at: 0,
        };
        match read_message(&mut reader) {
            Ok(msg) => {
                let used = reader.at;
                src.advance(used);
                Ok(Some(msg))
            }
            Err(ReadError::Incomplete) => Ok(None),
            Err(ReadError::UnknownType(ty)) => Err(DecodeError::UnknownType(ty)),
        }
    }
}

impl ServerMessage {
    /// Encodes this message, appending to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Self::Error { msg } => {
                dst.put_u8(TYPE_ERROR);
                put_str(dst, msg.as_bytes());
            }
            Self::Ticket(ticket) => {
                dst.put_u8(TYPE_TICKET);
                put_str(dst, &ticket.plate);
                dst.put_u16(ticket.road);
                dst.put_u16(ticket.mile1);
                dst.put_u32(ticket.timestamp1);
                dst.put_u16(ticket.mile2);
                dst.put_u32(ticket.timestamp2);
                dst.put_u16(ticket.speed);
            }
            Self::Heartbeat => {
                dst.put_u8(TYPE_HEARTBEAT);
            }
        }
    }
}

/// Writes a length-prefixed string, truncating at 255 bytes.
fn put_str(dst: &mut BytesMut, s: &[u8]) {
    let len = s.len().min(u8::MAX as usize);
    #[allow(clippy::cast_possible_truncation)] // bounded just above
    dst.put_u8(len as u8);
    dst.put_slice(&s[..len]);
}

enum ReadError {
    Incomplete,
    UnknownType(u8),
}

/// Cursor over the receive buffer which never consumes until a whole
/// message has been read.
struct Reader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl Reader<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8], ReadError> {
        let end = self.at.checked_add(n).ok_or(ReadError::Incomplete)?;
        let bytes = self.buf.get(self.at..end).ok_or(ReadError::Incomplete)?;
        self.at = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, ReadError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ReadError> {
        let mut bytes = self.take(2)?;
        Ok(bytes.get_u16())
    }

    fn u32(&mut self) -> Result<u32, ReadError> {
        let mut bytes = self.take(4)?;
        Ok(bytes.get_u32())
    }

    fn str_(&mut self) -> Result<Bytes, ReadError> {
        let len = usize::from(self.u8()?);
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }
}

fn read_message(r: &mut Reader) -> Result<ClientMessage, ReadError> {
    match r.u8()? {
        TYPE_PLATE => Ok(ClientMessage::Plate {
            plate: r.str_()?,
            timestamp: r.u32()?,
        }),
        TYPE_WANT_HEARTBEAT => Ok(ClientMessage::WantHeartbeat {
            interval: r.u32()?,
        }),
        TYPE_I_AM_CAMERA => Ok(ClientMessage::IAmCamera {
            road: r.u16()?,
            mile: r.u16()?,
            limit: r.u16()?,
        }),
        TYPE_I_AM_DISPATCHER => {
            let num_roads = usize::from(r.u8()?);
            let mut roads = Vec::with_capacity(num_roads);
            for _ in 0..num_roads {
                roads.push(r.u16()?);
            }
            Ok(ClientMessage::IAmDispatcher { roads })
        }
        other => Err(ReadError::UnknownType(other)),
    }
}
