//! Parsing and encoding of the textual LRCP packet forms.
//!
//! Every packet is framed by `/` delimiters and carries a fixed number of
//! fields:
//!
//! ```text
//! /connect/SESSION/
//! /data/SESSION/POS/DATA/
//! /ack/SESSION/LENGTH/
//! /close/SESSION/
//! ```
//!
//! Numeric fields are non-negative decimal integers smaller than 2^31. The
//! DATA field is everything between the third and the final `/`, with `/`
//! and `\` escaped as described in [`escape`](crate::escape). Anything that
//! does not match one of the four forms exactly is dropped whole - LRCP
//! never replies to garbage.

use bytes::Bytes;

use crate::escape::{self, UnescapeError};

/// Largest datagram LRCP will parse or produce, in bytes.
pub const MAX_PACKET_LEN: usize = 1000;

/// Upper bound (exclusive) for session ids, positions and lengths.
pub const NUMERIC_LIMIT: u32 = 1 << 31;

/// A single parsed LRCP packet.
///
/// `payload` in [`Packet::Data`] is kept in wire form: escaped, but
/// validated against the escaping rules. Positions count wire-form bytes of
/// the receive stream; unescaping happens when the bytes are handed to the
/// application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Open (or re-confirm) a session.
    Connect {
        /// Session id.
        sid: u32,
    },
    /// Payload bytes starting at `pos` in the sender's stream.
    Data {
        /// Session id.
        sid: u32,
        /// Offset of the first payload byte in the sender's stream.
        pos: u32,
        /// Validated payload bytes, exactly as framed on the wire.
        payload: Bytes,
    },
    /// The sender has received `length` contiguous bytes.
    Ack {
        /// Session id.
        sid: u32,
        /// Total contiguous bytes received.
        length: u32,
    },
    /// Terminate a session.
    Close {
        /// Session id.
        sid: u32,
    },
}

/// Error when parsing a datagram as an LRCP packet.
///
/// All variants mean the same thing to the caller - drop the datagram - but
/// are distinguished for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Datagram is longer than [`MAX_PACKET_LEN`].
    #[error("datagram longer than {MAX_PACKET_LEN} bytes")]
    TooLong,
    /// Datagram does not start and end with `/`.
    #[error("missing `/` framing")]
    BadFraming,
    /// First field is not one of the four known packet kinds.
    #[error("unknown packet kind")]
    UnknownKind,
    /// Wrong number of fields for the packet kind.
    #[error("wrong field count")]
    FieldCount,
    /// A numeric field is empty, non-decimal, or at least 2^31.
    #[error("numeric field out of range")]
    BadNumber,
    /// The DATA payload violates the escaping rules.
    #[error("invalid payload escaping")]
    BadEscape(#[from] UnescapeError),
}

impl Packet {
    /// Session id this packet addresses.
    #[must_use]
    pub const fn sid(&self) -> u32 {
        match *self {
            Self::Connect { sid }
            | Self::Data { sid, .. }
            | Self::Ack { sid, .. }
            | Self::Close { sid } => sid,
        }
    }

    /// Parses a datagram as a packet.
    ///
    /// # Errors
    ///
    /// Errors if the datagram does not match one of the four packet forms
    /// exactly; see [`ParseError`].
    pub fn parse(datagram: &[u8]) -> Result<Self, ParseError> {
        if datagram.len() > MAX_PACKET_LEN {
            return Err(ParseError::TooLong);
        }
        let inner = datagram
            .strip_prefix(b"/")
            .and_then(|rest| rest.strip_suffix(b"/"))
            .ok_or(ParseError::BadFraming)?;

        let (kind, rest) = split_field(inner).ok_or(ParseError::BadFraming)?;
        if kind == b"connect" {
            Ok(Self::Connect {
                sid: parse_numeric_last(rest)?,
            })
        } else if kind == b"close" {
            Ok(Self::Close {
                sid: parse_numeric_last(rest)?,
            })
        } else if kind == b"ack" {
            let (sid, rest) = split_field(rest).ok_or(ParseError::FieldCount)?;
            Ok(Self::Ack {
                sid: parse_numeric(sid)?,
                length: parse_numeric_last(rest)?,
            })
        } else if kind == b"data" {
            let (sid, rest) = split_field(rest).ok_or(ParseError::FieldCount)?;
            let (pos, payload) = split_field(rest).ok_or(ParseError::FieldCount)?;
            escape::validate(payload)?;
            Ok(Self::Data {
                sid: parse_numeric(sid)?,
                pos: parse_numeric(pos)?,
                payload: Bytes::copy_from_slice(payload),
            })
        } else {
            Err(ParseError::UnknownKind)
        }
    }

    /// Encodes this packet into a fresh datagram.
    ///
    /// DATA payloads are written verbatim - the caller escapes them (see
    /// [`escape::escape_into`]) and keeps them small enough that the framed
    /// result stays within [`MAX_PACKET_LEN`]; see
    /// [`session::CHUNK_LEN`](crate::session::CHUNK_LEN).
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        match self {
            Self::Connect { sid } => {
                out.extend_from_slice(b"/connect/");
                push_numeric(&mut out, *sid);
                out.push(b'/');
            }
            Self::Data { sid, pos, payload } => {
                out.extend_from_slice(b"/data/");
                push_numeric(&mut out, *sid);
                out.push(b'/');
                push_numeric(&mut out, *pos);
                out.push(b'/');
                out.extend_from_slice(payload);
                out.push(b'/');
            }
            Self::Ack { sid, length } => {
                out.extend_from_slice(b"/ack/");
                push_numeric(&mut out, *sid);
                out.push(b'/');
                push_numeric(&mut out, *length);
                out.push(b'/');
            }
            Self::Close { sid } => {
                out.extend_from_slice(b"/close/");
                push_numeric(&mut out, *sid);
                out.push(b'/');
            }
        }
        debug_assert!(out.len() <= MAX_PACKET_LEN);
        out
    }
}

/// Splits `buf` at the first `/`, returning the field before it and the
/// remainder after it.
fn split_field(buf: &[u8]) -> Option<(&[u8], &[u8])> {
    let at = buf.iter().position(|&b| b == b'/')?;
    Some((&buf[..at], &buf[at + 1..]))
}

/// Parses a numeric field which must be the last field of the packet, i.e.
/// must not contain any further `/`.
fn parse_numeric_last(field: &[u8]) -> Result<u32, ParseError> {
    if field.contains(&b'/') {
        return Err(ParseError::FieldCount);
    }
    parse_numeric(field)
}

fn parse_numeric(field: &[u8]) -> Result<u32, ParseError> {
    if field.is_empty() {
        return Err(ParseError::BadNumber);
    }
    let mut value: u64 = 0;
    for &b in field {
        if !b.is_ascii_digit() {
            return Err(ParseError::BadNumber);
        }
        value = value * 10 + u64::from(b - b'0');
        if value >= u64::from(NUMERIC_LIMIT) {
            return Err(ParseError::BadNumber);
        }
    }
    #[allow(clippy::cast_possible_truncation)] // bounded by NUMERIC_LIMIT above
    Ok(value as u32)
}

fn push_numeric(out: &mut Vec<u8>, value: u32) {
    let mut digits = [0u8; 10];
    let mut at = digits.len();
    let mut rest = value;
    loop {
        at -= 1;
        digits[at] = b'0' + (rest % 10) as u8;
        rest /= 10;
        if rest == 0 {
            break;
        }
    }
    out.extend_from_slice(&digits[at..]);
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_connect() {
        assert_eq!(
            Packet::parse(b"/connect/12345/").unwrap(),
            Packet::Connect { sid: 12345 },
        );
    }

    #[test]
    fn parse_close() {
        assert_eq!(
            Packet::parse(b"/close/0/").unwrap(),
            Packet::Close { sid: 0 },
        );
    }

    #[test]
    fn parse_ack() {
        assert_eq!(
            Packet::parse(b"/ack/12345/6/").unwrap(),
            Packet::Ack {
                sid: 12345,
                length: 6,
            },
        );
    }

    #[test]
    fn parse_data() {
        assert_eq!(
            Packet::parse(b"/data/12345/0/hello\n/").unwrap(),
            Packet::Data {
                sid: 12345,
                pos: 0,
                payload: Bytes::from_static(b"hello\n"),
            },
        );
    }

    #[test]
    fn parse_data_keeps_wire_form() {
        assert_eq!(
            Packet::parse(b"/data/1/0/foo\\/bar\\\\baz\n/").unwrap(),
            Packet::Data {
                sid: 1,
                pos: 0,
                payload: Bytes::from_static(b"foo\\/bar\\\\baz\n"),
            },
        );
    }

    #[test]
    fn parse_data_empty_payload() {
        assert_eq!(
            Packet::parse(b"/data/1/0//").unwrap(),
            Packet::Data {
                sid: 1,
                pos: 0,
                payload: Bytes::new(),
            },
        );
    }

    #[test]
    fn parse_numeric_limits() {
        assert_eq!(
            Packet::parse(b"/ack/2147483647/0/").unwrap(),
            Packet::Ack {
                sid: 2_147_483_647,
                length: 0,
            },
        );
        assert_matches!(
            Packet::parse(b"/ack/2147483648/0/"),
            Err(ParseError::BadNumber)
        );
        assert_matches!(
            Packet::parse(b"/connect/99999999999999999999/"),
            Err(ParseError::BadNumber)
        );
    }

    #[test]
    fn parse_rejects_bad_framing() {
        assert_matches!(Packet::parse(b""), Err(ParseError::BadFraming));
        assert_matches!(Packet::parse(b"/"), Err(ParseError::BadFraming));
        assert_matches!(Packet::parse(b"connect/1/"), Err(ParseError::BadFraming));
        assert_matches!(Packet::parse(b"/connect/1"), Err(ParseError::BadFraming));
    }

    #[test]
    fn parse_rejects_unknown_kind() {
        assert_matches!(Packet::parse(b"/shutdown/1/"), Err(ParseError::UnknownKind));
    }

    #[test]
    fn parse_rejects_wrong_field_count() {
        assert_matches!(Packet::parse(b"/connect/1/2/"), Err(ParseError::FieldCount));
        assert_matches!(Packet::parse(b"/ack/1/"), Err(ParseError::FieldCount));
        assert_matches!(Packet::parse(b"/ack/1/2/3/"), Err(ParseError::FieldCount));
        assert_matches!(Packet::parse(b"/data/1/0/"), Err(ParseError::FieldCount));
    }

    #[test]
    fn parse_rejects_bad_numbers() {
        assert_matches!(Packet::parse(b"/connect//"), Err(ParseError::BadNumber));
        assert_matches!(Packet::parse(b"/connect/-1/"), Err(ParseError::BadNumber));
        assert_matches!(Packet::parse(b"/connect/12a/"), Err(ParseError::BadNumber));
    }

    #[test]
    fn parse_rejects_bad_escapes() {
        // unescaped `/` in the payload reads as an extra field
        assert_matches!(
            Packet::parse(b"/data/1/0/a/b/"),
            Err(ParseError::BadEscape(UnescapeError::BareSlash))
        );
        assert_matches!(
            Packet::parse(b"/data/1/0/a\\b/"),
            Err(ParseError::BadEscape(UnescapeError::BadEscape))
        );
        assert_matches!(
            Packet::parse(b"/data/1/0/a\\/"),
            Err(ParseError::BadEscape(UnescapeError::BadEscape))
        );
    }

    #[test]
    fn parse_rejects_oversized() {
        let mut big = Vec::from(&b"/data/1/0/"[..]);
        big.resize(MAX_PACKET_LEN, b'x');
        big.push(b'/');
        assert_matches!(Packet::parse(&big), Err(ParseError::TooLong));
    }

    #[test]
    fn parse_accepts_max_sized() {
        let mut max = Vec::from(&b"/data/1/0/"[..]);
        max.resize(MAX_PACKET_LEN - 1, b'x');
        max.push(b'/');
        assert_eq!(max.len(), MAX_PACKET_LEN);
        assert_matches!(Packet::parse(&max), Ok(Packet::Data { .. }));
    }

    #[test]
    fn encode_round_trip() {
        for packet in [
            Packet::Connect { sid: 12345 },
            Packet::Data {
                sid: 1,
                pos: 42,
                payload: Bytes::from_static(b"foo\\/bar\\\\baz\n"),
            },
            Packet::Ack {
                sid: 2_147_483_647,
                length: 17,
            },
            Packet::Close { sid: 0 },
        ] {
            assert_eq!(Packet::parse(&packet.encode()).unwrap(), packet);
        }
    }

    #[test]
    fn encode_writes_payload_verbatim() {
        let encoded = Packet::Data {
            sid: 1,
            pos: 0,
            payload: Bytes::from_static(b"zab\\\\rab\\/oof\n"),
        }
        .encode();
        assert_eq!(&encoded[..], b"/data/1/0/zab\\\\rab\\/oof\n/");
    }
}
