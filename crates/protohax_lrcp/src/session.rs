//! Per-session LRCP state machine.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::{Transmit, escape, reverse::LineReverser, wire::Packet};

/// How long a session waits for an ACK before retransmitting everything
/// past `send_acked`.
pub const RETRANSMIT_INTERVAL: Duration = Duration::from_secs(3);

/// How long a session may go without any inbound packet before it is
/// force-closed.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(60);

/// Largest raw payload carried by a single outgoing DATA packet.
///
/// Escaping can at most double the payload, and the frame around it
/// (`/data/SID/POS/../`) is at most 28 bytes, so a 400-byte chunk always
/// fits a framed packet inside [`MAX_PACKET_LEN`].
///
/// [`MAX_PACKET_LEN`]: crate::wire::MAX_PACKET_LEN
pub const CHUNK_LEN: usize = 400;

/// Whether a session is still usable after handling an event.
///
/// [`Closed`] means the session has emitted its final packets and must be
/// removed from the session table; it will never produce traffic again.
///
/// [`Closed`]: Status::Closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Session remains open.
    Open,
    /// Session is finished and must be dropped.
    Closed,
}

/// State for one LRCP session.
///
/// The session is sans-IO: every entry point takes the current [`Instant`]
/// and a transmit queue to push outgoing datagrams into. Time-driven
/// behavior (retransmission, expiry) is expressed as deadlines checked by
/// [`Session::poll_retransmit`] and [`Session::is_expired`], which the
/// owning endpoint calls from its sweep loop.
#[derive(Debug)]
pub struct Session {
    sid: u32,
    /// Datagram return address, fixed by the CONNECT that created us.
    peer: SocketAddr,
    /// Total contiguous wire-form bytes received from the peer and
    /// acknowledged. Non-decreasing.
    rcv_acked: usize,
    /// Every payload byte the application ever emitted, in transmit order.
    /// Append-only; `send_buf.len()` is the send stream length.
    send_buf: Vec<u8>,
    /// Highest LENGTH the peer has acknowledged. At most `send_buf.len()`.
    send_acked: usize,
    /// Line reverser, carrying incomplete line bytes between DATA events.
    app: LineReverser,
    /// Time of the most recent inbound packet for this session.
    last_activity: Instant,
    /// When to retransmit `send_buf[send_acked..]` next.
    ///
    /// `Some` exactly while unacknowledged send data exists. Re-armed on
    /// every retransmission, and reset whenever an ACK advances
    /// `send_acked`.
    retransmit_at: Option<Instant>,
}

impl Session {
    /// Creates the session opened by a CONNECT from `peer`.
    #[must_use]
    pub fn new(sid: u32, peer: SocketAddr, now: Instant) -> Self {
        Self {
            sid,
            peer,
            rcv_acked: 0,
            send_buf: Vec::new(),
            send_acked: 0,
            app: LineReverser::new(),
            last_activity: now,
            retransmit_at: None,
        }
    }

    /// Address this session is bound to.
    #[must_use]
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Session id.
    #[must_use]
    pub const fn sid(&self) -> u32 {
        self.sid
    }

    /// Handles a (possibly retransmitted) CONNECT.
    pub fn on_connect(&mut self, now: Instant, out: &mut Vec<Transmit>) {
        self.last_activity = now;
        self.push_ack(out);
    }

    /// Handles a DATA packet carrying the validated wire-form `payload` at
    /// stream offset `pos`.
    ///
    /// The receive cursor counts wire-form bytes, so `pos` and the payload
    /// length are taken as framed. A gap or a pure duplicate only
    /// re-acknowledges the current cursor. Anything extending the
    /// contiguous stream advances the cursor, is acknowledged, and is fed
    /// (unescaped) through the application; whatever the application emits
    /// is appended to the send stream and transmitted in
    /// [`CHUNK_LEN`]-sized DATA packets.
    pub fn on_data(&mut self, now: Instant, pos: u32, payload: &[u8], out: &mut Vec<Transmit>) {
        self.last_activity = now;

        let pos = pos as usize;
        let end = pos + payload.len();
        if pos > self.rcv_acked || end <= self.rcv_acked {
            // gap: we must not buffer out-of-order bytes
            // duplicate: already processed
            self.push_ack(out);
            return;
        }

        let Ok(fresh) = escape::unescape_after(payload, self.rcv_acked - pos) else {
            // the parser validated the payload before we ever saw it
            return;
        };
        self.rcv_acked = end;
        self.push_ack(out);

        let reply = self.app.write(&fresh);
        if !reply.is_empty() {
            self.queue_send(now, &reply, out);
        }
    }

    /// Handles an ACK claiming `length` contiguous bytes received.
    #[must_use]
    pub fn on_ack(&mut self, now: Instant, length: u32, out: &mut Vec<Transmit>) -> Status {
        self.last_activity = now;

        let length = length as usize;
        if length <= self.send_acked {
            // stale or duplicate
            return Status::Open;
        }
        if length > self.send_buf.len() {
            // peer acked bytes we never sent
            self.push_close(out);
            return Status::Closed;
        }

        self.send_acked = length;
        self.retransmit_at = if self.send_acked < self.send_buf.len() {
            Some(now + RETRANSMIT_INTERVAL)
        } else {
            None
        };
        Status::Open
    }

    /// Handles a CLOSE from the peer, or force-closes the session.
    ///
    /// Emits the final `/close/` reply; the caller must drop the session
    /// afterwards.
    pub fn on_close(&self, out: &mut Vec<Transmit>) {
        self.push_close(out);
    }

    /// Whether the peer has been silent past [`SESSION_TIMEOUT`].
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_activity) >= SESSION_TIMEOUT
    }

    /// Retransmits all unacknowledged send data if the retransmission
    /// deadline has passed, re-arming the deadline.
    ///
    /// Retransmission is idempotent with respect to session state: only
    /// the deadline moves.
    pub fn poll_retransmit(&mut self, now: Instant, out: &mut Vec<Transmit>) {
        let Some(at) = self.retransmit_at else {
            return;
        };
        if now < at {
            return;
        }
        self.send_chunks(self.send_acked, out);
        self.retransmit_at = Some(now + RETRANSMIT_INTERVAL);
    }

    /// Appends application output to the send stream and transmits it.
    fn queue_send(&mut self, now: Instant, bytes: &[u8], out: &mut Vec<Transmit>) {
        let start = self.send_buf.len();
        self.send_buf.extend_from_slice(bytes);
        self.send_chunks(start, out);
        if self.retransmit_at.is_none() {
            self.retransmit_at = Some(now + RETRANSMIT_INTERVAL);
        }
    }

    /// Transmits `send_buf[from..]` as framed DATA chunks, escaping each
    /// chunk for the wire.
    fn send_chunks(&self, from: usize, out: &mut Vec<Transmit>) {
        let mut pos = from;
        for chunk in self.send_buf[from..].chunks(CHUNK_LEN) {
            let mut escaped = Vec::with_capacity(chunk.len());
            escape::escape_into(chunk, &mut escaped);
            out.push(Transmit {
                peer: self.peer,
                datagram: Packet::Data {
                    sid: self.sid,
                    pos: wire_u32(pos),
                    payload: Bytes::from(escaped),
                }
                .encode(),
            });
            pos += chunk.len();
        }
    }

    fn push_ack(&self, out: &mut Vec<Transmit>) {
        out.push(Transmit {
            peer: self.peer,
            datagram: Packet::Ack {
                sid: self.sid,
                length: wire_u32(self.rcv_acked),
            }
            .encode(),
        });
    }

    fn push_close(&self, out: &mut Vec<Transmit>) {
        out.push(Transmit {
            peer: self.peer,
            datagram: Packet::Close { sid: self.sid }.encode(),
        });
    }
}

/// Converts a stream position to its wire representation.
#[allow(clippy::cast_possible_truncation)] // positions live in the 31-bit wire domain
const fn wire_u32(value: usize) -> u32 {
    value as u32
}
