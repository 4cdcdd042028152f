//! Session table and datagram routing.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use tracing::{debug, trace};

use crate::{
    Transmit,
    session::{Session, Status},
    wire::Packet,
};

/// How often [`Endpoint::poll`] checks sessions for expiry.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(2);

/// Owner of all LRCP sessions behind one datagram socket.
///
/// The endpoint is driven from exactly one task: [`Endpoint::handle`] for
/// every inbound datagram, [`Endpoint::poll`] on a timer tick. This is
/// what serialises events per session - no session is ever re-entered
/// concurrently, because nothing here is ever entered concurrently.
#[derive(Debug)]
pub struct Endpoint {
    sessions: AHashMap<u32, Session>,
    next_sweep: Instant,
}

impl Endpoint {
    /// Creates an endpoint with no sessions.
    #[must_use]
    pub fn new(now: Instant) -> Self {
        Self {
            sessions: AHashMap::new(),
            next_sweep: now + SWEEP_INTERVAL,
        }
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Processes one inbound datagram from `peer`.
    ///
    /// Outgoing datagrams are pushed onto `out`. Malformed datagrams are
    /// dropped; a well-formed non-CONNECT packet for an unknown session
    /// gets a `/close/` reply and changes nothing.
    pub fn handle(&mut self, now: Instant, peer: SocketAddr, datagram: &[u8], out: &mut Vec<Transmit>) {
        let packet = match Packet::parse(datagram) {
            Ok(packet) => packet,
            Err(err) => {
                trace!("Dropping datagram from {peer}: {err}");
                return;
            }
        };

        match packet {
            Packet::Connect { sid } => {
                if let Some(session) = self.sessions.get_mut(&sid) {
                    if session.peer() == peer {
                        session.on_connect(now, out);
                    } else {
                        trace!("Ignoring CONNECT for session {sid} from {peer}");
                    }
                } else {
                    debug!("Session {sid} opened by {peer}");
                    let mut session = Session::new(sid, peer, now);
                    session.on_connect(now, out);
                    self.sessions.insert(sid, session);
                }
            }
            Packet::Data { sid, pos, payload } => {
                if let Some(session) = self.route(sid, peer, out) {
                    session.on_data(now, pos, &payload, out);
                }
            }
            Packet::Ack { sid, length } => {
                if let Some(session) = self.route(sid, peer, out) {
                    if session.on_ack(now, length, out) == Status::Closed {
                        debug!("Session {sid} closed: peer acked past send stream");
                        self.sessions.remove(&sid);
                    }
                }
            }
            Packet::Close { sid } => {
                if let Some(session) = self.route(sid, peer, out) {
                    session.on_close(out);
                    debug!("Session {sid} closed by peer");
                    self.sessions.remove(&sid);
                }
            }
        }
    }

    /// Runs per-session timers: retransmission every call, expiry on the
    /// sweep cadence.
    pub fn poll(&mut self, now: Instant, out: &mut Vec<Transmit>) {
        let sweep = now >= self.next_sweep;
        if sweep {
            self.next_sweep = now + SWEEP_INTERVAL;
        }

        self.sessions.retain(|sid, session| {
            if sweep && session.is_expired(now) {
                debug!("Session {sid} expired");
                session.on_close(out);
                return false;
            }
            session.poll_retransmit(now, out);
            true
        });
    }

    /// Looks up the session for a non-CONNECT packet.
    ///
    /// Replies `/close/` for unknown sessions; silently ignores packets
    /// for a known session arriving from the wrong address.
    fn route(&mut self, sid: u32, peer: SocketAddr, out: &mut Vec<Transmit>) -> Option<&mut Session> {
        match self.sessions.get_mut(&sid) {
            Some(session) if session.peer() == peer => Some(session),
            Some(_) => {
                trace!("Ignoring packet for session {sid} from {peer}");
                None
            }
            None => {
                trace!("Unknown session {sid} addressed by {peer}");
                out.push(Transmit {
                    peer,
                    datagram: Packet::Close { sid }.encode(),
                });
                None
            }
        }
    }
}
