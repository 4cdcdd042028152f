//! Per-connection protocol handling.

use std::io;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{debug, trace};

use crate::msg::{ClientMessage, DecodeError, ServerMessage, Ticket};
use crate::store::Store;

/// Unit of the WantHeartbeat interval field.
pub const DECISECOND: Duration = Duration::from_millis(100);

/// A client request the protocol forbids.
///
/// The display string is what the client receives in the `Error` message
/// before the connection is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The type discriminant is not a client-to-server message.
    #[error("unknown message type 0x{0:02x}")]
    UnknownType(u8),
    /// The client identified as a camera or dispatcher twice.
    #[error("client is already identified")]
    AlreadyIdentified,
    /// A Plate arrived from a client that is not a camera.
    #[error("client is not a camera")]
    NotACamera,
    /// A second WantHeartbeat arrived.
    #[error("heartbeat already requested")]
    DuplicateHeartbeat,
}

impl From<DecodeError> for ProtocolError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::UnknownType(ty) => Self::UnknownType(ty),
        }
    }
}

/// Why a connection task finished.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The socket failed; nothing more to say to the client.
    #[error("connection lost")]
    Io(#[from] io::Error),
    /// The client broke the protocol and was sent an `Error`.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// What this connection has identified itself as.
#[derive(Debug)]
enum Role {
    Unidentified,
    Camera { road: u16, mile: u16 },
    Dispatcher { roads: Vec<u16> },
}

/// Runs one client connection to completion.
///
/// The task interleaves three event sources: bytes from the client,
/// heartbeat ticks, and - for dispatchers - tickets deposited by the
/// [`Store`]. On a protocol error the client is sent an `Error` message
/// and the function returns; on any exit path a dispatcher's subscriptions
/// are removed and its undelivered tickets go back to the store.
///
/// # Errors
///
/// Errors if the socket fails or the client breaks protocol. Either way
/// the connection is finished; the error is only for logging.
pub async fn handle<S>(mut stream: S, store: &Store, conn: u64) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);
    let mut role = Role::Unidentified;
    let mut heartbeat_requested = false;
    let mut heartbeat: Option<Interval> = None;
    let mut tickets: Option<mpsc::UnboundedReceiver<Ticket>> = None;
    let mut undelivered: Vec<Ticket> = Vec::new();
    let mut out = BytesMut::new();

    let result = loop {
        tokio::select! {
            read = stream.read_buf(&mut buf) => {
                match read {
                    Ok(0) => break Ok(()),
                    Ok(_) => {}
                    Err(err) => break Err(ConnectionError::Io(err)),
                }
                if let Err(err) = drain_messages(
                    &mut buf,
                    store,
                    conn,
                    &mut role,
                    &mut heartbeat_requested,
                    &mut heartbeat,
                    &mut tickets,
                ) {
                    break Err(ConnectionError::Protocol(err));
                }
            }
            _ = next_tick(&mut heartbeat) => {
                out.clear();
                ServerMessage::Heartbeat.encode(&mut out);
                if let Err(err) = stream.write_all(&out).await {
                    break Err(ConnectionError::Io(err));
                }
            }
            ticket = next_ticket(&mut tickets) => {
                trace!("Writing ticket for road {}", ticket.road);
                out.clear();
                ServerMessage::Ticket(ticket.clone()).encode(&mut out);
                if let Err(err) = stream.write_all(&out).await {
                    undelivered.push(ticket);
                    break Err(ConnectionError::Io(err));
                }
            }
        }
    };

    if let Err(ConnectionError::Protocol(err)) = &result {
        debug!("Closing: {err}");
        out.clear();
        ServerMessage::Error {
            msg: err.to_string(),
        }
        .encode(&mut out);
        // we are closing either way; the error return carries the story
        let _ = stream.write_all(&out).await;
    }

    if let Role::Dispatcher { roads } = &role {
        // unsubscribe before draining, so nothing lands in the endpoint
        // after we stop looking at it
        store.unsubscribe(conn, roads);
        if let Some(rx) = tickets.as_mut() {
            rx.close();
            while let Ok(ticket) = rx.try_recv() {
                undelivered.push(ticket);
            }
        }
        store.restore(undelivered);
    }

    result
}

/// Decodes and applies every complete message sitting in `buf`.
#[allow(clippy::too_many_arguments)]
fn drain_messages(
    buf: &mut BytesMut,
    store: &Store,
    conn: u64,
    role: &mut Role,
    heartbeat_requested: &mut bool,
    heartbeat: &mut Option<Interval>,
    tickets: &mut Option<mpsc::UnboundedReceiver<Ticket>>,
) -> Result<(), ProtocolError> {
    while let Some(msg) = ClientMessage::decode(buf)? {
        match msg {
            ClientMessage::IAmCamera { road, mile, limit } => {
                if !matches!(role, Role::Unidentified) {
                    return Err(ProtocolError::AlreadyIdentified);
                }
                debug!("Camera on road {road} at mile {mile}, limit {limit}");
                store.register_camera(road, limit);
                *role = Role::Camera { road, mile };
            }
            ClientMessage::IAmDispatcher { roads } => {
                if !matches!(role, Role::Unidentified) {
                    return Err(ProtocolError::AlreadyIdentified);
                }
                debug!("Dispatcher for {} roads", roads.len());
                let (tx, rx) = mpsc::unbounded_channel();
                store.subscribe(conn, &roads, &tx);
                *tickets = Some(rx);
                *role = Role::Dispatcher { roads };
            }
            ClientMessage::Plate { plate, timestamp } => {
                let Role::Camera { road, mile } = &*role else {
                    return Err(ProtocolError::NotACamera);
                };
                store.record_plate(&plate, *road, *mile, timestamp);
            }
            ClientMessage::WantHeartbeat { interval } => {
                if *heartbeat_requested {
                    return Err(ProtocolError::DuplicateHeartbeat);
                }
                *heartbeat_requested = true;
                if interval > 0 {
                    let period = DECISECOND * interval;
                    let mut timer = time::interval_at(time::Instant::now() + period, period);
                    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    *heartbeat = Some(timer);
                }
            }
        }
    }
    Ok(())
}

/// Resolves on the next heartbeat tick; pends forever with no heartbeat
/// configured.
async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Resolves on the next deposited ticket; pends forever for non-dispatchers
/// (and for a dispatcher whose endpoints have all been dropped - teardown
/// drains what is left).
async fn next_ticket(tickets: &mut Option<mpsc::UnboundedReceiver<Ticket>>) -> Ticket {
    match tickets {
        Some(rx) => match rx.recv().await {
            Some(ticket) => ticket,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}
