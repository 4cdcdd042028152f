//! Tokio UDP driver for an [`Endpoint`].

use std::convert::Infallible;
use std::io;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tracing::{debug, trace};

use crate::endpoint::Endpoint;

/// How often the driver ticks the endpoint's timers.
///
/// Retransmission and expiry deadlines are second-scale, so a coarse tick
/// is plenty.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Serves LRCP on `socket` forever.
///
/// One task owns the socket and the endpoint: datagrams are handled as
/// they arrive, timers tick every [`POLL_INTERVAL`], and everything the
/// endpoint wants to transmit is sent best-effort - a failed send is
/// logged and forgotten, retransmission recovers the loss.
///
/// # Errors
///
/// Errors if receiving on the socket fails.
pub async fn listen(socket: UdpSocket) -> io::Result<Infallible> {
    let local_addr = socket.local_addr()?;
    debug!("Listening on {local_addr}");

    let mut endpoint = Endpoint::new(Instant::now());
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let mut buf = vec![0u8; 2048];
    let mut out = Vec::new();

    loop {
        tokio::select! {
            recv = socket.recv_from(&mut buf) => {
                let (len, peer) = recv?;
                trace!("{len}B <- {peer}");
                endpoint.handle(Instant::now(), peer, &buf[..len], &mut out);
            }
            _ = ticker.tick() => {
                endpoint.poll(Instant::now(), &mut out);
            }
        }

        for transmit in out.drain(..) {
            trace!("{}B -> {}", transmit.datagram.len(), transmit.peer);
            if let Err(err) = socket.send_to(&transmit.datagram, transmit.peer).await {
                debug!("Failed to send to {}: {err:?}", transmit.peer);
            }
        }
    }
}
