//! Tokio TCP accept loop.

use std::convert::Infallible;
use std::io;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{Instrument, debug, debug_span};

use crate::{conn, store::Store};

/// Serves the speed daemon on `listener` forever.
///
/// Every accepted connection gets its own task over a shared [`Store`].
/// A client failing - protocol error, broken socket - takes down only its
/// own connection.
///
/// # Errors
///
/// Errors if accepting a connection fails.
pub async fn listen(listener: TcpListener) -> io::Result<Infallible> {
    let local_addr = listener.local_addr()?;
    debug!("Listening on {local_addr}");

    let store = Arc::new(Store::new());
    let mut next_conn: u64 = 0;

    loop {
        let (stream, peer) = listener.accept().await?;
        let conn = next_conn;
        next_conn += 1;

        let store = Arc::clone(&store);
        tokio::spawn(
            async move {
                debug!("Connected");
                match conn::handle(stream, &store, conn).await {
                    Ok(()) => debug!("Disconnected"),
                    Err(err) => debug!("Disconnected: {err}"),
                }
            }
            .instrument(debug_span!("session", %peer)),
        );
    }
}
