//! Byte-transparent relay between the client and the chosen upstream.
//!
//! Two unidirectional pumps share one [`RelaySession`]: whichever direction
//! fails first latches the session closed, and the opposite pump observes the
//! latch instead of hanging on a half-dead socket.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::task::ChildTask;

const RELAY_BUFFER_SIZE: usize = 64 * 1024;

/// Close state shared by both pumps of one proxied connection.
pub struct RelaySession {
    closed: AtomicBool,
    close_signal: Notify,
}

impl RelaySession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
        })
    }

    /// Latches the session closed. Only the first call has any effect; it is
    /// safe to call from both pumps concurrently.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_signal.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the session is closed, however long ago that happened.
    pub async fn closed(&self) {
        let notified = self.close_signal.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_closed() {
            return;
        }

        notified.await;
    }
}

/// Splices the two sockets together and runs both directions to completion.
///
/// Returns once both pumps have terminated; at that point the session is
/// closed and both sockets have been shut down.
pub async fn run_pumps(session: Arc<RelaySession>, client: TcpStream, upstream: TcpStream) {
    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();

    let client_to_upstream = ChildTask::spawn(pump(Arc::clone(&session), client_read, upstream_write));
    let upstream_to_client = ChildTask::spawn(pump(Arc::clone(&session), upstream_read, client_write));

    let _ = client_to_upstream.join().await;
    let _ = upstream_to_client.join().await;
}

/// One direction of the relay: reads from `reader`, writes the same bytes in
/// the same order to `writer`, until end-of-stream, an I/O failure or the
/// session's closure. Exiting for any reason closes the session.
async fn pump<R, W>(session: Arc<RelaySession>, mut reader: R, mut writer: W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    loop {
        let n = tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(error) => {
                    debug!(%error, "relay read failed");
                    break;
                }
            },
            () = session.closed() => break,
        };

        tokio::select! {
            write = writer.write_all(&buf[..n]) => {
                if let Err(error) = write {
                    debug!(%error, "relay write failed");
                    break;
                }
            }
            () = session.closed() => break,
        }
    }

    session.close();
    let _ = writer.shutdown().await;
}
