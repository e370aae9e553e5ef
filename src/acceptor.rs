use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::ProxyError;

const MIN_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Wraps a bound `TcpListener`, retrying transient accept errors with
/// exponential backoff instead of propagating them, and shutting down
/// idempotently.
pub struct TcpAcceptor {
    listener: TcpListener,
    closed: AtomicBool,
    shutdown: Notify,
}

impl TcpAcceptor {
    pub async fn bind(addr: &str) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(ProxyError::BindFailed)?;
        Ok(TcpAcceptor {
            listener,
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs `on_accept` for every accepted connection until a non-transient
    /// error occurs or [`TcpAcceptor::close`] has been called. A task parked
    /// in `accept()` when `close()` fires is woken immediately rather than
    /// left to block until the next connection arrives.
    pub async fn serve<F>(&self, mut on_accept: F) -> Result<(), ProxyError>
    where
        F: FnMut(TcpStream, std::net::SocketAddr),
    {
        let mut backoff = Duration::ZERO;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Ok(());
            }
            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.notified() => return Ok(()),
                res = self.listener.accept() => res,
            };
            match accepted {
                Ok((stream, addr)) => {
                    backoff = Duration::ZERO;
                    on_accept(stream, addr);
                }
                Err(e) if is_transient(&e) => {
                    backoff = if backoff.is_zero() {
                        MIN_BACKOFF
                    } else {
                        (backoff * 2).min(MAX_BACKOFF)
                    };
                    warn!(error = %e, delay_ms = backoff.as_millis(), "transient accept error, backing off");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(ProxyError::AcceptFatal(e)),
            }
        }
    }

    /// Idempotent: the first call marks the acceptor closed and wakes any
    /// task currently blocked in `serve`'s `accept()`; later calls are
    /// no-ops. `notify_one` (rather than `notify_waiters`) is used so a
    /// `close()` that races ahead of `serve()` still leaves a stored permit
    /// for the next `notified().await` to consume, instead of the wakeup
    /// being lost to a waiter that hadn't subscribed yet.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("acceptor closed");
            self.shutdown.notify_one();
        }
    }
}

/// EMFILE, ENFILE, ENOBUFS, ENOMEM on Linux -- per-process/system resource
/// exhaustion that a brief backoff typically clears, rather than a condition
/// the listener itself can recover from by retrying immediately.
#[cfg(target_os = "linux")]
const TRANSIENT_ERRNOS: &[i32] = &[24, 23, 105, 12];

#[cfg(not(target_os = "linux"))]
const TRANSIENT_ERRNOS: &[i32] = &[];

fn is_transient(e: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(e.kind(), WouldBlock | Interrupted)
        || e.raw_os_error()
            .is_some_and(|code| TRANSIENT_ERRNOS.contains(&code))
}
