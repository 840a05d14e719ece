//! Single-Threaded Non-Blocking Transport
//!
//! Every connection is a local task on one current-thread runtime. Nothing is
//! shared between threads, so each task owns its [`Session`] outright.
//!
//! ```text
//!  current-thread runtime + LocalSet
//!  ┌──────────────────────────────────────────────────┐
//!  │ accept loop ── spawn_local ──> conn task (addr1) │
//!  │             └─ spawn_local ──> conn task (addr2) │
//!  │                                                  │
//!  │ conn task:                                       │
//!  │   interest = R if wants_read | W if wants_write  │
//!  │   ready(interest).await                          │
//!  │   R: try_read until WouldBlock -> process        │
//!  │   W: try_write_vectored once   -> advance        │
//!  └──────────────────────────────────────────────────┘
//! ```
//!
//! [`serve`] must run inside a [`LocalSet`](tokio::task::LocalSet).

use crate::connection::{log_closed, ConnectionError, ConnectionStats, Service, Session, READ_BUFFER_SIZE};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::Interest;
use tokio::net::{TcpListener, TcpStream};
use tokio::task;
use tracing::{debug, info, trace, warn};

/// Accepts connections until `shutdown` completes.
///
/// Connections already running are left to finish on the `LocalSet`.
///
/// # Panics
///
/// Panics if called outside of a `LocalSet`.
pub async fn serve<F>(listener: TcpListener, service: Service, shutdown: F) -> io::Result<()>
where
    F: Future,
{
    info!(addr = %listener.local_addr()?, "Single-threaded server listening");
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let session = service.session();
                    let stats = Arc::clone(service.stats());
                    stats.connection_opened();
                    task::spawn_local(async move {
                        info!(client = %addr, "Client connected");
                        let result = run(stream, addr, session, &stats).await;
                        log_closed(&addr, &result);
                        stats.connection_closed();
                    });
                }
                Err(e) => warn!(error = %e, "Failed to accept connection"),
            },
            _ = &mut shutdown => {
                info!("Single-threaded server stopping");
                return Ok(());
            }
        }
    }
}

/// Drives one connection until it is finished or fails.
async fn run(
    stream: TcpStream,
    addr: SocketAddr,
    mut session: Session,
    stats: &ConnectionStats,
) -> Result<(), ConnectionError> {
    stream.set_nodelay(true)?;
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let interest = match (session.wants_read(), session.wants_write()) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (true, false) => Interest::READABLE,
            (false, true) => Interest::WRITABLE,
            (false, false) => return Ok(()),
        };

        let ready = stream.ready(interest).await?;

        if ready.is_readable() && session.wants_read() {
            loop {
                match stream.try_read(&mut buf) {
                    Ok(0) => {
                        debug!(client = %addr, "Peer closed its side");
                        session.close_read();
                        break;
                    }
                    Ok(n) => {
                        stats.bytes_read(n);
                        trace!(client = %addr, bytes = n, "Read data");
                        session.process(&buf[..n]);
                        if !session.wants_read() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e.into()),
                }
            }
        }

        if ready.is_writable() && session.wants_write() {
            let result = stream.try_write_vectored(&session.write_slices());
            match result {
                Ok(0) => return Err(ConnectionError::ClientDisconnected),
                Ok(n) => {
                    stats.bytes_written(n);
                    trace!(client = %addr, bytes = n, "Sent response");
                    session.advance(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::{expect, expect_eof, roundtrip};
    use crate::storage::ThreadSafeLru;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::task::LocalSet;

    async fn start_server(service: Service) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        task::spawn_local(serve(listener, service, std::future::pending::<()>()));
        addr
    }

    fn service() -> Service {
        Service::new(Arc::new(ThreadSafeLru::new(1024)))
    }

    #[tokio::test]
    async fn test_set_get() {
        LocalSet::new()
            .run_until(async {
                let addr = start_server(service()).await;
                let mut client = TcpStream::connect(addr).await.unwrap();

                roundtrip(&mut client, b"set name 0 0 4\r\nAriz\r\n", "STORED\r\n").await;
                roundtrip(&mut client, b"get name\r\n", "VALUE name 0 4\r\nAriz\r\nEND\r\n").await;
            })
            .await;
    }

    #[tokio::test]
    async fn test_command_split_across_writes() {
        LocalSet::new()
            .run_until(async {
                let addr = start_server(service()).await;
                let mut client = TcpStream::connect(addr).await.unwrap();

                client.write_all(b"se").await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
                client.write_all(b"t k 0 0 5\r\nhel").await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
                roundtrip(&mut client, b"lo\r\n", "STORED\r\n").await;
            })
            .await;
    }

    #[tokio::test]
    async fn test_backpressure_delivers_everything() {
        LocalSet::new()
            .run_until(async {
                let addr = start_server(service().with_max_output_queue(1)).await;
                let mut client = TcpStream::connect(addr).await.unwrap();

                let request = "version\r\n".repeat(200);
                client.write_all(request.as_bytes()).await.unwrap();

                let line = format!("VERSION {}\r\n", crate::VERSION);
                expect(&mut client, &line.repeat(200)).await;
            })
            .await;
    }

    #[tokio::test]
    async fn test_flushes_after_half_close() {
        LocalSet::new()
            .run_until(async {
                let service = service();
                let stats = Arc::clone(service.stats());
                let addr = start_server(service).await;
                let mut client = TcpStream::connect(addr).await.unwrap();

                client.write_all(b"set a 0 0 1\r\n1\r\nget a\r\n").await.unwrap();
                client.shutdown().await.unwrap();

                expect(&mut client, "STORED\r\nVALUE a 0 1\r\n1\r\nEND\r\n").await;
                expect_eof(&mut client).await;

                tokio::time::sleep(Duration::from_millis(20)).await;
                assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
                assert_eq!(stats.active(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        LocalSet::new()
            .run_until(async {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let (tx, rx) = tokio::sync::oneshot::channel::<()>();
                let server = task::spawn_local(serve(listener, service(), async {
                    let _ = rx.await;
                }));

                tx.send(()).unwrap();
                let result = tokio::time::timeout(Duration::from_secs(5), server)
                    .await
                    .unwrap()
                    .unwrap();
                assert!(result.is_ok());
            })
            .await;
    }
}
