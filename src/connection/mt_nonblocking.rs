//! Multi-Threaded Non-Blocking Transport
//!
//! Connections run on a multi-thread runtime. Each connection is split into a
//! reader task and a writer task that may run on different worker threads at
//! the same time, so they share the session behind a lock.
//!
//! ```text
//!                 Arc<Connection>
//!            ┌─────────────────────────┐
//!  reader ──>│ Mutex<Session>          │<── writer
//!   task     │ readable_again: Notify  │     task
//!     │      │ output_ready:   Notify  │       │
//!     │      └─────────────────────────┘       │
//!     │ try_read -> process                    │ try_write_vectored -> advance
//!     │ notify output_ready ─────────────────> │
//!     │ <──────────────── notify readable_again│ (queue fell below the bound)
//! ```
//!
//! The lock is taken for one whole read or write pass and never held across
//! an `.await`.

use crate::connection::{log_closed, ConnectionError, ConnectionStats, Service, Session, READ_BUFFER_SIZE};
use parking_lot::Mutex;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

/// State shared by the two halves of one connection.
struct Connection {
    addr: SocketAddr,
    session: Mutex<Session>,
    /// Wakes the reader after backpressure lifts
    readable_again: Notify,
    /// Wakes the writer when output is queued or reading stopped
    output_ready: Notify,
}

/// Outcome of one read pass
enum ReadPass {
    /// More may follow
    Open,
    /// The peer closed its side
    Closed,
}

/// Accepts connections until `shutdown` completes.
///
/// Must run on a multi-thread runtime. Connections already running are left
/// to finish.
pub async fn serve<F>(listener: TcpListener, service: Service, shutdown: F) -> io::Result<()>
where
    F: Future,
{
    info!(addr = %listener.local_addr()?, "Multi-threaded server listening");
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => spawn_connection(stream, addr, &service),
                Err(e) => warn!(error = %e, "Failed to accept connection"),
            },
            _ = &mut shutdown => {
                info!("Multi-threaded server stopping");
                return Ok(());
            }
        }
    }
}

fn spawn_connection(stream: TcpStream, addr: SocketAddr, service: &Service) {
    let stats = Arc::clone(service.stats());
    stats.connection_opened();
    info!(client = %addr, "Client connected");

    if let Err(e) = stream.set_nodelay(true) {
        debug!(client = %addr, error = %e, "Failed to set TCP_NODELAY");
    }

    let stream = Arc::new(stream);
    let conn = Arc::new(Connection {
        addr,
        session: Mutex::new(service.session()),
        readable_again: Notify::new(),
        output_ready: Notify::new(),
    });

    tokio::spawn(async move {
        let reader = tokio::spawn(read_loop(
            Arc::clone(&stream),
            Arc::clone(&conn),
            Arc::clone(&stats),
        ));

        let written = write_loop(&stream, &conn, &stats).await;

        // If writing failed the reader may still be parked
        reader.abort();
        let read = match reader.await {
            Ok(result) => result,
            Err(_) => Ok(()),
        };

        let result = written.and(read);
        log_closed(&addr, &result);
        stats.connection_closed();
    });
}

async fn read_loop(
    stream: Arc<TcpStream>,
    conn: Arc<Connection>,
    stats: Arc<ConnectionStats>,
) -> Result<(), ConnectionError> {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        // Backpressure: stay away from the socket until the writer catches up
        loop {
            let resumed = conn.readable_again.notified();
            if conn.session.lock().wants_read() {
                break;
            }
            trace!(client = %conn.addr, "Reading paused");
            resumed.await;
        }

        if let Err(e) = stream.readable().await {
            stop_reading(&conn);
            return Err(e.into());
        }

        match read_pass(&stream, &conn, &stats, &mut buf) {
            Ok(ReadPass::Open) => {}
            Ok(ReadPass::Closed) => return Ok(()),
            Err(e) => {
                stop_reading(&conn);
                return Err(e.into());
            }
        }
    }
}

/// Reads until the socket would block, processing every chunk.
fn read_pass(
    stream: &TcpStream,
    conn: &Connection,
    stats: &ConnectionStats,
    buf: &mut [u8],
) -> io::Result<ReadPass> {
    let mut session = conn.session.lock();
    let mut pass = ReadPass::Open;

    loop {
        match stream.try_read(buf) {
            Ok(0) => {
                debug!(client = %conn.addr, "Peer closed its side");
                session.close_read();
                pass = ReadPass::Closed;
                break;
            }
            Ok(n) => {
                stats.bytes_read(n);
                trace!(client = %conn.addr, bytes = n, "Read data");
                session.process(&buf[..n]);
                if !session.wants_read() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }

    let wake_writer = session.wants_write() || session.is_read_closed();
    drop(session);
    if wake_writer {
        conn.output_ready.notify_one();
    }
    Ok(pass)
}

fn stop_reading(conn: &Connection) {
    conn.session.lock().close_read();
    conn.output_ready.notify_one();
}

async fn write_loop(
    stream: &TcpStream,
    conn: &Connection,
    stats: &ConnectionStats,
) -> Result<(), ConnectionError> {
    loop {
        let queued = conn.output_ready.notified();
        let (wants_write, finished) = {
            let session = conn.session.lock();
            (session.wants_write(), session.is_finished())
        };

        if finished {
            return Ok(());
        }
        if !wants_write {
            queued.await;
            continue;
        }

        stream.writable().await?;
        write_pass(stream, conn, stats)?;
    }
}

/// One vectored write of whatever is queued.
fn write_pass(
    stream: &TcpStream,
    conn: &Connection,
    stats: &ConnectionStats,
) -> Result<(), ConnectionError> {
    let mut session = conn.session.lock();
    let was_paused = !session.wants_read() && !session.is_read_closed();

    let result = stream.try_write_vectored(&session.write_slices());
    match result {
        Ok(0) => return Err(ConnectionError::ClientDisconnected),
        Ok(n) => {
            stats.bytes_written(n);
            trace!(client = %conn.addr, bytes = n, "Sent response");
            session.advance(n);
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e.into()),
    }

    let resume_reader = was_paused && session.wants_read();
    drop(session);
    if resume_reader {
        trace!(client = %conn.addr, "Reading resumed");
        conn.readable_again.notify_one();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::{expect, expect_eof, roundtrip};
    use crate::storage::StripedLru;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    async fn start_server(service: Service) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, service, std::future::pending::<()>()));
        addr
    }

    fn service() -> Service {
        Service::new(Arc::new(StripedLru::new(64 * 1024, 4).unwrap()))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_set_get() {
        let addr = start_server(service()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        roundtrip(&mut client, b"set name 0 0 4\r\nAriz\r\n", "STORED\r\n").await;
        roundtrip(&mut client, b"get name\r\n", "VALUE name 0 4\r\nAriz\r\nEND\r\n").await;
        roundtrip(&mut client, b"delete name\r\n", "DELETED\r\n").await;
        roundtrip(&mut client, b"get name\r\n", "END\r\n").await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pipelined_commands() {
        let addr = start_server(service()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        roundtrip(
            &mut client,
            b"set k1 0 0 2\r\nv1\r\nset k2 0 0 2\r\nv2\r\nget k1 k2\r\nincr n 1\r\n",
            "STORED\r\nSTORED\r\nVALUE k1 0 2\r\nv1\r\nVALUE k2 0 2\r\nv2\r\nEND\r\nNOT_FOUND\r\n",
        )
        .await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_clients() {
        let addr = start_server(service()).await;

        let clients: Vec<_> = (0..8)
            .map(|i| {
                tokio::spawn(async move {
                    let mut client = TcpStream::connect(addr).await.unwrap();
                    for round in 0..20 {
                        let value = format!("{}-{}", i, round);
                        let set = format!("set key{} 0 0 {}\r\n{}\r\n", i, value.len(), value);
                        roundtrip(&mut client, set.as_bytes(), "STORED\r\n").await;

                        let get = format!("get key{}\r\n", i);
                        let expected =
                            format!("VALUE key{} 0 {}\r\n{}\r\nEND\r\n", i, value.len(), value);
                        roundtrip(&mut client, get.as_bytes(), &expected).await;
                    }
                })
            })
            .collect();

        for client in clients {
            client.await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_backpressure_delivers_everything() {
        let addr = start_server(service().with_max_output_queue(2)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let request = "version\r\n".repeat(2000);
        client.write_all(request.as_bytes()).await.unwrap();

        let line = format!("VERSION {}\r\n", crate::VERSION);
        expect(&mut client, &line.repeat(2000)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_flushes_after_half_close() {
        let service = service();
        let stats = Arc::clone(service.stats());
        let addr = start_server(service).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"version\r\nbogus\r\n").await.unwrap();
        client.shutdown().await.unwrap();

        expect(&mut client, &format!("VERSION {}\r\nERROR\r\n", crate::VERSION)).await;
        expect_eof(&mut client).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stats.active(), 0);
        assert_eq!(stats.commands_processed.load(Ordering::Relaxed), 1);
        assert!(stats.bytes_written.load(Ordering::Relaxed) > 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_one_failing_client_does_not_affect_others() {
        let addr = start_server(service()).await;

        let mut healthy = TcpStream::connect(addr).await.unwrap();
        roundtrip(&mut healthy, b"set k 0 0 1\r\nx\r\n", "STORED\r\n").await;

        {
            // Hangs up in the middle of a data block
            let mut rude = TcpStream::connect(addr).await.unwrap();
            rude.write_all(b"set k 0 0 10\r\nabc").await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        roundtrip(&mut healthy, b"get k\r\n", "VALUE k 0 1\r\nx\r\nEND\r\n").await;
    }
}
