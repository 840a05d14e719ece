//! Blocking Transport on the Executor
//!
//! One acceptor thread blocks in `accept()` and submits every connection to
//! an [`Executor`]. A worker then owns the connection for its whole life,
//! reading with a timeout so it notices when the server is stopping.
//!
//! ```text
//!  acceptor thread                    Executor
//!  ┌──────────────┐  execute(conn)  ┌───────────────────────────────┐
//!  │ accept() ────┼────────────────>│ worker: read -> process ->    │
//!  │              │                 │         write all -> repeat   │
//!  │ rejected? ───┼─> "SERVER_ERROR │ worker: ...                   │
//!  └──────────────┘   server busy"  └───────────────────────────────┘
//! ```

use crate::concurrency::{Executor, ExecutorConfig};
use crate::connection::{log_closed, ConnectionError, ConnectionStats, Service, Session, READ_BUFFER_SIZE};
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

const SERVER_BUSY: &[u8] = b"SERVER_ERROR server busy\r\n";

/// Settings for [`BlockingServer`].
#[derive(Debug, Clone)]
pub struct BlockingOptions {
    /// Sizing of the connection pool
    pub pool: ExecutorConfig,

    /// How often an idle worker checks whether the server is stopping
    pub read_timeout: Duration,
}

impl Default for BlockingOptions {
    fn default() -> Self {
        Self {
            pool: ExecutorConfig::default(),
            read_timeout: Duration::from_millis(100),
        }
    }
}

/// A running blocking server. Stops when dropped.
pub struct BlockingServer {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
    executor: Arc<Executor>,
}

impl BlockingServer {
    /// Starts accepting on `listener` in a background thread.
    pub fn start(listener: TcpListener, service: Service, options: BlockingOptions) -> io::Result<Self> {
        let addr = listener.local_addr()?;
        let running = Arc::new(AtomicBool::new(true));
        let executor = Arc::new(Executor::new("lrukv-worker", options.pool));

        let acceptor = {
            let running = Arc::clone(&running);
            let executor = Arc::clone(&executor);
            let read_timeout = options.read_timeout;
            thread::Builder::new()
                .name("lrukv-acceptor".to_string())
                .spawn(move || accept_loop(listener, service, executor, running, read_timeout))?
        };

        info!(addr = %addr, "Blocking server listening");
        Ok(Self {
            addr,
            running,
            acceptor: Some(acceptor),
            executor,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Stops accepting, then waits for every connection to wind down.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);

        let Some(acceptor) = self.acceptor.take() else {
            return;
        };

        // accept() only returns on a new connection
        if let Err(e) = TcpStream::connect_timeout(&wake_addr(self.addr), Duration::from_secs(1)) {
            debug!(error = %e, "Failed to wake acceptor");
        }
        if acceptor.join().is_err() {
            warn!("Acceptor thread panicked");
        }

        self.executor.stop(true);
        info!(addr = %self.addr, "Blocking server stopped");
    }
}

impl Drop for BlockingServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for BlockingServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingServer")
            .field("addr", &self.addr)
            .field("running", &self.running.load(Ordering::Relaxed))
            .field("executor", &self.executor)
            .finish()
    }
}

/// Where to connect to reach a listener bound to `addr`.
fn wake_addr(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => (Ipv4Addr::LOCALHOST, addr.port()).into(),
        IpAddr::V6(ip) if ip.is_unspecified() => (Ipv6Addr::LOCALHOST, addr.port()).into(),
        _ => addr,
    }
}

fn accept_loop(
    listener: TcpListener,
    service: Service,
    executor: Arc<Executor>,
    running: Arc<AtomicBool>,
    read_timeout: Duration,
) {
    for incoming in listener.incoming() {
        if !running.load(Ordering::Acquire) {
            break;
        }
        match incoming {
            Ok(stream) => dispatch(stream, &service, &executor, &running, read_timeout),
            Err(e) => warn!(error = %e, "Failed to accept connection"),
        }
    }
    debug!("Acceptor exiting");
}

fn dispatch(
    stream: TcpStream,
    service: &Service,
    executor: &Executor,
    running: &Arc<AtomicBool>,
    read_timeout: Duration,
) {
    let addr = match stream.peer_addr() {
        Ok(addr) => addr,
        Err(e) => {
            debug!(error = %e, "Dropping connection without peer address");
            return;
        }
    };

    // Kept so a rejected connection can still be answered
    let reply = stream.try_clone();

    let stats = Arc::clone(service.stats());
    stats.connection_opened();
    info!(client = %addr, "Client connected");

    let session = service.session();
    let task_stats = Arc::clone(&stats);
    let running = Arc::clone(running);
    let accepted = executor.execute(move || {
        let result = serve_connection(stream, addr, session, &task_stats, &running, read_timeout);
        log_closed(&addr, &result);
        task_stats.connection_closed();
    });

    if !accepted {
        warn!(client = %addr, "Server busy, rejecting connection");
        stats.connection_closed();
        if let Ok(mut reply) = reply {
            if let Err(e) = reply.write_all(SERVER_BUSY) {
                debug!(client = %addr, error = %e, "Failed to send busy reply");
            }
            if let Err(e) = reply.shutdown(Shutdown::Both) {
                debug!(client = %addr, error = %e, "Failed to close rejected connection");
            }
        }
    }
}

fn serve_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    mut session: Session,
    stats: &ConnectionStats,
    running: &AtomicBool,
    read_timeout: Duration,
) -> Result<(), ConnectionError> {
    stream.set_read_timeout(Some(read_timeout))?;
    stream.set_nodelay(true)?;
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    while running.load(Ordering::Acquire) {
        match stream.read(&mut buf) {
            Ok(0) => {
                debug!(client = %addr, "Peer closed its side");
                session.close_read();
                break;
            }
            Ok(n) => {
                stats.bytes_read(n);
                session.process(&buf[..n]);
                flush(&mut stream, &mut session, stats)?;
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => return Err(e.into()),
        }
    }

    flush(&mut stream, &mut session, stats)
}

/// Writes until the output queue is empty.
fn flush(stream: &mut TcpStream, session: &mut Session, stats: &ConnectionStats) -> Result<(), ConnectionError> {
    while session.wants_write() {
        match session.write_to(stream) {
            Ok(0) => return Err(ConnectionError::ClientDisconnected),
            Ok(n) => stats.bytes_written(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
