//! Coroutine Transport
//!
//! Every connection is a coroutine on one [`Engine`]. Connection code is a
//! plain loop: it reads and writes until the socket would block, then blocks
//! itself. The engine's idle hook doubles as the reactor: it waits for
//! readiness on a current-thread runtime and unblocks the coroutines whose
//! sockets are ready.
//!
//! ```text
//!  one thread
//!  ┌──────────────────────────────────────────────────────────────┐
//!  │ acceptor coroutine: accepted? ── spawn ──> conn coroutine    │
//!  │                     none ─────── block                       │
//!  │                                                              │
//!  │ conn coroutine:  try_read until WouldBlock -> process        │
//!  │                  try_write_vectored        -> advance        │
//!  │                  progress? yield : register interest + block │
//!  │                                                              │
//!  │ idle hook:       block_on(listener | waiters | shutdown)     │
//!  │                  -> unblock what became ready                │
//!  └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`serve`] builds its own runtime and blocks the calling thread.

use crate::connection::{log_closed, ConnectionError, ConnectionStats, Service, Session, READ_BUFFER_SIZE};
use crate::coroutine::{CoroutineId, Engine, Handle};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::{poll_fn, Future};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, info, trace, warn};

type Shutdown = Pin<Box<dyn Future<Output = ()>>>;

/// A coroutine parked until its socket is ready.
struct Waiter {
    id: CoroutineId,
    stream: Rc<TcpStream>,
    read: bool,
    write: bool,
}

/// Everything the idle hook waits on.
struct Reactor {
    listener: TcpListener,
    accepted: VecDeque<(TcpStream, SocketAddr)>,
    /// Set while the acceptor is blocked on an empty queue
    acceptor: Option<CoroutineId>,
    waiting: Vec<Waiter>,
    stopping: bool,
}

impl Reactor {
    /// Collects the coroutines that can make progress.
    fn poll_events(&mut self, cx: &mut Context<'_>, shutdown: &mut Shutdown) -> Poll<Vec<CoroutineId>> {
        let mut woken = Vec::new();

        if shutdown.as_mut().poll(cx).is_ready() {
            info!("Coroutine server stopping");
            self.stopping = true;
            woken.extend(self.acceptor.take());
            woken.extend(self.waiting.drain(..).map(|waiter| waiter.id));
            return Poll::Ready(woken);
        }

        loop {
            match self.listener.poll_accept(cx) {
                Poll::Ready(Ok(accepted)) => self.accepted.push_back(accepted),
                Poll::Ready(Err(e)) => {
                    warn!(error = %e, "Failed to accept connection");
                    cx.waker().wake_by_ref();
                    break;
                }
                Poll::Pending => break,
            }
        }
        if !self.accepted.is_empty() {
            woken.extend(self.acceptor.take());
        }

        self.waiting.retain(|waiter| {
            let ready = (waiter.read && waiter.stream.poll_read_ready(cx).is_ready())
                || (waiter.write && waiter.stream.poll_write_ready(cx).is_ready());
            if ready {
                woken.push(waiter.id);
            }
            !ready
        });

        if woken.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(woken)
        }
    }
}

/// Serves connections on the calling thread until `shutdown` completes.
///
/// Open connections are closed once `shutdown` fires; output they have not
/// written yet is dropped.
pub fn serve<F>(listener: std::net::TcpListener, service: Service, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + 'static,
{
    let runtime = Builder::new_current_thread().enable_all().build()?;

    listener.set_nonblocking(true)?;
    let listener = {
        let _guard = runtime.enter();
        TcpListener::from_std(listener)?
    };
    info!(addr = %listener.local_addr()?, "Coroutine server listening");

    let reactor = Rc::new(RefCell::new(Reactor {
        listener,
        accepted: VecDeque::new(),
        acceptor: None,
        waiting: Vec::new(),
        stopping: false,
    }));

    let hook_reactor = Rc::clone(&reactor);
    let mut shutdown: Shutdown = Box::pin(shutdown);
    let mut engine = Engine::new().with_idle_hook(move |handle| {
        wait_for_events(&runtime, &hook_reactor, &mut shutdown, handle)
    });

    engine.start(move |handle| accept_loop(handle, reactor, service));
    info!("Coroutine server stopped");
    Ok(())
}

/// The idle context: sleeps until some socket is ready.
fn wait_for_events(runtime: &Runtime, reactor: &RefCell<Reactor>, shutdown: &mut Shutdown, handle: &Handle) {
    let mut reactor = reactor.borrow_mut();
    if reactor.stopping {
        return;
    }

    let woken = runtime.block_on(poll_fn(|cx| reactor.poll_events(cx, shutdown)));
    drop(reactor);

    trace!(count = woken.len(), "Waking coroutines");
    for id in woken {
        handle.unblock(id);
    }
}

async fn accept_loop(handle: Handle, reactor: Rc<RefCell<Reactor>>, service: Service) {
    loop {
        let next = reactor.borrow_mut().accepted.pop_front();
        let Some((stream, addr)) = next else {
            if reactor.borrow().stopping {
                break;
            }
            reactor.borrow_mut().acceptor = handle.current();
            handle.block(None).await;
            continue;
        };

        let session = service.session();
        let stats = Arc::clone(service.stats());
        stats.connection_opened();
        info!(client = %addr, "Client connected");

        let connection = Connection {
            handle: handle.clone(),
            reactor: Rc::clone(&reactor),
            stream: Rc::new(stream),
            addr,
        };
        let id = handle.spawn(async move {
            let result = connection.run(session, &stats).await;
            log_closed(&addr, &result);
            stats.connection_closed();
        });
        trace!(client = %addr, coroutine = %id, "Spawned connection coroutine");
    }

    debug!("Acceptor exiting");
}

struct Connection {
    handle: Handle,
    reactor: Rc<RefCell<Reactor>>,
    stream: Rc<TcpStream>,
    addr: SocketAddr,
}

impl Connection {
    /// Drives the session until it is finished, fails, or the server stops.
    async fn run(&self, mut session: Session, stats: &ConnectionStats) -> Result<(), ConnectionError> {
        self.stream.set_nodelay(true)?;
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            if self.reactor.borrow().stopping {
                return Ok(());
            }
            let mut progress = false;

            while session.wants_read() {
                match self.stream.try_read(&mut buf) {
                    Ok(0) => {
                        debug!(client = %self.addr, "Peer closed its side");
                        session.close_read();
                        progress = true;
                    }
                    Ok(n) => {
                        stats.bytes_read(n);
                        trace!(client = %self.addr, bytes = n, "Read data");
                        session.process(&buf[..n]);
                        progress = true;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e.into()),
                }
            }

            if session.wants_write() {
                let result = self.stream.try_write_vectored(&session.write_slices());
                match result {
                    Ok(0) => return Err(ConnectionError::ClientDisconnected),
                    Ok(n) => {
                        stats.bytes_written(n);
                        trace!(client = %self.addr, bytes = n, "Sent response");
                        session.advance(n);
                        progress = true;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e.into()),
                }
            }

            let (read, write) = (session.wants_read(), session.wants_write());
            if !read && !write {
                return Ok(());
            }

            if progress {
                self.handle.yield_now().await;
            } else {
                self.park(read, write).await;
            }
        }
    }

    /// Blocks until the idle hook sees the socket ready.
    async fn park(&self, read: bool, write: bool) {
        let Some(id) = self.handle.current() else {
            return;
        };
        self.reactor.borrow_mut().waiting.push(Waiter {
            id,
            stream: Rc::clone(&self.stream),
            read,
            write,
        });
        self.handle.block(None).await;
    }
}
