//! Cooperative Coroutine Engine
//!
//! A single-threaded scheduler for coroutines that only give up control at
//! explicit calls (`yield_now`, `sched`, `block`).
//!
//! ## Design
//!
//! Every coroutine is a boxed future. Its suspended state machine is the
//! saved execution point; switching means returning `Pending` to the driver
//! loop after recording where control should go next.
//!
//! ```text
//!                 ┌──────────────── driver loop (idle context) ───────────────┐
//!                 │                                                          │
//!                 │  next = requested target                                 │
//!                 │       | caller of a finished coroutine                   │
//!                 │       | alive head                                       │
//!                 │       | alive head after the idle hook                   │
//!                 │       | nothing -> start() returns                       │
//!                 └──────────────────────────────────────────────────────────┘
//!
//!   slots: [ ctx0 | ctx1 | ctx2 | free | ctx4 ]
//!
//!   alive:   head -> ctx4 <-> ctx0 <-> ctx2
//!   blocked: head -> ctx1
//! ```
//!
//! Contexts live in an arena and are threaded onto the `alive` or `blocked`
//! list through index links. A terminated coroutine leaves both lists and its
//! slot is reused under a new generation, so stale ids never alias.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use tracing::trace;

type Coroutine = Pin<Box<dyn Future<Output = ()>>>;

type IdleHook = Box<dyn FnMut(&Handle)>;

/// Identifies one coroutine for as long as it has not terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoroutineId {
    index: usize,
    generation: u64,
}

impl fmt::Display for CoroutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "co#{}.{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListKind {
    Alive,
    Blocked,
}

struct Ctx {
    list: ListKind,
    /// `None` while the driver is polling it
    future: Option<Coroutine>,
    /// Who switched to us with `sched`; gets control back when we finish
    caller: Option<CoroutineId>,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Slot {
    generation: u64,
    ctx: Option<Ctx>,
}

#[derive(Debug, Default, Clone, Copy)]
struct List {
    head: Option<usize>,
    len: usize,
}

#[derive(Debug, Clone, Copy)]
enum Switch {
    To(usize),
    Idle,
}

#[derive(Debug, Clone, Copy)]
enum Request {
    Yield,
    Sched(Option<CoroutineId>),
    Block(Option<CoroutineId>),
}

#[derive(Default)]
struct Inner {
    slots: Vec<Slot>,
    free: Vec<usize>,
    alive: List,
    blocked: List,
    current: Option<usize>,
    switch: Option<Switch>,
}

impl Inner {
    fn id_of(&self, index: usize) -> CoroutineId {
        CoroutineId {
            index,
            generation: self.slots[index].generation,
        }
    }

    /// Resolves an id to a live slot index.
    fn lookup(&self, id: CoroutineId) -> Option<usize> {
        let slot = self.slots.get(id.index)?;
        (slot.generation == id.generation && slot.ctx.is_some()).then_some(id.index)
    }

    fn lookup_or_panic(&self, id: CoroutineId) -> usize {
        match self.lookup(id) {
            Some(index) => index,
            None => panic!("coroutine {id} has terminated"),
        }
    }

    fn ctx(&self, index: usize) -> Option<&Ctx> {
        self.slots[index].ctx.as_ref()
    }

    fn ctx_mut(&mut self, index: usize) -> &mut Ctx {
        match self.slots[index].ctx.as_mut() {
            Some(ctx) => ctx,
            None => panic!("coroutine slot {index} is empty"),
        }
    }

    fn list_of(&self, index: usize) -> Option<ListKind> {
        self.ctx(index).map(|ctx| ctx.list)
    }

    fn list_mut(&mut self, kind: ListKind) -> &mut List {
        match kind {
            ListKind::Alive => &mut self.alive,
            ListKind::Blocked => &mut self.blocked,
        }
    }

    fn spawn(&mut self, future: Coroutine) -> CoroutineId {
        let ctx = Ctx {
            list: ListKind::Alive,
            future: Some(future),
            caller: None,
            prev: None,
            next: None,
        };

        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index].ctx = Some(ctx);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    ctx: Some(ctx),
                });
                self.slots.len() - 1
            }
        };

        self.link(ListKind::Alive, index);
        self.id_of(index)
    }

    /// Pushes a context onto the head of a list.
    fn link(&mut self, kind: ListKind, index: usize) {
        let old_head = self.list_mut(kind).head;
        {
            let ctx = self.ctx_mut(index);
            ctx.list = kind;
            ctx.prev = None;
            ctx.next = old_head;
        }
        if let Some(head) = old_head {
            self.ctx_mut(head).prev = Some(index);
        }
        let list = self.list_mut(kind);
        list.head = Some(index);
        list.len += 1;
    }

    /// Removes a context from whichever list it is on.
    fn unlink(&mut self, index: usize) {
        let (kind, prev, next) = {
            let ctx = self.ctx_mut(index);
            let links = (ctx.list, ctx.prev, ctx.next);
            ctx.prev = None;
            ctx.next = None;
            links
        };

        match prev {
            Some(prev) => self.ctx_mut(prev).next = next,
            None => self.list_mut(kind).head = next,
        }
        if let Some(next) = next {
            self.ctx_mut(next).prev = prev;
        }
        self.list_mut(kind).len -= 1;
    }

    fn move_to(&mut self, index: usize, kind: ListKind) {
        if self.list_of(index) != Some(kind) {
            self.unlink(index);
            self.link(kind, index);
        }
    }

    /// Frees a finished coroutine's slot and returns its caller.
    fn terminate(&mut self, index: usize) -> Option<CoroutineId> {
        self.unlink(index);
        let slot = &mut self.slots[index];
        let caller = slot.ctx.take().and_then(|ctx| ctx.caller);
        slot.generation += 1;
        self.free.push(index);
        caller
    }

    /// Records a switch away from the current coroutine.
    ///
    /// Returns `true` if the current coroutine must suspend.
    fn request(&mut self, request: Request) -> bool {
        match request {
            Request::Yield | Request::Sched(None) => self.request_yield(),
            Request::Sched(Some(id)) => {
                let target = self.lookup_or_panic(id);
                let Some(current) = self.current else {
                    return false;
                };
                if target == current {
                    return self.request_yield();
                }
                if self.list_of(target) == Some(ListKind::Blocked) {
                    trace!(target = %id, "Not scheduling a blocked coroutine");
                    return false;
                }
                let caller = self.id_of(current);
                self.ctx_mut(target).caller = Some(caller);
                self.switch = Some(Switch::To(target));
                trace!(from = %caller, to = %id, "Sched");
                true
            }
            Request::Block(target) => {
                let index = match target {
                    Some(id) => self.lookup_or_panic(id),
                    None => match self.current {
                        Some(current) => current,
                        None => return false,
                    },
                };
                self.move_to(index, ListKind::Blocked);
                trace!(coroutine = %self.id_of(index), "Blocked");

                if Some(index) == self.current {
                    self.switch = Some(Switch::Idle);
                    true
                } else {
                    false
                }
            }
        }
    }

    fn request_yield(&mut self) -> bool {
        let Some(current) = self.current else {
            return false;
        };

        let mut next = self.alive.head;
        if next == Some(current) {
            next = self.ctx(current).and_then(|ctx| ctx.next);
        }

        match next {
            Some(target) => {
                trace!(from = %self.id_of(current), to = %self.id_of(target), "Yield");
                self.switch = Some(Switch::To(target));
                true
            }
            None => false,
        }
    }
}

/// A future that suspends the current coroutine at most once.
///
/// Returned by [`Handle::yield_now`], [`Handle::sched`] and [`Handle::block`].
/// Nothing happens until it is awaited.
#[must_use = "coroutine switches only happen when awaited"]
pub struct Suspend {
    inner: Rc<RefCell<Inner>>,
    request: Request,
    suspended: bool,
}

impl Future for Suspend {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.suspended {
            return Poll::Ready(());
        }

        if this.inner.borrow_mut().request(this.request) {
            this.suspended = true;
            Poll::Pending
        } else {
            Poll::Ready(())
        }
    }
}

impl fmt::Debug for Suspend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suspend")
            .field("request", &self.request)
            .field("suspended", &self.suspended)
            .finish()
    }
}

/// A cloneable reference to an [`Engine`], usable from inside coroutines.
#[derive(Clone)]
pub struct Handle {
    inner: Rc<RefCell<Inner>>,
}

impl Handle {
    /// Creates a new alive coroutine at the head of the alive list.
    ///
    /// It does not run until something switches to it.
    pub fn spawn<F>(&self, future: F) -> CoroutineId
    where
        F: Future<Output = ()> + 'static,
    {
        let id = self.inner.borrow_mut().spawn(Box::pin(future));
        trace!(coroutine = %id, "Spawned");
        id
    }

    /// Switches to another alive coroutine, if there is one.
    ///
    /// Picks the alive head, or the coroutine after it when the current one is
    /// the head. Returns at once when no other coroutine is alive.
    pub fn yield_now(&self) -> Suspend {
        self.suspend(Request::Yield)
    }

    /// Switches to `target` and makes the current coroutine its caller.
    ///
    /// `None` or the current coroutine behaves like [`yield_now`](Self::yield_now).
    /// A blocked target is not run.
    ///
    /// # Panics
    ///
    /// Panics when awaited if `target` has terminated.
    pub fn sched(&self, target: Option<CoroutineId>) -> Suspend {
        self.suspend(Request::Sched(target))
    }

    /// Moves `target` (or the current coroutine) to the blocked list.
    ///
    /// When the current coroutine blocks itself, control passes to the idle
    /// context until someone calls [`unblock`](Self::unblock).
    ///
    /// # Panics
    ///
    /// Panics when awaited if `target` has terminated.
    pub fn block(&self, target: Option<CoroutineId>) -> Suspend {
        self.suspend(Request::Block(target))
    }

    /// Moves a blocked coroutine back to the head of the alive list.
    ///
    /// Does not switch to it. Returns `false` if `id` was not blocked.
    pub fn unblock(&self, id: CoroutineId) -> bool {
        let mut inner = self.inner.borrow_mut();
        match inner.lookup(id) {
            Some(index) if inner.list_of(index) == Some(ListKind::Blocked) => {
                inner.move_to(index, ListKind::Alive);
                trace!(coroutine = %id, "Unblocked");
                true
            }
            _ => false,
        }
    }

    /// Returns the running coroutine, or `None` in the idle context.
    pub fn current(&self) -> Option<CoroutineId> {
        let inner = self.inner.borrow();
        inner.current.map(|index| inner.id_of(index))
    }

    /// True if `id` is on the alive list (running or ready to run).
    pub fn is_alive(&self, id: CoroutineId) -> bool {
        self.list_of(id) == Some(ListKind::Alive)
    }

    /// True if `id` waits for [`unblock`](Self::unblock).
    pub fn is_blocked(&self, id: CoroutineId) -> bool {
        self.list_of(id) == Some(ListKind::Blocked)
    }

    /// Number of coroutines on the alive list.
    pub fn alive_count(&self) -> usize {
        self.inner.borrow().alive.len
    }

    /// Number of coroutines on the blocked list.
    pub fn blocked_count(&self) -> usize {
        self.inner.borrow().blocked.len
    }

    fn list_of(&self, id: CoroutineId) -> Option<ListKind> {
        let inner = self.inner.borrow();
        inner.lookup(id).and_then(|index| inner.list_of(index))
    }

    fn suspend(&self, request: Request) -> Suspend {
        Suspend {
            inner: Rc::clone(&self.inner),
            request,
            suspended: false,
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("current", &self.current())
            .field("alive", &self.alive_count())
            .field("blocked", &self.blocked_count())
            .finish()
    }
}

/// Coroutines are resumed by the driver loop, never by wakeups.
struct NoopWake;

impl Wake for NoopWake {
    fn wake(self: Arc<Self>) {}
}

/// Owns the coroutines and runs the scheduling loop.
///
/// # Example
///
/// ```
/// use lrukv::coroutine::Engine;
/// use std::cell::RefCell;
/// use std::rc::Rc;
///
/// let log = Rc::new(RefCell::new(Vec::new()));
/// let mut engine = Engine::new();
///
/// let main_log = Rc::clone(&log);
/// engine.start(move |handle| async move {
///     let peer_log = Rc::clone(&main_log);
///     let peer = handle.clone();
///     handle.spawn(async move {
///         peer_log.borrow_mut().push("peer");
///         peer.yield_now().await;
///     });
///
///     main_log.borrow_mut().push("main");
///     handle.yield_now().await;
///     main_log.borrow_mut().push("main again");
/// });
///
/// assert_eq!(*log.borrow(), ["main", "peer", "main again"]);
/// ```
pub struct Engine {
    inner: Rc<RefCell<Inner>>,
    idle_hook: Option<IdleHook>,
}

impl Engine {
    /// Creates an empty engine without an idle hook.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner::default())),
            idle_hook: None,
        }
    }

    /// Installs a hook the idle context calls when no coroutine is alive.
    ///
    /// The hook may unblock coroutines; if it doesn't, `start` returns.
    pub fn with_idle_hook(mut self, hook: impl FnMut(&Handle) + 'static) -> Self {
        self.idle_hook = Some(Box::new(hook));
        self
    }

    /// Returns a handle for spawning and inspecting coroutines.
    ///
    /// Coroutines spawned before [`start`](Self::start) run once it begins.
    pub fn handle(&self) -> Handle {
        Handle {
            inner: Rc::clone(&self.inner),
        }
    }

    /// Runs `main` as the first coroutine and schedules until nothing is
    /// alive.
    ///
    /// Coroutines still blocked when `start` returns stay in the engine.
    pub fn start<F, Fut>(&mut self, main: F)
    where
        F: FnOnce(Handle) -> Fut,
        Fut: Future<Output = ()> + 'static,
    {
        let handle = self.handle();
        let main_id = handle.spawn(main(handle.clone()));
        trace!(coroutine = %main_id, "Engine starting");

        let waker = Waker::from(Arc::new(NoopWake));
        let mut cx = Context::from_waker(&waker);

        let mut next = Some(main_id.index);
        loop {
            let target = match next.take() {
                Some(target) => target,
                None => match self.pick_idle(&handle) {
                    Some(target) => target,
                    None => break,
                },
            };
            next = self.resume(target, &mut cx);
        }

        trace!(blocked = handle.blocked_count(), "Engine finished");
    }

    /// What the idle context runs next.
    fn pick_idle(&mut self, handle: &Handle) -> Option<usize> {
        if let Some(head) = self.inner.borrow().alive.head {
            return Some(head);
        }
        if let Some(hook) = self.idle_hook.as_mut() {
            hook(handle);
        }
        self.inner.borrow().alive.head
    }

    /// Polls one coroutine and returns where control goes next
    /// (`None` is the idle context).
    fn resume(&mut self, index: usize, cx: &mut Context<'_>) -> Option<usize> {
        let mut future = {
            let mut inner = self.inner.borrow_mut();
            inner.current = Some(index);
            inner.switch = None;
            match inner.ctx_mut(index).future.take() {
                Some(future) => future,
                None => panic!("coroutine slot {index} resumed while running"),
            }
        };

        // No borrow may be held here: the coroutine calls back into the engine
        let poll = future.as_mut().poll(cx);

        let mut inner = self.inner.borrow_mut();
        inner.current = None;
        let switch = inner.switch.take();

        match poll {
            Poll::Ready(()) => {
                let id = inner.id_of(index);
                let caller = inner.terminate(index);
                trace!(coroutine = %id, "Terminated");
                drop(inner);
                drop(future);

                let inner = self.inner.borrow();
                caller
                    .and_then(|caller| inner.lookup(caller))
                    .filter(|&caller| inner.list_of(caller) == Some(ListKind::Alive))
            }
            Poll::Pending => {
                inner.ctx_mut(index).future = Some(future);
                match switch {
                    Some(Switch::To(target)) => Some(target),
                    Some(Switch::Idle) | None => None,
                }
            }
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Coroutines hold handles back into the engine; break the cycle
        let slots = mem::take(&mut self.inner.borrow_mut().slots);
        drop(slots);
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("handle", &self.handle())
            .field("idle_hook", &self.idle_hook.is_some())
            .finish()
    }
}
