//! Event-loop bridge.
//!
//! One loop per cord. The readiness backend is [`mio`]; on top of it the
//! bridge provides the four watcher kinds the runtime consumes:
//!
//! - **io** — an fd plus an interest; the owning fiber is woken when the fd
//!   becomes ready;
//! - **timer** — a one-shot deadline waking a fiber and recording that the
//!   wait timed out;
//! - **idle** — while any idle watcher is active the loop polls with a zero
//!   timeout instead of sleeping (this is what makes `sleep(0)` not stall on
//!   the poller's minimum wait);
//! - **async** — the only cross-thread entry point: an atomic flag paired
//!   with a [`mio::Waker`]; `send` may be called from any thread, the
//!   callback runs on the loop's own thread.
//!
//! Each iteration polls, refreshes the cached monotonic `now`, dispatches io
//! events, expires timers, runs pending async callbacks, and finally drains
//! the cord's ready-list.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering as MemOrdering};
use std::sync::Arc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use slab::Slab;

use crate::clock;
use crate::fiber::Fiber;

const WAKER_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 1024;

/// Timeouts at or above this many seconds mean "wait forever".
pub(crate) const INFINITY_SECONDS: f64 = 100.0 * 365.0 * 24.0 * 60.0 * 60.0;

#[inline]
pub(crate) fn to_seconds(timeout: Duration) -> f64 {
    timeout.as_secs_f64().min(INFINITY_SECONDS)
}

#[inline]
pub(crate) fn is_infinite(delay: f64) -> bool {
    delay >= INFINITY_SECONDS
}

////////////////////////////////////////////////////////////////////////////////
// Watcher state
////////////////////////////////////////////////////////////////////////////////

struct IoWatcher {
    fd: RawFd,
    fiber: Rc<Fiber>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct IoWatcherId(usize);

/// Shared state of a one-shot timer. The waiter keeps it to read the verdict
/// after the yield; the heap keeps it to deliver the expiry. `stop` simply
/// disarms: the heap entry stays behind and is discarded when its deadline
/// comes up.
pub(crate) struct TimerState {
    fiber: RefCell<Option<Rc<Fiber>>>,
    timed_out: Cell<bool>,
    armed: Cell<bool>,
}

impl TimerState {
    #[inline]
    pub fn timed_out(&self) -> bool {
        self.timed_out.get()
    }
}

struct TimerEnt {
    deadline: f64,
    seq: u64,
    state: Rc<TimerState>,
}

impl PartialEq for TimerEnt {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl Eq for TimerEnt {}

impl PartialOrd for TimerEnt {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap is a max-heap; invert so the nearest deadline is on top.
impl Ord for TimerEnt {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .total_cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct AsyncWatcher {
    pending: Arc<AtomicBool>,
    cb: Rc<dyn Fn()>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct AsyncId(usize);

/// Cross-thread half of an async watcher.
#[derive(Clone)]
pub(crate) struct AsyncHandle {
    pending: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl AsyncHandle {
    /// Request the watcher's callback to run on the loop thread. Callable
    /// from any thread; coalesces with other pending sends.
    pub fn send(&self) {
        self.pending.store(true, MemOrdering::Release);
        // A failed wake leaves the flag set; the loop picks it up on its
        // next natural iteration.
        let _ = self.waker.wake();
    }
}

////////////////////////////////////////////////////////////////////////////////
// Loop
////////////////////////////////////////////////////////////////////////////////

pub(crate) struct Loop {
    poll: RefCell<Poll>,
    registry: Registry,
    events: RefCell<Events>,
    waker: Arc<Waker>,
    io: RefCell<Slab<IoWatcher>>,
    timers: RefCell<BinaryHeap<TimerEnt>>,
    timer_seq: Cell<u64>,
    asyncs: RefCell<Slab<AsyncWatcher>>,
    now: Cell<f64>,
    idle: Cell<u32>,
    break_flag: Cell<bool>,
}

impl Loop {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(Self {
            poll: RefCell::new(poll),
            registry,
            events: RefCell::new(Events::with_capacity(EVENTS_CAPACITY)),
            waker,
            io: RefCell::new(Slab::new()),
            timers: RefCell::new(BinaryHeap::new()),
            timer_seq: Cell::new(0),
            asyncs: RefCell::new(Slab::new()),
            now: Cell::new(clock::monotonic()),
            idle: Cell::new(0),
            break_flag: Cell::new(false),
        })
    }

    /// Monotonic time cached at the start of the current loop iteration.
    #[inline]
    pub fn now(&self) -> f64 {
        self.now.get()
    }

    #[inline]
    pub fn update_now(&self) {
        self.now.set(clock::monotonic());
    }

    ////////////////////////////////////////////////////////////////////////
    // io watchers
    ////////////////////////////////////////////////////////////////////////

    pub fn io_start(&self, fd: RawFd, interest: Interest, fiber: Rc<Fiber>) -> io::Result<IoWatcherId> {
        let mut io = self.io.borrow_mut();
        let entry = io.vacant_entry();
        let token = Token(entry.key());
        self.registry.register(&mut SourceFd(&fd), token, interest)?;
        entry.insert(IoWatcher { fd, fiber });
        Ok(IoWatcherId(token.0))
    }

    pub fn io_stop(&self, id: IoWatcherId) {
        let mut io = self.io.borrow_mut();
        if io.contains(id.0) {
            let w = io.remove(id.0);
            let _ = self.registry.deregister(&mut SourceFd(&w.fd));
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // timers
    ////////////////////////////////////////////////////////////////////////

    pub fn timer_start(&self, delay: f64, fiber: Rc<Fiber>) -> Rc<TimerState> {
        let state = Rc::new(TimerState {
            fiber: RefCell::new(Some(fiber)),
            timed_out: Cell::new(false),
            armed: Cell::new(true),
        });
        let seq = self.timer_seq.get();
        self.timer_seq.set(seq + 1);
        self.timers.borrow_mut().push(TimerEnt {
            deadline: self.now() + delay,
            seq,
            state: state.clone(),
        });
        state
    }

    pub fn timer_stop(&self, state: &Rc<TimerState>) {
        state.armed.set(false);
        state.fiber.borrow_mut().take();
    }

    ////////////////////////////////////////////////////////////////////////
    // idle
    ////////////////////////////////////////////////////////////////////////

    pub fn idle_start(&self) {
        self.idle.set(self.idle.get() + 1);
    }

    pub fn idle_stop(&self) {
        let n = self.idle.get();
        debug_assert!(n > 0);
        self.idle.set(n.saturating_sub(1));
    }

    ////////////////////////////////////////////////////////////////////////
    // async watchers
    ////////////////////////////////////////////////////////////////////////

    pub fn async_register(&self, cb: Rc<dyn Fn()>) -> AsyncId {
        let key = self.asyncs.borrow_mut().insert(AsyncWatcher {
            pending: Arc::new(AtomicBool::new(false)),
            cb,
        });
        AsyncId(key)
    }

    pub fn async_unregister(&self, id: AsyncId) {
        let mut asyncs = self.asyncs.borrow_mut();
        if asyncs.contains(id.0) {
            asyncs.remove(id.0);
        }
    }

    pub fn async_handle(&self, id: AsyncId) -> AsyncHandle {
        AsyncHandle {
            pending: self.asyncs.borrow()[id.0].pending.clone(),
            waker: self.waker.clone(),
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // running
    ////////////////////////////////////////////////////////////////////////

    pub fn break_loop(&self) {
        self.break_flag.set(true);
        let _ = self.waker.wake();
    }

    /// Run until [`break_loop`](Self::break_loop) is called.
    pub fn run(&self) {
        while !self.break_flag.get() {
            self.run_once();
        }
        self.break_flag.set(false);
    }

    /// One loop iteration: poll, dispatch, drain the ready-list.
    pub fn run_once(&self) {
        let timeout = self.poll_timeout();
        {
            let mut poll = self.poll.borrow_mut();
            let mut events = self.events.borrow_mut();
            match poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => panic!("event loop poll failed: {e}"),
            }
        }
        self.update_now();

        // fd readiness
        let mut woken: Vec<Rc<Fiber>> = Vec::new();
        {
            let events = self.events.borrow();
            let io = self.io.borrow();
            for event in events.iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    continue;
                }
                if let Some(w) = io.get(token.0) {
                    woken.push(w.fiber.clone());
                }
            }
        }
        for fiber in woken {
            fiber.wakeup();
        }

        // expired timers
        loop {
            let ent = {
                let mut timers = self.timers.borrow_mut();
                match timers.peek() {
                    Some(t) if t.deadline <= self.now.get() => timers.pop(),
                    _ => None,
                }
            };
            let Some(ent) = ent else { break };
            if ent.state.armed.replace(false) {
                ent.state.timed_out.set(true);
                if let Some(fiber) = ent.state.fiber.borrow_mut().take() {
                    fiber.wakeup();
                }
            }
        }

        // async watchers
        let pending: Vec<Rc<dyn Fn()>> = self
            .asyncs
            .borrow()
            .iter()
            .filter(|(_, w)| w.pending.swap(false, MemOrdering::AcqRel))
            .map(|(_, w)| w.cb.clone())
            .collect();
        for cb in pending {
            cb();
        }

        // run the fibers made ready by the dispatch above
        crate::fiber::schedule_ready();
    }

    fn poll_timeout(&self) -> Option<Duration> {
        if self.break_flag.get() {
            return Some(Duration::ZERO);
        }
        if crate::cord::cord().has_ready() || self.idle.get() > 0 {
            return Some(Duration::ZERO);
        }
        let timers = self.timers.borrow();
        timers
            .peek()
            .map(|t| Duration::from_secs_f64((t.deadline - self.now.get()).max(0.0)))
    }
}

////////////////////////////////////////////////////////////////////////////////
// Deadline
////////////////////////////////////////////////////////////////////////////////

/// A shared `(start, delay)` pair for composite blocking operations: computed
/// once at entry, every retry subtracts the time already spent, so the
/// cumulative deadline is honoured across multiple yields.
pub(crate) struct Deadline {
    start: f64,
    timeout: f64,
}

impl Deadline {
    pub fn new(timeout: f64) -> Self {
        Self {
            start: crate::cord::cord().ev.now(),
            timeout,
        }
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.timeout == 0.0
    }

    pub fn remaining(&self) -> f64 {
        if is_infinite(self.timeout) {
            return self.timeout;
        }
        let elapsed = crate::cord::cord().ev.now() - self.start;
        (self.timeout - elapsed).max(0.0)
    }

    pub fn expired(&self) -> bool {
        !is_infinite(self.timeout) && self.remaining() <= 0.0
    }

    pub fn remaining_duration(&self) -> Duration {
        Duration::from_secs_f64(self.remaining())
    }
}
