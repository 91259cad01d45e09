//! Cooperative multitasking.
//!
//! A fiber is a set of instructions executed with cooperative multitasking:
//! it owns its stack, runs until it yields, and is resumed by the scheduler
//! of the [cord](crate::cord) it was created on. Use [`Builder`] (or the
//! [`start`]/[`defer`] free functions) to spawn fibers, [`JoinHandle::join`]
//! to wait for them, [`sleep`]/[`yield_now`] to give up the CPU, and
//! [`Fiber::cancel`] to ask a fiber to stop.
//!
//! Cancellation is advisory: it sets a flag and wakes the target, which
//! observes it at its next cancellation point ([`testcancel`], or any
//! blocking I/O primitive). A fiber that never blocks and never checks the
//! flag cannot be cancelled.
//!
//! Fibers of one cord never run in parallel; a data structure touched only
//! between two yield points needs no locking at all.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::mem;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::coro::{self, Context, Stack};
use crate::cord::cord;
use crate::error::{Diag, Error, Result};
use crate::ev;
use crate::region::Region;

pub mod channel;
pub mod mutex;

pub use channel::{Channel, RecvError, SendError, TryRecvError, TrySendError};
pub use mutex::{Latch, LatchGuard, Mutex};

/// Numeric fiber id, unique within a cord. Ids 1..=100 are reserved for the
/// runtime (1 is the sched fiber); 0 means "no fiber".
pub type FiberId = u32;

const FIBER_NAME_MAXLEN: usize = 32;

/// Fibers whose scratch region grew beyond this many bytes get it freed by
/// [`gc`] instead of merely reset.
const GC_THRESHOLD: usize = 128 * 1024;

bitflags::bitflags! {
    struct Flags: u8 {
        /// Scheduled for execution: the fiber is on the cord's ready-list
        /// (or in the call chain currently being drained).
        const READY       = 0x01;
        const DEAD        = 0x02;
        const CANCELLABLE = 0x04;
        const CANCELLED   = 0x08;
        const JOINABLE    = 0x10;
    }
}

const DEFAULT_FLAGS: Flags = Flags::CANCELLABLE;

/// Keys of the fixed per-fiber local-storage slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum FiberKey {
    /// Session of the client this fiber serves.
    Session = 0,
    /// Free-form consumer storage.
    Storage = 1,
    /// Wait pad of a pending channel operation.
    ChannelWaitPad = 2,
}

const FLS_SLOTS: usize = 3;

////////////////////////////////////////////////////////////////////////////////
// WaitQueue
////////////////////////////////////////////////////////////////////////////////

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// FIFO list of parked fibers.
///
/// A fiber can wait on at most one queue at a time. Instead of an intrusive
/// link, each fiber carries the id of the queue it is parked on
/// (`parked_on`); [`Fiber::wakeup`] clears the id, which detaches the fiber
/// from *whatever* queue holds it without that queue's cooperation.
/// Queue owners discard entries whose id no longer matches before acting on
/// them, so an asynchronously woken (e.g. cancelled) fiber can never be
/// handed a message or a lock it is no longer waiting for.
pub(crate) struct WaitQueue {
    id: u64,
    list: RefCell<VecDeque<Rc<Fiber>>>,
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            list: RefCell::new(VecDeque::new()),
        }
    }

    pub fn park_tail(&self, f: &Rc<Fiber>) {
        f.parked_on.set(self.id);
        self.list.borrow_mut().push_back(f.clone());
    }

    pub fn park_head(&self, f: &Rc<Fiber>) {
        f.parked_on.set(self.id);
        self.list.borrow_mut().push_front(f.clone());
    }

    /// Re-assert the wait marker of a fiber that is already queued (used by
    /// waiters that loop over spurious wakeups without losing their place).
    pub fn re_mark(&self, f: &Fiber) {
        f.parked_on.set(self.id);
    }

    /// Remove `f`'s entry, wherever it is in the queue. No-op if the entry
    /// is already gone.
    pub fn unlink(&self, f: &Rc<Fiber>) {
        let mut list = self.list.borrow_mut();
        if let Some(pos) = list.iter().position(|x| Rc::ptr_eq(x, f)) {
            list.remove(pos);
        }
        if f.parked_on.get() == self.id {
            f.parked_on.set(0);
        }
    }

    fn prune(&self, list: &mut VecDeque<Rc<Fiber>>) {
        while let Some(front) = list.front() {
            if front.parked_on.get() == self.id {
                break;
            }
            list.pop_front();
        }
    }

    /// First fiber still genuinely parked here, if any.
    pub fn first(&self) -> Option<Rc<Fiber>> {
        let mut list = self.list.borrow_mut();
        self.prune(&mut list);
        list.front().cloned()
    }

    /// Dequeue the first genuinely parked fiber.
    pub fn take_first(&self) -> Option<Rc<Fiber>> {
        let mut list = self.list.borrow_mut();
        self.prune(&mut list);
        let f = list.pop_front()?;
        f.parked_on.set(0);
        Some(f)
    }

    /// Whether `f`'s entry is at the head of the queue. Does not prune:
    /// queues that use positional ownership (the latch) keep entries of
    /// running fibers at the head.
    pub fn front_is(&self, f: &Rc<Fiber>) -> bool {
        self.list
            .borrow()
            .front()
            .is_some_and(|x| Rc::ptr_eq(x, f))
    }

    /// The head entry regardless of its wait marker. Positional queues use
    /// this: an entry whose fiber was woken (marker cleared) still holds
    /// its place in line.
    pub fn front_raw(&self) -> Option<Rc<Fiber>> {
        self.list.borrow().front().cloned()
    }

    pub fn pop_front(&self) -> Option<Rc<Fiber>> {
        let f = self.list.borrow_mut().pop_front()?;
        if f.parked_on.get() == self.id {
            f.parked_on.set(0);
        }
        Some(f)
    }

    pub fn is_empty(&self) -> bool {
        self.list.borrow().is_empty()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Fiber
////////////////////////////////////////////////////////////////////////////////

/// A cooperative task scheduled on the current cord.
///
/// `Fiber` values are handled through `Rc` and never cross threads. The
/// methods taking `&self` are safe to call from any fiber of the owning
/// cord, including the target itself.
pub struct Fiber {
    fid: Cell<FiberId>,
    name: RefCell<String>,
    flags: Cell<Flags>,
    csw: Cell<u64>,
    ctx: Context,
    stack: Option<Stack>,
    default_stack: bool,
    /// The body of the current life; taken by the fiber loop on start.
    entry: RefCell<Option<Box<dyn FnOnce() -> i32>>>,
    f_ret: Cell<i32>,
    diag: Diag,
    /// Fiber control transfers to on the next yield; `None` means sched.
    caller: RefCell<Option<Rc<Fiber>>>,
    /// Fibers waiting in `join` on this one.
    wake: WaitQueue,
    /// Id of the wait queue this fiber is currently parked on (0 = none).
    parked_on: Cell<u64>,
    on_yield: RefCell<Vec<Box<dyn FnMut()>>>,
    on_stop: RefCell<Vec<Box<dyn FnOnce()>>>,
    fls: [Cell<*mut ()>; FLS_SLOTS],
    gc: Region,
    self_ref: Weak<Fiber>,
}

impl Fiber {
    fn alloc(stack_size: Option<usize>) -> Result<Rc<Fiber>> {
        let stack = Stack::new(stack_size.unwrap_or(coro::DEFAULT_STACK_SIZE))?;
        let ctx = Context::new();
        coro::prepare(&ctx, &stack, fiber_trampoline);
        Ok(Rc::new_cyclic(|self_ref| Fiber {
            fid: Cell::new(0),
            name: RefCell::new(String::new()),
            flags: Cell::new(DEFAULT_FLAGS),
            csw: Cell::new(0),
            ctx,
            stack: Some(stack),
            default_stack: stack_size.is_none(),
            entry: RefCell::new(None),
            f_ret: Cell::new(0),
            diag: Diag::new(),
            caller: RefCell::new(None),
            wake: WaitQueue::new(),
            parked_on: Cell::new(0),
            on_yield: RefCell::new(Vec::new()),
            on_stop: RefCell::new(Vec::new()),
            fls: Default::default(),
            gc: Region::new(),
            self_ref: self_ref.clone(),
        }))
    }

    /// The sched fiber runs on the thread's own stack; its context is filled
    /// in by the first transfer away from it.
    pub(crate) fn new_sched() -> Rc<Fiber> {
        let f = Rc::new_cyclic(|self_ref| Fiber {
            fid: Cell::new(1),
            name: RefCell::new("sched".into()),
            flags: Cell::new(DEFAULT_FLAGS),
            csw: Cell::new(0),
            ctx: Context::new(),
            stack: None,
            default_stack: true,
            entry: RefCell::new(None),
            f_ret: Cell::new(0),
            diag: Diag::new(),
            caller: RefCell::new(None),
            wake: WaitQueue::new(),
            parked_on: Cell::new(0),
            on_yield: RefCell::new(Vec::new()),
            on_stop: RefCell::new(Vec::new()),
            fls: Default::default(),
            gc: Region::new(),
            self_ref: self_ref.clone(),
        });
        f
    }

    #[inline]
    fn flags(&self) -> Flags {
        self.flags.get()
    }

    #[inline]
    fn insert_flag(&self, flag: Flags) {
        self.flags.set(self.flags.get() | flag);
    }

    #[inline]
    fn remove_flag(&self, flag: Flags) {
        self.flags.set(self.flags.get() - flag);
    }

    #[inline]
    fn rc(&self) -> Rc<Fiber> {
        self.self_ref.upgrade().expect("fiber outlived its own Rc")
    }

    /// Numeric id, 0 for a recycled fiber.
    #[inline]
    pub fn id(&self) -> FiberId {
        self.fid.get()
    }

    pub fn name(&self) -> String {
        self.name.borrow().clone()
    }

    pub fn set_name(&self, name: &str) {
        let mut truncated = String::with_capacity(name.len().min(FIBER_NAME_MAXLEN));
        for c in name.chars() {
            if truncated.len() + c.len_utf8() > FIBER_NAME_MAXLEN {
                break;
            }
            truncated.push(c);
        }
        *self.name.borrow_mut() = truncated;
    }

    /// Context switches into this fiber so far.
    #[inline]
    pub fn csw(&self) -> u64 {
        self.csw.get()
    }

    #[inline]
    pub fn is_dead(&self) -> bool {
        self.flags().contains(Flags::DEAD)
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.flags().contains(Flags::CANCELLED)
    }

    /// The fiber's diagnostics area: the last error of its body.
    #[inline]
    pub fn diag(&self) -> &Diag {
        &self.diag
    }

    /// Per-fiber scratch region, trimmed by [`gc`].
    #[inline]
    pub fn region(&self) -> &Region {
        &self.gc
    }

    /// Usable stack size; 0 for the sched fiber, which runs on the
    /// thread's own stack.
    pub fn stack_size(&self) -> usize {
        self.stack.as_ref().map_or(0, Stack::size)
    }

    /// Schedule the fiber for execution. Idempotent: waking a fiber that is
    /// already scheduled (or dead) does nothing. If the fiber is parked on a
    /// wait queue it is detached from it first, so a wakeup always wins over
    /// whatever the fiber was waiting for.
    pub fn wakeup(&self) {
        if self.flags().intersects(Flags::READY | Flags::DEAD) {
            return;
        }
        self.parked_on.set(0);
        cord().push_ready(self.rc());
        self.insert_flag(Flags::READY);
    }

    /// Request cancellation. Asynchronous: the target observes it at its
    /// next cancellation point. Dead fibers swallow the request so the cause
    /// of death in their diag is preserved.
    pub fn cancel(&self) {
        debug_assert_ne!(self.id(), 0);
        if self.is_dead() {
            return;
        }
        self.insert_flag(Flags::CANCELLED);
        let self_is_current = ptr::eq(self, Rc::as_ptr(&cord().current_rc()));
        if !self_is_current && self.flags().contains(Flags::CANCELLABLE) {
            self.wakeup();
        }
    }

    /// Make the fiber joinable (or not). Must be called before the fiber
    /// terminates.
    pub fn set_joinable(&self, yes: bool) {
        if yes {
            self.insert_flag(Flags::JOINABLE);
        } else {
            self.remove_flag(Flags::JOINABLE);
        }
    }

    /// Run `cb` when this fiber's body terminates (before it is recycled).
    pub fn on_stop(&self, cb: impl FnOnce() + 'static) {
        self.on_stop.borrow_mut().push(Box::new(cb));
    }

    /// Run `cb` every time this fiber yields. The callback must not yield
    /// and must not panic.
    pub fn on_yield(&self, cb: impl FnMut() + 'static) {
        self.on_yield.borrow_mut().push(Box::new(cb));
    }

    /// Store an opaque pointer in one of the fiber-local slots.
    ///
    /// # Safety
    ///
    /// The caller owns the pointed-to data and must keep it valid for as
    /// long as the slot holds the pointer.
    pub unsafe fn set_key(&self, key: FiberKey, value: *mut ()) {
        self.fls[key as usize].set(value);
    }

    pub fn get_key(&self, key: FiberKey) -> *mut () {
        self.fls[key as usize].get()
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("fid", &self.fid.get())
            .field("name", &*self.name.borrow())
            .finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Scheduler internals
////////////////////////////////////////////////////////////////////////////////

/// Create (or take from the dead-fiber cache) a fiber ready to be started.
pub(crate) fn fiber_new(name: &str, stack_size: Option<usize>) -> Result<Rc<Fiber>> {
    let cord = cord();
    let fiber = match stack_size {
        None => cord.take_dead(),
        Some(_) => None,
    };
    let fiber = match fiber {
        Some(f) => f,
        None => match Fiber::alloc(stack_size) {
            Ok(f) => f,
            Err(e) => {
                cord.current_rc().diag().set(Error::OutOfMemory {
                    requested: stack_size.unwrap_or(coro::DEFAULT_STACK_SIZE),
                    object: "fiber",
                });
                return Err(e);
            }
        },
    };
    fiber.fid.set(cord.next_fid());
    fiber.set_name(name);
    cord.register(fiber.clone());
    Ok(fiber)
}

/// Create a fiber with its entry installed but don't schedule it yet; the
/// caller decides between an immediate call and a deferred wakeup.
pub(crate) fn spawn_prepared(
    name: &str,
    stack_size: Option<usize>,
    joinable: bool,
    entry: Box<dyn FnOnce() -> i32>,
) -> Result<Rc<Fiber>> {
    let f = fiber_new(name, stack_size)?;
    f.set_joinable(joinable);
    *f.entry.borrow_mut() = Some(entry);
    Ok(f)
}

/// Transfer control into `callee` right now, making the current fiber its
/// caller (the fiber `callee` yields back to).
pub(crate) fn call(callee: &Rc<Fiber>) {
    let cur = cord().current_rc();
    debug_assert!(!cur.flags().contains(Flags::READY));
    debug_assert!(!callee.flags().contains(Flags::READY));
    *callee.caller.borrow_mut() = Some(cur.clone());
    callee.insert_flag(Flags::READY);
    cur.insert_flag(Flags::READY);
    drop(cur);
    call_impl(callee);
}

fn call_impl(callee: &Rc<Fiber>) {
    let cord = cord();
    let caller = cord.current_rc();
    debug_assert!(
        callee.flags().contains(Flags::READY) || Rc::ptr_eq(callee, &cord.sched),
        "switching to a fiber that is not scheduled"
    );
    debug_assert!(!callee.is_dead(), "switching to a dead fiber");
    debug_assert_eq!(callee.parked_on.get(), 0);
    debug_assert!(!Rc::ptr_eq(&caller, callee));

    cord.set_current(callee.clone());
    callee.remove_flag(Flags::READY);
    callee.csw.set(callee.csw.get() + 1);

    // Keep only a raw pointer to the suspending side: an `Rc` of itself
    // frozen on its own stack would keep the fiber alive forever. The fiber
    // is anchored by the registry (or the dead list) while suspended.
    let caller_ptr: *const Fiber = Rc::as_ptr(&caller);
    drop(caller);
    unsafe { coro::transfer(&(*caller_ptr).ctx, &callee.ctx) };
}

/// Yield: transfer to the caller (the sched fiber, unless this fiber was
/// entered via an explicit call chain).
pub fn yield_now() {
    let cord = cord();
    let caller = cord.current_rc();
    assert!(
        !Rc::ptr_eq(&caller, &cord.sched),
        "the sched fiber must not yield"
    );
    let callee = caller
        .caller
        .borrow_mut()
        .take()
        .unwrap_or_else(|| cord.sched.clone());

    // By convention these must neither yield nor panic.
    for cb in caller.on_yield.borrow_mut().iter_mut() {
        cb();
    }

    debug_assert!(callee.flags().contains(Flags::READY) || Rc::ptr_eq(&callee, &cord.sched));
    debug_assert!(!callee.is_dead());

    cord.set_current(callee.clone());
    callee.csw.set(callee.csw.get() + 1);
    callee.remove_flag(Flags::READY);

    let caller_ptr: *const Fiber = Rc::as_ptr(&caller);
    drop(caller);
    unsafe { coro::transfer(&(*caller_ptr).ctx, &callee.ctx) };
}

/// Yield and come back either on [`Fiber::wakeup`] or when `delay` elapses.
/// Returns `true` if the timer fired first.
pub(crate) fn yield_timeout_seconds(delay: f64) -> bool {
    if ev::is_infinite(delay) {
        yield_now();
        return false;
    }
    let cord = cord();
    let timer = cord.ev.timer_start(delay, cord.current_rc());
    yield_now();
    cord.ev.timer_stop(&timer);
    timer.timed_out()
}

/// Yield for at most `timeout`. Returns `true` on timeout, `false` if the
/// fiber was woken up explicitly. A zero timeout yields exactly once: the
/// timer fires on the next loop iteration.
pub fn yield_timeout(timeout: Duration) -> bool {
    yield_timeout_seconds(ev::to_seconds(timeout))
}

/// Put the current fiber to sleep for at least `time`.
///
/// `sleep(Duration::ZERO)` yields to every other ready fiber and to the
/// event loop once, then resumes: an idle watcher forces the loop to poll
/// with a zero timeout so the sleep does not inherit the poller's minimum
/// wait.
pub fn sleep(time: Duration) {
    let zero = time.is_zero();
    let cord = cord();
    if zero {
        cord.ev.idle_start();
    }
    yield_timeout(time);
    if zero {
        cord.ev.idle_stop();
    }
}

/// Move the current fiber to the tail of the ready-list and run everyone
/// scheduled before it.
pub fn reschedule() {
    cord().current_rc().wakeup();
    yield_now();
}

/// Wait until `f` is dead, then collect its result: moves the dead fiber's
/// diag into the current fiber and recycles the carcass. Joining a
/// cancelled fiber reports success with an empty diag.
pub(crate) fn join_rc(f: &Rc<Fiber>) -> i32 {
    let cur = cord().current_rc();
    debug_assert!(f.flags().contains(Flags::JOINABLE), "fiber is not joinable");
    assert!(!Rc::ptr_eq(f, &cur), "a fiber cannot join itself");
    while !f.is_dead() {
        f.wake.park_tail(&cur);
        yield_now();
        f.wake.unlink(&cur);
    }
    let was_cancelled = f.is_cancelled();
    let mut ret = f.f_ret.get();
    if ret != 0 {
        f.diag.move_to(cur.diag());
    }
    if was_cancelled {
        // FiberIsCancelled is not propagated to the joiner.
        cur.diag().clear();
        ret = 0;
    }
    recycle(f);
    ret
}

/// Strip a dead fiber of everything per-life and put it on the dead list
/// for reuse. Fibers with a custom stack size are dropped instead.
fn recycle(f: &Rc<Fiber>) {
    debug_assert!(f.diag.is_empty());
    debug_assert_eq!(f.parked_on.get(), 0);
    f.flags.set(DEFAULT_FLAGS);
    f.f_ret.set(0);
    f.on_yield.borrow_mut().clear();
    f.on_stop.borrow_mut().clear();
    for slot in &f.fls {
        slot.set(ptr::null_mut());
    }
    *f.entry.borrow_mut() = None;
    *f.caller.borrow_mut() = None;
    let cord = cord();
    cord.unregister(f.fid.get());
    f.fid.set(0);
    f.name.borrow_mut().clear();
    f.gc.free();
    if f.default_stack {
        cord.push_dead(f.clone());
    }
}

/// Drain the ready-list: snapshot the batch and thread it into a caller
/// chain ending at sched, so that running N fibers costs N transfers — each
/// yield resumes the next fiber in the batch directly, without a round trip
/// through the scheduler. Fibers woken during the drain land on the fresh
/// ready-list and run on the next loop iteration.
pub(crate) fn schedule_ready() {
    let cord = cord();
    debug_assert!(Rc::ptr_eq(&cord.current_rc(), &cord.sched));
    let mut batch = cord.take_ready();
    let Some(first) = batch.pop_front() else {
        return;
    };
    debug_assert!(first.flags().contains(Flags::READY));
    let mut last = first.clone();
    for next in batch.drain(..) {
        debug_assert!(next.flags().contains(Flags::READY));
        *last.caller.borrow_mut() = Some(next.clone());
        last = next;
    }
    *last.caller.borrow_mut() = Some(cord.sched.clone());
    call_impl(&first);
}

extern "C" fn fiber_trampoline() -> ! {
    fiber_loop()
}

/// Body wrapper shared by every fiber coroutine. One iteration is one life:
/// run the entry, mark the fiber dead, wake the joiners, run the stop
/// triggers, recycle if nobody is going to join, then yield back. A
/// recycled fiber parked at the bottom of the loop re-enters it when it is
/// started again.
fn fiber_loop() -> ! {
    loop {
        {
            let fiber = cord().current_rc();
            debug_assert_ne!(fiber.id(), 0);
            let entry = fiber
                .entry
                .borrow_mut()
                .take()
                .expect("spurious wakeup of a recycled fiber");
            let ret = entry();
            fiber.f_ret.set(ret);
            if ret != 0 {
                debug_assert!(!fiber.diag.is_empty() || fiber.is_cancelled());
                if !fiber.flags().contains(Flags::JOINABLE) {
                    // The error dies with the fiber; log it, unless the
                    // fiber was simply cancelled.
                    if !fiber.is_cancelled() {
                        if let Some(msg) = fiber.diag.last_message() {
                            log::error!("fiber '{}' failed: {}", fiber.name(), msg);
                        }
                    }
                    fiber.diag.clear();
                }
            } else {
                // Don't let a stale error propagate to the joiner.
                fiber.diag.clear();
            }
            fiber.insert_flag(Flags::DEAD);
            while let Some(joiner) = fiber.wake.take_first() {
                debug_assert!(!Rc::ptr_eq(&joiner, &fiber));
                joiner.wakeup();
            }
            let stops: Vec<_> = fiber.on_stop.borrow_mut().drain(..).collect();
            for cb in stops {
                cb();
            }
            // Forget any wakeup that raced with the death: a self-wakeup
            // with no yield before the body returned would leave a dead
            // fiber scheduled for execution.
            fiber.parked_on.set(0);
            if fiber.flags().contains(Flags::READY) {
                cord().remove_ready(&fiber);
                fiber.remove_flag(Flags::READY);
            }
            if !fiber.flags().contains(Flags::JOINABLE) {
                recycle(&fiber);
            }
            // The Rc must not survive past this point: an Rc of the fiber
            // frozen on its own stack would never be dropped.
        }
        yield_now();
    }
}

////////////////////////////////////////////////////////////////////////////////
// Cancellation
////////////////////////////////////////////////////////////////////////////////

/// Check if the current fiber has been cancelled and fail if so.
///
/// Every blocking primitive of the runtime calls this right after waking
/// up, which is how a cancelled fiber sees its cancellation as an error
/// from the call it was blocked in.
pub fn testcancel() -> Result<()> {
    if is_cancelled() {
        let cur = current();
        cur.diag().set(Error::FiberIsCancelled);
        return Err(Error::FiberIsCancelled);
    }
    Ok(())
}

/// Whether the current fiber has been asked to cancel.
pub fn is_cancelled() -> bool {
    cord().current_rc().is_cancelled()
}

/// Allow or forbid immediate wakeup of the current fiber on cancellation.
/// Returns the previous value.
pub fn set_cancellable(yes: bool) -> bool {
    let cur = cord().current_rc();
    let prev = cur.flags().contains(Flags::CANCELLABLE);
    if yes {
        cur.insert_flag(Flags::CANCELLABLE);
    } else {
        cur.remove_flag(Flags::CANCELLABLE);
    }
    prev
}

/// Scope guard flipping the current fiber's cancellability, restoring the
/// previous state on drop. Offloaded calls park non-cancellable: a cancel
/// arriving mid-flight must not free state a worker thread still uses.
pub(crate) struct CancelGuard {
    prev: bool,
}

impl CancelGuard {
    pub fn non_cancellable() -> Self {
        Self {
            prev: set_cancellable(false),
        }
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        set_cancellable(self.prev);
    }
}

////////////////////////////////////////////////////////////////////////////////
// Free functions
////////////////////////////////////////////////////////////////////////////////

/// The currently executing fiber.
pub fn current() -> Rc<Fiber> {
    cord().current_rc()
}

/// Registry lookup by fiber id.
pub fn find(fid: FiberId) -> Option<Rc<Fiber>> {
    cord().find(fid)
}

/// Trim the current fiber's scratch region: free it if it grew beyond
/// 128 KiB, otherwise just reset the high-water mark and keep the memory
/// for the next request.
pub fn gc() {
    let cur = current();
    if cur.gc.used() < GC_THRESHOLD {
        cur.gc.reset();
    } else {
        cur.gc.free();
    }
}

/// Context switches of the current fiber.
pub fn csw() -> u64 {
    current().csw()
}

/// Wall clock time in seconds, as the event loop sees it.
pub fn time() -> f64 {
    crate::clock::time()
}

/// Monotonic time in seconds cached at the start of the current event loop
/// iteration (cheap).
pub fn clock() -> f64 {
    cord().ev.now()
}

/// Possible [`check_yield`] results.
#[derive(Debug, PartialEq, Eq)]
pub enum YieldResult<T> {
    /// The function didn't yield.
    DidntYield(T),
    /// The function did yield.
    Yielded(T),
}

/// Calls a function and checks whether it yielded. Mostly useful in tests.
pub fn check_yield<F, T>(f: F) -> YieldResult<T>
where
    F: FnOnce() -> T,
{
    let before = csw();
    let res = f();
    if csw() == before {
        YieldResult::DidntYield(res)
    } else {
        YieldResult::Yielded(res)
    }
}

/// A row of [`stat`] output.
#[derive(Debug, Clone)]
pub struct FiberStat {
    pub fid: FiberId,
    pub name: String,
    pub csw: u64,
}

/// Visit every live fiber of the current cord.
pub fn stat(mut cb: impl FnMut(&FiberStat) -> ControlFlow<()>) {
    for f in cord().registry_snapshot() {
        let row = FiberStat {
            fid: f.id(),
            name: f.name(),
            csw: f.csw(),
        };
        if cb(&row).is_break() {
            break;
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Builder
////////////////////////////////////////////////////////////////////////////////

/// Fiber factory which can be used to configure the properties of the new
/// fiber.
///
/// The currently supported configurations are:
///
/// * `name`:       specifies an associated name for the fiber
/// * `stack_size`: specifies the desired stack size for the fiber
/// * `func`/`proc`: specifies the fiber function (or procedure)
///
/// The [`start`](Builder::start) and [`defer`](Builder::defer) methods take
/// ownership of the builder and produce a join handle with the given
/// configuration. The [`fiber::start`](start), [`fiber::start_proc`](start_proc),
/// [`fiber::defer`](defer) and [`fiber::defer_proc`](defer_proc) free
/// functions use a `Builder` with the default configuration and unwrap its
/// return value.
pub struct Builder<F> {
    name: Option<String>,
    stack_size: Option<usize>,
    f: F,
}

impl std::fmt::Debug for Builder<NoFunc> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder").finish_non_exhaustive()
    }
}

/// A *typestate* helper representing a [`Builder`] that hasn't been
/// assigned a fiber function yet.
pub struct NoFunc;

/// Typestate of a [`Builder`] whose fiber function returns a value.
pub struct FiberFunc<'f, F, T> {
    f: F,
    marker: PhantomData<&'f T>,
}

/// Typestate of a [`Builder`] whose fiber function doesn't return a value.
pub struct FiberProc<'f, F> {
    f: F,
    marker: PhantomData<&'f ()>,
}

impl Builder<NoFunc> {
    pub fn new() -> Self {
        Builder {
            name: None,
            stack_size: None,
            f: NoFunc,
        }
    }

    /// Sets the callee function for the new fiber.
    pub fn func<'f, F, T>(self, f: F) -> Builder<FiberFunc<'f, F, T>>
    where
        F: FnOnce() -> T + 'f,
    {
        Builder {
            name: self.name,
            stack_size: self.stack_size,
            f: FiberFunc {
                f,
                marker: PhantomData,
            },
        }
    }

    /// Sets the callee procedure for the new fiber.
    pub fn proc<'f, F>(self, f: F) -> Builder<FiberProc<'f, F>>
    where
        F: FnOnce() + 'f,
    {
        Builder {
            name: self.name,
            stack_size: self.stack_size,
            f: FiberProc {
                f,
                marker: PhantomData,
            },
        }
    }
}

impl Default for Builder<NoFunc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F> Builder<F> {
    /// Names the fiber-to-be. Truncated to 32 bytes.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the size of the stack (in bytes) for the new fiber. Fibers with
    /// a non-default stack size are not recycled through the fiber cache.
    pub fn stack_size(mut self, stack_size: usize) -> Result<Self> {
        if stack_size < coro::MIN_STACK_SIZE {
            return Err(Error::IllegalParams(
                format!("stack size must be at least {} bytes", coro::MIN_STACK_SIZE).into(),
            ));
        }
        self.stack_size = Some(stack_size);
        Ok(self)
    }
}

type FiberResult<T> = std::result::Result<T, Box<dyn Any + Send + 'static>>;

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).into()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".into()
    }
}

/// Erase the lifetime of a fiber body.
///
/// # Safety
///
/// Sound only because every join handle panics when dropped without being
/// joined: the borrowed data outlives the fiber as long as the handle is
/// joined within `'f`.
pub(crate) unsafe fn erase_entry<'f>(
    entry: Box<dyn FnOnce() -> i32 + 'f>,
) -> Box<dyn FnOnce() -> i32> {
    mem::transmute(entry)
}

impl<'f, F, T> Builder<FiberFunc<'f, F, T>>
where
    F: FnOnce() -> T + 'f,
    T: 'f,
{
    /// Spawns a new fiber and **yields** execution to it immediately,
    /// returning a [`JoinHandle`] for it.
    pub fn start(self) -> Result<JoinHandle<'f, T>> {
        self.spawn(false)
    }

    /// Spawns a new fiber and schedules it for execution at the end of the
    /// current event loop iteration, without switching to it now.
    pub fn defer(self) -> Result<JoinHandle<'f, T>> {
        self.spawn(true)
    }

    fn spawn(self, deferred: bool) -> Result<JoinHandle<'f, T>> {
        let result: Rc<Cell<Option<FiberResult<T>>>> = Rc::new(Cell::new(None));
        let slot = result.clone();
        let f = self.f.f;
        let entry = Box::new(move || -> i32 {
            match panic::catch_unwind(AssertUnwindSafe(f)) {
                Ok(t) => {
                    slot.set(Some(Ok(t)));
                    0
                }
                Err(payload) => {
                    current().diag().set(Error::Panicked(panic_message(&*payload)));
                    slot.set(Some(Err(payload)));
                    -1
                }
            }
        });
        let entry = unsafe { erase_entry(entry) };
        let name = self.name.as_deref().unwrap_or("unnamed");
        let fiber = spawn_prepared(name, self.stack_size, true, entry)?;
        if deferred {
            fiber.wakeup();
        } else {
            call(&fiber);
        }
        Ok(JoinHandle::new(fiber, result))
    }
}

impl<'f, F> Builder<FiberProc<'f, F>>
where
    F: FnOnce() + 'f,
{
    /// Spawns a new proc fiber and **yields** execution to it immediately,
    /// returning a [`UnitJoinHandle`] for it.
    pub fn start(self) -> Result<UnitJoinHandle<'f>> {
        self.spawn(false, true).map(|h| h.unwrap())
    }

    /// Spawns a new proc fiber and schedules it for execution without
    /// switching to it now.
    pub fn defer(self) -> Result<UnitJoinHandle<'f>> {
        self.spawn(true, true).map(|h| h.unwrap())
    }

    /// Spawns a detached (non-joinable) fiber: it recycles itself when it
    /// terminates; a panic inside is logged and dropped.
    pub fn start_detached(self) -> Result<()>
    where
        F: 'static,
    {
        let handle = self.spawn(false, false)?;
        debug_assert!(handle.is_none());
        Ok(())
    }

    fn spawn(self, deferred: bool, joinable: bool) -> Result<Option<UnitJoinHandle<'f>>> {
        let panic_slot: Rc<Cell<Option<Box<dyn Any + Send>>>> = Rc::new(Cell::new(None));
        let slot = if joinable { Some(panic_slot.clone()) } else { None };
        let f = self.f.f;
        let entry = Box::new(move || -> i32 {
            match panic::catch_unwind(AssertUnwindSafe(f)) {
                Ok(()) => 0,
                Err(payload) => {
                    current().diag().set(Error::Panicked(panic_message(&*payload)));
                    if let Some(slot) = &slot {
                        slot.set(Some(payload));
                    }
                    -1
                }
            }
        });
        let entry = unsafe { erase_entry(entry) };
        let name = self.name.as_deref().unwrap_or("unnamed");
        let fiber = spawn_prepared(name, self.stack_size, joinable, entry)?;
        if deferred {
            fiber.wakeup();
        } else {
            call(&fiber);
        }
        if joinable {
            Ok(Some(UnitJoinHandle::new(fiber, panic_slot)))
        } else {
            Ok(None)
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// JoinHandle
////////////////////////////////////////////////////////////////////////////////

/// An owned permission to join on a fiber (block on its termination).
///
/// Dropping the handle without joining is a bug and panics: the fiber may
/// borrow data the handle's lifetime protects.
pub struct JoinHandle<'f, T> {
    fiber: Option<Rc<Fiber>>,
    result: Rc<Cell<Option<FiberResult<T>>>>,
    marker: PhantomData<&'f ()>,
}

impl<'f, T> JoinHandle<'f, T> {
    fn new(fiber: Rc<Fiber>, result: Rc<Cell<Option<FiberResult<T>>>>) -> Self {
        Self {
            fiber: Some(fiber),
            result,
            marker: PhantomData,
        }
    }

    /// Block until the fiber terminates and return its result. If the fiber
    /// panicked, the panic is resumed here.
    pub fn join(mut self) -> T {
        let fiber = self.fiber.take().unwrap();
        let _ret = join_rc(&fiber);
        match self.result.take() {
            Some(Ok(t)) => t,
            Some(Err(payload)) => panic::resume_unwind(payload),
            None => unreachable!("fiber terminated without storing a result"),
        }
    }

    /// Give up on joining: make the fiber non-joinable so it recycles
    /// itself. Only available for `'static` fibers — a detached fiber may
    /// outlive its spawner.
    pub fn detach(mut self)
    where
        T: 'static,
        'f: 'static,
    {
        detach_fiber(self.fiber.take().unwrap());
    }

    pub fn id(&self) -> FiberId {
        self.fiber.as_ref().unwrap().id()
    }

    /// The fiber behind this handle.
    pub fn fiber(&self) -> Rc<Fiber> {
        self.fiber.as_ref().unwrap().clone()
    }

    pub fn cancel(&self) {
        self.fiber.as_ref().unwrap().cancel();
    }

    pub fn wakeup(&self) {
        self.fiber.as_ref().unwrap().wakeup();
    }
}

impl<'f, T> Drop for JoinHandle<'f, T> {
    fn drop(&mut self) {
        if self.fiber.is_some() && !std::thread::panicking() {
            panic!("JoinHandle dropped before being joined");
        }
    }
}

impl<'f, T> std::fmt::Debug for JoinHandle<'f, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinHandle").finish_non_exhaustive()
    }
}

/// An owned permission to join on a proc fiber.
///
/// This is an optimized case of [`JoinHandle`]`<()>`.
pub struct UnitJoinHandle<'f> {
    fiber: Option<Rc<Fiber>>,
    panic_slot: Rc<Cell<Option<Box<dyn Any + Send>>>>,
    marker: PhantomData<&'f ()>,
}

impl<'f> UnitJoinHandle<'f> {
    fn new(fiber: Rc<Fiber>, panic_slot: Rc<Cell<Option<Box<dyn Any + Send>>>>) -> Self {
        Self {
            fiber: Some(fiber),
            panic_slot,
            marker: PhantomData,
        }
    }

    /// Block until the fiber terminates. If the fiber panicked, the panic
    /// is resumed here.
    pub fn join(mut self) {
        let fiber = self.fiber.take().unwrap();
        let _ret = join_rc(&fiber);
        if let Some(payload) = self.panic_slot.take() {
            panic::resume_unwind(payload);
        }
    }

    /// See [`JoinHandle::detach`].
    pub fn detach(mut self)
    where
        'f: 'static,
    {
        detach_fiber(self.fiber.take().unwrap());
    }

    pub fn id(&self) -> FiberId {
        self.fiber.as_ref().unwrap().id()
    }

    pub fn fiber(&self) -> Rc<Fiber> {
        self.fiber.as_ref().unwrap().clone()
    }

    pub fn cancel(&self) {
        self.fiber.as_ref().unwrap().cancel();
    }

    pub fn wakeup(&self) {
        self.fiber.as_ref().unwrap().wakeup();
    }
}

impl<'f> Drop for UnitJoinHandle<'f> {
    fn drop(&mut self) {
        if self.fiber.is_some() && !std::thread::panicking() {
            panic!("UnitJoinHandle dropped before being joined");
        }
    }
}

impl<'f> std::fmt::Debug for UnitJoinHandle<'f> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitJoinHandle").finish_non_exhaustive()
    }
}

/// Shared tail of [`JoinHandle::detach`]/[`UnitJoinHandle::detach`]: an
/// already-dead fiber is recycled on the spot, its never-to-be-joined
/// failure dropped.
fn detach_fiber(fiber: Rc<Fiber>) {
    fiber.set_joinable(false);
    if fiber.is_dead() {
        fiber.diag().clear();
        recycle(&fiber);
    }
}

/// Creates a new fiber and **yields** execution to it immediately, returning
/// a [`JoinHandle`] for it.
///
/// When the function has no return value, use [`start_proc`] instead.
pub fn start<'f, F, T>(f: F) -> JoinHandle<'f, T>
where
    F: FnOnce() -> T + 'f,
    T: 'f,
{
    Builder::new().func(f).start().unwrap()
}

/// Creates a new proc fiber and **yields** execution to it immediately,
/// returning a [`UnitJoinHandle`] for it.
pub fn start_proc<'f, F>(f: F) -> UnitJoinHandle<'f>
where
    F: FnOnce() + 'f,
{
    Builder::new().proc(f).start().unwrap()
}

/// Creates a new fiber and schedules it for execution at the end of the
/// current event loop iteration, returning a [`JoinHandle`] for it. Unlike
/// [`start`] the current fiber keeps running.
pub fn defer<'f, F, T>(f: F) -> JoinHandle<'f, T>
where
    F: FnOnce() -> T + 'f,
    T: 'f,
{
    Builder::new().func(f).defer().unwrap()
}

/// Creates a new proc fiber and schedules it for execution, returning a
/// [`UnitJoinHandle`] for it.
pub fn defer_proc<'f, F>(f: F) -> UnitJoinHandle<'f>
where
    F: FnOnce() + 'f,
{
    Builder::new().proc(f).defer().unwrap()
}

////////////////////////////////////////////////////////////////////////////////
// Cond
////////////////////////////////////////////////////////////////////////////////

/// Conditional variable for cooperative multitasking.
///
/// [`wait`](Cond::wait) suspends the current fiber until
/// [`signal`](Cond::signal) or [`broadcast`](Cond::broadcast) is called.
/// Like `pthread_cond`, a cond can see spurious wakeups caused by explicit
/// [`Fiber::wakeup`] or [`Fiber::cancel`] calls, so wrap the wait in a loop
/// re-checking the actual predicate.
#[derive(Default)]
pub struct Cond {
    waiters: WaitQueue,
}

impl Cond {
    pub fn new() -> Self {
        Self {
            waiters: WaitQueue::new(),
        }
    }

    /// Wake one fiber waiting for the cond. Does nothing if no one is
    /// waiting. Does not yield.
    pub fn signal(&self) {
        if let Some(f) = self.waiters.take_first() {
            f.wakeup();
        }
    }

    /// Wake up all fibers waiting for the cond. Does not yield.
    pub fn broadcast(&self) {
        while let Some(f) = self.waiters.take_first() {
            f.wakeup();
        }
    }

    /// Suspend the current fiber until a signal or the timeout.
    ///
    /// Returns `true` on a signal (or a spurious wakeup), `false` on
    /// timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let cur = current();
        self.waiters.park_tail(&cur);
        let timed_out = yield_timeout(timeout);
        self.waiters.unlink(&cur);
        !timed_out
    }

    /// Suspend the current fiber until a signal.
    pub fn wait(&self) -> bool {
        self.wait_timeout(crate::clock::INFINITY)
    }
}

impl std::fmt::Debug for Cond {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cond").finish_non_exhaustive()
    }
}
