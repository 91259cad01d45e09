//! Cord lifecycle.
//!
//! A cord is one OS thread with one event loop and its fiber pool — the
//! unit of single-threaded scheduling. Fibers never migrate between cords,
//! and cord-local state is only ever touched from the owning thread.
//!
//! The entry points:
//!
//! - [`run`] — turn the *current* thread into a cord, run a closure in its
//!   "main" fiber, and tear the cord down when the closure returns. This is
//!   how a program (or a test) enters the fiber world.
//! - [`start`] — spawn a new cord thread running an arbitrary function.
//! - [`costart`] — spawn a new cord thread running a "main" fiber, with the
//!   fiber's failure becoming the cord's result.
//! - [`CordHandle::join`] — thread-blocking join.
//! - [`CordHandle::cojoin`] — fiber-friendly join: the calling fiber parks,
//!   its cord keeps serving other fibers, and an on-exit notification from
//!   the dying cord wakes it up.
//!
//! Cross-thread communication is deliberately minimal: the start
//! rendezvous (mutex + condvar), the offload pool hand-off, and the
//! change-once `on_exit` slot used by `cojoin`.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::rc::Rc;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};

use once_cell::sync::OnceCell;

use crate::coeio;
use crate::error::{Error, Result};
use crate::ev;
use crate::fiber::{self, Fiber, FiberId};

static MAIN_THREAD: OnceCell<ThreadId> = OnceCell::new();

thread_local! {
    static CURRENT_CORD: Cell<*const Cord> = const { Cell::new(ptr::null()) };
}

/// Whether the calling thread is the main cord — the first cord created in
/// this process. Signal handling and process-title updates belong to it.
pub fn is_main() -> bool {
    MAIN_THREAD.get() == Some(&thread::current().id())
}

/// The cord installed on the current thread.
///
/// The reference is only valid while the cord is: it is handed out to
/// runtime code running inside [`run`]/[`start`], which the cord outlives
/// by construction.
pub(crate) fn cord() -> &'static Cord {
    try_cord().expect("no cord is running on this thread")
}

/// Name of the cord on the current thread (for log prefixes).
pub(crate) fn cord_name() -> String {
    cord().name().to_string()
}

pub(crate) fn try_cord() -> Option<&'static Cord> {
    let ptr = CURRENT_CORD.with(|c| c.get());
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { &*ptr })
    }
}

////////////////////////////////////////////////////////////////////////////////
// Cord state
////////////////////////////////////////////////////////////////////////////////

/// Per-thread scheduler state. Only the owning thread ever touches it.
pub(crate) struct Cord {
    name: String,
    pub(crate) ev: ev::Loop,
    pub(crate) sched: Rc<Fiber>,
    current: RefCell<Rc<Fiber>>,
    /// Fibers scheduled for execution, in wakeup order.
    ready: RefCell<VecDeque<Rc<Fiber>>>,
    /// Recycled fibers available for reuse.
    dead: RefCell<Vec<Rc<Fiber>>>,
    /// All live fibers by id; a dead joinable fiber stays here until it is
    /// joined.
    registry: RefCell<HashMap<FiberId, Rc<Fiber>>>,
    max_fid: Cell<FiberId>,
    /// Where offload workers deliver task completions for this cord.
    pub(crate) completions: Arc<coeio::CompletionSink>,
}

impl Cord {
    /// Initialise cord state and install it on the current thread.
    fn create(name: &str) -> Result<Box<Cord>> {
        assert!(
            try_cord().is_none(),
            "a cord is already running on this thread"
        );
        let ev = ev::Loop::new().map_err(Error::System)?;
        let completions = coeio::install_sink(&ev);
        let sched = Fiber::new_sched();
        let cord = Box::new(Cord {
            name: name.into(),
            ev,
            current: RefCell::new(sched.clone()),
            sched,
            ready: RefCell::new(VecDeque::new()),
            dead: RefCell::new(Vec::new()),
            registry: RefCell::new(HashMap::new()),
            max_fid: Cell::new(100),
            completions,
        });
        let _ = MAIN_THREAD.set(thread::current().id());
        CURRENT_CORD.with(|c| c.set(&*cord));
        Ok(cord)
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub(crate) fn current_rc(&self) -> Rc<Fiber> {
        self.current.borrow().clone()
    }

    #[inline]
    pub(crate) fn set_current(&self, f: Rc<Fiber>) {
        *self.current.borrow_mut() = f;
    }

    #[inline]
    pub(crate) fn push_ready(&self, f: Rc<Fiber>) {
        self.ready.borrow_mut().push_back(f);
    }

    #[inline]
    pub(crate) fn has_ready(&self) -> bool {
        !self.ready.borrow().is_empty()
    }

    pub(crate) fn take_ready(&self) -> VecDeque<Rc<Fiber>> {
        std::mem::take(&mut *self.ready.borrow_mut())
    }

    /// Drop a fiber's pending ready-list entry (used when a fiber dies with
    /// a wakeup still queued).
    pub(crate) fn remove_ready(&self, f: &Rc<Fiber>) {
        self.ready.borrow_mut().retain(|x| !Rc::ptr_eq(x, f));
    }

    pub(crate) fn take_dead(&self) -> Option<Rc<Fiber>> {
        self.dead.borrow_mut().pop()
    }

    pub(crate) fn push_dead(&self, f: Rc<Fiber>) {
        self.dead.borrow_mut().push(f);
    }

    pub(crate) fn register(&self, f: Rc<Fiber>) {
        self.registry.borrow_mut().insert(f.id(), f);
    }

    pub(crate) fn unregister(&self, fid: FiberId) {
        self.registry.borrow_mut().remove(&fid);
    }

    pub(crate) fn find(&self, fid: FiberId) -> Option<Rc<Fiber>> {
        self.registry.borrow().get(&fid).cloned()
    }

    pub(crate) fn registry_snapshot(&self) -> Vec<Rc<Fiber>> {
        self.registry.borrow().values().cloned().collect()
    }

    /// Next fiber id; 0..=100 are reserved and skipped, also after the
    /// 32-bit counter wraps.
    pub(crate) fn next_fid(&self) -> FiberId {
        let mut fid = self.max_fid.get().wrapping_add(1);
        if fid < 100 {
            fid = 101;
        }
        self.max_fid.set(fid);
        fid
    }
}

/// Uninstalls and drops the cord even if the body unwinds.
struct CordScope {
    cord: Option<Box<Cord>>,
}

impl CordScope {
    fn install(name: &str) -> Result<Self> {
        Ok(Self {
            cord: Some(Cord::create(name)?),
        })
    }

    fn cord(&self) -> &Cord {
        self.cord.as_deref().unwrap()
    }
}

impl Drop for CordScope {
    fn drop(&mut self) {
        CURRENT_CORD.with(|c| c.set(ptr::null()));
        // Fibers still parked on their stacks are unmapped without
        // unwinding, as on any abnormal thread exit.
        self.cord.take();
    }
}

////////////////////////////////////////////////////////////////////////////////
// Running a main fiber
////////////////////////////////////////////////////////////////////////////////

/// Turn the current thread into a cord named `name`, run `body` in a
/// joinable "main" fiber, and tear the cord down afterwards.
///
/// Everything fiber-related must happen inside: the runtime has no
/// process-wide state apart from the offload pool, and all the API entry
/// points expect a cord on the calling thread.
pub fn run_named<T>(name: &str, body: impl FnOnce() -> T) -> Result<T> {
    let scope = CordScope::install(name)?;
    let res = run_main_fiber(scope.cord(), body);
    drop(scope);
    res
}

/// [`run_named`] with the conventional main-cord name.
pub fn run<T>(body: impl FnOnce() -> T) -> Result<T> {
    run_named("main", body)
}

/// The costart skeleton: start a "main" fiber, break the event loop when it
/// stops (through an on-stop trigger, so the loop ends even if the fiber
/// fails), run the loop, join.
fn run_main_fiber<T>(this: &Cord, body: impl FnOnce() -> T) -> Result<T> {
    let slot: Rc<Cell<Option<std::thread::Result<T>>>> = Rc::new(Cell::new(None));
    let entry = {
        let slot = slot.clone();
        Box::new(move || -> i32 {
            match panic::catch_unwind(AssertUnwindSafe(body)) {
                Ok(t) => {
                    slot.set(Some(Ok(t)));
                    0
                }
                Err(payload) => {
                    fiber::current()
                        .diag()
                        .set(Error::Panicked(crate::fiber::panic_message(&*payload)));
                    slot.set(Some(Err(payload)));
                    -1
                }
            }
        })
    };
    // Safety: the fiber is joined before this function returns, so the
    // borrows captured by `body` stay valid for the fiber's whole life.
    let entry = unsafe { fiber::erase_entry(entry) };
    let main = fiber::spawn_prepared("main", None, true, entry)?;
    main.on_stop(|| cord().ev.break_loop());
    fiber::call(&main);
    if !main.is_dead() {
        // The fiber parked somewhere; serve events until it stops.
        this.ev.run();
    }
    let ret = fiber::join_rc(&main);
    match slot.take() {
        Some(Ok(t)) => Ok(t),
        Some(Err(payload)) => panic::resume_unwind(payload),
        None => {
            debug_assert_ne!(ret, 0);
            Err(this.sched.diag().take_error())
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Starting cord threads
////////////////////////////////////////////////////////////////////////////////

/// The change-once on-exit slot. It is the only cross-thread mutable field
/// of a cord and it transitions exactly once: either the exiting thread
/// claims it with the "won't run" sentinel, or a joiner installs a handler
/// which the exiting thread then invokes.
struct OnExit {
    slot: AtomicPtr<()>,
}

/// Distinct from any valid handler pointer AND from null.
static ON_EXIT_WONT_RUN: u8 = 0;

type OnExitHandler = Box<dyn FnOnce() + Send>;

impl OnExit {
    fn new() -> Self {
        Self {
            slot: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn sentinel() -> *mut () {
        &ON_EXIT_WONT_RUN as *const u8 as *mut ()
    }

    /// Called by the exiting thread: claim the slot, or run the handler a
    /// joiner managed to install first.
    fn finish(&self) {
        match self.slot.compare_exchange(
            ptr::null_mut(),
            Self::sentinel(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(installed) => {
                debug_assert!(!ptr::eq(installed, Self::sentinel()));
                let handler = unsafe { Box::from_raw(installed as *mut OnExitHandler) };
                handler();
            }
        }
    }

    /// Called by a joiner: install `handler`, to be run by the exiting
    /// thread. `false` means the thread has already exited (the handler is
    /// dropped and will not run).
    fn install(&self, handler: OnExitHandler) -> bool {
        let raw = Box::into_raw(Box::new(handler)) as *mut ();
        match self
            .slot
            .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(existing) => {
                drop(unsafe { Box::from_raw(raw as *mut OnExitHandler) });
                assert!(
                    ptr::eq(existing, Self::sentinel()),
                    "cord is already being joined"
                );
                false
            }
        }
    }
}

struct CordShared {
    on_exit: OnExit,
    result: Mutex<Option<Result<()>>>,
}

/// A handle to a cord thread started with [`start`] or [`costart`].
///
/// Dropping the handle detaches the thread.
pub struct CordHandle {
    shared: Arc<CordShared>,
    thread: Option<thread::JoinHandle<()>>,
}

/// Signals don't belong to worker cords; the main thread keeps them all.
fn block_all_signals() {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigfillset(&mut set);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, ptr::null_mut());
    }
}

/// Spawn an OS thread running `f` on a fresh cord named `name`. Returns
/// after the new cord finished initialising, as the start rendezvous
/// demands. `f`'s error becomes the cord's result, observable via
/// [`CordHandle::join`].
pub fn start(name: &str, f: impl FnOnce() -> Result<()> + Send + 'static) -> Result<CordHandle> {
    let shared = Arc::new(CordShared {
        on_exit: OnExit::new(),
        result: Mutex::new(None),
    });
    let started = Arc::new((Mutex::new(false), Condvar::new()));
    let thread = {
        let shared = shared.clone();
        let started = started.clone();
        let name = name.to_string();
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                block_all_signals();
                let scope = CordScope::install(&name);
                {
                    let (lock, cvar) = &*started;
                    *lock.lock().unwrap() = true;
                    cvar.notify_one();
                }
                let res = match scope {
                    Ok(scope) => {
                        let res = panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(
                            |payload| Err(Error::Panicked(crate::fiber::panic_message(&*payload))),
                        );
                        drop(scope);
                        res
                    }
                    Err(e) => Err(e),
                };
                *shared.result.lock().unwrap() = Some(res);
                shared.on_exit.finish();
            })
            .map_err(|e| Error::System(e))?
    };
    {
        let (lock, cvar) = &*started;
        let mut is_started = lock.lock().unwrap();
        while !*is_started {
            is_started = cvar.wait(is_started).unwrap();
        }
    }
    Ok(CordHandle {
        shared,
        thread: Some(thread),
    })
}

/// Spawn a cord whose thread runs `body` inside a joinable "main" fiber
/// with a full event loop, exactly like [`run`] does on the current thread.
/// The fiber's failure propagates as the cord's result.
pub fn costart(
    name: &str,
    body: impl FnOnce() -> Result<()> + Send + 'static,
) -> Result<CordHandle> {
    start(name, move || run_main_fiber(cord(), body)?)
}

impl CordHandle {
    /// Wait for the cord's thread to terminate, blocking the calling
    /// *thread*. Returns the cord's result.
    pub fn join(mut self) -> Result<()> {
        self.join_inner()
    }

    fn join_inner(&mut self) -> Result<()> {
        let thread = self.thread.take().expect("cord joined twice");
        if thread.join().is_err() {
            return Err(Error::Panicked("cord thread panicked".into()));
        }
        self.shared.result.lock().unwrap().take().unwrap_or(Ok(()))
    }

    /// Fiber-friendly join: must be called from a fiber. The fiber parks
    /// (non-cancellably) until the target cord is about to exit, so the
    /// rest of the calling cord keeps making progress; then the thread is
    /// reaped with a normal join, which cannot block meaningfully anymore.
    pub fn cojoin(mut self) -> Result<()> {
        let cord = cord();
        let cur = fiber::current();
        let complete = Rc::new(Cell::new(false));
        let async_id = {
            let complete = complete.clone();
            let cur = cur.clone();
            cord.ev.async_register(Rc::new(move || {
                complete.set(true);
                cur.wakeup();
            }))
        };
        let handle = cord.ev.async_handle(async_id);
        let installed = self
            .shared
            .on_exit
            .install(Box::new(move || handle.send()));
        if installed {
            // Cancellation is held off: the wait context must stay valid
            // until the dying cord has fired the notification.
            let _guard = fiber::CancelGuard::non_cancellable();
            fiber::yield_now();
            // A spurious wake here is a severe bug; fail early.
            assert!(complete.get(), "wrong fiber woken during cord cojoin");
        }
        cord.ev.async_unregister(async_id);
        self.join_inner()
    }
}

impl Drop for CordHandle {
    fn drop(&mut self) {
        // Detaches the thread if it was never joined.
        self.thread.take();
    }
}

impl std::fmt::Debug for CordHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CordHandle").finish_non_exhaustive()
    }
}
