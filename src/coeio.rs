//! Blocking-call offload.
//!
//! A process-wide pool of worker threads executes blocking syscalls on
//! behalf of fibers. [`call`] packages a closure as a task, parks the
//! calling fiber (non-cancellable — a cancel mid-flight would free state a
//! worker still touches) and resumes it when a worker finishes: the worker
//! pushes the completion onto the requesting cord's queue and fires that
//! cord's async watcher.
//!
//! On timeout the task is cancelled best-effort: a worker that has not yet
//! picked it up drops it; one that is already executing finishes but
//! discards the result, and no completion is delivered — the task becomes
//! detached garbage from the fiber's point of view.
//!
//! Built on top of it: a fiber-friendly [`getaddrinfo`] and the blocking
//! [file operations](file).

use std::collections::VecDeque;
use std::ffi::{CStr, CString};
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use once_cell::sync::{Lazy, OnceCell};

use crate::cord::cord;
use crate::error::{Error, Result};
use crate::ev::{self, AsyncHandle, Deadline};
use crate::fiber::{self, FiberId};

pub mod file;

////////////////////////////////////////////////////////////////////////////////
// Worker pool
////////////////////////////////////////////////////////////////////////////////

type Task = Box<dyn FnOnce() + Send>;

struct Pool {
    queue: Mutex<VecDeque<Task>>,
    available: Condvar,
}

impl Pool {
    fn submit(&self, task: Task) {
        self.queue.lock().unwrap().push_back(task);
        self.available.notify_one();
    }

    fn worker_loop(&self) {
        loop {
            let task = {
                let mut queue = self.queue.lock().unwrap();
                loop {
                    if let Some(task) = queue.pop_front() {
                        break task;
                    }
                    queue = self.available.wait(queue).unwrap();
                }
            };
            task();
        }
    }
}

fn pool_size() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .clamp(2, 8)
}

static POOL: Lazy<Arc<Pool>> = Lazy::new(|| {
    let pool = Arc::new(Pool {
        queue: Mutex::new(VecDeque::new()),
        available: Condvar::new(),
    });
    for i in 0..pool_size() {
        let pool = pool.clone();
        let _ = thread::Builder::new()
            .name(format!("coeio.{i}"))
            .spawn(move || pool.worker_loop());
    }
    pool
});

////////////////////////////////////////////////////////////////////////////////
// Completion delivery
////////////////////////////////////////////////////////////////////////////////

/// Per-cord landing strip for finished tasks. Workers push the id of the
/// parked fiber and fire the async watcher; the watcher's callback, running
/// on the cord's own thread, wakes the fibers up.
pub(crate) struct CompletionSink {
    queue: Mutex<VecDeque<FiberId>>,
    handle: OnceCell<AsyncHandle>,
}

impl CompletionSink {
    fn complete(&self, fid: FiberId) {
        self.queue.lock().unwrap().push_back(fid);
        self.handle
            .get()
            .expect("completion sink used before installation")
            .send();
    }

    fn drain(&self) {
        loop {
            let fid = self.queue.lock().unwrap().pop_front();
            match fid {
                Some(fid) => {
                    if let Some(f) = fiber::find(fid) {
                        f.wakeup();
                    }
                }
                None => break,
            }
        }
    }
}

/// Register the completion watcher on a fresh cord's loop.
pub(crate) fn install_sink(ev: &ev::Loop) -> Arc<CompletionSink> {
    let sink = Arc::new(CompletionSink {
        queue: Mutex::new(VecDeque::new()),
        handle: OnceCell::new(),
    });
    let cb_sink = sink.clone();
    let id = ev.async_register(Rc::new(move || cb_sink.drain()));
    sink.handle
        .set(ev.async_handle(id))
        .unwrap_or_else(|_| unreachable!("sink installed twice"));
    sink
}

////////////////////////////////////////////////////////////////////////////////
// call
////////////////////////////////////////////////////////////////////////////////

enum TaskState<R> {
    Pending,
    Done(R),
    Cancelled,
}

/// Run `func` on a worker thread, parking the current fiber until the
/// result is in or `timeout` expires.
///
/// The OS error of the call is preserved: have `func` capture it into its
/// return value (the [`file`] wrappers return `io::Result` for exactly
/// this reason).
pub fn call<F, R>(func: F, timeout: Duration) -> Result<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let fid = fiber::current().id();
    let sink = cord().completions.clone();
    let shared = Arc::new(Mutex::new(TaskState::Pending));
    let task: Task = {
        let shared = shared.clone();
        Box::new(move || {
            if matches!(*shared.lock().unwrap(), TaskState::Cancelled) {
                return;
            }
            let result = func();
            let mut state = shared.lock().unwrap();
            if matches!(*state, TaskState::Cancelled) {
                // The fiber timed out and went on with its life; the
                // result is garbage now and no completion is due.
                return;
            }
            *state = TaskState::Done(result);
            drop(state);
            sink.complete(fid);
        })
    };
    POOL.submit(task);

    let _guard = fiber::CancelGuard::non_cancellable();
    let deadline = Deadline::new(ev::to_seconds(timeout));
    loop {
        let timed_out = fiber::yield_timeout_seconds(deadline.remaining());
        let mut state = shared.lock().unwrap();
        match mem::replace(&mut *state, TaskState::Pending) {
            TaskState::Done(result) => return Ok(result),
            TaskState::Pending => {
                if timed_out || deadline.expired() {
                    *state = TaskState::Cancelled;
                    return Err(Error::TimedOut);
                }
                // Spurious wakeup; keep waiting out the shared deadline.
            }
            TaskState::Cancelled => unreachable!("task cancelled while still waited for"),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// getaddrinfo
////////////////////////////////////////////////////////////////////////////////

#[cfg(target_os = "linux")]
const EAI_ADDRFAMILY: libc::c_int = -9;
#[cfg(not(target_os = "linux"))]
const EAI_ADDRFAMILY: libc::c_int = 1;

/// Fiber-friendly `getaddrinfo(3)`: the resolver runs on a worker thread
/// while the calling fiber yields. Addresses come back in resolver order.
pub fn getaddrinfo(host: &str, service: &str, timeout: Duration) -> Result<Vec<SocketAddr>> {
    let host = host.to_string();
    let service = service.to_string();
    call(move || resolve_blocking(&host, &service), timeout)?.map_err(Error::System)
}

fn gai_error(rc: libc::c_int) -> io::Error {
    let msg = unsafe { CStr::from_ptr(libc::gai_strerror(rc)) };
    io::Error::new(
        io::ErrorKind::Other,
        format!("getaddrinfo: {}", msg.to_string_lossy()),
    )
}

fn resolve_blocking(host: &str, service: &str) -> io::Result<Vec<SocketAddr>> {
    let chost = if host.is_empty() {
        None
    } else {
        Some(CString::new(host).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "host contains a nul byte"))?)
    };
    let cservice = CString::new(service)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "service contains a nul byte"))?;

    let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
    hints.ai_family = libc::AF_UNSPEC;
    hints.ai_socktype = libc::SOCK_STREAM;
    hints.ai_flags = libc::AI_ADDRCONFIG | libc::AI_NUMERICSERV | libc::AI_PASSIVE;

    let host_ptr = chost.as_ref().map_or(std::ptr::null(), |h| h.as_ptr());
    let mut res: *mut libc::addrinfo = std::ptr::null_mut();
    let mut rc = unsafe { libc::getaddrinfo(host_ptr, cservice.as_ptr(), &hints, &mut res) };
    // Machines without a configured public address of some family fail the
    // AI_ADDRCONFIG lookup for it; retry without the flag.
    if rc == libc::EAI_BADFLAGS || rc == EAI_ADDRFAMILY {
        hints.ai_flags &= !libc::AI_ADDRCONFIG;
        rc = unsafe { libc::getaddrinfo(host_ptr, cservice.as_ptr(), &hints, &mut res) };
    }
    if rc != 0 {
        return Err(gai_error(rc));
    }
    let mut out = Vec::new();
    let mut cur = res;
    while !cur.is_null() {
        let ai = unsafe { &*cur };
        if !ai.ai_addr.is_null() {
            let addr = unsafe {
                crate::coio::sockaddr_to_addr(
                    ai.ai_addr as *const libc::sockaddr_storage,
                    ai.ai_addrlen,
                )
            };
            if let Some(addr) = addr {
                out.push(addr);
            }
        }
        cur = ai.ai_next;
    }
    unsafe { libc::freeaddrinfo(res) };
    Ok(out)
}
