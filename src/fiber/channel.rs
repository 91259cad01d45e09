//! FIFO inter-fiber message channel.
//!
//! A [`Channel`] carries values of one type between fibers of one cord.
//! A channel with a non-zero capacity buffers messages; a channel of
//! capacity zero is a pure rendezvous — sender and receiver meet directly.
//!
//! Delivery is FIFO in both directions: among buffered messages, and among
//! parked senders/receivers. Closing the channel drops every buffered
//! message and wakes every waiter with a "closed" verdict; a closed channel
//! never reopens.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use crate::clock;
use crate::ev::Deadline;
use crate::fiber::{self, Fiber, FiberKey, WaitQueue};

////////////////////////////////////////////////////////////////////////////////
// Wait pad
////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WaitStatus {
    /// A reader is waiting for a writer.
    Reader,
    /// A writer is waiting for a reader.
    Writer,
    /// Wait is over, the message was delivered.
    Done,
    /// Wait is aborted, the channel is closed.
    Closed,
}

/// Published by a parked fiber through its [`FiberKey::ChannelWaitPad`]
/// slot, so whoever completes the wait can deliver a message and a verdict.
///
/// The pad lives on the waiter's stack. It is the *counterparty* that
/// removes a fiber from the wait queue when delivering to it, never the
/// fiber itself after the fact, so a message can never be handed to a fiber
/// that was concurrently cancelled — a cancel detaches the fiber from the
/// queue before it runs.
struct WaitPad<T> {
    msg: Cell<Option<T>>,
    status: Cell<WaitStatus>,
}

/// Publish `pad` in the current fiber's FLS slot for the duration of the
/// park; cleared on drop along every exit path.
struct PadGuard<'a> {
    fiber: &'a Fiber,
}

impl<'a> PadGuard<'a> {
    fn publish<T>(fiber: &'a Fiber, pad: &WaitPad<T>) -> Self {
        unsafe {
            fiber.set_key(
                FiberKey::ChannelWaitPad,
                pad as *const WaitPad<T> as *mut (),
            );
        }
        Self { fiber }
    }
}

impl Drop for PadGuard<'_> {
    fn drop(&mut self) {
        unsafe { self.fiber.set_key(FiberKey::ChannelWaitPad, std::ptr::null_mut()) };
    }
}

/// Read the wait pad of a fiber parked on this channel's queue.
///
/// Safe because only fibers parked in this channel's `send`/`recv` are on
/// the queue, and each of them has published a pad of exactly this `T`.
unsafe fn pad_of<T>(fiber: &Fiber) -> &WaitPad<T> {
    let ptr = fiber.get_key(FiberKey::ChannelWaitPad) as *const WaitPad<T>;
    debug_assert!(!ptr.is_null());
    &*ptr
}

////////////////////////////////////////////////////////////////////////////////
// Channel
////////////////////////////////////////////////////////////////////////////////

struct Inner<T> {
    /// Ring buffer of `capacity` slots; empty for a rendezvous channel.
    buf: Vec<Cell<Option<T>>>,
    count: Cell<u32>,
    beg: Cell<u32>,
    /// Senders and receivers parked on the channel. Never both kinds at
    /// once: a reader only parks when the buffer is empty and no writer is
    /// parked, a writer only parks when the buffer is full (or absent) and
    /// no reader is parked.
    waiters: WaitQueue,
    is_closed: Cell<bool>,
}

impl<T> Inner<T> {
    fn buffer_push(&self, msg: T) {
        debug_assert!(self.count.get() < self.buf.len() as u32);
        let mut i = self.beg.get() + self.count.get();
        if i >= self.buf.len() as u32 {
            i -= self.buf.len() as u32;
        }
        self.buf[i as usize].set(Some(msg));
        self.count.set(self.count.get() + 1);
    }

    fn buffer_pop(&self) -> T {
        debug_assert!(self.count.get() > 0);
        let i = self.beg.get();
        let msg = self.buf[i as usize].take().expect("ring slot is empty");
        self.beg.set(if i + 1 == self.buf.len() as u32 { 0 } else { i + 1 });
        self.count.set(self.count.get() - 1);
        msg
    }

    fn first_waiter_with(&self, status: WaitStatus) -> Option<Rc<Fiber>> {
        let f = self.waiters.first()?;
        let pad_status = unsafe { pad_of::<T>(&f) }.status.get();
        (pad_status == status).then_some(f)
    }

    /// Hand a verdict (and possibly a message) to the head waiter and wake
    /// it. The waiter is dequeued here, by the delivering side.
    fn waiter_wakeup(&self, f: &Rc<Fiber>, status: WaitStatus, msg: Option<T>) {
        self.waiters.unlink(f);
        let pad = unsafe { pad_of::<T>(f) };
        if let Some(msg) = msg {
            pad.msg.set(Some(msg));
        }
        pad.status.set(status);
        f.wakeup();
    }

    /// Preconditions of parking: the channel is open, the current fiber is
    /// not cancelled, and there is time left to wait.
    fn check_wait(&self, deadline: &Deadline) -> Option<WaitError> {
        if self.is_closed.get() {
            return Some(WaitError::Closed);
        }
        if fiber::is_cancelled() {
            return Some(WaitError::Cancelled);
        }
        if deadline.is_zero() || deadline.expired() {
            return Some(WaitError::Timeout);
        }
        None
    }
}

enum WaitError {
    Timeout,
    Closed,
    Cancelled,
}

/// The channel itself. Cheaply clonable; all clones refer to the same
/// queue. Dropping the last clone drops any still-buffered messages.
pub struct Channel<T>(Rc<Inner<T>>);

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Channel<T> {
    /// Create a channel buffering up to `capacity` messages. `capacity`
    /// zero makes a rendezvous channel.
    pub fn new(capacity: u32) -> Self {
        let mut buf = Vec::with_capacity(capacity as usize);
        buf.resize_with(capacity as usize, || Cell::new(None));
        Self(Rc::new(Inner {
            buf,
            count: Cell::new(0),
            beg: Cell::new(0),
            waiters: WaitQueue::new(),
            is_closed: Cell::new(false),
        }))
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.0.buf.len() as u32
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.0.count.get()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.0.is_closed.get()
    }

    pub fn has_readers(&self) -> bool {
        self.0.first_waiter_with(WaitStatus::Reader).is_some()
    }

    pub fn has_writers(&self) -> bool {
        self.0.first_waiter_with(WaitStatus::Writer).is_some()
    }

    /// Send a message, blocking while the channel is full (or, for a
    /// rendezvous channel, until a receiver arrives).
    pub fn send(&self, msg: T) -> Result<(), SendError<T>> {
        self.send_timeout(msg, clock::INFINITY)
    }

    /// [`send`](Self::send) with a deadline.
    ///
    /// This function may perform a **yield**.
    pub fn send_timeout(&self, msg: T, timeout: Duration) -> Result<(), SendError<T>> {
        let ch = &*self.0;
        let deadline = Deadline::new(crate::ev::to_seconds(timeout));
        // A waiter that had to retry re-enters the queue at the head: it
        // has waited longer than anyone behind it.
        let mut first_try = true;
        let mut msg = msg;
        loop {
            // A parked reader takes priority over the buffer: there can be
            // no reader when a buffered message exists.
            if let Some(reader) = ch.first_waiter_with(WaitStatus::Reader) {
                debug_assert_eq!(ch.count.get(), 0);
                debug_assert!(!ch.is_closed.get());
                ch.waiter_wakeup(&reader, WaitStatus::Done, Some(msg));
                return Ok(());
            }
            if ch.count.get() < ch.buf.len() as u32 {
                // Closed channels are closed even when the buffer has room.
                if ch.is_closed.get() {
                    return Err(SendError::Closed(msg));
                }
                ch.buffer_push(msg);
                return Ok(());
            }
            match ch.check_wait(&deadline) {
                Some(WaitError::Closed) => return Err(SendError::Closed(msg)),
                Some(WaitError::Cancelled) => return Err(SendError::Cancelled(msg)),
                Some(WaitError::Timeout) => return Err(SendError::Timeout(msg)),
                None => {}
            }
            let cur = fiber::current();
            let pad = WaitPad {
                msg: Cell::new(Some(msg)),
                status: Cell::new(WaitStatus::Writer),
            };
            let _pad_guard = PadGuard::publish(&cur, &pad);
            if first_try {
                ch.waiters.park_tail(&cur);
                first_try = false;
            } else {
                ch.waiters.park_head(&cur);
            }
            fiber::yield_timeout_seconds(deadline.remaining());
            // On timeout or spurious wakeup the entry is still queued.
            ch.waiters.unlink(&cur);
            match pad.status.get() {
                WaitStatus::Done => return Ok(()),
                // Do not touch the channel: it may already be gone.
                WaitStatus::Closed => {
                    return Err(SendError::Closed(pad.msg.take().expect("pad lost its message")))
                }
                _ => msg = pad.msg.take().expect("pad lost its message"),
            }
        }
    }

    /// Non-blocking send.
    pub fn try_send(&self, msg: T) -> Result<(), TrySendError<T>> {
        self.send_timeout(msg, Duration::ZERO).map_err(From::from)
    }

    /// Receive a message, blocking while the channel is empty.
    pub fn recv(&self) -> Result<T, RecvError> {
        self.recv_timeout(clock::INFINITY)
    }

    /// [`recv`](Self::recv) with a deadline.
    ///
    /// This function may perform a **yield**.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvError> {
        let ch = &*self.0;
        let deadline = Deadline::new(crate::ev::to_seconds(timeout));
        let mut first_try = true;
        loop {
            // Buffered messages arrived earlier than any parked writer, so
            // the buffer is drained first.
            if ch.count.get() > 0 {
                debug_assert!(!ch.is_closed.get());
                let msg = ch.buffer_pop();
                // Refill the freed slot from the head parked writer, if
                // any, to preserve the order of intended deliveries.
                if let Some(writer) = ch.first_waiter_with(WaitStatus::Writer) {
                    let refill = {
                        let pad = unsafe { pad_of::<T>(&writer) };
                        pad.msg.take().expect("parked writer has no message")
                    };
                    ch.buffer_push(refill);
                    ch.waiter_wakeup(&writer, WaitStatus::Done, None);
                }
                return Ok(msg);
            }
            // No buffered messages *but* a parked writer: only possible on
            // a rendezvous channel. Take the message directly.
            if let Some(writer) = ch.first_waiter_with(WaitStatus::Writer) {
                debug_assert_eq!(ch.buf.len(), 0);
                let msg = {
                    let pad = unsafe { pad_of::<T>(&writer) };
                    pad.msg.take().expect("parked writer has no message")
                };
                ch.waiter_wakeup(&writer, WaitStatus::Done, None);
                return Ok(msg);
            }
            match ch.check_wait(&deadline) {
                Some(WaitError::Closed) => return Err(RecvError::Closed),
                Some(WaitError::Cancelled) => return Err(RecvError::Cancelled),
                Some(WaitError::Timeout) => return Err(RecvError::Timeout),
                None => {}
            }
            let cur = fiber::current();
            let pad = WaitPad::<T> {
                msg: Cell::new(None),
                status: Cell::new(WaitStatus::Reader),
            };
            let _pad_guard = PadGuard::publish(&cur, &pad);
            if first_try {
                ch.waiters.park_tail(&cur);
                first_try = false;
            } else {
                ch.waiters.park_head(&cur);
            }
            fiber::yield_timeout_seconds(deadline.remaining());
            ch.waiters.unlink(&cur);
            match pad.status.get() {
                WaitStatus::Done => {
                    return Ok(pad.msg.take().expect("done without a message"))
                }
                WaitStatus::Closed => return Err(RecvError::Closed),
                _ => {}
            }
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.recv_timeout(Duration::ZERO).map_err(From::from)
    }

    /// Close the channel: drop every buffered message and wake every parked
    /// sender and receiver with a "closed" verdict. Idempotent; the channel
    /// never reopens.
    pub fn close(&self) {
        let ch = &*self.0;
        if ch.is_closed.get() {
            return;
        }
        while ch.count.get() > 0 {
            drop(ch.buffer_pop());
        }
        while let Some(waiter) = ch.waiters.first() {
            ch.waiter_wakeup(&waiter, WaitStatus::Closed, None);
        }
        ch.is_closed.set(true);
    }

    /// A blocking iterator over incoming messages; ends when the channel is
    /// closed (or the current fiber is cancelled).
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { ch: self }
    }

    /// A non-blocking iterator draining whatever is immediately available.
    pub fn try_iter(&self) -> TryIter<'_, T> {
        TryIter { ch: self }
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        // A parked fiber keeps the channel alive through its own clone, so
        // the queue must be empty by now.
        debug_assert!(self.waiters.is_empty());
    }
}

impl<T> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("is_closed", &self.is_closed())
            .finish()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Iterators
////////////////////////////////////////////////////////////////////////////////

pub struct Iter<'a, T> {
    ch: &'a Channel<T>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.ch.recv().ok()
    }
}

pub struct TryIter<'a, T> {
    ch: &'a Channel<T>,
}

impl<'a, T> Iterator for TryIter<'a, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.ch.try_recv().ok()
    }
}

impl<'a, T> IntoIterator for &'a Channel<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Errors
////////////////////////////////////////////////////////////////////////////////

/// Error of a blocking send. The undelivered message is returned to the
/// caller in every case.
#[derive(Debug, PartialEq, Eq)]
pub enum SendError<T> {
    Timeout(T),
    Closed(T),
    /// The sending fiber was cancelled while waiting.
    Cancelled(T),
}

impl<T> SendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Timeout(t) | Self::Closed(t) | Self::Cancelled(t) => t,
        }
    }
}

/// Error of a non-blocking send.
#[derive(Debug, PartialEq, Eq)]
pub enum TrySendError<T> {
    Full(T),
    Closed(T),
    Cancelled(T),
}

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(t) | Self::Closed(t) | Self::Cancelled(t) => t,
        }
    }
}

impl<T> From<SendError<T>> for TrySendError<T> {
    fn from(e: SendError<T>) -> Self {
        match e {
            SendError::Timeout(t) => Self::Full(t),
            SendError::Closed(t) => Self::Closed(t),
            SendError::Cancelled(t) => Self::Cancelled(t),
        }
    }
}

/// Error of a blocking receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    Timeout,
    Closed,
    /// The receiving fiber was cancelled while waiting.
    Cancelled,
}

/// Error of a non-blocking receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    Empty,
    Closed,
    Cancelled,
}

impl From<RecvError> for TryRecvError {
    fn from(e: RecvError) -> Self {
        match e {
            RecvError::Timeout => Self::Empty,
            RecvError::Closed => Self::Closed,
            RecvError::Cancelled => Self::Cancelled,
        }
    }
}
