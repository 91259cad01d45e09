//! Cooperative fiber runtime: cords, fibers and fiber-aware I/O.
//!
//! This library is the execution substrate of a single-process,
//! multi-threaded event-driven server. The building blocks:
//!
//! - [Cords](cord): one OS thread + one event loop + a pool of fibers.
//!   [`cord::run`] turns the current thread into a cord; [`cord::costart`]
//!   spawns additional ones; [`cord::CordHandle::cojoin`] joins them
//!   without blocking the calling cord.
//! - [Fibers](fiber): cooperative tasks with their own stacks, scheduled
//!   FIFO, with advisory cancellation, joinable termination, fiber-local
//!   storage and a per-fiber scratch [region].
//! - [CoIO](coio): sockets whose reads, writes, connects and accepts park
//!   the calling fiber on the event loop instead of blocking the thread,
//!   plus an accept-loop [service](coio::CoioService).
//! - [CoEIO](coeio): a worker-thread pool offloading genuinely blocking
//!   calls (file I/O, `getaddrinfo`) while the fiber yields.
//! - [Channels](fiber::Channel), [mutexes](fiber::Mutex),
//!   [latches](fiber::Latch) and [conds](fiber::Cond) for coordination
//!   between the fibers of one cord.
//!
//! A minimal program:
//!
//! ```no_run
//! use cordage::fiber;
//!
//! cordage::cord::run(|| {
//!     let ch = fiber::Channel::new(0);
//!     let tx = ch.clone();
//!     let producer = fiber::start_proc(move || {
//!         tx.send("ping").unwrap();
//!     });
//!     assert_eq!(ch.recv().unwrap(), "ping");
//!     producer.join();
//! })
//! .unwrap();
//! ```
//!
//! Everything in this crate is single-thread-affine by design: fibers,
//! channels and locks never leave the cord that created them. The only
//! cross-thread surfaces are cord start/join and the offload pool.

pub mod clock;
pub mod coeio;
pub mod coio;
pub mod cord;
mod coro;
pub mod error;
mod ev;
pub mod fiber;
pub mod log;
pub mod region;

pub use error::{Error, Result};
