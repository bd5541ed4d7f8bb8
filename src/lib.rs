//! A callback-based event loop.
//!
//! # Motivation
//!
//! This is the classic shape of an event loop: you register interests (a
//! file descriptor becoming readable or writable, a unix signal, a timeout)
//! together with a callback, then hand control to the loop and it calls you
//! back whenever one of the interests happens. No futures, no state machine
//! framework, just callbacks and a loop. That makes it a good fit both for
//! programs that genuinely want this control flow and as a substrate for
//! higher layers (buffered IO, protocol handling) to be built on.
//!
//! The loop itself doesn't talk to the kernel directly. It drives a
//! [Multiplexer](trait.Multiplexer.html), a small capability trait fronting
//! for whatever readiness mechanism the platform has. Two implementations
//! come built in (mio, which picks epoll or kqueue by itself, and a plain
//! `poll(2)` fallback) and the first one that comes up wins; embedders can
//! plug their own.
//!
//! # Design notes
//!
//! Events live inside the loop and are addressed through copyable
//! [handles](struct.Handle.html), so callbacks can freely add, re-arm or
//! delete events, including the very event being called. Deleting an event
//! from its own callback is explicitly fine.
//!
//! Events carry a priority. The dispatch drains exactly one priority level
//! per iteration, the most urgent non-empty one, which means a steadily busy
//! high-priority event starves everything below it. That's deliberate; if
//! you don't want it, don't split priorities.
//!
//! Timers prefer the monotonic clock. If a loop is driven by the wall clock
//! instead, a backwards clock jump is detected and all deadlines are
//! shifted, so a "fire in 100ms" stays a 100ms wait no matter what the
//! administrator does to the clock.
//!
//! # Thread safety
//!
//! There is none, on purpose. A loop belongs to one thread; use a loop per
//! thread if you need more. The only pieces touched from other contexts are
//! the async-signal-safe statics behind the signal bridge. Due to POSIX
//! rules, handling a given signal from more than one loop in one process
//! won't do what you want.
//!
//! # Examples
//!
//! ```
//! extern crate evloop;
//!
//! use std::cell::Cell;
//! use std::rc::Rc;
//! use std::time::Duration;
//!
//! use evloop::{DispatchFlags, Event, EventSet, Loop};
//!
//! fn main() {
//!     let mut ev_loop = Loop::new().unwrap();
//!     let ticks = Rc::new(Cell::new(0));
//!     let counter = ticks.clone();
//!     // A periodic timer that re-arms itself and gives up after 5 rounds
//!     let timer = ev_loop.register(Event::timer(move |l: &mut Loop, handle, res| {
//!         assert!(res.is_timeout());
//!         counter.set(counter.get() + 1);
//!         if counter.get() < 5 {
//!             l.add(handle, Some(Duration::from_millis(1))).unwrap();
//!         }
//!     }));
//!     ev_loop.add(timer, Some(Duration::from_millis(1))).unwrap();
//!     // Runs until the timer stops re-arming itself and nothing is left
//!     ev_loop.dispatch(DispatchFlags::empty()).unwrap();
//!     assert_eq!(5, ticks.get());
//! }
//! ```

#[macro_use]
extern crate log;
extern crate libc;
extern crate linked_hash_map;
extern crate mio;
extern crate nix;

pub mod error;
mod arena;
mod backend;
mod base;
mod clock;
mod heap;
mod mask;
mod signals;

pub use arena::Handle;
pub use backend::{Multiplexer, ReadyList};
pub use base::{Callback, Event, Exit, Loop};
pub use clock::Clock;
pub use mask::{DispatchFlags, EventSet};
