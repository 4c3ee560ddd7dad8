//! Blocking-to-Async Stream Adaptation
//!
//! Inference clients hand back blocking, pull-based iterators. This module
//! turns them into `futures::Stream`s that never block the runtime: every
//! pull runs on tokio's blocking pool and the calling task only awaits it.
//!
//! # Architecture
//!
//! ```text
//!   request task                     blocking pool
//!   ────────────                     ─────────────
//!   poll_next() ──spawn_blocking──▶  iter.next()
//!        │                               │
//!        │ ◀──── Pull::Token(iter, t) ───┤   iterator handed back
//!        │ ◀──── Pull::Done ─────────────┤   normal end (sentinel)
//!        │ ◀──── Pull::Failed(err) ──────┘   error end
//!        ▼
//!   AdapterEvent::Token / AdapterEvent::Failed / None
//! ```
//!
//! The iterator is owned by whichever side is currently running it, so
//! anything it carries (such as a pool lease) is dropped exactly when the
//! sequence ends or the consumer goes away.

mod blocking;

pub use blocking::{AdapterEvent, BlockingTokenStream};
