//! Platform backend selection.
//!
//! Spec §1 scopes "platform backend fallbacks beyond the abstraction
//! described in §4.1" out of this core; only the epoll backend is built
//! in, reached through the [`crate::poller::Poller`] trait so another
//! backend (kqueue, IOCP) could be added later without touching the
//! reactor above it.

#[cfg(unix)]
pub mod unix;

#[cfg(unix)]
pub use unix::{Events, ReadyEvent, Selector, Waker};
