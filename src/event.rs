//! The event record (spec §3, "Event"): a registered interest plus its
//! callback, dynamic state, and scheduling metadata.

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::base::EventBase;
use crate::interest::EventFlags;
use crate::token::Token;

/// Opaque handle to a registered [`Event`]. Stable across `add`/`del`
/// cycles; reused only after the slot has been freed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct EventId {
    pub(crate) index: usize,
    pub(crate) generation: u64,
}

/// What an event is watching.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventKey {
    Fd(RawFd),
    Signal(i32),
    /// A pure timer with no fd/signal backing.
    Timer,
    /// A user-activated event; fires only via `EventBase::activate`.
    User,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum EventState {
    Unassigned,
    Pending,
    Active,
    Finalizing,
}

pub type Callback = Box<dyn FnMut(&mut EventBase, EventId, EventFlags)>;

/// A registered interest: key, flags, optional timeout, priority, and the
/// callback invoked on activation.
///
/// Invariants (spec §3): an event is pending XOR unregistered; a
/// `persistent` event remains pending after firing; a non-persistent event
/// becomes non-pending once activated; an event belongs to exactly one
/// base (enforced by `EventId` only being valid against the base that
/// produced it).
pub struct Event {
    pub(crate) key: EventKey,
    pub(crate) flags: EventFlags,
    pub(crate) timeout: Option<Duration>,
    pub(crate) priority: usize,
    pub(crate) callback: Option<Callback>,
    pub(crate) state: EventState,
    pub(crate) timer_handle: Option<crate::timer::TimerHandle>,
    pub(crate) timer_deadline: Option<Instant>,
    pub(crate) token: Token,
    pub(crate) generation: u64,
}

impl Event {
    pub fn key(&self) -> EventKey {
        self.key
    }

    pub fn flags(&self) -> EventFlags {
        self.flags
    }

    pub fn priority(&self) -> usize {
        self.priority
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, EventState::Pending | EventState::Active)
    }

    pub fn is_persistent(&self) -> bool {
        self.flags.contains(EventFlags::PERSIST)
    }
}
