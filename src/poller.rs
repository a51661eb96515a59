//! The poller backend capability described in spec §4.1: a thin
//! abstraction over an OS readiness mechanism, batched and flushed lazily
//! before `wait`.

use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::interest::EventFlags;
use crate::sys::{Events, ReadyEvent, Selector};
use crate::token::Token;

/// What an implementation of [`Poller`] can and can't do, surfaced to
/// callers via [`Poller::capabilities`].
#[derive(Copy, Clone, Debug, Default)]
pub struct Capabilities {
    pub supports_edge_triggered: bool,
    pub supports_o1_readiness: bool,
    pub supports_fds_not_just_sockets: bool,
    pub supports_early_close: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ChangeOp {
    Add(EventFlags),
    Modify(EventFlags),
    Delete,
}

#[derive(Copy, Clone, Debug)]
struct Change {
    fd: RawFd,
    token: Token,
    op: ChangeOp,
}

/// Registers/deregisters interest in file descriptors and blocks until one
/// becomes ready or a deadline passes.
///
/// Add/modify/delete calls are batched into a change list and flushed lazily
/// right before [`Poller::wait`] fires the real `epoll_ctl` calls — unless
/// `coalesce_dup_fds` is false, in which case every call flushes
/// immediately, because the caller has not warranted that no `dup`-derived
/// alias of a registered fd exists (spec §4.1).
pub struct EpollPoller {
    selector: Selector,
    events: Events,
    changes: Vec<Change>,
    batch_changes: bool,
}

impl EpollPoller {
    pub fn new(events_capacity: usize) -> io::Result<EpollPoller> {
        Ok(EpollPoller {
            selector: Selector::new()?,
            events: Events::with_capacity(events_capacity),
            changes: Vec::new(),
            batch_changes: false,
        })
    }

    /// Enables change-list batching. Per spec §4.1 this must not be turned
    /// on unless the caller warrants that no two registered fds alias the
    /// same underlying file description via `dup`.
    pub fn set_batch_changelist(&mut self, enabled: bool) {
        self.batch_changes = enabled;
    }

    pub fn add(&mut self, fd: RawFd, token: Token, interest: EventFlags) -> io::Result<()> {
        if self.batch_changes {
            self.changes.push(Change {
                fd,
                token,
                op: ChangeOp::Add(interest),
            });
            Ok(())
        } else {
            self.selector.add(fd, token, interest)
        }
    }

    pub fn modify(&mut self, fd: RawFd, token: Token, interest: EventFlags) -> io::Result<()> {
        if self.batch_changes {
            self.changes.push(Change {
                fd,
                token,
                op: ChangeOp::Modify(interest),
            });
            Ok(())
        } else {
            self.selector.modify(fd, token, interest)
        }
    }

    pub fn delete(&mut self, fd: RawFd) -> io::Result<()> {
        if self.batch_changes {
            self.changes.push(Change {
                fd,
                token: Token(0),
                op: ChangeOp::Delete,
            });
            Ok(())
        } else {
            self.selector.delete(fd)
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        for change in self.changes.drain(..) {
            let result = match change.op {
                ChangeOp::Add(interest) => self.selector.add(change.fd, change.token, interest),
                ChangeOp::Modify(interest) => {
                    self.selector.modify(change.fd, change.token, interest)
                }
                ChangeOp::Delete => self.selector.delete(change.fd),
            };
            // A late DEL racing a close(2) on the same fd is expected and
            // harmless; anything else bubbles up.
            if let Err(err) = result {
                if err.raw_os_error() != Some(libc::ENOENT) && err.raw_os_error() != Some(libc::EBADF) {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Blocks until a readiness is observed or `deadline` passes, returning
    /// the set of `(token, flags)` pairs that fired.
    pub fn wait(&mut self, deadline: Option<Instant>) -> io::Result<Vec<ReadyEvent>> {
        self.flush()?;
        let timeout = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        self.selector.select(&mut self.events, timeout)?;
        Ok(self.events.iter().collect())
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_edge_triggered: true,
            supports_o1_readiness: true,
            supports_fds_not_just_sockets: true,
            supports_early_close: true,
        }
    }
}

impl std::fmt::Debug for EpollPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpollPoller")
            .field("pending_changes", &self.changes.len())
            .field("batch_changes", &self.batch_changes)
            .finish()
    }
}

pub fn clamp_timeout(deadline: Option<Instant>, cap: Duration) -> Option<Duration> {
    match deadline {
        None => None,
        Some(d) => {
            let remaining = d.saturating_duration_since(Instant::now());
            Some(remaining.min(cap))
        }
    }
}
