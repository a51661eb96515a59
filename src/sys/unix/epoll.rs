//! Thin wrapper over `epoll(7)`, grounded on the teacher's own
//! `sys::unix::epoll::Selector`.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use std::{cmp, i32};

use libc::{self, c_int};
use libc::{EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP};

use crate::interest::EventFlags;
use crate::token::Token;

fn cvt(ret: c_int) -> io::Result<c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// One OS-level readiness mechanism instance (one `epoll_create1` fd).
///
/// This is the concrete backend behind the [`crate::poller::Poller`]
/// capability trait described in spec §4.1.
#[derive(Debug)]
pub struct Selector {
    epfd: RawFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let epfd = unsafe { cvt(libc::epoll_create1(libc::EPOLL_CLOEXEC))? };
        Ok(Selector { epfd })
    }

    pub fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms = timeout
            .map(|to| cmp::min(millis(to), i32::MAX as u64) as i32)
            .unwrap_or(-1);

        events.raw.clear();
        unsafe {
            let cnt = cvt(libc::epoll_wait(
                self.epfd,
                events.raw.as_mut_ptr(),
                events.raw.capacity() as i32,
                timeout_ms,
            ))?;
            events.raw.set_len(cnt as usize);
        }
        Ok(events.raw.len())
    }

    pub fn add(&self, fd: RawFd, token: Token, interest: EventFlags) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: flags_to_epoll(interest),
            u64: token.0 as u64,
        };
        unsafe { cvt(libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut info))? };
        Ok(())
    }

    pub fn modify(&self, fd: RawFd, token: Token, interest: EventFlags) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: flags_to_epoll(interest),
            u64: token.0 as u64,
        };
        unsafe { cvt(libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut info))? };
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        // Linux < 2.6.9 required a non-null event pointer even for DEL.
        let mut info = libc::epoll_event { events: 0, u64: 0 };
        unsafe { cvt(libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut info))? };
        Ok(())
    }
}

fn flags_to_epoll(interest: EventFlags) -> u32 {
    let mut kind = 0;
    if interest.is_readable() {
        kind |= EPOLLIN;
    }
    if interest.is_writable() {
        kind |= EPOLLOUT;
    }
    kind |= EPOLLRDHUP;
    if interest.contains(EventFlags::EDGE_TRIGGERED) {
        kind |= EPOLLET;
    }
    if interest.contains(EventFlags::FINALIZE_SAFE) {
        kind |= EPOLLONESHOT;
    }
    kind as u32
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.epfd);
        }
    }
}

/// A single observed readiness: which token fired, with what flags.
#[derive(Copy, Clone, Debug)]
pub struct ReadyEvent {
    pub token: Token,
    pub flags: EventFlags,
}

pub struct Events {
    raw: Vec<libc::epoll_event>,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Events {
        Events {
            raw: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ReadyEvent> + '_ {
        self.raw.iter().map(|ev| {
            let epoll = ev.events as c_int;
            let mut flags = EventFlags::EMPTY;
            if epoll & EPOLLIN != 0 {
                flags |= EventFlags::READ;
            }
            if epoll & EPOLLOUT != 0 {
                flags |= EventFlags::WRITE;
            }
            if epoll & (EPOLLRDHUP | EPOLLHUP) != 0 {
                flags |= EventFlags::READ | EventFlags::CLOSE_DETECT;
            }
            if epoll & EPOLLERR != 0 {
                flags |= EventFlags::READ | EventFlags::WRITE;
            }
            ReadyEvent {
                token: Token(ev.u64 as usize),
                flags,
            }
        })
    }
}

fn millis(duration: Duration) -> u64 {
    let millis = u64::from(duration.subsec_millis());
    duration.as_secs().saturating_mul(1000).saturating_add(millis)
}
