//! Socket-backed buffered stream (spec §4.5), grounded on the teacher's
//! nonblocking fd handling (`net::tcp` read/write-until-`WouldBlock` loops)
//! and on libevent's `bufferevent_sock.c` state machine and exact
//! `BEV_EVENT_*`/`BEV_OPT_*` bit values.

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use crate::base::EventBase;
use crate::buffer::ByteBuffer;
use crate::error::Result;
use crate::event::{EventId, EventKey};
use crate::interest::EventFlags;
use crate::ratelimit::RateLimiter;
use crate::stream::{StreamEvent, StreamOptions, TriggerFlags, Watermarks};

const DEFAULT_MAX_SINGLE_READ: usize = 4096;
const DEFAULT_MAX_SINGLE_WRITE: usize = 4096;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Connecting,
    Open,
    Eof,
    Error,
}

/// Mirrors the teacher's `Handler::ready(&mut self, event_loop, ...)`
/// shape: the running base is threaded through so a callback can act on
/// other streams (e.g. echo a reply) without needing its own handle.
pub type DataCallback = Box<dyn FnMut(&BufferedStream, &mut EventBase)>;
pub type StreamEventCallback = Box<dyn FnMut(&BufferedStream, &mut EventBase, StreamEvent)>;

struct Inner {
    fd: RawFd,
    state: StreamState,
    input: ByteBuffer,
    output: ByteBuffer,
    read_wm: Watermarks,
    write_wm: Watermarks,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    max_single_read: usize,
    max_single_write: usize,
    options: StreamOptions,
    read_event: Option<EventId>,
    write_event: Option<EventId>,
    read_enabled: bool,
    write_enabled: bool,
    on_read: Option<DataCallback>,
    on_write: Option<DataCallback>,
    on_event: Option<StreamEventCallback>,
    limiter: Option<RateLimiter>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if self.options.contains(StreamOptions::CLOSE_ON_FREE) && self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

/// A reference-counted handle to a buffered socket stream. Cloning is the
/// spec's `incref`; dropping the last clone is `decref` and runs cleanup.
#[derive(Clone)]
pub struct BufferedStream {
    inner: Rc<RefCell<Inner>>,
}

impl BufferedStream {
    fn new_internal(fd: RawFd, state: StreamState, options: StreamOptions) -> BufferedStream {
        BufferedStream {
            inner: Rc::new(RefCell::new(Inner {
                fd,
                state,
                input: ByteBuffer::new(),
                output: ByteBuffer::new(),
                read_wm: Watermarks::default(),
                write_wm: Watermarks::default(),
                read_timeout: None,
                write_timeout: None,
                max_single_read: DEFAULT_MAX_SINGLE_READ,
                max_single_write: DEFAULT_MAX_SINGLE_WRITE,
                options,
                read_event: None,
                write_event: None,
                read_enabled: false,
                write_enabled: false,
                on_read: None,
                on_write: None,
                on_event: None,
                limiter: None,
            })),
        }
    }

    /// Wraps an already-connected, non-blocking fd (e.g. one returned by
    /// `accept`); starts in the `open` state.
    pub fn from_connected_fd(base: &mut EventBase, fd: RawFd, options: StreamOptions) -> Result<BufferedStream> {
        let stream = BufferedStream::new_internal(fd, StreamState::Open, options);
        stream.register_events(base)?;
        Ok(stream)
    }

    /// Wraps a non-blocking fd with a `connect()` already in flight;
    /// transitions to `open`/`error` on the first writable event.
    pub fn connecting(base: &mut EventBase, fd: RawFd, options: StreamOptions) -> Result<BufferedStream> {
        let stream = BufferedStream::new_internal(fd, StreamState::Connecting, options);
        stream.register_events(base)?;
        stream.enable(base, EventFlags::WRITE)?;
        Ok(stream)
    }

    fn register_events(&self, base: &mut EventBase) -> Result<()> {
        let fd = self.inner.borrow().fd;
        let read_self = self.clone();
        let read_id = base.new_event(
            EventKey::Fd(fd),
            EventFlags::READ | EventFlags::PERSIST,
            None,
            Box::new(move |base, _id, flags| read_self.on_readable(base, flags)),
        )?;
        let write_self = self.clone();
        let write_id = base.new_event(
            EventKey::Fd(fd),
            EventFlags::WRITE | EventFlags::PERSIST,
            None,
            Box::new(move |base, _id, flags| write_self.on_writable(base, flags)),
        )?;
        let mut inner = self.inner.borrow_mut();
        inner.read_event = Some(read_id);
        inner.write_event = Some(write_id);
        Ok(())
    }

    pub fn state(&self) -> StreamState {
        self.inner.borrow().state
    }

    pub fn set_callbacks(
        &self,
        on_read: Option<DataCallback>,
        on_write: Option<DataCallback>,
        on_event: Option<StreamEventCallback>,
    ) {
        let mut inner = self.inner.borrow_mut();
        inner.on_read = on_read;
        inner.on_write = on_write;
        inner.on_event = on_event;
    }

    pub fn set_watermarks(&self, read: Option<Watermarks>, write: Option<Watermarks>) {
        let mut inner = self.inner.borrow_mut();
        if let Some(w) = read {
            inner.read_wm = w;
        }
        if let Some(w) = write {
            inner.write_wm = w;
        }
    }

    pub fn set_timeouts(&self, read: Option<Duration>, write: Option<Duration>) {
        let mut inner = self.inner.borrow_mut();
        inner.read_timeout = read;
        inner.write_timeout = write;
    }

    pub fn set_rate_limiter(&self, limiter: Option<RateLimiter>) {
        self.inner.borrow_mut().limiter = limiter;
    }

    pub fn set_max_single_read(&self, n: usize) {
        self.inner.borrow_mut().max_single_read = n;
    }

    pub fn set_max_single_write(&self, n: usize) {
        self.inner.borrow_mut().max_single_write = n;
    }

    /// Which of `read`/`write` are currently enabled on this stream.
    pub fn get_enabled(&self) -> EventFlags {
        let inner = self.inner.borrow();
        let mut flags = EventFlags::EMPTY;
        if inner.read_enabled {
            flags |= EventFlags::READ;
        }
        if inner.write_enabled {
            flags |= EventFlags::WRITE;
        }
        flags
    }

    pub fn fd(&self) -> RawFd {
        self.inner.borrow().fd
    }

    pub fn incref(&self) -> BufferedStream {
        self.clone()
    }

    pub fn decref(self) {
        drop(self);
    }

    pub fn enable(&self, base: &mut EventBase, mask: EventFlags) -> Result<()> {
        if mask.contains(EventFlags::READ) {
            let (id, timeout) = {
                let mut inner = self.inner.borrow_mut();
                inner.read_enabled = true;
                (inner.read_event, inner.read_timeout)
            };
            if let Some(id) = id {
                base.add(id, timeout)?;
            }
        }
        if mask.contains(EventFlags::WRITE) {
            let mut inner = self.inner.borrow_mut();
            inner.write_enabled = true;
            let has_output = !inner.output.is_empty();
            let id = inner.write_event;
            let timeout = inner.write_timeout;
            drop(inner);
            if has_output {
                if let Some(id) = id {
                    base.add(id, timeout)?;
                }
            }
        }
        Ok(())
    }

    pub fn disable(&self, base: &mut EventBase, mask: EventFlags) -> Result<()> {
        if mask.contains(EventFlags::READ) {
            let id = {
                let mut inner = self.inner.borrow_mut();
                inner.read_enabled = false;
                inner.read_event
            };
            if let Some(id) = id {
                let _ = base.del(id);
            }
        }
        if mask.contains(EventFlags::WRITE) {
            let id = {
                let mut inner = self.inner.borrow_mut();
                inner.write_enabled = false;
                inner.write_event
            };
            if let Some(id) = id {
                let _ = base.del(id);
            }
        }
        Ok(())
    }

    /// Appends to the output buffer, arming write interest if it was
    /// previously idle because output was empty (spec §4.5: "writes are
    /// registered lazily").
    pub fn write(&self, base: &mut EventBase, data: &[u8]) -> Result<()> {
        let (was_empty, write_enabled, id, timeout) = {
            let mut inner = self.inner.borrow_mut();
            let was_empty = inner.output.is_empty();
            inner.output.append(data)?;
            (was_empty, inner.write_enabled, inner.write_event, inner.write_timeout)
        };
        if was_empty && write_enabled {
            if let Some(id) = id {
                base.add(id, timeout)?;
            }
        }
        Ok(())
    }

    pub fn input_len(&self) -> usize {
        self.inner.borrow().input.len()
    }

    pub fn output_len(&self) -> usize {
        self.inner.borrow().output.len()
    }

    /// Copies up to `dst.len()` bytes out of the input buffer, draining
    /// them.
    pub fn read(&self, dst: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.borrow_mut();
        let n = inner.input.copyout(0, dst)?;
        inner.input.drain(n)?;
        Ok(n)
    }

    pub fn with_input<R>(&self, f: impl FnOnce(&mut ByteBuffer) -> R) -> R {
        f(&mut self.inner.borrow_mut().input)
    }

    pub fn with_output<R>(&self, f: impl FnOnce(&mut ByteBuffer) -> R) -> R {
        f(&mut self.inner.borrow_mut().output)
    }

    fn fire_event(&self, base: &mut EventBase, event: StreamEvent) {
        let mut cb = self.inner.borrow_mut().on_event.take();
        if let Some(cb) = cb.as_mut() {
            cb(self, base, event);
        }
        let mut inner = self.inner.borrow_mut();
        if inner.on_event.is_none() {
            inner.on_event = cb;
        }
    }

    fn fire_read(&self, base: &mut EventBase) {
        let mut cb = self.inner.borrow_mut().on_read.take();
        if let Some(cb) = cb.as_mut() {
            cb(self, base);
        }
        let mut inner = self.inner.borrow_mut();
        if inner.on_read.is_none() {
            inner.on_read = cb;
        }
    }

    fn fire_write(&self, base: &mut EventBase) {
        let mut cb = self.inner.borrow_mut().on_write.take();
        if let Some(cb) = cb.as_mut() {
            cb(self, base);
        }
        let mut inner = self.inner.borrow_mut();
        if inner.on_write.is_none() {
            inner.on_write = cb;
        }
    }

    fn on_readable(&self, base: &mut EventBase, observed: EventFlags) {
        if observed.contains(EventFlags::TIMEOUT) {
            self.inner.borrow_mut().state = StreamState::Error;
            let _ = self.disable(base, EventFlags::READ);
            self.fire_event(base, StreamEvent::TIMEOUT | StreamEvent::READING);
            return;
        }

        let fd = self.inner.borrow().fd;
        let max_read = {
            let inner = self.inner.borrow();
            let cap = inner.max_single_read;
            match &inner.limiter {
                Some(_) => cap, // per-stream limiter checked below via consume_read
                None => cap,
            }
        };
        let allowed = {
            let mut inner = self.inner.borrow_mut();
            match inner.limiter.as_mut() {
                Some(limiter) => limiter.consume_read(max_read),
                None => max_read,
            }
        };
        if allowed == 0 {
            return;
        }

        let mut scratch = vec![0u8; allowed];
        let n = unsafe { libc::read(fd, scratch.as_mut_ptr() as *mut _, allowed) };
        if n > 0 {
            scratch.truncate(n as usize);
            {
                let mut inner = self.inner.borrow_mut();
                let _ = inner.input.append(&scratch);
            }
            let (len, high, low) = {
                let inner = self.inner.borrow();
                (inner.input.len(), inner.read_wm.high, inner.read_wm.low)
            };
            if len >= high {
                let _ = self.disable(base, EventFlags::READ);
            }
            if len >= low {
                self.fire_read(base);
            }
        } else if n == 0 {
            self.inner.borrow_mut().state = StreamState::Eof;
            self.fire_event(base, StreamEvent::EOF | StreamEvent::READING);
        } else {
            let err = std::io::Error::last_os_error();
            if matches!(err.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EINTR)) {
                return;
            }
            self.inner.borrow_mut().state = StreamState::Error;
            self.fire_event(base, StreamEvent::ERROR | StreamEvent::READING);
        }
    }

    fn on_writable(&self, base: &mut EventBase, observed: EventFlags) {
        if observed.contains(EventFlags::TIMEOUT) {
            self.inner.borrow_mut().state = StreamState::Error;
            let _ = self.disable(base, EventFlags::WRITE);
            self.fire_event(base, StreamEvent::TIMEOUT | StreamEvent::WRITING);
            return;
        }

        let connecting = self.inner.borrow().state == StreamState::Connecting;
        if connecting {
            let fd = self.inner.borrow().fd;
            let mut err: libc::c_int = 0;
            let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
            let rc = unsafe {
                libc::getsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_ERROR,
                    &mut err as *mut _ as *mut _,
                    &mut len,
                )
            };
            if rc == 0 && err == 0 {
                self.inner.borrow_mut().state = StreamState::Open;
                self.fire_event(base, StreamEvent::CONNECTED);
            } else {
                self.inner.borrow_mut().state = StreamState::Error;
                self.fire_event(base, StreamEvent::ERROR);
                return;
            }
        }

        let fd = self.inner.borrow().fd;
        let max_write = self.inner.borrow().max_single_write;
        let allowed = {
            let mut inner = self.inner.borrow_mut();
            match inner.limiter.as_mut() {
                Some(limiter) => limiter.consume_write(max_write),
                None => max_write,
            }
        };
        if allowed == 0 || self.inner.borrow().output.is_empty() {
            return;
        }

        let mut chunk = vec![0u8; allowed.min(self.inner.borrow().output.len())];
        {
            let mut inner = self.inner.borrow_mut();
            let n = inner.output.copyout(0, &mut chunk).unwrap_or(0);
            chunk.truncate(n);
        }
        let n = unsafe { libc::write(fd, chunk.as_ptr() as *const _, chunk.len()) };
        if n > 0 {
            let mut inner = self.inner.borrow_mut();
            let _ = inner.output.drain(n as usize);
            let (len, low) = (inner.output.len(), inner.write_wm.low);
            drop(inner);
            if len <= low {
                self.fire_write(base);
            }
            if len == 0 {
                let _ = self.disable(base, EventFlags::WRITE);
            }
        } else if n < 0 {
            let err = std::io::Error::last_os_error();
            if matches!(err.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EINTR)) {
                return;
            }
            self.inner.borrow_mut().state = StreamState::Error;
            self.fire_event(base, StreamEvent::ERROR | StreamEvent::WRITING);
        }
    }

    /// Synthesizes callbacks without advancing actual I/O.
    pub fn trigger(&self, base: &mut EventBase, io: EventFlags, flags: TriggerFlags) {
        let ignore_wm = flags.contains(TriggerFlags::IGNORE_WATERMARKS);
        if io.contains(EventFlags::READ) {
            let ready = ignore_wm || self.inner.borrow().input.len() >= self.inner.borrow().read_wm.low;
            if ready {
                self.fire_read(base);
            }
        }
        if io.contains(EventFlags::WRITE) {
            let ready = ignore_wm || self.inner.borrow().output.len() <= self.inner.borrow().write_wm.low;
            if ready {
                self.fire_write(base);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{EventBase, RunFlags};
    use std::cell::RefCell as StdRefCell;

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        unsafe {
            assert_eq!(
                libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0, fds.as_mut_ptr()),
                0
            );
        }
        (fds[0], fds[1])
    }

    #[test]
    fn write_then_read_roundtrips_over_socketpair() {
        let mut base = EventBase::new().unwrap();
        let (a_fd, b_fd) = socketpair();
        let a = BufferedStream::from_connected_fd(&mut base, a_fd, StreamOptions::CLOSE_ON_FREE).unwrap();
        let b = BufferedStream::from_connected_fd(&mut base, b_fd, StreamOptions::CLOSE_ON_FREE).unwrap();

        let received = Rc::new(StdRefCell::new(Vec::new()));
        let received2 = received.clone();
        b.set_callbacks(
            Some(Box::new(move |stream: &BufferedStream, _base: &mut EventBase| {
                let mut buf = vec![0u8; 64];
                let n = stream.read(&mut buf).unwrap();
                received2.borrow_mut().extend_from_slice(&buf[..n]);
            })),
            None,
            None,
        );

        a.enable(&mut base, EventFlags::READ | EventFlags::WRITE).unwrap();
        b.enable(&mut base, EventFlags::READ).unwrap();
        a.write(&mut base, b"hello").unwrap();

        for _ in 0..5 {
            base.run(RunFlags::ONCE).unwrap();
            if !received.borrow().is_empty() {
                break;
            }
        }
        assert_eq!(*received.borrow(), b"hello");
    }

    #[test]
    fn high_watermark_suspends_read_interest() {
        let mut base = EventBase::new().unwrap();
        let (a_fd, b_fd) = socketpair();
        let a = BufferedStream::from_connected_fd(&mut base, a_fd, StreamOptions::CLOSE_ON_FREE).unwrap();
        let b = BufferedStream::from_connected_fd(&mut base, b_fd, StreamOptions::CLOSE_ON_FREE).unwrap();
        b.set_watermarks(Some(Watermarks { low: 0, high: 2 }), None);
        b.enable(&mut base, EventFlags::READ).unwrap();
        a.enable(&mut base, EventFlags::WRITE).unwrap();
        a.write(&mut base, b"abcdef").unwrap();

        for _ in 0..5 {
            base.run(RunFlags::ONCE).unwrap();
        }
        assert!(!b.inner.borrow().read_enabled || b.input_len() >= 2);
    }

    #[test]
    fn get_enabled_and_fd_accessors_reflect_state() {
        let mut base = EventBase::new().unwrap();
        let (a_fd, _b_fd) = socketpair();
        let a = BufferedStream::from_connected_fd(&mut base, a_fd, StreamOptions::CLOSE_ON_FREE).unwrap();
        assert_eq!(a.get_enabled(), EventFlags::EMPTY);
        assert_eq!(a.fd(), a_fd);

        a.enable(&mut base, EventFlags::READ).unwrap();
        assert_eq!(a.get_enabled(), EventFlags::READ);

        a.set_max_single_read(128);
        a.set_max_single_write(128);
        assert_eq!(a.inner.borrow().max_single_read, 128);
        assert_eq!(a.inner.borrow().max_single_write, 128);
    }
}
