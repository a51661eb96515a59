//! Buffered stream filter variant (spec §4.6): wraps an underlying
//! [`BufferedStream`] and pushes bytes through a pair of transform
//! functions on the way in and out, grounded on libevent's
//! `bufferevent_filter.c` (`bufferevent_filter_new`, the three-way
//! `BEV_OK`/`BEV_NEED_MORE`/`BEV_ERROR` result, and `normal`/`flush`/
//! `finished` processing modes).

use std::cell::RefCell;
use std::rc::Rc;

use crate::base::EventBase;
use crate::buffer::ByteBuffer;
use crate::error::Result;
use crate::interest::EventFlags;
use crate::stream::socket::{BufferedStream, DataCallback, StreamEventCallback};
use crate::stream::{StreamEvent, Watermarks};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FilterMode {
    Normal,
    Flush,
    Finished,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FilterResult {
    Ok,
    NeedMore,
    Error,
}

pub type FilterFn = Box<dyn FnMut(&mut ByteBuffer, &mut ByteBuffer, usize, FilterMode) -> FilterResult>;

struct Inner {
    underlying: BufferedStream,
    input: ByteBuffer,
    output: ByteBuffer,
    input_filter: Option<FilterFn>,
    output_filter: Option<FilterFn>,
    read_wm: Watermarks,
    on_read: Option<DataCallback>,
    on_write: Option<DataCallback>,
    on_event: Option<StreamEventCallback>,
}

/// A stream that transforms bytes through `input_filter`/`output_filter`
/// as they cross an underlying [`BufferedStream`].
#[derive(Clone)]
pub struct BufferedFilter {
    inner: Rc<RefCell<Inner>>,
}

impl BufferedFilter {
    pub fn new(
        base: &mut EventBase,
        underlying: BufferedStream,
        input_filter: FilterFn,
        output_filter: FilterFn,
    ) -> Result<BufferedFilter> {
        let filter = BufferedFilter {
            inner: Rc::new(RefCell::new(Inner {
                underlying: underlying.clone(),
                input: ByteBuffer::new(),
                output: ByteBuffer::new(),
                input_filter: Some(input_filter),
                output_filter: Some(output_filter),
                read_wm: Watermarks::default(),
                on_read: None,
                on_write: None,
                on_event: None,
            })),
        };

        let on_underlying_read = filter.clone();
        let on_underlying_event = filter.clone();
        underlying.set_callbacks(
            Some(Box::new(move |stream: &BufferedStream, base: &mut EventBase| {
                on_underlying_read.pump_input(stream, base);
            })),
            None,
            Some(Box::new(move |_stream, base, event| {
                on_underlying_event.propagate_event(base, event);
            })),
        );
        underlying.enable(base, EventFlags::READ)?;
        Ok(filter)
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

    pub fn set_read_watermark(&self, wm: Watermarks) {
        self.inner.borrow_mut().read_wm = wm;
    }

    pub fn input_len(&self) -> usize {
        self.inner.borrow().input.len()
    }

    pub fn read(&self, dst: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.borrow_mut();
        let n = inner.input.copyout(0, dst)?;
        inner.input.drain(n)?;
        Ok(n)
    }

    /// Pushes `data` through the output filter into the underlying
    /// stream's output buffer, then arms the underlying stream for write.
    pub fn write(&self, base: &mut EventBase, data: &[u8]) -> Result<()> {
        self.inner.borrow_mut().output.append(data)?;
        {
            let mut output_filter = self.inner.borrow_mut().output_filter.take();
            let underlying = self.inner.borrow().underlying.clone();
            underlying.with_output(|dst| {
                let mut inner = self.inner.borrow_mut();
                if let Some(f) = output_filter.as_mut() {
                    f(&mut inner.output, dst, usize::MAX, FilterMode::Normal);
                }
            });
            self.inner.borrow_mut().output_filter = output_filter;
        }
        let underlying = self.inner.borrow().underlying.clone();
        underlying.enable(base, EventFlags::WRITE)
    }

    pub fn flush(&self, base: &mut EventBase) -> Result<()> {
        {
            let mut output_filter = self.inner.borrow_mut().output_filter.take();
            let underlying = self.inner.borrow().underlying.clone();
            underlying.with_output(|dst| {
                let mut inner = self.inner.borrow_mut();
                if let Some(f) = output_filter.as_mut() {
                    f(&mut inner.output, dst, usize::MAX, FilterMode::Flush);
                }
            });
            self.inner.borrow_mut().output_filter = output_filter;
        }
        let underlying = self.inner.borrow().underlying.clone();
        underlying.enable(base, EventFlags::WRITE)
    }

    fn pump_input(&self, underlying: &BufferedStream, base: &mut EventBase) {
        let wm_high = self.inner.borrow().read_wm.high;
        underlying.with_input(|src| loop {
            if src.is_empty() {
                break;
            }
            if self.inner.borrow().input.len() >= wm_high {
                break;
            }
            // Pulled out of `inner` for the call so `input_filter`
            // (needs `&mut`) and `inner.input` (the destination it
            // writes into) aren't borrowed from the same place at once.
            let mut filter_fn = self.inner.borrow_mut().input_filter.take();
            let Some(f) = filter_fn.as_mut() else { break };
            let result = {
                let mut inner = self.inner.borrow_mut();
                f(src, &mut inner.input, wm_high, FilterMode::Normal)
            };
            self.inner.borrow_mut().input_filter = filter_fn;
            if result != FilterResult::Ok {
                break;
            }
        });

        let (len, low) = {
            let inner = self.inner.borrow();
            (inner.input.len(), inner.read_wm.low)
        };
        if len >= low {
            let mut cb = self.inner.borrow_mut().on_read.take();
            if let Some(cb) = cb.as_mut() {
                // The filter itself has no public `BufferedStream` handle
                // to hand the callback; `underlying` stands in for it so
                // callers can still drive I/O.
                cb(underlying, base);
            }
            let mut inner = self.inner.borrow_mut();
            if inner.on_read.is_none() {
                inner.on_read = cb;
            }
        }
    }

    fn propagate_event(&self, base: &mut EventBase, event: StreamEvent) {
        let mut cb = self.inner.borrow_mut().on_event.take();
        let underlying = self.inner.borrow().underlying.clone();
        if let Some(cb) = cb.as_mut() {
            cb(&underlying, base, event);
        }
        let mut inner = self.inner.borrow_mut();
        if inner.on_event.is_none() {
            inner.on_event = cb;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{EventBase, RunFlags};
    use crate::stream::StreamOptions;
    use std::cell::RefCell as StdRefCell;

    fn socketpair() -> (std::os::unix::io::RawFd, std::os::unix::io::RawFd) {
        let mut fds = [0i32; 2];
        unsafe {
            assert_eq!(
                libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0, fds.as_mut_ptr()),
                0
            );
        }
        (fds[0], fds[1])
    }

    fn uppercase_filter() -> FilterFn {
        Box::new(|src, dst, _limit, _mode| {
            let mut buf = vec![0u8; src.len()];
            let n = src.copyout(0, &mut buf).unwrap();
            let _ = src.drain(n);
            for b in buf.iter_mut() {
                b.make_ascii_uppercase();
            }
            let _ = dst.append(&buf);
            FilterResult::Ok
        })
    }

    #[test]
    fn input_filter_uppercases_incoming_bytes() {
        let mut base = EventBase::new().unwrap();
        let (a_fd, b_fd) = socketpair();
        let a = BufferedStream::from_connected_fd(&mut base, a_fd, StreamOptions::CLOSE_ON_FREE).unwrap();
        let b = BufferedStream::from_connected_fd(&mut base, b_fd, StreamOptions::CLOSE_ON_FREE).unwrap();

        let filtered = BufferedFilter::new(&mut base, b, uppercase_filter(), uppercase_filter()).unwrap();
        let received = Rc::new(StdRefCell::new(Vec::new()));
        let received2 = received.clone();
        filtered.set_callbacks(
            Some(Box::new(move |_underlying, _base: &mut EventBase| {})),
            None,
            None,
        );
        let filtered2 = filtered.clone();
        filtered.set_callbacks(
            Some(Box::new(move |_underlying, _base: &mut EventBase| {
                let mut buf = vec![0u8; 64];
                let n = filtered2.read(&mut buf).unwrap();
                received2.borrow_mut().extend_from_slice(&buf[..n]);
            })),
            None,
            None,
        );

        a.enable(&mut base, EventFlags::WRITE).unwrap();
        a.write(&mut base, b"hello").unwrap();

        for _ in 0..5 {
            base.run(RunFlags::ONCE).unwrap();
            if !received.borrow().is_empty() {
                break;
            }
        }
        assert_eq!(*received.borrow(), b"HELLO");
    }
}
