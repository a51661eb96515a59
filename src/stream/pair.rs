//! In-memory paired buffered stream (spec §4.7): two handles share a pair
//! of byte buffers arranged as a cross, with no underlying fd — grounded
//! on libevent's `bufferevent_pair.c` (`bufferevent_pair_new`), which runs
//! the same watermark/callback logic as the socket variant but moves bytes
//! directly between the two sides' buffers instead of doing real I/O.

use std::cell::RefCell;
use std::rc::Rc;

use crate::base::EventBase;
use crate::buffer::ByteBuffer;
use crate::error::Result;
use crate::stream::{StreamEvent, Watermarks};

pub type PairDataCallback = Box<dyn FnMut(&PairedStream, &mut EventBase)>;
pub type PairEventCallback = Box<dyn FnMut(&PairedStream, &mut EventBase, StreamEvent)>;

#[derive(Default)]
struct Side {
    read_wm: Watermarks,
    write_wm: Watermarks,
    read_enabled: bool,
    on_read: Option<PairDataCallback>,
    on_write: Option<PairDataCallback>,
    on_event: Option<PairEventCallback>,
}

struct Shared {
    // `a_to_b` holds bytes A has written that B has not yet read, and
    // vice versa for `b_to_a`.
    a_to_b: ByteBuffer,
    b_to_a: ByteBuffer,
    a: Side,
    b: Side,
}

/// One end of an in-memory paired stream; the peer is reachable only by
/// writing/reading through this handle (no direct reference is exposed,
/// mirroring the socket variant where callbacks only ever see `self`).
#[derive(Clone)]
pub struct PairedStream {
    shared: Rc<RefCell<Shared>>,
    is_a: bool,
}

/// Creates a cross-wired pair: bytes written to one side become readable
/// on the other.
pub fn buffered_pair() -> (PairedStream, PairedStream) {
    let shared = Rc::new(RefCell::new(Shared {
        a_to_b: ByteBuffer::new(),
        b_to_a: ByteBuffer::new(),
        a: Side { read_enabled: true, ..Side::default() },
        b: Side { read_enabled: true, ..Side::default() },
    }));
    (
        PairedStream { shared: shared.clone(), is_a: true },
        PairedStream { shared, is_a: false },
    )
}

impl PairedStream {
    fn outbound<'a>(&self, shared: &'a mut Shared) -> &'a mut ByteBuffer {
        if self.is_a {
            &mut shared.a_to_b
        } else {
            &mut shared.b_to_a
        }
    }

    fn inbound<'a>(&self, shared: &'a mut Shared) -> &'a mut ByteBuffer {
        if self.is_a {
            &mut shared.b_to_a
        } else {
            &mut shared.a_to_b
        }
    }

    fn own_side<'a>(&self, shared: &'a mut Shared) -> &'a mut Side {
        if self.is_a {
            &mut shared.a
        } else {
            &mut shared.b
        }
    }

    fn peer(&self) -> PairedStream {
        PairedStream { shared: self.shared.clone(), is_a: !self.is_a }
    }

    pub fn set_callbacks(
        &self,
        on_read: Option<PairDataCallback>,
        on_write: Option<PairDataCallback>,
        on_event: Option<PairEventCallback>,
    ) {
        let mut shared = self.shared.borrow_mut();
        let side = self.own_side(&mut shared);
        side.on_read = on_read;
        side.on_write = on_write;
        side.on_event = on_event;
    }

    pub fn set_watermarks(&self, read: Option<Watermarks>, write: Option<Watermarks>) {
        let mut shared = self.shared.borrow_mut();
        let side = self.own_side(&mut shared);
        if let Some(w) = read {
            side.read_wm = w;
        }
        if let Some(w) = write {
            side.write_wm = w;
        }
    }

    pub fn enable_read(&self) {
        let mut shared = self.shared.borrow_mut();
        self.own_side(&mut shared).read_enabled = true;
    }

    pub fn disable_read(&self) {
        let mut shared = self.shared.borrow_mut();
        self.own_side(&mut shared).read_enabled = false;
    }

    pub fn input_len(&self) -> usize {
        let mut shared = self.shared.borrow_mut();
        self.inbound(&mut shared).len()
    }

    pub fn output_len(&self) -> usize {
        let mut shared = self.shared.borrow_mut();
        self.outbound(&mut shared).len()
    }

    pub fn read(&self, dst: &mut [u8]) -> Result<usize> {
        let mut shared = self.shared.borrow_mut();
        let buf = self.inbound(&mut shared);
        let n = buf.copyout(0, dst)?;
        buf.drain(n)?;
        Ok(n)
    }

    /// Appends to this side's outbound buffer (immediately visible to the
    /// peer's `read`/`input_len`) and defers the peer's watermark
    /// callback onto `base`'s deferred queue, per spec §4.7.
    pub fn write(&self, base: &mut EventBase, data: &[u8]) -> Result<()> {
        {
            let mut shared = self.shared.borrow_mut();
            self.outbound(&mut shared).append(data)?;
        }
        let peer = self.peer();
        base.defer(move |base| peer.maybe_fire_read(base));
        let me = self.clone();
        base.defer(move |base| me.maybe_fire_write(base));
        Ok(())
    }

    fn maybe_fire_read(&self, base: &mut EventBase) {
        let (len, low, enabled) = {
            let mut shared = self.shared.borrow_mut();
            let len = self.inbound(&mut shared).len();
            let side = self.own_side(&mut shared);
            (len, side.read_wm.low, side.read_enabled)
        };
        if enabled && len >= low {
            let mut cb = {
                let mut shared = self.shared.borrow_mut();
                self.own_side(&mut shared).on_read.take()
            };
            if let Some(cb) = cb.as_mut() {
                cb(self, base);
            }
            let mut shared = self.shared.borrow_mut();
            let side = self.own_side(&mut shared);
            if side.on_read.is_none() {
                side.on_read = cb;
            }
        }
    }

    fn maybe_fire_write(&self, base: &mut EventBase) {
        let (len, low) = {
            let mut shared = self.shared.borrow_mut();
            let len = self.outbound(&mut shared).len();
            let side = self.own_side(&mut shared);
            (len, side.write_wm.low)
        };
        if len <= low {
            let mut cb = {
                let mut shared = self.shared.borrow_mut();
                self.own_side(&mut shared).on_write.take()
            };
            if let Some(cb) = cb.as_mut() {
                cb(self, base);
            }
            let mut shared = self.shared.borrow_mut();
            let side = self.own_side(&mut shared);
            if side.on_write.is_none() {
                side.on_write = cb;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{EventBase, RunFlags};
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc as StdRc;

    #[test]
    fn write_on_one_side_is_readable_on_the_other() {
        let mut base = EventBase::new().unwrap();
        let (a, b) = buffered_pair();
        let received = StdRc::new(StdRefCell::new(Vec::new()));
        let received2 = received.clone();
        b.set_callbacks(
            Some(Box::new(move |stream: &PairedStream, _base: &mut EventBase| {
                let mut buf = vec![0u8; 32];
                let n = stream.read(&mut buf).unwrap();
                received2.borrow_mut().extend_from_slice(&buf[..n]);
            })),
            None,
            None,
        );
        a.write(&mut base, b"ping").unwrap();
        base.run(RunFlags::ONCE).unwrap();
        assert_eq!(*received.borrow(), b"ping");
    }
}
