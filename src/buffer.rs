//! Chained byte buffer (spec §4.4), grounded on the teacher's segmented
//! `buf::Buf`/`MutBuf` split (`buf.rs`) but restructured around a
//! `VecDeque<Segment>` so segments can be spliced between buffers without
//! copying, the way libevent's `evbuffer_add_buffer`/`evbuffer_remove_buffer`
//! do it.

use std::collections::VecDeque;
use std::io::IoSliceMut;
use std::os::unix::io::RawFd;

use crate::error::{Error, Result};

const MIN_SEGMENT_CAPACITY: usize = 4096;

/// Line-ending convention for [`ByteBuffer::readln`], named and scanned the
/// way libevent's `enum evbuffer_eol_style` does it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EolStyle {
    /// Either a bare CR, a bare LF, or CRLF ends a line.
    Any,
    /// An LF, optionally preceded by a CR, ends a line; a bare LF alone is
    /// sufficient.
    Crlf,
    /// Only the literal two-byte sequence CRLF ends a line; a bare LF is
    /// ordinary data.
    CrlfStrict,
    /// Only a bare LF ends a line.
    Lf,
    /// Lines are NUL-terminated.
    Nul,
}

/// `(original_length, n_added, n_removed)` passed to mutation callbacks.
#[derive(Copy, Clone, Debug)]
pub struct MutationEvent {
    pub orig_length: usize,
    pub n_added: usize,
    pub n_removed: usize,
}

pub type BufferCallback = Box<dyn FnMut(&MutationEvent)>;

/// Data referenced rather than owned by a segment (spec: `add_reference`).
/// Whatever the caller passed in is held until the segment is dropped;
/// `cleanup`, if given, runs at that point — this replaces libevent's
/// `(ptr, cleanup_fn, extra_arg)` triple with ordinary RAII.
struct ReferencedSegment {
    data: Box<dyn AsRef<[u8]> + Send>,
    cleanup: Option<Box<dyn FnOnce() + Send>>,
}

impl Drop for ReferencedSegment {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

/// A segment backed by a range of an open file descriptor (spec:
/// `add_file_segment`). Bytes are paged in lazily via `pread` on first
/// access, as the spec's "implicit load" wording requires.
struct FileSegment {
    fd: RawFd,
    file_offset: u64,
    len: usize,
    loaded: Option<Vec<u8>>,
}

impl FileSegment {
    fn load(&mut self) -> Result<&[u8]> {
        if self.loaded.is_none() {
            let mut buf = vec![0u8; self.len];
            let n = unsafe {
                libc::pread(
                    self.fd,
                    buf.as_mut_ptr() as *mut _,
                    self.len,
                    self.file_offset as libc::off_t,
                )
            };
            if n < 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
            buf.truncate(n as usize);
            self.loaded = Some(buf);
        }
        Ok(self.loaded.as_deref().unwrap())
    }
}

enum SegmentKind {
    Owned(Vec<u8>),
    Reference(ReferencedSegment),
    File(FileSegment),
}

struct Segment {
    kind: SegmentKind,
    /// Bytes before `start` within the segment have already been drained.
    start: usize,
}

impl Segment {
    fn bytes(&mut self) -> Result<&[u8]> {
        let full: &[u8] = match &mut self.kind {
            SegmentKind::Owned(v) => v.as_slice(),
            SegmentKind::Reference(r) => r.data.as_ref().as_ref(),
            SegmentKind::File(f) => f.load()?,
        };
        Ok(&full[self.start..])
    }

    fn len(&self) -> usize {
        match &self.kind {
            SegmentKind::Owned(v) => v.len() - self.start,
            SegmentKind::Reference(r) => r.data.as_ref().as_ref().len() - self.start,
            SegmentKind::File(f) => f.len - self.start,
        }
    }
}

/// A guard tracking an in-flight `reserve_space`; while it exists, no other
/// mutation is permitted (spec §4.4 invariant).
struct Reservation {
    requested: usize,
    /// Length of the tail segment's vector before the reservation extended
    /// it into its spare capacity; `commit_space` restores from here.
    orig_len: usize,
}

/// Segmented byte storage with O(1) drain/append/move, used as the input
/// and output buffers of a buffered stream.
pub struct ByteBuffer {
    segments: VecDeque<Segment>,
    total_len: usize,
    frozen_front: bool,
    frozen_back: bool,
    callbacks: Vec<(CallbackHandle, BufferCallback)>,
    next_callback_id: u64,
    defer_callbacks: bool,
    pending: VecDeque<MutationEvent>,
    reservation: Option<Reservation>,
}

/// Returned by [`ByteBuffer::add_cb`]; pass back to
/// [`ByteBuffer::remove_cb`] to deregister that specific callback.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CallbackHandle(u64);

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteBuffer {
    pub fn new() -> ByteBuffer {
        ByteBuffer {
            segments: VecDeque::new(),
            total_len: 0,
            frozen_front: false,
            frozen_back: false,
            callbacks: Vec::new(),
            next_callback_id: 0,
            defer_callbacks: false,
            pending: VecDeque::new(),
            reservation: None,
        }
    }

    pub fn len(&self) -> usize {
        self.total_len
    }

    pub fn is_empty(&self) -> bool {
        self.total_len == 0
    }

    fn check_reservation(&self) -> Result<()> {
        if self.reservation.is_some() {
            return Err(Error::MismatchedCommit {
                requested: self.reservation.as_ref().unwrap().requested,
                committed: 0,
            });
        }
        Ok(())
    }

    fn fire(&mut self, orig_length: usize, n_added: usize, n_removed: usize) {
        let event = MutationEvent {
            orig_length,
            n_added,
            n_removed,
        };
        if self.defer_callbacks {
            self.pending.push_back(event);
        } else {
            self.invoke_now(event);
        }
    }

    fn invoke_now(&mut self, event: MutationEvent) {
        // Callbacks may append to `self.callbacks`; index explicitly
        // rather than iterating so additions made mid-pass still run.
        let mut i = 0;
        while i < self.callbacks.len() {
            (self.callbacks[i].1)(&event);
            i += 1;
        }
    }

    pub fn set_defer_callbacks(&mut self, defer: bool) {
        self.defer_callbacks = defer;
    }

    /// Runs any mutation callbacks queued while `defer_callbacks` was set.
    pub fn drain_deferred_callbacks(&mut self) {
        while let Some(event) = self.pending.pop_front() {
            self.invoke_now(event);
        }
    }

    pub fn has_deferred_callbacks(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn add_cb(&mut self, cb: BufferCallback) -> CallbackHandle {
        let handle = CallbackHandle(self.next_callback_id);
        self.next_callback_id += 1;
        self.callbacks.push((handle, cb));
        handle
    }

    /// Removes a single callback previously registered via `add_cb`.
    /// Per spec, never call this from within the callback being removed.
    pub fn remove_cb(&mut self, handle: CallbackHandle) -> bool {
        let before = self.callbacks.len();
        self.callbacks.retain(|(h, _)| *h != handle);
        self.callbacks.len() != before
    }

    /// Removes every registered mutation callback.
    pub fn remove_cb_entry(&mut self) {
        self.callbacks.clear();
    }

    /// Largest contiguous range of bytes available at the front without a
    /// copy (the length of the head segment).
    pub fn contiguous_space(&self) -> usize {
        self.segments.front().map(|s| s.len()).unwrap_or(0)
    }

    /// Scans for the next end-of-line per `style` without consuming any
    /// bytes, returning `(line_len, terminator_len)` if found.
    pub fn search_eol(&mut self, style: EolStyle) -> Result<Option<(usize, usize)>> {
        let mut whole = vec![0u8; self.total_len];
        self.copyout(0, &mut whole)?;
        Ok(scan_eol(&whole, style))
    }

    pub fn freeze(&mut self, back: bool) {
        if back {
            self.frozen_back = true;
        } else {
            self.frozen_front = true;
        }
    }

    pub fn unfreeze(&mut self, back: bool) {
        if back {
            self.frozen_back = false;
        } else {
            self.frozen_front = false;
        }
    }

    pub fn append(&mut self, src: &[u8]) -> Result<()> {
        self.check_reservation()?;
        if self.frozen_back {
            return Err(Error::Frozen);
        }
        let orig = self.total_len;
        if let Some(seg) = self.segments.back_mut() {
            if let SegmentKind::Owned(v) = &mut seg.kind {
                let free = v.capacity() - v.len();
                if free > 0 {
                    let take = free.min(src.len());
                    v.extend_from_slice(&src[..take]);
                    self.total_len += take;
                    if take == src.len() {
                        self.fire(orig, src.len(), 0);
                        return Ok(());
                    }
                    return self.append_new_segment(&src[take..], orig, src.len());
                }
            }
        }
        self.append_new_segment(src, orig, src.len())
    }

    fn append_new_segment(&mut self, remaining: &[u8], orig: usize, total_added: usize) -> Result<()> {
        let cap = remaining.len().max(MIN_SEGMENT_CAPACITY);
        let mut v = Vec::with_capacity(cap);
        v.extend_from_slice(remaining);
        self.total_len += remaining.len();
        self.segments.push_back(Segment {
            kind: SegmentKind::Owned(v),
            start: 0,
        });
        self.fire(orig, total_added, 0);
        Ok(())
    }

    pub fn prepend(&mut self, src: &[u8]) -> Result<()> {
        self.check_reservation()?;
        if self.frozen_front {
            return Err(Error::Frozen);
        }
        let orig = self.total_len;
        if let Some(seg) = self.segments.front_mut() {
            if let SegmentKind::Owned(v) = &mut seg.kind {
                if seg.start >= src.len() {
                    seg.start -= src.len();
                    v[seg.start..seg.start + src.len()].copy_from_slice(src);
                    self.total_len += src.len();
                    self.fire(orig, src.len(), 0);
                    return Ok(());
                }
            }
        }
        let mut v = Vec::with_capacity(src.len());
        v.extend_from_slice(src);
        self.total_len += src.len();
        self.segments.push_front(Segment {
            kind: SegmentKind::Owned(v),
            start: 0,
        });
        self.fire(orig, src.len(), 0);
        Ok(())
    }

    /// Advances the head cursor past `n` bytes, releasing any segment that
    /// becomes fully consumed. Never copies.
    pub fn drain(&mut self, n: usize) -> Result<usize> {
        self.check_reservation()?;
        if self.frozen_front {
            return Err(Error::Frozen);
        }
        let orig = self.total_len;
        let mut remaining = n.min(self.total_len);
        let drained = remaining;
        while remaining > 0 {
            let Some(seg) = self.segments.front_mut() else { break };
            let seg_len = seg.len();
            if seg_len <= remaining {
                remaining -= seg_len;
                self.segments.pop_front();
            } else {
                seg.start += remaining;
                remaining = 0;
            }
        }
        self.total_len -= drained;
        self.fire(orig, 0, drained);
        Ok(drained)
    }

    /// Non-destructive read of up to `dst.len()` bytes starting at
    /// `offset`. Does not invalidate cursors.
    pub fn copyout(&mut self, offset: usize, dst: &mut [u8]) -> Result<usize> {
        let mut skip = offset;
        let mut written = 0;
        for seg in self.segments.iter_mut() {
            if written >= dst.len() {
                break;
            }
            let bytes = seg.bytes()?;
            if skip >= bytes.len() {
                skip -= bytes.len();
                continue;
            }
            let avail = &bytes[skip..];
            skip = 0;
            let take = avail.len().min(dst.len() - written);
            dst[written..written + take].copy_from_slice(&avail[..take]);
            written += take;
        }
        Ok(written)
    }

    /// Splices up to `n` bytes (all of `self`'s contents if `n` is `None`)
    /// onto the tail of `dst`, moving whole segments where possible and
    /// splitting at most one when `n` falls inside a segment.
    pub fn move_into(&mut self, dst: &mut ByteBuffer, n: Option<usize>) -> Result<usize> {
        self.check_reservation()?;
        dst.check_reservation()?;
        if self.frozen_front || dst.frozen_back {
            return Err(Error::Frozen);
        }
        let target = n.unwrap_or(self.total_len).min(self.total_len);
        let mut moved = 0;
        let src_orig = self.total_len;
        let dst_orig = dst.total_len;

        while moved < target {
            let Some(mut seg) = self.segments.pop_front() else { break };
            let seg_len = seg.len();
            let need = target - moved;
            if seg_len <= need {
                moved += seg_len;
                self.total_len -= seg_len;
                dst.total_len += seg_len;
                dst.segments.push_back(seg);
            } else {
                let bytes = seg.bytes()?.to_vec();
                let split = need;
                let mut head = Vec::with_capacity(split);
                head.extend_from_slice(&bytes[..split]);
                seg.start += split;
                self.total_len -= split;
                dst.total_len += split;
                moved += split;
                self.segments.push_front(seg);
                dst.segments.push_back(Segment {
                    kind: SegmentKind::Owned(head),
                    start: 0,
                });
            }
        }
        self.fire(src_orig, 0, moved);
        dst.fire(dst_orig, moved, 0);
        Ok(moved)
    }

    /// Returns a contiguous slice of the first `n` bytes (or the whole
    /// buffer if `n` is `None`), copying segments together if necessary.
    /// Invalidates any slice from a previous `pullup`.
    pub fn pullup(&mut self, n: Option<usize>) -> Result<&[u8]> {
        let want = n.unwrap_or(self.total_len).min(self.total_len);
        if want == 0 {
            return Ok(&[]);
        }
        let needs_merge = {
            let mut acc = 0;
            let mut merge = false;
            for seg in self.segments.iter() {
                if acc >= want {
                    break;
                }
                acc += seg.len();
                merge = acc < want || self.segments.len() > 1;
            }
            merge
        };
        if needs_merge {
            let mut merged = Vec::with_capacity(want.max(MIN_SEGMENT_CAPACITY));
            let mut taken = 0;
            while taken < want {
                let Some(mut seg) = self.segments.pop_front() else { break };
                let bytes = seg.bytes()?.to_vec();
                let take = bytes.len().min(want - taken);
                merged.extend_from_slice(&bytes[..take]);
                taken += take;
                if take < bytes.len() {
                    seg.start += take;
                    self.segments.push_front(seg);
                }
            }
            // Leftover (untouched) segments remain in order after this one.
            self.segments.push_front(Segment {
                kind: SegmentKind::Owned(merged),
                start: 0,
            });
        }
        let seg = self.segments.front_mut().unwrap();
        seg.bytes()
    }

    /// Returns one or more writable spare-capacity extents at the tail
    /// totaling at least `n`. No other mutation is permitted until
    /// [`ByteBuffer::commit_space`] is called with the same (or fewer)
    /// bytes actually written.
    pub fn reserve_space(&mut self, n: usize) -> Result<Vec<IoSliceMut<'_>>> {
        self.check_reservation()?;
        if self.frozen_back {
            return Err(Error::Frozen);
        }
        let need_new_tail = match self.segments.back() {
            Some(seg) => matches!(seg.kind, SegmentKind::Owned(ref v) if v.capacity() - v.len() == 0) || !matches!(seg.kind, SegmentKind::Owned(_)),
            None => true,
        };
        if need_new_tail {
            let cap = n.max(MIN_SEGMENT_CAPACITY);
            self.segments.push_back(Segment {
                kind: SegmentKind::Owned(Vec::with_capacity(cap)),
                start: 0,
            });
        }
        let seg = self.segments.back_mut().unwrap();
        let SegmentKind::Owned(v) = &mut seg.kind else {
            unreachable!("tail segment guaranteed owned above")
        };
        let spare = v.capacity() - v.len();
        if spare < n {
            v.reserve(n - spare);
        }
        let orig_len = v.len();
        let cap = v.capacity();
        self.reservation = Some(Reservation { requested: n, orig_len });
        // SAFETY: extends the logical view into `v`'s already-allocated,
        // uninitialized tail capacity; `commit_space` trims it back down
        // to only the bytes the caller actually initialized.
        unsafe {
            v.set_len(cap);
        }
        Ok(vec![IoSliceMut::new(&mut v[orig_len..cap])])
    }

    /// Commits `written` bytes from the extent(s) handed out by the most
    /// recent `reserve_space`.
    pub fn commit_space(&mut self, written: usize) -> Result<()> {
        let reservation = self.reservation.take().ok_or(Error::MismatchedCommit {
            requested: 0,
            committed: written,
        })?;
        if written > reservation.requested {
            return Err(Error::MismatchedCommit {
                requested: reservation.requested,
                committed: written,
            });
        }
        let seg = self.segments.back_mut().expect("reserve_space always leaves a tail segment");
        let SegmentKind::Owned(v) = &mut seg.kind else {
            unreachable!()
        };
        // SAFETY: shrinks back to the bytes actually initialized by the
        // caller between `reserve_space` and here.
        unsafe {
            v.set_len(reservation.orig_len + written);
        }
        self.total_len += written;
        let orig = self.total_len - written;
        self.fire(orig, written, 0);
        Ok(())
    }

    pub fn search(&mut self, needle: &[u8], from: usize, to: Option<usize>) -> Result<Option<usize>> {
        if needle.is_empty() {
            return Ok(Some(from));
        }
        let end = to.unwrap_or(self.total_len).min(self.total_len);
        if from >= end {
            return Ok(None);
        }
        let window_len = end - from;
        let mut window = vec![0u8; window_len];
        let n = self.copyout(from, &mut window)?;
        window.truncate(n);
        Ok(window
            .windows(needle.len())
            .position(|w| w == needle)
            .map(|pos| from + pos))
    }

    pub fn add_reference(
        &mut self,
        data: Box<dyn AsRef<[u8]> + Send>,
        cleanup: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<()> {
        self.check_reservation()?;
        if self.frozen_back {
            return Err(Error::Frozen);
        }
        let orig = self.total_len;
        let len = data.as_ref().as_ref().len();
        self.total_len += len;
        self.segments.push_back(Segment {
            kind: SegmentKind::Reference(ReferencedSegment { data, cleanup }),
            start: 0,
        });
        self.fire(orig, len, 0);
        Ok(())
    }

    pub fn add_file_segment(&mut self, fd: RawFd, offset: u64, len: usize) -> Result<()> {
        self.check_reservation()?;
        if self.frozen_back {
            return Err(Error::Frozen);
        }
        let orig = self.total_len;
        self.total_len += len;
        self.segments.push_back(Segment {
            kind: SegmentKind::File(FileSegment {
                fd,
                file_offset: offset,
                len,
                loaded: None,
            }),
            start: 0,
        });
        self.fire(orig, len, 0);
        Ok(())
    }

    /// Scans for a line terminator per `style` and, if one is found,
    /// drains and returns the line (terminator excluded).
    pub fn readln(&mut self, style: EolStyle) -> Result<Option<Vec<u8>>> {
        let whole = self.pullup(None)?.to_vec();
        if whole.is_empty() {
            return Ok(None);
        }
        match scan_eol(&whole, style) {
            Some((pos, term_len)) => {
                let line = whole[..pos].to_vec();
                self.drain(pos + term_len)?;
                Ok(Some(line))
            }
            None => Ok(None),
        }
    }
}

/// Finds the first end-of-line in `data` per `style`, returning
/// `(line_len, terminator_len)`.
fn scan_eol(data: &[u8], style: EolStyle) -> Option<(usize, usize)> {
    match style {
        EolStyle::Lf => data.iter().position(|&b| b == b'\n').map(|i| (i, 1)),
        EolStyle::Nul => data.iter().position(|&b| b == 0).map(|i| (i, 1)),
        EolStyle::Any => data.iter().position(|&b| b == b'\n' || b == b'\r').map(|i| {
            let mut end = i + 1;
            while end < data.len() && (data[end] == b'\n' || data[end] == b'\r') {
                end += 1;
            }
            (i, end - i)
        }),
        EolStyle::Crlf => data.iter().position(|&b| b == b'\n').map(|i| {
            if i > 0 && data[i - 1] == b'\r' {
                (i - 1, 2)
            } else {
                (i, 1)
            }
        }),
        EolStyle::CrlfStrict => {
            let mut i = 0;
            let mut result = None;
            while i + 1 < data.len() {
                if data[i] == b'\r' && data[i + 1] == b'\n' {
                    result = Some((i, 2));
                    break;
                }
                i += 1;
            }
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_drain_roundtrips() {
        let mut buf = ByteBuffer::new();
        buf.append(b"hello world").unwrap();
        assert_eq!(buf.len(), 11);
        let mut out = [0u8; 5];
        buf.copyout(0, &mut out).unwrap();
        assert_eq!(&out, b"hello");
        buf.drain(6).unwrap();
        assert_eq!(buf.len(), 5);
        let head = buf.pullup(None).unwrap().to_vec();
        assert_eq!(head, b"world");
    }

    #[test]
    fn prepend_extends_head() {
        let mut buf = ByteBuffer::new();
        buf.append(b"world").unwrap();
        buf.prepend(b"hello ").unwrap();
        assert_eq!(buf.pullup(None).unwrap(), b"hello world");
    }

    #[test]
    fn move_into_preserves_total_length_and_order() {
        let mut src = ByteBuffer::new();
        src.append(b"abcdef").unwrap();
        let mut dst = ByteBuffer::new();
        dst.append(b"XY").unwrap();
        let moved = src.move_into(&mut dst, Some(4)).unwrap();
        assert_eq!(moved, 4);
        assert_eq!(src.len(), 2);
        assert_eq!(dst.pullup(None).unwrap(), b"XYabcd");
    }

    #[test]
    fn move_all_leaves_source_empty() {
        let mut src = ByteBuffer::new();
        src.append(b"abc").unwrap();
        let mut dst = ByteBuffer::new();
        let moved = src.move_into(&mut dst, None).unwrap();
        assert_eq!(moved, 3);
        assert!(src.is_empty());
        assert_eq!(dst.len(), 3);
    }

    #[test]
    fn search_finds_needle_across_segment_boundary() {
        let mut buf = ByteBuffer::new();
        buf.append(b"foo").unwrap();
        buf.append(b"bar").unwrap();
        let pos = buf.search(b"oba", 0, None).unwrap();
        assert_eq!(pos, Some(2));
    }

    #[test]
    fn readln_lf_style_strips_terminator() {
        let mut buf = ByteBuffer::new();
        buf.append(b"one\ntwo\n").unwrap();
        assert_eq!(buf.readln(EolStyle::Lf).unwrap(), Some(b"one".to_vec()));
        assert_eq!(buf.readln(EolStyle::Lf).unwrap(), Some(b"two".to_vec()));
        assert_eq!(buf.readln(EolStyle::Lf).unwrap(), None);
    }

    #[test]
    fn readln_crlf_strict_ignores_bare_lf() {
        let mut buf = ByteBuffer::new();
        buf.append(b"a\nb\r\n").unwrap();
        assert_eq!(buf.readln(EolStyle::CrlfStrict).unwrap(), Some(b"a\nb".to_vec()));
    }

    #[test]
    fn crlf_style_accepts_bare_lf_but_strict_does_not() {
        let mut buf = ByteBuffer::new();
        buf.append(b"foo\nbar").unwrap();
        assert_eq!(scan_eol(b"foo\nbar", EolStyle::Crlf), Some((3, 1)));
        assert_eq!(scan_eol(b"foo\nbar", EolStyle::CrlfStrict), None);
        assert_eq!(buf.readln(EolStyle::Crlf).unwrap(), Some(b"foo".to_vec()));
    }

    #[test]
    fn freeze_front_rejects_drain() {
        let mut buf = ByteBuffer::new();
        buf.append(b"data").unwrap();
        buf.freeze(false);
        assert!(matches!(buf.drain(1), Err(Error::Frozen)));
        buf.unfreeze(false);
        assert!(buf.drain(1).is_ok());
    }

    #[test]
    fn callbacks_observe_added_and_removed_counts() {
        use std::cell::RefCell;
        use std::rc::Rc;
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = seen.clone();
        let mut buf = ByteBuffer::new();
        buf.add_cb(Box::new(move |event| {
            seen2.borrow_mut().push((event.n_added, event.n_removed));
        }));
        buf.append(b"abc").unwrap();
        buf.drain(2).unwrap();
        assert_eq!(*seen.borrow(), vec![(3, 0), (0, 2)]);
    }

    #[test]
    fn remove_cb_stops_further_notifications() {
        use std::cell::RefCell;
        use std::rc::Rc;
        let count = Rc::new(RefCell::new(0));
        let count2 = count.clone();
        let mut buf = ByteBuffer::new();
        let handle = buf.add_cb(Box::new(move |_event| *count2.borrow_mut() += 1));
        buf.append(b"a").unwrap();
        assert!(buf.remove_cb(handle));
        buf.append(b"b").unwrap();
        assert_eq!(*count.borrow(), 1);
        assert!(!buf.remove_cb(handle));
    }

    #[test]
    fn search_eol_does_not_consume_bytes() {
        let mut buf = ByteBuffer::new();
        buf.append(b"abc\ndef").unwrap();
        let (line_len, term_len) = buf.search_eol(EolStyle::Lf).unwrap().unwrap();
        assert_eq!((line_len, term_len), (3, 1));
        assert_eq!(buf.len(), 7);
    }

    #[test]
    fn contiguous_space_reflects_head_segment() {
        let mut buf = ByteBuffer::new();
        buf.append(b"hello").unwrap();
        assert_eq!(buf.contiguous_space(), 5);
    }
}
