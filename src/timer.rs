//! Timer heap (spec §4.2): a min-heap keyed by absolute deadline with a
//! per-duration "common timeout" fast path.
//!
//! Structured after the teacher's `timer::Timeout`/`TimerResult` naming,
//! but backed by a `BinaryHeap` rather than a timer wheel, since spec §4.2
//! calls for heap semantics (`insert`/`cancel`/`peek_min`/`pop_expired`)
//! rather than tick-based slotting.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Handle returned by [`TimerHeap::insert`]; pass back to
/// [`TimerHeap::cancel`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

#[derive(Debug)]
struct Entry<T> {
    deadline: Instant,
    seq: u64,
    payload: Option<T>,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl<T> Eq for Entry<T> {}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse for a min-heap (BinaryHeap is a max-heap by default);
        // tie-break on insertion sequence so equal deadlines are FIFO.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A FIFO group of timeouts sharing the exact same duration. The group's
/// head deadline is the only thing living on the real heap; inserting and
/// cancelling within the group are both O(1). This is the "common-timeout"
/// optimization named in spec §4.2.
#[derive(Debug, Default)]
struct CommonGroup<T> {
    duration: Duration,
    queue: VecDeque<(u64, Instant, Option<T>)>,
}

pub struct TimerHeap<T> {
    heap: BinaryHeap<Entry<T>>,
    next_seq: u64,
    cancelled: HashMap<u64, ()>,
    common_groups: HashMap<Duration, CommonGroup<T>>,
    common_seq_to_duration: HashMap<u64, Duration>,
}

impl<T> Default for TimerHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerHeap<T> {
    pub fn new() -> TimerHeap<T> {
        TimerHeap {
            heap: BinaryHeap::new(),
            next_seq: 0,
            cancelled: HashMap::new(),
            common_groups: HashMap::new(),
            common_seq_to_duration: HashMap::new(),
        }
    }

    /// Marks `duration` as a common-timeout duration: future `insert` calls
    /// using exactly this duration will be grouped.
    pub fn hint_common_timeout(&mut self, duration: Duration) {
        self.common_groups.entry(duration).or_insert_with(|| CommonGroup {
            duration,
            queue: VecDeque::new(),
        });
    }

    pub fn insert(&mut self, now: Instant, duration: Duration, payload: T) -> TimerHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        let deadline = now + duration;

        if let Some(group) = self.common_groups.get_mut(&duration) {
            let was_empty = group.queue.is_empty();
            group.queue.push_back((seq, deadline, Some(payload)));
            self.common_seq_to_duration.insert(seq, duration);
            if was_empty {
                self.heap.push(Entry {
                    deadline,
                    seq,
                    payload: None,
                });
            }
            return TimerHandle(seq);
        }

        self.heap.push(Entry {
            deadline,
            seq,
            payload: Some(payload),
        });
        TimerHandle(seq)
    }

    /// O(1): marks the handle cancelled; the heap/group lazily skips it.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        // Deliberately keep the seq->duration mapping even though this
        // handle is being cancelled: `pop_expired`'s chaining step looks
        // a cancelled entry's seq up by this map once it becomes the
        // group's active heap marker, and needs it present to find (and
        // skip past) the cancelled slot.
        if let Some(&duration) = self.common_seq_to_duration.get(&handle.0) {
            if let Some(group) = self.common_groups.get_mut(&duration) {
                if let Some(slot) = group.queue.iter_mut().find(|(seq, _, _)| *seq == handle.0) {
                    let had = slot.2.is_some();
                    slot.2 = None;
                    return had;
                }
            }
            return false;
        }
        self.cancelled.insert(handle.0, ()).is_none()
    }

    pub fn peek_min(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.deadline)
    }

    /// Pops every timer whose deadline is `<= now`, in deadline order
    /// (FIFO among equal deadlines).
    pub fn pop_expired(&mut self, now: Instant) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            let entry = self.heap.pop().unwrap();

            if let Some(payload) = entry.payload {
                // A plain (non-grouped) timer.
                if self.cancelled.remove(&entry.seq).is_none() {
                    out.push(payload);
                }
                continue;
            }

            // This was a common-group head marker; drain the group's
            // front while it keeps matching this deadline tick.
            if let Some(duration) = self.common_seq_to_duration.get(&entry.seq).copied() {
                if let Some(group) = self.common_groups.get_mut(&duration) {
                    if let Some((seq, deadline, payload)) = group.queue.pop_front() {
                        self.common_seq_to_duration.remove(&seq);
                        if let Some(payload) = payload {
                            if deadline <= now {
                                out.push(payload);
                            } else {
                                // Not actually due yet; put it back as the
                                // new head and requeue the heap marker.
                                group.queue.push_front((seq, deadline, Some(payload)));
                                self.common_seq_to_duration.insert(seq, duration);
                                self.heap.push(Entry {
                                    deadline,
                                    seq,
                                    payload: None,
                                });
                                continue;
                            }
                        }
                        // Chain: if the group has more entries, push the
                        // next one's deadline onto the heap as the new
                        // marker.
                        if let Some((next_seq, next_deadline, _)) = group.queue.front() {
                            self.heap.push(Entry {
                                deadline: *next_deadline,
                                seq: *next_seq,
                                payload: None,
                            });
                        }
                    }
                }
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_among_equal_deadlines() {
        let mut timers = TimerHeap::new();
        let now = Instant::now();
        let d = Duration::from_millis(50);
        timers.insert(now, d, "a");
        timers.insert(now, d, "b");
        timers.insert(now, d, "c");
        let expired = timers.pop_expired(now + d);
        assert_eq!(expired, vec!["a", "b", "c"]);
    }

    #[test]
    fn cancel_before_fire_is_skipped() {
        let mut timers = TimerHeap::new();
        let now = Instant::now();
        let d = Duration::from_millis(10);
        let h = timers.insert(now, d, 1);
        timers.insert(now, d, 2);
        assert!(timers.cancel(h));
        assert_eq!(timers.pop_expired(now + d), vec![2]);
    }

    #[test]
    fn common_timeout_group_is_fifo_and_cancellable() {
        let mut timers = TimerHeap::new();
        let d = Duration::from_millis(5);
        timers.hint_common_timeout(d);
        let now = Instant::now();
        let h1 = timers.insert(now, d, 1);
        let h2 = timers.insert(now, d, 2);
        let h3 = timers.insert(now, d, 3);
        assert!(timers.cancel(h2));
        let _ = h1;
        let _ = h3;
        assert_eq!(timers.pop_expired(now + d), vec![1, 3]);
    }

    #[test]
    fn peek_min_reflects_nearest_deadline() {
        let mut timers = TimerHeap::new();
        let now = Instant::now();
        timers.insert(now, Duration::from_millis(100), "slow");
        timers.insert(now, Duration::from_millis(10), "fast");
        let min = timers.peek_min().unwrap();
        assert!(min <= now + Duration::from_millis(10) + Duration::from_millis(1));
    }
}
