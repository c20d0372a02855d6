//! Bounded ring channel shared by every ingestion and egress path.
//!
//! A [`RingChannel`] holds at most `N - 1` elements so that `read == write`
//! always means empty. Two overflow disciplines are offered side by side:
//! [`RingChannel::push`] refuses new elements when there is no room, while
//! [`RingChannel::push_overwrite`] drops the oldest element instead.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingError {
    #[error("ring full: {requested} slot(s) requested, {free} free")]
    Full { requested: usize, free: usize },
}

/// Number of elements between `read` (inclusive) and `write` (exclusive).
#[inline]
#[must_use]
pub const fn active_len(read: usize, write: usize, capacity: usize) -> usize {
    (write + capacity - read) % capacity
}

/// True when absolute index `idx` lies outside the live span `[read, write)`,
/// i.e. the element stored there has already been retired.
#[inline]
#[must_use]
pub const fn element_done(idx: usize, read: usize, write: usize) -> bool {
    if write >= read {
        idx < read || idx >= write
    } else {
        idx < read && idx >= write
    }
}

#[inline]
#[must_use]
pub const fn wrap_inc(idx: usize, capacity: usize) -> usize {
    (idx + 1) % capacity
}

#[inline]
#[must_use]
pub const fn wrap_dec(idx: usize, capacity: usize) -> usize {
    (idx + capacity - 1) % capacity
}

#[inline]
#[must_use]
pub const fn wrap_add(idx: usize, n: usize, capacity: usize) -> usize {
    (idx + n) % capacity
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct RingStats {
    pub pushed: u32,
    pub popped: u32,
    pub overwritten: u32,
    pub refused: u32,
}

/// Fixed-capacity circular buffer addressed by absolute slot indices.
#[derive(Debug, Clone)]
pub struct RingChannel<T, const N: usize> {
    buf: [T; N],
    read: usize,
    write: usize,
    stats: RingStats,
}

impl<T: Default, const N: usize> RingChannel<T, N> {
    pub fn new() -> Self {
        debug_assert!(N > 1, "ring capacity must leave room for one element");
        Self {
            buf: core::array::from_fn(|_| T::default()),
            read: 0,
            write: 0,
            stats: RingStats::default(),
        }
    }

    /// Remove and return the oldest element.
    pub fn pop(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let item = core::mem::take(&mut self.buf[self.read]);
        self.read = wrap_inc(self.read, N);
        self.stats.popped = self.stats.popped.wrapping_add(1);
        Some(item)
    }
}

impl<T: Default, const N: usize> Default for RingChannel<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> RingChannel<T, N> {
    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        active_len(self.read, self.write, N)
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.read == self.write
    }

    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.len() == N - 1
    }

    /// Slots that can still be pushed without overwriting or refusing.
    #[must_use]
    pub const fn free(&self) -> usize {
        N - 1 - self.len()
    }

    #[must_use]
    pub const fn can_accept(&self, n: usize) -> bool {
        self.len() + n < N
    }

    #[must_use]
    pub const fn read_index(&self) -> usize {
        self.read
    }

    #[must_use]
    pub const fn write_index(&self) -> usize {
        self.write
    }

    #[must_use]
    pub const fn stats(&self) -> RingStats {
        self.stats
    }

    #[must_use]
    pub const fn element_done(&self, idx: usize) -> bool {
        element_done(idx, self.read, self.write)
    }

    /// Admission-refuse push. Returns the absolute index the element landed at.
    pub fn push(&mut self, item: T) -> Result<usize, RingError> {
        if !self.can_accept(1) {
            self.stats.refused = self.stats.refused.wrapping_add(1);
            return Err(RingError::Full {
                requested: 1,
                free: self.free(),
            });
        }
        Ok(self.store(item))
    }

    /// Discard-oldest push. Returns `true` when the oldest element was dropped.
    pub fn push_overwrite(&mut self, item: T) -> bool {
        self.store(item);
        if self.write == self.read {
            self.read = wrap_inc(self.read, N);
            self.stats.overwritten = self.stats.overwritten.wrapping_add(1);
            return true;
        }
        false
    }

    fn store(&mut self, item: T) -> usize {
        let idx = self.write;
        self.buf[idx] = item;
        self.write = wrap_inc(idx, N);
        self.stats.pushed = self.stats.pushed.wrapping_add(1);
        idx
    }

    #[must_use]
    pub fn peek(&self) -> Option<&T> {
        if self.is_empty() {
            None
        } else {
            Some(&self.buf[self.read])
        }
    }

    pub fn peek_mut(&mut self) -> Option<&mut T> {
        if self.is_empty() {
            None
        } else {
            Some(&mut self.buf[self.read])
        }
    }

    /// Most recently pushed element still in the channel.
    #[must_use]
    pub fn newest(&self) -> Option<&T> {
        if self.is_empty() {
            None
        } else {
            Some(&self.buf[wrap_dec(self.write, N)])
        }
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> &T {
        &self.buf[idx % N]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut T {
        &mut self.buf[idx % N]
    }

    /// Contiguous run starting at `start`, at most `max_len` long, stopping at
    /// the physical end of the storage.
    #[must_use]
    pub fn contiguous(&self, start: usize, max_len: usize) -> &[T] {
        let start = start % N;
        let end = (start + max_len).min(N);
        &self.buf[start..end]
    }

    /// Advance `read` past the oldest element without moving it out, so
    /// absolute-index readers can still inspect the retired slot.
    pub fn retire(&mut self) -> bool {
        if self.is_empty() {
            return false;
        }
        self.read = wrap_inc(self.read, N);
        self.stats.popped = self.stats.popped.wrapping_add(1);
        true
    }

    /// Release every element before `idx`. Ignored when `idx` is outside
    /// `[read, write]`, which happens when an overwrite already moved `read`.
    pub fn release_to(&mut self, idx: usize) -> bool {
        let idx = idx % N;
        let released = active_len(self.read, idx, N);
        if released > self.len() {
            return false;
        }
        self.stats.popped = self.stats.popped.wrapping_add(released as u32);
        self.read = idx;
        true
    }

    /// Drop every element written at or after `idx`. Used to abandon a
    /// partially written record.
    pub fn rewind_to(&mut self, idx: usize) -> bool {
        let idx = idx % N;
        if active_len(self.read, idx, N) > self.len() {
            return false;
        }
        self.write = idx;
        true
    }

    pub fn clear(&mut self) {
        self.read = self.write;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reference model: walk from `old_read` to `new_read` and record each
    /// visited slot.
    fn visited(old_read: usize, new_read: usize, capacity: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut i = old_read;
        while i != new_read {
            out.push(i);
            i = wrap_inc(i, capacity);
        }
        out
    }

    #[test]
    fn test_active_len_bounds() {
        let mut ring: RingChannel<u8, 8> = RingChannel::new();
        let mut state = 7u32;
        for step in 0..500u32 {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            if state % 3 == 0 {
                ring.pop();
            } else if state % 3 == 1 {
                let _ = ring.push(step as u8);
            } else {
                ring.push_overwrite(step as u8);
            }
            assert!(ring.len() < ring.capacity());
            assert_eq!(ring.len() + ring.free(), ring.capacity() - 1);
        }
    }

    #[test]
    fn test_element_done_matches_reference() {
        const CAP: usize = 7;
        for old_read in 0..CAP {
            for len in 0..CAP {
                let write = wrap_add(old_read, len, CAP);
                for consumed in 0..=len {
                    let new_read = wrap_add(old_read, consumed, CAP);
                    let retired = visited(old_read, new_read, CAP);
                    let live = visited(new_read, write, CAP);
                    for idx in 0..CAP {
                        let done = element_done(idx, new_read, write);
                        if retired.contains(&idx) {
                            assert!(done, "idx {idx} retired but reported live");
                        }
                        if live.contains(&idx) {
                            assert!(!done, "idx {idx} live but reported done");
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_admission_refuse() {
        let mut ring: RingChannel<u16, 4> = RingChannel::new();
        assert_eq!(ring.push(1), Ok(0));
        assert_eq!(ring.push(2), Ok(1));
        assert_eq!(ring.push(3), Ok(2));
        assert_eq!(ring.push(4), Err(RingError::Full { requested: 1, free: 0 }));
        assert_eq!(ring.stats().refused, 1);
        assert_eq!(ring.pop(), Some(1));
        assert_eq!(ring.push(4), Ok(3));
        assert_eq!(ring.pop(), Some(2));
        assert_eq!(ring.pop(), Some(3));
        assert_eq!(ring.pop(), Some(4));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn test_discard_oldest() {
        let mut ring: RingChannel<u8, 4> = RingChannel::new();
        for b in 1..=3 {
            assert!(!ring.push_overwrite(b));
        }
        assert!(ring.push_overwrite(4));
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.pop(), Some(2));
        assert_eq!(ring.stats().overwritten, 1);
    }

    #[test]
    fn test_contiguous_stops_at_wrap() {
        let mut ring: RingChannel<u8, 8> = RingChannel::new();
        for b in 0..6 {
            ring.push(b).unwrap();
        }
        ring.release_to(6);
        for b in 10..14 {
            ring.push(b).unwrap();
        }
        assert_eq!(ring.contiguous(6, 4), &[10, 11]);
        assert_eq!(ring.contiguous(0, 2), &[12, 13]);
        assert_eq!(ring.newest(), Some(&13));
    }
}
