//! Generation counter for consistent, lock-free reads of a small shared record.
//!
//! The protected fields are themselves atomics; the counter only tells a reader whether the set
//! of values it loaded was published together.
//!
//! Protocol:
//! 1) A writer bumps the sequence to an odd value ("update in progress").
//! 2) The writer stores the record fields.
//! 3) The writer bumps the sequence to the next even value ("published").
//!
//! Readers snapshot the sequence (waiting while it is odd), load the fields, and retry if the
//! sequence moved in the meantime. Writers must be serialized by the caller; a second writer
//! entering while one is in progress is a broken invariant and panics.

#[cfg(all(feature = "loom", test))]
use loom::sync::atomic::AtomicU32;
#[cfg(not(all(feature = "loom", test)))]
use std::sync::atomic::AtomicU32;

use std::sync::atomic::Ordering;

pub struct SeqCount {
    /// Odd while a write is in progress.
    sequence: AtomicU32,
}

impl SeqCount {
    pub fn new() -> Self {
        Self {
            sequence: AtomicU32::new(0),
        }
    }

    /// Current raw sequence value (odd while a write is in progress).
    pub fn sequence(&self) -> u32 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn write_begin(&self) {
        let start = self.sequence.load(Ordering::SeqCst);
        assert!(
            start & 1 == 0,
            "seqcount: write_begin while another write is in progress"
        );
        if self
            .sequence
            .compare_exchange(
                start,
                start.wrapping_add(1),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            panic!("seqcount: concurrent writers");
        }
    }

    pub fn write_end(&self) {
        let prev = self.sequence.fetch_add(1, Ordering::SeqCst);
        assert!(prev & 1 == 1, "seqcount: write_end without write_begin");
    }

    /// Run `f` as one published update.
    pub fn write<R>(&self, f: impl FnOnce() -> R) -> R {
        self.write_begin();
        yield_point();
        let ret = f();
        yield_point();
        self.write_end();
        ret
    }

    /// Wait for an even sequence and return it.
    pub fn read_begin(&self) -> u32 {
        loop {
            let start = self.sequence.load(Ordering::SeqCst);
            if start & 1 == 0 {
                return start;
            }
            spin_hint();
        }
    }

    /// Returns true if the values loaded since `read_begin` returned `start` may be torn.
    pub fn read_retry(&self, start: u32) -> bool {
        self.sequence.load(Ordering::SeqCst) != start
    }

    /// Run `f` until it observes a consistent snapshot and return that snapshot.
    ///
    /// `f` must only load from the protected record; it may run more than once.
    pub fn read<R>(&self, mut f: impl FnMut() -> R) -> R {
        loop {
            let start = self.read_begin();
            let ret = f();
            if !self.read_retry(start) {
                return ret;
            }
        }
    }
}

impl Default for SeqCount {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(feature = "loom", test))]
#[inline]
fn spin_hint() {
    loom::thread::yield_now();
}

#[cfg(not(all(feature = "loom", test)))]
#[inline]
fn spin_hint() {
    std::hint::spin_loop();
}

/// Scheduling point inside write sections.
///
/// A no-op unless the `yield-points` feature is enabled (or under loom), in which case it yields
/// the thread so concurrent readers get a chance to observe a half-written record.
#[cfg(all(feature = "loom", test))]
#[inline]
pub fn yield_point() {
    loom::thread::yield_now();
}

#[cfg(all(feature = "yield-points", not(all(feature = "loom", test))))]
#[inline]
pub fn yield_point() {
    std::thread::yield_now();
}

#[cfg(not(any(feature = "yield-points", all(feature = "loom", test))))]
#[inline]
pub fn yield_point() {}
