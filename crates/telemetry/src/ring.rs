//! Lock-free single-producer/single-consumer ring for telemetry samples.
//!
//! Capacity is rounded up to a power of two so index wrapping is a bitmask.
//! Head (producer index) and tail (consumer index) live on separate cache
//! lines. One slot is sacrificed to distinguish full from empty, so a ring
//! built with capacity C holds at most C−1 samples.
//!
//! Ordering contract:
//! - producer: head relaxed, tail acquire; slot write happens before the
//!   head store with release, so the consumer's acquire load of head makes
//!   the slot contents visible.
//! - consumer: tail relaxed, head acquire; slot copy happens before the
//!   tail store with release, which frees the slot for the producer.
//!
//! Neither side ever blocks. A full ring drops the push; the hardware
//! counters keep accumulating, so the next successful sample carries the
//! cumulative delta.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::TelemetrySample;

#[repr(align(64))]
struct PaddedIndex(AtomicUsize);

pub struct SampleRing {
    slots: Box<[UnsafeCell<TelemetrySample>]>,
    mask: usize,
    /// Written only by the producer.
    head: PaddedIndex,
    /// Written only by the consumer.
    tail: PaddedIndex,
}

// SAFETY: exactly one thread may call `push` and exactly one thread may call
// `pop` at any time (the SPSC discipline). Under that discipline the
// release/acquire pairs on head and tail order every slot access: a slot is
// written by the producer strictly before the head store publishes it, and
// read by the consumer strictly before the tail store recycles it. Any other
// concurrent use is undefined behavior by contract.
unsafe impl Send for SampleRing {}
unsafe impl Sync for SampleRing {}

impl SampleRing {
    /// Allocate a ring. The requested capacity is rounded up to the next
    /// power of two (minimum 2).
    pub fn with_capacity(requested: usize) -> Self {
        let capacity = requested.max(2).next_power_of_two();
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(TelemetrySample::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            mask: capacity - 1,
            head: PaddedIndex(AtomicUsize::new(0)),
            tail: PaddedIndex(AtomicUsize::new(0)),
        }
    }

    /// Total slot count (power of two). Usable depth is `capacity() - 1`.
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Producer side. Returns false (sample dropped) when the ring is full.
    pub fn push(&self, sample: TelemetrySample) -> bool {
        let head = self.head.0.load(Ordering::Relaxed);
        let tail = self.tail.0.load(Ordering::Acquire);

        let next = (head + 1) & self.mask;
        if next == tail {
            return false;
        }

        // SAFETY: `head` is owned by this (sole) producer and the slot at
        // `head` is outside the consumer's visible range until the release
        // store below.
        unsafe {
            *self.slots[head].get() = sample;
        }

        self.head.0.store(next, Ordering::Release);
        true
    }

    /// Consumer side. Returns None when the ring is empty.
    pub fn pop(&self) -> Option<TelemetrySample> {
        let tail = self.tail.0.load(Ordering::Relaxed);
        let head = self.head.0.load(Ordering::Acquire);

        if tail == head {
            return None;
        }

        // SAFETY: `tail != head`, so the slot at `tail` was published by the
        // producer's release store and will not be rewritten before the
        // release store below recycles it.
        let sample = unsafe { *self.slots[tail].get() };

        self.tail.0.store((tail + 1) & self.mask, Ordering::Release);
        Some(sample)
    }

    /// Approximate fill level. Exact only when both sides are quiescent, but
    /// never over- or under-shoots past [0, capacity−1] under SPSC use.
    pub fn len(&self) -> usize {
        let head = self.head.0.load(Ordering::Acquire);
        let tail = self.tail.0.load(Ordering::Acquire);
        head.wrapping_sub(tail) & self.mask
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
