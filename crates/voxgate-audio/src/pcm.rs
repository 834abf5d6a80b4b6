//! Bounded sample queue between the decode thread and the output callback.
//!
//! The decode thread blocks when the queue is full, which throttles decoding
//! to the device's playback rate. The output callback never blocks.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

struct Inner {
    samples: VecDeque<f32>,
    /// Producer is done; drain what is left.
    finished: bool,
    /// Session torn down; producer must stop.
    closed: bool,
}

/// Single-producer, single-consumer queue of interleaved samples.
pub struct PcmQueue {
    inner: Mutex<Inner>,
    space: Condvar,
    capacity: usize,
}

/// Thread-safe reference to a sample queue.
pub type SharedPcmQueue = Arc<PcmQueue>;

impl PcmQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                samples: VecDeque::with_capacity(capacity),
                finished: false,
                closed: false,
            }),
            space: Condvar::new(),
            capacity,
        }
    }

    pub fn shared(capacity: usize) -> SharedPcmQueue {
        Arc::new(Self::new(capacity))
    }

    /// Queue all of `samples`, waiting for space as needed.
    ///
    /// Returns `false` if the queue was closed before everything fit.
    pub fn push(&self, mut samples: &[f32]) -> bool {
        let mut inner = self.inner.lock();
        while !samples.is_empty() {
            if inner.closed {
                return false;
            }
            let free = self.capacity - inner.samples.len();
            if free == 0 {
                self.space.wait(&mut inner);
                continue;
            }
            let n = free.min(samples.len());
            inner.samples.extend(&samples[..n]);
            samples = &samples[n..];
        }
        !inner.closed
    }

    /// Fill `output` from the head of the queue. Never blocks.
    ///
    /// Returns the number of samples copied.
    pub fn pop_into(&self, output: &mut [f32]) -> usize {
        let mut inner = self.inner.lock();
        let n = output.len().min(inner.samples.len());
        for (slot, sample) in output.iter_mut().zip(inner.samples.drain(..n)) {
            *slot = sample;
        }
        drop(inner);
        if n > 0 {
            self.space.notify_one();
        }
        n
    }

    /// Mark the producer as done.
    pub fn finish(&self) {
        self.inner.lock().finished = true;
    }

    /// True once the producer finished and every sample was consumed.
    pub fn is_drained(&self) -> bool {
        let inner = self.inner.lock();
        inner.finished && inner.samples.is_empty()
    }

    /// Discard all samples and wake a blocked producer.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.samples.clear();
        drop(inner);
        self.space.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
