//! Fixed-capacity per-channel sample windows.
//!
//! The BLE notification task writes, the analysis tick reads.  Each channel
//! sits behind its own mutex and is only ever read through
//! [`ChannelBuffers::snapshot`], which copies under the lock, so an eviction
//! racing a read can never be observed half-done.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::protocol::{EEG_CHANNEL_COUNT, EEG_FREQUENCY};
use crate::types::Channel;

/// One ring of samples per [`Channel`], always exactly `capacity` long.
#[derive(Debug)]
pub struct ChannelBuffers {
    capacity: usize,
    rings: [Mutex<VecDeque<f64>>; EEG_CHANNEL_COUNT],
    total_samples: AtomicU64,
}

impl ChannelBuffers {
    /// Buffers holding `capacity` samples per channel, pre-filled with zeros.
    ///
    /// A zero capacity is raised to one so the window is never empty.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            rings: std::array::from_fn(|_| Mutex::new(zeroed(capacity))),
            total_samples: AtomicU64::new(0),
        }
    }

    /// Buffers sized for `window_secs` of signal at the device sample rate.
    pub fn for_window(window_secs: f64) -> Self {
        Self::new((EEG_FREQUENCY * window_secs).round() as usize)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append one sample, evicting the oldest.
    pub fn push(&self, channel: Channel, sample: f64) {
        self.push_samples(channel, &[sample]);
    }

    /// Append a decoded notification under a single lock acquisition.
    pub fn push_samples(&self, channel: Channel, samples: &[f64]) {
        let mut ring = self.ring(channel);
        for &s in samples {
            ring.pop_front();
            ring.push_back(s);
        }
        self.total_samples.fetch_add(samples.len() as u64, Ordering::Relaxed);
    }

    /// Ordered copy of the channel's window, oldest first.
    pub fn snapshot(&self, channel: Channel) -> Vec<f64> {
        self.ring(channel).iter().copied().collect()
    }

    /// Zero every window.  Called when a new session starts.
    pub fn reset(&self) {
        for channel in Channel::ALL {
            *self.ring(channel) = zeroed(self.capacity);
        }
    }

    /// Samples pushed since construction, across all channels.
    pub fn total_samples(&self) -> u64 {
        self.total_samples.load(Ordering::Relaxed)
    }

    fn ring(&self, channel: Channel) -> MutexGuard<'_, VecDeque<f64>> {
        self.rings[channel.index()]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn zeroed(capacity: usize) -> VecDeque<f64> {
    std::iter::repeat(0.0).take(capacity).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_full_of_zeros() {
        let buffers = ChannelBuffers::for_window(2.0);
        assert_eq!(buffers.capacity(), 512);
        for ch in Channel::ALL {
            let snap = buffers.snapshot(ch);
            assert_eq!(snap.len(), 512);
            assert!(snap.iter().all(|&v| v == 0.0));
        }
    }

    #[test]
    fn overflow_evicts_oldest_first() {
        let capacity = 8;
        for n in [capacity + 1, capacity * 2, capacity * 3 + 5] {
            let buffers = ChannelBuffers::new(capacity);
            for i in 1..=n {
                buffers.push(Channel::Af7, i as f64);
            }
            let expected: Vec<f64> = ((n - capacity + 1)..=n).map(|i| i as f64).collect();
            assert_eq!(buffers.snapshot(Channel::Af7), expected);
        }
    }

    #[test]
    fn channels_are_independent() {
        let buffers = ChannelBuffers::new(4);
        buffers.push_samples(Channel::Tp9, &[1.0, 2.0]);
        assert_eq!(buffers.snapshot(Channel::Tp9), vec![0.0, 0.0, 1.0, 2.0]);
        assert_eq!(buffers.snapshot(Channel::Tp10), vec![0.0; 4]);
        assert_eq!(buffers.total_samples(), 2);
    }

    #[test]
    fn snapshot_is_a_copy() {
        let buffers = ChannelBuffers::new(3);
        let before = buffers.snapshot(Channel::Af8);
        buffers.push(Channel::Af8, 9.0);
        assert_eq!(before, vec![0.0; 3]);
        assert_eq!(buffers.snapshot(Channel::Af8), vec![0.0, 0.0, 9.0]);
    }

    #[test]
    fn reset_zeroes_windows() {
        let buffers = ChannelBuffers::new(2);
        buffers.push_samples(Channel::Tp9, &[5.0, 6.0]);
        buffers.reset();
        assert_eq!(buffers.snapshot(Channel::Tp9), vec![0.0, 0.0]);
    }

    #[test]
    fn concurrent_push_and_snapshot_keep_capacity() {
        use std::sync::Arc;

        let buffers = Arc::new(ChannelBuffers::new(64));
        let writer = {
            let buffers = Arc::clone(&buffers);
            std::thread::spawn(move || {
                for i in 0..10_000 {
                    buffers.push_samples(Channel::Tp9, &[i as f64; 12]);
                }
            })
        };
        for _ in 0..1_000 {
            assert_eq!(buffers.snapshot(Channel::Tp9).len(), 64);
        }
        writer.join().unwrap();
    }
}
