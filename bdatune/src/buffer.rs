//! Two-stage sample FIFO for TS data.
//!
//! The sample grabber delivers [`Sample`]s on a thread owned by the pipeline
//! runtime. The reader pulls them synchronously in two steps:
//!
//! 1. [`SampleBuffer::snapshot_size`] moves everything queued so far into the
//!    ready queue and reports its total length.
//! 2. [`SampleBuffer::drain`] copies the ready queue into the caller's buffer.
//!
//! Samples arriving between the two calls stay queued for the next snapshot.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::platform::SampleSink;

/// TS packet size.
pub const TS_PACKET_SIZE: usize = 188;

/// How long `snapshot_size` waits for the first sample.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound of samples waiting for a snapshot.
pub const DEFAULT_MAX_QUEUED: usize = 16384;

/// One unit of transport-stream data delivered by the grabber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    data: Bytes,
    discontinuity: bool,
}

impl Sample {
    pub fn new(data: impl Into<Bytes>, discontinuity: bool) -> Self {
        Self {
            data: data.into(),
            discontinuity,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether the stream was interrupted before this sample.
    pub fn is_discontinuity(&self) -> bool {
        self.discontinuity
    }
}

/// Errors returned to the reader.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// No sample arrived within the wait bound.
    #[error("Timed out after {0:?} waiting for a sample")]
    Timeout(Duration),

    /// The destination cannot hold the ready queue.
    #[error("Destination too small: need {needed} bytes, have {capacity}")]
    DestinationTooSmall { needed: usize, capacity: usize },
}

/// Result of one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Bytes written to the destination.
    pub bytes: usize,
    pub samples: usize,
    /// Samples flagged as discontinuities.
    pub discontinuities: usize,
}

/// Counters of a sample buffer.
///
/// `accepted == queued + delivered + discarded` at every observation point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub accepted: u64,
    pub dropped_not_ready: u64,
    pub dropped_overflow: u64,
    pub delivered: u64,
    /// Samples released by teardown without being read.
    pub discarded: u64,
    /// Samples currently held in either queue.
    pub queued: u64,
}

struct Queues {
    /// Set by the first snapshot; samples delivered before it are dropped.
    ready_to_receive: bool,
    /// Producer-fed queue.
    incoming: VecDeque<Sample>,
    /// Snapshot awaiting drain.
    ready: VecDeque<Sample>,
    ready_bytes: usize,
    warned_drop: bool,
}

/// Two-stage FIFO bridging the grabber callback and the pull-based reader.
pub struct SampleBuffer {
    queues: Mutex<Queues>,
    arrived: Condvar,
    wait_timeout: Duration,
    max_queued: usize,
    accepted: AtomicU64,
    dropped_not_ready: AtomicU64,
    dropped_overflow: AtomicU64,
    delivered: AtomicU64,
    discarded: AtomicU64,
}

impl SampleBuffer {
    /// Create a buffer with the default wait bound and queue limit.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_WAIT_TIMEOUT, DEFAULT_MAX_QUEUED)
    }

    pub fn with_limits(wait_timeout: Duration, max_queued: usize) -> Self {
        Self {
            queues: Mutex::new(Queues {
                ready_to_receive: false,
                incoming: VecDeque::new(),
                ready: VecDeque::new(),
                ready_bytes: 0,
                warned_drop: false,
            }),
            arrived: Condvar::new(),
            wait_timeout,
            max_queued: max_queued.max(1),
            accepted: AtomicU64::new(0),
            dropped_not_ready: AtomicU64::new(0),
            dropped_overflow: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    /// Whether the reader has asked for data at least once.
    pub fn is_ready(&self) -> bool {
        self.queues.lock().ready_to_receive
    }

    /// Accept a sample from the grabber.
    ///
    /// Dropped (and counted) until the first snapshot, and when the incoming
    /// queue is at its limit.
    pub fn deliver(&self, sample: Sample) {
        let mut queues = self.queues.lock();
        if !queues.ready_to_receive {
            self.dropped_not_ready.fetch_add(1, Ordering::Relaxed);
            if !queues.warned_drop {
                queues.warned_drop = true;
                warn!("[Buffer] Not ready - dropped sample ({} bytes)", sample.len());
            }
            return;
        }
        if queues.incoming.len() >= self.max_queued {
            self.dropped_overflow.fetch_add(1, Ordering::Relaxed);
            if !queues.warned_drop {
                queues.warned_drop = true;
                warn!(
                    "[Buffer] Queue full ({} samples) - dropped sample",
                    self.max_queued
                );
            }
            return;
        }
        queues.incoming.push_back(sample);
        self.accepted.fetch_add(1, Ordering::Relaxed);
        drop(queues);
        self.arrived.notify_one();
    }

    /// Mark the buffer ready, wait for data and fix the size of the next drain.
    ///
    /// Returns the number of bytes the following [`drain`](Self::drain) will write.
    pub fn snapshot_size(&self) -> Result<usize, BufferError> {
        let deadline = Instant::now() + self.wait_timeout;
        let mut queues = self.queues.lock();
        if !queues.ready_to_receive {
            queues.ready_to_receive = true;
            queues.warned_drop = false;
        }

        while queues.incoming.is_empty() {
            if self.arrived.wait_until(&mut queues, deadline).timed_out() {
                break;
            }
        }
        if queues.incoming.is_empty() {
            warn!(
                "[Buffer] Timed out after {:?} waiting for sample",
                self.wait_timeout
            );
            return Err(BufferError::Timeout(self.wait_timeout));
        }

        let incoming = std::mem::take(&mut queues.incoming);
        let moved = incoming.len();
        for sample in incoming {
            queues.ready_bytes += sample.len();
            queues.ready.push_back(sample);
        }
        debug!(
            "[Buffer] Snapshot: {} samples moved, {} bytes ready",
            moved, queues.ready_bytes
        );
        Ok(queues.ready_bytes)
    }

    /// Copy the snapshot into `dest`, back to back in arrival order.
    ///
    /// Nothing is consumed when `dest` is shorter than the snapshot.
    pub fn drain(&self, dest: &mut [u8]) -> Result<DrainReport, BufferError> {
        let ready = {
            let mut queues = self.queues.lock();
            if dest.len() < queues.ready_bytes {
                return Err(BufferError::DestinationTooSmall {
                    needed: queues.ready_bytes,
                    capacity: dest.len(),
                });
            }
            queues.ready_bytes = 0;
            let ready = std::mem::take(&mut queues.ready);
            // Counters that stats() balances change under the queue lock.
            self.delivered
                .fetch_add(ready.len() as u64, Ordering::Relaxed);
            ready
        };

        let mut report = DrainReport::default();
        for sample in ready {
            if sample.is_discontinuity() {
                warn!("[Buffer] Sample discontinuity at offset {}", report.bytes);
                report.discontinuities += 1;
            }
            let end = report.bytes + sample.len();
            dest[report.bytes..end].copy_from_slice(sample.data());
            report.bytes = end;
            report.samples += 1;
        }
        Ok(report)
    }

    /// Release every queued sample. The ready state is kept.
    pub fn clear(&self) {
        let mut queues = self.queues.lock();
        let released = queues.incoming.len() + queues.ready.len();
        queues.incoming.clear();
        queues.ready.clear();
        queues.ready_bytes = 0;
        queues.warned_drop = false;
        self.discarded.fetch_add(released as u64, Ordering::Relaxed);
        drop(queues);
        if released > 0 {
            debug!("[Buffer] Released {} pending samples", released);
        }
    }

    pub fn stats(&self) -> BufferStats {
        let queues = self.queues.lock();
        BufferStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            dropped_not_ready: self.dropped_not_ready.load(Ordering::Relaxed),
            dropped_overflow: self.dropped_overflow.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            queued: (queues.incoming.len() + queues.ready.len()) as u64,
        }
    }
}

impl Default for SampleBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleSink for SampleBuffer {
    fn on_sample(&self, sample: Sample) {
        self.deliver(sample);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn packet(fill: u8) -> Sample {
        Sample::new(vec![fill; TS_PACKET_SIZE], false)
    }

    fn short_buffer() -> SampleBuffer {
        SampleBuffer::with_limits(Duration::from_millis(100), DEFAULT_MAX_QUEUED)
    }

    #[test]
    fn test_drops_until_first_snapshot() {
        let buffer = short_buffer();
        buffer.deliver(packet(1));
        buffer.deliver(packet(2));

        let stats = buffer.stats();
        assert_eq!(stats.dropped_not_ready, 2);
        assert_eq!(stats.accepted, 0);
        assert!(!buffer.is_ready());

        assert_eq!(buffer.snapshot_size(), Err(BufferError::Timeout(Duration::from_millis(100))));
        assert!(buffer.is_ready());
    }

    #[test]
    fn test_snapshot_then_drain_preserves_order() {
        let buffer = short_buffer();
        let _ = buffer.snapshot_size();

        buffer.deliver(Sample::new(vec![0x47, 1, 2], false));
        buffer.deliver(Sample::new(vec![0x47, 3], true));
        buffer.deliver(Sample::new(vec![0x47], false));

        let size = buffer.snapshot_size().unwrap();
        assert_eq!(size, 6);

        let mut dest = vec![0u8; size];
        let report = buffer.drain(&mut dest).unwrap();
        assert_eq!(report.bytes, size);
        assert_eq!(report.samples, 3);
        assert_eq!(report.discontinuities, 1);
        assert_eq!(dest, vec![0x47, 1, 2, 0x47, 3, 0x47]);
        assert_eq!(buffer.stats().delivered, 3);
    }

    #[test]
    fn test_timeout_leaves_ready_queue_empty() {
        let buffer = short_buffer();
        let start = Instant::now();
        let err = buffer.snapshot_size().unwrap_err();
        assert!(matches!(err, BufferError::Timeout(_)));
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(buffer.stats().queued, 0);

        let mut dest = [0u8; 4];
        assert_eq!(buffer.drain(&mut dest).unwrap().bytes, 0);
    }

    #[test]
    fn test_late_samples_wait_for_next_snapshot() {
        let buffer = short_buffer();
        let _ = buffer.snapshot_size();
        buffer.deliver(packet(1));

        let size = buffer.snapshot_size().unwrap();
        buffer.deliver(packet(2));

        let mut dest = vec![0u8; size];
        let report = buffer.drain(&mut dest).unwrap();
        assert_eq!(report.bytes, TS_PACKET_SIZE);
        assert!(dest.iter().all(|&b| b == 1));
        assert_eq!(buffer.stats().queued, 1);
    }

    #[test]
    fn test_short_destination_consumes_nothing() {
        let buffer = short_buffer();
        let _ = buffer.snapshot_size();
        buffer.deliver(packet(7));
        let size = buffer.snapshot_size().unwrap();

        let mut small = vec![0u8; size - 1];
        assert_eq!(
            buffer.drain(&mut small),
            Err(BufferError::DestinationTooSmall {
                needed: size,
                capacity: size - 1
            })
        );

        let mut dest = vec![0u8; size];
        assert_eq!(buffer.drain(&mut dest).unwrap().bytes, size);
    }

    #[test]
    fn test_queue_limit_drops_excess() {
        let buffer = SampleBuffer::with_limits(Duration::from_millis(50), 2);
        let _ = buffer.snapshot_size();
        for fill in 0..5 {
            buffer.deliver(packet(fill));
        }

        let stats = buffer.stats();
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.dropped_overflow, 3);
    }

    #[test]
    fn test_clear_discards_pending() {
        let buffer = short_buffer();
        let _ = buffer.snapshot_size();
        buffer.deliver(packet(1));
        buffer.deliver(packet(2));
        buffer.snapshot_size().unwrap();
        buffer.deliver(packet(3));

        buffer.clear();
        let stats = buffer.stats();
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.discarded, 3);
        assert!(buffer.is_ready());
    }

    #[test]
    fn test_stats_balance_while_draining() {
        let buffer = Arc::new(short_buffer());
        let _ = buffer.snapshot_size();
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let observer = {
            let buffer = Arc::clone(&buffer);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    let stats = buffer.stats();
                    assert_eq!(stats.accepted, stats.queued + stats.delivered + stats.discarded);
                }
            })
        };

        for round in 0..200u8 {
            buffer.deliver(packet(round));
            buffer.deliver(packet(round));
            let size = buffer.snapshot_size().unwrap();
            let mut dest = vec![0u8; size];
            buffer.drain(&mut dest).unwrap();
        }
        done.store(true, Ordering::Release);
        observer.join().unwrap();
        assert_eq!(buffer.stats().delivered, 400);
    }

    #[test]
    fn test_concurrent_producer_conserves_samples() {
        let buffer = Arc::new(SampleBuffer::with_limits(
            Duration::from_millis(500),
            DEFAULT_MAX_QUEUED,
        ));
        let _ = buffer.snapshot_size();

        let producer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                for i in 0..2000u32 {
                    buffer.on_sample(Sample::new(i.to_be_bytes().to_vec(), false));
                }
            })
        };

        let mut received = Vec::new();
        while received.len() < 2000 * 4 {
            let size = match buffer.snapshot_size() {
                Ok(size) => size,
                Err(_) => break,
            };
            let mut dest = vec![0u8; size];
            let report = buffer.drain(&mut dest).unwrap();
            received.extend_from_slice(&dest[..report.bytes]);
        }
        producer.join().unwrap();

        let stats = buffer.stats();
        assert_eq!(stats.accepted, stats.queued + stats.delivered + stats.discarded);
        for (i, chunk) in received.chunks(4).enumerate() {
            assert_eq!(u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]), i as u32);
        }
    }
}
