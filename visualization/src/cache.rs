//! Time-indexed ring buffer of recently played PCM
//!
//! The output thread appends with [`RingCache::add`]; sessions on the event
//! loop pull windows of frames ending at a given instant with
//! [`RingCache::get_by_time`]. A single mutex guards all state.

use log::{debug, trace, warn};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use vis_core::{AudioFormat, Error};

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Mutable ring state
struct Ring {
    data: Vec<u8>,
    /// Offset of the oldest valid byte
    p0: usize,
    /// Offset one past the newest valid byte
    p1: usize,
    /// Number of valid bytes
    cb: usize,
    /// `[t0, t1)`, set on the first add
    range: Option<(Instant, Instant)>,
}

/// Fixed-capacity PCM cache mapping wall-clock time to audio frames.
pub struct RingCache {
    format: AudioFormat,
    frame_size: usize,
    capacity: usize,
    ring: Mutex<Ring>,
}

impl RingCache {
    /// Create a cache able to hold `span` worth of audio in `format`.
    pub fn new(format: AudioFormat, span: Duration) -> Result<Self, Error> {
        if !format.is_valid() {
            return Err(Error::Audio(format!("Invalid audio format {}", format)));
        }

        let capacity = format.time_to_size(span);
        if capacity == 0 {
            return Err(Error::Audio(format!(
                "Cache span of {:?} holds no whole frames at {}",
                span, format
            )));
        }

        debug!(
            "Creating PCM cache: format {}, span {:?}, {} bytes",
            format, span, capacity
        );

        Ok(Self {
            format,
            frame_size: format.frame_size(),
            capacity,
            ring: Mutex::new(Ring {
                data: vec![0; capacity],
                p0: 0,
                p1: 0,
                cb: 0,
                range: None,
            }),
        })
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Capacity in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        // The guarded state is plain bytes and offsets, always consistent
        // between statements.
        self.ring
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append PCM to the newest end of the cache, overwriting the oldest data
    /// as needed. Trailing bytes that do not make up a whole frame are dropped.
    pub fn add(&self, data: &[u8]) {
        let whole = data.len() - data.len() % self.frame_size;
        if whole != data.len() {
            warn!(
                "Dropping {} trailing bytes that do not form a whole frame",
                data.len() - whole
            );
        }
        let data = &data[..whole];
        let size = data.len();
        if size == 0 {
            return;
        }

        trace!("RingCache::add({} bytes)", size);

        let mut ring = self.lock();
        let (_, mut t1) = *ring.range.get_or_insert_with(|| {
            let now = Instant::now();
            (now, now)
        });

        let cap = self.capacity;
        if size > cap {
            // Only the tail fits; everything older is discarded.
            ring.data.copy_from_slice(&data[size - cap..]);
            ring.p0 = 0;
            ring.p1 = 0;
            ring.cb = cap;
        } else {
            let p1 = ring.p1;
            let part1 = size.min(cap - p1);
            let part2 = size - part1;
            ring.data[p1..p1 + part1].copy_from_slice(&data[..part1]);
            ring.data[..part2].copy_from_slice(&data[part1..]);
            ring.p1 = (p1 + size) % cap;

            let overwritten = if ring.cb == cap {
                size
            } else {
                (ring.cb + size).saturating_sub(cap)
            };
            ring.p0 = (ring.p0 + overwritten) % cap;
            ring.cb += size - overwritten;
        }

        t1 += self.format.size_to_time(size);
        let t0 = t1 - self.format.size_to_time(ring.cb);
        ring.range = Some((t0, t1));
    }

    /// Copy the oldest `nsamp` frames into `buf`.
    pub fn get_from_beginning(&self, nsamp: usize, buf: &mut [u8]) -> bool {
        let cbsamp = nsamp * self.frame_size;
        if cbsamp > buf.len() || cbsamp > self.capacity {
            return false;
        }

        let ring = self.lock();
        self.copy_out(&ring, ring.p0, &mut buf[..cbsamp]);
        true
    }

    /// Copy the `nsamp` frames ending at `t` into `buf`.
    ///
    /// Fails when `t` lies after the newest data, or when fewer than `nsamp`
    /// frames were played between the oldest cached instant and `t`.
    pub fn get_by_time(&self, nsamp: usize, t: Instant, buf: &mut [u8]) -> bool {
        let cbsamp = nsamp * self.frame_size;
        if cbsamp > buf.len() {
            warn!(
                "Can't fit {} frames ({} bytes) into {} bytes",
                nsamp,
                cbsamp,
                buf.len()
            );
            return false;
        }

        let ring = self.lock();
        let Some((t0, t1)) = ring.range else {
            debug!("Cache is empty; no frames for this request");
            return false;
        };

        if t > t1 {
            debug!(
                "Requested time is {:?} past the newest cached frame",
                t - t1
            );
            return false;
        }
        if t < t0 {
            debug!(
                "Requested time is {:?} before the oldest cached frame",
                t0 - t
            );
            return false;
        }

        // Frame `t` falls into, rounding partial frames up
        let delta = (t - t0).as_nanos() * self.format.sample_rate as u128;
        let frames = (delta.div_ceil(NANOS_PER_SEC) as usize).min(ring.cb / self.frame_size);
        let available = frames * self.frame_size;
        if cbsamp > available {
            debug!(
                "Requested {} bytes but only {} bytes precede that time",
                cbsamp, available
            );
            return false;
        }

        let start = (ring.p0 + available - cbsamp) % self.capacity;
        self.copy_out(&ring, start, &mut buf[..cbsamp]);
        true
    }

    fn copy_out(&self, ring: &Ring, start: usize, out: &mut [u8]) {
        let part1 = out.len().min(self.capacity - start);
        let part2 = out.len() - part1;
        out[..part1].copy_from_slice(&ring.data[start..start + part1]);
        out[part1..].copy_from_slice(&ring.data[..part2]);
    }

    /// `(t0, t1)`: the span of time the cached bytes cover, once anything
    /// has been added.
    pub fn range(&self) -> Option<(Instant, Instant)> {
        self.lock().range
    }

    /// Number of cached bytes
    pub fn size(&self) -> usize {
        self.lock().cb
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}
