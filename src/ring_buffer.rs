//! Single-producer single-consumer byte ring.
//!
//! The readout worker of a board is the only producer; the controller is
//! the only consumer. Writes are contiguous: when the space left at the end
//! is too small, the producer marks where the data ends and continues at
//! offset 0, so every event a reader committed can be decoded in place.
//!
//! Cursors are atomics. The producer publishes `write_pos` with release
//! ordering after the bytes are in place, and the consumer acquires it
//! before touching them; `read_pos` works the same way in the other
//! direction. `write_pos == read_pos` means empty, so the producer never
//! fills the last byte before the read cursor.

use crate::error::RingBufferError;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

struct Shared {
    data: Box<[UnsafeCell<u8>]>,
    write_pos: AtomicUsize,
    read_pos: AtomicUsize,
    /// End of valid data once the producer has wrapped.
    end_pos: AtomicUsize,
    producer_live: AtomicBool,
}

// Bytes in [read_pos, write_pos) belong to the consumer, everything else to
// the producer; the cursor protocol keeps the two regions disjoint.
unsafe impl Sync for Shared {}

impl Shared {
    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn ptr(&self, offset: usize) -> *mut u8 {
        // SAFETY: offset <= capacity, checked by the callers.
        UnsafeCell::raw_get(unsafe { self.data.as_ptr().add(offset) })
    }
}

/// Consumer side, owned by the controller.
pub struct RingBuffer {
    shared: Arc<Shared>,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        let bytes = vec![0u8; capacity].into_boxed_slice();
        // SAFETY: UnsafeCell<u8> has the same layout as u8.
        let data = unsafe { Box::from_raw(Box::into_raw(bytes) as *mut [UnsafeCell<u8>]) };
        Self {
            shared: Arc::new(Shared {
                data,
                write_pos: AtomicUsize::new(0),
                read_pos: AtomicUsize::new(0),
                end_pos: AtomicUsize::new(capacity),
                producer_live: AtomicBool::new(false),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    /// The producer handle, unless one is already out.
    pub fn producer(&self) -> Option<Producer> {
        self.shared
            .producer_live
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Producer {
                shared: Arc::clone(&self.shared),
                pending: None,
            })
    }

    /// Discard everything. Only allowed while no producer is live.
    pub fn reset(&mut self) -> Result<(), RingBufferError> {
        if self.shared.producer_live.load(Ordering::Acquire) {
            return Err(RingBufferError::ProducerActive);
        }
        self.shared.write_pos.store(0, Ordering::Release);
        self.shared.read_pos.store(0, Ordering::Release);
        self.shared.end_pos.store(self.capacity(), Ordering::Release);
        Ok(())
    }

    /// Bytes currently buffered.
    pub fn level(&self) -> usize {
        let w = self.shared.write_pos.load(Ordering::Acquire);
        let r = self.shared.read_pos.load(Ordering::Acquire);
        if w >= r {
            w - r
        } else {
            self.shared.end_pos.load(Ordering::Acquire) - r + w
        }
    }

    pub fn is_empty(&self) -> bool {
        self.level() == 0
    }

    /// The next contiguous run of committed bytes. Starts at an event
    /// boundary as long as the producer commits whole events.
    pub fn readable(&mut self) -> &[u8] {
        let w = self.shared.write_pos.load(Ordering::Acquire);
        let mut r = self.shared.read_pos.load(Ordering::Relaxed);

        let end = if w >= r {
            w
        } else {
            let end = self.shared.end_pos.load(Ordering::Acquire);
            if r < end {
                end
            } else {
                r = 0;
                self.shared.read_pos.store(0, Ordering::Release);
                w
            }
        };

        // SAFETY: [r, end) was published by the producer and it will not
        // write there until read_pos moves past it.
        unsafe { std::slice::from_raw_parts(self.shared.ptr(r), end - r) }
    }

    /// Release `n` bytes from the front of [`readable`](Self::readable).
    pub fn consume(&mut self, n: usize) {
        let r = self.shared.read_pos.load(Ordering::Relaxed);
        self.shared.read_pos.store(r + n, Ordering::Release);
    }
}

#[derive(Clone, Copy, Debug)]
struct Reservation {
    start: usize,
    len: usize,
}

/// Producer side, moved into a readout worker.
pub struct Producer {
    shared: Arc<Shared>,
    pending: Option<Reservation>,
}

impl Producer {
    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    /// Largest contiguous write possible right now.
    pub fn headroom(&self) -> usize {
        let w = self.shared.write_pos.load(Ordering::Relaxed);
        let r = self.shared.read_pos.load(Ordering::Acquire);
        if w >= r {
            (self.capacity() - w).max(r.saturating_sub(1))
        } else {
            r - w - 1
        }
    }

    /// Borrow `len` contiguous bytes to fill; nothing is visible to the
    /// consumer until [`commit`](Self::commit).
    pub fn reserve(&mut self, len: usize) -> Result<&mut [u8], RingBufferError> {
        let w = self.shared.write_pos.load(Ordering::Relaxed);
        let r = self.shared.read_pos.load(Ordering::Acquire);

        let start = if w >= r {
            if self.capacity() - w >= len {
                Some(w)
            } else if r > len {
                Some(0)
            } else {
                None
            }
        } else if r - w > len {
            Some(w)
        } else {
            None
        };

        let start = start.ok_or(RingBufferError::InsufficientHeadroom {
            requested: len,
            available: self.headroom(),
        })?;
        self.pending = Some(Reservation { start, len });

        // SAFETY: the range lies outside [read_pos, write_pos) and this is
        // the only producer.
        Ok(unsafe { std::slice::from_raw_parts_mut(self.shared.ptr(start), len) })
    }

    /// Publish the first `n` bytes of the last reservation.
    pub fn commit(&mut self, n: usize) {
        let Some(res) = self.pending.take() else {
            return;
        };
        let n = n.min(res.len);
        if n == 0 {
            return;
        }

        let w = self.shared.write_pos.load(Ordering::Relaxed);
        if res.start != w {
            // wrapped: data now ends at the old write position
            self.shared.end_pos.store(w, Ordering::Release);
        }
        self.shared.write_pos.store(res.start + n, Ordering::Release);
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<(), RingBufferError> {
        self.reserve(bytes.len())?.copy_from_slice(bytes);
        self.commit(bytes.len());
        Ok(())
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.shared.producer_live.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::thread;

    #[test]
    fn one_producer_at_a_time() {
        let mut rb = RingBuffer::new(64);
        let producer = rb.producer().unwrap();
        assert!(rb.producer().is_none());
        assert_eq!(rb.reset(), Err(RingBufferError::ProducerActive));
        drop(producer);
        assert!(rb.reset().is_ok());
        assert!(rb.producer().is_some());
    }

    #[test]
    fn writes_wrap_without_splitting() {
        let mut rb = RingBuffer::new(32);
        let mut p = rb.producer().unwrap();

        p.write(&[1; 20]).unwrap();
        assert_eq!(rb.readable(), &[1; 20][..]);
        rb.consume(20);

        // 12 bytes left at the end, so 16 go to the start
        p.write(&[2; 16]).unwrap();
        assert_eq!(rb.level(), 16);
        assert_eq!(rb.readable(), &[2; 16][..]);
        rb.consume(16);
        assert!(rb.is_empty());
    }

    #[test]
    fn never_overwrites_unread_data() {
        let mut rb = RingBuffer::new(32);
        let mut p = rb.producer().unwrap();
        p.write(&[1; 20]).unwrap();
        assert_eq!(p.headroom(), 12);
        assert!(matches!(
            p.write(&[2; 13]),
            Err(RingBufferError::InsufficientHeadroom { requested: 13, .. })
        ));
        p.write(&[2; 12]).unwrap();
        assert_eq!(rb.level(), 32);
        assert_eq!(p.headroom(), 0);

        rb.consume(20);
        // reading at 20 leaves 19 usable bytes before it
        assert_eq!(p.headroom(), 19);
        p.write(&[3; 19]).unwrap();
        assert_eq!(rb.level(), 12 + 19);
    }

    #[test]
    fn partial_commit() {
        let mut rb = RingBuffer::new(64);
        let mut p = rb.producer().unwrap();
        let buf = p.reserve(40).unwrap();
        buf[..8].copy_from_slice(&[7; 8]);
        p.commit(8);
        assert_eq!(rb.readable(), &[7; 8][..]);
        p.commit(8);
        assert_eq!(rb.level(), 8);
    }

    #[test]
    fn bytes_in_equal_bytes_out() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut rb = RingBuffer::new(1000);
        let mut p = rb.producer().unwrap();
        let (mut written, mut read) = (0usize, 0usize);

        for i in 0..2000 {
            let len = rng.random_range(1..=400);
            let byte = (i % 251) as u8;
            if p.write(&vec![byte; len]).is_ok() {
                written += len;
            }
            assert!(p.headroom() <= rb.capacity());

            loop {
                let n = rb.readable().len();
                if n == 0 {
                    break;
                }
                read += n;
                rb.consume(n);
            }
        }
        assert_eq!(written, read);
        assert!(rb.is_empty());
    }

    #[test]
    fn threads_see_every_record_in_order() {
        let mut rb = RingBuffer::new(4096);
        let mut p = rb.producer().unwrap();
        const N: u32 = 20_000;

        let writer = thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(11);
            let mut i = 0u32;
            while i < N {
                let pad = rng.random_range(0..60usize);
                let mut record = vec![0u8; 8 + pad];
                record[..4].copy_from_slice(&i.to_le_bytes());
                record[4..8].copy_from_slice(&(pad as u32).to_le_bytes());
                if p.write(&record).is_ok() {
                    i += 1;
                } else {
                    thread::yield_now();
                }
            }
        });

        let mut expected = 0u32;
        while expected < N {
            let chunk = rb.readable();
            if chunk.is_empty() {
                thread::yield_now();
                continue;
            }
            let mut offset = 0;
            while offset + 8 <= chunk.len() {
                let id = u32::from_le_bytes(chunk[offset..offset + 4].try_into().unwrap());
                let pad = u32::from_le_bytes(chunk[offset + 4..offset + 8].try_into().unwrap());
                assert_eq!(id, expected);
                expected += 1;
                offset += 8 + pad as usize;
            }
            assert_eq!(offset, chunk.len());
            rb.consume(offset);
        }
        writer.join().unwrap();
    }
}
