//! Fixed pool of preallocated video frame buffers.
//!
//! The isochronous callback must never block or allocate, so frames are
//! carved out up front and recycled through a lock-free free list. An
//! exhausted pool is a backpressure signal: the caller skips the frame
//! and keeps streaming.

use crossbeam_queue::SegQueue;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One image buffer plus capture metadata. The pool owns the allocation;
/// everything downstream borrows it through [`PooledFrame`].
#[derive(Debug)]
pub struct Frame {
    pub data: Vec<u8>,
    pub stride: usize,
    pub width: u32,
    pub height: u32,
    /// Host monotonic nanoseconds at the first payload of this frame.
    pub start_ts: u64,
    /// Presentation timestamp in sensor clock ticks.
    pub pts: u32,
}

impl Frame {
    pub fn data_size(&self) -> usize {
        self.data.len()
    }
}

struct PoolInner {
    free: SegQueue<Box<Frame>>,
    available: AtomicUsize,
    capacity: usize,
    frame_size: usize,
}

/// Thread-safe pool of `capacity` frames of `frame_size` bytes each.
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

impl FramePool {
    pub fn new(capacity: usize, frame_size: usize) -> Self {
        let free = SegQueue::new();
        for _ in 0..capacity {
            free.push(Box::new(Frame {
                data: vec![0u8; frame_size],
                stride: 0,
                width: 0,
                height: 0,
                start_ts: 0,
                pts: 0,
            }));
        }
        Self {
            inner: Arc::new(PoolInner {
                free,
                available: AtomicUsize::new(capacity),
                capacity,
                frame_size,
            }),
        }
    }

    /// Take a frame without blocking. `None` means the pool is exhausted
    /// and the caller should drop the incoming data.
    pub fn acquire(&self) -> Option<PooledFrame> {
        let frame = self.inner.free.pop()?;
        self.inner.available.fetch_sub(1, Ordering::Relaxed);
        Some(PooledFrame {
            frame: Some(frame),
            pool: Arc::clone(&self.inner),
        })
    }

    pub fn available(&self) -> usize {
        self.inner.available.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn frame_size(&self) -> usize {
        self.inner.frame_size
    }
}

/// A frame on loan from the pool. Dropping it returns the buffer.
pub struct PooledFrame {
    frame: Option<Box<Frame>>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledFrame {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        // The inner frame is only ever taken in drop().
        self.frame.as_ref().expect("frame accessed after release")
    }
}

impl DerefMut for PooledFrame {
    fn deref_mut(&mut self) -> &mut Frame {
        self.frame.as_mut().expect("frame accessed after release")
    }
}

impl Drop for PooledFrame {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            self.pool.free.push(frame);
            self.pool.available.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for PooledFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledFrame")
            .field("start_ts", &self.start_ts)
            .field("pts", &self.pts)
            .field("data_size", &self.data_size())
            .finish()
    }
}
