//! Reusable page-locked host buffers and reusable GPU events.
//!
//! Both allocations are expensive driver round-trips; the request pipeline
//! needs a handful of each per drain, every frame. The pools keep acquire
//! and release O(1) apart from a short free-list scan under a mutex.

use std::ptr::NonNull;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::gpu::{Event, GpuResult, GpuRuntime};

// ---------------------------------------------------------------------------
// Pinned host buffers
// ---------------------------------------------------------------------------

struct PinnedEntry {
    ptr: NonNull<u8>,
    len: usize,
}

// Entries are exclusively owned allocations; the raw pointer never aliases.
unsafe impl Send for PinnedEntry {}

/// Pool of page-locked host buffers with a bounded free list.
pub struct PinnedBufferPool {
    gpu: Arc<dyn GpuRuntime>,
    max_pooled: usize,
    free: Mutex<Vec<PinnedEntry>>,
    /// Handed to outstanding buffers so they can find their way back.
    self_ref: Weak<PinnedBufferPool>,
}

impl PinnedBufferPool {
    pub const DEFAULT_MAX_POOLED: usize = 8;

    pub fn new(gpu: Arc<dyn GpuRuntime>, max_pooled: usize) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            gpu,
            max_pooled,
            free: Mutex::new(Vec::new()),
            self_ref: self_ref.clone(),
        })
    }

    /// Acquire a pinned buffer of at least `len` bytes: the smallest pooled
    /// buffer that fits (handing back its full capacity), else a fresh
    /// page-locked allocation.
    pub fn acquire(&self, len: usize) -> GpuResult<PinnedBuffer> {
        let pool = self.self_ref.upgrade().expect("pool alive during acquire");
        {
            let mut free = self.free.lock();
            let best = free
                .iter()
                .enumerate()
                .filter(|(_, e)| e.len >= len)
                .min_by_key(|(_, e)| e.len)
                .map(|(i, _)| i);
            if let Some(i) = best {
                let entry = free.swap_remove(i);
                return Ok(PinnedBuffer {
                    pool,
                    ptr: entry.ptr,
                    len: entry.len,
                });
            }
        }

        let ptr = self.gpu.host_alloc(len)?;
        Ok(PinnedBuffer { pool, ptr, len })
    }

    pub fn pooled_count(&self) -> usize {
        self.free.lock().len()
    }

    fn release(&self, ptr: NonNull<u8>, len: usize) {
        let mut free = self.free.lock();
        if free.len() >= self.max_pooled {
            drop(free);
            unsafe { self.gpu.host_free(ptr, len) };
        } else {
            free.push(PinnedEntry { ptr, len });
        }
    }
}

impl Drop for PinnedBufferPool {
    fn drop(&mut self) {
        for entry in self.free.get_mut().drain(..) {
            unsafe { self.gpu.host_free(entry.ptr, entry.len) };
        }
    }
}

/// Scoped pinned buffer; returns to its pool (or is freed) on drop.
pub struct PinnedBuffer {
    pool: Arc<PinnedBufferPool>,
    ptr: NonNull<u8>,
    len: usize,
}

// Single-owner allocation; access control is the owner's responsibility.
unsafe impl Send for PinnedBuffer {}
unsafe impl Sync for PinnedBuffer {}

impl PinnedBuffer {
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// View the buffer as bytes.
    ///
    /// # Safety
    /// No device operation may be writing the buffer concurrently.
    #[inline]
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), self.len)
    }
}

impl Drop for PinnedBuffer {
    fn drop(&mut self) {
        self.pool.release(self.ptr, self.len);
    }
}

// ---------------------------------------------------------------------------
// GPU events
// ---------------------------------------------------------------------------

/// Pool of timing-disabled GPU events.
pub struct EventPool {
    gpu: Arc<dyn GpuRuntime>,
    free: Mutex<Vec<Event>>,
}

impl EventPool {
    pub const DEFAULT_PREALLOC: usize = 4;

    /// Pre-creates `prealloc` events; creation failures at this stage are
    /// not fatal, the pool just starts smaller.
    pub fn new(gpu: Arc<dyn GpuRuntime>, prealloc: usize) -> Arc<Self> {
        let mut events = Vec::with_capacity(prealloc);
        for _ in 0..prealloc {
            if let Ok(event) = gpu.create_event() {
                events.push(event);
            }
        }
        Arc::new(Self {
            gpu,
            free: Mutex::new(events),
        })
    }

    /// Pop a pooled event or create one on underflow.
    pub fn acquire(&self) -> GpuResult<Event> {
        if let Some(event) = self.free.lock().pop() {
            return Ok(event);
        }
        self.gpu.create_event()
    }

    pub fn release(&self, event: Event) {
        self.free.lock().push(event);
    }

    pub fn pooled_count(&self) -> usize {
        self.free.lock().len()
    }
}

impl Drop for EventPool {
    fn drop(&mut self) {
        for event in self.free.get_mut().drain(..) {
            let _ = self.gpu.destroy_event(event);
        }
    }
}
