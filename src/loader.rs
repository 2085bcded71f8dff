//! The residency engine: registry, device context upkeep, the loader
//! pipeline, eviction, and request processing.
//!
//! One mutex guards the registry, dedup maps, host mirrors, dirty
//! intervals, byte accounting, and frame counter. It is held across
//! registration, launch preparation, drain deduplication, eviction, and
//! the publish step of a load — never across decoding, GPU copies, or
//! texture-object creation. The per-texture `loading` atomic serializes
//! loader-pipeline claimants without taking the mutex during I/O.

use std::collections::{HashMap, HashSet};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::context::{flag_word_count, DeviceContext, DirtyInterval, RequestStats};
use crate::error::LoaderError;
use crate::gpu::{
    ArrayHandle, DevicePtr, GpuError, GpuRuntime, MipArrayHandle, Stream, TexResource,
    TextureObject, TextureObjectDesc,
};
use crate::image_source::{FileImageSource, ImageSource};
use crate::metadata::{
    EvictionPriority, LoaderOptions, PixelSource, TexState, TextureDesc, TextureHandle,
    TextureRecord,
};
use crate::mipmap;
use crate::pools::{EventPool, PinnedBufferPool};
use crate::thread_pool::ThreadPool;
use crate::ticket::{AsyncWorker, Ticket};

const MIB: f64 = 1024.0 * 1024.0;

// ---------------------------------------------------------------------------
// Host mirrors
// ---------------------------------------------------------------------------

/// Page-locked host copies of the device-context buffers. Mutated only
/// through the state mutex that owns this struct.
struct HostMirrors {
    flags: NonNull<u32>,
    flag_words: usize,
    textures: NonNull<u64>,
    texture_count: usize,
    requests: NonNull<u32>,
    request_capacity: usize,
    stats: NonNull<RequestStats>,
}

// Exclusively owned pinned allocations, freed once in the destructor.
unsafe impl Send for HostMirrors {}

impl HostMirrors {
    fn flags_mut(&mut self) -> &mut [u32] {
        unsafe { std::slice::from_raw_parts_mut(self.flags.as_ptr(), self.flag_words) }
    }

    fn flags(&self) -> &[u32] {
        unsafe { std::slice::from_raw_parts(self.flags.as_ptr(), self.flag_words) }
    }

    fn textures_mut(&mut self) -> &mut [u64] {
        unsafe { std::slice::from_raw_parts_mut(self.textures.as_ptr(), self.texture_count) }
    }

    fn textures(&self) -> &[u64] {
        unsafe { std::slice::from_raw_parts(self.textures.as_ptr(), self.texture_count) }
    }

    fn requests(&self) -> &[u32] {
        unsafe { std::slice::from_raw_parts(self.requests.as_ptr(), self.request_capacity) }
    }

    fn stats(&self) -> RequestStats {
        unsafe { *self.stats.as_ptr() }
    }
}

// ---------------------------------------------------------------------------
// Loader state
// ---------------------------------------------------------------------------

struct State {
    options: LoaderOptions,
    records: Vec<TextureRecord>,
    next_texture_id: u32,
    current_frame: u32,
    total_memory_usage: usize,
    last_error: LoaderError,
    /// Filename hashes and non-zero source content hashes share this map.
    hash_to_id: HashMap<u64, u32>,
    /// Raw data address of a registered `Arc<dyn ImageSource>`.
    source_ptr_to_id: HashMap<usize, u32>,
    mirrors: HostMirrors,
    flags_dirty: DirtyInterval,
    textures_dirty: DirtyInterval,
}

/// Subsystems that `abort` tears down while the loader stays constructed.
struct Subsystems {
    thread_pool: Arc<ThreadPool>,
    pinned_pool: Arc<PinnedBufferPool>,
    event_pool: Arc<EventPool>,
}

struct Shared {
    gpu: Arc<dyn GpuRuntime>,
    device_context: DeviceContext,
    request_copy_stream: Stream,
    max_textures: u32,
    max_requests: u32,
    state: Mutex<State>,
    /// Lock-free resident/loading flags, one slot per texture ID.
    tex_states: Vec<TexState>,
    subsystems: Mutex<Option<Subsystems>>,

    aborted: AtomicBool,
    destroying: AtomicBool,
    in_flight_async: AtomicUsize,
    async_mutex: Mutex<()>,
    async_cv: Condvar,

    last_request_count: AtomicUsize,
    last_request_overflow: AtomicBool,
}

/// Decrements the in-flight counter and wakes destructor/abort waiters.
struct InFlightGuard {
    shared: Arc<Shared>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.shared.in_flight_async.fetch_sub(1, Ordering::AcqRel);
        let _lock = self.shared.async_mutex.lock();
        self.shared.async_cv.notify_all();
    }
}

// ---------------------------------------------------------------------------
// Public type
// ---------------------------------------------------------------------------

/// Demand-driven texture loader.
///
/// Textures are registered up front but loaded only when a kernel reports
/// sampling them; when the device byte budget is exceeded, the least
/// valuable residents are evicted. See the crate docs for the per-frame
/// protocol.
pub struct DemandTextureLoader {
    shared: Arc<Shared>,
    async_worker: Option<AsyncWorker>,
}

impl DemandTextureLoader {
    /// Construct the loader: dedicated request-copy stream, four device
    /// buffers, four pinned mirrors, worker pool, and the memory/event
    /// pools. Any allocation failure unwinds the earlier allocations and
    /// reports why.
    pub fn new(gpu: Arc<dyn GpuRuntime>, options: LoaderOptions) -> Result<Self, LoaderError> {
        if options.max_textures == 0 || options.max_requests_per_launch == 0 {
            return Err(LoaderError::InvalidParameter);
        }
        let max_textures = options.max_textures;
        let max_requests = options.max_requests_per_launch;
        let flag_words = flag_word_count(max_textures);

        let mut cleanup = ConstructionCleanup::new(Arc::clone(&gpu));

        let request_copy_stream = gpu.create_stream(true).map_err(|_| LoaderError::HipError)?;
        cleanup.stream = Some(request_copy_stream);

        let d_requests = cleanup.device_alloc(max_requests as usize * 4)?;
        let d_textures = cleanup.device_alloc(max_textures as usize * 8)?;
        let d_flags = cleanup.device_alloc(flag_words * 4)?;
        let d_stats = cleanup.device_alloc(std::mem::size_of::<RequestStats>())?;

        for (ptr, len) in [
            (d_requests, max_requests as usize * 4),
            (d_textures, max_textures as usize * 8),
            (d_flags, flag_words * 4),
            (d_stats, std::mem::size_of::<RequestStats>()),
        ] {
            gpu.memset_async(ptr, 0, len, Stream::DEFAULT)
                .and_then(|_| gpu.synchronize_stream(Stream::DEFAULT))
                .map_err(|_| LoaderError::HipError)?;
        }

        let h_flags = cleanup.host_alloc(flag_words * 4)?;
        let h_textures = cleanup.host_alloc(max_textures as usize * 8)?;
        let h_requests = cleanup.host_alloc(max_requests as usize * 4)?;
        let h_stats = cleanup.host_alloc(std::mem::size_of::<RequestStats>())?;

        // Pinned memory is not guaranteed zeroed.
        unsafe {
            std::ptr::write_bytes(h_flags.as_ptr(), 0, flag_words * 4);
            std::ptr::write_bytes(h_textures.as_ptr(), 0, max_textures as usize * 8);
            std::ptr::write_bytes(h_requests.as_ptr(), 0, max_requests as usize * 4);
            std::ptr::write_bytes(h_stats.as_ptr(), 0, std::mem::size_of::<RequestStats>());
        }

        let mirrors = HostMirrors {
            flags: h_flags.cast(),
            flag_words,
            textures: h_textures.cast(),
            texture_count: max_textures as usize,
            requests: h_requests.cast(),
            request_capacity: max_requests as usize,
            stats: h_stats.cast(),
        };

        let device_context = DeviceContext {
            resident_flags: d_flags,
            textures: d_textures,
            requests: d_requests,
            request_count: d_stats,
            request_overflow: d_stats.add(4),
            max_textures,
            max_requests,
        };

        // The first launch must upload the entire (zeroed) state.
        let mut flags_dirty = DirtyInterval::new();
        let mut textures_dirty = DirtyInterval::new();
        flags_dirty.mark_all(flag_words);
        textures_dirty.mark_all(max_textures as usize);

        let mut records = Vec::new();
        records.resize_with(max_textures as usize, TextureRecord::default);
        let mut tex_states = Vec::new();
        tex_states.resize_with(max_textures as usize, TexState::default);

        let thread_pool = Arc::new(ThreadPool::new(options.max_threads));
        debug!(threads = thread_pool.size(), "created decode thread pool");
        let pinned_pool = PinnedBufferPool::new(Arc::clone(&gpu), 4);
        let event_pool = EventPool::new(Arc::clone(&gpu), EventPool::DEFAULT_PREALLOC);

        cleanup.disarm();

        let shared = Arc::new(Shared {
            gpu,
            device_context,
            request_copy_stream,
            max_textures,
            max_requests,
            state: Mutex::new(State {
                options,
                records,
                next_texture_id: 0,
                current_frame: 0,
                total_memory_usage: 0,
                last_error: LoaderError::Success,
                hash_to_id: HashMap::new(),
                source_ptr_to_id: HashMap::new(),
                mirrors,
                flags_dirty,
                textures_dirty,
            }),
            tex_states,
            subsystems: Mutex::new(Some(Subsystems {
                thread_pool,
                pinned_pool,
                event_pool,
            })),
            aborted: AtomicBool::new(false),
            destroying: AtomicBool::new(false),
            in_flight_async: AtomicUsize::new(0),
            async_mutex: Mutex::new(()),
            async_cv: Condvar::new(),
            last_request_count: AtomicUsize::new(0),
            last_request_overflow: AtomicBool::new(false),
        });

        Ok(Self {
            shared,
            async_worker: Some(AsyncWorker::new()),
        })
    }

    // --- registration -----------------------------------------------------

    /// Register a texture by file path. Nothing is decoded until the first
    /// request; only the header is probed for provisional dimensions.
    /// Registering the same path twice returns the existing ID.
    pub fn create_texture(&self, filename: &str, desc: TextureDesc) -> TextureHandle {
        let shared = &self.shared;
        let mut state = shared.state.lock();

        let filename_hash = xxh3_64(filename.as_bytes());
        if let Some(&existing) = state.hash_to_id.get(&filename_hash) {
            let record = &state.records[existing as usize];
            if matches!(&record.source, PixelSource::File(f) if f == filename) {
                debug!(id = existing, filename, "reusing registered texture");
                return handle_for(existing, record);
            }
        }

        let Some(id) = allocate_id(&mut state, shared) else {
            error!(filename, max = shared.max_textures, "texture ID space exhausted");
            return TextureHandle::invalid(LoaderError::MaxTexturesExceeded);
        };
        state.hash_to_id.insert(filename_hash, id);

        let record = &mut state.records[id as usize];
        record.source = PixelSource::File(filename.to_owned());
        record.desc = desc;

        // Probe metadata: full reader first, plain decode as fallback.
        let probe = FileImageSource::new(filename);
        match probe.open() {
            Ok(info) => {
                record.width = info.width;
                record.height = info.height;
                record.channels = info.num_channels;
            }
            Err(err) => match image::open(filename) {
                Ok(img) => {
                    record.width = img.width();
                    record.height = img.height();
                    record.channels = img.color().channel_count() as u32;
                }
                Err(_) => {
                    record.last_error = LoaderError::FileNotFound;
                    warn!(filename, %err, "could not probe image header");
                }
            },
        }

        state.last_error = LoaderError::Success;
        let record = &state.records[id as usize];
        debug!(
            id,
            filename,
            width = record.width,
            height = record.height,
            channels = record.channels,
            "registered file texture"
        );
        handle_for(id, record)
    }

    /// Register a texture backed by a caller-supplied [`ImageSource`].
    /// Deduplicates by source identity and, when the source reports a
    /// non-zero content hash, by content.
    pub fn create_texture_from_source(
        &self,
        source: Arc<dyn ImageSource>,
        desc: TextureDesc,
    ) -> TextureHandle {
        let shared = &self.shared;
        let mut state = shared.state.lock();

        let source_key = Arc::as_ptr(&source) as *const u8 as usize;
        if let Some(&existing) = state.source_ptr_to_id.get(&source_key) {
            debug!(id = existing, "reusing texture for known image source");
            return handle_for(existing, &state.records[existing as usize]);
        }

        let content_hash = source.content_hash();
        if content_hash != 0 {
            if let Some(&existing) = state.hash_to_id.get(&content_hash) {
                // remember the pointer for cheaper future lookups
                state.source_ptr_to_id.insert(source_key, existing);
                debug!(id = existing, "content hash matched an existing texture");
                return handle_for(existing, &state.records[existing as usize]);
            }
        }

        let Some(id) = allocate_id(&mut state, shared) else {
            error!(max = shared.max_textures, "texture ID space exhausted");
            return TextureHandle::invalid(LoaderError::MaxTexturesExceeded);
        };
        state.source_ptr_to_id.insert(source_key, id);
        if content_hash != 0 {
            state.hash_to_id.insert(content_hash, id);
        }

        let record = &mut state.records[id as usize];
        record.desc = desc;
        match source.open() {
            Ok(info) => {
                record.width = info.width;
                record.height = info.height;
                record.channels = info.num_channels;
            }
            Err(err) => {
                record.last_error = LoaderError::ImageLoadFailed;
                warn!(id, %err, "image source failed to open");
            }
        }
        record.source = PixelSource::Reader(source);

        state.last_error = LoaderError::Success;
        let record = &state.records[id as usize];
        debug!(
            id,
            width = record.width,
            height = record.height,
            channels = record.channels,
            "registered image-source texture"
        );
        handle_for(id, record)
    }

    /// Register a texture from caller pixels (1, 3, or 4 channels). The
    /// pixels are copied; dimensions are authoritative.
    pub fn create_texture_from_memory(
        &self,
        pixels: &[u8],
        width: u32,
        height: u32,
        channels: u32,
        desc: TextureDesc,
    ) -> TextureHandle {
        let shared = &self.shared;
        let mut state = shared.state.lock();

        let expected = width as usize * height as usize * channels as usize;
        if width == 0 || height == 0 || channels == 0 || pixels.len() < expected {
            state.last_error = LoaderError::InvalidParameter;
            error!(width, height, channels, len = pixels.len(), "rejected memory texture");
            return TextureHandle::invalid(LoaderError::InvalidParameter);
        }

        let Some(id) = allocate_id(&mut state, shared) else {
            error!(max = shared.max_textures, "texture ID space exhausted");
            return TextureHandle::invalid(LoaderError::MaxTexturesExceeded);
        };

        let record = &mut state.records[id as usize];
        record.source = PixelSource::Memory {
            pixels: Arc::from(&pixels[..expected]),
            width,
            height,
            channels,
        };
        record.desc = desc;
        record.width = width;
        record.height = height;
        record.channels = channels;

        state.last_error = LoaderError::Success;
        debug!(id, width, height, channels, "registered memory texture");
        TextureHandle {
            id,
            valid: true,
            width,
            height,
            channels,
            error: LoaderError::Success,
        }
    }

    // --- per-frame protocol ----------------------------------------------

    /// Upload the dirty slices of the resident bitmap and texture table,
    /// reset the request counters, and advance the frame. On a runtime
    /// failure the dirty intervals are left intact so the next frame
    /// retries the upload.
    pub fn launch_prepare(&self, stream: Stream) {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        let ctx = shared.device_context;

        if let Some((begin, count)) = state.flags_dirty.range() {
            debug!(words = count, kib = (count * 4) as f64 / 1024.0, "uploading dirty flag words");
            let src = state.mirrors.flags()[begin..].as_ptr();
            if let Err(err) = unsafe {
                shared.gpu.memcpy_htod_async(
                    ctx.resident_flags.add(begin as u64 * 4),
                    src as *const u8,
                    count * 4,
                    stream,
                )
            } {
                state.last_error = LoaderError::HipError;
                error!(?err, "resident-flag upload failed");
                return;
            }
        }

        if let Some((begin, count)) = state.textures_dirty.range() {
            debug!(entries = count, kib = (count * 8) as f64 / 1024.0, "uploading dirty texture entries");
            let src = state.mirrors.textures()[begin..].as_ptr();
            if let Err(err) = unsafe {
                shared.gpu.memcpy_htod_async(
                    ctx.textures.add(begin as u64 * 8),
                    src as *const u8,
                    count * 8,
                    stream,
                )
            } {
                state.last_error = LoaderError::HipError;
                error!(?err, "texture-table upload failed");
                return;
            }
        }

        state.flags_dirty.clear();
        state.textures_dirty.clear();

        if let Err(err) = shared.gpu.memset_async(
            ctx.request_count,
            0,
            std::mem::size_of::<RequestStats>(),
            stream,
        ) {
            state.last_error = LoaderError::HipError;
            error!(?err, "request-counter reset failed");
            return;
        }

        state.current_frame += 1;
        debug!(frame = state.current_frame, "launch prepared");
    }

    /// The context to pass (by value) to sampling kernels.
    pub fn device_context(&self) -> DeviceContext {
        self.shared.device_context
    }

    /// Drain the request ring synchronously on `stream` and load every
    /// missed texture. Returns the number of textures loaded.
    pub fn process_requests(&self, stream: Stream, ctx: &DeviceContext) -> usize {
        let shared = &self.shared;
        if shared.aborted.load(Ordering::Acquire) {
            return 0;
        }

        let copy_count = shared.max_requests.min(ctx.max_requests) as usize;
        let (requests_ptr, stats_ptr) = {
            let state = shared.state.lock();
            (state.mirrors.requests, state.mirrors.stats)
        };

        let copied = unsafe {
            shared
                .gpu
                .memcpy_dtoh_async(stats_ptr.as_ptr() as *mut u8, ctx.request_count, 4, stream)
                .and_then(|_| {
                    shared.gpu.memcpy_dtoh_async(
                        (stats_ptr.as_ptr() as *mut u8).add(4),
                        ctx.request_overflow,
                        4,
                        stream,
                    )
                })
                .and_then(|_| {
                    shared.gpu.memcpy_dtoh_async(
                        requests_ptr.as_ptr() as *mut u8,
                        ctx.requests,
                        copy_count * 4,
                        stream,
                    )
                })
                .and_then(|_| shared.gpu.synchronize_stream(stream))
        };
        if let Err(err) = copied {
            shared.state.lock().last_error = LoaderError::HipError;
            error!(?err, "request readback failed");
            return 0;
        }

        let stats = {
            let state = shared.state.lock();
            state.mirrors.stats()
        };
        shared.publish_request_stats(stats);
        if stats.count == 0 {
            return 0;
        }

        let count = (stats.count as usize).min(copy_count);
        let ids: Vec<u32> = {
            let state = shared.state.lock();
            state.mirrors.requests()[..count].to_vec()
        };
        Shared::drain_and_load(shared, &ids)
    }

    /// Drain the request ring asynchronously: device copies overlap host
    /// work through a dedicated copy stream, and the host-side drain runs
    /// on the serialized worker. The returned ticket observes completion
    /// and can chain further GPU work via `wait(Some(event))`.
    pub fn process_requests_async(&self, stream: Stream, ctx: &DeviceContext) -> Ticket {
        let shared = &self.shared;

        // Counter first, then re-check the flags: pairs with the seq-cst
        // store + wait in `Drop`/`abort` so no task can slip past teardown.
        shared.in_flight_async.fetch_add(1, Ordering::SeqCst);
        let guard = InFlightGuard {
            shared: Arc::clone(shared),
        };

        if shared.destroying.load(Ordering::SeqCst) || shared.aborted.load(Ordering::Acquire) {
            return Ticket::default();
        }

        let (pinned_pool, event_pool) = {
            let subsystems = shared.subsystems.lock();
            match subsystems.as_ref() {
                Some(s) => (Arc::clone(&s.pinned_pool), Arc::clone(&s.event_pool)),
                None => return Ticket::default(),
            }
        };

        let copy_count = shared.max_requests.min(ctx.max_requests) as usize;
        let stats_len = std::mem::size_of::<RequestStats>();
        let (stats_buf, requests_buf) = match (
            pinned_pool.acquire(stats_len),
            pinned_pool.acquire(shared.max_requests as usize * 4),
        ) {
            (Ok(s), Ok(r)) => (s, r),
            _ => {
                shared.state.lock().last_error = LoaderError::OutOfMemory;
                return Ticket::default();
            }
        };
        unsafe { std::ptr::write_bytes(stats_buf.as_ptr(), 0, stats_len) };

        let deps_ready = match event_pool.acquire() {
            Ok(e) => e,
            Err(_) => {
                shared.state.lock().last_error = LoaderError::HipError;
                return Ticket::default();
            }
        };
        // Captures all prior work on the caller's stream, including the
        // kernel that wrote the ring.
        if shared.gpu.record_event(deps_ready, stream).is_err() {
            event_pool.release(deps_ready);
            shared.state.lock().last_error = LoaderError::HipError;
            return Ticket::default();
        }

        let copy_stream = shared.request_copy_stream;
        if shared.gpu.stream_wait_event(copy_stream, deps_ready).is_err() {
            event_pool.release(deps_ready);
            shared.state.lock().last_error = LoaderError::HipError;
            return Ticket::default();
        }

        let copied = unsafe {
            shared
                .gpu
                .memcpy_dtoh_async(stats_buf.as_ptr(), ctx.request_count, 4, copy_stream)
                .and_then(|_| {
                    shared.gpu.memcpy_dtoh_async(
                        stats_buf.as_ptr().add(4),
                        ctx.request_overflow,
                        4,
                        copy_stream,
                    )
                })
                .and_then(|_| {
                    shared.gpu.memcpy_dtoh_async(
                        requests_buf.as_ptr(),
                        ctx.requests,
                        copy_count * 4,
                        copy_stream,
                    )
                })
        };
        if copied.is_err() {
            event_pool.release(deps_ready);
            shared.state.lock().last_error = LoaderError::HipError;
            return Ticket::default();
        }

        let copy_done = match event_pool.acquire() {
            Ok(e) => e,
            Err(_) => {
                event_pool.release(deps_ready);
                shared.state.lock().last_error = LoaderError::HipError;
                return Ticket::default();
            }
        };
        if shared.gpu.record_event(copy_done, copy_stream).is_err() {
            event_pool.release(copy_done);
            event_pool.release(deps_ready);
            shared.state.lock().last_error = LoaderError::HipError;
            return Ticket::default();
        }

        // The task owns the in-flight decrement from here on.
        let task_shared = Arc::clone(shared);
        let task_guard = guard; // moved into the closure below
        let worker = self
            .async_worker
            .as_ref()
            .expect("async worker alive while loader exists");
        worker.submit(Arc::clone(&shared.gpu), stream, move || {
            let _guard = task_guard;
            let shared = task_shared;

            if let Err(err) = shared.gpu.synchronize_event(copy_done) {
                warn!(?err, "copy-done synchronization failed");
            }
            event_pool.release(copy_done);
            event_pool.release(deps_ready);

            if shared.destroying.load(Ordering::Acquire) {
                return;
            }

            let stats = unsafe { *(stats_buf.as_ptr() as *const RequestStats) };
            shared.publish_request_stats(stats);
            if stats.count == 0 {
                return;
            }

            let count = (stats.count as usize).min(copy_count);
            let ids = unsafe {
                std::slice::from_raw_parts(requests_buf.as_ptr() as *const u32, count).to_vec()
            };
            Shared::drain_and_load(&shared, &ids);
            // stats_buf / requests_buf return to the pool as they drop
        })
    }

    // --- statistics -------------------------------------------------------

    pub fn resident_texture_count(&self) -> usize {
        let state = self.shared.state.lock();
        (0..state.next_texture_id as usize)
            .filter(|&i| self.shared.tex_states[i].resident.load(Ordering::Relaxed))
            .count()
    }

    pub fn total_texture_memory(&self) -> usize {
        self.shared.state.lock().total_memory_usage
    }

    /// Miss count reported by the most recent drain (pre-dedup, including
    /// appends dropped by ring overflow).
    pub fn request_count(&self) -> usize {
        self.shared.last_request_count.load(Ordering::Acquire)
    }

    /// Whether the most recent drain saw the ring overflow. Recover by
    /// raising `max_requests_per_launch`.
    pub fn had_request_overflow(&self) -> bool {
        self.shared.last_request_overflow.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> LoaderError {
        self.shared.state.lock().last_error
    }

    /// Status of the most recent load attempt for one texture.
    /// I/O and GPU failures land here; the texture stays registered and is
    /// retried on its next request.
    pub fn texture_error(&self, id: u32) -> LoaderError {
        let state = self.shared.state.lock();
        if id < state.next_texture_id {
            state.records[id as usize].last_error
        } else {
            LoaderError::InvalidTextureId
        }
    }

    // --- eviction knobs ---------------------------------------------------

    pub fn enable_eviction(&self, enable: bool) {
        self.shared.state.lock().options.enable_eviction = enable;
    }

    pub fn set_max_texture_memory(&self, bytes: usize) {
        self.shared.state.lock().options.max_texture_memory = bytes;
    }

    pub fn max_texture_memory(&self) -> usize {
        self.shared.state.lock().options.max_texture_memory
    }

    pub fn update_eviction_priority(&self, id: u32, priority: EvictionPriority) {
        let mut state = self.shared.state.lock();
        if id < state.next_texture_id {
            state.records[id as usize].desc.eviction_priority = priority;
        } else {
            state.last_error = LoaderError::InvalidTextureId;
        }
    }

    // --- unload / lifecycle ----------------------------------------------

    pub fn unload_texture(&self, id: u32) {
        let mut state = self.shared.state.lock();
        if id < state.next_texture_id {
            self.shared.destroy_texture_locked(&mut state, id);
        } else {
            state.last_error = LoaderError::InvalidTextureId;
        }
    }

    pub fn unload_all(&self) {
        let mut state = self.shared.state.lock();
        for id in 0..state.next_texture_id {
            self.shared.destroy_texture_locked(&mut state, id);
        }
    }

    /// Sticky global cancellation: waits for in-flight async work, tears
    /// down the pools, and unloads every texture. The loader remains
    /// constructed but refuses further request processing.
    pub fn abort(&self) {
        let shared = &self.shared;
        shared.aborted.store(true, Ordering::SeqCst);
        info!("abort: halting texture streaming");

        shared.wait_async_quiescence();
        // Let in-progress loads drain before unloading what they publish.
        if let Some(subsystems) = shared.subsystems.lock().take() {
            subsystems.thread_pool.wait_all();
        }

        let mut state = shared.state.lock();
        for id in 0..state.next_texture_id {
            shared.destroy_texture_locked(&mut state, id);
        }
        drop(state);
        info!("abort: completed");
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.aborted.load(Ordering::Acquire)
    }
}

impl Drop for DemandTextureLoader {
    fn drop(&mut self) {
        let shared = &self.shared;

        // No async task observes `destroying == false` after this store,
        // and the wait below covers every task that already incremented.
        shared.destroying.store(true, Ordering::SeqCst);
        shared.wait_async_quiescence();

        // Join the serialized worker, then the decode pool and memory
        // pools, then the copy stream.
        self.async_worker = None;
        *shared.subsystems.lock() = None;
        let _ = shared.gpu.destroy_stream(shared.request_copy_stream);

        let mut state = shared.state.lock();
        for id in 0..state.next_texture_id {
            shared.destroy_texture_locked(&mut state, id);
        }

        unsafe {
            let m = &state.mirrors;
            shared.gpu.host_free(m.flags.cast(), m.flag_words * 4);
            shared.gpu.host_free(m.textures.cast(), m.texture_count * 8);
            shared.gpu.host_free(m.requests.cast(), m.request_capacity * 4);
            shared
                .gpu
                .host_free(m.stats.cast(), std::mem::size_of::<RequestStats>());
        }
        drop(state);

        let ctx = shared.device_context;
        let _ = shared.gpu.device_free(ctx.resident_flags);
        let _ = shared.gpu.device_free(ctx.textures);
        let _ = shared.gpu.device_free(ctx.requests);
        let _ = shared.gpu.device_free(ctx.request_count);
    }
}

// ---------------------------------------------------------------------------
// Engine internals
// ---------------------------------------------------------------------------

impl Shared {
    fn publish_request_stats(&self, stats: RequestStats) {
        self.last_request_overflow
            .store(stats.overflow != 0, Ordering::Release);
        self.last_request_count
            .store(stats.count as usize, Ordering::Release);
        if stats.overflow != 0 {
            warn!(
                count = stats.count,
                capacity = self.max_requests,
                "request ring overflowed; raise max_requests_per_launch"
            );
        } else {
            debug!(count = stats.count, "drained request ring");
        }
    }

    /// Deduplicate the drained IDs, make room, and load — in parallel when
    /// there is more than one texture to fetch.
    fn drain_and_load(this: &Arc<Shared>, requests: &[u32]) -> usize {
        let mut to_load: Vec<u32> = Vec::new();
        {
            let mut state = this.state.lock();
            let mut unique: HashSet<u32> = HashSet::new();
            let mut estimate = 0usize;
            for &id in requests {
                if id < state.next_texture_id
                    && !this.tex_states[id as usize].resident.load(Ordering::Relaxed)
                    && unique.insert(id)
                {
                    to_load.push(id);
                    estimate += estimated_load_bytes(&state.records[id as usize]);
                }
            }
            debug!(
                unique = to_load.len(),
                estimate_mib = estimate as f64 / MIB,
                "deduplicated miss set"
            );
            if state.options.enable_eviction && state.options.max_texture_memory > 0 && estimate > 0
            {
                this.evict_if_needed(&mut state, estimate);
            }
        }

        let thread_pool = this
            .subsystems
            .lock()
            .as_ref()
            .map(|s| Arc::clone(&s.thread_pool));

        let loaded = Arc::new(AtomicUsize::new(0));
        match thread_pool {
            Some(pool) if to_load.len() > 1 => {
                for id in to_load {
                    let shared = Arc::clone(this);
                    let loaded = Arc::clone(&loaded);
                    pool.submit(move || {
                        if shared.load_texture(id) {
                            loaded.fetch_add(1, Ordering::Relaxed);
                        }
                    });
                }
                pool.wait_all();
            }
            _ => {
                for id in to_load {
                    if this.load_texture(id) {
                        loaded.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        loaded.load(Ordering::Relaxed)
    }

    /// The loader pipeline: claim, snapshot, decode outside the lock,
    /// allocate + upload, create the texture object, publish.
    fn load_texture(&self, id: u32) -> bool {
        if self.aborted.load(Ordering::Acquire) {
            return false;
        }

        let st = &self.tex_states[id as usize];
        if st.resident.load(Ordering::Acquire) || st.loading.load(Ordering::Acquire) {
            return false;
        }
        // Claim; a lost race means another worker owns this load.
        if st
            .loading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let (desc, source) = {
            let state = self.state.lock();
            if st.resident.load(Ordering::Acquire) {
                st.loading.store(false, Ordering::Release);
                return false;
            }
            let record = &state.records[id as usize];
            (record.desc, record.source.clone())
        };

        let decoded = match &source {
            PixelSource::Reader(reader) => decode_reader(reader.as_ref()),
            PixelSource::File(path) => decode_file(path),
            PixelSource::Memory {
                pixels,
                width,
                height,
                channels,
            } => mipmap::expand_to_rgba8(pixels, *width, *height, *channels)
                .map(|rgba| (rgba, *width, *height))
                .ok_or_else(|| anyhow::anyhow!("unsupported channel count {channels}")),
            PixelSource::None => {
                self.fail_load(id, LoaderError::InvalidParameter);
                error!(id, "texture has no pixel source");
                return false;
            }
        };

        let (rgba, width, height) = match decoded {
            Ok(d) => d,
            Err(err) => {
                self.fail_load(id, LoaderError::ImageLoadFailed);
                error!(id, %err, "decode failed");
                return false;
            }
        };

        let use_mipmaps = desc.generate_mipmaps && (width > 1 || height > 1);
        let uploaded = if use_mipmaps {
            let mut levels = mipmap::mip_level_count(width, height);
            if desc.max_mip_level > 0 {
                levels = levels.min(desc.max_mip_level);
            }
            self.upload_mipmapped(id, &desc, &rgba, width, height, levels)
        } else {
            self.upload_flat(id, &desc, &rgba, width, height)
        };

        let (tex_obj, resource, memory_usage, num_levels) = match uploaded {
            Ok(r) => r,
            Err(err) => {
                self.fail_load(id, err);
                return false;
            }
        };

        // Publish under the lock.
        let mut state = self.state.lock();
        {
            let record = &mut state.records[id as usize];
            record.width = width;
            record.height = height;
            record.channels = 4;
            record.tex_obj = tex_obj;
            match resource {
                TexResource::Array(a) => record.array = Some(a),
                TexResource::Mipmapped(m) => record.mip_array = Some(m),
            }
            record.num_mip_levels = num_levels;
            record.memory_usage = memory_usage;
        }
        state.mirrors.textures_mut()[id as usize] = tex_obj.0;
        let word = (id / 32) as usize;
        state.mirrors.flags_mut()[word] |= 1 << (id % 32);
        state.textures_dirty.mark(id as usize);
        state.flags_dirty.mark(word);
        st.resident.store(true, Ordering::Release);
        st.loading.store(false, Ordering::Release);
        let frame = state.current_frame;
        {
            let record = &mut state.records[id as usize];
            record.last_used_frame = frame;
            record.loaded_frame = frame;
            record.last_error = LoaderError::Success;
        }
        state.total_memory_usage += memory_usage;
        info!(
            id,
            width,
            height,
            levels = num_levels,
            mib = memory_usage as f64 / MIB,
            total_mib = state.total_memory_usage as f64 / MIB,
            "texture resident"
        );
        true
    }

    fn upload_flat(
        &self,
        id: u32,
        desc: &TextureDesc,
        rgba: &[u8],
        width: u32,
        height: u32,
    ) -> Result<(TextureObject, TexResource, usize, u32), LoaderError> {
        let array = self
            .gpu
            .alloc_array(width, height)
            .map_err(|_| LoaderError::OutOfMemory)?;
        let teardown = |gpu: &dyn GpuRuntime, array: ArrayHandle| {
            let _ = gpu.free_array(array);
        };

        if let Err(err) =
            unsafe { self.gpu.upload_array(array, rgba.as_ptr(), width as usize * 4, height as usize) }
        {
            teardown(self.gpu.as_ref(), array);
            error!(id, ?err, "base level upload failed");
            return Err(LoaderError::HipError);
        }

        match self
            .gpu
            .create_texture_object(TexResource::Array(array), &texture_object_desc(desc, None))
        {
            Ok(tex) => Ok((
                tex,
                TexResource::Array(array),
                width as usize * height as usize * 4,
                1,
            )),
            Err(err) => {
                teardown(self.gpu.as_ref(), array);
                error!(id, ?err, "texture object creation failed");
                Err(LoaderError::HipError)
            }
        }
    }

    fn upload_mipmapped(
        &self,
        id: u32,
        desc: &TextureDesc,
        base: &[u8],
        width: u32,
        height: u32,
        levels: u32,
    ) -> Result<(TextureObject, TexResource, usize, u32), LoaderError> {
        let mip = self
            .gpu
            .alloc_mipmapped_array(width, height, levels)
            .map_err(|_| LoaderError::OutOfMemory)?;
        let teardown = |gpu: &dyn GpuRuntime, mip: MipArrayHandle| {
            let _ = gpu.free_mipmapped_array(mip);
        };

        if let Err(err) = self.upload_mip_chain(mip, base, width, height, levels) {
            teardown(self.gpu.as_ref(), mip);
            error!(id, ?err, "mip chain upload failed");
            return Err(LoaderError::HipError);
        }

        let tex_desc = texture_object_desc(desc, Some(levels));
        match self
            .gpu
            .create_texture_object(TexResource::Mipmapped(mip), &tex_desc)
        {
            Ok(tex) => Ok((
                tex,
                TexResource::Mipmapped(mip),
                mipmap::mip_chain_bytes(width, height, 4),
                levels,
            )),
            Err(err) => {
                teardown(self.gpu.as_ref(), mip);
                error!(id, ?err, "texture object creation failed");
                Err(LoaderError::HipError)
            }
        }
    }

    /// Upload the base level, then box-filter each successive level on the
    /// host and upload it.
    fn upload_mip_chain(
        &self,
        mip: MipArrayHandle,
        base: &[u8],
        width: u32,
        height: u32,
        levels: u32,
    ) -> Result<(), GpuError> {
        let level0 = self.gpu.mip_level_array(mip, 0)?;
        unsafe {
            self.gpu
                .upload_array(level0, base.as_ptr(), width as usize * 4, height as usize)?
        };

        let mut current = base.to_vec();
        let (mut w, mut h) = (width, height);
        for level in 1..levels {
            let (nw, nh) = ((w / 2).max(1), (h / 2).max(1));
            let mut next = vec![0u8; nw as usize * nh as usize * 4];
            mipmap::downsample_box(&current, w, h, &mut next, nw, nh, 4);

            let level_array = self.gpu.mip_level_array(mip, level)?;
            unsafe {
                self.gpu
                    .upload_array(level_array, next.as_ptr(), nw as usize * 4, nh as usize)?
            };

            current = next;
            (w, h) = (nw, nh);
        }
        Ok(())
    }

    /// Clear the claim and record the failure.
    fn fail_load(&self, id: u32, err: LoaderError) {
        let mut state = self.state.lock();
        self.tex_states[id as usize]
            .loading
            .store(false, Ordering::Release);
        state.records[id as usize].last_error = err;
    }

    /// Release one texture's GPU resources and clear its device-visible
    /// entries. Idempotent; requires the state lock.
    fn destroy_texture_locked(&self, state: &mut State, id: u32) {
        let st = &self.tex_states[id as usize];
        if !st.resident.load(Ordering::Acquire) {
            return;
        }

        let record = &mut state.records[id as usize];
        let tex_obj = std::mem::replace(&mut record.tex_obj, TextureObject::NULL);
        let mip = record.mip_array.take();
        let array = record.array.take();
        let levels = std::mem::take(&mut record.num_mip_levels);
        let freed = std::mem::take(&mut record.memory_usage);

        if !tex_obj.is_null() && self.gpu.destroy_texture_object(tex_obj).is_err() {
            state.last_error = LoaderError::HipError;
        }
        if let Some(mip) = mip {
            if self.gpu.free_mipmapped_array(mip).is_err() {
                state.last_error = LoaderError::HipError;
            }
        }
        if let Some(array) = array {
            if self.gpu.free_array(array).is_err() {
                state.last_error = LoaderError::HipError;
            }
        }

        st.resident.store(false, Ordering::Release);

        state.mirrors.textures_mut()[id as usize] = 0;
        let word = (id / 32) as usize;
        state.mirrors.flags_mut()[word] &= !(1 << (id % 32));
        state.textures_dirty.mark(id as usize);
        state.flags_dirty.mark(word);

        state.total_memory_usage -= freed;
        debug!(id, levels, freed_mib = freed as f64 / MIB, "texture unloaded");
    }

    /// Free the least valuable residents until `required` more bytes fit
    /// under the budget. Candidates are ordered by (priority bucket,
    /// last-used frame, ID); KeepResident and recently loaded textures are
    /// exempt. A request larger than the whole budget empties every
    /// eligible resident and the load still proceeds.
    fn evict_if_needed(&self, state: &mut State, required: usize) {
        let budget = state.options.max_texture_memory;
        if budget == 0 {
            return;
        }
        if state.total_memory_usage + required <= budget {
            return;
        }
        debug!(
            current_mib = state.total_memory_usage as f64 / MIB,
            required_mib = required as f64 / MIB,
            budget_mib = budget as f64 / MIB,
            "memory budget pressure"
        );

        let mut candidates: Vec<(u32, u32, u32)> = Vec::new();
        for id in 0..state.next_texture_id {
            if !self.tex_states[id as usize].resident.load(Ordering::Relaxed) {
                continue;
            }
            let record = &state.records[id as usize];
            if record.desc.eviction_priority == EvictionPriority::KeepResident {
                continue;
            }
            let frames_resident = state.current_frame - record.loaded_frame;
            if frames_resident < state.options.min_resident_frames {
                debug!(id, frames_resident, "thrash guard skipped eviction candidate");
                continue;
            }
            candidates.push((record.desc.eviction_priority.bucket(), record.last_used_frame, id));
        }
        candidates.sort_unstable();

        let target = budget.saturating_sub(required);
        for (bucket, last_used, id) in candidates {
            if state.total_memory_usage <= target {
                break;
            }
            debug!(id, bucket, last_used, "evicting texture");
            self.destroy_texture_locked(state, id);
        }
    }

    fn wait_async_quiescence(&self) {
        let mut guard = self.async_mutex.lock();
        while self.in_flight_async.load(Ordering::Acquire) != 0 {
            self.async_cv.wait(&mut guard);
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn allocate_id(state: &mut State, shared: &Shared) -> Option<u32> {
    if state.next_texture_id >= shared.max_textures {
        state.last_error = LoaderError::MaxTexturesExceeded;
        return None;
    }
    let id = state.next_texture_id;
    state.next_texture_id += 1;
    Some(id)
}

fn handle_for(id: u32, record: &TextureRecord) -> TextureHandle {
    TextureHandle {
        id,
        valid: true,
        width: record.width,
        height: record.height,
        channels: record.channels,
        error: LoaderError::Success,
    }
}

fn texture_object_desc(desc: &TextureDesc, levels: Option<u32>) -> TextureObjectDesc {
    TextureObjectDesc {
        address_mode: desc.address_mode,
        filter_mode: desc.filter_mode,
        mipmap_filter_mode: desc.mipmap_filter_mode,
        normalized_coords: desc.normalized_coords,
        srgb: desc.srgb,
        mip_level_clamp: levels.map(|n| (0.0, (n - 1) as f32)),
    }
}

/// Budget estimate for one pending load: flat base bytes unless the record
/// will carry a full mip chain.
fn estimated_load_bytes(record: &TextureRecord) -> usize {
    let (w, h) = (record.width, record.height);
    if w == 0 || h == 0 {
        return 0;
    }
    if record.desc.generate_mipmaps && (w > 1 || h > 1) {
        mipmap::mip_chain_bytes(w, h, 4)
    } else {
        w as usize * h as usize * 4
    }
}

/// Decode the base level from a user-supplied source, expanding to RGBA8.
fn decode_reader(reader: &dyn ImageSource) -> anyhow::Result<(Vec<u8>, u32, u32)> {
    let info = if reader.is_open() {
        reader.info()
    } else {
        reader.open()?
    };
    let (w, h, ch) = (info.width, info.height, info.num_channels);
    if ch == 4 {
        let mut rgba = vec![0u8; w as usize * h as usize * 4];
        reader.read_mip_level(&mut rgba, 0, w, h)?;
        Ok((rgba, w, h))
    } else {
        let mut native = vec![0u8; w as usize * h as usize * ch as usize];
        reader.read_mip_level(&mut native, 0, w, h)?;
        let rgba = mipmap::expand_to_rgba8(&native, w, h, ch)
            .ok_or_else(|| anyhow::anyhow!("unsupported channel count {ch}"))?;
        Ok((rgba, w, h))
    }
}

/// Decode a file: the full reader first, plain decode as fallback.
fn decode_file(path: &str) -> anyhow::Result<(Vec<u8>, u32, u32)> {
    let reader = FileImageSource::new(path);
    let preferred = reader.open().and_then(|info| {
        let mut rgba = vec![0u8; info.width as usize * info.height as usize * 4];
        reader.read_mip_level(&mut rgba, 0, info.width, info.height)?;
        Ok((rgba, info.width, info.height))
    });
    match preferred {
        Ok(decoded) => Ok(decoded),
        Err(first_err) => {
            let img = image::open(path).map_err(|e| anyhow::anyhow!("{first_err}; fallback: {e}"))?;
            let rgba = img.to_rgba8();
            let (w, h) = (rgba.width(), rgba.height());
            Ok((rgba.into_raw(), w, h))
        }
    }
}

// ---------------------------------------------------------------------------
// Construction cleanup
// ---------------------------------------------------------------------------

/// Frees partially constructed resources in reverse order unless disarmed.
struct ConstructionCleanup {
    gpu: Arc<dyn GpuRuntime>,
    stream: Option<Stream>,
    device: Vec<DevicePtr>,
    hosts: Vec<(NonNull<u8>, usize)>,
    armed: bool,
}

impl ConstructionCleanup {
    fn new(gpu: Arc<dyn GpuRuntime>) -> Self {
        Self {
            gpu,
            stream: None,
            device: Vec::new(),
            hosts: Vec::new(),
            armed: true,
        }
    }

    fn device_alloc(&mut self, len: usize) -> Result<DevicePtr, LoaderError> {
        let ptr = self
            .gpu
            .device_alloc(len)
            .map_err(|_| LoaderError::OutOfMemory)?;
        self.device.push(ptr);
        Ok(ptr)
    }

    fn host_alloc(&mut self, len: usize) -> Result<NonNull<u8>, LoaderError> {
        let ptr = self
            .gpu
            .host_alloc(len)
            .map_err(|_| LoaderError::OutOfMemory)?;
        self.hosts.push((ptr, len));
        Ok(ptr)
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ConstructionCleanup {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for (ptr, len) in self.hosts.drain(..).rev() {
            unsafe { self.gpu.host_free(ptr, len) };
        }
        for ptr in self.device.drain(..).rev() {
            let _ = self.gpu.device_free(ptr);
        }
        if let Some(stream) = self.stream.take() {
            let _ = self.gpu.destroy_stream(stream);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::mock::MockGpu;
    use crate::image_source::RawImageSource;
    use crate::sampling::{self, Sample};

    const STREAM: Stream = Stream::DEFAULT;

    fn mock() -> Arc<MockGpu> {
        Arc::new(MockGpu::new())
    }

    fn loader_with(gpu: &Arc<MockGpu>, options: LoaderOptions) -> DemandTextureLoader {
        let runtime: Arc<dyn GpuRuntime> = gpu.clone();
        DemandTextureLoader::new(runtime, options).expect("loader construction")
    }

    fn small_options() -> LoaderOptions {
        LoaderOptions {
            max_textures: 64,
            max_requests_per_launch: 256,
            ..LoaderOptions::default()
        }
    }

    fn no_mips() -> TextureDesc {
        TextureDesc {
            generate_mipmaps: false,
            ..TextureDesc::default()
        }
    }

    fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Vec<u8> {
        let mut out = Vec::with_capacity((width * height * 4) as usize);
        for _ in 0..width * height {
            out.extend_from_slice(&rgba);
        }
        out
    }

    /// Simulated kernel pass: sample each ID once against the context.
    fn run_kernel(ctx: &DeviceContext, ids: &[u32]) {
        for &id in ids {
            unsafe { sampling::sample_or_request(ctx, id) };
        }
    }

    /// Resident set as the device bitmap reports it (call after
    /// `launch_prepare` so the mirror has been uploaded).
    fn device_resident_ids(ctx: &DeviceContext) -> Vec<u32> {
        (0..ctx.max_textures)
            .filter(|&id| unsafe { sampling::is_texture_resident(ctx, id) })
            .collect()
    }

    // --- construction and registration -----------------------------------

    #[test]
    fn default_construction() {
        let gpu = mock();
        let loader = loader_with(&gpu, small_options());
        assert_eq!(loader.last_error(), LoaderError::Success);
        assert_eq!(loader.resident_texture_count(), 0);
        assert_eq!(loader.total_texture_memory(), 0);
        assert_eq!(loader.request_count(), 0);
        assert!(!loader.had_request_overflow());
        assert!(!loader.is_aborted());
    }

    #[test]
    fn rejects_zero_sized_id_space() {
        let gpu = mock();
        let runtime: Arc<dyn GpuRuntime> = gpu.clone();
        let err = DemandTextureLoader::new(
            runtime,
            LoaderOptions {
                max_textures: 0,
                ..LoaderOptions::default()
            },
        )
        .err();
        assert_eq!(err, Some(LoaderError::InvalidParameter));
        assert_eq!(gpu.live_device_allocs(), 0);
        assert_eq!(gpu.live_streams(), 0);
    }

    #[test]
    fn eviction_knobs() {
        let gpu = mock();
        let loader = loader_with(&gpu, small_options());
        loader.set_max_texture_memory(128 * 1024 * 1024);
        assert_eq!(loader.max_texture_memory(), 128 * 1024 * 1024);
        loader.enable_eviction(false);
        loader.enable_eviction(true);
    }

    #[test]
    fn create_from_memory() {
        let gpu = mock();
        let loader = loader_with(&gpu, small_options());
        let pixels = solid(64, 64, [1, 2, 3, 4]);
        let handle = loader.create_texture_from_memory(&pixels, 64, 64, 4, TextureDesc::default());
        assert!(handle.valid);
        assert_eq!(handle.error, LoaderError::Success);
        assert_eq!(handle.id, 0);
        assert_eq!((handle.width, handle.height, handle.channels), (64, 64, 4));

        for i in 1..10 {
            let handle =
                loader.create_texture_from_memory(&pixels, 64, 64, 4, TextureDesc::default());
            assert_eq!(handle.id, i);
        }
    }

    #[test]
    fn create_from_memory_rejects_bad_params() {
        let gpu = mock();
        let loader = loader_with(&gpu, small_options());
        let pixels = solid(8, 8, [0, 0, 0, 255]);

        for (w, h, c) in [(0, 8, 4), (8, 0, 4), (8, 8, 0)] {
            let handle = loader.create_texture_from_memory(&pixels, w, h, c, no_mips());
            assert!(!handle.valid);
            assert_eq!(handle.error, LoaderError::InvalidParameter);
        }
        // short buffer
        let handle = loader.create_texture_from_memory(&pixels, 64, 64, 4, no_mips());
        assert_eq!(handle.error, LoaderError::InvalidParameter);
        assert_eq!(loader.last_error(), LoaderError::InvalidParameter);
        // registry untouched
        let handle = loader.create_texture_from_memory(&pixels, 8, 8, 4, no_mips());
        assert_eq!(handle.id, 0);
    }

    #[test]
    fn id_space_exhaustion() {
        let gpu = mock();
        let loader = loader_with(
            &gpu,
            LoaderOptions {
                max_textures: 2,
                max_requests_per_launch: 16,
                ..LoaderOptions::default()
            },
        );
        let pixels = solid(4, 4, [9, 9, 9, 255]);
        assert!(loader.create_texture_from_memory(&pixels, 4, 4, 4, no_mips()).valid);
        assert!(loader.create_texture_from_memory(&pixels, 4, 4, 4, no_mips()).valid);

        let handle = loader.create_texture_from_memory(&pixels, 4, 4, 4, no_mips());
        assert!(!handle.valid);
        assert_eq!(handle.error, LoaderError::MaxTexturesExceeded);
        assert_eq!(loader.last_error(), LoaderError::MaxTexturesExceeded);
    }

    #[test]
    fn device_context_shape() {
        let gpu = mock();
        let loader = loader_with(&gpu, small_options());
        let ctx = loader.device_context();
        assert!(!ctx.resident_flags.is_null());
        assert!(!ctx.textures.is_null());
        assert!(!ctx.requests.is_null());
        assert!(!ctx.request_count.is_null());
        assert!(!ctx.request_overflow.is_null());
        assert_eq!(ctx.request_overflow, ctx.request_count.add(4));
        assert_eq!(ctx.max_textures, 64);
        assert_eq!(ctx.max_requests, 256);
    }

    // --- deduplication ----------------------------------------------------

    #[test]
    fn filename_registered_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tex.png");
        image::RgbaImage::from_raw(4, 2, solid(4, 2, [10, 20, 30, 255]))
            .unwrap()
            .save(&path)
            .unwrap();
        let path = path.to_str().unwrap().to_owned();

        let gpu = mock();
        let loader = loader_with(&gpu, small_options());
        let first = loader.create_texture(&path, TextureDesc::default());
        assert!(first.valid);
        assert_eq!((first.width, first.height), (4, 2));

        let second = loader.create_texture(&path, TextureDesc::default());
        assert_eq!(second.id, first.id);
        assert_eq!(second.width, 4);

        // a different path gets a fresh ID
        let other = dir.path().join("other.png");
        image::RgbaImage::from_raw(2, 2, solid(2, 2, [1, 1, 1, 255]))
            .unwrap()
            .save(&other)
            .unwrap();
        let third = loader.create_texture(other.to_str().unwrap(), TextureDesc::default());
        assert_ne!(third.id, first.id);
    }

    #[test]
    fn missing_file_keeps_handle_retryable() {
        let gpu = mock();
        let loader = loader_with(&gpu, small_options());
        let handle = loader.create_texture("/nonexistent/missing.png", TextureDesc::default());
        // registration succeeds; dimensions stay provisional zeros
        assert!(handle.valid);
        assert_eq!(handle.error, LoaderError::Success);
        assert_eq!((handle.width, handle.height), (0, 0));
        assert_eq!(loader.texture_error(handle.id), LoaderError::FileNotFound);

        // the load itself fails and nothing becomes resident
        let ctx = loader.device_context();
        loader.launch_prepare(STREAM);
        run_kernel(&ctx, &[handle.id]);
        assert_eq!(loader.process_requests(STREAM, &ctx), 0);
        assert_eq!(loader.resident_texture_count(), 0);
        assert_eq!(loader.texture_error(handle.id), LoaderError::ImageLoadFailed);
        assert_eq!(loader.texture_error(99), LoaderError::InvalidTextureId);
    }

    #[test]
    fn source_pointer_dedup() {
        let gpu = mock();
        let loader = loader_with(&gpu, small_options());
        let source: Arc<dyn ImageSource> =
            Arc::new(RawImageSource::new(solid(4, 4, [5, 5, 5, 255]), 4, 4, 4, 0));

        let first = loader.create_texture_from_source(Arc::clone(&source), TextureDesc::default());
        let second = loader.create_texture_from_source(Arc::clone(&source), TextureDesc::default());
        assert!(first.valid);
        assert_eq!(first.id, second.id);
        assert_eq!((first.width, first.height, first.channels), (4, 4, 4));
    }

    #[test]
    fn content_hash_dedup_and_zero_hash_opt_out() {
        let gpu = mock();
        let loader = loader_with(&gpu, small_options());
        let pixels = solid(4, 4, [7, 7, 7, 255]);

        let a: Arc<dyn ImageSource> =
            Arc::new(RawImageSource::with_content_hash(pixels.clone(), 4, 4, 4));
        let b: Arc<dyn ImageSource> =
            Arc::new(RawImageSource::with_content_hash(pixels.clone(), 4, 4, 4));
        let first = loader.create_texture_from_source(a, TextureDesc::default());
        let second = loader.create_texture_from_source(b, TextureDesc::default());
        assert_eq!(first.id, second.id);

        // hash 0 disables content dedup: distinct objects, distinct IDs
        let c: Arc<dyn ImageSource> = Arc::new(RawImageSource::new(pixels.clone(), 4, 4, 4, 0));
        let d: Arc<dyn ImageSource> = Arc::new(RawImageSource::new(pixels, 4, 4, 4, 0));
        let third = loader.create_texture_from_source(c, TextureDesc::default());
        let fourth = loader.create_texture_from_source(d, TextureDesc::default());
        assert_ne!(third.id, fourth.id);
        assert_ne!(third.id, first.id);
    }

    // --- scenario: first miss then resident -------------------------------

    #[test]
    fn first_miss_then_resident() {
        let gpu = mock();
        let loader = loader_with(&gpu, small_options());
        let red = solid(4, 4, [255, 0, 0, 255]);
        let handle = loader.create_texture_from_memory(&red, 4, 4, 4, no_mips());
        let ctx = loader.device_context();

        loader.launch_prepare(STREAM);
        run_kernel(&ctx, &[handle.id]);
        assert_eq!(loader.process_requests(STREAM, &ctx), 1);
        assert_eq!(loader.request_count(), 1);
        assert!(!loader.had_request_overflow());
        assert_eq!(loader.resident_texture_count(), 1);
        assert_eq!(loader.total_texture_memory(), 64);

        loader.launch_prepare(STREAM);
        let sample = unsafe { sampling::sample_or_request(&ctx, handle.id) };
        let Sample::Resident(tex) = sample else {
            panic!("expected resident texture, got {sample:?}");
        };
        for y in 0..4 {
            for x in 0..4 {
                assert_eq!(gpu.read_texel(tex, 0, x, y), Some([255, 0, 0, 255]));
            }
        }
        assert_eq!(loader.process_requests(STREAM, &ctx), 0);
        assert_eq!(loader.request_count(), 0);
        assert_eq!(loader.resident_texture_count(), 1);
    }

    // --- scenario: eviction -----------------------------------------------

    fn eviction_setup(gpu: &Arc<MockGpu>) -> (DemandTextureLoader, DeviceContext) {
        let loader = loader_with(
            gpu,
            LoaderOptions {
                max_textures: 16,
                max_requests_per_launch: 64,
                max_texture_memory: 512,
                min_resident_frames: 0,
                ..LoaderOptions::default()
            },
        );
        for i in 0..4u8 {
            let pixels = solid(8, 8, [i, i, i, 255]);
            let handle = loader.create_texture_from_memory(&pixels, 8, 8, 4, no_mips());
            assert!(handle.valid);
        }
        let ctx = loader.device_context();
        (loader, ctx)
    }

    #[test]
    fn eviction_is_lru_within_priority() {
        let gpu = mock();
        let (loader, ctx) = eviction_setup(&gpu);

        loader.launch_prepare(STREAM); // frame 1
        run_kernel(&ctx, &[0, 1]);
        assert_eq!(loader.process_requests(STREAM, &ctx), 2);
        assert_eq!(loader.total_texture_memory(), 512);

        loader.launch_prepare(STREAM); // frame 2
        run_kernel(&ctx, &[2]);
        assert_eq!(loader.process_requests(STREAM, &ctx), 1);

        loader.launch_prepare(STREAM); // frame 3
        run_kernel(&ctx, &[3]);
        assert_eq!(loader.process_requests(STREAM, &ctx), 1);

        assert_eq!(loader.resident_texture_count(), 2);
        loader.launch_prepare(STREAM); // publish the final bitmap
        assert_eq!(device_resident_ids(&ctx), vec![2, 3]);
        assert_eq!(loader.total_texture_memory(), 512);
    }

    #[test]
    fn keep_resident_overrides_lru() {
        let gpu = mock();
        let (loader, ctx) = eviction_setup(&gpu);
        loader.update_eviction_priority(0, EvictionPriority::KeepResident);

        loader.launch_prepare(STREAM);
        run_kernel(&ctx, &[0, 1]);
        loader.process_requests(STREAM, &ctx);

        loader.launch_prepare(STREAM);
        run_kernel(&ctx, &[2]);
        loader.process_requests(STREAM, &ctx);

        loader.launch_prepare(STREAM);
        run_kernel(&ctx, &[3]);
        loader.process_requests(STREAM, &ctx);

        // texture 1 went before 0 despite being newer
        loader.launch_prepare(STREAM);
        assert_eq!(device_resident_ids(&ctx), vec![0, 3]);
    }

    #[test]
    fn low_priority_evicted_first() {
        let gpu = mock();
        let (loader, ctx) = eviction_setup(&gpu);
        // make the most recently used texture the cheapest to evict
        loader.update_eviction_priority(1, EvictionPriority::Low);

        loader.launch_prepare(STREAM);
        run_kernel(&ctx, &[0, 1]);
        loader.process_requests(STREAM, &ctx);

        loader.launch_prepare(STREAM);
        run_kernel(&ctx, &[1]); // does not touch last_used (sampling never does)
        run_kernel(&ctx, &[2]);
        loader.process_requests(STREAM, &ctx);

        loader.launch_prepare(STREAM);
        assert_eq!(device_resident_ids(&ctx), vec![0, 2]);
    }

    #[test]
    fn thrash_guard_permits_budget_overrun() {
        let gpu = mock();
        let loader = loader_with(
            &gpu,
            LoaderOptions {
                max_textures: 8,
                max_requests_per_launch: 16,
                max_texture_memory: 256,
                min_resident_frames: 3,
                ..LoaderOptions::default()
            },
        );
        for i in 0..2u8 {
            let pixels = solid(8, 8, [i, 0, 0, 255]);
            loader.create_texture_from_memory(&pixels, 8, 8, 4, no_mips());
        }
        let ctx = loader.device_context();

        loader.launch_prepare(STREAM); // frame 1
        run_kernel(&ctx, &[0]);
        assert_eq!(loader.process_requests(STREAM, &ctx), 1);

        loader.launch_prepare(STREAM); // frame 2
        run_kernel(&ctx, &[1]);
        // texture 0 is only one frame old: exempt, so the budget overruns
        assert_eq!(loader.process_requests(STREAM, &ctx), 1);
        assert_eq!(loader.resident_texture_count(), 2);
        assert_eq!(loader.total_texture_memory(), 512);
    }

    #[test]
    fn disabled_eviction_never_frees() {
        let gpu = mock();
        let (loader, ctx) = eviction_setup(&gpu);
        loader.enable_eviction(false);

        loader.launch_prepare(STREAM);
        run_kernel(&ctx, &[0, 1, 2, 3]);
        assert_eq!(loader.process_requests(STREAM, &ctx), 4);
        assert_eq!(loader.resident_texture_count(), 4);
        assert_eq!(loader.total_texture_memory(), 1024);
    }

    // --- scenario: ring overflow ------------------------------------------

    #[test]
    fn request_ring_overflow_is_sticky_and_recovers() {
        let gpu = mock();
        let loader = loader_with(
            &gpu,
            LoaderOptions {
                max_textures: 8,
                max_requests_per_launch: 2,
                ..LoaderOptions::default()
            },
        );
        for i in 0..5u8 {
            let pixels = solid(4, 4, [i, i, i, 255]);
            loader.create_texture_from_memory(&pixels, 4, 4, 4, no_mips());
        }
        let ctx = loader.device_context();

        loader.launch_prepare(STREAM);
        run_kernel(&ctx, &[0, 1, 2, 3, 4]);
        assert_eq!(loader.process_requests(STREAM, &ctx), 2);
        assert!(loader.had_request_overflow());
        assert_eq!(loader.request_count(), 5);
        assert_eq!(loader.resident_texture_count(), 2);
        loader.launch_prepare(STREAM);
        assert_eq!(device_resident_ids(&ctx), vec![0, 1]);

        // remaining IDs resolve over subsequent frames
        run_kernel(&ctx, &[0, 1, 2, 3, 4]);
        assert_eq!(loader.process_requests(STREAM, &ctx), 2);
        assert!(loader.had_request_overflow());
        assert_eq!(loader.resident_texture_count(), 4);

        loader.launch_prepare(STREAM);
        run_kernel(&ctx, &[0, 1, 2, 3, 4]);
        assert_eq!(loader.process_requests(STREAM, &ctx), 1);
        assert!(!loader.had_request_overflow());
        assert_eq!(loader.request_count(), 1);
        assert_eq!(loader.resident_texture_count(), 5);
    }

    // --- mip generation ----------------------------------------------------

    #[test]
    fn mipmapped_load_charges_full_chain() {
        let gpu = mock();
        let loader = loader_with(&gpu, small_options());
        // 8x8 checkerboard: every level below the base averages to 127
        let mut pixels = vec![0u8; 8 * 8 * 4];
        for y in 0..8u32 {
            for x in 0..8u32 {
                let v = if (x + y) % 2 == 0 { 255 } else { 0 };
                let i = ((y * 8 + x) * 4) as usize;
                pixels[i..i + 4].copy_from_slice(&[v, v, v, 255]);
            }
        }
        let handle = loader.create_texture_from_memory(&pixels, 8, 8, 4, TextureDesc::default());
        let ctx = loader.device_context();

        loader.launch_prepare(STREAM);
        run_kernel(&ctx, &[handle.id]);
        assert_eq!(loader.process_requests(STREAM, &ctx), 1);
        assert_eq!(loader.total_texture_memory(), 340);

        loader.launch_prepare(STREAM);
        let Sample::Resident(tex) = (unsafe { sampling::sample_or_request(&ctx, handle.id) })
        else {
            panic!("texture should be resident");
        };
        assert_eq!(gpu.texture_level_count(tex), Some(4));
        assert_eq!(gpu.texture_extent(tex, 3), Some((1, 1)));
        assert_eq!(gpu.read_texel(tex, 0, 0, 0), Some([255, 255, 255, 255]));
        assert_eq!(gpu.read_texel(tex, 1, 1, 1), Some([127, 127, 127, 255]));
        assert_eq!(gpu.read_texel(tex, 3, 0, 0), Some([127, 127, 127, 255]));
    }

    #[test]
    fn max_mip_level_caps_chain() {
        let gpu = mock();
        let loader = loader_with(&gpu, small_options());
        let pixels = solid(8, 8, [50, 60, 70, 255]);
        let desc = TextureDesc {
            max_mip_level: 2,
            ..TextureDesc::default()
        };
        let handle = loader.create_texture_from_memory(&pixels, 8, 8, 4, desc);
        let ctx = loader.device_context();

        loader.launch_prepare(STREAM);
        run_kernel(&ctx, &[handle.id]);
        assert_eq!(loader.process_requests(STREAM, &ctx), 1);

        loader.launch_prepare(STREAM);
        let Sample::Resident(tex) = (unsafe { sampling::sample_or_request(&ctx, handle.id) })
        else {
            panic!("texture should be resident");
        };
        assert_eq!(gpu.texture_level_count(tex), Some(2));
        assert_eq!(gpu.read_texel(tex, 1, 0, 0), Some([50, 60, 70, 255]));
    }

    #[test]
    fn single_pixel_texture_skips_mipmaps() {
        let gpu = mock();
        let loader = loader_with(&gpu, small_options());
        let handle =
            loader.create_texture_from_memory(&[9, 8, 7, 255], 1, 1, 4, TextureDesc::default());
        let ctx = loader.device_context();
        loader.launch_prepare(STREAM);
        run_kernel(&ctx, &[handle.id]);
        assert_eq!(loader.process_requests(STREAM, &ctx), 1);
        assert_eq!(loader.total_texture_memory(), 4);
    }

    // --- mirrors and invariants -------------------------------------------

    #[test]
    fn launch_prepare_makes_device_match_mirrors() {
        let gpu = mock();
        let loader = loader_with(&gpu, small_options());
        let pixels = solid(4, 4, [1, 2, 3, 255]);
        for _ in 0..3 {
            loader.create_texture_from_memory(&pixels, 4, 4, 4, no_mips());
        }
        let ctx = loader.device_context();

        loader.launch_prepare(STREAM);
        run_kernel(&ctx, &[0, 2]);
        loader.process_requests(STREAM, &ctx);
        loader.launch_prepare(STREAM);

        let state = loader.shared.state.lock();
        let mirror_flags = state.mirrors.flags().to_vec();
        let mirror_textures = state.mirrors.textures().to_vec();
        drop(state);

        let mut device_flags = vec![0u8; mirror_flags.len() * 4];
        gpu.read_device(ctx.resident_flags, &mut device_flags).unwrap();
        assert_eq!(device_flags, bytemuck::cast_slice::<u32, u8>(&mirror_flags));

        let mut device_textures = vec![0u8; mirror_textures.len() * 8];
        gpu.read_device(ctx.textures, &mut device_textures).unwrap();
        assert_eq!(device_textures, bytemuck::cast_slice::<u64, u8>(&mirror_textures));

        // flags, table, record state, and byte accounting all agree
        let state = loader.shared.state.lock();
        let mut resident_bytes = 0;
        for id in 0..state.next_texture_id {
            let bit = mirror_flags[(id / 32) as usize] & (1 << (id % 32)) != 0;
            let handle = mirror_textures[id as usize];
            let resident = loader.shared.tex_states[id as usize]
                .resident
                .load(Ordering::Relaxed);
            let record = &state.records[id as usize];
            assert_eq!(bit, handle != 0);
            assert_eq!(bit, resident);
            assert_eq!(bit, record.memory_usage > 0);
            resident_bytes += record.memory_usage;
        }
        assert_eq!(resident_bytes, state.total_memory_usage);
    }

    #[test]
    fn clean_frame_uploads_nothing() {
        let gpu = mock();
        let loader = loader_with(&gpu, small_options());
        let pixels = solid(4, 4, [1, 2, 3, 255]);
        loader.create_texture_from_memory(&pixels, 4, 4, 4, no_mips());
        let ctx = loader.device_context();

        loader.launch_prepare(STREAM);
        run_kernel(&ctx, &[0]);
        loader.process_requests(STREAM, &ctx);
        loader.launch_prepare(STREAM); // uploads the new resident

        // no loads or evictions since: both intervals must be clean
        let state = loader.shared.state.lock();
        assert!(state.flags_dirty.range().is_none());
        assert!(state.textures_dirty.range().is_none());
    }

    // --- parallel and repeated loading ------------------------------------

    #[test]
    fn many_misses_load_in_parallel() {
        let gpu = mock();
        let loader = loader_with(&gpu, small_options());
        for i in 0..12u8 {
            let pixels = solid(4, 4, [i, 0, 0, 255]);
            loader.create_texture_from_memory(&pixels, 4, 4, 4, no_mips());
        }
        let ctx = loader.device_context();

        loader.launch_prepare(STREAM);
        run_kernel(&ctx, &(0..12).collect::<Vec<_>>());
        assert_eq!(loader.process_requests(STREAM, &ctx), 12);
        assert_eq!(loader.resident_texture_count(), 12);
        assert_eq!(loader.total_texture_memory(), 12 * 64);
    }

    #[test]
    fn duplicate_requests_load_once() {
        let gpu = mock();
        let loader = loader_with(&gpu, small_options());
        let pixels = solid(4, 4, [3, 3, 3, 255]);
        loader.create_texture_from_memory(&pixels, 4, 4, 4, no_mips());
        let ctx = loader.device_context();

        loader.launch_prepare(STREAM);
        run_kernel(&ctx, &[0, 0, 0, 0]);
        assert_eq!(loader.process_requests(STREAM, &ctx), 1);
        assert_eq!(loader.request_count(), 4);
    }

    #[test]
    fn three_channel_memory_texture_reloads_after_eviction() {
        let gpu = mock();
        let loader = loader_with(
            &gpu,
            LoaderOptions {
                max_textures: 8,
                max_requests_per_launch: 16,
                max_texture_memory: 256,
                min_resident_frames: 0,
                ..LoaderOptions::default()
            },
        );
        let rgb: Vec<u8> = (0..8 * 8).flat_map(|_| [10u8, 20, 30]).collect();
        loader.create_texture_from_memory(&rgb, 8, 8, 3, no_mips());
        loader.create_texture_from_memory(&solid(8, 8, [1, 1, 1, 255]), 8, 8, 4, no_mips());
        let ctx = loader.device_context();

        loader.launch_prepare(STREAM);
        run_kernel(&ctx, &[0]);
        assert_eq!(loader.process_requests(STREAM, &ctx), 1);

        loader.launch_prepare(STREAM);
        run_kernel(&ctx, &[1]); // evicts 0
        assert_eq!(loader.process_requests(STREAM, &ctx), 1);

        loader.launch_prepare(STREAM);
        run_kernel(&ctx, &[0]); // evicts 1, reloads 0 from the cached copy
        assert_eq!(loader.process_requests(STREAM, &ctx), 1);

        loader.launch_prepare(STREAM);
        let Sample::Resident(tex) = (unsafe { sampling::sample_or_request(&ctx, 0) }) else {
            panic!("texture 0 should be resident again");
        };
        assert_eq!(gpu.read_texel(tex, 0, 3, 3), Some([10, 20, 30, 255]));
    }

    // --- file-backed end to end -------------------------------------------

    #[test]
    fn file_texture_loads_on_request() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gradient.png");
        let mut pixels = vec![0u8; 4 * 4 * 4];
        for (i, px) in pixels.chunks_mut(4).enumerate() {
            px.copy_from_slice(&[i as u8 * 16, 0, 255 - i as u8 * 16, 255]);
        }
        image::RgbaImage::from_raw(4, 4, pixels.clone()).unwrap().save(&path).unwrap();

        let gpu = mock();
        let loader = loader_with(&gpu, small_options());
        let handle = loader.create_texture(path.to_str().unwrap(), no_mips());
        assert_eq!((handle.width, handle.height), (4, 4));

        let ctx = loader.device_context();
        loader.launch_prepare(STREAM);
        run_kernel(&ctx, &[handle.id]);
        assert_eq!(loader.process_requests(STREAM, &ctx), 1);

        loader.launch_prepare(STREAM);
        let Sample::Resident(tex) = (unsafe { sampling::sample_or_request(&ctx, handle.id) })
        else {
            panic!("texture should be resident");
        };
        for (i, px) in pixels.chunks(4).enumerate() {
            let (x, y) = (i as u32 % 4, i as u32 / 4);
            assert_eq!(gpu.read_texel(tex, 0, x, y).unwrap(), px);
        }
    }

    // --- async path --------------------------------------------------------

    #[test]
    fn async_drain_loads_and_ticket_completes() {
        let gpu = mock();
        let loader = loader_with(&gpu, small_options());
        let pixels = solid(4, 4, [200, 100, 50, 255]);
        loader.create_texture_from_memory(&pixels, 4, 4, 4, no_mips());
        let ctx = loader.device_context();

        loader.launch_prepare(STREAM);
        run_kernel(&ctx, &[0]);
        let ticket = loader.process_requests_async(STREAM, &ctx);
        assert_eq!(ticket.num_tasks_total(), 1);
        ticket.wait(None);
        assert_eq!(ticket.num_tasks_remaining(), 0);
        assert_eq!(loader.resident_texture_count(), 1);
        assert_eq!(loader.request_count(), 1);
    }

    #[test]
    fn back_to_back_async_drains_are_sequential() {
        let gpu = mock();
        let loader = loader_with(&gpu, small_options());
        for i in 0..2u8 {
            let pixels = solid(4, 4, [i, i, i, 255]);
            loader.create_texture_from_memory(&pixels, 4, 4, 4, no_mips());
        }
        let ctx = loader.device_context();

        loader.launch_prepare(STREAM);
        run_kernel(&ctx, &[0, 1]);
        let t1 = loader.process_requests_async(STREAM, &ctx);
        let t2 = loader.process_requests_async(STREAM, &ctx);

        t1.wait(None);
        // the worker is serialized: t1 finished strictly before t2 runs
        t2.wait(None);
        assert_eq!(t1.num_tasks_remaining(), 0);
        assert_eq!(t2.num_tasks_remaining(), 0);
        // both drains observed a consistent registry: both textures loaded once
        assert_eq!(loader.resident_texture_count(), 2);
        assert_eq!(loader.total_texture_memory(), 128);
    }

    #[test]
    fn async_ticket_records_chained_event() {
        let gpu = mock();
        let loader = loader_with(&gpu, small_options());
        let pixels = solid(4, 4, [1, 2, 3, 255]);
        loader.create_texture_from_memory(&pixels, 4, 4, 4, no_mips());
        let ctx = loader.device_context();

        loader.launch_prepare(STREAM);
        run_kernel(&ctx, &[0]);
        let ticket = loader.process_requests_async(STREAM, &ctx);
        let event = gpu.create_event().unwrap();
        ticket.wait(Some(event));
        gpu.synchronize_event(event).unwrap();
        gpu.destroy_event(event).unwrap();
        assert_eq!(loader.resident_texture_count(), 1);
    }

    // --- unload / abort / drop --------------------------------------------

    #[test]
    fn unload_texture_and_all() {
        let gpu = mock();
        let loader = loader_with(&gpu, small_options());
        for i in 0..3u8 {
            let pixels = solid(4, 4, [i, i, i, 255]);
            loader.create_texture_from_memory(&pixels, 4, 4, 4, no_mips());
        }
        let ctx = loader.device_context();
        loader.launch_prepare(STREAM);
        run_kernel(&ctx, &[0, 1, 2]);
        loader.process_requests(STREAM, &ctx);
        assert_eq!(loader.resident_texture_count(), 3);

        loader.unload_texture(1);
        assert_eq!(loader.resident_texture_count(), 2);
        assert_eq!(loader.total_texture_memory(), 128);
        loader.launch_prepare(STREAM);
        assert_eq!(device_resident_ids(&ctx), vec![0, 2]);

        loader.unload_all();
        assert_eq!(loader.resident_texture_count(), 0);
        assert_eq!(loader.total_texture_memory(), 0);
        loader.launch_prepare(STREAM);
        assert!(device_resident_ids(&ctx).is_empty());
        assert_eq!(gpu.live_texture_objects(), 0);
        assert_eq!(gpu.live_arrays(), 0);
    }

    #[test]
    fn unload_invalid_id_sets_error() {
        let gpu = mock();
        let loader = loader_with(&gpu, small_options());
        loader.unload_texture(42);
        assert_eq!(loader.last_error(), LoaderError::InvalidTextureId);

        loader.update_eviction_priority(42, EvictionPriority::High);
        assert_eq!(loader.last_error(), LoaderError::InvalidTextureId);
    }

    #[test]
    fn abort_unloads_and_refuses_work() {
        let gpu = mock();
        let loader = loader_with(&gpu, small_options());
        let pixels = solid(4, 4, [1, 1, 1, 255]);
        loader.create_texture_from_memory(&pixels, 4, 4, 4, no_mips());
        let ctx = loader.device_context();

        loader.launch_prepare(STREAM);
        run_kernel(&ctx, &[0]);
        loader.process_requests(STREAM, &ctx);
        assert_eq!(loader.resident_texture_count(), 1);

        assert!(!loader.is_aborted());
        loader.abort();
        assert!(loader.is_aborted());
        assert_eq!(loader.resident_texture_count(), 0);

        // further drains are refused
        loader.launch_prepare(STREAM);
        run_kernel(&ctx, &[0]);
        assert_eq!(loader.process_requests(STREAM, &ctx), 0);
        let ticket = loader.process_requests_async(STREAM, &ctx);
        assert_eq!(ticket.num_tasks_total(), 0);
        assert_eq!(loader.resident_texture_count(), 0);
    }

    #[test]
    fn drop_releases_every_gpu_resource() {
        let gpu = mock();
        {
            let loader = loader_with(&gpu, small_options());
            for i in 0..4u8 {
                let pixels = solid(8, 8, [i, i, i, 255]);
                loader.create_texture_from_memory(&pixels, 8, 8, 4, TextureDesc::default());
            }
            let ctx = loader.device_context();
            loader.launch_prepare(STREAM);
            run_kernel(&ctx, &[0, 1]);
            loader.process_requests(STREAM, &ctx);

            loader.launch_prepare(STREAM);
            run_kernel(&ctx, &[2, 3]);
            let ticket = loader.process_requests_async(STREAM, &ctx);
            ticket.wait(None);
            assert_eq!(loader.resident_texture_count(), 4);
        }
        assert_eq!(gpu.live_texture_objects(), 0);
        assert_eq!(gpu.live_arrays(), 0);
        assert_eq!(gpu.live_device_allocs(), 0);
        assert_eq!(gpu.live_host_allocs(), 0);
        assert_eq!(gpu.live_events(), 0);
        assert_eq!(gpu.live_streams(), 0);
    }
}
