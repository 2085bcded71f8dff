//! GPU runtime abstraction.
//!
//! The residency engine drives the device through this object-safe trait
//! instead of calling a runtime directly. The surface is deliberately shaped
//! like a texture-capable runtime: streams, timing-disabled events, raw
//! device allocations, page-locked host allocations, RGBA8 2D arrays (flat
//! and mipmapped), and opaque 64-bit texture-object handles.
//!
//! Two implementation families are expected:
//! * [`mock::MockGpu`] — in-tree, host-memory backed, used by the test suite
//!   and for GPU-less development. It executes enqueued work eagerly, so
//!   every synchronization point trivially holds.
//! * A hardware backend (out of tree) that forwards each call to the real
//!   runtime. For such a backend the `*_async` calls only enqueue; the
//!   caller owns the ordering protocol (events + stream waits) exactly as it
//!   is written in the loader.

pub mod mock;

use std::ptr::NonNull;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Raw device address. `0` is null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Pointer arithmetic in bytes.
    #[inline]
    pub fn add(self, bytes: u64) -> DevicePtr {
        DevicePtr(self.0 + bytes)
    }
}

/// Opaque texture-object handle. `0` means "no texture" and is what the
/// device context stores for non-resident entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct TextureObject(pub u64);

impl TextureObject {
    pub const NULL: TextureObject = TextureObject(0);

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Stream of asynchronously executed device work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Stream(pub u64);

impl Stream {
    /// The runtime's default stream.
    pub const DEFAULT: Stream = Stream(0);
}

/// Timing-disabled completion marker recorded on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Event(pub u64);

/// Flat RGBA8 2D device array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ArrayHandle(pub u64);

/// Mipmapped RGBA8 2D device array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct MipArrayHandle(pub u64);

// ---------------------------------------------------------------------------
// Texture-object configuration
// ---------------------------------------------------------------------------

/// Wrapping behavior outside [0, 1) (or [0, size) for unnormalized coords).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressMode {
    #[default]
    Wrap,
    Clamp,
    Mirror,
    Border,
}

/// Sample interpolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterMode {
    Point,
    #[default]
    Linear,
}

/// The image resource a texture object samples from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TexResource {
    Array(ArrayHandle),
    Mipmapped(MipArrayHandle),
}

/// Sampler + view state for [`GpuRuntime::create_texture_object`].
///
/// Reads always return normalized floats (RGBA8 -> [0,1] per channel).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextureObjectDesc {
    pub address_mode: [AddressMode; 2],
    pub filter_mode: FilterMode,
    pub mipmap_filter_mode: FilterMode,
    pub normalized_coords: bool,
    pub srgb: bool,
    /// `(min, max)` mip clamp; set to `(0, levels - 1)` for mipmapped
    /// resources, `None` for flat arrays.
    pub mip_level_clamp: Option<(f32, f32)>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuError {
    #[error("device out of memory")]
    OutOfMemory,
    #[error("invalid handle")]
    InvalidHandle,
    #[error("invalid value")]
    InvalidValue,
    #[error("runtime failure")]
    RuntimeFailure,
}

pub type GpuResult<T> = Result<T, GpuError>;

// ---------------------------------------------------------------------------
// Runtime trait
// ---------------------------------------------------------------------------

/// Object-safe facade over a texture-capable GPU runtime.
///
/// All methods are thread-safe. Methods taking raw host pointers are
/// `unsafe`: the caller guarantees the host range stays valid (and, for a
/// hardware backend, page-locked) until the enqueued operation completes.
pub trait GpuRuntime: Send + Sync {
    // --- streams ---------------------------------------------------------
    fn create_stream(&self, non_blocking: bool) -> GpuResult<Stream>;
    fn destroy_stream(&self, stream: Stream) -> GpuResult<()>;
    /// Block the host until all work enqueued on `stream` has completed.
    fn synchronize_stream(&self, stream: Stream) -> GpuResult<()>;

    // --- events ----------------------------------------------------------
    fn create_event(&self) -> GpuResult<Event>;
    fn destroy_event(&self, event: Event) -> GpuResult<()>;
    /// Capture "everything enqueued on `stream` so far".
    fn record_event(&self, event: Event, stream: Stream) -> GpuResult<()>;
    /// Block the host until the recorded work has completed.
    fn synchronize_event(&self, event: Event) -> GpuResult<()>;
    /// Make future work on `stream` wait for `event` (cross-stream edge).
    fn stream_wait_event(&self, stream: Stream, event: Event) -> GpuResult<()>;

    // --- raw device memory ----------------------------------------------
    fn device_alloc(&self, len: usize) -> GpuResult<DevicePtr>;
    fn device_free(&self, ptr: DevicePtr) -> GpuResult<()>;
    fn memset_async(&self, dst: DevicePtr, value: u8, len: usize, stream: Stream) -> GpuResult<()>;

    /// # Safety
    /// `src..src+len` must be a valid readable host range that outlives the
    /// copy.
    unsafe fn memcpy_htod_async(
        &self,
        dst: DevicePtr,
        src: *const u8,
        len: usize,
        stream: Stream,
    ) -> GpuResult<()>;

    /// # Safety
    /// `dst..dst+len` must be a valid writable host range that outlives the
    /// copy and is not concurrently accessed until the stream synchronizes.
    unsafe fn memcpy_dtoh_async(
        &self,
        dst: *mut u8,
        src: DevicePtr,
        len: usize,
        stream: Stream,
    ) -> GpuResult<()>;

    // --- page-locked host memory -----------------------------------------
    fn host_alloc(&self, len: usize) -> GpuResult<NonNull<u8>>;

    /// # Safety
    /// `ptr` must come from `host_alloc` with the same `len` and must not be
    /// used afterwards.
    unsafe fn host_free(&self, ptr: NonNull<u8>, len: usize);

    // --- RGBA8 2D arrays --------------------------------------------------
    fn alloc_array(&self, width: u32, height: u32) -> GpuResult<ArrayHandle>;
    fn free_array(&self, array: ArrayHandle) -> GpuResult<()>;
    fn alloc_mipmapped_array(&self, width: u32, height: u32, levels: u32) -> GpuResult<MipArrayHandle>;
    /// Resolve one level of a mipmapped array for upload.
    fn mip_level_array(&self, mip: MipArrayHandle, level: u32) -> GpuResult<ArrayHandle>;
    fn free_mipmapped_array(&self, mip: MipArrayHandle) -> GpuResult<()>;

    /// Synchronous 2D host -> array copy of tightly packed rows.
    ///
    /// # Safety
    /// `src` must point at `row_bytes * rows` readable bytes.
    unsafe fn upload_array(
        &self,
        array: ArrayHandle,
        src: *const u8,
        row_bytes: usize,
        rows: usize,
    ) -> GpuResult<()>;

    // --- texture objects --------------------------------------------------
    fn create_texture_object(
        &self,
        resource: TexResource,
        desc: &TextureObjectDesc,
    ) -> GpuResult<TextureObject>;
    fn destroy_texture_object(&self, tex: TextureObject) -> GpuResult<()>;
}
