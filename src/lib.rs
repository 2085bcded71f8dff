//! Demand-driven GPU texture residency.
//!
//! Applications register any number of textures — by file path, by
//! in-memory pixels, or through a pluggable [`ImageSource`] — but only the
//! textures a kernel actually samples are decoded and uploaded. When the
//! device byte budget is exceeded, the least valuable residents are
//! evicted (priority first, then least recently used, with a configurable
//! thrash guard).
//!
//! The per-frame protocol:
//!
//! 1. [`DemandTextureLoader::launch_prepare`] uploads whatever changed in
//!    the device context (dirty ranges only) and resets the request ring.
//! 2. The kernel samples through the [`DeviceContext`] it received by
//!    value: resident IDs sample their texture object, misses append the
//!    ID to the request ring (see [`sampling`] for the reference
//!    contract).
//! 3. [`DemandTextureLoader::process_requests`] (or the overlapped
//!    [`DemandTextureLoader::process_requests_async`]) drains the ring,
//!    deduplicates, makes room under the budget, and fans decoding across
//!    a worker pool. The application re-launches; previously missed
//!    textures now sample.
//!
//! The GPU runtime is consumed through the [`gpu::GpuRuntime`] trait. The
//! in-tree [`gpu::mock::MockGpu`] backs the test suite and GPU-less
//! development; hardware backends implement the same trait over a real
//! runtime.

pub mod context;
pub mod error;
pub mod gpu;
pub mod image_source;
pub mod loader;
pub mod metadata;
pub mod mipmap;
pub mod pools;
pub mod sampling;
pub mod thread_pool;
pub mod ticket;

pub use context::{DeviceContext, RequestStats};
pub use error::LoaderError;
pub use gpu::{AddressMode, DevicePtr, Event, FilterMode, GpuRuntime, Stream, TextureObject};
pub use image_source::{FileImageSource, ImageSource, PixelFormat, RawImageSource, TextureInfo};
pub use loader::DemandTextureLoader;
pub use metadata::{EvictionPriority, LoaderOptions, TextureDesc, TextureHandle};
pub use ticket::Ticket;
