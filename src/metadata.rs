//! Texture descriptors, loader options, and the per-texture host record.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::error::LoaderError;
use crate::gpu::{AddressMode, ArrayHandle, FilterMode, MipArrayHandle, TextureObject};
use crate::image_source::ImageSource;

/// How reluctantly a resident texture gives up its memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum EvictionPriority {
    /// First out.
    Low,
    #[default]
    Normal,
    /// Evicted only after every Low and Normal candidate.
    High,
    /// Never evicted (explicit unload only).
    KeepResident,
}

impl EvictionPriority {
    /// Ascending sort bucket: lower evicts earlier. `KeepResident` never
    /// enters the candidate list, so it has no bucket.
    #[inline]
    pub(crate) fn bucket(self) -> u32 {
        match self {
            EvictionPriority::Low => 0,
            EvictionPriority::Normal => 1,
            EvictionPriority::High => 2,
            EvictionPriority::KeepResident => u32::MAX,
        }
    }
}

/// Per-texture sampling and lifetime configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextureDesc {
    pub address_mode: [AddressMode; 2],
    pub filter_mode: FilterMode,
    pub mipmap_filter_mode: FilterMode,
    pub normalized_coords: bool,
    pub srgb: bool,
    pub generate_mipmaps: bool,
    /// Cap on generated mip levels; 0 = full chain.
    pub max_mip_level: u32,
    pub eviction_priority: EvictionPriority,
}

impl Default for TextureDesc {
    fn default() -> Self {
        Self {
            address_mode: [AddressMode::Wrap; 2],
            filter_mode: FilterMode::Linear,
            mipmap_filter_mode: FilterMode::Linear,
            normalized_coords: true,
            srgb: false,
            generate_mipmaps: true,
            max_mip_level: 0,
            eviction_priority: EvictionPriority::Normal,
        }
    }
}

/// Loader-wide configuration, fixed at construction except for the
/// eviction knobs.
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    /// Device byte budget for resident textures; 0 = unlimited.
    pub max_texture_memory: usize,
    /// Size of the dense ID space.
    pub max_textures: u32,
    /// Capacity of the per-launch request ring.
    pub max_requests_per_launch: u32,
    pub enable_eviction: bool,
    /// Worker threads for parallel decoding; 0 = auto (half the hardware
    /// concurrency, capped at 16).
    pub max_threads: usize,
    /// A texture resident fewer than this many frames is exempt from
    /// eviction (thrash guard).
    pub min_resident_frames: u32,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            max_texture_memory: 2 * 1024 * 1024 * 1024,
            max_textures: 4096,
            max_requests_per_launch: 1024,
            enable_eviction: true,
            max_threads: 0,
            min_resident_frames: 0,
        }
    }
}

/// Result of texture registration: the assigned ID, provisional dimensions,
/// and the status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TextureHandle {
    pub id: u32,
    pub valid: bool,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub error: LoaderError,
}

impl TextureHandle {
    pub(crate) fn invalid(error: LoaderError) -> Self {
        Self {
            error,
            ..Self::default()
        }
    }
}

/// Where a record's pixels come from. Exactly one per record.
#[derive(Clone, Default)]
pub(crate) enum PixelSource {
    /// Registered but empty (pre-construction slot).
    #[default]
    None,
    /// Decode from a file path on load.
    File(String),
    /// Caller-supplied reader, shared ownership.
    Reader(Arc<dyn ImageSource>),
    /// Owned copy of caller pixels; dimensions here are authoritative and
    /// immutable, unlike the record's user-facing fields.
    Memory {
        pixels: Arc<[u8]>,
        width: u32,
        height: u32,
        channels: u32,
    },
}

/// Host-side record for one texture ID. Everything here is guarded by the
/// loader mutex; the resident/loading atomics live in [`TexState`].
#[derive(Default)]
pub(crate) struct TextureRecord {
    pub source: PixelSource,
    pub desc: TextureDesc,

    // GPU resources, populated while resident
    pub tex_obj: TextureObject,
    pub array: Option<ArrayHandle>,
    pub mip_array: Option<MipArrayHandle>,

    // provisional before the first load, authoritative after
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub num_mip_levels: u32,
    pub memory_usage: usize,
    pub last_used_frame: u32,
    pub loaded_frame: u32,

    pub last_error: LoaderError,
}

/// Lock-free load state for one texture ID. Lives outside the loader mutex
/// so the claim protocol's fast path never blocks.
///
/// Invariant: `resident && loading` never holds.
#[derive(Default)]
pub(crate) struct TexState {
    pub resident: AtomicBool,
    pub loading: AtomicBool,
}
