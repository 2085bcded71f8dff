//! Host-side reference implementation of the device sampling contract.
//!
//! A real kernel performs these exact steps in device code against the
//! [`DeviceContext`] it received by value:
//!
//! 1. IDs at or past `max_textures` return the fallback and are never
//!    recorded.
//! 2. A clear residency bit appends the ID to the request ring with an
//!    atomic increment of the count; an append index at or past
//!    `max_requests` sets the sticky overflow flag instead of storing.
//! 3. A set bit samples the texture object at that index.
//!
//! Device code may additionally deduplicate appends per wave (one append
//! per unique ID per wave); that is an optimization, not required for
//! correctness — the host drain deduplicates again.
//!
//! On a runtime whose device pointers are host-visible (the mock), these
//! functions are the kernel: tests drive them, concurrently if they like,
//! and the loader observes the same ring state a GPU would produce.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::context::DeviceContext;
use crate::gpu::TextureObject;

/// Outcome of one sample attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sample {
    /// The texture is resident; sample this object.
    Resident(TextureObject),
    /// Miss recorded (or ring saturated); use the fallback color.
    Miss,
    /// ID out of range; use the fallback color. Nothing recorded.
    OutOfRange,
}

/// Residency test against the packed bitmap.
///
/// # Safety
/// `ctx` pointers must be host-visible and live (mock runtime, or mapped
/// device memory), with `flag_word_count(max_textures)` words behind
/// `resident_flags`.
pub unsafe fn is_texture_resident(ctx: &DeviceContext, id: u32) -> bool {
    if id >= ctx.max_textures {
        return false;
    }
    let words = ctx.resident_flags.0 as *const AtomicU32;
    let word = &*words.add((id / 32) as usize);
    word.load(Ordering::Relaxed) & (1 << (id % 32)) != 0
}

/// Append a miss to the request ring; sets the sticky overflow flag when
/// the ring is saturated. The append counter keeps incrementing past the
/// ring capacity (excess IDs are dropped), so the host can report how many
/// misses a saturated frame actually produced.
///
/// # Safety
/// As [`is_texture_resident`]; additionally `requests` must point at
/// `max_requests` writable words and `request_count`/`request_overflow` at
/// one word each.
pub unsafe fn record_texture_request(ctx: &DeviceContext, id: u32) {
    let count = &*(ctx.request_count.0 as *const AtomicU32);
    let idx = count.fetch_add(1, Ordering::Relaxed);
    if idx < ctx.max_requests {
        let slot = &*(ctx.requests.0 as *const AtomicU32).add(idx as usize);
        slot.store(id, Ordering::Relaxed);
    } else {
        let overflow = &*(ctx.request_overflow.0 as *const AtomicU32);
        overflow.store(1, Ordering::Relaxed);
    }
}

/// One sample: residency check, miss recording, or the resident object.
///
/// # Safety
/// As [`record_texture_request`]; additionally `textures` must point at
/// `max_textures` 64-bit handles.
pub unsafe fn sample_or_request(ctx: &DeviceContext, id: u32) -> Sample {
    if id >= ctx.max_textures {
        return Sample::OutOfRange;
    }
    if !is_texture_resident(ctx, id) {
        record_texture_request(ctx, id);
        return Sample::Miss;
    }
    let handles = ctx.textures.0 as *const u64;
    Sample::Resident(TextureObject(*handles.add(id as usize)))
}
