//! Host-side mip math: level counts, chain sizing, box-filter downsampling,
//! and channel expansion to RGBA8.
//!
//! Downsampling is a 2x2 box filter. For odd source dimensions the kernel
//! taps that fall outside the source are dropped and the sum is divided by
//! the number of contributing taps (at most 4, at least 1), so a 5x3 level
//! reduces to a 2x1 level of partial-kernel averages.

/// Full mip-chain depth down to 1x1.
#[inline]
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    let mut levels = 1;
    let (mut w, mut h) = (width, height);
    while w > 1 || h > 1 {
        w = (w / 2).max(1);
        h = (h / 2).max(1);
        levels += 1;
    }
    levels
}

/// Dimensions of `level` given a base extent.
#[inline]
pub fn level_extent(width: u32, height: u32, level: u32) -> (u32, u32) {
    ((width >> level).max(1), (height >> level).max(1))
}

/// Total bytes of a full mip chain, base level included.
///
/// This is the byte count charged to the memory budget for mipmapped
/// textures and converges on `base * 4/3` for square powers of two.
pub fn mip_chain_bytes(width: u32, height: u32, bytes_per_pixel: usize) -> usize {
    let (mut w, mut h) = (width as usize, height as usize);
    let mut total = w * h * bytes_per_pixel;
    while w > 1 || h > 1 {
        w = (w / 2).max(1);
        h = (h / 2).max(1);
        total += w * h * bytes_per_pixel;
    }
    total
}

/// Box-filter `src` (sw x sh) into `dst` (dw x dh), `channels` interleaved
/// bytes per pixel.
///
/// `dw`/`dh` must be the half-extent of `sw`/`sh` (clamped to 1).
pub fn downsample_box(src: &[u8], sw: u32, sh: u32, dst: &mut [u8], dw: u32, dh: u32, channels: u32) {
    let ch = channels as usize;
    debug_assert_eq!(src.len(), (sw as usize) * (sh as usize) * ch);
    debug_assert_eq!(dst.len(), (dw as usize) * (dh as usize) * ch);
    debug_assert_eq!(dw, (sw / 2).max(1));
    debug_assert_eq!(dh, (sh / 2).max(1));

    for y in 0..dh {
        for x in 0..dw {
            let sx = x * 2;
            let sy = y * 2;
            for c in 0..ch {
                let mut sum = 0u32;
                let mut taps = 0u32;
                for dy in 0..2u32 {
                    if sy + dy >= sh {
                        break;
                    }
                    for dx in 0..2u32 {
                        if sx + dx >= sw {
                            break;
                        }
                        let idx = ((sy + dy) * sw + (sx + dx)) as usize * ch + c;
                        sum += src[idx] as u32;
                        taps += 1;
                    }
                }
                dst[(y * dw + x) as usize * ch + c] = (sum / taps) as u8;
            }
        }
    }
}

/// Expand 1- or 3-channel interleaved pixels to RGBA8 with alpha 255.
/// 4-channel input is copied through unchanged.
pub fn expand_to_rgba8(src: &[u8], width: u32, height: u32, channels: u32) -> Option<Vec<u8>> {
    let pixels = (width as usize) * (height as usize);
    if src.len() < pixels * channels as usize {
        return None;
    }
    match channels {
        4 => Some(src[..pixels * 4].to_vec()),
        1 => {
            let mut out = vec![255u8; pixels * 4];
            for (i, &g) in src[..pixels].iter().enumerate() {
                out[i * 4] = g;
                out[i * 4 + 1] = g;
                out[i * 4 + 2] = g;
            }
            Some(out)
        }
        3 => {
            let mut out = vec![255u8; pixels * 4];
            for i in 0..pixels {
                out[i * 4] = src[i * 3];
                out[i * 4 + 1] = src[i * 3 + 1];
                out[i * 4 + 2] = src[i * 3 + 2];
            }
            Some(out)
        }
        _ => None,
    }
}
