//! Pluggable image sources.
//!
//! An [`ImageSource`] hands the loader decoded mip levels plus enough
//! metadata to size GPU allocations up front. Sources are fallible in every
//! operation; the loader catches the error at each call site and maps it to
//! a status code — nothing a source does can panic the engine.
//!
//! [`FileImageSource`] is the built-in backend over the `image` crate. It
//! probes dimensions cheaply on open and, on the first level read, decodes
//! the whole image once and caches the complete box-filtered mip pyramid in
//! memory; later reads are plain copies.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use xxhash_rust::xxh3::xxh3_64;

use crate::mipmap;

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Per-channel storage type of a source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    #[default]
    U8,
    U16,
    F16,
    F32,
}

/// Bytes per channel for a [`PixelFormat`].
#[inline]
pub fn bytes_per_channel(format: PixelFormat) -> u32 {
    match format {
        PixelFormat::U8 => 1,
        PixelFormat::U16 | PixelFormat::F16 => 2,
        PixelFormat::F32 => 4,
    }
}

/// Image metadata reported by [`ImageSource::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TextureInfo {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub num_channels: u32,
    pub num_mip_levels: u32,
    pub is_valid: bool,
}

/// Total bytes across all mip levels the source can serve.
pub fn texture_size_in_bytes(info: &TextureInfo) -> usize {
    if !info.is_valid {
        return 0;
    }
    let bpp = (bytes_per_channel(info.format) * info.num_channels) as usize;
    let mut total = 0usize;
    let (mut w, mut h) = (info.width as usize, info.height as usize);
    for _ in 0..info.num_mip_levels {
        total += w * h * bpp;
        w = (w / 2).max(1);
        h = (h / 2).max(1);
    }
    total
}

// ---------------------------------------------------------------------------
// Source trait
// ---------------------------------------------------------------------------

/// A mipmapped image reader. All methods are thread-safe.
pub trait ImageSource: Send + Sync {
    /// Open the image and return header info. Idempotent once open.
    fn open(&self) -> Result<TextureInfo>;

    /// Drop any cached pixel data and mark the source closed.
    fn close(&self);

    fn is_open(&self) -> bool;

    /// Metadata captured by the last successful [`open`](Self::open).
    fn info(&self) -> TextureInfo;

    /// Read one mip level into `dest` (native channel count, interleaved).
    /// Fails when the expected extent does not match the level.
    fn read_mip_level(
        &self,
        dest: &mut [u8],
        level: u32,
        expected_width: u32,
        expected_height: u32,
    ) -> Result<()>;

    /// Normalized RGBA of the 1x1 level, when available.
    fn read_base_color(&self) -> Option<[f32; 4]> {
        None
    }

    /// Bytes decoded from the underlying medium so far.
    fn bytes_read(&self) -> u64 {
        0
    }

    /// Time spent decoding so far.
    fn read_time(&self) -> Duration {
        Duration::ZERO
    }

    /// 64-bit content identifier for deduplication; `0` opts out.
    /// Two sources reporting the same non-zero hash are assumed to produce
    /// identical pixels.
    fn content_hash(&self) -> u64 {
        0
    }
}

// ---------------------------------------------------------------------------
// File-backed source
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FileState {
    open: bool,
    info: TextureInfo,
    /// Cached pyramid, level 0 first, native channel count.
    levels: Vec<Vec<u8>>,
    bytes_read: u64,
    read_time: Duration,
}

/// Image source decoding through the `image` crate, with whole-pyramid
/// in-memory caching after the first read.
pub struct FileImageSource {
    path: PathBuf,
    state: Mutex<FileState>,
}

impl FileImageSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(FileState::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Decode the base image and build the full pyramid. Requires `open`.
    fn load_pyramid(&self, state: &mut FileState) -> Result<()> {
        let start = Instant::now();
        let img = image::open(&self.path)
            .with_context(|| format!("failed to decode {}", self.path.display()))?;
        let rgba = img.to_rgba8();
        let (w, h) = (rgba.width(), rgba.height());
        if w != state.info.width || h != state.info.height {
            bail!(
                "{}: decoded extent {}x{} does not match probed {}x{}",
                self.path.display(),
                w,
                h,
                state.info.width,
                state.info.height
            );
        }

        let base = rgba.into_raw();
        state.bytes_read += base.len() as u64;
        state.levels = Vec::with_capacity(state.info.num_mip_levels as usize);
        state.levels.push(base);

        let (mut lw, mut lh) = (w, h);
        for _ in 1..state.info.num_mip_levels {
            let (nw, nh) = ((lw / 2).max(1), (lh / 2).max(1));
            let mut next = vec![0u8; (nw as usize) * (nh as usize) * 4];
            mipmap::downsample_box(state.levels.last().unwrap(), lw, lh, &mut next, nw, nh, 4);
            state.levels.push(next);
            (lw, lh) = (nw, nh);
        }

        state.read_time += start.elapsed();
        Ok(())
    }
}

impl ImageSource for FileImageSource {
    fn open(&self) -> Result<TextureInfo> {
        let mut state = self.state.lock();
        if state.open {
            return Ok(state.info);
        }

        let start = Instant::now();
        let (w, h) = image::image_dimensions(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        state.info = TextureInfo {
            width: w,
            height: h,
            format: PixelFormat::U8,
            // Levels are always served as RGBA8.
            num_channels: 4,
            num_mip_levels: mipmap::mip_level_count(w, h),
            is_valid: true,
        };
        state.open = true;
        state.read_time += start.elapsed();
        Ok(state.info)
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.levels.clear();
        state.open = false;
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    fn info(&self) -> TextureInfo {
        self.state.lock().info
    }

    fn read_mip_level(
        &self,
        dest: &mut [u8],
        level: u32,
        expected_width: u32,
        expected_height: u32,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if !state.open {
            bail!("{}: source is not open", self.path.display());
        }
        if level >= state.info.num_mip_levels {
            bail!("{}: mip level {} out of range", self.path.display(), level);
        }
        if state.levels.is_empty() {
            self.load_pyramid(&mut state)?;
        }

        let (w, h) = mipmap::level_extent(state.info.width, state.info.height, level);
        if w != expected_width || h != expected_height {
            bail!(
                "{}: level {} is {}x{}, caller expected {}x{}",
                self.path.display(),
                level,
                w,
                h,
                expected_width,
                expected_height
            );
        }

        let data = &state.levels[level as usize];
        if dest.len() < data.len() {
            bail!("{}: destination too small for level {}", self.path.display(), level);
        }
        dest[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_base_color(&self) -> Option<[f32; 4]> {
        let mut state = self.state.lock();
        if !state.open {
            return None;
        }
        if state.levels.is_empty() && self.load_pyramid(&mut state).is_err() {
            return None;
        }
        let last = state.levels.last()?;
        Some([
            last[0] as f32 / 255.0,
            last[1] as f32 / 255.0,
            last[2] as f32 / 255.0,
            last[3] as f32 / 255.0,
        ])
    }

    fn bytes_read(&self) -> u64 {
        self.state.lock().bytes_read
    }

    fn read_time(&self) -> Duration {
        self.state.lock().read_time
    }

    fn content_hash(&self) -> u64 {
        xxh3_64(self.path.to_string_lossy().as_bytes())
    }
}

impl fmt::Debug for FileImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileImageSource")
            .field("path", &self.path)
            .field("open", &self.is_open())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// In-memory source
// ---------------------------------------------------------------------------

/// Image source over caller-supplied pixels. Useful for procedural content
/// and for wiring tests without touching the filesystem.
pub struct RawImageSource {
    width: u32,
    height: u32,
    channels: u32,
    hash: u64,
    state: Mutex<FileState>,
    pixels: Vec<u8>,
}

impl RawImageSource {
    /// `pixels` is `width * height * channels` interleaved bytes.
    /// `hash` of 0 opts out of content deduplication.
    pub fn new(pixels: Vec<u8>, width: u32, height: u32, channels: u32, hash: u64) -> Self {
        Self {
            width,
            height,
            channels,
            hash,
            state: Mutex::new(FileState::default()),
            pixels,
        }
    }

    /// Convenience: hash the pixel bytes for content dedup.
    pub fn with_content_hash(pixels: Vec<u8>, width: u32, height: u32, channels: u32) -> Self {
        let hash = xxh3_64(&pixels);
        Self::new(pixels, width, height, channels, hash)
    }
}

impl ImageSource for RawImageSource {
    fn open(&self) -> Result<TextureInfo> {
        let mut state = self.state.lock();
        if state.open {
            return Ok(state.info);
        }
        let expected = (self.width as usize) * (self.height as usize) * self.channels as usize;
        if self.width == 0 || self.height == 0 || self.pixels.len() < expected {
            bail!(
                "raw source: {} bytes for {}x{}x{}",
                self.pixels.len(),
                self.width,
                self.height,
                self.channels
            );
        }
        state.info = TextureInfo {
            width: self.width,
            height: self.height,
            format: PixelFormat::U8,
            num_channels: self.channels,
            num_mip_levels: mipmap::mip_level_count(self.width, self.height),
            is_valid: true,
        };
        state.open = true;
        Ok(state.info)
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.levels.clear();
        state.open = false;
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    fn info(&self) -> TextureInfo {
        self.state.lock().info
    }

    fn read_mip_level(
        &self,
        dest: &mut [u8],
        level: u32,
        expected_width: u32,
        expected_height: u32,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if !state.open {
            bail!("raw source is not open");
        }
        if level >= state.info.num_mip_levels {
            bail!("raw source: mip level {level} out of range");
        }
        if state.levels.is_empty() {
            let expected = (self.width as usize) * (self.height as usize) * self.channels as usize;
            let mut levels = Vec::with_capacity(state.info.num_mip_levels as usize);
            levels.push(self.pixels[..expected].to_vec());
            let (mut lw, mut lh) = (self.width, self.height);
            for _ in 1..state.info.num_mip_levels {
                let (nw, nh) = ((lw / 2).max(1), (lh / 2).max(1));
                let mut next = vec![0u8; (nw as usize) * (nh as usize) * self.channels as usize];
                mipmap::downsample_box(levels.last().unwrap(), lw, lh, &mut next, nw, nh, self.channels);
                levels.push(next);
                (lw, lh) = (nw, nh);
            }
            state.bytes_read += expected as u64;
            state.levels = levels;
        }

        let (w, h) = mipmap::level_extent(self.width, self.height, level);
        if w != expected_width || h != expected_height {
            bail!("raw source: level {level} is {w}x{h}, caller expected {expected_width}x{expected_height}");
        }
        let data = &state.levels[level as usize];
        if dest.len() < data.len() {
            bail!("raw source: destination too small for level {level}");
        }
        dest[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_base_color(&self) -> Option<[f32; 4]> {
        let state = self.state.lock();
        let last = state.levels.last()?;
        let c = self.channels as usize;
        let lum = |i: usize| last.get(i).copied().unwrap_or(0) as f32 / 255.0;
        let r = lum(0);
        Some([
            r,
            if c > 1 { lum(1) } else { r },
            if c > 2 { lum(2) } else { r },
            if c > 3 { lum(3) } else { 1.0 },
        ])
    }

    fn bytes_read(&self) -> u64 {
        self.state.lock().bytes_read
    }

    fn content_hash(&self) -> u64 {
        self.hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_png(dir: &tempfile::TempDir, name: &str, w: u32, h: u32, rgba: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let img = image::RgbaImage::from_raw(w, h, rgba.to_vec()).unwrap();
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn open_probes_without_decoding() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(&dir, "t.png", 4, 2, &[128u8; 4 * 2 * 4]);

        let src = FileImageSource::new(&path);
        assert!(!src.is_open());
        let info = src.open().unwrap();
        assert!(info.is_valid);
        assert_eq!((info.width, info.height), (4, 2));
        assert_eq!(info.num_channels, 4);
        assert_eq!(info.num_mip_levels, 3);
        assert_eq!(src.bytes_read(), 0); // header probe only

        // idempotent
        assert_eq!(src.open().unwrap(), info);
    }

    #[test]
    fn read_levels_and_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut rgba = vec![0u8; 4 * 4 * 4];
        for px in rgba.chunks_mut(4) {
            px.copy_from_slice(&[200, 100, 40, 255]);
        }
        let path = write_png(&dir, "t.png", 4, 4, &rgba);

        let src = FileImageSource::new(&path);
        src.open().unwrap();

        let mut base = vec![0u8; 4 * 4 * 4];
        src.read_mip_level(&mut base, 0, 4, 4).unwrap();
        assert_eq!(&base, &rgba);
        let after_first = src.bytes_read();
        assert_eq!(after_first, (4 * 4 * 4) as u64);

        // constant image stays constant down the pyramid
        let mut tiny = vec![0u8; 4];
        src.read_mip_level(&mut tiny, 2, 1, 1).unwrap();
        assert_eq!(tiny, vec![200, 100, 40, 255]);
        // second read served from cache
        assert_eq!(src.bytes_read(), after_first);

        // wrong expected extent is rejected
        assert!(src.read_mip_level(&mut tiny, 2, 2, 2).is_err());

        let base_color = src.read_base_color().unwrap();
        assert!((base_color[0] - 200.0 / 255.0).abs() < 1e-6);
        assert!((base_color[3] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn missing_file_fails_open() {
        let src = FileImageSource::new("/nonexistent/nope.png");
        assert!(src.open().is_err());
        assert!(!src.is_open());
    }

    #[test]
    fn corrupt_file_fails_read_not_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.png");
        std::fs::File::create(&path).unwrap().write_all(b"not a png").unwrap();
        let src = FileImageSource::new(&path);
        assert!(src.open().is_err());
    }

    #[test]
    fn content_hash_tracks_filename() {
        let a = FileImageSource::new("a.png");
        let a2 = FileImageSource::new("a.png");
        let b = FileImageSource::new("b.png");
        assert_eq!(a.content_hash(), a2.content_hash());
        assert_ne!(a.content_hash(), b.content_hash());
        assert_ne!(a.content_hash(), 0);
    }

    #[test]
    fn raw_source_serves_native_channels() {
        let src = RawImageSource::with_content_hash(vec![10, 20, 30, 40, 50, 60], 2, 1, 3);
        let info = src.open().unwrap();
        assert_eq!(info.num_channels, 3);
        assert_eq!(info.num_mip_levels, 2);

        let mut base = vec![0u8; 6];
        src.read_mip_level(&mut base, 0, 2, 1).unwrap();
        assert_eq!(base, vec![10, 20, 30, 40, 50, 60]);

        let mut l1 = vec![0u8; 3];
        src.read_mip_level(&mut l1, 1, 1, 1).unwrap();
        // box average of [10,20,30] and [40,50,60]
        assert_eq!(l1, vec![25, 35, 45]);

        assert_ne!(src.content_hash(), 0);
        let same = RawImageSource::with_content_hash(vec![10, 20, 30, 40, 50, 60], 2, 1, 3);
        assert_eq!(src.content_hash(), same.content_hash());
    }

    #[test]
    fn raw_source_rejects_short_buffer() {
        let src = RawImageSource::new(vec![0u8; 3], 2, 2, 4, 0);
        assert!(src.open().is_err());
    }

    #[test]
    fn size_helpers() {
        let info = TextureInfo {
            width: 8,
            height: 8,
            format: PixelFormat::U8,
            num_channels: 4,
            num_mip_levels: 4,
            is_valid: true,
        };
        assert_eq!(texture_size_in_bytes(&info), 340);
        assert_eq!(texture_size_in_bytes(&TextureInfo::default()), 0);
        assert_eq!(bytes_per_channel(PixelFormat::U16), 2);
        assert_eq!(bytes_per_channel(PixelFormat::F32), 4);
    }
}
