//! Host-memory mock of [`GpuRuntime`].
//!
//! Device allocations, pinned allocations, and arrays are plain host memory;
//! every enqueued copy or memset executes eagerly, so streams and events are
//! bookkeeping only and all synchronization points trivially hold. Because
//! the device pointers it hands out are real host addresses, the sampling
//! shim can exercise the device-side request protocol with real atomics.
//!
//! The mock is deliberately strict: out-of-range copies, unknown handles,
//! and double frees are reported as errors rather than ignored, so tests
//! catch resource-management bugs that a permissive stub would hide.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ptr::NonNull;

use parking_lot::Mutex;

use super::{
    ArrayHandle, DevicePtr, Event, GpuError, GpuResult, GpuRuntime, MipArrayHandle, Stream,
    TexResource, TextureObject, TextureObjectDesc,
};

const HOST_ALLOC_ALIGN: usize = 4096;

struct MockArray {
    width: u32,
    height: u32,
    data: Vec<u8>,
    /// Levels of a mipmapped array are freed through the parent only.
    owned_by_mip: bool,
}

struct MockTexture {
    resource: TexResource,
    #[allow(dead_code)]
    desc: TextureObjectDesc,
}

#[derive(Default)]
struct Inner {
    /// base address -> allocation backing store
    device: BTreeMap<u64, Box<[u8]>>,
    /// pinned host allocations: address -> len
    hosts: HashMap<usize, usize>,
    arrays: HashMap<u64, MockArray>,
    mips: HashMap<u64, Vec<u64>>,
    textures: HashMap<u64, MockTexture>,
    streams: HashSet<u64>,
    events: HashSet<u64>,
    next_handle: u64,
}

impl Inner {
    fn fresh_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    /// Resolve `ptr..ptr+len` to a host pointer inside one device allocation.
    fn resolve(&mut self, ptr: DevicePtr, len: usize) -> GpuResult<*mut u8> {
        let addr = ptr.0;
        let (&base, data) = self
            .device
            .range_mut(..=addr)
            .next_back()
            .ok_or(GpuError::InvalidValue)?;
        let offset = (addr - base) as usize;
        if offset + len > data.len() {
            return Err(GpuError::InvalidValue);
        }
        Ok(unsafe { data.as_mut_ptr().add(offset) })
    }
}

/// In-process [`GpuRuntime`] for tests and GPU-less development.
#[derive(Default)]
pub struct MockGpu {
    inner: Mutex<Inner>,
}

impl MockGpu {
    pub fn new() -> Self {
        Self::default()
    }

    // --- test-facing introspection ---------------------------------------

    /// Copy device memory into `dst` (bounds-checked).
    pub fn read_device(&self, src: DevicePtr, dst: &mut [u8]) -> GpuResult<()> {
        let mut inner = self.inner.lock();
        let ptr = inner.resolve(src, dst.len())?;
        unsafe { std::ptr::copy_nonoverlapping(ptr, dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    /// RGBA8 texel of one level of a texture object's backing resource.
    pub fn read_texel(&self, tex: TextureObject, level: u32, x: u32, y: u32) -> Option<[u8; 4]> {
        let inner = self.inner.lock();
        let array_id = Self::level_array_id(&inner, tex, level)?;
        let array = inner.arrays.get(&array_id)?;
        if x >= array.width || y >= array.height {
            return None;
        }
        let idx = ((y * array.width + x) * 4) as usize;
        Some([
            array.data[idx],
            array.data[idx + 1],
            array.data[idx + 2],
            array.data[idx + 3],
        ])
    }

    /// `(width, height)` of one level of a texture object's resource.
    pub fn texture_extent(&self, tex: TextureObject, level: u32) -> Option<(u32, u32)> {
        let inner = self.inner.lock();
        let array_id = Self::level_array_id(&inner, tex, level)?;
        inner.arrays.get(&array_id).map(|a| (a.width, a.height))
    }

    /// Number of levels behind a texture object (1 for flat arrays).
    pub fn texture_level_count(&self, tex: TextureObject) -> Option<u32> {
        let inner = self.inner.lock();
        match inner.textures.get(&tex.0)?.resource {
            TexResource::Array(_) => Some(1),
            TexResource::Mipmapped(m) => inner.mips.get(&m.0).map(|l| l.len() as u32),
        }
    }

    pub fn live_device_allocs(&self) -> usize {
        self.inner.lock().device.len()
    }

    pub fn live_host_allocs(&self) -> usize {
        self.inner.lock().hosts.len()
    }

    pub fn live_arrays(&self) -> usize {
        self.inner.lock().arrays.len()
    }

    pub fn live_texture_objects(&self) -> usize {
        self.inner.lock().textures.len()
    }

    pub fn live_events(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn live_streams(&self) -> usize {
        self.inner.lock().streams.len()
    }

    fn level_array_id(inner: &Inner, tex: TextureObject, level: u32) -> Option<u64> {
        match inner.textures.get(&tex.0)?.resource {
            TexResource::Array(a) => (level == 0).then_some(a.0),
            TexResource::Mipmapped(m) => inner.mips.get(&m.0)?.get(level as usize).copied(),
        }
    }

    fn check_stream(inner: &Inner, stream: Stream) -> GpuResult<()> {
        if stream == Stream::DEFAULT || inner.streams.contains(&stream.0) {
            Ok(())
        } else {
            Err(GpuError::InvalidHandle)
        }
    }
}

impl GpuRuntime for MockGpu {
    fn create_stream(&self, _non_blocking: bool) -> GpuResult<Stream> {
        let mut inner = self.inner.lock();
        let id = inner.fresh_handle();
        inner.streams.insert(id);
        Ok(Stream(id))
    }

    fn destroy_stream(&self, stream: Stream) -> GpuResult<()> {
        let mut inner = self.inner.lock();
        if inner.streams.remove(&stream.0) {
            Ok(())
        } else {
            Err(GpuError::InvalidHandle)
        }
    }

    fn synchronize_stream(&self, stream: Stream) -> GpuResult<()> {
        Self::check_stream(&self.inner.lock(), stream)
    }

    fn create_event(&self) -> GpuResult<Event> {
        let mut inner = self.inner.lock();
        let id = inner.fresh_handle();
        inner.events.insert(id);
        Ok(Event(id))
    }

    fn destroy_event(&self, event: Event) -> GpuResult<()> {
        let mut inner = self.inner.lock();
        if inner.events.remove(&event.0) {
            Ok(())
        } else {
            Err(GpuError::InvalidHandle)
        }
    }

    fn record_event(&self, event: Event, stream: Stream) -> GpuResult<()> {
        let inner = self.inner.lock();
        if !inner.events.contains(&event.0) {
            return Err(GpuError::InvalidHandle);
        }
        Self::check_stream(&inner, stream)
    }

    fn synchronize_event(&self, event: Event) -> GpuResult<()> {
        if self.inner.lock().events.contains(&event.0) {
            Ok(())
        } else {
            Err(GpuError::InvalidHandle)
        }
    }

    fn stream_wait_event(&self, stream: Stream, event: Event) -> GpuResult<()> {
        let inner = self.inner.lock();
        if !inner.events.contains(&event.0) {
            return Err(GpuError::InvalidHandle);
        }
        Self::check_stream(&inner, stream)
    }

    fn device_alloc(&self, len: usize) -> GpuResult<DevicePtr> {
        if len == 0 {
            return Err(GpuError::InvalidValue);
        }
        let mut inner = self.inner.lock();
        let data = vec![0u8; len].into_boxed_slice();
        let addr = data.as_ptr() as u64;
        inner.device.insert(addr, data);
        Ok(DevicePtr(addr))
    }

    fn device_free(&self, ptr: DevicePtr) -> GpuResult<()> {
        let mut inner = self.inner.lock();
        if inner.device.remove(&ptr.0).is_some() {
            Ok(())
        } else {
            Err(GpuError::InvalidHandle)
        }
    }

    fn memset_async(&self, dst: DevicePtr, value: u8, len: usize, stream: Stream) -> GpuResult<()> {
        let mut inner = self.inner.lock();
        Self::check_stream(&inner, stream)?;
        let ptr = inner.resolve(dst, len)?;
        unsafe { std::ptr::write_bytes(ptr, value, len) };
        Ok(())
    }

    unsafe fn memcpy_htod_async(
        &self,
        dst: DevicePtr,
        src: *const u8,
        len: usize,
        stream: Stream,
    ) -> GpuResult<()> {
        let mut inner = self.inner.lock();
        Self::check_stream(&inner, stream)?;
        let ptr = inner.resolve(dst, len)?;
        std::ptr::copy_nonoverlapping(src, ptr, len);
        Ok(())
    }

    unsafe fn memcpy_dtoh_async(
        &self,
        dst: *mut u8,
        src: DevicePtr,
        len: usize,
        stream: Stream,
    ) -> GpuResult<()> {
        let mut inner = self.inner.lock();
        Self::check_stream(&inner, stream)?;
        let ptr = inner.resolve(src, len)?;
        std::ptr::copy_nonoverlapping(ptr, dst, len);
        Ok(())
    }

    fn host_alloc(&self, len: usize) -> GpuResult<NonNull<u8>> {
        if len == 0 {
            return Err(GpuError::InvalidValue);
        }
        let layout =
            Layout::from_size_align(len, HOST_ALLOC_ALIGN).map_err(|_| GpuError::InvalidValue)?;
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(GpuError::OutOfMemory)?;
        self.inner.lock().hosts.insert(ptr.as_ptr() as usize, len);
        Ok(ptr)
    }

    unsafe fn host_free(&self, ptr: NonNull<u8>, len: usize) {
        let removed = self.inner.lock().hosts.remove(&(ptr.as_ptr() as usize));
        debug_assert_eq!(removed, Some(len), "host_free of unknown pinned buffer");
        let layout = Layout::from_size_align(len, HOST_ALLOC_ALIGN).expect("valid pinned layout");
        dealloc(ptr.as_ptr(), layout);
    }

    fn alloc_array(&self, width: u32, height: u32) -> GpuResult<ArrayHandle> {
        if width == 0 || height == 0 {
            return Err(GpuError::InvalidValue);
        }
        let mut inner = self.inner.lock();
        let id = inner.fresh_handle();
        inner.arrays.insert(
            id,
            MockArray {
                width,
                height,
                data: vec![0u8; width as usize * height as usize * 4],
                owned_by_mip: false,
            },
        );
        Ok(ArrayHandle(id))
    }

    fn free_array(&self, array: ArrayHandle) -> GpuResult<()> {
        let mut inner = self.inner.lock();
        match inner.arrays.get(&array.0) {
            Some(a) if a.owned_by_mip => Err(GpuError::InvalidValue),
            Some(_) => {
                inner.arrays.remove(&array.0);
                Ok(())
            }
            None => Err(GpuError::InvalidHandle),
        }
    }

    fn alloc_mipmapped_array(&self, width: u32, height: u32, levels: u32) -> GpuResult<MipArrayHandle> {
        if width == 0 || height == 0 || levels == 0 {
            return Err(GpuError::InvalidValue);
        }
        let mut inner = self.inner.lock();
        let mut level_ids = Vec::with_capacity(levels as usize);
        let (mut w, mut h) = (width, height);
        for _ in 0..levels {
            let id = inner.fresh_handle();
            inner.arrays.insert(
                id,
                MockArray {
                    width: w,
                    height: h,
                    data: vec![0u8; w as usize * h as usize * 4],
                    owned_by_mip: true,
                },
            );
            level_ids.push(id);
            w = (w / 2).max(1);
            h = (h / 2).max(1);
        }
        let mip_id = inner.fresh_handle();
        inner.mips.insert(mip_id, level_ids);
        Ok(MipArrayHandle(mip_id))
    }

    fn mip_level_array(&self, mip: MipArrayHandle, level: u32) -> GpuResult<ArrayHandle> {
        let inner = self.inner.lock();
        let levels = inner.mips.get(&mip.0).ok_or(GpuError::InvalidHandle)?;
        levels
            .get(level as usize)
            .copied()
            .map(ArrayHandle)
            .ok_or(GpuError::InvalidValue)
    }

    fn free_mipmapped_array(&self, mip: MipArrayHandle) -> GpuResult<()> {
        let mut inner = self.inner.lock();
        let levels = inner.mips.remove(&mip.0).ok_or(GpuError::InvalidHandle)?;
        for id in levels {
            inner.arrays.remove(&id);
        }
        Ok(())
    }

    unsafe fn upload_array(
        &self,
        array: ArrayHandle,
        src: *const u8,
        row_bytes: usize,
        rows: usize,
    ) -> GpuResult<()> {
        let mut inner = self.inner.lock();
        let a = inner.arrays.get_mut(&array.0).ok_or(GpuError::InvalidHandle)?;
        if row_bytes != (a.width * 4) as usize || rows != a.height as usize {
            return Err(GpuError::InvalidValue);
        }
        std::ptr::copy_nonoverlapping(src, a.data.as_mut_ptr(), row_bytes * rows);
        Ok(())
    }

    fn create_texture_object(
        &self,
        resource: TexResource,
        desc: &TextureObjectDesc,
    ) -> GpuResult<TextureObject> {
        let mut inner = self.inner.lock();
        let valid = match resource {
            TexResource::Array(a) => inner.arrays.contains_key(&a.0),
            TexResource::Mipmapped(m) => inner.mips.contains_key(&m.0),
        };
        if !valid {
            return Err(GpuError::InvalidHandle);
        }
        let id = inner.fresh_handle();
        inner.textures.insert(id, MockTexture { resource, desc: *desc });
        Ok(TextureObject(id))
    }

    fn destroy_texture_object(&self, tex: TextureObject) -> GpuResult<()> {
        let mut inner = self.inner.lock();
        if inner.textures.remove(&tex.0).is_some() {
            Ok(())
        } else {
            Err(GpuError::InvalidHandle)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{AddressMode, FilterMode};

    #[test]
    fn device_roundtrip_and_bounds() {
        let gpu = MockGpu::new();
        let ptr = gpu.device_alloc(16).unwrap();
        let src = [7u8; 16];
        unsafe { gpu.memcpy_htod_async(ptr, src.as_ptr(), 16, Stream::DEFAULT).unwrap() };

        let mut back = [0u8; 8];
        unsafe { gpu.memcpy_dtoh_async(back.as_mut_ptr(), ptr.add(8), 8, Stream::DEFAULT).unwrap() };
        assert_eq!(back, [7u8; 8]);

        // one past the end
        let err = unsafe { gpu.memcpy_dtoh_async(back.as_mut_ptr(), ptr.add(9), 8, Stream::DEFAULT) };
        assert_eq!(err, Err(GpuError::InvalidValue));

        gpu.device_free(ptr).unwrap();
        assert_eq!(gpu.device_free(ptr), Err(GpuError::InvalidHandle));
        assert_eq!(gpu.live_device_allocs(), 0);
    }

    #[test]
    fn memset_zeroes_exact_range() {
        let gpu = MockGpu::new();
        let ptr = gpu.device_alloc(8).unwrap();
        let ones = [1u8; 8];
        unsafe { gpu.memcpy_htod_async(ptr, ones.as_ptr(), 8, Stream::DEFAULT).unwrap() };
        gpu.memset_async(ptr, 0, 4, Stream::DEFAULT).unwrap();
        let mut back = [9u8; 8];
        gpu.read_device(ptr, &mut back).unwrap();
        assert_eq!(back, [0, 0, 0, 0, 1, 1, 1, 1]);
        gpu.device_free(ptr).unwrap();
    }

    #[test]
    fn mipmapped_array_levels_halve() {
        let gpu = MockGpu::new();
        let mip = gpu.alloc_mipmapped_array(8, 4, 4).unwrap();
        let l0 = gpu.mip_level_array(mip, 0).unwrap();
        let l3 = gpu.mip_level_array(mip, 3).unwrap();
        assert_ne!(l0, l3);
        assert!(gpu.mip_level_array(mip, 4).is_err());

        // level arrays cannot be freed individually
        assert_eq!(gpu.free_array(l0), Err(GpuError::InvalidValue));

        let tex = gpu
            .create_texture_object(TexResource::Mipmapped(mip), &TextureObjectDesc {
                address_mode: [AddressMode::Wrap; 2],
                filter_mode: FilterMode::Linear,
                mipmap_filter_mode: FilterMode::Linear,
                normalized_coords: true,
                srgb: false,
                mip_level_clamp: Some((0.0, 3.0)),
            })
            .unwrap();
        assert_eq!(gpu.texture_level_count(tex), Some(4));
        assert_eq!(gpu.texture_extent(tex, 0), Some((8, 4)));
        assert_eq!(gpu.texture_extent(tex, 3), Some((1, 1)));

        gpu.destroy_texture_object(tex).unwrap();
        gpu.free_mipmapped_array(mip).unwrap();
        assert_eq!(gpu.live_arrays(), 0);
    }

    #[test]
    fn upload_and_read_texel() {
        let gpu = MockGpu::new();
        let arr = gpu.alloc_array(2, 2).unwrap();
        let px: [u8; 16] = [
            255, 0, 0, 255, //
            0, 255, 0, 255, //
            0, 0, 255, 255, //
            255, 255, 255, 255,
        ];
        unsafe { gpu.upload_array(arr, px.as_ptr(), 8, 2).unwrap() };
        let tex = gpu
            .create_texture_object(TexResource::Array(arr), &TextureObjectDesc {
                address_mode: [AddressMode::Clamp; 2],
                filter_mode: FilterMode::Point,
                mipmap_filter_mode: FilterMode::Point,
                normalized_coords: false,
                srgb: false,
                mip_level_clamp: None,
            })
            .unwrap();
        assert_eq!(gpu.read_texel(tex, 0, 0, 0), Some([255, 0, 0, 255]));
        assert_eq!(gpu.read_texel(tex, 0, 1, 1), Some([255, 255, 255, 255]));
        assert_eq!(gpu.read_texel(tex, 0, 2, 0), None);
        gpu.destroy_texture_object(tex).unwrap();
        gpu.free_array(arr).unwrap();
    }

    #[test]
    fn pinned_alloc_is_tracked() {
        let gpu = MockGpu::new();
        let p = gpu.host_alloc(64).unwrap();
        assert_eq!(gpu.live_host_allocs(), 1);
        unsafe { gpu.host_free(p, 64) };
        assert_eq!(gpu.live_host_allocs(), 0);
    }
}
