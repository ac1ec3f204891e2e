//! Dumb-buffer lifecycle: allocate, map, release.

use crate::backend::KmsBackend;
use crate::device::DisplayDevice;
use crate::error::KmsError;

/// A displayable linear buffer: a kernel buffer object plus its framebuffer
/// registration.
///
/// Ids are raw kernel ids; zero means "unset". Operations take the owning
/// device explicitly, and the containers holding buffers sequence every
/// release before the device drops.
#[derive(Debug, Default)]
pub struct GraphicsBuffer {
    handle: u32,
    framebuffer: u32,
    width: u32,
    height: u32,
    pitch: u32,
    size: u64,
}

impl GraphicsBuffer {
    /// Allocate a `width x height` linear buffer at 32 bits per pixel and
    /// register it as a depth-24 framebuffer.
    ///
    /// A failed registration destroys the just-created buffer object before
    /// returning, so nothing leaks.
    pub fn allocate<B: KmsBackend>(
        device: &mut DisplayDevice<B>,
        width: u32,
        height: u32,
    ) -> Result<Self, KmsError> {
        let alloc = device.backend_mut().create_dumb(width, height)?;
        let framebuffer = match device.backend_mut().register_framebuffer(alloc.handle) {
            Ok(framebuffer) => framebuffer,
            Err(err) => {
                if let Err(cleanup) = device.backend_mut().destroy_dumb(alloc.handle) {
                    eprintln!(
                        "[pantalla] could not destroy buffer {} after failed registration: {cleanup}",
                        alloc.handle
                    );
                }
                return Err(err);
            }
        };
        Ok(Self {
            handle: alloc.handle,
            framebuffer,
            width,
            height,
            pitch: alloc.pitch,
            size: alloc.size,
        })
    }

    /// Buffer-object handle; zero when released.
    #[must_use]
    pub const fn handle(&self) -> u32 {
        self.handle
    }

    /// Framebuffer id; zero when released.
    #[must_use]
    pub const fn framebuffer_id(&self) -> u32 {
        self.framebuffer
    }

    /// Width in pixels.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Row stride in bytes, as reported by the kernel.
    #[must_use]
    pub const fn pitch(&self) -> u32 {
        self.pitch
    }

    /// Allocation size in bytes, as reported by the kernel.
    #[must_use]
    pub const fn size_bytes(&self) -> u64 {
        self.size
    }

    /// Whether the buffer still holds live kernel resources.
    #[must_use]
    pub const fn is_allocated(&self) -> bool {
        self.handle != 0
    }

    /// Map the buffer for direct pixel access.
    ///
    /// The mapping is released when the returned guard drops; a failed map
    /// leaves the buffer allocated but unusable for drawing.
    pub fn map<'a, B: KmsBackend>(
        &self,
        device: &'a mut DisplayDevice<B>,
    ) -> Result<B::Mapping<'a>, KmsError> {
        if self.handle == 0 {
            return Err(KmsError::NotAllocated);
        }
        device.backend_mut().map_dumb(self.handle)
    }

    /// Remove the framebuffer registration, then destroy the buffer object.
    ///
    /// Each step is skipped when the resource was never acquired, and both
    /// are attempted regardless of earlier failure; failures are logged and
    /// never propagated. Idempotent.
    pub fn release<B: KmsBackend>(&mut self, device: &mut DisplayDevice<B>) {
        if self.framebuffer != 0 {
            if let Err(err) = device.backend_mut().remove_framebuffer(self.framebuffer) {
                eprintln!(
                    "[pantalla] could not remove framebuffer {}: {err}",
                    self.framebuffer
                );
            }
            self.framebuffer = 0;
        }
        if self.handle != 0 {
            if let Err(err) = device.backend_mut().destroy_dumb(self.handle) {
                eprintln!("[pantalla] could not destroy buffer {}: {err}", self.handle);
            }
            self.handle = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TestBackend;

    fn device() -> DisplayDevice<TestBackend> {
        DisplayDevice::with_backend(TestBackend::new(640, 480))
    }

    #[test]
    fn test_allocate_captures_kernel_geometry() {
        let mut device = device();
        let buffer = GraphicsBuffer::allocate(&mut device, 100, 50).expect("allocate");
        assert!(buffer.is_allocated());
        assert_ne!(buffer.handle(), 0);
        assert_ne!(buffer.framebuffer_id(), 0);
        assert!(buffer.pitch() >= 400);
        assert_eq!(buffer.size_bytes(), u64::from(buffer.pitch()) * 50);
    }

    #[test]
    fn test_map_is_exactly_allocation_size() {
        let mut device = device();
        let buffer = GraphicsBuffer::allocate(&mut device, 64, 64).expect("allocate");
        let expected = buffer.size_bytes();
        let mut mapping = buffer.map(&mut device).expect("map");
        assert_eq!(mapping.as_mut().len() as u64, expected);
    }

    #[test]
    fn test_map_requires_allocation() {
        let mut device = device();
        let buffer = GraphicsBuffer::default();
        assert!(matches!(
            buffer.map(&mut device),
            Err(KmsError::NotAllocated)
        ));
    }

    #[test]
    fn test_map_after_release_fails() {
        let mut device = device();
        let mut buffer = GraphicsBuffer::allocate(&mut device, 64, 64).expect("allocate");
        buffer.release(&mut device);
        assert!(matches!(
            buffer.map(&mut device),
            Err(KmsError::NotAllocated)
        ));
    }

    #[test]
    fn test_release_is_idempotent_and_leak_free() {
        let mut device = device();
        let mut buffer = GraphicsBuffer::allocate(&mut device, 64, 64).expect("allocate");
        buffer.release(&mut device);
        assert_eq!(device.backend().live_allocations(), 0);
        assert_eq!(device.backend().live_framebuffers(), 0);
        // Second release must not double-free.
        buffer.release(&mut device);
        assert!(!buffer.is_allocated());
        assert_eq!(buffer.framebuffer_id(), 0);
    }

    #[test]
    fn test_failed_registration_destroys_buffer_object() {
        let backend = TestBackend::new(640, 480).fail_register_at(0);
        let mut device = DisplayDevice::with_backend(backend);
        let result = GraphicsBuffer::allocate(&mut device, 64, 64);
        assert!(matches!(result, Err(KmsError::FramebufferBind(_))));
        assert_eq!(device.backend().live_allocations(), 0);
    }

    #[test]
    fn test_failed_allocation_leaves_nothing_behind() {
        let backend = TestBackend::new(640, 480).fail_create_at(0);
        let mut device = DisplayDevice::with_backend(backend);
        let result = GraphicsBuffer::allocate(&mut device, 64, 64);
        assert!(matches!(result, Err(KmsError::Allocation { .. })));
        assert_eq!(device.backend().live_allocations(), 0);
        assert_eq!(device.backend().live_framebuffers(), 0);
    }
}
