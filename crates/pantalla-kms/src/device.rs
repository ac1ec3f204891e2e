//! Display device: output discovery, scanout binds, flip scheduling.
//!
//! Wraps a [`KmsBackend`] and enforces the flip-sequencing contract: at most
//! one asynchronous flip is outstanding per CRTC, and a completion that
//! nobody requested is surfaced instead of being silently dropped.

use std::path::Path;
use std::time::Duration;

use crate::backend::{BackendEvent, DrmBackend, KmsBackend, OutputInfo};
use crate::error::KmsError;

/// Event surfaced to the presentation loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The outstanding flip completed; carries the token passed to
    /// [`DisplayDevice::request_async_flip`].
    FlipCompleted {
        token: u64,
    },
    /// The wait elapsed (or was interrupted) without a completion.
    TimedOut,
    /// A completion arrived while no flip was outstanding.
    SpuriousFlip,
}

/// Handle to the kernel display subsystem plus the discovered output.
///
/// Backend resources are released when the device drops; every buffer
/// referencing the device must be released first.
pub struct DisplayDevice<B: KmsBackend> {
    backend: B,
    output: Option<OutputInfo>,
    pending_flip: Option<u64>,
}

impl DisplayDevice<DrmBackend> {
    /// Open the kernel display-control node at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KmsError> {
        let backend = DrmBackend::open(path.as_ref())?;
        eprintln!("[pantalla] driver: {}", backend.driver_name());
        Ok(Self::with_backend(backend))
    }
}

impl<B: KmsBackend> DisplayDevice<B> {
    /// Wrap an already-open backend.
    #[must_use]
    pub fn with_backend(backend: B) -> Self {
        Self {
            backend,
            output: None,
            pending_flip: None,
        }
    }

    /// The underlying backend.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Mutable access to the underlying backend.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Select the first active connector and resolve its CRTC.
    pub fn discover_output(&mut self) -> Result<&OutputInfo, KmsError> {
        let info = self.backend.discover_output()?;
        eprintln!(
            "[pantalla] output: connector {} crtc {} {}x{}@{}Hz",
            info.connector_id, info.crtc_id, info.width, info.height, info.refresh_hz
        );
        Ok(self.output.insert(info))
    }

    /// The discovered output, if any.
    #[must_use]
    pub fn output(&self) -> Option<&OutputInfo> {
        self.output.as_ref()
    }

    fn discovered(&self) -> Result<&OutputInfo, KmsError> {
        self.output.as_ref().ok_or(KmsError::OutputNotDiscovered)
    }

    /// Synchronously bind `framebuffer` to the CRTC at offset `(x, y)`,
    /// switching what is scanned out immediately.
    pub fn present(&mut self, framebuffer: u32, x: u32, y: u32) -> Result<(), KmsError> {
        self.discovered()?;
        self.backend.set_crtc(framebuffer, x, y)
    }

    /// Schedule a flip to `framebuffer` at the next vertical blank.
    ///
    /// The completion event later carries `token` back through
    /// [`Self::wait_event`]. Requesting a second flip while one is
    /// outstanding is a caller error and never reaches the kernel.
    pub fn request_async_flip(&mut self, framebuffer: u32, token: u64) -> Result<(), KmsError> {
        self.discovered()?;
        if let Some(pending) = self.pending_flip {
            return Err(KmsError::FlipPending { token: pending });
        }
        self.backend.page_flip(framebuffer)?;
        self.pending_flip = Some(token);
        Ok(())
    }

    /// Token of the outstanding flip, if any.
    #[must_use]
    pub const fn pending_flip(&self) -> Option<u64> {
        self.pending_flip
    }

    /// Re-image the hardware cursor plane from a buffer object.
    pub fn set_cursor_image(&mut self, handle: u32) -> Result<(), KmsError> {
        self.discovered()?;
        self.backend.set_cursor(handle)
    }

    /// Move the hardware cursor plane, independent of the primary scanout.
    pub fn move_cursor_plane(&mut self, x: i32, y: i32) -> Result<(), KmsError> {
        self.discovered()?;
        self.backend.move_cursor(x, y)
    }

    /// Block until the outstanding flip completes or `timeout` elapses
    /// (`None` waits indefinitely).
    pub fn wait_event(&mut self, timeout: Option<Duration>) -> Result<DeviceEvent, KmsError> {
        match self.backend.wait_event(timeout)? {
            BackendEvent::TimedOut => Ok(DeviceEvent::TimedOut),
            BackendEvent::FlipCompleted => match self.pending_flip.take() {
                Some(token) => Ok(DeviceEvent::FlipCompleted { token }),
                None => Ok(DeviceEvent::SpuriousFlip),
            },
        }
    }

    /// Re-bind the framebuffer and offset that were scanned out before the
    /// session. Returns `false` when the CRTC had no framebuffer bound.
    pub fn restore_prior_scanout(&mut self) -> Result<bool, KmsError> {
        let output = self.discovered()?.clone();
        match output.prior_framebuffer {
            Some(framebuffer) => {
                self.backend
                    .set_crtc(framebuffer, output.prior_position.0, output.prior_position.1)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TestBackend;
    use crate::buffer::GraphicsBuffer;

    fn discovered_device() -> DisplayDevice<TestBackend> {
        let mut device = DisplayDevice::with_backend(TestBackend::new(640, 480));
        device.discover_output().expect("discover");
        device
    }

    #[test]
    fn test_operations_require_discovery() {
        let mut device = DisplayDevice::with_backend(TestBackend::new(640, 480));
        assert!(matches!(
            device.present(1, 0, 0),
            Err(KmsError::OutputNotDiscovered)
        ));
        assert!(matches!(
            device.request_async_flip(1, 0),
            Err(KmsError::OutputNotDiscovered)
        ));
    }

    #[test]
    fn test_flip_completion_round_trips_token() {
        let mut device = discovered_device();
        let buffer = GraphicsBuffer::allocate(&mut device, 64, 64).expect("buffer");
        device
            .request_async_flip(buffer.framebuffer_id(), 17)
            .expect("flip");
        assert_eq!(device.pending_flip(), Some(17));
        assert_eq!(
            device.wait_event(None).expect("event"),
            DeviceEvent::FlipCompleted { token: 17 }
        );
        assert_eq!(device.pending_flip(), None);
    }

    #[test]
    fn test_second_flip_while_pending_is_rejected() {
        let mut device = discovered_device();
        let buffer = GraphicsBuffer::allocate(&mut device, 64, 64).expect("buffer");
        let other = GraphicsBuffer::allocate(&mut device, 64, 64).expect("buffer");
        device
            .request_async_flip(buffer.framebuffer_id(), 1)
            .expect("flip");
        let second = device.request_async_flip(other.framebuffer_id(), 2);
        assert!(matches!(second, Err(KmsError::FlipPending { token: 1 })));
        // The rejected request never reached the backend.
        assert_eq!(device.backend().flip_calls().len(), 1);
    }

    #[test]
    fn test_completion_without_outstanding_flip_is_spurious() {
        let backend = TestBackend::new(640, 480).with_queued_completion();
        let mut device = DisplayDevice::with_backend(backend);
        device.discover_output().expect("discover");
        assert_eq!(device.wait_event(None).expect("event"), DeviceEvent::SpuriousFlip);
    }

    #[test]
    fn test_restore_prior_scanout() {
        let backend = TestBackend::new(640, 480).with_prior_framebuffer(42, (3, 7));
        let mut device = DisplayDevice::with_backend(backend);
        device.discover_output().expect("discover");
        assert!(device.restore_prior_scanout().expect("restore"));
        assert_eq!(device.backend().scanout_calls(), &[(42, 3, 7)]);
    }

    #[test]
    fn test_restore_without_prior_framebuffer() {
        let mut device = discovered_device();
        assert!(!device.restore_prior_scanout().expect("restore"));
        assert!(device.backend().scanout_calls().is_empty());
    }
}
