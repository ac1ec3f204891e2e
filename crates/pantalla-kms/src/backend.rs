//! Kernel display-control seam.
//!
//! [`KmsBackend`] abstracts the handful of mode-setting calls the
//! presentation core needs, so the device, ring and loop can be exercised in
//! tests without a DRM node. [`DrmBackend`] is the production implementation
//! on top of the `drm` crate; [`TestBackend`] is an in-memory double with
//! recorded calls, queued events and injectable failures.

use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::num::NonZeroU32;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::Path;
use std::time::Duration;

use drm::buffer::{Buffer, DrmFourcc};
use drm::control::dumbbuffer::{DumbBuffer, DumbMapping};
use drm::control::{connector, framebuffer, Device as ControlDevice, Event, Mode, PageFlipFlags};
use drm::control::{crtc, encoder};
use drm::Device as BasicDevice;
use rustix::event::{poll, PollFd, PollFlags};

use crate::error::KmsError;

/// Color depth registered for every framebuffer.
pub const COLOR_DEPTH: u32 = 24;
/// Bits per pixel of every allocation.
pub const BITS_PER_PIXEL: u32 = 32;

/// Geometry and prior bindings of the selected output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputInfo {
    /// Connector (physical output) id.
    pub connector_id: u32,
    /// CRTC (timing/scanout engine) id.
    pub crtc_id: u32,
    /// Active mode width in pixels.
    pub width: u32,
    /// Active mode height in pixels.
    pub height: u32,
    /// Active mode vertical refresh in Hz.
    pub refresh_hz: u32,
    /// Framebuffer bound to the CRTC before the session, if any.
    pub prior_framebuffer: Option<u32>,
    /// Scanout offset bound before the session.
    pub prior_position: (u32, u32),
}

/// Kernel-reported result of a dumb-buffer allocation.
#[derive(Clone, Copy, Debug)]
pub struct DumbAllocation {
    /// Buffer-object handle.
    pub handle: u32,
    /// Row stride in bytes; may exceed `width * 4` for alignment.
    pub pitch: u32,
    /// Allocation size in bytes.
    pub size: u64,
}

/// Notification read from the device's event stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendEvent {
    /// A previously requested page flip completed at vertical blank.
    FlipCompleted,
    /// The wait elapsed (or was interrupted) without a completion.
    TimedOut,
}

/// The kernel display-control operations the presentation core consumes.
///
/// One CRTC, fixed depth-24/bpp-32 linear buffers. Framebuffer ids and
/// buffer-object handles are raw kernel ids; zero is never a live resource.
pub trait KmsBackend {
    /// Scoped mapping of a dumb buffer; unmapped when dropped.
    type Mapping<'a>: AsMut<[u8]>
    where
        Self: 'a;

    /// Kernel driver identification, for diagnostics.
    fn driver_name(&self) -> String;

    /// Select the first connected connector with at least one mode and
    /// resolve its encoder's CRTC.
    fn discover_output(&mut self) -> Result<OutputInfo, KmsError>;

    /// Allocate a linear buffer object at 32 bits per pixel.
    fn create_dumb(&mut self, width: u32, height: u32) -> Result<DumbAllocation, KmsError>;

    /// Register an allocated buffer object as a displayable framebuffer.
    fn register_framebuffer(&mut self, handle: u32) -> Result<u32, KmsError>;

    /// Map a buffer object for direct pixel access.
    fn map_dumb(&mut self, handle: u32) -> Result<Self::Mapping<'_>, KmsError>;

    /// Remove a framebuffer registration.
    fn remove_framebuffer(&mut self, framebuffer: u32) -> Result<(), KmsError>;

    /// Destroy a buffer object.
    fn destroy_dumb(&mut self, handle: u32) -> Result<(), KmsError>;

    /// Synchronously bind a framebuffer to the discovered CRTC.
    fn set_crtc(&mut self, framebuffer: u32, x: u32, y: u32) -> Result<(), KmsError>;

    /// Schedule a flip to `framebuffer` at the next vertical blank; the
    /// completion arrives later through [`Self::wait_event`].
    fn page_flip(&mut self, framebuffer: u32) -> Result<(), KmsError>;

    /// Re-image the hardware cursor plane from a buffer object.
    fn set_cursor(&mut self, handle: u32) -> Result<(), KmsError>;

    /// Move the hardware cursor plane.
    fn move_cursor(&mut self, x: i32, y: i32) -> Result<(), KmsError>;

    /// Block on the device's event stream until a completion arrives or the
    /// timeout elapses (`None` waits indefinitely).
    fn wait_event(&mut self, timeout: Option<Duration>) -> Result<BackendEvent, KmsError>;
}

// ---------------------------------------------------------------------------
// Production backend
// ---------------------------------------------------------------------------

/// Wrapper so the `drm` trait methods are available on the device fd.
struct Card(File);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl BasicDevice for Card {}
impl ControlDevice for Card {}

/// Output selection resolved by discovery, kept for later CRTC calls.
struct Selection {
    connector: connector::Handle,
    crtc: crtc::Handle,
    mode: Mode,
}

/// Production backend talking to a DRM device node.
pub struct DrmBackend {
    card: Card,
    selection: Option<Selection>,
    buffers: HashMap<u32, DumbBuffer>,
}

impl DrmBackend {
    /// Open the display-control node at `path` read-write.
    pub fn open(path: &Path) -> Result<Self, KmsError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| KmsError::DeviceOpen {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self {
            card: Card(file),
            selection: None,
            buffers: HashMap::new(),
        })
    }

    fn selection(&self) -> Result<&Selection, KmsError> {
        self.selection.as_ref().ok_or(KmsError::OutputNotDiscovered)
    }

    fn framebuffer_handle(framebuffer: u32) -> Result<framebuffer::Handle, KmsError> {
        NonZeroU32::new(framebuffer)
            .map(framebuffer::Handle::from)
            .ok_or(KmsError::NotAllocated)
    }
}

impl KmsBackend for DrmBackend {
    type Mapping<'a>
        = DumbMapping<'a>
    where
        Self: 'a;

    fn driver_name(&self) -> String {
        self.card.get_driver().map_or_else(
            |_| "unknown".to_string(),
            |driver| driver.name().to_string_lossy().into_owned(),
        )
    }

    fn discover_output(&mut self) -> Result<OutputInfo, KmsError> {
        let resources = self.card.resource_handles().map_err(KmsError::Discovery)?;

        // First connector reporting connected with at least one mode wins.
        let mut selected: Option<connector::Info> = None;
        for handle in resources.connectors() {
            let Ok(info) = self.card.get_connector(*handle, false) else {
                continue;
            };
            if info.state() == connector::State::Connected && !info.modes().is_empty() {
                selected = Some(info);
                break;
            }
        }
        let conn = selected.ok_or(KmsError::NoActiveOutput)?;

        // The connector's current encoder carries the active CRTC, which in
        // turn carries the active mode and the previously-bound scanout.
        let encoder_handle = conn.current_encoder().ok_or(KmsError::NoActiveOutput)?;
        let encoder_info: encoder::Info = self
            .card
            .get_encoder(encoder_handle)
            .map_err(KmsError::Discovery)?;
        let crtc_handle = encoder_info.crtc().ok_or(KmsError::NoActiveOutput)?;
        let crtc_info = self.card.get_crtc(crtc_handle).map_err(KmsError::Discovery)?;
        let mode = crtc_info.mode().ok_or(KmsError::NoActiveOutput)?;

        let (width, height) = mode.size();
        let info = OutputInfo {
            connector_id: u32::from(conn.handle()),
            crtc_id: u32::from(crtc_handle),
            width: u32::from(width),
            height: u32::from(height),
            refresh_hz: mode.vrefresh(),
            prior_framebuffer: crtc_info.framebuffer().map(u32::from),
            prior_position: crtc_info.position(),
        };
        self.selection = Some(Selection {
            connector: conn.handle(),
            crtc: crtc_handle,
            mode,
        });
        Ok(info)
    }

    fn create_dumb(&mut self, width: u32, height: u32) -> Result<DumbAllocation, KmsError> {
        let buffer = self
            .card
            .create_dumb_buffer((width, height), DrmFourcc::Xrgb8888, BITS_PER_PIXEL)
            .map_err(|source| KmsError::Allocation {
                width,
                height,
                source,
            })?;
        let alloc = DumbAllocation {
            handle: u32::from(buffer.handle()),
            pitch: buffer.pitch(),
            size: u64::from(buffer.pitch()) * u64::from(height),
        };
        self.buffers.insert(alloc.handle, buffer);
        Ok(alloc)
    }

    fn register_framebuffer(&mut self, handle: u32) -> Result<u32, KmsError> {
        let buffer = self.buffers.get(&handle).ok_or(KmsError::NotAllocated)?;
        let fb = self
            .card
            .add_framebuffer(buffer, COLOR_DEPTH, BITS_PER_PIXEL)
            .map_err(KmsError::FramebufferBind)?;
        Ok(u32::from(fb))
    }

    fn map_dumb(&mut self, handle: u32) -> Result<Self::Mapping<'_>, KmsError> {
        let buffer = self.buffers.get_mut(&handle).ok_or(KmsError::NotAllocated)?;
        self.card
            .map_dumb_buffer(buffer)
            .map_err(|source| KmsError::Map { handle, source })
    }

    fn remove_framebuffer(&mut self, framebuffer: u32) -> Result<(), KmsError> {
        let fb = Self::framebuffer_handle(framebuffer)?;
        self.card.destroy_framebuffer(fb).map_err(KmsError::Teardown)
    }

    fn destroy_dumb(&mut self, handle: u32) -> Result<(), KmsError> {
        let buffer = self.buffers.remove(&handle).ok_or(KmsError::NotAllocated)?;
        self.card
            .destroy_dumb_buffer(buffer)
            .map_err(KmsError::Teardown)
    }

    fn set_crtc(&mut self, framebuffer: u32, x: u32, y: u32) -> Result<(), KmsError> {
        let selection = self.selection()?;
        let fb = NonZeroU32::new(framebuffer).map(framebuffer::Handle::from);
        self.card
            .set_crtc(
                selection.crtc,
                fb,
                (x, y),
                &[selection.connector],
                Some(selection.mode),
            )
            .map_err(|source| KmsError::Present {
                framebuffer,
                source,
            })
    }

    fn page_flip(&mut self, framebuffer: u32) -> Result<(), KmsError> {
        let selection = self.selection()?;
        let fb = Self::framebuffer_handle(framebuffer)?;
        self.card
            .page_flip(selection.crtc, fb, PageFlipFlags::EVENT, None)
            .map_err(|source| KmsError::FlipRequest {
                framebuffer,
                source,
            })
    }

    fn set_cursor(&mut self, handle: u32) -> Result<(), KmsError> {
        let crtc = self.selection()?.crtc;
        let buffer = self.buffers.get(&handle).ok_or(KmsError::NotAllocated)?;
        self.card
            .set_cursor(crtc, Some(buffer))
            .map_err(KmsError::Cursor)
    }

    fn move_cursor(&mut self, x: i32, y: i32) -> Result<(), KmsError> {
        let crtc = self.selection()?.crtc;
        self.card.move_cursor(crtc, (x, y)).map_err(KmsError::Cursor)
    }

    fn wait_event(&mut self, timeout: Option<Duration>) -> Result<BackendEvent, KmsError> {
        let millis: i32 = match timeout {
            None => -1,
            Some(t) => i32::try_from(t.as_millis()).unwrap_or(i32::MAX),
        };
        let ready = {
            let mut fds = [PollFd::new(&self.card, PollFlags::IN)];
            poll(&mut fds, millis)
        };
        match ready {
            Ok(0) => return Ok(BackendEvent::TimedOut),
            Ok(_) => {}
            // Interrupted waits surface as a timeout so the loop can re-check
            // its stop conditions.
            Err(errno) if errno == rustix::io::Errno::INTR => {
                return Ok(BackendEvent::TimedOut)
            }
            Err(errno) => return Err(KmsError::EventWait(errno.into())),
        }
        for event in self.card.receive_events().map_err(KmsError::EventWait)? {
            if let Event::PageFlip(_) = event {
                return Ok(BackendEvent::FlipCompleted);
            }
        }
        // Readable but only vblank or unknown events; treat as a spurious
        // wake-up and wait again from the caller.
        Ok(BackendEvent::TimedOut)
    }
}

// ---------------------------------------------------------------------------
// Test backend
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct TestAllocation {
    pixels: Vec<u8>,
}

/// In-memory double used by unit and integration tests.
///
/// Allocations are plain byte vectors, flips queue a completion that the next
/// [`KmsBackend::wait_event`] delivers, calls are recorded for assertions,
/// and individual operations can be made to fail on their n-th invocation.
#[derive(Debug, Default)]
pub struct TestBackend {
    width: u32,
    height: u32,
    prior_framebuffer: Option<u32>,
    prior_position: (u32, u32),
    no_output: bool,

    next_handle: u32,
    next_framebuffer: u32,
    allocations: HashMap<u32, TestAllocation>,
    framebuffers: HashMap<u32, u32>,

    events: VecDeque<BackendEvent>,

    scanout_calls: Vec<(u32, u32, u32)>,
    flip_calls: Vec<u32>,
    cursor_images: Vec<u32>,
    cursor_moves: Vec<(i32, i32)>,

    create_attempts: u64,
    register_attempts: u64,
    map_attempts: u64,
    set_crtc_attempts: u64,
    flip_attempts: u64,
    fail_create_at: Option<u64>,
    fail_register_at: Option<u64>,
    fail_map_at: Option<u64>,
    fail_set_crtc_at: Option<u64>,
    fail_flip_at: Option<u64>,
}

impl TestBackend {
    /// A backend whose single output reports the given mode.
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            next_handle: 1,
            next_framebuffer: 100,
            ..Self::default()
        }
    }

    /// Report a framebuffer already bound to the CRTC before the session.
    #[must_use]
    pub fn with_prior_framebuffer(mut self, framebuffer: u32, position: (u32, u32)) -> Self {
        self.prior_framebuffer = Some(framebuffer);
        self.prior_position = position;
        self
    }

    /// Make discovery fail with `NoActiveOutput`.
    #[must_use]
    pub fn with_no_output(mut self) -> Self {
        self.no_output = true;
        self
    }

    /// Queue a completion event that no flip requested (protocol violation).
    #[must_use]
    pub fn with_queued_completion(mut self) -> Self {
        self.events.push_back(BackendEvent::FlipCompleted);
        self
    }

    /// Fail the n-th (0-based) buffer allocation.
    #[must_use]
    pub fn fail_create_at(mut self, n: u64) -> Self {
        self.fail_create_at = Some(n);
        self
    }

    /// Fail the n-th framebuffer registration.
    #[must_use]
    pub fn fail_register_at(mut self, n: u64) -> Self {
        self.fail_register_at = Some(n);
        self
    }

    /// Fail the n-th mapping.
    #[must_use]
    pub fn fail_map_at(mut self, n: u64) -> Self {
        self.fail_map_at = Some(n);
        self
    }

    /// Fail the n-th synchronous CRTC bind.
    #[must_use]
    pub fn fail_set_crtc_at(mut self, n: u64) -> Self {
        self.fail_set_crtc_at = Some(n);
        self
    }

    /// Fail the n-th flip request.
    #[must_use]
    pub fn fail_flip_at(mut self, n: u64) -> Self {
        self.fail_flip_at = Some(n);
        self
    }

    /// Recorded synchronous binds as `(framebuffer, x, y)`.
    #[must_use]
    pub fn scanout_calls(&self) -> &[(u32, u32, u32)] {
        &self.scanout_calls
    }

    /// Recorded flip requests.
    #[must_use]
    pub fn flip_calls(&self) -> &[u32] {
        &self.flip_calls
    }

    /// Recorded cursor re-images.
    #[must_use]
    pub fn cursor_images(&self) -> &[u32] {
        &self.cursor_images
    }

    /// Recorded cursor moves.
    #[must_use]
    pub fn cursor_moves(&self) -> &[(i32, i32)] {
        &self.cursor_moves
    }

    /// Buffer objects still alive.
    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.allocations.len()
    }

    /// Framebuffer registrations still alive.
    #[must_use]
    pub fn live_framebuffers(&self) -> usize {
        self.framebuffers.len()
    }

    /// Pixel storage of a live allocation.
    #[must_use]
    pub fn pixels(&self, handle: u32) -> Option<&[u8]> {
        self.allocations.get(&handle).map(|a| a.pixels.as_slice())
    }

    fn should_fail(counter: &mut u64, at: Option<u64>) -> bool {
        let n = *counter;
        *counter += 1;
        at == Some(n)
    }

    fn injected() -> std::io::Error {
        std::io::Error::other("injected failure")
    }
}

impl KmsBackend for TestBackend {
    type Mapping<'a>
        = &'a mut [u8]
    where
        Self: 'a;

    fn driver_name(&self) -> String {
        "test".to_string()
    }

    fn discover_output(&mut self) -> Result<OutputInfo, KmsError> {
        if self.no_output {
            return Err(KmsError::NoActiveOutput);
        }
        Ok(OutputInfo {
            connector_id: 1,
            crtc_id: 1,
            width: self.width,
            height: self.height,
            refresh_hz: 60,
            prior_framebuffer: self.prior_framebuffer,
            prior_position: self.prior_position,
        })
    }

    fn create_dumb(&mut self, width: u32, height: u32) -> Result<DumbAllocation, KmsError> {
        if Self::should_fail(&mut self.create_attempts, self.fail_create_at) {
            return Err(KmsError::Allocation {
                width,
                height,
                source: Self::injected(),
            });
        }
        // Pad rows to a 64-byte boundary like real allocations tend to.
        let pitch = (width * 4).next_multiple_of(64);
        let size = u64::from(pitch) * u64::from(height);
        let handle = self.next_handle;
        self.next_handle += 1;
        self.allocations.insert(
            handle,
            TestAllocation {
                pixels: vec![0u8; size as usize],
            },
        );
        Ok(DumbAllocation { handle, pitch, size })
    }

    fn register_framebuffer(&mut self, handle: u32) -> Result<u32, KmsError> {
        if !self.allocations.contains_key(&handle) {
            return Err(KmsError::NotAllocated);
        }
        if Self::should_fail(&mut self.register_attempts, self.fail_register_at) {
            return Err(KmsError::FramebufferBind(Self::injected()));
        }
        let fb = self.next_framebuffer;
        self.next_framebuffer += 1;
        self.framebuffers.insert(fb, handle);
        Ok(fb)
    }

    fn map_dumb(&mut self, handle: u32) -> Result<Self::Mapping<'_>, KmsError> {
        if Self::should_fail(&mut self.map_attempts, self.fail_map_at) {
            return Err(KmsError::Map {
                handle,
                source: Self::injected(),
            });
        }
        self.allocations
            .get_mut(&handle)
            .map(|a| a.pixels.as_mut_slice())
            .ok_or(KmsError::NotAllocated)
    }

    fn remove_framebuffer(&mut self, framebuffer: u32) -> Result<(), KmsError> {
        self.framebuffers
            .remove(&framebuffer)
            .map(|_| ())
            .ok_or(KmsError::NotAllocated)
    }

    fn destroy_dumb(&mut self, handle: u32) -> Result<(), KmsError> {
        self.allocations
            .remove(&handle)
            .map(|_| ())
            .ok_or(KmsError::NotAllocated)
    }

    fn set_crtc(&mut self, framebuffer: u32, x: u32, y: u32) -> Result<(), KmsError> {
        if Self::should_fail(&mut self.set_crtc_attempts, self.fail_set_crtc_at) {
            return Err(KmsError::Present {
                framebuffer,
                source: Self::injected(),
            });
        }
        self.scanout_calls.push((framebuffer, x, y));
        Ok(())
    }

    fn page_flip(&mut self, framebuffer: u32) -> Result<(), KmsError> {
        if Self::should_fail(&mut self.flip_attempts, self.fail_flip_at) {
            return Err(KmsError::FlipRequest {
                framebuffer,
                source: Self::injected(),
            });
        }
        self.flip_calls.push(framebuffer);
        // The "hardware" completes every flip by the next event wait.
        self.events.push_back(BackendEvent::FlipCompleted);
        Ok(())
    }

    fn set_cursor(&mut self, handle: u32) -> Result<(), KmsError> {
        if !self.allocations.contains_key(&handle) {
            return Err(KmsError::NotAllocated);
        }
        self.cursor_images.push(handle);
        Ok(())
    }

    fn move_cursor(&mut self, x: i32, y: i32) -> Result<(), KmsError> {
        self.cursor_moves.push((x, y));
        Ok(())
    }

    fn wait_event(&mut self, _timeout: Option<Duration>) -> Result<BackendEvent, KmsError> {
        // Never actually blocks; an empty queue reads as an elapsed timeout
        // so test loops stay live.
        Ok(self.events.pop_front().unwrap_or(BackendEvent::TimedOut))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discover_reports_mode_geometry() {
        let mut backend = TestBackend::new(1024, 768).with_prior_framebuffer(42, (3, 7));
        let output = backend.discover_output().expect("output");
        assert_eq!((output.width, output.height), (1024, 768));
        assert_eq!(output.prior_framebuffer, Some(42));
        assert_eq!(output.prior_position, (3, 7));
    }

    #[test]
    fn test_discover_no_output() {
        let mut backend = TestBackend::new(1024, 768).with_no_output();
        assert!(matches!(
            backend.discover_output(),
            Err(KmsError::NoActiveOutput)
        ));
    }

    #[test]
    fn test_create_reports_padded_pitch_and_size() {
        let mut backend = TestBackend::new(1024, 768);
        let alloc = backend.create_dumb(100, 10).expect("alloc");
        assert!(alloc.pitch >= 400);
        assert_eq!(alloc.pitch % 64, 0);
        assert_eq!(alloc.size, u64::from(alloc.pitch) * 10);
        assert_eq!(backend.live_allocations(), 1);
    }

    #[test]
    fn test_mapping_is_exactly_allocation_size() {
        let mut backend = TestBackend::new(1024, 768);
        let alloc = backend.create_dumb(64, 64).expect("alloc");
        let mapping = backend.map_dumb(alloc.handle).expect("map");
        assert_eq!(mapping.len() as u64, alloc.size);
    }

    #[test]
    fn test_map_unknown_handle_fails() {
        let mut backend = TestBackend::new(1024, 768);
        assert!(matches!(
            backend.map_dumb(99),
            Err(KmsError::NotAllocated)
        ));
    }

    #[test]
    fn test_register_requires_allocation() {
        let mut backend = TestBackend::new(1024, 768);
        assert!(matches!(
            backend.register_framebuffer(5),
            Err(KmsError::NotAllocated)
        ));
    }

    #[test]
    fn test_flip_queues_completion() {
        let mut backend = TestBackend::new(1024, 768);
        let alloc = backend.create_dumb(64, 64).expect("alloc");
        let fb = backend.register_framebuffer(alloc.handle).expect("fb");
        backend.page_flip(fb).expect("flip");
        assert_eq!(backend.wait_event(None).expect("event"), BackendEvent::FlipCompleted);
        assert_eq!(backend.wait_event(None).expect("event"), BackendEvent::TimedOut);
    }

    #[test]
    fn test_injected_failures_hit_the_nth_call() {
        let mut backend = TestBackend::new(1024, 768).fail_create_at(1);
        assert!(backend.create_dumb(8, 8).is_ok());
        assert!(backend.create_dumb(8, 8).is_err());
        assert!(backend.create_dumb(8, 8).is_ok());
    }
}
