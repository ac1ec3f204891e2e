//! Kernel mode-setting presentation core.
//!
//! This crate drives a display output directly through the kernel's
//! mode-setting interface: it discovers an active connector/CRTC pair,
//! allocates linear dumb buffers, registers them as framebuffers, and runs a
//! single-threaded loop that presents frames with vsync-aligned page flips
//! while animating a hardware cursor plane.
//!
//! # Architecture
//!
//! ```text
//! FrameRenderer → Presenter → DisplayDevice → KmsBackend
//!       ↑             ↑              ↑             ↑
//!  pantalla-core   flip loop   flip contract   drm / test
//! ```
//!
//! [`KmsBackend`] is the seam to the kernel: [`DrmBackend`] talks to a DRM
//! node, [`TestBackend`] is an in-memory double so the whole loop runs in
//! tests. [`DisplayDevice`] enforces the single-outstanding-flip contract,
//! [`BufferRing`] and [`CursorPlanes`] track which buffers the display still
//! owns, and [`Presenter`] sequences draw → flip → wait.
//!
//! # Example
//!
//! ```no_run
//! use pantalla_core::DemoRenderer;
//! use pantalla_kms::{DisplayDevice, Presenter, PresenterConfig};
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), pantalla_kms::KmsError> {
//! let device = DisplayDevice::open("/dev/dri/card0")?;
//! let config = PresenterConfig::default().with_duration(Duration::from_secs(5));
//! let mut presenter = Presenter::new(device, DemoRenderer::default()).with_config(config);
//! let stats = presenter.run()?;
//! eprintln!("[pantalla] {} frames", stats.frames_submitted);
//! # Ok(())
//! # }
//! ```

mod backend;
mod buffer;
mod device;
mod error;
mod presenter;
mod ring;

pub use backend::{
    BackendEvent, DrmBackend, DumbAllocation, KmsBackend, OutputInfo, TestBackend,
    BITS_PER_PIXEL, COLOR_DEPTH,
};
pub use buffer::GraphicsBuffer;
pub use device::{DeviceEvent, DisplayDevice};
pub use error::{ErrorPhase, KmsError};
pub use presenter::{PresentStats, Presenter, PresenterConfig};
pub use ring::{BufferRing, CursorPlanes};
