//! Error types for the mode-setting core.

use std::io;
use thiserror::Error;

/// Phase classification driving the propagation policy: setup failures abort
/// startup, present failures are logged and the frame skipped, protocol
/// violations are caller errors, teardown failures never block the remaining
/// cleanup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorPhase {
    /// Fatal before any presentation begins.
    Setup,
    /// A display bind was rejected; recoverable by skipping the frame.
    Present,
    /// Flip-sequencing or usage contract violation.
    Protocol,
    /// Resource release failure.
    Teardown,
}

/// Errors from the kernel display-control interface and its usage contract.
#[derive(Debug, Error)]
pub enum KmsError {
    /// The display-control node could not be opened.
    #[error("could not open display device {path}: {source}")]
    DeviceOpen {
        path: String,
        source: io::Error,
    },

    /// Resource enumeration failed mid-discovery.
    #[error("could not enumerate display resources: {0}")]
    Discovery(io::Error),

    /// No connector is connected with at least one supported mode.
    #[error("no active output found")]
    NoActiveOutput,

    /// An operation that needs a discovered output ran before discovery.
    #[error("no output discovered yet")]
    OutputNotDiscovered,

    /// Dumb-buffer allocation was rejected.
    #[error("could not allocate {width}x{height} buffer: {source}")]
    Allocation {
        width: u32,
        height: u32,
        source: io::Error,
    },

    /// Framebuffer registration over a buffer object was rejected.
    #[error("could not register framebuffer: {0}")]
    FramebufferBind(io::Error),

    /// Mapping a buffer object into process memory failed.
    #[error("could not map buffer {handle}: {source}")]
    Map {
        handle: u32,
        source: io::Error,
    },

    /// The buffer has no live kernel resources behind it.
    #[error("buffer is not allocated")]
    NotAllocated,

    /// A synchronous CRTC bind was rejected.
    #[error("could not bind framebuffer {framebuffer} to CRTC: {source}")]
    Present {
        framebuffer: u32,
        source: io::Error,
    },

    /// An asynchronous page-flip request was rejected.
    #[error("page flip to framebuffer {framebuffer} rejected: {source}")]
    FlipRequest {
        framebuffer: u32,
        source: io::Error,
    },

    /// A flip was requested while one is still outstanding.
    #[error("a page flip is already pending (token {token})")]
    FlipPending {
        token: u64,
    },

    /// A cursor-plane update was rejected.
    #[error("cursor plane update failed: {0}")]
    Cursor(io::Error),

    /// Waiting on the device's event stream failed.
    #[error("event wait failed: {0}")]
    EventWait(io::Error),

    /// A resource release step failed.
    #[error("teardown step failed: {0}")]
    Teardown(io::Error),

    /// The presenter configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

impl KmsError {
    /// Which phase of the propagation policy this error belongs to.
    #[must_use]
    pub const fn phase(&self) -> ErrorPhase {
        match self {
            Self::DeviceOpen { .. }
            | Self::Discovery(_)
            | Self::NoActiveOutput
            | Self::Allocation { .. }
            | Self::FramebufferBind(_)
            | Self::Map { .. }
            | Self::EventWait(_)
            | Self::InvalidConfig(_) => ErrorPhase::Setup,
            Self::Present { .. } | Self::FlipRequest { .. } | Self::Cursor(_) => {
                ErrorPhase::Present
            }
            Self::OutputNotDiscovered | Self::NotAllocated | Self::FlipPending { .. } => {
                ErrorPhase::Protocol
            }
            Self::Teardown(_) => ErrorPhase::Teardown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn io_err() -> io::Error {
        io::Error::new(io::ErrorKind::PermissionDenied, "denied")
    }

    #[test]
    fn test_device_open_is_setup_phase() {
        let err = KmsError::DeviceOpen {
            path: "/dev/dri/card0".to_string(),
            source: io_err(),
        };
        assert_eq!(err.phase(), ErrorPhase::Setup);
        assert!(err.to_string().contains("/dev/dri/card0"));
        assert!(err.to_string().contains("denied"));
    }

    #[test]
    fn test_present_is_present_phase() {
        let err = KmsError::Present {
            framebuffer: 7,
            source: io_err(),
        };
        assert_eq!(err.phase(), ErrorPhase::Present);
        assert!(err.to_string().contains("framebuffer 7"));
    }

    #[test]
    fn test_flip_pending_is_protocol_phase() {
        let err = KmsError::FlipPending { token: 3 };
        assert_eq!(err.phase(), ErrorPhase::Protocol);
        assert!(err.to_string().contains("token 3"));
    }

    #[test]
    fn test_allocation_reports_dimensions() {
        let err = KmsError::Allocation {
            width: 1920,
            height: 1080,
            source: io_err(),
        };
        assert_eq!(err.phase(), ErrorPhase::Setup);
        assert!(err.to_string().contains("1920x1080"));
    }

    #[test]
    fn test_teardown_phase() {
        assert_eq!(KmsError::Teardown(io_err()).phase(), ErrorPhase::Teardown);
    }
}
