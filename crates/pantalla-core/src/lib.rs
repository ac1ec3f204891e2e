//! Core types for the pantalla presentation demo.
//!
//! This crate carries everything the mode-setting core does not need to know
//! about: how pixels are addressed ([`PixelSurface`]), what gets drawn into
//! them ([`FrameRenderer`] and the bundled [`DemoRenderer`]), and the
//! per-frame animation state threaded through the renderer callback
//! ([`SessionState`]).
//!
//! The presentation loop in `pantalla-kms` treats all of this as an opaque
//! "fill this surface" contract; nothing here touches the kernel.

mod render;
mod session;
mod surface;

pub use render::{DemoRenderer, FrameRenderer};
pub use session::{SessionState, SpriteState};
pub use surface::{Argb, PixelSurface};
