//! Renderer contract and the bundled demo payload.

use crate::session::SessionState;
use crate::surface::{Argb, PixelSurface};

/// Fills frames for the presentation loop.
///
/// The loop owns buffer lifecycle and flip scheduling; implementations only
/// ever see a writable surface plus the session state for the frame being
/// drawn. No other state is shared.
pub trait FrameRenderer {
    /// Fill `surface` with the next frame's content.
    fn render_frame(&mut self, surface: &mut PixelSurface<'_>, session: &SessionState);

    /// Paint the cursor sprite into a cursor-plane surface.
    ///
    /// Called once per frame on the half of the cursor pair that is not
    /// currently displayed.
    fn render_cursor(&mut self, surface: &mut PixelSurface<'_>, session: &SessionState);
}

/// Default payload: a flat background with a bouncing filled square, plus a
/// hollow-square cursor whose tone alternates every frame so the plane swap
/// is visible.
#[derive(Clone, Debug)]
pub struct DemoRenderer {
    background: Argb,
    sprite: Argb,
    cursor_even: Argb,
    cursor_odd: Argb,
}

impl Default for DemoRenderer {
    fn default() -> Self {
        Self {
            background: Argb::WHITE,
            sprite: Argb::RED,
            cursor_even: Argb::rgb(0x20, 0x20, 0x20),
            cursor_odd: Argb::rgb(0xe0, 0x7a, 0x1f),
        }
    }
}

impl DemoRenderer {
    /// Demo with custom background and sprite colors.
    #[must_use]
    pub const fn new(background: Argb, sprite: Argb) -> Self {
        Self {
            background,
            sprite,
            cursor_even: Argb::rgb(0x20, 0x20, 0x20),
            cursor_odd: Argb::rgb(0xe0, 0x7a, 0x1f),
        }
    }
}

impl FrameRenderer for DemoRenderer {
    fn render_frame(&mut self, surface: &mut PixelSurface<'_>, session: &SessionState) {
        surface.clear(self.background);
        let sprite = session.sprite();
        surface.fill_rect(sprite.x, sprite.y, sprite.extent, sprite.extent, self.sprite);
    }

    fn render_cursor(&mut self, surface: &mut PixelSurface<'_>, session: &SessionState) {
        let tone = if session.frame() % 2 == 0 {
            self.cursor_even
        } else {
            self.cursor_odd
        };
        surface.clear(Argb::TRANSPARENT);
        let edge = surface.width();
        surface.fill_rect(0, 0, edge, edge, tone);
        let inset = (edge / 4) as i32;
        surface.fill_rect(inset, inset, edge / 2, edge / 2, Argb::TRANSPARENT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface_of(data: &mut [u8], size: u32) -> PixelSurface<'_> {
        PixelSurface::new(data, size, size, size * 4)
    }

    #[test]
    fn test_demo_frame_paints_sprite_over_background() {
        let mut renderer = DemoRenderer::default();
        let session = SessionState::new(96, 96);
        let mut data = vec![0u8; 96 * 96 * 4];
        let mut surface = surface_of(&mut data, 96);
        renderer.render_frame(&mut surface, &session);

        let sprite = *session.sprite();
        let inside = surface.get_pixel(sprite.x as u32 + 1, sprite.y as u32 + 1);
        assert_eq!(inside, Some(Argb::RED));
        assert_eq!(surface.get_pixel(95, 0), Some(Argb::WHITE));
    }

    #[test]
    fn test_demo_cursor_tone_alternates() {
        let mut renderer = DemoRenderer::default();
        let mut even = SessionState::new(64, 64);
        let mut data = vec![0u8; 16 * 16 * 4];

        let mut surface = surface_of(&mut data, 16);
        renderer.render_cursor(&mut surface, &even);
        let tone_even = surface.get_pixel(0, 0);

        even.step(64, 64);
        let mut surface = surface_of(&mut data, 16);
        renderer.render_cursor(&mut surface, &even);
        let tone_odd = surface.get_pixel(0, 0);

        assert_ne!(tone_even, tone_odd);
    }

    #[test]
    fn test_demo_cursor_center_is_transparent() {
        let mut renderer = DemoRenderer::default();
        let session = SessionState::new(64, 64);
        let mut data = vec![0u8; 16 * 16 * 4];
        let mut surface = surface_of(&mut data, 16);
        renderer.render_cursor(&mut surface, &session);
        assert_eq!(surface.get_pixel(8, 8), Some(Argb::TRANSPARENT));
        assert_ne!(surface.get_pixel(0, 0), Some(Argb::TRANSPARENT));
    }
}
