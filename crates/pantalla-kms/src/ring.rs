//! Round-robin frame buffers and the alternating cursor pair.

use crate::backend::KmsBackend;
use crate::buffer::GraphicsBuffer;
use crate::device::DisplayDevice;
use crate::error::KmsError;

/// Fixed pool of rotating off-screen buffers.
///
/// A single cursor tracks the next buffer to draw into; on top of the pure
/// modulo rotation the ring tracks which buffer is on screen and which is
/// pending a flip, so a draw never lands in a buffer the display still
/// references.
#[derive(Debug)]
pub struct BufferRing {
    buffers: Vec<GraphicsBuffer>,
    current: usize,
    on_screen: Option<usize>,
    pending: Option<usize>,
}

impl BufferRing {
    /// Allocate `count` buffers of `width x height` pixels.
    ///
    /// On a partial failure every already-allocated buffer is released
    /// before the error propagates.
    pub fn allocate<B: KmsBackend>(
        device: &mut DisplayDevice<B>,
        count: usize,
        width: u32,
        height: u32,
    ) -> Result<Self, KmsError> {
        debug_assert!(count >= 2, "ring needs at least two buffers");
        let mut buffers = Vec::with_capacity(count);
        for _ in 0..count {
            match GraphicsBuffer::allocate(device, width, height) {
                Ok(buffer) => buffers.push(buffer),
                Err(err) => {
                    for buffer in &mut buffers {
                        buffer.release(device);
                    }
                    return Err(err);
                }
            }
        }
        Ok(Self {
            buffers,
            current: 0,
            on_screen: None,
            pending: None,
        })
    }

    /// Number of buffers in the ring.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether the ring holds no buffers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Index the next draw will target.
    #[must_use]
    pub const fn current_index(&self) -> usize {
        self.current
    }

    /// Buffer at `index`.
    #[must_use]
    pub fn buffer(&self, index: usize) -> &GraphicsBuffer {
        &self.buffers[index]
    }

    /// Index currently scanned out, if any.
    #[must_use]
    pub const fn on_screen(&self) -> Option<usize> {
        self.on_screen
    }

    /// Index with a flip outstanding, if any.
    #[must_use]
    pub const fn pending(&self) -> Option<usize> {
        self.pending
    }

    /// The current index, if its buffer is neither on screen nor pending a
    /// flip; `None` means the draw must wait for a completion first.
    #[must_use]
    pub fn acquire(&self) -> Option<usize> {
        let index = self.current;
        if Some(index) == self.on_screen || Some(index) == self.pending {
            None
        } else {
            Some(index)
        }
    }

    /// Move the cursor to `(current + 1) mod len`.
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.buffers.len();
    }

    /// Record that `index` was bound synchronously and is now scanned out.
    pub fn mark_on_screen(&mut self, index: usize) {
        self.on_screen = Some(index);
    }

    /// Record that a flip to `index` was submitted.
    pub fn mark_submitted(&mut self, index: usize) {
        debug_assert!(self.pending.is_none(), "flip already pending");
        self.pending = Some(index);
    }

    /// Retire the outstanding flip: the pending buffer is now on screen and
    /// the buffer it replaced is free again. Returns the freed index.
    pub fn complete_flip(&mut self) -> Option<usize> {
        let retired = self.on_screen;
        self.on_screen = self.pending.take();
        retired
    }

    /// Release every buffer, in order.
    pub fn release_all<B: KmsBackend>(&mut self, device: &mut DisplayDevice<B>) {
        for buffer in &mut self.buffers {
            buffer.release(device);
        }
        self.on_screen = None;
        self.pending = None;
    }
}

/// Two alternating cursor-plane buffers plus the plane's motion state.
///
/// The pair swaps roles every animation step: the off-screen member is
/// repainted while the hardware keeps displaying the other, so the sprite
/// never tears.
#[derive(Debug)]
pub struct CursorPlanes {
    buffers: [GraphicsBuffer; 2],
    active: usize,
    x: i32,
    y: i32,
    dx: i32,
    dy: i32,
    edge: u32,
}

impl CursorPlanes {
    /// Allocate the pair at `edge x edge` pixels.
    pub fn allocate<B: KmsBackend>(
        device: &mut DisplayDevice<B>,
        edge: u32,
    ) -> Result<Self, KmsError> {
        let mut first = GraphicsBuffer::allocate(device, edge, edge)?;
        let second = match GraphicsBuffer::allocate(device, edge, edge) {
            Ok(buffer) => buffer,
            Err(err) => {
                first.release(device);
                return Err(err);
            }
        };
        Ok(Self {
            buffers: [first, second],
            active: 0,
            x: 0,
            y: 0,
            dx: 11,
            dy: 7,
            edge,
        })
    }

    /// Cursor edge length in pixels.
    #[must_use]
    pub const fn edge(&self) -> u32 {
        self.edge
    }

    /// Buffer currently imaged on the plane.
    #[must_use]
    pub fn active(&self) -> &GraphicsBuffer {
        &self.buffers[self.active]
    }

    /// Buffer safe to repaint (not the one the plane displays).
    #[must_use]
    pub fn back(&self) -> &GraphicsBuffer {
        &self.buffers[self.active ^ 1]
    }

    /// Swap roles; returns the handle now fronting the plane.
    pub fn swap(&mut self) -> u32 {
        self.active ^= 1;
        self.buffers[self.active].handle()
    }

    /// Current plane position.
    #[must_use]
    pub const fn position(&self) -> (i32, i32) {
        (self.x, self.y)
    }

    /// Advance one step, reflecting off the `width x height` output bounds.
    pub fn step(&mut self, width: u32, height: u32) {
        self.x += self.dx;
        self.y += self.dy;
        let max_x = width as i32 - self.edge as i32;
        let max_y = height as i32 - self.edge as i32;
        if self.x <= 0 {
            self.x = 0;
            self.dx = self.dx.abs();
        } else if self.x >= max_x {
            self.x = max_x;
            self.dx = -self.dx.abs();
        }
        if self.y <= 0 {
            self.y = 0;
            self.dy = self.dy.abs();
        } else if self.y >= max_y {
            self.y = max_y;
            self.dy = -self.dy.abs();
        }
    }

    /// Release both buffers.
    pub fn release_all<B: KmsBackend>(&mut self, device: &mut DisplayDevice<B>) {
        for buffer in &mut self.buffers {
            buffer.release(device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TestBackend;
    use proptest::prelude::*;

    fn device() -> DisplayDevice<TestBackend> {
        DisplayDevice::with_backend(TestBackend::new(640, 480))
    }

    #[test]
    fn test_ring_rotation_is_pure_modulo() {
        let mut device = device();
        let mut ring = BufferRing::allocate(&mut device, 10, 64, 64).expect("ring");
        for _ in 0..25 {
            ring.advance();
        }
        assert_eq!(ring.current_index(), 5);
    }

    #[test]
    fn test_acquire_refuses_on_screen_buffer() {
        let mut device = device();
        let mut ring = BufferRing::allocate(&mut device, 3, 64, 64).expect("ring");
        ring.mark_on_screen(0);
        assert_eq!(ring.acquire(), None);
        ring.advance();
        assert_eq!(ring.acquire(), Some(1));
    }

    #[test]
    fn test_acquire_refuses_pending_buffer() {
        let mut device = device();
        let mut ring = BufferRing::allocate(&mut device, 3, 64, 64).expect("ring");
        ring.mark_submitted(0);
        assert_eq!(ring.acquire(), None);
    }

    #[test]
    fn test_complete_flip_frees_the_replaced_buffer() {
        let mut device = device();
        let mut ring = BufferRing::allocate(&mut device, 3, 64, 64).expect("ring");
        ring.mark_on_screen(0);
        ring.mark_submitted(1);
        assert_eq!(ring.complete_flip(), Some(0));
        assert_eq!(ring.on_screen(), Some(1));
        assert_eq!(ring.pending(), None);
        // Buffer 0 left the screen and is drawable again.
        assert_eq!(ring.acquire(), Some(0));
    }

    #[test]
    fn test_partial_allocation_failure_releases_everything() {
        let backend = TestBackend::new(640, 480).fail_create_at(2);
        let mut device = DisplayDevice::with_backend(backend);
        let result = BufferRing::allocate(&mut device, 4, 64, 64);
        assert!(result.is_err());
        assert_eq!(device.backend().live_allocations(), 0);
        assert_eq!(device.backend().live_framebuffers(), 0);
    }

    #[test]
    fn test_release_all_is_leak_free() {
        let mut device = device();
        let mut ring = BufferRing::allocate(&mut device, 4, 64, 64).expect("ring");
        ring.release_all(&mut device);
        assert_eq!(device.backend().live_allocations(), 0);
        assert_eq!(device.backend().live_framebuffers(), 0);
    }

    #[test]
    fn test_cursor_pair_alternates_two_identities() {
        let mut device = device();
        let mut cursors = CursorPlanes::allocate(&mut device, 64).expect("cursors");
        let first = cursors.active().handle();
        let second = cursors.back().handle();
        assert_ne!(first, second);
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(cursors.swap());
        }
        assert_eq!(seen, vec![second, first, second, first, second, first]);
    }

    #[test]
    fn test_cursor_back_is_never_active() {
        let mut device = device();
        let mut cursors = CursorPlanes::allocate(&mut device, 64).expect("cursors");
        for _ in 0..5 {
            assert_ne!(cursors.back().handle(), cursors.active().handle());
            cursors.swap();
        }
    }

    #[test]
    fn test_cursor_bounces_inside_output() {
        let mut device = device();
        let mut cursors = CursorPlanes::allocate(&mut device, 64).expect("cursors");
        for _ in 0..500 {
            cursors.step(640, 480);
            let (x, y) = cursors.position();
            assert!(x >= 0 && x + 64 <= 640);
            assert!(y >= 0 && y + 64 <= 480);
        }
    }

    proptest! {
        #[test]
        fn prop_advance_is_modulo(count in 2usize..16, advances in 0usize..200) {
            let mut device = device();
            let mut ring = BufferRing::allocate(&mut device, count, 16, 16).expect("ring");
            for _ in 0..advances {
                ring.advance();
            }
            prop_assert_eq!(ring.current_index(), advances % count);
        }
    }
}
