//! Vsync-driven presentation loop.
//!
//! Single-threaded and cooperative: the loop draws into the ring's next free
//! buffer, schedules an asynchronous flip, and blocks only while waiting for
//! the kernel's completion event. Flip completion and "ready to draw the
//! next frame" are the same event; there is no idle period between them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pantalla_core::{FrameRenderer, PixelSurface, SessionState};

use crate::backend::{KmsBackend, OutputInfo};
use crate::device::{DeviceEvent, DisplayDevice};
use crate::error::KmsError;
use crate::ring::{BufferRing, CursorPlanes};

/// Wake-up cadence when no flip is outstanding; a rejected flip would
/// otherwise leave the loop blocked on an event that never comes.
const RETRY_INTERVAL: Duration = Duration::from_millis(16);

/// Configuration for the presentation loop.
#[derive(Clone, Debug)]
pub struct PresenterConfig {
    /// Number of rotating frame buffers.
    pub ring_size: usize,
    /// Cursor plane edge length in pixels.
    pub cursor_edge: u32,
    /// Wall-clock limit; `None` runs until externally stopped.
    pub duration: Option<Duration>,
    /// Frame-count limit, for deterministic runs in tests and benchmarks.
    pub frame_limit: Option<u64>,
    /// Externally owned stop signal, checked between iterations.
    pub stop_flag: Option<Arc<AtomicBool>>,
}

impl Default for PresenterConfig {
    fn default() -> Self {
        Self {
            ring_size: 10,
            cursor_edge: 64,
            duration: None,
            frame_limit: None,
            stop_flag: None,
        }
    }
}

impl PresenterConfig {
    /// Set the ring size.
    #[must_use]
    pub fn with_ring_size(mut self, ring_size: usize) -> Self {
        self.ring_size = ring_size;
        self
    }

    /// Set the cursor edge length.
    #[must_use]
    pub fn with_cursor_edge(mut self, cursor_edge: u32) -> Self {
        self.cursor_edge = cursor_edge;
        self
    }

    /// Stop after `duration` of wall-clock time.
    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Stop after `frames` submitted frames.
    #[must_use]
    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.frame_limit = Some(frames);
        self
    }

    /// Stop when `flag` becomes true.
    #[must_use]
    pub fn with_stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop_flag = Some(flag);
        self
    }
}

/// Counters collected over one run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PresentStats {
    /// Frames drawn and submitted for flipping.
    pub frames_submitted: u64,
    /// Flip completions received.
    pub flips_completed: u64,
    /// Frames skipped because a display bind was rejected.
    pub present_errors: u64,
    /// Completions that arrived with no flip outstanding.
    pub spurious_events: u64,
}

/// The presentation loop: owns the device, a renderer, and the session state
/// threaded through it.
pub struct Presenter<B: KmsBackend, R: FrameRenderer> {
    device: DisplayDevice<B>,
    renderer: R,
    config: PresenterConfig,
}

impl<B: KmsBackend, R: FrameRenderer> Presenter<B, R> {
    /// Create a presenter with the default configuration.
    #[must_use]
    pub fn new(device: DisplayDevice<B>, renderer: R) -> Self {
        Self {
            device,
            renderer,
            config: PresenterConfig::default(),
        }
    }

    /// Replace the configuration.
    #[must_use]
    pub fn with_config(mut self, config: PresenterConfig) -> Self {
        self.config = config;
        self
    }

    /// The owned device.
    #[must_use]
    pub fn device(&self) -> &DisplayDevice<B> {
        &self.device
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &PresenterConfig {
        &self.config
    }

    /// Run the loop until a stop condition fires, then restore the prior
    /// scanout and release every buffer.
    ///
    /// Setup failures (discovery, allocation, mapping, the startup bind)
    /// abort with an error after best-effort cleanup; steady-state bind
    /// failures are logged and the frame skipped.
    pub fn run(&mut self) -> Result<PresentStats, KmsError> {
        if self.config.ring_size < 2 {
            return Err(KmsError::InvalidConfig("ring size must be at least 2"));
        }
        if self.config.cursor_edge == 0 {
            return Err(KmsError::InvalidConfig("cursor edge must be non-zero"));
        }

        let output = match self.device.output() {
            Some(output) => output.clone(),
            None => self.device.discover_output()?.clone(),
        };
        let mut ring = BufferRing::allocate(
            &mut self.device,
            self.config.ring_size,
            output.width,
            output.height,
        )?;
        let cursors = match CursorPlanes::allocate(&mut self.device, self.config.cursor_edge) {
            Ok(cursors) => cursors,
            Err(err) => {
                ring.release_all(&mut self.device);
                return Err(err);
            }
        };

        let session = SessionState::new(output.width, output.height);
        let mut runner = PresentRunner {
            device: &mut self.device,
            renderer: &mut self.renderer,
            config: &self.config,
            output,
            ring,
            cursors,
            session,
            stats: PresentStats::default(),
            cursor_enabled: true,
            bound: false,
        };

        let result = runner.prime().and_then(|()| runner.run_loop());
        runner.restore();
        runner.teardown();
        let stats = runner.stats;
        result.map(|()| stats)
    }
}

/// One run's worth of loop state, borrowed from the presenter so teardown
/// happens on every exit path.
struct PresentRunner<'a, B: KmsBackend, R: FrameRenderer> {
    device: &'a mut DisplayDevice<B>,
    renderer: &'a mut R,
    config: &'a PresenterConfig,
    output: OutputInfo,
    ring: BufferRing,
    cursors: CursorPlanes,
    session: SessionState,
    stats: PresentStats,
    cursor_enabled: bool,
    bound: bool,
}

impl<B: KmsBackend, R: FrameRenderer> PresentRunner<'_, B, R> {
    /// Map-and-clear the ring, paint the cursor pair, draw the opening frame
    /// and bind it synchronously, then image the cursor plane.
    fn prime(&mut self) -> Result<(), KmsError> {
        // Map every buffer once up front so map failures abort startup.
        for index in 0..self.ring.len() {
            let buffer = self.ring.buffer(index);
            let mut mapping = buffer.map(&mut *self.device)?;
            mapping.as_mut().fill(0);
        }

        // Both cursor buffers get painted before the plane shows either.
        for _ in 0..2 {
            self.paint_back_cursor()?;
            self.cursors.swap();
        }

        // Opening frame into buffer 0, then the startup bind. A rejected
        // bind here is fatal; there is nothing on screen to fall back to.
        {
            let buffer = self.ring.buffer(0);
            let (width, height, pitch) = (buffer.width(), buffer.height(), buffer.pitch());
            let mut mapping = buffer.map(&mut *self.device)?;
            let mut surface = PixelSurface::new(mapping.as_mut(), width, height, pitch);
            self.renderer.render_frame(&mut surface, &self.session);
        }
        let first = self.ring.buffer(0).framebuffer_id();
        self.device.present(first, 0, 0)?;
        self.bound = true;
        self.ring.mark_on_screen(0);
        self.ring.advance();
        self.session.step(self.output.width, self.output.height);

        // The cursor plane is best-effort; some hardware has none.
        if let Err(err) = self.enable_cursor() {
            eprintln!("[pantalla] cursor plane unavailable: {err}");
            self.cursor_enabled = false;
        }
        Ok(())
    }

    fn enable_cursor(&mut self) -> Result<(), KmsError> {
        self.device.set_cursor_image(self.cursors.active().handle())?;
        let (x, y) = self.cursors.position();
        self.device.move_cursor_plane(x, y)
    }

    fn run_loop(&mut self) -> Result<(), KmsError> {
        let deadline = self.config.duration.map(|d| Instant::now() + d);
        loop {
            if self.should_stop(deadline) {
                break;
            }
            if self.device.pending_flip().is_none() {
                self.submit_frame();
            }
            match self.device.wait_event(self.wait_timeout(deadline))? {
                DeviceEvent::FlipCompleted { token } => {
                    debug_assert_eq!(self.ring.pending(), Some(token as usize));
                    self.ring.complete_flip();
                    self.stats.flips_completed += 1;
                }
                DeviceEvent::TimedOut => {}
                DeviceEvent::SpuriousFlip => {
                    self.stats.spurious_events += 1;
                    eprintln!("[pantalla] flip completion arrived with no flip outstanding");
                }
            }
        }
        Ok(())
    }

    fn should_stop(&self, deadline: Option<Instant>) -> bool {
        if let Some(flag) = &self.config.stop_flag {
            if flag.load(Ordering::Relaxed) {
                return true;
            }
        }
        if let Some(limit) = self.config.frame_limit {
            if self.stats.frames_submitted >= limit {
                return true;
            }
        }
        deadline.is_some_and(|d| Instant::now() >= d)
    }

    fn wait_timeout(&self, deadline: Option<Instant>) -> Option<Duration> {
        let headroom = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        if self.device.pending_flip().is_some() {
            headroom
        } else {
            // No completion is coming; wake at the retry cadence instead.
            Some(headroom.map_or(RETRY_INTERVAL, |h| h.min(RETRY_INTERVAL)))
        }
    }

    /// Draw into the next free ring buffer and schedule its flip.
    fn submit_frame(&mut self) {
        let Some(index) = self.ring.acquire() else {
            // The draw target is still owned by the display; wait for its
            // flip to retire rather than scribbling on a live buffer.
            return;
        };
        match self.draw_and_flip(index) {
            Ok(()) => {
                self.stats.frames_submitted += 1;
                self.ring.mark_submitted(index);
                self.ring.advance();
            }
            Err(err) => {
                self.stats.present_errors += 1;
                eprintln!("[pantalla] frame skipped: {err}");
            }
        }
    }

    fn draw_and_flip(&mut self, index: usize) -> Result<(), KmsError> {
        let buffer = self.ring.buffer(index);
        let (width, height, pitch) = (buffer.width(), buffer.height(), buffer.pitch());
        let framebuffer = buffer.framebuffer_id();
        {
            let mut mapping = self.ring.buffer(index).map(&mut *self.device)?;
            let mut surface = PixelSurface::new(mapping.as_mut(), width, height, pitch);
            self.renderer.render_frame(&mut surface, &self.session);
        }
        self.session.step(self.output.width, self.output.height);
        self.update_cursor();
        self.device.request_async_flip(framebuffer, index as u64)
    }

    fn update_cursor(&mut self) {
        if !self.cursor_enabled {
            return;
        }
        if let Err(err) = self.try_update_cursor() {
            eprintln!("[pantalla] cursor plane disabled: {err}");
            self.cursor_enabled = false;
        }
    }

    /// Repaint the off-screen half of the pair, swap roles, re-image and
    /// move the plane.
    fn try_update_cursor(&mut self) -> Result<(), KmsError> {
        self.paint_back_cursor()?;
        let handle = self.cursors.swap();
        self.device.set_cursor_image(handle)?;
        self.cursors.step(self.output.width, self.output.height);
        let (x, y) = self.cursors.position();
        self.device.move_cursor_plane(x, y)
    }

    fn paint_back_cursor(&mut self) -> Result<(), KmsError> {
        let back = self.cursors.back();
        let (edge, pitch) = (self.cursors.edge(), back.pitch());
        let mut mapping = back.map(&mut *self.device)?;
        let mut surface = PixelSurface::new(mapping.as_mut(), edge, edge, pitch);
        self.renderer.render_cursor(&mut surface, &self.session);
        Ok(())
    }

    /// Put the pre-session scanout back, best-effort.
    fn restore(&mut self) {
        if !self.bound {
            return;
        }
        match self.device.restore_prior_scanout() {
            Ok(true) => {}
            Ok(false) => {
                eprintln!("[pantalla] no prior scanout recorded; leaving last frame bound");
            }
            Err(err) => eprintln!("[pantalla] could not restore prior scanout: {err}"),
        }
    }

    /// Release buffers in reverse acquisition order: cursor pair, then ring.
    fn teardown(&mut self) {
        self.cursors.release_all(&mut *self.device);
        self.ring.release_all(&mut *self.device);
    }
}
