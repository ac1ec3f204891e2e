//! pantalla - present vsync-flipped frames directly through kernel mode
//! setting, with an animated hardware cursor plane.
//!
//! Exits 0 after a clean run-and-restore, 1 on any setup failure (device
//! open, output discovery, buffer allocation/mapping, startup bind).

use clap::Parser;
use pantalla_core::DemoRenderer;
use pantalla_kms::{DisplayDevice, KmsError, Presenter, PresenterConfig};
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "pantalla")]
#[command(about = "Flip rendered frames straight to a display via kernel mode setting")]
#[command(version)]
struct Cli {
    /// DRM device node to open
    #[arg(short, long, default_value = "/dev/dri/card0")]
    device: String,

    /// Seconds to run before restoring the previous scanout (0 = until stopped)
    #[arg(short, long, default_value = "5")]
    seconds: u64,

    /// Number of rotating frame buffers
    #[arg(long, default_value = "10")]
    ring_size: usize,

    /// Cursor plane edge length in pixels
    #[arg(long, default_value = "64")]
    cursor_size: u32,
}

fn run(cli: &Cli) -> Result<(), KmsError> {
    let device = DisplayDevice::open(&cli.device)?;

    let mut config = PresenterConfig::default()
        .with_ring_size(cli.ring_size)
        .with_cursor_edge(cli.cursor_size);
    if cli.seconds > 0 {
        config = config.with_duration(Duration::from_secs(cli.seconds));
    }

    let mut presenter = Presenter::new(device, DemoRenderer::default()).with_config(config);
    let stats = presenter.run()?;
    eprintln!(
        "[pantalla] presented {} frames ({} flips completed, {} skipped)",
        stats.frames_submitted, stats.flips_completed, stats.present_errors
    );
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("[pantalla] {err}");
            ExitCode::FAILURE
        }
    }
}
