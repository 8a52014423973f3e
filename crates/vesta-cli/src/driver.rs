//! Driver command implementation for Vesta CLI.

use std::time::Instant;

use vesta_core::{JitContext, ResetOptions, Settings};

use crate::colors;

/// Build the bootstrap driver, or rebuild it with `force`.
pub fn execute(settings: Settings, force: bool) -> anyhow::Result<()> {
    let start = Instant::now();
    let mut ctx = JitContext::new(settings)?;

    // Refuse before touching the driver when no platform is available.
    ctx.profile()?;
    if force {
        ctx.reset(ResetOptions {
            rebuild_driver: true,
        })?;
    }
    let driver = ctx.ensure_driver()?;

    if driver.built || force {
        println!(
            "{}Built{} {} in {:.2}s",
            colors::GREEN,
            colors::RESET,
            driver.binary_path.display(),
            start.elapsed().as_secs_f64()
        );
    } else {
        println!(
            "{}Up to date{} {}",
            colors::CYAN,
            colors::RESET,
            driver.binary_path.display()
        );
    }

    Ok(())
}
