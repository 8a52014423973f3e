//! Clean command implementation for Vesta CLI.

use vesta_core::{JitContext, Settings};

use crate::colors;

/// Wipe the build folder, rebuilding the driver when asked and possible.
pub fn execute(settings: Settings, recompile_driver: bool) -> anyhow::Result<()> {
    let mut ctx = JitContext::new(settings)?;
    ctx.clean(recompile_driver)?;

    println!(
        "{}Cleaned{} {}",
        colors::GREEN,
        colors::RESET,
        ctx.build_folder().display()
    );
    if recompile_driver && ctx.status().driver_built {
        println!("  Bootstrap driver rebuilt");
    }

    Ok(())
}
