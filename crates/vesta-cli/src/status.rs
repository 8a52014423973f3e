//! Status command implementation for Vesta CLI.

use vesta_core::{JitContext, Settings};

use crate::colors;

/// Print the probed platform and the build folder state.
///
/// A missing platform is reported, not treated as a failure.
pub fn execute(settings: Settings) -> anyhow::Result<()> {
    let ctx = JitContext::new(settings)?;
    let status = ctx.status();

    println!("\n{}Vesta Status{}", colors::BOLD, colors::RESET);
    println!("{}", "─".repeat(50));

    match &status.profile {
        Ok(profile) => {
            println!(
                "  CUDA:          {}{}{} ({})",
                colors::GREEN,
                profile.version_string(),
                colors::RESET,
                profile.toolchain_version
            );
            println!("  Target format: {}", profile.target_format);
            println!("  Devices:       {}", profile.device_count);
            for (id, device) in profile.devices.iter().enumerate() {
                println!(
                    "    {}[{}]{} max threads/block {}, shared mem/block {} B",
                    colors::DIM,
                    id,
                    colors::RESET,
                    device.max_threads_per_block,
                    device.shared_mem_per_block
                );
            }
        }
        Err(reason) => {
            println!(
                "  CUDA:          {}unavailable{} ({})",
                colors::YELLOW,
                colors::RESET,
                reason
            );
        }
    }

    println!("  Build folder:  {}", status.build_folder.display());
    println!(
        "  Driver:        {} ({})",
        status.driver_path.display(),
        if status.driver_built {
            "built"
        } else {
            "not built"
        }
    );

    Ok(())
}
