//! Vesta CLI - JIT compiler and artifact cache for GPU kernels.

mod clean;
mod colors;
mod compile;
mod driver;
mod status;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use vesta_core::Settings;

#[derive(Parser)]
#[command(name = "vesta")]
#[command(about = "JIT compiler and artifact cache for GPU kernels")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Build folder (overrides VESTA_BUILD_FOLDER)
    #[arg(long, global = true)]
    build_folder: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the CUDA toolchain, devices and build folder
    Status,

    /// Print the build folder
    BuildFolder,

    /// Build the bootstrap driver
    Driver {
        /// Rebuild even if the driver exists
        #[arg(long)]
        force: bool,
    },

    /// Compile a kernel source file through the cache
    Compile {
        /// Path to the CUDA source (.cu file)
        source: PathBuf,

        /// Target device
        #[arg(short, long, default_value = "0")]
        device: u32,

        /// Compile with half-precision support
        #[arg(long)]
        half: bool,

        /// Record the reduction as indexed by the first variable
        #[arg(long)]
        indexed_by_first: bool,

        /// Output dimension recorded in the sidecar
        #[arg(long, default_value = "1")]
        dim: usize,

        /// Formula identity (defaults to the source text)
        #[arg(long)]
        id: Option<String>,
    },

    /// Delete everything in the build folder
    Clean {
        /// Do not rebuild the bootstrap driver afterwards
        #[arg(long)]
        no_recompile: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::from_env();
    if let Some(folder) = cli.build_folder {
        settings = settings.with_build_folder(folder);
    }

    // Initialize logging
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else if settings.verbose {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Helper to format vesta-core errors with recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(vesta_err) = err.downcast_ref::<vesta_core::Error>() {
            anyhow::anyhow!("{}", vesta_err.with_hint())
        } else {
            err
        }
    };

    match cli.command {
        Commands::Status => status::execute(settings).map_err(format_error)?,

        Commands::BuildFolder => println!("{}", settings.build_folder.display()),

        Commands::Driver { force } => driver::execute(settings, force).map_err(format_error)?,

        Commands::Compile {
            source,
            device,
            half,
            indexed_by_first,
            dim,
            id,
        } => {
            let options = compile::CompileOptions {
                device,
                half,
                indexed_by_first,
                dim,
                id,
            };
            compile::execute(settings, &source, options).map_err(format_error)?;
        }

        Commands::Clean { no_recompile } => {
            clean::execute(settings, !no_recompile).map_err(format_error)?;
        }
    }

    Ok(())
}
