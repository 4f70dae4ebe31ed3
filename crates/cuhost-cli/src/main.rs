mod demo;

use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use cuhost_core::config::{default_config_path, CuhostConfig};
use cuhost_driver::{Context, ContextFlags, Cuda, DeviceAttribute};
use tracing::info;

#[derive(Parser)]
#[command(name = "cuhost")]
#[command(about = "cuhost - CUDA driver host bindings: device listing and vector add demo")]
#[command(version)]
struct Cli {
    /// Configuration file path (defaults to CUHOST_CONFIG or the platform location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Use the in-process emulated driver instead of the system driver
    #[arg(long, global = true)]
    emulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the driver version and every visible device
    Info,

    /// Add two integer vectors on the device and print the result
    Add {
        /// Kernel source to compile instead of the bundled PTX
        #[arg(short, long)]
        source: Option<PathBuf>,

        /// Run the transfers and launch on a non-blocking stream
        #[arg(long = "async")]
        use_async: bool,
    },
}

fn main() -> anyhow::Result<()> {
    cuhost_common::init_logging();

    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => CuhostConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => CuhostConfig::load_or_default(default_config_path()),
    };

    let cuda = if cli.emulate {
        info!("using emulated driver");
        Cuda::with_driver(demo::emulator()).context("initializing emulated driver")?
    } else {
        Cuda::load_with(&config.driver).context("loading CUDA driver")?
    };

    match cli.command {
        Commands::Info => print_info(&cuda)?,
        Commands::Add { source, use_async } => {
            let run = demo::run_add(&cuda, &config, source.as_deref(), use_async)
                .context("vector add failed")?;
            println!("{:?} + {:?} = {:?}", run.b, run.a, run.c);
        }
    }

    Ok(())
}

fn print_info(cuda: &Cuda) -> anyhow::Result<()> {
    let version = cuda.driver_version()?;
    println!("CUDA driver {}.{}", version / 1000, (version % 1000) / 10);

    let devices = cuda.devices()?;
    if devices.is_empty() {
        println!("no devices found");
        return Ok(());
    }
    for device in devices {
        let (major, minor) = device.compute_capability()?;
        println!("Device {}: {}", device.ordinal(), device.name()?);
        println!("  UUID:               {}", device.uuid_string()?);
        println!("  Memory:             {} MiB", device.total_memory()? / (1024 * 1024));
        println!("  Compute capability: {}.{}", major, minor);
        println!(
            "  Multiprocessors:    {}",
            device.attribute(DeviceAttribute::MultiprocessorCount)?
        );

        let ctx = Context::create(&device, ContextFlags::default())
            .with_context(|| format!("creating context on device {}", device.ordinal()))?;
        let (free, total) = ctx.memory_info()?;
        println!("  Free / total:       {} / {} MiB", free / (1024 * 1024), total / (1024 * 1024));
        ctx.destroy()?;
    }
    Ok(())
}
