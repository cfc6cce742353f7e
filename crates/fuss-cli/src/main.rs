//! # fuss
//!
//! Userspace overlay filesystem: runs a command under ptrace and redirects
//! its filesystem syscalls beneath a virtual mountpoint onto a layered
//! overlay, with no kernel mounts and no privileges.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

use fuss_overlay::{OverlayConfig, OverlayFs, WhiteoutStyle};
use fuss_tracer::Tracer;

/// Userspace overlay filesystem supervisor.
#[derive(Parser)]
#[command(name = "fuss")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Virtual mount point under which syscalls are redirected
    #[arg(long)]
    mountpoint: PathBuf,

    /// Writable upper layer directory
    #[arg(long)]
    upperdir: PathBuf,

    /// Read-only lower layers, colon-separated (leftmost = top)
    #[arg(long)]
    lowerdir: Option<String>,

    /// Whiteout style: fileprefix or chardev
    #[arg(long, default_value = "fileprefix")]
    whiteout: String,

    /// Command to run under supervision
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    command: Vec<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("FUSS_LOG")
                .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let lower_dirs: Vec<PathBuf> = cli
        .lowerdir
        .as_deref()
        .map(|list| list.split(':').map(PathBuf::from).collect())
        .unwrap_or_default();

    for dir in &lower_dirs {
        if !dir.is_dir() {
            bail!("lower directory does not exist: {}", dir.display());
        }
    }
    if !cli.upperdir.is_dir() {
        bail!("upper directory does not exist: {}", cli.upperdir.display());
    }

    let whiteout = match cli.whiteout.to_lowercase().as_str() {
        "chardev" => WhiteoutStyle::CharDevice,
        "fileprefix" => WhiteoutStyle::FilePrefix,
        other => bail!("unknown whiteout style: {other}"),
    };

    let overlay = OverlayFs::new(OverlayConfig {
        lower_dirs,
        upper_dir: cli.upperdir,
        whiteout,
    });

    let mut tracer = Tracer::new(overlay, &cli.mountpoint);
    let code = tracer
        .run(&cli.command)
        .with_context(|| format!("failed to trace {}", cli.command[0]))?;
    std::process::exit(code);
}
