//! Mount an object-store bucket as a local filesystem.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

mod app_config;
mod fuse_check;
mod trc;

use blobfs::backend::StorageBackend;
use blobfs::backend::memory::MemoryBackend;
use blobfs::fs::BlobFs;
use blobfs::fs::fuser::FuserAdapter;

use crate::app_config::Config;

#[derive(Parser)]
#[command(
    version,
    about = "Mount an object-store bucket as a POSIX-ish filesystem."
)]
struct Args {
    /// Bucket URI, e.g. `mem://scratch`. Real stores plug in through the
    /// library's `StorageBackend` trait.
    bucket: String,

    /// Where to mount.
    mountpoint: PathBuf,

    #[arg(short, long, help = "Optional path to a blobfs config TOML.")]
    config_path: Option<PathBuf>,

    #[arg(long, help = "Key prefix to mount under (overrides the config).")]
    prefix: Option<String>,

    #[arg(long, help = "Disk cache directory (overrides the config).")]
    cache_dir: Option<PathBuf>,

    #[arg(long, help = "Allow other users to access the mount.")]
    allow_other: bool,

    #[arg(short, long, help = "Enable debug logging for blobfs crates.")]
    verbose: bool,
}

/// Build the backend for a bucket URI.
fn backend_for(bucket: &str) -> Result<Arc<dyn StorageBackend>, String> {
    match bucket.split_once("://") {
        Some(("mem", _)) => Ok(Arc::new(MemoryBackend::new())),
        Some((scheme, _)) => Err(format!(
            "no built-in client for `{scheme}://` buckets; implement \
             blobfs::backend::StorageBackend and embed blobfs as a library"
        )),
        None => Err(format!(
            "`{bucket}` is not a bucket URI (expected something like mem://scratch)"
        )),
    }
}

#[expect(
    clippy::exit,
    reason = "top-level helper that intentionally terminates the process"
)]
fn fatal(message: &str) -> ! {
    error!("{message}");
    std::process::exit(1);
}

#[expect(
    clippy::exit,
    reason = "argument/config errors are reported before tracing exists"
)]
fn main() {
    let args = Args::parse();

    // Load config first — errors use eprintln since tracing isn't
    // initialized yet.
    let mut config = Config::load(args.config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });
    if let Some(prefix) = args.prefix {
        config.mount.prefix = prefix;
    }
    let mut fs_config = config.to_fs_config().unwrap_or_else(|e| {
        eprintln!("Configuration is invalid: {e}");
        std::process::exit(1);
    });
    if let Some(cache_dir) = args.cache_dir {
        fs_config.cache_dir = Some(cache_dir);
    }

    if let Err(e) = trc::init(args.verbose) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    if let Err(e) = fuse_check::ensure_fuse() {
        fatal(&e.to_string());
    }

    if let Some(cache_dir) = &fs_config.cache_dir
        && let Err(e) = std::fs::create_dir_all(cache_dir)
    {
        fatal(&format!(
            "cannot create cache directory {}: {e}",
            cache_dir.display()
        ));
    }

    let backend = match backend_for(&args.bucket) {
        Ok(backend) => backend,
        Err(msg) => fatal(&msg),
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => fatal(&format!("failed to start async runtime: {e}")),
    };

    let fs = runtime.block_on(BlobFs::new(fs_config, backend));
    let adapter = FuserAdapter::new(Arc::clone(&fs), runtime.handle().clone());

    let mut options = vec![
        fuser::MountOption::FSName(format!("blobfs:{}", args.bucket)),
        fuser::MountOption::DefaultPermissions,
        fuser::MountOption::NoAtime,
    ];
    if args.allow_other {
        options.push(fuser::MountOption::AllowOther);
    }

    info!(bucket = %args.bucket, mountpoint = %args.mountpoint.display(), "mounting");
    if let Err(e) = fuser::mount2(adapter, &args.mountpoint, &options) {
        fatal(&format!("mount failed: {e}"));
    }
    info!("unmounted");
}
