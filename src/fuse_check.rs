//! FUSE availability checks.
//!
//! Failing early with an actionable message beats letting `mount` die with
//! a raw errno.

#[cfg(target_os = "macos")]
use std::path::Path;

#[cfg(target_os = "macos")]
mod paths {
    pub const MACFUSE_FS_BUNDLE: &str = "/Library/Filesystems/macfuse.fs";
    pub const OSXFUSE_FS_BUNDLE: &str = "/Library/Filesystems/osxfuse.fs";
    pub const MACFUSE_MOUNT_HELPER: &str =
        "/Library/Filesystems/macfuse.fs/Contents/Resources/mount_macfuse";
    pub const OSXFUSE_MOUNT_HELPER: &str =
        "/Library/Filesystems/osxfuse.fs/Contents/Resources/mount_osxfuse";
    pub const LIBFUSE_DYLIB: &str = "/usr/local/lib/libfuse.2.dylib";
}

#[cfg(target_os = "macos")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FuseProvider {
    MacFuse,
    OsxFuse,
}

#[cfg(target_os = "macos")]
impl FuseProvider {
    fn detect() -> Option<Self> {
        if Path::new(paths::MACFUSE_FS_BUNDLE).is_dir() {
            Some(Self::MacFuse)
        } else if Path::new(paths::OSXFUSE_FS_BUNDLE).is_dir() {
            Some(Self::OsxFuse)
        } else {
            None
        }
    }

    const fn mount_helper_path(self) -> &'static str {
        match self {
            Self::MacFuse => paths::MACFUSE_MOUNT_HELPER,
            Self::OsxFuse => paths::OSXFUSE_MOUNT_HELPER,
        }
    }
}

/// Errors that can occur when verifying FUSE availability.
#[derive(Debug, thiserror::Error)]
pub enum FuseCheckError {
    /// No FUSE implementation is installed.
    #[cfg(target_os = "macos")]
    #[error(
        "macFUSE is not installed. blobfs requires macFUSE to mount filesystems.\n\
         Install it from: https://macfuse.github.io/"
    )]
    NotInstalled,

    /// The mount helper binary is missing.
    #[cfg(target_os = "macos")]
    #[error(
        "macFUSE mount helper not found at {path}. Installation may be corrupt.\n\
         Reinstall from: https://macfuse.github.io/"
    )]
    MountHelperMissing {
        /// Path where the mount helper was expected.
        path: &'static str,
    },

    /// The libfuse shared library is missing.
    #[cfg(target_os = "macos")]
    #[error(
        "macFUSE library missing at /usr/local/lib/libfuse.2.dylib. \
         macFUSE may have been partially uninstalled.\n\
         Reinstall from: https://macfuse.github.io/"
    )]
    LibfuseMissing,

    /// The FUSE character device is missing.
    #[cfg(target_os = "linux")]
    #[error(
        "/dev/fuse does not exist. The fuse kernel module is not loaded \
         (try: modprobe fuse) or this environment does not expose it"
    )]
    DeviceMissing,

    /// No fusermount helper on PATH.
    #[cfg(target_os = "linux")]
    #[error(
        "neither fusermount3 nor fusermount was found on PATH. \
         Install the fuse3 package for your distribution"
    )]
    FusermountMissing,
}

/// Verify that FUSE is installed and usable on the current platform.
#[cfg(target_os = "macos")]
pub fn ensure_fuse() -> Result<(), FuseCheckError> {
    let provider = FuseProvider::detect().ok_or(FuseCheckError::NotInstalled)?;

    let helper = provider.mount_helper_path();
    if !Path::new(helper).is_file() {
        return Err(FuseCheckError::MountHelperMissing { path: helper });
    }

    if !Path::new(paths::LIBFUSE_DYLIB).exists() {
        return Err(FuseCheckError::LibfuseMissing);
    }

    Ok(())
}

/// Verify that FUSE is installed and usable on the current platform.
#[cfg(target_os = "linux")]
pub fn ensure_fuse() -> Result<(), FuseCheckError> {
    if !std::path::Path::new("/dev/fuse").exists() {
        return Err(FuseCheckError::DeviceMissing);
    }

    let on_path = std::env::var_os("PATH").is_some_and(|path| {
        std::env::split_paths(&path)
            .any(|dir| dir.join("fusermount3").is_file() || dir.join("fusermount").is_file())
    });
    if !on_path {
        return Err(FuseCheckError::FusermountMissing);
    }

    Ok(())
}

/// On platforms without a check, assume the mount call will tell us.
#[cfg(not(any(target_os = "macos", target_os = "linux")))]
pub fn ensure_fuse() -> Result<(), FuseCheckError> {
    Ok(())
}
