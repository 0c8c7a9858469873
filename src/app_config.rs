//! Module for application configuration settings.
//!
//! User configurations may be specified in a configuration file; CLI flags
//! override it field by field in `main`.

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::path::{Path, PathBuf};
use std::time::Duration;

use blobfs::fs::{FileMode, FsConfig};

/// A `PathBuf` that automatically expands `~` to the user's home directory
/// during deserialization, so any path loaded from configuration is
/// already resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ExpandedPathBuf(PathBuf);

impl<'de> Deserialize<'de> for ExpandedPathBuf {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        let expanded = shellexpand::tilde(&raw);
        Ok(Self(PathBuf::from(expanded.into_owned())))
    }
}

impl AsRef<Path> for ExpandedPathBuf {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid mode string {0:?}: expected octal like \"0644\"")]
    BadMode(String),
    #[error("part size {0} is below the 5 MiB store minimum")]
    PartTooSmall(ByteSize),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub mount: MountSection,
    pub attributes: AttributeSection,
    pub tuning: TuningSection,
}

/// What to mount and how it maps onto POSIX.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MountSection {
    /// Key prefix the mount lives under.
    pub prefix: String,
    /// Owner for presented files; defaults to the mounting user.
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Octal default mode for files, e.g. `"0644"`.
    pub file_mode: String,
    /// Octal default mode for directories, e.g. `"0755"`.
    pub dir_mode: String,
    /// Preserve mtimes through blob metadata.
    pub preserve_mtime: bool,
    /// Preserve uid/gid/permissions through blob metadata.
    pub preserve_perms: bool,
    /// Preserve symlinks and device nodes through blob metadata.
    pub preserve_specials: bool,
    /// Directory for disk-cache files; unset disables the disk cache.
    pub cache_dir: Option<ExpandedPathBuf>,
}

impl Default for MountSection {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            uid: None,
            gid: None,
            file_mode: "0644".to_string(),
            dir_mode: "0755".to_string(),
            preserve_mtime: true,
            preserve_perms: false,
            preserve_specials: false,
            cache_dir: None,
        }
    }
}

/// Names of the metadata keys used for attribute preservation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AttributeSection {
    pub mtime: String,
    pub uid: String,
    pub gid: String,
    pub mode: String,
    pub rdev: String,
    pub symlink: String,
}

impl Default for AttributeSection {
    fn default() -> Self {
        Self {
            mtime: "mtime".to_string(),
            uid: "uid".to_string(),
            gid: "gid".to_string(),
            mode: "mode".to_string(),
            rdev: "rdev".to_string(),
            symlink: "--symlink-target".to_string(),
        }
    }
}

/// Flush and memory knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TuningSection {
    pub part_size: ByteSize,
    pub multipart_threshold: ByteSize,
    pub memory_limit: ByteSize,
    pub attr_ttl_secs: u64,
}

impl Default for TuningSection {
    fn default() -> Self {
        Self {
            part_size: ByteSize::mib(5),
            multipart_threshold: ByteSize::mib(10),
            memory_limit: ByteSize::mib(256),
            attr_ttl_secs: 1,
        }
    }
}

fn parse_octal_mode(raw: &str) -> Result<u32, ConfigError> {
    u32::from_str_radix(raw.trim_start_matches("0o"), 8)
        .map_err(|_| ConfigError::BadMode(raw.to_string()))
}

impl Config {
    /// Load from `path`, or from the default location, or fall back to
    /// defaults when no file exists. An explicitly-given path must exist.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match dirs::config_dir() {
                Some(dir) => (dir.join("blobfs").join("config.toml"), false),
                None => return Ok(Self::default()),
            },
        };

        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        };
        toml::from_str(&raw).map_err(|source| ConfigError::Parse { path, source })
    }

    /// Validate and lower into the filesystem-core configuration.
    pub fn to_fs_config(&self) -> Result<FsConfig, ConfigError> {
        if self.tuning.part_size < ByteSize::mib(5) {
            return Err(ConfigError::PartTooSmall(self.tuning.part_size));
        }
        let defaults = FsConfig::default();
        Ok(FsConfig {
            uid: self.mount.uid.unwrap_or(defaults.uid),
            gid: self.mount.gid.unwrap_or(defaults.gid),
            file_mode: FileMode::from_bits(parse_octal_mode(&self.mount.file_mode)?),
            dir_mode: FileMode::from_bits(parse_octal_mode(&self.mount.dir_mode)?),
            enable_mtime: self.mount.preserve_mtime,
            enable_perms: self.mount.preserve_perms,
            enable_specials: self.mount.preserve_specials,
            mtime_attr: self.attributes.mtime.clone(),
            uid_attr: self.attributes.uid.clone(),
            gid_attr: self.attributes.gid.clone(),
            file_mode_attr: self.attributes.mode.clone(),
            rdev_attr: self.attributes.rdev.clone(),
            symlink_attr: self.attributes.symlink.clone(),
            mount_prefix: self.mount.prefix.clone(),
            part_size: self.tuning.part_size.as_u64(),
            multipart_threshold: self.tuning.multipart_threshold.as_u64(),
            memory_limit: self.tuning.memory_limit.as_u64(),
            flush_error_window: defaults.flush_error_window,
            attr_ttl: Duration::from_secs(self.tuning.attr_ttl_secs),
            cache_dir: self
                .mount
                .cache_dir
                .as_ref()
                .map(|p| p.as_ref().to_path_buf()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_lower_cleanly() {
        let config = Config::default();
        let fs = config.to_fs_config().expect("defaults must validate");
        assert_eq!(fs.file_mode.bits(), 0o644);
        assert_eq!(fs.dir_mode.bits(), 0o755);
        assert_eq!(fs.part_size, 5 * 1024 * 1024);
        assert!(fs.enable_mtime);
        assert!(!fs.enable_perms);
    }

    #[test]
    fn octal_modes_are_parsed() {
        let mut config = Config::default();
        config.mount.file_mode = "0600".to_string();
        let fs = config.to_fs_config().expect("valid mode");
        assert_eq!(fs.file_mode.bits(), 0o600);

        config.mount.file_mode = "whatever".to_string();
        assert!(matches!(
            config.to_fs_config(),
            Err(ConfigError::BadMode(_))
        ));
    }

    #[test]
    fn undersized_parts_are_rejected() {
        let mut config = Config::default();
        config.tuning.part_size = ByteSize::mib(1);
        assert!(matches!(
            config.to_fs_config(),
            Err(ConfigError::PartTooSmall(_))
        ));
    }

    #[test]
    fn toml_round_trip() {
        let raw = r#"
            [mount]
            prefix = "team/data/"
            preserve_perms = true

            [tuning]
            part_size = "8 MiB"
        "#;
        let config: Config = toml::from_str(raw).expect("parse");
        assert_eq!(config.mount.prefix, "team/data/");
        assert!(config.mount.preserve_perms);
        assert_eq!(config.tuning.part_size, ByteSize::mib(8));
        let fs = config.to_fs_config().expect("validate");
        assert_eq!(fs.mount_prefix, "team/data/");
    }
}
