//! Escaping and interpretation of blob metadata.
//!
//! Object stores constrain metadata to header-safe strings, so arbitrary
//! xattr keys and values are percent-escaped on the way out and unescaped on
//! the way in. Keys are additionally lowercased because stores fold header
//! case. Entries that fail strict unescaping are dropped rather than
//! surfaced — a foreign writer's malformed metadata must not break the mount.

use std::collections::HashMap;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_encode};

use super::{FileMode, FsConfig, InodeAttributes, time_from_nanos};

/// Everything except unreserved characters is escaped, matching what the
/// strict decoder below accepts back.
const METADATA_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Percent-escape one metadata component.
#[must_use]
pub fn escape_component(raw: &[u8]) -> String {
    percent_encode(raw, METADATA_ESCAPE).to_string()
}

/// Strict inverse of [`escape_component`]: `None` on a malformed or
/// truncated percent sequence.
#[must_use]
pub fn unescape_component(escaped: &str) -> Option<Vec<u8>> {
    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hi = char::from(*bytes.get(i + 1)?).to_digit(16)?;
            let lo = char::from(*bytes.get(i + 2)?).to_digit(16)?;
            out.push(u8::try_from(hi * 16 + lo).unwrap_or(0));
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Some(out)
}

/// Encode a user-metadata map for a PUT: lowercased, escaped keys and
/// escaped values.
#[must_use]
pub fn escape_metadata(meta: &HashMap<String, Vec<u8>>) -> HashMap<String, String> {
    meta.iter()
        .map(|(k, v)| {
            (
                escape_component(k.to_lowercase().as_bytes()),
                escape_component(v),
            )
        })
        .collect()
}

/// Decode metadata observed on a blob. Unescapable entries are silently
/// dropped.
#[must_use]
pub fn unescape_metadata(meta: &HashMap<String, String>) -> HashMap<String, Vec<u8>> {
    meta.iter()
        .filter_map(|(k, v)| {
            let key = unescape_component(&k.to_lowercase())?;
            let key = String::from_utf8(key).ok()?;
            let value = unescape_component(v)?;
            Some((key, value))
        })
        .collect()
}

fn parse_u64(value: &[u8]) -> Option<u64> {
    std::str::from_utf8(value).ok()?.trim().parse().ok()
}

fn parse_u32(value: &[u8]) -> Option<u32> {
    std::str::from_utf8(value).ok()?.trim().parse().ok()
}

/// Fold recognized user-metadata keys into `attrs`, honoring the
/// preservation switches in `config`.
///
/// The mode key replaces only the halves the configuration allows: the
/// permission half under `enable_perms`, the type half under
/// `enable_specials` — and the type half only when the current mode carries
/// no type bits (a known directory stays a directory). Device modes pull
/// their rdev from the companion key.
pub fn apply_user_metadata(
    attrs: &mut InodeAttributes,
    meta: &HashMap<String, Vec<u8>>,
    config: &FsConfig,
) {
    if config.enable_mtime
        && let Some(seconds) = meta.get(&config.mtime_attr).and_then(|v| parse_u64(v))
    {
        attrs.mtime = time_from_nanos(seconds.saturating_mul(1_000_000_000));
    }
    if config.enable_perms {
        if let Some(uid) = meta.get(&config.uid_attr).and_then(|v| parse_u32(v)) {
            attrs.uid = uid;
        }
        if let Some(gid) = meta.get(&config.gid_attr).and_then(|v| parse_u32(v)) {
            attrs.gid = gid;
        }
    }
    if (config.enable_perms || config.enable_specials)
        && let Some(bits) = meta.get(&config.file_mode_attr).and_then(|v| parse_u32(v))
    {
        let stored = FileMode::from_bits(bits);
        if config.enable_perms {
            attrs.mode = attrs.mode.with_perm(stored.perm());
        }
        if config.enable_specials && attrs.mode.file_type() == 0 {
            attrs.mode = attrs.mode.with_file_type(stored.file_type());
        }
        if attrs.mode.is_device() {
            attrs.rdev = meta
                .get(&config.rdev_attr)
                .and_then(|v| parse_u32(v))
                .unwrap_or(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::time_to_nanos;

    #[test]
    fn escape_round_trips_binary_values() {
        let value: Vec<u8> = (0..=255).collect();
        let escaped = escape_component(&value);
        assert!(escaped.is_ascii(), "escaped form must be header-safe");
        assert_eq!(unescape_component(&escaped).as_deref(), Some(&value[..]));
    }

    #[test]
    fn escape_after_unescape_is_identity() {
        let mut meta = HashMap::new();
        meta.insert("plain".to_string(), b"value".to_vec());
        meta.insert("needs escaping".to_string(), vec![0x00, 0xff, b'%']);

        let wire = escape_metadata(&meta);
        let back = unescape_metadata(&wire);
        assert_eq!(back, meta);
        assert_eq!(escape_metadata(&back), wire);
    }

    #[test]
    fn keys_are_lowercased() {
        let mut meta = HashMap::new();
        meta.insert("X-Custom".to_string(), "1".to_string());
        let decoded = unescape_metadata(&meta);
        assert_eq!(decoded.get("x-custom").map(Vec::as_slice), Some(&b"1"[..]));
    }

    #[test]
    fn malformed_entries_are_dropped() {
        let mut meta = HashMap::new();
        meta.insert("ok".to_string(), "fine".to_string());
        meta.insert("bad".to_string(), "%zz".to_string());
        meta.insert("truncated".to_string(), "abc%4".to_string());

        let decoded = unescape_metadata(&meta);
        assert_eq!(decoded.len(), 1);
        assert!(decoded.contains_key("ok"));
    }

    #[test]
    fn mtime_attr_is_decoded_when_enabled() {
        let config = FsConfig::default();
        let mut attrs = InodeAttributes::default_file(&config);
        let mut meta = HashMap::new();
        meta.insert(config.mtime_attr.clone(), b"1700000000".to_vec());

        apply_user_metadata(&mut attrs, &meta, &config);
        assert_eq!(
            time_to_nanos(attrs.mtime),
            1_700_000_000 * 1_000_000_000,
            "mtime should come from the preserved attribute"
        );
    }

    #[test]
    fn mode_attr_respects_type_guard() {
        let mut config = FsConfig::default();
        config.enable_perms = true;
        config.enable_specials = true;
        let mut attrs = InodeAttributes::default_file(&config);
        attrs.mode = FileMode::from_bits(libc::S_IFREG | 0o644);

        let mut meta = HashMap::new();
        meta.insert(
            config.file_mode_attr.clone(),
            (libc::S_IFLNK | 0o777).to_string().into_bytes(),
        );
        apply_user_metadata(&mut attrs, &meta, &config);

        assert_eq!(attrs.mode.perm(), 0o777, "perm half should be replaced");
        assert_eq!(
            attrs.mode.file_type(),
            libc::S_IFREG,
            "an already-typed mode must not be retyped"
        );
    }

    #[test]
    fn rdev_attr_is_read_for_device_modes() {
        let mut config = FsConfig::default();
        config.enable_specials = true;
        let mut attrs = InodeAttributes::default_file(&config);
        attrs.mode = FileMode::from_bits(0o600);

        let mut meta = HashMap::new();
        meta.insert(
            config.file_mode_attr.clone(),
            (libc::S_IFCHR | 0o600).to_string().into_bytes(),
        );
        meta.insert(config.rdev_attr.clone(), b"259".to_vec());
        apply_user_metadata(&mut attrs, &meta, &config);

        assert!(attrs.mode.is_device());
        assert_eq!(attrs.rdev, 259);
    }
}
