//! On-disk snapshot of the feature record.
//!
//! Layout: an 8-byte little-endian header — a format-version magic and a
//! host fingerprint, each checked independently — followed by the
//! `KernelFeatures` snapshot as JSON. Any load failure, from a missing
//! file to a flipped magic to trailing garbage, is uniformly a miss;
//! the orchestrator then falls through to a full probe run. Saves write
//! to a unique sibling tmp file and rename into place so a concurrent
//! reader never sees a torn snapshot, even with racing writers.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::types::KernelFeatures;
use stasis_common::{boot_id, utsname};

/// Format-version magic. Bump whenever the payload layout changes.
pub const FORMAT_MAGIC: u32 = 0x53_4b_46_31; // "SKF1"

/// Header length: format magic + host fingerprint, both u32 LE.
pub const HEADER_LEN: usize = 8;

/// Errors surfaced by [`save`]; load failures never escape as errors.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("snapshot did not serialize: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Typed outcome of decoding a cache file.
#[derive(Debug)]
pub enum CacheVerdict {
    /// Both magics matched and the payload decoded.
    Valid(KernelFeatures),
    /// Structurally sound but from another format version or host.
    Mismatch { reason: &'static str },
    /// Too short, truncated, or undecodable payload.
    Corrupt,
}

/// Fingerprint of the host identity: the first four bytes of a SHA-256
/// over kernel release, kernel version string, and boot id.
///
/// Any of those changing (kernel upgrade, rebuild, reboot into a
/// different kernel) invalidates every cached snapshot.
pub fn host_fingerprint() -> u32 {
    let mut hasher = Sha256::new();
    if let Some(uts) = utsname() {
        hasher.update(uts.release.as_bytes());
        hasher.update(b"\0");
        hasher.update(uts.version.as_bytes());
        hasher.update(b"\0");
    }
    if let Some(id) = boot_id() {
        hasher.update(id.as_bytes());
    }
    let digest = hasher.finalize();
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Default snapshot location under the system cache directory.
pub fn default_cache_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("stasis")
        .join("kernfeat.bin")
}

/// Decode raw cache bytes against the current host expectations.
pub fn decode(bytes: &[u8]) -> CacheVerdict {
    let Some(header) = bytes.get(..HEADER_LEN) else {
        return CacheVerdict::Corrupt;
    };
    let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let fingerprint = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

    if magic != FORMAT_MAGIC {
        return CacheVerdict::Mismatch {
            reason: "format magic",
        };
    }
    if fingerprint != host_fingerprint() {
        return CacheVerdict::Mismatch {
            reason: "host fingerprint",
        };
    }
    match serde_json::from_slice(&bytes[HEADER_LEN..]) {
        Ok(features) => CacheVerdict::Valid(features),
        Err(_) => CacheVerdict::Corrupt,
    }
}

/// Load a snapshot; every failure mode is a miss, never an error.
pub fn load(path: &Path) -> Option<KernelFeatures> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            debug!(path = %path.display(), error = %err, "no cache snapshot");
            return None;
        }
    };
    match decode(&bytes) {
        CacheVerdict::Valid(features) => {
            info!(path = %path.display(), "loaded cached kernel feature snapshot");
            Some(features)
        }
        CacheVerdict::Mismatch { reason } => {
            debug!(path = %path.display(), reason, "cache snapshot mismatch");
            None
        }
        CacheVerdict::Corrupt => {
            debug!(path = %path.display(), "cache snapshot corrupt");
            None
        }
    }
}

/// Encode header + payload for a snapshot.
pub fn encode(features: &KernelFeatures) -> Result<Vec<u8>, CacheError> {
    let payload = serde_json::to_vec(features)?;
    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(&FORMAT_MAGIC.to_le_bytes());
    bytes.extend_from_slice(&host_fingerprint().to_le_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Persist a snapshot atomically (unique tmp write + rename).
///
/// Each writer gets its own temporary in the target directory, so
/// concurrent savers (lazy-probe refreshes, other processes sharing the
/// default path) never scribble over each other's half-written file; a
/// concurrent load sees either the old snapshot or a complete new one.
pub fn save(path: &Path, features: &KernelFeatures) -> Result<(), CacheError> {
    let bytes = encode(features)?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(&bytes)?;
    tmp.persist(path).map_err(|err| CacheError::Io(err.error))?;
    debug!(path = %path.display(), len = bytes.len(), "snapshot persisted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LoginuidMode, PagemapMode};

    fn sample_features() -> KernelFeatures {
        KernelFeatures {
            shmem_dev: 0x23,
            last_cap: 40,
            pagemap: PagemapMode::FlagsOnly,
            loginuid: LoginuidMode::ReadOnly,
            has_memfd: true,
            task_size: 0x7fff_ffff_f000,
            probed_at: "2026-08-30T00:00:00+00:00".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_fingerprint_stable_within_process() {
        assert_eq!(host_fingerprint(), host_fingerprint());
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let features = sample_features();
        let bytes = encode(&features).unwrap();
        match decode(&bytes) {
            CacheVerdict::Valid(back) => assert_eq!(back, features),
            verdict => panic!("expected valid snapshot, got {verdict:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_flipped_format_magic() {
        let mut bytes = encode(&sample_features()).unwrap();
        bytes[0] ^= 0xff;
        assert!(matches!(
            decode(&bytes),
            CacheVerdict::Mismatch {
                reason: "format magic"
            }
        ));
    }

    #[test]
    fn test_decode_rejects_flipped_fingerprint() {
        let mut bytes = encode(&sample_features()).unwrap();
        bytes[4] ^= 0xff;
        assert!(matches!(
            decode(&bytes),
            CacheVerdict::Mismatch {
                reason: "host fingerprint"
            }
        ));
    }

    #[test]
    fn test_decode_rejects_short_and_empty() {
        assert!(matches!(decode(&[]), CacheVerdict::Corrupt));
        assert!(matches!(decode(&[0x31]), CacheVerdict::Corrupt));
        assert!(matches!(
            decode(&FORMAT_MAGIC.to_le_bytes()),
            CacheVerdict::Corrupt
        ));
    }

    #[test]
    fn test_decode_rejects_garbage_payload() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&FORMAT_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&host_fingerprint().to_le_bytes());
        bytes.extend_from_slice(b"{not json");
        assert!(matches!(decode(&bytes), CacheVerdict::Corrupt));
    }

    #[test]
    fn test_decode_rejects_truncated_payload() {
        let bytes = encode(&sample_features()).unwrap();
        let cut = &bytes[..bytes.len() - 10];
        assert!(matches!(decode(cut), CacheVerdict::Corrupt));
    }

    #[test]
    fn test_load_missing_file_is_miss() {
        assert!(load(Path::new("/definitely/not/a/cache.bin")).is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("kernfeat.bin");
        let features = sample_features();
        save(&path, &features).unwrap();
        assert_eq!(load(&path), Some(features));
        // No tmp file left behind.
        let names: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, ["kernfeat.bin"]);
    }

    #[test]
    fn test_concurrent_saves_never_expose_torn_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernfeat.bin");
        let variants: Vec<KernelFeatures> = (0..4u32)
            .map(|i| {
                let mut features = sample_features();
                features.last_cap = 40 + i;
                features
            })
            .collect();

        std::thread::scope(|scope| {
            for features in &variants {
                let path = &path;
                scope.spawn(move || {
                    for _ in 0..25 {
                        save(path, features).unwrap();
                    }
                });
            }
            let path = &path;
            let variants = &variants;
            scope.spawn(move || {
                for _ in 0..200 {
                    // Every observable state is a complete snapshot from
                    // one of the writers, never a torn mix.
                    if let Some(loaded) = load(path) {
                        assert!(variants.contains(&loaded));
                    }
                }
            });
        });
        assert!(load(&path).is_some());
    }

    #[test]
    fn test_load_zero_length_file_is_miss() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernfeat.bin");
        std::fs::write(&path, b"").unwrap();
        assert!(load(&path).is_none());
    }

    #[test]
    fn test_default_path_under_stasis_dir() {
        let path = default_cache_path();
        assert!(path.ends_with("stasis/kernfeat.bin"));
    }
}
