//! Free-space check run before each job starts.

use std::path::Path;
use sysinfo::Disks;
use thiserror::Error;
use tracing::{debug, warn};

/// Destination disk does not have the configured headroom.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Insufficient disk space: {available} bytes free, {required} bytes required")]
pub struct DiskSpaceError {
    pub available: u64,
    pub required: u64,
}

/// Free bytes on the disk holding `path`, or `None` if no mounted disk
/// matches.
///
/// The disk with the longest mount point that prefixes `path` wins, so
/// `/media/out` resolves to a `/media` mount rather than `/`.
pub fn available_space(path: &Path) -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

/// Minimum-free-space gate for job destinations.
#[derive(Debug, Clone, Copy)]
pub struct DiskSpaceGate {
    min_free_bytes: u64,
    probe: fn(&Path) -> Option<u64>,
}

impl DiskSpaceGate {
    pub fn new(min_free_bytes: u64) -> Self {
        Self {
            min_free_bytes,
            probe: available_space,
        }
    }

    /// Replace the free-space lookup.
    pub fn with_probe(mut self, probe: fn(&Path) -> Option<u64>) -> Self {
        self.probe = probe;
        self
    }

    pub fn min_free_bytes(&self) -> u64 {
        self.min_free_bytes
    }

    /// Check the disk that will receive `destination`.
    ///
    /// Relative destinations are resolved against the working directory. An
    /// unknown free-space figure passes the check.
    pub fn check(&self, destination: &Path) -> Result<(), DiskSpaceError> {
        let target = if destination.is_absolute() {
            destination.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(destination))
                .unwrap_or_else(|_| destination.to_path_buf())
        };

        match (self.probe)(&target) {
            Some(available) if available < self.min_free_bytes => Err(DiskSpaceError {
                available,
                required: self.min_free_bytes,
            }),
            Some(available) => {
                debug!(path = %target.display(), available, "Disk space check passed");
                Ok(())
            }
            None => {
                warn!(path = %target.display(), "Could not determine free disk space; continuing");
                Ok(())
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn plenty(_: &Path) -> Option<u64> {
        Some(10 * 1024 * 1024 * 1024)
    }

    fn nearly_full(_: &Path) -> Option<u64> {
        Some(1024)
    }

    fn unknown(_: &Path) -> Option<u64> {
        None
    }

    #[test]
    fn test_gate_passes_with_headroom() {
        let gate = DiskSpaceGate::new(2048 * 1024 * 1024).with_probe(plenty);
        assert!(gate.check(Path::new("/out/movie.mkv")).is_ok());
    }

    #[test]
    fn test_gate_rejects_full_disk() {
        let gate = DiskSpaceGate::new(4096).with_probe(nearly_full);
        let err = gate.check(Path::new("/out/movie.mkv")).unwrap_err();
        assert_eq!(err.available, 1024);
        assert_eq!(err.required, 4096);
    }

    #[test]
    fn test_gate_passes_when_space_unknown() {
        let gate = DiskSpaceGate::new(u64::MAX).with_probe(unknown);
        assert!(gate.check(Path::new("relative/out.mkv")).is_ok());
    }

    #[test]
    fn test_zero_minimum_always_passes() {
        let gate = DiskSpaceGate::new(0).with_probe(nearly_full);
        assert!(gate.check(Path::new("/out/a.mp4")).is_ok());
    }
}
