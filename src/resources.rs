//! Host resource gate consulted before write-shaped work.

use std::path::{Path, PathBuf};

use tracing::warn;

/// Host is too low on storage to accept more work.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("disk space critical on {path}: {used_percent:.1}% used, {free_gb:.2} GB free")]
pub struct ResourceExhausted {
    pub path: String,
    pub used_percent: f64,
    pub free_gb: f64,
}

pub trait ResourceGuard: Send + Sync {
    fn ensure_capacity(&self) -> Result<(), ResourceExhausted>;
}

/// Guard that never rejects.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unlimited;

impl ResourceGuard for Unlimited {
    fn ensure_capacity(&self) -> Result<(), ResourceExhausted> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

impl DiskUsage {
    pub fn used_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        let used = self.total_bytes.saturating_sub(self.free_bytes);
        used as f64 * 100.0 / self.total_bytes as f64
    }

    pub fn free_gb(&self) -> f64 {
        self.free_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

/// Rejects work when the filesystem holding `path` is nearly full.
#[derive(Debug, Clone)]
pub struct DiskSpaceGuard {
    path: PathBuf,
    critical_percent: f64,
    min_free_gb: f64,
}

impl DiskSpaceGuard {
    pub fn new(path: impl Into<PathBuf>, critical_percent: f64, min_free_gb: f64) -> Self {
        Self {
            path: path.into(),
            critical_percent,
            min_free_gb,
        }
    }

    fn evaluate(&self, usage: DiskUsage) -> Result<(), ResourceExhausted> {
        let used_percent = usage.used_percent();
        let free_gb = usage.free_gb();
        if used_percent >= self.critical_percent || free_gb < self.min_free_gb {
            return Err(ResourceExhausted {
                path: self.path.display().to_string(),
                used_percent,
                free_gb,
            });
        }
        Ok(())
    }
}

impl ResourceGuard for DiskSpaceGuard {
    fn ensure_capacity(&self) -> Result<(), ResourceExhausted> {
        match disk_usage(&self.path) {
            Ok(usage) => self.evaluate(usage),
            Err(e) => {
                // A broken disk check must not take the control plane down with it.
                warn!(path = %self.path.display(), error = %e, "Disk space check failed, proceeding");
                Ok(())
            }
        }
    }
}

#[cfg(unix)]
pub fn disk_usage(path: &Path) -> std::io::Result<DiskUsage> {
    let stat = nix::sys::statvfs::statvfs(path)?;
    let fragment = stat.fragment_size() as u64;
    Ok(DiskUsage {
        total_bytes: stat.blocks() as u64 * fragment,
        free_bytes: stat.blocks_available() as u64 * fragment,
    })
}

#[cfg(not(unix))]
pub fn disk_usage(_path: &Path) -> std::io::Result<DiskUsage> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "disk usage check is only available on unix",
    ))
}
