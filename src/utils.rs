//! # Utility Functions and Helper Module
//!
//! Small helpers shared across the crate: the interpolated percentile used
//! by every statistical summary, atomic file replacement for exports and
//! lifecycle state, and host descriptors for run metadata.
//!
//! ```rust
//! use opmetrics::utils::percentile;
//!
//! assert_eq!(percentile(&[1.0, 2.0, 3.0, 4.0, 5.0], 95.0), 4.8);
//! ```

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Percentile of an ascending-sorted slice using linear interpolation
///
/// For percentile P the fractional index is `(P/100) * (N-1)`; when it falls
/// between two samples the result is interpolated between them. An empty
/// slice yields 0.0 and a single sample yields that sample for every P.
///
/// The caller must pass sorted data. Interpolating over sorted data keeps the
/// result monotonic in P, which the window summaries rely on.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let index = (p.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
            let lower_index = index.floor() as usize;
            let upper_index = index.ceil() as usize;

            if lower_index == upper_index {
                sorted[lower_index]
            } else {
                let lower_value = sorted[lower_index];
                let upper_value = sorted[upper_index];
                let weight = index - lower_index as f64;
                lower_value + weight * (upper_value - lower_value)
            }
        }
    }
}

/// Sort samples ascending, placing NaN values last.
pub fn sort_samples(values: &mut [f64]) {
    values.sort_by(|a, b| a.total_cmp(b));
}

/// Replace `path` with `contents` so that readers never observe a partial file
///
/// The bytes are written to a uniquely named sibling, flushed to disk and then
/// renamed over the destination. On failure the temporary file is removed and
/// any previous file at `path` is left untouched.
pub fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .with_context(|| format!("{} has no file name", path.display()))?;

    let temp_path = parent.join(format!(
        ".{}.{}.tmp",
        file_name.to_string_lossy(),
        Uuid::new_v4().simple()
    ));

    let result = (|| -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .with_context(|| format!("Failed to create {}", temp_path.display()))?;
        file.write_all(contents)
            .with_context(|| format!("Failed to write {}", temp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync {}", temp_path.display()))?;
        fs::rename(&temp_path, path).with_context(|| {
            format!(
                "Failed to move {} into place at {}",
                temp_path.display(),
                path.display()
            )
        })
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

/// Remove a file, treating "already gone" as success.
///
/// Returns whether a file was actually removed.
pub fn remove_if_exists(path: &Path) -> std::io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Directory holding runtime state by default (pid file, socket, logs).
pub fn default_runtime_dir() -> PathBuf {
    std::env::temp_dir()
}

/// Get the number of CPU cores available
///
/// Uses the `num_cpus` crate, which accounts for cgroup limits, and is
/// reported in run metadata.
pub fn get_cpu_cores() -> usize {
    num_cpus::get()
}

/// Host name for run metadata, "unknown" when it cannot be determined.
pub fn hostname() -> String {
    #[cfg(target_os = "linux")]
    {
        if let Ok(name) = nix::unistd::gethostname() {
            return name.to_string_lossy().into_owned();
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}
