//! Disk-space preflight before opening the stores.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
const WARN_THRESHOLD_PCT: f64 = 85.0;

/// Warn when the filesystem holding the pipeline directory is nearly
/// full. Best-effort: any failure to stat is silently ignored.
pub fn check_disk_space(db: &Path) {
    // The pipeline directory may not exist yet; stat the closest
    // existing ancestor instead.
    let mut probe = db;
    while !probe.exists() {
        match probe.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => probe = parent,
            _ => return,
        }
    }

    let Ok(cpath) = CString::new(probe.as_os_str().as_bytes()) else {
        return;
    };
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(cpath.as_ptr(), &mut stat) } != 0 {
        return;
    }

    #[allow(clippy::cast_precision_loss)]
    let frsize = stat.f_frsize as f64;
    #[allow(clippy::cast_precision_loss)]
    let total = stat.f_blocks as f64 * frsize;
    #[allow(clippy::cast_precision_loss)]
    let available = stat.f_bavail as f64 * frsize;
    if total <= 0.0 {
        return;
    }

    let used_pct = (1.0 - available / total) * 100.0;
    if used_pct > WARN_THRESHOLD_PCT {
        tracing::warn!(
            path = %db.display(),
            used_pct = format!("{used_pct:.1}"),
            free_gib = format!("{:.1}", available / GIB),
            "disk nearly full; the metadata store may slow down"
        );
    }
}
