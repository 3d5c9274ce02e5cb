//! Where photos and videos land, and how they are named.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

/// `<pictures>/Camera`, falling back to `~/Pictures/Camera` and then `./Camera`.
pub(crate) fn default_output_dir() -> PathBuf {
    if let Some(pictures) = directories::UserDirs::new()
        .as_ref()
        .and_then(|dirs| dirs.picture_dir())
    {
        return pictures.join("Camera");
    }
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join("Pictures").join("Camera"))
        .unwrap_or_else(|| PathBuf::from("Camera"))
}

/// `<dir>/<prefix>_<YYYYMMDD_HHMMSS>.<ext>`. A file already taken in the same
/// second gets a `_2`, `_3`, ... suffix.
pub(crate) fn timestamped_path(
    dir: &Path,
    prefix: &str,
    ext: &str,
    now: DateTime<Local>,
) -> PathBuf {
    let stem = format!("{prefix}_{}", now.format("%Y%m%d_%H%M%S"));
    let mut path = dir.join(format!("{stem}.{ext}"));
    let mut n = 2;
    while path.exists() {
        path = dir.join(format!("{stem}_{n}.{ext}"));
        n += 1;
    }
    path
}
