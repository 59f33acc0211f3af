use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirStats {
    pub size_bytes: u64,
    pub file_count: u64,
}

/// Sum the sizes of all regular files below `root`.
///
/// Workers are writing into this tree while we walk it, so entries that
/// vanish or cannot be read are skipped instead of failing the scan. A
/// missing root yields zeros.
pub fn dir_stats(root: &Path) -> DirStats {
    let mut stats = DirStats::default();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                if dir != root {
                    debug!("Skipping unreadable folder {:?}: {}", dir, err);
                }
                continue;
            }
        };

        for entry in entries.flatten() {
            let Ok(meta) = fs::symlink_metadata(entry.path()) else {
                continue;
            };
            if meta.is_dir() {
                pending.push(entry.path());
            } else if meta.is_file() {
                stats.size_bytes += meta.len();
                stats.file_count += 1;
            }
        }
    }

    stats
}

/// [`dir_stats`] off the async executor.
pub async fn scan_dir(root: PathBuf) -> DirStats {
    match tokio::task::spawn_blocking(move || dir_stats(&root)).await {
        Ok(stats) => stats,
        Err(err) => {
            warn!("Folder scan task failed: {}", err);
            DirStats::default()
        }
    }
}

/// Size of a local file, `None` when it does not exist or is not a file.
pub fn local_file_size(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().filter(|m| m.is_file()).map(|m| m.len())
}
