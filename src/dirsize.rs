//! Recursive workspace size, computed on the node that hosts the workspace.

use crate::node::FileCallable;
use std::io;
use std::path::Path;

/// Sums the sizes of all regular files under a root.
///
/// Entries that cannot be read (permission denied, vanished mid-walk,
/// locked) are skipped and the walk carries on. A missing root, or one that
/// is not a directory, measures 0. Symlinks are not followed.
#[derive(Debug, Clone)]
pub struct DirectorySize {
    job_name: String,
}

impl DirectorySize {
    /// `job_name` only labels the skip messages logged on the node.
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
        }
    }

    /// Walk `root` on the current machine.
    pub fn measure(&self, root: &Path) -> u64 {
        match std::fs::symlink_metadata(root) {
            Ok(meta) if meta.is_dir() => {}
            _ => return 0,
        }
        let mut total = 0u64;
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    self.skipped(&dir, &e);
                    continue;
                }
            };
            for entry in entries {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        self.skipped(&dir, &e);
                        continue;
                    }
                };
                let path = entry.path();
                // DirEntry::metadata does not traverse symlinks.
                match entry.metadata() {
                    Ok(meta) if meta.is_dir() => pending.push(path),
                    Ok(meta) if meta.is_file() => total = total.saturating_add(meta.len()),
                    Ok(_) => {}
                    Err(e) => self.skipped(&path, &e),
                }
            }
        }
        total
    }

    fn skipped(&self, path: &Path, error: &io::Error) {
        tracing::debug!(
            job = %self.job_name,
            path = %path.display(),
            error = %error,
            "skipping entry in workspace size walk"
        );
    }
}

impl FileCallable for DirectorySize {
    type Output = u64;

    fn invoke(self, root: &Path) -> io::Result<u64> {
        Ok(self.measure(root))
    }
}
