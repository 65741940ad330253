//! Scoped per-workflow scratch directories.

use crate::Result;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use uuid::Uuid;

/// A unique directory under the OS temp root, removed when dropped.
///
/// Every workflow acquires one of these and does all of its disk I/O inside
/// it, so cleanup holds on every exit path including panics and early
/// returns.
pub struct Workdir {
    dir: TempDir,
}

impl Workdir {
    pub fn create(agent: &str, project_id: Uuid) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("modelforge-{agent}-{project_id}-"))
            .tempdir()?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn join(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workdir_is_removed_on_drop() {
        let project_id = Uuid::new_v4();
        let path;
        {
            let workdir = Workdir::create("dataset", project_id).unwrap();
            path = workdir.path().to_path_buf();
            std::fs::write(workdir.join("scratch.bin"), b"tmp").unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
