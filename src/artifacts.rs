//! Transient Artifact Scope
//!
//! Every file written for one report operation is registered here before it
//! is written. `release` (or drop) removes whatever still exists, once.
//!
//! Each scope owns a fresh directory named with a random operation id, so
//! concurrent operations never share a path.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

const SCOPE_DIR_PREFIX: &str = "laudo-";

#[derive(Debug)]
pub struct ArtifactScope {
    operation_id: Uuid,
    root: PathBuf,
    tracked: Vec<PathBuf>,
    counter: u32,
    released: bool,
}

impl ArtifactScope {
    /// Create the scope directory under `base`.
    pub fn open(base: &Path) -> io::Result<Self> {
        let operation_id = Uuid::new_v4();
        let root = base.join(format!("{SCOPE_DIR_PREFIX}{}", operation_id.simple()));
        fs::create_dir_all(base)?;
        fs::create_dir(&root)?;
        debug!(operation = %operation_id, root = %root.display(), "Artifact scope opened");
        Ok(Self {
            operation_id,
            root,
            tracked: Vec::new(),
            counter: 0,
            released: false,
        })
    }

    pub fn operation_id(&self) -> Uuid {
        self.operation_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reserve a unique path `<stem>-<n>.<ext>` inside the scope and track it.
    pub fn reserve(&mut self, stem: &str, ext: &str) -> PathBuf {
        let path = self.root.join(format!("{stem}-{}.{ext}", self.counter));
        self.counter += 1;
        self.tracked.push(path.clone());
        path
    }

    /// Reserve a path with an exact file name. Names are unique per scope only.
    pub fn reserve_named(&mut self, file_name: &str) -> PathBuf {
        let path = self.root.join(file_name);
        if !self.tracked.contains(&path) {
            self.tracked.push(path.clone());
        }
        path
    }

    /// Write `bytes` to a freshly reserved path.
    pub fn write(&mut self, stem: &str, ext: &str, bytes: &[u8]) -> io::Result<PathBuf> {
        let path = self.reserve(stem, ext);
        fs::write(&path, bytes)?;
        Ok(path)
    }

    pub fn tracked(&self) -> &[PathBuf] {
        &self.tracked
    }

    /// Remove every tracked artifact that still exists, then the scope directory.
    ///
    /// Missing files are not errors. Calling this twice is a no-op the second time.
    /// Returns the number of files removed.
    pub fn release(&mut self) -> usize {
        if self.released {
            return 0;
        }
        self.released = true;

        let mut removed = 0;
        for path in self.tracked.drain(..).rev() {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove artifact"),
            }
        }

        // Also sweeps anything a library dropped next to our files.
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(root = %self.root.display(), error = %e, "Failed to remove scope directory"),
        }

        debug!(operation = %self.operation_id, removed, "Artifact scope released");
        removed
    }
}

impl Drop for ArtifactScope {
    fn drop(&mut self) {
        self.release();
    }
}
