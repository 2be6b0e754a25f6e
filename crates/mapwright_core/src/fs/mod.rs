//! Filesystem abstraction module.
//!
//! This module provides the `FileSystem` trait for abstracting filesystem
//! operations, so the session engine can run against the real disk in the
//! editor and against an in-memory filesystem in tests.

mod memory;
mod native;

pub use memory::InMemoryFileSystem;
pub use native::RealFileSystem;

use std::io::Result;
use std::path::{Path, PathBuf};

/// Abstraction over filesystem operations.
///
/// Send + Sync required because sessions are shared across UI and worker
/// threads.
pub trait FileSystem: Send + Sync {
    /// Reads the file content as UTF-8 text
    fn read_to_string(&self, path: &Path) -> Result<String>;

    /// Reads raw file content (used for open-time snapshots)
    fn read_binary(&self, path: &Path) -> Result<Vec<u8>>;

    /// Overwrites a file, creating it if needed
    fn write_file(&self, path: &Path, content: &str) -> Result<()>;

    /// Writes raw bytes, creating the file if needed
    fn write_binary(&self, path: &Path, content: &[u8]) -> Result<()>;

    /// Creates a file ONLY if it doesn't exist.
    /// Returns an error if the file exists.
    fn create_new(&self, path: &Path, content: &str) -> Result<()>;

    /// Deletes a file
    fn delete_file(&self, path: &Path) -> Result<()>;

    /// Checks if a path exists (file or directory)
    fn exists(&self, path: &Path) -> bool;

    /// Checks if a path is a directory
    fn is_dir(&self, path: &Path) -> bool;

    /// Checks if a path denotes a regular file
    fn is_file(&self, path: &Path) -> bool {
        self.exists(path) && !self.is_dir(path)
    }

    /// Creates a directory and all parent directories
    fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Lists all entries in a directory (not recursive)
    fn list_files(&self, dir: &Path) -> Result<Vec<PathBuf>>;

    /// Resolves a path to its canonical absolute form.
    ///
    /// Used to give every map file exactly one identity regardless of how
    /// its path was spelled. The path must exist.
    fn canonicalize(&self, path: &Path) -> Result<PathBuf>;

    /// Finds map files in a folder
    fn list_dmm_files(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in self.list_files(dir)? {
            if entry.extension().is_some_and(|ext| ext == "dmm") && self.is_file(&entry) {
                files.push(entry);
            }
        }
        Ok(files)
    }

    /// Recursively lists all map files in a directory and its subdirectories
    fn list_dmm_files_recursive(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut all_files = self.list_dmm_files(dir)?;

        // Get subdirectories and recurse
        if let Ok(entries) = self.list_files(dir) {
            for entry in entries {
                if self.is_dir(&entry)
                    && let Ok(subdir_files) = self.list_dmm_files_recursive(&entry)
                {
                    all_files.extend(subdir_files);
                }
            }
        }

        Ok(all_files)
    }
}

// Blanket implementation for references to FileSystem
impl<T: FileSystem> FileSystem for &T {
    fn read_to_string(&self, path: &Path) -> Result<String> {
        (*self).read_to_string(path)
    }

    fn read_binary(&self, path: &Path) -> Result<Vec<u8>> {
        (*self).read_binary(path)
    }

    fn write_file(&self, path: &Path, content: &str) -> Result<()> {
        (*self).write_file(path, content)
    }

    fn write_binary(&self, path: &Path, content: &[u8]) -> Result<()> {
        (*self).write_binary(path, content)
    }

    fn create_new(&self, path: &Path, content: &str) -> Result<()> {
        (*self).create_new(path, content)
    }

    fn delete_file(&self, path: &Path) -> Result<()> {
        (*self).delete_file(path)
    }

    fn exists(&self, path: &Path) -> bool {
        (*self).exists(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        (*self).is_dir(path)
    }

    fn is_file(&self, path: &Path) -> bool {
        (*self).is_file(path)
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        (*self).create_dir_all(path)
    }

    fn list_files(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        (*self).list_files(dir)
    }

    fn canonicalize(&self, path: &Path) -> Result<PathBuf> {
        (*self).canonicalize(path)
    }
}
