//! Path resolution.
//!
//! Paths use `/` or `\` separators. A leading separator anchors the
//! walk at the root cluster, anything else at the caller's start
//! cluster (normally the volume cwd). `.` stays put, and is legal at
//! the root too. `..` ascends through the directory's dot-dot entry; at
//! the root it fails with `EnterRootParent`. Every other segment must
//! match a live directory entry carrying the directory attribute.
//!
//! [`FileSystem::resolve`] is pure with respect to volume state; the
//! cwd-committing wrapper is `FileSystem::change_dir`. The walk is
//! bounded by the segment iterator, so no step counter is needed.

use crate::fs::FileSystem;
use crate::{Error, ROOT_CLUSTER};

/// Split a path into its directory part and final name. The directory
/// part keeps its trailing separator so it resolves as a path itself.
/// An empty final name (trailing separator or empty path) is unusable.
pub(crate) fn split_path(path: &str) -> Result<(&str, &str), Error> {
    let path = path.trim();
    match path.rfind(['/', '\\']) {
        Some(i) => {
            let leaf = &path[i + 1..];
            if leaf.is_empty() {
                Err(Error::InvalidName)
            } else {
                Ok((&path[..i + 1], leaf))
            }
        }
        None => {
            if path.is_empty() {
                Err(Error::InvalidName)
            } else {
                Ok(("", path))
            }
        }
    }
}

impl FileSystem {
    /// Walk `path` from `start` and return the terminal directory
    /// cluster without touching the cwd.
    pub fn resolve(&self, path: &str, start: u32) -> Result<u32, Error> {
        let path = path.trim();
        let mut clu = if path.starts_with(['/', '\\']) {
            ROOT_CLUSTER
        } else {
            start
        };

        for segment in path.split(['/', '\\']) {
            if segment.is_empty() || segment == "." {
                continue;
            }
            if segment == ".." {
                if clu == ROOT_CLUSTER {
                    return Err(Error::EnterRootParent);
                }
                let (entry, _, _) = self
                    .dir_find_entry(clu, "..")?
                    .ok_or(Error::EnterDirNotFound)?;
                clu = normalize_dir_cluster(entry.first_cluster());
                continue;
            }
            match self.dir_find_entry(clu, segment)? {
                Some((entry, _, _)) if entry.is_dir() => {
                    clu = normalize_dir_cluster(entry.first_cluster());
                }
                _ => return Err(Error::EnterDirNotFound),
            }
        }
        Ok(clu)
    }
}

/// The dot-dot entry of a directory whose parent is the root stores
/// first-cluster 0; map it back to the root cluster.
fn normalize_dir_cluster(cluster: u32) -> u32 {
    if cluster < 2 {
        ROOT_CLUSTER
    } else {
        cluster
    }
}
