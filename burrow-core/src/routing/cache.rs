//! Learned-PROXY cache backing the AUTO rule.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use parking_lot::{Mutex, RwLock};

use crate::error::Result;

pub(crate) const CACHE_FILE: &str = ".proxy-cache";

/// Hosts learned to require the proxy, mirrored to an append-only file.
/// Entries are never removed while the process runs.
pub(crate) struct ProxyCache {
    hosts: RwLock<HashSet<String>>,
    file: Mutex<File>,
}

impl ProxyCache {
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let mut opts = OpenOptions::new();
        opts.create(true).read(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o664);
        }
        let file = opts.open(path)?;

        let mut hosts = HashSet::new();
        for line in BufReader::new(&file).lines() {
            let line = line?;
            let host = line.trim();
            if !host.is_empty() {
                hosts.insert(host.to_string());
            }
        }

        Ok(Self {
            hosts: RwLock::new(hosts),
            file: Mutex::new(file),
        })
    }

    pub(crate) fn contains(&self, host: &str) -> bool {
        self.hosts.read().contains(host)
    }

    /// Records `host`. The absent-to-present transition appends exactly one
    /// line; re-inserting is a no-op.
    pub(crate) fn insert(&self, host: &str) {
        let mut hosts = self.hosts.write();
        if hosts.insert(host.to_string()) {
            let mut file = self.file.lock();
            if let Err(e) = writeln!(file, "{}", host) {
                tracing::warn!("Appending {} to the proxy cache failed: {}", host, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("burrow-cache-{}-{}", tag, std::process::id()))
    }

    #[test]
    fn insert_is_idempotent_on_the_file() {
        let path = temp_path("idem");
        let _ = std::fs::remove_file(&path);

        let cache = ProxyCache::open(&path).unwrap();
        cache.insert("blocked.example");
        cache.insert("blocked.example");
        cache.insert("other.example");
        assert!(cache.contains("blocked.example"));
        assert!(!cache.contains("unknown.example"));
        drop(cache);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "blocked.example\nother.example\n");
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn reopen_restores_entries() {
        let path = temp_path("reopen");
        let _ = std::fs::remove_file(&path);

        {
            let cache = ProxyCache::open(&path).unwrap();
            cache.insert("persisted.example");
        }
        let cache = ProxyCache::open(&path).unwrap();
        assert!(cache.contains("persisted.example"));

        // re-inserting a loaded entry must not duplicate the line
        cache.insert("persisted.example");
        drop(cache);
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "persisted.example\n");
        std::fs::remove_file(&path).unwrap();
    }
}
