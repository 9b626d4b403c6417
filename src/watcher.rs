//! Live filesystem watch: one non-recursive `notify` watch per stored directory, translating
//! each filesystem event into the same store mutations a crawl would have made, then propagating
//! the resulting size/mtime delta up the parent chain.
//!
//! Registers watches for the entire existing subtree before entering the event loop, mirroring
//! the historical worker's "subscribe before processing" ordering so that nothing created in the
//! gap between the crawl finishing and the watch starting is missed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{EventKind, RecursiveMode, Watcher as NotifyWatcherTrait};

use crate::config::Config;
use crate::entry::unix_time;
use crate::error::{FilesystemError, FscrawlError};
use crate::hasher::Hasher;
use crate::reconciler::Reconciler;
use crate::store::Store;
use crate::verifier::MAX_PARENT_CHAIN_DEPTH;

pub struct Watcher<'a> {
    store: &'a Store,
    hasher: Option<&'a Hasher>,
    reconciler: Reconciler<'a>,
    inherit_mtime: bool,
    run: &'a AtomicBool,
    inner: notify::RecommendedWatcher,
    rx: std::sync::mpsc::Receiver<notify::Result<notify::Event>>,
    watched: HashMap<Utf8PathBuf, u32>,
}

impl<'a> Watcher<'a> {
    pub fn new(store: &'a Store, hasher: Option<&'a Hasher>, config: &Config, run: &'a AtomicBool) -> Result<Self, FscrawlError> {
        let (tx, rx) = std::sync::mpsc::channel();
        let inner = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })
        .map_err(|e| FilesystemError::Open {
            path: "<notify watcher init>".to_string(),
            source: std::io::Error::other(e),
        })?;

        Ok(Watcher {
            store,
            hasher,
            reconciler: Reconciler::new(store, hasher, config, run),
            inherit_mtime: config.inherit_mtime,
            run,
            inner,
            rx,
            watched: HashMap::new(),
        })
    }

    fn is_running(&self) -> bool {
        self.run.load(Ordering::SeqCst)
    }

    /// Registers one watch per directory in the already-reconciled subtree rooted at `(path,
    /// id)`, then blocks processing events until the cooperative abort flag is cleared.
    pub fn watch(&mut self, path: &Utf8Path, id: u32) -> Result<(), FscrawlError> {
        self.register_tree(path, id)?;
        tracing::info!(path = %path, watches = self.watched.len(), "watch setup complete");

        while self.is_running() {
            match self.rx.recv_timeout(Duration::from_secs(1)) {
                Ok(Ok(event)) => {
                    if let Err(e) = self.handle_event(event) {
                        tracing::warn!(error = %e, "failed to process filesystem event");
                    }
                }
                Ok(Err(e)) => tracing::warn!(error = %e, "notify reported an error"),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        tracing::info!("giving up watches");
        Ok(())
    }

    fn register_one(&mut self, path: &Utf8Path, id: u32) -> Result<(), FscrawlError> {
        self.inner.watch(path.as_std_path(), RecursiveMode::NonRecursive).map_err(|e| FilesystemError::Open {
            path: path.to_string(),
            source: std::io::Error::other(e),
        })?;
        self.watched.insert(path.to_owned(), id);
        Ok(())
    }

    fn register_tree(&mut self, path: &Utf8Path, id: u32) -> Result<(), FscrawlError> {
        self.register_one(path, id)?;
        let (dirs, _) = self.store.list_children(id)?;
        for d in dirs {
            self.register_tree(&path.join(&d.name), d.id)?;
        }
        Ok(())
    }

    fn unregister_tree(&mut self, path: &Utf8Path, id: u32) -> Result<(), FscrawlError> {
        let (dirs, _) = self.store.list_children(id)?;
        for d in dirs {
            self.unregister_tree(&path.join(&d.name), d.id)?;
        }
        let _ = self.inner.unwatch(path.as_std_path());
        self.watched.remove(path);
        Ok(())
    }

    fn parent_dir(&self, event_path: &std::path::Path) -> Option<(u32, Utf8PathBuf)> {
        let event_path = Utf8Path::from_path(event_path)?;
        let parent_path = event_path.parent()?.to_owned();
        let parent_id = *self.watched.get(&parent_path)?;
        Some((parent_id, parent_path))
    }

    fn handle_event(&mut self, event: notify::Event) -> Result<(), FscrawlError> {
        match event.kind {
            EventKind::Create(_) => {
                for path in &event.paths {
                    self.on_created(path)?;
                }
            }
            EventKind::Remove(_) => {
                for path in &event.paths {
                    self.on_removed(path)?;
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                for path in &event.paths {
                    self.on_removed(path)?;
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                for path in &event.paths {
                    self.on_moved_in(path)?;
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                if event.paths.len() == 2 {
                    self.on_removed(&event.paths[0])?;
                    self.on_moved_in(&event.paths[1])?;
                }
            }
            EventKind::Modify(ModifyKind::Metadata(_)) => {
                for path in &event.paths {
                    self.on_attr_changed(path)?;
                }
            }
            EventKind::Access(AccessKind::Close(AccessMode::Write))
            | EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Any) => {
                for path in &event.paths {
                    self.on_close_write(path)?;
                }
            }
            _ => tracing::debug!(kind = ?event.kind, "unhandled notify event"),
        }
        Ok(())
    }

    fn on_created(&mut self, event_path: &std::path::Path) -> Result<(), FscrawlError> {
        let Some((parent_id, parent_path)) = self.parent_dir(event_path) else {
            return Ok(());
        };
        let Some(path) = Utf8Path::from_path(event_path) else {
            return Ok(());
        };
        let name = path.file_name().unwrap_or_default().to_string();
        let meta = match std::fs::metadata(path.as_std_path()) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "created entry vanished before it could be stated");
                return Ok(());
            }
        };
        let mtime = unix_time(meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH));

        if meta.is_dir() {
            let id = self.store.insert_dir(parent_id, &name, meta.len(), mtime)?;
            self.register_one(path, id)?;
            self.propagate_upward(parent_id, meta.len() as i64, Some(mtime))?;
        } else {
            self.store.insert_file(parent_id, &name, meta.len(), mtime, None)?;
            self.propagate_upward(parent_id, meta.len() as i64, Some(mtime))?;
        }
        let _ = parent_path;
        Ok(())
    }

    fn on_moved_in(&mut self, event_path: &std::path::Path) -> Result<(), FscrawlError> {
        let Some((parent_id, _)) = self.parent_dir(event_path) else {
            return Ok(());
        };
        let Some(path) = Utf8Path::from_path(event_path) else {
            return Ok(());
        };
        let name = path.file_name().unwrap_or_default().to_string();
        let meta = match std::fs::metadata(path.as_std_path()) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "moved-in entry vanished before it could be stated");
                return Ok(());
            }
        };
        let mtime = unix_time(meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH));

        if meta.is_dir() {
            let id = self.store.insert_dir(parent_id, &name, 0, mtime)?;
            self.reconciler.reconcile(path, id)?;
            let final_record = self.store.get_dir_by_id(id)?;
            self.register_tree(path, id)?;
            if let Some(rec) = final_record {
                self.propagate_upward(parent_id, rec.size as i64, Some(rec.mtime))?;
            }
        } else {
            let hash = self.hasher.and_then(|h| h.hash(path.as_std_path()).ok());
            self.store.insert_file(parent_id, &name, meta.len(), mtime, hash.as_deref())?;
            self.propagate_upward(parent_id, meta.len() as i64, Some(mtime))?;
        }
        Ok(())
    }

    fn on_attr_changed(&mut self, event_path: &std::path::Path) -> Result<(), FscrawlError> {
        let Some((parent_id, _)) = self.parent_dir(event_path) else {
            return Ok(());
        };
        let Some(path) = Utf8Path::from_path(event_path) else {
            return Ok(());
        };
        let name = path.file_name().unwrap_or_default();
        let meta = match std::fs::metadata(path.as_std_path()) {
            Ok(m) => m,
            Err(_) => return Ok(()),
        };
        // Attribute changes on a watched file are superseded by close-after-write; only a
        // directory's own mtime is tracked here.
        if !meta.is_dir() {
            return Ok(());
        }
        let mtime = unix_time(meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH));
        match self.store.get_dir_by_name(name, parent_id)? {
            Some(dir) => {
                if mtime != dir.mtime {
                    self.store.update_dir(dir.id, dir.size, mtime)?;
                    self.propagate_upward(parent_id, 0, Some(mtime))?;
                }
            }
            None => {
                tracing::warn!(path = %path, "attr-changed for a directory missing from the store, inserting");
                let id = self.store.insert_dir(parent_id, name, 0, mtime)?;
                self.reconciler.reconcile(path, id)?;
                let final_record = self.store.get_dir_by_id(id)?;
                self.register_tree(path, id)?;
                if let Some(rec) = final_record {
                    self.propagate_upward(parent_id, rec.size as i64, Some(rec.mtime))?;
                }
            }
        }
        Ok(())
    }

    fn on_close_write(&mut self, event_path: &std::path::Path) -> Result<(), FscrawlError> {
        let Some((parent_id, _)) = self.parent_dir(event_path) else {
            return Ok(());
        };
        let Some(path) = Utf8Path::from_path(event_path) else {
            return Ok(());
        };
        let name = path.file_name().unwrap_or_default();
        let meta = match std::fs::metadata(path.as_std_path()) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "file closed for write but no longer readable");
                return Ok(());
            }
        };
        if meta.is_dir() {
            return Ok(());
        }
        let mtime = unix_time(meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH));
        let hash = self.hasher.and_then(|h| h.hash(path.as_std_path()).ok());

        match self.store.get_file_by_name(name, parent_id)? {
            Some(file) => {
                let delta = meta.len() as i64 - file.size as i64;
                let hash = hash.or(file.hash);
                self.store.update_file(file.id, meta.len(), mtime, hash.as_deref())?;
                self.propagate_upward(parent_id, delta, Some(mtime))?;
            }
            None => {
                tracing::warn!(path = %path, "close-write for a file missing from the store, inserting");
                self.store.insert_file(parent_id, name, meta.len(), mtime, hash.as_deref())?;
                self.propagate_upward(parent_id, meta.len() as i64, Some(mtime))?;
            }
        }
        Ok(())
    }

    fn on_removed(&mut self, event_path: &std::path::Path) -> Result<(), FscrawlError> {
        let Some((parent_id, _)) = self.parent_dir(event_path) else {
            return Ok(());
        };
        let Some(path) = Utf8Path::from_path(event_path) else {
            return Ok(());
        };
        let name = path.file_name().unwrap_or_default();

        if let Some(dir) = self.store.get_dir_by_name(name, parent_id)? {
            self.unregister_tree(path, dir.id)?;
            self.store.delete_dir(dir.id)?;
            self.propagate_upward(parent_id, -(dir.size as i64), None)?;
            return Ok(());
        }
        if let Some(file) = self.store.get_file_by_name(name, parent_id)? {
            self.store.delete_file(file.id)?;
            self.propagate_upward(parent_id, -(file.size as i64), None)?;
            return Ok(());
        }
        tracing::warn!(path = %path, "removed entry was not tracked in the store");
        Ok(())
    }

    /// Applies `size_delta` unconditionally (and, under `inherit-mtime`, `new_mtime`) to `id` and
    /// every ancestor up to the root, bounded the same way [`crate::verifier::Verifier`] bounds
    /// its traces.
    fn propagate_upward(&self, mut id: u32, size_delta: i64, new_mtime: Option<i64>) -> Result<(), FscrawlError> {
        let mut depth = 0;
        while id != 0 && depth < MAX_PARENT_CHAIN_DEPTH {
            let Some(dir) = self.store.get_dir_by_id(id)? else {
                break;
            };
            let new_size = (dir.size as i64 + size_delta).max(0) as u64;
            let mtime = match new_mtime {
                Some(m) if self.inherit_mtime && m > dir.mtime => m,
                _ => dir.mtime,
            };
            if new_size != dir.size || mtime != dir.mtime {
                self.store.update_dir(id, new_size, mtime)?;
            }
            id = dir.parent;
            depth += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Cli, Config};
    use clap::Parser;
    use std::fs;

    fn temp_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fscrawl.sqlite3");
        let store = Store::open(&path, "dirs", "files", false).unwrap();
        (store, dir)
    }

    fn config() -> Config {
        Config::from_cli(Cli::parse_from(["fscrawl", "/tmp/x"])).unwrap()
    }

    #[test]
    fn registers_one_watch_per_existing_directory() {
        let (store, _tmp) = temp_store();
        let scan_dir = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(scan_dir.path()).unwrap();
        fs::create_dir(base.join("sub")).unwrap();
        let sub_id = store.insert_dir(0, "sub", 0, 0).unwrap();

        let run = AtomicBool::new(true);
        let cfg = config();
        let mut watcher = Watcher::new(&store, None, &cfg, &run).unwrap();
        watcher.register_tree(base, 0).unwrap();

        assert!(watcher.watched.contains_key(base));
        assert_eq!(watcher.watched.get(&base.join("sub")), Some(&sub_id));
    }

    #[test]
    fn created_file_is_inserted_and_propagated() {
        let (store, _tmp) = temp_store();
        let scan_dir = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(scan_dir.path()).unwrap();

        let run = AtomicBool::new(true);
        let cfg = config();
        let mut watcher = Watcher::new(&store, None, &cfg, &run).unwrap();
        watcher.register_tree(base, 0).unwrap();

        let new_file = base.join("new.txt");
        fs::write(&new_file, b"created while watching").unwrap();
        watcher.on_created(new_file.as_std_path()).unwrap();

        let (_, files) = store.list_children(0).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "new.txt");
    }

    #[test]
    fn removed_file_propagates_negative_delta() {
        let (store, _tmp) = temp_store();
        let scan_dir = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(scan_dir.path()).unwrap();
        let top = store.insert_dir(0, base.file_name().unwrap_or("root"), 100, 0).unwrap();
        store.insert_file(top, "gone.txt", 10, 0, None).unwrap();

        let run = AtomicBool::new(true);
        let cfg = config();
        let mut watcher = Watcher::new(&store, None, &cfg, &run).unwrap();
        watcher.watched.insert(base.to_owned(), top);

        watcher.on_removed(base.join("gone.txt").as_std_path()).unwrap();

        let (_, files) = store.list_children(top).unwrap();
        assert!(files.is_empty());
    }
}
