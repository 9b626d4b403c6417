//! Diff-and-apply engine: walks a filesystem subtree beside the stored children of the same
//! directory, reconciles the two into one working set, and recurses.
//!
//! One [`Reconciler`] drives one crawl (or one watch-triggered catch-up scan). It owns no
//! persistent state of its own beyond a pair of running counters; every decision is made fresh
//! from the current filesystem listing and the current stored rows, which is what lets
//! [`crate::watcher::Watcher`] reuse it to reconcile a single directory that just appeared.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};

use camino::Utf8Path;

use crate::entry::{now, Entry, EntryKind, EntryState};
use crate::error::FscrawlError;
use crate::hasher::Hasher;
use crate::store::Store;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    pub files: u64,
    pub directories: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckStats {
    pub ok: u64,
    pub mismatch: u64,
    pub missing: u64,
    pub no_hash: u64,
}

pub struct Reconciler<'a> {
    store: &'a Store,
    hasher: Option<&'a Hasher>,
    inherit_size: bool,
    inherit_mtime: bool,
    force_hashing: bool,
    run: &'a AtomicBool,
    files_visited: Cell<u64>,
    dirs_visited: Cell<u64>,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a Store, hasher: Option<&'a Hasher>, config: &crate::config::Config, run: &'a AtomicBool) -> Self {
        Reconciler {
            store,
            hasher,
            inherit_size: config.inherit_size,
            inherit_mtime: config.inherit_mtime,
            force_hashing: config.force_hashing,
            run,
            files_visited: Cell::new(0),
            dirs_visited: Cell::new(0),
        }
    }

    pub fn statistics(&self) -> Statistics {
        Statistics {
            files: self.files_visited.get(),
            directories: self.dirs_visited.get(),
        }
    }

    fn is_running(&self) -> bool {
        self.run.load(Ordering::SeqCst)
    }

    /// Reconciles the directory at `path` (stored as `id`, or the virtual root when `id == 0`)
    /// against its stored children, recursively. Writes `id`'s own row only when its aggregate
    /// size or mtime changed and `id` is not the virtual root.
    pub fn reconcile(&self, path: &Utf8Path, id: u32) -> Result<(), FscrawlError> {
        if !self.is_running() {
            return Err(FscrawlError::Aborted);
        }
        let mut owner = self.load_owner(id)?;
        let own_size = std::fs::metadata(path.as_std_path()).map(|m| m.len()).unwrap_or(0);
        owner.kind = EntryKind::Directory { sub_size: own_size };
        self.visit_directory(path, &mut owner)?;
        if id != 0 && owner.state == EntryState::PropertiesChanged {
            self.store.update_dir(id, owner.size, owner.mtime)?;
        }
        Ok(())
    }

    fn load_owner(&self, id: u32) -> Result<Entry, FscrawlError> {
        if id == 0 {
            let mut root = Entry::new_directory(0, String::new(), 0, 0);
            root.state = EntryState::Ok;
            return Ok(root);
        }
        let rec = self.store.get_dir_by_id(id)?.ok_or(crate::error::PathError::Corrupt(id))?;
        let mut owner = Entry::from_stored_directory(rec.id, rec.parent, rec.name, rec.size, rec.mtime);
        owner.state = EntryState::Ok;
        Ok(owner)
    }

    /// Scans `path` on disk, loads `owner`'s stored children, diffs the two into one working
    /// set, applies file mutations, recurses into surviving subdirectories, applies directory
    /// mutations, then aggregates the result back onto `owner`.
    fn visit_directory(&self, path: &Utf8Path, owner: &mut Entry) -> Result<(), FscrawlError> {
        let read_dir = match std::fs::read_dir(path.as_std_path()) {
            Ok(rd) => rd,
            Err(e) => {
                tracing::error!(path = %path, error = %e, "failed to open directory, skipping");
                return Ok(());
            }
        };

        let (stored_dirs, stored_files) = self.store.list_children(owner.id)?;
        let mut children: Vec<Entry> = Vec::with_capacity(stored_dirs.len() + stored_files.len());
        for d in stored_dirs {
            children.push(Entry::from_stored_directory(d.id, d.parent, d.name, d.size, d.mtime));
        }
        for f in stored_files {
            children.push(Entry::from_stored_file(f.id, f.parent, f.name, f.size, f.mtime, f.hash));
        }

        for dirent in read_dir {
            if !self.is_running() {
                return Err(FscrawlError::Aborted);
            }
            let dirent = match dirent {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "failed to read directory entry, skipping");
                    continue;
                }
            };
            let name = match dirent.file_name().into_string() {
                Ok(n) => n,
                Err(_) => {
                    tracing::warn!(path = %path, "skipping entry with non-UTF-8 name");
                    continue;
                }
            };
            let full_path = path.join(&name);
            let meta = match std::fs::metadata(full_path.as_std_path()) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(path = %full_path, error = %e, "failed to stat entry, skipping");
                    continue;
                }
            };
            let is_dir = meta.is_dir();
            let size = meta.len();
            let mtime = meta.modified().map(crate::entry::unix_time).unwrap_or_else(|_| now());

            if is_dir {
                self.dirs_visited.set(self.dirs_visited.get() + 1);
            } else {
                self.files_visited.set(self.files_visited.get() + 1);
            }

            match children.iter().position(|c| c.name == name) {
                Some(idx) if children[idx].kind.is_directory() == is_dir => {
                    self.update_matched(&mut children[idx], &full_path, is_dir, size, mtime);
                }
                Some(idx) => {
                    // Same name, different type: the stored entry no longer reflects reality.
                    children[idx].state = EntryState::Deleted;
                    children.push(self.scan_new_entry(owner.id, &name, &full_path, is_dir, size, mtime));
                }
                None => {
                    children.push(self.scan_new_entry(owner.id, &name, &full_path, is_dir, size, mtime));
                }
            }
        }

        self.apply_pre_recursion(owner, &mut children)?;

        for child in children.iter_mut() {
            if !child.kind.is_directory() || child.state == EntryState::Deleted {
                continue;
            }
            if !self.is_running() {
                return Err(FscrawlError::Aborted);
            }
            let child_path = path.join(&child.name);
            self.visit_directory(&child_path, child)?;
            self.inherit_properties(owner, child);
        }

        self.apply_post_recursion(&children)?;

        let total = owner.kind.sub_size();
        if total != owner.size {
            owner.size = total;
            owner.state = EntryState::PropertiesChanged;
        }

        Ok(())
    }

    fn scan_new_entry(&self, parent: u32, name: &str, full_path: &Utf8Path, is_dir: bool, size: u64, mtime: i64) -> Entry {
        if is_dir {
            let mut e = Entry::new_directory(parent, name.to_string(), size, mtime);
            e.kind.set_sub_size(size);
            e
        } else {
            let mut e = Entry::new_file(parent, name.to_string(), size, mtime);
            if let Some(hasher) = self.hasher {
                match hasher.hash(full_path.as_std_path()) {
                    Ok(h) => e.kind.set_hash(h),
                    Err(err) => tracing::warn!(path = %full_path, error = %err, "failed to hash new file"),
                }
            }
            e
        }
    }

    fn update_matched(&self, child: &mut Entry, full_path: &Utf8Path, is_dir: bool, size: u64, mtime: i64) {
        let mut changed = false;
        if is_dir {
            child.kind.set_sub_size(size);
        } else if child.size != size {
            child.size = size;
            changed = true;
        }
        if child.mtime != mtime {
            child.mtime = mtime;
            changed = true;
        }
        if changed {
            child.state = EntryState::PropertiesChanged;
        }

        if !is_dir {
            if let Some(hasher) = self.hasher {
                let needs_hash = changed || child.kind.hash().is_none() || self.force_hashing;
                if needs_hash {
                    match hasher.hash(full_path.as_std_path()) {
                        Ok(h) => {
                            child.kind.set_hash(h);
                            child.state = EntryState::PropertiesChanged;
                        }
                        Err(err) => {
                            tracing::warn!(path = %full_path, error = %err, "failed to hash file, keeping previous hash");
                        }
                    }
                }
            }
        }

        if child.state == EntryState::Unknown {
            child.state = EntryState::Ok;
        }
    }

    /// Inserts new files and directories, updates changed files, deletes anything left
    /// `Unknown`/`Deleted`. New directories are inserted here (not deferred) so the recursion
    /// step has a real id to scan under.
    fn apply_pre_recursion(&self, owner: &mut Entry, children: &mut [Entry]) -> Result<(), FscrawlError> {
        for child in children.iter_mut() {
            match &child.kind {
                EntryKind::File { .. } => match child.state {
                    EntryState::New => {
                        let hash = child.kind.hash().map(|s| s.to_string());
                        child.id = self.store.insert_file(owner.id, &child.name, child.size, child.mtime, hash.as_deref())?;
                        child.state = EntryState::Ok;
                        self.inherit_properties(owner, child);
                    }
                    EntryState::PropertiesChanged => {
                        let hash = child.kind.hash().map(|s| s.to_string());
                        self.store.update_file(child.id, child.size, child.mtime, hash.as_deref())?;
                        self.inherit_properties(owner, child);
                    }
                    EntryState::Ok => {
                        self.inherit_properties(owner, child);
                    }
                    EntryState::Deleted | EntryState::Unknown => {
                        self.store.delete_file(child.id)?;
                    }
                },
                EntryKind::Directory { .. } => match child.state {
                    EntryState::New => {
                        child.id = self.store.insert_dir(owner.id, &child.name, child.size, child.mtime)?;
                        child.state = EntryState::Ok;
                    }
                    EntryState::Deleted | EntryState::Unknown => {
                        self.store.delete_dir(child.id)?;
                    }
                    EntryState::Ok | EntryState::PropertiesChanged => {}
                },
            }
            if !self.is_running() {
                return Err(FscrawlError::Aborted);
            }
        }
        Ok(())
    }

    /// Writes back directories whose aggregate size or own mtime changed during recursion.
    fn apply_post_recursion(&self, children: &[Entry]) -> Result<(), FscrawlError> {
        for child in children {
            if !child.kind.is_directory() {
                continue;
            }
            if child.state == EntryState::PropertiesChanged {
                self.store.update_dir(child.id, child.size, child.mtime)?;
            }
        }
        Ok(())
    }

    /// Folds `child`'s (now final) size and mtime into `parent`'s running aggregate, per the
    /// `inherit-size`/`inherit-mtime` policy.
    fn inherit_properties(&self, parent: &mut Entry, child: &Entry) {
        if self.inherit_size {
            parent.kind.add_sub_size(child.size);
        }
        if self.inherit_mtime && parent.mtime < child.mtime {
            parent.mtime = child.mtime;
            parent.state = EntryState::PropertiesChanged;
        }
    }

    /// Deletes the stored subtree rooted at `id` without touching the filesystem.
    pub fn clear_subtree(&self, id: u32) -> Result<(), FscrawlError> {
        self.store.delete_dir(id)?;
        Ok(())
    }

    /// Recomputes the hash of every stored file under `parent_id` and compares it against what
    /// is on disk, without consulting mtime or size. Recurses into directories.
    pub fn hash_check(&self, path: &Utf8Path, parent_id: u32) -> Result<CheckStats, FscrawlError> {
        let hasher = self.hasher.ok_or(crate::error::HashError::NoAlgorithmSelected)?;
        let mut stats = CheckStats::default();
        let (dirs, files) = self.store.list_children(parent_id)?;

        for file in files {
            if !self.is_running() {
                return Err(FscrawlError::Aborted);
            }
            self.files_visited.set(self.files_visited.get() + 1);
            let full_path = path.join(&file.name);
            let Some(stored_hash) = file.hash.as_deref() else {
                tracing::warn!(path = %full_path, "no hash stored");
                stats.no_hash += 1;
                continue;
            };
            match hasher.hash(full_path.as_std_path()) {
                Err(_) => {
                    tracing::error!(path = %full_path, "file missing or unreadable");
                    stats.missing += 1;
                }
                Ok(digest) if digest == stored_hash => {
                    tracing::info!(path = %full_path, "ok");
                    stats.ok += 1;
                }
                Ok(digest) => {
                    tracing::error!(path = %full_path, stored = stored_hash, actual = %digest, "hash mismatch");
                    stats.mismatch += 1;
                }
            }
        }

        for dir in dirs {
            if !self.is_running() {
                return Err(FscrawlError::Aborted);
            }
            self.dirs_visited.set(self.dirs_visited.get() + 1);
            let sub = self.hash_check(&path.join(&dir.name), dir.id)?;
            stats.ok += sub.ok;
            stats.mismatch += sub.mismatch;
            stats.missing += sub.missing;
            stats.no_hash += sub.no_hash;
        }

        Ok(stats)
    }

    /// Writes the stored tree rooted at `parent_id` to `out`, one line per entry, depth-first.
    pub fn print_tree<W: std::io::Write>(
        &self,
        parent_id: u32,
        path_prefix: &str,
        print_sums: bool,
        out: &mut W,
    ) -> Result<(), FscrawlError> {
        let (dirs, files) = self.store.list_children(parent_id)?;

        for file in &files {
            self.files_visited.set(self.files_visited.get() + 1);
            if print_sums {
                writeln!(out, "{}/{} [{}]", path_prefix, file.name, file.hash.as_deref().unwrap_or("")).ok();
            } else {
                writeln!(out, "{}/{}", path_prefix, file.name).ok();
            }
        }

        for dir in &dirs {
            self.dirs_visited.set(self.dirs_visited.get() + 1);
            writeln!(out, "{}/{}", path_prefix, dir.name).ok();
            let sub_prefix = format!("{path_prefix}/{}", dir.name);
            self.print_tree(dir.id, &sub_prefix, print_sums, out)?;
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
    use std::sync::atomic::AtomicBool;

    fn temp_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fscrawl.sqlite3");
        let store = Store::open(&path, "dirs", "files", false).unwrap();
        (store, dir)
    }

    fn config(inherit_mtime: bool, no_inherit_size: bool) -> Config {
        let mut args = vec!["fscrawl", "/tmp/x"];
        if inherit_mtime {
            args.push("--inherit-mtime");
        }
        if no_inherit_size {
            args.push("--no-inherit-size");
        }
        Config::from_cli(Cli::parse_from(args)).unwrap()
    }

    #[test]
    fn fresh_crawl_inserts_tree() {
        let (store, _tmp) = temp_store();
        let scan_dir = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(scan_dir.path()).unwrap();
        fs::write(base.join("a.txt"), b"hello").unwrap();
        fs::create_dir(base.join("sub")).unwrap();
        fs::write(base.join("sub").join("b.txt"), b"world!").unwrap();

        let run = AtomicBool::new(true);
        let cfg = config(false, false);
        let reconciler = Reconciler::new(&store, None, &cfg, &run);
        reconciler.reconcile(base, 0).unwrap();

        let (dirs, files) = store.list_children(0).unwrap();
        assert_eq!(dirs.len(), 1);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].size, 5);

        let (_, sub_files) = store.list_children(dirs[0].id).unwrap();
        assert_eq!(sub_files.len(), 1);
        assert_eq!(sub_files[0].size, 6);

        // inherit-size on by default: sub's stored size is its own inode size plus its file.
        let sub_inode_size = fs::metadata(base.join("sub")).unwrap().len();
        let sub = store.get_dir_by_id(dirs[0].id).unwrap().unwrap();
        assert_eq!(sub.size, sub_inode_size + 6);
    }

    #[test]
    fn reconcile_twice_is_idempotent() {
        let (store, _tmp) = temp_store();
        let scan_dir = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(scan_dir.path()).unwrap();
        fs::write(base.join("a.txt"), b"hello").unwrap();

        let run = AtomicBool::new(true);
        let cfg = config(false, false);
        let reconciler = Reconciler::new(&store, None, &cfg, &run);
        reconciler.reconcile(base, 0).unwrap();
        reconciler.reconcile(base, 0).unwrap();

        let (_, files) = store.list_children(0).unwrap();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn detects_size_change() {
        let (store, _tmp) = temp_store();
        let scan_dir = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(scan_dir.path()).unwrap();
        fs::write(base.join("a.txt"), b"hello").unwrap();

        let run = AtomicBool::new(true);
        let cfg = config(false, false);
        let reconciler = Reconciler::new(&store, None, &cfg, &run);
        reconciler.reconcile(base, 0).unwrap();

        fs::write(base.join("a.txt"), b"hello, much longer now").unwrap();
        reconciler.reconcile(base, 0).unwrap();

        let (_, files) = store.list_children(0).unwrap();
        assert_eq!(files[0].size, 22);
    }

    #[test]
    fn detects_deletion() {
        let (store, _tmp) = temp_store();
        let scan_dir = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(scan_dir.path()).unwrap();
        let file_path = base.join("a.txt");
        fs::write(&file_path, b"hello").unwrap();

        let run = AtomicBool::new(true);
        let cfg = config(false, false);
        let reconciler = Reconciler::new(&store, None, &cfg, &run);
        reconciler.reconcile(base, 0).unwrap();
        assert_eq!(store.list_children(0).unwrap().1.len(), 1);

        fs::remove_file(&file_path).unwrap();
        reconciler.reconcile(base, 0).unwrap();
        assert_eq!(store.list_children(0).unwrap().1.len(), 0);
    }

    #[test]
    fn type_flip_replaces_entry() {
        let (store, _tmp) = temp_store();
        let scan_dir = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(scan_dir.path()).unwrap();
        fs::create_dir(base.join("x")).unwrap();

        let run = AtomicBool::new(true);
        let cfg = config(false, false);
        let reconciler = Reconciler::new(&store, None, &cfg, &run);
        reconciler.reconcile(base, 0).unwrap();
        assert_eq!(store.list_children(0).unwrap().0.len(), 1);

        fs::remove_dir(base.join("x")).unwrap();
        fs::write(base.join("x"), b"now a file").unwrap();
        reconciler.reconcile(base, 0).unwrap();

        let (dirs, files) = store.list_children(0).unwrap();
        assert_eq!(dirs.len(), 0);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "x");
    }

    #[test]
    fn no_inherit_size_uses_directory_own_inode_size() {
        let (store, _tmp) = temp_store();
        let scan_dir = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(scan_dir.path()).unwrap();
        fs::create_dir(base.join("sub")).unwrap();
        fs::write(base.join("sub").join("big.txt"), vec![0u8; 4096]).unwrap();

        let run = AtomicBool::new(true);
        let cfg = config(false, true);
        let reconciler = Reconciler::new(&store, None, &cfg, &run);
        reconciler.reconcile(base, 0).unwrap();

        let (dirs, _) = store.list_children(0).unwrap();
        let sub_meta = fs::metadata(base.join("sub")).unwrap();
        let stored = store.get_dir_by_id(dirs[0].id).unwrap().unwrap();
        assert_eq!(stored.size, sub_meta.len());
    }

    #[test]
    fn dry_run_does_not_persist() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("fscrawl.sqlite3");
        let store = Store::open(&db_path, "dirs", "files", true).unwrap();
        let scan_dir = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(scan_dir.path()).unwrap();
        fs::write(base.join("a.txt"), b"hello").unwrap();

        let run = AtomicBool::new(true);
        let cfg = config(false, false);
        let reconciler = Reconciler::new(&store, None, &cfg, &run);
        reconciler.reconcile(base, 0).unwrap();
        // Every insert returned the dry-run sentinel id, so nothing is actually retrievable.
        assert!(store.get_file_by_id(1).unwrap().is_none());
    }

    #[test]
    fn clear_subtree_at_empty_fakepath_clears_the_whole_root() {
        let (store, _tmp) = temp_store();
        let scan_dir = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(scan_dir.path()).unwrap();
        fs::write(base.join("a.txt"), b"hello").unwrap();
        fs::create_dir(base.join("sub")).unwrap();
        fs::write(base.join("sub").join("b.txt"), b"world!").unwrap();

        let run = AtomicBool::new(true);
        let cfg = config(false, false);
        let reconciler = Reconciler::new(&store, None, &cfg, &run);
        reconciler.reconcile(base, 0).unwrap();
        assert!(!store.list_children(0).unwrap().0.is_empty());

        // An empty `--fakepath` resolves to directory id 0; clearing it must remove everything
        // attached to the virtual root, not silently no-op.
        reconciler.clear_subtree(0).unwrap();

        let (dirs, files) = store.list_children(0).unwrap();
        assert!(dirs.is_empty());
        assert!(files.is_empty());
    }
}
