//! Operation dispatcher: owns the store and the cooperative abort flag, and turns one validated
//! [`Config`] into one of the six operation modes. This is the only place that wires the other
//! components together; each of them stays usable (and testable) on its own.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::config::{Config, Mode};
use crate::error::{ConfigError, FscrawlError};
use crate::hasher::Hasher;
use crate::path_resolver::PathResolver;
use crate::reconciler::Reconciler;
use crate::store::Store;
use crate::verifier::Verifier;
use crate::watcher::Watcher;

pub struct Driver {
    config: Config,
}

impl Driver {
    pub fn new(config: Config) -> Self {
        Driver { config }
    }

    pub fn run(&self) -> Result<(), FscrawlError> {
        let run = Arc::new(AtomicBool::new(true));
        install_signal_handler(Arc::clone(&run));

        let store = Store::open(Path::new(&self.config.database), &self.config.dir_table, &self.config.file_table, self.config.dry_run)?;
        let hasher = self.config.hash_algorithm.map(Hasher::new);

        let resolver = PathResolver::new(&store);
        let root_id = resolver.descend(&self.config.fakepath, true)?;

        let started = Instant::now();
        tracing::info!(mode = ?self.config.mode, database = %self.config.database, "starting");

        match self.config.mode {
            Mode::Crawl => self.run_crawl(&store, hasher.as_ref(), &run, root_id)?,
            Mode::Check => self.run_check(&store, hasher.as_ref(), &run, root_id)?,
            Mode::Verify => self.run_verify(&store, &run)?,
            Mode::Print => self.run_print(&store, &run, root_id)?,
            Mode::Clear => {
                Reconciler::new(&store, hasher.as_ref(), &self.config, &run).clear_subtree(root_id)?;
            }
            Mode::Purge => store.drop_all()?,
        }

        if !run.load(Ordering::SeqCst) {
            tracing::warn!("operation aborted by signal");
            return Err(FscrawlError::Aborted);
        }

        tracing::info!(elapsed = %format_elapsed(started.elapsed()), "done");
        Ok(())
    }

    fn run_crawl(&self, store: &Store, hasher: Option<&Hasher>, run: &Arc<AtomicBool>, root_id: u32) -> Result<(), FscrawlError> {
        if !self.config.allow_empty {
            ensure_not_empty(&self.config.basedir)?;
        }

        let reconciler = Reconciler::new(store, hasher, &self.config, run);
        reconciler.reconcile(&self.config.basedir, root_id)?;
        let stats = reconciler.statistics();
        tracing::info!(files = stats.files, directories = stats.directories, "crawl complete");

        if self.config.watch && run.load(Ordering::SeqCst) {
            let mut watcher = Watcher::new(store, hasher, &self.config, run)?;
            watcher.watch(&self.config.basedir, root_id)?;
        }
        Ok(())
    }

    fn run_check(&self, store: &Store, hasher: Option<&Hasher>, run: &Arc<AtomicBool>, root_id: u32) -> Result<(), FscrawlError> {
        let reconciler = Reconciler::new(store, hasher, &self.config, run);
        let stats = reconciler.hash_check(&self.config.basedir, root_id)?;
        tracing::info!(
            ok = stats.ok,
            mismatch = stats.mismatch,
            missing = stats.missing,
            no_hash = stats.no_hash,
            "check complete"
        );
        Ok(())
    }

    fn run_verify(&self, store: &Store, run: &Arc<AtomicBool>) -> Result<(), FscrawlError> {
        let stats = Verifier::new(store, run).verify()?;
        tracing::info!(
            directories = stats.directories,
            files = stats.files,
            directories_pruned = stats.directories_pruned,
            files_pruned = stats.files_pruned,
            "verify complete"
        );
        Ok(())
    }

    fn run_print(&self, store: &Store, run: &Arc<AtomicBool>, root_id: u32) -> Result<(), FscrawlError> {
        let reconciler = Reconciler::new(store, None, &self.config, run);
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        reconciler.print_tree(root_id, "", self.config.print_sums, &mut handle)?;
        Ok(())
    }
}

fn ensure_not_empty(basedir: &camino::Utf8Path) -> Result<(), ConfigError> {
    let mut entries = std::fs::read_dir(basedir.as_std_path()).map_err(|_| ConfigError::EmptyBasedir(basedir.to_string()))?;
    if entries.next().is_none() {
        return Err(ConfigError::EmptyBasedir(basedir.to_string()));
    }
    Ok(())
}

fn install_signal_handler(run: Arc<AtomicBool>) {
    let signals_received = Arc::new(AtomicU8::new(0));
    let result = ctrlc::set_handler(move || {
        let count = signals_received.fetch_add(1, Ordering::SeqCst) + 1;
        run.store(false, Ordering::SeqCst);
        if count >= 2 {
            tracing::warn!("second interrupt received, exiting immediately");
            std::process::exit(130);
        }
        tracing::warn!("interrupt received, finishing current directory before stopping");
    });
    if let Err(e) = result {
        tracing::warn!(error = %e, "failed to install signal handler; Ctrl-C will not stop cleanly");
    }
}

fn format_elapsed(elapsed: std::time::Duration) -> String {
    let total_secs = elapsed.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours}h {minutes}m {seconds}s")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_elapsed_reads_like_the_historical_summary_line() {
        assert_eq!(format_elapsed(std::time::Duration::from_secs(3725)), "1h 2m 5s");
        assert_eq!(format_elapsed(std::time::Duration::from_secs(5)), "0h 0m 5s");
    }
}
