use camino::Utf8PathBuf;
use clap::Parser;

use crate::error::ConfigError;
use crate::hasher::HashAlgorithm;
use crate::logging::LogLevel;

/// Operation mode. `Crawl` is the default; at most one of the mode flags below may be set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Crawl,
    Check,
    Verify,
    Print,
    Clear,
    Purge,
}

/// Raw command-line flags, one field per `--flag`. Mirrors the historical `fscrawl` option
/// groups: mode selection, store connection, and crawl/hash policy knobs.
#[derive(Debug, Parser)]
#[command(name = "fscrawl", version, about = "Mirror a filesystem subtree into a relational store")]
pub struct Cli {
    /// Root directory to crawl or check.
    #[arg(default_value = "")]
    pub basedir: Utf8PathBuf,

    /// Check the hash of every stored file against the filesystem (requires a hash algorithm).
    #[arg(long)]
    pub check: bool,
    /// Verify tree structure: prune orphans and cycles.
    #[arg(long)]
    pub verify: bool,
    /// Print the tree structure to standard output.
    #[arg(long)]
    pub print: bool,
    /// Delete the subtree rooted at fakepath.
    #[arg(long)]
    pub clear: bool,
    /// Delete all rows from both tables.
    #[arg(long)]
    pub purge: bool,

    /// Set log level (0-4): error, warning, info (default), detailed, debug.
    #[arg(long, default_value_t = 2)]
    pub loglevel: u8,
    /// Log to file instead of stderr.
    #[arg(long)]
    pub logfile: Option<Utf8PathBuf>,

    /// Parse files as if basedir were mounted under this virtual path prefix.
    #[arg(long, default_value = "")]
    pub fakepath: String,
    /// Watch basedir after crawling (blocks until interrupted).
    #[arg(long)]
    pub watch: bool,

    /// SQLite database file to use.
    #[arg(long, default_value = "fscrawl.sqlite3")]
    pub database: String,
    /// Accepted for CLI-surface compatibility; the SQLite backend has no server to connect to.
    #[arg(long, default_value = "localhost")]
    pub host: String,
    #[arg(long, default_value = "root")]
    pub user: String,
    #[arg(long, default_value = "")]
    pub password: String,

    /// Calculate the SHA-1 hash of every file.
    #[arg(long)]
    pub sha1: bool,
    /// Calculate the MD5 hash of every file.
    #[arg(long)]
    pub md5: bool,
    /// Calculate the TTH hash of every file.
    #[arg(long)]
    pub tth: bool,
    /// Force recalculation of every hash, even when size/mtime are unchanged.
    #[arg(long)]
    pub force_hashing: bool,

    /// Table to use for files.
    #[arg(long, default_value = "fscrawl_files")]
    pub file_table: String,
    /// Table to use for directories.
    #[arg(long, default_value = "fscrawl_directories")]
    pub dir_table: String,
    /// When printing, additionally print the hash of every file.
    #[arg(long)]
    pub print_sums: bool,

    /// Suppress every mutating store operation; reads still execute.
    #[arg(long)]
    pub dry_run: bool,
    /// Permit reconciling an empty basedir (otherwise refused to avoid mass deletion by accident).
    #[arg(long)]
    pub allow_empty: bool,
    /// Inherit a directory's mtime from the maximum mtime of its descendants.
    #[arg(long)]
    pub inherit_mtime: bool,
    /// Disable inheriting a directory's size from the sum of its descendants.
    #[arg(long)]
    pub no_inherit_size: bool,
}

/// Immutable, validated configuration. Constructed once by [`crate::driver::Driver`] and passed
/// by reference to every component; there is no global/ambient configuration state.
#[derive(Debug, Clone)]
pub struct Config {
    pub basedir: Utf8PathBuf,
    pub fakepath: String,
    pub mode: Mode,

    pub database: String,
    pub dir_table: String,
    pub file_table: String,

    pub loglevel: LogLevel,
    pub logfile: Option<Utf8PathBuf>,

    pub watch: bool,
    pub hash_algorithm: Option<HashAlgorithm>,
    pub force_hashing: bool,
    pub print_sums: bool,

    pub dry_run: bool,
    pub allow_empty: bool,
    pub inherit_size: bool,
    pub inherit_mtime: bool,
}

impl Config {
    /// Validate and normalize raw CLI flags. Mirrors the historical CLI's mode/hash-algorithm
    /// mutual-exclusivity rules and its crawl-dependent-flag checks.
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let mode = select_mode(&cli)?;

        let mut basedir = cli.basedir;
        if basedir.as_str().is_empty() {
            if matches!(mode, Mode::Crawl | Mode::Check) {
                return Err(ConfigError::MissingBasedir);
            }
        } else {
            while basedir.as_str().ends_with('/') {
                let trimmed = basedir.as_str().trim_end_matches('/').to_string();
                basedir = Utf8PathBuf::from(trimmed);
            }
        }

        let hash_algorithm = select_hash_algorithm(&cli)?;

        if (mode == Mode::Check || cli.force_hashing) && hash_algorithm.is_none() {
            return Err(if mode == Mode::Check {
                ConfigError::CheckRequiresHashAlgorithm
            } else {
                ConfigError::ForceHashingRequiresHashAlgorithm
            });
        }

        if cli.watch && mode == Mode::Check {
            return Err(ConfigError::CheckAndWatchExclusive);
        }

        if (cli.watch || cli.force_hashing) && mode != Mode::Crawl {
            return Err(if cli.watch {
                ConfigError::WatchRequiresCrawlMode
            } else {
                ConfigError::ForceHashingRequiresCrawlMode
            });
        }

        for (flag, value, default) in [
            ("host", cli.host.as_str(), "localhost"),
            ("user", cli.user.as_str(), "root"),
            ("password", cli.password.as_str(), ""),
        ] {
            if value != default {
                return Err(ConfigError::UnsupportedConnectionFlag {
                    flag,
                    value: value.to_string(),
                });
            }
        }

        let loglevel = LogLevel::from_u8(cli.loglevel.min(4));

        Ok(Config {
            basedir,
            fakepath: cli.fakepath,
            mode,
            database: cli.database,
            dir_table: cli.dir_table,
            file_table: cli.file_table,
            loglevel,
            logfile: cli.logfile,
            watch: cli.watch,
            hash_algorithm,
            force_hashing: cli.force_hashing,
            print_sums: cli.print_sums,
            dry_run: cli.dry_run,
            allow_empty: cli.allow_empty,
            inherit_size: !cli.no_inherit_size,
            inherit_mtime: cli.inherit_mtime,
        })
    }
}

fn select_mode(cli: &Cli) -> Result<Mode, ConfigError> {
    let candidates = [
        (cli.check, Mode::Check, "check"),
        (cli.verify, Mode::Verify, "verify"),
        (cli.print, Mode::Print, "print"),
        (cli.clear, Mode::Clear, "clear"),
        (cli.purge, Mode::Purge, "purge"),
    ];
    let mut chosen: Option<(Mode, &str)> = None;
    for (set, mode, name) in candidates {
        if set {
            match chosen {
                None => chosen = Some((mode, name)),
                Some((_, first)) => {
                    return Err(ConfigError::MultipleModes(format!("{first}, {name}")))
                }
            }
        }
    }
    Ok(chosen.map(|(mode, _)| mode).unwrap_or(Mode::Crawl))
}

fn select_hash_algorithm(cli: &Cli) -> Result<Option<HashAlgorithm>, ConfigError> {
    let candidates = [
        (cli.md5, HashAlgorithm::Md5, "md5"),
        (cli.sha1, HashAlgorithm::Sha1, "sha1"),
        (cli.tth, HashAlgorithm::Tth, "tth"),
    ];
    let mut chosen: Option<(HashAlgorithm, &str)> = None;
    for (set, algo, name) in candidates {
        if set {
            match chosen {
                None => chosen = Some((algo, name)),
                Some((_, first)) => {
                    return Err(ConfigError::MultipleHashAlgorithms(format!("{first}, {name}")))
                }
            }
        }
    }
    Ok(chosen.map(|(algo, _)| algo))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse(args: &[&str]) -> Result<Config, ConfigError> {
        let mut full = vec!["fscrawl"];
        full.extend_from_slice(args);
        let cli = Cli::parse_from(full);
        Config::from_cli(cli)
    }

    #[test]
    fn defaults_to_crawl_mode() {
        let cfg = parse(&["/tmp/x"]).unwrap();
        assert_eq!(cfg.mode, Mode::Crawl);
        assert!(cfg.inherit_size);
        assert!(!cfg.inherit_mtime);
    }

    #[test]
    fn crawl_requires_basedir() {
        let err = parse(&[]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingBasedir));
    }

    #[test]
    fn multiple_modes_rejected() {
        let err = parse(&["/tmp/x", "--verify", "--print"]).unwrap_err();
        assert!(matches!(err, ConfigError::MultipleModes(_)));
    }

    #[test]
    fn multiple_hash_algorithms_rejected() {
        let err = parse(&["/tmp/x", "--md5", "--sha1"]).unwrap_err();
        assert!(matches!(err, ConfigError::MultipleHashAlgorithms(_)));
    }

    #[test]
    fn check_requires_hash_algorithm() {
        let err = parse(&["/tmp/x", "--check"]).unwrap_err();
        assert!(matches!(err, ConfigError::CheckRequiresHashAlgorithm));
    }

    #[test]
    fn watch_requires_crawl_mode() {
        let err = parse(&["/tmp/x", "--verify", "--watch"]).unwrap_err();
        assert!(matches!(err, ConfigError::WatchRequiresCrawlMode));
    }

    #[test]
    fn check_and_watch_mutually_exclusive() {
        let err = parse(&["/tmp/x", "--check", "--md5", "--watch"]).unwrap_err();
        assert!(matches!(err, ConfigError::CheckAndWatchExclusive));
    }

    #[test]
    fn trailing_slashes_stripped() {
        let cfg = parse(&["/tmp/x///"]).unwrap();
        assert_eq!(cfg.basedir.as_str(), "/tmp/x");
    }

    #[test]
    fn loglevel_clamped_to_four() {
        let cfg = parse(&["/tmp/x", "--loglevel", "9"]).unwrap();
        assert_eq!(cfg.loglevel, LogLevel::Debug);
    }
}
