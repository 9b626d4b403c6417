use thiserror::Error;

/// Errors raised while validating CLI flags into a [`crate::config::Config`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("multiple operation modes specified: {0}")]
    MultipleModes(String),
    #[error("multiple hash algorithms specified: {0}")]
    MultipleHashAlgorithms(String),
    #[error("basedir is required for this operation mode")]
    MissingBasedir,
    #[error("--check requires a hash algorithm (--md5, --sha1, or --tth)")]
    CheckRequiresHashAlgorithm,
    #[error("--force-hashing requires a hash algorithm (--md5, --sha1, or --tth)")]
    ForceHashingRequiresHashAlgorithm,
    #[error("--watch requires crawl mode")]
    WatchRequiresCrawlMode,
    #[error("--check cannot be combined with --watch")]
    CheckAndWatchExclusive,
    #[error("--force-hashing requires crawl mode")]
    ForceHashingRequiresCrawlMode,
    #[error("unsupported value '{value}' for --{flag} (the store has no server to connect to)")]
    UnsupportedConnectionFlag { flag: &'static str, value: String },
    #[error("basedir '{0}' is empty; pass --allow-empty to crawl it anyway")]
    EmptyBasedir(String),
}

/// Errors raised by [`crate::store::Store`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("query failed: {0}")]
    QueryFailed(String),
}

/// Errors raised by [`crate::path_resolver::PathResolver`].
#[derive(Debug, Error)]
pub enum PathError {
    #[error("path not found: {0}")]
    NotFound(String),
    #[error("corrupt parent chain at directory id {0}")]
    Corrupt(u32),
}

/// Errors raised while walking or stat-ing the filesystem.
#[derive(Debug, Error)]
pub enum FilesystemError {
    #[error("stat failed for {path}: {source}")]
    Stat { path: String, source: std::io::Error },
    #[error("open failed for {path}: {source}")]
    Open { path: String, source: std::io::Error },
    #[error("read failed for {path}: {source}")]
    Read { path: String, source: std::io::Error },
}

/// Errors raised by [`crate::hasher::Hasher`].
#[derive(Debug, Error)]
pub enum HashError {
    #[error("failed to hash {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("no hash algorithm configured")]
    NoAlgorithmSelected,
}

/// The crate-wide error type. The recoverable kinds (`Filesystem`, `Hash`) are normally matched
/// on and handled at the point they occur rather than propagated through this variant; it exists
/// so every module can still return one type at its outer boundary.
#[derive(Debug, Error)]
pub enum FscrawlError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Filesystem(#[from] FilesystemError),
    #[error(transparent)]
    Hash(#[from] HashError),
    #[error("operation aborted")]
    Aborted,
}

pub type Result<T, E = FscrawlError> = std::result::Result<T, E>;
