pub mod cli;
pub mod config;
pub mod driver;
pub mod entry;
pub mod error;
pub mod hasher;
pub mod logging;
pub mod path_resolver;
pub mod reconciler;
pub mod store;
pub mod verifier;
pub mod watcher;

pub use config::Config;
pub use driver::Driver;
pub use error::FscrawlError;
