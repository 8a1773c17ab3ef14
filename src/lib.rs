pub mod cache;
pub mod config;
pub mod error;
pub mod paths;
pub mod proxy;
pub mod store;

pub use cache::{CacheEntry, EvictionCache};
pub use config::{load_config, Config};
pub use error::{Result, StashError};
pub use paths::PathResolver;
pub use proxy::{ClientSession, OpenMode, Proxy, SeekWhence};
pub use store::{LocalStore, RemoteStore};
