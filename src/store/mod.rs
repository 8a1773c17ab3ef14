pub mod local;

pub use local::LocalStore;

use crate::error::Result;

/// The authoritative file store, seen from the proxy as an opaque RPC
/// boundary. Whole files only; every call is synchronous and blocks the
/// calling session until the store responds.
///
/// Versions: `version` of a path that has never been written or seeded is a
/// defined 0. `push` overwrites the full contents and bumps the counter to
/// `current + 1`, so the first push of a freshly seeded path lands at 1.
pub trait RemoteStore: Send + Sync {
    /// Full current contents of `path`; `NotFound` if it does not exist.
    fn fetch(&self, path: &str) -> Result<Vec<u8>>;

    /// Overwrite the full contents at `path` and increment its version.
    fn push(&self, path: &str, bytes: &[u8]) -> Result<()>;

    /// Current version counter for `path` (0 if never set).
    fn version(&self, path: &str) -> Result<u64>;

    /// Set the version counter directly. The proxy uses this to seed a
    /// just-cached path at version 0.
    fn set_version(&self, path: &str, version: u64) -> Result<()>;

    /// Read the shared client-id counter.
    fn client_id(&self) -> Result<u64>;

    /// Write the shared client-id counter. A session takes the current
    /// value and writes back `value + 1`, so private working-copy names
    /// never collide across sessions.
    fn set_client_id(&self, value: u64) -> Result<()>;
}
