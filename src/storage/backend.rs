//! Abstract storage backend trait.
//!
//! Every storage backend must implement [`StorageBackend`].  The trait
//! works in terms of opaque byte payloads addressed by string keys, so
//! callers do not need to know the underlying medium.

use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::vault::Secret;

/// The single live storage backend of the process.
///
/// Route handlers and the credential rotation task share the same handle;
/// it is never swapped for another backend after startup, only asked to
/// replace its credentials through [`StorageBackend::reinitialize`].
pub type StorageHandle = Arc<dyn StorageBackend>;

/// Async key/value storage contract.
pub trait StorageBackend: Send + Sync + 'static {
    /// Short backend name for logs and health output.
    fn kind(&self) -> &'static str;

    /// Write `data` to `key`, replacing any previous value.
    fn put(
        &self,
        key: &str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Read the value at `key`, or `None` if nothing is stored there.
    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<Bytes>>> + Send + '_>>;

    /// Delete the value at `key`. Deleting a missing key succeeds.
    fn delete(&self, key: &str)
        -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// List every key starting with `prefix`, sorted.
    fn list(
        &self,
        prefix: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<String>>> + Send + '_>>;

    /// Verify the backend is reachable with its current credentials.
    fn check_health(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Replace the backend's credentials in place.
    ///
    /// Implementations must swap the whole credential set at once: a
    /// concurrent request sees either the old or the new set, never a mix.
    /// On error the previous credentials stay in effect.
    fn reinitialize(
        &self,
        account_name: &str,
        secret: &Secret,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;
}
