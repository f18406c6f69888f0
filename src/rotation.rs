//! Periodic storage credential rotation.
//!
//! When the storage key comes from a Key Vault, the key is rotated upstream
//! and the service must keep up.  [`CredentialRotation::start`] spawns one
//! task that, on every tick, re-fetches the secret and asks the live
//! [`StorageHandle`] to swap it in.  Ticks run one after another in that
//! task, so they never overlap.  A failed tick is reported and the loop
//! carries on; the backend keeps its last good credentials.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::storage::{StorageHandle, VaultBinding};
use crate::telemetry;

/// Handle to a running rotation task.
pub struct RotationHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RotationHandle {
    /// Stop the task and wait for it to exit.  A tick in progress finishes first.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Rotation settings for one storage handle.
pub struct CredentialRotation {
    storage: StorageHandle,
    vault: VaultBinding,
    interval: Duration,
}

impl CredentialRotation {
    pub fn new(storage: StorageHandle, vault: VaultBinding, interval: Duration) -> Self {
        Self {
            storage,
            vault,
            interval,
        }
    }

    /// Spawn the rotation loop.  The first tick fires one full interval
    /// after start.
    pub fn start(self) -> RotationHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let interval = self.interval;
        let rotation = Arc::new(self);

        info!(
            "Credential rotation scheduled every {:?} for storage account {}",
            interval, rotation.vault.storage_account
        );

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        rotation.tick().await;
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Credential rotation stopped");
        });

        RotationHandle {
            stop: stop_tx,
            task,
        }
    }

    /// Run one rotation attempt, reporting failure instead of returning it.
    pub async fn tick(&self) -> bool {
        match self.rotate().await {
            Ok(()) => {
                counter!(telemetry::CREDENTIAL_ROTATIONS_TOTAL, "outcome" => "success")
                    .increment(1);
                info!(
                    "Storage credentials refreshed from Key Vault for account {}",
                    self.vault.storage_account
                );
                true
            }
            Err(err) => {
                counter!(telemetry::CREDENTIAL_ROTATIONS_TOTAL, "outcome" => "failure")
                    .increment(1);
                tracing::error!("Failed to reinitialize storage from Key Vault credentials");
                telemetry::report_error(telemetry::ErrorSource::Rotation, &err);
                false
            }
        }
    }

    async fn rotate(&self) -> anyhow::Result<()> {
        let name = self.vault.secret_name();
        let secret = self.vault.secret_store.get_secret(&name).await?;
        self.storage
            .reinitialize(&self.vault.storage_account, &secret)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageBackend;
    use crate::vault::{Secret, SecretStore};
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Secret store replaying a script of outcomes; `None` means fail.
    /// Once the script runs out the last outcome repeats.
    struct ScriptedStore {
        script: Mutex<VecDeque<Option<String>>>,
        last: Mutex<Option<String>>,
        calls: AtomicUsize,
    }

    impl ScriptedStore {
        fn new(script: Vec<Option<&str>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into_iter().map(|s| s.map(str::to_string)).collect()),
                last: Mutex::new(None),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl SecretStore for ScriptedStore {
        fn get_secret(
            &self,
            _name: &str,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<Secret>> + Send + '_>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            let outcome = match next {
                Some(o) => {
                    *self.last.lock().unwrap() = o.clone();
                    o
                }
                None => self.last.lock().unwrap().clone(),
            };
            Box::pin(async move {
                outcome
                    .map(Secret::new)
                    .ok_or_else(|| anyhow::anyhow!("vault unavailable"))
            })
        }
    }

    /// Backend that only tracks its current credential.
    struct RecordingBackend {
        current: Mutex<String>,
        reinitializations: AtomicUsize,
    }

    impl RecordingBackend {
        fn new(initial: &str) -> Arc<Self> {
            Arc::new(Self {
                current: Mutex::new(initial.to_string()),
                reinitializations: AtomicUsize::new(0),
            })
        }

        fn current(&self) -> String {
            self.current.lock().unwrap().clone()
        }
    }

    impl StorageBackend for RecordingBackend {
        fn kind(&self) -> &'static str {
            "recording"
        }

        fn put(
            &self,
            _key: &str,
            _data: Bytes,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }

        fn get(
            &self,
            _key: &str,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<Bytes>>> + Send + '_>> {
            Box::pin(async { Ok(None) })
        }

        fn delete(
            &self,
            _key: &str,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }

        fn list(
            &self,
            _prefix: &str,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<String>>> + Send + '_>> {
            Box::pin(async { Ok(Vec::new()) })
        }

        fn check_health(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }

        fn reinitialize(
            &self,
            account_name: &str,
            secret: &Secret,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
            let value = format!("{}:{}", account_name, secret.expose());
            Box::pin(async move {
                if value.ends_with(":bad") {
                    anyhow::bail!("rejected secret");
                }
                self.reinitializations.fetch_add(1, Ordering::SeqCst);
                *self.current.lock().unwrap() = value;
                Ok(())
            })
        }
    }

    fn rotation(
        backend: &Arc<RecordingBackend>,
        store: &Arc<ScriptedStore>,
        interval: Duration,
    ) -> CredentialRotation {
        let storage: StorageHandle = backend.clone();
        let vault = VaultBinding {
            secret_store: store.clone(),
            storage_account: "acct".into(),
        };
        CredentialRotation::new(storage, vault, interval)
    }

    async fn wait_for_calls(store: &ScriptedStore, n: usize) {
        while store.calls.load(Ordering::SeqCst) < n {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    #[tokio::test]
    async fn test_tick_success_swaps_credentials() {
        let backend = RecordingBackend::new("acct:old");
        let store = ScriptedStore::new(vec![Some("new")]);
        let rotation = rotation(&backend, &store, Duration::from_secs(60));

        assert!(rotation.tick().await);
        assert_eq!(backend.current(), "acct:new");
    }

    #[tokio::test]
    async fn test_reinitialize_failure_keeps_credentials() {
        let backend = RecordingBackend::new("acct:old");
        let store = ScriptedStore::new(vec![Some("bad")]);
        let rotation = rotation(&backend, &store, Duration::from_secs(60));

        assert!(!rotation.tick().await);
        assert_eq!(backend.current(), "acct:old");
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_failures_do_not_stop_the_schedule() {
        const FAILURES: usize = 5;
        let backend = RecordingBackend::new("acct:old");
        let mut script = vec![None; FAILURES];
        script.push(Some("fresh"));
        let store = ScriptedStore::new(script);

        let handle = rotation(&backend, &store, Duration::from_secs(1)).start();

        for n in 1..=FAILURES {
            wait_for_calls(&store, n).await;
            assert_eq!(backend.current(), "acct:old");
            assert!(!handle.is_finished());
        }

        wait_for_calls(&store, FAILURES + 1).await;
        tokio::task::yield_now().await;
        while backend.reinitializations.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(backend.current(), "acct:fresh");

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_waits_one_interval() {
        let backend = RecordingBackend::new("acct:old");
        let store = ScriptedStore::new(vec![Some("new")]);
        let handle = rotation(&backend, &store, Duration::from_secs(3600)).start();

        tokio::time::sleep(Duration::from_secs(3599)).await;
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_the_loop() {
        let backend = RecordingBackend::new("acct:old");
        let store = ScriptedStore::new(vec![Some("new")]);
        let handle = rotation(&backend, &store, Duration::from_secs(1)).start();

        wait_for_calls(&store, 2).await;
        handle.stop().await;

        let calls = store.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.calls.load(Ordering::SeqCst), calls);
    }
}
