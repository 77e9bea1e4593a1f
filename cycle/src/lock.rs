//! Cross-process critical sections keyed by name.
//!
//! ## Design Decisions
//!
//! ### Leased entries
//! - A lock is a row in the shared [`LockStore`] with an expiry. An entry
//!   past its expiry counts as abandoned and the next acquirer overwrites it,
//!   so a crashed process never blocks a name for longer than one lease.
//! - While a body runs under [`NamedLockExecutor::execute_with_lock`], the
//!   lease is renewed every third of its length. Only a holder that stops
//!   running loses the lock.
//! - If a renewal finds the entry taken over, or renewals keep failing
//!   until the lease has run out, the body is dropped and the caller gets
//!   [`LockError::Lost`].
//!
//! ### Release on every exit path
//! - [`LockGuard`] releases in `Drop` when it was not released explicitly.
//!   Drop cannot await, so it spawns the release onto the current runtime;
//!   a panicking or cancelled body therefore frees the name shortly after.
//! - Release only deletes an entry still owned by the guard's token, so a
//!   late release never frees a lock someone else took over.
//!
//! ### Not re-entrant
//! - Every acquisition gets a fresh owner token. Acquiring a name the
//!   current task already holds waits like any other caller and fails with
//!   [`LockError::Timeout`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use jiff::Timestamp;
use tokio::time::Instant;

use crate::store::{LockEntry, LockName, LockStore, OwnerToken, StoreError};
use crate::telemetry::log_error;
use crate::time::{TimeSource, deadline};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    /// Default expiry given to an acquired entry.
    pub lease: Duration,
    /// First retry delay while a name is held elsewhere.
    pub retry_min: Duration,
    /// Cap on the doubling retry delay.
    pub retry_max: Duration,
    /// How often the sweeper deletes expired entries.
    pub sweep_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(60),
            retry_min: Duration::from_millis(50),
            retry_max: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Timed out after {waited:?} waiting for lock '{name}'")]
    Timeout { name: LockName, waited: Duration },
    #[error("Lock '{name}' was lost while its body was running")]
    Lost { name: LockName },
    #[error("Invalid lock name '{0}'")]
    InvalidName(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct NamedLockExecutor {
    store: Arc<dyn LockStore>,
    time_source: TimeSource,
    config: LockConfig,
}

impl NamedLockExecutor {
    pub fn new(
        store: Arc<dyn LockStore>,
        time_source: TimeSource,
        config: LockConfig,
    ) -> Self {
        Self {
            store,
            time_source,
            config,
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Wait up to `timeout` for `name`, with the default lease.
    pub async fn acquire(
        &self,
        name: &LockName,
        timeout: Duration,
    ) -> Result<LockGuard, LockError> {
        self.acquire_with_lease(name, timeout, self.config.lease)
            .await
    }

    /// Wait up to `timeout` for `name`.
    ///
    /// Retries back off exponentially from `retry_min` to `retry_max` and
    /// never sleep past the deadline. At least one attempt is made, even
    /// with a zero timeout.
    #[tracing::instrument(skip(self, name), fields(name = %name))]
    pub async fn acquire_with_lease(
        &self,
        name: &LockName,
        timeout: Duration,
        lease: Duration,
    ) -> Result<LockGuard, LockError> {
        let started = Instant::now();
        let owner = OwnerToken::generate();
        let mut backoff = self.config.retry_min;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let now = self.time_source.now();
            if let Some(entry) = self
                .store
                .try_acquire(name, &owner, now, deadline(now, lease))
                .await?
            {
                tracing::debug!(%owner, attempts, "Lock acquired");
                return Ok(LockGuard {
                    store: self.store.clone(),
                    time_source: self.time_source.clone(),
                    entry,
                    lease,
                    released: false,
                });
            }

            let remaining = timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                let waited = started.elapsed();
                tracing::debug!(attempts, ?waited, "Lock timed out");
                return Err(LockError::Timeout {
                    name: name.clone(),
                    waited,
                });
            }
            tokio::time::sleep(backoff.min(remaining)).await;
            backoff = backoff.saturating_mul(2).min(self.config.retry_max);
        }
    }

    /// Run `body` while holding `name`, with the default lease.
    ///
    /// The lock is released before this returns, whatever the body's
    /// result. If the lock cannot be acquired within `timeout` the body does
    /// not run.
    pub async fn execute_with_lock<F, Fut, T>(
        &self,
        name: &LockName,
        timeout: Duration,
        body: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.execute_with_lock_lease(name, timeout, self.config.lease, body)
            .await
    }

    /// Run `body` while holding `name`, renewing `lease` until it finishes.
    ///
    /// A body that outlives its lock is dropped at the next renewal and
    /// [`LockError::Lost`] is returned.
    pub async fn execute_with_lock_lease<F, Fut, T>(
        &self,
        name: &LockName,
        timeout: Duration,
        lease: Duration,
        body: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.acquire_with_lease(name, timeout, lease).await?;
        let output = {
            let body = std::pin::pin!(body());
            tokio::select! {
                output = body => Ok(output),
                lost = guard.keep_alive() => Err(lost),
            }
        };
        if let Err(e) = guard.release().await {
            // The entry expires on its own; the body's result still stands.
            log_error(e);
        }
        output
    }

    /// Delete every expired entry.
    pub async fn sweep_expired(&self) -> Result<u64, LockError> {
        let swept = self.store.sweep_expired(self.time_source.now()).await?;
        if swept > 0 {
            tracing::info!(swept, "Swept expired locks");
        }
        Ok(swept)
    }

    /// Sweep expired entries every `sweep_interval`, forever.
    pub async fn run_sweeper(self) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        loop {
            interval.tick().await;
            let _ = self.sweep_expired().await.map_err(log_error);
        }
    }
}

/// A held named lock. Released by [`LockGuard::release`] or on drop.
pub struct LockGuard {
    store: Arc<dyn LockStore>,
    time_source: TimeSource,
    entry: LockEntry,
    lease: Duration,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("entry", &self.entry)
            .field("lease", &self.lease)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl LockGuard {
    pub fn name(&self) -> &LockName {
        &self.entry.name
    }

    pub fn owner(&self) -> OwnerToken {
        self.entry.owner
    }

    pub fn expires_at(&self) -> Timestamp {
        self.entry.expires_at
    }

    /// Extend the lease by another `lease` from now. `false` means the lock
    /// expired and was taken over.
    pub async fn renew(&mut self) -> Result<bool, LockError> {
        let expires_at = deadline(self.time_source.now(), self.lease);
        let renewed = self
            .store
            .renew(&self.entry.name, &self.entry.owner, expires_at)
            .await?;
        if renewed {
            self.entry.expires_at = expires_at;
        }
        Ok(renewed)
    }

    pub async fn release(mut self) -> Result<(), LockError> {
        let released = self
            .store
            .release(&self.entry.name, &self.entry.owner)
            .await?;
        self.released = true;
        if !released {
            tracing::warn!(
                name = %self.entry.name,
                "Lock expired before it was released"
            );
        }
        Ok(())
    }

    /// Renew the lease until the lock is lost.
    async fn keep_alive(&self) -> LockError {
        let period = (self.lease / 3).max(Duration::from_millis(10));
        let mut interval =
            tokio::time::interval_at(Instant::now() + period, period);
        let mut held_until = self.entry.expires_at;
        loop {
            interval.tick().await;
            let now = self.time_source.now();
            let expires_at = deadline(now, self.lease);
            let lost = match self
                .store
                .renew(&self.entry.name, &self.entry.owner, expires_at)
                .await
            {
                Ok(true) => {
                    held_until = expires_at;
                    false
                }
                Ok(false) => true,
                Err(e) => {
                    log_error(e);
                    held_until <= now
                }
            };
            if lost {
                tracing::warn!(
                    name = %self.entry.name,
                    "Lock lost while its body was still running"
                );
                return LockError::Lost {
                    name: self.entry.name.clone(),
                };
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                name = %self.entry.name,
                "No runtime to release lock; it will expire"
            );
            return;
        };
        let store = self.store.clone();
        let name = self.entry.name.clone();
        let owner = self.entry.owner;
        handle.spawn(async move {
            if let Err(e) = store.release(&name, &owner).await {
                log_error(e);
            }
        });
    }
}
