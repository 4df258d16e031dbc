//! Per-user namespace provisioning.
//!
//! [`ProvisioningController`] is a reconciliation loop over the account-event
//! log: every live account must own exactly one private namespace whose
//! security document names only that account.
//!
//! For each event the controller:
//!
//! 1. drops deletion events and ids outside the account naming convention;
//! 2. creates the account's namespace, treating "already exists" as success;
//! 3. writes the security document, even when the namespace already existed.
//!
//! Both steps are idempotent, so the controller simply replays the log from
//! its origin on every start and keeps no checkpoint.
//!
//! A failure for one account is logged and counted; the loop moves on. A
//! failure of the subscription itself stops the controller and is reported
//! through [`ControllerHealth::Failed`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::ProvisioningConfig;
use crate::error::{Result, StudyError};
use crate::model::{account_id, user_namespace, username_from_account_id};
use crate::store::{AccountEvent, AccountEventLog, DocumentStore, SecurityDocument, StoreError};

/// Health signal for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ControllerHealth {
    /// Replaying the event log from the start.
    Starting,
    /// Following new account events.
    Running {
        /// Accounts provisioned so far.
        processed: u64,
        /// Accounts whose provisioning failed so far.
        failed: u64,
        /// Highest sequence number observed.
        last_seq: u64,
    },
    /// The event stream broke; the controller is not processing events.
    Failed {
        /// What broke the stream.
        reason: String,
    },
    /// Shut down on request.
    Stopped,
}

impl ControllerHealth {
    /// Whether the controller stopped because of an error.
    pub fn is_failed(&self) -> bool {
        matches!(self, ControllerHealth::Failed { .. })
    }
}

/// Counters of one controller run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningStats {
    /// Accounts provisioned successfully.
    pub processed: u64,
    /// Events filtered out.
    pub skipped: u64,
    /// Accounts whose provisioning failed.
    pub failed: u64,
    /// Highest sequence number observed.
    pub last_seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Provisioned,
    Skipped,
    Failed,
}

/// Reconciles account events into private namespaces. See the module docs.
pub struct ProvisioningController {
    store: Arc<dyn DocumentStore>,
    log: Arc<dyn AccountEventLog>,
    config: ProvisioningConfig,
    health: watch::Sender<ControllerHealth>,
    /// One lock per account so its two steps never interleave with another
    /// event for the same account.
    account_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ProvisioningController {
    /// Fails with `Configuration` when `config` does not validate.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        log: Arc<dyn AccountEventLog>,
        config: ProvisioningConfig,
    ) -> Result<Self> {
        config.validate()?;
        let (health, _) = watch::channel(ControllerHealth::Starting);
        Ok(Self {
            store,
            log,
            config,
            health,
            account_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Subscribe to health changes.
    pub fn health(&self) -> watch::Receiver<ControllerHealth> {
        self.health.subscribe()
    }

    /// Namespace owned by the account behind `account_id`, or `None` when
    /// the id does not follow the naming convention.
    pub fn account_namespace(&self, account_id: &str) -> Option<(String, String)> {
        let username = username_from_account_id(account_id)?;
        Some((username.to_string(), user_namespace(username)))
    }

    /// Replay the account-event log from its origin and keep following it
    /// until `cancel` fires.
    ///
    /// Returns `Ok` on cancellation and `Err` if the subscription fails.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<ProvisioningStats> {
        self.health.send_replace(ControllerHealth::Starting);
        let mut stats = ProvisioningStats::default();

        let mut events = match self.log.subscribe(0).await {
            Ok(events) => events,
            Err(e) => return Err(self.fail(format!("cannot subscribe to account events: {}", e))),
        };
        log::info!("Provisioning controller replaying account events from origin");
        self.publish(&stats);

        let mut in_flight = FuturesUnordered::new();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(outcome) = in_flight.next(), if !in_flight.is_empty() => {
                    match outcome {
                        Outcome::Provisioned => stats.processed += 1,
                        Outcome::Skipped => stats.skipped += 1,
                        Outcome::Failed => stats.failed += 1,
                    }
                    self.publish(&stats);
                }
                next = events.next(), if in_flight.len() < self.config.max_concurrency => {
                    match next {
                        Some(Ok(event)) => {
                            stats.last_seq = stats.last_seq.max(event.seq);
                            in_flight.push(self.handle_event(event));
                        }
                        Some(Err(e)) => {
                            return Err(self.fail(format!("account event stream failed: {}", e)));
                        }
                        None => {
                            return Err(self.fail("account event stream ended".to_string()));
                        }
                    }
                }
            }
        }

        log::info!(
            "Provisioning controller stopped ({} provisioned, {} failed)",
            stats.processed,
            stats.failed
        );
        self.health.send_replace(ControllerHealth::Stopped);
        Ok(stats)
    }

    /// Ensure the namespace of `username` exists and is private to it.
    pub async fn provision_account(&self, username: &str) -> Result<()> {
        let (username, namespace) = self
            .account_namespace(&account_id(username))
            .ok_or_else(|| StudyError::Validation("empty username".into()))?;

        let lock = self.lock_for(&username);
        let result = {
            let _guard = lock.lock().await;
            self.ensure_private(&username, &namespace).await
        };
        self.release_lock(&username, lock);
        result
    }

    async fn ensure_private(&self, username: &str, namespace: &str) -> Result<()> {
        match self.store.create_namespace(namespace).await {
            Ok(()) => log::debug!("Created namespace {} for {}", namespace, username),
            Err(StoreError::NamespaceExists(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.store
            .put_security(namespace, &SecurityDocument::private_to(username))
            .await?;
        Ok(())
    }

    async fn handle_event(&self, event: AccountEvent) -> Outcome {
        if event.deleted {
            return Outcome::Skipped;
        }
        let Some((username, _)) = self.account_namespace(&event.account_id) else {
            log::debug!("Ignoring account event for '{}'", event.account_id);
            return Outcome::Skipped;
        };
        match self.provision_account(&username).await {
            Ok(()) => Outcome::Provisioned,
            Err(e) => {
                log::warn!(
                    "Provisioning account '{}' (seq {}) failed: {}",
                    username,
                    event.seq,
                    e
                );
                Outcome::Failed
            }
        }
    }

    fn lock_for(&self, username: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.account_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(username.to_string())
            .or_default()
            .clone()
    }

    /// Forget the lock of `username` once no other event holds or awaits it.
    fn release_lock(&self, username: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.account_locks.lock().unwrap_or_else(|e| e.into_inner());
        // One reference in the map, one here
        if Arc::strong_count(&lock) == 2 {
            locks.remove(username);
        }
    }

    #[cfg(test)]
    fn tracked_accounts(&self) -> usize {
        self.account_locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn publish(&self, stats: &ProvisioningStats) {
        self.health.send_replace(ControllerHealth::Running {
            processed: stats.processed,
            failed: stats.failed,
            last_seq: stats.last_seq,
        });
    }

    fn fail(&self, reason: String) -> StudyError {
        log::error!("Provisioning controller stopped: {}", reason);
        self.health.send_replace(ControllerHealth::Failed {
            reason: reason.clone(),
        });
        StudyError::BackendUnavailable(reason)
    }
}
