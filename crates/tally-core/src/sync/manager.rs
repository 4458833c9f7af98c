//! Sync orchestration
//!
//! The manager owns the local store, a transport, and the network flag. All
//! writes enter through [`SyncManager::enqueue`], which is synchronous and
//! never touches the network. [`SyncManager::sync_all`] drains the mutation
//! log: entries are claimed in sequence order, grouped by entity type, and
//! pushed in parallel across types while staying strictly ordered within one.
//! A pull pass follows every drain so other devices' changes land in the
//! snapshot cache.

use crate::db::{
    LocalStore, MutationLog, SnapshotCache, SqliteMutationLog, SqliteSnapshotCache,
};
use crate::error::Error;
use crate::models::{
    ClientId, EntityRecord, MutationWrite, Operation, QueueEntry, SyncStatusCounts,
};
use crate::sync::dedup::{fingerprint, local_duplicate_flags};
use crate::sync::merge::{merge_entities, MergedEntity};
use crate::sync::net::NetworkWatch;
use crate::sync::protocol::{
    DuplicateCheckRequest, DuplicateProbe, PullResponse, PushEntry, PushRequest, PushResponse,
    PushStatus, RejectionKind,
};
use crate::sync::transport::SyncTransport;
use crate::sync::{SyncError, SyncResult};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Mutex as TokioMutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

/// Tuning knobs for a [`SyncManager`]
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// User every operation is scoped to
    pub user_id: String,
    /// Entries per push request
    pub batch_size: usize,
    /// Failed attempts before an entry is parked as failed
    pub max_retries: u32,
    /// Budget for a single transport request
    pub request_timeout: Duration,
    /// Changes requested per pull page
    pub pull_page_limit: usize,
    /// Period of the background sync timer
    pub auto_sync_interval: Duration,
}

impl SyncOptions {
    /// Defaults for the given user
    #[must_use]
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            batch_size: 50,
            max_retries: 5,
            request_timeout: Duration::from_secs(30),
            pull_page_limit: 200,
            auto_sync_interval: Duration::from_secs(60),
        }
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub const fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    #[must_use]
    pub fn with_pull_page_limit(mut self, pull_page_limit: usize) -> Self {
        self.pull_page_limit = pull_page_limit.max(1);
        self
    }

    #[must_use]
    pub const fn with_auto_sync_interval(mut self, auto_sync_interval: Duration) -> Self {
        self.auto_sync_interval = auto_sync_interval;
        self
    }
}

/// How a single queue entry fared in a sync run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    /// Confirmed by the server
    Applied { server_id: Option<String> },
    /// The server had already applied or already held this content
    Duplicate,
    /// Failed this run; a later run will retry it
    Retrying { error: String },
    /// Rejected as invalid; waits for `retry_failed` or `discard_failed`
    Rejected { error: String },
    /// Out of retry budget; waits for `retry_failed` or `discard_failed`
    Failed { error: String },
    /// Not attempted because an earlier entry of the same type failed
    Deferred,
}

/// Aggregate outcome of one sync run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub applied: usize,
    pub duplicates: usize,
    pub retrying: usize,
    pub rejected: usize,
    pub failed: usize,
    pub deferred: usize,
    /// Changes merged from the server during the pull phase
    pub pulled: usize,
    /// True when the run was skipped because the device was offline
    pub skipped_offline: bool,
    /// Pull phase error; push outcomes above are still valid
    pub pull_error: Option<String>,
    /// Per-entry outcomes, ordered within each entity type
    pub outcomes: Vec<(ClientId, EntryOutcome)>,
}

impl SyncReport {
    /// True when nothing went wrong and nothing was left behind
    #[must_use]
    pub fn is_clean(&self) -> bool {
        !self.skipped_offline
            && self.retrying == 0
            && self.rejected == 0
            && self.failed == 0
            && self.deferred == 0
            && self.pull_error.is_none()
    }

    /// Outcome recorded for one entry, if it took part in the run
    #[must_use]
    pub fn outcome_for(&self, client_id: &ClientId) -> Option<&EntryOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| id == client_id)
            .map(|(_, outcome)| outcome)
    }

    fn record(&mut self, client_id: ClientId, outcome: EntryOutcome) {
        match &outcome {
            EntryOutcome::Applied { .. } => self.applied += 1,
            EntryOutcome::Duplicate => self.duplicates += 1,
            EntryOutcome::Retrying { .. } => self.retrying += 1,
            EntryOutcome::Rejected { .. } => self.rejected += 1,
            EntryOutcome::Failed { .. } => self.failed += 1,
            EntryOutcome::Deferred => self.deferred += 1,
        }
        self.outcomes.push((client_id, outcome));
    }

    fn absorb(&mut self, other: Self) {
        self.applied += other.applied;
        self.duplicates += other.duplicates;
        self.retrying += other.retrying;
        self.rejected += other.rejected;
        self.failed += other.failed;
        self.deferred += other.deferred;
        self.pulled += other.pulled;
        self.skipped_offline |= other.skipped_offline;
        if self.pull_error.is_none() {
            self.pull_error = other.pull_error;
        }
        self.outcomes.extend(other.outcomes);
    }
}

struct AutoSyncHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct ManagerInner<T> {
    store: StdMutex<LocalStore>,
    transport: T,
    network: NetworkWatch,
    options: SyncOptions,
    status_tx: watch::Sender<SyncStatusCounts>,
    data_tx: watch::Sender<u64>,
    run_lock: TokioMutex<()>,
    run_done: watch::Sender<u64>,
    last_report: StdMutex<SyncReport>,
    auto_sync: StdMutex<Option<AutoSyncHandle>>,
}

#[derive(PartialEq)]
enum BatchFlow {
    Continue,
    /// An entry hit a hard failure; the rest of the type waits for the next run
    Halt,
}

/// Orchestrates the offline-first sync cycle for one user
///
/// Cloning is cheap and every clone drives the same state, so the app, the
/// background loop, and per-type workers can all hold one. Sync runs are
/// serialized: a `sync_all` call while a run is in flight waits for that run
/// and shares its report instead of starting another drain.
pub struct SyncManager<T: SyncTransport> {
    inner: Arc<ManagerInner<T>>,
}

impl<T: SyncTransport> Clone for SyncManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: SyncTransport> std::fmt::Debug for SyncManager<T> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SyncManager")
            .field("options", &self.inner.options)
            .field("online", &self.inner.network.is_online())
            .finish_non_exhaustive()
    }
}

impl<T: SyncTransport> SyncManager<T> {
    /// Create a manager over an opened store
    pub fn new(
        store: LocalStore,
        transport: T,
        network: NetworkWatch,
        options: SyncOptions,
    ) -> SyncResult<Self> {
        let counts = SqliteMutationLog::new(store.connection())
            .counts(&options.user_id)
            .map_err(SyncError::Store)?;
        let (status_tx, _) = watch::channel(counts);
        let (data_tx, _) = watch::channel(0u64);
        let (run_done, _) = watch::channel(0u64);

        Ok(Self {
            inner: Arc::new(ManagerInner {
                store: StdMutex::new(store),
                transport,
                network,
                options,
                status_tx,
                data_tx,
                run_lock: TokioMutex::new(()),
                run_done,
                last_report: StdMutex::new(SyncReport::default()),
                auto_sync: StdMutex::new(None),
            }),
        })
    }

    /// The options this manager runs with
    #[must_use]
    pub fn options(&self) -> &SyncOptions {
        &self.inner.options
    }

    /// Queue a mutation and apply its optimistic local effect
    ///
    /// Synchronous: the write is durable in the mutation log before this
    /// returns, and the merged view already reflects it. Creates and updates
    /// land in the offline cache; deletes record a tombstone.
    pub fn enqueue(&self, write: MutationWrite) -> SyncResult<ClientId> {
        let entry = self.with_store(|conn| {
            let entry = SqliteMutationLog::new(conn).enqueue(&self.inner.options.user_id, &write)?;
            let cache = SqliteSnapshotCache::new(conn);
            match entry.operation {
                Operation::Create | Operation::Update => {
                    cache.upsert_offline(&EntityRecord {
                        user_id: entry.user_id.clone(),
                        entity_type: entry.entity_type.clone(),
                        entity_id: entry.entity_id.clone(),
                        view_key: entry.view_key.clone(),
                        payload: entry.payload.clone(),
                        updated_at: entry.enqueued_at,
                        deleted: false,
                        server_seq: 0,
                    })?;
                }
                Operation::Delete => {
                    cache.add_tombstone(
                        &entry.user_id,
                        &entry.entity_type,
                        &entry.entity_id,
                        &entry.view_key,
                    )?;
                    cache.remove_offline(&entry.user_id, &entry.entity_type, &entry.entity_id)?;
                }
            }
            Ok(entry)
        })?;

        self.publish_status()?;
        self.bump_data();
        tracing::debug!(
            client_id = %entry.client_id,
            entity_type = %entry.entity_type,
            operation = %entry.operation,
            "Queued mutation"
        );
        Ok(entry.client_id)
    }

    /// Entries awaiting sync, ascending by sequence
    pub fn list_pending(&self, entity_type: Option<&str>) -> SyncResult<Vec<QueueEntry>> {
        self.with_store(|conn| {
            SqliteMutationLog::new(conn).list_pending(&self.inner.options.user_id, entity_type)
        })
    }

    /// Entries that failed and wait for a retry or a discard
    pub fn list_failed(&self) -> SyncResult<Vec<QueueEntry>> {
        self.with_store(|conn| SqliteMutationLog::new(conn).list_failed(&self.inner.options.user_id))
    }

    /// Current entry counts by state
    pub fn status(&self) -> SyncResult<SyncStatusCounts> {
        self.with_store(|conn| SqliteMutationLog::new(conn).counts(&self.inner.options.user_id))
    }

    /// Watch the entry counts; updated after every state change
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatusCounts> {
        self.inner.status_tx.subscribe()
    }

    /// Watch a revision counter that bumps whenever merged views may differ
    #[must_use]
    pub fn subscribe_data(&self) -> watch::Receiver<u64> {
        self.inner.data_tx.subscribe()
    }

    /// Report of the most recently completed sync run
    #[must_use]
    pub fn last_report(&self) -> SyncReport {
        self.inner
            .last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Entities for one view, reconciled across server and offline state
    ///
    /// Synchronous and never touches the network; server copies win id
    /// collisions and tombstoned entities are dropped.
    pub fn merged_view(&self, entity_type: &str, view_key: &str) -> SyncResult<Vec<MergedEntity>> {
        let user_id = &self.inner.options.user_id;
        self.with_store(|conn| {
            let cache = SqliteSnapshotCache::new(conn);
            let server = cache.list_server(user_id, entity_type, view_key)?;
            let offline = cache.list_offline(user_id, entity_type, view_key)?;
            let tombstones = cache.tombstones(user_id, entity_type, view_key)?;
            Ok(merge_entities(server, offline, &tombstones))
        })
    }

    /// Make a failed or rejected entry eligible for the next run again
    pub fn retry_failed(&self, client_id: &ClientId) -> SyncResult<()> {
        self.with_store(|conn| SqliteMutationLog::new(conn).reset_for_retry(client_id))?;
        self.publish_status()
    }

    /// Drop a queued entry and roll back its optimistic local effect
    ///
    /// A discarded create or update reverts the view to the server snapshot;
    /// a discarded delete resurfaces the entity.
    pub fn discard_failed(&self, client_id: &ClientId) -> SyncResult<()> {
        let entry = self
            .with_store(|conn| SqliteMutationLog::new(conn).get(client_id))?
            .ok_or_else(|| SyncError::Store(Error::NotFound(client_id.to_string())))?;

        self.with_store(|conn| {
            let cache = SqliteSnapshotCache::new(conn);
            match entry.operation {
                Operation::Create | Operation::Update => {
                    cache.remove_offline(&entry.user_id, &entry.entity_type, &entry.entity_id)?;
                }
                Operation::Delete => {
                    cache.remove_tombstone(&entry.user_id, &entry.entity_type, &entry.entity_id)?;
                }
            }
            SqliteMutationLog::new(conn).remove(client_id)
        })?;

        self.publish_status()?;
        self.bump_data();
        Ok(())
    }

    /// Wipe every local trace of this user: log, caches, tombstones, cursor
    ///
    /// The logout path. Nothing is pushed first; unsynced work is lost.
    pub fn clear(&self) -> SyncResult<()> {
        self.with_store(|conn| {
            let user_id = &self.inner.options.user_id;
            SqliteMutationLog::new(conn).clear(user_id)?;
            SqliteSnapshotCache::new(conn).clear(user_id)
        })?;
        self.publish_status()?;
        self.bump_data();
        tracing::info!(user = %self.inner.options.user_id, "Cleared local sync state");
        Ok(())
    }

    /// Ask the server which probes match content it already holds
    ///
    /// Read-only on both sides; answers come back in probe order.
    pub async fn check_duplicates(&self, probes: Vec<DuplicateProbe>) -> SyncResult<Vec<bool>> {
        if probes.is_empty() {
            return Ok(Vec::new());
        }
        let expected = probes.len();
        let response = self
            .with_timeout(
                self.inner
                    .transport
                    .check_duplicates(&self.inner.options.user_id, DuplicateCheckRequest { probes }),
            )
            .await?;
        if response.results.len() != expected {
            return Err(SyncError::Protocol(format!(
                "duplicate check answered {} results for {expected} probes",
                response.results.len()
            )));
        }
        Ok(response.results)
    }

    /// Drain the mutation log to the server, then pull remote changes
    ///
    /// Runs are serialized; callers that arrive while one is in flight wait
    /// for it and get that run's report. Offline, the run is skipped and the
    /// report says so.
    pub async fn sync_all(&self) -> SyncResult<SyncReport> {
        if let Ok(guard) = self.inner.run_lock.try_lock() {
            return self.drain(guard).await;
        }

        // A run is in flight; share its outcome instead of queueing another
        let mut done = self.inner.run_done.subscribe();
        if let Ok(guard) = self.inner.run_lock.try_lock() {
            // It finished between the two checks
            return self.drain(guard).await;
        }
        done.changed()
            .await
            .map_err(|_| SyncError::Internal("sync run notifier closed".to_string()))?;
        Ok(self.last_report())
    }

    /// Fetch and merge server changes past the local cursor
    ///
    /// Pages until the server reports no more; the cursor only advances after
    /// a page is fully merged, so an interrupted pull resumes safely.
    pub async fn pull_sync(&self) -> SyncResult<usize> {
        let user_id = self.inner.options.user_id.clone();
        let mut applied = 0usize;

        loop {
            let cursor = self.with_store(|conn| SqliteSnapshotCache::new(conn).cursor(&user_id))?;
            let page = self
                .with_timeout(self.inner.transport.pull_changes(
                    &user_id,
                    cursor,
                    self.inner.options.pull_page_limit,
                ))
                .await?;
            let PullResponse {
                changes,
                cursor: page_cursor,
                has_more,
            } = page;

            if has_more && page_cursor <= cursor {
                return Err(SyncError::Protocol("pull cursor did not advance".to_string()));
            }

            let mut own_changes = Vec::with_capacity(changes.len());
            for record in changes {
                if record.user_id == user_id {
                    own_changes.push(record);
                } else {
                    tracing::warn!(
                        entity_id = %record.entity_id,
                        "Dropping pulled change owned by another user"
                    );
                }
            }

            if !own_changes.is_empty() || page_cursor > cursor {
                self.with_store(|conn| {
                    let cache = SqliteSnapshotCache::new(conn);
                    for record in &own_changes {
                        cache.apply_server_change(record)?;
                    }
                    // the cursor moves only once the whole page is merged
                    cache.set_cursor(&user_id, page_cursor)
                })?;
                applied += own_changes.len();
            }

            if !has_more {
                break;
            }
        }

        if applied > 0 {
            self.bump_data();
        }
        Ok(applied)
    }

    /// Start the background loop: periodic drains plus an immediate one on
    /// every offline-to-online transition
    ///
    /// Idempotent; at most one loop runs per manager. The loop holds a clone
    /// of the manager, so it keeps running until `stop_auto_sync`.
    pub fn start_auto_sync(&self) {
        let mut slot = self
            .inner
            .auto_sync
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = slot.as_ref() {
            if !handle.task.is_finished() {
                return;
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let manager = self.clone();
        let task = tokio::spawn(manager.auto_sync_loop(shutdown_rx));
        *slot = Some(AutoSyncHandle {
            shutdown: shutdown_tx,
            task,
        });
        tracing::debug!("Auto sync started");
    }

    /// Stop the background loop
    ///
    /// Idempotent. An in-flight sync run is never aborted; the loop exits
    /// after it completes.
    pub fn stop_auto_sync(&self) {
        let handle = self
            .inner
            .auto_sync
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.shutdown.send(true).ok();
            tracing::debug!("Auto sync stopped");
        }
    }

    /// Whether the background loop is currently running
    #[must_use]
    pub fn auto_sync_running(&self) -> bool {
        self.inner
            .auto_sync
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.task.is_finished())
    }

    async fn auto_sync_loop(self, mut shutdown: watch::Receiver<bool>) {
        let mut net = self.inner.network.subscribe();
        let mut was_online = self.inner.network.is_online();
        let mut ticker = tokio::time::interval(self.inner.options.auto_sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.inner.network.is_online() {
                        if let Err(e) = self.sync_all().await {
                            tracing::warn!(error = %e, "Scheduled sync run failed");
                        }
                    }
                }
                changed = net.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = *net.borrow_and_update();
                    if online && !was_online {
                        tracing::info!("Back online; flushing the mutation log");
                        if let Err(e) = self.sync_all().await {
                            tracing::warn!(error = %e, "Reconnect sync run failed");
                        }
                    }
                    was_online = online;
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn drain(&self, _guard: tokio::sync::MutexGuard<'_, ()>) -> SyncResult<SyncReport> {
        let result = self.drain_inner().await;
        if let Ok(report) = &result {
            *self
                .inner
                .last_report
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = report.clone();
        }
        // wake coalesced callers even when the run errored
        self.inner.run_done.send_modify(|n| *n = n.wrapping_add(1));
        result
    }

    async fn drain_inner(&self) -> SyncResult<SyncReport> {
        let mut report = SyncReport::default();

        if !self.inner.network.is_online() {
            report.skipped_offline = true;
            tracing::debug!("Skipping sync run while offline");
            return Ok(report);
        }

        let claimed = self.with_store(|conn| {
            let log = SqliteMutationLog::new(conn);
            // recover anything a failed earlier run left claimed
            log.release_claims(&self.inner.options.user_id, None)?;
            log.claim_for_sync(&self.inner.options.user_id, self.inner.options.max_retries)
        })?;
        self.publish_status()?;

        if !claimed.is_empty() {
            let mut groups: HashMap<String, Vec<QueueEntry>> = HashMap::new();
            for entry in claimed {
                groups.entry(entry.entity_type.clone()).or_default().push(entry);
            }

            let mut workers = JoinSet::new();
            for (entity_type, entries) in groups {
                let manager = self.clone();
                workers.spawn(async move { manager.sync_entity_type(entity_type, entries).await });
            }

            let mut first_error = None;
            while let Some(joined) = workers.join_next().await {
                match joined {
                    Ok(Ok(partial)) => report.absorb(partial),
                    Ok(Err(e)) => {
                        tracing::error!(error = %e, "Sync worker failed");
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Sync worker panicked");
                        if first_error.is_none() {
                            first_error = Some(SyncError::Internal(e.to_string()));
                        }
                    }
                }
            }
            if let Some(e) = first_error {
                self.publish_status()?;
                return Err(e);
            }
        }

        match self.pull_sync().await {
            Ok(pulled) => report.pulled = pulled,
            Err(e) => {
                tracing::warn!(error = %e, "Pull phase failed");
                report.pull_error = Some(e.to_string());
            }
        }

        self.publish_status()?;
        if report.outcomes.is_empty() && report.pulled == 0 {
            tracing::debug!("Sync run finished with nothing to do");
        } else {
            tracing::info!(
                applied = report.applied,
                duplicates = report.duplicates,
                retrying = report.retrying,
                rejected = report.rejected,
                failed = report.failed,
                deferred = report.deferred,
                pulled = report.pulled,
                "Sync run finished"
            );
        }
        Ok(report)
    }

    /// Push one entity type's claimed entries, batch by batch, in order
    async fn sync_entity_type(
        &self,
        entity_type: String,
        entries: Vec<QueueEntry>,
    ) -> SyncResult<SyncReport> {
        let mut report = SyncReport::default();
        let chunks: Vec<&[QueueEntry]> = entries.chunks(self.inner.options.batch_size).collect();
        let mut halted_at = None;

        for (index, chunk) in chunks.iter().enumerate() {
            match self.sync_batch(&entity_type, chunk, &mut report).await? {
                BatchFlow::Continue => {}
                BatchFlow::Halt => {
                    halted_at = Some(index);
                    break;
                }
            }
        }

        if let Some(index) = halted_at {
            // sync_batch already released the claims; later chunks were never
            // attempted and keep their place in line
            for chunk in &chunks[index + 1..] {
                for entry in *chunk {
                    report.record(entry.client_id, EntryOutcome::Deferred);
                }
            }
        }

        Ok(report)
    }

    async fn sync_batch(
        &self,
        entity_type: &str,
        chunk: &[QueueEntry],
        report: &mut SyncReport,
    ) -> SyncResult<BatchFlow> {
        let to_push = self.resolve_duplicates(chunk, report).await?;
        if to_push.len() != chunk.len() {
            self.bump_data();
        }
        if to_push.is_empty() {
            self.publish_status()?;
            return Ok(BatchFlow::Continue);
        }

        let request = PushRequest {
            entries: to_push.iter().map(PushEntry::from).collect(),
        };
        let response = match self
            .with_timeout(
                self.inner
                    .transport
                    .push_batch(&self.inner.options.user_id, request),
            )
            .await
        {
            Ok(response) => response,
            Err(e) => {
                // the whole request failed; every entry gets a retry mark and
                // anything claimed behind it goes back to pending
                let message = e.to_string();
                self.fail_entries(&to_push, &message, report)?;
                self.release_type(entity_type)?;
                self.publish_status()?;
                return Ok(BatchFlow::Halt);
            }
        };

        let flow = self.apply_results(entity_type, &to_push, response, report)?;
        self.publish_status()?;
        self.bump_data();
        Ok(flow)
    }

    /// Resolve duplicate creates before they are pushed
    ///
    /// Locally flagged ones repeat an earlier create's content in this run;
    /// remotely flagged ones match content the server already holds. Both are
    /// success-equivalent: the entry is removed without a retry mark. The
    /// remote probe is advisory; if it fails, everything is pushed and the
    /// server resolves duplicates itself.
    async fn resolve_duplicates(
        &self,
        chunk: &[QueueEntry],
        report: &mut SyncReport,
    ) -> SyncResult<Vec<QueueEntry>> {
        let local_flags = local_duplicate_flags(chunk);

        let candidates: Vec<usize> = chunk
            .iter()
            .enumerate()
            .filter(|(index, entry)| {
                entry.operation == Operation::Create && !local_flags[*index]
            })
            .map(|(index, _)| index)
            .collect();

        let mut remote_flags = vec![false; chunk.len()];
        if !candidates.is_empty() {
            let probes = candidates
                .iter()
                .map(|&index| DuplicateProbe {
                    entity_type: chunk[index].entity_type.clone(),
                    fingerprint: fingerprint(&chunk[index].entity_type, &chunk[index].payload),
                })
                .collect();
            let request = DuplicateCheckRequest { probes };
            match self
                .with_timeout(
                    self.inner
                        .transport
                        .check_duplicates(&self.inner.options.user_id, request),
                )
                .await
            {
                Ok(response) if response.results.len() == candidates.len() => {
                    for (&index, flagged) in candidates.iter().zip(response.results) {
                        remote_flags[index] = flagged;
                    }
                }
                Ok(_) => {
                    tracing::warn!("Duplicate pre-flight answered with the wrong arity; pushing everything");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Duplicate pre-flight failed; pushing everything");
                }
            }
        }

        let mut to_push = Vec::with_capacity(chunk.len());
        for (index, entry) in chunk.iter().enumerate() {
            if local_flags[index] || remote_flags[index] {
                self.resolve_duplicate(entry, report)?;
            } else {
                to_push.push(entry.clone());
            }
        }
        Ok(to_push)
    }

    fn apply_results(
        &self,
        entity_type: &str,
        pushed: &[QueueEntry],
        response: PushResponse,
        report: &mut SyncReport,
    ) -> SyncResult<BatchFlow> {
        let by_id: HashMap<ClientId, &QueueEntry> =
            pushed.iter().map(|entry| (entry.client_id, entry)).collect();
        let mut resolved: HashSet<ClientId> = HashSet::new();
        let mut hard_failure = false;

        for result in response.results {
            let Some(entry) = by_id.get(&result.client_id) else {
                tracing::warn!(client_id = %result.client_id, "Push result for an unknown entry");
                continue;
            };
            resolved.insert(result.client_id);

            match result.status {
                PushStatus::Success => {
                    self.apply_success(entry, result.server_id.as_deref(), result.server_seq)?;
                    report.record(
                        entry.client_id,
                        EntryOutcome::Applied {
                            server_id: result.server_id,
                        },
                    );
                }
                PushStatus::Duplicate => self.resolve_duplicate(entry, report)?,
                PushStatus::Error => {
                    hard_failure = true;
                    let message = result
                        .message
                        .unwrap_or_else(|| "entry rejected".to_string());
                    if result.error_kind == Some(RejectionKind::Validation) {
                        self.reject_entry(entry, &message, report)?;
                    } else {
                        self.fail_entries(std::slice::from_ref(*entry), &message, report)?;
                    }
                }
            }
        }

        // the server answers for a prefix; entries past its stopping point
        // got no result and must keep their place in line
        let unresolved: Vec<&QueueEntry> = pushed
            .iter()
            .filter(|entry| !resolved.contains(&entry.client_id))
            .collect();
        if !unresolved.is_empty() {
            hard_failure = true;
            for entry in &unresolved {
                report.record(entry.client_id, EntryOutcome::Deferred);
            }
        }
        if hard_failure {
            self.release_type(entity_type)?;
        }

        Ok(if hard_failure {
            BatchFlow::Halt
        } else {
            BatchFlow::Continue
        })
    }

    /// Commit one confirmed entry: prune the optimistic copy, update the
    /// server snapshot, drop the log entry
    fn apply_success(
        &self,
        entry: &QueueEntry,
        server_id: Option<&str>,
        server_seq: Option<i64>,
    ) -> SyncResult<()> {
        self.with_store(|conn| {
            let cache = SqliteSnapshotCache::new(conn);
            match entry.operation {
                Operation::Create | Operation::Update => {
                    cache.remove_offline(&entry.user_id, &entry.entity_type, &entry.entity_id)?;
                    cache.apply_server_change(&EntityRecord {
                        user_id: entry.user_id.clone(),
                        entity_type: entry.entity_type.clone(),
                        entity_id: server_id.unwrap_or(&entry.entity_id).to_string(),
                        view_key: entry.view_key.clone(),
                        payload: entry.payload.clone(),
                        updated_at: entry.enqueued_at,
                        deleted: false,
                        server_seq: server_seq.unwrap_or(0),
                    })?;
                }
                Operation::Delete => {
                    cache.remove_tombstone(&entry.user_id, &entry.entity_type, &entry.entity_id)?;
                    cache.remove_server(&entry.user_id, &entry.entity_type, &entry.entity_id)?;
                    cache.remove_offline(&entry.user_id, &entry.entity_type, &entry.entity_id)?;
                }
            }
            SqliteMutationLog::new(conn).remove(&entry.client_id)
        })
    }

    /// Resolve an entry the server already holds: clean residue, drop the
    /// entry, no retry mark
    fn resolve_duplicate(&self, entry: &QueueEntry, report: &mut SyncReport) -> SyncResult<()> {
        self.with_store(|conn| {
            let cache = SqliteSnapshotCache::new(conn);
            match entry.operation {
                Operation::Create | Operation::Update => {
                    cache.remove_offline(&entry.user_id, &entry.entity_type, &entry.entity_id)?;
                }
                Operation::Delete => {
                    cache.remove_tombstone(&entry.user_id, &entry.entity_type, &entry.entity_id)?;
                    cache.remove_server(&entry.user_id, &entry.entity_type, &entry.entity_id)?;
                    cache.remove_offline(&entry.user_id, &entry.entity_type, &entry.entity_id)?;
                }
            }
            SqliteMutationLog::new(conn).remove(&entry.client_id)
        })?;
        report.record(entry.client_id, EntryOutcome::Duplicate);
        Ok(())
    }

    fn fail_entries(
        &self,
        entries: &[QueueEntry],
        message: &str,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        for entry in entries {
            let updated = self.with_store(|conn| {
                match SqliteMutationLog::new(conn).record_failure(&entry.client_id, message) {
                    Ok(updated) => Ok(Some(updated)),
                    // discarded while the request was in flight
                    Err(Error::NotFound(_)) => Ok(None),
                    Err(e) => Err(e),
                }
            })?;
            let Some(updated) = updated else { continue };

            if updated.is_retryable(self.inner.options.max_retries) {
                report.record(
                    entry.client_id,
                    EntryOutcome::Retrying {
                        error: message.to_string(),
                    },
                );
            } else {
                let error = SyncError::RetriesExhausted {
                    attempts: updated.retry_count,
                    last_error: message.to_string(),
                }
                .to_string();
                tracing::warn!(
                    client_id = %entry.client_id,
                    attempts = updated.retry_count,
                    "Mutation exhausted its retry budget"
                );
                report.record(entry.client_id, EntryOutcome::Failed { error });
            }
        }
        Ok(())
    }

    fn reject_entry(
        &self,
        entry: &QueueEntry,
        message: &str,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        self.with_store(|conn| {
            match SqliteMutationLog::new(conn).mark_rejected(&entry.client_id, message) {
                Ok(()) | Err(Error::NotFound(_)) => Ok(()),
                Err(e) => Err(e),
            }
        })?;
        tracing::warn!(
            client_id = %entry.client_id,
            error = message,
            "Server rejected a mutation"
        );
        report.record(
            entry.client_id,
            EntryOutcome::Rejected {
                error: message.to_string(),
            },
        );
        Ok(())
    }

    fn release_type(&self, entity_type: &str) -> SyncResult<()> {
        self.with_store(|conn| {
            SqliteMutationLog::new(conn)
                .release_claims(&self.inner.options.user_id, Some(entity_type))
        })
    }

    fn publish_status(&self) -> SyncResult<()> {
        let counts = self.status()?;
        self.inner.status_tx.send_if_modified(|current| {
            if *current == counts {
                false
            } else {
                *current = counts;
                true
            }
        });
        Ok(())
    }

    fn bump_data(&self) {
        self.inner.data_tx.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// Run a closure against the store; the lock is never held across awaits
    fn with_store<R>(
        &self,
        f: impl FnOnce(&rusqlite::Connection) -> crate::error::Result<R>,
    ) -> SyncResult<R> {
        let store = self
            .inner
            .store
            .lock()
            .map_err(|_| SyncError::Store(Error::Database("local store lock poisoned".to_string())))?;
        f(store.connection()).map_err(SyncError::Store)
    }

    async fn with_timeout<R>(&self, request: impl Future<Output = SyncResult<R>>) -> SyncResult<R> {
        match tokio::time::timeout(self.inner.options.request_timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Network("request timed out".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::protocol::{DuplicateCheckResponse, PushResult};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// What the next push request against one entity type should do
    enum PushBehavior {
        Succeed,
        FailNetwork,
        /// Reject the first entry as invalid, process nothing after it
        RejectFirst,
        DuplicateAll,
        /// Succeed for n entries, fail the next internally, answer nothing after
        InternalAfter(usize),
        /// Sleep, then succeed
        Stall(Duration),
    }

    #[derive(Default)]
    struct PushPlans {
        global: VecDeque<PushBehavior>,
        typed: HashMap<String, VecDeque<PushBehavior>>,
    }

    #[derive(Default)]
    struct ScriptedTransport {
        next_seq: AtomicI64,
        push_log: StdMutex<Vec<PushRequest>>,
        push_plan: StdMutex<PushPlans>,
        dup_answers: StdMutex<VecDeque<Vec<bool>>>,
        pull_pages: StdMutex<VecDeque<PullResponse>>,
    }

    impl ScriptedTransport {
        fn plan_push(&self, behavior: PushBehavior) {
            self.push_plan.lock().unwrap().global.push_back(behavior);
        }

        fn plan_push_for(&self, entity_type: &str, behavior: PushBehavior) {
            self.push_plan
                .lock()
                .unwrap()
                .typed
                .entry(entity_type.to_string())
                .or_default()
                .push_back(behavior);
        }

        fn plan_duplicates(&self, answers: Vec<bool>) {
            self.dup_answers.lock().unwrap().push_back(answers);
        }

        fn plan_pull(&self, page: PullResponse) {
            self.pull_pages.lock().unwrap().push_back(page);
        }

        fn push_count(&self) -> usize {
            self.push_log.lock().unwrap().len()
        }

        fn last_push(&self) -> PushRequest {
            self.push_log.lock().unwrap().last().unwrap().clone()
        }

        fn take_behavior(&self, request: &PushRequest) -> PushBehavior {
            let mut plans = self.push_plan.lock().unwrap();
            let key = request
                .entries
                .first()
                .map(|entry| entry.entity_type.clone())
                .unwrap_or_default();
            if let Some(queue) = plans.typed.get_mut(&key) {
                if let Some(behavior) = queue.pop_front() {
                    return behavior;
                }
            }
            plans.global.pop_front().unwrap_or(PushBehavior::Succeed)
        }

        fn succeed(&self, request: &PushRequest) -> PushResponse {
            PushResponse {
                results: request
                    .entries
                    .iter()
                    .map(|entry| {
                        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
                        PushResult::success(entry.client_id, entry.entity_id.clone(), seq)
                    })
                    .collect(),
            }
        }
    }

    impl SyncTransport for ScriptedTransport {
        async fn push_batch(
            &self,
            _user_id: &str,
            request: PushRequest,
        ) -> Result<PushResponse, SyncError> {
            let behavior = self.take_behavior(&request);
            self.push_log.lock().unwrap().push(request.clone());

            match behavior {
                PushBehavior::Succeed => Ok(self.succeed(&request)),
                PushBehavior::FailNetwork => {
                    Err(SyncError::Network("connection refused".to_string()))
                }
                PushBehavior::RejectFirst => Ok(PushResponse {
                    results: vec![PushResult::error(
                        request.entries[0].client_id,
                        RejectionKind::Validation,
                        "payload must be an object",
                    )],
                }),
                PushBehavior::DuplicateAll => Ok(PushResponse {
                    results: request
                        .entries
                        .iter()
                        .map(|entry| {
                            PushResult::duplicate(entry.client_id, Some(entry.entity_id.clone()))
                        })
                        .collect(),
                }),
                PushBehavior::InternalAfter(n) => {
                    let mut results: Vec<PushResult> = request
                        .entries
                        .iter()
                        .take(n)
                        .map(|entry| {
                            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
                            PushResult::success(entry.client_id, entry.entity_id.clone(), seq)
                        })
                        .collect();
                    if let Some(entry) = request.entries.get(n) {
                        results.push(PushResult::error(
                            entry.client_id,
                            RejectionKind::Internal,
                            "storage hiccup",
                        ));
                    }
                    Ok(PushResponse { results })
                }
                PushBehavior::Stall(duration) => {
                    tokio::time::sleep(duration).await;
                    Ok(self.succeed(&request))
                }
            }
        }

        async fn check_duplicates(
            &self,
            _user_id: &str,
            request: DuplicateCheckRequest,
        ) -> Result<DuplicateCheckResponse, SyncError> {
            let answers = self
                .dup_answers
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| vec![false; request.probes.len()]);
            Ok(DuplicateCheckResponse { results: answers })
        }

        async fn pull_changes(
            &self,
            _user_id: &str,
            cursor: i64,
            _limit: usize,
        ) -> Result<PullResponse, SyncError> {
            Ok(self
                .pull_pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| PullResponse {
                    changes: Vec::new(),
                    cursor,
                    has_more: false,
                }))
        }
    }

    struct Harness {
        manager: SyncManager<Arc<ScriptedTransport>>,
        transport: Arc<ScriptedTransport>,
        net: NetworkWatch,
    }

    fn harness() -> Harness {
        harness_with(SyncOptions::new("u1"))
    }

    fn harness_with(options: SyncOptions) -> Harness {
        let store = LocalStore::open_in_memory().unwrap();
        let net = NetworkWatch::new(true);
        let transport = Arc::new(ScriptedTransport::default());
        let manager =
            SyncManager::new(store, Arc::clone(&transport), net.clone(), options).unwrap();
        Harness {
            manager,
            transport,
            net,
        }
    }

    fn create(entity_id: &str, name: &str) -> MutationWrite {
        MutationWrite::create("activity", entity_id, "2026-08-25", json!({ "name": name }))
    }

    fn server_record(entity_id: &str, name: &str, server_seq: i64) -> EntityRecord {
        EntityRecord {
            user_id: "u1".into(),
            entity_type: "activity".into(),
            entity_id: entity_id.into(),
            view_key: "2026-08-25".into(),
            payload: json!({ "name": name }),
            updated_at: 1000,
            deleted: false,
            server_seq,
        }
    }

    #[tokio::test]
    async fn enqueue_updates_view_before_any_sync() {
        let h = harness();

        let id = h.manager.enqueue(create("e1", "Run")).unwrap();

        let status = h.manager.status().unwrap();
        assert_eq!(status.pending, 1);

        let view = h.manager.merged_view("activity", "2026-08-25").unwrap();
        assert_eq!(view.len(), 1);
        assert!(view[0].is_offline_data());
        assert_eq!(view[0].record.payload["name"], "Run");

        let pending = h.manager.list_pending(None).unwrap();
        assert_eq!(pending[0].client_id, id);
        assert_eq!(h.transport.push_count(), 0);
    }

    #[tokio::test]
    async fn enqueued_delete_hides_entity_immediately() {
        let h = harness();
        h.manager.enqueue(create("e1", "Run")).unwrap();
        h.manager.sync_all().await.unwrap();
        assert_eq!(h.manager.merged_view("activity", "2026-08-25").unwrap().len(), 1);

        h.manager
            .enqueue(MutationWrite::delete("activity", "e1", "2026-08-25"))
            .unwrap();

        assert!(h.manager.merged_view("activity", "2026-08-25").unwrap().is_empty());
    }

    #[tokio::test]
    async fn sync_all_confirms_entries() {
        let h = harness();
        h.manager.enqueue(create("e1", "Run")).unwrap();
        h.manager.enqueue(create("e2", "Read")).unwrap();

        let report = h.manager.sync_all().await.unwrap();

        assert_eq!(report.applied, 2);
        assert!(report.is_clean());
        assert!(h.manager.status().unwrap().is_idle());

        let view = h.manager.merged_view("activity", "2026-08-25").unwrap();
        assert_eq!(view.len(), 2);
        assert!(view.iter().all(|entity| !entity.is_offline_data()));
        assert!(view.iter().all(|entity| entity.record.server_seq > 0));
    }

    #[tokio::test]
    async fn sync_all_skips_when_offline() {
        let h = harness();
        h.net.set_online(false);
        h.manager.enqueue(create("e1", "Run")).unwrap();

        let report = h.manager.sync_all().await.unwrap();

        assert!(report.skipped_offline);
        assert_eq!(h.transport.push_count(), 0);
        assert_eq!(h.manager.status().unwrap().pending, 1);
    }

    #[tokio::test]
    async fn network_failure_marks_entries_for_retry() {
        let h = harness();
        let id = h.manager.enqueue(create("e1", "Run")).unwrap();
        h.transport.plan_push(PushBehavior::FailNetwork);

        let report = h.manager.sync_all().await.unwrap();
        assert_eq!(report.retrying, 1);
        assert!(matches!(
            report.outcome_for(&id),
            Some(EntryOutcome::Retrying { .. })
        ));

        let failed = h.manager.list_failed().unwrap();
        assert_eq!(failed[0].retry_count, 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("Network error: connection refused"));

        // the entry is claimed again on the next run and drains
        let report = h.manager.sync_all().await.unwrap();
        assert_eq!(report.applied, 1);
        assert!(h.manager.status().unwrap().is_idle());
    }

    #[tokio::test]
    async fn retries_exhaust_into_persistent_failure() {
        let h = harness_with(SyncOptions::new("u1").with_max_retries(2));
        let id = h.manager.enqueue(create("e1", "Run")).unwrap();
        h.transport.plan_push(PushBehavior::FailNetwork);
        h.transport.plan_push(PushBehavior::FailNetwork);

        h.manager.sync_all().await.unwrap();
        let report = h.manager.sync_all().await.unwrap();

        assert_eq!(report.failed, 1);
        match report.outcome_for(&id) {
            Some(EntryOutcome::Failed { error }) => {
                assert!(error.contains("Retries exhausted after 2 attempts"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        // exhausted entries are not claimed again
        let report = h.manager.sync_all().await.unwrap();
        assert!(report.outcomes.is_empty());
        assert_eq!(h.transport.push_count(), 2);
        assert_eq!(h.manager.status().unwrap().failed, 1);
    }

    #[tokio::test]
    async fn rejection_parks_entry_and_defers_the_rest() {
        let h = harness();
        let bad = h.manager.enqueue(create("e1", "Run")).unwrap();
        let second = h.manager.enqueue(create("e2", "Read")).unwrap();
        let third = h.manager.enqueue(create("e3", "Swim")).unwrap();
        h.transport.plan_push(PushBehavior::RejectFirst);

        let report = h.manager.sync_all().await.unwrap();

        assert_eq!(report.rejected, 1);
        assert_eq!(report.deferred, 2);
        assert!(matches!(
            report.outcome_for(&bad),
            Some(EntryOutcome::Rejected { .. })
        ));
        assert_eq!(report.outcome_for(&second), Some(&EntryOutcome::Deferred));
        assert_eq!(report.outcome_for(&third), Some(&EntryOutcome::Deferred));

        let status = h.manager.status().unwrap();
        assert_eq!(status.failed, 1);
        assert_eq!(status.pending, 2);

        // rejected entries stay parked; the deferred ones drain
        let report = h.manager.sync_all().await.unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(h.manager.status().unwrap().failed, 1);

        // until the user asks for another attempt
        h.manager.retry_failed(&bad).unwrap();
        let report = h.manager.sync_all().await.unwrap();
        assert_eq!(report.applied, 1);
        assert!(h.manager.status().unwrap().is_idle());
    }

    #[tokio::test]
    async fn parked_entry_holds_back_its_entity_until_discarded() {
        let h = harness();
        let bad = h.manager.enqueue(create("e1", "Run")).unwrap();
        h.transport.plan_push(PushBehavior::RejectFirst);
        h.manager.sync_all().await.unwrap();
        assert_eq!(h.manager.status().unwrap().failed, 1);

        // a follow-up edit to the same entity has to wait its turn
        let edit = h
            .manager
            .enqueue(MutationWrite::update(
                "activity",
                "e1",
                "2026-08-25",
                json!({ "name": "Jog" }),
            ))
            .unwrap();
        let other = h.manager.enqueue(create("e2", "Swim")).unwrap();

        let report = h.manager.sync_all().await.unwrap();
        assert!(matches!(
            report.outcome_for(&other),
            Some(EntryOutcome::Applied { .. })
        ));
        assert_eq!(report.outcome_for(&edit), None);
        let status = h.manager.status().unwrap();
        assert_eq!(status.pending, 1);
        assert_eq!(status.failed, 1);

        // discarding the blocker releases the held-back edit
        h.manager.discard_failed(&bad).unwrap();
        let report = h.manager.sync_all().await.unwrap();
        assert!(matches!(
            report.outcome_for(&edit),
            Some(EntryOutcome::Applied { .. })
        ));
        assert!(h.manager.status().unwrap().is_idle());
    }

    #[tokio::test]
    async fn internal_error_halts_type_midway() {
        let h = harness();
        let first = h.manager.enqueue(create("e1", "Run")).unwrap();
        let second = h.manager.enqueue(create("e2", "Read")).unwrap();
        let third = h.manager.enqueue(create("e3", "Swim")).unwrap();
        h.transport.plan_push(PushBehavior::InternalAfter(1));

        let report = h.manager.sync_all().await.unwrap();

        assert!(matches!(
            report.outcome_for(&first),
            Some(EntryOutcome::Applied { .. })
        ));
        assert!(matches!(
            report.outcome_for(&second),
            Some(EntryOutcome::Retrying { .. })
        ));
        assert_eq!(report.outcome_for(&third), Some(&EntryOutcome::Deferred));

        // the next run drains the remainder in sequence order
        let report = h.manager.sync_all().await.unwrap();
        assert_eq!(report.applied, 2);
        let request = h.transport.last_push();
        assert!(request.entries.windows(2).all(|w| w[0].sequence < w[1].sequence));
    }

    #[tokio::test]
    async fn duplicate_results_resolve_without_retry_marks() {
        let h = harness();
        h.manager.enqueue(create("e1", "Run")).unwrap();
        h.transport.plan_push(PushBehavior::DuplicateAll);

        let report = h.manager.sync_all().await.unwrap();

        assert_eq!(report.duplicates, 1);
        assert!(report.is_clean());
        assert!(h.manager.status().unwrap().is_idle());
        // the optimistic copy is gone; the server copy arrives via pull
        assert!(h.manager.merged_view("activity", "2026-08-25").unwrap().is_empty());
    }

    #[tokio::test]
    async fn identical_creates_in_one_run_collapse_locally() {
        let h = harness();
        h.manager.enqueue(create("e1", "Run")).unwrap();
        h.manager.enqueue(create("e2", "Run")).unwrap();

        let report = h.manager.sync_all().await.unwrap();

        assert_eq!(report.applied, 1);
        assert_eq!(report.duplicates, 1);
        assert_eq!(h.transport.last_push().entries.len(), 1);
    }

    #[tokio::test]
    async fn remote_duplicate_flag_skips_the_push() {
        let h = harness();
        h.manager.enqueue(create("e1", "Run")).unwrap();
        h.transport.plan_duplicates(vec![true]);

        let report = h.manager.sync_all().await.unwrap();

        assert_eq!(report.duplicates, 1);
        assert_eq!(h.transport.push_count(), 0);
        assert!(h.manager.status().unwrap().is_idle());
    }

    #[tokio::test]
    async fn independent_types_do_not_block_each_other() {
        let h = harness();
        h.manager
            .enqueue(MutationWrite::create("habit", "h1", "inbox", json!({"name": "Floss"})))
            .unwrap();
        h.manager.enqueue(create("e1", "Run")).unwrap();
        h.manager.enqueue(create("e2", "Read")).unwrap();
        h.transport.plan_push_for("habit", PushBehavior::FailNetwork);

        let report = h.manager.sync_all().await.unwrap();

        assert_eq!(report.applied, 2);
        assert_eq!(report.retrying, 1);
        assert_eq!(h.transport.push_count(), 2);
        let status = h.manager.status().unwrap();
        assert_eq!(status.failed, 1);
        assert_eq!(status.pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_sync_all_calls_coalesce() {
        let h = harness();
        h.manager.enqueue(create("e1", "Run")).unwrap();
        h.transport.plan_push(PushBehavior::Stall(Duration::from_secs(5)));

        let first = tokio::spawn({
            let manager = h.manager.clone();
            async move { manager.sync_all().await.unwrap() }
        });
        tokio::task::yield_now().await;
        let second = tokio::spawn({
            let manager = h.manager.clone();
            async move { manager.sync_all().await.unwrap() }
        });

        let (a, b) = (first.await.unwrap(), second.await.unwrap());

        assert_eq!(h.transport.push_count(), 1);
        assert_eq!(a.applied, 1);
        assert_eq!(b.applied, 1);
    }

    #[tokio::test]
    async fn pull_merges_pages_and_advances_cursor() {
        let h = harness();
        h.transport.plan_pull(PullResponse {
            changes: vec![server_record("e1", "Run", 1), server_record("e2", "Read", 2)],
            cursor: 2,
            has_more: true,
        });
        h.transport.plan_pull(PullResponse {
            changes: vec![server_record("e3", "Swim", 3)],
            cursor: 3,
            has_more: false,
        });

        let report = h.manager.sync_all().await.unwrap();

        assert_eq!(report.pulled, 3);
        assert_eq!(h.manager.merged_view("activity", "2026-08-25").unwrap().len(), 3);

        // a later deletion pulled from the server drops the cached copy
        let mut gone = server_record("e2", "Read", 4);
        gone.deleted = true;
        h.transport.plan_pull(PullResponse {
            changes: vec![gone],
            cursor: 4,
            has_more: false,
        });
        h.manager.pull_sync().await.unwrap();
        let view = h.manager.merged_view("activity", "2026-08-25").unwrap();
        assert_eq!(view.len(), 2);
        assert!(view.iter().all(|entity| entity.record.entity_id != "e2"));
    }

    #[tokio::test]
    async fn pull_failure_keeps_push_outcomes() {
        let h = harness();
        h.manager.enqueue(create("e1", "Run")).unwrap();
        h.transport.plan_pull(PullResponse {
            changes: Vec::new(),
            cursor: 0,
            has_more: true, // cursor does not advance: protocol error
        });

        let report = h.manager.sync_all().await.unwrap();

        assert_eq!(report.applied, 1);
        assert!(report.pull_error.is_some());
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn discard_failed_rolls_back_the_local_effect() {
        let h = harness();
        let id = h.manager.enqueue(create("e1", "Run")).unwrap();

        h.manager.discard_failed(&id).unwrap();

        assert!(h.manager.status().unwrap().is_idle());
        assert!(h.manager.merged_view("activity", "2026-08-25").unwrap().is_empty());

        // discarding a queued delete resurfaces the entity
        h.manager.enqueue(create("e2", "Read")).unwrap();
        h.manager.sync_all().await.unwrap();
        let delete = h
            .manager
            .enqueue(MutationWrite::delete("activity", "e2", "2026-08-25"))
            .unwrap();
        assert!(h.manager.merged_view("activity", "2026-08-25").unwrap().is_empty());
        h.manager.discard_failed(&delete).unwrap();
        assert_eq!(h.manager.merged_view("activity", "2026-08-25").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn clear_wipes_queue_caches_and_cursor() {
        let h = harness();
        h.manager.enqueue(create("e1", "Run")).unwrap();
        h.transport.plan_pull(PullResponse {
            changes: vec![server_record("e9", "Row", 9)],
            cursor: 9,
            has_more: false,
        });
        h.manager.sync_all().await.unwrap();
        h.manager.enqueue(create("e2", "Read")).unwrap();

        h.manager.clear().unwrap();

        assert!(h.manager.status().unwrap().is_idle());
        assert!(h.manager.merged_view("activity", "2026-08-25").unwrap().is_empty());
        assert_eq!(h.manager.list_pending(None).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn status_subscribers_see_the_latest_counts() {
        let h = harness();
        let mut rx = h.manager.subscribe_status();
        assert!(rx.borrow().is_idle());

        h.manager.enqueue(create("e1", "Run")).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().pending, 1);

        h.manager.sync_all().await.unwrap();
        assert!(rx.borrow().is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn auto_sync_flushes_on_start_and_reconnect() {
        let h = harness_with(
            SyncOptions::new("u1").with_auto_sync_interval(Duration::from_secs(300)),
        );
        h.manager.enqueue(create("e1", "Run")).unwrap();

        h.manager.start_auto_sync();
        h.manager.start_auto_sync(); // idempotent
        assert!(h.manager.auto_sync_running());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.transport.push_count(), 1);

        h.net.set_online(false);
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.manager.enqueue(create("e2", "Read")).unwrap();
        h.net.set_online(true);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.transport.push_count(), 2);

        h.manager.stop_auto_sync();
        h.manager.stop_auto_sync(); // idempotent
        h.manager.enqueue(create("e3", "Swim")).unwrap();
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(h.transport.push_count(), 2);
        assert!(!h.manager.auto_sync_running());
    }

    #[tokio::test(start_paused = true)]
    async fn auto_sync_runs_on_the_timer() {
        let h = harness_with(
            SyncOptions::new("u1").with_auto_sync_interval(Duration::from_secs(60)),
        );
        h.manager.start_auto_sync();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.transport.push_count(), 0); // nothing queued yet

        h.manager.enqueue(create("e1", "Run")).unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(h.transport.push_count(), 1);

        h.manager.stop_auto_sync();
    }

    #[tokio::test]
    async fn check_duplicates_preserves_probe_order() {
        let h = harness();
        h.transport.plan_duplicates(vec![true, false]);

        let flags = h
            .manager
            .check_duplicates(vec![
                DuplicateProbe {
                    entity_type: "activity".into(),
                    fingerprint: fingerprint("activity", &json!({"name": "Run"})),
                },
                DuplicateProbe {
                    entity_type: "activity".into(),
                    fingerprint: fingerprint("activity", &json!({"name": "Walk"})),
                },
            ])
            .await
            .unwrap();

        assert_eq!(flags, vec![true, false]);
        assert!(h.manager.check_duplicates(Vec::new()).await.unwrap().is_empty());
    }
}
