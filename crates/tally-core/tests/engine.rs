//! Whole-engine tests: one in-memory server shared by several devices,
//! each running a real `SyncManager` over a real local store.
//!
//! The unit tests in `sync::manager` script individual transport answers;
//! these run complete flows instead - multi-device convergence, reconnects,
//! lost responses, retry loops - and check that the server and every device
//! end up agreeing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tally_core::db::LocalStore;
use tally_core::sync::fingerprint;
use tally_core::sync::protocol::{
    DuplicateCheckRequest, DuplicateCheckResponse, PullResponse, PushEntry, PushRequest,
    PushResponse, PushResult, RejectionKind,
};
use tally_core::util::unix_millis_now;
use tally_core::{
    ClientId, EntityRecord, MutationWrite, NetworkWatch, Operation, SyncError, SyncManager,
    SyncOptions, SyncTransport,
};

const VIEW: &str = "2026-08-25";

/// One entity as the server holds it. Deletions stay behind as markers so
/// later pulls can propagate them.
struct ServerRow {
    view_key: String,
    payload: Value,
    fingerprint: String,
    updated_at: i64,
    deleted: bool,
    server_seq: i64,
}

#[derive(Default)]
struct ServerState {
    /// `(user_id, entity_type, entity_id)` to current row
    rows: HashMap<(String, String, String), ServerRow>,
    /// Client ids already applied, mapped to the entity they touched
    applied: HashMap<ClientId, String>,
    next_seq: i64,
    /// Client sequence numbers in the order the server applied them
    apply_order: Vec<i64>,
    push_batches: usize,
    /// Refuse this many push requests outright before recovering
    refuse_pushes: u32,
    /// Reject every entry of this many push requests as invalid
    reject_pushes: u32,
    /// Apply the next push normally, then lose the response
    drop_next_response: bool,
}

/// In-memory stand-in for the sync server, shared by every device in a test
#[derive(Clone, Default)]
struct InMemoryServer {
    state: Arc<Mutex<ServerState>>,
}

impl InMemoryServer {
    fn refuse_next_pushes(&self, count: u32) {
        self.state.lock().unwrap().refuse_pushes = count;
    }

    fn reject_next_pushes(&self, count: u32) {
        self.state.lock().unwrap().reject_pushes = count;
    }

    fn drop_next_response(&self) {
        self.state.lock().unwrap().drop_next_response = true;
    }

    fn live_count(&self, user_id: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .rows
            .iter()
            .filter(|((user, _, _), row)| user == user_id && !row.deleted)
            .count()
    }

    /// Payload and deletion marker of one row, if the server has seen it
    fn row(&self, user_id: &str, entity_type: &str, entity_id: &str) -> Option<(Value, bool)> {
        let key = (
            user_id.to_string(),
            entity_type.to_string(),
            entity_id.to_string(),
        );
        let state = self.state.lock().unwrap();
        state
            .rows
            .get(&key)
            .map(|row| (row.payload.clone(), row.deleted))
    }

    fn push_batches(&self) -> usize {
        self.state.lock().unwrap().push_batches
    }

    fn apply_order(&self) -> Vec<i64> {
        self.state.lock().unwrap().apply_order.clone()
    }
}

fn apply_entry(state: &mut ServerState, user_id: &str, entry: &PushEntry) -> PushResult {
    // replayed client id: answer what the first attempt did
    if let Some(entity_id) = state.applied.get(&entry.client_id) {
        return PushResult::duplicate(entry.client_id, Some(entity_id.clone()));
    }

    let key = (
        user_id.to_string(),
        entry.entity_type.clone(),
        entry.entity_id.clone(),
    );
    if matches!(entry.operation, Operation::Create) {
        if state.rows.get(&key).is_some_and(|row| !row.deleted) {
            return PushResult::duplicate(entry.client_id, Some(entry.entity_id.clone()));
        }
        let print = fingerprint(&entry.entity_type, &entry.payload);
        let twin = state.rows.iter().find(|((user, entity_type, _), row)| {
            user == user_id
                && *entity_type == entry.entity_type
                && !row.deleted
                && row.fingerprint == print
        });
        if let Some(((_, _, twin_id), _)) = twin {
            return PushResult::duplicate(entry.client_id, Some(twin_id.clone()));
        }
    }

    state.next_seq += 1;
    let server_seq = state.next_seq;
    match entry.operation {
        Operation::Create | Operation::Update => {
            state.rows.insert(
                key,
                ServerRow {
                    view_key: entry.view_key.clone(),
                    payload: entry.payload.clone(),
                    fingerprint: fingerprint(&entry.entity_type, &entry.payload),
                    updated_at: entry.enqueued_at,
                    deleted: false,
                    server_seq,
                },
            );
        }
        Operation::Delete => {
            // deleting an unknown entity is still a success
            if let Some(row) = state.rows.get_mut(&key) {
                row.payload = Value::Null;
                row.fingerprint.clear();
                row.updated_at = unix_millis_now();
                row.deleted = true;
                row.server_seq = server_seq;
            }
        }
    }
    state.applied.insert(entry.client_id, entry.entity_id.clone());
    state.apply_order.push(entry.sequence);
    PushResult::success(entry.client_id, entry.entity_id.clone(), server_seq)
}

impl SyncTransport for InMemoryServer {
    async fn push_batch(
        &self,
        user_id: &str,
        request: PushRequest,
    ) -> Result<PushResponse, SyncError> {
        let mut state = self.state.lock().unwrap();
        state.push_batches += 1;
        if state.refuse_pushes > 0 {
            state.refuse_pushes -= 1;
            return Err(SyncError::Network("connection reset by peer".to_string()));
        }
        if state.reject_pushes > 0 {
            state.reject_pushes -= 1;
            let results = request
                .entries
                .iter()
                .map(|entry| {
                    PushResult::error(
                        entry.client_id,
                        RejectionKind::Validation,
                        "payload failed validation",
                    )
                })
                .collect();
            return Ok(PushResponse { results });
        }

        let results = request
            .entries
            .iter()
            .map(|entry| apply_entry(&mut state, user_id, entry))
            .collect();
        if state.drop_next_response {
            state.drop_next_response = false;
            return Err(SyncError::Network("response timed out".to_string()));
        }
        Ok(PushResponse { results })
    }

    async fn check_duplicates(
        &self,
        user_id: &str,
        request: DuplicateCheckRequest,
    ) -> Result<DuplicateCheckResponse, SyncError> {
        let state = self.state.lock().unwrap();
        let results = request
            .probes
            .iter()
            .map(|probe| {
                state.rows.iter().any(|((user, entity_type, _), row)| {
                    user == user_id
                        && *entity_type == probe.entity_type
                        && !row.deleted
                        && row.fingerprint == probe.fingerprint
                })
            })
            .collect();
        Ok(DuplicateCheckResponse { results })
    }

    async fn pull_changes(
        &self,
        user_id: &str,
        cursor: i64,
        limit: usize,
    ) -> Result<PullResponse, SyncError> {
        let state = self.state.lock().unwrap();
        let mut changes: Vec<EntityRecord> = state
            .rows
            .iter()
            .filter(|((user, _, _), row)| user == user_id && row.server_seq > cursor)
            .map(|((user, entity_type, entity_id), row)| EntityRecord {
                user_id: user.clone(),
                entity_type: entity_type.clone(),
                entity_id: entity_id.clone(),
                view_key: row.view_key.clone(),
                payload: row.payload.clone(),
                updated_at: row.updated_at,
                deleted: row.deleted,
                server_seq: row.server_seq,
            })
            .collect();
        changes.sort_by_key(|record| record.server_seq);
        let has_more = changes.len() > limit;
        changes.truncate(limit);
        let cursor = changes.last().map_or(cursor, |record| record.server_seq);
        Ok(PullResponse {
            changes,
            cursor,
            has_more,
        })
    }
}

struct Device {
    manager: SyncManager<InMemoryServer>,
    net: NetworkWatch,
}

fn device(server: &InMemoryServer, user_id: &str) -> Device {
    device_with(server, SyncOptions::new(user_id), true)
}

fn device_with(server: &InMemoryServer, options: SyncOptions, online: bool) -> Device {
    let store = LocalStore::open_in_memory().unwrap();
    let net = NetworkWatch::new(online);
    let manager = SyncManager::new(store, server.clone(), net.clone(), options).unwrap();
    Device { manager, net }
}

fn create(entity_id: &str, name: &str) -> MutationWrite {
    MutationWrite::create("activity", entity_id, VIEW, json!({ "name": name }))
}

fn update(entity_id: &str, name: &str) -> MutationWrite {
    MutationWrite::update("activity", entity_id, VIEW, json!({ "name": name }))
}

#[tokio::test]
async fn create_synced_on_one_device_reaches_another() {
    let server = InMemoryServer::default();
    let phone = device(&server, "u1");
    let laptop = device(&server, "u1");

    phone
        .manager
        .enqueue(create("run-1", "Morning run"))
        .unwrap();
    let report = phone.manager.sync_all().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.applied, 1);

    assert_eq!(laptop.manager.pull_sync().await.unwrap(), 1);
    let view = laptop.manager.merged_view("activity", VIEW).unwrap();
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].record.payload["name"], "Morning run");
    assert!(!view[0].is_offline_data());
}

#[tokio::test]
async fn edits_converge_across_devices() {
    let server = InMemoryServer::default();
    let phone = device(&server, "u1");
    let laptop = device(&server, "u1");

    phone.manager.enqueue(create("run-1", "Run")).unwrap();
    phone.manager.sync_all().await.unwrap();
    laptop.manager.pull_sync().await.unwrap();

    laptop.manager.enqueue(update("run-1", "Long run")).unwrap();
    let report = laptop.manager.sync_all().await.unwrap();
    assert!(report.is_clean());

    phone.manager.pull_sync().await.unwrap();
    let view = phone.manager.merged_view("activity", VIEW).unwrap();
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].record.payload["name"], "Long run");
    assert_eq!(server.live_count("u1"), 1);
}

#[tokio::test]
async fn deletes_propagate_on_pull() {
    let server = InMemoryServer::default();
    let phone = device(&server, "u1");
    let laptop = device(&server, "u1");

    phone.manager.enqueue(create("run-1", "Run")).unwrap();
    phone.manager.sync_all().await.unwrap();
    laptop.manager.pull_sync().await.unwrap();
    assert_eq!(
        laptop.manager.merged_view("activity", VIEW).unwrap().len(),
        1
    );

    phone
        .manager
        .enqueue(MutationWrite::delete("activity", "run-1", VIEW))
        .unwrap();
    phone.manager.sync_all().await.unwrap();

    assert_eq!(laptop.manager.pull_sync().await.unwrap(), 1);
    assert!(laptop
        .manager
        .merged_view("activity", VIEW)
        .unwrap()
        .is_empty());
    let (_, deleted) = server.row("u1", "activity", "run-1").unwrap();
    assert!(deleted);
}

#[tokio::test(start_paused = true)]
async fn offline_work_reaches_the_server_after_reconnect() {
    let server = InMemoryServer::default();
    let phone = device_with(
        &server,
        SyncOptions::new("u1").with_auto_sync_interval(Duration::from_secs(300)),
        false,
    );

    phone.manager.enqueue(create("run-1", "Run")).unwrap();
    phone
        .manager
        .enqueue(update("run-1", "Evening run"))
        .unwrap();
    let report = phone.manager.sync_all().await.unwrap();
    assert!(report.skipped_offline);
    assert_eq!(phone.manager.status().unwrap().pending, 2);
    assert_eq!(server.live_count("u1"), 0);

    phone.manager.start_auto_sync();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(server.live_count("u1"), 0);

    phone.net.set_online(true);
    tokio::time::sleep(Duration::from_millis(10)).await;
    phone.manager.stop_auto_sync();

    assert!(phone.manager.status().unwrap().is_idle());
    let (payload, deleted) = server.row("u1", "activity", "run-1").unwrap();
    assert!(!deleted);
    assert_eq!(payload["name"], "Evening run");

    let laptop = device(&server, "u1");
    assert_eq!(laptop.manager.pull_sync().await.unwrap(), 1);
}

#[tokio::test]
async fn transient_outage_heals_without_losing_writes() {
    let server = InMemoryServer::default();
    let phone = device(&server, "u1");
    server.refuse_next_pushes(2);

    phone.manager.enqueue(create("run-1", "Run")).unwrap();

    let first = phone.manager.sync_all().await.unwrap();
    assert_eq!(first.retrying, 1);
    let second = phone.manager.sync_all().await.unwrap();
    assert_eq!(second.retrying, 1);

    let third = phone.manager.sync_all().await.unwrap();
    assert!(third.is_clean());
    assert_eq!(third.applied, 1);
    assert_eq!(server.push_batches(), 3);
    assert_eq!(server.live_count("u1"), 1);
    assert!(phone.manager.status().unwrap().is_idle());
}

#[tokio::test]
async fn lost_response_resolves_as_duplicate_on_retry() {
    let server = InMemoryServer::default();
    let phone = device(&server, "u1");

    phone.manager.enqueue(create("run-1", "Run")).unwrap();
    phone.manager.sync_all().await.unwrap();

    phone.manager.enqueue(update("run-1", "Long run")).unwrap();
    server.drop_next_response();
    let first = phone.manager.sync_all().await.unwrap();
    assert_eq!(first.retrying, 1);
    // the server applied the write even though the device never heard back
    let (payload, _) = server.row("u1", "activity", "run-1").unwrap();
    assert_eq!(payload["name"], "Long run");

    let second = phone.manager.sync_all().await.unwrap();
    assert!(second.is_clean());
    assert_eq!(second.duplicates, 1);
    assert_eq!(server.live_count("u1"), 1);
    assert!(phone.manager.status().unwrap().is_idle());
}

#[tokio::test]
async fn server_applies_one_entitys_writes_in_enqueue_order() {
    let server = InMemoryServer::default();
    let phone = device(&server, "u1");

    phone.manager.enqueue(create("run-1", "Run")).unwrap();
    phone
        .manager
        .enqueue(update("run-1", "Second draft"))
        .unwrap();
    phone.manager.enqueue(create("swim-1", "Swim")).unwrap();
    phone.manager.enqueue(update("run-1", "Final")).unwrap();

    let report = phone.manager.sync_all().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.applied, 4);

    let order = server.apply_order();
    assert_eq!(order.len(), 4);
    assert!(order.windows(2).all(|pair| pair[0] < pair[1]));
    let (payload, _) = server.row("u1", "activity", "run-1").unwrap();
    assert_eq!(payload["name"], "Final");
}

#[tokio::test]
async fn matching_content_on_another_device_collapses_to_one_entity() {
    let server = InMemoryServer::default();
    let phone = device(&server, "u1");
    let laptop = device(&server, "u1");

    phone.manager.enqueue(create("walk-phone", "Walk")).unwrap();
    phone.manager.sync_all().await.unwrap();

    laptop
        .manager
        .enqueue(create("walk-laptop", "Walk"))
        .unwrap();
    let report = laptop.manager.sync_all().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.duplicates, 1);
    assert_eq!(report.applied, 0);
    assert_eq!(server.live_count("u1"), 1);

    laptop.manager.pull_sync().await.unwrap();
    let view = laptop.manager.merged_view("activity", VIEW).unwrap();
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].record.entity_id, "walk-phone");
}

#[tokio::test]
async fn content_matching_a_deleted_entity_is_not_flagged() {
    let server = InMemoryServer::default();
    let phone = device(&server, "u1");

    phone.manager.enqueue(create("run-1", "Run")).unwrap();
    phone.manager.sync_all().await.unwrap();
    phone
        .manager
        .enqueue(MutationWrite::delete("activity", "run-1", VIEW))
        .unwrap();
    phone.manager.sync_all().await.unwrap();

    phone.manager.enqueue(create("run-2", "Run")).unwrap();
    let report = phone.manager.sync_all().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.applied, 1);
    assert_eq!(server.live_count("u1"), 1);
}

#[tokio::test]
async fn rejected_entry_can_be_retried_after_the_server_relents() {
    let server = InMemoryServer::default();
    let phone = device(&server, "u1");
    server.reject_next_pushes(1);

    let client_id = phone.manager.enqueue(create("run-1", "Run")).unwrap();

    let first = phone.manager.sync_all().await.unwrap();
    assert_eq!(first.rejected, 1);
    assert_eq!(phone.manager.status().unwrap().failed, 1);

    // parked: a plain run leaves it alone
    let second = phone.manager.sync_all().await.unwrap();
    assert!(second.outcomes.is_empty());

    phone.manager.retry_failed(&client_id).unwrap();
    let third = phone.manager.sync_all().await.unwrap();
    assert_eq!(third.applied, 1);
    assert_eq!(server.live_count("u1"), 1);
}

#[tokio::test]
async fn pull_pages_until_the_backlog_is_drained() {
    let server = InMemoryServer::default();
    let phone = device(&server, "u1");
    for n in 0..7 {
        let name = format!("Activity {n}");
        let id = format!("act-{n}");
        phone.manager.enqueue(create(&id, &name)).unwrap();
    }
    phone.manager.sync_all().await.unwrap();

    let laptop = device_with(&server, SyncOptions::new("u1").with_pull_page_limit(3), true);
    assert_eq!(laptop.manager.pull_sync().await.unwrap(), 7);
    assert_eq!(
        laptop.manager.merged_view("activity", VIEW).unwrap().len(),
        7
    );
}
