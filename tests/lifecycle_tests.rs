/// Lifecycle manager integration tests
///
/// Exercises creation, deletion races, expiry and restart reconciliation
/// against the in-memory runtime.
/// Run with: cargo test --test lifecycle_tests

use chrono::{Duration as ChronoDuration, SubsecRound, Utc};
use ephemera::ports::{PortAllocator, PortRange};
use ephemera::record::{ContainerRecord, ContainerState};
use ephemera::runtime::memory::{InMemoryRuntime, RuntimeOp};
use ephemera::runtime::{ContainerRuntime, ContainerStatus, ContainerTemplate};
use ephemera::store::{RecordStore, SqliteRecordStore};
use ephemera::{DeleteOutcome, DeleteReason, Error, LifecycleConfig, LifecycleManager};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn test_config() -> LifecycleConfig {
    LifecycleConfig {
        runtime_timeout: Duration::from_secs(2),
        expiry_backoff: Duration::from_millis(10),
        ..LifecycleConfig::default()
    }
}

fn build(
    store: Arc<dyn RecordStore>,
    runtime: Arc<InMemoryRuntime>,
    range: PortRange,
) -> Arc<LifecycleManager> {
    LifecycleManager::new(
        store,
        runtime,
        PortAllocator::new(range, 2048),
        ContainerTemplate::default(),
        test_config(),
    )
}

fn setup() -> (Arc<LifecycleManager>, Arc<InMemoryRuntime>) {
    let runtime = Arc::new(InMemoryRuntime::new());
    let store = Arc::new(SqliteRecordStore::open_in_memory().unwrap());
    let manager = build(store, runtime.clone(), PortRange::new(31000, 31999).unwrap());
    (manager, runtime)
}

#[tokio::test]
async fn test_create_returns_running_record() {
    let (manager, runtime) = setup();

    let record = manager
        .create_container(Duration::from_secs(300), 2)
        .await
        .unwrap();

    assert_eq!(record.state, ContainerState::Running);
    assert_eq!(record.ports.len(), 2);
    assert_ne!(record.ports[0], record.ports[1]);
    assert!(record.ports.iter().all(|p| (31000..=31999).contains(p)));
    assert_eq!(record.expires_at - record.created_at, ChronoDuration::seconds(300));

    assert_eq!(manager.get(&record.id).unwrap(), record);
    assert_eq!(runtime.status(&record.id), ContainerStatus::Running);
    assert_eq!(manager.pending_expiries(), vec![record.id.clone()]);

    let spec = runtime.spec(&record.id).unwrap();
    assert_eq!(spec.host_ports(), record.ports);
}

#[tokio::test]
async fn test_concurrent_creates_get_disjoint_ports() {
    let (manager, _runtime) = setup();

    let mut handles = vec![];
    for _ in 0..20 {
        let manager = Arc::clone(&manager);
        handles.push(tokio::spawn(async move {
            manager.create_container(Duration::from_secs(300), 2).await
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        let record = handle.await.unwrap().unwrap();
        for port in record.ports {
            assert!(seen.insert(port), "port {} assigned twice", port);
        }
    }
    assert_eq!(seen.len(), 40);
    assert_eq!(manager.list_active().unwrap().len(), 20);
}

#[tokio::test]
async fn test_start_failure_removes_container_and_persists_nothing() {
    let (manager, runtime) = setup();
    runtime.fail_next(RuntimeOp::Start, 1);

    let err = manager
        .create_container(Duration::from_secs(60), 2)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Runtime { op: "start", .. }));
    assert_eq!(runtime.container_count(), 0);
    assert!(manager.list_active().unwrap().is_empty());
    assert!(manager.pending_expiries().is_empty());
    assert_eq!(manager.allocator().reserved_count(), 0);

    let removes = runtime
        .calls()
        .into_iter()
        .filter(|c| c.op == RuntimeOp::Remove)
        .count();
    assert_eq!(removes, 1);
}

#[tokio::test(start_paused = true)]
async fn test_start_timeout_is_compensated() {
    let (manager, runtime) = setup();
    runtime.set_latency(RuntimeOp::Start, Duration::from_secs(30));

    let err = manager
        .create_container(Duration::from_secs(60), 1)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::RuntimeTimeout { op: "start", .. }));
    assert_eq!(runtime.container_count(), 0);
    assert!(manager.list_active().unwrap().is_empty());
    assert_eq!(manager.allocator().reserved_count(), 0);
}

struct RejectingInserts(SqliteRecordStore);

impl RecordStore for RejectingInserts {
    fn insert(&self, _record: &ContainerRecord) -> ephemera::Result<()> {
        Err(Error::Store("disk full".into()))
    }
    fn get(&self, id: &str) -> ephemera::Result<Option<ContainerRecord>> {
        self.0.get(id)
    }
    fn list_active(&self) -> ephemera::Result<Vec<ContainerRecord>> {
        self.0.list_active()
    }
    fn compare_and_set_state(
        &self,
        id: &str,
        expected: ContainerState,
        new: ContainerState,
    ) -> ephemera::Result<bool> {
        self.0.compare_and_set_state(id, expected, new)
    }
    fn delete(&self, id: &str) -> ephemera::Result<bool> {
        self.0.delete(id)
    }
}

#[tokio::test]
async fn test_store_failure_tears_down_started_container() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let store = Arc::new(RejectingInserts(SqliteRecordStore::open_in_memory().unwrap()));
    let manager = build(store, runtime.clone(), PortRange::new(32000, 32999).unwrap());

    let err = manager
        .create_container(Duration::from_secs(60), 2)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Store(_)));
    assert_eq!(runtime.container_count(), 0);
    assert_eq!(manager.allocator().reserved_count(), 0);
}

struct FailingDeleteOnce {
    inner: SqliteRecordStore,
    failed: AtomicBool,
}

impl RecordStore for FailingDeleteOnce {
    fn insert(&self, record: &ContainerRecord) -> ephemera::Result<()> {
        self.inner.insert(record)
    }
    fn get(&self, id: &str) -> ephemera::Result<Option<ContainerRecord>> {
        self.inner.get(id)
    }
    fn list_active(&self) -> ephemera::Result<Vec<ContainerRecord>> {
        self.inner.list_active()
    }
    fn compare_and_set_state(
        &self,
        id: &str,
        expected: ContainerState,
        new: ContainerState,
    ) -> ephemera::Result<bool> {
        self.inner.compare_and_set_state(id, expected, new)
    }
    fn delete(&self, id: &str) -> ephemera::Result<bool> {
        if !self.failed.swap(true, Ordering::SeqCst) {
            return Err(Error::Store("disk full".into()));
        }
        self.inner.delete(id)
    }
}

#[tokio::test]
async fn test_record_delete_failure_is_reclaimed_by_sweep() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let store = Arc::new(FailingDeleteOnce {
        inner: SqliteRecordStore::open_in_memory().unwrap(),
        failed: AtomicBool::new(false),
    });
    let manager = build(store, runtime.clone(), PortRange::new(36000, 36999).unwrap());
    let record = manager
        .create_container(Duration::from_secs(300), 2)
        .await
        .unwrap();

    let err = manager
        .delete_container(&record.id, DeleteReason::Manual)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Store(_)));

    // Container is gone but the record is handed back as reclaim-pending.
    assert_eq!(runtime.status(&record.id), ContainerStatus::Missing);
    assert_eq!(manager.get(&record.id).unwrap().state, ContainerState::Expiring);
    assert!(record.ports.iter().all(|p| manager.allocator().is_reserved(*p)));

    let sweep = manager.sweep().await.unwrap();
    assert_eq!(sweep.retried, 1);
    assert_eq!(sweep.reclaimed, 1);
    assert!(manager.list_active().unwrap().is_empty());
    assert!(manager.pending_expiries().is_empty());
    assert_eq!(manager.allocator().reserved_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_delete_still_completes() {
    let (manager, runtime) = setup();
    let record = manager
        .create_container(Duration::from_secs(300), 2)
        .await
        .unwrap();
    runtime.set_latency(RuntimeOp::Stop, Duration::from_millis(800));

    let abandoned = tokio::time::timeout(
        Duration::from_millis(200),
        manager.delete_container(&record.id, DeleteReason::Manual),
    )
    .await;
    assert!(abandoned.is_err());

    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(manager.list_active().unwrap().is_empty());
    assert_eq!(runtime.status(&record.id), ContainerStatus::Missing);
    assert_eq!(manager.allocator().reserved_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_create_still_records_container() {
    let (manager, runtime) = setup();
    runtime.set_latency(RuntimeOp::Start, Duration::from_millis(800));

    let abandoned = tokio::time::timeout(
        Duration::from_millis(200),
        manager.create_container(Duration::from_secs(300), 2),
    )
    .await;
    assert!(abandoned.is_err());

    tokio::time::sleep(Duration::from_secs(2)).await;

    let records = manager.list_active().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(runtime.container_count(), 1);
    assert_eq!(runtime.status(&records[0].id), ContainerStatus::Running);
    assert_eq!(manager.allocator().reserved_count(), 2);
    assert!(records[0]
        .ports
        .iter()
        .all(|p| manager.allocator().is_reserved(*p)));
    assert_eq!(manager.pending_expiries(), vec![records[0].id.clone()]);
}

#[tokio::test]
async fn test_allocation_exhausted_never_reaches_runtime() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let store = Arc::new(SqliteRecordStore::open_in_memory().unwrap());
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let manager = build(store, runtime.clone(), PortRange::new(port, port).unwrap());

    let err = manager
        .create_container(Duration::from_secs(60), 2)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::AllocationExhausted { requested: 2, .. }));
    assert!(runtime.calls().is_empty());
    assert_eq!(manager.allocator().reserved_count(), 0);
}

#[tokio::test]
async fn test_manual_delete_removes_everything() {
    let (manager, runtime) = setup();
    let record = manager
        .create_container(Duration::from_secs(300), 2)
        .await
        .unwrap();

    let outcome = manager
        .delete_container(&record.id, DeleteReason::Manual)
        .await
        .unwrap();

    assert_eq!(outcome, DeleteOutcome::Deleted);
    assert!(manager.list_active().unwrap().is_empty());
    assert!(manager.pending_expiries().is_empty());
    assert_eq!(runtime.status(&record.id), ContainerStatus::Missing);
    assert_eq!(manager.allocator().reserved_count(), 0);

    let err = manager
        .delete_container(&record.id, DeleteReason::Manual)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_manual_delete_racing_expiry_tears_down_once() {
    let (manager, runtime) = setup();
    let record = manager
        .create_container(Duration::from_secs(300), 2)
        .await
        .unwrap();
    // Keep the winner inside its teardown while the loser arrives.
    runtime.set_latency(RuntimeOp::Stop, Duration::from_millis(100));

    let manual = {
        let manager = Arc::clone(&manager);
        let id = record.id.clone();
        tokio::spawn(async move { manager.delete_container(&id, DeleteReason::Manual).await })
    };
    let expiry = {
        let manager = Arc::clone(&manager);
        let id = record.id.clone();
        tokio::spawn(async move { manager.expire(&id).await })
    };

    let outcomes = [
        manual.await.unwrap().unwrap(),
        expiry.await.unwrap().unwrap(),
    ];
    let deleted = outcomes
        .iter()
        .filter(|o| **o == DeleteOutcome::Deleted)
        .count();
    assert_eq!(deleted, 1);
    assert_eq!(runtime.call_count(RuntimeOp::Stop, &record.id), 1);
    assert_eq!(runtime.call_count(RuntimeOp::Remove, &record.id), 1);
    assert!(manager.list_active().unwrap().is_empty());
}

#[tokio::test]
async fn test_many_concurrent_deletes_execute_one_teardown() {
    let (manager, runtime) = setup();
    let record = manager
        .create_container(Duration::from_secs(300), 1)
        .await
        .unwrap();
    runtime.set_latency(RuntimeOp::Remove, Duration::from_millis(50));

    let mut handles = vec![];
    for _ in 0..10 {
        let manager = Arc::clone(&manager);
        let id = record.id.clone();
        handles.push(tokio::spawn(async move {
            manager.delete_container(&id, DeleteReason::Manual).await
        }));
    }

    let mut deleted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(DeleteOutcome::Deleted) => deleted += 1,
            Ok(DeleteOutcome::NoOp) | Err(Error::NotFound(_)) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(deleted, 1);
    assert_eq!(runtime.call_count(RuntimeOp::Remove, &record.id), 1);
}

#[tokio::test(start_paused = true)]
async fn test_short_ttl_container_is_reclaimed() {
    let (manager, runtime) = setup();
    let record = manager
        .create_container(Duration::from_secs(1), 2)
        .await
        .unwrap();
    assert_ne!(record.ports[0], record.ports[1]);

    tokio::time::sleep(Duration::from_millis(1500)).await;

    let active = manager.list_active().unwrap();
    assert!(active.iter().all(|r| r.id != record.id));
    assert_eq!(runtime.status(&record.id), ContainerStatus::Missing);
    assert_eq!(
        runtime.inspect(&record.id).await.unwrap(),
        ContainerStatus::Missing
    );
}

#[tokio::test(start_paused = true)]
async fn test_expiry_retries_then_recovers() {
    let (manager, runtime) = setup();
    let record = manager
        .create_container(Duration::from_secs(1), 1)
        .await
        .unwrap();
    runtime.fail_next(RuntimeOp::Remove, 2);

    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(manager.list_active().unwrap().is_empty());
    assert_eq!(runtime.call_count(RuntimeOp::Remove, &record.id), 3);
}

#[tokio::test(start_paused = true)]
async fn test_expiry_failure_leaves_record_expiring() {
    let (manager, runtime) = setup();
    let record = manager
        .create_container(Duration::from_secs(1), 1)
        .await
        .unwrap();
    runtime.fail_next(RuntimeOp::Remove, 100);

    tokio::time::sleep(Duration::from_secs(10)).await;

    let stuck = manager.get(&record.id).unwrap();
    assert_eq!(stuck.state, ContainerState::Expiring);
    assert_eq!(runtime.call_count(RuntimeOp::Remove, &record.id), 5);
}

fn seed_record(
    store: &SqliteRecordStore,
    id: &str,
    age: ChronoDuration,
    ttl: ChronoDuration,
    ports: Vec<u16>,
) -> ContainerRecord {
    let created_at = Utc::now().trunc_subsecs(3) - age;
    let record = ContainerRecord::running(id, created_at, ttl, ports);
    store.insert(&record).unwrap();
    record
}

async fn start_container(runtime: &InMemoryRuntime, ports: &[u16]) -> String {
    let spec = ContainerTemplate::default().spec_for(ports).unwrap();
    let id = runtime.create(&spec).await.unwrap();
    runtime.start(&id).await.unwrap();
    id
}

#[tokio::test]
async fn test_reconcile_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("containers.db");
    let runtime = Arc::new(InMemoryRuntime::new());

    let expired_id = start_container(&runtime, &[33001, 33002]).await;
    let live_id = start_container(&runtime, &[33003, 33004]).await;
    let interrupted_id = start_container(&runtime, &[33005]).await;
    let orphan_id = start_container(&runtime, &[33006]).await;

    {
        let store = SqliteRecordStore::open(&db).unwrap();
        seed_record(
            &store,
            &expired_id,
            ChronoDuration::hours(5),
            ChronoDuration::hours(4),
            vec![33001, 33002],
        );
        seed_record(
            &store,
            &live_id,
            ChronoDuration::hours(1),
            ChronoDuration::hours(2),
            vec![33003, 33004],
        );
        seed_record(
            &store,
            &interrupted_id,
            ChronoDuration::minutes(1),
            ChronoDuration::hours(4),
            vec![33005],
        );
        store
            .compare_and_set_state(&interrupted_id, ContainerState::Running, ContainerState::Deleting)
            .unwrap();
        // Record whose container no longer exists.
        seed_record(
            &store,
            "vanished",
            ChronoDuration::minutes(1),
            ChronoDuration::hours(4),
            vec![33007],
        );
    }

    // Fresh process: reopen the store and reconcile.
    let store = Arc::new(SqliteRecordStore::open(&db).unwrap());
    let manager = build(store, runtime.clone(), PortRange::new(33000, 33999).unwrap());
    let report = manager.reconcile().await.unwrap();

    assert_eq!(report.expired, 2);
    assert_eq!(report.rescheduled, 1);
    assert_eq!(report.vanished, 1);
    assert_eq!(report.orphans_removed, 1);
    assert_eq!(report.failed, 0);

    let active: Vec<String> = manager
        .list_active()
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(active, vec![live_id.clone()]);

    assert_eq!(runtime.status(&expired_id), ContainerStatus::Missing);
    assert_eq!(runtime.status(&interrupted_id), ContainerStatus::Missing);
    assert_eq!(runtime.status(&orphan_id), ContainerStatus::Missing);
    assert_eq!(runtime.status(&live_id), ContainerStatus::Running);

    // Remaining delay is roughly one hour, not a fresh TTL.
    assert_eq!(manager.pending_expiries(), vec![live_id.clone()]);
    let remaining = manager
        .scheduled_deadline(&live_id)
        .unwrap()
        .saturating_duration_since(tokio::time::Instant::now());
    assert!(remaining <= Duration::from_secs(3600));
    assert!(remaining > Duration::from_secs(3590));

    assert!(manager.allocator().is_reserved(33003));
    assert!(manager.allocator().is_reserved(33004));
    assert!(!manager.allocator().is_reserved(33001));
    assert!(!manager.allocator().is_reserved(33007));
}

#[tokio::test]
async fn test_reconcile_failure_leaves_record_for_sweeper() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let store = Arc::new(SqliteRecordStore::open_in_memory().unwrap());
    let id = start_container(&runtime, &[34001]).await;
    seed_record(
        &store,
        &id,
        ChronoDuration::hours(2),
        ChronoDuration::hours(1),
        vec![34001],
    );
    let manager = build(store, runtime.clone(), PortRange::new(34000, 34999).unwrap());

    runtime.fail_next(RuntimeOp::Remove, 1);
    let report = manager.reconcile().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(manager.get(&id).unwrap().state, ContainerState::Expiring);

    let sweep = manager.sweep().await.unwrap();
    assert_eq!(sweep.reclaimed, 1);
    assert!(manager.list_active().unwrap().is_empty());
}

#[tokio::test]
async fn test_shutdown_cancels_timers_but_keeps_records() {
    let (manager, runtime) = setup();
    let record = manager
        .create_container(Duration::from_secs(300), 1)
        .await
        .unwrap();

    manager.shutdown();

    assert!(manager.pending_expiries().is_empty());
    assert_eq!(manager.list_active().unwrap(), vec![record.clone()]);
    assert_eq!(runtime.status(&record.id), ContainerStatus::Running);
}
