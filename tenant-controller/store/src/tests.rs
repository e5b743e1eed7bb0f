use super::*;
use pretty_assertions::assert_eq;
use tenant_controller_core::{
    function::{FunctionDetails, RequestType},
    tenant::INITIAL_AUDIT,
    FunctionEvent, FunctionMeta, TenantPlan, TenantStatus, ValidationError,
};
use bytes::Bytes;
use std::sync::Arc;
use tenant_controller_log::{
    memory::{Broker, MemoryProducer},
    Client, MessageId, Producer, TransportError,
};
use tokio::{sync::Notify, time};

const TENANTS: &str = "persistent://public/default/tenants-management";
const FUNCTIONS: &str = "persistent://public/functions/metadata";

fn tenant_store() -> SharedStore<TenantPlan> {
    Store::shared("tenants", KindMetrics::default())
}

async fn writer(
    broker: &Broker,
    store: SharedStore<TenantPlan>,
) -> Writer<MemoryProducer, TenantPlan> {
    let producer = broker.producer(TENANTS).await.unwrap();
    Writer::new(producer, store, time::Duration::from_secs(5))
}

fn request(plan_type: &str, topics: i32, audit: &str) -> TenantPlan {
    let mut plan = TenantPlan {
        plan_type: plan_type.to_string(),
        audit: audit.to_string(),
        ..Default::default()
    };
    plan.policy.num_of_topics = topics;
    plan
}

fn sorted(mut plans: Vec<TenantPlan>) -> Vec<TenantPlan> {
    plans.sort_by(|a, b| a.name.cmp(&b.name));
    plans
}

fn spawn_consumer(broker: &Broker, store: SharedStore<TenantPlan>) -> tokio::task::JoinHandle<()> {
    let consumer = Consumer::<_, TenantPlan>::new(broker.clone(), TENANTS, store);
    tokio::spawn(async move {
        let _ = consumer.run().await;
    })
}

/// Waits until the store has processed `n` entries, whether or not they were stale.
async fn applied(store: &SharedStore<TenantPlan>, n: u64) {
    eventually(|| {
        let metrics = store.metrics();
        metrics.applies.get() + metrics.deletes.get() + metrics.stale.get() >= n
    })
    .await
}

/// A producer whose acknowledgements are held until released, after the entry is appended.
struct HeldAcks {
    inner: MemoryProducer,
    release: Arc<Notify>,
}

#[async_trait::async_trait]
impl Producer for HeldAcks {
    async fn send(&self, key: &str, payload: Bytes) -> Result<MessageId, TransportError> {
        let id = self.inner.send(key, payload).await?;
        self.release.notified().await;
        Ok(id)
    }
}

async fn eventually(mut f: impl FnMut() -> bool) {
    time::timeout(time::Duration::from_secs(5), async {
        while !f() {
            time::sleep(time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition must be met in time");
}

#[tokio::test]
async fn writer_reads_its_own_writes() {
    let broker = Broker::new();
    let store = tenant_store();
    let writer = writer(&broker, store.clone()).await;

    // No consumer is running: the store only sees the writer's eager update.
    let written = writer.write("acme", request("free", 10, "")).await.unwrap();
    assert_eq!(store.get("acme"), Some(written.clone()));
    assert_eq!(written.name, "acme");
    assert_eq!(written.tenant_status, TenantStatus::Activated);

    let entries = broker.entries(TENANTS);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].key, "acme");
    assert_eq!(
        serde_json::from_slice::<TenantPlan>(&entries[0].payload).unwrap(),
        written
    );
}

#[tokio::test]
async fn request_body_cannot_rename_a_tenant() {
    let broker = Broker::new();
    let store = tenant_store();
    let writer = writer(&broker, store.clone()).await;

    let mut req = request("free", 0, "");
    req.name = "other".to_string();
    let written = writer.write("acme", req).await.unwrap();
    assert_eq!(written.name, "acme");
    assert_eq!(store.get("other"), None);
}

#[tokio::test]
async fn replay_reproduces_the_writers_view() {
    let broker = Broker::new();
    let writer = writer(&broker, tenant_store()).await;

    writer.write("acme", request("free", 10, "")).await.unwrap();
    let updated = writer.write("acme", request("free", 0, "bump")).await.unwrap();
    assert_eq!(updated.tenant_status, TenantStatus::Activated);
    assert_eq!(updated.policy.num_of_topics, 10);
    assert_eq!(updated.audit, "initial creation,,bump");

    let replayed = tenant_store();
    let consumer = spawn_consumer(&broker, replayed.clone());
    applied(&replayed, 2).await;
    consumer.abort();

    assert_eq!(replayed.list(), vec![updated]);
}

#[tokio::test]
async fn replay_is_idempotent() {
    let broker = Broker::new();
    let writer = writer(&broker, tenant_store()).await;
    writer.write("a", request("free", 1, "")).await.unwrap();
    writer.write("b", request("starter", 2, "")).await.unwrap();
    writer.write("a", request("free", 3, "raise")).await.unwrap();
    writer.delete("b").await.unwrap();
    writer.write("c", request("private", 0, "")).await.unwrap();
    let entries = broker.entries(TENANTS).len() as u64;

    let once = tenant_store();
    let consumer = spawn_consumer(&broker, once.clone());
    applied(&once, entries).await;
    consumer.abort();

    // Replaying the same history over a store that has already applied it changes nothing.
    let twice = tenant_store();
    for round in 1..=2 {
        let consumer = spawn_consumer(&broker, twice.clone());
        applied(&twice, entries * round).await;
        consumer.abort();
        let _ = consumer.await;
    }

    assert_eq!(sorted(twice.list()), sorted(once.list()));
    assert_eq!(sorted(once.list()), sorted(writer.store().list()));
}

#[tokio::test]
async fn delete_appends_a_tombstone() {
    let broker = Broker::new();
    let store = tenant_store();
    let writer = writer(&broker, store.clone()).await;
    writer.write("acme", request("free", 0, "")).await.unwrap();

    let tombstone = writer.delete("acme").await.unwrap();
    assert_eq!(tombstone.tenant_status, TenantStatus::Deleted);
    assert_eq!(tombstone.audit, format!("{INITIAL_AUDIT},deleted"));
    assert_eq!(store.get("acme"), None);

    let entries = broker.entries(TENANTS);
    assert_eq!(entries.len(), 2);
    let last = serde_json::from_slice::<TenantPlan>(&entries[1].payload).unwrap();
    assert_eq!(last.tenant_status, TenantStatus::Deleted);

    let replayed = tenant_store();
    let consumer = spawn_consumer(&broker, replayed.clone());
    applied(&replayed, 2).await;
    consumer.abort();
    assert!(replayed.is_empty());
}

#[tokio::test]
async fn deleting_an_unknown_tenant_appends_nothing() {
    let broker = Broker::new();
    let writer = writer(&broker, tenant_store()).await;
    assert!(matches!(
        writer.delete("ghost").await,
        Err(WriteError::NotFound(key)) if key == "ghost"
    ));
    assert!(broker.entries(TENANTS).is_empty());
}

#[tokio::test]
async fn invalid_requests_are_rejected_without_io() {
    let broker = Broker::new();
    let store = tenant_store();
    let writer = writer(&broker, store.clone()).await;

    let res = writer.write("acme", request("gold", 10, "")).await;
    assert!(matches!(
        res,
        Err(WriteError::Validation(ValidationError::UnknownPlan(_)))
    ));
    assert!(broker.entries(TENANTS).is_empty());
    assert!(store.is_empty());
    assert_eq!(store.metrics().write_failures.get(), 1);
}

#[tokio::test]
async fn failed_appends_leave_the_store_untouched() {
    let broker = Broker::new();
    let store = tenant_store();
    let writer = writer(&broker, store.clone()).await;
    let original = writer.write("acme", request("free", 10, "")).await.unwrap();

    broker.reject_sends(true);
    let res = writer.write("acme", request("free", 20, "")).await;
    assert!(matches!(
        res,
        Err(WriteError::Transport(TransportError::Rejected(_)))
    ));
    assert!(writer.delete("acme").await.is_err());
    assert_eq!(store.get("acme"), Some(original));
    assert_eq!(broker.entries(TENANTS).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_appends_time_out() {
    let broker = Broker::new();
    let store = tenant_store();
    let producer = broker.producer(TENANTS).await.unwrap();
    let writer = Writer::new(producer, store.clone(), time::Duration::from_secs(1));

    broker.set_send_latency(time::Duration::from_secs(10));
    let res = writer.write("acme", request("free", 10, "")).await;
    assert!(matches!(res, Err(WriteError::Timeout(t)) if t == time::Duration::from_secs(1)));
    assert!(store.is_empty());
    assert!(broker.entries(TENANTS).is_empty());
}

#[tokio::test]
async fn undecodable_entries_stop_the_consumer() {
    let broker = Broker::new();
    let store = tenant_store();
    let first = serde_json::to_vec(&TenantPlan {
        name: "a".to_string(),
        tenant_status: TenantStatus::Activated,
        ..Default::default()
    })
    .unwrap();
    broker.append(TENANTS, "a", first);
    broker.append(TENANTS, "b", "not json");
    broker.append(TENANTS, "c", r#"{"name":"c","tenantStatus":"activated"}"#);

    let consumer = Consumer::<_, TenantPlan>::new(broker.clone(), TENANTS, store.clone());
    let error = consumer.run().await.unwrap_err();
    assert!(matches!(
        error,
        ConsumeError::Decode { id: MessageId(1), ref key, .. } if key == "b"
    ));

    // The entry following the poisoned one is not applied.
    assert!(store.get("a").is_some());
    assert_eq!(store.get("c"), None);
}

#[tokio::test]
async fn watchdog_resumes_consumption_after_disconnect() {
    let broker = Broker::new();
    let store = tenant_store();
    let backoff = Backoff {
        min: time::Duration::from_millis(10),
        ..Default::default()
    };
    let watchdog = Watchdog::new("tenants", backoff, store.metrics());
    let mut state = watchdog.state();

    let (signal, drain) = drain::channel();
    let consumer = Consumer::<_, TenantPlan>::new(broker.clone(), TENANTS, store.clone());
    let supervisor = tokio::spawn(watchdog.supervise(move || consumer.clone().run(), drain));

    // Another instance writes to the topic.
    let other = writer(&broker, tenant_store()).await;
    other.write("a", request("free", 1, "")).await.unwrap();
    eventually(|| store.get("a").is_some()).await;

    broker.disconnect_readers(TENANTS);
    state
        .wait_for(|s| *s == State::Running { generation: 2 })
        .await
        .unwrap();
    assert_eq!(store.metrics().restarts(), 1);

    other.write("b", request("free", 1, "")).await.unwrap();
    eventually(|| store.get("b").is_some()).await;
    assert_eq!(store.len(), 2);

    signal.drain().await;
    supervisor.await.unwrap();
    assert_eq!(*state.borrow(), State::Stopped);
}

#[tokio::test]
async fn watchdog_rides_out_a_broker_outage() {
    let broker = Broker::new();
    let store = tenant_store();
    let backoff = Backoff {
        min: time::Duration::from_millis(5),
        max: time::Duration::from_millis(20),
        ..Default::default()
    };
    let watchdog = Watchdog::new("tenants", backoff, store.metrics());
    let (_signal, drain) = drain::channel();
    let consumer = Consumer::<_, TenantPlan>::new(broker.clone(), TENANTS, store.clone());
    tokio::spawn(watchdog.supervise(move || consumer.clone().run(), drain));

    broker.set_available(false);
    eventually(|| store.metrics().restarts() >= 3).await;

    broker.append(TENANTS, "a", r#"{"name":"a","tenantStatus":"activated"}"#);
    broker.set_available(true);
    eventually(|| store.get("a").is_some()).await;
}

#[tokio::test]
async fn writes_propagate_between_instances() {
    let broker = Broker::new();
    let (store_a, store_b) = (tenant_store(), tenant_store());
    let writer_a = writer(&broker, store_a.clone()).await;
    let writer_b = writer(&broker, store_b.clone()).await;
    let consumers = [
        spawn_consumer(&broker, store_a.clone()),
        spawn_consumer(&broker, store_b.clone()),
    ];

    let created = writer_a.write("acme", request("starter", 0, "")).await.unwrap();
    eventually(|| store_b.get("acme") == Some(created.clone())).await;

    // Instance B reconciles against the version it learned from the log.
    let updated = writer_b.write("acme", request("starter", 0, "b")).await.unwrap();
    assert_eq!(updated.audit, "initial creation,,b");
    eventually(|| store_a.get("acme") == Some(updated.clone())).await;

    writer_a.delete("acme").await.unwrap();
    eventually(|| store_b.get("acme").is_none()).await;

    for consumer in consumers {
        consumer.abort();
    }
}

#[tokio::test]
async fn late_acknowledgements_do_not_roll_back_the_store() {
    let broker = Broker::new();
    let store = tenant_store();
    let consumer = spawn_consumer(&broker, store.clone());

    let release = Arc::new(Notify::new());
    let held = Writer::new(
        HeldAcks {
            inner: broker.producer(TENANTS).await.unwrap(),
            release: release.clone(),
        },
        store.clone(),
        time::Duration::from_secs(5),
    );
    let held = tokio::spawn(async move { held.write("acme", request("free", 2, "a")).await });
    eventually(|| store.get("acme").map(|p| p.policy.num_of_topics) == Some(2)).await;

    // Another instance writes the same tenant while the first write is still unacknowledged.
    let other = writer(&broker, tenant_store()).await;
    let newer = other.write("acme", request("free", 3, "b")).await.unwrap();
    eventually(|| store.get("acme") == Some(newer.clone())).await;

    release.notify_one();
    let older = held.await.unwrap().unwrap();
    assert_eq!(older.policy.num_of_topics, 2);

    let entries = broker.entries(TENANTS);
    let last = serde_json::from_slice::<TenantPlan>(&entries[entries.len() - 1].payload).unwrap();
    assert_eq!(last, newer);
    assert_eq!(store.get("acme"), Some(last));
    assert_eq!(store.metrics().stale.get(), 1);
    consumer.abort();
}

#[tokio::test]
async fn concurrent_writes_to_a_tenant_are_serialized() {
    let broker = Broker::new();
    let store = tenant_store();
    let writer = writer(&broker, store.clone()).await;
    writer.write("acme", request("free", 1, "")).await.unwrap();

    broker.set_send_latency(time::Duration::from_millis(20));
    let (x, y) = tokio::join!(
        writer.write("acme", request("free", 0, "x")),
        writer.write("acme", request("free", 0, "y")),
    );
    let (x, y) = (x.unwrap(), y.unwrap());

    // The second write reconciled against the first, so neither audit entry is lost.
    assert_eq!(x.audit, "initial creation,,x");
    assert_eq!(y.audit, "initial creation,,x,y");
    assert_eq!(store.get("acme"), Some(y));
}

#[tokio::test]
async fn replay_marks_the_store_synced_at_the_head() {
    let broker = Broker::new();
    let seed = writer(&broker, tenant_store()).await;
    for name in ["a", "b", "c"] {
        seed.write(name, request("free", 1, "")).await.unwrap();
    }

    let store = tenant_store();
    let mut synced = store.synced();
    let consumer = spawn_consumer(&broker, store.clone());
    time::timeout(time::Duration::from_secs(5), synced.wait_for(|s| *s))
        .await
        .expect("store must sync")
        .unwrap();
    assert_eq!(store.len(), 3);
    consumer.abort();

    let empty = tenant_store();
    let mut synced = empty.synced();
    let consumer = spawn_consumer(&Broker::new(), empty.clone());
    time::timeout(time::Duration::from_secs(5), synced.wait_for(|s| *s))
        .await
        .expect("an empty topic is synced immediately")
        .unwrap();
    consumer.abort();
}

#[tokio::test]
async fn function_metadata_is_materialized_by_the_same_consumer() {
    let broker = Broker::new();
    let store = Store::<FunctionMeta>::shared("functions", KindMetrics::default());
    let event = |request_type, worker: &str, name: &str| {
        let event = FunctionEvent {
            request_type,
            worker_id: worker.to_string(),
            function: FunctionDetails {
                tenant: "acme".to_string(),
                namespace: "ingest".to_string(),
                name: name.to_string(),
                parallelism: 1,
                ..Default::default()
            },
        };
        serde_json::to_vec(&event).unwrap()
    };
    broker.append(FUNCTIONS, "acme/ingest/f", event(RequestType::Update, "w-1", "f"));
    broker.append(FUNCTIONS, "acme/ingest/g", event(RequestType::Update, "w-1", "g"));
    broker.append(FUNCTIONS, "acme/ingest/f", event(RequestType::Update, "w-2", "f"));
    broker.append(FUNCTIONS, "acme/ingest/g", event(RequestType::Delete, "", "g"));

    let consumer = Consumer::<_, FunctionEvent>::new(broker.clone(), FUNCTIONS, store.clone());
    let task = tokio::spawn(consumer.run());
    eventually(|| store.metrics().deletes.get() == 1).await;
    task.abort();

    let f = store.get("acme/ingest/f").expect("function must be present");
    assert_eq!(f.worker_id, "w-2");
    assert_eq!(store.get("acme/ingest/g"), None);
    assert_eq!(store.len(), 1);
}
