//! Full-stack tests: queue core behind the control plane

use std::{io::Cursor, sync::Arc, time::Duration};

use ahash::AHashMap;
use postrider::{DsnBounceHook, Master};
use postrider_common::{Envelope, QueueId, Signal};
use postrider_control::{ControlClient, ControlServer};
use postrider_delivery::DsnConfig;
use postrider_queue::{
    MaintenanceConfig, MemoryQueueStore, Queue, QueueConfig, QueueHooks, QueueStore,
};
use postrider_spool::{BlobStore, MemoryBlobStore, MessageMeta};
use postrider_zones::ZoneRegistry;
use tokio::sync::broadcast;

struct Stack {
    queue: Arc<Queue>,
    blobs: Arc<MemoryBlobStore>,
    store: Arc<MemoryQueueStore>,
    addr: std::net::SocketAddr,
    _shutdown: broadcast::Sender<Signal>,
}

async fn start_stack() -> Stack {
    let blobs = Arc::new(MemoryBlobStore::new());
    let store = Arc::new(MemoryQueueStore::new());
    let zones = Arc::new(ZoneRegistry::new(AHashMap::new(), None));

    let mut config = QueueConfig::new("master-test");
    config.release_grace = Duration::ZERO;
    config.empty_zone_ttl = Duration::from_millis(50);

    let queue = Arc::new(Queue::new(
        Arc::clone(&store) as Arc<dyn QueueStore>,
        Arc::clone(&blobs) as Arc<dyn BlobStore>,
        zones,
        config,
    ));

    let master = Master::new(Arc::clone(&queue), MaintenanceConfig::default());
    let server = ControlServer::bind("127.0.0.1:0", master.handler())
        .await
        .expect("bind");
    let addr = server.local_addr().expect("addr");

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        let _ = server.serve(shutdown_rx).await;
    });

    Stack {
        queue,
        blobs,
        store,
        addr,
        _shutdown: shutdown_tx,
    }
}

async fn submit(stack: &Stack, from: &str, to: &str) -> QueueId {
    let id = stack.queue.next_id();

    let mut body = Cursor::new(b"Subject: test\r\n\r\nhello".to_vec());
    stack.blobs.store(&id, &mut body).await.expect("store body");

    let mut meta = MessageMeta::new(from, vec![to.to_string()]);
    meta.headers.push("Subject", "test");
    stack.blobs.set_meta(&id, &meta).await.expect("set meta");

    let envelope = Envelope {
        from: from.to_string(),
        to: vec![to.to_string()],
        ..Default::default()
    };
    stack.queue.push(&id, envelope).await.expect("push");
    id
}

/// GET through the control plane, retrying past the empty-zone pacing
async fn fetch(
    client: &ControlClient,
) -> Option<postrider_queue::ScheduledDelivery> {
    for _ in 0..20 {
        if let Some(delivery) = client.get().await.expect("get") {
            return Some(delivery);
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
    }
    None
}

#[tokio::test]
async fn test_delivery_released_over_rpc() {
    let stack = start_stack().await;
    let id = submit(&stack, "a@x.test", "b@y.test").await;

    let client = ControlClient::connect(stack.addr, "default", "worker-1")
        .await
        .expect("connect");

    let scheduled = fetch(&client).await.expect("a delivery");
    assert_eq!(scheduled.delivery.id, id);
    assert_eq!(scheduled.meta.envelope_from, "a@x.test");

    client
        .release(&scheduled.delivery.id, &scheduled.delivery.seq, &scheduled.lock)
        .await
        .expect("release");

    // Give the inline body removal a beat.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(stack.store.is_empty());
    assert!(!stack.blobs.exists(&id).await.expect("exists"));
}

#[tokio::test]
async fn test_defer_then_redelivery_over_rpc() {
    let stack = start_stack().await;
    let id = submit(&stack, "a@x.test", "b@y.test").await;

    let client = ControlClient::connect(stack.addr, "default", "worker-1")
        .await
        .expect("connect");

    let scheduled = fetch(&client).await.expect("a delivery");
    client
        .defer(
            &scheduled.delivery.id,
            &scheduled.delivery.seq,
            &scheduled.lock,
            300,
            "450 4.2.0 try later",
            None,
        )
        .await
        .expect("defer");

    // Not yet due.
    assert!(client.get().await.expect("get").is_none());

    tokio::time::sleep(Duration::from_millis(400)).await;
    let again = fetch(&client).await.expect("due again");
    assert_eq!(again.delivery.id, id);
    let deferred = again.delivery.deferred.expect("deferred block");
    assert_eq!(deferred.count, 1);
    assert_eq!(deferred.response, "450 4.2.0 try later");
}

#[tokio::test]
async fn test_worker_crash_recovers_delivery() {
    let stack = start_stack().await;
    let id = submit(&stack, "a@x.test", "b@y.test").await;

    let crashing = ControlClient::connect(stack.addr, "default", "worker-crash")
        .await
        .expect("connect");
    let scheduled = fetch(&crashing).await.expect("claimed");
    assert_eq!(scheduled.delivery.id, id);
    drop(crashing);

    // The disconnect handler releases the worker's locks.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let rows = stack.store.find_message(&id).await.expect("rows");
    assert!(!rows[0].locked);

    let successor = ControlClient::connect(stack.addr, "default", "worker-2")
        .await
        .expect("connect");
    let retaken = fetch(&successor).await.expect("re-handed out");
    assert_eq!(retaken.delivery.id, id);
}

#[tokio::test]
async fn test_bounce_composes_and_requeues_dsn() {
    // The hook shares the stack's blob store, so the wiring from
    // start_stack is mirrored inline here.
    let stack = {
        let blobs = Arc::new(MemoryBlobStore::new());
        let store = Arc::new(MemoryQueueStore::new());
        let zones = Arc::new(ZoneRegistry::new(AHashMap::new(), None));

        let mut config = QueueConfig::new("master-test");
        config.release_grace = Duration::ZERO;
        config.empty_zone_ttl = Duration::from_millis(50);

        let hook = Arc::new(DsnBounceHook::new(
            DsnConfig::default(),
            Arc::clone(&blobs) as Arc<dyn BlobStore>,
        ));
        let queue = Arc::new(
            Queue::new(
                Arc::clone(&store) as Arc<dyn QueueStore>,
                Arc::clone(&blobs) as Arc<dyn BlobStore>,
                zones,
                config,
            )
            .with_hooks(Arc::clone(&hook) as Arc<dyn QueueHooks>),
        );
        hook.bind(&queue);

        let master = Master::new(Arc::clone(&queue), MaintenanceConfig::default());
        let server = ControlServer::bind("127.0.0.1:0", master.handler())
            .await
            .expect("bind");
        let addr = server.local_addr().expect("addr");
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(async move {
            let _ = server.serve(shutdown_rx).await;
        });

        Stack {
            queue,
            blobs,
            store,
            addr,
            _shutdown: shutdown_tx,
        }
    };

    let id = submit(&stack, "sender@x.test", "gone@y.test").await;

    let client = ControlClient::connect(stack.addr, "default", "worker-1")
        .await
        .expect("connect");
    let scheduled = fetch(&client).await.expect("a delivery");

    client
        .bounce(&scheduled.delivery.id, &scheduled.delivery.seq, "550 5.1.1 user unknown")
        .await
        .expect("bounce");
    client
        .release(&scheduled.delivery.id, &scheduled.delivery.seq, &scheduled.lock)
        .await
        .expect("release");

    tokio::time::sleep(Duration::from_millis(100)).await;

    // The DSN is a new message addressed to the original sender.
    let dsn = fetch(&client).await.expect("dsn queued");
    assert_ne!(dsn.delivery.id, id);
    assert_eq!(dsn.delivery.recipient, "sender@x.test");
    assert_eq!(dsn.delivery.domain.as_str(), "x.test");
    assert_eq!(dsn.meta.envelope_from, "");
}
