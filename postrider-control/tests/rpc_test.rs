//! Control-plane round-trip tests against a mock master

use std::{
    collections::VecDeque,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use postrider_common::{Domain, IdGenerator, QueueId, Signal, now_ms};
use postrider_control::{CommandHandler, ControlClient, ControlServer};
use postrider_queue::{Delivery, ScheduledDelivery, lock_key};
use postrider_spool::MessageMeta;
use tokio::sync::{Mutex, broadcast};

#[derive(Default)]
struct MockMaster {
    deliveries: Mutex<VecDeque<ScheduledDelivery>>,
    released: Mutex<Vec<String>>,
    deferred: Mutex<Vec<(String, u64, String)>>,
    bounced: Mutex<Vec<String>>,
    disconnected: Mutex<Vec<String>>,
}

#[async_trait]
impl CommandHandler for MockMaster {
    fn zone_known(&self, zone: &str) -> bool {
        zone == "default"
    }

    async fn get(
        &self,
        _zone: &str,
        _lock_owner: &str,
    ) -> Result<Option<ScheduledDelivery>, String> {
        Ok(self.deliveries.lock().await.pop_front())
    }

    async fn release(
        &self,
        _zone: &str,
        id: &QueueId,
        seq: &str,
        _lock: &str,
    ) -> Result<(), String> {
        self.released.lock().await.push(format!("{id}.{seq}"));
        Ok(())
    }

    async fn defer(
        &self,
        _zone: &str,
        id: &QueueId,
        seq: &str,
        _lock: &str,
        ttl_ms: u64,
        response: &str,
        _log: Option<&str>,
    ) -> Result<(), String> {
        self.deferred
            .lock()
            .await
            .push((format!("{id}.{seq}"), ttl_ms, response.to_string()));
        Ok(())
    }

    async fn bounce(
        &self,
        _zone: &str,
        id: &QueueId,
        seq: &str,
        _response: &str,
    ) -> Result<(), String> {
        self.bounced.lock().await.push(format!("{id}.{seq}"));
        Ok(())
    }

    async fn disconnected(&self, lock_owner: &str) {
        self.disconnected.lock().await.push(lock_owner.to_string());
    }
}

fn scheduled(id: &QueueId) -> ScheduledDelivery {
    let delivery = Delivery {
        id: id.clone(),
        seq: "001".to_string(),
        recipient: "b@y.test".to_string(),
        domain: Domain::new("y.test"),
        sending_zone: "default".to_string(),
        locked: true,
        lock_time: now_ms(),
        assigned: Some("master-1".to_string()),
        queued: now_ms(),
        created: now_ms(),
        deferred: None,
        session_id: None,
    };
    let lock = lock_key(id, "001");
    ScheduledDelivery {
        delivery,
        meta: MessageMeta::new("a@x.test", vec!["b@y.test".to_string()]),
        lock,
    }
}

async fn start_server(master: Arc<MockMaster>) -> (std::net::SocketAddr, broadcast::Sender<Signal>) {
    let server = ControlServer::bind("127.0.0.1:0", master)
        .await
        .expect("bind");
    let addr = server.local_addr().expect("addr");
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        let _ = server.serve(shutdown_rx).await;
    });
    (addr, shutdown_tx)
}

#[tokio::test]
async fn test_get_release_roundtrip() {
    let master = Arc::new(MockMaster::default());
    let id = IdGenerator::new().generate();
    master.deliveries.lock().await.push_back(scheduled(&id));

    let (addr, _shutdown) = start_server(Arc::clone(&master)).await;

    let client = ControlClient::connect(addr, "default", "worker-1")
        .await
        .expect("connect");

    let delivery = client.get().await.expect("get").expect("a delivery");
    assert_eq!(delivery.delivery.id, id);
    assert_eq!(delivery.meta.envelope_from, "a@x.test");

    let key = client
        .release(&delivery.delivery.id, &delivery.delivery.seq, &delivery.lock)
        .await
        .expect("release");
    assert_eq!(key, format!("{id}.001"));
    assert_eq!(master.released.lock().await.len(), 1);

    // Queue drained: the next GET returns nothing.
    assert!(client.get().await.expect("get").is_none());
}

#[tokio::test]
async fn test_defer_carries_ttl_and_response() {
    let master = Arc::new(MockMaster::default());
    let id = IdGenerator::new().generate();
    master.deliveries.lock().await.push_back(scheduled(&id));

    let (addr, _shutdown) = start_server(Arc::clone(&master)).await;
    let client = ControlClient::connect(addr, "default", "worker-1")
        .await
        .expect("connect");

    let delivery = client.get().await.expect("get").expect("a delivery");
    client
        .defer(
            &delivery.delivery.id,
            &delivery.delivery.seq,
            &delivery.lock,
            30_000,
            "450 4.7.1 greylisted",
            None,
        )
        .await
        .expect("defer");

    let deferred = master.deferred.lock().await;
    assert_eq!(deferred.len(), 1);
    assert_eq!(deferred[0].1, 30_000);
    assert_eq!(deferred[0].2, "450 4.7.1 greylisted");
}

#[tokio::test]
async fn test_bounce() {
    let master = Arc::new(MockMaster::default());
    let id = IdGenerator::new().generate();

    let (addr, _shutdown) = start_server(Arc::clone(&master)).await;
    let client = ControlClient::connect(addr, "default", "worker-1")
        .await
        .expect("connect");

    client
        .bounce(&id, "001", "550 5.1.1 user unknown")
        .await
        .expect("bounce");
    assert_eq!(master.bounced.lock().await.len(), 1);
}

#[tokio::test]
async fn test_unknown_zone_is_rejected() {
    let master = Arc::new(MockMaster::default());
    let (addr, _shutdown) = start_server(Arc::clone(&master)).await;

    // The handshake frame is accepted at the TCP level; the master
    // closes the connection, which surfaces on the first request.
    let client = ControlClient::connect(addr, "nonexistent", "worker-1")
        .await
        .expect("tcp connect");
    let result = tokio::time::timeout(Duration::from_secs(2), client.get()).await;
    assert!(matches!(result, Ok(Err(_))), "request must fail, not hang");
}

#[tokio::test]
async fn test_disconnect_releases_lock_owner() {
    let master = Arc::new(MockMaster::default());
    let (addr, _shutdown) = start_server(Arc::clone(&master)).await;

    let client = ControlClient::connect(addr, "default", "worker-crashing")
        .await
        .expect("connect");
    // Prove the handshake completed before dropping the connection.
    assert!(client.get().await.expect("get").is_none());
    drop(client);

    // The close handler runs within a tick.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let disconnected = master.disconnected.lock().await;
    assert_eq!(disconnected.as_slice(), ["worker-crashing".to_string()]);
}

#[tokio::test]
async fn test_replies_match_out_of_order_requests() {
    let master = Arc::new(MockMaster::default());
    let generator = IdGenerator::new();
    for _ in 0..4 {
        let id = generator.generate();
        master.deliveries.lock().await.push_back(scheduled(&id));
    }

    let (addr, _shutdown) = start_server(Arc::clone(&master)).await;
    let client = Arc::new(
        ControlClient::connect(addr, "default", "worker-1")
            .await
            .expect("connect"),
    );

    // Issue several GETs concurrently; each future must resolve with a
    // distinct delivery regardless of reply order.
    let mut handles = Vec::new();
    for _ in 0..4 {
        let client = Arc::clone(&client);
        handles.push(tokio::spawn(async move {
            client.get().await.expect("get").expect("delivery")
        }));
    }

    let mut seen = std::collections::HashSet::new();
    for handle in handles {
        let delivery = handle.await.expect("join");
        assert!(seen.insert(delivery.delivery.id.clone()), "duplicate delivery handed out");
    }
}
