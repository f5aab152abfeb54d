//! Control client: the worker side of the RPC plane
//!
//! One connection per worker process. Requests carry a fresh `req` id
//! and park a oneshot in the pending map; a background reader task
//! resolves them as replies arrive, in whatever order the master sends
//! them.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use postrider_common::QueueId;
use postrider_queue::ScheduledDelivery;
use tokio::{
    io::{ReadHalf, WriteHalf},
    net::TcpStream,
    sync::{Mutex, oneshot},
};
use tracing::{debug, warn};

use crate::{
    error::ControlError,
    framing::{read_frame, write_frame},
    protocol::{Command, Reply},
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

/// Worker-side control connection
pub struct ControlClient {
    writer: Mutex<WriteHalf<TcpStream>>,
    pending: Pending,
    next_req: AtomicU64,
    closed: Arc<AtomicBool>,
    timeout: Duration,
}

impl ControlClient {
    /// Connect and identify as a worker of `zone`
    ///
    /// The master closes the connection instead of answering when the
    /// zone is unknown; that surfaces on the first request.
    pub async fn connect(
        addr: impl tokio::net::ToSocketAddrs,
        zone: impl Into<String>,
        worker_id: impl Into<String>,
    ) -> crate::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (mut reader, mut writer) = tokio::io::split(stream);

        write_frame(&mut writer, &Command::Hello {
            zone: zone.into(),
            id: worker_id.into(),
        })
        .await?;

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let reader_pending = Arc::clone(&pending);
        let reader_closed = Arc::clone(&closed);

        tokio::spawn(async move {
            loop {
                match read_frame::<ReadHalf<TcpStream>, Reply>(&mut reader).await {
                    Ok(reply) => {
                        let req = reply.req();
                        let sender = reader_pending.lock().await.remove(&req);
                        match sender {
                            Some(sender) => {
                                let _ = sender.send(reply);
                            }
                            None => warn!(req, "Reply for unknown request"),
                        }
                    }
                    Err(e) => {
                        if !matches!(e, ControlError::ConnectionClosed) {
                            debug!(error = %e, "Control connection reader stopped");
                        }
                        // Fail everything still in flight; ordering
                        // matters so `request` cannot park after this.
                        reader_closed.store(true, Ordering::SeqCst);
                        reader_pending.lock().await.clear();
                        break;
                    }
                }
            }
        });

        Ok(Self {
            writer: Mutex::new(writer),
            pending,
            next_req: AtomicU64::new(1),
            closed,
            timeout: REQUEST_TIMEOUT,
        })
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `GET`: fetch the next delivery, `None` when the zone is idle
    pub async fn get(&self) -> crate::Result<Option<ScheduledDelivery>> {
        let req = self.next_req.fetch_add(1, Ordering::Relaxed);
        match self.request(Command::Get { req }, req).await? {
            Reply::Delivery { delivery, .. } => Ok(delivery.map(|boxed| *boxed)),
            Reply::Error { message, .. } => Err(ControlError::Server(message)),
            Reply::Done { .. } => Err(ControlError::Server("mismatched reply".to_string())),
        }
    }

    /// `RELEASE`: the delivery is done (accepted or permanently failed)
    pub async fn release(&self, id: &QueueId, seq: &str, lock: &str) -> crate::Result<String> {
        let req = self.next_req.fetch_add(1, Ordering::Relaxed);
        let command = Command::Release {
            req,
            id: id.clone(),
            seq: seq.to_string(),
            lock: lock.to_string(),
        };
        self.expect_done(command, req).await
    }

    /// `DEFER`: temporary failure, retry after `ttl_ms`
    pub async fn defer(
        &self,
        id: &QueueId,
        seq: &str,
        lock: &str,
        ttl_ms: u64,
        response: &str,
        log: Option<String>,
    ) -> crate::Result<String> {
        let req = self.next_req.fetch_add(1, Ordering::Relaxed);
        let command = Command::Defer {
            req,
            id: id.clone(),
            seq: seq.to_string(),
            lock: lock.to_string(),
            ttl_ms,
            response: response.to_string(),
            log,
        };
        self.expect_done(command, req).await
    }

    /// `BOUNCE`: hard failure, run bounce processing
    pub async fn bounce(&self, id: &QueueId, seq: &str, response: &str) -> crate::Result<String> {
        let req = self.next_req.fetch_add(1, Ordering::Relaxed);
        let command = Command::Bounce {
            req,
            id: id.clone(),
            seq: seq.to_string(),
            response: response.to_string(),
        };
        self.expect_done(command, req).await
    }

    async fn expect_done(&self, command: Command, req: u64) -> crate::Result<String> {
        match self.request(command, req).await? {
            Reply::Done { key, .. } => Ok(key),
            Reply::Error { message, .. } => Err(ControlError::Server(message)),
            Reply::Delivery { .. } => Err(ControlError::Server("mismatched reply".to_string())),
        }
    }

    async fn request(&self, command: Command, req: u64) -> crate::Result<Reply> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(req, tx);

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = write_frame(&mut *writer, &command).await {
                self.pending.lock().await.remove(&req);
                return Err(e);
            }
        }

        if self.closed.load(Ordering::SeqCst) {
            self.pending.lock().await.remove(&req);
            return Err(ControlError::ConnectionClosed);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ControlError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().await.remove(&req);
                Err(ControlError::Timeout)
            }
        }
    }
}

impl std::fmt::Debug for ControlClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlClient")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
