//! Control server: the master side of the RPC plane
//!
//! One TCP connection per worker. The first frame must be a `Hello`
//! naming a known zone; everything after is request/reply matched by
//! `req` id, with each command handled in its own task so a slow `Get`
//! never blocks a `Release` on the same connection.
//!
//! Whatever ends a connection (clean shutdown, worker crash, framing
//! garbage), the handler's `disconnected` runs and returns every lock
//! the worker held to the pool. That is the at-least-once guarantee.

use std::sync::Arc;

use async_trait::async_trait;
use postrider_common::{QueueId, Signal};
use postrider_queue::ScheduledDelivery;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    sync::{broadcast, mpsc},
};
use tracing::{debug, error, info, warn};

use crate::{
    error::ControlError,
    framing::{read_frame, write_frame},
    protocol::{Command, Reply},
};

/// Master-side command handling
///
/// Wire-portable errors are plain strings; the master logs the typed
/// error before flattening it.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Whether a zone exists; an unknown zone rejects the handshake
    fn zone_known(&self, zone: &str) -> bool;

    /// `GET`: next delivery for the zone, claimed under `lock_owner`
    async fn get(
        &self,
        zone: &str,
        lock_owner: &str,
    ) -> std::result::Result<Option<ScheduledDelivery>, String>;

    /// `RELEASE`: success or permanent failure
    async fn release(
        &self,
        zone: &str,
        id: &QueueId,
        seq: &str,
        lock: &str,
    ) -> std::result::Result<(), String>;

    /// `DEFER`: temporary failure
    async fn defer(
        &self,
        zone: &str,
        id: &QueueId,
        seq: &str,
        lock: &str,
        ttl_ms: u64,
        response: &str,
        log: Option<&str>,
    ) -> std::result::Result<(), String>;

    /// `BOUNCE`: run bounce processing
    async fn bounce(
        &self,
        zone: &str,
        id: &QueueId,
        seq: &str,
        response: &str,
    ) -> std::result::Result<(), String>;

    /// The worker's connection ended, for any reason
    async fn disconnected(&self, lock_owner: &str);
}

/// Control-plane RPC server
pub struct ControlServer {
    listener: TcpListener,
    handler: Arc<dyn CommandHandler>,
}

impl ControlServer {
    /// Bind the listen address
    pub async fn bind(
        addr: impl tokio::net::ToSocketAddrs,
        handler: Arc<dyn CommandHandler>,
    ) -> crate::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, handler })
    }

    /// Address actually bound (for ephemeral-port tests)
    pub fn local_addr(&self) -> crate::Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept workers until shutdown
    pub async fn serve(self, mut shutdown: broadcast::Receiver<Signal>) -> crate::Result<()> {
        info!(addr = ?self.listener.local_addr().ok(), "Control server listening");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "Worker connected");
                            let handler = Arc::clone(&self.handler);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, handler).await {
                                    match e {
                                        ControlError::ConnectionClosed => {
                                            debug!(%peer, "Worker disconnected");
                                        }
                                        e => warn!(%peer, error = %e, "Worker connection failed"),
                                    }
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "Accept failed"),
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown) | Err(_) => {
                            info!("Control server shutting down");
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    handler: Arc<dyn CommandHandler>,
) -> crate::Result<()> {
    let (mut reader, writer) = tokio::io::split(stream);

    // Handshake: the first frame must identify the worker.
    let (zone, lock_owner) = match read_frame::<_, Command>(&mut reader).await? {
        Command::Hello { zone, id } => {
            if !handler.zone_known(&zone) {
                warn!(zone, worker = id, "Unknown zone, closing connection");
                return Err(ControlError::Handshake(format!("unknown zone {zone}")));
            }
            info!(zone, worker = %id, "Worker identified");
            (zone, id)
        }
        other => {
            return Err(ControlError::Handshake(format!(
                "expected HELLO, got {other:?}"
            )));
        }
    };

    let result = serve_commands(&mut reader, writer, &handler, &zone, &lock_owner).await;

    // Any exit path returns the worker's locks to the pool.
    handler.disconnected(&lock_owner).await;
    result
}

async fn serve_commands<R, W>(
    reader: &mut R,
    mut writer: W,
    handler: &Arc<dyn CommandHandler>,
    zone: &str,
    lock_owner: &str,
) -> crate::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (reply_tx, mut reply_rx) = mpsc::channel::<Reply>(64);

    // Writer task: replies from any command task, in completion order.
    let writer_task = tokio::spawn(async move {
        while let Some(reply) = reply_rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &reply).await {
                debug!(error = %e, "Reply write failed");
                break;
            }
        }
    });

    let result = loop {
        let command = match read_frame::<_, Command>(reader).await {
            Ok(command) => command,
            Err(e) => break Err(e),
        };

        match command {
            Command::Hello { .. } => {
                break Err(ControlError::Handshake("duplicate HELLO".to_string()));
            }
            command => {
                let handler = Arc::clone(handler);
                let reply_tx = reply_tx.clone();
                let zone = zone.to_string();
                let lock_owner = lock_owner.to_string();
                tokio::spawn(async move {
                    let reply = dispatch(&handler, &zone, &lock_owner, command).await;
                    let _ = reply_tx.send(reply).await;
                });
            }
        }
    };

    drop(reply_tx);
    let _ = writer_task.await;

    match result {
        Err(ControlError::ConnectionClosed) => Ok(()),
        other => other,
    }
}

async fn dispatch(
    handler: &Arc<dyn CommandHandler>,
    zone: &str,
    lock_owner: &str,
    command: Command,
) -> Reply {
    match command {
        Command::Hello { .. } => Reply::Error {
            req: 0,
            message: "unexpected HELLO".to_string(),
        },
        Command::Get { req } => match handler.get(zone, lock_owner).await {
            Ok(delivery) => Reply::Delivery {
                req,
                delivery: delivery.map(Box::new),
            },
            Err(message) => Reply::Error { req, message },
        },
        Command::Release { req, id, seq, lock } => {
            match handler.release(zone, &id, &seq, &lock).await {
                Ok(()) => Reply::Done {
                    req,
                    key: format!("{id}.{seq}"),
                },
                Err(message) => Reply::Error { req, message },
            }
        }
        Command::Defer {
            req,
            id,
            seq,
            lock,
            ttl_ms,
            response,
            log,
        } => {
            match handler
                .defer(zone, &id, &seq, &lock, ttl_ms, &response, log.as_deref())
                .await
            {
                Ok(()) => Reply::Done {
                    req,
                    key: format!("{id}.{seq}"),
                },
                Err(message) => Reply::Error { req, message },
            }
        }
        Command::Bounce { req, id, seq, response } => {
            match handler.bounce(zone, &id, &seq, &response).await {
                Ok(()) => Reply::Done {
                    req,
                    key: format!("{id}.{seq}"),
                },
                Err(message) => Reply::Error { req, message },
            }
        }
    }
}
