use std::{future::Future, io, net::SocketAddr, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::mpsc,
    task::JoinSet,
};
use tracing::{debug, info, warn};

use crate::{
    config::RelayConfig,
    server::{
        broadcast,
        handler::{self, HandshakeLimits},
        health::HealthMetrics,
        message::{MessageFrame, ProtocolError},
        middleware::ConnectionRateLimiter,
        registry::Registry,
        session::{finish_writer, Handshaken, Session, SessionId},
    },
    utils::error::RelayError,
};

/// Inbound events buffered between session tasks and the relay loop.
const EVENT_QUEUE_DEPTH: usize = 1024;

/// How long a closed session's writer may keep flushing before it is aborted.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// How often peers with a replenished accept quota are forgotten.
const RATE_LIMIT_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Everything session and handshake tasks report to the relay loop.
#[derive(Debug)]
pub enum RelayEvent {
    /// A connection completed its handshake and wants to be registered.
    Joined(Handshaken),
    /// A registered session sent a complete message frame.
    Message { id: SessionId, frame: MessageFrame },
    /// A registered session's stream ended or failed.
    Closed { id: SessionId, cause: CloseCause },
}

/// Why a session is being torn down.
#[derive(Debug)]
pub enum CloseCause {
    /// Clean end of stream at or inside a frame.
    Disconnected,
    /// A malformed or oversized frame, or a read error.
    Protocol(ProtocolError),
    /// Writing to the participant failed.
    WriteFailed(io::Error),
    /// The participant's queue was closed or full during a broadcast.
    QueueClosed,
}

/// The relay: owns the listening socket and, while running, the registry.
///
/// All registry mutation and broadcast fan-out happen on the single task
/// driving [`Relay::run_until`]; per-connection tasks only report events.
pub struct Relay {
    listener: TcpListener,
    config: RelayConfig,
    metrics: HealthMetrics,
    rate_limiter: ConnectionRateLimiter,
}

impl Relay {
    pub fn new(listener: TcpListener, config: RelayConfig, metrics: HealthMetrics) -> Self {
        let rate_limiter = ConnectionRateLimiter::new(config.accept_rate_limit);
        Self {
            listener,
            config,
            metrics,
            rate_limiter,
        }
    }

    /// Binds the configured listen address.
    pub async fn bind(config: RelayConfig, metrics: HealthMetrics) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(config.listen_addr()?).await?;
        Ok(Self::new(listener, config, metrics))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn metrics(&self) -> &HealthMetrics {
        &self.metrics
    }

    /// Runs the relay until `shutdown` resolves, then closes every session in
    /// registration order.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()> + Send,
    {
        let (events_tx, mut events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let mut registry = Registry::new();
        let mut prune = tokio::time::interval(RATE_LIMIT_PRUNE_INTERVAL);
        tokio::pin!(shutdown);

        loop {
            debug!("Client count: {} (watching {})", registry.len(), registry.len() + 1);

            select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => {
                    self.handle_accept(accepted, &events_tx);
                }
                Some(event) = events_rx.recv() => {
                    self.dispatch(event, &mut registry, &events_tx);
                }
                _ = prune.tick() => self.rate_limiter.prune(),
            }
        }

        info!("Relay shutting down, closing {} sessions", registry.len());
        let mut closing = JoinSet::new();
        for session in registry.drain() {
            debug!("Closing session {} ({})", session.id, session.addr);
            let addr = session.addr;
            if let Some(writer) = session.close() {
                closing.spawn(async move { (addr, finish_writer(writer, CLOSE_GRACE).await) });
            }
        }
        self.metrics.sessions.set(0);

        while let Some(closed) = closing.join_next().await {
            if let Ok((addr, false)) = closed {
                warn!("Session {} did not flush within {:?}, aborted", addr, CLOSE_GRACE);
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<(), RelayError> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }

    fn handle_accept(
        &self,
        accepted: io::Result<(TcpStream, SocketAddr)>,
        events: &mpsc::Sender<RelayEvent>,
    ) {
        let (stream, addr) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Accept error: {}", e);
                return;
            }
        };

        if !self.rate_limiter.check(addr.ip()) {
            warn!("Rate limit exceeded for {}", addr);
            self.metrics.rejected_connections.inc();
            return;
        }

        let limits = HandshakeLimits {
            max_name_len: self.config.max_name_len,
            timeout: self.config.handshake_timeout(),
        };
        tokio::spawn(handler::handle_connection(
            stream,
            addr,
            events.clone(),
            limits,
            self.metrics.clone(),
        ));
    }

    fn dispatch(
        &self,
        event: RelayEvent,
        registry: &mut Registry,
        events: &mpsc::Sender<RelayEvent>,
    ) {
        match event {
            RelayEvent::Joined(conn) => {
                let id = registry.next_id();
                let session = Session::spawn(id, conn, events.clone(), self.config.max_message_len);
                debug!("Registered session {} ({}) from {}", id, session.name, session.addr);
                registry.add(session);
            }
            RelayEvent::Message { id, frame } => {
                let Some(origin) = registry.get(id) else {
                    debug!("Dropping message from departed session {}", id);
                    return;
                };
                let sender = origin.name.clone();
                self.metrics.messages_received.inc();
                debug!("Msg {}: {}", sender, String::from_utf8_lossy(&frame.payload));

                match broadcast::broadcast(registry, sender.as_bytes(), &frame) {
                    Ok(fanout) => {
                        self.metrics.frames_sent.inc_by(fanout.delivered as u64);
                        for session in fanout.dropped {
                            self.teardown(session, &CloseCause::QueueClosed);
                        }
                    }
                    Err(e) => warn!("Could not broadcast message from {}: {}", sender, e),
                }
            }
            RelayEvent::Closed { id, cause } => {
                if let Some(session) = registry.remove(id) {
                    self.teardown(session, &cause);
                }
            }
        }

        self.metrics.sessions.set(registry.len() as i64);
    }

    fn teardown(&self, session: Session, cause: &CloseCause) {
        match cause {
            CloseCause::Disconnected => info!("Client {} close", session.addr),
            other => info!("Client {} close: {:?}", session.addr, other),
        }
        let addr = session.addr;
        if let Some(writer) = session.close() {
            tokio::spawn(async move {
                if !finish_writer(writer, CLOSE_GRACE).await {
                    debug!("Writer for {} did not flush within {:?}, aborted", addr, CLOSE_GRACE);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::message::encode_handshake;
    use tokio::{io::AsyncWriteExt, sync::oneshot};

    #[tokio::test]
    async fn shutdown_closes_registered_sessions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = RelayConfig { host: "127.0.0.1".into(), ..RelayConfig::default() };
        let metrics = HealthMetrics::new().unwrap();
        let relay = Relay::new(listener, config, metrics.clone());
        let addr = relay.local_addr().unwrap();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(relay.run_until(async move {
            let _ = stop_rx.await;
        }));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&encode_handshake(b"Bo").unwrap()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while metrics.sessions.get() != 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session registered");

        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
        assert_eq!(metrics.sessions.get(), 0);

        let read = MessageFrame::read_from(&mut stream, 1024).await;
        assert!(matches!(read, Err(ProtocolError::Disconnected)));
    }
}
