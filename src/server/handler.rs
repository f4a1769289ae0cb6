use std::{io, net::SocketAddr, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tracing::{debug, info, instrument};

use crate::server::{
    health::HealthMetrics,
    message::{read_handshake, ProtocolError},
    relay::RelayEvent,
    session::{DisplayName, Handshaken},
};

/// Limits applied while a new connection introduces itself.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeLimits {
    pub max_name_len: u32,
    pub timeout: Option<Duration>,
}

/// Handles a freshly accepted connection.
///
/// Reads the handshake and, on success, hands the connection to the relay as a
/// [`RelayEvent::Joined`]. A failed handshake closes the connection and is not
/// reported to anyone else.
#[instrument(skip(stream, events, limits, metrics))]
pub async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    events: mpsc::Sender<RelayEvent>,
    limits: HandshakeLimits,
    metrics: HealthMetrics,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);

    let name = match perform_handshake(&mut reader, limits).await {
        Ok(name) => name,
        Err(e) => {
            debug!("Handshake from {} failed: {}", addr, e);
            metrics.handshake_failures.inc();
            return;
        }
    };

    info!("Client {}: {}", addr, name);

    let joined = RelayEvent::Joined(Handshaken {
        name,
        addr,
        reader: Box::new(reader),
        writer: Box::new(writer),
    });

    if events.send(joined).await.is_err() {
        debug!("Relay stopped before {} could join", addr);
    }
}

/// Reads the display name, honoring the configured deadline.
async fn perform_handshake<R>(reader: &mut R, limits: HandshakeLimits) -> Result<DisplayName, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let name = match limits.timeout {
        Some(deadline) => tokio::time::timeout(deadline, read_handshake(reader, limits.max_name_len))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "handshake timed out"))??,
        None => read_handshake(reader, limits.max_name_len).await?,
    };

    Ok(DisplayName::new(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::message::encode_handshake;
    use tokio::io::AsyncWriteExt;

    fn limits() -> HandshakeLimits {
        HandshakeLimits { max_name_len: 16, timeout: Some(Duration::from_millis(200)) }
    }

    fn addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 50_000))
    }

    #[tokio::test]
    async fn completed_handshake_joins() {
        let (tx, mut rx) = mpsc::channel(4);
        let metrics = HealthMetrics::new().unwrap();
        let (relay_end, mut peer) = tokio::io::duplex(256);

        peer.write_all(&encode_handshake(b"Bo").unwrap()).await.unwrap();
        handle_connection(relay_end, addr(), tx, limits(), metrics.clone()).await;

        match rx.recv().await {
            Some(RelayEvent::Joined(conn)) => {
                assert_eq!(conn.name, "Bo");
                assert_eq!(conn.addr, addr());
            }
            other => panic!("expected join, got {other:?}"),
        }
        assert_eq!(metrics.handshake_failures.get(), 0);
    }

    #[tokio::test]
    async fn name_bytes_are_not_validated() {
        let (tx, mut rx) = mpsc::channel(4);
        let metrics = HealthMetrics::new().unwrap();
        let (relay_end, mut peer) = tokio::io::duplex(256);

        peer.write_all(&encode_handshake(b"\xfe\xff").unwrap()).await.unwrap();
        handle_connection(relay_end, addr(), tx, limits(), metrics.clone()).await;

        match rx.recv().await {
            Some(RelayEvent::Joined(conn)) => assert_eq!(conn.name.as_bytes(), b"\xfe\xff"),
            other => panic!("expected join, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn truncated_handshake_is_discarded() {
        let (tx, mut rx) = mpsc::channel(4);
        let metrics = HealthMetrics::new().unwrap();
        let (relay_end, mut peer) = tokio::io::duplex(256);

        peer.write_all(&[0, 0, 0, 5, b'B']).await.unwrap();
        drop(peer);
        handle_connection(relay_end, addr(), tx, limits(), metrics.clone()).await;

        assert!(rx.recv().await.is_none());
        assert_eq!(metrics.handshake_failures.get(), 1);
    }

    #[tokio::test]
    async fn oversized_name_is_discarded() {
        let (tx, mut rx) = mpsc::channel(4);
        let metrics = HealthMetrics::new().unwrap();
        let (relay_end, mut peer) = tokio::io::duplex(256);

        peer.write_all(&1_000_000u32.to_be_bytes()).await.unwrap();
        handle_connection(relay_end, addr(), tx, limits(), metrics.clone()).await;

        assert!(rx.recv().await.is_none());
        assert_eq!(metrics.handshake_failures.get(), 1);
    }

    #[tokio::test]
    async fn stalled_handshake_times_out() {
        let (tx, mut rx) = mpsc::channel(4);
        let metrics = HealthMetrics::new().unwrap();
        let (relay_end, _peer) = tokio::io::duplex(256);

        handle_connection(relay_end, addr(), tx, limits(), metrics.clone()).await;

        assert!(rx.recv().await.is_none());
        assert_eq!(metrics.handshake_failures.get(), 1);
    }
}
