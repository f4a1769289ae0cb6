use std::{fmt, net::SocketAddr, time::Duration};
use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tracing::{debug, instrument, warn};

use crate::server::{
    message::{MessageFrame, ProtocolError},
    relay::{CloseCause, RelayEvent},
};

pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Frames a session may have queued before it counts as stalled.
pub const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Identity of a registered session. Allocated in increasing order by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A participant's display name: the handshake bytes exactly as received.
///
/// Attribution copies the raw bytes; `Display` is lossy and only used for logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayName(Bytes);

impl DisplayName {
    pub fn new(raw: impl Into<Bytes>) -> Self {
        Self(raw.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for DisplayName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl PartialEq<str> for DisplayName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other.as_bytes()
    }
}

impl PartialEq<&str> for DisplayName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == other.as_bytes()
    }
}

/// A connection whose handshake has completed but which is not registered yet.
pub struct Handshaken {
    pub name: DisplayName,
    pub addr: SocketAddr,
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

impl fmt::Debug for Handshaken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshaken")
            .field("name", &self.name)
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

/// A registered participant.
///
/// Owns the reader task that turns inbound frames into [`RelayEvent`]s and the
/// bounded queue feeding its writer task. Dropping the session aborts the
/// reader and closes the queue; the writer then flushes what is queued and
/// shuts the stream down, unless [`finish_writer`] runs out of patience first.
pub struct Session {
    pub id: SessionId,
    /// Display name from the handshake.
    pub name: DisplayName,
    /// Peer address, informational only.
    pub addr: SocketAddr,
    /// Channel sender for frames to this participant.
    sender: mpsc::Sender<Bytes>,
    reader: JoinHandle<()>,
    writer: Option<JoinHandle<()>>,
}

impl Session {
    /// Starts the reader and writer tasks for a handshaken connection.
    ///
    /// Inbound frames declaring more than `max_message_len` payload bytes end the session.
    #[instrument(skip(conn, events), fields(name = %conn.name, addr = %conn.addr))]
    pub fn spawn(
        id: SessionId,
        conn: Handshaken,
        events: mpsc::Sender<RelayEvent>,
        max_message_len: u32,
    ) -> Self {
        let Handshaken { name, addr, reader, writer } = conn;
        let (sender, receiver) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);

        let reader = tokio::spawn(read_loop(id, reader, events.clone(), max_message_len));
        let writer = tokio::spawn(write_loop(id, writer, receiver, events));

        Session {
            id,
            name,
            addr,
            sender,
            reader,
            writer: Some(writer),
        }
    }

    /// Queues an encoded frame for this participant.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::SendFailed` once the writer task has stopped, and
    /// `SessionError::Stalled` when the participant has fallen
    /// [`OUTBOUND_QUEUE_DEPTH`] frames behind.
    pub fn send(&self, frame: Bytes) -> Result<(), SessionError> {
        self.sender.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => SessionError::Stalled,
            TrySendError::Closed(_) => SessionError::SendFailed,
        })
    }

    /// Frames queued for the writer and not yet taken by it.
    pub fn backlog(&self) -> usize {
        OUTBOUND_QUEUE_DEPTH - self.sender.capacity()
    }

    /// Checks if the writer side is still accepting frames.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Tears the session down, returning the writer task so callers can wait
    /// for queued frames to drain.
    pub fn close(mut self) -> Option<JoinHandle<()>> {
        self.writer.take()
    }
}

/// Gives a closed session's writer `grace` to flush, then aborts it.
///
/// Returns `true` if the writer finished on its own. Either way the write half
/// has been dropped when this returns.
pub async fn finish_writer(mut writer: JoinHandle<()>, grace: Duration) -> bool {
    if tokio::time::timeout(grace, &mut writer).await.is_ok() {
        return true;
    }
    writer.abort();
    let _ = writer.await;
    false
}

impl Drop for Session {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

async fn read_loop(
    id: SessionId,
    mut reader: BoxedReader,
    events: mpsc::Sender<RelayEvent>,
    max_message_len: u32,
) {
    let cause = loop {
        match MessageFrame::read_from(&mut reader, max_message_len).await {
            Ok(frame) => {
                if events.send(RelayEvent::Message { id, frame }).await.is_err() {
                    return;
                }
            }
            Err(ProtocolError::Disconnected) => break CloseCause::Disconnected,
            Err(e) => break CloseCause::Protocol(e),
        }
    };

    let _ = events.send(RelayEvent::Closed { id, cause }).await;
}

async fn write_loop(
    id: SessionId,
    mut writer: BoxedWriter,
    mut queue: mpsc::Receiver<Bytes>,
    events: mpsc::Sender<RelayEvent>,
) {
    while let Some(frame) = queue.recv().await {
        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = written {
            warn!("Failed to write to session {}: {}", id, e);
            drop(queue);
            let _ = events.send(RelayEvent::Closed { id, cause: CloseCause::WriteFailed(e) }).await;
            return;
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!("Shutdown of session {} stream failed: {}", id, e);
    }
}

/// Represents errors that may occur in session operations.
#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("Failed to send message")]
    SendFailed,
    #[error("Participant is not reading; outbound queue is full")]
    Stalled,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::server::message::MessageFlags;
    use tokio::io::{AsyncReadExt, DuplexStream};

    /// Builds a session over an in-memory stream; the returned stream is the participant's end.
    pub(crate) fn duplex_session(
        id: u64,
        name: &str,
        events: mpsc::Sender<RelayEvent>,
    ) -> (Session, DuplexStream) {
        let (relay_end, peer_end) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(relay_end);
        let conn = Handshaken {
            name: DisplayName::new(name.to_string()),
            addr: SocketAddr::from(([127, 0, 0, 1], 40_000 + id as u16)),
            reader: Box::new(reader),
            writer: Box::new(writer),
        };
        (Session::spawn(SessionId(id), conn, events, 1024), peer_end)
    }

    async fn next_event(events: &mut mpsc::Receiver<RelayEvent>) -> RelayEvent {
        tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn inbound_frames_become_events_in_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let (_session, mut peer) = duplex_session(1, "Bo", tx);

        for text in ["one", "two"] {
            let frame = MessageFrame::new(MessageFlags::NONE, text).encode().unwrap();
            peer.write_all(&frame).await.unwrap();
        }
        drop(peer);

        for expected in ["one", "two"] {
            match next_event(&mut rx).await {
                RelayEvent::Message { id, frame } => {
                    assert_eq!(id, SessionId(1));
                    assert_eq!(&frame.payload[..], expected.as_bytes());
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(matches!(
            next_event(&mut rx).await,
            RelayEvent::Closed { id: SessionId(1), cause: CloseCause::Disconnected }
        ));
    }

    #[tokio::test]
    async fn oversized_frame_closes_the_session() {
        let (tx, mut rx) = mpsc::channel(8);
        let (_session, mut peer) = duplex_session(2, "Bo", tx);

        let mut header = Vec::new();
        header.extend_from_slice(&0u32.to_be_bytes());
        header.extend_from_slice(&4096u32.to_be_bytes());
        peer.write_all(&header).await.unwrap();

        assert!(matches!(
            next_event(&mut rx).await,
            RelayEvent::Closed {
                cause: CloseCause::Protocol(ProtocolError::MessageTooLong { len: 4096, max: 1024 }),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn close_drains_queued_frames_then_ends_stream() {
        let (tx, _rx) = mpsc::channel(8);
        let (session, mut peer) = duplex_session(3, "Bo", tx);

        let frame = MessageFrame::new(MessageFlags::URG, "bye").encode().unwrap();
        session.send(frame.clone()).unwrap();
        let writer = session.close().expect("writer handle");
        writer.await.unwrap();

        let received = MessageFrame::read_from(&mut peer, 1024).await.unwrap();
        assert_eq!(&received.payload[..], b"bye");
        assert!(matches!(
            MessageFrame::read_from(&mut peer, 1024).await,
            Err(ProtocolError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn stalled_participant_fills_its_queue_and_is_refused() {
        let (tx, _rx) = mpsc::channel(8);
        let (session, _peer) = duplex_session(4, "Slow", tx);
        let frame = MessageFrame::new(MessageFlags::NONE, vec![b'x'; 1024]).encode().unwrap();

        let mut accepted = 0;
        let refusal = loop {
            match session.send(frame.clone()) {
                Ok(()) => accepted += 1,
                Err(e) => break e,
            }
            assert!(accepted <= OUTBOUND_QUEUE_DEPTH + 8, "queue grew past its bound");
        };

        assert!(matches!(refusal, SessionError::Stalled));
        assert_eq!(session.backlog(), OUTBOUND_QUEUE_DEPTH);
        assert!(accepted >= OUTBOUND_QUEUE_DEPTH);
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn writer_blocked_on_a_stalled_peer_is_aborted() {
        let (tx, _rx) = mpsc::channel(8);
        let (session, mut peer) = duplex_session(5, "Slow", tx);
        let frame = MessageFrame::new(MessageFlags::NONE, vec![b'x'; 1024]).encode().unwrap();

        // More than the in-memory pipe holds, so the writer blocks mid-frame.
        for _ in 0..16 {
            session.send(frame.clone()).unwrap();
        }
        tokio::task::yield_now().await;

        let writer = session.close().expect("writer handle");
        let flushed = tokio::time::timeout(
            Duration::from_secs(1),
            finish_writer(writer, Duration::from_millis(50)),
        )
        .await
        .expect("writer stopped in time");
        assert!(!flushed);

        // Both halves are gone, so the peer reaches end of stream after the buffered bytes.
        let mut buffered = Vec::new();
        tokio::time::timeout(Duration::from_secs(1), peer.read_to_end(&mut buffered))
            .await
            .expect("stream closed in time")
            .unwrap();
        assert!(buffered.len() < 16 * frame.len());
    }

    #[tokio::test]
    async fn names_keep_their_raw_bytes() {
        let name = DisplayName::new(&b"B\xffo"[..]);
        assert_eq!(name.as_bytes(), b"B\xffo");
        assert_eq!(name.to_string(), "B\u{fffd}o");
        assert!(DisplayName::new("Bo") == "Bo");
    }
}
