use bytes::{BufMut, BytesMut};
use tracing::{instrument, warn};

use crate::server::{
    message::{MessageFlags, MessageFrame, ProtocolError},
    registry::{Registry, Visit},
    session::Session,
};

/// Result of one fan-out pass.
#[derive(Debug, Default)]
pub struct Fanout {
    /// Recipients the frame was queued to.
    pub delivered: usize,
    /// Sessions whose queue was closed; already removed from the registry.
    pub dropped: Vec<Session>,
}

/// Prefixes a message with its sender.
///
/// `ME` messages read `* name text`, all others `name: text`. Flags are kept as-is.
pub fn attribute(sender: &[u8], frame: &MessageFrame) -> MessageFrame {
    let mut payload = BytesMut::with_capacity(sender.len() + frame.payload.len() + 3);

    if frame.flags.contains(MessageFlags::ME) {
        payload.put_slice(b"* ");
        payload.put_slice(sender);
        payload.put_u8(b' ');
    } else {
        payload.put_slice(sender);
        payload.put_slice(b": ");
    }
    payload.put_slice(&frame.payload);

    MessageFrame::new(frame.flags, payload.freeze())
}

/// Attributes `frame` to `sender` and queues it to every registered session,
/// the sender included.
///
/// Sessions that can no longer accept frames, including those too far behind
/// to take another one, are removed after the pass.
#[instrument(skip(registry, frame), fields(flags = %frame.flags, len = frame.payload.len()))]
pub fn broadcast(registry: &mut Registry, sender: &[u8], frame: &MessageFrame) -> Result<Fanout, ProtocolError> {
    let encoded = attribute(sender, frame).encode()?;
    let mut delivered = 0;

    let dropped = registry.for_each(|session| match session.send(encoded.clone()) {
        Ok(()) => {
            delivered += 1;
            Visit::Keep
        }
        Err(e) => {
            warn!("Broadcast failed to {} ({}): {}", session.id, session.name, e);
            Visit::Remove
        }
    });

    Ok(Fanout { delivered, dropped })
}
