use std::{fmt, io, ops::BitOr};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of the handshake header: the declared name length.
pub const HANDSHAKE_HEADER_LEN: usize = 4;

/// Size of the message header: flags followed by the declared payload length.
pub const MESSAGE_HEADER_LEN: usize = 8;

/// Represents the failures that can occur while reading or writing frames.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The peer closed the stream before a complete frame arrived.
    #[error("Peer disconnected")]
    Disconnected,

    /// The handshake declared a name longer than the relay accepts.
    #[error("Declared name length {len} exceeds limit of {max} bytes")]
    NameTooLong { len: u32, max: u32 },

    /// A message header declared a payload longer than the relay accepts.
    #[error("Declared message length {len} exceeds limit of {max} bytes")]
    MessageTooLong { len: u32, max: u32 },

    /// A frame to be sent does not fit the 32-bit length field.
    #[error("Frame of {0} bytes exceeds the 32-bit length field")]
    FrameTooLarge(usize),

    /// Any other stream failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Flag bits carried by a message frame.
///
/// Bits the relay does not know about are kept as-is and forwarded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MessageFlags(u32);

impl MessageFlags {
    pub const NONE: MessageFlags = MessageFlags(0);
    /// Self-referential action message, rendered as `* name text`.
    pub const ME: MessageFlags = MessageFlags(0x01);
    /// Urgent message, rendered with emphasis by participants.
    pub const URG: MessageFlags = MessageFlags(0x02);

    pub const fn from_bits(bits: u32) -> Self {
        MessageFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: MessageFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for MessageFlags {
    type Output = MessageFlags;

    fn bitor(self, rhs: MessageFlags) -> MessageFlags {
        MessageFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for MessageFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// One message frame: `flags: u32`, `length: u32`, then `length` payload bytes.
///
/// Header integers are big-endian on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFrame {
    pub flags: MessageFlags,
    pub payload: Bytes,
}

impl MessageFrame {
    pub fn new(flags: MessageFlags, payload: impl Into<Bytes>) -> Self {
        Self { flags, payload: payload.into() }
    }

    /// Number of bytes [`MessageFrame::encode`] produces.
    pub fn encoded_len(&self) -> usize {
        MESSAGE_HEADER_LEN + self.payload.len()
    }

    /// Serializes the frame into a single contiguous buffer.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let len = u32::try_from(self.payload.len())
            .map_err(|_| ProtocolError::FrameTooLarge(self.payload.len()))?;
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u32(self.flags.bits());
        buf.put_u32(len);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Reads exactly one frame, rejecting declared lengths above `max_len`
    /// before the payload buffer is allocated.
    pub async fn read_from<R>(reader: &mut R, max_len: u32) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; MESSAGE_HEADER_LEN];
        read_full(reader, &mut header).await?;

        let flags = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if len > max_len {
            return Err(ProtocolError::MessageTooLong { len, max: max_len });
        }

        let mut payload = vec![0u8; len as usize];
        read_full(reader, &mut payload).await?;

        Ok(Self {
            flags: MessageFlags::from_bits(flags),
            payload: Bytes::from(payload),
        })
    }
}

/// Serializes a handshake: the name length followed by the raw name bytes.
pub fn encode_handshake(name: &[u8]) -> Result<Bytes, ProtocolError> {
    let len = u32::try_from(name.len()).map_err(|_| ProtocolError::FrameTooLarge(name.len()))?;
    let mut buf = BytesMut::with_capacity(HANDSHAKE_HEADER_LEN + name.len());
    buf.put_u32(len);
    buf.put_slice(name);
    Ok(buf.freeze())
}

/// Reads a handshake and returns the raw display name bytes.
pub async fn read_handshake<R>(reader: &mut R, max_len: u32) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HANDSHAKE_HEADER_LEN];
    read_full(reader, &mut header).await?;

    let len = u32::from_be_bytes(header);
    if len > max_len {
        return Err(ProtocolError::NameTooLong { len, max: max_len });
    }

    let mut name = vec![0u8; len as usize];
    read_full(reader, &mut name).await?;
    Ok(name)
}

/// Fills `buf` completely, looping over short reads.
///
/// End of stream before the buffer is full is reported as
/// [`ProtocolError::Disconnected`].
pub async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(ProtocolError::Disconnected),
        Err(e) => Err(ProtocolError::Io(e)),
    }
}

/// Turns a typed line into the flags and text a participant sends.
///
/// `/me` and `/urg` are matched case-insensitively and only when the line is
/// longer than the command; the command and the character after it are
/// stripped. Anything else is sent verbatim with no flags.
pub fn parse_command(line: &str) -> (MessageFlags, &str) {
    const COMMANDS: [(&str, MessageFlags); 2] = [
        ("/me", MessageFlags::ME),
        ("/urg", MessageFlags::URG),
    ];

    for (command, flags) in COMMANDS {
        let strip = command.len() + 1;
        let matches = line
            .get(..command.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(command));
        if matches && line.len() > strip {
            if let Some(rest) = line.get(strip..) {
                return (flags, rest);
            }
        }
    }

    (MessageFlags::NONE, line)
}
