/// Datagram format for the chunk-transfer protocol.
///
/// ```text
/// [0..2]  Magic "OS"
/// [2]     Protocol version (1)
/// [3]     Packet kind (1 metadata, 2 chunk, 3 request-missing, 4 ack)
/// [4..]   Body, big-endian
///
/// Metadata:        file_size u64 | total_chunks u64 | name_len u16 | name
/// Chunk:           sequence u64  | data_len u16     | data (<= 1024 bytes)
/// RequestMissing:  count u32     | count x sequence u64
/// Ack:             sequence u64  (u64::MAX = transfer complete)
/// ```
///
/// Every encoded packet fits in a single UDP datagram (65507 bytes).
use std::ops::Range;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic bytes at the start of every datagram.
pub const MAGIC: [u8; 2] = *b"OS";

/// Wire format version.
pub const VERSION: u8 = 1;

/// Header size in bytes (magic + version + kind).
pub const HEADER_SIZE: usize = 4;

/// Chunk payload size: 1 KB. Only the final chunk of a file may be shorter.
pub const CHUNK_SIZE: usize = 1024;

/// Largest UDP payload over IPv4 (65535 - 20 IP - 8 UDP).
pub const MAX_DATAGRAM: usize = 65_507;

/// Longest file name carried in a metadata packet, in bytes.
pub const MAX_FILE_NAME_LEN: usize = 1024;

/// Largest file a Metadata packet may announce (10 GiB). Bounds the memory a
/// session's bitfield and missing-index lists can take.
pub const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Ack sequence number meaning "all chunks received".
pub const ACK_COMPLETE: u64 = u64::MAX;

/// Most indices a single RequestMissing datagram can carry:
/// (65507 - 4 header - 4 count) / 8 = 8187.
pub const MAX_MISSING_PER_PACKET: usize = (MAX_DATAGRAM - HEADER_SIZE - 4) / 8;

/// How often the receiver scans its sessions for stalls.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Silence after which the sweeper asks the sender for missing chunks.
pub const STALL_THRESHOLD: Duration = Duration::from_secs(5);

/// Silence (no chunk arrivals) after which a session is abandoned.
pub const REAP_AFTER: Duration = Duration::from_secs(30);

/// How long the sender waits for the terminal ack.
pub const ACK_WAIT: Duration = Duration::from_secs(10);

/// OS receive buffer requested for the receiver socket (8 MB).
pub const UDP_RECV_BUFFER: usize = 8 * 1024 * 1024;

const KIND_METADATA: u8 = 1;
const KIND_CHUNK: u8 = 2;
const KIND_REQUEST_MISSING: u8 = 3;
const KIND_ACK: u8 = 4;

/// One protocol message. Each datagram carries exactly one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Announces a file. Sent once, first, by the sender.
    Metadata {
        file_name: String,
        file_size: u64,
        total_chunks: u64,
    },
    /// A slice of the file at `sequence_number * CHUNK_SIZE`.
    Chunk { sequence_number: u64, data: Bytes },
    /// Receiver asks the sender to retransmit these chunks.
    RequestMissing { sequence_numbers: Vec<u64> },
    /// Terminal acknowledgment, see [`ACK_COMPLETE`].
    Ack { sequence_number: u64 },
}

/// Reasons a datagram could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("datagram too short ({0} bytes)")]
    TooShort(usize),
    #[error("bad magic {0:02x?}")]
    BadMagic([u8; 2]),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown packet kind {0}")]
    UnknownKind(u8),
    #[error("truncated {0} packet")]
    Truncated(&'static str),
    #[error("file name length {0} out of range")]
    FileNameLength(usize),
    #[error("file name is not valid UTF-8")]
    FileNameEncoding,
    #[error("chunk data of {0} bytes exceeds chunk size")]
    ChunkTooLarge(usize),
    #[error("request lists {0} indices, more than fit in a datagram")]
    TooManyIndices(usize),
    #[error("{0} trailing bytes after packet body")]
    TrailingBytes(usize),
}

impl Packet {
    /// Human-readable packet kind, used in logs.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Metadata { .. } => "metadata",
            Self::Chunk { .. } => "chunk",
            Self::RequestMissing { .. } => "request_missing",
            Self::Ack { .. } => "ack",
        }
    }

    fn kind(&self) -> u8 {
        match self {
            Self::Metadata { .. } => KIND_METADATA,
            Self::Chunk { .. } => KIND_CHUNK,
            Self::RequestMissing { .. } => KIND_REQUEST_MISSING,
            Self::Ack { .. } => KIND_ACK,
        }
    }

    /// Size of the encoded datagram in bytes.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE
            + match self {
                Self::Metadata { file_name, .. } => 8 + 8 + 2 + file_name.len(),
                Self::Chunk { data, .. } => 8 + 2 + data.len(),
                Self::RequestMissing { sequence_numbers } => 4 + 8 * sequence_numbers.len(),
                Self::Ack { .. } => 8,
            }
    }

    /// Serialize into a datagram.
    ///
    /// File names longer than [`MAX_FILE_NAME_LEN`], chunk data longer than
    /// [`CHUNK_SIZE`] and requests longer than [`MAX_MISSING_PER_PACKET`]
    /// cannot be represented; callers validate these before encoding.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_slice(&MAGIC);
        buf.put_u8(VERSION);
        buf.put_u8(self.kind());

        match self {
            Self::Metadata {
                file_name,
                file_size,
                total_chunks,
            } => {
                debug_assert!(file_name.len() <= MAX_FILE_NAME_LEN);
                buf.put_u64(*file_size);
                buf.put_u64(*total_chunks);
                buf.put_u16(file_name.len() as u16);
                buf.put_slice(file_name.as_bytes());
            }
            Self::Chunk {
                sequence_number,
                data,
            } => {
                debug_assert!(data.len() <= CHUNK_SIZE);
                buf.put_u64(*sequence_number);
                buf.put_u16(data.len() as u16);
                buf.put_slice(data);
            }
            Self::RequestMissing { sequence_numbers } => {
                debug_assert!(sequence_numbers.len() <= MAX_MISSING_PER_PACKET);
                buf.put_u32(sequence_numbers.len() as u32);
                for seq in sequence_numbers {
                    buf.put_u64(*seq);
                }
            }
            Self::Ack { sequence_number } => {
                buf.put_u64(*sequence_number);
            }
        }

        buf.freeze()
    }

    /// Parse a datagram. Rejects anything that is not exactly one well-formed packet.
    pub fn decode(datagram: &[u8]) -> Result<Self, DecodeError> {
        if datagram.len() < HEADER_SIZE {
            return Err(DecodeError::TooShort(datagram.len()));
        }
        if datagram[0..2] != MAGIC {
            return Err(DecodeError::BadMagic([datagram[0], datagram[1]]));
        }
        if datagram[2] != VERSION {
            return Err(DecodeError::UnsupportedVersion(datagram[2]));
        }

        let mut body = &datagram[HEADER_SIZE..];
        let packet = match datagram[3] {
            KIND_METADATA => {
                need(&body, 8 + 8 + 2, "metadata")?;
                let file_size = body.get_u64();
                let total_chunks = body.get_u64();
                let name_len = body.get_u16() as usize;
                if name_len == 0 || name_len > MAX_FILE_NAME_LEN {
                    return Err(DecodeError::FileNameLength(name_len));
                }
                need(&body, name_len, "metadata")?;
                let file_name = std::str::from_utf8(&body[..name_len])
                    .map_err(|_| DecodeError::FileNameEncoding)?
                    .to_owned();
                body.advance(name_len);
                Self::Metadata {
                    file_name,
                    file_size,
                    total_chunks,
                }
            }
            KIND_CHUNK => {
                need(&body, 8 + 2, "chunk")?;
                let sequence_number = body.get_u64();
                let data_len = body.get_u16() as usize;
                if data_len > CHUNK_SIZE {
                    return Err(DecodeError::ChunkTooLarge(data_len));
                }
                need(&body, data_len, "chunk")?;
                let data = Bytes::copy_from_slice(&body[..data_len]);
                body.advance(data_len);
                Self::Chunk {
                    sequence_number,
                    data,
                }
            }
            KIND_REQUEST_MISSING => {
                need(&body, 4, "request_missing")?;
                let count = body.get_u32() as usize;
                if count > MAX_MISSING_PER_PACKET {
                    return Err(DecodeError::TooManyIndices(count));
                }
                need(&body, count * 8, "request_missing")?;
                let sequence_numbers = (0..count).map(|_| body.get_u64()).collect();
                Self::RequestMissing { sequence_numbers }
            }
            KIND_ACK => {
                need(&body, 8, "ack")?;
                Self::Ack {
                    sequence_number: body.get_u64(),
                }
            }
            other => return Err(DecodeError::UnknownKind(other)),
        };

        if body.has_remaining() {
            return Err(DecodeError::TrailingBytes(body.remaining()));
        }
        Ok(packet)
    }
}

fn need(body: &[u8], len: usize, kind: &'static str) -> Result<(), DecodeError> {
    if body.len() < len {
        return Err(DecodeError::Truncated(kind));
    }
    Ok(())
}

/// Number of chunks needed for a file: ceil(file_size / CHUNK_SIZE).
pub fn total_chunks(file_size: u64) -> u64 {
    file_size.div_ceil(CHUNK_SIZE as u64)
}

/// Byte offset of a chunk within the file.
pub fn chunk_offset(sequence_number: u64) -> u64 {
    sequence_number.saturating_mul(CHUNK_SIZE as u64)
}

/// Byte range a chunk covers, or `None` if the index is past the end of the file.
pub fn chunk_range(sequence_number: u64, file_size: u64) -> Option<Range<u64>> {
    if sequence_number >= total_chunks(file_size) {
        return None;
    }
    let start = chunk_offset(sequence_number);
    let end = (start + CHUNK_SIZE as u64).min(file_size);
    Some(start..end)
}

/// Split a missing-index list into as many RequestMissing packets as needed.
pub fn request_missing_packets(missing: &[u64]) -> impl Iterator<Item = Packet> + '_ {
    missing
        .chunks(MAX_MISSING_PER_PACKET)
        .map(|batch| Packet::RequestMissing {
            sequence_numbers: batch.to_vec(),
        })
}
