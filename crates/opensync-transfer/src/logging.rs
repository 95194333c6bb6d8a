/// Transfer logging trait for structured protocol events.
///
/// The receiver, sweeper and sender report lifecycle events through a
/// [`TransferLogger`] so callers can route them to `tracing`, collect them in
/// tests, or drop them.

use std::fmt;
use std::net::SocketAddr;

/// Structured log entry for a transfer operation.
#[derive(Debug, Clone)]
pub struct TransferLog {
    pub component: &'static str,
    /// The remote end: the sender's address on the receiver, the receiver's on the sender.
    pub peer: SocketAddr,
    pub event: TransferEvent,
}

/// Transfer events that can be logged.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// Receiver: metadata accepted, output file pre-sized
    SessionOpened {
        file_name: String,
        file_size: u64,
        total_chunks: u64,
    },
    /// Receiver: new metadata from an address that already had a session
    SessionReplaced {
        file_name: String,
    },
    /// Receiver: chunk written at its offset
    ChunkStored {
        sequence_number: u64,
        received: u64,
        total_chunks: u64,
    },
    /// Receiver: chunk dropped without being written
    ChunkRejected {
        sequence_number: u64,
        reason: String,
    },
    /// Sweeper: retransmission requested for a stalled session
    MissingRequested {
        missing_count: usize,
        first_missing: u64,
    },
    /// Receiver: all chunks received, terminal ack sent
    SessionCompleted {
        file_name: String,
        total_chunks: u64,
        duration_ms: u64,
    },
    /// Receiver: digest of a completed file
    FileDigest {
        file_name: String,
        sha256: String,
    },
    /// Sweeper: silent session abandoned
    SessionReaped {
        file_name: String,
        received: u64,
        total_chunks: u64,
    },
    /// Sender: metadata sent
    TransferStarted {
        file_name: String,
        file_size: u64,
        total_chunks: u64,
    },
    /// Sender: first pass over all chunks finished
    ChunksBlasted {
        sent: u64,
        failed: u64,
    },
    /// Sender: chunks resent after a RequestMissing
    Retransmitted {
        requested: usize,
        sent: usize,
    },
    /// Sender: terminal ack received
    AckReceived {
        duration_ms: u64,
    },
    /// Sender: gave up waiting for the terminal ack
    AckTimeout {
        waited_ms: u64,
    },
    /// Error occurred
    Error {
        message: String,
    },
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionOpened { file_name, file_size, total_chunks } => {
                write!(f, "session_opened file={file_name} size={file_size} chunks={total_chunks}")
            }
            Self::SessionReplaced { file_name } => {
                write!(f, "session_replaced previous_file={}", file_name)
            }
            Self::ChunkStored { sequence_number, received, total_chunks } => {
                write!(f, "chunk_stored seq={sequence_number} progress={received}/{total_chunks}")
            }
            Self::ChunkRejected { sequence_number, reason } => {
                write!(f, "chunk_rejected seq={} reason={}", sequence_number, reason)
            }
            Self::MissingRequested { missing_count, first_missing } => {
                write!(f, "missing_requested count={} first={}", missing_count, first_missing)
            }
            Self::SessionCompleted { file_name, total_chunks, duration_ms } => {
                write!(
                    f,
                    "session_completed file={} chunks={} duration_ms={}",
                    file_name, total_chunks, duration_ms
                )
            }
            Self::FileDigest { file_name, sha256 } => {
                write!(f, "file_digest file={} sha256={}", file_name, sha256)
            }
            Self::SessionReaped { file_name, received, total_chunks } => {
                write!(f, "session_reaped file={file_name} progress={received}/{total_chunks}")
            }
            Self::TransferStarted { file_name, file_size, total_chunks } => {
                write!(
                    f,
                    "transfer_started file={file_name} size={file_size} chunks={total_chunks}"
                )
            }
            Self::ChunksBlasted { sent, failed } => {
                write!(f, "chunks_blasted sent={} failed={}", sent, failed)
            }
            Self::Retransmitted { requested, sent } => {
                write!(f, "retransmitted requested={} sent={}", requested, sent)
            }
            Self::AckReceived { duration_ms } => {
                write!(f, "ack_received duration_ms={}", duration_ms)
            }
            Self::AckTimeout { waited_ms } => {
                write!(f, "ack_timeout waited_ms={}", waited_ms)
            }
            Self::Error { message } => {
                write!(f, "error: {}", message)
            }
        }
    }
}

/// Trait for transfer logging. Implementations can write to tracing,
/// collect entries, or discard them.
pub trait TransferLogger: Send + Sync {
    fn log(&self, entry: TransferLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl TransferLogger for TracingLogger {
    fn log(&self, entry: TransferLog) {
        let peer = entry.peer.to_string();
        // info for lifecycle, debug for per-chunk spam, warn when something was lost
        match &entry.event {
            TransferEvent::ChunkStored { .. }
            | TransferEvent::ChunksBlasted { .. }
            | TransferEvent::Retransmitted { .. } => {
                tracing::debug!(component = entry.component, peer = %peer, "{}", entry.event);
            }
            TransferEvent::ChunkRejected { .. }
            | TransferEvent::SessionReaped { .. }
            | TransferEvent::AckTimeout { .. }
            | TransferEvent::Error { .. } => {
                tracing::warn!(component = entry.component, peer = %peer, "{}", entry.event);
            }
            _ => {
                tracing::info!(component = entry.component, peer = %peer, "{}", entry.event);
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl TransferLogger for NullLogger {
    fn log(&self, _entry: TransferLog) {}
}
