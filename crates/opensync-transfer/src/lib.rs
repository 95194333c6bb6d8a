/// OpenSync Transfer: reliable file delivery over UDP.
///
/// Adds a minimal reliability layer on top of plain datagrams:
/// - Metadata first, then fixed 1 KB chunks written at deterministic offsets
/// - Per-session received-chunk bitfield, keyed by sender address
/// - Timeout-driven NACK: a sweeper asks for missing chunks after a stall
/// - Single terminal ACK once every chunk has landed
/// - Sender waits for that ACK with a bounded timeout

pub mod bitfield;
pub mod logging;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod session;

// Re-export key types for convenience.
pub use bitfield::ChunkBitfield;
pub use logging::{NullLogger, TracingLogger, TransferEvent, TransferLog, TransferLogger};
pub use protocol::{
    ACK_COMPLETE, ACK_WAIT, CHUNK_SIZE, DecodeError, MAX_DATAGRAM, MAX_FILE_SIZE, Packet,
    REAP_AFTER, STALL_THRESHOLD, SWEEP_INTERVAL, chunk_range, total_chunks,
};
pub use receiver::{ReceiverConfig, ReceiverHandle, file_sha256};
pub use sender::{SendError, SendResult, SenderConfig, send_payload};
pub use session::{
    ChunkAdmission, ChunkError, ChunkOutcome, PendingWrite, Session, SessionError, SessionTable,
    SweepAction, sanitize_file_name,
};
