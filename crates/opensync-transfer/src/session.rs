/// Receiver-side session bookkeeping.
///
/// A session is keyed by the sender's socket address and lives from the
/// sender's Metadata until every chunk index has been written (completion) or
/// the sweeper gives up on it (reap). The table itself does no networking and
/// no chunk I/O: callers admit a chunk, write it with the table unlocked, then
/// commit it.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bitfield::ChunkBitfield;
use crate::protocol::{MAX_FILE_SIZE, chunk_range, total_chunks};

/// Metadata that cannot start a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("unusable file name {0:?}")]
    InvalidFileName(String),
    #[error("file size {0} exceeds the {max} byte limit", max = MAX_FILE_SIZE)]
    TooLarge(u64),
    #[error("metadata declares {declared} chunks but {file_size} bytes need {expected}")]
    ChunkCountMismatch {
        declared: u64,
        expected: u64,
        file_size: u64,
    },
    #[error("cannot create {}: {source}", .path.display())]
    Create { path: PathBuf, source: io::Error },
}

/// Chunk that was not stored.
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("no session for sender")]
    UnknownSession,
    #[error("index out of range for {total_chunks} chunks")]
    OutOfRange { total_chunks: u64 },
    #[error("expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: u64, actual: usize },
    #[error("write failed: {0}")]
    Write(#[from] io::Error),
}

/// Admission decision for an arriving chunk.
#[derive(Debug)]
pub enum ChunkAdmission {
    /// Write the data, then [`SessionTable::commit_chunk`].
    Write(PendingWrite),
    /// Already had this index; nothing to write.
    Duplicate,
}

/// A validated chunk write, performed without holding the table.
#[derive(Debug)]
pub struct PendingWrite {
    file: Arc<File>,
    sequence_number: u64,
    offset: u64,
}

impl PendingWrite {
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// Blocking positioned write. The ingest loop issues at most one write
    /// at a time, so the shared cursor is not contended.
    pub fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut file = &*self.file;
        file.seek(SeekFrom::Start(self.offset))?;
        file.write_all(data)
    }
}

/// Result of a stored chunk.
#[derive(Debug)]
pub enum ChunkOutcome {
    Stored { received: u64, total_chunks: u64 },
    /// Already had this index; nothing written.
    Duplicate,
    /// Last missing chunk arrived. The session is no longer in the table.
    Completed(Session),
}

/// Work the sweeper decided on. Sending and closing happen outside the table.
#[derive(Debug)]
pub enum SweepAction {
    RequestMissing {
        peer: SocketAddr,
        file_name: String,
        missing: Vec<u64>,
    },
    Reaped { peer: SocketAddr, session: Session },
}

/// One in-progress file reception.
#[derive(Debug)]
pub struct Session {
    file_name: String,
    path: PathBuf,
    file: Arc<File>,
    file_size: u64,
    received: ChunkBitfield,
    started_at: Instant,
    /// Refreshed by chunk arrivals and by retransmission requests (cooldown).
    last_activity: Instant,
    /// Refreshed by chunk arrivals only.
    last_chunk_at: Instant,
}

impl Session {
    /// Validate metadata and create the output file pre-sized to `file_size`.
    ///
    /// Blocking; the receiver calls it from `spawn_blocking`.
    pub fn create(
        output_dir: &Path,
        file_name: &str,
        file_size: u64,
        declared_chunks: u64,
        now: Instant,
    ) -> Result<Self, SessionError> {
        if file_size > MAX_FILE_SIZE {
            return Err(SessionError::TooLarge(file_size));
        }
        let expected = total_chunks(file_size);
        if declared_chunks != expected {
            return Err(SessionError::ChunkCountMismatch {
                declared: declared_chunks,
                expected,
                file_size,
            });
        }

        let file_name = sanitize_file_name(file_name)
            .ok_or_else(|| SessionError::InvalidFileName(file_name.to_owned()))?;
        let path = output_dir.join(&file_name);

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .and_then(|file| file.set_len(file_size).map(|_| file))
            .map_err(|source| SessionError::Create {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            file_name,
            path,
            file: Arc::new(file),
            file_size,
            received: ChunkBitfield::new(expected),
            started_at: now,
            last_activity: now,
            last_chunk_at: now,
        })
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn total_chunks(&self) -> u64 {
        self.received.total()
    }

    pub fn received(&self) -> u64 {
        self.received.received()
    }

    pub fn is_complete(&self) -> bool {
        self.received.is_complete()
    }

    pub fn missing(&self) -> Vec<u64> {
        self.received.missing()
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Flush and close the output file, returning its path. Blocking.
    pub fn close(self) -> io::Result<PathBuf> {
        (&*self.file).flush()?;
        Ok(self.path)
    }
}

/// Sessions by sender address.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<SocketAddr, Session>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, peer: &SocketAddr) -> Option<&Session> {
        self.sessions.get(peer)
    }

    /// Install a session for `peer`, returning the one it replaced, if any.
    pub fn open(&mut self, peer: SocketAddr, session: Session) -> Option<Session> {
        self.sessions.insert(peer, session)
    }

    pub fn remove(&mut self, peer: &SocketAddr) -> Option<Session> {
        self.sessions.remove(peer)
    }

    /// Validate a chunk against its session and decide whether it needs writing.
    ///
    /// Valid chunks, duplicates included, refresh the session's activity.
    pub fn admit_chunk(
        &mut self,
        peer: SocketAddr,
        sequence_number: u64,
        data_len: usize,
        now: Instant,
    ) -> Result<ChunkAdmission, ChunkError> {
        let session = self
            .sessions
            .get_mut(&peer)
            .ok_or(ChunkError::UnknownSession)?;

        let range = chunk_range(sequence_number, session.file_size).ok_or(
            ChunkError::OutOfRange {
                total_chunks: session.total_chunks(),
            },
        )?;
        let expected = range.end - range.start;
        if data_len as u64 != expected {
            return Err(ChunkError::LengthMismatch {
                expected,
                actual: data_len,
            });
        }

        session.last_activity = now;
        session.last_chunk_at = now;

        if session.received.get(sequence_number) {
            return Ok(ChunkAdmission::Duplicate);
        }
        Ok(ChunkAdmission::Write(PendingWrite {
            file: session.file.clone(),
            sequence_number,
            offset: range.start,
        }))
    }

    /// Mark a written chunk received, removing the session once it is complete.
    ///
    /// Fails with `UnknownSession` if the session was reaped or replaced while
    /// the write was in flight.
    pub fn commit_chunk(
        &mut self,
        peer: SocketAddr,
        write: &PendingWrite,
        now: Instant,
    ) -> Result<ChunkOutcome, ChunkError> {
        let session = self
            .sessions
            .get_mut(&peer)
            .filter(|session| Arc::ptr_eq(&session.file, &write.file))
            .ok_or(ChunkError::UnknownSession)?;

        session.last_chunk_at = now;
        if !session.received.set(write.sequence_number) {
            return Ok(ChunkOutcome::Duplicate);
        }

        if !session.is_complete() {
            return Ok(ChunkOutcome::Stored {
                received: session.received(),
                total_chunks: session.total_chunks(),
            });
        }

        self.sessions
            .remove(&peer)
            .map(ChunkOutcome::Completed)
            .ok_or(ChunkError::UnknownSession)
    }

    /// Admit, write and commit in one call. The write blocks with the table
    /// borrowed, so this suits callers that already run off the async runtime.
    ///
    /// A write failure leaves the index unmarked so the sweeper asks for it again.
    pub fn record_chunk(
        &mut self,
        peer: SocketAddr,
        sequence_number: u64,
        data: &[u8],
        now: Instant,
    ) -> Result<ChunkOutcome, ChunkError> {
        match self.admit_chunk(peer, sequence_number, data.len(), now)? {
            ChunkAdmission::Duplicate => Ok(ChunkOutcome::Duplicate),
            ChunkAdmission::Write(write) => {
                write.write(data)?;
                self.commit_chunk(peer, &write, now)
            }
        }
    }

    /// Decide what to do about stalled sessions.
    ///
    /// Sessions with no chunk for `reap_after` (or complete but still present)
    /// are removed. Sessions idle for `stall_threshold` get a retransmission
    /// request and their `last_activity` refreshed so the next request waits
    /// another full threshold.
    pub fn sweep(
        &mut self,
        now: Instant,
        stall_threshold: Duration,
        reap_after: Duration,
    ) -> Vec<SweepAction> {
        let mut actions = Vec::new();
        let mut reap = Vec::new();

        for (peer, session) in self.sessions.iter_mut() {
            if session.is_complete() || now.duration_since(session.last_chunk_at) >= reap_after {
                reap.push(*peer);
                continue;
            }
            if now.duration_since(session.last_activity) < stall_threshold {
                continue;
            }

            session.last_activity = now;
            let missing = session.missing();
            if !missing.is_empty() {
                actions.push(SweepAction::RequestMissing {
                    peer: *peer,
                    file_name: session.file_name.clone(),
                    missing,
                });
            }
        }

        for peer in reap {
            if let Some(session) = self.sessions.remove(&peer) {
                actions.push(SweepAction::Reaped { peer, session });
            }
        }

        actions
    }
}

/// Reduce a sender-supplied name to its final path component.
///
/// Returns `None` for names that would escape or name the output directory.
pub fn sanitize_file_name(raw: &str) -> Option<String> {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw).trim();
    if base.is_empty() || base == "." || base == ".." || base.contains('\0') {
        return None;
    }
    Some(base.to_owned())
}
