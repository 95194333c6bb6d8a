/// UDP receiver: ingest loop + sweeper sharing one session table.
///
/// ```text
/// [Ingest]  recv_from() -> decode -> Metadata: open session (pre-sized file)
///                                    Chunk:    write at offset, ack when complete
/// [Sweeper] every 1s -> stalled sessions: RequestMissing to the sender
///                       silent sessions:  reap
/// ```
///
/// Both tasks lock the table only to read or mutate it. Every network send,
/// file operation and the completion bookkeeping happen after the lock is
/// released; file operations run on the blocking pool.

use std::io::{self, Read};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::logging::{TracingLogger, TransferEvent, TransferLog, TransferLogger};
use crate::protocol::*;
use crate::session::{ChunkAdmission, ChunkOutcome, Session, SessionTable, SweepAction};

/// Configuration for the receiver.
#[derive(Clone)]
pub struct ReceiverConfig {
    /// Directory completed and in-progress files are written to.
    pub output_dir: PathBuf,
    pub sweep_interval: Duration,
    pub stall_threshold: Duration,
    pub reap_after: Duration,
    pub logger: Arc<dyn TransferLogger>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("downloads"),
            sweep_interval: SWEEP_INTERVAL,
            stall_threshold: STALL_THRESHOLD,
            reap_after: REAP_AFTER,
            logger: Arc::new(TracingLogger),
        }
    }
}

/// Running receiver. Dropping the handle leaves the tasks running; call
/// [`ReceiverHandle::shutdown`] to stop them.
pub struct ReceiverHandle {
    local_addr: SocketAddr,
    sessions: Arc<Mutex<SessionTable>>,
    ingest: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

impl ReceiverHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of receptions currently in progress.
    pub async fn active_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Stop the ingest and sweep tasks. Open sessions are dropped.
    pub fn shutdown(&self) {
        self.ingest.abort();
        self.sweeper.abort();
    }
}

/// Bind the receive socket and start the receiver.
///
/// Failing to bind is the only error; everything after that is logged and survived.
pub async fn bind(addr: SocketAddr, config: ReceiverConfig) -> io::Result<ReceiverHandle> {
    let socket = UdpSocket::bind(addr).await?;
    let sock_ref = socket2::SockRef::from(&socket);
    if let Err(e) = sock_ref.set_recv_buffer_size(UDP_RECV_BUFFER) {
        warn!("receiver: failed to set recv buffer: {}", e);
    }
    spawn(socket, config)
}

/// Start the ingest loop and sweeper on an already-bound socket.
pub fn spawn(socket: UdpSocket, config: ReceiverConfig) -> io::Result<ReceiverHandle> {
    std::fs::create_dir_all(&config.output_dir)?;
    let local_addr = socket.local_addr()?;

    let receiver = Receiver {
        socket: Arc::new(socket),
        sessions: Arc::new(Mutex::new(SessionTable::new())),
        config: Arc::new(config),
    };
    let sessions = receiver.sessions.clone();

    info!(
        "receiver: listening on {} (output dir {})",
        local_addr,
        receiver.config.output_dir.display()
    );

    let ingest = tokio::spawn(receiver.clone().run_ingest());
    let sweeper = tokio::spawn(receiver.run_sweeper());

    Ok(ReceiverHandle {
        local_addr,
        sessions,
        ingest,
        sweeper,
    })
}

#[derive(Clone)]
struct Receiver {
    socket: Arc<UdpSocket>,
    sessions: Arc<Mutex<SessionTable>>,
    config: Arc<ReceiverConfig>,
}

impl Receiver {
    async fn run_ingest(self) {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let (len, src) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    // ICMP port unreachable from an earlier send surfaces here on some platforms.
                    if e.kind() != io::ErrorKind::ConnectionReset {
                        warn!("receiver: recv error: {}", e);
                    }
                    continue;
                }
            };

            match Packet::decode(&buf[..len]) {
                Ok(packet) => self.handle_packet(packet, src).await,
                Err(e) => warn!(peer = %src, "receiver: dropping malformed datagram: {}", e),
            }
        }
    }

    async fn handle_packet(&self, packet: Packet, src: SocketAddr) {
        match packet {
            Packet::Metadata {
                file_name,
                file_size,
                total_chunks,
            } => self.open_session(src, &file_name, file_size, total_chunks).await,
            Packet::Chunk {
                sequence_number,
                data,
            } => self.store_chunk(src, sequence_number, data).await,
            other => debug!(
                peer = %src,
                kind = other.kind_name(),
                "receiver: ignoring sender-bound packet"
            ),
        }
    }

    async fn open_session(
        &self,
        src: SocketAddr,
        file_name: &str,
        file_size: u64,
        total_chunks: u64,
    ) {
        let output_dir = self.config.output_dir.clone();
        let name = file_name.to_owned();
        let created = tokio::task::spawn_blocking(move || {
            Session::create(&output_dir, &name, file_size, total_chunks, Instant::now())
        })
        .await;

        let session = match created {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                self.log("receiver", src, TransferEvent::Error {
                    message: format!("metadata dropped: {}", e),
                });
                return;
            }
            Err(e) => {
                self.log("receiver", src, TransferEvent::Error {
                    message: format!("session setup task failed: {}", e),
                });
                return;
            }
        };

        self.log("receiver", src, TransferEvent::SessionOpened {
            file_name: session.file_name().to_owned(),
            file_size,
            total_chunks,
        });

        // An empty file has nothing to wait for, but still displaces the
        // sender's previous session.
        let (replaced, empty) = {
            let mut sessions = self.sessions.lock().await;
            if session.is_complete() {
                (sessions.remove(&src), Some(session))
            } else {
                (sessions.open(src, session), None)
            }
        };

        if let Some(previous) = replaced {
            self.log("receiver", src, TransferEvent::SessionReplaced {
                file_name: previous.file_name().to_owned(),
            });
        }
        if let Some(session) = empty {
            self.complete(src, session).await;
        }
    }

    async fn store_chunk(&self, src: SocketAddr, sequence_number: u64, data: Bytes) {
        let admission =
            self.sessions
                .lock()
                .await
                .admit_chunk(src, sequence_number, data.len(), Instant::now());

        let pending = match admission {
            Ok(ChunkAdmission::Write(pending)) => pending,
            Ok(ChunkAdmission::Duplicate) => {
                debug!(peer = %src, "receiver: duplicate chunk {}", sequence_number);
                return;
            }
            Err(e) => {
                self.log("receiver", src, TransferEvent::ChunkRejected {
                    sequence_number,
                    reason: e.to_string(),
                });
                return;
            }
        };

        let written =
            tokio::task::spawn_blocking(move || pending.write(&data).map(|_| pending)).await;
        let pending = match written {
            Ok(Ok(pending)) => pending,
            // Left unmarked; the sweeper will ask for it again.
            Ok(Err(e)) => {
                self.log("receiver", src, TransferEvent::ChunkRejected {
                    sequence_number,
                    reason: format!("write failed: {}", e),
                });
                return;
            }
            Err(e) => {
                self.log("receiver", src, TransferEvent::Error {
                    message: format!("chunk write task failed: {}", e),
                });
                return;
            }
        };

        let outcome = self
            .sessions
            .lock()
            .await
            .commit_chunk(src, &pending, Instant::now());

        match outcome {
            Ok(ChunkOutcome::Stored {
                received,
                total_chunks,
            }) => self.log("receiver", src, TransferEvent::ChunkStored {
                sequence_number,
                received,
                total_chunks,
            }),
            Ok(ChunkOutcome::Duplicate) => {
                debug!(peer = %src, "receiver: duplicate chunk {}", sequence_number)
            }
            Ok(ChunkOutcome::Completed(session)) => self.complete(src, session).await,
            Err(e) => self.log("receiver", src, TransferEvent::ChunkRejected {
                sequence_number,
                reason: e.to_string(),
            }),
        }
    }

    /// Close the file, send the terminal ack, then digest the file off the runtime.
    async fn complete(&self, peer: SocketAddr, session: Session) {
        let file_name = session.file_name().to_owned();
        let total_chunks = session.total_chunks();
        let duration_ms = session.started_at().elapsed().as_millis() as u64;

        let path = match tokio::task::spawn_blocking(move || session.close()).await {
            Ok(Ok(path)) => path,
            Ok(Err(e)) => {
                self.log("receiver", peer, TransferEvent::Error {
                    message: format!("closing {} failed: {}", file_name, e),
                });
                return;
            }
            Err(e) => {
                self.log("receiver", peer, TransferEvent::Error {
                    message: format!("close task for {} failed: {}", file_name, e),
                });
                return;
            }
        };

        let ack = Packet::Ack {
            sequence_number: ACK_COMPLETE,
        };
        if let Err(e) = self.socket.send_to(&ack.encode(), peer).await {
            self.log("receiver", peer, TransferEvent::Error {
                message: format!("ack send failed: {}", e),
            });
        }

        self.log("receiver", peer, TransferEvent::SessionCompleted {
            file_name: file_name.clone(),
            total_chunks,
            duration_ms,
        });

        let logger = self.config.logger.clone();
        tokio::spawn(async move {
            let event = match tokio::task::spawn_blocking(move || file_sha256(&path)).await {
                Ok(Ok(sha256)) => TransferEvent::FileDigest { file_name, sha256 },
                Ok(Err(e)) => TransferEvent::Error {
                    message: format!("digest of {} failed: {}", file_name, e),
                },
                Err(e) => TransferEvent::Error {
                    message: format!("digest task failed: {}", e),
                },
            };
            logger.log(TransferLog {
                component: "receiver",
                peer,
                event,
            });
        });
    }

    async fn run_sweeper(self) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let actions = self.sessions.lock().await.sweep(
                Instant::now(),
                self.config.stall_threshold,
                self.config.reap_after,
            );

            for action in actions {
                match action {
                    SweepAction::RequestMissing { peer, missing, .. } => {
                        self.log("sweeper", peer, TransferEvent::MissingRequested {
                            missing_count: missing.len(),
                            first_missing: missing[0],
                        });
                        for packet in request_missing_packets(&missing) {
                            if let Err(e) = self.socket.send_to(&packet.encode(), peer).await {
                                self.log("sweeper", peer, TransferEvent::Error {
                                    message: format!("retransmission request failed: {}", e),
                                });
                            }
                        }
                    }
                    SweepAction::Reaped { peer, session } => {
                        self.log("sweeper", peer, TransferEvent::SessionReaped {
                            file_name: session.file_name().to_owned(),
                            received: session.received(),
                            total_chunks: session.total_chunks(),
                        });
                        tokio::task::spawn_blocking(move || {
                            if let Err(e) = session.close() {
                                warn!(peer = %peer, "sweeper: closing reaped file failed: {}", e);
                            }
                        });
                    }
                }
            }
        }
    }

    fn log(&self, component: &'static str, peer: SocketAddr, event: TransferEvent) {
        self.config.logger.log(TransferLog {
            component,
            peer,
            event,
        });
    }
}

/// SHA-256 of a file on disk, hex encoded.
pub fn file_sha256(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
