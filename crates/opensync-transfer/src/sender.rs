/// UDP sender: one transfer attempt over one ephemeral socket.
///
/// ```text
/// [Main]      Metadata -> Chunk 0..n (no pacing) -> wait for ack (bounded)
/// [Listener]  RequestMissing -> re-slice payload, resend those chunks
///             Ack(complete)  -> fire completion signal once
/// ```
///
/// The whole payload stays in memory for the attempt, so retransmissions are
/// zero-copy slices of the original buffer.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::logging::{TracingLogger, TransferEvent, TransferLog, TransferLogger};
use crate::protocol::*;

/// Configuration for the sender.
#[derive(Clone)]
pub struct SenderConfig {
    pub target_addr: SocketAddr,
    /// Name the receiver stores the file under.
    pub file_name: String,
    /// How long to wait for the terminal ack once every chunk has been sent.
    pub ack_wait: Duration,
    pub logger: Arc<dyn TransferLogger>,
}

impl SenderConfig {
    pub fn new(target_addr: SocketAddr, file_name: impl Into<String>) -> Self {
        Self {
            target_addr,
            file_name: file_name.into(),
            ack_wait: ACK_WAIT,
            logger: Arc::new(TracingLogger),
        }
    }
}

/// Result of an acknowledged transfer.
#[derive(Debug, Clone)]
pub struct SendResult {
    pub file_size: u64,
    pub total_chunks: u64,
    /// Chunks sent again in answer to RequestMissing.
    pub retransmitted: u64,
    pub elapsed: Duration,
}

/// Why a transfer attempt did not end with an ack.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("file name {0:?} is empty or longer than {max} bytes", max = MAX_FILE_NAME_LEN)]
    InvalidFileName(String),
    #[error("payload of {0} bytes exceeds the {max} byte limit", max = MAX_FILE_SIZE)]
    TooLarge(u64),
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    /// The receiver may still have completed the file; only the ack is known missing.
    #[error("no acknowledgment within {}ms ({total_chunks} chunks sent)", .waited.as_millis())]
    AckTimeout { waited: Duration, total_chunks: u64 },
    #[error("listener stopped before the acknowledgment arrived")]
    ListenerClosed,
}

/// Send `payload` to the receiver at `config.target_addr` and wait for its ack.
pub async fn send_payload(config: SenderConfig, payload: Bytes) -> Result<SendResult, SendError> {
    if config.file_name.is_empty() || config.file_name.len() > MAX_FILE_NAME_LEN {
        return Err(SendError::InvalidFileName(config.file_name));
    }
    if payload.len() as u64 > MAX_FILE_SIZE {
        return Err(SendError::TooLarge(payload.len() as u64));
    }

    let bind_addr: SocketAddr = if config.target_addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
    socket.connect(config.target_addr).await?;

    let (done_tx, done_rx) = oneshot::channel();
    let retransmitted = Arc::new(AtomicU64::new(0));

    let listener = tokio::spawn(listen(
        Listener {
            socket: socket.clone(),
            payload: payload.clone(),
            peer: config.target_addr,
            retransmitted: retransmitted.clone(),
            logger: config.logger.clone(),
        },
        done_tx,
    ));

    let result = transmit(&config, &socket, &payload, done_rx).await;
    // Tear down the listener whatever the outcome; the socket closes with the last Arc.
    listener.abort();

    result.map(|(total_chunks, elapsed)| SendResult {
        file_size: payload.len() as u64,
        total_chunks,
        retransmitted: retransmitted.load(Ordering::Relaxed),
        elapsed,
    })
}

async fn transmit(
    config: &SenderConfig,
    socket: &UdpSocket,
    payload: &Bytes,
    done_rx: oneshot::Receiver<()>,
) -> Result<(u64, Duration), SendError> {
    let started = Instant::now();
    let file_size = payload.len() as u64;
    let total = total_chunks(file_size);
    let log = |event| {
        config.logger.log(TransferLog {
            component: "sender",
            peer: config.target_addr,
            event,
        })
    };

    let metadata = Packet::Metadata {
        file_name: config.file_name.clone(),
        file_size,
        total_chunks: total,
    };
    socket.send(&metadata.encode()).await?;
    log(TransferEvent::TransferStarted {
        file_name: config.file_name.clone(),
        file_size,
        total_chunks: total,
    });

    // Losses here are recovered through the receiver's RequestMissing.
    let (mut sent, mut failed) = (0u64, 0u64);
    for seq in 0..total {
        let Some(chunk) = chunk_packet(payload, seq) else {
            continue;
        };
        match socket.send(&chunk.encode()).await {
            Ok(_) => sent += 1,
            Err(e) => {
                failed += 1;
                debug!("sender: chunk {} send failed: {}", seq, e);
            }
        }
    }
    log(TransferEvent::ChunksBlasted { sent, failed });

    match tokio::time::timeout(config.ack_wait, done_rx).await {
        Ok(Ok(())) => {
            let elapsed = started.elapsed();
            log(TransferEvent::AckReceived {
                duration_ms: elapsed.as_millis() as u64,
            });
            Ok((total, elapsed))
        }
        Ok(Err(_)) => Err(SendError::ListenerClosed),
        Err(_) => {
            log(TransferEvent::AckTimeout {
                waited_ms: config.ack_wait.as_millis() as u64,
            });
            Err(SendError::AckTimeout {
                waited: config.ack_wait,
                total_chunks: total,
            })
        }
    }
}

/// Chunk `seq` of the payload, or `None` past the end.
fn chunk_packet(payload: &Bytes, seq: u64) -> Option<Packet> {
    let range = chunk_range(seq, payload.len() as u64)?;
    Some(Packet::Chunk {
        sequence_number: seq,
        data: payload.slice(range.start as usize..range.end as usize),
    })
}

struct Listener {
    socket: Arc<UdpSocket>,
    payload: Bytes,
    peer: SocketAddr,
    retransmitted: Arc<AtomicU64>,
    logger: Arc<dyn TransferLogger>,
}

/// Serve retransmission requests until aborted; fire `done` on the terminal ack.
async fn listen(ctx: Listener, done: oneshot::Sender<()>) {
    let mut done = Some(done);
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let len = match ctx.socket.recv(&mut buf).await {
            Ok(len) => len,
            Err(e)
                if e.kind() == io::ErrorKind::ConnectionRefused
                    || e.kind() == io::ErrorKind::ConnectionReset =>
            {
                // ICMP unreachable for an earlier datagram; the receiver may still come up.
                debug!("sender: {} unreachable: {}", ctx.peer, e);
                continue;
            }
            Err(e) => {
                debug!("sender: listener stopping: {}", e);
                return;
            }
        };

        let packet = match Packet::decode(&buf[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(peer = %ctx.peer, "sender: dropping malformed datagram: {}", e);
                continue;
            }
        };

        match packet {
            Packet::RequestMissing { sequence_numbers } => {
                let mut sent = 0usize;
                for &seq in &sequence_numbers {
                    let Some(chunk) = chunk_packet(&ctx.payload, seq) else {
                        continue;
                    };
                    match ctx.socket.send(&chunk.encode()).await {
                        Ok(_) => sent += 1,
                        Err(e) => debug!("sender: retransmit of chunk {} failed: {}", seq, e),
                    }
                }
                ctx.retransmitted.fetch_add(sent as u64, Ordering::Relaxed);
                ctx.logger.log(TransferLog {
                    component: "sender",
                    peer: ctx.peer,
                    event: TransferEvent::Retransmitted {
                        requested: sequence_numbers.len(),
                        sent,
                    },
                });
            }
            Packet::Ack {
                sequence_number: ACK_COMPLETE,
            } => {
                // The waiter may have timed out already; a closed slot is fine.
                if let Some(tx) = done.take() {
                    let _ = tx.send(());
                }
            }
            Packet::Ack { sequence_number } => {
                debug!("sender: ignoring ack {}", sequence_number)
            }
            other => debug!(kind = other.kind_name(), "sender: ignoring receiver-bound packet"),
        }
    }
}
