/// Integration tests: real UDP sockets on loopback.
///
/// A lossy relay sits between sender and receiver where a test needs to drop
/// specific packets, so loss recovery and ack loss can be driven
/// deterministically.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::net::UdpSocket;

use opensync_transfer::receiver::{self, ReceiverHandle};
use opensync_transfer::{
    ACK_COMPLETE, Packet, ReceiverConfig, SendError, SenderConfig, TransferEvent, TransferLog,
    TransferLogger, send_payload,
};

/// Logger that keeps every event for assertions.
#[derive(Default)]
struct RecordingLogger {
    entries: Mutex<Vec<TransferLog>>,
}

impl RecordingLogger {
    fn events(&self) -> Vec<TransferEvent> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|entry| entry.event.clone())
            .collect()
    }

    fn count(&self, pred: impl Fn(&TransferEvent) -> bool) -> usize {
        self.events().iter().filter(|event| pred(event)).count()
    }
}

impl TransferLogger for RecordingLogger {
    fn log(&self, entry: TransferLog) {
        self.entries.lock().unwrap().push(entry);
    }
}

struct Harness {
    receiver: ReceiverHandle,
    logger: Arc<RecordingLogger>,
    dir: PathBuf,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.receiver.shutdown();
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

async fn start_receiver(stall: Duration, reap: Duration) -> Harness {
    let dir = std::env::temp_dir().join(format!("opensync_loopback_{}", uuid::Uuid::new_v4()));
    let logger = Arc::new(RecordingLogger::default());
    let config = ReceiverConfig {
        output_dir: dir.clone(),
        sweep_interval: Duration::from_millis(50),
        stall_threshold: stall,
        reap_after: reap,
        logger: logger.clone(),
    };
    let receiver = receiver::bind("127.0.0.1:0".parse().unwrap(), config)
        .await
        .expect("receiver bind");
    Harness {
        receiver,
        logger,
        dir,
    }
}

fn test_payload(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>())
}

fn sender_config(target: SocketAddr, name: &str, ack_wait: Duration) -> SenderConfig {
    let mut config = SenderConfig::new(target, name);
    config.ack_wait = ack_wait;
    config
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within 2s");
}

async fn recv_packet(socket: &UdpSocket) -> Packet {
    let mut buf = vec![0u8; 65_536];
    let len = tokio::time::timeout(Duration::from_secs(2), socket.recv(&mut buf))
        .await
        .expect("timed out waiting for datagram")
        .expect("recv");
    Packet::decode(&buf[..len]).expect("decode")
}

// ── Lossy relay ─────────────────────────────────────────────────────────

#[derive(Clone, Copy)]
enum Fault {
    /// Drop the first transmission of this chunk index.
    DropChunkOnce(u64),
    /// Drop every ack on its way back to the sender.
    DropAcks,
}

#[derive(Default)]
struct RelayLog {
    requests: Mutex<Vec<Vec<u64>>>,
    chunks_forwarded: Mutex<Vec<u64>>,
}

async fn spawn_relay(receiver: SocketAddr, fault: Fault) -> (SocketAddr, Arc<RelayLog>) {
    let front = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let back = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    back.connect(receiver).await.unwrap();
    let front_addr = front.local_addr().unwrap();
    let log = Arc::new(RelayLog::default());
    let sender_addr = Arc::new(Mutex::new(None::<SocketAddr>));

    // sender -> receiver
    {
        let (front, back, log, sender_addr) =
            (front.clone(), back.clone(), log.clone(), sender_addr.clone());
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65_536];
            let mut dropped = false;
            loop {
                let Ok((len, src)) = front.recv_from(&mut buf).await else {
                    continue;
                };
                *sender_addr.lock().unwrap() = Some(src);
                if let Ok(Packet::Chunk { sequence_number, .. }) = Packet::decode(&buf[..len]) {
                    if let Fault::DropChunkOnce(target) = fault {
                        if sequence_number == target && !dropped {
                            dropped = true;
                            continue;
                        }
                    }
                    log.chunks_forwarded.lock().unwrap().push(sequence_number);
                }
                let _ = back.send(&buf[..len]).await;
            }
        });
    }

    // receiver -> sender
    {
        let (front, back, log, sender_addr) = (front, back, log.clone(), sender_addr);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65_536];
            loop {
                let Ok(len) = back.recv(&mut buf).await else {
                    continue;
                };
                match Packet::decode(&buf[..len]) {
                    Ok(Packet::RequestMissing { sequence_numbers }) => {
                        log.requests.lock().unwrap().push(sequence_numbers);
                    }
                    Ok(Packet::Ack { .. }) if matches!(fault, Fault::DropAcks) => continue,
                    _ => {}
                }
                let dest = *sender_addr.lock().unwrap();
                if let Some(dest) = dest {
                    let _ = front.send_to(&buf[..len], dest).await;
                }
            }
        });
    }

    (front_addr, log)
}

// ── Tests ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn loopback_transfer_small_file() {
    loopback_transfer(10 * 1024 + 17).await;
}

#[tokio::test]
async fn loopback_transfer_exact_chunk_boundary() {
    loopback_transfer(3 * 1024).await;
}

#[tokio::test]
async fn loopback_transfer_empty_file() {
    loopback_transfer(0).await;
}

async fn loopback_transfer(file_size: usize) {
    let h = start_receiver(Duration::from_secs(5), Duration::from_secs(30)).await;
    let payload = test_payload(file_size);

    let config = sender_config(h.receiver.local_addr(), "input.bin", Duration::from_secs(5));
    let result = send_payload(config, payload.clone()).await.expect("send");

    assert_eq!(result.file_size, file_size as u64);
    assert_eq!(result.total_chunks, (file_size as u64).div_ceil(1024));
    assert_eq!(result.retransmitted, 0);

    let output = std::fs::read(h.dir.join("input.bin")).unwrap();
    assert_eq!(output.len(), payload.len(), "file sizes differ");
    assert_eq!(&output[..], &payload[..], "file contents differ");
    assert_eq!(h.receiver.active_sessions().await, 0);

    let expected = hex::encode(Sha256::digest(&payload));
    let logger = h.logger.clone();
    wait_until(|| {
        logger.count(|e| {
            matches!(e, TransferEvent::FileDigest { sha256, .. } if *sha256 == expected)
        }) == 1
    })
    .await;
}

/// 2500 bytes -> chunks of 1024, 1024, 452. Chunk 1 is lost on its first
/// trip; the sweeper asks for exactly {1}, the sender resends only that chunk,
/// and the transfer completes within the ack wait.
#[tokio::test]
async fn lost_chunk_recovered_after_stall() {
    let h = start_receiver(Duration::from_millis(300), Duration::from_secs(10)).await;
    let (relay_addr, relay) = spawn_relay(h.receiver.local_addr(), Fault::DropChunkOnce(1)).await;
    let payload = test_payload(2500);

    let config = sender_config(relay_addr, "gap.bin", Duration::from_secs(5));
    let result = send_payload(config, payload.clone()).await.expect("send");

    assert_eq!(result.total_chunks, 3);
    assert_eq!(result.retransmitted, 1);
    assert_eq!(*relay.requests.lock().unwrap(), vec![vec![1u64]]);
    assert_eq!(*relay.chunks_forwarded.lock().unwrap(), vec![0u64, 2, 1]);

    let output = std::fs::read(h.dir.join("gap.bin")).unwrap();
    assert_eq!(&output[..], &payload[..]);
    assert_eq!(h.receiver.active_sessions().await, 0);
    assert_eq!(
        h.logger.count(|e| {
            matches!(
                e,
                TransferEvent::MissingRequested {
                    missing_count: 1,
                    first_missing: 1
                }
            )
        }),
        1
    );
    assert_eq!(
        h.logger.count(|e| matches!(e, TransferEvent::SessionCompleted { total_chunks: 3, .. })),
        1
    );
}

/// The receiver finishes and removes its session even though the sender,
/// never seeing the ack, reports a timeout.
#[tokio::test]
async fn lost_ack_fails_sender_but_not_receiver() {
    let h = start_receiver(Duration::from_secs(5), Duration::from_secs(30)).await;
    let (relay_addr, _relay) = spawn_relay(h.receiver.local_addr(), Fault::DropAcks).await;
    let payload = test_payload(4000);

    let config = sender_config(relay_addr, "noack.bin", Duration::from_millis(500));
    let err = send_payload(config, payload.clone()).await.unwrap_err();
    match err {
        SendError::AckTimeout { waited, total_chunks } => {
            assert_eq!(waited, Duration::from_millis(500));
            assert_eq!(total_chunks, 4);
        }
        other => panic!("unexpected error {:?}", other),
    }

    let output = std::fs::read(h.dir.join("noack.bin")).unwrap();
    assert_eq!(&output[..], &payload[..]);
    assert_eq!(h.receiver.active_sessions().await, 0);
    assert_eq!(
        h.logger.count(|e| matches!(e, TransferEvent::SessionCompleted { .. })),
        1
    );
}

#[tokio::test]
async fn out_of_order_and_duplicate_chunks() {
    let h = start_receiver(Duration::from_secs(5), Duration::from_secs(30)).await;
    let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    raw.connect(h.receiver.local_addr()).await.unwrap();
    let payload = test_payload(2500);

    let metadata = Packet::Metadata {
        file_name: "shuffled.bin".into(),
        file_size: 2500,
        total_chunks: 3,
    };
    raw.send(&metadata.encode()).await.unwrap();

    for seq in [2u64, 0, 0, 1] {
        let range = opensync_transfer::chunk_range(seq, 2500).unwrap();
        let chunk = Packet::Chunk {
            sequence_number: seq,
            data: payload.slice(range.start as usize..range.end as usize),
        };
        raw.send(&chunk.encode()).await.unwrap();
    }

    assert_eq!(
        recv_packet(&raw).await,
        Packet::Ack {
            sequence_number: ACK_COMPLETE
        }
    );
    let output = std::fs::read(h.dir.join("shuffled.bin")).unwrap();
    assert_eq!(&output[..], &payload[..]);
    assert_eq!(
        h.logger.count(|e| matches!(e, TransferEvent::ChunkStored { .. })),
        2
    );
}

#[tokio::test]
async fn chunk_without_metadata_and_garbage_are_dropped() {
    let h = start_receiver(Duration::from_secs(5), Duration::from_secs(30)).await;
    let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    raw.connect(h.receiver.local_addr()).await.unwrap();

    let orphan = Packet::Chunk {
        sequence_number: 0,
        data: Bytes::from_static(b"orphan"),
    };
    raw.send(&orphan.encode()).await.unwrap();
    raw.send(b"not a packet at all").await.unwrap();

    let logger = h.logger.clone();
    wait_until(|| logger.count(|e| matches!(e, TransferEvent::ChunkRejected { .. })) == 1).await;
    assert_eq!(h.receiver.active_sessions().await, 0);

    // The ingest loop is still alive.
    let payload = test_payload(1500);
    let config = sender_config(h.receiver.local_addr(), "after.bin", Duration::from_secs(5));
    send_payload(config, payload.clone()).await.expect("send");
    assert_eq!(std::fs::read(h.dir.join("after.bin")).unwrap(), payload.to_vec());
}

#[tokio::test]
async fn silent_session_is_requested_then_reaped() {
    let h = start_receiver(Duration::from_millis(100), Duration::from_millis(600)).await;
    let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    raw.connect(h.receiver.local_addr()).await.unwrap();
    let payload = test_payload(3000);

    let metadata = Packet::Metadata {
        file_name: "abandoned.bin".into(),
        file_size: 3000,
        total_chunks: 3,
    };
    raw.send(&metadata.encode()).await.unwrap();
    let first = Packet::Chunk {
        sequence_number: 0,
        data: payload.slice(0..1024),
    };
    raw.send(&first.encode()).await.unwrap();

    assert_eq!(
        recv_packet(&raw).await,
        Packet::RequestMissing {
            sequence_numbers: vec![1, 2]
        }
    );

    let logger = h.logger.clone();
    wait_until(|| {
        logger.count(|e| {
            matches!(e, TransferEvent::SessionReaped { received: 1, total_chunks: 3, .. })
        }) == 1
    })
    .await;
    assert_eq!(h.receiver.active_sessions().await, 0);
}

#[tokio::test]
async fn empty_file_metadata_replaces_pending_session() {
    let h = start_receiver(Duration::from_millis(100), Duration::from_secs(30)).await;
    let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    raw.connect(h.receiver.local_addr()).await.unwrap();

    let old = Packet::Metadata {
        file_name: "old.bin".into(),
        file_size: 3000,
        total_chunks: 3,
    };
    raw.send(&old.encode()).await.unwrap();
    let receiver = &h.receiver;
    for _ in 0..100 {
        if receiver.active_sessions().await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(receiver.active_sessions().await, 1);

    let empty = Packet::Metadata {
        file_name: "empty.bin".into(),
        file_size: 0,
        total_chunks: 0,
    };
    raw.send(&empty.encode()).await.unwrap();

    assert_eq!(
        recv_packet(&raw).await,
        Packet::Ack {
            sequence_number: ACK_COMPLETE
        }
    );
    assert_eq!(receiver.active_sessions().await, 0);
    assert_eq!(std::fs::metadata(h.dir.join("empty.bin")).unwrap().len(), 0);
    assert_eq!(
        h.logger.count(|e| {
            matches!(e, TransferEvent::SessionReplaced { file_name } if file_name == "old.bin")
        }),
        1
    );

    // Several stall thresholds pass without a request for the old file.
    let mut buf = vec![0u8; 65_536];
    let late = tokio::time::timeout(Duration::from_millis(400), raw.recv(&mut buf)).await;
    assert!(late.is_err(), "unexpected datagram after completion");
}
