//! Conversation-worker tests over real localhost sockets: UDP relay both
//! ways, signing enforcement, the TCP engineer path, and the counter
//! write-back after idle timeout.

use std::time::Duration;

use keydb::{KeyStore, TenantRecord};
use mavlink_codec::{
    frame::{encode, MavMessage, Parser},
    messages::Heartbeat,
    SigningContext, IFLAG_SIGNED,
};
use mavlink_relay::{
    config::RelayConfig,
    session::{Session, SessionSockets},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
    time::{sleep, timeout},
};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn test_config(dir: &tempfile::TempDir) -> RelayConfig {
    let mut config = RelayConfig::default();
    config.keydb_path = dir.path().join("keys.tdb");
    config.bind_address = "127.0.0.1".into();
    config.idle_timeout_secs = 1;
    config
}

fn write_record(config: &RelayConfig, port2: u32, secret: [u8; 32], timestamp: u64) {
    let store = KeyStore::open(&config.keydb_path).unwrap();
    let mut record = TenantRecord::new();
    record.secret_key = secret;
    record.timestamp = timestamp;
    record.port1 = 14550;
    let mut txn = store.begin().unwrap();
    txn.save(port2, &record).unwrap();
    txn.commit().unwrap();
}

fn heartbeat(seq: u8) -> MavMessage {
    let hb = Heartbeat {
        custom_mode: 0,
        mav_type: 2,
        autopilot: 3,
        base_mode: 81,
        system_status: 4,
        mavlink_version: 3,
    };
    let mut msg = hb.pack(1, 1);
    msg.seq = seq;
    msg
}

async fn recv_datagram(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = vec![0u8; 2048];
    let n = timeout(RECV_TIMEOUT, socket.recv(&mut buf))
        .await
        .expect("timed out waiting for datagram")
        .expect("recv failed");
    buf.truncate(n);
    buf
}

fn parse_one(bytes: &[u8]) -> MavMessage {
    let mut parser = Parser::new();
    let (_, frame) = parser.advance(bytes, None);
    frame.expect("no frame in datagram").msg
}

/// A signing timestamp slightly ahead of the relay's own wall-clock
/// watermark, like a live ground station would produce.
fn live_timestamp() -> u64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    SigningContext::wall_clock_timestamp(now) + 100_000
}

/// Signing disabled (all-zero record): plain heartbeats relay both ways and
/// the counters land in the record after the idle timeout.
#[tokio::test]
async fn udp_relay_with_signing_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);

    let sockets = SessionSockets::bind("127.0.0.1", 0, 0).unwrap();
    let udp1_addr = sockets.udp1.local_addr().unwrap();
    let udp2_addr = sockets.udp2.local_addr().unwrap();
    let port2 = udp2_addr.port();
    write_record(&config, port2 as u32, [0; 32], 0);

    let session = Session::new(port2, sockets, config.clone());
    let task = tokio::spawn(session.run());

    let vehicle = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    vehicle.connect(udp1_addr).await.unwrap();
    let engineer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    engineer.connect(udp2_addr).await.unwrap();

    // vehicle first: pins conn1, nothing to forward to yet
    vehicle
        .send(&encode(&heartbeat(1), None).unwrap())
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    // engineer heartbeat flows to the vehicle, stripped of signing
    engineer
        .send(&encode(&heartbeat(2), None).unwrap())
        .await
        .unwrap();
    let to_vehicle = recv_datagram(&vehicle).await;
    let msg = parse_one(&to_vehicle);
    assert_eq!(msg.msgid, 0);
    assert_eq!(msg.seq, 2);
    assert_eq!(msg.incompat_flags & IFLAG_SIGNED, 0);

    // vehicle heartbeat flows to the engineer, unsigned (tenant disabled)
    vehicle
        .send(&encode(&heartbeat(3), None).unwrap())
        .await
        .unwrap();
    let to_engineer = recv_datagram(&engineer).await;
    let msg = parse_one(&to_engineer);
    assert_eq!(msg.seq, 3);
    assert_eq!(msg.incompat_flags & IFLAG_SIGNED, 0);

    // both sides go quiet; the session ends and persists the counters
    timeout(Duration::from_secs(10), task).await.unwrap().unwrap();

    let record = KeyStore::open(&config.keydb_path)
        .unwrap()
        .load(port2 as u32)
        .unwrap()
        .unwrap();
    assert_eq!(record.count1, 2);
    assert_eq!(record.count2, 1);
    assert_eq!(record.connections, 1);
}

/// Enforced signing: a good signed heartbeat authenticates the engineer and
/// traffic to the engineer comes back signed.
#[tokio::test]
async fn signed_heartbeat_authenticates_engineer() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let secret = [7u8; 32];

    let sockets = SessionSockets::bind("127.0.0.1", 0, 0).unwrap();
    let udp1_addr = sockets.udp1.local_addr().unwrap();
    let udp2_addr = sockets.udp2.local_addr().unwrap();
    let port2 = udp2_addr.port();
    write_record(&config, port2 as u32, secret, 0);

    let task = tokio::spawn(Session::new(port2, sockets, config.clone()).run());

    let vehicle = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    vehicle.connect(udp1_addr).await.unwrap();
    let engineer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    engineer.connect(udp2_addr).await.unwrap();

    vehicle
        .send(&encode(&heartbeat(1), None).unwrap())
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    let mut peer = SigningContext::new(secret, 1, live_timestamp());
    engineer
        .send(&encode(&heartbeat(2), Some(&mut peer)).unwrap())
        .await
        .unwrap();
    let msg = parse_one(&recv_datagram(&vehicle).await);
    assert_eq!(msg.seq, 2);
    // the vehicle side never sees signatures
    assert_eq!(msg.incompat_flags & IFLAG_SIGNED, 0);

    // now the engineer is authenticated and gets signed traffic
    vehicle
        .send(&encode(&heartbeat(3), None).unwrap())
        .await
        .unwrap();
    let bytes = recv_datagram(&engineer).await;
    let msg = parse_one(&bytes);
    assert_eq!(msg.seq, 3);
    assert_ne!(msg.incompat_flags & IFLAG_SIGNED, 0);

    task.abort();
}

/// Enforced signing rejects unsigned engineer traffic: nothing reaches the
/// vehicle, and the engineer is told via unsigned STATUSTEXT.
#[tokio::test]
async fn unsigned_engineer_traffic_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);

    let sockets = SessionSockets::bind("127.0.0.1", 0, 0).unwrap();
    let udp1_addr = sockets.udp1.local_addr().unwrap();
    let udp2_addr = sockets.udp2.local_addr().unwrap();
    let port2 = udp2_addr.port();
    write_record(&config, port2 as u32, [7; 32], 0);

    let task = tokio::spawn(Session::new(port2, sockets, config.clone()).run());

    let vehicle = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    vehicle.connect(udp1_addr).await.unwrap();
    let engineer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    engineer.connect(udp2_addr).await.unwrap();

    vehicle
        .send(&encode(&heartbeat(1), None).unwrap())
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    engineer
        .send(&encode(&heartbeat(2), None).unwrap())
        .await
        .unwrap();

    // the rejection notice is an unsigned STATUSTEXT back to the engineer
    let notice = parse_one(&recv_datagram(&engineer).await);
    assert_eq!(notice.msgid, 253);
    assert_eq!(notice.payload[0], 2); // MAV_SEVERITY_CRITICAL

    // and the vehicle sees nothing
    let mut buf = [0u8; 512];
    let got = timeout(Duration::from_millis(700), vehicle.recv(&mut buf)).await;
    assert!(got.is_err(), "unsigned frame must not be forwarded");

    task.abort();
}

/// The engineer side also speaks plain MAVLink over TCP, one slot per
/// connection.
#[tokio::test]
async fn tcp_engineer_slot_relays_both_ways() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let secret = [9u8; 32];

    let sockets = SessionSockets::bind("127.0.0.1", 0, 0).unwrap();
    let udp1_addr = sockets.udp1.local_addr().unwrap();
    let tcp2_addr = sockets.tcp2.local_addr().unwrap();
    let port2 = sockets.udp2.local_addr().unwrap().port();
    write_record(&config, port2 as u32, secret, 0);

    let task = tokio::spawn(Session::new(port2, sockets, config.clone()).run());

    let vehicle = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    vehicle.connect(udp1_addr).await.unwrap();
    vehicle
        .send(&encode(&heartbeat(1), None).unwrap())
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    let mut engineer = TcpStream::connect(tcp2_addr).await.unwrap();
    let mut peer = SigningContext::new(secret, 1, live_timestamp());
    engineer
        .write_all(&encode(&heartbeat(2), Some(&mut peer)).unwrap())
        .await
        .unwrap();

    // signed engineer frame reaches the vehicle
    let msg = parse_one(&recv_datagram(&vehicle).await);
    assert_eq!(msg.seq, 2);

    // authenticated: vehicle traffic comes back down the TCP slot, signed
    vehicle
        .send(&encode(&heartbeat(3), None).unwrap())
        .await
        .unwrap();
    let mut buf = vec![0u8; 2048];
    let n = timeout(RECV_TIMEOUT, engineer.read(&mut buf))
        .await
        .expect("timed out reading TCP slot")
        .unwrap();
    assert!(n > 0);
    let msg = parse_one(&buf[..n]);
    assert_eq!(msg.seq, 3);
    assert_ne!(msg.incompat_flags & IFLAG_SIGNED, 0);

    task.abort();
}

/// A conversation that never saw traffic writes nothing back.
#[tokio::test]
async fn idle_session_writes_no_counters() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);

    let sockets = SessionSockets::bind("127.0.0.1", 0, 0).unwrap();
    let port2 = sockets.udp2.local_addr().unwrap().port();
    write_record(&config, port2 as u32, [0; 32], 0);

    let session = Session::new(port2, sockets, config.clone());
    let task = tokio::spawn(session.run());
    sleep(Duration::from_millis(300)).await;
    task.abort();

    let record = KeyStore::open(&config.keydb_path)
        .unwrap()
        .load(port2 as u32)
        .unwrap()
        .unwrap();
    assert_eq!(record.connections, 0);
    assert_eq!(record.count1, 0);
    assert_eq!(record.count2, 0);
}
