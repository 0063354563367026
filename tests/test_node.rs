use async_trait::async_trait;
use grapevine::{
    codec,
    discovery::{PeerBatch, PeerDiscovery},
    nat::{NatTraversal, PortMapping, PortMappings},
    node::MAX_CONCURRENT_SEARCHES,
    Command, GrapevineError, GrapevineNode, ProofOfWorkConfig, Result, RoomId,
};
use num_bigint::BigUint;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout, Duration};

const EXTERNAL: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5));

async fn create_node() -> GrapevineNode {
    GrapevineNode::builder()
        .pow_config(ProofOfWorkConfig::light())
        .build()
        .await
        .unwrap()
}

async fn listener() -> (UdpSocket, String) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let address = socket.local_addr().unwrap().to_string();
    (socket, address)
}

/// A configured port whose message port is free right now
fn free_node_port() -> u16 {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
    // Ephemeral ports are far above 2
    socket.local_addr().unwrap().port() - 2
}

async fn recv_packet(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = vec![0u8; 65_536];
    let n = timeout(Duration::from_secs(30), socket.recv(&mut buf))
        .await
        .expect("packet should arrive")
        .unwrap();
    buf.truncate(n);
    buf
}

#[tokio::test]
async fn test_send_hello_end_to_end() -> Result<()> {
    let node = create_node().await;

    let packet = node.compose("hello").await?;
    let header = codec::decode(&packet[..codec::TEXT_CAPACITY * 4])?;
    assert_eq!(header, format!("{:<256}", "hello"));
    assert!(node.pow().verify(&packet)? >= BigUint::from(32u32));

    let id = node.handle_packet(packet).await?;
    assert_eq!(id, Some(1));

    let lines = node.handle_command("messages").await?;
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("1: \"hello\" "), "{}", lines[0]);
    Ok(())
}

#[tokio::test]
async fn test_malformed_packets_are_discarded() -> Result<()> {
    let node = create_node().await;
    assert_eq!(node.handle_packet(vec![0u8; 1035]).await?, None);
    assert_eq!(node.handle_packet(vec![0u8; 1031]).await?, None);
    assert!(node.store().is_empty().await);
    Ok(())
}

#[tokio::test]
async fn test_user_errors_are_reported() {
    let node = create_node().await;

    for line in ["like", "drop", "like x", "send"] {
        assert!(
            matches!(node.handle_command(line).await, Err(GrapevineError::Usage(_))),
            "{line}"
        );
    }
    let err = node.handle_command("drop 42").await.unwrap_err();
    assert_eq!(err.to_string(), "message 42 not found");
    let err = node.handle_command("like 42 3").await.unwrap_err();
    assert_eq!(err.to_string(), "message 42 not found");
    let err = node.handle_command("dance").await.unwrap_err();
    assert_eq!(err.to_string(), "unknown command dance");
    assert!(err.is_user_error());
}

#[tokio::test]
async fn test_drop_hides_message() -> Result<()> {
    let node = create_node().await;
    let packet = node.compose("ephemeral").await?;
    let id = node.handle_packet(packet).await?.unwrap();

    assert!(node.handle_command(&format!("drop {id}")).await?.is_empty());
    assert!(node.handle_command("messages").await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_help_lists_commands() -> Result<()> {
    let node = create_node().await;
    let lines = node.handle_command("help").await?;
    for name in ["send", "messages", "peers", "like", "drop", "exit"] {
        assert!(lines.iter().any(|l| l.starts_with(name)), "{name}");
    }
    Ok(())
}

#[tokio::test]
async fn test_like_without_work_resends_stored_buffer() -> Result<()> {
    let node = create_node().await;
    let (peer, peer_addr) = listener().await;
    node.registry().ingest(&peer_addr, &PortMappings::new()).await;

    let packet = node.compose("resend").await?;
    let id = node.handle_packet(packet.clone()).await?.unwrap();

    node.handle_command(&format!("like {id}")).await?;
    assert_eq!(recv_packet(&peer).await, packet);
    Ok(())
}

#[tokio::test]
async fn test_like_with_work_broadcasts_stronger_copy() -> Result<()> {
    let mut node = create_node().await;
    let (peer, peer_addr) = listener().await;
    node.registry().ingest(&peer_addr, &PortMappings::new()).await;

    let packet = node.compose("boost").await?;
    let id = node.handle_packet(packet.clone()).await?.unwrap();
    let cost = node.store().get(id).await.unwrap().cost;

    node.handle_command(&format!("like {id} 3")).await?;
    let report = node.complete_next_job().await.expect("job should broadcast");
    assert_eq!(report.delivered, 1);

    let boosted = recv_packet(&peer).await;
    assert_eq!(boosted.len(), packet.len() + 8);
    assert!(node.pow().verify(&boosted)? >= &cost + BigUint::from(8u32));

    // The local record keeps its initial cost
    assert_eq!(node.store().get(id).await.unwrap().cost, cost);

    // Another node stores the boosted copy as a new message
    let other = create_node().await;
    assert_eq!(other.handle_packet(packet).await?, Some(1));
    assert_eq!(other.handle_packet(boosted).await?, Some(2));
    Ok(())
}

#[tokio::test]
async fn test_searches_are_bounded() -> Result<()> {
    let mut node = GrapevineNode::builder()
        .pow_config(ProofOfWorkConfig::light())
        .min_work(u64::MAX)
        .build()
        .await?;

    for i in 0..6 {
        node.handle_command(&format!("send msg {i}")).await?;
    }
    for _ in 0..5 {
        sleep(Duration::from_millis(20)).await;
        assert!(node.active_searches() <= MAX_CONCURRENT_SEARCHES);
    }
    assert_eq!(node.active_searches(), MAX_CONCURRENT_SEARCHES);

    // Shutdown ends running searches and releases the queued ones
    node.close().await;
    for _ in 0..6 {
        let finished = timeout(Duration::from_secs(10), node.complete_next_job())
            .await
            .expect("search should stop after shutdown");
        assert_eq!(finished, None);
    }
    Ok(())
}

#[tokio::test]
async fn test_send_runs_in_background_job() -> Result<()> {
    let mut node = create_node().await;
    let (peer, peer_addr) = listener().await;
    node.registry().ingest(&peer_addr, &PortMappings::new()).await;

    assert!(node.handle_command("send hi there").await?.is_empty());
    // Other commands are served while the job runs
    assert_eq!(node.handle_command("peers").await?, vec![peer_addr]);

    node.complete_next_job().await.expect("job should broadcast");
    let packet = recv_packet(&peer).await;
    assert_eq!(codec::display_text(&packet[..1024])?, "hi there");
    Ok(())
}

async fn submit(commands: &mpsc::Sender<Command>, line: &str) {
    let (command, processed) = Command::new(line);
    commands.send(command).await.unwrap();
    processed.await.unwrap();
}

fn drain(console: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Ok(line) = console.try_recv() {
        lines.push(line);
    }
    lines
}

#[tokio::test]
async fn test_event_loop_round_trip() -> Result<()> {
    let (peer, peer_addr) = listener().await;
    let (console_tx, mut console) = mpsc::unbounded_channel();
    let port = free_node_port();
    let node = GrapevineNode::builder()
        .port(port)
        .pow_config(ProofOfWorkConfig::light())
        .refresh_interval(Duration::from_millis(50))
        .bootstrap_peers(vec![peer_addr.clone()])
        .console(console_tx)
        .build()
        .await?;

    let (commands, commands_rx) = mpsc::channel(8);
    let running = tokio::spawn(node.run(commands_rx));

    // The first refresh tick reports the bootstrap peer
    let mut found = false;
    for _ in 0..100 {
        submit(&commands, "peers").await;
        if drain(&mut console).contains(&peer_addr) {
            found = true;
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    assert!(found, "bootstrap peer never registered");

    submit(&commands, "send hello").await;
    let packet = recv_packet(&peer).await;
    assert_eq!(codec::display_text(&packet[..1024])?, "hello");

    // Feed the packet back to the node's message port
    peer.send_to(&packet, ("127.0.0.1", port + 2)).await.unwrap();
    let mut listed = false;
    for _ in 0..100 {
        submit(&commands, "messages").await;
        if drain(&mut console).iter().any(|l| l.contains("\"hello\"")) {
            listed = true;
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    assert!(listed, "message never listed");

    submit(&commands, "bogus").await;
    assert_eq!(drain(&mut console), vec!["unknown command bogus".to_string()]);

    submit(&commands, "exit").await;
    timeout(Duration::from_secs(5), running)
        .await
        .expect("node should stop")
        .unwrap()?;
    Ok(())
}

struct FailingDiscovery;

#[async_trait]
impl PeerDiscovery for FailingDiscovery {
    async fn start(&self) -> Result<mpsc::Receiver<PeerBatch>> {
        Err(GrapevineError::discovery("overlay unavailable"))
    }

    async fn request_peers(&self, _room: &RoomId, _announce: bool, _port: u16) -> Result<()> {
        Ok(())
    }

    async fn withdraw(&self, _room: &RoomId) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_discovery_failure_is_fatal() {
    let node = GrapevineNode::builder()
        .port(free_node_port())
        .pow_config(ProofOfWorkConfig::light())
        .discovery(Arc::new(FailingDiscovery))
        .build()
        .await
        .unwrap();

    let (_commands, commands_rx) = mpsc::channel(8);
    let result = node.run(commands_rx).await;
    assert!(matches!(result, Err(GrapevineError::Discovery(_))));
}

#[derive(Default)]
struct RecordingDiscovery {
    requests: Mutex<Vec<(bool, u16)>>,
}

#[async_trait]
impl PeerDiscovery for RecordingDiscovery {
    async fn start(&self) -> Result<mpsc::Receiver<PeerBatch>> {
        Ok(mpsc::channel(1).1)
    }

    async fn request_peers(&self, _room: &RoomId, announce: bool, port: u16) -> Result<()> {
        self.requests.lock().await.push((announce, port));
        Ok(())
    }

    async fn withdraw(&self, _room: &RoomId) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_refresh_announces_message_port() {
    let discovery = Arc::new(RecordingDiscovery::default());
    let node = GrapevineNode::builder()
        .port(4000)
        .pow_config(ProofOfWorkConfig::light())
        .discovery(discovery.clone())
        .build()
        .await
        .unwrap();

    node.refresh().await;
    let announced = node.config().message_port().unwrap();
    assert_eq!(announced, 4002);
    assert_eq!(*discovery.requests.lock().await, vec![(true, announced)]);
}

#[derive(Default)]
struct RecordingNat {
    available: bool,
    deleted: Mutex<Vec<u16>>,
}

#[async_trait]
impl NatTraversal for RecordingNat {
    async fn add_port_mapping(&self, _external_port: u16, _internal_port: u16) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(GrapevineError::nat("no gateway"))
        }
    }

    async fn delete_port_mapping(&self, external_port: u16) -> Result<()> {
        self.deleted.lock().await.push(external_port);
        Ok(())
    }

    async fn external_address(&self) -> Result<IpAddr> {
        if self.available {
            Ok(EXTERNAL)
        } else {
            Err(GrapevineError::nat("no gateway"))
        }
    }

    async fn list_port_mappings(&self) -> Result<Vec<PortMapping>> {
        Ok(Vec::new())
    }

    fn local_address(&self) -> Option<IpAddr> {
        Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)))
    }
}

#[tokio::test]
async fn test_nat_mappings_and_blacklist() {
    let nat = Arc::new(RecordingNat {
        available: true,
        ..Default::default()
    });
    let node = GrapevineNode::builder()
        .port(1337)
        .pow_config(ProofOfWorkConfig::light())
        .nat(nat.clone())
        .build()
        .await
        .unwrap();

    assert_eq!(node.mapped_ports(), &[1337, 1339]);
    assert_eq!(node.registry().external_address(), Some(EXTERNAL));
    let blacklist = node.registry().blacklist();
    for address in [
        "192.168.1.20:1337",
        "192.168.1.20:1339",
        "203.0.113.5:1337",
        "203.0.113.5:1339",
    ] {
        assert!(blacklist.contains(address), "{address}");
    }

    node.close().await;
    assert_eq!(*nat.deleted.lock().await, vec![1337, 1339]);
}

#[tokio::test]
async fn test_unavailable_nat_degrades() {
    let nat = Arc::new(RecordingNat::default());
    let node = GrapevineNode::builder()
        .pow_config(ProofOfWorkConfig::light())
        .nat(nat.clone())
        .build()
        .await
        .unwrap();

    assert!(node.mapped_ports().is_empty());
    assert_eq!(node.registry().external_address(), None);
    assert!(node.registry().blacklist().contains("192.168.1.20:1339"));

    node.close().await;
    assert!(nat.deleted.lock().await.is_empty());
}

#[test]
fn test_port_without_room_for_message_port_is_rejected() {
    let config = grapevine::NodeConfig {
        port: u16::MAX,
        ..Default::default()
    };
    assert!(matches!(
        config.message_port(),
        Err(GrapevineError::Config(_))
    ));
}
