//! End-to-end synchronization over real TCP sockets

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use realm_server::game::constants::net::PROTOCOL_VERSION;
use realm_server::game::definitions::Definitions;
use realm_server::game::persistence::MemoryStore;
use realm_server::game::region::{Region, RegionData};
use realm_server::game::world::{World, WorldSettings};
use realm_server::metrics::Metrics;
use realm_server::net::dos_protection::{Admission, AdmissionConfig};
use realm_server::net::game_session::ServerContext;
use realm_server::net::protocol::{ClientPacket, ServerPacket};
use realm_server::net::session::SessionDirectory;
use realm_server::net::transport::GameServer;
use realm_server::util::position::Heading;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const DEFINITIONS: &str = r#"{
    "cities": [{"id": 1, "name": "Haven", "position": {"x": 50, "y": 50, "region": 1}}]
}"#;

struct TestServer {
    addr: SocketAddr,
    world: Arc<World>,
}

async fn start_server(admission: AdmissionConfig) -> TestServer {
    let defs = Arc::new(Definitions::from_json(DEFINITIONS).unwrap());
    let metrics = Arc::new(Metrics::new());
    let sessions = Arc::new(SessionDirectory::new(metrics.clone()));
    let region = Region::from_data(RegionData::open(1, "Haven", false)).unwrap();
    let world = Arc::new(World::new(
        vec![region],
        defs,
        sessions.clone(),
        WorldSettings::default(),
    ));
    let ctx = Arc::new(ServerContext {
        world: world.clone(),
        store: Arc::new(MemoryStore::new()),
        sessions,
        metrics,
        protocol_version: PROTOCOL_VERSION,
    });
    let server = GameServer::bind("127.0.0.1:0".parse().unwrap(), ctx, Admission::new(admission))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    TestServer { addr, world }
}

struct Client {
    stream: TcpStream,
    pending: Vec<u8>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            pending: Vec::new(),
        }
    }

    async fn send(&mut self, packet: ClientPacket) {
        self.stream.write_all(&packet.encode()).await.unwrap();
    }

    /// Next packet matching `pred`, skipping the rest
    async fn expect(&mut self, pred: impl Fn(&ServerPacket) -> bool) -> ServerPacket {
        let wait = async {
            loop {
                while let Ok((packet, used)) = ServerPacket::decode(&self.pending) {
                    self.pending.drain(..used);
                    if pred(&packet) {
                        return packet;
                    }
                }
                let mut chunk = [0u8; 4096];
                let n = self.stream.read(&mut chunk).await.unwrap();
                assert!(n > 0, "server hung up");
                self.pending.extend_from_slice(&chunk[..n]);
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("timed out waiting for packet")
    }

    async fn create(&mut self, name: &str) -> u16 {
        self.send(ClientPacket::CreateCharacter {
            name: name.to_string(),
            archetype: 1,
            body: 1,
            head: 1,
            home_city: 1,
        })
        .await;
        match self
            .expect(|p| matches!(p, ServerPacket::LoggedIn { .. }))
            .await
        {
            ServerPacket::LoggedIn { index } => index,
            _ => unreachable!(),
        }
    }
}

#[tokio::test]
async fn test_neighbours_see_each_other() {
    let server = start_server(AdmissionConfig::default()).await;
    let mut alpha = Client::connect(server.addr).await;
    let mut bravo = Client::connect(server.addr).await;

    let a = alpha.create("Alpha").await;
    let b = bravo.create("Bravo").await;
    assert_ne!(a, b);

    // Each sees the other appear
    alpha
        .expect(|p| matches!(p, ServerPacket::CharacterCreate(view) if view.index == b))
        .await;
    bravo
        .expect(|p| matches!(p, ServerPacket::CharacterCreate(view) if view.index == a))
        .await;

    bravo.send(ClientPacket::Walk { heading: Heading::South }).await;
    alpha
        .expect(|p| matches!(p, ServerPacket::CharacterMove { index, .. } if *index == b))
        .await;

    bravo.send(ClientPacket::Quit).await;
    alpha
        .expect(|p| matches!(p, ServerPacket::CharacterRemove { index } if *index == b))
        .await;

    // The table entry is released right after the removal is broadcast
    for _ in 0..50 {
        if server.world.online_characters().len() == 1 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("Bravo was never released");
}

#[tokio::test]
async fn test_duplicate_name_is_refused() {
    let server = start_server(AdmissionConfig::default()).await;
    let mut first = Client::connect(server.addr).await;
    first.create("Duplicate").await;

    let mut second = Client::connect(server.addr).await;
    second
        .send(ClientPacket::CreateCharacter {
            name: "Duplicate".to_string(),
            archetype: 1,
            body: 1,
            head: 1,
            home_city: 1,
        })
        .await;
    second
        .expect(|p| matches!(p, ServerPacket::ErrorMessage { .. }))
        .await;
}

#[tokio::test]
async fn test_full_server_refuses_connection() {
    let server = start_server(AdmissionConfig {
        max_users: 1,
        ..Default::default()
    })
    .await;
    let mut first = Client::connect(server.addr).await;
    first.create("Lonely").await;

    let mut second = Client::connect(server.addr).await;
    second
        .expect(|p| matches!(p, ServerPacket::ErrorMessage { .. }))
        .await;
}
