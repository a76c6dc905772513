#![allow(dead_code)]

use std::time::{Duration, Instant};

use rdht::config::DhtConfig;
use rdht::dht::DhtServer;
use rdht::socket::PeerAddr;

pub const STEP_TIMEOUT: Duration = Duration::from_millis(5);
pub const TEST_DEADLINE: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Loopback config on an ephemeral port with no public bootstrap routers.
pub fn local_config() -> DhtConfig {
    DhtConfig::default()
        .with_port(0)
        .with_bootstrap_nodes(Vec::<String>::new())
}

pub fn spawn_server() -> DhtServer {
    DhtServer::bind(local_config()).expect("bind dht server")
}

pub fn loopback(server: &DhtServer) -> PeerAddr {
    PeerAddr::new("127.0.0.1", server.port())
}

/// Steps every server until `done` holds or the deadline passes.
pub fn step_until<F>(servers: &mut [DhtServer], mut done: F) -> bool
where
    F: FnMut(&[DhtServer]) -> bool,
{
    let deadline = Instant::now() + TEST_DEADLINE;
    while Instant::now() < deadline {
        for server in servers.iter_mut() {
            server.step(STEP_TIMEOUT).expect("step");
        }
        if done(servers) {
            return true;
        }
    }
    false
}

pub fn knows(server: &DhtServer, other: &DhtServer) -> bool {
    server.routing_table().find_node(other.local_id()).is_some()
}
