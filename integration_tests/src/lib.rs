// Test-only node wrapper for end-to-end tests.
//
// Wraps the real `NodeClient` (from `watchpost_server::client`) to give the
// scenarios in `tests/full_pipeline.rs` a synchronous API: connect a node of
// each type, then block until a matching event arrives or assert that none
// does. All networking goes through the same code paths as real nodes; the
// only test-specific code is the polling loops.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use watchpost_protocol::message::{
    AlertLevel, AlertRegistration, ManagerRegistration, NodeRegistration, SensorRegistration,
};
use watchpost_protocol::types::{ClientAlertId, ClientSensorId};
use watchpost_server::auth::StaticCredentials;
use watchpost_server::client::{ClientConfig, ClientEvent, NodeClient};
use watchpost_server::config::ServerConfig;
use watchpost_server::server::{ServerHandle, start_server};

/// Default timeout for blocking poll operations.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep duration between poll attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Every test user has this password.
pub const PASSWORD: &str = "secret";

/// Start a server on a random port with alert levels 0 to 4 and one user per
/// name in `users`.
pub fn start_test_server(users: &[&str]) -> (ServerHandle, SocketAddr) {
    let config = ServerConfig {
        port: 0,
        alert_levels: (0..=4)
            .map(|level| AlertLevel {
                level,
                name: format!("level {level}"),
                trigger_always: level == 4,
                smtp_activated: false,
                to_addr: String::new(),
            })
            .collect(),
        ..ServerConfig::default()
    };
    let credentials = users
        .iter()
        .fold(StaticCredentials::new(), |c, user| c.with_user(user, PASSWORD));
    let (handle, addr) = start_server(config, credentials).expect("start_server failed");
    thread::sleep(Duration::from_millis(50));
    (handle, addr)
}

/// A connected node plus blocking event helpers.
pub struct TestNode {
    pub client: NodeClient,
}

impl TestNode {
    pub fn connect(addr: SocketAddr, username: &str, registration: NodeRegistration) -> Self {
        let config = ClientConfig::new(&addr.to_string(), username, PASSWORD, registration);
        let client = NodeClient::connect(config).expect("NodeClient::connect failed");
        Self { client }
    }

    /// A sensor node; each entry is `(client sensor id, alert levels)`.
    pub fn sensor(addr: SocketAddr, username: &str, sensors: &[(u32, &[u32])]) -> Self {
        let entries = sensors
            .iter()
            .map(|(id, levels)| SensorRegistration {
                client_sensor_id: ClientSensorId(*id),
                alert_delay: 0,
                alert_levels: levels.iter().copied().collect(),
                description: format!("sensor {id}"),
            })
            .collect();
        Self::connect(addr, username, NodeRegistration::Sensor(entries))
    }

    /// An alert node with a single alert listening on `levels`.
    pub fn alert(addr: SocketAddr, username: &str, levels: &[u32]) -> Self {
        let alert = AlertRegistration {
            client_alert_id: ClientAlertId(0),
            description: format!("siren for {levels:?}"),
            alert_levels: levels.iter().copied().collect::<BTreeSet<_>>(),
        };
        Self::connect(addr, username, NodeRegistration::Alert(vec![alert]))
    }

    pub fn manager(addr: SocketAddr, username: &str) -> Self {
        Self::connect(
            addr,
            username,
            NodeRegistration::Manager(ManagerRegistration {
                description: format!("console {username}"),
            }),
        )
    }

    /// Blocking poll until `pick` accepts an event. Events it passes over are
    /// dropped.
    pub fn wait_for<T>(&self, what: &str, mut pick: impl FnMut(&ClientEvent) -> Option<T>) -> T {
        let start = Instant::now();
        loop {
            assert!(start.elapsed() < POLL_TIMEOUT, "timed out waiting for {what}");
            for event in self.client.poll() {
                if let Some(found) = pick(&event) {
                    return found;
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Poll for `window` and fail if any event matches `unwanted`.
    pub fn assert_none(&self, window: Duration, unwanted: impl Fn(&ClientEvent) -> bool) {
        let start = Instant::now();
        while start.elapsed() < window {
            for event in self.client.poll() {
                assert!(!unwanted(&event), "unexpected event {event:?}");
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Close the connection and wait for the driver to finish.
    pub fn disconnect(&mut self) {
        self.client.disconnect();
    }
}
