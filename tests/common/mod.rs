//! Shared test utilities
//!
//! Temp-dir server fixtures, a tiny line-protocol client, and seeded vector
//! generators for reproducible search tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use ferrodb::auth::{AuthManager, Permission, Role};
use ferrodb::{Config, RunningServer, Server};

/// bcrypt cost 4 keeps test logins fast; production uses 12
pub const TEST_BCRYPT_COST: u32 = 4;

/// Build a test config rooted at a temp dir, with OS-assigned ports
pub fn test_config(home: &std::path::Path, max_connections: usize) -> Config {
    let mut config = Config::with_home(home, 0, max_connections);
    config.management_port = 0;
    config.engine.bcrypt_cost = TEST_BCRYPT_COST;
    config
}

/// Seed an admin (and optional extra users) into the store a server will open
pub fn seed_users(config: &Config, extra: &[(&str, &str, Role, HashMap<String, Permission>)]) {
    let auth = AuthManager::open(&config.users_path, TEST_BCRYPT_COST).unwrap();
    auth.bootstrap_admin("root", "rootpw").unwrap();
    for (username, password, role, permissions) in extra {
        auth.create_user(username, password, *role, permissions.clone())
            .unwrap();
    }
}

/// Start a server on ephemeral ports with a seeded admin
pub async fn start_server(home: &std::path::Path, max_connections: usize) -> RunningServer {
    let config = test_config(home, max_connections);
    seed_users(&config, &[]);
    Server::new(config).unwrap().start().await.unwrap()
}

/// A logged-in line-protocol session
pub struct TestSession {
    pub lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
    pub writer: OwnedWriteHalf,
}

impl TestSession {
    /// Connect and authenticate; panics on login failure
    pub async fn login(addr: SocketAddr, username: &str, password: &str) -> Self {
        let mut session = Self::connect(addr).await;
        let reply = session
            .send(&serde_json::json!({"username": username, "password": password}).to_string())
            .await;
        assert!(
            reply.contains(r#""status":"OK""#),
            "login failed: {reply}"
        );
        session
    }

    /// Connect without authenticating
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    /// Send one line and read one reply line
    pub async fn send(&mut self, line: &str) -> String {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.lines
            .next_line()
            .await
            .unwrap()
            .expect("server closed the connection")
    }

    /// Read one line without sending (for rejection messages)
    pub async fn read_line(&mut self) -> Option<String> {
        self.lines.next_line().await.unwrap()
    }
}

/// Deterministic pseudo-random vector
pub fn seeded_vector(dims: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..dims).map(|_| rng.gen::<f32>() * 2.0 - 1.0).collect()
}

/// The `[i, i+1, i+2, i+3]` ramp used by the search scenarios
pub fn ramp_vector(i: i64, dims: usize) -> Vec<f32> {
    (0..dims).map(|d| (i + d as i64) as f32).collect()
}

pub fn format_vector(vector: &[f32]) -> String {
    vector
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
