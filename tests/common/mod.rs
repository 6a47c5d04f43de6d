//! Common test utilities - SkirmishTest harness for end-to-end testing

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};
use skirmishd::{Config, Server};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Test harness that runs a real skirmishd server on a random port
pub struct SkirmishTest {
    pub addr: SocketAddr,
    pub client: Client,
    server: Arc<Server>,
    _handle: JoinHandle<()>,
}

impl SkirmishTest {
    /// Start a new test server instance with an in-memory database
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let config = Config {
            bind_addr: addr,
            db_path: None,
            ..Config::default()
        };

        let server = Arc::new(Server::new(config).await?);
        let server_clone = server.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = server_clone.serve(listener).await {
                eprintln!("Server error: {}", e);
            }
        });

        let client = Client::builder().timeout(Duration::from_secs(5)).build()?;

        Ok(Self {
            addr,
            client,
            server,
            _handle: handle,
        })
    }

    /// Get the base URL for the server
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Unauthenticated GET
    pub async fn get(&self, path: &str) -> Result<reqwest::Response> {
        Ok(self
            .client
            .get(format!("{}{}", self.base_url(), path))
            .send()
            .await?)
    }

    /// Unauthenticated POST with JSON body
    pub async fn post<T: serde::Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<reqwest::Response> {
        Ok(self
            .client
            .post(format!("{}{}", self.base_url(), path))
            .json(body)
            .send()
            .await?)
    }

    /// Get direct access to the database for test setup/assertions
    pub fn db(&self) -> Arc<skirmishd::db::Database> {
        self.server.db()
    }

    /// Register an account and return a client acting as it
    pub async fn register(&self, username: &str, role: &str) -> Result<UserClient> {
        let resp = self
            .post(
                "/auth/register",
                &json!({ "username": username, "password": "hunter22", "role": role }),
            )
            .await?;
        anyhow::ensure!(resp.status() == 201, "register failed: {}", resp.status());
        let body: Value = resp.json().await?;
        let token = body["token"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("no token in {}", body))?
            .to_string();
        let account_id = body["account_id"].as_str().unwrap_or_default().to_string();
        Ok(UserClient {
            base_url: self.base_url(),
            addr: self.addr,
            client: self.client.clone(),
            token,
            account_id,
        })
    }

    /// Insert a character sheet row for participant prefill
    pub async fn create_character(&self, name: &str, dexterity: i32, max_hp: i32) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO characters (id, name, class, level, dexterity, max_hit_points, current_hit_points, armor_class)
             VALUES (?, ?, 'rogue', 2, ?, ?, ?, 14)",
        )
        .bind(&id)
        .bind(name)
        .bind(dexterity)
        .bind(max_hp)
        .bind(max_hp)
        .execute(self.db().pool())
        .await?;
        Ok(id)
    }
}

impl Drop for SkirmishTest {
    fn drop(&mut self) {
        self.server.shutdown();
    }
}

/// An authenticated account talking to the test server
pub struct UserClient {
    base_url: String,
    addr: SocketAddr,
    client: Client,
    pub token: String,
    pub account_id: String,
}

impl UserClient {
    pub async fn get(&self, path: &str) -> Result<reqwest::Response> {
        Ok(self
            .client
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .send()
            .await?)
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<reqwest::Response> {
        Ok(self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?)
    }

    pub async fn put(&self, path: &str, body: Value) -> Result<reqwest::Response> {
        Ok(self
            .client
            .put(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?)
    }

    /// POST and parse the JSON body, failing on an error status
    pub async fn post_ok(&self, path: &str, body: Value) -> Result<Value> {
        let resp = self.post(path, body).await?;
        let status = resp.status();
        let body: Value = resp.json().await?;
        anyhow::ensure!(status.is_success(), "POST {} -> {}: {}", path, status, body);
        Ok(body)
    }

    /// Create a session and return its id
    pub async fn create_session(&self, name: &str) -> Result<String> {
        let body = self.post_ok("/combat", json!({ "name": name })).await?;
        Ok(body["id"].as_str().unwrap_or_default().to_string())
    }

    /// Add a participant and return its id
    pub async fn add_participant(
        &self,
        session_id: &str,
        name: &str,
        initiative: i32,
        max_hp: u32,
    ) -> Result<String> {
        let body = self
            .post_ok(
                &format!("/combat/{}/participants", session_id),
                json!({ "name": name, "initiative": initiative, "max_hit_points": max_hp }),
            )
            .await?;
        Ok(body["id"].as_str().unwrap_or_default().to_string())
    }

    /// Open a WebSocket as this account
    pub async fn connect_ws(&self) -> Result<WsClient> {
        let url = format!("ws://{}/ws?token={}", self.addr, self.token);
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (write, read) = ws_stream.split();
        Ok(WsClient { write, read })
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// WebSocket client for testing
pub struct WsClient {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
}

impl WsClient {
    /// Send a client message
    pub async fn send_json(&mut self, msg: Value) -> Result<()> {
        self.write
            .send(Message::Text(msg.to_string().into()))
            .await?;
        Ok(())
    }

    pub async fn join(&mut self, session_id: &str) -> Result<()> {
        self.send_json(json!({ "type": "joinCombat", "session_id": session_id }))
            .await
    }

    /// Receive the next message as JSON
    pub async fn recv_json(&mut self) -> Result<Value> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(serde_json::from_str(&text)?);
                }
                Some(Ok(Message::Close(_))) | None => {
                    anyhow::bail!("WebSocket closed");
                }
                _ => continue,
            }
        }
    }

    /// Receive with timeout
    pub async fn recv_json_timeout(&mut self, timeout: Duration) -> Result<Value> {
        match tokio::time::timeout(timeout, self.recv_json()).await {
            Ok(result) => result,
            Err(_) => anyhow::bail!("Timeout waiting for WebSocket message"),
        }
    }

    /// Skip messages until one of the given type arrives
    pub async fn recv_type(&mut self, kind: &str) -> Result<Value> {
        loop {
            let msg = self.recv_json_timeout(Duration::from_secs(2)).await?;
            if msg["type"] == kind {
                return Ok(msg);
            }
        }
    }

    /// Skip messages until a combat event with the given name arrives
    pub async fn recv_event(&mut self, event: &str) -> Result<Value> {
        loop {
            let msg = self.recv_type("combat").await?;
            if msg["event"] == event {
                return Ok(msg);
            }
        }
    }

    /// Close the connection
    pub async fn close(&mut self) -> Result<()> {
        self.write.close().await?;
        Ok(())
    }
}
