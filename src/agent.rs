use std::{
    env,
    sync::Arc,
    time::{Duration, Instant},
};

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::{
    config::AgentConfig,
    error::{FleetError, Result},
    server::{AckRequest, IngestRequest},
};

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Errors from a single agent request. Both kinds are transient from the
/// loop's point of view: they are logged and the next scheduled attempt is
/// relied on instead of retrying.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server responded with {0}")]
    Status(StatusCode),
}

/// Command object as seen by the polling agent.
#[derive(Debug, Clone, Deserialize)]
pub struct PolledCommand {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// One telemetry reading handed to the report loop.
#[derive(Debug, Clone)]
pub struct TelemetrySample {
    pub hostname: String,
    pub cpu: f64,
    pub ram: f64,
    pub disk: f64,
    pub uptime_sec: u64,
}

/// Source of telemetry readings. OS metric collection is outside this
/// crate's scope; the producer is the seam where a real collector plugs in.
pub trait PayloadProducer: Send {
    fn collect(&mut self) -> TelemetrySample;
}

/// Default producer: fixed gauges plus the agent process uptime.
pub struct StubProducer {
    hostname: String,
    started: Instant,
}

impl StubProducer {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            started: Instant::now(),
        }
    }
}

impl PayloadProducer for StubProducer {
    fn collect(&mut self) -> TelemetrySample {
        TelemetrySample {
            hostname: self.hostname.clone(),
            cpu: 0.0,
            ram: 0.0,
            disk: 0.0,
            uptime_sec: self.started.elapsed().as_secs(),
        }
    }
}

/// HTTP client for the agent's three calls: ingest post, next-command poll
/// and ack post. Every request carries the organization token and the fixed
/// request timeout.
pub struct AgentClient {
    http: reqwest::Client,
    base_url: String,
    device_id: String,
    org_token: String,
}

impl AgentClient {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        if config.device_id.trim().is_empty() {
            return Err(FleetError::Config(
                "agent device_id is not configured".to_string(),
            ));
        }
        let org_token = config
            .org_token
            .clone()
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| FleetError::Config("agent org_token is not configured".to_string()))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .map_err(|err| FleetError::Config(format!("failed to build http client: {err}")))?;

        Ok(Self {
            http,
            base_url: config.server_url.trim_end_matches('/').to_string(),
            device_id: config.device_id.clone(),
            org_token,
        })
    }

    pub async fn post_report(
        &self,
        report: &IngestRequest,
    ) -> std::result::Result<(), RequestError> {
        let response = self
            .http
            .post(format!("{}/ingest", self.base_url))
            .header("X-Auth-Token", &self.org_token)
            .json(report)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RequestError::Status(response.status()));
        }
        Ok(())
    }

    pub async fn poll_next(&self) -> std::result::Result<Option<PolledCommand>, RequestError> {
        let response = self
            .http
            .get(format!(
                "{}/devices/{}/commands/next",
                self.base_url, self.device_id
            ))
            .header("X-Auth-Token", &self.org_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RequestError::Status(response.status()));
        }
        Ok(response.json().await?)
    }

    pub async fn ack(
        &self,
        command_id: i64,
        success: bool,
        message: &str,
    ) -> std::result::Result<(), RequestError> {
        let response = self
            .http
            .post(format!(
                "{}/devices/{}/commands/{}/ack",
                self.base_url, self.device_id, command_id
            ))
            .header("X-Auth-Token", &self.org_token)
            .json(&AckRequest {
                success,
                message: Some(message.to_string()),
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RequestError::Status(response.status()));
        }
        Ok(())
    }
}

/// Runs the reporting agent until interrupted: a telemetry report loop and a
/// command poll loop as two independently scheduled tasks. A failure in one
/// never blocks the other, and neither ever crashes the process.
pub async fn run(config: AgentConfig) -> Result<()> {
    let client = Arc::new(AgentClient::new(&config)?);
    let hostname = config
        .hostname
        .clone()
        .filter(|value| !value.trim().is_empty())
        .or_else(|| env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "unknown".to_string());
    info!(
        device_id = %config.device_id,
        server = %config.server_url,
        version = AGENT_VERSION,
        "agent starting"
    );

    let producer = StubProducer::new(hostname);
    let reports = report_loop(Arc::clone(&client), Box::new(producer), config.clone());
    let commands = command_loop(client, config);

    tokio::select! {
        _ = reports => {}
        _ = commands => {}
        _ = tokio::signal::ctrl_c() => {
            info!("agent stopped");
        }
    }
    Ok(())
}

async fn report_loop(
    client: Arc<AgentClient>,
    mut producer: Box<dyn PayloadProducer>,
    config: AgentConfig,
) {
    let mut ticker = interval(Duration::from_secs(config.interval_secs.max(1)));
    let mut last_error = String::new();
    loop {
        ticker.tick().await;
        let sample = producer.collect();
        let report = IngestRequest {
            device_id: config.device_id.clone(),
            hostname: sample.hostname,
            cpu: sample.cpu,
            ram: sample.ram,
            disk: sample.disk,
            uptime_sec: sample.uptime_sec,
            agent_version: Some(AGENT_VERSION.to_string()),
            status: Some(if last_error.is_empty() { "ok" } else { "error" }.to_string()),
            last_error: (!last_error.is_empty()).then(|| last_error.clone()),
        };
        match client.post_report(&report).await {
            Ok(()) => {
                last_error.clear();
                debug!("telemetry sent");
            }
            Err(err) => {
                last_error = err.to_string();
                warn!("telemetry report failed: {err}");
            }
        }
    }
}

async fn command_loop(client: Arc<AgentClient>, config: AgentConfig) {
    let mut ticker = interval(Duration::from_secs(config.poll_interval_secs.max(1)));
    loop {
        ticker.tick().await;
        match client.poll_next().await {
            Ok(Some(command)) => {
                let (success, message) = execute(&command);
                if let Err(err) = client.ack(command.id, success, &message).await {
                    warn!(command = command.id, "ack failed: {err}");
                }
            }
            Ok(None) => {}
            Err(err) => warn!("command poll failed: {err}"),
        }
    }
}

/// Execution is mocked: the agent confirms receipt and echoes the command
/// name in the result.
fn execute(command: &PolledCommand) -> (bool, String) {
    info!(id = command.id, name = %command.name, args = %command.args, "executing command");
    (true, format!("executed {}", command.name))
}

#[cfg(test)]
mod tests {
    use mockito::{Matcher, Server};
    use serde_json::json;

    use super::*;

    fn test_config(server_url: String) -> AgentConfig {
        AgentConfig {
            server_url,
            device_id: "dev-1".to_string(),
            org_token: Some("tok-test".to_string()),
            hostname: Some("test-host".to_string()),
            interval_secs: 10,
            poll_interval_secs: 5,
            request_timeout_secs: 5,
        }
    }

    fn sample_report() -> IngestRequest {
        IngestRequest {
            device_id: "dev-1".to_string(),
            hostname: "test-host".to_string(),
            cpu: 10.0,
            ram: 20.0,
            disk: 30.0,
            uptime_sec: 40,
            agent_version: Some(AGENT_VERSION.to_string()),
            status: Some("ok".to_string()),
            last_error: None,
        }
    }

    #[test]
    fn client_requires_device_id_and_token() {
        let mut config = test_config("http://127.0.0.1:1".to_string());
        config.device_id = String::new();
        assert!(AgentClient::new(&config).is_err());

        let mut config = test_config("http://127.0.0.1:1".to_string());
        config.org_token = None;
        assert!(AgentClient::new(&config).is_err());
    }

    #[tokio::test]
    async fn post_report_sends_token_and_payload() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/ingest")
            .match_header("x-auth-token", "tok-test")
            .match_body(Matcher::PartialJson(json!({
                "device_id": "dev-1",
                "hostname": "test-host",
                "cpu": 10.0,
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok": true, "ts_utc": "2026-08-06T12:00:00Z"}"#)
            .create_async()
            .await;

        let client = AgentClient::new(&test_config(server.url())).unwrap();
        client.post_report(&sample_report()).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn post_report_surfaces_unauthorized() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/ingest")
            .with_status(401)
            .create_async()
            .await;

        let client = AgentClient::new(&test_config(server.url())).unwrap();
        let err = client.post_report(&sample_report()).await.unwrap_err();
        assert!(matches!(
            err,
            RequestError::Status(StatusCode::UNAUTHORIZED)
        ));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn poll_next_handles_empty_queue() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/devices/dev-1/commands/next")
            .match_header("x-auth-token", "tok-test")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("null")
            .create_async()
            .await;

        let client = AgentClient::new(&test_config(server.url())).unwrap();
        assert!(client.poll_next().await.unwrap().is_none());

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn poll_next_parses_command() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/devices/dev-1/commands/next")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"id": 3, "device_id": "dev-1", "name": "reboot",
                    "args": {"delay": 5}, "status": "in_progress",
                    "created_at": "2026-08-06T12:00:00Z",
                    "lease_expires_at": "2026-08-06T12:01:00Z",
                    "acked_at": null, "success": null, "message": null}"#,
            )
            .create_async()
            .await;

        let client = AgentClient::new(&test_config(server.url())).unwrap();
        let command = client.poll_next().await.unwrap().unwrap();
        assert_eq!(command.id, 3);
        assert_eq!(command.name, "reboot");
        assert_eq!(command.args, json!({"delay": 5}));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn ack_posts_result() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/devices/dev-1/commands/3/ack")
            .match_body(Matcher::Json(
                json!({"success": true, "message": "executed reboot"}),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok": true, "acked_at": "2026-08-06T12:00:05Z"}"#)
            .create_async()
            .await;

        let client = AgentClient::new(&test_config(server.url())).unwrap();
        client.ack(3, true, "executed reboot").await.unwrap();

        mock.assert_async().await;
    }

    #[test]
    fn mock_execution_echoes_command_name() {
        let command = PolledCommand {
            id: 1,
            name: "restart-service".to_string(),
            args: json!({}),
        };
        let (success, message) = execute(&command);
        assert!(success);
        assert_eq!(message, "executed restart-service");
    }
}
