//! HTTP binding: the target (or a simulator bridge) is already running and
//! accepts one JSON POST per command.
//!
//! Nothing is retried. A retried mutating command could apply twice, so
//! retry policy belongs to the scenario.

use async_trait::async_trait;
use tracing::debug;

use super::Transport;
use crate::config::{AgentConfig, TransportKind};
use crate::error::DriveError;
use crate::protocol::{Command, Response};

/// Posts each command to a fixed endpoint.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    active: bool,
}

impl HttpTransport {
    pub fn new(config: &AgentConfig) -> Result<Self, DriveError> {
        let client = reqwest::Client::builder()
            .timeout(config.action_timeout)
            .build()
            .map_err(|e| DriveError::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim().to_string(),
            active: false,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    /// Reachability is checked lazily by the first command.
    async fn start(&mut self) -> Result<(), DriveError> {
        debug!(endpoint = %self.endpoint, "using HTTP target");
        self.active = true;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), DriveError> {
        self.active = false;
        Ok(())
    }

    async fn send(&mut self, command: &Command) -> Result<Response, DriveError> {
        debug!(endpoint = %self.endpoint, action = command.action(), "posting command");

        let reply = self
            .client
            .post(&self.endpoint)
            .json(command)
            .send()
            .await
            .map_err(|e| DriveError::Transport {
                reason: describe(&self.endpoint, &e),
            })?;

        let status = reply.status();
        let body = reply.text().await.map_err(|e| DriveError::Transport {
            reason: describe(&self.endpoint, &e),
        })?;

        if !status.is_success() {
            return Err(DriveError::Transport {
                reason: format!("{} answered {status}: {}", self.endpoint, body.trim()),
            });
        }

        let response = Response::parse(&body)?;
        debug!(response = %body.trim(), "received HTTP response");
        Ok(response)
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

fn describe(endpoint: &str, err: &reqwest::Error) -> String {
    if err.is_timeout() {
        format!("request to {endpoint} timed out: {err}")
    } else if err.is_connect() {
        format!("connection to {endpoint} failed: {err}")
    } else {
        format!("request to {endpoint} failed: {err}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_test_utils::HttpTarget;
    use serde_json::json;
    use std::time::Duration;

    fn transport(endpoint: &str, timeout: Duration) -> HttpTransport {
        HttpTransport::new(&AgentConfig::http(endpoint).with_action_timeout(timeout)).unwrap()
    }

    #[tokio::test]
    async fn posts_commands_and_parses_responses() {
        let target = HttpTarget::spawn().await;
        let mut transport = transport(&target.endpoint(), Duration::from_secs(2));
        transport.start().await.unwrap();

        let tapped = transport.send(&Command::new("tap").unwrap()).await.unwrap();
        assert_eq!(tapped.get("count"), Some(&json!(1)));
        let state = transport.send(&Command::new("get_state").unwrap()).await.unwrap();
        assert_eq!(state.get("count"), Some(&json!(1)));

        let received = target.received();
        assert_eq!(received, vec![json!({"action": "tap"}), json!({"action": "get_state"})]);
    }

    #[tokio::test]
    async fn start_and_stop_never_touch_the_network() {
        let mut transport = transport("http://127.0.0.1:9/api", Duration::from_secs(1));
        transport.start().await.unwrap();
        assert!(transport.is_active());
        transport.stop().await.unwrap();
        transport.stop().await.unwrap();
        assert!(!transport.is_active());
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transport_error() {
        let mut transport = transport("http://127.0.0.1:9/api", Duration::from_secs(1));
        let err = transport.send(&Command::new("tap").unwrap()).await.unwrap_err();
        assert_eq!(err.kind(), "TransportError");
        assert!(err.to_string().contains("127.0.0.1:9"), "got: {err}");
    }

    #[tokio::test]
    async fn slow_target_times_out_as_transport_error() {
        let target = HttpTarget::spawn().await;
        let mut transport = transport(&target.endpoint(), Duration::from_millis(300));
        let err = transport.send(&Command::new("slow").unwrap()).await.unwrap_err();
        assert_eq!(err.kind(), "TransportError");
        assert!(err.to_string().contains("timed out"), "got: {err}");
    }

    #[tokio::test]
    async fn server_error_status_is_transport_error() {
        let target = HttpTarget::spawn().await;
        let mut transport = transport(&target.endpoint(), Duration::from_secs(2));
        let err = transport.send(&Command::new("fail").unwrap()).await.unwrap_err();
        assert_eq!(err.kind(), "TransportError");
        assert!(err.to_string().contains("500"), "got: {err}");
    }

    #[tokio::test]
    async fn non_json_body_is_protocol_error() {
        let target = HttpTarget::spawn().await;
        let mut transport = transport(&target.endpoint(), Duration::from_secs(2));
        let err = transport.send(&Command::new("garbage").unwrap()).await.unwrap_err();
        match err {
            DriveError::Protocol { raw, .. } => assert_eq!(raw, "this is not json"),
            other => panic!("expected protocol error, got {other:?}"),
        }
    }
}
