//! Remote device service: session creation/attachment and action execution.
//!
//! The traits are the seam the agent talks to; `ScrapybaraConnector` is the
//! HTTP implementation.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::env;
use tracing::debug;

use crate::action::DeviceOperation;
use crate::error::CuaError;
use crate::state::Environment;

/// Response of the device's computer endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputerResponse {
    #[serde(default)]
    pub base_64_image: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[async_trait]
pub trait DeviceInstance: Send + Sync {
    fn id(&self) -> &str;
    async fn stream_url(&self) -> Result<String, CuaError>;
    async fn computer(&self, op: &DeviceOperation) -> Result<ComputerResponse, CuaError>;
    /// Restores a saved browser authentication state.
    async fn authenticate(&self, auth_state_id: &str) -> Result<(), CuaError>;
}

#[async_trait]
pub trait DeviceClient: Send + Sync {
    async fn start(
        &self,
        environment: Environment,
        timeout_hours: f64,
    ) -> Result<Box<dyn DeviceInstance>, CuaError>;
    async fn get(&self, instance_id: &str) -> Result<Box<dyn DeviceInstance>, CuaError>;
}

/// Builds an authenticated client from a resolved API key.
pub trait DeviceConnector: Send + Sync {
    fn connect(&self, api_key: &str) -> Result<Box<dyn DeviceClient>, CuaError>;
}

// ========================= Scrapybara HTTP Adapter =========================

#[derive(Clone)]
pub struct ScrapybaraConnector {
    http: Client,
    base_url: String,
}

impl Default for ScrapybaraConnector {
    fn default() -> Self {
        Self::new(
            env::var("SCRAPYBARA_BASE_URL").unwrap_or_else(|_| "https://api.scrapybara.com/v1".into()),
        )
    }
}

impl ScrapybaraConnector {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { http: Client::new(), base_url: base_url.into().trim_end_matches('/').to_string() }
    }
}

impl DeviceConnector for ScrapybaraConnector {
    fn connect(&self, api_key: &str) -> Result<Box<dyn DeviceClient>, CuaError> {
        if api_key.trim().is_empty() {
            return Err(CuaError::missing_api_key());
        }
        Ok(Box::new(ScrapybaraClient {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            api_key: api_key.to_string(),
        }))
    }
}

#[derive(Clone)]
pub struct ScrapybaraClient {
    http: Client,
    base_url: String,
    api_key: String,
}

#[derive(Deserialize)]
struct InstanceBody {
    id: String,
}

#[derive(Deserialize)]
struct StreamUrlBody {
    stream_url: String,
}

fn instance_type(environment: Environment) -> &'static str {
    match environment {
        Environment::Web => "browser",
        Environment::Ubuntu => "ubuntu",
        Environment::Windows => "windows",
    }
}

impl ScrapybaraClient {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, req: RequestBuilder) -> Result<Value, CuaError> {
        let resp = req.header("x-api-key", &self.api_key).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if status == StatusCode::NOT_FOUND {
            return Err(CuaError::NotFound(text));
        }
        if !status.is_success() {
            return Err(CuaError::Device(format!("Scrapybara error {}: {}", status, text)));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    fn instance(&self, id: String) -> Box<dyn DeviceInstance> {
        Box::new(ScrapybaraInstance { id, client: self.clone() })
    }
}

#[async_trait]
impl DeviceClient for ScrapybaraClient {
    async fn start(
        &self,
        environment: Environment,
        timeout_hours: f64,
    ) -> Result<Box<dyn DeviceInstance>, CuaError> {
        let body = json!({
            "instance_type": instance_type(environment),
            "timeout_hours": timeout_hours,
        });
        let v = self.send(self.http.post(self.url("/start")).json(&body)).await?;
        let created: InstanceBody = serde_json::from_value(v)?;
        debug!(instance_id = %created.id, %environment, "started instance");
        Ok(self.instance(created.id))
    }

    async fn get(&self, instance_id: &str) -> Result<Box<dyn DeviceInstance>, CuaError> {
        let v = self
            .send(self.http.get(self.url(&format!("/instance/{}", instance_id))))
            .await?;
        let found: InstanceBody = serde_json::from_value(v)?;
        Ok(self.instance(found.id))
    }
}

pub struct ScrapybaraInstance {
    id: String,
    client: ScrapybaraClient,
}

#[async_trait]
impl DeviceInstance for ScrapybaraInstance {
    fn id(&self) -> &str {
        &self.id
    }

    async fn stream_url(&self) -> Result<String, CuaError> {
        let c = &self.client;
        let v = c
            .send(c.http.get(c.url(&format!("/instance/{}/stream_url", self.id))))
            .await?;
        let body: StreamUrlBody = serde_json::from_value(v)?;
        Ok(body.stream_url)
    }

    async fn computer(&self, op: &DeviceOperation) -> Result<ComputerResponse, CuaError> {
        let c = &self.client;
        let v = c
            .send(c.http.post(c.url(&format!("/instance/{}/computer", self.id))).json(op))
            .await?;
        let resp: ComputerResponse = serde_json::from_value(v)?;
        if let Some(err) = resp.error.as_deref().filter(|e| !e.is_empty()) {
            return Err(CuaError::Device(err.to_string()));
        }
        Ok(resp)
    }

    async fn authenticate(&self, auth_state_id: &str) -> Result<(), CuaError> {
        let c = &self.client;
        c.send(
            c.http
                .post(c.url(&format!("/instance/{}/browser/authenticate", self.id)))
                .query(&[("auth_state_id", auth_state_id)]),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_requires_a_key() {
        let connector = ScrapybaraConnector::new("http://localhost/v1/");
        assert!(matches!(connector.connect(""), Err(CuaError::Configuration(_))));
        assert!(connector.connect("key").is_ok());
        assert_eq!(connector.base_url, "http://localhost/v1");
    }

    #[test]
    fn environment_selects_instance_kind() {
        assert_eq!(instance_type(Environment::Web), "browser");
        assert_eq!(instance_type(Environment::Ubuntu), "ubuntu");
        assert_eq!(instance_type(Environment::Windows), "windows");
    }

    #[test]
    fn computer_response_tolerates_missing_fields() {
        let resp: ComputerResponse = serde_json::from_str(r#"{"output": "ok"}"#).unwrap();
        assert!(resp.base_64_image.is_none());
        assert_eq!(resp.output.as_deref(), Some("ok"));
    }
}
