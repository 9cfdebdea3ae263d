use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::env;
use tracing::debug;

use crate::error::CuaError;
use crate::state::{
    AssistantTurn, ComputerCall, DeviceActionResult, Environment, Message, ResponseId, SafetyCheck,
};

// The device service does not negotiate resolutions, so the tool geometry is fixed.
pub const DISPLAY_WIDTH: u32 = 1024;
pub const DISPLAY_HEIGHT: u32 = 768;

#[derive(Clone)]
pub struct CuaConfig {
    pub api_base: String, // e.g. "https://api.openai.com/v1"
    pub api_key: String,  // env OPENAI_API_KEY
    pub model: String,    // e.g. "computer-use-preview"
}

impl Default for CuaConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
            model: env::var("OPENAI_CUA_MODEL").unwrap_or_else(|_| "computer-use-preview".into()),
        }
    }
}

/// The single tool the model is bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ComputerTool {
    pub display_width: u32,
    pub display_height: u32,
    pub environment: Environment,
}

impl ComputerTool {
    pub fn for_environment(environment: Environment) -> Self {
        Self { display_width: DISPLAY_WIDTH, display_height: DISPLAY_HEIGHT, environment }
    }

    fn to_json(self) -> Value {
        json!({
            "type": "computer_use_preview",
            "display_width": self.display_width,
            "display_height": self.display_height,
            "environment": self.environment.model_environment(),
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ModelInput {
    History(Vec<Message>),
    ComputerCallOutput(DeviceActionResult),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelRequest {
    pub input: ModelInput,
    pub tool: ComputerTool,
    pub previous_response_id: Option<ResponseId>,
}

#[async_trait]
pub trait ResponsesModel: Send + Sync {
    async fn respond(&self, request: ModelRequest) -> Result<AssistantTurn, CuaError>;
}

#[derive(Clone)]
pub struct CuaClient {
    http: Client,
    cfg: CuaConfig,
}

impl CuaClient {
    pub fn new(cfg: CuaConfig) -> Result<Self, CuaError> {
        if cfg.api_key.is_empty() {
            return Err(CuaError::Configuration("OPENAI_API_KEY missing".into()));
        }
        Ok(Self { http: Client::new(), cfg })
    }

    pub fn build_body(&self, request: &ModelRequest) -> Value {
        let input = match &request.input {
            ModelInput::History(messages) => messages.iter().flat_map(message_items).collect(),
            ModelInput::ComputerCallOutput(result) => vec![computer_call_output_item(result)],
        };
        let mut body = json!({
            "model": self.cfg.model,
            "truncation": "auto",
            "tools": [request.tool.to_json()],
            "input": input,
        });
        if let Some(prev) = &request.previous_response_id {
            body["previous_response_id"] = Value::String(prev.0.clone());
        }
        body
    }

    pub(crate) fn parse_output(v: Value) -> Result<AssistantTurn, CuaError> {
        // The Responses API returns: { id, output: [ ... ], status }
        if let Some(err) = v.get("error").filter(|e| !e.is_null()) {
            return Err(CuaError::Model(err.to_string()));
        }
        let response_id = v
            .get("id")
            .and_then(|x| x.as_str())
            .map(|s| ResponseId(s.to_string()))
            .ok_or_else(|| CuaError::Model("missing id".into()))?;

        let outputs = v
            .get("output")
            .and_then(|x| x.as_array())
            .cloned()
            .unwrap_or_default();

        let mut texts: Vec<String> = Vec::new();
        let mut computer_calls = Vec::new();
        for o in &outputs {
            match o.get("type").and_then(|x| x.as_str()) {
                Some("computer_call") => {
                    let call_id = o
                        .get("call_id")
                        .and_then(|x| x.as_str())
                        .ok_or_else(|| CuaError::Model("computer_call without call_id".into()))?
                        .to_string();
                    let pending_safety_checks: Vec<SafetyCheck> = o
                        .get("pending_safety_checks")
                        .filter(|x| !x.is_null())
                        .cloned()
                        .map(serde_json::from_value)
                        .transpose()?
                        .unwrap_or_default();
                    computer_calls.push(ComputerCall {
                        call_id,
                        id: o.get("id").and_then(|x| x.as_str()).map(str::to_string),
                        action: o.get("action").cloned().unwrap_or(Value::Null),
                        pending_safety_checks,
                    });
                }
                Some("message") => {
                    let parts = o.get("content").and_then(|x| x.as_array());
                    for part in parts.into_iter().flatten() {
                        if let Some(text) = part.get("text").and_then(|x| x.as_str()) {
                            texts.push(text.to_string());
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(AssistantTurn {
            response_id: Some(response_id),
            text: (!texts.is_empty()).then(|| texts.join("\n")),
            computer_calls,
        })
    }
}

#[async_trait]
impl ResponsesModel for CuaClient {
    async fn respond(&self, request: ModelRequest) -> Result<AssistantTurn, CuaError> {
        let url = format!("{}/responses", self.cfg.api_base);
        let body = self.build_body(&request);
        debug!(previous = ?request.previous_response_id, "sending responses request");
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(CuaError::Model(format!("OpenAI error {}: {}", status, text)));
        }
        let v: Value = serde_json::from_str(&text)?;
        Self::parse_output(v)
    }
}

fn message_items(message: &Message) -> Vec<Value> {
    match message {
        Message::System { content } => vec![json!({ "role": "system", "content": content })],
        Message::User { content } => vec![json!({ "role": "user", "content": content })],
        Message::Tool { call_id, content } => vec![json!({
            "type": "function_call_output",
            "call_id": call_id,
            "output": content,
        })],
        // computer calls have no paired outputs in a replay, so only text is sent
        Message::Assistant(turn) => turn
            .text
            .iter()
            .map(|text| json!({ "role": "assistant", "content": text }))
            .collect(),
    }
}

fn computer_call_output_item(result: &DeviceActionResult) -> Value {
    let mut item = json!({
        "type": "computer_call_output",
        "call_id": result.call_id,
        "output": {
            "type": "computer_screenshot",
            "image_url": result.output.image_url,
        },
    });
    if !result.acknowledged_safety_checks.is_empty() {
        item["acknowledged_safety_checks"] = json!(result.acknowledged_safety_checks);
    }
    item
}
