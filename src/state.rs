use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

use crate::error::CuaError;

// ========================= Environment =========================

/// Kind of remote device backing a session. Fixed for the lifetime of a thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Web,
    #[serde(alias = "desktop-linux")]
    Ubuntu,
    #[serde(alias = "desktop-windows")]
    Windows,
}

impl Environment {
    /// Canonical name used in state and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Web => "web",
            Environment::Ubuntu => "ubuntu",
            Environment::Windows => "windows",
        }
    }

    /// Environment name in the model's tool vocabulary.
    pub fn model_environment(&self) -> &'static str {
        match self {
            Environment::Web => "browser",
            Environment::Ubuntu => "ubuntu",
            Environment::Windows => "windows",
        }
    }
}

impl FromStr for Environment {
    type Err = CuaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "web" => Ok(Environment::Web),
            "ubuntu" | "desktop-linux" => Ok(Environment::Ubuntu),
            "windows" | "desktop-windows" => Ok(Environment::Windows),
            other => Err(CuaError::InvalidEnvironment(other.to_string())),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ========================= Conversation Turns =========================

/// Continuation token returned by the model for each response.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseId(pub String);

impl fmt::Display for ResponseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A check the model raised on a computer call. Executing the call
/// acknowledges it in the returned result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyCheck {
    pub id: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// A device action requested by the model. `action` keeps the model's raw
/// payload; it is only decoded when the action is executed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComputerCall {
    pub call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub action: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_safety_checks: Vec<SafetyCheck>,
}

impl ComputerCall {
    pub fn action_type(&self) -> Option<&str> {
        self.action.get("type").and_then(|t| t.as_str())
    }
}

/// One model-authored turn: optional text plus any computer calls.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AssistantTurn {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<ResponseId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub computer_calls: Vec<ComputerCall>,
}

impl AssistantTurn {
    pub fn text(response_id: Option<ResponseId>, text: impl Into<String>) -> Self {
        Self { response_id, text: Some(text.into()), computer_calls: Vec::new() }
    }

    /// Only the first computer call of a turn is executed.
    pub fn computer_call(&self) -> Option<&ComputerCall> {
        self.computer_calls.first()
    }
}

/// A conversation turn, tagged by author role.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    System { content: String },
    User { content: String },
    Assistant(AssistantTurn),
    Tool { call_id: String, content: String },
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Message::System { content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Message::User { content: content.into() }
    }

    pub fn as_assistant(&self) -> Option<&AssistantTurn> {
        match self {
            Message::Assistant(turn) => Some(turn),
            _ => None,
        }
    }
}

// ========================= Device Action Result =========================

/// Screenshot taken after an action, carried as a data URL.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenshotOutput {
    /// `data:image/png;base64,...`
    pub image_url: String,
}

impl ScreenshotOutput {
    const PNG_PREFIX: &'static str = "data:image/png;base64,";

    pub fn from_base64_png(b64: &str) -> Self {
        Self { image_url: format!("{}{}", Self::PNG_PREFIX, b64) }
    }

    /// Decodes the data URL back into raw PNG bytes.
    pub fn png_bytes(&self) -> Result<Vec<u8>, CuaError> {
        let b64 = self
            .image_url
            .strip_prefix(Self::PNG_PREFIX)
            .ok_or_else(|| CuaError::Device("screenshot is not a base64 png data url".into()))?;
        B64.decode(b64)
            .map_err(|e| CuaError::Device(format!("b64 decode: {}", e)))
    }
}

/// Outcome of the most recent device action, keyed by the originating call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceActionResult {
    pub call_id: String,
    pub output: ScreenshotOutput,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub acknowledged_safety_checks: Vec<SafetyCheck>,
}

// ========================= Session State =========================

fn new_thread_id() -> String {
    nanoid!()
}

/// Everything carried between nodes of the loop for one conversation thread.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(default = "new_thread_id")]
    pub thread_id: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub stream_url: Option<String>,
    #[serde(default)]
    pub device_action_result: Option<DeviceActionResult>,
    #[serde(default)]
    pub authenticated_id: Option<String>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new(Environment::default())
    }
}

impl SessionState {
    pub fn new(environment: Environment) -> Self {
        Self {
            thread_id: new_thread_id(),
            messages: Vec::new(),
            environment,
            instance_id: None,
            stream_url: None,
            device_action_result: None,
            authenticated_id: None,
        }
    }

    pub fn with_messages(mut self, messages: impl IntoIterator<Item = Message>) -> Self {
        self.messages.extend(messages);
        self
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// The computer call carried by the latest turn, if that turn is model-authored.
    pub fn pending_computer_call(&self) -> Option<&ComputerCall> {
        self.last_message()
            .and_then(Message::as_assistant)
            .and_then(AssistantTurn::computer_call)
    }

    /// Merges a partial update. Messages are appended, the action-result slot is
    /// replaced wholesale, and `instance_id` / `stream_url` are write-once.
    pub fn apply(&mut self, update: StateUpdate) {
        self.messages.extend(update.messages);

        if let Some(id) = update.instance_id {
            match &self.instance_id {
                None => self.instance_id = Some(id),
                Some(existing) if *existing != id => {
                    warn!(existing = %existing, ignored = %id, "instance_id is already set for this thread");
                }
                Some(_) => {}
            }
        }

        if let Some(url) = update.stream_url {
            if self.stream_url.is_none() {
                self.stream_url = Some(url);
            }
        }

        if let Some(slot) = update.device_action_result {
            self.device_action_result = slot;
        }

        if let Some(id) = update.authenticated_id {
            self.authenticated_id = Some(id);
        }
    }
}

/// Partial update returned by each node and merged by the caller.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StateUpdate {
    pub messages: Vec<Message>,
    pub instance_id: Option<String>,
    pub stream_url: Option<String>,
    /// `None` leaves the slot untouched; `Some(None)` clears it.
    pub device_action_result: Option<Option<DeviceActionResult>>,
    pub authenticated_id: Option<String>,
}

impl StateUpdate {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
            && self.instance_id.is_none()
            && self.stream_url.is_none()
            && self.device_action_result.is_none()
            && self.authenticated_id.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(call_id: &str) -> DeviceActionResult {
        DeviceActionResult {
            call_id: call_id.into(),
            output: ScreenshotOutput::from_base64_png("aGVsbG8="),
            acknowledged_safety_checks: Vec::new(),
        }
    }

    #[test]
    fn environment_parses_both_vocabularies() {
        assert_eq!("web".parse::<Environment>().unwrap(), Environment::Web);
        assert_eq!("desktop-linux".parse::<Environment>().unwrap(), Environment::Ubuntu);
        assert_eq!("windows".parse::<Environment>().unwrap(), Environment::Windows);
        let err = "macos".parse::<Environment>().unwrap_err();
        assert!(matches!(err, CuaError::InvalidEnvironment(ref v) if v == "macos"));
    }

    #[test]
    fn environment_maps_to_model_vocabulary() {
        assert_eq!(Environment::Web.model_environment(), "browser");
        assert_eq!(Environment::Ubuntu.model_environment(), "ubuntu");
        assert_eq!(Environment::Windows.model_environment(), "windows");
    }

    #[test]
    fn unknown_environment_is_rejected_on_deserialize() {
        let err = serde_json::from_value::<SessionState>(json!({ "environment": "amiga" }));
        assert!(err.is_err());
        let ok: SessionState = serde_json::from_value(json!({ "environment": "desktop-windows" })).unwrap();
        assert_eq!(ok.environment, Environment::Windows);
        assert!(!ok.thread_id.is_empty());
    }

    #[test]
    fn apply_appends_messages_in_order() {
        let mut state = SessionState::default().with_messages([Message::user("one")]);
        state.apply(StateUpdate { messages: vec![Message::user("two"), Message::user("three")], ..Default::default() });
        let contents: Vec<_> = state
            .messages
            .iter()
            .map(|m| match m {
                Message::User { content } => content.as_str(),
                _ => "",
            })
            .collect();
        assert_eq!(contents, vec!["one", "two", "three"]);
    }

    #[test]
    fn action_result_slot_is_replaced_not_accumulated() {
        let mut state = SessionState::default();
        state.apply(StateUpdate { device_action_result: Some(Some(result("a"))), ..Default::default() });
        state.apply(StateUpdate { device_action_result: Some(Some(result("b"))), ..Default::default() });
        assert_eq!(state.device_action_result.as_ref().unwrap().call_id, "b");
        assert!(state.messages.is_empty());

        state.apply(StateUpdate::default());
        assert!(state.device_action_result.is_some());
        state.apply(StateUpdate { device_action_result: Some(None), ..Default::default() });
        assert!(state.device_action_result.is_none());
    }

    #[test]
    fn instance_id_and_stream_url_are_write_once() {
        let mut state = SessionState::default();
        state.apply(StateUpdate {
            instance_id: Some("i-1".into()),
            stream_url: Some("https://stream/1".into()),
            ..Default::default()
        });
        state.apply(StateUpdate {
            instance_id: Some("i-2".into()),
            stream_url: Some("https://stream/2".into()),
            ..Default::default()
        });
        assert_eq!(state.instance_id.as_deref(), Some("i-1"));
        assert_eq!(state.stream_url.as_deref(), Some("https://stream/1"));
    }

    #[test]
    fn pending_call_requires_assistant_last() {
        let call = ComputerCall {
            call_id: "c1".into(),
            id: None,
            action: json!({ "type": "screenshot" }),
            pending_safety_checks: Vec::new(),
        };
        let turn = AssistantTurn { response_id: None, text: None, computer_calls: vec![call] };
        let mut state = SessionState::default().with_messages([Message::Assistant(turn)]);
        assert_eq!(state.pending_computer_call().unwrap().action_type(), Some("screenshot"));
        state.messages.push(Message::user("thanks"));
        assert!(state.pending_computer_call().is_none());
    }

    #[test]
    fn screenshot_data_url_decodes() {
        let out = ScreenshotOutput::from_base64_png("aGVsbG8=");
        assert_eq!(out.image_url, "data:image/png;base64,aGVsbG8=");
        assert_eq!(out.png_bytes().unwrap(), b"hello".to_vec());
        let bad = ScreenshotOutput { image_url: "https://example.com/x.png".into() };
        assert!(bad.png_bytes().is_err());
    }

    #[test]
    fn messages_round_trip_with_role_tag() {
        let v = serde_json::to_value(Message::user("hi")).unwrap();
        assert_eq!(v, json!({ "role": "user", "content": "hi" }));
    }
}
