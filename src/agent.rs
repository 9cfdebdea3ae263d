use async_trait::async_trait;
use futures::channel::mpsc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs as async_fs;
use tracing::{debug, info, warn};

use crate::action::translate;
use crate::config::{ResolvedConfig, RunConfig};
use crate::cua::{ComputerTool, ModelInput, ModelRequest, ResponsesModel};
use crate::device::{DeviceConnector, DeviceInstance};
use crate::error::CuaError;
use crate::state::{
    ComputerCall, DeviceActionResult, Environment, Message, ScreenshotOutput, SessionState,
    StateUpdate,
};

// ========================= Routing =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    CallModel,
    TakeComputerAction,
    End,
}

/// Routes to `TakeComputerAction` when the latest turn is model-authored and
/// carries a computer call.
pub fn take_action_or_end(state: &SessionState) -> Node {
    if state.pending_computer_call().is_some() {
        Node::TakeComputerAction
    } else {
        Node::End
    }
}

/// Routes back to the model only when the last action produced a result.
pub fn reinvoke_model_or_end(state: &SessionState) -> Node {
    if state.device_action_result.is_some() {
        Node::CallModel
    } else {
        Node::End
    }
}

// ========================= Out-of-band Stream =========================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamEvent {
    StreamUrl { stream_url: String },
}

/// Side channel for events an observer needs before the turn's update lands.
#[derive(Clone, Default)]
pub struct StreamWriter {
    tx: Option<mpsc::UnboundedSender<StreamEvent>>,
}

impl StreamWriter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn noop() -> Self {
        Self::default()
    }

    pub fn write(&self, event: StreamEvent) {
        if let Some(tx) = &self.tx {
            if tx.unbounded_send(event).is_err() {
                debug!("stream observer dropped");
            }
        }
    }
}

// ========================= Screenshot Archive =========================

#[async_trait]
pub trait ScreenshotStore: Send + Sync {
    async fn save(&self, thread_id: &str, result: &DeviceActionResult) -> Result<(), CuaError>;
}

pub struct DiskScreenshotStore {
    base_dir: PathBuf,
}

impl DiskScreenshotStore {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self { base_dir: base.as_ref().to_path_buf() }
    }
}

#[async_trait]
impl ScreenshotStore for DiskScreenshotStore {
    async fn save(&self, thread_id: &str, result: &DeviceActionResult) -> Result<(), CuaError> {
        let dir = self.base_dir.join(thread_id);
        async_fs::create_dir_all(&dir)
            .await
            .map_err(|e| CuaError::Device(format!("create_dir: {}", e)))?;
        let png = result.output.png_bytes()?;
        async_fs::write(dir.join(format!("{}.png", result.call_id)), &png)
            .await
            .map_err(|e| CuaError::Device(format!("write: {}", e)))?;
        Ok(())
    }
}

// ========================= Agent =========================

#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Upper bound on node executions per `invoke`.
    pub max_steps: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self { max_steps: 50 }
    }
}

pub struct Agent<M, D>
where
    M: ResponsesModel,
    D: DeviceConnector,
{
    model: M,
    devices: D,
    cfg: AgentConfig,
    screenshot_store: Option<Arc<dyn ScreenshotStore>>,
}

impl<M, D> Agent<M, D>
where
    M: ResponsesModel,
    D: DeviceConnector,
{
    pub fn new(model: M, devices: D, cfg: AgentConfig) -> Self {
        Self { model, devices, cfg, screenshot_store: None }
    }

    pub fn with_screenshot_store(mut self, store: Arc<dyn ScreenshotStore>) -> Self {
        self.screenshot_store = Some(store);
        self
    }

    /// Attaches to the thread's instance, or starts one for its environment.
    pub async fn init_or_load(
        &self,
        instance_id: Option<&str>,
        environment: Environment,
        config: &ResolvedConfig,
    ) -> Result<Box<dyn DeviceInstance>, CuaError> {
        let client = self.devices.connect(config.require_api_key()?)?;
        match instance_id {
            Some(id) => client.get(id).await,
            None => {
                info!(%environment, timeout_hours = config.timeout_hours, "starting instance");
                client.start(environment, config.timeout_hours).await
            }
        }
    }

    /// Restores a saved auth state onto an existing web instance. No-op unless
    /// the environment is web, an instance exists and an auth state is configured.
    pub async fn authenticate(
        &self,
        state: &SessionState,
        config: &RunConfig,
    ) -> Result<StateUpdate, CuaError> {
        let (instance_id, auth_state_id) = match (&state.instance_id, config.auth_state_id()) {
            (Some(i), Some(a)) if state.environment == Environment::Web => (i, a),
            _ => return Ok(StateUpdate::default()),
        };
        if state.authenticated_id.as_ref() == Some(&auth_state_id) {
            return Ok(StateUpdate::default());
        }

        let resolved = config.resolve()?;
        let instance = self.init_or_load(Some(instance_id.as_str()), state.environment, &resolved).await?;
        instance.authenticate(&auth_state_id).await?;
        info!(instance_id = %instance_id, auth_state_id = %auth_state_id, "restored auth state");
        Ok(StateUpdate { authenticated_id: Some(auth_state_id), ..Default::default() })
    }

    pub async fn call_model(&self, state: &SessionState) -> Result<StateUpdate, CuaError> {
        let previous_response_id = state
            .last_message()
            .and_then(Message::as_assistant)
            .and_then(|turn| turn.response_id.clone());

        let input = match &state.device_action_result {
            Some(result) => ModelInput::ComputerCallOutput(result.clone()),
            None => ModelInput::History(state.messages.clone()),
        };

        let turn = self
            .model
            .respond(ModelRequest {
                input,
                tool: ComputerTool::for_environment(state.environment),
                previous_response_id,
            })
            .await?;
        info!(
            response_id = ?turn.response_id,
            has_action = turn.computer_call().is_some(),
            "model turn"
        );

        Ok(StateUpdate {
            messages: vec![Message::Assistant(turn)],
            // consumed
            device_action_result: state.device_action_result.as_ref().map(|_| None),
            ..Default::default()
        })
    }

    pub async fn take_computer_action(
        &self,
        state: &SessionState,
        config: &RunConfig,
        writer: &StreamWriter,
    ) -> Result<StateUpdate, CuaError> {
        let call = match state.last_message() {
            Some(Message::Assistant(turn)) => turn.computer_call().cloned().ok_or_else(|| {
                CuaError::Precondition(
                    "cannot take computer action without a computer call in the last message".into(),
                )
            })?,
            _ => {
                return Err(CuaError::Precondition("last message must be an assistant turn".into()))
            }
        };

        let resolved = config.resolve()?;
        let instance = self
            .init_or_load(state.instance_id.as_deref(), state.environment, &resolved)
            .await?;

        let stream_url = match &state.stream_url {
            Some(url) => url.clone(),
            None => {
                let url = instance.stream_url().await?;
                writer.write(StreamEvent::StreamUrl { stream_url: url.clone() });
                url
            }
        };

        let result = match execute(instance.as_ref(), &call).await {
            Ok(result) => result,
            Err(err) => {
                warn!(
                    call_id = %call.call_id,
                    action = %call.action,
                    error = %err,
                    "failed to execute computer call"
                );
                None
            }
        };

        if let (Some(store), Some(result)) = (&self.screenshot_store, &result) {
            if let Err(err) = store.save(&state.thread_id, result).await {
                warn!(call_id = %result.call_id, error = %err, "failed to archive screenshot");
            }
        }

        Ok(StateUpdate {
            device_action_result: Some(result),
            instance_id: Some(instance.id().to_string()),
            stream_url: Some(stream_url),
            ..Default::default()
        })
    }

    /// Runs one node, merges its update and returns the next node.
    pub async fn step(
        &self,
        node: Node,
        state: &mut SessionState,
        config: &RunConfig,
        writer: &StreamWriter,
    ) -> Result<Node, CuaError> {
        let next = match node {
            Node::CallModel => {
                let update = self.call_model(state).await?;
                state.apply(update);
                take_action_or_end(state)
            }
            Node::TakeComputerAction => {
                let update = self.take_computer_action(state, config, writer).await?;
                state.apply(update);
                reinvoke_model_or_end(state)
            }
            Node::End => Node::End,
        };
        info!(from = ?node, to = ?next, "transition");
        Ok(next)
    }

    /// Drives one invocation of the loop until it ends.
    pub async fn invoke(
        &self,
        mut state: SessionState,
        config: &RunConfig,
        writer: &StreamWriter,
    ) -> Result<SessionState, CuaError> {
        let update = self.authenticate(&state, config).await?;
        state.apply(update);

        let mut node = Node::CallModel;
        let mut steps = 0;
        while node != Node::End {
            if steps >= self.cfg.max_steps {
                return Err(CuaError::StepLimit(self.cfg.max_steps));
            }
            node = self.step(node, &mut state, config, writer).await?;
            steps += 1;
        }
        info!(thread_id = %state.thread_id, steps, "invocation finished");
        Ok(state)
    }
}

async fn execute(
    instance: &dyn DeviceInstance,
    call: &ComputerCall,
) -> Result<Option<DeviceActionResult>, CuaError> {
    let op = translate(&call.action)?;
    info!(call_id = %call.call_id, operation = ?op, "executing computer call");
    let resp = instance.computer(&op).await?;
    match resp.base_64_image {
        Some(b64) => Ok(Some(DeviceActionResult {
            call_id: call.call_id.clone(),
            output: ScreenshotOutput::from_base64_png(&b64),
            acknowledged_safety_checks: call.pending_safety_checks.clone(),
        })),
        None => {
            warn!(
                call_id = %call.call_id,
                output = resp.output.as_deref().unwrap_or_default(),
                "computer call returned no screenshot"
            );
            Ok(None)
        }
    }
}
