//! Model action vocabulary and its translation into device operations.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CuaError;

/// Duration of a `wait` action. The model does not supply one.
pub const WAIT_DURATION_MS: u64 = 2000;

const KNOWN_ACTIONS: &[&str] = &[
    "click",
    "double_click",
    "drag",
    "keypress",
    "move",
    "screenshot",
    "wait",
    "scroll",
    "type",
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelButton {
    #[default]
    Left,
    Right,
    Wheel,
    Back,
    Forward,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathPoint {
    pub x: i64,
    pub y: i64,
}

/// An action as requested by the model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ComputerAction {
    Click {
        x: i64,
        y: i64,
        #[serde(default)]
        button: ModelButton,
    },
    DoubleClick { x: i64, y: i64 },
    Drag { path: Vec<PathPoint> },
    Keypress { keys: Vec<String> },
    Move { x: i64, y: i64 },
    Screenshot {},
    Wait {},
    Scroll { x: i64, y: i64, scroll_x: i64, scroll_y: i64 },
    Type { text: String },
}

impl ComputerAction {
    pub fn from_value(v: &Value) -> Result<Self, CuaError> {
        let kind = v.get("type").and_then(|x| x.as_str()).unwrap_or("unknown");
        if !KNOWN_ACTIONS.contains(&kind) {
            return Err(CuaError::UnknownAction(v.to_string()));
        }
        serde_json::from_value(v.clone())
            .map_err(|e| CuaError::MalformedAction(format!("{}: {}", kind, e)))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
    Back,
    Forward,
}

impl From<ModelButton> for MouseButton {
    fn from(b: ModelButton) -> Self {
        match b {
            ModelButton::Left => MouseButton::Left,
            ModelButton::Right => MouseButton::Right,
            ModelButton::Wheel => MouseButton::Middle,
            ModelButton::Back => MouseButton::Back,
            ModelButton::Forward => MouseButton::Forward,
        }
    }
}

/// A concrete operation sent to the remote device's computer endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DeviceOperation {
    ClickMouse {
        button: MouseButton,
        coordinates: [i64; 2],
        #[serde(default, skip_serializing_if = "Option::is_none")]
        num_clicks: Option<u32>,
    },
    DragMouse { path: Vec<[i64; 2]> },
    PressKey { keys: Vec<String> },
    MoveMouse { coordinates: [i64; 2] },
    TakeScreenshot,
    Wait { duration: u64 },
    Scroll { coordinates: [i64; 2], delta_x: i64, delta_y: i64 },
    TypeText { text: String },
}

impl From<ComputerAction> for DeviceOperation {
    fn from(action: ComputerAction) -> Self {
        match action {
            ComputerAction::Click { x, y, button } => DeviceOperation::ClickMouse {
                button: button.into(),
                coordinates: [x, y],
                num_clicks: None,
            },
            ComputerAction::DoubleClick { x, y } => DeviceOperation::ClickMouse {
                button: MouseButton::Left,
                coordinates: [x, y],
                num_clicks: Some(2),
            },
            ComputerAction::Drag { path } => DeviceOperation::DragMouse {
                path: path.into_iter().map(|p| [p.x, p.y]).collect(),
            },
            ComputerAction::Keypress { keys } => DeviceOperation::PressKey { keys },
            ComputerAction::Move { x, y } => DeviceOperation::MoveMouse { coordinates: [x, y] },
            ComputerAction::Screenshot {} => DeviceOperation::TakeScreenshot,
            ComputerAction::Wait {} => DeviceOperation::Wait { duration: WAIT_DURATION_MS },
            ComputerAction::Scroll { x, y, scroll_x, scroll_y } => DeviceOperation::Scroll {
                coordinates: [x, y],
                delta_x: scroll_x,
                delta_y: scroll_y,
            },
            ComputerAction::Type { text } => DeviceOperation::TypeText { text },
        }
    }
}

/// Decodes a raw model action and maps it onto a device operation.
pub fn translate(action: &Value) -> Result<DeviceOperation, CuaError> {
    ComputerAction::from_value(action).map(DeviceOperation::from)
}
