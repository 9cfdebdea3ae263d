pub mod action;
pub mod agent;
pub mod config;
pub mod cua;
pub mod device;
pub mod error;
pub mod state;

pub use agent::{Agent, AgentConfig, Node, StreamEvent, StreamWriter};
pub use config::{ConfigLayer, RunConfig};
pub use cua::{CuaClient, CuaConfig};
pub use device::ScrapybaraConnector;
pub use error::CuaError;
pub use state::{Environment, Message, SessionState, StateUpdate};
