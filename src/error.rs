use thiserror::Error;

#[derive(Debug, Error)]
pub enum CuaError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invalid environment. Must be one of 'web', 'ubuntu', or 'windows'. Received: {0}")]
    InvalidEnvironment(String),
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("unknown computer action received: {0}")]
    UnknownAction(String),
    #[error("malformed computer action: {0}")]
    MalformedAction(String),
    #[error("instance not found: {0}")]
    NotFound(String),
    #[error("device error: {0}")]
    Device(String),
    #[error("model error: {0}")]
    Model(String),
    #[error("step limit of {0} reached before the loop ended")]
    StepLimit(usize),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CuaError {
    pub(crate) fn missing_api_key() -> Self {
        CuaError::Configuration(
            "Scrapybara API key not provided. Please provide one in the configurable fields, \
             or set it as an environment variable (SCRAPYBARA_API_KEY)"
                .into(),
        )
    }
}
