//! Error taxonomy and the numeric status codes returned to API callers

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors raised by the agent core.
///
/// Leaf components (service controller, resource inspector, probe store)
/// return sentinel values instead of these; the plugin layer classifies the
/// sentinels into one of the variants below.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("plugin {0} is not installed")]
    NotInstalled(String),

    #[error("command failed: {0}")]
    CommandFailed(String),

    #[error("configuration unavailable: {0}")]
    ConfigUnavailable(String),

    #[error("invalid parameter: {0}")]
    ParamInvalid(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AgentError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AgentError::NotFound(_) | AgentError::ParamInvalid(_) | AgentError::Unsupported(_) => {
                StatusCode::ParamError
            }
            AgentError::NotInstalled(_) | AgentError::ConfigUnavailable(_) => {
                StatusCode::FileNotFound
            }
            AgentError::CommandFailed(_) => StatusCode::Fail,
            AgentError::Io(_) => StatusCode::ServerError,
        }
    }
}

pub type AgentResult<T> = Result<T, AgentError>;

/// Status code carried in every response body under `code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Success,
    Fail,
    FileNotFound,
    ServerError,
    ParamError,
    TokenError,
}

impl StatusCode {
    pub fn code(self) -> u16 {
        match self {
            StatusCode::Success => 200,
            StatusCode::Fail => 400,
            StatusCode::FileNotFound => 410,
            StatusCode::ServerError => 500,
            StatusCode::ParamError => 1000,
            StatusCode::TokenError => 1201,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            StatusCode::Success => "operation succeed",
            StatusCode::Fail => "operation failed",
            StatusCode::FileNotFound => "file or plugin not found",
            StatusCode::ServerError => "internal server error",
            StatusCode::ParamError => "request parameter error",
            StatusCode::TokenError => "access token error",
        }
    }

    /// Build `{code, msg}` with the fields of `payload` merged in.
    ///
    /// A payload that does not serialize to a JSON object is placed under
    /// `resp`.
    pub fn body<T: Serialize>(self, payload: T) -> Value {
        let mut body = Map::new();
        body.insert("code".into(), Value::from(self.code()));
        body.insert("msg".into(), Value::from(self.label()));
        match serde_json::to_value(payload) {
            Ok(Value::Object(fields)) => body.extend(fields),
            Ok(Value::Null) | Err(_) => {}
            Ok(other) => {
                body.insert("resp".into(), other);
            }
        }
        Value::Object(body)
    }

    pub fn bare(self) -> Value {
        self.body(Value::Null)
    }
}
