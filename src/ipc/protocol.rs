//! JSON-RPC 2.0 wire types and the stable error-code taxonomy.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::BackendError;
use crate::models::{LoadError, RegistryError};
use crate::scheduler::{BatcherError, GpuSchedulerError};
use crate::validate::ValidateError;

/// JSON-RPC error codes shared with the control plane.
pub mod codes {
    /// Malformed request, including line-buffer overflow.
    pub const INVALID_REQUEST: i64 = -32600;
    /// Parameter validation failure.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Unparseable JSON line.
    pub const PARSE_ERROR: i64 = -32700;
    /// Unknown method.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const MODEL_LOAD_FAILURE: i64 = -32001;
    pub const GENERATION_FAILURE: i64 = -32002;
    pub const TOKENIZER_FAILURE: i64 = -32003;
    pub const GUIDANCE_FAILURE: i64 = -32004;
    pub const MODEL_NOT_LOADED: i64 = -32005;
    /// Generic internal failure; message is scrubbed.
    pub const INTERNAL_ERROR: i64 = -32099;
}

/// Incoming request or notification. A missing `id` marks a
/// notification: it must never receive a response, errors included.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl JsonRpcRequest {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// Error payload inside a response.
#[derive(Debug, Clone, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    /// Internal failures cross the wire without paths or backtraces.
    pub fn internal() -> Self {
        Self::new(codes::INTERNAL_ERROR, "internal error")
    }
}

impl From<ValidateError> for RpcError {
    fn from(e: ValidateError) -> Self {
        Self::new(codes::INVALID_PARAMS, e.to_string())
    }
}

impl From<RegistryError> for RpcError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotLoaded(_) => Self::new(codes::MODEL_NOT_LOADED, e.to_string()),
            RegistryError::AlreadyLoaded(_) | RegistryError::DrainTimeout(_) => {
                Self::new(codes::MODEL_LOAD_FAILURE, e.to_string())
            }
        }
    }
}

impl From<LoadError> for RpcError {
    fn from(e: LoadError) -> Self {
        match e {
            LoadError::Validation(v) => v.into(),
            LoadError::Backend(b) => Self::new(codes::MODEL_LOAD_FAILURE, b.to_string()),
        }
    }
}

impl From<BackendError> for RpcError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Tokenizer(_) => Self::new(codes::TOKENIZER_FAILURE, e.to_string()),
            BackendError::Load(_) | BackendError::Unavailable(_) => {
                Self::new(codes::MODEL_LOAD_FAILURE, e.to_string())
            }
            BackendError::InvalidImage(_) | BackendError::VisionUnsupported => {
                Self::new(codes::INVALID_PARAMS, e.to_string())
            }
            BackendError::Forward(_) => Self::new(codes::GENERATION_FAILURE, e.to_string()),
        }
    }
}

impl From<GpuSchedulerError> for RpcError {
    fn from(e: GpuSchedulerError) -> Self {
        match e {
            GpuSchedulerError::Backend(b) => b.into(),
            GpuSchedulerError::ShuttingDown => Self::new(codes::GENERATION_FAILURE, e.to_string()),
        }
    }
}

impl From<BatcherError> for RpcError {
    fn from(e: BatcherError) -> Self {
        Self::new(codes::GENERATION_FAILURE, e.to_string())
    }
}

/// Outgoing response. Exactly one of `result` / `error` is set.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self { jsonrpc: "2.0", id, result: Some(result), error: None }
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self { jsonrpc: "2.0", id, result: None, error: Some(error) }
    }
}

/// Outgoing notification (no id, never answered).
pub fn notification(method: &str, params: Value) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    })
}

/// `generate` / `continuous_generate` parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerateParams {
    pub model_id: String,
    pub prompt: String,
    #[serde(default)]
    pub stream_id: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default)]
    pub stop_token_ids: Option<Vec<u32>>,
    #[serde(default)]
    pub seed: Option<u64>,
}

/// `generate_with_image` parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerateWithImageParams {
    #[serde(flatten)]
    pub generate: GenerateParams,
    pub image: String,
}

/// `load_model` / `load_vision_model` parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct LoadModelParams {
    pub model_id: String,
    #[serde(default)]
    pub local_path: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub quantization: Option<String>,
    #[serde(default)]
    pub context_length: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnloadModelParams {
    pub model_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenizeParams {
    pub model_id: String,
    pub text: String,
    #[serde(default)]
    pub add_special_tokens: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchTokenizeParams {
    pub model_id: String,
    pub texts: Vec<String>,
    #[serde(default)]
    pub add_special_tokens: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckDraftParams {
    pub primary_id: String,
    pub draft_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchCheckDraftParams {
    pub pairs: Vec<CheckDraftParams>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchGenerateParams {
    pub requests: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatcherTargetParams {
    #[serde(default)]
    pub model_id: Option<String>,
}
