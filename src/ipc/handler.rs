//! RPC dispatch: wire method names to runtime operations.

use std::sync::Arc;

use serde_json::Value;

use super::protocol::{codes, JsonRpcRequest, JsonRpcResponse, RpcError};
use crate::Runtime;

/// Translates parsed requests into runtime calls and responses.
pub struct RpcHandler {
    runtime: Arc<Runtime>,
}

impl RpcHandler {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    /// Handle one wire line. Returns `None` for notifications; they
    /// never produce a response, errors included.
    pub async fn handle_line(&self, line: &str) -> Option<JsonRpcResponse> {
        let request: JsonRpcRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                return Some(JsonRpcResponse::failure(
                    Value::Null,
                    RpcError::new(codes::PARSE_ERROR, format!("parse error: {e}")),
                ));
            }
        };

        let is_notification = request.is_notification();
        let id = request.id.clone().unwrap_or(Value::Null);
        let method = request.method.clone();

        let result = self.dispatch(request).await;

        if is_notification {
            if let Err(error) = result {
                tracing::warn!(method, code = error.code, message = %error.message,
                    "notification failed (no response sent)");
            }
            return None;
        }

        Some(match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(error) => JsonRpcResponse::failure(id, error),
        })
    }

    /// Response used when line framing rejects an oversized message.
    pub fn overflow_response(size: usize, max: usize) -> JsonRpcResponse {
        JsonRpcResponse::failure(
            Value::Null,
            RpcError::new(
                codes::INVALID_REQUEST,
                format!("message exceeds max buffer size ({size} > {max} bytes)"),
            ),
        )
    }

    async fn dispatch(&self, request: JsonRpcRequest) -> Result<Value, RpcError> {
        let params = request.params;
        match request.method.as_str() {
            "runtime/info" => Ok(self.runtime.runtime_info()),
            "runtime/state" => Ok(self.runtime.runtime_state()),
            "runtime/telemetry" => Ok(self.runtime.runtime_telemetry().await),
            "shutdown" => Ok(self.runtime.shutdown().await),

            "load_model" => self.runtime.load_model(parse(params)?, false).await,
            "load_vision_model" => self.runtime.load_model(parse(params)?, true).await,
            "unload_model" => self.runtime.unload_model(parse(params)?).await,

            "generate" => self.runtime.generate(parse(params)?).await,
            "continuous_generate" => self.runtime.continuous_generate(parse(params)?).await,
            "batch_generate" => self.runtime.batch_generate(parse(params)?).await,
            "generate_with_image" => self.runtime.generate_with_image(parse(params)?).await,

            "tokenize" => self.runtime.tokenize(parse(params)?).await,
            "batch_tokenize" => self.runtime.batch_tokenize(parse(params)?).await,
            "check_draft" => self.runtime.check_draft(parse(params)?),
            "batch_check_draft" => self.runtime.batch_check_draft(parse(params)?),

            "get_batcher_metrics" => self.runtime.batcher_metrics(parse(params)?),
            "get_batcher_health" => self.runtime.batcher_health(parse(params)?),

            other => Err(RpcError::new(
                codes::METHOD_NOT_FOUND,
                format!("method not found: {other}"),
            )),
        }
    }
}

fn parse<P: serde::de::DeserializeOwned>(params: Value) -> Result<P, RpcError> {
    serde_json::from_value(params)
        .map_err(|e| RpcError::new(codes::INVALID_PARAMS, format!("invalid params: {e}")))
}
