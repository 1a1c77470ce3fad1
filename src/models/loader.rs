//! Model loading: path validation plus provider delegation.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::engine::{BackendError, BackendProvider, LoadRequest, LoadedModel};
use crate::validate::{self, ValidateError};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Validation(#[from] ValidateError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Validates load paths and hands off to the configured provider.
pub struct ModelLoader {
    provider: Arc<dyn BackendProvider>,
    trusted_roots: Vec<PathBuf>,
}

impl ModelLoader {
    pub fn new(provider: Arc<dyn BackendProvider>, trusted_roots: Vec<PathBuf>) -> Self {
        Self { provider, trusted_roots }
    }

    /// Load a model after confirming the path resolves under a trusted
    /// root. The provider call is the expensive part and runs without any
    /// runtime lock held.
    pub async fn load(&self, request: &LoadRequest) -> Result<LoadedModel, LoadError> {
        validate::validate_model_id(&request.model_id)?;
        let path = validate::resolve_trusted_path(&request.local_path, &self.trusted_roots)?;
        tracing::info!(model_id = %request.model_id, path = %path.display(), "loading model");
        let loaded = self.provider.load(request, &path).await?;
        tracing::info!(
            model_id = %request.model_id,
            parameter_count = loaded.metadata.parameter_count,
            dtype = %loaded.metadata.dtype,
            "model loaded"
        );
        Ok(loaded)
    }
}
