//! Backend provider: the construction-time seam to the tensor library.
//!
//! Probing for library capabilities happens once, here, when a provider
//! is built. Hot paths call through the resolved trait objects and never
//! branch on availability.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use super::{BackendError, LoadRequest, ModelBackend, ModelMetadata, Tokenizer};

/// Everything a successful load produces.
pub struct LoadedModel {
    pub backend: Arc<dyn ModelBackend>,
    pub tokenizer: Arc<dyn Tokenizer>,
    pub metadata: ModelMetadata,
}

/// Loads model weights and tokenizers from validated local directories.
///
/// Implementations wrap a concrete tensor library. The runtime holds
/// exactly one provider, chosen when the `Runtime` is constructed.
#[async_trait]
pub trait BackendProvider: Send + Sync {
    async fn load(&self, request: &LoadRequest, path: &Path) -> Result<LoadedModel, BackendError>;
}

/// Provider used when no tensor library is linked. Every load fails with
/// a clear error; the serving surface otherwise works (introspection,
/// shutdown, validation).
pub struct UnconfiguredProvider;

#[async_trait]
impl BackendProvider for UnconfiguredProvider {
    async fn load(&self, request: &LoadRequest, _path: &Path) -> Result<LoadedModel, BackendError> {
        Err(BackendError::Unavailable(format!(
            "cannot load '{}': no tensor backend linked into this build",
            request.model_id
        )))
    }
}
