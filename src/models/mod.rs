//! Model lifecycle: loading, registry, and draft compatibility.

mod draft;
mod loader;
mod registry;

pub use draft::{check_draft, DraftCompatibility, DraftDetails};
pub use loader::{LoadError, ModelLoader};
pub use registry::{ModelHandle, ModelInfo, ModelRegistry, RegistryError, UseGuard};
