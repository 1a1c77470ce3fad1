//! Speculative-decoding compatibility checks between model pairs.

use serde::Serialize;

use super::registry::ModelHandle;

/// Verdict for a primary/draft model pairing.
#[derive(Debug, Clone, Serialize)]
pub struct DraftCompatibility {
    pub compatible: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub details: DraftDetails,
}

#[derive(Debug, Clone, Serialize)]
pub struct DraftDetails {
    pub primary_vocab_size: usize,
    pub draft_vocab_size: usize,
    pub primary_eos_token_id: Option<u32>,
    pub draft_eos_token_id: Option<u32>,
    pub primary_context_length: usize,
    pub draft_context_length: usize,
    pub primary_dtype: String,
    pub draft_dtype: String,
}

/// A draft model can speculate for a primary model only when they sample
/// from the same vocabulary and agree on the stop token. Context-length
/// and dtype mismatches degrade quality but do not break correctness.
pub fn check_draft(primary: &ModelHandle, draft: &ModelHandle) -> DraftCompatibility {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let details = DraftDetails {
        primary_vocab_size: primary.backend.vocab_size(),
        draft_vocab_size: draft.backend.vocab_size(),
        primary_eos_token_id: primary.backend.eos_token_id(),
        draft_eos_token_id: draft.backend.eos_token_id(),
        primary_context_length: primary.metadata.context_length,
        draft_context_length: draft.metadata.context_length,
        primary_dtype: primary.metadata.dtype.clone(),
        draft_dtype: draft.metadata.dtype.clone(),
    };

    if details.primary_vocab_size != details.draft_vocab_size {
        errors.push(format!(
            "vocab size mismatch: primary={} draft={}",
            details.primary_vocab_size, details.draft_vocab_size
        ));
    }
    if details.primary_eos_token_id != details.draft_eos_token_id {
        errors.push(format!(
            "eos token mismatch: primary={:?} draft={:?}",
            details.primary_eos_token_id, details.draft_eos_token_id
        ));
    }
    if details.draft_context_length < details.primary_context_length {
        warnings.push(format!(
            "draft context length {} below primary {}",
            details.draft_context_length, details.primary_context_length
        ));
    }
    if details.primary_dtype != details.draft_dtype {
        warnings.push(format!(
            "dtype mismatch: primary={} draft={}",
            details.primary_dtype, details.draft_dtype
        ));
    }

    DraftCompatibility {
        compatible: errors.is_empty(),
        errors,
        warnings,
        details,
    }
}
