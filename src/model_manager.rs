use std::sync::{Mutex, OnceLock, PoisonError};

use candle_core::{Device, Tensor};
use pylate_rs::ColBERT;
use tracing::info;

use crate::{
    embedding::EmbeddingProvider,
    error::{Error, Result},
};

pub const DEFAULT_MODEL_ID: &str = "lightonai/GTE-ModernColBERT-v1";
pub const MODEL_ENV_VAR: &str = "RAGDEX_MODEL";

/// Select the best available compute device.
///
/// Uses CUDA when compiled with the `cuda` feature, Metal when compiled with
/// the `metal` feature, and falls back to CPU otherwise.
fn default_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }

    Device::Cpu
}

fn model_error(e: impl std::fmt::Display) -> Error {
    Error::Embedding(e.to_string())
}

/// Dense text embeddings from a ColBERT checkpoint.
///
/// ColBERT produces one vector per token; they are mean-pooled into a
/// single document vector. The model is downloaded and loaded on first use.
pub struct ColbertEmbedder {
    model: Mutex<Option<ColBERT>>,
    model_id: String,
    dimension: OnceLock<usize>,
}

impl ColbertEmbedder {
    /// The model id is resolved from the `RAGDEX_MODEL` environment
    /// variable, falling back to [`DEFAULT_MODEL_ID`].
    pub fn new() -> Self {
        let model_id = std::env::var(MODEL_ENV_VAR)
            .unwrap_or_else(|_| DEFAULT_MODEL_ID.to_string());
        Self::with_model_id(model_id)
    }

    pub fn with_model_id(model_id: impl Into<String>) -> Self {
        Self {
            model: Mutex::new(None),
            model_id: model_id.into(),
            dimension: OnceLock::new(),
        }
    }

    /// Returns `true` if the model has already been loaded into memory.
    pub fn is_loaded(&self) -> bool {
        self.model
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Encode one text into token embeddings of shape `[tokens, dim]`.
    fn encode(&self, text: &str) -> Result<Tensor> {
        let mut guard =
            self.model.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            info!(model = %self.model_id, "loading embedding model");
            let colbert: ColBERT = ColBERT::from(&self.model_id)
                .with_device(default_device())
                .try_into()
                .map_err(model_error)?;
            *guard = Some(colbert);
        }
        let Some(model) = guard.as_mut() else {
            return Err(Error::Embedding("model failed to load".into()));
        };

        let embeddings = model
            .encode(&[text.to_string()], false)
            .map_err(model_error)?;
        // [1, tokens, dim] -> [tokens, dim]
        embeddings.squeeze(0).map_err(model_error)
    }
}

impl Default for ColbertEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingProvider for ColbertEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> Result<usize> {
        if let Some(&dim) = self.dimension.get() {
            return Ok(dim);
        }
        let (_tokens, dim) = self.encode("dimension probe")?.dims2().map_err(
            |e| Error::Embedding(format!("unexpected embedding shape: {e}")),
        )?;
        Ok(*self.dimension.get_or_init(|| dim))
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let tokens = self.encode(text)?;
        let pooled = tokens.mean(0).map_err(model_error)?;
        pooled.to_vec1::<f32>().map_err(model_error)
    }
}

impl std::fmt::Debug for ColbertEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColbertEmbedder")
            .field("model_id", &self.model_id)
            .field("dimension", &self.dimension.get())
            .finish_non_exhaustive()
    }
}
