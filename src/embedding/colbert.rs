use std::sync::{
    Arc,
    Mutex,
    PoisonError,
    atomic::{AtomicBool, Ordering},
};

use candle_core::{DType, Device, Tensor};
use pylate_rs::ColBERT;

use super::{DeviceKind, Embedder, EmbedderFactory};
use crate::error::{Error, Result};

pub const DEFAULT_MODEL_ID: &str = "lightonai/GTE-ModernColBERT-v1";

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

/// A ColBERT checkpoint pooled into single-vector embeddings.
///
/// Token embeddings are averaged per text. The model is loaded on first
/// use; a failed load marks the embedder unavailable until recreated.
pub struct ColbertEmbedder {
    model_id: String,
    device: Device,
    model: Mutex<Option<ColBERT>>,
    failed: AtomicBool,
}

impl ColbertEmbedder {
    pub fn new(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            device: default_device(),
            model: Mutex::new(None),
            failed: AtomicBool::new(false),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.model
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn encode(&self, texts: &[String], is_query: bool) -> Result<Vec<Vec<f32>>> {
        let mut guard =
            self.model.lock().unwrap_or_else(PoisonError::into_inner);

        if guard.is_none() {
            tracing::info!(model = %self.model_id, "loading ColBERT model");
            let loaded: std::result::Result<ColBERT, _> =
                ColBERT::from(&self.model_id)
                    .with_device(self.device.clone())
                    .try_into();
            match loaded {
                Ok(model) => *guard = Some(model),
                Err(e) => {
                    self.failed.store(true, Ordering::SeqCst);
                    return Err(Error::ServiceUnavailable(format!(
                        "failed to load {}: {e}",
                        self.model_id
                    )));
                }
            }
        }

        let Some(model) = guard.as_mut() else {
            return Err(Error::ServiceUnavailable(format!(
                "{} is not loaded",
                self.model_id
            )));
        };

        // [batch, tokens, dim]
        let embeddings = model.encode(texts, is_query).map_err(|e| {
            Error::ServiceUnavailable(format!("encoding failed: {e}"))
        })?;
        pool_tokens(&embeddings)
    }
}

/// Average a `[batch, tokens, dim]` tensor over its token axis.
fn pool_tokens(embeddings: &Tensor) -> Result<Vec<Vec<f32>>> {
    let pooled = embeddings.mean(1)?.to_dtype(DType::F32)?;
    Ok(pooled.to_vec2::<f32>()?)
}

impl Embedder for ColbertEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn device(&self) -> DeviceKind {
        if self.device.is_cpu() {
            DeviceKind::Cpu
        } else {
            DeviceKind::Accelerator
        }
    }

    fn is_available(&self) -> bool {
        !self.failed.load(Ordering::SeqCst)
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.encode(texts, false)
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.encode(&[text.to_string()], true)?
            .pop()
            .ok_or_else(|| Error::ServiceUnavailable("empty embedding".into()))
    }
}

impl std::fmt::Debug for ColbertEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColbertEmbedder")
            .field("model_id", &self.model_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ColbertFactory;

impl EmbedderFactory for ColbertFactory {
    fn create(&self, model: &str) -> Result<Arc<dyn Embedder>> {
        Ok(Arc::new(ColbertEmbedder::new(model)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_is_loaded_lazily() {
        let embedder = ColbertEmbedder::new("custom/model");
        assert_eq!(embedder.model_id(), "custom/model");
        assert!(!embedder.is_loaded());
        assert!(embedder.is_available());
    }

    #[test]
    fn pooling_averages_tokens() {
        let data = vec![1.0f32, 0.0, 3.0, 2.0, 0.5, 0.5, 0.5, 0.5];
        let tensor = Tensor::from_vec(data, (2, 2, 2), &Device::Cpu).unwrap();
        let pooled = pool_tokens(&tensor).unwrap();
        assert_eq!(pooled, vec![vec![2.0, 1.0], vec![0.5, 0.5]]);
    }
}
