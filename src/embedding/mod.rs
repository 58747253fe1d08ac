//! Embedding service adapter.
//!
//! [`EmbeddingService`] hands out one [`Embedder`] per model name, created
//! lazily through an [`EmbedderFactory`], and takes care of batching and
//! normalization so callers always receive unit-length vectors.

pub mod colbert;
pub mod hashed;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use serde::Serialize;

use crate::{
    config::{EmbeddingBackend, EmbeddingSettings},
    error::{Error, Result},
};

/// Where an embedder runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Accelerator,
    Cpu,
}

/// A text embedding model producing one vector per input text.
pub trait Embedder: Send + Sync {
    fn model_id(&self) -> &str;

    fn device(&self) -> DeviceKind;

    /// Whether the model can currently serve requests.
    fn is_available(&self) -> bool {
        true
    }

    /// Embed documents. Must return exactly one vector per text.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a search query. Models with asymmetric encoders override this.
    fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&[text.to_string()])?
            .pop()
            .ok_or_else(|| Error::ServiceUnavailable("empty embedding".into()))
    }
}

/// Creates embedders by model name.
pub trait EmbedderFactory: Send + Sync {
    fn create(&self, model: &str) -> Result<Arc<dyn Embedder>>;
}

impl<F> EmbedderFactory for F
where
    F: Fn(&str) -> Result<Arc<dyn Embedder>> + Send + Sync,
{
    fn create(&self, model: &str) -> Result<Arc<dyn Embedder>> {
        self(model)
    }
}

/// How long a failed model load is answered from memory before retrying.
const LOAD_RETRY_AFTER: Duration = Duration::from_secs(5);

pub struct EmbeddingService {
    factory: Arc<dyn EmbedderFactory>,
    embedders: Mutex<HashMap<String, Arc<dyn Embedder>>>,
    failed_loads: Mutex<HashMap<String, (Instant, String)>>,
}

impl EmbeddingService {
    pub fn new(factory: Arc<dyn EmbedderFactory>) -> Self {
        Self {
            factory,
            embedders: Mutex::new(HashMap::new()),
            failed_loads: Mutex::new(HashMap::new()),
        }
    }

    /// Build the service for the configured backend.
    pub fn from_settings(settings: &EmbeddingSettings) -> Self {
        let factory: Arc<dyn EmbedderFactory> = match settings.backend {
            EmbeddingBackend::Colbert => Arc::new(colbert::ColbertFactory),
            EmbeddingBackend::Hashed => Arc::new(hashed::HashedFactory {
                dimension: settings.hashed_dimension,
            }),
        };
        Self::new(factory)
    }

    /// The embedder for `model`, created on first use.
    ///
    /// Loading happens outside the cache lock, so a slow model does not
    /// hold up lookups of the others. A failed load is remembered for
    /// [`LOAD_RETRY_AFTER`].
    pub fn embedder(&self, model: &str) -> Result<Arc<dyn Embedder>> {
        if let Some(existing) = self
            .embedders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(model)
        {
            return Ok(Arc::clone(existing));
        }
        if let Some((at, reason)) = self
            .failed_loads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(model)
            && at.elapsed() < LOAD_RETRY_AFTER
        {
            return Err(Error::ServiceUnavailable(reason.clone()));
        }

        let created = match self.factory.create(model) {
            Ok(created) => created,
            Err(e) => {
                let e = match e {
                    Error::ServiceUnavailable(_) => e,
                    other => Error::ServiceUnavailable(format!(
                        "cannot create embedder for {model}: {other}"
                    )),
                };
                tracing::warn!(model, error = %e, "embedder failed to load");
                let reason = match &e {
                    Error::ServiceUnavailable(reason) => reason.clone(),
                    other => other.to_string(),
                };
                self.failed_loads
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(model.to_string(), (Instant::now(), reason));
                return Err(e);
            }
        };
        self.failed_loads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(model);

        // A concurrent load of the same model may have won the race.
        let mut embedders =
            self.embedders.lock().unwrap_or_else(PoisonError::into_inner);
        let embedder = embedders
            .entry(model.to_string())
            .or_insert_with(|| {
                tracing::debug!(
                    model,
                    device = ?created.device(),
                    "embedder created"
                );
                created
            });
        Ok(Arc::clone(embedder))
    }

    pub fn is_available(&self, model: &str) -> bool {
        self.embedder(model).is_ok_and(|e| e.is_available())
    }

    pub fn device(&self, model: &str) -> Option<DeviceKind> {
        self.embedder(model).ok().map(|e| e.device())
    }

    /// Embed `texts` with `model` in requests of at most `batch_size`.
    pub fn embed(
        &self,
        model: &str,
        texts: &[String],
        batch_size: usize,
    ) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let embedder = self.available(model)?;

        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(batch_size.max(1)) {
            let vectors = embedder.embed(batch)?;
            if vectors.len() != batch.len() {
                return Err(Error::ServiceUnavailable(format!(
                    "{model} returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                )));
            }
            out.extend(vectors.into_iter().map(|mut v| {
                normalize(&mut v);
                v
            }));
        }
        tracing::trace!(model, texts = texts.len(), "embedded batch");
        Ok(out)
    }

    pub fn embed_query(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        let mut vector = self.available(model)?.embed_query(text)?;
        normalize(&mut vector);
        Ok(vector)
    }

    fn available(&self, model: &str) -> Result<Arc<dyn Embedder>> {
        let embedder = self.embedder(model)?;
        if !embedder.is_available() {
            return Err(Error::ServiceUnavailable(format!(
                "embedder {model} is unavailable"
            )));
        }
        Ok(embedder)
    }
}

impl std::fmt::Debug for EmbeddingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingService").finish_non_exhaustive()
    }
}

/// Scale `v` to unit length in place. Zero vectors are left untouched.
pub fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Unit-length mean of equally sized vectors.
pub fn mean_pool(vectors: &[Vec<f32>]) -> Option<Vec<f32>> {
    let dim = vectors.first()?.len();
    let mut sum = vec![0f32; dim];
    let mut count = 0usize;
    for v in vectors.iter().filter(|v| v.len() == dim) {
        for (acc, x) in sum.iter_mut().zip(v) {
            *acc += x;
        }
        count += 1;
    }
    if count == 0 {
        return None;
    }
    normalize(&mut sum);
    Some(sum)
}

/// Cosine similarity; 0 when dimensions differ or either side is zero.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0f32;
    let mut na = 0f32;
    let mut nb = 0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    let denom = na.sqrt() * nb.sqrt();
    if denom <= f32::EPSILON {
        0.0
    } else {
        dot / denom
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Barrier,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    struct CountingEmbedder {
        calls: AtomicUsize,
    }

    impl Embedder for CountingEmbedder {
        fn model_id(&self) -> &str {
            "counting"
        }

        fn device(&self) -> DeviceKind {
            DeviceKind::Cpu
        }

        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    struct DownEmbedder;

    impl Embedder for DownEmbedder {
        fn model_id(&self) -> &str {
            "down"
        }

        fn device(&self) -> DeviceKind {
            DeviceKind::Cpu
        }

        fn is_available(&self) -> bool {
            false
        }

        fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Err(Error::ServiceUnavailable("down".into()))
        }
    }

    #[test]
    fn batches_requests_and_normalizes() {
        let embedder = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
        });
        let shared = Arc::clone(&embedder);
        let service = EmbeddingService::new(Arc::new(
            move |_: &str| -> Result<Arc<dyn Embedder>> {
                Ok(shared.clone())
            },
        ));

        let texts: Vec<String> = (0..5).map(|i| "x".repeat(i + 1)).collect();
        let vectors = service.embed("counting", &texts, 2).unwrap();

        assert_eq!(vectors.len(), 5);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
        for v in &vectors {
            let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn embedders_are_cached_per_model() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let service = EmbeddingService::new(Arc::new(
            move |model: &str| -> Result<Arc<dyn Embedder>> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(hashed::HashedEmbedder::new(model, 16)))
            },
        ));

        service.embed_query("a", "hello").unwrap();
        service.embed_query("a", "world").unwrap();
        service.embed_query("b", "hello").unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unavailable_embedder_is_reported() {
        let service = EmbeddingService::new(Arc::new(
            |_: &str| -> Result<Arc<dyn Embedder>> { Ok(Arc::new(DownEmbedder)) },
        ));
        assert!(!service.is_available("down"));
        assert!(matches!(
            service.embed("down", &["x".to_string()], 8),
            Err(Error::ServiceUnavailable(_))
        ));
    }

    #[test]
    fn factory_errors_become_unavailable() {
        let service = EmbeddingService::new(Arc::new(
            |_: &str| -> Result<Arc<dyn Embedder>> {
                Err(Error::Config("no such model".into()))
            },
        ));
        assert!(matches!(
            service.embedder("missing"),
            Err(Error::ServiceUnavailable(_))
        ));
        assert_eq!(service.device("missing"), None);
    }

    #[test]
    fn failed_loads_are_not_retried_immediately() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let service = EmbeddingService::new(Arc::new(
            move |_: &str| -> Result<Arc<dyn Embedder>> {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::ServiceUnavailable("no weights".into()))
            },
        ));
        assert!(service.embedder("m").is_err());
        assert!(!service.is_available("m"));
        assert!(service.embed_query("m", "hello").is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn slow_load_does_not_block_other_models() {
        let entered = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));
        let (factory_entered, factory_release) =
            (Arc::clone(&entered), Arc::clone(&release));
        let service = EmbeddingService::new(Arc::new(
            move |model: &str| -> Result<Arc<dyn Embedder>> {
                if model == "slow" {
                    factory_entered.wait();
                    factory_release.wait();
                }
                Ok(Arc::new(hashed::HashedEmbedder::new(model, 16)))
            },
        ));

        std::thread::scope(|scope| {
            let slow = scope.spawn(|| service.embedder("slow").map(|_| ()));
            entered.wait();
            assert!(service.embedder("fast").is_ok());
            release.wait();
            assert!(slow.join().unwrap().is_ok());
        });
        assert!(service.is_available("slow"));
    }

    #[test]
    fn vector_helpers() {
        assert!((cosine(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 0.0]), 0.0);

        let pooled = mean_pool(&[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        assert!((pooled[0] - pooled[1]).abs() < 1e-6);
        assert!(mean_pool(&[]).is_none());
    }
}
