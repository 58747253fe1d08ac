//! Deterministic feature-hashing embedder.
//!
//! Every lower-cased word is hashed, seeded by the model name, into one of
//! `dimension` signed buckets. Texts sharing vocabulary end up close in
//! cosine space, and two model names produce unrelated spaces, which is
//! enough to exercise re-encoding without downloading weights.

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::Arc,
};

use super::{DeviceKind, Embedder, EmbedderFactory};
use crate::{error::Result, text_util};

pub const DEFAULT_DIMENSION: usize = 384;

#[derive(Debug, Clone)]
pub struct HashedEmbedder {
    model_id: String,
    dimension: usize,
    seed: u64,
}

impl HashedEmbedder {
    pub fn new(model_id: &str, dimension: usize) -> Self {
        let mut hasher = DefaultHasher::new();
        model_id.hash(&mut hasher);
        Self {
            model_id: model_id.to_string(),
            dimension: dimension.max(1),
            seed: hasher.finish(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0f32; self.dimension];
        for word in text_util::lowercase_words(text) {
            let mut hasher = DefaultHasher::new();
            self.seed.hash(&mut hasher);
            word.hash(&mut hasher);
            let h = hasher.finish();
            let idx = (h % self.dimension as u64) as usize;
            let sign = if h >> 63 == 1 { -1.0 } else { 1.0 };
            v[idx] += sign;
        }
        super::normalize(&mut v);
        v
    }
}

impl Embedder for HashedEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn device(&self) -> DeviceKind {
        DeviceKind::Cpu
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Creates a [`HashedEmbedder`] for any model name.
#[derive(Debug, Clone, Copy)]
pub struct HashedFactory {
    pub dimension: usize,
}

impl EmbedderFactory for HashedFactory {
    fn create(&self, model: &str) -> Result<Arc<dyn Embedder>> {
        Ok(Arc::new(HashedEmbedder::new(model, self.dimension)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::cosine;

    #[test]
    fn deterministic_and_normalized() {
        let e = HashedEmbedder::new("m", 64);
        let a = e.embed(&["binary search trees".into()]).unwrap();
        let b = e.embed(&["binary search trees".into()]).unwrap();
        assert_eq!(a, b);
        let norm: f32 = a[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn shared_words_are_similar() {
        let e = HashedEmbedder::new("m", DEFAULT_DIMENSION);
        let v = e
            .embed(&[
                "binary search trees".into(),
                "Binary search trees are fun".into(),
                "cooking pasta recipes".into(),
            ])
            .unwrap();
        assert!(cosine(&v[0], &v[1]) > cosine(&v[0], &v[2]));
        assert!(cosine(&v[0], &v[1]) > 0.5);
    }

    #[test]
    fn models_produce_different_spaces() {
        let a = HashedEmbedder::new("model-a", 64);
        let b = HashedEmbedder::new("model-b", 64);
        let text = vec!["the same text in both".to_string()];
        assert_ne!(a.embed(&text).unwrap(), b.embed(&text).unwrap());
    }

    #[test]
    fn empty_text_is_zero_vector() {
        let e = HashedEmbedder::new("m", 8);
        let v = e.embed(&["".into()]).unwrap();
        assert!(v[0].iter().all(|x| *x == 0.0));
    }
}
