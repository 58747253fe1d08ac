//! The active embedding model pointer.
//!
//! [`ModelRegistry`] answers "which model serves queries now" and "which
//! model is being migrated to". All changes go through one write lock and
//! publish a fresh [`ModelState`] snapshot, so readers never see a pointer
//! flip half-applied.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};

use serde::Serialize;

use crate::{
    config_db::ConfigDb,
    error::{Error, Result},
};

pub const CURRENT_MODEL_KEY: &str = "current_model";
pub const LEGACY_DOCUMENTS_KEY: &str = "legacy_documents";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelState {
    /// Model whose vectors serve semantic queries.
    pub current: String,
    /// Target of the re-encoding job in progress, if any.
    pub pending: Option<String>,
    /// Bumped on every change.
    pub version: u64,
    /// Documents still served by an older model, with that model.
    pub legacy: BTreeMap<String, String>,
}

impl ModelState {
    /// Models a fresh write of a document must produce vectors for.
    pub fn write_models(&self) -> Vec<String> {
        let mut models = vec![self.current.clone()];
        if let Some(pending) = &self.pending
            && pending != &self.current
        {
            models.push(pending.clone());
        }
        models
    }

    /// Model tags whose vectors must survive an upsert of `document_id`.
    pub fn served_models(&self, document_id: &str) -> Vec<String> {
        let mut models = self.write_models();
        if let Some(old) = self.legacy.get(document_id)
            && !models.contains(old)
        {
            models.push(old.clone());
        }
        models
    }

    /// Legacy documents grouped by the model that still serves them.
    pub fn legacy_by_model(&self) -> BTreeMap<String, Vec<String>> {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (doc, model) in &self.legacy {
            grouped.entry(model.clone()).or_default().push(doc.clone());
        }
        grouped
    }
}

pub struct ModelRegistry {
    state: RwLock<Arc<ModelState>>,
    config_db: Option<Arc<ConfigDb>>,
    /// Serializes vector writes against job starts and pointer flips.
    writes: Mutex<()>,
}

/// Held while vectors are written; no job starts or flips meanwhile.
pub struct WriteGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl ModelRegistry {
    /// A registry that only lives in memory.
    pub fn new(current: &str) -> Self {
        Self {
            state: RwLock::new(Arc::new(ModelState {
                current: current.to_string(),
                pending: None,
                version: 0,
                legacy: BTreeMap::new(),
            })),
            config_db: None,
            writes: Mutex::new(()),
        }
    }

    /// Restore the persisted pointer, falling back to `default_model`.
    ///
    /// A pending job does not survive a restart; its partial vectors are
    /// picked up by the next run.
    pub fn load(config_db: Arc<ConfigDb>, default_model: &str) -> Result<Self> {
        let current = config_db
            .get_setting(CURRENT_MODEL_KEY)?
            .unwrap_or_else(|| default_model.to_string());
        let legacy = match config_db.get_setting(LEGACY_DOCUMENTS_KEY)? {
            Some(json) => serde_json::from_str(&json)?,
            None => BTreeMap::new(),
        };
        Ok(Self {
            state: RwLock::new(Arc::new(ModelState {
                current,
                pending: None,
                version: 0,
                legacy,
            })),
            config_db: Some(config_db),
            writes: Mutex::new(()),
        })
    }

    pub fn snapshot(&self) -> Arc<ModelState> {
        Arc::clone(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn current(&self) -> String {
        self.snapshot().current.clone()
    }

    /// Block job starts and pointer flips until the guard drops.
    ///
    /// A writer that checks [`ModelRegistry::snapshot`] under the guard
    /// knows the models it writes are still the ones the state asks for.
    pub fn lock_writes(&self) -> WriteGuard<'_> {
        WriteGuard {
            _guard: self.writes.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Mark `model` as the re-encoding target.
    pub fn begin(&self, model: &str) -> Result<Arc<ModelState>> {
        let _writes = self.lock_writes();
        self.update(|state| {
            if let Some(pending) = &state.pending {
                return Err(Error::ReEncodingInProgress {
                    pending: pending.clone(),
                });
            }
            if state.current == model {
                return Err(Error::InvalidOptions(format!(
                    "{model} is already the current model"
                )));
            }
            state.pending = Some(model.to_string());
            Ok(())
        })
    }

    /// Flip the pointer to `model` and record `failed` as legacy.
    ///
    /// A failed document keeps the model that served it before, which is
    /// the old current model unless it was already legacy. Taking the
    /// [`WriteGuard`] makes the caller's last vector check and the flip
    /// one step.
    pub fn complete(
        &self,
        _writes: &WriteGuard<'_>,
        model: &str,
        failed: &BTreeSet<String>,
    ) -> Result<Arc<ModelState>> {
        self.update(|state| {
            if state.pending.as_deref() != Some(model) {
                return Err(Error::InvalidOptions(format!(
                    "no re-encoding to {model} is pending"
                )));
            }
            let old = std::mem::replace(&mut state.current, model.to_string());
            state.pending = None;
            state.legacy = failed
                .iter()
                .map(|doc| {
                    let served = state.legacy.get(doc).cloned();
                    (doc.clone(), served.unwrap_or_else(|| old.clone()))
                })
                .collect();
            Ok(())
        })
    }

    /// Clear the pending mark of a cancelled job.
    pub fn abort(&self, model: &str) -> Result<Arc<ModelState>> {
        self.update(|state| {
            if state.pending.as_deref() == Some(model) {
                state.pending = None;
            }
            Ok(())
        })
    }

    /// Forget legacy entries for documents now served by the current model.
    pub fn clear_legacy(&self, documents: &[String]) -> Result<Arc<ModelState>> {
        self.update(|state| {
            for doc in documents {
                state.legacy.remove(doc);
            }
            Ok(())
        })
    }

    /// Drop a deleted document from the legacy set.
    pub fn forget(&self, document_id: &str) -> Result<()> {
        if !self.snapshot().legacy.contains_key(document_id) {
            return Ok(());
        }
        self.clear_legacy(&[document_id.to_string()]).map(|_| ())
    }

    fn update(
        &self,
        apply: impl FnOnce(&mut ModelState) -> Result<()>,
    ) -> Result<Arc<ModelState>> {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = ModelState::clone(&guard);
        apply(&mut next)?;
        next.version += 1;

        if let Some(db) = &self.config_db {
            db.set_settings(&[
                (CURRENT_MODEL_KEY, next.current.clone()),
                (LEGACY_DOCUMENTS_KEY, serde_json::to_string(&next.legacy)?),
            ])?;
        }

        let next = Arc::new(next);
        *guard = Arc::clone(&next);
        tracing::debug!(
            current = %next.current,
            pending = ?next.pending,
            version = next.version,
            "model state updated"
        );
        Ok(next)
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("state", &self.snapshot())
            .finish_non_exhaustive()
    }
}
