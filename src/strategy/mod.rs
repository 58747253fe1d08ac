//! Search strategy executors.
//!
//! Each executor turns a [`NormalizedQuery`] into scored [`Candidate`]s in
//! `[0, 1]`. They are synchronous; the orchestrator runs them on the
//! blocking pool, each under its own timeout.

pub mod exact;
pub mod fuzzy;
pub mod semantic;

pub use exact::ExactExecutor;
pub use fuzzy::FuzzyExecutor;
pub use semantic::SemanticExecutor;

use crate::{
    error::Result,
    model::{Candidate, MatchType, SearchFilters},
    model_registry::ModelState,
    query::NormalizedQuery,
};

#[derive(Debug)]
pub enum StrategyExecutor {
    Exact(ExactExecutor),
    Fuzzy(FuzzyExecutor),
    Semantic(SemanticExecutor),
}

impl StrategyExecutor {
    pub fn kind(&self) -> MatchType {
        match self {
            StrategyExecutor::Exact(_) => MatchType::Exact,
            StrategyExecutor::Fuzzy(_) => MatchType::Fuzzy,
            StrategyExecutor::Semantic(_) => MatchType::Semantic,
        }
    }

    pub fn execute(
        &self,
        query: &NormalizedQuery,
        filters: &SearchFilters,
    ) -> Result<Vec<Candidate>> {
        self.run(None, query, filters)
    }

    /// Like [`execute`](Self::execute), with the semantic strategy pinned
    /// to the model snapshot `state`.
    pub fn execute_at(
        &self,
        state: &ModelState,
        query: &NormalizedQuery,
        filters: &SearchFilters,
    ) -> Result<Vec<Candidate>> {
        self.run(Some(state), query, filters)
    }

    fn run(
        &self,
        state: Option<&ModelState>,
        query: &NormalizedQuery,
        filters: &SearchFilters,
    ) -> Result<Vec<Candidate>> {
        let candidates = match (self, state) {
            (StrategyExecutor::Exact(e), _) => e.execute(query, filters),
            (StrategyExecutor::Fuzzy(e), _) => e.execute(query, filters),
            (StrategyExecutor::Semantic(e), Some(state)) => {
                e.execute_with(state, query, filters)
            }
            (StrategyExecutor::Semantic(e), None) => e.execute(query, filters),
        }?;
        tracing::debug!(
            strategy = %self.kind(),
            candidates = candidates.len(),
            "strategy finished"
        );
        Ok(candidates)
    }
}
