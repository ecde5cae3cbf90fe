//! Explicit candidate registration table.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::warn;

use super::{CandidateHandle, GitCandidate};
use crate::error::RegistryError;

/// Candidates known to a run, keyed by name.
#[derive(Default, Clone)]
pub struct CandidateRegistry {
    candidates: BTreeMap<String, Arc<dyn CandidateHandle>>,
}

impl CandidateRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the candidates compiled into this binary.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        let git: Arc<dyn CandidateHandle> = Arc::new(GitCandidate::new());
        registry.candidates.insert(git.name().to_string(), git);
        registry
    }

    /// Adds a candidate. Names must be unique.
    pub fn register(&mut self, candidate: Arc<dyn CandidateHandle>) -> Result<(), RegistryError> {
        let name = candidate.name().to_string();
        if self.candidates.contains_key(&name) {
            return Err(RegistryError::DuplicateCandidate(name));
        }
        self.candidates.insert(name, candidate);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn CandidateHandle>, RegistryError> {
        self.candidates
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::CandidateNotFound(name.to_string()))
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.candidates.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn CandidateHandle>> {
        self.candidates.values()
    }

    /// Returns the candidates named in `filter`, or all of them.
    ///
    /// Unknown names are logged and ignored. The result is sorted by name.
    pub fn select(&self, filter: Option<&[String]>) -> Vec<Arc<dyn CandidateHandle>> {
        let Some(names) = filter else {
            return self.candidates.values().cloned().collect();
        };
        let mut selected: BTreeMap<&str, Arc<dyn CandidateHandle>> = BTreeMap::new();
        for name in names {
            match self.candidates.get(name) {
                Some(candidate) => {
                    selected.insert(name.as_str(), Arc::clone(candidate));
                }
                None => warn!(candidate = %name, "Requested candidate is not registered"),
            }
        }
        selected.into_values().collect()
    }
}

impl std::fmt::Debug for CandidateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandidateRegistry")
            .field("candidates", &self.names())
            .finish()
    }
}
