//! Optional code-fix suggestions from an external service.
//!
//! The service is untrusted and slow: it runs on a detached worker thread
//! with its own timeout, and nothing it does can change a sandbox result.

use crate::config::types::{ExecutionResult, OutcomeKind};
use crossbeam_channel::{bounded, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    pub suggestion_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrected_source: Option<String>,
}

#[derive(Error, Debug)]
pub enum SuggestionError {
    #[error("suggestion service unavailable: {0}")]
    Unavailable(String),

    #[error("suggestion service returned an invalid response: {0}")]
    InvalidResponse(String),
}

/// Remote collaborator that turns a failed run into advice
pub trait SuggestionService: Send + Sync {
    fn suggest(&self, source: &str, result: &ExecutionResult) -> Result<Suggestion, SuggestionError>;
}

/// Only failed runs or runs that wrote to stderr are worth a suggestion
pub fn wants_suggestion(result: &ExecutionResult) -> bool {
    result.kind == OutcomeKind::Crashed || !result.stderr.is_empty()
}

/// Calls a `SuggestionService` off-thread, bounded by `timeout`
#[derive(Clone)]
pub struct SuggestionClient {
    service: Arc<dyn SuggestionService>,
    timeout: Duration,
}

impl SuggestionClient {
    pub fn new(service: Arc<dyn SuggestionService>, timeout: Duration) -> Self {
        Self { service, timeout }
    }

    /// `None` when no suggestion is wanted, or the service failed or was too slow.
    pub fn request(&self, source: &str, result: &ExecutionResult) -> Option<Suggestion> {
        if !wants_suggestion(result) {
            return None;
        }

        let (tx, rx) = bounded(1);
        let service = Arc::clone(&self.service);
        let source = source.to_string();
        let result = result.clone();
        let run_id = result.run_id.clone();

        // Detached: a hung service keeps only this thread, never the caller
        let spawned = std::thread::Builder::new()
            .name("execbox-suggest".to_string())
            .spawn(move || {
                let _ = tx.send(service.suggest(&source, &result));
            });
        if let Err(e) = spawned {
            log::warn!("Could not start suggestion worker: {}", e);
            return None;
        }

        match rx.recv_timeout(self.timeout) {
            Ok(Ok(suggestion)) => Some(suggestion),
            Ok(Err(e)) => {
                log::warn!("Suggestion for run {} failed: {}", run_id, e);
                None
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!("Suggestion for run {} timed out after {:?}", run_id, self.timeout);
                None
            }
            Err(RecvTimeoutError::Disconnected) => {
                log::warn!("Suggestion worker for run {} exited without a reply", run_id);
                None
            }
        }
    }

    /// Like `request`, consulting and filling `cache` first.
    pub fn request_cached(
        &self,
        cache: &mut SuggestionCache,
        source: &str,
        result: &ExecutionResult,
    ) -> Option<Suggestion> {
        if !wants_suggestion(result) {
            return None;
        }
        let key = SuggestionCache::key(source, &result.stderr);
        if let Some(hit) = cache.get(&key) {
            return Some(hit.clone());
        }
        let suggestion = self.request(source, result)?;
        cache.insert(key, suggestion.clone());
        Some(suggestion)
    }
}

pub type CacheKey = [u8; 32];

/// Capped suggestion cache with first-in-first-out eviction
#[derive(Debug)]
pub struct SuggestionCache {
    capacity: usize,
    entries: HashMap<CacheKey, Suggestion>,
    order: VecDeque<CacheKey>,
}

impl SuggestionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// SHA-256 over the source and the error output it produced
    pub fn key(source: &str, stderr: &str) -> CacheKey {
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        hasher.update([0u8]);
        hasher.update(stderr.as_bytes());
        hasher.finalize().into()
    }

    pub fn get(&self, key: &CacheKey) -> Option<&Suggestion> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: CacheKey, suggestion: Suggestion) {
        if self.entries.insert(key, suggestion).is_some() {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
