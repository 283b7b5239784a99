//! Interactive registration of unknown faces from one paused frame.
//!
//! A session stages the "Unknown" detections of a single frame, lets the
//! operator name them, and commits the named ones to the shared store and
//! to durable storage in one batch. No label ever exceeds the capacity
//! limit, however many staged faces share it.

use crate::codec;
use crate::gallery::{EmbeddingStore, SharedStore, StoreError, DEFAULT_LABEL_CAPACITY};
use crate::types::{is_registrable_label, Detection, Embedding, FaceBox};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

/// Durable write failure reported by a [`FacePersistence`] backend.
#[derive(Error, Debug)]
#[error("persistence failed: {message}")]
pub struct PersistenceError {
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl PersistenceError {
    pub fn new(
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }
}

/// Write-through target for committed faces. Rows carry the
/// [`codec::encode`] byte form of each embedding.
pub trait FacePersistence {
    /// Persist all rows as a single batch.
    fn append_batch(&mut self, rows: &[(String, Vec<u8>)]) -> Result<(), PersistenceError>;
}

#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("{operation} is not valid in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    #[error("staged index {index} out of range ({len} staged)")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("store rejected entry: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    Collecting,
    AwaitingInput,
    Committed,
}

/// Commit ordering between memory and disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    /// Appends and the durable write happen under one writer lock; the new
    /// store is published only after the write succeeds.
    #[default]
    Strict,
    /// Publish in memory first, then write. A failed write leaves memory
    /// ahead of disk.
    BestEffort,
}

/// One unknown face awaiting a name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StagedFace {
    pub face_box: FaceBox,
    pub label: Option<String>,
    #[serde(skip)]
    pub embedding: Embedding,
}

/// What a commit did with each staged face.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommitOutcome {
    /// Labels appended, in staging order.
    pub accepted: Vec<String>,
    /// Named faces dropped because their label was at capacity.
    pub dropped_at_capacity: usize,
    /// Faces left without a usable name.
    pub skipped_unlabeled: usize,
}

#[derive(Debug)]
pub struct RegistrationSession {
    state: SessionState,
    staged: Vec<StagedFace>,
    capacity: usize,
}

impl Default for RegistrationSession {
    fn default() -> Self {
        Self::new(DEFAULT_LABEL_CAPACITY)
    }
}

impl RegistrationSession {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: SessionState::Idle,
            staged: Vec::new(),
            capacity,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn staged(&self) -> &[StagedFace] {
        &self.staged
    }

    /// Stage the unknown faces of one frame, replacing any earlier batch.
    ///
    /// `placeholder` is the default name shown for every staged face. When it
    /// names a label that is already at capacity nothing is staged.
    pub fn begin_from_detections(
        &mut self,
        detections: &[Detection],
        placeholder: Option<&str>,
        store: &EmbeddingStore,
    ) -> Result<usize, RegistrationError> {
        self.require("begin", &[SessionState::Idle, SessionState::Collecting])?;

        let placeholder = placeholder
            .map(str::trim)
            .filter(|p| is_registrable_label(p))
            .map(str::to_string);

        let full = placeholder
            .as_deref()
            .is_some_and(|p| store.count_for_label(p) >= self.capacity);

        self.staged = if full {
            tracing::info!(
                label = placeholder.as_deref().unwrap_or_default(),
                "placeholder label is at capacity; nothing staged"
            );
            Vec::new()
        } else {
            detections
                .iter()
                .filter(|d| d.is_unknown())
                .map(|d| StagedFace {
                    face_box: d.face_box,
                    label: placeholder.clone(),
                    embedding: d.embedding.clone(),
                })
                .collect()
        };

        self.state = SessionState::Collecting;
        tracing::info!(
            detections = detections.len(),
            staged = self.staged.len(),
            "registration staged"
        );
        Ok(self.staged.len())
    }

    /// Stage faces that arrive already named, such as a bulk import.
    ///
    /// Unusable names are cleared, so those faces count as unlabeled at
    /// commit. The session goes straight to `AwaitingInput`.
    pub fn begin_labelled(
        &mut self,
        faces: impl IntoIterator<Item = StagedFace>,
    ) -> Result<usize, RegistrationError> {
        self.require("begin", &[SessionState::Idle, SessionState::Collecting])?;

        self.staged = faces
            .into_iter()
            .map(|mut face| {
                face.label = face
                    .label
                    .as_deref()
                    .map(str::trim)
                    .filter(|l| is_registrable_label(l))
                    .map(str::to_string);
                face
            })
            .collect();

        self.state = SessionState::AwaitingInput;
        tracing::info!(staged = self.staged.len(), "labelled faces staged");
        Ok(self.staged.len())
    }

    /// Override the label of one staged face.
    pub fn assign_label(&mut self, index: usize, label: &str) -> Result<(), RegistrationError> {
        self.require(
            "assign_label",
            &[SessionState::Collecting, SessionState::AwaitingInput],
        )?;
        let len = self.staged.len();
        let face = self
            .staged
            .get_mut(index)
            .ok_or(RegistrationError::IndexOutOfRange { index, len })?;

        let label = label.trim();
        face.label = is_registrable_label(label).then(|| label.to_string());
        self.state = SessionState::AwaitingInput;
        Ok(())
    }

    /// Operator dismissal: drop everything staged and return to `Idle`.
    pub fn cancel(&mut self) {
        if self.state != SessionState::Idle {
            tracing::info!(staged = self.staged.len(), "registration cancelled");
        }
        self.staged.clear();
        self.state = SessionState::Idle;
    }

    /// Append every named, under-capacity face to `store` and `persist`.
    ///
    /// Capacity is rechecked per face against the live store plus the faces
    /// already accepted by this commit; overflow is dropped, not an error.
    pub fn commit<P>(
        &mut self,
        store: &SharedStore,
        persist: &mut P,
        durability: Durability,
    ) -> Result<CommitOutcome, RegistrationError>
    where
        P: FacePersistence + ?Sized,
    {
        self.require(
            "commit",
            &[SessionState::Collecting, SessionState::AwaitingInput],
        )?;

        let result = match durability {
            Durability::Strict => store.transaction(|draft| {
                let (outcome, rows) = self.apply(draft)?;
                if !rows.is_empty() {
                    persist.append_batch(&rows)?;
                }
                Ok(outcome)
            }),
            Durability::BestEffort => store
                .transaction(|draft| self.apply(draft))
                .map_err(RegistrationError::from)
                .and_then(|(outcome, rows)| {
                    if !rows.is_empty() {
                        persist.append_batch(&rows).map_err(|e| {
                            // Memory already holds the batch; reopening would duplicate it.
                            self.finish();
                            RegistrationError::from(e)
                        })?;
                    }
                    Ok(outcome)
                }),
        };

        match &result {
            Ok(outcome) => {
                tracing::info!(
                    accepted = outcome.accepted.len(),
                    dropped_at_capacity = outcome.dropped_at_capacity,
                    skipped_unlabeled = outcome.skipped_unlabeled,
                    "registration committed"
                );
                self.finish();
            }
            Err(e) => tracing::warn!(error = %e, state = ?self.state, "registration commit failed"),
        }
        result
    }

    /// Compute and apply the accepted appends on `draft`, returning the
    /// outcome and the rows to persist.
    fn apply(
        &self,
        draft: &mut EmbeddingStore,
    ) -> Result<(CommitOutcome, Vec<(String, Vec<u8>)>), StoreError> {
        let mut outcome = CommitOutcome::default();
        let mut rows = Vec::new();
        let mut counts: HashMap<&str, usize> = HashMap::new();

        for face in &self.staged {
            let Some(label) = face.label.as_deref() else {
                outcome.skipped_unlabeled += 1;
                continue;
            };
            let count = counts
                .entry(label)
                .or_insert_with(|| draft.count_for_label(label));
            if *count >= self.capacity {
                outcome.dropped_at_capacity += 1;
                continue;
            }
            draft.append(label, face.embedding.clone())?;
            *count += 1;
            rows.push((label.to_string(), codec::encode(&face.embedding)));
            outcome.accepted.push(label.to_string());
        }

        Ok((outcome, rows))
    }

    fn finish(&mut self) {
        self.staged.clear();
        self.state = SessionState::Committed;
    }

    fn require(
        &self,
        operation: &'static str,
        allowed: &[SessionState],
    ) -> Result<(), RegistrationError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(RegistrationError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }
}
