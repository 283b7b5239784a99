//! facewatch-core — known-face registry and matching engine.
//!
//! Holds the in-memory set of registered face embeddings, matches new
//! observations against it by L2 distance, annotates whole frames through
//! an external detector/embedder, and runs the interactive registration
//! workflow that adds new identities without exceeding per-label capacity.

pub mod codec;
pub mod gallery;
pub mod matcher;
pub mod pipeline;
pub mod registration;
pub mod types;

pub use gallery::{EmbeddingStore, SharedStore, StoreError, DEFAULT_LABEL_CAPACITY};
pub use matcher::{L2Matcher, Matcher, DEFAULT_MATCH_THRESHOLD};
pub use pipeline::{FaceExtractor, FrameAnnotator, PipelineError, DEFAULT_FRAME_SCALE};
pub use registration::{
    CommitOutcome, Durability, FacePersistence, PersistenceError, RegistrationError,
    RegistrationSession, SessionState,
};
pub use types::{Detection, Embedding, FaceBox, KnownFace, MatchResult, RawFace, UNKNOWN_LABEL};
