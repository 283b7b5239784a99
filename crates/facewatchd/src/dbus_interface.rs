use crate::engine::{EngineError, EngineHandle};
use facewatch_core::RegistrationError;
use serde::Serialize;
use zbus::interface;

pub const BUS_NAME: &str = "org.facewatch.Registry1";
pub const OBJECT_PATH: &str = "/org/facewatch/Registry1";

/// D-Bus interface for the facewatch daemon.
///
/// Bus name: org.facewatch.Registry1
/// Object path: /org/facewatch/Registry1
pub struct RegistryService {
    engine: EngineHandle,
}

impl RegistryService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

#[interface(name = "org.facewatch.Registry1")]
impl RegistryService {
    /// Return daemon status information as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(to_fdo)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "engine": status,
        })
        .to_string())
    }

    /// Stop capture before the next cycle.
    async fn pause(&self) -> zbus::fdo::Result<()> {
        self.engine.pause();
        Ok(())
    }

    async fn resume(&self) -> zbus::fdo::Result<()> {
        self.engine.resume().await.map_err(to_fdo)
    }

    /// Pause and stage the unknown faces of the current frame.
    /// An empty `placeholder` stages them without a default name.
    async fn stage_registration(&self, placeholder: &str) -> zbus::fdo::Result<String> {
        tracing::info!(placeholder, "stage_registration requested");
        let placeholder = (!placeholder.trim().is_empty()).then(|| placeholder.to_string());
        let staged = self.engine.stage(placeholder).await.map_err(to_fdo)?;
        to_json(&staged)
    }

    async fn assign_label(&self, index: u32, label: &str) -> zbus::fdo::Result<()> {
        tracing::info!(index, label, "assign_label requested");
        self.engine
            .assign_label(index as usize, label.to_string())
            .await
            .map_err(to_fdo)
    }

    async fn commit_registration(&self) -> zbus::fdo::Result<String> {
        tracing::info!("commit_registration requested");
        let outcome = self.engine.commit().await.map_err(to_fdo)?;
        to_json(&outcome)
    }

    async fn cancel_registration(&self) -> zbus::fdo::Result<()> {
        tracing::info!("cancel_registration requested");
        self.engine.cancel().await.map_err(to_fdo)
    }

    /// Registered labels and their embedding counts.
    async fn list_labels(&self) -> zbus::fdo::Result<String> {
        let labels: Vec<_> = self
            .engine
            .labels()
            .into_iter()
            .map(|(label, count)| serde_json::json!({ "label": label, "count": count }))
            .collect();
        to_json(&labels)
    }

    /// Remove every embedding registered under `label`.
    async fn remove_label(&self, label: &str) -> zbus::fdo::Result<u32> {
        tracing::info!(label, "remove_label requested");
        let removed = self
            .engine
            .remove_label(label.to_string())
            .await
            .map_err(to_fdo)?;
        Ok(removed as u32)
    }

    /// Register the first face of each image under `path/<label>/`.
    /// `path` is resolved by the daemon, so callers should pass it absolute.
    async fn import_directory(&self, path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(path, "import_directory requested");
        let report = self
            .engine
            .import_directory(path.into())
            .await
            .map_err(to_fdo)?;
        to_json(&report)
    }

    /// Annotated faces of the most recent frame.
    async fn latest_detections(&self) -> zbus::fdo::Result<String> {
        to_json(&self.engine.latest_detections())
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn to_fdo(e: EngineError) -> zbus::fdo::Error {
    tracing::warn!(error = %e, "request failed");
    match e {
        EngineError::Registration(
            RegistrationError::InvalidState { .. } | RegistrationError::IndexOutOfRange { .. },
        )
        | EngineError::NoFrame
        | EngineError::ImportDirectory(_) => zbus::fdo::Error::InvalidArgs(e.to_string()),
        _ => zbus::fdo::Error::Failed(e.to_string()),
    }
}
