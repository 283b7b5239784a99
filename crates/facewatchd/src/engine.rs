use crate::db::FaceDb;
use crate::import::{self, ImportStats};
use facewatch_core::registration::StagedFace;
use facewatch_core::{
    CommitOutcome, Detection, Durability, FaceExtractor, FrameAnnotator, PipelineError,
    RegistrationError, RegistrationSession, SessionState, SharedStore,
};
use facewatch_hw::FrameSource;
use image::RgbImage;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("registration error: {0}")]
    Registration(#[from] RegistrationError),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("no frame has been captured yet")]
    NoFrame,
    #[error("cannot read import directory: {0}")]
    ImportDirectory(std::io::Error),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Tunables for the capture/processing loop.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub match_threshold: f32,
    pub frame_scale: f32,
    pub label_capacity: usize,
    pub frame_interval: Duration,
    pub durability: Durability,
}

/// Snapshot of engine state for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub paused: bool,
    pub session: SessionState,
    pub staged: usize,
    pub known_faces: usize,
    pub labels: usize,
}

/// Result of seeding the registry from a directory tree.
#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    #[serde(flatten)]
    pub stats: ImportStats,
    pub outcome: CommitOutcome,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    /// Unblocks a paused loop so it re-reads the pause flag.
    Wake,
    Stage {
        placeholder: Option<String>,
        reply: oneshot::Sender<Result<Vec<StagedFace>, EngineError>>,
    },
    AssignLabel {
        index: usize,
        label: String,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Commit {
        reply: oneshot::Sender<Result<CommitOutcome, EngineError>>,
    },
    Cancel {
        reply: oneshot::Sender<()>,
    },
    RemoveLabel {
        label: String,
        reply: oneshot::Sender<Result<usize, EngineError>>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
    ImportDirectory {
        root: PathBuf,
        reply: oneshot::Sender<Result<ImportReport, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    store: Arc<SharedStore>,
    latest: Arc<Mutex<Vec<Detection>>>,
    paused: Arc<AtomicBool>,
}

impl EngineHandle {
    /// Stop starting new capture cycles. Takes effect before the next cycle.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        tracing::info!("capture paused");
    }

    /// Restart the capture loop.
    pub async fn resume(&self) -> Result<(), EngineError> {
        self.paused.store(false, Ordering::SeqCst);
        tracing::info!("capture resumed");
        self.tx
            .send(EngineRequest::Wake)
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// `(label, count)` pairs from the current store snapshot.
    pub fn labels(&self) -> Vec<(String, usize)> {
        self.store.snapshot().labels()
    }

    /// Annotations of the most recent processed frame, in full-frame space.
    pub fn latest_detections(&self) -> Vec<Detection> {
        self.latest.lock().clone()
    }

    /// Pause capture and stage the unknown faces of the last frame.
    pub async fn stage(&self, placeholder: Option<String>) -> Result<Vec<StagedFace>, EngineError> {
        self.pause();
        self.request(|reply| EngineRequest::Stage { placeholder, reply })
            .await?
    }

    pub async fn assign_label(&self, index: usize, label: String) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::AssignLabel {
            index,
            label,
            reply,
        })
        .await?
    }

    /// Commit the staged faces; capture resumes on success.
    pub async fn commit(&self) -> Result<CommitOutcome, EngineError> {
        self.request(|reply| EngineRequest::Commit { reply }).await?
    }

    /// Discard the staged faces and resume capture.
    pub async fn cancel(&self) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::Cancel { reply }).await
    }

    pub async fn remove_label(&self, label: String) -> Result<usize, EngineError> {
        self.request(|reply| EngineRequest::RemoveLabel { label, reply })
            .await?
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.request(|reply| EngineRequest::Status { reply }).await
    }

    /// Register the first face of every image under `root/<label>/`.
    /// Capture stalls while the engine thread works through the tree.
    pub async fn import_directory(&self, root: PathBuf) -> Result<ImportReport, EngineError> {
        self.request(|reply| EngineRequest::ImportDirectory { root, reply })
            .await?
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the frame source, the extractor, the database and the
/// registration session; the store is shared with the handle for reads.
pub fn spawn_engine<S, X>(
    source: S,
    extractor: X,
    db: FaceDb,
    store: Arc<SharedStore>,
    settings: EngineSettings,
) -> Result<EngineHandle, EngineError>
where
    S: FrameSource + Send + 'static,
    X: FaceExtractor + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<EngineRequest>(4);
    let engine = Engine::new(source, extractor, db, Arc::clone(&store), settings)?;
    let latest = Arc::clone(&engine.latest);
    let paused = Arc::clone(&engine.paused);

    std::thread::Builder::new()
        .name("facewatch-engine".into())
        .spawn(move || engine.run(rx))
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle {
        tx,
        store,
        latest,
        paused,
    })
}

struct Engine<S, X> {
    source: S,
    extractor: X,
    db: FaceDb,
    store: Arc<SharedStore>,
    session: RegistrationSession,
    live: FrameAnnotator,
    still: FrameAnnotator,
    settings: EngineSettings,
    last_frame: Option<RgbImage>,
    latest: Arc<Mutex<Vec<Detection>>>,
    paused: Arc<AtomicBool>,
}

impl<S: FrameSource, X: FaceExtractor> Engine<S, X> {
    fn new(
        source: S,
        extractor: X,
        db: FaceDb,
        store: Arc<SharedStore>,
        settings: EngineSettings,
    ) -> Result<Self, EngineError> {
        Ok(Self {
            live: FrameAnnotator::new(settings.frame_scale, settings.match_threshold)?,
            still: FrameAnnotator::new(1.0, settings.match_threshold)?,
            session: RegistrationSession::new(settings.label_capacity),
            source,
            extractor,
            db,
            store,
            settings,
            last_frame: None,
            latest: Arc::new(Mutex::new(Vec::new())),
            paused: Arc::new(AtomicBool::new(false)),
        })
    }

    fn run(mut self, mut rx: mpsc::Receiver<EngineRequest>) {
        tracing::info!("engine thread started");
        'outer: loop {
            // Drain pending requests; block while paused.
            loop {
                let req = if self.paused.load(Ordering::SeqCst) {
                    match rx.blocking_recv() {
                        Some(req) => req,
                        None => break 'outer,
                    }
                } else {
                    match rx.try_recv() {
                        Ok(req) => req,
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => break 'outer,
                    }
                };
                self.handle(req);
            }

            if self.paused.load(Ordering::SeqCst) {
                continue;
            }
            self.run_cycle();
            std::thread::sleep(self.settings.frame_interval);
        }
        tracing::info!("engine thread exiting");
    }

    /// One capture → annotate → publish cycle. Read failures skip the cycle.
    fn run_cycle(&mut self) {
        let frame = match self.source.read_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(error = %e, "frame read failed; skipping cycle");
                return;
            }
        };

        let snapshot = self.store.snapshot();
        match self.live.annotate(&mut self.extractor, &frame.image, &snapshot) {
            Ok(detections) => {
                *self.latest.lock() = detections;
            }
            Err(e) => tracing::warn!(seq = frame.sequence, error = %e, "frame annotation failed"),
        }
        self.last_frame = Some(frame.image);
    }

    fn handle(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::Wake => {}
            EngineRequest::Stage { placeholder, reply } => {
                let _ = reply.send(self.stage(placeholder.as_deref()));
            }
            EngineRequest::AssignLabel {
                index,
                label,
                reply,
            } => {
                let result = self
                    .session
                    .assign_label(index, &label)
                    .map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineRequest::Commit { reply } => {
                let _ = reply.send(self.commit());
            }
            EngineRequest::Cancel { reply } => {
                self.session.cancel();
                self.paused.store(false, Ordering::SeqCst);
                let _ = reply.send(());
            }
            EngineRequest::RemoveLabel { label, reply } => {
                let _ = reply.send(self.remove_label(&label));
            }
            EngineRequest::Status { reply } => {
                let snapshot = self.store.snapshot();
                let _ = reply.send(EngineStatus {
                    paused: self.paused.load(Ordering::SeqCst),
                    session: self.session.state(),
                    staged: self.session.staged().len(),
                    known_faces: snapshot.len(),
                    labels: snapshot.labels().len(),
                });
            }
            EngineRequest::ImportDirectory { root, reply } => {
                let _ = reply.send(self.import_directory(&root));
            }
        }
    }

    /// Re-annotate the paused frame at full resolution and stage its unknowns.
    fn stage(&mut self, placeholder: Option<&str>) -> Result<Vec<StagedFace>, EngineError> {
        self.paused.store(true, Ordering::SeqCst);

        let frame = self.last_frame.as_ref().ok_or(EngineError::NoFrame)?;
        let snapshot = self.store.snapshot();
        let detections = self.still.annotate(&mut self.extractor, frame, &snapshot)?;
        self.session
            .begin_from_detections(&detections, placeholder, &snapshot)?;
        Ok(self.session.staged().to_vec())
    }

    fn commit(&mut self) -> Result<CommitOutcome, EngineError> {
        let outcome = self
            .session
            .commit(&self.store, &mut self.db, self.settings.durability);

        if self.session.state() == SessionState::Committed {
            self.session = RegistrationSession::new(self.settings.label_capacity);
            self.paused.store(false, Ordering::SeqCst);
        }
        Ok(outcome?)
    }

    /// Stage the directory's faces in a separate session and commit them, so
    /// an interactive registration in progress is left alone.
    fn import_directory(&mut self, root: &std::path::Path) -> Result<ImportReport, EngineError> {
        let images = import::collect_images(root).map_err(EngineError::ImportDirectory)?;
        let dim = self.store.snapshot().dim();
        let (staged, stats) = import::extract_labelled(&images, &mut self.extractor, dim);

        let mut session = RegistrationSession::new(self.settings.label_capacity);
        session.begin_labelled(staged)?;
        let outcome = session.commit(&self.store, &mut self.db, self.settings.durability)?;

        tracing::info!(
            root = %root.display(),
            accepted = outcome.accepted.len(),
            dropped_at_capacity = outcome.dropped_at_capacity,
            "directory imported"
        );
        Ok(ImportReport { stats, outcome })
    }

    /// Delete a label from disk, then from memory.
    fn remove_label(&mut self, label: &str) -> Result<usize, EngineError> {
        self.db.delete_label(label)?;
        let removed = self.store.modify(|s| s.remove_label(label));
        tracing::info!(label, removed, "label removed");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facewatch_core::{Embedding, EmbeddingStore, FaceBox, RawFace};
    use facewatch_hw::{CameraError, Frame};

    /// Yields blank frames; every third read fails.
    struct FakeSource {
        reads: u32,
    }

    impl FrameSource for FakeSource {
        fn read_frame(&mut self) -> Result<Frame, CameraError> {
            self.reads += 1;
            if self.reads % 3 == 0 {
                return Err(CameraError::CaptureFailed("dropped".into()));
            }
            Ok(Frame {
                image: RgbImage::new(40, 20),
                timestamp: std::time::Instant::now(),
                sequence: self.reads,
            })
        }
    }

    /// Always sees the same two faces.
    struct FakeExtractor;

    impl FaceExtractor for FakeExtractor {
        fn detect_and_embed(&mut self, image: &RgbImage) -> Result<Vec<RawFace>, PipelineError> {
            let w = image.width() as f32;
            Ok(vec![
                RawFace {
                    face_box: FaceBox::new(0.0, w / 4.0, 5.0, 0.0),
                    embedding: Embedding::new(vec![1.0, 0.0]),
                },
                RawFace {
                    face_box: FaceBox::new(0.0, w / 2.0, 5.0, w / 4.0),
                    embedding: Embedding::new(vec![0.0, 1.0]),
                },
            ])
        }
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            match_threshold: 0.4,
            frame_scale: 0.5,
            label_capacity: 10,
            frame_interval: Duration::from_millis(1),
            durability: Durability::Strict,
        }
    }

    fn start() -> EngineHandle {
        start_with(settings())
    }

    fn start_with(settings: EngineSettings) -> EngineHandle {
        let store = Arc::new(SharedStore::new(EmbeddingStore::new(2)));
        spawn_engine(
            FakeSource { reads: 0 },
            FakeExtractor,
            FaceDb::open_in_memory().unwrap(),
            store,
            settings,
        )
        .unwrap()
    }

    fn engine_in_place(source: FakeSource) -> Engine<FakeSource, FakeExtractor> {
        let store = Arc::new(SharedStore::new(EmbeddingStore::new(2)));
        Engine::new(
            source,
            FakeExtractor,
            FaceDb::open_in_memory().unwrap(),
            store,
            settings(),
        )
        .unwrap()
    }

    fn image_tree(labels: &[(&str, usize)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (label, count) in labels {
            let sub = dir.path().join(label);
            std::fs::create_dir(&sub).unwrap();
            for i in 0..*count {
                RgbImage::new(8, 8).save(sub.join(format!("{i}.png"))).unwrap();
            }
        }
        dir
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_live_detections_are_in_frame_space() {
        let engine = start();
        wait_for(|| !engine.latest_detections().is_empty()).await;

        let dets = engine.latest_detections();
        assert_eq!(dets.len(), 2);
        // Extractor saw a 20px-wide frame; boxes map back to the 40px frame.
        assert_eq!(dets[0].face_box, FaceBox::new(0.0, 10.0, 10.0, 0.0));
        assert!(dets.iter().all(|d| d.is_unknown()));
    }

    #[tokio::test]
    async fn test_register_then_recognize() {
        let engine = start();
        wait_for(|| !engine.latest_detections().is_empty()).await;

        let staged = engine.stage(None).await.unwrap();
        assert_eq!(staged.len(), 2);
        // Registration review annotates at full resolution.
        assert_eq!(staged[0].face_box, FaceBox::new(0.0, 10.0, 5.0, 0.0));
        assert!(engine.is_paused());

        engine.assign_label(0, "Alice".into()).await.unwrap();
        let outcome = engine.commit().await.unwrap();
        assert_eq!(outcome.accepted, vec!["Alice".to_string()]);
        assert_eq!(outcome.skipped_unlabeled, 1);
        assert_eq!(engine.labels(), vec![("Alice".to_string(), 1)]);
        assert!(!engine.is_paused());

        wait_for(|| {
            engine
                .latest_detections()
                .first()
                .is_some_and(|d| d.label.as_deref() == Some("Alice"))
        })
        .await;
        assert!(engine.latest_detections()[1].is_unknown());
    }

    #[tokio::test]
    async fn test_cancel_resumes_without_registering() {
        let engine = start();
        wait_for(|| !engine.latest_detections().is_empty()).await;

        engine.stage(Some("Bob".into())).await.unwrap();
        let status = engine.status().await.unwrap();
        assert!(status.paused);
        assert_eq!(status.session, SessionState::Collecting);
        assert_eq!(status.staged, 2);

        engine.cancel().await.unwrap();
        let status = engine.status().await.unwrap();
        assert!(!status.paused);
        assert_eq!(status.session, SessionState::Idle);
        assert_eq!(status.known_faces, 0);
    }

    #[tokio::test]
    async fn test_remove_label() {
        let engine = start();
        wait_for(|| !engine.latest_detections().is_empty()).await;

        engine.stage(Some("Cara".into())).await.unwrap();
        engine.commit().await.unwrap();
        assert_eq!(engine.labels(), vec![("Cara".to_string(), 2)]);

        assert_eq!(engine.remove_label("Cara".into()).await.unwrap(), 2);
        assert!(engine.labels().is_empty());
    }

    #[tokio::test]
    async fn test_paused_loop_stops_publishing() {
        let engine = start();
        wait_for(|| !engine.latest_detections().is_empty()).await;
        engine.pause();
        // Let any in-flight cycle finish.
        let _ = engine.status().await.unwrap();
        *engine.latest.lock() = Vec::new();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(engine.latest_detections().is_empty());

        engine.resume().await.unwrap();
        wait_for(|| !engine.latest_detections().is_empty()).await;
    }

    #[test]
    fn test_failed_read_skips_cycle() {
        // Read #2 succeeds, read #3 fails, read #4 succeeds.
        let mut engine = engine_in_place(FakeSource { reads: 1 });
        engine.run_cycle();
        assert_eq!(engine.latest.lock().len(), 2);
        assert!(engine.last_frame.is_some());

        engine.latest.lock().clear();
        engine.last_frame = None;
        engine.run_cycle();
        assert_eq!(engine.source.reads, 3);
        assert!(engine.latest.lock().is_empty());
        assert!(engine.last_frame.is_none());

        engine.run_cycle();
        assert_eq!(engine.latest.lock().len(), 2);
        assert!(engine.last_frame.is_some());
    }

    #[tokio::test]
    async fn test_import_directory_registers_first_face_per_image() {
        let engine = start();
        let dir = image_tree(&[("dave", 2), ("erin", 1)]);

        let report = engine.import_directory(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(report.stats.images, 3);
        assert_eq!(
            report.outcome.accepted,
            vec!["dave".to_string(), "dave".to_string(), "erin".to_string()]
        );
        assert_eq!(
            engine.labels(),
            vec![("dave".to_string(), 2), ("erin".to_string(), 1)]
        );

        // Imported faces are recognized live.
        wait_for(|| {
            engine
                .latest_detections()
                .first()
                .is_some_and(|d| d.label.as_deref() == Some("dave"))
        })
        .await;
    }

    #[tokio::test]
    async fn test_import_directory_respects_capacity() {
        let engine = start_with(EngineSettings {
            label_capacity: 1,
            ..settings()
        });
        let dir = image_tree(&[("dave", 3)]);

        let report = engine.import_directory(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(report.outcome.accepted, vec!["dave".to_string()]);
        assert_eq!(report.outcome.dropped_at_capacity, 2);
        assert_eq!(engine.labels(), vec![("dave".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_import_leaves_interactive_session_alone() {
        let engine = start();
        wait_for(|| !engine.latest_detections().is_empty()).await;
        engine.stage(Some("Fay".into())).await.unwrap();

        let dir = image_tree(&[("dave", 1)]);
        engine.import_directory(dir.path().to_path_buf()).await.unwrap();

        let status = engine.status().await.unwrap();
        assert_eq!(status.session, SessionState::Collecting);
        assert_eq!(status.staged, 2);
        assert_eq!(status.known_faces, 1);
    }

    #[tokio::test]
    async fn test_import_missing_directory_fails() {
        let engine = start();
        let err = engine
            .import_directory(PathBuf::from("/nonexistent/facewatch-import"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ImportDirectory(_)));
    }
}
