//! Bulk seeding of the registry from a `<root>/<label>/<image>` tree.
//!
//! Each subdirectory name is a label. Every decodable image in it
//! contributes the first face the extractor reports; images without a face
//! or that fail to decode are counted and skipped.

use facewatch_core::registration::StagedFace;
use facewatch_core::{FaceExtractor, PipelineError};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Per-image tallies of a directory import.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportStats {
    pub images: usize,
    pub without_face: usize,
    pub unreadable: usize,
    pub extraction_failed: usize,
}

/// `(label, image path)` pairs under `root`, sorted by label then file name.
///
/// Hidden entries and plain files at the top level are ignored.
pub fn collect_images(root: &Path) -> std::io::Result<Vec<(String, PathBuf)>> {
    let mut images = Vec::new();
    for label_dir in sorted_entries(root)? {
        if !label_dir.is_dir() {
            continue;
        }
        let Some(label) = visible_name(&label_dir) else {
            continue;
        };
        for path in sorted_entries(&label_dir)? {
            if path.is_file() && visible_name(&path).is_some() {
                images.push((label.clone(), path));
            }
        }
    }
    Ok(images)
}

/// Run `extractor` at full resolution over every image and stage the first
/// face of each under its directory's label.
pub fn extract_labelled<X>(
    images: &[(String, PathBuf)],
    extractor: &mut X,
    dim: usize,
) -> (Vec<StagedFace>, ImportStats)
where
    X: FaceExtractor + ?Sized,
{
    let mut stats = ImportStats::default();
    let mut staged = Vec::new();

    for (label, path) in images {
        stats.images += 1;

        let image = match image::open(path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable image");
                stats.unreadable += 1;
                continue;
            }
        };

        let first = extractor
            .detect_and_embed(&image)
            .and_then(|faces| match faces.into_iter().next() {
                Some(face) if face.embedding.dim() != dim => {
                    Err(PipelineError::DimensionMismatch {
                        expected: dim,
                        actual: face.embedding.dim(),
                    })
                }
                first => Ok(first),
            });

        match first {
            Ok(Some(face)) => staged.push(StagedFace {
                face_box: face.face_box,
                label: Some(label.clone()),
                embedding: face.embedding,
            }),
            Ok(None) => {
                tracing::debug!(path = %path.display(), "no face found");
                stats.without_face += 1;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "face extraction failed");
                stats.extraction_failed += 1;
            }
        }
    }

    tracing::info!(
        images = stats.images,
        staged = staged.len(),
        without_face = stats.without_face,
        unreadable = stats.unreadable,
        extraction_failed = stats.extraction_failed,
        "directory scanned"
    );
    (staged, stats)
}

fn sorted_entries(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut paths = std::fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?;
    paths.sort();
    Ok(paths)
}

fn visible_name(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    (!name.starts_with('.')).then(|| name.to_string())
}
