//! Frame annotation: resample, detect + embed, match, map back to frame space.

use crate::gallery::EmbeddingStore;
use crate::matcher::{L2Matcher, Matcher, DEFAULT_MATCH_THRESHOLD};
use crate::types::{Detection, MatchResult, RawFace};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use std::borrow::Cow;
use thiserror::Error;

/// Default downscale factor applied to live frames before extraction.
pub const DEFAULT_FRAME_SCALE: f32 = 0.5;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("scale factor must be finite and positive, got {0}")]
    InvalidScale(f32),
    #[error("face extraction failed: {0}")]
    Extraction(String),
    #[error("extractor produced a {actual}-dim embedding, store expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Opaque face detector + embedder.
///
/// Returns one entry per located face, boxes in the pixel coordinates of
/// `image`, in the extractor's own order.
pub trait FaceExtractor {
    fn detect_and_embed(&mut self, image: &RgbImage) -> Result<Vec<RawFace>, PipelineError>;
}

impl<T: FaceExtractor + ?Sized> FaceExtractor for Box<T> {
    fn detect_and_embed(&mut self, image: &RgbImage) -> Result<Vec<RawFace>, PipelineError> {
        (**self).detect_and_embed(image)
    }
}

/// Runs the extractor over a resampled frame and labels every face.
#[derive(Debug, Clone)]
pub struct FrameAnnotator<M = L2Matcher> {
    scale: f32,
    threshold: f32,
    matcher: M,
}

impl FrameAnnotator<L2Matcher> {
    pub fn new(scale: f32, threshold: f32) -> Result<Self, PipelineError> {
        Self::with_matcher(scale, threshold, L2Matcher)
    }
}

impl Default for FrameAnnotator<L2Matcher> {
    fn default() -> Self {
        Self {
            scale: DEFAULT_FRAME_SCALE,
            threshold: DEFAULT_MATCH_THRESHOLD,
            matcher: L2Matcher,
        }
    }
}

impl<M: Matcher> FrameAnnotator<M> {
    pub fn with_matcher(scale: f32, threshold: f32, matcher: M) -> Result<Self, PipelineError> {
        if !scale.is_finite() || scale <= 0.0 {
            return Err(PipelineError::InvalidScale(scale));
        }
        Ok(Self {
            scale,
            threshold,
            matcher,
        })
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Detect, embed and label every face in `frame`.
    ///
    /// Returned boxes are in `frame`'s coordinate space and keep the
    /// extractor's ordering.
    pub fn annotate<E>(
        &self,
        extractor: &mut E,
        frame: &RgbImage,
        store: &EmbeddingStore,
    ) -> Result<Vec<Detection>, PipelineError>
    where
        E: FaceExtractor + ?Sized,
    {
        let input = resample(frame, self.scale);
        // Map back by the realized size ratio; rounding can make it differ from 1/scale.
        let fx = frame.width() as f32 / input.width() as f32;
        let fy = frame.height() as f32 / input.height() as f32;
        let faces = extractor.detect_and_embed(&input)?;

        let gallery = store.entries();
        let mut detections = Vec::with_capacity(faces.len());

        for face in faces {
            if face.embedding.dim() != store.dim() {
                return Err(PipelineError::DimensionMismatch {
                    expected: store.dim(),
                    actual: face.embedding.dim(),
                });
            }

            let result = if gallery.is_empty() {
                MatchResult::unknown(f32::INFINITY)
            } else {
                self.matcher.best_match(&face.embedding, gallery, self.threshold)
            };

            detections.push(Detection {
                face_box: face.face_box.scaled_xy(fx, fy),
                embedding: face.embedding,
                label: result.label,
                distance: result.distance,
            });
        }

        tracing::debug!(
            faces = detections.len(),
            known = detections.iter().filter(|d| !d.is_unknown()).count(),
            scale = self.scale,
            "frame annotated"
        );

        Ok(detections)
    }
}

/// Resize `frame` by `scale`: area averaging when shrinking, bilinear when
/// enlarging, untouched at 1.0.
pub fn resample(frame: &RgbImage, scale: f32) -> Cow<'_, RgbImage> {
    let (w, h) = frame.dimensions();
    let new_w = scaled_dim(w, scale);
    let new_h = scaled_dim(h, scale);

    if (new_w, new_h) == (w, h) {
        return Cow::Borrowed(frame);
    }

    if (new_w as u64) * (new_h as u64) < (w as u64) * (h as u64) {
        Cow::Owned(area_downsample(frame, new_w, new_h))
    } else {
        Cow::Owned(imageops::resize(frame, new_w, new_h, FilterType::Triangle))
    }
}

fn scaled_dim(dim: u32, scale: f32) -> u32 {
    ((dim as f32 * scale).round() as u32).max(1)
}

/// Per-destination-index list of (source index, weight) covering the
/// source interval that maps onto it. Weights sum to 1.
fn area_weights(src: u32, dst: u32) -> Vec<Vec<(u32, f32)>> {
    let ratio = src as f32 / dst as f32;
    (0..dst)
        .map(|d| {
            let start = d as f32 * ratio;
            let end = (start + ratio).min(src as f32);
            let mut weights = Vec::new();
            let mut s = start.floor() as u32;
            while (s as f32) < end && s < src {
                let cover = end.min(s as f32 + 1.0) - start.max(s as f32);
                if cover > 0.0 {
                    weights.push((s, cover));
                }
                s += 1;
            }
            let total: f32 = weights.iter().map(|(_, w)| w).sum();
            if total > 0.0 {
                for (_, w) in weights.iter_mut() {
                    *w /= total;
                }
            }
            weights
        })
        .collect()
}

/// Box-filter downsample: each output pixel is the coverage-weighted mean
/// of the source pixels under it.
fn area_downsample(frame: &RgbImage, new_w: u32, new_h: u32) -> RgbImage {
    let (w, h) = frame.dimensions();
    let xw = area_weights(w, new_w);
    let yw = area_weights(h, new_h);

    let mut out = RgbImage::new(new_w, new_h);
    for (dy, row_weights) in yw.iter().enumerate() {
        for (dx, col_weights) in xw.iter().enumerate() {
            let mut acc = [0.0f32; 3];
            for &(sy, wy) in row_weights {
                for &(sx, wx) in col_weights {
                    let p = frame.get_pixel(sx, sy);
                    let weight = wy * wx;
                    for c in 0..3 {
                        acc[c] += p[c] as f32 * weight;
                    }
                }
            }
            let px = acc.map(|v| v.round().clamp(0.0, 255.0) as u8);
            out.put_pixel(dx as u32, dy as u32, Rgb(px));
        }
    }
    out
}
