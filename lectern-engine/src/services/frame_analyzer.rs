//! Frame analyzer contract and the built-in luma analyzer
//!
//! A `FrameAnalyzerFactory` is invoked once per chunk job; the analyzer it
//! returns is reused for every frame in that chunk, so expensive setup
//! (model loading, buffers) is paid once per chunk rather than per frame.

use crate::models::{ContentMetrics, VisionMetrics};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Per-frame failure; the frame is skipped and recorded, never fatal
#[derive(Debug, Clone, Error)]
pub enum FrameError {
    #[error("Cannot decode {}: {message}", path.display())]
    Decode { path: PathBuf, message: String },

    #[error("Analysis failed: {0}")]
    Analysis(String),

    /// Analyzer could not be constructed for a chunk
    #[error("Analyzer initialization failed: {0}")]
    Init(String),
}

/// Measurements for one frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameAnalysis {
    pub vision: VisionMetrics,
    pub content: ContentMetrics,
}

/// Stateful per-chunk analyzer
pub trait FrameAnalyzer: Send {
    fn analyze(&mut self, frame: &Path) -> Result<FrameAnalysis, FrameError>;
}

/// Builds one analyzer per chunk job
pub trait FrameAnalyzerFactory: Send + Sync {
    fn name(&self) -> &str;

    fn create(&self) -> Result<Box<dyn FrameAnalyzer>, FrameError>;
}

/// Edge magnitude (0–255 luma units) counted as an edge pixel
const EDGE_THRESHOLD: i32 = 48;
/// Luma above which a pixel counts as background-bright
const BRIGHT_LUMA: u8 = 200;

/// Luma statistics analyzer backed by the `image` crate
///
/// Brightness and contrast feed vision metrics; edge density and a slide
/// heuristic feed content metrics.
#[derive(Debug, Default)]
pub struct LumaFrameAnalyzer;

impl FrameAnalyzer for LumaFrameAnalyzer {
    fn analyze(&mut self, frame: &Path) -> Result<FrameAnalysis, FrameError> {
        let img = image::open(frame)
            .map_err(|e| FrameError::Decode {
                path: frame.to_path_buf(),
                message: e.to_string(),
            })?
            .to_luma8();

        let (w, h) = img.dimensions();
        if w == 0 || h == 0 {
            return Err(FrameError::Analysis("empty image".to_string()));
        }
        let pixels = img.as_raw();
        let n = pixels.len() as f64;

        let mean = pixels.iter().map(|&p| p as f64).sum::<f64>() / n;
        let variance = pixels
            .iter()
            .map(|&p| {
                let d = p as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n;
        let bright_fraction = pixels.iter().filter(|&&p| p >= BRIGHT_LUMA).count() as f64 / n;

        let (w, h) = (w as usize, h as usize);
        let mut edges = 0usize;
        let mut sampled = 0usize;
        for y in 0..h.saturating_sub(1) {
            let row = y * w;
            for x in 0..w.saturating_sub(1) {
                let p = pixels[row + x] as i32;
                let gx = (pixels[row + x + 1] as i32 - p).abs();
                let gy = (pixels[row + w + x] as i32 - p).abs();
                if gx + gy > EDGE_THRESHOLD {
                    edges += 1;
                }
                sampled += 1;
            }
        }
        let edge_density = if sampled > 0 {
            edges as f64 / sampled as f64
        } else {
            0.0
        };

        let brightness = mean / 255.0;
        let is_slide = brightness > 0.55 && bright_fraction > 0.5 && (0.005..0.25).contains(&edge_density);

        let mut vision_extra = serde_json::Map::new();
        vision_extra.insert("bright_fraction".into(), bright_fraction.into());

        Ok(FrameAnalysis {
            vision: VisionMetrics {
                brightness,
                contrast: variance.sqrt() / 255.0,
                extra: vision_extra,
            },
            content: ContentMetrics {
                edge_density,
                is_slide,
                extra: serde_json::Map::new(),
            },
        })
    }
}

/// Factory for `LumaFrameAnalyzer`
#[derive(Debug, Default, Clone, Copy)]
pub struct LumaAnalyzerFactory;

impl FrameAnalyzerFactory for LumaAnalyzerFactory {
    fn name(&self) -> &str {
        "luma"
    }

    fn create(&self) -> Result<Box<dyn FrameAnalyzer>, FrameError> {
        Ok(Box::new(LumaFrameAnalyzer))
    }
}
