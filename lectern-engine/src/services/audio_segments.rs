//! Audio prosody analysis
//!
//! Decodes the extracted mono track, computes a whole-track summary, and
//! analyzes fixed-width contiguous windows in parallel on a small thread
//! pool. A window whose analysis fails or panics becomes a conservative
//! placeholder (zero energy, silent, monotone) so the timeline stays
//! contiguous.

use crate::error::panic_message;
use crate::models::{sort_segments, AudioSegmentRecord, AudioSummary};
use rayon::prelude::*;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;
use tracing::{debug, warn};

/// Windows shorter than this (the trailing fragment) are not emitted
pub const MIN_SEGMENT_SECONDS: f64 = 1.0;
/// Span of the track used for the overall pitch statistic
const SUMMARY_PITCH_SECONDS: f64 = 60.0;
/// Relative level (dB below track peak) treated as silence in the summary
const SUMMARY_SILENCE_TOP_DB: f32 = 20.0;
/// Overall monotone threshold (Hz of pitch std)
const SUMMARY_MONOTONE_STD_HZ: f64 = 20.0;

/// RMS frame length and hop in samples
const FRAME_LEN: usize = 1024;
const HOP_LEN: usize = 512;
const MIN_PITCH_HZ: f64 = 50.0;
const MAX_PITCH_HZ: f64 = 300.0;
/// Normalized autocorrelation above which a frame counts as voiced
const VOICING_THRESHOLD: f64 = 0.6;

#[derive(Debug, Clone, Error)]
pub enum AudioError {
    #[error("Cannot open audio: {0}")]
    Open(String),

    #[error("Audio decode failed: {0}")]
    Decode(String),

    #[error("Audio track is empty")]
    Empty,

    #[error("Segment analysis failed: {0}")]
    Segment(String),

    #[error("Thread pool error: {0}")]
    Pool(String),
}

/// Mono PCM samples
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn duration_seconds(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate.max(1) as f64
    }
}

/// Decode an audio file to mono f32, averaging channels
pub fn decode_mono(path: &Path) -> Result<DecodedAudio, AudioError> {
    let file = std::fs::File::open(path).map_err(|e| AudioError::Open(format!("{}: {}", path.display(), e)))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| AudioError::Decode(format!("probe {}: {}", path.display(), e)))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| AudioError::Decode("no audio track".to_string()))?;
    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| AudioError::Decode("unknown sample rate".to_string()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| AudioError::Decode(e.to_string()))?;

    let mut samples = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(AudioError::Decode(e.to_string())),
        };
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                debug!("Skipping corrupt audio packet: {}", e);
                continue;
            }
            Err(e) => return Err(AudioError::Decode(e.to_string())),
        };

        let spec = *decoded.spec();
        let channels = spec.channels.count().max(1);
        let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buf.copy_interleaved_ref(decoded);
        samples.extend(
            buf.samples()
                .chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32),
        );
    }

    if samples.is_empty() {
        return Err(AudioError::Empty);
    }
    Ok(DecodedAudio { samples, sample_rate })
}

/// Prosody measurements of one window
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentMetrics {
    pub energy: f64,
    pub pitch: f64,
    pub pitch_variance: f64,
    pub is_silent: bool,
    pub is_monotone: bool,
}

/// Per-window analysis capability
pub trait SegmentProbe: Send + Sync {
    fn analyze(&self, samples: &[f32], sample_rate: u32, start_time: f64) -> Result<SegmentMetrics, AudioError>;
}

/// RMS energy, relative-level silence and autocorrelation pitch
#[derive(Debug, Clone)]
pub struct ProsodyProbe {
    /// dB below the window peak treated as silence
    pub silence_top_db: f32,
    /// Window is silent when less than this fraction is speech
    pub min_speech_ratio: f64,
    /// Pitch std (Hz) below which a voiced window is monotone
    pub monotone_std_hz: f64,
}

impl Default for ProsodyProbe {
    fn default() -> Self {
        Self {
            silence_top_db: 25.0,
            min_speech_ratio: 0.3,
            monotone_std_hz: 15.0,
        }
    }
}

impl SegmentProbe for ProsodyProbe {
    fn analyze(&self, samples: &[f32], sample_rate: u32, _start_time: f64) -> Result<SegmentMetrics, AudioError> {
        if samples.is_empty() {
            return Err(AudioError::Segment("empty window".to_string()));
        }
        if samples.iter().any(|s| !s.is_finite()) {
            return Err(AudioError::Segment("non-finite samples".to_string()));
        }

        let rms = frame_rms(samples);
        let energy = mean(&rms);
        let speech_ratio = voiced_fraction(&rms, self.silence_top_db);
        let pitches = pitch_track(samples, sample_rate, &rms, self.silence_top_db);
        let (pitch, pitch_std) = mean_std(&pitches);

        Ok(SegmentMetrics {
            energy,
            pitch,
            pitch_variance: pitch_std,
            is_silent: speech_ratio < self.min_speech_ratio,
            is_monotone: !pitches.is_empty() && pitch_std < self.monotone_std_hz,
        })
    }
}

/// Whole-track summary plus per-window timeline
#[derive(Debug, Clone)]
pub struct AudioAnalysis {
    pub summary: AudioSummary,
    /// Sorted by start time, contiguous
    pub segments: Vec<AudioSegmentRecord>,
}

/// Parallel per-window analyzer
pub struct AudioSegmentAnalyzer {
    segment_seconds: f64,
    probe: Arc<dyn SegmentProbe>,
    pool: Arc<rayon::ThreadPool>,
}

/// Segment pool size: half the cores, at least two
pub fn segment_worker_count() -> usize {
    (num_cpus::get() / 2).max(2)
}

impl AudioSegmentAnalyzer {
    pub fn new(segment_seconds: f64) -> Result<Self, AudioError> {
        Self::with_probe(segment_seconds, Arc::new(ProsodyProbe::default()))
    }

    pub fn with_probe(segment_seconds: f64, probe: Arc<dyn SegmentProbe>) -> Result<Self, AudioError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(segment_worker_count())
            .thread_name(|i| format!("lectern-audio-{}", i))
            .build()
            .map_err(|e| AudioError::Pool(e.to_string()))?;
        Ok(Self {
            segment_seconds: segment_seconds.max(MIN_SEGMENT_SECONDS),
            probe,
            pool: Arc::new(pool),
        })
    }

    pub fn segment_seconds(&self) -> f64 {
        self.segment_seconds
    }

    /// Decode and analyze a track (blocking)
    pub fn analyze_file(&self, path: &Path) -> Result<AudioAnalysis, AudioError> {
        let audio = decode_mono(path)?;
        debug!(
            path = %path.display(),
            sample_rate = audio.sample_rate,
            duration_s = audio.duration_seconds(),
            "Audio decoded"
        );
        Ok(self.analyze(&audio))
    }

    /// Analyze decoded samples (blocking)
    pub fn analyze(&self, audio: &DecodedAudio) -> AudioAnalysis {
        let windows = segment_windows(audio.samples.len(), audio.sample_rate, self.segment_seconds);
        let sr = audio.sample_rate;
        let probe = self.probe.as_ref();

        let mut segments: Vec<AudioSegmentRecord> = self.pool.install(|| {
            windows
                .par_iter()
                .map(|&(start, end)| {
                    let start_time = start as f64 / sr as f64;
                    let end_time = end as f64 / sr as f64;
                    let samples = &audio.samples[start..end];
                    let outcome = catch_unwind(AssertUnwindSafe(|| probe.analyze(samples, sr, start_time)))
                        .unwrap_or_else(|payload| {
                            Err(AudioError::Segment(format!(
                                "probe panicked: {}",
                                panic_message(payload.as_ref())
                            )))
                        });
                    match outcome {
                        Ok(m) => AudioSegmentRecord {
                            start_time,
                            end_time,
                            energy: m.energy,
                            pitch: m.pitch,
                            pitch_variance: m.pitch_variance,
                            is_silent: m.is_silent,
                            is_monotone: m.is_monotone,
                            placeholder: false,
                        },
                        Err(e) => {
                            warn!(start_time, end_time, "Audio segment placeholder: {}", e);
                            AudioSegmentRecord::placeholder(start_time, end_time)
                        }
                    }
                })
                .collect()
        });
        sort_segments(&mut segments);

        let summary = summarize(audio, segments.len());
        AudioAnalysis { summary, segments }
    }
}

/// Contiguous `[start, end)` sample ranges of `segment_seconds` each;
/// a trailing fragment shorter than one second is dropped
pub fn segment_windows(total_samples: usize, sample_rate: u32, segment_seconds: f64) -> Vec<(usize, usize)> {
    let sr = sample_rate.max(1) as f64;
    let width = ((segment_seconds * sr) as usize).max(1);
    let min_len = (MIN_SEGMENT_SECONDS * sr) as usize;
    (0..total_samples)
        .step_by(width)
        .map(|start| (start, (start + width).min(total_samples)))
        .filter(|(start, end)| end - start >= min_len)
        .collect()
}

fn summarize(audio: &DecodedAudio, segment_count: usize) -> AudioSummary {
    let rms = frame_rms(&audio.samples);
    let head_len = ((SUMMARY_PITCH_SECONDS * audio.sample_rate as f64) as usize).min(audio.samples.len());
    let head = &audio.samples[..head_len];
    let head_rms = frame_rms(head);
    let pitches = pitch_track(head, audio.sample_rate, &head_rms, SUMMARY_SILENCE_TOP_DB);
    let (_, pitch_std) = mean_std(&pitches);

    AudioSummary {
        duration_seconds: audio.duration_seconds(),
        silence_ratio: 1.0 - voiced_fraction(&rms, SUMMARY_SILENCE_TOP_DB),
        energy_mean: mean(&rms),
        pitch_std,
        is_monotone: !pitches.is_empty() && pitch_std < SUMMARY_MONOTONE_STD_HZ,
        segment_count,
    }
}

/// RMS of each analysis frame; a short input yields one frame
fn frame_rms(samples: &[f32]) -> Vec<f64> {
    if samples.is_empty() {
        return Vec::new();
    }
    if samples.len() <= FRAME_LEN {
        return vec![rms(samples)];
    }
    (0..=samples.len() - FRAME_LEN)
        .step_by(HOP_LEN)
        .map(|start| rms(&samples[start..start + FRAME_LEN]))
        .collect()
}

fn rms(frame: &[f32]) -> f64 {
    let sum: f64 = frame.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / frame.len().max(1) as f64).sqrt()
}

/// Fraction of frames within `top_db` of the loudest frame
fn voiced_fraction(rms: &[f64], top_db: f32) -> f64 {
    let peak = rms.iter().cloned().fold(0.0f64, f64::max);
    if rms.is_empty() || peak <= f64::EPSILON {
        return 0.0;
    }
    let floor = peak * 10f64.powf(-(top_db as f64) / 20.0);
    rms.iter().filter(|&&r| r >= floor).count() as f64 / rms.len() as f64
}

/// Pitch (Hz) of each non-silent, voiced frame
fn pitch_track(samples: &[f32], sample_rate: u32, rms: &[f64], top_db: f32) -> Vec<f64> {
    let sr = sample_rate as f64;
    let min_lag = (sr / MAX_PITCH_HZ).floor() as usize;
    let max_lag = (sr / MIN_PITCH_HZ).ceil() as usize;
    let window = 2 * max_lag;
    if min_lag < 2 || samples.len() < window {
        return Vec::new();
    }

    let peak = rms.iter().cloned().fold(0.0f64, f64::max);
    if peak <= f64::EPSILON {
        return Vec::new();
    }
    let floor = peak * 10f64.powf(-(top_db as f64) / 20.0);

    rms.iter()
        .enumerate()
        .filter(|(_, &r)| r >= floor)
        .filter_map(|(i, _)| {
            let start = i * HOP_LEN;
            let frame = samples.get(start..start + window)?;
            autocorrelation_pitch(frame, sr, min_lag, max_lag)
        })
        .collect()
}

/// First strong local maximum of the normalized autocorrelation
fn autocorrelation_pitch(frame: &[f32], sr: f64, min_lag: usize, max_lag: usize) -> Option<f64> {
    let corr: Vec<f64> = (min_lag - 1..=max_lag + 1)
        .map(|lag| {
            let n = frame.len() - lag;
            let (mut xy, mut xx, mut yy) = (0.0f64, 0.0f64, 0.0f64);
            for i in 0..n {
                let x = frame[i] as f64;
                let y = frame[i + lag] as f64;
                xy += x * y;
                xx += x * x;
                yy += y * y;
            }
            let denom = (xx * yy).sqrt();
            if denom > 0.0 {
                xy / denom
            } else {
                0.0
            }
        })
        .collect();

    let best = corr[1..corr.len() - 1].iter().cloned().fold(f64::MIN, f64::max);
    if best < VOICING_THRESHOLD {
        return None;
    }
    (1..corr.len() - 1)
        .find(|&k| corr[k] >= corr[k - 1] && corr[k] >= corr[k + 1] && corr[k] >= 0.9 * best)
        .map(|k| sr / (min_lag - 1 + k) as f64)
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64;
    (m, var.sqrt())
}
