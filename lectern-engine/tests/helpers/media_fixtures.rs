//! Synthetic media: JPEG frame sequences, WAV tracks and a stand-in for the
//! external media tool

use image::{GrayImage, Luma};
use std::path::{Path, PathBuf};

pub const SAMPLE_RATE: u32 = 16_000;

/// Write `frame_0001.jpg ..` into `dir`; numbers in `corrupt` get garbage bytes
pub fn write_frames(dir: &Path, count: usize, corrupt: &[usize]) -> Vec<PathBuf> {
    (1..=count)
        .map(|n| {
            let path = dir.join(format!("frame_{:04}.jpg", n));
            if corrupt.contains(&n) {
                std::fs::write(&path, b"definitely not a jpeg").unwrap();
            } else {
                let shade = (n * 7 % 255) as u8;
                GrayImage::from_pixel(32, 18, Luma([shade])).save(&path).unwrap();
            }
            path
        })
        .collect()
}

/// 16-bit WAV at 16 kHz; `sample(t)` yields one value per channel in [-1, 1]
pub fn generate_wav(path: &Path, channels: u16, seconds: f64, sample: impl Fn(f64) -> Vec<f64>) {
    let spec = hound::WavSpec {
        channels,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for i in 0..(seconds * SAMPLE_RATE as f64) as usize {
        for v in sample(i as f64 / SAMPLE_RATE as f64) {
            writer.write_sample((v * i16::MAX as f64) as i16).unwrap();
        }
    }
    writer.finalize().unwrap();
}

pub fn tone(t: f64, freq: f64) -> f64 {
    (2.0 * std::f64::consts::PI * freq * t).sin() * 0.5
}

/// Mono tone track
pub fn tone_wav(path: &Path, seconds: f64, freq: f64) {
    generate_wav(path, 1, seconds, |t| vec![tone(t, freq)]);
}

/// Behavior of the fake media tool
#[derive(Debug, Clone, Copy)]
pub struct FakeTool {
    /// `-hwaccels` lists cuda
    pub cuda: bool,
    /// Frame extraction with `-hwaccel` exits non-zero
    pub hw_fails: bool,
    /// A failing hardware pass leaves a stray `frame_0500.jpg` behind
    pub hw_partial: bool,
    /// Software frame extraction exits non-zero
    pub sw_fails: bool,
    /// Audio extraction exits non-zero
    pub audio_fails: bool,
}

impl Default for FakeTool {
    fn default() -> Self {
        Self {
            cuda: true,
            hw_fails: true,
            hw_partial: false,
            sw_fails: false,
            audio_fails: false,
        }
    }
}

/// Media fixtures plus a shell script that mimics the tool's CLI by copying
/// them into place
#[cfg(unix)]
pub struct FakeMediaTool {
    pub tool: PathBuf,
    pub fixtures: PathBuf,
}

#[cfg(unix)]
impl FakeMediaTool {
    /// `frames` JPEG fixtures and `audio_seconds` of tone under `dir`
    pub fn create(dir: &Path, behavior: FakeTool, frames: usize, audio_seconds: f64) -> Self {
        use std::os::unix::fs::PermissionsExt;

        let fixtures = dir.join("fixtures");
        std::fs::create_dir_all(&fixtures).unwrap();
        write_frames(&fixtures, frames, &[]);
        tone_wav(&fixtures.join("audio.wav"), audio_seconds, 180.0);

        let hwaccels = if behavior.cuda {
            r"printf 'Hardware acceleration methods:\ncuda\n'"
        } else {
            r"printf 'Hardware acceleration methods:\n'"
        };
        let hw = if behavior.hw_fails && behavior.hw_partial {
            r#"echo hw-fail >> "$FIXTURES/calls"; echo partial > "$(dirname "$last")"/frame_0500.jpg; echo "cuda: device lost" >&2; exit 1"#
        } else if behavior.hw_fails {
            r#"echo hw-fail >> "$FIXTURES/calls"; echo "cuda: device init failed" >&2; exit 1"#
        } else {
            r#"echo hw >> "$FIXTURES/calls"; cp "$FIXTURES"/frame_*.jpg "$(dirname "$last")"/; exit 0"#
        };
        let sw = if behavior.sw_fails {
            r#"echo sw-fail >> "$FIXTURES/calls"; echo "decode error" >&2; exit 1"#
        } else {
            r#"echo sw >> "$FIXTURES/calls"; cp "$FIXTURES"/frame_*.jpg "$(dirname "$last")"/; exit 0"#
        };
        let audio = if behavior.audio_fails {
            r#"echo "no audio stream" >&2; exit 1"#
        } else {
            r#"cp "$FIXTURES/audio.wav" "$last"; exit 0"#
        };

        let script = format!(
            r#"#!/bin/sh
FIXTURES='{fixtures}'
last=""
hw=0
for a in "$@"; do
  case "$a" in
    -hwaccels) {hwaccels}; exit 0 ;;
    -hwaccel) hw=1 ;;
  esac
  last="$a"
done
case "$last" in
  *.wav) {audio} ;;
esac
if [ "$hw" = 1 ]; then {hw}; fi
{sw}
"#,
            fixtures = fixtures.display(),
        );

        let tool = dir.join("fake-ffmpeg");
        std::fs::write(&tool, script).unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        Self { tool, fixtures }
    }

    /// Frame-extraction attempts in order (`hw`, `hw-fail`, `sw`, `sw-fail`)
    pub fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.fixtures.join("calls"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }
}
