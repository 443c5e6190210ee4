//! Media extractor tests against a scripted stand-in for the media tool

#![cfg(unix)]

mod helpers;

use helpers::media_fixtures::{FakeMediaTool, FakeTool};
use lectern_engine::services::media_extractor::{ExtractError, MediaExtractor, AUDIO_FILE_NAME};
use serial_test::serial;
use std::path::Path;

fn video(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("lecture.mp4");
    std::fs::write(&path, b"not really a video").unwrap();
    path
}

#[tokio::test]
#[serial]
async fn test_hardware_failure_falls_back_to_software() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeMediaTool::create(dir.path(), FakeTool::default(), 3, 2.0);
    let out = dir.path().join("out");

    let media = MediaExtractor::new(&fake.tool)
        .extract(&video(dir.path()), &out)
        .await
        .unwrap();

    assert!(!media.hw_accelerated);
    assert_eq!(media.frames.len(), 3);
    assert!(media.frames.iter().all(|f| f.starts_with(&out)));
    assert_eq!(media.audio, out.join(AUDIO_FILE_NAME));
    assert!(media.audio.exists());
    assert_eq!(fake.calls(), vec!["hw-fail", "sw"]);
}

#[tokio::test]
#[serial]
async fn test_hardware_path_used_when_it_works() {
    let dir = tempfile::tempdir().unwrap();
    let behavior = FakeTool {
        hw_fails: false,
        ..Default::default()
    };
    let fake = FakeMediaTool::create(dir.path(), behavior, 4, 1.0);

    let media = MediaExtractor::new(&fake.tool)
        .extract(&video(dir.path()), &dir.path().join("out"))
        .await
        .unwrap();

    assert!(media.hw_accelerated);
    assert_eq!(media.frames.len(), 4);
    assert_eq!(fake.calls(), vec!["hw"]);
}

#[tokio::test]
#[serial]
async fn test_no_accelerator_goes_straight_to_software() {
    let dir = tempfile::tempdir().unwrap();
    let behavior = FakeTool {
        cuda: false,
        ..Default::default()
    };
    let fake = FakeMediaTool::create(dir.path(), behavior, 2, 1.0);
    let extractor = MediaExtractor::new(&fake.tool);

    assert!(!extractor.hw_accel_available().await);
    let media = extractor
        .extract(&video(dir.path()), &dir.path().join("out"))
        .await
        .unwrap();
    assert!(!media.hw_accelerated);
    assert_eq!(fake.calls(), vec!["sw"]);
}

#[tokio::test]
#[serial]
async fn test_hw_accel_disabled_skips_hardware_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeMediaTool::create(dir.path(), FakeTool::default(), 2, 1.0);

    MediaExtractor::new(&fake.tool)
        .with_hw_accel(false)
        .extract(&video(dir.path()), &dir.path().join("out"))
        .await
        .unwrap();
    assert_eq!(fake.calls(), vec!["sw"]);
}

#[tokio::test]
#[serial]
async fn test_both_paths_failing_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let behavior = FakeTool {
        sw_fails: true,
        ..Default::default()
    };
    let fake = FakeMediaTool::create(dir.path(), behavior, 2, 1.0);

    let err = MediaExtractor::new(&fake.tool)
        .extract(&video(dir.path()), &dir.path().join("out"))
        .await
        .unwrap_err();
    match err {
        ExtractError::HardwareAndSoftwareFailed { hardware, software } => {
            assert!(hardware.contains("device init failed"), "{}", hardware);
            assert!(software.contains("decode error"), "{}", software);
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
#[serial]
async fn test_audio_failure_reported() {
    let dir = tempfile::tempdir().unwrap();
    let behavior = FakeTool {
        audio_fails: true,
        ..Default::default()
    };
    let fake = FakeMediaTool::create(dir.path(), behavior, 2, 1.0);

    let err = MediaExtractor::new(&fake.tool)
        .extract(&video(dir.path()), &dir.path().join("out"))
        .await
        .unwrap_err();
    assert!(matches!(err, ExtractError::AudioFailed(_)));
}

#[tokio::test]
#[serial]
async fn test_output_dir_is_emptied_first() {
    let dir = tempfile::tempdir().unwrap();
    let behavior = FakeTool {
        hw_fails: false,
        ..Default::default()
    };
    let fake = FakeMediaTool::create(dir.path(), behavior, 2, 1.0);
    let out = dir.path().join("out");
    std::fs::create_dir_all(&out).unwrap();
    std::fs::write(out.join("frame_0099.jpg"), b"stale").unwrap();

    let media = MediaExtractor::new(&fake.tool)
        .extract(&video(dir.path()), &out)
        .await
        .unwrap();
    assert_eq!(media.frames.len(), 2);
}

#[tokio::test]
#[serial]
async fn test_partial_hardware_frames_discarded_before_software() {
    let dir = tempfile::tempdir().unwrap();
    let behavior = FakeTool {
        hw_partial: true,
        ..Default::default()
    };
    let fake = FakeMediaTool::create(dir.path(), behavior, 3, 1.0);
    let out = dir.path().join("out");

    let media = MediaExtractor::new(&fake.tool)
        .extract(&video(dir.path()), &out)
        .await
        .unwrap();

    assert_eq!(fake.calls(), vec!["hw-fail", "sw"]);
    assert_eq!(media.frames.len(), 3);
    assert!(!out.join("frame_0500.jpg").exists());
}

#[tokio::test]
async fn test_missing_video_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let err = MediaExtractor::new("ffmpeg")
        .extract(&dir.path().join("absent.mp4"), &dir.path().join("out"))
        .await
        .unwrap_err();
    assert!(matches!(err, ExtractError::InputMissing(_)));
}

#[tokio::test]
async fn test_missing_tool_reported() {
    let dir = tempfile::tempdir().unwrap();
    let err = MediaExtractor::new(dir.path().join("no-such-tool"))
        .extract(&video(dir.path()), &dir.path().join("out"))
        .await
        .unwrap_err();
    assert!(matches!(err, ExtractError::ToolNotFound(_)), "{}", err);
}
