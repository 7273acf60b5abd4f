//! Media resolver: classify a submitted path as audio or video and, for
//! video, extract the audio stream before the pipeline runs.
//!
//! Extraction shells out to ffmpeg with `-vn -acodec copy`, which remuxes the
//! audio stream without re-encoding and writes a sibling `.aac` file next to
//! the source. A failed extraction removes any partial output so no corrupt
//! zero-byte file is left behind.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{error, info};

/// Extensions accepted as audio payloads as-is (case-insensitive).
const AUDIO_EXTENSIONS: &[&str] = &["wav", "mp3", "aac", "m4a", "flac", "ogg", "wma", "amr"];

/// Extensions routed through audio extraction first (case-insensitive).
const VIDEO_EXTENSIONS: &[&str] = &["flv", "mp4", "mkv", "mov", "avi", "ts", "webm", "wmv"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("input file not found: {0}")]
    NotFound(String),

    #[error("unsupported media extension: {0}")]
    UnsupportedExtension(String),

    #[error("audio extraction failed: {0}")]
    ExtractionFailed(String),
}

/// Classify by extension alone; content sniffing is out of scope.
pub fn classify(path: &Path) -> Option<MediaKind> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaKind::Audio)
    } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaKind::Video)
    } else {
        None
    }
}

/// True when the path would be accepted by [`resolve_audio_path`].
pub fn is_supported(path: &Path) -> bool {
    classify(path).is_some()
}

/// Normalize a submitted media path to an audio-only path.
///
/// Audio inputs are returned unchanged; video inputs go through ffmpeg audio
/// extraction and the derived `.aac` path is returned. Errors here fail only
/// this item, never a whole batch.
pub async fn resolve_audio_path(ffmpeg: &str, path: &Path) -> Result<PathBuf, MediaError> {
    if !path.exists() {
        return Err(MediaError::NotFound(path.display().to_string()));
    }
    match classify(path) {
        Some(MediaKind::Audio) => Ok(path.to_path_buf()),
        Some(MediaKind::Video) => extract_audio(ffmpeg, path).await,
        None => Err(MediaError::UnsupportedExtension(path.display().to_string())),
    }
}

/// Extract the audio stream of `video_path` into a sibling `.aac` file.
///
/// The subprocess blocks, so it runs inside `spawn_blocking`.
async fn extract_audio(ffmpeg: &str, video_path: &Path) -> Result<PathBuf, MediaError> {
    let output_path = video_path.with_extension("aac");
    let ffmpeg = ffmpeg.to_owned();
    let input = video_path.to_path_buf();
    let output = output_path.clone();

    let result = tokio::task::spawn_blocking(move || run_ffmpeg_extract(&ffmpeg, &input, &output))
        .await
        .map_err(|e| MediaError::ExtractionFailed(format!("extraction task panicked: {e}")))?;

    match result {
        Ok(()) => {
            info!(source = %video_path.display(), output = %output_path.display(), "audio extracted");
            Ok(output_path)
        }
        Err(msg) => {
            // Remove a possibly partial output file.
            std::fs::remove_file(&output_path).ok();
            error!(source = %video_path.display(), error = %msg, "audio extraction failed");
            Err(MediaError::ExtractionFailed(msg))
        }
    }
}

fn run_ffmpeg_extract(ffmpeg: &str, input: &Path, output: &Path) -> Result<(), String> {
    let cmd_output = std::process::Command::new(ffmpeg)
        .arg("-y")
        .arg("-i")
        .arg(input)
        .arg("-vn")
        .arg("-acodec")
        .arg("copy")
        .arg(output)
        .output()
        .map_err(|e| format!("ffmpeg spawn failed: {e}"))?;

    if !cmd_output.status.success() {
        let stderr = String::from_utf8_lossy(&cmd_output.stderr);
        return Err(format!(
            "ffmpeg exited with {}: {stderr}",
            cmd_output.status
        ));
    }
    if !output.exists() {
        return Err("ffmpeg produced no output file".to_owned());
    }
    Ok(())
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classifies_audio_extensions_case_insensitively() {
        assert_eq!(classify(Path::new("/a/take.WAV")), Some(MediaKind::Audio));
        assert_eq!(classify(Path::new("/a/take.mp3")), Some(MediaKind::Audio));
        assert_eq!(classify(Path::new("rec.FLAC")), Some(MediaKind::Audio));
    }

    #[test]
    fn classifies_video_extensions() {
        assert_eq!(classify(Path::new("/v/live.flv")), Some(MediaKind::Video));
        assert_eq!(classify(Path::new("/v/live.MKV")), Some(MediaKind::Video));
    }

    #[test]
    fn rejects_unknown_and_missing_extensions() {
        assert_eq!(classify(Path::new("/v/notes.txt")), None);
        assert_eq!(classify(Path::new("/v/no_extension")), None);
        assert!(!is_supported(Path::new("/v/archive.zip")));
    }

    #[tokio::test]
    async fn missing_file_is_a_per_item_failure() {
        let err = resolve_audio_path("ffmpeg", Path::new("/nonexistent/clip.wav"))
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::NotFound(_)));
    }

    #[tokio::test]
    async fn audio_input_passes_through_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("clip.wav");
        std::fs::write(&audio, b"RIFF").unwrap();
        let resolved = resolve_audio_path("ffmpeg", &audio).await.unwrap();
        assert_eq!(resolved, audio);
    }

    #[tokio::test]
    async fn failed_extraction_leaves_no_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("broken.flv");
        std::fs::write(&video, b"not a real container").unwrap();
        // `false` exits non-zero regardless of arguments, standing in for a
        // failing ffmpeg binary.
        let err = resolve_audio_path("false", &video).await.unwrap_err();
        assert!(matches!(err, MediaError::ExtractionFailed(_)));
        assert!(!video.with_extension("aac").exists());
    }
}
