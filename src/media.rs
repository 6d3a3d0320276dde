//! Media staging: copy chat attachments into agent worktrees, with optional
//! ffmpeg/whisper processing that degrades to a plain copy.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

const FFMPEG_TIMEOUT: Duration = Duration::from_secs(60);
const WHISPER_TIMEOUT: Duration = Duration::from_secs(300);

/// Images larger than this on either axis are resized before staging.
const MAX_IMAGE_DIMENSION: u32 = 4000;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp", "tiff"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "webm", "avi", "mkv"];
const AUDIO_EXTENSIONS: &[&str] = &["ogg", "mp3", "wav", "m4a", "flac", "opus"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Image,
    Video,
    Audio,
    Document,
}

/// Detect media type from the file extension; anything unknown is a document.
pub fn detect_type(path: &str) -> MediaType {
    let extension = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    if IMAGE_EXTENSIONS.contains(&extension.as_str()) {
        MediaType::Image
    } else if VIDEO_EXTENSIONS.contains(&extension.as_str()) {
        MediaType::Video
    } else if AUDIO_EXTENSIONS.contains(&extension.as_str()) {
        MediaType::Audio
    } else {
        MediaType::Document
    }
}

pub struct MediaStager {
    temp_dir: PathBuf,
}

impl Default for MediaStager {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join("agent-forge-media"))
    }
}

impl MediaStager {
    pub fn new(temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            temp_dir: temp_dir.into(),
        }
    }

    /// Process a media file and stage it into the worktree's `.media/`.
    ///
    /// Returns worktree-relative paths plus the detected type. Optional
    /// processing (image resize, keyframe extraction, transcription) falls
    /// back to a plain copy when the external tool is missing or fails.
    pub async fn process_and_stage(
        &self,
        source_path: &str,
        worktree: &str,
    ) -> std::io::Result<(Vec<String>, MediaType)> {
        let media_type = detect_type(source_path);
        let media_dir = Path::new(worktree).join(".media");
        tokio::fs::create_dir_all(&media_dir).await?;
        tokio::fs::create_dir_all(&self.temp_dir).await?;

        let timestamp = chrono::Utc::now().timestamp();
        let source = Path::new(source_path);
        let source_name = source
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("attachment");
        let mut staged: Vec<String> = Vec::new();

        match media_type {
            MediaType::Image => {
                let resized = self.resize_image_if_needed(source_path).await;
                let dest_name = format!("{timestamp}_{source_name}");
                tokio::fs::copy(&resized, media_dir.join(&dest_name)).await?;
                staged.push(format!(".media/{dest_name}"));
            }
            MediaType::Video => {
                let dest_name = format!("{timestamp}_{source_name}");
                tokio::fs::copy(source_path, media_dir.join(&dest_name)).await?;
                staged.push(format!(".media/{dest_name}"));

                let frame_dir = self.temp_dir.join(format!("frames_{timestamp}"));
                if tokio::fs::create_dir_all(&frame_dir).await.is_ok() {
                    for frame in self.extract_video_frames(source_path, &frame_dir).await {
                        let frame_name = frame
                            .file_name()
                            .and_then(|n| n.to_str())
                            .unwrap_or("frame.png");
                        let dest_name = format!("{timestamp}_{frame_name}");
                        if tokio::fs::copy(&frame, media_dir.join(&dest_name)).await.is_ok() {
                            staged.push(format!(".media/{dest_name}"));
                        }
                    }
                }
            }
            MediaType::Audio => {
                if let Some(transcript) = self.transcribe_audio(source_path).await {
                    let transcript_name = format!("{timestamp}_transcript.txt");
                    if tokio::fs::write(media_dir.join(&transcript_name), transcript)
                        .await
                        .is_ok()
                    {
                        staged.push(format!(".media/{transcript_name}"));
                    }
                }
                let dest_name = format!("{timestamp}_{source_name}");
                tokio::fs::copy(source_path, media_dir.join(&dest_name)).await?;
                staged.push(format!(".media/{dest_name}"));
            }
            MediaType::Document => {
                let dest_name = format!("{timestamp}_{source_name}");
                tokio::fs::copy(source_path, media_dir.join(&dest_name)).await?;
                staged.push(format!(".media/{dest_name}"));
            }
        }

        Ok((staged, media_type))
    }

    /// Resize oversized images via ffmpeg. Returns the original path when
    /// the image is small enough or any step fails.
    async fn resize_image_if_needed(&self, image_path: &str) -> String {
        let Some((width, height)) = probe_dimensions(image_path).await else {
            return image_path.to_string();
        };
        if width <= MAX_IMAGE_DIMENSION && height <= MAX_IMAGE_DIMENSION {
            return image_path.to_string();
        }

        let name = Path::new(image_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("image");
        let output_path = self.temp_dir.join(format!("resized_{name}"));
        let scale = format!(
            "scale='if(gt(iw,ih),{MAX_IMAGE_DIMENSION},-2):if(gt(ih,iw),{MAX_IMAGE_DIMENSION},-2)'"
        );

        let result = run_tool(
            "ffmpeg",
            &[
                "-i",
                image_path,
                "-vf",
                &scale,
                "-y",
                &output_path.display().to_string(),
            ],
            FFMPEG_TIMEOUT,
        )
        .await;

        if result && output_path.exists() {
            output_path.display().to_string()
        } else {
            image_path.to_string()
        }
    }

    /// Extract up to 10 keyframes (one per second for short clips).
    async fn extract_video_frames(&self, video_path: &str, output_dir: &Path) -> Vec<PathBuf> {
        let pattern = output_dir.join("frame_%03d.png").display().to_string();
        let duration = probe_duration(video_path).await;

        let filter = if duration.is_some_and(|d| d < 10.0) {
            "fps=1".to_string()
        } else {
            "select='eq(pict_type,I)'".to_string()
        };
        let mut args = vec!["-i", video_path, "-vf", &filter];
        if filter.starts_with("select") {
            args.extend(["-vsync", "vfr"]);
        }
        args.extend(["-frames:v", "10", &pattern]);

        if !run_tool("ffmpeg", &args, FFMPEG_TIMEOUT).await {
            return Vec::new();
        }

        let mut frames: Vec<PathBuf> = std::fs::read_dir(output_dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| {
                        p.file_name()
                            .and_then(|n| n.to_str())
                            .is_some_and(|n| n.starts_with("frame_"))
                    })
                    .collect()
            })
            .unwrap_or_default();
        frames.sort();
        frames
    }

    /// Transcribe via whisper when installed; `None` skips transcription.
    async fn transcribe_audio(&self, audio_path: &str) -> Option<String> {
        let output_dir = self.temp_dir.display().to_string();
        if !run_tool(
            "whisper",
            &[
                audio_path,
                "--model",
                "base",
                "--output_format",
                "txt",
                "--output_dir",
                &output_dir,
            ],
            WHISPER_TIMEOUT,
        )
        .await
        {
            return None;
        }

        let stem = Path::new(audio_path).file_stem()?.to_str()?;
        let transcript_path = self.temp_dir.join(format!("{stem}.txt"));
        tokio::fs::read_to_string(&transcript_path)
            .await
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }
}

/// Build a short sentence pointing the agent at the staged files.
pub fn build_media_reference(staged_paths: &[String], media_type: MediaType) -> String {
    if staged_paths.is_empty() {
        return String::new();
    }
    let joined = staged_paths.join(", ");

    match media_type {
        MediaType::Image => {
            format!("I've placed design mockups/images at: {joined}. Please analyze them.")
        }
        MediaType::Video => {
            let (videos, frames): (Vec<&String>, Vec<&String>) =
                staged_paths.iter().partition(|p| {
                    Path::new(p.as_str())
                        .extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| VIDEO_EXTENSIONS.contains(&e.to_lowercase().as_str()))
                });
            let mut parts = Vec::new();
            if !videos.is_empty() {
                parts.push(format!(
                    "Video file at: {}",
                    videos.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
                ));
            }
            if !frames.is_empty() {
                parts.push(format!(
                    "Extracted keyframes at: {}",
                    frames.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
                ));
            }
            format!("{}.", parts.join(". "))
        }
        MediaType::Audio => {
            let (transcripts, audio): (Vec<&String>, Vec<&String>) =
                staged_paths.iter().partition(|p| p.contains("transcript"));
            let mut parts = Vec::new();
            if !transcripts.is_empty() {
                parts.push(format!(
                    "Voice message transcript is at: {}",
                    transcripts.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
                ));
            }
            if !audio.is_empty() {
                parts.push(format!(
                    "Original audio file at: {}",
                    audio.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
                ));
            }
            parts.join(". ")
        }
        MediaType::Document => {
            format!("I've placed the document(s) at: {joined}. Please review.")
        }
    }
}

async fn run_tool(program: &str, args: &[&str], timeout: Duration) -> bool {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    match tokio::time::timeout(timeout, cmd.status()).await {
        Ok(Ok(status)) => status.success(),
        Ok(Err(_)) => {
            tracing::debug!(%program, "tool not available");
            false
        }
        Err(_) => {
            tracing::warn!(%program, "tool timed out");
            false
        }
    }
}

async fn probe_dimensions(image_path: &str) -> Option<(u32, u32)> {
    let output = tokio::time::timeout(
        FFMPEG_TIMEOUT,
        Command::new("ffprobe")
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=width,height",
                "-of",
                "csv=p=0",
                image_path,
            ])
            .output(),
    )
    .await
    .ok()?
    .ok()?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut parts = stdout.trim().split(',');
    let width = parts.next()?.trim().parse().ok()?;
    let height = parts.next()?.trim().parse().ok()?;
    Some((width, height))
}

async fn probe_duration(video_path: &str) -> Option<f64> {
    let output = tokio::time::timeout(
        FFMPEG_TIMEOUT,
        Command::new("ffprobe")
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
                video_path,
            ])
            .output(),
    )
    .await
    .ok()?
    .ok()?;

    String::from_utf8_lossy(&output.stdout).trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_types_by_extension() {
        assert_eq!(detect_type("shot.PNG"), MediaType::Image);
        assert_eq!(detect_type("clip.mp4"), MediaType::Video);
        assert_eq!(detect_type("note.ogg"), MediaType::Audio);
        assert_eq!(detect_type("report.pdf"), MediaType::Document);
        assert_eq!(detect_type("no_extension"), MediaType::Document);
    }

    #[test]
    fn image_reference_mentions_paths() {
        let reference =
            build_media_reference(&[".media/1_shot.png".to_string()], MediaType::Image);
        assert!(reference.contains(".media/1_shot.png"));
        assert!(reference.contains("analyze"));
        assert_eq!(build_media_reference(&[], MediaType::Image), "");
    }

    #[test]
    fn video_reference_separates_frames() {
        let reference = build_media_reference(
            &[
                ".media/1_clip.mp4".to_string(),
                ".media/1_frame_001.png".to_string(),
            ],
            MediaType::Video,
        );
        assert!(reference.contains("Video file at: .media/1_clip.mp4"));
        assert!(reference.contains("keyframes at: .media/1_frame_001.png"));
    }

    #[test]
    fn audio_reference_separates_transcript() {
        let reference = build_media_reference(
            &[
                ".media/1_transcript.txt".to_string(),
                ".media/1_note.ogg".to_string(),
            ],
            MediaType::Audio,
        );
        assert!(reference.contains("transcript is at: .media/1_transcript.txt"));
        assert!(reference.contains("audio file at: .media/1_note.ogg"));
    }

    #[tokio::test]
    async fn staging_copies_document_into_worktree() {
        let dir = tempfile::tempdir().unwrap();
        let worktree = dir.path().join("wt");
        std::fs::create_dir_all(&worktree).unwrap();
        let source = dir.path().join("spec.pdf");
        std::fs::write(&source, b"pdf bytes").unwrap();

        let stager = MediaStager::new(dir.path().join("tmp"));
        let (staged, media_type) = stager
            .process_and_stage(&source.display().to_string(), &worktree.display().to_string())
            .await
            .unwrap();

        assert_eq!(media_type, MediaType::Document);
        assert_eq!(staged.len(), 1);
        assert!(staged[0].starts_with(".media/"));
        assert!(staged[0].ends_with("_spec.pdf"));
        assert!(worktree.join(&staged[0]).exists());
    }
}
