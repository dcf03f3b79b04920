//! Resolve a YouTube or Google Drive URL to a local video file.

use crate::config::{remove_if_exists, FetchSettings};
use crate::error::{DashboardError, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Highest-resolution progressive MP4 (audio and video in one stream).
const YOUTUBE_FORMAT: &str = "best[ext=mp4][vcodec!=none][acodec!=none]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoSource {
    YouTube,
    Drive,
}

pub fn unsupported_url() -> DashboardError {
    DashboardError::Input(
        "Unsupported URL. Please enter a YouTube or Google Drive URL.".to_string(),
    )
}

pub fn classify(url: &str) -> Result<VideoSource> {
    if url.contains("youtube.com") || url.contains("youtu.be") {
        Ok(VideoSource::YouTube)
    } else if url.contains("drive.google.com") {
        Ok(VideoSource::Drive)
    } else {
        Err(unsupported_url())
    }
}

/// Drive file id from `/file/d/<id>/...`, `/d/<id>` or `?id=<id>` links.
pub fn drive_file_id(url: &str) -> Option<&str> {
    let is_id_char = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    let take_id = |rest: &str| -> Option<usize> {
        let end = rest.find(|c: char| !is_id_char(c)).unwrap_or(rest.len());
        (end > 0).then_some(end)
    };

    if let Some(pos) = url.find("/d/") {
        let rest = &url[pos + 3..];
        if let Some(end) = take_id(rest) {
            return Some(&rest[..end]);
        }
    }
    for marker in ["?id=", "&id="] {
        if let Some(pos) = url.find(marker) {
            let rest = &url[pos + marker.len()..];
            if let Some(end) = take_id(rest) {
                return Some(&rest[..end]);
            }
        }
    }
    None
}

pub struct Fetcher {
    settings: FetchSettings,
}

impl Fetcher {
    pub fn new(settings: FetchSettings) -> Self {
        Self { settings }
    }

    /// Download `url` to `dest`, replacing whatever was there.
    pub fn download(&self, url: &str, dest: &Path) -> Result<PathBuf> {
        let source = classify(url)?;
        remove_if_exists(dest)?;

        let mut cmd = match source {
            VideoSource::YouTube => {
                let mut cmd = Command::new(&self.settings.yt_dlp);
                cmd.arg("--no-playlist")
                    .arg("--quiet")
                    .arg("-f")
                    .arg(YOUTUBE_FORMAT)
                    .arg("-o")
                    .arg(dest)
                    .arg(url);
                cmd
            }
            VideoSource::Drive => {
                let mut cmd = Command::new(&self.settings.gdown);
                match drive_file_id(url) {
                    Some(id) => cmd.arg(id),
                    None => cmd.arg("--fuzzy").arg(url),
                };
                cmd.arg("-O").arg(dest);
                cmd
            }
        };

        tracing::info!(?source, url, "downloading video");
        let output = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| {
                DashboardError::Input(format!("Failed to start downloader for {url}: {e}"))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!(status = %output.status, stderr = %stderr.trim(), "downloader failed");
            return Err(DashboardError::Input(format!(
                "Failed to download video from URL: {url}"
            )));
        }
        if !dest.is_file() {
            return Err(DashboardError::Input(format!(
                "Failed to download video from URL: {url}"
            )));
        }
        Ok(dest.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn classifies_supported_hosts() {
        assert_eq!(
            classify("https://www.youtube.com/watch?v=abc").unwrap(),
            VideoSource::YouTube
        );
        assert_eq!(classify("https://youtu.be/abc").unwrap(), VideoSource::YouTube);
        assert_eq!(
            classify("https://drive.google.com/file/d/XYZ/view").unwrap(),
            VideoSource::Drive
        );
    }

    #[test]
    fn unsupported_url_message() {
        let err = classify("http://example.com/x.mp4").unwrap_err();
        assert!(err.to_string().contains("Unsupported URL"));
    }

    #[test]
    fn extracts_drive_ids() {
        assert_eq!(
            drive_file_id("https://drive.google.com/file/d/1AbC-d_9/view?usp=sharing"),
            Some("1AbC-d_9")
        );
        assert_eq!(
            drive_file_id("https://drive.google.com/open?id=QQQ123"),
            Some("QQQ123")
        );
        assert_eq!(
            drive_file_id("https://drive.google.com/uc?export=download&id=zz"),
            Some("zz")
        );
        assert_eq!(drive_file_id("https://drive.google.com/drive/folders"), None);
    }

    #[test]
    fn unsupported_url_creates_no_file() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("input_video.mp4");
        let fetcher = Fetcher::new(FetchSettings::default());
        let err = fetcher.download("http://example.com/x.mp4", &dest).unwrap_err();
        assert!(err.to_string().contains("Unsupported URL"));
        assert!(!dest.exists());
    }

    #[test]
    fn failing_downloader_is_an_input_error() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("input_video.mp4");
        std::fs::write(&dest, b"stale").unwrap();
        let fetcher = Fetcher::new(FetchSettings {
            yt_dlp: dir.path().join("missing-yt-dlp"),
            gdown: dir.path().join("missing-gdown"),
        });
        let err = fetcher.download("https://youtu.be/abc", &dest).unwrap_err();
        assert!(matches!(err, DashboardError::Input(_)));
        assert!(!dest.exists(), "stale input is removed before downloading");
    }
}
