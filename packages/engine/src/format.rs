use std::path::Path;
use std::str::FromStr;

use tokio::io::AsyncReadExt;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaFormat {
    Png,
    Jpeg,
    Gif,
    WebP,
    Mp4,
    Mov,
}

impl MediaFormat {
    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Png | Self::Jpeg | Self::Gif | Self::WebP => MediaKind::Image,
            Self::Mp4 | Self::Mov => MediaKind::Video,
        }
    }

    /// Get file extensions associated with this format
    pub fn extensions(&self) -> &[&str] {
        match self {
            Self::Png => &["png"],
            Self::Jpeg => &["jpg", "jpeg"],
            Self::Gif => &["gif"],
            Self::WebP => &["webp"],
            Self::Mp4 => &["mp4", "m4v"],
            Self::Mov => &["mov"],
        }
    }

    /// Get the primary extension for this format
    pub fn primary_extension(&self) -> &str {
        self.extensions()[0]
    }

    /// Identify a format from the first bytes of a file.
    pub fn sniff(header: &[u8]) -> Option<Self> {
        if header.starts_with(b"\x89PNG\r\n\x1a\n") {
            Some(Self::Png)
        } else if header.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(Self::Jpeg)
        } else if header.starts_with(b"GIF87a") || header.starts_with(b"GIF89a") {
            Some(Self::Gif)
        } else if header.len() >= 12 && &header[0..4] == b"RIFF" && &header[8..12] == b"WEBP" {
            Some(Self::WebP)
        } else if header.len() >= 12 && &header[4..8] == b"ftyp" {
            if &header[8..10] == b"qt" {
                Some(Self::Mov)
            } else {
                Some(Self::Mp4)
            }
        } else {
            None
        }
    }
}

impl FromStr for MediaFormat {
    type Err = EngineError;

    fn from_str(ext: &str) -> Result<Self, Self::Err> {
        let ext = ext.trim_start_matches('.').to_lowercase();
        match ext.as_str() {
            "png" => Ok(Self::Png),
            "jpg" | "jpeg" => Ok(Self::Jpeg),
            "gif" => Ok(Self::Gif),
            "webp" => Ok(Self::WebP),
            "mp4" | "m4v" => Ok(Self::Mp4),
            "mov" => Ok(Self::Mov),
            _ => Err(EngineError::unsupported(format!(
                "unsupported file type: {}",
                ext
            ))),
        }
    }
}

/// Detect the format of a file from its magic bytes, falling back to the
/// extension.
pub async fn detect_format(path: &Path) -> EngineResult<MediaFormat> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| EngineError::io("opening input", e))?;
    let mut header = [0u8; 16];
    let mut filled = 0;
    while filled < header.len() {
        let n = file
            .read(&mut header[filled..])
            .await
            .map_err(|e| EngineError::io("reading input header", e))?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    if let Some(format) = MediaFormat::sniff(&header[..filled]) {
        return Ok(format);
    }

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| {
            EngineError::unsupported(format!("unrecognised content in {}", path.display()))
        })?;
    MediaFormat::from_str(ext)
}
