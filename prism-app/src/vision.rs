//! Camera frames handed to the answer service.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};

/// One encoded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// Something that can produce the current camera frame on demand.
pub trait FrameSource: Send + Sync + 'static {
    fn capture(&self) -> anyhow::Result<Frame>;

    fn describe(&self) -> String;
}

/// Serves an image file as the camera. The file is re-read on every capture
/// so replacing it on disk changes what the assistant sees.
pub struct StillImageSource {
    path: PathBuf,
    mime_type: &'static str,
}

impl StillImageSource {
    pub fn new(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let mime_type = mime_for(&path)
            .with_context(|| format!("unsupported image type: {}", path.display()))?;
        if !path.is_file() {
            bail!("image not found: {}", path.display());
        }
        Ok(Self { path, mime_type })
    }
}

impl FrameSource for StillImageSource {
    fn capture(&self) -> anyhow::Result<Frame> {
        let bytes = std::fs::read(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        if bytes.is_empty() {
            bail!("image is empty: {}", self.path.display());
        }
        Ok(Frame {
            bytes,
            mime_type: self.mime_type.to_string(),
        })
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

fn mime_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        "heic" => Some("image/heic"),
        "heif" => Some("image/heif"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_follows_extension() {
        assert_eq!(mime_for(Path::new("a/b.JPG")), Some("image/jpeg"));
        assert_eq!(mime_for(Path::new("shot.png")), Some("image/png"));
        assert_eq!(mime_for(Path::new("notes.txt")), None);
        assert_eq!(mime_for(Path::new("noext")), None);
    }

    #[test]
    fn still_image_reads_file_bytes() {
        let path = std::env::temp_dir().join(format!("prism-frame-{}.png", std::process::id()));
        std::fs::write(&path, [0x89, b'P', b'N', b'G']).unwrap();

        let source = StillImageSource::new(&path).unwrap();
        let frame = source.capture().unwrap();
        assert_eq!(frame.mime_type, "image/png");
        assert_eq!(frame.bytes.len(), 4);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn missing_or_unsupported_files_are_rejected() {
        assert!(StillImageSource::new("/definitely/not/here.jpg").is_err());
        assert!(StillImageSource::new("frame.bmp").is_err());
    }
}
