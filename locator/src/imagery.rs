use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

use crate::projection::CropSpec;
use crate::site_store::SiteKey;

const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G'];
const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF];
const SITE_IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "b64"];

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("Malformed image data URL: {0}")]
    InvalidDataUrl(String),
    #[error("Image payload is not valid base64")]
    Decode(#[from] base64::DecodeError),
    #[error("Crop capture failed: {0}")]
    Capture(String),
    #[error("No image for site {0}")]
    Missing(SiteKey),
    #[error("Failed to read image {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type ImageResult<T> = std::result::Result<T, ImageError>;

/// Encoded crop image, sent to the segmentation service as a data URL.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct ImagePayload {
    bytes: Vec<u8>,
}

impl ImagePayload {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Accepts `data:<mime>;base64,<data>` or bare base64.
    pub fn from_data_url(data_url: &str) -> ImageResult<Self> {
        let encoded = match data_url.strip_prefix("data:") {
            Some(rest) => {
                let (header, encoded) = rest
                    .split_once(',')
                    .ok_or_else(|| ImageError::InvalidDataUrl("missing ','".to_string()))?;
                if !header.ends_with(";base64") {
                    return Err(ImageError::InvalidDataUrl(format!(
                        "unsupported encoding in header '{header}'"
                    )));
                }
                encoded
            }
            None => data_url,
        };

        Ok(Self::from_bytes(STANDARD.decode(encoded.trim())?))
    }

    /// Reads raw image bytes, or a data URL when the file starts with `data:`.
    pub async fn read_file(path: impl AsRef<Path>) -> ImageResult<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await.map_err(|source| ImageError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        if bytes.starts_with(b"data:") {
            let text = String::from_utf8_lossy(&bytes);
            return Self::from_data_url(text.trim());
        }
        Ok(Self::from_bytes(bytes))
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime_type(&self) -> &'static str {
        if self.bytes.starts_with(PNG_MAGIC) {
            "image/png"
        } else if self.bytes.starts_with(JPEG_MAGIC) {
            "image/jpeg"
        } else {
            // unknown formats are labeled png, like canvas captures
            "image/png"
        }
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type(), STANDARD.encode(&self.bytes))
    }
}

impl Debug for ImagePayload {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImagePayload")
            .field("mime", &self.mime_type())
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Produces a fresh crop image for a moved anchor.
#[async_trait]
pub trait CropImager: Debug + Send + Sync {
    async fn capture(&self, crop: &CropSpec) -> ImageResult<ImagePayload>;
}

/// Supplies the crop image for a site when many sites are refined at once.
#[async_trait]
pub trait SiteImageSource: Debug + Send + Sync {
    async fn image_for(&self, site: &SiteKey, crop: &CropSpec) -> ImageResult<ImagePayload>;
}

/// Pre-captured crops stored as `<dir>/<site key>.<png|jpg|jpeg|b64>`.
#[derive(Debug, Clone)]
pub struct DirectoryImages {
    dir: PathBuf,
}

impl DirectoryImages {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl SiteImageSource for DirectoryImages {
    async fn image_for(&self, site: &SiteKey, _crop: &CropSpec) -> ImageResult<ImagePayload> {
        for extension in SITE_IMAGE_EXTENSIONS {
            let path = self.dir.join(format!("{site}.{extension}"));
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return ImagePayload::read_file(&path).await;
            }
        }
        Err(ImageError::Missing(site.clone()))
    }
}

#[cfg(test)]
mod tests {
    use crate::projection::GeoPoint;

    use super::*;

    #[test]
    fn data_url_round_trip_keeps_bytes() -> anyhow::Result<()> {
        let jpeg = ImagePayload::from_bytes(vec![0xFF, 0xD8, 0xFF, 0xE0, 1, 2, 3]);
        let url = jpeg.to_data_url();
        assert!(url.starts_with("data:image/jpeg;base64,"));
        assert_eq!(ImagePayload::from_data_url(&url)?, jpeg);

        let png = ImagePayload::from_bytes(vec![0x89, b'P', b'N', b'G', 0, 0]);
        assert!(png.to_data_url().starts_with("data:image/png;base64,"));
        Ok(())
    }

    #[test]
    fn bare_base64_is_accepted() -> anyhow::Result<()> {
        let payload = ImagePayload::from_data_url("AQID")?;
        assert_eq!(payload.as_bytes(), &[1, 2, 3]);
        Ok(())
    }

    #[test]
    fn malformed_data_urls_are_rejected() {
        assert!(matches!(
            ImagePayload::from_data_url("data:image/png;base64"),
            Err(ImageError::InvalidDataUrl(_))
        ));
        assert!(matches!(
            ImagePayload::from_data_url("data:text/plain,hello"),
            Err(ImageError::InvalidDataUrl(_))
        ));
        assert!(matches!(
            ImagePayload::from_data_url("data:image/png;base64,***"),
            Err(ImageError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn directory_images_by_site_key() -> anyhow::Result<()> {
        let dir = std::env::temp_dir().join(format!("locator-images-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await?;
        let png = ImagePayload::from_bytes(vec![0x89, b'P', b'N', b'G', 7, 7]);
        tokio::fs::write(dir.join("DL001381285.png"), png.as_bytes()).await?;
        tokio::fs::write(dir.join("DJ001380375.b64"), png.to_data_url()).await?;

        let images = DirectoryImages::new(&dir);
        let crop = CropSpec::new(GeoPoint::new(42.0, 13.0), 18, 300);

        assert_eq!(images.image_for(&"DL001381285".into(), &crop).await?, png);
        assert_eq!(images.image_for(&"DJ001380375".into(), &crop).await?, png);
        assert!(matches!(
            images.image_for(&"missing".into(), &crop).await,
            Err(ImageError::Missing(key)) if key.as_str() == "missing"
        ));

        tokio::fs::remove_dir_all(&dir).await?;
        Ok(())
    }
}
