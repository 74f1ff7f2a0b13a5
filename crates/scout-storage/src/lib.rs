//! Storage and transport plumbing: HTTP fetcher, token cache, CAPTCHA repositories, analysis
//! history and the challenge image archive.

mod captcha_repo;
mod history;
mod http;
mod tokens;

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

pub use captcha_repo::{
    CaptchaRepository, MemoryCaptchaRepository, OutcomeWrite, SqliteCaptchaRepository,
};
pub use history::{AnalysisHistory, AnalysisRecord, MemoryAnalysisHistory};
pub use http::{
    cookie_pairs, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, HttpMethod,
    HttpRequest, HttpTransport, PacingConfig, ReconnectPolicy, RequestBody,
};
pub use reqwest::StatusCode;
pub use tokens::{MemoryTokenStore, TokenStore};

pub const CRATE_NAME: &str = "scout-storage";

/// Container format of a challenge image, read from its leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Png,
    Jpeg,
    Webp,
    Gif,
    Unknown,
}

impl ImageKind {
    pub fn sniff(bytes: &[u8]) -> Self {
        match bytes {
            [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n', ..] => Self::Png,
            [0xFF, 0xD8, 0xFF, ..] => Self::Jpeg,
            [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Self::Webp,
            [b'G', b'I', b'F', b'8', ..] => Self::Gif,
            _ => Self::Unknown,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::Webp => "webp",
            Self::Gif => "gif",
            Self::Unknown => "bin",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedImage {
    pub sha256: String,
    pub kind: ImageKind,
    /// `<namespace>/<sha256>.<extension>`, relative to the archive root.
    pub relative_path: PathBuf,
    /// The file was already there, usually because the same picture came from another URL.
    pub deduplicated: bool,
}

/// Keeps CAPTCHA images for later annotation, one file per distinct picture.
#[derive(Debug, Clone)]
pub struct ImageArchive {
    root: PathBuf,
}

impl ImageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn path_of(&self, image: &ArchivedImage) -> PathBuf {
        self.root.join(&image.relative_path)
    }

    /// Writes the image under `namespace` unless an identical one is already archived.
    ///
    /// The bytes land in a private `.part` file first and are hard-linked into place, so a
    /// reader never sees a partial image and concurrent writers of the same picture keep
    /// the first copy.
    pub async fn store(&self, namespace: &str, bytes: &[u8]) -> anyhow::Result<ArchivedImage> {
        let sha256 = Self::sha256_hex(bytes);
        let kind = ImageKind::sniff(bytes);
        let dir = self.root.join(namespace);
        let relative_path = PathBuf::from(namespace).join(format!("{sha256}.{}", kind.extension()));
        let target = self.root.join(&relative_path);
        let image = |deduplicated| ArchivedImage {
            sha256: sha256.clone(),
            kind,
            relative_path: relative_path.clone(),
            deduplicated,
        };

        if fs::try_exists(&target).await.unwrap_or(false) {
            return Ok(image(true));
        }
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let part = dir.join(format!(".{sha256}.{}.part", Uuid::new_v4().simple()));
        fs::write(&part, bytes)
            .await
            .with_context(|| format!("writing {}", part.display()))?;
        let linked = fs::hard_link(&part, &target).await;
        let _ = fs::remove_file(&part).await;
        match linked {
            Ok(()) => Ok(image(false)),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(image(true)),
            Err(err) => Err(err).with_context(|| format!("archiving {}", target.display())),
        }
    }
}
