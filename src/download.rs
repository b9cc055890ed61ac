//! Fetching published payloads and their signatures from the update repository.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Error};
use log::{debug, info, warn};
use reqwest::{blocking::Response, StatusCode};

use neuralupgrade_api::{
    constants::{
        ESP_FILENAME_FORMAT_DEFAULT, LATEST_VERSION, OS_FILENAME_FORMAT_DEFAULT,
    },
    error::{NeuralupgradeError, ReportError, ServicingError},
    Metadata,
};
use osutils::arch::SystemArchitecture;

use crate::{
    metadata::{self, SignatureSource},
    minisign::{self, SignatureVerifier},
};

pub const GET_TIMEOUT_SECS: u64 = 600;

/// The two kinds of published payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum UpdateType {
    /// OS tarball for the A/B partitions
    Os,

    /// ESP tarball with extra EFI programs
    Esp,
}

impl UpdateType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Os => "os",
            Self::Esp => "esp",
        }
    }
}

/// Where payloads are published, and how they are named.
#[derive(Debug, Clone)]
pub struct Repository {
    pub url: String,

    /// File name of an OS tarball, with `{architecture}` and `{version}` placeholders.
    pub os_filename_format: String,

    pub esp_filename_format: String,
    pub architecture: SystemArchitecture,

    /// Additional attempts after a failed GET.
    pub max_retries: u8,
}

impl Repository {
    pub fn new(url: impl Into<String>, architecture: SystemArchitecture) -> Self {
        Self {
            url: url.into(),
            os_filename_format: OS_FILENAME_FORMAT_DEFAULT.into(),
            esp_filename_format: ESP_FILENAME_FORMAT_DEFAULT.into(),
            architecture,
            max_retries: 2,
        }
    }

    /// Published file name of the `kind` payload at `version`.
    pub fn filename(&self, kind: UpdateType, version: &str) -> String {
        let format = match kind {
            UpdateType::Os => &self.os_filename_format,
            UpdateType::Esp => &self.esp_filename_format,
        };
        format
            .replace("{architecture}", self.architecture.name())
            .replace("{version}", version)
    }

    fn url_of(&self, filename: &str) -> String {
        format!("{}/{filename}", self.url.trim_end_matches('/'))
    }

    /// Contents of the signature of the `kind` payload at `version`.
    fn fetch_signature(
        &self,
        kind: UpdateType,
        version: &str,
    ) -> Result<String, NeuralupgradeError> {
        let filename = minisign::signature_path(self.filename(kind, version));
        let url = self.url_of(&filename.to_string_lossy());
        get(&url, self.max_retries)
            .and_then(|response| response.text().context("Failed to read response body"))
            .structured(ServicingError::Download { url })
    }

    /// Trusted comment of the signature published for `version`.
    pub fn metadata(
        &self,
        kind: UpdateType,
        version: &str,
    ) -> Result<Metadata, NeuralupgradeError> {
        let signature = self.fetch_signature(kind, version)?;
        metadata::parse_trusted_comment(SignatureSource::Contents(&signature))
            .map_err(NeuralupgradeError::new)
    }

    /// Turns `latest` into the concrete version it currently points to.
    pub fn resolve_version(
        &self,
        kind: UpdateType,
        version: &str,
    ) -> Result<String, NeuralupgradeError> {
        if version != LATEST_VERSION {
            return Ok(version.into());
        }
        let mut metadata = self.metadata(kind, version)?;
        let resolved = metadata.remove("version").structured(ServicingError::Download {
            url: self.url_of(&self.filename(kind, version)),
        })?;
        debug!("Latest {} version is '{resolved}'", kind.name());
        Ok(resolved)
    }

    /// Downloads the signature and then the payload into `directory`, then verifies the payload
    /// unless `verify` is false. Returns the payload path.
    pub fn download(
        &self,
        kind: UpdateType,
        version: &str,
        directory: &Path,
        verify: bool,
        pubkey: Option<&Path>,
        verifier: &dyn SignatureVerifier,
    ) -> Result<PathBuf, NeuralupgradeError> {
        let signature = self.fetch_signature(kind, version)?;

        // The `latest` signature names the versioned tarball it was made for
        let filename = if version == LATEST_VERSION {
            metadata::parse_trusted_comment(SignatureSource::Contents(&signature))
                .map_err(NeuralupgradeError::new)?
                .remove("filename")
                .structured(ServicingError::Download {
                    url: self.url_of(&self.filename(kind, version)),
                })?
        } else {
            self.filename(kind, version)
        };

        let tarball = directory.join(&filename);
        let signature_file = minisign::signature_path(&tarball);
        fs::write(&signature_file, &signature).structured(ServicingError::Download {
            url: signature_file.display().to_string(),
        })?;

        let url = self.url_of(&filename);
        info!("Downloading '{url}' to '{}'", tarball.display());
        fetch_to(&url, &tarball, self.max_retries)
            .structured(ServicingError::Download { url })?;

        if verify {
            verifier.verify(&tarball, pubkey)?;
        } else {
            warn!("Not verifying '{}'", tarball.display());
        }
        Ok(tarball)
    }
}

/// GET with retries and exponential backoff, returning only 200 responses.
fn get(url: &str, max_retries: u8) -> Result<Response, Error> {
    let client = reqwest::blocking::ClientBuilder::new()
        .timeout(Duration::from_secs(GET_TIMEOUT_SECS))
        .build()
        .context("Failed to create HTTP client")?;

    let mut attempt = 0u8;
    loop {
        debug!("GET {url}");
        let err = match client.get(url).send().context("Failed to GET") {
            Ok(response) if response.status() == StatusCode::OK => return Ok(response),
            Ok(response) => anyhow::anyhow!("Failed to GET with status {}", response.status()),
            Err(e) => e,
        };

        if attempt >= max_retries {
            return Err(err).context(format!(
                "Failed to GET '{url}' after {} attempts",
                u16::from(attempt) + 1
            ));
        }
        attempt += 1;

        // 0.5s, 1s, 2s, ... capped at 16s
        let backoff = Duration::from_millis(500 << (attempt - 1).min(5));
        warn!(
            "Failed to GET '{url}': {err}. Retrying in {:.1} seconds",
            backoff.as_secs_f32()
        );
        std::thread::sleep(backoff);
    }
}

/// Streams `url` into `destination` through a temporary file in the same directory.
fn fetch_to(url: &str, destination: &Path, max_retries: u8) -> Result<(), Error> {
    let directory = destination
        .parent()
        .context("Destination has no parent directory")?;
    let mut response = get(url, max_retries)?;
    let mut file = tempfile::NamedTempFile::new_in(directory).with_context(|| {
        format!("Failed to create temporary file in '{}'", directory.display())
    })?;
    response
        .copy_to(file.as_file_mut())
        .context("Failed to read response body")?;
    file.persist(destination)
        .with_context(|| format!("Failed to move download to '{}'", destination.display()))?;
    Ok(())
}
