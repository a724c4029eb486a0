//! Turning build artifacts into launchable images.
//!
//! Local images wrap the executable directly. Enclave images are staged into
//! a private root filesystem with a single-process entrypoint and handed to
//! the measurement tool. Packaging is all-or-nothing: the staging directory
//! is owned by the returned image and removed on any failure.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use crate::capability::Platform;
use crate::command::CommandTemplate;
use crate::error::RunnerError;

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";

/// Output of the build collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildArtifact {
    pub binary_path: PathBuf,
    pub target_triple: String,
}

impl BuildArtifact {
    /// File name of the binary, used to name staged files and images.
    pub fn name(&self) -> String {
        self.binary_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "guest".to_string())
    }
}

/// Launchable image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageHandle {
    /// Directly executable binary (Local platform).
    Executable { path: PathBuf, digest: String },
    /// Measured enclave image file (Enclave platform).
    Eif {
        path: PathBuf,
        digest: String,
        measurements: BTreeMap<String, String>,
    },
}

impl ImageHandle {
    pub fn path(&self) -> &Path {
        match self {
            ImageHandle::Executable { path, .. } | ImageHandle::Eif { path, .. } => path,
        }
    }

    /// SHA-256 of the image contents, hex encoded.
    pub fn digest(&self) -> &str {
        match self {
            ImageHandle::Executable { digest, .. } | ImageHandle::Eif { digest, .. } => digest,
        }
    }
}

/// An image ready for exactly one launch. Dropping it removes staged files.
#[derive(Debug)]
pub struct EnclaveImage {
    handle: ImageHandle,
    source: BuildArtifact,
    _staging: Option<TempDir>,
}

impl EnclaveImage {
    pub fn handle(&self) -> &ImageHandle {
        &self.handle
    }

    pub fn source_artifact(&self) -> &BuildArtifact {
        &self.source
    }

    /// Wrap an existing executable without staging.
    pub fn executable(artifact: BuildArtifact, digest: String) -> Self {
        Self {
            handle: ImageHandle::Executable {
                path: artifact.binary_path.clone(),
                digest,
            },
            source: artifact,
            _staging: None,
        }
    }
}

/// Root filesystem prepared for measurement.
#[derive(Debug, Clone)]
pub struct StagedRootfs {
    pub root: PathBuf,
    pub name: String,
    pub entrypoint: String,
}

/// Image-measurement collaborator.
#[async_trait]
pub trait Measurer: Send + Sync {
    /// Produce an image at `output` from `staged`, returning any measurements
    /// the tool reported.
    async fn measure(
        &self,
        staged: &StagedRootfs,
        output: &Path,
    ) -> Result<BTreeMap<String, String>, RunnerError>;
}

/// Measurer driven by an external command template.
pub struct CommandMeasurer {
    template: CommandTemplate,
}

impl CommandMeasurer {
    pub fn new(template: CommandTemplate) -> Self {
        Self { template }
    }
}

#[derive(Deserialize)]
struct MeasureReport {
    #[serde(rename = "Measurements", default)]
    measurements: BTreeMap<String, String>,
}

#[async_trait]
impl Measurer for CommandMeasurer {
    async fn measure(
        &self,
        staged: &StagedRootfs,
        output: &Path,
    ) -> Result<BTreeMap<String, String>, RunnerError> {
        let root = staged.root.to_string_lossy();
        let out = output.to_string_lossy();
        let result = self
            .template
            .output(&[
                ("rootfs", root.as_ref()),
                ("output", out.as_ref()),
                ("name", staged.name.as_str()),
            ])
            .await
            .map_err(|e| RunnerError::PackagingError(format!("{}: {}", self.template, e)))?;

        if !result.success {
            return Err(RunnerError::PackagingError(format!(
                "`{}` exited with {:?}: {}",
                self.template,
                result.code,
                result.stderr_tail()
            )));
        }

        Ok(serde_json::from_str::<MeasureReport>(result.stdout.trim())
            .map(|r| r.measurements)
            .unwrap_or_default())
    }
}

/// Packages build artifacts for a platform.
pub struct ImageLoader {
    expected_target: String,
    measurer: Arc<dyn Measurer>,
}

impl ImageLoader {
    pub fn new(expected_target: impl Into<String>, measurer: Arc<dyn Measurer>) -> Self {
        Self {
            expected_target: expected_target.into(),
            measurer,
        }
    }

    /// Validate `artifact` and produce a fresh image for `platform`.
    pub async fn package(
        &self,
        artifact: &BuildArtifact,
        platform: Platform,
    ) -> Result<EnclaveImage, RunnerError> {
        self.validate(artifact).await?;
        match platform {
            Platform::Local => {
                let digest = file_digest(&artifact.binary_path).await?;
                tracing::debug!(path = %artifact.binary_path.display(), %digest, "local image ready");
                Ok(EnclaveImage::executable(artifact.clone(), digest))
            }
            Platform::Enclave => self.package_enclave(artifact).await,
        }
    }

    async fn validate(&self, artifact: &BuildArtifact) -> Result<(), RunnerError> {
        if artifact.target_triple != self.expected_target {
            return Err(RunnerError::PackagingError(format!(
                "artifact built for `{}`, expected `{}`",
                artifact.target_triple, self.expected_target
            )));
        }
        let meta = tokio::fs::metadata(&artifact.binary_path)
            .await
            .map_err(staging_error(&artifact.binary_path))?;
        if !meta.is_file() {
            return Err(RunnerError::PackagingError(format!(
                "{} is not a regular file",
                artifact.binary_path.display()
            )));
        }
        Ok(())
    }

    async fn package_enclave(&self, artifact: &BuildArtifact) -> Result<EnclaveImage, RunnerError> {
        let bytes = tokio::fs::read(&artifact.binary_path)
            .await
            .map_err(staging_error(&artifact.binary_path))?;
        if !bytes.starts_with(ELF_MAGIC) {
            return Err(RunnerError::PackagingError(format!(
                "{} is not an ELF executable",
                artifact.binary_path.display()
            )));
        }

        let staging = tempfile::Builder::new()
            .prefix("vme-image-")
            .tempdir()
            .map_err(|e| RunnerError::PackagingError(format!("staging directory: {}", e)))?;
        let name = artifact.name();
        let staged = stage_rootfs(staging.path(), &name, &bytes).await?;

        let output = staging.path().join(format!("{}.eif", name));
        let measurements = self.measurer.measure(&staged, &output).await?;

        let image_bytes = tokio::fs::read(&output).await.map_err(|e| {
            RunnerError::PackagingError(format!(
                "measurement produced no image at {}: {}",
                output.display(),
                e
            ))
        })?;
        let digest = hex::encode(Sha256::digest(&image_bytes));
        tracing::info!(image = %output.display(), %digest, "enclave image measured");

        Ok(EnclaveImage {
            handle: ImageHandle::Eif {
                path: output,
                digest,
                measurements,
            },
            source: artifact.clone(),
            _staging: Some(staging),
        })
    }
}

/// Lay out `<dir>/rootfs/<name>` and a single-process entrypoint descriptor.
async fn stage_rootfs(dir: &Path, name: &str, binary: &[u8]) -> Result<StagedRootfs, RunnerError> {
    let root = dir.join("rootfs");
    tokio::fs::create_dir_all(&root)
        .await
        .map_err(staging_error(&root))?;

    let target = root.join(name);
    tokio::fs::write(&target, binary)
        .await
        .map_err(staging_error(&target))?;
    set_executable(&target).await?;

    let entrypoint = format!("/{}", name);
    let descriptor = format!(
        "FROM scratch\nCOPY {name} {entry}\nCMD [\"{entry}\"]\n",
        name = name,
        entry = entrypoint
    );
    let descriptor_path = root.join("Dockerfile");
    tokio::fs::write(&descriptor_path, descriptor)
        .await
        .map_err(staging_error(&descriptor_path))?;

    Ok(StagedRootfs {
        root,
        name: name.to_string(),
        entrypoint,
    })
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> Result<(), RunnerError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(staging_error(path))
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> Result<(), RunnerError> {
    Ok(())
}

async fn file_digest(path: &Path) -> Result<String, RunnerError> {
    let bytes = tokio::fs::read(path).await.map_err(staging_error(path))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

fn staging_error(path: &Path) -> impl FnOnce(std::io::Error) -> RunnerError + '_ {
    move |e| RunnerError::PackagingError(format!("{}: {}", path.display(), e))
}
