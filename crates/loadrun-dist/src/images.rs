//! Image builder: make sure every role's image exists (and is pushed when a
//! registry is configured) before anything is launched.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use loadrun_backend::{BuildRequest, ContainerBackend};
use loadrun_core::{ClusterSpec, RoleKind};
use tracing::{debug, info};

use crate::config::BuildOptions;
use crate::error::DistError;

/// Containerfile used when the project ships none.
const DEFAULT_CONTAINERFILE: &str = include_str!("../static/Containerfile");

/// Label key naming the project an image was built for.
const PROJECT_LABEL: &str = "io.loadrun.project";

/// Image reference per role.
pub type ImageSet = BTreeMap<RoleKind, String>;

/// Build file of one image.
///
/// A generated default lives in a temporary directory that is removed when
/// this value is dropped.
#[derive(Debug)]
pub struct BuildFile {
    path: PathBuf,
    scratch: Option<TempDir>,
}

impl BuildFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if the embedded default is used.
    pub fn is_generated(&self) -> bool {
        self.scratch.is_some()
    }
}

/// Pick the build file: `Containerfile`, then `Dockerfile`, else the embedded
/// default written to a fresh temporary directory.
pub fn resolve_containerfile(context: &Path) -> Result<BuildFile, DistError> {
    for candidate in ["Containerfile", "Dockerfile"] {
        let path = context.join(candidate);
        if path.is_file() {
            return Ok(BuildFile {
                path,
                scratch: None,
            });
        }
    }

    let scratch = tempfile::Builder::new()
        .prefix("loadrun-")
        .tempdir()
        .map_err(DistError::BuildContext)?;
    let path = scratch.path().join("Containerfile");
    std::fs::write(&path, DEFAULT_CONTAINERFILE).map_err(DistError::BuildContext)?;
    debug!(path = %path.display(), "Using default Containerfile");
    Ok(BuildFile {
        path,
        scratch: Some(scratch),
    })
}

/// Builds, tags and pushes role images.
pub struct ImageBuilder {
    backend: Arc<dyn ContainerBackend>,
}

impl ImageBuilder {
    pub fn new(backend: Arc<dyn ContainerBackend>) -> Self {
        Self { backend }
    }

    /// Ensure every role image is available.
    ///
    /// Roles sharing a reference are handled once. The first non-zero exit of
    /// build, tag or push aborts with [`DistError::Build`].
    pub async fn build(
        &self,
        spec: &ClusterSpec,
        options: &BuildOptions,
    ) -> Result<ImageSet, DistError> {
        let mut images = ImageSet::new();
        let mut seen = BTreeSet::new();

        for role in spec.roles() {
            images.insert(role.kind, role.image.clone());
            if !seen.insert(role.image.clone()) {
                continue;
            }
            self.ensure(spec, role.kind, &role.image, options).await?;
        }

        Ok(images)
    }

    async fn ensure(
        &self,
        spec: &ClusterSpec,
        role: RoleKind,
        image: &str,
        options: &BuildOptions,
    ) -> Result<(), DistError> {
        let local = spec.local_image();
        let fail = |exit_code: i32| DistError::Build {
            role,
            image: image.to_string(),
            exit_code,
        };

        if !options.force_build {
            if self.backend.image_exists(image).await? {
                info!(%role, image, "Image already present, skipping build");
                return Ok(());
            }
            if spec.registry().is_some() && self.backend.image_exists(&local).await? {
                info!(%role, source = %local, target = image, "Tagging local image");
                let code = self.backend.tag_image(&local, image).await?;
                if code != 0 {
                    return Err(fail(code));
                }
                return self.push(spec, image, fail).await;
            }
        }

        // Held until the build is done; a generated file is removed on drop.
        let containerfile = resolve_containerfile(spec.context())?;
        let request = build_request(spec, containerfile.path(), image, options.no_cache);
        info!(
            %role,
            image,
            no_cache = options.no_cache,
            containerfile = %containerfile.path().display(),
            "Building image"
        );
        let code = self.backend.build_image(&request).await?;
        if code != 0 {
            return Err(fail(code));
        }

        self.push(spec, image, fail).await
    }

    async fn push(
        &self,
        spec: &ClusterSpec,
        image: &str,
        fail: impl Fn(i32) -> DistError,
    ) -> Result<(), DistError> {
        if spec.registry().is_none() {
            return Ok(());
        }
        info!(image, "Pushing image");
        let code = self.backend.push_image(image).await?;
        if code != 0 {
            return Err(fail(code));
        }
        Ok(())
    }
}

fn build_request(
    spec: &ClusterSpec,
    containerfile: &Path,
    image: &str,
    no_cache: bool,
) -> BuildRequest {
    let mut tags = vec![spec.local_image()];
    if image != tags[0] {
        tags.push(image.to_string());
    }

    let mut labels = BTreeMap::new();
    labels.insert(PROJECT_LABEL.to_string(), spec.project().to_string());

    BuildRequest {
        context: spec.context().clone(),
        containerfile: containerfile.to_path_buf(),
        tags,
        no_cache,
        labels,
    }
}
