//! Per-task sandboxes the step containers run against.
//!
//! A workspace is a Git-initialized copy of one repository, either a host
//! directory bind-mounted into containers or a container volume. Both variants
//! share one API; which one a run uses is decided once by [`select_creator`].

mod bind;
mod volume;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::core::types::{Repository, StepChanges};
use crate::io::context::RunContext;
use crate::io::docker::{Docker, host_uid};

pub use bind::BindWorkspace;
pub use volume::VolumeWorkspace;

/// Default image used to run git and tar against volume workspaces.
pub const DEFAULT_VOLUME_WORKSPACE_IMAGE: &str = "alpine/git:latest";

/// Configured workspace strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceMode {
    /// Volume on macOS or when an image runs as a foreign user, bind otherwise.
    #[default]
    Auto,
    Bind,
    Volume,
}

/// Builds workspaces of one variant.
#[derive(Debug, Clone)]
pub enum WorkspaceCreator {
    Bind {
        /// Parent directory for workspace directories; system temp when unset.
        temp_dir: Option<PathBuf>,
    },
    Volume {
        docker: Arc<Docker>,
        image: String,
        /// User that should own the checked-out files, when not root.
        owner_uid: Option<u32>,
    },
}

impl WorkspaceCreator {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bind { .. } => "bind",
            Self::Volume { .. } => "volume",
        }
    }

    /// Unpack `archive` into a fresh workspace and commit it as the baseline.
    ///
    /// Anything created before a failure is removed before returning.
    #[instrument(skip_all, fields(repo = %repo.name, kind = self.kind()))]
    pub async fn create(
        &self,
        ctx: &RunContext,
        repo: &Repository,
        archive: &Path,
    ) -> Result<Workspace> {
        let workspace = match self {
            Self::Bind { temp_dir } => Workspace::Bind(
                BindWorkspace::create(ctx, temp_dir.as_deref(), repo, archive).await?,
            ),
            Self::Volume {
                docker,
                image,
                owner_uid,
            } => Workspace::Volume(
                VolumeWorkspace::create(ctx, Arc::clone(docker), image, *owner_uid, archive)
                    .await?,
            ),
        };
        debug!("workspace ready");
        Ok(workspace)
    }
}

/// Isolated working copy for one task. Must be released with [`Workspace::close`].
#[derive(Debug)]
pub enum Workspace {
    Bind(BindWorkspace),
    Volume(VolumeWorkspace),
}

impl Workspace {
    /// Container runtime arguments that attach the workspace at `target`.
    pub fn docker_run_opts(&self, target: &str) -> Vec<String> {
        match self {
            Self::Bind(ws) => ws.docker_run_opts(target),
            Self::Volume(ws) => ws.docker_run_opts(target),
        }
    }

    /// Host path of the working tree, for variants that have one.
    pub fn work_dir(&self) -> Option<&Path> {
        match self {
            Self::Bind(ws) => Some(ws.path()),
            Self::Volume(_) => None,
        }
    }

    /// Stage everything and list what changed since the baseline.
    pub async fn changes(&self, ctx: &RunContext) -> Result<StepChanges> {
        match self {
            Self::Bind(ws) => ws.changes(ctx).await,
            Self::Volume(ws) => ws.changes(ctx).await,
        }
    }

    /// Staged diff against the baseline.
    pub async fn diff(&self, ctx: &RunContext) -> Result<Vec<u8>> {
        match self {
            Self::Bind(ws) => ws.diff(ctx).await,
            Self::Volume(ws) => ws.diff(ctx).await,
        }
    }

    /// Remove the directory or volume backing this workspace.
    pub async fn close(self, ctx: &RunContext) -> Result<()> {
        match self {
            Self::Bind(ws) => ws.close().await,
            Self::Volume(ws) => ws.close(ctx).await,
        }
    }
}

/// Settings [`select_creator`] needs beyond the runtime itself.
#[derive(Debug, Clone)]
pub struct WorkspaceSettings {
    pub mode: WorkspaceMode,
    pub temp_dir: Option<PathBuf>,
    pub volume_image: String,
}

/// Decide which workspace variant this run uses.
///
/// `images` must already be present locally: auto mode and volume mode probe
/// each one for the user it runs as.
#[instrument(skip_all, fields(mode = ?settings.mode))]
pub async fn select_creator(
    ctx: &RunContext,
    docker: Arc<Docker>,
    settings: &WorkspaceSettings,
    images: &[String],
) -> Result<WorkspaceCreator> {
    let bind = || WorkspaceCreator::Bind {
        temp_dir: settings.temp_dir.clone(),
    };
    if settings.mode == WorkspaceMode::Bind {
        return Ok(bind());
    }

    let mut uids = Vec::with_capacity(images.len());
    for image in images {
        uids.push(docker.image_uid(ctx, image).await?);
    }
    let owner_uid = uids.iter().copied().find(|uid| *uid != 0);

    let use_volume = match settings.mode {
        WorkspaceMode::Volume => true,
        WorkspaceMode::Bind => false,
        WorkspaceMode::Auto => {
            if cfg!(target_os = "macos") {
                true
            } else {
                let host = host_uid(ctx).await.context("probe host user")?;
                needs_volume(&uids, host)
            }
        }
    };

    let creator = if use_volume {
        WorkspaceCreator::Volume {
            docker,
            image: settings.volume_image.clone(),
            owner_uid,
        }
    } else {
        bind()
    };
    info!(kind = creator.kind(), ?owner_uid, "selected workspace");
    Ok(creator)
}

/// A bind mount only works when every image runs as root or as the host user.
fn needs_volume(image_uids: &[u32], host_uid: u32) -> bool {
    image_uids
        .iter()
        .any(|uid| *uid != 0 && *uid != host_uid)
}
