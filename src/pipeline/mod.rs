// src/pipeline/mod.rs - Runs the external photogrammetry tools over a run's pictures
pub mod stage;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::PipelineConfig;
use crate::run::{self, RunFolderError};

pub use stage::{batches, Batch, Invocation, StageKind, StagePlan};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("IO error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Build folder error: {0}")]
    RunFolder(#[from] RunFolderError),
    #[error("Failed to start '{program}': {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Stage {stage} is missing its input folder '{folder}'")]
    MissingInput { stage: StageKind, folder: PathBuf },
    #[error("Stage {stage} failed with exit code {code:?}: {command}")]
    StageFailed {
        stage: StageKind,
        code: Option<i32>,
        command: String,
    },
    #[error("No images found in '{0}'")]
    NoImages(PathBuf),
}

/// Spawns one stage invocation and waits for it.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Exit code of the finished process; `None` if it was killed by a signal.
    async fn run(&self, invocation: &Invocation) -> std::io::Result<Option<i32>>;
}

/// Runs invocations as child processes, inheriting stdout and stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, invocation: &Invocation) -> std::io::Result<Option<i32>> {
        let status = tokio::process::Command::new(&invocation.program)
            .args(&invocation.args)
            .status()
            .await?;
        Ok(status.code())
    }
}

/// An invocation that exited non-zero (or could not start) while `fail_fast` was off.
#[derive(Debug, Clone, PartialEq)]
pub struct StageFailure {
    pub stage: StageKind,
    pub batch: Option<Batch>,
    pub code: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub build_dir: PathBuf,
    pub build_number: u32,
    pub image_count: usize,
    pub invocations: usize,
    pub failures: Vec<StageFailure>,
    pub elapsed: Duration,
}

impl PipelineReport {
    pub fn mesh_path(&self) -> PathBuf {
        self.build_dir.join(StageKind::Meshing.folder_name()).join("mesh.obj")
    }

    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Nine-stage meshing pipeline writing into a fresh `builds/<prefix><n>` folder.
pub struct PipelineInvoker<R: CommandRunner = ProcessRunner> {
    config: PipelineConfig,
    folder_prefix: String,
    runner: R,
}

impl PipelineInvoker<ProcessRunner> {
    pub fn new(config: PipelineConfig, folder_prefix: &str) -> Self {
        Self::with_runner(config, folder_prefix, ProcessRunner)
    }
}

impl<R: CommandRunner> PipelineInvoker<R> {
    pub fn with_runner(config: PipelineConfig, folder_prefix: &str, runner: R) -> Self {
        Self {
            config,
            folder_prefix: folder_prefix.to_string(),
            runner,
        }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Run every stage over the images in `images_dir`.
    pub async fn run(&self, images_dir: &Path) -> Result<PipelineReport, PipelineError> {
        let image_count = run::count_images(images_dir).await?;
        if image_count == 0 {
            return Err(PipelineError::NoImages(images_dir.to_path_buf()));
        }
        let (build_dir, build_number) = run::claim_folder(&self.config.builds_dir, &self.folder_prefix).await?;
        tracing::info!(
            "Meshing {} images from {} into {}",
            image_count,
            images_dir.display(),
            build_dir.display()
        );

        let started = Instant::now();
        let plan = StagePlan {
            config: &self.config,
            build_dir: &build_dir,
            images_dir,
            image_count,
        };
        let mut invocations = 0;
        let mut failures = Vec::new();

        for stage in StageKind::ALL {
            if let Some(previous) = stage.previous() {
                let input = plan.stage_dir(previous);
                if !tokio::fs::metadata(&input).await.map(|m| m.is_dir()).unwrap_or(false) {
                    return Err(PipelineError::MissingInput { stage, folder: input });
                }
            }
            let output = plan.stage_dir(stage);
            tokio::fs::create_dir_all(&output)
                .await
                .map_err(|source| PipelineError::Io { path: output.clone(), source })?;

            tracing::info!("----------------------- {} -----------------------", stage);
            let batch = plan.invocations(stage);
            let groups = batch.len();
            for (i, invocation) in batch.into_iter().enumerate() {
                if invocation.batch.is_some() {
                    tracing::info!("------- group {} / {} --------", i + 1, groups);
                }
                tracing::info!("{}", invocation.command_line());
                invocations += 1;
                let code = match self.runner.run(&invocation).await {
                    Ok(code) => code,
                    Err(source) if self.config.fail_fast => {
                        return Err(PipelineError::Spawn { program: invocation.program, source });
                    }
                    Err(e) => {
                        tracing::error!("Failed to start {}: {}", invocation.program.display(), e);
                        None
                    }
                };
                if code == Some(0) {
                    continue;
                }
                if self.config.fail_fast {
                    tracing::error!("Stage {} exited with {:?}", stage, code);
                    return Err(PipelineError::StageFailed {
                        stage,
                        code,
                        command: invocation.command_line(),
                    });
                }
                tracing::warn!("Stage {} exited with {:?}, continuing", stage, code);
                failures.push(StageFailure { stage, batch: invocation.batch, code });
            }
        }

        let elapsed = started.elapsed();
        tracing::info!("-------------------------------- DONE ----------------------");
        tracing::info!("time elapsed: {}", format_elapsed(elapsed));
        Ok(PipelineReport {
            build_dir,
            build_number,
            image_count,
            invocations,
            failures,
            elapsed,
        })
    }
}

/// `HH:MM:SS.ss`
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs_f64();
    let hours = (total / 3600.0).floor();
    let minutes = ((total - hours * 3600.0) / 60.0).floor();
    let seconds = total - hours * 3600.0 - minutes * 60.0;
    format!("{:02}:{:02}:{:05.2}", hours as u64, minutes as u64, seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_secs_f64(3.5)), "00:00:03.50");
        assert_eq!(format_elapsed(Duration::from_secs(3725)), "01:02:05.00");
    }
}
