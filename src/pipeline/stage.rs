// src/pipeline/stage.rs - The nine photogrammetry stages and their command lines
use std::path::{Path, PathBuf};

use crate::config::PipelineConfig;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    CameraInit,
    FeatureExtraction,
    ImageMatching,
    FeatureMatching,
    StructureFromMotion,
    PrepareDenseScene,
    DepthMap,
    DepthMapFilter,
    Meshing,
}

impl StageKind {
    pub const ALL: [StageKind; 9] = [
        StageKind::CameraInit,
        StageKind::FeatureExtraction,
        StageKind::ImageMatching,
        StageKind::FeatureMatching,
        StageKind::StructureFromMotion,
        StageKind::PrepareDenseScene,
        StageKind::DepthMap,
        StageKind::DepthMapFilter,
        StageKind::Meshing,
    ];

    /// 1-based position in the pipeline.
    pub fn number(self) -> usize {
        self as usize + 1
    }

    pub fn previous(self) -> Option<StageKind> {
        match self.number() {
            1 => None,
            n => Some(Self::ALL[n - 2]),
        }
    }

    /// Output folder name inside the build folder.
    pub fn folder_name(self) -> &'static str {
        match self {
            StageKind::CameraInit => "1_CameraInit",
            StageKind::FeatureExtraction => "2_FeatureExtraction",
            StageKind::ImageMatching => "3_ImageMatching",
            StageKind::FeatureMatching => "4_featureMatching",
            StageKind::StructureFromMotion => "5_structureFromMotion",
            StageKind::PrepareDenseScene => "6_PrepareDenseScene",
            StageKind::DepthMap => "7_DepthMap",
            StageKind::DepthMapFilter => "8_DepthMapFilter",
            StageKind::Meshing => "9_Meshing",
        }
    }

    /// Executable name without the `aliceVision_` prefix.
    pub fn tool(self) -> &'static str {
        match self {
            StageKind::CameraInit => "cameraInit",
            StageKind::FeatureExtraction => "featureExtraction",
            StageKind::ImageMatching => "imageMatching",
            StageKind::FeatureMatching => "featureMatching",
            StageKind::StructureFromMotion => "incrementalSfm",
            StageKind::PrepareDenseScene => "prepareDenseScene",
            StageKind::DepthMap => "depthMapEstimation",
            StageKind::DepthMapFilter => "depthMapFiltering",
            StageKind::Meshing => "meshing",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            StageKind::CameraInit => "CAMERA INITIALIZATION",
            StageKind::FeatureExtraction => "FEATURE EXTRACTION",
            StageKind::ImageMatching => "IMAGE MATCHING",
            StageKind::FeatureMatching => "FEATURE MATCHING",
            StageKind::StructureFromMotion => "STRUCTURE FROM MOTION",
            StageKind::PrepareDenseScene => "PREPARE DENSE SCENE",
            StageKind::DepthMap => "DEPTH MAP",
            StageKind::DepthMapFilter => "DEPTH MAP FILTER",
            StageKind::Meshing => "MESHING",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/9 {}", self.number(), self.title())
    }
}

/// A slice of the image set handed to one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Batch {
    pub start: usize,
    pub size: usize,
}

/// One process to spawn.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub stage: StageKind,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub batch: Option<Batch>,
}

impl Invocation {
    /// Shell-like rendering for logs.
    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            if arg.contains(' ') {
                line.push('"');
                line.push_str(arg);
                line.push('"');
            } else {
                line.push_str(arg);
            }
        }
        line
    }
}

/// Split `count` images into `[start, start + size)` ranges of at most `group` images.
pub fn batches(count: usize, group: usize) -> Vec<Batch> {
    if group == 0 {
        return Vec::new();
    }
    (0..count)
        .step_by(group)
        .map(|start| Batch { start, size: group.min(count - start) })
        .collect()
}

/// Everything needed to build a stage's arguments.
#[derive(Debug, Clone)]
pub struct StagePlan<'a> {
    pub config: &'a PipelineConfig,
    pub build_dir: &'a Path,
    pub images_dir: &'a Path,
    pub image_count: usize,
}

impl StagePlan<'_> {
    pub fn program(&self, stage: StageKind) -> PathBuf {
        self.config
            .bin_path
            .join(format!("aliceVision_{}{}", stage.tool(), std::env::consts::EXE_SUFFIX))
    }

    pub fn stage_dir(&self, stage: StageKind) -> PathBuf {
        self.build_dir.join(stage.folder_name())
    }

    /// `share/aliceVision` next to the binary folder.
    fn share_dir(&self) -> PathBuf {
        let root = self.config.bin_path.parent().unwrap_or_else(|| Path::new(""));
        root.join("share").join("aliceVision")
    }

    fn path(&self, stage: StageKind, file: &str) -> String {
        let dir = self.stage_dir(stage);
        let path = if file.is_empty() { dir } else { dir.join(file) };
        path.display().to_string()
    }

    /// All invocations of `stage`, batched where the stage supports it.
    pub fn invocations(&self, stage: StageKind) -> Vec<Invocation> {
        let args = self.args(stage);
        let batched = match stage {
            StageKind::FeatureExtraction if self.image_count > self.config.feature_group => {
                batches(self.image_count, self.config.feature_group)
            }
            StageKind::FeatureMatching if self.image_count > self.config.matching_group => {
                batches(self.image_count, self.config.matching_group)
            }
            StageKind::DepthMap => batches(self.image_count, self.config.depth_map_group),
            _ => Vec::new(),
        };

        let program = self.program(stage);
        if batched.is_empty() {
            return vec![Invocation { stage, program, args, batch: None }];
        }
        batched
            .into_iter()
            .map(|batch| {
                let mut args = args.clone();
                args.extend([
                    "--rangeStart".to_string(),
                    batch.start.to_string(),
                    "--rangeSize".to_string(),
                    batch.size.to_string(),
                ]);
                Invocation { stage, program: program.clone(), args, batch: Some(batch) }
            })
            .collect()
    }

    fn args(&self, stage: StageKind) -> Vec<String> {
        use StageKind::*;

        let verbose = self.config.verbose_level.clone();
        let sfm_init = self.path(CameraInit, "cameraInit.sfm");
        let features = self.path(FeatureExtraction, "");
        let sfm = self.path(StructureFromMotion, "sfm.abc");
        let mut args: Vec<String> = match stage {
            CameraInit => vec![
                "--imageFolder".into(),
                self.images_dir.display().to_string(),
                "--sensorDatabase".into(),
                self.share_dir().join("cameraSensors.db").display().to_string(),
                "--output".into(),
                sfm_init,
                "--defaultFieldOfView".into(),
                "45".into(),
                "--allowSingleView".into(),
                "1".into(),
            ],
            FeatureExtraction => vec![
                "--input".into(),
                sfm_init,
                "--output".into(),
                features,
                "--forceCpuExtraction".into(),
                "1".into(),
            ],
            ImageMatching => vec![
                "--input".into(),
                sfm_init,
                "--featuresFolders".into(),
                features,
                "--output".into(),
                self.path(ImageMatching, "imageMatches.txt"),
                "--tree".into(),
                self.share_dir().join("vlfeat_K80L3.SIFT.tree").display().to_string(),
            ],
            FeatureMatching => {
                let mut args: Vec<String> = vec![
                    "--input".into(),
                    sfm_init,
                    "--featuresFolders".into(),
                    features,
                    "--output".into(),
                    self.path(FeatureMatching, ""),
                    "--imagePairsList".into(),
                    self.path(ImageMatching, "imageMatches.txt"),
                ];
                args.extend(
                    [
                        ("--knownPosesGeometricErrorMax", "5"),
                        ("--describerTypes", "sift"),
                        ("--photometricMatchingMethod", "ANN_L2"),
                        ("--geometricEstimator", "acransac"),
                        ("--geometricFilterType", "fundamental_matrix"),
                        ("--distanceRatio", "0.8"),
                        ("--maxIteration", "2048"),
                        ("--geometricError", "0.0"),
                        ("--maxMatches", "0"),
                        ("--savePutativeMatches", "False"),
                        ("--guidedMatching", "False"),
                        ("--matchFromKnownCameraPoses", "False"),
                        ("--exportDebugFiles", "True"),
                    ]
                    .into_iter()
                    .flat_map(|(flag, value)| [flag.to_string(), value.to_string()]),
                );
                args
            }
            StructureFromMotion => vec![
                "--input".into(),
                sfm_init,
                "--output".into(),
                sfm,
                "--outputViewsAndPoses".into(),
                self.path(StructureFromMotion, "cameras.sfm"),
                "--extraInfoFolder".into(),
                self.path(StructureFromMotion, ""),
                "--featuresFolders".into(),
                features,
                "--matchesFolders".into(),
                self.path(FeatureMatching, ""),
            ],
            PrepareDenseScene => vec![
                "--input".into(),
                sfm,
                "--output".into(),
                self.path(PrepareDenseScene, ""),
            ],
            DepthMap => vec![
                "--input".into(),
                sfm,
                "--output".into(),
                self.path(DepthMap, ""),
                "--imagesFolder".into(),
                self.path(PrepareDenseScene, ""),
                "--downscale".into(),
                self.config.downscale.to_string(),
            ],
            DepthMapFilter => vec![
                "--input".into(),
                sfm,
                "--output".into(),
                self.path(DepthMapFilter, ""),
                "--depthMapsFolder".into(),
                self.path(DepthMap, ""),
            ],
            Meshing => vec![
                "--input".into(),
                sfm,
                "--output".into(),
                self.path(Meshing, "densePointCloud.abc"),
                "--outputMesh".into(),
                self.path(Meshing, "mesh.obj"),
                "--depthMapsFolder".into(),
                self.path(DepthMapFilter, ""),
                "--maxInputPoints".into(),
                self.config.max_input_points.to_string(),
                "--maxPoints".into(),
                self.config.max_points.to_string(),
            ],
        };
        // Feature extraction never took a verbosity flag.
        if stage != FeatureExtraction {
            args.extend(["--verboseLevel".to_string(), verbose]);
        }
        args
    }
}
