// src/run.rs - Run folders and picture numbering
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use thiserror::Error;
use tokio::fs;

/// File extensions counted as captured images when a folder is handed to the pipeline.
const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "tif", "tiff"];

/// Upper bound on folder-creation attempts when other runs keep claiming the next number.
const MAX_CLAIM_ATTEMPTS: u32 = 1000;

#[derive(Debug, Error)]
pub enum RunFolderError {
    #[error("IO error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Could not claim a free run folder under '{0}'")]
    Exhausted(PathBuf),
}

/// One execution of a capture sequence: the folder it writes into and its picture counter.
#[derive(Debug)]
pub struct Run {
    folder: PathBuf,
    number: u32,
    picture_prefix: String,
    next_picture: u32,
    started_at: DateTime<Local>,
}

impl Run {
    /// Claim the next free `<prefix><n>` folder under `base_dir` and start numbering at 1.
    ///
    /// The folder is created exclusively, so two runs started side by side never share it:
    /// the loser of the race moves on to the following number.
    pub async fn create(
        base_dir: &Path,
        folder_prefix: &str,
        picture_prefix: &str,
    ) -> Result<Self, RunFolderError> {
        let (folder, number) = claim_folder(base_dir, folder_prefix).await?;
        tracing::info!("Run folder: {}", folder.display());
        Ok(Self {
            folder,
            number,
            picture_prefix: picture_prefix.to_string(),
            next_picture: 1,
            started_at: Local::now(),
        })
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    /// Path the next captured picture will be written to. Does not advance the counter.
    pub fn next_picture_path(&self) -> PathBuf {
        self.folder
            .join(format!("{}{}.png", self.picture_prefix, self.next_picture))
    }

    /// Record that the picture at [`Run::next_picture_path`] was written. Returns its number.
    pub fn commit_picture(&mut self) -> u32 {
        let number = self.next_picture;
        self.next_picture += 1;
        number
    }

    pub fn pictures_taken(&self) -> u32 {
        self.next_picture - 1
    }
}

/// Numeric suffix of `name` if it is `<prefix><digits>`.
pub fn parse_folder_number(name: &str, prefix: &str) -> Option<u32> {
    let digits = name.strip_prefix(prefix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Largest `<prefix><n>` suffix among the sub-folders of `base_dir`, if any.
pub async fn latest_folder_number(base_dir: &Path, prefix: &str) -> Result<Option<u32>, RunFolderError> {
    let mut entries = match fs::read_dir(base_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error(base_dir, e)),
    };
    let mut latest = None;
    while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(base_dir, e))? {
        let is_dir = entry
            .file_type()
            .await
            .map(|t| t.is_dir())
            .unwrap_or(false);
        if !is_dir {
            continue;
        }
        if let Some(number) = entry.file_name().to_str().and_then(|n| parse_folder_number(n, prefix)) {
            latest = latest.max(Some(number));
        }
    }
    Ok(latest)
}

/// Next run number: one past the largest existing suffix, never filling gaps.
pub async fn next_folder_number(base_dir: &Path, prefix: &str) -> Result<u32, RunFolderError> {
    match latest_folder_number(base_dir, prefix).await? {
        None => Ok(1),
        Some(n) => n
            .checked_add(1)
            .ok_or_else(|| RunFolderError::Exhausted(base_dir.to_path_buf())),
    }
}

/// Path of the most recent `<prefix><n>` folder under `base_dir`.
pub async fn latest_run_folder(base_dir: &Path, prefix: &str) -> Result<Option<PathBuf>, RunFolderError> {
    Ok(latest_folder_number(base_dir, prefix)
        .await?
        .map(|n| base_dir.join(format!("{}{}", prefix, n))))
}

/// Create `<prefix><n>` under `base_dir` with `n` from [`next_folder_number`].
pub async fn claim_folder(base_dir: &Path, prefix: &str) -> Result<(PathBuf, u32), RunFolderError> {
    fs::create_dir_all(base_dir)
        .await
        .map_err(|e| io_error(base_dir, e))?;
    let mut number = next_folder_number(base_dir, prefix).await?;
    for _ in 0..MAX_CLAIM_ATTEMPTS {
        let folder = base_dir.join(format!("{}{}", prefix, number));
        match fs::create_dir(&folder).await {
            Ok(()) => return Ok((folder, number)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                tracing::debug!("Run folder {} already taken", folder.display());
                number = number
                    .checked_add(1)
                    .ok_or_else(|| RunFolderError::Exhausted(base_dir.to_path_buf()))?;
            }
            Err(e) => return Err(io_error(&folder, e)),
        }
    }
    Err(RunFolderError::Exhausted(base_dir.to_path_buf()))
}

/// Number of image files directly inside `dir`.
pub async fn count_images(dir: &Path) -> Result<usize, RunFolderError> {
    let mut entries = fs::read_dir(dir).await.map_err(|e| io_error(dir, e))?;
    let mut count = 0;
    while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(dir, e))? {
        let path = entry.path();
        let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_file && is_image {
            count += 1;
        }
    }
    Ok(count)
}

fn io_error(path: &Path, source: std::io::Error) -> RunFolderError {
    RunFolderError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_folder_number() {
        assert_eq!(parse_folder_number("run12", "run"), Some(12));
        assert_eq!(parse_folder_number("run", "run"), None);
        assert_eq!(parse_folder_number("run_old", "run"), None);
        assert_eq!(parse_folder_number("build3", "run"), None);
        assert_eq!(parse_folder_number("run3a", "run"), None);
        assert_eq!(parse_folder_number("run4294967296", "run"), None);
    }

    #[tokio::test]
    async fn test_last_folder_number_is_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("run4294967295")).unwrap();

        let err = next_folder_number(dir.path(), "run").await.unwrap_err();
        assert!(matches!(err, RunFolderError::Exhausted(_)));
        let err = Run::create(dir.path(), "run", "picture").await.unwrap_err();
        assert!(matches!(err, RunFolderError::Exhausted(_)));
        assert!(!dir.path().join("run0").exists());
    }

    #[tokio::test]
    async fn test_next_folder_number_skips_gaps() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("run2")).unwrap();
        std::fs::create_dir(dir.path().join("run5")).unwrap();
        assert_eq!(next_folder_number(dir.path(), "run").await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_picture_counter_is_gapless() {
        let dir = tempfile::tempdir().unwrap();
        let mut run = Run::create(dir.path(), "run", "picture").await.unwrap();
        assert_eq!(run.pictures_taken(), 0);
        assert!(run.next_picture_path().ends_with("picture1.png"));
        // Peeking twice does not advance
        assert!(run.next_picture_path().ends_with("picture1.png"));
        assert_eq!(run.commit_picture(), 1);
        assert_eq!(run.commit_picture(), 2);
        assert!(run.next_picture_path().ends_with("picture3.png"));
        assert_eq!(run.pictures_taken(), 2);
    }
}
