//! Plan artifacts produced by plan-mode turns.
//!
//! When a plan-mode turn goes idle, its accumulated text is written out as a
//! markdown document. `execute_plan` later reads it back and runs it as the
//! prompt of a fresh act-mode stream.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use crate::paths::is_safe_file_stem;

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("Invalid conversation id for plan: {0}")]
    InvalidId(String),

    #[error("Plan not found: {0}")]
    NotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait PlanWriter: Send + Sync {
    /// Persist plan content for a conversation and return where it went.
    async fn write_plan(&self, conversation_id: &str, content: &str) -> Result<PathBuf, PlanError>;

    async fn read_plan(&self, path: &Path) -> Result<String, PlanError>;
}

/// Writes plans to `{dir}/{conversation_id}-{YYYYmmdd-HHMMSS}.md`.
pub struct FilePlanWriter {
    dir: PathBuf,
}

impl FilePlanWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl PlanWriter for FilePlanWriter {
    async fn write_plan(&self, conversation_id: &str, content: &str) -> Result<PathBuf, PlanError> {
        if !is_safe_file_stem(conversation_id) {
            return Err(PlanError::InvalidId(conversation_id.to_string()));
        }
        fs::create_dir_all(&self.dir)?;

        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let path = self.dir.join(format!("{conversation_id}-{stamp}.md"));
        let temp_path = self.dir.join(format!("{conversation_id}-{stamp}.md.tmp"));

        fs::write(&temp_path, content)?;
        fs::rename(&temp_path, &path)?;

        log::info!("Wrote plan for {} to {}", conversation_id, path.display());
        Ok(path)
    }

    async fn read_plan(&self, path: &Path) -> Result<String, PlanError> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PlanError::NotFound(path.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn write_then_read() {
        let dir = tempdir().unwrap();
        let writer = FilePlanWriter::new(dir.path().join("plans"));

        let path = writer.write_plan("conv-1", "1. Do it").await.unwrap();

        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("conv-1-"));
        assert!(name.ends_with(".md"));
        assert_eq!(writer.read_plan(&path).await.unwrap(), "1. Do it");
    }

    #[tokio::test]
    async fn read_missing_plan_is_not_found() {
        let dir = tempdir().unwrap();
        let writer = FilePlanWriter::new(dir.path());

        let result = writer.read_plan(&dir.path().join("missing.md")).await;
        assert!(matches!(result, Err(PlanError::NotFound(_))));
    }

    #[tokio::test]
    async fn rejects_unsafe_ids() {
        let dir = tempdir().unwrap();
        let writer = FilePlanWriter::new(dir.path());

        let result = writer.write_plan("../x", "plan").await;
        assert!(matches!(result, Err(PlanError::InvalidId(_))));
    }
}
