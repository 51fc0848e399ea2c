use std::path::{Path, PathBuf};

use anyhow::Context as _;
use async_trait::async_trait;
use tokio::fs;

use crate::project::Project;

pub const PROJECT_FILE: &str = "project.json";

/// Where checkpoints go between phases.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn load(&self) -> anyhow::Result<Option<Project>>;
    async fn save(&self, project: &Project) -> anyhow::Result<()>;
}

/// Keeps `project.json` in a project directory.
#[derive(Debug, Clone)]
pub struct LocalFsProjectStore {
    dir: PathBuf,
}

impl LocalFsProjectStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn project_path(&self) -> PathBuf {
        self.dir.join(PROJECT_FILE)
    }

    /// Loads the project, failing if none has been saved yet.
    pub async fn load_existing(&self) -> anyhow::Result<Project> {
        self.load()
            .await?
            .ok_or_else(|| anyhow::anyhow!("no project found at {}", self.project_path().display()))
    }
}

#[async_trait]
impl ProjectStore for LocalFsProjectStore {
    async fn load(&self) -> anyhow::Result<Option<Project>> {
        let path = self.project_path();
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(anyhow::Error::new(err).context(format!("open {}", path.display())));
            }
        };
        let project = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse project file {}", path.display()))?;
        Ok(Some(project))
    }

    /// Writes a sibling temp file and renames it over `project.json`, so a
    /// crash mid-write leaves the previous checkpoint intact.
    async fn save(&self, project: &Project) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create project dir {}", self.dir.display()))?;

        let json = serde_json::to_vec_pretty(project).context("encode project")?;
        let staging = self
            .dir
            .join(format!(".{PROJECT_FILE}.{}", uuid::Uuid::new_v4().simple()));
        fs::write(&staging, &json)
            .await
            .with_context(|| format!("write {}", staging.display()))?;
        let target = self.project_path();
        if let Err(err) = fs::rename(&staging, &target).await {
            let _ = fs::remove_file(&staging).await;
            return Err(anyhow::Error::new(err).context(format!("replace {}", target.display())));
        }
        Ok(())
    }
}
