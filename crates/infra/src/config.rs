//! Where the job database lives.

use std::path::PathBuf;

use anyhow::Context;

const DB_URL_VAR: &str = "JOBMILL_DB_URL";
const MEMORY_URL: &str = "sqlite::memory:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteConfig {
    pub url: String,
    pub max_connections: u32,
}

impl SqliteConfig {
    /// `JOBMILL_DB_URL` if set, otherwise `jobs.db` under the user's data
    /// directory. The directory is created when missing.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(
            |key| std::env::var(key).ok(),
            || dirs::data_dir().or_else(|| dirs::home_dir().map(|home| home.join(".local").join("share"))),
        )
    }

    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
        data_dir: impl FnOnce() -> Option<PathBuf>,
    ) -> anyhow::Result<Self> {
        if let Some(url) = lookup(DB_URL_VAR).filter(|url| !url.trim().is_empty()) {
            return Ok(Self::with_url(url.trim()));
        }

        let dir = data_dir()
            .context("no data directory on this platform; set JOBMILL_DB_URL")?
            .join("jobmill");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        Ok(Self::at_path(dir.join("jobs.db")))
    }

    pub fn at_path(path: PathBuf) -> Self {
        Self::with_url(format!("sqlite://{}", path.display()))
    }

    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 4,
        }
    }

    /// A private database that disappears with its pool.
    pub fn in_memory() -> Self {
        Self {
            url: MEMORY_URL.to_string(),
            max_connections: 1,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.url.contains(":memory:") || self.url.contains("mode=memory")
    }
}
