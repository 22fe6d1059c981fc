//! Database dependency management via docker compose
//!
//! Thin delegate around `docker compose up/down` for the databases the
//! servers under test depend on. The compose file itself is user
//! supplied; this module only sequences it.

use std::path::PathBuf;
use std::time::Duration;

use tokio::process::Command;
use tracing::info;

use super::ContainerError;

/// Compose operations are given generous time; database images can be
/// slow to pull and initialize.
const COMPOSE_TIMEOUT: Duration = Duration::from_secs(300);

/// Delegates database lifecycle to `docker compose`.
pub struct ComposeManager {
    file: PathBuf,
}

impl ComposeManager {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self { file: file.into() }
    }

    /// `docker compose -f FILE up -d --wait`
    pub async fn up(&self) -> Result<(), ContainerError> {
        info!(file = %self.file.display(), "bringing up database dependencies");
        self.compose(&["up", "-d", "--wait"]).await
    }

    /// `docker compose -f FILE down`
    pub async fn down(&self) -> Result<(), ContainerError> {
        info!(file = %self.file.display(), "tearing down database dependencies");
        self.compose(&["down"]).await
    }

    async fn compose(&self, verbs: &[&str]) -> Result<(), ContainerError> {
        let mut args = vec!["compose", "-f"];
        let file = self.file.to_string_lossy();
        args.push(&file);
        args.extend_from_slice(verbs);

        let future = Command::new("docker").args(&args).output();
        let output = tokio::time::timeout(COMPOSE_TIMEOUT, future)
            .await
            .map_err(|_| {
                ContainerError::CommandTimeout(format!("compose {}", verbs[0]), COMPOSE_TIMEOUT)
            })??;

        if !output.status.success() {
            return Err(ContainerError::CommandFailed {
                command: format!("compose {}", verbs[0]),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_manager_paths() {
        let manager = ComposeManager::new("deploy/databases.yml");
        assert_eq!(manager.file, PathBuf::from("deploy/databases.yml"));
    }
}
