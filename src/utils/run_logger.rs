use crate::config::Config;
use crate::tools::process_tool::RunStatus;
use crate::tools::schedule_tool::ExecutionPair;
use anyhow::Result;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::error;

/// Append-only log with one line per finished execution pair, rotated by size.
#[derive(Debug)]
pub struct RunLogger {
    log_file_path: PathBuf,
    max_size_bytes: u64,
}

impl RunLogger {
    pub fn new(config: Arc<Config>) -> Self {
        if let Some(parent_dir) = config.run_log_file.parent() {
            if !parent_dir.exists() {
                if let Err(e) = std::fs::create_dir_all(parent_dir) {
                    error!(path = %parent_dir.display(), error = %e, "Failed to create run log directory");
                }
            }
        }
        Self {
            log_file_path: config.run_log_file.clone(),
            max_size_bytes: config.run_log_max_size_bytes,
        }
    }

    async fn rotate_log_if_needed(&self) -> Result<()> {
        if !self.log_file_path.exists() {
            return Ok(());
        }

        let metadata = fs::metadata(&self.log_file_path).await?;
        if metadata.len() >= self.max_size_bytes {
            let timestamp = Utc::now().format("%Y-%m-%d_%H-%M-%S_%6f").to_string();
            let file_stem = self.log_file_path.file_stem().unwrap_or_default().to_string_lossy();
            let extension = self.log_file_path.extension().unwrap_or_default().to_string_lossy();
            let mut backup_path = self
                .log_file_path
                .with_file_name(format!("{}_{}.{}", file_stem, timestamp, extension));
            // Never overwrite an earlier backup, even within the same microsecond.
            let mut counter = 1u32;
            while fs::try_exists(&backup_path).await? {
                backup_path = self
                    .log_file_path
                    .with_file_name(format!("{}_{}_{}.{}", file_stem, timestamp, counter, extension));
                counter += 1;
            }
            fs::rename(&self.log_file_path, backup_path).await?;
        }
        Ok(())
    }

    pub async fn log_run(&self, batch_id: &str, pair: &ExecutionPair, status: RunStatus, exit_code: Option<i32>) {
        if let Err(e) = self.try_log_run(batch_id, pair, status, exit_code).await {
            error!(run_number = pair.run_number, error = %e, "Failed to write run log");
        }
    }

    async fn try_log_run(
        &self,
        batch_id: &str,
        pair: &ExecutionPair,
        status: RunStatus,
        exit_code: Option<i32>,
    ) -> Result<()> {
        self.rotate_log_if_needed().await?;

        let log_entry = format!(
            "{} | {} | {:>3}/{:<3} | {} | {} | {:?} | exit={}\n",
            Utc::now().to_rfc3339(),
            batch_id,
            pair.run_number,
            pair.total_runs,
            pair.juror.name,
            pair.case.name,
            status,
            exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string()),
        );

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .await?;
        file.write_all(log_entry.as_bytes()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::config_for;
    use crate::tools::filestore_tool::{Artifact, Category};

    #[tokio::test]
    async fn appends_one_line_per_run_and_rotates() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_for(dir.path(), &[]);
        config.run_log_max_size_bytes = 1;
        let logger = RunLogger::new(Arc::new(config.clone()));
        let pair = ExecutionPair {
            run_number: 1,
            total_runs: 2,
            juror: Artifact::new("j.txt", Category::Juror, 100),
            case: Artifact::new("c.txt", Category::Case, 100),
        };
        logger.log_run("batch", &pair, RunStatus::Completed, Some(0)).await;
        let first = std::fs::read_to_string(&config.run_log_file).unwrap();
        assert!(first.contains("j.txt | c.txt | Completed | exit=0"));

        logger.log_run("batch", &pair, RunStatus::Failed, Some(2)).await;
        let second = std::fs::read_to_string(&config.run_log_file).unwrap();
        assert_eq!(second.lines().count(), 1);
        assert!(second.contains("Failed | exit=2"));
        let rotated = std::fs::read_dir(config.run_log_file.parent().unwrap()).unwrap().count();
        assert_eq!(rotated, 2);
    }

    #[tokio::test]
    async fn rapid_rotations_keep_every_backup() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_for(dir.path(), &[]);
        config.run_log_max_size_bytes = 1;
        let logger = RunLogger::new(Arc::new(config.clone()));
        let pair = ExecutionPair {
            run_number: 1,
            total_runs: 1,
            juror: Artifact::new("j.txt", Category::Juror, 100),
            case: Artifact::new("c.txt", Category::Case, 100),
        };
        for _ in 0..4 {
            logger.log_run("batch", &pair, RunStatus::Completed, Some(0)).await;
        }

        let files: Vec<PathBuf> = std::fs::read_dir(config.run_log_file.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(files.len(), 4);
        let total_lines: usize = files
            .iter()
            .map(|p| std::fs::read_to_string(p).unwrap().lines().count())
            .sum();
        assert_eq!(total_lines, 4);
    }
}
