use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub upload_root: PathBuf,
    /// True when `upload_root` was created by us and should be removed on shutdown.
    pub upload_root_is_temp: bool,
    pub log_level: String,
    pub http_host: String,
    pub http_port: u16,
    pub max_upload_bytes: usize,

    pub deliberation_program: String,
    pub deliberation_args: Vec<String>,
    pub deliberation_workdir: PathBuf,
    pub deliberation_artifact: Option<String>,

    pub generator_program: String,
    pub generator_phase1_args: Vec<String>,
    pub generator_phase2_args: Vec<String>,
    pub generator_workdir: PathBuf,
    pub generator_phase1_evidence: Option<PathBuf>,
    pub generator_artifact_candidates: Vec<PathBuf>,

    pub credential_files: Vec<PathBuf>,

    #[serde(serialize_with = "serialize_millis")]
    pub terminate_grace: Duration,
    #[serde(serialize_with = "serialize_millis")]
    pub session_timeout: Duration,
    #[serde(serialize_with = "serialize_millis")]
    pub pty_poll_interval: Duration,
    pub overall_retry_cap: usize,
    pub max_total_rounds: usize,
    #[serde(serialize_with = "serialize_millis")]
    pub unclaimed_session_grace: Duration,

    pub run_log_file: PathBuf,
    pub run_log_max_size_bytes: u64,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

fn expand_tilde(path_str: &str) -> Result<PathBuf, anyhow::Error> {
    Ok(PathBuf::from(shellexpand::tilde(path_str).as_ref()))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn split_args(value: &str) -> Vec<String> {
    value.split_whitespace().map(String::from).collect()
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup so tests never touch the process env.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|s| !s.trim().is_empty());

        let (upload_root, upload_root_is_temp) = match var("UPLOAD_ROOT") {
            Some(root) => {
                let root = expand_tilde(&root)?;
                std::fs::create_dir_all(&root)
                    .context(format!("Failed to create UPLOAD_ROOT: {}", root.display()))?;
                let root = dunce::canonicalize(&root)
                    .context(format!("Failed to canonicalize UPLOAD_ROOT: {}", root.display()))?;
                (root, false)
            }
            None => {
                let root = std::env::temp_dir().join(format!("jury_uploads_{}", Uuid::new_v4().simple()));
                std::fs::create_dir_all(&root)
                    .context(format!("Failed to create temporary upload root: {}", root.display()))?;
                (root, true)
            }
        };
        if !upload_root.is_dir() {
            anyhow::bail!("UPLOAD_ROOT is not a valid directory: {:?}", upload_root);
        }

        let log_level = var("LOG_LEVEL").unwrap_or_else(|| "info".to_string());
        let http_host = var("HTTP_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let http_port = var("HTTP_PORT")
            .unwrap_or_else(|| "5001".to_string())
            .parse::<u16>()
            .context("Invalid HTTP_PORT")?;
        let max_upload_bytes = var("MAX_UPLOAD_BYTES")
            .unwrap_or_else(|| (16 * 1024 * 1024).to_string())
            .parse::<usize>()
            .context("Invalid MAX_UPLOAD_BYTES")?;

        let deliberation_program = var("DELIBERATION_PROGRAM").unwrap_or_else(|| "python3".to_string());
        let deliberation_args = split_args(
            &var("DELIBERATION_ARGS")
                .unwrap_or_else(|| "main.py --juror {juror} --case {case} --run {run}".to_string()),
        );
        let deliberation_workdir = expand_tilde(&var("DELIBERATION_WORKDIR").unwrap_or_else(|| "backend".to_string()))?;
        let deliberation_artifact = var("DELIBERATION_ARTIFACT");

        let generator_program = var("GENERATOR_PROGRAM").unwrap_or_else(|| "python3".to_string());
        let generator_phase1_args =
            split_args(&var("GENERATOR_PHASE1_ARGS").unwrap_or_else(|| "generate_personas.py".to_string()));
        let generator_phase2_args =
            split_args(&var("GENERATOR_PHASE2_ARGS").unwrap_or_else(|| "build_juror.py".to_string()));
        let generator_workdir = expand_tilde(&var("GENERATOR_WORKDIR").unwrap_or_else(|| "toolbox".to_string()))?;
        let generator_phase1_evidence = var("GENERATOR_PHASE1_EVIDENCE").map(PathBuf::from);
        let generator_artifact_candidates: Vec<PathBuf> = split_list(
            &var("GENERATOR_ARTIFACT_CANDIDATES").unwrap_or_else(|| "output/juror.txt,juror.txt".to_string()),
        )
        .into_iter()
        .map(PathBuf::from)
        .collect();
        if generator_artifact_candidates.is_empty() {
            anyhow::bail!("GENERATOR_ARTIFACT_CANDIDATES must name at least one path");
        }

        let credential_files = split_list(&var("CREDENTIAL_FILES").unwrap_or_else(|| "api_key,backend/api_key".to_string()))
            .iter()
            .map(|s| expand_tilde(s))
            .collect::<Result<Vec<PathBuf>>>()?;

        let terminate_grace = Duration::from_millis(
            var("TERMINATE_GRACE_MS")
                .unwrap_or_else(|| "3000".to_string())
                .parse::<u64>()
                .context("Invalid TERMINATE_GRACE_MS")?,
        );
        let session_timeout = Duration::from_secs(
            var("SESSION_TIMEOUT_SECS")
                .unwrap_or_else(|| "300".to_string())
                .parse::<u64>()
                .context("Invalid SESSION_TIMEOUT_SECS")?,
        );
        let pty_poll_interval = Duration::from_millis(
            var("PTY_POLL_MS")
                .unwrap_or_else(|| "100".to_string())
                .parse::<u64>()
                .context("Invalid PTY_POLL_MS")?,
        );
        let overall_retry_cap = var("OVERALL_RETRY_CAP")
            .unwrap_or_else(|| "50".to_string())
            .parse::<usize>()
            .context("Invalid OVERALL_RETRY_CAP")?;
        if overall_retry_cap == 0 {
            warn!("OVERALL_RETRY_CAP is 0; treating it as 1 draw per round.");
        }

        let max_total_rounds = var("MAX_TOTAL_ROUNDS")
            .unwrap_or_else(|| "10000".to_string())
            .parse::<usize>()
            .context("Invalid MAX_TOTAL_ROUNDS")?;
        let unclaimed_session_grace = Duration::from_secs(
            var("UNCLAIMED_SESSION_SECS")
                .unwrap_or_else(|| "60".to_string())
                .parse::<u64>()
                .context("Invalid UNCLAIMED_SESSION_SECS")?,
        );

        let run_log_file = match var("RUN_LOG_FILE") {
            Some(path) => expand_tilde(&path)?,
            None => upload_root.join(".logs").join("runs.log"),
        };
        let run_log_max_size_bytes = var("RUN_LOG_MAX_SIZE_MB")
            .unwrap_or_else(|| "10".to_string()) // Default 10 MB
            .parse::<u64>()
            .map(|mb| mb * 1024 * 1024)
            .unwrap_or(10 * 1024 * 1024);

        Ok(Config {
            upload_root,
            upload_root_is_temp,
            log_level,
            http_host,
            http_port,
            max_upload_bytes,
            deliberation_program,
            deliberation_args,
            deliberation_workdir,
            deliberation_artifact,
            generator_program,
            generator_phase1_args,
            generator_phase2_args,
            generator_workdir,
            generator_phase1_evidence,
            generator_artifact_candidates,
            credential_files,
            terminate_grace,
            session_timeout,
            pty_poll_interval,
            overall_retry_cap: overall_retry_cap.max(1),
            max_total_rounds,
            unclaimed_session_grace,
            run_log_file,
            run_log_max_size_bytes,
        })
    }

    pub fn juror_dir(&self) -> PathBuf {
        self.upload_root.join("jurors")
    }

    pub fn case_dir(&self) -> PathBuf {
        self.upload_root.join("cases")
    }
}
