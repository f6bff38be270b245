use crate::config::Config;
use crate::error::AppError;
use crate::events::{EventSink, StreamEvent};
use crate::tools::filestore_tool::{ArtifactStore, Category};
use crate::tools::process_tool::{ProcessRunner, RunEvent, RunSpec, RunStatus};
use crate::tools::schedule_tool::{ExecutionPair, PairScheduler, ScheduleMode};
use crate::utils::credentials::{resolve_api_key, ApiKey, CHILD_ENV_VAR};
use crate::utils::path_utils::{canonical_or_lexical, resolve_against};
use crate::utils::run_logger::RunLogger;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct RunBatchParams {
    #[serde(default = "default_mode")]
    pub mode: ScheduleMode,
    #[serde(default = "default_rounds")]
    pub total_rounds: i64,
    pub seed: Option<u64>,
}
fn default_mode() -> ScheduleMode { ScheduleMode::Individual }
fn default_rounds() -> i64 { 3 }

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub crashed: usize,
    pub cancelled: usize,
    pub skipped: usize,
    pub not_started: usize,
}

/// Runs scheduled juror/case pairs one at a time through the external deliberation program.
pub struct DeliberationManager {
    config: Arc<Config>,
    store: Arc<dyn ArtifactStore>,
    runner: ProcessRunner,
    scheduler: PairScheduler,
    run_logger: RunLogger,
}

fn substitute(template: &str, pair: &ExecutionPair, juror_path: &Path, case_path: &Path) -> String {
    template
        .replace("{juror}", &juror_path.display().to_string())
        .replace("{case}", &case_path.display().to_string())
        .replace("{juror_name}", &pair.juror.name)
        .replace("{case_name}", &pair.case.name)
        .replace("{run}", &pair.run_number.to_string())
        .replace("{total}", &pair.total_runs.to_string())
}

impl DeliberationManager {
    pub fn new(config: Arc<Config>, store: Arc<dyn ArtifactStore>, runner: ProcessRunner) -> Self {
        Self {
            scheduler: PairScheduler::new(config.overall_retry_cap).with_max_rounds(config.max_total_rounds),
            run_logger: RunLogger::new(config.clone()),
            config,
            store,
            runner,
        }
    }

    fn workdir(&self) -> PathBuf {
        let base = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        canonical_or_lexical(&resolve_against(&base, &self.config.deliberation_workdir))
    }

    fn build_spec(
        &self,
        pair: &ExecutionPair,
        juror_path: &Path,
        case_path: &Path,
        api_key: Option<&ApiKey>,
    ) -> RunSpec {
        let workdir = self.workdir();
        let mut spec = RunSpec::new(self.config.deliberation_program.clone())
            .args(
                self.config
                    .deliberation_args
                    .iter()
                    .map(|arg| substitute(arg, pair, juror_path, case_path)),
            )
            .cwd(&workdir)
            .env("PYTHONUNBUFFERED", "1")
            .env("JURY_RUN_NUMBER", pair.run_number.to_string())
            .env("JURY_TOTAL_RUNS", pair.total_runs.to_string());
        if let Some(key) = api_key {
            spec = spec.env(CHILD_ENV_VAR, key.expose());
        }
        if let Some(template) = &self.config.deliberation_artifact {
            let artifact = substitute(template, pair, juror_path, case_path);
            spec = spec.expected_artifact(resolve_against(&workdir, Path::new(&artifact)));
        }
        spec
    }

    /// Schedules and runs a whole batch. Per-pair failures are reported and never abort the batch.
    #[instrument(skip(self, params, sink), fields(mode = ?params.mode, total_rounds = params.total_rounds))]
    pub async fn run_batch(&self, params: &RunBatchParams, sink: &dyn EventSink) -> Result<BatchSummary, AppError> {
        let batch_id = Uuid::new_v4().simple().to_string();
        let stop_generation = self.runner.registry().stop_generation();

        let jurors = self.store.list_artifacts(Category::Juror).await?;
        let cases = self.store.list_artifacts(Category::Case).await?;
        let pairs = match self
            .scheduler
            .schedule_seeded(&jurors, &cases, params.mode, params.total_rounds, params.seed)
        {
            Ok(pairs) => pairs,
            Err(e) => {
                sink.emit(StreamEvent::error(e.to_string())).await;
                return Err(e);
            }
        };

        let api_key = resolve_api_key(&self.workdir(), &self.config.credential_files);
        let mut summary = BatchSummary {
            total: pairs.len(),
            ..Default::default()
        };
        info!(batch_id = %batch_id, total = pairs.len(), "Starting deliberation batch");
        sink.emit(
            StreamEvent::started(format!(
                "Starting {} deliberation runs ({} jurors, {} cases)",
                pairs.len(),
                jurors.len(),
                cases.len()
            ))
            .with_extra(json!({ "batch_id": batch_id, "total_runs": pairs.len() })),
        )
        .await;

        for (idx, pair) in pairs.iter().enumerate() {
            if self.runner.registry().stop_generation() != stop_generation {
                summary.not_started = pairs.len() - idx;
                sink.emit(StreamEvent::warning(format!(
                    "Stop requested; {} remaining runs not started",
                    summary.not_started
                )))
                .await;
                break;
            }
            if sink.is_closed() {
                summary.not_started = pairs.len() - idx;
                warn!(batch_id = %batch_id, remaining = summary.not_started, "Client disconnected; abandoning batch");
                break;
            }

            let (status, exit_code) = self.run_pair(pair, api_key.as_ref(), sink).await;
            match status {
                None => summary.skipped += 1,
                Some(RunStatus::Completed) => summary.completed += 1,
                Some(RunStatus::Failed) => summary.failed += 1,
                Some(RunStatus::Crashed) => summary.crashed += 1,
                Some(RunStatus::Cancelled) => summary.cancelled += 1,
                Some(RunStatus::Running) => {}
            }
            if let Some(status) = status {
                self.run_logger.log_run(&batch_id, pair, status, exit_code).await;
            }
        }

        info!(batch_id = %batch_id, ?summary, "Deliberation batch finished");
        sink.emit(
            StreamEvent::completed(format!(
                "Batch finished: {} completed, {} failed, {} crashed, {} cancelled, {} skipped",
                summary.completed, summary.failed, summary.crashed, summary.cancelled, summary.skipped
            ))
            .with_extra(json!({ "batch_id": batch_id, "summary": summary })),
        )
        .await;
        Ok(summary)
    }

    /// Returns `None` when the pair was skipped without launching a process.
    async fn run_pair(
        &self,
        pair: &ExecutionPair,
        api_key: Option<&ApiKey>,
        sink: &dyn EventSink,
    ) -> (Option<RunStatus>, Option<i32>) {
        let run_tag = json!({ "run_number": pair.run_number, "total_runs": pair.total_runs });
        let juror_path = self.store.path_for(Category::Juror, &pair.juror.name);
        let case_path = self.store.path_for(Category::Case, &pair.case.name);
        for path in [&juror_path, &case_path] {
            if !path.exists() {
                warn!(run_number = pair.run_number, path = %path.display(), "Scheduled file disappeared; skipping run");
                sink.emit(
                    StreamEvent::warning(format!(
                        "Run {}/{} skipped: {} no longer exists",
                        pair.run_number,
                        pair.total_runs,
                        path.display()
                    ))
                    .with_extra(run_tag.clone()),
                )
                .await;
                return (None, None);
            }
        }

        sink.emit(
            StreamEvent::started(format!(
                "Run {}/{}: juror {} on case {}",
                pair.run_number, pair.total_runs, pair.juror.name, pair.case.name
            ))
            .with_extra(json!({
                "run_number": pair.run_number,
                "total_runs": pair.total_runs,
                "juror": pair.juror.name,
                "case": pair.case.name,
            })),
        )
        .await;

        let spec = self.build_spec(pair, &juror_path, &case_path, api_key);
        let mut stream = match self.runner.run(spec) {
            Ok(stream) => stream,
            Err(e) => {
                sink.emit(StreamEvent::error(format!("Run {} could not start: {}", pair.run_number, e)).with_extra(run_tag))
                    .await;
                return (Some(RunStatus::Failed), None);
            }
        };

        while let Some(event) = stream.next().await {
            match event {
                RunEvent::Line(line) => sink.emit(StreamEvent::output(line).with_extra(run_tag.clone())).await,
                RunEvent::Finished(outcome) => {
                    let event = match outcome.status {
                        RunStatus::Completed if outcome.soft_success => StreamEvent::warning(format!(
                            "Run {} crashed but produced its output; treating as success",
                            pair.run_number
                        )),
                        RunStatus::Completed => {
                            StreamEvent::completed(format!("Run {} completed", pair.run_number))
                        }
                        RunStatus::Failed => {
                            let err = AppError::ProcessFailure {
                                exit_code: outcome.exit_code.unwrap_or(-1),
                            };
                            StreamEvent::error(format!("Run {} failed: {}", pair.run_number, err))
                        }
                        RunStatus::Crashed => {
                            let err = AppError::ProcessCrash("terminated by a signal".to_string());
                            StreamEvent::warning(format!("Run {}: {}", pair.run_number, err))
                        }
                        RunStatus::Cancelled | RunStatus::Running => {
                            StreamEvent::warning(format!("Run {} cancelled", pair.run_number))
                        }
                    };
                    sink.emit(event.with_extra(json!({
                        "run_number": pair.run_number,
                        "total_runs": pair.total_runs,
                        "exit_code": outcome.exit_code,
                        "soft_success": outcome.soft_success,
                    })))
                    .await;
                    return (Some(outcome.status), outcome.exit_code);
                }
            }
        }
        (Some(RunStatus::Crashed), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::config_for;
    use crate::events::tests::RecordingSink;
    use crate::events::EventStatus;
    use crate::tools::filestore_tool::{Artifact, ArtifactMetadata, FileStore, UploadBatchParams, UploadFileParams};
    use crate::tools::process_tool::ProcessRegistry;
    use async_trait::async_trait;
    use std::time::Duration;

    const SCRIPT: &str = "echo \"juror=$1 case=$2 run=$3\"\ncase \"$3\" in\n  2) exit 3 ;;\nesac\n";

    fn manager_with(dir: &Path, script: &str) -> (DeliberationManager, Arc<FileStore>, ProcessRunner) {
        std::fs::write(dir.join("deliberate.sh"), script).unwrap();
        let root = dir.join("uploads");
        let config = Arc::new(config_for(
            &root,
            &[
                ("DELIBERATION_PROGRAM", "/bin/sh"),
                ("DELIBERATION_ARGS", "deliberate.sh {juror_name} {case_name} {run}"),
                ("DELIBERATION_WORKDIR", dir.to_str().unwrap()),
                ("CREDENTIAL_FILES", "missing_key"),
            ],
        ));
        let store = Arc::new(FileStore::new(config.clone()).unwrap());
        let runner = ProcessRunner::new(Arc::new(ProcessRegistry::new()), Duration::from_millis(300));
        (DeliberationManager::new(config, store.clone(), runner.clone()), store, runner)
    }

    fn file(name: &str, category: Category) -> UploadFileParams {
        UploadFileParams {
            filename: name.to_string(),
            category,
            weight: 100,
            content: Some(format!("{} body", name)),
        }
    }

    fn individual() -> RunBatchParams {
        RunBatchParams {
            mode: ScheduleMode::Individual,
            total_rounds: 0,
            seed: None,
        }
    }

    #[tokio::test]
    async fn failed_pair_does_not_abort_batch() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, store, _) = manager_with(dir.path(), SCRIPT);
        store
            .replace_batch(&UploadBatchParams {
                files: vec![
                    file("alice.txt", Category::Juror),
                    file("c1.md", Category::Case),
                    file("c2.md", Category::Case),
                    file("c3.md", Category::Case),
                ],
            })
            .await
            .unwrap();

        let sink = RecordingSink::default();
        let summary = manager.run_batch(&individual(), &sink).await.unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.failed, 1);

        let events = sink.snapshot();
        let outputs: Vec<&str> = events
            .iter()
            .filter(|e| e.status == EventStatus::Output)
            .map(|e| e.message.as_str())
            .collect();
        assert_eq!(
            outputs,
            vec![
                "juror=alice.txt case=c1.md run=1",
                "juror=alice.txt case=c2.md run=2",
                "juror=alice.txt case=c3.md run=3",
            ]
        );
        let failure = events.iter().find(|e| e.status == EventStatus::Error).unwrap();
        assert_eq!(failure.extra.as_ref().unwrap()["exit_code"], 3);
        assert_eq!(events.last().unwrap().status, EventStatus::Completed);
    }

    #[tokio::test]
    async fn empty_store_reports_input_error() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _, _) = manager_with(dir.path(), SCRIPT);
        let sink = RecordingSink::default();
        let err = manager.run_batch(&individual(), &sink).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
        assert_eq!(sink.snapshot()[0].status, EventStatus::Error);
    }

    struct StaleStore {
        inner: Arc<FileStore>,
    }

    #[async_trait]
    impl ArtifactStore for StaleStore {
        async fn list_artifacts(&self, category: Category) -> Result<Vec<Artifact>, AppError> {
            let mut listed = self.inner.list_artifacts(category).await?;
            if category == Category::Juror {
                listed.push(Artifact::new("ghost.txt", Category::Juror, 100));
            }
            Ok(listed)
        }
        async fn get_metadata(&self, category: Category, name: &str) -> Option<ArtifactMetadata> {
            self.inner.get_metadata(category, name).await
        }
        async fn store_metadata(&self, name: &str, category: Category, weight: u32, generated: bool) {
            self.inner.store_metadata(name, category, weight, generated).await
        }
        fn path_for(&self, category: Category, name: &str) -> PathBuf {
            self.inner.path_for(category, name)
        }
        async fn import_generated(&self, source: &Path) -> Result<Artifact, AppError> {
            self.inner.import_generated(source).await
        }
    }

    #[tokio::test]
    async fn stale_listing_is_skipped_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        let (plain, store, runner) = manager_with(dir.path(), "echo ok\n");
        store
            .replace_batch(&UploadBatchParams {
                files: vec![file("alice.txt", Category::Juror), file("c1.md", Category::Case)],
            })
            .await
            .unwrap();
        let manager = DeliberationManager::new(plain.config.clone(), Arc::new(StaleStore { inner: store }), runner);

        let sink = RecordingSink::default();
        let summary = manager.run_batch(&individual(), &sink).await.unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.skipped, 1);
        assert!(sink
            .snapshot()
            .iter()
            .any(|e| e.status == EventStatus::Warning && e.message.contains("ghost.txt")));
    }

    #[tokio::test]
    async fn stop_request_cancels_current_run_and_skips_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, store, runner) = manager_with(dir.path(), "echo running\nexec sleep 30\n");
        store
            .replace_batch(&UploadBatchParams {
                files: vec![
                    file("alice.txt", Category::Juror),
                    file("bob.txt", Category::Juror),
                    file("c1.md", Category::Case),
                ],
            })
            .await
            .unwrap();

        let manager = Arc::new(manager);
        let sink = Arc::new(RecordingSink::default());
        let batch = {
            let manager = manager.clone();
            let sink = sink.clone();
            tokio::spawn(async move { manager.run_batch(&individual(), sink.as_ref()).await })
        };
        while runner.registry().active_count() == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(runner.cancel_all().await, 1);

        let summary = batch.await.unwrap().unwrap();
        assert_eq!(summary.cancelled, 1);
        assert_eq!(summary.not_started, 1);
        assert_eq!(runner.registry().active_count(), 0);
    }

    #[test]
    fn placeholders_are_substituted() {
        let pair = ExecutionPair {
            run_number: 2,
            total_runs: 5,
            juror: Artifact::new("j.txt", Category::Juror, 100),
            case: Artifact::new("c.txt", Category::Case, 100),
        };
        let out = substitute(
            "--juror={juror} --case={case} {juror_name}/{case_name} {run}/{total}",
            &pair,
            Path::new("/u/jurors/j.txt"),
            Path::new("/u/cases/c.txt"),
        );
        assert_eq!(out, "--juror=/u/jurors/j.txt --case=/u/cases/c.txt j.txt/c.txt 2/5");
    }
}
