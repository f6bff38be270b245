use crate::error::AppError;
use crate::tools::filestore_tool::Artifact;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;
use tracing::{debug, instrument};

pub const DEFAULT_RETRY_CAP: usize = 50;
pub const DEFAULT_MAX_ROUNDS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleMode {
    /// Every juror against every case, once.
    Individual,
    /// Weighted random draws for a fixed number of rounds.
    Overall,
}

impl FromStr for ScheduleMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "individual" => Ok(ScheduleMode::Individual),
            "overall" => Ok(ScheduleMode::Overall),
            _ => Err(AppError::InvalidInput(format!("Unknown scheduling mode: {}", s))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionPair {
    pub run_number: usize,
    pub total_runs: usize,
    pub juror: Artifact,
    pub case: Artifact,
}

#[derive(Debug, Clone)]
pub struct PairScheduler {
    retry_cap: usize,
    max_rounds: usize,
}

impl Default for PairScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_CAP)
    }
}

impl PairScheduler {
    pub fn new(retry_cap: usize) -> Self {
        Self {
            retry_cap: retry_cap.max(1),
            max_rounds: DEFAULT_MAX_ROUNDS,
        }
    }

    /// Upper bound on `total_rounds` accepted in overall mode.
    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    /// Schedules with a reproducible stream when `seed` is given, OS entropy otherwise.
    pub fn schedule_seeded(
        &self,
        jurors: &[Artifact],
        cases: &[Artifact],
        mode: ScheduleMode,
        total_rounds: i64,
        seed: Option<u64>,
    ) -> Result<Vec<ExecutionPair>, AppError> {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        self.schedule(jurors, cases, mode, total_rounds, &mut rng)
    }

    #[instrument(skip(self, jurors, cases, rng), fields(jurors = jurors.len(), cases = cases.len()))]
    pub fn schedule<R: Rng>(
        &self,
        jurors: &[Artifact],
        cases: &[Artifact],
        mode: ScheduleMode,
        total_rounds: i64,
        rng: &mut R,
    ) -> Result<Vec<ExecutionPair>, AppError> {
        if jurors.is_empty() {
            return Err(AppError::InvalidInput("No juror files available".to_string()));
        }
        if cases.is_empty() {
            return Err(AppError::InvalidInput("No case files available".to_string()));
        }

        let combos = match mode {
            ScheduleMode::Individual => jurors
                .iter()
                .enumerate()
                .flat_map(|(j, _)| (0..cases.len()).map(move |c| (j, c)))
                .collect::<Vec<_>>(),
            ScheduleMode::Overall => self.draw_weighted(jurors, cases, total_rounds, rng)?,
        };

        let total_runs = combos.len();
        debug!(?mode, total_runs, "Scheduled execution pairs");
        Ok(combos
            .into_iter()
            .enumerate()
            .map(|(i, (j, c))| ExecutionPair {
                run_number: i + 1,
                total_runs,
                juror: jurors[j].clone(),
                case: cases[c].clone(),
            })
            .collect())
    }

    fn draw_weighted<R: Rng>(
        &self,
        jurors: &[Artifact],
        cases: &[Artifact],
        total_rounds: i64,
        rng: &mut R,
    ) -> Result<Vec<(usize, usize)>, AppError> {
        let juror_dist = weighted_index(jurors)?;
        let case_dist = weighted_index(cases)?;
        if total_rounds <= 0 {
            return Ok(Vec::new());
        }
        if total_rounds as u64 > self.max_rounds as u64 {
            return Err(AppError::InvalidInput(format!(
                "total_rounds {} exceeds the maximum of {}",
                total_rounds, self.max_rounds
            )));
        }

        let mut used = HashSet::new();
        let mut picks = Vec::new();
        for round in 0..total_rounds {
            let mut attempt = 0;
            let pick = loop {
                attempt += 1;
                let candidate = (juror_dist.sample(rng), case_dist.sample(rng));
                if !used.contains(&candidate) || attempt >= self.retry_cap {
                    break candidate;
                }
            };
            if used.contains(&pick) {
                debug!(round = round + 1, attempts = attempt, "No unused combination found; accepting duplicate");
            }
            used.insert(pick);
            picks.push(pick);
        }
        Ok(picks)
    }
}

/// Cumulative-weight sampler; an artifact's chance is its weight over the total.
fn weighted_index(artifacts: &[Artifact]) -> Result<WeightedIndex<u64>, AppError> {
    if let Some(artifact) = artifacts.iter().find(|a| a.weight < 1) {
        return Err(AppError::InvalidInput(format!(
            "Weight for '{}' must be at least 1",
            artifact.name
        )));
    }
    WeightedIndex::new(artifacts.iter().map(|a| u64::from(a.weight)))
        .map_err(|e| AppError::InvalidInput(format!("Invalid weights: {}", e)))
}
