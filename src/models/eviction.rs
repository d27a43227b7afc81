//! Eviction policies for the model cache.
//!
//! A policy is a pure decision over a snapshot of resident entries: given the
//! candidates and the megabytes that must be freed, it names the victims in
//! eviction order. Only the cache applies the decision.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::cache::ModelInfo;

/// Chooses which resident entries to evict.
pub trait EvictionPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Ids to evict, in order, whose requirements sum to at least
    /// `required_mb` when the candidates allow it.
    fn select_victims(&self, candidates: &[ModelInfo], required_mb: u64) -> Vec<String>;
}

/// Selectable policy, as named in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicyKind {
    #[default]
    Recency,
    Scored,
}

impl EvictionPolicyKind {
    pub fn build(self) -> Arc<dyn EvictionPolicy> {
        match self {
            Self::Recency => Arc::new(RecencyPolicy),
            Self::Scored => Arc::new(ScoredPolicy::default()),
        }
    }
}

impl std::str::FromStr for EvictionPolicyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "recency" | "lru" => Ok(Self::Recency),
            "scored" | "intelligent" => Ok(Self::Scored),
            other => Err(format!("unknown eviction policy: {other}")),
        }
    }
}

/// Take victims from `ordered` until `required_mb` is covered.
fn take_until_covered<'a>(ordered: impl Iterator<Item = &'a ModelInfo>, required_mb: u64) -> Vec<String> {
    let mut freed = 0u64;
    let mut victims = Vec::new();
    for info in ordered {
        if freed >= required_mb {
            break;
        }
        freed += info.memory_requirement_mb;
        victims.push(info.model_id.clone());
    }
    victims
}

/// Least-recently-used first.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecencyPolicy;

impl EvictionPolicy for RecencyPolicy {
    fn name(&self) -> &'static str {
        "recency"
    }

    fn select_victims(&self, candidates: &[ModelInfo], required_mb: u64) -> Vec<String> {
        let mut ordered: Vec<&ModelInfo> = candidates.iter().collect();
        ordered.sort_by(|a, b| {
            a.last_access
                .cmp(&b.last_access)
                .then(a.last_access_seq.cmp(&b.last_access_seq))
                .then_with(|| a.model_id.cmp(&b.model_id))
        });
        take_until_covered(ordered.into_iter(), required_mb)
    }
}

/// Weights of the scored policy's composite.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub frequency: f64,
    pub size: f64,
    pub load_time: f64,
    pub priority: f64,
    /// Window that access counts are normalised against.
    pub history_horizon: Duration,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            frequency: 0.4,
            size: 0.2,
            load_time: 0.2,
            priority: 0.2,
            history_horizon: Duration::from_secs(3600),
        }
    }
}

/// Breakdown of one entry's composite score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UsageScore {
    pub frequency_score: f64,
    pub size_penalty: f64,
    pub load_time_penalty: f64,
    pub priority_bonus: f64,
    pub total_score: f64,
}

/// Lowest composite value first:
/// `frequency - size_penalty - load_time_penalty + priority_bonus`.
#[derive(Debug, Clone, Default)]
pub struct ScoredPolicy {
    weights: ScoringWeights,
}

impl ScoredPolicy {
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    /// Score `info` relative to the largest and slowest-loading candidates.
    pub fn score(&self, info: &ModelInfo, peers: &ScoringPeers, now: Instant) -> UsageScore {
        let w = &self.weights;

        let frequency_score = w.frequency * access_rate_score(info, w.history_horizon, now);

        let size_penalty = if peers.max_memory_mb > 0 {
            w.size * info.memory_requirement_mb as f64 / peers.max_memory_mb as f64
        } else {
            0.0
        };

        // Cheap reloads are penalised; the slowest reload among peers gets none.
        let load_cost = if peers.max_load_duration > Duration::ZERO {
            info.load_duration.as_secs_f64() / peers.max_load_duration.as_secs_f64()
        } else {
            0.0
        };
        let load_time_penalty = w.load_time * (1.0 - load_cost.clamp(0.0, 1.0));

        let priority_bonus = w.priority * info.priority.clamp(0.0, 1.0);

        UsageScore {
            frequency_score,
            size_penalty,
            load_time_penalty,
            priority_bonus,
            total_score: frequency_score - size_penalty - load_time_penalty + priority_bonus,
        }
    }

    fn select_at(&self, candidates: &[ModelInfo], required_mb: u64, now: Instant) -> Vec<String> {
        let peers = ScoringPeers::of(candidates);
        let mut scored: Vec<(f64, &ModelInfo)> = candidates
            .iter()
            .map(|info| (self.score(info, &peers, now).total_score, info))
            .collect();
        scored.sort_by(|(sa, a), (sb, b)| {
            sa.partial_cmp(sb)
                .unwrap_or(Ordering::Equal)
                .then(a.last_access_seq.cmp(&b.last_access_seq))
                .then_with(|| a.model_id.cmp(&b.model_id))
        });
        take_until_covered(scored.into_iter().map(|(_, info)| info), required_mb)
    }
}

impl EvictionPolicy for ScoredPolicy {
    fn name(&self) -> &'static str {
        "scored"
    }

    fn select_victims(&self, candidates: &[ModelInfo], required_mb: u64) -> Vec<String> {
        self.select_at(candidates, required_mb, Instant::now())
    }
}

/// Normalisation reference taken from the whole candidate set.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoringPeers {
    pub max_memory_mb: u64,
    pub max_load_duration: Duration,
}

impl ScoringPeers {
    pub fn of(candidates: &[ModelInfo]) -> Self {
        Self {
            max_memory_mb: candidates.iter().map(|c| c.memory_requirement_mb).max().unwrap_or(0),
            max_load_duration: candidates
                .iter()
                .map(|c| c.load_duration)
                .max()
                .unwrap_or(Duration::ZERO),
        }
    }
}

/// Accesses per horizon since load, squashed into `[0, 1)`.
fn access_rate_score(info: &ModelInfo, horizon: Duration, now: Instant) -> f64 {
    let since = info.load_time.unwrap_or(info.last_access);
    let elapsed = now.saturating_duration_since(since).max(Duration::from_secs(1));
    let rate = info.access_count as f64 * horizon.as_secs_f64() / elapsed.as_secs_f64();
    rate / (rate + 1.0)
}

/// Probability-like estimate that `info` will be requested again soon.
///
/// Blends access rate, recency (one-hour half-life) and caller priority.
pub fn predict_usage_probability(info: &ModelInfo, now: Instant) -> f64 {
    let horizon = Duration::from_secs(3600);
    let frequency = access_rate_score(info, horizon, now);
    let idle = now.saturating_duration_since(info.last_access).as_secs_f64();
    let recency = 0.5f64.powf(idle / horizon.as_secs_f64());
    let priority = info.priority.clamp(0.0, 1.0);

    (0.4 * frequency + 0.3 * recency + 0.3 * priority).clamp(0.0, 1.0)
}
