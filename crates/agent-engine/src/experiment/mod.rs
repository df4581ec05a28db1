//! A/B experiments over agent variants
//!
//! Each experiment owns a set of named variants with traffic-share weights.
//! Assignment hashes a stable key (caller id when present) into `[0, 1)` and
//! maps it through cumulative weights, so the same caller lands on the same
//! variant across repeat calls within one experiment. Outcome counters are
//! per-variant atomics; concurrent completions never lose increments and no
//! global engine lock serializes unrelated calls.
//!
//! Lifecycle per experiment: `Draft -> Active <-> Paused -> Completed`. Only
//! `Active` experiments participate in routing. Pausing a single variant
//! removes it from the weight pool and re-normalizes the remaining active
//! variants; calls already assigned to it run to completion and still record
//! their outcome. Ending an experiment freezes all counters.

use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::types::{ExperimentId, TenantId, VariantId};

/// Weight tolerance accepted when validating that variant weights sum to 1.0
const WEIGHT_TOLERANCE: f64 = 1e-6;

/// z-score for a 95% Wilson score interval
const WILSON_Z: f64 = 1.96;

/// Lifecycle state of an experiment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExperimentStatus {
    Draft,
    Active,
    Paused,
    Completed,
}

/// Input description of one variant at experiment creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantSpec {
    pub id: VariantId,
    pub name: String,
    /// Traffic share in `[0, 1]`; all weights must sum to 1.0
    pub weight: f64,
}

impl VariantSpec {
    pub fn new(id: impl Into<String>, name: impl Into<String>, weight: f64) -> Self {
        Self {
            id: VariantId::new(id),
            name: name.into(),
            weight,
        }
    }
}

/// Live state of one variant: immutable spec plus atomic outcome counters
#[derive(Debug)]
struct VariantState {
    spec: VariantSpec,
    paused: AtomicBool,
    assigned: AtomicU64,
    completed: AtomicU64,
    success: AtomicU64,
}

impl VariantState {
    fn new(spec: VariantSpec) -> Self {
        Self {
            spec,
            paused: AtomicBool::new(false),
            assigned: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            success: AtomicU64::new(0),
        }
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }
}

/// One configured experiment
#[derive(Debug)]
pub struct Experiment {
    pub id: ExperimentId,
    pub tenant_id: TenantId,
    pub created_at: DateTime<Utc>,
    status: RwLock<ExperimentStatus>,
    variants: Vec<VariantState>,
}

impl Experiment {
    pub fn status(&self) -> ExperimentStatus {
        *self.status.read()
    }

    fn variant(&self, variant_id: &VariantId) -> Option<&VariantState> {
        self.variants.iter().find(|v| &v.spec.id == variant_id)
    }

    /// Map a stable key into a variant by cumulative re-normalized weight
    /// over the non-paused variants. Returns `None` if every variant is
    /// paused (guarded against at pause time).
    fn assign_key(&self, stable_key: &str) -> Option<&VariantState> {
        let active: Vec<&VariantState> =
            self.variants.iter().filter(|v| !v.is_paused()).collect();
        let total: f64 = active.iter().map(|v| v.spec.weight).sum();
        if active.is_empty() || total <= 0.0 {
            return None;
        }

        let point = hash_to_unit_interval(&self.id, stable_key);
        let mut cumulative = 0.0;
        for variant in &active {
            cumulative += variant.spec.weight / total;
            if point < cumulative {
                return Some(variant);
            }
        }
        // Floating-point edge at the top of the interval
        active.last().copied()
    }
}

/// Deterministic hash of (experiment id, stable key) into `[0, 1)`
fn hash_to_unit_interval(experiment_id: &ExperimentId, stable_key: &str) -> f64 {
    let mut hasher = DefaultHasher::new();
    experiment_id.0.hash(&mut hasher);
    stable_key.hash(&mut hasher);
    (hasher.finish() as f64) / (u64::MAX as f64 + 1.0)
}

/// Per-variant aggregate results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantResults {
    pub variant_id: VariantId,
    pub name: String,
    pub paused: bool,
    pub assigned: u64,
    pub completed: u64,
    pub success: u64,
    /// `success / assigned`, 0.0 when nothing was assigned
    pub success_rate: f64,
    /// 95% Wilson score interval for the success rate
    pub confidence_low: f64,
    pub confidence_high: f64,
}

/// Aggregate results of one experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentResults {
    pub experiment_id: ExperimentId,
    pub status: ExperimentStatus,
    pub variants: Vec<VariantResults>,
}

/// Outcome of one call recorded against its assigned variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallOutcome {
    /// The call reached `Completed` (vs. dropped/failed)
    pub completed: bool,
    /// The call counts as a success for experiment comparison
    pub success: bool,
}

/// Engine managing all experiments
#[derive(Debug, Default)]
pub struct ExperimentEngine {
    experiments: DashMap<ExperimentId, Arc<Experiment>>,
}

impl ExperimentEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an experiment in `Draft` state
    ///
    /// Variant weights must be positive and sum to 1.0 (within tolerance).
    pub fn create_experiment(
        &self,
        tenant_id: TenantId,
        variants: Vec<VariantSpec>,
    ) -> Result<ExperimentId> {
        if variants.len() < 2 {
            return Err(EngineError::config(
                "an experiment requires at least two variants",
            ));
        }
        if variants.iter().any(|v| v.weight <= 0.0) {
            return Err(EngineError::config("variant weights must be positive"));
        }
        let total: f64 = variants.iter().map(|v| v.weight).sum();
        if (total - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(EngineError::config(format!(
                "variant weights must sum to 1.0, got {total}"
            )));
        }

        let id = ExperimentId::new(format!("exp-{}", uuid::Uuid::new_v4()));
        let experiment = Experiment {
            id: id.clone(),
            tenant_id,
            created_at: Utc::now(),
            status: RwLock::new(ExperimentStatus::Draft),
            variants: variants.into_iter().map(VariantState::new).collect(),
        };
        info!(
            "created experiment {} with {} variants",
            id,
            experiment.variants.len()
        );
        self.experiments.insert(id.clone(), Arc::new(experiment));
        Ok(id)
    }

    fn experiment(&self, id: &ExperimentId) -> Result<Arc<Experiment>> {
        self.experiments
            .get(id)
            .map(|e| Arc::clone(&e))
            .ok_or_else(|| EngineError::ExperimentNotFound {
                experiment_id: id.0.clone(),
            })
    }

    /// `Draft`/`Paused` -> `Active`
    pub fn activate(&self, id: &ExperimentId) -> Result<()> {
        self.set_status(id, ExperimentStatus::Active, |status| {
            matches!(status, ExperimentStatus::Draft | ExperimentStatus::Paused)
        })
    }

    /// `Active` -> `Paused`; in-flight calls are unaffected
    pub fn pause_experiment(&self, id: &ExperimentId) -> Result<()> {
        self.set_status(id, ExperimentStatus::Paused, |status| {
            matches!(status, ExperimentStatus::Active)
        })
    }

    /// `Paused` -> `Active`
    pub fn resume_experiment(&self, id: &ExperimentId) -> Result<()> {
        self.activate(id)
    }

    fn set_status(
        &self,
        id: &ExperimentId,
        next: ExperimentStatus,
        legal: impl Fn(ExperimentStatus) -> bool,
    ) -> Result<()> {
        let experiment = self.experiment(id)?;
        let mut status = experiment.status.write();
        if !legal(*status) {
            return Err(EngineError::InvalidExperimentState {
                experiment_id: id.0.clone(),
                message: format!("cannot move from {:?} to {:?}", *status, next),
            });
        }
        debug!("experiment {}: {:?} -> {:?}", id, *status, next);
        *status = next;
        Ok(())
    }

    /// Remove one variant from the weight pool; remaining active variants
    /// re-normalize so live traffic still sums to 1.0
    pub fn pause_variant(&self, id: &ExperimentId, variant_id: &VariantId) -> Result<()> {
        let experiment = self.experiment(id)?;
        let variant =
            experiment
                .variant(variant_id)
                .ok_or_else(|| EngineError::InvalidExperimentState {
                    experiment_id: id.0.clone(),
                    message: format!("unknown variant {variant_id}"),
                })?;
        let live = experiment.variants.iter().filter(|v| !v.is_paused()).count();
        if live <= 1 && !variant.is_paused() {
            return Err(EngineError::InvalidExperimentState {
                experiment_id: id.0.clone(),
                message: "cannot pause the last active variant".to_string(),
            });
        }
        variant.paused.store(true, Ordering::Release);
        info!("experiment {}: paused variant {}", id, variant_id);
        Ok(())
    }

    /// Return a paused variant to the weight pool
    pub fn resume_variant(&self, id: &ExperimentId, variant_id: &VariantId) -> Result<()> {
        let experiment = self.experiment(id)?;
        let variant =
            experiment
                .variant(variant_id)
                .ok_or_else(|| EngineError::InvalidExperimentState {
                    experiment_id: id.0.clone(),
                    message: format!("unknown variant {variant_id}"),
                })?;
        variant.paused.store(false, Ordering::Release);
        info!("experiment {}: resumed variant {}", id, variant_id);
        Ok(())
    }

    /// Freeze the experiment and return its final results
    ///
    /// New calls fall back to plain squad routing; counters accept no
    /// further updates.
    pub fn end_experiment(&self, id: &ExperimentId) -> Result<ExperimentResults> {
        self.set_status(id, ExperimentStatus::Completed, |status| {
            matches!(status, ExperimentStatus::Active | ExperimentStatus::Paused)
        })?;
        info!("experiment {} completed", id);
        self.get_results(id)
    }

    /// Assign a variant for one call, if the tenant has an active experiment
    ///
    /// Deterministic per (experiment, stable key); increments the variant's
    /// `assigned` counter. Returns `None` when no experiment participates.
    pub fn assign(
        &self,
        tenant_id: &TenantId,
        stable_key: &str,
    ) -> Option<(ExperimentId, VariantId)> {
        // Oldest active experiment for the tenant wins, so concurrent
        // experiments don't fight over the same traffic.
        let experiment = self
            .experiments
            .iter()
            .filter(|e| {
                e.tenant_id == *tenant_id && e.status() == ExperimentStatus::Active
            })
            .map(|e| Arc::clone(e.value()))
            .min_by_key(|e| (e.created_at, e.id.0.clone()))?;

        let variant = experiment.assign_key(stable_key)?;
        variant.assigned.fetch_add(1, Ordering::AcqRel);
        debug!(
            "experiment {}: assigned key {:?} to variant {}",
            experiment.id, stable_key, variant.spec.id
        );
        Some((experiment.id.clone(), variant.spec.id.clone()))
    }

    /// Record one call's outcome against its assigned variant
    ///
    /// Atomic; concurrent completions never lose increments. Rejected once
    /// the experiment is `Completed` (counters are frozen) or still `Draft`.
    pub fn record_outcome(
        &self,
        id: &ExperimentId,
        variant_id: &VariantId,
        outcome: CallOutcome,
    ) -> Result<()> {
        let experiment = self.experiment(id)?;
        match experiment.status() {
            ExperimentStatus::Draft => {
                return Err(EngineError::InvalidExperimentState {
                    experiment_id: id.0.clone(),
                    message: "experiment has not started".to_string(),
                });
            }
            ExperimentStatus::Completed => {
                return Err(EngineError::InvalidExperimentState {
                    experiment_id: id.0.clone(),
                    message: "experiment has ended; counters are frozen".to_string(),
                });
            }
            ExperimentStatus::Active | ExperimentStatus::Paused => {}
        }
        let variant =
            experiment
                .variant(variant_id)
                .ok_or_else(|| EngineError::InvalidExperimentState {
                    experiment_id: id.0.clone(),
                    message: format!("unknown variant {variant_id}"),
                })?;
        if outcome.completed {
            variant.completed.fetch_add(1, Ordering::AcqRel);
        }
        if outcome.success {
            variant.success.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Read-only aggregate results with a 95% Wilson interval per variant
    pub fn get_results(&self, id: &ExperimentId) -> Result<ExperimentResults> {
        let experiment = self.experiment(id)?;
        let variants = experiment
            .variants
            .iter()
            .map(|v| {
                let assigned = v.assigned.load(Ordering::Acquire);
                let completed = v.completed.load(Ordering::Acquire);
                let success = v.success.load(Ordering::Acquire);
                let rate = if assigned > 0 {
                    success as f64 / assigned as f64
                } else {
                    0.0
                };
                let (low, high) = wilson_interval(success, assigned);
                VariantResults {
                    variant_id: v.spec.id.clone(),
                    name: v.spec.name.clone(),
                    paused: v.is_paused(),
                    assigned,
                    completed,
                    success,
                    success_rate: rate,
                    confidence_low: low,
                    confidence_high: high,
                }
            })
            .collect();
        Ok(ExperimentResults {
            experiment_id: experiment.id.clone(),
            status: experiment.status(),
            variants,
        })
    }
}

/// 95% Wilson score interval for `successes` out of `trials`
fn wilson_interval(successes: u64, trials: u64) -> (f64, f64) {
    if trials == 0 {
        return (0.0, 1.0);
    }
    let n = trials as f64;
    let p = successes as f64 / n;
    let z = WILSON_Z;
    let z2 = z * z;
    let denom = 1.0 + z2 / n;
    let center = p + z2 / (2.0 * n);
    let half = z * (p * (1.0 - p) / n + z2 / (4.0 * n * n)).sqrt();
    (
        ((center - half) / denom).max(0.0),
        ((center + half) / denom).min(1.0),
    )
}
