//! Topological step scheduler.
//!
//! Runs plan steps as their dependencies complete, with a bound on how many
//! run at once. A failed step never takes its dependents down silently:
//! every step ends with a record, `Skipped` ones naming the failure that
//! blocked them.

use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeSet, VecDeque};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{InfraError, ReconcileError};

use super::plan::PlanStep;

/// Runs plan steps in dependency order.
#[derive(Debug, Clone)]
pub struct Scheduler {
    /// Maximum number of steps in flight.
    parallelism: usize,
    /// Whether to keep launching independent steps after a failure.
    continue_on_error: bool,
    /// Stops new launches when cancelled.
    cancel: CancellationToken,
}

/// Final state of one step.
#[derive(Debug)]
pub enum StepStatus<T> {
    /// The step ran and succeeded.
    Succeeded(T),
    /// The step ran and failed.
    Failed(InfraError),
    /// The step never ran.
    Skipped(ReconcileError),
}

/// Record of one step.
#[derive(Debug)]
pub struct StepRecord<T> {
    /// Final state.
    pub status: StepStatus<T>,
    /// Launch order, starting at 1. `None` for skipped steps.
    pub sequence: Option<usize>,
    /// Time the step took.
    pub duration: Duration,
}

impl Scheduler {
    /// Creates a scheduler running at most `parallelism` steps at once.
    #[must_use]
    pub fn new(parallelism: usize) -> Self {
        Self {
            parallelism: parallelism.max(1),
            continue_on_error: true,
            cancel: CancellationToken::new(),
        }
    }

    /// Creates a scheduler from engine settings.
    #[must_use]
    pub fn from_engine(engine: &EngineConfig) -> Self {
        Self::new(engine.parallelism).with_continue_on_error(engine.continue_on_error)
    }

    /// Sets whether to keep going after a failure.
    #[must_use]
    pub const fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    /// Uses `cancel` to stop launching steps.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Maximum number of steps in flight.
    #[must_use]
    pub const fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Runs `steps`, calling `execute` with the index of each step once all
    /// of its dependencies have succeeded.
    ///
    /// Returns one record per step, in step order.
    pub async fn run<T, F, Fut>(&self, steps: &[PlanStep], execute: F) -> Vec<StepRecord<T>>
    where
        F: Fn(usize) -> Fut,
        Fut: Future<Output = Result<T, InfraError>>,
    {
        let count = steps.len();
        let mut waiting: Vec<usize> = steps.iter().map(|s| s.dependencies.len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
        for (index, step) in steps.iter().enumerate() {
            for &dependency in &step.dependencies {
                if let Some(list) = dependents.get_mut(dependency) {
                    list.push(index);
                }
            }
        }

        let mut ready: BTreeSet<usize> = (0..count).filter(|&i| waiting[i] == 0).collect();
        let mut records: Vec<Option<StepRecord<T>>> = (0..count).map(|_| None).collect();
        let mut in_flight = FuturesUnordered::new();
        let mut sequence = 0;
        let mut stop_reason: Option<&'static str> = None;

        info!("Scheduling {count} steps (parallelism {})", self.parallelism);

        loop {
            if stop_reason.is_none() && self.cancel.is_cancelled() {
                warn!("Run cancelled, no further steps will start");
                stop_reason = Some("run cancelled");
            }

            while stop_reason.is_none() && in_flight.len() < self.parallelism {
                let Some(index) = ready.pop_first() else {
                    break;
                };
                sequence += 1;
                let launched = sequence;
                debug!("Starting step {index}: {}", steps[index].description());
                let future = execute(index);
                in_flight.push(async move {
                    let started = Instant::now();
                    let result = future.await;
                    (index, launched, started.elapsed(), result)
                });
            }

            let Some((index, launched, duration, result)) = in_flight.next().await else {
                break;
            };

            match result {
                Ok(value) => {
                    debug!("Step {index} finished in {duration:?}");
                    records[index] = Some(StepRecord {
                        status: StepStatus::Succeeded(value),
                        sequence: Some(launched),
                        duration,
                    });
                    for &dependent in &dependents[index] {
                        waiting[dependent] = waiting[dependent].saturating_sub(1);
                        if waiting[dependent] == 0 && records[dependent].is_none() {
                            ready.insert(dependent);
                        }
                    }
                }
                Err(err) => {
                    warn!("Step {} failed: {err}", steps[index].description());
                    records[index] = Some(StepRecord {
                        status: StepStatus::Failed(err),
                        sequence: Some(launched),
                        duration,
                    });
                    skip_dependents(steps, &dependents, index, &mut records);
                    if !self.continue_on_error && stop_reason.is_none() {
                        stop_reason = Some("stopped after the first failure");
                    }
                }
            }
        }

        let reason = stop_reason.unwrap_or("dependencies never completed");
        records
            .into_iter()
            .map(|record| {
                record.unwrap_or_else(|| StepRecord {
                    status: StepStatus::Skipped(ReconcileError::Aborted {
                        reason: reason.to_string(),
                    }),
                    sequence: None,
                    duration: Duration::ZERO,
                })
            })
            .collect()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::from_engine(&EngineConfig::default())
    }
}

/// Marks every transitive dependent of `failed` as skipped.
fn skip_dependents<T>(
    steps: &[PlanStep],
    dependents: &[Vec<usize>],
    failed: usize,
    records: &mut [Option<StepRecord<T>>],
) {
    let origin = &steps[failed].resource;
    let mut queue: VecDeque<usize> = dependents[failed].iter().copied().collect();

    while let Some(index) = queue.pop_front() {
        if records[index].is_some() {
            continue;
        }
        debug!("Skipping step {index}: {origin} failed");
        records[index] = Some(StepRecord {
            status: StepStatus::Skipped(ReconcileError::DependencyFailed {
                resource: steps[index].resource.clone(),
                dependency: origin.clone(),
            }),
            sequence: None,
            duration: Duration::ZERO,
        });
        queue.extend(dependents[index].iter().copied());
    }
}

impl<T> StepStatus<T> {
    /// Returns true if the step succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    /// Returns true if the step failed.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Returns true if the step was skipped.
    #[must_use]
    pub const fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::planner::StepKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn step(name: &str, dependencies: &[usize]) -> PlanStep {
        PlanStep {
            kind: StepKind::Create,
            resource: name.to_string(),
            type_token: String::from("test:index:Thing"),
            target_id: None,
            dependencies: dependencies.to_vec(),
        }
    }

    fn fail(name: &str) -> InfraError {
        ProviderError::Rejected {
            status: 400,
            message: format!("{name} rejected"),
        }
        .into()
    }

    #[tokio::test]
    async fn test_dependencies_complete_first() {
        let steps = vec![step("rg", &[]), step("sa", &[0]), step("share", &[1]), step("ws", &[0])];
        let finished = Arc::new(Mutex::new(Vec::new()));

        let records = Scheduler::new(4)
            .run(&steps, |i| {
                let finished = finished.clone();
                async move {
                    tokio::task::yield_now().await;
                    finished.lock().unwrap().push(i);
                    Ok::<_, InfraError>(i)
                }
            })
            .await;

        let order = finished.lock().unwrap().clone();
        let position = |i: usize| order.iter().position(|&x| x == i).unwrap();
        assert!(position(0) < position(1));
        assert!(position(1) < position(2));
        assert!(position(0) < position(3));
        assert!(records.iter().all(|r| r.status.is_success()));
        assert_eq!(records[0].sequence, Some(1));
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let steps: Vec<PlanStep> = (0..12).map(|i| step(&format!("r{i}"), &[])).collect();
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        Scheduler::new(3)
            .run(&steps, |_| {
                let current = current.clone();
                let peak = peak.clone();
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, InfraError>(())
                }
            })
            .await;

        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_only() {
        let steps = vec![
            step("rg", &[]),
            step("registry", &[0]),
            step("image", &[1]),
            step("ws", &[]),
        ];

        let records = Scheduler::new(2)
            .run(&steps, |i| async move {
                if i == 1 { Err(fail("registry")) } else { Ok(i) }
            })
            .await;

        assert!(records[0].status.is_success());
        assert!(records[1].status.is_failed());
        assert!(records[3].status.is_success());
        match &records[2].status {
            StepStatus::Skipped(ReconcileError::DependencyFailed { resource, dependency }) => {
                assert_eq!(resource, "image");
                assert_eq!(dependency, "registry");
            }
            other => panic!("expected skip, got {other:?}"),
        }
        assert_eq!(records[2].sequence, None);
    }

    #[tokio::test]
    async fn test_transitive_skip_names_root_failure() {
        let steps = vec![step("a", &[]), step("b", &[0]), step("c", &[1])];
        let records = Scheduler::new(1)
            .run(&steps, |i| async move { if i == 0 { Err(fail("a")) } else { Ok(()) } })
            .await;

        match &records[2].status {
            StepStatus::Skipped(ReconcileError::DependencyFailed { dependency, .. }) => {
                assert_eq!(dependency, "a");
            }
            other => panic!("expected skip, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stop_on_first_failure() {
        let steps = vec![step("a", &[]), step("b", &[]), step("c", &[])];
        let records = Scheduler::new(1)
            .with_continue_on_error(false)
            .run(&steps, |i| async move { if i == 0 { Err(fail("a")) } else { Ok(()) } })
            .await;

        assert!(records[0].status.is_failed());
        assert!(records[1].status.is_skipped());
        assert!(records[2].status.is_skipped());
    }

    #[tokio::test]
    async fn test_cancellation_stops_launches() {
        let cancel = CancellationToken::new();
        let steps = vec![step("a", &[]), step("b", &[0]), step("c", &[1])];
        let launched = Arc::new(AtomicUsize::new(0));

        let records = Scheduler::new(1)
            .with_cancellation(cancel.clone())
            .run(&steps, |_| {
                let cancel = cancel.clone();
                let launched = launched.clone();
                async move {
                    launched.fetch_add(1, Ordering::SeqCst);
                    cancel.cancel();
                    Ok::<_, InfraError>(())
                }
            })
            .await;

        assert_eq!(launched.load(Ordering::SeqCst), 1);
        assert!(records[0].status.is_success());
        assert!(matches!(
            &records[1].status,
            StepStatus::Skipped(ReconcileError::Aborted { reason }) if reason == "run cancelled"
        ));
        assert!(records[2].status.is_skipped());
    }

    #[tokio::test]
    async fn test_empty_plan() {
        let records = Scheduler::default()
            .run(&[], |_| async { Ok::<_, InfraError>(()) })
            .await;
        assert!(records.is_empty());
    }
}
