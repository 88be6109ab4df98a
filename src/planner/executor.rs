//! Plan executor.
//!
//! Runs plan entries on a bounded pool of tokio tasks. An entry is
//! dispatched once every entry it waits for has completed; a failure marks
//! everything downstream of it as skipped while independent branches keep
//! going. State is written one record at a time with compare-and-swap, so an
//! interrupted run leaves every finished step recorded.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ExecutionConfig;
use crate::error::{ApplyError, ProviderError};
use crate::graph::{AttributeMap, Reference, ResourceId};
use crate::provider::{ApplyRequest, DestroyRequest, Lookup, Provider, ReadRequest};
use crate::state::{KeyedLocks, StateRecord, StateStore};

use super::plan::{Action, Plan, PlanEntry};
use super::report::{ApplyReport, StepOutcome, StepStatus};

/// Default number of steps in flight.
pub const DEFAULT_PARALLELISM: usize = 4;

/// Executor settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorOptions {
    /// Maximum number of steps in flight.
    pub parallelism: usize,
    /// Timeout for a single provider call.
    pub step_timeout: Option<Duration>,
    /// Report what would run without touching the provider or the store.
    pub dry_run: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_PARALLELISM,
            step_timeout: None,
            dry_run: false,
        }
    }
}

impl ExecutorOptions {
    /// Options taken from the `execution` section of a stack file.
    #[must_use]
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            parallelism: config.parallelism.max(1),
            step_timeout: config.step_timeout_secs.map(Duration::from_secs),
            dry_run: false,
        }
    }
}

/// Everything a step task needs.
#[derive(Clone)]
struct StepContext {
    provider: Arc<dyn Provider>,
    store: Arc<dyn StateStore>,
    timeout: Option<Duration>,
    locks: KeyedLocks,
}

/// Applies plans through a provider and a state store.
pub struct Executor {
    provider: Arc<dyn Provider>,
    store: Arc<dyn StateStore>,
    options: ExecutorOptions,
    cancel: CancellationToken,
    locks: KeyedLocks,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("backend", &self.store.backend_type())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// Creates an executor with default options.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, store: Arc<dyn StateStore>) -> Self {
        Self {
            provider,
            store,
            options: ExecutorOptions::default(),
            cancel: CancellationToken::new(),
            locks: KeyedLocks::new(),
        }
    }

    /// Sets the executor options.
    #[must_use]
    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    /// Uses an externally owned cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops the executor from dispatching new steps.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Executes a plan.
    ///
    /// Never fails as a whole: per-entry failures are recorded in the
    /// returned report.
    pub async fn execute(&self, plan: &Plan) -> ApplyReport {
        let started_at = Utc::now();
        let total = plan.entries.len();
        let parallelism = self.options.parallelism.max(1);
        info!(
            "Executing plan with {total} entries (parallelism {parallelism}{})",
            if self.options.dry_run { ", dry run" } else { "" }
        );

        let mut outcomes: Vec<Option<StepOutcome>> = vec![None; total];
        let mut dispatched = vec![false; total];
        let mut in_flight: JoinSet<(Result<AttributeMap, ApplyError>, u64)> = JoinSet::new();
        let mut tasks: HashMap<tokio::task::Id, usize> = HashMap::new();
        let mut cancel_seen = false;

        loop {
            self.settle(plan, &mut outcomes, &mut dispatched, |index| {
                in_flight.len() < parallelism && {
                    let ctx = self.context();
                    let entry = plan.entries[index].clone();
                    debug!("Dispatching {}", entry.description());
                    let handle = in_flight.spawn(async move {
                        let start = Instant::now();
                        let result = run_step(&ctx, &entry).await;
                        (result, elapsed_ms(start))
                    });
                    tasks.insert(handle.id(), index);
                    true
                }
            });

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                joined = in_flight.join_next_with_id() => {
                    let Some(joined) = joined else { continue };
                    let (index, result, duration_ms) = match joined {
                        Ok((task, (result, duration_ms))) => {
                            (tasks.remove(&task), result, duration_ms)
                        }
                        Err(join_error) => {
                            let index = tasks.remove(&join_error.id());
                            let resource = index
                                .map(|i| plan.entries[i].id.to_string())
                                .unwrap_or_default();
                            error!("Step task for {resource} panicked: {join_error}");
                            let err = ApplyError::State {
                                resource,
                                message: format!("step task failed: {join_error}"),
                            };
                            (index, Err(err), 0)
                        }
                    };
                    if let Some(index) = index {
                        outcomes[index] = Some(finished(&plan.entries[index], index, result, duration_ms));
                    }
                }
                () = self.cancel.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    warn!("Cancellation requested, waiting for {} in-flight step(s)", in_flight.len());
                }
            }
        }

        let outcomes: Vec<StepOutcome> = outcomes
            .into_iter()
            .enumerate()
            .map(|(index, outcome)| {
                outcome.unwrap_or_else(|| {
                    warn!("Entry {index} was never ready to run");
                    not_run(&plan.entries[index], index, StepStatus::Skipped)
                })
            })
            .collect();

        let report = ApplyReport {
            outcomes,
            started_at,
            finished_at: Utc::now(),
            cancelled: self.cancel.is_cancelled(),
        };
        info!("Apply finished: {report}");
        report
    }

    /// Settles every entry that can be decided without running it and
    /// offers the ready ones to `dispatch`, which returns false when no
    /// slot is free.
    fn settle(
        &self,
        plan: &Plan,
        outcomes: &mut [Option<StepOutcome>],
        dispatched: &mut [bool],
        mut dispatch: impl FnMut(usize) -> bool,
    ) {
        let mut progress = true;
        while progress {
            progress = false;

            for (index, entry) in plan.entries.iter().enumerate() {
                if outcomes[index].is_some() || dispatched[index] {
                    continue;
                }

                let statuses: Vec<Option<StepStatus>> = entry
                    .wait_for
                    .iter()
                    .map(|&w| outcomes.get(w).and_then(|o| o.as_ref()).map(|o| o.status))
                    .collect();

                let status = if statuses
                    .iter()
                    .any(|s| matches!(s, Some(StepStatus::Failed | StepStatus::Skipped)))
                {
                    warn!("Skipping {}: a dependency failed", entry.id);
                    Some(StepStatus::Skipped)
                } else if statuses
                    .iter()
                    .any(|s| matches!(s, Some(StepStatus::Cancelled)))
                    || self.cancel.is_cancelled()
                {
                    Some(StepStatus::Cancelled)
                } else if statuses.iter().all(|s| s.is_some_and(StepStatus::is_complete)) {
                    if entry.action == Action::NoOp {
                        Some(StepStatus::Unchanged)
                    } else if self.options.dry_run {
                        info!("Would {}", entry.description().to_lowercase());
                        Some(StepStatus::Planned)
                    } else {
                        if dispatch(index) {
                            dispatched[index] = true;
                        }
                        None
                    }
                } else {
                    None
                };

                if let Some(status) = status {
                    outcomes[index] = Some(not_run(entry, index, status));
                    progress = true;
                }
            }
        }
    }

    fn context(&self) -> StepContext {
        StepContext {
            provider: Arc::clone(&self.provider),
            store: Arc::clone(&self.store),
            timeout: self.options.step_timeout,
            locks: self.locks.clone(),
        }
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn not_run(entry: &PlanEntry, index: usize, status: StepStatus) -> StepOutcome {
    StepOutcome {
        index,
        id: entry.id.clone(),
        action: entry.action,
        replacement: entry.replacement,
        status,
        error: None,
        attributes: None,
        duration_ms: 0,
    }
}

fn finished(
    entry: &PlanEntry,
    index: usize,
    result: Result<AttributeMap, ApplyError>,
    duration_ms: u64,
) -> StepOutcome {
    let mut outcome = not_run(entry, index, StepStatus::Succeeded);
    outcome.duration_ms = duration_ms;
    match result {
        Ok(attributes) => {
            info!("{} succeeded in {duration_ms}ms", entry.description());
            outcome.attributes = (entry.action != Action::Destroy).then_some(attributes);
        }
        Err(e) => {
            error!("{} failed: {e}", entry.description());
            outcome.status = StepStatus::Failed;
            outcome.error = Some(e);
        }
    }
    outcome
}

/// Runs one step while holding the resource's lock.
async fn run_step(ctx: &StepContext, entry: &PlanEntry) -> Result<AttributeMap, ApplyError> {
    let _guard = ctx.locks.lock(&entry.id.to_string()).await;
    match entry.action {
        Action::Create => create(ctx, entry).await,
        Action::Update => update(ctx, entry).await,
        Action::Destroy => destroy(ctx, entry).await.map(|()| AttributeMap::new()),
        Action::NoOp => Ok(entry.prior.clone().unwrap_or_default()),
    }
}

async fn create(ctx: &StepContext, entry: &PlanEntry) -> Result<AttributeMap, ApplyError> {
    let resource = entry.id.to_string();
    let desired = resolve_attributes(ctx, entry).await?;

    let marker = StateRecord::pending(entry.id.clone(), desired.clone(), entry.dependencies.clone());
    if !ctx
        .store
        .compare_and_swap(&entry.id, None, Some(&marker))
        .await
        .map_err(|e| state_error(&resource, &e))?
    {
        return Err(ApplyError::StateConflict {
            resource,
            message: String::from("a record already exists"),
        });
    }

    let request = ApplyRequest {
        id: entry.id.clone(),
        resource_type: entry.resource_type.clone(),
        desired,
        prior: None,
    };
    let attributes = match call_provider(ctx, &resource, ctx.provider.apply(request)).await? {
        Ok(attributes) => attributes,
        Err(source) => {
            // Nothing was created, so the marker goes away.
            if let Err(e) = ctx
                .store
                .compare_and_swap(&entry.id, Some(marker.serial), None)
                .await
            {
                warn!("Failed to remove pending record for {resource}: {e}");
            }
            return Err(ApplyError::Provider {
                resource,
                action: Action::Create,
                source,
            });
        }
    };

    let confirmed = marker.confirm(attributes.clone());
    swap(ctx, &entry.id, Some(marker.serial), Some(&confirmed)).await?;
    Ok(attributes)
}

async fn update(ctx: &StepContext, entry: &PlanEntry) -> Result<AttributeMap, ApplyError> {
    let resource = entry.id.to_string();
    let desired = resolve_attributes(ctx, entry).await?;

    let record = ctx
        .store
        .get(&entry.id)
        .await
        .map_err(|e| state_error(&resource, &e))?
        .ok_or_else(|| ApplyError::StateConflict {
            resource: resource.clone(),
            message: String::from("record disappeared"),
        })?;
    if entry.prior_serial.is_some_and(|serial| serial != record.serial) {
        return Err(ApplyError::StateConflict {
            resource,
            message: format!(
                "record changed since planning (serial {} != {})",
                record.serial,
                entry.prior_serial.unwrap_or_default()
            ),
        });
    }

    let request = ApplyRequest {
        id: entry.id.clone(),
        resource_type: entry.resource_type.clone(),
        desired: desired.clone(),
        prior: Some(record.attributes.clone()),
    };
    let attributes = call_provider(ctx, &resource, ctx.provider.apply(request))
        .await?
        .map_err(|source| ApplyError::Provider {
            resource: resource.clone(),
            action: Action::Update,
            source,
        })?;

    let updated = record.updated(desired, attributes.clone(), entry.dependencies.clone());
    swap(ctx, &entry.id, Some(record.serial), Some(&updated)).await?;
    Ok(attributes)
}

async fn destroy(ctx: &StepContext, entry: &PlanEntry) -> Result<(), ApplyError> {
    let resource = entry.id.to_string();
    let Some(record) = ctx
        .store
        .get(&entry.id)
        .await
        .map_err(|e| state_error(&resource, &e))?
    else {
        debug!("{resource} has no record, nothing to destroy");
        return Ok(());
    };

    let attributes = if record.is_pending() {
        match locate_pending(ctx, &record).await? {
            Some(found) => found,
            None => return swap(ctx, &entry.id, Some(record.serial), None).await,
        }
    } else {
        record.merged_attributes()
    };

    let request = DestroyRequest {
        id: entry.id.clone(),
        resource_type: record.resource_type.clone(),
        attributes,
    };
    match call_provider(ctx, &resource, ctx.provider.destroy(request)).await? {
        Ok(()) => {}
        Err(ProviderError::NotFound { .. }) => {
            debug!("{resource} was already gone");
        }
        Err(source) => {
            return Err(ApplyError::Provider {
                resource,
                action: Action::Destroy,
                source,
            });
        }
    }

    swap(ctx, &entry.id, Some(record.serial), None).await
}

/// Finds the resource behind a pending marker so it can be destroyed.
///
/// `None` means there is nothing the provider could destroy and only the
/// marker has to go.
async fn locate_pending(
    ctx: &StepContext,
    record: &StateRecord,
) -> Result<Option<AttributeMap>, ApplyError> {
    let resource = record.id.to_string();
    let request = ReadRequest {
        id: record.id.clone(),
        resource_type: record.resource_type.clone(),
        attributes: record.desired.clone(),
    };
    let lookup = call_provider(ctx, &resource, ctx.provider.lookup(request))
        .await?
        .map_err(|source| ApplyError::Provider {
            resource: resource.clone(),
            action: Action::Destroy,
            source,
        })?;

    match lookup {
        Lookup::Found(found) => {
            let mut attributes = record.desired.clone();
            attributes.extend(found);
            Ok(Some(attributes))
        }
        Lookup::Absent => {
            debug!("{resource} was never created, dropping its pending record");
            Ok(None)
        }
        Lookup::Unknown => {
            warn!("Provider cannot locate the interrupted create of {resource}; dropping its pending record");
            Ok(None)
        }
    }
}

/// Resolves the entry's declared attributes against current state records.
async fn resolve_attributes(
    ctx: &StepContext,
    entry: &PlanEntry,
) -> Result<AttributeMap, ApplyError> {
    let resource = entry.id.to_string();

    let mut records: BTreeMap<ResourceId, Option<StateRecord>> = BTreeMap::new();
    for value in entry.config.values() {
        for reference in value.references() {
            if records.contains_key(&reference.target) {
                continue;
            }
            let record = ctx
                .store
                .get(&reference.target)
                .await
                .map_err(|e| state_error(&resource, &e))?;
            records.insert(reference.target.clone(), record);
        }
    }

    let mut lookup = |reference: &Reference| {
        records
            .get(&reference.target)
            .and_then(Option::as_ref)
            .filter(|record| !record.is_pending())
            .and_then(|record| record.value(&reference.attribute))
            .cloned()
            .map(Some)
            .ok_or_else(|| ApplyError::Unresolved {
                resource: resource.clone(),
                reference: reference.to_string(),
            })
    };

    let mut desired = AttributeMap::new();
    for (name, value) in &entry.config {
        let resolved = value.resolve(&mut lookup)?.ok_or_else(|| ApplyError::Unresolved {
            resource: resource.clone(),
            reference: value.to_string(),
        })?;
        desired.insert(name.clone(), resolved);
    }
    Ok(desired)
}

/// Awaits a provider call under the step timeout.
async fn call_provider<T>(
    ctx: &StepContext,
    resource: &str,
    call: impl Future<Output = T>,
) -> Result<T, ApplyError> {
    match ctx.timeout {
        Some(after) => tokio::time::timeout(after, call)
            .await
            .map_err(|_| ApplyError::Timeout {
                resource: resource.to_string(),
                after,
            }),
        None => Ok(call.await),
    }
}

async fn swap(
    ctx: &StepContext,
    id: &ResourceId,
    expected: Option<u64>,
    new: Option<&StateRecord>,
) -> Result<(), ApplyError> {
    let resource = id.to_string();
    let swapped = ctx
        .store
        .compare_and_swap(id, expected, new)
        .await
        .map_err(|e| state_error(&resource, &e))?;
    if swapped {
        Ok(())
    } else {
        Err(ApplyError::StateConflict {
            resource,
            message: format!("record changed concurrently (expected serial {expected:?})"),
        })
    }
}

fn state_error(resource: &str, error: &crate::error::StratumError) -> ApplyError {
    ApplyError::State {
        resource: resource.to_string(),
        message: error.to_string(),
    }
}
