//! Reconciler for maintaining desired state.
//!
//! Ties the pieces together: builds the graph for the selected environment,
//! plans against recorded state and applies under the store's run lock.
//! Also hosts the maintenance operations that work on state directly:
//! drift detection, refresh, recovery of interrupted creates and output
//! evaluation.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigHasher, StackConfig};
use crate::error::{PlanError, Result, StratumError};
use crate::graph::{AttributeMap, Graph, GraphBuilder, Reference, ResourceId};
use crate::planner::{
    Action, ApplyReport, Executor, ExecutorOptions, Plan, PlanSummary, Planner, destroy_plan,
};
use crate::provider::{Lookup, Provider, ReadRequest};
use crate::state::{LOCK_RENEWAL_SECS, StateRecord, StateStore, generate_holder_id};

/// Drives plans and applies for one stack.
pub struct Reconciler {
    config: StackConfig,
    environment: String,
    overrides: BTreeMap<String, Value>,
    provider: Arc<dyn Provider>,
    store: Arc<dyn StateStore>,
    options: ExecutorOptions,
    cancel: CancellationToken,
    hasher: ConfigHasher,
    max_attempts: u32,
    retry_delay: Option<Duration>,
    lock_renewal: Duration,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("project", &self.config.project.name)
            .field("environment", &self.environment)
            .field("backend", &self.store.backend_type())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Result of a `reconcile` run.
#[derive(Debug, Serialize)]
pub struct ReconcileResult {
    /// Attempts made.
    pub attempts: u32,
    /// Whether state matches the configuration at the end.
    pub converged: bool,
    /// Changes of the last plan that was applied.
    pub summary: PlanSummary,
    /// Report of the last apply, if anything was applied.
    #[serde(skip)]
    pub report: Option<ApplyReport>,
}

/// How a recorded resource differs from what the provider reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "attributes", rename_all = "snake_case")]
pub enum DriftKind {
    /// Attributes changed outside the reconciler.
    Changed(Vec<String>),
    /// The resource no longer exists.
    Missing,
    /// The record is an unconfirmed create marker.
    Pending,
}

/// One drifted resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftedResource {
    /// Resource address.
    pub id: ResourceId,
    /// What drifted.
    pub drift: DriftKind,
}

/// Report of drift detection.
#[derive(Debug, Serialize)]
pub struct DriftReport {
    /// Resources that have drifted.
    pub drifted: Vec<DriftedResource>,
    /// Number of records checked.
    pub checked: usize,
    /// Whether the drift was written back to state.
    pub refreshed: bool,
}

impl DriftReport {
    /// Returns true if nothing drifted.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.drifted.is_empty()
    }
}

/// What recovery did with one pending record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// The provider has the resource; the record was confirmed.
    Adopted,
    /// The provider does not have it; the record was removed.
    Removed,
    /// The provider cannot tell; the record was left for the next plan.
    Unresolved,
}

/// Report of a recovery run.
#[derive(Debug, Default, Serialize)]
pub struct RecoveryReport {
    /// Pending records and what happened to them.
    pub resources: Vec<(ResourceId, RecoveryAction)>,
}

impl Reconciler {
    /// Creates a reconciler for a stack.
    #[must_use]
    pub fn new(
        config: StackConfig,
        provider: Arc<dyn Provider>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            environment: config.project.environment.clone(),
            options: ExecutorOptions::from_config(&config.execution),
            max_attempts: config.execution.max_attempts.max(1),
            config,
            overrides: BTreeMap::new(),
            provider,
            store,
            cancel: CancellationToken::new(),
            hasher: ConfigHasher::new(),
            retry_delay: None,
            lock_renewal: Duration::from_secs(LOCK_RENEWAL_SECS),
        }
    }

    /// Selects the environment overlay.
    #[must_use]
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Sets variable overrides, which win over defaults and overlays.
    #[must_use]
    pub fn with_variables(mut self, overrides: BTreeMap<String, Value>) -> Self {
        self.overrides = overrides;
        self
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

    /// Sets the maximum reconciliation attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Sets a fixed delay between reconciliation attempts instead of the
    /// error's suggested delay.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// Sets how often the run lock is renewed while work is running.
    #[must_use]
    pub const fn with_lock_renewal(mut self, interval: Duration) -> Self {
        self.lock_renewal = interval;
        self
    }

    /// The stack configuration.
    #[must_use]
    pub const fn config(&self) -> &StackConfig {
        &self.config
    }

    /// The selected environment.
    #[must_use]
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// The state store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Token that stops an apply from dispatching new steps.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Hash of the configuration, environment and overrides.
    #[must_use]
    pub fn config_hash(&self) -> String {
        self.hasher
            .hash_inputs(&self.config, &self.environment, &self.overrides)
    }

    /// Builds the resource graph for the selected environment.
    ///
    /// # Errors
    ///
    /// Returns a configuration or cycle error.
    pub fn build_graph(&self) -> Result<Graph> {
        GraphBuilder::new(&self.config)
            .environment(self.environment.clone())
            .variables(self.overrides.clone())
            .build()
    }

    /// Plans the changes needed to match the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph cannot be built, state cannot be read
    /// or a reference cannot be resolved.
    pub async fn plan(&self) -> Result<Plan> {
        let graph = self.build_graph()?;
        let records = self.store.list().await?;
        debug!(
            "Planning {} resource(s) against {} record(s)",
            graph.len(),
            records.len()
        );

        Planner::new(&graph, records)
            .config_hash(self.config_hash())
            .environment(self.environment.clone())
            .plan()
    }

    /// Plans the destruction of every recorded resource.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be read.
    pub async fn plan_destroy(&self) -> Result<Plan> {
        let records = self.store.list().await?;
        Ok(destroy_plan(
            records,
            self.config_hash(),
            self.environment.clone(),
        ))
    }

    /// Applies a plan under the run lock.
    ///
    /// # Errors
    ///
    /// Returns `PlanError::ConfigMismatch` or `PlanError::StalePlan` if the
    /// plan no longer matches the configuration or state, a lock error if
    /// another run holds the lock, and `ApplyFailed` if any step failed.
    pub async fn apply(&self, plan: &Plan) -> Result<ApplyReport> {
        self.locked(self.apply_locked(plan)).await
    }

    /// Runs `work` under the run lock, renewing it until `work` is done.
    async fn locked<T>(&self, work: impl Future<Output = Result<T>>) -> Result<T> {
        let lock = self.store.acquire_lock(&generate_holder_id()).await?;
        debug!("Acquired run lock {}", lock.lock_id);

        tokio::pin!(work);
        let result = tokio::select! {
            result = &mut work => result,
            () = self.hold_lock(&lock.lock_id) => work.await,
        };

        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            error!("Failed to release run lock: {e}");
        }
        result
    }

    /// Renews the run lock until a renewal fails, then stops new steps.
    async fn hold_lock(&self, lock_id: &str) {
        let mut ticker = tokio::time::interval(self.lock_renewal);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match self.store.renew_lock(lock_id).await {
                Ok(lock) => debug!("Run lock held until {}", lock.expires_at),
                Err(e) => {
                    error!("Lost the run lock, stopping after in-flight steps: {e}");
                    self.cancel.cancel();
                    return;
                }
            }
        }
    }

    async fn apply_locked(&self, plan: &Plan) -> Result<ApplyReport> {
        let current = self.config_hash();
        if !ConfigHasher::hashes_match(&plan.config_hash, &current) {
            return Err(PlanError::ConfigMismatch {
                planned: ConfigHasher::short_hash(&plan.config_hash).to_string(),
                current: ConfigHasher::short_hash(&current).to_string(),
            }
            .into());
        }

        self.check_stale(plan).await?;

        if !plan.has_changes() {
            info!("No changes to apply");
        }

        let report = Executor::new(Arc::clone(&self.provider), Arc::clone(&self.store))
            .with_options(self.options.clone())
            .with_cancellation(self.cancel.clone())
            .execute(plan)
            .await;

        if report.cancelled {
            warn!("Apply was cancelled: {report}");
        }
        Ok(report.into_result()?)
    }

    /// Refuses plans whose records changed since planning.
    async fn check_stale(&self, plan: &Plan) -> Result<()> {
        for entry in &plan.entries {
            if entry.replacement && entry.action == Action::Create {
                continue;
            }
            let found = self.store.get(&entry.id).await?.map(|r| r.serial);
            if found != entry.prior_serial {
                return Err(PlanError::StalePlan {
                    resource: entry.id.to_string(),
                    expected: entry.prior_serial,
                    found,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Plans and applies until state converges or attempts run out.
    ///
    /// Only apply failures are retried; a plan that cannot be built fails
    /// immediately.
    ///
    /// # Errors
    ///
    /// Returns the last error once every attempt has failed.
    pub async fn reconcile(&self) -> Result<ReconcileResult> {
        info!(
            "Starting reconciliation for {}/{}",
            self.config.project.name, self.environment
        );

        let mut last_error = None;
        for attempt in 1..=self.max_attempts {
            debug!("Reconciliation attempt {attempt}/{}", self.max_attempts);

            let plan = self.plan().await?;
            if !plan.has_changes() {
                info!("No changes required - state is converged");
                return Ok(ReconcileResult {
                    attempts: attempt,
                    converged: true,
                    summary: plan.summary(),
                    report: None,
                });
            }

            match self.apply(&plan).await {
                Ok(report) => {
                    return Ok(ReconcileResult {
                        attempts: attempt,
                        converged: !report.cancelled,
                        summary: plan.summary(),
                        report: Some(report),
                    });
                }
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    warn!("Reconciliation attempt {attempt} failed: {err}");
                    let delay = self.retry_delay.unwrap_or_else(|| {
                        Duration::from_secs(err.retry_delay_secs().unwrap_or(2))
                    });
                    last_error = Some(err);
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    error!("Reconciliation attempt {attempt} failed: {err}");
                    return Err(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| StratumError::internal("reconciliation was cancelled")))
    }

    /// Destroys every recorded resource.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be read or any destroy fails.
    pub async fn destroy(&self) -> Result<ApplyReport> {
        let plan = self.plan_destroy().await?;
        info!("Destroying {} resource(s)", plan.len());
        self.apply(&plan).await
    }

    /// Compares every record with what the provider reports.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be read or the provider fails.
    pub async fn check_drift(&self) -> Result<DriftReport> {
        let records = self.store.list().await?;
        let mut drifted = Vec::new();

        for record in &records {
            if let Some((drift, _)) = self.observe(record).await? {
                drifted.push(DriftedResource {
                    id: record.id.clone(),
                    drift,
                });
            }
        }

        info!(
            "Drift check: {} of {} resource(s) drifted",
            drifted.len(),
            records.len()
        );
        Ok(DriftReport {
            drifted,
            checked: records.len(),
            refreshed: false,
        })
    }

    /// Writes the provider's current attributes back to state.
    ///
    /// Changed records take the new attributes; missing resources lose
    /// their record so the next plan creates them again. Pending records
    /// are left to [`Reconciler::recover`].
    ///
    /// # Errors
    ///
    /// Returns an error if the run lock cannot be taken, state cannot be
    /// read or written, or the provider fails.
    pub async fn refresh(&self) -> Result<DriftReport> {
        self.locked(self.refresh_locked()).await
    }

    async fn refresh_locked(&self) -> Result<DriftReport> {
        let records = self.store.list().await?;
        let mut drifted = Vec::new();

        for record in &records {
            let Some((drift, current)) = self.observe(record).await? else {
                continue;
            };
            if drift == DriftKind::Pending {
                drifted.push(DriftedResource {
                    id: record.id.clone(),
                    drift,
                });
                continue;
            }
            // Missing resources lose their record.
            let new = current.map(|attributes| record.refreshed(attributes));
            if self
                .store
                .compare_and_swap(&record.id, Some(record.serial), new.as_ref())
                .await?
            {
                info!("Refreshed {}", record.id);
            } else {
                warn!("{} changed during refresh, leaving it", record.id);
            }
            drifted.push(DriftedResource {
                id: record.id.clone(),
                drift,
            });
        }

        Ok(DriftReport {
            drifted,
            checked: records.len(),
            refreshed: true,
        })
    }

    /// Reads one record's resource back from the provider.
    async fn observe(
        &self,
        record: &StateRecord,
    ) -> Result<Option<(DriftKind, Option<AttributeMap>)>> {
        if record.is_pending() {
            return Ok(Some((DriftKind::Pending, None)));
        }

        let current = self
            .provider
            .read(ReadRequest {
                id: record.id.clone(),
                resource_type: record.resource_type.clone(),
                attributes: record.attributes.clone(),
            })
            .await?;

        let Some(current) = current else {
            return Ok(Some((DriftKind::Missing, None)));
        };

        let changed: Vec<String> = record
            .attributes
            .keys()
            .chain(current.keys())
            .filter(|k| record.attributes.get(*k) != current.get(*k))
            .cloned()
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();

        if changed.is_empty() {
            Ok(None)
        } else {
            debug!("{} drifted: {}", record.id, changed.join(", "));
            Ok(Some((DriftKind::Changed(changed), Some(current))))
        }
    }

    /// Resolves records left pending by an interrupted create.
    ///
    /// # Errors
    ///
    /// Returns an error if the run lock cannot be taken, state cannot be
    /// read or written, or the provider fails.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        self.locked(self.recover_locked()).await
    }

    async fn recover_locked(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for record in self.store.list().await? {
            if !record.is_pending() {
                continue;
            }

            let lookup = self
                .provider
                .lookup(ReadRequest {
                    id: record.id.clone(),
                    resource_type: record.resource_type.clone(),
                    attributes: record.desired.clone(),
                })
                .await?;

            let (action, new) = match lookup {
                Lookup::Found(attributes) => (RecoveryAction::Adopted, Some(record.confirm(attributes))),
                Lookup::Absent => (RecoveryAction::Removed, None),
                Lookup::Unknown => {
                    warn!("Provider cannot tell whether {} exists", record.id);
                    report.resources.push((record.id.clone(), RecoveryAction::Unresolved));
                    continue;
                }
            };

            if self
                .store
                .compare_and_swap(&record.id, Some(record.serial), new.as_ref())
                .await?
            {
                info!("Recovered {}: {action:?}", record.id);
                report.resources.push((record.id.clone(), action));
            } else {
                warn!("{} changed during recovery, leaving it", record.id);
            }
        }

        Ok(report)
    }

    /// Evaluates the root module's outputs against recorded state.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph cannot be built, state cannot be read
    /// or an output refers to a value that is not recorded.
    pub async fn outputs(&self) -> Result<BTreeMap<String, Value>> {
        let graph = self.build_graph()?;
        let records: BTreeMap<ResourceId, StateRecord> = self
            .store
            .list()
            .await?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();

        let mut outputs = BTreeMap::new();
        for (name, value) in graph.outputs() {
            let mut lookup = |reference: &Reference| {
                records
                    .get(&reference.target)
                    .filter(|r| !r.is_pending())
                    .and_then(|r| r.value(&reference.attribute))
                    .cloned()
                    .map(Some)
                    .ok_or_else(|| {
                        StratumError::from(PlanError::UnresolvedReference {
                            resource: format!("output.{name}"),
                            reference: reference.to_string(),
                            reason: String::from("not applied yet"),
                        })
                    })
            };
            if let Some(resolved) = value.resolve(&mut lookup)? {
                outputs.insert(name.clone(), resolved);
            }
        }
        Ok(outputs)
    }
}
