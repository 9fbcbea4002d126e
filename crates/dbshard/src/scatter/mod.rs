//! Concurrent scatter-gather execution across shards.
//!
//! One unit of work is spawned per target shard. A counting semaphore caps
//! how many units hold a connection at once, each unit has its own timeout,
//! and results are reassembled in topology order no matter which shard
//! answers first.
//!
//! Per-shard failures are captured as [`ShardFailure`] values. Whether the
//! call as a whole succeeds is decided by the [`FailurePolicy`]:
//!
//! - `FailFast`: the first failure cancels every in-flight unit and the call
//!   fails immediately, carrying the results that had already arrived.
//! - `BestEffort`: every unit runs to completion and the call succeeds when
//!   at least `min_successful_shards` shards succeeded.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::ShardedConnectionFactory;
use crate::core::{Row, RowMapper, ShardConnection, Statement};
use crate::error::{FailureKind, Result, ShardError, ShardFailure};
use crate::router::{ShardKey, ShardRouter};
use crate::topology::{ShardDescriptor, ShardId};

/// How per-shard failures affect the overall call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Abort on the first shard failure.
    FailFast,
    /// Let every shard finish; require a minimum number of successes.
    #[default]
    BestEffort,
}

/// Options for one scatter-gather call.
#[derive(Debug, Clone)]
pub struct ScatterGatherOptions {
    /// Maximum number of shards worked on at the same time.
    pub max_concurrency: usize,

    /// Time budget for one shard (connect + execute).
    pub per_shard_timeout: Duration,

    /// Failure handling policy.
    pub failure_policy: FailurePolicy,

    /// Successful shards required under `BestEffort`.
    pub min_successful_shards: usize,
}

impl Default for ScatterGatherOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            per_shard_timeout: Duration::from_secs(30),
            failure_policy: FailurePolicy::BestEffort,
            min_successful_shards: 1,
        }
    }
}

impl ScatterGatherOptions {
    pub fn fail_fast() -> Self {
        Self {
            failure_policy: FailurePolicy::FailFast,
            ..Self::default()
        }
    }

    pub fn best_effort(min_successful_shards: usize) -> Self {
        Self {
            failure_policy: FailurePolicy::BestEffort,
            min_successful_shards,
            ..Self::default()
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_timeout(mut self, per_shard_timeout: Duration) -> Self {
        self.per_shard_timeout = per_shard_timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(ShardError::Config(
                "max_concurrency must be at least 1".into(),
            ));
        }
        if self.per_shard_timeout.is_zero() {
            return Err(ShardError::Config(
                "per_shard_timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Which shards a call fans out to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ShardTargets {
    /// Every shard in the topology (broadcast).
    #[default]
    All,
    /// A caller-supplied subset, e.g. narrowed by a partition predicate.
    Only(Vec<ShardId>),
}

impl From<Vec<ShardId>> for ShardTargets {
    fn from(ids: Vec<ShardId>) -> Self {
        ShardTargets::Only(ids)
    }
}

/// Outcome of one targeted shard.
#[derive(Debug, Clone)]
pub struct ShardResult<T> {
    pub shard_id: ShardId,
    pub value: Option<T>,
    pub error: Option<ShardFailure>,
}

impl<T> ShardResult<T> {
    pub fn success(shard_id: ShardId, value: T) -> Self {
        Self {
            shard_id,
            value: Some(value),
            error: None,
        }
    }

    pub fn failure(shard_id: ShardId, error: ShardFailure) -> Self {
        Self {
            shard_id,
            value: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Convert into a `Result`, attributing failures to this shard.
    pub fn into_result(self) -> Result<T> {
        match (self.value, self.error) {
            (Some(value), None) => Ok(value),
            (_, Some(failure)) => Err(failure.into_error(&self.shard_id)),
            (None, None) => Err(ShardError::query(&self.shard_id, "no value reported")),
        }
    }
}

/// Per-shard results of a successful call, in topology order.
#[derive(Debug, Clone)]
pub struct ScatterGatherOutcome<T> {
    pub results: Vec<ShardResult<T>>,
}

impl<T> ScatterGatherOutcome<T> {
    /// Successful shards with their values.
    pub fn successes(&self) -> impl Iterator<Item = (&ShardId, &T)> {
        self.results
            .iter()
            .filter_map(|r| r.value.as_ref().map(|v| (&r.shard_id, v)))
    }

    /// Failed shards with the reason, in topology order.
    pub fn failures(&self) -> Vec<(ShardId, ShardFailure)> {
        self.results
            .iter()
            .filter_map(|r| r.error.clone().map(|e| (r.shard_id.clone(), e)))
            .collect()
    }

    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn succeeded_shards(&self) -> Vec<ShardId> {
        self.successes().map(|(id, _)| id.clone()).collect()
    }

    /// Usable but some shards are missing.
    pub fn is_degraded(&self) -> bool {
        self.results.iter().any(|r| !r.is_success())
    }
}

impl<R> ScatterGatherOutcome<Vec<R>> {
    /// Concatenate successful shards' rows in topology order.
    pub fn flatten(self) -> Vec<R> {
        self.results
            .into_iter()
            .filter_map(|r| r.value)
            .flatten()
            .collect()
    }
}

/// A failed call: the error plus whatever shards had already reported.
#[derive(Debug)]
pub struct GatherFailure<T> {
    pub error: ShardError,
    pub completed: Vec<ShardResult<T>>,
}

impl<T> GatherFailure<T> {
    pub fn new(error: ShardError) -> Self {
        Self {
            error,
            completed: Vec::new(),
        }
    }

    /// Shards that produced a value before the call failed.
    pub fn completed_shards(&self) -> Vec<ShardId> {
        self.completed
            .iter()
            .filter(|r| r.is_success())
            .map(|r| r.shard_id.clone())
            .collect()
    }
}

impl<T> From<GatherFailure<T>> for ShardError {
    fn from(failure: GatherFailure<T>) -> Self {
        failure.error
    }
}

pub type GatherResult<T> = std::result::Result<ScatterGatherOutcome<T>, GatherFailure<T>>;

/// Future returned by one unit of work.
pub type UnitFuture<T> = BoxFuture<'static, Result<T>>;

/// Fans queries out to shards.
#[derive(Clone)]
pub struct ShardedQueryExecutor {
    factory: ShardedConnectionFactory,
    router: Option<Arc<ShardRouter>>,
    defaults: ScatterGatherOptions,
}

impl ShardedQueryExecutor {
    pub fn new(factory: ShardedConnectionFactory, defaults: ScatterGatherOptions) -> Self {
        Self {
            factory,
            router: None,
            defaults,
        }
    }

    /// Attach a router for key-targeted queries.
    ///
    /// The router must be built from the same topology as the factory.
    pub fn with_router(mut self, router: Arc<ShardRouter>) -> Result<Self> {
        if router.topology().fingerprint() != self.factory.topology().fingerprint() {
            return Err(ShardError::Config(format!(
                "router topology v{} does not match executor topology v{}",
                router.topology_version(),
                self.factory.topology().version()
            )));
        }
        self.router = Some(router);
        Ok(self)
    }

    /// Options configured at construction.
    pub fn defaults(&self) -> &ScatterGatherOptions {
        &self.defaults
    }

    pub fn factory(&self) -> &ShardedConnectionFactory {
        &self.factory
    }

    /// Run `statement` on the target shards and collect raw rows.
    pub async fn execute(
        &self,
        statement: Statement,
        targets: ShardTargets,
        options: &ScatterGatherOptions,
        cancel: &CancellationToken,
    ) -> GatherResult<Vec<Row>> {
        let statement = Arc::new(statement);
        self.scatter(targets, options, cancel, move |_shard, conn| {
            let statement = statement.clone();
            async move {
                let mut conn = conn;
                conn.query(&statement).await
            }
            .boxed()
        })
        .await
    }

    /// Run `statement` on the target shards and map every row.
    pub async fn execute_mapped<T, M>(
        &self,
        statement: Statement,
        targets: ShardTargets,
        options: &ScatterGatherOptions,
        mapper: Arc<M>,
        cancel: &CancellationToken,
    ) -> GatherResult<Vec<T>>
    where
        T: Send + 'static,
        M: RowMapper<T> + 'static,
    {
        let statement = Arc::new(statement);
        self.scatter(targets, options, cancel, move |_shard, conn| {
            let statement = statement.clone();
            let mapper = mapper.clone();
            async move {
                let mut conn = conn;
                let rows = conn.query(&statement).await?;
                rows.iter().map(|row| mapper.map_row(row)).collect()
            }
            .boxed()
        })
        .await
    }

    /// Route `keys` and query only the shards that own them.
    ///
    /// `build` receives each owning shard with its keys and returns the
    /// statement to run there.
    pub async fn execute_for_keys<B>(
        &self,
        keys: &[ShardKey],
        build: B,
        options: &ScatterGatherOptions,
        cancel: &CancellationToken,
    ) -> GatherResult<Vec<Row>>
    where
        B: Fn(&ShardId, &[ShardKey]) -> Statement,
    {
        let router = self.router.as_ref().ok_or_else(|| {
            GatherFailure::new(ShardError::Routing(
                "executor has no router for key-targeted queries".into(),
            ))
        })?;
        if keys.is_empty() {
            return Ok(ScatterGatherOutcome {
                results: Vec::new(),
            });
        }

        let groups = router.resolve_many(keys).map_err(GatherFailure::new)?;
        let statements: HashMap<ShardId, Arc<Statement>> = groups
            .iter()
            .map(|(id, shard_keys)| (id.clone(), Arc::new(build(id, shard_keys))))
            .collect();
        let targets = ShardTargets::Only(groups.into_iter().map(|(id, _)| id).collect());
        let statements = Arc::new(statements);

        self.scatter(targets, options, cancel, move |shard, conn| {
            let statement = statements.get(&shard.id).cloned();
            async move {
                let mut conn = conn;
                let statement =
                    statement.ok_or_else(|| ShardError::UnknownShard(shard.id.to_string()))?;
                conn.query(&statement).await
            }
            .boxed()
        })
        .await
    }

    /// Generic fan-out primitive.
    ///
    /// `unit` runs once per target shard with a freshly opened connection
    /// that it owns until it finishes.
    pub async fn scatter<T, F>(
        &self,
        targets: ShardTargets,
        options: &ScatterGatherOptions,
        cancel: &CancellationToken,
        unit: F,
    ) -> GatherResult<T>
    where
        T: Send + 'static,
        F: Fn(ShardDescriptor, Box<dyn ShardConnection>) -> UnitFuture<T> + Send + Sync + 'static,
    {
        options.validate().map_err(GatherFailure::new)?;
        let shards = self.resolve_targets(&targets).map_err(GatherFailure::new)?;
        let total = shards.len();

        info!(
            "Scatter-gather across {} shard(s) (max_concurrency={}, timeout={}ms, policy={:?})",
            total,
            options.max_concurrency,
            options.per_shard_timeout.as_millis(),
            options.failure_policy
        );

        let semaphore = Arc::new(Semaphore::new(options.max_concurrency));
        let unit = Arc::new(unit);
        let token = cancel.child_token();
        let mut set = JoinSet::new();

        for (slot, shard) in shards.iter().cloned().enumerate() {
            let factory = self.factory.clone();
            let semaphore = semaphore.clone();
            let token = token.clone();
            let unit = unit.clone();
            let limit = options.per_shard_timeout;

            set.spawn(async move {
                let work = run_unit(factory, shard, semaphore, token, limit, unit);
                let outcome = AssertUnwindSafe(work)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        Err(ShardFailure::new(FailureKind::Panicked, panic_message(&*panic)))
                    });
                (slot, outcome)
            });
        }

        let mut slots: Vec<Option<std::result::Result<T, ShardFailure>>> =
            (0..total).map(|_| None).collect();

        while let Some(joined) = set.join_next().await {
            let (slot, outcome) = match joined {
                Ok(v) => v,
                Err(e) => {
                    warn!("Scatter unit was lost: {}", e);
                    continue;
                }
            };

            if let Err(failure) = &outcome {
                let shard_id = &shards[slot].id;
                warn!("Shard {}: {}", shard_id, failure);

                if options.failure_policy == FailurePolicy::FailFast {
                    token.cancel();
                    set.abort_all();
                    let error = if cancel.is_cancelled() {
                        ShardError::Cancelled
                    } else {
                        failure.clone().into_error(shard_id)
                    };
                    let completed: Vec<ShardResult<T>> = slots
                        .into_iter()
                        .zip(shards.iter())
                        .filter_map(|(slot, shard)| match slot {
                            Some(Ok(value)) => Some(ShardResult::success(shard.id.clone(), value)),
                            _ => None,
                        })
                        .collect();
                    info!(
                        "Scatter-gather aborted after {} of {} shard(s) completed",
                        completed.len(),
                        total
                    );
                    return Err(GatherFailure { error, completed });
                }
            } else {
                debug!("Shard {}: completed", shards[slot].id);
            }

            slots[slot] = Some(outcome);
        }

        let results: Vec<ShardResult<T>> = slots
            .into_iter()
            .zip(shards.iter())
            .map(|(slot, shard)| match slot {
                Some(Ok(value)) => ShardResult::success(shard.id.clone(), value),
                Some(Err(failure)) => ShardResult::failure(shard.id.clone(), failure),
                None => ShardResult::failure(
                    shard.id.clone(),
                    ShardFailure::new(FailureKind::Panicked, "unit did not report"),
                ),
            })
            .collect();

        if cancel.is_cancelled() {
            return Err(GatherFailure {
                error: ShardError::Cancelled,
                completed: results,
            });
        }

        let succeeded = results.iter().filter(|r| r.is_success()).count();
        let required = match options.failure_policy {
            FailurePolicy::FailFast => total,
            FailurePolicy::BestEffort => options.min_successful_shards,
        };

        if succeeded < required {
            let failures = results
                .iter()
                .filter_map(|r| r.error.clone().map(|e| (r.shard_id.clone(), e)))
                .collect();
            return Err(GatherFailure {
                error: ShardError::PartialFailure {
                    succeeded,
                    required,
                    failures,
                },
                completed: results,
            });
        }

        info!(
            "Scatter-gather finished: {}/{} shard(s) succeeded",
            succeeded, total
        );
        Ok(ScatterGatherOutcome { results })
    }

    fn resolve_targets(&self, targets: &ShardTargets) -> Result<Vec<ShardDescriptor>> {
        let topology = self.factory.topology();
        match targets {
            ShardTargets::All => Ok(topology.shards().to_vec()),
            ShardTargets::Only(ids) if ids.is_empty() => {
                Err(ShardError::Routing("no target shards selected".into()))
            }
            ShardTargets::Only(ids) => Ok(topology.select(ids)?.into_iter().cloned().collect()),
        }
    }
}

async fn run_unit<T, F>(
    factory: ShardedConnectionFactory,
    shard: ShardDescriptor,
    semaphore: Arc<Semaphore>,
    token: CancellationToken,
    limit: Duration,
    unit: Arc<F>,
) -> std::result::Result<T, ShardFailure>
where
    F: Fn(ShardDescriptor, Box<dyn ShardConnection>) -> UnitFuture<T> + Send + Sync + 'static,
{
    let permit = tokio::select! {
        biased;
        _ = token.cancelled() => None,
        permit = semaphore.acquire_owned() => permit.ok(),
    };
    let Some(_permit) = permit else {
        return Err(ShardFailure::new(
            FailureKind::Cancelled,
            "cancelled before start",
        ));
    };

    let work = async {
        let conn = factory
            .open_descriptor(&shard)
            .await
            .map_err(|e| ShardFailure::new(FailureKind::Unavailable, e.to_string()))?;
        unit(shard.clone(), conn)
            .await
            .map_err(|e| ShardFailure::from_error(&e))
    };

    tokio::select! {
        biased;
        _ = token.cancelled() => Err(ShardFailure::new(FailureKind::Cancelled, "cancelled")),
        outcome = tokio::time::timeout(limit, work) => match outcome {
            Ok(outcome) => outcome,
            Err(_) => Err(ShardFailure::new(
                FailureKind::Timeout,
                format!("no response within {}ms", limit.as_millis()),
            )),
        },
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("unit panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("unit panicked: {}", s)
    } else {
        "unit panicked".to_string()
    }
}
