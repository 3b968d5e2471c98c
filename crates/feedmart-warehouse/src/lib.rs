//! Dimensional-refresh pipeline: dimension resolution, fact upserts, the
//! aggregate rebuild, and the task DAG that coordinates them.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use feedmart_core::{
    Dimension, RunReport, TaskOutcome, TaskReport, AGGREGATE_TABLE, FACT_TABLE, SCHEMA,
    STAGING_TABLE,
};
use feedmart_storage::{
    ensure_schema, load_csv_to_staging, truncate_table, LoadOptions, ProgressFn, RetryPolicy,
};
use sqlx::PgPool;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "feedmart-warehouse";

// ---------------------------------------------------------------------------
// Warehouse refresh operations
// ---------------------------------------------------------------------------

/// Upsert the distinct staging values of one natural key into its dimension
/// table.
///
/// The conflict action writes the conflicting value back onto itself, which
/// makes a duplicate a committed no-op instead of an error while leaving the
/// existing surrogate id untouched. Fact rows pointing at that id from a
/// previous run therefore stay valid across every refresh.
pub async fn refresh_dimension(pool: &PgPool, dimension: Dimension) -> anyhow::Result<()> {
    ensure_schema(pool).await?;
    let table = dimension.table();
    let column = dimension.column();
    let sql = format!(
        "INSERT INTO {SCHEMA}.{table} ({column})
         SELECT DISTINCT {column} FROM {SCHEMA}.{STAGING_TABLE}
         ON CONFLICT ({column}) DO UPDATE SET {column} = EXCLUDED.{column}"
    );

    let mut tx = pool.begin().await?;
    let result = sqlx::query(&sql)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("refreshing {table} dimension"))?;
    tx.commit().await?;

    info!(dimension = %dimension, rows = result.rows_affected(), "dimension refreshed");
    Ok(())
}

/// Join staging to both dimensions and upsert the result into the fact
/// table.
///
/// Requires both dimension refreshes to have run against the current staging
/// contents; staging rows whose sku or name is missing a dimension row drop
/// out of the inner join rather than producing dangling references.
///
/// `created_at` is absent from the update clause, so first-insert time
/// survives every later refresh; `updated_at` moves on each upsert even when
/// the description is unchanged. Postgres rejects an upsert that touches the
/// same row twice in one statement, so duplicate `(sku_id, name_id)` pairs
/// within a load are collapsed with `DISTINCT ON` before the conflict clause.
pub async fn upsert_facts(pool: &PgPool) -> anyhow::Result<()> {
    ensure_schema(pool).await?;
    let sql = format!(
        "INSERT INTO {SCHEMA}.{FACT_TABLE} (sku_id, name_id, description, created_at, updated_at)
         SELECT DISTINCT ON (s.id, n.id)
                s.id, n.id, stg.description, now(), now()
           FROM {SCHEMA}.{STAGING_TABLE} stg
           JOIN {SCHEMA}.skus s ON stg.sku = s.sku
           JOIN {SCHEMA}.names n ON stg.name = n.name
          ORDER BY s.id, n.id
         ON CONFLICT (sku_id, name_id) DO UPDATE
            SET description = EXCLUDED.description,
                updated_at = EXCLUDED.updated_at"
    );

    let mut tx = pool.begin().await?;
    let result = sqlx::query(&sql)
        .execute(&mut *tx)
        .await
        .context("upserting fact rows")?;
    tx.commit().await?;

    info!(rows = result.rows_affected(), "fact table upserted");
    Ok(())
}

/// Truncate and fully recompute the distinct-SKU-count-per-name rollup.
///
/// Always a full rebuild inside one transaction: a failure rolls back to the
/// previous aggregate snapshot, never a half-rebuilt table.
pub async fn rebuild_aggregate(pool: &PgPool) -> anyhow::Result<()> {
    ensure_schema(pool).await?;
    let sql = format!(
        "INSERT INTO {SCHEMA}.{AGGREGATE_TABLE} (name_id, no_of_products)
         SELECT name_id, COUNT(DISTINCT sku_id)
           FROM {SCHEMA}.{FACT_TABLE}
          GROUP BY name_id"
    );

    let mut tx = pool.begin().await?;
    truncate_table(&mut tx, AGGREGATE_TABLE)
        .await
        .context("truncating aggregate table")?;
    let result = sqlx::query(&sql)
        .execute(&mut *tx)
        .await
        .context("repopulating aggregate table")?;
    tx.commit().await?;

    info!(rows = result.rows_affected(), "aggregate rebuilt");
    Ok(())
}

// ---------------------------------------------------------------------------
// Generic task DAG
// ---------------------------------------------------------------------------

type TaskFut = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type TaskFactory = Box<dyn Fn() -> TaskFut + Send + Sync>;

/// Opaque handle to a registered task, usable as a dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId(usize);

struct TaskNode {
    name: String,
    deps: Vec<usize>,
    factory: TaskFactory,
}

/// Directed acyclic graph of named tasks.
///
/// Edges may only point at already-registered tasks, so a cycle cannot be
/// expressed; no separate cycle check is needed.
#[derive(Default)]
pub struct TaskGraph {
    nodes: Vec<TaskNode>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task with explicit dependency edges. The factory is called
    /// once per execution attempt, so retries rebuild the future fresh.
    pub fn add_task<F, Fut>(&mut self, name: &str, deps: &[TaskId], task: F) -> TaskId
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = TaskId(self.nodes.len());
        self.nodes.push(TaskNode {
            name: name.to_string(),
            deps: deps.iter().map(|d| d.0).collect(),
            factory: Box::new(move || Box::pin(task())),
        });
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

/// Bounded-parallel DAG executor with a uniform per-task retry wrapper.
///
/// A task becomes runnable once every predecessor succeeded; when a task
/// exhausts its retries, every transitive dependent is marked skipped and
/// never started. Readiness is independent of the task payload, so any
/// pipeline shape can run through the same executor.
#[derive(Debug, Clone, Copy)]
pub struct GraphRunner {
    pub max_parallel: usize,
    pub retry: RetryPolicy,
}

impl Default for GraphRunner {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            retry: RetryPolicy::default(),
        }
    }
}

impl GraphRunner {
    pub async fn run(&self, graph: TaskGraph) -> Vec<TaskReport> {
        let node_count = graph.nodes.len();
        let mut names = Vec::with_capacity(node_count);
        let mut deps = Vec::with_capacity(node_count);
        let mut factories: Vec<Option<TaskFactory>> = Vec::with_capacity(node_count);
        for node in graph.nodes {
            names.push(node.name);
            deps.push(node.deps);
            factories.push(Some(node.factory));
        }

        let mut dependents = vec![Vec::new(); node_count];
        for (idx, node_deps) in deps.iter().enumerate() {
            for &dep in node_deps {
                dependents[dep].push(idx);
            }
        }

        let mut remaining: Vec<usize> = deps.iter().map(|d| d.len()).collect();
        let mut states = vec![NodeState::Pending; node_count];
        let mut attempts = vec![0u32; node_count];
        let mut errors: Vec<Option<String>> = vec![None; node_count];

        let workers = Arc::new(Semaphore::new(self.max_parallel.max(1)));
        let mut running: JoinSet<(usize, u32, anyhow::Result<()>)> = JoinSet::new();

        for idx in 0..node_count {
            if remaining[idx] == 0 {
                self.spawn_node(&mut running, idx, &mut factories, &names, &workers);
                states[idx] = NodeState::Running;
            }
        }

        while let Some(joined) = running.join_next().await {
            let (idx, tries, result) = joined.expect("task body panicked");
            attempts[idx] = tries;
            match result {
                Ok(()) => {
                    states[idx] = NodeState::Succeeded;
                    for &dependent in &dependents[idx] {
                        remaining[dependent] -= 1;
                        if remaining[dependent] == 0 && states[dependent] == NodeState::Pending {
                            self.spawn_node(&mut running, dependent, &mut factories, &names, &workers);
                            states[dependent] = NodeState::Running;
                        }
                    }
                }
                Err(err) => {
                    states[idx] = NodeState::Failed;
                    errors[idx] = Some(format!("{err:#}"));
                    warn!(task = %names[idx], attempts = tries, "task failed terminally");

                    let mut stack = dependents[idx].clone();
                    while let Some(blocked) = stack.pop() {
                        if states[blocked] == NodeState::Pending {
                            states[blocked] = NodeState::Skipped;
                            info!(task = %names[blocked], "task skipped: predecessor failed");
                            stack.extend(dependents[blocked].iter().copied());
                        }
                    }
                }
            }
        }

        names
            .into_iter()
            .zip(states)
            .zip(attempts)
            .zip(errors)
            .map(|(((name, state), attempts), error)| {
                debug_assert!(matches!(
                    state,
                    NodeState::Succeeded | NodeState::Failed | NodeState::Skipped
                ));
                let outcome = match state {
                    NodeState::Succeeded => TaskOutcome::Success,
                    NodeState::Failed => TaskOutcome::Failed,
                    _ => TaskOutcome::Skipped,
                };
                TaskReport {
                    name,
                    outcome,
                    attempts,
                    error,
                }
            })
            .collect()
    }

    fn spawn_node(
        &self,
        running: &mut JoinSet<(usize, u32, anyhow::Result<()>)>,
        idx: usize,
        factories: &mut [Option<TaskFactory>],
        names: &[String],
        workers: &Arc<Semaphore>,
    ) {
        let factory = factories[idx].take().expect("task spawned twice");
        let name = names[idx].clone();
        let policy = self.retry;
        let workers = Arc::clone(workers);
        running.spawn(async move {
            let _permit = workers.acquire_owned().await.expect("semaphore not closed");
            let (tries, result) = run_with_retry(&name, &factory, policy).await;
            (idx, tries, result)
        });
    }
}

/// Run one task to a terminal result under the uniform retry policy.
///
/// Every failure is retried identically up to the cap; data errors are not
/// told apart from transient ones, matching the source pipeline's behavior.
async fn run_with_retry(
    name: &str,
    factory: &TaskFactory,
    policy: RetryPolicy,
) -> (u32, anyhow::Result<()>) {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        info!(task = name, attempt, "task running");
        match factory().await {
            Ok(()) => {
                info!(task = name, attempt, "task succeeded");
                return (attempt, Ok(()));
            }
            Err(err) if attempt < policy.max_attempts() => {
                warn!(
                    task = name,
                    attempt,
                    delay_secs = policy.retry_delay.as_secs(),
                    error = %format!("{err:#}"),
                    "task failed; retrying after delay"
                );
                tokio::time::sleep(policy.retry_delay).await;
            }
            Err(err) => return (attempt, Err(err)),
        }
    }
}

// ---------------------------------------------------------------------------
// The five-task product pipeline
// ---------------------------------------------------------------------------

pub const TASK_LOAD_STAGING: &str = "load-stg-products";
pub const TASK_REFRESH_SKUS: &str = "refresh-skus";
pub const TASK_REFRESH_NAMES: &str = "refresh-names";
pub const TASK_UPSERT_FACTS: &str = "upsert-products";
pub const TASK_REBUILD_AGGREGATE: &str = "rebuild-by-name-no-of-products";

#[derive(Debug, Clone)]
pub struct PipelineParams {
    pub csv_path: PathBuf,
    pub chunk_size: usize,
    /// When set, the loader reports per-chunk progress through tracing.
    pub verbose: bool,
}

impl PipelineParams {
    pub fn new(csv_path: impl Into<PathBuf>) -> Self {
        Self {
            csv_path: csv_path.into(),
            chunk_size: LoadOptions::default().chunk_size,
            verbose: false,
        }
    }
}

/// Full staging-reload plus dimensional refresh, wired as a task DAG:
///
/// ```text
/// load ─┬─> refresh-skus ──┬─> upsert-products ─> rebuild-aggregate
///       ├─> refresh-names ─┤
///       └──────────────────┘
/// ```
///
/// The two dimension refreshes may run concurrently; the fact upsert waits
/// on staging and both dimensions; the aggregate rebuild waits on the facts.
pub struct ProductPipeline {
    pool: PgPool,
    params: PipelineParams,
    runner: GraphRunner,
}

impl ProductPipeline {
    pub fn new(pool: PgPool, params: PipelineParams) -> Self {
        Self {
            pool,
            params,
            runner: GraphRunner::default(),
        }
    }

    pub fn with_runner(mut self, runner: GraphRunner) -> Self {
        self.runner = runner;
        self
    }

    /// Execute one full run and report every task's terminal state.
    ///
    /// A task failure is part of the report, not an `Err`: upstream tables
    /// keep their last-successful contents and downstream tables are left
    /// untouched.
    pub async fn run_once(&self) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, csv = %self.params.csv_path.display(), "pipeline run starting");

        let mut graph = TaskGraph::new();

        let load = {
            let pool = self.pool.clone();
            let csv_path = self.params.csv_path.clone();
            let opts = LoadOptions {
                chunk_size: self.params.chunk_size,
                truncate_before_insert: true,
            };
            let verbose = self.params.verbose;
            graph.add_task(TASK_LOAD_STAGING, &[], move || {
                let pool = pool.clone();
                let csv_path = csv_path.clone();
                async move {
                    ensure_schema(&pool).await?;
                    let report = move |message: &str| info!(%run_id, "{message}");
                    let progress = verbose.then_some(&report as ProgressFn<'_>);
                    load_csv_to_staging(&pool, &csv_path, opts, progress)
                        .await
                        .with_context(|| format!("loading {}", csv_path.display()))?;
                    Ok(())
                }
            })
        };

        let refresh_skus = {
            let pool = self.pool.clone();
            graph.add_task(TASK_REFRESH_SKUS, &[load], move || {
                let pool = pool.clone();
                async move { refresh_dimension(&pool, Dimension::Sku).await }
            })
        };

        let refresh_names = {
            let pool = self.pool.clone();
            graph.add_task(TASK_REFRESH_NAMES, &[load], move || {
                let pool = pool.clone();
                async move { refresh_dimension(&pool, Dimension::Name).await }
            })
        };

        let facts = {
            let pool = self.pool.clone();
            graph.add_task(
                TASK_UPSERT_FACTS,
                &[load, refresh_skus, refresh_names],
                move || {
                    let pool = pool.clone();
                    async move { upsert_facts(&pool).await }
                },
            )
        };

        {
            let pool = self.pool.clone();
            graph.add_task(TASK_REBUILD_AGGREGATE, &[facts], move || {
                let pool = pool.clone();
                async move { rebuild_aggregate(&pool).await }
            });
        }

        let tasks = self.runner.run(graph).await;
        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            tasks,
        };
        info!(%run_id, succeeded = report.succeeded(), "pipeline run finished");
        report
    }
}
