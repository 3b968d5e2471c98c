//! Core domain model for the product feed mart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "feedmart-core";

/// Warehouse schema holding every feedmart table.
pub const SCHEMA: &str = "products";

/// Scratch table the raw feed is bulk-loaded into.
pub const STAGING_TABLE: &str = "stg_products";
/// Fact table keyed on `(sku_id, name_id)`.
pub const FACT_TABLE: &str = "products";
/// Rollup of distinct SKU counts per name.
pub const AGGREGATE_TABLE: &str = "by_name_no_of_products";

/// One raw row of the product feed, exactly as staged.
///
/// No uniqueness is enforced at this layer; the feed may repeat
/// `(sku, name)` pairs and downstream stages are responsible for
/// collapsing them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingProduct {
    pub sku: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// The two natural-key dimensions derived from staging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dimension {
    Sku,
    Name,
}

impl Dimension {
    /// Dimension table name within [`SCHEMA`].
    pub fn table(self) -> &'static str {
        match self {
            Dimension::Sku => "skus",
            Dimension::Name => "names",
        }
    }

    /// Natural-key column, identical in staging and in the dimension table.
    pub fn column(self) -> &'static str {
        match self {
            Dimension::Sku => "sku",
            Dimension::Name => "name",
        }
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table())
    }
}

/// Terminal state of one pipeline task, reported in the run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Success,
    Failed,
    /// Never started because a predecessor failed.
    Skipped,
}

/// Per-task entry in a [`RunReport`].
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub name: String,
    pub outcome: TaskOutcome,
    /// Execution attempts consumed, including retries. Zero for skipped tasks.
    pub attempts: u32,
    pub error: Option<String>,
}

/// Summary of one full pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tasks: Vec<TaskReport>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.tasks
            .iter()
            .all(|t| t.outcome == TaskOutcome::Success)
    }
}
