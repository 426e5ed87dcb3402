//! Machine status counts
//!
//! MSM heartbeats report how many machines sit in each of five coarse
//! buckets. The raw numbers come from a [`MachineStatusSource`], grouped by
//! MAAS node status code.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tracing::instrument;

use crate::error::CollaboratorError;

/// MAAS node status codes
pub mod node_status {
    pub const NEW: i32 = 0;
    pub const COMMISSIONING: i32 = 1;
    pub const FAILED_COMMISSIONING: i32 = 2;
    pub const MISSING: i32 = 3;
    pub const READY: i32 = 4;
    pub const RESERVED: i32 = 5;
    pub const DEPLOYED: i32 = 6;
    pub const RETIRED: i32 = 7;
    pub const BROKEN: i32 = 8;
    pub const DEPLOYING: i32 = 9;
    pub const ALLOCATED: i32 = 10;
    pub const FAILED_DEPLOYMENT: i32 = 11;
    pub const RELEASING: i32 = 12;
    pub const FAILED_RELEASING: i32 = 13;
    pub const DISK_ERASING: i32 = 14;
    pub const FAILED_DISK_ERASING: i32 = 15;
    pub const RESCUE_MODE: i32 = 16;
    pub const ENTERING_RESCUE_MODE: i32 = 17;
    pub const FAILED_ENTERING_RESCUE_MODE: i32 = 18;
    pub const EXITING_RESCUE_MODE: i32 = 19;
    pub const FAILED_EXITING_RESCUE_MODE: i32 = 20;
    pub const TESTING: i32 = 21;
    pub const FAILED_TESTING: i32 = 22;
}

/// `node_type` of machines (as opposed to controllers and devices)
pub const NODE_TYPE_MACHINE: i32 = 0;

/// Bucket a status is reported under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusBucket {
    Allocated,
    Deployed,
    Ready,
    Error,
    Other,
}

impl StatusBucket {
    /// Classify a node status code
    pub fn for_status(status: i32) -> Self {
        use node_status::*;

        match status {
            ALLOCATED => Self::Allocated,
            DEPLOYED => Self::Deployed,
            READY => Self::Ready,
            FAILED_COMMISSIONING
            | FAILED_DEPLOYMENT
            | FAILED_DISK_ERASING
            | FAILED_ENTERING_RESCUE_MODE
            | FAILED_EXITING_RESCUE_MODE
            | FAILED_RELEASING
            | FAILED_TESTING => Self::Error,
            _ => Self::Other,
        }
    }
}

/// Machine counts by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineStatsByStatus {
    pub allocated: i64,
    pub deployed: i64,
    pub ready: i64,
    pub error: i64,
    pub other: i64,
}

impl MachineStatsByStatus {
    /// Fold `(status, count)` pairs into buckets
    pub fn from_counts(counts: impl IntoIterator<Item = (i32, i64)>) -> Self {
        let mut stats = Self::default();
        for (status, total) in counts {
            let bucket = match StatusBucket::for_status(status) {
                StatusBucket::Allocated => &mut stats.allocated,
                StatusBucket::Deployed => &mut stats.deployed,
                StatusBucket::Ready => &mut stats.ready,
                StatusBucket::Error => &mut stats.error,
                StatusBucket::Other => &mut stats.other,
            };
            *bucket += total;
        }
        stats
    }
}

/// Grouped machine counts by status code
#[async_trait]
pub trait MachineStatusSource: Send + Sync {
    /// `(status, count)` for every status with at least one machine
    async fn count_by_status(&self) -> Result<Vec<(i32, i64)>, CollaboratorError>;
}

// =============================================================================
// In-memory source
// =============================================================================

/// Machine source over a fixed list of statuses
#[derive(Default)]
pub struct InMemoryMachineStatusSource {
    statuses: RwLock<Vec<i32>>,
    calls: AtomicUsize,
}

impl InMemoryMachineStatusSource {
    pub fn new(statuses: Vec<i32>) -> Self {
        Self {
            statuses: RwLock::new(statuses),
            calls: AtomicUsize::new(0),
        }
    }

    /// Replace the machine statuses
    pub fn set_statuses(&self, statuses: Vec<i32>) {
        *self.statuses.write() = statuses;
    }

    /// Number of times counts were requested
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MachineStatusSource for InMemoryMachineStatusSource {
    async fn count_by_status(&self) -> Result<Vec<(i32, i64)>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut grouped = BTreeMap::new();
        for status in self.statuses.read().iter() {
            *grouped.entry(*status).or_insert(0i64) += 1;
        }
        Ok(grouped.into_iter().collect())
    }
}

// =============================================================================
// PostgreSQL source
// =============================================================================

/// Reads `maasserver_node`
#[derive(Clone)]
pub struct PostgresMachineStatusSource {
    pool: PgPool,
}

impl PostgresMachineStatusSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MachineStatusSource for PostgresMachineStatusSource {
    #[instrument(skip(self))]
    async fn count_by_status(&self) -> Result<Vec<(i32, i64)>, CollaboratorError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(id) AS total
            FROM maasserver_node
            WHERE node_type = $1
            GROUP BY status
            "#,
        )
        .bind(NODE_TYPE_MACHINE)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| (row.get::<i32, _>("status"), row.get::<i64, _>("total")))
            .collect())
    }
}
