//! Trait seams between the core and its collaborators.
//!
//! The snapshot-isolation layer never drives its own invocation: a host
//! region calls the [`RegionObserver`] hooks at well-defined boundary
//! points, and the observer consults the transaction store through the
//! [`TxnStore`] seam. All seams are object safe so implementations can be
//! mocked or decorated (the completed-transaction cache is a `TxnStore`
//! decorator).

use crate::cell::{Cell, CellMeta, CellValue, RowKey};
use crate::error::SiResult;
use crate::types::{TransitionOutcome, Txn, TxnId, TxnTransition, TxnView};
use std::sync::Arc;

/// Issues globally unique, monotonically increasing timestamps.
///
/// Timestamps are the sole ordering authority: they never decrease and are
/// never reused. No wall-clock dependence.
pub trait TimestampSource: Send + Sync {
    /// Allocate the next timestamp.
    fn next(&self) -> u64;

    /// The most recently allocated timestamp, without allocating.
    fn current(&self) -> u64;
}

/// Authoritative store of transaction records.
///
/// The store is a record of fact: it persists records, applies transitions
/// it is handed, and answers point lookups. Deciding which transition to
/// apply is the lifecycle manager's job.
pub trait TxnStore: Send + Sync {
    /// Persist a new transaction record.
    ///
    /// Fails with `DuplicateTransaction` if the id already exists.
    fn record_new_transaction(&self, txn: Txn) -> SiResult<()>;

    /// Look up a transaction, failing with `TransactionNotFound` if absent.
    ///
    /// `fetch_destination_tables` controls whether the view carries the
    /// destination table list.
    fn get_transaction(&self, id: TxnId, fetch_destination_tables: bool) -> SiResult<TxnView>;

    /// Record a table an active transaction is writing to.
    ///
    /// Fails with `TransactionNotFound` if the id was never recorded.
    fn register_destination_table(&self, id: TxnId, table: Vec<u8>) -> SiResult<()>;

    /// Fast-path hook: return a cached view without touching the backing
    /// record, or `None` if this store holds no cache entry for the id.
    fn get_transaction_from_cache(&self, id: TxnId) -> Option<TxnView>;

    /// Whether a terminal view of this transaction currently resides in a
    /// cache layer. Plain stores return `false`.
    fn transaction_cached(&self, id: TxnId) -> bool {
        let _ = id;
        false
    }

    /// Apply a lifecycle transition atomically for the given id.
    ///
    /// Races between concurrent transitions resolve deterministically at
    /// the entry: the first to land wins, the loser observes the winner's
    /// terminal state.
    fn transition(&self, id: TxnId, transition: TxnTransition) -> SiResult<TransitionOutcome>;
}

/// Decision of a [`VersionFilter`] for one candidate cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    /// Include this version in the result.
    Include,
    /// Skip this version, keep examining older ones.
    Skip,
    /// Stop examining versions of this row entirely.
    NextRow,
}

/// Predicate evaluated per candidate version at read time.
///
/// The host store walks a row's versions newest first and consults every
/// injected filter; a version is returned only if all filters include it.
pub trait VersionFilter: Send + Sync {
    /// Judge one candidate version of `row`.
    fn check(&self, row: &[u8], cell: &Cell) -> SiResult<FilterDecision>;
}

/// Decision of a [`CompactionFilter`] for one stored cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionDecision {
    /// Retain the cell.
    Keep,
    /// Physically remove the cell.
    Drop,
}

/// Stateful per-compaction predicate. The host feeds cells row by row,
/// newest version first within each row.
pub trait CompactionFilter: Send {
    /// Judge one cell of `row`.
    fn check(&mut self, row: &[u8], cell: &Cell) -> SiResult<CompactionDecision>;
}

/// A point read request, mutable so observers can inject filters.
pub struct GetRequest {
    /// Row to read.
    pub row: RowKey,
    /// Reading transaction, if the read is transactional.
    pub reader: Option<TxnId>,
    /// Filters to evaluate per candidate version (must pass all).
    pub filters: Vec<Arc<dyn VersionFilter>>,
}

impl GetRequest {
    /// A transactional read of `row` on behalf of `reader`.
    pub fn new(row: RowKey, reader: TxnId) -> Self {
        Self {
            row,
            reader: Some(reader),
            filters: Vec::new(),
        }
    }

    /// A raw read with no transaction attached; no visibility filtering
    /// will be injected for it.
    pub fn raw(row: RowKey) -> Self {
        Self {
            row,
            reader: None,
            filters: Vec::new(),
        }
    }
}

/// A range read request over `[start, end)`, mutable so observers can
/// inject filters.
pub struct ScanRequest {
    /// Inclusive start row.
    pub start: RowKey,
    /// Exclusive end row; `None` scans to the end of the partition.
    pub end: Option<RowKey>,
    /// Reading transaction, if the scan is transactional.
    pub reader: Option<TxnId>,
    /// Filters to evaluate per candidate version (must pass all).
    pub filters: Vec<Arc<dyn VersionFilter>>,
}

impl ScanRequest {
    /// A transactional scan on behalf of `reader`.
    pub fn new(start: RowKey, end: Option<RowKey>, reader: TxnId) -> Self {
        Self {
            start,
            end,
            reader: Some(reader),
            filters: Vec::new(),
        }
    }
}

/// A tagged write request.
pub struct PutRequest {
    /// Row to write.
    pub row: RowKey,
    /// The writing transaction; the stored cell is tagged with it.
    pub txn: TxnId,
    /// Payload, or `Tombstone` to express deletion.
    pub value: CellValue,
}

/// A direct delete request. The snapshot-isolation observer rejects these.
pub struct DeleteRequest {
    /// Row the caller asked to delete.
    pub row: RowKey,
    /// Requesting transaction.
    pub txn: TxnId,
}

/// Verdict of a pre-write hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverVerdict {
    /// The host should apply the operation itself.
    Continue,
    /// The observer fully handled the operation; the host skips it.
    Bypass,
}

/// Mutation and inspection surface a host region exposes to observers and
/// to the roll-forward rewriter.
pub trait RegionHost: Send + Sync {
    /// Partition identifier, stable for the host's lifetime.
    fn partition(&self) -> &str;

    /// All stored versions of `row`, newest writer first.
    fn versions(&self, row: &[u8]) -> Vec<Cell>;

    /// Store a new version of `row`.
    fn write_cell(&self, row: RowKey, cell: Cell);

    /// Store a new version of `row` only if `check` approves the row's
    /// current versions. The check and the write are one atomic step with
    /// respect to every other writer of the row; nothing is stored when
    /// the check fails.
    ///
    /// `check` runs while the host holds its row lock and must not call
    /// back into the host.
    fn write_cell_checked(
        &self,
        row: RowKey,
        cell: Cell,
        check: &dyn Fn(&[Cell]) -> SiResult<()>,
    ) -> SiResult<()>;

    /// Atomically replace the metadata of the version of `row` written by
    /// `txn`. Returns false if no such version exists. Readers never
    /// observe a partially rewritten cell.
    fn replace_meta(&self, row: &[u8], txn: TxnId, meta: CellMeta) -> bool;
}

/// Hooks invoked by the host region at its operation boundaries.
///
/// Call points, in host order:
/// - `pre_get` / `pre_scan` before serving a read, with the mutable
///   request so filters can be injected;
/// - `pre_put` / `pre_delete` before applying a mutation, with a verdict
///   that may bypass the host's own write path;
/// - `pre_flush`/`post_flush`, `pre_compact`/`post_compact`,
///   `pre_split`/`post_split` bracketing partition maintenance;
///   `pre_compact` may hand back a filter that judges every stored cell.
///
/// All methods default to no-ops so observers implement only the
/// boundaries they care about.
pub trait RegionObserver: Send + Sync {
    /// Before a point read.
    fn pre_get(&self, host: &dyn RegionHost, get: &mut GetRequest) -> SiResult<()> {
        let _ = (host, get);
        Ok(())
    }

    /// Before opening a scan.
    fn pre_scan(&self, host: &dyn RegionHost, scan: &mut ScanRequest) -> SiResult<()> {
        let _ = (host, scan);
        Ok(())
    }

    /// Before applying a put.
    fn pre_put(&self, host: &dyn RegionHost, put: &PutRequest) -> SiResult<ObserverVerdict> {
        let _ = (host, put);
        Ok(ObserverVerdict::Continue)
    }

    /// Before applying a delete.
    fn pre_delete(
        &self,
        host: &dyn RegionHost,
        delete: &DeleteRequest,
    ) -> SiResult<ObserverVerdict> {
        let _ = (host, delete);
        Ok(ObserverVerdict::Continue)
    }

    /// Before a memstore flush.
    fn pre_flush(&self, host: &dyn RegionHost) -> SiResult<()> {
        let _ = host;
        Ok(())
    }

    /// After a memstore flush.
    fn post_flush(&self, host: &dyn RegionHost) -> SiResult<()> {
        let _ = host;
        Ok(())
    }

    /// Before a compaction; may return a filter applied to every cell.
    fn pre_compact(&self, host: &dyn RegionHost) -> SiResult<Option<Box<dyn CompactionFilter>>> {
        let _ = host;
        Ok(None)
    }

    /// After a compaction.
    fn post_compact(&self, host: &dyn RegionHost) -> SiResult<()> {
        let _ = host;
        Ok(())
    }

    /// Before a partition split.
    fn pre_split(&self, host: &dyn RegionHost) -> SiResult<()> {
        let _ = host;
        Ok(())
    }

    /// After a partition split.
    fn post_split(&self, host: &dyn RegionHost) -> SiResult<()> {
        let _ = host;
        Ok(())
    }
}

/// Per-partition backup marker collaborator.
///
/// The core's only obligations: decline backup readiness while partition
/// maintenance is in flight, and hold flush/compact/split while a marker
/// exists.
pub trait BackupCoordinator: Send + Sync {
    /// Create the backup-in-progress marker for a partition.
    fn create_marker(&self, partition: &str) -> SiResult<()>;

    /// Remove the marker.
    fn clear_marker(&self, partition: &str);

    /// Whether a marker currently exists.
    fn marker_exists(&self, partition: &str) -> bool;

    /// Whether the backup owning the marker was aborted externally.
    /// Used as a liveness check so waiters do not block forever on a
    /// marker nobody will clear.
    fn backup_aborted(&self, partition: &str) -> bool;
}
