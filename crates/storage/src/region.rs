//! The region: one partition of the versioned store.

use parking_lot::RwLock;
use sierra_core::{
    Cell, CellMeta, CompactionDecision, CompactionFilter, DeleteRequest, FilterDecision, GetRequest,
    ObserverVerdict, PutRequest, RegionHost, RegionObserver, RowKey, ScanRequest, SiResult,
};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use tracing::debug;

/// One partition: a sorted row map where each row holds its versions
/// newest writer first.
///
/// Observers are consulted before the region touches its own state, and
/// never while the row map lock is held, so an observer is free to call
/// back into the region through [`RegionHost`]. The one exception is the
/// check closure of [`RegionHost::write_cell_checked`], which runs under
/// the row lock so the verdict and the insert are a single atomic step.
pub struct Region {
    name: String,
    observers: Vec<Arc<dyn RegionObserver>>,
    rows: RwLock<BTreeMap<RowKey, Vec<Cell>>>,
}

impl Region {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            observers: Vec::new(),
            rows: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register an observer. Observers run in registration order.
    pub fn with_observer(mut self, observer: Arc<dyn RegionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Serve a point read: run pre-get hooks, then walk the row's versions
    /// newest first until one passes every filter.
    pub fn get(&self, mut get: GetRequest) -> SiResult<Option<Cell>> {
        for observer in &self.observers {
            observer.pre_get(self, &mut get)?;
        }
        let versions = self.versions(&get.row);
        self.first_passing(&get.row, &versions, &get.filters)
    }

    /// Serve a range read over `[start, end)`. A row appears in the result
    /// iff one of its versions passes every filter.
    pub fn scan(&self, mut scan: ScanRequest) -> SiResult<Vec<(RowKey, Cell)>> {
        for observer in &self.observers {
            observer.pre_scan(self, &mut scan)?;
        }

        let snapshot: Vec<(RowKey, Vec<Cell>)> = {
            let rows = self.rows.read();
            let upper = match &scan.end {
                Some(end) => Bound::Excluded(end.clone()),
                None => Bound::Unbounded,
            };
            rows.range((Bound::Included(scan.start.clone()), upper))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };

        let mut out = Vec::new();
        for (row, versions) in snapshot {
            if let Some(cell) = self.first_passing(&row, &versions, &scan.filters)? {
                out.push((row, cell));
            }
        }
        Ok(out)
    }

    /// Apply a put, unless an observer bypasses it (the observer then owns
    /// the write).
    pub fn put(&self, put: PutRequest) -> SiResult<()> {
        for observer in &self.observers {
            if observer.pre_put(self, &put)? == ObserverVerdict::Bypass {
                return Ok(());
            }
        }
        self.write_cell(put.row, Cell::unresolved(put.txn, put.value));
        Ok(())
    }

    /// Apply a delete, unless an observer bypasses or rejects it. The
    /// region's own delete is physical: it removes every version of the
    /// row.
    pub fn delete(&self, delete: DeleteRequest) -> SiResult<()> {
        for observer in &self.observers {
            if observer.pre_delete(self, &delete)? == ObserverVerdict::Bypass {
                return Ok(());
            }
        }
        self.rows.write().remove(&delete.row);
        Ok(())
    }

    /// Flush the partition. The in-memory region has nothing to persist;
    /// the hooks are the point.
    ///
    /// Post hooks run for every observer whose pre hook succeeded, even
    /// when a later pre hook failed, so acquired maintenance state is
    /// always released.
    pub fn flush(&self) -> SiResult<()> {
        let mut armed = 0;
        let mut result = Ok(());
        for observer in &self.observers {
            if let Err(err) = observer.pre_flush(self) {
                result = Err(err);
                break;
            }
            armed += 1;
        }
        for observer in &self.observers[..armed] {
            let post = observer.post_flush(self);
            if result.is_ok() {
                result = post;
            }
        }
        result
    }

    /// Compact the partition: collect a filter from each observer, feed
    /// every cell through them (rows in key order, versions newest first),
    /// and drop any cell a filter condemns. Returns the number of cells
    /// removed.
    ///
    /// A filter error aborts the run without removing anything, but the
    /// post hooks of every armed observer still fire.
    pub fn compact(&self) -> SiResult<usize> {
        let mut filters = Vec::new();
        let mut armed = 0;
        let mut result = Ok(0);
        for observer in &self.observers {
            match observer.pre_compact(self) {
                Ok(filter) => {
                    armed += 1;
                    filters.extend(filter);
                }
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }
        if result.is_ok() {
            result = self.reap(&mut filters);
        }
        for observer in &self.observers[..armed] {
            let post = observer.post_compact(self);
            if result.is_ok() {
                if let Err(err) = post {
                    result = Err(err);
                }
            }
        }
        if let Ok(dropped) = &result {
            debug!(partition = %self.name, dropped = *dropped, "compaction finished");
        }
        result
    }

    fn reap(&self, filters: &mut [Box<dyn CompactionFilter>]) -> SiResult<usize> {
        let snapshot: Vec<(RowKey, Vec<Cell>)> = {
            let rows = self.rows.read();
            rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let mut condemned: Vec<(RowKey, CellMeta)> = Vec::new();
        for (row, versions) in &snapshot {
            for cell in versions {
                let mut drop_cell = false;
                for filter in filters.iter_mut() {
                    if filter.check(row, cell)? == CompactionDecision::Drop {
                        drop_cell = true;
                        break;
                    }
                }
                if drop_cell {
                    condemned.push((row.clone(), cell.meta));
                }
            }
        }

        let dropped = condemned.len();
        let mut rows = self.rows.write();
        for (row, meta) in condemned {
            if let Some(versions) = rows.get_mut(&row) {
                versions.retain(|c| c.meta != meta);
                if versions.is_empty() {
                    rows.remove(&row);
                }
            }
        }
        Ok(dropped)
    }

    /// Split the partition at `split_key`: rows at or above the key move
    /// into a new region sharing this region's observers. Post hooks fire
    /// for every armed observer whether or not the split happened.
    pub fn split(&self, split_key: &[u8], new_name: impl Into<String>) -> SiResult<Region> {
        let mut armed = 0;
        let mut failure = None;
        for observer in &self.observers {
            if let Err(err) = observer.pre_split(self) {
                failure = Some(err);
                break;
            }
            armed += 1;
        }

        let mut result = match failure {
            None => {
                let upper = self.rows.write().split_off(&split_key.to_vec());
                Ok(Region {
                    name: new_name.into(),
                    observers: self.observers.clone(),
                    rows: RwLock::new(upper),
                })
            }
            Some(err) => Err(err),
        };

        for observer in &self.observers[..armed] {
            let post = observer.post_split(self);
            if result.is_ok() {
                if let Err(err) = post {
                    result = Err(err);
                }
            }
        }
        if let Ok(sibling) = &result {
            debug!(partition = %self.name, sibling = %sibling.name, "partition split");
        }
        result
    }

    /// Number of rows with at least one stored version.
    pub fn row_count(&self) -> usize {
        self.rows.read().len()
    }

    /// Total stored versions across all rows.
    pub fn cell_count(&self) -> usize {
        self.rows.read().values().map(Vec::len).sum()
    }

    // Versions stay ordered by writer id descending; writer ids are
    // begin timestamps, so newer writers sort first. One version per
    // (row, writer): a writer overwriting its own cell replaces it.
    fn insert_version(versions: &mut Vec<Cell>, cell: Cell) {
        let writer = cell.meta.txn();
        match versions.iter().position(|c| c.meta.txn() <= writer) {
            Some(at) if versions[at].meta.txn() == writer => versions[at] = cell,
            Some(at) => versions.insert(at, cell),
            None => versions.push(cell),
        }
    }

    fn first_passing(
        &self,
        row: &[u8],
        versions: &[Cell],
        filters: &[Arc<dyn sierra_core::VersionFilter>],
    ) -> SiResult<Option<Cell>> {
        'versions: for cell in versions {
            for filter in filters {
                match filter.check(row, cell)? {
                    FilterDecision::Include => {}
                    FilterDecision::Skip => continue 'versions,
                    FilterDecision::NextRow => break 'versions,
                }
            }
            return Ok(Some(cell.clone()));
        }
        Ok(None)
    }
}

impl RegionHost for Region {
    fn partition(&self) -> &str {
        &self.name
    }

    fn versions(&self, row: &[u8]) -> Vec<Cell> {
        self.rows.read().get(row).cloned().unwrap_or_default()
    }

    fn write_cell(&self, row: RowKey, cell: Cell) {
        let mut rows = self.rows.write();
        Self::insert_version(rows.entry(row).or_default(), cell);
    }

    fn write_cell_checked(
        &self,
        row: RowKey,
        cell: Cell,
        check: &dyn Fn(&[Cell]) -> SiResult<()>,
    ) -> SiResult<()> {
        let mut rows = self.rows.write();
        match rows.get_mut(&row) {
            Some(versions) => {
                check(versions)?;
                Self::insert_version(versions, cell);
            }
            None => {
                check(&[])?;
                rows.insert(row, vec![cell]);
            }
        }
        Ok(())
    }

    fn replace_meta(&self, row: &[u8], txn: sierra_core::TxnId, meta: CellMeta) -> bool {
        let mut rows = self.rows.write();
        if let Some(versions) = rows.get_mut(row) {
            for cell in versions.iter_mut() {
                if cell.meta.txn() == txn {
                    cell.meta = meta;
                    return true;
                }
            }
        }
        false
    }
}
