//! Maps `(work, resource)` pairs to readback records once their fence
//! retires.

use std::collections::HashMap;

use crate::handle::{ResourceHandle, WorkHandle};

/// One recorded download. The resource itself is the staging memory (CPU-read
/// resources are persistently mapped), so the record only pins coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadRecord {
    pub fence_value: u64,
    pub resource: ResourceHandle,
    pub mip_level: u32,
    pub array_slice: u32,
}

/// Query outcome, before any bytes are copied out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadQuery {
    Ready(DownloadRecord),
    NotReady,
    Invalid,
}

#[derive(Default)]
pub struct DownloadLedger {
    entries: HashMap<(WorkHandle, ResourceHandle), DownloadRecord>,
}

impl DownloadLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, work: WorkHandle, record: DownloadRecord) {
        self.entries.insert((work, record.resource), record);
    }

    /// Resolves a download query against the queue's completed fence value.
    /// The requested subresource must match what the download command named.
    pub fn query(
        &self,
        work: WorkHandle,
        resource: ResourceHandle,
        mip_level: u32,
        array_slice: u32,
        completed_fence: u64,
    ) -> DownloadQuery {
        match self.entries.get(&(work, resource)) {
            None => DownloadQuery::Invalid,
            Some(record) if record.mip_level != mip_level || record.array_slice != array_slice => {
                DownloadQuery::Invalid
            }
            Some(record) if record.fence_value > completed_fence => DownloadQuery::NotReady,
            Some(record) => DownloadQuery::Ready(*record),
        }
    }

    /// Invalidates every record of a released work handle.
    pub fn release_work(&mut self, work: WorkHandle) {
        self.entries.retain(|(w, _), _| *w != work);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(fence_value: u64, resource: ResourceHandle) -> DownloadRecord {
        DownloadRecord { fence_value, resource, mip_level: 0, array_slice: 0 }
    }

    #[test]
    fn query_tracks_fence_progress() {
        let mut ledger = DownloadLedger::new();
        let work = WorkHandle::from_bits(0);
        let r = ResourceHandle::from_bits(9);
        ledger.insert(work, record(2, r));

        assert_eq!(ledger.query(work, r, 0, 0, 1), DownloadQuery::NotReady);
        assert_eq!(ledger.query(work, r, 0, 0, 2), DownloadQuery::Ready(record(2, r)));
        // Unknown pair and mismatched subresource are both invalid.
        assert_eq!(
            ledger.query(work, ResourceHandle::from_bits(1), 0, 0, 2),
            DownloadQuery::Invalid
        );
        assert_eq!(ledger.query(work, r, 1, 0, 2), DownloadQuery::Invalid);
    }

    #[test]
    fn release_invalidates_all_records_for_a_work() {
        let mut ledger = DownloadLedger::new();
        let work_a = WorkHandle::from_bits(0);
        let work_b = WorkHandle::from_bits(1);
        let r = ResourceHandle::from_bits(9);
        ledger.insert(work_a, record(1, r));
        ledger.insert(work_b, record(2, r));

        ledger.release_work(work_a);
        assert_eq!(ledger.query(work_a, r, 0, 0, 9), DownloadQuery::Invalid);
        assert_eq!(ledger.query(work_b, r, 0, 0, 9), DownloadQuery::Ready(record(2, r)));
    }
}
