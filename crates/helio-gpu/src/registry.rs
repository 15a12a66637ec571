//! Canonical store of live resources, tables and in-flight work bundles.
//!
//! The registry is the sole owner of authoritative GPU state. Bundle building
//! only reads it (shared lock); the one mutation path is
//! [`WorkRegistry::commit_resource_states`], taken after a bundle's fence has
//! retired, so a failed or cancelled build can never corrupt visible state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::bundle::{GpuState, MemFlags, WorkBundle};
use crate::error::CommitError;
use crate::handle::{HandleContainer, ResourceHandle, ResourceTable, WorkHandle};

/// Shape of a registered resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Buffer {
        element_count: u32,
        stride: u32,
        constant_buffer: bool,
    },
    Texture {
        width: u32,
        height: u32,
        depth: u32,
        mip_levels: u32,
        array_slices: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceInfo {
    pub kind: ResourceKind,
    pub mem_flags: MemFlags,
    pub gpu_state: GpuState,
}

#[derive(Debug, Clone)]
pub struct TableInfo {
    pub resources: Vec<ResourceHandle>,
    pub is_uav: bool,
}

/// A table member that is not (or no longer) a registered resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnregisteredResource(pub ResourceHandle);

impl core::fmt::Display for UnregisteredResource {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "table member {:?} is not a registered resource", self.0)
    }
}

impl std::error::Error for UnregisteredResource {}

#[derive(Default)]
pub(crate) struct RegistryState {
    pub resources: HashMap<ResourceHandle, ResourceInfo>,
    pub tables: HashMap<ResourceTable, TableInfo>,
}

/// Bookkeeping for one scheduled bundle.
pub(crate) struct WorkRecord {
    pub bundle: Arc<WorkBundle>,
    pub fence_value: Option<u64>,
    pub auto_release: bool,
    pub committed: bool,
}

pub struct WorkRegistry {
    // Lock order: `works` before `state` whenever both are needed.
    pub(crate) state: RwLock<RegistryState>,
    works: Mutex<HandleContainer<WorkHandle, WorkRecord>>,
}

impl Default for WorkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkRegistry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            works: Mutex::new(HandleContainer::new()),
        }
    }

    pub fn register_resource(
        &self,
        handle: ResourceHandle,
        kind: ResourceKind,
        mem_flags: MemFlags,
        initial_state: GpuState,
    ) {
        let mut state = self.state.write().unwrap();
        state.resources.insert(
            handle,
            ResourceInfo { kind, mem_flags, gpu_state: initial_state },
        );
    }

    pub fn unregister_resource(&self, handle: ResourceHandle) -> bool {
        self.state.write().unwrap().resources.remove(&handle).is_some()
    }

    /// Registers an immutable table. Every member must already be registered.
    pub fn register_table(
        &self,
        table: ResourceTable,
        resources: &[ResourceHandle],
        is_uav: bool,
    ) -> Result<(), UnregisteredResource> {
        let mut state = self.state.write().unwrap();
        for &r in resources {
            if !state.resources.contains_key(&r) {
                return Err(UnregisteredResource(r));
            }
        }
        state.tables.insert(table, TableInfo { resources: resources.to_vec(), is_uav });
        Ok(())
    }

    pub fn unregister_table(&self, table: ResourceTable) -> bool {
        self.state.write().unwrap().tables.remove(&table).is_some()
    }

    pub fn resource_info(&self, handle: ResourceHandle) -> Option<ResourceInfo> {
        self.state.read().unwrap().resources.get(&handle).copied()
    }

    pub fn table_info(&self, table: ResourceTable) -> Option<TableInfo> {
        self.state.read().unwrap().tables.get(&table).cloned()
    }

    /// Stores a freshly built bundle and returns its work handle.
    pub fn insert_work(&self, bundle: WorkBundle, auto_release: bool) -> WorkHandle {
        self.works.lock().unwrap().allocate(WorkRecord {
            bundle: Arc::new(bundle),
            fence_value: None,
            auto_release,
            committed: false,
        })
    }

    pub fn work_bundle(&self, work: WorkHandle) -> Option<Arc<WorkBundle>> {
        self.works.lock().unwrap().get(work).map(|r| r.bundle.clone())
    }

    pub fn work_fence(&self, work: WorkHandle) -> Option<u64> {
        self.works.lock().unwrap().get(work).and_then(|r| r.fence_value)
    }

    /// Stamps the fence value a bundle was submitted against.
    pub fn set_work_fence(&self, work: WorkHandle, fence_value: u64) {
        if let Some(record) = self.works.lock().unwrap().get_mut(work) {
            record.fence_value = Some(fence_value);
        }
    }

    /// Writes a retired bundle's final recorded states back into the
    /// registry. Serialized by the registry's writer lock; idempotent per
    /// work handle.
    pub fn commit_resource_states(&self, work: WorkHandle) -> Result<(), CommitError> {
        let mut works = self.works.lock().unwrap();
        let record = works.get_mut(work).ok_or(CommitError::UnknownWork)?;
        if record.committed {
            return Ok(());
        }
        let bundle = record.bundle.clone();

        // A resource released while the work was in flight simply drops out
        // of the commit; its registry entry is already gone.
        let mut state = self.state.write().unwrap();
        for (r, recorded) in &bundle.states {
            if let Some(info) = state.resources.get_mut(r) {
                info.gpu_state = recorded.state;
            }
        }
        record.committed = true;
        Ok(())
    }

    /// Commits every work whose fence has retired and returns the handles
    /// that were scheduled for automatic release.
    pub fn finish_retired(&self, completed_fence: u64) -> Vec<WorkHandle> {
        let pending: Vec<WorkHandle> = {
            let works = self.works.lock().unwrap();
            works
                .iter()
                .filter(|(_, r)| {
                    !r.committed && r.fence_value.is_some_and(|f| f <= completed_fence)
                })
                .map(|(h, _)| h)
                .collect()
        };

        let mut auto_released = Vec::new();
        for work in pending {
            let _ = self.commit_resource_states(work);
            let auto = self
                .works
                .lock()
                .unwrap()
                .get(work)
                .is_some_and(|r| r.auto_release);
            if auto {
                self.release_work(work);
                auto_released.push(work);
            }
        }
        auto_released
    }

    /// Drops a bundle; stale handles are ignored.
    pub fn release_work(&self, work: WorkHandle) -> bool {
        self.works.lock().unwrap().free(work).is_some()
    }

    pub fn live_work_count(&self) -> usize {
        self.works.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{CommandLocation, WorkResourceState};

    fn buffer_kind() -> ResourceKind {
        ResourceKind::Buffer { element_count: 16, stride: 4, constant_buffer: false }
    }

    #[test]
    fn table_registration_requires_registered_members() {
        let registry = WorkRegistry::new();
        let r = ResourceHandle::from_bits(1);
        let t = ResourceTable::from_bits(1);

        assert_eq!(
            registry.register_table(t, &[r], true),
            Err(UnregisteredResource(r))
        );

        registry.register_resource(r, buffer_kind(), MemFlags::GPU_WRITE, GpuState::Default);
        assert!(registry.register_table(t, &[r], true).is_ok());
        let info = registry.table_info(t).unwrap();
        assert!(info.is_uav);
        assert_eq!(info.resources, vec![r]);

        assert!(registry.unregister_table(t));
        assert!(registry.table_info(t).is_none());
    }

    #[test]
    fn commit_applies_final_recorded_states() {
        let registry = WorkRegistry::new();
        let r = ResourceHandle::from_bits(1);
        registry.register_resource(r, buffer_kind(), MemFlags::GPU_WRITE, GpuState::Default);

        let mut bundle = WorkBundle::default();
        bundle.states.insert(
            r,
            WorkResourceState { state: GpuState::Srv, location: CommandLocation::default() },
        );
        let work = registry.insert_work(bundle, false);
        registry.set_work_fence(work, 1);

        registry.commit_resource_states(work).unwrap();
        assert_eq!(registry.resource_info(r).unwrap().gpu_state, GpuState::Srv);

        // Idempotent.
        registry.commit_resource_states(work).unwrap();
        assert_eq!(registry.resource_info(r).unwrap().gpu_state, GpuState::Srv);
    }

    #[test]
    fn finish_retired_commits_and_reports_auto_releases() {
        let registry = WorkRegistry::new();
        let r = ResourceHandle::from_bits(1);
        registry.register_resource(r, buffer_kind(), MemFlags::GPU_WRITE, GpuState::Default);

        let mut bundle = WorkBundle::default();
        bundle.states.insert(
            r,
            WorkResourceState { state: GpuState::Uav, location: CommandLocation::default() },
        );
        let auto = registry.insert_work(bundle.clone(), true);
        let kept = registry.insert_work(bundle, false);
        registry.set_work_fence(auto, 1);
        registry.set_work_fence(kept, 2);

        // Nothing retired yet.
        assert!(registry.finish_retired(0).is_empty());
        assert_eq!(registry.live_work_count(), 2);

        let released = registry.finish_retired(1);
        assert_eq!(released, vec![auto]);
        assert_eq!(registry.live_work_count(), 1);
        assert_eq!(registry.resource_info(r).unwrap().gpu_state, GpuState::Uav);

        // The kept work retires later and stays alive until released.
        assert!(registry.finish_retired(2).is_empty());
        assert_eq!(registry.live_work_count(), 1);
        assert!(registry.release_work(kept));
        assert!(!registry.release_work(kept));
    }

    #[test]
    fn commit_fails_for_stale_work() {
        let registry = WorkRegistry::new();
        let work = registry.insert_work(WorkBundle::default(), false);
        registry.release_work(work);
        assert_eq!(
            registry.commit_resource_states(work),
            Err(CommitError::UnknownWork)
        );
    }
}
