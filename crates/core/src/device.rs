//! Compute devices, the shared instance service and allocator pools.
//!
//! The instance is created lazily when the first lease is taken and torn
//! down when the last lease drops. Every upscaler holds one lease for its
//! whole lifetime, so concurrent upscalers share devices without racing on
//! creation or teardown.

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::UpscaleError;
use crate::tensor::{DeviceTensor, TensorShape};

/// Static description of one compute device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceInfo {
    pub name: String,
    /// Device-local memory the engine may use, in MiB.
    pub heap_budget_mb: usize,
    pub compute_queue_count: usize,
    pub transfer_queue_count: usize,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            name: "cuda:0".to_string(),
            heap_budget_mb: 4096,
            compute_queue_count: 2,
            transfer_queue_count: 1,
        }
    }
}

struct HeapBudget {
    limit: usize,
    used: AtomicUsize,
}

impl HeapBudget {
    fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit,
            used: AtomicUsize::new(0),
        })
    }

    fn try_reserve(&self, bytes: usize) -> Result<(), UpscaleError> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|&total| total <= self.limit)
            })
            .map(|_| ())
            .map_err(|used| UpscaleError::OutOfMemory {
                requested: bytes,
                available: self.limit.saturating_sub(used),
            })
    }

    fn release(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::AcqRel);
    }

    fn in_use(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }
}

/// Bytes held by one live device tensor; returned to the heap on drop.
pub struct Allocation {
    bytes: usize,
    budget: Arc<HeapBudget>,
    live: Arc<AtomicUsize>,
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.budget.release(self.bytes);
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocatorKind {
    /// Device-local working memory.
    Blob,
    /// Host-visible memory for uploads and downloads.
    Staging,
}

pub struct BlobAllocator {
    kind: AllocatorKind,
    budget: Arc<HeapBudget>,
    live: Arc<AtomicUsize>,
}

impl BlobAllocator {
    pub fn alloc(&self, shape: TensorShape) -> Result<DeviceTensor> {
        let bytes = shape.byte_size();
        self.budget.try_reserve(bytes)?;
        self.live.fetch_add(1, Ordering::AcqRel);
        Ok(DeviceTensor::new(
            shape,
            Allocation {
                bytes,
                budget: Arc::clone(&self.budget),
                live: Arc::clone(&self.live),
            },
        ))
    }

    /// Tensors allocated here that are still alive.
    pub fn live_allocations(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

/// Recycles allocators between frames.
pub struct AllocatorPool {
    kind: AllocatorKind,
    budget: Arc<HeapBudget>,
    idle: Mutex<Vec<BlobAllocator>>,
    created: AtomicUsize,
}

impl AllocatorPool {
    fn new(kind: AllocatorKind, budget: Arc<HeapBudget>) -> Self {
        Self {
            kind,
            budget,
            idle: Mutex::new(Vec::new()),
            created: AtomicUsize::new(0),
        }
    }

    fn idle(&self) -> MutexGuard<'_, Vec<BlobAllocator>> {
        self.idle.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn acquire(&self) -> AllocatorGuard<'_> {
        let allocator = self.idle().pop().unwrap_or_else(|| {
            self.created.fetch_add(1, Ordering::AcqRel);
            BlobAllocator {
                kind: self.kind,
                budget: Arc::clone(&self.budget),
                live: Arc::new(AtomicUsize::new(0)),
            }
        });
        AllocatorGuard {
            pool: self,
            allocator: Some(allocator),
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle().len()
    }

    /// Allocators ever created by this pool.
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }
}

/// Pool checkout. The allocator goes back to the pool on drop, including
/// on error paths.
pub struct AllocatorGuard<'a> {
    pool: &'a AllocatorPool,
    allocator: Option<BlobAllocator>,
}

impl Deref for AllocatorGuard<'_> {
    type Target = BlobAllocator;

    fn deref(&self) -> &BlobAllocator {
        // Only `drop` takes the allocator out.
        match &self.allocator {
            Some(allocator) => allocator,
            None => unreachable!("allocator guard used after release"),
        }
    }
}

impl Drop for AllocatorGuard<'_> {
    fn drop(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            let live = allocator.live_allocations();
            if live > 0 {
                debug!(kind = ?allocator.kind, live, "Allocator reclaimed with live tensors");
            }
            self.pool.idle().push(allocator);
        }
    }
}

pub struct GpuDevice {
    index: usize,
    info: DeviceInfo,
    heap: Arc<HeapBudget>,
    staging_heap: Arc<HeapBudget>,
    blob_pool: AllocatorPool,
    staging_pool: AllocatorPool,
}

impl GpuDevice {
    fn new(index: usize, info: DeviceInfo) -> Self {
        let heap = HeapBudget::new(info.heap_budget_mb.saturating_mul(1024 * 1024));
        // Host-visible staging memory is not limited by the device heap.
        let staging_heap = HeapBudget::new(usize::MAX);
        Self {
            index,
            blob_pool: AllocatorPool::new(AllocatorKind::Blob, Arc::clone(&heap)),
            staging_pool: AllocatorPool::new(AllocatorKind::Staging, Arc::clone(&staging_heap)),
            heap,
            staging_heap,
            info,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn heap_budget_mb(&self) -> usize {
        self.info.heap_budget_mb
    }

    /// Device and staging bytes currently held by live tensors.
    pub fn bytes_in_use(&self) -> usize {
        self.heap.in_use() + self.staging_heap.in_use()
    }

    pub fn blob_pool(&self) -> &AllocatorPool {
        &self.blob_pool
    }

    pub fn staging_pool(&self) -> &AllocatorPool {
        &self.staging_pool
    }

    pub fn acquire_blob_allocator(&self) -> AllocatorGuard<'_> {
        self.blob_pool.acquire()
    }

    pub fn acquire_staging_allocator(&self) -> AllocatorGuard<'_> {
        self.staging_pool.acquire()
    }

    /// Number of concurrent inference threads: `requested` when non-zero,
    /// otherwise the transfer queue count, never above the compute queues.
    pub fn gpu_threads(&self, requested: usize) -> usize {
        let threads = if requested > 0 {
            requested
        } else {
            self.info.transfer_queue_count
        };
        threads.min(self.info.compute_queue_count).max(1)
    }
}

#[derive(Default)]
struct InstanceState {
    refs: usize,
    devices: Vec<Arc<GpuDevice>>,
}

/// Process-wide compute instance service.
pub struct GpuInstance {
    infos: Vec<DeviceInfo>,
    state: Mutex<InstanceState>,
}

impl GpuInstance {
    pub fn new(infos: Vec<DeviceInfo>) -> Arc<Self> {
        Arc::new(Self {
            infos,
            state: Mutex::new(InstanceState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, InstanceState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn device_infos(&self) -> &[DeviceInfo] {
        &self.infos
    }

    /// Takes a lease, creating the devices if this is the first one.
    pub fn acquire(self: &Arc<Self>) -> Result<InstanceLease> {
        let mut state = self.state();
        if state.refs == 0 {
            if self.infos.is_empty() {
                bail!(UpscaleError::DeviceUnavailable(
                    "no compute devices configured".to_string()
                ));
            }
            state.devices = self
                .infos
                .iter()
                .cloned()
                .enumerate()
                .map(|(index, info)| Arc::new(GpuDevice::new(index, info)))
                .collect();
            info!(devices = state.devices.len(), "GPU instance created");
        }
        state.refs += 1;
        debug!(refs = state.refs, "GPU instance lease acquired");
        Ok(InstanceLease {
            instance: Arc::clone(self),
            devices: state.devices.clone(),
        })
    }

    pub fn live_leases(&self) -> usize {
        self.state().refs
    }

    pub fn is_created(&self) -> bool {
        !self.state().devices.is_empty()
    }
}

/// Keeps the instance alive. Dropping the last lease destroys it.
pub struct InstanceLease {
    instance: Arc<GpuInstance>,
    devices: Vec<Arc<GpuDevice>>,
}

impl InstanceLease {
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn device(&self, index: usize) -> Result<Arc<GpuDevice>> {
        match self.devices.get(index) {
            Some(device) => Ok(Arc::clone(device)),
            None => bail!(UpscaleError::DeviceUnavailable(format!(
                "device index {index} out of range ({} available)",
                self.devices.len()
            ))),
        }
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        let mut state = self.instance.state();
        state.refs = state.refs.saturating_sub(1);
        debug!(refs = state.refs, "GPU instance lease released");
        if state.refs == 0 {
            for device in &state.devices {
                let in_use = device.bytes_in_use();
                if in_use > 0 {
                    warn!(
                        device = device.index,
                        bytes = in_use,
                        "Destroying device with live allocations"
                    );
                }
            }
            state.devices.clear();
            info!("GPU instance destroyed");
        }
    }
}
