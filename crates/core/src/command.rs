//! Recorded device work.
//!
//! Operations are recorded in order and run on `submit_and_wait`, which is
//! the only synchronization point. A failing operation aborts the rest of
//! the batch; the buffer is empty afterwards either way.

use anyhow::{Context, Result};
use tracing::trace;

use crate::device::{BlobAllocator, GpuDevice};
use crate::tensor::DeviceTensor;

type Operation = Box<dyn FnOnce() -> Result<()> + Send>;

pub struct CommandBuffer {
    device: usize,
    pending: Vec<(&'static str, Operation)>,
    submissions: usize,
    dispatched: usize,
}

impl CommandBuffer {
    pub fn new(device: &GpuDevice) -> Self {
        Self {
            device: device.index(),
            pending: Vec::new(),
            submissions: 0,
            dispatched: 0,
        }
    }

    pub fn record<F>(&mut self, label: &'static str, op: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.pending.push((label, Box::new(op)));
    }

    /// Records a copy of `src` into a fresh tensor from `allocator`.
    pub fn record_clone(
        &mut self,
        src: &DeviceTensor,
        allocator: &BlobAllocator,
    ) -> Result<DeviceTensor> {
        let dst = allocator.alloc(src.shape())?;
        let (from, to) = (src.clone(), dst.clone());
        self.record("copy", move || {
            let data = from.read();
            to.write().copy_from(&data)
        });
        Ok(dst)
    }

    pub fn submit_and_wait(&mut self) -> Result<()> {
        self.submissions += 1;
        let batch = std::mem::take(&mut self.pending);
        trace!(device = self.device, ops = batch.len(), "Submitting command batch");
        for (label, op) in batch {
            op().with_context(|| format!("device operation '{label}' failed"))?;
            self.dispatched += 1;
        }
        Ok(())
    }

    /// Drops recorded work without running it.
    pub fn reset(&mut self) {
        self.pending.clear();
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn submissions(&self) -> usize {
        self.submissions
    }

    pub fn dispatched(&self) -> usize {
        self.dispatched
    }
}
