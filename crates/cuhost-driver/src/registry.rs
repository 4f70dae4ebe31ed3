//! Caller-owned table of per-slot contexts.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::context::{Context, ContextFlags};
use crate::device::Cuda;
use crate::error::{CuError, Result};

/// Maps small integer slots to live contexts.
///
/// `setup(slot)` uses the device whose ordinal equals the slot. The registry
/// owns its contexts, so every dependent borrows through [`DeviceRegistry::context`].
#[derive(Debug)]
pub struct DeviceRegistry {
    cuda: Cuda,
    slots: BTreeMap<u32, Context>,
}

impl DeviceRegistry {
    pub fn new(cuda: Cuda) -> Self {
        Self {
            cuda,
            slots: BTreeMap::new(),
        }
    }

    pub fn cuda(&self) -> &Cuda {
        &self.cuda
    }

    /// Create a context on device `slot` and register it under `slot`.
    pub fn setup(&mut self, slot: u32) -> Result<&Context> {
        self.setup_on(slot, slot as i32, ContextFlags::default())
    }

    /// Create a context on device `ordinal` with `flags` and register it
    /// under `slot`.
    pub fn setup_on(&mut self, slot: u32, ordinal: i32, flags: ContextFlags) -> Result<&Context> {
        if self.slots.contains_key(&slot) {
            return Err(CuError::SlotOccupied(slot));
        }
        let device = self.cuda.device(ordinal)?;
        let ctx = Context::create(&device, flags)?;
        info!(slot, device = ordinal, "device slot ready");
        Ok(self.slots.entry(slot).or_insert(ctx))
    }

    pub fn context(&self, slot: u32) -> Result<&Context> {
        self.slots.get(&slot).ok_or(CuError::SlotNotFound(slot))
    }

    pub fn contains(&self, slot: u32) -> bool {
        self.slots.contains_key(&slot)
    }

    pub fn slots(&self) -> impl Iterator<Item = u32> + '_ {
        self.slots.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Destroy and unregister the context in `slot`.
    pub fn teardown(&mut self, slot: u32) -> Result<()> {
        let ctx = self.slots.remove(&slot).ok_or(CuError::SlotNotFound(slot))?;
        debug!(slot, "tearing down device slot");
        ctx.destroy()
    }

    /// Tear down every slot, returning the first failure.
    pub fn teardown_all(&mut self) -> Result<()> {
        let mut first_err = None;
        while let Some((slot, ctx)) = self.slots.pop_last() {
            debug!(slot, "tearing down device slot");
            if let Err(e) = ctx.destroy() {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::EmulatedDriver;
    use crate::status::{CUDA_ERROR_INVALID_DEVICE, CUDA_ERROR_NOT_FOUND};
    use std::sync::Arc;

    fn registry(devices: usize) -> (Arc<EmulatedDriver>, DeviceRegistry) {
        let emu = Arc::new(EmulatedDriver::with_devices(devices, 1 << 20));
        let cuda = Cuda::with_driver(emu.clone()).unwrap();
        (emu, DeviceRegistry::new(cuda))
    }

    #[test]
    fn setup_uses_slot_as_ordinal() {
        let (emu, mut reg) = registry(2);
        reg.setup(1).unwrap();
        assert_eq!(reg.context(1).unwrap().device().ordinal(), 1);
        assert_eq!(emu.live_contexts(), 1);
    }

    #[test]
    fn occupied_slot_is_rejected() {
        let (emu, mut reg) = registry(1);
        reg.setup(0).unwrap();
        match reg.setup(0) {
            Err(CuError::SlotOccupied(0)) => {}
            other => panic!("expected SlotOccupied, got {:?}", other.map(|_| ())),
        }
        assert_eq!(emu.live_contexts(), 1);
    }

    #[test]
    fn missing_device_leaves_slot_empty() {
        let (_emu, mut reg) = registry(1);
        let err = reg.setup(3).unwrap_err();
        assert!(err.is_driver(CUDA_ERROR_INVALID_DEVICE));
        assert!(!reg.contains(3));
    }

    #[test]
    fn teardown_twice_reports_not_found() {
        let (emu, mut reg) = registry(1);
        reg.setup(0).unwrap();
        reg.teardown(0).unwrap();
        assert_eq!(emu.live_contexts(), 0);
        match reg.teardown(0) {
            Err(e @ CuError::SlotNotFound(0)) => assert_eq!(e.code(), CUDA_ERROR_NOT_FOUND),
            other => panic!("expected SlotNotFound, got {:?}", other),
        }
    }

    #[test]
    fn teardown_all_empties_registry() {
        let (emu, mut reg) = registry(3);
        for slot in 0..3 {
            reg.setup(slot).unwrap();
        }
        // extra slots may share a device
        reg.setup_on(7, 0, ContextFlags::SCHED_BLOCKING_SYNC).unwrap();
        assert_eq!(reg.slots().collect::<Vec<_>>(), vec![0, 1, 2, 7]);
        reg.teardown_all().unwrap();
        assert!(reg.is_empty());
        assert_eq!(emu.live_contexts(), 0);
    }
}
