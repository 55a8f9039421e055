//! Device-major dispatch table (spec.md §6 "Device nodes", §9 "Dynamic
//! dispatch").
//!
//! Device inodes carry a major number; the major indexes a fixed table of
//! (read, write) handlers. No dispatch beyond this small fixed table is
//! required.

use std::sync::Arc;

use crate::error::{Error, KResult};
use crate::param::NDEV;

/// A character device reachable through a device-type inode's major
/// number.
pub trait CharDevice: Send + Sync {
    fn read(&self, dst: &mut [u8]) -> KResult<usize>;
    fn write(&self, src: &[u8]) -> KResult<usize>;
}

/// Reserved major number for the console (spec.md §4.12).
pub const CONSOLE_MAJOR: u16 = 1;

/// The fixed table of registered device majors.
pub struct DeviceTable {
    slots: Vec<Option<Arc<dyn CharDevice>>>,
}

impl DeviceTable {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(NDEV);
        slots.resize_with(NDEV, || None);
        Self { slots }
    }

    pub fn register(&mut self, major: u16, device: Arc<dyn CharDevice>) {
        self.slots[major as usize] = Some(device);
    }

    pub fn get(&self, major: u16) -> KResult<Arc<dyn CharDevice>> {
        self.slots
            .get(major as usize)
            .and_then(|s| s.clone())
            .ok_or(Error::InvalidArgument)
    }
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new()
    }
}
