//! Switch that enables or disables Bluetooth inquiries cluster-wide.

use log::info;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

pub const INQUIRY_SWITCH_ID: &str = "bluetooth-classic-inquiries-switch";

/// On/off gate for scheduling and measurements.
///
/// When off, no radio command is issued and received measurements are
/// ignored. Uses atomics so it can be flipped from any task.
pub struct InquirySwitch {
    id: String,
    name: String,
    state: AtomicBool,
    version: AtomicU32,
}

impl InquirySwitch {
    /// Create the switch in the off state.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            state: AtomicBool::new(false),
            version: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> bool {
        self.state.load(Ordering::SeqCst)
    }

    pub fn turn_on(&self) {
        self.set(true);
    }

    pub fn turn_off(&self) {
        self.set(false);
    }

    /// Number of state changes so far.
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::SeqCst)
    }

    fn set(&self, on: bool) {
        let old = self.state.swap(on, Ordering::SeqCst);
        if old != on {
            self.version.fetch_add(1, Ordering::SeqCst);
            info!(
                "[Switch] {} turned {}",
                self.name,
                if on { "on" } else { "off" }
            );
        }
    }
}

impl Default for InquirySwitch {
    fn default() -> Self {
        Self::new(INQUIRY_SWITCH_ID, "Bluetooth Inquiries")
    }
}
