//! OHCI host controller parameters.

/// Number of pooled endpoint descriptors for control and bulk transfers.
pub const OHCI_ED_POOL_SIZE: usize = 50;

/// Transfer descriptors reserved per control endpoint, and added on top of
/// the data descriptors of each bulk endpoint.
pub const OHCI_ENDPOINT_MIN_ALLOCATED: usize = 25;

/// The largest single I/O a device driver may hand to a bulk endpoint.
pub const DEVICE_MAX_IO_SIZE: usize = 8192;

/// Size of the data buffer behind one dynamically allocated interrupt TD.
pub const OHCI_TD_BUFFER_SIZE: usize = 4096;

/// Ownership handoff from SMM: total wait and poll interval.
pub const OWNERSHIP_TIMEOUT_MS: u64 = 250;
pub const OWNERSHIP_POLL_MS: u64 = 10;

/// Host controller software reset: total wait and poll interval.
pub const RESET_TIMEOUT_MS: u64 = 50;
pub const RESET_POLL_MS: u64 = 1;

/// Root hub port reset: total wait and poll interval.
pub const PORT_RESET_TIMEOUT_MS: u64 = 200;
pub const PORT_RESET_POLL_MS: u64 = 10;

/// Settle time after a port reset completes.
pub const PORT_RESET_STALL_MS: u64 = 50;

/// Lower bound for the root hub power-on-to-power-good delay.
pub const MIN_POWER_ON_DELAY_MS: u64 = 100;

/// Resume signaling must last this long before going operational again.
pub const RESUME_DELAY_MS: u64 = 20;

/// Delay between suspending the controller and requesting a reset,
/// and before talking to a controller that firmware left running.
pub const CONTROLLER_SETTLE_MS: u64 = 10;
