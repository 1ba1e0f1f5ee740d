//! Tunables for the SSE core and the trigger manager.

/// Default size of the private stack each registered event runs on.
pub const SSE_STACK_SIZE: usize = 16 * 1024;

/// Default shadow call stack size.
pub const SSE_SHADOW_STACK_SIZE: usize = 1024;

/// Upper bound on the number of trigger slots tracked per CPU.
pub const HW_BP_NUM_MAX: usize = 32;

/// SSE core configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SseConfig {
    /// Size of the event stack allocated per (event, CPU).
    pub stack_size: usize,
    /// Allocate a shadow call stack alongside each event stack.
    pub shadow_call_stack: bool,
    /// Size of the shadow call stack.
    pub shadow_stack_size: usize,
    /// Cap on busy retries of the preferred-hart attribute write.
    ///
    /// `None` retries until firmware accepts the write.
    pub preferred_hart_retry_limit: Option<u32>,
}

impl SseConfig {
    /// Default configuration
    pub const fn new() -> Self {
        Self {
            stack_size: SSE_STACK_SIZE,
            shadow_call_stack: false,
            shadow_stack_size: SSE_SHADOW_STACK_SIZE,
            preferred_hart_retry_limit: None,
        }
    }
}

impl Default for SseConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Debug trigger configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbtrConfig {
    /// First address above user space.
    pub task_size: usize,
    /// Slot table ceiling; firmware reporting more triggers is clamped.
    pub max_triggers: usize,
}

impl DbtrConfig {
    /// Default configuration (Sv39 user/kernel split)
    pub const fn new() -> Self {
        Self {
            task_size: 0x0000_0040_0000_0000,
            max_triggers: HW_BP_NUM_MAX,
        }
    }
}

impl Default for DbtrConfig {
    fn default() -> Self {
        Self::new()
    }
}
