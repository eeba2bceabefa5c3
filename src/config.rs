//! Configuration knobs for constructing a runtime.

use std::time::Duration;

/// Configuration consumed once at scheduler-construction time.
///
/// Not mutable after construction; it carries no behavior beyond
/// supplying initial values to the scheduler, timer wheel, and channel
/// constructors it parameterizes.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Name prefix for fiber-backing OS threads.
    pub fiber_stack_name_prefix: String,
    /// Stack size for fiber-backing OS threads, if set.
    pub fiber_stack_size: Option<usize>,
    /// Upper bound on a `wait_for_events` sleep when no timer is pending.
    pub max_sleep: Duration,
    /// Default capacity applied to `channel()` when the caller doesn't
    /// specify one; `None` means unbuffered (synchronous rendezvous).
    pub default_channel_capacity: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            fiber_stack_name_prefix: "weft-fiber".to_string(),
            fiber_stack_size: None,
            max_sleep: Duration::from_millis(100),
            default_channel_capacity: None,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fiber_stack_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.fiber_stack_name_prefix = prefix.into();
        self
    }

    pub fn with_fiber_stack_size(mut self, size: usize) -> Self {
        self.fiber_stack_size = Some(size);
        self
    }

    pub fn with_max_sleep(mut self, max_sleep: Duration) -> Self {
        self.max_sleep = max_sleep;
        self
    }

    pub fn with_default_channel_capacity(mut self, capacity: usize) -> Self {
        self.default_channel_capacity = Some(capacity);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.fiber_stack_name_prefix, "weft-fiber");
        assert!(config.fiber_stack_size.is_none());
        assert!(config.default_channel_capacity.is_none());
    }

    #[test]
    fn builder() {
        let config = RuntimeConfig::new()
            .with_fiber_stack_name_prefix("custom")
            .with_fiber_stack_size(1024 * 1024)
            .with_default_channel_capacity(8);

        assert_eq!(config.fiber_stack_name_prefix, "custom");
        assert_eq!(config.fiber_stack_size, Some(1024 * 1024));
        assert_eq!(config.default_channel_capacity, Some(8));
    }
}
