/// Number of simultaneously in-flight operations when nothing else is configured.
pub const DEFAULT_MAX_CONCURRENT: usize = 2;

const DEFAULT_NAME: &str = "scheduler";

/// Construction-time settings for a [`Scheduler`](crate::Scheduler).
///
/// ```
/// use request_throttle::SchedulerConfig;
///
/// let config = SchedulerConfig::default().with_name("country_queries").with_max_concurrent(4);
/// assert_eq!(config.max_concurrent, 4);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
  /// Name used in log fields and completion notifications.
  pub name: String,
  /// Maximum number of operations in flight at any instant. `0` is treated as `1`.
  pub max_concurrent: usize,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      name: DEFAULT_NAME.to_string(),
      max_concurrent: DEFAULT_MAX_CONCURRENT,
    }
  }
}

impl SchedulerConfig {
  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
    self.max_concurrent = max_concurrent;
    self
  }

  /// The admission width actually used by the scheduler.
  pub(crate) fn effective_max_concurrent(&self) -> usize {
    self.max_concurrent.max(1)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_uses_documented_width() {
    let config = SchedulerConfig::default();
    assert_eq!(config.max_concurrent, DEFAULT_MAX_CONCURRENT);
    assert_eq!(config.name, "scheduler");
  }

  #[test]
  fn zero_width_is_clamped() {
    let config = SchedulerConfig::default().with_max_concurrent(0);
    assert_eq!(config.effective_max_concurrent(), 1);
  }
}
