use crate::clock::{Clock, SystemClock};
use crate::error::RuntimeError;

use std::sync::Arc;
use std::time::Duration;

/// Settings for a single scheduler run.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
  /// Label attached to the run's tracing span.
  pub name: String,
  pub clock: Arc<dyn Clock>,
  /// When set, a run whose only remaining wake-up sources are outstanding pool
  /// jobs fails with [`RuntimeError::Stalled`] after this long without progress.
  pub stall_timeout: Option<Duration>,
}

impl Default for RuntimeConfig {
  fn default() -> Self {
    Self {
      name: "hybrid-loop".to_string(),
      clock: Arc::new(SystemClock),
      stall_timeout: None,
    }
  }
}

impl RuntimeConfig {
  pub fn builder() -> RuntimeConfigBuilder {
    RuntimeConfigBuilder::default()
  }

  pub fn validate(&self) -> Result<(), RuntimeError> {
    if self.name.is_empty() {
      return Err(RuntimeError::invalid_config("runtime name must not be empty"));
    }
    if let Some(timeout) = self.stall_timeout {
      if timeout.is_zero() {
        return Err(RuntimeError::invalid_config("stall_timeout must be > 0"));
      }
    }
    Ok(())
  }
}

#[derive(Debug, Default)]
pub struct RuntimeConfigBuilder {
  config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
  pub fn name(mut self, name: impl Into<String>) -> Self {
    self.config.name = name.into();
    self
  }

  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.config.clock = clock;
    self
  }

  pub fn stall_timeout(mut self, timeout: Duration) -> Self {
    self.config.stall_timeout = Some(timeout);
    self
  }

  pub fn build(self) -> Result<RuntimeConfig, RuntimeError> {
    self.config.validate()?;
    Ok(self.config)
  }
}

/// Settings shared by both worker pool kinds.
#[derive(Debug, Clone)]
pub struct PoolConfig {
  pub name: String,
  pub workers: usize,
  /// Stack size for worker threads; `None` keeps the platform default.
  pub stack_size: Option<usize>,
}

impl PoolConfig {
  pub fn new(name: impl Into<String>, workers: usize) -> Self {
    Self {
      name: name.into(),
      workers,
      stack_size: None,
    }
  }

  pub fn stack_size(mut self, bytes: usize) -> Self {
    self.stack_size = Some(bytes);
    self
  }

  pub fn validate(&self) -> Result<(), RuntimeError> {
    if self.workers == 0 {
      return Err(RuntimeError::invalid_config("a pool needs at least 1 worker"));
    }
    if self.name.is_empty() {
      return Err(RuntimeError::invalid_config("pool name must not be empty"));
    }
    if let Some(bytes) = self.stack_size {
      if bytes < 16 * 1024 {
        return Err(RuntimeError::invalid_config("stack_size must be at least 16 KiB"));
      }
    }
    Ok(())
  }
}
