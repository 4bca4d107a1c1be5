use std::time::Duration;

use crate::{define_flag, error::SafepointError};

pub struct SafepointFlags;

define_flag!(SafepointFlags =>
    Duration,
    suspend_timeout,
    Duration::from_secs(10),
    "How long to wait for a thread to reach a safepoint before aborting. (default: 10s)"
);

define_flag!(SafepointFlags =>
    usize,
    max_suspend_retries,
    DEFAULT_MAX_SUSPEND_RETRIES,
    "Attempts a suspend request may retry at an unsuitable moment before it is fatal. (default: 500 in debug, 5000 in release)"
);

define_flag!(SafepointFlags =>
    Duration,
    suspend_retry_sleep,
    Duration::from_micros(100),
    "Pause between suspend attempts. (default: 100us)"
);

define_flag!(SafepointFlags =>
    Duration,
    unregister_retry_sleep,
    Duration::from_micros(1),
    "Pause between attempts to unregister a thread that is still being suspended. (default: 1us)"
);

define_flag!(SafepointFlags =>
    Duration,
    empty_checkpoint_period,
    Duration::from_millis(100),
    "Period of the empty checkpoint wait, re-broadcasting wake-ups each time. (default: 100ms)"
);

define_flag!(SafepointFlags =>
    Duration,
    empty_checkpoint_timeout,
    Duration::from_secs(600),
    "Total time an empty checkpoint may wait before aborting. (default: 10m)"
);

define_flag!(SafepointFlags =>
    Duration,
    long_suspend_threshold,
    Duration::from_millis(5),
    "Suspend-all pauses above this are reported. (default: 5ms)"
);

define_flag!(SafepointFlags =>
    bool,
    abort_on_fatal,
    true,
    "Abort the process on fatal suspension errors instead of panicking. (default: true)"
);

define_flag!(SafepointFlags =>
    usize,
    max_thread_id,
    0xFFFF,
    "Largest thread id handed out. (default: 65535)"
);

const DEFAULT_MAX_SUSPEND_RETRIES: usize = if cfg!(debug_assertions) { 500 } else { 5000 };

/// Tunables of the suspension machinery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SafepointOptions {
    pub suspend_timeout: Duration,
    pub max_suspend_retries: u32,
    pub suspend_retry_sleep: Duration,
    pub unregister_retry_sleep: Duration,
    pub empty_checkpoint_period: Duration,
    pub empty_checkpoint_timeout: Duration,
    pub long_suspend_threshold: Duration,
    pub abort_on_fatal: bool,
    pub max_thread_id: u32,
}

impl Default for SafepointOptions {
    fn default() -> Self {
        Self {
            suspend_timeout: Duration::from_secs(10),
            max_suspend_retries: DEFAULT_MAX_SUSPEND_RETRIES as u32,
            suspend_retry_sleep: Duration::from_micros(100),
            unregister_retry_sleep: Duration::from_micros(1),
            empty_checkpoint_period: Duration::from_millis(100),
            empty_checkpoint_timeout: Duration::from_secs(600),
            long_suspend_threshold: Duration::from_millis(5),
            abort_on_fatal: true,
            max_thread_id: 0xFFFF,
        }
    }
}

impl SafepointOptions {
    /// Options for tests: short timeouts, and fatal errors panic instead of
    /// taking the test binary down.
    pub fn for_tests() -> Self {
        Self {
            suspend_timeout: Duration::from_secs(20),
            empty_checkpoint_period: Duration::from_millis(10),
            empty_checkpoint_timeout: Duration::from_secs(20),
            abort_on_fatal: false,
            ..Self::default()
        }
    }

    /// Read options from `SafepointFlags`.
    pub fn from_flags() -> Result<Self, SafepointError> {
        let max_suspend_retries = safepointflags_max_suspend_retries();
        let max_thread_id = safepointflags_max_thread_id();

        let options = Self {
            suspend_timeout: safepointflags_suspend_timeout(),
            max_suspend_retries: u32::try_from(max_suspend_retries).map_err(|_| {
                SafepointError::InvalidOption(format!(
                    "max_suspend_retries is too large: {}",
                    max_suspend_retries
                ))
            })?,
            suspend_retry_sleep: safepointflags_suspend_retry_sleep(),
            unregister_retry_sleep: safepointflags_unregister_retry_sleep(),
            empty_checkpoint_period: safepointflags_empty_checkpoint_period(),
            empty_checkpoint_timeout: safepointflags_empty_checkpoint_timeout(),
            long_suspend_threshold: safepointflags_long_suspend_threshold(),
            abort_on_fatal: safepointflags_abort_on_fatal(),
            max_thread_id: u32::try_from(max_thread_id).map_err(|_| {
                SafepointError::InvalidOption(format!("max_thread_id is too large: {}", max_thread_id))
            })?,
        };

        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), SafepointError> {
        if self.max_suspend_retries == 0 {
            return Err(SafepointError::InvalidOption(
                "max_suspend_retries cannot be zero".to_owned(),
            ));
        }

        if self.suspend_timeout.is_zero() {
            return Err(SafepointError::InvalidOption(
                "suspend_timeout cannot be zero".to_owned(),
            ));
        }

        if self.empty_checkpoint_period.is_zero() {
            return Err(SafepointError::InvalidOption(
                "empty_checkpoint_period cannot be zero".to_owned(),
            ));
        }

        if self.empty_checkpoint_period > self.empty_checkpoint_timeout {
            return Err(SafepointError::InvalidOption(format!(
                "empty checkpoint period is larger than its timeout: {:?} > {:?}",
                self.empty_checkpoint_period, self.empty_checkpoint_timeout
            )));
        }

        if self.max_thread_id == 0 {
            return Err(SafepointError::InvalidOption(
                "max_thread_id cannot be zero".to_owned(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_flags() {
        let options = SafepointOptions::from_flags().unwrap();
        assert_eq!(options, SafepointOptions::default());
    }

    #[test]
    fn rejects_inconsistent_periods() {
        let options = SafepointOptions {
            empty_checkpoint_period: Duration::from_secs(2),
            empty_checkpoint_timeout: Duration::from_secs(1),
            ..SafepointOptions::default()
        };
        assert!(matches!(
            options.validate(),
            Err(SafepointError::InvalidOption(_))
        ));

        let options = SafepointOptions {
            max_suspend_retries: 0,
            ..SafepointOptions::default()
        };
        assert!(options.validate().is_err());
        assert!(SafepointOptions::for_tests().validate().is_ok());
    }
}
