//! Bandwidth throttler
//!
//! Paces outbound streaming traffic against a mean bitrate budget. Callers
//! report what they send with [`Throttler::consume_bandwidth`] and ask
//! [`Throttler::allowed`] before sending more. [`Throttler::process`] must be
//! called periodically by the same actor; it folds the consumed bits into two
//! exponential moving averages of the bitrate:
//!
//! - a fast one (time constant >= 50 ms) that reacts to bursts
//! - a slow one (time constant >= 1 s) that tracks the sustained rate
//!
//! with smoothing factor `b = min(1, dt / tau)`.
//!
//! # Admission
//!
//! ```text
//! allowed = !enabled || max(fast, slow) + consumed_since_tick / window < mean_bitrate
//! ```
//!
//! The second term accounts for bits sent since the last estimator update, so
//! bursts between two ticks cannot exceed the budget. The size of the message
//! being admitted is not added: an idle link always admits one message.
//! A denial is not an error; the caller keeps its data and retries later.

use crate::config::ThrottlingConfig;
use crate::error::{Result, TelewatchError};
use std::time::{Duration, Instant};

/// Smallest budget the throttler accepts, in bits per second
pub const MIN_BITRATE: f64 = 100.0;

/// Lower bound of the fast estimator time constant, in seconds
pub const MIN_FAST_TAU: f64 = 0.05;

/// Lower bound of the slow estimator time constant, in seconds
pub const MIN_SLOW_TAU: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct Throttler {
    enabled: bool,
    mean_bitrate: f64,
    estimation_window: Duration,
    fast_tau: f64,
    slow_tau: f64,
    estimated_bitrate_fast: f64,
    estimated_bitrate_slow: f64,
    consumed_since_last_estimation: u64,
    last_process_timestamp: Instant,
}

impl Throttler {
    /// Create a disabled throttler with the given budget
    pub fn new(mean_bitrate: f64, estimation_window: Duration) -> Self {
        let window_secs = estimation_window.as_secs_f64();
        Self {
            enabled: false,
            mean_bitrate,
            estimation_window,
            fast_tau: MIN_FAST_TAU.max(window_secs),
            slow_tau: MIN_SLOW_TAU.max(window_secs * 10.0),
            estimated_bitrate_fast: 0.0,
            estimated_bitrate_slow: 0.0,
            consumed_since_last_estimation: 0,
            last_process_timestamp: Instant::now(),
        }
    }

    /// Create a throttler from configuration, enabling it if configured to
    pub fn from_config(config: &ThrottlingConfig) -> Result<Self> {
        let mut throttler = Self::new(config.mean_bitrate, config.estimation_window());
        throttler.fast_tau = MIN_FAST_TAU.max(config.fast_tau().as_secs_f64());
        throttler.slow_tau = MIN_SLOW_TAU.max(config.slow_tau().as_secs_f64());
        if config.enabled {
            throttler.enable()?;
        }
        Ok(throttler)
    }

    /// Start throttling. Fails if the budget is below [`MIN_BITRATE`] or the
    /// estimation window is zero.
    pub fn enable(&mut self) -> Result<()> {
        self.enable_at(Instant::now())
    }

    /// Start throttling, using `now` as the first estimation tick
    pub fn enable_at(&mut self, now: Instant) -> Result<()> {
        if self.mean_bitrate < MIN_BITRATE {
            return Err(TelewatchError::Config(format!(
                "throttling bitrate {} bps is below the minimum of {} bps",
                self.mean_bitrate, MIN_BITRATE
            )));
        }
        if self.estimation_window.is_zero() {
            return Err(TelewatchError::Config(
                "throttling estimation window must be greater than zero".into(),
            ));
        }
        self.reset_at(now);
        self.enabled = true;
        tracing::debug!("Throttler enabled at {} bps", self.mean_bitrate);
        Ok(())
    }

    /// Stop throttling; every send is allowed
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Change the budget. Takes effect on the next admission check.
    pub fn set_bitrate(&mut self, mean_bitrate: f64) -> Result<()> {
        if self.enabled && mean_bitrate < MIN_BITRATE {
            return Err(TelewatchError::Config(format!(
                "throttling bitrate {} bps is below the minimum of {} bps",
                mean_bitrate, MIN_BITRATE
            )));
        }
        self.mean_bitrate = mean_bitrate;
        Ok(())
    }

    pub fn bitrate(&self) -> f64 {
        self.mean_bitrate
    }

    /// Drop every estimate and accumulated bit
    pub fn reset(&mut self) {
        self.reset_at(Instant::now());
    }

    fn reset_at(&mut self, now: Instant) {
        self.estimated_bitrate_fast = 0.0;
        self.estimated_bitrate_slow = 0.0;
        self.consumed_since_last_estimation = 0;
        self.last_process_timestamp = now;
    }

    /// Update the estimators. Call periodically.
    pub fn process(&mut self) {
        self.process_at(Instant::now());
    }

    /// Update the estimators as of `now`
    pub fn process_at(&mut self, now: Instant) {
        if !self.enabled {
            return;
        }

        let dt = now.saturating_duration_since(self.last_process_timestamp);
        if dt < self.estimation_window || dt.is_zero() {
            return;
        }

        let dt_secs = dt.as_secs_f64();
        let instant_bitrate = self.consumed_since_last_estimation as f64 / dt_secs;

        let b_fast = (dt_secs / self.fast_tau).min(1.0);
        self.estimated_bitrate_fast =
            b_fast * instant_bitrate + (1.0 - b_fast) * self.estimated_bitrate_fast;

        let b_slow = (dt_secs / self.slow_tau).min(1.0);
        self.estimated_bitrate_slow =
            b_slow * instant_bitrate + (1.0 - b_slow) * self.estimated_bitrate_slow;

        self.consumed_since_last_estimation = 0;
        self.last_process_timestamp = now;
    }

    /// True if `bits` may be sent now without exceeding the budget
    pub fn allowed(&self, bits: u64) -> bool {
        if !self.enabled {
            return true;
        }

        let pending_rate =
            self.consumed_since_last_estimation as f64 / self.estimation_window.as_secs_f64();
        let approx_bitrate = self.estimated_bitrate().max(0.0) + pending_rate;
        let allowed = approx_bitrate < self.mean_bitrate;
        if !allowed {
            tracing::trace!(
                "Throttler denied {} bits (approx {:.0} bps, budget {:.0} bps)",
                bits,
                approx_bitrate,
                self.mean_bitrate
            );
        }
        allowed
    }

    /// True if `bits` can ever be sent. False only when no budget exists.
    pub fn possible(&self, _bits: u64) -> bool {
        !self.enabled || self.mean_bitrate > 0.0
    }

    /// Record `bits` as sent
    pub fn consume_bandwidth(&mut self, bits: u64) {
        if self.enabled {
            self.consumed_since_last_estimation =
                self.consumed_since_last_estimation.saturating_add(bits);
        }
    }

    /// Current bitrate estimate: the larger of the two averages
    pub fn estimated_bitrate(&self) -> f64 {
        self.estimated_bitrate_fast.max(self.estimated_bitrate_slow)
    }

    pub fn estimated_bitrate_fast(&self) -> f64 {
        self.estimated_bitrate_fast
    }

    pub fn estimated_bitrate_slow(&self) -> f64 {
        self.estimated_bitrate_slow
    }
}
