//! Circuit breakers for external engines and domains.
//!
//! Each scope keeps exponential moving averages of success and CAPTCHA
//! rates over 1h and 24h horizons, and a closed / open / half-open state
//! machine. Two consecutive failures open the circuit; after a cool-down a
//! single probe is allowed, and one success closes it again.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// State of one circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Time-decayed exponential moving average.
#[derive(Debug, Clone)]
struct Ema {
    tau_secs: f64,
    value: f64,
    last_update: Option<DateTime<Utc>>,
}

impl Ema {
    fn new(tau_secs: f64) -> Self {
        Self {
            tau_secs,
            value: 1.0,
            last_update: None,
        }
    }

    fn observe(&mut self, sample: f64, now: DateTime<Utc>) {
        let alpha = match self.last_update {
            Some(last) => {
                let dt = (now - last).num_milliseconds().max(0) as f64 / 1000.0;
                1.0 - (-dt / self.tau_secs).exp()
            }
            // First observation fully seeds the average.
            None => 1.0,
        };
        // Clamp so a burst of same-second events still moves the average.
        let alpha = alpha.clamp(0.001, 1.0);
        self.value += alpha * (sample - self.value);
        self.last_update = Some(now);
    }
}

/// One scope's circuit.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    failure_threshold: u32,
    cooldown: Duration,
    opened_at: Option<DateTime<Utc>>,
    success_1h: Ema,
    success_24h: Ema,
    captcha_1h: Ema,
    captcha_24h: Ema,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown_secs: u64) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            failure_threshold: failure_threshold.max(1),
            cooldown: Duration::seconds(cooldown_secs as i64),
            opened_at: None,
            success_1h: Ema::new(3600.0),
            success_24h: Ema::new(86_400.0),
            captcha_1h: Ema::new(3600.0),
            captcha_24h: Ema::new(86_400.0),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Whether a request may proceed right now. An open circuit past its
    /// cool-down transitions to half-open and admits exactly one probe.
    pub fn allow_request_at(&mut self, now: DateTime<Utc>) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => false,
            BreakerState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|t| now - t >= self.cooldown)
                    .unwrap_or(true);
                if elapsed {
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful request. A half-open probe success closes the
    /// circuit.
    pub fn record_success_at(&mut self, now: DateTime<Utc>) {
        self.consecutive_failures = 0;
        self.success_1h.observe(1.0, now);
        self.success_24h.observe(1.0, now);
        self.captcha_1h.observe(0.0, now);
        self.captcha_24h.observe(0.0, now);
        if self.state == BreakerState::HalfOpen {
            self.state = BreakerState::Closed;
            self.opened_at = None;
        }
    }

    /// Record a failure; `captcha` marks CAPTCHA walls separately.
    pub fn record_failure_at(&mut self, captcha: bool, now: DateTime<Utc>) {
        self.consecutive_failures += 1;
        self.success_1h.observe(0.0, now);
        self.success_24h.observe(0.0, now);
        self.captcha_1h.observe(if captcha { 1.0 } else { 0.0 }, now);
        self.captcha_24h.observe(if captcha { 1.0 } else { 0.0 }, now);

        let should_open = self.state == BreakerState::HalfOpen
            || self.consecutive_failures >= self.failure_threshold;
        if should_open {
            self.state = BreakerState::Open;
            self.opened_at = Some(now);
        }
    }

    /// (1h, 24h) success-rate averages.
    pub fn success_rates(&self) -> (f64, f64) {
        (self.success_1h.value, self.success_24h.value)
    }

    /// (1h, 24h) CAPTCHA-rate averages.
    pub fn captcha_rates(&self) -> (f64, f64) {
        (self.captcha_1h.value, self.captcha_24h.value)
    }
}

/// Breakers keyed by scope (engine name or domain).
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    failure_threshold: u32,
    cooldown_secs: u64,
}

impl BreakerRegistry {
    pub fn new(failure_threshold: u32, cooldown_secs: u64) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            failure_threshold,
            cooldown_secs,
        }
    }

    pub fn allow_request(&self, scope: &str) -> bool {
        self.with(scope, |b| b.allow_request_at(Utc::now()))
    }

    pub fn record_success(&self, scope: &str) {
        self.with(scope, |b| b.record_success_at(Utc::now()));
    }

    pub fn record_failure(&self, scope: &str, captcha: bool) {
        self.with(scope, |b| b.record_failure_at(captcha, Utc::now()));
    }

    pub fn state(&self, scope: &str) -> BreakerState {
        self.with(scope, |b| b.state())
    }

    /// Scopes whose circuits are not closed, for status reporting.
    pub fn unhealthy_scopes(&self) -> Vec<(String, BreakerState)> {
        let breakers = self.breakers.lock().expect("breaker registry mutex");
        breakers
            .iter()
            .filter(|(_, b)| b.state() != BreakerState::Closed)
            .map(|(k, b)| (k.clone(), b.state()))
            .collect()
    }

    fn with<T>(&self, scope: &str, f: impl FnOnce(&mut CircuitBreaker) -> T) -> T {
        let mut breakers = self.breakers.lock().expect("breaker registry mutex");
        let breaker = breakers
            .entry(scope.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.failure_threshold, self.cooldown_secs));
        f(breaker)
    }
}
