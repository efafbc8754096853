//! Test helpers for end-to-end and timing-sensitive tests

use std::sync::{Arc, Once};
use std::time::Duration;
use tether_net::NetConfig;
use tether_signaling::RendezvousServer;
use tracing_subscriber::EnvFilter;

/// Install a `tracing` subscriber driven by `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Configuration with every transport bound to loopback on ephemeral ports.
pub fn loopback_config() -> NetConfig {
    let mut config = NetConfig::default();
    config.udp.bind = "127.0.0.1:0".to_string();
    config.tcp.bind = "127.0.0.1:0".to_string();
    config
}

/// Run a rendezvous server on loopback and return its URL.
///
/// # Errors
///
/// Returns an error if the server cannot be bound.
pub async fn start_rendezvous() -> anyhow::Result<String> {
    let server = Arc::new(RendezvousServer::bind("127.0.0.1:0".parse()?).await?);
    let url = server.url()?;
    tokio::spawn(async move { server.run().await });
    Ok(url)
}

/// Collects repeated timing samples and checks their median.
///
/// Single measurements of network timeouts are noisy; the median of a few
/// runs is not. Tolerances widen in CI.
pub struct TimingValidator {
    samples: Vec<Duration>,
    slack: f64,
}

impl TimingValidator {
    /// Validator expecting about `sample_count` samples.
    pub fn new(sample_count: usize) -> Self {
        Self {
            samples: Vec::with_capacity(sample_count),
            slack: if is_ci_environment() { 3.0 } else { 1.0 },
        }
    }

    /// Record one measurement.
    pub fn add_sample(&mut self, duration: Duration) {
        self.samples.push(duration);
    }

    /// Median of the recorded samples.
    pub fn median(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted = self.samples.clone();
        sorted.sort();
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            Some((sorted[mid - 1] + sorted[mid]) / 2)
        } else {
            Some(sorted[mid])
        }
    }

    /// Assert the median lies in `[min, max]`, stretching `max` in CI.
    ///
    /// # Panics
    ///
    /// Panics if nothing was recorded or the median is out of range.
    pub fn assert_between(&self, min: Duration, max: Duration) {
        let median = self.median().expect("no samples collected");
        let upper = min + (max - min).mul_f64(self.slack);
        assert!(
            median >= min && median <= upper,
            "median {median:?} outside [{min:?}, {upper:?}] over {} samples",
            self.samples.len()
        );
    }
}

/// Whether the tests run under a CI service.
pub fn is_ci_environment() -> bool {
    ["CI", "GITHUB_ACTIONS", "GITLAB_CI"]
        .iter()
        .any(|var| std::env::var(var).is_ok())
}

/// Timeout stretched for slower CI machines.
pub fn ci_timeout(base: Duration) -> Duration {
    if is_ci_environment() {
        base * 3
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_odd_and_even() {
        let mut validator = TimingValidator::new(3);
        assert!(validator.median().is_none());
        for ms in [120, 100, 300] {
            validator.add_sample(Duration::from_millis(ms));
        }
        assert_eq!(validator.median(), Some(Duration::from_millis(120)));

        validator.add_sample(Duration::from_millis(140));
        assert_eq!(validator.median(), Some(Duration::from_millis(130)));
    }

    #[test]
    fn test_assert_between() {
        let mut validator = TimingValidator::new(1);
        validator.add_sample(Duration::from_millis(110));
        validator.assert_between(Duration::from_millis(100), Duration::from_millis(130));
    }

    #[test]
    fn test_loopback_config_is_valid() {
        assert!(loopback_config().validate().is_ok());
    }
}
