//! Node configuration

use crate::error::ConfigError;
use std::env;
use std::time::Duration;

/// Round identifier every node starts from before the first successful
/// agreement. A cycle that still runs under this identifier is vulnerable
/// to replays, so its outcome is never used (see the coordinator).
pub const DEFAULT_COMMON_RANDOM: &str = "00000000000000000000";

/// Timing and protocol knobs for the agreement service.
///
/// All values can be overridden through the environment (`AGREEMENT_*`
/// variables, durations in milliseconds).
#[derive(Debug, Clone)]
pub struct AgreementConfig {
    /// Length of the passive phase before the commitment phase starts.
    pub passive_phase: Duration,
    /// Delay between the commitment and the reveal phase, and settle time
    /// after a cycle completes.
    pub phase_gap: Duration,
    /// Timeout after which an undecided execution counts as "did not
    /// participate".
    pub round_timeout: Duration,
    /// Scheduler polling interval.
    pub poll_interval: Duration,
    /// A new cycle starts when the reference-zone minute is divisible by
    /// this value. Must be at least 1.
    pub agreement_divisor: u32,
    /// Bootstrap round identifier, see [`DEFAULT_COMMON_RANDOM`].
    pub bootstrap_random: String,
}

impl Default for AgreementConfig {
    fn default() -> Self {
        AgreementConfig {
            passive_phase: Duration::from_secs(120),
            phase_gap: Duration::from_secs(30),
            round_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(20),
            agreement_divisor: 5,
            bootstrap_random: DEFAULT_COMMON_RANDOM.to_string(),
        }
    }
}

impl AgreementConfig {
    /// Loads the configuration from the environment, falling back to the
    /// defaults for anything unset. Reads `.env` if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut config = AgreementConfig::default();
        if let Some(ms) = read_u64("AGREEMENT_PASSIVE_PHASE_MS")? {
            config.passive_phase = Duration::from_millis(ms);
        }
        if let Some(ms) = read_u64("AGREEMENT_PHASE_GAP_MS")? {
            config.phase_gap = Duration::from_millis(ms);
        }
        if let Some(ms) = read_u64("AGREEMENT_ROUND_TIMEOUT_MS")? {
            config.round_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = read_u64("AGREEMENT_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(divisor) = read_u64("AGREEMENT_DIVISOR")? {
            config.agreement_divisor = divisor as u32;
        }
        if let Ok(random) = env::var("AGREEMENT_BOOTSTRAP_RANDOM") {
            config.bootstrap_random = random;
        }

        if config.agreement_divisor == 0 {
            return Err(ConfigError::ZeroDivisor);
        }
        Ok(config)
    }
}

fn read_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = AgreementConfig::default();
        assert!(config.agreement_divisor >= 1);
        assert!(config.round_timeout > Duration::ZERO);
        assert_eq!(config.bootstrap_random, DEFAULT_COMMON_RANDOM);
    }

    #[test]
    fn test_invalid_env_value_is_rejected() {
        env::set_var("AGREEMENT_PHASE_GAP_MS", "not-a-number");
        let result = AgreementConfig::from_env();
        env::remove_var("AGREEMENT_PHASE_GAP_MS");
        assert!(result.is_err());
    }
}
