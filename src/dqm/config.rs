use crate::error::{DqmError, DqmResult};
use std::time::Duration;

pub const DEFAULT_MAX_QUEUES_PER_DEVICE: u32 = 4096;
pub const DEFAULT_PREEMPT_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_HQD_POLL_INTERVAL: Duration = Duration::from_millis(20);
pub const DEFAULT_FENCE_POLL_INTERVAL: Duration = Duration::from_millis(1);
/// PASIDs are 16 bits wide on GFX8; 0 is reserved.
pub const DEFAULT_PASID_LIMIT: u32 = 1 << 16;

/// How queues reach the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedPolicy {
    /// Firmware scheduling through runlists; oversubscribed runlists are chained.
    #[default]
    Hws,
    /// Firmware scheduling; an oversubscribed runlist is rejected.
    HwsNoOversubscription,
    /// The driver programs HQD registers directly.
    NoHws,
}

impl SchedPolicy {
    #[must_use]
    pub const fn uses_runlist(self) -> bool {
        !matches!(self, Self::NoHws)
    }

    /// Parses the numeric module-parameter encoding (0, 1, 2) or the variant name.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for anything else.
    pub fn parse(value: &str) -> DqmResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "0" | "hws" => Ok(Self::Hws),
            "1" | "hws_no_oversubscription" | "hws-no-oversubscription" => {
                Ok(Self::HwsNoOversubscription)
            }
            "2" | "no_hws" | "no-hws" | "nohws" => Ok(Self::NoHws),
            other => Err(DqmError::InvalidArgument(format!(
                "unknown scheduling policy '{other}'"
            ))),
        }
    }
}

/// Tunables of one device queue manager.
#[derive(Debug, Clone)]
pub struct DqmConfig {
    pub sched_policy: SchedPolicy,
    pub max_queues_per_device: u32,
    pub preempt_timeout: Duration,
    pub hqd_poll_interval: Duration,
    pub fence_poll_interval: Duration,
    pub pasid_limit: u32,
}

impl Default for DqmConfig {
    fn default() -> Self {
        Self {
            sched_policy: SchedPolicy::default(),
            max_queues_per_device: DEFAULT_MAX_QUEUES_PER_DEVICE,
            preempt_timeout: DEFAULT_PREEMPT_TIMEOUT,
            hqd_poll_interval: DEFAULT_HQD_POLL_INTERVAL,
            fence_poll_interval: DEFAULT_FENCE_POLL_INTERVAL,
            pasid_limit: DEFAULT_PASID_LIMIT,
        }
    }
}

impl DqmConfig {
    #[must_use]
    pub const fn with_sched_policy(mut self, policy: SchedPolicy) -> Self {
        self.sched_policy = policy;
        self
    }

    #[must_use]
    pub const fn with_max_queues_per_device(mut self, max: u32) -> Self {
        self.max_queues_per_device = max;
        self
    }

    #[must_use]
    pub const fn with_preempt_timeout(mut self, timeout: Duration) -> Self {
        self.preempt_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_hqd_poll_interval(mut self, interval: Duration) -> Self {
        self.hqd_poll_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_fence_poll_interval(mut self, interval: Duration) -> Self {
        self.fence_poll_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_pasid_limit(mut self, limit: u32) -> Self {
        self.pasid_limit = limit;
        self
    }

    /// Defaults overridden by `KFD_SCHED_POLICY`, `KFD_MAX_QUEUES_PER_DEVICE`,
    /// `KFD_PREEMPT_TIMEOUT_MS` and `KFD_PASID_LIMIT`.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if a variable is set but malformed.
    pub fn from_env() -> DqmResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> DqmResult<Self> {
        let mut config = Self::default();

        if let Some(policy) = lookup("KFD_SCHED_POLICY") {
            config.sched_policy = SchedPolicy::parse(&policy)?;
        }
        if let Some(max) = lookup("KFD_MAX_QUEUES_PER_DEVICE") {
            config.max_queues_per_device = parse_number("KFD_MAX_QUEUES_PER_DEVICE", &max)?;
        }
        if let Some(ms) = lookup("KFD_PREEMPT_TIMEOUT_MS") {
            config.preempt_timeout =
                Duration::from_millis(parse_number("KFD_PREEMPT_TIMEOUT_MS", &ms)?.into());
        }
        if let Some(limit) = lookup("KFD_PASID_LIMIT") {
            config.pasid_limit = parse_number("KFD_PASID_LIMIT", &limit)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns `InvalidArgument` for a zero queue limit, a zero timeout or a PASID
    /// limit below 2.
    pub fn validate(&self) -> DqmResult<()> {
        if self.max_queues_per_device == 0 {
            return Err(DqmError::InvalidArgument(
                "max_queues_per_device must be non-zero".into(),
            ));
        }
        if self.preempt_timeout.is_zero() {
            return Err(DqmError::InvalidArgument(
                "preemption timeout must be non-zero".into(),
            ));
        }
        if self.pasid_limit < 2 {
            return Err(DqmError::InvalidArgument("PASID limit leaves no usable PASID".into()));
        }
        Ok(())
    }
}

fn parse_number(key: &str, value: &str) -> DqmResult<u32> {
    value
        .trim()
        .parse()
        .map_err(|_| DqmError::InvalidArgument(format!("{key}={value} is not a number")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn env_overrides_defaults() {
        let config = DqmConfig::from_lookup(lookup(&[
            ("KFD_SCHED_POLICY", "2"),
            ("KFD_MAX_QUEUES_PER_DEVICE", "128"),
            ("KFD_PREEMPT_TIMEOUT_MS", "50"),
        ]))
        .unwrap();

        assert_eq!(config.sched_policy, SchedPolicy::NoHws);
        assert_eq!(config.max_queues_per_device, 128);
        assert_eq!(config.preempt_timeout, Duration::from_millis(50));
        assert_eq!(config.hqd_poll_interval, DEFAULT_HQD_POLL_INTERVAL);
    }

    #[test]
    fn unset_env_yields_defaults() {
        let config = DqmConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.sched_policy, SchedPolicy::Hws);
        assert_eq!(config.max_queues_per_device, DEFAULT_MAX_QUEUES_PER_DEVICE);
    }

    #[test]
    fn malformed_values_are_rejected() {
        assert!(matches!(
            DqmConfig::from_lookup(lookup(&[("KFD_SCHED_POLICY", "fifo")])),
            Err(DqmError::InvalidArgument(_))
        ));
        assert!(matches!(
            DqmConfig::from_lookup(lookup(&[("KFD_MAX_QUEUES_PER_DEVICE", "lots")])),
            Err(DqmError::InvalidArgument(_))
        ));
        assert!(matches!(
            DqmConfig::from_lookup(lookup(&[("KFD_MAX_QUEUES_PER_DEVICE", "0")])),
            Err(DqmError::InvalidArgument(_))
        ));
    }

    #[test]
    fn pasid_limit_comes_from_the_environment() {
        let config = DqmConfig::from_lookup(lookup(&[("KFD_PASID_LIMIT", "32")])).unwrap();
        assert_eq!(config.pasid_limit, 32);
        assert!(matches!(
            DqmConfig::from_lookup(lookup(&[("KFD_PASID_LIMIT", "1")])),
            Err(DqmError::InvalidArgument(_))
        ));
    }

    #[test]
    fn policy_names_parse() {
        assert_eq!(SchedPolicy::parse("hws").unwrap(), SchedPolicy::Hws);
        assert_eq!(
            SchedPolicy::parse("1").unwrap(),
            SchedPolicy::HwsNoOversubscription
        );
        assert!(SchedPolicy::HwsNoOversubscription.uses_runlist());
        assert!(!SchedPolicy::NoHws.uses_runlist());
    }
}
