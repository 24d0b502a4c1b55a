//! Runtime configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use tactile_core::{aligned_size, TactileError, TactileResult, UpdateType};

use crate::{LogFormat, OverflowPolicy};

/// Input runtime configuration
///
/// Loadable from JSON; unknown keys are rejected and missing keys take their
/// defaults. The update mask is written as a list of phase names:
///
/// ```json
/// { "polling_frequency": 120.0, "update_mask": ["Dynamic", "BeforeRender"] }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Rate background-polled devices sample at, in Hz
    pub polling_frequency: f64,
    /// Phases run by the periodic trigger
    #[serde(with = "phase_names")]
    pub update_mask: UpdateType,
    /// Byte limit of the event queue
    pub queue_capacity: usize,
    /// What a full queue does with a new event
    pub overflow: OverflowPolicy,
    /// Largest single record accepted, header included
    pub max_record_size: usize,
    /// Format used by [`RuntimeConfig::init_logging`]
    pub log_format: LogFormat,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            polling_frequency: 60.0,
            update_mask: UpdateType::DEFAULT,
            queue_capacity: 64 * 1024,
            overflow: OverflowPolicy::Reject,
            max_record_size: 4 * 1024,
            log_format: LogFormat::Pretty,
        }
    }
}

impl RuntimeConfig {
    /// Parse and validate a JSON configuration
    pub fn from_json(json: &str) -> TactileResult<Self> {
        let config: RuntimeConfig = serde_json::from_str(json)
            .map_err(|e| TactileError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> TactileResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| TactileError::InvalidConfig(e.to_string()))
    }

    pub fn validate(&self) -> TactileResult<()> {
        validate_polling_frequency(self.polling_frequency)?;
        validate_update_mask(self.update_mask)?;
        if self.queue_capacity == 0 {
            return Err(TactileError::InvalidConfig(
                "queue_capacity must be non-zero".into(),
            ));
        }
        if self.max_record_size < tactile_core::EVENT_HEADER_SIZE {
            return Err(TactileError::InvalidConfig(format!(
                "max_record_size {} is smaller than an event header",
                self.max_record_size
            )));
        }
        // Records are padded inside the queue; the largest one must still fit
        if aligned_size(self.max_record_size) > self.queue_capacity {
            return Err(TactileError::InvalidConfig(format!(
                "max_record_size {} (padded to {}) exceeds queue_capacity {}",
                self.max_record_size,
                aligned_size(self.max_record_size),
                self.queue_capacity
            )));
        }
        Ok(())
    }

    /// Install the global log subscriber in the configured format.
    ///
    /// The runtime never does this on its own; hosts without their own
    /// subscriber call it once at startup. Returns `false` if a subscriber
    /// was already installed.
    pub fn init_logging(&self) -> bool {
        crate::init_logging(self.log_format)
    }

    /// Sampling interval implied by the polling frequency
    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.polling_frequency)
    }
}

pub(crate) fn validate_polling_frequency(hz: f64) -> TactileResult<()> {
    if !hz.is_finite() || hz <= 0.0 {
        return Err(TactileError::InvalidConfig(format!(
            "polling_frequency must be a positive number of Hz, got {}",
            hz
        )));
    }
    Ok(())
}

pub(crate) fn validate_update_mask(mask: UpdateType) -> TactileResult<()> {
    if mask.unknown_bits() != 0 {
        return Err(TactileError::InvalidConfig(format!(
            "update_mask has unknown bits {:#04x}",
            mask.unknown_bits()
        )));
    }
    Ok(())
}

mod phase_names {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    use tactile_core::UpdateType;

    pub fn serialize<S: Serializer>(mask: &UpdateType, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(mask.phases().map(|phase| phase.name()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<UpdateType, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        let mut mask = UpdateType::NONE;
        for name in &names {
            let phase = UpdateType::from_name(name)
                .ok_or_else(|| D::Error::custom(format!("unknown update phase `{}`", name)))?;
            mask |= phase;
        }
        Ok(mask)
    }
}
