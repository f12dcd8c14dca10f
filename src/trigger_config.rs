use crate::driver::{ThresholdDirection, TriggerSource};
use crate::units::{self, ConversionError, VoltageRange};

#[derive(Debug, thiserror::Error)]
pub enum TriggerConfigError {
    #[error("Threshold {threshold_mv} mV lies outside the {range} input range")]
    ThresholdOutOfRange { threshold_mv: f64, range: VoltageRange },

    #[error("Auto-trigger timeout {0} ms exceeds the driver limit of 32767 ms")]
    AutoTriggerTooLong(u32),

    #[error("Threshold must be a finite number of millivolts")]
    NonFiniteThreshold,

    #[error(transparent)]
    Conversion(#[from] ConversionError),
}

/// A single-edge trigger as requested by the caller, in engineering units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerConfig {
    pub source: TriggerSource,
    pub threshold_mv: f64,
    pub direction: ThresholdDirection,
    /// 0 waits for a genuine trigger event indefinitely.
    pub auto_trigger_ms: u32,
}

impl TriggerConfig {
    pub const DEFAULT_AUTO_TRIGGER_MS: u32 = 1000;

    pub fn start_capturing_when(source: TriggerSource) -> TriggerBuilder {
        TriggerBuilder {
            source,
            auto_trigger_ms: Self::DEFAULT_AUTO_TRIGGER_MS,
        }
    }

    /// Resolves the threshold against `range` into the driver's ADC units.
    pub fn to_simple_trigger(
        &self,
        range: VoltageRange,
        max_adc: i32,
        min_adc: i32,
    ) -> Result<SimpleTrigger, TriggerConfigError> {
        if !self.threshold_mv.is_finite() {
            return Err(TriggerConfigError::NonFiniteThreshold);
        }
        let auto_trigger_ms = i16::try_from(self.auto_trigger_ms)
            .map_err(|_| TriggerConfigError::AutoTriggerTooLong(self.auto_trigger_ms))?;

        let threshold_adc = units::millivolts_to_adc(self.threshold_mv, range.volts(), max_adc)?;
        if !(min_adc..=max_adc).contains(&threshold_adc) {
            return Err(TriggerConfigError::ThresholdOutOfRange {
                threshold_mv: self.threshold_mv,
                range,
            });
        }
        let threshold_adc = i16::try_from(threshold_adc).map_err(|_| TriggerConfigError::ThresholdOutOfRange {
            threshold_mv: self.threshold_mv,
            range,
        })?;

        Ok(SimpleTrigger {
            source: self.source,
            threshold_adc,
            direction: self.direction,
            delay_samples: 0,
            auto_trigger_ms,
        })
    }
}

#[derive(Debug)]
pub struct TriggerBuilder {
    source: TriggerSource,
    auto_trigger_ms: u32,
}

impl TriggerBuilder {
    /// Fire anyway after `ms` milliseconds without an edge.
    pub fn auto_trigger_after(mut self, ms: u32) -> Self {
        self.auto_trigger_ms = ms;
        self
    }

    pub fn wait_indefinitely(self) -> Self {
        self.auto_trigger_after(0)
    }

    pub fn rising_edge(self, threshold_mv: f64) -> TriggerConfig {
        self.edge(threshold_mv, ThresholdDirection::Rising)
    }

    pub fn falling_edge(self, threshold_mv: f64) -> TriggerConfig {
        self.edge(threshold_mv, ThresholdDirection::Falling)
    }

    pub fn either_edge(self, threshold_mv: f64) -> TriggerConfig {
        self.edge(threshold_mv, ThresholdDirection::RisingOrFalling)
    }

    pub fn edge(self, threshold_mv: f64, direction: ThresholdDirection) -> TriggerConfig {
        TriggerConfig {
            source: self.source,
            threshold_mv,
            direction,
            auto_trigger_ms: self.auto_trigger_ms,
        }
    }
}

/// Trigger fields exactly as handed to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimpleTrigger {
    pub source: TriggerSource,
    pub threshold_adc: i16,
    pub direction: ThresholdDirection,
    pub delay_samples: u32,
    pub auto_trigger_ms: i16,
}
