//! ADC count / millivolt conversion and the supported input range ladder.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversionError {
    #[error("Maximum ADC value must be non-zero")]
    ZeroMaxAdc,
}

/// Full-scale input ranges accepted by the PS5000A front end.
///
/// The discriminants are the driver's `PS5000A_RANGE` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i32)]
pub enum VoltageRange {
    Mv20 = 1,
    Mv50 = 2,
    Mv100 = 3,
    Mv200 = 4,
    Mv500 = 5,
    V1 = 6,
    V2 = 7,
    V5 = 8,
    V10 = 9,
    V20 = 10,
}

impl VoltageRange {
    /// The ladder in ascending order.
    pub const LADDER: [Self; 10] = [
        Self::Mv20,
        Self::Mv50,
        Self::Mv100,
        Self::Mv200,
        Self::Mv500,
        Self::V1,
        Self::V2,
        Self::V5,
        Self::V10,
        Self::V20,
    ];

    pub fn volts(self) -> f64 {
        match self {
            Self::Mv20 => 0.02,
            Self::Mv50 => 0.05,
            Self::Mv100 => 0.1,
            Self::Mv200 => 0.2,
            Self::Mv500 => 0.5,
            Self::V1 => 1.0,
            Self::V2 => 2.0,
            Self::V5 => 5.0,
            Self::V10 => 10.0,
            Self::V20 => 20.0,
        }
    }

    pub fn driver_code(self) -> i32 {
        self as i32
    }

    /// Ladder entry closest to `requested_volts`.
    ///
    /// Equal distances resolve to the lower entry. NaN resolves to the
    /// lowest range; callers that care reject it beforehand.
    pub fn nearest(requested_volts: f64) -> Self {
        let mut best = Self::LADDER[0];
        let mut best_distance = (best.volts() - requested_volts).abs();
        for candidate in &Self::LADDER[1..] {
            let distance = (candidate.volts() - requested_volts).abs();
            if distance < best_distance {
                best = *candidate;
                best_distance = distance;
            }
        }
        best
    }
}

impl fmt::Display for VoltageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let volts = self.volts();
        if volts < 1.0 {
            write!(f, "{}mV", (volts * 1000.0).round())
        } else {
            write!(f, "{volts}V")
        }
    }
}

/// `(adc / max_adc) * range * 1000`
pub fn adc_to_millivolts(
    adc_value: f64,
    voltage_range_volts: f64,
    max_adc: i32,
) -> Result<f64, ConversionError> {
    if max_adc == 0 {
        return Err(ConversionError::ZeroMaxAdc);
    }
    Ok(adc_value / f64::from(max_adc) * voltage_range_volts * 1000.0)
}

/// Inverse of [`adc_to_millivolts`], truncated toward zero.
pub fn millivolts_to_adc(
    millivolts: f64,
    voltage_range_volts: f64,
    max_adc: i32,
) -> Result<i32, ConversionError> {
    if max_adc == 0 {
        return Err(ConversionError::ZeroMaxAdc);
    }
    Ok((millivolts / (voltage_range_volts * 1000.0) * f64::from(max_adc)) as i32)
}

/// Converts a raw sample buffer in one go.
pub fn adc_buffer_to_millivolts(
    samples: &[i16],
    range: VoltageRange,
    max_adc: i32,
) -> Result<Vec<f64>, ConversionError> {
    if max_adc == 0 {
        return Err(ConversionError::ZeroMaxAdc);
    }
    let scale = range.volts() * 1000.0 / f64::from(max_adc);
    Ok(samples.iter().map(|&s| f64::from(s) * scale).collect())
}
