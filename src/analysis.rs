//! Elementary measurements on a captured waveform.

use polars::prelude::*;
use serde::Serialize;

use crate::capture::{CaptureData, VOLTAGE_COLUMN_NAME};

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("Waveform contains no samples")]
    Empty,

    #[error("Statistic {0} could not be computed")]
    Missing(&'static str),

    #[error("Failed to evaluate waveform statistics")]
    Polars(#[from] PolarsError),
}

/// Summary of one channel's voltage series, all in millivolts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WaveformStatistics {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    /// Sample standard deviation, 0 for a single sample.
    pub std_dev: f64,
    pub rms: f64,
    pub peak_to_peak: f64,
    pub num_samples: usize,
}

fn scalar(df: &DataFrame, name: &'static str) -> Result<Option<f64>, AnalysisError> {
    Ok(df.column(name)?.f64()?.get(0))
}

pub fn statistics(data: &CaptureData) -> Result<WaveformStatistics, AnalysisError> {
    if data.voltage_values.is_empty() {
        return Err(AnalysisError::Empty);
    }

    let voltage = || col(VOLTAGE_COLUMN_NAME);
    let summary = data
        .to_dataframe()?
        .lazy()
        .select([
            voltage().min().alias("min"),
            voltage().max().alias("max"),
            voltage().mean().alias("mean"),
            voltage().std(1).alias("std_dev"),
            (voltage() * voltage()).mean().alias("mean_square"),
        ])
        .collect()?;

    let min = scalar(&summary, "min")?.ok_or(AnalysisError::Missing("min"))?;
    let max = scalar(&summary, "max")?.ok_or(AnalysisError::Missing("max"))?;
    let mean = scalar(&summary, "mean")?.ok_or(AnalysisError::Missing("mean"))?;
    let mean_square = scalar(&summary, "mean_square")?.ok_or(AnalysisError::Missing("mean_square"))?;
    let std_dev = scalar(&summary, "std_dev")?
        .filter(|v| v.is_finite())
        .unwrap_or(0.0);

    Ok(WaveformStatistics {
        min,
        max,
        mean,
        std_dev,
        rms: mean_square.sqrt(),
        peak_to_peak: max - min,
        num_samples: data.voltage_values.len(),
    })
}

pub fn rms(data: &CaptureData) -> Result<f64, AnalysisError> {
    statistics(data).map(|s| s.rms)
}

pub fn peak_to_peak(data: &CaptureData) -> Result<f64, AnalysisError> {
    statistics(data).map(|s| s.peak_to_peak)
}

/// Frequency estimate from mean-crossings of the signal.
///
/// Every crossing is paired with the one two places later, which spans a full
/// period. Returns 0 when fewer than three crossings were seen.
pub fn zero_crossing_frequency(data: &CaptureData) -> Result<f64, AnalysisError> {
    let values = &data.voltage_values;
    if values.is_empty() {
        return Err(AnalysisError::Empty);
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;

    let crossings: Vec<f64> = values
        .windows(2)
        .zip(&data.time_values)
        .filter(|(pair, _)| (pair[0] - mean).signum() != (pair[1] - mean).signum())
        .map(|(_, &time)| time)
        .collect();
    if crossings.len() < 3 {
        return Ok(0.0);
    }

    let periods: Vec<f64> = crossings.windows(3).map(|w| w[2] - w[0]).collect();
    let period = periods.iter().sum::<f64>() / periods.len() as f64;
    log::debug!(
        "{} crossings on {}, mean period {period:e} s",
        crossings.len(),
        data.channel
    );
    Ok(if period > 0.0 { 1.0 / period } else { 0.0 })
}
