//! Block acquisition on an open session.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use polars::prelude::*;
use serde::Serialize;

use crate::driver::{Channel, Driver, Handle, PicoStatus, RatioMode, TimebaseInfo, ValuesReadout};
use crate::session::{rejected, Session, SessionError};
use crate::units::{self, VoltageRange};

/// Timebase indices tried, starting at 0, before giving up.
pub const TIMEBASE_ATTEMPTS: u32 = 100;

const SEGMENT: u32 = 0;

pub const TIME_COLUMN_NAME: &str = "time";
pub const VOLTAGE_COLUMN_NAME: &str = "voltage_mv";

/// Shared flag that aborts a capture waiting for its trigger.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Re-arm before the next capture.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One channel's samples in engineering units.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureData {
    #[serde(skip_serializing)]
    pub channel: Channel,
    /// Seconds from the first sample.
    pub time_values: Vec<f64>,
    pub voltage_values: Vec<f64>,
    pub sample_interval_ns: f64,
    pub num_samples: usize,
}

impl CaptureData {
    /// The first `n` samples, or all of them when there are fewer.
    pub fn head(&self, n: usize) -> Self {
        let n = n.min(self.time_values.len()).min(self.voltage_values.len());
        Self {
            channel: self.channel,
            time_values: self.time_values[..n].to_vec(),
            voltage_values: self.voltage_values[..n].to_vec(),
            sample_interval_ns: self.sample_interval_ns,
            num_samples: n,
        }
    }

    pub fn to_dataframe(&self) -> PolarsResult<DataFrame> {
        df!(
            TIME_COLUMN_NAME => &self.time_values,
            VOLTAGE_COLUMN_NAME => &self.voltage_values
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockCapture {
    pub pre_trigger_samples: u32,
    pub post_trigger_samples: u32,
    pub total_samples: u32,
    pub timebase: u32,
    pub sample_interval_ns: f64,
    pub channels: BTreeMap<Channel, CaptureData>,
    /// Channels that went over range during the block.
    pub overflow: Vec<Channel>,
}

impl<D: Driver> Session<D> {
    /// Runs one block acquisition on every enabled channel.
    ///
    /// Either the whole block comes back or nothing does. A failed capture
    /// leaves the session connected with its configuration untouched.
    pub fn capture_block(
        &mut self,
        pre_trigger_samples: u32,
        post_trigger_samples: u32,
        cancel: &CancelToken,
    ) -> Result<BlockCapture, SessionError> {
        #[cfg(feature = "cpu-profiling")]
        let _span = tracy_client::Client::running()
            .map(|client| client.span(tracy_client::span_location!("capture_block"), 0));

        let connected = self.connected.as_ref().ok_or(SessionError::NotConnected)?;
        let handle = connected.info.handle;
        let max_adc = connected.info.max_adc_value;
        let total = pre_trigger_samples
            .checked_add(post_trigger_samples)
            .filter(|&total| total > 0 && i32::try_from(total).is_ok())
            .ok_or_else(|| {
                SessionError::InvalidArgument(format!(
                    "pre + post trigger samples must be between 1 and {}, got {pre_trigger_samples} + {post_trigger_samples}",
                    i32::MAX
                ))
            })?;
        let enabled: Vec<(Channel, VoltageRange)> = connected
            .channels
            .values()
            .filter(|applied| applied.config.enabled)
            .map(|applied| (applied.config.channel, applied.range))
            .collect();
        if enabled.is_empty() {
            log::warn!("No channel enabled, the capture will return no data");
        }

        let acquired = self.acquire(handle, pre_trigger_samples, post_trigger_samples, total, &enabled, cancel);
        // Reclaim every buffer, also on failure, so none stays registered.
        let buffers: Vec<_> = enabled
            .iter()
            .map(|&(channel, range)| (channel, range, self.driver.take_data_buffer(handle, channel)))
            .collect();
        let (timebase, timebase_info, readout) = acquired?;

        let sample_interval_ns = f64::from(timebase_info.interval_ns);
        // Short readouts are returned as they are, never padded.
        let num_samples = readout.samples.min(total) as usize;
        if num_samples < total as usize {
            log::warn!("Driver returned {num_samples} of {total} requested samples");
        }
        let time_values: Vec<f64> = (0..num_samples)
            .map(|i| i as f64 * sample_interval_ns * 1e-9)
            .collect();

        let mut channels = BTreeMap::new();
        for (channel, range, buffer) in buffers {
            let buffer = buffer.ok_or(SessionError::HardwareRejected {
                operation: "get_values",
                status: PicoStatus::INVALID_PARAMETER,
            })?;
            let end = num_samples.min(buffer.len());
            let voltage_values = units::adc_buffer_to_millivolts(&buffer[..end], range, max_adc)?;
            channels.insert(
                channel,
                CaptureData {
                    channel,
                    time_values: time_values[..end].to_vec(),
                    voltage_values,
                    sample_interval_ns,
                    num_samples: end,
                },
            );
        }

        let overflow: Vec<Channel> = enabled
            .iter()
            .map(|&(channel, _)| channel)
            .filter(|&channel| readout.overflowed(channel))
            .collect();
        if !overflow.is_empty() {
            log::warn!("Over range on {overflow:?}");
        }
        log::info!(
            "Captured {num_samples} samples on {} channel(s) at timebase {timebase} ({sample_interval_ns} ns)",
            channels.len()
        );

        Ok(BlockCapture {
            pre_trigger_samples,
            post_trigger_samples,
            total_samples: total,
            timebase,
            sample_interval_ns,
            channels,
            overflow,
        })
    }

    fn acquire(
        &mut self,
        handle: Handle,
        pre_trigger_samples: u32,
        post_trigger_samples: u32,
        total: u32,
        enabled: &[(Channel, VoltageRange)],
        cancel: &CancelToken,
    ) -> Result<(u32, TimebaseInfo, ValuesReadout), SessionError> {
        for &(channel, _) in enabled {
            self.driver
                .set_data_buffer(handle, channel, vec![0; total as usize], SEGMENT, RatioMode::None)
                .map_err(rejected("set_data_buffer"))?;
        }

        let samples = i32::try_from(total).map_err(|_| SessionError::InvalidArgument(format!("{total} samples")))?;
        let (timebase, timebase_info) = self.find_timebase(handle, samples)?;
        log::debug!(
            "Timebase {timebase}: {} ns, up to {} samples",
            timebase_info.interval_ns,
            timebase_info.max_samples
        );

        // Both halves fit in i32 since their sum does.
        self.driver
            .run_block(
                handle,
                pre_trigger_samples as i32,
                post_trigger_samples as i32,
                timebase,
                SEGMENT,
            )
            .map_err(rejected("run_block"))?;

        if let Err(e) = self.wait_until_ready(handle, cancel) {
            self.abort(handle);
            return Err(e);
        }

        let readout = self
            .driver
            .get_values(handle, 0, total, 1, RatioMode::None, SEGMENT)
            .map_err(rejected("get_values"))?;
        Ok((timebase, timebase_info, readout))
    }

    fn find_timebase(&mut self, handle: Handle, samples: i32) -> Result<(u32, TimebaseInfo), SessionError> {
        let mut last_status = PicoStatus::INVALID_TIMEBASE;
        for timebase in 0..TIMEBASE_ATTEMPTS {
            match self.driver.get_timebase(handle, timebase, samples, SEGMENT) {
                Ok(info) => return Ok((timebase, info)),
                Err(status) => {
                    log::trace!("Timebase {timebase} rejected with {status}");
                    last_status = status;
                }
            }
        }
        Err(SessionError::TimebaseUnavailable {
            attempts: TIMEBASE_ATTEMPTS,
            status: last_status,
        })
    }

    fn wait_until_ready(&mut self, handle: Handle, cancel: &CancelToken) -> Result<(), SessionError> {
        let started = Instant::now();
        loop {
            if cancel.is_cancelled() {
                log::info!("Capture cancelled while waiting for trigger");
                return Err(SessionError::Cancelled);
            }
            if self.driver.is_ready(handle).map_err(rejected("is_ready"))? {
                log::debug!("Block ready after {:?}", started.elapsed());
                return Ok(());
            }
            if let Some(timeout) = self.settings.ready_timeout {
                if started.elapsed() >= timeout {
                    log::warn!("Block not ready after {timeout:?}, stopping");
                    return Err(SessionError::CaptureTimedOut(timeout));
                }
            }
            std::thread::sleep(self.settings.poll_interval);
        }
    }

    fn abort(&mut self, handle: Handle) {
        if let Err(status) = self.driver.stop(handle) {
            log::warn!("Stopping aborted capture returned {status}");
        }
    }
}
