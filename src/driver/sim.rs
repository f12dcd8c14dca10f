//! An in-process stand-in for a PS5000A unit.
//!
//! Follows the driver's status conventions closely enough to exercise the
//! session end to end: resolution dependent timebases, the power source
//! handshake, readiness polling and per-channel overflow. Each input sees a
//! sine wave that crosses zero upwards at the trigger point.

use std::collections::HashMap;
use std::f64::consts::{FRAC_PI_2, TAU};

use crate::units::{self, VoltageRange};

use super::{
    Channel, Coupling, Driver, Handle, PicoStatus, RatioMode, Resolution, ThresholdDirection,
    TimebaseInfo, TriggerSource, UnitInfo, ValuesReadout,
};

/// Driver entry points that can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverOp {
    ChangePowerSource,
    UnitInfo,
    SetChannel,
    SetSimpleTrigger,
    SetDataBuffer,
    RunBlock,
    IsReady,
    GetValues,
}

/// Every call the simulator received, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCall {
    OpenUnit {
        serial: Option<String>,
        resolution: Resolution,
    },
    ChangePowerSource(PicoStatus),
    CloseUnit,
    Stop,
    UnitInfo(UnitInfo),
    SetChannel {
        channel: Channel,
        enabled: bool,
        coupling: Coupling,
        range: VoltageRange,
        analog_offset_adc: i32,
    },
    SetSimpleTrigger {
        source: TriggerSource,
        threshold_adc: i16,
        direction: ThresholdDirection,
        delay_samples: u32,
        auto_trigger_ms: i16,
    },
    SetDataBuffer {
        channel: Channel,
        len: usize,
    },
    GetTimebase {
        timebase: u32,
        samples: i32,
    },
    RunBlock {
        pre_trigger_samples: i32,
        post_trigger_samples: i32,
        timebase: u32,
    },
    IsReady,
    GetValues {
        start_index: u32,
        samples: u32,
        downsample_ratio: u32,
    },
}

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub batch_and_serial: String,
    pub variant: String,
    /// Status `open_unit` reports for a matching serial.
    pub open_status: PicoStatus,
    pub signal_frequency_hz: f64,
    pub signal_amplitude_mv: f64,
    /// `is_ready` answers "not ready" this many times after `run_block`.
    pub polls_until_ready: u32,
    /// Timebases below this index are rejected on top of the resolution rules.
    pub min_timebase: u32,
    pub memory_samples: i32,
    /// Caps the sample count `get_values` reports, like a block cut short.
    pub readout_limit: Option<u32>,
    pub failures: HashMap<DriverOp, PicoStatus>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            batch_and_serial: "SIM01/0001".to_string(),
            variant: "5444D".to_string(),
            open_status: PicoStatus::OK,
            signal_frequency_hz: 1_000.0,
            signal_amplitude_mv: 500.0,
            polls_until_ready: 3,
            min_timebase: 0,
            memory_samples: 128 * 1024 * 1024,
            readout_limit: None,
            failures: HashMap::new(),
        }
    }
}

impl SimulatorConfig {
    /// Make `op` return `status` from now on.
    pub fn fail(mut self, op: DriverOp, status: PicoStatus) -> Self {
        self.failures.insert(op, status);
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct SimChannel {
    enabled: bool,
    range: VoltageRange,
    analog_offset_adc: i32,
}

impl Default for SimChannel {
    fn default() -> Self {
        Self {
            enabled: false,
            range: VoltageRange::V5,
            analog_offset_adc: 0,
        }
    }
}

#[derive(Debug)]
struct BlockRun {
    pre_trigger_samples: u32,
    post_trigger_samples: u32,
    interval_ns: f64,
    polls_remaining: u32,
    complete: bool,
}

#[derive(Debug)]
struct OpenUnit {
    handle: Handle,
    resolution: Resolution,
    pending_power_state: Option<PicoStatus>,
    channels: [SimChannel; 4],
    buffers: HashMap<Channel, Vec<i16>>,
    run: Option<BlockRun>,
}

#[derive(Debug)]
pub struct SimulatedDriver {
    config: SimulatorConfig,
    unit: Option<OpenUnit>,
    next_handle: Handle,
    calls: Vec<DriverCall>,
}

impl SimulatedDriver {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            unit: None,
            next_handle: 1,
            calls: Vec::new(),
        }
    }

    pub fn config_mut(&mut self) -> &mut SimulatorConfig {
        &mut self.config
    }

    pub fn calls(&self) -> &[DriverCall] {
        &self.calls
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    pub fn is_open(&self) -> bool {
        self.unit.is_some()
    }

    fn injected(&self, op: DriverOp) -> Result<(), PicoStatus> {
        self.config.failures.get(&op).map_or(Ok(()), |status| Err(*status))
    }

    fn max_value(resolution: Resolution) -> i16 {
        match resolution {
            Resolution::Bits8 => 32512,
            _ => 32767,
        }
    }

    /// Sample interval for `timebase` at `resolution`, per the PS5000A tables.
    fn interval_ns(resolution: Resolution, timebase: u32) -> Option<f64> {
        let tb = f64::from(timebase);
        match resolution {
            Resolution::Bits8 if timebase < 3 => Some(f64::from(1u32 << timebase)),
            Resolution::Bits8 => Some((tb - 2.0) * 8.0),
            Resolution::Bits12 if timebase == 0 => None,
            Resolution::Bits12 if timebase < 4 => Some(f64::from(1u32 << (timebase - 1)) * 2.0),
            Resolution::Bits12 => Some((tb - 3.0) * 16.0),
            Resolution::Bits14 | Resolution::Bits15 if timebase < 3 => None,
            Resolution::Bits14 | Resolution::Bits15 => Some((tb - 2.0) * 8.0),
            Resolution::Bits16 if timebase < 4 => None,
            Resolution::Bits16 => Some((tb - 3.0) * 16.0),
        }
    }

    fn unit(&mut self, handle: Handle) -> Result<&mut OpenUnit, PicoStatus> {
        match self.unit.as_mut() {
            Some(unit) if unit.handle == handle => match unit.pending_power_state {
                Some(state) => Err(state),
                None => Ok(unit),
            },
            _ => Err(PicoStatus::INVALID_HANDLE),
        }
    }

    fn timebase_interval(&self, resolution: Resolution, timebase: u32) -> Result<f64, PicoStatus> {
        if timebase < self.config.min_timebase {
            return Err(PicoStatus::INVALID_TIMEBASE);
        }
        Self::interval_ns(resolution, timebase).ok_or(PicoStatus::INVALID_TIMEBASE)
    }

    fn fill_buffers(&mut self, handle: Handle, start_index: u32, samples: u32) -> Result<ValuesReadout, PicoStatus> {
        let frequency = self.config.signal_frequency_hz;
        let amplitude = self.config.signal_amplitude_mv;
        let limit = self.config.readout_limit.unwrap_or(u32::MAX);
        let unit = self.unit(handle)?;
        let run = unit.run.as_ref().ok_or(PicoStatus::INVALID_PARAMETER)?;
        if !run.complete {
            return Err(PicoStatus::INVALID_PARAMETER);
        }

        let total = run.pre_trigger_samples + run.post_trigger_samples;
        let available = total
            .saturating_sub(start_index)
            .min(samples)
            .min(limit);
        let pre = f64::from(run.pre_trigger_samples);
        let interval_s = run.interval_ns * 1e-9;
        let max = i32::from(Self::max_value(unit.resolution));
        let mut overflow = 0i16;

        for (channel, buffer) in &mut unit.buffers {
            let settings = unit.channels[channel.index()];
            if !settings.enabled {
                continue;
            }
            let range_mv = settings.range.volts() * 1000.0;
            let offset_mv = units::adc_to_millivolts(f64::from(settings.analog_offset_adc), settings.range.volts(), max)
                .map_err(|_| PicoStatus::INVALID_PARAMETER)?;
            let phase = channel.index() as f64 * FRAC_PI_2;

            for (i, slot) in buffer.iter_mut().take(available as usize).enumerate() {
                let t = (f64::from(start_index) + i as f64 - pre) * interval_s;
                let mv = amplitude.mul_add((TAU * frequency).mul_add(t, phase).sin(), offset_mv);
                let adc = (mv / range_mv * f64::from(max)).round();
                if adc.abs() > f64::from(max) {
                    overflow |= 1 << channel.index();
                }
                *slot = adc.clamp(-f64::from(max), f64::from(max)) as i16;
            }
        }

        Ok(ValuesReadout {
            samples: available,
            overflow,
        })
    }
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self::new(SimulatorConfig::default())
    }
}

impl Driver for SimulatedDriver {
    fn family(&self) -> &'static str {
        "PS5000A"
    }

    fn open_unit(&mut self, serial: Option<&str>, resolution: Resolution) -> (Handle, PicoStatus) {
        self.calls.push(DriverCall::OpenUnit {
            serial: serial.map(str::to_string),
            resolution,
        });

        if self.unit.is_some() {
            return (0, PicoStatus::NOT_FOUND);
        }
        if serial.is_some_and(|s| s != self.config.batch_and_serial) {
            return (0, PicoStatus::NOT_FOUND);
        }

        let status = self.config.open_status;
        if !status.is_ok() && !status.needs_power_source_change() {
            return (0, status);
        }

        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        self.unit = Some(OpenUnit {
            handle,
            resolution,
            pending_power_state: (!status.is_ok()).then_some(status),
            channels: [SimChannel::default(); 4],
            buffers: HashMap::new(),
            run: None,
        });
        (handle, status)
    }

    fn change_power_source(&mut self, handle: Handle, power_state: PicoStatus) -> Result<(), PicoStatus> {
        self.calls.push(DriverCall::ChangePowerSource(power_state));
        self.injected(DriverOp::ChangePowerSource)?;
        match self.unit.as_mut() {
            Some(unit) if unit.handle == handle => {
                if unit.pending_power_state == Some(power_state) {
                    unit.pending_power_state = None;
                    Ok(())
                } else {
                    Err(PicoStatus::INVALID_PARAMETER)
                }
            }
            _ => Err(PicoStatus::INVALID_HANDLE),
        }
    }

    fn close_unit(&mut self, handle: Handle) -> Result<(), PicoStatus> {
        self.calls.push(DriverCall::CloseUnit);
        match &self.unit {
            Some(unit) if unit.handle == handle => {
                self.unit = None;
                Ok(())
            }
            _ => Err(PicoStatus::INVALID_HANDLE),
        }
    }

    fn stop(&mut self, handle: Handle) -> Result<(), PicoStatus> {
        self.calls.push(DriverCall::Stop);
        let unit = self.unit(handle)?;
        unit.run = None;
        Ok(())
    }

    fn unit_info(&mut self, handle: Handle, info: UnitInfo) -> Result<String, PicoStatus> {
        self.calls.push(DriverCall::UnitInfo(info));
        self.injected(DriverOp::UnitInfo)?;
        self.unit(handle)?;
        Ok(match info {
            UnitInfo::VariantInfo => self.config.variant.clone(),
            UnitInfo::BatchAndSerial => self.config.batch_and_serial.clone(),
        })
    }

    fn maximum_value(&mut self, handle: Handle) -> Result<i16, PicoStatus> {
        let unit = self.unit(handle)?;
        Ok(Self::max_value(unit.resolution))
    }

    fn minimum_value(&mut self, handle: Handle) -> Result<i16, PicoStatus> {
        let unit = self.unit(handle)?;
        Ok(-Self::max_value(unit.resolution))
    }

    fn set_channel(
        &mut self,
        handle: Handle,
        channel: Channel,
        enabled: bool,
        coupling: Coupling,
        range: VoltageRange,
        analog_offset_adc: i32,
    ) -> Result<(), PicoStatus> {
        self.calls.push(DriverCall::SetChannel {
            channel,
            enabled,
            coupling,
            range,
            analog_offset_adc,
        });
        self.injected(DriverOp::SetChannel)?;
        let unit = self.unit(handle)?;
        unit.channels[channel.index()] = SimChannel {
            enabled,
            range,
            analog_offset_adc,
        };
        Ok(())
    }

    fn set_simple_trigger(
        &mut self,
        handle: Handle,
        _enable: bool,
        source: TriggerSource,
        threshold_adc: i16,
        direction: ThresholdDirection,
        delay_samples: u32,
        auto_trigger_ms: i16,
    ) -> Result<(), PicoStatus> {
        self.calls.push(DriverCall::SetSimpleTrigger {
            source,
            threshold_adc,
            direction,
            delay_samples,
            auto_trigger_ms,
        });
        self.injected(DriverOp::SetSimpleTrigger)?;
        self.unit(handle)?;
        Ok(())
    }

    fn set_data_buffer(
        &mut self,
        handle: Handle,
        channel: Channel,
        buffer: Vec<i16>,
        _segment_index: u32,
        _mode: RatioMode,
    ) -> Result<(), PicoStatus> {
        self.calls.push(DriverCall::SetDataBuffer {
            channel,
            len: buffer.len(),
        });
        self.injected(DriverOp::SetDataBuffer)?;
        let unit = self.unit(handle)?;
        unit.buffers.insert(channel, buffer);
        Ok(())
    }

    fn take_data_buffer(&mut self, handle: Handle, channel: Channel) -> Option<Vec<i16>> {
        self.unit(handle).ok()?.buffers.remove(&channel)
    }

    fn get_timebase(
        &mut self,
        handle: Handle,
        timebase: u32,
        samples: i32,
        _segment_index: u32,
    ) -> Result<TimebaseInfo, PicoStatus> {
        self.calls.push(DriverCall::GetTimebase { timebase, samples });
        let memory = self.config.memory_samples;
        let unit = self.unit(handle)?;
        let resolution = unit.resolution;
        let enabled = unit.channels.iter().filter(|c| c.enabled).count().max(1) as i32;
        let interval_ns = self.timebase_interval(resolution, timebase)?;
        let max_samples = memory / enabled;
        if samples > max_samples {
            return Err(PicoStatus::INVALID_PARAMETER);
        }
        Ok(TimebaseInfo {
            interval_ns: interval_ns as f32,
            max_samples,
        })
    }

    fn run_block(
        &mut self,
        handle: Handle,
        pre_trigger_samples: i32,
        post_trigger_samples: i32,
        timebase: u32,
        _segment_index: u32,
    ) -> Result<(), PicoStatus> {
        self.calls.push(DriverCall::RunBlock {
            pre_trigger_samples,
            post_trigger_samples,
            timebase,
        });
        self.injected(DriverOp::RunBlock)?;
        let polls = self.config.polls_until_ready;
        let resolution = self.unit(handle)?.resolution;
        let interval_ns = self.timebase_interval(resolution, timebase)?;
        let pre = u32::try_from(pre_trigger_samples).map_err(|_| PicoStatus::INVALID_PARAMETER)?;
        let post = u32::try_from(post_trigger_samples).map_err(|_| PicoStatus::INVALID_PARAMETER)?;
        self.unit(handle)?.run = Some(BlockRun {
            pre_trigger_samples: pre,
            post_trigger_samples: post,
            interval_ns,
            polls_remaining: polls,
            complete: false,
        });
        Ok(())
    }

    fn is_ready(&mut self, handle: Handle) -> Result<bool, PicoStatus> {
        self.calls.push(DriverCall::IsReady);
        self.injected(DriverOp::IsReady)?;
        let run = self.unit(handle)?.run.as_mut().ok_or(PicoStatus::INVALID_PARAMETER)?;
        if run.polls_remaining == 0 {
            run.complete = true;
        } else {
            run.polls_remaining -= 1;
        }
        Ok(run.complete)
    }

    fn get_values(
        &mut self,
        handle: Handle,
        start_index: u32,
        samples: u32,
        downsample_ratio: u32,
        _mode: RatioMode,
        _segment_index: u32,
    ) -> Result<ValuesReadout, PicoStatus> {
        self.calls.push(DriverCall::GetValues {
            start_index,
            samples,
            downsample_ratio,
        });
        self.injected(DriverOp::GetValues)?;
        self.fill_buffers(handle, start_index, samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(driver: &mut SimulatedDriver, resolution: Resolution) -> Handle {
        let (handle, status) = driver.open_unit(None, resolution);
        assert_eq!(status, PicoStatus::OK);
        handle
    }

    #[test]
    fn test_timebase_tables() {
        assert_eq!(SimulatedDriver::interval_ns(Resolution::Bits8, 0), Some(1.0));
        assert_eq!(SimulatedDriver::interval_ns(Resolution::Bits8, 3), Some(8.0));
        assert_eq!(SimulatedDriver::interval_ns(Resolution::Bits12, 0), None);
        assert_eq!(SimulatedDriver::interval_ns(Resolution::Bits12, 1), Some(2.0));
        assert_eq!(SimulatedDriver::interval_ns(Resolution::Bits12, 3), Some(8.0));
        assert_eq!(SimulatedDriver::interval_ns(Resolution::Bits12, 5), Some(32.0));
        assert_eq!(SimulatedDriver::interval_ns(Resolution::Bits14, 2), None);
        assert_eq!(SimulatedDriver::interval_ns(Resolution::Bits16, 4), Some(16.0));
    }

    #[test]
    fn test_open_with_wrong_serial_fails() {
        let mut driver = SimulatedDriver::default();
        let (_, status) = driver.open_unit(Some("XX99/9999"), Resolution::Bits12);
        assert_eq!(status, PicoStatus::NOT_FOUND);
        assert!(!driver.is_open());
    }

    #[test]
    fn test_power_source_must_be_confirmed() {
        let mut driver = SimulatedDriver::new(SimulatorConfig {
            open_status: PicoStatus::POWER_SUPPLY_NOT_CONNECTED,
            ..SimulatorConfig::default()
        });
        let (handle, status) = driver.open_unit(None, Resolution::Bits12);
        assert_eq!(status, PicoStatus::POWER_SUPPLY_NOT_CONNECTED);
        assert_eq!(
            driver.unit_info(handle, UnitInfo::VariantInfo),
            Err(PicoStatus::POWER_SUPPLY_NOT_CONNECTED)
        );
        driver.change_power_source(handle, status).unwrap();
        assert_eq!(driver.unit_info(handle, UnitInfo::VariantInfo).unwrap(), "5444D");
    }

    #[test]
    fn test_block_run_fills_registered_buffer() {
        let mut driver = SimulatedDriver::default();
        let handle = open(&mut driver, Resolution::Bits12);
        driver
            .set_channel(handle, Channel::A, true, Coupling::Dc, VoltageRange::V1, 0)
            .unwrap();
        driver
            .set_data_buffer(handle, Channel::A, vec![0; 100], 0, RatioMode::None)
            .unwrap();
        driver.run_block(handle, 50, 50, 4, 0).unwrap();
        let mut polls = 0;
        while !driver.is_ready(handle).unwrap() {
            polls += 1;
        }
        assert_eq!(polls, 3);
        let readout = driver.get_values(handle, 0, 100, 1, RatioMode::None, 0).unwrap();
        assert_eq!(readout.samples, 100);
        assert_eq!(readout.overflow, 0);
        let buffer = driver.take_data_buffer(handle, Channel::A).unwrap();
        assert_eq!(buffer.len(), 100);
        // Zero crossing at the trigger point
        assert_eq!(buffer[50], 0);
    }

    #[test]
    fn test_small_range_overflows() {
        let mut driver = SimulatedDriver::default();
        let handle = open(&mut driver, Resolution::Bits12);
        driver
            .set_channel(handle, Channel::B, true, Coupling::Dc, VoltageRange::Mv20, 0)
            .unwrap();
        driver
            .set_data_buffer(handle, Channel::B, vec![0; 2000], 0, RatioMode::None)
            .unwrap();
        driver.run_block(handle, 0, 2000, 100, 0).unwrap();
        while !driver.is_ready(handle).unwrap() {}
        let readout = driver.get_values(handle, 0, 2000, 1, RatioMode::None, 0).unwrap();
        assert!(readout.overflowed(Channel::B));
    }

    #[test]
    fn test_injected_failure() {
        let mut driver =
            SimulatedDriver::new(SimulatorConfig::default().fail(DriverOp::SetChannel, PicoStatus::INVALID_VOLTAGE_RANGE));
        let handle = open(&mut driver, Resolution::Bits12);
        assert_eq!(
            driver.set_channel(handle, Channel::A, true, Coupling::Ac, VoltageRange::V1, 0),
            Err(PicoStatus::INVALID_VOLTAGE_RANGE)
        );
    }

    #[test]
    fn test_stale_handle_is_rejected() {
        let mut driver = SimulatedDriver::default();
        let handle = open(&mut driver, Resolution::Bits12);
        driver.close_unit(handle).unwrap();
        assert_eq!(driver.stop(handle), Err(PicoStatus::INVALID_HANDLE));
    }
}
