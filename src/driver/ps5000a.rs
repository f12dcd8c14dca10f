//! Bindings to the vendor `libps5000a` shared library.
#![allow(unsafe_code)]

use std::collections::HashMap;
use std::ffi::{c_char, c_void, CString};
use std::ptr;

use crate::units::{self, VoltageRange};

use super::{
    Channel, Coupling, Driver, Handle, PicoStatus, RatioMode, Resolution, ThresholdDirection,
    TimebaseInfo, TriggerSource, UnitInfo, ValuesReadout,
};

mod ffi {
    use std::ffi::{c_char, c_void};

    pub type BlockReady = unsafe extern "C" fn(handle: i16, status: u32, parameter: *mut c_void);

    #[link(name = "ps5000a")]
    extern "C" {
        pub fn ps5000aOpenUnit(handle: *mut i16, serial: *mut c_char, resolution: i32) -> u32;
        pub fn ps5000aCloseUnit(handle: i16) -> u32;
        pub fn ps5000aStop(handle: i16) -> u32;
        pub fn ps5000aChangePowerSource(handle: i16, power_state: u32) -> u32;
        pub fn ps5000aGetUnitInfo(
            handle: i16,
            string: *mut c_char,
            string_length: i16,
            required_size: *mut i16,
            info: u32,
        ) -> u32;
        pub fn ps5000aMaximumValue(handle: i16, value: *mut i16) -> u32;
        pub fn ps5000aMinimumValue(handle: i16, value: *mut i16) -> u32;
        pub fn ps5000aSetChannel(
            handle: i16,
            channel: i32,
            enabled: i16,
            coupling: i32,
            range: i32,
            analog_offset: f32,
        ) -> u32;
        pub fn ps5000aSetSimpleTrigger(
            handle: i16,
            enable: i16,
            source: i32,
            threshold: i16,
            direction: i32,
            delay: u32,
            auto_trigger_ms: i16,
        ) -> u32;
        pub fn ps5000aSetDataBuffer(
            handle: i16,
            source: i32,
            buffer: *mut i16,
            buffer_length: i32,
            segment_index: u32,
            mode: i32,
        ) -> u32;
        pub fn ps5000aGetTimebase2(
            handle: i16,
            timebase: u32,
            no_samples: i32,
            time_interval_nanoseconds: *mut f32,
            max_samples: *mut i32,
            segment_index: u32,
        ) -> u32;
        pub fn ps5000aRunBlock(
            handle: i16,
            no_of_pre_trigger_samples: i32,
            no_of_post_trigger_samples: i32,
            timebase: u32,
            time_indisposed_ms: *mut i32,
            segment_index: u32,
            ready: Option<BlockReady>,
            parameter: *mut c_void,
        ) -> u32;
        pub fn ps5000aIsReady(handle: i16, ready: *mut i16) -> u32;
        pub fn ps5000aGetValues(
            handle: i16,
            start_index: u32,
            no_of_samples: *mut u32,
            down_sample_ratio: u32,
            down_sample_ratio_mode: i32,
            segment_index: u32,
            overflow: *mut i16,
        ) -> u32;
    }
}

const INFO_BUFFER_LEN: usize = 64;

/// The real hardware, through `libps5000a`.
///
/// Registered sample buffers are kept here so their memory stays valid for
/// as long as the library may write into it.
#[derive(Debug, Default)]
pub struct Ps5000aSdk {
    buffers: HashMap<(Handle, Channel), Vec<i16>>,
}

impl Ps5000aSdk {
    pub fn new() -> Self {
        Self::default()
    }

    fn forget_buffers(&mut self, handle: Handle) {
        self.buffers.retain(|(owner, _), _| *owner != handle);
    }
}

impl Drop for Ps5000aSdk {
    fn drop(&mut self) {
        if !self.buffers.is_empty() {
            log::warn!("Dropping SDK binding with {} buffer(s) still registered", self.buffers.len());
        }
    }
}

impl Driver for Ps5000aSdk {
    fn family(&self) -> &'static str {
        "PS5000A"
    }

    fn open_unit(&mut self, serial: Option<&str>, resolution: Resolution) -> (Handle, PicoStatus) {
        let serial = match serial.map(CString::new).transpose() {
            Ok(serial) => serial,
            Err(_) => return (0, PicoStatus::INVALID_PARAMETER),
        };
        let serial_ptr = serial.as_ref().map_or(ptr::null_mut(), |s| s.as_ptr().cast_mut());
        let mut handle: i16 = 0;
        let status = unsafe { ffi::ps5000aOpenUnit(&mut handle, serial_ptr, resolution.driver_code()) };
        (handle, PicoStatus(status))
    }

    fn change_power_source(&mut self, handle: Handle, power_state: PicoStatus) -> Result<(), PicoStatus> {
        PicoStatus(unsafe { ffi::ps5000aChangePowerSource(handle, power_state.0) }).check()
    }

    fn close_unit(&mut self, handle: Handle) -> Result<(), PicoStatus> {
        let status = PicoStatus(unsafe { ffi::ps5000aCloseUnit(handle) });
        self.forget_buffers(handle);
        status.check()
    }

    fn stop(&mut self, handle: Handle) -> Result<(), PicoStatus> {
        PicoStatus(unsafe { ffi::ps5000aStop(handle) }).check()
    }

    fn unit_info(&mut self, handle: Handle, info: UnitInfo) -> Result<String, PicoStatus> {
        let mut buffer: [c_char; INFO_BUFFER_LEN] = [0; INFO_BUFFER_LEN];
        let mut required: i16 = 0;
        let status = unsafe {
            ffi::ps5000aGetUnitInfo(
                handle,
                buffer.as_mut_ptr(),
                INFO_BUFFER_LEN as i16,
                &mut required,
                info.driver_code(),
            )
        };
        PicoStatus(status).check()?;
        let bytes: Vec<u8> = buffer.iter().take_while(|&&c| c != 0).map(|&c| c as u8).collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn maximum_value(&mut self, handle: Handle) -> Result<i16, PicoStatus> {
        let mut value: i16 = 0;
        PicoStatus(unsafe { ffi::ps5000aMaximumValue(handle, &mut value) }).check()?;
        Ok(value)
    }

    fn minimum_value(&mut self, handle: Handle) -> Result<i16, PicoStatus> {
        let mut value: i16 = 0;
        PicoStatus(unsafe { ffi::ps5000aMinimumValue(handle, &mut value) }).check()?;
        Ok(value)
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
        // The library takes the offset in volts.
        let max_adc = i32::from(self.maximum_value(handle)?);
        let offset_volts = units::adc_to_millivolts(f64::from(analog_offset_adc), range.volts(), max_adc)
            .map_err(|_| PicoStatus::INVALID_PARAMETER)?
            / 1000.0;
        let status = unsafe {
            ffi::ps5000aSetChannel(
                handle,
                channel.index() as i32,
                i16::from(enabled),
                coupling.driver_code(),
                range.driver_code(),
                offset_volts as f32,
            )
        };
        PicoStatus(status).check()
    }

    fn set_simple_trigger(
        &mut self,
        handle: Handle,
        enable: bool,
        source: TriggerSource,
        threshold_adc: i16,
        direction: ThresholdDirection,
        delay_samples: u32,
        auto_trigger_ms: i16,
    ) -> Result<(), PicoStatus> {
        let status = unsafe {
            ffi::ps5000aSetSimpleTrigger(
                handle,
                i16::from(enable),
                source.driver_code(),
                threshold_adc,
                direction.driver_code(),
                delay_samples,
                auto_trigger_ms,
            )
        };
        PicoStatus(status).check()
    }

    fn set_data_buffer(
        &mut self,
        handle: Handle,
        channel: Channel,
        buffer: Vec<i16>,
        segment_index: u32,
        mode: RatioMode,
    ) -> Result<(), PicoStatus> {
        let len = i32::try_from(buffer.len()).map_err(|_| PicoStatus::INVALID_PARAMETER)?;
        // Moving the Vec into the map keeps its heap allocation in place.
        let slot = self.buffers.entry((handle, channel)).or_default();
        *slot = buffer;
        let status = unsafe {
            ffi::ps5000aSetDataBuffer(
                handle,
                channel.index() as i32,
                slot.as_mut_ptr(),
                len,
                segment_index,
                mode.driver_code(),
            )
        };
        if let Err(status) = PicoStatus(status).check() {
            self.buffers.remove(&(handle, channel));
            return Err(status);
        }
        Ok(())
    }

    fn take_data_buffer(&mut self, handle: Handle, channel: Channel) -> Option<Vec<i16>> {
        let buffer = self.buffers.remove(&(handle, channel))?;
        let status = unsafe {
            ffi::ps5000aSetDataBuffer(
                handle,
                channel.index() as i32,
                ptr::null_mut(),
                0,
                0,
                RatioMode::None.driver_code(),
            )
        };
        if let Err(status) = PicoStatus(status).check() {
            log::debug!("Unregistering buffer for channel {channel} returned {status}");
        }
        Some(buffer)
    }

    fn get_timebase(
        &mut self,
        handle: Handle,
        timebase: u32,
        samples: i32,
        segment_index: u32,
    ) -> Result<TimebaseInfo, PicoStatus> {
        let mut interval_ns: f32 = 0.0;
        let mut max_samples: i32 = 0;
        let status = unsafe {
            ffi::ps5000aGetTimebase2(handle, timebase, samples, &mut interval_ns, &mut max_samples, segment_index)
        };
        PicoStatus(status).check()?;
        Ok(TimebaseInfo {
            interval_ns,
            max_samples,
        })
    }

    fn run_block(
        &mut self,
        handle: Handle,
        pre_trigger_samples: i32,
        post_trigger_samples: i32,
        timebase: u32,
        segment_index: u32,
    ) -> Result<(), PicoStatus> {
        let mut time_indisposed_ms: i32 = 0;
        let status = unsafe {
            ffi::ps5000aRunBlock(
                handle,
                pre_trigger_samples,
                post_trigger_samples,
                timebase,
                &mut time_indisposed_ms,
                segment_index,
                None,
                ptr::null_mut::<c_void>(),
            )
        };
        PicoStatus(status).check()?;
        log::trace!("Block armed, {time_indisposed_ms} ms indisposed");
        Ok(())
    }

    fn is_ready(&mut self, handle: Handle) -> Result<bool, PicoStatus> {
        let mut ready: i16 = 0;
        PicoStatus(unsafe { ffi::ps5000aIsReady(handle, &mut ready) }).check()?;
        Ok(ready != 0)
    }

    fn get_values(
        &mut self,
        handle: Handle,
        start_index: u32,
        samples: u32,
        downsample_ratio: u32,
        mode: RatioMode,
        segment_index: u32,
    ) -> Result<ValuesReadout, PicoStatus> {
        let mut samples = samples;
        let mut overflow: i16 = 0;
        let status = unsafe {
            ffi::ps5000aGetValues(
                handle,
                start_index,
                &mut samples,
                downsample_ratio,
                mode.driver_code(),
                segment_index,
                &mut overflow,
            )
        };
        PicoStatus(status).check()?;
        Ok(ValuesReadout { samples, overflow })
    }
}
