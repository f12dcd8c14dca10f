//! The seam between the session and the vendor PS5000A API.
//!
//! [`Driver`] mirrors the driver primitives one to one, with status codes
//! surfaced as [`PicoStatus`]. The sequencing logic lives above it, so the
//! same session code runs against [`sim::SimulatedDriver`] and, with the
//! `picosdk` feature, against the real `libps5000a`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::units::VoltageRange;

pub mod sim;

#[cfg(feature = "picosdk")]
pub mod ps5000a;

/// Driver handle for an open unit.
pub type Handle = i16;

/// `PICO_STATUS` return value. Zero is success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PicoStatus(pub u32);

impl fmt::Display for PicoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "driver status {:#06x} ({})", self.0, self.name())
    }
}

impl std::error::Error for PicoStatus {}

impl PicoStatus {
    pub const OK: Self = Self(0x0000);
    pub const NOT_FOUND: Self = Self(0x0003);
    pub const NOT_RESPONDING: Self = Self(0x0007);
    pub const INVALID_HANDLE: Self = Self(0x000C);
    pub const INVALID_PARAMETER: Self = Self(0x000D);
    pub const INVALID_TIMEBASE: Self = Self(0x000E);
    pub const INVALID_VOLTAGE_RANGE: Self = Self(0x000F);
    pub const INVALID_CHANNEL: Self = Self(0x0010);
    pub const INVALID_TRIGGER_CHANNEL: Self = Self(0x0011);
    pub const POWER_SUPPLY_CONNECTED: Self = Self(0x0119);
    pub const POWER_SUPPLY_NOT_CONNECTED: Self = Self(0x011A);
    pub const USB3_0_DEVICE_NON_USB3_0_PORT: Self = Self(0x011E);

    pub fn is_ok(self) -> bool {
        self == Self::OK
    }

    /// Open succeeded but the unit wants its power source confirmed.
    pub fn needs_power_source_change(self) -> bool {
        self == Self::POWER_SUPPLY_NOT_CONNECTED || self == Self::USB3_0_DEVICE_NON_USB3_0_PORT
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::OK => "PICO_OK",
            Self::NOT_FOUND => "PICO_NOT_FOUND",
            Self::NOT_RESPONDING => "PICO_NOT_RESPONDING",
            Self::INVALID_HANDLE => "PICO_INVALID_HANDLE",
            Self::INVALID_PARAMETER => "PICO_INVALID_PARAMETER",
            Self::INVALID_TIMEBASE => "PICO_INVALID_TIMEBASE",
            Self::INVALID_VOLTAGE_RANGE => "PICO_INVALID_VOLTAGE_RANGE",
            Self::INVALID_CHANNEL => "PICO_INVALID_CHANNEL",
            Self::INVALID_TRIGGER_CHANNEL => "PICO_INVALID_TRIGGER_CHANNEL",
            Self::POWER_SUPPLY_CONNECTED => "PICO_POWER_SUPPLY_CONNECTED",
            Self::POWER_SUPPLY_NOT_CONNECTED => "PICO_POWER_SUPPLY_NOT_CONNECTED",
            Self::USB3_0_DEVICE_NON_USB3_0_PORT => "PICO_USB3_0_DEVICE_NON_USB3_0_PORT",
            _ => "unrecognized",
        }
    }

    /// `Ok(())` for `PICO_OK`, the status itself otherwise.
    pub fn check(self) -> Result<(), Self> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownIdentifier(pub String);

impl fmt::Display for UnknownIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown identifier {:?}", self.0)
    }
}

impl std::error::Error for UnknownIdentifier {}

/// Analog input channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Channel {
    A,
    B,
    C,
    D,
}

impl Channel {
    pub const ALL: [Self; 4] = [Self::A, Self::B, Self::C, Self::D];

    /// Zero-based index, also the driver's `PS5000A_CHANNEL` value.
    pub fn index(self) -> usize {
        match self {
            Self::A => 0,
            Self::B => 1,
            Self::C => 2,
            Self::D => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = UnknownIdentifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" => Ok(Self::A),
            "B" => Ok(Self::B),
            "C" => Ok(Self::C),
            "D" => Ok(Self::D),
            other => Err(UnknownIdentifier(other.to_string())),
        }
    }
}

/// Where the trigger comparator looks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TriggerSource {
    Channel(Channel),
    External,
}

impl TriggerSource {
    pub fn driver_code(self) -> i32 {
        match self {
            Self::Channel(channel) => channel.index() as i32,
            Self::External => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Channel(channel) => channel.as_str(),
            Self::External => "External",
        }
    }
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for TriggerSource {
    type Error = UnknownIdentifier;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TriggerSource> for String {
    fn from(source: TriggerSource) -> Self {
        source.as_str().to_string()
    }
}

impl FromStr for TriggerSource {
    type Err = UnknownIdentifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "External" => Ok(Self::External),
            other => other.parse().map(Self::Channel),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Coupling {
    #[serde(rename = "AC")]
    Ac,
    #[default]
    #[serde(rename = "DC")]
    Dc,
}

impl Coupling {
    pub fn driver_code(self) -> i32 {
        match self {
            Self::Ac => 0,
            Self::Dc => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ac => "AC",
            Self::Dc => "DC",
        }
    }
}

impl FromStr for Coupling {
    type Err = UnknownIdentifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AC" => Ok(Self::Ac),
            "DC" => Ok(Self::Dc),
            other => Err(UnknownIdentifier(other.to_string())),
        }
    }
}

/// Edge the simple trigger fires on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ThresholdDirection {
    #[default]
    Rising,
    Falling,
    #[serde(rename = "Rising_Or_Falling")]
    RisingOrFalling,
}

impl ThresholdDirection {
    pub fn driver_code(self) -> i32 {
        match self {
            Self::Rising => 2,
            Self::Falling => 3,
            Self::RisingOrFalling => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rising => "Rising",
            Self::Falling => "Falling",
            Self::RisingOrFalling => "Rising_Or_Falling",
        }
    }
}

impl FromStr for ThresholdDirection {
    type Err = UnknownIdentifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Rising" => Ok(Self::Rising),
            "Falling" => Ok(Self::Falling),
            "Rising_Or_Falling" => Ok(Self::RisingOrFalling),
            other => Err(UnknownIdentifier(other.to_string())),
        }
    }
}

/// Vertical resolution requested at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
pub enum Resolution {
    #[serde(rename = "8bit")]
    Bits8,
    #[default]
    #[serde(rename = "12bit")]
    Bits12,
    #[serde(rename = "14bit")]
    Bits14,
    #[serde(rename = "15bit")]
    Bits15,
    #[serde(rename = "16bit")]
    Bits16,
}

impl Resolution {
    pub fn driver_code(self) -> i32 {
        match self {
            Self::Bits8 => 0,
            Self::Bits12 => 1,
            Self::Bits14 => 2,
            Self::Bits15 => 3,
            Self::Bits16 => 4,
        }
    }
}

/// Downsampling applied on readout. Only "none" is used for block capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RatioMode {
    None,
}

impl RatioMode {
    pub fn driver_code(self) -> i32 {
        match self {
            Self::None => 0,
        }
    }
}

/// `PICO_INFO` selectors the session reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitInfo {
    VariantInfo,
    BatchAndSerial,
}

impl UnitInfo {
    pub fn driver_code(self) -> u32 {
        match self {
            Self::VariantInfo => 3,
            Self::BatchAndSerial => 4,
        }
    }
}

/// Answer to a timebase query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimebaseInfo {
    pub interval_ns: f32,
    pub max_samples: i32,
}

/// Outcome of a readout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValuesReadout {
    pub samples: u32,
    /// Bit `n` set means channel `n` went over range.
    pub overflow: i16,
}

impl ValuesReadout {
    pub fn overflowed(&self, channel: Channel) -> bool {
        self.overflow & (1 << channel.index()) != 0
    }
}

/// PS5000A driver primitives.
///
/// Every call is synchronous and returns the driver's status. Buffers handed
/// over with [`Driver::set_data_buffer`] stay owned by the driver until
/// [`Driver::take_data_buffer`] gives them back.
pub trait Driver {
    /// Model family reported in device information.
    fn family(&self) -> &'static str;

    /// Opens a unit. The handle is meaningful for `PICO_OK` and for power
    /// source statuses, which still need [`Driver::change_power_source`].
    fn open_unit(&mut self, serial: Option<&str>, resolution: Resolution) -> (Handle, PicoStatus);

    fn change_power_source(&mut self, handle: Handle, power_state: PicoStatus) -> Result<(), PicoStatus>;

    fn close_unit(&mut self, handle: Handle) -> Result<(), PicoStatus>;

    fn stop(&mut self, handle: Handle) -> Result<(), PicoStatus>;

    fn unit_info(&mut self, handle: Handle, info: UnitInfo) -> Result<String, PicoStatus>;

    fn maximum_value(&mut self, handle: Handle) -> Result<i16, PicoStatus>;

    fn minimum_value(&mut self, handle: Handle) -> Result<i16, PicoStatus>;

    /// `analog_offset_adc` is in ADC counts relative to `range`.
    fn set_channel(
        &mut self,
        handle: Handle,
        channel: Channel,
        enabled: bool,
        coupling: Coupling,
        range: VoltageRange,
        analog_offset_adc: i32,
    ) -> Result<(), PicoStatus>;

    fn set_simple_trigger(
        &mut self,
        handle: Handle,
        enable: bool,
        source: TriggerSource,
        threshold_adc: i16,
        direction: ThresholdDirection,
        delay_samples: u32,
        auto_trigger_ms: i16,
    ) -> Result<(), PicoStatus>;

    fn set_data_buffer(
        &mut self,
        handle: Handle,
        channel: Channel,
        buffer: Vec<i16>,
        segment_index: u32,
        mode: RatioMode,
    ) -> Result<(), PicoStatus>;

    fn take_data_buffer(&mut self, handle: Handle, channel: Channel) -> Option<Vec<i16>>;

    fn get_timebase(
        &mut self,
        handle: Handle,
        timebase: u32,
        samples: i32,
        segment_index: u32,
    ) -> Result<TimebaseInfo, PicoStatus>;

    fn run_block(
        &mut self,
        handle: Handle,
        pre_trigger_samples: i32,
        post_trigger_samples: i32,
        timebase: u32,
        segment_index: u32,
    ) -> Result<(), PicoStatus>;

    fn is_ready(&mut self, handle: Handle) -> Result<bool, PicoStatus>;

    fn get_values(
        &mut self,
        handle: Handle,
        start_index: u32,
        samples: u32,
        downsample_ratio: u32,
        mode: RatioMode,
        segment_index: u32,
    ) -> Result<ValuesReadout, PicoStatus>;
}
