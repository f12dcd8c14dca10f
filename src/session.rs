use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use crate::driver::{Channel, Coupling, Driver, Handle, PicoStatus, Resolution, TriggerSource, UnitInfo};
use crate::trigger_config::{SimpleTrigger, TriggerConfig, TriggerConfigError};
use crate::units::{self, ConversionError, VoltageRange};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("No device connected")]
    NotConnected,

    #[error("Device {serial} is already connected, disconnect it first")]
    AlreadyConnected { serial: String },

    #[error("Failed to connect to device: {operation} returned {status}")]
    Connection { operation: &'static str, status: PicoStatus },

    #[error("Unknown channel {0}")]
    UnknownChannel(String),

    #[error("Unknown trigger source {0}")]
    UnknownSource(String),

    #[error("Driver rejected {operation}: {status}")]
    HardwareRejected { operation: &'static str, status: PicoStatus },

    #[error("No usable timebase found in {attempts} attempts (last answer: {status})")]
    TimebaseUnavailable { attempts: u32, status: PicoStatus },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Capture did not complete within {0:?}")]
    CaptureTimedOut(Duration),

    #[error("Capture cancelled")]
    Cancelled,
}

impl SessionError {
    /// Stable identifier used in tool responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotConnected => "not_connected",
            Self::AlreadyConnected { .. } => "already_connected",
            Self::Connection { .. } => "connection_error",
            Self::UnknownChannel(_) => "unknown_channel",
            Self::UnknownSource(_) => "unknown_source",
            Self::HardwareRejected { .. } => "hardware_rejected",
            Self::TimebaseUnavailable { .. } => "timebase_unavailable",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::CaptureTimedOut(_) => "capture_timed_out",
            Self::Cancelled => "cancelled",
        }
    }
}

impl From<ConversionError> for SessionError {
    fn from(error: ConversionError) -> Self {
        Self::InvalidArgument(error.to_string())
    }
}

impl From<TriggerConfigError> for SessionError {
    fn from(error: TriggerConfigError) -> Self {
        Self::InvalidArgument(error.to_string())
    }
}

pub(crate) fn rejected(operation: &'static str) -> impl FnOnce(PicoStatus) -> SessionError {
    move |status| SessionError::HardwareRejected { operation, status }
}

fn connection(operation: &'static str) -> impl FnOnce(PicoStatus) -> SessionError {
    move |status| SessionError::Connection { operation, status }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub handle: Handle,
    pub model: String,
    pub serial: String,
    pub variant: String,
    pub batch_and_serial: String,
    pub max_adc_value: i32,
    pub min_adc_value: i32,
    pub num_channels: usize,
}

/// Channel settings in engineering units, as requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelConfig {
    pub channel: Channel,
    pub enabled: bool,
    pub coupling: Coupling,
    /// Requested full scale in volts, snapped to the range ladder.
    pub voltage_range: f64,
    /// Volts.
    pub analog_offset: f64,
}

impl ChannelConfig {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            enabled: true,
            coupling: Coupling::Dc,
            voltage_range: 5.0,
            analog_offset: 0.0,
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn coupling(mut self, coupling: Coupling) -> Self {
        self.coupling = coupling;
        self
    }

    pub fn voltage_range(mut self, volts: f64) -> Self {
        self.voltage_range = volts;
        self
    }

    pub fn analog_offset(mut self, volts: f64) -> Self {
        self.analog_offset = volts;
        self
    }
}

/// A channel configuration the hardware accepted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AppliedChannel {
    pub config: ChannelConfig,
    pub range: VoltageRange,
    pub analog_offset_adc: i32,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub resolution: Resolution,
    /// Used to scale trigger thresholds on sources without a stored range.
    pub fallback_trigger_range: VoltageRange,
    /// Upper bound on waiting for a block to complete. `None` waits forever.
    pub ready_timeout: Option<Duration>,
    pub poll_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            resolution: Resolution::Bits12,
            fallback_trigger_range: VoltageRange::V2,
            ready_timeout: Some(Duration::from_secs(60)),
            poll_interval: Duration::from_micros(500),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Connected {
    pub(crate) info: DeviceInfo,
    pub(crate) channels: BTreeMap<Channel, AppliedChannel>,
    pub(crate) trigger: Option<TriggerConfig>,
}

/// One oscilloscope connection and the state negotiated on it.
#[derive(Debug)]
pub struct Session<D: Driver> {
    pub(crate) driver: D,
    pub(crate) settings: SessionSettings,
    pub(crate) connected: Option<Connected>,
}

impl<D: Driver> Session<D> {
    pub fn new(driver: D, settings: SessionSettings) -> Self {
        Self {
            driver,
            settings,
            connected: None,
        }
    }

    /// Opens the unit with the given batch/serial string, or the first one found.
    pub fn connect(&mut self, serial: Option<&str>) -> Result<&DeviceInfo, SessionError> {
        if let Some(connected) = &self.connected {
            return Err(SessionError::AlreadyConnected {
                serial: connected.info.serial.clone(),
            });
        }

        log::debug!("Opening {} unit {}", self.driver.family(), serial.unwrap_or("<first available>"));
        let (handle, status) = self.driver.open_unit(serial, self.settings.resolution);
        if status.needs_power_source_change() {
            log::info!("Unit reported {status}, confirming power source");
            if let Err(status) = self.driver.change_power_source(handle, status) {
                self.release(handle);
                return Err(SessionError::Connection {
                    operation: "change_power_source",
                    status,
                });
            }
        } else if !status.is_ok() {
            return Err(SessionError::Connection {
                operation: "open_unit",
                status,
            });
        }

        match self.identify(handle) {
            Ok(info) => {
                log::info!(
                    "Connected to {} {} ({} channels, max ADC {})",
                    info.model,
                    info.variant,
                    info.num_channels,
                    info.max_adc_value
                );
                let connected = self.connected.insert(Connected {
                    info,
                    channels: BTreeMap::new(),
                    trigger: None,
                });
                Ok(&connected.info)
            }
            Err(e) => {
                self.release(handle);
                Err(e)
            }
        }
    }

    fn identify(&mut self, handle: Handle) -> Result<DeviceInfo, SessionError> {
        let variant = self
            .driver
            .unit_info(handle, UnitInfo::VariantInfo)
            .map_err(connection("unit_info"))?;
        let batch_and_serial = self
            .driver
            .unit_info(handle, UnitInfo::BatchAndSerial)
            .map_err(connection("unit_info"))?;
        let max_adc_value = i32::from(self.driver.maximum_value(handle).map_err(connection("maximum_value"))?);
        let min_adc_value = i32::from(self.driver.minimum_value(handle).map_err(connection("minimum_value"))?);
        if max_adc_value <= 0 {
            return Err(SessionError::Connection {
                operation: "maximum_value",
                status: PicoStatus::INVALID_PARAMETER,
            });
        }

        Ok(DeviceInfo {
            handle,
            model: self.driver.family().to_string(),
            serial: batch_and_serial.clone(),
            num_channels: channels_from_variant(&variant),
            variant,
            batch_and_serial,
            max_adc_value,
            min_adc_value,
        })
    }

    /// Best effort close of a handle that never became a session.
    fn release(&mut self, handle: Handle) {
        if let Err(status) = self.driver.close_unit(handle) {
            log::warn!("Closing unit after failed connect returned {status}");
        }
    }

    /// Stops acquisition, closes the unit and forgets all configuration.
    /// Does nothing when no unit is open.
    pub fn disconnect(&mut self) {
        let Some(connected) = self.connected.take() else {
            return;
        };
        let handle = connected.info.handle;
        if let Err(status) = self.driver.stop(handle) {
            log::warn!("Stopping unit before close returned {status}");
        }
        if let Err(status) = self.driver.close_unit(handle) {
            log::warn!("Closing unit returned {status}");
        }
        log::info!("Disconnected from {}", connected.info.serial);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.is_some()
    }

    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.connected.as_ref().map(|c| &c.info)
    }

    pub fn channel(&self, channel: Channel) -> Option<&AppliedChannel> {
        self.connected.as_ref()?.channels.get(&channel)
    }

    pub fn channels(&self) -> impl Iterator<Item = &AppliedChannel> {
        self.connected.iter().flat_map(|c| c.channels.values())
    }

    pub fn trigger(&self) -> Option<&TriggerConfig> {
        self.connected.as_ref()?.trigger.as_ref()
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Applies `config` to the hardware and stores it, replacing any earlier
    /// configuration of that channel. A rejected call leaves the stored entry
    /// as it was.
    pub fn configure_channel(&mut self, config: ChannelConfig) -> Result<AppliedChannel, SessionError> {
        let connected = self.connected.as_mut().ok_or(SessionError::NotConnected)?;
        if config.channel.index() >= connected.info.num_channels {
            return Err(SessionError::UnknownChannel(config.channel.to_string()));
        }
        if !config.voltage_range.is_finite() || config.voltage_range <= 0.0 {
            return Err(SessionError::InvalidArgument(format!(
                "voltage range must be a positive number of volts, got {}",
                config.voltage_range
            )));
        }
        if !config.analog_offset.is_finite() {
            return Err(SessionError::InvalidArgument("analog offset must be finite".to_string()));
        }

        let range = VoltageRange::nearest(config.voltage_range);
        let analog_offset_adc =
            units::millivolts_to_adc(config.analog_offset * 1000.0, range.volts(), connected.info.max_adc_value)?;
        log::debug!(
            "Channel {}: requested {} V, using {range}, offset {analog_offset_adc} counts",
            config.channel,
            config.voltage_range
        );

        self.driver
            .set_channel(
                connected.info.handle,
                config.channel,
                config.enabled,
                config.coupling,
                range,
                analog_offset_adc,
            )
            .map_err(rejected("set_channel"))?;

        let applied = AppliedChannel {
            config,
            range,
            analog_offset_adc,
        };
        connected.channels.insert(config.channel, applied);
        Ok(applied)
    }

    /// Arms a single-edge trigger. The threshold is scaled with the source
    /// channel's stored range, or the fallback range when the source has none.
    pub fn set_trigger(&mut self, config: TriggerConfig) -> Result<SimpleTrigger, SessionError> {
        let connected = self.connected.as_mut().ok_or(SessionError::NotConnected)?;
        let stored_range = match config.source {
            TriggerSource::Channel(channel) if channel.index() >= connected.info.num_channels => {
                return Err(SessionError::UnknownSource(config.source.to_string()));
            }
            TriggerSource::Channel(channel) => connected.channels.get(&channel).map(|c| c.range),
            TriggerSource::External => None,
        };
        let range = stored_range.unwrap_or_else(|| {
            log::debug!(
                "Trigger source {} has no stored range, scaling threshold with {}",
                config.source,
                self.settings.fallback_trigger_range
            );
            self.settings.fallback_trigger_range
        });

        let trigger = config.to_simple_trigger(range, connected.info.max_adc_value, connected.info.min_adc_value)?;
        self.driver
            .set_simple_trigger(
                connected.info.handle,
                true,
                trigger.source,
                trigger.threshold_adc,
                trigger.direction,
                trigger.delay_samples,
                trigger.auto_trigger_ms,
            )
            .map_err(rejected("set_simple_trigger"))?;

        connected.trigger = Some(config);
        Ok(trigger)
    }
}

impl<D: Driver> Drop for Session<D> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Input count encoded in the variant name, e.g. `5444D` has four.
fn channels_from_variant(variant: &str) -> usize {
    variant
        .chars()
        .nth(1)
        .and_then(|c| c.to_digit(10))
        .filter(|n| (1..=4).contains(n))
        .map_or(Channel::ALL.len(), |n| n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::sim::{DriverCall, DriverOp, SimulatedDriver, SimulatorConfig};
    use crate::driver::ThresholdDirection;

    fn session(config: SimulatorConfig) -> Session<SimulatedDriver> {
        Session::new(SimulatedDriver::new(config), SessionSettings::default())
    }

    fn connected() -> Session<SimulatedDriver> {
        let mut session = session(SimulatorConfig::default());
        session.connect(None).unwrap();
        session
    }

    #[test]
    fn test_connect_populates_device_info() {
        let mut session = session(SimulatorConfig::default());
        let info = session.connect(None).unwrap().clone();
        assert_eq!(info.model, "PS5000A");
        assert_eq!(info.variant, "5444D");
        assert_eq!(info.serial, "SIM01/0001");
        assert_eq!(info.batch_and_serial, "SIM01/0001");
        assert_eq!(info.max_adc_value, 32767);
        assert_eq!(info.min_adc_value, -32767);
        assert_eq!(info.num_channels, 4);
        assert!(session.is_connected());
    }

    #[test]
    fn test_second_connect_fails_without_touching_session() {
        let mut session = connected();
        let before = session.device_info().cloned();
        assert!(matches!(
            session.connect(None),
            Err(SessionError::AlreadyConnected { .. })
        ));
        assert_eq!(session.device_info().cloned(), before);
    }

    #[test]
    fn test_power_source_renegotiation() {
        let mut session = session(SimulatorConfig {
            open_status: PicoStatus::USB3_0_DEVICE_NON_USB3_0_PORT,
            ..SimulatorConfig::default()
        });
        session.connect(None).unwrap();
        assert!(session
            .driver()
            .calls()
            .contains(&DriverCall::ChangePowerSource(PicoStatus::USB3_0_DEVICE_NON_USB3_0_PORT)));
    }

    #[test]
    fn test_failed_power_source_change_releases_handle() {
        let mut session = session(SimulatorConfig {
            open_status: PicoStatus::POWER_SUPPLY_NOT_CONNECTED,
            ..SimulatorConfig::default().fail(DriverOp::ChangePowerSource, PicoStatus::NOT_RESPONDING)
        });
        let err = session.connect(None).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Connection {
                operation: "change_power_source",
                ..
            }
        ));
        assert!(!session.is_connected());
        assert!(!session.driver().is_open());
    }

    #[test]
    fn test_open_failure_leaves_session_disconnected() {
        let mut session = session(SimulatorConfig {
            open_status: PicoStatus::NOT_FOUND,
            ..SimulatorConfig::default()
        });
        let err = session.connect(None).unwrap_err();
        assert_eq!(err.kind(), "connection_error");
        assert!(session.device_info().is_none());
    }

    #[test]
    fn test_info_failure_closes_unit() {
        let mut session = session(SimulatorConfig::default().fail(DriverOp::UnitInfo, PicoStatus::NOT_RESPONDING));
        assert!(session.connect(None).is_err());
        assert!(!session.driver().is_open());
        assert_eq!(session.driver().calls().last(), Some(&DriverCall::CloseUnit));
    }

    #[test]
    fn test_connect_by_serial() {
        let mut session = session(SimulatorConfig::default());
        assert!(session.connect(Some("OTHER/0002")).is_err());
        assert!(session.connect(Some("SIM01/0001")).is_ok());
    }

    #[test]
    fn test_disconnect_never_connected_is_noop() {
        let mut session = session(SimulatorConfig::default());
        session.disconnect();
        session.disconnect();
        assert!(session.driver().calls().is_empty());
    }

    #[test]
    fn test_disconnect_stops_closes_and_clears() {
        let mut session = connected();
        session.configure_channel(ChannelConfig::new(Channel::A)).unwrap();
        session.driver_mut().clear_calls();
        session.disconnect();
        assert_eq!(session.driver().calls(), &[DriverCall::Stop, DriverCall::CloseUnit]);
        assert!(!session.is_connected());
        assert!(session.channel(Channel::A).is_none());
        assert!(session.trigger().is_none());
        // reconnect goes through the full open sequence
        session.connect(None).unwrap();
        assert!(session.channel(Channel::A).is_none());
    }

    #[test]
    fn test_configure_requires_connection() {
        let mut session = session(SimulatorConfig::default());
        let err = session.configure_channel(ChannelConfig::new(Channel::A)).unwrap_err();
        assert!(matches!(err, SessionError::NotConnected));
    }

    #[test]
    fn test_configure_snaps_range_and_converts_offset() {
        let mut session = connected();
        let applied = session
            .configure_channel(
                ChannelConfig::new(Channel::B)
                    .coupling(Coupling::Ac)
                    .voltage_range(0.9)
                    .analog_offset(0.25),
            )
            .unwrap();
        assert_eq!(applied.range, VoltageRange::V1);
        assert_eq!(applied.analog_offset_adc, 8191);
        assert_eq!(
            session.driver().calls().last(),
            Some(&DriverCall::SetChannel {
                channel: Channel::B,
                enabled: true,
                coupling: Coupling::Ac,
                range: VoltageRange::V1,
                analog_offset_adc: 8191,
            })
        );
        assert_eq!(session.channel(Channel::B), Some(&applied));
    }

    #[test]
    fn test_configure_latest_call_wins() {
        let mut session = connected();
        session
            .configure_channel(ChannelConfig::new(Channel::A).voltage_range(1.0))
            .unwrap();
        session
            .configure_channel(ChannelConfig::new(Channel::A).voltage_range(10.0).enabled(false))
            .unwrap();
        let stored = session.channel(Channel::A).unwrap();
        assert_eq!(stored.range, VoltageRange::V10);
        assert!(!stored.config.enabled);
        assert_eq!(session.channels().count(), 1);
    }

    #[test]
    fn test_configure_rejects_channel_beyond_variant() {
        let mut session = session(SimulatorConfig {
            variant: "5242D".to_string(),
            ..SimulatorConfig::default()
        });
        session.connect(None).unwrap();
        let err = session.configure_channel(ChannelConfig::new(Channel::C)).unwrap_err();
        assert!(matches!(err, SessionError::UnknownChannel(ref c) if c == "C"));
    }

    #[test]
    fn test_configure_rejects_bad_range() {
        let mut session = connected();
        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let err = session
                .configure_channel(ChannelConfig::new(Channel::A).voltage_range(bad))
                .unwrap_err();
            assert_eq!(err.kind(), "invalid_argument");
        }
    }

    #[test]
    fn test_hardware_rejection_keeps_previous_config() {
        let mut session = connected();
        session
            .configure_channel(ChannelConfig::new(Channel::A).voltage_range(2.0))
            .unwrap();
        session
            .driver_mut()
            .config_mut()
            .failures
            .insert(DriverOp::SetChannel, PicoStatus::INVALID_VOLTAGE_RANGE);
        let err = session
            .configure_channel(ChannelConfig::new(Channel::A).voltage_range(20.0))
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::HardwareRejected {
                operation: "set_channel",
                status: PicoStatus::INVALID_VOLTAGE_RANGE
            }
        ));
        assert_eq!(session.channel(Channel::A).unwrap().range, VoltageRange::V2);
        assert!(session.is_connected());
    }

    #[test]
    fn test_trigger_uses_source_channel_range() {
        let mut session = connected();
        session
            .configure_channel(ChannelConfig::new(Channel::B).voltage_range(1.0))
            .unwrap();
        let trigger = session
            .set_trigger(TriggerConfig::start_capturing_when(TriggerSource::Channel(Channel::B)).rising_edge(500.0))
            .unwrap();
        assert_eq!(trigger.threshold_adc, 16383);
        assert_eq!(
            session.driver().calls().last(),
            Some(&DriverCall::SetSimpleTrigger {
                source: TriggerSource::Channel(Channel::B),
                threshold_adc: 16383,
                direction: ThresholdDirection::Rising,
                delay_samples: 0,
                auto_trigger_ms: 1000,
            })
        );
    }

    #[test]
    fn test_trigger_falls_back_without_stored_range() {
        let mut session = connected();
        let on_channel = session
            .set_trigger(TriggerConfig::start_capturing_when(TriggerSource::Channel(Channel::C)).rising_edge(500.0))
            .unwrap();
        let external = session
            .set_trigger(TriggerConfig::start_capturing_when(TriggerSource::External).falling_edge(500.0))
            .unwrap();
        assert_eq!(on_channel.threshold_adc, 8191);
        assert_eq!(external.threshold_adc, 8191);
        assert_eq!(session.trigger().map(|t| t.source), Some(TriggerSource::External));
    }

    #[test]
    fn test_trigger_rejects_source_beyond_variant() {
        let mut session = session(SimulatorConfig {
            variant: "5242D".to_string(),
            ..SimulatorConfig::default()
        });
        session.connect(None).unwrap();
        let err = session
            .set_trigger(TriggerConfig::start_capturing_when(TriggerSource::Channel(Channel::D)).rising_edge(0.0))
            .unwrap_err();
        assert_eq!(err.kind(), "unknown_source");
    }

    #[test]
    fn test_trigger_requires_connection_and_valid_threshold() {
        let mut session = session(SimulatorConfig::default());
        let trigger = TriggerConfig::start_capturing_when(TriggerSource::External).rising_edge(0.0);
        assert!(matches!(session.set_trigger(trigger), Err(SessionError::NotConnected)));

        session.connect(None).unwrap();
        let too_high = TriggerConfig::start_capturing_when(TriggerSource::External).rising_edge(5000.0);
        let err = session.set_trigger(too_high).unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
        assert!(session.trigger().is_none());
    }

    #[test]
    fn test_channels_from_variant() {
        assert_eq!(channels_from_variant("5444D"), 4);
        assert_eq!(channels_from_variant("5242B"), 2);
        assert_eq!(channels_from_variant(""), 4);
        assert_eq!(channels_from_variant("5X4"), 4);
    }
}
