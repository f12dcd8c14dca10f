//! Named tools over one oscilloscope session.
//!
//! Every tool takes a JSON object of arguments and answers with a JSON object
//! carrying a `status` of `success`, `warning`, `error` or `not_implemented`.
//! Calls are serialized on the session lock; the most recent block capture is
//! kept for the measurement tools.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::analysis::{self, AnalysisError};
use crate::capture::{BlockCapture, CancelToken, CaptureData};
use crate::driver::{Channel, Coupling, Driver, ThresholdDirection, TriggerSource};
use crate::session::{ChannelConfig, Session, SessionError};
use crate::trigger_config::TriggerConfig;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Unknown tool {0}")]
    UnknownTool(String),

    #[error("Invalid arguments for {tool}: {source}")]
    InvalidArguments { tool: String, source: serde_json::Error },

    #[error("Missing required argument {argument} for {tool}")]
    MissingArgument { tool: String, argument: String },

    #[error("No capture available, call capture_block first")]
    NoCapture,

    #[error("Channel {0} was not part of the last capture")]
    ChannelNotCaptured(Channel),

    #[error("Channel {0} not configured")]
    ChannelNotConfigured(Channel),

    #[error("Failed to encode response: {0}")]
    Encoding(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),
}

impl ToolError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownTool(_) => "unknown_tool",
            Self::InvalidArguments { .. } | Self::MissingArgument { .. } => "invalid_arguments",
            Self::NoCapture => "no_capture",
            Self::ChannelNotCaptured(_) => "channel_not_captured",
            Self::ChannelNotConfigured(_) => "channel_not_configured",
            Self::Encoding(_) => "encoding_error",
            Self::Session(e) => e.kind(),
            Self::Analysis(AnalysisError::Empty) => "invalid_argument",
            Self::Analysis(_) => "analysis_error",
        }
    }
}

/// Entry of the tool catalog as advertised to clients.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

fn schema(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

fn channel_property() -> Value {
    json!({ "type": "string", "enum": ["A", "B", "C", "D"] })
}

fn tool(name: &'static str, description: &'static str, input_schema: Value) -> ToolDescriptor {
    ToolDescriptor {
        name,
        description,
        input_schema,
    }
}

/// Tools that are advertised but answer `not_implemented`.
const STUB_TOOLS: [&str; 12] = [
    "start_streaming",
    "stop_streaming",
    "get_streaming_data",
    "measure_rise_time",
    "measure_pulse_width",
    "compute_fft",
    "measure_thd",
    "set_signal_generator",
    "stop_signal_generator",
    "configure_math_channel",
    "export_waveform",
    "configure_downsampling",
];

/// Every tool the server answers to, in advertised order.
pub fn catalog() -> Vec<ToolDescriptor> {
    vec![
        tool(
            "connect_device",
            "Connect to a PicoScope 5000A. An empty serial opens the first unit found.",
            schema(json!({ "serial": { "type": "string", "default": "" } }), &[]),
        ),
        tool("disconnect_device", "Disconnect from the current device.", schema(json!({}), &[])),
        tool(
            "get_device_info",
            "Report model, serial, variant, channel count and ADC limits of the connected device.",
            schema(json!({}), &[]),
        ),
        tool(
            "configure_channel",
            "Configure an input channel. The range snaps to the nearest of 0.02, 0.05, 0.1, 0.2, 0.5, 1, 2, 5, 10, 20 V.",
            schema(
                json!({
                    "channel": channel_property(),
                    "enabled": { "type": "boolean", "default": true },
                    "coupling": { "type": "string", "enum": ["AC", "DC"], "default": "DC" },
                    "voltage_range": { "type": "number", "default": 5.0 },
                    "analog_offset": { "type": "number", "default": 0.0 },
                }),
                &["channel"],
            ),
        ),
        tool(
            "get_channel_config",
            "Report the stored configuration of a channel.",
            schema(json!({ "channel": channel_property() }), &["channel"]),
        ),
        tool(
            "set_timebase",
            "Informational: the timebase is negotiated at capture time from the sample count.",
            schema(
                json!({
                    "sample_interval_ns": { "type": "integer", "minimum": 0 },
                    "num_samples": { "type": "integer", "minimum": 0 },
                }),
                &["sample_interval_ns", "num_samples"],
            ),
        ),
        tool(
            "set_simple_trigger",
            "Arm a single-edge trigger. auto_trigger_ms = 0 waits indefinitely.",
            schema(
                json!({
                    "source": { "type": "string", "enum": ["A", "B", "C", "D", "External"] },
                    "threshold_mv": { "type": "number" },
                    "direction": {
                        "type": "string",
                        "enum": ["Rising", "Falling", "Rising_Or_Falling"],
                        "default": "Rising",
                    },
                    "auto_trigger_ms": { "type": "integer", "minimum": 0, "maximum": 32767, "default": 1000 },
                }),
                &["source", "threshold_mv"],
            ),
        ),
        tool(
            "capture_block",
            "Capture one block on all enabled channels and return time (s) and voltage (mV) series.",
            schema(
                json!({
                    "pre_trigger_samples": { "type": "integer", "minimum": 0, "default": 1000 },
                    "post_trigger_samples": { "type": "integer", "minimum": 0, "default": 1000 },
                }),
                &[],
            ),
        ),
        tool(
            "measure_frequency",
            "Zero-crossing frequency estimate from the last capture.",
            schema(json!({ "channel": channel_property() }), &["channel"]),
        ),
        tool(
            "measure_amplitude",
            "Amplitude measurement in mV from the last capture.",
            schema(
                json!({
                    "channel": channel_property(),
                    "measurement_type": {
                        "type": "string",
                        "enum": ["peak_to_peak", "rms", "mean", "max", "min"],
                        "default": "peak_to_peak",
                    },
                }),
                &["channel"],
            ),
        ),
        tool(
            "get_statistics",
            "Min, max, mean, standard deviation, RMS and peak-to-peak of the last capture.",
            schema(
                json!({
                    "channel": channel_property(),
                    "num_samples": { "type": "integer", "minimum": 1 },
                }),
                &["channel"],
            ),
        ),
        tool(
            "start_streaming",
            "Start streaming acquisition.",
            schema(
                json!({
                    "sample_interval_ns": { "type": "integer", "minimum": 0 },
                    "buffer_size": { "type": "integer", "default": 100_000 },
                    "auto_stop": { "type": "boolean", "default": false },
                    "max_samples": { "type": "integer", "default": 0 },
                }),
                &["sample_interval_ns"],
            ),
        ),
        tool("stop_streaming", "Stop streaming acquisition.", schema(json!({}), &[])),
        tool(
            "get_streaming_data",
            "Latest streaming samples.",
            schema(json!({ "max_samples": { "type": "integer", "default": 1000 } }), &[]),
        ),
        tool(
            "measure_rise_time",
            "Rise time between two thresholds.",
            schema(
                json!({
                    "channel": channel_property(),
                    "low_threshold_percent": { "type": "number", "default": 10.0 },
                    "high_threshold_percent": { "type": "number", "default": 90.0 },
                }),
                &["channel"],
            ),
        ),
        tool(
            "measure_pulse_width",
            "Pulse width at a threshold.",
            schema(
                json!({
                    "channel": channel_property(),
                    "threshold_percent": { "type": "number", "default": 50.0 },
                }),
                &["channel"],
            ),
        ),
        tool(
            "compute_fft",
            "Magnitude spectrum of a channel.",
            schema(
                json!({
                    "channel": channel_property(),
                    "window": {
                        "type": "string",
                        "enum": ["hann", "hamming", "blackman", "rectangular"],
                        "default": "hann",
                    },
                }),
                &["channel"],
            ),
        ),
        tool(
            "measure_thd",
            "Total harmonic distortion.",
            schema(json!({ "channel": channel_property() }), &["channel"]),
        ),
        tool(
            "set_signal_generator",
            "Configure the built-in signal generator.",
            schema(
                json!({
                    "waveform_type": {
                        "type": "string",
                        "enum": ["sine", "square", "triangle", "dc", "ramp"],
                        "default": "sine",
                    },
                    "frequency_hz": { "type": "number", "default": 1000.0 },
                    "amplitude_mv": { "type": "number", "default": 1000.0 },
                    "offset_mv": { "type": "number", "default": 0.0 },
                }),
                &[],
            ),
        ),
        tool("stop_signal_generator", "Stop the signal generator output.", schema(json!({}), &[])),
        tool(
            "configure_math_channel",
            "Combine two channels.",
            schema(
                json!({
                    "operation": { "type": "string", "enum": ["add", "subtract", "multiply"], "default": "add" },
                    "channel_a": { "type": "string", "enum": ["A", "B", "C", "D"], "default": "A" },
                    "channel_b": { "type": "string", "enum": ["A", "B", "C", "D"], "default": "B" },
                }),
                &[],
            ),
        ),
        tool(
            "export_waveform",
            "Write captured waveforms to a file.",
            schema(
                json!({
                    "format": { "type": "string", "enum": ["csv", "json", "numpy"], "default": "csv" },
                    "channels": { "type": "array", "items": { "type": "string" }, "default": ["A"] },
                    "filename": { "type": "string", "default": "waveform" },
                }),
                &[],
            ),
        ),
        tool(
            "configure_downsampling",
            "Downsampling applied on readout.",
            schema(
                json!({
                    "mode": {
                        "type": "string",
                        "enum": ["none", "aggregate", "decimate", "average"],
                        "default": "none",
                    },
                    "ratio": { "type": "integer", "default": 1 },
                }),
                &[],
            ),
        ),
    ]
}

#[derive(Debug, Deserialize)]
struct ConnectArgs {
    #[serde(default)]
    serial: String,
}

#[derive(Debug, Deserialize)]
struct ChannelArgs {
    channel: String,
}

fn channel_id(id: &str) -> Result<Channel, ToolError> {
    id.parse()
        .map_err(|_| SessionError::UnknownChannel(id.to_string()).into())
}

fn source_id(id: &str) -> Result<TriggerSource, ToolError> {
    id.parse()
        .map_err(|_| SessionError::UnknownSource(id.to_string()).into())
}

const fn default_true() -> bool {
    true
}

const fn default_voltage_range() -> f64 {
    5.0
}

#[derive(Debug, Deserialize)]
struct ConfigureChannelArgs {
    channel: String,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    coupling: Coupling,
    #[serde(default = "default_voltage_range")]
    voltage_range: f64,
    #[serde(default)]
    analog_offset: f64,
}

#[derive(Debug, Deserialize)]
struct TimebaseArgs {
    sample_interval_ns: u64,
    num_samples: u64,
}

const fn default_auto_trigger_ms() -> u32 {
    TriggerConfig::DEFAULT_AUTO_TRIGGER_MS
}

#[derive(Debug, Deserialize)]
struct TriggerArgs {
    source: String,
    threshold_mv: f64,
    #[serde(default)]
    direction: ThresholdDirection,
    #[serde(default = "default_auto_trigger_ms")]
    auto_trigger_ms: u32,
}

const fn default_block_half() -> u32 {
    1000
}

#[derive(Debug, Deserialize)]
struct CaptureArgs {
    #[serde(default = "default_block_half")]
    pre_trigger_samples: u32,
    #[serde(default = "default_block_half")]
    post_trigger_samples: u32,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
enum AmplitudeMeasurement {
    #[default]
    PeakToPeak,
    Rms,
    Mean,
    Max,
    Min,
}

#[derive(Debug, Deserialize)]
struct AmplitudeArgs {
    channel: String,
    #[serde(default)]
    measurement_type: AmplitudeMeasurement,
}

#[derive(Debug, Deserialize)]
struct StatisticsArgs {
    channel: String,
    num_samples: Option<usize>,
}

fn parse<T: DeserializeOwned>(tool: &str, arguments: &Value) -> Result<T, ToolError> {
    let arguments = if arguments.is_null() {
        Value::Object(Map::new())
    } else {
        arguments.clone()
    };
    serde_json::from_value(arguments).map_err(|source| ToolError::InvalidArguments {
        tool: tool.to_string(),
        source,
    })
}

fn encode<T: Serialize>(value: &T) -> Result<Value, ToolError> {
    serde_json::to_value(value).map_err(|e| ToolError::Encoding(e.to_string()))
}

fn with_status(status: &str, body: Value) -> Value {
    let mut object = match body {
        Value::Object(object) => object,
        Value::Null => Map::new(),
        other => {
            let mut object = Map::new();
            object.insert("result".to_string(), other);
            object
        }
    };
    object.insert("status".to_string(), Value::String(status.to_string()));
    Value::Object(object)
}

fn error_response(error: &ToolError) -> Value {
    json!({
        "status": "error",
        "error": error.to_string(),
        "kind": error.kind(),
    })
}

#[derive(Debug)]
struct ToolState<D: Driver> {
    session: Session<D>,
    last_capture: Option<BlockCapture>,
}

impl<D: Driver> ToolState<D> {
    fn captured(&self, channel: Channel) -> Result<&CaptureData, ToolError> {
        self.last_capture
            .as_ref()
            .ok_or(ToolError::NoCapture)?
            .channels
            .get(&channel)
            .ok_or(ToolError::ChannelNotCaptured(channel))
    }
}

/// Dispatches tool calls onto a [`Session`].
#[derive(Debug)]
pub struct ToolServer<D: Driver> {
    state: Mutex<ToolState<D>>,
    cancel: CancelToken,
    default_serial: Option<String>,
}

impl<D: Driver> ToolServer<D> {
    pub fn new(session: Session<D>) -> Self {
        Self {
            state: Mutex::new(ToolState {
                session,
                last_capture: None,
            }),
            cancel: CancelToken::new(),
            default_serial: None,
        }
    }

    /// Serial opened when `connect_device` is called without one.
    pub fn with_default_serial(mut self, serial: Option<String>) -> Self {
        self.default_serial = serial.filter(|s| !s.is_empty());
        self
    }

    /// Token that aborts the next or running capture. Tripping it before
    /// `capture_block` starts still cancels that capture.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_known(name: &str) -> bool {
        catalog().iter().any(|tool| tool.name == name)
    }

    /// Runs `name` and folds any failure into an error response.
    pub fn call(&self, name: &str, arguments: &Value) -> Value {
        log::debug!("Tool call {name} {arguments}");
        match self.dispatch(name, arguments) {
            Ok(response) => response,
            Err(e) => {
                log::warn!("Tool {name} failed: {e}");
                error_response(&e)
            }
        }
    }

    /// Disconnects the device, if any.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.last_capture = None;
        state.session.disconnect();
    }

    fn dispatch(&self, name: &str, arguments: &Value) -> Result<Value, ToolError> {
        match name {
            "connect_device" => self.connect_device(parse(name, arguments)?),
            "disconnect_device" => Ok(self.disconnect_device()),
            "get_device_info" => self.get_device_info(),
            "configure_channel" => self.configure_channel(parse(name, arguments)?),
            "get_channel_config" => self.get_channel_config(parse(name, arguments)?),
            "set_timebase" => self.set_timebase(parse(name, arguments)?),
            "set_simple_trigger" => self.set_simple_trigger(parse(name, arguments)?),
            "capture_block" => self.capture_block(parse(name, arguments)?),
            "measure_frequency" => self.measure_frequency(parse(name, arguments)?),
            "measure_amplitude" => self.measure_amplitude(parse(name, arguments)?),
            "get_statistics" => self.get_statistics(parse(name, arguments)?),
            stub if STUB_TOOLS.contains(&stub) => not_implemented(stub, arguments),
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }

    fn connect_device(&self, args: ConnectArgs) -> Result<Value, ToolError> {
        let serial = Some(args.serial.as_str())
            .filter(|s| !s.is_empty())
            .or(self.default_serial.as_deref());
        let mut state = self.state.lock();
        let info = state.session.connect(serial)?.clone();
        state.last_capture = None;
        Ok(with_status(
            "success",
            json!({
                "connected": true,
                "device": {
                    "model": info.model,
                    "serial": info.serial,
                    "variant": info.variant,
                    "num_channels": info.num_channels,
                    "max_adc_value": info.max_adc_value,
                },
            }),
        ))
    }

    fn disconnect_device(&self) -> Value {
        let mut state = self.state.lock();
        state.last_capture = None;
        if !state.session.is_connected() {
            return with_status(
                "warning",
                json!({ "message": "No device was connected", "connected": false }),
            );
        }
        state.session.disconnect();
        with_status(
            "success",
            json!({ "message": "Device disconnected successfully", "connected": false }),
        )
    }

    fn get_device_info(&self) -> Result<Value, ToolError> {
        let state = self.state.lock();
        let info = state.session.device_info().ok_or(SessionError::NotConnected)?;
        Ok(with_status(
            "success",
            json!({ "connected": true, "device": encode(info)? }),
        ))
    }

    fn configure_channel(&self, args: ConfigureChannelArgs) -> Result<Value, ToolError> {
        let channel = channel_id(&args.channel)?;
        let config = ChannelConfig::new(channel)
            .enabled(args.enabled)
            .coupling(args.coupling)
            .voltage_range(args.voltage_range)
            .analog_offset(args.analog_offset);
        let applied = self.state.lock().session.configure_channel(config)?;
        Ok(with_status(
            "success",
            json!({
                "channel": channel,
                "enabled": args.enabled,
                "coupling": args.coupling,
                "voltage_range": args.voltage_range,
                "applied_range": applied.range.volts(),
                "analog_offset": args.analog_offset,
                "analog_offset_adc": applied.analog_offset_adc,
            }),
        ))
    }

    fn get_channel_config(&self, args: ChannelArgs) -> Result<Value, ToolError> {
        let channel = channel_id(&args.channel)?;
        let state = self.state.lock();
        if !state.session.is_connected() {
            return Err(SessionError::NotConnected.into());
        }
        let applied = state
            .session
            .channel(channel)
            .ok_or(ToolError::ChannelNotConfigured(channel))?;
        Ok(with_status(
            "success",
            json!({
                "channel": channel,
                "enabled": applied.config.enabled,
                "coupling": applied.config.coupling,
                "voltage_range": applied.config.voltage_range,
                "applied_range": applied.range.volts(),
                "analog_offset": applied.config.analog_offset,
            }),
        ))
    }

    fn set_timebase(&self, args: TimebaseArgs) -> Result<Value, ToolError> {
        if !self.state.lock().session.is_connected() {
            return Err(SessionError::NotConnected.into());
        }
        let sample_rate_hz = if args.sample_interval_ns > 0 {
            1e9 / args.sample_interval_ns as f64
        } else {
            0.0
        };
        Ok(with_status(
            "success",
            json!({
                "note": "Timebase will be set during capture based on device capabilities",
                "requested_interval_ns": args.sample_interval_ns,
                "requested_sample_rate_hz": sample_rate_hz,
                "num_samples": args.num_samples,
            }),
        ))
    }

    fn set_simple_trigger(&self, args: TriggerArgs) -> Result<Value, ToolError> {
        let source = source_id(&args.source)?;
        let trigger = TriggerConfig::start_capturing_when(source)
            .auto_trigger_after(args.auto_trigger_ms)
            .edge(args.threshold_mv, args.direction);
        let applied = self.state.lock().session.set_trigger(trigger)?;
        Ok(with_status(
            "success",
            json!({
                "source": source,
                "threshold_mv": args.threshold_mv,
                "threshold_adc": applied.threshold_adc,
                "direction": args.direction,
                "auto_trigger_ms": args.auto_trigger_ms,
            }),
        ))
    }

    fn capture_block(&self, args: CaptureArgs) -> Result<Value, ToolError> {
        let mut state = self.state.lock();
        let outcome = state
            .session
            .capture_block(args.pre_trigger_samples, args.post_trigger_samples, &self.cancel);
        // A cancellation is consumed by the capture it was aimed at.
        self.cancel.reset();
        let capture = outcome?;

        let mut channels = Map::new();
        for (channel, data) in &capture.channels {
            channels.insert(channel.to_string(), encode(data)?);
        }
        let response = with_status(
            "success",
            json!({
                "total_samples": capture.total_samples,
                "pre_trigger_samples": capture.pre_trigger_samples,
                "post_trigger_samples": capture.post_trigger_samples,
                "timebase": capture.timebase,
                "sample_interval_ns": capture.sample_interval_ns,
                "overflow": encode(&capture.overflow)?,
                "channels": channels,
            }),
        );
        state.last_capture = Some(capture);
        Ok(response)
    }

    fn measure_frequency(&self, args: ChannelArgs) -> Result<Value, ToolError> {
        let channel = channel_id(&args.channel)?;
        let state = self.state.lock();
        let data = state.captured(channel)?;
        let frequency_hz = analysis::zero_crossing_frequency(data)?;
        Ok(with_status(
            "success",
            json!({
                "channel": channel,
                "frequency_hz": frequency_hz,
                "num_samples": data.num_samples,
            }),
        ))
    }

    fn measure_amplitude(&self, args: AmplitudeArgs) -> Result<Value, ToolError> {
        let channel = channel_id(&args.channel)?;
        let state = self.state.lock();
        let stats = analysis::statistics(state.captured(channel)?)?;
        let value_mv = match args.measurement_type {
            AmplitudeMeasurement::PeakToPeak => stats.peak_to_peak,
            AmplitudeMeasurement::Rms => stats.rms,
            AmplitudeMeasurement::Mean => stats.mean,
            AmplitudeMeasurement::Max => stats.max,
            AmplitudeMeasurement::Min => stats.min,
        };
        Ok(with_status(
            "success",
            json!({
                "channel": channel,
                "measurement_type": args.measurement_type,
                "value_mv": value_mv,
            }),
        ))
    }

    fn get_statistics(&self, args: StatisticsArgs) -> Result<Value, ToolError> {
        let channel = channel_id(&args.channel)?;
        let state = self.state.lock();
        let data = state.captured(channel)?;
        let stats = match args.num_samples {
            Some(n) => analysis::statistics(&data.head(n))?,
            None => analysis::statistics(data)?,
        };
        Ok(with_status(
            "success",
            json!({ "channel": channel, "statistics": encode(&stats)? }),
        ))
    }
}

/// Echoes the arguments, with schema defaults filled in, under a
/// `not_implemented` status.
fn not_implemented(name: &str, arguments: &Value) -> Result<Value, ToolError> {
    let descriptor = catalog()
        .into_iter()
        .find(|tool| tool.name == name)
        .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
    let mut echoed = match arguments {
        Value::Object(object) => object.clone(),
        Value::Null => Map::new(),
        _ => {
            return Err(ToolError::InvalidArguments {
                tool: name.to_string(),
                source: serde::de::Error::custom("arguments must be an object"),
            })
        }
    };

    if let Some(required) = descriptor.input_schema["required"].as_array() {
        if let Some(missing) = required
            .iter()
            .filter_map(Value::as_str)
            .find(|argument| !echoed.contains_key(*argument))
        {
            return Err(ToolError::MissingArgument {
                tool: name.to_string(),
                argument: missing.to_string(),
            });
        }
    }
    if let Some(properties) = descriptor.input_schema["properties"].as_object() {
        for (argument, property) in properties {
            if let Some(default) = property.get("default") {
                echoed.entry(argument.clone()).or_insert_with(|| default.clone());
            }
        }
    }
    Ok(with_status("not_implemented", Value::Object(echoed)))
}
