//! # picoscope-tools
//!
//! Block acquisition on PicoScope 5000A oscilloscopes, exposed as named tools
//! over the Model Context Protocol.
//!
//! The library is a thin sequencing layer over the vendor driver: it opens
//! the unit, configures channels and a simple edge trigger, negotiates a
//! timebase, runs one block and converts the raw ADC counts to millivolts.
//!
//! ## Features
//!
//! - **Driver seam**: every vendor call goes through the [`Driver`] trait
//! - **Simulator**: [`SimulatedDriver`] behaves like a PS5000A for tests and `--simulate` runs
//! - **Hardware**: the `picosdk` feature links `libps5000a`
//! - **Trigger builder**: thresholds in millivolts, scaled with the source channel's range
//! - **Bounded capture**: readiness polling with timeout and cancellation
//! - **DataFrame output**: captured channels convert to `polars` frames for statistics
//! - **MCP host**: JSON-RPC 2.0 over stdio in [`mcp`]
//!
//! ## Examples
//!
//! ### Capturing a block
//!
//! ```rust
//! use picoscope_tools::{CancelToken, Channel, ChannelConfig, Session, SessionSettings, SimulatedDriver};
//!
//! let mut session = Session::new(SimulatedDriver::default(), SessionSettings::default());
//! session.connect(None)?;
//! session.configure_channel(ChannelConfig::new(Channel::A).voltage_range(1.0))?;
//!
//! let capture = session.capture_block(500, 500, &CancelToken::new())?;
//! let a = &capture.channels[&Channel::A];
//! println!("{} samples every {} ns", a.num_samples, a.sample_interval_ns);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Trigger
//!
//! ```rust
//! use picoscope_tools::{Channel, TriggerConfig, TriggerSource, VoltageRange};
//!
//! let trigger = TriggerConfig::start_capturing_when(TriggerSource::Channel(Channel::B))
//!     .auto_trigger_after(250)
//!     .falling_edge(-120.0);
//!
//! let fields = trigger.to_simple_trigger(VoltageRange::V1, 32767, -32767)?;
//! assert_eq!(fields.auto_trigger_ms, 250);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Tool calls
//!
//! ```rust
//! use picoscope_tools::{Session, SessionSettings, SimulatedDriver, ToolServer};
//! use serde_json::json;
//!
//! let tools = ToolServer::new(Session::new(SimulatedDriver::default(), SessionSettings::default()));
//! let response = tools.call("connect_device", &json!({}));
//! assert_eq!(response["status"], "success");
//! ```

pub mod analysis;
pub mod capture;
pub mod config;
pub mod driver;
pub mod mcp;
pub mod session;
pub mod tools;
pub mod trigger_config;
pub mod units;

// Re-export the main types for convenience
pub use capture::{BlockCapture, CancelToken, CaptureData};

pub use driver::sim::{SimulatedDriver, SimulatorConfig};
pub use driver::{Channel, Coupling, Driver, PicoStatus, Resolution, ThresholdDirection, TriggerSource};

pub use session::{AppliedChannel, ChannelConfig, DeviceInfo, Session, SessionError, SessionSettings};

pub use trigger_config::{SimpleTrigger, TriggerBuilder, TriggerConfig, TriggerConfigError};

pub use tools::{ToolError, ToolServer};

pub use units::{ConversionError, VoltageRange};
