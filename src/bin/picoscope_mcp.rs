// PicoScope 5000A MCP server
//
// Speaks newline-delimited JSON-RPC on stdin/stdout. Logs go to stderr so
// they never mix with protocol output.

use std::io::{self, BufReader};
use std::path::PathBuf;

use clap::Parser;
use picoscope_tools::config::ServerConfig;
use picoscope_tools::driver::sim::SimulatedDriver;
use picoscope_tools::driver::Driver;
use picoscope_tools::mcp::{self, McpServer};
use picoscope_tools::session::Session;
use picoscope_tools::tools::ToolServer;

#[derive(Parser)]
#[command(name = "picoscope-mcp")]
#[command(version)]
#[command(about = "Expose PicoScope 5000A block capture as MCP tools")]
#[command(long_about = "Runs a Model Context Protocol server on stdin/stdout. Clients connect to the oscilloscope, configure channels and triggers, capture blocks and measure the result through tool calls.")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, help = "Path to a TOML configuration file")]
    config: Option<PathBuf>,

    /// Use the built-in simulator instead of libps5000a
    #[arg(long, help = "Serve a simulated PS5000A instead of real hardware")]
    simulate: bool,

    /// Serial to open when connect_device gives none
    #[arg(short, long, help = "Batch/serial string of the unit to open by default")]
    serial: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, help = "Show debug information and detailed logs")]
    verbose: bool,
}

fn serve<D: Driver>(driver: D, config: &ServerConfig, serial: Option<String>) -> io::Result<()> {
    let session = Session::new(driver, config.session_settings());
    let server = McpServer::new(ToolServer::new(session).with_default_serial(serial));
    let lines = mcp::spawn_reader(BufReader::new(io::stdin()), server.cancel_handle());
    let mut stdout = io::stdout().lock();
    server.serve(&lines, &mut stdout)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .target(env_logger::Target::Stderr)
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .target(env_logger::Target::Stderr)
            .init();
    }

    let config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    let serial = args.serial.or_else(|| config.device.serial.clone());
    let simulate = args.simulate || config.device.simulate;

    #[cfg(feature = "picosdk")]
    if !simulate {
        log::info!("Serving libps5000a hardware");
        serve(picoscope_tools::driver::ps5000a::Ps5000aSdk::new(), &config, serial)?;
        return Ok(());
    }

    if !simulate {
        log::warn!("Built without the picosdk feature, serving the simulator");
    }
    log::info!("Serving simulated PS5000A");
    serve(SimulatedDriver::default(), &config, serial)?;
    Ok(())
}
