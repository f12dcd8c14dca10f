use std::io::{self, Cursor};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use picoscope_tools::mcp::{self, McpServer, Response};
use picoscope_tools::{Session, SessionSettings, SimulatedDriver, SimulatorConfig, ToolServer};
use serde_json::{json, Value};

fn server(config: SimulatorConfig, settings: SessionSettings) -> McpServer<SimulatedDriver> {
    McpServer::new(ToolServer::new(Session::new(SimulatedDriver::new(config), settings)))
}

fn call(id: u32, name: &str, arguments: Value) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": { "name": name, "arguments": arguments },
    })
    .to_string()
}

fn tool_result(response: &Response) -> Value {
    let result = response.result.as_ref().expect("tools/call result");
    let text = result["content"][0]["text"].as_str().expect("text content");
    serde_json::from_str(text).expect("tool payload is JSON")
}

fn run(server: &McpServer<SimulatedDriver>, lines: &[String]) -> Vec<Response> {
    let input = lines.join("\n") + "\n";
    let rx = mcp::spawn_reader(Cursor::new(input), server.cancel_handle());
    let mut output = Vec::new();
    server.serve(&rx, &mut output).unwrap();
    String::from_utf8(output)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[test]
fn configure_trigger_capture_measure() {
    let server = server(
        SimulatorConfig {
            signal_frequency_hz: 5e6,
            ..SimulatorConfig::default()
        },
        SessionSettings {
            poll_interval: Duration::from_micros(10),
            ..SessionSettings::default()
        },
    );
    let lines = vec![
        json!({ "jsonrpc": "2.0", "id": 0, "method": "initialize", "params": {} }).to_string(),
        json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }).to_string(),
        call(1, "connect_device", json!({})),
        call(2, "configure_channel", json!({ "channel": "A", "voltage_range": 1.0 })),
        call(3, "configure_channel", json!({ "channel": "B", "voltage_range": 0.7, "coupling": "AC" })),
        call(4, "set_simple_trigger", json!({ "source": "A", "threshold_mv": 100.0 })),
        call(5, "capture_block", json!({ "pre_trigger_samples": 500, "post_trigger_samples": 1500 })),
        call(6, "measure_frequency", json!({ "channel": "A" })),
        call(7, "get_statistics", json!({ "channel": "B" })),
        call(8, "disconnect_device", json!({})),
    ];
    let responses = run(&server, &lines);
    assert_eq!(responses.len(), 9);
    assert!(responses.iter().all(|r| r.error.is_none()));

    let connected = tool_result(&responses[1]);
    assert_eq!(connected["device"]["variant"], "5444D");

    let b = tool_result(&responses[3]);
    assert_eq!(b["applied_range"], 0.5);

    let trigger = tool_result(&responses[4]);
    assert_eq!(trigger["threshold_adc"], 3276);

    let capture = tool_result(&responses[5]);
    assert_eq!(capture["status"], "success");
    assert_eq!(capture["total_samples"], 2000);
    let channels = capture["channels"].as_object().unwrap();
    assert_eq!(channels.keys().collect::<Vec<_>>(), vec!["A", "B"]);
    for data in channels.values() {
        let times = data["time_values"].as_array().unwrap();
        assert_eq!(times.len(), 2000);
        assert_eq!(data["voltage_values"].as_array().unwrap().len(), 2000);
        let first = times[0].as_f64().unwrap();
        let second = times[1].as_f64().unwrap();
        assert_eq!(first, 0.0);
        assert!(second > first);
    }

    let frequency = tool_result(&responses[6])["frequency_hz"].as_f64().unwrap();
    assert!((frequency - 5e6).abs() < 0.2e6, "{frequency}");

    let stats = tool_result(&responses[7]);
    assert_eq!(stats["statistics"]["num_samples"], 2000);

    assert_eq!(tool_result(&responses[8])["connected"], false);
}

#[test]
fn errors_surface_as_tool_errors() {
    let server = server(SimulatorConfig::default(), SessionSettings::default());
    let lines = vec![
        call(1, "capture_block", json!({})),
        call(2, "configure_channel", json!({ "channel": "Q" })),
        json!({ "jsonrpc": "2.0", "id": 3, "method": "prompts/list" }).to_string(),
    ];
    let responses = run(&server, &lines);
    assert_eq!(responses.len(), 3);

    assert_eq!(responses[0].result.as_ref().unwrap()["isError"], true);
    assert_eq!(tool_result(&responses[0])["kind"], "not_connected");
    assert_eq!(tool_result(&responses[1])["kind"], "unknown_channel");
    assert_eq!(responses[2].error.as_ref().map(|e| e.code), Some(mcp::METHOD_NOT_FOUND));
}

#[test]
fn cancellation_aborts_waiting_capture() {
    let server = server(
        SimulatorConfig {
            polls_until_ready: u32::MAX,
            ..SimulatorConfig::default()
        },
        SessionSettings {
            ready_timeout: None,
            poll_interval: Duration::from_micros(100),
            ..SessionSettings::default()
        },
    );

    let (tx, rx) = mpsc::channel::<io::Result<String>>();
    for line in [
        call(1, "connect_device", json!({})),
        call(2, "configure_channel", json!({ "channel": "A" })),
        call(9, "capture_block", json!({})),
    ] {
        tx.send(Ok(line)).unwrap();
    }
    drop(tx);

    let cancel = server.cancel_handle();
    let canceller = thread::spawn(move || {
        while !cancel.cancel(&json!(9)) {
            thread::sleep(Duration::from_millis(1));
        }
    });

    let mut output = Vec::new();
    server.serve(&rx, &mut output).unwrap();
    canceller.join().unwrap();

    let responses: Vec<Response> = String::from_utf8(output)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(responses.len(), 3);
    let capture = tool_result(&responses[2]);
    assert_eq!(capture["status"], "error");
    assert_eq!(capture["kind"], "cancelled");
}
