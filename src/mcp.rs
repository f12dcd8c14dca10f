//! Model Context Protocol host: newline-delimited JSON-RPC 2.0.
//!
//! A reader thread frames input lines and handles `notifications/cancelled`
//! on its own, so a capture that is waiting for its trigger can be aborted
//! while the main thread is busy with it. Everything else is answered in
//! order by [`McpServer::serve`].

use std::io::{self, BufRead, Write};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::capture::CancelToken;
use crate::driver::Driver;
use crate::tools::{self, ToolServer};

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;

#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub jsonrpc: String,
    /// Absent for notifications.
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Frames one input line. Malformed input becomes the error response to send.
pub fn parse_line(line: &str) -> Result<Request, Response> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| Response::failure(Value::Null, PARSE_ERROR, format!("Parse error: {e}")))?;
    let id = value.get("id").cloned().unwrap_or(Value::Null);
    let request: Request = serde_json::from_value(value)
        .map_err(|e| Response::failure(id.clone(), INVALID_REQUEST, format!("Invalid request: {e}")))?;
    if request.jsonrpc != JSONRPC_VERSION {
        return Err(Response::failure(
            id,
            INVALID_REQUEST,
            format!("Unsupported jsonrpc version {:?}", request.jsonrpc),
        ));
    }
    Ok(request)
}

/// Lets the reader thread abort the `tools/call` currently running.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancelToken,
    running: Arc<Mutex<Option<Value>>>,
}

impl CancelHandle {
    /// Trips the capture token if `request_id` is the call in progress.
    pub fn cancel(&self, request_id: &Value) -> bool {
        let running = self.running.lock();
        if running.as_ref() == Some(request_id) {
            log::info!("Cancelling request {request_id}");
            self.token.cancel();
            true
        } else {
            log::debug!("Cancellation for {request_id} ignored, not running");
            false
        }
    }
}

/// Starts the thread that reads `input` line by line.
///
/// Cancellation notifications are consumed on that thread; every other
/// non-blank line is forwarded. The channel closes at end of input.
pub fn spawn_reader<R>(input: R, cancel: CancelHandle) -> mpsc::Receiver<io::Result<String>>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in input.lines() {
            let forward = match &line {
                Ok(text) if text.trim().is_empty() => false,
                Ok(text) => !handle_cancellation(text, &cancel),
                Err(_) => true,
            };
            if forward && tx.send(line).is_err() {
                break;
            }
        }
        log::debug!("Input closed");
    });
    rx
}

fn handle_cancellation(line: &str, cancel: &CancelHandle) -> bool {
    let Ok(request) = parse_line(line) else {
        return false;
    };
    if request.method != "notifications/cancelled" {
        return false;
    }
    if let Some(request_id) = request.params.get("requestId") {
        cancel.cancel(request_id);
    }
    true
}

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

pub struct McpServer<D: Driver> {
    tools: ToolServer<D>,
    running: Arc<Mutex<Option<Value>>>,
    name: String,
    version: String,
}

impl<D: Driver> McpServer<D> {
    pub fn new(tools: ToolServer<D>) -> Self {
        Self {
            tools,
            running: Arc::new(Mutex::new(None)),
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            token: self.tools.cancel_token(),
            running: Arc::clone(&self.running),
        }
    }

    pub fn tools(&self) -> &ToolServer<D> {
        &self.tools
    }

    /// Answers one request. Notifications get no answer.
    pub fn handle(&self, request: Request) -> Option<Response> {
        log::debug!("<- {} {:?}", request.method, request.id);
        let Some(id) = request.id.clone() else {
            self.handle_notification(&request);
            return None;
        };

        let response = match request.method.as_str() {
            "initialize" => Response::success(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": { "listChanged": false } },
                    "serverInfo": { "name": self.name, "version": self.version },
                }),
            ),
            "ping" => Response::success(id, json!({})),
            "tools/list" => match serde_json::to_value(tools::catalog()) {
                Ok(list) => Response::success(id, json!({ "tools": list })),
                Err(e) => Response::failure(id, INVALID_REQUEST, e.to_string()),
            },
            "tools/call" => self.call_tool(id, &request.params),
            other => Response::failure(id, METHOD_NOT_FOUND, format!("Method not found: {other}")),
        };
        Some(response)
    }

    fn handle_notification(&self, request: &Request) {
        match request.method.as_str() {
            "notifications/initialized" => log::info!("Client initialized"),
            "notifications/cancelled" => log::debug!("Late cancellation {}", request.params),
            other => log::debug!("Ignoring notification {other}"),
        }
    }

    fn call_tool(&self, id: Value, params: &Value) -> Response {
        let params: CallParams = match serde_json::from_value(params.clone()) {
            Ok(params) => params,
            Err(e) => return Response::failure(id, INVALID_PARAMS, format!("Invalid params: {e}")),
        };
        if !ToolServer::<D>::is_known(&params.name) {
            return Response::failure(id, INVALID_PARAMS, format!("Unknown tool: {}", params.name));
        }

        {
            // Re-arm under the lock so a cancellation for `id` can only land after it.
            let mut running = self.running.lock();
            self.tools.cancel_token().reset();
            *running = Some(id.clone());
        }
        let outcome = self.tools.call(&params.name, &params.arguments);
        *self.running.lock() = None;

        let is_error = outcome["status"] == "error";
        Response::success(
            id,
            json!({
                "content": [{ "type": "text", "text": outcome.to_string() }],
                "isError": is_error,
            }),
        )
    }

    /// Answers requests from `lines` until input ends, then disconnects.
    pub fn serve<W: Write>(&self, lines: &mpsc::Receiver<io::Result<String>>, output: &mut W) -> io::Result<()> {
        for line in lines {
            let line = line?;
            let response = match parse_line(&line) {
                Ok(request) => self.handle(request),
                Err(response) => Some(response),
            };
            if let Some(response) = response {
                let encoded = serde_json::to_string(&response)?;
                writeln!(output, "{encoded}")?;
                output.flush()?;
            }
        }
        log::info!("End of input, shutting down");
        self.tools.shutdown();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::sim::SimulatedDriver;
    use crate::session::{Session, SessionSettings};

    fn server() -> McpServer<SimulatedDriver> {
        McpServer::new(ToolServer::new(Session::new(
            SimulatedDriver::default(),
            SessionSettings::default(),
        )))
    }

    fn request(line: &str) -> Request {
        parse_line(line).unwrap()
    }

    #[test]
    fn test_initialize() {
        let response = server()
            .handle(request(r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#))
            .unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
        assert!(result["capabilities"]["tools"].is_object());
        assert_eq!(result["serverInfo"]["name"], "picoscope-tools");
    }

    #[test]
    fn test_ping_and_notifications() {
        let server = server();
        let pong = server.handle(request(r#"{"jsonrpc":"2.0","id":"p","method":"ping"}"#)).unwrap();
        assert_eq!(pong.result, Some(json!({})));
        assert_eq!(pong.id, json!("p"));
        assert!(server
            .handle(request(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#))
            .is_none());
    }

    #[test]
    fn test_unknown_method() {
        let response = server()
            .handle(request(r#"{"jsonrpc":"2.0","id":7,"method":"resources/list"}"#))
            .unwrap();
        assert_eq!(response.error.map(|e| e.code), Some(METHOD_NOT_FOUND));
    }

    #[test]
    fn test_parse_errors() {
        let response = parse_line("{not json").unwrap_err();
        assert_eq!(response.error.map(|e| e.code), Some(PARSE_ERROR));
        assert_eq!(response.id, Value::Null);

        let response = parse_line(r#"{"jsonrpc":"2.0","id":3}"#).unwrap_err();
        assert_eq!(response.error.map(|e| e.code), Some(INVALID_REQUEST));
        assert_eq!(response.id, json!(3));
    }

    #[test]
    fn test_tools_list() {
        let response = server()
            .handle(request(r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#))
            .unwrap();
        let tools = response.result.unwrap()["tools"].as_array().cloned().unwrap();
        assert!(tools.iter().any(|t| t["name"] == "capture_block"));
        assert!(tools.iter().all(|t| t["inputSchema"].is_object()));
    }

    #[test]
    fn test_tools_call_wraps_response() {
        let server = server();
        let response = server
            .handle(request(
                r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"get_device_info","arguments":{}}}"#,
            ))
            .unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["isError"], true);
        let text = result["content"][0]["text"].as_str().unwrap();
        let inner: Value = serde_json::from_str(text).unwrap();
        assert_eq!(inner["kind"], "not_connected");

        let response = server
            .handle(request(
                r#"{"jsonrpc":"2.0","id":5,"method":"tools/call","params":{"name":"connect_device"}}"#,
            ))
            .unwrap();
        assert_eq!(response.result.unwrap()["isError"], false);
    }

    #[test]
    fn test_tools_call_invalid_params() {
        let server = server();
        let response = server
            .handle(request(r#"{"jsonrpc":"2.0","id":6,"method":"tools/call","params":{}}"#))
            .unwrap();
        assert_eq!(response.error.map(|e| e.code), Some(INVALID_PARAMS));
        let response = server
            .handle(request(
                r#"{"jsonrpc":"2.0","id":6,"method":"tools/call","params":{"name":"nope"}}"#,
            ))
            .unwrap();
        assert_eq!(response.error.map(|e| e.code), Some(INVALID_PARAMS));
    }

    #[test]
    fn test_cancel_only_hits_running_request() {
        let server = server();
        let handle = server.cancel_handle();
        assert!(!handle.cancel(&json!(1)));
        assert!(!server.tools().cancel_token().is_cancelled());

        *server.running.lock() = Some(json!(1));
        assert!(handle.cancel(&json!(1)));
        assert!(server.tools().cancel_token().is_cancelled());
    }

    #[test]
    fn test_cancel_after_call_starts_aborts_capture() {
        use crate::driver::sim::SimulatorConfig;
        use std::time::Duration;

        let server = McpServer::new(ToolServer::new(Session::new(
            SimulatedDriver::new(SimulatorConfig {
                polls_until_ready: u32::MAX,
                ..SimulatorConfig::default()
            }),
            SessionSettings {
                ready_timeout: Some(Duration::from_secs(30)),
                poll_interval: Duration::from_micros(100),
                ..SessionSettings::default()
            },
        )));
        server.tools().call("connect_device", &json!({}));
        server.tools().call("configure_channel", &json!({ "channel": "A" }));

        let handle = server.cancel_handle();
        let canceller = thread::spawn(move || {
            while !handle.cancel(&json!(42)) {
                thread::sleep(Duration::from_millis(1));
            }
        });
        let response = server
            .handle(request(
                r#"{"jsonrpc":"2.0","id":42,"method":"tools/call","params":{"name":"capture_block","arguments":{}}}"#,
            ))
            .unwrap();
        canceller.join().unwrap();

        let result = response.result.unwrap();
        assert_eq!(result["isError"], true);
        let inner: Value = serde_json::from_str(result["content"][0]["text"].as_str().unwrap()).unwrap();
        assert_eq!(inner["kind"], "cancelled");
    }

    #[test]
    fn test_stale_cancel_does_not_hit_next_call() {
        let server = server();
        server.tools().call("connect_device", &json!({}));
        server.tools().call("configure_channel", &json!({ "channel": "A" }));
        server.tools().cancel_token().cancel();

        let response = server
            .handle(request(
                r#"{"jsonrpc":"2.0","id":8,"method":"tools/call","params":{"name":"capture_block","arguments":{"pre_trigger_samples":10,"post_trigger_samples":10}}}"#,
            ))
            .unwrap();
        assert_eq!(response.result.unwrap()["isError"], false);
    }

    #[test]
    fn test_reader_consumes_cancellations() {
        let input = concat!(
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n",
            "\n",
            "{\"jsonrpc\":\"2.0\",\"method\":\"notifications/cancelled\",\"params\":{\"requestId\":1}}\n",
            "{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"ping\"}\n",
        );
        let server = server();
        let lines: Vec<String> = spawn_reader(io::Cursor::new(input), server.cancel_handle())
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|l| l.contains("ping")));
    }

    #[test]
    fn test_serve_answers_in_order_and_disconnects() {
        let input = concat!(
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"tools/call\",\"params\":{\"name\":\"connect_device\"}}\n",
            "garbage\n",
            "{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n",
            "{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"ping\"}\n",
        );
        let server = server();
        let lines = spawn_reader(io::Cursor::new(input), server.cancel_handle());
        let mut output = Vec::new();
        server.serve(&lines, &mut output).unwrap();

        let responses: Vec<Response> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0].id, json!(1));
        assert_eq!(responses[1].error.as_ref().map(|e| e.code), Some(PARSE_ERROR));
        assert_eq!(responses[2].id, json!(2));

        let info = server.tools().call("get_device_info", &json!({}));
        assert_eq!(info["kind"], "not_connected");
    }
}
