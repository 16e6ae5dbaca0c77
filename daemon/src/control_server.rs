//! Calibration control API: a loopback TCP server speaking one JSON object
//! per line.
//!
//! Requests:
//! - `{"get_calibration": true}` -> current bias/offset and run status
//! - `{"set_calibration": {...}}` -> `{"ok": true}` or `{"error": ...}`
//! - `{"calibrate_gyro": {"seconds": n}}` -> `{"status": "collecting", ...}`
//!
//! Anything else gets an `{"error": ...}` line. The handler must survive
//! any input; a request can fail, the connection and the daemon never do.

use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, info, warn};
use serde_json::{json, Value};

use crate::calibration::{gyro_run_seconds, CalibrationManager};
use crate::net::{bind_listener, LineEvent, LineReader, ACCEPT_POLL};
use crate::types::coerce_triple;

/// Loose truthiness over JSON values: null, false, 0, and empty
/// strings/arrays/objects are false, everything else true.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn error(reason: &str) -> Value {
    json!({ "error": reason })
}

/// Process one request; always returns a response object, never panics.
pub fn handle_request(manager: &CalibrationManager, request: &Value) -> Value {
    if !request.is_object() {
        return error("invalid request");
    }

    if let Some(flag) = request.get("get_calibration") {
        if is_truthy(flag) {
            return manager.status();
        }
    }

    if let Some(set) = request.get("set_calibration") {
        if !set.is_object() {
            return error("set_calibration must be an object");
        }
        // Validate everything before mutating anything.
        let mut fields = [None, None, None];
        for (i, key) in ["gyro_bias", "accel_offset", "magnetometer_bias"]
            .iter()
            .enumerate()
        {
            if let Some(value) = set.get(*key) {
                match coerce_triple(value) {
                    Some(triple) => fields[i] = Some(triple),
                    None => {
                        return match *key {
                            "gyro_bias" => error("gyro_bias must be [x,y,z]"),
                            "accel_offset" => error("accel_offset must be [x,y,z]"),
                            _ => error("magnetometer_bias must be [x,y,z]"),
                        }
                    }
                }
            }
        }
        manager.set(fields[0], fields[1], fields[2]);
        return json!({ "ok": true });
    }

    if let Some(run) = request.get("calibrate_gyro") {
        if !run.is_object() {
            return error("calibrate_gyro must be an object");
        }
        let Some(seconds) = gyro_run_seconds(run) else {
            return error("seconds must be a number");
        };
        let samples_needed = manager.start_gyro_run(seconds);
        return json!({ "status": "collecting", "samples_needed": samples_needed });
    }

    error("unknown request")
}

/// Running control server; the acceptor thread exits when the shared
/// shutdown flag is set.
pub struct ControlServer {
    local_addr: SocketAddr,
    acceptor: Option<JoinHandle<()>>,
}

impl ControlServer {
    /// Bind and start serving. Bind failure is fatal to the caller.
    pub fn start(
        host: &str,
        port: u16,
        manager: Arc<CalibrationManager>,
        shutdown: Arc<AtomicBool>,
    ) -> std::io::Result<ControlServer> {
        let listener = bind_listener(host, port)?;
        let local_addr = listener.local_addr()?;
        info!("Calibration API on {}", local_addr);

        let acceptor = std::thread::spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        let manager = Arc::clone(&manager);
                        let shutdown = Arc::clone(&shutdown);
                        std::thread::spawn(move || serve_client(stream, peer, manager, shutdown));
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(ACCEPT_POLL);
                    }
                    Err(e) => {
                        warn!("Calibration API accept error: {}", e);
                        std::thread::sleep(ACCEPT_POLL);
                    }
                }
            }
        });

        Ok(ControlServer {
            local_addr,
            acceptor: Some(acceptor),
        })
    }

    #[allow(dead_code)] // exercised by tests
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the acceptor to notice shutdown and exit.
    pub fn join(&mut self) {
        if let Some(handle) = self.acceptor.take() {
            let _ = handle.join();
        }
    }
}

fn serve_client(
    stream: std::net::TcpStream,
    peer: SocketAddr,
    manager: Arc<CalibrationManager>,
    shutdown: Arc<AtomicBool>,
) {
    debug!("Calibration client connected from {}", peer);
    let Ok(mut reader) = LineReader::new(stream) else {
        return;
    };
    while !shutdown.load(Ordering::Relaxed) {
        match reader.poll_line() {
            LineEvent::Line(line) => {
                if line.is_empty() {
                    continue;
                }
                let response = match serde_json::from_str::<Value>(&line) {
                    Ok(request) => handle_request(&manager, &request),
                    Err(_) => error("invalid JSON"),
                };
                let mut out = response.to_string();
                out.push('\n');
                if reader.stream_mut().write_all(out.as_bytes()).is_err() {
                    break;
                }
            }
            LineEvent::Timeout => continue,
            LineEvent::Closed | LineEvent::Failed => break,
        }
    }
    debug!("Calibration client {} disconnected", peer);
}
