//! Monitoring endpoint (spec §4.7): atomic counters exported as JSON over
//! a minimal hand-rolled HTTP/1.1 responder. No web framework — this is
//! a single GET route serving a fixed-shape snapshot, not worth a
//! dependency.

use serde::Serialize;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

#[derive(Default)]
pub struct Counters {
    pub corrections_applied: AtomicU64,
    pub spikes_rejected: AtomicU64,
    pub resets: AtomicU64,
    pub last_offset_ns: AtomicI64,
    pub last_freq_ppb_milli: AtomicI64, // freq_ppb * 1000, since atomics don't do floats
}

#[derive(Serialize)]
struct Snapshot {
    corrections_applied: u64,
    spikes_rejected: u64,
    resets: u64,
    last_offset_ns: i64,
    last_freq_ppb: f64,
}

impl Counters {
    pub fn record_correction(&self, offset_ns: i64, freq_ppb: f64) {
        self.corrections_applied.fetch_add(1, Ordering::Relaxed);
        self.last_offset_ns.store(offset_ns, Ordering::Relaxed);
        self.last_freq_ppb_milli.store((freq_ppb * 1000.0) as i64, Ordering::Relaxed);
    }

    pub fn record_spike(&self) {
        self.spikes_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reset(&self) {
        self.resets.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            corrections_applied: self.corrections_applied.load(Ordering::Relaxed),
            spikes_rejected: self.spikes_rejected.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
            last_offset_ns: self.last_offset_ns.load(Ordering::Relaxed),
            last_freq_ppb: self.last_freq_ppb_milli.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }
}

/// Spawn a background thread serving `GET /status` as JSON. Any other
/// path or method gets a 404. Returns once the listener is bound so the
/// caller can log the real address (useful when `addr`'s port is 0).
pub fn spawn_status_server(addr: SocketAddr, counters: Arc<Counters>) -> crate::error::Result<SocketAddr> {
    let listener = TcpListener::bind(addr)
        .map_err(|e| crate::error::PtpdiscError::Transport(format!("binding monitor socket: {e}")))?;
    let bound = listener.local_addr().map_err(|e| crate::error::PtpdiscError::Transport(e.to_string()))?;

    thread::spawn(move || {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let counters = counters.clone();
                    thread::spawn(move || handle_connection(stream, &counters));
                }
                Err(e) => log::warn!("monitor: accept failed: {e}"),
            }
        }
    });

    Ok(bound)
}

fn handle_connection(mut stream: TcpStream, counters: &Counters) {
    let mut buf = [0u8; 1024];
    let n = match stream.read(&mut buf) {
        Ok(n) => n,
        Err(e) => {
            log::warn!("monitor: read failed: {e}");
            return;
        }
    };
    let request = String::from_utf8_lossy(&buf[..n]);
    let request_line = request.lines().next().unwrap_or("");

    let response = if request_line.starts_with("GET /status ") {
        let body = serde_json::to_string(&counters.snapshot()).unwrap_or_else(|_| "{}".to_string());
        http_response(200, "OK", "application/json", &body)
    } else {
        http_response(404, "Not Found", "text/plain", "not found")
    };

    if let Err(e) = stream.write_all(response.as_bytes()) {
        log::warn!("monitor: write failed: {e}");
    }
}

fn http_response(status: u16, reason: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_events() {
        let counters = Counters::default();
        counters.record_correction(1234, -56.75);
        counters.record_spike();
        counters.record_reset();
        let snap = counters.snapshot();
        assert_eq!(snap.corrections_applied, 1);
        assert_eq!(snap.spikes_rejected, 1);
        assert_eq!(snap.resets, 1);
        assert_eq!(snap.last_offset_ns, 1234);
        assert!((snap.last_freq_ppb - (-56.75)).abs() < 1e-9);
    }

    #[test]
    fn http_response_has_correct_content_length() {
        let resp = http_response(200, "OK", "application/json", "{\"a\":1}");
        assert!(resp.contains("Content-Length: 7"));
        assert!(resp.ends_with("{\"a\":1}"));
    }
}
