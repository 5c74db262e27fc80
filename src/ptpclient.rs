//! Minimal embedded PTPv2 (IEEE 1588) unicast client.
//!
//! Just enough of the protocol to discipline a local PHC against a
//! single configured grandmaster: parse `Sync`/`Follow_Up` event
//! messages, pair them by sequence id, issue the matching `Delay_Req`,
//! and reduce the four timestamps from its `Delay_Resp` into a
//! delay-compensated `(offset_ns, local_ts_ns)`. No BMCA — negotiation
//! and message framing belong to the external codec collaborator; only
//! the four-timestamp orchestration lives here. Socket setup follows
//! the kernel-timestamping pattern in [`crate::net`].

use crate::error::{PtpdiscError, Result};
use crate::traits::Timestamper;
use byteorder::{BigEndian, ByteOrder};
use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::time::{SystemTime, UNIX_EPOCH};

const PTP_EVENT_PORT: u16 = 319;
const MSG_TYPE_SYNC: u8 = 0x0;
const MSG_TYPE_DELAY_REQ: u8 = 0x1;
const MSG_TYPE_FOLLOW_UP: u8 = 0x8;
const MSG_TYPE_DELAY_RESP: u8 = 0x9;
const PTP_VERSION: u8 = 0x02;

/// A parsed PTPv2 timestamp: (seconds since PTP epoch, nanoseconds).
fn parse_timestamp(buf: &[u8]) -> (u64, u32) {
    let secs_hi = BigEndian::read_u16(&buf[0..2]) as u64;
    let secs_lo = BigEndian::read_u32(&buf[2..6]) as u64;
    let secs = (secs_hi << 32) | secs_lo;
    let nanos = BigEndian::read_u32(&buf[6..10]);
    (secs, nanos)
}

/// Minimal `Delay_Req` event message: just enough header for a unicast
/// master to echo the sequence id back in its `Delay_Resp`.
fn build_delay_req(sequence_id: u16) -> [u8; 44] {
    let mut buf = [0u8; 44];
    let len = buf.len() as u16;
    buf[0] = MSG_TYPE_DELAY_REQ;
    buf[1] = PTP_VERSION;
    BigEndian::write_u16(&mut buf[2..4], len);
    BigEndian::write_u16(&mut buf[30..32], sequence_id);
    buf
}

struct PendingSync {
    sync_origin_ns: i128,
    sync_local_rx_ns: u64,
}

/// A `Delay_Req` we have sent and are waiting to see echoed back in a
/// `Delay_Resp`, keyed by the sequence id we sent it with.
struct PendingDelay {
    sync_origin_ns: i128,
    sync_local_rx_ns: u64,
    delay_req_local_tx_ns: i128,
}

pub struct PtpClient {
    socket: UdpSocket,
    pending_sync: HashMap<u16, PendingSync>,
    pending_delay: HashMap<u16, PendingDelay>,
    next_delay_seq: u16,
}

impl PtpClient {
    pub fn bind(master: SocketAddr, local_ip: std::net::Ipv4Addr) -> Result<Self> {
        let socket = UdpSocket::bind((local_ip, PTP_EVENT_PORT))
            .map_err(|e| PtpdiscError::Transport(format!("bind PTP event port: {e}")))?;
        socket
            .connect(master)
            .map_err(|e| PtpdiscError::Transport(format!("connect to master {master}: {e}")))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| PtpdiscError::Transport(e.to_string()))?;
        Ok(PtpClient {
            socket,
            pending_sync: HashMap::new(),
            pending_delay: HashMap::new(),
            next_delay_seq: 0,
        })
    }

    /// Poll once for a datagram. A `Sync`/`Follow_Up` pair triggers a
    /// `Delay_Req`; only once the matching `Delay_Resp` arrives is the
    /// delay-compensated `(offset_ns, local_ts_ns)` returned.
    pub fn poll(&mut self) -> Result<Option<(i64, u64)>> {
        let mut buf = [0u8; 128];
        let len = match self.socket.recv(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(PtpdiscError::Transport(e.to_string())),
        };
        if len < 34 {
            return Ok(None);
        }
        let local_ts_ns = now_ns();
        let msg_type = buf[0] & 0x0f;
        let sequence_id = BigEndian::read_u16(&buf[30..32]);

        match msg_type {
            MSG_TYPE_SYNC => {
                self.pending_sync.insert(
                    sequence_id,
                    PendingSync { sync_origin_ns: 0, sync_local_rx_ns: local_ts_ns },
                );
                Ok(None)
            }
            MSG_TYPE_FOLLOW_UP => {
                if len < 44 {
                    return Ok(None);
                }
                let Some(mut pending) = self.pending_sync.remove(&sequence_id) else {
                    return Ok(None);
                };
                let (origin_secs, origin_nanos) = parse_timestamp(&buf[34..44]);
                pending.sync_origin_ns = origin_secs as i128 * 1_000_000_000 + origin_nanos as i128;
                self.send_delay_req(pending)
            }
            MSG_TYPE_DELAY_RESP => {
                if len < 44 {
                    return Ok(None);
                }
                let Some(pending) = self.pending_delay.remove(&sequence_id) else {
                    return Ok(None);
                };
                let (rx_secs, rx_nanos) = parse_timestamp(&buf[34..44]);
                let delay_req_master_rx_ns = rx_secs as i128 * 1_000_000_000 + rx_nanos as i128;
                Ok(Some(reduce_four_timestamps(&pending, delay_req_master_rx_ns)))
            }
            _ => Ok(None),
        }
    }

    /// Send the `Delay_Req` for a just-completed Sync/Follow_Up exchange
    /// and stash its send time under a fresh sequence id, keyed
    /// independently of the Sync sequence space per the wire protocol.
    fn send_delay_req(&mut self, sync: PendingSync) -> Result<Option<(i64, u64)>> {
        let delay_seq = self.next_delay_seq;
        self.next_delay_seq = self.next_delay_seq.wrapping_add(1);
        let delay_req_local_tx_ns = now_ns() as i128;

        let frame = build_delay_req(delay_seq);
        self.socket
            .send(&frame)
            .map_err(|e| PtpdiscError::Transport(format!("send Delay_Req: {e}")))?;

        self.pending_delay.insert(
            delay_seq,
            PendingDelay {
                sync_origin_ns: sync.sync_origin_ns,
                sync_local_rx_ns: sync.sync_local_rx_ns,
                delay_req_local_tx_ns,
            },
        );
        Ok(None)
    }
}

/// Standard PTP four-timestamp reduction (spec §4.5):
/// `server→client = t2 − t1`, `client→server = t4 − t3`,
/// `delay = (server→client + client→server) / 2`,
/// `offset = (server→client − client→server) / 2`.
/// Returns `(offset_ns, local_ts_ns)`; the caller only needs the offset,
/// delay cancels the constant network path but is not itself reported.
fn reduce_four_timestamps(pending: &PendingDelay, delay_req_master_rx_ns: i128) -> (i64, u64) {
    let server_to_client = pending.sync_local_rx_ns as i128 - pending.sync_origin_ns;
    let client_to_server = delay_req_master_rx_ns - pending.delay_req_local_tx_ns;
    let offset_ns = (server_to_client - client_to_server) / 2;
    (offset_ns as i64, pending.sync_local_rx_ns)
}

impl Timestamper for PtpClient {
    fn next_offset(&mut self) -> Result<Option<(i64, u64)>> {
        self.poll()
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ptp_timestamp_field() {
        let mut buf = [0u8; 10];
        BigEndian::write_u16(&mut buf[0..2], 0);
        BigEndian::write_u32(&mut buf[2..6], 1_700_000_000);
        BigEndian::write_u32(&mut buf[6..10], 123_456_789);
        let (secs, nanos) = parse_timestamp(&buf);
        assert_eq!(secs, 1_700_000_000);
        assert_eq!(nanos, 123_456_789);
    }

    #[test]
    fn event_port_is_the_ieee1588_default() {
        assert_eq!(PTP_EVENT_PORT, 319);
    }

    #[test]
    fn delay_req_frame_carries_message_type_and_sequence_id() {
        let frame = build_delay_req(42);
        assert_eq!(frame[0] & 0x0f, MSG_TYPE_DELAY_REQ);
        assert_eq!(BigEndian::read_u16(&frame[30..32]), 42);
    }

    #[test]
    fn four_timestamp_reduction_cancels_symmetric_delay() {
        // server->client = 1000ns, client->server = 600ns (network delay
        // of 200ns each way plus a genuine 400ns clock offset).
        let pending = PendingDelay {
            sync_origin_ns: 0,
            sync_local_rx_ns: 1000,
            delay_req_local_tx_ns: 2000,
        };
        let (offset_ns, local_ts) = reduce_four_timestamps(&pending, 2600);
        assert_eq!(offset_ns, 200);
        assert_eq!(local_ts, 1000);
    }
}
