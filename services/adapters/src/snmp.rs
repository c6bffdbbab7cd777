//! SNMP v2c client.
//!
//! Minimal BER codec for the one operation the adapter needs: a GET of a
//! single scalar OID over UDP.  Counter mappings feed the
//! [`CounterTracker`] and publish a rate instead of the raw count.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::config::{DeviceConfig, PointAddress, PointMapping, SnmpType};
use crate::counter::CounterTracker;
use crate::decode::{snmp_value_to_f64, SnmpValue};
use crate::reader::{DeviceMetrics, DeviceMetricsSnapshot, PointReader, ReadError, Reading};

const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_NULL: u8 = 0x05;
const TAG_OID: u8 = 0x06;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_COUNTER32: u8 = 0x41;
const TAG_GAUGE32: u8 = 0x42;
const TAG_TIMETICKS: u8 = 0x43;
const TAG_GET_REQUEST: u8 = 0xA0;
const TAG_GET_RESPONSE: u8 = 0xA2;

const SNMP_V2C: i64 = 1;

// ---------------------------------------------------------------------------
// BER encoding (pure)
// ---------------------------------------------------------------------------

fn encode_length(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
    } else if len <= 0xFF {
        out.push(0x81);
        out.push(len as u8);
    } else {
        out.push(0x82);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    }
}

fn encode_tlv(out: &mut Vec<u8>, tag: u8, contents: &[u8]) {
    out.push(tag);
    encode_length(out, contents.len());
    out.extend_from_slice(contents);
}

fn encode_integer(out: &mut Vec<u8>, value: i64) {
    let bytes = value.to_be_bytes();
    // Strip redundant leading bytes while preserving the sign bit.
    let mut start = 0;
    while start < 7 {
        let cur = bytes[start];
        let next = bytes[start + 1];
        if (cur == 0x00 && next & 0x80 == 0) || (cur == 0xFF && next & 0x80 != 0) {
            start += 1;
        } else {
            break;
        }
    }
    encode_tlv(out, TAG_INTEGER, &bytes[start..]);
}

/// Encode a dotted OID string into BER contents bytes.
pub fn encode_oid(oid: &str) -> Result<Vec<u8>, ReadError> {
    let arcs: Vec<u64> = oid
        .split('.')
        .map(|p| p.parse::<u64>())
        .collect::<Result<_, _>>()
        .map_err(|_| ReadError::Protocol(format!("bad OID '{}'", oid)))?;
    if arcs.len() < 2 || arcs[0] > 2 || arcs[1] > 39 {
        return Err(ReadError::Protocol(format!("bad OID '{}'", oid)));
    }

    let mut contents = vec![(arcs[0] * 40 + arcs[1]) as u8];
    for &arc in &arcs[2..] {
        let mut chunk = [0u8; 10];
        let mut i = 9;
        let mut v = arc;
        chunk[i] = (v & 0x7F) as u8;
        v >>= 7;
        while v > 0 {
            i -= 1;
            chunk[i] = ((v & 0x7F) as u8) | 0x80;
            v >>= 7;
        }
        contents.extend_from_slice(&chunk[i..]);
    }
    Ok(contents)
}

/// Build a complete SNMP v2c GET message for a single OID.
pub fn encode_get(community: &str, request_id: i32, oid: &str) -> Result<Vec<u8>, ReadError> {
    let oid_contents = encode_oid(oid)?;

    let mut varbind = Vec::new();
    encode_tlv(&mut varbind, TAG_OID, &oid_contents);
    encode_tlv(&mut varbind, TAG_NULL, &[]);

    let mut varbind_list = Vec::new();
    encode_tlv(&mut varbind_list, TAG_SEQUENCE, &varbind);

    let mut pdu = Vec::new();
    encode_integer(&mut pdu, i64::from(request_id));
    encode_integer(&mut pdu, 0); // error-status
    encode_integer(&mut pdu, 0); // error-index
    encode_tlv(&mut pdu, TAG_SEQUENCE, &varbind_list);

    let mut message = Vec::new();
    encode_integer(&mut message, SNMP_V2C);
    encode_tlv(&mut message, TAG_OCTET_STRING, community.as_bytes());
    encode_tlv(&mut message, TAG_GET_REQUEST, &pdu);

    let mut out = Vec::new();
    encode_tlv(&mut out, TAG_SEQUENCE, &message);
    Ok(out)
}

// ---------------------------------------------------------------------------
// BER decoding (pure)
// ---------------------------------------------------------------------------

fn read_tlv(buf: &[u8]) -> Result<(u8, &[u8], &[u8]), ReadError> {
    let err = || ReadError::Protocol("truncated BER".to_owned());
    let (&tag, rest) = buf.split_first().ok_or_else(err)?;
    let (&first_len, mut rest) = rest.split_first().ok_or_else(err)?;

    let len = if first_len < 0x80 {
        first_len as usize
    } else {
        let n = (first_len & 0x7F) as usize;
        if n == 0 || n > 2 || rest.len() < n {
            return Err(err());
        }
        let mut len = 0usize;
        for _ in 0..n {
            let (&b, r) = rest.split_first().ok_or_else(err)?;
            len = (len << 8) | b as usize;
            rest = r;
        }
        len
    };

    if rest.len() < len {
        return Err(err());
    }
    Ok((tag, &rest[..len], &rest[len..]))
}

fn decode_integer_contents(contents: &[u8]) -> i64 {
    let mut v: i64 = if contents.first().is_some_and(|b| b & 0x80 != 0) {
        -1
    } else {
        0
    };
    for &b in contents {
        v = (v << 8) | i64::from(b);
    }
    v
}

fn decode_unsigned_contents(contents: &[u8]) -> u64 {
    let mut v: u64 = 0;
    for &b in contents {
        v = (v << 8) | u64::from(b);
    }
    v
}

/// Parse a GET response and return the first varbind's value.
pub fn decode_get_response(datagram: &[u8], expected_request_id: i32) -> Result<SnmpValue, ReadError> {
    let (tag, message, _) = read_tlv(datagram)?;
    if tag != TAG_SEQUENCE {
        return Err(ReadError::Protocol("response is not a SEQUENCE".to_owned()));
    }

    let (tag, _version, rest) = read_tlv(message)?;
    if tag != TAG_INTEGER {
        return Err(ReadError::Protocol("missing version".to_owned()));
    }
    let (_, _community, rest) = read_tlv(rest)?;
    let (tag, pdu, _) = read_tlv(rest)?;
    if tag != TAG_GET_RESPONSE {
        return Err(ReadError::Protocol(format!("unexpected PDU tag 0x{:02X}", tag)));
    }

    let (_, request_id, rest) = read_tlv(pdu)?;
    if decode_integer_contents(request_id) != i64::from(expected_request_id) {
        return Err(ReadError::Protocol("request id mismatch".to_owned()));
    }
    let (_, error_status, rest) = read_tlv(rest)?;
    let status = decode_integer_contents(error_status);
    if status != 0 {
        return Err(ReadError::Protocol(format!("SNMP error-status {}", status)));
    }
    let (_, _error_index, rest) = read_tlv(rest)?;

    let (tag, varbind_list, _) = read_tlv(rest)?;
    if tag != TAG_SEQUENCE {
        return Err(ReadError::Protocol("missing varbind list".to_owned()));
    }
    let (tag, varbind, _) = read_tlv(varbind_list)?;
    if tag != TAG_SEQUENCE {
        return Err(ReadError::Protocol("missing varbind".to_owned()));
    }
    let (_, _oid, rest) = read_tlv(varbind)?;
    let (tag, contents, _) = read_tlv(rest)?;

    match tag {
        TAG_INTEGER => Ok(SnmpValue::Integer(decode_integer_contents(contents))),
        TAG_COUNTER32 => Ok(SnmpValue::Counter32(decode_unsigned_contents(contents) as u32)),
        TAG_GAUGE32 => Ok(SnmpValue::Gauge32(decode_unsigned_contents(contents) as u32)),
        TAG_TIMETICKS => Ok(SnmpValue::TimeTicks(decode_unsigned_contents(contents) as u32)),
        TAG_OCTET_STRING => Ok(SnmpValue::OctetString(
            String::from_utf8_lossy(contents).into_owned(),
        )),
        other => Err(ReadError::Protocol(format!(
            "unsupported value tag 0x{:02X}",
            other
        ))),
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// One SNMP v2c device.
pub struct SnmpReader {
    device: DeviceConfig,
    socket: Option<UdpSocket>,
    next_request_id: i32,
    timeout: Duration,
    counters: CounterTracker,
    started: Instant,
    metrics: DeviceMetrics,
}

impl SnmpReader {
    pub fn new(device: DeviceConfig) -> Self {
        let timeout = Duration::from_secs_f64(device.timeout_s);
        SnmpReader {
            device,
            socket: None,
            next_request_id: 1,
            timeout,
            counters: CounterTracker::new(),
            started: Instant::now(),
            metrics: DeviceMetrics::new(),
        }
    }

    fn monotonic_s(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    async fn get(&mut self, oid: &str) -> Result<SnmpValue, ReadError> {
        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1).max(1);

        let request = encode_get(&self.device.community, request_id, oid)?;
        let socket = self.socket.as_ref().ok_or(ReadError::NotConnected)?;

        let io = async {
            socket.send(&request).await?;
            let mut buf = [0u8; 1500];
            let n = socket.recv(&mut buf).await?;
            decode_get_response(&buf[..n], request_id)
        };
        tokio::time::timeout(self.timeout, io)
            .await
            .map_err(|_| ReadError::Timeout(self.timeout))?
    }
}

#[async_trait]
impl PointReader for SnmpReader {
    fn name(&self) -> &str {
        &self.device.name
    }

    async fn connect(&mut self) -> Result<(), ReadError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket
            .connect((self.device.host.as_str(), self.device.port))
            .await?;
        self.socket = Some(socket);
        debug!(device = %self.device.name, host = %self.device.host, "snmp socket ready");
        Ok(())
    }

    async fn read_point(&mut self, point: &PointMapping) -> Result<Reading, ReadError> {
        let (oid, data_type, counter_scale) = match &point.address {
            PointAddress::Snmp {
                oid,
                data_type,
                counter_scale,
            } => (oid.clone(), *data_type, *counter_scale),
            other => {
                return Err(ReadError::Protocol(format!(
                    "point '{}' is not an SNMP mapping: {:?}",
                    point.tag, other
                )))
            }
        };

        let started = Instant::now();
        let wire_value = match self.get(&oid).await {
            Ok(v) => v,
            Err(e) => {
                self.metrics.record_error();
                return Err(e);
            }
        };
        self.metrics
            .record_read(started.elapsed().as_secs_f64() * 1000.0);

        let raw = snmp_value_to_f64(&wire_value, data_type)
            .map_err(|e| ReadError::Decode(e.to_string()))?;

        if data_type == SnmpType::Counter {
            // counter_scale already converts the delta to the published
            // unit; the point's scale/offset do not re-apply to rates.
            let now_s = self.monotonic_s();
            return Ok(
                match self.counters.observe(&point.tag, raw, counter_scale, now_s) {
                    Some(rate) => Reading::value(rate),
                    // First sample: no rate yet.
                    None => Reading::pending(),
                },
            );
        }

        Ok(Reading::value(raw * point.scale + point.offset))
    }

    async fn close(&mut self) {
        self.socket = None;
    }

    fn metrics(&self) -> DeviceMetricsSnapshot {
        self.metrics.snapshot()
    }
}
