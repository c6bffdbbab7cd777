//! BACnet/IP client (read-only by contract).
//!
//! Reads present-value from AI/AV/BI/BV objects with a hand-rolled
//! BVLC/NPDU/APDU codec, and subscribes to Change-of-Value where a mapping
//! requests it — renewing before the lifetime expires and falling back to
//! polling when the device rejects the subscription.
//!
//! Only the frames this adapter actually exchanges are implemented:
//! ReadProperty request/ack, SubscribeCOV request/simple-ack, and
//! unconfirmed COV notifications.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::config::{BacnetObject, DeviceConfig, PointAddress, PointMapping};
use crate::reader::{DeviceMetrics, DeviceMetricsSnapshot, PointReader, ReadError, Reading};

const BVLC_TYPE: u8 = 0x81;
const BVLC_ORIGINAL_UNICAST: u8 = 0x0A;
const NPDU_VERSION: u8 = 0x01;

const PDU_CONFIRMED_REQUEST: u8 = 0x00;
const PDU_UNCONFIRMED_REQUEST: u8 = 0x10;
const PDU_SIMPLE_ACK: u8 = 0x20;
const PDU_COMPLEX_ACK: u8 = 0x30;
const PDU_ERROR: u8 = 0x50;

const SERVICE_SUBSCRIBE_COV: u8 = 5;
const SERVICE_READ_PROPERTY: u8 = 12;
const UNCONFIRMED_COV_NOTIFICATION: u8 = 2;

const PROP_PRESENT_VALUE: u32 = 85;

/// Subscriber process id sent in SubscribeCOV requests.
const COV_PROCESS_ID: u8 = 1;

/// Renew a COV subscription when this close to its lifetime expiry.
const COV_RENEW_MARGIN_S: f64 = 30.0;

/// A COV value older than this is considered stale; the point is polled.
const COV_MAX_AGE_S: f64 = 60.0;

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// A decoded present-value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BacnetValue {
    Real(f32),
    Enumerated(u32),
    Boolean(bool),
    Unsigned(u32),
}

impl BacnetValue {
    pub fn as_f64(self) -> f64 {
        match self {
            BacnetValue::Real(v) => f64::from(v),
            BacnetValue::Enumerated(v) | BacnetValue::Unsigned(v) => f64::from(v),
            BacnetValue::Boolean(b) => {
                if b {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Frame building (pure)
// ---------------------------------------------------------------------------

fn object_id(object: BacnetObject, instance: u32) -> u32 {
    (u32::from(object.type_id()) << 22) | (instance & 0x003F_FFFF)
}

fn push_bvlc_npdu(frame: &mut Vec<u8>) {
    frame.extend_from_slice(&[BVLC_TYPE, BVLC_ORIGINAL_UNICAST, 0, 0]); // length patched later
    frame.extend_from_slice(&[NPDU_VERSION, 0x04]); // expecting reply
}

fn patch_bvlc_length(frame: &mut [u8]) {
    let len = frame.len() as u16;
    frame[2..4].copy_from_slice(&len.to_be_bytes());
}

/// Build a ReadProperty request for an object's present-value.
pub fn encode_read_property(invoke_id: u8, object: BacnetObject, instance: u32) -> Vec<u8> {
    let mut frame = Vec::with_capacity(17);
    push_bvlc_npdu(&mut frame);

    frame.push(PDU_CONFIRMED_REQUEST);
    frame.push(0x05); // max APDU 1476, no segmentation
    frame.push(invoke_id);
    frame.push(SERVICE_READ_PROPERTY);

    // context 0: object identifier
    frame.push(0x0C);
    frame.extend_from_slice(&object_id(object, instance).to_be_bytes());
    // context 1: property identifier (present-value fits one byte)
    frame.push(0x19);
    frame.push(PROP_PRESENT_VALUE as u8);

    patch_bvlc_length(&mut frame);
    frame
}

/// Build a SubscribeCOV request (confirmed notifications off).
pub fn encode_subscribe_cov(
    invoke_id: u8,
    object: BacnetObject,
    instance: u32,
    lifetime_s: u32,
) -> Vec<u8> {
    let mut frame = Vec::with_capacity(24);
    push_bvlc_npdu(&mut frame);

    frame.push(PDU_CONFIRMED_REQUEST);
    frame.push(0x05);
    frame.push(invoke_id);
    frame.push(SERVICE_SUBSCRIBE_COV);

    // context 0: subscriber process id
    frame.push(0x09);
    frame.push(COV_PROCESS_ID);
    // context 1: monitored object
    frame.push(0x1C);
    frame.extend_from_slice(&object_id(object, instance).to_be_bytes());
    // context 2: issue confirmed notifications = false
    frame.push(0x29);
    frame.push(0x00);
    // context 3: lifetime
    let lifetime_bytes = unsigned_contents(lifetime_s);
    frame.push(0x38 | lifetime_bytes.len() as u8);
    frame.extend_from_slice(&lifetime_bytes);

    patch_bvlc_length(&mut frame);
    frame
}

fn unsigned_contents(v: u32) -> Vec<u8> {
    let bytes = v.to_be_bytes();
    let skip = bytes.iter().take(3).take_while(|&&b| b == 0).count();
    bytes[skip..].to_vec()
}

// ---------------------------------------------------------------------------
// Frame parsing (pure)
// ---------------------------------------------------------------------------

/// Strip BVLC + NPDU and return the APDU bytes.
fn apdu_of(frame: &[u8]) -> Result<&[u8], ReadError> {
    if frame.len() < 6 || frame[0] != BVLC_TYPE {
        return Err(ReadError::Protocol("not a BVLC frame".to_owned()));
    }
    let declared = u16::from_be_bytes([frame[2], frame[3]]) as usize;
    if declared != frame.len() {
        return Err(ReadError::Protocol("BVLC length mismatch".to_owned()));
    }
    if frame[4] != NPDU_VERSION {
        return Err(ReadError::Protocol("unsupported NPDU version".to_owned()));
    }
    // Control octets with routing info are not expected from a directly
    // addressed device; reject rather than mis-parse.
    if frame[5] & 0x20 != 0 || frame[5] & 0x08 != 0 {
        return Err(ReadError::Protocol("routed NPDU not supported".to_owned()));
    }
    Ok(&frame[6..])
}

/// Read one application-tagged value.
fn read_application_value(buf: &[u8]) -> Result<(BacnetValue, &[u8]), ReadError> {
    let err = |m: &str| ReadError::Protocol(m.to_owned());
    let (&tag, rest) = buf.split_first().ok_or_else(|| err("empty value"))?;
    let tag_number = tag >> 4;
    let lvt = (tag & 0x07) as usize;

    match tag_number {
        1 => Ok((BacnetValue::Boolean(lvt == 1), rest)),
        2 => {
            let contents = rest.get(..lvt).ok_or_else(|| err("short unsigned"))?;
            let mut v = 0u32;
            for &b in contents {
                v = (v << 8) | u32::from(b);
            }
            Ok((BacnetValue::Unsigned(v), &rest[lvt..]))
        }
        4 => {
            let contents = rest.get(..4).ok_or_else(|| err("short real"))?;
            let bits = u32::from_be_bytes([contents[0], contents[1], contents[2], contents[3]]);
            Ok((BacnetValue::Real(f32::from_bits(bits)), &rest[4..]))
        }
        9 => {
            let contents = rest.get(..lvt).ok_or_else(|| err("short enumerated"))?;
            let mut v = 0u32;
            for &b in contents {
                v = (v << 8) | u32::from(b);
            }
            Ok((BacnetValue::Enumerated(v), &rest[lvt..]))
        }
        other => Err(err(&format!("unsupported application tag {}", other))),
    }
}

/// Parse a ReadProperty ComplexAck and return the present-value.
pub fn decode_read_property_ack(frame: &[u8], invoke_id: u8) -> Result<BacnetValue, ReadError> {
    let apdu = apdu_of(frame)?;
    let err = |m: &str| ReadError::Protocol(m.to_owned());

    match apdu.first().map(|b| b & 0xF0) {
        Some(PDU_COMPLEX_ACK) => {}
        Some(PDU_ERROR) => return Err(err("device returned Error-PDU")),
        _ => return Err(err("unexpected PDU type")),
    }
    if apdu.get(1) != Some(&invoke_id) {
        return Err(err("invoke id mismatch"));
    }
    if apdu.get(2) != Some(&SERVICE_READ_PROPERTY) {
        return Err(err("unexpected service in ack"));
    }

    // Skip context tags 0 (object id) and 1 (property id), then read the
    // application-tagged value between opening/closing tag 3.
    let mut rest = &apdu[3..];
    // context 0, length 4
    if rest.first() != Some(&0x0C) || rest.len() < 5 {
        return Err(err("missing object identifier"));
    }
    rest = &rest[5..];
    // context 1, short length
    let (&prop_tag, after) = rest.split_first().ok_or_else(|| err("missing property"))?;
    if prop_tag & 0xF8 != 0x18 {
        return Err(err("missing property identifier"));
    }
    let prop_len = (prop_tag & 0x07) as usize;
    rest = after.get(prop_len..).ok_or_else(|| err("short property"))?;

    if rest.first() != Some(&0x3E) {
        return Err(err("missing opening tag"));
    }
    let (value, rest) = read_application_value(&rest[1..])?;
    if rest.first() != Some(&0x3F) {
        return Err(err("missing closing tag"));
    }
    Ok(value)
}

/// Parse a SimpleAck for a given invoke id and service.
pub fn decode_simple_ack(frame: &[u8], invoke_id: u8, service: u8) -> Result<(), ReadError> {
    let apdu = apdu_of(frame)?;
    match apdu.first().map(|b| b & 0xF0) {
        Some(PDU_SIMPLE_ACK)
            if apdu.get(1) == Some(&invoke_id) && apdu.get(2) == Some(&service) =>
        {
            Ok(())
        }
        Some(PDU_ERROR) => Err(ReadError::Protocol("device rejected request".to_owned())),
        _ => Err(ReadError::Protocol("unexpected ack".to_owned())),
    }
}

/// Parse an unconfirmed COV notification; returns (object_id, present_value)
/// when the frame carries one.
pub fn decode_cov_notification(frame: &[u8]) -> Option<(u32, BacnetValue)> {
    let apdu = apdu_of(frame).ok()?;
    if apdu.first()? & 0xF0 != PDU_UNCONFIRMED_REQUEST
        || *apdu.get(1)? != UNCONFIRMED_COV_NOTIFICATION
    {
        return None;
    }

    // context 0: process id, context 1: initiating device, context 2:
    // monitored object, context 3: time remaining, then the list of values.
    let mut rest = &apdu[2..];
    let mut monitored: Option<u32> = None;
    while let Some((&tag, after)) = rest.split_first() {
        // Opening tag 4 starts the property list.
        if tag == 0x4E {
            rest = after;
            break;
        }
        let ctx = tag >> 4;
        let len = (tag & 0x07) as usize;
        let contents = after.get(..len)?;
        if ctx == 2 && len == 4 {
            monitored = Some(u32::from_be_bytes([
                contents[0],
                contents[1],
                contents[2],
                contents[3],
            ]));
        }
        rest = after.get(len..)?;
    }
    let monitored = monitored?;

    // Walk the property list for present-value (property id 85).
    while let Some((&tag, after)) = rest.split_first() {
        if tag == 0x4F {
            break; // closing tag 4
        }
        // context 0: property id
        if tag & 0xF8 != 0x08 {
            return None;
        }
        let len = (tag & 0x07) as usize;
        let prop_contents = after.get(..len)?;
        let mut prop = 0u32;
        for &b in prop_contents {
            prop = (prop << 8) | u32::from(b);
        }
        rest = after.get(len..)?;

        // opening tag 2: value
        if rest.first()? != &0x2E {
            return None;
        }
        let (value, after_value) = read_application_value(&rest[1..]).ok()?;
        if after_value.first()? != &0x2F {
            return None;
        }
        rest = &after_value[1..];

        if prop == PROP_PRESENT_VALUE {
            return Some((monitored, value));
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct CovState {
    subscribed: bool,
    /// Subscription attempts stop after a device rejects COV for the tag.
    rejected: bool,
    expires_s: f64,
    last_value: Option<(f64, f64)>, // (value, received_s)
}

/// One BACnet/IP device.
pub struct BacnetReader {
    device: DeviceConfig,
    socket: Option<UdpSocket>,
    next_invoke_id: u8,
    timeout: Duration,
    started: Instant,
    cov: HashMap<String, CovState>,
    metrics: DeviceMetrics,
}

impl BacnetReader {
    pub fn new(device: DeviceConfig) -> Self {
        let timeout = Duration::from_secs_f64(device.timeout_s);
        BacnetReader {
            device,
            socket: None,
            next_invoke_id: 1,
            timeout,
            started: Instant::now(),
            cov: HashMap::new(),
            metrics: DeviceMetrics::new(),
        }
    }

    fn monotonic_s(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    fn take_invoke_id(&mut self) -> u8 {
        let id = self.next_invoke_id;
        self.next_invoke_id = self.next_invoke_id.wrapping_add(1).max(1);
        id
    }

    async fn transact(&mut self, request: &[u8]) -> Result<Vec<u8>, ReadError> {
        let socket = self.socket.as_ref().ok_or(ReadError::NotConnected)?;
        let io = async {
            socket.send(request).await?;
            let mut buf = [0u8; 1500];
            let n = socket.recv(&mut buf).await?;
            Ok::<_, ReadError>(buf[..n].to_vec())
        };
        tokio::time::timeout(self.timeout, io)
            .await
            .map_err(|_| ReadError::Timeout(self.timeout))?
    }

    /// Drain any queued unconfirmed COV notifications without blocking.
    fn drain_notifications(&mut self) {
        let now_s = self.monotonic_s();
        let mut received: Vec<(u32, BacnetValue)> = Vec::new();
        if let Some(socket) = self.socket.as_ref() {
            let mut buf = [0u8; 1500];
            while let Ok(n) = socket.try_recv(&mut buf) {
                if let Some(hit) = decode_cov_notification(&buf[..n]) {
                    received.push(hit);
                }
            }
        }
        for (oid, value) in received {
            // Match the notification back to the tag by object id.
            for point in &self.device.points {
                if let PointAddress::Bacnet {
                    object, instance, ..
                } = &point.address
                {
                    if object_id(*object, *instance) == oid {
                        self.cov
                            .entry(point.tag.clone())
                            .or_default()
                            .last_value = Some((value.as_f64(), now_s));
                    }
                }
            }
        }
    }

    async fn ensure_subscription(
        &mut self,
        tag: &str,
        object: BacnetObject,
        instance: u32,
        lifetime_s: u32,
    ) {
        let now_s = self.monotonic_s();
        {
            let state = self.cov.entry(tag.to_owned()).or_default();
            if state.rejected {
                return;
            }
            if state.subscribed && now_s + COV_RENEW_MARGIN_S < state.expires_s {
                return;
            }
        }

        let invoke_id = self.take_invoke_id();
        let request = encode_subscribe_cov(invoke_id, object, instance, lifetime_s);
        match self.transact(&request).await {
            Ok(frame) if decode_simple_ack(&frame, invoke_id, SERVICE_SUBSCRIBE_COV).is_ok() => {
                let state = self.cov.entry(tag.to_owned()).or_default();
                state.subscribed = true;
                state.expires_s = now_s + f64::from(lifetime_s);
                debug!(device = %self.device.name, tag, lifetime_s, "COV subscribed");
            }
            Ok(_) | Err(_) => {
                let state = self.cov.entry(tag.to_owned()).or_default();
                state.subscribed = false;
                state.rejected = true;
                warn!(device = %self.device.name, tag,
                    "COV subscribe failed, falling back to polling");
            }
        }
    }
}

#[async_trait]
impl PointReader for BacnetReader {
    fn name(&self) -> &str {
        &self.device.name
    }

    async fn connect(&mut self) -> Result<(), ReadError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket
            .connect((self.device.host.as_str(), self.device.port))
            .await?;
        self.socket = Some(socket);
        // Subscription state does not survive a reconnect.
        for state in self.cov.values_mut() {
            state.subscribed = false;
            state.rejected = false;
        }
        debug!(device = %self.device.name, host = %self.device.host, "bacnet socket ready");
        Ok(())
    }

    async fn read_point(&mut self, point: &PointMapping) -> Result<Reading, ReadError> {
        let (object, instance, use_cov, cov_lifetime_s) = match &point.address {
            PointAddress::Bacnet {
                object,
                instance,
                use_cov,
                cov_lifetime_s,
            } => (*object, *instance, *use_cov, *cov_lifetime_s),
            other => {
                return Err(ReadError::Protocol(format!(
                    "point '{}' is not a BACnet mapping: {:?}",
                    point.tag, other
                )))
            }
        };

        if use_cov {
            self.ensure_subscription(&point.tag, object, instance, cov_lifetime_s)
                .await;
            self.drain_notifications();

            let now_s = self.monotonic_s();
            if let Some((value, received_s)) =
                self.cov.get(&point.tag).and_then(|s| s.last_value)
            {
                if now_s - received_s <= COV_MAX_AGE_S {
                    self.metrics.record_read(0.0);
                    return Ok(Reading::value(value * point.scale + point.offset));
                }
            }
            // No fresh COV data: fall through to a poll.
        }

        let invoke_id = self.take_invoke_id();
        let request = encode_read_property(invoke_id, object, instance);
        let started = Instant::now();
        match self.transact(&request).await {
            Ok(frame) => match decode_read_property_ack(&frame, invoke_id) {
                Ok(value) => {
                    self.metrics
                        .record_read(started.elapsed().as_secs_f64() * 1000.0);
                    Ok(Reading::value(value.as_f64() * point.scale + point.offset))
                }
                Err(e) => {
                    self.metrics.record_error();
                    Err(e)
                }
            },
            Err(e) => {
                self.metrics.record_error();
                Err(e)
            }
        }
    }

    async fn close(&mut self) {
        self.socket = None;
    }

    fn metrics(&self) -> DeviceMetricsSnapshot {
        self.metrics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_id_packs_type_and_instance() {
        // analog-value (2) instance 3 → (2 << 22) | 3
        assert_eq!(object_id(BacnetObject::AnalogValue, 3), (2 << 22) | 3);
        // instance is masked to 22 bits
        assert_eq!(
            object_id(BacnetObject::AnalogInput, 0xFFFF_FFFF),
            0x003F_FFFF
        );
    }

    #[test]
    fn read_property_request_has_expected_layout() {
        let frame = encode_read_property(9, BacnetObject::AnalogInput, 1);
        assert_eq!(frame[0], BVLC_TYPE);
        assert_eq!(frame[1], BVLC_ORIGINAL_UNICAST);
        assert_eq!(u16::from_be_bytes([frame[2], frame[3]]) as usize, frame.len());
        assert_eq!(frame[6], PDU_CONFIRMED_REQUEST);
        assert_eq!(frame[8], 9); // invoke id
        assert_eq!(frame[9], SERVICE_READ_PROPERTY);
        assert_eq!(frame[10], 0x0C); // context 0, object id
        assert_eq!(frame[15], 0x19); // context 1, property id
        assert_eq!(frame[16], PROP_PRESENT_VALUE as u8);
    }

    fn ack_frame(invoke_id: u8, value_bytes: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        push_bvlc_npdu(&mut frame);
        frame.push(PDU_COMPLEX_ACK);
        frame.push(invoke_id);
        frame.push(SERVICE_READ_PROPERTY);
        frame.push(0x0C);
        frame.extend_from_slice(&object_id(BacnetObject::AnalogInput, 1).to_be_bytes());
        frame.push(0x19);
        frame.push(PROP_PRESENT_VALUE as u8);
        frame.push(0x3E);
        frame.extend_from_slice(value_bytes);
        frame.push(0x3F);
        patch_bvlc_length(&mut frame);
        frame
    }

    #[test]
    fn complex_ack_real_value_decodes() {
        let mut value = vec![0x44];
        value.extend_from_slice(&22.5_f32.to_bits().to_be_bytes());
        let frame = ack_frame(7, &value);
        assert_eq!(
            decode_read_property_ack(&frame, 7).unwrap(),
            BacnetValue::Real(22.5)
        );
    }

    #[test]
    fn complex_ack_binary_values_decode() {
        // Enumerated 1 (binary present-value active)
        let frame = ack_frame(3, &[0x91, 0x01]);
        assert_eq!(
            decode_read_property_ack(&frame, 3).unwrap(),
            BacnetValue::Enumerated(1)
        );
    }

    #[test]
    fn invoke_id_mismatch_is_rejected() {
        let mut value = vec![0x44];
        value.extend_from_slice(&1.0_f32.to_bits().to_be_bytes());
        let frame = ack_frame(7, &value);
        assert!(decode_read_property_ack(&frame, 8).is_err());
    }

    #[test]
    fn error_pdu_is_rejected() {
        let mut frame = Vec::new();
        push_bvlc_npdu(&mut frame);
        frame.extend_from_slice(&[PDU_ERROR, 7, SERVICE_READ_PROPERTY, 0x91, 0x02]);
        patch_bvlc_length(&mut frame);
        assert!(decode_read_property_ack(&frame, 7).is_err());
    }

    #[test]
    fn subscribe_cov_simple_ack_round_trip() {
        let request = encode_subscribe_cov(5, BacnetObject::AnalogValue, 3, 300);
        assert_eq!(request[9], SERVICE_SUBSCRIBE_COV);

        let mut ack = Vec::new();
        push_bvlc_npdu(&mut ack);
        ack.extend_from_slice(&[PDU_SIMPLE_ACK, 5, SERVICE_SUBSCRIBE_COV]);
        patch_bvlc_length(&mut ack);
        assert!(decode_simple_ack(&ack, 5, SERVICE_SUBSCRIBE_COV).is_ok());
        assert!(decode_simple_ack(&ack, 6, SERVICE_SUBSCRIBE_COV).is_err());
    }

    #[test]
    fn cov_notification_yields_present_value() {
        let oid = object_id(BacnetObject::AnalogInput, 1);
        let mut frame = Vec::new();
        push_bvlc_npdu(&mut frame);
        frame.push(PDU_UNCONFIRMED_REQUEST);
        frame.push(UNCONFIRMED_COV_NOTIFICATION);
        // context 0: process id
        frame.extend_from_slice(&[0x09, COV_PROCESS_ID]);
        // context 1: initiating device (device object 1234)
        frame.push(0x1C);
        frame.extend_from_slice(&(((8u32) << 22) | 1234).to_be_bytes());
        // context 2: monitored object
        frame.push(0x2C);
        frame.extend_from_slice(&oid.to_be_bytes());
        // context 3: time remaining
        frame.extend_from_slice(&[0x39, 0x78]);
        // property list
        frame.push(0x4E);
        frame.extend_from_slice(&[0x09, PROP_PRESENT_VALUE as u8]); // property id
        frame.push(0x2E);
        frame.push(0x44);
        frame.extend_from_slice(&19.25_f32.to_bits().to_be_bytes());
        frame.push(0x2F);
        frame.push(0x4F);
        patch_bvlc_length(&mut frame);

        let (got_oid, value) = decode_cov_notification(&frame).unwrap();
        assert_eq!(got_oid, oid);
        assert_eq!(value, BacnetValue::Real(19.25));
    }

    #[test]
    fn truncated_frames_never_panic() {
        let frame = encode_read_property(1, BacnetObject::AnalogInput, 1);
        for cut in 0..frame.len() {
            let _ = decode_read_property_ack(&frame[..cut], 1);
            let _ = decode_cov_notification(&frame[..cut]);
        }
    }
}
