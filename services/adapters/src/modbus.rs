//! Modbus TCP client.
//!
//! Hand-rolled MBAP framing over a tokio `TcpStream` — only function 3
//! (read holding registers) is needed.  Addresses written as 4xxxx in the
//! point schedule are converted to zero-based wire addresses before the
//! request is built.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::config::{DeviceConfig, PointAddress, PointMapping};
use crate::decode::{decode_registers, register_to_address};
use crate::reader::{DeviceMetrics, DeviceMetricsSnapshot, PointReader, ReadError, Reading};

const FC_READ_HOLDING: u8 = 0x03;
const MBAP_HEADER_LEN: usize = 7;

// ---------------------------------------------------------------------------
// Wire codec (pure)
// ---------------------------------------------------------------------------

/// Build an MBAP + PDU frame for a read-holding-registers request.
pub fn encode_read_holding(tid: u16, unit_id: u8, address: u16, count: u16) -> [u8; 12] {
    let mut frame = [0u8; 12];
    frame[0..2].copy_from_slice(&tid.to_be_bytes());
    // protocol id = 0
    frame[4..6].copy_from_slice(&6u16.to_be_bytes()); // remaining length
    frame[6] = unit_id;
    frame[7] = FC_READ_HOLDING;
    frame[8..10].copy_from_slice(&address.to_be_bytes());
    frame[10..12].copy_from_slice(&count.to_be_bytes());
    frame
}

/// Parse a read-holding-registers response PDU (after the MBAP header).
///
/// Returns the register values or a protocol error for exception responses
/// and malformed frames.
pub fn decode_read_holding_response(pdu: &[u8], expected: u16) -> Result<Vec<u16>, ReadError> {
    if pdu.is_empty() {
        return Err(ReadError::Protocol("empty PDU".to_owned()));
    }
    let function = pdu[0];
    if function == FC_READ_HOLDING | 0x80 {
        let code = pdu.get(1).copied().unwrap_or(0);
        return Err(ReadError::Protocol(format!(
            "modbus exception 0x{:02X}",
            code
        )));
    }
    if function != FC_READ_HOLDING {
        return Err(ReadError::Protocol(format!(
            "unexpected function 0x{:02X}",
            function
        )));
    }

    let byte_count = *pdu
        .get(1)
        .ok_or_else(|| ReadError::Protocol("truncated response".to_owned()))?
        as usize;
    let data = pdu
        .get(2..2 + byte_count)
        .ok_or_else(|| ReadError::Protocol("short register data".to_owned()))?;
    if byte_count != expected as usize * 2 {
        return Err(ReadError::Protocol(format!(
            "expected {} registers, got {} bytes",
            expected, byte_count
        )));
    }

    Ok(data
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect())
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// One Modbus TCP device connection.
pub struct ModbusReader {
    device: DeviceConfig,
    stream: Option<TcpStream>,
    next_tid: u16,
    timeout: Duration,
    metrics: DeviceMetrics,
}

impl ModbusReader {
    pub fn new(device: DeviceConfig) -> Self {
        let timeout = Duration::from_secs_f64(device.timeout_s);
        ModbusReader {
            device,
            stream: None,
            next_tid: 1,
            timeout,
            metrics: DeviceMetrics::new(),
        }
    }

    fn take_tid(&mut self) -> u16 {
        let tid = self.next_tid;
        self.next_tid = self.next_tid.wrapping_add(1).max(1);
        tid
    }

    async fn transact(&mut self, address: u16, count: u16) -> Result<Vec<u16>, ReadError> {
        let timeout = self.timeout;
        let tid = self.take_tid();
        let request = encode_read_holding(tid, self.device.unit_id, address, count);
        let stream = self.stream.as_mut().ok_or(ReadError::NotConnected)?;

        let io = async {
            stream.write_all(&request).await?;

            let mut header = [0u8; MBAP_HEADER_LEN];
            stream.read_exact(&mut header).await?;
            let resp_tid = u16::from_be_bytes([header[0], header[1]]);
            let length = u16::from_be_bytes([header[4], header[5]]) as usize;
            if length < 2 || length > 256 {
                return Err(ReadError::Protocol(format!("bad MBAP length {}", length)));
            }
            // length counts the unit id byte (already read) plus the PDU
            let mut pdu = vec![0u8; length - 1];
            stream.read_exact(&mut pdu).await?;

            if resp_tid != tid {
                return Err(ReadError::Protocol(format!(
                    "transaction id mismatch: sent {}, got {}",
                    tid, resp_tid
                )));
            }
            Ok(pdu)
        };

        let pdu = tokio::time::timeout(timeout, io)
            .await
            .map_err(|_| ReadError::Timeout(timeout))??;
        decode_read_holding_response(&pdu, count)
    }
}

#[async_trait]
impl PointReader for ModbusReader {
    fn name(&self) -> &str {
        &self.device.name
    }

    async fn connect(&mut self) -> Result<(), ReadError> {
        let addr = format!("{}:{}", self.device.host, self.device.port);
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ReadError::Timeout(self.timeout))??;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        debug!(device = %self.device.name, %addr, "modbus connected");
        Ok(())
    }

    async fn read_point(&mut self, point: &PointMapping) -> Result<Reading, ReadError> {
        let (register, data_type) = match &point.address {
            PointAddress::Modbus {
                register,
                data_type,
            } => (*register, *data_type),
            other => {
                return Err(ReadError::Protocol(format!(
                    "point '{}' is not a modbus mapping: {:?}",
                    point.tag, other
                )))
            }
        };

        let address = register_to_address(register);
        let count = data_type.register_count();

        let started = std::time::Instant::now();
        let result = self.transact(address, count).await;
        match result {
            Ok(registers) => {
                self.metrics
                    .record_read(started.elapsed().as_secs_f64() * 1000.0);
                let value = decode_registers(
                    &registers,
                    data_type,
                    self.device.byte_order,
                    point.scale,
                    point.offset,
                )
                .map_err(|e| ReadError::Decode(e.to_string()))?;
                Ok(Reading::value(value))
            }
            Err(e) => {
                self.metrics.record_error();
                if matches!(e, ReadError::Io(_) | ReadError::Timeout(_)) {
                    // Transport is suspect; force a reconnect before the next read.
                    warn!(device = %self.device.name, tag = %point.tag, error = %e,
                        "modbus read failed, dropping connection");
                    self.stream = None;
                }
                Err(e)
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }

    fn metrics(&self) -> DeviceMetricsSnapshot {
        self.metrics.snapshot()
    }
}
