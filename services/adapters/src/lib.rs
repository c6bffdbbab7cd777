// adapters: Protocol adapter framework for the MCS edge.
//
// Reads field devices (Modbus TCP, SNMP v2c, BACnet/IP), normalizes the
// readings, evaluates alarm thresholds at source, and publishes telemetry
// and alarm edge events to the local broker.

pub mod alarm_eval;
pub mod bacnet;
pub mod config;
pub mod counter;
pub mod decode;
pub mod modbus;
pub mod poll;
pub mod publish;
pub mod reader;
pub mod snmp;
