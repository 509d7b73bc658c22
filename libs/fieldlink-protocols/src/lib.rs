//! Fieldlink Protocol Implementations
//!
//! Property codecs for the field controller families served by
//! `fieldlink-core`. Each family is feature-gated for selective compilation.
//!
//! # Features
//!
//! - `snmp` - SNMPv1 / BER for MIB-object controllers
//! - `hdlc` - HDLC-like link framer (CRC-16, byte stuffing)
//! - `memory` - memory-mapped serial protocol (ramp meters)
//! - `ascii-hex` - ASCII vehicle-sensor link
//! - `gate-arm` - gate-arm controllers
//! - `matrix` - camera keyboard/matrix switchers
//!
//! # Architecture
//!
//! Every codec implements `fieldlink_core::Property`; the HDLC framer is a
//! `fieldlink_core::LinkCodec` stacked under the SNMP codec with
//! `FramedMessenger`. Which family a link speaks is decided by its
//! `ProtocolKind`.

pub mod checksum;

#[cfg(feature = "snmp")]
pub mod ber;
#[cfg(feature = "snmp")]
pub mod snmp;

#[cfg(feature = "hdlc")]
pub mod hdlc;

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "ascii-hex")]
pub mod ascii_hex;

#[cfg(feature = "gate-arm")]
pub mod gate_arm;

#[cfg(feature = "matrix")]
pub mod matrix;

#[cfg(feature = "hdlc")]
pub use hdlc::HdlcCodec;
#[cfg(feature = "snmp")]
pub use snmp::{MibObject, MibValue, SnmpMessage};
