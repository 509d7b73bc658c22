//! Frame checksums used by the serial protocol families

use fieldlink_core::{CommError, Result};

/// Byte-wise XOR
pub fn xor8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc ^ b)
}

/// Additive sum modulo 256
pub fn sum8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Two's complement of the additive sum; frame plus checksum sums to zero
pub fn twos_complement8(data: &[u8]) -> u8 {
    sum8(data).wrapping_neg()
}

/// Additive sum modulo 65536
pub fn sum16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)))
}

/// CRC-16 with polynomial 0x8005, reflected, initial value 0xFFFF
#[cfg(feature = "hdlc")]
pub fn crc16(data: &[u8]) -> u16 {
    use crc::{Crc, CRC_16_MODBUS};

    const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);
    CRC16.checksum(data)
}

/// Compare a received checksum against the computed one
pub fn verify(computed: u32, received: u32) -> Result<()> {
    if computed == received {
        Ok(())
    } else {
        Err(CommError::checksum(computed, received))
    }
}
