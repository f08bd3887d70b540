//! ICMP echo packet parsing and reply synthesis

use bytes::{BufMut, BytesMut};

use crate::checksum;
use crate::error::{RelayError, Result};

pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_DESTINATION_UNREACHABLE: u8 = 3;
pub const ICMP_ECHO_REQUEST: u8 = 8;

const ICMP_HEADER_LEN: usize = 8;

/// Decoded ICMP packet. Only echo request/reply are fully understood;
/// other types keep their raw trailing bytes in `data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpPacket {
    pub packet_type: u8,
    pub code: u8,
    pub checksum: u16,
    pub identifier: u16,
    pub sequence_number: u16,
    pub data: Vec<u8>,
}

impl IcmpPacket {
    pub fn is_echo(&self) -> bool {
        self.packet_type == ICMP_ECHO_REQUEST || self.packet_type == ICMP_ECHO_REPLY
    }
}

/// Parses an ICMP body (the bytes following the IP header)
pub fn parse(data: &[u8]) -> Result<IcmpPacket> {
    if data.len() < ICMP_HEADER_LEN {
        return Err(RelayError::PacketTooShort {
            expected: ICMP_HEADER_LEN,
            actual: data.len(),
        });
    }
    Ok(IcmpPacket {
        packet_type: data[0],
        code: data[1],
        checksum: u16::from_be_bytes([data[2], data[3]]),
        identifier: u16::from_be_bytes([data[4], data[5]]),
        sequence_number: u16::from_be_bytes([data[6], data[7]]),
        data: data[ICMP_HEADER_LEN..].to_vec(),
    })
}

/// Echo reply mirroring the request's identifier, sequence and payload
pub fn build_echo_reply(request: &IcmpPacket) -> IcmpPacket {
    IcmpPacket {
        packet_type: ICMP_ECHO_REPLY,
        code: 0,
        checksum: 0,
        identifier: request.identifier,
        sequence_number: request.sequence_number,
        data: request.data.clone(),
    }
}

/// Serializes an echo packet after the given raw IP header bytes. The
/// ICMP checksum is computed over the body and patched in place.
pub fn serialize(ip_header: &[u8], packet: &IcmpPacket) -> Result<BytesMut> {
    if !packet.is_echo() {
        return Err(RelayError::UnsupportedIcmpType(packet.packet_type));
    }
    let body_start = ip_header.len();
    let mut buf = BytesMut::with_capacity(body_start + ICMP_HEADER_LEN + packet.data.len());
    buf.put_slice(ip_header);
    buf.put_u8(packet.packet_type);
    buf.put_u8(packet.code);
    buf.put_u16(0);
    buf.put_u16(packet.identifier);
    buf.put_u16(packet.sequence_number);
    buf.put_slice(&packet.data);

    let csum = checksum::checksum(&buf[body_start..]);
    buf[body_start + 2..body_start + 4].copy_from_slice(&csum.to_be_bytes());
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_request() -> IcmpPacket {
        IcmpPacket {
            packet_type: ICMP_ECHO_REQUEST,
            code: 0,
            checksum: 0x1234,
            identifier: 0xbeef,
            sequence_number: 7,
            data: vec![1, 2, 3, 4, 5],
        }
    }

    #[test]
    fn parse_round_trips_reply_fields() {
        let reply = build_echo_reply(&echo_request());
        let buf = serialize(&[0u8; 20], &reply).unwrap();
        let parsed = parse(&buf[20..]).unwrap();
        assert_eq!(parsed.packet_type, ICMP_ECHO_REPLY);
        assert_eq!(parsed.identifier, 0xbeef);
        assert_eq!(parsed.sequence_number, 7);
        assert_eq!(parsed.data, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn serialized_body_sums_to_zero() {
        let reply = build_echo_reply(&echo_request());
        let buf = serialize(&[0u8; 20], &reply).unwrap();
        assert_eq!(checksum::checksum(&buf[20..]), 0);
    }

    #[test]
    fn non_echo_types_refuse_to_serialize() {
        let mut packet = echo_request();
        packet.packet_type = ICMP_DESTINATION_UNREACHABLE;
        assert!(matches!(
            serialize(&[0u8; 20], &packet),
            Err(RelayError::UnsupportedIcmpType(ICMP_DESTINATION_UNREACHABLE))
        ));
    }

    #[test]
    fn parse_rejects_truncated_body() {
        assert!(matches!(
            parse(&[8, 0, 0]),
            Err(RelayError::PacketTooShort { .. })
        ));
    }
}
