//! IPv4/TCP/UDP header codec and response packet factories
//!
//! Flows keep the most recent client headers as templates. Every packet
//! going back to the client is synthesized here by flipping the template
//! direction, filling in sequence state and recomputing checksums.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, Ordering};

use bytes::{BufMut, BytesMut};

use crate::checksum;
use crate::error::{RelayError, Result};

pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_RST: u8 = 0x04;
pub const TCP_PSH: u8 = 0x08;
pub const TCP_ACK: u8 = 0x10;
pub const TCP_URG: u8 = 0x20;

const OPT_END: u8 = 0;
const OPT_NOP: u8 = 1;
const OPT_MSS: u8 = 2;
const OPT_TIMESTAMP: u8 = 8;
const TIMESTAMP_OPTION_LEN: usize = 12;

static PACKET_ID: AtomicU16 = AtomicU16::new(1);

fn next_packet_id() -> u16 {
    PACKET_ID.fetch_add(1, Ordering::Relaxed)
}

/// Parsed IPv4 header, options dropped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    pub header_len: usize,
    pub type_of_service: u8,
    pub total_length: u16,
    pub identification: u16,
    pub flags_and_fragment: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
}

impl Ipv4Header {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < IPV4_HEADER_LEN {
            return Err(RelayError::PacketTooShort {
                expected: IPV4_HEADER_LEN,
                actual: data.len(),
            });
        }
        let version = data[0] >> 4;
        if version != 4 {
            return Err(RelayError::InvalidIpVersion(version));
        }
        let header_len = usize::from(data[0] & 0x0f) * 4;
        if header_len < IPV4_HEADER_LEN || data.len() < header_len {
            return Err(RelayError::InvalidPacket(format!(
                "bad IPv4 header length {header_len}"
            )));
        }
        Ok(Self {
            header_len,
            type_of_service: data[1],
            total_length: u16::from_be_bytes([data[2], data[3]]),
            identification: u16::from_be_bytes([data[4], data[5]]),
            flags_and_fragment: u16::from_be_bytes([data[6], data[7]]),
            ttl: data[8],
            protocol: data[9],
            source: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            destination: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
        })
    }

    /// Template for the reverse direction. Options are never replayed,
    /// so the synthesized header is always 20 bytes.
    pub fn flipped(&self) -> Self {
        Self {
            header_len: IPV4_HEADER_LEN,
            identification: next_packet_id(),
            source: self.destination,
            destination: self.source,
            ..self.clone()
        }
    }
}

/// Writes a 20-byte IPv4 header with its checksum patched in
fn put_ipv4_header(buf: &mut BytesMut, ip: &Ipv4Header) {
    let start = buf.len();
    buf.put_u8(0x45);
    buf.put_u8(ip.type_of_service);
    buf.put_u16(ip.total_length);
    buf.put_u16(ip.identification);
    buf.put_u16(ip.flags_and_fragment);
    buf.put_u8(ip.ttl);
    buf.put_u8(ip.protocol);
    buf.put_u16(0);
    buf.put_slice(&ip.source.octets());
    buf.put_slice(&ip.destination.octets());
    let csum = checksum::checksum(&buf[start..start + IPV4_HEADER_LEN]);
    buf[start + 10..start + 12].copy_from_slice(&csum.to_be_bytes());
}

/// Standalone 20-byte IPv4 header with its checksum filled in
pub fn serialize_ipv4_header(ip: &Ipv4Header) -> BytesMut {
    let mut buf = BytesMut::with_capacity(IPV4_HEADER_LEN);
    put_ipv4_header(&mut buf, ip);
    buf
}

/// Parsed TCP header with the options the relay cares about lifted out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence: u32,
    pub acknowledgment: u32,
    pub data_offset: u8,
    pub flags: u8,
    pub window: u16,
    pub urgent_pointer: u16,
    pub max_segment_size: u16,
    pub timestamp_sender: u32,
    pub timestamp_reply_to: u32,
}

impl TcpHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < TCP_HEADER_LEN {
            return Err(RelayError::PacketTooShort {
                expected: TCP_HEADER_LEN,
                actual: data.len(),
            });
        }
        let data_offset = data[12] >> 4;
        let header_len = usize::from(data_offset) * 4;
        if header_len < TCP_HEADER_LEN || data.len() < header_len {
            return Err(RelayError::InvalidPacket(format!(
                "bad TCP data offset {data_offset}"
            )));
        }
        let mut header = Self {
            source_port: u16::from_be_bytes([data[0], data[1]]),
            destination_port: u16::from_be_bytes([data[2], data[3]]),
            sequence: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            acknowledgment: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            data_offset,
            flags: data[13],
            window: u16::from_be_bytes([data[14], data[15]]),
            urgent_pointer: u16::from_be_bytes([data[18], data[19]]),
            max_segment_size: 0,
            timestamp_sender: 0,
            timestamp_reply_to: 0,
        };
        header.parse_options(&data[TCP_HEADER_LEN..header_len]);
        Ok(header)
    }

    fn parse_options(&mut self, options: &[u8]) {
        let mut i = 0;
        while i < options.len() {
            let kind = options[i];
            match kind {
                OPT_END => break,
                OPT_NOP => {
                    i += 1;
                    continue;
                }
                _ => {}
            }
            if i + 1 >= options.len() {
                break;
            }
            let len = usize::from(options[i + 1]);
            if len < 2 || i + len > options.len() {
                break;
            }
            match kind {
                OPT_MSS if len == 4 => {
                    self.max_segment_size = u16::from_be_bytes([options[i + 2], options[i + 3]]);
                }
                OPT_TIMESTAMP if len == 10 => {
                    self.timestamp_sender = u32::from_be_bytes([
                        options[i + 2],
                        options[i + 3],
                        options[i + 4],
                        options[i + 5],
                    ]);
                    self.timestamp_reply_to = u32::from_be_bytes([
                        options[i + 6],
                        options[i + 7],
                        options[i + 8],
                        options[i + 9],
                    ]);
                }
                _ => {}
            }
            i += len;
        }
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn payload_offset(&self) -> usize {
        usize::from(self.data_offset) * 4
    }
}

/// Parsed 8-byte UDP header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub length: u16,
    pub checksum: u16,
}

impl UdpHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < UDP_HEADER_LEN {
            return Err(RelayError::PacketTooShort {
                expected: UDP_HEADER_LEN,
                actual: data.len(),
            });
        }
        Ok(Self {
            source_port: u16::from_be_bytes([data[0], data[1]]),
            destination_port: u16::from_be_bytes([data[2], data[3]]),
            length: u16::from_be_bytes([data[4], data[5]]),
            checksum: u16::from_be_bytes([data[6], data[7]]),
        })
    }
}

/// Transport header template kept on a flow
#[derive(Debug, Clone)]
pub enum TransportHeader {
    Tcp(TcpHeader),
    Udp(UdpHeader),
}

fn build_tcp(
    ip: &Ipv4Header,
    tcp: &TcpHeader,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
    timestamps: Option<(u32, u32)>,
    payload: &[u8],
) -> BytesMut {
    let options_len = if timestamps.is_some() {
        TIMESTAMP_OPTION_LEN
    } else {
        0
    };
    let tcp_len = TCP_HEADER_LEN + options_len;
    let total = IPV4_HEADER_LEN + tcp_len + payload.len();

    let mut ip_out = ip.flipped();
    ip_out.total_length = total as u16;

    let mut buf = BytesMut::with_capacity(total);
    put_ipv4_header(&mut buf, &ip_out);

    let tcp_start = buf.len();
    buf.put_u16(tcp.destination_port);
    buf.put_u16(tcp.source_port);
    buf.put_u32(seq);
    buf.put_u32(ack);
    buf.put_u8(((tcp_len / 4) as u8) << 4);
    buf.put_u8(flags);
    buf.put_u16(window);
    buf.put_u16(0);
    buf.put_u16(0);
    if let Some((ts_val, ts_ecr)) = timestamps {
        buf.put_u8(OPT_NOP);
        buf.put_u8(OPT_NOP);
        buf.put_u8(OPT_TIMESTAMP);
        buf.put_u8(10);
        buf.put_u32(ts_val);
        buf.put_u32(ts_ecr);
    }
    buf.put_slice(payload);

    let csum = checksum::transport_checksum(
        IPPROTO_TCP,
        ip_out.source,
        ip_out.destination,
        &buf[tcp_start..],
    );
    buf[tcp_start + 16..tcp_start + 18].copy_from_slice(&csum.to_be_bytes());
    buf
}

fn timestamps_or_none(ts_sender: u32, ts_reply_to: u32) -> Option<(u32, u32)> {
    if ts_sender == 0 && ts_reply_to == 0 {
        None
    } else {
        Some((ts_sender, ts_reply_to))
    }
}

/// Data-bearing ACK segment carrying upstream bytes back to the client.
/// `psh` marks the final segment of a burst.
pub fn build_data_segment(
    ip: &Ipv4Header,
    tcp: &TcpHeader,
    payload: &[u8],
    psh: bool,
    ack: u32,
    seq: u32,
    ts_sender: u32,
    ts_reply_to: u32,
) -> BytesMut {
    let mut flags = TCP_ACK;
    if psh {
        flags |= TCP_PSH;
    }
    build_tcp(
        ip,
        tcp,
        seq,
        ack,
        flags,
        tcp.window,
        timestamps_or_none(ts_sender, ts_reply_to),
        payload,
    )
}

/// FIN+ACK announcing upstream EOF to the client
pub fn build_fin(
    ip: &Ipv4Header,
    tcp: &TcpHeader,
    ack: u32,
    seq: u32,
    ts_sender: u32,
    ts_reply_to: u32,
) -> BytesMut {
    build_tcp(
        ip,
        tcp,
        seq,
        ack,
        TCP_ACK | TCP_FIN,
        0,
        timestamps_or_none(ts_sender, ts_reply_to),
        &[],
    )
}

/// RST tearing the client-side session down. If the template carries an
/// acknowledgment number the reset is sequenced from it, otherwise the
/// acknowledgment is derived from the template sequence plus `sequence`.
pub fn build_rst(ip: &Ipv4Header, tcp: &TcpHeader, sequence: u32) -> BytesMut {
    let (seq, ack) = if tcp.acknowledgment > 0 {
        (tcp.acknowledgment, 0)
    } else {
        (0, tcp.sequence.wrapping_add(sequence))
    };
    build_tcp(ip, tcp, seq, ack, TCP_RST, 0, None, &[])
}

/// UDP datagram carrying an upstream payload back to the client.
/// The UDP checksum is left zero, which IPv4 permits.
pub fn build_udp_response(ip: &Ipv4Header, udp: &UdpHeader, payload: &[u8]) -> BytesMut {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let total = IPV4_HEADER_LEN + udp_len;

    let mut ip_out = ip.flipped();
    ip_out.total_length = total as u16;

    let mut buf = BytesMut::with_capacity(total);
    put_ipv4_header(&mut buf, &ip_out);
    buf.put_u16(udp.destination_port);
    buf.put_u16(udp.source_port);
    buf.put_u16(udp_len as u16);
    buf.put_u16(0);
    buf.put_slice(payload);
    buf
}
