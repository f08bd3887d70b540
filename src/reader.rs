//! Flow reader: drains upstream sockets into client-bound packets

use std::io;
use std::sync::Arc;

use mio::Registry;
use tracing::{debug, warn};

use crate::config::RelayConfig;
use crate::flow::{Flow, FlowKind, InterestSet};
use crate::packet;
use crate::sink::PacketSink;
use crate::stats::RelayStats;

pub struct FlowReader {
    sink: Arc<dyn PacketSink>,
    config: RelayConfig,
    stats: Arc<RelayStats>,
}

impl FlowReader {
    pub fn new(sink: Arc<dyn PacketSink>, config: RelayConfig, stats: Arc<RelayStats>) -> Self {
        Self {
            sink,
            config,
            stats,
        }
    }

    /// Runs one read cycle and re-subscribes READ for the next one
    pub fn read(&self, flow: &mut Flow, registry: &Registry) {
        match flow.kind() {
            FlowKind::Tcp => self.read_tcp(flow),
            FlowKind::Udp => self.read_udp(flow),
        }
        flow.subscribe(InterestSet::READ, registry);
    }

    fn read_tcp(&self, flow: &mut Flow) {
        if flow.is_draining() {
            return;
        }
        let chunk_size = self.config.max_receive_size;
        let mut buf = vec![0u8; chunk_size];
        loop {
            match flow.channel_mut().read_bytes(&mut buf) {
                Ok(0) => {
                    debug!(flow = %flow.key(), "upstream EOF, sending FIN");
                    self.send_fin(flow);
                    flow.begin_draining();
                    break;
                }
                Ok(n) => {
                    flow.touch();
                    // a short read ends the burst and marks the PSH point
                    flow.set_has_received_last_segment(n < chunk_size);
                    flow.push_inbound(&buf[..n]);
                    self.drain_inbound(flow);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                    warn!(flow = %flow.key(), "read from unconnected stream: {e}");
                    break;
                }
                Err(e) => {
                    debug!(flow = %flow.key(), "upstream read failed: {e}");
                    flow.begin_draining();
                    break;
                }
            }
        }
    }

    /// Chunks buffered inbound bytes into data segments sized by the
    /// client MSS. PSH is set on the final segment of a finished burst.
    fn drain_inbound(&self, flow: &mut Flow) {
        while flow.has_inbound() {
            let limit = flow.segment_payload_limit(&self.config);
            let payload = flow.take_inbound(limit);
            let Some((ip, tcp)) = flow.tcp_templates() else {
                warn!(flow = %flow.key(), "no header templates, dropping inbound bytes");
                return;
            };
            let psh = flow.has_received_last_segment() && !flow.has_inbound();
            let segment = packet::build_data_segment(
                &ip,
                &tcp,
                &payload,
                psh,
                flow.recv_sequence(),
                flow.send_next(),
                flow.timestamp_sender(),
                flow.timestamp_reply_to(),
            );
            flow.advance_send_next(payload.len() as u32);
            match self.sink.write_packet(&segment) {
                Ok(()) => self.stats.record_to_client(segment.len()),
                Err(e) => warn!(flow = %flow.key(), "sink rejected segment: {e}"),
            }
        }
    }

    fn send_fin(&self, flow: &mut Flow) {
        let Some((ip, tcp)) = flow.tcp_templates() else {
            return;
        };
        let fin = packet::build_fin(
            &ip,
            &tcp,
            flow.recv_sequence(),
            flow.send_next(),
            flow.timestamp_sender(),
            flow.timestamp_reply_to(),
        );
        match self.sink.write_packet(&fin) {
            Ok(()) => {
                self.stats.record_fin();
                self.stats.record_to_client(fin.len());
            }
            Err(e) => warn!(flow = %flow.key(), "sink rejected FIN: {e}"),
        }
    }

    fn read_udp(&self, flow: &mut Flow) {
        let chunk_size = self.config.max_receive_size;
        let mut buf = vec![0u8; chunk_size];
        while !flow.is_draining() {
            match flow.channel_mut().read_bytes(&mut buf) {
                // Ok(0) is a real empty datagram here, not end-of-stream;
                // it still gets a response and the drain keeps going
                Ok(n) => {
                    flow.touch();
                    let Some((ip, udp)) = flow.udp_templates() else {
                        warn!(flow = %flow.key(), "no header templates, dropping datagram");
                        break;
                    };
                    let response = packet::build_udp_response(&ip, &udp, &buf[..n]);
                    match self.sink.write_packet(&response) {
                        Ok(()) => self.stats.record_to_client(response.len()),
                        Err(e) => warn!(flow = %flow.key(), "sink rejected datagram: {e}"),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                    warn!(flow = %flow.key(), "read from unconnected socket: {e}");
                    break;
                }
                Err(e) => {
                    debug!(flow = %flow.key(), "upstream read failed: {e}");
                    flow.begin_draining();
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::flow::{FlowChannel, FlowKey, FlowState};
    use crate::packet::{
        Ipv4Header, TcpHeader, TransportHeader, UdpHeader, IPPROTO_TCP, IPPROTO_UDP,
        IPV4_HEADER_LEN, TCP_ACK, TCP_FIN, TCP_PSH,
    };
    use crate::sink::BufferSink;
    use mio::net::{TcpListener, TcpStream, UdpSocket};
    use mio::Token;
    use proptest::prelude::*;
    use std::net::Ipv4Addr;

    fn templates(mss: u16) -> (Ipv4Header, TcpHeader) {
        let ip = Ipv4Header {
            header_len: IPV4_HEADER_LEN,
            type_of_service: 0,
            total_length: 40,
            identification: 1,
            flags_and_fragment: 0x4000,
            ttl: 64,
            protocol: IPPROTO_TCP,
            source: Ipv4Addr::new(10, 0, 0, 2),
            destination: Ipv4Addr::new(10, 0, 0, 1),
        };
        let tcp = TcpHeader {
            source_port: 40000,
            destination_port: 8080,
            sequence: 500,
            acknowledgment: 0,
            data_offset: 5,
            flags: TCP_ACK,
            window: 65535,
            urgent_pointer: 0,
            max_segment_size: mss,
            timestamp_sender: 0,
            timestamp_reply_to: 0,
        };
        (ip, tcp)
    }

    // listener kept alive so the connect does not fail under us
    fn tcp_flow(mss: u16) -> (mio::net::TcpListener, Flow) {
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let key = FlowKey {
            kind: FlowKind::Tcp,
            source: "10.0.0.2:40000".parse().unwrap(),
            destination: "10.0.0.1:8080".parse().unwrap(),
        };
        let mut flow = Flow::new(Token(1), key, FlowChannel::Tcp(stream), FlowState::Connected);
        let (ip, tcp) = templates(mss);
        flow.set_max_segment_size(mss);
        flow.set_recv_sequence(501);
        flow.update_templates(ip, TransportHeader::Tcp(tcp));
        (listener, flow)
    }

    fn reader(sink: Arc<BufferSink>) -> FlowReader {
        FlowReader::new(sink, RelayConfig::default(), Arc::new(RelayStats::new()))
    }

    fn payload_of(packet: &[u8]) -> &[u8] {
        let tcp_len = usize::from(packet[32] >> 4) * 4;
        &packet[IPV4_HEADER_LEN + tcp_len..]
    }

    #[test]
    fn burst_is_chunked_and_psh_marks_the_last_segment() {
        let sink = Arc::new(BufferSink::new());
        let (_listener, mut flow) = tcp_flow(160); // 100-byte segments
        flow.set_has_received_last_segment(true);
        flow.push_inbound(&[7u8; 250]);
        reader(sink.clone()).drain_inbound(&mut flow);

        let packets = sink.drain();
        assert_eq!(packets.len(), 3);
        assert_eq!(payload_of(&packets[0]).len(), 100);
        assert_eq!(payload_of(&packets[1]).len(), 100);
        assert_eq!(payload_of(&packets[2]).len(), 50);
        assert_eq!(packets[0][33] & TCP_PSH, 0);
        assert_eq!(packets[1][33] & TCP_PSH, 0);
        assert_eq!(packets[2][33] & TCP_PSH, TCP_PSH);
    }

    #[test]
    fn psh_withheld_while_more_data_is_expected() {
        let sink = Arc::new(BufferSink::new());
        let (_listener, mut flow) = tcp_flow(160);
        flow.set_has_received_last_segment(false);
        flow.push_inbound(&[7u8; 50]);
        reader(sink.clone()).drain_inbound(&mut flow);

        let packets = sink.drain();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0][33] & TCP_PSH, 0);
    }

    #[test]
    fn sequence_numbers_advance_by_payload_length() {
        let sink = Arc::new(BufferSink::new());
        let (_listener, mut flow) = tcp_flow(160);
        flow.push_inbound(&[1u8; 230]);
        reader(sink.clone()).drain_inbound(&mut flow);

        let packets = sink.drain();
        let seq =
            |p: &[u8]| u32::from_be_bytes([p[24], p[25], p[26], p[27]]);
        assert_eq!(seq(&packets[0]), 0);
        assert_eq!(seq(&packets[1]), 100);
        assert_eq!(seq(&packets[2]), 200);
        assert_eq!(flow.send_next(), 230);
    }

    #[test]
    fn eof_emits_exactly_one_fin_and_drains_the_flow() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        drop(server); // upstream closes, relay side sees EOF

        client.set_nonblocking(true).unwrap();
        let stream = TcpStream::from_std(client);
        let key = FlowKey {
            kind: FlowKind::Tcp,
            source: "10.0.0.2:40000".parse().unwrap(),
            destination: "10.0.0.1:8080".parse().unwrap(),
        };
        let mut flow = Flow::new(Token(1), key, FlowChannel::Tcp(stream), FlowState::Connected);
        let (ip, tcp) = templates(1460);
        flow.set_recv_sequence(501);
        flow.update_templates(ip, TransportHeader::Tcp(tcp));

        // wait until the close is visible to the reader
        std::thread::sleep(std::time::Duration::from_millis(50));

        let sink = Arc::new(BufferSink::new());
        reader(sink.clone()).read_tcp(&mut flow);

        let packets = sink.drain();
        let fins: Vec<_> = packets
            .iter()
            .filter(|p| p[33] & TCP_FIN == TCP_FIN)
            .collect();
        assert_eq!(fins.len(), 1);
        assert!(flow.is_draining());
    }

    #[test]
    fn every_udp_datagram_gets_a_response_even_when_empty() {
        let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let local = socket.local_addr().unwrap();
        socket.connect(peer.local_addr().unwrap()).unwrap();
        peer.send_to(b"", local).unwrap();
        peer.send_to(b"data", local).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));

        let key = FlowKey {
            kind: FlowKind::Udp,
            source: "10.0.0.2:50000".parse().unwrap(),
            destination: "10.0.0.1:53".parse().unwrap(),
        };
        let mut flow = Flow::new(Token(1), key, FlowChannel::Udp(socket), FlowState::Connected);
        let ip = Ipv4Header {
            protocol: IPPROTO_UDP,
            ..templates(0).0
        };
        let udp = UdpHeader {
            source_port: 50000,
            destination_port: 53,
            length: 8,
            checksum: 0,
        };
        flow.update_templates(ip, TransportHeader::Udp(udp));

        let sink = Arc::new(BufferSink::new());
        reader(sink.clone()).read_udp(&mut flow);

        let packets = sink.drain();
        assert_eq!(packets.len(), 2);
        // empty datagram yields a header-only response
        assert_eq!(packets[0].len(), 28);
        assert_eq!(u16::from_be_bytes([packets[0][24], packets[0][25]]), 8);
        assert_eq!(&packets[1][28..], b"data");
        assert!(!flow.is_draining());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn chunking_reassembles_to_the_original_bytes(
            data in proptest::collection::vec(any::<u8>(), 1..4096),
            mss in 0u16..2000,
        ) {
            let sink = Arc::new(BufferSink::new());
            let (_listener, mut flow) = tcp_flow(mss);
            flow.set_has_received_last_segment(true);
            flow.push_inbound(&data);
            reader(sink.clone()).drain_inbound(&mut flow);

            let packets = sink.drain();
            let config = RelayConfig::default();
            let limit = flow.segment_payload_limit(&config);
            let expected = (data.len() + limit - 1) / limit;
            prop_assert_eq!(packets.len(), expected);

            let mut reassembled = Vec::new();
            for p in &packets {
                reassembled.extend_from_slice(payload_of(p));
            }
            prop_assert_eq!(reassembled, data.clone());
            prop_assert_eq!(flow.send_next() as usize, data.len());
        }
    }
}
