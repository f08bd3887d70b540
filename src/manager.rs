//! Flow table management: creation, client-byte ingress, teardown

use std::net::SocketAddr;
use std::sync::Arc;

use mio::net::{TcpStream, UdpSocket};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::event_loop::EventLoop;
use crate::flow::{Flow, FlowArena, FlowChannel, FlowKey, FlowKind, FlowState, InterestSet};
use crate::icmp::{self, ICMP_ECHO_REQUEST};
use crate::packet::{
    self, Ipv4Header, TcpHeader, TransportHeader, UdpHeader, IPPROTO_ICMP, IPV4_HEADER_LEN,
};
use crate::sink::PacketSink;
use crate::stats::RelayStats;

/// Fallback MSS when the client SYN carried no MSS option
const DEFAULT_MSS: u16 = 1460;

/// ICMP type/code/checksum/identifier/sequence
const ICMP_HEADER_LEN: usize = 8;

pub struct FlowManager {
    arena: Arc<FlowArena>,
    event_loop: Arc<EventLoop>,
    sink: Arc<dyn PacketSink>,
    config: RelayConfig,
    stats: Arc<RelayStats>,
}

impl FlowManager {
    pub fn new(
        arena: Arc<FlowArena>,
        event_loop: Arc<EventLoop>,
        sink: Arc<dyn PacketSink>,
        config: RelayConfig,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            arena,
            event_loop,
            sink,
            config,
            stats,
        }
    }

    pub fn lookup(&self, key: &FlowKey) -> Option<Arc<Mutex<Flow>>> {
        self.arena.get_by_key(key)
    }

    pub fn flow_count(&self) -> usize {
        self.arena.len()
    }

    /// Opens the upstream TCP connection for a client session and
    /// registers it. Returns the existing flow when the 4-tuple is
    /// already tracked.
    pub fn open_tcp_flow(&self, ip: &Ipv4Header, tcp: &TcpHeader) -> Result<Arc<Mutex<Flow>>> {
        let key = FlowKey {
            kind: FlowKind::Tcp,
            source: SocketAddr::new(ip.source.into(), tcp.source_port),
            destination: SocketAddr::new(ip.destination.into(), tcp.destination_port),
        };
        if let Some(existing) = self.arena.get_by_key(&key) {
            return Ok(existing);
        }

        let stream = TcpStream::connect(key.destination)?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(flow = %key, "set_nodelay failed: {e}");
        }

        let token = self.arena.alloc_token();
        let mut flow = Flow::new(token, key, FlowChannel::Tcp(stream), FlowState::Connecting);
        flow.set_max_segment_size(if tcp.max_segment_size > 0 {
            tcp.max_segment_size
        } else {
            DEFAULT_MSS
        });
        // the SYN consumes one sequence number
        flow.set_recv_sequence(tcp.sequence.wrapping_add(1));
        flow.set_timestamps(tcp.timestamp_sender, tcp.timestamp_reply_to);
        flow.update_templates(ip.clone(), TransportHeader::Tcp(tcp.clone()));

        let flow = Arc::new(Mutex::new(flow));
        self.arena.insert(token, key, flow.clone());
        if let Err(e) = self.event_loop.register_flow(&flow) {
            self.arena.remove(token, &key);
            return Err(e);
        }
        self.stats.record_flow_opened();
        info!(flow = %key, "opened TCP flow");
        Ok(flow)
    }

    /// Opens and connects the upstream UDP socket for a client session.
    /// UDP flows are connected from the start.
    pub fn open_udp_flow(&self, ip: &Ipv4Header, udp: &UdpHeader) -> Result<Arc<Mutex<Flow>>> {
        let key = FlowKey {
            kind: FlowKind::Udp,
            source: SocketAddr::new(ip.source.into(), udp.source_port),
            destination: SocketAddr::new(ip.destination.into(), udp.destination_port),
        };
        if let Some(existing) = self.arena.get_by_key(&key) {
            return Ok(existing);
        }

        let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0)))?;
        socket.connect(key.destination)?;

        let token = self.arena.alloc_token();
        let mut flow = Flow::new(token, key, FlowChannel::Udp(socket), FlowState::Connected);
        flow.update_templates(ip.clone(), TransportHeader::Udp(udp.clone()));

        let flow = Arc::new(Mutex::new(flow));
        self.arena.insert(token, key, flow.clone());
        if let Err(e) = self.event_loop.register_flow(&flow) {
            self.arena.remove(token, &key);
            return Err(e);
        }
        self.stats.record_flow_opened();
        info!(flow = %key, "opened UDP flow");
        Ok(flow)
    }

    /// Ingests one client packet for an open flow: refreshes the header
    /// templates and sequence state, queues the payload for the writer
    /// and wakes the poller.
    pub fn push_client_bytes(
        &self,
        flow: &Arc<Mutex<Flow>>,
        ip: &Ipv4Header,
        transport: &TransportHeader,
        payload: &[u8],
    ) -> Result<()> {
        {
            let mut f = flow.lock();
            f.update_templates(ip.clone(), transport.clone());
            if let TransportHeader::Tcp(tcp) = transport {
                f.set_recv_sequence(tcp.sequence.wrapping_add(payload.len() as u32));
                f.set_timestamps(tcp.timestamp_sender, tcp.timestamp_reply_to);
            }
            if !payload.is_empty() {
                f.push_outbound(payload);
                f.set_send_ready(true);
                f.subscribe(InterestSet::WRITE, self.event_loop.registry());
                self.stats.record_to_upstream(payload.len());
            }
        }
        self.event_loop.refresh_select();
        Ok(())
    }

    /// Removes a flow from the table and closes it
    pub fn close_flow(&self, flow: &Arc<Mutex<Flow>>) {
        let (token, key) = {
            let f = flow.lock();
            (f.token(), f.key())
        };
        self.arena.remove(token, &key);
        self.event_loop.deregister_flow(flow);
        debug!(flow = %key, "closed flow");
    }

    /// Answers an ICMP echo request with a synthesized echo reply.
    /// No flow is tracked; echoes are answered locally.
    pub fn handle_icmp_echo(&self, packet_bytes: &[u8]) -> Result<()> {
        let ip = Ipv4Header::parse(packet_bytes)?;
        if ip.protocol != IPPROTO_ICMP {
            return Err(RelayError::InvalidPacket(format!(
                "protocol {} is not ICMP",
                ip.protocol
            )));
        }
        let request = icmp::parse(&packet_bytes[ip.header_len..])?;
        if request.packet_type != ICMP_ECHO_REQUEST {
            return Err(RelayError::UnsupportedIcmpType(request.packet_type));
        }
        let reply = icmp::build_echo_reply(&request);
        let mut ip_out = ip.flipped();
        ip_out.total_length = (IPV4_HEADER_LEN + ICMP_HEADER_LEN + reply.data.len()) as u16;
        let header = packet::serialize_ipv4_header(&ip_out);
        let response = icmp::serialize(&header, &reply)?;
        self.sink.write_packet(&response)?;
        self.stats.record_echo_reply();
        self.stats.record_to_client(response.len());
        Ok(())
    }

    /// Sweeps flows idle longer than the configured timeout
    pub fn sweep_idle(&self) -> usize {
        let timeout = self.config.idle_timeout;
        let stale: Vec<_> = self
            .arena
            .snapshot()
            .into_iter()
            .filter(|f| f.lock().is_idle(timeout))
            .collect();
        let count = stale.len();
        for flow in stale {
            self.close_flow(&flow);
        }
        if count > 0 {
            warn!("swept {count} idle flows");
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{IPPROTO_TCP, IPPROTO_UDP, IPV4_HEADER_LEN, TCP_SYN};
    use crate::sink::BufferSink;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn manager(config: RelayConfig) -> (Arc<BufferSink>, FlowManager) {
        let arena = Arc::new(FlowArena::new());
        let stats = Arc::new(RelayStats::new());
        let sink = Arc::new(BufferSink::new());
        let event_loop = Arc::new(
            EventLoop::new(config.clone(), arena.clone(), sink.clone(), stats.clone()).unwrap(),
        );
        let manager = FlowManager::new(arena, event_loop, sink.clone(), config, stats);
        (sink, manager)
    }

    fn syn_headers(destination: SocketAddr) -> (Ipv4Header, TcpHeader) {
        let dest_ip = match destination.ip() {
            std::net::IpAddr::V4(v4) => v4,
            _ => panic!("ipv4 test addresses only"),
        };
        let ip = Ipv4Header {
            header_len: IPV4_HEADER_LEN,
            type_of_service: 0,
            total_length: 40,
            identification: 1,
            flags_and_fragment: 0x4000,
            ttl: 64,
            protocol: IPPROTO_TCP,
            source: Ipv4Addr::new(10, 0, 0, 2),
            destination: dest_ip,
        };
        let tcp = TcpHeader {
            source_port: 40000,
            destination_port: destination.port(),
            sequence: 1000,
            acknowledgment: 0,
            data_offset: 5,
            flags: TCP_SYN,
            window: 65535,
            urgent_pointer: 0,
            max_segment_size: 1400,
            timestamp_sender: 0,
            timestamp_reply_to: 0,
        };
        (ip, tcp)
    }

    #[test]
    fn tcp_flow_creation_is_idempotent_per_tuple() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (_sink, m) = manager(RelayConfig::default());
        let (ip, tcp) = syn_headers(addr);

        let first = m.open_tcp_flow(&ip, &tcp).unwrap();
        let second = m.open_tcp_flow(&ip, &tcp).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(m.flow_count(), 1);

        let f = first.lock();
        assert_eq!(f.state(), FlowState::Connecting);
        assert_eq!(f.recv_sequence(), 1001);
        assert_eq!(f.max_segment_size(), 1400);
        assert!(f.interest().contains(InterestSet::CONNECT));
    }

    #[test]
    fn udp_flow_starts_connected_watching_read() {
        let target = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = target.local_addr().unwrap();
        let (_sink, m) = manager(RelayConfig::default());

        let ip = Ipv4Header {
            header_len: IPV4_HEADER_LEN,
            type_of_service: 0,
            total_length: 32,
            identification: 1,
            flags_and_fragment: 0x4000,
            ttl: 64,
            protocol: IPPROTO_UDP,
            source: Ipv4Addr::new(10, 0, 0, 2),
            destination: Ipv4Addr::new(127, 0, 0, 1),
        };
        let udp = UdpHeader {
            source_port: 50000,
            destination_port: addr.port(),
            length: 12,
            checksum: 0,
        };
        let flow = m.open_udp_flow(&ip, &udp).unwrap();
        let f = flow.lock();
        assert_eq!(f.state(), FlowState::Connected);
        assert!(f.interest().contains(InterestSet::READ));
    }

    #[test]
    fn push_client_bytes_queues_and_requests_write() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (_sink, m) = manager(RelayConfig::default());
        let (ip, mut tcp) = syn_headers(addr);

        let flow = m.open_tcp_flow(&ip, &tcp).unwrap();
        tcp.flags = crate::packet::TCP_ACK;
        tcp.sequence = 1001;
        m.push_client_bytes(&flow, &ip, &TransportHeader::Tcp(tcp.clone()), b"hello")
            .unwrap();

        let f = flow.lock();
        assert!(f.send_ready());
        assert!(f.has_outbound());
        assert!(f.interest().contains(InterestSet::WRITE));
        assert_eq!(f.recv_sequence(), 1006);
    }

    #[test]
    fn icmp_echo_request_gets_a_checksummed_reply() {
        let (sink, m) = manager(RelayConfig::default());

        let mut request = Vec::new();
        let ip = Ipv4Header {
            header_len: IPV4_HEADER_LEN,
            type_of_service: 0,
            total_length: 33,
            identification: 9,
            flags_and_fragment: 0x4000,
            ttl: 64,
            protocol: IPPROTO_ICMP,
            source: Ipv4Addr::new(10, 0, 0, 2),
            destination: Ipv4Addr::new(10, 0, 0, 1),
        };
        request.extend_from_slice(&crate::packet::serialize_ipv4_header(&ip));
        request.extend_from_slice(&[8, 0, 0, 0, 0xbe, 0xef, 0, 7]); // echo request
        request.extend_from_slice(&[1, 2, 3, 4, 5]);

        m.handle_icmp_echo(&request).unwrap();

        let packets = sink.drain();
        assert_eq!(packets.len(), 1);
        let reply = &packets[0];
        assert_eq!(&reply[12..16], &[10, 0, 0, 1]);
        assert_eq!(&reply[16..20], &[10, 0, 0, 2]);
        assert_eq!(reply[20], 0); // echo reply
        assert_eq!(&reply[24..28], &[0xbe, 0xef, 0, 7]);
        assert_eq!(crate::checksum::checksum(&reply[20..]), 0);

        // non-echo types are refused
        let mut unreachable = request.clone();
        unreachable[20] = 3;
        assert!(matches!(
            m.handle_icmp_echo(&unreachable),
            Err(RelayError::UnsupportedIcmpType(3))
        ));
    }

    #[test]
    fn idle_sweep_closes_stale_flows() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let config = RelayConfig::builder()
            .idle_timeout(Duration::from_millis(10))
            .build();
        let (_sink, m) = manager(config);
        let (ip, tcp) = syn_headers(addr);

        let flow = m.open_tcp_flow(&ip, &tcp).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(m.sweep_idle(), 1);
        assert_eq!(m.flow_count(), 0);
        assert_eq!(flow.lock().state(), FlowState::Closed);
    }
}
