//! Flow entity: one relayed session and its upstream socket
//!
//! A flow pairs the client-side session identity (protocol + 4-tuple and
//! the latest header templates) with the upstream non-blocking socket and
//! the state the reader/writer need: interest set, sequence bookkeeping
//! and the two byte queues.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use mio::net::{TcpStream, UdpSocket};
use mio::{Interest, Registry, Token};
use parking_lot::Mutex;
use tracing::trace;

use crate::config::RelayConfig;
use crate::packet::{Ipv4Header, TcpHeader, TransportHeader, UdpHeader};

/// Transport protocol of a flow, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowKind {
    Tcp,
    Udp,
}

/// Flow table key: protocol plus the client-side 4-tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub kind: FlowKind,
    pub source: SocketAddr,
    pub destination: SocketAddr,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.kind {
            FlowKind::Tcp => "tcp",
            FlowKind::Udp => "udp",
        };
        write!(f, "{proto} {} -> {}", self.source, self.destination)
    }
}

/// Flow lifecycle
///
/// `Connecting` only occurs for TCP flows with an in-flight connect.
/// `Draining` means teardown was requested and the flow is waiting for
/// the loop to deregister it. A draining flow never watches CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Connecting,
    Connected,
    Draining,
    Closed,
}

/// Readiness interests a flow can watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterestSet(u8);

impl InterestSet {
    pub const EMPTY: InterestSet = InterestSet(0);
    pub const CONNECT: InterestSet = InterestSet(0b001);
    pub const READ: InterestSet = InterestSet(0b010);
    pub const WRITE: InterestSet = InterestSet(0b100);

    pub fn contains(self, other: InterestSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: InterestSet) -> InterestSet {
        InterestSet(self.0 | other.0)
    }

    pub fn without(self, other: InterestSet) -> InterestSet {
        InterestSet(self.0 & !other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Maps to poller interests. Connect completion is reported as
    /// writability, so CONNECT and WRITE share a bit on the wire.
    pub fn to_mio(self) -> Option<Interest> {
        let mut interest = None;
        if self.contains(Self::READ) {
            interest = Some(Interest::READABLE);
        }
        if self.contains(Self::CONNECT) || self.contains(Self::WRITE) {
            interest = Some(match interest {
                Some(i) => i | Interest::WRITABLE,
                None => Interest::WRITABLE,
            });
        }
        interest
    }
}

/// The upstream socket, tagged by protocol so readers and writers can
/// branch once instead of probing channel capabilities.
pub enum FlowChannel {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl FlowChannel {
    pub fn kind(&self) -> FlowKind {
        match self {
            FlowChannel::Tcp(_) => FlowKind::Tcp,
            FlowChannel::Udp(_) => FlowKind::Udp,
        }
    }

    pub fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            FlowChannel::Tcp(stream) => stream.read(buf),
            FlowChannel::Udp(socket) => socket.recv(buf),
        }
    }

    pub fn write_bytes(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            FlowChannel::Tcp(stream) => stream.write(buf),
            FlowChannel::Udp(socket) => socket.send(buf),
        }
    }

    /// Checks whether an in-flight connect has completed.
    /// `Ok(false)` means still pending; a socket error fails the flow.
    pub fn finish_connect(&mut self) -> io::Result<bool> {
        match self {
            FlowChannel::Tcp(stream) => {
                if let Some(err) = stream.take_error()? {
                    return Err(err);
                }
                match stream.peer_addr() {
                    Ok(_) => Ok(true),
                    Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
                    Err(e) => Err(e),
                }
            }
            FlowChannel::Udp(_) => Ok(true),
        }
    }

    pub fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        match self {
            FlowChannel::Tcp(stream) => registry.register(stream, token, interest),
            FlowChannel::Udp(socket) => registry.register(socket, token, interest),
        }
    }

    pub fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        match self {
            FlowChannel::Tcp(stream) => registry.reregister(stream, token, interest),
            FlowChannel::Udp(socket) => registry.reregister(socket, token, interest),
        }
    }

    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            FlowChannel::Tcp(stream) => registry.deregister(stream),
            FlowChannel::Udp(socket) => registry.deregister(socket),
        }
    }
}

/// One relayed session
pub struct Flow {
    token: Token,
    key: FlowKey,
    channel: FlowChannel,
    state: FlowState,
    interest: InterestSet,

    last_ip_header: Option<Ipv4Header>,
    last_transport_header: Option<TransportHeader>,

    send_next: u32,
    recv_sequence: u32,
    timestamp_sender: u32,
    timestamp_reply_to: u32,
    max_segment_size: u16,

    pending_inbound: VecDeque<u8>,
    pending_outbound: VecDeque<u8>,
    has_received_last_segment: bool,
    send_ready: bool,
    last_activity: Instant,
}

impl Flow {
    pub fn new(token: Token, key: FlowKey, channel: FlowChannel, state: FlowState) -> Self {
        Self {
            token,
            key,
            channel,
            state,
            interest: InterestSet::EMPTY,
            last_ip_header: None,
            last_transport_header: None,
            send_next: 0,
            recv_sequence: 0,
            timestamp_sender: 0,
            timestamp_reply_to: 0,
            max_segment_size: 0,
            pending_inbound: VecDeque::new(),
            pending_outbound: VecDeque::new(),
            has_received_last_segment: false,
            send_ready: false,
            last_activity: Instant::now(),
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn key(&self) -> FlowKey {
        self.key
    }

    pub fn kind(&self) -> FlowKind {
        self.channel.kind()
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn channel_mut(&mut self) -> &mut FlowChannel {
        &mut self.channel
    }

    pub fn interest(&self) -> InterestSet {
        self.interest
    }

    pub fn mark_connected(&mut self) {
        if self.state == FlowState::Connecting {
            self.state = FlowState::Connected;
        }
    }

    /// Requests teardown. CONNECT interest is dropped so a draining flow
    /// can never also be waiting on connect completion.
    pub fn begin_draining(&mut self) {
        if self.state != FlowState::Closed {
            self.state = FlowState::Draining;
            self.interest = self.interest.without(InterestSet::CONNECT);
        }
    }

    pub fn mark_closed(&mut self) {
        self.state = FlowState::Closed;
        self.interest = InterestSet::EMPTY;
    }

    pub fn is_draining(&self) -> bool {
        self.state == FlowState::Draining
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() > timeout
    }

    /// Replaces the header templates with the latest client packet's
    pub fn update_templates(&mut self, ip: Ipv4Header, transport: TransportHeader) {
        self.last_ip_header = Some(ip);
        self.last_transport_header = Some(transport);
        self.touch();
    }

    pub fn tcp_templates(&self) -> Option<(Ipv4Header, TcpHeader)> {
        match (&self.last_ip_header, &self.last_transport_header) {
            (Some(ip), Some(TransportHeader::Tcp(tcp))) => Some((ip.clone(), tcp.clone())),
            _ => None,
        }
    }

    pub fn udp_templates(&self) -> Option<(Ipv4Header, UdpHeader)> {
        match (&self.last_ip_header, &self.last_transport_header) {
            (Some(ip), Some(TransportHeader::Udp(udp))) => Some((ip.clone(), udp.clone())),
            _ => None,
        }
    }

    pub fn send_next(&self) -> u32 {
        self.send_next
    }

    pub fn advance_send_next(&mut self, len: u32) {
        self.send_next = self.send_next.wrapping_add(len);
    }

    /// Seeds the relay-side sequence, typically from a synthesized
    /// handshake's initial sequence number
    pub fn set_send_next(&mut self, seq: u32) {
        self.send_next = seq;
    }

    pub fn recv_sequence(&self) -> u32 {
        self.recv_sequence
    }

    pub fn set_recv_sequence(&mut self, seq: u32) {
        self.recv_sequence = seq;
    }

    pub fn timestamp_sender(&self) -> u32 {
        self.timestamp_sender
    }

    pub fn timestamp_reply_to(&self) -> u32 {
        self.timestamp_reply_to
    }

    pub fn set_timestamps(&mut self, sender: u32, reply_to: u32) {
        self.timestamp_sender = sender;
        self.timestamp_reply_to = reply_to;
    }

    pub fn max_segment_size(&self) -> u16 {
        self.max_segment_size
    }

    pub fn set_max_segment_size(&mut self, mss: u16) {
        self.max_segment_size = mss;
    }

    /// Payload bound for synthesized data segments: the client MSS minus
    /// the reserve, with a fixed fallback when that is not positive.
    pub fn segment_payload_limit(&self, config: &RelayConfig) -> usize {
        let bound = i32::from(self.max_segment_size) - i32::from(config.mss_reserve);
        if bound < 1 {
            config.fallback_segment_size
        } else {
            bound as usize
        }
    }

    pub fn has_received_last_segment(&self) -> bool {
        self.has_received_last_segment
    }

    pub fn set_has_received_last_segment(&mut self, last: bool) {
        self.has_received_last_segment = last;
    }

    pub fn push_inbound(&mut self, data: &[u8]) {
        self.pending_inbound.extend(data.iter().copied());
    }

    pub fn has_inbound(&self) -> bool {
        !self.pending_inbound.is_empty()
    }

    pub fn take_inbound(&mut self, max: usize) -> Vec<u8> {
        let n = self.pending_inbound.len().min(max);
        self.pending_inbound.drain(..n).collect()
    }

    pub fn push_outbound(&mut self, data: &[u8]) {
        self.pending_outbound.extend(data.iter().copied());
    }

    pub fn has_outbound(&self) -> bool {
        !self.pending_outbound.is_empty()
    }

    pub fn take_outbound(&mut self) -> Vec<u8> {
        self.pending_outbound.drain(..).collect()
    }

    /// Puts unwritten bytes back at the head of the queue
    pub fn requeue_outbound(&mut self, data: &[u8]) {
        for &b in data.iter().rev() {
            self.pending_outbound.push_front(b);
        }
    }

    pub fn send_ready(&self) -> bool {
        self.send_ready
    }

    pub fn set_send_ready(&mut self, ready: bool) {
        self.send_ready = ready;
    }

    /// Adds interests and pushes the change to the registry
    pub fn subscribe(&mut self, ops: InterestSet, registry: &Registry) {
        if self.state == FlowState::Closed {
            return;
        }
        let next = self.interest.with(ops);
        if next == self.interest {
            return;
        }
        self.interest = next;
        self.apply_interest(registry);
    }

    /// Removes interests and pushes the change to the registry
    pub fn unsubscribe(&mut self, ops: InterestSet, registry: &Registry) {
        if self.state == FlowState::Closed {
            return;
        }
        let next = self.interest.without(ops);
        if next == self.interest {
            return;
        }
        self.interest = next;
        self.apply_interest(registry);
    }

    /// Records the initial interest without touching the registry; the
    /// event loop registers the channel itself under the selection lock.
    pub fn set_initial_interest(&mut self, ops: InterestSet) {
        self.interest = ops;
    }

    fn apply_interest(&mut self, registry: &Registry) {
        let Some(interest) = self.interest.to_mio() else {
            return;
        };
        if let Err(e) = self.channel.reregister(registry, self.token, interest) {
            trace!(flow = %self.key, "reregister failed: {e}");
        }
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("token", &self.token.0)
            .field("key", &self.key)
            .field("state", &self.state)
            .field("interest", &self.interest)
            .field("send_next", &self.send_next)
            .field("recv_sequence", &self.recv_sequence)
            .finish()
    }
}

/// Shared flow table: token-indexed with a key index for session lookup
pub struct FlowArena {
    flows: DashMap<Token, Arc<Mutex<Flow>>>,
    by_key: DashMap<FlowKey, Token>,
    next_token: AtomicUsize,
}

impl FlowArena {
    pub fn new() -> Self {
        Self {
            flows: DashMap::new(),
            by_key: DashMap::new(),
            // token 0 is reserved for the waker
            next_token: AtomicUsize::new(1),
        }
    }

    pub fn alloc_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub fn insert(&self, token: Token, key: FlowKey, flow: Arc<Mutex<Flow>>) {
        self.flows.insert(token, flow);
        self.by_key.insert(key, token);
    }

    pub fn get(&self, token: Token) -> Option<Arc<Mutex<Flow>>> {
        self.flows.get(&token).map(|e| e.value().clone())
    }

    pub fn get_by_key(&self, key: &FlowKey) -> Option<Arc<Mutex<Flow>>> {
        let token = *self.by_key.get(key)?;
        self.get(token)
    }

    pub fn remove(&self, token: Token, key: &FlowKey) {
        self.flows.remove(&token);
        self.by_key.remove(key);
    }

    pub fn snapshot(&self) -> Vec<Arc<Mutex<Flow>>> {
        self.flows.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

impl Default for FlowArena {
    fn default() -> Self {
        Self::new()
    }
}
