//! Flow writer: pushes queued client bytes into upstream sockets

use std::io;
use std::sync::Arc;

use mio::Registry;
use tracing::{debug, info, warn};

use crate::flow::{Flow, FlowKind, InterestSet};
use crate::packet;
use crate::sink::PacketSink;
use crate::stats::RelayStats;

pub struct FlowWriter {
    sink: Arc<dyn PacketSink>,
    stats: Arc<RelayStats>,
}

impl FlowWriter {
    pub fn new(sink: Arc<dyn PacketSink>, stats: Arc<RelayStats>) -> Self {
        Self { sink, stats }
    }

    /// Runs one write cycle. A failed TCP write resets the client-side
    /// session before the flow drains; a failed UDP write just drains.
    pub fn write(&self, flow: &mut Flow, registry: &Registry) {
        match self.write_pending(flow, registry) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotConnected && flow.kind() == FlowKind::Tcp => {
                warn!(flow = %flow.key(), "write to not-yet-connected stream: {e}");
            }
            Err(e) => {
                debug!(flow = %flow.key(), "upstream write failed: {e}");
                match flow.kind() {
                    FlowKind::Tcp => self.abort_tcp_flow(flow),
                    FlowKind::Udp => flow.begin_draining(),
                }
            }
        }
    }

    fn write_pending(&self, flow: &mut Flow, registry: &Registry) -> io::Result<()> {
        if !flow.has_outbound() {
            return Ok(());
        }
        let data = flow.take_outbound();
        let mut offset = 0;
        while offset < data.len() {
            match flow.channel_mut().write_bytes(&data[offset..]) {
                Ok(0) => break,
                Ok(n) => {
                    offset += n;
                    flow.touch();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    flow.requeue_outbound(&data[offset..]);
                    return Err(e);
                }
            }
        }
        if offset < data.len() {
            info!(
                flow = %flow.key(),
                "{} bytes not yet written, waiting for writability",
                data.len() - offset
            );
            flow.requeue_outbound(&data[offset..]);
            flow.subscribe(InterestSet::WRITE, registry);
        } else {
            flow.set_send_ready(false);
            flow.unsubscribe(InterestSet::WRITE, registry);
        }
        Ok(())
    }

    /// Sends one RST from the flow's templates and drains the flow
    fn abort_tcp_flow(&self, flow: &mut Flow) {
        if let Some((ip, tcp)) = flow.tcp_templates() {
            let rst = packet::build_rst(&ip, &tcp, 0);
            match self.sink.write_packet(&rst) {
                Ok(()) => {
                    self.stats.record_rst();
                    self.stats.record_to_client(rst.len());
                }
                Err(e) => warn!(flow = %flow.key(), "sink rejected RST: {e}"),
            }
        }
        flow.begin_draining();
    }
}
