//! Single-threaded readiness loop driving all flows
//!
//! One dedicated thread blocks on the poller while other threads
//! register flows and adjust interests. Registration coordinates with
//! the poller through a two-lock handoff: the selection lock guards the
//! blocking wait, the handling lock guards event dispatch. A registrar
//! first tries the selection lock; if the loop is mid-wait it takes the
//! handling lock, wakes the poller, then blocks on the selection lock,
//! which the loop releases as soon as the wait returns. The loop cannot
//! start dispatching until the registrar releases the handling lock, so
//! no registration is lost and no stale event set is dispatched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mio::{Events, Poll, Registry, Token, Waker};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::flow::{Flow, FlowArena, FlowKind, FlowState, InterestSet};
use crate::reader::FlowReader;
use crate::sink::PacketSink;
use crate::stats::RelayStats;
use crate::writer::FlowWriter;

/// Token reserved for the waker
pub const WAKE_TOKEN: Token = Token(0);

pub struct EventLoop {
    poll: Mutex<Poll>,
    handling: Mutex<()>,
    registry: Registry,
    waker: Waker,
    arena: Arc<FlowArena>,
    reader: FlowReader,
    writer: FlowWriter,
    stats: Arc<RelayStats>,
    config: RelayConfig,
    shutdown: AtomicBool,
}

impl EventLoop {
    pub fn new(
        config: RelayConfig,
        arena: Arc<FlowArena>,
        sink: Arc<dyn PacketSink>,
        stats: Arc<RelayStats>,
    ) -> Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        Ok(Self {
            poll: Mutex::new(poll),
            handling: Mutex::new(()),
            registry,
            waker,
            reader: FlowReader::new(sink.clone(), config.clone(), stats.clone()),
            writer: FlowWriter::new(sink, stats.clone()),
            arena,
            stats,
            config,
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Registers a flow's channel with the poller. Initial interest is
    /// READ for connected flows and CONNECT for pending TCP connects.
    pub fn register_flow(&self, flow: &Arc<Mutex<Flow>>) -> Result<()> {
        // selection lock first, then the flow lock, matching teardown
        let guard = self.lock_selector();
        let mut f = flow.lock();
        let initial = if f.state() == FlowState::Connecting {
            InterestSet::CONNECT
        } else {
            InterestSet::READ
        };
        f.set_initial_interest(initial);
        let interest = match initial.to_mio() {
            Some(i) => i,
            None => return Err(RelayError::InvalidState("empty initial interest".into())),
        };
        let token = f.token();
        f.channel_mut().register(&self.registry, token, interest)?;
        trace!(flow = %f.key(), "registered with token {}", token.0);
        drop(f);
        drop(guard);
        Ok(())
    }

    /// Deregisters and closes a flow outside the dispatch path
    pub fn deregister_flow(&self, flow: &Arc<Mutex<Flow>>) {
        let guard = self.lock_selector();
        let mut f = flow.lock();
        if f.state() == FlowState::Closed {
            return;
        }
        if let Err(e) = f.channel_mut().deregister(&self.registry) {
            trace!(flow = %f.key(), "deregister failed: {e}");
        }
        f.mark_closed();
        drop(f);
        drop(guard);
        self.stats.record_flow_closed();
    }

    /// Nudges the poller so freshly changed interests take effect
    pub fn refresh_select(&self) {
        match self.poll.try_lock() {
            Some(guard) => drop(guard),
            None => {
                if let Err(e) = self.waker.wake() {
                    warn!("waker failed: {e}");
                }
            }
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            warn!("waker failed during shutdown: {e}");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Acquires the selection lock, interrupting a blocking wait if one
    /// is in progress
    fn lock_selector(&self) -> MutexGuard<'_, Poll> {
        if let Some(guard) = self.poll.try_lock() {
            return guard;
        }
        let handling = self.handling.lock();
        if let Err(e) = self.waker.wake() {
            warn!("waker failed: {e}");
        }
        let guard = self.poll.lock();
        drop(handling);
        guard
    }

    /// Blocks the calling thread on the dispatch loop until shutdown
    pub fn run(&self) {
        let mut events = Events::with_capacity(self.config.events_capacity);
        info!("event loop started");
        while !self.is_shutdown() {
            {
                let mut poll = self.poll.lock();
                if let Err(e) = poll.poll(&mut events, None) {
                    if e.kind() == std::io::ErrorKind::Interrupted {
                        continue;
                    }
                    drop(poll);
                    warn!("poll failed: {e}");
                    self.stats.record_poll_error();
                    std::thread::sleep(self.config.poll_error_backoff);
                    continue;
                }
            }
            if self.is_shutdown() {
                break;
            }

            let _handling = self.handling.lock();
            for event in events.iter() {
                let token = event.token();
                if token == WAKE_TOKEN {
                    continue;
                }
                let Some(flow) = self.arena.get(token) else {
                    continue;
                };
                let mut guard = flow.lock();
                if let Err(e) =
                    self.process_ready(&mut guard, event.is_readable(), event.is_writable())
                {
                    warn!(flow = %guard.key(), "dispatch failed: {e}");
                    guard.begin_draining();
                }
                let done = if guard.is_draining() {
                    self.teardown(&mut guard);
                    true
                } else {
                    guard.state() == FlowState::Closed
                };
                let key = guard.key();
                drop(guard);
                if done {
                    self.arena.remove(token, &key);
                }
            }
        }
        info!("event loop stopped");
    }

    /// Handles one readiness event for one flow
    fn process_ready(&self, flow: &mut Flow, readable: bool, writable: bool) -> Result<()> {
        if flow.state() == FlowState::Closed {
            return Ok(());
        }
        if flow.state() == FlowState::Connecting {
            if flow.kind() == FlowKind::Udp {
                return Err(RelayError::InvalidState(
                    "datagram flow cannot be connecting".into(),
                ));
            }
            if !writable {
                return Ok(());
            }
            match flow.channel_mut().finish_connect() {
                Ok(true) => {
                    debug!(flow = %flow.key(), "upstream connected");
                    flow.mark_connected();
                }
                Ok(false) => return Ok(()),
                Err(e) => {
                    debug!(flow = %flow.key(), "connect failed: {e}");
                    flow.begin_draining();
                    return Ok(());
                }
            }
        }

        // steady state watches READ, never CONNECT
        flow.unsubscribe(InterestSet::CONNECT, &self.registry);
        flow.subscribe(InterestSet::READ, &self.registry);

        if readable {
            self.reader.read(flow, &self.registry);
        }
        self.process_pending_write(flow, writable);
        Ok(())
    }

    fn process_pending_write(&self, flow: &mut Flow, writable: bool) {
        if flow.state() == FlowState::Closed {
            return;
        }
        if !flow.has_outbound() || !flow.send_ready() {
            flow.unsubscribe(InterestSet::WRITE, &self.registry);
            return;
        }
        if writable {
            // cleared before the attempt; the writer re-subscribes when
            // it cannot finish
            flow.unsubscribe(InterestSet::WRITE, &self.registry);
            self.writer.write(flow, &self.registry);
        }
    }

    /// Deregisters and closes a draining flow; the socket closes when
    /// the channel drops with the flow.
    fn teardown(&self, flow: &mut Flow) {
        debug!(flow = %flow.key(), "tearing down flow");
        if let Err(e) = flow.channel_mut().deregister(&self.registry) {
            trace!(flow = %flow.key(), "deregister failed: {e}");
        }
        flow.mark_closed();
        self.stats.record_flow_closed();
    }
}
