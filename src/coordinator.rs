//! Leader election and the authoritative cluster state blob (C4).
//!
//! One node among the configured [`crate::node::NodeType`]s is elected
//! leader by periodically broadcasting `(id, birth_time, type, priority)`
//! announcements (`spec.md` §4.4, wire format in `spec.md` §6) and tracking
//! which peers have been heard from recently. Only the coordinator's own
//! strand is allowed to mutate the state blob; [`Coordinator::perform_on_state_message`]
//! enforces that by holding the blob's lock for the whole callback, the same
//! way the original's `PerformOnStateMessage` holds its internal mutex
//! across the publisher's callback.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use bytes::Bytes;
use crossbeam_channel::RecvTimeoutError;
use speedy::{Endianness, Readable, Writable};

use crate::{
    comm::CommSubstrate,
    node::{Node, NodeId, NodeType, NodeTypeId, QuorumPolicy},
    strand::{PeriodicTimer, Strand, TimerEvent},
    wire::{Announcement, KIND_ANNOUNCEMENT, MAGIC, VERSION},
};

/// How many consecutive missed announcement periods make a peer count as
/// no longer live (`spec.md` §4.4: "within the last 3 announcement
/// periods").
const LIVENESS_WINDOW_TICKS: u64 = 3;

#[derive(Debug, Clone, Copy)]
struct PeerInfo {
    last_seen_tick: u64,
    type_id: NodeTypeId,
    priority: u32,
}

struct Inner {
    local: Node,
    node_types: HashMap<NodeTypeId, NodeType>,
    comm: Arc<dyn CommSubstrate>,
    peers: Mutex<HashMap<NodeId, PeerInfo>>,
    state: Mutex<Vec<u8>>,
    elected: AtomicBool,
    tick: AtomicU64,
    stopped: AtomicBool,
}

impl Inner {
    fn my_node_type(&self) -> &NodeType {
        self.node_types
            .get(&self.local.node_type)
            .expect("local node's own node type must be present in the configured node types")
    }

    /// Quorum is evaluated per configured node type (`spec.md` §9's "is
    /// quorum per-node-type" open question, resolved in `DESIGN.md`): a peer
    /// only counts toward a type's quorum if it last announced under that
    /// type's own id, so a stale or misconfigured announcement can't be
    /// mistaken for a live member of a type it doesn't belong to.
    fn recompute_election(&self) {
        let now = self.tick.load(Ordering::SeqCst);
        let peers = self.peers.lock().unwrap();

        let mut quorum_met = true;
        let mut live: Vec<(NodeId, u32)> = Vec::new();

        for node_type in self.node_types.values() {
            let known: Vec<NodeId> = node_type
                .peers
                .iter()
                .copied()
                .filter(|id| *id != self.local.id)
                .collect();

            // A known peer only blocks quorum while we are still waiting to
            // hear from it for the first time, or while it is still within
            // its liveness window. Once a peer we had previously heard from
            // falls silent for 3 consecutive periods, we presume it dead and
            // stop requiring it -- this is what lets the cluster re-elect a
            // leader after a peer exits rather than waiting on it forever
            // (`spec.md` §4.4's re-election trigger: "absence of 3
            // consecutive announcements from a peer").
            let mut type_live = 0usize;
            let mut required = 0usize;
            for id in &known {
                match peers.get(id) {
                    Some(info) if info.type_id == node_type.id => {
                        let age = now.saturating_sub(info.last_seen_tick);
                        if age < LIVENESS_WINDOW_TICKS {
                            required += 1;
                            type_live += 1;
                            live.push((*id, info.priority));
                        }
                        // else: previously seen, now stale -- presumed dead.
                    }
                    // Never heard from under this type, or its last
                    // announcement claimed a different type: still required
                    // until a matching announcement arrives.
                    _ => required += 1,
                }
            }

            let type_quorum_met = match node_type.quorum {
                QuorumPolicy::AllKnownPeers => type_live == required,
                QuorumPolicy::Majority => known.is_empty() || type_live * 2 > known.len(),
            };
            if !type_quorum_met {
                quorum_met = false;
            }
        }
        drop(peers);

        if !quorum_met {
            self.elected.store(false, Ordering::SeqCst);
            return;
        }

        let my_priority = self.my_node_type().priority;
        let someone_better = live
            .iter()
            .any(|(id, priority)| is_better(*priority, *id, my_priority, self.local.id));

        self.elected.store(!someone_better, Ordering::SeqCst);
    }

    /// Validates and applies an inbound wire frame. Shared by the public
    /// per-instance entry point and the background receiver loop, since the
    /// latter runs before a `Coordinator` (as opposed to its `Inner`) exists.
    fn handle_inbound_frame(&self, bytes: &[u8]) {
        if bytes.len() < 6
            || bytes[4] != VERSION
            || u32::from_le_bytes(bytes.get(0..4).and_then(|s| s.try_into().ok()).unwrap_or([0; 4]))
                != MAGIC
        {
            log::debug!("coordinator: dropping frame with unrecognized header");
            return;
        }
        if bytes[5] != KIND_ANNOUNCEMENT {
            return; // not our concern here; e.g. a state publication
        }
        match Announcement::read_from_buffer_with_ctx(Endianness::LittleEndian, bytes) {
            Ok(ann) => self.apply_announcement(ann),
            Err(e) => log::debug!("coordinator: malformed announcement discarded: {e}"),
        }
    }

    fn apply_announcement(&self, ann: Announcement) {
        let tick = self.tick.load(Ordering::SeqCst);
        self.peers.lock().unwrap().insert(
            NodeId(ann.node_id),
            PeerInfo {
                last_seen_tick: tick,
                type_id: NodeTypeId(ann.type_id),
                priority: ann.priority,
            },
        );
        self.recompute_election();
    }
}

/// `true` if `(a_priority, a_id)` should win the election over
/// `(b_priority, b_id)`: higher priority wins, ties broken by the smaller
/// node id (`spec.md` §4.4).
fn is_better(a_priority: u32, a_id: NodeId, b_priority: u32, b_id: NodeId) -> bool {
    a_priority > b_priority || (a_priority == b_priority && a_id < b_id)
}

/// Runs leader election and owns the authoritative state blob.
pub struct Coordinator {
    inner: Arc<Inner>,
    strand: Strand,
    announce_timer: PeriodicTimer,
    receiver_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(
        local: Node,
        node_types: HashMap<NodeTypeId, NodeType>,
        comm: Arc<dyn CommSubstrate>,
        announce_period: Duration,
        initial_state: Vec<u8>,
    ) -> Arc<Self> {
        let strand = Strand::new("coordinator");
        let inner = Arc::new(Inner {
            local,
            node_types,
            comm,
            peers: Mutex::new(HashMap::new()),
            state: Mutex::new(initial_state),
            elected: AtomicBool::new(false),
            tick: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        });

        let timer_inner = Arc::clone(&inner);
        let timer_strand = strand.clone();
        let announce_timer = PeriodicTimer::new(timer_strand, announce_period, move |event| {
            if event == TimerEvent::Fired {
                Self::announce_tick(&timer_inner);
            }
        });
        announce_timer.start();

        // Drains the substrate (C3) the same way `InboundStream`/
        // `UdpSubstrate::poll_loop` do, dispatching every frame onto the
        // coordinator's own strand so the peer table and election outcome
        // are only ever mutated from one place.
        let receiver_inner = Arc::clone(&inner);
        let receiver_strand = strand.clone();
        let comm_rx = receiver_inner.comm.receive();
        let receiver_thread = thread::Builder::new()
            .name("coordinator-inbound".into())
            .spawn(move || Self::run_receiver_loop(receiver_strand, receiver_inner, comm_rx))
            .expect("failed to spawn coordinator inbound receiver thread");

        Arc::new(Coordinator {
            inner,
            strand,
            announce_timer,
            receiver_thread: Mutex::new(Some(receiver_thread)),
        })
    }

    fn run_receiver_loop(
        strand: Strand,
        inner: Arc<Inner>,
        comm_rx: crossbeam_channel::Receiver<crate::comm::InboundFrame>,
    ) {
        loop {
            if inner.stopped.load(Ordering::SeqCst) {
                break;
            }
            match comm_rx.recv_timeout(Duration::from_millis(200)) {
                Ok(frame) => {
                    let dispatch_inner = Arc::clone(&inner);
                    strand.dispatch(move || dispatch_inner.handle_inbound_frame(&frame.bytes));
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn announce_tick(inner: &Arc<Inner>) {
        let tick = inner.tick.fetch_add(1, Ordering::SeqCst) + 1;
        let ann = Announcement::new(
            inner.local.id.0,
            inner.local.birth_time,
            inner.my_node_type().id.0,
            inner.my_node_type().priority,
        );
        let bytes = match ann.write_to_vec_with_ctx(Endianness::LittleEndian) {
            Ok(b) => Bytes::from(b),
            Err(e) => {
                log::error!("coordinator: failed to encode announcement: {e}");
                return;
            }
        };
        for node_type_id in inner.node_types.keys().copied() {
            if let Err(e) = inner
                .comm
                .send_to_node_type(node_type_id, bytes.clone(), inner.local.id)
            {
                log::debug!("coordinator: announcement send to {node_type_id:?} overflowed: {e}");
            }
        }
        // A peer may have simply stopped announcing; re-evaluate even
        // without any new inbound message, since liveness is tick-relative.
        let _ = tick;
        inner.recompute_election();
    }

    /// Feeds an inbound frame from the substrate, updating the peer table
    /// if it is a well-formed announcement. Anything else is a malformed
    /// remote message and is logged and discarded (`spec.md` §4.7), never
    /// treated as fatal. The background receiver thread started in
    /// [`Coordinator::new`] drives this in normal operation; exposed
    /// publicly so a caller wiring together its own substrate loop can feed
    /// it directly too.
    pub fn on_inbound_frame(&self, bytes: &[u8]) {
        self.inner.handle_inbound_frame(bytes);
    }

    /// Called when the process monitor (C2) observes the local node's own
    /// critical process has exited. This crate's safe, documented
    /// resolution of `spec.md` §9's otherwise-unspecified quorum trigger:
    /// the node immediately drops out of the election rather than waiting
    /// out the liveness window, since it can no longer be a trustworthy
    /// leader.
    pub fn on_local_process_exit(&self) {
        self.inner.elected.store(false, Ordering::SeqCst);
        self.inner.recompute_election();
    }

    pub fn is_elected(&self) -> bool {
        self.inner.elected.load(Ordering::SeqCst)
    }

    /// Hands the callback a buffer of exactly `payload_len + trailer_bytes`
    /// bytes, holding the state lock for the call's whole duration. `f`
    /// must not dispatch onto another strand: it receives only a borrowed
    /// slice, which cannot outlive the call, enforcing that restriction
    /// structurally rather than by convention.
    pub fn perform_on_state_message(&self, trailer_bytes: usize, f: impl FnOnce(&mut [u8])) {
        let state_guard = self.inner.state.lock().unwrap();
        let mut buf = vec![0u8; state_guard.len() + trailer_bytes];
        buf[..state_guard.len()].copy_from_slice(&state_guard);
        f(&mut buf);
        drop(state_guard);
    }

    /// Replaces the authoritative state blob. Callers must only invoke this
    /// from the coordinator's own strand -- see [`Coordinator::strand`].
    pub fn set_state(&self, bytes: Vec<u8>) {
        *self.inner.state.lock().unwrap() = bytes;
    }

    /// The coordinator's own strand, for components that need to dispatch
    /// state mutations onto it (e.g. applying a freshly-received remote
    /// state update).
    pub fn strand(&self) -> &Strand {
        &self.strand
    }

    pub fn stop(&self) {
        self.announce_timer.stop();
        self.inner.stopped.store(true, Ordering::SeqCst);
        if let Some(join) = self.receiver_thread.lock().unwrap().take() {
            let _ = join.join();
        }
        self.strand.stop();
    }
}
