//! State publisher (C5): periodically hands the coordinator's state bytes
//! to the communication substrate, fanned out to every node type, optionally
//! CRC32-protected.
//!
//! Grounded directly in `StatePublisherRemote.h`: a 1-second `AsioPeriodicTimer`
//! guarded by an `IsElected` check, `PerformOnStateMessage` supplying the
//! buffer the CRC is written into, then one `SendToNodeType` per configured
//! node type. Errors from the send are logged and dropped, not retried --
//! the next tick republishes regardless (`spec.md` §4.5).

use std::{sync::Arc, time::Duration};

use crc32fast::Hasher;
use speedy::{Endianness, Writable};

use crate::{
    coordinator::Coordinator,
    comm::CommSubstrate,
    node::{NodeId, NodeTypeId},
    strand::{PeriodicTimer, Strand, TimerEvent},
    wire::StatePublicationHeader,
};

/// `spec.md` §4.5: the state publisher runs on a fixed one-second period.
pub const PUBLISH_PERIOD: Duration = Duration::from_secs(1);

/// Number of trailer bytes reserved for the CRC32 when it is enabled.
const CRC_TRAILER_BYTES: usize = 4;

/// Drives [`Coordinator::perform_on_state_message`] on a timer and fans the
/// result out over a [`CommSubstrate`].
pub struct StatePublisher {
    timer: PeriodicTimer,
}

impl StatePublisher {
    /// `node_types` is the full set of node type ids to fan state
    /// publications out to (including the local node's own type, mirroring
    /// the original, which republishes to its own type as well).
    /// `crc_enabled` toggles the optional CRC32 trailer (`spec.md` §3:
    /// "Optional trailing 4-byte CRC32 when a compile-time flag is active").
    pub fn new(
        strand: Strand,
        coordinator: Arc<Coordinator>,
        comm: Arc<dyn CommSubstrate>,
        local_id: NodeId,
        node_types: Vec<NodeTypeId>,
        crc_enabled: bool,
    ) -> Self {
        let timer = PeriodicTimer::new(strand, PUBLISH_PERIOD, move |event| match event {
            TimerEvent::Fired => Self::publish_tick(
                &coordinator,
                comm.as_ref(),
                local_id,
                &node_types,
                crc_enabled,
            ),
            TimerEvent::Cancelled => {}
        });
        timer.start();
        StatePublisher { timer }
    }

    fn publish_tick(
        coordinator: &Coordinator,
        comm: &dyn CommSubstrate,
        local_id: NodeId,
        node_types: &[NodeTypeId],
        crc_enabled: bool,
    ) {
        if !coordinator.is_elected() {
            return;
        }

        let trailer_bytes = if crc_enabled { CRC_TRAILER_BYTES } else { 0 };
        coordinator.perform_on_state_message(trailer_bytes, |buf| {
            if crc_enabled {
                let payload_len = buf.len() - CRC_TRAILER_BYTES;
                let mut hasher = Hasher::new();
                hasher.update(&buf[..payload_len]);
                let crc = hasher.finalize();
                buf[payload_len..].copy_from_slice(&crc.to_le_bytes());
            }

            // `spec.md` §6: every state publication is framed with a header
            // identifying it (magic/version/kind=2) and carrying the length
            // of what follows, so a peer can tell a state publication apart
            // from an announcement and knows how many bytes to read --
            // `payload_len` covers the payload plus the CRC trailer, i.e.
            // the whole of `buf`.
            let header = StatePublicationHeader::new(buf.len() as u32);
            let mut framed = header
                .write_to_vec_with_ctx(Endianness::LittleEndian)
                .expect("state publication header always encodes");
            framed.extend_from_slice(buf);

            let bytes = bytes::Bytes::from(framed);
            for node_type in node_types {
                if let Err(e) = comm.send_to_node_type(*node_type, bytes.clone(), local_id) {
                    log::debug!("state publisher: send to {node_type:?} overflowed: {e}");
                }
            }
        });
    }

    /// Stops the publishing timer. Any callback already in flight still
    /// completes; no further publish happens afterwards.
    pub fn stop(&self) {
        self.timer.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        net::{IpAddr, Ipv4Addr, SocketAddr},
    };

    use super::*;
    use crate::{
        comm::ChannelSubstrate,
        node::{Node, NodeType, QuorumPolicy},
    };

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn elected_coordinator(payload: Vec<u8>) -> (Arc<Coordinator>, Arc<ChannelSubstrate>) {
        let comm = ChannelSubstrate::new(8);
        let local = Node {
            id: NodeId(1),
            node_type: NodeTypeId(1),
            control_addr: addr(11000),
            data_addr: addr(12000),
            birth_time: 0,
        };
        let mut node_types = HashMap::new();
        node_types.insert(
            NodeTypeId(1),
            NodeType {
                id: NodeTypeId(1),
                name: "server".into(),
                is_light: false,
                peers: Default::default(),
                priority: 10,
                quorum: QuorumPolicy::AllKnownPeers,
            },
        );
        let coordinator = Coordinator::new(
            local,
            node_types,
            comm.clone(),
            Duration::from_millis(10),
            payload,
        );
        // No known peers means the coordinator elects itself almost
        // immediately; give it a moment.
        std::thread::sleep(Duration::from_millis(30));
        (coordinator, comm)
    }

    #[test]
    fn crc32_trailer_matches_the_documented_example() {
        let (coordinator, comm) = elected_coordinator(vec![0x01, 0x02, 0x03]);
        comm.loop_back(NodeTypeId(1));

        let strand = Strand::new("publisher-test");
        let publisher = StatePublisher::new(
            strand.clone(),
            Arc::clone(&coordinator),
            comm.clone(),
            NodeId(1),
            vec![NodeTypeId(1)],
            true,
        );

        let rx = comm.receive();
        let frame = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        // spec.md §8 scenario 4: payload [01 02 03] CRC32'd gives trailer
        // 55 BC 42 3A little-endian, prefixed with the §6 header.
        let mut expected = crate::wire::StatePublicationHeader::new(7)
            .write_to_vec_with_ctx(speedy::Endianness::LittleEndian)
            .unwrap();
        expected.extend_from_slice(&[0x01, 0x02, 0x03, 0x55, 0xBC, 0x42, 0x3A]);
        assert_eq!(&frame.bytes[..], &expected[..]);

        publisher.stop();
        coordinator.stop();
        strand.stop();
    }

    #[test]
    fn an_unelected_node_never_publishes() {
        let comm = ChannelSubstrate::new(8);
        comm.loop_back(NodeTypeId(1));
        let local = Node {
            id: NodeId(1),
            node_type: NodeTypeId(1),
            control_addr: addr(11010),
            data_addr: addr(12010),
            birth_time: 0,
        };
        let mut node_types = HashMap::new();
        // A peer we will never hear from keeps quorum unmet forever.
        node_types.insert(
            NodeTypeId(1),
            NodeType {
                id: NodeTypeId(1),
                name: "server".into(),
                is_light: false,
                peers: std::iter::once(NodeId(2)).collect(),
                priority: 10,
                quorum: QuorumPolicy::AllKnownPeers,
            },
        );
        let coordinator = Coordinator::new(
            local,
            node_types,
            comm.clone(),
            Duration::from_millis(10),
            vec![0xAA],
        );
        assert!(!coordinator.is_elected());

        let strand = Strand::new("publisher-test-unelected");
        let publisher = StatePublisher::new(
            strand.clone(),
            Arc::clone(&coordinator),
            comm.clone(),
            NodeId(1),
            vec![NodeTypeId(1)],
            false,
        );

        let rx = comm.receive();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        publisher.stop();
        coordinator.stop();
        strand.stop();
    }
}
