//! On-wire framing for the two message kinds this crate puts on the
//! communication substrate: election announcements and state publications.
//!
//! Both use `speedy`, the same little-endian, zero-copy-friendly derive
//! macro RustDDS uses for its RTPS submessages (see
//! `messages/submessages/gap.rs` in the teacher crate). The magic number is
//! `0x53414652` ("SAFR" in ASCII, read little-endian), fixed by `spec.md`
//! §6.

use speedy::{Readable, Writable};

pub const MAGIC: u32 = 0x5341_4652;
pub const VERSION: u8 = 1;
pub const KIND_ANNOUNCEMENT: u8 = 1;
pub const KIND_STATE_PUBLICATION: u8 = 2;

/// Election announcement, broadcast periodically by every node through the
/// communication substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Readable, Writable)]
pub struct Announcement {
    pub magic: u32,
    pub version: u8,
    pub kind: u8,
    pub node_id: u64,
    pub birth_time: u64,
    pub type_id: u64,
    pub priority: u32,
}

impl Announcement {
    pub fn new(node_id: u64, birth_time: u64, type_id: u64, priority: u32) -> Self {
        Announcement {
            magic: MAGIC,
            version: VERSION,
            kind: KIND_ANNOUNCEMENT,
            node_id,
            birth_time,
            type_id,
            priority,
        }
    }

    /// `true` if the magic/version/kind triple identifies this buffer as a
    /// well-formed announcement. Anything else (bad magic, unknown version,
    /// wrong kind) is a malformed remote message: logged and discarded per
    /// `spec.md` §4.7, never treated as fatal.
    pub fn looks_like_announcement(bytes: &[u8]) -> bool {
        bytes.len() >= 6 && bytes[4] == VERSION && bytes[5] == KIND_ANNOUNCEMENT
    }
}

/// Fixed-size header prefixed to a state publication. The payload and the
/// optional trailing CRC32 follow immediately after this header in the
/// buffer and are not modeled as struct fields, because the payload is an
/// opaque byte range owned by the coordinator (`spec.md` §3, "State blob").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Readable, Writable)]
pub struct StatePublicationHeader {
    pub magic: u32,
    pub version: u8,
    pub kind: u8,
    pub payload_len: u32,
}

impl StatePublicationHeader {
    pub fn new(payload_len: u32) -> Self {
        StatePublicationHeader {
            magic: MAGIC,
            version: VERSION,
            kind: KIND_STATE_PUBLICATION,
            payload_len,
        }
    }
}
