//! Connect request arbiter (C6): the tagged-union request/response slots and
//! the admission policy that decides what a Connect or Disconnect attempt
//! does to the shared connection index.
//!
//! Grounded in `ConnectRequest.cpp` from the original sources: the slot's
//! `kind` field is its only synchronizer, and every operation that would
//! violate the producer/consumer discipline on it is an `ENSURE`-style fatal
//! assertion, not a `Result` the caller is expected to handle (`spec.md`
//! §3, §9 "Tagged unions").

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use crate::connection::{Connection, ConnectionId};
use crate::error::fatal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestTag {
    NotSet,
    Connect,
    Disconnect,
}

/// The two-slot IPC request, modeled as a sum type per `spec.md` §9 rather
/// than a class with setter chains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectRequest {
    NotSet,
    Connect {
        name: String,
        context: i64,
        pid: i32,
    },
    Disconnect {
        connection: ConnectionId,
    },
}

impl ConnectRequest {
    fn tag(&self) -> RequestTag {
        match self {
            ConnectRequest::NotSet => RequestTag::NotSet,
            ConnectRequest::Connect { .. } => RequestTag::Connect,
            ConnectRequest::Disconnect { .. } => RequestTag::Disconnect,
        }
    }
}

/// A shared-memory-style request slot. `set` is the producer operation,
/// `take` the consumer operation; the slot's occupancy is its own
/// synchronizer, so calling either out of turn is a programmer error, not a
/// recoverable condition.
pub struct ConnectRequestSlot {
    inner: Mutex<ConnectRequest>,
}

impl ConnectRequestSlot {
    pub fn new() -> Self {
        ConnectRequestSlot {
            inner: Mutex::new(ConnectRequest::NotSet),
        }
    }

    /// Occupies the slot. Fatal if the slot is not currently `NotSet`.
    pub fn set(&self, request: ConnectRequest) {
        let mut guard = self.inner.lock().unwrap();
        if guard.tag() != RequestTag::NotSet {
            fatal(format!(
                "ConnectRequest::set called while slot already held a {:?}",
                guard.tag()
            ));
        }
        *guard = request;
    }

    /// Drains the slot, resetting it to `NotSet`. Fatal if the slot is
    /// already empty -- a consumer only ever drains in response to a signal
    /// that a request has been set.
    pub fn take(&self) -> ConnectRequest {
        let mut guard = self.inner.lock().unwrap();
        if guard.tag() == RequestTag::NotSet {
            fatal("ConnectRequest::take called on an empty slot");
        }
        std::mem::replace(&mut *guard, ConnectRequest::NotSet)
    }
}

impl Default for ConnectRequestSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a connect/disconnect attempt (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectResult {
    Success,
    ConnectionNameAlreadyExists,
    TooManyProcesses,
    Undefined,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    pub result: ConnectResult,
    pub connection: Option<ConnectionId>,
}

/// Symmetric to [`ConnectRequestSlot`], carrying the arbiter's reply.
pub struct ConnectResponseSlot {
    inner: Mutex<Option<ConnectResponse>>,
}

impl ConnectResponseSlot {
    pub fn new() -> Self {
        ConnectResponseSlot {
            inner: Mutex::new(None),
        }
    }

    /// Occupies the slot. Fatal if a previous response has not yet been
    /// collected.
    pub fn set(&self, response: ConnectResponse) {
        let mut guard = self.inner.lock().unwrap();
        if guard.is_some() {
            fatal("ConnectResponse::set called while a response was still pending");
        }
        *guard = Some(response);
    }

    /// Drains the slot. Fatal if no response is pending.
    pub fn take(&self) -> ConnectResponse {
        let mut guard = self.inner.lock().unwrap();
        match guard.take() {
            Some(response) => response,
            None => fatal("ConnectResponse::take called on an empty slot"),
        }
    }
}

impl Default for ConnectResponseSlot {
    fn default() -> Self {
        Self::new()
    }
}

struct Index {
    by_id: BTreeMap<ConnectionId, Connection>,
    names: HashSet<String>,
    counts_by_pid: HashMap<i32, usize>,
    next_counter: i64,
}

/// Admits or rejects connect/disconnect attempts against a per-process
/// admission cap and a name-uniqueness index.
///
/// Single-threaded by construction (`spec.md` §4.6): callers are expected to
/// drive [`ConnectArbiter::process`] from a single strand (see
/// [`crate::connection_handler::ConnectionHandler`]) so that simultaneous
/// Connect requests for the same name are resolved by arrival order rather
/// than needing their own lock-free protocol; the internal mutex here only
/// guards against this struct being shared across strands in tests.
pub struct ConnectArbiter {
    index: Mutex<Index>,
    admission_cap: usize,
}

impl ConnectArbiter {
    pub fn new(admission_cap: usize) -> Self {
        ConnectArbiter {
            index: Mutex::new(Index {
                by_id: BTreeMap::new(),
                names: HashSet::new(),
                counts_by_pid: HashMap::new(),
                next_counter: 0,
            }),
            admission_cap,
        }
    }

    /// Processes one request end to end, atomic per the (request, response)
    /// pair (`spec.md` §4.6). `node_id` seeds freshly allocated
    /// [`ConnectionId`]s for this node.
    pub fn process(&self, node_id: i64, request: ConnectRequest) -> ConnectResponse {
        match request {
            ConnectRequest::NotSet => fatal("ConnectArbiter::process called with an empty request"),
            ConnectRequest::Connect { name, context, pid } => {
                self.connect(node_id, name, context, pid)
            }
            ConnectRequest::Disconnect { connection } => self.disconnect(connection),
        }
    }

    fn connect(&self, node_id: i64, name: String, context: i64, pid: i32) -> ConnectResponse {
        let mut index = self.index.lock().unwrap();

        if index.names.contains(&name) {
            return ConnectResponse {
                result: ConnectResult::ConnectionNameAlreadyExists,
                connection: None,
            };
        }

        let current_count = index.counts_by_pid.get(&pid).copied().unwrap_or(0);
        if current_count >= self.admission_cap {
            return ConnectResponse {
                result: ConnectResult::TooManyProcesses,
                connection: None,
            };
        }

        let counter = index.next_counter;
        index.next_counter += 1;
        let id = ConnectionId {
            node_id,
            context_id: context,
            counter,
        };
        let connection = Connection::new(id, name.clone(), pid, context);
        index.by_id.insert(id, connection);
        index.names.insert(name);
        *index.counts_by_pid.entry(pid).or_insert(0) += 1;

        ConnectResponse {
            result: ConnectResult::Success,
            connection: Some(id),
        }
    }

    fn disconnect(&self, id: ConnectionId) -> ConnectResponse {
        let mut index = self.index.lock().unwrap();

        let Some(connection) = index.by_id.get(&id) else {
            // Idempotent on an unknown or already-destroyed connection.
            return ConnectResponse {
                result: ConnectResult::Success,
                connection: None,
            };
        };
        if !connection.is_open() {
            return ConnectResponse {
                result: ConnectResult::Success,
                connection: None,
            };
        }

        let pid = connection.pid;
        let name = connection.name.clone();
        index.by_id.remove(&id);
        index.names.remove(&name);
        if let Some(count) = index.counts_by_pid.get_mut(&pid) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                index.counts_by_pid.remove(&pid);
            }
        }

        ConnectResponse {
            result: ConnectResult::Success,
            connection: Some(id),
        }
    }

    /// Mirrors a connect already admitted on its origin node into this
    /// node's local index, bypassing the admission cap: the origin node
    /// was authoritative for that decision (`spec.md` §4.7). Used only by
    /// [`crate::connection_handler::ConnectionHandler::on_remote_connect`].
    pub fn mirror_remote_connect(&self, id: ConnectionId, name: String, pid: i32, context: i64) {
        let mut index = self.index.lock().unwrap();
        if index.by_id.contains_key(&id) {
            return; // already mirrored; remote delivery is best-effort and may repeat
        }
        let connection = Connection::new(id, name.clone(), pid, context);
        index.by_id.insert(id, connection);
        index.names.insert(name);
        *index.counts_by_pid.entry(pid).or_insert(0) += 1;
    }

    /// Every currently open connection belonging to `pid`, for the process
    /// monitor's eviction path (`spec.md` §8 scenario 6).
    pub fn connections_for_pid(&self, pid: i32) -> Vec<ConnectionId> {
        self.index
            .lock()
            .unwrap()
            .by_id
            .values()
            .filter(|c| c.pid == pid && c.is_open())
            .map(|c| c.id)
            .collect()
    }

    pub fn open_connection_count(&self) -> usize {
        self.index
            .lock()
            .unwrap()
            .by_id
            .values()
            .filter(|c| c.is_open())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(1, 1 ; "cap of one rejects the second connection")]
    #[test_case(4, 4 ; "cap of four rejects the fifth connection")]
    #[test_case(8, 8 ; "cap of eight rejects the ninth connection")]
    fn admission_cap_rejects_exactly_one_past_the_configured_limit(cap: usize, accepted: usize) {
        let arbiter = ConnectArbiter::new(cap);
        for i in 0..accepted {
            let response = arbiter.process(
                1,
                ConnectRequest::Connect {
                    name: format!("conn-{i}"),
                    context: 0,
                    pid: 1000,
                },
            );
            assert_eq!(response.result, ConnectResult::Success);
        }
        let over_limit = arbiter.process(
            1,
            ConnectRequest::Connect {
                name: "one-too-many".into(),
                context: 0,
                pid: 1000,
            },
        );
        assert_eq!(over_limit.result, ConnectResult::TooManyProcesses);
        assert_eq!(arbiter.open_connection_count(), accepted);
    }

    #[test]
    fn duplicate_name_is_rejected_after_first_success() {
        let arbiter = ConnectArbiter::new(4);

        let first = arbiter.process(
            1,
            ConnectRequest::Connect {
                name: "A".into(),
                context: 0,
                pid: 1000,
            },
        );
        assert_eq!(first.result, ConnectResult::Success);
        assert!(first.connection.is_some());

        let second = arbiter.process(
            1,
            ConnectRequest::Connect {
                name: "A".into(),
                context: 0,
                pid: 1000,
            },
        );
        assert_eq!(second.result, ConnectResult::ConnectionNameAlreadyExists);
        assert_eq!(second.connection, None);
    }

    #[test]
    fn admission_cap_rejects_the_fifth_connection_from_one_pid() {
        let arbiter = ConnectArbiter::new(4);

        for name in ["A", "B", "C", "D"] {
            let response = arbiter.process(
                1,
                ConnectRequest::Connect {
                    name: name.into(),
                    context: 0,
                    pid: 1000,
                },
            );
            assert_eq!(response.result, ConnectResult::Success);
        }

        let fifth = arbiter.process(
            1,
            ConnectRequest::Connect {
                name: "E".into(),
                context: 0,
                pid: 1000,
            },
        );
        assert_eq!(fifth.result, ConnectResult::TooManyProcesses);
        assert_eq!(arbiter.open_connection_count(), 4);
    }

    #[test]
    fn disconnect_frees_the_name_and_the_admission_slot() {
        let arbiter = ConnectArbiter::new(1);

        let connect = arbiter.process(
            1,
            ConnectRequest::Connect {
                name: "A".into(),
                context: 0,
                pid: 1000,
            },
        );
        let id = connect.connection.unwrap();

        let disconnect = arbiter.process(1, ConnectRequest::Disconnect { connection: id });
        assert_eq!(disconnect.result, ConnectResult::Success);
        assert_eq!(arbiter.open_connection_count(), 0);

        let reconnect = arbiter.process(
            1,
            ConnectRequest::Connect {
                name: "A".into(),
                context: 0,
                pid: 1000,
            },
        );
        assert_eq!(reconnect.result, ConnectResult::Success);
    }

    #[test]
    fn disconnect_of_an_already_closed_connection_is_idempotent() {
        let arbiter = ConnectArbiter::new(4);
        let connect = arbiter.process(
            1,
            ConnectRequest::Connect {
                name: "A".into(),
                context: 0,
                pid: 1000,
            },
        );
        let id = connect.connection.unwrap();

        assert_eq!(
            arbiter
                .process(1, ConnectRequest::Disconnect { connection: id })
                .result,
            ConnectResult::Success
        );
        assert_eq!(
            arbiter
                .process(1, ConnectRequest::Disconnect { connection: id })
                .result,
            ConnectResult::Success
        );
    }

    #[test]
    fn connections_for_pid_lists_only_that_pids_open_connections() {
        let arbiter = ConnectArbiter::new(4);
        arbiter.process(
            1,
            ConnectRequest::Connect {
                name: "A".into(),
                context: 0,
                pid: 1234,
            },
        );
        arbiter.process(
            1,
            ConnectRequest::Connect {
                name: "B".into(),
                context: 0,
                pid: 1234,
            },
        );
        arbiter.process(
            1,
            ConnectRequest::Connect {
                name: "C".into(),
                context: 0,
                pid: 5678,
            },
        );

        let mut ids = arbiter.connections_for_pid(1234);
        ids.sort();
        assert_eq!(ids.len(), 2);
        assert_eq!(arbiter.connections_for_pid(5678).len(), 1);
    }
}
