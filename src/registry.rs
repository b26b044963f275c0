//! Connection Registry (§4.2): id -> `Connection`, plus fd -> id for
//! translating backend results back to records.
//!
//! Grounded on the teacher's `runtime/connection.rs` `ConnectionRegistry`
//! (slab-based storage, O(1) insert/lookup/remove), extended with a
//! generation counter per slot. The spec's design notes flag the source's
//! stringified-pointer ids as an address-reuse hazard and recommend an
//! opaque, generation-indexed handle instead — slab indices alone get
//! reused the instant a slot frees, which would let a stale `ConnId` held
//! by user code silently resolve to an unrelated, later connection.

use crate::connection::Connection;
use slab::Slab;
use std::collections::HashMap;
use std::os::unix::io::RawFd;

/// Opaque, stable connection identifier. Two ids are equal only if they
/// name the same slot *generation* — a dropped and reused slot gets a
/// fresh generation, so a caller holding an old id safely gets `None`
/// rather than someone else's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId {
    index: usize,
    generation: u64,
}

struct Slot {
    generation: u64,
    conn: Connection,
}

pub struct ConnectionRegistry {
    slots: Slab<Slot>,
    fd_index: HashMap<RawFd, ConnId>,
    next_generation: u64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            slots: Slab::new(),
            fd_index: HashMap::new(),
            next_generation: 1,
        }
    }

    pub fn insert(&mut self, fd: RawFd, conn: Connection) -> ConnId {
        let generation = self.next_generation;
        self.next_generation += 1;
        let index = self.slots.insert(Slot { generation, conn });
        let id = ConnId { index, generation };
        self.fd_index.insert(fd, id);
        id
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.slots
            .get(id.index)
            .filter(|slot| slot.generation == id.generation)
            .map(|slot| &slot.conn)
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.slots
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation)
            .map(|slot| &mut slot.conn)
    }

    pub fn lookup_by_fd(&self, fd: RawFd) -> Option<ConnId> {
        self.fd_index.get(&fd).copied()
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.get(id).is_some()
    }

    /// Remove a connection by id. Idempotent-safe: removing an id that is
    /// already gone (or was never valid) is a silent no-op, which is what
    /// lets an error handler drop a connection that a later dispatch in
    /// the same iteration would otherwise have visited (§4.2).
    pub fn remove(&mut self, id: ConnId) -> Option<Connection> {
        if !self.contains(id) {
            return None;
        }
        let slot = self.slots.remove(id.index);
        let fd = fd_of(&slot.conn);
        self.fd_index.remove(&fd);
        Some(slot.conn)
    }

    pub fn iter_ids(&self) -> Vec<ConnId> {
        self.slots
            .iter()
            .map(|(index, slot)| ConnId {
                index,
                generation: slot.generation,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

fn fd_of(conn: &Connection) -> RawFd {
    use std::os::unix::io::AsRawFd;
    conn.socket.as_raw_fd()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Role;
    use crate::socket::AnySocket;
    use mio::net::TcpStream;
    use std::net::TcpListener;

    fn dummy_socket() -> (AnySocket, RawFd) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).unwrap();
        use std::os::unix::io::AsRawFd;
        let fd = stream.as_raw_fd();
        (AnySocket::Tcp(stream), fd)
    }

    #[test]
    fn insert_lookup_remove_roundtrip() {
        let mut reg = ConnectionRegistry::new();
        let (sock, fd) = dummy_socket();
        let id = reg.insert(fd, Connection::new(sock, Role::Client, false, true));

        assert_eq!(reg.lookup_by_fd(fd), Some(id));
        assert!(reg.get(id).is_some());

        reg.remove(id);
        assert!(reg.get(id).is_none());
        assert_eq!(reg.lookup_by_fd(fd), None);

        // Idempotent: removing again is a no-op, not a panic.
        assert!(reg.remove(id).is_none());
    }

    #[test]
    fn stale_id_does_not_alias_reused_slot() {
        let mut reg = ConnectionRegistry::new();
        let (sock1, fd1) = dummy_socket();
        let id1 = reg.insert(fd1, Connection::new(sock1, Role::Client, false, true));
        reg.remove(id1);

        let (sock2, fd2) = dummy_socket();
        let id2 = reg.insert(fd2, Connection::new(sock2, Role::Client, false, true));

        // Even if the slab happened to reuse the same slot index, the old
        // id must not resolve to the new connection.
        assert!(reg.get(id1).is_none());
        assert!(reg.get(id2).is_some());
    }
}
