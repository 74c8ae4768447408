//! Dense `index -> session` table
//!
//! Lookups on the datagram path are lock-free loads. Allocation and release
//! go through one mutex guarding the free-index cursor.

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;
use tnl_protocol::{SessionIndex, MAX_SESSION_INDEX, MIN_SESSION_INDEX};

use super::session::ServerSession;
use crate::error::{Error, Result};

struct Allocator {
    reserved: Vec<bool>,
    next: u16,
    live: usize,
}

pub struct SessionRegistry {
    table: Box<[ArcSwapOption<ServerSession>]>,
    alloc: Mutex<Allocator>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        let size = MAX_SESSION_INDEX as usize + 1;
        Self {
            table: (0..size).map(|_| ArcSwapOption::empty()).collect(),
            alloc: Mutex::new(Allocator {
                reserved: vec![false; size],
                next: MIN_SESSION_INDEX,
                live: 0,
            }),
        }
    }

    /// Reserve a free index; `Congestion` when all are taken
    pub fn reserve(&self) -> Result<SessionIndex> {
        let mut alloc = self.alloc.lock().unwrap_or_else(|e| e.into_inner());
        let span = (MAX_SESSION_INDEX - MIN_SESSION_INDEX) as usize + 1;
        let mut candidate = alloc.next;
        for _ in 0..span {
            if !alloc.reserved[candidate as usize] {
                alloc.reserved[candidate as usize] = true;
                alloc.live += 1;
                alloc.next = if candidate == MAX_SESSION_INDEX {
                    MIN_SESSION_INDEX
                } else {
                    candidate + 1
                };
                return Ok(SessionIndex(candidate));
            }
            candidate = if candidate == MAX_SESSION_INDEX {
                MIN_SESSION_INDEX
            } else {
                candidate + 1
            };
        }
        Err(Error::Congestion("no free session index".into()))
    }

    /// Publish a session under its reserved index
    pub fn insert(&self, session: Arc<ServerSession>) {
        self.table[session.index.value() as usize].store(Some(session));
    }

    /// Unpublish and free `index`, returning the session that held it
    pub fn release(&self, index: SessionIndex) -> Option<Arc<ServerSession>> {
        let slot = index.value() as usize;
        if slot >= self.table.len() {
            return None;
        }
        let mut alloc = self.alloc.lock().unwrap_or_else(|e| e.into_inner());
        let previous = self.table[slot].swap(None);
        if alloc.reserved[slot] {
            alloc.reserved[slot] = false;
            alloc.live -= 1;
        }
        previous
    }

    pub fn get(&self, index: SessionIndex) -> Option<Arc<ServerSession>> {
        self.table.get(index.value() as usize)?.load_full()
    }

    /// Reserved indexes, published or not
    pub fn len(&self) -> usize {
        self.alloc.lock().unwrap_or_else(|e| e.into_inner()).live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Published sessions
    pub fn sessions(&self) -> Vec<Arc<ServerSession>> {
        self.table.iter().filter_map(|s| s.load_full()).collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::server::session::test_session;

    #[test]
    fn test_indexes_start_at_one() {
        let reg = SessionRegistry::new();
        assert_eq!(reg.reserve().unwrap(), SessionIndex(1));
        assert_eq!(reg.reserve().unwrap(), SessionIndex(2));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_release_frees_index() {
        let reg = SessionRegistry::new();
        let index = reg.reserve().unwrap();
        reg.insert(test_session(index.value(), 4));
        assert!(reg.get(index).is_some());

        assert!(reg.release(index).is_some());
        assert!(reg.get(index).is_none());
        assert!(reg.is_empty());
        assert!(reg.release(index).is_none());
    }

    #[test]
    fn test_exhaustion_is_congestion() {
        let reg = SessionRegistry::new();
        for _ in MIN_SESSION_INDEX..=MAX_SESSION_INDEX {
            reg.reserve().unwrap();
        }
        assert_eq!(reg.reserve().unwrap_err().kind(), ErrorKind::Congestion);

        reg.release(SessionIndex(77));
        assert_eq!(reg.reserve().unwrap(), SessionIndex(77));
    }
}
