//! Handle tables: integer handles and their validity.
//!
//! A [`HandleTable`] issues opaque [`Handle`] values for one category
//! (servers, listeners, or connections) and remembers which are still live.
//! Each live handle carries the entry the bridge associated with it.
//!
//! Closing a handle retires it; any later lookup or second close returns
//! [`BridgeError::BadHandle`] so double-close bugs surface instead of being
//! tolerated. The table never releases OS resources itself; callers own
//! whatever the removed entry holds.
//!
//! Every operation takes the table's mutex, so `allocate`, `close`, and
//! lookups are atomic with respect to each other across threads. Entries
//! are handed out as `Arc`s so no caller holds the lock while it blocks.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{BridgeError, Result};

/// Opaque non-negative integer naming a server, listener, or connection.
///
/// A handle's category comes from the operation that produced it, never
/// from its numeric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u32);

impl Handle {
    /// Wrap a raw handle value received from a caller or the wire.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw integer value.
    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Category of handles a table issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// Runtime server instance.
    Server,
    /// Listener backed by a descriptor transfer channel.
    Listener,
    /// Connected stream descriptor.
    Conn,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Listener => write!(f, "listener"),
            Self::Conn => write!(f, "conn"),
        }
    }
}

/// Largest raw value issued before numbering wraps back to the base.
///
/// Kept within `i32` so handles survive a round trip through C `int`.
const MAX_RAW: u32 = i32::MAX as u32;

struct TableInner<T> {
    next: u32,
    live: HashMap<u32, Arc<T>>,
}

/// Thread-safe map from live handles to their entries.
pub struct HandleTable<T> {
    kind: HandleKind,
    base: u32,
    inner: Mutex<TableInner<T>>,
}

impl<T> fmt::Debug for HandleTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleTable")
            .field("kind", &self.kind)
            .field("base", &self.base)
            .field("live", &self.len())
            .finish()
    }
}

impl<T> HandleTable<T> {
    /// Create an empty table whose first handle is `base`.
    #[must_use]
    pub fn new(kind: HandleKind, base: u32) -> Self {
        Self {
            kind,
            base,
            inner: Mutex::new(TableInner {
                next: base,
                live: HashMap::new(),
            }),
        }
    }

    /// Category this table issues.
    #[must_use]
    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    fn lock(&self) -> MutexGuard<'_, TableInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `entry` under a fresh handle.
    ///
    /// Never returns a handle that is still live. Numbering is monotonic and
    /// wraps back to the base, skipping values still in use.
    pub fn allocate(&self, entry: T) -> Handle {
        let mut inner = self.lock();
        let mut raw = inner.next;
        while inner.live.contains_key(&raw) {
            raw = advance(raw, self.base);
        }
        inner.next = advance(raw, self.base);
        inner.live.insert(raw, Arc::new(entry));
        Handle(raw)
    }

    /// Look up a live handle.
    pub fn get(&self, handle: Handle) -> Result<Arc<T>> {
        self.lock()
            .live
            .get(&handle.0)
            .cloned()
            .ok_or(BridgeError::BadHandle(handle))
    }

    /// True while `handle` is live.
    #[must_use]
    pub fn contains(&self, handle: Handle) -> bool {
        self.lock().live.contains_key(&handle.0)
    }

    /// Retire `handle`, returning its entry.
    ///
    /// A second close of the same handle returns `BadHandle`.
    pub fn close(&self, handle: Handle) -> Result<Arc<T>> {
        self.lock()
            .live
            .remove(&handle.0)
            .ok_or(BridgeError::BadHandle(handle))
    }

    /// Live handles whose entries satisfy `pred`.
    pub fn handles_where(&self, pred: impl Fn(&T) -> bool) -> Vec<Handle> {
        let mut handles: Vec<Handle> = self
            .lock()
            .live
            .iter()
            .filter(|(_, entry)| pred(entry))
            .map(|(raw, _)| Handle(*raw))
            .collect();
        handles.sort_unstable();
        handles
    }

    /// Number of live handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().live.len()
    }

    /// True when no handle is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn advance(raw: u32, base: u32) -> u32 {
    if raw >= MAX_RAW {
        base
    } else {
        raw + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_allocate_returns_distinct_handles() {
        let table = HandleTable::new(HandleKind::Server, 100);
        let a = table.allocate("a");
        let b = table.allocate("b");
        assert_ne!(a, b);
        assert_eq!(a.as_raw(), 100);
        assert_eq!(*table.get(b).unwrap(), "b");
    }

    #[test]
    fn test_double_close_is_bad_handle() {
        let table = HandleTable::new(HandleKind::Listener, 1);
        let h = table.allocate(());
        assert!(table.close(h).is_ok());
        assert!(matches!(table.close(h), Err(BridgeError::BadHandle(got)) if got == h));
        assert!(matches!(table.get(h), Err(BridgeError::BadHandle(_))));
        assert!(!table.contains(h));
    }

    #[test]
    fn test_unknown_handle_is_bad_handle() {
        let table: HandleTable<()> = HandleTable::new(HandleKind::Conn, 1);
        assert!(matches!(
            table.get(Handle::from_raw(999)),
            Err(BridgeError::BadHandle(_))
        ));
    }

    #[test]
    fn test_wraparound_skips_live_handles() {
        let table = HandleTable::new(HandleKind::Conn, MAX_RAW - 2);
        let a = table.allocate(1);
        let b = table.allocate(2);
        let c = table.allocate(3);
        assert_eq!(c.as_raw(), MAX_RAW);
        table.close(b).unwrap();

        // Numbering wraps to the base (still live) and lands on b's freed value.
        let d = table.allocate(4);
        assert_eq!(d, b);
        assert_ne!(d, a);
        assert_ne!(d, c);
    }

    #[test]
    fn test_concurrent_allocate_and_close() {
        let table = Arc::new(HandleTable::new(HandleKind::Conn, 1));
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    let mut kept = Vec::new();
                    for i in 0..200 {
                        let h = table.allocate(i);
                        if i % 2 == 0 {
                            table.close(h).unwrap();
                        } else {
                            kept.push(h);
                        }
                    }
                    kept
                })
            })
            .collect();

        let mut all: Vec<Handle> = workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total, "live handles must be unique");
        assert_eq!(table.len(), total);
    }

    #[test]
    fn test_handles_where_filters_entries() {
        let table = HandleTable::new(HandleKind::Listener, 1);
        let a = table.allocate(10);
        let _b = table.allocate(20);
        let c = table.allocate(10);
        assert_eq!(table.handles_where(|v| *v == 10), vec![a, c]);
    }
}
