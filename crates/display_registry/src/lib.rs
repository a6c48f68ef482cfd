use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

/// Identity of one windowing-system display connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayRegistryConfig {
    pub capacity: usize,
}

impl Default for DisplayRegistryConfig {
    fn default() -> Self {
        // Main, compositor, and media threads each keep their own
        // connection; anything past that is a leak until proven otherwise.
        Self { capacity: 3 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    CapacityExceeded { capacity: usize },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::CapacityExceeded { capacity } => {
                write!(
                    formatter,
                    "display connection registry is full ({capacity} connections)"
                )
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Process-wide table of per-thread display connections.
///
/// Every thread that talks to the windowing system operates its own event
/// queue, so connections are keyed by (connection identity, thread
/// identity). The payload is whatever capability bundle the platform glue
/// hands out: a GPU device node, a shared-memory factory, an event loop
/// handle.
#[derive(Debug)]
pub struct DisplayRegistry<Caps> {
    capacity: usize,
    connections: Mutex<HashMap<(ConnectionId, ThreadId), Arc<Caps>>>,
}

impl<Caps> DisplayRegistry<Caps> {
    pub fn new() -> Self {
        Self::with_config(DisplayRegistryConfig::default())
    }

    pub fn with_config(config: DisplayRegistryConfig) -> Self {
        assert!(
            config.capacity > 0,
            "display registry capacity must be greater than zero"
        );
        Self {
            capacity: config.capacity,
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The calling thread's entry for `connection`, building it on first
    /// use. Fails with a typed error once the registry is full; callers
    /// decide whether that is fatal.
    pub fn acquire(
        &self,
        connection: ConnectionId,
        build: impl FnOnce() -> Caps,
    ) -> Result<Arc<Caps>, RegistryError> {
        let key = (connection, thread::current().id());
        let mut connections = self.lock_connections();
        if let Some(existing) = connections.get(&key) {
            return Ok(Arc::clone(existing));
        }
        if connections.len() >= self.capacity {
            return Err(RegistryError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        let capabilities = Arc::new(build());
        connections.insert(key, Arc::clone(&capabilities));
        Ok(capabilities)
    }

    /// The calling thread's entry for `connection`, if it exists.
    pub fn lookup(&self, connection: ConnectionId) -> Option<Arc<Caps>> {
        let key = (connection, thread::current().id());
        self.lock_connections().get(&key).cloned()
    }

    /// Drop `connection`'s entries for every thread. Returns how many were
    /// removed.
    pub fn remove_connection(&self, connection: ConnectionId) -> usize {
        let mut connections = self.lock_connections();
        let before = connections.len();
        connections.retain(|(held, _), _| *held != connection);
        before - connections.len()
    }

    pub fn clear(&self) {
        self.lock_connections().clear();
    }

    pub fn len(&self) -> usize {
        self.lock_connections().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_connections().is_empty()
    }

    fn lock_connections(
        &self,
    ) -> MutexGuard<'_, HashMap<(ConnectionId, ThreadId), Arc<Caps>>> {
        self.connections
            .lock()
            .expect("display registry table lock poisoned")
    }
}

impl<Caps> Default for DisplayRegistry<Caps> {
    fn default() -> Self {
        Self::new()
    }
}
