use std::collections::HashSet;
use std::sync::Mutex;

use bitvec::prelude::{BitVec, Lsb0};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotIndex(pub u32);

/// Fixed-slot shared-memory pool backing one remote allocator channel.
///
/// Occupancy is the client-side view of the remote slot namespace: a slot
/// stays occupied until the buffer holding it drops AND the compositor no
/// longer references it. Slots whose buffer died while still attached
/// remotely are parked, not released; the compositor-side remove (or channel
/// teardown) reclaims them.
#[derive(Debug)]
pub struct ShmemArena {
    slot_len: usize,
    state: Mutex<ArenaState>,
}

#[derive(Debug)]
struct ArenaState {
    occupancy: BitVec<usize, Lsb0>,
    parked: HashSet<u32>,
}

impl ShmemArena {
    pub fn new(slot_count: u32, slot_len: usize) -> Self {
        assert!(slot_count > 0, "shmem arena slot count must be greater than zero");
        assert!(slot_len > 0, "shmem arena slot length must be greater than zero");
        Self {
            slot_len,
            state: Mutex::new(ArenaState {
                occupancy: BitVec::repeat(false, slot_count as usize),
                parked: HashSet::new(),
            }),
        }
    }

    pub fn slot_len(&self) -> usize {
        self.slot_len
    }

    pub fn slot_count(&self) -> usize {
        self.lock_state().occupancy.len()
    }

    pub fn allocate_slot(&self) -> Option<SlotIndex> {
        let mut state = self.lock_state();
        let index = state.occupancy.iter().by_vals().position(|occupied| !occupied)?;
        let Some(mut slot) = state.occupancy.get_mut(index) else {
            panic!("free slot index lost between scan and claim");
        };
        *slot = true;
        drop(slot);
        Some(SlotIndex(index as u32))
    }

    pub fn release_slot(&self, slot: SlotIndex) {
        let mut state = self.lock_state();
        if state.parked.remove(&slot.0) {
            panic!("released shmem slot {} while it was parked", slot.0);
        }
        state.clear_occupied(slot);
    }

    /// Keep the slot occupied but mark it reclaimable once the remote side
    /// lets go of it.
    pub fn park_slot(&self, slot: SlotIndex) {
        let mut state = self.lock_state();
        let is_occupied = match state.occupancy.get(slot.0 as usize) {
            Some(occupied) => *occupied,
            None => panic!("parked shmem slot {} is out of bounds", slot.0),
        };
        if !is_occupied {
            panic!("parked shmem slot {} is not occupied", slot.0);
        }
        let inserted = state.parked.insert(slot.0);
        if !inserted {
            panic!("parked shmem slot {} twice", slot.0);
        }
    }

    /// Release a parked slot. Returns false if the slot was not parked
    /// (remove ops can race channel teardown, which reclaims in bulk).
    pub fn reclaim_slot(&self, slot: SlotIndex) -> bool {
        let mut state = self.lock_state();
        if !state.parked.remove(&slot.0) {
            return false;
        }
        state.clear_occupied(slot);
        true
    }

    pub fn reclaim_all_parked(&self) -> usize {
        let mut state = self.lock_state();
        let parked: Vec<u32> = state.parked.drain().collect();
        for raw in &parked {
            state.clear_occupied(SlotIndex(*raw));
        }
        parked.len()
    }

    pub fn occupied_slots(&self) -> usize {
        self.lock_state().occupancy.count_ones()
    }

    pub fn parked_slots(&self) -> usize {
        self.lock_state().parked.len()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ArenaState> {
        self.state.lock().expect("shmem arena state lock poisoned")
    }
}

impl ArenaState {
    fn clear_occupied(&mut self, slot: SlotIndex) {
        let Some(mut occupied) = self.occupancy.get_mut(slot.0 as usize) else {
            panic!("released shmem slot {} is out of bounds", slot.0);
        };
        if !*occupied {
            panic!("released shmem slot {} is not occupied", slot.0);
        }
        *occupied = false;
    }
}
