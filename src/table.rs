use dusa_collection_utils::core::errors::ErrorArrayItem;
use dusa_collection_utils::core::logger::LogLevel;
use dusa_collection_utils::log;
use std::os::unix::io::RawFd;

/// How a dead slot should be treated by the reaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespawnType {
    /// Replace the child on death, in the same slot.
    Respawn,
    /// Same as [`RespawnType::Respawn`], but the new slot starts with `just_spawn` set
    /// so the next broadcast does not immediately drain it.
    JustRespawn,
    /// Do not replace the child; free the slot on reap.
    Once,
}

/// A single supervised-worker slot, mirroring the spec's process table entry.
#[derive(Debug, Clone)]
pub struct Slot {
    pub pid: i32,
    /// Master-side end of the channel socketpair (index 0 in the spec's `channel[2]`).
    pub master_fd: Option<RawFd>,
    /// Child-side end, only ever meaningful before fork; master never reads from it.
    pub worker_fd: Option<RawFd>,
    pub name: String,
    pub respawn: RespawnType,
    pub just_spawn: bool,
    pub exiting: bool,
    pub exited: bool,
    pub detached: bool,
}

impl Slot {
    fn empty() -> Self {
        Self {
            pid: -1,
            master_fd: None,
            worker_fd: None,
            name: String::new(),
            respawn: RespawnType::Once,
            just_spawn: false,
            exiting: false,
            exited: false,
            detached: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pid == -1
    }
}

/// The master's process table: a fixed-growth vector of slots plus a tight high-water
/// mark, per the spec's "Process table" data model.
#[derive(Debug, Default)]
pub struct ProcessTable {
    slots: Vec<Slot>,
    last_process: usize,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            last_process: 0,
        }
    }

    pub fn last_process(&self) -> usize {
        self.last_process
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_process == 0
    }

    pub fn get(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Slot> {
        self.slots.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Slot)> {
        self.slots.iter().enumerate()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut Slot)> {
        self.slots.iter_mut().enumerate()
    }

    /// Allocates a slot for a new child: reuses the first empty slot at or below the
    /// high-water mark, or grows the table. Returns the slot index.
    pub fn allocate(&mut self) -> usize {
        for i in 0..self.last_process {
            if self.slots[i].is_empty() {
                log!(LogLevel::Trace, "Reusing empty process table slot {}", i);
                self.slots[i].pid = 0; // reserved, pending install()
                return i;
            }
        }

        let index = self.slots.len();
        let mut slot = Slot::empty();
        slot.pid = 0; // reserved, pending install()
        self.slots.push(slot);
        self.last_process = index + 1;
        log!(LogLevel::Trace, "Grew process table to slot {}", index);
        index
    }

    /// Installs a freshly spawned child into `index`, growing the table (and pulling
    /// the high-water mark up) if `index` is beyond the current tight range. Used both
    /// for freshly allocated slots and to reinstall directly into a slot a dead child
    /// just vacated, without going through `allocate()`'s hole-scan.
    pub fn install(
        &mut self,
        index: usize,
        pid: i32,
        master_fd: RawFd,
        worker_fd: RawFd,
        name: impl Into<String>,
        respawn: RespawnType,
    ) -> Result<(), ErrorArrayItem> {
        let just_spawn = matches!(respawn, RespawnType::JustRespawn);
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, Slot::empty);
        }
        if index + 1 > self.last_process {
            self.last_process = index + 1;
        }
        let slot = &mut self.slots[index];
        *slot = Slot {
            pid,
            master_fd: Some(master_fd),
            worker_fd: Some(worker_fd),
            name: name.into(),
            respawn,
            just_spawn,
            exiting: false,
            exited: false,
            detached: false,
        };
        Ok(())
    }

    /// Marks the high-water-tight slot at `index` as empty, shrinking `last_process`
    /// when the emptied slot was the topmost one; otherwise leaves a hole.
    pub fn free(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = Slot::empty();
        }
        if index + 1 == self.last_process {
            while self.last_process > 0 && self.slots[self.last_process - 1].is_empty() {
                self.last_process -= 1;
            }
            self.slots.truncate(self.last_process);
        }
    }

    /// Checks the table-tightness invariant: `last_process == 1 + max occupied index`.
    pub fn is_tight(&self) -> bool {
        let expected = self
            .slots
            .iter()
            .enumerate()
            .rev()
            .find(|(_, s)| !s.is_empty())
            .map(|(i, _)| i + 1)
            .unwrap_or(0);
        expected == self.last_process
    }
}

#[cfg(test)]
mod table_tests {
    use super::*;

    #[test]
    fn allocate_grows_and_reuses() {
        let mut table = ProcessTable::new();
        let a = table.allocate();
        let b = table.allocate();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(table.last_process(), 2);

        table
            .install(a, 100, 3, 4, "worker", RespawnType::Respawn)
            .unwrap();
        table
            .install(b, 101, 5, 6, "worker", RespawnType::Respawn)
            .unwrap();

        table.free(b);
        assert_eq!(table.last_process(), 1, "freeing the top slot shrinks hwm");
        assert!(table.is_tight());

        let c = table.allocate();
        assert_eq!(c, 1, "reallocation reuses the freed top slot");
    }

    #[test]
    fn freeing_interior_slot_leaves_a_hole() {
        let mut table = ProcessTable::new();
        let a = table.allocate();
        let b = table.allocate();
        let c = table.allocate();
        table
            .install(a, 1, 1, 2, "w", RespawnType::Respawn)
            .unwrap();
        table
            .install(b, 2, 3, 4, "w", RespawnType::Respawn)
            .unwrap();
        table
            .install(c, 3, 5, 6, "w", RespawnType::Respawn)
            .unwrap();

        table.free(a);
        assert_eq!(table.last_process(), 3, "interior free does not shrink hwm");
        assert!(table.get(a).unwrap().is_empty());
        assert!(table.is_tight());

        let reused = table.allocate();
        assert_eq!(reused, a, "interior hole is reused before growing");
    }
}
