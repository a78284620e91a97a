//! Thread control blocks and the circular list that links them.
//!
//! Records live in a [slab::Slab] and refer to their neighbours by index, so unlinking a record
//! can never leave a dangling pointer behind. Slab indices get recycled, which is why external
//! references pair an index with the record's [ThreadId]: ids are never reused and act as the
//! generation of the slot.

use std::{fmt, mem};

use super::context_switch::Continuation;
use super::stack::Stack;

/// Unique identifier of a green thread.
/// Assigned in creation order and never reused by the same OS thread.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u64);

impl ThreadId {
    /// The raw identifier.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a green thread.
///
/// `Setup -> Ready -> Running -> Ready -> ... -> Running -> Finished`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum State {
    /// Created, stack not yet associated.
    Setup,
    /// Suspended with a valid continuation, waiting to be scheduled.
    Ready,
    /// The single context currently executing.
    Running,
    /// Its body returned, pending disposal.
    Finished,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Setup => "setup",
            State::Ready => "ready",
            State::Running => "running",
            State::Finished => "finished",
        };
        f.write_str(name)
    }
}

#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(super) struct RecordIndex(usize);

/// Whatever can hold the CPU: the driver or one of the records.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(super) enum Slot {
    Driver,
    Thread(RecordIndex),
}

/// A stack together with the continuation that points into it.
/// They are created together and dropped together, so a continuation can't outlive its stack.
#[derive(Debug)]
pub(super) struct Activation {
    pub(super) stack: Stack,
    pub(super) continuation: Continuation,
}

/// Thread control block.
pub(super) struct ThreadRecord {
    pub(super) id: ThreadId,
    pub(super) state: State,
    pub(super) body: Option<Box<dyn FnOnce()>>,
    pub(super) activation: Option<Activation>,
}

impl ThreadRecord {
    pub(super) fn new(id: ThreadId, body: Box<dyn FnOnce()>) -> Self {
        ThreadRecord {
            id,
            state: State::Setup,
            body: Some(body),
            activation: None,
        }
    }
}

impl fmt::Debug for ThreadRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadRecord")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("activation", &self.activation)
            .finish_non_exhaustive()
    }
}

/// The context that created every thread and regains control once none is ready.
/// Runs on the OS thread's own stack, so there's nothing to dispose.
#[derive(Debug)]
pub(super) struct DriverRecord {
    pub(super) state: State,
    pub(super) continuation: mem::MaybeUninit<Continuation>,
}

#[derive(Debug)]
struct Node {
    record: ThreadRecord,
    prev: RecordIndex,
    next: RecordIndex,
}

#[derive(Debug)]
pub(super) struct Registry {
    nodes: slab::Slab<Node>,
    head: Option<RecordIndex>,
    pub(super) driver: DriverRecord,
    next_id: u64,
}

impl Registry {
    pub(super) fn new() -> Self {
        Registry {
            nodes: slab::Slab::new(),
            head: None,
            driver: DriverRecord {
                state: State::Running,
                continuation: mem::MaybeUninit::uninit(),
            },
            next_id: 0,
        }
    }

    pub(super) fn allocate_id(&mut self) -> ThreadId {
        let id = ThreadId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Links a record in at the tail of the list, right before the head.
    pub(super) fn insert(&mut self, record: ThreadRecord) -> RecordIndex {
        let index = RecordIndex(self.nodes.vacant_key());
        let (prev, next) = match self.head {
            None => (index, index),
            Some(head) => (self.nodes[head.0].prev, head),
        };

        let key = self.nodes.insert(Node { record, prev, next });
        debug_assert_eq!(key, index.0);

        match self.head {
            None => self.head = Some(index),
            Some(head) => {
                self.nodes[prev.0].next = index;
                self.nodes[head.0].prev = index;
            }
        }

        index
    }

    /// Unlinks a record, relinking both of its neighbours.
    pub(super) fn remove(&mut self, index: RecordIndex) -> ThreadRecord {
        let node = self.nodes.remove(index.0);

        if node.next == index {
            self.head = None;
        } else {
            self.nodes[node.prev.0].next = node.next;
            self.nodes[node.next.0].prev = node.prev;

            if self.head == Some(index) {
                self.head = Some(node.next);
            }
        }

        node.record
    }

    /// Index of the live record with this id, if it still sits at [index].
    pub(super) fn resolve(&self, index: RecordIndex, id: ThreadId) -> Option<RecordIndex> {
        self.nodes
            .get(index.0)
            .filter(|node| node.record.id == id)
            .map(|_| index)
    }

    pub(super) fn get(&self, index: RecordIndex) -> &ThreadRecord {
        &self.nodes[index.0].record
    }

    pub(super) fn get_mut(&mut self, index: RecordIndex) -> &mut ThreadRecord {
        &mut self.nodes[index.0].record
    }

    pub(super) fn state(&self, slot: Slot) -> State {
        match slot {
            Slot::Driver => self.driver.state,
            Slot::Thread(index) => self.get(index).state,
        }
    }

    pub(super) fn set_state(&mut self, slot: Slot, state: State) {
        match slot {
            Slot::Driver => self.driver.state = state,
            Slot::Thread(index) => self.get_mut(index).state = state,
        }
    }

    #[cfg(test)]
    pub(super) fn head(&self) -> Option<RecordIndex> {
        self.head
    }

    pub(super) fn next_of(&self, index: RecordIndex) -> RecordIndex {
        self.nodes[index.0].next
    }

    pub(super) fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Records in list order, starting at the head.
    pub(super) fn iter(&self) -> impl Iterator<Item = (RecordIndex, &ThreadRecord)> + '_ {
        let mut cursor = self.head;
        (0..self.nodes.len()).map_while(move |_| {
            let index = cursor?;
            let node = &self.nodes[index.0];
            cursor = Some(node.next);
            Some((index, &node.record))
        })
    }

    /// Panics unless every `next`/`prev` pair are mutual inverses and the list reaches every record once.
    #[cfg(test)]
    pub(super) fn check_links(&self) {
        for (key, node) in &self.nodes {
            assert_eq!(self.nodes[node.next.0].prev, RecordIndex(key), "next.prev of {key}");
            assert_eq!(self.nodes[node.prev.0].next, RecordIndex(key), "prev.next of {key}");
        }

        let mut visited: Vec<usize> = self.iter().map(|(index, _)| index.0).collect();
        visited.sort_unstable();
        visited.dedup();
        assert_eq!(visited.len(), self.nodes.len(), "list doesn't reach every record");

        if let Some(head) = self.head {
            let last = self.iter().last().map(|(index, _)| index);
            assert_eq!(last, Some(self.nodes[head.0].prev), "list isn't circular");
        } else {
            assert!(self.nodes.is_empty());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(registry: &mut Registry) -> ThreadRecord {
        ThreadRecord::new(registry.allocate_id(), Box::new(|| {}))
    }

    fn ids(registry: &Registry) -> Vec<u64> {
        registry.iter().map(|(_, record)| record.id.get()).collect()
    }

    mod allocate_id {
        use super::*;

        #[test]
        fn increases_monotonically() {
            let mut registry = Registry::new();

            let ids: Vec<_> = (0..5).map(|_| registry.allocate_id().get()).collect();

            assert_eq!(ids, [0, 1, 2, 3, 4]);
        }
    }

    mod insert {
        use super::*;

        #[test]
        fn single_record_links_to_itself() {
            let mut registry = Registry::new();
            let record = record(&mut registry);

            let index = registry.insert(record);

            assert_eq!(registry.next_of(index), index);
            assert_eq!(registry.head(), Some(index));
            registry.check_links();
        }

        #[test]
        fn keeps_creation_order() {
            let mut registry = Registry::new();

            for _ in 0..4 {
                let record = record(&mut registry);
                registry.insert(record);
            }

            assert_eq!(ids(&registry), [0, 1, 2, 3]);
            registry.check_links();
        }

        #[test]
        fn starts_in_setup() {
            let mut registry = Registry::new();
            let record = record(&mut registry);

            let index = registry.insert(record);

            assert_eq!(registry.get(index).state, State::Setup);
        }
    }

    mod remove {
        use super::*;

        #[test]
        fn relinks_neighbours() {
            let mut registry = Registry::new();
            let indices: Vec<_> = (0..3)
                .map(|_| {
                    let record = record(&mut registry);
                    registry.insert(record)
                })
                .collect();

            let removed = registry.remove(indices[1]);

            assert_eq!(removed.id.get(), 1);
            assert_eq!(registry.next_of(indices[0]), indices[2]);
            assert_eq!(registry.next_of(indices[2]), indices[0]);
            assert_eq!(ids(&registry), [0, 2]);
            registry.check_links();
        }

        #[test]
        fn moves_head_forward() {
            let mut registry = Registry::new();
            let first = {
                let record = record(&mut registry);
                registry.insert(record)
            };
            let second = {
                let record = record(&mut registry);
                registry.insert(record)
            };

            registry.remove(first);

            assert_eq!(registry.head(), Some(second));
            registry.check_links();
        }

        #[test]
        fn last_record_empties_list() {
            let mut registry = Registry::new();
            let record = record(&mut registry);
            let index = registry.insert(record);

            registry.remove(index);

            assert!(registry.is_empty());
            assert_eq!(registry.head(), None);
            assert_eq!(registry.iter().count(), 0);
            registry.check_links();
        }

        #[test]
        fn any_order_keeps_integrity() {
            let mut registry = Registry::new();
            let indices: Vec<_> = (0..6)
                .map(|_| {
                    let record = record(&mut registry);
                    registry.insert(record)
                })
                .collect();

            for index in [indices[3], indices[0], indices[5], indices[1]] {
                registry.remove(index);
                registry.check_links();
            }

            assert_eq!(ids(&registry), [2, 4]);
        }
    }

    mod resolve {
        use super::*;

        #[test]
        fn finds_live_record() {
            let mut registry = Registry::new();
            let record = record(&mut registry);
            let id = record.id;
            let index = registry.insert(record);

            assert_eq!(registry.resolve(index, id), Some(index));
        }

        #[test]
        fn rejects_recycled_slot() {
            let mut registry = Registry::new();
            let stale = record(&mut registry);
            let stale_id = stale.id;
            let stale_index = registry.insert(stale);
            registry.remove(stale_index);

            let fresh = record(&mut registry);
            let fresh_index = registry.insert(fresh);

            assert_eq!(fresh_index, stale_index);
            assert_eq!(registry.resolve(stale_index, stale_id), None);
        }
    }

    #[test]
    fn driver_starts_running() {
        let registry = Registry::new();

        assert_eq!(registry.driver.state, State::Running);
    }
}
