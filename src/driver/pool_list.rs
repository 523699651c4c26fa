//! Pool membership lists.
//!
//! Every socket lives in exactly one of six lists. Each list is a doubly
//! linked list threaded through a shared slot arena, so relinking, oldest,
//! newest and length are all O(1). New members go to the tail; the head is
//! the oldest.

use serde::Serialize;

/// Pools a socket moves through during its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Pool {
    /// Dialing or running the startup exchange.
    Created,
    /// Connected and free.
    Idle,
    ReservedPermanent,
    ReservedEphemeral,
    Visiting,
    /// Ended or closed, waiting for removal.
    Terminal,
}

impl Pool {
    pub const ALL: [Pool; 6] = [
        Pool::Created,
        Pool::Idle,
        Pool::ReservedPermanent,
        Pool::ReservedEphemeral,
        Pool::Visiting,
        Pool::Terminal,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Pool::Created => "created",
            Pool::Idle => "idle",
            Pool::ReservedPermanent => "reserved_permanent",
            Pool::ReservedEphemeral => "reserved_ephemeral",
            Pool::Visiting => "visiting",
            Pool::Terminal => "terminal",
        }
    }
}

impl std::fmt::Display for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to an arena slot. Only valid while the value is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(usize);

#[derive(Debug)]
struct Node<T> {
    value: T,
    pool: Pool,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Ends {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

#[derive(Debug)]
pub struct PoolLists<T> {
    slots: Vec<Option<Node<T>>>,
    free: Vec<usize>,
    ends: [Ends; 6],
}

impl<T> Default for PoolLists<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PoolLists<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            ends: [Ends::default(); 6],
        }
    }

    /// Append `value` as the newest member of `pool`.
    pub fn insert(&mut self, pool: Pool, value: T) -> SlotId {
        let node = Node {
            value,
            pool,
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.link_tail(idx, pool);
        SlotId(idx)
    }

    pub fn remove(&mut self, slot: SlotId) -> Option<T> {
        self.node(slot.0)?;
        self.unlink(slot.0);
        let node = self.slots[slot.0].take()?;
        self.free.push(slot.0);
        Some(node.value)
    }

    /// Move to the tail of `to`. Returns the pool it left. A node already in
    /// `to` keeps its place.
    pub fn migrate(&mut self, slot: SlotId, to: Pool) -> Option<Pool> {
        let from = self.node(slot.0)?.pool;
        if from == to {
            return Some(from);
        }
        self.unlink(slot.0);
        self.link_tail(slot.0, to);
        Some(from)
    }

    pub fn pool_of(&self, slot: SlotId) -> Option<Pool> {
        self.node(slot.0).map(|n| n.pool)
    }

    pub fn get(&self, slot: SlotId) -> Option<&T> {
        self.node(slot.0).map(|n| &n.value)
    }

    pub fn get_mut(&mut self, slot: SlotId) -> Option<&mut T> {
        self.slots
            .get_mut(slot.0)
            .and_then(Option::as_mut)
            .map(|n| &mut n.value)
    }

    pub fn oldest(&self, pool: Pool) -> Option<SlotId> {
        self.ends[pool.index()].head.map(SlotId)
    }

    pub fn newest(&self, pool: Pool) -> Option<SlotId> {
        self.ends[pool.index()].tail.map(SlotId)
    }

    pub fn len(&self, pool: Pool) -> usize {
        self.ends[pool.index()].len
    }

    pub fn total_len(&self) -> usize {
        self.ends.iter().map(|e| e.len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    /// Members of `pool`, oldest first.
    pub fn iter(&self, pool: Pool) -> impl Iterator<Item = (SlotId, &T)> + '_ {
        let mut cursor = self.ends[pool.index()].head;
        std::iter::from_fn(move || {
            let idx = cursor?;
            let node = self.node(idx)?;
            cursor = node.next;
            Some((SlotId(idx), &node.value))
        })
    }

    /// Exhaustive structural check: every live node sits in exactly one
    /// list, its tag matches that list, links are symmetric and the stored
    /// lengths are right.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut seen = vec![false; self.slots.len()];

        for pool in Pool::ALL {
            let ends = self.ends[pool.index()];
            let mut prev: Option<usize> = None;
            let mut cursor = ends.head;
            let mut count = 0;

            while let Some(idx) = cursor {
                let node = self
                    .node(idx)
                    .ok_or_else(|| format!("{pool}: link to vacant slot {idx}"))?;
                if seen[idx] {
                    return Err(format!("{pool}: slot {idx} reachable twice"));
                }
                seen[idx] = true;
                if node.pool != pool {
                    return Err(format!("{pool}: slot {idx} tagged {}", node.pool));
                }
                if node.prev != prev {
                    return Err(format!(
                        "{pool}: slot {idx} prev is {:?}, expected {:?}",
                        node.prev, prev
                    ));
                }
                count += 1;
                prev = Some(idx);
                cursor = node.next;
            }

            if ends.tail != prev {
                return Err(format!("{pool}: tail {:?} but walk ended at {:?}", ends.tail, prev));
            }
            if ends.len != count {
                return Err(format!("{pool}: stored length {} but walked {}", ends.len, count));
            }
        }

        for (idx, slot) in self.slots.iter().enumerate() {
            match (slot.is_some(), seen[idx], self.free.contains(&idx)) {
                (true, true, false) | (false, false, true) => {}
                (true, false, _) => return Err(format!("slot {idx} is live but in no list")),
                (true, true, true) => return Err(format!("slot {idx} is live and free")),
                (false, _, false) => return Err(format!("slot {idx} is vacant but not free")),
                (false, true, true) => return Err(format!("slot {idx} is vacant but linked")),
            }
        }
        Ok(())
    }

    fn node(&self, idx: usize) -> Option<&Node<T>> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, idx: usize) -> Option<&mut Node<T>> {
        self.slots.get_mut(idx).and_then(Option::as_mut)
    }

    fn link_tail(&mut self, idx: usize, pool: Pool) {
        let old_tail = self.ends[pool.index()].tail;
        if let Some(node) = self.node_mut(idx) {
            node.pool = pool;
            node.prev = old_tail;
            node.next = None;
        }
        match old_tail {
            Some(t) => {
                if let Some(tail) = self.node_mut(t) {
                    tail.next = Some(idx);
                }
            }
            None => self.ends[pool.index()].head = Some(idx),
        }
        let ends = &mut self.ends[pool.index()];
        ends.tail = Some(idx);
        ends.len += 1;
    }

    fn unlink(&mut self, idx: usize) {
        let Some(node) = self.node(idx) else {
            return;
        };
        let (pool, prev, next) = (node.pool, node.prev, node.next);

        match prev {
            Some(p) => {
                if let Some(n) = self.node_mut(p) {
                    n.next = next;
                }
            }
            None => self.ends[pool.index()].head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.node_mut(n) {
                    node.prev = prev;
                }
            }
            None => self.ends[pool.index()].tail = prev,
        }
        self.ends[pool.index()].len -= 1;

        if let Some(node) = self.node_mut(idx) {
            node.prev = None;
            node.next = None;
        }
    }
}
