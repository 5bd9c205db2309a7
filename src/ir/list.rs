//! Instruction list: a doubly linked list stored in an arena.
//!
//! Nodes are addressed by [`InstId`], a stable index into the arena. Appends
//! go to the tail; deletion unlinks a node in O(1) and leaves a tombstone, so
//! ids held by a pass stay valid (and detectably dead) for the rest of the
//! pass. Slots are never reused.

use super::inst::Instruction;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstId(u32);

impl InstId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Debug)]
struct Node {
    inst: Instruction,
    prev: Option<InstId>,
    next: Option<InstId>,
    linked: bool,
}

#[derive(Clone, Debug, Default)]
pub struct InstList {
    nodes: Vec<Node>,
    head: Option<InstId>,
    tail: Option<InstId>,
    count: usize,
}

impl InstList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of linked instructions.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn head(&self) -> Option<InstId> {
        self.head
    }

    pub fn append(&mut self, inst: Instruction) -> InstId {
        let id = InstId(self.nodes.len() as u32);
        self.nodes.push(Node {
            inst,
            prev: self.tail,
            next: None,
            linked: true,
        });
        match self.tail {
            Some(tail) => self.nodes[tail.index()].next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.count += 1;
        id
    }

    /// Unlink `id` and return its instruction. Deleting an already deleted
    /// node is a defect.
    pub fn delete(&mut self, id: InstId) -> Instruction {
        let (prev, next) = {
            let node = &mut self.nodes[id.index()];
            assert!(node.linked, "instruction {} deleted twice", id.0);
            node.linked = false;
            (node.prev.take(), node.next.take())
        };
        match prev {
            Some(p) => self.nodes[p.index()].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n.index()].prev = prev,
            None => self.tail = prev,
        }
        self.count -= 1;
        self.nodes[id.index()].inst
    }

    pub fn contains(&self, id: InstId) -> bool {
        self.nodes.get(id.index()).is_some_and(|n| n.linked)
    }

    pub fn get(&self, id: InstId) -> &Instruction {
        &self.nodes[id.index()].inst
    }

    pub fn get_mut(&mut self, id: InstId) -> &mut Instruction {
        &mut self.nodes[id.index()].inst
    }

    pub fn next(&self, id: InstId) -> Option<InstId> {
        self.nodes[id.index()].next
    }

    /// Upper bound (exclusive) on every id handed out so far.
    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    /// Forward traversal, head to tail.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }

    /// Ids in list order. Collected up front so the caller may delete while
    /// walking.
    pub fn ids(&self) -> Vec<InstId> {
        self.iter().map(|(id, _)| id).collect()
    }
}

pub struct Iter<'a> {
    list: &'a InstList,
    cursor: Option<InstId>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (InstId, &'a Instruction);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cursor?;
        let node = &self.list.nodes[id.index()];
        self.cursor = node.next;
        Some((id, &node.inst))
    }
}

impl FromIterator<Instruction> for InstList {
    fn from_iter<I: IntoIterator<Item = Instruction>>(iter: I) -> Self {
        let mut list = InstList::new();
        for inst in iter {
            list.append(inst);
        }
        list
    }
}
