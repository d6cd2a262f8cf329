/// One position of the active index sequence.
///
/// Replaces the reserved `n_sd` sentinel id of the reference design with a
/// tagged marker; the derived ordering sorts every `Removed` slot behind
/// every `Active` one, which is exactly what sort-based compaction needs.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Slot {
    Active(u32),
    Removed,
}

/// Ordered set of superdroplet ids defining iteration and pairing order.
///
/// While in use the active prefix is kept sorted by cell assignment
/// (non-decreasing); permutations issued by a pairer stay within cells and
/// preserve that invariant.
pub struct ActiveIndex {
    slots: Vec<Slot>,
    active: usize,
}

impl ActiveIndex {
    /// Identity order over all `n_sd` droplets.
    pub fn new(n_sd: usize) -> Self {
        assert!(n_sd <= u32::MAX as usize, "droplet count exceeds index range");
        ActiveIndex {
            slots: (0..n_sd).map(|i| Slot::Active(i as u32)).collect(),
            active: n_sd,
        }
    }

    /// Number of positions holding an active droplet id.
    pub fn len(&self) -> usize {
        self.active
    }

    pub fn is_empty(&self) -> bool {
        self.active == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Droplet id at position `pos` of the active prefix.
    pub fn droplet_at(&self, pos: usize) -> usize {
        match self.slots[pos] {
            Slot::Active(id) => id as usize,
            Slot::Removed => panic!("position {} holds a removed slot", pos),
        }
    }

    pub fn swap(&mut self, a: usize, b: usize) {
        self.slots.swap(a, b);
    }

    /// Stable sort of the active prefix by cell id; removed slots are
    /// untouched (they already live past the prefix).
    pub fn sort_active_by_cell(&mut self, cell_id: &[usize]) {
        let active = self.active;
        self.slots[..active].sort_by_key(|slot| match *slot {
            Slot::Active(id) => cell_id[id as usize],
            Slot::Removed => usize::MAX,
        });
    }

    /// Compaction: mark every position whose droplet has zero multiplicity
    /// (or is externally flagged) as removed, move removed slots behind the
    /// active ones, and record the surviving count.
    ///
    /// `length` is caller-supplied and may exceed the currently-valid prefix
    /// by one (a boundary contract inherited from the reference design). The
    /// over-read position then already holds `Removed` and is skipped; the
    /// caller must still keep `length <= capacity()`.
    pub fn remove_zero_or_flagged(&mut self, multiplicity: &[u64], flagged: Option<&[bool]>, length: usize) -> usize {
        assert!(length <= self.slots.len(), "compaction length exceeds index capacity");

        for pos in 0..length {
            if let Slot::Active(id) = self.slots[pos] {
                let id = id as usize;
                let dead = multiplicity[id] == 0 || flagged.map_or(false, |f| f[id]);
                if dead {
                    self.slots[pos] = Slot::Removed;
                }
            }
        }

        self.slots.sort_unstable();
        self.active = self.slots.iter().take_while(|slot| **slot != Slot::Removed).count();
        self.active
    }
}

#[test]
fn slot_ordering_puts_removed_last() {
    let mut slots = vec![Slot::Removed, Slot::Active(3), Slot::Removed, Slot::Active(1)];
    slots.sort_unstable();
    assert_eq!(
        slots,
        vec![Slot::Active(1), Slot::Active(3), Slot::Removed, Slot::Removed]
    );
}

#[test]
fn compaction_removes_zero_multiplicity() {
    // idx=[0,1,2,3], multiplicity=[0,5,0,3] -> 2 survivors, ids 1 and 3
    // ahead of every removed position
    let mut idx = ActiveIndex::new(4);
    let count = idx.remove_zero_or_flagged(&[0, 5, 0, 3], None, 4);

    assert_eq!(count, 2);
    assert_eq!(idx.len(), 2);
    assert_eq!(idx.droplet_at(0), 1);
    assert_eq!(idx.droplet_at(1), 3);
    assert_eq!(idx.slots()[2], Slot::Removed);
    assert_eq!(idx.slots()[3], Slot::Removed);
}

#[test]
fn compaction_honors_external_flags() {
    let mut idx = ActiveIndex::new(3);
    let count = idx.remove_zero_or_flagged(&[4, 4, 4], Some(&[false, true, false]), 3);

    assert_eq!(count, 2);
    assert_eq!(idx.droplet_at(0), 0);
    assert_eq!(idx.droplet_at(1), 2);
}

#[test]
fn compaction_skips_already_removed_tail_position() {
    let mut idx = ActiveIndex::new(4);
    idx.remove_zero_or_flagged(&[1, 0, 1, 1], None, 4);
    assert_eq!(idx.len(), 3);

    // caller passes a length one past the valid prefix; the extra position
    // holds a removed slot and is skipped
    let count = idx.remove_zero_or_flagged(&[1, 0, 0, 1], None, 4);
    assert_eq!(count, 2);
    assert_eq!(idx.droplet_at(0), 0);
    assert_eq!(idx.droplet_at(1), 3);
}
