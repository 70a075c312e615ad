//! Fixed capacities of the simulation, and the bounded list type used for per-speck
//! and per-bucket data. Buffers are sized once from these; requests past them are rejected.

pub const MAX_SPECKS: usize = 65_536;
pub const MAX_RIGID_BODIES: usize = 1_024;
/// Joint specks have one link per body they belong to, so this exceeds `MAX_SPECKS`.
pub const MAX_RIGID_BODY_LINKS: usize = MAX_SPECKS * 2;
pub const MAX_EXTERNAL_FORCES: usize = 16;
pub const MAX_STATIC_COLLIDERS: usize = 16;

/// Speck-speck contacts kept per speck each substep.
pub const MAX_CONTACTS_PER_SPECK: usize = 12;
/// A joint speck is shared by two bodies; allow a few for chains.
pub const MAX_BODIES_PER_SPECK: usize = 4;
/// The 3x3x3 block of cells around a speck.
pub const NEIGHBOR_CELLS: usize = 27;
/// Cells are one diameter wide, so a densely packed cell holds few specks.
pub const BUCKET_CAPACITY: usize = 16;

/// A fixed-size array plus a length. Keeps a flat, device-friendly layout while making
/// overflow an explicit, checked condition.
#[derive(Clone, Copy, Debug)]
pub struct BoundedList<T: Copy + Default, const N: usize> {
    items: [T; N],
    len: usize,
}

impl<T: Copy + Default, const N: usize> Default for BoundedList<T, N> {
    fn default() -> Self {
        Self {
            items: [T::default(); N],
            len: 0,
        }
    }
}

impl<T: Copy + Default, const N: usize> BoundedList<T, N> {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == N
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items[..self.len]
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.as_slice().iter()
    }

    /// Appends `item`, or hands it back if the list is full.
    pub fn try_push(&mut self, item: T) -> Result<(), T> {
        if self.len == N {
            return Err(item);
        }
        self.items[self.len] = item;
        self.len += 1;
        Ok(())
    }

    /// Appends `item`; when full, replaces the entry with the largest `key` if `item`'s key
    /// is smaller. Returns true if an entry (either `item` or an existing one) was dropped.
    pub fn push_keep_smallest<F>(&mut self, item: T, key: F) -> bool
    where
        F: Fn(&T) -> f32,
    {
        if self.try_push(item).is_ok() {
            return false;
        }

        let mut worst = 0;
        let mut worst_key = f32::MIN;
        for (i, existing) in self.as_slice().iter().enumerate() {
            let k = key(existing);
            if k > worst_key {
                worst_key = k;
                worst = i;
            }
        }

        if key(&item) < worst_key {
            self.items[worst] = item;
        }
        true
    }
}

impl<T: Copy + Default + PartialEq, const N: usize> BoundedList<T, N> {
    pub fn contains(&self, item: &T) -> bool {
        self.as_slice().contains(item)
    }
}
