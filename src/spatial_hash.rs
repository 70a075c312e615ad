//! Uniform-grid spatial hash, used as the broad phase. Cells are one speck diameter wide;
//! each cell hashes into one of a prime number of fixed-capacity buckets.

use std::sync::atomic::{AtomicU32, Ordering};

use lin_alg::f32::Vec3;

use crate::{
    capacity::{BoundedList, BUCKET_CAPACITY, NEIGHBOR_CELLS},
    util,
};

const HASH_PRIME_X: u32 = 73_856_093;
const HASH_PRIME_Y: u32 = 19_349_663;
const HASH_PRIME_Z: u32 = 83_492_791;

/// The bucket indices around one speck, with duplicates (hash collisions) removed.
pub type CollisionSpace = BoundedList<u32, NEIGHBOR_CELLS>;

/// The smallest prime strictly greater than `max_specks`, to reduce systematic collisions
/// from the cell hash. Falls back to `max_specks` itself if the table doesn't reach that far.
pub fn choose_bucket_count(primes: &[u32], max_specks: usize) -> usize {
    match util::first_prime_above(primes, max_specks) {
        Some(p) => p as usize,
        None => {
            eprintln!(
                "Warning: No prime above {max_specks} in the prime table; using it as the bucket \
                count. Expect more hash collisions."
            );
            max_specks.max(1)
        }
    }
}

/// Bucket table. Insertion is lock-free: each bucket has an atomic counter, and entries past
/// `BUCKET_CAPACITY` are dropped and counted.
pub struct SpatialHash {
    cell_size: f32,
    counts: Vec<AtomicU32>,
    /// `bucket_count × BUCKET_CAPACITY` speck indices.
    slots: Vec<AtomicU32>,
    overflow: AtomicU32,
}

impl SpatialHash {
    pub fn new(cell_size: f32) -> Self {
        Self {
            cell_size,
            counts: Vec::new(),
            slots: Vec::new(),
            overflow: AtomicU32::new(0),
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.counts.len()
    }

    /// Reallocates if the bucket count changed. Contents are invalid until rebuilt.
    pub fn resize(&mut self, bucket_count: usize) {
        if bucket_count == self.counts.len() {
            return;
        }
        self.counts = (0..bucket_count).map(|_| AtomicU32::new(0)).collect();
        self.slots = (0..bucket_count * BUCKET_CAPACITY)
            .map(|_| AtomicU32::new(0))
            .collect();
    }

    pub fn cell_of(&self, posit: Vec3) -> [i32; 3] {
        [
            (posit.x / self.cell_size).floor() as i32,
            (posit.y / self.cell_size).floor() as i32,
            (posit.z / self.cell_size).floor() as i32,
        ]
    }

    pub fn hash_cell(&self, cell: [i32; 3]) -> usize {
        let h = (cell[0] as u32).wrapping_mul(HASH_PRIME_X)
            ^ (cell[1] as u32).wrapping_mul(HASH_PRIME_Y)
            ^ (cell[2] as u32).wrapping_mul(HASH_PRIME_Z);
        h as usize % self.counts.len().max(1)
    }

    pub fn bucket_of(&self, posit: Vec3) -> usize {
        self.hash_cell(self.cell_of(posit))
    }

    /// Empties one bucket. Run over every bucket to rebuild.
    pub fn reset_bucket(&self, bucket: usize) {
        self.counts[bucket].store(0, Ordering::Relaxed);
        if bucket == 0 {
            self.overflow.store(0, Ordering::Relaxed);
        }
    }

    pub fn counts(&self) -> &[AtomicU32] {
        &self.counts
    }

    /// Returns false, and counts an overflow, if the bucket is full.
    pub fn insert(&self, bucket: usize, speck: u32) -> bool {
        let slot = self.counts[bucket].fetch_add(1, Ordering::Relaxed) as usize;
        if slot >= BUCKET_CAPACITY {
            self.overflow.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.slots[bucket * BUCKET_CAPACITY + slot].store(speck, Ordering::Relaxed);
        true
    }

    /// Speck indices in a bucket.
    pub fn bucket(&self, bucket: usize) -> impl Iterator<Item = u32> + '_ {
        let len = (self.counts[bucket].load(Ordering::Relaxed) as usize).min(BUCKET_CAPACITY);
        let start = bucket * BUCKET_CAPACITY;
        self.slots[start..start + len]
            .iter()
            .map(|s| s.load(Ordering::Relaxed))
    }

    /// The buckets of the 27 cells around `posit`.
    pub fn collision_space(&self, posit: Vec3) -> CollisionSpace {
        let center = self.cell_of(posit);
        let mut result = CollisionSpace::new();

        for dx in -1..=1 {
            for dy in -1..=1 {
                for dz in -1..=1 {
                    let cell = [
                        center[0].wrapping_add(dx),
                        center[1].wrapping_add(dy),
                        center[2].wrapping_add(dz),
                    ];
                    let bucket = self.hash_cell(cell) as u32;
                    if !result.contains(&bucket) {
                        // 27 cells fit by construction.
                        let _ = result.try_push(bucket);
                    }
                }
            }
        }
        result
    }

    /// Inserts that were dropped since the last rebuild.
    pub fn overflow(&self) -> u32 {
        self.overflow.load(Ordering::Relaxed)
    }
}
