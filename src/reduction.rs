//! Parallel tree reduction over contiguous blocks, eg summing per-link values into one
//! value per rigid body. Pass 0 loads one value per element; each later pass halves the number
//! of live partial sums in every block at once. After `pass_count(largest block)` passes, each
//! block's total is at its first element.

use std::ops::Add;

use rayon::prelude::*;

/// ⌈log₂ n⌉, for n ≥ 1.
fn ceil_log2(n: usize) -> usize {
    debug_assert!(n > 0);
    (usize::BITS - (n - 1).leading_zeros()) as usize
}

/// Passes needed, including the load, for blocks of up to `largest` elements.
pub fn pass_count(largest: usize) -> usize {
    if largest == 0 {
        0
    } else {
        ceil_log2(largest) + 1
    }
}

/// One combining pass, `pass` ≥ 1. Element `l` of its block adds the element `2^(pass-1)`
/// ahead of it if `l` is a multiple of `2^pass` and that element is in the block. Reads `src`
/// and writes `dst`, so no element is read while being written.
///
/// `block_of(i)` gives the (start, count) of the block element `i` is in.
pub fn reduction_pass<T, F>(pass: usize, src: &[T], dst: &mut [T], block_of: F)
where
    T: Clone + Send + Sync + Add<Output = T>,
    F: Fn(usize) -> (usize, usize) + Sync,
{
    debug_assert!(pass >= 1);
    let stride = 1 << (pass - 1);

    dst.par_iter_mut().enumerate().for_each(|(i, out)| {
        let (start, count) = block_of(i);
        let local = i - start;

        *out = if local % (2 * stride) == 0 && local + stride < count {
            src[i].clone() + src[i + stride].clone()
        } else {
            src[i].clone()
        };
    });
}

#[cfg(test)]
mod tests {
    use lin_alg::f32::Vec3;
    use rand::Rng;

    use super::*;
    use crate::rigid_body::center_of_mass;

    /// Runs every pass on already-loaded values. Returns the buffer holding the totals, at each
    /// block's start.
    fn reduce_blocks<T, F>(values: Vec<T>, largest: usize, block_of: F) -> Vec<T>
    where
        T: Clone + Send + Sync + Add<Output = T>,
        F: Fn(usize) -> (usize, usize) + Sync,
    {
        let mut src = values;
        let mut dst = src.clone();

        for pass in 1..pass_count(largest) {
            reduction_pass(pass, &src, &mut dst, &block_of);
            std::mem::swap(&mut src, &mut dst);
        }
        src
    }

    #[derive(Clone, Copy)]
    struct Weighted {
        posit: Vec3,
        mass: f32,
    }

    impl Add for Weighted {
        type Output = Self;

        fn add(self, rhs: Self) -> Self {
            Self {
                posit: self.posit + rhs.posit,
                mass: self.mass + rhs.mass,
            }
        }
    }

    #[test]
    fn pass_counts() {
        assert_eq!(pass_count(0), 0);
        assert_eq!(pass_count(1), 1);
        assert_eq!(pass_count(2), 2);
        assert_eq!(pass_count(3), 3);
        assert_eq!(pass_count(4), 3);
        assert_eq!(pass_count(5), 4);
        assert_eq!(pass_count(256), 9);
        assert_eq!(pass_count(257), 10);
    }

    #[test]
    fn sums_uneven_blocks() {
        let blocks = [(0, 1), (1, 5), (6, 3)];
        let values: Vec<u32> = (1..=9).collect();
        let block_of = |i: usize| *blocks.iter().find(|(s, c)| i >= *s && i < s + c).unwrap();

        let out = reduce_blocks(values, 5, block_of);
        assert_eq!(out[0], 1);
        assert_eq!(out[1], 2 + 3 + 4 + 5 + 6);
        assert_eq!(out[6], 7 + 8 + 9);
    }

    #[test]
    fn sums_matrices() {
        use lin_alg::f32::Mat3;

        use crate::math::{outer, zero};

        let vecs: Vec<Vec3> = (0..6).map(|i| Vec3::new(i as f32, 1., -(i as f32))).collect();
        let loaded: Vec<Mat3> = vecs.iter().map(|v| outer(*v, *v)).collect();
        let block_of = |i: usize| if i < 2 { (0, 2) } else { (2, 4) };

        let out = reduce_blocks(loaded, 4, block_of);
        for (start, count) in [(0, 2), (2, 4)] {
            let direct = vecs[start..start + count]
                .iter()
                .fold(zero(), |acc, v| acc + outer(*v, *v));
            for (a, b) in out[start].data.iter().zip(&direct.data) {
                assert!((a - b).abs() < 1e-4);
            }
        }
    }

    /// Center of mass from the reduction matches the direct weighted average, for every body
    /// size from 1 to 256.
    #[test]
    fn center_of_mass_matches_brute_force() {
        let mut rng = rand::rng();

        let mut blocks = Vec::new();
        let mut posits = Vec::new();
        let mut masses = Vec::new();
        for size in 1..=256 {
            blocks.push((posits.len(), size));
            for _ in 0..size {
                posits.push(Vec3::new(
                    rng.random_range(-10.0..10.0),
                    rng.random_range(-10.0..10.0),
                    rng.random_range(-10.0..10.0),
                ));
                masses.push(rng.random_range(0.1..5.0));
            }
        }

        let mut block_ids = Vec::with_capacity(posits.len());
        for (b, (_, size)) in blocks.iter().enumerate() {
            block_ids.extend(std::iter::repeat(b).take(*size));
        }
        let block_of = |i: usize| blocks[block_ids[i]];

        let loaded: Vec<Weighted> = posits
            .iter()
            .zip(&masses)
            .map(|(p, m)| Weighted {
                posit: *p * *m,
                mass: *m,
            })
            .collect();
        let out = reduce_blocks(loaded, 256, block_of);

        for (start, size) in &blocks {
            let total = out[*start];
            let reduced = total.posit / total.mass;
            let direct = center_of_mass(&posits[*start..start + size], &masses[*start..start + size]);
            assert!(
                (reduced - direct).magnitude() < 1e-3,
                "Size {size}: {reduced:?} vs {direct:?}"
            );
        }
    }
}
