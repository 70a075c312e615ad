#![allow(non_snake_case)]

//! Small linear algebra used by shape matching: rigid transforms, and symmetric
//! eigendecomposition via repeated Householder QR, over `lin_alg`'s `Mat3`.
//!
//! `Mat3` stores columns; `to_arr` and `from_arr` convert to and from rows. We use `f32`
//! throughout, to match the precision of the per-speck buffers.

use std::f32::consts::TAU;

use lin_alg::f32::{Mat3, Quaternion, Vec3};

/// Below this, a Householder vector is treated as zero and the reflection skipped.
const HOUSEHOLDER_EPS: f32 = 1e-20;
/// Relative: eigenvalues of AᵀA below `max * RANK_EPS` are treated as zero in rotation extraction.
const RANK_EPS: f32 = 1e-6;
/// Relative off-diagonal magnitude at which QR iteration stops.
const CONVERGED_EPS: f32 = 1e-7;

fn comp(v: Vec3, i: usize) -> f32 {
    match i {
        0 => v.x,
        1 => v.y,
        _ => v.z,
    }
}

pub fn zero() -> Mat3 {
    Mat3::new([0.; 9])
}

fn diagonal(m: &Mat3) -> Vec3 {
    Vec3::new(m.data[0], m.data[4], m.data[8])
}

fn trace(m: &Mat3) -> f32 {
    m.data[0] + m.data[4] + m.data[8]
}

/// a bᵀ
pub fn outer(a: Vec3, b: Vec3) -> Mat3 {
    Mat3::from_cols(a * b.x, a * b.y, a * b.z)
}

/// a - b
pub fn sub(a: &Mat3, b: &Mat3) -> Mat3 {
    Mat3::new(std::array::from_fn(|i| a.data[i] - b.data[i]))
}

fn frobenius_norm(m: &Mat3) -> f32 {
    m.data.iter().map(|v| v * v).sum::<f32>().sqrt()
}

fn off_diagonal_norm(m: &Mat3) -> f32 {
    m.data
        .iter()
        .enumerate()
        .filter(|(i, _)| i % 4 != 0)
        .map(|(_, v)| v * v)
        .sum::<f32>()
        .sqrt()
}

fn is_diagonal(m: &Mat3) -> bool {
    off_diagonal_norm(m) <= f32::EPSILON * frobenius_norm(m).max(1.)
}

/// Converts a proper rotation matrix to a unit quaternion. (Shepperd's method)
pub fn to_quaternion(rot: &Mat3) -> Quaternion {
    let m = rot.to_arr();
    let trace = trace(rot);

    let (w, x, y, z) = if trace > 0. {
        let s = (trace + 1.).sqrt() * 2.;
        (
            0.25 * s,
            (m[2][1] - m[1][2]) / s,
            (m[0][2] - m[2][0]) / s,
            (m[1][0] - m[0][1]) / s,
        )
    } else if m[0][0] > m[1][1] && m[0][0] > m[2][2] {
        let s = (1. + m[0][0] - m[1][1] - m[2][2]).sqrt() * 2.;
        (
            (m[2][1] - m[1][2]) / s,
            0.25 * s,
            (m[0][1] + m[1][0]) / s,
            (m[0][2] + m[2][0]) / s,
        )
    } else if m[1][1] > m[2][2] {
        let s = (1. + m[1][1] - m[0][0] - m[2][2]).sqrt() * 2.;
        (
            (m[0][2] - m[2][0]) / s,
            (m[0][1] + m[1][0]) / s,
            0.25 * s,
            (m[1][2] + m[2][1]) / s,
        )
    } else {
        let s = (1. + m[2][2] - m[0][0] - m[1][1]).sqrt() * 2.;
        (
            (m[1][0] - m[0][1]) / s,
            (m[0][2] + m[2][0]) / s,
            (m[1][2] + m[2][1]) / s,
            0.25 * s,
        )
    };

    let mag = (w * w + x * x + y * y + z * z).sqrt();
    if !mag.is_finite() || mag <= 0. {
        return Quaternion::new_identity();
    }
    Quaternion::new(w / mag, x / mag, y / mag, z / mag)
}

/// Rotation, then translation. No scale.
#[derive(Clone, Copy, Debug)]
pub struct Transform {
    pub rotation: Quaternion,
    pub translation: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self::new_identity()
    }
}

impl Transform {
    pub fn new(rotation: Quaternion, translation: Vec3) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    pub fn new_identity() -> Self {
        Self {
            rotation: Quaternion::new_identity(),
            translation: Vec3::new_zero(),
        }
    }

    pub fn from_translation(translation: Vec3) -> Self {
        Self {
            rotation: Quaternion::new_identity(),
            translation,
        }
    }

    /// Local to world.
    pub fn apply(&self, local: Vec3) -> Vec3 {
        self.rotation.rotate_vec(local) + self.translation
    }

    /// World to local.
    pub fn apply_inverse(&self, world: Vec3) -> Vec3 {
        self.rotation.inverse().rotate_vec(world - self.translation)
    }

    pub fn rotate(&self, v: Vec3) -> Vec3 {
        self.rotation.rotate_vec(v)
    }
}

/// 3x3 QR decomposition using two Householder reflections. Returns (Q, R), with A = QR.
/// A reflection whose Householder vector is zero (the column is already reduced, or is all
/// zeros) is replaced with the identity.
pub fn qr_householder(a: &Mat3) -> (Mat3, Mat3) {
    let mut q = Mat3::new_identity();
    let mut r = a.clone();

    for k in 0..2 {
        let rows = r.to_arr();
        let norm = (k..3).map(|i| rows[i][k].powi(2)).sum::<f32>().sqrt();
        let alpha = if rows[k][k] > 0. { -norm } else { norm };

        let mut parts = [0.; 3];
        for i in k..3 {
            parts[i] = rows[i][k];
        }
        parts[k] -= alpha;
        let v = Vec3::new(parts[0], parts[1], parts[2]);

        let v_sq = v.dot(v);
        if v_sq < HOUSEHOLDER_EPS || !v_sq.is_finite() {
            continue;
        }

        let h = sub(&Mat3::new_identity(), &(outer(v, v) * (2. / v_sq)));
        r = h.clone() * r;
        q = q * h;
    }

    (q, r)
}

/// Eigendecomposition of a symmetric matrix, via QR iteration: A ← RQ, V ← VQ.
/// Returns (eigenvalues, eigenvectors as columns), in the order they converge on the diagonal;
/// they aren't sorted. A diagonal input is returned as-is without iterating.
///
/// Unshifted QR stalls on eigenvalues of equal magnitude and opposite sign, so an indefinite
/// input is first shifted by its smallest eigenvalue, and the shift removed from the result.
/// Positive semi-definite input (eg AᵀA) is iterated as-is.
pub fn eigen_symmetric(a: &Mat3, iterations: usize) -> (Vec3, Mat3) {
    if is_diagonal(a) {
        return (diagonal(a), Mat3::new_identity());
    }

    let λ_min = eigenvalues_symmetric(a).z;
    let shift = if λ_min < 0. { -λ_min } else { 0. };

    let mut a_k = a.clone() + Mat3::new_identity() * shift;
    let scale = frobenius_norm(&a_k);
    let mut vecs = Mat3::new_identity();

    for _ in 0..iterations {
        let (q, r) = qr_householder(&a_k);
        a_k = r * q.clone();
        vecs = vecs * q;

        if off_diagonal_norm(&a_k) <= CONVERGED_EPS * scale {
            break;
        }
    }

    (diagonal(&a_k) - Vec3::new(shift, shift, shift), vecs)
}

/// Closed-form (trigonometric) eigenvalues of a symmetric matrix, in descending order.
pub fn eigenvalues_symmetric(a: &Mat3) -> Vec3 {
    let m = a.to_arr();
    let p1 = m[0][1].powi(2) + m[0][2].powi(2) + m[1][2].powi(2);

    if p1 == 0. {
        let mut d = [m[0][0], m[1][1], m[2][2]];
        d.sort_by(|x, y| y.total_cmp(x));
        return Vec3::new(d[0], d[1], d[2]);
    }

    let q = trace(a) / 3.;
    let p2 = (m[0][0] - q).powi(2) + (m[1][1] - q).powi(2) + (m[2][2] - q).powi(2) + 2. * p1;
    let p = (p2 / 6.).sqrt();

    let b = sub(a, &(Mat3::new_identity() * q)) * (1. / p);
    let r = (b.determinant() / 2.).clamp(-1., 1.);
    let φ = r.acos() / 3.;

    let e1 = q + 2. * p * φ.cos();
    let e3 = q + 2. * p * (φ + TAU / 3.).cos();
    let e2 = 3. * q - e1 - e3;

    Vec3::new(e1, e2, e3)
}

/// Any unit vector perpendicular to `v`.
fn any_perpendicular(v: Vec3) -> Vec3 {
    let other = if v.x.abs() < 0.9 {
        Vec3::new(1., 0., 0.)
    } else {
        Vec3::new(0., 1., 0.)
    };
    v.cross(other).to_normalized()
}

/// Extracts the rotational part R of the shape-matching matrix A = Σ m (p - c) qᵀ, ie the
/// rotation of the polar decomposition A = RS. S² = AᵀA is eigendecomposed; R's columns
/// are built by Gram-Schmidt so the result is always a proper rotation, including for
/// planar, linear, point-like, and inverted particle clouds. A zero matrix gives identity.
pub fn extract_rotation(A: &Mat3, iterations: usize) -> Mat3 {
    let ata = A.transpose() * A.clone();
    let (vals, vecs) = eigen_symmetric(&ata, iterations);
    let (c0, c1, c2) = vecs.to_cols();
    let cols = [c0, c1, c2];

    let mut order = [0, 1, 2];
    order.sort_by(|&i, &j| comp(vals, j).total_cmp(&comp(vals, i)));

    let λ_max = comp(vals, order[0]);
    if !λ_max.is_finite() || λ_max <= 0. {
        return Mat3::new_identity();
    }
    let rank_thresh = λ_max * RANK_EPS;

    let v1 = cols[order[0]].to_normalized();
    let mut v2 = cols[order[1]];
    v2 = (v2 - v1 * v1.dot(v2)).to_normalized();
    if !v2.x.is_finite() {
        v2 = any_perpendicular(v1);
    }
    let v3 = v1.cross(v2);

    let u1 = (A.clone() * v1).to_normalized();
    if !u1.x.is_finite() {
        return Mat3::new_identity();
    }

    let λ_2 = comp(vals, order[1]);
    let mut u2 = if λ_2 > rank_thresh {
        A.clone() * v2
    } else {
        // Linear cloud: the roll about its axis is undetermined. Keep v2's orientation as
        // closely as possible.
        v2
    };
    u2 = u2 - u1 * u1.dot(u2);
    let u2_mag = u2.magnitude();
    u2 = if u2_mag > 1e-12 {
        u2 / u2_mag
    } else {
        any_perpendicular(u1)
    };
    let u3 = u1.cross(u2);

    outer(u1, v1) + outer(u2, v2) + outer(u3, v3)
}
