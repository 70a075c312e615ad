//! The bodies of the solver phases. Each function is one data-parallel dispatch: it runs over
//! every speck, link, bucket or (speck, collider) pair independently, writing only to its own
//! element of its output buffer.
//!
//! Constraint projection is position-based: contacts are distance constraints
//! `|xᵢ - xⱼ| ≥ 2r` split by inverse mass, static contacts are half-spaces, and corrections
//! from all of a speck's constraints are averaged (Jacobi), then scaled by the SOR factor ω.
//! Friction removes tangential displacement, up to μ times the penetration depth.

use std::{
    ops::Add,
    sync::atomic::{AtomicU32, Ordering},
};

use lin_alg::f32::{Mat3, Vec3};
use rayon::prelude::*;

use crate::{
    capacity::{BoundedList, MAX_CONTACTS_PER_SPECK},
    forces::{ExternalForce, HalfSpace, StaticCollider},
    math::{self, extract_rotation, outer, to_quaternion, Transform},
    rigid_body::{Membership, MovementMode, RigidBody, RigidBodyLink},
    spatial_hash::{CollisionSpace, SpatialHash},
    speck::Speck,
};

/// Below this distance, two specks have no usable contact direction.
const MIN_CONTACT_DIST: f32 = 1e-9;

pub type Contacts = BoundedList<u32, MAX_CONTACTS_PER_SPECK>;

/// Per-substep values the phases need.
#[derive(Clone, Copy, Debug)]
pub struct StepParams {
    pub dt: f32,
    pub radius: f32,
    pub omega: f32,
    pub contact_margin: f32,
    /// In diameters.
    pub cohesion_range: f32,
    pub shape_matching_iterations: usize,
}

/// Per-speck output for the renderer.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SpeckInstance {
    pub posit: [f32; 3],
    pub material: u32,
}

/// Partial sum for the center of mass reduction.
#[derive(Clone, Copy, Debug)]
pub struct CenterAccum {
    pub weighted_posit: Vec3,
    pub mass: f32,
}

impl CenterAccum {
    pub fn new_zero() -> Self {
        Self {
            weighted_posit: Vec3::new_zero(),
            mass: 0.,
        }
    }
}

impl Add for CenterAccum {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            weighted_posit: self.weighted_posit + rhs.weighted_posit,
            mass: self.mass + rhs.mass,
        }
    }
}

/// Buffers the phases write, other than specks and bodies. Sized by `resize`, on the host,
/// between substeps.
pub struct SolverBuffers {
    pub hash: SpatialHash,
    pub collision_spaces: Vec<CollisionSpace>,
    pub contacts: Vec<Contacts>,
    /// `speck × collider`, flattened.
    pub collider_contacts: Vec<Option<HalfSpace>>,
    pub deltas: Vec<Vec3>,
    // Reduction ping-pong buffers, one element per link.
    pub com_src: Vec<CenterAccum>,
    pub com_dst: Vec<CenterAccum>,
    pub cov_src: Vec<Mat3>,
    pub cov_dst: Vec<Mat3>,
    pub instances: Vec<SpeckInstance>,
    /// Contacts dropped because a speck's list was full, this tick.
    pub contact_overflow: AtomicU32,
}

impl SolverBuffers {
    pub fn new(cell_size: f32) -> Self {
        Self {
            hash: SpatialHash::new(cell_size),
            collision_spaces: Vec::new(),
            contacts: Vec::new(),
            collider_contacts: Vec::new(),
            deltas: Vec::new(),
            com_src: Vec::new(),
            com_dst: Vec::new(),
            cov_src: Vec::new(),
            cov_dst: Vec::new(),
            instances: Vec::new(),
            contact_overflow: AtomicU32::new(0),
        }
    }

    pub fn resize(&mut self, specks: usize, buckets: usize, colliders: usize, links: usize) {
        self.hash.resize(buckets);
        self.collision_spaces.resize(specks, CollisionSpace::new());
        self.contacts.resize(specks, Contacts::new());
        self.collider_contacts.resize(specks * colliders, None);
        self.deltas.resize(specks, Vec3::new_zero());
        self.com_src.resize(links, CenterAccum::new_zero());
        self.com_dst.resize(links, CenterAccum::new_zero());
        self.cov_src.resize(links, math::zero());
        self.cov_dst.resize(links, math::zero());
        self.instances.resize(specks, SpeckInstance::default());
    }
}

/// Phase 1, per bucket.
pub fn rebuild_hash(hash: &SpatialHash) {
    hash.counts()
        .par_iter()
        .enumerate()
        .for_each(|(bucket, _)| hash.reset_bucket(bucket));
}

/// Phase 2, per speck: bucket insertion, and caching the buckets around it.
pub fn insert_specks(specks: &[Speck], hash: &SpatialHash, spaces: &mut [CollisionSpace]) {
    spaces
        .par_iter_mut()
        .zip(specks.par_iter())
        .enumerate()
        .for_each(|(i, (space, speck))| {
            hash.insert(hash.bucket_of(speck.posit), i as u32);
            *space = hash.collision_space(speck.posit);
        });
}

/// Phase 3, per speck.
pub fn integrate(specks: &mut [Speck], forces: &[ExternalForce], dt: f32) {
    specks.par_iter_mut().for_each(|speck| {
        if speck.mass_inv > 0. {
            let mut accel = Vec3::new_zero();
            for force in forces {
                accel += force.accel(speck.mass_inv);
            }
            speck.vel += accel * dt;
        }
        speck.posit_pred = speck.posit + speck.vel * dt;
    });
}

/// If specks `a` and `b` are members of a common rigid body. Those don't collide.
fn share_body(a: usize, b: usize, memberships: &[Membership], links: &[RigidBodyLink]) -> bool {
    let (Some(ma), Some(mb)) = (memberships.get(a), memberships.get(b)) else {
        return false;
    };
    ma.iter().any(|la| {
        mb.iter()
            .any(|lb| links[*la as usize].body == links[*lb as usize].body)
    })
}

/// Phase 4, per speck: neighbours in range, from the cached collision space. Keeps the closest
/// if there are more than fit.
#[allow(clippy::too_many_arguments)]
pub fn speck_contacts(
    specks: &[Speck],
    hash: &SpatialHash,
    spaces: &[CollisionSpace],
    memberships: &[Membership],
    links: &[RigidBodyLink],
    params: &StepParams,
    contacts: &mut [Contacts],
    overflow: &AtomicU32,
) {
    let diameter = params.radius * 2.;
    let contact_range = diameter * (1. + params.contact_margin);
    let cohesion_range = diameter * params.cohesion_range.max(1. + params.contact_margin);

    contacts.par_iter_mut().enumerate().for_each(|(i, list)| {
        list.clear();
        let speck = &specks[i];

        for bucket in spaces[i].iter() {
            for j in hash.bucket(*bucket as usize) {
                let j_ = j as usize;
                if j_ == i || j_ >= specks.len() {
                    continue;
                }
                let other = &specks[j_];

                let range = if speck.is_fluid() && other.is_fluid() {
                    cohesion_range
                } else {
                    contact_range
                };
                let dist = (speck.posit_pred - other.posit_pred).magnitude();
                if dist >= range || share_body(i, j_, memberships, links) {
                    continue;
                }

                let dist_to = |k: &u32| (speck.posit_pred - specks[*k as usize].posit_pred).magnitude();
                if list.push_keep_smallest(j, dist_to) {
                    overflow.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    });
}

/// Phase 5, per (speck, collider).
pub fn collider_contacts(
    specks: &[Speck],
    colliders: &[StaticCollider],
    params: &StepParams,
    out: &mut [Option<HalfSpace>],
) {
    let n_colliders = colliders.len();
    if n_colliders == 0 {
        return;
    }

    out.par_iter_mut().enumerate().for_each(|(k, contact)| {
        let speck = &specks[k / n_colliders];
        let collider = &colliders[k % n_colliders];
        *contact = collider.contact(speck.posit_pred, params.radius, params.contact_margin);
    });
}

/// Phase 6, per speck: pushes committed positions out of static geometry, moving the prediction
/// by the same amount so the correction doesn't turn into velocity.
pub fn stabilize(specks: &mut [Speck], contacts: &[Option<HalfSpace>], n_colliders: usize) {
    if n_colliders == 0 {
        return;
    }

    specks.par_iter_mut().enumerate().for_each(|(i, speck)| {
        if speck.mass_inv == 0. {
            return;
        }
        for contact in contacts[i * n_colliders..(i + 1) * n_colliders].iter().flatten() {
            let c = contact.eval(speck.posit);
            if c < 0. {
                let correction = contact.normal * -c;
                speck.posit += correction;
                speck.posit_pred += correction;
            }
        }
    });
}

/// The outward surface normal of the rigid body speck `j` belongs to, in world space, from its
/// boundary gradient.
fn surface_normal(
    j: usize,
    speck: &Speck,
    memberships: &[Membership],
    links: &[RigidBodyLink],
    bodies: &[RigidBody],
) -> Option<Vec3> {
    let grad = speck.boundary_gradient();
    let mag = grad.magnitude();
    if mag < MIN_CONTACT_DIST {
        return None;
    }

    let link = memberships.get(j)?.iter().next()?;
    let body = &bodies[links[*link as usize].body as usize];
    Some(body.goal_transform().rotate(grad / mag) * -1.)
}

/// Friction: removes relative tangential displacement `rel`, up to μ × depth.
fn friction_correction(rel: Vec3, normal: Vec3, μ: f32, depth: f32) -> Vec3 {
    let tangential = rel - normal * rel.dot(normal);
    let len = tangential.magnitude();
    if len < MIN_CONTACT_DIST {
        return Vec3::new_zero();
    }
    tangential * -(μ * depth / len).min(1.)
}

/// Phase 7, even passes, per speck: the averaged correction from every contact, into `deltas`.
#[allow(clippy::too_many_arguments)]
pub fn solve_calculate(
    specks: &[Speck],
    contacts: &[Contacts],
    collider_contacts: &[Option<HalfSpace>],
    n_colliders: usize,
    memberships: &[Membership],
    links: &[RigidBodyLink],
    bodies: &[RigidBody],
    params: &StepParams,
    deltas: &mut [Vec3],
) {
    let diameter = params.radius * 2.;
    let cohesion_range = diameter * params.cohesion_range;

    deltas.par_iter_mut().enumerate().for_each(|(i, delta)| {
        let speck = &specks[i];
        *delta = Vec3::new_zero();
        if speck.mass_inv == 0. {
            return;
        }

        let disp = speck.posit_pred - speck.posit;
        let mut sum = Vec3::new_zero();
        let mut n = 0;

        for j in contacts[i].iter() {
            let j = *j as usize;
            let other = &specks[j];
            let w_sum = speck.mass_inv + other.mass_inv;

            let diff = speck.posit_pred - other.posit_pred;
            let dist = diff.magnitude();
            if dist < MIN_CONTACT_DIST {
                continue;
            }
            let w = speck.mass_inv / w_sum;
            let disp_other = other.posit_pred - other.posit;
            let mut normal = diff / dist;

            // Deeply inside another body: the pairwise direction is unreliable; use that body's
            // surface normal.
            if dist < params.radius {
                if let Some(n) = surface_normal(j, other, memberships, links, bodies) {
                    normal = n;
                }
            }

            let c = dist - diameter;
            if c < 0. {
                sum += normal * (-c * w);
                let μ = 0.5 * (speck.friction + other.friction);
                sum += friction_correction(disp - disp_other, normal, μ, -c) * w;
                n += 1;
            } else if speck.is_fluid() && other.is_fluid() && dist < cohesion_range {
                let cohesion = 0.5 * (speck.fluid_params().0 + other.fluid_params().0);
                sum += normal * (-c * w * cohesion);
                n += 1;
            }

            if speck.is_fluid() && other.is_fluid() {
                // Viscosity: blend towards the neighbour's displacement this substep.
                let viscosity = 0.5 * (speck.fluid_params().1 + other.fluid_params().1);
                let falloff = (1. - dist / cohesion_range).max(0.);
                sum += (disp_other - disp) * (viscosity * falloff * w);
            }
        }

        if n_colliders > 0 {
            for contact in collider_contacts[i * n_colliders..(i + 1) * n_colliders]
                .iter()
                .flatten()
            {
                let c = contact.eval(speck.posit_pred);
                if c < 0. {
                    sum += contact.normal * -c;
                    sum += friction_correction(disp, contact.normal, speck.friction, -c);
                    n += 1;
                }
            }
        }

        if n > 0 {
            *delta = sum * (params.omega / n as f32);
        }
    });
}

/// Phase 7, odd passes, per speck.
pub fn solve_apply(specks: &mut [Speck], deltas: &[Vec3]) {
    specks
        .par_iter_mut()
        .zip(deltas.par_iter())
        .for_each(|(speck, delta)| speck.posit_pred += *delta);
}

/// (start, count) of the link block link `i` is in.
fn block_of<'a>(
    links: &'a [RigidBodyLink],
    bodies: &'a [RigidBody],
) -> impl Fn(usize) -> (usize, usize) + Sync + 'a {
    move |i| {
        let body = &bodies[links[i].body as usize];
        (body.link_start as usize, body.link_count as usize)
    }
}

/// Phase 8, pass 0, per link: mass-weighted predicted positions.
pub fn center_of_mass_load(specks: &[Speck], links: &[RigidBodyLink], out: &mut [CenterAccum]) {
    out.par_iter_mut().zip(links.par_iter()).for_each(|(acc, link)| {
        let speck = &specks[link.speck as usize];
        *acc = CenterAccum {
            weighted_posit: speck.posit_pred * speck.mass,
            mass: speck.mass,
        };
    });
}

/// Phases 8 and 9, passes ≥ 1, per link. Reads `src`, writes `dst`; the caller swaps them.
pub fn reduce_pass<T>(
    pass: usize,
    links: &[RigidBodyLink],
    bodies: &[RigidBody],
    src: &[T],
    dst: &mut [T],
) where
    T: Clone + Send + Sync + Add<Output = T>,
{
    crate::reduction::reduction_pass(pass, src, dst, block_of(links, bodies));
}

/// Phase 8, last pass, per body: the solved center from the reduced totals.
pub fn center_of_mass_finish(bodies: &mut [RigidBody], totals: &[CenterAccum]) {
    bodies.par_iter_mut().for_each(|body| {
        if body.link_count == 0 {
            return;
        }
        let total = totals[body.link_start as usize];
        body.center = if total.mass > 0. {
            total.weighted_posit / total.mass
        } else {
            Vec3::new_zero()
        };
    });
}

/// Phase 9, pass 0, per link: this member's term of the shape-matching matrix,
/// m (x - c) qᵀ, with q the rest position in the body frame.
pub fn shape_match_load(
    specks: &[Speck],
    links: &[RigidBodyLink],
    bodies: &[RigidBody],
    out: &mut [Mat3],
) {
    out.par_iter_mut().zip(links.par_iter()).for_each(|(a, link)| {
        let speck = &specks[link.speck as usize];
        let center = bodies[link.body as usize].center;
        *a = outer((speck.posit_pred - center) * speck.mass, link.local);
    });
}

/// Phase 9, last pass, per body: the rotation extracted from the reduced matrix, or the
/// uploaded transform for kinematic bodies.
pub fn shape_match_finish(bodies: &mut [RigidBody], totals: &[Mat3], iterations: usize) {
    bodies.par_iter_mut().for_each(|body| {
        if body.mode == MovementMode::Kinematic {
            body.transform = body.kinematic;
            return;
        }
        if body.link_count == 0 {
            return;
        }
        let rot = extract_rotation(&totals[body.link_start as usize], iterations);
        body.transform = Transform::new(to_quaternion(&rot), body.center);
    });
}

/// Phase 10, per speck: members move to their place in their body. Joint specks go to the
/// average of their places in each body.
pub fn rigid_constraints(
    specks: &mut [Speck],
    memberships: &[Membership],
    links: &[RigidBodyLink],
    bodies: &[RigidBody],
) {
    specks.par_iter_mut().enumerate().for_each(|(i, speck)| {
        let Some(membership) = memberships.get(i) else {
            return;
        };
        if membership.is_empty() {
            return;
        }

        let mut goal = Vec3::new_zero();
        for link_i in membership.iter() {
            let link = &links[*link_i as usize];
            goal += bodies[link.body as usize].goal_transform().apply(link.local);
        }
        speck.posit_pred = goal / membership.len() as f32;
    });
}

/// Phase 11, per speck.
pub fn commit(specks: &mut [Speck], dt: f32) {
    specks.par_iter_mut().for_each(|speck| {
        speck.vel = (speck.posit_pred - speck.posit) / dt;
        speck.posit = speck.posit_pred;
    });
}

/// Phase 12, per speck.
pub fn output(specks: &[Speck], instances: &mut [SpeckInstance]) {
    instances
        .par_iter_mut()
        .zip(specks.par_iter())
        .for_each(|(inst, speck)| {
            *inst = SpeckInstance {
                posit: [speck.posit.x, speck.posit.y, speck.posit.z],
                material: speck.material,
            };
        });
}
