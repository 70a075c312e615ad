//! Rigid bodies built from specks, and joints between them.
//!
//! A body is a contiguous block of links in the link buffer; each link ties a speck to the
//! body, with the speck's position in the body's frame. A joint is a speck that appears in
//! the link blocks of two bodies: each body's shape matching pulls it towards its own expected
//! position, which couples the bodies.

use lin_alg::f32::Vec3;
use rayon::prelude::*;

use crate::{
    capacity::{BoundedList, MAX_BODIES_PER_SPECK, MAX_RIGID_BODIES, MAX_RIGID_BODY_LINKS},
    error::{check_capacity, Resource, SimError},
    math::Transform,
    speck::SpeckStore,
};

/// Specks with another speck of their batch within this many radii are flagged as boundary
/// specks.
pub const BOUNDARY_NEIGHBOR_FACTOR: f32 = 2.2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MovementMode {
    /// The transform is derived from the specks by shape matching.
    Solved,
    /// The transform is uploaded from outside each tick, and the specks follow it.
    Kinematic,
}

#[derive(Clone, Copy, Debug)]
pub struct RigidBody {
    pub transform: Transform,
    pub mode: MovementMode,
    /// Used instead of the solved transform in kinematic mode.
    pub kinematic: Transform,
    pub tag: u32,
    pub link_start: u32,
    pub link_count: u32,
    /// Mass-weighted center of the members; written by the center of mass phase.
    pub center: Vec3,
}

impl RigidBody {
    /// The transform members are pulled towards.
    pub fn goal_transform(&self) -> &Transform {
        match self.mode {
            MovementMode::Solved => &self.transform,
            MovementMode::Kinematic => &self.kinematic,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RigidBodyLink {
    pub speck: u32,
    pub body: u32,
    /// Rest position, in the body's frame.
    pub local: Vec3,
}

/// Link indices of the bodies a speck belongs to.
pub type Membership = BoundedList<u32, MAX_BODIES_PER_SPECK>;

/// Mass-weighted average position. Zero if the total mass is zero.
pub fn center_of_mass(posits: &[Vec3], masses: &[f32]) -> Vec3 {
    let mut weighted = Vec3::new_zero();
    let mut total = 0.;
    for (p, m) in posits.iter().zip(masses) {
        weighted += *p * *m;
        total += m;
    }

    if total > 0. {
        weighted / total
    } else {
        Vec3::new_zero()
    }
}

/// An approximate inward-pointing surface normal for each speck of a batch: the sum over the
/// other specks of the direction towards them, weighted by inverse distance. Specks with a
/// neighbour within `BOUNDARY_NEIGHBOR_FACTOR × radius` have their gradient doubled.
/// Brute force; only run once, when a batch is added.
pub fn estimate_boundary_gradients(posits: &[Vec3], radius: f32) -> Vec<Vec3> {
    let boundary_dist_sq = (BOUNDARY_NEIGHBOR_FACTOR * radius).powi(2);

    posits
        .par_iter()
        .enumerate()
        .map(|(i, p)| {
            let mut grad = Vec3::new_zero();
            let mut boundary = false;

            for (j, other) in posits.iter().enumerate() {
                if i == j {
                    continue;
                }
                let diff = *other - *p;
                let dist_sq = diff.dot(diff);
                if dist_sq <= 0. {
                    continue; // Coincident; no direction.
                }

                // unit direction / distance
                grad += diff / dist_sq;

                if dist_sq < boundary_dist_sq {
                    boundary = true;
                }
            }

            if boundary {
                grad * 2.
            } else {
                grad
            }
        })
        .collect()
}

/// Host-side rigid body state. Member lists are the source of truth; the link buffer and
/// per-speck memberships are flattened from them whenever membership changes.
#[derive(Default)]
pub struct RigidBodySet {
    bodies: Vec<RigidBody>,
    /// Per body: (speck, local position).
    members: Vec<Vec<(u32, Vec3)>>,
    links: Vec<RigidBodyLink>,
    memberships: Vec<Membership>,
    links_dirty: bool,
}

impl RigidBodySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    pub fn bodies(&self) -> &[RigidBody] {
        &self.bodies
    }

    /// The body buffer, writable, alongside the link buffer and memberships.
    pub(crate) fn split_mut(&mut self) -> (&mut [RigidBody], &[RigidBodyLink], &[Membership]) {
        (&mut self.bodies, &self.links, &self.memberships)
    }

    pub fn get(&self, body: usize) -> Option<&RigidBody> {
        self.bodies.get(body)
    }

    pub fn links(&self) -> &[RigidBodyLink] {
        &self.links
    }

    pub fn memberships(&self) -> &[Membership] {
        &self.memberships
    }

    /// Specks of a body, with their local positions.
    pub fn members(&self, body: usize) -> &[(u32, Vec3)] {
        self.members.get(body).map(|m| m.as_slice()).unwrap_or(&[])
    }

    fn total_members(&self) -> usize {
        self.members.iter().map(|m| m.len()).sum()
    }

    pub fn largest_body(&self) -> usize {
        self.members.iter().map(|m| m.len()).max().unwrap_or(0)
    }

    fn check_index(&self, body: usize) -> Result<(), SimError> {
        if body >= self.bodies.len() {
            return Err(SimError::InvalidIndex {
                kind: "rigid body",
                index: body,
            });
        }
        Ok(())
    }

    /// Whether a body of `speck_count` specks fits.
    pub fn check_create(&self, speck_count: usize) -> Result<(), SimError> {
        check_capacity(Resource::RigidBodies, self.bodies.len(), 1, MAX_RIGID_BODIES)?;
        check_capacity(
            Resource::RigidBodyLinks,
            self.total_members(),
            speck_count,
            MAX_RIGID_BODY_LINKS,
        )?;
        if speck_count == 0 {
            return Err(SimError::InvalidParameter(
                "a rigid body needs at least one speck".to_owned(),
            ));
        }
        Ok(())
    }

    /// Creates a body from specks already in the store. Its center is their mass-weighted
    /// center, with identity rotation. Returns the body index.
    pub fn create(&mut self, specks: &[u32], store: &SpeckStore, tag: u32) -> Result<u32, SimError> {
        self.check_create(specks.len())?;

        let (posits, masses) = gather(specks, store)?;
        let center = center_of_mass(&posits, &masses);
        let transform = Transform::from_translation(center);

        let members = specks
            .iter()
            .zip(&posits)
            .map(|(i, p)| (*i, transform.apply_inverse(*p)))
            .collect();

        let index = self.bodies.len() as u32;
        self.bodies.push(RigidBody {
            transform,
            mode: MovementMode::Solved,
            kinematic: transform,
            tag,
            link_start: 0,
            link_count: 0,
            center,
        });
        self.members.push(members);
        self.links_dirty = true;

        Ok(index)
    }

    /// Adds the joint specks to both bodies, then recomputes both from scratch: adding mass
    /// moves the center of mass, so every member's local position changes.
    pub fn connect_with_joint(
        &mut self,
        body_a: usize,
        body_b: usize,
        joint_specks: &[u32],
        store: &SpeckStore,
    ) -> Result<(), SimError> {
        self.check_connect(body_a, body_b, joint_specks.len())?;
        for &speck in joint_specks {
            let existing = self
                .members
                .iter()
                .filter(|m| m.iter().any(|(s, _)| *s == speck))
                .count();
            check_capacity(Resource::BodiesPerSpeck, existing, 2, MAX_BODIES_PER_SPECK)?;
        }
        // Validates the indices before anything is modified.
        gather(joint_specks, store)?;

        for body in [body_a, body_b] {
            self.members[body].extend(joint_specks.iter().map(|s| (*s, Vec3::new_zero())));
            self.recompute(body, store)?;
        }
        self.links_dirty = true;

        Ok(())
    }

    /// Whether `joint_count` new joint specks can connect these bodies.
    pub fn check_connect(&self, body_a: usize, body_b: usize, joint_count: usize) -> Result<(), SimError> {
        self.check_index(body_a)?;
        self.check_index(body_b)?;
        if body_a == body_b {
            return Err(SimError::InvalidParameter(
                "a joint needs two different bodies".to_owned(),
            ));
        }
        check_capacity(
            Resource::RigidBodyLinks,
            self.total_members(),
            joint_count * 2,
            MAX_RIGID_BODY_LINKS,
        )
    }

    /// Re-derives a body's center and every member's local position from the members'
    /// current positions. The rotation is kept.
    pub fn recompute(&mut self, body: usize, store: &SpeckStore) -> Result<(), SimError> {
        self.check_index(body)?;

        let specks: Vec<u32> = self.members[body].iter().map(|(s, _)| *s).collect();
        let (posits, masses) = gather(&specks, store)?;
        let center = center_of_mass(&posits, &masses);

        let b = &mut self.bodies[body];
        b.transform = Transform::new(b.transform.rotation, center);
        b.center = center;
        let transform = b.transform;

        for ((_, local), p) in self.members[body].iter_mut().zip(&posits) {
            *local = transform.apply_inverse(*p);
        }
        Ok(())
    }

    pub fn set_mode(&mut self, body: usize, mode: MovementMode, transform: Transform) -> Result<(), SimError> {
        self.check_index(body)?;
        let b = &mut self.bodies[body];
        b.mode = mode;
        match mode {
            MovementMode::Kinematic => b.kinematic = transform,
            MovementMode::Solved => b.transform = transform,
        }
        Ok(())
    }

    pub fn links_dirty(&self) -> bool {
        self.links_dirty
    }

    /// Rebuilds the link buffer so each body's links are contiguous, and each speck's list of
    /// the links it's in.
    pub fn flatten(&mut self, speck_count: usize) {
        self.links.clear();
        self.memberships.clear();
        self.memberships.resize(speck_count, Membership::new());

        for (body_i, (body, members)) in self.bodies.iter_mut().zip(&self.members).enumerate() {
            body.link_start = self.links.len() as u32;
            body.link_count = members.len() as u32;

            for (speck, local) in members {
                let link_i = self.links.len() as u32;
                self.links.push(RigidBodyLink {
                    speck: *speck,
                    body: body_i as u32,
                    local: *local,
                });

                if let Some(m) = self.memberships.get_mut(*speck as usize) {
                    // Bounded by the checks in `connect_with_joint`.
                    if m.try_push(link_i).is_err() {
                        eprintln!("Error: Speck {speck} is in too many rigid bodies; link dropped");
                    }
                }
            }
        }

        self.links_dirty = false;
    }
}

/// Current positions and masses of specks in the store.
fn gather(specks: &[u32], store: &SpeckStore) -> Result<(Vec<Vec3>, Vec<f32>), SimError> {
    let mut posits = Vec::with_capacity(specks.len());
    let mut masses = Vec::with_capacity(specks.len());

    for &i in specks {
        let Some(s) = store.get(i as usize) else {
            return Err(SimError::InvalidIndex {
                kind: "speck",
                index: i as usize,
            });
        };
        posits.push(s.posit);
        masses.push(s.mass);
    }
    Ok((posits, masses))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speck::{Speck, SpeckKind};

    const EPS: f32 = 1e-5;

    fn store_with(posits: &[Vec3], mass: f32) -> (SpeckStore, Vec<u32>) {
        let mut store = SpeckStore::new();
        let specks = posits
            .iter()
            .map(|p| Speck::new(*p, mass, 0.5, &SpeckKind::RigidBody, 1))
            .collect();
        let range = store.add(specks).unwrap();
        (store, range.map(|i| i as u32).collect())
    }

    #[test]
    fn weighted_center() {
        let posits = [Vec3::new(0., 0., 0.), Vec3::new(4., 0., 0.)];
        let c = center_of_mass(&posits, &[3., 1.]);
        assert!((c.x - 1.).abs() < EPS);

        let zero = center_of_mass(&posits, &[0., 0.]);
        assert_eq!((zero.x, zero.y, zero.z), (0., 0., 0.));
    }

    #[test]
    fn create_sets_locals() {
        let posits = [
            Vec3::new(1., 1., 1.),
            Vec3::new(3., 1., 1.),
            Vec3::new(1., 3., 1.),
            Vec3::new(3., 3., 1.),
        ];
        let (store, specks) = store_with(&posits, 2.);
        let mut set = RigidBodySet::new();

        let body = set.create(&specks, &store, 5).unwrap();
        assert_eq!(body, 0);

        let b = set.get(0).unwrap();
        assert!((b.transform.translation - Vec3::new(2., 2., 1.)).magnitude() < EPS);
        for ((_, local), p) in set.members(0).iter().zip(&posits) {
            assert!((*local - (*p - Vec3::new(2., 2., 1.))).magnitude() < EPS);
        }
    }

    #[test]
    fn joint_recomputes_both_bodies() {
        let posits = [
            Vec3::new(-1., 0., 0.),
            Vec3::new(1., 0., 0.),
            Vec3::new(0., 0., 0.), // joint
        ];
        let (store, specks) = store_with(&posits, 1.);
        let mut set = RigidBodySet::new();

        let a = set.create(&specks[0..1], &store, 1).unwrap() as usize;
        let b = set.create(&specks[1..2], &store, 2).unwrap() as usize;
        set.connect_with_joint(a, b, &specks[2..3], &store).unwrap();

        // Center moves half way towards the joint.
        let ta = set.get(a).unwrap().transform;
        assert!((ta.translation.x + 0.5).abs() < EPS);
        assert_eq!(set.members(a).len(), 2);

        // Every member, old and new, reconstructs to its world position.
        for body in [a, b] {
            let t = set.get(body).unwrap().transform;
            for (speck, local) in set.members(body) {
                let world = store.posit(*speck as usize).unwrap();
                assert!((t.apply(*local) - world).magnitude() < EPS);
            }
        }

        set.flatten(store.len());
        assert_eq!(set.memberships()[2].len(), 2);
        assert_eq!(set.memberships()[0].len(), 1);
    }

    #[test]
    fn joint_rejects_bad_bodies() {
        let (store, specks) = store_with(&[Vec3::new_zero(), Vec3::new(1., 0., 0.)], 1.);
        let mut set = RigidBodySet::new();
        set.create(&specks[0..1], &store, 1).unwrap();

        assert!(matches!(
            set.connect_with_joint(0, 3, &specks[1..2], &store),
            Err(SimError::InvalidIndex { .. })
        ));
        assert!(matches!(
            set.connect_with_joint(0, 0, &specks[1..2], &store),
            Err(SimError::InvalidParameter(_))
        ));
    }

    #[test]
    fn flatten_is_contiguous() {
        let posits: Vec<Vec3> = (0..7).map(|i| Vec3::new(i as f32, 0., 0.)).collect();
        let (store, specks) = store_with(&posits, 1.);
        let mut set = RigidBodySet::new();
        set.create(&specks[0..3], &store, 1).unwrap();
        set.create(&specks[3..7], &store, 2).unwrap();
        set.flatten(store.len());

        assert_eq!(set.largest_body(), 4);
        for (i, body) in set.bodies().iter().enumerate() {
            let block = &set.links()[body.link_start as usize..(body.link_start + body.link_count) as usize];
            assert!(block.iter().all(|l| l.body == i as u32));
        }
        assert_eq!(set.bodies()[1].link_start, 3);
    }

    #[test]
    fn gradient_single_speck_is_zero() {
        let g = estimate_boundary_gradients(&[Vec3::new(1., 2., 3.)], 0.1);
        assert_eq!((g[0].x, g[0].y, g[0].z), (0., 0., 0.));
    }

    #[test]
    fn gradient_points_inward() {
        let r = 0.5;
        let posits: Vec<Vec3> = (0..8)
            .map(|i| {
                Vec3::new(
                    (i & 1) as f32 * 2. * r,
                    ((i >> 1) & 1) as f32 * 2. * r,
                    ((i >> 2) & 1) as f32 * 2. * r,
                )
            })
            .collect();
        let center = Vec3::new(r, r, r);

        for (p, g) in posits.iter().zip(estimate_boundary_gradients(&posits, r)) {
            assert!(g.dot(center - *p) > 0.);
        }
    }

    #[test]
    fn gradient_coincident_is_finite() {
        let p = Vec3::new(1., 1., 1.);
        let g = estimate_boundary_gradients(&[p, p], 0.1);
        assert!(g.iter().all(|v| v.x.is_finite() && v.y.is_finite() && v.z.is_finite()));
    }
}
