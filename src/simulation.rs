//! The simulation: owns the speck store, rigid bodies, forces and colliders, and advances them
//! by running the phase plan on the compute context.

use std::{
    ops::Range,
    panic::{self, AssertUnwindSafe},
    sync::atomic::Ordering,
    time::Instant,
};

use lin_alg::f32::{Quaternion, Vec3};
use rayon::prelude::*;

use crate::{
    capacity::{MAX_EXTERNAL_FORCES, MAX_SPECKS, MAX_STATIC_COLLIDERS},
    config::Config,
    device::ComputeContext,
    error::{check_capacity, Resource, SimError},
    forces::{ColliderShape, ExternalForce, StaticCollider},
    math::Transform,
    pipeline::{plan_substep, run_dispatch, BufferSet, Counts, Phase, PhaseState, Step},
    rigid_body::{estimate_boundary_gradients, MovementMode, RigidBodySet},
    solver::{SolverBuffers, SpeckInstance, StepParams},
    spatial_hash::choose_bucket_count,
    speck::{Speck, SpeckKind, SpeckStore, TAG_MASK},
    util,
};

/// Rotations shorter than this can't be normalized.
const MIN_ROTATION_NORM: f32 = 1e-12;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WorldProperties {
    pub particle_radius: f32,
}

/// What one tick did.
#[derive(Clone, Copy, Debug, Default)]
pub struct TickStats {
    pub substeps: usize,
    pub dt_substep: f32,
    pub dispatches: usize,
    pub barriers: usize,
    /// Specks seeded from staging at the start of the tick.
    pub seeded: usize,
    /// Hash inserts dropped because a bucket was full, in the last substep.
    pub bucket_overflow: u32,
    /// Contacts dropped because a speck's contact list was full, over the tick.
    pub contact_overflow: u32,
}

pub struct Simulation {
    ctx: ComputeContext,
    config: Config,
    store: SpeckStore,
    bodies: RigidBodySet,
    forces: Vec<ExternalForce>,
    colliders: Vec<StaticCollider>,
    buffers: SolverBuffers,
    /// Buffers written by dispatches not yet covered by a barrier.
    pending: BufferSet,
    /// Moving average of the frame time. Seconds.
    dt_smoothed: f32,
    /// Simulated time. Seconds.
    time: f32,
    ticks: usize,
    /// Set when a dispatch fails. A failed simulation doesn't tick again.
    failure: Option<String>,
}

fn check_finite(v: Vec3, what: &str) -> Result<(), SimError> {
    if v.x.is_finite() && v.y.is_finite() && v.z.is_finite() {
        Ok(())
    } else {
        Err(SimError::InvalidParameter(format!("{what} must be finite")))
    }
}

/// The unit rotation `q` describes. Rigid transforms carry no scale, so non-unit
/// quaternions are normalized.
fn check_rotation(q: Quaternion, what: &str) -> Result<Quaternion, SimError> {
    let mag = q.magnitude();
    if !mag.is_finite() || mag < MIN_ROTATION_NORM {
        return Err(SimError::InvalidParameter(format!(
            "{what} must be a finite, non-zero quaternion"
        )));
    }
    Ok(q.to_normalized())
}

fn check_transform(t: Transform, what: &str) -> Result<Transform, SimError> {
    check_finite(t.translation, what)?;
    Ok(Transform::new(check_rotation(t.rotation, what)?, t.translation))
}

fn check_non_negative(val: f32, what: &str) -> Result<(), SimError> {
    if val >= 0. && val.is_finite() {
        Ok(())
    } else {
        Err(SimError::InvalidParameter(format!("{what} must be non-negative")))
    }
}

fn check_unit(val: f32, what: &str) -> Result<(), SimError> {
    if (0. ..=1.).contains(&val) {
        Ok(())
    } else {
        Err(SimError::InvalidParameter(format!("{what} must be in [0, 1]")))
    }
}

/// Index of a speck with a non-finite position or prediction, if any.
fn first_non_finite(specks: &[Speck]) -> Option<usize> {
    let finite = |v: Vec3| v.x.is_finite() && v.y.is_finite() && v.z.is_finite();
    specks
        .par_iter()
        .position_any(|s| !finite(s.posit) || !finite(s.posit_pred))
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Dispatch panicked".to_owned()
    }
}

impl Simulation {
    pub fn new(ctx: ComputeContext, config: Config) -> Result<Self, SimError> {
        config.validate()?;

        Ok(Self {
            ctx,
            buffers: SolverBuffers::new(config.particle_diameter()),
            dt_smoothed: config.nominal_dt,
            config,
            store: SpeckStore::new(),
            bodies: RigidBodySet::new(),
            forces: Vec::new(),
            colliders: Vec::new(),
            pending: BufferSet::default(),
            time: 0.,
            ticks: 0,
            failure: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn world_properties(&self) -> WorldProperties {
        WorldProperties {
            particle_radius: self.config.particle_radius,
        }
    }

    pub fn speck_count(&self) -> usize {
        self.store.len()
    }

    /// A speck's current state; its initial state if it hasn't been seeded yet.
    pub fn speck(&self, i: usize) -> Option<&Speck> {
        self.store.get(i)
    }

    pub fn bodies(&self) -> &RigidBodySet {
        &self.bodies
    }

    /// Simulated time, in seconds.
    pub fn time(&self) -> f32 {
        self.time
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Per-speck render data, as of the end of the last tick.
    pub fn instances(&self) -> &[SpeckInstance] {
        &self.buffers.instances
    }

    /// Each rigid body's current transform.
    pub fn body_transforms(&self) -> Vec<Transform> {
        self.bodies
            .bodies()
            .iter()
            .map(|b| *b.goal_transform())
            .collect()
    }

    fn check_batch(positions: &[Vec3], friction: f32, mass: f32) -> Result<(), SimError> {
        check_non_negative(mass, "mass")?;
        check_non_negative(friction, "friction")?;
        for p in positions {
            check_finite(*p, "position")?;
        }
        Ok(())
    }

    /// Adds a batch of specks, all of the same kind. A `RigidBody` batch becomes one new body.
    /// Returns the specks' indices, and the body's. Specks start simulating at the next tick.
    pub fn add_specks(
        &mut self,
        positions: &[Vec3],
        kind: SpeckKind,
        friction: f32,
        mass: f32,
    ) -> Result<(Range<usize>, Option<u32>), SimError> {
        Self::check_batch(positions, friction, mass)?;
        check_capacity(Resource::Specks, self.store.len(), positions.len(), MAX_SPECKS)?;

        match kind {
            SpeckKind::Fluid {
                cohesion,
                viscosity,
            } => {
                check_unit(cohesion, "cohesion")?;
                check_unit(viscosity, "viscosity")?;
            }
            SpeckKind::RigidBody => self.bodies.check_create(positions.len())?,
            SpeckKind::Normal => (),
        }

        if kind != SpeckKind::RigidBody {
            let specks = positions
                .iter()
                .map(|p| Speck::new(*p, mass, friction, &kind, 0))
                .collect();
            return Ok((self.store.add(specks)?, None));
        }

        let tag = rand::random::<u32>() & TAG_MASK;
        let grads = estimate_boundary_gradients(positions, self.config.particle_radius);

        let specks = positions
            .iter()
            .zip(grads)
            .map(|(p, g)| {
                let mut s = Speck::new(*p, mass, friction, &kind, tag);
                // The body starts unrotated, so world and body frames agree.
                s.set_boundary_gradient(g);
                s
            })
            .collect();

        let range = self.store.add(specks)?;
        let indices: Vec<u32> = range.clone().map(|i| i as u32).collect();
        let body = self.bodies.create(&indices, &self.store, tag)?;

        Ok((range, Some(body)))
    }

    /// Adds joint specks shared by two existing bodies. Returns the joint specks' indices.
    pub fn connect_bodies(
        &mut self,
        body_a: usize,
        body_b: usize,
        positions: &[Vec3],
        mass: f32,
        friction: f32,
    ) -> Result<Range<usize>, SimError> {
        Self::check_batch(positions, friction, mass)?;
        if positions.is_empty() {
            return Err(SimError::InvalidParameter(
                "a joint needs at least one speck".to_owned(),
            ));
        }
        check_capacity(Resource::Specks, self.store.len(), positions.len(), MAX_SPECKS)?;
        self.bodies.check_connect(body_a, body_b, positions.len())?;

        let tag = self.bodies.get(body_a).map(|b| b.tag).unwrap_or_default();

        // Deep contacts read a joint's gradient through its first membership, which `flatten`
        // puts in the lower-indexed body.
        let frame = self
            .bodies
            .get(body_a.min(body_b))
            .map(|b| b.goal_transform().rotation.inverse())
            .unwrap_or_default();
        let grads = estimate_boundary_gradients(positions, self.config.particle_radius);

        let specks = positions
            .iter()
            .zip(grads)
            .map(|(p, g)| {
                let mut s = Speck::new_joint(*p, mass, friction, tag);
                s.set_boundary_gradient(frame.rotate_vec(g));
                s
            })
            .collect();

        let range = self.store.add(specks)?;
        let indices: Vec<u32> = range.clone().map(|i| i as u32).collect();
        self.bodies
            .connect_with_joint(body_a, body_b, &indices, &self.store)?;

        Ok(range)
    }

    /// `Kinematic`: the body follows `transform` from the next tick on. `Solved`: the body is
    /// released to the solver, with its members moved to `transform`.
    pub fn set_body_transform(
        &mut self,
        body: usize,
        mode: MovementMode,
        transform: Transform,
    ) -> Result<(), SimError> {
        let transform = check_transform(transform, "rigid body transform")?;
        self.bodies.set_mode(body, mode, transform)?;

        if mode == MovementMode::Solved {
            let members = self.bodies.members(body).to_vec();
            for (speck, local) in members {
                self.store.set_posit(speck as usize, transform.apply(local));
            }
        }
        Ok(())
    }

    pub fn set_time_multiplier(&mut self, scale: f32) -> Result<(), SimError> {
        check_non_negative(scale, "time multiplier")?;
        self.config.time_multiplier = scale;
        Ok(())
    }

    /// Each `None` keeps the current value.
    pub fn set_solver_params(
        &mut self,
        stabilization_iterations: Option<usize>,
        solver_iterations: Option<usize>,
        substeps: Option<usize>,
    ) -> Result<(), SimError> {
        let mut cfg = self.config.clone();
        if let Some(v) = stabilization_iterations {
            cfg.stabilization_iterations = v;
        }
        if let Some(v) = solver_iterations {
            cfg.solver_iterations = v;
        }
        if let Some(v) = substeps {
            cfg.substeps = v;
        }

        cfg.validate()?;
        self.config = cfg;
        Ok(())
    }

    pub fn add_force(&mut self, force: ExternalForce) -> Result<(), SimError> {
        check_capacity(
            Resource::ExternalForces,
            self.forces.len(),
            1,
            MAX_EXTERNAL_FORCES,
        )?;
        check_finite(force.vector, "force")?;
        self.forces.push(force);
        Ok(())
    }

    pub fn add_collider(&mut self, collider: StaticCollider) -> Result<(), SimError> {
        check_capacity(
            Resource::StaticColliders,
            self.colliders.len(),
            1,
            MAX_STATIC_COLLIDERS,
        )?;
        let collider = StaticCollider {
            transform: check_transform(collider.transform, "collider transform")?,
            ..collider
        };
        if let ColliderShape::Box { half_extents: h } = collider.shape {
            if !(h.x > 0. && h.y > 0. && h.z > 0.) {
                return Err(SimError::InvalidParameter(
                    "box half extents must be positive".to_owned(),
                ));
            }
        }
        self.colliders.push(collider);
        Ok(())
    }

    /// Advances by one frame. `elapsed` is the wall time since the last frame; it's smoothed,
    /// clamped, and scaled by the time multiplier before being split into substeps.
    pub fn tick(&mut self, elapsed: f32) -> Result<TickStats, SimError> {
        let elapsed = if elapsed.is_finite() { elapsed.max(0.) } else { 0. };
        self.dt_smoothed = util::lerp(self.dt_smoothed, elapsed, self.config.dt_smoothing);

        let dt = self.dt_smoothed.min(self.config.max_dt) * self.config.time_multiplier;
        self.step(dt)
    }

    /// Advances by exactly `dt`. A non-positive `dt` seeds new specks and refreshes the output
    /// without moving anything.
    pub fn step(&mut self, dt: f32) -> Result<TickStats, SimError> {
        if let Some(msg) = &self.failure {
            return Err(SimError::Device(msg.clone()));
        }
        let start = Instant::now();

        let seeded = self.store.commit_pending();
        if seeded > 0 || self.bodies.links_dirty() {
            self.bodies.flatten(self.store.committed_len());
        }

        let n = self.store.committed_len();
        let counts = Counts {
            specks: n,
            buckets: if n == 0 {
                0
            } else {
                choose_bucket_count(&self.ctx.primes, n)
            },
            colliders: self.colliders.len(),
            links: self.bodies.links().len(),
            largest_body: self.bodies.largest_body(),
            stabilization_iterations: self.config.stabilization_iterations,
            solver_iterations: self.config.solver_iterations,
        };

        let substeps = if dt > 0. { self.config.substeps } else { 0 };
        let params = StepParams {
            dt: if substeps > 0 { dt / substeps as f32 } else { 0. },
            radius: self.config.particle_radius,
            omega: self.config.sor_omega,
            contact_margin: self.config.contact_margin,
            cohesion_range: self.config.cohesion_range,
            shape_matching_iterations: self.config.shape_matching_iterations,
        };

        self.buffers
            .resize(n, counts.buckets, counts.colliders, counts.links);
        self.buffers.contact_overflow.store(0, Ordering::Relaxed);

        let mut stats = TickStats {
            substeps,
            dt_substep: params.dt,
            seeded,
            ..Default::default()
        };

        let Self {
            ctx,
            store,
            bodies,
            forces,
            colliders,
            buffers,
            pending,
            ..
        } = self;
        let (bodies_buf, links, memberships) = bodies.split_mut();

        let mut state = PhaseState {
            specks: store.persistent_mut(),
            bodies: bodies_buf,
            links,
            memberships,
            forces,
            colliders,
            buffers,
            params,
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            ctx.pool.install(|| {
                for _ in 0..substeps {
                    for step in plan_substep(&counts, pending) {
                        match step {
                            Step::Barrier(_) => stats.barriers += 1,
                            Step::Dispatch {
                                phase,
                                pass,
                                passes,
                                ..
                            } => {
                                run_dispatch(&mut state, phase, pass, passes);
                                stats.dispatches += 1;
                            }
                        }
                    }

                    if let Some(i) = first_non_finite(state.specks) {
                        return Err(format!("Non-finite position on speck {i}"));
                    }
                }

                if substeps == 0 && n > 0 {
                    run_dispatch(&mut state, Phase::Output, 0, 1);
                    stats.dispatches += 1;
                }
                Ok(())
            })
        }));

        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(msg)) => Some(msg),
            Err(payload) => Some(panic_message(payload)),
        };
        if let Some(msg) = failure {
            eprintln!("Error: Simulation failed at t = {}: {msg}", self.time);
            self.failure = Some(msg.clone());
            return Err(SimError::Device(msg));
        }

        stats.bucket_overflow = self.buffers.hash.overflow();
        stats.contact_overflow = self.buffers.contact_overflow.load(Ordering::Relaxed);
        if stats.bucket_overflow > 0 || stats.contact_overflow > 0 {
            eprintln!(
                "Warning: Dropped {} hash inserts and {} contacts this tick",
                stats.bucket_overflow, stats.contact_overflow
            );
        }

        if substeps > 0 {
            self.time += dt;
        }
        self.ticks += 1;

        if self.config.log_ratio != 0 && self.ticks % self.config.log_ratio == 0 {
            println!(
                "t: {:.3}s, specks: {}, bodies: {}, tick time: {}μs",
                self.time,
                n,
                self.bodies.len(),
                start.elapsed().as_micros()
            );
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use lin_alg::f32::Quaternion;

    use super::*;

    const EPS: f32 = 1e-4;

    fn sim() -> Simulation {
        let ctx = ComputeContext::new(Some(2)).unwrap();
        let cfg = Config {
            particle_radius: 0.5,
            log_ratio: 0,
            ..Default::default()
        };
        Simulation::new(ctx, cfg).unwrap()
    }

    /// Unit-spaced 2×2×2 cube, corner at `origin`.
    fn cube(origin: Vec3) -> Vec<Vec3> {
        (0..8)
            .map(|i| {
                origin
                    + Vec3::new(
                        (i & 1) as f32,
                        ((i >> 1) & 1) as f32,
                        ((i >> 2) & 1) as f32,
                    )
            })
            .collect()
    }

    #[test]
    fn rigid_cube_is_built() {
        let mut sim = sim();
        let posits = cube(Vec3::new(1., 2., 3.));

        let (range, body) = sim.add_specks(&posits, SpeckKind::RigidBody, 0.5, 1.).unwrap();
        assert_eq!(range, 0..8);
        assert_eq!(body, Some(0));

        let center = Vec3::new(1.5, 2.5, 3.5);
        let t = sim.body_transforms()[0];
        assert!((t.translation - center).magnitude() < EPS);

        for (speck, local) in sim.bodies().members(0) {
            let world = posits[*speck as usize];
            assert!((*local - (world - center)).magnitude() < EPS);
            // Every corner is on the boundary.
            assert!(sim.speck(*speck as usize).unwrap().boundary_gradient().magnitude() > 0.);
        }
    }

    #[test]
    fn batches_get_contiguous_indices() {
        let mut sim = sim();
        let (a, _) = sim
            .add_specks(&cube(Vec3::new_zero()), SpeckKind::Normal, 0., 1.)
            .unwrap();
        let (b, body) = sim
            .add_specks(&cube(Vec3::new(5., 0., 0.)), SpeckKind::RigidBody, 0., 1.)
            .unwrap();
        let single = sim
            .add_specks(&[Vec3::new(9., 0., 0.)], SpeckKind::RigidBody, 0., 1.)
            .unwrap();

        assert_eq!(a, 0..8);
        assert_eq!(b, 8..16);
        assert_eq!(body, Some(0));
        assert_eq!(single, (16..17, Some(1)));
    }

    #[test]
    fn over_capacity_is_rejected_without_change() {
        let mut sim = sim();
        let posits = vec![Vec3::new_zero(); MAX_SPECKS + 1];

        let result = sim.add_specks(&posits, SpeckKind::RigidBody, 0., 1.);
        assert!(matches!(
            result,
            Err(SimError::CapacityExceeded {
                resource: Resource::Specks,
                ..
            })
        ));
        assert_eq!(sim.speck_count(), 0);
        assert!(sim.bodies().is_empty());
    }

    #[test]
    fn bad_parameters_are_rejected() {
        let mut sim = sim();
        let p = [Vec3::new_zero()];

        assert!(sim.add_specks(&p, SpeckKind::Normal, 0., -1.).is_err());
        assert!(sim
            .add_specks(
                &p,
                SpeckKind::Fluid {
                    cohesion: 2.,
                    viscosity: 0.
                },
                0.,
                1.
            )
            .is_err());
        assert!(sim.add_specks(&[], SpeckKind::RigidBody, 0., 1.).is_err());
        assert!(sim.set_solver_params(None, Some(0), None).is_err());
        assert!(sim.set_time_multiplier(f32::NAN).is_err());
        assert_eq!(sim.speck_count(), 0);
    }

    #[test]
    fn specks_fall_and_land() {
        let mut sim = sim();
        sim.add_force(ExternalForce::gravity(9.8)).unwrap();
        sim.add_collider(StaticCollider::plane(Transform::new_identity()))
            .unwrap();
        sim.add_specks(&[Vec3::new(0., 2., 0.)], SpeckKind::Normal, 0.5, 1.)
            .unwrap();

        for _ in 0..300 {
            sim.step(1. / 60.).unwrap();
        }

        let y = sim.instances()[0].posit[1];
        // Resting on the floor, at one radius.
        assert!((y - 0.5).abs() < 0.05, "y: {y}");
    }

    #[test]
    fn undeformed_body_keeps_identity_rotation() {
        let mut sim = sim();
        sim.add_specks(&cube(Vec3::new_zero()), SpeckKind::RigidBody, 0.5, 1.)
            .unwrap();

        for _ in 0..5 {
            sim.step(1. / 60.).unwrap();
        }

        let t = sim.body_transforms()[0];
        let q = t.rotation;
        assert!((q.w.abs() - 1.).abs() < EPS, "{q:?}");
        assert!((t.translation - Vec3::new(0.5, 0.5, 0.5)).magnitude() < EPS);
    }

    #[test]
    fn kinematic_body_follows_override() {
        let mut sim = sim();
        let (range, body) = sim
            .add_specks(&cube(Vec3::new_zero()), SpeckKind::RigidBody, 0.5, 1.)
            .unwrap();
        let body = body.unwrap() as usize;
        sim.add_force(ExternalForce::gravity(9.8)).unwrap();

        let rot = Quaternion::from_axis_angle(Vec3::new(0., 1., 0.), 0.7);
        let t = Transform::new(rot, Vec3::new(3., 4., 5.));
        sim.set_body_transform(body, MovementMode::Kinematic, t)
            .unwrap();
        sim.step(1. / 60.).unwrap();

        for (speck, local) in sim.bodies().members(body) {
            let expected = t.apply(*local);
            let actual = sim.speck(*speck as usize).unwrap().posit;
            assert!((actual - expected).magnitude() < EPS);
        }
        assert_eq!(range.len(), sim.instances().len());
    }

    #[test]
    fn solved_teleports_members() {
        let mut sim = sim();
        sim.add_specks(&cube(Vec3::new_zero()), SpeckKind::RigidBody, 0.5, 1.)
            .unwrap();
        sim.step(0.).unwrap();

        let t = Transform::from_translation(Vec3::new(10., 0., 0.));
        sim.set_body_transform(0, MovementMode::Solved, t).unwrap();
        assert!((sim.speck(0).unwrap().posit.x - 9.5).abs() < EPS);
    }

    #[test]
    fn jointed_pair_stays_consistent() {
        let mut sim = sim();
        sim.add_force(ExternalForce::gravity(9.8)).unwrap();
        sim.set_solver_params(None, Some(10), None).unwrap();

        let r = sim.world_properties().particle_radius;
        let (_, a) = sim
            .add_specks(&[Vec3::new(-2. * r, 0., 0.)], SpeckKind::RigidBody, 0., 1.)
            .unwrap();
        let (_, b) = sim
            .add_specks(&[Vec3::new(2. * r, 0., 0.)], SpeckKind::RigidBody, 0., 1.)
            .unwrap();
        let joint = sim
            .connect_bodies(a.unwrap() as usize, b.unwrap() as usize, &[Vec3::new_zero()], 1., 0.)
            .unwrap();
        assert_eq!(joint, 2..3);

        for _ in 0..60 {
            sim.step(1. / 60.).unwrap();
        }

        // Free fall for one second: the pair falls together, staying intact.
        let p0 = sim.speck(0).unwrap().posit;
        let p1 = sim.speck(1).unwrap().posit;
        let pj = sim.speck(2).unwrap().posit;
        assert!(p0.y < -1. && p0.y > -10.);
        assert!(((p1 - p0).magnitude() - 4. * r).abs() < 0.05);
        assert!((pj - (p0 + p1) * 0.5).magnitude() < 0.05);

        // Each member reconstructs from its body's transform.
        let transforms = sim.body_transforms();
        for body in 0..2 {
            for (speck, local) in sim.bodies().members(body) {
                let world = sim.speck(*speck as usize).unwrap().posit;
                assert!((transforms[body].apply(*local) - world).magnitude() < 0.05);
            }
        }
    }

    #[test]
    fn bad_rotations_are_rejected() {
        let mut sim = sim();
        sim.add_specks(&cube(Vec3::new_zero()), SpeckKind::RigidBody, 0.5, 1.)
            .unwrap();

        for rot in [
            Quaternion::new(f32::NAN, 0., 0., 0.),
            Quaternion::new(0., 0., 0., 0.),
            Quaternion::new(1., f32::INFINITY, 0., 0.),
        ] {
            let t = Transform::new(rot, Vec3::new_zero());
            assert!(matches!(
                sim.set_body_transform(0, MovementMode::Kinematic, t),
                Err(SimError::InvalidParameter(_))
            ));
            assert!(matches!(
                sim.add_collider(StaticCollider::plane(t)),
                Err(SimError::InvalidParameter(_))
            ));
        }

        assert_eq!(sim.bodies().get(0).unwrap().mode, MovementMode::Solved);
        sim.step(1. / 60.).unwrap();
        assert!(!sim.is_failed());
    }

    #[test]
    fn scaled_rotation_is_normalized() {
        let mut sim = sim();
        sim.add_specks(&cube(Vec3::new_zero()), SpeckKind::RigidBody, 0.5, 1.)
            .unwrap();

        let t = Transform::new(Quaternion::new(2., 0., 0., 0.), Vec3::new(1., 1., 1.));
        sim.set_body_transform(0, MovementMode::Kinematic, t).unwrap();
        sim.step(1. / 60.).unwrap();

        // Opposite corners keep their distance.
        let diag = sim.speck(7).unwrap().posit - sim.speck(0).unwrap().posit;
        assert!((diag.magnitude() - 3f32.sqrt()).abs() < EPS);
    }

    /// A floor given a scaled rotation still stops specks at one radius.
    #[test]
    fn collider_rotation_is_normalized() {
        let mut sim = sim();
        let floor = Transform::new(Quaternion::new(2., 0., 0., 0.), Vec3::new_zero());
        sim.add_collider(StaticCollider::plane(floor)).unwrap();
        sim.add_specks(&[Vec3::new(0., 0.3, 0.)], SpeckKind::Normal, 0., 1.)
            .unwrap();
        sim.step(1. / 60.).unwrap();
        let r = sim.world_properties().particle_radius;
        assert!((sim.speck(0).unwrap().posit.y - r).abs() < 1e-3);
    }

    #[test]
    fn joint_batch_gets_boundary_gradients() {
        let mut sim = sim();
        sim.add_specks(&cube(Vec3::new_zero()), SpeckKind::RigidBody, 0.5, 1.)
            .unwrap();
        sim.add_specks(&cube(Vec3::new(3., 0., 0.)), SpeckKind::RigidBody, 0.5, 1.)
            .unwrap();

        // Body 0, the one joint gradients are stored relative to, is rotated.
        let rot = Quaternion::from_axis_angle(Vec3::new(0., 0., 1.), 0.9);
        sim.set_body_transform(
            0,
            MovementMode::Kinematic,
            Transform::new(rot, Vec3::new(0.5, 0.5, 0.5)),
        )
        .unwrap();

        let joint: Vec<Vec3> = (0..4)
            .map(|i| Vec3::new(2., (i & 1) as f32, ((i >> 1) & 1) as f32))
            .collect();
        let range = sim.connect_bodies(1, 0, &joint, 1., 0.5).unwrap();

        let r = sim.world_properties().particle_radius;
        let expected = estimate_boundary_gradients(&joint, r);
        for (i, want) in range.zip(expected) {
            let grad = sim.speck(i).unwrap().boundary_gradient();
            assert!(grad.magnitude() > EPS);
            assert!((rot.rotate_vec(grad) - want).magnitude() < EPS);
        }
    }

    #[test]
    fn paused_tick_only_refreshes_output() {
        let mut sim = sim();
        sim.add_force(ExternalForce::gravity(9.8)).unwrap();
        sim.add_specks(&[Vec3::new(1., 2., 3.)], SpeckKind::Normal, 0., 1.)
            .unwrap();
        sim.set_time_multiplier(0.).unwrap();

        let stats = sim.tick(1. / 60.).unwrap();
        assert_eq!(stats.seeded, 1);
        assert_eq!(stats.substeps, 0);
        assert_eq!(stats.dispatches, 1);
        assert_eq!(sim.instances()[0].posit, [1., 2., 3.]);
    }

    #[test]
    fn frame_time_is_smoothed() {
        let mut sim = sim();
        sim.add_specks(&[Vec3::new_zero()], SpeckKind::Normal, 0., 1.)
            .unwrap();

        // A single long frame barely moves the average.
        let stats = sim.tick(1.).unwrap();
        let nominal = sim.config().nominal_dt;
        let expected = util::lerp(nominal, 1., 0.01) / sim.config().substeps as f32;
        assert!((stats.dt_substep - expected).abs() < 1e-6);
    }

    #[test]
    fn non_finite_state_poisons() {
        let mut sim = sim();
        sim.add_specks(&[Vec3::new_zero()], SpeckKind::Normal, 0., 1.)
            .unwrap();
        sim.add_force(ExternalForce {
            vector: Vec3::new(f32::MAX, 0., 0.),
            kind: crate::forces::ForceKind::Acceleration,
        })
        .unwrap();

        // Overflows to infinity after a couple of steps.
        let mut failed = false;
        for _ in 0..10 {
            if sim.step(1e10).is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed);
        assert!(sim.is_failed());
        assert!(matches!(sim.step(0.01), Err(SimError::Device(_))));
    }
}
