//! The per-substep phase plan, and its execution on the compute context.
//!
//! The plan is re-derived each substep from the current counts: which phases run, how many
//! times, over how many elements, and where barriers go. Each phase declares which buffers it
//! reads and writes; a barrier is placed before a dispatch that touches a buffer an earlier
//! dispatch wrote, covering exactly those buffers.

use std::ops::{BitAnd, BitOr};

use crate::{
    forces::{ExternalForce, StaticCollider},
    reduction::pass_count,
    rigid_body::{Membership, RigidBody, RigidBodyLink},
    solver::{self, SolverBuffers, StepParams},
    speck::Speck,
};

/// A set of solver buffers, as bit flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferSet(u16);

impl BufferSet {
    pub const EMPTY: Self = Self(0);
    pub const SPECKS: Self = Self(1 << 0);
    pub const HASH: Self = Self(1 << 1);
    pub const COLLISION_SPACE: Self = Self(1 << 2);
    pub const CONTACTS: Self = Self(1 << 3);
    pub const COLLIDER_CONTACTS: Self = Self(1 << 4);
    pub const DELTAS: Self = Self(1 << 5);
    pub const BODIES: Self = Self(1 << 6);
    pub const REDUCTION: Self = Self(1 << 7);
    pub const INSTANCES: Self = Self(1 << 8);
    pub const LINKS: Self = Self(1 << 9);

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for BufferSet {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for BufferSet {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    RebuildHash,
    InsertSpecks,
    Integrate,
    SpeckContacts,
    ColliderContacts,
    Stabilize,
    Solve,
    CenterOfMass,
    ShapeMatch,
    RigidConstraints,
    Commit,
    Output,
}

/// Every phase, in execution order.
pub const PHASES: [Phase; 12] = [
    Phase::RebuildHash,
    Phase::InsertSpecks,
    Phase::Integrate,
    Phase::SpeckContacts,
    Phase::ColliderContacts,
    Phase::Stabilize,
    Phase::Solve,
    Phase::CenterOfMass,
    Phase::ShapeMatch,
    Phase::RigidConstraints,
    Phase::Commit,
    Phase::Output,
];

/// What the plan depends on.
#[derive(Clone, Copy, Debug, Default)]
pub struct Counts {
    pub specks: usize,
    pub buckets: usize,
    pub colliders: usize,
    pub links: usize,
    /// Links in the largest rigid body.
    pub largest_body: usize,
    pub stabilization_iterations: usize,
    pub solver_iterations: usize,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RebuildHash => "rebuild hash",
            Self::InsertSpecks => "insert specks",
            Self::Integrate => "integrate",
            Self::SpeckContacts => "speck contacts",
            Self::ColliderContacts => "collider contacts",
            Self::Stabilize => "stabilize",
            Self::Solve => "solve",
            Self::CenterOfMass => "center of mass",
            Self::ShapeMatch => "shape match",
            Self::RigidConstraints => "rigid constraints",
            Self::Commit => "commit",
            Self::Output => "output",
        }
    }

    /// Elements per dispatch.
    pub fn size(&self, c: &Counts) -> usize {
        match self {
            Self::RebuildHash => c.buckets,
            Self::ColliderContacts => c.specks * c.colliders,
            // Nothing to resolve without static colliders.
            Self::Stabilize => {
                if c.colliders == 0 {
                    0
                } else {
                    c.specks
                }
            }
            Self::CenterOfMass | Self::ShapeMatch => c.links,
            Self::RigidConstraints => {
                if c.links == 0 {
                    0
                } else {
                    c.specks
                }
            }
            _ => c.specks,
        }
    }

    /// Dispatches per substep.
    pub fn passes(&self, c: &Counts) -> usize {
        match self {
            Self::Stabilize => c.stabilization_iterations,
            // Calculate, then apply.
            Self::Solve => c.solver_iterations * 2,
            Self::CenterOfMass | Self::ShapeMatch => pass_count(c.largest_body),
            _ => 1,
        }
    }

    /// (reads, writes) of one pass.
    pub fn access(&self, pass: usize, passes: usize) -> (BufferSet, BufferSet) {
        use BufferSet as B;

        let last = pass + 1 == passes;
        let reduction_out = if last { B::REDUCTION | B::BODIES } else { B::REDUCTION };

        match self {
            Self::RebuildHash => (B::EMPTY, B::HASH),
            Self::InsertSpecks => (B::SPECKS | B::HASH, B::HASH | B::COLLISION_SPACE),
            Self::Integrate => (B::SPECKS, B::SPECKS),
            Self::SpeckContacts => (
                B::SPECKS | B::HASH | B::COLLISION_SPACE | B::LINKS,
                B::CONTACTS,
            ),
            Self::ColliderContacts => (B::SPECKS, B::COLLIDER_CONTACTS),
            Self::Stabilize => (B::SPECKS | B::COLLIDER_CONTACTS, B::SPECKS),
            Self::Solve => {
                if pass % 2 == 0 {
                    (
                        B::SPECKS | B::CONTACTS | B::COLLIDER_CONTACTS | B::BODIES | B::LINKS,
                        B::DELTAS,
                    )
                } else {
                    (B::SPECKS | B::DELTAS, B::SPECKS)
                }
            }
            Self::CenterOfMass => {
                let reads = if pass == 0 {
                    B::SPECKS | B::LINKS
                } else {
                    B::REDUCTION | B::LINKS | B::BODIES
                };
                (reads, reduction_out)
            }
            Self::ShapeMatch => {
                let reads = if pass == 0 {
                    B::SPECKS | B::LINKS | B::BODIES
                } else {
                    B::REDUCTION | B::LINKS | B::BODIES
                };
                (reads, reduction_out)
            }
            Self::RigidConstraints => (B::BODIES | B::LINKS, B::SPECKS),
            Self::Commit => (B::SPECKS, B::SPECKS),
            Self::Output => (B::SPECKS, B::INSTANCES),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Step {
    /// Wait for prior writes to these buffers to be visible.
    Barrier(BufferSet),
    Dispatch {
        phase: Phase,
        pass: usize,
        passes: usize,
        size: usize,
    },
}

/// The steps of one substep. `pending` holds buffers written but not yet covered by a barrier;
/// it carries over to the next substep.
pub fn plan_substep(counts: &Counts, pending: &mut BufferSet) -> Vec<Step> {
    let mut result = Vec::new();

    for phase in PHASES {
        let size = phase.size(counts);
        let passes = phase.passes(counts);
        if size == 0 {
            continue;
        }

        for pass in 0..passes {
            let (reads, writes) = phase.access(pass, passes);

            let hazard = *pending & (reads | writes);
            if !hazard.is_empty() {
                result.push(Step::Barrier(hazard));
                pending.remove(hazard);
            }

            result.push(Step::Dispatch {
                phase,
                pass,
                passes,
                size,
            });
            pending.insert(writes);
        }
    }

    result
}

/// Everything a dispatch can touch, borrowed for one substep.
pub struct PhaseState<'a> {
    pub specks: &'a mut [Speck],
    pub bodies: &'a mut [RigidBody],
    pub links: &'a [RigidBodyLink],
    pub memberships: &'a [Membership],
    pub forces: &'a [ExternalForce],
    pub colliders: &'a [StaticCollider],
    pub buffers: &'a mut SolverBuffers,
    pub params: StepParams,
}

/// Runs one dispatch to completion. Dispatches are issued serially; each is data-parallel
/// within the current thread pool, and returns only once every element is done, so barriers
/// between them are already satisfied.
pub fn run_dispatch(state: &mut PhaseState, phase: Phase, pass: usize, passes: usize) {
    let last = pass + 1 == passes;
    let n_colliders = state.colliders.len();
    let b = &mut *state.buffers;

    match phase {
        Phase::RebuildHash => solver::rebuild_hash(&b.hash),
        Phase::InsertSpecks => {
            solver::insert_specks(state.specks, &b.hash, &mut b.collision_spaces)
        }
        Phase::Integrate => solver::integrate(state.specks, state.forces, state.params.dt),
        Phase::SpeckContacts => solver::speck_contacts(
            state.specks,
            &b.hash,
            &b.collision_spaces,
            state.memberships,
            state.links,
            &state.params,
            &mut b.contacts,
            &b.contact_overflow,
        ),
        Phase::ColliderContacts => solver::collider_contacts(
            state.specks,
            state.colliders,
            &state.params,
            &mut b.collider_contacts,
        ),
        Phase::Stabilize => solver::stabilize(state.specks, &b.collider_contacts, n_colliders),
        Phase::Solve => {
            if pass % 2 == 0 {
                solver::solve_calculate(
                    state.specks,
                    &b.contacts,
                    &b.collider_contacts,
                    n_colliders,
                    state.memberships,
                    state.links,
                    state.bodies,
                    &state.params,
                    &mut b.deltas,
                );
            } else {
                solver::solve_apply(state.specks, &b.deltas);
            }
        }
        Phase::CenterOfMass => {
            if pass == 0 {
                solver::center_of_mass_load(state.specks, state.links, &mut b.com_src);
            } else {
                solver::reduce_pass(pass, state.links, state.bodies, &b.com_src, &mut b.com_dst);
                std::mem::swap(&mut b.com_src, &mut b.com_dst);
            }
            if last {
                solver::center_of_mass_finish(state.bodies, &b.com_src);
            }
        }
        Phase::ShapeMatch => {
            if pass == 0 {
                solver::shape_match_load(state.specks, state.links, state.bodies, &mut b.cov_src);
            } else {
                solver::reduce_pass(pass, state.links, state.bodies, &b.cov_src, &mut b.cov_dst);
                std::mem::swap(&mut b.cov_src, &mut b.cov_dst);
            }
            if last {
                solver::shape_match_finish(
                    state.bodies,
                    &b.cov_src,
                    state.params.shape_matching_iterations,
                );
            }
        }
        Phase::RigidConstraints => solver::rigid_constraints(
            state.specks,
            state.memberships,
            state.links,
            state.bodies,
        ),
        Phase::Commit => solver::commit(state.specks, state.params.dt),
        Phase::Output => solver::output(state.specks, &mut b.instances),
    }
}
