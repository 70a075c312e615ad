//! The speck (particle) type, and its store: a persistent buffer updated in place by the
//! solver phases, plus a staging buffer used only to seed newly added specks.

use std::ops::Range;

use lin_alg::f32::Vec3;

use crate::{
    capacity::MAX_SPECKS,
    error::{check_capacity, Resource, SimError},
};

// Type code layout: kind in the low 2 bits, a joint flag, then the rigid body tag.
pub const KIND_NORMAL: u32 = 0;
pub const KIND_RIGID_BODY: u32 = 1;
pub const KIND_FLUID: u32 = 2;
const KIND_MASK: u32 = 0b11;
const JOINT_FLAG: u32 = 0b100;
const TAG_SHIFT: u32 = 3;
pub const TAG_MASK: u32 = u32::MAX >> TAG_SHIFT;

// Material indices handed to the renderer.
pub const MATERIAL_NORMAL: u32 = 0;
pub const MATERIAL_RIGID_BODY: u32 = 1;
pub const MATERIAL_FLUID: u32 = 2;
pub const MATERIAL_JOINT: u32 = 3;

/// What a batch of specks is added as, with the parameters specific to that kind.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SpeckKind {
    Normal,
    /// The batch becomes one rigid body.
    RigidBody,
    Fluid {
        /// Attraction between neighbouring fluid specks; 0 to 1.
        cohesion: f32,
        /// Velocity smoothing between neighbouring fluid specks; 0 to 1.
        viscosity: f32,
    },
}

impl SpeckKind {
    fn code(&self) -> u32 {
        match self {
            Self::Normal => KIND_NORMAL,
            Self::RigidBody => KIND_RIGID_BODY,
            Self::Fluid { .. } => KIND_FLUID,
        }
    }
}

pub fn pack_type_code(kind: &SpeckKind, joint: bool, tag: u32) -> u32 {
    let joint_bit = if joint { JOINT_FLAG } else { 0 };
    kind.code() | joint_bit | ((tag & TAG_MASK) << TAG_SHIFT)
}

#[derive(Clone, Copy, Debug)]
pub struct Speck {
    pub posit: Vec3,
    /// Where the solver is moving this speck during a substep. Committed in the last phases.
    pub posit_pred: Vec3,
    pub vel: Vec3,
    pub mass: f32,
    /// 0 for immovable specks.
    pub mass_inv: f32,
    pub friction: f32,
    pub type_code: u32,
    pub material: u32,
    /// Fluid: (cohesion, viscosity, _). Rigid body member: boundary gradient, in the body frame.
    pub params: [f32; 3],
}

impl Speck {
    pub fn new(posit: Vec3, mass: f32, friction: f32, kind: &SpeckKind, tag: u32) -> Self {
        let mass_inv = if mass > 0. { 1. / mass } else { 0. };

        let (params, material) = match kind {
            SpeckKind::Normal => ([0.; 3], MATERIAL_NORMAL),
            SpeckKind::RigidBody => ([0.; 3], MATERIAL_RIGID_BODY),
            SpeckKind::Fluid {
                cohesion,
                viscosity,
            } => ([*cohesion, *viscosity, 0.], MATERIAL_FLUID),
        };

        Self {
            posit,
            posit_pred: posit,
            vel: Vec3::new_zero(),
            mass,
            mass_inv,
            friction,
            type_code: pack_type_code(kind, false, tag),
            material,
            params,
        }
    }

    /// A speck shared by two rigid bodies.
    pub fn new_joint(posit: Vec3, mass: f32, friction: f32, tag: u32) -> Self {
        let mut result = Self::new(posit, mass, friction, &SpeckKind::RigidBody, tag);
        result.type_code |= JOINT_FLAG;
        result.material = MATERIAL_JOINT;
        result
    }

    pub fn kind_code(&self) -> u32 {
        self.type_code & KIND_MASK
    }

    pub fn is_rigid(&self) -> bool {
        self.kind_code() == KIND_RIGID_BODY
    }

    pub fn is_fluid(&self) -> bool {
        self.kind_code() == KIND_FLUID
    }

    pub fn is_joint(&self) -> bool {
        self.type_code & JOINT_FLAG != 0
    }

    pub fn tag(&self) -> u32 {
        self.type_code >> TAG_SHIFT
    }

    /// (cohesion, viscosity). Zero for non-fluid specks.
    pub fn fluid_params(&self) -> (f32, f32) {
        if self.is_fluid() {
            (self.params[0], self.params[1])
        } else {
            (0., 0.)
        }
    }

    pub fn boundary_gradient(&self) -> Vec3 {
        if self.is_rigid() {
            Vec3::new(self.params[0], self.params[1], self.params[2])
        } else {
            Vec3::new_zero()
        }
    }

    pub fn set_boundary_gradient(&mut self, grad: Vec3) {
        self.params = [grad.x, grad.y, grad.z];
    }
}

#[derive(Default)]
pub struct SpeckStore {
    /// Authoritative state of every committed speck.
    persistent: Vec<Speck>,
    /// Initial state of every speck ever added. Only `[first_uninit, len)` is ever read, when
    /// seeding; simulated specks are never overwritten from here.
    staging: Vec<Speck>,
    first_uninit: Option<usize>,
}

impl SpeckStore {
    pub fn new() -> Self {
        Self {
            persistent: Vec::with_capacity(MAX_SPECKS),
            staging: Vec::new(),
            first_uninit: None,
        }
    }

    /// Total specks, including ones not yet seeded.
    pub fn len(&self) -> usize {
        self.staging.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staging.is_empty()
    }

    pub fn committed_len(&self) -> usize {
        self.persistent.len()
    }

    pub fn pending_range(&self) -> Option<Range<usize>> {
        self.first_uninit.map(|first| first..self.staging.len())
    }

    /// Appends specks. Returns their (contiguous) indices.
    pub fn add(&mut self, specks: Vec<Speck>) -> Result<Range<usize>, SimError> {
        check_capacity(Resource::Specks, self.len(), specks.len(), MAX_SPECKS)?;

        let first = self.staging.len();
        self.staging.extend(specks);
        let end = self.staging.len();

        if end > first {
            self.first_uninit = Some(match self.first_uninit {
                Some(w) => w.min(first),
                None => first,
            });
        }

        Ok(first..end)
    }

    /// Seeds specks added since the last commit into the persistent buffer. Returns how many.
    pub fn commit_pending(&mut self) -> usize {
        let Some(first) = self.first_uninit.take() else {
            return 0;
        };

        // Anything below the committed length is already being simulated.
        let start = first.max(self.persistent.len());
        let pending = &self.staging[start..];
        self.persistent.extend_from_slice(pending);
        pending.len()
    }

    /// Current state: simulated if committed; initial if still pending.
    pub fn get(&self, i: usize) -> Option<&Speck> {
        self.persistent.get(i).or_else(|| self.staging.get(i))
    }

    pub fn posit(&self, i: usize) -> Option<Vec3> {
        self.get(i).map(|s| s.posit)
    }

    /// Moves a speck, wherever its current state lives. Keeps velocity.
    pub fn set_posit(&mut self, i: usize, posit: Vec3) {
        let speck = if i < self.persistent.len() {
            &mut self.persistent[i]
        } else if let Some(s) = self.staging.get_mut(i) {
            s
        } else {
            return;
        };
        speck.posit = posit;
        speck.posit_pred = posit;
    }

    pub fn persistent(&self) -> &[Speck] {
        &self.persistent
    }

    pub fn persistent_mut(&mut self) -> &mut [Speck] {
        &mut self.persistent
    }
}
