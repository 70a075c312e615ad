//! Solver and world configuration. Persisted with Bincode, so tuned values survive restarts.

use std::path::Path;

use bincode::{Decode, Encode};

use crate::{error::SimError, util};

pub const SAVE_FILE: &str = "config.speck";

/// Bounds applied by `SetSolverParameters`.
pub const MAX_SUBSTEPS: usize = 32;
pub const MAX_SOLVER_ITERATIONS: usize = 64;
pub const MAX_STABILIZATION_ITERATIONS: usize = 16;

#[derive(Clone, Debug, Encode, Decode)]
pub struct Config {
    /// All specks share this radius. Hash cells are one diameter wide.
    pub particle_radius: f32,
    pub substeps: usize,
    /// Each iteration is a calculate dispatch, then an apply dispatch.
    pub solver_iterations: usize,
    pub stabilization_iterations: usize,
    /// Successive over-relaxation factor for the solve. Must be in (1, 2).
    pub sor_omega: f32,
    pub time_multiplier: f32,
    /// Initial value of the smoothed frame time. Seconds.
    pub nominal_dt: f32,
    /// Frame times are clamped to this before smoothing. Seconds.
    pub max_dt: f32,
    /// Lerp factor of the frame time moving average.
    pub dt_smoothing: f32,
    /// QR iterations when extracting rigid body rotations.
    pub shape_matching_iterations: usize,
    /// Contacts are generated within `(1 + margin) × contact distance`.
    pub contact_margin: f32,
    /// Fluid specks attract each other out to this many diameters.
    pub cohesion_range: f32,
    /// Print progress every this many ticks. 0 disables it.
    pub log_ratio: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            particle_radius: 0.05,
            substeps: 2,
            solver_iterations: 4,
            stabilization_iterations: 1,
            sor_omega: 1.5,
            time_multiplier: 1.,
            nominal_dt: 1. / 60.,
            max_dt: 1. / 15.,
            dt_smoothing: 0.01,
            shape_matching_iterations: 24,
            contact_margin: 0.1,
            cohesion_range: 1.5,
            log_ratio: 600,
        }
    }
}

impl Config {
    /// Load the config. A saved config that no longer validates is rejected.
    pub fn load(path: &Path) -> Result<Self, SimError> {
        let result: Self = util::load(path)?;
        result.validate()?;
        Ok(result)
    }

    pub fn save(&self, path: &Path) -> Result<(), SimError> {
        Ok(util::save(path, self)?)
    }

    /// Rejects values the solver can't run with.
    pub fn validate(&self) -> Result<(), SimError> {
        let invalid = |msg: &str| Err(SimError::InvalidParameter(msg.to_owned()));

        if !(self.particle_radius > 0.) || !self.particle_radius.is_finite() {
            return invalid("particle radius must be positive");
        }
        if self.substeps == 0 || self.substeps > MAX_SUBSTEPS {
            return invalid("substeps out of range");
        }
        if self.solver_iterations == 0 || self.solver_iterations > MAX_SOLVER_ITERATIONS {
            return invalid("solver iterations out of range");
        }
        if self.stabilization_iterations > MAX_STABILIZATION_ITERATIONS {
            return invalid("stabilization iterations out of range");
        }
        if !(self.sor_omega > 1. && self.sor_omega < 2.) {
            return invalid("SOR omega must be in (1, 2)");
        }
        if !(self.time_multiplier >= 0.) || !self.time_multiplier.is_finite() {
            return invalid("time multiplier must be non-negative");
        }
        if !(self.nominal_dt > 0.) || !(self.max_dt >= self.nominal_dt) {
            return invalid("frame time bounds");
        }
        if !(self.dt_smoothing > 0. && self.dt_smoothing <= 1.) {
            return invalid("dt smoothing must be in (0, 1]");
        }
        Ok(())
    }

    pub fn particle_diameter(&self) -> f32 {
        self.particle_radius * 2.
    }
}
