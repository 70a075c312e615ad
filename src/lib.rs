//! A position-based particle ("speck") simulation. Loose specks, fluids, and rigid bodies
//! built from specks are solved together, with joints between bodies, against static colliders.
//!
//! A frame is a number of substeps; each substep runs a fixed plan of data-parallel phases:
//! hashing, integration, contact generation, constraint projection, shape matching for rigid
//! bodies, and commit.

pub mod capacity;
pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod forces;
pub mod math;
pub mod pipeline;
pub mod reduction;
pub mod rigid_body;
pub mod simulation;
pub mod solver;
pub mod spatial_hash;
pub mod speck;
pub mod util;

pub use command::{apply, Command, Response};
pub use config::Config;
pub use device::ComputeContext;
pub use error::{Resource, SimError};
pub use simulation::{Simulation, TickStats, WorldProperties};
pub use speck::SpeckKind;
