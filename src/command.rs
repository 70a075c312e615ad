//! The command surface: every way the outside world changes a simulation, as one enum.
//! Each command is validated in full before anything is modified.

use lin_alg::f32::Vec3;

use crate::{
    error::SimError,
    forces::{ExternalForce, StaticCollider},
    math::Transform,
    rigid_body::MovementMode,
    simulation::{Simulation, WorldProperties},
    speck::SpeckKind,
};

#[derive(Clone, Debug)]
pub enum Command {
    AddParticles {
        positions: Vec<Vec3>,
        kind: SpeckKind,
        friction: f32,
        mass: f32,
    },
    /// Adds joint specks at `positions`, shared by both bodies.
    ConnectRigidBodies {
        body_a: usize,
        body_b: usize,
        positions: Vec<Vec3>,
        mass: f32,
        friction: f32,
    },
    SetRigidBodyTransform {
        body: usize,
        mode: MovementMode,
        transform: Transform,
    },
    SetTimeMultiplier(f32),
    /// `None` keeps the current value.
    SetSolverParameters {
        stabilization_iterations: Option<usize>,
        solver_iterations: Option<usize>,
        substeps: Option<usize>,
    },
    AddExternalForce(ExternalForce),
    AddStaticCollider(StaticCollider),
    GetWorldProperties,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Response {
    Particles {
        first_index: usize,
        count: usize,
        /// Set if the particles were added as a rigid body.
        rigid_body: Option<u32>,
    },
    Joint {
        first_index: usize,
        count: usize,
    },
    Done,
    WorldProperties(WorldProperties),
}

pub fn apply(sim: &mut Simulation, cmd: Command) -> Result<Response, SimError> {
    Ok(match cmd {
        Command::AddParticles {
            positions,
            kind,
            friction,
            mass,
        } => {
            let (range, rigid_body) = sim.add_specks(&positions, kind, friction, mass)?;
            Response::Particles {
                first_index: range.start,
                count: range.len(),
                rigid_body,
            }
        }
        Command::ConnectRigidBodies {
            body_a,
            body_b,
            positions,
            mass,
            friction,
        } => {
            let range = sim.connect_bodies(body_a, body_b, &positions, mass, friction)?;
            Response::Joint {
                first_index: range.start,
                count: range.len(),
            }
        }
        Command::SetRigidBodyTransform {
            body,
            mode,
            transform,
        } => {
            sim.set_body_transform(body, mode, transform)?;
            Response::Done
        }
        Command::SetTimeMultiplier(scale) => {
            sim.set_time_multiplier(scale)?;
            Response::Done
        }
        Command::SetSolverParameters {
            stabilization_iterations,
            solver_iterations,
            substeps,
        } => {
            sim.set_solver_params(stabilization_iterations, solver_iterations, substeps)?;
            Response::Done
        }
        Command::AddExternalForce(force) => {
            sim.add_force(force)?;
            Response::Done
        }
        Command::AddStaticCollider(collider) => {
            sim.add_collider(collider)?;
            Response::Done
        }
        Command::GetWorldProperties => Response::WorldProperties(sim.world_properties()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        capacity::MAX_EXTERNAL_FORCES,
        config::Config,
        device::ComputeContext,
        error::Resource,
    };

    fn sim() -> Simulation {
        let cfg = Config {
            log_ratio: 0,
            ..Default::default()
        };
        Simulation::new(ComputeContext::new(Some(1)).unwrap(), cfg).unwrap()
    }

    fn line(n: usize, x: f32) -> Vec<Vec3> {
        (0..n).map(|i| Vec3::new(x, i as f32 * 0.1, 0.)).collect()
    }

    #[test]
    fn particles_and_joint() {
        let mut sim = sim();

        let a = apply(
            &mut sim,
            Command::AddParticles {
                positions: line(3, 0.),
                kind: SpeckKind::RigidBody,
                friction: 0.5,
                mass: 1.,
            },
        )
        .unwrap();
        assert_eq!(
            a,
            Response::Particles {
                first_index: 0,
                count: 3,
                rigid_body: Some(0)
            }
        );

        let b = apply(
            &mut sim,
            Command::AddParticles {
                positions: line(2, 1.),
                kind: SpeckKind::RigidBody,
                friction: 0.5,
                mass: 1.,
            },
        )
        .unwrap();
        assert!(matches!(b, Response::Particles { rigid_body: Some(1), .. }));

        let joint = apply(
            &mut sim,
            Command::ConnectRigidBodies {
                body_a: 0,
                body_b: 1,
                positions: vec![Vec3::new(0.5, 0., 0.)],
                mass: 1.,
                friction: 0.5,
            },
        )
        .unwrap();
        assert_eq!(
            joint,
            Response::Joint {
                first_index: 5,
                count: 1
            }
        );
        assert!(sim.speck(5).unwrap().is_joint());
    }

    #[test]
    fn failed_joint_adds_nothing() {
        let mut sim = sim();
        apply(
            &mut sim,
            Command::AddParticles {
                positions: line(2, 0.),
                kind: SpeckKind::RigidBody,
                friction: 0.,
                mass: 1.,
            },
        )
        .unwrap();

        let result = apply(
            &mut sim,
            Command::ConnectRigidBodies {
                body_a: 0,
                body_b: 7,
                positions: vec![Vec3::new_zero()],
                mass: 1.,
                friction: 0.,
            },
        );
        assert!(matches!(result, Err(SimError::InvalidIndex { index: 7, .. })));
        assert_eq!(sim.speck_count(), 2);
    }

    #[test]
    fn force_capacity() {
        let mut sim = sim();
        for _ in 0..MAX_EXTERNAL_FORCES {
            apply(&mut sim, Command::AddExternalForce(ExternalForce::gravity(1.))).unwrap();
        }
        let result = apply(&mut sim, Command::AddExternalForce(ExternalForce::gravity(1.)));
        assert!(matches!(
            result,
            Err(SimError::CapacityExceeded {
                resource: Resource::ExternalForces,
                ..
            })
        ));
    }

    #[test]
    fn solver_parameters_partial_update() {
        let mut sim = sim();
        let before = sim.config().clone();

        let r = apply(
            &mut sim,
            Command::SetSolverParameters {
                stabilization_iterations: None,
                solver_iterations: Some(9),
                substeps: None,
            },
        )
        .unwrap();
        assert_eq!(r, Response::Done);
        assert_eq!(sim.config().solver_iterations, 9);
        assert_eq!(sim.config().substeps, before.substeps);
        assert_eq!(
            sim.config().stabilization_iterations,
            before.stabilization_iterations
        );

        assert!(apply(
            &mut sim,
            Command::SetSolverParameters {
                stabilization_iterations: None,
                solver_iterations: None,
                substeps: Some(0),
            },
        )
        .is_err());
        assert_eq!(sim.config().substeps, before.substeps);
    }

    #[test]
    fn world_properties() {
        let mut sim = sim();
        let r = apply(&mut sim, Command::GetWorldProperties).unwrap();
        assert_eq!(
            r,
            Response::WorldProperties(WorldProperties {
                particle_radius: Config::default().particle_radius
            })
        );
    }
}
