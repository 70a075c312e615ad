//! Headless demo: a floor, gravity, a rigid cube, two jointed bars, and a block of fluid.

use std::{path::Path, time::Instant};

use lin_alg::f32::Vec3;
use specks::{
    apply,
    config::SAVE_FILE,
    forces::{ExternalForce, StaticCollider},
    math::Transform,
    Command, ComputeContext, Config, Response, SimError, Simulation, SpeckKind,
};

const NUM_FRAMES: usize = 1_800;
const FRAME_DT: f32 = 1. / 60.;

/// Specks on a grid, `counts` per axis, one diameter apart.
fn grid(origin: Vec3, counts: (usize, usize, usize), spacing: f32) -> Vec<Vec3> {
    let mut result = Vec::with_capacity(counts.0 * counts.1 * counts.2);
    for i in 0..counts.0 {
        for j in 0..counts.1 {
            for k in 0..counts.2 {
                result.push(
                    origin + Vec3::new(i as f32 * spacing, j as f32 * spacing, k as f32 * spacing),
                );
            }
        }
    }
    result
}

fn rigid_body(sim: &mut Simulation, positions: Vec<Vec3>) -> Result<usize, SimError> {
    match apply(
        sim,
        Command::AddParticles {
            positions,
            kind: SpeckKind::RigidBody,
            friction: 0.6,
            mass: 1.,
        },
    )? {
        Response::Particles {
            rigid_body: Some(body),
            ..
        } => Ok(body as usize),
        other => Err(SimError::InvalidParameter(format!(
            "Unexpected response: {other:?}"
        ))),
    }
}

fn build_scene(sim: &mut Simulation) -> Result<(), SimError> {
    let r = sim.world_properties().particle_radius;
    let d = 2. * r;

    apply(sim, Command::AddExternalForce(ExternalForce::gravity(9.81)))?;
    apply(
        sim,
        Command::AddStaticCollider(StaticCollider::plane(Transform::new_identity())),
    )?;

    rigid_body(sim, grid(Vec3::new(-1., 2., 0.), (6, 6, 6), d))?;

    // Two bars, joined end to end.
    let bar_a = rigid_body(sim, grid(Vec3::new(1., 1., 0.), (8, 1, 1), d))?;
    let bar_b = rigid_body(sim, grid(Vec3::new(1. + 9. * d, 1., 0.), (8, 1, 1), d))?;
    apply(
        sim,
        Command::ConnectRigidBodies {
            body_a: bar_a,
            body_b: bar_b,
            positions: vec![Vec3::new(1. + 8. * d, 1., 0.)],
            mass: 1.,
            friction: 0.6,
        },
    )?;

    apply(
        sim,
        Command::AddParticles {
            positions: grid(Vec3::new(-2., 0.5, -2.), (12, 8, 12), d),
            kind: SpeckKind::Fluid {
                cohesion: 0.3,
                viscosity: 0.1,
            },
            friction: 0.1,
            mass: 0.5,
        },
    )?;

    Ok(())
}

fn main() {
    let path = Path::new(SAVE_FILE);
    let config = match Config::load(path) {
        Ok(cfg) => {
            println!("Config loaded from {SAVE_FILE}");
            cfg
        }
        Err(e) => {
            println!("Using the default config ({e})");
            let cfg = Config::default();
            if let Err(e) = cfg.save(path) {
                eprintln!("Error saving config: {e}");
            }
            cfg
        }
    };

    let ctx = match ComputeContext::new(None) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            return;
        }
    };
    println!("Running on {} threads.", ctx.thread_count());

    let mut sim = match Simulation::new(ctx, config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {e}");
            return;
        }
    };

    println!("Building...");
    if let Err(e) = build_scene(&mut sim) {
        eprintln!("Error building the scene: {e}");
        return;
    }
    println!("Specks: {} Bodies: {}", sim.speck_count(), sim.bodies().len());

    let start = Instant::now();
    for _ in 0..NUM_FRAMES {
        if let Err(e) = sim.tick(FRAME_DT) {
            eprintln!("Error: {e}");
            return;
        }
    }

    for (i, t) in sim.body_transforms().iter().enumerate() {
        println!("Body {i}: {:.3?}", t.translation);
    }
    println!(
        "Simulated {:.2}s in {}ms.",
        sim.time(),
        start.elapsed().as_millis()
    );
}
