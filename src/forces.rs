//! External forces acting on every speck, and static colliders.

use lin_alg::f32::Vec3;

use crate::math::Transform;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ForceKind {
    /// Applied as-is, regardless of mass. E.g. gravity.
    Acceleration,
    /// Divided by the speck's mass.
    Force,
}

#[derive(Clone, Copy, Debug)]
pub struct ExternalForce {
    pub vector: Vec3,
    pub kind: ForceKind,
}

impl ExternalForce {
    pub fn gravity(g: f32) -> Self {
        Self {
            vector: Vec3::new(0., -g, 0.),
            kind: ForceKind::Acceleration,
        }
    }

    /// Immovable specks (`mass_inv` = 0) aren't accelerated by either kind.
    pub fn accel(&self, mass_inv: f32) -> Vec3 {
        if mass_inv == 0. {
            return Vec3::new_zero();
        }
        match self.kind {
            ForceKind::Acceleration => self.vector,
            ForceKind::Force => self.vector * mass_inv,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub enum ColliderShape {
    /// Infinite plane through the transform's origin, with normal along local +Y.
    Plane,
    Box { half_extents: Vec3 },
}

#[derive(Clone, Copy, Debug)]
pub struct StaticCollider {
    pub transform: Transform,
    pub shape: ColliderShape,
}

/// A contact with static geometry, linearised at generation time. Satisfied when
/// `normal · x >= offset`.
#[derive(Clone, Copy, Debug)]
pub struct HalfSpace {
    pub normal: Vec3,
    pub offset: f32,
}

impl HalfSpace {
    /// Negative when violated.
    pub fn eval(&self, posit: Vec3) -> f32 {
        self.normal.dot(posit) - self.offset
    }
}

impl StaticCollider {
    pub fn plane(transform: Transform) -> Self {
        Self {
            transform,
            shape: ColliderShape::Plane,
        }
    }

    /// A contact if a speck of `radius` at `posit` is within `radius × (1 + margin)` of the
    /// surface, or inside.
    pub fn contact(&self, posit: Vec3, radius: f32, margin: f32) -> Option<HalfSpace> {
        let reach = radius * (1. + margin);

        match self.shape {
            ColliderShape::Plane => {
                let normal = self.transform.rotate(Vec3::new(0., 1., 0.));
                let dist = normal.dot(posit - self.transform.translation);
                if dist >= reach {
                    return None;
                }
                Some(HalfSpace {
                    normal,
                    offset: normal.dot(self.transform.translation) + radius,
                })
            }
            ColliderShape::Box { half_extents: h } => {
                let local = self.transform.apply_inverse(posit);
                let clamped = Vec3::new(
                    local.x.clamp(-h.x, h.x),
                    local.y.clamp(-h.y, h.y),
                    local.z.clamp(-h.z, h.z),
                );
                let diff = local - clamped;
                let dist = diff.magnitude();

                let (normal_local, surface_local) = if dist > 0. {
                    if dist >= reach {
                        return None;
                    }
                    (diff / dist, clamped)
                } else {
                    // Inside: push out through the nearest face.
                    let depths = [h.x - local.x.abs(), h.y - local.y.abs(), h.z - local.z.abs()];
                    let mut axis = 0;
                    for i in 1..3 {
                        if depths[i] < depths[axis] {
                            axis = i;
                        }
                    }
                    let comps = [local.x, local.y, local.z];
                    let sign = if comps[axis] < 0. { -1. } else { 1. };

                    let mut n = [0.; 3];
                    n[axis] = sign;
                    let mut s = comps;
                    s[axis] = sign * [h.x, h.y, h.z][axis];
                    (Vec3::new(n[0], n[1], n[2]), Vec3::new(s[0], s[1], s[2]))
                };

                let normal = self.transform.rotate(normal_local);
                let surface = self.transform.apply(surface_local);
                Some(HalfSpace {
                    normal,
                    offset: normal.dot(surface) + radius,
                })
            }
        }
    }
}
