//! Error types reported by the command surface and the tick loop.

use std::{fmt, io};

/// Which fixed-capacity resource a request would have overrun.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resource {
    Specks,
    RigidBodies,
    RigidBodyLinks,
    ExternalForces,
    StaticColliders,
    /// Rigid bodies a single (joint) speck may belong to.
    BodiesPerSpeck,
}

impl Resource {
    pub fn to_str(&self) -> &'static str {
        match self {
            Self::Specks => "specks",
            Self::RigidBodies => "rigid bodies",
            Self::RigidBodyLinks => "rigid body links",
            Self::ExternalForces => "external forces",
            Self::StaticColliders => "static colliders",
            Self::BodiesPerSpeck => "bodies per speck",
        }
    }
}

#[derive(Debug)]
pub enum SimError {
    /// The request would exceed a fixed capacity. Nothing was modified.
    CapacityExceeded {
        resource: Resource,
        requested: usize,
        max: usize,
    },
    /// A speck or rigid body index that doesn't exist.
    InvalidIndex { kind: &'static str, index: usize },
    /// Rejected argument, e.g. a negative mass or zero substeps.
    InvalidParameter(String),
    /// A dispatch failed. This is fatal for the simulation; it won't tick again.
    Device(String),
    Io(io::Error),
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CapacityExceeded {
                resource,
                requested,
                max,
            } => write!(
                f,
                "Capacity exceeded for {}: requested {requested}, max {max}",
                resource.to_str()
            ),
            Self::InvalidIndex { kind, index } => write!(f, "Invalid {kind} index: {index}"),
            Self::InvalidParameter(msg) => write!(f, "Invalid parameter: {msg}"),
            Self::Device(msg) => write!(f, "Device failure: {msg}"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for SimError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SimError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Checks that adding `adding` items to `current` stays within `max`.
pub(crate) fn check_capacity(
    resource: Resource,
    current: usize,
    adding: usize,
    max: usize,
) -> Result<(), SimError> {
    let requested = current.saturating_add(adding);
    if requested > max {
        return Err(SimError::CapacityExceeded {
            resource,
            requested,
            max,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_check_bounds() {
        assert!(check_capacity(Resource::Specks, 10, 5, 15).is_ok());

        match check_capacity(Resource::Specks, 10, 6, 15) {
            Err(SimError::CapacityExceeded { requested, max, .. }) => {
                assert_eq!(requested, 16);
                assert_eq!(max, 15);
            }
            other => panic!("Expected a capacity error; got {other:?}"),
        }
    }

    #[test]
    fn display_names_resource() {
        let e = SimError::CapacityExceeded {
            resource: Resource::StaticColliders,
            requested: 17,
            max: 16,
        };
        assert!(e.to_string().contains("static colliders"));
    }
}
