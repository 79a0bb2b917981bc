//! Object placement by dropping it into the enclosure.
//!
//! A pose goes through three typed states. [`Airborne`] is the random starting pose above the
//! floor, [`Settling`] holds the body while the physics world is stepped, and [`Rested`] carries the
//! final pose with the transform baked into the object's vertices.

use cgmath::prelude::*;
use cgmath::{Matrix3, Point3, Quaternion, Rad};

use crate::config::Config;
use crate::mesh::NormalizedObject;
use crate::physics::{
    hull_points, BodyHandle, BodyKind, CollisionShape, PhysicsMaterial, PhysicsWorld, RigidBody,
    RigidTransform,
};
use crate::seed::DeterministicRng;

/// Fraction of the half extent the object may be offset horizontally at the start.
const HORIZONTAL_OFFSET_FRACTION: f64 = 0.2;
/// Starting height as a fraction of the free space above the center.
const DROP_HEIGHT_FRACTION: f64 = 0.9;

/// Position and XYZ Euler orientation in radians. The rotation is applied about the world X axis
/// first, then Y, then Z.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: Point3<f64>,
    pub rotation: [f64; 3],
}

impl Pose {
    pub fn quaternion(&self) -> Quaternion<f64> {
        let [x, y, z] = self.rotation;
        Quaternion::from_angle_z(Rad(z)) * Quaternion::from_angle_y(Rad(y)) * Quaternion::from_angle_x(Rad(x))
    }

    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::from(self.quaternion())
    }

    pub fn transform(&self) -> RigidTransform {
        RigidTransform::new(self.position, self.quaternion())
    }

    /// Recover position and Euler angles from a rigid transform.
    pub fn from_transform(transform: &RigidTransform) -> Self {
        let m = Matrix3::from(transform.rotation);
        let sy = (-m.x.z).max(-1.0).min(1.0);
        let y = sy.asin();
        let (x, z) = if sy.abs() < 1.0 - 1e-9 {
            (m.y.z.atan2(m.z.z), m.x.y.atan2(m.x.x))
        } else {
            // gimbal lock, put everything into x
            ((-m.z.y).atan2(m.y.y), 0.0)
        };
        Pose {
            position: transform.position,
            rotation: [x, y, z],
        }
    }
}

impl std::fmt::Display for Pose {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "location ({:.4}, {:.4}, {:.4}) rotation ({:.4}, {:.4}, {:.4})",
            self.position.x,
            self.position.y,
            self.position.z,
            self.rotation[0],
            self.rotation[1],
            self.rotation[2]
        )
    }
}

/// Object above the floor, not yet simulated.
#[derive(Debug, Clone)]
pub struct Airborne {
    pub object: NormalizedObject,
    pub pose: Pose,
}

/// Object attached to a physics world that has been stepped.
#[derive(Debug, Clone)]
pub struct Settling {
    object: NormalizedObject,
    initial: Pose,
    body: Option<BodyHandle>,
}

/// Final placement. `object.mesh` is in world coordinates.
#[derive(Debug, Clone)]
pub struct Rested {
    pub object: NormalizedObject,
    pub initial: Pose,
    pub pose: Pose,
}

#[derive(Debug, Clone)]
pub struct PoseSynthesizer {
    pub half_extent: f64,
    /// Largest dimension an object can be scaled to.
    pub max_dimension: f64,
    /// Clearance kept below the ceiling.
    pub ceiling_margin: f64,
    pub settle_frames: usize,
    pub hull_directions: usize,
    pub mass: f64,
    pub material: PhysicsMaterial,
}

impl PoseSynthesizer {
    pub fn from_config(config: &Config) -> Self {
        let physics = &config.physics;
        PoseSynthesizer {
            half_extent: config.half_extent(),
            max_dimension: config.object_dimension_range().1,
            ceiling_margin: config.enclosure.collision_margin,
            settle_frames: physics.settle_frames,
            hull_directions: physics.hull_directions,
            mass: physics.mass,
            material: PhysicsMaterial {
                friction: physics.friction,
                restitution: physics.restitution,
                linear_damping: physics.linear_damping,
                angular_damping: physics.angular_damping,
                margin: 0.0,
            },
        }
    }

    /// Random starting pose. `rng` should be the pose stream of the variation seed.
    pub fn airborne(&self, object: NormalizedObject, rng: &mut DeterministicRng) -> Airborne {
        let tau = 2.0 * std::f64::consts::PI;
        let rotation = [
            rng.uniform((0.0, tau)),
            rng.uniform((0.0, tau)),
            rng.uniform((0.0, tau)),
        ];
        let max_offset = self.half_extent * HORIZONTAL_OFFSET_FRACTION;
        let x = rng.uniform((-max_offset, max_offset));
        let y = rng.uniform((-max_offset, max_offset));
        let mut z = (self.half_extent - self.max_dimension / 2.0) * DROP_HEIGHT_FRACTION;

        let mut pose = Pose {
            position: Point3::new(x, y, z),
            rotation,
        };
        let q = pose.quaternion();
        let top = object
            .mesh
            .positions
            .iter()
            .map(|p| (q * p.to_vec()).z)
            .fold(std::f64::NEG_INFINITY, f64::max);
        let ceiling = self.half_extent - self.ceiling_margin;
        if top.is_finite() && z + top > ceiling {
            z = ceiling - top;
            log::debug!("lowering drop height to {:.4} to clear the ceiling", z);
            pose.position.z = z;
        }
        Airborne { object, pose }
    }

    /// Attach the object to `world` and step it. If the object cannot be simulated it keeps its
    /// airborne pose.
    pub fn settle<W: PhysicsWorld>(&self, airborne: Airborne, world: &mut W) -> Settling {
        let Airborne { object, pose } = airborne;
        let hull = hull_points(&object.mesh.positions, self.hull_directions);
        let body = world.attach(
            RigidBody {
                kind: BodyKind::Active { mass: self.mass },
                transform: pose.transform(),
            },
            CollisionShape::ConvexHull(hull),
            self.material,
        );
        let body = match body {
            Ok(handle) => {
                world.step(self.settle_frames);
                Some(handle)
            }
            Err(e) => {
                log::warn!("cannot simulate object, keeping the airborne pose: {}", e);
                None
            }
        };
        Settling {
            object,
            initial: pose,
            body,
        }
    }

    /// Read the settled transform, detach the body and bake the transform into the mesh.
    pub fn rest<W: PhysicsWorld>(&self, settling: Settling, world: &mut W) -> Rested {
        let Settling {
            mut object,
            initial,
            body,
        } = settling;
        let (transform, pose) = match body.and_then(|b| world.detach(b)) {
            Some(transform) => (transform, Pose::from_transform(&transform)),
            None => (initial.transform(), initial),
        };
        object
            .mesh
            .transform(&Matrix3::from(transform.rotation), transform.position.to_vec());
        Rested {
            object,
            initial,
            pose,
        }
    }

    /// Run all three states.
    pub fn synthesize<W: PhysicsWorld>(
        &self,
        object: NormalizedObject,
        rng: &mut DeterministicRng,
        world: &mut W,
    ) -> Rested {
        let airborne = self.airborne(object, rng);
        let settling = self.settle(airborne, world);
        self.rest(settling, world)
    }
}

#[cfg(test)]
fn test_object(size: f64) -> NormalizedObject {
    let mesh = crate::mesh::Mesh::cube(size);
    NormalizedObject {
        mesh,
        scale: 1.0,
        dimensions: cgmath::Vector3::new(size, size, size),
    }
}

#[cfg(test)]
fn test_world(config: &Config) -> crate::physics::ImpulseWorld {
    use crate::physics::{ImpulseWorld, WorldSettings};
    let mut world = ImpulseWorld::new(WorldSettings::from_config(&config.physics));
    let mut shell = crate::mesh::Mesh::cube(config.enclosure.size);
    shell.flip_normals();
    world
        .attach(
            RigidBody {
                kind: BodyKind::Passive,
                transform: RigidTransform::identity(),
            },
            CollisionShape::Mesh(shell),
            PhysicsMaterial {
                friction: config.enclosure.friction,
                restitution: config.enclosure.restitution,
                margin: config.enclosure.collision_margin,
                ..Default::default()
            },
        )
        .unwrap();
    world
}

#[test]
fn test_airborne_pose_seed_103() {
    let config = Config::default();
    let synthesizer = PoseSynthesizer::from_config(&config);
    let mut rng = crate::seed::VariationSeed::from_raw(103).pose_rng();
    let airborne = synthesizer.airborne(test_object(0.05), &mut rng);
    let pose = airborne.pose;
    let expected = [3.816569772197308, 2.1549847203096504, 2.1568396957849694];
    for (a, b) in pose.rotation.iter().zip(expected.iter()) {
        assert!((a - b).abs() < 1e-9, "{} != {}", a, b);
    }
    assert!((pose.position.x - 0.05430717623624298).abs() < 1e-9);
    assert!((pose.position.y - -0.041414373827833265).abs() < 1e-9);
    assert!((pose.position.z - 0.0945).abs() < 1e-9);
}

#[test]
fn test_airborne_offsets_bounded() {
    let config = Config::default();
    let synthesizer = PoseSynthesizer::from_config(&config);
    for seed in 0..50 {
        let mut rng = crate::seed::VariationSeed::from_raw(seed).pose_rng();
        let pose = synthesizer.airborne(test_object(0.2), &mut rng).pose;
        assert!(pose.position.x.abs() <= 0.07 && pose.position.y.abs() <= 0.07);
        assert!(pose.rotation.iter().all(|r| *r >= 0.0 && *r < 2.0 * std::f64::consts::PI));
    }
}

#[test]
fn test_large_object_lowered_below_ceiling() {
    let config = Config::default();
    let synthesizer = PoseSynthesizer::from_config(&config);
    let mut rng = crate::seed::VariationSeed::from_raw(5).pose_rng();
    let airborne = synthesizer.airborne(test_object(0.45), &mut rng);
    let q = airborne.pose.quaternion();
    for p in airborne.object.mesh.positions.iter() {
        let z = airborne.pose.position.z + (q * p.to_vec()).z;
        assert!(z <= 0.35 - 0.002 + 1e-12);
    }
}

#[test]
fn test_euler_round_trip() {
    let pose = Pose {
        position: Point3::new(0.1, 0.2, 0.3),
        rotation: [0.3, -0.4, 1.2],
    };
    let back = Pose::from_transform(&pose.transform());
    for (a, b) in pose.rotation.iter().zip(back.rotation.iter()) {
        assert!((a - b).abs() < 1e-9);
    }
}

#[test]
fn test_rested_pose_deterministic() {
    let config = Config::default();
    let synthesizer = PoseSynthesizer::from_config(&config);
    let run = || {
        let mut world = test_world(&config);
        let mut rng = crate::seed::VariationSeed::from_raw(103).pose_rng();
        synthesizer.synthesize(test_object(0.2), &mut rng, &mut world)
    };
    let a = run();
    let b = run();
    assert_eq!(a.pose, b.pose);
    assert_eq!(a.object.mesh.positions, b.object.mesh.positions);
    // the drop ends lower than it starts, resting inside the box
    assert!(a.pose.position.z < a.initial.position.z);
    for p in a.object.mesh.positions.iter() {
        assert!(p.z > -0.35 - 0.01);
    }
}

#[test]
fn test_unsimulated_object_keeps_airborne_pose() {
    let config = Config::default();
    let synthesizer = PoseSynthesizer::from_config(&config);
    let mut world = test_world(&config);
    let mut flat = test_object(0.2);
    for p in flat.mesh.positions.iter_mut() {
        p.z = 0.0;
    }
    let mut rng = crate::seed::VariationSeed::from_raw(1).pose_rng();
    let rested = synthesizer.synthesize(flat, &mut rng, &mut world);
    assert_eq!(rested.pose, rested.initial);
    assert_eq!(world.num_bodies(), 1);
}
