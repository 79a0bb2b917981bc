//! The closed box objects are dropped into.

use crate::config::EnclosureConfig;
use crate::mesh::Mesh;
use crate::physics::{
    BodyHandle, BodyKind, CollisionShape, PhysicsError, PhysicsMaterial, PhysicsWorld, RigidBody,
    RigidTransform,
};
use crate::seed::DeterministicRng;

/// Surface appearance of the enclosure walls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceMaterial {
    /// Hue, saturation and value, each in `[0, 1]`.
    pub hsv: [f64; 3],
    /// Linear RGB, each in `[0, 1]`.
    pub base_color: [f64; 3],
    pub roughness: f64,
    pub specular: f64,
    pub metallic: f64,
}

impl SurfaceMaterial {
    /// Start from white and offset it by random amounts. Hue wraps around, saturation and value
    /// are clamped.
    pub fn randomize(config: &EnclosureConfig, rng: &mut DeterministicRng) -> Self {
        let mut h = rng.uniform(config.hue_variation).rem_euclid(1.0);
        if h >= 1.0 {
            h = 0.0;
        }
        let s = rng.uniform(config.saturation_variation).max(0.0).min(1.0);
        let v = (1.0 + rng.uniform(config.value_variation)).max(0.0).min(1.0);
        let roughness = rng.uniform(config.roughness_range);
        let specular = rng.uniform(config.specular_range);
        let metallic = rng.uniform(config.metallic_range);
        SurfaceMaterial {
            hsv: [h, s, v],
            base_color: hsv_to_rgb(h, s, v),
            roughness,
            specular,
            metallic,
        }
    }
}

/// Convert HSV (all components in `[0, 1]`) to RGB.
pub fn hsv_to_rgb(h: f64, s: f64, v: f64) -> [f64; 3] {
    if s <= 0.0 {
        return [v, v, v];
    }
    let h6 = h.rem_euclid(1.0) * 6.0;
    let sector = h6.floor();
    let f = h6 - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));
    match sector as u32 % 6 {
        0 => [v, t, p],
        1 => [q, v, p],
        2 => [p, v, t],
        3 => [p, q, v],
        4 => [t, p, v],
        _ => [v, p, q],
    }
}

/// A cube centered at the origin with walls at `±size / 2` whose faces point inwards.
#[derive(Debug, Clone)]
pub struct Enclosure {
    pub size: f64,
    pub mesh: Mesh,
    pub material: SurfaceMaterial,
    physics: PhysicsMaterial,
    collider: Option<BodyHandle>,
}

impl Enclosure {
    pub fn build(config: &EnclosureConfig, rng: &mut DeterministicRng) -> Self {
        let mut mesh = Mesh::cube(config.size);
        mesh.flip_normals();
        let material = SurfaceMaterial::randomize(config, rng);
        log::debug!(
            "enclosure color hsv ({:.3}, {:.3}, {:.3})",
            material.hsv[0],
            material.hsv[1],
            material.hsv[2]
        );
        Enclosure {
            size: config.size,
            mesh,
            material,
            physics: PhysicsMaterial {
                friction: config.friction,
                restitution: config.restitution,
                margin: config.collision_margin,
                ..Default::default()
            },
            collider: None,
        }
    }

    pub fn half_extent(&self) -> f64 {
        self.size / 2.0
    }

    /// Register the walls as a passive body.
    pub fn attach<W: PhysicsWorld>(&mut self, world: &mut W) -> Result<(), PhysicsError> {
        if self.collider.is_some() {
            return Ok(());
        }
        let handle = world.attach(
            RigidBody {
                kind: BodyKind::Passive,
                transform: RigidTransform::identity(),
            },
            CollisionShape::Mesh(self.mesh.clone()),
            self.physics,
        )?;
        self.collider = Some(handle);
        Ok(())
    }

    /// Remove the walls from the physics world.
    pub fn detach<W: PhysicsWorld>(&mut self, world: &mut W) {
        if let Some(handle) = self.collider.take() {
            world.detach(handle);
        }
    }

    pub fn collider(&self) -> Option<BodyHandle> {
        self.collider
    }
}

#[test]
fn test_hsv_to_rgb() {
    assert_eq!(hsv_to_rgb(0.0, 0.0, 1.0), [1.0, 1.0, 1.0]);
    assert_eq!(hsv_to_rgb(0.0, 1.0, 1.0), [1.0, 0.0, 0.0]);
    let green = hsv_to_rgb(1.0 / 3.0, 1.0, 0.5);
    assert!(green[0].abs() < 1e-12 && (green[1] - 0.5).abs() < 1e-12 && green[2].abs() < 1e-12);
    let wrapped = hsv_to_rgb(1.0, 1.0, 1.0);
    assert_eq!(wrapped, [1.0, 0.0, 0.0]);
}

#[test]
fn test_enclosure_normals_point_inwards() {
    use cgmath::{EuclideanSpace, InnerSpace};
    let mut rng = DeterministicRng::new(3);
    let enclosure = Enclosure::build(&EnclosureConfig::default(), &mut rng);
    assert_eq!(enclosure.mesh.num_triangles(), 12);
    for (i, (a, b, c)) in enclosure.mesh.iter_triangles().enumerate() {
        let centroid = (a.to_vec() + b.to_vec() + c.to_vec()) / 3.0;
        assert!(enclosure.mesh.face_normal(i).dot(centroid) < 0.0);
    }
    let bounds = enclosure.mesh.bounds().unwrap();
    assert_eq!(bounds.max.x, 0.35);
    assert_eq!(bounds.min.z, -0.35);
}

#[test]
fn test_material_in_range() {
    let config = EnclosureConfig::default();
    for seed in 0..200 {
        let mut rng = DeterministicRng::new(seed);
        let m = SurfaceMaterial::randomize(&config, &mut rng);
        assert!(m.hsv.iter().all(|c| *c >= 0.0 && *c <= 1.0));
        assert!(m.hsv[0] < 1.0);
        assert!(m.base_color.iter().all(|c| *c >= 0.0 && *c <= 1.0));
        assert!(m.roughness >= 0.5 && m.roughness < 0.95);
        assert!(m.metallic >= 0.0 && m.metallic < 0.4);
    }
}

#[test]
fn test_collider_attached_once() {
    use crate::physics::{ImpulseWorld, WorldSettings};
    let mut world = ImpulseWorld::new(WorldSettings::from_config(&Default::default()));
    let mut rng = DeterministicRng::new(3);
    let mut enclosure = Enclosure::build(&EnclosureConfig::default(), &mut rng);
    enclosure.attach(&mut world).unwrap();
    enclosure.attach(&mut world).unwrap();
    assert_eq!(world.num_bodies(), 1);
    enclosure.detach(&mut world);
    assert_eq!(world.num_bodies(), 0);
    assert!(enclosure.collider().is_none());
}
