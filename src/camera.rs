//! Randomized multi-view camera rigs.

use cgmath::prelude::*;
use cgmath::{Matrix3, Point3, Vector3};

use crate::config::CameraConfig;
use crate::seed::DeterministicRng;

/// Pinhole camera. Looks down its local -Z axis with +Y up.
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    pub name: String,
    pub position: Point3<f64>,
    pub target: Point3<f64>,
    /// Camera to world rotation. Columns are the camera X, Y and Z axes in world coordinates.
    pub rotation: Matrix3<f64>,
    /// Focal length in millimeters.
    pub focal_mm: f64,
    pub sensor_width: f64,
    pub sensor_height: f64,
}

/// Rotation whose -Z axis points from `position` to `target`, with +Y as close to world +Z as
/// possible.
pub fn look_at(position: Point3<f64>, target: Point3<f64>) -> Matrix3<f64> {
    let back = position - target;
    let z = if back.magnitude2() > 0.0 {
        back.normalize()
    } else {
        Vector3::unit_z()
    };
    let mut x = Vector3::unit_z().cross(z);
    if x.magnitude2() < 1e-12 {
        // looking straight up or down
        x = Vector3::unit_y().cross(z);
    }
    let x = x.normalize();
    let y = z.cross(x);
    Matrix3::from_cols(x, y, z)
}

impl Camera {
    /// Direction the camera looks in.
    pub fn forward(&self) -> Vector3<f64> {
        -self.rotation.z
    }

    /// World point in camera coordinates.
    pub fn to_camera(&self, p: Point3<f64>) -> Vector3<f64> {
        self.rotation.transpose() * (p - self.position)
    }

    /// Pixels per millimeter on the sensor. The sensor width is fit to the larger image side.
    pub fn pixels_per_mm(&self, width: u32, height: u32) -> f64 {
        width.max(height) as f64 / self.sensor_width
    }

    /// Project a point in camera coordinates to pixel coordinates. Returns `None` for points
    /// behind the camera.
    pub fn project_camera(&self, v: Vector3<f64>, width: u32, height: u32) -> Option<(f64, f64)> {
        if v.z >= 0.0 {
            return None;
        }
        let scale = self.pixels_per_mm(width, height) * self.focal_mm / -v.z;
        Some((
            width as f64 / 2.0 + v.x * scale,
            height as f64 / 2.0 - v.y * scale,
        ))
    }

    pub fn project(&self, p: Point3<f64>, width: u32, height: u32) -> Option<(f64, f64)> {
        self.project_camera(self.to_camera(p), width, height)
    }
}

/// Named cameras, in the configured view order.
#[derive(Debug, Clone, Default)]
pub struct CameraRig {
    pub cameras: Vec<Camera>,
}

impl CameraRig {
    /// Place one camera per configured view in an enclosure of side `size`.
    ///
    /// For every camera the focal length, then three position jitters, then three look-at
    /// offsets are drawn from `rng`.
    pub fn generate(config: &CameraConfig, size: f64, rng: &mut DeterministicRng) -> Self {
        let half = size / 2.0;
        let look_at_base = Point3::from(config.look_at) * size;
        let cameras = config
            .views
            .iter()
            .map(|view| {
                let focal_mm = rng.uniform(config.focal_range);
                let base = Vector3::from(view.direction) * (half * config.distance_factor);
                let jitter = Vector3::new(
                    rng.uniform(config.position_jitter),
                    rng.uniform(config.position_jitter),
                    rng.uniform(config.position_jitter),
                );
                let offset = Vector3::new(
                    rng.uniform(config.look_at_offset),
                    rng.uniform(config.look_at_offset),
                    rng.uniform(config.look_at_offset),
                );
                let p = base + jitter;
                let position = Point3::new(
                    p.x.max(-half).min(half),
                    p.y.max(-half).min(half),
                    p.z.max(-half).min(half),
                );
                let target = look_at_base + offset;
                log::debug!(
                    "camera {} at ({:.3}, {:.3}, {:.3}) focal {:.2} mm",
                    view.name,
                    position.x,
                    position.y,
                    position.z,
                    focal_mm
                );
                Camera {
                    name: view.name.clone(),
                    position,
                    target,
                    rotation: look_at(position, target),
                    focal_mm,
                    sensor_width: config.sensor_width,
                    sensor_height: config.sensor_height,
                }
            })
            .collect();
        CameraRig { cameras }
    }

    pub fn get(&self, name: &str) -> Option<&Camera> {
        self.cameras.iter().find(|c| c.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Camera> {
        self.cameras.iter()
    }

    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }
}

#[test]
fn test_cameras_inside_enclosure() {
    let mut config = CameraConfig::default();
    config.position_jitter = (-0.3, 0.3);
    config.distance_factor = 1.2;
    for seed in 0..20 {
        let mut rng = DeterministicRng::new(seed);
        let rig = CameraRig::generate(&config, 0.7, &mut rng);
        assert_eq!(rig.len(), 5);
        for camera in rig.iter() {
            let p = camera.position;
            assert!(p.x.abs() <= 0.35 && p.y.abs() <= 0.35 && p.z.abs() <= 0.35);
            assert!(camera.focal_mm >= 4.0 && camera.focal_mm < 10.0);
        }
    }
}

#[test]
fn test_cameras_look_at_target() {
    let mut rng = DeterministicRng::new(11);
    let rig = CameraRig::generate(&CameraConfig::default(), 0.7, &mut rng);
    for camera in rig.iter() {
        let to_target = (camera.target - camera.position).normalize();
        assert!(camera.forward().dot(to_target) > 1.0 - 1e-9);
        let (x, y) = camera.project(camera.target, 512, 512).unwrap();
        assert!((x - 256.0).abs() < 1e-6 && (y - 256.0).abs() < 1e-6);
        // offsets are small enough that the target stays near the default look-at point
        assert!((camera.target.z - -0.7 / 3.0).abs() <= 0.05);
    }
    let front = rig.get("front_left").unwrap();
    assert!(front.rotation.y.z > 0.0);
    assert!(rig.get("top").is_some());
}

#[test]
fn test_look_at_straight_down() {
    let rotation = look_at(Point3::new(0.0, 0.0, 1.0), Point3::origin());
    assert!((rotation.z - Vector3::unit_z()).magnitude() < 1e-12);
    assert!(rotation.x.magnitude() > 0.999);
    assert!(rotation.determinant() > 0.0);
}

#[test]
fn test_rig_reproducible() {
    let config = CameraConfig::default();
    let a = CameraRig::generate(&config, 0.7, &mut DeterministicRng::new(4));
    let b = CameraRig::generate(&config, 0.7, &mut DeterministicRng::new(4));
    assert_eq!(a.cameras, b.cameras);
}
