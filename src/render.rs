//! Rendering of the scene from the active camera.
//!
//! [`Renderer`] is what the orchestrator drives: select a camera, render the scene to a PNG at a
//! path. [`RasterRenderer`] is a CPU z-buffer rasterizer with diffuse shading from the scene
//! lights. It casts no shadows.

use cgmath::prelude::*;
use cgmath::{Point3, Vector3};
use image::{ImageFormat, Rgb, RgbImage};
use itertools::Itertools;
use thiserror::Error;

use std::path::Path;

use crate::camera::Camera;
use crate::config::{RenderConfig, RenderEngine};
use crate::lighting::{Light, LightKind};
use crate::mesh::Mesh;
use crate::physics::PhysicsWorld;
use crate::scene::SceneState;

/// Camera space points closer than this are clipped.
const NEAR_PLANE: f64 = 1e-3;
/// Albedo of imported objects, which carry no materials.
const OBJECT_ALBEDO: [f64; 3] = [0.7, 0.7, 0.7];
const GAMMA: f64 = 2.2;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("no active camera")]
    NoCamera,
    #[error("could not write image: {0}")]
    Image(#[from] image::ImageError),
    #[error("could not write image: {0}")]
    IOError(#[from] std::io::Error),
}

/// Something that can turn a scene into an image file.
pub trait Renderer {
    fn set_active_camera(&mut self, camera: &Camera);

    /// Render the scene from the active camera and write a PNG to `path`.
    fn render_to<W: PhysicsWorld>(
        &mut self,
        scene: &SceneState<W>,
        path: &Path,
    ) -> Result<(), RenderError>;
}

struct Surface<'a> {
    mesh: &'a Mesh,
    albedo: [f64; 3],
    /// Only draw faces whose winding normal points at the camera.
    cull_backfaces: bool,
}

struct Frame {
    width: u32,
    height: u32,
    color: Vec<[f64; 3]>,
    /// 1 / depth of the closest surface per pixel, 0 if empty.
    inv_depth: Vec<f64>,
}

/// Vertex after transformation to camera space.
#[derive(Debug, Clone, Copy)]
struct ClipVertex {
    camera: Vector3<f64>,
    world: Point3<f64>,
}

/// Clip a polygon against the near plane.
fn clip_near(polygon: &[ClipVertex]) -> Vec<ClipVertex> {
    let inside = |v: &ClipVertex| v.camera.z <= -NEAR_PLANE;
    let mut out = Vec::with_capacity(polygon.len() + 2);
    for (i, current) in polygon.iter().enumerate() {
        let next = &polygon[(i + 1) % polygon.len()];
        if inside(current) {
            out.push(*current);
        }
        if inside(current) != inside(next) {
            let t = (-NEAR_PLANE - current.camera.z) / (next.camera.z - current.camera.z);
            out.push(ClipVertex {
                camera: current.camera.lerp(next.camera, t),
                world: current.world + (next.world - current.world) * t,
            });
        }
    }
    out
}

/// Irradiance arriving at `p` with surface normal `n`.
fn irradiance(p: Point3<f64>, n: Vector3<f64>, lights: &[Light], ambient: f64) -> [f64; 3] {
    let mut e = [ambient; 3];
    for light in lights {
        let to_light = light.position - p;
        let d2 = to_light.magnitude2();
        if d2 <= 0.0 {
            continue;
        }
        let l = to_light / d2.sqrt();
        let cos_surface = n.dot(l);
        if cos_surface <= 0.0 {
            continue;
        }
        let intensity = match light.kind {
            LightKind::Point => light.energy / (4.0 * std::f64::consts::PI),
            LightKind::Area { .. } => {
                let cos_light = light.direction.dot(-l);
                if cos_light <= 0.0 {
                    continue;
                }
                light.energy / std::f64::consts::PI * cos_light
            }
        };
        let scale = intensity * cos_surface / d2;
        for (c, k) in e.iter_mut().zip(light.color.iter()) {
            *c += scale * k;
        }
    }
    e
}

fn edge(a: (f64, f64), b: (f64, f64), p: (f64, f64)) -> f64 {
    (b.0 - a.0) * (p.1 - a.1) - (b.1 - a.1) * (p.0 - a.0)
}

#[derive(Debug, Clone)]
pub struct RasterRenderer {
    pub width: u32,
    pub height: u32,
    pub engine: RenderEngine,
    pub exposure: f64,
    camera: Option<Camera>,
}

impl RasterRenderer {
    pub fn new(config: &RenderConfig) -> Self {
        RasterRenderer {
            width: config.resolution_x,
            height: config.resolution_y,
            engine: config.engine,
            exposure: config.exposure,
            camera: None,
        }
    }

    pub fn active_camera(&self) -> Option<&Camera> {
        self.camera.as_ref()
    }

    fn draw_triangle(
        &self,
        frame: &mut Frame,
        camera: &Camera,
        surface: &Surface,
        corners: [Point3<f64>; 3],
        lights: &[Light],
        ambient: f64,
    ) {
        let mut normal = (corners[1] - corners[0]).cross(corners[2] - corners[0]);
        if normal.magnitude2() == 0.0 {
            return;
        }
        normal = normal.normalize();
        let facing = normal.dot(camera.position - corners[0]);
        if facing <= 0.0 {
            if surface.cull_backfaces {
                return;
            }
            normal = -normal;
        }

        let polygon = corners
            .iter()
            .map(|p| ClipVertex {
                camera: camera.to_camera(*p),
                world: *p,
            })
            .collect::<Vec<_>>();
        let polygon = clip_near(&polygon);
        if polygon.len() < 3 {
            return;
        }

        let flat_color = match self.engine {
            RenderEngine::Flat => {
                let centroid = Point3::centroid(&corners);
                Some(irradiance(centroid, normal, lights, ambient))
            }
            RenderEngine::Shaded => None,
        };

        let projected = polygon
            .iter()
            .filter_map(|v| {
                camera
                    .project_camera(v.camera, frame.width, frame.height)
                    .map(|s| (s, 1.0 / -v.camera.z, v.world))
            })
            .collect::<Vec<_>>();
        if projected.len() != polygon.len() {
            return;
        }

        // fan triangulation of the clipped polygon
        for (b, c) in (1..projected.len()).tuple_windows() {
            let tri = [projected[0], projected[b], projected[c]];
            let area = edge(tri[0].0, tri[1].0, tri[2].0);
            if area.abs() < 1e-12 {
                continue;
            }
            let min_x = tri.iter().map(|t| (t.0).0).fold(std::f64::INFINITY, f64::min);
            let max_x = tri.iter().map(|t| (t.0).0).fold(std::f64::NEG_INFINITY, f64::max);
            let min_y = tri.iter().map(|t| (t.0).1).fold(std::f64::INFINITY, f64::min);
            let max_y = tri.iter().map(|t| (t.0).1).fold(std::f64::NEG_INFINITY, f64::max);
            let x0 = min_x.floor().max(0.0) as u32;
            let y0 = min_y.floor().max(0.0) as u32;
            let x1 = (max_x.ceil().min(frame.width as f64)).max(0.0) as u32;
            let y1 = (max_y.ceil().min(frame.height as f64)).max(0.0) as u32;

            for y in y0..y1 {
                for x in x0..x1 {
                    let p = (x as f64 + 0.5, y as f64 + 0.5);
                    let w0 = edge(tri[1].0, tri[2].0, p) / area;
                    let w1 = edge(tri[2].0, tri[0].0, p) / area;
                    let w2 = edge(tri[0].0, tri[1].0, p) / area;
                    if w0 < 0.0 || w1 < 0.0 || w2 < 0.0 {
                        continue;
                    }
                    let inv_z = w0 * tri[0].1 + w1 * tri[1].1 + w2 * tri[2].1;
                    let index = (y * frame.width + x) as usize;
                    if inv_z <= frame.inv_depth[index] {
                        continue;
                    }
                    frame.inv_depth[index] = inv_z;
                    let e = match flat_color {
                        Some(e) => e,
                        None => {
                            // perspective correct world position
                            let world = (tri[0].2.to_vec() * (w0 * tri[0].1)
                                + tri[1].2.to_vec() * (w1 * tri[1].1)
                                + tri[2].2.to_vec() * (w2 * tri[2].1))
                                / inv_z;
                            irradiance(Point3::from_vec(world), normal, lights, ambient)
                        }
                    };
                    let pixel = &mut frame.color[index];
                    for i in 0..3 {
                        pixel[i] = surface.albedo[i] / std::f64::consts::PI * e[i];
                    }
                }
            }
        }
    }

    /// Render the scene from the active camera into an image.
    pub fn render<W: PhysicsWorld>(&self, scene: &SceneState<W>) -> Result<RgbImage, RenderError> {
        let camera = self.camera.as_ref().ok_or(RenderError::NoCamera)?;
        let pixels = (self.width * self.height) as usize;
        let mut frame = Frame {
            width: self.width,
            height: self.height,
            color: vec![[0.0; 3]; pixels],
            inv_depth: vec![0.0; pixels],
        };

        let mut surfaces = Vec::new();
        if let Some(enclosure) = scene.enclosure() {
            surfaces.push(Surface {
                mesh: &enclosure.mesh,
                albedo: enclosure.material.base_color,
                cull_backfaces: true,
            });
        }
        if let Some(rested) = &scene.object {
            surfaces.push(Surface {
                mesh: &rested.object.mesh,
                albedo: OBJECT_ALBEDO,
                cull_backfaces: false,
            });
        }

        for surface in surfaces.iter() {
            for (a, b, c) in surface.mesh.iter_triangles() {
                self.draw_triangle(
                    &mut frame,
                    camera,
                    surface,
                    [a, b, c],
                    &scene.lights.lights,
                    scene.world_ambient,
                );
            }
        }

        let exposure = self.exposure;
        let image = RgbImage::from_fn(self.width, self.height, |x, y| {
            let c = frame.color[(y * self.width + x) as usize];
            let encode = |v: f64| ((v * exposure).max(0.0).min(1.0).powf(1.0 / GAMMA) * 255.0).round() as u8;
            Rgb([encode(c[0]), encode(c[1]), encode(c[2])])
        });
        Ok(image)
    }
}

impl Renderer for RasterRenderer {
    fn set_active_camera(&mut self, camera: &Camera) {
        self.camera = Some(camera.clone());
    }

    fn render_to<W: PhysicsWorld>(
        &mut self,
        scene: &SceneState<W>,
        path: &Path,
    ) -> Result<(), RenderError> {
        let image = self.render(scene)?;
        image.save_with_format(path, ImageFormat::Png)?;
        Ok(())
    }
}

#[cfg(test)]
fn test_scene(with_object: bool) -> SceneState {
    use crate::camera::CameraRig;
    use crate::config::Config;
    use crate::enclosure::Enclosure;
    use crate::lighting::LightSet;
    use crate::physics::{ImpulseWorld, WorldSettings};
    use crate::seed::DeterministicRng;

    let config = Config::default();
    let mut scene = SceneState::new(ImpulseWorld::new(WorldSettings::from_config(&config.physics)));
    let mut rng = DeterministicRng::new(9);
    scene
        .set_enclosure(Enclosure::build(&config.enclosure, &mut rng))
        .unwrap();
    scene.lights = LightSet::generate(&config.lighting, 0.7, &mut rng);
    scene.rig = CameraRig::generate(&config.camera, 0.7, &mut rng);
    if with_object {
        let mut mesh = Mesh::cube(0.2);
        mesh.translate(Vector3::new(0.0, 0.0, -0.25));
        let pose = crate::pose::Pose {
            position: Point3::new(0.0, 0.0, -0.25),
            rotation: [0.0; 3],
        };
        scene.object = Some(crate::pose::Rested {
            object: crate::mesh::NormalizedObject {
                mesh,
                scale: 1.0,
                dimensions: Vector3::new(0.2, 0.2, 0.2),
            },
            initial: pose,
            pose,
        });
    }
    scene
}

#[cfg(test)]
fn test_renderer(engine: RenderEngine) -> RasterRenderer {
    RasterRenderer::new(&RenderConfig {
        resolution_x: 64,
        resolution_y: 48,
        engine,
        exposure: 0.08,
    })
}

#[test]
fn test_render_requires_camera() {
    let scene = test_scene(false);
    match test_renderer(RenderEngine::Shaded).render(&scene) {
        Err(RenderError::NoCamera) => (),
        other => panic!("expected no camera error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_enclosure_fills_view() {
    let scene = test_scene(false);
    let mut renderer = test_renderer(RenderEngine::Shaded);
    renderer.set_active_camera(scene.rig.get("top").unwrap());
    let image = renderer.render(&scene).unwrap();
    assert_eq!(image.dimensions(), (64, 48));
    // the floor is lit, so the center is not black
    let center = image.get_pixel(32, 24);
    assert!(center.0.iter().any(|c| *c > 0));
}

#[test]
fn test_object_visible_from_top() {
    let empty = test_scene(false);
    let full = test_scene(true);
    for engine in [RenderEngine::Shaded, RenderEngine::Flat].iter() {
        let mut renderer = test_renderer(*engine);
        renderer.set_active_camera(full.rig.get("top").unwrap());
        let a = renderer.render(&empty).unwrap();
        let b = renderer.render(&full).unwrap();
        assert_ne!(a.get_pixel(32, 24), b.get_pixel(32, 24));
    }
}

#[test]
fn test_render_to_png() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frame.png");
    let scene = test_scene(true);
    let mut renderer = test_renderer(RenderEngine::Flat);
    renderer.set_active_camera(scene.rig.get("front_left").unwrap());
    renderer.render_to(&scene, &path).unwrap();
    let image = image::open(&path).unwrap();
    assert_eq!(image.width(), 64);
}

#[test]
fn test_clip_near_plane() {
    let v = |z: f64| ClipVertex {
        camera: Vector3::new(0.0, 0.0, z),
        world: Point3::new(0.0, 0.0, z),
    };
    assert_eq!(clip_near(&[v(-1.0), v(-2.0), v(-3.0)]).len(), 3);
    assert_eq!(clip_near(&[v(1.0), v(2.0), v(3.0)]).len(), 0);
    let clipped = clip_near(&[v(-1.0), v(1.0), v(-2.0)]);
    assert_eq!(clipped.len(), 4);
    assert!(clipped.iter().all(|c| c.camera.z <= -NEAR_PLANE + 1e-12));
}
