//! Rigid-body simulation used to settle objects.
//!
//! [`PhysicsWorld`] is the interface the pose synthesizer needs from a solver. [`ImpulseWorld`] is
//! a small deterministic implementation: active bodies are point clouds (a convex hull
//! approximation), passive bodies are static triangle meshes, and contacts are resolved with
//! sequential impulses. Active bodies do not collide with each other.

use cgmath::prelude::*;
use cgmath::{Matrix3, Point3, Quaternion, Vector3, Zero};
use thiserror::Error;

use crate::config::PhysicsConfig;
use crate::mesh::Mesh;

/// Contacts are generated for points up to this far behind a passive surface.
const CONTACT_DEPTH_LIMIT: f64 = 0.1;
/// Fraction of the penetration corrected per substep.
const BAUMGARTE: f64 = 0.2;
const PENETRATION_SLOP: f64 = 0.0005;
const MAX_CORRECTION_VELOCITY: f64 = 2.0;
/// Approach speed below which contacts do not bounce.
const RESTITUTION_THRESHOLD: f64 = 0.1;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PhysicsError {
    #[error("degenerate collision shape: {0}")]
    DegenerateShape(String),
    #[error("unsupported body: {0}")]
    Unsupported(String),
}

/// Slot index plus the generation of the body stored there. Slots of detached bodies are reused,
/// so a stale handle never reaches a newer body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BodyHandle {
    index: usize,
    generation: u32,
}

/// Position of a body's local origin and its orientation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigidTransform {
    pub position: Point3<f64>,
    pub rotation: Quaternion<f64>,
}

impl RigidTransform {
    pub fn new(position: Point3<f64>, rotation: Quaternion<f64>) -> Self {
        RigidTransform { position, rotation }
    }

    pub fn identity() -> Self {
        RigidTransform {
            position: Point3::origin(),
            rotation: Quaternion::new(1.0, 0.0, 0.0, 0.0),
        }
    }

    pub fn transform_point(&self, p: Point3<f64>) -> Point3<f64> {
        self.position + self.rotation * p.to_vec()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BodyKind {
    /// Moved by gravity and contacts.
    Active { mass: f64 },
    /// Immovable.
    Passive,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigidBody {
    pub kind: BodyKind,
    pub transform: RigidTransform,
}

/// Collision geometry in body coordinates.
#[derive(Debug, Clone)]
pub enum CollisionShape {
    /// Points whose convex hull is the shape.
    ConvexHull(Vec<Point3<f64>>),
    /// Triangle mesh. Contacts push along the triangle winding normal.
    Mesh(Mesh),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhysicsMaterial {
    pub friction: f64,
    pub restitution: f64,
    pub linear_damping: f64,
    pub angular_damping: f64,
    /// Distance at which contacts start.
    pub margin: f64,
}

impl Default for PhysicsMaterial {
    fn default() -> Self {
        PhysicsMaterial {
            friction: 0.5,
            restitution: 0.0,
            linear_damping: 0.0,
            angular_damping: 0.0,
            margin: 0.0,
        }
    }
}

/// A rigid-body solver that can settle bodies for a fixed number of frames.
pub trait PhysicsWorld {
    /// Add a body to the world.
    fn attach(
        &mut self,
        body: RigidBody,
        shape: CollisionShape,
        material: PhysicsMaterial,
    ) -> Result<BodyHandle, PhysicsError>;

    /// Advance the simulation by `frames` frames, in order.
    fn step(&mut self, frames: usize);

    /// Remove a body, returning its last transform.
    fn detach(&mut self, body: BodyHandle) -> Option<RigidTransform>;

    fn read_transform(&self, body: BodyHandle) -> Option<RigidTransform>;

    /// Number of bodies currently attached.
    fn num_bodies(&self) -> usize;
}

/// Approximate the convex hull of `points` by the support points along `directions` directions
/// spread evenly over the sphere.
pub fn hull_points(points: &[Point3<f64>], directions: usize) -> Vec<Point3<f64>> {
    if points.is_empty() {
        return Vec::new();
    }
    let golden = std::f64::consts::PI * (3.0 - 5.0f64.sqrt());
    let n = directions.max(6);
    let mut indices = (0..n)
        .map(|i| {
            let z = 1.0 - 2.0 * (i as f64 + 0.5) / n as f64;
            let r = (1.0 - z * z).sqrt();
            let theta = golden * i as f64;
            let dir = Vector3::new(r * theta.cos(), r * theta.sin(), z);
            let mut best = 0;
            let mut best_dot = std::f64::NEG_INFINITY;
            for (j, p) in points.iter().enumerate() {
                let d = p.to_vec().dot(dir);
                if d > best_dot {
                    best = j;
                    best_dot = d;
                }
            }
            best
        })
        .collect::<Vec<_>>();
    indices.sort_unstable();
    indices.dedup();
    indices.into_iter().map(|i| points[i]).collect()
}

/// True if the points do not span a volume.
fn is_flat(points: &[Point3<f64>]) -> bool {
    if points.len() < 4 {
        return true;
    }
    let p0 = points[0];
    let farthest = |f: &dyn Fn(&Point3<f64>) -> f64| {
        points
            .iter()
            .fold((p0, 0.0), |(bp, bd), p| {
                let d = f(p);
                if d > bd {
                    (*p, d)
                } else {
                    (bp, bd)
                }
            })
    };
    let (p1, d1) = farthest(&|p| (*p - p0).magnitude());
    if d1 < 1e-9 {
        return true;
    }
    let axis = (p1 - p0) / d1;
    let (p2, d2) = farthest(&|p| (*p - p0).cross(axis).magnitude());
    if d2 < 1e-9 * d1 {
        return true;
    }
    let normal = (p1 - p0).cross(p2 - p0).normalize();
    let (_, d3) = farthest(&|p| (*p - p0).dot(normal).abs());
    d3 < 1e-9 * d1
}

#[derive(Debug, Clone)]
struct Triangle {
    a: Point3<f64>,
    b: Point3<f64>,
    c: Point3<f64>,
    normal: Vector3<f64>,
}

impl Triangle {
    /// Does the projection of `p` onto the triangle plane lie inside the triangle?
    fn contains_projection(&self, p: Point3<f64>) -> bool {
        let edge = |u: Point3<f64>, v: Point3<f64>| (v - u).cross(p - u).dot(self.normal);
        let scale = (self.b - self.a).magnitude2().max((self.c - self.a).magnitude2());
        let eps = -1e-9 * scale;
        edge(self.a, self.b) >= eps && edge(self.b, self.c) >= eps && edge(self.c, self.a) >= eps
    }
}

#[derive(Debug, Clone)]
enum Geometry {
    Points(Vec<Point3<f64>>),
    Triangles(Vec<Triangle>),
}

#[derive(Debug, Clone)]
struct Body {
    kind: BodyKind,
    transform: RigidTransform,
    velocity: Vector3<f64>,
    angular_velocity: Vector3<f64>,
    inv_mass: f64,
    /// Diagonal of the inverse inertia tensor in body coordinates.
    inv_inertia: Vector3<f64>,
    geometry: Geometry,
    material: PhysicsMaterial,
}

#[derive(Debug, Clone)]
struct Contact {
    r: Vector3<f64>,
    normal: Vector3<f64>,
    depth: f64,
    friction: f64,
    bounce: f64,
    normal_impulse: f64,
}

/// Solver parameters of an [`ImpulseWorld`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldSettings {
    pub gravity: Vector3<f64>,
    pub frame_rate: f64,
    pub substeps: usize,
    pub iterations: usize,
}

impl WorldSettings {
    pub fn from_config(config: &PhysicsConfig) -> Self {
        WorldSettings {
            gravity: Vector3::new(0.0, 0.0, config.gravity),
            frame_rate: config.frame_rate,
            substeps: config.substeps.max(1),
            iterations: config.solver_iterations.max(1),
        }
    }
}

/// Deterministic sequential-impulse solver.
#[derive(Debug, Clone)]
pub struct ImpulseWorld {
    settings: WorldSettings,
    slots: Vec<Slot>,
    free: Vec<usize>,
}

#[derive(Debug, Clone)]
struct Slot {
    generation: u32,
    body: Option<Body>,
}

fn world_inverse_inertia(rotation: &Matrix3<f64>, inv_inertia: Vector3<f64>) -> Matrix3<f64> {
    rotation * Matrix3::from_diagonal(inv_inertia) * rotation.transpose()
}

impl ImpulseWorld {
    pub fn new(settings: WorldSettings) -> Self {
        ImpulseWorld {
            settings,
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Number of body slots allocated, attached or free.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn body(&self, handle: BodyHandle) -> Option<&Body> {
        self.slots
            .get(handle.index)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.body.as_ref())
    }

    fn passive_triangles(&self) -> Vec<(&Triangle, &PhysicsMaterial)> {
        self.slots
            .iter()
            .filter_map(|slot| slot.body.as_ref())
            .filter_map(|b| match &b.geometry {
                Geometry::Triangles(tris) => Some(tris.iter().map(move |t| (t, &b.material))),
                Geometry::Points(_) => None,
            })
            .flatten()
            .collect()
    }

    fn contacts(&self, body: &Body) -> Vec<Contact> {
        let points = match &body.geometry {
            Geometry::Points(points) => points,
            Geometry::Triangles(_) => return Vec::new(),
        };
        let triangles = self.passive_triangles();
        let mut contacts: Vec<Contact> = Vec::new();
        for local in points {
            let p = body.transform.transform_point(*local);
            let first = contacts.len();
            for (triangle, material) in triangles.iter() {
                let margin = body.material.margin + material.margin;
                let d = (p - triangle.a).dot(triangle.normal);
                if d >= margin || d <= -CONTACT_DEPTH_LIMIT {
                    continue;
                }
                if !triangle.contains_projection(p) {
                    continue;
                }
                let depth = margin - d;
                // one contact per point and surface direction
                match contacts[first..]
                    .iter_mut()
                    .find(|c| c.normal.dot(triangle.normal) > 0.999)
                {
                    Some(existing) => {
                        if depth > existing.depth {
                            existing.depth = depth;
                        }
                    }
                    None => contacts.push(Contact {
                        r: p - body.transform.position,
                        normal: triangle.normal,
                        depth,
                        friction: body.material.friction * material.friction,
                        bounce: body.material.restitution * material.restitution,
                        normal_impulse: 0.0,
                    }),
                }
            }
        }
        contacts
    }

    fn substep(&mut self, dt: f64) {
        for i in 0..self.slots.len() {
            let mut body = match &self.slots[i].body {
                Some(b) if b.inv_mass > 0.0 => b.clone(),
                _ => continue,
            };

            body.velocity += self.settings.gravity * dt;
            body.velocity *= (1.0 - body.material.linear_damping).max(0.0).powf(dt);
            body.angular_velocity *= (1.0 - body.material.angular_damping).max(0.0).powf(dt);

            let rotation = Matrix3::from(body.transform.rotation);
            let inv_inertia = world_inverse_inertia(&rotation, body.inv_inertia);
            let inv_mass = body.inv_mass;
            let mut contacts = self.contacts(&body);
            let approach = contacts
                .iter()
                .map(|c| (body.velocity + body.angular_velocity.cross(c.r)).dot(c.normal))
                .collect::<Vec<_>>();

            for _ in 0..self.settings.iterations {
                for (contact, vn0) in contacts.iter_mut().zip(approach.iter()) {
                    let r = contact.r;
                    let n = contact.normal;
                    let k = |dir: Vector3<f64>| {
                        inv_mass + dir.dot((inv_inertia * r.cross(dir)).cross(r))
                    };

                    let v = body.velocity + body.angular_velocity.cross(r);
                    let vn = v.dot(n);
                    let bias = (BAUMGARTE / dt * (contact.depth - PENETRATION_SLOP).max(0.0))
                        .min(MAX_CORRECTION_VELOCITY);
                    let bounce = if *vn0 < -RESTITUTION_THRESHOLD {
                        -contact.bounce * vn0
                    } else {
                        0.0
                    };
                    let lambda = (bias.max(bounce) - vn) / k(n);
                    let accumulated = (contact.normal_impulse + lambda).max(0.0);
                    let lambda = accumulated - contact.normal_impulse;
                    contact.normal_impulse = accumulated;
                    let impulse = n * lambda;
                    body.velocity += impulse * inv_mass;
                    body.angular_velocity += inv_inertia * r.cross(impulse);

                    let v = body.velocity + body.angular_velocity.cross(r);
                    let tangent = v - n * v.dot(n);
                    let speed = tangent.magnitude();
                    if speed > 1e-12 {
                        let t = tangent / speed;
                        let limit = contact.friction * contact.normal_impulse;
                        let lambda = (-speed / k(t)).max(-limit).min(limit);
                        let impulse = t * lambda;
                        body.velocity += impulse * inv_mass;
                        body.angular_velocity += inv_inertia * r.cross(impulse);
                    }
                }
            }

            body.transform.position += body.velocity * dt;
            let w = body.angular_velocity;
            let spin = Quaternion::new(0.0, w.x, w.y, w.z) * body.transform.rotation * (0.5 * dt);
            body.transform.rotation = (body.transform.rotation + spin).normalize();

            self.slots[i].body = Some(body);
        }
    }
}

impl PhysicsWorld for ImpulseWorld {
    fn attach(
        &mut self,
        body: RigidBody,
        shape: CollisionShape,
        material: PhysicsMaterial,
    ) -> Result<BodyHandle, PhysicsError> {
        let new_body = match (body.kind, shape) {
            (BodyKind::Active { mass }, CollisionShape::ConvexHull(points)) => {
                if !(mass > 0.0) {
                    return Err(PhysicsError::Unsupported(format!(
                        "mass must be positive, got {}",
                        mass
                    )));
                }
                if is_flat(&points) {
                    return Err(PhysicsError::DegenerateShape(format!(
                        "{} hull points span no volume",
                        points.len()
                    )));
                }
                let bounds = Mesh::new(points.clone(), Vec::new())
                    .bounds()
                    .ok_or_else(|| PhysicsError::DegenerateShape("empty hull".to_string()))?;
                let d = bounds.dimensions();
                // solid box inertia around the body origin
                let inertia = Vector3::new(
                    d.y * d.y + d.z * d.z,
                    d.x * d.x + d.z * d.z,
                    d.x * d.x + d.y * d.y,
                ) * (mass / 12.0);
                if inertia.x <= 0.0 || inertia.y <= 0.0 || inertia.z <= 0.0 {
                    return Err(PhysicsError::DegenerateShape(
                        "hull has zero inertia".to_string(),
                    ));
                }
                Body {
                    kind: body.kind,
                    transform: body.transform,
                    velocity: Vector3::zero(),
                    angular_velocity: Vector3::zero(),
                    inv_mass: 1.0 / mass,
                    inv_inertia: Vector3::new(1.0 / inertia.x, 1.0 / inertia.y, 1.0 / inertia.z),
                    geometry: Geometry::Points(points),
                    material,
                }
            }
            (BodyKind::Passive, CollisionShape::Mesh(mesh)) => {
                let triangles = (0..mesh.num_triangles())
                    .filter_map(|i| {
                        let normal = mesh.face_normal(i);
                        if normal.magnitude2() == 0.0 {
                            return None;
                        }
                        let (a, b, c) = mesh.triangle(i);
                        let t = &body.transform;
                        Some(Triangle {
                            a: t.transform_point(a),
                            b: t.transform_point(b),
                            c: t.transform_point(c),
                            normal: t.rotation * normal,
                        })
                    })
                    .collect::<Vec<_>>();
                if triangles.is_empty() {
                    return Err(PhysicsError::DegenerateShape(
                        "collision mesh has no triangles".to_string(),
                    ));
                }
                Body {
                    kind: body.kind,
                    transform: body.transform,
                    velocity: Vector3::zero(),
                    angular_velocity: Vector3::zero(),
                    inv_mass: 0.0,
                    inv_inertia: Vector3::zero(),
                    geometry: Geometry::Triangles(triangles),
                    material,
                }
            }
            (BodyKind::Active { .. }, CollisionShape::Mesh(_)) => {
                return Err(PhysicsError::Unsupported(
                    "active bodies need a convex hull".to_string(),
                ))
            }
            (BodyKind::Passive, CollisionShape::ConvexHull(_)) => {
                return Err(PhysicsError::Unsupported(
                    "passive bodies need a triangle mesh".to_string(),
                ))
            }
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index].body = Some(new_body);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    body: Some(new_body),
                });
                self.slots.len() - 1
            }
        };
        Ok(BodyHandle {
            index,
            generation: self.slots[index].generation,
        })
    }

    fn step(&mut self, frames: usize) {
        let dt = 1.0 / (self.settings.frame_rate * self.settings.substeps as f64);
        for _ in 0..frames {
            for _ in 0..self.settings.substeps {
                self.substep(dt);
            }
        }
    }

    fn detach(&mut self, body: BodyHandle) -> Option<RigidTransform> {
        let slot = self
            .slots
            .get_mut(body.index)
            .filter(|slot| slot.generation == body.generation)?;
        let removed = slot.body.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(body.index);
        Some(removed.transform)
    }

    fn read_transform(&self, body: BodyHandle) -> Option<RigidTransform> {
        self.body(body).map(|b| b.transform)
    }

    fn num_bodies(&self) -> usize {
        self.slots.iter().filter(|slot| slot.body.is_some()).count()
    }
}

#[cfg(test)]
fn test_world() -> (ImpulseWorld, BodyHandle) {
    let mut world = ImpulseWorld::new(WorldSettings::from_config(&PhysicsConfig::default()));
    let mut shell = Mesh::cube(1.0);
    shell.flip_normals();
    let floor = world
        .attach(
            RigidBody {
                kind: BodyKind::Passive,
                transform: RigidTransform::identity(),
            },
            CollisionShape::Mesh(shell),
            PhysicsMaterial {
                friction: 0.9,
                margin: 0.002,
                ..Default::default()
            },
        )
        .unwrap();
    (world, floor)
}

#[cfg(test)]
fn test_material() -> PhysicsMaterial {
    PhysicsMaterial {
        friction: 0.7,
        restitution: 0.2,
        linear_damping: 0.4,
        angular_damping: 0.6,
        margin: 0.0,
    }
}

#[test]
fn test_box_settles_on_floor() {
    let (mut world, _) = test_world();
    let cube = Mesh::cube(0.2);
    let body = world
        .attach(
            RigidBody {
                kind: BodyKind::Active { mass: 1.0 },
                transform: RigidTransform::new(
                    Point3::new(0.0, 0.0, 0.2),
                    Quaternion::new(1.0, 0.0, 0.0, 0.0),
                ),
            },
            CollisionShape::ConvexHull(hull_points(&cube.positions, 64)),
            test_material(),
        )
        .unwrap();
    world.step(60);
    let t = world.read_transform(body).unwrap();
    // resting on the floor at z = -0.5 with a half height of 0.1
    assert!((t.position.z - (-0.4)).abs() < 0.01, "z = {}", t.position.z);
    assert!(t.position.x.abs() < 0.01 && t.position.y.abs() < 0.01);
}

#[test]
fn test_tilted_box_stays_inside() {
    let (mut world, _) = test_world();
    let cube = Mesh::cube(0.3);
    let rotation = Quaternion::from_angle_x(cgmath::Rad(0.7)) * Quaternion::from_angle_y(cgmath::Rad(0.4));
    let body = world
        .attach(
            RigidBody {
                kind: BodyKind::Active { mass: 1.0 },
                transform: RigidTransform::new(Point3::new(0.1, -0.05, 0.1), rotation),
            },
            CollisionShape::ConvexHull(hull_points(&cube.positions, 64)),
            test_material(),
        )
        .unwrap();
    world.step(60);
    let t = world.read_transform(body).unwrap();
    for p in cube.positions.iter() {
        let w = t.transform_point(*p);
        assert!(w.z > -0.5 - 0.01, "vertex below floor: {:?}", w);
        assert!(w.x.abs() < 0.51 && w.y.abs() < 0.51);
    }
    // it fell from where it started
    assert!(t.position.z < 0.0);
}

#[test]
fn test_flat_hull_rejected() {
    let (mut world, _) = test_world();
    let square = vec![
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(1.0, 0.0, 0.0),
        Point3::new(0.0, 1.0, 0.0),
        Point3::new(1.0, 1.0, 0.0),
    ];
    let result = world.attach(
        RigidBody {
            kind: BodyKind::Active { mass: 1.0 },
            transform: RigidTransform::identity(),
        },
        CollisionShape::ConvexHull(square),
        test_material(),
    );
    match result {
        Err(PhysicsError::DegenerateShape(_)) => (),
        other => panic!("expected a degenerate shape, got {:?}", other),
    }
}

#[test]
fn test_detach_removes_body() {
    let (mut world, floor) = test_world();
    assert_eq!(world.num_bodies(), 1);
    assert!(world.detach(floor).is_some());
    assert!(world.detach(floor).is_none());
    assert_eq!(world.num_bodies(), 0);
}

#[test]
fn test_detached_slots_are_reused() {
    let (mut world, _) = test_world();
    let cube = Mesh::cube(0.2);
    let mut first = None;
    for _ in 0..1000 {
        let body = world
            .attach(
                RigidBody {
                    kind: BodyKind::Active { mass: 1.0 },
                    transform: RigidTransform::identity(),
                },
                CollisionShape::ConvexHull(hull_points(&cube.positions, 16)),
                test_material(),
            )
            .unwrap();
        first.get_or_insert(body);
        assert!(world.detach(body).is_some());
    }
    assert_eq!(world.num_bodies(), 1);
    assert_eq!(world.capacity(), 2);

    // a handle from an earlier attach does not reach the body now in its slot
    let stale = first.unwrap();
    assert!(world.read_transform(stale).is_none());
    assert!(world.detach(stale).is_none());
}

#[test]
fn test_hull_points_of_cube() {
    let cube = Mesh::cube(1.0);
    let mut points = cube.positions.clone();
    // interior points are never support points
    points.push(Point3::new(0.1, 0.1, 0.1));
    points.push(Point3::origin());
    let hull = hull_points(&points, 128);
    assert_eq!(hull.len(), 8);
    assert!(hull.iter().all(|p| p.x.abs() == 0.5));
}
