//! Triangle meshes, model import and geometry normalization.
//!
//! Models are imported from `.obj` (via `tobj`) or `.glb`/`.gltf` (via `gltf`). Both formats are
//! Y-up; meshes are converted to the Z-up frame of the enclosure on import.

use cgmath::prelude::*;
use cgmath::{Matrix3, Matrix4, Point3, Vector3, Zero};
use itertools::Itertools;

use std::path::{Path, PathBuf};

use crate::config::{Config, Range};
use crate::seed::DeterministicRng;
use crate::Error;

/// Axis aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Point3<f64>,
    pub max: Point3<f64>,
}

impl Aabb {
    pub fn center(&self) -> Point3<f64> {
        self.min.midpoint(self.max)
    }

    pub fn dimensions(&self) -> Vector3<f64> {
        self.max - self.min
    }

    pub fn max_dimension(&self) -> f64 {
        let d = self.dimensions();
        d.x.max(d.y).max(d.z)
    }

    /// The eight corners of the box.
    pub fn corners(&self) -> [Point3<f64>; 8] {
        let (a, b) = (self.min, self.max);
        [
            Point3::new(a.x, a.y, a.z),
            Point3::new(b.x, a.y, a.z),
            Point3::new(a.x, b.y, a.z),
            Point3::new(b.x, b.y, a.z),
            Point3::new(a.x, a.y, b.z),
            Point3::new(b.x, a.y, b.z),
            Point3::new(a.x, b.y, b.z),
            Point3::new(b.x, b.y, b.z),
        ]
    }
}

/// Indexed triangle mesh. Triangles are wound counter-clockwise around their outward normal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    pub positions: Vec<Point3<f64>>,
    pub triangles: Vec<[u32; 3]>,
}

impl Mesh {
    pub fn new(positions: Vec<Point3<f64>>, triangles: Vec<[u32; 3]>) -> Self {
        Mesh {
            positions,
            triangles,
        }
    }

    /// Axis aligned cube of side `size` centered at the origin, normals pointing outwards.
    pub fn cube(size: f64) -> Self {
        let h = size / 2.0;
        let positions = Aabb {
            min: Point3::new(-h, -h, -h),
            max: Point3::new(h, h, h),
        }
        .corners()
        .to_vec();
        // corner i has bit 0 = x, bit 1 = y, bit 2 = z
        let triangles = vec![
            [0, 2, 1],
            [1, 2, 3], // -z
            [4, 5, 6],
            [5, 7, 6], // +z
            [0, 1, 4],
            [1, 5, 4], // -y
            [2, 6, 3],
            [3, 6, 7], // +y
            [0, 4, 2],
            [2, 4, 6], // -x
            [1, 3, 5],
            [3, 7, 5], // +x
        ];
        Mesh::new(positions, triangles)
    }

    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty() || self.positions.is_empty()
    }

    pub fn num_triangles(&self) -> usize {
        self.triangles.len()
    }

    pub fn bounds(&self) -> Option<Aabb> {
        let first = *self.positions.first()?;
        let (min, max) = self.positions.iter().fold((first, first), |(lo, hi), p| {
            (
                Point3::new(lo.x.min(p.x), lo.y.min(p.y), lo.z.min(p.z)),
                Point3::new(hi.x.max(p.x), hi.y.max(p.y), hi.z.max(p.z)),
            )
        });
        Some(Aabb { min, max })
    }

    /// Join several meshes into one.
    pub fn merge(meshes: Vec<Mesh>) -> Mesh {
        let mut merged = Mesh::default();
        for mesh in meshes {
            let offset = merged.positions.len() as u32;
            merged.positions.extend(mesh.positions);
            merged.triangles.extend(
                mesh.triangles
                    .iter()
                    .map(|t| [t[0] + offset, t[1] + offset, t[2] + offset]),
            );
        }
        merged
    }

    pub fn translate(&mut self, delta: Vector3<f64>) {
        for p in self.positions.iter_mut() {
            *p += delta;
        }
    }

    /// Uniform scale about the origin.
    pub fn scale(&mut self, factor: f64) {
        for p in self.positions.iter_mut() {
            *p = Point3::from_vec(p.to_vec() * factor);
        }
    }

    /// Apply `p' = rotation * p + translation` to every vertex.
    pub fn transform(&mut self, rotation: &Matrix3<f64>, translation: Vector3<f64>) {
        for p in self.positions.iter_mut() {
            *p = Point3::from_vec(rotation * p.to_vec() + translation);
        }
    }

    /// Reverse the winding of every triangle, flipping its normal.
    pub fn flip_normals(&mut self) {
        for t in self.triangles.iter_mut() {
            t.swap(1, 2);
        }
    }

    pub fn triangle(&self, i: usize) -> (Point3<f64>, Point3<f64>, Point3<f64>) {
        let t = self.triangles[i];
        (
            self.positions[t[0] as usize],
            self.positions[t[1] as usize],
            self.positions[t[2] as usize],
        )
    }

    pub fn iter_triangles<'a>(
        &'a self,
    ) -> impl Iterator<Item = (Point3<f64>, Point3<f64>, Point3<f64>)> + 'a {
        (0..self.triangles.len()).map(move |i| self.triangle(i))
    }

    /// Unit normal of triangle `i` following its winding. Zero for degenerate triangles.
    pub fn face_normal(&self, i: usize) -> Vector3<f64> {
        let (a, b, c) = self.triangle(i);
        let n = (b - a).cross(c - a);
        if n.magnitude2() > 0.0 {
            n.normalize()
        } else {
            Vector3::zero()
        }
    }

    /// Drop triangles that reference missing vertices.
    fn retain_valid(&mut self) {
        let n = self.positions.len() as u32;
        self.triangles.retain(|t| t.iter().all(|&i| i < n));
    }
}

/// Convert a Y-up point to the Z-up world frame.
fn y_up_to_z_up(x: f64, y: f64, z: f64) -> Point3<f64> {
    Point3::new(x, -z, y)
}

fn import_obj(path: &Path) -> Result<Vec<Mesh>, Error> {
    let options = tobj::LoadOptions {
        triangulate: true,
        single_index: true,
        ..Default::default()
    };
    let (models, _materials) = tobj::load_obj(path, &options).map_err(|e| Error::ImportError {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    Ok(models
        .iter()
        .map(|model| {
            let positions = model
                .mesh
                .positions
                .iter()
                .tuples()
                .map(|(x, y, z)| y_up_to_z_up(*x as f64, *y as f64, *z as f64))
                .collect();
            let triangles = model
                .mesh
                .indices
                .iter()
                .tuples()
                .map(|(a, b, c)| [*a, *b, *c])
                .collect();
            Mesh::new(positions, triangles)
        })
        .collect())
}

fn matrix_from_gltf(m: [[f32; 4]; 4]) -> Matrix4<f64> {
    let mut cols = [[0.0f64; 4]; 4];
    for (c, col) in m.iter().enumerate() {
        for (r, v) in col.iter().enumerate() {
            cols[c][r] = *v as f64;
        }
    }
    Matrix4::from(cols)
}

fn gltf_mesh(mesh: &gltf::Mesh, world: &Matrix4<f64>, buffers: &[gltf::buffer::Data]) -> Vec<Mesh> {
    mesh.primitives()
        .filter(|primitive| primitive.mode() == gltf::mesh::Mode::Triangles)
        .filter_map(|primitive| {
            let reader = primitive.reader(|buffer| buffers.get(buffer.index()).map(|d| &d.0[..]));
            let positions = reader
                .read_positions()?
                .map(|[x, y, z]| {
                    let p = world.transform_point(Point3::new(x as f64, y as f64, z as f64));
                    y_up_to_z_up(p.x, p.y, p.z)
                })
                .collect::<Vec<_>>();
            let indices = match reader.read_indices() {
                Some(indices) => indices.into_u32().collect::<Vec<_>>(),
                None => (0..positions.len() as u32).collect(),
            };
            let triangles = indices.iter().tuples().map(|(a, b, c)| [*a, *b, *c]).collect();
            Some(Mesh::new(positions, triangles))
        })
        .collect()
}

fn gltf_node(
    node: &gltf::Node,
    parent: &Matrix4<f64>,
    buffers: &[gltf::buffer::Data],
    out: &mut Vec<Mesh>,
) {
    let world = parent * matrix_from_gltf(node.transform().matrix());
    if let Some(mesh) = node.mesh() {
        out.extend(gltf_mesh(&mesh, &world, buffers));
    }
    for child in node.children() {
        gltf_node(&child, &world, buffers, out);
    }
}

fn import_gltf(path: &Path) -> Result<Vec<Mesh>, Error> {
    let import_error = |e: gltf::Error| Error::ImportError {
        path: path.to_path_buf(),
        message: e.to_string(),
    };
    let gltf::Gltf { document, blob, .. } = gltf::Gltf::open(path).map_err(import_error)?;
    let buffers = gltf::import_buffers(&document, path.parent(), blob).map_err(import_error)?;

    let identity: Matrix4<f64> = SquareMatrix::identity();
    let mut meshes = Vec::new();
    match document.default_scene().or_else(|| document.scenes().next()) {
        Some(scene) => {
            for node in scene.nodes() {
                gltf_node(&node, &identity, &buffers, &mut meshes);
            }
        }
        None => {
            for mesh in document.meshes() {
                meshes.extend(gltf_mesh(&mesh, &identity, &buffers));
            }
        }
    }
    Ok(meshes)
}

/// Mesh file formats that can be imported.
pub const MODEL_EXTENSIONS: &[&str] = &["obj", "glb", "gltf"];

/// An imported 3D model: its identity, where it came from and the raw sub-meshes.
#[derive(Debug, Clone)]
pub struct ModelAsset {
    pub category: String,
    pub name: String,
    pub path: PathBuf,
    pub meshes: Vec<Mesh>,
}

impl ModelAsset {
    /// Import the model at `path`. The format is chosen by file extension.
    pub fn load(category: &str, name: &str, path: &Path) -> Result<Self, Error> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        let meshes = match extension.as_str() {
            "obj" => import_obj(path)?,
            "glb" | "gltf" => import_gltf(path)?,
            ext => {
                return Err(Error::ImportError {
                    path: path.to_path_buf(),
                    message: format!("unknown model format {}", ext),
                })
            }
        };
        Ok(ModelAsset {
            category: category.to_string(),
            name: name.to_string(),
            path: path.to_path_buf(),
            meshes,
        })
    }
}

/// Object bounding box extends beyond the enclosure after scaling.
#[derive(Debug, Clone, thiserror::Error)]
#[error(
    "bounding box corner ({:.3}, {:.3}, {:.3}) is outside the enclosure limit {:.3}",
    .corner.x,
    .corner.y,
    .corner.z,
    .limit
)]
pub struct FitViolation {
    pub corner: Point3<f64>,
    pub limit: f64,
}

/// A merged model centered at the origin and scaled for the enclosure.
#[derive(Debug, Clone)]
pub struct NormalizedObject {
    pub mesh: Mesh,
    /// Scale applied to the imported mesh.
    pub scale: f64,
    pub dimensions: Vector3<f64>,
}

/// Check that all bounding box corners of `mesh` lie within `limit` on every axis.
pub fn check_fit(mesh: &Mesh, limit: f64) -> Result<(), FitViolation> {
    let bounds = match mesh.bounds() {
        Some(b) => b,
        None => return Ok(()),
    };
    for corner in bounds.corners().iter() {
        if corner.x.abs() > limit || corner.y.abs() > limit || corner.z.abs() > limit {
            return Err(FitViolation {
                corner: *corner,
                limit,
            });
        }
    }
    Ok(())
}

/// Settings of the geometry normalizer.
#[derive(Debug, Clone)]
pub struct Normalizer {
    pub rescale: bool,
    pub enforce_fit: bool,
    /// Target maximum dimension in meters.
    pub dimension_range: Range,
    pub half_extent: f64,
    pub tolerance: f64,
}

impl Normalizer {
    pub fn from_config(config: &Config) -> Self {
        Normalizer {
            rescale: config.object.rescale,
            enforce_fit: config.object.enforce_fit,
            dimension_range: config.object_dimension_range(),
            half_extent: config.half_extent(),
            tolerance: config.object.fit_tolerance,
        }
    }

    /// Merge, center and scale the asset. Returns `Ok(None)` if the asset has no triangles.
    pub fn normalize(
        &self,
        asset: ModelAsset,
        rng: &mut DeterministicRng,
    ) -> Result<Option<NormalizedObject>, FitViolation> {
        let mut mesh = Mesh::merge(asset.meshes);
        mesh.retain_valid();
        if mesh.is_empty() {
            return Ok(None);
        }
        let bounds = match mesh.bounds() {
            Some(b) => b,
            None => return Ok(None),
        };
        mesh.translate(-bounds.center().to_vec());

        let mut scale = 1.0;
        let max_dim = bounds.max_dimension();
        if self.rescale && max_dim > 0.0 {
            let target = rng.uniform(self.dimension_range);
            scale = target / max_dim;
            log::debug!(
                "scaling {}/{}: max dimension {:.3} -> {:.3} (factor {:.3})",
                asset.category,
                asset.name,
                max_dim,
                target,
                scale
            );
            mesh.scale(scale);
        }

        if self.enforce_fit {
            check_fit(&mesh, self.half_extent + self.tolerance)?;
        }

        let dimensions = mesh.bounds().map(|b| b.dimensions()).unwrap_or_else(Vector3::zero);
        Ok(Some(NormalizedObject {
            mesh,
            scale,
            dimensions,
        }))
    }
}

#[cfg(test)]
fn test_asset(meshes: Vec<Mesh>) -> ModelAsset {
    ModelAsset {
        category: "test".to_string(),
        name: "asset".to_string(),
        path: PathBuf::from("asset.obj"),
        meshes,
    }
}

#[cfg(test)]
fn test_normalizer(rescale: bool, enforce_fit: bool) -> Normalizer {
    Normalizer {
        rescale,
        enforce_fit,
        dimension_range: (0.21, 0.49),
        half_extent: 0.35,
        tolerance: 0.05,
    }
}

#[test]
fn test_cube_outward_normals() {
    let cube = Mesh::cube(2.0);
    for (i, (a, b, c)) in cube.iter_triangles().enumerate() {
        let centroid = (a.to_vec() + b.to_vec() + c.to_vec()) / 3.0;
        assert!(cube.face_normal(i).dot(centroid) > 0.0);
    }
}

#[test]
fn test_merge_offsets_indices() {
    let mut second = Mesh::cube(1.0);
    second.translate(Vector3::new(3.0, 0.0, 0.0));
    let merged = Mesh::merge(vec![Mesh::cube(1.0), second]);
    assert_eq!(merged.positions.len(), 16);
    assert_eq!(merged.num_triangles(), 24);
    assert_eq!(merged.triangles[12], [8, 10, 9]);
    let bounds = merged.bounds().unwrap();
    assert_eq!(bounds.max.x, 3.5);
}

#[test]
fn test_normalize_centers_and_scales() {
    let mut cube = Mesh::cube(2.0);
    cube.translate(Vector3::new(5.0, -1.0, 2.0));
    let mut rng = DeterministicRng::new(1);
    let object = test_normalizer(true, true)
        .normalize(test_asset(vec![cube]), &mut rng)
        .unwrap()
        .unwrap();
    let bounds = object.mesh.bounds().unwrap();
    assert!(bounds.center().to_vec().magnitude() < 1e-12);
    let dim = bounds.max_dimension();
    assert!(dim >= 0.21 && dim < 0.49);
    assert!((object.scale - dim / 2.0).abs() < 1e-12);
}

#[test]
fn test_normalize_empty_is_no_object() {
    let mut rng = DeterministicRng::new(1);
    let result = test_normalizer(true, true).normalize(test_asset(vec![]), &mut rng);
    assert!(result.unwrap().is_none());
}

#[test]
fn test_fit_violation() {
    let mut rng = DeterministicRng::new(1);
    let result = test_normalizer(false, true).normalize(test_asset(vec![Mesh::cube(1.0)]), &mut rng);
    let violation = result.unwrap_err();
    assert_eq!(violation.limit, 0.35 + 0.05);
    assert_eq!(violation.corner.x.abs(), 0.5);
    assert!(violation.to_string().contains("outside the enclosure limit 0.400"));

    let mut rng = DeterministicRng::new(1);
    let unchecked =
        test_normalizer(false, false).normalize(test_asset(vec![Mesh::cube(1.0)]), &mut rng);
    assert!(unchecked.unwrap().is_some());
}

#[test]
fn test_accepted_objects_fit() {
    let normalizer = test_normalizer(true, true);
    for seed in 0..50 {
        let mut rng = DeterministicRng::new(seed);
        let mut mesh = Mesh::cube(1.0);
        mesh.scale(3.0);
        if let Ok(Some(object)) = normalizer.normalize(test_asset(vec![mesh]), &mut rng) {
            assert!(check_fit(&object.mesh, 0.35 + 0.05).is_ok());
        }
    }
}

#[test]
fn test_flip_normals() {
    let mut cube = Mesh::cube(1.0);
    let before = cube.face_normal(0);
    cube.flip_normals();
    assert_eq!(cube.face_normal(0), -before);
}
