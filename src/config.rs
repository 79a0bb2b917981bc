//! Run configuration and the run manifest.
//!
//! Every section has defaults, so a JSON configuration file only needs to name the values it
//! changes:
//! ```
//! let config = boxdrop::config::Config::from_json(r#"{"variations_per_model": 4}"#).unwrap();
//! assert_eq!(config.variations_per_model, 4);
//! assert_eq!(config.enclosure.size, 0.7);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::Error;

/// Closed-open sampling range `(min, max)`.
pub type Range = (f64, f64);

/// Whether the enclosure survives scene resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnclosurePolicy {
    /// Build the enclosure once and keep it for the whole run.
    Persistent,
    /// Rebuild (and re-randomize) the enclosure for every variation.
    PerVariation,
}

/// Arrangement of output files. The quality filter has to be run with the layout the dataset was
/// rendered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputLayout {
    /// `OUTPUT/<view>/<category>/<model>_v<k>.png`
    ViewMajor,
    /// `OUTPUT/<category>/<view>/<model>_v<k>.png`
    CategoryMajor,
}

impl std::str::FromStr for OutputLayout {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "view-major" | "view_major" => Ok(OutputLayout::ViewMajor),
            "category-major" | "category_major" => Ok(OutputLayout::CategoryMajor),
            _ => Err(format!(
                "unknown layout {}, expected view-major or category-major",
                s
            )),
        }
    }
}

/// Placement of the light sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LightTopology {
    /// A single square area light in the middle of the ceiling.
    CeilingPanel,
    /// A single point light just below the ceiling.
    OverheadPoint,
    /// Four rectangular area lights along the top edges, tilted inwards.
    EdgePanels,
}

/// Renderer used to produce the images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderEngine {
    /// Per-pixel diffuse shading.
    Shaded,
    /// One shade per triangle. Faster, blockier.
    Flat,
}

impl std::str::FromStr for RenderEngine {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shaded" => Ok(RenderEngine::Shaded),
            "flat" => Ok(RenderEngine::Flat),
            _ => Err(format!("unknown render engine {}, expected shaded or flat", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnclosureConfig {
    /// Side length of the cube in meters.
    pub size: f64,
    pub policy: EnclosurePolicy,
    pub friction: f64,
    pub restitution: f64,
    /// Contact distance used by the physics world for the walls.
    pub collision_margin: f64,
    pub hue_variation: Range,
    pub saturation_variation: Range,
    pub value_variation: Range,
    pub roughness_range: Range,
    pub specular_range: Range,
    pub metallic_range: Range,
}

impl Default for EnclosureConfig {
    fn default() -> Self {
        EnclosureConfig {
            size: 0.7,
            policy: EnclosurePolicy::Persistent,
            friction: 0.9,
            restitution: 0.0,
            collision_margin: 0.002,
            hue_variation: (-0.1, 0.1),
            saturation_variation: (0.0, 0.2),
            value_variation: (-0.9, 0.0),
            roughness_range: (0.5, 0.95),
            specular_range: (0.0, 0.5),
            metallic_range: (0.0, 0.4),
        }
    }
}

/// A named camera base position. The position is `direction * size / 2 * distance_factor`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewConfig {
    pub name: String,
    pub direction: [f64; 3],
}

impl ViewConfig {
    fn new(name: &str, direction: [f64; 3]) -> Self {
        ViewConfig {
            name: name.to_string(),
            direction,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Focal length range in millimeters.
    pub focal_range: Range,
    pub sensor_width: f64,
    pub sensor_height: f64,
    /// Look-at point, in units of the enclosure size.
    pub look_at: [f64; 3],
    /// Random offset added to each axis of the look-at point.
    pub look_at_offset: Range,
    /// Random offset added to each axis of the camera position.
    pub position_jitter: Range,
    /// How far the cameras sit from the center, as a fraction of the half extent.
    pub distance_factor: f64,
    pub views: Vec<ViewConfig>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        CameraConfig {
            focal_range: (4.0, 10.0),
            sensor_width: 36.0,
            sensor_height: 24.0,
            look_at: [0.0, 0.0, -1.0 / 3.0],
            look_at_offset: (-0.05, 0.05),
            position_jitter: (0.0, 0.0),
            distance_factor: 0.7,
            views: vec![
                ViewConfig::new("front_left", [1.0, 1.0, 1.0]),
                ViewConfig::new("front_right", [-1.0, 1.0, 1.0]),
                ViewConfig::new("back_left", [1.0, -1.0, 1.0]),
                ViewConfig::new("back_right", [-1.0, -1.0, 1.0]),
                ViewConfig::new("top", [0.0, 0.0, 1.0]),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LightingConfig {
    pub topology: LightTopology,
    /// Total light energy range in watts.
    pub energy_range: Range,
    /// Offset added to each channel of a white light.
    pub color_variation: Range,
    /// Side of the ceiling panel as a fraction of the enclosure size.
    pub panel_fraction: f64,
}

impl Default for LightingConfig {
    fn default() -> Self {
        LightingConfig {
            topology: LightTopology::CeilingPanel,
            energy_range: (7.0, 50.0),
            color_variation: (-0.7, 0.7),
            panel_fraction: 0.6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectConfig {
    /// Rescale objects to a random maximum dimension.
    pub rescale: bool,
    /// Reject objects whose bounding box leaves the enclosure.
    pub enforce_fit: bool,
    /// Target maximum dimension, as a fraction of the enclosure size.
    pub dimension_range: Range,
    pub fit_tolerance: f64,
}

impl Default for ObjectConfig {
    fn default() -> Self {
        ObjectConfig {
            rescale: true,
            enforce_fit: true,
            dimension_range: (0.3, 0.7),
            fit_tolerance: 0.05,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysicsConfig {
    /// Number of frames simulated before the pose is captured.
    pub settle_frames: usize,
    pub frame_rate: f64,
    pub substeps: usize,
    pub solver_iterations: usize,
    pub gravity: f64,
    pub mass: f64,
    pub friction: f64,
    pub restitution: f64,
    pub linear_damping: f64,
    pub angular_damping: f64,
    /// Number of support directions used to approximate the convex hull.
    pub hull_directions: usize,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        PhysicsConfig {
            settle_frames: 60,
            frame_rate: 24.0,
            substeps: 10,
            solver_iterations: 10,
            gravity: -9.81,
            mass: 1.0,
            friction: 0.7,
            restitution: 0.2,
            linear_damping: 0.4,
            angular_damping: 0.6,
            hull_directions: 128,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub resolution_x: u32,
    pub resolution_y: u32,
    pub engine: RenderEngine,
    /// Scale from radiant intensity to pixel value.
    pub exposure: f64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        RenderConfig {
            resolution_x: 2048 / 4,
            resolution_y: 2048 / 4,
            engine: RenderEngine::Shaded,
            exposure: 0.08,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Distance the calibrated thresholds are moved inwards.
    pub brightness_margin: f64,
    pub reference_view: String,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            brightness_margin: 5.0,
            reference_view: "top".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub variations_per_model: usize,
    pub layout: OutputLayout,
    pub debug: bool,
    pub enclosure: EnclosureConfig,
    pub camera: CameraConfig,
    pub lighting: LightingConfig,
    pub object: ObjectConfig,
    pub physics: PhysicsConfig,
    pub render: RenderConfig,
    pub filter: FilterConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            variations_per_model: 1500,
            layout: OutputLayout::ViewMajor,
            debug: false,
            enclosure: EnclosureConfig::default(),
            camera: CameraConfig::default(),
            lighting: LightingConfig::default(),
            object: ObjectConfig::default(),
            physics: PhysicsConfig::default(),
            render: RenderConfig::default(),
            filter: FilterConfig::default(),
        }
    }
}

fn check_range(name: &str, (lo, hi): Range) -> Result<(), Error> {
    if !(lo.is_finite() && hi.is_finite()) || lo > hi {
        return Err(Error::Config(format!(
            "{} must be a finite range with min <= max, got ({}, {})",
            name, lo, hi
        )));
    }
    Ok(())
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let file = BufReader::new(File::open(path)?);
        let config: Config = serde_json::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !(self.enclosure.size > 0.0) {
            return Err(Error::Config(format!(
                "enclosure size must be positive, got {}",
                self.enclosure.size
            )));
        }
        if self.render.resolution_x == 0 || self.render.resolution_y == 0 {
            return Err(Error::Config("render resolution must be non-zero".to_string()));
        }
        if self.camera.views.is_empty() {
            return Err(Error::Config("at least one camera view is required".to_string()));
        }
        if !self
            .camera
            .views
            .iter()
            .any(|v| v.name == self.filter.reference_view)
        {
            log::warn!(
                "reference view {} is not one of the configured camera views",
                self.filter.reference_view
            );
        }
        if self.physics.frame_rate <= 0.0 || self.physics.substeps == 0 {
            return Err(Error::Config(
                "physics frame rate and substeps must be positive".to_string(),
            ));
        }
        if self.physics.mass <= 0.0 {
            return Err(Error::Config("object mass must be positive".to_string()));
        }
        let e = &self.enclosure;
        check_range("enclosure.hue_variation", e.hue_variation)?;
        check_range("enclosure.saturation_variation", e.saturation_variation)?;
        check_range("enclosure.value_variation", e.value_variation)?;
        check_range("enclosure.roughness_range", e.roughness_range)?;
        check_range("enclosure.specular_range", e.specular_range)?;
        check_range("enclosure.metallic_range", e.metallic_range)?;
        check_range("camera.focal_range", self.camera.focal_range)?;
        check_range("camera.look_at_offset", self.camera.look_at_offset)?;
        check_range("camera.position_jitter", self.camera.position_jitter)?;
        check_range("lighting.energy_range", self.lighting.energy_range)?;
        check_range("lighting.color_variation", self.lighting.color_variation)?;
        check_range("object.dimension_range", self.object.dimension_range)?;
        if self.camera.focal_range.0 <= 0.0 {
            return Err(Error::Config("focal lengths must be positive".to_string()));
        }
        Ok(())
    }

    /// Half of the enclosure side length.
    pub fn half_extent(&self) -> f64 {
        self.enclosure.size / 2.0
    }

    /// Target object dimensions in meters.
    pub fn object_dimension_range(&self) -> Range {
        let (lo, hi) = self.object.dimension_range;
        (lo * self.enclosure.size, hi * self.enclosure.size)
    }

    /// Flat mapping of every parameter to its value. Keys are the upper case path of the
    /// parameter, e.g. `ENCLOSURE_SIZE` or `CAMERA_FOCAL_RANGE`.
    pub fn manifest(&self) -> Result<BTreeMap<String, Value>, Error> {
        fn flatten(prefix: &str, value: Value, out: &mut BTreeMap<String, Value>) {
            match value {
                Value::Object(map) => {
                    for (k, v) in map {
                        let key = if prefix.is_empty() {
                            k.to_uppercase()
                        } else {
                            format!("{}_{}", prefix, k.to_uppercase())
                        };
                        flatten(&key, v, out);
                    }
                }
                v => {
                    out.insert(prefix.to_string(), v);
                }
            }
        }

        let mut out = BTreeMap::new();
        flatten("", serde_json::to_value(self)?, &mut out);
        Ok(out)
    }

    /// Write the manifest to `path` as a pretty printed JSON object.
    pub fn write_manifest(&self, path: &Path) -> Result<(), Error> {
        let manifest = self.manifest()?;
        let object: Map<String, Value> = manifest.into_iter().collect();
        let file = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(file, &Value::Object(object))?;
        Ok(())
    }
}

#[test]
fn test_defaults_are_valid() {
    let config = Config::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.render.resolution_x, 512);
    assert_eq!(config.camera.views.len(), 5);
}

#[test]
fn test_partial_json() {
    let config = Config::from_json(
        r#"{"enclosure": {"size": 1.0}, "lighting": {"topology": "edge_panels"}}"#,
    )
    .unwrap();
    assert_eq!(config.enclosure.size, 1.0);
    assert_eq!(config.enclosure.friction, 0.9);
    assert_eq!(config.lighting.topology, LightTopology::EdgePanels);
    assert_eq!(config.variations_per_model, 1500);
}

#[test]
fn test_rejects_inverted_range() {
    let result = Config::from_json(r#"{"camera": {"focal_range": [10.0, 4.0]}}"#);
    assert!(result.is_err());
}

#[test]
fn test_manifest_keys() {
    let manifest = Config::default().manifest().unwrap();
    assert_eq!(manifest["ENCLOSURE_SIZE"], serde_json::json!(0.7));
    assert_eq!(manifest["VARIATIONS_PER_MODEL"], serde_json::json!(1500));
    assert_eq!(manifest["CAMERA_FOCAL_RANGE"], serde_json::json!([4.0, 10.0]));
    assert_eq!(manifest["RENDER_RESOLUTION_X"], serde_json::json!(512));
    assert_eq!(manifest["LAYOUT"], serde_json::json!("view_major"));
    assert!(manifest.keys().all(|k| k.to_uppercase() == *k));
}

#[test]
fn test_layout_from_str() {
    assert_eq!(
        "category-major".parse::<OutputLayout>(),
        Ok(OutputLayout::CategoryMajor)
    );
    assert!("sideways".parse::<OutputLayout>().is_err());
}
