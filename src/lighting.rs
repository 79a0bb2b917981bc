//! Randomized lights inside the enclosure.

use cgmath::prelude::*;
use cgmath::{Point3, Vector3};

use crate::config::{LightTopology, LightingConfig};
use crate::seed::DeterministicRng;

/// How far below the ceiling lights hang, as a fraction of the half extent.
const CEILING_GAP: f64 = 0.02;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LightKind {
    Point,
    /// Rectangular one-sided emitter.
    Area { width: f64, height: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Light {
    pub kind: LightKind,
    pub position: Point3<f64>,
    /// Emission direction of area lights.
    pub direction: Vector3<f64>,
    /// Power in watts.
    pub energy: f64,
    /// RGB, each in `[0, 1]`.
    pub color: [f64; 3],
}

#[derive(Debug, Clone, Default)]
pub struct LightSet {
    pub lights: Vec<Light>,
}

impl LightSet {
    /// Build the lights of `config.topology` for an enclosure of side `size`.
    ///
    /// The total energy is drawn once and shared evenly, then three color offsets are drawn per
    /// light.
    pub fn generate(config: &LightingConfig, size: f64, rng: &mut DeterministicRng) -> Self {
        let half = size / 2.0;
        let height = half * (1.0 - CEILING_GAP);
        let down = -Vector3::unit_z();
        let placements: Vec<(LightKind, Point3<f64>, Vector3<f64>)> = match config.topology {
            LightTopology::CeilingPanel => {
                let side = config.panel_fraction * size;
                vec![(
                    LightKind::Area {
                        width: side,
                        height: side,
                    },
                    Point3::new(0.0, 0.0, height),
                    down,
                )]
            }
            LightTopology::OverheadPoint => vec![(LightKind::Point, Point3::new(0.0, 0.0, height), down)],
            LightTopology::EdgePanels => {
                let inset = half * 0.8;
                let kind = LightKind::Area {
                    width: config.panel_fraction * size,
                    height: 0.1 * size,
                };
                [(1.0, 0.0), (-1.0, 0.0), (0.0, 1.0), (0.0, -1.0)]
                    .iter()
                    .map(|&(sx, sy)| {
                        let direction = Vector3::new(-sx, -sy, -1.0).normalize();
                        (kind, Point3::new(sx * inset, sy * inset, height), direction)
                    })
                    .collect()
            }
        };

        let energy = rng.uniform(config.energy_range) / placements.len() as f64;
        let lights = placements
            .into_iter()
            .map(|(kind, position, direction)| {
                let mut color = [1.0; 3];
                for c in color.iter_mut() {
                    *c = (1.0 + rng.uniform(config.color_variation)).max(0.0).min(1.0);
                }
                Light {
                    kind,
                    position,
                    direction,
                    energy,
                    color,
                }
            })
            .collect::<Vec<_>>();
        log::debug!(
            "{} light(s) with {:.2} W each",
            lights.len(),
            energy
        );
        LightSet { lights }
    }

    pub fn total_energy(&self) -> f64 {
        self.lights.iter().map(|l| l.energy).sum()
    }

    pub fn len(&self) -> usize {
        self.lights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lights.is_empty()
    }
}

#[test]
fn test_light_colors_valid() {
    let config = LightingConfig::default();
    for seed in 0..100 {
        let set = LightSet::generate(&config, 0.7, &mut DeterministicRng::new(seed));
        assert_eq!(set.len(), 1);
        let light = set.lights[0];
        assert!(light.color.iter().all(|c| *c >= 0.0 && *c <= 1.0));
        assert!(light.energy >= 7.0 && light.energy < 50.0);
        assert!(light.position.z < 0.35);
    }
}

#[test]
fn test_edge_panels_share_energy() {
    let mut config = LightingConfig::default();
    config.topology = LightTopology::EdgePanels;
    let set = LightSet::generate(&config, 0.7, &mut DeterministicRng::new(2));
    assert_eq!(set.len(), 4);
    let total = set.total_energy();
    assert!(total >= 7.0 && total < 50.0);
    for light in set.lights.iter() {
        assert_eq!(light.energy, set.lights[0].energy);
        // tilted towards the center
        assert!(light.direction.dot(Point3::origin() - light.position) > 0.0);
    }
}

#[test]
fn test_overhead_point() {
    let mut config = LightingConfig::default();
    config.topology = LightTopology::OverheadPoint;
    config.color_variation = (0.0, 0.0);
    let set = LightSet::generate(&config, 0.7, &mut DeterministicRng::new(2));
    assert_eq!(set.lights[0].kind, LightKind::Point);
    assert_eq!(set.lights[0].color, [1.0, 1.0, 1.0]);
}
