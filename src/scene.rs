//! Owner of everything in the scene for one variation.

use crate::camera::CameraRig;
use crate::enclosure::Enclosure;
use crate::lighting::LightSet;
use crate::physics::{ImpulseWorld, PhysicsError, PhysicsWorld};
use crate::pose::Rested;

/// The physics world and every entity placed in it. Only the enclosure may outlive a
/// [`SceneState::reset`].
#[derive(Debug)]
pub struct SceneState<W: PhysicsWorld = ImpulseWorld> {
    pub world: W,
    enclosure: Option<Enclosure>,
    pub object: Option<Rested>,
    pub rig: CameraRig,
    pub lights: LightSet,
    /// Uniform background irradiance.
    pub world_ambient: f64,
}

impl<W: PhysicsWorld> SceneState<W> {
    pub fn new(world: W) -> Self {
        SceneState {
            world,
            enclosure: None,
            object: None,
            rig: CameraRig::default(),
            lights: LightSet::default(),
            world_ambient: 0.0,
        }
    }

    /// Release the object, cameras and lights. The enclosure is kept only if `keep_enclosure` is
    /// set.
    pub fn reset(&mut self, keep_enclosure: bool) {
        self.object = None;
        self.rig = CameraRig::default();
        self.lights = LightSet::default();
        if !keep_enclosure {
            if let Some(mut enclosure) = self.enclosure.take() {
                enclosure.detach(&mut self.world);
            }
        }
    }

    /// Install `enclosure` and register its collider, replacing any previous one.
    pub fn set_enclosure(&mut self, mut enclosure: Enclosure) -> Result<(), PhysicsError> {
        if let Some(mut old) = self.enclosure.take() {
            old.detach(&mut self.world);
        }
        enclosure.attach(&mut self.world)?;
        self.enclosure = Some(enclosure);
        Ok(())
    }

    pub fn enclosure(&self) -> Option<&Enclosure> {
        self.enclosure.as_ref()
    }

    pub fn has_enclosure(&self) -> bool {
        self.enclosure.is_some()
    }
}

#[test]
fn test_reset_keeps_enclosure() {
    use crate::config::Config;
    use crate::physics::WorldSettings;
    use crate::seed::DeterministicRng;

    let config = Config::default();
    let mut scene = SceneState::new(ImpulseWorld::new(WorldSettings::from_config(&config.physics)));
    let mut rng = DeterministicRng::new(1);
    scene
        .set_enclosure(Enclosure::build(&config.enclosure, &mut rng))
        .unwrap();
    scene.lights = LightSet::generate(&config.lighting, 0.7, &mut rng);
    scene.rig = CameraRig::generate(&config.camera, 0.7, &mut rng);

    scene.reset(true);
    assert!(scene.has_enclosure());
    assert!(scene.lights.is_empty() && scene.rig.is_empty());
    assert_eq!(scene.world.num_bodies(), 1);

    scene.reset(false);
    assert!(!scene.has_enclosure());
    assert_eq!(scene.world.num_bodies(), 0);
}

#[test]
fn test_replacing_enclosure_detaches_old_collider() {
    use crate::config::Config;
    use crate::physics::WorldSettings;
    use crate::seed::DeterministicRng;

    let config = Config::default();
    let mut scene = SceneState::new(ImpulseWorld::new(WorldSettings::from_config(&config.physics)));
    for seed in 0..3 {
        let mut rng = DeterministicRng::new(seed);
        scene
            .set_enclosure(Enclosure::build(&config.enclosure, &mut rng))
            .unwrap();
    }
    assert_eq!(scene.world.num_bodies(), 1);
}
