//! Dataset generation: find models, render every variation from every view.

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::camera::CameraRig;
use crate::config::{Config, EnclosurePolicy, OutputLayout};
use crate::enclosure::Enclosure;
use crate::lighting::LightSet;
use crate::mesh::{ModelAsset, Normalizer, MODEL_EXTENSIONS};
use crate::physics::{ImpulseWorld, WorldSettings};
use crate::pose::PoseSynthesizer;
use crate::render::Renderer;
use crate::scene::SceneState;
use crate::seed::{identity_hash, VariationSeed};
use crate::{progress_bar, Error};

/// Name of the run manifest written to the output directory.
pub const MANIFEST_NAME: &str = "config.json";

/// A model file found in the input tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelEntry {
    pub category: String,
    pub name: String,
    pub path: PathBuf,
}

fn file_name(entry: &walkdir::DirEntry) -> String {
    entry.file_name().to_string_lossy().into_owned()
}

/// Sorted category directories directly below `input`.
pub fn discover_categories(input: &Path) -> Result<Vec<String>, Error> {
    let mut categories = Vec::new();
    for entry in WalkDir::new(input)
        .min_depth(1)
        .max_depth(1)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
    {
        let entry = entry?;
        if entry.file_type().is_dir() {
            categories.push(file_name(&entry));
        }
    }
    Ok(categories)
}

/// Every model file in `input/<category>/`, sorted by category and then file name.
pub fn discover_models(input: &Path) -> Result<Vec<ModelEntry>, Error> {
    let mut models = Vec::new();
    for category in discover_categories(input)? {
        for entry in WalkDir::new(input.join(&category))
            .min_depth(1)
            .max_depth(1)
            .sort_by(|a, b| a.file_name().cmp(b.file_name()))
        {
            let entry = entry?;
            let path = entry.path();
            let known = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| MODEL_EXTENSIONS.contains(&e.to_lowercase().as_str()))
                .unwrap_or(false);
            if !entry.file_type().is_file() || !known {
                continue;
            }
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| file_name(&entry));
            models.push(ModelEntry {
                category: category.clone(),
                name,
                path: path.to_path_buf(),
            });
        }
    }
    Ok(models)
}

/// Directory holding the images of one view of one category.
pub fn view_dir(output: &Path, layout: OutputLayout, view: &str, category: &str) -> PathBuf {
    match layout {
        OutputLayout::ViewMajor => output.join(view).join(category),
        OutputLayout::CategoryMajor => output.join(category).join(view),
    }
}

/// File name of variation `variation_index` of a model. Suffixes start at 1.
pub fn frame_name(model: &str, variation_index: usize) -> String {
    format!("{}_v{}.png", model, variation_index + 1)
}

pub fn frame_path(
    output: &Path,
    layout: OutputLayout,
    view: &str,
    category: &str,
    model: &str,
    variation_index: usize,
) -> PathBuf {
    view_dir(output, layout, view, category).join(frame_name(model, variation_index))
}

/// Create the directory of every view and category.
pub fn create_output_folders(
    output: &Path,
    layout: OutputLayout,
    views: &[String],
    categories: &[String],
) -> Result<(), Error> {
    for view in views {
        for category in categories {
            fs::create_dir_all(view_dir(output, layout, view, category))?;
        }
    }
    Ok(())
}

/// Counts of a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total_models: usize,
    pub successful_models: usize,
    pub failed_models: usize,
    pub rendered_variations: usize,
    pub skipped_variations: usize,
    pub frames: usize,
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "Total models:            {}", self.total_models)?;
        writeln!(f, "Successfully rendered:   {}", self.successful_models)?;
        writeln!(f, "Failed:                  {}", self.failed_models)?;
        writeln!(f, "Rendered variations:     {}", self.rendered_variations)?;
        writeln!(f, "Skipped variations:      {}", self.skipped_variations)?;
        write!(f, "Frames:                  {}", self.frames)
    }
}

/// Drives the generation of a whole dataset with renderer `R`.
pub struct Orchestrator<R: Renderer> {
    config: Config,
    renderer: R,
    verbose: bool,
}

impl<R: Renderer> Orchestrator<R> {
    pub fn new(config: Config, renderer: R) -> Self {
        Orchestrator {
            config,
            renderer,
            verbose: true,
        }
    }

    /// Show or hide the progress bar.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Render every model under `input` into `output`. Failing models are counted and skipped.
    pub fn run(&mut self, input: &Path, output: &Path) -> Result<RunSummary, Error> {
        self.config.validate()?;
        let models = discover_models(input)?;
        let categories = discover_categories(input)?;
        log::info!(
            "found {} categories: {}",
            categories.len(),
            categories.join(", ")
        );
        log::info!("found {} models to render", models.len());

        let views = self
            .config
            .camera
            .views
            .iter()
            .map(|v| v.name.clone())
            .collect::<Vec<_>>();
        create_output_folders(output, self.config.layout, &views, &categories)?;
        let manifest = output.join(MANIFEST_NAME);
        self.config.write_manifest(&manifest)?;
        log::info!("configuration recorded in {}", manifest.display());

        let mut scene = SceneState::new(ImpulseWorld::new(WorldSettings::from_config(
            &self.config.physics,
        )));
        let mut summary = RunSummary {
            total_models: models.len(),
            ..Default::default()
        };

        let pb = progress_bar(models.len() as u64, "Rendering models", self.verbose);
        for (i, model) in models.iter().enumerate() {
            log::info!(
                "processing model {}/{}: {}/{}",
                i + 1,
                models.len(),
                model.category,
                model.name
            );
            match self.render_model(&mut scene, model, output, &mut summary) {
                Ok(true) => summary.successful_models += 1,
                Ok(false) => summary.failed_models += 1,
                Err(e) => {
                    log::error!("error processing {}/{}: {}", model.category, model.name, e);
                    summary.failed_models += 1;
                }
            }
            pb.inc(1);
        }
        pb.finish();

        log::info!(
            "rendering complete: {} models, {} succeeded, {} failed",
            summary.total_models,
            summary.successful_models,
            summary.failed_models
        );
        Ok(summary)
    }

    /// Render all variations of one model. Returns `Ok(false)` if the model has no geometry.
    fn render_model(
        &mut self,
        scene: &mut SceneState,
        model: &ModelEntry,
        output: &Path,
        summary: &mut RunSummary,
    ) -> Result<bool, Error> {
        let config = &self.config;
        let size = config.enclosure.size;
        let keep_enclosure = config.enclosure.policy == EnclosurePolicy::Persistent;
        let normalizer = Normalizer::from_config(config);
        let synthesizer = PoseSynthesizer::from_config(config);
        let hash = identity_hash(&model.category, &model.name);
        let variations = config.variations_per_model;

        for variation in 0..variations {
            let seed = VariationSeed::derive(variation, hash);
            log::debug!("variation {} of {} uses seed {}", variation + 1, model.name, seed);

            scene.reset(keep_enclosure);
            if !scene.has_enclosure() {
                let enclosure = Enclosure::build(&config.enclosure, &mut seed.stream_rng("enclosure"));
                scene.set_enclosure(enclosure)?;
            }
            scene.lights = LightSet::generate(&config.lighting, size, &mut seed.stream_rng("lighting"));
            scene.world_ambient = 0.0;

            let asset = ModelAsset::load(&model.category, &model.name, &model.path)?;
            let object = match normalizer.normalize(asset, &mut seed.stream_rng("scale")) {
                Ok(Some(object)) => object,
                Ok(None) if variation == 0 => {
                    log::error!("{} contains no geometry", model.path.display());
                    return Ok(false);
                }
                Ok(None) => {
                    log::warn!(
                        "{} variation {}: no geometry, skipping",
                        model.name,
                        variation + 1
                    );
                    summary.skipped_variations += 1;
                    continue;
                }
                Err(violation) => {
                    log::warn!(
                        "{} variation {}: {}, skipping",
                        model.name,
                        variation + 1,
                        violation
                    );
                    summary.skipped_variations += 1;
                    continue;
                }
            };

            scene.rig = CameraRig::generate(&config.camera, size, &mut seed.stream_rng("camera"));
            let rested = synthesizer.synthesize(object, &mut seed.pose_rng(), &mut scene.world);
            log::info!(
                "variation {}/{}: {}",
                variation + 1,
                variations,
                rested.pose
            );
            scene.object = Some(rested);

            for camera in scene.rig.iter() {
                self.renderer.set_active_camera(camera);
                let path = frame_path(
                    output,
                    config.layout,
                    &camera.name,
                    &model.category,
                    &model.name,
                    variation,
                );
                log::debug!("rendering {} view to {}", camera.name, path.display());
                self.renderer.render_to(scene, &path)?;
                summary.frames += 1;
            }
            summary.rendered_variations += 1;
        }
        Ok(true)
    }
}

#[cfg(test)]
fn write_cube_obj(path: &Path, size: f64) {
    let h = size / 2.0;
    let mut obj = String::new();
    for i in 0..8 {
        let x = if i & 1 == 0 { -h } else { h };
        let y = if i & 2 == 0 { -h } else { h };
        let z = if i & 4 == 0 { -h } else { h };
        obj.push_str(&format!("v {} {} {}\n", x, y, z));
    }
    for f in &[
        [1, 3, 4, 2],
        [5, 6, 8, 7],
        [1, 2, 6, 5],
        [3, 7, 8, 4],
        [1, 5, 7, 3],
        [2, 4, 8, 6],
    ] {
        obj.push_str(&format!("f {} {} {} {}\n", f[0], f[1], f[2], f[3]));
    }
    fs::write(path, obj).unwrap();
}

#[cfg(test)]
fn test_config() -> Config {
    let mut config = Config::default();
    config.variations_per_model = 2;
    config.render.resolution_x = 24;
    config.render.resolution_y = 16;
    config.physics.settle_frames = 10;
    config
}

#[test]
fn test_layout_paths() {
    let out = Path::new("out");
    assert_eq!(
        frame_path(out, OutputLayout::ViewMajor, "top", "mugs", "blue", 0),
        PathBuf::from("out/top/mugs/blue_v1.png")
    );
    assert_eq!(
        frame_path(out, OutputLayout::CategoryMajor, "top", "mugs", "blue", 41),
        PathBuf::from("out/mugs/top/blue_v42.png")
    );
}

#[test]
fn test_discover_models_sorted() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("b")).unwrap();
    fs::create_dir_all(dir.path().join("a")).unwrap();
    write_cube_obj(&dir.path().join("b").join("z.obj"), 1.0);
    write_cube_obj(&dir.path().join("b").join("y.obj"), 1.0);
    write_cube_obj(&dir.path().join("a").join("x.OBJ"), 1.0);
    fs::write(dir.path().join("a").join("notes.txt"), "not a model").unwrap();
    fs::write(dir.path().join("stray.obj"), "").unwrap();

    let models = discover_models(dir.path()).unwrap();
    let names = models
        .iter()
        .map(|m| format!("{}/{}", m.category, m.name))
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["a/x", "b/y", "b/z"]);
}

#[cfg(test)]
#[derive(Default)]
struct CountingRenderer {
    rendered: Vec<PathBuf>,
    fail_on: Option<String>,
    /// Wall material and number of bodies in the world at every render.
    materials: Vec<crate::enclosure::SurfaceMaterial>,
    bodies: Vec<usize>,
    /// Model file replaced by a mesh without faces after the first render.
    truncate: Option<PathBuf>,
}

#[cfg(test)]
impl Renderer for CountingRenderer {
    fn set_active_camera(&mut self, _camera: &crate::camera::Camera) {}

    fn render_to<W: crate::physics::PhysicsWorld>(
        &mut self,
        scene: &SceneState<W>,
        path: &Path,
    ) -> Result<(), crate::render::RenderError> {
        if let Some(name) = &self.fail_on {
            if path.to_string_lossy().contains(name.as_str()) {
                return Err(crate::render::RenderError::NoCamera);
            }
        }
        if let Some(enclosure) = scene.enclosure() {
            self.materials.push(enclosure.material);
        }
        self.bodies.push(scene.world.num_bodies());
        if let Some(model) = self.truncate.take() {
            fs::write(model, "v 0 0 0\n").unwrap();
        }
        self.rendered.push(path.to_path_buf());
        Ok(())
    }
}

#[test]
fn test_run_renders_every_view() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    fs::create_dir_all(input.path().join("boxes")).unwrap();
    write_cube_obj(&input.path().join("boxes").join("cube.obj"), 1.0);

    let renderer = CountingRenderer::default();
    let mut orchestrator = Orchestrator::new(test_config(), renderer).verbose(false);
    let summary = orchestrator.run(input.path(), output.path()).unwrap();
    assert_eq!(summary.successful_models, 1);
    assert_eq!(summary.rendered_variations, 2);
    assert_eq!(summary.frames, 10);
    assert!(output.path().join("config.json").exists());
    assert!(output.path().join("top").join("boxes").is_dir());
    assert!(orchestrator
        .renderer
        .rendered
        .contains(&output.path().join("back_left/boxes/cube_v2.png")));
}

#[test]
fn test_failing_model_does_not_stop_run() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    fs::create_dir_all(input.path().join("boxes")).unwrap();
    write_cube_obj(&input.path().join("boxes").join("bad.obj"), 1.0);
    write_cube_obj(&input.path().join("boxes").join("good.obj"), 1.0);
    // no triangles at all
    fs::write(input.path().join("boxes").join("empty.obj"), "v 0 0 0\n").unwrap();

    let renderer = CountingRenderer {
        fail_on: Some("bad_v1".to_string()),
        ..Default::default()
    };
    let mut orchestrator = Orchestrator::new(test_config(), renderer).verbose(false);
    let summary = orchestrator.run(input.path(), output.path()).unwrap();
    assert_eq!(summary.total_models, 3);
    assert_eq!(summary.successful_models, 1);
    assert_eq!(summary.failed_models, 2);
    assert_eq!(summary.frames, 10);
}

#[test]
fn test_fit_violation_skips_variation() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    fs::create_dir_all(input.path().join("boxes")).unwrap();
    write_cube_obj(&input.path().join("boxes").join("huge.obj"), 3.0);

    let mut config = test_config();
    config.object.rescale = false;
    let renderer = CountingRenderer::default();
    let mut orchestrator = Orchestrator::new(config, renderer).verbose(false);
    let summary = orchestrator.run(input.path(), output.path()).unwrap();
    assert_eq!(summary.successful_models, 1);
    assert_eq!(summary.skipped_variations, 2);
    assert_eq!(summary.frames, 0);
}

#[test]
fn test_empty_later_variation_is_skipped() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    fs::create_dir_all(input.path().join("boxes")).unwrap();
    let model = input.path().join("boxes").join("cube.obj");
    write_cube_obj(&model, 1.0);

    let mut config = test_config();
    config.variations_per_model = 3;
    let renderer = CountingRenderer {
        truncate: Some(model),
        ..Default::default()
    };
    let mut orchestrator = Orchestrator::new(config, renderer).verbose(false);
    let summary = orchestrator.run(input.path(), output.path()).unwrap();
    assert_eq!(summary.successful_models, 1);
    assert_eq!(summary.failed_models, 0);
    assert_eq!(summary.rendered_variations, 1);
    assert_eq!(summary.skipped_variations, 2);
    assert_eq!(summary.frames, 5);
}

#[cfg(test)]
fn run_with_policy(policy: EnclosurePolicy) -> CountingRenderer {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    fs::create_dir_all(input.path().join("boxes")).unwrap();
    write_cube_obj(&input.path().join("boxes").join("a.obj"), 1.0);
    write_cube_obj(&input.path().join("boxes").join("b.obj"), 1.0);

    let mut config = test_config();
    config.enclosure.policy = policy;
    let mut orchestrator =
        Orchestrator::new(config, CountingRenderer::default()).verbose(false);
    let summary = orchestrator.run(input.path(), output.path()).unwrap();
    assert_eq!(summary.frames, 20);
    orchestrator.renderer
}

#[test]
fn test_persistent_enclosure_is_kept() {
    let renderer = run_with_policy(EnclosurePolicy::Persistent);
    assert_eq!(renderer.materials.len(), 20);
    assert!(renderer.materials.iter().all(|m| *m == renderer.materials[0]));
    // the object is detached after settling, only the walls stay in the world
    assert!(renderer.bodies.iter().all(|n| *n == 1));
}

#[test]
fn test_enclosure_rebuilt_per_variation() {
    let renderer = run_with_policy(EnclosurePolicy::PerVariation);
    assert_eq!(renderer.materials.len(), 20);
    for variation in renderer.materials.chunks(5) {
        assert!(variation.iter().all(|m| *m == variation[0]));
    }
    assert_ne!(renderer.materials[0], renderer.materials[5]);
    assert!(renderer.bodies.iter().all(|n| *n == 1));
}
