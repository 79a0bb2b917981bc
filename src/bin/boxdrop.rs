extern crate boxdrop;
extern crate structopt;

use boxdrop::config::{Config, OutputLayout, RenderEngine};
use boxdrop::filter::*;
use boxdrop::orchestrator::Orchestrator;
use boxdrop::render::RasterRenderer;
use boxdrop::Error;
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
struct GenerateOpt {
    /// Input directory. Each subdirectory is a category holding .obj, .glb or .gltf models.
    #[structopt(name = "INPUT", parse(from_os_str))]
    input: PathBuf,

    /// Output directory for rendered images and the run manifest.
    #[structopt(name = "OUTPUT", parse(from_os_str))]
    output: PathBuf,

    /// JSON configuration file. Missing values take their defaults.
    #[structopt(long = "config", parse(from_os_str))]
    config: Option<PathBuf>,

    /// Number of variations rendered per model.
    #[structopt(long = "variations")]
    variations: Option<usize>,

    /// Side length of the enclosure in meters.
    #[structopt(long = "size")]
    size: Option<f64>,

    /// Image width in pixels.
    #[structopt(long = "width")]
    width: Option<u32>,

    /// Image height in pixels.
    #[structopt(long = "height")]
    height: Option<u32>,

    /// Renderer to use: shaded or flat.
    #[structopt(long = "engine")]
    engine: Option<RenderEngine>,

    /// Output layout: view-major or category-major.
    #[structopt(long = "layout")]
    layout: Option<OutputLayout>,

    /// Do not display a progress bar.
    #[structopt(long = "quiet", short = "q")]
    quiet: bool,
}

#[derive(StructOpt, Debug)]
struct FilterOpt {
    /// Output directory of a previous run.
    #[structopt(name = "OUTPUT", parse(from_os_str))]
    output: PathBuf,

    /// JSON configuration file. Supplies the margin, layout, reference view and debug toggle.
    #[structopt(long = "config", parse(from_os_str))]
    config: Option<PathBuf>,

    /// Reject reference images brighter than this. Ignored if an empty reference is given.
    #[structopt(long = "threshold", default_value = "245")]
    threshold: f64,

    /// Render of an empty enclosure used to calibrate the upper threshold.
    #[structopt(long = "empty-reference", parse(from_os_str))]
    empty_reference: Option<PathBuf>,

    /// Render of an enclosure with an object used to calibrate the lower threshold.
    #[structopt(long = "object-reference", parse(from_os_str))]
    object_reference: Option<PathBuf>,

    /// Distance the calibrated thresholds are moved inwards.
    #[structopt(long = "margin")]
    margin: Option<f64>,

    /// Layout the dataset was rendered with.
    #[structopt(long = "layout")]
    layout: Option<OutputLayout>,

    /// View whose brightness decides.
    #[structopt(long = "reference-view")]
    reference_view: Option<String>,

    /// Log what would be deleted without deleting anything.
    #[structopt(long = "debug")]
    debug: bool,

    /// Do not display a progress bar.
    #[structopt(long = "quiet", short = "q")]
    quiet: bool,
}

#[derive(StructOpt, Debug)]
struct AnalyzeOpt {
    /// Output directory of a previous run.
    #[structopt(name = "OUTPUT", parse(from_os_str))]
    output: PathBuf,

    /// JSON configuration file. Supplies the layout and reference view.
    #[structopt(long = "config", parse(from_os_str))]
    config: Option<PathBuf>,

    /// Layout the dataset was rendered with.
    #[structopt(long = "layout")]
    layout: Option<OutputLayout>,

    /// View to analyze.
    #[structopt(long = "reference-view")]
    reference_view: Option<String>,

    /// Number of quantile images to list.
    #[structopt(long = "samples", default_value = "5")]
    samples: usize,
}

#[derive(StructOpt, Debug)]
struct CalibrateOpt {
    /// Render of an empty enclosure.
    #[structopt(name = "EMPTY", parse(from_os_str))]
    empty: PathBuf,

    /// Render of an enclosure with an object.
    #[structopt(name = "OBJECT", parse(from_os_str))]
    object: Option<PathBuf>,

    /// JSON configuration file. Supplies the margin.
    #[structopt(long = "config", parse(from_os_str))]
    config: Option<PathBuf>,

    /// Distance the thresholds are moved inwards.
    #[structopt(long = "margin")]
    margin: Option<f64>,
}

#[derive(StructOpt, Debug)]
struct ConfigOpt {
    /// JSON configuration file to resolve. Prints the defaults if not given.
    #[structopt(long = "config", parse(from_os_str))]
    config: Option<PathBuf>,

    /// Print the flat manifest instead of the nested configuration.
    #[structopt(long = "manifest")]
    manifest: bool,
}

#[derive(StructOpt, Debug)]
#[structopt(
    name = "boxdrop",
    about = "Tools for generating synthetic multi-view image datasets."
)]
enum Opt {
    /// Render every model of an input directory under randomized conditions.
    Generate(GenerateOpt),
    /// Delete image sets whose reference view does not show the object.
    Filter(FilterOpt),
    /// Print the brightness distribution of the reference view.
    Analyze(AnalyzeOpt),
    /// Compute filter thresholds from reference renders.
    Calibrate(CalibrateOpt),
    /// Print the resolved configuration.
    Config(ConfigOpt),
}

fn load_config(path: &Option<PathBuf>) -> Result<Config, Error> {
    match path {
        Some(path) => Config::from_file(path),
        None => Ok(Config::default()),
    }
}

fn run_generate(opt: GenerateOpt) -> Result<(), Error> {
    let mut config = load_config(&opt.config)?;
    if let Some(variations) = opt.variations {
        config.variations_per_model = variations;
    }
    if let Some(size) = opt.size {
        config.enclosure.size = size;
    }
    if let Some(width) = opt.width {
        config.render.resolution_x = width;
    }
    if let Some(height) = opt.height {
        config.render.resolution_y = height;
    }
    if let Some(engine) = opt.engine {
        config.render.engine = engine;
    }
    if let Some(layout) = opt.layout {
        config.layout = layout;
    }
    config.validate()?;

    let renderer = RasterRenderer::new(&config.render);
    let mut orchestrator = Orchestrator::new(config, renderer).verbose(!opt.quiet);
    let summary = orchestrator.run(&opt.input, &opt.output)?;
    println!("Rendering complete!");
    println!("{}", summary);
    Ok(())
}

fn run_filter(opt: FilterOpt) -> Result<(), Error> {
    let config = load_config(&opt.config)?;
    let margin = opt.margin.unwrap_or(config.filter.brightness_margin);
    let thresholds = match &opt.empty_reference {
        Some(empty) => Thresholds::calibrate(empty, opt.object_reference.as_deref(), margin)?,
        None => Thresholds::fixed(opt.threshold),
    };
    let dry_run = opt.debug || config.debug;
    let options = FilterOptions {
        layout: opt.layout.unwrap_or(config.layout),
        reference_view: opt.reference_view.unwrap_or(config.filter.reference_view),
        dry_run,
        verbose: !opt.quiet,
    };
    let report = filter_dataset(&opt.output, &thresholds, &options)?;
    if dry_run {
        println!("Dry run, nothing was deleted.");
    }
    println!("{}", report);
    Ok(())
}

fn run_analyze(opt: AnalyzeOpt) -> Result<(), Error> {
    let config = load_config(&opt.config)?;
    let layout = opt.layout.unwrap_or(config.layout);
    let reference_view = opt.reference_view.unwrap_or(config.filter.reference_view);
    let images = reference_images(&opt.output, layout, &reference_view)?;
    let records = measure(&images, false);
    match analyze(&records, opt.samples) {
        Some(distribution) => println!("{}", distribution),
        None => println!("No {} images found in {}", reference_view, opt.output.display()),
    }
    Ok(())
}

fn run_calibrate(opt: CalibrateOpt) -> Result<(), Error> {
    let config = load_config(&opt.config)?;
    let margin = opt.margin.unwrap_or(config.filter.brightness_margin);
    let thresholds = Thresholds::calibrate(&opt.empty, opt.object.as_deref(), margin)?;
    println!("Upper threshold: {:.2}", thresholds.upper);
    if let Some(lower) = thresholds.lower {
        println!("Lower threshold: {:.2}", lower);
    }
    Ok(())
}

fn run_config(opt: ConfigOpt) -> Result<(), Error> {
    let config = load_config(&opt.config)?;
    let json = if opt.manifest {
        serde_json::to_string_pretty(&config.manifest()?)?
    } else {
        serde_json::to_string_pretty(&config)?
    };
    println!("{}", json);
    Ok(())
}

fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opt = Opt::from_args();
    match opt {
        Opt::Generate(opt) => run_generate(opt),
        Opt::Filter(opt) => run_filter(opt),
        Opt::Analyze(opt) => run_analyze(opt),
        Opt::Calibrate(opt) => run_calibrate(opt),
        Opt::Config(opt) => run_config(opt),
    }
}
