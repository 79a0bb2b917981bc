//! Tools for generating synthetic multi-view image datasets.
//!
//! Each model is dropped into a closed box, settled with a small rigid-body simulation and rendered
//! from a fixed set of randomly perturbed cameras under randomized lighting. A separate quality
//! filter removes image sets in which the object is not visible from the top.
//!
//! Example usage:
//! ```no_run
//! use boxdrop::config::Config;
//! use boxdrop::orchestrator::Orchestrator;
//! use boxdrop::render::RasterRenderer;
//! use std::path::Path;
//!
//! let config = Config::default();
//! let renderer = RasterRenderer::new(&config.render);
//! let mut orchestrator = Orchestrator::new(config, renderer);
//! let summary = orchestrator
//!     .run(Path::new("data/input"), Path::new("data/output"))
//!     .unwrap();
//! println!("{}", summary);
//! ```

extern crate cgmath;
extern crate itertools;
extern crate rand;
extern crate rayon;

pub mod camera;
pub mod config;
pub mod enclosure;
pub mod filter;
pub mod lighting;
pub mod mesh;
pub mod orchestrator;
pub mod physics;
pub mod pose;
pub mod render;
pub mod scene;
pub mod seed;

use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use thiserror::Error;

pub use crate::filter::FilterError;
pub use crate::mesh::FitViolation;
pub use crate::physics::PhysicsError;
pub use crate::render::RenderError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("could not import {path}: {message}")]
    ImportError { path: PathBuf, message: String },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("could not parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),
    #[error("could not traverse directory: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("physics error: {0}")]
    Physics(#[from] PhysicsError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Filter(#[from] FilterError),
}

pub(crate) fn progress_bar(length: u64, message: &str, verbose: bool) -> ProgressBar {
    if !verbose {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(length);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{bar:40}] {pos}/{len} ({eta})")
            .progress_chars("#-"),
    );
    pb.set_message(message);
    pb
}
