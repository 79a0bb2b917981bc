extern crate boxdrop;
extern crate structopt;

use boxdrop::config::OutputLayout;
use boxdrop::filter::{filter_dataset, FilterOptions, Thresholds};
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(
    name = "boxfilter",
    about = "Delete image sets whose top view is too bright to show an object."
)]
struct Opt {
    /// Output directory of a rendering run.
    #[structopt(name = "OUTPUT", parse(from_os_str))]
    output: PathBuf,

    /// Images with an average brightness above this are deleted.
    #[structopt(long = "threshold", default_value = "245")]
    threshold: f64,

    /// Layout the dataset was rendered with.
    #[structopt(long = "layout", default_value = "view-major")]
    layout: OutputLayout,

    /// Log what would be deleted without deleting anything.
    #[structopt(long = "debug")]
    debug: bool,
}

fn main() -> Result<(), boxdrop::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opt = Opt::from_args();
    let options = FilterOptions {
        layout: opt.layout,
        reference_view: "top".to_string(),
        dry_run: opt.debug,
        verbose: false,
    };
    let report = filter_dataset(&opt.output, &Thresholds::fixed(opt.threshold), &options)?;
    println!("{}", report);
    Ok(())
}
