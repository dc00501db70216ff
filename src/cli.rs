use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about)]
pub struct Args {
    /// Estimator configuration (JSON)
    #[arg(long)]
    pub config: PathBuf,

    /// Cycle log to replay through the estimator
    #[arg(long)]
    pub play_log: PathBuf,

    /// Feature memory snapshot, loaded if present and written back on exit
    #[arg(long)]
    pub memory_snapshot: Option<PathBuf>,

    /// Capacity of the feature memory
    #[arg(long, default_value_t = 5000)]
    pub memory_capacity: usize,

    /// Depth increase (mm) tolerated before a remembered feature counts as occluded
    #[arg(long, default_value_t = 50)]
    pub occlusion_tolerance_mm: u16,
}
