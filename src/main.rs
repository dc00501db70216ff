use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use rgbd_registration::{
    CycleLogReader, FeatureMemory, InMemoryFeatureMemory, PoseEstimator, RegistrationConfig,
};

mod cli;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = cli::Args::parse();
    let config = RegistrationConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let mut estimator = PoseEstimator::from_config(&config)?;

    if config.parameters.enable_feature_memory {
        let memory = match &args.memory_snapshot {
            Some(path) if path.exists() => {
                let memory = InMemoryFeatureMemory::load_from_path(
                    path,
                    args.memory_capacity,
                    args.occlusion_tolerance_mm,
                )
                .with_context(|| format!("loading snapshot {}", path.display()))?;
                tracing::info!(features = memory.len(), "restored feature memory");
                memory
            }
            _ => InMemoryFeatureMemory::new(args.memory_capacity, args.occlusion_tolerance_mm),
        };
        estimator = estimator.with_feature_memory(memory);
    }

    let reader = CycleLogReader::open(&args.play_log)
        .with_context(|| format!("opening {}", args.play_log.display()))?;

    let started = Instant::now();
    let mut outcomes: BTreeMap<&'static str, usize> = BTreeMap::new();
    let mut cycles = 0usize;
    for record in reader {
        let mut record = record.with_context(|| format!("reading cycle {cycles}"))?;
        cycles += 1;
        let code = match estimator.update_from_features(&record.source, &mut record.reference) {
            Ok(_) => "accepted",
            Err(err) => err.code(),
        };
        *outcomes.entry(code).or_default() += 1;
    }

    println!(
        "{} replayed {cycles} cycles in {:?}",
        estimator.device_id(),
        started.elapsed()
    );
    for (code, count) in &outcomes {
        println!("  {code:<32} {count}");
    }
    if let Some(estimate) = estimator.last_estimate() {
        let p = estimate.position;
        println!(
            "last pose [{}]: ({:.3}, {:.3}, {:.3}) inliers={} err={:.3}px",
            estimate.frame_id, p.x, p.y, p.z, estimate.inlier_count, estimate.reprojection_error
        );
    }

    if let (Some(path), Some(memory)) = (&args.memory_snapshot, estimator.feature_memory()) {
        let mut snapshot =
            InMemoryFeatureMemory::new(args.memory_capacity, args.occlusion_tolerance_mm);
        for feature in memory.list_features() {
            snapshot.append(feature);
        }
        snapshot
            .save_to_path(path)
            .with_context(|| format!("writing snapshot {}", path.display()))?;
        tracing::info!(features = snapshot.len(), "saved feature memory");
    }
    Ok(())
}
