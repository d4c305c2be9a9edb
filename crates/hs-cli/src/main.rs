//! `hypersweep`: run a hyperparameter search described by a JSON settings
//! file and print the winning trial for registration.

mod command;
mod demo;
mod settings;

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hs_optimizer::{LocalBackend, SearchScheduler, TrainingRoutine};

use crate::command::CommandRoutine;
use crate::demo::SyntheticRoutine;
use crate::settings::{resolve_path, RoutineSettings, Settings, CONFIG_ENV, OUTPUT_DIR_ENV};

fn routine(settings: &Settings) -> Arc<dyn TrainingRoutine> {
    match &settings.routine {
        RoutineSettings::Command { program, args } => Arc::new(CommandRoutine::new(
            program.clone(),
            args.clone(),
            settings.output_dir.clone(),
        )),
        RoutineSettings::Synthetic {
            epochs,
            epoch_delay_ms,
        } => Arc::new(SyntheticRoutine::new(
            *epochs,
            Duration::from_millis(*epoch_delay_ms),
            settings.output_dir.clone(),
        )),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let path = resolve_path(std::env::args().nth(1), std::env::var(CONFIG_ENV).ok());
    let settings =
        Settings::load(&path)?.with_output_dir_override(std::env::var(OUTPUT_DIR_ENV).ok());
    std::fs::create_dir_all(&settings.output_dir)
        .with_context(|| format!("creating {}", settings.output_dir.display()))?;

    let space = settings.space.clone().build()?;
    let backend = Arc::new(LocalBackend::from_arc(routine(&settings)));
    let scheduler = SearchScheduler::new(settings.search.clone(), space, backend)?;

    let stop = scheduler.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping search");
            stop.stop();
        }
    });

    let summary = scheduler.run().await?;
    let summary_path = settings.output_dir.join("summary.json");
    std::fs::write(&summary_path, serde_json::to_vec_pretty(&summary)?)
        .with_context(|| format!("writing {}", summary_path.display()))?;
    info!(path = %summary_path.display(), "search summary written");

    let best = scheduler.best_result()?;
    println!("{}", serde_json::to_string_pretty(&best)?);
    Ok(())
}
