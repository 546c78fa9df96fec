use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

mod config;
mod controller;
mod engine;
mod session;
mod trigger;

#[cfg(test)]
mod testing;

use config::Config;
use controller::{TokioSleeper, TriggerController};
use rollcall_core::OnnxEncoder;
use session::KioskSession;
use trigger::HttpTrigger;

#[tokio::main]
async fn main() -> Result<()> {
    // Session prompts go to stdout; keep logs on stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        camera = %config.camera_device,
        data_dir = %config.data_dir.display(),
        threshold = config.match_threshold,
        trigger = %config.trigger_read_url,
        "configuration loaded"
    );

    let encoder = OnnxEncoder::load(&config.model_dir)
        .with_context(|| format!("failed to load face models from {}", config.model_dir.display()))?;
    tracing::info!(model_dir = %config.model_dir.display(), "face models loaded");

    let transport = HttpTrigger::new(&config).context("failed to build trigger client")?;
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut session = KioskSession::new(&config, Box::new(encoder), stdin);
    let mut controller = TriggerController::new(transport, TokioSleeper, config.poll_interval());

    tracing::info!("rollcalld ready");

    tokio::select! {
        _ = controller.run(&mut session) => {
            tracing::info!("rollcalld shutting down");
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!(
                state = ?controller.state(),
                sessions = controller.sessions(),
                "interrupted; shutting down"
            );
        }
    }

    Ok(())
}
