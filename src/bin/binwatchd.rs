//! binwatchd - detection video feed daemon
//!
//! Serves the control page and the annotated video feed, logs sampled
//! detections with a GPS or IP-derived location, and forwards them to the
//! dashboard.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use binwatch::config::{BinwatchConfig, DetectorSettings};
use binwatch::detect::{MotionBackend, StubBackend};
use binwatch::{ApiServer, AppContext, BackendRegistry, DashboardClient, HttpLocationResolver};

#[derive(Parser, Debug)]
#[command(author, version, about = "Detection video feed with geotagged event logging")]
struct Args {
    /// JSON configuration file
    #[arg(long, env = "BINWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides the configuration
    #[arg(long)]
    addr: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = BinwatchConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.api_addr = addr;
    }

    let detectors = build_detectors(&config.detector)?;
    log::info!(
        "detector backends: {:?} (default {})",
        detectors.list(),
        detectors.default_name().unwrap_or("none")
    );

    let locator = Arc::new(HttpLocationResolver::new(config.geo.clone()));
    let dashboard = Arc::new(DashboardClient::new(config.dashboard.clone()));
    log::info!("forwarding detections to {}", dashboard.endpoint());

    let ctx = Arc::new(AppContext::new(config, locator, dashboard, detectors)?);
    let api_handle = ApiServer::new(ctx.clone()).spawn()?;
    log::info!(
        "binwatchd running on http://{} (uploads in {})",
        api_handle.addr,
        ctx.config.upload_dir.display()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;

    log::info!("binwatchd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping streams and API server...");
    ctx.sessions.stop_all();
    api_handle.stop()?;

    Ok(())
}

fn build_detectors(settings: &DetectorSettings) -> Result<BackendRegistry> {
    let mut registry = BackendRegistry::new();
    registry.register(MotionBackend::new());
    registry.register(StubBackend::new());

    #[cfg(feature = "backend-tract")]
    if let Some(model_path) = &settings.model_path {
        use binwatch::detect::{LabelMap, TractBackend, YoloParams};
        use binwatch::DetectorBackend;

        let labels = match &settings.labels_path {
            Some(path) => LabelMap::load(path)?,
            None => LabelMap::default(),
        };
        let params = YoloParams {
            input_size: settings.input_size,
            confidence: settings.confidence,
            iou: settings.iou,
            ..YoloParams::default()
        };
        let mut backend = TractBackend::new(model_path, params, labels)?;
        backend.warm_up()?;
        registry.register(backend);
    }

    if registry.get(&settings.backend).is_none() {
        return Err(anyhow!(
            "detector backend '{}' is not available (tract needs the backend-tract feature and a model_path)",
            settings.backend
        ));
    }
    registry.set_default(&settings.backend)?;
    Ok(registry)
}
