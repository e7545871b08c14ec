mod app;
mod board;
mod config;
mod data;
mod memory;
mod monitor;
mod sampler;
mod schedule;
mod self_memory;
mod trend;

use anyhow::Context;
use app::{OverlayApp, RepaintSink};
use config::Config;
use crossbeam_channel::bounded;
use egui::ViewportBuilder;
use memory::{MemoryAccounting, MemoryReconciler, NvidiaSmi};
use monitor::NvmlSession;
use sampler::SamplerHandle;
use std::sync::{Arc, OnceLock};

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

fn main() -> anyhow::Result<()> {
    init_logging();

    let config = Config::from_env().context("Invalid configuration")?;

    let alternate = if config.alternate_memory {
        NvidiaSmi::detect().map(|smi| Box::new(smi) as Box<dyn MemoryAccounting>)
    } else {
        None
    };
    let reconciler = MemoryReconciler::new(alternate);

    let (sender, receiver) = bounded(100);
    let ctx_slot = Arc::new(OnceLock::new());
    let sampler = SamplerHandle::spawn(
        NvmlSession::initialize,
        reconciler,
        RepaintSink::new(sender, Arc::clone(&ctx_slot)),
        config.sample_interval,
    )
    .context("GPU monitoring is unavailable")?;
    log::info!("Sampling every {} ms", config.sample_interval.as_millis());

    let native_options = eframe::NativeOptions {
        viewport: ViewportBuilder::default()
            .with_title("GPU Monitor")
            .with_inner_size([640.0, 140.0])
            .with_always_on_top(),
        ..Default::default()
    };

    eframe::run_native(
        "GPU Overlay",
        native_options,
        Box::new(move |cc| {
            Ok(Box::new(OverlayApp::new(cc, &config, receiver, sampler, ctx_slot)))
        }),
    )
    .map_err(|e| anyhow::anyhow!("Failed to open overlay window: {e}"))?;

    Ok(())
}
