use anyhow::{Context as _, Result};
use lookout_core::analysis::{self, OnnxAnalyzer};
use lookout_core::Greetings;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

mod config;
mod context;
mod dbus_interface;
mod engine;
mod notifier;
mod settings;

use config::{BusKind, Config};
use context::AppContext;
use dbus_interface::{LookoutService, BUS_NAME, OBJECT_PATH};
use engine::{Pipeline, PipelineParts};
use notifier::{GreetingSink, Notifier};

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "lookoutd starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        base_dir = %config.storage.base_dir.display(),
        tolerance = config.recognition.tolerance,
        bus = ?config.dbus.bus,
        "configuration loaded"
    );

    let analyzer = OnnxAnalyzer::load(&config.recognition.model_dir).with_context(|| {
        format!(
            "failed to load face models from {}",
            config.recognition.model_dir.display()
        )
    })?;
    let ctx = Arc::new(AppContext::build(config, analysis::shared(analyzer))?);
    tracing::info!(known = ctx.gallery.current().len(), "gallery loaded");

    let sink = GreetingSink::from_command(ctx.config.greeting_command());
    let sink_name = sink.describe();
    let notifier = Notifier::spawn(sink);
    let sender = notifier
        .sender()
        .context("notification channel closed before startup finished")?;

    let mut source = lookout_hw::camera::open(&ctx.config.source_spec())
        .context("failed to open frame source")?;
    lookout_hw::camera::warm_up(source.as_mut(), ctx.config.camera.warmup_frames)
        .context("camera warm-up failed")?;
    let camera = source.describe();
    tracing::info!(camera = %camera, sink = %sink_name, "frame source ready");

    let pipeline = Pipeline::new(PipelineParts {
        gallery: ctx.gallery.clone(),
        tolerance: ctx.config.recognition.tolerance,
        cooldown: ctx.config.cooldown(),
        greetings: Greetings::new(
            ctx.config.greeting.template.clone(),
            ctx.config.greeting.custom.clone(),
        ),
        capture_threshold: ctx.config.recognition.capture_threshold,
        capture_margin: ctx.config.recognition.capture_margin,
        capture_message: ctx.config.greeting.capture_message.clone(),
        store: ctx.store.clone(),
        notifications: sender,
    });
    let engine = engine::spawn_engine(
        source,
        ctx.analyzer.clone(),
        pipeline,
        ctx.settings.clone(),
        ctx.frames.clone(),
    );

    let service = LookoutService::new(
        ctx.clone(),
        tokio::runtime::Handle::current(),
        camera,
        sink_name,
    );
    let builder = match ctx.config.dbus.bus {
        BusKind::System => zbus::connection::Builder::system()?,
        BusKind::Session => zbus::connection::Builder::session()?,
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register D-Bus service")?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "lookoutd ready");

    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;
    tokio::select! {
        _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        _ = sigint.recv() => tracing::info!("received SIGINT"),
    }

    tracing::info!("lookoutd shutting down");
    tokio::task::spawn_blocking(move || engine.shutdown())
        .await
        .context("engine shutdown task failed")?;
    notifier.shutdown(ctx.config.drain_timeout()).await;
    tracing::info!("lookoutd stopped");

    Ok(())
}
