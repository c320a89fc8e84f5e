use anyhow::{anyhow, Context, Result};
use doorman_core::{Config, EmbeddingBuilder, EmbeddingStore, FaceAnalyzer, OnnxFaceAnalyzer, Snapshot};
use doorman_hw::Camera;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

mod door;
mod pipeline;
mod rebuild;
mod watcher;

use door::{DoorActions, DoorNotifier, EntryLog};
use pipeline::{Pipeline, PipelineContext, RunStats};
use rebuild::RebuildWorker;
use watcher::DatasetWatcher;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::load().context("loading configuration")?;
    tracing::info!(
        camera = %config.camera_device,
        dataset = %config.dataset_dir.display(),
        threshold = config.threshold,
        "doormand starting"
    );

    let result = run(config).await;
    match &result {
        Ok(()) => tracing::info!("doormand stopped"),
        Err(e) => tracing::error!(error = %format!("{e:#}"), "doormand failed"),
    }
    result
}

async fn run(config: Config) -> Result<()> {
    std::fs::create_dir_all(&config.dataset_dir)
        .with_context(|| format!("creating dataset directory {}", config.dataset_dir.display()))?;

    let load_analyzer = || {
        OnnxFaceAnalyzer::load(
            &config.scrfd_model_path(),
            &config.arcface_model_path(),
            config.detection_confidence,
        )
    };
    let live = load_analyzer().context("loading face models")?;
    let mut background = load_analyzer().context("loading face models for rebuilds")?;
    tracing::info!(model_dir = %config.model_dir.display(), "face models loaded");

    let builder = EmbeddingBuilder::new(config.augment);
    let store = Arc::new(EmbeddingStore::new(Snapshot::empty()));
    match Snapshot::restore(&config.cache_path, background.model_version()) {
        Ok(snapshot) => {
            store.replace(snapshot);
        }
        Err(e) => {
            tracing::warn!(error = %e, "embedding cache unusable; building from dataset");
            rebuild::rebuild(
                &store,
                &builder,
                &mut background,
                &config.dataset_dir,
                &config.cache_path,
            )
            .context("building embedding store")?;
        }
    }
    {
        let snapshot = store.read();
        tracing::info!(
            embeddings = snapshot.len(),
            identities = ?snapshot.identities(),
            "authorized set ready"
        );
    }

    // From here on, every resource stops itself on drop, so early returns
    // still release the watcher and worker threads.
    let mut worker = RebuildWorker::spawn(
        Arc::clone(&store),
        builder,
        background,
        config.dataset_dir.clone(),
        config.cache_path.clone(),
        Duration::from_millis(config.rebuild_debounce_ms),
    )
    .context("spawning rebuild worker")?;
    let trigger = worker.trigger();
    let mut watcher = DatasetWatcher::start(
        &config.dataset_dir,
        std::slice::from_ref(&config.cache_path),
        move || trigger.fire(),
    )
    .context("starting dataset watcher")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let object_store = doorman_cloud::configured_store(
        config.firebase_bucket.as_deref(),
        config.firebase_token.as_deref(),
        config.object_store_dir.as_deref(),
    )
    .context("configuring object store")?;
    let sync = object_store.map(|remote| {
        tracing::info!(interval_secs = config.sync_interval_secs, "dataset sync enabled");
        tokio::spawn(doorman_cloud::run_periodic(
            remote,
            config.dataset_dir.clone(),
            Duration::from_secs(config.sync_interval_secs),
            shutdown_rx,
        ))
    });

    let door = DoorNotifier::new(
        &config.door_url,
        Duration::from_millis(config.door_timeout_ms),
        Duration::from_secs(config.door_cooldown_secs),
        tokio::runtime::Handle::current(),
    )
    .context("creating door notifier")?;
    let handler = DoorActions::new(door, EntryLog::new(&config.entries_dir));
    let ctx = Arc::new(PipelineContext::new(
        Arc::clone(&store),
        config.threshold,
        Box::new(handler),
    ));

    let stop = Arc::new(AtomicBool::new(false));
    let mut capture = {
        let config = config.clone();
        let stop = Arc::clone(&stop);
        tokio::task::spawn_blocking(move || run_capture(&config, live, ctx, &stop))
    };

    let finished = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                tracing::warn!(error = %e, "signal handler failed");
            }
            tracing::info!("shutdown requested");
            None
        }
        res = &mut capture => Some(res),
    };

    // Cleanup runs on every path out of the capture loop.
    stop.store(true, Ordering::Relaxed);
    let outcome = match finished {
        Some(res) => res,
        None => capture.await,
    };
    watcher.stop();
    worker.stop();
    let _ = shutdown_tx.send(true);
    if let Some(task) = sync {
        let _ = task.await;
    }

    let stats = outcome.map_err(|e| anyhow!("capture thread failed: {e}"))??;
    tracing::info!(
        frames = stats.frames,
        processed = stats.processed,
        dropped = stats.dropped,
        dark = stats.dark,
        "capture loop finished"
    );
    Ok(())
}

/// Open the camera and run the pipeline until `stop` is set. The camera
/// handle lives on this thread and is released when it returns.
fn run_capture(
    config: &Config,
    analyzer: OnnxFaceAnalyzer,
    ctx: Arc<PipelineContext>,
    stop: &AtomicBool,
) -> Result<RunStats> {
    let camera = Camera::open(&config.camera_device, config.frame_width, config.frame_height)
        .with_context(|| format!("opening camera {}", config.camera_device))?;
    tracing::info!(
        device = %camera.device_path,
        width = camera.width,
        height = camera.height,
        fourcc = ?camera.fourcc,
        "camera opened"
    );
    let mut stream = camera.stream().context("starting capture stream")?;

    let mut pipeline = Pipeline::new(ctx, analyzer)
        .with_mirror(config.mirror)
        .with_max_capture_failures(config.max_capture_failures);
    Ok(pipeline.run(&mut stream, stop)?)
}
