//! Shared camera service CLI

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use facecam::config::Config;
use facecam::detect::{DetectionSink, LatestReportSink, LogSink};
use facecam::device::{CaptureDevice, Pattern, SimConfig, SimulatedDevice};
use facecam::format::{PixelFormat, StreamFormat};
use facecam::web::{self, AppState};
use facecam::{
    Camera, CameraGate, CameraSettings, DetectionCounters, DetectionSettings, DetectionTask,
    SkinToneDetector,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "facecam")]
#[command(about = "MJPEG streaming, still capture and face detection on one V4L2 camera")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// HTTP port, overrides server.port
    #[arg(short, long)]
    port: Option<u16>,

    /// Capture device, overrides camera.device
    #[arg(short, long)]
    device: Option<String>,

    /// Use the built-in simulated camera instead of a V4L2 device
    #[arg(long)]
    simulate: bool,

    /// Do not start the background face detector
    #[arg(long)]
    no_detection: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    fmt().with_env_filter(filter).with_target(false).init();

    info!("facecam starting");
    info!(config_path = %cli.config, "Loading configuration");

    let mut config = Config::load_or_default(&cli.config).context("Failed to load configuration")?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(device) = cli.device {
        config.camera.device = device;
    }
    if cli.no_detection {
        config.detection.enabled = false;
    }
    config.validate().context("Invalid configuration")?;

    info!(
        device = %config.camera.device,
        simulate = cli.simulate,
        detection = config.detection.enabled,
        "Configuration loaded"
    );

    let device = open_device(&config, cli.simulate)?;
    let gate = CameraGate::new(device);
    let camera = Arc::new(Camera::new(
        Arc::clone(&gate),
        CameraSettings::from(&config.camera),
    ));

    // Negotiate up front; a failure here is retried by the first request
    let prepare = Arc::clone(&camera);
    match tokio::task::spawn_blocking(move || prepare.prepare()).await? {
        Ok(format) => info!(format = %format, "Camera prepared"),
        Err(e) => warn!(error = %e, "Camera not ready yet"),
    }

    let counters = Arc::new(DetectionCounters::default());
    let latest = LatestReportSink::new();
    let latest_report = latest.shared();

    let mut detection = if config.detection.enabled {
        let mut sinks: Vec<Box<dyn DetectionSink>> = vec![Box::new(latest)];
        if config.detection.publish {
            sinks.push(Box::new(LogSink));
        }
        let settings = DetectionSettings::new(&config.detection, config.camera.resolution());
        let task = DetectionTask::start(
            Arc::clone(&gate),
            settings,
            Box::new(SkinToneDetector::default()),
            sinks,
            Arc::clone(&counters),
        )
        .context("Failed to start face detection")?;
        Some(task)
    } else {
        info!("Face detection disabled");
        None
    };

    let addr = config.server.socket_addr()?;
    let state = AppState::new(Arc::clone(&camera), counters, latest_report);

    tokio::select! {
        result = web::run_server(addr, state) => {
            if let Err(e) = &result {
                error!(error = %e, "Web server failed");
            }
            result?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutting down");
        }
    }

    if let Some(mut task) = detection.take() {
        let timeout = Duration::from_millis(config.detection.stop_timeout_ms);
        let stopped = tokio::task::spawn_blocking(move || task.stop(timeout)).await?;
        if !stopped {
            warn!("Face detection did not stop cleanly");
        }
    }

    Ok(())
}

fn open_device(config: &Config, simulate: bool) -> Result<Box<dyn CaptureDevice>> {
    if simulate {
        let (width, height) = config.camera.resolution().unwrap_or((640, 480));
        info!(width, height, "Using simulated camera");
        return Ok(Box::new(SimulatedDevice::new(SimConfig {
            initial_format: StreamFormat::new(width, height, PixelFormat::Raw10),
            frame_interval: Duration::from_millis(33),
            pattern: Pattern::Bars,
            ..SimConfig::default()
        })));
    }
    open_v4l2(config)
}

#[cfg(feature = "v4l2")]
fn open_v4l2(config: &Config) -> Result<Box<dyn CaptureDevice>> {
    let timeout = Duration::from_millis(config.camera.dequeue_timeout_ms);
    let device = facecam::device::V4l2Device::open(&config.camera.device, timeout)
        .with_context(|| format!("Failed to open {}", config.camera.device))?;
    Ok(Box::new(device))
}

#[cfg(not(feature = "v4l2"))]
fn open_v4l2(config: &Config) -> Result<Box<dyn CaptureDevice>> {
    anyhow::bail!(
        "cannot open {}: built without the `v4l2` feature, rebuild with --features v4l2 or run with --simulate",
        config.camera.device
    )
}
