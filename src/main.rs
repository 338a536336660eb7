//! framecast - Main entry point
//!
//! Runs one streaming session in the role picked on the command line and
//! reports how it ended.

use framecast::args::{Args, RoleCommand};
use framecast::capture;
use framecast::config::Config;
use framecast::overlay::{FrameAnnotator, OverlayCorner, TimestampOverlay};
use framecast::render::{FrameSink, NullSink, PngDirSink};
use framecast::session::SessionSupervisor;
use clap::Parser;
use log::{error, info, warn};
use std::path::Path;
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::new()
        .parse_filters(&std::env::var("FRAMECAST_LOG").unwrap_or_else(|_| log_level.to_string()))
        .init();

    info!("framecast v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = match args.load_config() {
        Ok(cfg) => {
            info!("Loaded configuration from {:?}", args.config);
            cfg
        }
        Err(e) => {
            warn!("Failed to load config: {}, using defaults", e);
            Config::default()
        }
    };

    // Apply command line overrides
    args.apply_overrides(&mut config)?;
    config.validate()?;

    let supervisor = Arc::new(SessionSupervisor::new());
    info!("Session id: {}", supervisor.session_id());

    // Tear the session down on Ctrl+C
    {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            let _ = signal::ctrl_c().await;
            info!("Shutdown signal received");
            supervisor.shutdown();
        });
    }

    let result = match args.role {
        RoleCommand::Send => {
            let source = capture::create_source(&config.capture, &config.video)?;
            let annotator: Option<Box<dyn FrameAnnotator>> = if config.render.overlay {
                Some(Box::new(TimestampOverlay::new(OverlayCorner::TopLeft)))
            } else {
                None
            };
            supervisor.run_sender(&config, source, annotator).await
        }
        RoleCommand::Recv => {
            let sink: Box<dyn FrameSink> = match &config.render.save_dir {
                Some(dir) => Box::new(PngDirSink::new(Path::new(dir))?),
                None => Box::new(NullSink::default()),
            };
            let annotator: Option<Box<dyn FrameAnnotator>> = if config.render.overlay {
                Some(Box::new(TimestampOverlay::new(OverlayCorner::BottomLeft)))
            } else {
                None
            };
            supervisor.run_receiver(&config, sink, annotator).await
        }
    };

    match result {
        Ok(report) => {
            info!("{}", report);
            Ok(())
        }
        Err(e) => {
            error!("Session failed: {}", e);
            Err(e.into())
        }
    }
}
