use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config;

#[derive(Parser, Debug)]
#[command(name = "framecast")]
#[command(version = "0.2.0")]
#[command(about = "Point-to-point raw video streaming", long_about = None)]
pub struct Args {
    /// Role to run as
    #[command(subcommand)]
    pub role: RoleCommand,

    /// Configuration file path
    #[arg(short, long, default_value = "framecast.toml")]
    pub config: PathBuf,

    /// Signaling address (host:port), overrides config
    #[arg(short, long)]
    pub signaling: Option<String>,

    /// Frame width
    #[arg(long)]
    pub width: Option<u32>,

    /// Frame height
    #[arg(long)]
    pub height: Option<u32>,

    /// Target frame rate
    #[arg(long)]
    pub fps: Option<u32>,

    /// Capture device index
    #[arg(short, long)]
    pub device: Option<u32>,

    /// Directory to save received frames into
    #[arg(long)]
    pub save_dir: Option<String>,

    /// Disable the timestamp overlay
    #[arg(long, action)]
    pub no_overlay: bool,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleCommand {
    /// Capture frames and stream them to the receiving peer
    Send,
    /// Accept a stream and render the received frames
    Recv,
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        config::Config::load(&self.config)
    }

    /// Fold command-line overrides into a loaded configuration.
    pub fn apply_overrides(&self, config: &mut config::Config) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(signaling) = &self.signaling {
            let (host, port) = signaling
                .rsplit_once(':')
                .ok_or("Signaling address must be in host:port format")?;
            config.signaling.host = host.to_string();
            config.signaling.port = port.parse()?;
        }
        if let Some(width) = self.width {
            config.video.width = width;
        }
        if let Some(height) = self.height {
            config.video.height = height;
        }
        if let Some(fps) = self.fps {
            config.video.fps = fps;
        }
        if let Some(device) = self.device {
            config.capture.device = device;
        }
        if let Some(save_dir) = &self.save_dir {
            config.render.save_dir = Some(save_dir.clone());
        }
        if self.no_overlay {
            config.render.overlay = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_apply_in_place() {
        let args = Args::parse_from([
            "framecast", "-s", "10.0.0.5:9000", "--fps", "15", "--no-overlay", "send",
        ]);
        assert_eq!(args.role, RoleCommand::Send);

        let mut cfg = config::Config::default();
        args.apply_overrides(&mut cfg).unwrap();
        assert_eq!(cfg.signaling.host, "10.0.0.5");
        assert_eq!(cfg.signaling.port, 9000);
        assert_eq!(cfg.video.fps, 15);
        assert!(!cfg.render.overlay);
    }

    #[test]
    fn bad_signaling_override_is_rejected() {
        let args = Args::parse_from(["framecast", "-s", "no-port-here", "recv"]);
        let mut cfg = config::Config::default();
        assert!(args.apply_overrides(&mut cfg).is_err());
    }
}
