//! Configuration management for framecast

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Signaling configuration
    #[serde(default)]
    pub signaling: SignalingConfig,

    /// Media transport configuration
    #[serde(default)]
    pub media: MediaConfig,

    /// Video configuration
    #[serde(default)]
    pub video: VideoConfig,

    /// Capture configuration
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Pipeline configuration
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Render configuration
    #[serde(default)]
    pub render: RenderConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Signaling bind/dial address
    pub host: String,

    /// Signaling port
    pub port: u16,

    /// Seconds allowed for the whole handshake
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
}

impl SignalingConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            handshake_timeout_secs: default_handshake_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Media listener bind address (sending side)
    pub bind_host: String,

    /// Media listener port, 0 picks a free port
    pub port: u16,

    /// Host advertised to the peer when it differs from bind_host
    #[serde(default)]
    pub advertise_host: Option<String>,
}

impl MediaConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }

    pub fn advertised_host(&self) -> String {
        self.advertise_host
            .clone()
            .unwrap_or_else(|| self.bind_host.clone())
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            port: 0,
            advertise_host: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    /// Frame width in pixels
    pub width: u32,

    /// Frame height in pixels
    pub height: u32,

    /// Target frame rate
    pub fps: u32,

    /// Pixel format ("rgb24" or "bgr24")
    pub format: String,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            format: "rgb24".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Capture backend ("pattern")
    pub source: String,

    /// Device index, seeds the test pattern
    pub device: u32,

    /// Run the source behind a dedicated capture thread
    #[serde(default)]
    pub threaded: bool,

    /// Queue depth between the capture thread and the pipeline
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: "pattern".to_string(),
            device: 0,
            threaded: false,
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Frame queue depth between pipelines and transport
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Seconds the consumer waits for a frame before counting a timeout
    #[serde(default = "default_receive_timeout_secs")]
    pub receive_timeout_secs: u64,

    /// Consecutive failures tolerated before the pipeline stops
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,

    /// Milliseconds per capture attempt inside one frame slot
    #[serde(default = "default_capture_wait_ms")]
    pub capture_wait_ms: u64,

    /// Capture attempts per frame slot before synthesizing a filler
    #[serde(default = "default_capture_retries")]
    pub capture_retries: u32,

    /// Frames between latency summaries
    #[serde(default = "default_stats_interval")]
    pub stats_interval: u64,
}

impl PipelineConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.receive_timeout_secs)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            receive_timeout_secs: default_receive_timeout_secs(),
            error_threshold: default_error_threshold(),
            capture_wait_ms: default_capture_wait_ms(),
            capture_retries: default_capture_retries(),
            stats_interval: default_stats_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Directory to save received frames into; unset renders nowhere
    #[serde(default)]
    pub save_dir: Option<String>,

    /// Draw the timestamp overlay
    #[serde(default = "default_overlay")]
    pub overlay: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            save_dir: None,
            overlay: default_overlay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.video.width == 0 || self.video.height == 0 {
            return Err("Video dimensions must be non-zero".into());
        }

        if self.video.width > u16::MAX as u32 || self.video.height > u16::MAX as u32 {
            return Err("Video dimensions must fit in 16 bits".into());
        }

        if self.video.fps == 0 {
            return Err("Video fps must be non-zero".into());
        }

        if crate::frame::PixelFormat::parse(&self.video.format).is_none() {
            return Err("Video format must be \"rgb24\" or \"bgr24\"".into());
        }

        if self.signaling.host.is_empty() {
            return Err("Signaling host must not be empty".into());
        }

        if self.signaling.handshake_timeout_secs == 0 {
            return Err("Signaling handshake timeout must be non-zero".into());
        }

        if self.pipeline.queue_capacity == 0 || self.capture.queue_capacity == 0 {
            return Err("Queue capacities must be non-zero".into());
        }

        if self.pipeline.receive_timeout_secs == 0 {
            return Err("Pipeline receive timeout must be non-zero".into());
        }

        if self.pipeline.error_threshold == 0 {
            return Err("Pipeline error threshold must be non-zero".into());
        }

        if self.capture.source != "pattern" {
            return Err("Capture source must be \"pattern\" in this build".into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn validate_rejects_invalid_dimensions() {
        let mut cfg = Config::default();
        cfg.video.width = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_unknown_format() {
        let mut cfg = Config::default();
        cfg.video.format = "yuv420p".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn advertised_host_falls_back_to_bind_host() {
        let mut cfg = Config::default();
        assert_eq!(cfg.media.advertised_host(), "127.0.0.1");
        cfg.media.advertise_host = Some("198.51.100.7".to_string());
        assert_eq!(cfg.media.advertised_host(), "198.51.100.7");
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [video]
            width = 1280
            height = 720
            fps = 60
            format = "bgr24"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.video.width, 1280);
        assert_eq!(cfg.signaling.port, 8080);
        assert_eq!(cfg.pipeline.error_threshold, 10);
        assert!(cfg.validate().is_ok());
    }
}

fn default_handshake_timeout_secs() -> u64 {
    30
}

fn default_queue_capacity() -> usize {
    10
}

fn default_receive_timeout_secs() -> u64 {
    5
}

fn default_error_threshold() -> u32 {
    10
}

fn default_capture_wait_ms() -> u64 {
    10
}

fn default_capture_retries() -> u32 {
    10
}

fn default_stats_interval() -> u64 {
    30
}

fn default_overlay() -> bool {
    true
}
