//! app.toml configuration parser.
//!
//! An app manifest names the application and selects one of three scaling
//! modes. Every per-mode field is optional in the file; `scaling_params`
//! resolves the manifest into fully-defaulted parameter structs that the
//! pool variants consume directly.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub app: AppSection,
    pub scaling: Option<ScalingMode>,
    /// Opt-in request services. Listing "warmup" lets automatic pools send
    /// a warmup request to freshly started instances.
    pub inbound_services: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSection {
    pub name: String,
    pub version: Option<String>,
}

/// Scaling mode as written in the manifest. Tagged by `mode`, so a file
/// reads `[scaling] mode = "manual"` with the mode's fields alongside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ScalingMode {
    Automatic {
        min_pending_latency: Option<String>,
        max_pending_latency: Option<String>,
        min_idle_instances: Option<usize>,
        max_idle_instances: Option<usize>,
    },
    Manual {
        instances: Option<usize>,
    },
    Basic {
        max_instances: Option<usize>,
        idle_timeout: Option<String>,
    },
}

/// Fully-resolved scaling parameters, one variant per mode.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalingParams {
    Automatic(AutomaticParams),
    Manual(ManualParams),
    Basic(BasicParams),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AutomaticParams {
    pub min_pending_latency: Duration,
    pub max_pending_latency: Duration,
    pub min_idle_instances: usize,
    pub max_idle_instances: usize,
}

impl Default for AutomaticParams {
    fn default() -> Self {
        AutomaticParams {
            min_pending_latency: Duration::from_millis(100),
            max_pending_latency: Duration::from_millis(500),
            min_idle_instances: 1,
            max_idle_instances: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManualParams {
    pub instances: usize,
}

impl Default for ManualParams {
    fn default() -> Self {
        ManualParams { instances: 1 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BasicParams {
    pub max_instances: usize,
    pub idle_timeout: Duration,
}

impl Default for BasicParams {
    fn default() -> Self {
        BasicParams {
            max_instances: 1,
            idle_timeout: Duration::from_secs(15 * 60),
        }
    }
}

impl AppConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// True if the manifest lists "warmup" under inbound services.
    pub fn warmup_enabled(&self) -> bool {
        self.inbound_services
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .any(|s| s == "warmup")
    }

    /// Resolve the manifest's scaling section into concrete parameters.
    /// A missing section means automatic scaling with all defaults.
    pub fn scaling_params(&self) -> ScalingParams {
        match &self.scaling {
            None => ScalingParams::Automatic(AutomaticParams::default()),
            Some(ScalingMode::Automatic {
                min_pending_latency,
                max_pending_latency,
                min_idle_instances,
                max_idle_instances,
            }) => {
                let defaults = AutomaticParams::default();
                ScalingParams::Automatic(AutomaticParams {
                    min_pending_latency: min_pending_latency
                        .as_deref()
                        .map(|s| parse_latency(s, defaults.min_pending_latency))
                        .unwrap_or(defaults.min_pending_latency),
                    max_pending_latency: max_pending_latency
                        .as_deref()
                        .map(|s| parse_latency(s, defaults.max_pending_latency))
                        .unwrap_or(defaults.max_pending_latency),
                    min_idle_instances: min_idle_instances.unwrap_or(defaults.min_idle_instances),
                    max_idle_instances: max_idle_instances.unwrap_or(defaults.max_idle_instances),
                })
            }
            Some(ScalingMode::Manual { instances }) => {
                let defaults = ManualParams::default();
                ScalingParams::Manual(ManualParams {
                    instances: instances.unwrap_or(defaults.instances),
                })
            }
            Some(ScalingMode::Basic {
                max_instances,
                idle_timeout,
            }) => {
                let defaults = BasicParams::default();
                ScalingParams::Basic(BasicParams {
                    max_instances: max_instances.unwrap_or(defaults.max_instances),
                    idle_timeout: idle_timeout
                        .as_deref()
                        .map(|s| parse_idle_timeout(s, defaults.idle_timeout))
                        .unwrap_or(defaults.idle_timeout),
                })
            }
        }
    }
}

/// Parse a pending-latency string like "0.1s" or "250ms".
pub fn parse_latency(s: &str, default: Duration) -> Duration {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        parse_nonneg(ms)
            .map(|v| Duration::from_secs_f64(v / 1000.0))
            .unwrap_or(default)
    } else if let Some(secs) = s.strip_suffix('s') {
        parse_nonneg(secs)
            .map(Duration::from_secs_f64)
            .unwrap_or(default)
    } else {
        default
    }
}

/// Parse an idle-timeout string like "90s" or "15m".
pub fn parse_idle_timeout(s: &str, default: Duration) -> Duration {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().map(Duration::from_secs).unwrap_or(default)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .map(|v| Duration::from_secs(v * 60))
            .unwrap_or(default)
    } else {
        default
    }
}

fn parse_nonneg(s: &str) -> Option<f64> {
    s.parse::<f64>().ok().filter(|v| v.is_finite() && *v >= 0.0)
}
