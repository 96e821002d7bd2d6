//! CLI override definitions and application logic.

use clap::Parser;

use crate::Config;
use crate::types::MetricsConfig;

#[derive(Debug, Clone, Parser, Default)]
pub struct CliOverrides {
    /// Override log level (trace/debug/info/warn/error)
    #[arg(long)]
    pub log_level: Option<String>,
    /// Override log format (pretty/compact/json)
    #[arg(long)]
    pub log_format: Option<String>,
    /// Override metrics listen address, e.g. 127.0.0.1:9100
    #[arg(long)]
    pub metrics_addr: Option<String>,
    /// Override maximum concurrent connections for every service (0 = unlimited)
    #[arg(long)]
    pub max_connections: Option<usize>,
}

pub fn apply_overrides(config: &mut Config, overrides: &CliOverrides) {
    if let Some(v) = &overrides.log_level {
        config.log.level = Some(v.clone());
    }
    if let Some(v) = &overrides.log_format {
        config.log.format = Some(v.clone());
    }
    if let Some(v) = &overrides.metrics_addr {
        config.metrics = Some(MetricsConfig { addr: v.clone() });
    }
    if let Some(v) = overrides.max_connections {
        let limit = (v > 0).then_some(v);
        for svc in &mut config.services {
            svc.max_connections = limit;
        }
    }
}
