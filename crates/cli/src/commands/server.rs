//! Server and maintenance commands

use anyhow::{bail, Result};
use colored::Colorize;
use serde::Serialize;

use crate::client::DaemonClient;
use crate::output::{print_info, print_json, print_list, print_success, print_warning, OutputFormat, TableDisplay};
use wgpeer_common::{DriftReport, DriftType, ServerConfig};

#[derive(Serialize)]
pub struct DriftDisplay {
    pub public_key: String,
    pub drift: String,
}

impl From<DriftReport> for DriftDisplay {
    fn from(report: DriftReport) -> Self {
        let drift = match report.drift_type {
            DriftType::MissingFromConfig => "registered, missing from config",
            DriftType::MissingFromInterface => "registered, missing from interface",
            DriftType::OrphanInConfig => "in config, not registered",
            DriftType::OrphanInInterface => "on interface, not registered",
        };
        Self {
            public_key: report.public_key,
            drift: drift.to_string(),
        }
    }
}

impl TableDisplay for DriftDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Public Key", "Drift"]
    }

    fn row(&self) -> Vec<String> {
        vec![self.public_key.clone(), self.drift.clone()]
    }
}

/// Client-side tunnel settings advertised by the server
#[derive(Serialize)]
pub struct ServerConfigDisplay {
    pub public_key: String,
    pub endpoint: String,
    pub allowed_ips: String,
    pub dns_server: String,
}

impl From<ServerConfig> for ServerConfigDisplay {
    fn from(config: ServerConfig) -> Self {
        Self {
            public_key: config.public_key,
            endpoint: config.endpoint.unwrap_or_else(|| "-".to_string()),
            allowed_ips: config.allowed_ips,
            dns_server: config.dns_server.unwrap_or_else(|| "-".to_string()),
        }
    }
}

impl TableDisplay for ServerConfigDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Public Key", "Endpoint", "Allowed IPs", "DNS"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.public_key.clone(),
            self.endpoint.clone(),
            self.allowed_ips.clone(),
            self.dns_server.clone(),
        ]
    }
}

/// Compare store, config document and interface
pub async fn check(client: DaemonClient, format: OutputFormat) -> Result<()> {
    let report = client.check().await?;
    if matches!(format, OutputFormat::Json) {
        print_json(&report);
        return Ok(());
    }

    print_info(&format!(
        "store {} / config {} / interface {} peers",
        report.store_peers, report.config_peers, report.interface_peers
    ));
    if report.is_consistent() {
        print_success("All three stores agree");
        return Ok(());
    }

    print_warning(&format!("{} drifted keys; run `wgpeer repair` to resync", report.drift.len()));
    let displays: Vec<DriftDisplay> = report.drift.into_iter().map(DriftDisplay::from).collect();
    print_list(&displays, format);
    Ok(())
}

/// Rebuild the config document and interface from the store
pub async fn repair(client: DaemonClient, format: OutputFormat) -> Result<()> {
    let report = client.repair().await?;
    match format {
        OutputFormat::Json => print_json(&report),
        _ => print_success(&format!(
            "Resynced {} peers, cleared {} inconsistency events",
            report.peers, report.cleared_events
        )),
    }
    Ok(())
}

pub async fn status(client: DaemonClient, addr: &str, format: OutputFormat) -> Result<()> {
    let Some(health) = client.health().await else {
        bail!("cannot reach daemon at {}", addr);
    };
    if matches!(format, OutputFormat::Json) {
        print_json(&health);
    } else if health.healthy {
        println!("{} Daemon is running at {}", "●".green(), addr);
    } else {
        println!(
            "{} Daemon at {} is unhealthy: {}",
            "●".red(),
            addr,
            health.store_error.as_deref().unwrap_or("unknown")
        );
    }
    if health.pending_inconsistencies > 0 && !matches!(format, OutputFormat::Json) {
        print_warning(&format!("{} pending inconsistency events", health.pending_inconsistencies));
    }
    if !health.healthy {
        std::process::exit(1);
    }
    Ok(())
}

pub async fn config(client: DaemonClient, format: OutputFormat) -> Result<()> {
    let config = ServerConfigDisplay::from(client.server_config().await?);
    crate::output::print_item(&config, format);
    Ok(())
}

pub async fn info(client: DaemonClient, format: OutputFormat) -> Result<()> {
    let info = client.server_info().await?;
    match format {
        OutputFormat::Json => print_json(&info),
        _ => {
            println!("{} {}", "Uptime:".bold(), info.uptime);
            println!("{} {}", "Load:  ".bold(), info.load);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drift_display() {
        let display = DriftDisplay::from(DriftReport {
            public_key: "stray".to_string(),
            drift_type: DriftType::OrphanInInterface,
        });
        assert_eq!(display.row(), vec!["stray", "on interface, not registered"]);
    }

    #[test]
    fn test_server_config_placeholders() {
        let display = ServerConfigDisplay::from(ServerConfig {
            public_key: "pub".to_string(),
            endpoint: None,
            allowed_ips: "0.0.0.0/0, ::/0".to_string(),
            dns_server: None,
        });
        assert_eq!(display.endpoint, "-");
        assert_eq!(display.dns_server, "-");
    }
}
