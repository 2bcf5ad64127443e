use std::fmt;
use std::time::Duration;

use reqwest::Client;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Critical,
    High,
    Warning,
    Info,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operational alert emission.
///
/// Alerts are fire-and-forget: implementations must never block the caller
/// or propagate delivery failures into the data path.
pub trait AlertSink: Send + Sync {
    fn send(&self, severity: Severity, title: &str, message: &str, detail: &str);

    fn critical(&self, title: &str, message: &str, detail: &str) {
        self.send(Severity::Critical, title, message, detail);
    }

    fn warning(&self, title: &str, message: &str, detail: &str) {
        self.send(Severity::Warning, title, message, detail);
    }

    fn info(&self, title: &str, message: &str, detail: &str) {
        self.send(Severity::Info, title, message, detail);
    }
}

/// Log-only sink for development and for deployments without a SOC endpoint.
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn send(&self, severity: Severity, title: &str, message: &str, detail: &str) {
        info!(%severity, title, message, detail, "alert");
    }
}

#[derive(Debug, Clone)]
pub struct SocAlertConfig {
    pub endpoint: String,
    pub timeout: Duration,
    pub service: String,
    pub version: String,
}

/// Posts alerts to the configured SOC endpoint as JSON.
pub struct SocAlertClient {
    client: Client,
    config: SocAlertConfig,
}

impl SocAlertClient {
    pub fn new(config: SocAlertConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(config.timeout).build()?;
        info!(endpoint = %config.endpoint, "SOC alert client initialized");
        Ok(Self { client, config })
    }
}

impl AlertSink for SocAlertClient {
    fn send(&self, severity: Severity, title: &str, message: &str, detail: &str) {
        let payload = serde_json::json!({
            "service": self.config.service,
            "version": self.config.version,
            "severity": severity.as_str(),
            "title": title,
            "message": message,
            "details": { "details": detail },
            "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        });

        let request = self
            .client
            .post(&self.config.endpoint)
            .header("User-Agent", format!("{}/{}", self.config.service, self.config.version))
            .json(&payload);
        let title = title.to_string();

        tokio::spawn(async move {
            match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(title, "SOC alert sent");
                }
                Ok(resp) => {
                    warn!(title, status = %resp.status(), "SOC alert rejected");
                }
                Err(e) => {
                    warn!(title, error = %e, "failed to send SOC alert");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_strings() {
        assert_eq!(Severity::Critical.as_str(), "critical");
        assert_eq!(Severity::High.as_str(), "high");
        assert_eq!(Severity::Warning.as_str(), "warning");
        assert_eq!(Severity::Info.as_str(), "info");
    }
}
