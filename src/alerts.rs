// =============================================================================
// Alert sink — bounded ring of operational alerts for the dashboard
// =============================================================================

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{error, info, warn};

/// Maximum number of recent alerts to retain.
const MAX_RECENT_ALERTS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertLevel {
    Info,
    Warn,
    Critical,
}

/// A recorded alert event.
#[derive(Debug, Clone, Serialize)]
pub struct AlertRecord {
    pub level: AlertLevel,
    pub message: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Thread-safe alert buffer.  Everything also goes to tracing so that log
/// aggregation sees it without polling the API.
pub struct Alerts {
    recent: RwLock<Vec<AlertRecord>>,
}

impl Alerts {
    pub fn new() -> Self {
        Self {
            recent: RwLock::new(Vec::new()),
        }
    }

    pub fn push(&self, level: AlertLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            AlertLevel::Info => info!(alert = %message, "alert"),
            AlertLevel::Warn => warn!(alert = %message, "alert"),
            AlertLevel::Critical => error!(alert = %message, "alert"),
        }

        let mut recent = self.recent.write();
        recent.push(AlertRecord {
            level,
            message,
            at: Utc::now().to_rfc3339(),
        });
        if recent.len() > MAX_RECENT_ALERTS {
            let excess = recent.len() - MAX_RECENT_ALERTS;
            recent.drain(0..excess);
        }
    }

    pub fn list(&self) -> Vec<AlertRecord> {
        self.recent.read().clone()
    }

    pub fn len(&self) -> usize {
        self.recent.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.read().is_empty()
    }
}

impl Default for Alerts {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Alerts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Alerts").field("len", &self.len()).finish()
    }
}
