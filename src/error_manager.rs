//! Central error sink.
//!
//! `handle` builds a structured report, updates counters, appends to the
//! bounded history, logs at a severity-mapped level, dispatches to
//! category handlers, attempts the recovery strategy registered for the
//! error code, and optionally POSTs the report to a configured endpoint
//! with duplicate suppression. Nothing in this module ever propagates an
//! error out of `handle`; total failure degrades to a logged fallback.

use crate::error::{ErrorCategory, ErrorCode, ErrorSeverity, Result, WatermarkError};
use crate::host::EnvironmentSnapshot;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the error manager.
#[derive(Debug, Clone)]
pub struct ErrorManagerConfig {
    /// Log handled errors through tracing (default: true).
    pub log_errors: bool,
    /// Bounded history capacity (default: 100).
    pub max_history: usize,
    /// Optional HTTP endpoint reports are POSTed to as JSON.
    pub report_endpoint: Option<String>,
    /// Window within which repeats of the same code are suppressed.
    pub dedup_window: Duration,
    /// Maximum reports for one code inside the window.
    pub max_reports_per_window: usize,
}

impl Default for ErrorManagerConfig {
    fn default() -> Self {
        Self {
            log_errors: true,
            max_history: 100,
            report_endpoint: None,
            dedup_window: Duration::from_secs(60),
            max_reports_per_window: 3,
        }
    }
}

/// Structured, serializable error report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub error: WatermarkError,
    /// Numeric wire code, duplicated out of the error for consumers that
    /// only read the envelope.
    pub code: u16,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentSnapshot>,
}

/// Aggregate statistics, recomputed from counters on demand.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorStats {
    pub total_errors: u64,
    pub by_category: BTreeMap<String, u64>,
    pub by_severity: BTreeMap<String, u64>,
    pub recovered: u64,
    pub unrecovered: u64,
    pub recovery_rate: f64,
}

type Handler = Arc<dyn Fn(&WatermarkError) -> Result<()> + Send + Sync>;
type RecoveryStrategy = Arc<dyn Fn(&WatermarkError) -> bool + Send + Sync>;

#[derive(Default)]
struct Counters {
    total: u64,
    by_category: BTreeMap<ErrorCategory, u64>,
    by_severity: BTreeMap<ErrorSeverity, u64>,
    recovered: u64,
    unrecovered: u64,
}

/// Central sink for every error the engine captures.
pub struct ErrorManager {
    config: ErrorManagerConfig,
    handlers: RwLock<HashMap<ErrorCategory, Vec<Handler>>>,
    strategies: RwLock<HashMap<ErrorCode, RecoveryStrategy>>,
    history: Mutex<VecDeque<ErrorReport>>,
    counters: Mutex<Counters>,
    environment: RwLock<Option<EnvironmentSnapshot>>,
    http_client: Option<reqwest::Client>,
}

impl ErrorManager {
    pub fn new(config: ErrorManagerConfig) -> Self {
        let http_client = config.report_endpoint.as_ref().map(|_| {
            reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default()
        });
        Self {
            config,
            handlers: RwLock::new(HashMap::new()),
            strategies: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            counters: Mutex::new(Counters::default()),
            environment: RwLock::new(None),
            http_client,
        }
    }

    /// Set the environment snapshot stamped onto reports.
    pub fn set_environment(&self, env: EnvironmentSnapshot) {
        *self.environment.write() = Some(env);
    }

    /// Register a handler for one error category.
    pub fn register_handler<F>(&self, category: ErrorCategory, handler: F)
    where
        F: Fn(&WatermarkError) -> Result<()> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .entry(category)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Register a recovery strategy for one error code. The strategy
    /// returns whether recovery succeeded.
    pub fn register_recovery_strategy<F>(&self, code: ErrorCode, strategy: F)
    where
        F: Fn(&WatermarkError) -> bool + Send + Sync + 'static,
    {
        self.strategies.write().insert(code, Arc::new(strategy));
    }

    /// Remove the recovery strategy for a code.
    pub fn unregister_recovery_strategy(&self, code: ErrorCode) -> bool {
        self.strategies.write().remove(&code).is_some()
    }

    /// Handle an error end to end. Returns whether a recovery strategy
    /// reported success. Never fails.
    pub async fn handle(&self, error: WatermarkError) -> bool {
        let report = ErrorReport {
            code: error.code.value(),
            category: error.category(),
            severity: error.severity,
            timestamp: Utc::now(),
            environment: self.environment.read().clone(),
            error: error.clone(),
        };

        self.record(&report);

        if self.config.log_errors {
            log_error(&error);
        }

        self.run_handlers(&error);
        let recovered = self.attempt_recovery(&error);

        {
            let mut counters = self.counters.lock();
            if recovered {
                counters.recovered += 1;
            } else {
                counters.unrecovered += 1;
            }
        }

        if self.should_report(&report) {
            self.send_report(&report).await;
        }

        recovered
    }

    fn record(&self, report: &ErrorReport) {
        let mut counters = self.counters.lock();
        counters.total += 1;
        *counters.by_category.entry(report.category).or_insert(0) += 1;
        *counters.by_severity.entry(report.severity).or_insert(0) += 1;
        drop(counters);

        let mut history = self.history.lock();
        history.push_back(report.clone());
        while history.len() > self.config.max_history {
            history.pop_front();
        }
    }

    fn run_handlers(&self, error: &WatermarkError) {
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .get(&error.category())
            .map(|hs| hs.to_vec())
            .unwrap_or_default();

        for handler in handlers {
            if let Err(handler_error) = handler(error) {
                tracing::warn!(
                    category = %error.category(),
                    error = %handler_error,
                    "Error handler failed"
                );
            }
        }
    }

    fn attempt_recovery(&self, error: &WatermarkError) -> bool {
        let strategy = self.strategies.read().get(&error.code).cloned();
        let Some(strategy) = strategy else {
            return false;
        };

        // A strategy is embedder code; shield the manager from panics.
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| strategy(error))) {
            Ok(recovered) => recovered,
            Err(_) => {
                tracing::error!(code = error.code.value(), "Recovery strategy panicked");
                false
            }
        }
    }

    fn should_report(&self, report: &ErrorReport) -> bool {
        if self.config.report_endpoint.is_none() || report.severity == ErrorSeverity::Low {
            return false;
        }

        // Duplicate suppression: same code within the window
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.dedup_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let history = self.history.lock();
        let recent_same_code = history
            .iter()
            .filter(|r| r.code == report.code && r.timestamp >= cutoff)
            .count();

        // The current report is already in history
        recent_same_code <= self.config.max_reports_per_window
    }

    async fn send_report(&self, report: &ErrorReport) {
        let (Some(endpoint), Some(client)) =
            (self.config.report_endpoint.as_ref(), self.http_client.as_ref())
        else {
            return;
        };

        match client.post(endpoint).json(report).send().await {
            Ok(response) if !response.status().is_success() => {
                tracing::warn!(
                    status = %response.status(),
                    "Error report rejected by endpoint"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Failed to send error report");
            }
        }
    }

    /// Statistics recomputed from counters.
    pub fn stats(&self) -> ErrorStats {
        let counters = self.counters.lock();
        let recovery_rate = if counters.total > 0 {
            counters.recovered as f64 / counters.total as f64
        } else {
            0.0
        };
        ErrorStats {
            total_errors: counters.total,
            by_category: counters
                .by_category
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            by_severity: counters
                .by_severity
                .iter()
                .map(|(k, v)| (format!("{k:?}").to_lowercase(), *v))
                .collect(),
            recovered: counters.recovered,
            unrecovered: counters.unrecovered,
            recovery_rate,
        }
    }

    /// Recent reports, oldest first.
    pub fn history(&self) -> Vec<ErrorReport> {
        self.history.lock().iter().cloned().collect()
    }

    /// Drop history and reset counters.
    pub fn reset(&self) {
        self.history.lock().clear();
        *self.counters.lock() = Counters::default();
    }
}

impl Default for ErrorManager {
    fn default() -> Self {
        Self::new(ErrorManagerConfig::default())
    }
}

fn log_error(error: &WatermarkError) {
    let code = error.code.value();
    let category = error.category().to_string();
    match error.severity {
        ErrorSeverity::Critical | ErrorSeverity::High => {
            tracing::error!(code, category = %category, "{}", error.message);
        }
        ErrorSeverity::Medium => {
            tracing::warn!(code, category = %category, "{}", error.message);
        }
        ErrorSeverity::Low => {
            tracing::info!(code, category = %category, "{}", error.message);
        }
    }
}
