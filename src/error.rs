//! Error types for the watermark engine.
//!
//! Every failure surfaced by the public API is a [`WatermarkError`] carrying
//! a numeric code, a category derived from the code's thousand-block, and a
//! severity. Diagnostic records serialize these fields so they can be posted
//! to a reporting endpoint as-is.
//!
//! Code partitions:
//! - 1000s configuration
//! - 1100s render
//! - 1200s instance
//! - 1300s security
//! - 1400s animation
//! - 1500s responsive
//! - 1600s event
//! - 1700s performance
//! - 1800s compatibility
//! - 1900s network
//! - 9999 unknown

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, WatermarkError>;

/// Error categories, one per code block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Config,
    Render,
    Instance,
    Security,
    Animation,
    Responsive,
    Event,
    Performance,
    Compatibility,
    Network,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Config => "config",
            Self::Render => "render",
            Self::Instance => "instance",
            Self::Security => "security",
            Self::Animation => "animation",
            Self::Responsive => "responsive",
            Self::Event => "event",
            Self::Performance => "performance",
            Self::Compatibility => "compatibility",
            Self::Network => "network",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// Error severity levels.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Numeric error codes, partitioned by category in thousand-blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    // 1000s: configuration
    InvalidConfig,
    ConfigValidationFailed,
    // 1100s: render
    RenderFailed,
    BackendUnsupported,
    ImageDecodeFailed,
    FontUnavailable,
    // 1200s: instance
    InstanceNotFound,
    InstanceCreationFailed,
    InstanceUpdateFailed,
    InstanceDestroyFailed,
    DuplicateInstance,
    InvalidContainer,
    InvalidState,
    // 1300s: security
    ProtectionFailed,
    ViolationDetected,
    WatcherFailed,
    // 1400s: animation
    AnimationFailed,
    AnimationNotFound,
    // 1500s: responsive
    ResponsiveFailed,
    InvalidBreakpoint,
    // 1600s: event
    EventDispatchFailed,
    EventTimeout,
    // 1700s: performance
    PerformanceDegraded,
    // 1800s: compatibility
    HostUnsupported,
    // 1900s: network
    ReportFailed,
    FetchFailed,
    // 9999
    UnknownError,
}

impl ErrorCode {
    /// Numeric wire value for this code.
    pub fn value(&self) -> u16 {
        match self {
            Self::InvalidConfig => 1001,
            Self::ConfigValidationFailed => 1002,
            Self::RenderFailed => 1101,
            Self::BackendUnsupported => 1102,
            Self::ImageDecodeFailed => 1103,
            Self::FontUnavailable => 1104,
            Self::InstanceNotFound => 1201,
            Self::InstanceCreationFailed => 1202,
            Self::InstanceUpdateFailed => 1203,
            Self::InstanceDestroyFailed => 1204,
            Self::DuplicateInstance => 1205,
            Self::InvalidContainer => 1206,
            Self::InvalidState => 1207,
            Self::ProtectionFailed => 1301,
            Self::ViolationDetected => 1302,
            Self::WatcherFailed => 1303,
            Self::AnimationFailed => 1401,
            Self::AnimationNotFound => 1402,
            Self::ResponsiveFailed => 1501,
            Self::InvalidBreakpoint => 1502,
            Self::EventDispatchFailed => 1601,
            Self::EventTimeout => 1602,
            Self::PerformanceDegraded => 1701,
            Self::HostUnsupported => 1801,
            Self::ReportFailed => 1901,
            Self::FetchFailed => 1902,
            Self::UnknownError => 9999,
        }
    }

    /// Category derived from the code's thousand-block.
    pub fn category(&self) -> ErrorCategory {
        match self.value() {
            1000..=1099 => ErrorCategory::Config,
            1100..=1199 => ErrorCategory::Render,
            1200..=1299 => ErrorCategory::Instance,
            1300..=1399 => ErrorCategory::Security,
            1400..=1499 => ErrorCategory::Animation,
            1500..=1599 => ErrorCategory::Responsive,
            1600..=1699 => ErrorCategory::Event,
            1700..=1799 => ErrorCategory::Performance,
            1800..=1899 => ErrorCategory::Compatibility,
            1900..=1999 => ErrorCategory::Network,
            _ => ErrorCategory::Unknown,
        }
    }

    /// Default severity used when a constructor does not override it.
    pub fn default_severity(&self) -> ErrorSeverity {
        match self {
            Self::InvalidConfig | Self::ConfigValidationFailed => ErrorSeverity::Medium,
            Self::RenderFailed | Self::InstanceCreationFailed | Self::InvalidContainer => {
                ErrorSeverity::High
            }
            Self::ViolationDetected => ErrorSeverity::High,
            Self::UnknownError => ErrorSeverity::Critical,
            Self::BackendUnsupported | Self::EventTimeout | Self::PerformanceDegraded => {
                ErrorSeverity::Low
            }
            _ => ErrorSeverity::Medium,
        }
    }
}

/// Central error type for the watermark engine.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("[{}] {message}", .code.value())]
pub struct WatermarkError {
    /// Human-readable message. For validation failures this aggregates every
    /// violation found, one per line.
    pub message: String,
    /// Numeric error code.
    pub code: ErrorCode,
    /// Severity of the failure.
    pub severity: ErrorSeverity,
    /// Extra key/value context attached at the failure site.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
}

impl WatermarkError {
    /// Create an error with the code's default severity.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code,
            severity: code.default_severity(),
            context: BTreeMap::new(),
        }
    }

    /// Override the severity.
    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    /// Attach a context entry.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Build a configuration error aggregating every violation found.
    ///
    /// Validation never reports just the first problem; callers get the full
    /// list in one shot.
    pub fn invalid_config(violations: Vec<String>) -> Self {
        let message = format!(
            "Configuration validation failed with {} violation(s):\n  - {}",
            violations.len(),
            violations.join("\n  - ")
        );
        Self::new(ErrorCode::InvalidConfig, message)
    }

    /// Category derived from the code.
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }
}
