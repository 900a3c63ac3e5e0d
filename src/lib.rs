// Aquamark watermark engine library

pub mod animation;
pub mod assets;
pub mod config;
pub mod core;
pub mod error;
pub mod error_manager;
pub mod events;
pub mod host;
pub mod instance;
pub mod logging;
pub mod render;
pub mod responsive;
pub mod security;

// Re-export the main types for convenience
pub use config::{
    AnimationConfig, AnimationKind, ConfigManager, ConfigPatch, LayoutConfig, RenderMode,
    ResponsiveConfig, SecurityConfig, SecurityLevel, StyleConfig, WatermarkConfig,
};
pub use core::{ContainerRef, CoreOptions, CreateOptions, UpdateOptions, WatermarkCore};
pub use error::{ErrorCategory, ErrorCode, ErrorSeverity, Result, WatermarkError};
pub use events::{EventManager, EventType, WatermarkEvent};
pub use instance::{InstanceQuery, LifecycleState, WatermarkInstance};
pub use security::{SecurityViolation, ViolationKind};
