//! Watermark configuration types.
//!
//! This module defines the full watermark configuration including:
//! - Content (text and/or image reference)
//! - Style, layout and animation settings
//! - Security and responsive sub-configs
//!
//! Configuration is immutable input: `validate` turns a partial patch into a
//! fully defaulted [`WatermarkConfig`] or rejects it with every violation
//! found, and `merge` produces a new config without touching the base.

use crate::error::{Result, WatermarkError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// Default values
fn default_font_size() -> f32 {
    16.0
}

fn default_font_family() -> String {
    "sans-serif".to_string()
}

fn default_font_weight() -> String {
    "normal".to_string()
}

fn default_color() -> String {
    "#000000".to_string()
}

fn default_opacity() -> f32 {
    0.15
}

fn default_rotation() -> f32 {
    -22.0
}

fn default_gap() -> u32 {
    100
}

fn default_z_index() -> i32 {
    9999
}

fn default_true() -> bool {
    true
}

fn default_duration_ms() -> u64 {
    3000
}

fn default_easing() -> String {
    "ease-in-out".to_string()
}

fn default_style_poll_ms() -> u64 {
    1000
}

fn default_devtools_poll_ms() -> u64 {
    500
}

fn default_devtools_hit_threshold() -> u32 {
    3
}

fn default_devtools_delta_px() -> u32 {
    160
}

fn default_violation_history() -> usize {
    256
}

fn default_debounce_ms() -> u64 {
    300
}

fn default_min_width() -> u32 {
    480
}

fn default_min_height() -> u32 {
    320
}

fn default_strategies() -> Vec<AdaptiveStrategyKind> {
    vec![AdaptiveStrategyKind::Scale]
}

/// Which backend renders the watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    /// One positioned node per grid cell.
    #[default]
    Tree,
    /// Whole grid drawn into a single pixel surface.
    Raster,
    /// Whole grid emitted as one structured-markup node.
    Vector,
}

impl RenderMode {
    /// Stable tag used in element markers and diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tree => "tree",
            Self::Raster => "raster",
            Self::Vector => "vector",
        }
    }
}

/// Image reference inside watermark content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Source URL. `https://` and `mem://` (preloaded) sources are accepted.
    pub src: String,

    /// Display width in pixels (natural width if unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,

    /// Display height in pixels (natural height if unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,

    /// Opacity override for the image (inherits style opacity if unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opacity: Option<f32>,
}

/// Watermark content: text, an image, or both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ContentConfig {
    /// Text content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Image content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageRef>,
}

impl ContentConfig {
    /// True when neither text nor image is present.
    pub fn is_empty(&self) -> bool {
        self.text.as_deref().map_or(true, |t| t.trim().is_empty()) && self.image.is_none()
    }
}

/// Visual style applied to every watermark item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleConfig {
    /// Font size in pixels (default: 16)
    #[serde(default = "default_font_size")]
    pub font_size: f32,

    /// Font family (default: "sans-serif")
    #[serde(default = "default_font_family")]
    pub font_family: String,

    /// Font weight keyword or numeric string (default: "normal")
    #[serde(default = "default_font_weight")]
    pub font_weight: String,

    /// Text color as hex string (default: "#000000")
    #[serde(default = "default_color")]
    pub color: String,

    /// Opacity from 0.0 (transparent) to 1.0 (opaque) (default: 0.15)
    #[serde(default = "default_opacity")]
    pub opacity: f32,

    /// Rotation angle in degrees (default: -22)
    #[serde(default = "default_rotation")]
    pub rotation: f32,

    /// Optional blend mode hint forwarded to the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blend_mode: Option<String>,
}

impl Default for StyleConfig {
    fn default() -> Self {
        Self {
            font_size: default_font_size(),
            font_family: default_font_family(),
            font_weight: default_font_weight(),
            color: default_color(),
            opacity: default_opacity(),
            rotation: default_rotation(),
            blend_mode: None,
        }
    }
}

/// Grid layout for repeated watermark items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutConfig {
    /// Horizontal gap between items in pixels (default: 100)
    #[serde(default = "default_gap")]
    pub gap_x: u32,

    /// Vertical gap between items in pixels (default: 100)
    #[serde(default = "default_gap")]
    pub gap_y: u32,

    /// Horizontal offset of the whole grid (default: 0)
    #[serde(default)]
    pub offset_x: i32,

    /// Vertical offset of the whole grid (default: 0)
    #[serde(default)]
    pub offset_y: i32,

    /// Fixed row count; computed from container height if unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u32>,

    /// Fixed column count; computed from container width if unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u32>,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            gap_x: default_gap(),
            gap_y: default_gap(),
            offset_x: 0,
            offset_y: 0,
            rows: None,
            cols: None,
        }
    }
}

/// Declarative animation kinds supported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AnimationKind {
    #[default]
    None,
    Fade,
    Move,
    Scale,
    Rotate,
    Bounce,
    Pulse,
    Swing,
}

/// Playback direction for animations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PlaybackDirection {
    #[default]
    Normal,
    Reverse,
    Alternate,
    AlternateReverse,
}

/// Fill behavior after an animation completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FillMode {
    None,
    #[default]
    Forwards,
    Backwards,
    Both,
}

/// Animation settings for an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimationConfig {
    /// Animation kind (default: none)
    #[serde(default)]
    pub kind: AnimationKind,

    /// Duration of one iteration in milliseconds (default: 3000)
    #[serde(default = "default_duration_ms")]
    pub duration_ms: u64,

    /// Delay before the first iteration in milliseconds (default: 0)
    #[serde(default)]
    pub delay_ms: u64,

    /// Iteration count; `None` means infinite
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,

    /// Playback direction (default: normal)
    #[serde(default)]
    pub direction: PlaybackDirection,

    /// Fill mode (default: forwards)
    #[serde(default)]
    pub fill: FillMode,

    /// Easing keyword passed to the host driver (default: "ease-in-out")
    #[serde(default = "default_easing")]
    pub easing: String,
}

impl Default for AnimationConfig {
    fn default() -> Self {
        Self {
            kind: AnimationKind::None,
            duration_ms: default_duration_ms(),
            delay_ms: 0,
            iterations: None,
            direction: PlaybackDirection::Normal,
            fill: FillMode::Forwards,
            easing: default_easing(),
        }
    }
}

/// Protection levels for the security manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    /// No protection
    Off,
    /// Structural-removal watching only
    #[default]
    Basic,
    /// Adds style-tamper and console-activity watching
    Intermediate,
    /// Adds devtools heuristics, network watching and identity obfuscation
    Advanced,
}

/// Security settings for an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Protection level (default: basic)
    #[serde(default)]
    pub level: SecurityLevel,

    /// Interval for the style-tamper poll watcher in ms (default: 1000)
    #[serde(default = "default_style_poll_ms")]
    pub style_poll_interval_ms: u64,

    /// Interval for the devtools heuristic poll in ms (default: 500)
    #[serde(default = "default_devtools_poll_ms")]
    pub devtools_poll_interval_ms: u64,

    /// Consecutive positive devtools polls required before a violation is
    /// reported (default: 3)
    #[serde(default = "default_devtools_hit_threshold")]
    pub devtools_hit_threshold: u32,

    /// Outer/inner window delta treated as a devtools hit (default: 160)
    #[serde(default = "default_devtools_delta_px")]
    pub devtools_delta_px: u32,

    /// Ring-buffer capacity for the violation history (default: 256)
    #[serde(default = "default_violation_history")]
    pub violation_history: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            level: SecurityLevel::Basic,
            style_poll_interval_ms: default_style_poll_ms(),
            devtools_poll_interval_ms: default_devtools_poll_ms(),
            devtools_hit_threshold: default_devtools_hit_threshold(),
            devtools_delta_px: default_devtools_delta_px(),
            violation_history: default_violation_history(),
        }
    }
}

/// Named viewport width range for responsive overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub name: String,
    pub min_width: u32,
    /// Open-ended when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_width: Option<u32>,
}

/// Per-breakpoint configuration override slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BreakpointOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<ContentConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<StylePatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<LayoutPatch>,
}

/// Adaptive strategies applied on container changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdaptiveStrategyKind {
    /// Scale items to fit narrow containers
    Scale,
    /// Tighten grid density on small viewports
    Reflow,
    /// Hide below the configured minimum container size
    Hide,
}

/// Responsive settings for an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsiveConfig {
    /// Enable responsive adaptation (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Debounce applied to resize bursts in ms (default: 300)
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Custom breakpoint table; the built-in table is used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<Vec<Breakpoint>>,

    /// Override slices keyed by breakpoint name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub breakpoints: BTreeMap<String, BreakpointOverride>,

    /// Adaptive strategies, applied in order (default: [scale])
    #[serde(default = "default_strategies")]
    pub strategies: Vec<AdaptiveStrategyKind>,

    /// Containers narrower than this are auto-hidden by the hide strategy
    #[serde(default = "default_min_width")]
    pub min_width: u32,

    /// Containers shorter than this are auto-hidden by the hide strategy
    #[serde(default = "default_min_height")]
    pub min_height: u32,
}

impl Default for ResponsiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            debounce_ms: default_debounce_ms(),
            table: None,
            breakpoints: BTreeMap::new(),
            strategies: default_strategies(),
            min_width: default_min_width(),
            min_height: default_min_height(),
        }
    }
}

/// Fully populated watermark configuration.
///
/// Produced by [`ConfigManager::validate`]; every field carries a concrete
/// value. Updates never mutate a config in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatermarkConfig {
    #[serde(default)]
    pub content: ContentConfig,
    #[serde(default)]
    pub style: StyleConfig,
    #[serde(default)]
    pub layout: LayoutConfig,
    #[serde(default)]
    pub animation: AnimationConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub responsive: ResponsiveConfig,
    #[serde(default)]
    pub render_mode: RenderMode,
    #[serde(default = "default_true")]
    pub visible: bool,
    #[serde(default = "default_z_index")]
    pub z_index: i32,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            content: ContentConfig::default(),
            style: StyleConfig::default(),
            layout: LayoutConfig::default(),
            animation: AnimationConfig::default(),
            security: SecurityConfig::default(),
            responsive: ResponsiveConfig::default(),
            render_mode: RenderMode::default(),
            visible: true,
            z_index: default_z_index(),
        }
    }
}

/// Partial style override used by patches and breakpoint slices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StylePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_size: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_family: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_weight: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opacity: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blend_mode: Option<String>,
}

impl StylePatch {
    /// Apply this patch on top of a base style, returning the merged style.
    pub fn apply(&self, base: &StyleConfig) -> StyleConfig {
        StyleConfig {
            font_size: self.font_size.unwrap_or(base.font_size),
            font_family: self
                .font_family
                .clone()
                .unwrap_or_else(|| base.font_family.clone()),
            font_weight: self
                .font_weight
                .clone()
                .unwrap_or_else(|| base.font_weight.clone()),
            color: self.color.clone().unwrap_or_else(|| base.color.clone()),
            opacity: self.opacity.unwrap_or(base.opacity),
            rotation: self.rotation.unwrap_or(base.rotation),
            blend_mode: self.blend_mode.clone().or_else(|| base.blend_mode.clone()),
        }
    }
}

/// Partial layout override used by patches and breakpoint slices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LayoutPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gap_x: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gap_y: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset_x: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset_y: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u32>,
}

impl LayoutPatch {
    /// Apply this patch on top of a base layout, returning the merged layout.
    pub fn apply(&self, base: &LayoutConfig) -> LayoutConfig {
        LayoutConfig {
            gap_x: self.gap_x.unwrap_or(base.gap_x),
            gap_y: self.gap_y.unwrap_or(base.gap_y),
            offset_x: self.offset_x.unwrap_or(base.offset_x),
            offset_y: self.offset_y.unwrap_or(base.offset_y),
            rows: self.rows.or(base.rows),
            cols: self.cols.or(base.cols),
        }
    }
}

/// Partial configuration accepted by `create` and `update`.
///
/// Object-valued sections merge recursively; scalar and array values
/// replace the base wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<ContentConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<StylePatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<LayoutPatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub animation: Option<AnimationConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<SecurityConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responsive: Option<ResponsiveConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render_mode: Option<RenderMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visible: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_index: Option<i32>,
}

impl ConfigPatch {
    /// Patch carrying only text content.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: Some(ContentConfig {
                text: Some(text.into()),
                image: None,
            }),
            ..Self::default()
        }
    }
}

/// Validates and merges watermark configuration. Pure, no I/O.
#[derive(Debug, Default)]
pub struct ConfigManager;

impl ConfigManager {
    /// Validate a candidate patch against the defaults.
    ///
    /// On success the returned config is fully populated. On failure the
    /// candidate is discarded entirely; the error lists every violation.
    pub fn validate(patch: &ConfigPatch) -> Result<WatermarkConfig> {
        let merged = Self::merge(&WatermarkConfig::default(), patch);
        Self::check(&merged)?;
        Ok(merged)
    }

    /// Validate an already-assembled config, collecting all violations.
    pub fn check(config: &WatermarkConfig) -> Result<()> {
        let mut violations = Vec::new();

        if config.content.is_empty() {
            violations.push("content must provide non-empty text or an image".to_string());
        }

        if let Some(image) = &config.content.image {
            if image.src.is_empty() {
                violations.push("content.image.src cannot be empty".to_string());
            } else if !image.src.starts_with("https://") && !image.src.starts_with("mem://") {
                violations.push(format!(
                    "content.image.src must start with https:// or mem://, got '{}'",
                    image.src
                ));
            }
            if image.width == Some(0) {
                violations.push("content.image.width must be positive".to_string());
            }
            if image.height == Some(0) {
                violations.push("content.image.height must be positive".to_string());
            }
            if let Some(opacity) = image.opacity {
                if !opacity.is_finite() || !(0.0..=1.0).contains(&opacity) {
                    violations.push(format!(
                        "content.image.opacity must be a finite value between 0.0 and 1.0, got {}",
                        opacity
                    ));
                }
            }
        }

        if !config.style.opacity.is_finite() || !(0.0..=1.0).contains(&config.style.opacity) {
            violations.push(format!(
                "style.opacity must be a finite value between 0.0 and 1.0, got {}",
                config.style.opacity
            ));
        }

        if !config.style.rotation.is_finite() || !(-360.0..=360.0).contains(&config.style.rotation)
        {
            violations.push(format!(
                "style.rotation must be between -360 and 360 degrees, got {}",
                config.style.rotation
            ));
        }

        if !config.style.font_size.is_finite()
            || config.style.font_size < 1.0
            || config.style.font_size > 512.0
        {
            violations.push(format!(
                "style.font_size must be between 1 and 512 pixels, got {}",
                config.style.font_size
            ));
        }

        if let Err(reason) = check_hex_color(&config.style.color) {
            violations.push(format!("style.color: {}", reason));
        }

        if config.layout.gap_x == 0 {
            violations.push("layout.gap_x must be positive".to_string());
        }
        if config.layout.gap_y == 0 {
            violations.push("layout.gap_y must be positive".to_string());
        }
        if config.layout.rows == Some(0) {
            violations.push("layout.rows must be positive when set".to_string());
        }
        if config.layout.cols == Some(0) {
            violations.push("layout.cols must be positive when set".to_string());
        }

        if config.animation.kind != AnimationKind::None && config.animation.duration_ms == 0 {
            violations.push("animation.duration_ms must be positive".to_string());
        }

        if config.security.devtools_hit_threshold == 0 {
            violations.push("security.devtools_hit_threshold must be at least 1".to_string());
        }
        if config.security.violation_history == 0 {
            violations.push("security.violation_history must be at least 1".to_string());
        }

        if config.responsive.enabled && config.responsive.debounce_ms == 0 {
            violations.push("responsive.debounce_ms must be positive when enabled".to_string());
        }

        if let Some(table) = &config.responsive.table {
            violations.extend(check_breakpoint_table(table));
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(WatermarkError::invalid_config(violations))
        }
    }

    /// Deep-merge a patch onto a base config, returning a new config.
    ///
    /// Sub-config sections merge field-by-field where the patch type is
    /// partial; whole-section patches (animation, security, responsive)
    /// replace the base section, matching the array/primitive replacement
    /// rule.
    pub fn merge(base: &WatermarkConfig, patch: &ConfigPatch) -> WatermarkConfig {
        WatermarkConfig {
            content: merge_content(&base.content, patch.content.as_ref()),
            style: patch
                .style
                .as_ref()
                .map(|p| p.apply(&base.style))
                .unwrap_or_else(|| base.style.clone()),
            layout: patch
                .layout
                .as_ref()
                .map(|p| p.apply(&base.layout))
                .unwrap_or_else(|| base.layout.clone()),
            animation: patch
                .animation
                .clone()
                .unwrap_or_else(|| base.animation.clone()),
            security: patch
                .security
                .clone()
                .unwrap_or_else(|| base.security.clone()),
            responsive: patch
                .responsive
                .clone()
                .unwrap_or_else(|| base.responsive.clone()),
            render_mode: patch.render_mode.unwrap_or(base.render_mode),
            visible: patch.visible.unwrap_or(base.visible),
            z_index: patch.z_index.unwrap_or(base.z_index),
        }
    }

    /// True when the patch would change anything the renderer consumes.
    pub fn has_rendering_changes(old: &WatermarkConfig, new: &WatermarkConfig) -> bool {
        old.content != new.content
            || old.style != new.style
            || old.layout != new.layout
            || old.render_mode != new.render_mode
            || old.visible != new.visible
            || old.z_index != new.z_index
    }

    /// True when the animation section changed.
    pub fn has_animation_changes(old: &WatermarkConfig, new: &WatermarkConfig) -> bool {
        old.animation != new.animation
    }

    /// True when the security section changed.
    pub fn has_security_changes(old: &WatermarkConfig, new: &WatermarkConfig) -> bool {
        old.security != new.security
    }

    /// True when the responsive section changed.
    pub fn has_responsive_changes(old: &WatermarkConfig, new: &WatermarkConfig) -> bool {
        old.responsive != new.responsive
    }
}

fn merge_content(base: &ContentConfig, patch: Option<&ContentConfig>) -> ContentConfig {
    match patch {
        None => base.clone(),
        Some(p) => ContentConfig {
            text: p.text.clone().or_else(|| base.text.clone()),
            image: p.image.clone().or_else(|| base.image.clone()),
        },
    }
}

/// Validate a hex color string (#RGB or #RRGGBB).
fn check_hex_color(color: &str) -> std::result::Result<(), String> {
    let Some(hex_part) = color.strip_prefix('#') else {
        return Err(format!(
            "must be a hex string starting with '#', got '{}'",
            color
        ));
    };
    let len = hex_part.len();
    if (len != 3 && len != 6) || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!(
            "must be in #RGB or #RRGGBB format with valid hex characters, got '{}'",
            color
        ));
    }
    Ok(())
}

/// Validate a custom breakpoint table for ordering and overlap.
fn check_breakpoint_table(table: &[Breakpoint]) -> Vec<String> {
    let mut violations = Vec::new();

    for bp in table {
        if bp.name.is_empty() {
            violations.push("responsive.table: breakpoint name cannot be empty".to_string());
        }
        if let Some(max) = bp.max_width {
            if max < bp.min_width {
                violations.push(format!(
                    "responsive.table: breakpoint '{}' has max_width {} below min_width {}",
                    bp.name, max, bp.min_width
                ));
            }
        }
    }

    for pair in table.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        if b.min_width <= a.min_width {
            violations.push(format!(
                "responsive.table: breakpoints '{}' and '{}' are not in ascending min_width order",
                a.name, b.name
            ));
        } else if a.max_width.map_or(true, |max| max >= b.min_width) {
            violations.push(format!(
                "responsive.table: breakpoint '{}' overlaps '{}'",
                a.name, b.name
            ));
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fully_populated() {
        let config = ConfigManager::validate(&ConfigPatch::text("Watermark")).unwrap();
        assert_eq!(config.style.font_size, 16.0);
        assert_eq!(config.style.color, "#000000");
        assert_eq!(config.style.opacity, 0.15);
        assert_eq!(config.style.rotation, -22.0);
        assert_eq!(config.layout.gap_x, 100);
        assert_eq!(config.layout.gap_y, 100);
        assert_eq!(config.render_mode, RenderMode::Tree);
        assert_eq!(config.security.level, SecurityLevel::Basic);
        assert!(!config.responsive.enabled);
        assert_eq!(config.animation.kind, AnimationKind::None);
        assert!(config.visible);
        assert_eq!(config.z_index, 9999);
    }

    #[test]
    fn test_validate_rejects_empty_content() {
        let result = ConfigManager::validate(&ConfigPatch::default());
        let err = result.unwrap_err();
        assert!(err.message.contains("content"));
    }

    #[test]
    fn test_validate_rejects_whitespace_only_text() {
        let result = ConfigManager::validate(&ConfigPatch::text("   "));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_aggregates_all_violations() {
        let patch = ConfigPatch {
            content: Some(ContentConfig::default()),
            style: Some(StylePatch {
                opacity: Some(1.5),
                color: Some("red".to_string()),
                rotation: Some(400.0),
                ..StylePatch::default()
            }),
            layout: Some(LayoutPatch {
                gap_x: Some(0),
                ..LayoutPatch::default()
            }),
            ..ConfigPatch::default()
        };
        let err = ConfigManager::validate(&patch).unwrap_err();
        assert!(err.message.contains("5 violation(s)"), "{}", err.message);
        assert!(err.message.contains("content"));
        assert!(err.message.contains("opacity"));
        assert!(err.message.contains("style.color"));
        assert!(err.message.contains("rotation"));
        assert!(err.message.contains("gap_x"));
    }

    #[test]
    fn test_validate_nan_opacity() {
        let patch = ConfigPatch {
            style: Some(StylePatch {
                opacity: Some(f32::NAN),
                ..StylePatch::default()
            }),
            ..ConfigPatch::text("Test")
        };
        let err = ConfigManager::validate(&patch).unwrap_err();
        assert!(err.message.contains("finite"));
    }

    #[test]
    fn test_validate_short_hex_ok() {
        let patch = ConfigPatch {
            style: Some(StylePatch {
                color: Some("#FFF".to_string()),
                ..StylePatch::default()
            }),
            ..ConfigPatch::text("Test")
        };
        assert!(ConfigManager::validate(&patch).is_ok());
    }

    #[test]
    fn test_validate_invalid_hex_length() {
        let patch = ConfigPatch {
            style: Some(StylePatch {
                color: Some("#FFFFF".to_string()),
                ..StylePatch::default()
            }),
            ..ConfigPatch::text("Test")
        };
        let err = ConfigManager::validate(&patch).unwrap_err();
        assert!(err.message.contains("#RGB or #RRGGBB"));
    }

    #[test]
    fn test_validate_image_source_scheme() {
        let patch = ConfigPatch {
            content: Some(ContentConfig {
                text: None,
                image: Some(ImageRef {
                    src: "http://example.com/logo.png".to_string(),
                    width: None,
                    height: None,
                    opacity: None,
                }),
            }),
            ..ConfigPatch::default()
        };
        let err = ConfigManager::validate(&patch).unwrap_err();
        assert!(err.message.contains("https://"));
    }

    #[test]
    fn test_validate_breakpoint_ordering() {
        let patch = ConfigPatch {
            responsive: Some(ResponsiveConfig {
                enabled: true,
                table: Some(vec![
                    Breakpoint {
                        name: "wide".to_string(),
                        min_width: 800,
                        max_width: None,
                    },
                    Breakpoint {
                        name: "narrow".to_string(),
                        min_width: 0,
                        max_width: Some(799),
                    },
                ]),
                ..ResponsiveConfig::default()
            }),
            ..ConfigPatch::text("Test")
        };
        let err = ConfigManager::validate(&patch).unwrap_err();
        assert!(err.message.contains("ascending"));
    }

    #[test]
    fn test_validate_breakpoint_overlap() {
        let patch = ConfigPatch {
            responsive: Some(ResponsiveConfig {
                enabled: true,
                table: Some(vec![
                    Breakpoint {
                        name: "a".to_string(),
                        min_width: 0,
                        max_width: Some(600),
                    },
                    Breakpoint {
                        name: "b".to_string(),
                        min_width: 500,
                        max_width: None,
                    },
                ]),
                ..ResponsiveConfig::default()
            }),
            ..ConfigPatch::text("Test")
        };
        let err = ConfigManager::validate(&patch).unwrap_err();
        assert!(err.message.contains("overlaps"));
    }

    #[test]
    fn test_merge_deep_merges_style() {
        let base = ConfigManager::validate(&ConfigPatch::text("Base")).unwrap();
        let patch = ConfigPatch {
            style: Some(StylePatch {
                font_size: Some(24.0),
                color: Some("#FF0000".to_string()),
                ..StylePatch::default()
            }),
            ..ConfigPatch::default()
        };
        let merged = ConfigManager::merge(&base, &patch);

        assert_eq!(merged.style.font_size, 24.0);
        assert_eq!(merged.style.color, "#FF0000");
        // Untouched style fields keep base values
        assert_eq!(merged.style.opacity, base.style.opacity);
        // Other sections untouched
        assert_eq!(merged.content.text.as_deref(), Some("Base"));
        assert_eq!(merged.layout, base.layout);
    }

    #[test]
    fn test_merge_does_not_mutate_base() {
        let base = ConfigManager::validate(&ConfigPatch::text("Base")).unwrap();
        let snapshot = base.clone();
        let _ = ConfigManager::merge(&base, &ConfigPatch::text("Changed"));
        assert_eq!(base, snapshot);
    }

    #[test]
    fn test_merge_replaces_whole_animation_section() {
        let base = ConfigManager::validate(&ConfigPatch::text("Base")).unwrap();
        let patch = ConfigPatch {
            animation: Some(AnimationConfig {
                kind: AnimationKind::Pulse,
                duration_ms: 1200,
                ..AnimationConfig::default()
            }),
            ..ConfigPatch::default()
        };
        let merged = ConfigManager::merge(&base, &patch);
        assert_eq!(merged.animation.kind, AnimationKind::Pulse);
        assert_eq!(merged.animation.duration_ms, 1200);
    }

    #[test]
    fn test_change_predicates() {
        let base = ConfigManager::validate(&ConfigPatch::text("Base")).unwrap();

        let style_changed = ConfigManager::merge(
            &base,
            &ConfigPatch {
                style: Some(StylePatch {
                    font_size: Some(24.0),
                    ..StylePatch::default()
                }),
                ..ConfigPatch::default()
            },
        );
        assert!(ConfigManager::has_rendering_changes(&base, &style_changed));
        assert!(!ConfigManager::has_animation_changes(&base, &style_changed));
        assert!(!ConfigManager::has_security_changes(&base, &style_changed));
        assert!(!ConfigManager::has_responsive_changes(&base, &style_changed));

        let anim_changed = ConfigManager::merge(
            &base,
            &ConfigPatch {
                animation: Some(AnimationConfig {
                    kind: AnimationKind::Fade,
                    ..AnimationConfig::default()
                }),
                ..ConfigPatch::default()
            },
        );
        assert!(!ConfigManager::has_rendering_changes(&base, &anim_changed));
        assert!(ConfigManager::has_animation_changes(&base, &anim_changed));

        let sec_changed = ConfigManager::merge(
            &base,
            &ConfigPatch {
                security: Some(SecurityConfig {
                    level: SecurityLevel::Advanced,
                    ..SecurityConfig::default()
                }),
                ..ConfigPatch::default()
            },
        );
        assert!(ConfigManager::has_security_changes(&base, &sec_changed));

        let resp_changed = ConfigManager::merge(
            &base,
            &ConfigPatch {
                responsive: Some(ResponsiveConfig {
                    enabled: true,
                    ..ResponsiveConfig::default()
                }),
                ..ConfigPatch::default()
            },
        );
        assert!(ConfigManager::has_responsive_changes(&base, &resp_changed));
    }

    #[test]
    fn test_content_change_is_rendering_change() {
        let base = ConfigManager::validate(&ConfigPatch::text("Base")).unwrap();
        let updated = ConfigManager::merge(&base, &ConfigPatch::text("Changed"));
        assert!(ConfigManager::has_rendering_changes(&base, &updated));
        assert!(!ConfigManager::has_animation_changes(&base, &updated));
    }

    #[test]
    fn test_patch_deserialize_from_yaml() {
        let yaml = r##"
content:
  text: "CONFIDENTIAL"
style:
  font_size: 24
  color: "#FF0000"
layout:
  gap_x: 150
render_mode: vector
"##;
        let patch: ConfigPatch = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            patch.content.as_ref().and_then(|c| c.text.as_deref()),
            Some("CONFIDENTIAL")
        );
        assert_eq!(patch.render_mode, Some(RenderMode::Vector));

        let config = ConfigManager::validate(&patch).unwrap();
        assert_eq!(config.style.font_size, 24.0);
        assert_eq!(config.layout.gap_x, 150);
        assert_eq!(config.layout.gap_y, 100); // default preserved
    }

    #[test]
    fn test_security_level_deserialize() {
        let levels = [
            ("off", SecurityLevel::Off),
            ("basic", SecurityLevel::Basic),
            ("intermediate", SecurityLevel::Intermediate),
            ("advanced", SecurityLevel::Advanced),
        ];
        for (yaml_val, expected) in levels {
            let yaml = format!("\"{}\"", yaml_val);
            let level: SecurityLevel = serde_yaml::from_str(&yaml).unwrap();
            assert_eq!(level, expected, "Failed for {}", yaml_val);
        }
    }

    #[test]
    fn test_failing_validation_discards_candidate() {
        // A patch with one good section and one bad section fails whole
        let patch = ConfigPatch {
            style: Some(StylePatch {
                opacity: Some(2.0),
                ..StylePatch::default()
            }),
            ..ConfigPatch::text("Good text")
        };
        assert!(ConfigManager::validate(&patch).is_err());
    }
}
