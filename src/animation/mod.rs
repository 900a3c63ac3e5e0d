//! Declarative animations layered on rendered elements.
//!
//! Each animation kind expands to a keyframe sequence that is handed to
//! the host's [`AnimationDriver`]. Engine-side state (status, progress,
//! current iteration) is tracked against monotonic clocks independently
//! of the driver, so progress can be queried synchronously between ticks.
//!
//! Timelines chain animations with cumulative delay; transitions build an
//! ad-hoc two-keyframe animation between arbitrary property states.

use crate::config::{AnimationConfig, AnimationKind};
use crate::error::{ErrorCode, Result, WatermarkError};
use crate::host::{AnimationDriver, AnimationTiming, Keyframe, NodeId, PlaybackHandle};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Playback status tracked by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnimationStatus {
    Running,
    Paused,
    Stopped,
    Finished,
}

/// Synchronous snapshot of one animation's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimationState {
    pub status: AnimationStatus,
    /// Progress within the current iteration, in [0, 1].
    pub progress: f64,
    pub current_iteration: u32,
}

struct ActiveAnimation {
    instance_id: String,
    kind: AnimationKind,
    timing: AnimationTiming,
    handle: Arc<dyn PlaybackHandle>,
    status: AnimationStatus,
    /// Set while running; progress accrues from here.
    started_at: Option<Instant>,
    /// Play time accumulated before the last pause.
    accumulated: Duration,
}

impl ActiveAnimation {
    fn elapsed(&self) -> Duration {
        let running = self
            .started_at
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO);
        self.accumulated + running
    }

    fn state(&self) -> AnimationState {
        match self.status {
            AnimationStatus::Stopped => AnimationState {
                status: AnimationStatus::Stopped,
                progress: 0.0,
                current_iteration: 0,
            },
            AnimationStatus::Finished => AnimationState {
                status: AnimationStatus::Finished,
                progress: 1.0,
                current_iteration: self.timing.iterations.unwrap_or(1).saturating_sub(1),
            },
            _ => {
                let duration_ms = self.timing.duration_ms.max(1);
                let active_ms = self
                    .elapsed()
                    .as_millis()
                    .saturating_sub(self.timing.delay_ms as u128)
                    as u64;
                let iteration = (active_ms / duration_ms) as u32;

                if let Some(total) = self.timing.iterations {
                    if iteration >= total {
                        return AnimationState {
                            status: AnimationStatus::Finished,
                            progress: 1.0,
                            current_iteration: total.saturating_sub(1),
                        };
                    }
                }

                AnimationState {
                    status: self.status,
                    progress: (active_ms % duration_ms) as f64 / duration_ms as f64,
                    current_iteration: iteration,
                }
            }
        }
    }
}

struct Timeline {
    instance_id: String,
    animations: Vec<String>,
    total_duration_ms: u64,
}

/// Generate the keyframe sequence for an animation kind.
///
/// `AnimationKind::None` yields an empty sequence.
pub fn keyframes_for(kind: AnimationKind) -> Vec<Keyframe> {
    match kind {
        AnimationKind::None => Vec::new(),
        AnimationKind::Fade => vec![
            Keyframe::at(0.0).with("opacity", "0"),
            Keyframe::at(1.0).with("opacity", "1"),
        ],
        AnimationKind::Move => vec![
            Keyframe::at(0.0).with("transform", "translateX(-100px)"),
            Keyframe::at(1.0).with("transform", "translate(0, 0)"),
        ],
        AnimationKind::Scale => vec![
            Keyframe::at(0.0).with("transform", "scale(0)"),
            Keyframe::at(1.0).with("transform", "scale(1)"),
        ],
        AnimationKind::Rotate => vec![
            Keyframe::at(0.0).with("transform", "rotate(0deg)"),
            Keyframe::at(1.0).with("transform", "rotate(360deg)"),
        ],
        AnimationKind::Bounce => vec![
            Keyframe::at(0.0).with("transform", "translateY(0)"),
            Keyframe::at(0.25).with("transform", "translateY(-30px)"),
            Keyframe::at(0.5).with("transform", "translateY(0)"),
            Keyframe::at(0.75).with("transform", "translateY(-15px)"),
            Keyframe::at(1.0).with("transform", "translateY(0)"),
        ],
        AnimationKind::Pulse => vec![
            Keyframe::at(0.0).with("transform", "scale(1)"),
            Keyframe::at(0.5).with("transform", "scale(1.1)"),
            Keyframe::at(1.0).with("transform", "scale(1)"),
        ],
        AnimationKind::Swing => vec![
            Keyframe::at(0.0).with("transform", "rotate(0deg)"),
            Keyframe::at(0.2).with("transform", "rotate(15deg)"),
            Keyframe::at(0.4).with("transform", "rotate(-10deg)"),
            Keyframe::at(0.6).with("transform", "rotate(5deg)"),
            Keyframe::at(0.8).with("transform", "rotate(-5deg)"),
            Keyframe::at(1.0).with("transform", "rotate(0deg)"),
        ],
    }
}

fn timing_from(config: &AnimationConfig) -> AnimationTiming {
    AnimationTiming {
        duration_ms: config.duration_ms,
        delay_ms: config.delay_ms,
        iterations: config.iterations,
        direction: config.direction,
        fill: config.fill,
        easing: config.easing.clone(),
    }
}

/// Keyframe generation and playback control for instance animations.
pub struct AnimationEngine {
    driver: Arc<dyn AnimationDriver>,
    animations: Mutex<HashMap<String, ActiveAnimation>>,
    timelines: Mutex<HashMap<String, Timeline>>,
}

impl AnimationEngine {
    pub fn new(driver: Arc<dyn AnimationDriver>) -> Self {
        Self {
            driver,
            animations: Mutex::new(HashMap::new()),
            timelines: Mutex::new(HashMap::new()),
        }
    }

    /// Create and start an animation on a node. Returns the animation id.
    pub fn create(
        &self,
        instance_id: &str,
        node: NodeId,
        kind: AnimationKind,
        config: &AnimationConfig,
    ) -> Result<String> {
        if kind == AnimationKind::None {
            return Err(WatermarkError::new(
                ErrorCode::AnimationFailed,
                "Cannot create an animation of kind 'none'",
            ));
        }

        let keyframes = keyframes_for(kind);
        let timing = timing_from(config);
        let handle = self.driver.start(node, &keyframes, &timing).map_err(|e| {
            WatermarkError::new(
                ErrorCode::AnimationFailed,
                format!("Driver rejected animation: {e}"),
            )
        })?;

        let id = format!("anim-{}", Uuid::new_v4().simple());
        self.animations.lock().insert(
            id.clone(),
            ActiveAnimation {
                instance_id: instance_id.to_string(),
                kind,
                timing,
                handle,
                status: AnimationStatus::Running,
                started_at: Some(Instant::now()),
                accumulated: Duration::ZERO,
            },
        );
        Ok(id)
    }

    /// Resume a paused or stopped animation.
    pub fn start(&self, id: &str) -> Result<()> {
        self.with_animation(id, |anim| {
            if anim.status != AnimationStatus::Running {
                anim.status = AnimationStatus::Running;
                anim.started_at = Some(Instant::now());
                anim.handle.play();
            }
            Ok(())
        })
    }

    /// Pause a running animation, freezing its progress.
    pub fn pause(&self, id: &str) -> Result<()> {
        self.with_animation(id, |anim| {
            if anim.status == AnimationStatus::Running {
                anim.accumulated = anim.elapsed();
                anim.started_at = None;
                anim.status = AnimationStatus::Paused;
                anim.handle.pause();
            }
            Ok(())
        })
    }

    /// Resume a paused animation.
    pub fn resume(&self, id: &str) -> Result<()> {
        self.start(id)
    }

    /// Stop an animation, resetting progress to zero.
    pub fn stop(&self, id: &str) -> Result<()> {
        self.with_animation(id, |anim| {
            anim.status = AnimationStatus::Stopped;
            anim.started_at = None;
            anim.accumulated = Duration::ZERO;
            anim.handle.cancel();
            Ok(())
        })
    }

    /// Jump an animation to its final state.
    pub fn finish(&self, id: &str) -> Result<()> {
        self.with_animation(id, |anim| {
            anim.status = AnimationStatus::Finished;
            anim.started_at = None;
            anim.handle.finish();
            Ok(())
        })
    }

    /// Cancel the driver animation and release all engine state. The id
    /// never resolves again.
    pub fn destroy(&self, id: &str) -> Result<()> {
        let animation = self.animations.lock().remove(id).ok_or_else(|| {
            WatermarkError::new(
                ErrorCode::AnimationNotFound,
                format!("Animation {id} not found"),
            )
        })?;
        animation.handle.cancel();
        Ok(())
    }

    /// Synchronous progress snapshot for an animation.
    pub fn state(&self, id: &str) -> Option<AnimationState> {
        self.animations.lock().get(id).map(ActiveAnimation::state)
    }

    /// Kind of a live animation. Transitions report `None` kind.
    pub fn kind(&self, id: &str) -> Option<AnimationKind> {
        self.animations.lock().get(id).map(|anim| anim.kind)
    }

    /// Ids of live animations owned by an instance.
    pub fn animations_of(&self, instance_id: &str) -> Vec<String> {
        self.animations
            .lock()
            .iter()
            .filter(|(_, anim)| anim.instance_id == instance_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Build a sequential timeline: each entry starts after the previous
    /// one's delay + duration. Returns the timeline id.
    pub fn create_timeline(
        &self,
        instance_id: &str,
        node: NodeId,
        entries: &[(AnimationKind, AnimationConfig)],
    ) -> Result<String> {
        let mut cumulative_delay = 0u64;
        let mut animations = Vec::with_capacity(entries.len());

        for (kind, config) in entries {
            let mut staged = config.clone();
            staged.delay_ms = cumulative_delay + config.delay_ms;
            cumulative_delay = staged.delay_ms + config.duration_ms;
            animations.push(self.create(instance_id, node, *kind, &staged)?);
        }

        let id = format!("timeline-{}", Uuid::new_v4().simple());
        self.timelines.lock().insert(
            id.clone(),
            Timeline {
                instance_id: instance_id.to_string(),
                animations,
                total_duration_ms: cumulative_delay,
            },
        );
        Ok(id)
    }

    /// Total configured duration of a timeline in milliseconds.
    pub fn timeline_duration(&self, id: &str) -> Option<u64> {
        self.timelines
            .lock()
            .get(id)
            .map(|timeline| timeline.total_duration_ms)
    }

    /// Destroy a timeline and every animation it owns.
    pub fn destroy_timeline(&self, id: &str) -> Result<()> {
        let timeline = self.timelines.lock().remove(id).ok_or_else(|| {
            WatermarkError::new(
                ErrorCode::AnimationNotFound,
                format!("Timeline {id} not found"),
            )
        })?;
        for animation_id in timeline.animations {
            let _ = self.destroy(&animation_id);
        }
        Ok(())
    }

    /// Ad-hoc transition between two property states.
    pub fn transition(
        &self,
        instance_id: &str,
        node: NodeId,
        from: BTreeMap<String, String>,
        to: BTreeMap<String, String>,
        duration_ms: u64,
    ) -> Result<String> {
        let keyframes = vec![
            Keyframe {
                offset: 0.0,
                properties: from,
            },
            Keyframe {
                offset: 1.0,
                properties: to,
            },
        ];
        let timing = AnimationTiming {
            duration_ms: duration_ms.max(1),
            delay_ms: 0,
            iterations: Some(1),
            direction: crate::config::PlaybackDirection::Normal,
            fill: crate::config::FillMode::Forwards,
            easing: "ease".to_string(),
        };
        let handle = self.driver.start(node, &keyframes, &timing).map_err(|e| {
            WatermarkError::new(
                ErrorCode::AnimationFailed,
                format!("Driver rejected transition: {e}"),
            )
        })?;

        let id = format!("anim-{}", Uuid::new_v4().simple());
        self.animations.lock().insert(
            id.clone(),
            ActiveAnimation {
                instance_id: instance_id.to_string(),
                kind: AnimationKind::None,
                timing,
                handle,
                status: AnimationStatus::Running,
                started_at: Some(Instant::now()),
                accumulated: Duration::ZERO,
            },
        );
        Ok(id)
    }

    /// Stop and destroy every animation and timeline of an instance.
    pub fn destroy_all(&self, instance_id: &str) {
        let timeline_ids: Vec<String> = self
            .timelines
            .lock()
            .iter()
            .filter(|(_, t)| t.instance_id == instance_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in timeline_ids {
            let _ = self.destroy_timeline(&id);
        }
        for id in self.animations_of(instance_id) {
            let _ = self.destroy(&id);
        }
    }

    /// Pause every animation of an instance.
    pub fn pause_all(&self, instance_id: &str) {
        for id in self.animations_of(instance_id) {
            let _ = self.pause(&id);
        }
    }

    /// Resume every animation of an instance.
    pub fn resume_all(&self, instance_id: &str) {
        for id in self.animations_of(instance_id) {
            let _ = self.resume(&id);
        }
    }

    fn with_animation<F>(&self, id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut ActiveAnimation) -> Result<()>,
    {
        let mut animations = self.animations.lock();
        let animation = animations.get_mut(id).ok_or_else(|| {
            WatermarkError::new(
                ErrorCode::AnimationNotFound,
                format!("Animation {id} not found"),
            )
        })?;
        f(animation)
    }
}
