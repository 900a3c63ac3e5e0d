//! Watermark instances and their registry.
//!
//! An instance is one active watermark overlay bound to a host container,
//! tracked through a lifecycle state machine:
//!
//! ```text
//! creating -> active <-> paused
//! active -> updating -> active
//! active | paused -> destroying -> destroyed (terminal)
//! ```
//!
//! The registry is a pure in-memory index: it never renders or tears down
//! anything itself. Statistics are recomputed on demand.

use crate::config::{RenderMode, WatermarkConfig};
use crate::error::{ErrorCode, Result, WatermarkError};
use crate::host::{ContainerId, NodeId};
use crate::render::RenderContext;
use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

/// Lifecycle states of a watermark instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Creating,
    Active,
    Paused,
    Updating,
    Destroying,
    /// Terminal; the id is evicted from the registry afterwards.
    Destroyed,
}

impl LifecycleState {
    /// Whether the state machine permits this transition.
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Creating, Active)
                | (Creating, Destroying)
                | (Active, Paused)
                | (Paused, Active)
                | (Active, Updating)
                | (Updating, Active)
                | (Active, Destroying)
                | (Paused, Destroying)
                | (Destroying, Destroyed)
        )
    }

    /// Terminal states accept no further operations.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Destroyed)
    }
}

/// Callback run during destroy; collected from attached subsystems.
pub type CleanupFn = Box<dyn FnOnce() + Send>;

/// One live watermark overlay.
///
/// The container is a borrowed reference: the instance never owns or
/// destroys it. The rendered elements are owned and only ever created or
/// removed by the instance's renderer.
pub struct WatermarkInstance {
    pub id: String,
    pub state: LifecycleState,
    pub config: WatermarkConfig,
    pub container: ContainerId,
    pub elements: Vec<NodeId>,
    /// Backend actually selected (after any capability fallback).
    pub render_mode: RenderMode,
    pub render_context: RenderContext,
    /// Ids of active animations owned by this instance.
    pub animations: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub visible: bool,
    pub user_data: BTreeMap<String, String>,
    pub tags: Vec<String>,
    /// Cleanup callbacks run exactly once during destroy.
    pub cleanup: Vec<CleanupFn>,
}

impl std::fmt::Debug for WatermarkInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatermarkInstance")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("container", &self.container)
            .field("elements", &self.elements.len())
            .field("render_mode", &self.render_mode)
            .field("visible", &self.visible)
            .finish()
    }
}

impl WatermarkInstance {
    /// Apply a state transition, rejecting moves the machine forbids.
    pub fn transition(&mut self, next: LifecycleState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(WatermarkError::new(
                ErrorCode::InvalidState,
                format!(
                    "Invalid state transition {:?} -> {:?} for instance {}",
                    self.state, next, self.id
                ),
            ));
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Shared handle to an instance; the registry and subsystems hold clones.
pub type SharedInstance = Arc<Mutex<WatermarkInstance>>;

/// Sort orders for queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuerySort {
    #[default]
    CreatedAsc,
    CreatedDesc,
    UpdatedAsc,
    UpdatedDesc,
}

/// Filterable instance query with optional sort and pagination.
#[derive(Debug, Clone, Default)]
pub struct InstanceQuery {
    pub ids: Option<Vec<String>>,
    pub states: Option<Vec<LifecycleState>>,
    pub containers: Option<Vec<ContainerId>>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub updated_after: Option<DateTime<Utc>>,
    pub updated_before: Option<DateTime<Utc>>,
    pub visible: Option<bool>,
    /// Every entry must match the instance's user data exactly.
    pub user_data: BTreeMap<String, String>,
    /// Case-insensitive free-text match over id, text content and tags.
    pub text: Option<String>,
    pub sort: QuerySort,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl InstanceQuery {
    fn matches(&self, instance: &WatermarkInstance) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| *id == instance.id) {
                return false;
            }
        }
        if let Some(states) = &self.states {
            if !states.contains(&instance.state) {
                return false;
            }
        }
        if let Some(containers) = &self.containers {
            if !containers.contains(&instance.container) {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if instance.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if instance.created_at > before {
                return false;
            }
        }
        if let Some(after) = self.updated_after {
            if instance.updated_at < after {
                return false;
            }
        }
        if let Some(before) = self.updated_before {
            if instance.updated_at > before {
                return false;
            }
        }
        if let Some(visible) = self.visible {
            if instance.visible != visible {
                return false;
            }
        }
        for (key, value) in &self.user_data {
            if instance.user_data.get(key) != Some(value) {
                return false;
            }
        }
        if let Some(text) = &self.text {
            let needle = text.to_lowercase();
            let in_id = instance.id.to_lowercase().contains(&needle);
            let in_content = instance
                .config
                .content
                .text
                .as_deref()
                .map(|t| t.to_lowercase().contains(&needle))
                .unwrap_or(false);
            let in_tags = instance
                .tags
                .iter()
                .any(|tag| tag.to_lowercase().contains(&needle));
            if !in_id && !in_content && !in_tags {
                return false;
            }
        }
        true
    }
}

/// On-demand registry statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InstanceStats {
    pub total: usize,
    pub by_state: BTreeMap<String, usize>,
    pub by_render_mode: BTreeMap<String, usize>,
}

/// Registry of live instances, indexed by id.
#[derive(Default)]
pub struct InstanceManager {
    instances: RwLock<HashMap<String, SharedInstance>>,
}

impl InstanceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instance. Duplicate ids are an error.
    pub fn register(&self, instance: SharedInstance) -> Result<()> {
        let id = instance.lock().id.clone();
        let mut instances = self.instances.write();
        if instances.contains_key(&id) {
            return Err(WatermarkError::new(
                ErrorCode::DuplicateInstance,
                format!("Instance with id {id} already exists"),
            ));
        }
        instances.insert(id, instance);
        Ok(())
    }

    /// Remove an instance from the registry, returning it when present.
    pub fn unregister(&self, id: &str) -> Option<SharedInstance> {
        self.instances.write().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<SharedInstance> {
        self.instances.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.instances.read().contains_key(id)
    }

    pub fn get_all(&self) -> Vec<SharedInstance> {
        self.instances.read().values().cloned().collect()
    }

    pub fn get_by_container(&self, container: &ContainerId) -> Vec<SharedInstance> {
        self.instances
            .read()
            .values()
            .filter(|instance| instance.lock().container == *container)
            .cloned()
            .collect()
    }

    /// Run a query with filtering, sorting and pagination.
    pub fn query(&self, query: &InstanceQuery) -> Vec<SharedInstance> {
        let mut matched: Vec<(DateTime<Utc>, DateTime<Utc>, SharedInstance)> = self
            .instances
            .read()
            .values()
            .filter_map(|shared| {
                let instance = shared.lock();
                query
                    .matches(&instance)
                    .then(|| (instance.created_at, instance.updated_at, shared.clone()))
            })
            .collect();

        match query.sort {
            QuerySort::CreatedAsc => matched.sort_by_key(|(created, _, _)| *created),
            QuerySort::CreatedDesc => {
                matched.sort_by_key(|(created, _, _)| std::cmp::Reverse(*created))
            }
            QuerySort::UpdatedAsc => matched.sort_by_key(|(_, updated, _)| *updated),
            QuerySort::UpdatedDesc => {
                matched.sort_by_key(|(_, updated, _)| std::cmp::Reverse(*updated))
            }
        }

        matched
            .into_iter()
            .map(|(_, _, shared)| shared)
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect()
    }

    /// Fan an async operation out over ids with bounded concurrency.
    ///
    /// Failures are isolated per item; the result list pairs each id with
    /// its own outcome, in input order. Unknown ids yield a not-found
    /// error for that item.
    pub async fn batch<F, Fut, T>(
        &self,
        ids: &[String],
        concurrency: usize,
        op: F,
    ) -> Vec<(String, Result<T>)>
    where
        F: Fn(String, SharedInstance) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let concurrency = concurrency.max(1);
        futures::stream::iter(ids.iter().cloned())
            .map(|id| {
                let instance = self.get(&id);
                let op = &op;
                async move {
                    let outcome = match instance {
                        Some(instance) => op(id.clone(), instance).await,
                        None => Err(WatermarkError::new(
                            ErrorCode::InstanceNotFound,
                            format!("Instance with id {id} not found"),
                        )),
                    };
                    (id, outcome)
                }
            })
            .buffered(concurrency)
            .collect()
            .await
    }

    /// Evict every instance already in the terminal destroyed state.
    /// Returns how many entries were removed.
    pub fn cleanup(&self) -> usize {
        let mut instances = self.instances.write();
        let before = instances.len();
        instances.retain(|_, instance| instance.lock().state != LifecycleState::Destroyed);
        before - instances.len()
    }

    /// Statistics recomputed from the registry contents.
    pub fn stats(&self) -> InstanceStats {
        let instances = self.instances.read();
        let mut stats = InstanceStats {
            total: instances.len(),
            ..InstanceStats::default()
        };
        for shared in instances.values() {
            let instance = shared.lock();
            *stats
                .by_state
                .entry(format!("{:?}", instance.state).to_lowercase())
                .or_insert(0) += 1;
            *stats
                .by_render_mode
                .entry(instance.render_mode.as_str().to_string())
                .or_insert(0) += 1;
        }
        stats
    }
}
