use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use indexmap::IndexSet;
use serde_json::Map as JsonMap;
use serde_json::Value;

use crate::transport::Transport;

/// Resolves the identity key for one typename. Returning `None` marks the
/// object unidentifiable, in which case it is embedded into its parent.
pub type KeyFn = Arc<dyn Fn(&JsonMap<String, Value>) -> Option<String> + Send + Sync>;

/// How a connection field accumulates pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum_macros::Display)]
pub enum ConnectionMode {
    /// Pages are merged into one canonical list with splice-at-cursor
    /// semantics.
    #[default]
    #[strum(to_string = "infinite")]
    Infinite,
    /// Each fetch replaces the canonical view entirely.
    #[strum(to_string = "page")]
    Page,
}

/// Per-field connection configuration, keyed under the parent typename.
#[derive(Debug, Clone, Default)]
pub struct ConnectionSpec {
    pub mode: ConnectionMode,
    /// Argument names that participate in canonical identity. Empty means
    /// "every non-window argument".
    pub filters: Vec<String>,
}

/// Everything the cache recognizes at construction time.
///
/// The option surface intentionally stops at the core: no CLI, no
/// environment variables, no on-disk format.
#[derive(Clone, Default)]
pub struct CacheOptions {
    /// Identity overrides per typename. Falls back to the `id` field.
    pub keys: HashMap<String, KeyFn>,
    /// Interface typename to the concrete typenames implementing it, in
    /// resolution order.
    pub interfaces: IndexMap<String, Vec<String>>,
    /// Connection configuration: parent typename to field name to spec.
    pub connections: IndexMap<String, IndexMap<String, ConnectionSpec>>,
    pub transport: Option<Arc<dyn Transport>>,
    /// How long `is_hydrating()` stays true after `hydrate`.
    pub hydration_timeout: Option<Duration>,
    /// Recognized for UI adapters; the core does not consume it.
    pub suspension_timeout: Option<Duration>,
    /// Argument names interpreted as paging windows. Defaults to
    /// `first`, `last`, `after`, `before`.
    pub window_args: Option<IndexSet<String>>,
}

pub(crate) const DEFAULT_HYDRATION_TIMEOUT: Duration = Duration::from_millis(1000);

pub(crate) fn default_window_args() -> IndexSet<String> {
    ["first", "last", "after", "before"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}

impl CacheOptions {
    pub(crate) fn resolved_window_args(&self) -> IndexSet<String> {
        self.window_args.clone().unwrap_or_else(default_window_args)
    }

    pub(crate) fn resolved_hydration_timeout(&self) -> Duration {
        self.hydration_timeout.unwrap_or(DEFAULT_HYDRATION_TIMEOUT)
    }
}
