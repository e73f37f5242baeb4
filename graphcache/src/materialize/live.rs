//! Live results.
//!
//! A live result is a materialized tree plus the set of record ids it was
//! built from. Hosts watch that dependency set and call `refresh` when a
//! write touches it; the tree is rebuilt and compared, so repeated access
//! to unchanged data stays structurally stable.

use std::sync::Arc;

use indexmap::IndexSet;
use serde_json::Value;

use crate::cache::CacheState;
use crate::materialize;
use crate::plan::Plan;
use crate::plan::Variables;

pub struct LiveResult {
    pub(crate) plan: Arc<Plan>,
    pub(crate) variables: Variables,
    data: Option<Value>,
    deps: IndexSet<String>,
}

impl LiveResult {
    pub(crate) fn build(state: &CacheState, plan: Arc<Plan>, variables: Variables) -> Self {
        let output = materialize::read(state, &plan, &variables);
        Self {
            plan,
            variables,
            data: output.data,
            deps: output.deps,
        }
    }

    /// The current tree; `None` while the underlying data is incomplete.
    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    /// The record ids this result was materialized from. A write touching
    /// any of them warrants a [`refresh`](Self::refresh_with).
    pub fn dependencies(&self) -> &IndexSet<String> {
        &self.deps
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    /// Rebuilds the tree from current state. Returns whether the visible
    /// data actually changed.
    pub(crate) fn refresh_with(&mut self, state: &CacheState) -> bool {
        let output = materialize::read(state, &self.plan, &self.variables);
        self.deps = output.deps;
        if output.data == self.data {
            false
        } else {
            self.data = output.data;
            true
        }
    }
}
