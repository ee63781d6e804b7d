//! Longest-prefix matching of request paths to target groups.
//!
//! The route table is built once at startup from the registry and is
//! read-only during serving. Prefixes are matched as literal byte
//! sequences; the longest configured prefix wins. Configured prefixes are
//! distinct, so ties cannot occur.

use std::sync::Arc;

use crate::target::{TargetGroup, TargetGroupRegistry};

/// Immutable route table mapping path prefixes to target groups.
#[derive(Debug)]
pub struct Router {
    /// Groups sorted by prefix length, longest first, so the first match
    /// found is the longest match.
    groups: Vec<Arc<TargetGroup>>,
}

impl Router {
    /// Builds the route table from all registered groups.
    pub fn new(registry: &TargetGroupRegistry) -> Self {
        let mut groups = registry.groups().to_vec();
        groups.sort_by(|a, b| b.path_prefix().len().cmp(&a.path_prefix().len()));
        Self { groups }
    }

    /// Returns the group with the longest prefix matching `path`, if any.
    pub fn route(&self, path: &str) -> Option<Arc<TargetGroup>> {
        self.groups
            .iter()
            .find(|g| path.starts_with(g.path_prefix()))
            .cloned()
    }
}
