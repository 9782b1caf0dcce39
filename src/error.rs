// Copyright 2025 the simframe developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error types

use std::fmt;

/// Runtime error type
///
/// Every variant maps to a short stable category string so callers can
/// dispatch without matching on payloads.
#[derive(Debug, Clone)]
pub enum EcsError {
    /// Structural command failed its pre-check (dead entity, stale token)
    Validation(String),

    /// A structural apply failed; the buffer rolled back before re-raising
    StructuralApply(String),

    /// Transaction dependency graph contains a cycle
    TransactionCycle,

    /// Transaction dependency is malformed (duplicate id, unknown dep)
    Dependency(String),

    /// A query touched a component outside the system's declared access
    AccessViolation {
        system: String,
        component: &'static str,
    },

    /// Operation on an entity whose generation no longer matches
    StaleHandle,

    /// Snapshot-ring waiter released by `reset()` while acquiring
    RingReset,

    /// Entity not found
    EntityNotFound,

    /// Component not found
    ComponentNotFound,
}

impl EcsError {
    /// Stable category string for the error taxonomy.
    pub fn category(&self) -> &'static str {
        match self {
            EcsError::Validation(_) => "validation",
            EcsError::StructuralApply(_) => "structural-apply",
            EcsError::TransactionCycle => "transaction-cycle",
            EcsError::Dependency(_) => "dependency",
            EcsError::AccessViolation { .. } => "access-violation",
            EcsError::StaleHandle => "stale-handle",
            EcsError::RingReset => "ring-reset",
            EcsError::EntityNotFound => "entity-not-found",
            EcsError::ComponentNotFound => "component-not-found",
        }
    }
}

impl fmt::Display for EcsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EcsError::Validation(msg) => write!(f, "validation failed: {msg}"),
            EcsError::StructuralApply(msg) => write!(f, "structural apply failed: {msg}"),
            EcsError::TransactionCycle => write!(f, "transaction dependency graph contains a cycle"),
            EcsError::Dependency(msg) => write!(f, "transaction dependency error: {msg}"),
            EcsError::AccessViolation { system, component } => {
                write!(f, "system '{system}' accessed undeclared component {component}")
            }
            EcsError::StaleHandle => write!(f, "operation on stale entity handle"),
            EcsError::RingReset => write!(f, "snapshot ring reset while waiting for a slot"),
            EcsError::EntityNotFound => write!(f, "entity not found"),
            EcsError::ComponentNotFound => write!(f, "component not found"),
        }
    }
}

impl std::error::Error for EcsError {}

/// Result type alias
pub type Result<T> = std::result::Result<T, EcsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_are_stable() {
        assert_eq!(EcsError::StaleHandle.category(), "stale-handle");
        assert_eq!(EcsError::Validation("x".into()).category(), "validation");
        assert_eq!(EcsError::RingReset.category(), "ring-reset");
    }
}
