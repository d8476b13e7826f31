//! Edit operations: the unit of collaboration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use nois_shared::ids::{EntityId, OperationId, PeerId};

use crate::clock::VectorClock;
use crate::protocol::now_ticks;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Insert,
    Delete,
    Update,
    Move,
    NoOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpDomain {
    Note,
    Track,
    Clip,
    Parameter,
}

/// One edit, stamped with its author's clock snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: OperationId,
    pub author: PeerId,
    pub kind: OperationKind,
    pub domain: OpDomain,
    /// Container entity: pattern for notes, track for clips, the target
    /// itself for tracks and parameters
    pub target: EntityId,
    /// The entity being edited inside the container, when distinct
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item: Option<EntityId>,
    /// List index for ordered containers (track list)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<String, Value>,
    pub clock: VectorClock,
    /// 100-ns ticks since the Unix epoch
    pub timestamp: i64,
    #[serde(default)]
    pub applied: bool,
    #[serde(default)]
    pub acknowledged: bool,
}

impl Operation {
    pub fn new(author: PeerId, kind: OperationKind, domain: OpDomain, target: EntityId) -> Self {
        Self {
            id: OperationId::new(),
            author,
            kind,
            domain,
            target,
            item: None,
            position: None,
            properties: HashMap::new(),
            clock: VectorClock::new(),
            timestamp: now_ticks(),
            applied: false,
            acknowledged: false,
        }
    }

    pub fn with_item(mut self, item: EntityId) -> Self {
        self.item = Some(item);
        self
    }

    pub fn with_position(mut self, position: i64) -> Self {
        self.position = Some(position);
        self
    }

    pub fn with_property(mut self, key: &str, value: Value) -> Self {
        self.properties.insert(key.to_string(), value);
        self
    }

    pub fn is_noop(&self) -> bool {
        self.kind == OperationKind::NoOp
    }

    /// Degrades this operation to a NoOp, keeping identity and clock.
    pub fn nullify(&mut self) {
        self.kind = OperationKind::NoOp;
        self.properties.clear();
        self.position = None;
    }

    pub fn concurrent_with(&self, other: &Operation) -> bool {
        self.clock.concurrent_with(&other.clock)
    }

    /// Both operations address the same logical entity.
    pub fn same_entity(&self, other: &Operation) -> bool {
        if self.domain != other.domain || self.target != other.target {
            return false;
        }
        match self.domain {
            // Parameter identity includes the parameter name.
            OpDomain::Parameter => {
                self.properties.get("parameterName") == other.properties.get("parameterName")
            }
            // Track inserts address the same list even with distinct items.
            OpDomain::Track => true,
            _ => self.item == other.item,
        }
    }

    /// Parameter name, for parameter-domain operations.
    pub fn parameter_name(&self) -> Option<&str> {
        self.properties.get("parameterName").and_then(Value::as_str)
    }
}
