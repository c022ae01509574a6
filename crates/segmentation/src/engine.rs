//! Definition registry: segments and user properties per workspace.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use engage_core::ids::deterministic_id;
use engage_core::types::ComputedPropertyType;
use engage_core::EngageResult;

use crate::computed::UserPropertyDefinition;
use crate::definition::SegmentNode;
use crate::evaluator::evaluate_segment;
use crate::facts::UserFacts;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    pub definition: SegmentNode,
    /// Version of the definition; periods are keyed by its millis.
    pub definition_updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProperty {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    pub definition: UserPropertyDefinition,
    pub definition_updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Either kind of computed property, as seen by the incremental evaluator.
#[derive(Debug, Clone)]
pub enum ComputedProperty {
    Segment(Segment),
    UserProperty(UserProperty),
}

impl ComputedProperty {
    pub fn id(&self) -> Uuid {
        match self {
            ComputedProperty::Segment(s) => s.id,
            ComputedProperty::UserProperty(p) => p.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ComputedProperty::Segment(s) => &s.name,
            ComputedProperty::UserProperty(p) => &p.name,
        }
    }

    pub fn property_type(&self) -> ComputedPropertyType {
        match self {
            ComputedProperty::Segment(_) => ComputedPropertyType::Segment,
            ComputedProperty::UserProperty(_) => ComputedPropertyType::UserProperty,
        }
    }

    pub fn version(&self) -> i64 {
        match self {
            ComputedProperty::Segment(s) => s.definition_updated_at.timestamp_millis(),
            ComputedProperty::UserProperty(p) => p.definition_updated_at.timestamp_millis(),
        }
    }

    pub fn is_time_dependent(&self) -> bool {
        match self {
            ComputedProperty::Segment(s) => s.definition.is_time_dependent(),
            ComputedProperty::UserProperty(p) => p.definition.is_time_dependent(),
        }
    }
}

pub struct SegmentationEngine {
    segments: DashMap<Uuid, Segment>,
    user_properties: DashMap<Uuid, UserProperty>,
}

impl SegmentationEngine {
    pub fn new() -> Self {
        Self {
            segments: DashMap::new(),
            user_properties: DashMap::new(),
        }
    }

    /// Creates or replaces a segment. The version only moves when the
    /// definition itself changes; renames keep existing periods.
    pub fn put_segment(
        &self,
        workspace_id: Uuid,
        id: Uuid,
        name: impl Into<String>,
        definition: SegmentNode,
        now: DateTime<Utc>,
    ) -> EngageResult<Segment> {
        definition.validate()?;
        let name = name.into();
        let segment = match self.segments.get(&id).map(|s| s.clone()) {
            Some(existing) if existing.workspace_id == workspace_id => {
                let definition_updated_at = if existing.definition == definition {
                    existing.definition_updated_at
                } else {
                    next_version(existing.definition_updated_at, now)
                };
                Segment {
                    name,
                    definition,
                    definition_updated_at,
                    updated_at: now,
                    ..existing
                }
            }
            _ => Segment {
                id,
                workspace_id,
                name,
                definition,
                definition_updated_at: now,
                created_at: now,
                updated_at: now,
            },
        };
        info!(
            workspace_id = %workspace_id,
            segment_id = %id,
            version = segment.definition_updated_at.timestamp_millis(),
            "Segment saved"
        );
        self.segments.insert(id, segment.clone());
        Ok(segment)
    }

    /// Creates or updates the segment whose id is derived from its name.
    pub fn upsert_segment_by_name(
        &self,
        workspace_id: Uuid,
        name: &str,
        definition: SegmentNode,
        now: DateTime<Utc>,
    ) -> EngageResult<Segment> {
        let id = deterministic_id(&[&workspace_id.to_string(), "segment", name]);
        self.put_segment(workspace_id, id, name, definition, now)
    }

    pub fn get_segment(&self, workspace_id: Uuid, id: &Uuid) -> Option<Segment> {
        self.segments
            .get(id)
            .filter(|s| s.workspace_id == workspace_id)
            .map(|s| s.clone())
    }

    pub fn list_segments(&self, workspace_id: Uuid) -> Vec<Segment> {
        let mut segments: Vec<Segment> = self
            .segments
            .iter()
            .filter(|s| s.workspace_id == workspace_id)
            .map(|s| s.value().clone())
            .collect();
        segments.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        segments
    }

    pub fn delete_segment(&self, workspace_id: Uuid, id: &Uuid) -> Option<Segment> {
        self.segments
            .remove_if(id, |_, s| s.workspace_id == workspace_id)
            .map(|(_, s)| s)
    }

    pub fn put_user_property(
        &self,
        workspace_id: Uuid,
        id: Uuid,
        name: impl Into<String>,
        definition: UserPropertyDefinition,
        now: DateTime<Utc>,
    ) -> EngageResult<UserProperty> {
        definition.validate()?;
        let name = name.into();
        let property = match self.user_properties.get(&id).map(|p| p.clone()) {
            Some(existing) if existing.workspace_id == workspace_id => {
                let definition_updated_at = if existing.definition == definition {
                    existing.definition_updated_at
                } else {
                    next_version(existing.definition_updated_at, now)
                };
                UserProperty {
                    name,
                    definition,
                    definition_updated_at,
                    updated_at: now,
                    ..existing
                }
            }
            _ => UserProperty {
                id,
                workspace_id,
                name,
                definition,
                definition_updated_at: now,
                created_at: now,
                updated_at: now,
            },
        };
        info!(workspace_id = %workspace_id, user_property_id = %id, "User property saved");
        self.user_properties.insert(id, property.clone());
        Ok(property)
    }

    pub fn get_user_property(&self, workspace_id: Uuid, id: &Uuid) -> Option<UserProperty> {
        self.user_properties
            .get(id)
            .filter(|p| p.workspace_id == workspace_id)
            .map(|p| p.clone())
    }

    pub fn list_user_properties(&self, workspace_id: Uuid) -> Vec<UserProperty> {
        let mut properties: Vec<UserProperty> = self
            .user_properties
            .iter()
            .filter(|p| p.workspace_id == workspace_id)
            .map(|p| p.value().clone())
            .collect();
        properties.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        properties
    }

    pub fn delete_user_property(&self, workspace_id: Uuid, id: &Uuid) -> Option<UserProperty> {
        self.user_properties
            .remove_if(id, |_, p| p.workspace_id == workspace_id)
            .map(|(_, p)| p)
    }

    /// All computed properties of a workspace in a stable order.
    pub fn computed_properties(&self, workspace_id: Uuid) -> Vec<ComputedProperty> {
        let mut all: Vec<ComputedProperty> = self
            .list_segments(workspace_id)
            .into_iter()
            .map(ComputedProperty::Segment)
            .chain(
                self.list_user_properties(workspace_id)
                    .into_iter()
                    .map(ComputedProperty::UserProperty),
            )
            .collect();
        all.sort_by_key(ComputedProperty::id);
        all
    }

    /// Ids of the workspace's segments the user currently belongs to.
    pub fn evaluate_user(&self, workspace_id: Uuid, facts: &UserFacts, now: DateTime<Utc>) -> Vec<Uuid> {
        self.list_segments(workspace_id)
            .into_iter()
            .filter(|s| evaluate_segment(&s.definition, facts, now))
            .map(|s| s.id)
            .collect()
    }
}

impl Default for SegmentationEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Versions must strictly increase even when two edits share a millisecond.
fn next_version(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    if now.timestamp_millis() > previous.timestamp_millis() {
        now
    } else {
        previous + chrono::Duration::milliseconds(1)
    }
}
