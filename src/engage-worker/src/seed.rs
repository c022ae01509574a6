//! Startup seed file: definitions and events loaded into the in-memory
//! stores before the loops start.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::Context;
use chrono::Utc;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use engage_core::types::Event;
use engage_events::EventStore;
use engage_journey::{Journey, JourneyEngine};
use engage_segmentation::{SegmentNode, SegmentationEngine};

#[derive(Debug, Deserialize)]
pub struct SeedSegment {
    pub workspace_id: Uuid,
    pub name: String,
    pub definition: SegmentNode,
}

#[derive(Debug, Default, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub segments: Vec<SeedSegment>,
    #[serde(default)]
    pub journeys: Vec<Journey>,
    #[serde(default)]
    pub events: Vec<Event>,
}

impl Seed {
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading seed file {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing seed file {}", path.display()))
    }

    /// Loads everything and returns the workspaces the seed mentions.
    pub fn apply(
        self,
        registry: &SegmentationEngine,
        journeys: &JourneyEngine,
        events: &dyn EventStore,
    ) -> anyhow::Result<BTreeSet<Uuid>> {
        let now = Utc::now();
        let mut workspaces = BTreeSet::new();

        for segment in self.segments {
            workspaces.insert(segment.workspace_id);
            registry.upsert_segment_by_name(segment.workspace_id, &segment.name, segment.definition, now)?;
        }
        for journey in self.journeys {
            workspaces.insert(journey.workspace_id);
            journeys.create_journey(journey)?;
        }

        let mut by_workspace: BTreeMap<Uuid, Vec<Event>> = BTreeMap::new();
        for event in self.events {
            by_workspace.entry(event.workspace_id).or_default().push(event);
        }
        for (workspace_id, batch) in by_workspace {
            workspaces.insert(workspace_id);
            let summary = events.insert_batch(workspace_id, batch)?;
            info!(
                workspace_id = %workspace_id,
                inserted = summary.inserted_count,
                duplicates = summary.duplicate_count,
                rejected = summary.rejected_count,
                "Seed events ingested"
            );
        }
        Ok(workspaces)
    }
}
