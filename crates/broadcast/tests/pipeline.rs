//! End-to-end flow: events → incremental evaluation → segment updates →
//! journey instances → channel transport, plus broadcasts on top.
//! Runs entirely on the in-memory collaborators.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, Utc};
    use serde_json::{json, Value};
    use uuid::Uuid;

    use engage_broadcast::{
        BroadcastCoordinator, BroadcastStatus, MessageTemplateDefinition, TriggerOutcome,
        UpsertBroadcast,
    };
    use engage_core::config::{BroadcastConfig, ComputedPropertiesConfig, JourneyConfig};
    use engage_core::event_bus::{capture_sink, CaptureSink, LifecycleKind};
    use engage_core::types::{AssignmentValue, Event, EventType};
    use engage_events::{EventStore, InMemoryEventStore};
    use engage_journey::{
        ChannelType, DelayVariant, InMemoryHost, InstanceState, Journey, JourneyDefinition,
        JourneyEngine, JourneyNode, JourneyStatus, RecordingTransport, ReEntryPolicy,
        TimeoutAction,
    };
    use engage_segmentation::{
        AssignmentStore, InMemoryAssignmentStore, InMemoryPeriodStore, IncrementalEvaluator,
        SegmentBuilder, SegmentNode, SegmentationEngine,
    };

    struct Pipeline {
        ws: Uuid,
        events: Arc<InMemoryEventStore>,
        registry: Arc<SegmentationEngine>,
        assignments: Arc<InMemoryAssignmentStore>,
        evaluator: IncrementalEvaluator,
        journeys: Arc<JourneyEngine>,
        broadcasts: BroadcastCoordinator,
        transport: Arc<RecordingTransport>,
        sink: Arc<CaptureSink>,
    }

    fn pipeline() -> Pipeline {
        let events = Arc::new(InMemoryEventStore::new());
        let registry = Arc::new(SegmentationEngine::new());
        let assignments = Arc::new(InMemoryAssignmentStore::new());
        let host = Arc::new(InMemoryHost::new());
        let transport = Arc::new(RecordingTransport::new());
        let sink = capture_sink();

        let evaluator = IncrementalEvaluator::new(
            ComputedPropertiesConfig::default(),
            registry.clone(),
            events.clone(),
            Arc::new(InMemoryPeriodStore::new()),
            assignments.clone(),
            sink.clone(),
        );
        let journeys = Arc::new(
            JourneyEngine::new(
                JourneyConfig::default(),
                host.clone(),
                transport.clone(),
                assignments.clone(),
            )
            .with_event_sink(sink.clone()),
        );
        let broadcasts = BroadcastCoordinator::new(
            BroadcastConfig::default(),
            registry.clone(),
            events.clone(),
            journeys.clone(),
            host,
        )
        .with_event_sink(sink.clone());

        Pipeline {
            ws: Uuid::new_v4(),
            events,
            registry,
            assignments,
            evaluator,
            journeys,
            broadcasts,
            transport,
            sink,
        }
    }

    impl Pipeline {
        /// One evaluation cycle ending at `to_ms`, with every membership delta
        /// handed to the journey engine.
        async fn cycle(&self, to_ms: i64) -> usize {
            let outcome = self.evaluator.evaluate_until(self.ws, at(to_ms)).unwrap();
            for update in &outcome.segment_updates {
                self.journeys.on_segment_update(update, at(to_ms)).await;
            }
            outcome.segment_updates.len()
        }

        fn journey(&self, nodes: Vec<JourneyNode>) -> Uuid {
            self.journeys
                .create_journey(Journey {
                    id: Uuid::new_v4(),
                    workspace_id: self.ws,
                    name: "pipeline".into(),
                    status: JourneyStatus::Published,
                    definition: JourneyDefinition::new(nodes),
                    re_entry: ReEntryPolicy::Coalesce,
                    can_run_multiple: true,
                    created_at: at(0),
                    updated_at: at(0),
                    version: 1,
                })
                .unwrap()
        }
    }

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    fn identify(ws: Uuid, user: &str, message_id: &str, ms: i64, traits: Value) -> Event {
        Event {
            workspace_id: ws,
            user_id: Some(user.into()),
            anonymous_id: None,
            message_id: message_id.into(),
            event_type: EventType::Identify,
            event: None,
            timestamp: at(ms),
            properties: json!({ "traits": traits }),
        }
    }

    fn track(ws: Uuid, user: &str, message_id: &str, ms: i64, name: &str, properties: Value) -> Event {
        Event {
            event_type: EventType::Track,
            event: Some(name.into()),
            properties,
            ..identify(ws, user, message_id, ms, json!({}))
        }
    }

    fn email(template: &str, child: usize) -> JourneyNode {
        JourneyNode::Message {
            channel: ChannelType::Email,
            template_id: template.into(),
            child,
        }
    }

    #[tokio::test]
    async fn test_plan_upgrade_sends_welcome_once() {
        let p = pipeline();
        let paid = p
            .registry
            .upsert_segment_by_name(p.ws, "Paid", SegmentNode::trait_equals("plan", json!("paid")), at(0))
            .unwrap();
        let journey = p.journey(vec![
            JourneyNode::Entry {
                segment_id: paid.id,
                child: 1,
            },
            email("welcome-paid", 2),
            JourneyNode::Exit,
        ]);

        let batch = vec![
            identify(p.ws, "u1", "m1", 0, json!({"plan": "free"})),
            identify(p.ws, "u1", "m2", 100, json!({"plan": "paid"})),
        ];
        p.events.insert_batch(p.ws, batch.clone()).unwrap();
        assert_eq!(p.cycle(150).await, 1);

        let assignment = p.assignments.get(p.ws, "u1", paid.id).unwrap().unwrap();
        assert_eq!(assignment.value, AssignmentValue::Segment(true));
        assert_eq!(p.transport.delivered_count(), 1);

        // Replaying the same batch changes nothing downstream.
        let replay = p.events.insert_batch(p.ws, batch).unwrap();
        assert_eq!(replay.duplicate_count, 2);
        assert_eq!(p.cycle(300).await, 0);
        assert_eq!(p.assignments.get(p.ws, "u1", paid.id).unwrap().unwrap().value, assignment.value);
        assert_eq!(p.transport.delivered_count(), 1);
        assert_eq!(
            p.journeys.instance(&journey, "u1").unwrap().unwrap().state,
            InstanceState::Completed
        );
    }

    #[tokio::test]
    async fn test_wait_resolves_from_evaluated_purchase() {
        let p = pipeline();
        let signed_up = p
            .registry
            .upsert_segment_by_name(p.ws, "Signed up", SegmentBuilder::new().trait_exists("email").build(), at(0))
            .unwrap();
        let buyers = p
            .registry
            .upsert_segment_by_name(p.ws, "Buyers", SegmentBuilder::new().performed("Purchase", 1, None).build(), at(0))
            .unwrap();
        let journey = p.journey(vec![
            JourneyNode::Entry {
                segment_id: signed_up.id,
                child: 1,
            },
            JourneyNode::Delay {
                variant: DelayVariant::UntilSegmentEnter {
                    segment_id: buyers.id,
                    timeout_millis: Some(1_000),
                    on_timeout: TimeoutAction::Exit,
                },
                child: 2,
            },
            email("thanks", 3),
            JourneyNode::Exit,
        ]);

        p.events
            .insert_batch(p.ws, vec![identify(p.ws, "u1", "m1", 0, json!({"email": "u1@example.com"}))])
            .unwrap();
        p.cycle(100).await;
        assert!(matches!(
            p.journeys.instance(&journey, "u1").unwrap().unwrap().state,
            InstanceState::Waiting { node: 1, .. }
        ));

        p.events
            .insert_batch(p.ws, vec![track(p.ws, "u1", "m2", 500, "Purchase", json!({}))])
            .unwrap();
        p.cycle(600).await;
        assert_eq!(p.journeys.tick(at(2_000)).await.unwrap(), 0);

        let delivered = p.transport.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].template_id, "thanks");
        assert_eq!(p.journeys.get_stats(&journey).unwrap().completed, 1);
    }

    #[tokio::test]
    async fn test_broadcast_skips_unsubscribed_users() {
        let p = pipeline();
        let group = Uuid::new_v4();
        p.events
            .insert_batch(
                p.ws,
                vec![
                    identify(p.ws, "u1", "m1", 0, json!({})),
                    identify(p.ws, "u2", "m2", 0, json!({})),
                    identify(p.ws, "u3", "m3", 0, json!({})),
                    track(
                        p.ws,
                        "u2",
                        "m4",
                        10,
                        "subscription_change",
                        json!({"subscription_group_id": group, "action": "unsubscribe"}),
                    ),
                ],
            )
            .unwrap();

        let broadcast = p
            .broadcasts
            .upsert(
                UpsertBroadcast {
                    workspace_id: p.ws,
                    name: "launch".into(),
                    segment_definition: None,
                    message_template: MessageTemplateDefinition {
                        channel: ChannelType::Email,
                        template_id: None,
                    },
                    subscription_group_id: Some(group),
                },
                at(50),
            )
            .unwrap();

        let outcome = p.broadcasts.trigger(p.ws, &broadcast.id, at(100)).await.unwrap();
        assert_eq!(outcome, TriggerOutcome::Triggered { audience: 2 });
        let mut users: Vec<String> = p.transport.delivered().into_iter().map(|m| m.user_id).collect();
        users.sort();
        assert_eq!(users, vec!["u1".to_string(), "u3".to_string()]);
        assert!(p
            .transport
            .delivered()
            .iter()
            .all(|m| m.template_id == format!("Broadcast - {}", broadcast.id)));
        assert_eq!(
            p.broadcasts.get(p.ws, &broadcast.id).unwrap().status,
            BroadcastStatus::Completed
        );

        // The evaluator later computes the synthesized segment too; the
        // finished broadcast admits nobody new.
        p.cycle(200).await;
        assert_eq!(p.transport.delivered_count(), 2);
        assert_eq!(p.sink.count_kind(LifecycleKind::BroadcastInProgress), 1);
        assert_eq!(p.sink.count_kind(LifecycleKind::BroadcastCompleted), 1);
    }
}
