//! Integration tests for the full submission/consumption pipeline.
//!
//! Tests: submit_batch → QueueStore → MessageBus → ConsumptionScheduler → ClaimValidator → Evaluator
//!
//! Verifies:
//! - A batch commits once with every entry queued and claimed
//! - Claim failures compensate and roll back; dispatch failures roll back
//! - Consumption matches messages to claims and forwards them

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::{Value as JsonValue, json};

    use claimflow_core::{IncomingRequest, QueueEntryId, RequestingUser, WorkItemId};
    use claimflow_messaging::{BusError, ConsumedMessage, DispatchEnvelope, InMemoryMessageBus, MessageBus};

    use crate::config::{PipelineConfig, ValidationPolicy};
    use crate::evaluator::{ClaimEvaluator, EvaluationError};
    use crate::pipeline::{
        BatchOrchestrator, BatchStep, CodeValidation, ConsumptionOutcome, ConsumptionScheduler,
        PipelineError,
    };
    use crate::queue_store::{EntryStatus, InMemoryQueueStore, PersistenceError};
    use crate::reference_cache::{InMemoryReferenceCache, ReferenceCache, cache_key};

    /// Evaluator that records every forwarded claim.
    #[derive(Default)]
    struct RecordingEvaluator {
        calls: Mutex<Vec<(JsonValue, String)>>,
        reject: AtomicBool,
    }

    impl RecordingEvaluator {
        fn calls(&self) -> Vec<(JsonValue, String)> {
            self.calls.lock().unwrap().clone()
        }

        fn forwarded_ians(&self) -> Vec<String> {
            self.calls()
                .iter()
                .map(|(claim, _)| claim["ians"][0].as_str().unwrap().to_string())
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl ClaimEvaluator for RecordingEvaluator {
        async fn evaluate(&self, claim: &JsonValue, user: &RequestingUser) -> Result<(), EvaluationError> {
            self.calls.lock().unwrap().push((claim.clone(), user.id.clone()));
            if self.reject.load(Ordering::SeqCst) {
                return Err(EvaluationError::Rejected {
                    status: 422,
                    message: "sample rejected".to_string(),
                });
            }
            Ok(())
        }
    }

    struct Harness {
        store: Arc<InMemoryQueueStore>,
        bus: Arc<InMemoryMessageBus>,
        cache: Arc<InMemoryReferenceCache>,
        evaluator: Arc<RecordingEvaluator>,
        orchestrator: BatchOrchestrator<InMemoryQueueStore>,
        config: PipelineConfig,
    }

    fn harness_with(store: InMemoryQueueStore, bus: InMemoryMessageBus, config: PipelineConfig) -> Harness {
        let store = Arc::new(store);
        let bus = Arc::new(bus);
        let cache = Arc::new(InMemoryReferenceCache::new());
        let evaluator = Arc::new(RecordingEvaluator::default());
        let orchestrator = BatchOrchestrator::assemble(
            store.clone(),
            bus.clone() as Arc<dyn MessageBus>,
            cache.clone() as Arc<dyn ReferenceCache>,
            evaluator.clone() as Arc<dyn ClaimEvaluator>,
            &config,
        );
        Harness {
            store,
            bus,
            cache,
            evaluator,
            orchestrator,
            config,
        }
    }

    fn harness() -> Harness {
        harness_with(InMemoryQueueStore::new(), InMemoryMessageBus::new(), PipelineConfig::default())
    }

    fn ian(s: &str) -> WorkItemId {
        WorkItemId::new(s).unwrap()
    }

    fn user() -> RequestingUser {
        RequestingUser::new("U").with_username("lab.user")
    }

    fn request(ians: &[&str]) -> IncomingRequest {
        serde_json::from_value(json!({
            "method": "POST",
            "url": "/lab-tests",
            "request_body": {
                "ians": ians,
                "test_code": "TM-1",
                "sample": {"sample_code": "ST-1"},
            },
        }))
        .unwrap()
    }

    fn consumed(envelope: DispatchEnvelope) -> ConsumedMessage {
        ConsumedMessage {
            delivery_id: format!("test-{}", envelope.message_id()),
            envelope,
            delivered_at: Utc::now(),
        }
    }

    fn claim_payload(store: &InMemoryQueueStore, entry_id: QueueEntryId) -> JsonValue {
        store
            .claims()
            .into_iter()
            .find(|c| c.queue_entry_id == entry_id)
            .map(|c| c.claim)
            .unwrap()
    }

    fn transaction_failure(err: PipelineError) -> (BatchStep, Option<WorkItemId>, PipelineError) {
        match err {
            PipelineError::Transaction(failure) => {
                let failure = *failure;
                (failure.step, failure.work_item, failure.source)
            }
            other => panic!("expected transaction failure, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn batch_creates_queued_entries_and_claims_with_one_commit() {
        let h = harness();

        let receipt = h
            .orchestrator
            .submit_batch(&request(&["A1", "A2", "A3"]), &user())
            .await
            .unwrap();

        let ians: Vec<_> = receipt.items.iter().map(|i| i.ian.as_str().to_string()).collect();
        assert_eq!(ians, vec!["A1", "A2", "A3"]);
        assert_eq!(receipt.consumption.len(), 3);
        assert!(receipt.consumption.iter().all(|c| c.is_scheduled()));

        let entries = h.store.entries();
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| e.status == EntryStatus::Queued));
        assert!(entries.iter().all(|e| e.body.is_some()));
        assert_eq!(h.store.claims().len(), 3);

        let stats = h.store.stats();
        assert_eq!((stats.opened, stats.committed, stats.rolled_back, stats.released), (1, 1, 0, 1));

        let a2 = &h.store.entries_for(&ian("A2"))[0];
        assert_eq!(a2.payload["request_body"]["ians"], json!(["A2"]));
        assert_eq!(a2.payload["method"], json!("POST"));
        assert_eq!(a2.body.as_ref().unwrap()["receipt"]["transport_id"], json!("mem-send-2"));

        let claim = claim_payload(&h.store, a2.id);
        assert_eq!(claim["ians"], json!(["A2"]));
        assert_eq!(claim["test_code"], json!("TM-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn claim_failure_deletes_its_entry_and_stops_the_batch() {
        // Autocommit sessions write through, so compensation is observable.
        let h = harness_with(
            InMemoryQueueStore::autocommit(),
            InMemoryMessageBus::new(),
            PipelineConfig::default(),
        );
        h.store.fail_claim_for(ian("A2"));

        let err = h
            .orchestrator
            .submit_batch(&request(&["A1", "A2", "A3"]), &user())
            .await
            .unwrap_err();

        let (step, work_item, source) = transaction_failure(err);
        assert_eq!(step, BatchStep::CreateClaim);
        assert_eq!(work_item, Some(ian("A2")));
        assert!(matches!(source, PipelineError::Persistence(PersistenceError::Unavailable(_))));

        assert!(h.store.entries_for(&ian("A2")).is_empty());
        assert!(h.store.entries_for(&ian("A3")).is_empty());
        assert_eq!(h.bus.sent().len(), 1);

        let stats = h.store.stats();
        assert_eq!((stats.committed, stats.rolled_back, stats.released), (0, 1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn claim_failure_persists_nothing_once_rolled_back() {
        let h = harness();
        h.store.fail_claim_for(ian("A2"));

        let err = h
            .orchestrator
            .submit_batch(&request(&["A1", "A2"]), &user())
            .await
            .unwrap_err();

        assert!(matches!(err.root(), PipelineError::Persistence(_)));
        assert!(h.store.entries().is_empty());
        assert!(h.store.claims().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_compensation_still_reports_the_claim_error() {
        let h = harness_with(
            InMemoryQueueStore::autocommit(),
            InMemoryMessageBus::new(),
            PipelineConfig::default(),
        );
        h.store.fail_claim_for(ian("A1"));
        h.store.fail_deletes(true);

        let err = h
            .orchestrator
            .submit_batch(&request(&["A1"]), &user())
            .await
            .unwrap_err();

        let (step, _, source) = transaction_failure(err);
        assert_eq!(step, BatchStep::CreateClaim);
        assert!(source.to_string().contains("injected claim failure"));
        assert_eq!(h.store.entries_for(&ian("A1")).len(), 1);
        assert_eq!(h.store.stats().released, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_failure_rolls_back_the_whole_batch() {
        let h = harness();
        h.bus.fail_send_number(2);

        let err = h
            .orchestrator
            .submit_batch(&request(&["A1", "A2", "A3"]), &user())
            .await
            .unwrap_err();

        let (step, work_item, source) = transaction_failure(err);
        assert_eq!(step, BatchStep::Dispatch);
        assert_eq!(work_item, Some(ian("A2")));
        assert!(matches!(source, PipelineError::Dispatch(BusError::Rejected(_))));

        assert!(h.store.entries().is_empty());
        assert!(h.store.claims().is_empty());
        let stats = h.store.stats();
        assert_eq!((stats.committed, stats.rolled_back, stats.released), (0, 1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_failure_leaves_its_entry_pending() {
        // Autocommit sessions write through, so the state before rollback is visible.
        let h = harness_with(
            InMemoryQueueStore::autocommit(),
            InMemoryMessageBus::new(),
            PipelineConfig::default(),
        );
        h.bus.fail_send_number(1);

        let err = h
            .orchestrator
            .submit_batch(&request(&["A1", "A2"]), &user())
            .await
            .unwrap_err();

        let (step, work_item, _) = transaction_failure(err);
        assert_eq!(step, BatchStep::Dispatch);
        assert_eq!(work_item, Some(ian("A1")));

        let entries = h.store.entries_for(&ian("A1"));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, EntryStatus::Pending);
        assert_eq!(entries[0].body, None);
        assert!(h.store.entries_for(&ian("A2")).is_empty());
        assert!(h.bus.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn commit_failure_is_reported_and_session_released() {
        let h = harness();
        h.store.fail_commit(true);

        let err = h
            .orchestrator
            .submit_batch(&request(&["A1"]), &user())
            .await
            .unwrap_err();

        let (step, work_item, _) = transaction_failure(err);
        assert_eq!(step, BatchStep::Commit);
        assert_eq!(work_item, None);
        assert!(h.store.entries().is_empty());
        assert_eq!(h.store.stats().released, 1);
    }

    #[tokio::test]
    async fn empty_batch_is_rejected_before_opening_a_session() {
        let h = harness();

        let err = h
            .orchestrator
            .submit_batch(&request(&[]), &user())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::InvalidRequest(_)));
        assert_eq!(h.store.stats().opened, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unmatched_message_aborts_the_rest_of_the_poll() {
        let h = harness_with(InMemoryQueueStore::new(), InMemoryMessageBus::manual(), PipelineConfig::default());
        h.orchestrator
            .submit_batch(&request(&["A1", "A2"]), &user())
            .await
            .unwrap();

        let sent = h.bus.sent();
        let ghost = DispatchEnvelope::new(QueueEntryId::new(), ian("ZZ"), json!({}));
        let messages = vec![
            consumed(sent[0].clone()),
            consumed(ghost.clone()),
            consumed(sent[1].clone()),
        ];

        let err = h
            .orchestrator
            .validator()
            .process_consumed(&messages, &user())
            .await
            .unwrap_err();

        match err {
            PipelineError::ClaimNotFound { message_id, entry_id } => {
                assert_eq!(message_id, ghost.message_id());
                assert_eq!(entry_id, ghost.queue_entry_id());
            }
            other => panic!("expected ClaimNotFound, got {other:?}"),
        }
        assert_eq!(h.evaluator.forwarded_ians(), vec!["A1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn advisory_policy_forwards_whatever_the_validation_outcome() {
        let h = harness_with(InMemoryQueueStore::new(), InMemoryMessageBus::manual(), PipelineConfig::default());
        h.orchestrator
            .submit_batch(&request(&["A1"]), &user())
            .await
            .unwrap();
        let messages: Vec<_> = h.bus.sent().into_iter().map(consumed).collect();

        // Nothing cached yet.
        let report = h
            .orchestrator
            .validator()
            .process_consumed(&messages, &user())
            .await
            .unwrap();
        assert_eq!(report.forwarded[0].validation, CodeValidation::AllowListMissing);

        // Cached, but ST-1 is not allow-listed.
        h.cache
            .insert(cache_key(&h.config.allowed_code_lists, &user()), ["TM-1"]);
        let report = h
            .orchestrator
            .validator()
            .process_consumed(&messages, &user())
            .await
            .unwrap();
        assert_eq!(
            report.forwarded[0].validation,
            CodeValidation::UnknownCodes(vec!["ST-1".to_string()])
        );

        assert_eq!(h.evaluator.calls().len(), 2);
        assert!(h.evaluator.calls().iter().all(|(_, user_id)| user_id == "U"));
    }

    #[tokio::test(start_paused = true)]
    async fn enforce_policy_rejects_invalid_claims_and_marks_them_failed() {
        let config = PipelineConfig {
            validation_policy: ValidationPolicy::Enforce,
            ..PipelineConfig::default()
        };
        let h = harness_with(InMemoryQueueStore::new(), InMemoryMessageBus::manual(), config);
        h.cache
            .insert(cache_key(&h.config.allowed_code_lists, &user()), ["TM-1"]);
        h.orchestrator
            .submit_batch(&request(&["A1"]), &user())
            .await
            .unwrap();
        let messages: Vec<_> = h.bus.sent().into_iter().map(consumed).collect();

        let err = h
            .orchestrator
            .validator()
            .process_consumed(&messages, &user())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::InvalidClaim { .. }));
        assert!(h.evaluator.calls().is_empty());
        let status = h.orchestrator.get_status(&ian("A1")).await.unwrap();
        assert_eq!(status.status, EntryStatus::Failed);
        assert!(status.message.unwrap().contains("ST-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn evaluator_rejection_marks_entry_failed() {
        let h = harness_with(InMemoryQueueStore::new(), InMemoryMessageBus::manual(), PipelineConfig::default());
        h.evaluator.reject.store(true, Ordering::SeqCst);
        h.orchestrator
            .submit_batch(&request(&["A1"]), &user())
            .await
            .unwrap();
        let messages: Vec<_> = h.bus.sent().into_iter().map(consumed).collect();

        let err = h
            .orchestrator
            .validator()
            .process_consumed(&messages, &user())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Evaluation(EvaluationError::Rejected { status: 422, .. })));
        let status = h.orchestrator.get_status(&ian("A1")).await.unwrap();
        assert_eq!(status.status, EntryStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn message_delivered_before_the_poll_is_forwarded_and_late_one_is_missed() {
        let h = harness_with(InMemoryQueueStore::new(), InMemoryMessageBus::manual(), PipelineConfig::default());
        let receipt = h
            .orchestrator
            .submit_batch(&request(&["A1", "A2"]), &user())
            .await
            .unwrap();

        assert!(h.bus.deliver(receipt.items[0].entry_id));

        let mut forwarded = 0;
        let mut empty_polls = 0;
        for handle in receipt.consumption {
            match handle.join().await {
                Some(Ok(ConsumptionOutcome::Routed(report))) => forwarded += report.forwarded.len(),
                Some(Ok(ConsumptionOutcome::NoMessages)) => empty_polls += 1,
                other => panic!("unexpected consumption outcome: {other:?}"),
            }
        }

        assert_eq!(forwarded, 1);
        assert_eq!(empty_polls, 1);
        assert_eq!(h.evaluator.forwarded_ians(), vec!["A1"]);
        assert_eq!(h.bus.in_flight_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn additional_polls_pick_up_late_deliveries() {
        let mut config = PipelineConfig::default();
        config.consumption.max_polls = 3;
        config.consumption.poll_interval = Duration::from_secs(5);
        let h = harness_with(InMemoryQueueStore::new(), InMemoryMessageBus::manual(), config);

        let mut receipt = h
            .orchestrator
            .submit_batch(&request(&["A1"]), &user())
            .await
            .unwrap();

        // First poll at t=10s finds nothing; deliver before the second at t=15s.
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(h.bus.drain_count(), 1);
        h.bus.deliver_all();

        let outcome = receipt.consumption.remove(0).join().await.unwrap().unwrap();
        assert!(matches!(outcome, ConsumptionOutcome::Routed(ref r) if r.forwarded.len() == 1));
        assert_eq!(h.bus.drain_count(), 2);
    }

    #[tokio::test]
    async fn status_reflects_the_latest_entry() {
        let h = harness();
        assert!(matches!(
            h.orchestrator.get_status(&ian("A1")).await,
            Err(PipelineError::UnknownWorkItem(_))
        ));

        h.orchestrator
            .submit_batch(&request(&["A1"]), &user())
            .await
            .unwrap();
        let status = h.orchestrator.get_status(&ian("A1")).await.unwrap();
        assert_eq!(status.status, EntryStatus::Queued);
        assert_eq!(status.message, None);
    }

    #[test]
    fn scheduling_without_a_runtime_is_logged_not_raised() {
        let h = harness();
        let scheduler: &ConsumptionScheduler<InMemoryQueueStore> = h.orchestrator.dispatcher().scheduler();
        assert!(!scheduler.schedule(&user()).is_scheduled());
    }
}
