//! End-to-end behaviour of the batch workers against the in-memory broker.

use std::sync::Arc;
use std::time::Duration;

use batchwire::{
    board_summary_worker, chat_summary_worker, conversation_title_worker, BatchWorkerConfig,
    CancellationToken, ChatRole, EventEnvelope, EventType, WorkerError, WorkerState,
};
use batchwire_testing::{FailingSubscription, InMemoryBroker, Outcome, Recorder};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(1);

fn user_message(conversation: &str) -> EventEnvelope {
    EventEnvelope::chat_message(conversation, Uuid::new_v4(), ChatRole::User)
}

fn assistant_message(conversation: &str) -> EventEnvelope {
    EventEnvelope::chat_message(conversation, Uuid::new_v4(), ChatRole::Assistant)
}

fn config(subscription: &str, batch_size: usize, interval_ms: u64) -> BatchWorkerConfig {
    BatchWorkerConfig::new(subscription)
        .with_batch_size(batch_size)
        .with_flush_interval(Duration::from_millis(interval_ms))
}

#[tokio::test(start_paused = true)]
async fn twenty_distinct_keys_with_batch_of_five_flush_four_times() {
    let broker = InMemoryBroker::new();
    let subscription = broker.subscribe("chat", "titles");
    let recorder = Arc::new(Recorder::new());
    let worker = Arc::new(
        conversation_title_worker(subscription, Arc::clone(&recorder), config("titles", 5, 50))
            .unwrap(),
    );

    for i in 0..20 {
        broker.publish_envelope("chat", &user_message(&format!("conv-{i}")));
    }

    let cancel = CancellationToken::new();
    let running = tokio::spawn({
        let worker = Arc::clone(&worker);
        let cancel = cancel.clone();
        async move { worker.run(cancel).await }
    });

    broker.wait_for_settled("titles", 20, WAIT).await;
    cancel.cancel();
    running.await.unwrap().unwrap();

    let stats = worker.stats();
    assert_eq!(stats.flushes, 4);
    assert_eq!(stats.groups, 20);
    assert_eq!(stats.last.groups, 5);
    assert_eq!(recorder.call_count(), 20);
    assert_eq!(broker.acked("titles"), 20);
}

#[tokio::test(start_paused = true)]
async fn burst_for_one_conversation_triggers_one_call_with_the_last_event() {
    let broker = InMemoryBroker::new();
    let subscription = broker.subscribe("chat", "summaries");
    let recorder = Arc::new(Recorder::new());
    let worker = chat_summary_worker(
        subscription,
        Arc::clone(&recorder),
        config("summaries", 50, 100),
    )
    .unwrap();

    let burst: Vec<_> = (0..5).map(|_| assistant_message("conv-a")).collect();
    for event in &burst {
        broker.publish_envelope("chat", event);
    }
    broker.publish_envelope("chat", &assistant_message("conv-b"));

    let cancel = CancellationToken::new();
    let (result, ()) = tokio::join!(worker.run(cancel.clone()), async {
        broker.wait_for_settled("summaries", 6, WAIT).await;
        cancel.cancel();
    });
    result.unwrap();

    let calls = recorder.calls_for("conv-a");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0], burst[4]);
    assert_eq!(recorder.calls_for("conv-b").len(), 1);
    assert_eq!(broker.acked("summaries"), 6);
}

#[tokio::test(start_paused = true)]
async fn interleaved_keys_are_called_once_each() {
    let broker = InMemoryBroker::new();
    let subscription = broker.subscribe("chat", "titles");
    let recorder = Arc::new(Recorder::new());
    let worker = conversation_title_worker(
        subscription,
        Arc::clone(&recorder),
        config("titles", 100, 50),
    )
    .unwrap();

    let keys = ["k1", "k2", "k3", "k4"];
    let mut events: Vec<EventEnvelope> = keys
        .iter()
        .flat_map(|key| (0..3).map(move |_| user_message(key)))
        .collect();
    fastrand::shuffle(&mut events);
    for event in &events {
        broker.publish_envelope("chat", event);
    }

    let cancel = CancellationToken::new();
    let (result, ()) = tokio::join!(worker.run(cancel.clone()), async {
        broker.wait_for_settled("titles", events.len(), WAIT).await;
        cancel.cancel();
    });
    result.unwrap();

    assert_eq!(recorder.call_count(), keys.len());
    for key in keys {
        let last_for_key = events
            .iter()
            .rev()
            .find(|event| event.conversation() == Some(key))
            .unwrap();
        assert_eq!(recorder.calls_for(key), vec![last_for_key.clone()]);
    }
}

#[tokio::test(start_paused = true)]
async fn full_batch_flushes_without_waiting_for_the_timer() {
    let broker = InMemoryBroker::new();
    let subscription = broker.subscribe("todos", "board");
    let recorder = Arc::new(Recorder::new());
    let worker = Arc::new(
        board_summary_worker(subscription, Arc::clone(&recorder), config("board", 3, 60_000))
            .unwrap(),
    );

    for _ in 0..3 {
        broker.publish_envelope("todos", &EventEnvelope::todo(EventType::TodoUpdated));
    }

    let start = tokio::time::Instant::now();
    let cancel = CancellationToken::new();
    let running = tokio::spawn({
        let worker = Arc::clone(&worker);
        let cancel = cancel.clone();
        async move { worker.run(cancel).await }
    });

    recorder.wait_for_calls(1, WAIT).await;
    assert!(start.elapsed() < Duration::from_secs(60));
    broker.wait_for_settled("board", 3, WAIT).await;

    cancel.cancel();
    running.await.unwrap().unwrap();
    assert_eq!(worker.stats().flushes, 1);
    assert_eq!(recorder.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn partial_batch_flushes_once_per_interval() {
    let broker = InMemoryBroker::new();
    let subscription = broker.subscribe("todos", "board");
    let recorder = Arc::new(Recorder::new());
    // Default board summary config: batch 50, every 3 s.
    let worker = Arc::new(
        board_summary_worker(subscription, Arc::clone(&recorder), BatchWorkerConfig::default())
            .unwrap(),
    );
    assert_eq!(worker.config().batch_size, 50);
    assert_eq!(worker.config().flush_interval, Duration::from_secs(3));

    broker.publish_envelope("todos", &EventEnvelope::todo(EventType::TodoCreated));
    broker.publish_envelope("todos", &EventEnvelope::todo(EventType::TodoDeleted));

    let cancel = CancellationToken::new();
    let running = tokio::spawn({
        let worker = Arc::clone(&worker);
        let cancel = cancel.clone();
        async move { worker.run(cancel).await }
    });

    tokio::time::sleep(Duration::from_millis(2_900)).await;
    assert_eq!(recorder.call_count(), 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(recorder.call_count(), 1);
    assert_eq!(worker.stats().flushes, 1);
    assert_eq!(worker.stats().last.received, 2);

    // Nothing new: further ticks are no-ops.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(worker.stats().flushes, 1);

    cancel.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn irrelevant_event_is_acked_and_never_handled() {
    let broker = InMemoryBroker::new();
    let subscription = broker.subscribe("events", "summaries");
    let recorder = Arc::new(Recorder::new());
    let worker = chat_summary_worker(
        subscription,
        Arc::clone(&recorder),
        config("summaries", 5, 50),
    )
    .unwrap();

    let id = broker.publish_envelope("events", &EventEnvelope::todo(EventType::TodoCreated));

    let cancel = CancellationToken::new();
    let (result, ()) = tokio::join!(worker.run(cancel.clone()), async {
        broker.wait_for_settled("summaries", 1, WAIT).await;
        cancel.cancel();
    });
    result.unwrap();

    assert_eq!(recorder.call_count(), 0);
    assert_eq!(broker.outcome_of("summaries", &id), vec![Outcome::Acked]);
}

#[tokio::test(start_paused = true)]
async fn malformed_payload_is_nacked_and_the_loop_keeps_going() {
    let broker = InMemoryBroker::new();
    let subscription = broker.subscribe("chat", "titles");
    let recorder = Arc::new(Recorder::new());
    let worker = Arc::new(
        conversation_title_worker(subscription, Arc::clone(&recorder), config("titles", 1, 50))
            .unwrap(),
    );

    let garbage = broker.publish_bytes("chat", b"\x00\xffnot json".to_vec());

    let cancel = CancellationToken::new();
    let running = tokio::spawn({
        let worker = Arc::clone(&worker);
        let cancel = cancel.clone();
        async move { worker.run(cancel).await }
    });

    broker.wait_for_settled("titles", 1, WAIT).await;
    assert_eq!(broker.outcome_of("titles", &garbage), vec![Outcome::Nacked]);
    assert_eq!(worker.state(), WorkerState::Running);

    let valid = broker.publish_envelope("chat", &user_message("conv-1"));
    broker.wait_for_settled("titles", 2, WAIT).await;

    cancel.cancel();
    running.await.unwrap().unwrap();
    assert_eq!(broker.outcome_of("titles", &valid), vec![Outcome::Acked]);
    assert_eq!(recorder.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_handler_nacks_and_redelivery_succeeds_later() {
    let broker = InMemoryBroker::new();
    let subscription = broker.subscribe_with_redelivery("chat", "titles", 5);
    let recorder = Arc::new(Recorder::new());
    recorder.fail_next(1);
    let worker = conversation_title_worker(
        subscription,
        Arc::clone(&recorder),
        config("titles", 1, 50),
    )
    .unwrap();

    let event = user_message("conv-1");
    let id = broker.publish_envelope("chat", &event);

    let cancel = CancellationToken::new();
    let (result, ()) = tokio::join!(worker.run(cancel.clone()), async {
        broker.wait_for_settled("titles", 2, WAIT).await;
        cancel.cancel();
    });
    result.unwrap();

    assert_eq!(
        broker.outcome_of("titles", &id),
        vec![Outcome::Nacked, Outcome::Acked]
    );
    assert_eq!(recorder.calls_for("conv-1"), vec![event.clone(), event.clone()]);
    assert_eq!(recorder.effects().get("conv-1"), Some(&event.chat_message_id));
}

#[tokio::test(start_paused = true)]
async fn one_failing_conversation_does_not_hold_back_the_others() {
    let broker = InMemoryBroker::new();
    let subscription = broker.subscribe("chat", "summaries");
    let recorder = Arc::new(Recorder::new());
    recorder.fail_conversation("broken");
    let worker = chat_summary_worker(
        subscription,
        Arc::clone(&recorder),
        config("summaries", 3, 50),
    )
    .unwrap();

    let broken = broker.publish_envelope("chat", &assistant_message("broken"));
    let fine = broker.publish_envelope("chat", &assistant_message("fine"));
    let broken_again = broker.publish_envelope("chat", &assistant_message("broken"));

    let cancel = CancellationToken::new();
    let (result, ()) = tokio::join!(worker.run(cancel.clone()), async {
        broker.wait_for_settled("summaries", 3, WAIT).await;
        cancel.cancel();
    });
    result.unwrap();

    assert_eq!(broker.outcome_of("summaries", &broken), vec![Outcome::Nacked]);
    assert_eq!(broker.outcome_of("summaries", &broken_again), vec![Outcome::Nacked]);
    assert_eq!(broker.outcome_of("summaries", &fine), vec![Outcome::Acked]);
    assert_eq!(recorder.calls_for("broken").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn duplicate_deliveries_have_the_effect_of_one() {
    let event = user_message("conv-1");

    let single = {
        let broker = InMemoryBroker::new();
        let subscription = broker.subscribe("chat", "titles");
        let recorder = Arc::new(Recorder::new());
        let worker = conversation_title_worker(
            subscription,
            Arc::clone(&recorder),
            config("titles", 1, 50),
        )
        .unwrap();
        broker.publish_envelope("chat", &event);

        let cancel = CancellationToken::new();
        let (result, ()) = tokio::join!(worker.run(cancel.clone()), async {
            broker.wait_for_settled("titles", 1, WAIT).await;
            cancel.cancel();
        });
        result.unwrap();
        recorder.effects()
    };

    let repeated = {
        let broker = InMemoryBroker::new();
        let subscription = broker.subscribe("chat", "titles");
        let recorder = Arc::new(Recorder::new());
        let worker = conversation_title_worker(
            subscription,
            Arc::clone(&recorder),
            config("titles", 1, 50),
        )
        .unwrap();
        for _ in 0..4 {
            broker.publish_envelope("chat", &event);
        }

        let cancel = CancellationToken::new();
        let (result, ()) = tokio::join!(worker.run(cancel.clone()), async {
            broker.wait_for_settled("titles", 4, WAIT).await;
            cancel.cancel();
        });
        result.unwrap();
        assert_eq!(recorder.call_count(), 4);
        recorder.effects()
    };

    assert_eq!(single, repeated);
}

#[tokio::test(start_paused = true)]
async fn cancellation_mid_flush_returns_promptly_and_settles_the_group() {
    let broker = InMemoryBroker::new();
    let subscription = broker.subscribe("todos", "board");
    let recorder = Arc::new(Recorder::new().with_delay(Duration::from_secs(30)));
    let worker = Arc::new(
        board_summary_worker(subscription, Arc::clone(&recorder), config("board", 2, 50))
            .unwrap(),
    );

    let first = broker.publish_envelope("todos", &EventEnvelope::todo(EventType::TodoCreated));
    let second = broker.publish_envelope("todos", &EventEnvelope::todo(EventType::TodoUpdated));

    let cancel = CancellationToken::new();
    let running = tokio::spawn({
        let worker = Arc::clone(&worker);
        let cancel = cancel.clone();
        async move { worker.run(cancel).await }
    });

    recorder.wait_for_calls(1, WAIT).await;
    cancel.cancel();

    tokio::time::timeout(WAIT, running)
        .await
        .expect("run returns within the bound")
        .unwrap()
        .unwrap();

    assert_eq!(worker.state(), WorkerState::Stopped);
    assert_eq!(broker.outcome_of("board", &first), vec![Outcome::Nacked]);
    assert_eq!(broker.outcome_of("board", &second), vec![Outcome::Nacked]);
    assert_eq!(worker.stats().failed_groups, 1);
}

#[tokio::test(start_paused = true)]
async fn subscription_setup_failure_is_returned_from_run() {
    let recorder = Arc::new(Recorder::new());
    let worker = chat_summary_worker(
        FailingSubscription::new("summaries", "subscription does not exist"),
        recorder,
        BatchWorkerConfig::default(),
    )
    .unwrap();

    let err = worker.run(CancellationToken::new()).await.unwrap_err();

    match err {
        WorkerError::Subscription { worker, source } => {
            assert_eq!(worker, "chat_summary");
            assert!(source.to_string().contains("subscription does not exist"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(worker.state(), WorkerState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn workers_on_the_same_topic_are_independent() {
    let broker = InMemoryBroker::new();
    let titles = Arc::new(Recorder::new());
    let summaries = Arc::new(Recorder::new());
    let title_worker = conversation_title_worker(
        broker.subscribe("chat", "titles"),
        Arc::clone(&titles),
        config("titles", 10, 50),
    )
    .unwrap();
    let summary_worker = chat_summary_worker(
        broker.subscribe("chat", "summaries"),
        Arc::clone(&summaries),
        config("summaries", 10, 50),
    )
    .unwrap();

    broker.publish_envelope("chat", &user_message("conv-1"));
    broker.publish_envelope("chat", &assistant_message("conv-1"));
    broker.publish_envelope("chat", &user_message("conv-2"));

    let cancel = CancellationToken::new();
    let (titles_result, summaries_result, ()) = tokio::join!(
        title_worker.run(cancel.clone()),
        summary_worker.run(cancel.clone()),
        async {
            broker.wait_for_settled("titles", 3, WAIT).await;
            broker.wait_for_settled("summaries", 3, WAIT).await;
            cancel.cancel();
        }
    );
    titles_result.unwrap();
    summaries_result.unwrap();

    assert_eq!(titles.call_count(), 2);
    assert_eq!(summaries.call_count(), 1);
    assert_eq!(broker.acked("titles"), 3);
    assert_eq!(broker.acked("summaries"), 3);
}

#[tokio::test(start_paused = true)]
async fn config_names_the_subscription_the_worker_reads() {
    let broker = InMemoryBroker::new();
    let recorder = Arc::new(Recorder::new());
    let worker = board_summary_worker(
        broker.subscribe("todos", "board-v2"),
        Arc::clone(&recorder),
        BatchWorkerConfig::default(),
    )
    .unwrap();
    assert_eq!(worker.config().subscription, "board-v2");

    broker.publish_envelope("todos", &EventEnvelope::todo(EventType::TodoCreated));
    let cancel = CancellationToken::new();
    let (result, ()) = tokio::join!(worker.run(cancel.clone()), async {
        broker.wait_for_settled("board-v2", 1, WAIT).await;
        cancel.cancel();
    });
    result.unwrap();
    assert_eq!(recorder.call_count(), 1);
}

#[test]
fn config_naming_another_subscription_is_rejected() {
    let broker = InMemoryBroker::new();
    let result = board_summary_worker(
        broker.subscribe("todos", "board-v3"),
        Arc::new(Recorder::new()),
        BatchWorkerConfig::new("something-else"),
    );

    match result {
        Err(WorkerError::SubscriptionMismatch {
            worker,
            configured,
            actual,
        }) => {
            assert_eq!(worker, "board_summary");
            assert_eq!(configured, "something-else");
            assert_eq!(actual, "board-v3");
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("worker accepted a config for another subscription"),
    }
}

#[tokio::test(start_paused = true)]
async fn oversized_batch_size_is_capped_instead_of_panicking() {
    let broker = InMemoryBroker::new();
    let recorder = Arc::new(Recorder::new());
    let config: BatchWorkerConfig =
        serde_json::from_str(r#"{"batch_size":4611686018427387904,"flush_interval_ms":50}"#)
            .unwrap();
    let worker =
        chat_summary_worker(broker.subscribe("chat", "summaries"), Arc::clone(&recorder), config)
            .unwrap();
    assert_eq!(worker.config().batch_size, batchwire::MAX_BATCH_SIZE);

    broker.publish_envelope("chat", &assistant_message("conv-1"));
    let cancel = CancellationToken::new();
    let (result, ()) = tokio::join!(worker.run(cancel.clone()), async {
        broker.wait_for_settled("summaries", 1, WAIT).await;
        cancel.cancel();
    });
    result.unwrap();
    assert_eq!(recorder.call_count(), 1);
}
