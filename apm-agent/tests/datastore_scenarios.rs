use std::time::Duration;

use apm_agent::config::AgentConfig;
use apm_agent::datastore::{ClientOptions, PoolConfig, Reply, Transport};
use apm_agent::primitives::{LibraryVersion, Product};
use apm_agent::telemetry::{
    CollectingSink, ExpectedMetrics, Mismatch, StatsEngine, TelemetryResult, Tracer, validate,
};
use apm_agent::testkit::{
    DEFAULT_SENTINEL, ReceiptLog, ScenarioEnv, delivery_channel, publish_and_confirm, spawn_reader,
};
use uuid::Uuid;

const TIMEOUT: Duration = Duration::from_secs(10);

fn env() -> ScenarioEnv {
    ScenarioEnv::new(Product::new("Valkey").unwrap(), "localhost", 6379)
}

fn instance_metric(env: &ScenarioEnv) -> String {
    let id = env.resolver().resolve("localhost", 6379);
    format!("Datastore/instance/Valkey/{id}")
}

fn rollup_ladder(instance: &str, all: u64) -> Vec<(String, u64)> {
    vec![
        ("Datastore/all".to_owned(), all),
        ("Datastore/allOther".to_owned(), all),
        ("Datastore/Valkey/all".to_owned(), all),
        ("Datastore/Valkey/allOther".to_owned(), all),
        (instance.to_owned(), all),
    ]
}

fn with_ladder(
    expected: ExpectedMetrics,
    ladder: &[(String, u64)],
) -> TelemetryResult<ExpectedMetrics> {
    expected.with_rollup(ladder.iter().map(|(name, count)| (name.as_str(), *count)))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connection_pool_records_each_command_once() {
    let env = env();
    let client = env.pooled_client(PoolConfig::default()).unwrap();
    let tracer = Tracer::default();

    let ((), summary) = tracer
        .run_background_task("test_async_connection_pool", |ctx| async move {
            client.set(&ctx, "key1", "value1").await.unwrap();
            client.get(&ctx, "key1").await.unwrap();
            client.execute_command(&ctx, &["CLIENT", "LIST"]).await.unwrap();
        })
        .await
        .unwrap();

    let operations = [
        ("Datastore/operation/Valkey/get", 1),
        ("Datastore/operation/Valkey/set", 1),
        ("Datastore/operation/Valkey/client_list", 1),
    ];
    let expected = ExpectedMetrics::new(Some("test_async_connection_pool"), true)
        .with_scoped(operations)
        .and_then(|e| e.with_rollup(operations))
        .and_then(|e| with_ladder(e, &rollup_ladder(&instance_metric(&env), 3)))
        .unwrap();
    validate(&summary, &expected).into_result().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn buffered_pipeline_commands_record_nothing() {
    let env = env();
    let client = env.client(ClientOptions::default().with_client_info(false));
    let tracer = Tracer::default();

    let (replies, summary) = tracer
        .run_background_task("test_async_pipeline", |ctx| async move {
            let mut pipe = client.pipeline(true);
            pipe.set("key1", "value1");
            pipe.execute(&ctx).await.unwrap()
        })
        .await
        .unwrap();
    assert_eq!(replies.len(), 1);

    let expected = ExpectedMetrics::new(Some("test_async_pipeline"), true)
        .scoped_absent("Datastore/operation/Valkey/set")
        .and_then(|e| e.rollup_absent("Datastore/operation/Valkey/set"))
        .unwrap();
    validate(&summary, &expected).into_result().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pubsub_round_trip_is_ordered_and_counted() {
    let env = env();
    let client = env.client(
        ClientOptions::default()
            .with_lib_name("valkey")
            .with_lib_version(LibraryVersion::parse("6.1.0")),
    );
    let channel_1 = format!("channel:{}", Uuid::new_v4());
    let channel_2 = format!("channel:{}", Uuid::new_v4());
    let log = ReceiptLog::new();
    let tracer = Tracer::default();

    let reader_log = log.clone();
    let ((), summary) = tracer
        .run_background_task("test_async_pubsub", |ctx| async move {
            let mut pubsub = client.pubsub().await.unwrap();
            pubsub.psubscribe(&[&channel_1, &channel_2]).await.unwrap();

            let (signal, mut waiter) = delivery_channel();
            let reader = spawn_reader(pubsub, signal, reader_log, DEFAULT_SENTINEL);

            for (channel, payload) in [
                (&channel_1, "Hello"),
                (&channel_2, "World"),
                (&channel_1, DEFAULT_SENTINEL),
            ] {
                publish_and_confirm(client.publish(&ctx, channel, payload), &mut waiter, TIMEOUT)
                    .await
                    .unwrap();
            }
            reader.await.unwrap().unwrap();
        })
        .await
        .unwrap();

    assert_eq!(log.snapshot(), ["Hello", "World", "NOPE"]);

    let operations = [
        ("Datastore/operation/Valkey/publish", 3),
        ("Datastore/operation/Valkey/client_setinfo", 2),
    ];
    let expected = ExpectedMetrics::new(Some("test_async_pubsub"), true)
        .with_scoped(operations)
        .and_then(|e| e.with_rollup(operations))
        .and_then(|e| with_ladder(e, &rollup_ladder(&instance_metric(&env), 5)))
        .unwrap();
    validate(&summary, &expected).into_result().unwrap();
}

#[tokio::test]
async fn disabled_instance_reporting_drops_only_the_instance_rung() {
    let config = AgentConfig {
        instance_reporting: false,
        local_hostname: Some("db-host".to_owned()),
        ..AgentConfig::default()
    };
    config.validate().unwrap();
    let env = ScenarioEnv::new(config.product().unwrap(), "127.0.0.1", 6379)
        .with_recorder(config.metric_recorder())
        .with_resolver(config.instance_resolver());
    let client = env.client(ClientOptions::default().with_client_info(false));

    let sink = CollectingSink::new();
    let tracer = Tracer::new(sink.clone());
    let guard = tracer.start_background_task("no_instances").unwrap();
    client.set(&guard.context(), "k", "v").await.unwrap();
    guard.end();

    let summary = sink.drain().pop().unwrap();
    let expected = ExpectedMetrics::new(None, true)
        .rollup("Datastore/all", 1)
        .and_then(|e| e.rollup_absent("Datastore/instance/Valkey/db-host/6379"))
        .unwrap();
    validate(&summary, &expected).into_result().unwrap();
}

#[tokio::test]
async fn process_totals_sum_across_transactions() {
    let env = env();
    let stats = StatsEngine::new();
    let tracer = Tracer::new(stats.clone());

    for name in ["first_set", "second_set"] {
        let client = env.client(ClientOptions::default().with_client_info(false));
        let ((), summary) = tracer
            .run_background_task(name, |ctx| async move {
                client.set(&ctx, "k", name).await.unwrap();
            })
            .await
            .unwrap();
        let per_transaction = ExpectedMetrics::new(Some(name), true)
            .rollup("Datastore/all", 1)
            .unwrap();
        validate(&summary, &per_transaction).into_result().unwrap();
    }

    let all = apm_agent::primitives::MetricName::new("Datastore/all").unwrap();
    let instance = apm_agent::primitives::MetricName::new(instance_metric(&env)).unwrap();
    let window = stats.harvest();
    assert_eq!(window.transactions, 2);
    assert_eq!(window.metrics.rollup(&all), Some(2));
    assert_eq!(window.metrics.rollup(&instance), Some(2));
    assert!(stats.snapshot().metrics.is_empty());
}

#[tokio::test]
async fn every_mismatch_is_reported() {
    let env = env();
    let client = env.client(ClientOptions::default().with_client_info(false));
    let tracer = Tracer::default();
    let ((), summary) = tracer
        .run_background_task("miscounted", |ctx| async move {
            client.set(&ctx, "k", "v").await.unwrap();
            client.set(&ctx, "k", "w").await.unwrap();
        })
        .await
        .unwrap();

    let expected = ExpectedMetrics::new(Some("other_name"), false)
        .scoped("Datastore/operation/Valkey/set", 1)
        .and_then(|e| e.rollup("Datastore/all", 3))
        .unwrap();
    let report = validate(&summary, &expected);
    assert_eq!(report.mismatches().len(), 4);
    assert!(
        report
            .mismatches()
            .iter()
            .any(|m| matches!(m, Mismatch::TransactionName { .. }))
    );
    let err = report.into_result().unwrap_err();
    assert!(err.to_string().starts_with("4 metric mismatch(es)"));
}

#[tokio::test]
async fn commands_outside_transactions_still_succeed() {
    let env = env();
    let transport = env.connect();
    let reply = transport
        .send(
            &apm_agent::telemetry::CallContext::root(),
            apm_agent::datastore::Command::new("PING"),
        )
        .await
        .unwrap();
    assert_eq!(reply, Reply::Status("PONG".into()));

    let reply = transport
        .send(
            &apm_agent::telemetry::CallContext::root(),
            apm_agent::datastore::Command::new("SET").arg("k").arg("v"),
        )
        .await
        .unwrap();
    assert!(reply.is_ok());
}
