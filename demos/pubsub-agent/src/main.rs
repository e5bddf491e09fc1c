//! Runs the datastore scenarios against the in-memory server and prints the
//! validation report for each transaction.

use std::path::PathBuf;

use anyhow::{Context, Result};
use apm_agent::config::AgentConfig;
use apm_agent::datastore::{ClientOptions, PoolConfig};
use apm_agent::primitives::LibraryVersion;
use apm_agent::telemetry::{ExpectedMetrics, StatsEngine, TransactionSummary, Tracer, validate};
use apm_agent::testkit::{
    DEFAULT_SENTINEL, ReceiptLog, ScenarioEnv, delivery_channel, publish_and_confirm, spawn_reader,
};
use clap::{Parser, ValueEnum};
use tracing::{Instrument, info, info_span, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(about = "Exercise instrumented datastore scenarios")]
struct Args {
    /// JSON configuration file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Scenario to run.
    #[arg(long, value_enum, default_value_t = Scenario::All)]
    scenario: Scenario,
    /// Print transaction summaries as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Scenario {
    Pool,
    Pipeline,
    Pubsub,
    All,
}

impl Scenario {
    fn includes(self, other: Self) -> bool {
        self == Self::All || self == other
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => AgentConfig::load(path)?,
        None => AgentConfig::default(),
    }
    .with_env_overrides()?;
    config.validate()?;

    let span = info_span!("agent", app = %config.app_name);
    run(&args, &config).instrument(span).await
}

async fn run(args: &Args, config: &AgentConfig) -> Result<()> {
    let env = ScenarioEnv::new(
        config.product()?,
        &config.datastore.host,
        config.datastore.port,
    )
    .with_recorder(config.metric_recorder())
    .with_resolver(config.instance_resolver());
    let stats = StatsEngine::new();
    let tracer = Tracer::new(stats.clone());

    let mut failures = 0_usize;
    let mut runs = Vec::new();
    if args.scenario.includes(Scenario::Pool) {
        runs.push(pool(&env, &tracer, config).await?);
    }
    if args.scenario.includes(Scenario::Pipeline) {
        runs.push(pipeline(&env, &tracer).await?);
    }
    if args.scenario.includes(Scenario::Pubsub) {
        runs.push(pubsub(&env, &tracer, config).await?);
    }

    for (summary, expected) in runs {
        let report = validate(&summary, &expected.strict(config.strict_validation));
        if args.json {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        if report.is_empty() {
            info!(transaction = %summary.name, "metrics match");
        } else {
            failures += 1;
            warn!(transaction = %summary.name, "metrics differ:\n{report}");
        }
    }

    let totals = stats.harvest();
    let all = totals
        .metrics
        .rollup_entries()
        .find(|(name, _)| name.as_str() == "Datastore/all")
        .map_or(0, |(_, count)| count);
    info!(transactions = totals.transactions, datastore_all = all, "process totals");
    if args.json {
        println!("{}", serde_json::to_string_pretty(&totals)?);
    }

    anyhow::ensure!(failures == 0, "{failures} scenario(s) failed validation");
    Ok(())
}

fn ladder(env: &ScenarioEnv, config: &AgentConfig, all: u64) -> Vec<(String, u64)> {
    let product = &config.datastore.product;
    let mut names = vec![
        ("Datastore/all".to_owned(), all),
        ("Datastore/allOther".to_owned(), all),
        (format!("Datastore/{product}/all"), all),
        (format!("Datastore/{product}/allOther"), all),
    ];
    if config.instance_reporting {
        let instance = env
            .resolver()
            .resolve(&config.datastore.host, config.datastore.port);
        names.push((format!("Datastore/instance/{product}/{instance}"), all));
    }
    names
}

fn pairs(list: &[(String, u64)]) -> impl Iterator<Item = (&str, u64)> {
    list.iter().map(|(name, count)| (name.as_str(), *count))
}

fn expect(
    name: &str,
    operations: &[(String, u64)],
    ladder: &[(String, u64)],
) -> Result<ExpectedMetrics> {
    let expected = ExpectedMetrics::new(Some(name), true)
        .with_scoped(pairs(operations))?
        .with_rollup(pairs(operations))?
        .with_rollup(pairs(ladder))?;
    Ok(expected)
}

async fn pool(
    env: &ScenarioEnv,
    tracer: &Tracer,
    config: &AgentConfig,
) -> Result<(TransactionSummary, ExpectedMetrics)> {
    info!("running connection pool scenario");
    let client = env.pooled_client(PoolConfig::default())?;
    let (output, summary) = tracer
        .run_background_task("connection_pool", |ctx| async move {
            client.set(&ctx, "key1", "value1").await?;
            client.get(&ctx, "key1").await?;
            client.execute_command(&ctx, &["CLIENT", "LIST"]).await?;
            anyhow::Ok(())
        })
        .await?;
    output?;

    let product = &config.datastore.product;
    let operations: Vec<(String, u64)> = ["get", "set", "client_list"]
        .into_iter()
        .map(|op| (format!("Datastore/operation/{product}/{op}"), 1))
        .collect();
    let expected = expect("connection_pool", &operations, &ladder(env, config, 3))?;
    Ok((summary, expected))
}

async fn pipeline(
    env: &ScenarioEnv,
    tracer: &Tracer,
) -> Result<(TransactionSummary, ExpectedMetrics)> {
    info!("running pipeline scenario");
    let client = env.client(ClientOptions::default().with_client_info(false));
    let (output, summary) = tracer
        .run_background_task("pipeline", |ctx| async move {
            let mut pipe = client.pipeline(true);
            pipe.set("key1", "value1");
            pipe.execute(&ctx).await
        })
        .await?;
    output.context("pipeline execution failed")?;
    Ok((summary, ExpectedMetrics::new(Some("pipeline"), true)))
}

async fn pubsub(
    env: &ScenarioEnv,
    tracer: &Tracer,
    config: &AgentConfig,
) -> Result<(TransactionSummary, ExpectedMetrics)> {
    info!("running pub/sub scenario");
    let client = env.client(
        ClientOptions::default().with_lib_version(LibraryVersion::parse("6.1.0")),
    );
    let timeout = config.delivery_timeout();
    let log = ReceiptLog::new();
    let reader_log = log.clone();
    let channels = [
        format!("channel:{}", uuid::Uuid::new_v4()),
        format!("channel:{}", uuid::Uuid::new_v4()),
    ];

    let (output, summary) = tracer
        .run_background_task("pubsub", |ctx| async move {
            let mut pubsub = client.pubsub().await?;
            pubsub.psubscribe(&channels).await?;
            let (signal, mut waiter) = delivery_channel();
            let reader = spawn_reader(pubsub, signal, reader_log, DEFAULT_SENTINEL);
            for (channel, payload) in [
                (&channels[0], "Hello"),
                (&channels[1], "World"),
                (&channels[0], DEFAULT_SENTINEL),
            ] {
                publish_and_confirm(client.publish(&ctx, channel, payload), &mut waiter, timeout)
                    .await?;
            }
            reader.await??;
            anyhow::Ok(())
        })
        .await?;
    output?;
    let received = log.snapshot();
    info!(?received, "pub/sub deliveries");
    anyhow::ensure!(
        received == ["Hello", "World", DEFAULT_SENTINEL],
        "pub/sub deliveries out of order: {received:?}"
    );

    let product = &config.datastore.product;
    let operations = vec![
        (format!("Datastore/operation/{product}/publish"), 3),
        (format!("Datastore/operation/{product}/client_setinfo"), 2),
    ];
    let expected = expect("pubsub", &operations, &ladder(env, config, 5))?;
    Ok((summary, expected))
}
