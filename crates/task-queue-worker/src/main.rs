use clap::Parser;
use serde_json::{json, Value};
use std::sync::Arc;
use task_queue_broker::MemoryTransport;
use task_queue_core::{
    Args as TaskArgs, Enqueuer, Kwargs, MemoryBackend, PolicyOverrides, TaskException, TaskMessage,
};
use task_queue_worker::{
    AttemptContext, BrokerUrls, FnHandler, Outcome, TaskHandlerRegistry, Worker, WorkerConfig,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tq-worker")]
#[command(about = "Distributed Task Queue Worker", long_about = None)]
struct Args {
    /// Broker URL(s), separated by ';'
    #[arg(short, long)]
    broker: Option<String>,

    /// Worker ID (auto-generated if not provided)
    #[arg(long)]
    worker_id: Option<String>,

    /// Number of concurrent tasks
    #[arg(short, long)]
    concurrency: Option<usize>,

    /// Queue type for delayed delivery (classic or quorum)
    #[arg(long)]
    queue_type: Option<String>,

    /// Path to configuration file
    #[arg(long)]
    config: Option<String>,

    /// Enqueue a few sample tasks on startup
    #[arg(long)]
    demo: bool,
}

fn add(_: &AttemptContext, args: &TaskArgs, _: &Kwargs) -> Outcome {
    Outcome::Success(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()))
}

fn div(_: &AttemptContext, args: &TaskArgs, _: &Kwargs) -> Outcome {
    let a = args.first().and_then(Value::as_i64).unwrap_or(0);
    let b = args.get(1).and_then(Value::as_i64).unwrap_or(0);
    if b == 0 {
        return Outcome::Failure(TaskException::new(
            "arithmetic.zero_division",
            "integer division or modulo by zero",
        ));
    }
    Outcome::Success(json!(a / b))
}

fn echo(_: &AttemptContext, args: &TaskArgs, kwargs: &Kwargs) -> Outcome {
    Outcome::Success(json!({ "args": args, "kwargs": kwargs }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        WorkerConfig::from_file(config_path)?
    } else {
        WorkerConfig::default()
    };

    // Override with CLI args
    if let Some(broker) = args.broker {
        config.broker_url = BrokerUrls::One(broker);
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(worker_id) = args.worker_id {
        config.worker_id = Some(worker_id);
    }
    if let Some(queue_type) = args.queue_type {
        config.delayed_delivery.queue_type = Some(queue_type);
    }

    // Create task handler registry
    let registry = TaskHandlerRegistry::with_defaults(config.task_defaults.to_policy());
    registry.register("add", FnHandler(add), PolicyOverrides::new());
    registry.register(
        "div",
        FnHandler(div),
        PolicyOverrides::new()
            .autoretry_for(["arithmetic.zero_division"])
            .retry_backoff(true)
            .retry_backoff_max(8),
    );
    registry.register("echo", FnHandler(echo), PolicyOverrides::new());

    tracing::info!("Registered tasks: {:?}", registry.task_names());

    let transport = Arc::new(MemoryTransport::new());
    if args.demo {
        for message in [
            TaskMessage::builder("add").args(vec![json!(2), json!(3)]).build(),
            TaskMessage::builder("echo").args(vec![json!("hello")]).countdown(2)?.build(),
            TaskMessage::builder("div").args(vec![json!(1), json!(0)]).build(),
        ] {
            transport.publish(message).await?;
        }
    }

    // Create and run worker
    let worker = Arc::new(Worker::new(
        config,
        registry,
        transport,
        Arc::new(MemoryBackend::new()),
    ));

    // Handle shutdown signals
    let signal_worker = Arc::clone(&worker);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal");
        signal_worker.shutdown();
    });

    worker.run().await?;

    Ok(())
}
