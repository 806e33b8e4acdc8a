//! orderflow - run the order pipeline services.
//!
//! Each subcommand runs one service until SIGINT/SIGTERM, then drains and
//! disconnects within the shutdown grace period. `standalone` runs the whole
//! pipeline in one process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use orderflow::bus::{Connector, MemoryCluster};
use orderflow::config::{BrokerConfig, GroupConfig, ServiceSettings, DEFAULT_BROKERS};
use orderflow::lifecycle::{exit_code, Lifecycle};
use orderflow::services::{
    mailer_dispatcher, mailer_group, user_dispatcher, user_group, LogMailer, UserDirectory,
    MAILER_SERVICE, USER_SERVICE,
};
use orderflow::telemetry::{self, LogFormat};
use orderflow::topic::DEFAULT_PARTITIONS;
use orderflow::{BusError, ConsumerService, Dispatcher, FailurePolicy, Subscriber, TopicRegistry};

/// Event-driven order pipeline services
#[derive(Parser)]
#[command(name = "orderflow")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Comma separated broker addresses
    #[arg(long, env = "ORDERFLOW_BROKERS", default_value = DEFAULT_BROKERS, global = true)]
    brokers: String,

    /// Broker backend
    #[arg(long, env = "ORDERFLOW_BACKEND", value_enum, default_value_t = Backend::Memory, global = true)]
    backend: Backend,

    /// Log line format
    #[arg(long, env = "ORDERFLOW_LOG_FORMAT", default_value = "pretty", global = true)]
    log_format: LogFormat,

    /// Seconds allowed for draining and disconnecting after a signal
    #[arg(long, env = "ORDERFLOW_SHUTDOWN_GRACE_SECS", global = true)]
    shutdown_grace_secs: Option<u64>,

    /// Extra librdkafka property as key=value, e.g. security.protocol=ssl
    #[cfg(feature = "kafka")]
    #[arg(long = "kafka-property", value_name = "KEY=VALUE", value_parser = parse_property, global = true)]
    kafka_properties: Vec<(String, String)>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// In-process broker, lost on exit
    Memory,
    /// Kafka cluster (requires the `kafka` feature)
    Kafka,
}

#[derive(Subcommand)]
enum Commands {
    /// Ensure the pipeline topics exist and print the report
    Provision,

    /// HTTP order API publishing order.created and user.updated
    OrderService(OrderArgs),

    /// Send a notification for every order.created
    MailerService(ConsumerArgs),

    /// Keep user records from user.updated and order.created
    UserService(ConsumerArgs),

    /// Provision and run every service in one process
    Standalone(OrderArgs),
}

#[derive(Args)]
struct OrderArgs {
    /// HTTP port
    #[arg(long, env = "PORT", default_value_t = 3000)]
    port: u16,
}

#[derive(Args)]
struct ConsumerArgs {
    /// Consumer group id, defaults to the service's group
    #[arg(long, env = "ORDERFLOW_GROUP")]
    group: Option<String>,

    /// Replay retained history when the group has no committed offsets
    #[arg(long, env = "ORDERFLOW_FROM_BEGINNING", default_value_t = true, action = clap::ArgAction::Set)]
    from_beginning: bool,

    /// drop, retry:N or dead-letter[:suffix]
    #[arg(long, env = "ORDERFLOW_FAILURE_POLICY", default_value = "drop")]
    failure_policy: FailurePolicy,
}

impl ConsumerArgs {
    fn group(&self, defaults: GroupConfig) -> GroupConfig {
        GroupConfig {
            group_id: self.group.clone().unwrap_or(defaults.group_id),
            from_beginning: self.from_beginning,
            ..defaults
        }
    }
}

/// Process-wide options shared by every command.
struct Runtime {
    brokers: String,
    settings: ServiceSettings,
}

impl Runtime {
    fn broker_config(&self, client_id: &str) -> Result<BrokerConfig, BusError> {
        BrokerConfig::parse(client_id, &self.brokers)
    }

    fn lifecycle(&self) -> Lifecycle {
        Lifecycle::new(self.settings.shutdown_grace)
    }

    fn consumer<C: Connector>(
        &self,
        connector: C,
        name: &str,
        group: GroupConfig,
        policy: FailurePolicy,
        dispatcher: Dispatcher,
    ) -> Result<ConsumerService<C>, BusError> {
        let subscriber = Subscriber::new(connector, self.broker_config(name)?, &group.group_id)
            .with_policy(policy)
            .with_settings(&self.settings);
        Ok(ConsumerService::new(name, subscriber, group, dispatcher))
    }
}

#[cfg(feature = "kafka")]
fn parse_property(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got {raw:?}")),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    telemetry::init(cli.log_format);

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Fatal");
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let mut settings = ServiceSettings::from_env().context("invalid service settings")?;
    if let Some(secs) = cli.shutdown_grace_secs {
        settings.shutdown_grace = Duration::from_secs(secs);
    }
    let runtime = Runtime {
        brokers: cli.brokers,
        settings,
    };

    match cli.backend {
        Backend::Memory => {
            if !matches!(cli.command, Commands::Standalone(_)) {
                warn!("Using the in-memory broker; events stay inside this process");
            }
            let cluster = MemoryCluster::new().with_auto_create(DEFAULT_PARTITIONS);
            dispatch(cluster, &runtime, cli.command).await
        }
        #[cfg(feature = "kafka")]
        Backend::Kafka => {
            let connector = cli
                .kafka_properties
                .into_iter()
                .fold(orderflow::bus::KafkaConnector::new(), |connector, (key, value)| {
                    connector.with_property(key, value)
                });
            dispatch(connector, &runtime, cli.command).await
        }
        #[cfg(not(feature = "kafka"))]
        Backend::Kafka => anyhow::bail!("this build has no Kafka support; rebuild with --features kafka"),
    }
}

async fn dispatch<C: Connector>(connector: C, runtime: &Runtime, command: Commands) -> anyhow::Result<i32> {
    match command {
        Commands::Provision => provision(&connector, runtime).await,
        Commands::OrderService(args) => order_service(connector, runtime, args).await,
        Commands::MailerService(args) => {
            let mailer = runtime.consumer(
                connector,
                MAILER_SERVICE,
                args.group(mailer_group()),
                args.failure_policy.clone(),
                mailer_dispatcher(Arc::new(LogMailer::new())),
            )?;
            let lifecycle = runtime.lifecycle().with_service(Arc::new(mailer));
            Ok(exit_code(&idle(&lifecycle).await))
        }
        Commands::UserService(args) => {
            let users = runtime.consumer(
                connector,
                USER_SERVICE,
                args.group(user_group()),
                args.failure_policy.clone(),
                user_dispatcher(Arc::new(UserDirectory::new())),
            )?;
            let lifecycle = runtime.lifecycle().with_service(Arc::new(users));
            Ok(exit_code(&idle(&lifecycle).await))
        }
        Commands::Standalone(args) => standalone(connector, runtime, args).await,
    }
}

/// Run until a signal arrives, with nothing to serve besides the services.
async fn idle(lifecycle: &Lifecycle) -> Result<(), BusError> {
    lifecycle
        .run_until(|token| async move { token.cancelled().await })
        .await
        .map(|_| ())
}

async fn provision<C: Connector>(connector: &C, runtime: &Runtime) -> anyhow::Result<i32> {
    let config = runtime.broker_config("admin")?;
    let report = TopicRegistry::pipeline().ensure(connector, &config).await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(if report.is_complete() { 0 } else { 1 })
}

#[cfg(feature = "http")]
async fn order_service<C: Connector>(
    connector: C,
    runtime: &Runtime,
    args: OrderArgs,
) -> anyhow::Result<i32> {
    use orderflow::services::{OrderService, ORDER_SERVICE};
    use orderflow::Publisher;

    let publisher = Arc::new(Publisher::new(connector, runtime.broker_config(ORDER_SERVICE)?));
    let orders = OrderService::new(publisher.clone());
    let lifecycle = runtime.lifecycle().with_service(publisher);
    serve_orders(&lifecycle, orders, args.port).await
}

#[cfg(not(feature = "http"))]
async fn order_service<C: Connector>(_: C, _: &Runtime, _: OrderArgs) -> anyhow::Result<i32> {
    anyhow::bail!("this build has no HTTP support; rebuild with --features http")
}

#[cfg(feature = "http")]
async fn serve_orders<C: Connector>(
    lifecycle: &Lifecycle,
    orders: orderflow::services::OrderService<C>,
    port: u16,
) -> anyhow::Result<i32> {
    let (listener, addr) = orderflow::http::bind(&format!("0.0.0.0:{port}"))
        .await
        .with_context(|| format!("cannot listen on port {port}"))?;
    info!(%addr, "Order API bound");

    let outcome = lifecycle
        .run_until(|token| orderflow::http::serve_on(orders, listener, token))
        .await;
    if let Ok(Some(Err(e))) = &outcome {
        tracing::error!(error = %e, "Order server failed");
        return Ok(1);
    }
    Ok(exit_code(&outcome.map(|_| ())))
}

#[cfg(feature = "http")]
async fn standalone<C: Connector>(
    connector: C,
    runtime: &Runtime,
    args: OrderArgs,
) -> anyhow::Result<i32> {
    use orderflow::services::{OrderService, ORDER_SERVICE};
    use orderflow::Publisher;

    let report = TopicRegistry::pipeline()
        .ensure(&connector, &runtime.broker_config("admin")?)
        .await;
    if !report.is_complete() {
        warn!(failed = ?report.failed, "Some topics could not be provisioned");
    }

    let publisher = Arc::new(Publisher::new(
        connector.clone(),
        runtime.broker_config(ORDER_SERVICE)?,
    ));
    let mailer = runtime.consumer(
        connector.clone(),
        MAILER_SERVICE,
        mailer_group(),
        FailurePolicy::default(),
        mailer_dispatcher(Arc::new(LogMailer::new())),
    )?;
    let users = runtime.consumer(
        connector,
        USER_SERVICE,
        user_group(),
        FailurePolicy::default(),
        user_dispatcher(Arc::new(UserDirectory::new())),
    )?;

    let orders = OrderService::new(publisher.clone());
    let lifecycle = runtime
        .lifecycle()
        .with_service(publisher)
        .with_service(Arc::new(mailer))
        .with_service(Arc::new(users));
    serve_orders(&lifecycle, orders, args.port).await
}

#[cfg(not(feature = "http"))]
async fn standalone<C: Connector>(_: C, _: &Runtime, _: OrderArgs) -> anyhow::Result<i32> {
    anyhow::bail!("this build has no HTTP support; rebuild with --features http")
}
