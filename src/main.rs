use anyhow::Context;
use audit_capture::store::PgConnector;
use audit_capture::stream::TcpConnector;
use audit_capture::{AuditLogger, Config};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "audit-capture")]
#[command(about = "Binlog to audit log change-data-capture logger", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting audit-capture");
    info!("Loading configuration from {:?}", args.config);

    let config = Config::from_file(&args.config)
        .with_context(|| format!("failed to load configuration from {}", args.config.display()))?;

    info!(
        code = %config.code,
        source = %config.source.address,
        audit_host = %config.audit_db.host,
        audit_database = %config.audit_db.database,
        logs = config.logs.len(),
        dry_run = config.logger.dry_run,
        "Configuration summary"
    );

    let store = PgConnector::new(config.audit_db.clone(), &config.logger.checkpoint_table);
    let stream = TcpConnector::new(
        config.source.address.clone(),
        Duration::from_secs(config.source.connect_timeout_secs),
    );
    let mut logger = AuditLogger::new(config, store, stream).context("invalid log definitions")?;

    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => error!("Unable to listen for shutdown signal: {}", e),
        }
    };

    logger.run(shutdown).await.context("audit logger failed")?;
    Ok(())
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("audit_capture=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("audit_capture=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry().with(env_filter).with(fmt_layer).init();
}
