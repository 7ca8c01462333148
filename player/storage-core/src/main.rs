use std::path::PathBuf;
use std::sync::Arc;

use activity_player_storage::{
    config::Config,
    init_storage,
    metrics::render_metrics,
    models::{offline::canonical_activity_url, OfflineActivity},
    services::{
        document_store::DocumentStore,
        logger::{HttpLogSink, LogSink, Logger, TracingLogSink},
        mongo_store::MongoDocumentStore,
        portal_service::{FilePortalData, HttpPortalData, NoPortalData, PortalDataSource},
        LocalDatabase, MemoryDocumentStore, PlayerStorage,
    },
    DataSyncTracker, EventBus,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[clap(
    name = "activity-player-storage",
    version = env!("CARGO_PKG_VERSION"),
    about = "Offline answer storage and sync for the activity player"
)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the save gate, then push offline answers when the portal session allows it
    Sync,
    /// Write the current activity's answers to a JSON file
    Export {
        /// Destination file (defaults to the generated filename)
        #[clap(long)]
        out: Option<PathBuf>,
        /// Activity to export instead of the configured one
        #[clap(long)]
        activity: Option<String>,
    },
    /// Load answers from a previously exported JSON file
    Import { file: PathBuf },
    /// Manage the catalogue of activities available offline
    OfflineActivities {
        #[clap(subcommand)]
        command: OfflineCommand,
    },
    /// Print Prometheus metrics collected during this process
    Metrics,
}

#[derive(Subcommand, Debug)]
enum OfflineCommand {
    List,
    Add {
        name: String,
        url: String,
    },
    Remove {
        url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize OpenTelemetry tracer (optional, can be disabled)
    let tracer = init_telemetry()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "activity_player_storage=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .init();

    let config = Config::load().context("Failed to load configuration")?;
    tracing::info!(
        "Configuration loaded for environment: {:?}",
        std::env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string())
    );

    let result = run(cli.command, &config).await;

    shutdown_telemetry();
    result
}

async fn run(command: Command, config: &Config) -> Result<()> {
    match command {
        Command::Sync => sync(config).await,
        Command::Export { out, activity } => {
            let storage = open_storage(config).await?;
            let export = storage.export_activity_to_json(activity.as_deref()).await?;
            let path = out.unwrap_or_else(|| PathBuf::from(&export.filename));
            tokio::fs::write(&path, serde_json::to_vec_pretty(&export)?)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Exported {} answers to {}", export.answers.len(), path.display());
            Ok(())
        }
        Command::Import { file } => {
            let storage = open_storage(config).await?;
            let raw = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let filename = file
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !storage
                .import_student_answers_from_json_file(&raw, &filename)
                .await
            {
                anyhow::bail!("{} is not a usable answer export", file.display());
            }
            println!("Imported answers from {}", file.display());
            Ok(())
        }
        Command::OfflineActivities { command } => offline_activities(command, config),
        Command::Metrics => {
            print!("{}", render_metrics()?);
            Ok(())
        }
    }
}

async fn open_storage(config: &Config) -> Result<Arc<dyn PlayerStorage>> {
    let portal = portal_source(config);
    let remote: Arc<dyn DocumentStore> = if config.storage.preview {
        MemoryDocumentStore::new()
    } else {
        Arc::new(MongoDocumentStore::connect(&config.mongo_uri, &config.mongo_database).await?)
    };
    Ok(init_storage(&config.storage_config(), &*portal, remote).await?)
}

fn portal_source(config: &Config) -> Box<dyn PortalDataSource> {
    if let Some(path) = &config.portal.data_file {
        Box::new(FilePortalData::new(path))
    } else if let Some(url) = &config.portal.data_url {
        Box::new(HttpPortalData::new(url, config.portal.token.clone()))
    } else {
        Box::new(NoPortalData)
    }
}

async fn sync(config: &Config) -> Result<()> {
    let storage = open_storage(config).await?;

    let bus = EventBus::new();
    let sink: Arc<dyn LogSink> = match &config.logger_url {
        Some(url) => Arc::new(HttpLogSink::new(url)),
        None => Arc::new(TracingLogSink),
    };
    let logger = Arc::new(Logger::new(bus.clone(), sink).with_activity(&config.storage.activity));
    logger.log("sync_requested", None, serde_json::json!({ "backend": storage.kind().as_str() }));

    let report = DataSyncTracker::new(bus, config.sync.timeout(), config.sync.plugin_heartbeat())
        .with_logger(logger)
        .start()
        .await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if storage.can_sync_data() {
        let pushed = storage.sync_data().await?;
        println!("Pushed {} answers", pushed);
    } else {
        tracing::info!("No valid portal session, offline answers stay local");
    }
    Ok(())
}

fn offline_activities(command: OfflineCommand, config: &Config) -> Result<()> {
    let db = LocalDatabase::open(&config.storage.local_db_path)?;
    db.migrate()?;

    match command {
        OfflineCommand::List => {
            for activity in db.offline_activities()? {
                println!("{}\t{}", activity.name, activity.url);
            }
        }
        OfflineCommand::Add { name, url } => {
            let activity = OfflineActivity::new(name, &url)?;
            db.put_offline_activity(&activity)?;
            println!("Added {}", activity.url);
        }
        OfflineCommand::Remove { url } => {
            if db.delete_offline_activity(&canonical_activity_url(&url)?)? {
                println!("Removed {}", url);
            } else {
                println!("{} was not cached", url);
            }
        }
    }
    Ok(())
}

fn init_telemetry() -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::SdkTracerProvider;
    use opentelemetry_sdk::Resource;

    let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4318".to_string());

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(otlp_endpoint)
        .build()
        .context("Failed to create OTLP exporter")?;

    let resource = Resource::builder_empty()
        .with_service_name("activity-player-storage")
        .with_attributes(vec![KeyValue::new(
            "service.version",
            env!("CARGO_PKG_VERSION"),
        )])
        .build();

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource)
        .build();

    let tracer = provider.tracer("activity-player-storage");
    opentelemetry::global::set_tracer_provider(provider);

    Ok(tracer)
}

fn shutdown_telemetry() {
    tracing::info!("Shutting down OpenTelemetry");
    // In opentelemetry 0.31, shutdown is handled by dropping the provider
}
