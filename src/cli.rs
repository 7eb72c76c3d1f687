use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use flexi_logger::{Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming};
use log::{debug, error, info};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, LoggingConfig};
use crate::database::{Database, DbPool};
use crate::entity::Entity;
use crate::error::CutoverError;
use crate::events::{
    ConsumeStats, Direction, DiscardProducer, FixerConsumer, InMemoryBroker,
    InconsistentEventProducer, Subscription,
};
use crate::fixer::Fixer;
use crate::interactive::Interactive;
use crate::pool::DoubleWritePool;
use crate::scheduler::Scheduler;
use crate::server::WebServer;
use crate::store::EntityStore;
use crate::validator::{orient, ValidationSummary, Validator};

const LOG_FILE_BYTES: u64 = 10 * 1024 * 1024;
const LOG_FILES_KEPT: usize = 7;

#[derive(Parser)]
#[command(
    name = "cutover",
    version,
    about = "Cutover: move a live table between storage backends without downtime"
)]
pub struct Cli {
    /// Configuration file (default: cutover.toml in the user config directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Start the control server and fixer consumer (default if no command specified)
    Serve,

    /// Run one full validation pass and print a drift summary
    Validate {
        /// Backend treated as ground truth: "src" or "dst"
        #[arg(long, default_value = "src")]
        direction: Direction,

        /// Repair every detected difference before exiting
        #[arg(long, default_value_t = false)]
        fix: bool,
    },

    /// Repair a single row
    Fix {
        /// Row id
        #[arg(long)]
        id: i64,

        /// Backend treated as ground truth: "src" or "dst"
        #[arg(long, default_value = "src")]
        direction: Direction,
    },

    /// Create the migrated table on both backends if missing
    Init,
}

/// Both backends, opened and with the table in place
struct Backends {
    src: DbPool,
    dst: DbPool,
}

impl Backends {
    fn open(config: &Config) -> Result<Self, CutoverError> {
        let src = Database::open_pool(&config.source)?;
        let dst = Database::open_pool(&config.target)?;
        Database::ensure_schema::<Interactive>(&src)?;
        Database::ensure_schema::<Interactive>(&dst)?;
        Ok(Self { src, dst })
    }

    fn stores(&self) -> (EntityStore<Interactive>, EntityStore<Interactive>) {
        (EntityStore::new(self.src.clone()), EntityStore::new(self.dst.clone()))
    }
}

impl Cli {
    pub fn handle_command_line() -> Result<(), CutoverError> {
        let args = Cli::parse();

        let project_dirs = ProjectDirs::from("", "", "cutover").ok_or_else(|| {
            CutoverError::Error("Could not determine project directories".into())
        })?;

        let config_path = args
            .config
            .clone()
            .unwrap_or_else(|| Config::default_path(&project_dirs));
        let config = Config::load_config(&config_path);

        // Must stay alive for the life of the process
        let _logger = Self::init_logging(&config.logging, &project_dirs)?;
        info!("Using configuration {}", config_path.display());
        debug!("Configuration: {:?}", config);

        // Default to Serve if no command specified
        match args.command.unwrap_or(Command::Serve) {
            Command::Serve => Self::start_server(&config),
            Command::Validate { direction, fix } => Self::validate(&config, direction, fix),
            Command::Fix { id, direction } => Self::fix_one(&config, id, direction),
            Command::Init => Self::init(&config),
        }
    }

    fn init_logging(
        logging: &LoggingConfig,
        project_dirs: &ProjectDirs,
    ) -> Result<LoggerHandle, CutoverError> {
        let log_dir = logging
            .log_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| project_dirs.data_local_dir().join("logs"));

        Logger::try_with_str(logging.log_spec())
            .and_then(|logger| {
                logger
                    .log_to_file(FileSpec::default().directory(&log_dir).basename("cutover"))
                    .rotate(
                        Criterion::Size(LOG_FILE_BYTES),
                        Naming::Timestamps,
                        Cleanup::KeepLogFiles(LOG_FILES_KEPT),
                    )
                    .duplicate_to_stderr(Duplicate::Warn)
                    .format_for_files(flexi_logger::detailed_format)
                    .start()
            })
            .map_err(|e| CutoverError::Error(format!("Failed to start logger: {}", e)))
    }

    fn runtime() -> Result<tokio::runtime::Runtime, CutoverError> {
        tokio::runtime::Runtime::new()
            .map_err(|e| CutoverError::Error(format!("Failed to create runtime: {}", e)))
    }

    fn start_server(config: &Config) -> Result<(), CutoverError> {
        let backends = Backends::open(config)?;
        let (src_store, dst_store) = backends.stores();

        let pattern = config.migration.pattern();
        info!(
            "Starting server on {}:{} with pattern {}",
            config.server.host, config.server.port, pattern
        );

        let rt = Self::runtime()?;

        rt.block_on(async {
            let pool = Arc::new(DoubleWritePool::new(backends.src, backends.dst, pattern));

            let broker = Arc::new(InMemoryBroker::new());
            let subscription = broker.subscribe(&config.events.topic)?;
            let producer = InconsistentEventProducer::new(broker, config.events.topic.clone());

            let scheduler = Arc::new(
                Scheduler::<Interactive>::new(pool, producer)
                    .batch_size(config.validation.batch_size)
                    .query_timeout(config.validation.query_timeout()),
            );
            let consumer = FixerConsumer::new(src_store, dst_store)?
                .max_attempts(config.events.max_attempts);

            let web_server = WebServer::new(
                config.server.host.clone(),
                config.server.port,
                config.server.prefix.clone(),
                scheduler,
            );
            web_server.start(consumer, subscription).await
        })
    }

    fn validate(config: &Config, direction: Direction, fix: bool) -> Result<(), CutoverError> {
        let backends = Backends::open(config)?;
        let (src_store, dst_store) = backends.stores();
        let (base, target) = orient(direction, src_store.clone(), dst_store.clone());

        let rt = Self::runtime()?;
        let (summary, fixes) = rt.block_on(async {
            let cancel = CancellationToken::new();
            let on_ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_ctrl_c.cancel();
                }
            });

            if fix {
                let broker = Arc::new(InMemoryBroker::new());
                let subscription = broker.subscribe(&config.events.topic)?;
                let producer = InconsistentEventProducer::new(broker, config.events.topic.clone());
                let validator = Self::validator(config, base, target, direction, producer);
                let consumer = FixerConsumer::new(src_store, dst_store)?
                    .max_attempts(config.events.max_attempts);

                let (summary, stats) =
                    validate_with_fixes(validator, consumer, subscription, cancel).await?;
                Ok::<_, CutoverError>((summary, Some(stats)))
            } else {
                // Report only: nobody reads the events, so none are kept
                let producer = InconsistentEventProducer::new(
                    Arc::new(DiscardProducer),
                    config.events.topic.clone(),
                );
                let validator = Self::validator(config, base, target, direction, producer);
                Ok((validator.validate(cancel).await, None))
            }
        })?;

        println!("Validation of '{}' with base {}", Interactive::TABLE, direction);
        println!("  base rows scanned:  {}", summary.base_rows_scanned);
        println!("  target ids scanned: {}", summary.target_ids_scanned);
        println!("  target_missing:     {}", summary.target_missing);
        println!("  neq:                {}", summary.not_equal);
        println!("  base_missing:       {}", summary.base_missing);
        println!("  read errors:        {}", summary.read_errors);
        if summary.cancelled {
            println!("  (interrupted)");
        }

        if let Some(stats) = fixes {
            println!("Fixed {} of {} rows", stats.applied, summary.drift());
            if stats.dropped > 0 {
                error!("{} rows could not be fixed", stats.dropped);
            }
        }

        Ok(())
    }

    fn validator(
        config: &Config,
        base: EntityStore<Interactive>,
        target: EntityStore<Interactive>,
        direction: Direction,
        producer: InconsistentEventProducer,
    ) -> Validator<Interactive> {
        Validator::new(base, target, direction, producer)
            .batch_size(config.validation.batch_size)
            .query_timeout(config.validation.query_timeout())
    }

    fn fix_one(config: &Config, id: i64, direction: Direction) -> Result<(), CutoverError> {
        let backends = Backends::open(config)?;
        let (src_store, dst_store) = backends.stores();
        let (base, target) = orient(direction, src_store, dst_store);

        let outcome = Fixer::new(base, target)?.fix(id)?;
        println!("Row {} ({} is base): {:?}", id, direction, outcome);
        Ok(())
    }

    fn init(config: &Config) -> Result<(), CutoverError> {
        Backends::open(config)?;
        println!(
            "Table '{}' ready on {} and {}",
            Interactive::TABLE,
            config.source.path,
            config.target.path
        );
        Ok(())
    }
}

/// Run one validation pass while a fixer drains its events concurrently.
/// Whatever is still queued when the pass ends is fixed before returning,
/// unless the pass was cancelled.
async fn validate_with_fixes<T: Entity>(
    validator: Validator<T>,
    consumer: FixerConsumer<T>,
    mut subscription: Subscription,
    cancel: CancellationToken,
) -> Result<(ValidationSummary, ConsumeStats), CutoverError> {
    let stop_fixing = CancellationToken::new();
    let fixing = tokio::spawn({
        let stop = stop_fixing.clone();
        async move {
            let stats = consumer.consume(&mut subscription, stop).await;
            (consumer, subscription, stats)
        }
    });

    let summary = validator.validate(cancel).await;
    stop_fixing.cancel();

    let (consumer, mut subscription, mut stats) = fixing.await?;
    if !summary.cancelled {
        stats = stats.merge(consumer.drain(&mut subscription).await);
    }
    Ok((summary, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{interactive, TestBackends};
    use clap::Parser;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cli_parsing_no_command_defaults_to_serve() {
        let result = Cli::try_parse_from(["cutover"]);
        assert!(result.is_ok(), "Should accept no command");

        let cli = result.unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.command.unwrap_or(Command::Serve), Command::Serve);
    }

    #[test]
    fn test_cli_parsing_validate() {
        let cli = Cli::try_parse_from(["cutover", "validate", "--direction", "dst", "--fix"]).unwrap();
        assert_eq!(
            cli.command,
            Some(Command::Validate {
                direction: Direction::Dst,
                fix: true
            })
        );

        let cli = Cli::try_parse_from(["cutover", "validate"]).unwrap();
        assert_eq!(
            cli.command,
            Some(Command::Validate {
                direction: Direction::Src,
                fix: false
            })
        );
    }

    #[test]
    fn test_cli_parsing_fix_requires_id() {
        let cli = Cli::try_parse_from(["cutover", "fix", "--id", "42"]).unwrap();
        assert_eq!(
            cli.command,
            Some(Command::Fix {
                id: 42,
                direction: Direction::Src
            })
        );

        assert!(Cli::try_parse_from(["cutover", "fix"]).is_err());
    }

    #[test]
    fn test_cli_parsing_global_config() {
        let cli = Cli::try_parse_from(["cutover", "init", "--config", "/tmp/c.toml"]).unwrap();
        assert_eq!(cli.command, Some(Command::Init));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));
    }

    #[tokio::test]
    async fn test_validate_with_fixes_repairs_during_the_pass() {
        let backends = TestBackends::new();
        let (src, dst) = (backends.src_store(), backends.dst_store());
        for id in 1..=300 {
            src.create(&interactive(id, id, 10)).unwrap();
        }

        let broker = Arc::new(InMemoryBroker::new());
        let subscription = broker.subscribe("t").unwrap();
        let producer = InconsistentEventProducer::new(broker, "t");
        let validator = Validator::new(src.clone(), dst.clone(), Direction::Src, producer).batch_size(50);
        let consumer = FixerConsumer::new(src, dst.clone()).unwrap();

        let (summary, stats) =
            validate_with_fixes(validator, consumer, subscription, CancellationToken::new())
                .await
                .unwrap();

        assert_eq!(summary.target_missing, 300);
        assert_eq!(stats.applied, summary.drift());
        assert_eq!(stats.dropped, 0);
        assert_eq!(dst.count().unwrap(), 300);
    }

    #[tokio::test]
    async fn test_report_only_validation_keeps_no_events() {
        let backends = TestBackends::new();
        backends.src_store().create(&interactive(1, 1, 10)).unwrap();
        backends.dst_store().create(&interactive(2, 1, 10)).unwrap();

        let producer = InconsistentEventProducer::new(Arc::new(DiscardProducer), "t");
        let summary = Validator::new(backends.src_store(), backends.dst_store(), Direction::Src, producer)
            .validate(CancellationToken::new())
            .await;

        assert_eq!(summary.target_missing, 1);
        assert_eq!(summary.base_missing, 1);
        assert_eq!(backends.dst_store().count().unwrap(), 1);
    }

    #[test]
    fn test_cli_parsing_invalid_arguments() {
        let result = Cli::try_parse_from(["cutover", "nonexistent-command"]);
        assert!(result.is_err(), "Should reject unknown commands");

        let result = Cli::try_parse_from(["cutover", "validate", "--direction", "both"]);
        assert!(result.is_err(), "Should reject unknown directions");

        let result = Cli::try_parse_from(["cutover", "serve", "--invalid-flag"]);
        assert!(result.is_err(), "Should reject unknown flags on serve");
    }
}
