use clap::{Parser, Subcommand};
use quarry_core::QuarryConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "quarry", version, about = "Plan, check and introspect Quarry schemas")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Plan a list request and print the SQL it renders to.
    Plan {
        #[arg(long, short = 'c', default_value = "quarry.yaml")]
        config: PathBuf,

        /// Entity to query.
        #[arg(long, short = 'e')]
        entity: String,

        /// Request JSON, or @path to a JSON file.
        #[arg(long, short = 'r')]
        request: Option<String>,

        /// Username to plan as. Without one the anonymous principal is used.
        #[arg(long, short = 'p')]
        principal: Option<String>,

        /// YAML permission store. Without one planning is unrestricted.
        #[arg(long)]
        permissions: Option<PathBuf>,
    },

    /// Validate a configuration and its schema.
    Check {
        #[arg(long, short = 'c', default_value = "quarry.yaml")]
        config: PathBuf,
    },

    /// Read a PostgreSQL schema and print it as a schema definition.
    Introspect {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,

        #[arg(long, default_value = "public")]
        schema: String,

        /// Configuration supplying the lock-version column name.
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Command::Plan {
            config,
            entity,
            request,
            principal,
            permissions,
        } => {
            commands::plan::run(commands::plan::PlanArgs {
                config,
                entity,
                request,
                principal,
                permissions,
            })
            .await
        }
        Command::Check { config } => {
            println!("Checking {}", config.display());
            let results = commands::check::run(&config)?;
            results.print_summary();
            if results.has_errors() {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Introspect {
            database_url,
            schema,
            config,
        } => {
            let locking = match config {
                Some(path) => QuarryConfig::from_file(path)?.locking,
                None => Default::default(),
            };
            commands::introspect::run(&database_url, &schema, &locking).await
        }
    }
}
