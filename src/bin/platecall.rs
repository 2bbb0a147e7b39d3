use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use platecall::{
    admission::{Admission, Role, TokenRequest},
    app::{create_router, AppStateBuilder},
    config::Config,
    handler::middleware::request_log::AccessLogEventFormat,
    version,
};
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{
    fmt::time::SystemTime, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version = version::get_short_version(),
    about = "Plate-addressed call signaling server",
    long_about = version::get_version_info()
)]
struct Cli {
    #[clap(
        long,
        global = true,
        help = "Path to the configuration file (TOML format)"
    )]
    conf: Option<String>,
    #[clap(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP and WebSocket server (default)
    Serve,
    /// Validate configuration and exit without starting the server
    CheckConfig,
    /// Issue a media token for a registered plate and print it as JSON
    Token {
        #[clap(long)]
        channel: String,
        #[clap(long, default_value_t = 0)]
        uid: u32,
        #[clap(long)]
        ttl: Option<u32>,
        #[clap(long, help = "Issue a subscribe-only token")]
        subscriber: bool,
    },
}

fn init_tracing(config: &Config) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let mut env_filter = EnvFilter::from_default_env();
    if let Some(Ok(level)) = config
        .log_level
        .as_ref()
        .map(|level| level.parse::<LevelFilter>())
    {
        env_filter = env_filter.add_directive(level.into());
    }

    if let Some(ref log_file) = config.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .map_err(|e| anyhow::anyhow!("failed to open log file {}: {}", log_file, e))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .event_format(AccessLogEventFormat::new(SystemTime))
                    .with_ansi(false)
                    .with_writer(non_blocking),
            )
            .try_init()?;
        Ok(Some(guard))
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().event_format(AccessLogEventFormat::new(SystemTime)))
            .try_init()?;
        Ok(None)
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received CTRL+C, shutting down"),
                    _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                tracing::warn!("failed to install SIGTERM handler: {}", e);
                tokio::signal::ctrl_c().await.ok();
                info!("received CTRL+C, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        info!("received CTRL+C, shutting down");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    let config = if let Some(ref path) = cli.conf {
        println!("Loading config from: {}", path);
        Config::load(path)?
    } else {
        println!("Loading default config");
        Config::default()
    };

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::CheckConfig => match config.validate() {
            Ok(_) => {
                println!("Configuration is valid.");
                Ok(())
            }
            Err(issues) => {
                eprintln!("Configuration validation failed:");
                for issue in issues {
                    eprintln!("- {}: {}", issue.field, issue.message);
                }
                std::process::exit(1);
            }
        },
        Commands::Token {
            channel,
            uid,
            ttl,
            subscriber,
        } => {
            let state = AppStateBuilder::new().with_config(config).build().await?;
            let req = TokenRequest {
                channel,
                role: if subscriber {
                    Role::Subscriber
                } else {
                    Role::Publisher
                },
                ttl_seconds: ttl,
                uid,
            };
            let token = state.admission.issue(&req).await?;
            println!("{}", serde_json::to_string_pretty(&token)?);
            Ok(())
        }
        Commands::Serve => {
            let _guard = init_tracing(&config)?;
            if let Err(issues) = config.validate() {
                for issue in issues {
                    tracing::warn!(field = issue.field, "config: {}", issue.message);
                }
            }
            println!("Start at {}", Utc::now());
            println!("{}", version::get_version_info());

            let state = AppStateBuilder::new().with_config(config).build().await?;
            info!("starting platecall on {}", state.config().http_addr);
            let router = create_router(state.clone());
            let mut app_future = Box::pin(platecall::app::run(state.clone(), router));

            tokio::select! {
                result = &mut app_future => result?,
                _ = shutdown_signal() => {
                    state.token().cancel();
                    app_future.await?;
                }
            }
            Ok(())
        }
    }
}
