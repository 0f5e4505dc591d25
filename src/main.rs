use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use integration_gateway::cli::{self, OutputFormat};
use integration_gateway::{config, server, Gateway};

#[derive(Parser)]
#[command(name = "integration-gateway")]
#[command(version, about = "Resilient gateway in front of external HTTP APIs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (falls back to GATEWAY_CONFIG)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Disable TLS certificate verification for upstream calls
    #[arg(long, global = true)]
    insecure: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP gateway
    Serve {
        /// Address to listen on (overrides server.listen)
        #[arg(long)]
        listen: Option<String>,
    },

    /// Invoke a route once and print the result
    Invoke {
        /// Route name
        route: String,

        /// Route input as JSON
        #[arg(long, default_value = "{}")]
        input: String,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },

    /// Print the cache key for a request
    Key {
        /// HTTP method
        method: String,

        /// Request path
        path: String,

        /// Query parameters as name=value
        params: Vec<String>,
    },

    /// Validate configuration and list connectors and routes
    Check {
        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Read by HttpTransport when it builds its TLS connector
    if cli.insecure {
        std::env::set_var("GATEWAY_INSECURE_TLS", "true");
    }

    let runtime = if matches!(cli.command, Commands::Serve { .. }) {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
    } else {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
    };

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    // Key derivation needs no configuration
    if let Commands::Key {
        method,
        path,
        params,
    } = &cli.command
    {
        return cli::cmd_key(method, path, params);
    }

    let config = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Check { format } => {
            cli::cmd_check(&config, format)?;
        }
        Commands::Invoke {
            route,
            input,
            format,
        } => {
            let gateway = Gateway::new(config)?;
            cli::cmd_invoke(&gateway, &route, &input, format).await?;
        }
        Commands::Serve { listen } => {
            let listen = listen.unwrap_or_else(|| config.server.listen.clone());
            let gateway = Gateway::new(config)?;
            server::run_server(&gateway, &listen).await?;
        }
        Commands::Key { .. } => {}
    }

    Ok(())
}
