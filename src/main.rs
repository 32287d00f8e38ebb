use anyhow::Context as _;
use busline::codec::{demarshall, marshall_typed, TypedArg, Value};
use busline::config::{Config, LogFormat, LoggingConfig};
use busline::{bus, Context, PROPERTIES_INTERFACE};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "busline")]
#[command(author, version, about = "Call methods and follow properties on D-Bus", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Bus to use: session, system or a D-Bus address (overrides the config)
    #[arg(short, long, global = true)]
    bus: Option<String>,

    /// Print values as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Call a method and print the reply
    Call {
        service: String,
        path: String,
        interface: String,
        method: String,

        /// Arguments as TYPE:VALUE, e.g. s:hello, u:42, as:["a","b"]
        args: Vec<String>,
    },

    /// Print the current value of a property
    Get {
        service: String,
        path: String,
        interface: String,
        property: String,
    },

    /// Print a property's value and every change until interrupted
    Watch {
        service: String,
        path: String,
        interface: String,
        property: String,
    },

    /// Configure settings
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

fn init_logging(verbose: bool, logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("busline=debug,zbus=info")
        } else {
            EnvFilter::new(format!("busline={},zbus=warn", logging.level.to_lowercase()))
        }
    });

    // Logs go to stderr; stdout carries the values
    let (pretty, json) = match logging.format {
        LogFormat::Pretty => (
            Some(tracing_subscriber::fmt::layer().with_writer(std::io::stderr)),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            ),
        ),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(pretty)
        .with(json)
        .init();
}

fn print_values(values: &[Value], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(values)?);
    } else {
        for value in values {
            println!("{}", value);
        }
    }
    Ok(())
}

fn print_value(value: &Value, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(value)?);
    } else {
        println!("{}", value);
    }
    Ok(())
}

fn show_config() -> anyhow::Result<()> {
    let config = Config::load()?;
    let path = Config::config_path()?;

    println!("Config file: {}\n", path.display());
    println!("{}", toml::to_string_pretty(&config)?);

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load().context("Failed to load configuration")?;
    init_logging(cli.verbose, &config.logging);

    if let Some(bus) = cli.bus {
        config.bus.default = bus;
    }

    match cli.command {
        Commands::Call {
            service,
            path,
            interface,
            method,
            args,
        } => {
            // Reject malformed arguments before touching the bus
            let args = args
                .iter()
                .map(|arg| TypedArg::parse(arg).and_then(|arg| marshall_typed(&arg)))
                .collect::<Result<Vec<_>, _>>()?;

            let connection = bus::open(&config.bus).await?;
            let context = Context::new();
            let reply = connection
                .call(&context, &service, &path, &interface, &method, args)
                .finished()
                .await?;

            let values: Vec<Value> = reply.iter().map(demarshall).collect();
            print_values(&values, cli.json)?;
        }

        Commands::Get {
            service,
            path,
            interface,
            property,
        } => {
            let connection = bus::open(&config.bus).await?;
            let reply = connection
                .blocking_call(&service, &path, PROPERTIES_INTERFACE, "Get", (interface.as_str(), property.as_str()))
                .await?;
            let value = reply.first().map(demarshall).unwrap_or_default();
            print_value(&value, cli.json)?;
        }

        Commands::Watch {
            service,
            path,
            interface,
            property,
        } => {
            let connection = bus::open(&config.bus).await?;
            let context = Context::new();
            let json = cli.json;
            connection
                .subscribe_to_property(&context, &service, &path, &interface, &property, move |value: Value| {
                    if let Err(e) = print_value(&value, json) {
                        tracing::warn!("Cannot print value: {}", e);
                    }
                });

            info!("Watching {} {} {}.{}", service, path, interface, property);
            tokio::signal::ctrl_c().await?;
        }

        Commands::Config { show } => {
            if show {
                show_config()?;
            } else {
                println!("Config file: {}", Config::config_path()?.display());
            }
        }
    }

    Ok(())
}
