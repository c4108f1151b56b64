//! Dawn relay - Tagged-frame message server
//!
//! Greets every connection and echoes each frame back unless a handler is
//! registered for its tag.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dawnrelay::config::{self, Config};
use dawnrelay::network::{resolve_host, Client, Server, ServerEvent};
use dawnrelay::protocol::{self, tag_name, tags, Frame};

/// Dawn relay - tagged-frame message server
#[derive(Parser)]
#[command(name = "dawnrelay")]
#[command(author = "Dawn Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Greets connections and relays tagged frames", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Interface to bind to
        #[arg(short, long)]
        bind: Option<String>,

        /// Maximum payload bytes per frame
        #[arg(long)]
        max_payload: Option<usize>,

        /// Close sessions idle for this many seconds
        #[arg(long)]
        idle_timeout: Option<u64>,
    },

    /// Send one frame to a server and print the reply
    Send {
        /// Server host or address
        #[arg(short, long, default_value = "127.0.0.1")]
        server: String,

        /// Server port
        #[arg(short, long, default_value_t = protocol::DEFAULT_PORT)]
        port: u16,

        /// Frame tag
        #[arg(short, long, default_value_t = tags::PROTOBUF)]
        tag: u8,

        /// Send the contents of this file as a file frame
        #[arg(short, long, conflicts_with = "payload")]
        file: Option<PathBuf>,

        /// Number of connect attempts, one second apart
        #[arg(long, default_value_t = 1)]
        retries: u32,

        /// Print frames as JSON lines
        #[arg(long)]
        json: bool,

        /// Payload text
        payload: Option<String>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show protocol information
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Initialize logging; RUST_LOG wins when set
    let default_level = if cli.verbose || config.general.verbose {
        "debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Serve {
            port,
            bind,
            max_payload,
            idle_timeout,
        } => {
            let mut config = config;
            if let Some(port) = port {
                config.network.port = port;
            }
            if let Some(bind) = bind {
                config.network.bind_address = bind;
            }
            if let Some(max_payload) = max_payload {
                config.protocol.max_payload_size = max_payload;
            }
            if idle_timeout.is_some() {
                config.network.idle_timeout_secs = idle_timeout;
            }
            config.validate()?;
            run_server(config).await?;
        }
        Commands::Send {
            server,
            port,
            tag,
            file,
            retries,
            json,
            payload,
        } => {
            let frame = match file {
                Some(path) => Frame::new(tags::FILE, tokio::fs::read(&path).await?),
                None => Frame::new(tag, payload.unwrap_or_default().into_bytes()),
            };
            run_send(config, &server, port, frame, retries, json).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => {
            print_protocol_info();
        }
    }

    Ok(())
}

/// Run the relay server until Ctrl+C
async fn run_server(config: Config) -> anyhow::Result<()> {
    let net_config = config.network_config();
    let registry = config.handler_registry();

    tracing::info!(
        "Starting relay '{}' on {}",
        config.general.name,
        net_config.listen_addr()
    );

    let mut server = Server::new(net_config, registry);
    let mut event_rx = server
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("event receiver already taken"))?;

    let local_addr = server.start().await?;

    println!("\n========================================");
    println!("  Dawn Relay Running");
    println!("========================================");
    println!("  Name: {}", config.general.name);
    println!("  Listening: {}", local_addr);
    println!("  TLS: {}", if config.security.tls { "on" } else { "off" });
    println!("  Max payload: {} bytes", config.protocol.max_payload_size);
    println!("========================================");
    println!("\nPress Ctrl+C to stop.\n");

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ServerEvent::SessionOpened { id, addr } => {
                        println!("+ {} connected ({})", addr, id);
                    }
                    ServerEvent::SessionClosed { id, addr, reason } => {
                        println!("- {} disconnected ({}): {}", addr, id, reason);
                    }
                    ServerEvent::Error { message } => {
                        tracing::error!("Server error: {}", message);
                    }
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    server.stop().await?;
    tracing::info!("Relay '{}' stopped", config.general.name);

    Ok(())
}

/// Send one frame and print the greeting and the reply
async fn run_send(
    config: Config,
    host: &str,
    port: u16,
    frame: Frame,
    retries: u32,
    json: bool,
) -> anyhow::Result<()> {
    let mut net_config = config.network_config();
    net_config.port = port;

    let addr = resolve_host(host, port).await?;
    let mut client =
        Client::connect_with_retry(addr, &net_config, retries.max(1), Duration::from_secs(1))
            .await?;

    print_frame(client.greeting(), json)?;

    let reply = client.request(&frame).await?;
    print_frame(&reply, json)?;

    client.disconnect().await?;
    Ok(())
}

fn print_frame(frame: &Frame, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(&frame.summary())?);
    } else {
        println!("{}", frame.summary());
    }
    Ok(())
}

/// Print protocol information
fn print_protocol_info() {
    println!("Dawn Relay Protocol");
    println!("===================\n");
    println!("Frame: [length: u32 big-endian][tag: u8][payload: length - 1 bytes]");
    println!("Default port: {}", protocol::DEFAULT_PORT);
    println!(
        "Greeting: tag {} payload {:?}",
        tags::HANDSHAKE,
        String::from_utf8_lossy(protocol::DEFAULT_GREETING)
    );
    println!("\nReserved tags:");
    for tag in tags::RESERVED {
        println!("  {:>3}  {}", tag, tag_name(tag).unwrap_or("?"));
    }
    println!("\nUnregistered tags are echoed back unchanged.");
}
