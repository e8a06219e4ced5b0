//! EmberKV - An In-Memory, Redis-Compatible Key-Value Server
//!
//! The binary entry point: loads the optional configuration file named on
//! the command line, wires up logging, builds the engine (replaying the
//! AOF if enabled) and serves until a termination signal arrives.

use emberkv::config::ServerConfig;
use emberkv::database::StandaloneServer;
use emberkv::server::{self, Handler};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

fn print_help() {
    println!(
        r#"
EmberKV - An In-Memory, Redis-Compatible Key-Value Server

USAGE:
    emberkv [CONFIG]

ARGS:
    [CONFIG]    Path to a line-delimited `key value` configuration file.
                Recognized keys: bind, port, appendonly, appendfilename,
                appendfsync (always|everysec|no), databases, requirepass.

OPTIONS:
    -v, --version    Print version information
        --help       Print this help message

CONNECTING:
    Use redis-cli or any Redis client:
    $ redis-cli -p 6379
    127.0.0.1:6379> SET greeting hello
    OK
"#
    );
}

fn print_banner(config: &ServerConfig) {
    println!(
        r#"
        ___           _               _  ____   __
       | __|_ __  ___| |__  ___ _ _ | |/ /\ \ / /
       | _|| '  \| _ \ '_ \/ -_) '_||   <  \ V /
       |___|_|_|_|___/_.__/\___|_|  |_|\_\  \_/

EmberKV v{} - In-Memory, Redis-Compatible Key-Value Server
──────────────────────────────────────────────────────────
Listening on {}   databases: {}   appendonly: {}

Use Ctrl+C to shut down gracefully.
"#,
        emberkv::VERSION,
        config.address(),
        config.databases,
        if config.appendonly { config.appendfsync.to_string() } else { "off".to_string() },
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let config = match args.get(1).map(String::as_str) {
        Some("--help") => {
            print_help();
            return Ok(());
        }
        Some("--version") | Some("-v") => {
            println!("EmberKV version {}", emberkv::VERSION);
            return Ok(());
        }
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };

    let _subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    print_banner(&config);

    let facade = StandaloneServer::new(&config).await?;
    info!(databases = config.databases, "engine initialized");

    let handler = Handler::new(facade);
    // A bind failure propagates and exits non-zero; a signal-driven
    // shutdown drains connections and returns Ok.
    server::listen_and_serve_with_signal(&config.address(), handler).await?;
    Ok(())
}
