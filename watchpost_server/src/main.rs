// CLI entry point for the watchpost alert system server.
//
// Starts a standalone server that sensor, alert and manager nodes connect to.
// See `server.rs` for the networking architecture and `sync.rs` for the
// shared alert system state.
//
// Usage:
//   watchpost-server [OPTIONS]
//     --bind <ADDR>           Listen address (default: 127.0.0.1)
//     --port <PORT>           Listen port (default: 44556)
//     --min-version <V>       Oldest client protocol version accepted
//     --user <NAME:PASSWORD>  Add a user (repeatable)
//     --config <FILE>         JSON config file (alert levels, options, users)
//
// Logging goes through `env_logger`; `RUST_LOG` overrides the default `info`.

use std::path::PathBuf;

use watchpost_server::auth::StaticCredentials;
use watchpost_server::config::{ConfigFile, ServerConfig};
use watchpost_server::server::start_server;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let (config, credentials) = parse_args();
    if credentials.is_empty() {
        log::warn!("no users configured, every authentication will fail");
    }

    let (handle, addr) = match start_server(config, credentials) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("Failed to start server: {e}");
            std::process::exit(1);
        }
    };

    println!("watchpost server listening on {addr}");
    println!("Press Ctrl+C to stop.");

    // The process exits on SIGINT/SIGTERM; session threads are torn down with
    // it.
    loop {
        std::thread::sleep(std::time::Duration::from_secs(60));
        log::debug!("{} nodes connected", handle.system().lock().connected_count());
    }
}

/// Parse command-line arguments. Uses simple `std::env::args()` matching, no
/// clap dependency. The config file, when given, is applied first so flags
/// override it regardless of their order.
fn parse_args() -> (ServerConfig, StaticCredentials) {
    let mut config = ServerConfig::default();
    let mut credentials = StaticCredentials::new();
    let mut config_path: Option<PathBuf> = None;
    let mut bind: Option<String> = None;
    let mut port: Option<u16> = None;
    let mut min_version: Option<f64> = None;
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--bind" => {
                i += 1;
                bind = Some(args.get(i).cloned().unwrap_or_else(|| {
                    eprintln!("--bind requires an address");
                    std::process::exit(1);
                }));
            }
            "--port" => {
                i += 1;
                port = Some(args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                    eprintln!("--port requires a valid port number");
                    std::process::exit(1);
                }));
            }
            "--min-version" => {
                i += 1;
                min_version = Some(args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                    eprintln!("--min-version requires a number");
                    std::process::exit(1);
                }));
            }
            "--user" => {
                i += 1;
                let (name, password) = args
                    .get(i)
                    .and_then(|s| StaticCredentials::parse_entry(s))
                    .unwrap_or_else(|| {
                        eprintln!("--user requires NAME:PASSWORD");
                        std::process::exit(1);
                    });
                credentials.insert(&name, &password);
            }
            "--config" => {
                i += 1;
                config_path = Some(args.get(i).map(PathBuf::from).unwrap_or_else(|| {
                    eprintln!("--config requires a file path");
                    std::process::exit(1);
                }));
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    if let Some(path) = config_path {
        let file = ConfigFile::load(&path).unwrap_or_else(|e| {
            eprintln!("{e}");
            std::process::exit(1);
        });
        for user in &file.users {
            credentials.insert(&user.username, &user.password);
        }
        if let Err(e) = file.apply(&mut config) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
    if let Some(bind) = bind {
        config.bind_addr = bind;
    }
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(min_version) = min_version {
        config.min_client_version = min_version;
    }

    (config, credentials)
}

fn print_usage() {
    println!("Usage: watchpost-server [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --bind <ADDR>           Listen address (default: 127.0.0.1)");
    println!("  --port <PORT>           Listen port (default: 44556)");
    println!("  --min-version <V>       Oldest client protocol version accepted");
    println!("  --user <NAME:PASSWORD>  Add a user (repeatable)");
    println!("  --config <FILE>         JSON config file (alert levels, options, users)");
    println!("  --help, -h              Show this help");
}
