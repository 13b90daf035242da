mod config;
mod content;
mod error;
mod format;
mod relay;
mod server;
mod stats;
mod upstream;

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use content::ContentTable;
use server::ServerState;

const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const RESET: &str = "\x1b[0m";

#[tokio::main]
async fn main() {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("{RED}Error:{RESET} failed to install rustls crypto provider");
        std::process::exit(1);
    }

    let args: Vec<String> = env::args().collect();

    // Subcommands first; anything starting with '-' falls through to serve options
    let mut rest = &args[1.min(args.len())..];
    if let Some(command) = rest.first() {
        match command.as_str() {
            "serve" => rest = &rest[1..],
            "config" => {
                run_config_command();
                return;
            }
            "check-content" => {
                run_check_content_command(&rest[1..]);
                return;
            }
            "-h" | "--help" | "help" => {
                print_help();
                return;
            }
            "-V" | "--version" | "version" => {
                println!("chatrelay {}", env!("CARGO_PKG_VERSION"));
                return;
            }
            arg if !arg.starts_with('-') => {
                eprintln!("{RED}Unknown command:{RESET} {}", arg);
                eprintln!();
                eprintln!("Run '{YELLOW}chatrelay --help{RESET}' for usage information.");
                std::process::exit(1);
            }
            _ => {}
        }
    }

    let mut port: Option<u16> = None;
    let mut host: Option<String> = None;
    let mut debug = false;
    let mut content_path: Option<PathBuf> = None;

    let mut i = 0;
    while i < rest.len() {
        match rest[i].as_str() {
            "--port" | "-p" => {
                i += 1;
                match rest.get(i).map(|v| v.parse::<u16>()) {
                    Some(Ok(p)) if p > 0 => port = Some(p),
                    Some(_) => {
                        eprintln!(
                            "{RED}Invalid port:{RESET} '{}' is not a valid port number (1-65535)",
                            rest[i]
                        );
                        std::process::exit(1);
                    }
                    None => {
                        eprintln!("{RED}Missing value:{RESET} --port requires a port number");
                        std::process::exit(1);
                    }
                }
            }
            "--host" => {
                i += 1;
                match rest.get(i) {
                    Some(h) => host = Some(h.clone()),
                    None => {
                        eprintln!(
                            "{RED}Missing value:{RESET} --host requires a hostname or IP address"
                        );
                        std::process::exit(1);
                    }
                }
            }
            "--content" | "-c" => {
                i += 1;
                match rest.get(i) {
                    Some(p) => content_path = Some(PathBuf::from(p)),
                    None => {
                        eprintln!("{RED}Missing value:{RESET} --content requires a file path");
                        std::process::exit(1);
                    }
                }
            }
            "--debug" | "-d" => debug = true,
            "-h" | "--help" => {
                print_help();
                return;
            }
            "-V" | "--version" => {
                println!("chatrelay {}", env!("CARGO_PKG_VERSION"));
                return;
            }
            arg => {
                eprintln!("{RED}Unknown option:{RESET} {}", arg);
                eprintln!();
                eprintln!("Run '{YELLOW}chatrelay --help{RESET}' for usage information.");
                std::process::exit(1);
            }
        }
        i += 1;
    }

    let config = load_config_or_exit().with_overrides(port, host, debug, content_path);

    // Initialize global config for access from other modules
    config::init_config(config.clone());

    init_logging(config.logging.debug);
    run_server(config).await;
}

fn load_config_or_exit() -> Config {
    match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{RED}Error:{RESET} {}", e);
            if let config::ConfigError::ParseError { source, .. } = &e {
                let msg = source.to_string();
                if let Some(line_info) = msg.split(" at line ").nth(1) {
                    eprintln!();
                    eprintln!(
                        "  Location: line {}",
                        line_info.split_whitespace().next().unwrap_or("?")
                    );
                }
                eprintln!();
                eprintln!("  {DIM}Fix the syntax error and try again.{RESET}");
            }
            std::process::exit(1);
        }
    }
}

async fn run_server(config: Config) {
    let content = match ContentTable::from_optional_path(config.content.path.as_deref()) {
        Ok(table) => table,
        Err(e) => {
            error!(error = %e, "Failed to load content table");
            std::process::exit(1);
        }
    };

    info!(
        intents = content.intents.len(),
        source = %config
            .content
            .path
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "built-in".to_string()),
        "Loaded content table"
    );

    let key_env = &config.upstream.api_key_env;
    if env::var(key_env).map(|v| v.trim().is_empty()).unwrap_or(true) {
        // Checked again per request; the relay still serves health and stats
        warn!(env_var = %key_env, "Upstream credential is not set, chat requests will fail");
    }

    let addr: SocketAddr = match format!("{}:{}", config.server.host, config.server.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(host = %config.server.host, error = %e, "Invalid listen address");
            std::process::exit(1);
        }
    };

    let state = Arc::new(ServerState::new(&config, content));

    info!(
        address = %addr,
        upstream = %state.upstream.url(),
        model = %config.upstream.default_model,
        "Starting chat relay"
    );
    if let Err(e) = run_server_with_shutdown(addr, state).await {
        error!(error = %e, "Server error");
        std::process::exit(1);
    }
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("chatrelay=debug,warn"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chatrelay=info,warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();
}

async fn run_server_with_shutdown(
    addr: SocketAddr,
    state: Arc<ServerState>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %addr, "Server listening");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Received shutdown signal, stopping server");
                break;
            }
            result = listener.accept() => {
                let (stream, remote_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };
                let state = state.clone();

                tokio::spawn(async move {
                    if let Err(e) = server::handle_connection(stream, remote_addr, state).await {
                        warn!(error = %e, remote = %remote_addr, "Connection error");
                    }
                });
            }
        }
    }

    let summary = stats::get_stats().summary();
    info!(
        uptime = %format_uptime(summary.uptime.as_secs()),
        requests = summary.total_requests,
        "Server stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn run_config_command() {
    println!();
    println!("{BOLD}{GREEN}chatrelay configuration{RESET}");
    println!();

    let config_path = Config::path();
    println!("{BOLD}Config file:{RESET}");
    if config_path.exists() {
        println!("  {CYAN}{}{RESET}", config_path.display());
    } else {
        println!(
            "  {} {DIM}{YELLOW}(not created yet){RESET}",
            config_path.display()
        );
    }
    println!();

    let config = load_config_or_exit();

    println!("{BOLD}Effective settings:{RESET}");
    println!();
    for line in config.to_toml().lines() {
        println!("  {}", line);
    }
    println!();

    println!("{BOLD}Environment variables:{RESET}");
    let key_env = &config.upstream.api_key_env;
    match env::var(key_env) {
        Ok(v) if !v.trim().is_empty() => {
            println!("  {YELLOW}{}{RESET} = {DIM}(set){RESET}", key_env)
        }
        _ => println!("  {YELLOW}{}{RESET} = {RED}(not set){RESET}", key_env),
    }
    println!();
}

fn run_check_content_command(args: &[String]) {
    let path = args
        .first()
        .map(PathBuf::from)
        .or_else(|| load_config_or_exit().content.path);

    let source = path
        .as_deref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "built-in content".to_string());

    match ContentTable::from_optional_path(path.as_deref()) {
        Ok(table) => {
            println!("{GREEN}✓{RESET} {} (version {})", source, table.version);
            println!();
            println!(
                "  System prompt: {} characters",
                table.system_prompt.chars().count()
            );
            println!("  Intents, in match order:");
            for intent in &table.intents {
                println!(
                    "    {CYAN}{}{RESET} {DIM}({} patterns){RESET}",
                    intent.name,
                    intent.pattern_count()
                );
            }
        }
        Err(e) => {
            eprintln!("{RED}✗{RESET} {}: {}", source, e);
            std::process::exit(1);
        }
    }
}

fn format_uptime(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
    }
}

fn print_help() {
    println!(
        "{BOLD}chatrelay{RESET} {}
Streaming chat relay with FAQ shortcuts and date substitution

{BOLD}USAGE:{RESET}
    chatrelay [serve] [OPTIONS]
    chatrelay <COMMAND>

{BOLD}COMMANDS:{RESET}
    serve                 Run the relay (default)
    config                Show config file location and effective settings
    check-content [PATH]  Validate a content file and list its intents
    help                  Show this help
    version               Show version

{BOLD}OPTIONS:{RESET}
    -p, --port <PORT>     Listen port (default: 8787)
        --host <HOST>     Listen address (default: 127.0.0.1)
    -c, --content <PATH>  Content table (default: built-in)
    -d, --debug           Debug logging
    -h, --help            Show this help
    -V, --version         Show version

{BOLD}ENVIRONMENT:{RESET}
    OPENAI_API_KEY        Upstream credential (name set by upstream.api_key_env)
    RUST_LOG              Log filter, overrides --debug

{DIM}Config: {}{RESET}",
        env!("CARGO_PKG_VERSION"),
        Config::path().display()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(5), "5s");
        assert_eq!(format_uptime(125), "2m 5s");
        assert_eq!(format_uptime(3720), "1h 2m");
        assert_eq!(format_uptime(90000), "1d 1h");
    }
}
