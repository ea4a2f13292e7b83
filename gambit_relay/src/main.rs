// CLI entry point for the Gambit session relay.
//
// Starts a standalone relay that game clients connect to. The relay owns
// authoritative session state (positions, clocks, outcomes) and broadcasts
// every applied change to the matching session's room. See `server.rs` for
// the networking architecture and `engine.rs` for the session engine.
//
// Usage:
//   relay [OPTIONS]
//     --port <PORT>                 Listen port (default: 7878)
//     --on-disconnect <POLICY>      notify | forfeit (default: notify)

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use gambit_relay::reconnect::DisconnectPolicy;
use gambit_relay::server::{RelayConfig, start_relay};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = parse_args();

    let (handle, addr) = match start_relay(config) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("Failed to start relay: {e}");
            std::process::exit(1);
        }
    };

    println!("Relay listening on {addr}");
    println!("Press Ctrl+C to stop.");

    // Wait for Ctrl+C.
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    ctrlc_wait(running_clone);

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    println!("\nShutting down...");
    handle.stop();
}

/// Parse command-line arguments into a `RelayConfig`. Uses simple
/// `std::env::args()` matching — no clap dependency.
fn parse_args() -> RelayConfig {
    let mut config = RelayConfig::default();
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--port" => {
                i += 1;
                config.port = args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                    eprintln!("--port requires a valid port number");
                    std::process::exit(1);
                });
            }
            "--on-disconnect" => {
                i += 1;
                config.disconnect_policy = args
                    .get(i)
                    .and_then(|s| DisconnectPolicy::parse(s))
                    .unwrap_or_else(|| {
                        eprintln!("--on-disconnect requires 'notify' or 'forfeit'");
                        std::process::exit(1);
                    });
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

    config
}

fn print_usage() {
    println!("Usage: relay [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --port <PORT>             Listen port (default: 7878)");
    println!("  --on-disconnect <POLICY>  notify | forfeit (default: notify)");
    println!("  --help, -h                Show this help");
}

/// Block until Ctrl+C is pressed, then set the flag to false.
fn ctrlc_wait(running: Arc<AtomicBool>) {
    // The process exits on SIGINT/SIGTERM by default, which is fine for a
    // relay — sessions live in the store, and the default store is
    // in-memory anyway. If more graceful shutdown is needed later, add the
    // `ctrlc` crate and flip the flag from its handler.
    let _ = running;
}
