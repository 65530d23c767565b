use background_queue_cli::run_cli;

#[tokio::main]
async fn main() {
    if let Err(e) = run_cli().await {
        // Logging may not be initialized when the error happened
        eprintln!("bgq: {}", e);
        std::process::exit(e.exit_code());
    }
}
