use clap::Parser;
use vigil_cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = cli.run().await {
        eprintln!("❌ Error: {e}");
        std::process::exit(1);
    }
    // A pending stdin read from `start --interactive` would otherwise hold
    // the runtime open.
    std::process::exit(0);
}
