use clap::Parser;
use runbook_core::classify;

fn main() {
    runbook_cli::init_tracing();
    let cli = runbook_cli::Cli::parse();
    if let Err(err) = runbook_cli::run_cli(cli) {
        let class = classify(&err);
        tracing::error!(error = %format!("{err:#}"), "command failed");
        eprintln!("error: {}", class.public_message(&err));
        std::process::exit(runbook_cli::exit_code(class));
    }
}
