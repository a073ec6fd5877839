mod args;
mod handlers;
mod output;

use clap::Parser;

fn main() {
    let cli = args::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let code = match handlers::dispatch(cli) {
        Ok(code) => code,
        Err(err) => {
            output::error(&format!("{:#}", err));
            2
        }
    };
    std::process::exit(code);
}
