use clap::{CommandFactory, Parser};
use clap_complete::aot::generate;
use stackwarden::cli::{Cli, Commands};
use stackwarden::commands;
use stackwarden::orchestrator::RunMode;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_file = cli.global.config_file.as_deref();

    let result = match cli.command {
        Commands::Install { skip_optional } => {
            commands::run::run(config_file, RunMode::Install, skip_optional).await
        }
        Commands::Start { skip_optional } => {
            commands::run::run(config_file, RunMode::QuickStart, skip_optional).await
        }
        Commands::Status { json } => commands::status::run(config_file, json).await,
        Commands::Containers => commands::containers::run(config_file).await,
        Commands::Down => commands::containers::down(config_file).await,
        Commands::Doctor => commands::doctor::run(config_file).await,
        Commands::Validate => commands::validate::run(config_file),
        Commands::Completions { shell } => {
            generate(shell, &mut Cli::command(), "stackwarden", &mut std::io::stdout());
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
