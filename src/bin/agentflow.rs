use agentflow::app::cli::{Cli, Command};
use agentflow::app::execute_run;
use agentflow::orchestrator::RunOutcome;
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let code = match cli.command {
        Command::Run(args) => match execute_run(&args) {
            Ok(RunOutcome::Completed) => 0,
            Ok(RunOutcome::Failed { failed_steps }) => {
                eprintln!("workflow failed at step(s): {}", failed_steps.join(", "));
                1
            }
            Err(err) => {
                eprintln!("{err}");
                2
            }
        },
    };
    std::process::exit(code);
}
