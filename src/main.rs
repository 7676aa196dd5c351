use std::process::ExitCode;

use email_relay::{
    config::Config,
    domain::errors::RelayError,
    presentation::cli::{Cli, commands},
    telemetry::init_tracing,
};
use tokio::main;
use tracing::error;

#[main]
async fn main() -> ExitCode {
    let cli = Cli::from_args(std::env::args());
    init_tracing();

    let config = match Config::try_parse().map_err(RelayError::from) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "cannot start");
            return ExitCode::FAILURE;
        }
    };

    commands::execute(cli.command, config).await
}
