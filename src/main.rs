//! netx command line: `netx run -c <file>` and `netx check -c <file>`.

use std::process::ExitCode;

use clap::Parser;
use netx_server::cli::{self, Cli};

#[tokio::main]
async fn main() -> ExitCode {
    match cli::execute(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
