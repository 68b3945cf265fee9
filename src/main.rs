//! repo-lister command line entry point

use repo_lister::cli::{Args, Runner};
use repo_lister::logging::init_tracing;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse_args();
    init_tracing(args.verbose, args.quiet);

    let runner = Runner::new(args);

    match runner.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            runner.logger().error(&err.to_string());
            ExitCode::FAILURE
        }
    }
}
