use std::process::ExitCode;

use lockbox::LockboxError;

#[tokio::main]
async fn main() -> ExitCode {
    let err = match lockbox::cli::execute(std::env::args_os()).await {
        Ok(()) => return ExitCode::SUCCESS,
        Err(err) => err,
    };

    // --help and --version come back as clap errors that belong on stdout.
    if let Some(LockboxError::FlagParse(clap_err)) = err.downcast_ref::<LockboxError>() {
        let _ = clap_err.print();
        return if clap_err.use_stderr() {
            ExitCode::FAILURE
        } else {
            ExitCode::SUCCESS
        };
    }

    eprintln!("lockbox: {err:#}");
    ExitCode::FAILURE
}
