use std::process::ExitCode;

fn main() -> ExitCode {
    splatmap::cli::run()
}
