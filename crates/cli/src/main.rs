use std::process::ExitCode;

fn main() -> ExitCode {
    shutterdesk_cli::run()
}
