use std::process::ExitCode;

fn main() -> ExitCode {
    pomosync::run()
}
