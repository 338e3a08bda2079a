use std::env;
use std::path::PathBuf;
use std::process::{Command, ExitCode};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();

    if args.is_empty() {
        print_help();
        return ExitCode::SUCCESS;
    }

    match args[0].as_str() {
        "test" => test(&args[1..]),
        "help" | "--help" | "-h" => {
            print_help();
            ExitCode::SUCCESS
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            eprintln!();
            print_help();
            ExitCode::FAILURE
        }
    }
}

fn print_help() {
    eprintln!(
        r#"ringshm xtask

USAGE:
    cargo xtask <COMMAND> [OPTIONS]

COMMANDS:
    test       Run all tests (unit + property), forwarding extra args to `cargo test`
    help       Print this help message
"#
    );
}

fn project_root() -> PathBuf {
    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    PathBuf::from(manifest_dir).parent().unwrap().to_path_buf()
}

fn test(args: &[String]) -> ExitCode {
    let root = project_root();

    let mut cmd = Command::new("cargo");
    cmd.current_dir(&root).arg("test");

    if !args.is_empty() {
        cmd.args(args);
    }

    let status = cmd.status();

    match status {
        Ok(s) if s.success() => ExitCode::SUCCESS,
        Ok(s) => {
            eprintln!("tests exited with: {s}");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("Failed to run tests: {e}");
            ExitCode::FAILURE
        }
    }
}
