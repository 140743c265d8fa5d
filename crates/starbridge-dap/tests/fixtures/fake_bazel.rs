//! Minimal `bazel` stand-in for the integration suite.
//!
//! `info` prints a `key: value` table rooted at the working directory. Any
//! other command prints a line on each stream and then idles until killed.
//!
//! Flags (accepted anywhere on the command line):
//! - `--fail-info`: make `info` fail.
//! - `--args-file <path>`: write the full argument list, one per line.
//! - `--pid-file <path>`: write the process id.
//! - `--exit-after-ms <ms>`: exit with status 0 instead of idling.

use std::{
    env, fs,
    io::{self, Write},
    thread,
    time::Duration,
};

fn main() {
    let all_args: Vec<String> = env::args().skip(1).collect();

    let mut fail_info = false;
    let mut args_file: Option<String> = None;
    let mut pid_file: Option<String> = None;
    let mut exit_after_ms: Option<u64> = None;
    let mut command: Option<String> = None;

    let mut args = all_args.iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--fail-info" => fail_info = true,
            "--args-file" => args_file = args.next().cloned(),
            "--pid-file" => pid_file = args.next().cloned(),
            "--exit-after-ms" => {
                exit_after_ms = args.next().and_then(|v| v.parse::<u64>().ok());
            }
            other if !other.starts_with('-') && command.is_none() => {
                command = Some(other.to_string());
            }
            _ => {}
        }
    }

    let cwd = env::current_dir().expect("cwd");
    if command.as_deref() == Some("info") {
        if fail_info {
            eprintln!("ERROR: fake bazel info failure");
            std::process::exit(2);
        }
        let output_base = cwd.join("output_base");
        println!("workspace: {}", cwd.display());
        println!("output_base: {}", output_base.display());
        println!(
            "execution_root: {}",
            output_base.join("execroot").join("my_ws").display()
        );
        println!("release: release 7.0.0-fake");
        return;
    }

    if let Some(path) = args_file {
        fs::write(path, all_args.join("\n")).expect("write args file");
    }
    if let Some(path) = pid_file {
        fs::write(path, std::process::id().to_string()).expect("write pid file");
    }

    let command = command.unwrap_or_default();
    println!("fake bazel: {command}");
    eprintln!("Loading: 0 packages loaded");
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();

    match exit_after_ms {
        Some(ms) => thread::sleep(Duration::from_millis(ms)),
        None => loop {
            thread::sleep(Duration::from_secs(60));
        },
    }
}
