use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Args, Subcommand};

use crate::exit::{CliError, CliResult, INTERNAL, USAGE};
use crate::output::OutputFormat;

pub mod echo;
pub mod job;
pub mod listen;
pub mod send;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept sessions and echo every stream's bytes back to it.
    Echo(EchoArgs),
    /// Open one stream and write a payload to it.
    Send(SendArgs),
    /// Accept sessions and print received streams.
    Listen(ListenArgs),
    /// Run a job server.
    Serve(ServeArgs),
    /// Run a job on a job server.
    Job(JobArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Echo(args) => echo::run(args, format),
        Command::Send(args) => send::run(args, format),
        Command::Listen(args) => listen::run(args, format),
        Command::Serve(args) => serve::run(args, format),
        Command::Job(args) => job::run(args),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct EchoArgs {
    /// Socket path to bind.
    pub path: PathBuf,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Socket path to connect to.
    pub path: PathBuf,
    /// Stream name (sets the `name` header).
    #[arg(long, short = 'n')]
    pub name: Option<String>,
    /// Extra header as KEY=VALUE. Repeatable.
    #[arg(long = "header", short = 'H', value_name = "KEY=VALUE", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,
    /// Raw string payload.
    #[arg(long, conflicts_with = "file")]
    pub data: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with = "data")]
    pub file: Option<PathBuf>,
    /// Wait for the peer to answer on the stream and print the reply.
    #[arg(long)]
    pub wait: bool,
    /// Maximum time to wait for the reply when --wait is set (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub wait_timeout: String,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Socket path to bind.
    pub path: PathBuf,
    /// Only print streams with this name.
    #[arg(long)]
    pub name: Option<String>,
    /// Exit after receiving N streams.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Socket path to bind.
    pub path: PathBuf,
    /// Disable the `exec` job, which runs local programs.
    #[arg(long)]
    pub no_exec: bool,
}

#[derive(Args, Debug)]
pub struct JobArgs {
    /// Socket path of the job server.
    pub path: PathBuf,
    /// Job name.
    pub name: String,
    /// Job arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

fn parse_header(input: &str) -> Result<(String, String), String> {
    let (key, value) = input
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {input:?}"))?;
    if key.is_empty() || key.contains('\n') {
        return Err(format!("invalid header key {key:?}"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Clear `running` on Ctrl-C.
pub(crate) fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

pub(crate) fn usage(message: impl Into<String>) -> CliError {
    CliError::new(USAGE, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_parsing() {
        assert_eq!(
            parse_header("content-type=beam-job").unwrap(),
            ("content-type".to_string(), "beam-job".to_string())
        );
        assert_eq!(
            parse_header("expr=a=b").unwrap(),
            ("expr".to_string(), "a=b".to_string())
        );
        assert_eq!(
            parse_header("flag=").unwrap(),
            ("flag".to_string(), String::new())
        );
        assert!(parse_header("novalue").is_err());
        assert!(parse_header("=v").is_err());
    }
}
