use std::io;

use beam_session::{RemoteJob, Session};

use crate::cmd::JobArgs;
use crate::exit::{session_error, CliResult};

/// Run a named job remotely and exit with its status.
pub fn run(args: JobArgs) -> CliResult<i32> {
    let session = Session::connect(&args.path).map_err(|err| session_error("connect failed", err))?;

    let job_args: Vec<&str> = args.args.iter().map(String::as_str).collect();
    let job = RemoteJob::spawn(&session, &args.name, &job_args)
        .map_err(|err| session_error("job start failed", err))?;
    tracing::debug!(name = %args.name, id = job.stream().id(), "job started");

    let status = job
        .wait(&session, io::stdout(), io::stderr())
        .map_err(|err| session_error("job failed", err))?;
    tracing::debug!(name = %args.name, status, "job finished");

    let _ = session.close();
    Ok(status)
}
