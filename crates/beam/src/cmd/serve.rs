use std::io::Write;
use std::process::{Command as Process, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use beam_session::jobs::{Job, JobServer, STATUS_ERR, STATUS_NOT_FOUND, STATUS_OK};
use beam_session::{Role, Router, Session, SessionConfig};
use beam_transport::UnixSeqpacketListener;

use crate::cmd::{install_ctrlc_handler, ServeArgs};
use crate::exit::{session_error, transport_error, CliResult, SUCCESS};
use crate::output::OutputFormat;

pub fn run(args: ServeArgs, _format: OutputFormat) -> CliResult<i32> {
    let server = job_server(!args.no_exec);
    let listener =
        UnixSeqpacketListener::bind(&args.path).map_err(|err| transport_error("bind failed", err))?;
    tracing::info!(
        path = %args.path.display(),
        jobs = ?server.names(),
        "job server listening"
    );

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    while running.load(Ordering::SeqCst) {
        let conn = listener
            .accept()
            .map_err(|err| transport_error("accept failed", err))?;
        let router = Arc::new(Router::new());
        server.clone().bind(&router);
        // The session's own threads run the jobs and exit when the peer
        // disconnects, so the handle can be dropped here.
        Session::with_router(conn, Role::Acceptor, SessionConfig::default(), router)
            .map_err(|err| session_error("session failed", err))?;
    }

    Ok(SUCCESS)
}

fn job_server(allow_exec: bool) -> JobServer {
    let server = JobServer::new().register("echo", echo_job);
    if allow_exec {
        server.register("exec", exec_job)
    } else {
        server
    }
}

fn echo_job(job: &Job) -> i32 {
    match writeln!(&job.stdout, "{}", job.args.join(" ")) {
        Ok(()) => STATUS_OK,
        Err(err) => {
            tracing::warn!(error = %err, "echo job write failed");
            STATUS_ERR
        }
    }
}

/// Run `args[0]` with the rest as arguments, its output wired straight to the
/// job's output streams.
fn exec_job(job: &Job) -> i32 {
    let Some((program, rest)) = job.args.split_first() else {
        let _ = writeln!(&job.stderr, "usage: exec PROGRAM [ARGS...]");
        return STATUS_ERR;
    };

    let (stdout, stderr) = match (job.stdout.hijack(), job.stderr.hijack()) {
        (Ok(out), Ok(err)) => (out.into_owned_fd(), err.into_owned_fd()),
        (Err(err), _) | (_, Err(err)) => {
            tracing::warn!(error = %err, "exec job has no output endpoints");
            return STATUS_ERR;
        }
    };

    tracing::debug!(program = %program, args = ?rest, "exec job starting");
    let status = Process::new(program)
        .args(rest)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .status();
    match status {
        Ok(status) => status.code().unwrap_or(STATUS_ERR),
        Err(err) => {
            tracing::warn!(program = %program, error = %err, "exec job failed to start");
            STATUS_NOT_FOUND
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beam_session::jobs::RemoteJob;

    fn start(server: JobServer) -> (Session, Session) {
        let (client_conn, host_conn) =
            beam_transport::Conn::pair().expect("conn pair should open");
        let router = Arc::new(Router::new());
        server.bind(&router);
        let host =
            Session::with_router(host_conn, Role::Acceptor, SessionConfig::default(), router)
                .expect("host session should start");
        let client = Session::new(client_conn, Role::Initiator).expect("client should start");
        (client, host)
    }

    fn run_job(client: &Session, name: &str, args: &[&str]) -> (i32, Vec<u8>, Vec<u8>) {
        let job = RemoteJob::spawn(client, name, args).expect("job should spawn");
        let mut out = Vec::new();
        let mut err = Vec::new();
        let status = job
            .wait(client, &mut out, &mut err)
            .expect("job should finish");
        (status, out, err)
    }

    #[test]
    fn echo_job_joins_args() {
        let (client, _host) = start(job_server(false));
        let (status, out, err) = run_job(&client, "echo", &["hi", "there"]);
        assert_eq!(status, STATUS_OK);
        assert_eq!(out, b"hi there\n");
        assert!(err.is_empty());
    }

    #[test]
    fn exec_can_be_disabled() {
        let (client, _host) = start(job_server(false));
        let (status, _, err) = run_job(&client, "exec", &["true"]);
        assert_eq!(status, STATUS_NOT_FOUND);
        assert_eq!(err, b"no such job: exec\n");
    }

    #[test]
    fn exec_job_runs_program() {
        let (client, _host) = start(job_server(true));
        let script = "echo out; echo err >&2; exit 4";
        let (status, out, err) = run_job(&client, "exec", &["sh", "-c", script]);
        assert_eq!(status, 4);
        assert_eq!(out, b"out\n");
        assert_eq!(err, b"err\n");
    }

    #[test]
    fn exec_without_program_fails() {
        let (client, _host) = start(job_server(true));
        let (status, _, err) = run_job(&client, "exec", &[]);
        assert_eq!(status, STATUS_ERR);
        assert!(String::from_utf8_lossy(&err).starts_with("usage: exec"));
    }
}
