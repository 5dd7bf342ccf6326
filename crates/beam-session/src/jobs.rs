//! Named job invocation over beam streams.
//!
//! A client opens a parentless stream with `content-type=beam-job`, the job
//! name in `name` and one `args` value per argument. The server answers with
//! two child streams, `stdout` and `stderr`, runs the registered handler,
//! then writes `status=N` on the job stream and closes it.

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Arc;
use std::thread;

use tracing::{debug, warn};

use beam_data::Msg;

use crate::error::{Result, SessionError};
use crate::router::{Router, StreamReceiver};
use crate::session::Session;
use crate::stream::Stream;

/// `content-type` header value marking a job stream.
pub const JOB_CONTENT_TYPE: &str = "beam-job";

pub const STATUS_OK: i32 = 0;
pub const STATUS_ERR: i32 = 1;
/// Status reported for names with no registered handler.
pub const STATUS_NOT_FOUND: i32 = 127;

/// A running job, as seen by its handler.
#[derive(Debug)]
pub struct Job {
    pub name: String,
    pub args: Vec<String>,
    /// The stream the client opened.
    pub stream: Stream,
    pub stdout: Stream,
    pub stderr: Stream,
}

type Handler = dyn Fn(&Job) -> i32 + Send + Sync;

/// Registry of job handlers, keyed by name.
#[derive(Default, Clone)]
pub struct JobServer {
    handlers: HashMap<String, Arc<Handler>>,
}

impl JobServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous one.
    pub fn register(
        mut self,
        name: &str,
        handler: impl Fn(&Job) -> i32 + Send + Sync + 'static,
    ) -> Self {
        self.handlers.insert(name.to_string(), Arc::new(handler));
        self
    }

    /// Registered job names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Route parentless `beam-job` streams on `router` to this server.
    pub fn bind(self, router: &Router) {
        let server = Arc::new(self);
        router
            .new_route()
            .parent(&[])
            .headers(&[("content-type", JOB_CONTENT_TYPE)])
            .handle_func(move |stream| server.serve(stream));
    }

    /// Run one job stream to completion.
    pub fn serve(&self, stream: Stream) {
        if let Err(err) = self.run(&stream) {
            warn!(%stream, error = %err, "job failed");
        }
        let _ = stream.close();
    }

    fn run(&self, stream: &Stream) -> Result<()> {
        let header = stream.header();
        let name = header.get_str("name").unwrap_or_default().to_string();
        let args = header
            .get_all("args")
            .iter()
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .collect();

        let stdout = open_output(stream, "stdout")?;
        let stderr = open_output(stream, "stderr")?;
        let job = Job {
            name,
            args,
            stream: stream.clone(),
            stdout,
            stderr,
        };
        debug!(name = %job.name, args = ?job.args, "running job");

        let status = match self.handlers.get(&job.name) {
            Some(handler) => handler(&job),
            None => {
                let _ = writeln!(&job.stderr, "no such job: {}", job.name);
                STATUS_NOT_FOUND
            }
        };
        job.stdout.close()?;
        job.stderr.close()?;

        let mut result = Msg::new();
        result.set_int("status", i64::from(status));
        (&job.stream)
            .write_all(&result.encode()?)
            .map_err(|e| SessionError::Transport(e.into()))?;
        debug!(name = %job.name, status, "job finished");
        Ok(())
    }
}

fn open_output(job: &Stream, name: &str) -> Result<Stream> {
    let stream = job.new_child()?;
    stream.set_name(name)?;
    stream.send()?;
    Ok(stream)
}

/// Client side of a job started with [`RemoteJob::spawn`].
#[derive(Debug)]
pub struct RemoteJob {
    stream: Stream,
}

impl RemoteJob {
    /// Ask the peer to run job `name` with `args`.
    pub fn spawn(session: &Session, name: &str, args: &[&str]) -> Result<Self> {
        let stream = session.new_stream(None);
        stream.add_header("content-type", JOB_CONTENT_TYPE)?;
        stream.set_name(name)?;
        if !args.is_empty() {
            stream.set_header("args", args.iter())?;
        }
        stream.send()?;
        Ok(Self { stream })
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    /// Wait for the job's output streams from `source`, copy them to
    /// `stdout` and `stderr`, and return the exit status.
    ///
    /// Streams from `source` that don't belong to this job are closed.
    pub fn wait<O, E>(self, source: &impl StreamReceiver, stdout: O, stderr: E) -> Result<i32>
    where
        O: Write + Send,
        E: Write + Send,
    {
        let mut out = None;
        let mut err = None;
        while out.is_none() || err.is_none() {
            let stream = source.receive()?;
            if stream.parent_id() != Some(self.stream.id()) {
                debug!(%stream, "ignoring stream while waiting for job output");
                let _ = stream.close();
                continue;
            }
            match stream.header().get_str("name") {
                Some("stdout") => out = Some(stream),
                Some("stderr") => err = Some(stream),
                _ => {
                    let _ = stream.close();
                }
            }
        }
        let (Some(out), Some(err)) = (out, err) else {
            return Err(SessionError::Closed);
        };

        thread::scope(|scope| -> io::Result<()> {
            let copy_err = scope.spawn(|| copy_all(&err, stderr));
            copy_all(&out, stdout)?;
            copy_err
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("stderr copy panicked")))
        })
        .map_err(|e| SessionError::Transport(e.into()))?;

        let result = Msg::read_from(&self.stream)?;
        let status = result.get_int("status")?;
        Ok(i32::try_from(status).unwrap_or(STATUS_ERR))
    }
}

fn copy_all<W: Write>(stream: &Stream, mut dst: W) -> io::Result<()> {
    let mut src = stream;
    io::copy(&mut src, &mut dst)?;
    dst.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start_server(server: JobServer) -> (Session, Session) {
        let (client, host) = Session::pair().expect("session pair should start");
        let router = Arc::new(Router::new());
        server.bind(&router);
        host.install_router(router);
        (client, host)
    }

    #[test]
    fn job_round_trip() {
        let server = JobServer::new().register("echo", |job| {
            let _ = writeln!(&job.stdout, "{}", job.args.join(" "));
            let _ = writeln!(&job.stderr, "warning: none");
            STATUS_OK
        });
        let (client, _host) = start_server(server);

        let job = RemoteJob::spawn(&client, "echo", &["hello", "world"]).unwrap();
        let mut out = Vec::new();
        let mut err = Vec::new();
        let status = job.wait(&client, &mut out, &mut err).unwrap();

        assert_eq!(status, STATUS_OK);
        assert_eq!(out, b"hello world\n");
        assert_eq!(err, b"warning: none\n");
    }

    #[test]
    fn unknown_job_reports_not_found() {
        let (client, _host) = start_server(JobServer::new());

        let job = RemoteJob::spawn(&client, "missing", &[]).unwrap();
        let mut out = Vec::new();
        let mut err = Vec::new();
        let status = job.wait(&client, &mut out, &mut err).unwrap();

        assert_eq!(status, STATUS_NOT_FOUND);
        assert!(out.is_empty());
        assert_eq!(err, b"no such job: missing\n");
    }

    #[test]
    fn handler_status_is_forwarded() {
        let server = JobServer::new().register("fail", |_| 3);
        let (client, _host) = start_server(server);

        let job = RemoteJob::spawn(&client, "fail", &[]).unwrap();
        let status = job.wait(&client, io::sink(), io::sink()).unwrap();
        assert_eq!(status, 3);
    }

    #[test]
    fn names_are_sorted() {
        let server = JobServer::new()
            .register("exec", |_| STATUS_OK)
            .register("echo", |_| STATUS_OK);
        assert_eq!(server.names(), ["echo", "exec"]);
    }
}
