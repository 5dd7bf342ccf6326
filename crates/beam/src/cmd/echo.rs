use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use beam_session::{Role, Session, SessionError, Stream};
use beam_transport::UnixSeqpacketListener;

use crate::cmd::{install_ctrlc_handler, EchoArgs};
use crate::exit::{session_error, transport_error, CliError, CliResult, SUCCESS};
use crate::output::OutputFormat;

enum ReceiveDisposition {
    /// The session ended; go back to accepting.
    Break,
    Fatal(CliError),
}

pub fn run(args: EchoArgs, _format: OutputFormat) -> CliResult<i32> {
    let listener =
        UnixSeqpacketListener::bind(&args.path).map_err(|err| transport_error("bind failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    while running.load(Ordering::SeqCst) {
        let conn = listener
            .accept()
            .map_err(|err| transport_error("accept failed", err))?;
        let session =
            Session::new(conn, Role::Acceptor).map_err(|err| session_error("session failed", err))?;

        let worker = thread::Builder::new()
            .name("beam-echo-session".into())
            .spawn(move || serve_session(session));
        if let Err(err) = worker {
            tracing::warn!(error = %err, "failed to start session thread");
        }
    }

    Ok(SUCCESS)
}

fn serve_session(session: Session) {
    loop {
        let stream = match session.receive() {
            Ok(stream) => stream,
            Err(err) => match classify_receive_error(err) {
                ReceiveDisposition::Break => break,
                ReceiveDisposition::Fatal(cli_err) => {
                    tracing::warn!(error = %cli_err, "session failed");
                    break;
                }
            },
        };

        tracing::info!(
            id = stream.id(),
            headers = %stream.header(),
            "echoing stream"
        );
        let spawned = thread::Builder::new()
            .name(format!("beam-echo-{}", stream.id()))
            .spawn(move || {
                if let Err(err) = echo_stream(&stream) {
                    tracing::warn!(id = stream.id(), error = %err, "echo failed");
                }
            });
        if let Err(err) = spawned {
            tracing::warn!(error = %err, "failed to start echo thread");
        }
    }
    let _ = session.close();
}

/// Copy everything read from `stream` back into it, then close it.
pub(crate) fn echo_stream(stream: &Stream) -> io::Result<u64> {
    let mut reader = stream;
    let mut writer = stream;
    let copied = io::copy(&mut reader, &mut writer)?;
    tracing::debug!(id = stream.id(), bytes = copied, "stream echoed");
    let _ = stream.close();
    Ok(copied)
}

fn classify_receive_error(err: SessionError) -> ReceiveDisposition {
    match err {
        SessionError::Closed | SessionError::ConnectionLost(_) => ReceiveDisposition::Break,
        other => ReceiveDisposition::Fatal(session_error("receive failed", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn closed_session_breaks_loop() {
        assert!(matches!(
            classify_receive_error(SessionError::Closed),
            ReceiveDisposition::Break
        ));
        assert!(matches!(
            classify_receive_error(SessionError::ConnectionLost("reset".into())),
            ReceiveDisposition::Break
        ));
    }

    #[test]
    fn other_errors_are_fatal() {
        assert!(matches!(
            classify_receive_error(SessionError::NoEndpoint),
            ReceiveDisposition::Fatal(_)
        ));
    }

    #[test]
    fn echo_stream_returns_bytes() {
        let (a, b) = Session::pair().expect("session pair should start");
        let stream = a.new_stream(None);
        stream.send().expect("send should succeed");
        (&stream).write_all(b"ping").unwrap();
        stream.close_write().unwrap();

        let remote = b.receive().expect("stream should arrive");
        assert_eq!(echo_stream(&remote).unwrap(), 4);

        let mut reply = Vec::new();
        (&stream).read_to_end(&mut reply).unwrap();
        assert_eq!(reply, b"ping");
    }
}
