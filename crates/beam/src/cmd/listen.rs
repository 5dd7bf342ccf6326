use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use beam_session::{Role, Session, SessionError};
use beam_transport::UnixSeqpacketListener;

use crate::cmd::{install_ctrlc_handler, ListenArgs};
use crate::exit::{io_error, session_error, transport_error, CliResult, SUCCESS};
use crate::output::{print_stream, OutputFormat};

pub fn run(args: ListenArgs, format: OutputFormat) -> CliResult<i32> {
    let listener =
        UnixSeqpacketListener::bind(&args.path).map_err(|err| transport_error("bind failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let mut printed = 0usize;

    while running.load(Ordering::SeqCst) {
        let conn = listener
            .accept()
            .map_err(|err| transport_error("accept failed", err))?;
        let session =
            Session::new(conn, Role::Acceptor).map_err(|err| session_error("session failed", err))?;

        while running.load(Ordering::SeqCst) {
            let stream = match session.receive() {
                Ok(stream) => stream,
                Err(SessionError::Closed | SessionError::ConnectionLost(_)) => break,
                Err(err) => return Err(session_error("receive failed", err)),
            };

            if let Some(name) = &args.name {
                if stream.header().get_str("name") != Some(name.as_str()) {
                    let _ = stream.close();
                    continue;
                }
            }

            let mut payload = Vec::new();
            (&stream)
                .read_to_end(&mut payload)
                .map_err(|err| io_error("read failed", err))?;
            let _ = stream.close();

            print_stream(&stream, &payload, format);
            printed = printed.saturating_add(1);

            if let Some(count) = args.count {
                if printed >= count {
                    let _ = session.close();
                    return Ok(SUCCESS);
                }
            }
        }
        let _ = session.close();
    }

    Ok(SUCCESS)
}
