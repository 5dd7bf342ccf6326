use std::fs;
use std::io::{Read, Write};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use beam_session::{Session, Stream};

use crate::cmd::{usage, SendArgs};
use crate::exit::{io_error, session_error, CliError, CliResult, SUCCESS, TIMEOUT};
use crate::output::{print_stream, OutputFormat};

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let wait_timeout = parse_duration(&args.wait_timeout)?;
    let payload = resolve_payload(&args)?;

    let session =
        Session::connect(&args.path).map_err(|err| session_error("connect failed", err))?;
    let stream = session.new_stream(None);
    if let Some(name) = &args.name {
        stream
            .set_name(name)
            .map_err(|err| session_error("invalid header", err))?;
    }
    for (key, value) in &args.headers {
        stream
            .add_header(key, value)
            .map_err(|err| session_error("invalid header", err))?;
    }
    stream
        .send()
        .map_err(|err| session_error("send failed", err))?;

    (&stream)
        .write_all(&payload)
        .map_err(|err| io_error("write failed", err))?;
    stream
        .close_write()
        .map_err(|err| session_error("close failed", err))?;
    tracing::debug!(id = stream.id(), bytes = payload.len(), "payload written");

    if args.wait {
        let reply = wait_for_reply(&stream, wait_timeout)?;
        print_stream(&stream, &reply, format);
    }

    let _ = stream.close();
    let _ = session.close();
    Ok(SUCCESS)
}

fn resolve_payload(args: &SendArgs) -> CliResult<Vec<u8>> {
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err));
    }
    Ok(Vec::new())
}

/// Read the stream to EOF on a helper thread, giving up after `timeout`.
fn wait_for_reply(stream: &Stream, timeout: Duration) -> CliResult<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    let reader = stream.clone();
    thread::Builder::new()
        .name("beam-reply".into())
        .spawn(move || {
            let mut reply = Vec::new();
            let result = (&reader).read_to_end(&mut reply).map(|_| reply);
            let _ = tx.send(result);
        })
        .map_err(|err| io_error("failed to start reader", err))?;

    match rx.recv_timeout(timeout) {
        Ok(Ok(reply)) => Ok(reply),
        Ok(Err(err)) => Err(io_error("receive failed", err)),
        Err(_) => Err(CliError::new(
            TIMEOUT,
            format!("no reply within {}ms", timeout.as_millis()),
        )),
    }
}

fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(usage("duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| usage(format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(usage("duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}
