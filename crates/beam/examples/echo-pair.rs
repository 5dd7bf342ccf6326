//! Two sessions over a socket pair: one opens streams, the other echoes them.
//!
//! Run with `cargo run -p beam --example echo-pair`.

use std::io::{self, Read, Write};
use std::thread;

use beam::{Session, SessionError};

fn main() -> Result<(), SessionError> {
    let (client, server) = Session::pair()?;

    let echo = thread::spawn(move || {
        while let Ok(stream) = server.receive() {
            let mut reader = &stream;
            let mut writer = &stream;
            let _ = io::copy(&mut reader, &mut writer);
            let _ = stream.close();
        }
    });

    for word in ["alpha", "beta", "gamma"] {
        let stream = client.new_stream(None);
        stream.set_name(word)?;
        stream.send()?;

        (&stream).write_all(word.as_bytes()).map_err(io_to_session)?;
        stream.close_write()?;

        let mut reply = String::new();
        (&stream).read_to_string(&mut reply).map_err(io_to_session)?;
        println!("stream {} echoed {reply:?}", stream.id());
        stream.close()?;
    }

    client.close()?;
    let _ = echo.join();
    Ok(())
}

fn io_to_session(err: io::Error) -> SessionError {
    SessionError::Transport(err.into())
}
