use crate::paths::Paths;
use crate::pid;
use crate::protocol::{self, Request, Response};
use crate::sys;
use color_eyre::eyre::{Context, bail};
use std::io::{BufRead, BufReader, Write};
use std::time::Duration;

/// One request/response exchange with the running supervisor. The
/// supervisor is launched by the watchdog, never by a client; if nothing
/// is listening this is an error.
pub fn send_request(paths: &Paths, request: &Request) -> color_eyre::Result<Response> {
    if !pid::is_supervisor_running(paths)? {
        bail!("supervisor is not running (start it with `warden watchdog`)");
    }
    let mut stream = connect_with_retry(paths, 10, Duration::from_millis(200))?;

    let encoded = protocol::encode_request(request)?;
    stream.write_all(&encoded)?;
    stream
        .shutdown(std::net::Shutdown::Write)
        .context("failed to close write side")?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    if line.is_empty() {
        bail!("supervisor closed the connection without responding");
    }

    let response = protocol::decode_response(&line)?;
    Ok(response)
}

fn connect_with_retry(
    paths: &Paths,
    retries: u32,
    delay: Duration,
) -> color_eyre::Result<sys::SyncIpcStream> {
    for attempt in 0..retries {
        match sys::ipc_connect(paths) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                if attempt == retries - 1 {
                    bail!("failed to connect to supervisor after {retries} attempts: {e}");
                }
                std::thread::sleep(delay);
            }
        }
    }

    unreachable!()
}
