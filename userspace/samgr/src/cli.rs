// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! User-facing CLI helpers for the pipe service manager.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nexus_ipc::{connect, Broker, Mode, PipeServer, Unit};

use crate::{PipeService, Registry, PIPE_SERVICE_ID};

const SELFTEST_SERVER: &str = "samgr.selftest";
const SELFTEST_PAYLOAD: &[u8] = b"open nexus pipe selftest";

/// Returns the CLI usage string for the service manager.
pub fn help() -> &'static str {
    "samgr hosts the pipe service broker. Usage: samgr [--help] [selftest]"
}

/// Executes the CLI using provided arguments.
pub fn execute(args: &[&str]) -> String {
    if args.iter().any(|arg| *arg == "--help") {
        help().to_string()
    } else if args.first() == Some(&"selftest") {
        match selftest() {
            Ok(echoed) => format!("selftest ok: echoed {echoed} bytes"),
            Err(err) => format!("selftest failed: {err}"),
        }
    } else {
        "pipe service ready".to_string()
    }
}

/// Parses `std::env::args` and prints the execution result.
pub fn run() {
    let owned: Vec<String> = std::env::args().skip(1).collect();
    let refs: Vec<&str> = owned.iter().map(|s| s.as_str()).collect();
    println!("{}", execute(&refs));
}

fn running(name: &str) -> nexus_ipc::Result<Unit> {
    let unit = Unit::new(name);
    unit.start()?;
    Ok(unit)
}

/// Echoes a fixed payload through a broker-connected server and returns the echoed length.
fn selftest() -> nexus_ipc::Result<usize> {
    let directory = Registry::new();
    let service = Arc::new(PipeService::new(running("samgr")?)?);
    service
        .register_service(&directory)
        .map_err(|err| nexus_ipc::Error::IllegalState(err.to_string()))?;
    let broker: Arc<dyn Broker> = directory
        .resolve(PIPE_SERVICE_ID)
        .map_err(|err| nexus_ipc::Error::IllegalState(err.to_string()))?
        .broker;

    let (server_unit, client_unit) = (running("selftest-server")?, running("selftest-client")?);
    let server = PipeServer::register(Arc::clone(&broker), &server_unit, SELFTEST_SERVER, "1.0", Mode::ReadWrite)?;
    let server_id = server.id();
    let echo = server_unit.spawn(move |_| -> nexus_ipc::Result<()> {
        let stream = server.accept_and_open()?;
        let mut buf = [0u8; 64];
        while let Some(n) = stream.read(&mut buf)? {
            stream.write(&buf[..n])?;
        }
        stream.close();
        server.close()
    })?;

    // Clients are refused until the server has an accept pending.
    while !service.is_accepting(server_id) {
        if echo.is_finished() {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    let client = connect(broker.as_ref(), &client_unit, SELFTEST_SERVER, "1.0", Mode::ReadWrite)?;
    client.write(SELFTEST_PAYLOAD)?;
    client.close_output();
    let mut echoed = Vec::new();
    let mut buf = [0u8; 16];
    while let Some(n) = client.read(&mut buf)? {
        echoed.extend_from_slice(&buf[..n]);
    }
    client.close();
    echo.join().map_err(|_| nexus_ipc::Error::Io("selftest echo thread panicked".into()))??;

    if echoed != SELFTEST_PAYLOAD {
        return Err(nexus_ipc::Error::Io("selftest echo mismatch".into()));
    }
    log::info!("samgr: selftest echoed {} bytes", echoed.len());
    Ok(echoed.len())
}

#[cfg(test)]
mod tests {
    use super::{execute, help};

    #[test]
    fn help_contains_name() {
        assert!(help().contains("samgr"));
    }

    #[test]
    fn exec_default() {
        assert!(execute(&[]).contains("ready"));
    }

    #[test]
    fn exec_selftest() {
        assert_eq!(execute(&["selftest"]), format!("selftest ok: echoed {} bytes", super::SELFTEST_PAYLOAD.len()));
    }
}
