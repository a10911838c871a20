#![allow(clippy::uninlined_format_args)]

use clap::Parser;
use dapper_core::config::{Cli, Configuration};
use dapper_core::dap_types::{DapMessage, Request};
use dapper_core::session::Session;
use log::{error, info};
use std::error::Error;
use std::io::{BufRead, BufReader, Read, Write};

/// Minimal stdio front end exercising the session: the client-facing byte
/// transport is an external collaborator (SPEC_FULL.md §1), so this is a
/// reference `Content-Length`-framed reader/writer, not a hardened transport.
fn read_dap_message<R: BufRead>(reader: &mut R) -> Result<Option<Request>, Box<dyn Error>> {
    let mut header = String::new();
    if reader.read_line(&mut header)? == 0 {
        return Ok(None);
    }
    if !header.to_ascii_lowercase().starts_with("content-length:") {
        return Err("missing Content-Length header".into());
    }
    let len: usize = header
        .split(':')
        .nth(1)
        .ok_or("invalid Content-Length")?
        .trim()
        .parse()?;
    let mut blank = String::new();
    reader.read_line(&mut blank)?;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    let text = std::str::from_utf8(&buf)?;
    match serde_json::from_str::<DapMessage>(text)? {
        DapMessage::Request(req) => Ok(Some(req)),
        _ => Err("expected a request from the client".into()),
    }
}

fn write_dap_message<W: Write>(writer: &mut W, message: &DapMessage) -> Result<(), Box<dyn Error>> {
    let body = serde_json::to_string(message)?;
    write!(writer, "Content-Length: {}\r\n\r\n{}", body.len(), body)?;
    writer.flush()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    std::panic::set_hook(Box::new(|info| {
        error!("panic: {info}");
    }));

    let log_path = dapper_core::logging::init(None)?;

    let cli = Cli::parse();
    let config = Configuration::from_cli(&cli);
    info!("dapper pid {} logging to {}", std::process::id(), log_path.display());

    if let Err(msg) = config.validate() {
        error!("invalid configuration: {msg}");
        std::process::exit(2);
    }

    let mut session = Session::new(config);
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut reader = BufReader::new(stdin.lock());
    let mut writer = stdout.lock();

    loop {
        let req = match read_dap_message(&mut reader) {
            Ok(Some(req)) => req,
            Ok(None) => break,
            Err(e) => {
                error!("failed to read client message: {e}");
                break;
            }
        };
        let is_disconnect = req.command == "disconnect" || req.command == "terminate";
        let (response, events) = session.dispatch(req).await;
        write_dap_message(&mut writer, &DapMessage::Response(response))?;
        for event in events {
            write_dap_message(&mut writer, &DapMessage::Event(event))?;
        }
        if is_disconnect {
            break;
        }
    }

    Ok(())
}
