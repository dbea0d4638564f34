//! Command routing (spec §4.3). The original's two-tier
//! `SystemCommandProcessor` → `FileCommandProcessor`/`DataFrameCommandProcessor`
//! subclass chain becomes three plain functions tried in order: `dispatch_system`,
//! `dispatch_file`, `dispatch_dataframe`. An unrecognized command name is a
//! logged, non-fatal failure envelope — not a dropped connection, which is
//! reserved for framing/JSON decode failures (`SPEC_FULL.md` §4.3).
use std::io;
use std::net::TcpStream;

use tokio::runtime::Handle;
use tracing::warn;

use super::Service;
use crate::dataframe::TabularValue;
use crate::error::CacheError;
use crate::wire::{self, Command, StatusEnvelope};

pub enum Outcome {
    Continue,
    Close,
}

/// Routes one decoded command to its processor and writes the response.
/// Returns `Ok(Outcome::Close)` only for a `close` command; any cache
/// error short of a protocol violation is reported as a failure envelope
/// with the connection left open (spec §7).
pub fn handle_command(service: &Service, stream: &mut TcpStream, handle: &Handle, command: Command) -> io::Result<Outcome> {
    if command.name == "close" {
        wire::send_frame(stream, &StatusEnvelope::ok().encode())?;
        return Ok(Outcome::Close);
    }

    if let Some(outcome) = dispatch_system(service, stream, &command)? {
        return Ok(outcome);
    }
    if let Some(outcome) = dispatch_file(service, stream, handle, &command)? {
        return Ok(outcome);
    }
    if let Some(outcome) = dispatch_dataframe(service, stream, handle, &command)? {
        return Ok(outcome);
    }
    warn!(name = %command.name, "command not handled");
    wire::send_frame(stream, &StatusEnvelope::failure(format!("unknown command: {}", command.name)).encode())?;
    Ok(Outcome::Continue)
}

fn dispatch_system(service: &Service, stream: &mut TcpStream, command: &Command) -> io::Result<Option<Outcome>> {
    match command.name.as_str() {
        "stats" => {
            let level = command.level.unwrap_or(0);
            let used = service.files.current_memory_bytes() + service.dataframes.current_memory_bytes();
            let max = service.files.max_memory_bytes();
            let mut loaded = service.files.loaded_keys();
            loaded.extend(service.dataframes.loaded_keys());
            let stats = crate::stats::build_stats(level, used, max, service.files.root_path(), loaded);
            wire::send_json(stream, &stats)?;
            Ok(Some(Outcome::Continue))
        }
        _ => Ok(None),
    }
}

fn dispatch_file(service: &Service, stream: &mut TcpStream, handle: &Handle, command: &Command) -> io::Result<Option<Outcome>> {
    match command.name.as_str() {
        "set" => {
            // Body frame is read unconditionally first to keep the stream
            // in sync even when the key turns out to be malformed.
            let body = read_body(stream)?;
            let key = decode_key(stream, command)?;
            let Some(key) = key else { return Ok(Some(Outcome::Continue)) };
            let result = handle.block_on(service.files.update(&key, body));
            respond(stream, result.map(|_| ()))?;
            Ok(Some(Outcome::Continue))
        }
        "get" => {
            let key = decode_key(stream, command)?;
            let Some(key) = key else { return Ok(Some(Outcome::Continue)) };
            match handle.block_on(service.files.get(&key)) {
                Ok(value) => {
                    wire::send_frame(stream, &value)?;
                    Ok(Some(Outcome::Continue))
                }
                Err(e) => {
                    log_cache_error(&e);
                    wire::send_frame(stream, &StatusEnvelope::failure(e).encode())?;
                    Ok(Some(Outcome::Continue))
                }
            }
        }
        "load" => {
            let key = decode_key(stream, command)?;
            let Some(key) = key else { return Ok(Some(Outcome::Continue)) };
            match handle.block_on(service.files.get(&key)) {
                Ok(value) => {
                    wire::send_json(stream, &serde_json::json!({ "length": value.len() }))?;
                    Ok(Some(Outcome::Continue))
                }
                Err(e) => {
                    log_cache_error(&e);
                    wire::send_frame(stream, &StatusEnvelope::failure(e).encode())?;
                    Ok(Some(Outcome::Continue))
                }
            }
        }
        "unload" => {
            let key = decode_key(stream, command)?;
            let Some(key) = key else { return Ok(Some(Outcome::Continue)) };
            service.files.unload(&key);
            service.dataframes.unload(&key);
            wire::send_frame(stream, &StatusEnvelope::ok().encode())?;
            Ok(Some(Outcome::Continue))
        }
        _ => Ok(None),
    }
}

fn dispatch_dataframe(service: &Service, stream: &mut TcpStream, handle: &Handle, command: &Command) -> io::Result<Option<Outcome>> {
    match command.name.as_str() {
        "df:update" => {
            let body = read_body(stream)?;
            let key = decode_key(stream, command)?;
            let Some(key) = key else { return Ok(Some(Outcome::Continue)) };
            let incremental = match TabularValue::decode(&body) {
                Ok(value) => value,
                Err(e) => {
                    log_cache_error(&e);
                    wire::send_frame(stream, &StatusEnvelope::failure(e).encode())?;
                    return Ok(Some(Outcome::Continue));
                }
            };
            let result = handle.block_on(service.dataframes.append(&key, incremental));
            respond(stream, result.map(|_| ()))?;
            Ok(Some(Outcome::Continue))
        }
        "df:filter" => {
            let key = decode_key(stream, command)?;
            let Some(key) = key else { return Ok(Some(Outcome::Continue)) };
            let result = handle.block_on(service.dataframes.get_dataframe(
                &key,
                command.range_start,
                command.range_end,
                command.range_type.as_deref(),
            ));
            match result {
                Ok(Some(value)) => {
                    let encoded = value.encode().map_err(to_io_error)?;
                    wire::send_frame(stream, &encoded)?;
                }
                Ok(None) => wire::send_frame(stream, &[])?,
                Err(e) => {
                    log_cache_error(&e);
                    wire::send_frame(stream, &StatusEnvelope::failure(e).encode())?;
                }
            }
            Ok(Some(Outcome::Continue))
        }
        _ => Ok(None),
    }
}

fn decode_key(stream: &mut TcpStream, command: &Command) -> io::Result<Option<crate::key::Key>> {
    match command.key() {
        Ok(key) => Ok(Some(key)),
        Err(e) => {
            wire::send_frame(stream, &StatusEnvelope::failure(e).encode())?;
            Ok(None)
        }
    }
}

fn read_body(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    wire::recv_frame(stream)?.ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "expected body frame"))
}

fn respond(stream: &mut TcpStream, result: Result<(), CacheError>) -> io::Result<()> {
    match result {
        Ok(()) => wire::send_frame(stream, &StatusEnvelope::ok().encode()),
        Err(e) => {
            log_cache_error(&e);
            wire::send_frame(stream, &StatusEnvelope::failure(e).encode())
        }
    }
}

/// `OverBudget`/`NotFound` are routine client-facing failures (warn);
/// `LoadError`/`WriteError` indicate a disk problem (error) — spec §4.3,
/// "`OutOfMemory` ... is logged at warning level and the connection
/// continues".
fn log_cache_error(e: &CacheError) {
    match e {
        CacheError::OverBudget { .. } | CacheError::NotFound(_) => warn!(error = %e, "command failed"),
        _ => tracing::error!(error = %e, "command failed"),
    }
}

fn to_io_error(e: CacheError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}
