// Device file transfer, expressed entirely as protocol-engine executions.
// Payload bytes ride the channel as base64 text; no new wire framing.
use crate::{
    Error, LinkResult,
    engine::{CLEANUP_BUDGET, Engine, response::Response},
    optimizer::ChunkOptimizer,
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use log::{debug, warn};
use std::time::Instant;

pub(crate) const INITIAL_CHUNK_SIZE: usize = 256;
const EOF_MARKER: &str = "EOF";

/// Writes `data` to `remote_path` on the device filesystem.
pub(crate) fn put_file(engine: &mut Engine, remote_path: &str, data: &[u8]) -> LinkResult<()> {
    let quoted = escape_single_quoted(remote_path)?;
    ensure_ok(engine.execute(&format!("f=open('{}','wb')\nw=f.write", quoted))?)?;

    let mut optimizer = ChunkOptimizer::new(INITIAL_CHUNK_SIZE);
    let outcome = write_chunks(engine, data, &mut optimizer);
    close_remote(engine);
    outcome?;
    let (last_bytes, last_took) = optimizer.last_sample();
    debug!(
        "wrote {} bytes to '{}' (last chunk {} bytes in {:?})",
        data.len(),
        remote_path,
        last_bytes,
        last_took
    );
    Ok(())
}

/// Reads the full contents of `remote_path` from the device filesystem.
pub(crate) fn get_file(engine: &mut Engine, remote_path: &str) -> LinkResult<Vec<u8>> {
    let quoted = escape_single_quoted(remote_path)?;
    ensure_ok(engine.execute(&format!("f=open('{}','rb')\nr=f.read", quoted))?)?;

    let mut optimizer = ChunkOptimizer::new(INITIAL_CHUNK_SIZE);
    let outcome = read_chunks(engine, &mut optimizer);
    close_remote(engine);
    let data = outcome?;
    debug!("read {} bytes from '{}'", data.len(), remote_path);
    Ok(data)
}

fn write_chunks(
    engine: &mut Engine,
    data: &[u8],
    optimizer: &mut ChunkOptimizer,
) -> LinkResult<()> {
    let mut offset = 0usize;
    while offset < data.len() {
        let size = optimizer.chunk_size().min(data.len() - offset);
        let chunk = &data[offset..offset + size];
        let encoded = STANDARD.encode(chunk);
        let started = Instant::now();
        ensure_ok(engine.execute(&format!(
            "w(__import__('binascii').a2b_base64('{}'))",
            encoded
        ))?)?;
        optimizer.record(size, started.elapsed());
        offset += size;
    }
    Ok(())
}

fn read_chunks(engine: &mut Engine, optimizer: &mut ChunkOptimizer) -> LinkResult<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let size = optimizer.chunk_size();
        let started = Instant::now();
        let resp = ensure_ok(engine.execute(&format!(
            "data=r({});print(__import__('binascii').b2a_base64(data).decode().strip()) if data else print('EOF')",
            size
        ))?)?;
        let text = resp.result.unwrap_or_default();
        let text = text.trim();
        if text.is_empty() || text == EOF_MARKER {
            break;
        }
        let chunk = STANDARD
            .decode(text)
            .map_err(|e| Error::ProtocolViolation(format!("Invalid base64 from device: {}", e)))?;
        optimizer.record(chunk.len(), started.elapsed());
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

/// Guarded close, run on every exit path with its own bounded budget so a
/// dead device cannot hang the cleanup.
fn close_remote(engine: &mut Engine) {
    if let Err(e) =
        engine.execute_with_limit("try: f.close()\nexcept: pass", Some(CLEANUP_BUDGET))
    {
        warn!("remote file close failed: {}", e);
    }
}

fn ensure_ok(resp: Response) -> LinkResult<Response> {
    if resp.success {
        Ok(resp)
    } else {
        let message = resp
            .error
            .map(|f| f.message)
            .unwrap_or_else(|| "device rejected the file operation".to_string());
        Err(Error::DeviceError(message))
    }
}

/// Escapes a device path for embedding in a single-quoted Python literal.
/// Rejects empty paths.
fn escape_single_quoted(path: &str) -> LinkResult<String> {
    if path.is_empty() {
        return Err(Error::InvalidArgument(
            "Remote path must not be empty".to_string(),
        ));
    }
    let mut escaped = String::with_capacity(path.len());
    for c in path.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '\'' => escaped.push_str("\\'"),
            '\r' => escaped.push_str("\\r"),
            '\n' => escaped.push_str("\\n"),
            '\t' => escaped.push_str("\\t"),
            c => escaped.push(c),
        }
    }
    Ok(escaped)
}
