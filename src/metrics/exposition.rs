use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::shutdown::ShutdownReceiver;

use super::TimeSeriesRegistry;

const MAX_REQUEST_BYTES: usize = 16 * 1024;
const TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Serve `GET /metrics` until shutdown.
pub async fn serve_metrics(
    listener: TcpListener,
    registry: Arc<TimeSeriesRegistry>,
    mut shutdown_rx: ShutdownReceiver,
) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Serving metrics on http://{}/metrics", addr);
    }
    loop {
        let socket = tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, _)) => socket,
                Err(err) => {
                    tracing::warn!("Failed to accept metrics connection: {}", err);
                    continue;
                }
            },
        };
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(socket, &registry).await {
                tracing::debug!("Metrics connection closed: {}", err);
            }
        });
    }
}

async fn handle_connection(
    mut socket: TcpStream,
    registry: &TimeSeriesRegistry,
) -> std::io::Result<()> {
    let Some((method, path)) = read_request_line(&mut socket).await? else {
        return write_response(&mut socket, 400, "text/plain", b"Malformed request").await;
    };
    match (method.as_str(), path.as_str()) {
        ("GET", "/metrics") => match registry.render() {
            Ok(body) => write_response(&mut socket, 200, TEXT_CONTENT_TYPE, body.as_bytes()).await,
            Err(err) => {
                tracing::error!("Failed to render metrics: {}", err);
                write_response(&mut socket, 500, "text/plain", b"Render failed").await
            }
        },
        ("GET", _) => write_response(&mut socket, 404, "text/plain", b"Not found").await,
        _ => write_response(&mut socket, 405, "text/plain", b"Method not allowed").await,
    }
}

async fn read_request_line(socket: &mut TcpStream) -> std::io::Result<Option<(String, String)>> {
    let mut buffer: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let bytes = socket.read(&mut chunk).await?;
        if bytes == 0 {
            return Ok(None);
        }
        let Some(read_slice) = chunk.get(..bytes) else {
            return Ok(None);
        };
        buffer.extend_from_slice(read_slice);
        if find_header_end(&buffer).is_some() {
            break;
        }
        if buffer.len() > MAX_REQUEST_BYTES {
            return Ok(None);
        }
    }

    let Ok(text) = std::str::from_utf8(&buffer) else {
        return Ok(None);
    };
    let mut parts = text
        .split("\r\n")
        .next()
        .unwrap_or_default()
        .split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(method), Some(path)) => {
            let path = path.split('?').next().unwrap_or(path);
            Ok(Some((method.to_owned(), path.to_owned())))
        }
        _ => Ok(None),
    }
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|window| window == b"\r\n\r\n")
}

const fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        _ => "OK",
    }
}

async fn write_response(
    socket: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> std::io::Result<()> {
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        status_text(status),
        content_type,
        body.len()
    );
    socket.write_all(head.as_bytes()).await?;
    socket.write_all(body).await?;
    socket.flush().await
}
