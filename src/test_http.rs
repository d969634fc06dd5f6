//! Local JSON-over-HTTP stub standing in for the key service and explorer.

use serde_json::Value;
use std::sync::Arc;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

/// Serves every request with `handler(path, json_body) -> (status, json)` and
/// returns the base url. Each response closes its connection.
pub async fn serve<F>(handler: F) -> String
where
    F: Fn(&str, Value) -> (u16, Value) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handler = handler.clone();
            tokio::spawn(async move {
                let _ = respond(stream, handler).await;
            });
        }
    });

    format!("http://{}", addr)
}

async fn respond<F>(mut stream: TcpStream, handler: Arc<F>) -> std::io::Result<()>
where
    F: Fn(&str, Value) -> (u16, Value),
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let (head_end, content_length) = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..pos]).to_string();
            let len = head
                .lines()
                .filter_map(|l| l.split_once(':'))
                .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
                .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            break (pos + 4, len);
        }
    };

    while buf.len() < head_end + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let path = head.split_whitespace().nth(1).unwrap_or("/").to_owned();
    let end = buf.len().min(head_end + content_length);
    let body = serde_json::from_slice(&buf[head_end..end]).unwrap_or(Value::Null);

    let (status, payload) = handler(&path, body);
    let payload = payload.to_string();
    let reason = match status {
        200 => "OK",
        201 => "Created",
        400 => "Bad Request",
        _ => "Error",
    };
    let resp = format!(
        "HTTP/1.1 {} {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        status,
        reason,
        payload.len(),
        payload
    );
    stream.write_all(resp.as_bytes()).await?;
    stream.shutdown().await
}
