//! A bare TCP server for stream lifetime tests.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub(crate) const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Serve one SSE response that sends `frame` and then never ends.
///
/// Returns the base URL and a task that resolves once the client has closed
/// the connection.
pub(crate) async fn hanging_sse_server(frame: &str) -> (String, JoinHandle<()>) {
    sse_server(vec![frame.to_string()], Duration::ZERO, true).await
}

/// Serve one SSE response, writing `frames` with `interval` between them.
///
/// With `hold_open` the connection stays up after the last frame until the
/// client hangs up; otherwise the server closes it.
pub(crate) async fn sse_server(
    frames: Vec<String>,
    interval: Duration,
    hold_open: bool,
) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 16 * 1024];
        let _ = socket.read(&mut buf).await;
        let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n";
        socket.write_all(head.as_bytes()).await.unwrap();

        for (i, frame) in frames.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(interval).await;
            }
            socket.write_all(frame.as_bytes()).await.unwrap();
            socket.flush().await.unwrap();
        }
        if !hold_open {
            return;
        }

        // Drain whatever is left of the request until the client hangs up
        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    });

    (url, handle)
}
