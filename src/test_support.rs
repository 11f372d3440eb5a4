//! Minimal HTTP responder for probe and detector tests.

use std::collections::HashMap;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Serves canned responses by request path until the runtime shuts down.
/// Unknown paths answer 404. Returns `http://127.0.0.1:<port>`.
pub async fn serve(routes: &[(&str, &str)], delay: Duration) -> String {
    let routes: HashMap<String, String> = routes
        .iter()
        .map(|(path, body)| (path.to_string(), body.to_string()))
        .collect();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else { break };
            let routes = routes.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]);
                let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                tokio::time::sleep(delay).await;
                let (status, body) = match routes.get(&path) {
                    Some(body) => ("200 OK", body.clone()),
                    None => ("404 Not Found", String::new()),
                };
                let response = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    format!("http://{addr}")
}

pub const VERSION_BODY: &str = r#"{
  "major": "1",
  "minor": "30",
  "gitVersion": "v1.30.2+k3s1",
  "gitCommit": "abc",
  "gitTreeState": "clean",
  "buildDate": "2024-06-01T00:00:00Z",
  "goVersion": "go1.22",
  "compiler": "gc",
  "platform": "linux/amd64"
}"#;
