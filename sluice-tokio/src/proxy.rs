//! `CONNECT` tunnels through an HTTP forward proxy.

use anyhow::{Context as _, bail};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Upper bound on the proxy's response head.
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Asks the proxy behind `tcp` for a tunnel to `host:port` and returns the
/// stream once the tunnel is open.
pub(crate) async fn tunnel(
    mut tcp: TcpStream,
    host: &str,
    port: u16,
) -> anyhow::Result<TcpStream> {
    let authority = authority(host, port);
    let request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n");
    tcp.write_all(request.as_bytes())
        .await
        .context("unable to send CONNECT request to proxy")?;

    let head = read_head(&mut tcp).await?;
    let status_line = head.lines().next().unwrap_or_default();
    if status_code(status_line) != Some(200) {
        warn!(%authority, status_line, "proxy refused CONNECT");
        bail!("proxy refused CONNECT to {authority}: {status_line}");
    }
    debug!(%authority, "proxy tunnel established");
    Ok(tcp)
}

fn authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

async fn read_head(tcp: &mut TcpStream) -> anyhow::Result<String> {
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            bail!("proxy response head exceeds {MAX_RESPONSE_HEAD} bytes");
        }
        let byte = tcp
            .read_u8()
            .await
            .context("proxy closed the connection during CONNECT")?;
        head.push(byte);
    }
    String::from_utf8(head).context("proxy response head is not valid UTF-8")
}

fn status_code(status_line: &str) -> Option<u16> {
    let mut parts = status_line.split_whitespace();
    if !parts.next()?.starts_with("HTTP/1.") {
        return None;
    }
    parts.next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn status_line_parsing() {
        assert_eq!(status_code("HTTP/1.1 200 Connection established"), Some(200));
        assert_eq!(status_code("HTTP/1.0 407 Proxy Authentication Required"), Some(407));
        assert_eq!(status_code("SSH-2.0-OpenSSH"), None);
        assert_eq!(status_code(""), None);
    }

    #[test]
    fn ipv6_hosts_are_bracketed() {
        assert_eq!(authority("example.com", 443), "example.com:443");
        assert_eq!(authority("::1", 8080), "[::1]:8080");
    }

    #[tokio::test]
    async fn tunnel_sends_connect_and_keeps_bytes_after_the_head() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let proxy = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            while !request.ends_with(b"\r\n\r\n") {
                request.push(socket.read_u8().await.unwrap());
            }
            socket
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\nhello")
                .await
                .unwrap();
            String::from_utf8(request).unwrap()
        });

        let tcp = TcpStream::connect(addr).await.unwrap();
        let mut tcp = tunnel(tcp, "example.com", 443).await.unwrap();

        let mut greeting = [0; 5];
        tcp.read_exact(&mut greeting).await.unwrap();
        assert_eq!(&greeting, b"hello");
        assert_eq!(
            proxy.await.unwrap(),
            "CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn refusal_reports_the_status_line() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0; 64];
            let _ = socket.read(&mut request).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let tcp = TcpStream::connect(addr).await.unwrap();
        let error = tunnel(tcp, "example.com", 443).await.unwrap_err();

        assert!(error.to_string().contains("403 Forbidden"), "{error}");
    }
}
