//! Local HTTP callback server for the OAuth redirect.
//!
//! When an authorization code flow completes in the browser, the server
//! redirects to a local URL carrying `?code=xxx&state=yyy`.  This is a
//! minimal single-shot TCP server: it accepts one request, extracts the
//! code and state, returns a small success page, and shuts down.  No HTTP
//! framework needed — a raw [`tokio::net::TcpListener`] keeps the surface
//! tiny.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::error::{AuthError, Result};

/// The HTML page returned to the browser after a successful callback.
const SUCCESS_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>Authorization Successful</title>
    <style>
        body {
            font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Roboto, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            height: 100vh;
            margin: 0;
            background: #f5f5f5;
            color: #333;
        }
        .card {
            text-align: center;
            padding: 3rem;
            background: white;
            border-radius: 12px;
            box-shadow: 0 2px 10px rgba(0,0,0,0.08);
        }
        h1 { color: #22c55e; margin-bottom: 0.5rem; }
        p { color: #666; }
    </style>
</head>
<body>
    <div class="card">
        <h1>Authorization Successful</h1>
        <p>You can close this tab and return to the terminal.</p>
    </div>
</body>
</html>"#;

/// A minimal HTTP callback server that listens for a single OAuth redirect.
pub struct CallbackServer;

impl CallbackServer {
    /// Bind to `127.0.0.1:{port}`, wait for a single GET request carrying
    /// `code` and `state`, answer with a success page, and return the
    /// extracted `(code, state)` pair.
    ///
    /// # Errors
    ///
    /// [`AuthError::CallbackTimeout`] if `timeout_secs` elapse first;
    /// [`AuthError::Io`] if the listener cannot bind;
    /// [`AuthError::FlowFailed`] on a malformed redirect or a server-side
    /// `error` parameter.
    pub async fn wait_for_redirect(port: u16, timeout_secs: u64) -> Result<(String, String)> {
        let addr = format!("127.0.0.1:{port}");
        let listener = TcpListener::bind(&addr).await?;

        tracing::info!(addr = %addr, "callback server listening for OAuth redirect");

        let timeout = tokio::time::Duration::from_secs(timeout_secs);
        match tokio::time::timeout(timeout, Self::accept_one(&listener)).await {
            Ok(inner) => inner,
            Err(_) => Err(AuthError::CallbackTimeout { timeout_secs }),
        }
    }

    /// Accept a single connection, parse the request, send the response.
    async fn accept_one(listener: &TcpListener) -> Result<(String, String)> {
        let (mut stream, peer) = listener.accept().await?;

        tracing::debug!(peer = %peer, "accepted callback connection");

        // OAuth redirects are small GET requests; 4KB is plenty.
        let mut buf = [0u8; 4096];
        let n = stream.read(&mut buf).await?;
        let request = String::from_utf8_lossy(&buf[..n]);

        let (code, state) = Self::parse_callback_request(&request)?;

        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            SUCCESS_HTML.len(),
            SUCCESS_HTML
        );
        stream.write_all(response.as_bytes()).await?;
        stream.flush().await?;

        tracing::info!("callback received, authorization code extracted");
        Ok((code, state))
    }

    /// Parse the query parameters from the first line of an HTTP GET
    /// request: `GET /callback?code=xxx&state=yyy HTTP/1.1`.
    fn parse_callback_request(request: &str) -> Result<(String, String)> {
        let request_line = request.lines().next().ok_or_else(|| AuthError::FlowFailed {
            reason: "empty HTTP request".to_string(),
        })?;

        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() < 2 {
            return Err(AuthError::FlowFailed {
                reason: format!("malformed HTTP request line: {request_line}"),
            });
        }

        let path = parts[1];
        let query = path
            .split_once('?')
            .map(|(_, q)| q)
            .ok_or_else(|| AuthError::FlowFailed {
                reason: "callback request has no query string".to_string(),
            })?;

        let mut code: Option<String> = None;
        let mut state: Option<String> = None;

        for param in query.split('&') {
            if let Some((key, value)) = param.split_once('=') {
                let decoded = Self::percent_decode(value);
                match key {
                    "code" => code = Some(decoded),
                    "state" => state = Some(decoded),
                    "error" => {
                        return Err(AuthError::FlowFailed {
                            reason: format!("authorization server returned error: {decoded}"),
                        });
                    }
                    _ => {}
                }
            }
        }

        let code = code.ok_or_else(|| AuthError::FlowFailed {
            reason: "callback missing 'code' parameter".to_string(),
        })?;
        let state = state.ok_or_else(|| AuthError::FlowFailed {
            reason: "callback missing 'state' parameter".to_string(),
        })?;

        Ok((code, state))
    }

    /// Minimal percent-decoding for query parameter values: `%XX` sequences
    /// and `+` as space.
    fn percent_decode(input: &str) -> String {
        let mut output = String::with_capacity(input.len());
        let mut bytes = input.bytes();

        while let Some(b) = bytes.next() {
            match b {
                b'%' => {
                    let hi = bytes.next();
                    let lo = bytes.next();
                    if let (Some(h), Some(l)) = (hi, lo) {
                        let hex = [h, l];
                        if let Ok(s) = std::str::from_utf8(&hex)
                            && let Ok(byte) = u8::from_str_radix(s, 16)
                        {
                            output.push(byte as char);
                            continue;
                        }
                        output.push('%');
                        output.push(h as char);
                        output.push(l as char);
                    }
                }
                b'+' => output.push(' '),
                _ => output.push(b as char),
            }
        }

        output
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_standard_redirect() {
        let request =
            "GET /callback?code=abc123&state=xyz789 HTTP/1.1\r\nHost: 127.0.0.1:8737\r\n\r\n";
        let (code, state) = CallbackServer::parse_callback_request(request).unwrap();
        assert_eq!(code, "abc123");
        assert_eq!(state, "xyz789");
    }

    #[test]
    fn parse_redirect_with_extra_params() {
        let request = "GET /cb?code=c123&state=s456&session_state=abcdef HTTP/1.1\r\n\r\n";
        let (code, state) = CallbackServer::parse_callback_request(request).unwrap();
        assert_eq!(code, "c123");
        assert_eq!(state, "s456");
    }

    #[test]
    fn parse_percent_encoded_values() {
        let request = "GET /cb?code=abc%20def&state=123%2B456 HTTP/1.1\r\n\r\n";
        let (code, state) = CallbackServer::parse_callback_request(request).unwrap();
        assert_eq!(code, "abc def");
        assert_eq!(state, "123+456");
    }

    #[test]
    fn parse_missing_code_fails() {
        let result = CallbackServer::parse_callback_request("GET /cb?state=xyz HTTP/1.1\r\n\r\n");
        assert!(result.unwrap_err().to_string().contains("'code'"));
    }

    #[test]
    fn parse_missing_state_fails() {
        let result = CallbackServer::parse_callback_request("GET /cb?code=abc HTTP/1.1\r\n\r\n");
        assert!(result.unwrap_err().to_string().contains("'state'"));
    }

    #[test]
    fn parse_error_param_fails() {
        let result = CallbackServer::parse_callback_request(
            "GET /cb?error=access_denied&state=xyz HTTP/1.1\r\n\r\n",
        );
        assert!(result.unwrap_err().to_string().contains("access_denied"));
    }

    #[test]
    fn parse_empty_and_malformed() {
        assert!(CallbackServer::parse_callback_request("").is_err());
        assert!(CallbackServer::parse_callback_request("NOTHTTP").is_err());
    }

    #[tokio::test]
    async fn server_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let client_task = tokio::spawn(async move {
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

            let mut stream = tokio::net::TcpStream::connect(format!("127.0.0.1:{port}"))
                .await
                .unwrap();

            let request = format!(
                "GET /callback?code=test_code_42&state=test_state_99 HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nConnection: close\r\n\r\n"
            );
            stream.write_all(request.as_bytes()).await.unwrap();

            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            let response = String::from_utf8_lossy(&buf[..n]);
            assert!(response.contains("200 OK"));
            assert!(response.contains("Authorization Successful"));
        });

        let result = CallbackServer::accept_one(&listener).await;
        client_task.await.unwrap();

        let (code, state) = result.unwrap();
        assert_eq!(code, "test_code_42");
        assert_eq!(state, "test_state_99");
    }

    #[tokio::test]
    async fn server_times_out_without_redirect() {
        let result = CallbackServer::wait_for_redirect(0, 1).await;
        match result {
            Err(AuthError::CallbackTimeout { timeout_secs }) => assert_eq!(timeout_secs, 1),
            Err(AuthError::Io(_)) => {}
            other => panic!("expected timeout or io error, got: {other:?}"),
        }
    }
}
