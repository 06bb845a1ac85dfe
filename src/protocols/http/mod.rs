//! HTTP/1.1 transport protocol.
//!
//! Reads are issued as `GET`, writes as `POST` carrying the value as body.
//! The request target is the configured URI with `{key}` replaced by the
//! key; a URI without the placeholder is used as-is for every request.
//!
//! ```text
//! GET /kv/000042 HTTP/1.1\r\n
//! Host: localhost:8080\r\n
//! x-tenant: bench\r\n
//! \r\n
//! ```
//!
//! Requests are pipelined on a persistent connection, so every response must
//! be self-delimiting (`Content-Length` or chunked).

pub mod parser;

use super::{Progress, ProtocolError};
use crate::config::Target;
use ::http::Method;
use bytes::BytesMut;
use parser::ResponseFrame;

const KEY_PLACEHOLDER: &str = "{key}";

#[derive(Debug)]
pub struct HttpProtocol {
    host: String,
    uri: String,
    headers: Vec<(String, String)>,
    frame: ResponseFrame,
}

impl HttpProtocol {
    pub fn new(target: &Target) -> Self {
        let host = if target.port == 80 {
            target.host.clone()
        } else {
            format!("{}:{}", target.host, target.port)
        };

        Self {
            host,
            uri: target.uri.clone(),
            headers: target.headers.clone(),
            frame: ResponseFrame::default(),
        }
    }

    pub fn get_request(&self, key: &str, out: &mut BytesMut) -> usize {
        self.request(Method::GET, key, None, out)
    }

    pub fn post_request(&self, key: &str, value: &[u8], out: &mut BytesMut) -> usize {
        self.request(Method::POST, key, Some(value), out)
    }

    fn request(&self, method: Method, key: &str, body: Option<&[u8]>, out: &mut BytesMut) -> usize {
        let start = out.len();

        let target = if self.uri.contains(KEY_PLACEHOLDER) {
            self.uri.replace(KEY_PLACEHOLDER, key)
        } else {
            self.uri.clone()
        };

        out.extend_from_slice(
            format!("{} {} HTTP/1.1\r\nHost: {}\r\n", method, target, self.host).as_bytes(),
        );
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        if let Some(body) = body {
            out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
            out.extend_from_slice(body);
        } else {
            out.extend_from_slice(b"\r\n");
        }

        out.len() - start
    }

    /// Consume one segment of the oldest response.
    pub fn consume(&mut self, input: &mut BytesMut) -> Result<Progress, ProtocolError> {
        self.frame.consume(input)
    }

    pub fn reset(&mut self) {
        self.frame = ResponseFrame::default();
    }
}
