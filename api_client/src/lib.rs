// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Minimal HTTP/1.1 client for the Cloud Hypervisor REST API served on a
//! Unix domain socket.

use std::io::{Read, Write};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Error writing to or reading from HTTP socket")]
    Socket(#[source] std::io::Error),
    #[error("Error parsing HTTP status code")]
    StatusCodeParsing(#[source] std::num::ParseIntError),
    #[error("HTTP output is missing protocol statement")]
    MissingProtocol,
    #[error("Error parsing HTTP Content-Length field")]
    ContentLengthParsing(#[source] std::num::ParseIntError),
    #[error("HTTP response is not valid UTF-8")]
    InvalidUtf8(#[source] std::string::FromUtf8Error),
    #[error("Connection closed before the full response was received")]
    UnexpectedEof,
    #[error("Server responded with an error: {0:?}: {1:?}")]
    ServerResponse(StatusCode, Option<String>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusCode {
    Continue,
    Ok,
    NoContent,
    BadRequest,
    NotFound,
    MethodNotAllowed,
    InternalServerError,
    NotImplemented,
    Unknown(u16),
}

impl StatusCode {
    fn from_raw(code: u16) -> StatusCode {
        match code {
            100 => StatusCode::Continue,
            200 => StatusCode::Ok,
            204 => StatusCode::NoContent,
            400 => StatusCode::BadRequest,
            404 => StatusCode::NotFound,
            405 => StatusCode::MethodNotAllowed,
            500 => StatusCode::InternalServerError,
            501 => StatusCode::NotImplemented,
            c => StatusCode::Unknown(c),
        }
    }

    fn is_server_error(self) -> bool {
        !matches!(
            self,
            StatusCode::Ok | StatusCode::Continue | StatusCode::NoContent
        )
    }
}

fn get_header<'a>(head: &'a str, header: &str) -> Option<&'a str> {
    head.split("\r\n").find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case(header)
            .then_some(value.trim())
    })
}

fn get_status_code(head: &str) -> Result<StatusCode, Error> {
    let status_line = head.lines().next().ok_or(Error::MissingProtocol)?;
    let code = status_line
        .strip_prefix("HTTP/1.1 ")
        .or_else(|| status_line.strip_prefix("HTTP/1.0 "))
        .ok_or(Error::MissingProtocol)?;
    let code = code.split_whitespace().next().unwrap_or_default();

    Ok(StatusCode::from_raw(
        code.parse().map_err(Error::StatusCodeParsing)?,
    ))
}

fn parse_http_response(socket: &mut dyn Read) -> Result<Option<String>, Error> {
    let mut res: Vec<u8> = Vec::new();
    let mut buf = [0u8; 256];

    let (head_len, content_length) = loop {
        if let Some(o) = res.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&res[..o]);
            let content_length = get_header(&head, "Content-Length")
                .map(|l| l.parse::<usize>().map_err(Error::ContentLengthParsing))
                .transpose()?;
            break (o + 4, content_length);
        }

        let count = socket.read(&mut buf).map_err(Error::Socket)?;
        if count == 0 {
            return Err(Error::UnexpectedEof);
        }
        res.extend_from_slice(&buf[..count]);
    };

    if let Some(content_length) = content_length {
        while res.len() < head_len + content_length {
            let count = socket.read(&mut buf).map_err(Error::Socket)?;
            if count == 0 {
                return Err(Error::UnexpectedEof);
            }
            res.extend_from_slice(&buf[..count]);
        }
    }

    let status_code = get_status_code(&String::from_utf8_lossy(&res[..head_len]))?;
    let body = match content_length {
        Some(len) if len > 0 => Some(
            String::from_utf8(res[head_len..head_len + len].to_vec())
                .map_err(Error::InvalidUtf8)?,
        ),
        _ => None,
    };

    if status_code.is_server_error() {
        Err(Error::ServerResponse(status_code, body))
    } else {
        Ok(body)
    }
}

/// Issue `method /api/v1/<endpoint>` (e.g. `vm.add-disk`, `vmm.ping`) and
/// return the response body, if any.
pub fn simple_api_command<T: Read + Write>(
    socket: &mut T,
    method: &str,
    endpoint: &str,
    request_body: Option<&str>,
) -> Result<Option<String>, Error> {
    let mut request = format!(
        "{method} /api/v1/{endpoint} HTTP/1.1\r\nHost: localhost\r\nAccept: */*\r\n"
    );
    if let Some(body) = request_body {
        request.push_str("Content-Type: application/json\r\n");
        request.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    request.push_str("\r\n");
    if let Some(body) = request_body {
        request.push_str(body);
    }

    socket
        .write_all(request.as_bytes())
        .map_err(Error::Socket)?;
    socket.flush().map_err(Error::Socket)?;

    parse_http_response(socket)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    struct MockSocket {
        response: Cursor<Vec<u8>>,
        request: Vec<u8>,
    }

    impl MockSocket {
        fn new(response: &str) -> Self {
            MockSocket {
                response: Cursor::new(response.as_bytes().to_vec()),
                request: Vec::new(),
            }
        }
    }

    impl Read for MockSocket {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.response.read(buf)
        }
    }

    impl Write for MockSocket {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.request.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_request_with_body() {
        let body = "{\"id\":\"vdb\",\"bdf\":\"0000:00:06.0\"}";
        let mut socket = MockSocket::new(&format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        ));

        let res =
            simple_api_command(&mut socket, "PUT", "vm.add-disk", Some("{\"path\":\"/dev/ram1\"}"))
                .unwrap();
        assert_eq!(res.as_deref(), Some(body));

        let request = String::from_utf8(socket.request).unwrap();
        assert!(request.starts_with("PUT /api/v1/vm.add-disk HTTP/1.1\r\n"));
        assert!(request.contains("Content-Length: 20\r\n"));
        assert!(request.ends_with("\r\n\r\n{\"path\":\"/dev/ram1\"}"));
    }

    #[test]
    fn test_no_content() {
        let mut socket = MockSocket::new("HTTP/1.1 204 No Content\r\n\r\n");
        assert_eq!(
            simple_api_command(&mut socket, "PUT", "vm.shutdown", None).unwrap(),
            None
        );
    }

    #[test]
    fn test_server_error() {
        let mut socket =
            MockSocket::new("HTTP/1.1 500 Internal Server Error\r\nContent-Length: 4\r\n\r\nfail");
        match simple_api_command(&mut socket, "PUT", "vm.remove-device", Some("{}")) {
            Err(Error::ServerResponse(StatusCode::InternalServerError, Some(body))) => {
                assert_eq!(body, "fail")
            }
            r => panic!("unexpected result {r:?}"),
        }
    }

    #[test]
    fn test_truncated_response() {
        let mut socket = MockSocket::new("HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc");
        assert!(matches!(
            simple_api_command(&mut socket, "GET", "vmm.ping", None),
            Err(Error::UnexpectedEof)
        ));

        let mut socket = MockSocket::new("garbage\r\n\r\n");
        assert!(matches!(
            simple_api_command(&mut socket, "GET", "vmm.ping", None),
            Err(Error::MissingProtocol)
        ));
    }
}
