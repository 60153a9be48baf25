//! Minimal HTTP/1.1 request parsing and response writing for the API server.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::SocketAddr;

const MAX_HEADER_BYTES: usize = 64 * 1024;

#[derive(Debug)]
pub(crate) struct HttpRequest {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    /// Header names are lowercased.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub peer: SocketAddr,
}

#[derive(Debug)]
pub(crate) enum RequestError {
    Malformed(anyhow::Error),
    TooLarge(usize),
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    fn content_type(&self) -> &str {
        self.header("content-type").unwrap_or("")
    }

    /// Fields and files of a `multipart/form-data` or urlencoded form body.
    pub fn form(&self) -> Result<Vec<FormPart>> {
        let content_type = self.content_type();
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "multipart/form-data" => {
                let boundary = header_param(content_type, "boundary")
                    .ok_or_else(|| anyhow!("multipart body without boundary"))?;
                parse_multipart(&self.body, &boundary)
            }
            "application/x-www-form-urlencoded" | "" => Ok(url::form_urlencoded::parse(&self.body)
                .map(|(name, value)| FormPart {
                    name: name.into_owned(),
                    filename: None,
                    data: value.into_owned().into_bytes(),
                })
                .collect()),
            other => Err(anyhow!("unsupported form content type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FormPart {
    pub name: String,
    pub filename: Option<String>,
    pub data: Vec<u8>,
}

impl FormPart {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

pub(crate) fn read_request<S: Read>(
    stream: &mut S,
    peer: SocketAddr,
    max_body: usize,
) -> std::result::Result<HttpRequest, RequestError> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = find(&data, b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(RequestError::TooLarge(data.len()));
        }
        let n = stream
            .read(&mut buf)
            .context("read request head")
            .map_err(RequestError::Malformed)?;
        if n == 0 {
            return Err(RequestError::Malformed(anyhow!("connection closed mid-request")));
        }
        data.extend_from_slice(&buf[..n]);
    };

    let head = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| RequestError::Malformed(anyhow!("empty request")))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| RequestError::Malformed(anyhow!("missing method")))?;
    let target = parts
        .next()
        .ok_or_else(|| RequestError::Malformed(anyhow!("missing path")))?;

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| RequestError::Malformed(anyhow!("invalid content-length")))?,
        None => 0,
    };
    if content_length > max_body {
        return Err(RequestError::TooLarge(content_length));
    }

    let mut body = data.split_off(header_end + 4);
    body.truncate(content_length);
    if body.len() < content_length {
        let missing = content_length - body.len();
        let start = body.len();
        body.resize(content_length, 0);
        stream
            .read_exact(&mut body[start..start + missing])
            .context("read request body")
            .map_err(RequestError::Malformed)?;
    }

    let (path, raw_query) = target.split_once('?').unwrap_or((target, ""));
    let query = url::form_urlencoded::parse(raw_query.as_bytes())
        .into_owned()
        .collect();

    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        query,
        headers,
        body,
        peer,
    })
}

pub(crate) struct Response {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl Response {
    pub fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self {
                status,
                content_type: "application/json",
                body,
            },
            Err(err) => {
                log::error!("failed to serialize response: {}", err);
                Self::error(500, "internal error")
            }
        }
    }

    pub fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: serde_json::json!({ "error": message }).to_string().into_bytes(),
        }
    }

    pub fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.as_bytes().to_vec(),
        }
    }

    pub fn html(body: String) -> Self {
        Self {
            status: 200,
            content_type: "text/html; charset=utf-8",
            body: body.into_bytes(),
        }
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        let header = format!(
            "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
            status_line = status_line(self.status),
            content_type = self.content_type,
            len = self.body.len()
        );
        out.write_all(header.as_bytes())?;
        out.write_all(&self.body)?;
        out.flush()?;
        Ok(())
    }
}

pub(crate) fn status_line(status: u16) -> &'static str {
    match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        413 => "HTTP/1.1 413 Payload Too Large",
        _ => "HTTP/1.1 500 Internal Server Error",
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// `name=value` parameter of a header such as Content-Type or Content-Disposition.
fn header_param(header: &str, name: &str) -> Option<String> {
    header.split(';').skip(1).find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        if key.trim().eq_ignore_ascii_case(name) {
            Some(value.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}

fn parse_multipart(body: &[u8], boundary: &str) -> Result<Vec<FormPart>> {
    let delimiter = format!("--{}", boundary).into_bytes();
    let mut parts = Vec::new();
    let mut rest = match find(body, &delimiter) {
        Some(pos) => &body[pos + delimiter.len()..],
        None => return Err(anyhow!("multipart body has no parts")),
    };

    loop {
        if rest.starts_with(b"--") {
            break;
        }
        let rest_after_crlf = rest.strip_prefix(b"\r\n").unwrap_or(rest);
        let next = find(rest_after_crlf, &delimiter)
            .ok_or_else(|| anyhow!("unterminated multipart part"))?;
        let raw = &rest_after_crlf[..next];
        let raw = raw.strip_suffix(b"\r\n").unwrap_or(raw);
        parts.push(parse_part(raw)?);
        rest = &rest_after_crlf[next + delimiter.len()..];
    }
    Ok(parts)
}

fn parse_part(raw: &[u8]) -> Result<FormPart> {
    let split = find(raw, b"\r\n\r\n").ok_or_else(|| anyhow!("multipart part without headers"))?;
    let head = String::from_utf8_lossy(&raw[..split]);
    let disposition = head
        .split("\r\n")
        .find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case("content-disposition")
                .then(|| value.trim().to_string())
        })
        .ok_or_else(|| anyhow!("multipart part without content-disposition"))?;
    let name = header_param(&disposition, "name")
        .ok_or_else(|| anyhow!("multipart part without a name"))?;
    Ok(FormPart {
        name,
        filename: header_param(&disposition, "filename"),
        data: raw[split + 4..].to_vec(),
    })
}
