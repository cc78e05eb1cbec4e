//! HTTP/1.1 for the tracker, served by hyper.
//!
//! hyper owns the connection: framing, keep-alive and idle timeouts. Each
//! request is turned into a [`Request`] for the actor and the actor's
//! [`Response`] back into a hyper response. Request bodies are read and
//! thrown away, a tracker only looks at the target and the headers.
use std::{convert::Infallible, net::SocketAddr, time::Duration};

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::{
    body::Incoming,
    header::{self, HeaderValue},
    server::conn::http1,
    service::service_fn,
    StatusCode,
};
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
};
use tracing::debug;

use super::ServerMsg;

/// Longest request body accepted.
pub const MAX_BODY_LEN: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    /// Path and query, as sent.
    pub target: String,
    /// Names lowercased.
    pub headers: Vec<(String, String)>,
}

impl Request {
    pub fn new(method: &str, target: &str) -> Self {
        Self { method: method.to_string(), target: target.to_string(), headers: Vec::new() }
    }

    fn from_hyper<B>(req: &hyper::Request<B>) -> Self {
        let target = req
            .uri()
            .path_and_query()
            .map_or_else(|| req.uri().path().to_string(), |pq| pq.as_str().to_string());
        // header names from hyper are already lowercase
        let headers = req
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
            .collect();
        Self { method: req.method().as_str().to_string(), target, headers }
    }

    pub fn path(&self) -> &str {
        self.target.split_once('?').map_or(&self.target, |(p, _)| p)
    }

    pub fn query(&self) -> &str {
        self.target.split_once('?').map_or("", |(_, q)| q)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Bytes,
    /// False closes the connection after this response.
    pub keep_alive: bool,
}

impl Response {
    /// A bencoded tracker answer.
    pub fn bencoded(body: impl Into<Bytes>) -> Self {
        Self { status: 200, content_type: "text/plain", body: body.into(), keep_alive: true }
    }

    pub fn not_found() -> Self {
        Self {
            status: 404,
            content_type: "text/plain",
            body: Bytes::from_static(b"not found"),
            keep_alive: true,
        }
    }

    pub fn bad_request(msg: &str) -> Self {
        Self {
            status: 400,
            content_type: "text/plain",
            body: Bytes::copy_from_slice(msg.as_bytes()),
            keep_alive: false,
        }
    }

    /// The tracker is shutting down.
    pub fn unavailable() -> Self {
        Self {
            status: 503,
            content_type: "text/plain",
            body: Bytes::from_static(b"shutting down"),
            keep_alive: false,
        }
    }

    fn into_hyper(self) -> hyper::Response<Full<Bytes>> {
        let mut res = hyper::Response::new(Full::new(self.body));
        *res.status_mut() = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let headers = res.headers_mut();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(self.content_type));
        if !self.keep_alive {
            headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        }
        res
    }
}

/// Serve one connection until the client hangs up or stays silent for
/// `idle`. Requests go to the tracker actor one at a time.
pub async fn serve_connection(
    socket: TcpStream,
    remote: SocketAddr,
    tx: mpsc::Sender<ServerMsg>,
    idle: Duration,
) {
    let service = service_fn(move |req| answer(req, remote, tx.clone()));
    let conn = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(idle)
        .serve_connection(TokioIo::new(socket), service);
    if let Err(e) = conn.await {
        debug!("{remote} connection ended: {e}");
    }
}

async fn answer(
    req: hyper::Request<Incoming>,
    remote: SocketAddr,
    tx: mpsc::Sender<ServerMsg>,
) -> Result<hyper::Response<Full<Bytes>>, Infallible> {
    let request = Request::from_hyper(&req);
    if Limited::new(req.into_body(), MAX_BODY_LEN).collect().await.is_err() {
        debug!("{remote} sent an unreadable or oversized body");
        return Ok(Response::bad_request("bad request body").into_hyper());
    }

    let (reply, rx) = oneshot::channel();
    let res = match tx.send(ServerMsg::Request { req: request, remote, reply }).await {
        Ok(()) => rx.await.unwrap_or_else(|_| Response::unavailable()),
        Err(_) => Response::unavailable(),
    };
    Ok(res.into_hyper())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_from_hyper() {
        let req = hyper::Request::builder()
            .uri("/announce?info_hash=%01")
            .header("Host", "t")
            .header("X-Forwarded-For", "1.2.3.4")
            .body(())
            .unwrap();
        let req = Request::from_hyper(&req);
        assert_eq!(req.method, "GET");
        assert_eq!(req.path(), "/announce");
        assert_eq!(req.query(), "info_hash=%01");
        assert_eq!(req.header("x-forwarded-for"), Some("1.2.3.4"));
    }

    #[test]
    fn closing_responses_say_so() {
        let res = Response::bad_request("no").into_hyper();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(res.headers()[header::CONNECTION], "close");

        let res = Response::not_found().into_hyper();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert!(res.headers().get(header::CONNECTION).is_none());
        assert_eq!(res.headers()[header::CONTENT_TYPE], "text/plain");
    }
}
