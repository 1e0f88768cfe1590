//! The blocking request/response conversation behind the network engine.
//!
//! # Design
//! An exchange is split into the steps the engine checks cancellation
//! between: open a session, send the request, receive the response head,
//! then read the body chunk by chunk. Each step may block up to the
//! transport's own timeout; none of them is interrupted mid-call.
//!
//! `HttpTransport` implements the steps on top of `ureq`. ureq connects and
//! writes the request inside a single call that returns once the response
//! head has arrived, so `send` carries that call and `receive_head` only
//! unpacks its result.

use std::io::Read;

use ureq::http::{self, header::USER_AGENT, Request, Response};

use crate::config::NetConfig;
use crate::error::TransportError;
use crate::http::PreparedRequest;

/// Status line and headers of a response. Repeated header names are
/// grouped together at the first occurrence of the name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

/// Opens exchanges. Shared by every worker thread of an engine.
pub trait Transport: Send + Sync + 'static {
    fn open(&self, request: &PreparedRequest) -> Result<Box<dyn Exchange>, TransportError>;
}

/// One request/response conversation, driven step by step on one worker
/// thread.
pub trait Exchange {
    fn send(&mut self) -> Result<(), TransportError>;

    fn receive_head(&mut self) -> Result<ResponseHead, TransportError>;

    /// Read the next body bytes into `buf`. `Ok(0)` marks the end.
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;
}

/// HTTP/1.1 transport backed by a shared `ureq::Agent`.
#[derive(Clone)]
pub struct HttpTransport {
    agent: ureq::Agent,
    user_agent: String,
}

impl HttpTransport {
    pub fn new(config: &NetConfig) -> Self {
        let agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .allow_non_standard_methods(true)
            .timeout_connect(Some(config.connect_timeout()))
            .timeout_recv_response(Some(config.response_timeout()))
            .timeout_recv_body(Some(config.body_timeout()))
            .build()
            .new_agent();
        Self {
            agent,
            user_agent: config.user_agent.clone(),
        }
    }
}

impl Transport for HttpTransport {
    fn open(&self, request: &PreparedRequest) -> Result<Box<dyn Exchange>, TransportError> {
        let mut builder = Request::builder()
            .method(request.method.clone())
            .uri(request.uri.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.clone(), value.clone());
        }
        if !request.headers.iter().any(|(name, _)| *name == USER_AGENT) {
            builder = builder.header(USER_AGENT, self.user_agent.as_str());
        }
        let head = builder
            .body(())
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        Ok(Box::new(UreqExchange {
            agent: self.agent.clone(),
            state: ExchangeState::Ready {
                head,
                body: request.body.clone(),
            },
        }))
    }
}

enum ExchangeState {
    Ready { head: Request<()>, body: Vec<u8> },
    Sent(Response<ureq::Body>),
    Streaming(ureq::BodyReader<'static>),
    Done,
}

struct UreqExchange {
    agent: ureq::Agent,
    state: ExchangeState,
}

impl UreqExchange {
    fn out_of_order(step: &str) -> TransportError {
        TransportError::Protocol(format!("{step} called out of order"))
    }
}

impl Exchange for UreqExchange {
    fn send(&mut self) -> Result<(), TransportError> {
        let ExchangeState::Ready { head, body } = std::mem::replace(&mut self.state, ExchangeState::Done)
        else {
            return Err(Self::out_of_order("send"));
        };
        let (parts, ()) = head.into_parts();
        let response = if body.is_empty() {
            self.agent.run(Request::from_parts(parts, ()))
        } else {
            self.agent.run(Request::from_parts(parts, body))
        }
        .map_err(map_ureq_error)?;
        self.state = ExchangeState::Sent(response);
        Ok(())
    }

    fn receive_head(&mut self) -> Result<ResponseHead, TransportError> {
        let ExchangeState::Sent(response) = std::mem::replace(&mut self.state, ExchangeState::Done) else {
            return Err(Self::out_of_order("receive_head"));
        };
        let (parts, body) = response.into_parts();
        let head = ResponseHead {
            status: parts.status.as_u16(),
            headers: collect_headers(&parts.headers),
        };
        self.state = ExchangeState::Streaming(body.into_reader());
        Ok(head)
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match &mut self.state {
            ExchangeState::Streaming(reader) => {
                let read = reader.read(buf).map_err(map_io_error)?;
                if read == 0 {
                    self.state = ExchangeState::Done;
                }
                Ok(read)
            }
            ExchangeState::Done => Ok(0),
            _ => Err(Self::out_of_order("read_chunk")),
        }
    }
}

fn collect_headers(headers: &http::HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

fn map_ureq_error(err: ureq::Error) -> TransportError {
    match err {
        ureq::Error::Timeout(which) => TransportError::Timeout(which.to_string()),
        ureq::Error::Io(io) => map_io_error(io),
        ureq::Error::HostNotFound => TransportError::Connect("host not found".into()),
        ureq::Error::ConnectionFailed => TransportError::Connect("connection failed".into()),
        other => TransportError::Protocol(other.to_string()),
    }
}

fn map_io_error(err: std::io::Error) -> TransportError {
    match err.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            TransportError::Timeout(err.to_string())
        }
        _ => TransportError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpRequest;

    #[test]
    fn exchange_steps_must_run_in_order() {
        let transport = HttpTransport::new(&NetConfig::default());
        let request = HttpRequest::get("http://127.0.0.1:9/").prepare().unwrap();
        let mut exchange = transport.open(&request).unwrap();
        assert!(matches!(exchange.receive_head(), Err(TransportError::Protocol(_))));
        let mut buf = [0u8; 8];
        assert!(matches!(exchange.read_chunk(&mut buf), Ok(0)));
    }

    #[test]
    fn repeated_header_names_are_grouped() {
        let mut headers = http::HeaderMap::new();
        headers.append("x-a", http::HeaderValue::from_static("1"));
        headers.append("x-b", http::HeaderValue::from_static("2"));
        headers.append("x-a", http::HeaderValue::from_static("3"));

        let pairs = |list: &[(&str, &str)]| -> Vec<(String, String)> {
            list.iter().map(|(n, v)| (n.to_string(), v.to_string())).collect()
        };
        assert_eq!(
            collect_headers(&headers),
            pairs(&[("x-a", "1"), ("x-a", "3"), ("x-b", "2")])
        );
    }

    #[test]
    fn connection_refused_is_a_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = HttpTransport::new(&NetConfig::default());
        let request = HttpRequest::get(format!("http://{addr}/")).prepare().unwrap();
        let mut exchange = transport.open(&request).unwrap();
        assert!(exchange.send().is_err());
    }
}
