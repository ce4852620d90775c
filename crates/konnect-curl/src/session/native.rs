use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use curl::easy::{Easy2, Handler, List, ReadError, WriteError};
use curl::multi::{Easy2Handle, Events, Multi, SocketEvents};
use konnect_core::{Method, Request, RequestBody, ResponseHead, TransferId};
use tracing::{debug, warn};
use url::Url;

use super::{
    Completion, MultiSession, NativeFailure, NewTransfer, RawSocket, Readiness, SocketInterest,
    SocketInterestSink, TimeoutSink,
};
use crate::error::CurlBridgeError;
use crate::handle::BodySink;
use crate::types::BridgeConfig;

/// Code reported when a finished transfer could not be detached from the multi handle.
const CODE_DETACH_FAILED: i32 = -1;

pub(super) struct NativeSession {
    multi: Multi,
    handles: HashMap<TransferId, Easy2Handle<Collector>>,
    config: BridgeConfig,
}

// SAFETY: the multi handle and every easy handle attached to it are only touched from
// the bridge task that owns this session; libcurl requires a handle to be used from
// one thread at a time, not from the thread that created it.
unsafe impl Send for NativeSession {}

pub(super) fn create_session(config: &BridgeConfig) -> Result<Box<dyn MultiSession>> {
    let mut multi = Multi::new();
    if let Some(limit) = config.max_total_connections {
        multi
            .set_max_total_connections(limit)
            .map_err(|err| session_unavailable("set_max_total_connections", &err))?;
    }
    if let Some(limit) = config.max_host_connections {
        multi
            .set_max_host_connections(limit)
            .map_err(|err| session_unavailable("set_max_host_connections", &err))?;
    }
    multi
        .pipelining(false, config.multiplex)
        .map_err(|err| session_unavailable("pipelining", &err))?;

    debug!(
        version = curl::Version::get().version(),
        multiplex = config.multiplex,
        "libcurl multi session created"
    );
    Ok(Box::new(NativeSession {
        multi,
        handles: HashMap::new(),
        config: config.clone(),
    }))
}

fn session_unavailable(operation: &'static str, err: &dyn std::fmt::Display) -> anyhow::Error {
    anyhow::Error::new(CurlBridgeError::SessionUnavailable {
        operation,
        message: err.to_string(),
    })
}

fn native_error(operation: &'static str, err: &dyn std::fmt::Display) -> anyhow::Error {
    anyhow::Error::new(CurlBridgeError::native(operation, err))
}

impl NativeSession {
    fn configure(&self, easy: &mut Easy2<Collector>, url: &Url, request: &Request) -> Result<()> {
        easy.url(url.as_str())?;
        easy.signal(false)?;
        apply_method(easy, request)?;

        let mut headers = List::new();
        for (name, value) in &request.headers {
            headers.append(&format!("{name}: {value}"))?;
        }
        if matches!(request.body, RequestBody::Chunks(_))
            && !has_header(request, "transfer-encoding")
        {
            headers.append("Transfer-Encoding: chunked")?;
        }
        easy.http_headers(headers)?;

        if let Some(agent) = self
            .config
            .user_agent
            .as_deref()
            .filter(|_| !has_header(request, "user-agent"))
        {
            easy.useragent(agent)?;
        }

        let follow = request
            .follow_redirects
            .unwrap_or(self.config.follow_redirects);
        easy.follow_location(follow)?;
        if let (true, Some(limit)) = (follow, self.config.max_redirects) {
            easy.max_redirections(limit)?;
        }
        if let Some(timeout) = self.config.connect_timeout() {
            easy.connect_timeout(timeout)?;
        }
        if let Some(timeout) = request.timeout.or_else(|| self.config.transfer_timeout()) {
            easy.timeout(timeout)?;
        }
        Ok(())
    }

    fn detach(&mut self, id: TransferId, result: Result<(), curl::Error>) -> Completion {
        let Some(handle) = self.handles.remove(&id) else {
            return Completion {
                id,
                outcome: Err(NativeFailure {
                    code: CODE_DETACH_FAILED,
                    message: "finished transfer has no handle".to_string(),
                }),
            };
        };
        let mut easy = match self.multi.remove2(handle) {
            Ok(easy) => easy,
            Err(err) => {
                warn!(transfer_id = %id, error = %err, "failed to detach finished transfer");
                return Completion {
                    id,
                    outcome: Err(NativeFailure {
                        code: CODE_DETACH_FAILED,
                        message: err.to_string(),
                    }),
                };
            }
        };

        let outcome = match result {
            Ok(()) => {
                let status = easy
                    .response_code()
                    .ok()
                    .and_then(|code| u16::try_from(code).ok())
                    .unwrap_or_default();
                Ok(ResponseHead {
                    status,
                    headers: std::mem::take(&mut easy.get_mut().headers),
                })
            }
            Err(err) => Err(describe_failure(&err)),
        };
        Completion { id, outcome }
    }
}

impl MultiSession for NativeSession {
    fn bind(
        &mut self,
        sockets: Arc<dyn SocketInterestSink>,
        timer: Arc<dyn TimeoutSink>,
    ) -> Result<()> {
        self.multi
            .socket_function(move |socket, events, _token| {
                sockets.socket_interest_changed(socket, map_socket_events(&events));
            })
            .map_err(|err| session_unavailable("socket_function", &err))?;
        self.multi
            .timer_function(move |timeout| {
                timer.timeout_requested(timeout);
                true
            })
            .map_err(|err| session_unavailable("timer_function", &err))?;
        Ok(())
    }

    fn add_transfer(&mut self, transfer: NewTransfer) -> Result<()> {
        let NewTransfer {
            id,
            url,
            mut request,
            body,
        } = transfer;
        let token = usize::try_from(id.get()).context("transfer id does not fit a token")?;

        let mut easy = Easy2::new(Collector::new(body));
        self.configure(&mut easy, &url, &request)
            .with_context(|| format!("failed to configure {id}"))?;
        easy.get_mut().upload = Upload::from(std::mem::take(&mut request.body));

        let mut handle = self
            .multi
            .add2(easy)
            .map_err(|err| native_error("add_transfer", &err))?;
        if let Err(err) = handle.set_token(token) {
            let _ = self.multi.remove2(handle);
            return Err(native_error("set_token", &err));
        }
        self.handles.insert(id, handle);
        Ok(())
    }

    fn remove_transfer(&mut self, id: TransferId) -> Result<bool> {
        let Some(handle) = self.handles.remove(&id) else {
            return Ok(false);
        };
        self.multi
            .remove2(handle)
            .map_err(|err| native_error("remove_transfer", &err))?;
        Ok(true)
    }

    fn socket_action(&mut self, socket: RawSocket, readiness: Readiness) -> Result<usize> {
        let mut events = Events::new();
        events
            .input(readiness.readable)
            .output(readiness.writable)
            .error(readiness.error);
        let running = self
            .multi
            .action(socket, &events)
            .map_err(|err| native_error("socket_action", &err))?;
        Ok(usize::try_from(running).unwrap_or(usize::MAX))
    }

    fn timeout_action(&mut self) -> Result<usize> {
        let running = self
            .multi
            .timeout()
            .map_err(|err| native_error("timeout_action", &err))?;
        Ok(usize::try_from(running).unwrap_or(usize::MAX))
    }

    fn drain_completions(&mut self) -> Vec<Completion> {
        let mut finished = Vec::new();
        self.multi.messages(|message| {
            if let (Ok(token), Some(result)) = (message.token(), message.result()) {
                finished.push((token, result));
            }
        });
        finished
            .into_iter()
            .filter_map(|(token, result)| {
                let raw = u64::try_from(token).ok()?;
                Some(self.detach(TransferId(raw), result))
            })
            .collect()
    }
}

fn map_socket_events(events: &SocketEvents) -> SocketInterest {
    if events.remove() {
        return SocketInterest::NONE;
    }
    let both = events.input_and_output();
    match (events.input() || both, events.output() || both) {
        (true, true) => SocketInterest::BOTH,
        (true, false) => SocketInterest::READ,
        (false, true) => SocketInterest::WRITE,
        (false, false) => SocketInterest::NONE,
    }
}

fn apply_method(easy: &mut Easy2<Collector>, request: &Request) -> Result<()> {
    match &request.method {
        Method::Head => easy.nobody(true)?,
        Method::Get if request.body.is_empty() => easy.get(true)?,
        method => {
            if !request.body.is_empty() || matches!(method, Method::Post) {
                easy.post(true)?;
                if let Some(len) = request.body.known_len() {
                    easy.post_field_size(len)?;
                }
            }
            if !matches!(method, Method::Post) {
                easy.custom_request(method.as_str())?;
            }
        }
    }
    Ok(())
}

fn has_header(request: &Request, name: &str) -> bool {
    request
        .headers
        .iter()
        .any(|(header, _)| header.eq_ignore_ascii_case(name))
}

fn describe_failure(err: &curl::Error) -> NativeFailure {
    let message = err.extra_description().map_or_else(
        || err.description().to_string(),
        |extra| format!("{}: {extra}", err.description()),
    );
    NativeFailure {
        code: i32::try_from(err.code()).unwrap_or(i32::MAX),
        message,
    }
}

/// Request body as pulled by libcurl's read callback.
#[derive(Default)]
struct Upload {
    pending: Bytes,
    rest: Option<Box<dyn Iterator<Item = Bytes> + Send>>,
}

impl From<RequestBody> for Upload {
    fn from(body: RequestBody) -> Self {
        match body {
            RequestBody::Empty => Self::default(),
            RequestBody::Bytes(pending) => Self {
                pending,
                rest: None,
            },
            RequestBody::Chunks(rest) => Self {
                pending: Bytes::new(),
                rest: Some(rest),
            },
        }
    }
}

impl Upload {
    fn fill(&mut self, into: &mut [u8]) -> usize {
        while self.pending.is_empty() {
            match self.rest.as_mut().and_then(Iterator::next) {
                Some(chunk) => self.pending = chunk,
                None => {
                    self.rest = None;
                    return 0;
                }
            }
        }
        let len = self.pending.len().min(into.len());
        into[..len].copy_from_slice(&self.pending.split_to(len));
        len
    }
}

/// Per-transfer libcurl handler: streams the body out and collects response headers.
struct Collector {
    sink: BodySink,
    headers: Vec<(String, String)>,
    upload: Upload,
}

impl Collector {
    fn new(sink: BodySink) -> Self {
        Self {
            sink,
            headers: Vec::new(),
            upload: Upload::default(),
        }
    }

    fn record_header(&mut self, line: &str) {
        let line = line.trim_end_matches(['\r', '\n']);
        // Each status line (redirect hop, 100 Continue) starts a fresh header block.
        if line.starts_with("HTTP/") {
            self.headers.clear();
            return;
        }
        if let Some((name, value)) = line.split_once(':') {
            self.headers
                .push((name.trim().to_string(), value.trim().to_string()));
        }
    }
}

impl Handler for Collector {
    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        self.sink.deliver(data);
        Ok(data.len())
    }

    fn read(&mut self, into: &mut [u8]) -> Result<usize, ReadError> {
        Ok(self.upload.fill(into))
    }

    fn header(&mut self, data: &[u8]) -> bool {
        self.record_header(&String::from_utf8_lossy(data));
        true
    }
}
