//! WebSocket session state machine.
//!
//! ```text
//! ExpectingHandshake -- valid GET --> Open
//! ExpectingHandshake -- invalid ----> (HTTP 400) Closing -> Closed
//! Open               -- recv Close -> Closing
//! Open               -- clean_close-> Closing
//! Closing            -- Close sent & peer Closed / timeout -> Closed
//! any                -- fatal error --> Closed
//! ```
//!
//! Inbound bytes flow handshake-first: the header parser accumulates until
//! the block completes, the upgrade is validated, and any bytes after the
//! header block fall through to the frame decoder. Data frames reassemble
//! across CONTINUATION fragments; control frames are handled between
//! fragments. Text messages are UTF-8-validated once complete (1007 on
//! failure). Outbound messages are single unmasked frames.

use std::cell::RefCell;
use std::mem;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use super::frame::{Frame, FrameCodec, Opcode, WsError};
use super::handshake::{AcceptResponse, ServerHandshake};
use crate::codec::{Decoder, Encoder};
use crate::config::WsConfig;
use crate::http::{HeaderParser, Progress};
use crate::net::{CloseReason, RecvFlow, SocketAdapter};
use crate::reactor::Reactor;
use crate::time::TimerHandle;

/// A complete, reassembled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A text message (already UTF-8 validated).
    Text(String),
    /// A binary message.
    Binary(Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    ExpectingHandshake,
    Open,
    Closing,
    Closed,
}

struct Inner {
    reactor: Reactor,
    adapter: SocketAdapter,
    config: WsConfig,
    policy: ServerHandshake,
    state: SessionState,
    parser: HeaderParser,
    codec: FrameCodec,
    inbuf: BytesMut,
    /// Opcode of the fragmented message in progress.
    frag_opcode: Option<Opcode>,
    fragments: BytesMut,
    peer_close_code: Option<u16>,
    close_timer: Option<TimerHandle>,
    on_open: Option<Box<dyn FnMut()>>,
    on_message: Option<Box<dyn FnMut(Message)>>,
    on_close: Option<Box<dyn FnOnce(Option<u16>)>>,
}

/// One server-side WebSocket session over an attached adapter.
///
/// Clones are handles to the same session.
#[derive(Clone)]
pub struct WebSocketServer {
    inner: Rc<RefCell<Inner>>,
}

impl WebSocketServer {
    /// Creates a session with default limits and no subprotocols.
    #[must_use]
    pub fn new(reactor: &Reactor, adapter: SocketAdapter) -> Self {
        Self::with_config(reactor, adapter, WsConfig::default(), ServerHandshake::new())
    }

    /// Creates a session with explicit limits and handshake policy.
    #[must_use]
    pub fn with_config(
        reactor: &Reactor,
        adapter: SocketAdapter,
        config: WsConfig,
        policy: ServerHandshake,
    ) -> Self {
        let parser = HeaderParser::with_limit(config.max_header_block);
        let codec = FrameCodec::new(config.max_payload);
        Self {
            inner: Rc::new(RefCell::new(Inner {
                reactor: reactor.clone(),
                adapter,
                config,
                policy,
                state: SessionState::ExpectingHandshake,
                parser,
                codec,
                inbuf: BytesMut::new(),
                frag_opcode: None,
                fragments: BytesMut::new(),
                peer_close_code: None,
                close_timer: None,
                on_open: None,
                on_message: None,
                on_close: None,
            })),
        }
    }

    /// Installs the callback fired when the handshake completes.
    pub fn set_on_open(&self, callback: impl FnMut() + 'static) {
        self.inner.borrow_mut().on_open = Some(Box::new(callback));
    }

    /// Installs the callback fired for each complete message.
    pub fn set_on_message(&self, callback: impl FnMut(Message) + 'static) {
        self.inner.borrow_mut().on_message = Some(Box::new(callback));
    }

    /// Installs the callback fired once when the session ends; receives the
    /// peer's close code if one arrived.
    pub fn set_on_close(&self, callback: impl FnOnce(Option<u16>) + 'static) {
        self.inner.borrow_mut().on_close = Some(Box::new(callback));
    }

    /// Wires the session into its adapter and begins serving.
    pub fn start(&self) -> std::io::Result<()> {
        self.inner
            .borrow()
            .config
            .validate()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let adapter = self.inner.borrow().adapter.clone();
        let this = self.clone();
        adapter.set_on_close(move |reason| this.on_adapter_closed(&reason));
        let this = self.clone();
        adapter.set_on_receive(move |bytes| this.on_bytes(bytes))
    }

    /// Sends a text message as a single unmasked frame. Open sessions
    /// only.
    pub fn send_text(&self, text: &str) -> bool {
        self.send_data_frame(Frame::text(Bytes::copy_from_slice(text.as_bytes())))
    }

    /// Sends a binary message as a single unmasked frame. Open sessions
    /// only.
    pub fn send_binary(&self, data: &[u8]) -> bool {
        self.send_data_frame(Frame::binary(Bytes::copy_from_slice(data)))
    }

    /// Starts a clean close: sends a Close frame and waits (bounded by the
    /// configured timeout) for the peer's Close before closing the socket.
    pub fn clean_close(&self, code: Option<u16>, reason: Option<&str>) {
        {
            let inner = self.inner.borrow();
            if inner.state != SessionState::Open {
                return;
            }
        }
        debug!(?code, "clean close initiated");
        self.send_frame(Frame::close(code, reason));
        let timer = {
            let inner = self.inner.borrow();
            let adapter = inner.adapter.clone();
            inner.reactor.schedule_rel(
                inner.config.close_timeout,
                std::time::Duration::ZERO,
                true,
                move |_| {
                    debug!("close handshake timed out");
                    adapter.close();
                },
            )
        };
        let mut inner = self.inner.borrow_mut();
        inner.state = SessionState::Closing;
        inner.close_timer = Some(timer);
    }

    /// True once the handshake has completed and the session is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.borrow().state == SessionState::Open
    }

    /// True once the session has fully closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.borrow().state == SessionState::Closed
    }

    /// Adapter receive callback: route by session state.
    fn on_bytes(&self, data: &[u8]) -> RecvFlow {
        let state = self.inner.borrow().state;
        match state {
            SessionState::ExpectingHandshake => self.on_handshake_bytes(data),
            SessionState::Open | SessionState::Closing => self.on_frame_bytes(data),
            SessionState::Closed => RecvFlow::Stop,
        }
    }

    fn on_handshake_bytes(&self, data: &[u8]) -> RecvFlow {
        let progress = self.inner.borrow_mut().parser.feed(data);
        let body_offset = match progress {
            Err(err) => {
                warn!(error = %err, "malformed handshake");
                self.refuse_handshake();
                return RecvFlow::Stop;
            }
            Ok(Progress::Partial) => return RecvFlow::Continue,
            Ok(Progress::Complete { body_offset }) => body_offset,
        };

        let accepted = {
            let inner = self.inner.borrow();
            inner.policy.accept(&inner.parser)
        };
        match accepted {
            Err(err) => {
                debug!(error = %err, "handshake refused");
                self.refuse_handshake();
                RecvFlow::Stop
            }
            Ok(response) => {
                self.complete_handshake(&response);
                let rest = &data[body_offset..];
                if rest.is_empty() {
                    RecvFlow::Continue
                } else {
                    // Frame bytes rode in on the handshake chunk.
                    self.on_frame_bytes(rest)
                }
            }
        }
    }

    fn complete_handshake(&self, response: &AcceptResponse) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.adapter.write_bytes(&response.response_bytes());
            inner.state = SessionState::Open;
        }
        debug!(protocol = ?response.protocol, "handshake complete");
        let callback = self.inner.borrow_mut().on_open.take();
        if let Some(mut callback) = callback {
            callback();
            let mut inner = self.inner.borrow_mut();
            if inner.state != SessionState::Closed && inner.on_open.is_none() {
                inner.on_open = Some(callback);
            }
        }
    }

    fn refuse_handshake(&self) {
        let adapter = {
            let mut inner = self.inner.borrow_mut();
            inner.state = SessionState::Closing;
            inner.adapter.clone()
        };
        adapter.write_bytes(&ServerHandshake::reject(400, "Bad Request"));
        adapter.shutdown();
    }

    fn on_frame_bytes(&self, data: &[u8]) -> RecvFlow {
        self.inner.borrow_mut().inbuf.extend_from_slice(data);
        loop {
            let decoded = {
                let mut guard = self.inner.borrow_mut();
                let inner = &mut *guard;
                inner.codec.decode(&mut inner.inbuf)
            };
            match decoded {
                Ok(None) => break,
                Ok(Some(frame)) => {
                    if !self.handle_frame(frame) {
                        return RecvFlow::Stop;
                    }
                }
                Err(err) => {
                    self.protocol_error(&err);
                    return RecvFlow::Stop;
                }
            }
        }
        if self.inner.borrow().state == SessionState::Closed {
            RecvFlow::Stop
        } else {
            RecvFlow::Continue
        }
    }

    /// Returns false once the session is tearing down.
    fn handle_frame(&self, frame: Frame) -> bool {
        match frame.opcode {
            Opcode::Ping => {
                // Echo the payload; the decoder already bounded it to 125.
                if self.inner.borrow().state == SessionState::Open {
                    self.send_frame(Frame::pong(frame.payload));
                }
                true
            }
            Opcode::Pong => true,
            Opcode::Close => {
                self.on_peer_close(&frame);
                false
            }
            Opcode::Text | Opcode::Binary | Opcode::Continuation => self.on_data_frame(frame),
        }
    }

    fn on_peer_close(&self, frame: &Frame) {
        let code = match frame.close_code() {
            Ok(code) => code,
            Err(err) => {
                self.protocol_error(&err);
                return;
            }
        };
        debug!(?code, "peer close received");
        let (state, adapter) = {
            let mut inner = self.inner.borrow_mut();
            inner.peer_close_code = code;
            (inner.state, inner.adapter.clone())
        };
        match state {
            SessionState::Open => {
                // Echo the code, then close once the reply has drained.
                self.send_frame(Frame::close(code, None));
                self.inner.borrow_mut().state = SessionState::Closing;
                adapter.shutdown();
            }
            SessionState::Closing => {
                // We initiated; the peer answered.
                if let Some(timer) = self.inner.borrow_mut().close_timer.take() {
                    timer.cancel();
                }
                adapter.shutdown();
            }
            _ => {}
        }
    }

    fn on_data_frame(&self, frame: Frame) -> bool {
        let mut inner = self.inner.borrow_mut();
        match frame.opcode {
            Opcode::Continuation => {
                if inner.frag_opcode.is_none() {
                    drop(inner);
                    self.protocol_error(&WsError::UnexpectedContinuation);
                    return false;
                }
                let total = inner.fragments.len() as u64 + frame.payload.len() as u64;
                if total > inner.config.max_payload as u64 {
                    let max = inner.config.max_payload;
                    drop(inner);
                    self.protocol_error(&WsError::PayloadTooLarge { size: total, max });
                    return false;
                }
                inner.fragments.extend_from_slice(&frame.payload);
                if frame.fin {
                    let opcode = inner.frag_opcode.take().expect("checked above");
                    let payload = mem::take(&mut inner.fragments).freeze();
                    drop(inner);
                    self.deliver(opcode, payload)
                } else {
                    true
                }
            }
            Opcode::Text | Opcode::Binary => {
                if inner.frag_opcode.is_some() {
                    drop(inner);
                    self.protocol_error(&WsError::MessageInProgress);
                    return false;
                }
                if frame.fin {
                    drop(inner);
                    self.deliver(frame.opcode, frame.payload)
                } else {
                    inner.frag_opcode = Some(frame.opcode);
                    inner.fragments.extend_from_slice(&frame.payload);
                    true
                }
            }
            _ => unreachable!("control frames handled by caller"),
        }
    }

    fn deliver(&self, opcode: Opcode, payload: Bytes) -> bool {
        let message = match opcode {
            Opcode::Text => match String::from_utf8(payload.to_vec()) {
                Ok(text) => Message::Text(text),
                Err(_) => {
                    self.protocol_error(&WsError::InvalidUtf8);
                    return false;
                }
            },
            _ => Message::Binary(payload),
        };
        let callback = self.inner.borrow_mut().on_message.take();
        if let Some(mut callback) = callback {
            callback(message);
            let mut inner = self.inner.borrow_mut();
            if inner.state != SessionState::Closed && inner.on_message.is_none() {
                inner.on_message = Some(callback);
            }
        }
        self.inner.borrow().state != SessionState::Closed
    }

    /// Tears the session down over a protocol violation: send Close with
    /// the mapped code, then drain and close.
    fn protocol_error(&self, err: &WsError) {
        warn!(error = %err, "protocol error");
        let (state, adapter) = {
            let inner = self.inner.borrow();
            (inner.state, inner.adapter.clone())
        };
        match state {
            SessionState::Open => {
                self.send_frame(Frame::close(Some(u16::from(err.close_code())), None));
                self.inner.borrow_mut().state = SessionState::Closing;
                adapter.shutdown();
            }
            SessionState::Closing => adapter.shutdown(),
            _ => {}
        }
    }

    fn send_data_frame(&self, frame: Frame) -> bool {
        if self.inner.borrow().state != SessionState::Open {
            return false;
        }
        self.send_frame(frame)
    }

    fn send_frame(&self, frame: Frame) -> bool {
        let (bytes, adapter) = {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            let mut buf = BytesMut::new();
            if inner.codec.encode(frame, &mut buf).is_err() {
                return false;
            }
            (buf, inner.adapter.clone())
        };
        adapter.write_bytes(&bytes)
    }

    fn on_adapter_closed(&self, reason: &CloseReason) {
        let (callback, code) = {
            let mut inner = self.inner.borrow_mut();
            if inner.state == SessionState::Closed {
                return;
            }
            debug!(?reason, "session closed");
            inner.state = SessionState::Closed;
            if let Some(timer) = inner.close_timer.take() {
                timer.cancel();
            }
            (inner.on_close.take(), inner.peer_close_code)
        };
        if let Some(callback) = callback {
            callback(code);
        }
    }
}

impl std::fmt::Debug for WebSocketServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("WebSocketServer")
            .field("state", &inner.state)
            .field("buffered", &inner.inbuf.len())
            .field("reassembling", &inner.frag_opcode)
            .finish_non_exhaustive()
    }
}
