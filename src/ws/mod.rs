//! WebSocket server core (RFC 6455).
//!
//! Layered on [`SocketAdapter`](crate::net::SocketAdapter) and
//! [`HeaderParser`](crate::http::HeaderParser): the session starts in HTTP
//! mode, validates the upgrade, answers 101, then switches to frame mode
//! and surfaces complete (reassembled) messages to the application.

pub mod frame;
pub mod handshake;
pub mod server;

pub use frame::{apply_mask, CloseCode, Frame, FrameCodec, Opcode, WsError};
pub use handshake::{compute_accept_key, AcceptResponse, HandshakeError, ServerHandshake};
pub use server::{Message, WebSocketServer};
