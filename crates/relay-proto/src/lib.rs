//! Wire protocol shared by the SSH relay, the edge proxy, and the PTY bridge.
//!
//! Every hop exchanges the same JSON envelope: a `type` tag plus the fields
//! relevant to that tag. Terminal bytes travel base64-encoded inside `data`
//! messages so the envelope stays text-safe on line- and frame-oriented
//! transports. Keeping this in a dedicated crate lets every process decode
//! exactly the same shapes.

mod codec;
mod message;

pub use codec::{decode, decode_lines, encode, encode_line, LineDecoder, ProtocolError};
pub use message::{Geometry, Message, DEFAULT_COLS, DEFAULT_ROWS};

/// Transport-level headers carrying session metadata on the downstream dial.
pub mod headers {
    pub const SESSION_ID: &str = "x-session-id";
    pub const COLS: &str = "x-cols";
    pub const ROWS: &str = "x-rows";
    pub const REPO: &str = "x-repo";
    pub const AUTH_SECRET: &str = "x-auth-secret";
}
