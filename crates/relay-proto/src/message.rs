use serde::{Deserialize, Serialize};

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// Terminal size as carried on the wire.
///
/// Values are kept signed so that a peer sending zero or a negative number
/// still produces a well-formed message; [`Geometry::resolve`] substitutes the
/// defaults for those.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Geometry {
    pub cols: i64,
    pub rows: i64,
}

impl Geometry {
    pub fn new(cols: impl Into<i64>, rows: impl Into<i64>) -> Self {
        Self {
            cols: cols.into(),
            rows: rows.into(),
        }
    }

    /// Concrete PTY dimensions: non-positive values fall back to 80x24 and
    /// oversize values are clamped to `u16`.
    pub fn resolve(self) -> (u16, u16) {
        (
            clamp_or_default(self.cols, DEFAULT_COLS),
            clamp_or_default(self.rows, DEFAULT_ROWS),
        )
    }
}

fn clamp_or_default(value: i64, default: u16) -> u16 {
    if value <= 0 {
        default
    } else {
        value.min(i64::from(u16::MAX)) as u16
    }
}

/// One protocol message. Each variant carries only the fields its tag uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Init {
        #[serde(default)]
        cols: i64,
        #[serde(default)]
        rows: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        repo: Option<String>,
    },
    Data {
        #[serde(default, with = "base64_payload")]
        data: Vec<u8>,
    },
    Resize {
        #[serde(default)]
        cols: i64,
        #[serde(default)]
        rows: i64,
    },
    Exit {
        #[serde(default)]
        code: i32,
    },
    Ping {
        #[serde(default)]
        timestamp: i64,
    },
    Pong {
        #[serde(default)]
        timestamp: i64,
    },
    Error {
        #[serde(default, alias = "error")]
        message: String,
    },
    Status {
        #[serde(default)]
        message: String,
    },
}

impl Message {
    /// Empty selectors are dropped so they are omitted on the wire.
    pub fn init(geometry: Geometry, repo: Option<String>) -> Self {
        Message::Init {
            cols: geometry.cols,
            rows: geometry.rows,
            repo: repo.filter(|value| !value.trim().is_empty()),
        }
    }

    pub fn data(bytes: impl Into<Vec<u8>>) -> Self {
        Message::Data { data: bytes.into() }
    }

    pub fn resize(geometry: Geometry) -> Self {
        Message::Resize {
            cols: geometry.cols,
            rows: geometry.rows,
        }
    }

    pub fn exit(code: i32) -> Self {
        Message::Exit { code }
    }

    pub fn ping(timestamp: i64) -> Self {
        Message::Ping { timestamp }
    }

    pub fn pong(timestamp: i64) -> Self {
        Message::Pong { timestamp }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Message::Error {
            message: message.into(),
        }
    }

    pub fn status(message: impl Into<String>) -> Self {
        Message::Status {
            message: message.into(),
        }
    }

    /// Tag name as it appears in the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Init { .. } => "init",
            Message::Data { .. } => "data",
            Message::Resize { .. } => "resize",
            Message::Exit { .. } => "exit",
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
            Message::Error { .. } => "error",
            Message::Status { .. } => "status",
        }
    }

    /// Geometry carried by `init` and `resize`.
    pub fn geometry(&self) -> Option<Geometry> {
        match self {
            Message::Init { cols, rows, .. } | Message::Resize { cols, rows } => {
                Some(Geometry::new(*cols, *rows))
            }
            _ => None,
        }
    }
}

mod base64_payload {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T, S>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: AsRef<[u8]>,
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
