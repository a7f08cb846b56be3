use thiserror::Error;

use crate::message::Message;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty frame")]
    Empty,
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub fn encode(message: &Message) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(message)?)
}

/// Encodes a message followed by `\n`, for newline-delimited bodies.
pub fn encode_line(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}

pub fn decode(frame: &[u8]) -> Result<Message, ProtocolError> {
    let trimmed = frame.trim_ascii();
    if trimmed.is_empty() {
        return Err(ProtocolError::Empty);
    }
    Ok(serde_json::from_slice(trimmed)?)
}

/// Decodes every non-blank line of a newline-delimited body. Malformed lines
/// yield an error item without stopping the iteration.
pub fn decode_lines(body: &[u8]) -> impl Iterator<Item = Result<Message, ProtocolError>> + '_ {
    body.split(|byte| *byte == b'\n')
        .filter(|line| !line.trim_ascii().is_empty())
        .map(decode)
}

/// Reassembles newline-delimited messages from arbitrarily split chunks.
#[derive(Debug, Default)]
pub struct LineDecoder {
    pending: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Message, ProtocolError>> {
        self.pending.extend_from_slice(chunk);
        let mut decoded = Vec::new();
        while let Some(pos) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            if line.trim_ascii().is_empty() {
                continue;
            }
            decoded.push(decode(&line));
        }
        decoded
    }

    /// Bytes received after the last complete line.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
