//! Incremental decoder for the length prefixed chunk stream of the backward channel.
//!
//! Each chunk is `<decimal length>\n<length bytes of payload>`. The parser keeps a
//! cursor into a buffer that only ever grows, so feeding it the same buffer again
//! after more bytes arrived resumes where the last complete chunk ended.

/// Outcome of reading the next chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkStatus {
    Ready(String),
    Incomplete,
    Invalid,
}

#[derive(Debug, Default, Clone)]
pub struct ChunkParser {
    cursor: usize,
}

impl ChunkParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset of the first byte not yet consumed
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Whether `buf` holds bytes past the last complete chunk
    pub fn has_unread(&self, buf: &[u8]) -> bool {
        self.cursor < buf.len()
    }

    pub fn next_chunk(&mut self, buf: &[u8]) -> ChunkStatus {
        let rest = match buf.get(self.cursor..) {
            Some(rest) => rest,
            None => return ChunkStatus::Incomplete,
        };

        let newline = match rest.iter().position(|b| *b == b'\n') {
            Some(pos) => pos,
            None => return ChunkStatus::Incomplete,
        };

        let length = std::str::from_utf8(&rest[..newline])
            .ok()
            .and_then(|text| text.trim().parse::<usize>().ok());
        let length = match length {
            Some(length) => length,
            None => return ChunkStatus::Invalid,
        };

        let start = newline + 1;
        let end = match start.checked_add(length) {
            Some(end) => end,
            None => return ChunkStatus::Invalid,
        };
        if end > rest.len() {
            return ChunkStatus::Incomplete;
        }

        match std::str::from_utf8(&rest[start..end]) {
            Ok(payload) => {
                self.cursor += end;
                ChunkStatus::Ready(payload.to_owned())
            }
            Err(_) => ChunkStatus::Invalid,
        }
    }
}

/// Splits a complete body into its chunks.
///
/// Returns `None` unless the whole body is a well formed chunk sequence.
pub fn split_chunks(body: &str) -> Option<Vec<String>> {
    let mut parser = ChunkParser::new();
    let mut chunks = Vec::new();
    while parser.has_unread(body.as_bytes()) {
        match parser.next_chunk(body.as_bytes()) {
            ChunkStatus::Ready(chunk) => chunks.push(chunk),
            _ => return None,
        }
    }
    if chunks.is_empty() {
        None
    } else {
        Some(chunks)
    }
}
