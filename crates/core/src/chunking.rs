use crate::error::IngestError;
use crate::models::{ChunkMetadata, ChunkSource};
use std::collections::VecDeque;
use tracing::{debug, warn};

pub const DEFAULT_CHUNK_SIZE: usize = 400;
pub const DEFAULT_CHUNK_OVERLAP: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

impl ChunkingConfig {
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self, IngestError> {
        let config = Self {
            chunk_size,
            overlap,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        if self.chunk_size == 0 || self.overlap == 0 {
            return Err(IngestError::InvalidChunkConfig(format!(
                "chunk_size ({}) and overlap ({}) must both be at least 1",
                self.chunk_size, self.overlap
            )));
        }
        if self.overlap >= self.chunk_size {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap ({}) must be smaller than chunk_size ({})",
                self.overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

pub fn clean_text(text: &str) -> String {
    let without_nul = text.replace('\0', "");
    let mut collapsed = String::with_capacity(without_nul.len());
    let mut previous_space = false;
    for ch in without_nul.chars() {
        if ch == ' ' {
            if !previous_space {
                collapsed.push(ch);
            }
            previous_space = true;
        } else {
            collapsed.push(ch);
            previous_space = false;
        }
    }

    let lines = collapsed.split('\n').map(str::trim).collect::<Vec<_>>();
    let mut cleaned = String::with_capacity(collapsed.len());
    let mut blank_run = 0usize;
    for (index, line) in lines.iter().enumerate() {
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        if index > 0 {
            cleaned.push('\n');
        }
        cleaned.push_str(line);
    }

    cleaned.trim().to_string()
}

pub fn split_into_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut start = 0usize;
    let mut chars = text.char_indices().peekable();

    while let Some((index, ch)) = chars.next() {
        if !matches!(ch, '.' | '!' | '?') {
            continue;
        }
        let mut saw_space = false;
        while let Some(&(_, next)) = chars.peek() {
            if !next.is_whitespace() {
                break;
            }
            saw_space = true;
            chars.next();
        }
        match chars.peek() {
            Some(&(capital_at, capital)) if saw_space && capital.is_ascii_uppercase() => {
                let piece = text[start..=index].trim();
                if !piece.is_empty() {
                    sentences.push(piece.to_string());
                }
                start = capital_at;
            }
            _ => {}
        }
    }

    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }

    sentences
}

fn char_len(text: &str) -> isize {
    text.chars().count() as isize
}

// Greedy sentence packing with front-trimmed overlap.
// A buffer is emitted when the next sentence would push it past
// `chunk_size`; sentences are then dropped from the front until the
// carried remainder is at most `overlap` characters. A sentence longer
// than `chunk_size` becomes its own chunk.
pub fn chunk_text(
    text: &str,
    source: &ChunkSource,
    config: ChunkingConfig,
) -> Vec<(String, ChunkMetadata)> {
    if text.trim().is_empty() {
        warn!(document_id = %source.document_id, "attempted to chunk empty text");
        return Vec::new();
    }

    let chunk_size = config.chunk_size as isize;
    let overlap = config.overlap as isize;
    let mut chunks: Vec<(String, ChunkMetadata)> = Vec::new();
    let mut current: VecDeque<String> = VecDeque::new();
    // separator-inclusive running length, matches the joined buffer within one char
    let mut current_length: isize = 0;

    let emit = |buffer: &VecDeque<String>, chunks: &mut Vec<(String, ChunkMetadata)>| {
        let joined = buffer.iter().map(String::as_str).collect::<Vec<_>>().join(" ");
        let metadata = ChunkMetadata {
            source: source.clone(),
            chunk_index: chunks.len(),
            chunk_length: joined.chars().count(),
        };
        chunks.push((joined, metadata));
    };

    for sentence in split_into_sentences(text) {
        let sentence_length = char_len(&sentence);

        if current_length + sentence_length > chunk_size && !current.is_empty() {
            emit(&current, &mut chunks);

            let mut overlap_length =
                current.iter().map(|s| char_len(s)).sum::<isize>() + current.len() as isize - 1;
            while overlap_length > overlap {
                match current.pop_front() {
                    Some(removed) => overlap_length -= char_len(&removed) + 1,
                    None => break,
                }
            }
            current_length = overlap_length;
        }

        current.push_back(sentence);
        current_length += sentence_length + 1;
    }

    if !current.is_empty() {
        emit(&current, &mut chunks);
    }

    debug!(
        document_id = %source.document_id,
        chunk_count = chunks.len(),
        text_length = text.len(),
        "created chunks"
    );
    chunks
}
