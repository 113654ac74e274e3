//! Recursive character splitter.
//!
//! Text is cut on the coarsest separator that occurs in it (paragraphs, then
//! lines, then words, then characters). Pieces are merged back into chunks of
//! at most `chunk_size` characters, and the tail of each chunk, up to
//! `chunk_overlap` characters, is carried over into the next one.

use std::collections::VecDeque;

const SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

#[derive(Debug, Clone, Copy)]
pub struct RecursiveTextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl RecursiveTextSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size,
            chunk_overlap,
        }
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        self.split_with(text, &SEPARATORS)
    }

    fn split_with(&self, text: &str, separators: &[&str]) -> Vec<String> {
        let position = separators
            .iter()
            .position(|separator| separator.is_empty() || text.contains(separator))
            .unwrap_or(separators.len().saturating_sub(1));
        let separator = separators.get(position).copied().unwrap_or("");
        let finer = separators.get(position + 1..).unwrap_or_default();

        let pieces: Vec<&str> = if separator.is_empty() {
            text.char_indices()
                .map(|(start, c)| &text[start..start + c.len_utf8()])
                .collect()
        } else {
            text.split(separator).filter(|piece| !piece.is_empty()).collect()
        };

        let mut chunks = Vec::new();
        let mut short: Vec<&str> = Vec::new();

        for piece in pieces {
            if char_len(piece) < self.chunk_size {
                short.push(piece);
                continue;
            }

            if !short.is_empty() {
                chunks.extend(self.merge(&short, separator));
                short.clear();
            }

            if finer.is_empty() {
                push_trimmed(&mut chunks, piece);
            } else {
                chunks.extend(self.split_with(piece, finer));
            }
        }

        if !short.is_empty() {
            chunks.extend(self.merge(&short, separator));
        }

        chunks
    }

    fn merge(&self, pieces: &[&str], separator: &str) -> Vec<String> {
        let separator_len = char_len(separator);
        let mut chunks = Vec::new();
        let mut window: VecDeque<&str> = VecDeque::new();
        let mut total = 0;

        for piece in pieces {
            let len = char_len(piece);
            let joiner = |window: &VecDeque<&str>| {
                if window.is_empty() { 0 } else { separator_len }
            };

            if total + len + joiner(&window) > self.chunk_size && !window.is_empty() {
                push_trimmed(&mut chunks, &join(&window, separator));

                while total > self.chunk_overlap
                    || (total > 0 && total + len + joiner(&window) > self.chunk_size)
                {
                    let Some(first) = window.pop_front() else {
                        break;
                    };
                    total -= char_len(first) + joiner(&window);
                }
            }

            total += len + joiner(&window);
            window.push_back(piece);
        }

        push_trimmed(&mut chunks, &join(&window, separator));
        chunks
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn join(window: &VecDeque<&str>, separator: &str) -> String {
    window.iter().copied().collect::<Vec<_>>().join(separator)
}

fn push_trimmed(chunks: &mut Vec<String>, text: &str) {
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_owned());
    }
}
