//! Splits long outbound text into transport-sized chunks.
//!
//! Every chunk carries an exact slice of the input as its body; anything the
//! chunker adds (the `(part i/N)` marker, a re-opened or re-closed code fence)
//! lives in the chunk's prefix or suffix. Concatenating the bodies therefore
//! reproduces the input byte for byte, see [`reassemble`].

use crate::error::{BridgeError, Result};

const FENCE: &str = "```";
/// Longest digit count we try for the part counter before giving up.
const MAX_COUNTER_DIGITS: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub count: usize,
    prefix: String,
    body: String,
    suffix: String,
}

impl Chunk {
    /// The slice of the original text this chunk carries.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Text as it should be sent: marker, re-opened fence, body, re-closed fence.
    pub fn render(&self) -> String {
        let mut out =
            String::with_capacity(self.prefix.len() + self.body.len() + self.suffix.len());
        out.push_str(&self.prefix);
        out.push_str(&self.body);
        out.push_str(&self.suffix);
        out
    }

    /// Rendered length in characters.
    pub fn char_len(&self) -> usize {
        char_len(&self.prefix) + char_len(&self.body) + char_len(&self.suffix)
    }
}

/// Inverse of [`MessageChunker::chunk`]: markers and injected fences are dropped.
pub fn reassemble(chunks: &[Chunk]) -> String {
    chunks.iter().map(Chunk::body).collect()
}

/// Navigation marker for part `index` (1-based) of `count`.
pub fn part_marker(index: usize, count: usize) -> String {
    format!("(part {index}/{count})\n")
}

#[derive(Debug, Clone)]
pub struct MessageChunker {
    max_length: usize,
}

impl MessageChunker {
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Split `text` into chunks whose rendered length never exceeds `max_length`
    /// characters. Text that already fits comes back as a single unmarked chunk.
    pub fn chunk(&self, text: &str) -> Result<Vec<Chunk>> {
        if text.is_empty() {
            return Ok(Vec::new());
        }
        if char_len(text) <= self.max_length {
            return Ok(vec![Chunk {
                index: 0,
                count: 1,
                prefix: String::new(),
                body: text.to_string(),
                suffix: String::new(),
            }]);
        }

        // The marker width depends on how many parts there are, which depends on
        // the marker width. Grow the assumed digit count until it is consistent.
        for digits in 1..=MAX_COUNTER_DIGITS {
            let widest = 10_usize.pow(digits as u32) - 1;
            let marker_len = char_len(&part_marker(widest, widest));
            let budget = self
                .max_length
                .checked_sub(marker_len)
                .filter(|budget| *budget > 0)
                .ok_or_else(|| BridgeError::ChunkTooLarge {
                    unit: "part marker",
                    len: marker_len,
                    budget: self.max_length,
                })?;
            let drafts = split_into_drafts(text, budget)?;
            if drafts.len().to_string().len() <= digits {
                let count = drafts.len();
                return Ok(drafts
                    .into_iter()
                    .enumerate()
                    .map(|(index, draft)| draft.into_chunk(index, count))
                    .collect());
            }
        }
        Err(BridgeError::ChunkTooLarge {
            unit: "message",
            len: char_len(text),
            budget: self.max_length,
        })
    }
}

/// A chunk under construction. `len` counts the reopen line, body and close fence.
#[derive(Debug, Default)]
struct Draft {
    reopen: Option<String>,
    body: String,
    close: bool,
    len: usize,
}

impl Draft {
    fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    fn into_chunk(self, index: usize, count: usize) -> Chunk {
        let mut prefix = if count > 1 {
            part_marker(index + 1, count)
        } else {
            String::new()
        };
        if let Some(reopen) = self.reopen {
            prefix.push_str(&reopen);
        }
        let suffix = if self.close {
            FENCE.to_string()
        } else {
            String::new()
        };
        Chunk {
            index,
            count,
            prefix,
            body: self.body,
            suffix,
        }
    }
}

struct Packer {
    budget: usize,
    done: Vec<Draft>,
    current: Draft,
}

impl Packer {
    fn new(budget: usize) -> Self {
        Self {
            budget,
            done: Vec::new(),
            current: Draft::default(),
        }
    }

    fn flush(&mut self) {
        if !self.current.is_empty() {
            self.done.push(std::mem::take(&mut self.current));
        }
    }

    /// Append a unit that is known to fit in an empty chunk.
    fn push_unit(&mut self, unit: &str) {
        let len = char_len(unit);
        if self.current.len + len > self.budget {
            self.flush();
        }
        self.current.body.push_str(unit);
        self.current.len += len;
    }

    fn push_prose(&mut self, prose: &str) {
        for paragraph in prose.split_inclusive("\n\n") {
            if char_len(paragraph) <= self.budget {
                self.push_unit(paragraph);
                continue;
            }
            for line in paragraph.split_inclusive('\n') {
                if char_len(line) <= self.budget {
                    self.push_unit(line);
                    continue;
                }
                for piece in hard_cut(line, self.budget) {
                    self.push_unit(piece);
                }
            }
        }
    }

    fn push_fence(&mut self, block: &FenceBlock<'_>) -> Result<()> {
        if char_len(block.text) <= self.budget {
            self.push_unit(block.text);
            return Ok(());
        }

        let reopen = format!("{}\n", block.open_line.trim_end_matches(['\r', '\n']));
        let reopen_len = char_len(&reopen);
        let close_len = char_len(FENCE);
        let lines: Vec<&str> = block.text.split_inclusive('\n').collect();
        let last = lines.len().saturating_sub(1);

        self.flush();
        let mut piece = Draft::default();
        for (i, line) in lines.iter().enumerate() {
            let line_len = char_len(line);
            let close_cost = if i == last { 0 } else { close_len };
            if !piece.is_empty() && piece.len + line_len + close_cost > self.budget {
                piece.close = true;
                piece.len += close_len;
                self.done.push(std::mem::take(&mut piece));
            }
            if piece.is_empty() && i > 0 {
                piece.reopen = Some(reopen.clone());
                piece.len = reopen_len;
            }
            if piece.len + line_len + close_cost > self.budget {
                return Err(BridgeError::ChunkTooLarge {
                    unit: "code line",
                    len: line_len,
                    budget: self.budget.saturating_sub(piece.len + close_cost),
                });
            }
            piece.body.push_str(line);
            piece.len += line_len;
        }

        // The tail holds the real closing fence; prose may follow it in the same chunk.
        self.current = piece;
        Ok(())
    }

    fn finish(mut self) -> Vec<Draft> {
        self.flush();
        self.done
    }
}

fn split_into_drafts(text: &str, budget: usize) -> Result<Vec<Draft>> {
    let mut packer = Packer::new(budget);
    for block in parse_blocks(text) {
        match block {
            Block::Prose(prose) => packer.push_prose(prose),
            Block::Fence(fence) => packer.push_fence(&fence)?,
        }
    }
    Ok(packer.finish())
}

#[derive(Debug)]
struct FenceBlock<'a> {
    /// Opening line including its language tag and newline.
    open_line: &'a str,
    /// Whole block from the opening fence through the closing fence line.
    text: &'a str,
}

#[derive(Debug)]
enum Block<'a> {
    Prose(&'a str),
    Fence(FenceBlock<'a>),
}

/// Partition `text` into prose runs and terminated fenced code blocks. An
/// unterminated fence is left as prose.
fn parse_blocks(text: &str) -> Vec<Block<'_>> {
    let mut lines = Vec::new();
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        lines.push((offset, line));
        offset += line.len();
    }

    let mut blocks = Vec::new();
    let mut prose_start = 0;
    let mut i = 0;
    while i < lines.len() {
        let (start, line) = lines[i];
        if !is_fence_line(line) {
            i += 1;
            continue;
        }
        let Some(close) = (i + 1..lines.len()).find(|&j| is_closing_fence(lines[j].1)) else {
            break;
        };
        if prose_start < start {
            blocks.push(Block::Prose(&text[prose_start..start]));
        }
        let (close_start, close_line) = lines[close];
        let end = close_start + close_line.len();
        blocks.push(Block::Fence(FenceBlock {
            open_line: line,
            text: &text[start..end],
        }));
        prose_start = end;
        i = close + 1;
    }
    if prose_start < text.len() {
        blocks.push(Block::Prose(&text[prose_start..]));
    }
    blocks
}

fn is_fence_line(line: &str) -> bool {
    line.trim_start().starts_with(FENCE)
}

fn is_closing_fence(line: &str) -> bool {
    line.trim() == FENCE
}

/// Cut a single over-long line into pieces of at most `budget` characters,
/// preferring whitespace that does not sit inside inline code or emphasis.
fn hard_cut(line: &str, budget: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut rest = line;
    while char_len(rest) > budget {
        let cut = cut_point(rest, budget);
        let (head, tail) = rest.split_at(cut);
        pieces.push(head);
        rest = tail;
    }
    if !rest.is_empty() {
        pieces.push(rest);
    }
    pieces
}

/// Byte offset at which to cut `s`, taking at most `budget` characters.
fn cut_point(s: &str, budget: usize) -> usize {
    let window: Vec<(usize, char)> = s.char_indices().take(budget).collect();
    let hard = s.char_indices().nth(budget).map_or(s.len(), |(offset, _)| offset);

    let mut spans = SpanTracker::default();
    let mut balanced_space = None;
    let mut any_space = None;
    let mut i = 0;
    while i < window.len() {
        let (offset, c) = window[i];
        let next = window.get(i + 1).map(|(_, n)| *n);
        let step = spans.observe(c, next);
        if c.is_whitespace() {
            let cut = (i + 1, offset + c.len_utf8());
            any_space = Some(cut);
            if spans.is_balanced() {
                balanced_space = Some(cut);
            }
        }
        i += step;
    }

    let floor = budget / 2;
    match (balanced_space, any_space) {
        (Some((taken, offset)), _) if taken >= floor => offset,
        (_, Some((taken, offset))) if taken >= floor => offset,
        _ => hard,
    }
}

/// Tracks open inline code and emphasis spans while scanning left to right.
#[derive(Debug, Default)]
struct SpanTracker {
    code: bool,
    bold: bool,
    underline: bool,
    strike: bool,
}

impl SpanTracker {
    /// Returns how many characters the observed marker consumed.
    fn observe(&mut self, c: char, next: Option<char>) -> usize {
        if c == '`' {
            self.code = !self.code;
            return 1;
        }
        if self.code {
            return 1;
        }
        match (c, next) {
            ('*', Some('*')) => {
                self.bold = !self.bold;
                2
            }
            ('_', Some('_')) => {
                self.underline = !self.underline;
                2
            }
            ('~', Some('~')) => {
                self.strike = !self.strike;
                2
            }
            _ => 1,
        }
    }

    fn is_balanced(&self) -> bool {
        !(self.code || self.bold || self.underline || self.strike)
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}
