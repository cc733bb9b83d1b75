//! Page segmentation: text into typed fragments with heading context.
//!
//! The segmenter works on the plain-text rendering the fetcher hands us.
//! It recognises a light markdown-ish structure (headings, lists, quotes,
//! tables) and otherwise groups blank-line separated paragraphs. Positions
//! are stable for a given input, so re-segmentation is deterministic.

use crate::store::types::FragmentKind;

/// A segmented block before it becomes a stored fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentedBlock {
    pub kind: FragmentKind,
    pub position: u32,
    pub text: String,
    pub heading_context: Option<String>,
}

/// Minimum characters a block must carry to be kept.
const MIN_BLOCK_CHARS: usize = 20;

/// Maximum characters per fragment; longer paragraphs are split on sentence
/// boundaries.
const MAX_BLOCK_CHARS: usize = 2000;

/// Segment page text into typed blocks.
///
/// An `abstract_text`, when present (academic works), becomes a
/// distinguished first block of kind `Abstract`.
pub fn segment_page(text: &str, abstract_text: Option<&str>) -> Vec<SegmentedBlock> {
    let mut blocks = Vec::new();
    let mut position = 0u32;

    if let Some(abstract_text) = abstract_text {
        let trimmed = abstract_text.trim();
        if trimmed.len() >= MIN_BLOCK_CHARS {
            blocks.push(SegmentedBlock {
                kind: FragmentKind::Abstract,
                position,
                text: trimmed.to_string(),
                heading_context: None,
            });
            position += 1;
        }
    }

    let mut heading_stack: Vec<(usize, String)> = Vec::new();
    let mut paragraph: Vec<&str> = Vec::new();

    let mut flush_paragraph = |paragraph: &mut Vec<&str>,
                               position: &mut u32,
                               heading_stack: &[(usize, String)],
                               blocks: &mut Vec<SegmentedBlock>| {
        if paragraph.is_empty() {
            return;
        }
        let joined = paragraph.join(" ");
        paragraph.clear();
        let joined = joined.trim();
        if joined.len() < MIN_BLOCK_CHARS {
            return;
        }
        let context = heading_context(heading_stack);
        for chunk in split_long(joined) {
            blocks.push(SegmentedBlock {
                kind: FragmentKind::Paragraph,
                position: *position,
                text: chunk,
                heading_context: context.clone(),
            });
            *position += 1;
        }
    };

    for raw_line in text.lines() {
        let line = raw_line.trim_end();
        let trimmed = line.trim_start();

        if trimmed.is_empty() {
            flush_paragraph(&mut paragraph, &mut position, &heading_stack, &mut blocks);
            continue;
        }

        if let Some((level, title)) = parse_heading(trimmed) {
            flush_paragraph(&mut paragraph, &mut position, &heading_stack, &mut blocks);
            heading_stack.retain(|(l, _)| *l < level);
            heading_stack.push((level, title.clone()));
            if title.len() >= MIN_BLOCK_CHARS {
                blocks.push(SegmentedBlock {
                    kind: FragmentKind::Heading,
                    position,
                    text: title,
                    heading_context: heading_context(&heading_stack[..heading_stack.len() - 1]),
                });
                position += 1;
            }
            continue;
        }

        if is_table_row(trimmed) {
            flush_paragraph(&mut paragraph, &mut position, &heading_stack, &mut blocks);
            if trimmed.len() >= MIN_BLOCK_CHARS && !is_table_separator(trimmed) {
                blocks.push(SegmentedBlock {
                    kind: FragmentKind::Table,
                    position,
                    text: trimmed.to_string(),
                    heading_context: heading_context(&heading_stack),
                });
                position += 1;
            }
            continue;
        }

        if let Some(rest) = trimmed.strip_prefix('>') {
            flush_paragraph(&mut paragraph, &mut position, &heading_stack, &mut blocks);
            let quote = rest.trim();
            if quote.len() >= MIN_BLOCK_CHARS {
                blocks.push(SegmentedBlock {
                    kind: FragmentKind::Quote,
                    position,
                    text: quote.to_string(),
                    heading_context: heading_context(&heading_stack),
                });
                position += 1;
            }
            continue;
        }

        if let Some(item) = parse_list_item(trimmed) {
            flush_paragraph(&mut paragraph, &mut position, &heading_stack, &mut blocks);
            if item.len() >= MIN_BLOCK_CHARS {
                blocks.push(SegmentedBlock {
                    kind: FragmentKind::List,
                    position,
                    text: item,
                    heading_context: heading_context(&heading_stack),
                });
                position += 1;
            }
            continue;
        }

        paragraph.push(trimmed);
    }
    flush_paragraph(&mut paragraph, &mut position, &heading_stack, &mut blocks);

    blocks
}

fn heading_context(stack: &[(usize, String)]) -> Option<String> {
    if stack.is_empty() {
        None
    } else {
        Some(
            stack
                .iter()
                .map(|(_, t)| t.as_str())
                .collect::<Vec<_>>()
                .join(" > "),
        )
    }
}

fn parse_heading(line: &str) -> Option<(usize, String)> {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = line[hashes..].trim();
    if rest.is_empty() {
        return None;
    }
    Some((hashes, rest.to_string()))
}

fn parse_list_item(line: &str) -> Option<String> {
    if let Some(rest) = line.strip_prefix("- ").or_else(|| line.strip_prefix("* ")) {
        return Some(rest.trim().to_string());
    }
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 && digits <= 3 {
        let rest = &line[digits..];
        if let Some(rest) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
            return Some(rest.trim().to_string());
        }
    }
    None
}

fn is_table_row(line: &str) -> bool {
    line.starts_with('|') && line.matches('|').count() >= 2
}

fn is_table_separator(line: &str) -> bool {
    line.chars().all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

/// Split an over-long paragraph on sentence boundaries, keeping each chunk
/// under the cap.
fn split_long(text: &str) -> Vec<String> {
    if text.len() <= MAX_BLOCK_CHARS {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    for sentence in split_sentences(text) {
        if !current.is_empty() && current.len() + sentence.len() + 1 > MAX_BLOCK_CHARS {
            chunks.push(current.trim().to_string());
            current = String::new();
        }
        current.push_str(sentence);
        current.push(' ');
    }
    if !current.trim().is_empty() {
        chunks.push(current.trim().to_string());
    }
    chunks
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if matches!(b, b'.' | b'!' | b'?') {
            let at_end = i + 1 >= bytes.len();
            let followed_by_space = !at_end && bytes[i + 1] == b' ';
            if at_end || followed_by_space {
                out.push(&text[start..=i]);
                start = i + 1;
            }
        }
    }
    if start < text.len() {
        out.push(&text[start..]);
    }
    out
}
