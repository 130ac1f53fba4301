//! Chunk splitter (§4.H step 3): splits section content into
//! token-targeted chunks without breaking protected blocks (fenced code,
//! Markdown tables, list runs), preferring paragraph/sentence/line/word
//! boundaries in that order.

use super::types::{estimate_tokens, ContentType, RawChunk};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProtectedBlock {
    start: usize,
    end: usize,
}

/// Scans `text` for fenced code blocks, table runs, and list-item runs,
/// returning their char ranges so the splitter never cuts inside one.
fn find_protected_blocks(text: &str) -> Vec<ProtectedBlock> {
    let mut blocks = Vec::new();
    let lines: Vec<&str> = text.lines().collect();
    let mut offsets = Vec::with_capacity(lines.len() + 1);
    let mut offset = 0;
    for line in &lines {
        offsets.push(offset);
        offset += line.chars().count() + 1;
    }
    offsets.push(offset);

    let mut i = 0;
    while i < lines.len() {
        let trimmed = lines[i].trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            let fence = &trimmed[..3];
            let start = offsets[i];
            let mut j = i + 1;
            while j < lines.len() && !lines[j].trim_start().starts_with(fence) {
                j += 1;
            }
            let end_line = j.min(lines.len().saturating_sub(1));
            blocks.push(ProtectedBlock {
                start,
                end: offsets[(end_line + 1).min(offsets.len() - 1)],
            });
            i = end_line + 1;
            continue;
        }
        if trimmed.starts_with('|') {
            let start = offsets[i];
            let mut j = i;
            while j < lines.len() && lines[j].trim_start().starts_with('|') {
                j += 1;
            }
            blocks.push(ProtectedBlock {
                start,
                end: offsets[j.min(offsets.len() - 1)],
            });
            i = j;
            continue;
        }
        if is_list_item(trimmed) {
            let start = offsets[i];
            let mut j = i;
            while j < lines.len() && (is_list_item(lines[j].trim_start()) || lines[j].starts_with(' ')) {
                j += 1;
            }
            blocks.push(ProtectedBlock {
                start,
                end: offsets[j.min(offsets.len() - 1)],
            });
            i = j;
            continue;
        }
        i += 1;
    }
    blocks
}

fn is_list_item(trimmed: &str) -> bool {
    if trimmed.starts_with("- ") || trimmed.starts_with("* ") || trimmed.starts_with("+ ") {
        return true;
    }
    let digits: String = trimmed.chars().take_while(|c| c.is_ascii_digit()).collect();
    !digits.is_empty() && trimmed[digits.len()..].starts_with(". ")
}

fn protects(blocks: &[ProtectedBlock], offset: usize) -> bool {
    blocks.iter().any(|b| offset > b.start && offset < b.end)
}

/// Nudges `offset` to the nearest non-protected position by snapping
/// forward to the enclosing block's end.
fn escape_protected(blocks: &[ProtectedBlock], offset: usize, text_len: usize) -> usize {
    for block in blocks {
        if offset > block.start && offset < block.end {
            return if block.end <= text_len { block.end } else { block.start };
        }
    }
    offset
}

/// Finds the best break offset at or before `max_offset`, preferring
/// paragraph > sentence > line > word > hard cut, and never landing
/// inside a protected block.
fn find_break(chars: &[char], min_offset: usize, max_offset: usize, blocks: &[ProtectedBlock]) -> usize {
    let max_offset = max_offset.min(chars.len());
    if max_offset <= min_offset {
        return max_offset;
    }

    let paragraph_floor = min_offset + 200;
    if paragraph_floor < max_offset {
        if let Some(pos) = find_last(chars, paragraph_floor, max_offset, "\n\n") {
            let candidate = pos + 2;
            if !protects(blocks, candidate) {
                return candidate;
            }
        }
    }

    if let Some(pos) = find_last(chars, min_offset, max_offset, ". ") {
        let candidate = pos + 2;
        if !protects(blocks, candidate) {
            return candidate;
        }
    }

    if let Some(pos) = find_last(chars, min_offset, max_offset, "\n") {
        let candidate = pos + 1;
        if !protects(blocks, candidate) {
            return candidate;
        }
    }

    for i in (min_offset..max_offset).rev() {
        if chars[i] == ' ' && !protects(blocks, i + 1) {
            return i + 1;
        }
    }

    escape_protected(blocks, max_offset, chars.len())
}

fn find_last(chars: &[char], from: usize, to: usize, needle: &str) -> Option<usize> {
    let needle_chars: Vec<char> = needle.chars().collect();
    if needle_chars.is_empty() || to > chars.len() || from >= to {
        return None;
    }
    let mut best = None;
    let mut i = from;
    while i + needle_chars.len() <= to {
        if chars[i..i + needle_chars.len()] == needle_chars[..] {
            best = Some(i);
        }
        i += 1;
    }
    best
}

fn chars_to_str(chars: &[char], start: usize, end: usize) -> String {
    chars[start..end].iter().collect()
}

/// Binary-searches a character offset that brings the chunk within ±20
/// tokens of `target_tokens`, capped at 5 iterations, then snaps the
/// result to the nearest acceptable break point.
fn binary_search_offset(chars: &[char], start: usize, target_tokens: usize, blocks: &[ProtectedBlock]) -> usize {
    let mut lo = start;
    let mut hi = chars.len();
    let mut best = hi;

    for _ in 0..5 {
        if lo >= hi {
            break;
        }
        let mid = lo + (hi - lo) / 2;
        let tokens = estimate_tokens(&chars_to_str(chars, start, mid));
        best = mid;
        if tokens.abs_diff(target_tokens) <= 20 {
            break;
        }
        if tokens > target_tokens {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }

    find_break(chars, start, best, blocks)
}

fn detect_content_type(text: &str) -> (ContentType, Option<String>) {
    let trimmed = text.trim_start();
    if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
        let fence_line = trimmed.lines().next().unwrap_or("");
        let lang = fence_line.trim_start_matches(['`', '~']).trim();
        let language = if lang.is_empty() { None } else { Some(lang.to_string()) };
        return (ContentType::Code, language);
    }
    let pipe_lines = text.lines().filter(|l| l.trim_start().starts_with('|')).count();
    let total_lines = text.lines().count().max(1);
    if pipe_lines > 0 && pipe_lines * 2 >= total_lines {
        return (ContentType::Table, None);
    }
    (ContentType::Markdown, None)
}

fn char_byte_offset(s: &str, char_idx: usize) -> usize {
    s.char_indices().nth(char_idx).map(|(b, _)| b).unwrap_or(s.len())
}

/// Splits `section_content` (whose absolute start is `section_start_char`
/// / `section_start_line`) into chunks, advancing the global chunk-index
/// counter passed in by reference.
pub fn chunk_section(
    section_content: &str,
    section_start_char: usize,
    section_start_line: usize,
    heading_path: &str,
    target_tokens: usize,
    overlap_tokens: usize,
    next_chunk_index: &mut usize,
) -> Vec<RawChunk> {
    if section_content.trim().is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = section_content.chars().collect();
    let blocks = find_protected_blocks(section_content);
    let min_chunk_tokens = ((target_tokens as f64) * 0.3).ceil() as usize;

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        let remaining_tokens = estimate_tokens(&chars_to_str(&chars, start, chars.len()));
        let mut end = if remaining_tokens <= target_tokens + 20 {
            chars.len()
        } else {
            binary_search_offset(&chars, start, target_tokens, &blocks).max(start + 1)
        };

        if end < chars.len() {
            let chunk_tokens_here = estimate_tokens(&chars_to_str(&chars, start, end));
            let remainder_tokens = estimate_tokens(&chars_to_str(&chars, end, chars.len()));
            if chunk_tokens_here < min_chunk_tokens && remainder_tokens > 0 {
                end = chars.len().min(start + target_tokens * 4);
            }
        }
        if protects(&blocks, end) {
            end = escape_protected(&blocks, end, chars.len());
        }
        end = end.min(chars.len());
        if end <= start {
            end = chars.len();
        }

        let text = chars_to_str(&chars, start, end);
        let (content_type, language) = detect_content_type(&text);

        let start_byte = char_byte_offset(section_content, start);
        let end_byte = char_byte_offset(section_content, end);
        let start_line = section_start_line + section_content[..start_byte].matches('\n').count();
        let end_line = section_start_line + section_content[..end_byte].matches('\n').count();

        chunks.push(RawChunk {
            chunk_index: *next_chunk_index,
            text,
            start_char: section_start_char + start,
            end_char: section_start_char + end,
            start_line,
            end_line,
            heading_path: heading_path.to_string(),
            content_type,
            language,
        });
        *next_chunk_index += 1;

        if end >= chars.len() {
            break;
        }

        let overlap_chars = (((end - start) as f64) * 0.3).floor() as usize;
        let overlap_token_chars = overlap_tokens * 4;
        let overlap = overlap_chars.min(overlap_token_chars);
        start = end.saturating_sub(overlap).max(start + 1);
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_content_yields_no_chunks() {
        let mut idx = 0;
        let chunks = chunk_section("   \n  ", 0, 0, "", 500, 50, &mut idx);
        assert!(chunks.is_empty());
    }

    #[test]
    fn short_section_is_a_single_chunk() {
        let mut idx = 0;
        let text = "A short paragraph that fits in one chunk easily.";
        let chunks = chunk_section(text, 0, 0, "Intro", 500, 50, &mut idx);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, text);
        assert_eq!(chunks[0].chunk_index, 0);
    }

    #[test]
    fn chunk_index_is_monotonic_across_calls() {
        let mut idx = 0;
        let long_text = "word ".repeat(800);
        chunk_section(&long_text, 0, 0, "A", 500, 50, &mut idx);
        let first_count = idx;
        chunk_section(&long_text, 10_000, 0, "B", 500, 50, &mut idx);
        assert!(idx > first_count);
    }

    #[test]
    fn fenced_code_block_longer_than_target_stays_whole() {
        let mut idx = 0;
        let body = "line of code\n".repeat(400);
        let text = format!("```rust\n{body}```\n");
        let chunks = chunk_section(&text, 0, 0, "Code", 500, 50, &mut idx);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("```rust"));
    }

    #[test]
    fn detects_code_content_type() {
        let mut idx = 0;
        let text = "```python\nprint('hi')\n```";
        let chunks = chunk_section(text, 0, 0, "", 500, 50, &mut idx);
        assert_eq!(chunks[0].content_type, ContentType::Code);
        assert_eq!(chunks[0].language.as_deref(), Some("python"));
    }

    #[test]
    fn detects_table_content_type() {
        let mut idx = 0;
        let text = "| a | b |\n|---|---|\n| 1 | 2 |";
        let chunks = chunk_section(text, 0, 0, "", 500, 50, &mut idx);
        assert_eq!(chunks[0].content_type, ContentType::Table);
    }

    #[test]
    fn long_text_splits_into_multiple_chunks_with_nondecreasing_start_char() {
        let mut idx = 0;
        let long_text = "This is one sentence. ".repeat(500);
        let chunks = chunk_section(&long_text, 0, 0, "Body", 500, 50, &mut idx);
        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            assert!(pair[0].start_char <= pair[1].start_char);
        }
    }
}
