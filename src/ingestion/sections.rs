//! Normalization and section parsing (§4.H steps 1-2).

use super::types::Section;

/// Convert CR/CRLF to LF and right-trim each line.
pub fn normalize(content: &str) -> String {
    let unified = content.replace("\r\n", "\n").replace('\r', "\n");
    unified
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

fn heading_level(line: &str) -> Option<(u8, &str)> {
    let trimmed = line.trim_start();
    let hashes = trimmed.chars().take_while(|c| *c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &trimmed[hashes..];
    if !rest.starts_with(' ') && !rest.is_empty() {
        return None;
    }
    Some((hashes as u8, rest.trim()))
}

/// Truncate a heading path to `level - 1` components and append `title`.
fn next_heading_path(stack: &[(u8, String)], level: u8, title: &str) -> (Vec<(u8, String)>, String) {
    let mut new_stack: Vec<(u8, String)> = stack
        .iter()
        .filter(|(l, _)| *l < level)
        .cloned()
        .collect();
    new_stack.push((level, title.to_string()));
    let path = new_stack
        .iter()
        .map(|(_, t)| t.as_str())
        .collect::<Vec<_>>()
        .join(" > ");
    (new_stack, path)
}

/// Parses the normalized document into sections delimited by ATX headings.
/// A document with no headings is returned as a single section.
pub fn parse_sections(normalized: &str) -> Vec<Section> {
    let lines: Vec<&str> = normalized.lines().collect();
    if lines.is_empty() {
        return Vec::new();
    }

    let mut line_offsets = Vec::with_capacity(lines.len() + 1);
    let mut offset = 0usize;
    for line in &lines {
        line_offsets.push(offset);
        offset += line.chars().count() + 1;
    }
    line_offsets.push(offset);

    let mut headings: Vec<(usize, u8, String)> = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        if let Some((level, title)) = heading_level(line) {
            headings.push((idx, level, title.to_string()));
        }
    }

    if headings.is_empty() {
        let end_line = lines.len().saturating_sub(1);
        return vec![Section {
            heading: String::new(),
            level: 0,
            heading_path: String::new(),
            content: normalized.to_string(),
            start_char: 0,
            end_char: normalized.chars().count(),
            start_line: 0,
            end_line,
        }];
    }

    let mut sections = Vec::new();
    let mut stack: Vec<(u8, String)> = Vec::new();

    for (i, (line_idx, level, title)) in headings.iter().enumerate() {
        let (new_stack, heading_path) = next_heading_path(&stack, *level, title);
        stack = new_stack;

        let content_start_line = line_idx + 1;
        let content_end_line = headings
            .get(i + 1)
            .map(|(next_idx, _, _)| next_idx.saturating_sub(1))
            .unwrap_or(lines.len().saturating_sub(1));

        let content = if content_start_line <= content_end_line {
            lines[content_start_line..=content_end_line].join("\n")
        } else {
            String::new()
        };

        let start_char = line_offsets[*line_idx];
        let end_char = line_offsets[(content_end_line + 1).min(line_offsets.len() - 1)];

        sections.push(Section {
            heading: title.clone(),
            level: *level,
            heading_path,
            content,
            start_char,
            end_char,
            start_line: *line_idx,
            end_line: content_end_line,
        });
    }

    sections
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_converts_crlf_and_trims_trailing_whitespace() {
        let input = "a   \r\nb\r\n";
        assert_eq!(normalize(input), "a\nb");
    }

    #[test]
    fn no_headings_yields_single_section() {
        let sections = parse_sections("just some text\nmore text");
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].heading_path, "");
    }

    #[test]
    fn nested_headings_build_heading_path() {
        let doc = "# Intro\nhello\n## Details\nworld\n# Second\nbye";
        let sections = parse_sections(doc);
        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0].heading_path, "Intro");
        assert_eq!(sections[1].heading_path, "Intro > Details");
        assert_eq!(sections[2].heading_path, "Second");
    }

    #[test]
    fn sibling_heading_truncates_deeper_path() {
        let doc = "# A\n## B\ncontent\n## C\nmore";
        let sections = parse_sections(doc);
        assert_eq!(sections[1].heading_path, "A > B");
        assert_eq!(sections[2].heading_path, "A > C");
    }

    #[test]
    fn heading_with_no_trailing_content_has_empty_content() {
        let doc = "# Only Heading";
        let sections = parse_sections(doc);
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].content, "");
    }
}
