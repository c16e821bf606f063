//! Program source normalisation for hashing.
//!
//! The stored source is always the verbatim text; this form exists only so
//! that cosmetically different copies of one program hash identically.

/// Normalises program source for hash computation.
///
/// Passes, in order: strip `/* … */` block comments (multi-line, non-greedy;
/// an unterminated opener is kept as text), strip `//` line comments, drop
/// lines whose first non-whitespace characters are `#include`, then remove
/// every whitespace character. The result is not meant to be readable.
pub fn normalize_program(source: &str) -> String {
    let text = strip_block_comments(source);
    let mut kept = String::with_capacity(text.len());
    for line in text.lines() {
        let line = match line.find("//") {
            Some(pos) => &line[..pos],
            None => line,
        };
        if line.trim_start().starts_with("#include") {
            continue;
        }
        kept.push_str(line);
        kept.push('\n');
    }
    kept.chars().filter(|c| !c.is_whitespace()).collect()
}

fn strip_block_comments(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;
    loop {
        match rest.find("/*") {
            Some(start) => {
                out.push_str(&rest[..start]);
                match rest[start + 2..].find("*/") {
                    Some(end) => {
                        rest = &rest[start + 2 + end + 2..];
                    }
                    None => {
                        // Unterminated opener: keep the tail verbatim.
                        out.push_str(&rest[start..]);
                        break;
                    }
                }
            }
            None => {
                out.push_str(rest);
                break;
            }
        }
    }
    out
}
