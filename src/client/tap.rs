//! Incremental TAP (Test Anything Protocol) scanner.
//!
//! Bytes arrive in arbitrary chunks from `stdout` frames; the scanner
//! buffers until a newline and operates on completed lines only. Recognised
//! constructs: the `1..N` plan, `ok` / `not ok` result lines, `# SKIP`
//! directives, `# TODO:` markers, and `---`/`...` delimited YAML
//! diagnostic blocks parsed as flat `key: value` pairs.
//!
//! This is deliberately not a full TAP 14 implementation; anything
//! unrecognised is retained for the log and otherwise ignored.

use std::collections::HashMap;

/// Incremental per-job TAP state.
#[derive(Debug, Default)]
pub struct TapParser {
    line_buffer: Vec<u8>,
    /// Declared plan size, from `1..N`.
    pub plan_count: Option<u32>,
    /// Result lines seen (`ok` and `not ok`, including skips).
    pub results: u32,
    /// `not ok` lines seen.
    pub failures: u32,
    /// Results carrying a `# SKIP` directive (or bare `skip` lines).
    pub skipped: u32,
    /// True once any line carried `# TODO:`.
    pub todo: bool,
    in_yaml: bool,
    yaml_buffer: Vec<String>,
    /// Flat key/value pairs from closed YAML diagnostic blocks.
    pub diagnostics: HashMap<String, String>,
}

impl TapParser {
    /// Fresh parser for one job.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw output bytes; complete lines are scanned immediately.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.line_buffer.extend_from_slice(bytes);
        while let Some(pos) = self.line_buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.line_buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned();
            self.scan_line(line.trim_end_matches('\r'));
        }
    }

    /// Close out the job: an unterminated YAML block is discarded.
    pub fn finish(&mut self) {
        if self.in_yaml {
            log::debug!(
                "[tap] Discarding unterminated YAML block ({} lines)",
                self.yaml_buffer.len()
            );
            self.in_yaml = false;
            self.yaml_buffer.clear();
        }
        self.line_buffer.clear();
    }

    /// True when every seen result was a skip.
    #[must_use]
    pub fn all_skipped(&self) -> bool {
        self.results > 0 && self.skipped == self.results
    }

    fn scan_line(&mut self, line: &str) {
        let trimmed = line.trim();

        if self.in_yaml {
            if trimmed == "..." {
                self.in_yaml = false;
                self.parse_yaml_buffer();
            } else {
                self.yaml_buffer.push(line.to_string());
            }
            return;
        }
        if trimmed == "---" {
            self.in_yaml = true;
            self.yaml_buffer.clear();
            return;
        }

        let is_not_ok = has_word_prefix(trimmed, "not ok");
        let is_ok = !is_not_ok && has_word_prefix(trimmed, "ok");

        // A SKIP directive counts only on an `ok` result (or a bare `skip`
        // line); `not ok ... # SKIP` does not.
        if (is_ok && line.contains("# SKIP")) || has_word_prefix(trimmed, "skip") {
            self.skipped += 1;
        }
        if line.contains("# TODO:") {
            self.todo = true;
        }

        if let Some(rest) = trimmed.strip_prefix("1..") {
            let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
            if !digits.is_empty() && digits.len() == rest.trim_end().len() {
                if let Ok(n) = digits.parse() {
                    self.plan_count = Some(n);
                    return;
                }
            }
        }

        if is_not_ok {
            self.results += 1;
            self.failures += 1;
        } else if is_ok {
            self.results += 1;
        }
        // Everything else (diagnostics, bail-outs, noise) is log-only.
    }

    fn parse_yaml_buffer(&mut self) {
        for line in self.yaml_buffer.drain(..) {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            self.diagnostics
                .insert(key.to_string(), strip_quotes(value.trim()).to_string());
        }
    }
}

/// True when `line` starts with `word` followed by end-of-line or a
/// non-alphanumeric separator, so `ok 1` matches but `okay` does not.
fn has_word_prefix(line: &str, word: &str) -> bool {
    match line.strip_prefix(word) {
        None => false,
        Some(rest) => rest.chars().next().map_or(true, |c| !c.is_alphanumeric()),
    }
}

/// Strip one pair of matching single or double quotes.
fn strip_quotes(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'"' || first == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fed(input: &str) -> TapParser {
        let mut parser = TapParser::new();
        parser.feed(input.as_bytes());
        parser.finish();
        parser
    }

    #[test]
    fn test_plan_and_results() {
        let p = fed("1..3\nok 1\nok 2 - second\nnot ok 3 - broken\n");
        assert_eq!(p.plan_count, Some(3));
        assert_eq!(p.results, 3);
        assert_eq!(p.failures, 1);
        assert_eq!(p.skipped, 0);
        assert!(!p.todo);
    }

    #[test]
    fn test_skip_directive_on_ok_line() {
        let p = fed("1..3\nok 1\nok 2 # SKIP missing nft\nnot ok 3\n");
        assert_eq!(p.plan_count, Some(3));
        assert_eq!(p.results, 3);
        assert_eq!(p.skipped, 1);
    }

    #[test]
    fn test_skip_on_not_ok_is_not_counted() {
        let p = fed("not ok 1 # SKIP should not count\n");
        assert_eq!(p.skipped, 0);
        assert_eq!(p.failures, 1);
    }

    #[test]
    fn test_bare_skip_line_counts() {
        let p = fed("skip everything here\n");
        assert_eq!(p.skipped, 1);
        // A bare skip is a directive, not a result line.
        assert_eq!(p.results, 0);
    }

    #[test]
    fn test_todo_marker() {
        let p = fed("1..1\nnot ok 1 # TODO: not yet\n");
        assert!(p.todo);
        assert_eq!(p.failures, 1);
    }

    #[test]
    fn test_okay_is_not_ok() {
        let p = fed("okay that went fine\n");
        assert_eq!(p.results, 0);
    }

    #[test]
    fn test_yaml_block_parses_key_values() {
        let p = fed("not ok 1\n---\nmessage: \"dns lookup failed\"\nseverity: fail\n...\n");
        assert_eq!(p.diagnostics.get("message").map(String::as_str), Some("dns lookup failed"));
        assert_eq!(p.diagnostics.get("severity").map(String::as_str), Some("fail"));
    }

    #[test]
    fn test_unclosed_yaml_block_is_discarded() {
        let p = fed("ok 1\n---\nmessage: never closed\n");
        assert!(p.diagnostics.is_empty());
        assert_eq!(p.results, 1);
    }

    #[test]
    fn test_result_lines_inside_yaml_are_not_counted() {
        let p = fed("---\nok: looks like a result\nnot ok 2\n...\nok 1\n");
        assert_eq!(p.results, 1);
        assert_eq!(p.failures, 0);
        assert_eq!(p.diagnostics.get("ok").map(String::as_str), Some("looks like a result"));
    }

    #[test]
    fn test_chunked_feed_reassembles_lines() {
        let mut p = TapParser::new();
        let input = b"1..2\nok 1\nok 2 # SKIP slow\n";
        for chunk in input.chunks(3) {
            p.feed(chunk);
        }
        p.finish();
        assert_eq!(p.plan_count, Some(2));
        assert_eq!(p.results, 2);
        assert_eq!(p.skipped, 1);
    }

    #[test]
    fn test_trailing_partial_line_is_not_scanned() {
        let mut p = TapParser::new();
        p.feed(b"ok 1\nok 2");
        assert_eq!(p.results, 1);
        p.feed(b"\n");
        assert_eq!(p.results, 2);
    }

    #[test]
    fn test_all_skipped() {
        let p = fed("1..2\nok 1 # SKIP a\nok 2 # SKIP b\n");
        assert!(p.all_skipped());
        let p = fed("1..2\nok 1 # SKIP a\nok 2\n");
        assert!(!p.all_skipped());
    }

    #[test]
    fn test_crlf_lines() {
        let p = fed("1..1\r\nok 1\r\n");
        assert_eq!(p.plan_count, Some(1));
        assert_eq!(p.results, 1);
    }
}
