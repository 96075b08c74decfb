// code_buffer.rs — Indentation-aware kernel text accumulator
//
// Collects generated OpenCL C line by line. Tracks the block depth and the
// last emitted line, which drive the duplicate-line and return-aware
// emission helpers. A finished buffer is frozen into a `Fragment` that a
// parent buffer splices in at its own indentation.
//
// Preconditions: `begin_block`/`end_block` calls are paired.
// Postconditions: `last_line()` always reflects the final line of the text.
// Failure modes: none.
// Side effects: none.

use std::fmt::Write as _;

const INDENT: &str = "    ";

#[derive(Debug, Clone, Default)]
pub struct CodeBuffer {
    out: String,
    depth: usize,
    comments: bool,
    last_line: String,
    at_line_start: bool,
}

impl CodeBuffer {
    pub fn new(comments: bool) -> Self {
        CodeBuffer {
            out: String::with_capacity(1024),
            depth: 0,
            comments,
            last_line: String::new(),
            at_line_start: true,
        }
    }

    pub fn begin_block(&mut self) {
        self.depth += 1;
    }

    pub fn end_block(&mut self) {
        debug_assert!(self.depth > 0, "end_block without begin_block");
        self.depth = self.depth.saturating_sub(1);
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// `/* s */` on its own line, only when comments are enabled.
    pub fn emit_comment(&mut self, s: &str) {
        if self.comments {
            self.indent();
            let _ = writeln!(self.out, "/* {} */", s);
            self.at_line_start = true;
        }
    }

    /// One line of code at the current depth.
    pub fn emit_code(&mut self, code: &str) {
        if self.at_line_start {
            self.indent();
        } else {
            self.out.push(' ');
        }
        self.out.push_str(code);
        self.out.push('\n');
        self.at_line_start = true;
        self.last_line = code.to_string();
    }

    /// Emit `s` unless it repeats the last emitted line.
    pub fn compare_and_emit(&mut self, s: &str) {
        if s != self.last_line {
            self.emit_code(s);
        }
    }

    /// Emit `s` unless the last emitted line was a `return`.
    pub fn compare_not_return_and_emit(&mut self, s: &str) {
        if !self.last_line.trim_start().starts_with("return") {
            self.emit_code(s);
        }
    }

    /// Start a line without terminating it; the next `emit_code` completes it.
    pub fn emit_no_newline(&mut self, s: &str) {
        if self.at_line_start {
            self.indent();
        }
        self.out.push_str(s);
        self.at_line_start = false;
    }

    /// Length of the accumulated text in bytes.
    pub fn len(&self) -> usize {
        self.out.len()
    }

    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }

    pub fn line_count(&self) -> usize {
        self.out.lines().count()
    }

    pub fn last_line(&self) -> &str {
        &self.last_line
    }

    pub fn as_str(&self) -> &str {
        &self.out
    }

    /// Drop the final `n` lines and resynchronize `last_line`.
    pub fn remove_last_lines(&mut self, n: usize) {
        let keep = self.line_count().saturating_sub(n);
        let mut truncated = String::with_capacity(self.out.len());
        for line in self.out.lines().take(keep) {
            truncated.push_str(line);
            truncated.push('\n');
        }
        self.out = truncated;
        self.at_line_start = true;
        self.last_line = self
            .out
            .lines()
            .next_back()
            .map(|l| l.trim().to_string())
            .unwrap_or_default();
    }

    /// Freeze the text into an immutable fragment.
    pub fn into_fragment(self) -> Fragment {
        Fragment { text: self.out }
    }

    fn indent(&mut self) {
        for _ in 0..self.depth {
            self.out.push_str(INDENT);
        }
    }
}

/// Immutable generated text, produced in isolation and spliced by a parent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fragment {
    text: String,
}

impl Fragment {
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn line_count(&self) -> usize {
        self.text.lines().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_indent_by_four() {
        let mut b = CodeBuffer::new(false);
        b.emit_code("{");
        b.begin_block();
        b.emit_code("int x = 0;");
        b.end_block();
        b.emit_code("}");
        assert_eq!(b.as_str(), "{\n    int x = 0;\n}\n");
        assert_eq!(b.last_line(), "}");
    }

    #[test]
    fn comments_only_when_enabled() {
        let mut off = CodeBuffer::new(false);
        off.emit_comment("visited If");
        assert!(off.is_empty());
        let mut on = CodeBuffer::new(true);
        on.emit_comment("visited If");
        assert_eq!(on.as_str(), "/* visited If */\n");
    }

    #[test]
    fn compare_and_emit_skips_repeats() {
        let mut b = CodeBuffer::new(false);
        b.emit_code("phi_1 = result_2;");
        b.compare_and_emit("phi_1 = result_2;");
        b.compare_and_emit("phi_3 = result_4;");
        assert_eq!(b.line_count(), 2);
    }

    #[test]
    fn break_is_suppressed_after_return() {
        let mut b = CodeBuffer::new(false);
        b.emit_code("return result_1;");
        b.compare_not_return_and_emit("break;");
        assert_eq!(b.line_count(), 1);
        b.emit_code("x = 1;");
        b.compare_not_return_and_emit("break;");
        assert_eq!(b.last_line(), "break;");
    }

    #[test]
    fn no_newline_joins_next_line() {
        let mut b = CodeBuffer::new(false);
        b.begin_block();
        b.emit_no_newline("for ( ; ; )");
        b.emit_code("{");
        assert_eq!(b.as_str(), "    for ( ; ; ) {\n");
    }

    #[test]
    fn remove_last_lines_resyncs_last_line() {
        let mut b = CodeBuffer::new(false);
        for line in ["a;", "else", "{", "}"] {
            b.emit_code(line);
        }
        b.remove_last_lines(3);
        assert_eq!(b.as_str(), "a;\n");
        assert_eq!(b.last_line(), "a;");
        assert_eq!(b.len(), 3);
    }

    #[test]
    fn fragment_freezes_generated_text() {
        let mut child = CodeBuffer::new(false);
        child.begin_block();
        child.emit_code("res[0] = in[0];");
        let fragment = child.into_fragment();
        assert_eq!(fragment.as_str(), "    res[0] = in[0];\n");
        assert_eq!(fragment.line_count(), 1);
        assert!(!fragment.is_empty());
    }
}
