/// Splits a byte stream into lines without assuming chunk boundaries fall on
/// line or UTF-8 character boundaries.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and returns every line completed by it, without the
    /// terminator. `\n` and `\r\n` both end a line.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|byte| *byte == b'\n') {
            let end = start + offset;
            let mut line = &self.buffer[start..end];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            lines.push(String::from_utf8_lossy(line).into_owned());
            start = end + 1;
        }
        self.buffer.drain(..start);

        lines
    }

    /// Returns whatever trails the last terminator.
    pub fn flush(&mut self) -> String {
        let rest = std::mem::take(&mut self.buffer);
        String::from_utf8_lossy(&rest).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::LineBuffer;

    #[test]
    fn splits_mixed_newlines() {
        let mut buffer = LineBuffer::new();
        let lines = buffer.push(b"a\nb\r\nc");
        assert_eq!(lines, vec!["a", "b"]);
        assert_eq!(buffer.flush(), "c");
    }

    #[test]
    fn joins_lines_split_across_chunks() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(b"{\"type\":").is_empty());
        let lines = buffer.push(b"\"turn.started\"}\n");
        assert_eq!(lines, vec!["{\"type\":\"turn.started\"}"]);
        assert_eq!(buffer.flush(), "");
    }

    #[test]
    fn keeps_multibyte_characters_split_across_chunks() {
        let mut buffer = LineBuffer::new();
        let bytes = "héllo\n".as_bytes();
        assert!(buffer.push(&bytes[..2]).is_empty());
        assert_eq!(buffer.push(&bytes[2..]), vec!["héllo"]);
    }
}
