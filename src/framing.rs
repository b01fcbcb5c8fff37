/// Splits the control byte stream into newline-delimited messages.
///
/// `\r\n` is accepted alongside `\n`. Chunks without a terminator are
/// carried until the terminator arrives; empty messages are dropped.
#[derive(Debug, Default)]
pub struct LineFramer {
    partial: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns every complete message it unlocked, in
    /// arrival order. A trailing fragment is retained for the next call.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut messages = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                if self.partial.last() == Some(&b'\r') {
                    self.partial.pop();
                }
                if !self.partial.is_empty() {
                    messages.push(String::from_utf8_lossy(&self.partial).into_owned());
                }
                self.partial.clear();
            } else {
                self.partial.push(byte);
            }
        }
        messages
    }
}
