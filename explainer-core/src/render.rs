use std::io::{self, Write};

/// Display surface for accumulated text. Both methods receive the full
/// cumulative text, never a delta.
pub trait Renderer {
    fn update(&mut self, text: &str) -> io::Result<()>;
    fn finish(&mut self, text: &str) -> io::Result<()>;
}

/// Append-only renderer for terminals and files: each call writes only the
/// part of `text` not written yet.
pub struct WriterRenderer<W: Write> {
    out: W,
    written: usize,
}

impl<W: Write> WriterRenderer<W> {
    pub fn new(out: W) -> Self {
        Self { out, written: 0 }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_suffix(&mut self, text: &str) -> io::Result<()> {
        // A text that is not an extension of what was shown (shorter, or a
        // non-boundary offset) has nothing new to append.
        if let Some(rest) = text.get(self.written..) {
            self.out.write_all(rest.as_bytes())?;
            self.written = text.len();
        }
        Ok(())
    }
}

impl<W: Write> Renderer for WriterRenderer<W> {
    fn update(&mut self, text: &str) -> io::Result<()> {
        self.write_suffix(text)?;
        self.out.flush()
    }

    fn finish(&mut self, text: &str) -> io::Result<()> {
        self.write_suffix(text)?;
        self.out.write_all(b"\n")?;
        self.out.flush()
    }
}
