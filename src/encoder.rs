//! Tokenization encoder (JSON)

use crate::archive::ArchiveTokenization;
use crate::error::Result;
use std::io::Write;

/// Encodes a tokenization as JSON
///
/// Field order is fixed by the data model, so identical tokenizations
/// always encode to identical text. `pretty` only changes whitespace.
#[derive(Debug, Clone, Copy, Default)]
pub struct Encoder {
    pretty: bool,
}

impl Encoder {
    /// Create a compact encoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Indent the output for reading
    pub fn with_pretty(mut self, pretty: bool) -> Self {
        self.pretty = pretty;
        self
    }

    pub fn is_pretty(&self) -> bool {
        self.pretty
    }

    /// Encode a tokenization to a string
    pub fn encode(&self, tokens: &ArchiveTokenization) -> Result<String> {
        let text = if self.pretty {
            serde_json::to_string_pretty(tokens)?
        } else {
            serde_json::to_string(tokens)?
        };
        Ok(text)
    }

    /// Encode a tokenization directly to a writer
    pub fn encode_to_writer<W: Write>(&self, tokens: &ArchiveTokenization, writer: W) -> Result<()> {
        write_json(tokens, writer, self.pretty)
    }

    /// Encode a tokenization to a file
    pub fn encode_to_file(&self, tokens: &ArchiveTokenization, path: &std::path::Path) -> Result<()> {
        let file = std::fs::File::create(path)?;
        let mut writer = std::io::BufWriter::new(file);
        self.encode_to_writer(tokens, &mut writer)?;
        writer.flush()?;
        Ok(())
    }
}

/// Render `tokens` as JSON into `writer`, indented when `pretty` is set
pub fn write_json<W: Write>(tokens: &ArchiveTokenization, mut writer: W, pretty: bool) -> Result<()> {
    if pretty {
        serde_json::to_writer_pretty(&mut writer, tokens)?;
        writer.write_all(b"\n")?;
    } else {
        serde_json::to_writer(&mut writer, tokens)?;
    }
    Ok(())
}
