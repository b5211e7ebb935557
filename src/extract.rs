//! Plain-text extraction from the supported document formats.
//!
//! Format selection is a closed enum keyed by file extension. Extraction
//! failures are ordinary values: the indexer records them per file and
//! moves on.

use std::{io::Read, path::Path};

use quick_xml::{Reader as XmlReader, events::Event};
use serde::{Deserialize, Serialize};
use zip::ZipArchive;

/// Why a document produced no text.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error,
)]
pub enum ExtractError {
    #[error("unsupported document: {0}")]
    Unsupported(String),
    #[error("encrypted document, password rejected")]
    Encrypted,
    #[error("password required")]
    NeedsPassword,
    #[error("could not read document: {0}")]
    IoFailure(String),
    #[error("no text layer and no OCR engine available")]
    OcrUnavailable,
}

/// Recognizes text in documents that only carry page images.
pub trait OcrEngine: Send + Sync {
    fn recognize(&self, path: &Path) -> Result<String, ExtractError>;
}

/// Turns a document on disk into plain text.
pub trait Extractor: Send + Sync {
    fn extract(
        &self,
        path: &Path,
        password: Option<&str>,
        ocr: Option<&dyn OcrEngine>,
    ) -> Result<String, ExtractError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Text,
    Markdown,
    Docx,
    Pdf,
}

impl DocumentFormat {
    /// Pick a format from the file extension, case-insensitively.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::path::Path;
    /// use docseek::extract::DocumentFormat;
    ///
    /// assert_eq!(DocumentFormat::from_path(Path::new("a.PDF")), Some(DocumentFormat::Pdf));
    /// assert_eq!(DocumentFormat::from_path(Path::new("a.png")), None);
    /// ```
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "txt" => Some(Self::Text),
            "md" | "markdown" => Some(Self::Markdown),
            "docx" => Some(Self::Docx),
            "pdf" => Some(Self::Pdf),
            _ => None,
        }
    }

    fn extract(
        self,
        path: &Path,
        password: Option<&str>,
        ocr: Option<&dyn OcrEngine>,
    ) -> Result<String, ExtractError> {
        match self {
            Self::Text | Self::Markdown => extract_plain_text(path),
            Self::Docx => extract_docx(path),
            Self::Pdf => extract_pdf(path, password, ocr),
        }
    }
}

/// The default extractor, dispatching on [`DocumentFormat`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DocumentExtractor;

impl Extractor for DocumentExtractor {
    fn extract(
        &self,
        path: &Path,
        password: Option<&str>,
        ocr: Option<&dyn OcrEngine>,
    ) -> Result<String, ExtractError> {
        let format = DocumentFormat::from_path(path).ok_or_else(|| {
            ExtractError::Unsupported(path.display().to_string())
        })?;
        format.extract(path, password, ocr)
    }
}

fn read_bytes(path: &Path) -> Result<Vec<u8>, ExtractError> {
    std::fs::read(path).map_err(|e| ExtractError::IoFailure(e.to_string()))
}

fn extract_plain_text(path: &Path) -> Result<String, ExtractError> {
    Ok(decode_text(&read_bytes(path)?))
}

/// Decode bytes as UTF-8 or BOM-marked UTF-16, replacing invalid sequences.
fn decode_text(bytes: &[u8]) -> String {
    if let Some(rest) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        return String::from_utf8_lossy(rest).into_owned();
    }
    let utf16 = |rest: &[u8], le: bool| {
        let units: Vec<u16> = rest
            .chunks_exact(2)
            .map(|pair| {
                if le {
                    u16::from_le_bytes([pair[0], pair[1]])
                } else {
                    u16::from_be_bytes([pair[0], pair[1]])
                }
            })
            .collect();
        String::from_utf16_lossy(&units)
    };
    if let Some(rest) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        return utf16(rest, true);
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        return utf16(rest, false);
    }
    String::from_utf8_lossy(bytes).into_owned()
}

fn extract_docx(path: &Path) -> Result<String, ExtractError> {
    let file = std::fs::File::open(path)
        .map_err(|e| ExtractError::IoFailure(e.to_string()))?;
    let mut archive = ZipArchive::new(file)
        .map_err(|e| ExtractError::IoFailure(e.to_string()))?;
    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|_| {
            ExtractError::Unsupported("docx without word/document.xml".into())
        })?
        .read_to_string(&mut xml)
        .map_err(|e| ExtractError::IoFailure(e.to_string()))?;
    docx_text(&xml)
}

/// Collect the text runs of a WordprocessingML body, one line per paragraph.
fn docx_text(xml: &str) -> Result<String, ExtractError> {
    let mut reader = XmlReader::from_str(xml);
    reader.trim_text(true);
    let mut buf = Vec::new();
    let mut out = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Text(text)) => {
                let text = text
                    .unescape()
                    .map_err(|e| ExtractError::IoFailure(e.to_string()))?;
                out.push_str(&text);
            }
            Ok(Event::End(end)) if local_name_is(end.name().as_ref(), b"p") => {
                out.push('\n');
            }
            Ok(Event::Empty(empty))
                if local_name_is(empty.name().as_ref(), b"tab") =>
            {
                out.push('\t');
            }
            Ok(Event::Empty(empty))
                if local_name_is(empty.name().as_ref(), b"br") =>
            {
                out.push('\n');
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::IoFailure(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(out)
}

fn local_name_is(name: &[u8], tag: &[u8]) -> bool {
    match name.iter().rposition(|&b| b == b':') {
        Some(colon) => &name[colon + 1..] == tag,
        None => name == tag,
    }
}

fn extract_pdf(
    path: &Path,
    password: Option<&str>,
    ocr: Option<&dyn OcrEngine>,
) -> Result<String, ExtractError> {
    let bytes = read_bytes(path)?;
    let mut doc = lopdf::Document::load_mem(&bytes)
        .map_err(|e| ExtractError::IoFailure(e.to_string()))?;

    if doc.is_encrypted() && doc.decrypt("").is_err() {
        let password = password.ok_or(ExtractError::NeedsPassword)?;
        doc.decrypt(password).map_err(|_| ExtractError::Encrypted)?;
    }

    let pages: Vec<u32> = doc.get_pages().keys().copied().collect();
    let text = doc.extract_text(&pages).unwrap_or_default();
    if !text.trim().is_empty() {
        return Ok(text);
    }

    // Image-only document.
    match ocr {
        Some(engine) => engine.recognize(path),
        None => Err(ExtractError::OcrUnavailable),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn reads_plain_text_with_bom() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.txt");
        std::fs::write(&path, b"\xEF\xBB\xBFhello world").unwrap();

        let text = DocumentExtractor.extract(&path, None, None).unwrap();
        assert_eq!(text, "hello world");
    }

    #[test]
    fn decodes_utf16_with_bom() {
        let mut bytes = vec![0xFF, 0xFE];
        for unit in "규정".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        assert_eq!(decode_text(&bytes), "규정");
    }

    #[test]
    fn unknown_extension_is_unsupported() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.bin");
        std::fs::write(&path, b"data").unwrap();

        let err = DocumentExtractor.extract(&path, None, None).unwrap_err();
        assert!(matches!(err, ExtractError::Unsupported(_)));
    }

    #[test]
    fn missing_file_is_io_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let err = DocumentExtractor
            .extract(&tmp.path().join("gone.txt"), None, None)
            .unwrap_err();
        assert!(matches!(err, ExtractError::IoFailure(_)));
    }

    #[test]
    fn docx_paragraphs_become_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.docx");
        let file = std::fs::File::create(&path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        zip.start_file(
            "word/document.xml",
            zip::write::SimpleFileOptions::default(),
        )
        .unwrap();
        zip.write_all(
            br#"<w:document xmlns:w="x"><w:body>
                <w:p><w:r><w:t>first &amp; line</w:t></w:r></w:p>
                <w:p><w:r><w:t>second</w:t></w:r></w:p>
            </w:body></w:document>"#,
        )
        .unwrap();
        zip.finish().unwrap();

        let text = DocumentExtractor.extract(&path, None, None).unwrap();
        assert_eq!(text, "first & line\nsecond\n");
    }

    #[test]
    fn corrupt_docx_is_io_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("broken.docx");
        std::fs::write(&path, b"not a zip").unwrap();

        let err = DocumentExtractor.extract(&path, None, None).unwrap_err();
        assert!(matches!(err, ExtractError::IoFailure(_)));
    }

    #[test]
    fn local_name_ignores_namespace_prefix() {
        assert!(local_name_is(b"w:p", b"p"));
        assert!(local_name_is(b"p", b"p"));
        assert!(!local_name_is(b"w:pPr", b"p"));
    }
}
