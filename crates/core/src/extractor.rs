use crate::error::IngestError;
use crate::models::extension_of;
use lopdf::Document;
use quick_xml::events::Event;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedText {
    pub text: String,
    pub page_count: Option<u32>,
}

pub trait TextExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> Result<ExtractedText, IngestError>;
}

fn extraction_failed(path: &Path, details: impl ToString) -> IngestError {
    IngestError::ExtractionFailed {
        path: path.display().to_string(),
        details: details.to_string(),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PdfTextExtractor;

impl TextExtractor for PdfTextExtractor {
    fn extract(&self, path: &Path) -> Result<ExtractedText, IngestError> {
        let document = Document::load(path).map_err(|error| extraction_failed(path, error))?;
        let pages = document.get_pages();

        let mut texts = Vec::with_capacity(pages.len());
        for page_no in pages.keys() {
            match document.extract_text(&[*page_no]) {
                Ok(text) if !text.trim().is_empty() => texts.push(text.trim().to_string()),
                Ok(_) => {}
                Err(error) => {
                    warn!(path = %path.display(), page = page_no, error = %error, "page text unreadable");
                }
            }
        }

        debug!(path = %path.display(), pages = pages.len(), readable = texts.len(), "pdf extracted");
        Ok(ExtractedText {
            text: texts.join("\n\n"),
            page_count: Some(pages.len() as u32),
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DocxTextExtractor;

impl DocxTextExtractor {
    fn document_xml(path: &Path) -> Result<Vec<u8>, IngestError> {
        let file = std::fs::File::open(path)?;
        let mut archive = zip::ZipArchive::new(file).map_err(|error| extraction_failed(path, error))?;
        let entry = archive
            .by_name("word/document.xml")
            .map_err(|error| extraction_failed(path, format!("word/document.xml: {error}")))?;

        let mut xml = Vec::new();
        entry
            .take(MAX_XML_ENTRY_BYTES)
            .read_to_end(&mut xml)
            .map_err(|error| extraction_failed(path, error))?;
        if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
            return Err(extraction_failed(path, "word/document.xml exceeds size limit"));
        }
        Ok(xml)
    }
}

pub fn docx_paragraphs(xml: &[u8]) -> Result<Vec<String>, quick_xml::Error> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut paragraphs = Vec::new();
    let mut current = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(element) if element.local_name().as_ref() == b"t" => in_text = true,
            Event::Text(text) if in_text => current.push_str(&text.unescape()?),
            Event::End(element) => match element.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let paragraph = current.trim();
                    if !paragraph.is_empty() {
                        paragraphs.push(paragraph.to_string());
                    }
                    current.clear();
                }
                _ => {}
            },
            Event::Empty(element) if element.local_name().as_ref() == b"tab" => current.push('\t'),
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !current.trim().is_empty() {
        paragraphs.push(current.trim().to_string());
    }
    Ok(paragraphs)
}

impl TextExtractor for DocxTextExtractor {
    fn extract(&self, path: &Path) -> Result<ExtractedText, IngestError> {
        let xml = Self::document_xml(path)?;
        let paragraphs = docx_paragraphs(&xml).map_err(|error| extraction_failed(path, error))?;
        Ok(ExtractedText {
            text: paragraphs.join("\n\n"),
            page_count: None,
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextExtractor;

impl TextExtractor for PlainTextExtractor {
    fn extract(&self, path: &Path) -> Result<ExtractedText, IngestError> {
        let bytes = std::fs::read(path)?;
        let text = String::from_utf8(bytes).map_err(|error| extraction_failed(path, error))?;
        Ok(ExtractedText {
            text,
            page_count: None,
        })
    }
}

#[derive(Clone)]
pub struct ExtractorRegistry {
    extractors: BTreeMap<String, Arc<dyn TextExtractor>>,
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(".pdf", Arc::new(PdfTextExtractor));
        registry.register(".docx", Arc::new(DocxTextExtractor));
        registry.register(".txt", Arc::new(PlainTextExtractor));
        registry.register(".md", Arc::new(PlainTextExtractor));
        registry
    }
}

impl ExtractorRegistry {
    pub fn empty() -> Self {
        Self {
            extractors: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, extension: &str, extractor: Arc<dyn TextExtractor>) {
        let extension = extension.trim_start_matches('.').to_lowercase();
        self.extractors.insert(format!(".{extension}"), extractor);
    }

    pub fn supports(&self, path: &Path) -> bool {
        self.extractors.contains_key(&extension_of(&path.to_string_lossy()))
    }

    pub fn extensions(&self) -> impl Iterator<Item = &str> {
        self.extractors.keys().map(String::as_str)
    }

    pub fn extract(&self, path: &Path) -> Result<ExtractedText, IngestError> {
        let extension = extension_of(&path.to_string_lossy());
        let extractor = self
            .extractors
            .get(&extension)
            .ok_or_else(|| IngestError::UnsupportedFormat(extension.clone()))?;

        let extracted = extractor.extract(path)?;
        if extracted.text.trim().is_empty() {
            return Err(IngestError::EmptyDocument(path.display().to_string()));
        }
        Ok(extracted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_docx(path: &Path, document_xml: &str) {
        let file = std::fs::File::create(path).expect("create docx");
        let mut zip = zip::ZipWriter::new(file);
        zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
            .expect("start entry");
        zip.write_all(document_xml.as_bytes()).expect("write entry");
        zip.finish().expect("finish zip");
    }

    #[test]
    fn docx_runs_join_and_paragraphs_split() {
        let xml = br#"<w:document xmlns:w="x"><w:body>
            <w:p><w:r><w:t>Hello </w:t></w:r><w:r><w:t>world</w:t></w:r></w:p>
            <w:p></w:p>
            <w:p><w:r><w:t>Tom &amp; Jerry</w:t></w:r></w:p>
        </w:body></w:document>"#;
        let paragraphs = docx_paragraphs(xml).expect("parse");
        assert_eq!(paragraphs, vec!["Hello world", "Tom & Jerry"]);
    }

    #[test]
    fn registry_extracts_docx_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("letter.DOCX");
        write_docx(
            &path,
            r#"<w:document xmlns:w="x"><w:body><w:p><w:r><w:t>Dear team.</w:t></w:r></w:p><w:p><w:r><w:t>Thanks.</w:t></w:r></w:p></w:body></w:document>"#,
        );
        let extracted = ExtractorRegistry::default().extract(&path).expect("extract");
        assert_eq!(extracted.text, "Dear team.\n\nThanks.");
        assert_eq!(extracted.page_count, None);
    }

    #[test]
    fn registry_reads_plain_text() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("notes.md");
        std::fs::write(&path, "# Notes\nSome text.").expect("write");
        let registry = ExtractorRegistry::default();
        assert!(registry.supports(&path));
        assert_eq!(registry.extract(&path).expect("extract").text, "# Notes\nSome text.");
    }

    #[test]
    fn unknown_extensions_are_unsupported() {
        let registry = ExtractorRegistry::default();
        let error = registry
            .extract(Path::new("/tmp/archive.rar"))
            .expect_err("unsupported");
        assert!(matches!(error, IngestError::UnsupportedFormat(ref ext) if ext == ".rar"));
    }

    #[test]
    fn blank_documents_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("blank.txt");
        std::fs::write(&path, "  \n ").expect("write");
        assert!(matches!(
            ExtractorRegistry::default().extract(&path),
            Err(IngestError::EmptyDocument(_))
        ));
    }

    #[test]
    fn corrupt_pdf_reports_extraction_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("broken.pdf");
        std::fs::write(&path, b"definitely not a pdf").expect("write");
        assert!(matches!(
            ExtractorRegistry::default().extract(&path),
            Err(IngestError::ExtractionFailed { .. })
        ));
    }
}
