use crate::chunking::normalize_whitespace;
use crate::error::IngestError;
use lopdf::Document;
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

/// Forward-only page sequence. Reopen the file to start over.
pub type PageStream = Box<dyn Iterator<Item = Result<PageText, IngestError>> + Send>;

pub trait PdfExtractor: Send + Sync {
    fn open(&self, path: &Path) -> Result<PageStream, IngestError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LopdfExtractor;

impl PdfExtractor for LopdfExtractor {
    fn open(&self, path: &Path) -> Result<PageStream, IngestError> {
        let document = Document::load(path)
            .map_err(|error| IngestError::Extraction(format!("{}: {error}", path.display())))?;

        Ok(Box::new(LopdfPages::new(document)))
    }
}

struct LopdfPages {
    document: Document,
    numbers: std::vec::IntoIter<u32>,
    failed: bool,
}

impl LopdfPages {
    fn new(document: Document) -> Self {
        let numbers = document.get_pages().into_keys().collect::<Vec<_>>();
        Self {
            document,
            numbers: numbers.into_iter(),
            failed: false,
        }
    }
}

impl Iterator for LopdfPages {
    type Item = Result<PageText, IngestError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        let number = self.numbers.next()?;
        match self.document.extract_text(&[number]) {
            Ok(raw) => Some(Ok(PageText {
                number,
                text: normalize_page_text(&raw),
            })),
            Err(error) => {
                self.failed = true;
                Some(Err(IngestError::Extraction(format!(
                    "page {number}: {error}"
                ))))
            }
        }
    }
}

fn line_break_hyphen() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(\p{L})-[ \t]*\r?\n\s*(\p{Ll})").expect("hyphenation pattern is valid")
    })
}

/// Rejoins words hyphenated across line breaks, then collapses whitespace.
pub fn normalize_page_text(raw: &str) -> String {
    let joined = line_break_hyphen().replace_all(raw, "$1$2");
    normalize_whitespace(&joined)
}

/// Eagerly reads every page; convenient for inspection tools.
pub fn extract_page_texts(
    extractor: &dyn PdfExtractor,
    path: &Path,
) -> Result<Vec<PageText>, IngestError> {
    extractor.open(path)?.collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn unreadable_file_is_an_extraction_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("broken.pdf");
        std::fs::write(&path, b"%PDF-1.4\n%broken")?;

        let result = LopdfExtractor.open(&path);
        assert!(matches!(result, Err(IngestError::Extraction(_))));
        Ok(())
    }

    #[test]
    fn missing_file_is_an_extraction_error() {
        let result = LopdfExtractor.open(Path::new("/definitely/not/here.pdf"));
        assert!(matches!(result, Err(IngestError::Extraction(_))));
    }

    #[test]
    fn page_text_is_normalized() {
        let raw = "Ground-\nwater   levels\n\n  are  monitored\tdaily. Self-\nHelp";
        assert_eq!(
            normalize_page_text(raw),
            "Groundwater levels are monitored daily. Self- Help"
        );
    }
}
