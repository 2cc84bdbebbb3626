//! Robust multi-backend PDF text extraction.
//!
//! Produces, for one PDF, per-page text plus detected tables, coarse
//! sections, and a record of per-page errors. Backends are tried in fixed
//! order; the first that yields non-empty text wins:
//!
//! 1. **pdf-extract** — fast native pass over the whole document.
//! 2. **table-aware** — per-page text with tables reconstructed from
//!    aligned column separators as part of the extraction itself.
//! 3. **lopdf per-page** — minimal fallback, one page at a time so a
//!    single pathological page cannot sink the document.
//! 4. **lopdf chunked** — pages in groups of ten, for documents where the
//!    per-page pass stalls on shared resources.
//!
//! Every page has a hard time budget (default 30 s). A timeout is recorded
//! in `errors` and the page is emitted as empty text; it never fails the
//! whole document. Only when all backends produce empty text does the
//! extractor return [`ExtractError::Empty`], which is per-document fatal —
//! the ingestion orchestrator logs it and continues with the batch.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ExtractError;

/// Pages per group in the chunked re-pass.
const CHUNKED_PASS_GROUP: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct PdfMetadata {
    pub title: Option<String>,
    pub page_count: u32,
}

/// A crude table detected from aligned whitespace runs.
#[derive(Debug, Clone)]
pub struct DetectedTable {
    /// 1-based page number.
    pub page_num: u32,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct ExtractionResult {
    pub metadata: PdfMetadata,
    /// Per-page text, index 0 = page 1. Empty string for failed pages.
    pub pages: Vec<String>,
    pub tables: Vec<DetectedTable>,
    pub errors: Vec<String>,
    /// Heading → body text. Downstream consumers may ignore this.
    pub sections: BTreeMap<String, String>,
    /// Which backend produced the text.
    pub backend: &'static str,
}

impl ExtractionResult {
    pub fn has_text(&self) -> bool {
        self.pages.iter().any(|p| !p.trim().is_empty())
    }
}

/// Extracts one PDF, trying each backend in order.
pub async fn extract_pdf(
    path: &Path,
    page_timeout: Duration,
) -> Result<ExtractionResult, ExtractError> {
    if !path.exists() {
        return Err(ExtractError::NotFound(path.display().to_string()));
    }
    let bytes = std::fs::read(path)
        .map_err(|e| ExtractError::Parse(format!("read {}: {}", path.display(), e)))?;
    let bytes = Arc::new(bytes);

    let mut errors: Vec<String> = Vec::new();

    for backend in ["pdf-extract", "table-aware", "lopdf", "lopdf-chunked"] {
        let attempt = match backend {
            "pdf-extract" => extract_with_pdf_extract(bytes.clone(), page_timeout).await,
            "table-aware" => extract_with_tables(bytes.clone(), page_timeout).await,
            "lopdf" => extract_with_lopdf(bytes.clone(), page_timeout, 1).await,
            _ => extract_with_lopdf(bytes.clone(), page_timeout, CHUNKED_PASS_GROUP).await,
        };
        match attempt {
            Ok(mut result) => {
                if result.has_text() {
                    tracing::debug!(backend, pages = result.pages.len(), "extraction succeeded");
                    result.backend = backend;
                    result.errors.splice(0..0, errors);
                    postprocess(&mut result);
                    return Ok(result);
                }
                errors.push(format!("{}: produced no text", backend));
            }
            Err(e) => {
                tracing::warn!(backend, error = %e, "extraction backend failed");
                errors.push(format!("{}: {}", backend, e));
            }
        }
    }

    Err(ExtractError::Empty(path.display().to_string()))
}

async fn extract_with_pdf_extract(
    bytes: Arc<Vec<u8>>,
    page_timeout: Duration,
) -> Result<ExtractionResult, ExtractError> {
    let page_count = count_pages(&bytes);
    // pdf-extract walks the whole document in one pass, so the budget is
    // pooled across pages rather than enforced per page.
    let budget = page_timeout * page_count.max(1);
    let handle = tokio::task::spawn_blocking(move || {
        pdf_extract::extract_text_from_mem_by_pages(&bytes)
            .map_err(|e| ExtractError::Parse(e.to_string()))
    });
    let pages = match tokio::time::timeout(budget, handle).await {
        Ok(joined) => joined.map_err(|e| ExtractError::Parse(e.to_string()))??,
        Err(_) => {
            return Err(ExtractError::Parse(format!(
                "document pass exceeded {}s budget",
                budget.as_secs()
            )))
        }
    };
    Ok(ExtractionResult {
        metadata: PdfMetadata {
            title: None,
            page_count: pages.len() as u32,
        },
        pages,
        tables: Vec::new(),
        errors: Vec::new(),
        sections: BTreeMap::new(),
        backend: "pdf-extract",
    })
}

/// Table-aware pass: per-page text with tables reconstructed during
/// extraction from aligned column separators, each page under its own
/// time budget. Timed-out pages are emitted empty and recorded.
async fn extract_with_tables(
    bytes: Arc<Vec<u8>>,
    page_timeout: Duration,
) -> Result<ExtractionResult, ExtractError> {
    let doc = {
        let bytes = bytes.clone();
        tokio::task::spawn_blocking(move || {
            lopdf::Document::load_mem(&bytes).map_err(|e| ExtractError::Parse(e.to_string()))
        })
        .await
        .map_err(|e| ExtractError::Parse(e.to_string()))??
    };
    let doc = Arc::new(doc);
    let title = pdf_title(&doc);
    let page_numbers: Vec<u32> = doc.get_pages().keys().copied().collect();

    let mut pages: Vec<String> = Vec::with_capacity(page_numbers.len());
    let mut tables: Vec<DetectedTable> = Vec::new();
    let mut errors = Vec::new();

    for (idx, page_no) in page_numbers.iter().enumerate() {
        let doc = doc.clone();
        let page_no = *page_no;
        let handle =
            tokio::task::spawn_blocking(move || doc.extract_text(&[page_no]).unwrap_or_default());
        match tokio::time::timeout(page_timeout, handle).await {
            Ok(Ok(text)) => {
                for rows in page_tables(&text) {
                    tables.push(DetectedTable {
                        page_num: (idx + 1) as u32,
                        rows,
                    });
                }
                pages.push(text);
            }
            Ok(Err(e)) => {
                errors.push(format!("page {}: {}", page_no, e));
                pages.push(String::new());
            }
            Err(_) => {
                errors.push(format!(
                    "page {} timed out after {}s",
                    page_no,
                    page_timeout.as_secs()
                ));
                pages.push(String::new());
            }
        }
    }

    Ok(ExtractionResult {
        metadata: PdfMetadata {
            title,
            page_count: pages.len() as u32,
        },
        pages,
        tables,
        errors,
        sections: BTreeMap::new(),
        backend: "table-aware",
    })
}

/// lopdf pass extracting `group` pages at a time, each group under its own
/// time budget. Timed-out groups are emitted as empty pages and recorded.
async fn extract_with_lopdf(
    bytes: Arc<Vec<u8>>,
    page_timeout: Duration,
    group: usize,
) -> Result<ExtractionResult, ExtractError> {
    let doc = {
        let bytes = bytes.clone();
        tokio::task::spawn_blocking(move || {
            lopdf::Document::load_mem(&bytes).map_err(|e| ExtractError::Parse(e.to_string()))
        })
        .await
        .map_err(|e| ExtractError::Parse(e.to_string()))??
    };
    let doc = Arc::new(doc);
    let title = pdf_title(&doc);
    let page_numbers: Vec<u32> = doc.get_pages().keys().copied().collect();
    let page_count = page_numbers.len();

    let mut pages: Vec<String> = Vec::with_capacity(page_count);
    let mut errors = Vec::new();

    for group_pages in page_numbers.chunks(group.max(1)) {
        let doc = doc.clone();
        let nums: Vec<u32> = group_pages.to_vec();
        let budget = page_timeout * nums.len() as u32;
        let handle = tokio::task::spawn_blocking(move || {
            nums.iter()
                .map(|n| doc.extract_text(&[*n]).unwrap_or_default())
                .collect::<Vec<String>>()
        });
        match tokio::time::timeout(budget, handle).await {
            Ok(Ok(texts)) => pages.extend(texts),
            Ok(Err(e)) => {
                errors.push(format!("pages {:?}: {}", group_pages, e));
                pages.extend(std::iter::repeat_n(String::new(), group_pages.len()));
            }
            Err(_) => {
                errors.push(format!(
                    "pages {:?} timed out after {}s",
                    group_pages,
                    budget.as_secs()
                ));
                pages.extend(std::iter::repeat_n(String::new(), group_pages.len()));
            }
        }
    }

    Ok(ExtractionResult {
        metadata: PdfMetadata {
            title,
            page_count: page_count as u32,
        },
        pages,
        tables: Vec::new(),
        errors,
        sections: BTreeMap::new(),
        backend: "lopdf",
    })
}

fn pdf_title(doc: &lopdf::Document) -> Option<String> {
    let info = doc.trailer.get(b"Info").ok()?;
    let info_dict = match info {
        lopdf::Object::Reference(id) => doc.get_dictionary(*id).ok()?,
        lopdf::Object::Dictionary(d) => d,
        _ => return None,
    };
    let title = info_dict.get(b"Title").ok()?;
    match title {
        lopdf::Object::String(bytes, _) => {
            let s = String::from_utf8_lossy(bytes).trim().to_string();
            if s.is_empty() {
                None
            } else {
                Some(s)
            }
        }
        _ => None,
    }
}

/// Cheap page count for budgeting before a full parse. Falls back to 1.
fn count_pages(bytes: &[u8]) -> u32 {
    lopdf::Document::load_mem(bytes)
        .map(|d| d.get_pages().len() as u32)
        .unwrap_or(1)
}

/// Table detection (on raw text, before column whitespace collapses),
/// then whitespace normalization and heading detection. Tables produced
/// by the table-aware backend are kept as-is.
fn postprocess(result: &mut ExtractionResult) {
    if result.tables.is_empty() {
        result.tables = detect_tables(&result.pages);
    }
    for page in &mut result.pages {
        *page = normalize_whitespace(page);
    }
    result.sections = detect_sections(&result.pages);
    result.metadata.page_count = result.pages.len() as u32;
}

/// Collapses runs of blank lines and intra-line whitespace, preserving
/// line structure.
pub fn normalize_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.lines() {
        let trimmed = line.trim_end();
        if trimmed.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
            out.push('\n');
        } else {
            blank_run = 0;
            let mut last_space = false;
            for c in trimmed.chars() {
                if c == ' ' || c == '\t' {
                    if !last_space {
                        out.push(' ');
                    }
                    last_space = true;
                } else {
                    out.push(c);
                    last_space = false;
                }
            }
            out.push('\n');
        }
    }
    out.trim_end().to_string()
}

fn looks_like_heading(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.len() < 3 || trimmed.len() > 60 || trimmed.ends_with('.') {
        return false;
    }
    let letters: Vec<char> = trimmed.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.is_empty() {
        return false;
    }
    let upper = letters.iter().filter(|c| c.is_uppercase()).count();
    // All-caps, or title-case with a leading capital and mostly short words.
    upper == letters.len() || (trimmed.chars().next().is_some_and(|c| c.is_uppercase()) && trimmed.split_whitespace().count() <= 6 && upper >= trimmed.split_whitespace().count())
}

fn detect_sections(pages: &[String]) -> BTreeMap<String, String> {
    let mut sections = BTreeMap::new();
    let mut current: Option<String> = None;
    let mut buf = String::new();
    for page in pages {
        for line in page.lines() {
            if looks_like_heading(line) {
                if let Some(heading) = current.take() {
                    sections.insert(heading, std::mem::take(&mut buf));
                }
                current = Some(line.trim().to_string());
            } else if current.is_some() {
                buf.push_str(line);
                buf.push('\n');
            }
        }
    }
    if let Some(heading) = current {
        sections.insert(heading, buf);
    }
    sections
}

/// A row belongs to a table when it splits into two or more cells on runs
/// of two+ spaces or tabs. Two consecutive such rows make a table.
fn page_tables(page: &str) -> Vec<Vec<Vec<String>>> {
    let mut tables = Vec::new();
    let mut run: Vec<Vec<String>> = Vec::new();
    for line in page.lines() {
        let cells = split_cells(line);
        if cells.len() >= 2 {
            run.push(cells);
        } else {
            if run.len() >= 2 {
                tables.push(std::mem::take(&mut run));
            }
            run.clear();
        }
    }
    if run.len() >= 2 {
        tables.push(run);
    }
    tables
}

fn detect_tables(pages: &[String]) -> Vec<DetectedTable> {
    let mut tables = Vec::new();
    for (i, page) in pages.iter().enumerate() {
        for rows in page_tables(page) {
            tables.push(DetectedTable {
                page_num: (i + 1) as u32,
                rows,
            });
        }
    }
    tables
}

fn split_cells(line: &str) -> Vec<String> {
    line.split('\t')
        .flat_map(|part| part.split("  "))
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Object, Stream};
    use tempfile::TempDir;

    /// Builds a small real PDF with one text page per entry.
    fn write_pdf(path: &Path, page_texts: &[&str]) {
        let mut doc = lopdf::Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });
        let mut kids: Vec<Object> = Vec::new();
        for text in page_texts {
            let content = Content {
                operations: vec![
                    Operation::new("BT", vec![]),
                    Operation::new("Tf", vec!["F1".into(), 12.into()]),
                    Operation::new("Td", vec![72.into(), 720.into()]),
                    Operation::new("Tj", vec![Object::string_literal(*text)]),
                    Operation::new("ET", vec![]),
                ],
            };
            let content_id =
                doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
            });
            kids.push(page_id.into());
        }
        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        doc.save(path).unwrap();
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let err = extract_pdf(Path::new("/nonexistent/x.pdf"), Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::NotFound(_)));
    }

    #[tokio::test]
    async fn garbage_bytes_yield_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.pdf");
        std::fs::write(&path, b"this is not a pdf").unwrap();
        let err = extract_pdf(&path, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, ExtractError::Empty(_)));
    }

    #[tokio::test]
    async fn real_pdf_extracts_per_page() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("two-pages.pdf");
        write_pdf(&path, &["minimum balance of 1000", "fees and charges"]);
        let result = extract_pdf(&path, Duration::from_secs(30)).await.unwrap();
        assert_eq!(result.pages.len(), 2);
        assert!(result.has_text());
        assert!(result.pages[0].contains("minimum balance"));
        assert!(result.pages[1].contains("fees"));
    }

    #[test]
    fn normalize_collapses_runs() {
        let text = "a   b\t\tc\n\n\n\nnext  line\n";
        let normalized = normalize_whitespace(text);
        assert_eq!(normalized, "a b c\n\nnext line");
        // Stable under re-normalization.
        assert_eq!(normalize_whitespace(&normalized), normalized);
    }

    #[test]
    fn headings_are_detected() {
        assert!(looks_like_heading("INTEREST RATE SWAPS"));
        assert!(looks_like_heading("Fees And Charges"));
        assert!(!looks_like_heading("This is a normal sentence that runs on."));
        assert!(!looks_like_heading("x"));
    }

    #[test]
    fn sections_split_on_headings() {
        let pages = vec![
            "OVERVIEW\nbody one\nMINIMUM BALANCE\nbody two\nmore".to_string(),
        ];
        let sections = detect_sections(&pages);
        assert_eq!(sections.len(), 2);
        assert!(sections.get("MINIMUM BALANCE").unwrap().contains("body two"));
    }

    #[test]
    fn tables_need_two_aligned_rows() {
        let pages = vec![
            "intro text\nTerm  Rate  Fee\n1 year  4.5%  $50\n2 years  4.7%  $50\nafter".to_string(),
        ];
        let tables = detect_tables(&pages);
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].rows.len(), 3);
        assert_eq!(tables[0].rows[0], vec!["Term", "Rate", "Fee"]);
    }

    #[test]
    fn single_aligned_row_is_not_a_table() {
        let tables = page_tables("prose here\nTerm  Rate\nmore prose");
        assert!(tables.is_empty());
    }

    #[tokio::test]
    async fn table_aware_backend_extracts_per_page() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("doc.pdf");
        write_pdf(&path, &["rates and terms overview", "fees schedule follows"]);
        let bytes = Arc::new(std::fs::read(&path).unwrap());
        let result = extract_with_tables(bytes, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(result.backend, "table-aware");
        assert_eq!(result.pages.len(), 2);
        assert!(result.has_text());
        // Single-line prose pages carry no aligned-column tables.
        assert!(result.tables.is_empty());
    }
}
