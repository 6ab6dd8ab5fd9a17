//! The validated catalog-page artifact written to the output tree.
//!
//! Everything upstream of validation is an opaque string; this module
//! defines the one structured shape the engine commits to disk, plus
//! the previous-page context rendered into follow-on prompts.

use serde::{Deserialize, Serialize};

/// A single block of OCR text with its layout position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextBlock {
    pub block_id: i64,
    pub position: String,
    pub text: String,
    pub font_style: String,
}

/// Raw OCR content of the page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawOcr {
    pub text_blocks: Vec<TextBlock>,
    pub layout_description: String,
}

/// Page-level metadata extracted by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    pub page_number: Option<String>,
    pub is_complete_page: bool,
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Textbook {
    pub title: Option<String>,
    pub author: Option<String>,
}

/// One course entry extracted from the catalog page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    pub course_name: Option<String>,
    pub department: Option<String>,
    pub level: Option<String>,
    pub topics: Option<Vec<String>>,
    pub textbooks: Vec<Textbook>,
    pub term: Option<String>,
    pub instructors: Option<Vec<String>>,
    pub description: Option<String>,
}

/// The validated output artifact for one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogPage {
    pub raw_ocr: RawOcr,
    pub page_info: PageInfo,
    pub school_name: Option<String>,
    pub catalog_year: Option<String>,
    pub academic_year: Option<String>,
    pub courses: Vec<Course>,
}

/// Trailing OCR characters, capped at `limit`.
#[must_use]
pub fn last_ocr_chars(page: &CatalogPage, limit: usize) -> String {
    let combined: String = page
        .raw_ocr
        .text_blocks
        .iter()
        .filter(|b| !b.text.is_empty())
        .map(|b| b.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    if combined.chars().count() <= limit {
        return combined;
    }
    let skip = combined.chars().count() - limit;
    combined.chars().skip(skip).collect()
}

/// Render the context block handed to the next page's prompt: the last
/// 500 OCR characters and the last 3 courses.
#[must_use]
pub fn format_previous_context(page: &CatalogPage) -> String {
    let last_text = last_ocr_chars(page, 500);
    let last_courses: Vec<&Course> = page.courses.iter().rev().take(3).rev().collect();

    let mut lines: Vec<String> = Vec::new();
    if !last_text.is_empty() {
        lines.push("LAST_500_CHARS:".to_string());
        lines.push(last_text);
    }

    lines.push(String::new());
    lines.push("LAST_3_COURSES:".to_string());
    if last_courses.is_empty() {
        lines.push("(none)".to_string());
    } else {
        for (idx, course) in last_courses.iter().enumerate() {
            lines.push(format!(
                "{}. {} (department={}, level={}, term={})",
                idx + 1,
                course.course_name.as_deref().unwrap_or("None"),
                course.department.as_deref().unwrap_or("None"),
                course.level.as_deref().unwrap_or("None"),
                course.term.as_deref().unwrap_or("None"),
            ));
        }
    }

    lines.join("\n").trim().to_string()
}
