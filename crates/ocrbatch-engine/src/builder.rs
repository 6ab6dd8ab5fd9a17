//! Builds per-record gateway payloads for a runnable wave.
//!
//! Each payload carries the rendered prompt and the page's image path.
//! When the immediately preceding labelled page is Done, its artifact
//! tail is rendered into the prompt as previous context; chain-starting
//! pages render without it.

use std::collections::BTreeSet;
use std::path::Path;

use ocrbatch_types::artifact::format_previous_context;
use ocrbatch_types::{CatalogPage, RecordKey};

use crate::gateway::RecordPayload;
use crate::prompt::PromptTemplate;

/// Shared inputs for one wave's payload build.
#[derive(Debug)]
pub struct BuildInputs<'a> {
    pub template: &'a PromptTemplate,
    pub label_root: &'a Path,
    pub image_root: &'a Path,
    pub output_root: &'a Path,
    pub generation_config: Option<serde_json::Value>,
}

/// Build payloads for every key in the wave, in input order.
#[must_use]
pub fn build_record_payloads(keys: &[RecordKey], inputs: &BuildInputs<'_>) -> Vec<RecordPayload> {
    keys.iter()
        .map(|key| {
            let previous_context = predecessor_context(key, inputs);
            RecordPayload {
                key: key.to_string(),
                prompt: inputs.template.render(previous_context.as_deref()),
                image_path: key.image_path(inputs.image_root),
                generation_config: inputs.generation_config.clone(),
            }
        })
        .collect()
}

/// Formatted context from the immediately preceding labelled page, if
/// that page is Done.
fn predecessor_context(key: &RecordKey, inputs: &BuildInputs<'_>) -> Option<String> {
    let predecessor = preceding_labelled_page(key, inputs.label_root)?;
    let output_path = predecessor.output_path(inputs.output_root);
    if !output_path.exists() {
        return None;
    }

    let raw = match std::fs::read_to_string(&output_path) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(
                record_key = %key,
                predecessor = %predecessor,
                error = %e,
                "Cannot read predecessor output; rendering without context"
            );
            return None;
        }
    };
    match serde_json::from_str::<CatalogPage>(&raw) {
        Ok(page) => Some(format_previous_context(&page)),
        Err(e) => {
            tracing::warn!(
                record_key = %key,
                predecessor = %predecessor,
                error = %e,
                "Predecessor output is not a valid artifact; rendering without context"
            );
            None
        }
    }
}

/// The highest labelled page below the key's page within the same
/// book. Page `0` labels are invalid and never count as predecessors.
fn preceding_labelled_page(key: &RecordKey, label_root: &Path) -> Option<RecordKey> {
    let book_dir = label_root
        .join(key.state())
        .join(key.school())
        .join(key.year().to_string());
    let entries = std::fs::read_dir(&book_dir).ok()?;

    let pages: BTreeSet<u32> = entries
        .filter_map(std::result::Result::ok)
        .filter_map(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|stem| stem.parse::<u32>().ok())
        })
        .filter(|page| *page > 0)
        .collect();

    let predecessor = pages.range(..key.page()).next_back().copied()?;
    key.sibling(predecessor).ok()
}
