//! Result ingestion: validated artifacts out, failure diagnostics in.
//!
//! Given a downloaded result set and the batch's expected keys, each
//! record either lands as an atomically written artifact under the
//! output root or becomes a failure-count bump plus a failure-log row
//! that preserves the raw payloads. Re-ingesting a result set is
//! idempotent: keys whose output file already exists are skipped
//! without touching the counters.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

use ocrbatch_state::StateStore;
use ocrbatch_types::{
    BatchId, CatalogPage, ErrorKind, FailureLogRow, RecordKey, RecordOutcome, RecordResult,
};

use crate::summary::WaveReport;

/// Model/prompt identity stamped onto every failure-log row.
#[derive(Debug, Clone, Default)]
pub struct Provenance {
    pub model_name: String,
    pub prompt_name: String,
    pub prompt_template: String,
    pub generation_config: Option<String>,
}

/// Why a response failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFailure {
    pub kind: ErrorKind,
    pub message: String,
    /// The JSON candidate that was attempted, when one was found.
    pub extracted_text: Option<String>,
}

/// Concatenate the text parts of the first candidate.
///
/// # Errors
///
/// Returns a [`ValidationFailure`] with kind `other` when the response
/// has no candidates or the parts carry no text.
pub fn extract_text_from_response(
    response: &serde_json::Value,
) -> Result<String, ValidationFailure> {
    let parts = response
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| ValidationFailure {
            kind: ErrorKind::Other,
            message: "No candidates in response".to_string(),
            extracted_text: None,
        })?;

    let text: String = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(serde_json::Value::as_str))
        .collect();
    let text = text.trim().to_string();
    if text.is_empty() {
        return Err(ValidationFailure {
            kind: ErrorKind::Other,
            message: "Empty text in response parts".to_string(),
            extracted_text: None,
        });
    }
    Ok(text)
}

/// Parse model output as JSON, tolerating markdown code fences and
/// leading/trailing prose around the object.
///
/// # Errors
///
/// Returns a [`ValidationFailure`] with kind `json_decode_error` when
/// no JSON object can be recovered.
pub fn parse_json_from_text(text: &str) -> Result<serde_json::Value, ValidationFailure> {
    let mut stripped = text.trim();
    if stripped.starts_with("```") {
        let lines: Vec<&str> = stripped.lines().collect();
        if lines.len() >= 3 && lines[0].starts_with("```") && lines[lines.len() - 1].starts_with("```")
        {
            // Borrow the interior without the fence lines.
            let start = lines[0].len();
            let end = stripped.len() - lines[lines.len() - 1].len();
            stripped = stripped[start..end].trim();
        }
    }

    let initial = match serde_json::from_str(stripped) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };

    // Fall back to the outermost brace window.
    let (Some(start), Some(end)) = (stripped.find('{'), stripped.rfind('}')) else {
        return Err(ValidationFailure {
            kind: ErrorKind::JsonDecodeError,
            message: format!("No JSON object found in model output: {initial}"),
            extracted_text: None,
        });
    };
    if end <= start {
        return Err(ValidationFailure {
            kind: ErrorKind::JsonDecodeError,
            message: format!("No JSON object found in model output: {initial}"),
            extracted_text: None,
        });
    }
    let candidate = &stripped[start..=end];
    serde_json::from_str(candidate).map_err(|e| ValidationFailure {
        kind: ErrorKind::JsonDecodeError,
        message: e.to_string(),
        extracted_text: Some(candidate.to_string()),
    })
}

/// Validate a raw response into a [`CatalogPage`] artifact.
///
/// # Errors
///
/// Returns a [`ValidationFailure`] classifying the defect and
/// preserving the extracted text for offline analysis.
pub fn validate_response(
    response: &serde_json::Value,
) -> Result<(CatalogPage, String), ValidationFailure> {
    let text = extract_text_from_response(response)?;
    let payload = parse_json_from_text(&text)?;
    let extracted = payload.to_string();
    match serde_json::from_value::<CatalogPage>(payload) {
        Ok(page) => Ok((page, text)),
        Err(e) => Err(ValidationFailure {
            kind: ErrorKind::SchemaValidationError,
            message: e.to_string(),
            extracted_text: Some(extracted),
        }),
    }
}

/// Write the artifact via temp-file-then-rename so readers never see a
/// partial file.
///
/// # Errors
///
/// Returns an error on any filesystem failure.
pub fn write_artifact(path: &Path, page: &CatalogPage) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("artifact path has no parent: {}", path.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("creating output directory {}", parent.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("creating temp file in {}", parent.display()))?;
    serde_json::to_writer_pretty(&mut tmp, page).context("serializing artifact")?;
    tmp.write_all(b"\n").context("writing artifact")?;
    tmp.persist(path)
        .with_context(|| format!("renaming artifact into place at {}", path.display()))?;
    Ok(())
}

/// Ingest one downloaded result set.
///
/// Every non-success becomes a failure-count bump plus a log row; the
/// caller finalizes the batch afterwards, so a crash mid-ingest is
/// repaired by re-polling and re-ingesting.
///
/// # Errors
///
/// Propagates state-store failures and artifact-write failures; both
/// leave the batch active for a later retry.
pub fn ingest_results(
    store: &dyn StateStore,
    batch_id: &BatchId,
    expected_keys: &[String],
    output_root: &Path,
    provenance: &Provenance,
    results: &[RecordResult],
) -> Result<WaveReport> {
    let expected: BTreeSet<&str> = expected_keys.iter().map(String::as_str).collect();
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut report = WaveReport {
        batch_id: batch_id.to_string(),
        ..WaveReport::default()
    };

    for result in results {
        if !expected.contains(result.key.as_str()) {
            tracing::warn!(
                batch_id = %batch_id,
                record_key = %result.key,
                "Result for key not in this batch"
            );
            store.append_failure_log(
                &FailureLogRow::new(
                    result.key.as_str(),
                    batch_id.as_str(),
                    0,
                    ErrorKind::ResultKeyMismatch,
                )
                .with_message("result key not among the batch's submitted keys"),
            )?;
            *report
                .by_kind
                .entry(ErrorKind::ResultKeyMismatch.as_str().to_string())
                .or_insert(0) += 1;
            continue;
        }

        if !seen.insert(result.key.clone()) {
            tracing::warn!(
                batch_id = %batch_id,
                record_key = %result.key,
                "Duplicate result record ignored"
            );
            continue;
        }
        report.total += 1;

        let key = match RecordKey::parse(&result.key) {
            Ok(key) => key,
            Err(e) => {
                // A malformed key is contained as one dead-letterable
                // record; it must never abort the whole run.
                record_failure(
                    store,
                    &mut report,
                    batch_id,
                    &result.key,
                    ErrorKind::Other,
                    format!("submitted key is malformed: {e}"),
                    None,
                    None,
                    None,
                    provenance,
                )?;
                continue;
            }
        };
        let output_path = key.output_path(output_root);
        if output_path.exists() {
            // Already Done from a previous (crashed) ingest pass.
            report.successes += 1;
            report.outcomes.push(RecordOutcome::success(result.key.as_str()));
            continue;
        }

        if let Some(error) = &result.error {
            record_failure(
                store,
                &mut report,
                batch_id,
                &result.key,
                ErrorKind::ServiceError,
                error.to_string(),
                None,
                None,
                Some(error.to_string()),
                provenance,
            )?;
            continue;
        }

        let Some(response) = &result.response else {
            record_failure(
                store,
                &mut report,
                batch_id,
                &result.key,
                ErrorKind::MissingResponse,
                "record carried neither response nor error".to_string(),
                None,
                None,
                None,
                provenance,
            )?;
            continue;
        };

        match validate_response(response) {
            Ok((page, _text)) => {
                write_artifact(&output_path, &page)?;
                tracing::info!(
                    batch_id = %batch_id,
                    record_key = %result.key,
                    path = %output_path.display(),
                    "Artifact written"
                );
                report.successes += 1;
                report.outcomes.push(RecordOutcome::success(result.key.as_str()));
            }
            Err(failure) => {
                let raw_text = extract_text_from_response(response).ok();
                record_failure(
                    store,
                    &mut report,
                    batch_id,
                    &result.key,
                    failure.kind,
                    failure.message,
                    raw_text,
                    failure.extracted_text,
                    Some(response.to_string()),
                    provenance,
                )?;
            }
        }
    }

    for key in expected_keys {
        if seen.contains(key) {
            continue;
        }
        report.total += 1;
        record_failure(
            store,
            &mut report,
            batch_id,
            key,
            ErrorKind::MissingInResult,
            "expected key absent from result set".to_string(),
            None,
            None,
            None,
            provenance,
        )?;
    }

    report.failing.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    Ok(report)
}

#[allow(clippy::too_many_arguments)]
fn record_failure(
    store: &dyn StateStore,
    report: &mut WaveReport,
    batch_id: &BatchId,
    key: &str,
    kind: ErrorKind,
    message: String,
    raw_text: Option<String>,
    extracted: Option<String>,
    raw_blob: Option<String>,
    provenance: &Provenance,
) -> Result<()> {
    let attempt = store.bump_failure(key)?;
    store.append_failure_log(
        &FailureLogRow::new(key, batch_id.as_str(), attempt, kind)
            .with_message(message.clone())
            .with_payloads(raw_text, extracted, raw_blob)
            .with_provenance(
                provenance.model_name.clone(),
                provenance.prompt_name.clone(),
                provenance.prompt_template.clone(),
                provenance.generation_config.clone(),
            ),
    )?;
    tracing::warn!(
        batch_id = %batch_id,
        record_key = key,
        error_kind = kind.as_str(),
        attempt,
        "Record failed: {message}"
    );

    report.failures += 1;
    *report
        .by_kind
        .entry(kind.as_str().to_string())
        .or_insert(0) += 1;
    report.failing.push((key.to_string(), attempt));
    report.outcomes.push(RecordOutcome::failure(key, message));
    Ok(())
}
