//! Metadata normalization: raw upstream record → [`ContentObject`].
//!
//! The untyped upstream shape stops here. Everything downstream of
//! [`normalize_record`] works with strongly typed objects.
//!
//! `text_blob` is built from the descriptive attributes (title, description,
//! tags, field names), lower-cased with whitespace collapsed. Project and
//! owner are indexed lexically through their own full-text columns so that a
//! change of ownership never invalidates the embedding.

use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

use crate::error::FinderError;
use crate::models::{ContentObject, NamedValue, ObjectType, RawRecord};

/// Normalize one raw record.
///
/// Missing optional attributes default to empty. A missing or blank
/// `site_id`, `object_type`, `object_id` or `title` is a
/// [`FinderError::Validation`]. When `expected_site` is set, records for any
/// other site are rejected the same way.
pub fn normalize_record(
    raw: &RawRecord,
    expected_site: Option<&str>,
) -> Result<ContentObject, FinderError> {
    let site_id = required(&raw.site_id, "site_id")?;
    let object_type: ObjectType = required(&raw.object_type, "object_type")?.parse()?;
    let object_id = required(&raw.object_id, "object_id")?;
    let title = collapse_whitespace(&required(&raw.title, "title")?);

    if let Some(expected) = expected_site {
        if site_id != expected {
            return Err(FinderError::validation(
                "site_id",
                format!("record belongs to site '{}', run is scoped to '{}'", site_id, expected),
            ));
        }
    }

    let description = raw
        .description
        .as_deref()
        .map(collapse_whitespace)
        .filter(|d| !d.is_empty());

    let tags: BTreeSet<String> = names(raw.tags.as_deref()).collect();
    let fields: Vec<String> = names(raw.fields.as_deref()).collect();

    let project_name = optional(&raw.project_name);
    let owner = optional(&raw.owner);
    let url = raw.url.as_deref().map(str::trim).unwrap_or_default().to_string();

    let text_blob = to_text_blob(&title, description.as_deref(), &tags, &fields);
    let text_hash = sha256_hex([text_blob.as_str()]);

    let tag_list = tags.iter().cloned().collect::<Vec<_>>().join("\u{1f}");
    let field_list = fields.join("\u{1f}");
    let record_hash = sha256_hex([
        title.as_str(),
        description.as_deref().unwrap_or_default(),
        tag_list.as_str(),
        field_list.as_str(),
        project_name.as_str(),
        owner.as_str(),
        url.as_str(),
        text_hash.as_str(),
    ]);

    Ok(ContentObject {
        site_id,
        object_type,
        object_id,
        title,
        description,
        tags,
        fields,
        project_name,
        owner,
        url,
        text_blob,
        text_hash,
        record_hash,
        embedding: None,
        updated_at: None,
        is_active: true,
    })
}

/// Canonical searchable text for an object.
///
/// A pure function of its inputs: identical inputs always produce an
/// identical blob.
pub fn to_text_blob(
    title: &str,
    description: Option<&str>,
    tags: &BTreeSet<String>,
    fields: &[String],
) -> String {
    let tags = tags.iter().map(String::as_str).collect::<Vec<_>>().join(" ");
    let fields = fields.join(" ");
    let parts = [title, description.unwrap_or_default(), &tags, &fields];

    let joined = parts
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    collapse_whitespace(&joined).to_lowercase()
}

fn required(value: &Option<String>, field: &str) -> Result<String, FinderError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        Some(_) => Err(FinderError::validation(field, "must not be blank")),
        None => Err(FinderError::validation(field, "is required")),
    }
}

fn optional(value: &Option<String>) -> String {
    value.as_deref().map(collapse_whitespace).unwrap_or_default()
}

fn names(values: Option<&[NamedValue]>) -> impl Iterator<Item = String> + '_ {
    values
        .unwrap_or_default()
        .iter()
        .map(|v| collapse_whitespace(v.name()))
        .filter(|n| !n.is_empty())
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Hex SHA-256 over `parts`, each terminated by a NUL so that adjacent
/// parts cannot alias.
pub fn sha256_hex<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}
