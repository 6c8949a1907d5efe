//! Form geometry: the observed shape of a live form page, and scoring of
//! configured form styles against it.
//!
//! Geometry is fetched by the executor (label text, page position and input
//! kind for each visible question) and cached per URL. Styles are ranked
//! with a deterministic score; the attached reason strings are advisory,
//! for administrators choosing between candidates.

use serde::{Deserialize, Serialize};

use crate::core::types::{FieldKind, FormStyle, SubField};

/// One visible question on a form page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeometryField {
    pub index: usize,
    pub title: String,
    pub kind: FieldKind,
}

/// The observed field geometry of a form URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormGeometry {
    pub auth_required: bool,
    pub fields: Vec<GeometryField>,
}

/// A ranked candidate style for a form geometry.
#[derive(Debug, Clone, Serialize)]
pub struct StyleMatch {
    pub style_id: String,
    pub style_name: String,
    pub score: u32,
    pub reason: String,
}

/// Whether `field` is covered by `sub`: same page index, same input kind,
/// and the configured label segment appears somewhere in the live title.
fn covers(sub: &SubField, field: &GeometryField) -> bool {
    sub.index_on_page == field.index
        && sub.kind == field.kind
        && field.title.contains(&sub.expected_label_segment)
}

/// Score every style against `geometry` and return candidates ranked best
/// first. The score is the per-mille coverage of the geometry's fields, with
/// a +1000 bonus when the style matches the geometry exactly (same field
/// count, every field covered in order). Styles covering nothing are
/// dropped; an empty result means no candidate and the caller falls back to
/// manual configuration. Ties break on style name so the ranking is stable.
pub fn score_styles(geometry: &FormGeometry, styles: &[FormStyle]) -> Vec<StyleMatch> {
    let mut matches = Vec::new();

    for style in styles {
        if style.sub_fields.is_empty() || geometry.fields.is_empty() {
            continue;
        }
        let covered = geometry
            .fields
            .iter()
            .filter(|field| style.sub_fields.iter().any(|sub| covers(sub, field)))
            .count();
        if covered == 0 {
            continue;
        }
        let total = geometry.fields.len();
        let mut score = (covered * 1000 / total) as u32;
        let exact = covered == total
            && style.sub_fields.len() == total
            && geometry
                .fields
                .iter()
                .zip(style.sub_fields.iter())
                .all(|(field, sub)| covers(sub, field));
        let reason = if exact {
            score += 1000;
            "identical field count and order".to_string()
        } else if covered == total {
            format!("all {} fields matched (extra fields in style)", total)
        } else {
            format!("{} of {} fields matched", covered, total)
        };
        matches.push(StyleMatch {
            style_id: style.id.clone(),
            style_name: style.name.clone(),
            score,
            reason,
        });
    }

    matches.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| a.style_name.cmp(&b.style_name))
    });
    matches
}

/// Build blank sub-fields for every detected question, used when an
/// administrator starts configuring a style from scratch. Dates default to
/// `$today`, text to the empty string, option inputs to the first option.
/// A trailing " *" (required-field marker) is stripped from labels.
pub fn default_fields_from_geometry(geometry: &FormGeometry) -> Vec<SubField> {
    geometry
        .fields
        .iter()
        .map(|field| {
            let label = field
                .title
                .strip_suffix(" *")
                .unwrap_or(&field.title)
                .to_string();
            let target_value = match field.kind {
                FieldKind::Date => "$today",
                FieldKind::Text | FieldKind::LongText => "''",
                FieldKind::MultipleChoice | FieldKind::Checkbox | FieldKind::Dropdown => "0",
            };
            SubField {
                index_on_page: field.index,
                expected_label_segment: label,
                kind: field.kind,
                critical: false,
                target_value: target_value.to_string(),
            }
        })
        .collect()
}
