//! Same-level WHERE-clause construction, dispatched on VR family.
//!
//! Grounded on `pacs/base_api.py`'s filter builder: text attributes get
//! wildcard-translated `LIKE`, date/time/datetime attributes get literal
//! equality or a hyphen-delimited range.

use thiserror::Error;

use super::models::Vr;

pub struct SqlFilter {
	pub fragment: String,
	pub binds: Vec<String>,
}

#[derive(Debug, Error)]
#[error("attribute '{column}' has an unsupported VR and cannot be used as a C-FIND filter")]
pub struct UnsupportedVrError {
	pub column: String,
}

/// Converts DICOM wildcard syntax (`?` single-char, `*` any-run) to SQL
/// `LIKE` syntax (`_`, `%`). Literal `_`/`%` in the source value are escaped
/// with a backslash so they aren't mistaken for wildcards.
fn translate_wildcard(value: &str) -> String {
	let mut out = String::with_capacity(value.len());
	for ch in value.chars() {
		match ch {
			'?' => out.push('_'),
			'*' => out.push('%'),
			'_' => out.push_str("\\_"),
			'%' => out.push_str("\\%"),
			other => out.push(other),
		}
	}
	out
}

/// Splits a DICOM multi-value string (backslash-separated) into its parts.
/// A single value with no backslash returns a one-element vector.
fn split_values(value: &str) -> Vec<&str> {
	value.split('\\').filter(|v| !v.is_empty()).collect()
}

fn text_filter(column: &str, value: &str) -> SqlFilter {
	let values = split_values(value);
	let translated: Vec<String> = values.iter().map(|v| translate_wildcard(v)).collect();
	let fragment = translated
		.iter()
		.map(|_| format!("{column} LIKE ? ESCAPE '\\'"))
		.collect::<Vec<_>>()
		.join(" OR ");
	SqlFilter {
		fragment: format!("({fragment})"),
		binds: translated,
	}
}

/// Literal equality, or a `start-end` range when a hyphen is present. Either
/// side of the range may be empty for a half-open range (`-end`, `start-`).
fn range_filter(column: &str, value: &str) -> SqlFilter {
	if let Some((start, end)) = value.split_once('-') {
		match (start.is_empty(), end.is_empty()) {
			(false, false) => SqlFilter {
				fragment: format!("({column} >= ? AND {column} <= ?)"),
				binds: vec![start.to_string(), end.to_string()],
			},
			(false, true) => SqlFilter {
				fragment: format!("({column} >= ?)"),
				binds: vec![start.to_string()],
			},
			(true, false) => SqlFilter {
				fragment: format!("({column} <= ?)"),
				binds: vec![end.to_string()],
			},
			(true, true) => SqlFilter {
				fragment: "(1 = 1)".to_string(),
				binds: vec![],
			},
		}
	} else {
		SqlFilter {
			fragment: format!("({column} = ?)"),
			binds: vec![value.to_string()],
		}
	}
}

/// Builds a same-level WHERE fragment against `qualified_column` (e.g.
/// `"patient.patient_name"`) given the request's raw attribute value.
/// Returns `Ok(None)` for an empty value (Universal Matching: the attribute
/// is echoed back but not filtered on). Returns `Err` if `vr` has no filter
/// semantics defined (`Vr::Unsupported`), even when `value` is non-empty.
pub fn build_filter(
	vr: Vr,
	qualified_column: &str,
	value: &str,
) -> Result<Option<SqlFilter>, UnsupportedVrError> {
	if value.is_empty() {
		return Ok(None);
	}
	match vr {
		Vr::Text => Ok(Some(text_filter(qualified_column, value))),
		Vr::Date | Vr::Time | Vr::DateTime => Ok(Some(range_filter(qualified_column, value))),
		Vr::Unsupported => Err(UnsupportedVrError {
			column: qualified_column.to_string(),
		}),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn wildcard_star_translates_to_percent() {
		let filter = build_filter(Vr::Text, "patient.patient_name", "Test^*").unwrap().unwrap();
		assert_eq!(filter.binds, vec!["Test^%"]);
	}

	#[test]
	fn wildcard_question_mark_translates_to_underscore() {
		let filter = build_filter(Vr::Text, "patient.patient_name", "Test?").unwrap().unwrap();
		assert_eq!(filter.binds, vec!["Test_"]);
	}

	#[test]
	fn list_value_becomes_ored_like_clauses() {
		let filter = build_filter(Vr::Text, "patient.patient_name", "Test1\\Test2")
			.unwrap()
			.unwrap();
		assert_eq!(filter.binds, vec!["Test1", "Test2"]);
		assert!(filter.fragment.contains("OR"));
	}

	#[test]
	fn date_without_hyphen_is_literal_equality() {
		let filter = build_filter(Vr::Date, "patient.patient_birth_date", "19650101")
			.unwrap()
			.unwrap();
		assert_eq!(filter.fragment, "(patient.patient_birth_date = ?)");
		assert_eq!(filter.binds, vec!["19650101"]);
	}

	#[test]
	fn date_range_is_inclusive_both_ends() {
		let filter = build_filter(Vr::Date, "patient.patient_birth_date", "19650101-19660102")
			.unwrap()
			.unwrap();
		assert_eq!(filter.binds, vec!["19650101", "19660102"]);
		assert!(filter.fragment.contains(">="));
		assert!(filter.fragment.contains("<="));
	}

	#[test]
	fn empty_value_is_universal_matching() {
		assert!(build_filter(Vr::Text, "patient.patient_name", "").unwrap().is_none());
	}

	#[test]
	fn unsupported_vr_is_rejected_even_with_a_value() {
		assert!(build_filter(Vr::Unsupported, "study.patient_age", "035Y").is_err());
	}

	#[test]
	fn unsupported_vr_with_empty_value_is_still_universal_matching() {
		assert!(build_filter(Vr::Unsupported, "study.patient_age", "").unwrap().is_none());
	}
}
