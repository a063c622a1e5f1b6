//! Hierarchical query/indexing engine: projects incoming instances into the
//! Patient -> Study -> Series -> Instance hierarchy and translates
//! attribute-level queries into relational filters.

pub mod engine;
pub mod filters;
pub mod instance;
pub mod models;
pub mod patient;
pub mod series;
pub mod study;

use dicom::core::Tag;
use dicom::object::InMemDicomObject;

/// Reads `tag` off `ds` as a trimmed string, or `None` if absent/empty.
/// DICOM pads string values to an even length with a trailing space; that
/// padding is not part of the logical value.
pub fn dataset_string(ds: &InMemDicomObject, tag: Tag) -> Option<String> {
	let value = ds.element(tag).ok()?.to_str().ok()?.trim().to_string();
	if value.is_empty() {
		None
	} else {
		Some(value)
	}
}
