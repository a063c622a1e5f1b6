//! Tag-indexed attribute mapping: each level holds a static table from a
//! 32-bit attribute tag to `(field name, value-representation family)`. The
//! filter builder in `filters.rs` dispatches on the VR family via this
//! tagged variant rather than on the underlying DICOM VR code directly.

use dicom::core::{Tag, VR};
use dicom::dictionary_std::tags;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vr {
	/// `AE, CS, LO, LT, PN, SH, ST, UC, UR, UT, UI`
	Text,
	/// `DA`
	Date,
	/// `TM`
	Time,
	/// `DT`
	DateTime,
	/// `AS, DS, IS` and anything else this engine has no filter semantics
	/// for. Echoed back on a response but rejected as a C-FIND filter.
	Unsupported,
}

#[derive(Debug, Clone, Copy)]
pub struct AttributeMapping {
	pub tag: Tag,
	pub column: &'static str,
	pub vr: Vr,
	/// The concrete DICOM VR used to encode this attribute on a response
	/// dataset; `vr` above is only the filter-dispatch family.
	pub dicom_vr: VR,
}

const fn m(tag: Tag, column: &'static str, vr: Vr, dicom_vr: VR) -> AttributeMapping {
	AttributeMapping {
		tag,
		column,
		vr,
		dicom_vr,
	}
}

pub static PATIENT_ATTRIBUTES: &[AttributeMapping] = &[
	m(tags::PATIENT_ID, "patient_id", Vr::Text, VR::LO),
	m(tags::PATIENT_NAME, "patient_name", Vr::Text, VR::PN),
	m(tags::PATIENT_SEX, "patient_sex", Vr::Text, VR::CS),
	m(tags::PATIENT_BIRTH_DATE, "patient_birth_date", Vr::Date, VR::DA),
	m(tags::PATIENT_BIRTH_TIME, "patient_birth_time", Vr::Time, VR::TM),
	m(tags::OTHER_PATIENT_NAMES, "other_patient_names", Vr::Text, VR::PN),
	m(tags::ETHNIC_GROUP, "ethnic_group", Vr::Text, VR::SH),
	m(tags::PATIENT_COMMENTS, "patient_comments", Vr::Text, VR::LT),
];

pub static STUDY_ATTRIBUTES: &[AttributeMapping] = &[
	m(tags::STUDY_INSTANCE_UID, "study_instance_uid", Vr::Text, VR::UI),
	m(tags::STUDY_DATE, "study_date", Vr::Date, VR::DA),
	m(tags::STUDY_TIME, "study_time", Vr::Time, VR::TM),
	m(tags::ACCESSION_NUMBER, "accession_number", Vr::Text, VR::SH),
	m(tags::STUDY_ID, "study_id", Vr::Text, VR::SH),
	m(tags::STUDY_DESCRIPTION, "study_description", Vr::Text, VR::LO),
	m(
		tags::REFERRING_PHYSICIAN_NAME,
		"referring_physician_name",
		Vr::Text,
		VR::PN,
	),
	m(
		tags::PHYSICIANS_OF_RECORD,
		"physicians_of_record",
		Vr::Text,
		VR::PN,
	),
	m(
		tags::ADMITTING_DIAGNOSES_DESCRIPTION,
		"admitting_diagnoses_description",
		Vr::Text,
		VR::LO,
	),
	m(tags::PATIENT_AGE, "patient_age", Vr::Unsupported, VR::AS),
	m(tags::PATIENT_SIZE, "patient_size", Vr::Unsupported, VR::DS),
	m(tags::PATIENT_WEIGHT, "patient_weight", Vr::Unsupported, VR::DS),
	m(tags::OCCUPATION, "occupation", Vr::Text, VR::SH),
	m(
		tags::ADDITIONAL_PATIENT_HISTORY,
		"additional_patient_history",
		Vr::Text,
		VR::LT,
	),
];

pub static SERIES_ATTRIBUTES: &[AttributeMapping] = &[
	m(tags::SERIES_INSTANCE_UID, "series_instance_uid", Vr::Text, VR::UI),
	m(tags::MODALITY, "modality", Vr::Text, VR::CS),
	m(tags::SERIES_NUMBER, "series_number", Vr::Unsupported, VR::IS),
];

pub static INSTANCE_ATTRIBUTES: &[AttributeMapping] = &[
	m(tags::SOP_INSTANCE_UID, "sop_instance_uid", Vr::Text, VR::UI),
	m(tags::INSTANCE_NUMBER, "instance_number", Vr::Unsupported, VR::IS),
	m(tags::SOP_CLASS_UID, "sop_class_uid", Vr::Text, VR::UI),
];

/// `TransferSyntaxUID` and the stored container identifier are entity
/// columns per the data model but are not DIMSE-queryable attributes (no
/// standard tag is defined for "the transfer syntax an instance was stored
/// with" at the dataset level) — they are written at C-STORE time and read
/// back only by the storage/C-MOVE layer, never by C-FIND.
pub const TRANSFER_SYNTAX_COLUMN: &str = "transfer_syntax_uid";
pub const CONTAINER_IDENTIFIER_COLUMN: &str = "container_identifier";

pub fn mapping_for_level(level: crate::types::QueryRetrieveLevel) -> &'static [AttributeMapping] {
	use crate::types::QueryRetrieveLevel as L;
	match level {
		L::Patient => PATIENT_ATTRIBUTES,
		L::Study => STUDY_ATTRIBUTES,
		L::Series => SERIES_ATTRIBUTES,
		L::Image | L::Frame => INSTANCE_ATTRIBUTES,
	}
}

/// Aggregate attributes requiring string-aggregation across a child join.
pub static MODALITIES_IN_STUDY: Tag = tags::MODALITIES_IN_STUDY;
pub static SOP_CLASSES_IN_STUDY: Tag = tags::SOP_CLASSES_IN_STUDY;

/// Aggregate attributes requiring `COUNT` over a child join.
pub static NUMBER_OF_PATIENT_RELATED_STUDIES: Tag = tags::NUMBER_OF_PATIENT_RELATED_STUDIES;
pub static NUMBER_OF_PATIENT_RELATED_SERIES: Tag = tags::NUMBER_OF_PATIENT_RELATED_SERIES;
pub static NUMBER_OF_PATIENT_RELATED_INSTANCES: Tag = tags::NUMBER_OF_PATIENT_RELATED_INSTANCES;
pub static NUMBER_OF_STUDY_RELATED_SERIES: Tag = tags::NUMBER_OF_STUDY_RELATED_SERIES;
pub static NUMBER_OF_STUDY_RELATED_INSTANCES: Tag = tags::NUMBER_OF_STUDY_RELATED_INSTANCES;
pub static NUMBER_OF_SERIES_RELATED_INSTANCES: Tag = tags::NUMBER_OF_SERIES_RELATED_INSTANCES;

pub fn is_aggregate_tag(tag: Tag) -> bool {
	tag == MODALITIES_IN_STUDY
		|| tag == SOP_CLASSES_IN_STUDY
		|| tag == NUMBER_OF_PATIENT_RELATED_STUDIES
		|| tag == NUMBER_OF_PATIENT_RELATED_SERIES
		|| tag == NUMBER_OF_PATIENT_RELATED_INSTANCES
		|| tag == NUMBER_OF_STUDY_RELATED_SERIES
		|| tag == NUMBER_OF_STUDY_RELATED_INSTANCES
		|| tag == NUMBER_OF_SERIES_RELATED_INSTANCES
}

/// Never used as a same-level filter: the QR-level tag itself, the
/// character-set tag, and every aggregate/count tag.
pub fn is_excluded_from_filtering(tag: Tag) -> bool {
	tag == tags::QUERY_RETRIEVE_LEVEL || tag == tags::SPECIFIC_CHARACTER_SET || is_aggregate_tag(tag)
}
