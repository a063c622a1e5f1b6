//! Patient level: identity is `PatientID` alone.
//!
//! A soft match on name/sex/birth-date in addition to `PatientID` can insert
//! a duplicate key when the same `PatientID` arrives with differing
//! demographics, so this dedup lookup treats `PatientID` as the sole
//! identity.

use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use sqlx::{Any, Transaction};

use super::dataset_string;

pub const TABLE: &str = "patient";

/// Upserts the Patient row keyed on `PatientID`. An existing row's attribute
/// values are left unchanged on a repeat C-STORE even if the incoming
/// dataset carries different demographics for the same identity — this
/// mirrors documented source behavior rather than silently "fixing" it.
pub async fn upsert(tx: &mut Transaction<'_, Any>, ds: &InMemDicomObject) -> anyhow::Result<String> {
	let patient_id =
		dataset_string(ds, tags::PATIENT_ID).ok_or_else(|| anyhow::anyhow!("missing PatientID"))?;

	let existing: Option<(String,)> =
		sqlx::query_as("SELECT patient_id FROM patient WHERE patient_id = ?")
			.bind(&patient_id)
			.fetch_optional(&mut **tx)
			.await?;
	if existing.is_some() {
		return Ok(patient_id);
	}

	sqlx::query(
		"INSERT INTO patient
			(patient_id, patient_name, patient_sex, patient_birth_date, patient_birth_time,
			 other_patient_names, ethnic_group, patient_comments)
		 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
	)
	.bind(&patient_id)
	.bind(dataset_string(ds, tags::PATIENT_NAME))
	.bind(dataset_string(ds, tags::PATIENT_SEX))
	.bind(dataset_string(ds, tags::PATIENT_BIRTH_DATE))
	.bind(dataset_string(ds, tags::PATIENT_BIRTH_TIME))
	.bind(dataset_string(ds, tags::OTHER_PATIENT_NAMES))
	.bind(dataset_string(ds, tags::ETHNIC_GROUP))
	.bind(dataset_string(ds, tags::PATIENT_COMMENTS))
	.execute(&mut **tx)
	.await?;

	Ok(patient_id)
}
