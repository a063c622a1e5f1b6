//! Study level: identity is `StudyInstanceUID`, parent is Patient.

use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use sqlx::{Any, Transaction};

use super::dataset_string;

pub const TABLE: &str = "study";

pub async fn upsert(
	tx: &mut Transaction<'_, Any>,
	ds: &InMemDicomObject,
	patient_id: &str,
) -> anyhow::Result<String> {
	let study_instance_uid = dataset_string(ds, tags::STUDY_INSTANCE_UID)
		.ok_or_else(|| anyhow::anyhow!("missing StudyInstanceUID"))?;

	let existing: Option<(String,)> =
		sqlx::query_as("SELECT study_instance_uid FROM study WHERE study_instance_uid = ?")
			.bind(&study_instance_uid)
			.fetch_optional(&mut **tx)
			.await?;
	if existing.is_some() {
		return Ok(study_instance_uid);
	}

	sqlx::query(
		"INSERT INTO study
			(study_instance_uid, patient_id, study_date, study_time, accession_number, study_id,
			 study_description, referring_physician_name, physicians_of_record,
			 admitting_diagnoses_description, patient_age, patient_size, patient_weight,
			 occupation, additional_patient_history)
		 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
	)
	.bind(&study_instance_uid)
	.bind(patient_id)
	.bind(dataset_string(ds, tags::STUDY_DATE))
	.bind(dataset_string(ds, tags::STUDY_TIME))
	.bind(dataset_string(ds, tags::ACCESSION_NUMBER))
	.bind(dataset_string(ds, tags::STUDY_ID))
	.bind(dataset_string(ds, tags::STUDY_DESCRIPTION))
	.bind(dataset_string(ds, tags::REFERRING_PHYSICIAN_NAME))
	.bind(dataset_string(ds, tags::PHYSICIANS_OF_RECORD))
	.bind(dataset_string(ds, tags::ADMITTING_DIAGNOSES_DESCRIPTION))
	.bind(dataset_string(ds, tags::PATIENT_AGE))
	.bind(dataset_string(ds, tags::PATIENT_SIZE))
	.bind(dataset_string(ds, tags::PATIENT_WEIGHT))
	.bind(dataset_string(ds, tags::OCCUPATION))
	.bind(dataset_string(ds, tags::ADDITIONAL_PATIENT_HISTORY))
	.execute(&mut **tx)
	.await?;

	Ok(study_instance_uid)
}
