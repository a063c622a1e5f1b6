//! Series level: identity is `SeriesInstanceUID`, parent is Study.

use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use sqlx::{Any, Transaction};

use super::dataset_string;

pub const TABLE: &str = "series";

pub async fn upsert(
	tx: &mut Transaction<'_, Any>,
	ds: &InMemDicomObject,
	study_instance_uid: &str,
) -> anyhow::Result<String> {
	let series_instance_uid = dataset_string(ds, tags::SERIES_INSTANCE_UID)
		.ok_or_else(|| anyhow::anyhow!("missing SeriesInstanceUID"))?;

	let existing: Option<(String,)> =
		sqlx::query_as("SELECT series_instance_uid FROM series WHERE series_instance_uid = ?")
			.bind(&series_instance_uid)
			.fetch_optional(&mut **tx)
			.await?;
	if existing.is_some() {
		return Ok(series_instance_uid);
	}

	sqlx::query(
		"INSERT INTO series (series_instance_uid, study_instance_uid, modality, series_number)
		 VALUES (?, ?, ?, ?)",
	)
	.bind(&series_instance_uid)
	.bind(study_instance_uid)
	.bind(dataset_string(ds, tags::MODALITY))
	.bind(dataset_string(ds, tags::SERIES_NUMBER))
	.execute(&mut **tx)
	.await?;

	Ok(series_instance_uid)
}
