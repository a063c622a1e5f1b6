//! Instance level: identity is `SOPInstanceUID`, parent is Series.
//!
//! C-STORE is idempotent with respect to identity: re-storing an already
//! present SOP Instance is a no-op at this level (the insert is skipped
//! entirely, same as the levels above it).

use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use sqlx::{Any, Transaction};

use super::dataset_string;

pub const TABLE: &str = "instance";

pub async fn upsert(
	tx: &mut Transaction<'_, Any>,
	ds: &InMemDicomObject,
	series_instance_uid: &str,
	transfer_syntax_uid: &str,
) -> anyhow::Result<String> {
	let sop_instance_uid = dataset_string(ds, tags::SOP_INSTANCE_UID)
		.ok_or_else(|| anyhow::anyhow!("missing SOPInstanceUID"))?;

	let existing: Option<(String,)> =
		sqlx::query_as("SELECT sop_instance_uid FROM instance WHERE sop_instance_uid = ?")
			.bind(&sop_instance_uid)
			.fetch_optional(&mut **tx)
			.await?;
	if existing.is_some() {
		return Ok(sop_instance_uid);
	}

	sqlx::query(
		"INSERT INTO instance
			(sop_instance_uid, series_instance_uid, instance_number, sop_class_uid,
			 transfer_syntax_uid, container_identifier)
		 VALUES (?, ?, ?, ?, ?, ?)",
	)
	.bind(&sop_instance_uid)
	.bind(series_instance_uid)
	.bind(dataset_string(ds, tags::INSTANCE_NUMBER))
	.bind(dataset_string(ds, tags::SOP_CLASS_UID))
	.bind(transfer_syntax_uid)
	.bind(Option::<String>::None)
	.execute(&mut **tx)
	.await?;

	Ok(sop_instance_uid)
}
