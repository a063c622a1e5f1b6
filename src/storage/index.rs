//! Shared storage-files table access. The three backends (in-memory,
//! temp-file, filesystem) each allocate their own locators but share this one
//! table and one `committed` visibility contract, per `storage.py`'s
//! `StorageBase`.

use std::sync::Arc;

use crate::db::Database;

pub struct StorageRow {
	pub sop_instance_uid: String,
	pub sop_class_uid: String,
	pub transfer_syntax_uid: String,
	pub locator: String,
}

pub async fn insert_uncommitted(
	db: &Database,
	row: &StorageRow,
	added_timestamp: &str,
) -> anyhow::Result<()> {
	sqlx::query(
		"INSERT INTO storage_files
			(sop_instance_uid, sop_class_uid, transfer_syntax_uid, locator, added_timestamp, committed)
		 VALUES (?, ?, ?, ?, ?, 0)",
	)
	.bind(&row.sop_instance_uid)
	.bind(&row.sop_class_uid)
	.bind(&row.transfer_syntax_uid)
	.bind(&row.locator)
	.bind(added_timestamp)
	.execute(db.pool())
	.await?;
	Ok(())
}

pub async fn mark_committed(db: &Database, sop_instance_uid: &str) -> anyhow::Result<()> {
	sqlx::query("UPDATE storage_files SET committed = 1 WHERE sop_instance_uid = ?")
		.bind(sop_instance_uid)
		.execute(db.pool())
		.await?;
	Ok(())
}

/// Returns the row's locator so the caller can release it (unlink file,
/// discard buffer) before the row itself is deleted.
pub async fn take_locator(db: &Database, sop_instance_uid: &str) -> anyhow::Result<Option<String>> {
	let row: Option<(String,)> =
		sqlx::query_as("SELECT locator FROM storage_files WHERE sop_instance_uid = ?")
			.bind(sop_instance_uid)
			.fetch_optional(db.pool())
			.await?;
	sqlx::query("DELETE FROM storage_files WHERE sop_instance_uid = ?")
		.bind(sop_instance_uid)
		.execute(db.pool())
		.await?;
	Ok(row.map(|(locator,)| locator))
}

pub struct CommittedRow {
	pub sop_class_uid: String,
	pub transfer_syntax_uid: String,
	pub locator: String,
}

/// Only rows with `committed = 1` are visible, per the storage visibility
/// invariant.
pub async fn committed_rows(
	db: &Database,
	sop_instance_uids: &[String],
) -> anyhow::Result<Vec<(String, CommittedRow)>> {
	if sop_instance_uids.is_empty() {
		return Ok(Vec::new());
	}
	let placeholders = sop_instance_uids
		.iter()
		.map(|_| "?")
		.collect::<Vec<_>>()
		.join(",");
	let query = format!(
		"SELECT sop_instance_uid, sop_class_uid, transfer_syntax_uid, locator
		 FROM storage_files WHERE committed = 1 AND sop_instance_uid IN ({placeholders})"
	);
	let mut q = sqlx::query_as::<_, (String, String, String, String)>(&query);
	for uid in sop_instance_uids {
		q = q.bind(uid);
	}
	let rows = q.fetch_all(db.pool()).await?;
	Ok(rows
		.into_iter()
		.map(|(uid, class, ts, locator)| {
			(
				uid,
				CommittedRow {
					sop_class_uid: class,
					transfer_syntax_uid: ts,
					locator,
				},
			)
		})
		.collect())
}

/// Set-difference against committed rows for Storage Commitment.
pub async fn verify(
	db: &Database,
	pairs: &[(String, String)],
) -> anyhow::Result<(Vec<(String, String)>, Vec<(String, String)>)> {
	let uids: Vec<String> = pairs.iter().map(|(_, uid)| uid.clone()).collect();
	let present = committed_rows(db, &uids).await?;
	let present_uids: std::collections::HashSet<&str> =
		present.iter().map(|(uid, _)| uid.as_str()).collect();

	let mut success = Vec::new();
	let mut failure = Vec::new();
	for (class, uid) in pairs {
		if present_uids.contains(uid.as_str()) {
			success.push((class.clone(), uid.clone()));
		} else {
			failure.push((class.clone(), uid.clone()));
		}
	}
	Ok((success, failure))
}

pub type SharedDatabase = Arc<Database>;
