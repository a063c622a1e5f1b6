//! Database access: pool, migrations, and the atomic-transaction contract
//! that the query engine and storage index run their CRUD through.
//!
//! Grounded on `db.py`'s `Database` component: one pool, one
//! `create_tables`/`atomic` surface, and a portable string-aggregation
//! dispatch so `ModalitiesInStudy`/`SOPClassesInStudy` aggregation works
//! against either backend.

use sqlx::any::{AnyConnectOptions, AnyPoolOptions};
use sqlx::{Any, AnyPool, Transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
	Sqlite,
	Postgres,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DatabaseConfig {
	pub url: String,
	pub max_connections: u32,
}

impl Default for DatabaseConfig {
	fn default() -> Self {
		Self {
			url: "sqlite::memory:".to_string(),
			max_connections: 5,
		}
	}
}

pub struct Database {
	pool: AnyPool,
	backend: Backend,
}

impl Database {
	pub async fn connect(config: &DatabaseConfig) -> anyhow::Result<Self> {
		sqlx::any::install_default_drivers();

		let backend = if config.url.starts_with("postgres") {
			Backend::Postgres
		} else {
			Backend::Sqlite
		};

		let options: AnyConnectOptions = config.url.parse()?;
		let pool = AnyPoolOptions::new()
			.max_connections(config.max_connections)
			.connect_with(options)
			.await?;

		let db = Self { pool, backend };
		db.migrate().await?;
		Ok(db)
	}

	pub fn pool(&self) -> &AnyPool {
		&self.pool
	}

	pub fn backend(&self) -> Backend {
		self.backend
	}

	/// The portable string-aggregation function name: `group_concat` for
	/// SQLite, `string_agg` for Postgres.
	pub fn string_agg_fn(&self) -> &'static str {
		match self.backend {
			Backend::Sqlite => "group_concat",
			Backend::Postgres => "string_agg",
		}
	}

	pub async fn begin(&self) -> anyhow::Result<Transaction<'_, Any>> {
		Ok(self.pool.begin().await?)
	}

	/// Creates the four entity tables plus the storage-files table, with
	/// indices on every queryable attribute. `sop_class_uid` on
	/// `storage_files` is intentionally non-unique (many instances share a
	/// SOP class) and merely indexed.
	async fn migrate(&self) -> anyhow::Result<()> {
		let statements = [
			"CREATE TABLE IF NOT EXISTS patient (
				patient_id TEXT PRIMARY KEY,
				patient_name TEXT,
				patient_sex TEXT,
				patient_birth_date TEXT,
				patient_birth_time TEXT,
				other_patient_names TEXT,
				ethnic_group TEXT,
				patient_comments TEXT
			)",
			"CREATE INDEX IF NOT EXISTS idx_patient_name ON patient(patient_name)",
			"CREATE INDEX IF NOT EXISTS idx_patient_sex ON patient(patient_sex)",
			"CREATE INDEX IF NOT EXISTS idx_patient_birth_date ON patient(patient_birth_date)",
			"CREATE TABLE IF NOT EXISTS study (
				study_instance_uid TEXT PRIMARY KEY,
				patient_id TEXT NOT NULL REFERENCES patient(patient_id),
				study_date TEXT,
				study_time TEXT,
				accession_number TEXT,
				study_id TEXT,
				study_description TEXT,
				referring_physician_name TEXT,
				physicians_of_record TEXT,
				admitting_diagnoses_description TEXT,
				patient_age TEXT,
				patient_size TEXT,
				patient_weight TEXT,
				occupation TEXT,
				additional_patient_history TEXT
			)",
			"CREATE INDEX IF NOT EXISTS idx_study_patient_id ON study(patient_id)",
			"CREATE INDEX IF NOT EXISTS idx_study_date ON study(study_date)",
			"CREATE INDEX IF NOT EXISTS idx_study_time ON study(study_time)",
			"CREATE INDEX IF NOT EXISTS idx_study_accession_number ON study(accession_number)",
			"CREATE INDEX IF NOT EXISTS idx_study_id ON study(study_id)",
			"CREATE INDEX IF NOT EXISTS idx_study_description ON study(study_description)",
			"CREATE TABLE IF NOT EXISTS series (
				series_instance_uid TEXT PRIMARY KEY,
				study_instance_uid TEXT NOT NULL REFERENCES study(study_instance_uid),
				modality TEXT,
				series_number TEXT
			)",
			"CREATE INDEX IF NOT EXISTS idx_series_study_instance_uid ON series(study_instance_uid)",
			"CREATE INDEX IF NOT EXISTS idx_series_modality ON series(modality)",
			"CREATE INDEX IF NOT EXISTS idx_series_number ON series(series_number)",
			"CREATE TABLE IF NOT EXISTS instance (
				sop_instance_uid TEXT PRIMARY KEY,
				series_instance_uid TEXT NOT NULL REFERENCES series(series_instance_uid),
				instance_number TEXT,
				sop_class_uid TEXT,
				transfer_syntax_uid TEXT,
				container_identifier TEXT
			)",
			"CREATE INDEX IF NOT EXISTS idx_instance_series_instance_uid ON instance(series_instance_uid)",
			"CREATE INDEX IF NOT EXISTS idx_instance_number ON instance(instance_number)",
			"CREATE INDEX IF NOT EXISTS idx_instance_sop_class_uid ON instance(sop_class_uid)",
			"CREATE TABLE IF NOT EXISTS storage_files (
				sop_instance_uid TEXT PRIMARY KEY,
				sop_class_uid TEXT NOT NULL,
				transfer_syntax_uid TEXT NOT NULL,
				locator TEXT NOT NULL,
				added_timestamp TEXT NOT NULL,
				committed INTEGER NOT NULL DEFAULT 0
			)",
			"CREATE INDEX IF NOT EXISTS idx_storage_files_sop_class_uid ON storage_files(sop_class_uid)",
			"CREATE INDEX IF NOT EXISTS idx_storage_files_committed ON storage_files(committed)",
		];

		let mut tx = self.begin().await?;
		for statement in statements {
			sqlx::query(statement).execute(&mut *tx).await?;
		}
		tx.commit().await?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn connects_and_migrates_in_memory_sqlite() {
		let db = Database::connect(&DatabaseConfig::default()).await.unwrap();
		assert_eq!(db.backend(), Backend::Sqlite);
		assert_eq!(db.string_agg_fn(), "group_concat");

		let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM patient")
			.fetch_one(db.pool())
			.await
			.unwrap();
		assert_eq!(row.0, 0);
	}
}
