//! Filesystem storage backend. Layout: `<storage_dir>/<UTC YYYYMMDD>/<uid>[_N].dcm`.
//!
//! The day subdirectory is created on demand before the first write lands in
//! it — the source this was distilled from never does, leaving a possible
//! write failure on first-of-day ingest.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use crate::bus::{
	Handler, IncomingStoreMeta, InstanceArtifact, OnGetFile, OnGetFiles, OnStoreDone,
	OnStoreFailure, OnStoreVerify, ResolvedInstance, SinkHandle, VerifyResult,
};
use crate::component::{register_lifecycle, ComponentContext, Lifecycle};
use crate::db::Database;
use crate::storage::index::{self, StorageRow};

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FileStorageConfig {
	pub storage_dir: PathBuf,
}

pub struct FileStorage {
	db: Arc<Database>,
	config: FileStorageConfig,
	paths: Mutex<HashMap<String, PathBuf>>,
}

impl FileStorage {
	pub fn new(ctx: &ComponentContext, db: Arc<Database>) -> anyhow::Result<Arc<Self>> {
		let config: FileStorageConfig = serde_json::from_value(ctx.config.as_ref().clone())?;
		let this = Arc::new(Self {
			db,
			config,
			paths: Mutex::new(HashMap::new()),
		});
		register_lifecycle(&ctx.bus, this.clone());
		ctx.bus.subscribe_default(this.clone() as Arc<dyn Handler<OnGetFile>>);
		ctx.bus.subscribe_default(this.clone() as Arc<dyn Handler<OnStoreDone>>);
		ctx.bus.subscribe_default(this.clone() as Arc<dyn Handler<OnStoreFailure>>);
		ctx.bus.subscribe_default(this.clone() as Arc<dyn Handler<OnGetFiles>>);
		ctx.bus.subscribe_default(this.clone() as Arc<dyn Handler<OnStoreVerify>>);
		Ok(this)
	}

	/// Appends `_N` suffixes until the path is free, making allocation
	/// race-free without relying on any lock beyond the filesystem itself.
	fn allocate_path(day_dir: &Path, sop_instance_uid: &str) -> PathBuf {
		let mut candidate = day_dir.join(format!("{sop_instance_uid}.dcm"));
		let mut n = 1;
		while candidate.exists() {
			candidate = day_dir.join(format!("{sop_instance_uid}_{n}.dcm"));
			n += 1;
		}
		candidate
	}
}

impl Lifecycle for FileStorage {
	fn name(&self) -> &str {
		"FileStorage"
	}
}

#[async_trait]
impl Handler<OnGetFile> for FileStorage {
	async fn handle(&self, event: &OnGetFile) -> anyhow::Result<SinkHandle> {
		let IncomingStoreMeta {
			sop_class_uid,
			sop_instance_uid,
			transfer_syntax,
		} = &event.meta;

		let day = Utc::now().format("%Y%m%d").to_string();
		let day_dir = self.config.storage_dir.join(&day);
		fs::create_dir_all(&day_dir)?;

		let path = Self::allocate_path(&day_dir, sop_instance_uid);
		let file = File::create(&path)?;

		self.paths
			.lock()
			.expect("path map lock poisoned")
			.insert(sop_instance_uid.clone(), path.clone());

		index::insert_uncommitted(
			&self.db,
			&StorageRow {
				sop_instance_uid: sop_instance_uid.clone(),
				sop_class_uid: sop_class_uid.clone(),
				transfer_syntax_uid: transfer_syntax.clone(),
				locator: path.to_string_lossy().into_owned(),
			},
			&Utc::now().to_rfc3339(),
		)
		.await?;

		Ok(SinkHandle {
			writer: Box::new(file),
			start_offset: 0,
		})
	}
}

#[async_trait]
impl Handler<OnStoreDone> for FileStorage {
	async fn handle(&self, event: &OnStoreDone) -> anyhow::Result<()> {
		index::mark_committed(&self.db, &event.sop_instance_uid).await?;
		Ok(())
	}
}

#[async_trait]
impl Handler<OnStoreFailure> for FileStorage {
	async fn handle(&self, event: &OnStoreFailure) -> anyhow::Result<()> {
		let locator = index::take_locator(&self.db, &event.sop_instance_uid).await?;
		self.paths
			.lock()
			.expect("path map lock poisoned")
			.remove(&event.sop_instance_uid);
		if let Some(locator) = locator {
			if let Err(err) = fs::remove_file(&locator) {
				tracing::warn!(error = %err, locator, "failed to release filesystem storage locator");
			}
		}
		Ok(())
	}
}

#[async_trait]
impl Handler<OnGetFiles> for FileStorage {
	async fn handle(&self, event: &OnGetFiles) -> anyhow::Result<Vec<ResolvedInstance>> {
		let rows = index::committed_rows(&self.db, &event.sop_instance_uids).await?;
		Ok(rows
			.into_iter()
			.map(|(uid, row)| ResolvedInstance {
				sop_class_uid: row.sop_class_uid,
				sop_instance_uid: uid,
				transfer_syntax: row.transfer_syntax_uid,
				artifact: InstanceArtifact::Path(row.locator.into()),
			})
			.collect())
	}
}

#[async_trait]
impl Handler<OnStoreVerify> for FileStorage {
	async fn handle(&self, event: &OnStoreVerify) -> anyhow::Result<VerifyResult> {
		let (present, missing) = index::verify(&self.db, &event.pairs).await?;
		Ok(VerifyResult { present, missing })
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::bus::EventBus;

	#[tokio::test]
	async fn allocates_day_directory_and_dedups_names() {
		let tmp = tempfile::tempdir().unwrap();
		let day_dir = tmp.path().join("20260730");
		fs::create_dir_all(&day_dir).unwrap();
		File::create(day_dir.join("1.2.3.dcm")).unwrap();

		let path = FileStorage::allocate_path(&day_dir, "1.2.3");
		assert_eq!(path, day_dir.join("1.2.3_1.dcm"));
	}

	#[tokio::test]
	async fn on_get_file_creates_missing_day_directory() {
		let tmp = tempfile::tempdir().unwrap();
		let db = Arc::new(crate::db::Database::connect(&crate::db::DatabaseConfig::default())
			.await
			.unwrap());
		let ctx = ComponentContext::new(
			Arc::new(EventBus::new()),
			serde_json::json!({ "storage-dir": tmp.path() }),
		);
		let storage = FileStorage::new(&ctx, db).unwrap();

		let sink = storage
			.handle(&OnGetFile {
				meta: IncomingStoreMeta {
					sop_class_uid: "1.2.840.10008.5.1.4.1.1.7".into(),
					sop_instance_uid: "1.2.5.6".into(),
					transfer_syntax: "1.2.840.10008.1.2".into(),
				},
			})
			.await
			.unwrap();
		drop(sink);

		let day = Utc::now().format("%Y%m%d").to_string();
		assert!(tmp.path().join(day).exists());
	}
}
