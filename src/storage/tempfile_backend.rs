//! Temp-file storage backend. Locator is an OS temp path; retrieval yields
//! that path, not a parsed dataset.

use std::collections::HashMap;
use std::fs::File;
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

pub struct TempFileStorage {
	db: Arc<Database>,
	paths: Mutex<HashMap<String, std::path::PathBuf>>,
}

impl TempFileStorage {
	pub fn new(ctx: &ComponentContext, db: Arc<Database>) -> Arc<Self> {
		let this = Arc::new(Self {
			db,
			paths: Mutex::new(HashMap::new()),
		});
		register_lifecycle(&ctx.bus, this.clone());
		ctx.bus.subscribe_default(this.clone() as Arc<dyn Handler<OnGetFile>>);
		ctx.bus.subscribe_default(this.clone() as Arc<dyn Handler<OnStoreDone>>);
		ctx.bus.subscribe_default(this.clone() as Arc<dyn Handler<OnStoreFailure>>);
		ctx.bus.subscribe_default(this.clone() as Arc<dyn Handler<OnGetFiles>>);
		ctx.bus.subscribe_default(this.clone() as Arc<dyn Handler<OnStoreVerify>>);
		this
	}
}

impl Lifecycle for TempFileStorage {
	fn name(&self) -> &str {
		"TempFileStorage"
	}
}

#[async_trait]
impl Handler<OnGetFile> for TempFileStorage {
	async fn handle(&self, event: &OnGetFile) -> anyhow::Result<SinkHandle> {
		let IncomingStoreMeta {
			sop_class_uid,
			sop_instance_uid,
			transfer_syntax,
		} = &event.meta;

		// OS-atomic temp creation makes locator allocation inherently race-free.
		let file = tempfile::NamedTempFile::new()?;
		let path = file.path().to_path_buf();
		let (std_file, _temp_path) = file.keep()?;

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
			writer: Box::new(std_file as File),
			start_offset: 0,
		})
	}
}

#[async_trait]
impl Handler<OnStoreDone> for TempFileStorage {
	async fn handle(&self, event: &OnStoreDone) -> anyhow::Result<()> {
		index::mark_committed(&self.db, &event.sop_instance_uid).await?;
		Ok(())
	}
}

#[async_trait]
impl Handler<OnStoreFailure> for TempFileStorage {
	async fn handle(&self, event: &OnStoreFailure) -> anyhow::Result<()> {
		let locator = index::take_locator(&self.db, &event.sop_instance_uid).await?;
		self.paths
			.lock()
			.expect("path map lock poisoned")
			.remove(&event.sop_instance_uid);
		if let Some(locator) = locator {
			if let Err(err) = std::fs::remove_file(&locator) {
				tracing::warn!(error = %err, locator, "failed to release temp-file storage locator");
			}
		}
		Ok(())
	}
}

#[async_trait]
impl Handler<OnGetFiles> for TempFileStorage {
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
impl Handler<OnStoreVerify> for TempFileStorage {
	async fn handle(&self, event: &OnStoreVerify) -> anyhow::Result<VerifyResult> {
		let (present, missing) = index::verify(&self.db, &event.pairs).await?;
		Ok(VerifyResult { present, missing })
	}
}
