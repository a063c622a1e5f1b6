//! In-memory storage backend. Locator is the SOP Instance UID itself; bytes
//! live in a process-wide buffer map and a parsed dataset is cached once the
//! store commits.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use dicom::object::InMemDicomObject;
use dicom::transfer_syntax::TransferSyntaxRegistry;

use crate::bus::{
	Handler, IncomingStoreMeta, OnGetFile, OnGetFiles, OnStoreDone, OnStoreFailure, OnStoreVerify,
	ResolvedInstance, SinkHandle, VerifyResult,
};
use crate::component::{register_lifecycle, ComponentContext, Lifecycle};
use crate::db::Database;
use crate::storage::index::{self, StorageRow};

struct Buffer(Arc<Mutex<Vec<u8>>>);

impl Write for Buffer {
	fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
		self.0.lock().expect("buffer lock poisoned").extend_from_slice(buf);
		Ok(buf.len())
	}
	fn flush(&mut self) -> std::io::Result<()> {
		Ok(())
	}
}

pub struct InMemoryStorage {
	db: Arc<Database>,
	buffers: Mutex<HashMap<String, Arc<Mutex<Vec<u8>>>>>,
	parsed: Mutex<HashMap<String, Arc<InMemDicomObject>>>,
}

impl InMemoryStorage {
	pub fn new(ctx: &ComponentContext, db: Arc<Database>) -> Arc<Self> {
		let this = Arc::new(Self {
			db,
			buffers: Mutex::new(HashMap::new()),
			parsed: Mutex::new(HashMap::new()),
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

impl Lifecycle for InMemoryStorage {
	fn name(&self) -> &str {
		"InMemoryStorage"
	}
}

#[async_trait]
impl Handler<OnGetFile> for InMemoryStorage {
	async fn handle(&self, event: &OnGetFile) -> anyhow::Result<SinkHandle> {
		let IncomingStoreMeta {
			sop_class_uid,
			sop_instance_uid,
			transfer_syntax,
		} = &event.meta;

		let buffer = Arc::new(Mutex::new(Vec::new()));
		self.buffers
			.lock()
			.expect("buffer map lock poisoned")
			.insert(sop_instance_uid.clone(), buffer.clone());

		index::insert_uncommitted(
			&self.db,
			&StorageRow {
				sop_instance_uid: sop_instance_uid.clone(),
				sop_class_uid: sop_class_uid.clone(),
				transfer_syntax_uid: transfer_syntax.clone(),
				locator: sop_instance_uid.clone(),
			},
			&Utc::now().to_rfc3339(),
		)
		.await?;

		Ok(SinkHandle {
			writer: Box::new(Buffer(buffer)),
			start_offset: 0,
		})
	}
}

#[async_trait]
impl Handler<OnStoreDone> for InMemoryStorage {
	async fn handle(&self, event: &OnStoreDone) -> anyhow::Result<()> {
		index::mark_committed(&self.db, &event.sop_instance_uid).await?;

		let rows = index::committed_rows(&self.db, std::slice::from_ref(&event.sop_instance_uid))
			.await?;
		if let Some((_, row)) = rows.into_iter().next() {
			let buffer = self
				.buffers
				.lock()
				.expect("buffer map lock poisoned")
				.get(&event.sop_instance_uid)
				.cloned();
			if let Some(buffer) = buffer {
				let bytes = buffer.lock().expect("buffer lock poisoned").clone();
				let ts = TransferSyntaxRegistry
					.get(&row.transfer_syntax_uid)
					.ok_or_else(|| anyhow::anyhow!("unknown transfer syntax {}", row.transfer_syntax_uid))?;
				let dataset = InMemDicomObject::read_dataset_with_ts(bytes.as_slice(), ts)?;
				self.parsed
					.lock()
					.expect("parsed cache lock poisoned")
					.insert(event.sop_instance_uid.clone(), Arc::new(dataset));
			}
		}
		Ok(())
	}
}

#[async_trait]
impl Handler<OnStoreFailure> for InMemoryStorage {
	async fn handle(&self, event: &OnStoreFailure) -> anyhow::Result<()> {
		if let Err(err) = index::take_locator(&self.db, &event.sop_instance_uid).await {
			tracing::warn!(error = %err, "failed to release in-memory storage row");
		}
		self.buffers
			.lock()
			.expect("buffer map lock poisoned")
			.remove(&event.sop_instance_uid);
		self.parsed
			.lock()
			.expect("parsed cache lock poisoned")
			.remove(&event.sop_instance_uid);
		Ok(())
	}
}

#[async_trait]
impl Handler<OnGetFiles> for InMemoryStorage {
	async fn handle(&self, event: &OnGetFiles) -> anyhow::Result<Vec<ResolvedInstance>> {
		let rows = index::committed_rows(&self.db, &event.sop_instance_uids).await?;
		let parsed = self.parsed.lock().expect("parsed cache lock poisoned");
		let mut out = Vec::with_capacity(rows.len());
		for (uid, row) in rows {
			if let Some(dataset) = parsed.get(&uid) {
				out.push(ResolvedInstance {
					sop_class_uid: row.sop_class_uid,
					sop_instance_uid: uid,
					transfer_syntax: row.transfer_syntax_uid,
					artifact: crate::bus::InstanceArtifact::Dataset(Box::new((**dataset).clone())),
				});
			}
		}
		Ok(out)
	}
}

#[async_trait]
impl Handler<OnStoreVerify> for InMemoryStorage {
	async fn handle(&self, event: &OnStoreVerify) -> anyhow::Result<VerifyResult> {
		let (present, missing) = index::verify(&self.db, &event.pairs).await?;
		Ok(VerifyResult { present, missing })
	}
}
