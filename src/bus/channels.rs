//! Concrete channel (event) types dispatched over the [`super::EventBus`].
//!
//! Kept free of any dependency on `crate::dimse`/`crate::storage`/`crate::query`
//! so that those modules can depend on the bus without a cycle; payloads are
//! plain data, not references to other modules' internal types.

use std::io::Write;
use std::path::PathBuf;

use super::{Event, MaybeEmpty};

/// Broadcast once, non-throwing, when the process starts accepting work.
pub struct OnStart;
impl Event for OnStart {
	type Output = ();
}

/// Broadcast once all `ON_START` handlers have returned.
pub struct OnStarted;
impl Event for OnStarted {
	type Output = ();
}

/// Broadcast non-throwing on shutdown; every component gets one chance to
/// release resources even if another component's teardown failed.
pub struct OnExit;
impl Event for OnExit {
	type Output = ();
}

/// An inbound association request, before any DIMSE operation is processed.
pub struct Assoc {
	pub called_ae: String,
	pub calling_ae: String,
	pub peer_address: String,
}
impl Event for Assoc {
	type Output = ();
}

/// Outcome of a single STORE handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
	Success,
	Failure(String),
}

pub struct Store {
	pub sop_class_uid: String,
	pub sop_instance_uid: String,
	pub transfer_syntax: String,
	pub dataset: dicom::object::InMemDicomObject,
}
impl Event for Store {
	type Output = StoreOutcome;
}

/// One row produced by a FIND handler, with its pending/final status.
pub struct FindResponseItem {
	pub dataset: dicom::object::InMemDicomObject,
	pub pending: bool,
}

pub struct Find {
	pub query_retrieve_level: String,
	pub identifier: dicom::object::InMemDicomObject,
}
impl Event for Find {
	type Output = Vec<FindResponseItem>;
}

/// An artifact resolved from storage, ready to forward as a C-STORE sub-op or
/// a C-GET response.
pub enum InstanceArtifact {
	Path(PathBuf),
	Dataset(Box<dicom::object::InMemDicomObject>),
}

pub struct ResolvedInstance {
	pub sop_class_uid: String,
	pub sop_instance_uid: String,
	pub transfer_syntax: String,
	pub artifact: InstanceArtifact,
}

#[derive(Debug, Clone)]
pub struct DeviceEndpoint {
	pub ae_title: String,
	pub address: String,
	pub port: u16,
	pub retrieve_mode: crate::devices::RetrieveMode,
}

pub struct Move {
	pub identifier: dicom::object::InMemDicomObject,
	pub destination: DeviceEndpoint,
}
impl Event for Move {
	type Output = Vec<ResolvedInstance>;
}

pub struct Get {
	pub identifier: dicom::object::InMemDicomObject,
}
impl Event for Get {
	type Output = Vec<ResolvedInstance>;
}

#[derive(Debug, Default, Clone)]
pub struct CommitmentResult {
	pub successes: Vec<(String, String)>,
	pub failures: Vec<(String, String)>,
}

pub struct Commitment {
	pub pairs: Vec<(String, String)>,
}
impl Event for Commitment {
	type Output = CommitmentResult;
}

/// Metadata the front-end has available before the dataset body has been
/// read off the wire.
pub struct IncomingStoreMeta {
	pub sop_class_uid: String,
	pub sop_instance_uid: String,
	pub transfer_syntax: String,
}

/// A writable sink for an incoming dataset body, plus the offset the sink was
/// positioned at after the meta-header was written (so the body can later be
/// re-read from the start).
pub struct SinkHandle {
	pub writer: Box<dyn Write + Send>,
	pub start_offset: u64,
}

pub struct OnGetFile {
	pub meta: IncomingStoreMeta,
}
impl Event for OnGetFile {
	type Output = SinkHandle;
}

pub struct OnStoreDone {
	pub sop_instance_uid: String,
}
impl Event for OnStoreDone {
	type Output = ();
}

pub struct OnStoreFailure {
	pub sop_instance_uid: String,
}
impl Event for OnStoreFailure {
	type Output = ();
}

pub struct OnGetFiles {
	pub sop_instance_uids: Vec<String>,
}
impl Event for OnGetFiles {
	type Output = Vec<ResolvedInstance>;
}

#[derive(Debug, Default, Clone)]
pub struct VerifyResult {
	pub present: Vec<(String, String)>,
	pub missing: Vec<(String, String)>,
}

pub struct OnStoreVerify {
	pub pairs: Vec<(String, String)>,
}
impl Event for OnStoreVerify {
	type Output = VerifyResult;
}

pub struct DeviceByAe {
	pub ae_title: String,
}
impl Event for DeviceByAe {
	type Output = Option<DeviceEndpoint>;
}

impl<T> MaybeEmpty for Vec<T> {
	fn is_empty_value(&self) -> bool {
		self.is_empty()
	}
}
