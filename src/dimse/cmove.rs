//! C-MOVE / C-GET sub-operation engine.
//!
//! Both operations push every resolved instance as one C-STORE-RQ and report
//! running counters after each push. C-MOVE does this over a freshly opened
//! outbound association to the resolved destination; C-GET does it over the
//! existing inbound one. This module only knows how to push and count — the
//! caller supplies the association and decides where pending responses go.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::future::Future;
use std::net::ToSocketAddrs;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dicom::object::InMemDicomObject;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::association::client::{ClientAssociation, ClientAssociationOptions};
use super::association::{Association, AssociationError};
use super::messages::{CompositeStoreRequest, CompositeStoreResponse};
use super::{next_message_id, DicomMessageReader, DicomMessageWriter, ReadError, StatusType, WriteError};
use crate::bus::{DeviceEndpoint, InstanceArtifact, ResolvedInstance};
use crate::devices::RetrieveMode;
use crate::types::{Priority, US};

/// Serializes concurrently-handled C-MOVE requests that target the same
/// `RetrieveMode::Sequential` destination AE onto a single outbound push at
/// a time; destinations left at the default `Concurrent` mode are never
/// throttled. One process-wide instance is shared across all associations.
#[derive(Default)]
pub struct MoveMediator {
	semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl MoveMediator {
	pub fn new() -> Self {
		Self::default()
	}

	/// Acquires the permit gating pushes to `destination_ae`, if its mode
	/// requires one. Holding the returned permit for the duration of a
	/// C-MOVE's sub-operation loop is what serializes it against any other
	/// C-MOVE concurrently targeting the same AE.
	pub async fn acquire_permit(&self, destination_ae: &str, mode: RetrieveMode) -> Option<OwnedSemaphorePermit> {
		match mode {
			RetrieveMode::Concurrent => None,
			RetrieveMode::Sequential => {
				let semaphore = self
					.semaphores
					.lock()
					.expect("move mediator lock poisoned")
					.entry(destination_ae.to_string())
					.or_insert_with(|| Arc::new(Semaphore::new(1)))
					.clone();
				Some(semaphore.acquire_owned().await.expect("semaphore is never closed"))
			}
		}
	}
}

const SUB_OP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SubOpError {
	#[error("could not resolve a socket address for the destination")]
	NoAddress,
	#[error(transparent)]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error(transparent)]
	Progress(#[from] anyhow::Error),
}

/// Running sub-operation counters, mirroring the C-MOVE/C-GET response
/// fields `NumberOf{Completed,Failed,Warning}Suboperations`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubOpCounters {
	pub completed: US,
	pub failed: US,
	pub warning: US,
}

impl SubOpCounters {
	fn done(&self) -> usize {
		(self.completed + self.failed + self.warning) as usize
	}

	pub fn remaining(&self, total: usize) -> US {
		total.saturating_sub(self.done()) as US
	}
}

pub type ProgressFut<'a> = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;

fn load_dataset(artifact: &InstanceArtifact, transfer_syntax: &str) -> anyhow::Result<InMemDicomObject> {
	match artifact {
		InstanceArtifact::Dataset(dataset) => Ok((**dataset).clone()),
		InstanceArtifact::Path(path) => {
			let bytes = fs::read(path)?;
			let ts = TransferSyntaxRegistry
				.get(transfer_syntax)
				.ok_or_else(|| anyhow::anyhow!("unknown transfer syntax '{transfer_syntax}'"))?;
			Ok(InMemDicomObject::read_dataset_with_ts(bytes.as_slice(), ts)?)
		}
	}
}

/// One proposed presentation context per distinct `(SOP class, transfer
/// syntax)` pair among `instances`, each offering a single transfer syntax.
/// Proposing them separately (rather than bundling every transfer syntax
/// seen for a class under one context) guarantees a distinct negotiated
/// context id per pair, so `push_all` can always address the one matching
/// an instance's own encoding instead of inheriting whatever the peer
/// happened to accept for the first instance of that class.
fn group_presentation_contexts(instances: &[ResolvedInstance]) -> Vec<(String, Vec<String>)> {
	let mut seen = BTreeSet::new();
	let mut pairs = Vec::new();
	for instance in instances {
		let key = (instance.sop_class_uid.clone(), instance.transfer_syntax.clone());
		if seen.insert(key.clone()) {
			pairs.push((key.0, vec![key.1]));
		}
	}
	pairs
}

/// Finds the negotiated presentation context id offering exactly
/// `instance`'s `(sop_class_uid, transfer_syntax)` pair.
fn context_id_for<A: Association>(association: &A, instance: &ResolvedInstance) -> Option<u8> {
	association
		.presentation_contexts()
		.iter()
		.find(|pctx| {
			pctx.abstract_syntax == instance.sop_class_uid && pctx.transfer_syntax == instance.transfer_syntax
		})
		.map(|pctx| pctx.id)
}

/// Opens one outbound association to `destination`, negotiating one
/// presentation context per distinct SOP class among `instances`.
pub async fn open_outbound(
	destination: &DeviceEndpoint,
	calling_aet: &str,
	instances: &[ResolvedInstance],
) -> Result<ClientAssociation, SubOpError> {
	open_outbound_with_contexts(destination, calling_aet, group_presentation_contexts(instances)).await
}

/// Opens one outbound association to `destination`, negotiating exactly the
/// given `(abstract_syntax, transfer_syntaxes)` pairs. Used for N-EVENT-REPORT
/// delivery, where there is no resolved instance list to derive contexts from.
pub async fn open_outbound_with_contexts(
	destination: &DeviceEndpoint,
	calling_aet: &str,
	presentation_contexts: Vec<(String, Vec<String>)>,
) -> Result<ClientAssociation, SubOpError> {
	let address = format!("{}:{}", destination.address, destination.port)
		.to_socket_addrs()
		.map_err(|_| SubOpError::NoAddress)?
		.next()
		.ok_or(SubOpError::NoAddress)?;

	ClientAssociation::new(ClientAssociationOptions {
		calling_aet: calling_aet.to_string(),
		called_aet: destination.ae_title.clone(),
		presentation_contexts,
		address,
	})
	.await
	.map_err(SubOpError::from)
}

/// Pushes every instance as a C-STORE-RQ over `association`, calling
/// `on_progress` with the updated counters and the remaining count after
/// each sub-operation (success, warning, or failure alike).
pub async fn push_all<A: Association>(
	association: &A,
	instances: &[ResolvedInstance],
	move_originator_aet: Option<&str>,
	move_originator_message_id: Option<US>,
	mut on_progress: impl FnMut(SubOpCounters, US) -> ProgressFut<'_>,
) -> Result<SubOpCounters, SubOpError> {
	let total = instances.len();
	let mut counters = SubOpCounters::default();

	for instance in instances {
		let dataset = match load_dataset(&instance.artifact, &instance.transfer_syntax) {
			Ok(dataset) => dataset,
			Err(err) => {
				tracing::warn!(
					error = %err,
					sop_instance_uid = %instance.sop_instance_uid,
					"failed to load stored dataset for sub-operation",
				);
				counters.failed += 1;
				on_progress(counters, counters.remaining(total)).await?;
				continue;
			}
		};

		let message_id = next_message_id();
		let request = CompositeStoreRequest {
			affected_sop_class_uid: instance.sop_class_uid.clone(),
			affected_sop_instance_uid: instance.sop_instance_uid.clone(),
			move_originator_aet: move_originator_aet.map(str::to_string),
			move_originator_message_id,
			message_id,
			priority: Priority::Medium as US,
			data_set: dataset,
		};

		let presentation_context_id = context_id_for(association, instance);
		let outcome: Result<CompositeStoreResponse, SubOpError> = async {
			association
				.write_message(request, presentation_context_id, SUB_OP_TIMEOUT)
				.await?;
			let response = association.read_message(SUB_OP_TIMEOUT).await?;
			Ok(CompositeStoreResponse::try_from(response)?)
		}
		.await;

		match outcome {
			Ok(response) if response.message_id != message_id => {
				tracing::warn!(
					expected = message_id,
					got = response.message_id,
					"C-STORE sub-operation response message id mismatch",
				);
				counters.failed += 1;
			}
			Ok(response) => match StatusType::try_from(response.status) {
				Ok(StatusType::Success) => counters.completed += 1,
				Ok(StatusType::Warning) => counters.warning += 1,
				_ => counters.failed += 1,
			},
			Err(err) => {
				tracing::warn!(
					error = %err,
					sop_instance_uid = %instance.sop_instance_uid,
					"C-STORE sub-operation failed",
				);
				counters.failed += 1;
			}
		}

		on_progress(counters, counters.remaining(total)).await?;
	}

	Ok(counters)
}

#[cfg(test)]
mod tests {
	use std::sync::Mutex;
	use std::time::Duration;

	use dicom::dictionary_std::tags;
	use dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN;
	use dicom::ul::pdu::{
		PDataValue, PDataValueType, Pdu, PresentationContextNegotiated, PresentationContextResultReason,
	};

	use super::*;
	use crate::dimse::{command_us, DicomMessage};

	/// A stand-in peer that answers every C-STORE-RQ it receives with a
	/// success C-STORE-RSP carrying the request's own message id.
	struct MockAssociation {
		contexts: Vec<PresentationContextNegotiated>,
		last_message_id: Mutex<Option<US>>,
	}

	impl Association for MockAssociation {
		async fn receive(&self, _timeout: Duration) -> Result<Pdu, AssociationError> {
			let message_id = self.last_message_id.lock().unwrap().take().expect("no request seen yet");
			let response = CompositeStoreResponse {
				message_id,
				status: 0,
				sop_class_uid: "1.2.840.10008.5.1.4.1.1.7".to_string(),
				sop_instance_uid: "1.2.9.1".to_string(),
			};
			let message: DicomMessage = response.into();
			let mut buf = Vec::new();
			message
				.command
				.write_dataset_with_ts(&mut buf, &IMPLICIT_VR_LITTLE_ENDIAN.erased())
				.unwrap();
			Ok(Pdu::PData {
				data: vec![PDataValue {
					value_type: PDataValueType::Command,
					presentation_context_id: self.contexts[0].id,
					is_last: true,
					data: buf,
				}],
			})
		}

		async fn send(&self, pdu: Pdu, _timeout: Duration) -> Result<(), AssociationError> {
			let Pdu::PData { data } = pdu else {
				return Ok(());
			};
			for pdv in data {
				if let PDataValueType::Command = pdv.value_type {
					let command =
						InMemDicomObject::read_dataset_with_ts(pdv.data.as_slice(), &IMPLICIT_VR_LITTLE_ENDIAN.erased())
							.unwrap();
					if let Some(message_id) = command_us(&command, tags::MESSAGE_ID) {
						*self.last_message_id.lock().unwrap() = Some(message_id);
					}
				}
			}
			Ok(())
		}

		fn close(&mut self) {}

		fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
			&self.contexts
		}
	}

	#[tokio::test]
	async fn push_all_counts_one_completed_sub_operation() {
		let association = MockAssociation {
			contexts: vec![PresentationContextNegotiated {
				id: 1,
				reason: PresentationContextResultReason::Acceptance,
				abstract_syntax: "1.2.840.10008.5.1.4.1.1.7".to_string(),
				transfer_syntax: "1.2.840.10008.1.2".to_string(),
			}],
			last_message_id: Mutex::new(None),
		};

		let instances = vec![ResolvedInstance {
			sop_class_uid: "1.2.840.10008.5.1.4.1.1.7".to_string(),
			sop_instance_uid: "1.2.9.1".to_string(),
			transfer_syntax: "1.2.840.10008.1.2".to_string(),
			artifact: InstanceArtifact::Dataset(Box::new(InMemDicomObject::new_empty())),
		}];

		let counters = push_all(&association, &instances, None, None, |_counters, remaining| {
			Box::pin(async move {
				assert_eq!(remaining, 0);
				Ok(())
			})
		})
		.await
		.unwrap();

		assert_eq!(counters.completed, 1);
		assert_eq!(counters.failed, 0);
		assert_eq!(counters.warning, 0);
		assert_eq!(counters.remaining(1), 0);
	}

	#[test]
	fn presentation_contexts_one_per_sop_class_and_transfer_syntax_pair() {
		let instances = vec![
			ResolvedInstance {
				sop_class_uid: "1.2.840.10008.5.1.4.1.1.7".to_string(),
				sop_instance_uid: "1.2.9.1".to_string(),
				transfer_syntax: "1.2.840.10008.1.2".to_string(),
				artifact: InstanceArtifact::Dataset(Box::new(InMemDicomObject::new_empty())),
			},
			ResolvedInstance {
				sop_class_uid: "1.2.840.10008.5.1.4.1.1.7".to_string(),
				sop_instance_uid: "1.2.9.2".to_string(),
				transfer_syntax: "1.2.840.10008.1.2.1".to_string(),
				artifact: InstanceArtifact::Dataset(Box::new(InMemDicomObject::new_empty())),
			},
		];
		let grouped = group_presentation_contexts(&instances);
		assert_eq!(grouped.len(), 2);
		assert_eq!(grouped[0].0, "1.2.840.10008.5.1.4.1.1.7");
		assert_eq!(grouped[0].1, vec!["1.2.840.10008.1.2".to_string()]);
		assert_eq!(grouped[1].0, "1.2.840.10008.5.1.4.1.1.7");
		assert_eq!(grouped[1].1, vec!["1.2.840.10008.1.2.1".to_string()]);
	}

	#[tokio::test]
	async fn push_all_addresses_each_instance_to_its_own_transfer_syntax_context() {
		let association = MockAssociation {
			contexts: vec![
				PresentationContextNegotiated {
					id: 1,
					reason: PresentationContextResultReason::Acceptance,
					abstract_syntax: "1.2.840.10008.5.1.4.1.1.7".to_string(),
					transfer_syntax: "1.2.840.10008.1.2".to_string(),
				},
				PresentationContextNegotiated {
					id: 3,
					reason: PresentationContextResultReason::Acceptance,
					abstract_syntax: "1.2.840.10008.5.1.4.1.1.7".to_string(),
					transfer_syntax: "1.2.840.10008.1.2.1".to_string(),
				},
			],
			last_message_id: Mutex::new(None),
		};

		let instances = vec![ResolvedInstance {
			sop_class_uid: "1.2.840.10008.5.1.4.1.1.7".to_string(),
			sop_instance_uid: "1.2.9.2".to_string(),
			transfer_syntax: "1.2.840.10008.1.2.1".to_string(),
			artifact: InstanceArtifact::Dataset(Box::new(InMemDicomObject::new_empty())),
		}];

		assert_eq!(context_id_for(&association, &instances[0]), Some(3));

		let counters = push_all(&association, &instances, None, None, |_counters, _remaining| {
			Box::pin(async move { Ok(()) })
		})
		.await
		.unwrap();

		assert_eq!(counters.completed, 1);
	}

	#[tokio::test]
	async fn sequential_mode_serializes_permits_for_the_same_ae() {
		let mediator = MoveMediator::new();

		let first = mediator.acquire_permit("MODALITY1", RetrieveMode::Sequential).await;
		assert!(first.is_some());

		// A second acquire for the same AE must not resolve while the first
		// permit is still held.
		let second = tokio::time::timeout(
			Duration::from_millis(50),
			mediator.acquire_permit("MODALITY1", RetrieveMode::Sequential),
		)
		.await;
		assert!(second.is_err(), "second permit resolved while the first was still held");

		drop(first);
		let second = mediator.acquire_permit("MODALITY1", RetrieveMode::Sequential).await;
		assert!(second.is_some());
	}

	#[tokio::test]
	async fn concurrent_mode_never_gates() {
		let mediator = MoveMediator::new();
		let first = mediator.acquire_permit("MODALITY1", RetrieveMode::Concurrent).await;
		let second = mediator.acquire_permit("MODALITY1", RetrieveMode::Concurrent).await;
		assert!(first.is_none());
		assert!(second.is_none());
	}
}
