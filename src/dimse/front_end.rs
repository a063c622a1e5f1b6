//! The DIMSE front-end: accept loop plus the six transport callbacks.
//!
//! Each inbound association is handled on its own tokio task. Within one
//! association, messages are processed strictly in order; across
//! associations there is no ordering guarantee, matching the bus's
//! single-threaded-per-caller dispatch model.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use dicom::dictionary_std::{tags, uids};
use dicom::object::InMemDicomObject;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use tokio::net::TcpListener;
use tracing::{error, info, info_span, instrument, warn, Instrument};

use crate::bus::{
	Assoc, Commitment, DeviceByAe, Find, Get, IncomingStoreMeta, Move, OnGetFile, Store,
	StoreOutcome,
};
use crate::component::ComponentContext;
use crate::dimse::association::server::{ServerAssociation, ServerAssociationOptions};
use crate::dimse::association::Association;
use crate::dimse::cmove::{self, MoveMediator, SubOpCounters};
use crate::dimse::messages::{
	ActionResponse, CompositeEchoResponse, CompositeFindResponse, CompositeGetResponse, CompositeMoveResponse,
	CompositeStoreResponse, EventReportRequest, COMMAND_FIELD_COMPOSITE_ECHO_REQUEST,
	COMMAND_FIELD_COMPOSITE_FIND_REQUEST, COMMAND_FIELD_COMPOSITE_GET_REQUEST,
	COMMAND_FIELD_COMPOSITE_MOVE_REQUEST, COMMAND_FIELD_COMPOSITE_STORE_REQUEST, COMMAND_FIELD_N_ACTION_REQUEST,
};
use crate::dimse::{command_str, command_us, next_message_id, DicomMessageReader, DicomMessageWriter};
use crate::types::US;

const MESSAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Status code for "C-STORE cannot understand" (the request's data set
/// could not be decoded).
const STATUS_CANNOT_UNDERSTAND: US = 0x0110;
/// Generic processing-failure status used for event-handling errors.
const STATUS_PROCESSING_FAILURE: US = 0x0110;
const STATUS_SUCCESS: US = 0x0000;

/// Storage Commitment Push Model SOP Class and its single well-known SOP
/// Instance, per PS3.4 Annex J. Not present in `dicom::dictionary_std::uids`.
const STORAGE_COMMITMENT_PUSH_MODEL_SOP_CLASS: &str = "1.2.840.10008.1.20.1";
const STORAGE_COMMITMENT_PUSH_MODEL_SOP_INSTANCE: &str = "1.2.840.10008.1.20.1.1";

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AeConfig {
	pub ae_title: Vec<String>,
	pub port: u16,
	pub max_pdu_length: u32,
	pub supported_ts: Vec<String>,
	pub dump_ds: bool,
}

impl Default for AeConfig {
	fn default() -> Self {
		Self {
			ae_title: vec!["TINY-PACS".to_string()],
			port: 11112,
			max_pdu_length: 65536,
			supported_ts: Vec::new(),
			dump_ds: false,
		}
	}
}

/// Runs the accept loop until the listener errors out or the process is
/// killed. Each accepted connection is dispatched onto its own task so
/// associations run concurrently; within one association, messages are
/// handled strictly in sequence.
pub async fn serve(ctx: ComponentContext, config: AeConfig) -> anyhow::Result<()> {
	let address = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port);
	let listener = TcpListener::bind(address).await?;
	info!(%address, aet = ?config.ae_title, "DIMSE front-end listening");

	let mediator = Arc::new(MoveMediator::new());

	loop {
		let (stream, peer) = match listener.accept().await {
			Ok(accepted) => accepted,
			Err(err) => {
				error!(error = %err, "failed to accept incoming connection");
				continue;
			}
		};

		let ctx = ctx.clone();
		let config = config.clone();
		let mediator = mediator.clone();
		let span = info_span!("association", peer = %peer);
		tokio::spawn(
			async move {
				if let Err(err) = handle_connection(ctx, config, mediator, stream, peer).await {
					warn!(error = %err, "association ended with an error");
				}
			}
			.instrument(span),
		);
	}
}

#[instrument(skip(ctx, config, mediator, stream))]
async fn handle_connection(
	ctx: ComponentContext,
	config: AeConfig,
	mediator: Arc<MoveMediator>,
	stream: tokio::net::TcpStream,
	peer: SocketAddr,
) -> anyhow::Result<()> {
	let tcp_stream = stream.into_std()?;
	tcp_stream.set_nonblocking(false)?;

	let association = match ServerAssociation::new(ServerAssociationOptions {
		ae_titles: config.ae_title.clone(),
		tcp_stream,
		supported_ts: config.supported_ts.clone(),
	})
	.await
	{
		Ok(association) => association,
		Err(err) => {
			// Rejected either by our own called-AE-title allow-list check
			// (result=1, source=1, reason=7) or by dicom::ul's own
			// negotiation (malformed PDU, no common transfer syntax, ...).
			warn!(error = %err, "association rejected or failed during negotiation");
			return Ok(());
		}
	};
	let called_aet = association.called_ae_title().to_string();

	ctx.broadcast(&Assoc {
		called_ae: called_aet.clone(),
		calling_ae: association.calling_ae_title().to_string(),
		peer_address: peer.ip().to_string(),
	})
	.await?;

	loop {
		let message = match association.read_message(Duration::MAX).await {
			Ok(message) => message,
			Err(err) => {
				info!(error = %err, "association closed");
				return Ok(());
			}
		};

		let Some(command_field) = command_us(&message.command, tags::COMMAND_FIELD) else {
			warn!("message missing COMMAND_FIELD, dropping association");
			return Ok(());
		};

		match command_field {
			COMMAND_FIELD_COMPOSITE_ECHO_REQUEST => {
				handle_echo(&association, &message.command, message.presentation_context_id).await?;
			}
			COMMAND_FIELD_COMPOSITE_STORE_REQUEST => {
				handle_store(
					&ctx,
					&association,
					message.command,
					message.data,
					message.presentation_context_id,
				)
				.await?;
			}
			COMMAND_FIELD_COMPOSITE_FIND_REQUEST => {
				handle_find(&ctx, &association, message.command, message.data, message.presentation_context_id).await?;
			}
			COMMAND_FIELD_COMPOSITE_MOVE_REQUEST => {
				handle_move(
					&ctx,
					&association,
					&mediator,
					&called_aet,
					message.command,
					message.data,
					message.presentation_context_id,
				)
				.await?;
			}
			COMMAND_FIELD_COMPOSITE_GET_REQUEST => {
				handle_get(&ctx, &association, message.command, message.data, message.presentation_context_id).await?;
			}
			COMMAND_FIELD_N_ACTION_REQUEST => {
				handle_commitment(
					&ctx,
					&association,
					&called_aet,
					message.command,
					message.data,
					message.presentation_context_id,
				)
				.await?;
			}
			other => {
				warn!(command_field = other, "unsupported command field, dropping association");
				return Ok(());
			}
		}
	}
}

async fn handle_echo(
	association: &ServerAssociation,
	command: &InMemDicomObject,
	presentation_context_id: Option<u8>,
) -> anyhow::Result<()> {
	let message_id = command_us(command, tags::MESSAGE_ID).unwrap_or(0);
	let response = CompositeEchoResponse {
		message_id,
		status: STATUS_SUCCESS,
	};
	association.write_message(response, presentation_context_id, MESSAGE_TIMEOUT).await?;
	Ok(())
}

async fn handle_store(
	ctx: &ComponentContext,
	association: &ServerAssociation,
	command: InMemDicomObject,
	data: Option<InMemDicomObject>,
	presentation_context_id: Option<u8>,
) -> anyhow::Result<()> {
	let message_id = command_us(&command, tags::MESSAGE_ID).unwrap_or(0);
	let sop_class_uid = command_str(&command, tags::AFFECTED_SOP_CLASS_UID).unwrap_or_default();
	let sop_instance_uid = command_str(&command, tags::AFFECTED_SOP_INSTANCE_UID).unwrap_or_default();

	let Some(dataset) = data else {
		let response = CompositeStoreResponse {
			message_id,
			status: STATUS_CANNOT_UNDERSTAND,
			sop_class_uid: sop_class_uid.clone(),
			sop_instance_uid: sop_instance_uid.clone(),
		};
		association.write_message(response, presentation_context_id, MESSAGE_TIMEOUT).await?;
		return Ok(());
	};

	let transfer_syntax = presentation_context_id
		.and_then(|id| association.presentation_contexts().iter().find(|pctx| pctx.id == id))
		.map(|pctx| pctx.transfer_syntax.clone())
		.unwrap_or_else(|| uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string());

	let sink = ctx
		.send_one(&OnGetFile {
			meta: IncomingStoreMeta {
				sop_class_uid: sop_class_uid.clone(),
				sop_instance_uid: sop_instance_uid.clone(),
				transfer_syntax: transfer_syntax.clone(),
			},
		})
		.await?;

	{
		let mut writer = sink.writer;
		let ts = TransferSyntaxRegistry
			.get(&transfer_syntax)
			.ok_or_else(|| anyhow::anyhow!("unknown transfer syntax '{transfer_syntax}'"))?;
		dataset.write_dataset_with_ts(&mut writer, ts)?;
	}

	let outcomes = ctx
		.broadcast(&Store {
			sop_class_uid: sop_class_uid.clone(),
			sop_instance_uid: sop_instance_uid.clone(),
			transfer_syntax,
			dataset,
		})
		.await?;

	let status = outcomes
		.into_iter()
		.find_map(|outcome| match outcome {
			StoreOutcome::Failure(reason) => Some(reason),
			StoreOutcome::Success => None,
		})
		.map(|reason| {
			warn!(reason, sop_instance_uid, "C-STORE handler reported failure");
			STATUS_PROCESSING_FAILURE
		})
		.unwrap_or(STATUS_SUCCESS);

	let response = CompositeStoreResponse {
		message_id,
		status,
		sop_class_uid,
		sop_instance_uid,
	};
	association.write_message(response, presentation_context_id, MESSAGE_TIMEOUT).await?;
	Ok(())
}

async fn handle_find(
	ctx: &ComponentContext,
	association: &ServerAssociation,
	command: InMemDicomObject,
	identifier: Option<InMemDicomObject>,
	presentation_context_id: Option<u8>,
) -> anyhow::Result<()> {
	let message_id = command_us(&command, tags::MESSAGE_ID).unwrap_or(0);
	let Some(identifier) = identifier else {
		let response = CompositeFindResponse {
			message_id,
			status: STATUS_CANNOT_UNDERSTAND,
			identifier: None,
		};
		association.write_message(response, presentation_context_id, MESSAGE_TIMEOUT).await?;
		return Ok(());
	};

	let query_retrieve_level = identifier
		.get(tags::QUERY_RETRIEVE_LEVEL)
		.and_then(|e| e.to_str().ok())
		.map(|v| v.trim().to_string())
		.unwrap_or_default();

	let results = match ctx
		.broadcast(&Find {
			query_retrieve_level,
			identifier,
		})
		.await
	{
		Ok(results) => results,
		Err(err) => {
			warn!(error = %err, "C-FIND identifier rejected");
			let response = CompositeFindResponse {
				message_id,
				status: STATUS_PROCESSING_FAILURE,
				identifier: None,
			};
			association.write_message(response, presentation_context_id, MESSAGE_TIMEOUT).await?;
			return Ok(());
		}
	};

	for item in results.into_iter().flatten() {
		let response = CompositeFindResponse {
			message_id,
			status: if item.pending { 0xFF00 } else { STATUS_SUCCESS },
			identifier: Some(item.dataset),
		};
		association.write_message(response, presentation_context_id, MESSAGE_TIMEOUT).await?;
	}

	let terminal = CompositeFindResponse {
		message_id,
		status: STATUS_SUCCESS,
		identifier: None,
	};
	association.write_message(terminal, presentation_context_id, MESSAGE_TIMEOUT).await?;
	Ok(())
}

async fn handle_move(
	ctx: &ComponentContext,
	association: &ServerAssociation,
	mediator: &MoveMediator,
	calling_aet: &str,
	command: InMemDicomObject,
	identifier: Option<InMemDicomObject>,
	presentation_context_id: Option<u8>,
) -> anyhow::Result<()> {
	let message_id = command_us(&command, tags::MESSAGE_ID).unwrap_or(0);
	let destination_aet = command_str(&command, tags::MOVE_DESTINATION).unwrap_or_default();
	let Some(identifier) = identifier else {
		return send_move_terminal(association, message_id, STATUS_CANNOT_UNDERSTAND, presentation_context_id).await;
	};

	let Some(destination) = ctx
		.send_any(&DeviceByAe {
			ae_title: destination_aet.clone(),
		})
		.await?
	else {
		warn!(destination_aet, "C-MOVE destination not found in device registry");
		return send_move_terminal(association, message_id, STATUS_PROCESSING_FAILURE, presentation_context_id).await;
	};

	// Held across the whole sub-operation loop below; for a Sequential-mode
	// destination this serializes concurrently-handled C-MOVE requests
	// targeting it, dropping automatically at the end of this function.
	let _permit = mediator.acquire_permit(&destination.ae_title, destination.retrieve_mode).await;

	let instances = ctx
		.broadcast(&Move {
			identifier,
			destination: destination.clone(),
		})
		.await?
		.into_iter()
		.flatten()
		.collect::<Vec<_>>();

	if instances.is_empty() {
		return send_move_terminal(association, message_id, STATUS_SUCCESS, presentation_context_id).await;
	}

	let outbound = match cmove::open_outbound(&destination, calling_aet, &instances).await {
		Ok(outbound) => outbound,
		Err(err) => {
			warn!(error = %err, destination_aet, "failed to open outbound association for C-MOVE");
			return send_move_terminal(association, message_id, STATUS_PROCESSING_FAILURE, presentation_context_id).await;
		}
	};

	cmove::push_all(
		&outbound,
		&instances,
		Some(calling_aet),
		Some(message_id),
		|counters, remaining| {
			Box::pin(send_move_pending(association, message_id, counters, remaining, presentation_context_id))
		},
	)
	.await?;

	send_move_terminal(association, message_id, STATUS_SUCCESS, presentation_context_id).await
}

async fn send_move_pending(
	association: &ServerAssociation,
	message_id: US,
	counters: SubOpCounters,
	remaining: US,
	presentation_context_id: Option<u8>,
) -> anyhow::Result<()> {
	let response = CompositeMoveResponse {
		message_id,
		status: 0xFF00,
		remaining,
		completed: counters.completed,
		failed: counters.failed,
		warning: counters.warning,
	};
	association.write_message(response, presentation_context_id, MESSAGE_TIMEOUT).await?;
	Ok(())
}

async fn send_move_terminal(
	association: &ServerAssociation,
	message_id: US,
	status: US,
	presentation_context_id: Option<u8>,
) -> anyhow::Result<()> {
	let response = CompositeMoveResponse {
		message_id,
		status,
		remaining: 0,
		completed: 0,
		failed: 0,
		warning: 0,
	};
	association.write_message(response, presentation_context_id, MESSAGE_TIMEOUT).await?;
	Ok(())
}

async fn handle_get(
	ctx: &ComponentContext,
	association: &ServerAssociation,
	command: InMemDicomObject,
	identifier: Option<InMemDicomObject>,
	presentation_context_id: Option<u8>,
) -> anyhow::Result<()> {
	let message_id = command_us(&command, tags::MESSAGE_ID).unwrap_or(0);
	let Some(identifier) = identifier else {
		return send_get_terminal(association, message_id, STATUS_CANNOT_UNDERSTAND, presentation_context_id).await;
	};

	let instances = ctx
		.broadcast(&Get { identifier })
		.await?
		.into_iter()
		.flatten()
		.collect::<Vec<_>>();

	if instances.is_empty() {
		return send_get_terminal(association, message_id, STATUS_SUCCESS, presentation_context_id).await;
	}

	cmove::push_all(association, &instances, None, None, |counters, remaining| {
		Box::pin(send_get_pending(association, message_id, counters, remaining, presentation_context_id))
	})
	.await?;

	send_get_terminal(association, message_id, STATUS_SUCCESS, presentation_context_id).await
}

async fn send_get_pending(
	association: &ServerAssociation,
	message_id: US,
	counters: SubOpCounters,
	remaining: US,
	presentation_context_id: Option<u8>,
) -> anyhow::Result<()> {
	let response = CompositeGetResponse {
		message_id,
		status: 0xFF00,
		remaining,
		completed: counters.completed,
		failed: counters.failed,
		warning: counters.warning,
	};
	association.write_message(response, presentation_context_id, MESSAGE_TIMEOUT).await?;
	Ok(())
}

async fn send_get_terminal(
	association: &ServerAssociation,
	message_id: US,
	status: US,
	presentation_context_id: Option<u8>,
) -> anyhow::Result<()> {
	let response = CompositeGetResponse {
		message_id,
		status,
		remaining: 0,
		completed: 0,
		failed: 0,
		warning: 0,
	};
	association.write_message(response, presentation_context_id, MESSAGE_TIMEOUT).await?;
	Ok(())
}

/// Storage Commitment (N-ACTION / deferred N-EVENT-REPORT). The requesting
/// AE is resolved up front so an unknown destination can fail the N-ACTION
/// cleanly instead of aborting mid-association; the result is then pushed
/// back over a freshly opened outbound association, decoupled from this one.
async fn handle_commitment(
	ctx: &ComponentContext,
	association: &ServerAssociation,
	calling_aet: &str,
	command: InMemDicomObject,
	action_info: Option<InMemDicomObject>,
	presentation_context_id: Option<u8>,
) -> anyhow::Result<()> {
	let message_id = command_us(&command, tags::MESSAGE_ID).unwrap_or(0);
	let calling_aet = calling_aet.to_string();

	let Some(destination) = ctx
		.send_any(&DeviceByAe {
			ae_title: calling_aet.clone(),
		})
		.await?
	else {
		warn!(calling_aet, "storage commitment requester not found in device registry");
		let response = ActionResponse {
			message_id,
			status: STATUS_PROCESSING_FAILURE,
		};
		association.write_message(response, presentation_context_id, MESSAGE_TIMEOUT).await?;
		return Ok(());
	};

	let pairs = referenced_sop_pairs(action_info.as_ref());

	let response = ActionResponse {
		message_id,
		status: STATUS_SUCCESS,
	};
	association.write_message(response, presentation_context_id, MESSAGE_TIMEOUT).await?;

	let ctx = ctx.clone();
	tokio::spawn(async move {
		let result = match ctx.broadcast(&Commitment { pairs }).await {
			Ok(results) => results.into_iter().next().unwrap_or_default(),
			Err(err) => {
				error!(error = %err, "storage commitment verification failed");
				return;
			}
		};

		let event = EventReportRequest {
			message_id: next_message_id(),
			affected_sop_class_uid: STORAGE_COMMITMENT_PUSH_MODEL_SOP_CLASS.to_string(),
			affected_sop_instance_uid: STORAGE_COMMITMENT_PUSH_MODEL_SOP_INSTANCE.to_string(),
			event_type_id: if result.failures.is_empty() { 1 } else { 2 },
			event_information: InMemDicomObject::new_empty(),
		};

		let outbound = match cmove::open_outbound_with_contexts(
			&destination,
			&calling_aet,
			vec![(
				STORAGE_COMMITMENT_PUSH_MODEL_SOP_CLASS.to_string(),
				vec![uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string()],
			)],
		)
		.await
		{
			Ok(outbound) => outbound,
			Err(err) => {
				error!(error = %err, "failed to open outbound association for storage commitment result");
				return;
			}
		};

		if let Err(err) = outbound.write_message(event, None, MESSAGE_TIMEOUT).await {
			error!(error = %err, "failed to deliver storage commitment N-EVENT-REPORT");
		}
	});

	Ok(())
}

/// Extracts `(ReferencedSOPClassUID, ReferencedSOPInstanceUID)` pairs from a
/// Referenced SOP Sequence inside an N-ACTION-RQ's action information.
fn referenced_sop_pairs(action_info: Option<&InMemDicomObject>) -> Vec<(String, String)> {
	let Some(action_info) = action_info else {
		return Vec::new();
	};
	let Some(sequence) = action_info.get(tags::REFERENCED_SOP_SEQUENCE) else {
		return Vec::new();
	};
	let Some(items) = sequence.items() else {
		return Vec::new();
	};

	items
		.iter()
		.filter_map(|item| {
			let class = item.get(tags::REFERENCED_SOP_CLASS_UID)?.to_str().ok()?.trim().to_string();
			let instance = item.get(tags::REFERENCED_SOP_INSTANCE_UID)?.to_str().ok()?.trim().to_string();
			Some((class, instance))
		})
		.collect()
}
