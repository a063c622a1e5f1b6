//! Composite DIMSE command-set builders and response parsers.
//!
//! Each request type implements `From<Request> for DicomMessage`; each
//! response type implements `TryFrom<DicomMessage>` reading back the
//! command-set attributes it needs.

use super::{DicomMessage, ReadError, DATA_SET_EXISTS, DATA_SET_MISSING};
use crate::types::{AE, UI, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;

pub const COMMAND_FIELD_COMPOSITE_ECHO_REQUEST: US = 0x0030;
pub const COMMAND_FIELD_COMPOSITE_ECHO_RESPONSE: US = 0x8030;
pub const COMMAND_FIELD_COMPOSITE_STORE_REQUEST: US = 0x0001;
pub const COMMAND_FIELD_COMPOSITE_STORE_RESPONSE: US = 0x8001;
pub const COMMAND_FIELD_COMPOSITE_FIND_REQUEST: US = 0x0020;
pub const COMMAND_FIELD_COMPOSITE_FIND_RESPONSE: US = 0x8020;
pub const COMMAND_FIELD_COMPOSITE_MOVE_REQUEST: US = 0x0021;
pub const COMMAND_FIELD_COMPOSITE_MOVE_RESPONSE: US = 0x8021;
pub const COMMAND_FIELD_COMPOSITE_GET_REQUEST: US = 0x0010;
pub const COMMAND_FIELD_COMPOSITE_GET_RESPONSE: US = 0x8010;
pub const COMMAND_FIELD_N_ACTION_REQUEST: US = 0x0130;
pub const COMMAND_FIELD_N_ACTION_RESPONSE: US = 0x8130;
pub const COMMAND_FIELD_N_EVENT_REPORT_REQUEST: US = 0x0100;
pub const COMMAND_FIELD_N_EVENT_REPORT_RESPONSE: US = 0x8100;

fn status_of(command: &InMemDicomObject) -> Result<US, ReadError> {
	command
		.get(tags::STATUS)
		.map(InMemElement::to_int::<US>)
		.and_then(Result::ok)
		.ok_or(ReadError::MissingAttribute(tags::STATUS))
}

fn message_id_of(command: &InMemDicomObject, tag: dicom::core::Tag) -> Result<US, ReadError> {
	command
		.get(tag)
		.map(InMemElement::to_int::<US>)
		.and_then(Result::ok)
		.ok_or(ReadError::MissingAttribute(tag))
}

/// C-ECHO-RQ
#[derive(Debug)]
pub struct CompositeEchoRequest {
	pub message_id: US,
}

impl From<CompositeEchoRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeEchoRequest) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::VERIFICATION)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_ECHO_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
		]);

		Self { command, data: None, presentation_context_id: None }
	}
}

/// C-ECHO-RSP
#[derive(Debug)]
pub struct CompositeEchoResponse {
	pub message_id: US,
	pub status: US,
}

impl From<CompositeEchoResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: CompositeEchoResponse) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::VERIFICATION)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_ECHO_RESPONSE])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
			DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status])),
		]);

		Self { command, data: None, presentation_context_id: None }
	}
}

impl TryFrom<DicomMessage> for CompositeEchoResponse {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		Ok(Self {
			message_id: message_id_of(&message.command, tags::MESSAGE_ID_BEING_RESPONDED_TO)?,
			status: status_of(&message.command)?,
		})
	}
}

/// C-FIND-RQ
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_9.html#table_9.1-2>
pub struct CompositeFindRequest {
	pub message_id: US,
	pub priority: US,
	pub affected_sop_class_uid: UI,
	pub identifier: InMemDicomObject,
}

impl From<CompositeFindRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeFindRequest) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.affected_sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_FIND_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
		]);

		Self { command, data: Some(request.identifier), presentation_context_id: None }
	}
}

/// C-FIND-RSP, one per matching entry plus a final status-only response.
#[derive(Debug)]
pub struct CompositeFindResponse {
	pub message_id: US,
	pub status: US,
	pub identifier: Option<InMemDicomObject>,
}

impl From<CompositeFindResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: CompositeFindResponse) -> Self {
		let data_set_type = if response.identifier.is_some() { DATA_SET_EXISTS } else { DATA_SET_MISSING };
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_FIND_RESPONSE])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [data_set_type])),
			DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status])),
		]);

		Self { command, data: response.identifier, presentation_context_id: None }
	}
}

impl TryFrom<DicomMessage> for CompositeFindResponse {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		Ok(Self {
			message_id: message_id_of(&message.command, tags::MESSAGE_ID_BEING_RESPONDED_TO)?,
			status: status_of(&message.command)?,
			identifier: message.data,
		})
	}
}

/// C-MOVE-RQ
pub struct CompositeMoveRequest {
	pub identifier: InMemDicomObject,
	pub message_id: US,
	pub priority: US,
	pub affected_sop_class_uid: UI,
	pub destination: AE,
}

impl From<CompositeMoveRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeMoveRequest) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.affected_sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_MOVE_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
			DataElement::new(tags::MOVE_DESTINATION, VR::AE, dicom_value!(Str, request.destination)),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
		]);

		Self { command, data: Some(request.identifier), presentation_context_id: None }
	}
}

/// C-MOVE-RSP: pending sub-operation progress, or a final terminal status.
#[derive(Debug)]
pub struct CompositeMoveResponse {
	pub message_id: US,
	pub status: US,
	pub remaining: US,
	pub completed: US,
	pub failed: US,
	pub warning: US,
}

impl From<CompositeMoveResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: CompositeMoveResponse) -> Self {
		let data_set_type = DATA_SET_MISSING;
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_MOVE_RESPONSE])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [data_set_type])),
			DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status])),
			DataElement::new(tags::NUMBER_OF_REMAINING_SUBOPERATIONS, VR::US, dicom_value!(U16, [response.remaining])),
			DataElement::new(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS, VR::US, dicom_value!(U16, [response.completed])),
			DataElement::new(tags::NUMBER_OF_FAILED_SUBOPERATIONS, VR::US, dicom_value!(U16, [response.failed])),
			DataElement::new(tags::NUMBER_OF_WARNING_SUBOPERATIONS, VR::US, dicom_value!(U16, [response.warning])),
		]);

		Self { command, data: None, presentation_context_id: None }
	}
}

/// C-GET-RQ
pub struct CompositeGetRequest {
	pub identifier: InMemDicomObject,
	pub message_id: US,
	pub priority: US,
	pub affected_sop_class_uid: UI,
}

impl From<CompositeGetRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeGetRequest) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.affected_sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_GET_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
		]);

		Self { command, data: Some(request.identifier), presentation_context_id: None }
	}
}

/// C-GET-RSP: pending sub-operation progress, or a final terminal status.
#[derive(Debug)]
pub struct CompositeGetResponse {
	pub message_id: US,
	pub status: US,
	pub remaining: US,
	pub completed: US,
	pub failed: US,
	pub warning: US,
}

impl From<CompositeGetResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: CompositeGetResponse) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_GET_RESPONSE])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
			DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status])),
			DataElement::new(tags::NUMBER_OF_REMAINING_SUBOPERATIONS, VR::US, dicom_value!(U16, [response.remaining])),
			DataElement::new(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS, VR::US, dicom_value!(U16, [response.completed])),
			DataElement::new(tags::NUMBER_OF_FAILED_SUBOPERATIONS, VR::US, dicom_value!(U16, [response.failed])),
			DataElement::new(tags::NUMBER_OF_WARNING_SUBOPERATIONS, VR::US, dicom_value!(U16, [response.warning])),
		]);

		Self { command, data: None, presentation_context_id: None }
	}
}

/// C-STORE-RQ
pub struct CompositeStoreRequest {
	pub affected_sop_class_uid: UI,
	pub affected_sop_instance_uid: UI,
	pub move_originator_aet: Option<AE>,
	pub move_originator_message_id: Option<US>,
	pub message_id: US,
	pub priority: US,
	pub data_set: InMemDicomObject,
}

impl From<CompositeStoreRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeStoreRequest) -> Self {
		let mut command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_STORE_REQUEST])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.affected_sop_class_uid)),
			DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, request.affected_sop_instance_uid)),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
		]);

		if let Some(move_originator_message_id) = request.move_originator_message_id {
			command.put_element(DataElement::new(tags::MOVE_ORIGINATOR_MESSAGE_ID, VR::US, dicom_value!(U16, [move_originator_message_id])));
		}

		if let Some(move_originator_aet) = request.move_originator_aet {
			command.put_element(DataElement::new(tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE, VR::AE, dicom_value!(Str, move_originator_aet)));
		}

		Self { command, data: Some(request.data_set), presentation_context_id: None }
	}
}

/// C-STORE-RSP
pub struct CompositeStoreResponse {
	pub message_id: US,
	pub status: US,
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
}

impl From<CompositeStoreResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: CompositeStoreResponse) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, response.sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_STORE_RESPONSE])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
			DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status])),
			DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, response.sop_instance_uid)),
		]);

		Self { command, data: None, presentation_context_id: None }
	}
}

impl TryFrom<DicomMessage> for CompositeStoreResponse {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		let sop_class_uid = message
			.command
			.get(tags::AFFECTED_SOP_CLASS_UID)
			.and_then(|e| e.to_str().ok())
			.map(|c| c.trim().to_string())
			.ok_or(ReadError::MissingAttribute(tags::AFFECTED_SOP_CLASS_UID))?;
		let sop_instance_uid = message
			.command
			.get(tags::AFFECTED_SOP_INSTANCE_UID)
			.and_then(|e| e.to_str().ok())
			.map(|c| c.trim().to_string())
			.ok_or(ReadError::MissingAttribute(tags::AFFECTED_SOP_INSTANCE_UID))?;

		Ok(Self {
			message_id: message_id_of(&message.command, tags::MESSAGE_ID_BEING_RESPONDED_TO)?,
			status: status_of(&message.command)?,
			sop_class_uid,
			sop_instance_uid,
		})
	}
}

/// N-ACTION-RQ carrying a Storage Commitment Push Model request payload.
pub struct ActionRequest {
	pub message_id: US,
	pub requested_sop_class_uid: UI,
	pub requested_sop_instance_uid: UI,
	pub action_type_id: US,
	pub action_information: InMemDicomObject,
}

impl From<ActionRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: ActionRequest) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::REQUESTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.requested_sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_N_ACTION_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::REQUESTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, request.requested_sop_instance_uid)),
			DataElement::new(tags::ACTION_TYPE_ID, VR::US, dicom_value!(U16, [request.action_type_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
		]);

		Self { command, data: Some(request.action_information), presentation_context_id: None }
	}
}

/// N-ACTION-RSP
pub struct ActionResponse {
	pub message_id: US,
	pub status: US,
}

impl From<ActionResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: ActionResponse) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_N_ACTION_RESPONSE])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
			DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status])),
		]);

		Self { command, data: None, presentation_context_id: None }
	}
}

impl TryFrom<DicomMessage> for ActionResponse {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		Ok(Self {
			message_id: message_id_of(&message.command, tags::MESSAGE_ID_BEING_RESPONDED_TO)?,
			status: status_of(&message.command)?,
		})
	}
}

/// N-EVENT-REPORT-RQ: the deferred Storage Commitment result, delivered by
/// this node acting as an SCU back to the requesting AE.
pub struct EventReportRequest {
	pub message_id: US,
	pub affected_sop_class_uid: UI,
	pub affected_sop_instance_uid: UI,
	pub event_type_id: US,
	pub event_information: InMemDicomObject,
}

impl From<EventReportRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: EventReportRequest) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.affected_sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_N_EVENT_REPORT_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, request.affected_sop_instance_uid)),
			DataElement::new(tags::EVENT_TYPE_ID, VR::US, dicom_value!(U16, [request.event_type_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
		]);

		Self { command, data: Some(request.event_information), presentation_context_id: None }
	}
}

/// N-EVENT-REPORT-RSP
pub struct EventReportResponse {
	pub message_id: US,
	pub status: US,
}

impl TryFrom<DicomMessage> for EventReportResponse {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		Ok(Self {
			message_id: message_id_of(&message.command, tags::MESSAGE_ID_BEING_RESPONDED_TO)?,
			status: status_of(&message.command)?,
		})
	}
}

impl From<EventReportResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: EventReportResponse) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_N_EVENT_REPORT_RESPONSE])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
			DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status])),
		]);

		Self { command, data: None, presentation_context_id: None }
	}
}
