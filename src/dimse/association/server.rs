use super::{oneshot, AskPattern, Association, AssociationError, ChannelError, Command, Sender};
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::pdu::Pdu;
use dicom::ul::pdu::PresentationContextNegotiated;
use std::convert::identity;
use std::io::{ErrorKind, Write};
use std::{net::TcpStream, thread, time::Duration, time::Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Offset and length of the Called AE Title field within an A-ASSOCIATE-RQ
/// PDU, and the number of leading bytes that must be read to reach it.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part08/sect_9.3.2.html>
const ASSOCIATE_RQ_HEADER_LEN: usize = 42;
const CALLED_AE_TITLE_OFFSET: usize = 10;
const AE_TITLE_FIELD_LEN: usize = 16;

/// A-ASSOCIATE-RJ PDU rejecting the association: result=1 (rejected,
/// permanent), source=1 (DICOM UL service-user), reason=7 (called AE title
/// not recognized).
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part08/sect_9.3.4.html>
const ASSOCIATE_RJ_CALLED_AE_TITLE_NOT_RECOGNIZED: [u8; 10] =
	[0x03, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x01, 0x01, 0x07];

/// Peeks (without consuming) the Called AE Title out of the A-ASSOCIATE-RQ
/// header the client is about to send, so the allow-list can be checked
/// before handing the stream to `dicom::ul`, whose own `ae_title()` builder
/// only accepts a single title.
fn peek_called_ae_title(stream: &TcpStream) -> std::io::Result<String> {
	let mut buf = [0u8; ASSOCIATE_RQ_HEADER_LEN];
	let deadline = Instant::now() + Duration::from_secs(10);
	loop {
		let n = stream.peek(&mut buf)?;
		if n >= buf.len() {
			break;
		}
		if Instant::now() >= deadline {
			return Err(std::io::Error::new(
				ErrorKind::TimedOut,
				"timed out waiting for A-ASSOCIATE-RQ header",
			));
		}
		thread::sleep(Duration::from_millis(10));
	}
	let field = &buf[CALLED_AE_TITLE_OFFSET..CALLED_AE_TITLE_OFFSET + AE_TITLE_FIELD_LEN];
	Ok(String::from_utf8_lossy(field).trim().to_string())
}

#[derive(Debug)]
pub struct ServerAssociation {
	channel: Sender<Command>,
	presentation_contexts: Vec<PresentationContextNegotiated>,
	tcp_stream: TcpStream,
	calling_ae_title: String,
	called_ae_title: String,
}

pub struct ServerAssociationOptions {
	/// The allow-list of called AE titles this listener accepts; the
	/// association is rejected if the client addressed none of them.
	pub ae_titles: Vec<String>,
	pub tcp_stream: TcpStream,
	/// Transfer syntax UIDs to advertise. Empty means every transfer syntax
	/// the registry supports (codec included).
	pub supported_ts: Vec<String>,
}

impl ServerAssociation {
	pub async fn new(options: ServerAssociationOptions) -> Result<Self, AssociationError> {
		let called_ae_title =
			peek_called_ae_title(&options.tcp_stream).map_err(AssociationError::AssociateRqHeader)?;
		if !options.ae_titles.iter().any(|aet| aet == &called_ae_title) {
			warn!(called_ae_title, "rejecting association: called AE title not in allow-list");
			if let Ok(mut stream) = options.tcp_stream.try_clone() {
				let _ = stream.write_all(&ASSOCIATE_RJ_CALLED_AE_TITLE_NOT_RECOGNIZED);
				let _ = stream.shutdown(std::net::Shutdown::Both);
			}
			return Err(AssociationError::CalledAeTitleRejected(called_ae_title));
		}

		let uuid = Uuid::new_v4();
		let mut server_options = dicom::ul::ServerAssociationOptions::new()
			.accept_called_ae_title()
			.ae_title(called_ae_title.clone())
			.promiscuous(true);

		if options.supported_ts.is_empty() {
			for syntax in TransferSyntaxRegistry.iter() {
				if !syntax.is_unsupported() {
					server_options = server_options.with_transfer_syntax(syntax.uid());
				}
			}
		} else {
			for uid in &options.supported_ts {
				server_options = server_options.with_transfer_syntax(uid.as_str());
			}
		}

		let (connect_tx, connect_result) = oneshot::channel::<Result<_, AssociationError>>();

		let (tx, mut rx) = tokio::sync::mpsc::channel::<Command>(1);
		let thread_ae_title = called_ae_title.clone();
		let _handle = thread::Builder::new()
			.name(format!("{called_ae_title}-server"))
			.spawn(move || {
				let called_ae_title = thread_ae_title;
				let span = tracing::info_span!("ServerAssociation", association_id = uuid.to_string());
				let _enter = span.enter();

				let mut association = match server_options.establish(options.tcp_stream) {
					Ok(mut association) => {
						let calling_ae_title = association.client_ae_title().to_string();
						info!(
							calling_aet = calling_ae_title,
							called_aet = called_ae_title,
							"Established new server association"
						);

						let pcs = association.presentation_contexts().to_vec();

						let stream = association.inner_stream().try_clone().expect("TcpStream::clone");

						connect_tx.send(Ok((stream, pcs, calling_ae_title))).map_err(|_value| ())?;
						association
					}
					Err(e) => {
						connect_tx.send(Err(e.into())).map_err(|_value| ())?;
						return Err(());
					}
				};

				while let Some(command) = rx.blocking_recv() {
					let result = match command {
						Command::Send(pdu, response) => {
							let send_result = association.send(&pdu).map_err(AssociationError::from);
							response.send(send_result).map_err(|_value| ChannelError::Closed)
						}
						Command::Receive(response) => {
							let receive_result = association.receive().map_err(AssociationError::from);
							response.send(receive_result).map_err(|_value| ChannelError::Closed)
						}
					};

					if let Some(err) = result.err() {
						error!("Error in ServerAssociation: {err}");
						return Err(());
					}
				}

				rx.close();

				if let Err(e) = association.abort() {
					match e {
						dicom::ul::association::Error::WireSend { source, .. } if source.kind() == ErrorKind::BrokenPipe => {
							// already closed on the peer side
						}
						_ => {
							warn!("ServerAssociation.abort() returned error: {e}");
						}
					}
				}

				Ok(())
			})
			.map_err(AssociationError::OsThread)?;

		let (tcp_stream, presentation_contexts, calling_ae_title) =
			connect_result.await.expect("connect_result.await")?;

		Ok(Self {
			channel: tx,
			presentation_contexts,
			tcp_stream,
			calling_ae_title,
			called_ae_title,
		})
	}

	pub fn calling_ae_title(&self) -> &str {
		&self.calling_ae_title
	}

	pub fn called_ae_title(&self) -> &str {
		&self.called_ae_title
	}
}

impl Association for ServerAssociation {
	async fn receive(&self, timeout: Duration) -> Result<Pdu, AssociationError> {
		self.channel.ask(Command::Receive, timeout).await.map_err(AssociationError::from).and_then(identity)
	}

	async fn send(&self, pdu: Pdu, timeout: Duration) -> Result<(), AssociationError> {
		self.channel
			.ask(|reply_to| Command::Send(pdu, reply_to), timeout)
			.await
			.map_err(AssociationError::from)
			.and_then(identity)
	}

	fn close(&mut self) {
		debug!("Closing TcpStream from outside");

		if let Err(err) = self.tcp_stream.shutdown(std::net::Shutdown::Both) {
			warn!("TcpStream::shutdown failed: {err}");
		}
	}

	fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
		&self.presentation_contexts
	}
}

impl Drop for ServerAssociation {
	fn drop(&mut self) {
		self.close();
	}
}
