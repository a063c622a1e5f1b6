//! Typed pub/sub event bus.
//!
//! Channels are not strings at runtime: each channel is a distinct Rust type
//! implementing [`Event`], and the bus is a generic dispatcher keyed on
//! [`TypeId`]. This keeps handler signatures statically typed end to end
//! while still letting independent components subscribe without knowing one
//! another, per the message-passing-over-shared-state design note.

mod channels;

pub use channels::*;

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

/// Default handler priority. Lower numeric values dispatch earlier.
pub const DEFAULT_PRIORITY: i32 = 50;

/// A channel marker type. `Output` is whatever a handler on this channel
/// produces.
pub trait Event: Send + Sync + 'static {
	type Output: Send + 'static;
}

/// A handler subscribed to some `E: Event`.
#[async_trait]
pub trait Handler<E: Event>: Send + Sync {
	async fn handle(&self, event: &E) -> anyhow::Result<E::Output>;
}

/// Marker for outputs that can report "no value", used by [`EventBus::send_any`].
pub trait MaybeEmpty {
	fn is_empty_value(&self) -> bool;
}

impl<T> MaybeEmpty for Option<T> {
	fn is_empty_value(&self) -> bool {
		self.is_none()
	}
}

#[derive(Debug, Error)]
pub enum BusError {
	#[error("no listeners registered on this channel")]
	NoListeners,
	#[error("event handling error: {0}")]
	Handler(#[from] anyhow::Error),
}

struct Entry<E: Event> {
	priority: i32,
	seq: u64,
	handler: Arc<dyn Handler<E>>,
}

impl<E: Event> Clone for Entry<E> {
	fn clone(&self) -> Self {
		Self {
			priority: self.priority,
			seq: self.seq,
			handler: Arc::clone(&self.handler),
		}
	}
}

/// Channel storage is type-erased: the map holds one `Vec<Entry<E>>` boxed as
/// `Any` per distinct `E`, downcast back to its concrete type on access.
#[derive(Default)]
pub struct EventBus {
	channels: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
	next_seq: Mutex<u64>,
}

impl EventBus {
	pub fn new() -> Self {
		Self::default()
	}

	fn next_sequence(&self) -> u64 {
		let mut seq = self.next_seq.lock().expect("bus sequence lock poisoned");
		*seq += 1;
		*seq
	}

	/// Subscribe `handler` on channel `E` with the given priority. Subscribing
	/// the same handler (by `Arc` identity) on the same channel twice is a
	/// no-op.
	pub fn subscribe<E: Event>(&self, handler: Arc<dyn Handler<E>>, priority: i32) {
		let seq = self.next_sequence();
		let mut channels = self.channels.lock().expect("bus channel lock poisoned");
		let entries = channels
			.entry(TypeId::of::<E>())
			.or_insert_with(|| Box::new(Vec::<Entry<E>>::new()))
			.downcast_mut::<Vec<Entry<E>>>()
			.expect("channel type mismatch");

		let already_subscribed = entries
			.iter()
			.any(|e| Arc::ptr_eq(&e.handler, &handler));
		if already_subscribed {
			return;
		}
		entries.push(Entry {
			priority,
			seq,
			handler,
		});
	}

	/// Subscribe with the [`DEFAULT_PRIORITY`].
	pub fn subscribe_default<E: Event>(&self, handler: Arc<dyn Handler<E>>) {
		self.subscribe(handler, DEFAULT_PRIORITY);
	}

	fn ordered_entries<E: Event>(&self) -> Vec<Entry<E>> {
		let mut channels = self.channels.lock().expect("bus channel lock poisoned");
		let entries = channels
			.entry(TypeId::of::<E>())
			.or_insert_with(|| Box::new(Vec::<Entry<E>>::new()))
			.downcast_mut::<Vec<Entry<E>>>()
			.expect("channel type mismatch");
		let mut ordered = entries.clone();
		ordered.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.seq.cmp(&b.seq)));
		ordered
	}

	/// Invoke every handler in priority order, collecting results. The first
	/// handler error aborts dispatch; later handlers do not run.
	pub async fn broadcast<E: Event>(&self, event: &E) -> anyhow::Result<Vec<E::Output>> {
		let entries = self.ordered_entries::<E>();
		let mut out = Vec::with_capacity(entries.len());
		for entry in entries {
			out.push(entry.handler.handle(event).await?);
		}
		Ok(out)
	}

	/// Invoke every handler in priority order, catching each handler's error
	/// instead of aborting. Always runs every handler.
	pub async fn broadcast_nothrow<E: Event>(&self, event: &E) -> Vec<(Option<E::Output>, bool)> {
		let entries = self.ordered_entries::<E>();
		let mut out = Vec::with_capacity(entries.len());
		for entry in entries {
			match entry.handler.handle(event).await {
				Ok(value) => out.push((Some(value), false)),
				Err(err) => {
					tracing::warn!(error = %err, "handler failed during broadcast_nothrow");
					out.push((None, true));
				}
			}
		}
		out
	}

	/// Invoke only the highest-priority (lowest-numbered) handler.
	pub async fn send_one<E: Event>(&self, event: &E) -> Result<E::Output, BusError> {
		let entries = self.ordered_entries::<E>();
		let first = entries.first().ok_or(BusError::NoListeners)?;
		first.handler.handle(event).await.map_err(BusError::Handler)
	}

	/// Invoke handlers in priority order until one returns a non-empty value.
	pub async fn send_any<E: Event>(&self, event: &E) -> anyhow::Result<E::Output>
	where
		E::Output: MaybeEmpty + Default,
	{
		let entries = self.ordered_entries::<E>();
		for entry in entries {
			let value = entry.handler.handle(event).await?;
			if !value.is_empty_value() {
				return Ok(value);
			}
		}
		Ok(E::Output::default())
	}

	/// True if at least one handler is subscribed on `E`.
	pub fn has_listeners<E: Event>(&self) -> bool {
		let mut channels = self.channels.lock().expect("bus channel lock poisoned");
		channels
			.entry(TypeId::of::<E>())
			.or_insert_with(|| Box::new(Vec::<Entry<E>>::new()))
			.downcast_ref::<Vec<Entry<E>>>()
			.expect("channel type mismatch")
			.len()
			> 0
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};

	struct Ping;
	impl Event for Ping {
		type Output = i32;
	}

	struct Recorder {
		tag: i32,
		order: Arc<Mutex<Vec<i32>>>,
	}

	#[async_trait]
	impl Handler<Ping> for Recorder {
		async fn handle(&self, _event: &Ping) -> anyhow::Result<i32> {
			self.order.lock().unwrap().push(self.tag);
			Ok(self.tag)
		}
	}

	#[tokio::test]
	async fn broadcast_runs_in_priority_then_insertion_order() {
		let bus = EventBus::new();
		let order = Arc::new(Mutex::new(Vec::new()));

		bus.subscribe(
			Arc::new(Recorder {
				tag: 1,
				order: order.clone(),
			}),
			50,
		);
		bus.subscribe(
			Arc::new(Recorder {
				tag: 2,
				order: order.clone(),
			}),
			10,
		);
		bus.subscribe(
			Arc::new(Recorder {
				tag: 3,
				order: order.clone(),
			}),
			50,
		);

		let results = bus.broadcast(&Ping).await.unwrap();
		assert_eq!(results, vec![2, 1, 3]);
		assert_eq!(*order.lock().unwrap(), vec![2, 1, 3]);
	}

	struct Failing;
	#[async_trait]
	impl Handler<Ping> for Failing {
		async fn handle(&self, _event: &Ping) -> anyhow::Result<i32> {
			anyhow::bail!("boom")
		}
	}

	#[tokio::test]
	async fn broadcast_aborts_on_first_error() {
		let bus = EventBus::new();
		let count = Arc::new(AtomicUsize::new(0));

		struct Counting(Arc<AtomicUsize>);
		#[async_trait]
		impl Handler<Ping> for Counting {
			async fn handle(&self, _event: &Ping) -> anyhow::Result<i32> {
				self.0.fetch_add(1, Ordering::SeqCst);
				Ok(0)
			}
		}

		bus.subscribe(Arc::new(Failing), 10);
		bus.subscribe(Arc::new(Counting(count.clone())), 20);

		let result = bus.broadcast(&Ping).await;
		assert!(result.is_err());
		assert_eq!(count.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn broadcast_nothrow_runs_everyone() {
		let bus = EventBus::new();
		let count = Arc::new(AtomicUsize::new(0));

		struct Counting(Arc<AtomicUsize>);
		#[async_trait]
		impl Handler<Ping> for Counting {
			async fn handle(&self, _event: &Ping) -> anyhow::Result<i32> {
				self.0.fetch_add(1, Ordering::SeqCst);
				Ok(7)
			}
		}

		bus.subscribe(Arc::new(Failing), 10);
		bus.subscribe(Arc::new(Counting(count.clone())), 20);

		let results = bus.broadcast_nothrow(&Ping).await;
		assert_eq!(results.len(), 2);
		assert!(results[0].1);
		assert_eq!(results[1], (Some(7), false));
		assert_eq!(count.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn send_one_picks_lowest_priority_number() {
		let bus = EventBus::new();
		let order = Arc::new(Mutex::new(Vec::new()));

		bus.subscribe(
			Arc::new(Recorder {
				tag: 1,
				order: order.clone(),
			}),
			50,
		);
		bus.subscribe(
			Arc::new(Recorder {
				tag: 2,
				order: order.clone(),
			}),
			10,
		);

		let result = bus.send_one(&Ping).await.unwrap();
		assert_eq!(result, 2);
	}

	#[tokio::test]
	async fn send_one_fails_with_no_listeners() {
		let bus = EventBus::new();
		let err = bus.send_one(&Ping).await.unwrap_err();
		assert!(matches!(err, BusError::NoListeners));
	}

	struct MaybeNone;
	impl Event for MaybeNone {
		type Output = Option<i32>;
	}

	struct ReturnsNone;
	#[async_trait]
	impl Handler<MaybeNone> for ReturnsNone {
		async fn handle(&self, _event: &MaybeNone) -> anyhow::Result<Option<i32>> {
			Ok(None)
		}
	}

	struct ReturnsSome(i32);
	#[async_trait]
	impl Handler<MaybeNone> for ReturnsSome {
		async fn handle(&self, _event: &MaybeNone) -> anyhow::Result<Option<i32>> {
			Ok(Some(self.0))
		}
	}

	#[tokio::test]
	async fn send_any_short_circuits_on_first_non_empty() {
		let bus = EventBus::new();
		bus.subscribe(Arc::new(ReturnsNone), 10);
		bus.subscribe(Arc::new(ReturnsSome(42)), 20);
		bus.subscribe(Arc::new(ReturnsSome(99)), 30);

		let result = bus.send_any(&MaybeNone).await.unwrap();
		assert_eq!(result, Some(42));
	}

	#[tokio::test]
	async fn send_any_returns_empty_when_all_empty() {
		let bus = EventBus::new();
		bus.subscribe(Arc::new(ReturnsNone), 10);
		let result = bus.send_any(&MaybeNone).await.unwrap();
		assert_eq!(result, None);
	}

	#[tokio::test]
	async fn subscribe_is_idempotent_on_handler_identity() {
		let bus = EventBus::new();
		let order = Arc::new(Mutex::new(Vec::new()));
		let handler: Arc<Recorder> = Arc::new(Recorder {
			tag: 1,
			order: order.clone(),
		});

		bus.subscribe(handler.clone(), 10);
		bus.subscribe(handler.clone(), 10);
		bus.subscribe(handler, 10);

		let results = bus.broadcast(&Ping).await.unwrap();
		assert_eq!(results, vec![1]);
	}
}
