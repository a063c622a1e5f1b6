//! Pluggable component lifecycle: start / started / exit.
//!
//! A component is a value bound to the bus and a configuration slice. It
//! subscribes one handler per lifecycle channel in its constructor and may
//! subscribe additional handlers; components never hold references to one
//! another, only to the bus.

use std::sync::Arc;

use async_trait::async_trait;

use crate::bus::{Event, EventBus, Handler, OnExit, OnStart, OnStarted};

/// Default component priority, matching the bus default.
pub const DEFAULT_COMPONENT_PRIORITY: i32 = 50;

/// Shared context every component holds: the bus plus its own configuration
/// slice. Cheap to clone (an `Arc` and a `serde_json::Value`).
#[derive(Clone)]
pub struct ComponentContext {
	pub bus: Arc<EventBus>,
	pub config: Arc<serde_json::Value>,
}

impl ComponentContext {
	pub fn new(bus: Arc<EventBus>, config: serde_json::Value) -> Self {
		Self {
			bus,
			config: Arc::new(config),
		}
	}

	pub fn subscribe<E: Event>(&self, handler: Arc<dyn Handler<E>>, priority: i32) {
		self.bus.subscribe(handler, priority);
	}

	pub fn subscribe_default<E: Event>(&self, handler: Arc<dyn Handler<E>>) {
		self.bus.subscribe_default(handler);
	}

	pub async fn broadcast<E: Event>(&self, event: &E) -> anyhow::Result<Vec<E::Output>> {
		self.bus.broadcast(event).await
	}

	pub async fn broadcast_nothrow<E: Event>(&self, event: &E) -> Vec<(Option<E::Output>, bool)> {
		self.bus.broadcast_nothrow(event).await
	}

	pub async fn send_one<E: Event>(&self, event: &E) -> Result<E::Output, crate::bus::BusError> {
		self.bus.send_one(event).await
	}

	pub async fn send_any<E: Event>(&self, event: &E) -> anyhow::Result<E::Output>
	where
		E::Output: crate::bus::MaybeEmpty + Default,
	{
		self.bus.send_any(event).await
	}
}

/// Implemented by every component. `on_start`/`on_started`/`on_exit` default
/// to a no-op plus a debug log, matching the base class every Python
/// component inherited from.
#[async_trait]
pub trait Lifecycle: Send + Sync {
	fn name(&self) -> &str;

	async fn on_start(&self) -> anyhow::Result<()> {
		tracing::debug!(component = self.name(), "on_start (default no-op)");
		Ok(())
	}

	async fn on_started(&self) -> anyhow::Result<()> {
		tracing::debug!(component = self.name(), "on_started (default no-op)");
		Ok(())
	}

	async fn on_exit(&self) -> anyhow::Result<()> {
		tracing::debug!(component = self.name(), "on_exit (default no-op)");
		Ok(())
	}
}

/// Bridges a `Lifecycle` impl onto the three bus lifecycle channels. One
/// `LifecycleBridge` is subscribed per component at construction time.
pub struct LifecycleBridge<C> {
	pub component: Arc<C>,
}

#[async_trait]
impl<C: Lifecycle + 'static> Handler<OnStart> for LifecycleBridge<C> {
	async fn handle(&self, _event: &OnStart) -> anyhow::Result<()> {
		self.component.on_start().await
	}
}

#[async_trait]
impl<C: Lifecycle + 'static> Handler<OnStarted> for LifecycleBridge<C> {
	async fn handle(&self, _event: &OnStarted) -> anyhow::Result<()> {
		self.component.on_started().await
	}
}

#[async_trait]
impl<C: Lifecycle + 'static> Handler<OnExit> for LifecycleBridge<C> {
	async fn handle(&self, _event: &OnExit) -> anyhow::Result<()> {
		self.component.on_exit().await
	}
}

/// Registers the three lifecycle handlers for `component` at
/// [`DEFAULT_COMPONENT_PRIORITY`], as every component's constructor does.
pub fn register_lifecycle<C: Lifecycle + 'static>(bus: &EventBus, component: Arc<C>) {
	let bridge = Arc::new(LifecycleBridge {
		component: component.clone(),
	});
	bus.subscribe(
		bridge.clone() as Arc<dyn Handler<OnStart>>,
		DEFAULT_COMPONENT_PRIORITY,
	);
	bus.subscribe(
		bridge.clone() as Arc<dyn Handler<OnStarted>>,
		DEFAULT_COMPONENT_PRIORITY,
	);
	bus.subscribe(
		bridge as Arc<dyn Handler<OnExit>>,
		DEFAULT_COMPONENT_PRIORITY,
	);
}

#[cfg(test)]
mod tests {
	use super::*;

	struct Noop;
	impl Lifecycle for Noop {
		fn name(&self) -> &str {
			"noop"
		}
	}

	#[tokio::test]
	async fn lifecycle_channels_are_always_present() {
		let bus = EventBus::new();
		register_lifecycle(&bus, Arc::new(Noop));

		bus.broadcast(&OnStart).await.unwrap();
		bus.broadcast(&OnStarted).await.unwrap();
		bus.broadcast_nothrow(&OnExit).await;
	}
}
