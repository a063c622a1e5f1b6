//! Device registry: AE-title -> network endpoint, with auto-learning on
//! association.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::bus::{Assoc, DeviceByAe, DeviceEndpoint, Handler};
use crate::component::{register_lifecycle, ComponentContext, Lifecycle};

/// Whether sub-operation pushes to a destination AE during C-MOVE run one at
/// a time (`Sequential`) or may overlap across concurrently-handled C-MOVE
/// requests targeting the same AE (`Concurrent`, the default).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetrieveMode {
	#[default]
	Concurrent,
	Sequential,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DevicesConfig {
	pub auto_add: bool,
	pub default_port: u16,
	/// Per-destination-AE C-MOVE retrieve mode, keyed by AE title. An AE
	/// absent from this map uses `RetrieveMode::default()`.
	pub retrieve_mode: HashMap<String, RetrieveMode>,
}

impl Default for DevicesConfig {
	fn default() -> Self {
		Self {
			auto_add: true,
			default_port: 104,
			retrieve_mode: HashMap::new(),
		}
	}
}

pub struct DeviceRegistry {
	config: DevicesConfig,
	devices: Mutex<HashMap<String, DeviceEndpoint>>,
}

impl DeviceRegistry {
	pub fn new(ctx: &ComponentContext) -> Arc<Self> {
		let config: DevicesConfig =
			serde_json::from_value(ctx.config.as_ref().clone()).unwrap_or_default();
		let this = Arc::new(Self {
			config,
			devices: Mutex::new(HashMap::new()),
		});
		register_lifecycle(&ctx.bus, this.clone());
		ctx.bus
			.subscribe_default(this.clone() as Arc<dyn Handler<Assoc>>);
		ctx.bus
			.subscribe_default(this.clone() as Arc<dyn Handler<DeviceByAe>>);
		this
	}

	pub fn register(&self, endpoint: DeviceEndpoint) {
		self.devices
			.lock()
			.expect("device registry lock poisoned")
			.insert(endpoint.ae_title.clone(), endpoint);
	}

	pub fn lookup(&self, ae_title: &str) -> Option<DeviceEndpoint> {
		self.devices
			.lock()
			.expect("device registry lock poisoned")
			.get(ae_title)
			.cloned()
	}
}

impl Lifecycle for DeviceRegistry {
	fn name(&self) -> &str {
		"Devices"
	}
}

#[async_trait]
impl Handler<Assoc> for DeviceRegistry {
	async fn handle(&self, event: &Assoc) -> anyhow::Result<()> {
		if !self.config.auto_add {
			return Ok(());
		}
		let retrieve_mode = self.config.retrieve_mode.get(&event.calling_ae).copied().unwrap_or_default();
		let mut devices = self.devices.lock().expect("device registry lock poisoned");
		devices
			.entry(event.calling_ae.clone())
			.or_insert_with(|| DeviceEndpoint {
				ae_title: event.calling_ae.clone(),
				address: event.peer_address.clone(),
				port: self.config.default_port,
				retrieve_mode,
			});
		Ok(())
	}
}

#[async_trait]
impl Handler<DeviceByAe> for DeviceRegistry {
	async fn handle(&self, event: &DeviceByAe) -> anyhow::Result<Option<DeviceEndpoint>> {
		Ok(self.lookup(&event.ae_title))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::bus::EventBus;

	fn ctx() -> ComponentContext {
		ComponentContext::new(Arc::new(EventBus::new()), serde_json::json!({}))
	}

	#[tokio::test]
	async fn auto_add_registers_unknown_ae_on_assoc() {
		let ctx = ctx();
		let registry = DeviceRegistry::new(&ctx);
		ctx.bus
			.broadcast(&Assoc {
				called_ae: "PACS".into(),
				calling_ae: "MODALITY1".into(),
				peer_address: "10.0.0.5".into(),
			})
			.await
			.unwrap();

		let found = registry.lookup("MODALITY1").unwrap();
		assert_eq!(found.address, "10.0.0.5");
		assert_eq!(found.port, 104);
	}

	#[tokio::test]
	async fn existing_device_is_not_overwritten() {
		let ctx = ctx();
		let registry = DeviceRegistry::new(&ctx);
		registry.register(DeviceEndpoint {
			ae_title: "MODALITY1".into(),
			address: "1.1.1.1".into(),
			port: 9999,
			retrieve_mode: RetrieveMode::default(),
		});

		ctx.bus
			.broadcast(&Assoc {
				called_ae: "PACS".into(),
				calling_ae: "MODALITY1".into(),
				peer_address: "10.0.0.5".into(),
			})
			.await
			.unwrap();

		let found = registry.lookup("MODALITY1").unwrap();
		assert_eq!(found.address, "1.1.1.1");
		assert_eq!(found.port, 9999);
	}

	#[tokio::test]
	async fn device_by_ae_returns_none_for_unknown() {
		let ctx = ctx();
		let _registry = DeviceRegistry::new(&ctx);
		let found = ctx
			.bus
			.send_any(&DeviceByAe {
				ae_title: "NOBODY".into(),
			})
			.await
			.unwrap();
		assert!(found.is_none());
	}
}
