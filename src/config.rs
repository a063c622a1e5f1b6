//! Layered configuration: built-in defaults, an optional `config.toml`, then
//! `TINY_PACS_`-prefixed environment variables, in that order.

use std::collections::HashMap;

use serde::Deserialize;

use crate::db::DatabaseConfig;
use crate::devices::DevicesConfig;
use crate::dimse::front_end::AeConfig;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AppConfig {
	pub log: LogConfig,
	pub ae: AeConfig,
	pub database: DatabaseConfig,
	pub devices: DevicesConfig,
	/// Per-component configuration, keyed by the component name used in
	/// `--components`/the `[components.*]` table. Each value is handed to
	/// that component's `ComponentContext` verbatim; an `on` key (default
	/// `true`) gates whether the component is constructed at all.
	pub components: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
	pub level: String,
}

impl AppConfig {
	/// Loads defaults, then `config.toml` if present, then environment
	/// overrides. `overrides` is applied last and wins over everything else;
	/// it is how CLI flags (`--aet`, `--port`, `-c`) take effect.
	pub fn load(config_paths: &[String], overrides: serde_json::Value) -> Result<Self, config::ConfigError> {
		let mut builder = config::Config::builder().add_source(config::File::from_str(
			include_str!("defaults.toml"),
			config::FileFormat::Toml,
		));

		if config_paths.is_empty() {
			builder = builder.add_source(config::File::with_name("config.toml").required(false));
		} else {
			for path in config_paths {
				builder = builder.add_source(config::File::with_name(path));
			}
		}

		builder = builder
			.add_source(config::Environment::with_prefix("TINY_PACS").separator("_"))
			.add_source(config::File::from_str(&overrides.to_string(), config::FileFormat::Json));

		builder.build()?.try_deserialize()
	}

	/// Whether `name` is enabled. Components absent from the table default
	/// to enabled; an explicit `on = false` disables them.
	pub fn component_enabled(&self, name: &str) -> bool {
		self.components
			.get(name)
			.and_then(|value| value.get("on"))
			.and_then(serde_json::Value::as_bool)
			.unwrap_or(true)
	}

	/// The configuration slice handed to a component's `ComponentContext`.
	pub fn component_config(&self, name: &str) -> serde_json::Value {
		self.components.get(name).cloned().unwrap_or_else(|| serde_json::json!({}))
	}
}
