mod bus;
mod component;
mod config;
mod db;
mod devices;
mod dimse;
mod query;
mod storage;
mod types;

use std::str::FromStr;
use std::sync::Arc;

use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::bus::{EventBus, OnExit, OnStart, OnStarted};
use crate::component::ComponentContext;
use crate::config::AppConfig;
use crate::db::Database;
use crate::devices::DeviceRegistry;
use crate::dimse::front_end;
use crate::query::engine::QueryEngine;
use crate::storage::filesystem::FileStorage;
use crate::storage::memory::InMemoryStorage;
use crate::storage::tempfile_backend::TempFileStorage;

#[derive(Parser)]
#[command(name = "tiny-pacs", about = "A small DIMSE PACS core")]
struct Args {
	/// Configuration file(s) to layer on top of the built-in defaults; later
	/// files override earlier ones.
	#[arg(short, long = "config")]
	config: Vec<String>,

	/// Overrides `ae.ae_title`.
	#[arg(short, long = "aet")]
	aet: Option<String>,

	/// Overrides `ae.port`.
	#[arg(short, long = "port")]
	port: Option<u16>,
}

fn init_logger(level: &str) -> anyhow::Result<()> {
	let log_level = tracing::Level::from_str(level)?;

	let subscriber = tracing_subscriber::fmt()
		.compact()
		.with_file(true)
		.with_line_number(true)
		.with_target(false)
		.with_env_filter(
			EnvFilter::builder()
				.with_default_directive(log_level.into())
				.from_env_lossy(),
		)
		.finish();
	tracing::subscriber::set_global_default(subscriber)?;
	Ok(())
}

/// Translates CLI flags into the JSON overlay `AppConfig::load` applies last.
fn overrides(args: &Args) -> serde_json::Value {
	let mut ae = serde_json::Map::new();
	if let Some(aet) = &args.aet {
		ae.insert("ae-title".into(), serde_json::json!([aet]));
	}
	if let Some(port) = args.port {
		ae.insert("port".into(), serde_json::json!(port));
	}
	if ae.is_empty() {
		serde_json::json!({})
	} else {
		serde_json::json!({ "ae": ae })
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();
	let config = AppConfig::load(&args.config, overrides(&args))?;
	init_logger(&config.log.level)?;
	debug!(ae_title = ?config.ae.ae_title, port = config.ae.port, "configuration loaded");

	let bus = Arc::new(EventBus::new());
	let db = Arc::new(Database::connect(&config.database).await?);

	if config.component_enabled("Devices") {
		let ctx = ComponentContext::new(bus.clone(), config.component_config("Devices"));
		DeviceRegistry::new(&ctx);
	}

	if config.component_enabled("PACS") {
		let ctx = ComponentContext::new(bus.clone(), config.component_config("PACS"));
		QueryEngine::new(&ctx, db.clone());
	}

	if config.component_enabled("FileStorage") {
		let ctx = ComponentContext::new(bus.clone(), config.component_config("FileStorage"));
		FileStorage::new(&ctx, db.clone())?;
	}

	if config.component_enabled("InMemoryStorage") {
		let ctx = ComponentContext::new(bus.clone(), config.component_config("InMemoryStorage"));
		InMemoryStorage::new(&ctx, db.clone());
	}

	if config.component_enabled("TempFileStorage") {
		let ctx = ComponentContext::new(bus.clone(), config.component_config("TempFileStorage"));
		TempFileStorage::new(&ctx, db.clone());
	}

	bus.broadcast(&OnStart).await?;
	bus.broadcast(&OnStarted).await?;

	info!(aet = ?config.ae.ae_title, port = config.ae.port, "starting DIMSE front-end");
	let front_end_ctx = ComponentContext::new(bus.clone(), serde_json::json!({}));
	let serve_result = front_end::serve(front_end_ctx, config.ae.clone()).await;

	bus.broadcast_nothrow(&OnExit).await;
	serve_result
}
