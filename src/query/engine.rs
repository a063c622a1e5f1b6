//! The `QueryEngine` component: owns the four entity tables and answers the
//! STORE/FIND/MOVE/GET/COMMITMENT bus events.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use sqlx::Row;

use crate::bus::{
	Commitment, CommitmentResult, Find, FindResponseItem, Get, Handler, Move, OnGetFiles,
	OnStoreDone, OnStoreFailure, OnStoreVerify, ResolvedInstance, Store, StoreOutcome,
};
use crate::component::{register_lifecycle, ComponentContext, Lifecycle};
use crate::db::Database;
use crate::query::filters::build_filter;
use crate::query::models::{self, AttributeMapping};
use crate::query::{instance, patient, series, study};
use crate::types::QueryRetrieveLevel;

pub struct QueryEngine {
	ctx: ComponentContext,
	db: Arc<Database>,
}

impl QueryEngine {
	pub fn new(ctx: &ComponentContext, db: Arc<Database>) -> Arc<Self> {
		let this = Arc::new(Self {
			ctx: ctx.clone(),
			db,
		});
		register_lifecycle(&ctx.bus, this.clone());
		ctx.bus.subscribe_default(this.clone() as Arc<dyn Handler<Store>>);
		ctx.bus.subscribe_default(this.clone() as Arc<dyn Handler<Find>>);
		ctx.bus.subscribe_default(this.clone() as Arc<dyn Handler<Move>>);
		ctx.bus.subscribe_default(this.clone() as Arc<dyn Handler<Get>>);
		ctx.bus
			.subscribe_default(this.clone() as Arc<dyn Handler<Commitment>>);
		this
	}

	async fn resolve_instances(&self, identifier: &InMemDicomObject) -> anyhow::Result<Vec<String>> {
		resolve_targets(&self.db, identifier).await
	}

	async fn fetch_artifacts(&self, sop_instance_uids: Vec<String>) -> anyhow::Result<Vec<ResolvedInstance>> {
		if sop_instance_uids.is_empty() {
			return Ok(Vec::new());
		}
		let results = self
			.ctx
			.broadcast::<OnGetFiles>(&OnGetFiles { sop_instance_uids })
			.await?;
		Ok(results.into_iter().flatten().collect())
	}
}

impl Lifecycle for QueryEngine {
	fn name(&self) -> &str {
		"PACS"
	}
}

#[async_trait]
impl Handler<Store> for QueryEngine {
	async fn handle(&self, event: &Store) -> anyhow::Result<StoreOutcome> {
		match store_dataset(&self.db, &event.dataset, &event.transfer_syntax).await {
			Ok(sop_instance_uid) => {
				self.ctx.broadcast_nothrow(&OnStoreDone { sop_instance_uid }).await;
				Ok(StoreOutcome::Success)
			}
			Err(err) => {
				tracing::warn!(error = %err, "C-STORE ingest failed");
				self.ctx
					.broadcast_nothrow(&OnStoreFailure {
						sop_instance_uid: event.sop_instance_uid.clone(),
					})
					.await;
				Ok(StoreOutcome::Failure(err.to_string()))
			}
		}
	}
}

#[async_trait]
impl Handler<Find> for QueryEngine {
	async fn handle(&self, event: &Find) -> anyhow::Result<Vec<FindResponseItem>> {
		let level: QueryRetrieveLevel = parse_level(&event.query_retrieve_level)?;
		find(&self.db, level, &event.identifier).await
	}
}

#[async_trait]
impl Handler<Move> for QueryEngine {
	async fn handle(&self, event: &Move) -> anyhow::Result<Vec<ResolvedInstance>> {
		let uids = self.resolve_instances(&event.identifier).await?;
		self.fetch_artifacts(uids).await
	}
}

#[async_trait]
impl Handler<Get> for QueryEngine {
	async fn handle(&self, event: &Get) -> anyhow::Result<Vec<ResolvedInstance>> {
		let uids = self.resolve_instances(&event.identifier).await?;
		self.fetch_artifacts(uids).await
	}
}

#[async_trait]
impl Handler<Commitment> for QueryEngine {
	async fn handle(&self, event: &Commitment) -> anyhow::Result<CommitmentResult> {
		let outcomes = self
			.ctx
			.broadcast_nothrow(&OnStoreVerify {
				pairs: event.pairs.clone(),
			})
			.await;

		let mut present: HashSet<(String, String)> = HashSet::new();
		for (result, _failed) in outcomes {
			if let Some(result) = result {
				present.extend(result.present);
			}
		}

		let mut successes = Vec::new();
		let mut failures = Vec::new();
		for pair in &event.pairs {
			if present.contains(pair) {
				successes.push(pair.clone());
			} else {
				failures.push(pair.clone());
			}
		}
		Ok(CommitmentResult { successes, failures })
	}
}

fn parse_level(raw: &str) -> anyhow::Result<QueryRetrieveLevel> {
	match raw {
		"PATIENT" => Ok(QueryRetrieveLevel::Patient),
		"STUDY" => Ok(QueryRetrieveLevel::Study),
		"SERIES" => Ok(QueryRetrieveLevel::Series),
		"IMAGE" => Ok(QueryRetrieveLevel::Image),
		other => anyhow::bail!("unsupported QueryRetrieveLevel '{other}'"),
	}
}

/// Within one transaction: upsert Patient, Study, Series, Instance keyed on
/// identity, in that order (each child references its just-upserted
/// parent's identity).
async fn store_dataset(
	db: &Database,
	dataset: &InMemDicomObject,
	transfer_syntax: &str,
) -> anyhow::Result<String> {
	let mut tx = db.begin().await?;
	let patient_id = patient::upsert(&mut tx, dataset).await?;
	let study_instance_uid = study::upsert(&mut tx, dataset, &patient_id).await?;
	let series_instance_uid = series::upsert(&mut tx, dataset, &study_instance_uid).await?;
	let sop_instance_uid = instance::upsert(&mut tx, dataset, &series_instance_uid, transfer_syntax).await?;
	tx.commit().await?;
	Ok(sop_instance_uid)
}

/// Reads `tag` from the request identifier. Distinguishes "not requested"
/// (`None`) from "requested with Universal Matching" (`Some("")`).
fn requested(identifier: &InMemDicomObject, tag: Tag) -> Option<String> {
	identifier
		.element(tag)
		.ok()
		.map(|e| e.to_str().map(|c| c.trim().to_string()).unwrap_or_default())
}

struct LevelPlan<'a> {
	table: &'static str,
	attrs: &'static [AttributeMapping],
	identifier: &'a InMemDicomObject,
}

/// Applies same-level/upper-level attribute handling uniformly: every
/// requested attribute (own level or a strictly-upper level already joined
/// in) is added to the SELECT list and, if non-empty, to the WHERE clause.
///
/// Fails if a non-empty value is supplied for an attribute whose VR has no
/// filter semantics defined (e.g. `PatientAge`, `SeriesNumber`) — the
/// identifier is rejected rather than silently matched or ignored.
fn apply_attrs(
	plan: &LevelPlan,
	selects: &mut Vec<String>,
	wheres: &mut Vec<String>,
	binds: &mut Vec<String>,
	response_plan: &mut Vec<(String, AttributeMapping)>,
) -> anyhow::Result<()> {
	for attr in plan.attrs {
		let Some(value) = requested(plan.identifier, attr.tag) else {
			continue;
		};
		let qualified = format!("{}.{}", plan.table, attr.column);
		let alias = format!("{}_{}", plan.table, attr.column);
		selects.push(format!("{qualified} AS {alias}"));
		response_plan.push((alias, *attr));

		if let Some(filter) = build_filter(attr.vr, &qualified, &value)? {
			wheres.push(filter.fragment);
			binds.extend(filter.binds);
		}
	}
	Ok(())
}

fn aggregate_requested(identifier: &InMemDicomObject, tag: Tag) -> bool {
	identifier.element(tag).is_ok()
}

async fn find(
	db: &Database,
	level: QueryRetrieveLevel,
	identifier: &InMemDicomObject,
) -> anyhow::Result<Vec<FindResponseItem>> {
	let mut selects = Vec::new();
	let mut joins = Vec::new();
	let mut wheres = Vec::new();
	let mut binds: Vec<String> = Vec::new();
	let mut response_plan = Vec::new();
	let mut aggregate_plan: Vec<(String, Tag, VR)> = Vec::new();
	let mut group_by = None;

	let patient_plan = LevelPlan {
		table: "patient",
		attrs: models::PATIENT_ATTRIBUTES,
		identifier,
	};
	let study_plan = LevelPlan {
		table: "study",
		attrs: models::STUDY_ATTRIBUTES,
		identifier,
	};
	let series_plan = LevelPlan {
		table: "series",
		attrs: models::SERIES_ATTRIBUTES,
		identifier,
	};
	let instance_plan = LevelPlan {
		table: "instance",
		attrs: models::INSTANCE_ATTRIBUTES,
		identifier,
	};

	let from_table;
	match level {
		QueryRetrieveLevel::Patient => {
			from_table = "patient";
			apply_attrs(&patient_plan, &mut selects, &mut wheres, &mut binds, &mut response_plan)?;

			if aggregate_requested(identifier, models::NUMBER_OF_PATIENT_RELATED_STUDIES) {
				joins.push("LEFT JOIN study ON study.patient_id = patient.patient_id".to_string());
				selects.push(
					"COUNT(DISTINCT study.study_instance_uid) AS agg_num_patient_related_studies"
						.to_string(),
				);
				aggregate_plan.push((
					"agg_num_patient_related_studies".to_string(),
					models::NUMBER_OF_PATIENT_RELATED_STUDIES,
					VR::IS,
				));
			}
			let needs_series = aggregate_requested(identifier, models::NUMBER_OF_PATIENT_RELATED_SERIES)
				|| aggregate_requested(identifier, models::NUMBER_OF_PATIENT_RELATED_INSTANCES);
			if needs_series {
				joins.push("LEFT JOIN study ON study.patient_id = patient.patient_id".to_string());
				joins.push(
					"LEFT JOIN series ON series.study_instance_uid = study.study_instance_uid"
						.to_string(),
				);
			}
			if aggregate_requested(identifier, models::NUMBER_OF_PATIENT_RELATED_SERIES) {
				selects.push(
					"COUNT(DISTINCT series.series_instance_uid) AS agg_num_patient_related_series"
						.to_string(),
				);
				aggregate_plan.push((
					"agg_num_patient_related_series".to_string(),
					models::NUMBER_OF_PATIENT_RELATED_SERIES,
					VR::IS,
				));
			}
			if aggregate_requested(identifier, models::NUMBER_OF_PATIENT_RELATED_INSTANCES) {
				joins.push(
					"LEFT JOIN instance ON instance.series_instance_uid = series.series_instance_uid"
						.to_string(),
				);
				selects.push(
					"COUNT(DISTINCT instance.sop_instance_uid) AS agg_num_patient_related_instances"
						.to_string(),
				);
				aggregate_plan.push((
					"agg_num_patient_related_instances".to_string(),
					models::NUMBER_OF_PATIENT_RELATED_INSTANCES,
					VR::IS,
				));
			}
			if !aggregate_plan.is_empty() {
				group_by = Some("patient.patient_id".to_string());
			}
		}
		QueryRetrieveLevel::Study => {
			from_table = "study";
			joins.push("INNER JOIN patient ON patient.patient_id = study.patient_id".to_string());
			apply_attrs(&patient_plan, &mut selects, &mut wheres, &mut binds, &mut response_plan)?;
			apply_attrs(&study_plan, &mut selects, &mut wheres, &mut binds, &mut response_plan)?;

			let wants_modalities = aggregate_requested(identifier, models::MODALITIES_IN_STUDY);
			let wants_sop_classes = aggregate_requested(identifier, models::SOP_CLASSES_IN_STUDY);
			let wants_series_count =
				aggregate_requested(identifier, models::NUMBER_OF_STUDY_RELATED_SERIES);
			let wants_instance_count =
				aggregate_requested(identifier, models::NUMBER_OF_STUDY_RELATED_INSTANCES);

			if wants_modalities || wants_sop_classes || wants_series_count || wants_instance_count {
				joins.push(
					"LEFT JOIN series ON series.study_instance_uid = study.study_instance_uid"
						.to_string(),
				);
			}
			if wants_sop_classes || wants_instance_count {
				joins.push(
					"LEFT JOIN instance ON instance.series_instance_uid = series.series_instance_uid"
						.to_string(),
				);
			}
			if wants_modalities {
				selects.push(format!(
					"{}(DISTINCT series.modality) AS agg_modalities_in_study",
					db.string_agg_fn()
				));
				aggregate_plan.push((
					"agg_modalities_in_study".to_string(),
					models::MODALITIES_IN_STUDY,
					VR::CS,
				));
			}
			if wants_sop_classes {
				selects.push(format!(
					"{}(DISTINCT instance.sop_class_uid) AS agg_sop_classes_in_study",
					db.string_agg_fn()
				));
				aggregate_plan.push((
					"agg_sop_classes_in_study".to_string(),
					models::SOP_CLASSES_IN_STUDY,
					VR::UI,
				));
			}
			if wants_series_count {
				selects.push(
					"COUNT(DISTINCT series.series_instance_uid) AS agg_num_study_related_series"
						.to_string(),
				);
				aggregate_plan.push((
					"agg_num_study_related_series".to_string(),
					models::NUMBER_OF_STUDY_RELATED_SERIES,
					VR::IS,
				));
			}
			if wants_instance_count {
				selects.push(
					"COUNT(DISTINCT instance.sop_instance_uid) AS agg_num_study_related_instances"
						.to_string(),
				);
				aggregate_plan.push((
					"agg_num_study_related_instances".to_string(),
					models::NUMBER_OF_STUDY_RELATED_INSTANCES,
					VR::IS,
				));
			}
			if !aggregate_plan.is_empty() {
				group_by = Some("study.study_instance_uid".to_string());
			}
		}
		QueryRetrieveLevel::Series => {
			from_table = "series";
			joins.push("INNER JOIN study ON study.study_instance_uid = series.study_instance_uid".to_string());
			joins.push("INNER JOIN patient ON patient.patient_id = study.patient_id".to_string());
			apply_attrs(&patient_plan, &mut selects, &mut wheres, &mut binds, &mut response_plan)?;
			apply_attrs(&study_plan, &mut selects, &mut wheres, &mut binds, &mut response_plan)?;
			apply_attrs(&series_plan, &mut selects, &mut wheres, &mut binds, &mut response_plan)?;

			if aggregate_requested(identifier, models::NUMBER_OF_SERIES_RELATED_INSTANCES) {
				joins.push(
					"LEFT JOIN instance ON instance.series_instance_uid = series.series_instance_uid"
						.to_string(),
				);
				selects.push(
					"COUNT(DISTINCT instance.sop_instance_uid) AS agg_num_series_related_instances"
						.to_string(),
				);
				aggregate_plan.push((
					"agg_num_series_related_instances".to_string(),
					models::NUMBER_OF_SERIES_RELATED_INSTANCES,
					VR::IS,
				));
				group_by = Some("series.series_instance_uid".to_string());
			}
		}
		QueryRetrieveLevel::Image | QueryRetrieveLevel::Frame => {
			from_table = "instance";
			joins.push(
				"INNER JOIN series ON series.series_instance_uid = instance.series_instance_uid"
					.to_string(),
			);
			joins.push("INNER JOIN study ON study.study_instance_uid = series.study_instance_uid".to_string());
			joins.push("INNER JOIN patient ON patient.patient_id = study.patient_id".to_string());
			apply_attrs(&patient_plan, &mut selects, &mut wheres, &mut binds, &mut response_plan)?;
			apply_attrs(&study_plan, &mut selects, &mut wheres, &mut binds, &mut response_plan)?;
			apply_attrs(&series_plan, &mut selects, &mut wheres, &mut binds, &mut response_plan)?;
			apply_attrs(&instance_plan, &mut selects, &mut wheres, &mut binds, &mut response_plan)?;
		}
	}

	if selects.is_empty() {
		// Nothing was requested, but we must still be able to group rows by
		// the target level's identity.
		selects.push(format!("{from_table}.{} AS _identity", identity_column_of(level)));
	}

	let mut sql = format!("SELECT {} FROM {from_table}", selects.join(", "));
	let mut seen_joins = HashSet::new();
	for join in joins {
		if seen_joins.insert(join.clone()) {
			sql.push(' ');
			sql.push_str(&join);
		}
	}
	if !wheres.is_empty() {
		sql.push_str(" WHERE ");
		sql.push_str(&wheres.join(" AND "));
	}
	if let Some(group_by) = group_by {
		sql.push_str(" GROUP BY ");
		sql.push_str(&group_by);
	}

	let mut query = sqlx::query(&sql);
	for bind in &binds {
		query = query.bind(bind);
	}
	let rows = query.fetch_all(db.pool()).await?;

	let mut items = Vec::with_capacity(rows.len());
	for row in rows {
		let dataset = build_response_dataset(identifier, &row, &response_plan, &aggregate_plan)?;
		items.push(FindResponseItem {
			dataset,
			pending: true,
		});
	}
	Ok(items)
}

fn identity_column_of(level: QueryRetrieveLevel) -> &'static str {
	match level {
		QueryRetrieveLevel::Patient => "patient_id",
		QueryRetrieveLevel::Study => "study_instance_uid",
		QueryRetrieveLevel::Series => "series_instance_uid",
		QueryRetrieveLevel::Image | QueryRetrieveLevel::Frame => "sop_instance_uid",
	}
}

fn build_response_dataset(
	identifier: &InMemDicomObject,
	row: &sqlx::any::AnyRow,
	response_plan: &[(String, AttributeMapping)],
	aggregate_plan: &[(String, Tag, VR)],
) -> anyhow::Result<InMemDicomObject> {
	let mut out = InMemDicomObject::new_empty();

	let charset = identifier
		.element(tags::SPECIFIC_CHARACTER_SET)
		.ok()
		.and_then(|e| e.to_str().ok().map(|c| c.trim().to_string()))
		.filter(|c| !c.is_empty())
		.unwrap_or_else(|| "ISO_IR 6".to_string());
	out.put(DataElement::new(
		tags::SPECIFIC_CHARACTER_SET,
		VR::CS,
		PrimitiveValue::from(charset),
	));

	for element in identifier.iter() {
		let tag = element.header().tag;
		if tag == tags::SPECIFIC_CHARACTER_SET {
			continue;
		}

		if let Some((alias, mapping)) = response_plan.iter().find(|(_, m)| m.tag == tag) {
			let value: Option<String> = row.try_get(alias.as_str())?;
			out.put(DataElement::new(
				tag,
				mapping.dicom_vr,
				PrimitiveValue::from(value.unwrap_or_default()),
			));
			continue;
		}

		if let Some((alias, tag, vr)) = aggregate_plan.iter().find(|(_, t, _)| *t == tag) {
			let value: Option<String> = row.try_get(alias.as_str())?;
			out.put(DataElement::new(*tag, *vr, PrimitiveValue::from(value.unwrap_or_default())));
			continue;
		}

		// Unmapped attribute: echoed back empty, same VR as requested.
		out.put(DataElement::new(tag, element.header().vr, PrimitiveValue::from("")));
	}

	Ok(out)
}

/// Translates a C-MOVE/C-GET identifier into the list of matching SOP
/// Instance UIDs, joining all four levels and filtering by whichever
/// identity attributes are actually present in the request.
async fn resolve_targets(db: &Database, identifier: &InMemDicomObject) -> anyhow::Result<Vec<String>> {
	let mut wheres = Vec::new();
	let mut binds: Vec<String> = Vec::new();

	let identity_filters: &[(Tag, &str)] = &[
		(tags::PATIENT_ID, "patient.patient_id"),
		(tags::STUDY_INSTANCE_UID, "study.study_instance_uid"),
		(tags::SERIES_INSTANCE_UID, "series.series_instance_uid"),
		(tags::SOP_INSTANCE_UID, "instance.sop_instance_uid"),
	];

	for (tag, column) in identity_filters {
		if let Some(value) = requested(identifier, *tag) {
			if value.is_empty() {
				continue;
			}
			let members: Vec<&str> = value.split('\\').filter(|v| !v.is_empty()).collect();
			let placeholders = members.iter().map(|_| "?").collect::<Vec<_>>().join(",");
			wheres.push(format!("{column} IN ({placeholders})"));
			binds.extend(members.iter().map(|v| v.to_string()));
		}
	}

	let mut sql = "SELECT instance.sop_instance_uid FROM instance \
		INNER JOIN series ON series.series_instance_uid = instance.series_instance_uid \
		INNER JOIN study ON study.study_instance_uid = series.study_instance_uid \
		INNER JOIN patient ON patient.patient_id = study.patient_id"
		.to_string();
	if !wheres.is_empty() {
		sql.push_str(" WHERE ");
		sql.push_str(&wheres.join(" AND "));
	}

	let mut query = sqlx::query(&sql);
	for bind in &binds {
		query = query.bind(bind);
	}
	let rows = query.fetch_all(db.pool()).await?;
	Ok(rows
		.into_iter()
		.map(|row| row.try_get::<String, _>("sop_instance_uid"))
		.collect::<Result<Vec<_>, _>>()?)
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use dicom::core::{DataElement, PrimitiveValue, VR};
	use dicom::object::InMemDicomObject;

	use super::*;
	use crate::bus::{Commitment, EventBus, Find, Handler, OnStoreVerify, Store, VerifyResult};
	use crate::component::ComponentContext;
	use crate::db::{Database, DatabaseConfig};

	async fn test_ctx() -> (ComponentContext, Arc<Database>) {
		let bus = Arc::new(EventBus::new());
		let db = Arc::new(Database::connect(&DatabaseConfig::default()).await.unwrap());
		(ComponentContext::new(bus, serde_json::json!({})), db)
	}

	fn put_text(ds: &mut InMemDicomObject, tag: Tag, vr: VR, value: &str) {
		ds.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
	}

	fn sop_dataset(
		patient_id: &str,
		patient_name: &str,
		patient_sex: &str,
		study_instance_uid: &str,
		accession_number: &str,
		series_instance_uid: &str,
		sop_instance_uid: &str,
		sop_class_uid: &str,
	) -> InMemDicomObject {
		let mut ds = InMemDicomObject::new_empty();
		put_text(&mut ds, tags::PATIENT_ID, VR::LO, patient_id);
		put_text(&mut ds, tags::PATIENT_NAME, VR::PN, patient_name);
		put_text(&mut ds, tags::PATIENT_SEX, VR::CS, patient_sex);
		put_text(&mut ds, tags::STUDY_INSTANCE_UID, VR::UI, study_instance_uid);
		put_text(&mut ds, tags::ACCESSION_NUMBER, VR::SH, accession_number);
		put_text(&mut ds, tags::SERIES_INSTANCE_UID, VR::UI, series_instance_uid);
		put_text(&mut ds, tags::SOP_INSTANCE_UID, VR::UI, sop_instance_uid);
		put_text(&mut ds, tags::SOP_CLASS_UID, VR::UI, sop_class_uid);
		ds
	}

	fn identifier(level: &str, fields: &[(Tag, VR, &str)]) -> InMemDicomObject {
		let mut ds = InMemDicomObject::new_empty();
		put_text(&mut ds, tags::QUERY_RETRIEVE_LEVEL, VR::CS, level);
		for (tag, vr, value) in fields {
			put_text(&mut ds, *tag, *vr, value);
		}
		ds
	}

	fn attr(ds: &InMemDicomObject, tag: Tag) -> String {
		ds.element(tag).unwrap().to_str().unwrap().trim().to_string()
	}

	#[tokio::test]
	async fn patient_find_with_no_filters_returns_one_row() {
		let (ctx, db) = test_ctx().await;
		let engine = QueryEngine::new(&ctx, db.clone());

		let ds = sop_dataset("P1", "Test1^Patient", "M", "1.2.1", "A1", "1.2.1.1", "1.2.1.1.1", "1.2.840.10008.5.1.4.1.1.7");
		store_dataset(&db, &ds, "1.2.840.10008.1.2.1").await.unwrap();

		let identifier = identifier("PATIENT", &[(tags::PATIENT_NAME, VR::PN, ""), (tags::PATIENT_SEX, VR::CS, "")]);
		let items = engine
			.ctx
			.broadcast(&Find {
				query_retrieve_level: "PATIENT".to_string(),
				identifier,
			})
			.await
			.unwrap();
		assert_eq!(items.len(), 1);
		let rows = &items[0];
		assert_eq!(rows.len(), 1);
		assert_eq!(attr(&rows[0].dataset, tags::PATIENT_NAME), "Test1^Patient");
		assert_eq!(attr(&rows[0].dataset, tags::PATIENT_SEX), "M");
	}

	#[tokio::test]
	async fn patient_related_studies_count_is_two() {
		let (ctx, db) = test_ctx().await;
		let _engine = QueryEngine::new(&ctx, db.clone());

		let ds1 = sop_dataset("P2", "Two^Studies", "F", "1.2.2", "A2", "1.2.2.1", "1.2.2.1.1", "1.2.840.10008.5.1.4.1.1.7");
		let ds2 = sop_dataset("P2", "Two^Studies", "F", "1.2.3", "A3", "1.2.3.1", "1.2.3.1.1", "1.2.840.10008.5.1.4.1.1.7");
		store_dataset(&db, &ds1, "1.2.840.10008.1.2.1").await.unwrap();
		store_dataset(&db, &ds2, "1.2.840.10008.1.2.1").await.unwrap();

		let identifier = identifier(
			"PATIENT",
			&[
				(tags::PATIENT_ID, VR::LO, "P2"),
				(tags::NUMBER_OF_PATIENT_RELATED_STUDIES, VR::IS, ""),
			],
		);
		let items = find(&db, QueryRetrieveLevel::Patient, &identifier).await.unwrap();
		assert_eq!(items.len(), 1);
		assert_eq!(attr(&items[0].dataset, tags::NUMBER_OF_PATIENT_RELATED_STUDIES), "2");
	}

	#[tokio::test]
	async fn accession_number_filter_then_name_mismatch_yields_zero() {
		let (ctx, db) = test_ctx().await;
		let _engine = QueryEngine::new(&ctx, db.clone());

		let ds = sop_dataset("P3", "Test^Patient", "M", "1.2.4", "1234", "1.2.4.1", "1.2.4.1.1", "1.2.840.10008.5.1.4.1.1.7");
		store_dataset(&db, &ds, "1.2.840.10008.1.2.1").await.unwrap();

		let matching = identifier("STUDY", &[(tags::ACCESSION_NUMBER, VR::SH, "1234")]);
		let items = find(&db, QueryRetrieveLevel::Study, &matching).await.unwrap();
		assert_eq!(items.len(), 1);

		let mismatching = identifier(
			"STUDY",
			&[
				(tags::ACCESSION_NUMBER, VR::SH, "1234"),
				(tags::PATIENT_NAME, VR::PN, "Test1^*"),
			],
		);
		let none = find(&db, QueryRetrieveLevel::Study, &mismatching).await.unwrap();
		assert!(none.is_empty());
	}

	#[tokio::test]
	async fn store_then_find_at_image_level_returns_the_instance() {
		let (ctx, db) = test_ctx().await;
		let engine = QueryEngine::new(&ctx, db.clone());

		let ds = sop_dataset("P4", "Text^SR", "O", "1.2.5", "A5", "1.2.5.6", "1.2.5.6", "1.2.840.10008.5.1.4.1.1.88.11");

		let outcome = engine
			.ctx
			.broadcast(&Store {
				sop_class_uid: "1.2.840.10008.5.1.4.1.1.88.11".to_string(),
				sop_instance_uid: "1.2.5.6".to_string(),
				transfer_syntax: "1.2.840.10008.1.2.1".to_string(),
				dataset: ds,
			})
			.await
			.unwrap();
		assert_eq!(outcome, vec![StoreOutcome::Success]);

		let identifier = identifier("IMAGE", &[(tags::SOP_INSTANCE_UID, VR::UI, "1.2.5.6")]);
		let items = find(&db, QueryRetrieveLevel::Image, &identifier).await.unwrap();
		assert_eq!(items.len(), 1);
		assert_eq!(attr(&items[0].dataset, tags::SOP_INSTANCE_UID), "1.2.5.6");
	}

	struct MockVerify;

	#[async_trait]
	impl Handler<OnStoreVerify> for MockVerify {
		async fn handle(&self, event: &OnStoreVerify) -> anyhow::Result<VerifyResult> {
			let present: Vec<(String, String)> = event
				.pairs
				.iter()
				.filter(|(_, sop)| sop.as_str() == "1.2.9.1")
				.cloned()
				.collect();
			Ok(VerifyResult {
				present,
				missing: Vec::new(),
			})
		}
	}

	#[tokio::test]
	async fn storage_commitment_splits_present_and_missing() {
		let (ctx, db) = test_ctx().await;
		let engine = QueryEngine::new(&ctx, db.clone());
		ctx.subscribe_default(Arc::new(MockVerify) as Arc<dyn Handler<OnStoreVerify>>);

		let pairs = vec![
			("1.2.840.10008.5.1.4.1.1.7".to_string(), "1.2.9.1".to_string()),
			("1.2.840.10008.5.1.4.1.1.7".to_string(), "1.2.9.2".to_string()),
		];
		let result = engine.ctx.broadcast(&Commitment { pairs }).await.unwrap();
		assert_eq!(result.len(), 1);
		assert_eq!(result[0].successes, vec![("1.2.840.10008.5.1.4.1.1.7".to_string(), "1.2.9.1".to_string())]);
		assert_eq!(result[0].failures, vec![("1.2.840.10008.5.1.4.1.1.7".to_string(), "1.2.9.2".to_string())]);
	}
}
