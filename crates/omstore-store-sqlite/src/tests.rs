//! Integration tests for `SqliteStore` against an in-memory database.

use omstore_core::{
  config::StoreConfig,
  field::{Field, FieldValue},
  filter::Filter,
  merge::NewObservation,
  observation::{ComplexResult, Observation, ObservationResult, ResultRow},
  phenomenon::Phenomenon,
  query::{
    DatasetQuery, EntityQuery, EntityType, ObservationQuery, ResultFormat, ResultQuery, ResultSet,
  },
  store::ObservationStore,
  template::TemplateOptions,
  time::TemporalExtent,
};

use crate::{
  SqliteStore,
  fixtures::{measurement, profile, series, station, t},
};

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory()
    .await
    .expect("in-memory store")
}

async fn write(s: &SqliteStore, input: NewObservation) -> String {
  s.write_observation(input).await.unwrap()
}

async fn observations(s: &SqliteStore) -> Vec<Observation> {
  s.get_observations(&ObservationQuery::default()).await.unwrap()
}

async fn csv(s: &SqliteStore, procedure: &str) -> String {
  match s.get_results(&ResultQuery::new(procedure)).await.unwrap() {
    ResultSet::Text { content, .. } => content,
    other => panic!("expected text, got {other:?}"),
  }
}

async fn row_count(s: &SqliteStore, procedure: &str) -> usize {
  let mut query = ResultQuery::new(procedure);
  query.format = ResultFormat::Count;
  match s.get_results(&query).await.unwrap() {
    ResultSet::Count { count } => count,
    other => panic!("expected a count, got {other:?}"),
  }
}

async fn exists(s: &SqliteStore, kind: EntityType, id: &str) -> bool {
  s.exist_entity(kind, id).await.unwrap()
}

fn phenomenon_id(o: &Observation) -> Option<&str> { o.phenomenon.as_ref().map(Phenomenon::id) }

fn field_names(o: &Observation) -> Vec<&str> {
  o.complex_result()
    .map(|r| r.fields.iter().map(|f| f.name.as_str()).collect())
    .unwrap_or_default()
}

// ─── Writes ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn write_and_read_timeseries() {
  let s = store().await;
  let id = write(&s, series("s1", &["temp"], &[(0, 10.0), (10, 11.0)])).await;
  assert_eq!(id, "s1-obs-1");

  let all = observations(&s).await;
  assert_eq!(all.len(), 1);
  let obs = &all[0];
  assert_eq!(obs.procedure, "s1");
  assert_eq!(obs.name, "s1-obs-1");
  assert_eq!(phenomenon_id(obs), Some("temp"));
  assert_eq!(obs.sampling_time, Some(TemporalExtent::between(t(0), t(10))));
  assert_eq!(obs.feature_of_interest.as_ref().map(|f| f.id.as_str()), Some("station-1"));
  assert_eq!(field_names(obs), ["time", "temp"]);
  assert_eq!(obs.complex_result().unwrap().row_count(), 2);
}

#[tokio::test]
async fn rewriting_merges_into_the_same_observation() {
  let s = store().await;
  let first = write(&s, series("s1", &["temp"], &[(0, 10.0), (10, 11.0)])).await;
  let again = write(&s, series("s1", &["temp"], &[(0, 10.0), (10, 11.0)])).await;
  assert_eq!(first, again);
  assert_eq!(row_count(&s, "s1").await, 2);

  let extended = write(&s, series("s1", &["temp"], &[(10, 15.0), (20, 12.0)])).await;
  assert_eq!(extended, first);
  assert_eq!(
    csv(&s, "s1").await,
    "time,temp\n\
     2024-05-01T12:00:00.000Z,10\n\
     2024-05-01T12:10:00.000Z,15\n\
     2024-05-01T12:20:00.000Z,12"
  );

  let all = observations(&s).await;
  assert_eq!(all.len(), 1);
  assert_eq!(all[0].sampling_time, Some(TemporalExtent::between(t(0), t(20))));
}

#[tokio::test]
async fn new_field_recomposes_the_phenomenon() {
  let s = store().await;
  let id = write(&s, series("s1", &["temp"], &[(0, 10.0)])).await;
  assert_eq!(write(&s, series("s1", &["sal"], &[(0, 35.0), (10, 34.0)])).await, id);

  let all = observations(&s).await;
  assert_eq!(all.len(), 1);
  assert_eq!(phenomenon_id(&all[0]), Some("computed-phen-s1"));
  assert_eq!(field_names(&all[0]), ["time", "temp", "sal"]);
  assert_eq!(
    csv(&s, "s1").await,
    "time,temp,sal\n\
     2024-05-01T12:00:00.000Z,10,35\n\
     2024-05-01T12:10:00.000Z,,34"
  );

  let procedures = s.get_procedures(&EntityQuery::default()).await.unwrap();
  assert_eq!(procedures[0].phenomenon.as_deref(), Some("computed-phen-s1"));
  // The simple phenomenon survives as a component.
  assert!(exists(&s, EntityType::Phenomenon, "temp").await);
}

#[tokio::test]
async fn known_field_sets_reuse_their_composite() {
  let s = store().await;
  write(&s, series("s1", &["temp"], &[(0, 10.0)])).await;
  write(&s, series("s1", &["sal"], &[(0, 35.0)])).await;
  write(&s, series("s1", &["temp", "sal"], &[(10, 11.0)])).await;
  write(&s, series("s1", &["sal"], &[(20, 36.0)])).await;
  // Another procedure with the same field set shares the stored composite.
  write(&s, series("s2", &["sal", "temp"], &[(0, 1.0)])).await;

  let all = observations(&s).await;
  assert_eq!(all.len(), 2);
  assert!(all.iter().all(|o| phenomenon_id(o) == Some("computed-phen-s1")));
  assert!(!exists(&s, EntityType::Phenomenon, "computed-phen-s1-1").await);
  assert!(!exists(&s, EntityType::Phenomenon, "computed-phen-s2").await);
}

#[tokio::test]
async fn wide_procedures_spill_into_further_tables() {
  let s = store()
    .await
    .with_config(StoreConfig { max_fields_per_table: 2, ..StoreConfig::default() })
    .unwrap();
  write(&s, series("w1", &["a", "b", "c"], &[(0, 1.0), (10, 2.0)])).await;
  assert_eq!(
    csv(&s, "w1").await,
    "time,a,b,c\n\
     2024-05-01T12:00:00.000Z,1,1,1\n\
     2024-05-01T12:10:00.000Z,2,2,2"
  );

  write(&s, series("w1", &["d"], &[(0, 4.0)])).await;
  assert_eq!(
    csv(&s, "w1").await,
    "time,a,b,c,d\n\
     2024-05-01T12:00:00.000Z,1,1,1,4\n\
     2024-05-01T12:10:00.000Z,2,2,2,"
  );

  // The superseded composite had nothing left referring to it.
  assert!(!exists(&s, EntityType::Phenomenon, "computed-phen-w1").await);
  assert!(exists(&s, EntityType::Phenomenon, "computed-phen-w1-1").await);
}

#[tokio::test]
async fn profiles_are_one_observation_per_instant() {
  let s = store().await;
  assert_eq!(write(&s, profile("p1", 0, &[(1.0, 10.0), (5.0, 9.0)])).await, "p1-obs-1");
  assert_eq!(write(&s, profile("p1", 10, &[(1.0, 11.0), (5.0, 8.0)])).await, "p1-obs-2");
  assert_eq!(write(&s, profile("p1", 0, &[(1.0, 12.0)])).await, "p1-obs-1");
  assert_eq!(row_count(&s, "p1").await, 4);

  let separated = observations(&s).await;
  assert_eq!(separated.len(), 2);
  let phenomenon = separated[0].phenomenon.as_ref().unwrap();
  assert_eq!(phenomenon.component_ids(), ["depth", "temp"]);

  let combined = s
    .get_observations(&ObservationQuery {
      separated_profile_observation: false,
      ..ObservationQuery::default()
    })
    .await
    .unwrap();
  assert_eq!(combined.len(), 1);
}

#[tokio::test]
async fn measurements_merge_into_a_timeseries() {
  let s = store().await;
  let id = write(&s, measurement("m1", "temp", 3, 12.5)).await;
  assert_eq!(write(&s, measurement("m1", "temp", 5, 13.0)).await, id);
  assert_eq!(row_count(&s, "m1").await, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writes_to_one_procedure_merge() {
  let s = store().await;
  let writes: Vec<_> = (0..8u32)
    .map(|m| {
      let s = s.clone();
      tokio::spawn(async move { s.write_observation(series("s1", &["temp"], &[(m, f64::from(m))])).await })
    })
    .collect();
  for w in writes {
    assert_eq!(w.await.unwrap().unwrap(), "s1-obs-1");
  }
  assert_eq!(row_count(&s, "s1").await, 8);
}

#[tokio::test]
async fn fields_added_after_a_removal_keep_write_order() {
  let s = store().await;
  write(&s, series("s1", &["a", "b", "c"], &[(0, 1.0)])).await;
  s.remove_phenomenon("b").await.unwrap();
  write(&s, series("s1", &["a", "c", "aa"], &[(10, 2.0)])).await;

  let all = observations(&s).await;
  assert_eq!(field_names(&all[0]), ["time", "a", "c", "aa"]);
  assert_eq!(
    csv(&s, "s1").await,
    "time,a,c,aa\n\
     2024-05-01T12:00:00.000Z,1,1,\n\
     2024-05-01T12:10:00.000Z,2,2,2"
  );

  // A further write after a reload appends again rather than filling a gap.
  write(&s, series("s1", &["b"], &[(20, 3.0)])).await;
  let all = observations(&s).await;
  assert_eq!(field_names(&all[0]), ["time", "a", "c", "aa", "b"]);
}

// ─── Rejected writes ─────────────────────────────────────────────────────────

#[tokio::test]
async fn rejected_write_leaves_store_untouched() {
  let s = store().await;
  let err = s.write_observation(series("s1", &["temp"], &[])).await.unwrap_err();
  assert!(err.is_validation());
  assert!(!exists(&s, EntityType::Procedure, "s1").await);
  assert!(!exists(&s, EntityType::Feature, "station-1").await);
}

#[tokio::test]
async fn taken_observation_id_is_rejected() {
  let s = store().await;
  let mut first = series("s1", &["temp"], &[(0, 10.0)]);
  first.id = Some("fixed".into());
  assert_eq!(write(&s, first).await, "fixed");

  let mut clash = series("s2", &["temp"], &[(0, 10.0)]);
  clash.id = Some("fixed".into());
  let err = s.write_observation(clash).await.unwrap_err();
  assert!(err.is_validation());
  assert!(!exists(&s, EntityType::Procedure, "s2").await);
}

#[tokio::test]
async fn shape_mismatch_is_rejected() {
  let s = store().await;
  write(&s, series("s1", &["temp"], &[(0, 10.0)])).await;
  let err = s.write_observation(profile("s1", 0, &[(1.0, 10.0)])).await.unwrap_err();
  assert!(err.is_validation());
  assert_eq!(row_count(&s, "s1").await, 1);
}

// ─── Reads ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn filters_select_observations() {
  let s = store().await;
  write(&s, series("s1", &["temp"], &[(0, 10.0), (10, 11.0)])).await;
  write(&s, series("s2", &["temp"], &[(20, 12.0)])).await;

  let ids = s
    .get_identifiers(&ObservationQuery::with_filter(Filter::equal("procedure", "s2")))
    .await
    .unwrap();
  assert_eq!(ids, ["s2-obs-1"]);

  let late = ObservationQuery::with_filter(Filter::during(TemporalExtent::between(t(15), t(30))));
  assert_eq!(s.get_count(&late).await.unwrap(), 1);
  assert_eq!(s.get_count(&ObservationQuery::default()).await.unwrap(), 2);
}

// ─── Decimation ──────────────────────────────────────────────────────────────

async fn data_array(s: &SqliteStore, query: &ResultQuery) -> ComplexResult {
  match s.get_results(query).await.unwrap() {
    ResultSet::DataArray { result } => result,
    other => panic!("expected a data array, got {other:?}"),
  }
}

/// `p` observed at two stations over the same ten minutes.
async fn two_station_store() -> SqliteStore {
  let s = store().await;
  let rows: Vec<(u32, f64)> = (0..10).map(|m| (m, f64::from(m))).collect();
  write(&s, series("p", &["temp"], &rows)).await;
  let mut other = series("p", &["temp"], &rows);
  other.feature_of_interest = Some(station("station-2"));
  assert_eq!(write(&s, other).await, "p-obs-2");
  s
}

#[tokio::test]
async fn decimation_budget_covers_every_observation() {
  let s = two_station_store().await;
  let query = ResultQuery {
    decimation: Some(3),
    include_id_in_data_block: true,
    format: ResultFormat::DataArray,
    ..ResultQuery::new("p")
  };
  let result = data_array(&s, &query).await;
  assert_eq!(result.row_count(), 3);
  let ids: Vec<_> = result.rows.iter().map(|r| r.values[0].render()).collect();
  assert_eq!(ids, ["p-dec-0", "p-dec-1", "p-dec-2"]);
  let times: Vec<_> = result.rows.iter().map(|r| r.values[1].clone()).collect();
  assert_eq!(times, [t(0), t(3), t(6)].map(FieldValue::Time));
}

#[tokio::test]
async fn large_decimation_budget_returns_every_row() {
  let s = two_station_store().await;
  let query = ResultQuery {
    decimation: Some(50),
    include_id_in_data_block: true,
    format: ResultFormat::DataArray,
    ..ResultQuery::new("p")
  };
  let result = data_array(&s, &query).await;
  assert_eq!(result.row_count(), 20);
  let ids: Vec<_> = result.rows.iter().take(2).map(|r| r.values[0].render()).collect();
  assert_eq!(ids, ["p-obs-1-1", "p-obs-2-1"]);
}

#[tokio::test]
async fn series_without_numbers_cannot_be_decimated() {
  let s = store().await;
  let mut notes = series("n1", &[], &[]);
  notes.result = ObservationResult::Complex(ComplexResult::with_rows(
    vec![Field::time("time"), Field::text("note")],
    vec![
      ResultRow::new(vec![FieldValue::Time(t(0)), FieldValue::Text("calm".into())]),
      ResultRow::new(vec![FieldValue::Time(t(5)), FieldValue::Text("storm".into())]),
    ],
  ));
  write(&s, notes).await;

  let query = ResultQuery { decimation: Some(1), ..ResultQuery::new("n1") };
  let err = s.get_results(&query).await.unwrap_err();
  assert!(err.is_decimation_unsupported());
}

#[tokio::test]
async fn template_lists_fields_without_rows() {
  let s = store().await;
  write(&s, series("s1", &["temp", "sal"], &[(0, 10.0)])).await;

  let template = s.get_template("s1", TemplateOptions::default()).await.unwrap().unwrap();
  let result = template.complex_result().unwrap();
  assert!(result.is_template());
  assert!(result.fields.iter().any(|f| f.name == "sal"));

  assert!(s.get_template("missing", TemplateOptions::default()).await.unwrap().is_none());
}

#[tokio::test]
async fn entities_and_offerings() {
  let s = store().await;
  write(&s, series("s1", &["temp"], &[(0, 10.0), (10, 11.0)])).await;

  let query = EntityQuery::default();
  let procedures = s.get_procedures(&query).await.unwrap();
  assert_eq!(procedures.len(), 1);
  assert_eq!(procedures[0].id, "s1");

  let features = s.get_features(&query).await.unwrap();
  assert_eq!(features.len(), 1);
  assert!(features[0].geometry.is_some());

  let phenomena = s.get_phenomena(&query).await.unwrap();
  assert!(phenomena.iter().any(|p| p.id() == "temp"));

  let offerings = s.get_offerings(&query).await.unwrap();
  assert_eq!(offerings.len(), 1);
  assert_eq!(offerings[0].id, "offering-s1");
  assert_eq!(offerings[0].phenomena, ["temp"]);
  assert_eq!(offerings[0].features, ["station-1"]);
}

#[tokio::test]
async fn exist_entity_by_kind() {
  let s = store().await;
  write(&s, series("s1", &["temp"], &[(0, 10.0)])).await;

  assert!(exists(&s, EntityType::Procedure, "s1").await);
  assert!(exists(&s, EntityType::Observation, "s1-obs-1").await);
  assert!(exists(&s, EntityType::Feature, "station-1").await);
  assert!(exists(&s, EntityType::Phenomenon, "temp").await);
  assert!(exists(&s, EntityType::Offering, "offering-s1").await);

  assert!(!exists(&s, EntityType::Offering, "s1").await);
  assert!(!exists(&s, EntityType::Offering, "offering-s2").await);
  assert!(!exists(&s, EntityType::Procedure, "temp").await);
}

#[tokio::test]
async fn extract_gathers_related_entities() {
  let s = store().await;
  write(&s, series("s1", &["temp"], &[(0, 10.0), (10, 11.0)])).await;
  write(&s, series("s2", &["sal"], &[(0, 35.0)])).await;

  let extract = s.extract_results(&DatasetQuery::for_procedure("s1")).await.unwrap();
  assert_eq!(extract.observations.len(), 1);
  assert_eq!(extract.procedures.len(), 1);
  assert_eq!(extract.features.len(), 1);
  assert!(extract.phenomena.iter().any(|p| p.id() == "temp"));
  assert!(extract.phenomena.iter().all(|p| p.id() != "sal"));
  assert_eq!(extract.time, Some(TemporalExtent::between(t(0), t(10))));
}

// ─── Removal ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn removing_a_dataset_cleans_up_orphans() {
  let s = store().await;
  write(&s, series("s1", &["temp"], &[(0, 10.0)])).await;
  write(&s, series("s2", &["temp"], &[(0, 10.0)])).await;

  s.remove_dataset(&DatasetQuery::for_procedure("s1")).await.unwrap();
  assert!(!exists(&s, EntityType::Procedure, "s1").await);
  assert!(!exists(&s, EntityType::Observation, "s1-obs-1").await);
  // Still used by s2.
  assert!(exists(&s, EntityType::Feature, "station-1").await);

  s.remove_dataset(&DatasetQuery::for_procedure("s2")).await.unwrap();
  assert!(!exists(&s, EntityType::Feature, "station-1").await);
  // Phenomena are left alone.
  assert!(exists(&s, EntityType::Phenomenon, "temp").await);
  assert!(observations(&s).await.is_empty());
}

#[tokio::test]
async fn removing_a_time_window_trims_rows() {
  let s = store().await;
  write(&s, series("s1", &["temp"], &[(0, 10.0), (10, 11.0), (20, 12.0)])).await;

  let window = DatasetQuery {
    time: Some(TemporalExtent::between(t(5), t(15))),
    ..DatasetQuery::default()
  };
  s.remove_dataset(&window).await.unwrap();
  assert_eq!(
    csv(&s, "s1").await,
    "time,temp\n\
     2024-05-01T12:00:00.000Z,10\n\
     2024-05-01T12:20:00.000Z,12"
  );
  assert_eq!(observations(&s).await[0].sampling_time, Some(TemporalExtent::between(t(0), t(20))));

  let everything = DatasetQuery {
    time: Some(TemporalExtent::between(t(0), t(30))),
    ..DatasetQuery::default()
  };
  s.remove_dataset(&everything).await.unwrap();
  assert!(!exists(&s, EntityType::Procedure, "s1").await);
  assert!(!exists(&s, EntityType::Feature, "station-1").await);
}

#[tokio::test]
async fn empty_dataset_selection_is_rejected() {
  let s = store().await;
  write(&s, series("s1", &["temp"], &[(0, 10.0)])).await;
  let err = s.remove_dataset(&DatasetQuery::default()).await.unwrap_err();
  assert!(err.is_validation());
  assert!(exists(&s, EntityType::Procedure, "s1").await);
}

#[tokio::test]
async fn removing_a_component_decomposes_the_composite() {
  let s = store().await;
  write(&s, series("s1", &["temp"], &[(0, 10.0)])).await;
  write(&s, series("s1", &["sal"], &[(0, 35.0)])).await;

  s.remove_phenomenon("sal").await.unwrap();

  let all = observations(&s).await;
  assert_eq!(all.len(), 1);
  assert_eq!(phenomenon_id(&all[0]), Some("temp"));
  assert_eq!(field_names(&all[0]), ["time", "temp"]);
  assert_eq!(csv(&s, "s1").await, "time,temp\n2024-05-01T12:00:00.000Z,10");

  assert!(!exists(&s, EntityType::Phenomenon, "sal").await);
  assert!(!exists(&s, EntityType::Phenomenon, "computed-phen-s1").await);
  let procedures = s.get_procedures(&EntityQuery::default()).await.unwrap();
  assert_eq!(procedures[0].phenomenon.as_deref(), Some("temp"));
}

#[tokio::test]
async fn removing_a_shared_component_decomposes_every_procedure() {
  let s = store().await;
  write(&s, series("s1", &["temp", "sal"], &[(0, 10.0)])).await;
  write(&s, series("s2", &["temp", "sal"], &[(0, 11.0)])).await;
  let mut salinity_only = series("s3", &["sal"], &[(0, 35.0)]);
  salinity_only.feature_of_interest = Some(station("station-2"));
  write(&s, salinity_only).await;

  s.remove_phenomenon("sal").await.unwrap();

  assert!(!exists(&s, EntityType::Phenomenon, "sal").await);
  assert!(!exists(&s, EntityType::Phenomenon, "computed-phen-s1").await);
  assert!(exists(&s, EntityType::Phenomenon, "temp").await);

  let all = observations(&s).await;
  let ids: Vec<_> = all.iter().map(|o| o.id.as_str()).collect();
  assert_eq!(ids, ["s1-obs-1", "s2-obs-1"]);
  assert!(all.iter().all(|o| phenomenon_id(o) == Some("temp")));
  assert_eq!(csv(&s, "s2").await, "time,temp\n2024-05-01T12:00:00.000Z,11");

  assert!(!exists(&s, EntityType::Procedure, "s3").await);
  assert!(exists(&s, EntityType::Feature, "station-1").await);
  assert!(!exists(&s, EntityType::Feature, "station-2").await);

  let offerings = s.get_offerings(&EntityQuery::default()).await.unwrap();
  let ids: Vec<_> = offerings.iter().map(|o| o.id.as_str()).collect();
  assert_eq!(ids, ["offering-s1", "offering-s2"]);
  assert!(offerings.iter().all(|o| o.phenomena == ["temp"]));
  assert!(!exists(&s, EntityType::Offering, "offering-s3").await);
}

#[tokio::test]
async fn removing_the_only_phenomenon_removes_the_procedure() {
  let s = store().await;
  write(&s, series("s1", &["temp"], &[(0, 10.0)])).await;

  s.remove_phenomenon("temp").await.unwrap();
  assert!(!exists(&s, EntityType::Procedure, "s1").await);
  assert!(!exists(&s, EntityType::Observation, "s1-obs-1").await);
  assert!(!exists(&s, EntityType::Feature, "station-1").await);
  assert!(!exists(&s, EntityType::Phenomenon, "temp").await);
}

#[tokio::test]
async fn removing_an_unknown_phenomenon_is_a_no_op() {
  let s = store().await;
  write(&s, series("s1", &["temp"], &[(0, 10.0)])).await;
  s.remove_phenomenon("nope").await.unwrap();
  assert_eq!(row_count(&s, "s1").await, 1);
}
