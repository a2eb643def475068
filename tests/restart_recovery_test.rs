mod common;

use std::sync::Arc;

use common::Driver;
use spitedb_projections::{
    CoreProjection, EventStore, MemoryStore, ProjectionConfig, ProjectionState, ProjectionStatus, ProjectionVersion,
    SourceDefinition,
};

fn emitting() -> ProjectionConfig {
    ProjectionConfig::default().with_emit_events_enabled(true)
}

#[test]
fn killed_projection_reemits_without_duplicates() {
    let store: Arc<dyn EventStore> = Arc::new(MemoryStore::new());
    common::append(store.as_ref(), "account-1", "Emit");
    common::append(store.as_ref(), "account-1", "Emit");

    let mut first = Driver::new(store.clone(), emitting());
    first.projection.start().unwrap();
    first.feed();
    assert_eq!(first.stream("out-account-1"), vec!["1".to_string(), "2".to_string()]);
    first.projection.kill();
    first.settle();
    assert!(first.stream("$projections-counter-checkpoint").is_empty());

    // Same events are processed again; what is already stored is acknowledged.
    let mut second = Driver::new(store.clone(), emitting());
    second.projection.start().unwrap();
    second.feed();
    assert_eq!(second.projection.state(), ProjectionState::Running);
    assert_eq!(second.stream("out-account-1"), vec!["1".to_string(), "2".to_string()]);

    common::append(store.as_ref(), "account-1", "Emit");
    second.feed();
    assert_eq!(
        second.stream("out-account-1"),
        vec!["1".to_string(), "2".to_string(), "3".to_string()]
    );
}

#[test]
fn stopped_projection_resumes_where_it_left_off() {
    let store: Arc<dyn EventStore> = Arc::new(MemoryStore::new());
    common::append(store.as_ref(), "account-1", "Deposited");
    common::append(store.as_ref(), "account-2", "Deposited");
    common::append(store.as_ref(), "account-1", "Deposited");

    let mut first = Driver::new(store.clone(), ProjectionConfig::default());
    first.projection.start().unwrap();
    first.feed();
    first.projection.stop().unwrap();
    first.settle();
    assert_eq!(first.projection.state(), ProjectionState::Stopped);
    assert_eq!(first.stream("$projections-counter-checkpoint").len(), 1);
    assert_eq!(first.stream("$projections-counter-account-1-checkpoint").len(), 1);

    common::append(store.as_ref(), "account-2", "Deposited");
    let mut second = Driver::new(store.clone(), ProjectionConfig::default());
    second.projection.start().unwrap();
    second.feed();

    assert_eq!(second.projection.statistics().events_processed_after_restart, 1);
    assert_eq!(second.state_of("account-1"), Some("2".to_string()));
    assert_eq!(second.state_of("account-2"), Some("2".to_string()));
}

#[test]
fn running_results_and_catalog_are_written() {
    let store: Arc<dyn EventStore> = Arc::new(MemoryStore::new());
    common::append(store.as_ref(), "account-1", "Deposited");
    common::append(store.as_ref(), "account-2", "Deposited");
    common::append(store.as_ref(), "account-1", "Deposited");

    let config = ProjectionConfig::default()
        .with_output_running_results(true)
        .with_emit_partition_catalog(true);
    let mut driver = Driver::new(store.clone(), config);
    driver.projection.start().unwrap();
    driver.feed();
    driver.projection.stop().unwrap();
    driver.settle();

    assert_eq!(
        driver.stream("$projections-counter-account-1-result"),
        vec!["1".to_string(), "2".to_string()]
    );
    assert_eq!(
        driver.stream("$projections-counter-partitions"),
        vec!["account-1".to_string(), "account-2".to_string()]
    );
}

#[test]
fn faulted_projection_keeps_processed_work() {
    let store: Arc<dyn EventStore> = Arc::new(MemoryStore::new());
    common::append(store.as_ref(), "account-1", "Deposited");
    common::append(store.as_ref(), "account-1", "Boom");
    common::append(store.as_ref(), "account-1", "Deposited");

    let mut driver = Driver::new(store.clone(), ProjectionConfig::default());
    driver.projection.start().unwrap();
    driver.feed();

    assert_eq!(driver.projection.state(), ProjectionState::Faulted);
    assert!(matches!(
        driver.statuses().last(),
        Some(ProjectionStatus::Faulted { reason }) if reason.contains("boom")
    ));
    assert_eq!(driver.stream("$projections-counter-checkpoint").len(), 1);
    assert_eq!(driver.state_of("account-1"), Some("1".to_string()));
}

#[test]
fn single_stream_source_restarts_from_checkpoint() {
    let store: Arc<dyn EventStore> = Arc::new(MemoryStore::new());
    common::append(store.as_ref(), "account-1", "Deposited");
    common::append(store.as_ref(), "account-1", "Deposited");

    let projection = || {
        CoreProjection::with_seed(
            "counter",
            ProjectionVersion::new(1, 0, 0),
            SourceDefinition::Streams(vec!["account-1".to_string()]),
            common::Counter,
            ProjectionConfig::default(),
            7,
        )
    };

    let mut first = Driver::with_projection(store.clone(), projection());
    first.projection.start().unwrap();
    first.feed();
    first.projection.stop().unwrap();
    first.settle();
    assert_eq!(first.projection.state(), ProjectionState::Stopped);

    common::append(store.as_ref(), "account-1", "Deposited");
    let mut second = Driver::with_projection(store.clone(), projection());
    second.projection.start().unwrap();
    second.feed();

    assert_eq!(second.projection.state(), ProjectionState::Running);
    assert_eq!(second.projection.faulted_reason(), None);
    assert_eq!(second.projection.statistics().events_processed_after_restart, 1);
    assert_eq!(second.state_of("account-1"), Some("3".to_string()));
}
