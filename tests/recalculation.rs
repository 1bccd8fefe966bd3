//! End-to-end scenarios across scopes: creation, layered resolution,
//! stale propagation, integrity rules, and the manager facade.

use anyhow::Result;
use paramstore::{
    ActivityParameterDef, ActivityParameterUpdate, Error, MemoryHost, ParameterDef,
    ParameterStore, Parameters, Scope,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn engine() -> Result<(ParameterStore, MemoryHost)> {
    init_tracing();
    let host = MemoryHost::new();
    let store = ParameterStore::open_memory(Box::new(host.clone()))?;
    Ok((store, host))
}

fn def(name: &str) -> ParameterDef {
    ParameterDef::new(name)
}

#[test]
fn project_formulas_resolve_transitively() -> Result<()> {
    let (mut store, _host) = engine()?;
    store.create_project_parameter(&def("foo").with_amount(3.14))?;
    store.create_project_parameter(&def("bar").with_formula("2 * foo"))?;

    let amounts = store.static_amounts(&Scope::Project, None)?;
    assert_eq!(amounts["foo"], Some(3.14));
    assert_eq!(amounts["bar"], None);

    store.recalculate(&Scope::Project)?;
    let amounts = store.project_static(None)?;
    assert_eq!(amounts["foo"], Some(3.14));
    assert_eq!(amounts["bar"], Some(6.28));
    Ok(())
}

#[test]
fn cross_scope_global_recalculation() -> Result<()> {
    let (store, host) = engine()?;
    host.register_database("B");
    let mut parameters = Parameters::new(store);

    let store = parameters.store_mut();
    store.create_project_parameter(&def("bar").with_formula("2 * 2 * 2"))?;
    store.create_database_parameter("B", &def("foo").with_formula("2 ** 2"))?;
    store.create_activity_parameter(
        "A",
        &ActivityParameterDef::new("B", "C", def("D").with_formula("2 ** 3")),
    )?;
    store.create_activity_parameter(
        "A",
        &ActivityParameterDef::new("B", "E", def("F").with_formula("foo + bar + D")),
    )?;

    parameters.recalculate()?;

    let store = parameters.store();
    assert_eq!(store.get_project_parameter("bar")?.unwrap().amount, Some(8.0));
    assert_eq!(
        store.get_database_parameter("B", "foo")?.unwrap().amount,
        Some(4.0)
    );
    assert_eq!(store.get_activity_parameter("A", "D")?.unwrap().amount, Some(8.0));
    assert_eq!(store.get_activity_parameter("A", "F")?.unwrap().amount, Some(20.0));
    Ok(())
}

#[test]
fn inheritance_order_gates_foreign_group_names() -> Result<()> {
    let (mut store, host) = engine()?;
    host.register_database("B");
    host.register_database("K");

    store.create_activity_parameter(
        "A",
        &ActivityParameterDef::new("B", "C", def("D").with_formula("2 ** 3")),
    )?;
    store.create_activity_parameter(
        "A",
        &ActivityParameterDef::new("B", "E", def("F").with_formula("2 * D")),
    )?;
    store.recalculate_activity("A")?;

    store.create_activity_parameter(
        "G",
        &ActivityParameterDef::new("K", "H", def("J").with_formula("F + D * 2")),
    )?;
    store.create_activity_parameter(
        "G",
        &ActivityParameterDef::new("K", "E", def("F").with_amount(3.0)),
    )?;

    let err = store.recalculate_activity("G").unwrap_err();
    assert!(matches!(err, Error::MissingName { .. }));
    assert!(store.activity_expired("G")?);

    store.set_group_order("G", &["A".to_string()])?;
    store.recalculate_activity("G")?;
    assert_eq!(store.get_activity_parameter("G", "J")?.unwrap().amount, Some(19.0));
    // The group's own F shadows the inherited one.
    assert_eq!(store.get_activity_parameter("G", "F")?.unwrap().amount, Some(3.0));
    Ok(())
}

#[test]
fn expire_downstream_propagates_staleness() -> Result<()> {
    let (mut store, _host) = engine()?;
    store.create_group("A")?;
    store.create_group("B")?;
    store.add_group_dependency("B", "A")?;
    assert!(store.get_group("A")?.unwrap().fresh);
    assert!(store.get_group("B")?.unwrap().fresh);

    store.expire_downstream("A")?;
    assert!(store.get_group("A")?.unwrap().fresh);
    assert!(!store.get_group("B")?.unwrap().fresh);
    Ok(())
}

#[test]
fn activity_keys_are_immutable() -> Result<()> {
    let (mut store, _host) = engine()?;
    store.create_activity_parameter("A", &ActivityParameterDef::new("B", "D", def("C")))?;

    let update = ActivityParameterUpdate {
        database: Some("E".to_string()),
        ..ActivityParameterUpdate::default()
    };
    assert!(matches!(
        store.update_activity_parameter("A", "C", &update),
        Err(Error::Integrity(_))
    ));
    Ok(())
}

#[test]
fn dependency_cycles_are_refused() -> Result<()> {
    let (mut store, _host) = engine()?;
    store.add_group_dependency("foo", "bar")?;
    assert!(matches!(
        store.add_group_dependency("bar", "foo"),
        Err(Error::Integrity(_))
    ));
    Ok(())
}

#[test]
fn order_lists_purge_reserved_and_database_names() -> Result<()> {
    let (mut store, host) = engine()?;
    host.register_database("A");
    host.register_database("B");
    let group = store.create_group_ordered(
        "one",
        &[
            "C".to_string(),
            "project".to_string(),
            "B".to_string(),
            "D".to_string(),
            "A".to_string(),
        ],
    )?;
    assert_eq!(group.order, vec!["C".to_string(), "D".to_string()]);
    assert_eq!(
        store.get_group("one")?.unwrap().order,
        vec!["C".to_string(), "D".to_string()]
    );
    Ok(())
}

#[test]
fn group_timestamps_advance_across_mutations() -> Result<()> {
    let (mut store, _host) = engine()?;
    store.create_project_parameter(&def("foo").with_amount(3.14))?;
    let first = store.get_group("project")?.unwrap().updated;

    // Second resolution: writes must be spaced for distinct stamps.
    std::thread::sleep(std::time::Duration::from_millis(1100));
    store.create_project_parameter(&def("bar").with_formula("2 * foo"))?;
    let second = store.get_group("project")?.unwrap().updated;
    assert!(second > first);

    std::thread::sleep(std::time::Duration::from_millis(1100));
    store.delete_project_parameter("bar")?;
    let third = store.get_group("project")?.unwrap().updated;
    assert!(third > second);
    Ok(())
}

#[test]
fn load_round_trips_dict() -> Result<()> {
    let (mut store, _host) = engine()?;
    let created = store.create_activity_parameter(
        "A",
        &ActivityParameterDef::new(
            "B",
            "E",
            def("F")
                .with_amount(7.0)
                .with_formula("7 * 1")
                .with_data_entry("foo", serde_json::json!("bar")),
        ),
    )?;

    let loaded = store.load_activity_parameters("A")?;
    let entry = &loaded["F"];
    for (key, value) in created.dict() {
        if key == "name" {
            continue;
        }
        assert_eq!(entry.get(&key), Some(&value), "mismatch for key {key}");
    }
    Ok(())
}

#[test]
fn failed_recalculation_keeps_previous_amounts() -> Result<()> {
    let (mut store, _host) = engine()?;
    store.create_project_parameter(&def("foo").with_amount(2.0))?;
    store.create_project_parameter(&def("bar").with_formula("2 * foo"))?;
    store.recalculate_project()?;
    assert_eq!(store.get_project_parameter("bar")?.unwrap().amount, Some(4.0));

    // Introduce an unresolvable reference; the failing pass must not leave
    // partial writes behind.
    store.create_project_parameter(&def("broken").with_formula("2 * ghost"))?;
    store.update_project_parameter(
        "foo",
        &paramstore::ParameterUpdate::amount(10.0),
    )?;
    assert!(store.recalculate_project().is_err());
    assert!(store.project_expired()?);
    assert_eq!(store.get_project_parameter("bar")?.unwrap().amount, Some(4.0));
    Ok(())
}

#[test]
fn store_persists_on_disk() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("parameters.db");
    let host = MemoryHost::new();

    {
        let mut store = ParameterStore::open(&path, Box::new(host.clone()))?;
        store.create_project_parameter(&def("foo").with_amount(3.14))?;
        store.create_project_parameter(&def("bar").with_formula("2 * foo"))?;
        store.recalculate_project()?;
    }

    let store = ParameterStore::open(&path, Box::new(host))?;
    assert_eq!(store.get_project_parameter("bar")?.unwrap().amount, Some(6.28));
    assert!(!store.project_expired()?);
    Ok(())
}

#[test]
fn manager_batches_and_reports() -> Result<()> {
    init_tracing();
    let host = MemoryHost::new();
    host.register_database("db");
    let mut parameters = Parameters::in_memory(Box::new(host))?;

    assert_eq!(parameters.to_string(), "Parameters manager with 0 objects");
    parameters.new_project_parameters(&[
        def("foo").with_amount(4.0),
        def("bar").with_formula("foo + 3"),
    ])?;
    parameters.new_database_parameters(&[def("baz").with_formula("bar * 2")], "db")?;

    assert_eq!(parameters.count()?, 3);
    assert_eq!(parameters.to_string(), "Parameters manager with 3 objects");
    assert_eq!(
        parameters
            .store()
            .get_database_parameter("db", "baz")?
            .unwrap()
            .amount,
        Some(14.0)
    );
    // Database scope resolved `bar` through project scope.
    assert!(parameters
        .store()
        .get_group_dependency("db", "project")?
        .is_some());
    Ok(())
}
