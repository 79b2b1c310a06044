//! Concurrency stress: many tasks submitting, polling and cancelling a
//! small pool of overlapping specs, then a sweep of invariants.

use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use spate::warehouse::MemoryWarehouse;
use spate::{Cache, QueryId, QuerySpec, QueryState, Scheduler, StateRegistry, Warehouse};

// Number of submitter tasks and operations each performs.
const N_TASKS: usize = 8;
const N_OPS: usize = 25;

#[derive(Clone, Copy, Debug)]
enum Op {
    Submit(usize),
    Cancel(usize),
    Poll(usize),
}

fn spec_pool() -> Vec<QuerySpec> {
    let mut specs = Vec::new();
    for day in 1..=4 {
        specs.push(
            QuerySpec::from_value(&json!({
                "query_kind": "daily_location",
                "date": format!("2016-01-{day:02}"),
                "method": "last",
                "aggregation_unit": "admin3",
                "subscriber_subset": null,
            }))
            .unwrap(),
        );
        specs.push(
            QuerySpec::from_value(&json!({
                "query_kind": "subscriber_degree",
                "start": format!("2016-01-{day:02}"),
                "stop": "2016-02-01",
                "direction": "both",
            }))
            .unwrap(),
        );
    }
    // One bigger graph whose subtrees overlap the dailies' sightings.
    specs.push(
        QuerySpec::from_value(&json!({
            "query_kind": "modal_location",
            "locations": [
                {
                    "query_kind": "daily_location",
                    "date": "2016-01-01",
                    "method": "last",
                    "aggregation_unit": "admin3",
                    "subscriber_subset": null,
                },
                {
                    "query_kind": "daily_location",
                    "date": "2016-01-02",
                    "method": "last",
                    "aggregation_unit": "admin3",
                    "subscriber_subset": null,
                },
            ],
        }))
        .unwrap(),
    );
    specs
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stress_test() {
    let warehouse = Arc::new(MemoryWarehouse::new());
    warehouse.set_create_delay(Duration::from_millis(2));
    let cache = Arc::new(
        Cache::open(warehouse.clone() as Arc<dyn Warehouse>, 3600.0, None)
            .await
            .unwrap(),
    );
    let registry = Arc::new(StateRegistry::new());
    let scheduler = Scheduler::start(
        warehouse.clone(),
        cache.clone(),
        registry.clone(),
        4,
        256,
    );

    let specs = spec_pool();
    let mut tasks = Vec::new();
    for _ in 0..N_TASKS {
        let ops: Vec<Op> = {
            let mut rng = rand::thread_rng();
            (0..N_OPS)
                .map(|_| {
                    let index = rng.gen_range(0..specs.len());
                    *[Op::Submit(index), Op::Submit(index), Op::Poll(index), Op::Cancel(index)]
                        .choose(&mut rng)
                        .unwrap()
                })
                .collect()
        };
        let specs = specs.clone();
        let scheduler = scheduler.clone();
        let registry = registry.clone();
        tasks.push(tokio::spawn(async move {
            for op in ops {
                match op {
                    Op::Submit(index) => {
                        let id = scheduler.submit(specs[index].clone()).await.unwrap();
                        assert_eq!(id, specs[index].fingerprint());
                    }
                    Op::Cancel(index) => {
                        // Cancelling something never submitted, already done
                        // or mid-flight are all legal outcomes here.
                        let _ = scheduler.cancel(&specs[index].fingerprint());
                    }
                    Op::Poll(index) => {
                        let _ = registry.state_of(&specs[index].fingerprint());
                    }
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    // Drive every root to quiescence: resubmit (reopening anything that a
    // racing cancel killed) and wait for terminal states.
    for spec in &specs {
        let mut state = QueryState::Known;
        for _ in 0..20 {
            scheduler.submit(spec.clone()).await.unwrap();
            let machine = registry.get(&spec.fingerprint()).unwrap();
            state = machine.wait_terminal().await;
            if state == QueryState::Completed {
                break;
            }
        }
        assert_eq!(state, QueryState::Completed, "{}", spec.fingerprint());
    }

    // No relation is ever created twice without an intervening rollback:
    // for every table, creates never exceed drops + 1.
    let ddl = warehouse.ddl_log();
    let mut counts: std::collections::BTreeMap<&str, (i32, i32)> = Default::default();
    for statement in &ddl {
        if let Some(table) = statement
            .strip_prefix("CREATE TABLE ")
            .and_then(|rest| rest.split_whitespace().next())
        {
            counts.entry(table).or_default().0 += 1;
        }
        if let Some(table) = statement.strip_prefix("DROP TABLE IF EXISTS ") {
            counts.entry(table.trim()).or_default().1 += 1;
        }
    }
    for (table, (creates, drops)) in counts {
        assert!(
            creates <= drops + 1,
            "{table}: {creates} creates against {drops} drops"
        );
    }

    // Every materialised record's relation really exists.
    for spec in &specs {
        let id: QueryId = spec.fingerprint();
        let record = cache.lookup(&id).unwrap();
        if record.is_materialised() {
            assert!(warehouse
                .table_exists("cache", &id.table_name())
                .await
                .unwrap());
        }
    }
}
