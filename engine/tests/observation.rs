//! Query observation end to end: incremental, reloading, columns and counts.

mod common;

use common::*;
use larder_engine::{q, Database, DatabaseConfig, Record, SortOrder};
use std::time::Duration;

async fn update_task(db: &Database, record: &Record, column: &'static str, value: &'static str) {
    let record = record.clone();
    db.write("update task", move |action| async move {
        record
            .update(&action, |task| {
                task.set_raw(column, value);
            })
            .await
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn incremental_observation_needs_no_requery() {
    let (db, adapter) = instrumented_database(DatabaseConfig::default());
    let seeded = seed_tasks(&db, &[("a", Some("active")), ("b", Some("done")), ("c", None)]).await;
    let query = db
        .get("tasks")
        .unwrap()
        .query(vec![q::where_("status", "active")])
        .unwrap();
    assert!(query.is_incremental());

    let lists = Emissions::new();
    let subscription = query.observe({
        let lists = lists.clone();
        move |records| lists.push(titles(records))
    });
    assert_eq!(lists.wait_for(1).await, vec![vec!["a".to_string()]]);
    let queries_after_initial_fetch = adapter.query_count();

    update_task(&db, &seeded[1], "status", "active").await;

    assert_eq!(
        lists.snapshot(),
        vec![vec!["a".to_string()], vec!["a".to_string(), "b".to_string()]]
    );
    assert_eq!(adapter.query_count(), queries_after_initial_fetch);

    // Changes that don't affect membership aren't emitted.
    update_task(&db, &seeded[2], "title", "c2").await;
    assert_eq!(lists.len(), 2);
    subscription.unsubscribe();
}

#[tokio::test]
async fn late_subscribers_share_the_source_and_get_the_latest_value() {
    let (db, adapter) = instrumented_database(DatabaseConfig::default());
    seed_tasks(&db, &[("a", Some("active"))]).await;
    let query = db
        .get("tasks")
        .unwrap()
        .query(vec![q::where_("status", "active")])
        .unwrap();

    let first = Emissions::new();
    let _first = query.observe({
        let first = first.clone();
        move |records| first.push(ids(records))
    });
    first.wait_for(1).await;

    let second = Emissions::new();
    let _second = query.observe({
        let second = second.clone();
        move |records| second.push(ids(records))
    });
    assert_eq!(second.len(), 1);
    assert_eq!(first.snapshot(), second.snapshot());
    assert_eq!(adapter.query_count(), 1);
}

#[tokio::test]
async fn changes_during_the_initial_fetch_are_not_lost() {
    let db = database();
    let seeded = seed_tasks(&db, &[("a", Some("active")), ("b", Some("done"))]).await;
    let query = db
        .get("tasks")
        .unwrap()
        .query(vec![q::where_("status", "active")])
        .unwrap();

    let lists = Emissions::new();
    let _subscription = query.observe({
        let lists = lists.clone();
        move |records| lists.push(titles(records))
    });
    // Queued before the observation's fetch gets to run.
    update_task(&db, &seeded[1], "status", "active").await;

    settle().await;
    let last = lists.snapshot().pop().unwrap_or_default();
    assert_eq!(last, vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test]
async fn sorted_queries_reload() {
    let (db, adapter) = instrumented_database(DatabaseConfig::default());
    seed_tasks(&db, &[("a", None), ("b", None)]).await;
    let tasks = db.get("tasks").unwrap();
    let query = tasks
        .query(vec![q::sort_by("position", SortOrder::Desc)])
        .unwrap();
    assert!(!query.is_incremental());

    let lists = Emissions::new();
    let _subscription = query.observe({
        let lists = lists.clone();
        move |records| lists.push(titles(records))
    });
    lists.wait_for(1).await;
    let queries_before = adapter.query_count();

    db.write("create c", {
        let tasks = tasks.clone();
        move |action| async move {
            tasks
                .create(&action, |task| {
                    task.set_raw("title", "c").set_raw("position", 10.0);
                })
                .await
        }
    })
    .await
    .unwrap();

    let lists = lists.wait_for(2).await;
    assert_eq!(
        lists,
        vec![
            vec!["b".to_string(), "a".to_string()],
            vec!["c".to_string(), "b".to_string(), "a".to_string()],
        ]
    );
    assert!(adapter.query_count() > queries_before);
}

#[tokio::test]
async fn joined_queries_reload_on_related_table_changes() {
    let db = database();
    let tasks = db.get("tasks").unwrap();
    let projects = db.get("projects").unwrap();

    let query = tasks
        .query(vec![q::on_column("projects", "name", "inbox")])
        .unwrap();
    let lists = Emissions::new();
    let _subscription = query.observe({
        let lists = lists.clone();
        move |records| lists.push(titles(records))
    });
    assert_eq!(lists.wait_for(1).await, vec![Vec::<String>::new()]);

    let project = db
        .write("create project and task", {
            let db = db.clone();
            move |action| async move {
                let project = projects.prepare_create(|p| {
                    p.set_raw("name", "elsewhere");
                })?;
                let project_id = project.id().to_string();
                let task = tasks.prepare_create(|task| {
                    task.set_raw("title", "t").set_raw("project_id", project_id);
                })?;
                db.batch(&action, vec![project.clone(), task]).await?;
                Ok(project)
            }
        })
        .await
        .unwrap();

    // Nothing matches yet, and identical results aren't re-emitted.
    settle().await;
    assert_eq!(lists.len(), 1);

    // Renaming the project alone brings the task in.
    let renamed = project.clone();
    db.write("rename project", move |action| async move {
        renamed
            .update(&action, |p| {
                p.set_raw("name", "inbox");
            })
            .await
    })
    .await
    .unwrap();
    assert_eq!(lists.wait_for(2).await[1], vec!["t".to_string()]);
}

#[tokio::test]
async fn observed_ids_follow_the_query() {
    let db = database();
    let seeded = seed_tasks(&db, &[("a", Some("active")), ("b", Some("done"))]).await;
    let query = db
        .get("tasks")
        .unwrap()
        .query(vec![q::where_("status", "active")])
        .unwrap();

    let emitted = Emissions::new();
    let _subscription = query.observe_ids({
        let emitted = emitted.clone();
        move |ids| emitted.push(ids.to_vec())
    });
    assert_eq!(emitted.wait_for(1).await[0], vec![seeded[0].id().to_string()]);

    update_task(&db, &seeded[1], "status", "active").await;
    let latest = emitted.wait_for(2).await.pop().unwrap_or_default();
    assert_eq!(latest.len(), 2);
}

#[tokio::test]
async fn column_observation_reemits_on_watched_columns_only() {
    let db = database();
    let seeded = seed_tasks(&db, &[("a", Some("active")), ("b", Some("done"))]).await;
    let query = db
        .get("tasks")
        .unwrap()
        .query(vec![q::where_("status", "active")])
        .unwrap();

    let lists = Emissions::new();
    let _subscription = query
        .observe_with_columns(&["title"], {
            let lists = lists.clone();
            move |records| lists.push(titles(records))
        })
        .unwrap();
    lists.wait_for(1).await;

    // Watched column on a listed record.
    update_task(&db, &seeded[0], "title", "a2").await;
    assert_eq!(lists.wait_for(2).await[1], vec!["a2".to_string()]);

    // Unwatched column, and a record that isn't listed.
    let record = seeded[0].clone();
    db.write("move", move |action| async move {
        record
            .update(&action, |task| {
                task.set_raw("position", 5.0);
            })
            .await
    })
    .await
    .unwrap();
    update_task(&db, &seeded[1], "title", "b2").await;
    settle().await;
    assert_eq!(lists.len(), 2);

    // Membership changes still come through.
    update_task(&db, &seeded[1], "status", "active").await;
    assert_eq!(
        lists.wait_for(3).await[2],
        vec!["a2".to_string(), "b2".to_string()]
    );
}

#[tokio::test]
async fn column_observation_of_reloading_queries() {
    let db = database();
    let seeded = seed_tasks(&db, &[("a", None), ("b", None)]).await;
    let query = db
        .get("tasks")
        .unwrap()
        .query(vec![q::sort_by("title", SortOrder::Asc)])
        .unwrap();

    let lists = Emissions::new();
    let _subscription = query
        .observe_with_columns(&["title"], {
            let lists = lists.clone();
            move |records| lists.push(titles(records))
        })
        .unwrap();
    lists.wait_for(1).await;

    // The column change goes out with the list as it stood, then the
    // reload brings the new order.
    update_task(&db, &seeded[0], "title", "c").await;
    let lists = lists.wait_for(3).await;
    assert_eq!(lists[1], vec!["c".to_string(), "b".to_string()]);
    assert_eq!(lists[2], vec!["b".to_string(), "c".to_string()]);
}

#[tokio::test]
async fn incremental_count() {
    let (db, adapter) = instrumented_database(DatabaseConfig::default());
    let seeded = seed_tasks(&db, &[("a", Some("active")), ("b", Some("done"))]).await;
    let query = db
        .get("tasks")
        .unwrap()
        .query(vec![q::where_("status", "active")])
        .unwrap();

    let counts = Emissions::new();
    let _subscription = query.observe_count(false, {
        let counts = counts.clone();
        move |count| counts.push(count)
    });
    assert_eq!(counts.wait_for(1).await, vec![1]);

    update_task(&db, &seeded[1], "status", "active").await;
    update_task(&db, &seeded[1], "title", "renamed").await;
    assert_eq!(counts.snapshot(), vec![1, 2]);
    assert_eq!(adapter.count_calls(), 0);
}

#[tokio::test]
async fn throttled_recount_coalesces_bursts() {
    let config = DatabaseConfig::default().with_count_throttle(Some(Duration::from_millis(200)));
    let (db, adapter) = instrumented_database(config);
    let tasks = db.get("tasks").unwrap();
    let query = tasks
        .query(vec![q::sort_by("position", SortOrder::Asc), q::take(100)])
        .unwrap();

    let counts = Emissions::new();
    let _subscription = query.observe_count(true, {
        let counts = counts.clone();
        move |count| counts.push(count)
    });
    assert_eq!(counts.wait_for(1).await, vec![0]);
    let calls_before = adapter.count_calls();

    for title in ["a", "b", "c", "d", "e"] {
        db.write("create", {
            let tasks = tasks.clone();
            move |action| async move {
                tasks
                    .create(&action, |task| {
                        task.set_raw("title", title);
                    })
                    .await
            }
        })
        .await
        .unwrap();
    }

    counts.wait_until(|counts| counts.last() == Some(&5)).await;
    assert!(adapter.count_calls() - calls_before < 5);
}

#[tokio::test]
async fn unsubscribed_observers_stay_quiet() {
    let db = database();
    let seeded = seed_tasks(&db, &[("a", Some("active")), ("b", Some("done"))]).await;
    let query = db
        .get("tasks")
        .unwrap()
        .query(vec![q::where_("status", "active")])
        .unwrap();

    let lists = Emissions::new();
    let subscription = query.observe({
        let lists = lists.clone();
        move |records| lists.push(ids(records))
    });
    lists.wait_for(1).await;
    subscription.unsubscribe();
    subscription.unsubscribe();

    update_task(&db, &seeded[1], "status", "active").await;
    settle().await;
    assert_eq!(lists.len(), 1);
}
