mod common;

use buildit_core::security::{MatrixAuthorizer, Permission};
use buildit_core::{
    BuildResult, Cause, Error, FullName, LabelExpr, PublisherConfig, Trigger, TriggerKind,
};
use buildit_scheduler::{ExecutorSpec, ItemState, LeaseHolder, PointerKind, ProjectStatus};
use chrono::{Duration as ChronoDuration, Utc};
use common::{Harness, eventually, project};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn user(name: &str) -> Cause {
    Cause::User {
        user: name.to_string(),
    }
}

fn name(s: &str) -> FullName {
    FullName::parse(s).unwrap()
}

#[tokio::test]
async fn test_build_runs_and_records_history() {
    let h = Harness::new(1);
    h.scheduler.create_project("app", project(&["ok"])).unwrap();
    h.scheduler.start();

    let handle = h.scheduler.schedule_build("app", user("alice")).unwrap().unwrap();
    let build = handle.wait().await.unwrap();
    assert_eq!(build.number, 1);
    assert_eq!(build.result, Some(BuildResult::Success));
    assert!(build.finished_at.is_some());

    let pointers = h.scheduler.pointers("app").unwrap();
    assert_eq!(pointers.last_successful, Some(1));
    assert_eq!(pointers.last_stable, Some(1));
    assert_eq!(h.scheduler.history("app").unwrap().len(), 1);

    let log = h.scheduler.log("app", 1).await.unwrap();
    assert!(log.contains("Started by user alice"));
    assert!(log.contains("+ ok"));
    assert!(log.contains("Finished: SUCCESS"));

    h.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_requests_merge_into_one_item() {
    let h = Harness::new(0);
    h.scheduler.create_project("app", project(&["ok"])).unwrap();

    let first = h.scheduler.schedule_build("app", user("alice")).unwrap().unwrap();
    let second = h.scheduler.schedule_build("app", Cause::Timer).unwrap().unwrap();
    let third = h.scheduler.schedule_build("app", user("alice")).unwrap().unwrap();
    assert_eq!(first, second);
    assert_eq!(second, third);

    let items = h.scheduler.queue().items();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].causes, vec![user("alice"), Cause::Timer]);
    assert_eq!(h.scheduler.state("app").unwrap(), ProjectStatus::Queued);
}

#[tokio::test]
async fn test_disabled_project_rejects_builds() {
    let h = Harness::new(0);
    h.scheduler.create_project("app", project(&["ok"])).unwrap();

    let handle = h.scheduler.schedule_build("app", user("alice")).unwrap().unwrap();
    h.scheduler.set_disabled("app", true).unwrap();
    assert_eq!(handle.state(), ItemState::Cancelled);
    assert!(matches!(handle.wait().await, Err(Error::Cancelled)));

    assert!(h.scheduler.schedule_build("app", user("alice")).unwrap().is_none());
    assert!(h.scheduler.history("app").unwrap().is_empty());
    assert_eq!(h.scheduler.next_build_number("app").unwrap(), 1);

    h.scheduler.set_disabled("app", false).unwrap();
    assert!(h.scheduler.schedule_build("app", user("alice")).unwrap().is_some());
}

#[tokio::test]
async fn test_poll_and_build_never_overlap() {
    let h = Harness::new(1);
    h.scheduler.create_project("app", project(&["ok"])).unwrap();
    h.scheduler.start();
    h.remote.slow_polls(Duration::from_millis(300));
    h.remote.push();

    let poll = {
        let scheduler = h.scheduler.clone();
        tokio::spawn(async move { scheduler.poll("app", &CancellationToken::new()).await })
    };
    eventually(|| h.scheduler.state("app").unwrap() == ProjectStatus::Polling).await;

    let handle = h.scheduler.schedule_build("app", user("alice")).unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.state(), ItemState::Waiting);
    assert!(h.scheduler.history("app").unwrap().is_empty());

    assert!(poll.await.unwrap().unwrap().has_changes());
    let build = handle.wait().await.unwrap();
    assert_eq!(build.number, 1);

    h.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_label_mismatch_keeps_item_queued() {
    let h = Harness::with_executors(vec![ExecutorSpec::new("mac-1", ["mac"])]);
    let mut app = project(&["ok"]);
    app.assigned_label = Some(LabelExpr::parse("linux").unwrap());
    h.scheduler.create_project("app", app).unwrap();
    h.scheduler.start();

    let handle = h.scheduler.schedule_build("app", user("alice")).unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(handle.state(), ItemState::Waiting);
    assert_eq!(h.scheduler.state("app").unwrap(), ProjectStatus::Queued);
    assert!(h.scheduler.history("app").unwrap().is_empty());

    let mut config = h.scheduler.config("app").unwrap();
    config.assigned_label = Some(LabelExpr::parse("linux || mac").unwrap());
    h.scheduler.update_config("app", config).unwrap();

    let build = handle.wait().await.unwrap();
    assert_eq!(build.number, 1);
    assert_eq!(build.executor, "mac-1");

    h.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_downstream_waits_while_upstream_is_queued_or_building() {
    let h = Harness::new(2);
    let mut lib = project(&["sleep 400"]);
    lib.assigned_label = Some(LabelExpr::parse("nowhere").unwrap());
    h.scheduler.create_project("lib", lib).unwrap();
    let mut app = project(&["ok"]);
    app.block_when_upstream_building = true;
    app.triggers
        .add(Trigger::upstream(vec!["lib".to_string()], BuildResult::Success));
    h.scheduler.create_project("app", app).unwrap();
    h.scheduler.start();

    // lib can never start on these executors, so it stays queued.
    let lib_handle = h.scheduler.schedule_build("lib", user("alice")).unwrap().unwrap();
    let app_handle = h.scheduler.schedule_build("app", user("alice")).unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(app_handle.state(), ItemState::Waiting);
    assert_eq!(lib_handle.state(), ItemState::Waiting);

    assert!(h.scheduler.cancel_build("lib").unwrap());
    assert_eq!(app_handle.wait().await.unwrap().number, 1);

    h.scheduler.update_config("lib", project(&["sleep 400"])).unwrap();
    let lib_handle = h.scheduler.schedule_build("lib", user("alice")).unwrap().unwrap();
    eventually(|| h.scheduler.state("lib").unwrap() == ProjectStatus::Building).await;
    let app_handle = h.scheduler.schedule_build("app", user("alice")).unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(app_handle.state(), ItemState::Waiting);

    let lib_build = lib_handle.wait().await.unwrap();
    let app_build = app_handle.wait().await.unwrap();
    assert_eq!(app_build.number, 2);
    assert!(app_build.started_at >= lib_build.finished_at.unwrap());

    h.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_builds_overlap_but_exclude_polls() {
    let h = Harness::new(2);
    let mut app = project(&["sleep 800"]);
    app.concurrent_build = true;
    h.scheduler.create_project("app", app).unwrap();
    h.scheduler.start();

    let first = h.scheduler.schedule_build("app", user("alice")).unwrap().unwrap();
    eventually(|| first.state() == ItemState::Building { number: 1 }).await;
    let second = h.scheduler.schedule_build("app", user("bob")).unwrap().unwrap();
    assert_ne!(first.id(), second.id());
    eventually(|| second.state() == ItemState::Building { number: 2 }).await;
    assert_eq!(first.state(), ItemState::Building { number: 1 });
    assert_eq!(
        h.scheduler.workspace("app").unwrap().holder,
        LeaseHolder::Build {
            numbers: BTreeSet::from([1, 2])
        }
    );

    h.remote.push();
    let poll = {
        let scheduler = h.scheduler.clone();
        tokio::spawn(async move { scheduler.poll("app", &CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!poll.is_finished());
    assert_eq!(h.remote.polls.load(Ordering::SeqCst), 0);

    first.wait().await.unwrap();
    second.wait().await.unwrap();
    assert!(poll.await.unwrap().unwrap().has_changes());
    assert_eq!(h.remote.polls.load(Ordering::SeqCst), 1);

    h.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_rename_and_move_keep_history() {
    let h = Harness::new(1);
    h.scheduler.create_folder("d").unwrap();
    h.scheduler.create_folder("other").unwrap();
    h.scheduler.create_project("d/p", project(&["ok"])).unwrap();
    h.scheduler.start();

    for _ in 0..2 {
        let handle = h.scheduler.schedule_build("d/p", user("alice")).unwrap().unwrap();
        handle.wait().await.unwrap();
    }

    assert_eq!(h.scheduler.rename("d", "e").unwrap(), name("e"));
    assert!(matches!(h.scheduler.resolve("d/p"), Err(Error::NotFound(_))));
    assert_eq!(h.scheduler.history("e/p").unwrap().len(), 2);
    assert_eq!(h.scheduler.build("e/p", 2).unwrap().number, 2);

    assert_eq!(h.scheduler.move_item("e/p", Some("other")).unwrap(), name("other/p"));
    assert_eq!(h.scheduler.history("other/p").unwrap().len(), 2);
    assert_eq!(h.scheduler.pointer("other/p", PointerKind::LastSuccessful).unwrap(), Some(2));

    h.scheduler.shutdown().await;

    let reopened = h.reopen();
    assert_eq!(reopened.history("other/p").unwrap().len(), 2);
    assert_eq!(reopened.next_build_number("other/p").unwrap(), 3);
}

#[tokio::test]
async fn test_rename_rewrites_upstream_references() {
    let h = Harness::new(0);
    h.scheduler.create_project("lib", project(&["ok"])).unwrap();
    let mut app = project(&["ok"]);
    app.triggers
        .add(Trigger::upstream(vec!["lib".to_string()], BuildResult::Success));
    h.scheduler.create_project("app", app).unwrap();

    h.scheduler.rename("lib", "core").unwrap();
    let config = h.scheduler.config("app").unwrap();
    assert_eq!(config.upstream_names(), vec!["core"]);
    assert_eq!(
        h.scheduler.downstream_projects("core", None).unwrap(),
        vec![name("app")]
    );
}

#[tokio::test]
async fn test_pointers_follow_results_and_deletion() {
    let h = Harness::new(1);
    h.scheduler.create_project("app", project(&["ok"])).unwrap();
    h.scheduler.start();

    for commands in [&["ok"][..], &["fail"][..], &["unstable"][..]] {
        h.scheduler.update_config("app", project(commands)).unwrap();
        let handle = h.scheduler.schedule_build("app", user("alice")).unwrap().unwrap();
        handle.wait().await.unwrap();
    }

    let pointers = h.scheduler.pointers("app").unwrap();
    assert_eq!(pointers.last_successful, Some(3));
    assert_eq!(pointers.last_stable, Some(1));

    assert!(h.scheduler.delete_build("app", 3).unwrap());
    assert_eq!(h.scheduler.pointer("app", PointerKind::LastSuccessful).unwrap(), Some(1));

    assert!(h.scheduler.delete_build("app", 1).unwrap());
    let pointers = h.scheduler.pointers("app").unwrap();
    assert_eq!(pointers.last_successful, None);
    assert_eq!(pointers.last_stable, None);
    assert!(
        std::fs::symlink_metadata(h.scheduler.pointer_path("app", PointerKind::LastStable).unwrap())
            .is_err()
    );

    assert!(!h.scheduler.delete_build("app", 1).unwrap());
    h.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_publisher_can_only_make_result_worse() {
    let h = Harness::new(1);
    h.scheduler.create_project("app", project(&["ok"])).unwrap();
    h.scheduler.start();

    let first = h.scheduler.schedule_build("app", user("alice")).unwrap().unwrap();
    first.wait().await.unwrap();

    let mut config = project(&["ok"]);
    config.publishers.push(PublisherConfig::ArchiveArtifacts {
        pattern: "fail".to_string(),
        allow_empty: false,
        only_if_successful: false,
    });
    h.scheduler.update_config("app", config).unwrap();

    let second = h.scheduler.schedule_build("app", user("alice")).unwrap().unwrap();
    let build = second.wait().await.unwrap();
    assert_eq!(build.result, Some(BuildResult::Failure));

    let pointers = h.scheduler.pointers("app").unwrap();
    assert_eq!(pointers.last_successful, Some(1));
    assert_eq!(pointers.last_stable, Some(1));

    h.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_legacy_trigger_list_loads() {
    let h = Harness::new(0);
    let id = h.scheduler.create_project("app", project(&["ok"])).unwrap();

    let config_file = h.dir.path().join("items").join(id.to_string()).join("config.json");
    std::fs::write(
        &config_file,
        r#"{
            "steps": [{"type": "shell", "command": "ok"}],
            "triggers": [
                {"scm": {"spec": "H/15 * * * *"}},
                {"timer": {"spec": "@daily"}},
                {"kind": "timer", "spec": "H 2 * * *"},
                {"bogus": {}}
            ]
        }"#,
    )
    .unwrap();

    let reopened = h.reopen();
    let config = reopened.config("app").unwrap();
    assert_eq!(config.triggers.len(), 2);
    assert_eq!(
        config.triggers.get(TriggerKind::Timer),
        Some(&Trigger::timer("H 2 * * *"))
    );
    assert!(config.triggers.get(TriggerKind::Scm).is_some());
}

#[tokio::test]
async fn test_timer_trigger_queues_build() {
    let h = Harness::new(0);
    let mut config = project(&["ok"]);
    config.triggers.add(Trigger::timer("* * * * *"));
    let id = h.scheduler.create_project("app", config).unwrap();
    h.scheduler.create_project("idle", project(&["ok"])).unwrap();

    let now = Utc::now();
    let fired = h.scheduler.fire_due(now - ChronoDuration::minutes(2), now);
    assert_eq!(fired, vec![(id, TriggerKind::Timer)]);

    let items = h.scheduler.queue().items();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].project, id);
    assert_eq!(items[0].causes, vec![Cause::Timer]);

    h.scheduler.set_disabled("app", true).unwrap();
    assert!(h.scheduler.fire_due(now - ChronoDuration::minutes(2), now).is_empty());
}

#[tokio::test]
async fn test_upstream_success_triggers_downstream() {
    let h = Harness::new(2);
    h.scheduler.create_project("lib", project(&["ok"])).unwrap();
    let mut app = project(&["ok"]);
    app.triggers
        .add(Trigger::upstream(vec!["lib".to_string()], BuildResult::Success));
    h.scheduler.create_project("app", app).unwrap();
    h.scheduler.start();

    let handle = h.scheduler.schedule_build("lib", user("alice")).unwrap().unwrap();
    handle.wait().await.unwrap();

    let history = h.scheduler.history("app").unwrap();
    eventually(|| history.latest().is_some_and(|b| !b.is_building())).await;
    let build = history.latest().unwrap();
    assert_eq!(
        build.causes,
        vec![Cause::Upstream {
            project: "lib".to_string(),
            number: 1
        }]
    );

    h.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_failed_upstream_does_not_trigger_downstream() {
    let h = Harness::new(1);
    h.scheduler.create_project("lib", project(&["fail"])).unwrap();
    let mut app = project(&["ok"]);
    app.triggers
        .add(Trigger::upstream(vec!["lib".to_string()], BuildResult::Unstable));
    h.scheduler.create_project("app", app).unwrap();
    h.scheduler.start();

    let handle = h.scheduler.schedule_build("lib", user("alice")).unwrap().unwrap();
    assert_eq!(handle.wait().await.unwrap().result, Some(BuildResult::Failure));
    assert!(!h.scheduler.queue().is_waiting(h.scheduler.resolve("app").unwrap().id));
    assert!(h.scheduler.history("app").unwrap().is_empty());

    h.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_relationships_are_filtered_by_read_permission() {
    let authorizer = MatrixAuthorizer::new()
        .grant("admin", &[Permission::Read])
        .grant_on("alice", name("public-app"), &[Permission::Read])
        .grant_on("alice", name("lib"), &[Permission::Read]);
    let h = Harness::with_authorizer(0, Arc::new(authorizer));

    h.scheduler.create_project("lib", project(&["ok"])).unwrap();
    h.scheduler.create_folder("secret").unwrap();
    for downstream in ["public-app", "secret/app"] {
        let mut config = project(&["ok"]);
        config
            .triggers
            .add(Trigger::upstream(vec!["lib".to_string()], BuildResult::Success));
        h.scheduler.create_project(downstream, config).unwrap();
    }

    assert_eq!(
        h.scheduler.downstream_projects("lib", Some("alice")).unwrap(),
        vec![name("public-app")]
    );
    assert_eq!(
        h.scheduler.downstream_projects("lib", Some("admin")).unwrap(),
        vec![name("public-app"), name("secret/app")]
    );
    assert!(h.scheduler.downstream_projects("lib", None).unwrap().is_empty());
    assert_eq!(
        h.scheduler.upstream_projects("secret/app", Some("alice")).unwrap(),
        vec![name("lib")]
    );
}

#[tokio::test]
async fn test_wipe_requires_permission() {
    let authorizer = MatrixAuthorizer::new()
        .grant("admin", &[Permission::Read, Permission::Wipeout])
        .grant("bob", &[Permission::Read]);
    let h = Harness::with_authorizer(0, Arc::new(authorizer));
    h.scheduler.create_project("app", project(&["ok"])).unwrap();

    let workspace = h.scheduler.workspace("app").unwrap();
    std::fs::create_dir_all(&workspace.path).unwrap();
    std::fs::write(workspace.path.join("file"), "x").unwrap();

    let cancel = CancellationToken::new();
    let denied = h.scheduler.wipe_workspace("app", Some("bob"), &cancel).await;
    assert!(matches!(denied, Err(Error::Forbidden(_))));
    assert!(h.scheduler.workspace("app").unwrap().exists);

    h.scheduler.wipe_workspace("app", Some("admin"), &cancel).await.unwrap();
    assert!(!h.scheduler.workspace("app").unwrap().exists);
}

#[tokio::test]
async fn test_unknown_item_suggests_closest_name() {
    let h = Harness::new(0);
    h.scheduler.create_project("never_created", project(&["ok"])).unwrap();

    let Err(Error::NotFound(message)) = h.scheduler.resolve("never_created1") else {
        panic!("expected a miss");
    };
    assert!(message.contains("Perhaps you meant never_created?"), "{message}");
}

#[tokio::test]
async fn test_delete_folder_removes_projects() {
    let h = Harness::new(0);
    h.scheduler.create_folder("d").unwrap();
    let id = h.scheduler.create_project("d/p", project(&["ok"])).unwrap();
    h.scheduler.schedule_build("d/p", user("alice")).unwrap().unwrap();

    assert_eq!(h.scheduler.delete_item("d/p").unwrap(), Some(name("d")));
    assert!(h.scheduler.resolve("d/p").is_err());
    assert!(!h.dir.path().join("items").join(id.to_string()).exists());
    assert!(h.scheduler.queue().items().is_empty());

    assert_eq!(h.scheduler.delete_item("d").unwrap(), None);
    assert!(h.scheduler.items(None).is_empty());
}
