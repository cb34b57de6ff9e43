mod common;

use common::TempDb;
use eda_catalog::CatalogError;
use eda_catalog::config::NamePolicy;
use eda_catalog::db::{ChildKind, NewChild, NewProject, ProjectPatch, ProjectRef};
use std::time::{Duration, Instant};

#[tokio::test]
async fn distinct_names_succeed_and_duplicates_fail() {
    let db = TempDb::new(NamePolicy::Trimmed);
    let ops = db.ops().await;

    for name in ["alpha", "beta", "gamma"] {
        ops.create_project(NewProject::named(name))
            .await
            .expect("distinct name should be accepted");
    }

    let err = ops
        .create_project(NewProject::named("beta"))
        .await
        .expect_err("duplicate name should be rejected");
    assert!(matches!(err, CatalogError::DuplicateName(ref n) if n == "beta"));
    assert_eq!(ops.list_projects().await.unwrap().len(), 3);
}

#[tokio::test]
async fn blank_names_are_rejected_by_default() {
    let db = TempDb::new(NamePolicy::Trimmed);
    let ops = db.ops().await;

    for name in ["", "   "] {
        let err = ops.create_project(NewProject::named(name)).await.unwrap_err();
        assert!(matches!(err, CatalogError::EmptyName), "{name:?}: {err}");
    }
    assert!(ops.list_projects().await.unwrap().is_empty());
}

#[tokio::test]
async fn literal_policy_only_rejects_the_empty_string() {
    let db = TempDb::new(NamePolicy::Literal);
    let ops = db.ops().await;

    let err = ops.create_project(NewProject::named("")).await.unwrap_err();
    assert!(matches!(err, CatalogError::EmptyName));

    let spaced = ops.create_project(NewProject::named("   ")).await.unwrap();
    assert_eq!(spaced.name, "   ");
}

#[tokio::test]
async fn project_fields_round_trip_with_server_timestamps() {
    let db = TempDb::new(NamePolicy::Trimmed);
    let ops = db.ops().await;

    let created = ops
        .create_project(NewProject {
            name: "deploy".to_string(),
            url: Some("https://git.example.com/deploy.git".to_string()),
            git_hash: Some("4b825dc6".to_string()),
            description: Some("deployment rules".to_string()),
            large_data_id: Some(16_384),
        })
        .await
        .unwrap();

    assert_eq!(created.created_at, created.modified_at);
    let fetched = ops.get_project(created.id).await.unwrap();
    assert_eq!(fetched, created);

    let by_name = ops.find_project_by_name("deploy").await.unwrap();
    assert_eq!(by_name.map(|p| p.id), Some(created.id));
    assert!(ops.find_project_by_name("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn deleting_a_project_removes_its_inventories() {
    let db = TempDb::new(NamePolicy::Trimmed);
    let ops = db.ops().await;

    let alpha = ops.create_project(NewProject::named("alpha")).await.unwrap();
    assert_eq!(alpha.id, 1);

    let inv = ops
        .attach_child(
            NewChild::new(ChildKind::Inventory, ProjectRef::Present(alpha.id)).name("inv1"),
        )
        .await
        .unwrap();
    assert_eq!(inv.id, 1);
    assert_eq!(inv.project, ProjectRef::Present(1));

    let cascaded = ops.delete_project(alpha.id).await.unwrap();
    assert_eq!(cascaded, 1);

    let err = ops.get_child(ChildKind::Inventory, inv.id).await.unwrap_err();
    assert!(matches!(err, CatalogError::NotFound { table: "inventory", id: 1 }));
    assert!(matches!(
        ops.get_project(alpha.id).await.unwrap_err(),
        CatalogError::NotFound { table: "project", .. }
    ));
}

#[tokio::test]
async fn cascade_covers_every_child_kind_and_spares_others() {
    let db = TempDb::new(NamePolicy::Trimmed);
    let ops = db.ops().await;

    let doomed = ops.create_project(NewProject::named("doomed")).await.unwrap();
    let kept = ops.create_project(NewProject::named("kept")).await.unwrap();

    for kind in ChildKind::ALL {
        for project in [
            ProjectRef::Present(doomed.id),
            ProjectRef::Present(doomed.id),
            ProjectRef::Present(kept.id),
            ProjectRef::Absent,
        ] {
            ops.attach_child(NewChild::new(kind, project).body("---\n"))
                .await
                .unwrap();
        }
    }

    assert_eq!(ops.delete_project(doomed.id).await.unwrap(), 6);

    for kind in ChildKind::ALL {
        let owned = ops
            .list_children(kind, ProjectRef::Present(doomed.id))
            .await
            .unwrap();
        assert!(owned.is_empty(), "{kind:?} rows survived the cascade");

        let other = ops
            .list_children(kind, ProjectRef::Present(kept.id))
            .await
            .unwrap();
        assert_eq!(other.len(), 1);

        let orphans = ops.list_children(kind, ProjectRef::Absent).await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].body.as_deref(), Some("---\n"));
    }
}

#[tokio::test]
async fn unknown_project_reference_is_a_foreign_key_violation() {
    let db = TempDb::new(NamePolicy::Trimmed);
    let ops = db.ops().await;

    let err = ops
        .attach_child(NewChild::new(ChildKind::Inventory, ProjectRef::Present(9999)).name("inv"))
        .await
        .unwrap_err();
    match err {
        CatalogError::ForeignKeyViolation { table, project_id } => {
            assert_eq!(table, "inventory");
            assert_eq!(project_id, 9999);
        }
        other => panic!("expected foreign key violation, got {other}"),
    }
    assert!(
        ops.list_children(ChildKind::Inventory, ProjectRef::Absent)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn updates_bump_modified_at_and_keep_created_at() {
    let db = TempDb::new(NamePolicy::Trimmed);
    let ops = db.ops().await;

    let original = ops.create_project(NewProject::named("rules")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    let renamed = ops
        .update_project(
            original.id,
            ProjectPatch {
                name: Some("rules-v2".to_string()),
                description: Some(Some("second pass".to_string())),
                ..ProjectPatch::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(renamed.name, "rules-v2");
    assert_eq!(renamed.description.as_deref(), Some("second pass"));
    assert_eq!(renamed.created_at, original.created_at);
    assert!(renamed.modified_at > original.modified_at);

    tokio::time::sleep(Duration::from_millis(5)).await;
    let touched = ops
        .update_project(original.id, ProjectPatch::default())
        .await
        .unwrap();
    assert_eq!(touched.created_at, original.created_at);
    assert!(touched.modified_at >= renamed.modified_at);

    let cleared = ops
        .update_project(
            original.id,
            ProjectPatch {
                description: Some(None),
                ..ProjectPatch::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(cleared.description, None);
    assert!(cleared.modified_at >= cleared.created_at);
}

#[tokio::test]
async fn created_at_cannot_be_rewritten() {
    let db = TempDb::new(NamePolicy::Trimmed);
    let ops = db.ops().await;

    let project = ops.create_project(NewProject::named("frozen")).await.unwrap();
    let result =
        sqlx::query("UPDATE project SET created_at = '2000-01-01T00:00:00.000Z' WHERE id = ?")
            .bind(project.id)
            .execute(ops.storage().pool())
            .await;
    assert!(result.is_err());

    let after = ops.get_project(project.id).await.unwrap();
    assert_eq!(after.created_at, project.created_at);
}

#[tokio::test]
async fn client_supplied_modified_at_is_overwritten() {
    let db = TempDb::new(NamePolicy::Trimmed);
    let ops = db.ops().await;

    let project = ops.create_project(NewProject::named("clock")).await.unwrap();
    sqlx::query("UPDATE project SET modified_at = '1999-01-01T00:00:00.000Z' WHERE id = ?")
        .bind(project.id)
        .execute(ops.storage().pool())
        .await
        .unwrap();

    let after = ops.get_project(project.id).await.unwrap();
    assert!(after.modified_at >= project.modified_at);
}

#[tokio::test]
async fn updates_enforce_name_constraints() {
    let db = TempDb::new(NamePolicy::Trimmed);
    let ops = db.ops().await;

    ops.create_project(NewProject::named("taken")).await.unwrap();
    let other = ops.create_project(NewProject::named("other")).await.unwrap();

    let dup = ops
        .update_project(
            other.id,
            ProjectPatch {
                name: Some("taken".to_string()),
                ..ProjectPatch::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(dup, CatalogError::DuplicateName(ref n) if n == "taken"));

    let blank = ops
        .update_project(
            other.id,
            ProjectPatch {
                name: Some(" ".to_string()),
                ..ProjectPatch::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(blank, CatalogError::EmptyName));

    let missing = ops
        .update_project(404, ProjectPatch::default())
        .await
        .unwrap_err();
    assert!(matches!(missing, CatalogError::NotFound { table: "project", id: 404 }));
}

#[tokio::test]
async fn large_data_reference_can_be_set_and_cleared() {
    let db = TempDb::new(NamePolicy::Trimmed);
    let ops = db.ops().await;

    let project = ops.create_project(NewProject::named("blobs")).await.unwrap();
    assert_eq!(project.large_data_id, None);

    let stored = ops.set_large_data(project.id, Some(24_601)).await.unwrap();
    assert_eq!(stored.large_data_id, Some(24_601));

    let cleared = ops.set_large_data(project.id, None).await.unwrap();
    assert_eq!(cleared.large_data_id, None);

    assert!(matches!(
        ops.set_large_data(777, Some(1)).await.unwrap_err(),
        CatalogError::NotFound { .. }
    ));
}

#[tokio::test]
async fn children_can_be_deleted_individually() {
    let db = TempDb::new(NamePolicy::Trimmed);
    let ops = db.ops().await;

    let playbook = ops
        .attach_child(
            NewChild::new(ChildKind::Playbook, ProjectRef::Absent)
                .name("site.yml")
                .body("- hosts: all"),
        )
        .await
        .unwrap();
    let fetched = ops.get_child(ChildKind::Playbook, playbook.id).await.unwrap();
    assert_eq!(fetched, playbook);

    ops.delete_child(ChildKind::Playbook, playbook.id).await.unwrap();
    assert!(matches!(
        ops.delete_child(ChildKind::Playbook, playbook.id).await.unwrap_err(),
        CatalogError::NotFound { table: "playbook", .. }
    ));
}

#[tokio::test]
async fn missing_project_delete_is_not_found() {
    let db = TempDb::new(NamePolicy::Trimmed);
    let ops = db.ops().await;

    assert!(matches!(
        ops.delete_project(42).await.unwrap_err(),
        CatalogError::NotFound { table: "project", id: 42 }
    ));
}

#[tokio::test]
async fn lock_contention_is_retried_until_the_writer_releases() {
    let mut db = TempDb::new(NamePolicy::Trimmed);
    db.cfg.busy_timeout_ms = 50;
    db.cfg.retry_attempts = 5;
    let ops = db.ops().await;

    let holder_pool = db.pool().await;
    let mut holder = holder_pool.acquire().await.unwrap();
    sqlx::query("BEGIN IMMEDIATE")
        .execute(&mut *holder)
        .await
        .unwrap();
    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        sqlx::query("ROLLBACK").execute(&mut *holder).await.unwrap();
    });

    let started = Instant::now();
    let project = ops
        .create_project(NewProject::named("contended"))
        .await
        .expect("write should succeed once the lock is released");
    assert!(started.elapsed() >= Duration::from_millis(100));
    release.await.unwrap();

    assert_eq!(ops.get_project(project.id).await.unwrap().name, "contended");
}

#[tokio::test]
async fn contention_outlasting_the_retry_budget_surfaces_busy() {
    let mut db = TempDb::new(NamePolicy::Trimmed);
    db.cfg.busy_timeout_ms = 50;
    db.cfg.retry_attempts = 1;
    let ops = db.ops().await;

    let holder_pool = db.pool().await;
    let mut holder = holder_pool.acquire().await.unwrap();
    sqlx::query("BEGIN IMMEDIATE")
        .execute(&mut *holder)
        .await
        .unwrap();

    let started = Instant::now();
    let err = ops
        .create_project(NewProject::named("blocked"))
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogError::Busy(_)), "{err}");
    // A single attempt: no backoff delay was taken.
    assert!(started.elapsed() < Duration::from_millis(150));

    sqlx::query("ROLLBACK").execute(&mut *holder).await.unwrap();
    assert!(ops.list_projects().await.unwrap().is_empty());
}

#[tokio::test]
async fn structural_errors_are_returned_without_retrying() {
    let mut db = TempDb::new(NamePolicy::Trimmed);
    db.cfg.retry_attempts = 5;
    let ops = db.ops().await;
    ops.create_project(NewProject::named("once")).await.unwrap();

    let started = Instant::now();
    let err = ops
        .create_project(NewProject::named("once"))
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogError::DuplicateName(_)));
    // The shortest backoff is 100ms; a retry would have waited at least that.
    assert!(started.elapsed() < Duration::from_millis(100));
}
