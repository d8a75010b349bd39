use signoff_core::approvals::InMemoryRoleDirectory;
use signoff_core::config::EngineConfig;
use signoff_core::domain::flow::{
    ApprovalFlow, FlowId, FlowPatch, FlowStep, NewApprovalFlow, TargetType,
};
use signoff_core::domain::history::ApprovalAction;
use signoff_core::domain::target::{ApprovalStatus, DerivedStatus, TargetRef};
use signoff_core::errors::{ApplicationError, ApprovalError, ErrorKind};
use signoff_db::{
    connect_with_settings, migrations, register_draft, ApprovalEngine, DbPool, FlowStore,
};

struct World {
    pool: DbPool,
    store: FlowStore,
    engine: ApprovalEngine<InMemoryRoleDirectory>,
}

fn roles() -> InMemoryRoleDirectory {
    InMemoryRoleDirectory::from_members([
        ("sales_manager", vec!["sam", "sally"]),
        ("finance", vec!["fiona", "fred"]),
        ("director", vec!["dora", "dan", "dee"]),
        ("procurement", vec!["pat"]),
    ])
}

fn policy() -> EngineConfig {
    EngineConfig { max_conflict_retries: 8, retry_backoff_ms: 1 }
}

impl World {
    async fn in_memory() -> Self {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: DbPool) -> Self {
        migrations::run_pending(&pool).await.expect("migrations");
        Self {
            store: FlowStore::new(pool.clone()),
            engine: ApprovalEngine::new(pool.clone(), roles(), policy()),
            pool,
        }
    }

    async fn flow(&self, target_type: TargetType, steps: Vec<FlowStep>) -> ApprovalFlow {
        self.store
            .create_flow(NewApprovalFlow {
                name: "Flow under test".to_owned(),
                description: None,
                target_type,
                steps,
                created_by: "admin".to_owned(),
            })
            .await
            .expect("create flow")
    }

    async fn draft(&self, target: &TargetRef) {
        assert!(register_draft(&self.pool, target, "record").await.expect("register draft"));
    }

    async fn status(&self, target: &TargetRef) -> DerivedStatus {
        self.engine.get_projection(target).await.expect("projection").derived()
    }
}

fn standard_steps() -> Vec<FlowStep> {
    vec![FlowStep::new(1, "sales_manager", 1), FlowStep::new(2, "finance", 1)]
}

fn kind(error: &ApplicationError) -> Option<ErrorKind> {
    error.kind()
}

#[tokio::test]
async fn two_step_quotation_runs_to_approved() {
    let world = World::in_memory().await;
    let flow = world.flow(TargetType::Quotation, standard_steps()).await;
    let target = TargetRef::quotation("Q-1");
    world.draft(&target).await;

    assert_eq!(world.status(&target).await, DerivedStatus::DRAFT);

    let requested = world
        .engine
        .request_approval(&target, &flow.id, "owner", Some("please review"))
        .await
        .expect("request");
    assert_eq!(requested.to.derived(), DerivedStatus::pending(1));
    assert_eq!(requested.to.flow_version, Some(1));

    let first = world.engine.approve(&target, "sam", None).await.expect("step 1");
    assert!(first.advanced);
    assert_eq!(world.status(&target).await, DerivedStatus::pending(2));

    let second = world.engine.approve(&target, "fiona", Some("ok")).await.expect("step 2");
    assert!(second.advanced);
    assert_eq!(world.status(&target).await, DerivedStatus::APPROVED);

    let history = world.engine.get_history(&target).await.expect("history");
    let actions = history.iter().map(|entry| (entry.action, entry.step)).collect::<Vec<_>>();
    assert_eq!(
        actions,
        vec![
            (ApprovalAction::Request, 1),
            (ApprovalAction::Approve, 1),
            (ApprovalAction::Approve, 2)
        ]
    );
    assert_eq!(history[0].comment.as_deref(), Some("please review"));

    let derived = world.engine.get_current_status(&flow.id, &target).await.expect("derive");
    assert_eq!(derived, DerivedStatus::APPROVED);
    assert!(world.engine.reconcile(&target).await.expect("reconcile").consistent);
}

#[tokio::test]
async fn rejection_is_terminal_until_resubmitted() {
    let world = World::in_memory().await;
    let flow = world.flow(TargetType::Quotation, standard_steps()).await;
    let target = TargetRef::quotation("Q-1");
    world.draft(&target).await;

    world.engine.request_approval(&target, &flow.id, "owner", None).await.expect("request");
    world.engine.approve(&target, "sam", None).await.expect("step 1");
    let rejected = world.engine.reject(&target, "fiona", Some("margin too low")).await.expect("reject");
    assert_eq!(rejected.to.derived(), DerivedStatus::REJECTED);
    assert_eq!(rejected.entry.step, 2);

    let error = world.engine.approve(&target, "fiona", None).await.expect_err("rejected");
    assert_eq!(
        error,
        ApplicationError::from(ApprovalError::InvalidTransition {
            target: "quotation/Q-1".to_owned(),
            status: ApprovalStatus::Rejected,
            action: ApprovalAction::Approve,
        })
    );

    let resubmitted =
        world.engine.request_approval(&target, &flow.id, "owner", None).await.expect("again");
    assert_eq!(resubmitted.to.derived(), DerivedStatus::pending(1));

    // sam's approval from the rejected cycle does not carry over.
    let again = world.engine.approve(&target, "sam", None).await.expect("fresh cycle");
    assert_eq!(again.to.derived(), DerivedStatus::pending(2));
    assert_eq!(world.engine.get_history(&target).await.expect("history").len(), 5);
}

#[tokio::test]
async fn multi_approval_step_needs_distinct_approvers() {
    let world = World::in_memory().await;
    let flow = world
        .flow(
            TargetType::Quotation,
            vec![FlowStep::new(1, "sales_manager", 1), FlowStep::new(2, "director", 2)],
        )
        .await;
    let target = TargetRef::quotation("Q-LARGE");
    world.draft(&target).await;

    world.engine.request_approval(&target, &flow.id, "owner", None).await.expect("request");
    world.engine.approve(&target, "sally", None).await.expect("step 1");

    let partial = world.engine.approve(&target, "dora", None).await.expect("first director");
    assert!(!partial.advanced);
    assert_eq!(partial.to.derived(), DerivedStatus::pending(2));

    let duplicate = world.engine.approve(&target, "dora", None).await.expect_err("same actor");
    assert_eq!(
        duplicate,
        ApplicationError::from(ApprovalError::AlreadyActed { actor_id: "dora".to_owned(), step: 2 })
    );

    let done = world.engine.approve(&target, "dan", None).await.expect("second director");
    assert!(done.advanced);
    assert_eq!(world.status(&target).await, DerivedStatus::APPROVED);
}

#[tokio::test]
async fn actors_without_the_step_role_are_refused_and_nothing_is_recorded() {
    let world = World::in_memory().await;
    let flow = world.flow(TargetType::Quotation, standard_steps()).await;
    let target = TargetRef::quotation("Q-1");
    world.draft(&target).await;
    world.engine.request_approval(&target, &flow.id, "owner", None).await.expect("request");

    let approve = world.engine.approve(&target, "fiona", None).await.expect_err("wrong role");
    assert_eq!(kind(&approve), Some(ErrorKind::Unauthorized));
    let reject = world.engine.reject(&target, "pat", None).await.expect_err("wrong role");
    assert_eq!(kind(&reject), Some(ErrorKind::Unauthorized));

    assert_eq!(world.engine.get_history(&target).await.expect("history").len(), 1);
    assert_eq!(world.status(&target).await, DerivedStatus::pending(1));
}

#[tokio::test]
async fn explicit_step_must_match_current_step() {
    let world = World::in_memory().await;
    let flow = world.flow(TargetType::Quotation, standard_steps()).await;
    let target = TargetRef::quotation("Q-1");
    world.draft(&target).await;
    world.engine.request_approval(&target, &flow.id, "owner", None).await.expect("request");
    world.engine.approve_at_step(&target, "sam", 1, None).await.expect("step 1");

    let stale = world.engine.approve_at_step(&target, "sally", 1, None).await.expect_err("stale");
    assert_eq!(
        stale,
        ApplicationError::from(ApprovalError::StaleStep { submitted: 1, current: 2 })
    );

    let ahead = world.engine.approve_at_step(&target, "fiona", 3, None).await.expect_err("ahead");
    assert_eq!(kind(&ahead), Some(ErrorKind::StaleStep));

    world.engine.approve_at_step(&target, "fiona", 2, None).await.expect("step 2");
    assert_eq!(world.status(&target).await, DerivedStatus::APPROVED);
}

#[tokio::test]
async fn request_preconditions_are_enforced() {
    let world = World::in_memory().await;
    let quotation_flow = world.flow(TargetType::Quotation, standard_steps()).await;
    let other_quotation_flow = world.flow(TargetType::Quotation, standard_steps()).await;
    let po_flow = world
        .flow(TargetType::PurchaseOrder, vec![FlowStep::new(1, "procurement", 1)])
        .await;
    let target = TargetRef::quotation("Q-1");
    world.draft(&target).await;

    let mismatch = world
        .engine
        .request_approval(&target, &po_flow.id, "owner", None)
        .await
        .expect_err("wrong type");
    assert_eq!(kind(&mismatch), Some(ErrorKind::Validation));

    let missing_flow = world
        .engine
        .request_approval(&target, &FlowId("nope".to_owned()), "owner", None)
        .await
        .expect_err("no flow");
    assert_eq!(kind(&missing_flow), Some(ErrorKind::NotFound));

    let missing_target = world
        .engine
        .request_approval(&TargetRef::quotation("Q-404"), &quotation_flow.id, "owner", None)
        .await
        .expect_err("no target");
    assert_eq!(
        missing_target,
        ApplicationError::from(ApprovalError::TargetNotFound("quotation/Q-404".to_owned()))
    );

    world.store.deactivate_flow(&other_quotation_flow.id).await.expect("deactivate");
    let inactive = world
        .engine
        .request_approval(&target, &other_quotation_flow.id, "owner", None)
        .await
        .expect_err("inactive");
    assert_eq!(
        inactive,
        ApplicationError::from(ApprovalError::FlowInactive(other_quotation_flow.id.clone()))
    );

    world.engine.request_approval(&target, &quotation_flow.id, "owner", None).await.expect("ok");

    let twice = world
        .engine
        .request_approval(&target, &quotation_flow.id, "owner", None)
        .await
        .expect_err("already pending");
    assert_eq!(kind(&twice), Some(ErrorKind::InvalidState));

    let third_flow = world.flow(TargetType::Quotation, standard_steps()).await;
    let elsewhere = world
        .engine
        .request_approval(&target, &third_flow.id, "owner", None)
        .await
        .expect_err("pending under another flow");
    assert_eq!(
        elsewhere,
        ApplicationError::from(ApprovalError::PendingUnderFlow {
            target: "quotation/Q-1".to_owned(),
            flow_id: quotation_flow.id.clone(),
        })
    );

    world.engine.approve(&target, "sam", None).await.expect("step 1");
    world.engine.approve(&target, "fred", None).await.expect("step 2");
    let after_approval = world
        .engine
        .request_approval(&target, &quotation_flow.id, "owner", None)
        .await
        .expect_err("approved is final");
    assert_eq!(kind(&after_approval), Some(ErrorKind::InvalidState));
}

#[tokio::test]
async fn draft_targets_cannot_be_approved_or_rejected() {
    let world = World::in_memory().await;
    let target = TargetRef::purchase_order("PO-1");
    world.draft(&target).await;

    let approve = world.engine.approve(&target, "pat", None).await.expect_err("draft");
    let reject = world.engine.reject(&target, "pat", None).await.expect_err("draft");

    assert_eq!(kind(&approve), Some(ErrorKind::InvalidState));
    assert_eq!(kind(&reject), Some(ErrorKind::InvalidState));
    assert!(world.engine.get_history(&target).await.expect("history").is_empty());
}

#[tokio::test]
async fn pending_targets_stay_on_the_flow_version_they_started_with() {
    let world = World::in_memory().await;
    let flow = world.flow(TargetType::Quotation, standard_steps()).await;
    let early = TargetRef::quotation("Q-EARLY");
    let late = TargetRef::quotation("Q-LATE");
    world.draft(&early).await;
    world.draft(&late).await;

    world.engine.request_approval(&early, &flow.id, "owner", None).await.expect("request");

    let edited = world
        .store
        .update_flow(
            &flow.id,
            FlowPatch {
                steps: Some(vec![FlowStep::new(1, "director", 1)]),
                ..FlowPatch::default()
            },
        )
        .await
        .expect("edit steps");
    assert_eq!(edited.version, 2);

    // Early target still follows v1: sales manager, then finance.
    let refused = world.engine.approve(&early, "dora", None).await.expect_err("v1 step 1 role");
    assert_eq!(kind(&refused), Some(ErrorKind::Unauthorized));
    world.engine.approve(&early, "sam", None).await.expect("v1 step 1");
    assert_eq!(world.status(&early).await, DerivedStatus::pending(2));
    world.engine.approve(&early, "fiona", None).await.expect("v1 step 2");
    assert_eq!(world.status(&early).await, DerivedStatus::APPROVED);

    let requested = world.engine.request_approval(&late, &flow.id, "owner", None).await.expect("v2");
    assert_eq!(requested.to.flow_version, Some(2));
    world.engine.approve(&late, "dora", None).await.expect("v2 single step");
    assert_eq!(world.status(&late).await, DerivedStatus::APPROVED);

    let history = world.engine.get_history(&early).await.expect("history");
    assert!(history.iter().all(|entry| entry.flow_version == 1));
}

#[tokio::test]
async fn status_per_flow_is_derived_from_that_flows_entries() {
    let world = World::in_memory().await;
    let first = world.flow(TargetType::Quotation, standard_steps()).await;
    let second = world.flow(TargetType::Quotation, vec![FlowStep::new(1, "finance", 1)]).await;
    let target = TargetRef::quotation("Q-1");
    world.draft(&target).await;

    world.engine.request_approval(&target, &first.id, "owner", None).await.expect("first");
    world.engine.reject(&target, "sam", None).await.expect("reject");
    world.engine.request_approval(&target, &second.id, "owner", None).await.expect("second");

    assert_eq!(
        world.engine.get_current_status(&first.id, &target).await.expect("first"),
        DerivedStatus::REJECTED
    );
    assert_eq!(
        world.engine.get_current_status(&second.id, &target).await.expect("second"),
        DerivedStatus::pending(1)
    );

    let unused = world.flow(TargetType::Quotation, standard_steps()).await;
    assert_eq!(
        world.engine.get_current_status(&unused.id, &target).await.expect("unused"),
        DerivedStatus::DRAFT
    );
}

#[tokio::test]
async fn reconcile_reports_projection_drift() {
    let world = World::in_memory().await;
    let flow = world.flow(TargetType::Quotation, standard_steps()).await;
    let target = TargetRef::quotation("Q-1");
    world.draft(&target).await;
    world.engine.request_approval(&target, &flow.id, "owner", None).await.expect("request");

    sqlx::query(
        "UPDATE quotation SET approval_status = 'approved', current_approval_step = NULL \
         WHERE id = 'Q-1'",
    )
    .execute(&world.pool)
    .await
    .expect("tamper");

    let report = world.engine.reconcile(&target).await.expect("reconcile");
    assert!(!report.consistent);
    assert_eq!(report.cached, DerivedStatus::APPROVED);
    assert_eq!(report.recomputed, DerivedStatus::pending(1));
    assert_eq!(report.flow_id, Some(flow.id.clone()));

    sqlx::query(
        "UPDATE quotation SET approval_status = 'pending', current_approval_step = 2 \
         WHERE id = 'Q-1'",
    )
    .execute(&world.pool)
    .await
    .expect("tamper step");

    let drift = world.engine.approve(&target, "fiona", None).await.expect_err("drift");
    assert_eq!(
        drift,
        ApplicationError::from(ApprovalError::ProjectionDrift { target: "quotation/Q-1".to_owned() })
    );
}

#[tokio::test]
async fn unknown_targets_are_not_found_for_queries() {
    let world = World::in_memory().await;
    let target = TargetRef::purchase_order("PO-404");

    let history = world.engine.get_history(&target).await.expect_err("missing");
    let reconcile = world.engine.reconcile(&target).await.expect_err("missing");

    assert_eq!(kind(&history), Some(ErrorKind::NotFound));
    assert_eq!(kind(&reconcile), Some(ErrorKind::NotFound));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_approvals_on_a_multi_approval_step_both_count() {
    let dir = tempfile::tempdir().expect("temp dir");
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("approvals.db").display());
    let pool = connect_with_settings(&url, 4, 30).await.expect("connect");
    let world = World::with_pool(pool).await;

    let flow = world.flow(TargetType::Quotation, vec![FlowStep::new(1, "director", 2)]).await;
    let target = TargetRef::quotation("Q-RACE");
    world.draft(&target).await;
    world.engine.request_approval(&target, &flow.id, "owner", None).await.expect("request");

    let (dora, dan) = tokio::join!(
        world.engine.approve(&target, "dora", None),
        world.engine.approve(&target, "dan", None),
    );
    dora.expect("dora approves");
    dan.expect("dan approves");

    let projection = world.engine.get_projection(&target).await.expect("projection");
    assert_eq!(projection.derived(), DerivedStatus::APPROVED);
    assert_eq!(projection.revision, 3);

    let approvals = world
        .engine
        .get_history(&target)
        .await
        .expect("history")
        .into_iter()
        .filter(|entry| entry.action == ApprovalAction::Approve)
        .count();
    assert_eq!(approvals, 2);
    assert!(world.engine.reconcile(&target).await.expect("reconcile").consistent);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_single_approvals_keep_ledger_and_projection_in_step() {
    let dir = tempfile::tempdir().expect("temp dir");
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("approvals.db").display());
    let pool = connect_with_settings(&url, 4, 30).await.expect("connect");
    let world = World::with_pool(pool).await;

    let flow = world
        .flow(
            TargetType::Quotation,
            vec![FlowStep::new(1, "director", 1), FlowStep::new(2, "director", 1)],
        )
        .await;
    let target = TargetRef::quotation("Q-RACE");
    world.draft(&target).await;
    world.engine.request_approval(&target, &flow.id, "owner", None).await.expect("request");

    let (dora, dee) = tokio::join!(
        world.engine.approve(&target, "dora", None),
        world.engine.approve(&target, "dee", None),
    );
    dora.expect("dora approves");
    dee.expect("dee approves");

    let history = world.engine.get_history(&target).await.expect("history");
    assert_eq!(history.len(), 3);

    let report = world.engine.reconcile(&target).await.expect("reconcile");
    assert!(report.consistent, "{report:?}");
    assert_eq!(
        world.engine.get_current_status(&flow.id, &target).await.expect("derive"),
        report.cached
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn approval_losing_to_the_final_approval_is_still_recorded() {
    let dir = tempfile::tempdir().expect("temp dir");
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("approvals.db").display());
    let pool = connect_with_settings(&url, 4, 30).await.expect("connect");
    let world = World::with_pool(pool).await;

    let flow = world.flow(TargetType::Quotation, vec![FlowStep::new(1, "director", 1)]).await;
    let target = TargetRef::quotation("Q-LAST");
    world.draft(&target).await;
    world.engine.request_approval(&target, &flow.id, "owner", None).await.expect("request");

    // Both approvals read the pending projection before either can write.
    let mut lock = world.pool.begin().await.expect("begin");
    sqlx::query("UPDATE quotation SET title = title WHERE id = 'Q-LAST'")
        .execute(&mut *lock)
        .await
        .expect("take write lock");

    let (dora, dan, released) = tokio::join!(
        world.engine.approve(&target, "dora", None),
        world.engine.approve(&target, "dan", None),
        async {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            lock.rollback().await
        },
    );
    released.expect("release write lock");
    let dora = dora.expect("dora approves");
    let dan = dan.expect("dan approves");
    assert_eq!(usize::from(dora.advanced) + usize::from(dan.advanced), 1);

    let history = world.engine.get_history(&target).await.expect("history");
    let approvals = history
        .iter()
        .filter(|entry| entry.action == ApprovalAction::Approve && entry.step == 1)
        .map(|entry| entry.actor_id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(approvals.len(), 2);
    assert!(approvals.contains(&"dora") && approvals.contains(&"dan"));

    assert_eq!(world.status(&target).await, DerivedStatus::APPROVED);
    assert!(world.engine.reconcile(&target).await.expect("reconcile").consistent);
}

#[tokio::test]
async fn returned_entries_match_the_stored_ledger() {
    let world = World::in_memory().await;
    let flow = world.flow(TargetType::Quotation, standard_steps()).await;
    let target = TargetRef::quotation("Q-ECHO");
    world.draft(&target).await;

    let requested =
        world.engine.request_approval(&target, &flow.id, "owner", None).await.expect("request");
    let approved = world.engine.approve(&target, "sam", Some("fine")).await.expect("approve");

    let history = world.engine.get_history(&target).await.expect("history");
    assert_eq!(history, vec![requested.entry, approved.entry]);
    assert_eq!(world.store.get_flow(&flow.id).await.expect("flow"), flow);
}
