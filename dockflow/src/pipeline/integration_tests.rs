//! End-to-end docking jobs over a scripted runner.

use super::*;
use crate::cancellation::CancellationToken;
use crate::core::{ArtifactKind, Job, JobId, JobState, StageKind};
use crate::docking::{stages, DockingPipeline, DockingRequest};
use crate::errors::DockflowError;
use crate::events::{event_types, CollectingEventSink, EventSink};
use crate::report::ReportSpec;
use crate::runner::ExitOutcome;
use crate::testing::fixtures::{dock_script, DockingFixture, STRUCTURE};
use crate::testing::{
    assert_artifacts_present, assert_failed_stage, assert_job_failed_with, assert_job_state,
    assert_job_succeeded, ScriptedRunner, StageScript,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

async fn run_with(
    pipeline: &DockingPipeline,
    request: &DockingRequest,
    runner: &Arc<ScriptedRunner>,
    events: Arc<dyn EventSink>,
    cancel: &CancellationToken,
) -> JobOutcome {
    let coordinator = pipeline.coordinator_with_events(Arc::clone(runner) as _, events);
    let plan = pipeline.plan(request).unwrap();
    coordinator.run(plan, cancel).await
}

async fn run(fixture: &DockingFixture, runner: &Arc<ScriptedRunner>) -> JobOutcome {
    run_with(
        &fixture.pipeline(),
        &fixture.request(),
        runner,
        Arc::new(CollectingEventSink::new()),
        &CancellationToken::new(),
    )
    .await
}

#[tokio::test(start_paused = true)]
async fn test_scenario_produces_all_artifacts_and_report() {
    let fixture = DockingFixture::new().unwrap();
    let runner = Arc::new(fixture.succeeding_runner());

    let outcome = run(&fixture, &runner).await;

    assert_job_succeeded(&outcome);
    assert_artifacts_present(&outcome);
    let layout = fixture.layout();
    assert_eq!(outcome.report.as_deref(), Some(layout.report.as_path()));

    let html = std::fs::read_to_string(&layout.report).unwrap();
    for href in [
        "Y265H/ranked_0.pdb",
        "Y265H.pdbqt",
        "1.pdbqt",
        "Y265H_1.pdbqt",
        "Y265H_1.txt",
    ] {
        assert!(html.contains(&format!("href=\"{href}\"")), "missing {href}");
    }

    let receptor = std::fs::read_to_string(&layout.receptor_pdbqt).unwrap();
    assert_eq!(receptor, STRUCTURE.strip_suffix("END\n").unwrap());

    assert_eq!(runner.launch_count(), 3);
    let predict = runner.launch_of(stages::PREDICT).unwrap();
    assert!(predict.request.is_container());
    assert!(predict.request.args.contains(&"--output_dir=/mnt/output".to_string()));
    assert!(!runner.launch_of(stages::DOCK).unwrap().request.is_container());
}

#[tokio::test(start_paused = true)]
async fn test_dock_starts_after_structure_is_stable() {
    let fixture = DockingFixture::new().unwrap();
    let runner = Arc::new(fixture.succeeding_runner());

    let outcome = run(&fixture, &runner).await;
    assert_job_succeeded(&outcome);

    // The structure appears 3 s after launch and needs a second identical poll.
    let predict_at = runner.launch_of(stages::PREDICT).unwrap().at;
    let dock_at = runner.launch_of(stages::DOCK).unwrap().at;
    assert!(dock_at.duration_since(predict_at) >= Duration::from_millis(3500));
}

#[tokio::test(start_paused = true)]
async fn test_existing_structure_skips_predictor() {
    let fixture = DockingFixture::new().unwrap();
    let layout = fixture.layout();
    std::fs::create_dir_all(layout.structure.parent().unwrap()).unwrap();
    std::fs::write(&layout.structure, STRUCTURE).unwrap();
    let runner = Arc::new(fixture.succeeding_runner());
    let events = Arc::new(CollectingEventSink::new());

    let outcome = run_with(
        &fixture.pipeline(),
        &fixture.request(),
        &runner,
        Arc::clone(&events) as _,
        &CancellationToken::new(),
    )
    .await;

    assert_job_succeeded(&outcome);
    assert!(!runner.was_launched(stages::PREDICT));
    assert!(events.position(event_types::STAGE_SKIPPED, stages::PREDICT).is_some());

    // A rerun over a complete output directory launches nothing.
    let launches = runner.launch_count();
    let rerun = run(&fixture, &runner).await;
    assert_job_succeeded(&rerun);
    assert_eq!(runner.launch_count(), launches);
}

#[tokio::test(start_paused = true)]
async fn test_structure_timeout_respects_bound() {
    let fixture = DockingFixture::new().unwrap();
    let mut config = fixture.config();
    config.predictor.max_wait_seconds = 10.0;
    let runner = Arc::new(
        fixture
            .succeeding_runner()
            .with_script(stages::PREDICT, StageScript::new().log("stuck")),
    );
    let started = Instant::now();

    let outcome = run_with(
        &DockingPipeline::new(config),
        &fixture.request(),
        &runner,
        Arc::new(CollectingEventSink::new()),
        &CancellationToken::new(),
    )
    .await;

    assert_job_state(&outcome, JobState::TimedOut);
    assert_job_failed_with(&outcome, "StageTimeout");
    assert_failed_stage(&outcome, StageKind::Predict);
    match outcome.result.as_ref().unwrap_err() {
        DockflowError::StageTimeout { polls, waited, .. } => {
            assert!((19..=21).contains(polls), "polls = {polls}");
            assert!(*waited <= Duration::from_secs(10));
        }
        other => panic!("unexpected error {other}"),
    }
    assert!(started.elapsed() < Duration::from_secs(20));
    assert!(runner.terminated().contains(&stages::PREDICT.to_string()));
    assert!(!runner.was_launched(stages::DOCK));
    assert!(!fixture.layout().report.exists());
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_terminates_running_stage() {
    let fixture = DockingFixture::new().unwrap();
    let runner = Arc::new(
        fixture
            .succeeding_runner()
            .with_script(stages::PREDICT, StageScript::new().log("predicting")),
    );
    let cancel = CancellationToken::new();
    let pipeline = fixture.pipeline();
    let request = fixture.request();

    let (outcome, ()) = tokio::join!(
        run_with(
            &pipeline,
            &request,
            &runner,
            Arc::new(CollectingEventSink::new()),
            &cancel
        ),
        async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            cancel.cancel("operator abort");
        }
    );

    assert_job_state(&outcome, JobState::Failed);
    assert!(outcome.job.visited(JobState::Predicting));
    match outcome.result.as_ref().unwrap_err() {
        DockflowError::Cancelled(reason) => assert_eq!(reason, "operator abort"),
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(runner.terminated(), vec![stages::PREDICT.to_string()]);
    assert!(!runner.was_launched(stages::DOCK));
}

#[tokio::test(start_paused = true)]
async fn test_missing_receptor_fails_before_launch() {
    let fixture = DockingFixture::new().unwrap();
    std::fs::remove_file(&fixture.receptor).unwrap();
    let runner = Arc::new(fixture.succeeding_runner());

    let outcome = run(&fixture, &runner).await;

    assert_job_failed_with(&outcome, "SourceNotFound");
    assert_job_state(&outcome, JobState::Failed);
    assert_eq!(runner.launch_count(), 0);
    assert!(!outcome.job.transitions().iter().any(|t| t.state.is_running()));
    assert!(!fixture.output_dir.exists());
}

#[tokio::test(start_paused = true)]
async fn test_docking_failure_keeps_earlier_artifacts() {
    let fixture = DockingFixture::new().unwrap();
    let layout = fixture.layout();
    let runner = Arc::new(
        fixture
            .succeeding_runner()
            .with_script(stages::DOCK, dock_script(&layout, 1)),
    );

    let outcome = run(&fixture, &runner).await;

    assert_job_state(&outcome, JobState::Failed);
    assert_job_failed_with(&outcome, "StageProcessFailure");
    assert_failed_stage(&outcome, StageKind::Dock);
    let failure = outcome.job.failure().unwrap();
    assert_eq!(failure.exit, Some(ExitOutcome::Failure { code: Some(1) }));
    assert!(failure.log_tail.contains(&"Docking".to_string()));

    assert!(!layout.report.exists());
    for kept in [&layout.structure, &layout.receptor_pdbqt, &layout.ligand_pdbqt] {
        assert!(kept.exists(), "{} was removed", kept.display());
    }

    let persisted = std::fs::read(fixture.output_dir.join(STATE_DIR).join(JOB_FILE)).unwrap();
    let job: Job = serde_json::from_slice(&persisted).unwrap();
    assert_eq!(job.state(), JobState::Failed);
    assert_eq!(job.failure().unwrap().stage.as_deref(), Some(stages::DOCK));
}

#[tokio::test(start_paused = true)]
async fn test_launch_failure_stops_concurrent_stage() {
    let fixture = DockingFixture::new().unwrap();
    let runner = Arc::new(fixture.succeeding_runner().failing_launch(stages::CONVERT));

    let outcome = run(&fixture, &runner).await;

    assert_job_failed_with(&outcome, "StageLaunchFailure");
    assert_failed_stage(&outcome, StageKind::Convert);
    assert!(!runner.was_launched(stages::DOCK));
}

#[tokio::test(start_paused = true)]
async fn test_output_dir_inside_data_dir_rejected() {
    let fixture = DockingFixture::new().unwrap();
    let runner = Arc::new(fixture.succeeding_runner());
    let request = DockingRequest::new(
        &fixture.receptor,
        &fixture.ligand,
        "mol2",
        fixture.data_dir.join("job1"),
    );

    let outcome = run_with(
        &fixture.pipeline(),
        &request,
        &runner,
        Arc::new(CollectingEventSink::new()),
        &CancellationToken::new(),
    )
    .await;

    assert_job_failed_with(&outcome, "UnsafePathNesting");
    assert_eq!(runner.launch_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_sequential_policy_runs_one_stage_at_a_time() {
    let fixture = DockingFixture::new().unwrap();
    let mut config = fixture.config();
    config.runtime.policy = ExecutionPolicy::Sequential;
    let runner = Arc::new(fixture.succeeding_runner());

    let outcome = run_with(
        &DockingPipeline::new(config),
        &fixture.request(),
        &runner,
        Arc::new(CollectingEventSink::new()),
        &CancellationToken::new(),
    )
    .await;

    assert_job_succeeded(&outcome);
    assert_eq!(
        runner.launched_stages(),
        vec![stages::PREDICT, stages::CONVERT, stages::DOCK]
    );
    let predict_at = runner.launch_of(stages::PREDICT).unwrap().at;
    let convert_at = runner.launch_of(stages::CONVERT).unwrap().at;
    assert!(convert_at.duration_since(predict_at) >= Duration::from_millis(3500));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_policy_overlaps_independent_stages() {
    let fixture = DockingFixture::new().unwrap();
    let runner = Arc::new(fixture.succeeding_runner());

    let outcome = run(&fixture, &runner).await;

    assert_job_succeeded(&outcome);
    let predict_at = runner.launch_of(stages::PREDICT).unwrap().at;
    let convert_at = runner.launch_of(stages::CONVERT).unwrap().at;
    let gap = if convert_at > predict_at {
        convert_at - predict_at
    } else {
        predict_at - convert_at
    };
    assert!(gap < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_lifecycle_events_and_persisted_state() {
    let fixture = DockingFixture::new().unwrap();
    let runner = Arc::new(fixture.succeeding_runner());
    let events = Arc::new(CollectingEventSink::new());

    let outcome = run_with(
        &fixture.pipeline(),
        &fixture.request(),
        &runner,
        Arc::clone(&events) as _,
        &CancellationToken::new(),
    )
    .await;
    assert_job_succeeded(&outcome);

    let types = events.event_types();
    assert_eq!(types.iter().filter(|t| *t == event_types::STAGE_STARTED).count(), 4);
    assert_eq!(types.iter().filter(|t| *t == event_types::STAGE_COMPLETED).count(), 4);
    assert_eq!(types.iter().filter(|t| *t == event_types::REPORT_WRITTEN).count(), 1);

    let predict_done = events.position(event_types::STAGE_COMPLETED, stages::PREDICT).unwrap();
    let prepare_started = events.position(event_types::STAGE_STARTED, stages::PREPARE).unwrap();
    let dock_started = events.position(event_types::STAGE_STARTED, stages::DOCK).unwrap();
    assert!(predict_done < prepare_started);
    assert!(prepare_started < dock_started);

    let last_state = events
        .events_of_type(event_types::JOB_STATE_CHANGED)
        .pop()
        .unwrap();
    assert_eq!(last_state.data["to"], "succeeded");

    let persisted = std::fs::read(fixture.output_dir.join(STATE_DIR).join(JOB_FILE)).unwrap();
    let job: Job = serde_json::from_slice(&persisted).unwrap();
    assert_eq!(job.state(), JobState::Succeeded);
    assert!(job.visited(JobState::Reporting));
}

/// A predictor that writes its structure and then keeps running.
fn lingering_predict_script(fixture: &DockingFixture) -> StageScript {
    StageScript::new()
        .log("Predicting structure")
        .sleep(Duration::from_secs(3))
        .write(&fixture.layout().structure, STRUCTURE)
        .log("Relaxing remaining models")
}

#[tokio::test(start_paused = true)]
async fn test_detached_predictor_terminated_after_shutdown_grace() {
    let fixture = DockingFixture::new().unwrap();
    let runner = Arc::new(
        fixture
            .succeeding_runner()
            .with_script(stages::PREDICT, lingering_predict_script(&fixture)),
    );
    let report = fixture.layout().report;
    let cancel = CancellationToken::new();
    let pipeline = fixture.pipeline();
    let request = fixture.request();

    let (outcome, reported_at) = tokio::join!(
        run_with(
            &pipeline,
            &request,
            &runner,
            Arc::new(CollectingEventSink::new()),
            &cancel
        ),
        async {
            while !report.exists() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Instant::now()
        }
    );

    assert_job_succeeded(&outcome);
    assert_artifacts_present(&outcome);
    // Dock ran while the predictor was still up; it only ends with the grace.
    assert!(runner.was_launched(stages::DOCK));
    assert_eq!(runner.terminated(), vec![stages::PREDICT.to_string()]);
    assert!(reported_at.elapsed() >= Duration::from_secs(4));
}

#[tokio::test(start_paused = true)]
async fn test_abort_during_shutdown_grace_terminates_detached_predictor() {
    let fixture = DockingFixture::new().unwrap();
    let mut config = fixture.config();
    config.runtime.shutdown_grace_seconds = 600.0;
    let runner = Arc::new(
        fixture
            .succeeding_runner()
            .with_script(stages::PREDICT, lingering_predict_script(&fixture)),
    );
    let report = fixture.layout().report;
    let cancel = CancellationToken::new();
    let pipeline = DockingPipeline::new(config);
    let request = fixture.request();

    let (outcome, aborted_at) = tokio::join!(
        run_with(
            &pipeline,
            &request,
            &runner,
            Arc::new(CollectingEventSink::new()),
            &cancel
        ),
        async {
            while !report.exists() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            cancel.cancel("operator abort");
            Instant::now()
        }
    );

    // The report was already complete, so the job keeps its result.
    assert_job_succeeded(&outcome);
    assert_eq!(runner.terminated(), vec![stages::PREDICT.to_string()]);
    assert!(
        aborted_at.elapsed() < Duration::from_secs(1),
        "returned {:?} after abort",
        aborted_at.elapsed()
    );
}

#[tokio::test(start_paused = true)]
async fn test_exit_without_artifact_times_out_after_exit_grace() {
    let fixture = DockingFixture::new().unwrap();
    let runner = Arc::new(fixture.succeeding_runner().with_script(
        stages::CONVERT,
        StageScript::new().sleep(Duration::from_secs(1)).exit(0),
    ));
    let started = Instant::now();

    let outcome = run(&fixture, &runner).await;

    assert_job_state(&outcome, JobState::TimedOut);
    assert_job_failed_with(&outcome, "StageTimeout");
    assert_failed_stage(&outcome, StageKind::Convert);
    match outcome.result.as_ref().unwrap_err() {
        DockflowError::StageTimeout { waited, .. } => {
            // Converter max wait is 60 s; the 5 s exit grace bounds the wait.
            assert!(*waited <= Duration::from_secs(6), "waited {waited:?}");
        }
        other => panic!("unexpected error {other}"),
    }
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!runner.was_launched(stages::DOCK));
}

#[tokio::test(start_paused = true)]
async fn test_incomplete_manifest_rejected_before_launch() {
    let fixture = DockingFixture::new().unwrap();
    let ligand_pdbqt = fixture.layout().ligand_pdbqt;
    let convert = StageSpec::new(
        stages::CONVERT,
        StageKind::Convert,
        StageAction::External(CommandSpec::new("obabel")),
    )
    .with_output(ArtifactKind::LigandPdbqt, &ligand_pdbqt);
    let pipeline = PipelineBuilder::new("convert-only").stage(convert).unwrap();
    let plan = JobPlan::new(
        JobId::new("convert-only"),
        &fixture.output_dir,
        pipeline,
        ReportSpec::new(fixture.layout().report),
    );
    let runner = Arc::new(ScriptedRunner::new().with_script(
        stages::CONVERT,
        StageScript::new().write(&ligand_pdbqt, "REMARK\n").exit(0),
    ));

    let outcome = Coordinator::new(Arc::clone(&runner) as _)
        .run(plan, &CancellationToken::new())
        .await;

    assert_job_failed_with(&outcome, "ManifestIncomplete");
    match outcome.result.as_ref().unwrap_err() {
        DockflowError::ManifestIncomplete { missing } => {
            assert!(missing.contains(&ArtifactKind::Structure));
            assert!(!missing.contains(&ArtifactKind::LigandPdbqt));
        }
        other => panic!("unexpected error {other}"),
    }
    assert_job_state(&outcome, JobState::Failed);
    assert_eq!(runner.launch_count(), 0);
    assert!(!outcome.job.visited(JobState::Converting));
}
