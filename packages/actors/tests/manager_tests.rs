#![allow(clippy::disallowed_methods)]

mod common;

use std::collections::HashSet;
use std::time::Duration;

use actors::{ManagerError, job_dir};
use common::{GateEngine, TestResult, Verdict, setup, wait_until_path_gone};
use optimiser_core::{JobEvent, JobId, JobState, OptimiseOptions};
use tokio::sync::broadcast::error::TryRecvError;

#[tokio::test]
async fn five_jobs_on_two_workers_promote_one_at_a_time() -> TestResult {
    let h = setup(GateEngine::manual(), |c| c.with_concurrency(2)).await?;

    let mut ids = Vec::new();
    for i in 0..5 {
        let path = h.file(&format!("shot-{i}.png"), 64);
        ids.push(h.manager.submit_file(path, OptimiseOptions::default()).await?);
    }

    h.engine.wait_started_count(2).await;
    let snapshot = h.manager.snapshot().await?;
    assert_eq!(snapshot.running, 2);
    assert_eq!(snapshot.queued, 3);
    let started: HashSet<JobId> = h.engine.started().into_iter().collect();
    assert_eq!(started, HashSet::from([ids[0], ids[1]]));

    h.engine.release(ids[0], Verdict::Succeed);
    h.wait_for_state(ids[0], JobState::Succeeded).await;

    let snapshot = h.manager.snapshot().await?;
    assert_eq!(snapshot.running, 2);
    assert_eq!(snapshot.queued, 2);
    h.engine.wait_started_count(3).await;
    assert_eq!(h.engine.started()[2], ids[2]);

    for id in &ids[1..] {
        h.engine.wait_started(*id).await;
        h.engine.release(*id, Verdict::Succeed);
    }
    h.wait_all_terminal().await;
    Ok(())
}

#[tokio::test]
async fn every_job_terminates_and_running_never_exceeds_the_cap() -> TestResult {
    let h = setup(GateEngine::auto(), |c| c.with_concurrency(2)).await?;
    let mut events = h.manager.subscribe();

    let mut ids = Vec::new();
    for i in 0..8 {
        let path = h.file(&format!("clip-{i}.gif"), 32 + i);
        ids.push(h.manager.submit_file(path, OptimiseOptions::default()).await?);
    }
    h.wait_all_terminal().await;

    let mut running = 0usize;
    let mut peak = 0usize;
    while let Ok(event) = events.try_recv() {
        if let JobEvent::JobStateChanged {
            old_state,
            new_state,
            ..
        } = event
        {
            if new_state == JobState::Running {
                running += 1;
            }
            if old_state == JobState::Running {
                running -= 1;
            }
            peak = peak.max(running);
        }
    }
    assert!(peak <= 2, "peak running was {peak}");
    assert_eq!(running, 0);

    let terminal = h.terminal();
    assert_eq!(terminal.len(), ids.len());
    for id in &ids {
        let hits: Vec<_> = terminal.iter().filter(|r| r.id == *id).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].state, JobState::Succeeded);
    }
    Ok(())
}

#[tokio::test]
async fn cancelling_a_queued_job_never_runs_it() -> TestResult {
    let h = setup(GateEngine::manual(), |c| c.with_concurrency(1)).await?;

    let first = h.manager.submit_file(h.file("a.png", 40), OptimiseOptions::default()).await?;
    let second = h.manager.submit_file(h.file("b.png", 40), OptimiseOptions::default()).await?;
    h.engine.wait_started(first).await;

    h.manager.cancel(second).await?;
    let record = h.manager.get(second).await?.expect("record kept");
    assert_eq!(record.state, JobState::Cancelled);
    assert!(record.error.is_none());
    assert!(!record.has_started());

    h.engine.release(first, Verdict::Succeed);
    h.wait_for_state(first, JobState::Succeeded).await;
    assert!(!h.engine.started().contains(&second));

    // Cancelling a terminal job is a no-op.
    h.manager.cancel(second).await?;
    h.manager.cancel(first).await?;
    assert_eq!(
        h.manager.get(first).await?.map(|r| r.state),
        Some(JobState::Succeeded)
    );
    Ok(())
}

#[tokio::test]
async fn cancelling_a_running_job_waits_for_the_worker() -> TestResult {
    let h = setup(GateEngine::manual(), |c| c.with_concurrency(1)).await?;

    let id = h.manager.submit_file(h.file("movie.mp4", 128), OptimiseOptions::default()).await?;
    h.engine.wait_started(id).await;

    h.manager.cancel(id).await?;
    let record = h.wait_for_state(id, JobState::Cancelled).await;
    assert!(record.error.is_none());
    assert!(record.result.is_none());
    assert!(record.is_original);
    assert!(!job_dir(h.workdir.path(), id).join("movie.mp4").exists());
    Ok(())
}

#[tokio::test]
async fn late_report_after_forced_cancel_is_ignored() -> TestResult {
    let h = setup(GateEngine::ignoring_cancel(), |c| {
        c.with_concurrency(1).with_cancel_grace_ms(100)
    })
    .await?;

    let stuck = h.manager.submit_file(h.file("stuck.png", 80), OptimiseOptions::default()).await?;
    let next = h.manager.submit_file(h.file("next.png", 80), OptimiseOptions::default()).await?;
    h.engine.wait_started(stuck).await;

    h.manager.cancel(stuck).await?;
    h.wait_for_state(stuck, JobState::Cancelled).await;
    // The worker is still busy, so nothing else starts.
    assert_eq!(
        h.manager.get(next).await?.map(|r| r.state),
        Some(JobState::Queued)
    );

    h.engine.release(stuck, Verdict::Succeed);
    h.engine.wait_started(next).await;

    let record = h.manager.get(stuck).await?.expect("record kept");
    assert_eq!(record.state, JobState::Cancelled);
    assert!(record.result.is_none());
    wait_until_path_gone(&job_dir(h.workdir.path(), stuck).join("stuck.png")).await;

    h.engine.release(next, Verdict::Succeed);
    h.wait_for_state(next, JobState::Succeeded).await;
    assert_eq!(h.terminal().iter().filter(|r| r.id == stuck).count(), 1);
    Ok(())
}

#[tokio::test]
async fn running_jobs_cannot_be_removed_and_queued_ones_are_discarded() -> TestResult {
    let h = setup(GateEngine::manual(), |c| c.with_concurrency(1)).await?;

    let running = h.manager.submit_file(h.file("a.jpg", 40), OptimiseOptions::default()).await?;
    let queued = h.manager.submit_file(h.file("b.jpg", 40), OptimiseOptions::default()).await?;
    h.engine.wait_started(running).await;

    assert_eq!(
        h.manager.remove(running).await,
        Err(ManagerError::JobNotRemovable(running))
    );

    h.manager.remove(queued).await?;
    assert!(h.manager.get(queued).await?.is_none());
    let snapshot = h.manager.snapshot().await?;
    assert_eq!(snapshot.undo_depth, 0);
    assert!(!snapshot.can_restore());
    assert!(h.terminal().iter().any(|r| r.id == queued && r.state == JobState::Cancelled));

    assert!(matches!(
        h.manager.remove(JobId::new()).await,
        Err(ManagerError::JobNotFound(_))
    ));

    h.engine.release(running, Verdict::Succeed);
    h.wait_for_state(running, JobState::Succeeded).await;
    Ok(())
}

#[tokio::test]
async fn restore_last_returns_removals_in_reverse_order() -> TestResult {
    let h = setup(GateEngine::auto(), |c| c).await?;

    let mut ids = Vec::new();
    for name in ["a.png", "b.png", "c.png"] {
        ids.push(h.manager.submit_file(h.file(name, 50), OptimiseOptions::default()).await?);
    }
    h.wait_all_terminal().await;

    for id in &ids {
        h.manager.remove(*id).await?;
    }
    assert!(h.manager.list().await?.is_empty());
    assert_eq!(h.manager.snapshot().await?.undo_depth, 3);

    for expected in ids.iter().rev() {
        let restored = h.manager.restore_last().await?.expect("something to restore");
        assert_eq!(restored.id, *expected);
    }
    assert!(h.manager.restore_last().await?.is_none());

    // Restored records are back at their original positions.
    let listed: Vec<JobId> = h.manager.list().await?.iter().map(|r| r.id).collect();
    assert_eq!(listed, vec![ids[2], ids[1], ids[0]]);
    Ok(())
}

#[tokio::test]
async fn restore_last_puts_a_record_between_its_neighbours() -> TestResult {
    let h = setup(GateEngine::auto(), |c| c).await?;

    let mut ids = Vec::new();
    for name in ["a.webp", "b.webp", "c.webp"] {
        ids.push(h.manager.submit_file(h.file(name, 50), OptimiseOptions::default()).await?);
    }
    h.wait_all_terminal().await;

    h.manager.remove(ids[1]).await?;
    h.manager.restore_last().await?;
    let listed: Vec<JobId> = h.manager.list().await?.iter().map(|r| r.id).collect();
    assert_eq!(listed, vec![ids[2], ids[1], ids[0]]);
    Ok(())
}

#[tokio::test]
async fn undo_overflow_drops_the_oldest_backup() -> TestResult {
    let h = setup(GateEngine::auto(), |c| c.with_undo_capacity(1)).await?;

    let first = h.manager.submit_file(h.file("one.png", 30), OptimiseOptions::default()).await?;
    let second = h.manager.submit_file(h.file("two.png", 30), OptimiseOptions::default()).await?;
    h.wait_all_terminal().await;
    assert!(h.backups.exists(first).await?);

    h.manager.remove(first).await?;
    h.manager.remove(second).await?;

    assert!(!h.backups.exists(first).await?);
    assert!(h.backups.exists(second).await?);
    assert!(!job_dir(h.workdir.path(), first).exists());

    assert_eq!(h.manager.restore_last().await?.map(|r| r.id), Some(second));
    assert!(h.manager.restore_last().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn restore_original_works_once() -> TestResult {
    let h = setup(GateEngine::auto(), |c| c).await?;

    let source = h.file("photo.jpg", 100);
    let original = std::fs::read(&source)?;
    let id = h.manager.submit_file(&source, OptimiseOptions::default()).await?;

    let record = h.wait_for_state(id, JobState::Succeeded).await;
    let output = record.result.expect("succeeded jobs carry a result");
    assert!(!record.is_original);
    assert_eq!(output.size, 50);
    assert_eq!(output.original_size, 100);

    h.manager.restore_original(id).await?;
    assert_eq!(std::fs::read(&output.path)?, original);
    let restored = h.manager.get(id).await?.expect("record kept");
    assert!(restored.is_original);
    assert_eq!(restored.state, JobState::Succeeded);
    assert_eq!(restored.result.as_ref().map(|r| r.size), Some(100));

    assert_eq!(
        h.manager.restore_original(id).await,
        Err(ManagerError::NothingToRestore(id))
    );
    assert_eq!(h.manager.get(id).await?, Some(restored));
    Ok(())
}

#[tokio::test]
async fn restore_original_needs_an_optimised_payload() -> TestResult {
    let h = setup(GateEngine::manual(), |c| c).await?;

    let id = h.manager.submit_file(h.file("x.png", 20), OptimiseOptions::default()).await?;
    h.engine.wait_started(id).await;
    h.engine.release(id, Verdict::Fail("oxipng exited with status 1: not a PNG".into()));
    h.wait_for_state(id, JobState::Failed).await;

    assert_eq!(
        h.manager.restore_original(id).await,
        Err(ManagerError::NothingToRestore(id))
    );
    Ok(())
}

#[tokio::test]
async fn invalid_sources_create_no_record() -> TestResult {
    let h = setup(GateEngine::auto(), |c| c).await?;
    let mut events = h.manager.subscribe();

    let missing = h.files.path().join("missing.png");
    let empty = h.file("empty.png", 0);
    let folder = h.files.path().join("folder");
    std::fs::create_dir(&folder)?;
    let fine = h.file("fine.png", 10);

    let attempts = [
        h.manager.submit_file(&missing, OptimiseOptions::default()).await,
        h.manager.submit_file(&empty, OptimiseOptions::default()).await,
        h.manager.submit_file(&folder, OptimiseOptions::default()).await,
        h.manager
            .submit_clipboard(Vec::<u8>::new(), "png", OptimiseOptions::default())
            .await,
        h.manager
            .submit_file(&fine, OptimiseOptions::default().with_downscale(1.5))
            .await,
    ];
    for attempt in attempts {
        assert!(
            matches!(attempt, Err(ManagerError::InvalidSource(_))),
            "{attempt:?}"
        );
    }

    assert!(h.manager.list().await?.is_empty());
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    Ok(())
}

#[tokio::test]
async fn failures_carry_the_engine_message() -> TestResult {
    let h = setup(GateEngine::manual(), |c| c).await?;

    let id = h.manager.submit_file(h.file("broken.gif", 20), OptimiseOptions::aggressive()).await?;
    h.engine.wait_started(id).await;
    h.engine.release(id, Verdict::Fail("gifsicle exited with status 1".into()));

    let record = h.wait_for_state(id, JobState::Failed).await;
    let error = record.error.expect("failed jobs carry an error");
    assert!(error.contains("gifsicle exited with status 1"), "{error}");
    assert!(record.result.is_none());

    let terminal = h.terminal();
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].state, JobState::Failed);

    // Failed jobs that ran go onto the undo stack.
    h.manager.remove(id).await?;
    assert_eq!(h.manager.snapshot().await?.undo_depth, 1);
    Ok(())
}

#[tokio::test]
async fn paused_manager_keeps_jobs_queued() -> TestResult {
    let h = setup(GateEngine::manual(), |c| c).await?;
    let mut events = h.manager.subscribe();

    h.manager.pause()?;
    let id = h.manager.submit_file(h.file("later.png", 20), OptimiseOptions::default()).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let snapshot = h.manager.snapshot().await?;
    assert!(snapshot.paused);
    assert_eq!(snapshot.queued, 1);
    assert!(h.engine.started().is_empty());
    assert!(matches!(
        events.try_recv(),
        Ok(JobEvent::ManagerStateChanged { paused: true, .. })
    ));

    h.manager.resume()?;
    h.engine.wait_started(id).await;
    h.engine.release(id, Verdict::Succeed);
    h.wait_for_state(id, JobState::Succeeded).await;
    assert!(!h.manager.snapshot().await?.paused);
    Ok(())
}

#[tokio::test]
async fn succeeded_jobs_are_removed_after_the_display_timeout() -> TestResult {
    let h = setup(GateEngine::auto(), |c| c.with_auto_remove_after(1)).await?;

    let id = h.manager.submit_file(h.file("brief.png", 20), OptimiseOptions::default()).await?;
    h.wait_for_state(id, JobState::Succeeded).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while h.manager.get(id).await?.is_some() {
        assert!(tokio::time::Instant::now() < deadline, "job was never auto-removed");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(h.manager.snapshot().await?.undo_depth, 1);
    assert_eq!(h.manager.restore_last().await?.map(|r| r.id), Some(id));
    Ok(())
}

#[tokio::test]
async fn clean_workdir_keeps_live_jobs() -> TestResult {
    let h = setup(GateEngine::auto(), |c| c).await?;

    let id = h.manager.submit_file(h.file("keep.png", 20), OptimiseOptions::default()).await?;
    h.wait_for_state(id, JobState::Succeeded).await;

    let orphan = job_dir(h.workdir.path(), JobId::new());
    std::fs::create_dir_all(&orphan)?;
    std::fs::write(orphan.join("leftover.png"), b"stale")?;
    let junk = h.workdir.path().join(actors::JOBS_DIR).join("junk.tmp");
    std::fs::write(&junk, b"junk")?;

    assert_eq!(h.manager.clean_workdir().await?, 2);
    assert!(!orphan.exists());
    assert!(!junk.exists());
    assert!(job_dir(h.workdir.path(), id).exists());
    Ok(())
}

#[tokio::test]
async fn events_follow_the_job_lifecycle() -> TestResult {
    let h = setup(GateEngine::auto(), |c| c).await?;
    let mut events = h.manager.subscribe();

    let id = h.manager.submit_file(h.file("ev.png", 20), OptimiseOptions::default()).await?;
    h.wait_for_state(id, JobState::Succeeded).await;
    h.manager.remove(id).await?;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.job_id().unwrap_or(id), id);
        seen.push(event);
    }

    assert!(matches!(seen[0], JobEvent::JobSubmitted { .. }));
    let states: Vec<JobState> = seen.iter().filter_map(|e| e.new_state()).collect();
    assert_eq!(states, vec![JobState::Running, JobState::Succeeded]);
    assert!(seen.iter().any(|e| matches!(e, JobEvent::JobRemoved { undoable: true, .. })));
    assert!(seen.iter().any(|e| matches!(e, JobEvent::UndoStackChanged { depth: 1, .. })));

    let json = serde_json::to_value(&seen[1])?;
    assert_eq!(json["event"], "job_state_changed");
    assert_eq!(json["new_state"], "running");
    Ok(())
}

#[tokio::test]
async fn clipboard_payloads_are_staged_and_backed_up() -> TestResult {
    let h = setup(GateEngine::auto(), |c| c).await?;

    let payload = b"clipboard-image-bytes".to_vec();
    let id = h
        .manager
        .submit_clipboard(payload.clone(), ".PNG", OptimiseOptions::default())
        .await?;
    let record = h.wait_for_state(id, JobState::Succeeded).await;

    let output = record.result.expect("result");
    let name = output.path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    assert_eq!(name, format!("clipboard-{id}.png"));
    assert_eq!(output.original_size, payload.len() as u64);
    assert_eq!(h.backups.original(id).await?.as_ref(), payload.as_slice());
    Ok(())
}

#[tokio::test]
async fn crashed_worker_fails_its_job_and_is_replaced() -> TestResult {
    let h = setup(GateEngine::panicking_once(), |c| c.with_concurrency(1)).await?;

    let crashed = h.manager.submit_file(h.file("a.png", 40), OptimiseOptions::default()).await?;
    let next = h.manager.submit_file(h.file("b.png", 40), OptimiseOptions::default()).await?;

    let record = h.wait_for_state(crashed, JobState::Failed).await;
    let error = record.error.unwrap_or_default();
    assert!(error.contains("stopped unexpectedly"), "{error}");

    h.wait_for_state(next, JobState::Succeeded).await;
    let later = h.manager.submit_file(h.file("c.png", 40), OptimiseOptions::default()).await?;
    h.wait_for_state(later, JobState::Succeeded).await;

    let snapshot = h.manager.snapshot().await?;
    assert!(snapshot.is_idle());
    let terminal: Vec<JobId> = h.terminal().iter().map(|r| r.id).collect();
    assert_eq!(terminal, vec![crashed, next, later]);
    Ok(())
}

#[tokio::test]
async fn shutdown_makes_the_manager_unavailable() -> TestResult {
    let h = setup(GateEngine::manual(), |c| c).await?;

    let id = h.manager.submit_file(h.file("slow.mov", 20), OptimiseOptions::default()).await?;
    h.engine.wait_started(id).await;

    h.manager.shutdown().await?;
    let result = h
        .manager
        .submit_file(h.file("after.mov", 20), OptimiseOptions::default())
        .await;
    assert!(matches!(result, Err(ManagerError::Unavailable(_))), "{result:?}");
    Ok(())
}
