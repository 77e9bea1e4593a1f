use std::sync::Arc;
use std::time::Duration;

use cycle::listener::CountingListener;
use cycle::scheduler::{Scheduler, SchedulerConfig, TickReport};
use cycle::store::{
    InstanceId, JobId, JobState, JobStore, OutcomeKind, OutcomeRecord,
    StoreError,
};
use jiff::SignedDuration;
use jiff::civil::date;
use test_helpers::{Behavior, RecordingJob, TestCluster, ts, weekly_job};

const JOB: &str = "auction-settlement";
const FIRST_FIRE: &str = "2024-03-04T01:00:00Z";
const SECOND_FIRE: &str = "2024-03-11T01:00:00Z";

async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// A bootstrapped single-job scheduler on a fresh cluster.
async fn single_node(
    behavior: Behavior,
) -> (TestCluster, Scheduler, RecordingJob) {
    let cluster = TestCluster::new();
    let job = RecordingJob::new(behavior);
    let scheduler = cluster
        .scheduler("node-a")
        .job(weekly_job(JOB), job.clone())
        .build();
    scheduler.bootstrap().await.unwrap();
    (cluster, scheduler, job)
}

#[tokio::test]
async fn fires_once_when_due() -> anyhow::Result<()> {
    let (cluster, scheduler, job) = single_node(Behavior::Succeed).await;
    assert_eq!(cluster.job(JOB).await.next_fire_at, ts(FIRST_FIRE));

    // not due yet
    assert_eq!(scheduler.tick().await?, TickReport::default());
    assert_eq!(job.run_count(), 0);

    cluster.set_time("2024-03-04T01:00:00Z");
    let report = scheduler.tick().await?;
    assert_eq!(report.claimed, 1);
    assert_eq!(report.completed, 1);
    assert_eq!(job.run_count(), 1);

    let ctx = &job.runs()[0];
    assert_eq!(ctx.scheduled_fire_at, ts(FIRST_FIRE));
    assert_eq!(ctx.instance_id, *scheduler.instance_id());
    assert!(!ctx.recovering);
    assert_eq!(ctx.period.start, date(2024, 2, 26).at(1, 0, 0, 0));
    assert_eq!(ctx.period.end, date(2024, 3, 3).at(23, 59, 59, 0));

    let stored = cluster.job(JOB).await;
    assert_eq!(stored.state, JobState::Waiting);
    assert_eq!(stored.next_fire_at, ts(SECOND_FIRE));
    assert_eq!(stored.cluster_lock_owner, None);
    assert_eq!(stored.fire_count, 1);
    assert_eq!(stored.last_outcome, Some(OutcomeKind::Completed));

    // the same occurrence never fires twice
    assert_eq!(scheduler.tick().await?, TickReport::default());
    assert_eq!(job.run_count(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_one_instance_fires_an_occurrence() -> anyhow::Result<()> {
    let cluster = TestCluster::new();
    let job = RecordingJob::new(Behavior::Sleep(Duration::from_millis(20)));
    let listener = Arc::new(CountingListener::new());

    let mut schedulers = Vec::new();
    for i in 0..5 {
        let scheduler = cluster
            .scheduler(&format!("node-{i}"))
            .job(weekly_job(JOB), job.clone())
            .listener(listener.clone())
            .build();
        scheduler.bootstrap().await?;
        schedulers.push(scheduler);
    }

    cluster.set_time("2024-03-04T01:00:10Z");
    let ticks: Vec<_> = schedulers
        .iter()
        .cloned()
        .map(|scheduler| tokio::spawn(async move { scheduler.tick().await }))
        .collect();
    let mut claimed = 0;
    for tick in ticks {
        claimed += tick.await??.claimed;
    }

    assert_eq!(claimed, 1);
    assert_eq!(job.run_count(), 1);
    assert_eq!(listener.started(), 1);
    assert_eq!(listener.completed(), 1);
    let stored = cluster.job(JOB).await;
    assert_eq!(stored.fire_count, 1);
    assert_eq!(stored.next_fire_at, ts(SECOND_FIRE));
    Ok(())
}

#[tokio::test]
async fn misfire_skips_the_body() -> anyhow::Result<()> {
    let cluster = TestCluster::new();
    let job = RecordingJob::new(Behavior::Succeed);
    let listener = Arc::new(CountingListener::new());
    let scheduler = cluster
        .scheduler("node-a")
        .job(weekly_job(JOB), job.clone())
        .listener(listener.clone())
        .build();
    scheduler.bootstrap().await?;

    // two minutes late against a one minute threshold
    cluster.set_time("2024-03-04T01:02:00Z");
    let report = scheduler.tick().await?;
    assert_eq!(report.misfired, 1);
    assert_eq!(report.fired, 0);
    assert_eq!(job.run_count(), 0);
    assert_eq!(listener.misfired(), 1);
    assert_eq!(listener.started(), 0);

    let stored = cluster.job(JOB).await;
    assert_eq!(stored.state, JobState::Waiting);
    assert_eq!(stored.next_fire_at, ts(SECOND_FIRE));
    assert_eq!(stored.misfire_count, 1);
    assert_eq!(stored.fire_count, 0);
    assert_eq!(stored.last_outcome, Some(OutcomeKind::Misfired));
    Ok(())
}

#[tokio::test]
async fn late_within_threshold_still_fires() -> anyhow::Result<()> {
    let (cluster, scheduler, job) = single_node(Behavior::Succeed).await;

    cluster.set_time("2024-03-04T01:01:00Z");
    let report = scheduler.tick().await?;
    assert_eq!(report.completed, 1);
    assert_eq!(job.run_count(), 1);
    assert_eq!(job.runs()[0].scheduled_fire_at, ts(FIRST_FIRE));
    assert_eq!(job.runs()[0].fired_at, ts("2024-03-04T01:01:00Z"));
    Ok(())
}

#[tokio::test]
async fn misfire_after_downtime_moves_past_now() -> anyhow::Result<()> {
    let (cluster, scheduler, job) = single_node(Behavior::Succeed).await;

    // the cluster was down for more than two weeks
    cluster.set_time("2024-03-20T12:00:00Z");
    let report = scheduler.tick().await?;
    assert_eq!(report.misfired, 1);
    assert_eq!(job.run_count(), 0);

    let stored = cluster.job(JOB).await;
    assert_eq!(stored.next_fire_at, ts("2024-03-25T01:00:00Z"));
    assert!(stored.next_fire_at > cluster.now());
    Ok(())
}

#[tokio::test]
async fn failing_job_is_recorded_and_rescheduled() -> anyhow::Result<()> {
    let cluster = TestCluster::new();
    let job = RecordingJob::new(Behavior::Fail);
    let listener = Arc::new(CountingListener::new());
    let scheduler = cluster
        .scheduler("node-a")
        .job(weekly_job(JOB), job.clone())
        .listener(listener.clone())
        .build();
    scheduler.bootstrap().await?;

    cluster.set_time(FIRST_FIRE);
    let report = scheduler.tick().await?;
    assert_eq!(report.fired, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(listener.failed(), 1);

    let stored = cluster.job(JOB).await;
    assert_eq!(stored.state, JobState::Waiting);
    assert_eq!(stored.next_fire_at, ts(SECOND_FIRE));
    assert_eq!(stored.failure_count, 1);
    assert_eq!(stored.last_outcome, Some(OutcomeKind::Failed));
    assert!(
        stored
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("settlement rejected"))
    );
    Ok(())
}

#[tokio::test]
async fn panicking_job_is_recorded_and_rescheduled() -> anyhow::Result<()> {
    let (cluster, scheduler, job) = single_node(Behavior::Panic).await;

    cluster.set_time(FIRST_FIRE);
    let report = scheduler.tick().await?;
    assert_eq!(report.failed, 1);
    assert_eq!(job.run_count(), 1);

    let stored = cluster.job(JOB).await;
    assert_eq!(stored.state, JobState::Waiting);
    assert_eq!(stored.next_fire_at, ts(SECOND_FIRE));
    assert!(
        stored
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("settlement exploded"))
    );

    // the scheduler keeps working after the panic
    cluster.set_time(SECOND_FIRE);
    assert_eq!(scheduler.tick().await?.failed, 1);
    assert_eq!(job.run_count(), 2);
    Ok(())
}

#[tokio::test]
async fn crashed_owner_is_recovered_after_its_lease() -> anyhow::Result<()> {
    let cluster = TestCluster::new();
    let job = RecordingJob::new(Behavior::Succeed);
    let definition =
        weekly_job(JOB).with_misfire_threshold(Duration::from_secs(600));
    let survivor = cluster
        .scheduler("survivor")
        .job(definition, job.clone())
        .build();
    survivor.bootstrap().await?;

    // another instance claims the occurrence, starts firing and dies
    let id = JobId::from(JOB);
    let crashed = InstanceId("crashed".into());
    cluster.set_time(FIRST_FIRE);
    let lease_until = ts("2024-03-04T01:00:30Z");
    cluster
        .store
        .claim(&id, ts(FIRST_FIRE), &crashed, cluster.now(), lease_until)
        .await?
        .unwrap();
    cluster
        .store
        .begin_firing(&id, &crashed, cluster.now())
        .await?
        .unwrap();

    // still leased
    cluster.set_time("2024-03-04T01:00:10Z");
    assert_eq!(survivor.tick().await?, TickReport::default());
    assert_eq!(job.run_count(), 0);

    cluster.set_time("2024-03-04T01:00:31Z");
    let report = survivor.tick().await?;
    assert_eq!(report.claimed, 1);
    assert_eq!(report.completed, 1);

    let runs = job.runs();
    assert_eq!(runs.len(), 1);
    assert!(runs[0].recovering);
    assert_eq!(runs[0].scheduled_fire_at, ts(FIRST_FIRE));

    let stored = cluster.job(JOB).await;
    assert_eq!(stored.fire_count, 2);
    assert_eq!(stored.next_fire_at, ts(SECOND_FIRE));
    assert_eq!(stored.cluster_lock_owner, None);
    Ok(())
}

#[tokio::test]
async fn recorded_outcome_is_only_rescheduled() -> anyhow::Result<()> {
    let (cluster, scheduler, job) = single_node(Behavior::Succeed).await;

    // the crashed instance finished the body but never rescheduled
    let id = JobId::from(JOB);
    let crashed = InstanceId("crashed".into());
    cluster.set_time(FIRST_FIRE);
    let lease_until = ts("2024-03-04T01:00:30Z");
    cluster
        .store
        .claim(&id, ts(FIRST_FIRE), &crashed, cluster.now(), lease_until)
        .await?
        .unwrap();
    cluster
        .store
        .begin_firing(&id, &crashed, cluster.now())
        .await?
        .unwrap();
    cluster
        .store
        .mark_complete(&id, &crashed, &OutcomeRecord::completed(), cluster.now())
        .await?
        .unwrap();

    cluster.set_time("2024-03-04T01:00:45Z");
    let report = scheduler.tick().await?;
    assert_eq!(report.claimed, 1);
    assert_eq!(report.recovered, 1);
    assert_eq!(report.fired, 0);
    assert_eq!(job.run_count(), 0);

    let stored = cluster.job(JOB).await;
    assert_eq!(stored.state, JobState::Waiting);
    assert_eq!(stored.next_fire_at, ts(SECOND_FIRE));
    assert_eq!(stored.fire_count, 1);
    Ok(())
}

#[tokio::test]
async fn next_fire_time_strictly_increases() -> anyhow::Result<()> {
    let (cluster, scheduler, job) = single_node(Behavior::Succeed).await;

    let mut previous = cluster.job(JOB).await.next_fire_at;
    for _ in 0..4 {
        cluster.time_source.set(previous);
        scheduler.tick().await?;
        let next = cluster.job(JOB).await.next_fire_at;
        assert!(next > previous);
        assert_eq!(next.duration_since(previous), SignedDuration::from_hours(168));
        previous = next;
    }
    assert_eq!(job.run_count(), 4);
    assert_eq!(cluster.job(JOB).await.fire_count, 4);
    Ok(())
}

#[tokio::test]
async fn unavailable_store_fails_the_tick() -> anyhow::Result<()> {
    let (cluster, scheduler, job) = single_node(Behavior::Succeed).await;

    cluster.set_time(FIRST_FIRE);
    cluster.store.set_available(false);
    assert!(matches!(
        scheduler.tick().await,
        Err(StoreError::Unavailable(_))
    ));
    assert_eq!(job.run_count(), 0);

    cluster.store.set_available(true);
    assert_eq!(scheduler.tick().await?.completed, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn poll_loop_survives_store_outage() -> anyhow::Result<()> {
    let (cluster, scheduler, job) = single_node(Behavior::Succeed).await;
    assert_eq!(cluster.store.list_instances().await?.len(), 1);

    cluster.set_time("2024-03-04T01:00:05Z");
    cluster.store.set_available(false);

    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let runner = scheduler.clone();
    let handle = tokio::spawn(async move {
        runner
            .run_until(async {
                let _ = stopped.await;
            })
            .await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(job.run_count(), 0);

    cluster.store.set_available(true);
    wait_until(|| job.run_count() == 1).await;

    let _ = stop.send(());
    handle.await?;

    assert_eq!(job.run_count(), 1);
    assert_eq!(cluster.job(JOB).await.next_fire_at, ts(SECOND_FIRE));
    // deregistered on shutdown
    assert!(cluster.store.list_instances().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn instances_check_in() -> anyhow::Result<()> {
    let (cluster, scheduler, _job) = single_node(Behavior::Succeed).await;

    let instances = cluster.store.list_instances().await?;
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].instance_id, *scheduler.instance_id());
    assert_eq!(instances[0].instance_name, "node-a");
    assert!(instances[0].is_live(cluster.now(), Duration::from_secs(20)));

    // a tick inside the check-in interval does not touch the row
    cluster.set_time("2024-03-04T00:00:10Z");
    scheduler.tick().await?;
    let instances = cluster.store.list_instances().await?;
    assert_eq!(instances[0].last_checkin_at, ts("2024-03-04T00:00:00Z"));

    cluster.set_time("2024-03-04T00:00:20Z");
    scheduler.tick().await?;
    let instances = cluster.store.list_instances().await?;
    assert_eq!(instances[0].last_checkin_at, ts("2024-03-04T00:00:20Z"));
    Ok(())
}

#[tokio::test]
async fn restart_keeps_runtime_state() -> anyhow::Result<()> {
    let (cluster, scheduler, job) = single_node(Behavior::Succeed).await;
    cluster.set_time(FIRST_FIRE);
    scheduler.tick().await?;

    // a new process registers the same job again later in the week
    cluster.set_time("2024-03-06T12:00:00Z");
    let restarted = cluster
        .scheduler("node-a")
        .job(weekly_job(JOB), job.clone())
        .build();
    assert_ne!(restarted.instance_id(), scheduler.instance_id());
    let jobs = restarted.bootstrap().await?;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].next_fire_at, ts(SECOND_FIRE));
    assert_eq!(jobs[0].fire_count, 1);
    Ok(())
}

#[tokio::test]
async fn jobs_are_left_to_instances_that_have_them() -> anyhow::Result<()> {
    let (cluster, scheduler, job) = single_node(Behavior::Succeed).await;
    let bystander = cluster.scheduler("bystander").build();

    cluster.set_time(FIRST_FIRE);
    assert_eq!(bystander.tick().await?, TickReport::default());
    assert_eq!(cluster.job(JOB).await.state, JobState::Waiting);

    assert_eq!(scheduler.tick().await?.completed, 1);
    assert_eq!(job.run_count(), 1);
    Ok(())
}

#[tokio::test]
async fn concurrent_fires_are_bounded() -> anyhow::Result<()> {
    let cluster = TestCluster::new();
    let job = RecordingJob::new(Behavior::Sleep(Duration::from_millis(30)));
    let scheduler = Scheduler::builder(
        cluster.store.clone(),
        cluster.time_source.clone(),
        SchedulerConfig {
            max_concurrent_fires: 1,
            ..TestCluster::scheduler_config("node-a")
        },
    )
    .job(weekly_job("settle-a"), job.clone())
    .job(weekly_job("settle-b"), job.clone())
    .job(weekly_job("settle-c"), job.clone())
    .build();
    scheduler.bootstrap().await?;

    cluster.set_time("2024-03-04T01:00:05Z");
    let report = scheduler.tick().await?;
    assert_eq!(report.completed, 3);
    assert_eq!(job.run_count(), 3);
    assert_eq!(job.max_running(), 1);
    Ok(())
}

/// Renews the claim every 10ms so a lost claim is noticed quickly.
fn short_lease(
    cluster: &TestCluster,
    name: &str,
    job: &RecordingJob,
) -> Scheduler {
    Scheduler::builder(
        cluster.store.clone(),
        cluster.time_source.clone(),
        SchedulerConfig {
            job_lease: Duration::from_millis(30),
            ..TestCluster::scheduler_config(name)
        },
    )
    .job(weekly_job(JOB), job.clone())
    .build()
}

#[tokio::test]
async fn body_is_aborted_when_the_claim_is_taken_over() -> anyhow::Result<()> {
    let cluster = TestCluster::new();
    let job = RecordingJob::new(Behavior::Sleep(Duration::from_millis(400)));
    let scheduler = short_lease(&cluster, "node-a", &job);
    scheduler.bootstrap().await?;

    cluster.set_time(FIRST_FIRE);
    let runner = scheduler.clone();
    let tick = tokio::spawn(async move { runner.tick().await });
    wait_until(|| job.run_count() == 1).await;

    // the lease runs out and another instance claims the occurrence
    cluster.set_time("2024-03-04T01:00:01Z");
    let other = InstanceId("node-b".into());
    cluster
        .store
        .claim(
            &JobId::from(JOB),
            ts(FIRST_FIRE),
            &other,
            cluster.now(),
            ts("2024-03-04T01:01:00Z"),
        )
        .await?
        .unwrap();

    let report = tick.await??;
    assert_eq!(report.claimed, 1);
    assert_eq!(report.lost, 1);
    assert_eq!(report.fired, 0);
    assert_eq!(job.finished_count(), 0);
    assert_eq!(job.running(), 0);

    // nothing was recorded over the new owner's claim
    let stored = cluster.job(JOB).await;
    assert!(stored.is_owned_by(&other));
    assert_eq!(stored.state, JobState::Acquired);
    assert_eq!(stored.next_fire_at, ts(FIRST_FIRE));
    assert_eq!(stored.last_outcome, None);
    Ok(())
}

#[tokio::test]
async fn only_the_new_owner_finishes_a_reclaimed_occurrence()
-> anyhow::Result<()> {
    let cluster = TestCluster::new();
    let job = RecordingJob::new(Behavior::Sleep(Duration::from_millis(400)));
    let first = short_lease(&cluster, "node-a", &job);
    let second = short_lease(&cluster, "node-b", &job);
    first.bootstrap().await?;
    second.bootstrap().await?;

    cluster.set_time(FIRST_FIRE);
    let runner = first.clone();
    let first_tick = tokio::spawn(async move { runner.tick().await });
    wait_until(|| job.run_count() == 1).await;

    cluster.set_time("2024-03-04T01:00:01Z");
    let second_report = second.tick().await?;
    let first_report = first_tick.await??;

    assert_eq!(first_report.lost, 1);
    assert_eq!(first_report.fired, 0);
    assert_eq!(second_report.claimed, 1);
    assert_eq!(second_report.completed, 1);

    let runs = job.runs();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[1].instance_id, *second.instance_id());
    assert!(runs[1].recovering);
    assert_eq!(job.finished_count(), 1);
    assert_eq!(job.running(), 0);

    let stored = cluster.job(JOB).await;
    assert_eq!(stored.state, JobState::Waiting);
    assert_eq!(stored.next_fire_at, ts(SECOND_FIRE));
    assert_eq!(stored.fire_count, 2);
    assert_eq!(stored.last_outcome, Some(OutcomeKind::Completed));
    Ok(())
}

#[tokio::test]
async fn body_is_aborted_when_renewals_fail_past_the_lease()
-> anyhow::Result<()> {
    let cluster = TestCluster::new();
    let job = RecordingJob::new(Behavior::Sleep(Duration::from_millis(400)));
    let scheduler = short_lease(&cluster, "node-a", &job);
    scheduler.bootstrap().await?;

    cluster.set_time(FIRST_FIRE);
    let runner = scheduler.clone();
    let tick = tokio::spawn(async move { runner.tick().await });
    wait_until(|| job.run_count() == 1).await;

    // the store goes away and the lease runs out on the clock
    cluster.store.set_available(false);
    cluster.set_time("2024-03-04T01:00:01Z");
    let report = tick.await??;
    assert_eq!(report.lost, 1);
    assert_eq!(job.finished_count(), 0);
    assert_eq!(job.running(), 0);

    cluster.store.set_available(true);
    let stored = cluster.job(JOB).await;
    assert_eq!(stored.state, JobState::Firing);
    assert!(stored.is_due(cluster.now()));
    Ok(())
}
