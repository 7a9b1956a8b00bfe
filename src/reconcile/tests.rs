use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::check_running::{check_plan, running_items};
use super::ingress::{LastUsed, ingress_pass};
use super::*;
use crate::controller::test_support::{
    COLLECTION_ID, FakeScheduler, Harness, PROJECT_ID, execution_plan, run_async_test,
};
use crate::error::{AppError, AppResult};
use crate::metrics::MetricsSink;
use crate::model::{EngineMetric, RunHistory};
use crate::scheduler::{GatewayScheduler, NodePoolInfo};
use crate::store::ExecutionStore;

const THRESHOLD: Duration = Duration::from_secs(900);

fn minutes_ago(now: DateTime<Utc>, minutes: i64) -> DateTime<Utc> {
    now.checked_sub_signed(TimeDelta::minutes(minutes))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn minutes_later(now: DateTime<Utc>, minutes: i64) -> DateTime<Utc> {
    now.checked_add_signed(TimeDelta::minutes(minutes))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn finished_run(now: DateTime<Utc>, ended_minutes_ago: Option<i64>) -> RunHistory {
    RunHistory {
        run_id: 1,
        collection_id: COLLECTION_ID,
        started_time: minutes_ago(now, 90),
        end_time: ended_minutes_ago.map(|minutes| minutes_ago(now, minutes)),
    }
}

async fn mount_idle_worker(server: &MockServer, progress_status: u16) {
    Mock::given(method("GET"))
        .and(path_regex(r"/progress$"))
        .respond_with(ResponseTemplate::new(progress_status))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"/stream$"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(""),
        )
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"/stop$"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

/// Open a run with every seeded plan marked running.
async fn start_run(harness: &Harness, plan_ids: &[i64]) -> AppResult<i64> {
    let run_id = harness.store.start_run(COLLECTION_ID).await?;
    harness.store.new_run(COLLECTION_ID, run_id).await?;
    for plan_id in plan_ids {
        harness.store.add_running_plan(COLLECTION_ID, *plan_id).await?;
    }
    Ok(run_id)
}

fn metric(run_id: i64) -> EngineMetric {
    EngineMetric {
        threads: 10.0,
        latency: 120.0,
        label: "login".to_owned(),
        status: "200".to_owned(),
        raw: String::new(),
        collection_id: COLLECTION_ID,
        plan_id: 1,
        run_id,
        engine_id: 0,
    }
}

#[test]
fn staleness_follows_the_idle_threshold() -> AppResult<()> {
    let now = Utc::now();
    let launched = minutes_ago(now, 60);
    let cases = [
        ("ended 14 minutes ago", Some(finished_run(now, Some(14))), launched, false),
        ("ended 16 minutes ago", Some(finished_run(now, Some(16))), launched, true),
        ("never ran, launched 16 minutes ago", None, minutes_ago(now, 16), true),
        ("never ran, launched 14 minutes ago", None, minutes_ago(now, 14), false),
        ("still running", Some(finished_run(now, None)), launched, false),
        ("young launch after old run", Some(finished_run(now, Some(50))), minutes_ago(now, 5), false),
    ];
    for (name, last_run, launch_time, expected) in cases {
        if is_collection_stale(last_run.as_ref(), launch_time, now, THRESHOLD) != expected {
            return Err(AppError::controller(format!(
                "{}: expected stale={}",
                name, expected
            )));
        }
    }
    Ok(())
}

#[test]
fn resume_is_idempotent() -> AppResult<()> {
    run_async_test(async {
        let server = MockServer::start().await;
        mount_idle_worker(&server, 200).await;
        let harness = Harness::new(FakeScheduler::with_address(&server.uri()))?;
        harness
            .seed(
                false,
                &[execution_plan(1, 1), execution_plan(2, 1), execution_plan(3, 1)],
            )
            .await?;
        start_run(&harness, &[1, 2]).await?;

        if resume_on_boot(&harness.controller).await? != 2 {
            return Err(AppError::controller("each running plan should resume its engine"));
        }
        if resume_on_boot(&harness.controller).await? != 0 {
            return Err(AppError::controller("second resume must not register again"));
        }
        if harness.controller.engines().len() != 2 {
            return Err(AppError::controller("plan 3 is not running and must stay unwatched"));
        }
        Ok(())
    })
}

#[test]
fn idle_plans_are_terminated_and_run_finished() -> AppResult<()> {
    run_async_test(async {
        let server = MockServer::start().await;
        mount_idle_worker(&server, 404).await;
        let harness = Harness::new(FakeScheduler::with_address(&server.uri()))?;
        harness
            .seed(false, &[execution_plan(1, 1), execution_plan(2, 1)])
            .await?;
        let run_id = start_run(&harness, &[1, 2]).await?;
        resume_on_boot(&harness.controller).await?;

        let mut items = running_items(&harness.controller).await.into_iter();
        let first = items
            .next()
            .ok_or_else(|| AppError::controller("plan 1 should be queued"))?;
        check_plan(&harness.controller, first).await;
        if harness.store.current_run(COLLECTION_ID).await? != Some(run_id) {
            return Err(AppError::controller("run stays open while plan 2 runs"));
        }
        if harness.controller.engines().len() != 1 {
            return Err(AppError::controller("plan 1 engine should be dropped"));
        }

        let second = items
            .next()
            .ok_or_else(|| AppError::controller("plan 2 should be queued"))?;
        check_plan(&harness.controller, second).await;
        if harness.store.current_run(COLLECTION_ID).await?.is_some() {
            return Err(AppError::controller("last idle plan should stop the run"));
        }
        match harness.store.get_run(run_id).await? {
            RunHistory {
                end_time: Some(_), ..
            } => Ok(()),
            other => Err(AppError::controller(format!("run not finished: {:?}", other))),
        }
    })
}

#[test]
fn restarted_controller_resumes_and_finishes_running_plans() -> AppResult<()> {
    run_async_test(async {
        let server = MockServer::start().await;
        mount_idle_worker(&server, 404).await;
        let harness = Harness::new(FakeScheduler::with_address(&server.uri()))?;
        harness.seed(false, &[execution_plan(1, 2)]).await?;
        let run_id = start_run(&harness, &[1]).await?;

        let gateway = GatewayScheduler::new(&server.uri(), Duration::from_secs(2))?;
        let restarted = harness.restarted(Arc::new(gateway))?;
        if resume_on_boot(&restarted).await? != 2 {
            return Err(AppError::controller("both engines should resume after a restart"));
        }

        for item in running_items(&restarted).await {
            check_plan(&restarted, item).await;
        }
        if harness.store.has_running_plan(COLLECTION_ID).await? || !restarted.engines().is_empty() {
            return Err(AppError::controller("idle plan should be terminated after a restart"));
        }
        match harness.store.get_run(run_id).await? {
            RunHistory {
                end_time: Some(_), ..
            } => Ok(()),
            other => Err(AppError::controller(format!("run not finished: {:?}", other))),
        }
    })
}

#[test]
fn ingress_outage_keeps_plans_running() -> AppResult<()> {
    run_async_test(async {
        let harness = Harness::new(FakeScheduler::default())?;
        harness.seed(false, &[execution_plan(1, 1)]).await?;
        start_run(&harness, &[1]).await?;
        harness.scheduler.ingress_down.store(true, Ordering::Release);

        for item in running_items(&harness.controller).await {
            check_plan(&harness.controller, item).await;
        }
        if !harness.store.has_running_plan(COLLECTION_ID).await? {
            return Err(AppError::controller("plan must not be terminated on an ingress error"));
        }
        Ok(())
    })
}

#[test]
fn purge_removes_idle_collections_and_pools() -> AppResult<()> {
    run_async_test(async {
        let harness = Harness::new(FakeScheduler::default())?;
        harness.seed(false, &[execution_plan(1, 1)]).await?;
        let now = Utc::now();
        harness
            .scheduler
            .launched(COLLECTION_ID, minutes_ago(now, 30))
            .await;

        let busy = 13;
        let run_id = harness.store.start_run(busy).await?;
        harness.store.new_run(busy, run_id).await?;
        harness.scheduler.launched(busy, minutes_ago(now, 30)).await;

        harness.scheduler.pools.lock().await.extend([
            (
                40,
                NodePoolInfo {
                    size: 3,
                    launch_time: minutes_ago(now, 20),
                },
            ),
            (
                41,
                NodePoolInfo {
                    size: 1,
                    launch_time: minutes_ago(now, 2),
                },
            ),
        ]);

        let purged = purge::purge_pass(&harness.controller, THRESHOLD, true).await;
        if purged != 2 {
            return Err(AppError::controller(format!("expected 2 purges, got {}", purged)));
        }
        if *harness.scheduler.purged.lock().await != vec![COLLECTION_ID] {
            return Err(AppError::controller("only the never-run collection is idle"));
        }
        if *harness.scheduler.purged_pools.lock().await != vec![40] {
            return Err(AppError::controller("only the old pool is idle"));
        }

        let without_pools = purge::purge_pass(&harness.controller, THRESHOLD, false).await;
        if without_pools != 0 || harness.scheduler.pools.lock().await.len() != 1 {
            return Err(AppError::controller("pools are left alone without on-demand nodes"));
        }
        Ok(())
    })
}

#[test]
fn node_pool_of_a_deployed_collection_is_kept_while_not_ready() -> AppResult<()> {
    run_async_test(async {
        let harness = Harness::new(FakeScheduler::default())?;
        harness.seed(false, &[execution_plan(1, 1)]).await?;
        let now = Utc::now();
        harness
            .scheduler
            .launched(COLLECTION_ID, minutes_ago(now, 2))
            .await;
        harness.scheduler.pools.lock().await.insert(
            COLLECTION_ID,
            NodePoolInfo {
                size: 2,
                launch_time: minutes_ago(now, 20),
            },
        );
        harness.scheduler.ready.store(0, Ordering::Release);

        let purged = purge::purge_pass(&harness.controller, THRESHOLD, true).await;
        if purged != 0 || !harness.scheduler.purged_pools.lock().await.is_empty() {
            return Err(AppError::controller("pool of a deployed collection was purged"));
        }

        harness.scheduler.launches.lock().await.clear();
        let purged = purge::purge_pass(&harness.controller, THRESHOLD, true).await;
        if purged != 1 || *harness.scheduler.purged_pools.lock().await != vec![COLLECTION_ID] {
            return Err(AppError::controller("undeployed idle pool should be purged"));
        }
        Ok(())
    })
}

#[test]
fn unused_project_ingress_is_purged_after_its_lifespan() -> AppResult<()> {
    run_async_test(async {
        let harness = Harness::new(FakeScheduler::default())?;
        harness.seed(false, &[execution_plan(1, 1)]).await?;
        let lifespan = Duration::from_secs(1800);
        let now = Utc::now();
        harness
            .scheduler
            .launched(COLLECTION_ID, minutes_ago(now, 120))
            .await;
        start_run(&harness, &[1]).await?;
        harness.scheduler.exposed.lock().await.extend([
            (PROJECT_ID, minutes_ago(now, 120)),
            (8, minutes_ago(now, 120)),
            (9, minutes_ago(now, 5)),
        ]);
        let mut last_used = LastUsed::new();

        let purged = ingress_pass(&harness.controller, lifespan, &mut last_used, now).await;
        if purged != 1 || *harness.scheduler.purged_ingress.lock().await != vec![8] {
            return Err(AppError::controller("only the project without activity should lose its ingress"));
        }

        let run_id = harness
            .store
            .current_run(COLLECTION_ID)
            .await?
            .ok_or_else(|| AppError::controller("run should be open"))?;
        harness.store.stop_run(COLLECTION_ID).await?;
        harness.store.run_finish(COLLECTION_ID, run_id).await?;
        harness.scheduler.launches.lock().await.clear();

        let soon = minutes_later(now, 10);
        if ingress_pass(&harness.controller, lifespan, &mut last_used, soon).await != 0 {
            return Err(AppError::controller("recent use is remembered after the purge"));
        }

        let later = minutes_later(now, 40);
        let purged = ingress_pass(&harness.controller, lifespan, &mut last_used, later).await;
        if purged != 2 || *harness.scheduler.purged_ingress.lock().await != vec![8, PROJECT_ID, 9] {
            return Err(AppError::controller("idle projects should lose their ingress"));
        }
        if !last_used.is_empty() || !harness.scheduler.exposed.lock().await.is_empty() {
            return Err(AppError::controller("purged projects should be forgotten"));
        }
        Ok(())
    })
}

#[test]
fn finished_runs_leave_the_metric_cache() -> AppResult<()> {
    run_async_test(async {
        let harness = Harness::new(FakeScheduler::default())?;
        harness.seed(false, &[execution_plan(1, 1)]).await?;
        let done = harness.store.start_run(COLLECTION_ID).await?;
        harness.store.new_run(COLLECTION_ID, done).await?;
        harness.store.stop_run(COLLECTION_ID).await?;
        harness.store.run_finish(COLLECTION_ID, done).await?;
        let open = start_run(&harness, &[]).await?;

        harness.registry.observe(&metric(done));
        harness.registry.observe(&metric(open));

        if cache_prune::prune_pass(&harness.controller).await != 1 {
            return Err(AppError::controller("one finished run should be pruned"));
        }
        if harness.registry.cached_runs() != vec![(open, COLLECTION_ID)] {
            return Err(AppError::controller("the open run must keep its series"));
        }
        Ok(())
    })
}

#[test]
fn engine_health_is_sampled_for_deployed_collections() -> AppResult<()> {
    run_async_test(async {
        let harness = Harness::new(FakeScheduler::default())?;
        harness.seed(false, &[execution_plan(1, 1)]).await?;
        harness.scheduler.launched(COLLECTION_ID, Utc::now()).await;
        harness.scheduler.usage.lock().await.insert(
            "0".to_owned(),
            [("cpu".to_owned(), 250.0), ("mem".to_owned(), 1024.0)]
                .into_iter()
                .collect(),
        );

        resources::resources_pass(&harness.controller).await;

        match harness.registry.resource_gauges(COLLECTION_ID, 1, "0") {
            Some((cpu, mem)) if cpu.total_cmp(&250.0).is_eq() && mem.total_cmp(&1024.0).is_eq() => {
                Ok(())
            }
            other => Err(AppError::controller(format!("unexpected gauges {:?}", other))),
        }
    })
}

#[test]
fn loops_stop_on_shutdown() -> AppResult<()> {
    run_async_test(async {
        let harness = Harness::new(FakeScheduler::default())?;
        let settings = ReconcileSettings {
            check_interval: Duration::from_millis(10),
            purge_interval: Duration::from_millis(10),
            cache_prune_interval: Duration::from_millis(10),
            resource_interval: Duration::from_millis(10),
            ingress_gc_interval: Duration::from_millis(10),
            ..ReconcileSettings::default()
        };
        let handles = spawn_loops(&harness.controller, &settings, &harness.shutdown_tx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(harness.shutdown_tx.send(()));

        let stopped = Arc::new(tokio::sync::Semaphore::new(0));
        for handle in handles {
            let stopped = Arc::clone(&stopped);
            tokio::spawn(async move {
                if handle.await.is_ok() {
                    stopped.add_permits(1);
                }
            });
        }
        let expected = u32::try_from(settings.check_workers.saturating_add(5))
            .map_err(|err| AppError::controller(format!("bad worker count: {}", err)))?;
        tokio::time::timeout(Duration::from_secs(2), stopped.acquire_many(expected))
            .await
            .map_err(|_err| AppError::controller("loops did not stop"))?
            .map_err(|err| AppError::controller(format!("semaphore closed: {}", err)))?
            .forget();
        Ok(())
    })
}
