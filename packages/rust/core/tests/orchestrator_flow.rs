//! End-to-end control flow as an orchestrator and its workers drive it.

use std::collections::HashMap;
use std::sync::Arc;

use loadctl_core::{ControlPlane, ExtractPlan};
use loadctl_shared::{
    AppConfig, LoadCtlError, LoadStrategy, NewRun, NewSource, RunFilter, RunOutcome, RunStatus,
    SourceType, WatermarkPolicy,
};
use uuid::Uuid;

fn flow_config(policy: WatermarkPolicy) -> AppConfig {
    let mut config = AppConfig::default();
    config.database.path = std::env::temp_dir()
        .join(format!("loadctl_flow_{}.db", Uuid::now_v7()))
        .to_string_lossy()
        .into_owned();
    config.watermarks.policy = policy;
    config
}

async fn open_plane(policy: WatermarkPolicy) -> ControlPlane {
    ControlPlane::open(&flow_config(policy), None)
        .await
        .expect("open control plane")
}

fn orders() -> NewSource {
    NewSource {
        name: "orders".into(),
        source_type: SourceType::Database,
        location: "sqlserver://oltp/dbo.orders".into(),
        target_table: "stg_orders".into(),
        load_strategy: LoadStrategy::Incremental,
        merge_key: Some("updated_at".into()),
    }
}

#[tokio::test]
async fn incremental_run_lifecycle() {
    let plane = open_plane(WatermarkPolicy::Monotonic).await;
    let source_id = plane.register_source(&orders()).await.unwrap();

    // Orchestrator opens the run.
    let execution = plane
        .start_run(
            &NewRun::new("pl_orders", "copy_orders")
                .for_source(source_id)
                .with_run_id("trigger-2024-02-01"),
        )
        .await
        .unwrap();

    // Worker learns what to load and from where.
    let config = plane.get_source_config(Some(source_id)).await.unwrap();
    assert_eq!(config.len(), 1);
    assert_eq!(config[0].load_strategy, LoadStrategy::Incremental);
    let plan = plane.plan_extract(source_id).await.unwrap();
    assert!(matches!(plan, ExtractPlan::Incremental { since: None, .. }));

    // Worker finishes and checkpoints.
    plane
        .advance_watermark(source_id, "updated_at", "2024-02-01T00:00:00Z")
        .await
        .unwrap();

    // Orchestrator closes the run.
    let record = plane
        .end_run(execution, &RunOutcome::success(1000))
        .await
        .unwrap();
    assert_eq!(record.status, RunStatus::Success);
    assert!(record.completed_at.unwrap() >= record.started_at);

    // The next run resumes from the checkpoint.
    match plane.plan_extract(source_id).await.unwrap() {
        ExtractPlan::Incremental { since, .. } => {
            assert_eq!(since.as_deref(), Some("2024-02-01T00:00:00Z"))
        }
        other => panic!("unexpected plan: {other:?}"),
    }

    let err = plane
        .end_run(execution, &RunOutcome::success(1000))
        .await
        .unwrap_err();
    assert!(matches!(err, LoadCtlError::UnknownExecutionId(_)));
}

#[tokio::test]
async fn retries_append_new_records() {
    let plane = open_plane(WatermarkPolicy::Monotonic).await;
    let source_id = plane.register_source(&orders()).await.unwrap();
    let run = NewRun::new("pl_orders", "copy_orders")
        .for_source(source_id)
        .with_run_id("trigger-1");

    let first = plane.start_run(&run).await.unwrap();
    plane
        .end_run(first, &RunOutcome::failed("connection reset"))
        .await
        .unwrap();
    let second = plane.start_run(&run).await.unwrap();
    plane
        .end_run(second, &RunOutcome::success(250))
        .await
        .unwrap();

    let history = plane
        .list_executions(&RunFilter {
            run_id: Some("trigger-1".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    let statuses: Vec<RunStatus> = history.iter().map(|r| r.status).collect();
    assert_eq!(statuses, vec![RunStatus::Success, RunStatus::Failed]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_runs_and_monotonic_advances() {
    let plane = Arc::new(open_plane(WatermarkPolicy::Monotonic).await);
    let source_id = plane.register_source(&orders()).await.unwrap();

    let mut handles = Vec::new();
    for day in 1..=12u32 {
        let plane = Arc::clone(&plane);
        handles.push(tokio::spawn(async move {
            let execution = plane
                .start_run(&NewRun::new("pl_orders", "copy_orders").for_source(source_id))
                .await?;
            let value = format!("2024-01-{day:02}");
            let advanced = plane
                .advance_watermark(source_id, "updated_at", &value)
                .await;
            let outcome = match &advanced {
                Ok(_) => RunOutcome::success(u64::from(day)),
                Err(e) => RunOutcome::failed(e.to_string()),
            };
            plane.end_run(execution, &outcome).await?;
            Ok::<_, LoadCtlError>(advanced.is_ok())
        }));
    }

    let mut accepted = 0;
    for handle in handles {
        if handle.await.expect("join").expect("run") {
            accepted += 1;
        }
    }
    assert!(accepted >= 1);

    // Whatever the interleaving, the largest value always wins under the monotonic policy.
    let wm = plane
        .get_watermark(source_id, "updated_at")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(wm.current_value, "2024-01-12");

    let history = plane
        .list_executions(&RunFilter {
            source_id: Some(source_id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(history.len(), 12);
    assert!(history.iter().all(|r| r.status.is_terminal()));
    assert!(plane
        .list_open_runs(chrono::Duration::zero())
        .await
        .unwrap()
        .is_empty());
}

/// One worker process per source run: every task opens its own handle on the file.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn workers_with_own_handles_share_one_database() {
    let config = Arc::new(flow_config(WatermarkPolicy::Monotonic));
    let source_id = {
        let admin = ControlPlane::open(&config, None).await.unwrap();
        admin.register_source(&orders()).await.unwrap()
    };

    let mut handles = Vec::new();
    for n in 1..=16u32 {
        let config = Arc::clone(&config);
        handles.push(tokio::spawn(async move {
            let plane = ControlPlane::open(&config, None).await?;
            let execution = plane
                .start_run(&NewRun::new("pl_orders", "copy_orders").for_source(source_id))
                .await?;
            let advanced = plane
                .advance_watermark(source_id, "order_id", &n.to_string())
                .await;
            let outcome = match &advanced {
                Ok(_) => RunOutcome::success(u64::from(n)),
                Err(e) => RunOutcome::failed(e.to_string()),
            };
            plane.end_run(execution, &outcome).await?;
            Ok::<_, LoadCtlError>(advanced)
        }));
    }

    let mut accepted = Vec::new();
    for handle in handles {
        match handle.await.expect("join").expect("open, start and end succeed") {
            Ok(adv) => accepted.push((adv.previous, adv.current)),
            Err(LoadCtlError::WatermarkRegression { .. }) => {}
            Err(other) => panic!("unexpected advance error: {other}"),
        }
    }

    let firsts: Vec<_> = accepted.iter().filter(|(prev, _)| prev.is_none()).collect();
    assert_eq!(firsts.len(), 1);
    let mut next_of = HashMap::new();
    for (prev, cur) in &accepted {
        if let Some(prev) = prev {
            assert!(next_of.insert(prev.clone(), cur.clone()).is_none());
        }
    }
    let mut cursor = firsts[0].1.clone();
    let mut chain_len = 1;
    while let Some(next) = next_of.get(&cursor) {
        cursor = next.clone();
        chain_len += 1;
    }
    assert_eq!(chain_len, accepted.len());

    let plane = ControlPlane::open(&config, None).await.unwrap();
    let wm = plane
        .get_watermark(source_id, "order_id")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(wm.current_value, cursor);
    assert_eq!(wm.current_value, "16");

    let history = plane
        .list_executions(&RunFilter {
            source_id: Some(source_id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(history.len(), 16);
    assert!(history.iter().all(|r| r.status.is_terminal()));
}
