//! GPU scheduler ordering and shutdown behavior under concurrency.

mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use common::ConcurrencyGauge;
use mx_serve::engine::BackendError;
use mx_serve::scheduler::{GpuScheduler, GpuSchedulerConfig, JobPriority};

fn scheduler() -> Arc<GpuScheduler> {
    Arc::new(GpuScheduler::new(GpuSchedulerConfig {
        batch_window_ms: 2.0,
        max_batch_size: 4,
        ..GpuSchedulerConfig::default()
    }))
}

#[tokio::test]
async fn test_urgent_job_jumps_queued_work() {
    let scheduler = scheduler();
    scheduler.start().await;

    let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    // A long blocker occupies the commit worker so later jobs queue up.
    let blocker = {
        let scheduler = scheduler.clone();
        let order = order.clone();
        tokio::spawn(async move {
            scheduler
                .schedule(JobPriority::Default, move || async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    order.lock().push("blocker".to_string());
                    Ok::<_, BackendError>(())
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;

    let mut handles = Vec::new();
    for i in 0..4 {
        let scheduler = scheduler.clone();
        let order = order.clone();
        handles.push(tokio::spawn(async move {
            scheduler
                .schedule(JobPriority::Default, move || async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    order.lock().push(format!("normal{i}"));
                    Ok::<_, BackendError>(())
                })
                .await
        }));
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    // The urgent job arrives last but must leapfrog the queued normals.
    let urgent = {
        let scheduler = scheduler.clone();
        let order = order.clone();
        tokio::spawn(async move {
            scheduler
                .schedule(JobPriority::Urgent, move || async move {
                    order.lock().push("urgent".to_string());
                    Ok::<_, BackendError>(())
                })
                .await
        })
    };

    blocker.await.unwrap().unwrap();
    urgent.await.unwrap().unwrap();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let order = order.lock();
    let urgent_pos = order.iter().position(|l| l == "urgent").unwrap();
    let normals_after = order
        .iter()
        .skip(urgent_pos)
        .filter(|l| l.starts_with("normal"))
        .count();
    assert!(
        normals_after >= 3,
        "urgent finished after too many normals: {order:?}"
    );

    scheduler.stop().await;
}

#[tokio::test]
async fn test_jobs_never_overlap() {
    let scheduler = scheduler();
    scheduler.start().await;

    let gauge = Arc::new(ConcurrencyGauge::default());
    let mut handles = Vec::new();
    for _ in 0..16 {
        let scheduler = scheduler.clone();
        let gauge = gauge.clone();
        handles.push(tokio::spawn(async move {
            scheduler
                .schedule(JobPriority::Default, move || async move {
                    gauge.probe(Duration::from_millis(2)).await;
                    Ok::<_, BackendError>(())
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(gauge.max_concurrency(), 1);
    scheduler.stop().await;
}

#[tokio::test]
async fn test_total_counters_are_monotonic() {
    let scheduler = scheduler();
    scheduler.start().await;

    let mut last_jobs = 0;
    let mut last_batches = 0;
    for _ in 0..5 {
        scheduler
            .schedule(JobPriority::Default, || async { Ok::<_, BackendError>(()) })
            .await
            .unwrap();
        let stats = scheduler.stats().await;
        assert!(stats.total_jobs >= last_jobs);
        assert!(stats.total_batches >= last_batches);
        last_jobs = stats.total_jobs;
        last_batches = stats.total_batches;
    }
    assert_eq!(last_jobs, 5);
    scheduler.stop().await;
}

#[tokio::test]
async fn test_stop_is_clean_with_queued_jobs() {
    let scheduler = scheduler();
    scheduler.start().await;

    // A slow job plus a burst of queued ones, then stop mid-flight.
    let mut handles = Vec::new();
    for _ in 0..8 {
        let scheduler = scheduler.clone();
        handles.push(tokio::spawn(async move {
            scheduler
                .schedule(JobPriority::Background, || async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok::<_, BackendError>(())
                })
                .await
        }));
    }
    tokio::time::sleep(Duration::from_millis(15)).await;
    scheduler.stop().await;

    // Every job resolved: either it ran or it got a shutdown error.
    for handle in handles {
        let _ = handle.await.unwrap();
    }
    let stats = scheduler.stats().await;
    assert_eq!(stats.queue_size, 0);
}
