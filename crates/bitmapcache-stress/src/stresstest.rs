use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use bitmapcache::BitmapCache;
use bitmapcache::caching::format_size;
use bitmapcache::config::CacheConfig;

use crate::workloads::{LoadStats, WorkloadsConfig, prepare_workload, process_request};

pub async fn perform_stresstest(
    cache_config: CacheConfig,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let cache = Arc::new(BitmapCache::new(&cache_config));

    let monitor = cache.monitor(cache_config.monitor_interval);
    let mut snapshots = monitor.subscribe();
    monitor.start();
    tokio::spawn(async move {
        while snapshots.changed().await.is_ok() {
            let snapshot = Arc::clone(&snapshots.borrow_and_update());
            tracing::info!(
                entries = snapshot.items.len(),
                referenced = snapshot.referenced(),
                size = %snapshot.formatted_size(),
                "Bitmap store"
            );
        }
    });

    // initialize workloads
    let stats = Arc::new(LoadStats::default());
    let workloads: Vec<_> = workloads
        .workloads
        .into_iter()
        .enumerate()
        .map(|(i, workload)| Arc::new(prepare_workload(i, workload, Arc::clone(&stats))))
        .collect();

    // warmup: run each workload once to make sure caches are warm
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|workload| {
            let cache = Arc::clone(&cache);
            let workload = Arc::clone(workload);
            tokio::spawn(async move {
                process_request(&cache, &workload).await.ok();
            })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for workload in workloads.into_iter() {
        let deadline = Instant::now() + duration;
        let cache = Arc::clone(&cache);

        let task = tokio::spawn(async move {
            let concurrency = workload.concurrency;
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let failed_tasks = Arc::new(AtomicUsize::new(0));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let workload = Arc::clone(&workload);
                        let cache = Arc::clone(&cache);
                        let task_durations = Arc::clone(&task_durations);
                        let failed_tasks = Arc::clone(&failed_tasks);
                        let task_start = Instant::now();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let ctx = sentry::TransactionContext::new("stresstest", "stresstest");
                        let transaction = hub.start_transaction(ctx);

                        let future = async move {
                            if process_request(&cache, &workload).await.is_err() {
                                failed_tasks.fetch_add(1, Ordering::Relaxed);
                            }

                            transaction.finish();

                            task_durations.lock().unwrap().add(task_start.elapsed().as_secs_f64());

                            drop(permit);
                        };
                        let future = future.bind_hub(hub);

                        tokio::spawn(future);
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let task_durations: DDSketch = {
                let mut task_durations = task_durations.lock().unwrap();
                std::mem::take(&mut task_durations)
            };

            (concurrency, task_durations, failed_tasks.load(Ordering::Relaxed))
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (concurrency, task_durations, failed) = task.context("workload task panicked")?;

        let ops = task_durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!(
            "Workload {i} (concurrency: {concurrency}): {ops} operations, {failed} failed, {ops_ps:.2} ops/s"
        );
        if ops == 0 {
            continue;
        }

        let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
        let p50 = quantile(&task_durations, 0.5);
        let p90 = quantile(&task_durations, 0.9);
        let p99 = quantile(&task_durations, 0.99);
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    monitor.stop();
    let snapshot = monitor.snapshot();
    println!();
    println!(
        "Cache: {} entries ({}), {} loads, {} failed loads, {} bitmaps freed",
        snapshot.items.len(),
        format_size(snapshot.total_estimated_bytes),
        stats.loads.load(Ordering::Relaxed),
        stats.failures.load(Ordering::Relaxed),
        stats.freed.load(Ordering::Relaxed),
    );

    Ok(())
}

fn quantile(sketch: &DDSketch, q: f64) -> Duration {
    sketch
        .quantile(q)
        .ok()
        .flatten()
        .map(Duration::from_secs_f64)
        .unwrap_or_default()
}
