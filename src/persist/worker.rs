//! The single persist worker generation: drains the queue, coalesces rows
//! into day-grouped batches, and retries storage errors with exponential
//! backoff. Retry never drops a batch — data safety outranks availability —
//! so a pathologically stuck writer is the watchdog's job to detect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tracing::{error, warn};

use crate::db::schema::is_sqlite_busy_or_locked;
use crate::db::TickWriter;
use crate::error::AppError;
use crate::quality::GapDetector;
use crate::types::TickRow;

use super::PersistQueue;

enum WorkerExit {
    Stopped,
    RestartRequested,
}

enum FlushOutcome {
    Done,
    RestartRequested,
}

fn is_busy_locked(err: &AppError) -> bool {
    match err {
        AppError::Database(db_err) => is_sqlite_busy_or_locked(db_err),
        _ => false,
    }
}

pub(super) async fn worker_loop(
    queue: Arc<PersistQueue>,
    restart: Arc<AtomicBool>,
    generation: u64,
) {
    let detector = if queue.quality.gap_enabled {
        Some(GapDetector::new(
            &queue.quality,
            queue.session_calendar.clone(),
        ))
    } else {
        None
    };
    let mut writer = queue
        .store
        .open_writer(detector, Some(Arc::clone(&queue.report)));

    // A replacement generation first consumes what its predecessor left.
    let mut buffer: Vec<TickRow> = queue.take_carryover();

    if let Ok(mut state) = queue.state.lock() {
        state.worker_alive = true;
    }

    let outcome = std::panic::AssertUnwindSafe(run_loop(
        &queue,
        &restart,
        &mut writer,
        &mut buffer,
    ))
    .catch_unwind()
    .await;

    match outcome {
        Ok(WorkerExit::Stopped) => {
            if !buffer.is_empty() {
                let _ = flush_buffer(&queue, &restart, &mut writer, &buffer).await;
            }
        }
        Ok(WorkerExit::RestartRequested) => {
            queue.push_carryover(std::mem::take(&mut buffer));
            warn!(
                generation,
                queue = queue.queue_size(),
                queue_maxsize = queue.queue_maxsize(),
                "persist_worker_restart_requested"
            );
        }
        Err(_panic) => {
            queue.push_carryover(std::mem::take(&mut buffer));
            error!(
                generation,
                queue = queue.queue_size(),
                queue_maxsize = queue.queue_maxsize(),
                "persist_worker_fatal"
            );
            writer.close().await;
            if let Ok(mut state) = queue.state.lock() {
                state.worker_alive = false;
            }
            queue.signal_fatal();
            return;
        }
    }

    writer.close().await;
    if let Ok(mut state) = queue.state.lock() {
        state.worker_alive = false;
    }
}

async fn run_loop(
    queue: &Arc<PersistQueue>,
    restart: &AtomicBool,
    writer: &mut TickWriter,
    buffer: &mut Vec<TickRow>,
) -> WorkerExit {
    let max_wait = Duration::from_millis(queue.config.max_wait_ms);
    let pop_wait = max_wait.min(Duration::from_millis(250)).max(Duration::from_millis(10));
    let mut last_flush = Instant::now();

    loop {
        let stopping = queue.stop.load(Ordering::SeqCst);
        let restarting = restart.load(Ordering::SeqCst);

        if stopping && buffer.is_empty() && queue.queue_size() == 0 {
            return WorkerExit::Stopped;
        }
        if restarting && buffer.is_empty() {
            return WorkerExit::RestartRequested;
        }

        if !restarting {
            let popped = {
                let mut rx = queue.rx.lock().await;
                tokio::time::timeout(pop_wait, rx.recv()).await
            };
            match popped {
                Ok(Some(batch)) => {
                    queue.queued_rows.fetch_sub(batch.len(), Ordering::Relaxed);
                    if let Ok(mut state) = queue.state.lock() {
                        state.counters.queue_out_rows += batch.len() as u64;
                        state.total_rows_dequeued += batch.len() as u64;
                        state.last_drain_at = Some(Instant::now());
                    }
                    buffer.extend(batch);
                }
                Ok(None) => return WorkerExit::Stopped,
                Err(_) => {}
            }
        }

        let stopping = queue.stop.load(Ordering::SeqCst);
        let restarting = restart.load(Ordering::SeqCst);
        let should_flush = !buffer.is_empty()
            && (buffer.len() >= queue.config.batch_size
                || last_flush.elapsed() >= max_wait
                || (stopping && queue.queue_size() == 0)
                || restarting);

        if should_flush {
            match flush_buffer(queue, restart, writer, buffer).await {
                FlushOutcome::Done => {
                    buffer.clear();
                    last_flush = Instant::now();
                }
                // Leave the buffer intact: the caller hands it to the next
                // generation; dedupe absorbs any group that already landed.
                FlushOutcome::RestartRequested => return WorkerExit::RestartRequested,
            }
        }
    }
}

async fn flush_buffer(
    queue: &Arc<PersistQueue>,
    restart: &AtomicBool,
    writer: &mut TickWriter,
    rows: &[TickRow],
) -> FlushOutcome {
    let mut grouped: HashMap<&str, Vec<TickRow>> = HashMap::new();
    for row in rows {
        grouped
            .entry(row.trading_day.as_str())
            .or_default()
            .push(row.clone());
    }

    for (trading_day, day_rows) in grouped {
        match flush_day_rows_with_retry(queue, restart, writer, trading_day, day_rows).await {
            FlushOutcome::Done => {}
            FlushOutcome::RestartRequested => return FlushOutcome::RestartRequested,
        }
    }
    FlushOutcome::Done
}

async fn flush_day_rows_with_retry(
    queue: &Arc<PersistQueue>,
    restart: &AtomicBool,
    writer: &mut TickWriter,
    trading_day: &str,
    rows: Vec<TickRow>,
) -> FlushOutcome {
    let db_path = queue.store.db_path(trading_day);
    let last_seq = rows.iter().filter_map(|row| row.seq).max();
    let mut attempt: u32 = 0;

    loop {
        if restart.load(Ordering::SeqCst) && !queue.stop.load(Ordering::SeqCst) {
            return FlushOutcome::RestartRequested;
        }
        attempt += 1;

        match writer.insert_ticks(trading_day, &rows).await {
            Ok(result) => {
                queue.commit_latency.record_ms(result.commit_latency_ms);
                if let Ok(mut state) = queue.state.lock() {
                    state.counters.persisted_rows += result.inserted;
                    state.counters.ignored_rows += result.ignored;
                    state.counters.db_commits += 1;
                    state.total_rows_committed += result.inserted;
                    state.total_commits += 1;
                    state.last_commit_at = Some(Instant::now());
                    state.last_commit_rows = result.inserted;
                }
                queue.send_to_observer(rows, result);
                return FlushOutcome::Done;
            }
            Err(err) => {
                let busy_locked = is_busy_locked(&err);
                let backoff_sec = (queue.config.persist_retry_backoff_sec
                    * f64::from(2u32.pow((attempt - 1).min(10))))
                .min(queue.config.persist_retry_backoff_max_sec);

                record_exception(queue, &err, backoff_sec, busy_locked);
                writer.reset_connection(trading_day).await;

                if busy_locked {
                    warn!(
                        trading_day,
                        db_path = %db_path.display(),
                        batch = rows.len(),
                        attempt,
                        sleep_sec = format_args!("{backoff_sec:.3}"),
                        queue = queue.queue_size(),
                        queue_maxsize = queue.queue_maxsize(),
                        last_seq = last_seq.unwrap_or(-1),
                        error = %err,
                        "sqlite_busy_backoff"
                    );
                } else {
                    error!(
                        trading_day,
                        db_path = %db_path.display(),
                        batch = rows.len(),
                        attempt,
                        queue = queue.queue_size(),
                        queue_maxsize = queue.queue_maxsize(),
                        last_seq = last_seq.unwrap_or(-1),
                        error = %err,
                        "persist_flush_failed"
                    );
                }

                // The budget resets backoff scaling, it never drops rows.
                if queue.config.persist_retry_max_attempts > 0
                    && attempt >= queue.config.persist_retry_max_attempts
                {
                    error!(
                        trading_day,
                        batch = rows.len(),
                        attempts = attempt,
                        queue = queue.queue_size(),
                        queue_maxsize = queue.queue_maxsize(),
                        "persist_retry_budget_exhausted continuing_with_backoff"
                    );
                    attempt = 0;
                }

                if restart.load(Ordering::SeqCst) && !queue.stop.load(Ordering::SeqCst) {
                    return FlushOutcome::RestartRequested;
                }
                sleep_backoff(queue, restart, backoff_sec).await;
            }
        }
    }
}

fn record_exception(queue: &PersistQueue, err: &AppError, backoff_sec: f64, busy_locked: bool) {
    let Ok(mut state) = queue.state.lock() else {
        return;
    };
    let exc_type = match err {
        AppError::Database(_) => {
            if busy_locked {
                "SqliteBusyOrLocked"
            } else {
                "DatabaseError"
            }
        }
        AppError::Io(_) => "IoError",
        _ => "Other",
    };
    if state.last_exception_type.as_deref() == Some(exc_type) {
        state.last_exception_count += 1;
    } else {
        state.last_exception_type = Some(exc_type.to_string());
        state.last_exception_count = 1;
    }
    state.last_backoff_sec = backoff_sec;
    if busy_locked {
        state.busy_locked_count += 1;
        state.busy_backoff_count += 1;
    }
}

/// Backoff sleep in small slices so a restart request interrupts promptly.
async fn sleep_backoff(queue: &PersistQueue, restart: &AtomicBool, delay_sec: f64) {
    if delay_sec <= 0.0 {
        return;
    }
    let deadline = Instant::now() + Duration::from_secs_f64(delay_sec);
    loop {
        if restart.load(Ordering::SeqCst) && !queue.stop.load(Ordering::SeqCst) {
            return;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        tokio::time::sleep(remaining.min(Duration::from_millis(100))).await;
    }
}
