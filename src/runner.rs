//! The four-phase scan iteration sequencer.
//!
//! A scan drives its device iterators through four ordered phases:
//! apply-parameters, prepare, run, stop. The runner receives each phase as
//! a discrete call from the owning scan, so phases stay independently
//! observable and the protocol order is enforced at runtime.
//!
//! Within a phase all per-iterator tasks are launched before any is
//! awaited. The first two phases wait for all tasks and kill the remainder
//! on the first failure. The run phase waits *incrementally*: as soon as a
//! finished task is the watchdog, or its iterator's top-level device is a
//! terminator, the remaining tasks are killed cleanly and the phase
//! completes; a real failure or a user abort kills the remainder too but
//! is recorded. Recorded run-phase failures do not surface immediately:
//! the stop phase always runs, and the first recorded failure is raised
//! from it, so stop handlers get their chance regardless of how the run
//! went.
//!
//! The stop phase tolerates one masked abort attempt before honoring it,
//! giving cleanup handlers a chance to finish under kill pressure.

use crate::cancel::{AbortListener, AbortToken};
use crate::chain::SharedIterator;
use crate::error::{ScanError, ScanResult};
use crate::metadata::ScanInfo;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::future::BoxFuture;
use tokio::task::{AbortHandle, JoinError, JoinHandle};

/// Number of extra abort attempts absorbed while waiting for stop tasks.
const STOP_PHASE_MASKED_KILLS: usize = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    ApplyParameters,
    Prepare,
    Run,
    Stop,
    Done,
}

/// One top-level iterator taking part in the run phase.
pub struct ChainIterTask {
    pub iterator: SharedIterator,
    /// Completion of a terminator's iterator ends the whole run phase.
    pub terminator: bool,
}

/// Everything the run phase needs.
pub struct RunPayload {
    pub scan_info: ScanInfo,
    pub iterators: Vec<ChainIterTask>,
    /// Watchdog task, if the scan has one. It joins the same wait set
    /// without a corresponding iterator.
    pub watchdog: Option<JoinHandle<ScanResult<()>>>,
}

enum TaskKind {
    Iterator { terminator: bool },
    Watchdog,
}

/// Phase sequencer for one scan run. Transient: one runner per run.
pub struct ScanIterationsRunner {
    phase: Phase,
    listener: AbortListener,
    deferred: Vec<ScanError>,
}

impl ScanIterationsRunner {
    pub fn new(abort: AbortToken) -> Self {
        Self {
            phase: Phase::ApplyParameters,
            listener: abort.listener(),
            deferred: Vec::new(),
        }
    }

    fn advance(&mut self, expected: Phase, next: Phase) -> ScanResult<()> {
        if self.phase != expected {
            return Err(ScanError::Sequence(format!(
                "expected phase {:?}, runner is in {:?}",
                expected, self.phase
            )));
        }
        self.phase = next;
        Ok(())
    }

    /// Phase 1: push configured parameters onto the hardware, one task per
    /// top-level iterator. Waits for all; kills the rest and re-raises on
    /// the first failure.
    pub async fn apply_parameters(
        &mut self,
        tasks: Vec<JoinHandle<ScanResult<()>>>,
    ) -> ScanResult<()> {
        self.advance(Phase::ApplyParameters, Phase::Prepare)?;
        self.join_all_or_kill(tasks, 0).await
    }

    /// Phase 2: prepare every iterator. Same wait/kill semantics.
    pub async fn prepare(&mut self, tasks: Vec<JoinHandle<ScanResult<()>>>) -> ScanResult<()> {
        self.advance(Phase::Prepare, Phase::Run)?;
        self.join_all_or_kill(tasks, 0).await
    }

    /// Phase 3: run the iterators (and the watchdog) to completion.
    ///
    /// Always returns `Ok` unless called out of order: failures and aborts
    /// are recorded and surface from [`stop`](Self::stop), after the stop
    /// tasks have run.
    pub async fn run(&mut self, payload: RunPayload) -> ScanResult<()> {
        self.advance(Phase::Run, Phase::Stop)?;

        let mut abort_handles: Vec<AbortHandle> = Vec::new();
        let mut stream: FuturesUnordered<BoxFuture<'static, (TaskKind, Result<ScanResult<()>, JoinError>)>> =
            FuturesUnordered::new();

        for task in payload.iterators {
            let handle = tokio::spawn(Self::drive(task.iterator, payload.scan_info.clone()));
            abort_handles.push(handle.abort_handle());
            let kind = TaskKind::Iterator {
                terminator: task.terminator,
            };
            stream.push(Box::pin(async move { (kind, handle.await) }));
        }
        if let Some(watchdog) = payload.watchdog {
            abort_handles.push(watchdog.abort_handle());
            stream.push(Box::pin(async move { (TaskKind::Watchdog, watchdog.await) }));
        }

        let mut stopping = false;
        let mut aborted = false;
        let mut error: Option<ScanError> = None;

        while !stream.is_empty() {
            tokio::select! {
                Some((kind, joined)) = stream.next() => {
                    let settled = stopping || aborted || error.is_some();
                    match joined {
                        Ok(Ok(())) => {
                            let ends_run = matches!(
                                kind,
                                TaskKind::Watchdog | TaskKind::Iterator { terminator: true }
                            );
                            if ends_run && !settled {
                                // First relevant finisher wins: end the run
                                // phase, kill the rest, not as an error.
                                stopping = true;
                                kill_all(&abort_handles);
                            }
                        }
                        Ok(Err(err)) => {
                            if settled {
                                log::debug!("ignoring error from killed scan task: {err}");
                            } else {
                                error = Some(err);
                                kill_all(&abort_handles);
                            }
                        }
                        Err(join_err) => {
                            if let Some(err) = ScanError::from_join(join_err) {
                                if settled {
                                    log::debug!("scan task panicked during shutdown: {err}");
                                } else {
                                    error = Some(err);
                                    kill_all(&abort_handles);
                                }
                            }
                        }
                    }
                }
                _ = self.listener.aborted(), if !aborted => {
                    aborted = true;
                    kill_all(&abort_handles);
                }
            }
        }

        if aborted {
            self.deferred.push(ScanError::Aborted);
        } else if let Some(err) = error {
            self.deferred.push(err);
        }
        Ok(())
    }

    /// Phase 4: run the stop tasks, then surface the first failure recorded
    /// anywhere since the run phase began.
    pub async fn stop(&mut self, tasks: Vec<JoinHandle<ScanResult<()>>>) -> ScanResult<()> {
        self.advance(Phase::Stop, Phase::Done)?;
        if let Err(err) = self.join_all_or_kill(tasks, STOP_PHASE_MASKED_KILLS).await {
            self.deferred.push(err);
        }
        if self.deferred.is_empty() {
            Ok(())
        } else {
            Err(self.deferred.remove(0))
        }
    }

    async fn drive(iterator: SharedIterator, scan_info: ScanInfo) -> ScanResult<()> {
        let mut iter = iterator.lock().await;
        iter.start().await?;
        while let Some(mut step) = iter.next_step().await? {
            step.prepare(&scan_info).await?;
            step.start().await?;
        }
        Ok(())
    }

    /// Wait for a batch of already-spawned tasks.
    ///
    /// The first task failure kills the rest and is returned. A user abort
    /// kills the remaining tasks and returns `Aborted`, except that up to
    /// `masked_kills` extra abort attempts are absorbed while the tasks
    /// are given the chance to finish on their own.
    async fn join_all_or_kill(
        &mut self,
        tasks: Vec<JoinHandle<ScanResult<()>>>,
        masked_kills: usize,
    ) -> ScanResult<()> {
        let abort_handles: Vec<AbortHandle> = tasks.iter().map(|t| t.abort_handle()).collect();
        let mut stream: FuturesUnordered<JoinHandle<ScanResult<()>>> =
            tasks.into_iter().collect();

        let mut abort_signals = 0usize;
        let mut error: Option<ScanError> = None;

        while !stream.is_empty() {
            tokio::select! {
                Some(joined) = stream.next() => {
                    let settled = abort_signals > 0 || error.is_some();
                    match joined {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            if settled {
                                log::debug!("ignoring error from killed task: {err}");
                            } else {
                                error = Some(err);
                                kill_all(&abort_handles);
                            }
                        }
                        Err(join_err) => {
                            if let Some(err) = ScanError::from_join(join_err) {
                                if settled {
                                    log::debug!("task panicked during shutdown: {err}");
                                } else {
                                    error = Some(err);
                                    kill_all(&abort_handles);
                                }
                            }
                        }
                    }
                }
                _ = self.listener.aborted() => {
                    abort_signals += 1;
                    if abort_signals > masked_kills {
                        kill_all(&abort_handles);
                    }
                }
            }
        }

        if abort_signals > 0 {
            Err(ScanError::Aborted)
        } else if let Some(err) = error {
            Err(err)
        } else {
            Ok(())
        }
    }
}

fn kill_all(handles: &[AbortHandle]) {
    for handle in handles {
        handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{AcquisitionStep, DeviceIterator};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Iterator that starts, yields no steps, then sleeps for `run_time`.
    struct TimedIterator {
        run_time: Duration,
        fail_on_start: bool,
        stopped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl DeviceIterator for TimedIterator {
        async fn apply_parameters(&mut self) -> ScanResult<()> {
            Ok(())
        }
        async fn prepare(&mut self, _scan_info: &ScanInfo) -> ScanResult<()> {
            Ok(())
        }
        async fn start(&mut self) -> ScanResult<()> {
            if self.fail_on_start {
                return Err(ScanError::Acquisition("start failed".into()));
            }
            tokio::time::sleep(self.run_time).await;
            Ok(())
        }
        async fn next_step(&mut self) -> ScanResult<Option<Box<dyn AcquisitionStep>>> {
            Ok(None)
        }
        async fn stop(&mut self) -> ScanResult<()> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn shared(iter: TimedIterator) -> SharedIterator {
        Arc::new(tokio::sync::Mutex::new(Box::new(iter) as Box<dyn DeviceIterator>))
    }

    fn timed(run_time: Duration) -> SharedIterator {
        shared(TimedIterator {
            run_time,
            fail_on_start: false,
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    #[tokio::test]
    async fn test_phase_order_is_enforced() {
        let mut runner = ScanIterationsRunner::new(AbortToken::new());
        let result = runner.prepare(Vec::new()).await;
        assert!(matches!(result, Err(ScanError::Sequence(_))));
    }

    #[tokio::test]
    async fn test_first_failure_kills_siblings_and_reraises_once() {
        let mut runner = ScanIterationsRunner::new(AbortToken::new());
        let survivors = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for i in 0..3 {
            let survivors = survivors.clone();
            tasks.push(tokio::spawn(async move {
                if i == 1 {
                    Err(ScanError::Acquisition("task 1 boom".into()))
                } else {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    survivors.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }));
        }

        let started = std::time::Instant::now();
        let result = runner.join_all_or_kill(tasks, 0).await;
        assert!(matches!(result, Err(ScanError::Acquisition(msg)) if msg.contains("task 1")));
        assert!(started.elapsed() < Duration::from_secs(5), "siblings were killed");
        assert_eq!(survivors.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_terminator_completion_ends_run_phase() {
        let token = AbortToken::new();
        let mut runner = ScanIterationsRunner::new(token);

        let payload = RunPayload {
            scan_info: ScanInfo::new(),
            iterators: vec![
                ChainIterTask {
                    iterator: timed(Duration::from_millis(10)),
                    terminator: true,
                },
                ChainIterTask {
                    iterator: timed(Duration::from_secs(30)),
                    terminator: false,
                },
            ],
            watchdog: None,
        };

        runner.advance(Phase::ApplyParameters, Phase::Prepare).expect("phase");
        runner.advance(Phase::Prepare, Phase::Run).expect("phase");

        let started = std::time::Instant::now();
        runner.run(payload).await.expect("run records, never raises");
        assert!(started.elapsed() < Duration::from_secs(5));
        runner.stop(Vec::new()).await.expect("clean stop, no deferred error");
    }

    #[tokio::test]
    async fn test_run_failure_surfaces_from_stop_phase() {
        let mut runner = ScanIterationsRunner::new(AbortToken::new());
        runner.advance(Phase::ApplyParameters, Phase::Prepare).expect("phase");
        runner.advance(Phase::Prepare, Phase::Run).expect("phase");

        let stopped = Arc::new(AtomicBool::new(false));
        let failing = shared(TimedIterator {
            run_time: Duration::ZERO,
            fail_on_start: true,
            stopped: stopped.clone(),
        });

        let payload = RunPayload {
            scan_info: ScanInfo::new(),
            iterators: vec![ChainIterTask {
                iterator: failing.clone(),
                terminator: false,
            }],
            watchdog: None,
        };
        runner.run(payload).await.expect("run defers its error");

        // The stop phase still runs its tasks, then re-raises.
        let stop_task = {
            let failing = failing.clone();
            tokio::spawn(async move { failing.lock().await.stop().await })
        };
        let result = runner.stop(vec![stop_task]).await;
        assert!(matches!(result, Err(ScanError::Acquisition(_))));
        assert!(stopped.load(Ordering::SeqCst), "stop ran before the error surfaced");
    }

    #[tokio::test]
    async fn test_watchdog_completion_ends_run_phase() {
        let mut runner = ScanIterationsRunner::new(AbortToken::new());
        runner.advance(Phase::ApplyParameters, Phase::Prepare).expect("phase");
        runner.advance(Phase::Prepare, Phase::Run).expect("phase");

        let watchdog = tokio::spawn(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(())
        });
        let payload = RunPayload {
            scan_info: ScanInfo::new(),
            iterators: vec![ChainIterTask {
                iterator: timed(Duration::from_secs(30)),
                terminator: false,
            }],
            watchdog: Some(watchdog),
        };

        let started = std::time::Instant::now();
        runner.run(payload).await.expect("run");
        assert!(started.elapsed() < Duration::from_secs(5));
        runner.stop(Vec::new()).await.expect("watchdog stop is clean");
    }

    #[tokio::test]
    async fn test_abort_during_run_defers_aborted() {
        let token = AbortToken::new();
        let mut runner = ScanIterationsRunner::new(token.clone());
        runner.advance(Phase::ApplyParameters, Phase::Prepare).expect("phase");
        runner.advance(Phase::Prepare, Phase::Run).expect("phase");

        let payload = RunPayload {
            scan_info: ScanInfo::new(),
            iterators: vec![ChainIterTask {
                iterator: timed(Duration::from_secs(30)),
                terminator: false,
            }],
            watchdog: None,
        };

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.abort();
        });

        runner.run(payload).await.expect("abort is deferred");
        let result = runner.stop(Vec::new()).await;
        assert!(matches!(result, Err(ScanError::Aborted)));
    }

    #[tokio::test]
    async fn test_stop_phase_masks_one_abort() {
        let token = AbortToken::new();
        let mut runner = ScanIterationsRunner::new(token.clone());
        let finished = Arc::new(AtomicBool::new(false));

        let task = {
            let finished = finished.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                finished.store(true, Ordering::SeqCst);
                Ok(())
            })
        };

        token.abort();
        let result = runner.join_all_or_kill(vec![task], 1).await;
        assert!(matches!(result, Err(ScanError::Aborted)));
        assert!(
            finished.load(Ordering::SeqCst),
            "one masked kill lets the stop task finish"
        );
    }

    #[tokio::test]
    async fn test_insisting_abort_kills_stop_tasks() {
        let token = AbortToken::new();
        let mut runner = ScanIterationsRunner::new(token.clone());
        let finished = Arc::new(AtomicBool::new(false));

        let task = {
            let finished = finished.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                finished.store(true, Ordering::SeqCst);
                Ok(())
            })
        };

        token.abort();
        token.abort();
        let started = std::time::Instant::now();
        let result = runner.join_all_or_kill(vec![task], 1).await;
        assert!(matches!(result, Err(ScanError::Aborted)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!finished.load(Ordering::SeqCst));
    }
}
