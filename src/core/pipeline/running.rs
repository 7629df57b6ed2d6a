use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::mpsc::{Receiver, Sender};
use uuid::Uuid;

use crate::{
    config::JudgeConfig,
    constants::{EVENT_TX_ERR, PROGRAM},
    core::{
        domain::{JudgeTask, TestcaseFiles},
        pipeline::testcase::{TestcaseOutcome, TestcaseRunner},
        results::final_result,
        verdict::Verdict,
    },
};

#[derive(Clone, Debug, PartialEq)]
pub enum JudgingEvent {
    TestcaseJudged {
        task_id: Uuid,
        rank: u32,
        outcome: TestcaseOutcome,
        finished_at: DateTime<Utc>,
    },
    Finished {
        task_id: Uuid,
        /// `None` only when there was nothing to judge.
        result: Option<Verdict>,
        runs: usize,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    },
}

/// Judges incoming tasks. Different tasks are judged concurrently, the
/// testcases of one task strictly one after the other.
#[tracing::instrument(skip_all)]
pub fn handle_running(
    event_tx: Sender<JudgingEvent>,
    mut task_rx: Receiver<JudgeTask>,
    runner: Arc<TestcaseRunner>,
    config: Arc<JudgeConfig>,
) {
    tokio::spawn(async move {
        let mut judgings = FuturesUnordered::new();
        loop {
            tokio::select! {
                Some(task) = task_rx.recv() => {
                    judgings.push(judge_task(task, event_tx.clone(), runner.clone(), config.clone()));
                }
                Some(()) = judgings.next(), if !judgings.is_empty() => {}
                else => break,
            }
        }
        tracing::debug!("Task channel closed, running stopped");
    });
}

async fn emit(event_tx: &Sender<JudgingEvent>, event: JudgingEvent) {
    if event_tx.send(event).await.is_err() {
        tracing::error!("{}", EVENT_TX_ERR);
    }
}

/// Creates the pass directory of `testcase` with a fresh copy of the program.
async fn prepare_passdir(task: &JudgeTask, testcase: &TestcaseFiles) -> std::io::Result<()> {
    let execdir = task.descriptor(testcase).execdir();
    tokio::fs::create_dir_all(&execdir).await?;
    tokio::fs::copy(&task.program, execdir.join(PROGRAM)).await?;
    Ok(())
}

async fn judge_task(
    task: JudgeTask,
    event_tx: Sender<JudgingEvent>,
    runner: Arc<TestcaseRunner>,
    config: Arc<JudgeConfig>,
) {
    let started_at = Utc::now();
    tracing::info!(
        "Judging task {} on {} testcases",
        task.id,
        task.testcases.len()
    );

    let mut testcases = task.testcases.clone();
    testcases.sort_by_key(|testcase| testcase.rank);

    let mut results: Vec<Option<Verdict>> = vec![None; testcases.len()];
    let mut result = None;
    let mut runs = 0;

    for (idx, testcase) in testcases.iter().enumerate() {
        let outcome = match prepare_passdir(&task, testcase).await {
            Ok(()) => runner.run_testcase(&task.descriptor(testcase)).await,
            Err(e) => {
                tracing::error!(
                    "Failed to prepare pass directory for testcase {}: {}",
                    testcase.rank,
                    e
                );
                TestcaseOutcome::internal_error()
            }
        };
        results[idx] = Some(outcome.verdict);
        runs += 1;

        emit(
            &event_tx,
            JudgingEvent::TestcaseJudged {
                task_id: task.id,
                rank: testcase.rank,
                outcome,
                finished_at: Utc::now(),
            },
        )
        .await;

        result = final_result(&results, &config.priorities);
        if result.is_some_and(Verdict::is_system_error) {
            tracing::warn!("Aborting task {} on a system error", task.id);
            break;
        }
        if config.lazy_eval && result.is_some() && runs < testcases.len() {
            tracing::info!(
                "Result of task {} is known after {} of {} testcases",
                task.id,
                runs,
                testcases.len()
            );
            break;
        }
    }

    tracing::info!("Task {} finished: {:?}", task.id, result);
    emit(
        &event_tx,
        JudgingEvent::Finished {
            task_id: task.id,
            result,
            runs,
            started_at,
            finished_at: Utc::now(),
        },
    )
    .await;
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::core::{
        domain::{CompareConfig, JudgeSettings, RunConfig, StdinSource, TestcaseTimeLimit, TimeLimit},
        meta::{ExecutionMetadata, TimeResult},
        traits::sandbox::MockSandbox,
    };

    struct Workspace {
        root: PathBuf,
    }

    impl Workspace {
        fn new() -> Self {
            let root = std::env::temp_dir().join(format!("judgehost_running_{}", Uuid::new_v4()));
            std::fs::create_dir_all(&root).unwrap();
            for script in ["program", "run", "compare"] {
                let path = root.join(script);
                std::fs::write(&path, "#!/bin/sh\n").unwrap();
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            }
            for rank in 1..=3 {
                std::fs::write(root.join(format!("in{}", rank)), "in\n").unwrap();
                std::fs::write(root.join(format!("out{}", rank)), "out\n").unwrap();
            }
            Workspace { root }
        }

        fn task(&self, ranks: &[u32]) -> JudgeTask {
            JudgeTask {
                id: Uuid::new_v4(),
                program: self.root.join("program"),
                workdir: self.root.join(format!("work_{}", Uuid::new_v4())),
                testcases: ranks
                    .iter()
                    .map(|&rank| TestcaseFiles {
                        rank,
                        input: self.root.join(format!("in{}", rank)),
                        output: self.root.join(format!("out{}", rank)),
                    })
                    .collect(),
                settings: JudgeSettings {
                    timelimit: TestcaseTimeLimit {
                        cpu: TimeLimit::from_secs(1, 2),
                        wall: TimeLimit::from_secs(3, 4),
                    },
                    run_runpath: self.root.join("run"),
                    compare_runpath: self.root.join("compare"),
                    combined_run_compare: false,
                    compare_args: None,
                    run_config: RunConfig {
                        memory_limit: 524288,
                        output_limit: 4096,
                        process_limit: 16,
                    },
                    compare_config: CompareConfig {
                        script_timelimit: 30,
                        script_memory_limit: 2097152,
                        script_filesize_limit: 2621440,
                    },
                },
            }
        }
    }

    impl Drop for Workspace {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }

    /// Every program answers; the one reading `slow_input` runs out of time.
    fn sandbox(slow_input: Option<&'static str>) -> MockSandbox {
        let mut sandbox = MockSandbox::new();
        sandbox.expect_execute().returning(move |request| {
            if request.command.argv.len() != 2 {
                return Ok(ExecutionMetadata {
                    exit_code: 42,
                    ..Default::default()
                });
            }
            if let Some(out) = &request.command.stdout {
                std::fs::write(out, "out\n").unwrap();
            }
            let slow = matches!(
                (&request.command.stdin, slow_input),
                (StdinSource::File(input), Some(slow)) if input.ends_with(slow)
            );
            Ok(if slow {
                ExecutionMetadata {
                    exit_code: 137,
                    time_result: TimeResult::Hard,
                    ..Default::default()
                }
            } else {
                ExecutionMetadata::default()
            })
        });
        sandbox
    }

    fn start(sandbox: MockSandbox, lazy_eval: bool) -> (Sender<JudgeTask>, Receiver<JudgingEvent>) {
        let config = Arc::new(JudgeConfig::new(None, lazy_eval));
        let runner = Arc::new(TestcaseRunner::new(config.clone(), Arc::new(sandbox)));
        let (event_tx, event_rx) = mpsc::channel(32);
        let (task_tx, task_rx) = mpsc::channel(32);
        handle_running(event_tx, task_rx, runner, config);
        (task_tx, event_rx)
    }

    async fn collect_until_finished(event_rx: &mut Receiver<JudgingEvent>) -> Vec<JudgingEvent> {
        let mut events = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), event_rx.recv())
                .await
                .expect("judging took too long")
                .expect("event channel closed");
            let finished = matches!(event, JudgingEvent::Finished { .. });
            events.push(event);
            if finished {
                return events;
            }
        }
    }

    fn judged(events: &[JudgingEvent]) -> Vec<(u32, Verdict)> {
        events
            .iter()
            .filter_map(|event| match event {
                JudgingEvent::TestcaseJudged { rank, outcome, .. } => Some((*rank, outcome.verdict)),
                _ => None,
            })
            .collect()
    }

    fn finished(events: &[JudgingEvent]) -> (Option<Verdict>, usize) {
        match events.last() {
            Some(JudgingEvent::Finished { result, runs, .. }) => (*result, *runs),
            other => panic!("Expected Finished event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_all_testcases_correct() {
        let workspace = Workspace::new();
        let (task_tx, mut event_rx) = start(sandbox(None), false);

        let task = workspace.task(&[3, 1, 2]);
        task_tx.send(task.clone()).await.unwrap();
        let events = collect_until_finished(&mut event_rx).await;

        assert_eq!(
            judged(&events),
            vec![(1, Verdict::Correct), (2, Verdict::Correct), (3, Verdict::Correct)]
        );
        assert_eq!(finished(&events), (Some(Verdict::Correct), 3));
        assert!(task.workdir.join("testcase002/execdir/program").is_file());
        assert!(task.workdir.join("testcase002/program.out").is_file());
    }

    #[tokio::test]
    async fn test_lazy_eval_stops_once_result_is_known() {
        let workspace = Workspace::new();
        let (task_tx, mut event_rx) = start(sandbox(Some("in2")), true);

        task_tx.send(workspace.task(&[1, 2, 3])).await.unwrap();
        let events = collect_until_finished(&mut event_rx).await;

        assert_eq!(
            judged(&events),
            vec![(1, Verdict::Correct), (2, Verdict::Timelimit)]
        );
        assert_eq!(finished(&events), (Some(Verdict::Timelimit), 2));
    }

    #[tokio::test]
    async fn test_without_lazy_eval_everything_runs() {
        let workspace = Workspace::new();
        let (task_tx, mut event_rx) = start(sandbox(Some("in2")), false);

        task_tx.send(workspace.task(&[1, 2, 3])).await.unwrap();
        let events = collect_until_finished(&mut event_rx).await;

        assert_eq!(judged(&events).len(), 3);
        assert_eq!(finished(&events), (Some(Verdict::Timelimit), 3));
    }

    #[tokio::test]
    async fn test_unpreparable_passdir_aborts_task() {
        let workspace = Workspace::new();
        let (task_tx, mut event_rx) = start(MockSandbox::new(), false);

        let mut task = workspace.task(&[1, 2]);
        task.program = workspace.root.join("missing-program");
        task_tx.send(task).await.unwrap();
        let events = collect_until_finished(&mut event_rx).await;

        assert_eq!(judged(&events), vec![(1, Verdict::InternalError)]);
        assert_eq!(finished(&events), (Some(Verdict::InternalError), 1));
    }

    #[tokio::test]
    async fn test_empty_task_has_no_result() {
        let workspace = Workspace::new();
        let (task_tx, mut event_rx) = start(MockSandbox::new(), true);

        task_tx.send(workspace.task(&[])).await.unwrap();
        let events = collect_until_finished(&mut event_rx).await;

        assert_eq!(finished(&events), (None, 0));
    }

    #[tokio::test]
    async fn test_tasks_are_judged_concurrently() {
        let workspace = Workspace::new();
        let (task_tx, mut event_rx) = start(sandbox(None), false);

        let first = workspace.task(&[1, 2]);
        let second = workspace.task(&[1]);
        task_tx.send(first.clone()).await.unwrap();
        task_tx.send(second.clone()).await.unwrap();

        let mut finished_tasks = Vec::new();
        while finished_tasks.len() < 2 {
            let event = tokio::time::timeout(Duration::from_secs(10), event_rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let JudgingEvent::Finished { task_id, result, .. } = event {
                assert_eq!(result, Some(Verdict::Correct));
                finished_tasks.push(task_id);
            }
        }
        finished_tasks.sort();
        let mut expected = vec![first.id, second.id];
        expected.sort();
        assert_eq!(finished_tasks, expected);
    }
}
