//! Property-based tests for queue ordering and retry accounting.

use proptest::prelude::*;

use nightjar_scheduler::{
    Job, JobRunUpdate, JobStatus, MAX_RETRY_DELAY_SECS, NewJob, RetryPolicy, RunStatus,
    SqliteStore,
};

/// Operations applied to a fresh queue before draining it.
#[derive(Debug, Clone)]
enum QueueOp {
    Enqueue(i32),
    Reorder { index: usize, position: i64 },
    Reprioritize { index: usize, priority: i32 },
    Cancel(usize),
}

fn queue_op() -> impl Strategy<Value = QueueOp> {
    prop_oneof![
        4 => (-2i32..3).prop_map(QueueOp::Enqueue),
        1 => (0usize..16, 0i64..500).prop_map(|(index, position)| QueueOp::Reorder { index, position }),
        1 => (0usize..16, -2i32..3).prop_map(|(index, priority)| QueueOp::Reprioritize { index, priority }),
        1 => (0usize..16).prop_map(QueueOp::Cancel),
    ]
}

fn dispatched_before(a: &Job, b: &Job) -> bool {
    a.priority > b.priority
        || (a.priority == b.priority && a.position < b.position)
        || (a.priority == b.priority && a.position == b.position && a.created_at <= b.created_at)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    // Jobs leave the queue in priority, position, creation order
    #[test]
    fn dispatch_order_respects_priority_and_position(ops in prop::collection::vec(queue_op(), 1..24)) {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut ids: Vec<String> = Vec::new();

        for op in ops {
            match op {
                QueueOp::Enqueue(priority) => {
                    let job = store.create_job(&NewJob::new("story").with_priority(priority)).unwrap();
                    ids.push(job.job_id);
                }
                QueueOp::Reorder { index, position } if !ids.is_empty() => {
                    let id = &ids[index % ids.len()];
                    let _ = store.update_job(id, &nightjar_scheduler::JobUpdate {
                        position: Some(position),
                        ..Default::default()
                    });
                }
                QueueOp::Reprioritize { index, priority } if !ids.is_empty() => {
                    let id = &ids[index % ids.len()];
                    let _ = store.update_job(id, &nightjar_scheduler::JobUpdate {
                        priority: Some(priority),
                        ..Default::default()
                    });
                }
                QueueOp::Cancel(index) if !ids.is_empty() => {
                    let _ = store.cancel_queued_job(&ids[index % ids.len()]);
                }
                _ => {}
            }
        }

        let expected = store.list_queued_jobs(None).unwrap().len();
        let mut drained: Vec<Job> = Vec::new();
        while let Some(next) = store.get_next_queued_job().unwrap() {
            prop_assert_eq!(next.status, JobStatus::Queued);
            store.atomic_claim_job(&next.job_id).unwrap();
            drained.push(next);
        }

        prop_assert_eq!(drained.len(), expected);
        for pair in drained.windows(2) {
            prop_assert!(
                dispatched_before(&pair[0], &pair[1]),
                "{:?} dispatched before {:?}",
                (pair[0].priority, pair[0].position),
                (pair[1].priority, pair[1].position)
            );
        }
    }

    // A retry chain of n failures reports n attempts, rooted at the first job
    #[test]
    fn retry_chain_counts_attempts(failures in 1usize..6) {
        let store = SqliteStore::open_in_memory().unwrap();
        let root = store.create_job(&NewJob::new("research")).unwrap();
        let mut current = root.clone();

        for attempt in 1..=failures {
            let chain = store.get_retry_chain(&current.job_id).unwrap();
            prop_assert_eq!(chain.attempt_count as usize, attempt);
            prop_assert_eq!(&chain.root_job_id, &root.job_id);

            let (_, run) = store.atomic_claim_job(&current.job_id).unwrap();
            store.update_job_run(&run.run_id, &JobRunUpdate::finish(RunStatus::Failed)).unwrap();
            current = store.create_job(&NewJob::new("research").retrying(&current.job_id)).unwrap();
        }
    }

    // The advisory backoff doubles with every attempt until it hits the cap
    #[test]
    fn backoff_doubles(base in 1u64..120, attempt in 0u32..20) {
        let policy = RetryPolicy { max_attempts: 3, base_delay_secs: base };
        let now = policy.calculate_retry_delay(attempt).num_seconds();
        let next = policy.calculate_retry_delay(attempt + 1).num_seconds();
        prop_assert_eq!(next, (now * 2).min(MAX_RETRY_DELAY_SECS as i64));
    }

    // Any configured base delay yields a bounded delay
    #[test]
    fn backoff_never_exceeds_cap(base in any::<u64>(), attempt in any::<u32>()) {
        let policy = RetryPolicy { max_attempts: 3, base_delay_secs: base };
        let delay = policy.calculate_retry_delay(attempt).num_seconds();
        prop_assert!(delay >= 0 && delay <= MAX_RETRY_DELAY_SECS as i64);
    }
}
