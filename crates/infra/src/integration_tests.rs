//! End-to-end tests of the backup step over in-memory stores.
//!
//! Tests: ProcessStateBridge → JobQueue → JobRunner → UploadService → poll
//!
//! Verifies:
//! - The process sees waiting, then proceed or failed
//! - One running backup per course, even with many runners
//! - Upload outcome is recorded exactly once

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::{Duration, Instant};

    use chrono::Utc;

    use lcbackup_core::{BackupOptions, ProcessId, S3Credentials, S3Settings, StepInstanceId, StepSettings};

    use crate::blob::{ARCHIVE_COMPONENT, CATALOG_COMPONENT};
    use crate::jobs::{
        ExclusivityLock, FailureKind, JobPayload, JobQueue, JobRunner, JobStatus, RunOutcome, RunnerConfig,
    };
    use crate::process::{ProcessLinkStore, StepResponse};
    use crate::testing::{Harness, COURSE, OTHER_COURSE};
    use crate::upload::UploadRecordStore;

    const PROCESS: ProcessId = ProcessId::new(500);

    fn payload(upload: bool) -> JobPayload {
        JobPayload::new(
            PROCESS,
            StepInstanceId::new(3),
            StepSettings {
                upload,
                ..StepSettings::default()
            },
        )
    }

    #[test]
    fn scenario_a_backup_without_upload() {
        let h = Harness::new();
        let bridge = h.bridge(true);
        let runner = h.runner("runner-a", Harness::config(), true);

        let requested = bridge.enqueue_backup(PROCESS, COURSE, payload(false)).unwrap();
        assert_eq!(requested.response, StepResponse::Waiting);
        assert_eq!(bridge.poll_backup(PROCESS).unwrap(), StepResponse::Waiting);

        assert_eq!(runner.run_once().unwrap(), RunOutcome::Succeeded(requested.job_id));

        let job = h.queue.get(requested.job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(h.blobs.count_component(ARCHIVE_COMPONENT), 0);
        assert_eq!(h.blobs.count_component(CATALOG_COMPONENT), 1);
        assert!(h.records.is_empty());
        assert_eq!(h.remote.put_count(), 0);

        assert_eq!(bridge.poll_backup(PROCESS).unwrap(), StepResponse::Proceed);
    }

    #[test]
    fn scenario_a_with_upload_records_once() {
        let h = Harness::new();
        let bridge = h.bridge(true);
        let runner = h.runner("runner-a", Harness::config(), true);

        let requested = bridge.enqueue_backup(PROCESS, COURSE, payload(true)).unwrap();
        assert!(matches!(runner.run_once().unwrap(), RunOutcome::Succeeded(_)));

        let record = h.records.get(requested.job_id).unwrap().unwrap();
        assert_eq!(record.process_id, PROCESS);
        assert_eq!(record.course_id, COURSE);
        assert!(record.remote_key.starts_with("lifecycle/backup-moodle2-course-42-bio101-"));
        assert!(h.remote.object(&record.remote_key).is_some());

        // A repeated terminal mark changes nothing.
        h.queue.mark_succeeded(requested.job_id).unwrap();
        assert_eq!(h.records.len(), 1);
        assert_eq!(bridge.poll_backup(PROCESS).unwrap(), StepResponse::Proceed);
    }

    #[test]
    fn scenario_b_unreachable_remote() {
        let h = Harness::new();
        h.remote.set_reachable(false);
        let bridge = h.bridge(true);
        let runner = h.runner("runner-a", Harness::config(), true);

        let requested = bridge.enqueue_backup(PROCESS, COURSE, payload(true)).unwrap();
        assert!(matches!(runner.run_once().unwrap(), RunOutcome::Failed(..)));

        let job = h.queue.get(requested.job_id).unwrap().unwrap();
        let JobStatus::Failed { reason } = &job.status else {
            panic!("expected failed job, got {:?}", job.status);
        };
        assert!(reason.to_string().contains("unreachable"));
        assert!(h.records.is_empty());
        assert_eq!(h.remote.put_count(), 0);

        match bridge.poll_backup(PROCESS).unwrap() {
            StepResponse::Failed { reason } => assert!(reason.contains("unreachable")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(h.lock.holder(COURSE).is_none());
    }

    #[test]
    fn scenario_c_contended_course_is_requeued() {
        let h = Harness::new();
        let runner = h.runner("runner-a", Harness::config(), true);
        let job_id = h.enqueue(COURSE, false);

        // Someone outside the queue (a manual backup) holds the course.
        assert!(h.lock.try_acquire(COURSE, "manual-backup", Duration::from_secs(60)).unwrap());

        assert_eq!(runner.run_once().unwrap(), RunOutcome::Requeued(job_id));
        let job = h.queue.get(job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.scheduled_at > chrono::Utc::now());
        assert_eq!(h.archives.calls(), 0);

        // Backed off: not claimable right away.
        assert_eq!(runner.run_once().unwrap(), RunOutcome::Idle);
    }

    #[test]
    fn scenario_c_same_course_never_archives_concurrently() {
        const RUNNERS: usize = 6;
        let h = Arc::new(Harness::new());
        h.archives.set_delay(Duration::from_millis(30));
        for _ in 0..4 {
            h.enqueue(COURSE, false);
        }
        h.enqueue(OTHER_COURSE, false);

        let barrier = Arc::new(Barrier::new(RUNNERS));
        let handles: Vec<_> = (0..RUNNERS)
            .map(|i| {
                let h = h.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let runner = h.runner(&format!("runner-{i}"), Harness::config(), true);
                    barrier.wait();
                    let deadline = Instant::now() + Duration::from_secs(10);
                    while h.queue.stats().unwrap().succeeded < 5 && Instant::now() < deadline {
                        if runner.run_once().unwrap() == RunOutcome::Idle {
                            thread::sleep(Duration::from_millis(2));
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = h.queue.stats().unwrap();
        assert_eq!(stats.succeeded, 5);
        assert_eq!(stats.running, 0);
        assert_eq!(h.archives.calls(), 5);
        assert_eq!(h.archives.max_active_for(COURSE), 1);
    }

    #[test]
    fn scenario_d_deleted_job_lets_process_proceed() {
        let h = Harness::new();
        let bridge = h.bridge(false);

        let requested = bridge.enqueue_backup(PROCESS, COURSE, payload(false)).unwrap();
        assert!(h.queue.delete(requested.job_id).unwrap());

        assert_eq!(bridge.poll_backup(PROCESS).unwrap(), StepResponse::Proceed);
        assert!(h.links.get(PROCESS).unwrap().is_none());
    }

    #[test]
    fn expired_lock_is_taken_over_by_runner() {
        let h = Harness::new();
        let runner = h.runner("runner-a", Harness::config(), true);
        let job_id = h.enqueue(COURSE, false);
        assert!(h.lock.try_acquire(COURSE, "crashed-runner", Duration::from_millis(20)).unwrap());

        thread::sleep(Duration::from_millis(40));
        assert_eq!(runner.run_once().unwrap(), RunOutcome::Succeeded(job_id));
    }

    #[test]
    fn pool_serves_bridge_requests() {
        let h = Harness::new();
        let bridge = h.bridge(true);
        let config = RunnerConfig {
            poll_interval: Duration::from_millis(5),
            ..Harness::config()
        }
        .with_workers(2);
        let pool = JobRunner::spawn_pool(h.deps(true), config).unwrap();

        bridge.enqueue_backup(PROCESS, COURSE, payload(true)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut response = bridge.poll_backup(PROCESS).unwrap();
        while response == StepResponse::Waiting && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
            response = bridge.poll_backup(PROCESS).unwrap();
        }
        pool.shutdown();

        assert_eq!(response, StepResponse::Proceed);
        assert_eq!(h.records.len(), 1);
    }

    #[test]
    fn crashed_runner_does_not_block_the_course_forever() {
        let h = Harness::new();
        let bridge = h.bridge(false);
        let config = RunnerConfig {
            lock_ttl: Duration::from_millis(20),
            ..Harness::config()
        };
        let first = ProcessId::new(601);
        let second = ProcessId::new(602);

        let crashed = bridge
            .enqueue_backup(first, COURSE, JobPayload::new(first, StepInstanceId::new(3), StepSettings::default()))
            .unwrap();
        // Claimed and locked by a runner that never reports back.
        h.queue.claim_due(Utc::now(), config.lock_ttl).unwrap().unwrap();
        assert!(h.lock.try_acquire(COURSE, "crashed", config.lock_ttl).unwrap());

        let next = bridge
            .enqueue_backup(second, COURSE, JobPayload::new(second, StepInstanceId::new(3), StepSettings::default()))
            .unwrap();
        thread::sleep(Duration::from_millis(60));

        let runner = h.runner("runner-a", config, false);
        let outcomes: Vec<_> = (0..5).map(|_| runner.run_once().unwrap()).collect();
        assert_eq!(outcomes[0], RunOutcome::Succeeded(next.job_id));
        assert!(outcomes[1..].iter().all(|o| *o == RunOutcome::Idle));

        let JobStatus::Failed { reason } = h.queue.get(crashed.job_id).unwrap().unwrap().status else {
            panic!("abandoned job should have failed");
        };
        assert_eq!(reason.kind, FailureKind::Internal);
        assert!(matches!(bridge.poll_backup(first).unwrap(), StepResponse::Failed { reason } if reason.contains("lease expired")));
        assert_eq!(bridge.poll_backup(second).unwrap(), StepResponse::Proceed);
    }

    #[test]
    fn each_instance_uploads_to_its_own_bucket() {
        let h = Harness::new();
        let bridge = h.bridge(true);
        let runner = h.runner("runner-a", Harness::config(), true);

        let remote = |bucket: &str| S3Settings {
            bucket: bucket.to_string(),
            region: "eu-west-1".to_string(),
            credentials: S3Credentials::Ambient,
            endpoint: None,
            proxy_url: None,
            key_prefix: String::new(),
        };
        let requests = [(701, COURSE, "science"), (702, OTHER_COURSE, "chemistry")];
        for (process, course, bucket) in requests {
            let process = ProcessId::new(process);
            let settings = StepSettings::new(BackupOptions::default(), true).with_remote(remote(bucket));
            bridge
                .enqueue_backup(process, course, JobPayload::new(process, StepInstanceId::new(process.get()), settings))
                .unwrap();
        }

        for _ in 0..2 {
            assert!(matches!(runner.run_once().unwrap(), RunOutcome::Succeeded(_)));
        }

        for (process, course, bucket) in requests {
            assert_eq!(bridge.poll_backup(ProcessId::new(process)).unwrap(), StepResponse::Proceed);
            let records = h.records.list_for_course(course).unwrap();
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].remote_bucket, bucket);
            assert!(h.buckets.bucket(bucket).object(&records[0].remote_key).is_some());
            assert_eq!(h.buckets.bucket(bucket).put_count(), 1);
        }
        assert_eq!(h.remote.put_count(), 0);
    }

    #[test]
    fn invalid_instance_remote_is_rejected_at_request_time() {
        let h = Harness::new();
        let bridge = h.bridge(true);
        let settings = StepSettings::new(BackupOptions::default(), true).with_remote(S3Settings {
            bucket: "science".to_string(),
            region: String::new(),
            credentials: S3Credentials::Ambient,
            endpoint: None,
            proxy_url: None,
            key_prefix: String::new(),
        });

        let err = bridge
            .enqueue_backup(PROCESS, COURSE, JobPayload::new(PROCESS, StepInstanceId::new(3), settings))
            .unwrap_err();
        assert!(err.to_string().contains("region"));
        assert_eq!(h.queue.stats().unwrap().pending, 0);
    }
}
