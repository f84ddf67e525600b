//! End-to-end dispatcher tests against scripted workers.
//!
//! Workers speak the real protocol over in-memory channels, so these
//! exercise the session read loop, the exchanges and outcome handling
//! together.


use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio_stream::StreamExt;

use provisioner_lite::config::{EventBufferConfig, OverflowPolicy};
use provisioner_lite::proto::{ServerMessage, WorkerMessage};
use provisioner_lite::protocol::{FramedChannel, ServerChannel};
use provisioner_lite::scheduler::{
    ArchiveRef, FailureKind, JobKind, JobResult, JobStatus, LogEvent, ParameterValue,
    SessionState, SubmitJob,
};
use provisioner_lite::ProvisionerError;
use test_harness::{
    archive, assert_eventually, resource, schema, start_dispatcher, tags, template_import,
    test_dispatch_config, workspace_build, TestDispatcher,
};

const TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_workspace_build_end_to_end() {
    let td = start_dispatcher();
    let job_id = td
        .dispatcher
        .submit_job(workspace_build(&[("region", "us")], &[]))
        .await
        .unwrap();

    // No worker yet
    assert_eq!(
        td.dispatcher.get_job(job_id).await.unwrap().status,
        JobStatus::Pending
    );

    let mut worker = td.connect_worker("w1", &["docker"]).await;
    let config = worker.expect_config().await;
    assert_eq!(config.archive_hash, "abc123");
    assert!(!config.dry_run);
    assert_eq!(config.parameters.len(), 1);
    assert_eq!(config.parameters[0].name, "region");
    assert_eq!(config.parameters[0].value, "us");

    let running = td.dispatcher.get_job(job_id).await.unwrap();
    assert_eq!(running.status, JobStatus::Running);
    assert_eq!(running.assigned_worker, Some(worker.worker_id));

    worker.provision_log("pulling image").await;
    worker.provision_log("starting container").await;
    worker
        .provision_complete(vec![resource("dev", &[0x00, 0xff, 0x10])])
        .await;

    let job = td
        .wait_for_status(job_id, JobStatus::Succeeded, TIMEOUT)
        .await;
    assert_eq!(job.events.len(), 2);
    assert_eq!(job.events[0].message, "pulling image");
    assert_eq!(job.events[1].sequence, 2);
    assert!(job.assigned_worker.is_none());
    assert!(job.error.is_none());
    match job.result {
        Some(JobResult::WorkspaceBuild { resources }) => {
            assert_eq!(resources.len(), 1);
            assert_eq!(resources[0].instance_id, vec![0x00, 0xff, 0x10]);
        }
        other => panic!("unexpected result {:?}", other),
    }

    // Session goes back to idle
    let dispatcher = td.dispatcher.clone();
    assert_eventually(
        || {
            let dispatcher = dispatcher.clone();
            async move {
                dispatcher
                    .list_workers()
                    .await
                    .iter()
                    .any(|w| w.state == SessionState::Idle && w.current_job.is_none())
            }
        },
        TIMEOUT,
        "worker should be idle after its job",
    )
    .await;
}

#[tokio::test]
async fn test_connection_lost_mid_provision() {
    let td = start_dispatcher();
    let job_id = td
        .dispatcher
        .submit_job(workspace_build(&[("region", "us")], &[]))
        .await
        .unwrap();

    let mut worker = td.connect_worker("w1", &["docker"]).await;
    let worker_id = worker.worker_id;
    worker.expect_config().await;
    worker.provision_log("pulling image").await;
    worker.disconnect().await;

    let job = td.wait_for_status(job_id, JobStatus::Failed, TIMEOUT).await;
    let error = job.error.expect("failed job carries an error");
    assert_eq!(error.kind, FailureKind::ConnectionLost);
    assert_eq!(job.events.len(), 1);
    assert!(job.result.is_none());

    let dispatcher = td.dispatcher.clone();
    assert_eventually(
        || {
            let dispatcher = dispatcher.clone();
            async move {
                dispatcher
                    .list_workers()
                    .await
                    .iter()
                    .all(|w| w.id != worker_id)
            }
        },
        TIMEOUT,
        "lost session should leave the registry",
    )
    .await;
}

#[tokio::test]
async fn test_failed_job_is_not_requeued() {
    let td = start_dispatcher();
    let job_id = td
        .dispatcher
        .submit_job(workspace_build(&[], &[]))
        .await
        .unwrap();

    let mut first = td.connect_worker("first", &[]).await;
    first.expect_config().await;
    first.disconnect().await;
    td.wait_for_status(job_id, JobStatus::Failed, TIMEOUT).await;

    let mut second = td.connect_worker("second", &[]).await;
    assert!(second.try_recv(Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn test_worker_error_is_reported_verbatim() {
    let td = start_dispatcher();
    let job_id = td
        .dispatcher
        .submit_job(workspace_build(&[], &[]))
        .await
        .unwrap();

    let mut worker = td.connect_worker("w1", &[]).await;
    worker.expect_config().await;
    worker
        .provision_error("terraform apply: quota exceeded for instances")
        .await;

    let job = td.wait_for_status(job_id, JobStatus::Failed, TIMEOUT).await;
    let error = job.error.unwrap();
    assert_eq!(error.kind, FailureKind::WorkerError);
    assert_eq!(error.message, "terraform apply: quota exceeded for instances");
}

#[tokio::test]
async fn test_template_import_parses_then_plans() {
    let td = start_dispatcher();
    let job_id = td
        .dispatcher
        .submit_job(template_import(&[]))
        .await
        .unwrap();

    let mut worker = td.connect_worker("w1", &[]).await;
    let request = worker.expect_parse().await;
    assert_eq!(request.archive_hash, "abc123");
    worker.parse_log("reading main.tf").await;
    worker
        .parse_complete(vec![schema("region", Some("us")), schema("image", None)])
        .await;

    let config = worker.expect_config().await;
    assert!(config.dry_run);
    worker.provision_log("planning").await;
    worker.provision_complete(vec![resource("dev", &[])]).await;

    let job = td
        .wait_for_status(job_id, JobStatus::Succeeded, TIMEOUT)
        .await;
    assert_eq!(job.kind, JobKind::TemplateImport);
    assert_eq!(job.events.len(), 2);
    match job.result {
        Some(JobResult::TemplateImport {
            parameter_schemas,
            resources,
        }) => {
            assert_eq!(parameter_schemas.len(), 2);
            assert_eq!(parameter_schemas[0].name, "region");
            assert_eq!(parameter_schemas[0].default_value.as_deref(), Some("us"));
            assert!(parameter_schemas[1].required);
            assert_eq!(resources.len(), 1);
        }
        other => panic!("unexpected result {:?}", other),
    }
}

#[tokio::test]
async fn test_parse_error_fails_import() {
    let td = start_dispatcher();
    let job_id = td
        .dispatcher
        .submit_job(template_import(&[]))
        .await
        .unwrap();

    let mut worker = td.connect_worker("w1", &[]).await;
    worker.expect_parse().await;
    worker.parse_error("main.tf:3: unexpected token").await;

    let job = td.wait_for_status(job_id, JobStatus::Failed, TIMEOUT).await;
    let error = job.error.unwrap();
    assert_eq!(error.kind, FailureKind::WorkerError);
    assert_eq!(error.message, "main.tf:3: unexpected token");
    // No provision after a failed parse
    assert!(worker.try_recv(Duration::from_millis(200)).await.is_none());
}

#[tokio::test]
async fn test_cancel_pending_job() {
    let td = start_dispatcher();
    let job_id = td
        .dispatcher
        .submit_job(workspace_build(&[], &["gpu"]))
        .await
        .unwrap();

    td.dispatcher.cancel_job(job_id).await.unwrap();
    let job = td.dispatcher.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Canceled);
    assert!(job.started_at.is_none());

    // A matching worker arriving later gets nothing
    let mut worker = td.connect_worker("gpu", &["gpu"]).await;
    assert!(worker.try_recv(Duration::from_millis(300)).await.is_none());

    // Canceling a terminal job is a no-op
    td.dispatcher.cancel_job(job_id).await.unwrap();
    assert_eq!(
        td.dispatcher.get_job(job_id).await.unwrap().status,
        JobStatus::Canceled
    );
}

#[tokio::test]
async fn test_cancel_honored_by_worker() {
    let td = start_dispatcher();
    let job_id = td
        .dispatcher
        .submit_job(workspace_build(&[], &[]))
        .await
        .unwrap();

    let mut worker = td.connect_worker("w1", &[]).await;
    worker.expect_config().await;
    worker.provision_log("working").await;

    td.dispatcher.cancel_job(job_id).await.unwrap();
    assert_eq!(
        td.dispatcher.get_job(job_id).await.unwrap().status,
        JobStatus::Canceling
    );

    worker.expect_cancel().await;
    worker.provision_canceled().await;

    let job = td
        .wait_for_status(job_id, JobStatus::Canceled, TIMEOUT)
        .await;
    assert!(job.canceled_at.is_some());
    assert!(job.error.is_none());
    assert_eq!(job.events.len(), 1);
}

#[tokio::test]
async fn test_cancel_is_forwarded_once() {
    let td = start_dispatcher();
    let job_id = td
        .dispatcher
        .submit_job(workspace_build(&[], &[]))
        .await
        .unwrap();

    let mut worker = td.connect_worker("w1", &[]).await;
    worker.expect_config().await;

    td.dispatcher.cancel_job(job_id).await.unwrap();
    td.dispatcher.cancel_job(job_id).await.unwrap();
    worker.expect_cancel().await;
    assert!(worker.try_recv(Duration::from_millis(100)).await.is_none());

    worker.provision_canceled().await;
    td.wait_for_status(job_id, JobStatus::Canceled, TIMEOUT)
        .await;
}

#[tokio::test]
async fn test_complete_after_cancel_counts_as_success() {
    let td = start_dispatcher();
    let job_id = td
        .dispatcher
        .submit_job(workspace_build(&[], &[]))
        .await
        .unwrap();

    let mut worker = td.connect_worker("w1", &[]).await;
    worker.expect_config().await;

    // The worker finished before it saw the cancellation
    td.dispatcher.cancel_job(job_id).await.unwrap();
    worker.provision_complete(vec![resource("dev", b"i-1")]).await;

    let job = td
        .wait_for_status(job_id, JobStatus::Succeeded, TIMEOUT)
        .await;
    assert!(job.result.is_some());
    assert!(job.error.is_none());
}

#[tokio::test]
async fn test_cancellation_timeout_fails_job_and_closes_session() {
    let td = start_dispatcher();
    let job_id = td
        .dispatcher
        .submit_job(workspace_build(&[], &[]))
        .await
        .unwrap();

    let mut worker = td.connect_worker("stubborn", &[]).await;
    let worker_id = worker.worker_id;
    worker.expect_config().await;

    td.dispatcher.cancel_job(job_id).await.unwrap();
    worker.expect_cancel().await;
    // Never acknowledge

    let job = td.wait_for_status(job_id, JobStatus::Failed, TIMEOUT).await;
    assert_eq!(job.error.unwrap().kind, FailureKind::CancellationTimeout);

    assert!(worker.closed_within(TIMEOUT).await);
    let dispatcher = td.dispatcher.clone();
    assert_eventually(
        || {
            let dispatcher = dispatcher.clone();
            async move {
                dispatcher
                    .list_workers()
                    .await
                    .iter()
                    .all(|w| w.id != worker_id)
            }
        },
        TIMEOUT,
        "unresponsive session should be removed",
    )
    .await;
}

#[tokio::test]
async fn test_cancel_during_parse_waits_for_parse() {
    let td = start_dispatcher();
    let job_id = td
        .dispatcher
        .submit_job(template_import(&[]))
        .await
        .unwrap();

    let mut worker = td.connect_worker("w1", &[]).await;
    worker.expect_parse().await;

    td.dispatcher.cancel_job(job_id).await.unwrap();
    worker.parse_complete(vec![schema("region", None)]).await;

    let job = td
        .wait_for_status(job_id, JobStatus::Canceled, TIMEOUT)
        .await;
    assert!(job.result.is_none());
    // The planning step is skipped
    assert!(worker.try_recv(Duration::from_millis(200)).await.is_none());
}

#[tokio::test]
async fn test_exchange_timeout() {
    let config = test_dispatch_config().with_max_exchange_duration(Duration::from_millis(200));
    let td = TestDispatcher::start(config);
    let job_id = td
        .dispatcher
        .submit_job(workspace_build(&[], &[]))
        .await
        .unwrap();

    let mut worker = td.connect_worker("slow", &[]).await;
    worker.expect_config().await;
    worker.provision_log("still going").await;

    let job = td.wait_for_status(job_id, JobStatus::Failed, TIMEOUT).await;
    assert_eq!(job.error.unwrap().kind, FailureKind::Timeout);
    assert!(worker.closed_within(TIMEOUT).await);
}

#[tokio::test]
async fn test_timeout_closes_worker_that_stopped_reading() {
    let config = test_dispatch_config().with_max_exchange_duration(Duration::from_millis(200));
    let td = TestDispatcher::start(config);

    // The pipe holds far less than one Config frame and the worker never
    // reads, so the write to it never finishes
    let (server_io, mut worker_io) = tokio::io::duplex(64);
    let channel: ServerChannel =
        Box::new(FramedChannel::<ServerMessage, WorkerMessage, _>::new(server_io));
    td.dispatcher
        .register_worker("stuck", Vec::<String>::new(), channel)
        .await;

    let blob = "x".repeat(4096);
    let job_id = td
        .dispatcher
        .submit_job(workspace_build(&[("blob", blob.as_str())], &[]))
        .await
        .unwrap();

    let job = td.wait_for_status(job_id, JobStatus::Failed, TIMEOUT).await;
    assert_eq!(job.error.unwrap().kind, FailureKind::Timeout);

    // Writes fail once the control plane has dropped its end
    let dropped = tokio::time::timeout(TIMEOUT, async {
        while worker_io.write_all(b"\0").await.is_ok() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(dropped.is_ok(), "connection should be closed after the timeout");
    assert!(td.dispatcher.list_workers().await.is_empty());
}

#[tokio::test]
async fn test_dispatch_without_idle_sessions_assigns_nothing() {
    let td = start_dispatcher();
    td.dispatcher
        .submit_job(workspace_build(&[], &[]))
        .await
        .unwrap();
    let second = td
        .dispatcher
        .submit_job(workspace_build(&[], &[]))
        .await
        .unwrap();

    let mut worker = td.connect_worker("w1", &[]).await;
    worker.expect_config().await;

    assert_eq!(td.dispatcher.dispatch_pending().await, 0);
    assert_eq!(
        td.dispatcher.get_job(second).await.unwrap().status,
        JobStatus::Pending
    );
}

#[tokio::test]
async fn test_gpu_job_waits_for_gpu_worker() {
    let td = start_dispatcher();
    let job_id = td
        .dispatcher
        .submit_job(workspace_build(&[], &["gpu"]))
        .await
        .unwrap();

    let mut cpu = td.connect_worker("cpu", &["cpu"]).await;
    assert!(cpu.try_recv(Duration::from_millis(200)).await.is_none());
    assert_eq!(
        td.dispatcher.get_job(job_id).await.unwrap().status,
        JobStatus::Pending
    );

    let mut gpu = td.connect_worker("gpu", &["gpu", "fast"]).await;
    gpu.expect_config().await;
    assert_eq!(
        td.dispatcher.get_job(job_id).await.unwrap().assigned_worker,
        Some(gpu.worker_id)
    );
    assert!(cpu.try_recv(Duration::from_millis(100)).await.is_none());
}

#[tokio::test]
async fn test_untagged_job_runs_on_any_worker() {
    let td = start_dispatcher();
    let mut worker = td.connect_worker("tagged", &["gpu", "arm64"]).await;

    let job_id = td
        .dispatcher
        .submit_job(workspace_build(&[], &[]))
        .await
        .unwrap();
    worker.expect_config().await;
    assert_eq!(
        td.dispatcher.get_job(job_id).await.unwrap().assigned_worker,
        Some(worker.worker_id)
    );
}

#[tokio::test]
async fn test_one_job_per_session() {
    let td = start_dispatcher();
    let first = td
        .dispatcher
        .submit_job(workspace_build(&[], &[]))
        .await
        .unwrap();
    let second = td
        .dispatcher
        .submit_job(workspace_build(&[], &[]))
        .await
        .unwrap();

    let mut worker = td.connect_worker("w1", &[]).await;
    worker.expect_config().await;
    assert!(worker.try_recv(Duration::from_millis(200)).await.is_none());
    assert_eq!(
        td.dispatcher.get_job(second).await.unwrap().status,
        JobStatus::Pending
    );

    worker.provision_complete(vec![]).await;
    td.wait_for_status(first, JobStatus::Succeeded, TIMEOUT)
        .await;

    // Released session picks up the next job in FIFO order
    worker.expect_config().await;
    let job = td.dispatcher.get_job(second).await.unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.assigned_worker, Some(worker.worker_id));
}

#[tokio::test]
async fn test_concurrent_workers_never_share_a_job() {
    let td = start_dispatcher();
    let mut ids = Vec::new();
    for _ in 0..6 {
        ids.push(
            td.dispatcher
                .submit_job(workspace_build(&[], &[]))
                .await
                .unwrap(),
        );
    }

    let mut workers = Vec::new();
    for i in 0..3 {
        workers.push(td.connect_worker(&format!("w{}", i), &[]).await);
    }

    for _round in 0..2 {
        for worker in workers.iter_mut() {
            worker.expect_config().await;
        }
        let jobs = td.dispatcher.list_jobs().await;
        let running: Vec<_> = jobs
            .iter()
            .filter(|j| j.status == JobStatus::Running)
            .collect();
        assert_eq!(running.len(), 3);
        let mut bound: Vec<_> = running.iter().filter_map(|j| j.assigned_worker).collect();
        bound.sort();
        bound.dedup();
        assert_eq!(bound.len(), 3, "each worker runs exactly one job");

        for worker in workers.iter_mut() {
            worker.provision_complete(vec![]).await;
        }
    }

    for id in ids {
        td.wait_for_status(id, JobStatus::Succeeded, TIMEOUT).await;
    }
}

#[tokio::test]
async fn test_deregister_busy_worker_drains() {
    let td = start_dispatcher();
    let job_id = td
        .dispatcher
        .submit_job(workspace_build(&[], &[]))
        .await
        .unwrap();

    let mut worker = td.connect_worker("w1", &[]).await;
    let worker_id = worker.worker_id;
    worker.expect_config().await;

    td.dispatcher.deregister(worker_id).await.unwrap();
    let workers = td.dispatcher.list_workers().await;
    assert_eq!(workers[0].state, SessionState::Draining);

    // A new job is not given to the draining worker
    td.dispatcher
        .submit_job(workspace_build(&[], &[]))
        .await
        .unwrap();

    worker.provision_complete(vec![]).await;
    td.wait_for_status(job_id, JobStatus::Succeeded, TIMEOUT)
        .await;

    assert!(worker.closed_within(TIMEOUT).await);
    assert!(td.dispatcher.list_workers().await.is_empty());
    assert!(matches!(
        td.dispatcher.deregister(worker_id).await,
        Err(ProvisionerError::WorkerNotFound(_))
    ));
}

#[tokio::test]
async fn test_idle_disconnect_removes_session() {
    let td = start_dispatcher();
    let worker = td.connect_worker("w1", &[]).await;
    assert_eq!(td.dispatcher.list_workers().await.len(), 1);

    worker.disconnect().await;
    let dispatcher = td.dispatcher.clone();
    assert_eventually(
        || {
            let dispatcher = dispatcher.clone();
            async move { dispatcher.list_workers().await.is_empty() }
        },
        TIMEOUT,
        "idle session should be removed after disconnect",
    )
    .await;
}

#[tokio::test]
async fn test_submit_validation() {
    let td = start_dispatcher();

    let mut empty_hash = workspace_build(&[], &[]);
    empty_hash.archive = archive("");
    assert!(matches!(
        td.dispatcher.submit_job(empty_hash).await,
        Err(ProvisionerError::InvalidInput(_))
    ));

    let duplicate = workspace_build(&[("region", "us"), ("region", "eu")], &[]);
    assert!(matches!(
        td.dispatcher.submit_job(duplicate).await,
        Err(ProvisionerError::InvalidInput(_))
    ));

    let unnamed = workspace_build(&[("", "x")], &[]);
    assert!(matches!(
        td.dispatcher.submit_job(unnamed).await,
        Err(ProvisionerError::InvalidInput(_))
    ));

    let blank_tag = SubmitJob {
        required_tags: tags(&[" "]),
        ..workspace_build(&[], &[])
    };
    assert!(matches!(
        td.dispatcher.submit_job(blank_tag).await,
        Err(ProvisionerError::InvalidInput(_))
    ));

    let too_large = SubmitJob {
        archive: ArchiveRef {
            hash: "big".to_string(),
            size_bytes: td.dispatcher.config().max_archive_bytes + 1,
        },
        ..workspace_build(&[], &[])
    };
    assert!(matches!(
        td.dispatcher.submit_job(too_large).await,
        Err(ProvisionerError::ArchiveTooLarge { .. })
    ));

    assert!(td.dispatcher.list_jobs().await.is_empty());
}

#[tokio::test]
async fn test_queue_full() {
    let td = TestDispatcher::start(test_dispatch_config().with_max_jobs(1));
    td.dispatcher
        .submit_job(workspace_build(&[], &[]))
        .await
        .unwrap();
    assert!(matches!(
        td.dispatcher.submit_job(workspace_build(&[], &[])).await,
        Err(ProvisionerError::QueueFull)
    ));
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let td = start_dispatcher();
    let id = uuid::Uuid::new_v4();
    assert!(matches!(
        td.dispatcher.get_job(id).await,
        Err(ProvisionerError::JobNotFound(_))
    ));
    assert!(matches!(
        td.dispatcher.cancel_job(id).await,
        Err(ProvisionerError::JobNotFound(_))
    ));
    assert!(matches!(
        td.dispatcher.stream_events(id, 1).await,
        Err(ProvisionerError::JobNotFound(_))
    ));
}

#[tokio::test]
async fn test_stream_events_live_and_replay() {
    let td = start_dispatcher();
    let job_id = td
        .dispatcher
        .submit_job(workspace_build(&[("region", "us")], &[]))
        .await
        .unwrap();

    let live = td.dispatcher.stream_events(job_id, 1).await.unwrap();

    let mut worker = td.connect_worker("w1", &[]).await;
    worker.expect_config().await;
    for i in 0..25 {
        worker.provision_log(&format!("line {}", i)).await;
    }
    worker.provision_complete(vec![]).await;

    let events: Vec<LogEvent> = tokio::time::timeout(TIMEOUT, live.collect())
        .await
        .expect("stream ends once the job is terminal");
    let seqs: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    assert_eq!(seqs, (1..=25).collect::<Vec<u64>>());

    // Restart from where a reader left off
    let resumed: Vec<LogEvent> = td
        .dispatcher
        .stream_events(job_id, 21)
        .await
        .unwrap()
        .collect()
        .await;
    let seqs: Vec<u64> = resumed.iter().map(|e| e.sequence).collect();
    assert_eq!(seqs, vec![21, 22, 23, 24, 25]);
}

#[tokio::test]
async fn test_block_policy_applies_backpressure() {
    let config = test_dispatch_config().with_events(EventBufferConfig {
        capacity: 2,
        policy: OverflowPolicy::Block,
    });
    let td = TestDispatcher::start(config);
    let job_id = td
        .dispatcher
        .submit_job(workspace_build(&[], &[]))
        .await
        .unwrap();

    let mut worker = td.connect_worker("w1", &[]).await;
    worker.expect_config().await;
    for i in 0..6 {
        worker.provision_log(&format!("line {}", i)).await;
    }
    worker.provision_complete(vec![]).await;

    // Without a reader the job cannot finish
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        td.dispatcher.get_job(job_id).await.unwrap().status,
        JobStatus::Running
    );

    let events: Vec<LogEvent> = tokio::time::timeout(
        TIMEOUT,
        td.dispatcher.stream_events(job_id, 1).await.unwrap().collect(),
    )
    .await
    .expect("reader drains the log");
    let seqs: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    assert_eq!(seqs, (1..=6).collect::<Vec<u64>>());

    td.wait_for_status(job_id, JobStatus::Succeeded, TIMEOUT)
        .await;
}

#[tokio::test]
async fn test_garbage_collection_drops_read_results() {
    let mut config = test_dispatch_config();
    config.job_retention = Duration::ZERO;
    let td = TestDispatcher::start(config);

    let job_id = td
        .dispatcher
        .submit_job(workspace_build(&[], &["none"]))
        .await
        .unwrap();
    td.dispatcher.cancel_job(job_id).await.unwrap();

    // Unread results are kept
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(td.dispatcher.collect_garbage().await, 0);

    td.dispatcher.get_job(job_id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(td.dispatcher.collect_garbage().await, 1);
    assert!(td.dispatcher.get_job(job_id).await.is_err());
}

#[tokio::test]
async fn test_shutdown_cancels_running_jobs() {
    let td = start_dispatcher();
    let job_id = td
        .dispatcher
        .submit_job(workspace_build(&[("a", "1")], &[]))
        .await
        .unwrap();

    let mut worker = td.connect_worker("w1", &[]).await;
    worker.expect_config().await;

    td.shutdown.cancel();
    worker.expect_cancel().await;
    worker.provision_canceled().await;

    td.wait_for_status(job_id, JobStatus::Canceled, TIMEOUT)
        .await;
}

#[tokio::test]
async fn test_parameters_reach_worker_in_order() {
    let td = start_dispatcher();
    let request = SubmitJob {
        kind: JobKind::WorkspaceBuild,
        archive: archive("abc123"),
        parameters: vec![
            ParameterValue::new("zone", "b"),
            ParameterValue::new("image", "ubuntu"),
            ParameterValue::new("cpu", "4"),
        ],
        required_tags: tags(&[]),
    };
    td.dispatcher.submit_job(request).await.unwrap();

    let mut worker = td.connect_worker("w1", &[]).await;
    let config = worker.expect_config().await;
    let names: Vec<&str> = config.parameters.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["zone", "image", "cpu"]);
}

#[tokio::test]
async fn test_blocked_log_still_honors_exchange_deadline() {
    let config = test_dispatch_config()
        .with_max_exchange_duration(Duration::from_millis(300))
        .with_events(EventBufferConfig {
            capacity: 1,
            policy: OverflowPolicy::Block,
        });
    let td = TestDispatcher::start(config);
    let job_id = td
        .dispatcher
        .submit_job(workspace_build(&[], &[]))
        .await
        .unwrap();

    let mut worker = td.connect_worker("chatty", &[]).await;
    worker.expect_config().await;
    for i in 0..3 {
        worker.provision_log(&format!("line {}", i)).await;
    }

    let job = td.wait_for_status(job_id, JobStatus::Failed, TIMEOUT).await;
    assert_eq!(job.error.unwrap().kind, FailureKind::Timeout);
    assert_eq!(job.events.len(), 1);
}
