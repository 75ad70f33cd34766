//! Integration tests for the full job flow.
//!
//! Tests: Orchestrator → broker → worker Consumer → Registry → Executor →
//! status update → status Consumer → StatusApplier → JobStore
//!
//! Verifies:
//! - a submitted job ends `COMPLETED` with its result reference
//! - failures are requeued until they succeed (or hit the retry bound)
//! - undecodable messages go to the DLQ without reaching a handler
//! - handler concurrency stays within the consumer bound

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Map, Value as JsonValue};

    use castline_core::{Job, JobId, JobStatus, TraceId};
    use castline_events::{BrokerChannel, InMemoryBroker, OutgoingMessage, SubmitMessage};

    use crate::blob::InMemoryBlobStore;
    use crate::broker::{Consumer, ConsumerOptions, HandlerError, MessageHandler, Publisher, TopologyManager};
    use crate::jobs::{InMemoryJobStore, JobRequest, JobStore, Orchestrator, StatusApplier};
    use crate::pipelines::{
        run_pipeline, AssetCache, ExclusiveResource, ExecutorError, JobDescriptor, JobRegistry,
        PipelineWorker, RecastDescriptor, RecastInput, RecastInputs, Transform,
    };
    use crate::test_support::{fast_config, wait_until};

    /// Concatenates source and template; fails the first `failures` calls.
    struct FlakyConcat {
        failures: AtomicUsize,
        calls: AtomicUsize,
    }

    impl FlakyConcat {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicUsize::new(failures),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Transform for FlakyConcat {
        fn run(&self, _job_id: JobId, inputs: &RecastInputs) -> Result<Vec<u8>, ExecutorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ExecutorError::Transform("device busy".to_string()));
            }
            Ok([inputs.source.as_slice(), inputs.template.as_slice()].concat())
        }
    }

    struct Harness {
        broker: InMemoryBroker,
        topology: Arc<TopologyManager<InMemoryBroker>>,
        store: Arc<InMemoryJobStore>,
        blobs: Arc<InMemoryBlobStore>,
        orchestrator: Orchestrator<InMemoryBroker, Arc<InMemoryJobStore>>,
        worker: Consumer<InMemoryBroker>,
        status: Consumer<InMemoryBroker>,
    }

    impl Harness {
        async fn start(transform: Arc<dyn Transform>, retry_max: Option<u32>) -> Self {
            let broker = InMemoryBroker::new();
            let topology = Arc::new(TopologyManager::new(broker.clone(), fast_config()));
            topology.start().await;
            let publisher = Publisher::new(topology.clone());

            let store = InMemoryJobStore::arc();
            let blobs = Arc::new(InMemoryBlobStore::new("http://cdn"));
            blobs.insert("media", "uploads/face.JPG", b"source".to_vec());
            blobs.insert("media", "templates/t1.jpg", b"template".to_vec());

            let mut registry = JobRegistry::new();
            registry.register(JobDescriptor::Recast(RecastDescriptor::new(
                blobs.clone(),
                Arc::new(AssetCache::new(1 << 20)),
                transform,
            )));

            let options = ConsumerOptions {
                concurrency: 4,
                retry_backoff: Duration::from_millis(1),
                drain_timeout: Duration::from_secs(2),
                consumer_tag: "it".to_string(),
            };
            let worker = Consumer::new(topology.clone(), options.clone());
            worker
                .consume(
                    &topology.config().submit_queue,
                    PipelineWorker::new(Arc::new(registry), publisher.clone(), ExclusiveResource::new())
                        .with_retry_max(retry_max),
                )
                .unwrap();

            let status = Consumer::new(topology.clone(), options);
            status
                .consume(&topology.config().update_queue, StatusApplier::new(store.clone()))
                .unwrap();

            let orchestrator = Orchestrator::new(store.clone(), publisher, 6);
            Self {
                broker,
                topology,
                store,
                blobs,
                orchestrator,
                worker,
                status,
            }
        }

        async fn wait_for(&self, id: JobId, status: JobStatus) -> Job {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
            loop {
                if let Some(job) = self.store.find_by_id(id).await.unwrap() {
                    if job.status == status {
                        return job;
                    }
                }
                assert!(tokio::time::Instant::now() < deadline, "job {id} never reached {status}");
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        async fn shutdown(self) {
            self.worker.stop().await;
            self.status.stop().await;
            self.topology.close().await;
        }
    }

    fn recast_input() -> Map<String, JsonValue> {
        json!({
            "source_image_bucket": "media",
            "source_image_key": "uploads/face.JPG",
            "template_image_bucket": "media",
            "template_image_key": "templates/t1.jpg",
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    fn recast_request(job_id: JobId) -> JobRequest {
        JobRequest {
            job_id,
            job_type: "recast".to_string(),
            input: recast_input(),
        }
    }

    #[tokio::test]
    async fn submitted_recast_job_completes_with_result_url() {
        let transform = FlakyConcat::new(0);
        let h = Harness::start(transform.clone(), None).await;
        let (trace, job_id) = (TraceId::new(), JobId::new());

        let receipt = h.orchestrator.submit(trace, vec![recast_request(job_id)]).await.unwrap();
        assert_eq!(receipt.job_ids, vec![job_id]);

        let job = h.wait_for(job_id, JobStatus::Completed).await;
        let url = job.result_url.unwrap();
        assert!(url.starts_with("http://cdn/media/recast_results/"), "{url}");
        assert!(url.ends_with(".jpg"));
        assert_eq!(job.message.as_deref(), Some("success"));
        assert_eq!(job.trace_id, trace);

        let key = url.trim_start_matches("http://cdn/media/");
        assert_eq!(h.blobs.object("media", key).unwrap(), b"sourcetemplate");
        assert_eq!(transform.calls(), 1);
        h.shutdown().await;
    }

    #[tokio::test]
    async fn job_failing_n_times_completes_after_n_plus_one_runs() {
        let transform = FlakyConcat::new(3);
        let h = Harness::start(transform.clone(), None).await;
        let job_id = JobId::new();

        h.orchestrator
            .submit(TraceId::new(), vec![recast_request(job_id)])
            .await
            .unwrap();

        h.wait_for(job_id, JobStatus::Completed).await;
        assert_eq!(transform.calls(), 4);
        assert!(h.broker.stats().requeued >= 3);
        assert_eq!(h.broker.ready_count("pipelines.queue.dlq"), Some(0));
        h.shutdown().await;
    }

    #[tokio::test]
    async fn retry_bound_marks_job_failed_and_dead_letters_it() {
        let transform = FlakyConcat::new(usize::MAX);
        let h = Harness::start(transform.clone(), Some(2)).await;
        let job_id = JobId::new();

        h.orchestrator
            .submit(TraceId::new(), vec![recast_request(job_id)])
            .await
            .unwrap();

        let job = h.wait_for(job_id, JobStatus::Failed).await;
        assert!(job.message.unwrap().contains("device busy"));
        wait_until(|| h.broker.ready_count("pipelines.queue.dlq") == Some(1)).await;
        assert_eq!(transform.calls(), 2);
        h.shutdown().await;
    }

    #[tokio::test]
    async fn undecodable_submit_goes_to_dlq_only() {
        let transform = FlakyConcat::new(0);
        let h = Harness::start(transform.clone(), None).await;

        h.topology
            .channel()
            .unwrap()
            .publish(
                "pipelines.exchange",
                "pipelines.submit",
                OutgoingMessage {
                    body: br#"{"job_id": 42"#.to_vec(),
                    content_type: "application/json".to_string(),
                    persistent: true,
                },
            )
            .await
            .unwrap();

        wait_until(|| h.broker.ready_count("pipelines.queue.dlq") == Some(1)).await;
        assert_eq!(h.broker.ready_count("pipelines.queue"), Some(0));
        assert_eq!(h.broker.stats().acked, 0);
        assert_eq!(transform.calls(), 0);
        h.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_job_type_is_requeued_not_dead_lettered() {
        let h = Harness::start(FlakyConcat::new(0), None).await;
        let job_id = JobId::new();

        h.orchestrator
            .submit(
                TraceId::new(),
                vec![JobRequest {
                    job_id,
                    job_type: "upscale".to_string(),
                    input: Map::new(),
                }],
            )
            .await
            .unwrap();

        wait_until(|| h.broker.stats().requeued >= 2).await;
        assert_eq!(h.broker.ready_count("pipelines.queue.dlq"), Some(0));
        let job = h.store.find_by_id(job_id).await.unwrap().unwrap();
        assert!(!job.status.is_terminal());
        h.shutdown().await;
    }

    struct Slow {
        active: AtomicUsize,
        peak: AtomicUsize,
        done: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for Slow {
        type Message = SubmitMessage;

        async fn handle(&self, _message: SubmitMessage) -> Result<(), HandlerError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(15)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn handler_concurrency_stays_within_bound() {
        const BOUND: usize = 4;
        let broker = InMemoryBroker::new();
        let topology = Arc::new(TopologyManager::new(broker.clone(), fast_config()));
        topology.start().await;
        let publisher = Publisher::new(topology.clone());

        let slow = Arc::new(Slow {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            done: AtomicUsize::new(0),
        });
        let consumer = Consumer::new(
            topology.clone(),
            ConsumerOptions {
                concurrency: BOUND,
                ..ConsumerOptions::default()
            },
        );
        consumer.consume("pipelines.queue", slow.clone()).unwrap();

        for _ in 0..BOUND * 3 {
            let message = SubmitMessage::new(TraceId::new(), JobId::new(), "recast", Map::new());
            publisher.publish_submit(&message).await.unwrap();
        }

        wait_until(|| slow.done.load(Ordering::SeqCst) == BOUND * 3).await;
        let peak = slow.peak.load(Ordering::SeqCst);
        assert!(peak <= BOUND, "peak {peak} exceeded bound {BOUND}");
        assert!(peak > 1, "handlers never overlapped");
        consumer.stop().await;
    }

    #[tokio::test]
    async fn concurrent_jobs_sharing_a_template_both_succeed() {
        let blobs = Arc::new(InMemoryBlobStore::new("http://cdn"));
        blobs.insert("media", "uploads/face.JPG", b"source".to_vec());
        blobs.insert("media", "templates/t1.jpg", b"template".to_vec());
        let descriptor = RecastDescriptor::new(blobs.clone(), Arc::new(AssetCache::new(1 << 20)), FlakyConcat::new(0));
        let resource = ExclusiveResource::new();
        let input = RecastInput::parse(&recast_input()).unwrap();

        let a = Arc::new(descriptor.create(JobId::new(), input.clone()));
        let b = Arc::new(descriptor.create(JobId::new(), input.clone()));
        let (ra, rb) = tokio::join!(run_pipeline(a, &resource), run_pipeline(b, &resource));
        assert!(ra.is_ok() && rb.is_ok());
        // two sources, at most two template fetches (duplicate fetch is allowed)
        let fetched = blobs.get_count();
        assert!((3..=4).contains(&fetched), "{fetched}");

        // the template is now cached: one more job fetches only its source
        let c = Arc::new(descriptor.create(JobId::new(), input));
        run_pipeline(c, &resource).await.unwrap();
        assert_eq!(blobs.get_count(), fetched + 1);
    }
}
