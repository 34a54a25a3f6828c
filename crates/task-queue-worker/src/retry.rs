//! Decides what happens after a task attempt.
//!
//! ```text
//! RUNNING -> SUCCEEDED
//!         -> RETRYING   (message republished with retries + 1)
//!         -> FAILED     (error stored, or max retries exceeded)
//! ```

use crate::handler::{Outcome, RetryRequest};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use task_queue_core::{
    compute_delay, Enqueuer, ErrorKind, JitterSource, Kwargs, Result, RetryPolicy, TaskAttempt,
    TaskError, TaskException, TaskId, TaskMessage, ThreadRngJitter,
};
use tracing::{error, info};

/// Maps a raised exception to the kind matched against the autoretry sets
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, exception: &TaskException) -> ErrorKind;
}

/// Uses the exception's own kind
#[derive(Debug, Default, Clone, Copy)]
pub struct KindClassifier;

impl ErrorClassifier for KindClassifier {
    fn classify(&self, exception: &TaskException) -> ErrorKind {
        exception.kind.clone()
    }
}

/// Final state of one attempt
#[derive(Debug)]
pub enum Disposition {
    Succeeded(Value),
    Retrying {
        /// Message published for the next attempt
        message: TaskMessage,
        countdown: u64,
        exception: Option<TaskException>,
        throw: bool,
    },
    Failed(TaskError),
    Revoked(TaskId),
}

impl Disposition {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Disposition::Retrying { .. })
    }

    /// Local view of the attempt for the code that ran it.
    ///
    /// A retry surfaces as [`TaskError::Retry`] unless it was requested with
    /// `throw` disabled, in which case it reads as `Ok(None)`.
    pub fn into_result(self) -> Result<Option<Value>> {
        match self {
            Disposition::Succeeded(value) => Ok(Some(value)),
            Disposition::Retrying { throw: false, .. } => Ok(None),
            Disposition::Retrying {
                message,
                countdown,
                exception,
                ..
            } => Err(TaskError::Retry {
                task_id: message.id,
                countdown,
                exception,
            }),
            Disposition::Failed(err) => Err(err),
            Disposition::Revoked(task_id) => Err(TaskError::Revoked(task_id)),
        }
    }
}

pub struct RetryController {
    enqueuer: Arc<dyn Enqueuer>,
    classifier: Arc<dyn ErrorClassifier>,
    jitter: Mutex<Box<dyn JitterSource>>,
}

impl RetryController {
    pub fn new(enqueuer: Arc<dyn Enqueuer>) -> Self {
        RetryController {
            enqueuer,
            classifier: Arc::new(KindClassifier),
            jitter: Mutex::new(Box::new(ThreadRngJitter)),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_jitter(mut self, jitter: Box<dyn JitterSource>) -> Self {
        self.jitter = Mutex::new(jitter);
        self
    }

    /// Settle the outcome of running `message` under `policy`
    pub async fn on_outcome(
        &self,
        message: &TaskMessage,
        policy: &RetryPolicy,
        outcome: Outcome,
    ) -> Result<Disposition> {
        let attempt = TaskAttempt::from_message(message, policy.max_retries);

        match outcome {
            Outcome::Success(value) => {
                info!(
                    task_id = %attempt.task_id,
                    "Task {}[{}] succeeded", attempt.task_name, attempt.task_id
                );
                Ok(Disposition::Succeeded(value))
            }
            Outcome::Retry(request) => self.retry(message, &attempt, policy, request, false).await,
            Outcome::Failure(exception) => {
                let kind = self.classifier.classify(&exception);
                if !policy.should_autoretry(&kind) {
                    error!(
                        task_id = %attempt.task_id,
                        "Task {}[{}] raised unexpected: {}", attempt.task_name, attempt.task_id, exception
                    );
                    return Ok(Disposition::Failed(TaskError::Failed(exception)));
                }

                let request = RetryRequest {
                    exception: Some(exception),
                    countdown: policy.retry_kwargs.countdown,
                    max_retries: policy.retry_kwargs.max_retries,
                    ..RetryRequest::default()
                };
                self.retry(message, &attempt, policy, request, true).await
            }
        }
    }

    async fn retry(
        &self,
        message: &TaskMessage,
        attempt: &TaskAttempt,
        policy: &RetryPolicy,
        request: RetryRequest,
        autoretry: bool,
    ) -> Result<Disposition> {
        let max_retries = request.max_retries.or(attempt.max_retries);
        if let Some(max) = max_retries {
            if attempt.retries >= max {
                error!(
                    task_id = %attempt.task_id,
                    "Task {}[{}] exceeded max retries ({})", attempt.task_name, attempt.task_id, max
                );
                return Ok(Disposition::Failed(TaskError::MaxRetriesExceeded {
                    task_name: attempt.task_name.clone(),
                    task_id: attempt.task_id.clone(),
                    task_args: attempt.args.clone(),
                    task_kwargs: attempt.kwargs.clone(),
                    cause: request.exception,
                }));
            }
        }

        let (args, kwargs) = rebind(attempt, request.args, request.kwargs);
        let countdown = match request.eta {
            Some(eta) => (eta - chrono::Utc::now()).num_seconds().max(0) as u64,
            None => self.countdown(attempt, policy, request.countdown),
        };

        let mut builder = TaskMessage::builder(attempt.task_name.clone())
            .id(attempt.task_id.clone())
            .args(args)
            .kwargs(kwargs)
            .retries(attempt.retries + 1);
        builder = match request.eta {
            Some(eta) => builder.eta(eta),
            None => builder.countdown(countdown)?,
        };
        if let Some(routing_key) = &message.routing_key {
            builder = builder.routing_key(routing_key.clone());
        }
        if let Some(priority) = message.priority {
            builder = builder.priority(priority);
        }
        if let Some(max) = request.max_retries.or(message.max_retries) {
            builder = builder.max_retries(max);
        }
        if let Some(exception) = &request.exception {
            builder = builder.exception(exception);
        }
        let next = builder.build();

        self.enqueuer.publish(next.clone()).await?;

        let reason = request
            .exception
            .as_ref()
            .map_or_else(|| format!("Retry in {}s", countdown), |e| e.to_string());
        info!(
            task_id = %attempt.task_id,
            autoretry,
            "Task {}[{}] retry: {}", attempt.task_name, attempt.task_id, reason
        );

        Ok(Disposition::Retrying {
            message: next,
            countdown,
            exception: request.exception,
            throw: request.throw,
        })
    }

    /// Explicit countdown, else backoff, else the policy's default delay
    fn countdown(&self, attempt: &TaskAttempt, policy: &RetryPolicy, explicit: Option<u64>) -> u64 {
        if let Some(countdown) = explicit {
            return countdown;
        }

        let mut jitter = self.jitter.lock();
        compute_delay(
            attempt.retries,
            policy.retry_backoff,
            policy.retry_backoff_max,
            policy.retry_jitter,
            jitter.as_mut(),
        )
        .unwrap_or(policy.default_retry_delay)
    }
}

/// Arguments for the next attempt.
///
/// New `args` replace the old ones wholesale. `kwargs` given alone are merged
/// over the previous kwargs; given together with `args` they replace them.
fn rebind(
    attempt: &TaskAttempt,
    args: Option<Vec<Value>>,
    kwargs: Option<Kwargs>,
) -> (Vec<Value>, Kwargs) {
    match (args, kwargs) {
        (Some(args), Some(kwargs)) => (args, kwargs),
        (Some(args), None) => (args, attempt.kwargs.clone()),
        (None, Some(kwargs)) => {
            let mut merged = attempt.kwargs.clone();
            merged.extend(kwargs);
            (attempt.args.clone(), merged)
        }
        (None, None) => (attempt.args.clone(), attempt.kwargs.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use task_queue_core::{Backoff, PolicyOverrides, Priority, PublishError, RetryKwargs};

    #[derive(Default)]
    struct RecordingEnqueuer {
        published: Mutex<Vec<TaskMessage>>,
    }

    #[async_trait]
    impl Enqueuer for RecordingEnqueuer {
        async fn publish(&self, message: TaskMessage) -> std::result::Result<(), PublishError> {
            self.published.lock().push(message);
            Ok(())
        }
    }

    struct FailingEnqueuer;

    #[async_trait]
    impl Enqueuer for FailingEnqueuer {
        async fn publish(&self, _: TaskMessage) -> std::result::Result<(), PublishError> {
            Err(PublishError::Transport("connection reset".to_string()))
        }
    }

    /// Always draws the largest allowed value
    struct MaxJitter;

    impl JitterSource for MaxJitter {
        fn below(&mut self, upper: u64) -> u64 {
            upper - 1
        }
    }

    fn controller() -> (Arc<RecordingEnqueuer>, RetryController) {
        let enqueuer = Arc::new(RecordingEnqueuer::default());
        let controller = RetryController::new(enqueuer.clone());
        (enqueuer, controller)
    }

    fn kwargs(pairs: &[(&str, Value)]) -> Kwargs {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn failure(kind: &str) -> Outcome {
        Outcome::Failure(TaskException::new(kind, "boom"))
    }

    #[tokio::test]
    async fn test_success() {
        let (enqueuer, controller) = controller();
        let message = TaskMessage::builder("add").build();

        let disposition = controller
            .on_outcome(&message, &RetryPolicy::default(), Outcome::Success(json!(3)))
            .await
            .unwrap();

        assert_eq!(disposition.into_result().unwrap(), Some(json!(3)));
        assert!(enqueuer.published.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unclassified_failure_is_terminal() {
        let (enqueuer, controller) = controller();
        let message = TaskMessage::builder("add").build();

        let disposition = controller
            .on_outcome(&message, &RetryPolicy::default(), failure("value"))
            .await
            .unwrap();

        assert!(disposition.is_terminal());
        assert!(matches!(disposition, Disposition::Failed(TaskError::Failed(_))));
        assert!(enqueuer.published.lock().is_empty());
    }

    #[tokio::test]
    async fn test_dont_autoretry_for_wins() {
        let (enqueuer, controller) = controller();
        let policy = RetryPolicy::default().merge(
            &PolicyOverrides::new()
                .autoretry_for([ErrorKind::root()])
                .dont_autoretry_for(["type"]),
        );
        let message = TaskMessage::builder("t").build();

        let type_error = controller
            .on_outcome(&message, &policy, failure("type"))
            .await
            .unwrap();
        assert!(matches!(type_error, Disposition::Failed(TaskError::Failed(_))));

        let other = controller
            .on_outcome(&message, &policy, failure("lookup.key"))
            .await
            .unwrap();
        assert!(!other.is_terminal());
        assert_eq!(enqueuer.published.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_autoretry_publishes_next_attempt() {
        let (enqueuer, controller) = controller();
        let policy = RetryPolicy::default().merge(&PolicyOverrides::new().autoretry_for(["io"]));
        let message = TaskMessage::builder("fetch")
            .args(vec![json!("http://x")])
            .routing_key("default")
            .build();

        let disposition = controller
            .on_outcome(&message, &policy, failure("io.timeout"))
            .await
            .unwrap();

        let published = enqueuer.published.lock();
        let next = &published[0];
        assert_eq!(next.id, message.id);
        assert_eq!(next.retries, 1);
        assert_eq!(next.args, message.args);
        assert_eq!(next.routing_key.as_deref(), Some("default"));
        assert_eq!(next.countdown, Some(180));
        assert_eq!(next.exception.as_ref().unwrap().kind().as_str(), "io.timeout");

        match disposition.into_result() {
            Err(TaskError::Retry { countdown, exception, .. }) => {
                assert_eq!(countdown, 180);
                assert_eq!(exception.unwrap().kind.as_str(), "io.timeout");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_max_retries_exceeded_carries_arguments() {
        let (enqueuer, controller) = controller();
        let policy = RetryPolicy::default().merge(&PolicyOverrides::new().autoretry_for(["io"]));
        let message = TaskMessage::builder("fetch")
            .args(vec![json!(1), json!(0)])
            .kwargs(kwargs(&[("verbose", json!(true))]))
            .retries(3)
            .build();

        let disposition = controller
            .on_outcome(&message, &policy, failure("io"))
            .await
            .unwrap();

        match disposition {
            Disposition::Failed(TaskError::MaxRetriesExceeded {
                task_args,
                task_kwargs,
                cause,
                ..
            }) => {
                assert_eq!(task_args, vec![json!(1), json!(0)]);
                assert_eq!(task_kwargs["verbose"], json!(true));
                assert_eq!(cause.unwrap().kind.as_str(), "io");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(enqueuer.published.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unbounded_retries() {
        let (enqueuer, controller) = controller();
        let policy = RetryPolicy::default().merge(&PolicyOverrides::new().max_retries(None));
        let message = TaskMessage::builder("poll").retries(1000).build();

        let disposition = controller
            .on_outcome(&message, &policy, Outcome::Retry(RetryRequest::default()))
            .await
            .unwrap();

        assert!(!disposition.is_terminal());
        assert_eq!(enqueuer.published.lock()[0].retries, 1001);
    }

    #[tokio::test]
    async fn test_call_site_max_retries_is_carried() {
        let (enqueuer, controller) = controller();
        let message = TaskMessage::builder("t").build();

        controller
            .on_outcome(
                &message,
                &RetryPolicy::default(),
                Outcome::Retry(RetryRequest::default().max_retries(10)),
            )
            .await
            .unwrap();

        let next = enqueuer.published.lock()[0].clone();
        assert_eq!(next.max_retries, Some(10));

        // the override keeps applying past the task default of 3
        let later = TaskMessage { retries: 5, ..next };
        let disposition = controller
            .on_outcome(&later, &RetryPolicy::default(), Outcome::Retry(RetryRequest::default()))
            .await
            .unwrap();
        assert!(!disposition.is_terminal());
    }

    #[tokio::test]
    async fn test_rebinding_arguments() {
        let (enqueuer, controller) = controller();
        let message = TaskMessage::builder("t")
            .args(vec![json!(1), json!(2)])
            .kwargs(kwargs(&[("a", json!(1)), ("b", json!(2))]))
            .build();
        let policy = RetryPolicy::default();

        let requests = vec![
            RetryRequest::default().args(vec![json!("x")]),
            RetryRequest::default().kwargs(kwargs(&[("b", json!(20)), ("c", json!(30))])),
            RetryRequest::default()
                .args(vec![])
                .kwargs(kwargs(&[("z", json!(0))])),
            RetryRequest::default(),
        ];
        for request in requests {
            controller
                .on_outcome(&message, &policy, Outcome::Retry(request))
                .await
                .unwrap();
        }

        let published = enqueuer.published.lock();
        assert_eq!(published[0].args, vec![json!("x")]);
        assert_eq!(published[0].kwargs, message.kwargs);

        assert_eq!(published[1].args, message.args);
        assert_eq!(
            published[1].kwargs,
            kwargs(&[("a", json!(1)), ("b", json!(20)), ("c", json!(30))])
        );

        assert!(published[2].args.is_empty());
        assert_eq!(published[2].kwargs, kwargs(&[("z", json!(0))]));

        assert_eq!(published[3].args, message.args);
        assert_eq!(published[3].kwargs, message.kwargs);
    }

    #[tokio::test]
    async fn test_explicit_countdown_beats_backoff() {
        let (enqueuer, controller) = controller();
        let policy = RetryPolicy::default().merge(&PolicyOverrides::new().retry_backoff(true));
        let message = TaskMessage::builder("t").retries(2).build();

        controller
            .on_outcome(&message, &policy, Outcome::Retry(RetryRequest::default().countdown(7)))
            .await
            .unwrap();

        assert_eq!(enqueuer.published.lock()[0].countdown, Some(7));
    }

    #[tokio::test]
    async fn test_out_of_range_countdown_is_an_error() {
        let (enqueuer, controller) = controller();
        let message = TaskMessage::builder("t").build();

        for countdown in [u64::MAX, 100_000_000_000_000_000] {
            let err = controller
                .on_outcome(
                    &message,
                    &RetryPolicy::default(),
                    Outcome::Retry(RetryRequest::default().countdown(countdown)),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, TaskError::InvalidCountdown(c) if c == countdown));
        }

        let policy = RetryPolicy::default().merge(
            &PolicyOverrides::new()
                .autoretry_for(["io"])
                .default_retry_delay(u64::MAX),
        );
        let err = controller
            .on_outcome(&message, &policy, failure("io"))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidCountdown(_)));

        assert!(enqueuer.published.lock().is_empty());
    }

    #[tokio::test]
    async fn test_retry_keeps_priority() {
        let (enqueuer, controller) = controller();
        let message = TaskMessage::builder("t").priority(Priority::new(9)).build();

        controller
            .on_outcome(&message, &RetryPolicy::default(), Outcome::Retry(RetryRequest::default()))
            .await
            .unwrap();

        let published = enqueuer.published.lock();
        assert_eq!(published[0].priority, Some(Priority::new(9)));
        assert_eq!(published[0].delivery, None);
    }

    #[tokio::test]
    async fn test_backoff_countdowns() {
        let cases: Vec<(Backoff, bool, Vec<u64>)> = vec![
            (Backoff::Enabled, false, vec![1, 2, 4, 8]),
            (Backoff::Factor(2.0), false, vec![2, 4, 8, 16]),
            (Backoff::Factor(-1.0), false, vec![1, 2, 4, 8]),
            (Backoff::Factor(0.1), false, vec![1, 2, 4, 8]),
            (Backoff::Enabled, true, vec![0, 1, 3, 7]),
            (Backoff::Disabled, false, vec![180, 180, 180, 180]),
            (Backoff::Factor(0.0), false, vec![180, 180, 180, 180]),
        ];

        for (backoff, jitter, expected) in cases {
            let enqueuer = Arc::new(RecordingEnqueuer::default());
            let controller =
                RetryController::new(enqueuer.clone()).with_jitter(Box::new(MaxJitter));
            let policy = RetryPolicy::default().merge(
                &PolicyOverrides::new()
                    .autoretry_for(["io"])
                    .max_retries(None)
                    .retry_backoff(backoff)
                    .retry_jitter(jitter),
            );

            for retries in 0..4 {
                let message = TaskMessage::builder("t").retries(retries).build();
                controller
                    .on_outcome(&message, &policy, failure("io"))
                    .await
                    .unwrap();
            }

            let countdowns: Vec<u64> = enqueuer
                .published
                .lock()
                .iter()
                .filter_map(|m| m.countdown)
                .collect();
            assert_eq!(countdowns, expected, "backoff {:?} jitter {}", backoff, jitter);
        }
    }

    #[tokio::test]
    async fn test_retry_kwargs_max_retries_overrides_task() {
        let (_, controller) = controller();
        let policy = RetryPolicy::default().merge(
            &PolicyOverrides::new()
                .autoretry_for(["io"])
                .retry_kwargs(RetryKwargs {
                    max_retries: Some(5),
                    countdown: None,
                }),
        );

        let message = TaskMessage::builder("t").retries(4).build();
        let disposition = controller
            .on_outcome(&message, &policy, failure("io"))
            .await
            .unwrap();
        assert!(!disposition.is_terminal());

        let message = TaskMessage::builder("t").retries(5).build();
        let disposition = controller
            .on_outcome(&message, &policy, failure("io"))
            .await
            .unwrap();
        assert!(matches!(
            disposition,
            Disposition::Failed(TaskError::MaxRetriesExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn test_throw_false_reads_as_ok() {
        let (_, controller) = controller();
        let message = TaskMessage::builder("t").build();

        let disposition = controller
            .on_outcome(
                &message,
                &RetryPolicy::default(),
                Outcome::Retry(RetryRequest::default().throw(false)),
            )
            .await
            .unwrap();

        assert!(!disposition.is_terminal());
        assert_eq!(disposition.into_result().unwrap(), None);
    }

    #[tokio::test]
    async fn test_publish_error_propagates() {
        let controller = RetryController::new(Arc::new(FailingEnqueuer));
        let message = TaskMessage::builder("t").build();

        let err = controller
            .on_outcome(&message, &RetryPolicy::default(), Outcome::Retry(RetryRequest::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Publish(PublishError::Transport(_))));
    }

    #[tokio::test]
    async fn test_classifier_decides_kind() {
        struct Everything;
        impl ErrorClassifier for Everything {
            fn classify(&self, _: &TaskException) -> ErrorKind {
                ErrorKind::new("io")
            }
        }

        let enqueuer = Arc::new(RecordingEnqueuer::default());
        let controller = RetryController::new(enqueuer.clone()).with_classifier(Arc::new(Everything));
        let policy = RetryPolicy::default().merge(&PolicyOverrides::new().autoretry_for(["io"]));

        let disposition = controller
            .on_outcome(&TaskMessage::builder("t").build(), &policy, failure("value"))
            .await
            .unwrap();
        assert!(!disposition.is_terminal());
    }
}
