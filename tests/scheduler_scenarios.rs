//! End-to-end runs through the public API.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use steprunner::environment::{ModelError, ScriptedCompletion, Services};
use steprunner::execution::{
    Attempt, Engine, RetryCounter, RunError, ValidationError, MAX_RETRIES_SENTINEL,
};
use steprunner::flows;
use steprunner::monitoring::{LifecycleKind, RunStatus};
use steprunner::workflow::{
    Event, EventKind, Payload, RunConfig, Step, StepContext, StepResult, TimeoutMode, Workflow,
    WorkflowError, VALIDATION_ERROR,
};

fn kinds(names: &[&str]) -> Vec<EventKind> {
    names.iter().map(|n| EventKind::from(*n)).collect()
}

/// Generic step: emits a fixed list of events on every invocation.
struct Emit {
    name: &'static str,
    accepts: Vec<EventKind>,
    emits: Vec<EventKind>,
    output: Vec<Event>,
    targets: Vec<String>,
}

impl Emit {
    fn new(name: &'static str, accepts: &[&str], emits: &[&str], output: Vec<Event>) -> Self {
        Self {
            name,
            accepts: kinds(accepts),
            emits: kinds(emits),
            output,
            targets: Vec::new(),
        }
    }

    fn with_targets(mut self, targets: &[&str]) -> Self {
        self.targets = targets.iter().map(|t| t.to_string()).collect();
        self
    }
}

#[async_trait]
impl Step for Emit {
    fn name(&self) -> &str {
        self.name
    }

    fn accepts(&self) -> Vec<EventKind> {
        self.accepts.clone()
    }

    fn emits(&self) -> Vec<EventKind> {
        self.emits.clone()
    }

    fn handoff_targets(&self) -> Vec<String> {
        self.targets.clone()
    }

    async fn run(&mut self, ctx: &StepContext, _event: Event) -> StepResult {
        let key = format!("ran_{}", self.name);
        let count: u64 = ctx.state().get_or(&key, 0).await?;
        ctx.state().set(&key, count + 1).await?;
        Ok(self.output.clone())
    }
}

mod reflection {
    use super::*;

    #[tokio::test]
    async fn test_extract_validate_loop() {
        let completion = ScriptedCompletion::new(vec![
            json!("{\"cars\": [{\"color\": \"red\"}"),
            json!("{\"cars\": [{\"color\": \"red\"}, {\"color\": \"blue\"}]}"),
        ]);

        let config = RunConfig::new(3).with_timeout(Duration::from_secs(5));
        let mut engine = Engine::new(flows::build("reflection", &config).unwrap());
        engine.set_config(config);
        engine.set_services(Services::new().with_completion(completion));

        let mut params = Payload::new();
        params.insert("passage".into(), json!("two cars: a red one and a blue one"));
        let handle = engine.start(params);
        let state = handle.state().clone();

        let result = handle.result().await.unwrap();
        assert_eq!(result["cars"].as_array().map(Vec::len), Some(2));
        assert_eq!(state.get("retries").await, Some(json!(2)));
    }

    /// Generates output, bounded by a retry counter.
    struct Generate {
        retry: RetryCounter,
    }

    #[async_trait]
    impl Step for Generate {
        fn name(&self) -> &str {
            "generate"
        }

        fn accepts(&self) -> Vec<EventKind> {
            kinds(&["start", VALIDATION_ERROR])
        }

        fn emits(&self) -> Vec<EventKind> {
            kinds(&["generated", "stop"])
        }

        async fn run(&mut self, ctx: &StepContext, _event: Event) -> StepResult {
            match self.retry.attempt(ctx.state()).await? {
                Attempt::Exhausted(_) => Ok(vec![RetryCounter::sentinel()]),
                Attempt::Proceed(n) => Ok(vec![Event::custom("generated").with("attempt", n)]),
            }
        }
    }

    /// Rejects the first `failures` outputs it sees.
    struct Judge {
        failures: u32,
        seen: u32,
    }

    #[async_trait]
    impl Step for Judge {
        fn name(&self) -> &str {
            "judge"
        }

        fn accepts(&self) -> Vec<EventKind> {
            kinds(&["generated"])
        }

        fn emits(&self) -> Vec<EventKind> {
            kinds(&[VALIDATION_ERROR, "stop"])
        }

        async fn run(&mut self, _ctx: &StepContext, event: Event) -> StepResult {
            self.seen += 1;
            if self.seen <= self.failures {
                return Ok(vec![ValidationError::new("not yet").into_event(Value::Null)]);
            }
            Ok(vec![Event::stop(json!({"accepted": event.get("attempt")}))])
        }
    }

    async fn run_with(failures: u32, max_retries: u32) -> Value {
        let workflow = Workflow::builder("retry")
            .register(Generate {
                retry: RetryCounter::new(max_retries),
            })
            .register(Judge { failures, seen: 0 })
            .build()
            .unwrap();

        let mut engine = Engine::new(workflow);
        engine.set_timeout(Duration::from_secs(5));
        engine.start(Payload::new()).result().await.unwrap()
    }

    #[tokio::test]
    async fn test_retry_ceiling_property() {
        for (failures, max_retries) in [(0, 1), (1, 2), (2, 3), (1, 1), (2, 2), (4, 2)] {
            let result = run_with(failures, max_retries).await;

            if failures < max_retries {
                assert_eq!(
                    result,
                    json!({"accepted": failures + 1}),
                    "k={} m={}",
                    failures,
                    max_retries
                );
            } else {
                assert_eq!(
                    result,
                    json!(MAX_RETRIES_SENTINEL),
                    "k={} m={}",
                    failures,
                    max_retries
                );
            }
        }
    }
}

mod routing {
    use super::*;

    #[tokio::test]
    async fn test_handoff_outside_allow_list() {
        let workflow = Workflow::builder("agents")
            .register(
                Emit::new("a", &["start"], &["handoff"], vec![Event::handoff("c", "escalate")])
                    .with_targets(&["b"]),
            )
            .register(Emit::new("b", &[], &["stop"], vec![Event::stop("b")]))
            .register(Emit::new("c", &["other"], &["stop"], vec![Event::stop("c")]))
            .build()
            .unwrap();

        let handle = Engine::new(workflow).start(Payload::new());
        let state = handle.state().clone();

        match handle.result().await {
            Err(RunError::IllegalHandoff { from, to }) => {
                assert_eq!(from, "a");
                assert_eq!(to, "c");
            }
            other => panic!("expected illegal handoff, got {:?}", other),
        }
        assert!(!state.contains("ran_c").await);
    }

    #[tokio::test]
    async fn test_illegal_handoff_not_hidden_by_later_stop() {
        let workflow = Workflow::builder("agents")
            .register(
                Emit::new(
                    "a",
                    &["start"],
                    &["handoff", "stop"],
                    vec![Event::handoff("c", "escalate"), Event::stop("done")],
                )
                .with_targets(&["b"]),
            )
            .register(Emit::new("b", &[], &["stop"], vec![Event::stop("b")]))
            .register(Emit::new("c", &["other"], &["stop"], vec![Event::stop("c")]))
            .build()
            .unwrap();

        let outcome = Engine::new(workflow).run(Payload::new()).await;
        match outcome.result {
            Err(RunError::IllegalHandoff { ref from, ref to }) => {
                assert_eq!(from, "a");
                assert_eq!(to, "c");
            }
            ref other => panic!("expected illegal handoff, got {:?}", other),
        }
        assert_eq!(outcome.timeline.invocations("c"), 0);
        assert_eq!(outcome.state.get("ran_a"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_allowed_handoff_reaches_target() {
        let workflow = Workflow::builder("agents")
            .register(
                Emit::new("a", &["start"], &["handoff"], vec![Event::handoff("b", "billing")])
                    .with_targets(&["b"]),
            )
            .register(Emit::new("b", &[], &["stop"], vec![Event::stop("from b")]))
            .build()
            .unwrap();

        let result = Engine::new(workflow).run(Payload::new()).await.result;
        assert_eq!(result.unwrap(), json!("from b"));
    }

    #[test]
    fn test_ambiguous_route_rejected_at_build() {
        let err = Workflow::builder("ambiguous")
            .register(Emit::new("a", &["start"], &["work"], vec![]))
            .register(Emit::new("b", &["work"], &["stop"], vec![]))
            .register(Emit::new("c", &["work"], &["stop"], vec![]))
            .build()
            .err()
            .unwrap();

        assert!(err.is_ambiguous_route());
    }

    #[test]
    fn test_unaccepted_output_rejected_at_build() {
        let err = Workflow::builder("dangling")
            .register(Emit::new("a", &["start"], &["orphan"], vec![]))
            .build()
            .err()
            .unwrap();

        assert_eq!(
            err,
            WorkflowError::UnroutedOutput {
                step: "a".into(),
                kind: EventKind::from("orphan"),
            }
        );
    }

    #[tokio::test]
    async fn test_fan_out_delivers_in_registration_order() {
        let workflow = Workflow::builder("fan")
            .register(Emit::new("a", &["start"], &["work"], vec![Event::custom("work")]))
            .register(Emit::new("b", &["work"], &["done"], vec![Event::custom("done")]))
            .register(Emit::new("c", &["work"], &["done"], vec![Event::custom("done")]))
            .register(Emit::new("d", &["done"], &["stop"], vec![Event::stop("finished")]))
            .fan_out("work")
            .build()
            .unwrap();

        let outcome = Engine::new(workflow).run(Payload::new()).await;

        assert_eq!(outcome.result.unwrap(), json!("finished"));
        let order: Vec<String> = outcome.timeline.spans().into_iter().map(|s| s.step).collect();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_nothing_runs_after_stop() {
        let workflow = Workflow::builder("early-stop")
            .register(Emit::new(
                "a",
                &["start"],
                &["stop", "more"],
                vec![Event::stop("first"), Event::custom("more")],
            ))
            .register(Emit::new("b", &["more"], &["stop"], vec![Event::stop("second")]))
            .build()
            .unwrap();

        let outcome = Engine::new(workflow).run(Payload::new()).await;

        assert_eq!(outcome.result.unwrap(), json!("first"));
        assert_eq!(outcome.iterations, 1);
        assert!(outcome.state.get("ran_b").is_none());
    }

    #[tokio::test]
    async fn test_undeclared_event_fails_run() {
        let workflow = Workflow::builder("liar")
            .register(Emit::new("a", &["start"], &["stop"], vec![Event::custom("surprise")]))
            .build()
            .unwrap();

        let result = Engine::new(workflow).run(Payload::new()).await.result;
        assert!(matches!(
            result,
            Err(RunError::UndeclaredEvent { ref step, ref kind }) if step == "a" && kind.as_str() == "surprise"
        ));
    }

    #[tokio::test]
    async fn test_unrouted_external_event_fails_run() {
        let workflow = Workflow::builder("quiet")
            .register(Emit::new("a", &["start"], &["stop"], vec![]))
            .build()
            .unwrap();

        let handle = Engine::new(workflow).start(Payload::new());
        handle.send_event(Event::custom("nobody")).unwrap();

        let result = handle.result().await;
        assert!(matches!(result, Err(RunError::Unrouted(ref kind)) if kind.as_str() == "nobody"));
    }
}

mod lifecycle {
    use super::*;

    /// Writes a marker, then waits on a slow model call.
    struct SlowModel;

    #[async_trait]
    impl Step for SlowModel {
        fn name(&self) -> &str {
            "slow"
        }

        fn accepts(&self) -> Vec<EventKind> {
            vec![EventKind::Start]
        }

        fn emits(&self) -> Vec<EventKind> {
            vec![EventKind::Stop]
        }

        async fn run(&mut self, ctx: &StepContext, _event: Event) -> StepResult {
            ctx.state().set("progress", "before model call").await?;
            let answer = ctx.completion().complete("take your time").await?;
            ctx.state().set("progress", "after model call").await?;
            Ok(vec![Event::stop(answer.as_text())])
        }
    }

    fn slow_engine(delay: Duration, timeout: Duration) -> Engine {
        let workflow = Workflow::builder("slow").register(SlowModel).build().unwrap();
        let completion = ScriptedCompletion::new(vec!["eventually"]).with_delay(delay);

        let mut engine = Engine::new(workflow);
        engine.set_timeout(timeout);
        engine.set_services(Services::new().with_completion(completion));
        engine
    }

    #[tokio::test]
    async fn test_timeout_preserves_state() {
        let handle = slow_engine(Duration::from_secs(10), Duration::from_millis(100)).start(Payload::new());
        let state = handle.state().clone();

        let outcome = handle.outcome().await;

        assert!(matches!(outcome.result, Err(RunError::Timeout { .. })));
        assert_eq!(outcome.status(), RunStatus::TimedOut);
        assert_eq!(outcome.state.get("progress"), Some(&json!("before model call")));
        assert_eq!(state.get("progress").await, Some(json!("before model call")));
    }

    #[tokio::test]
    async fn test_since_last_write_counts_from_latest_write() {
        /// Writes every 40ms for 200ms in total.
        struct Busy;

        #[async_trait]
        impl Step for Busy {
            fn name(&self) -> &str {
                "busy"
            }

            fn accepts(&self) -> Vec<EventKind> {
                vec![EventKind::Start]
            }

            fn emits(&self) -> Vec<EventKind> {
                vec![EventKind::Stop]
            }

            async fn run(&mut self, ctx: &StepContext, _event: Event) -> StepResult {
                for tick in 0..5 {
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    ctx.state().set("tick", tick).await?;
                }
                Ok(vec![Event::stop("finished")])
            }
        }

        let build = || Workflow::builder("busy").register(Busy).build().unwrap();

        let mut engine = Engine::new(build());
        engine.set_timeout(Duration::from_millis(120));
        engine.set_timeout_mode(TimeoutMode::SinceLastWrite);
        assert_eq!(engine.run(Payload::new()).await.result.unwrap(), json!("finished"));

        let mut engine = Engine::new(build());
        engine.set_timeout(Duration::from_millis(120));
        let result = engine.run(Payload::new()).await.result;
        assert!(matches!(result, Err(RunError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_cancel_during_model_call() {
        let handle = slow_engine(Duration::from_secs(10), Duration::from_secs(30)).start(Payload::new());

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();

        let outcome = handle.outcome().await;
        assert!(matches!(outcome.result, Err(RunError::Cancelled)));
        assert_eq!(outcome.status(), RunStatus::Cancelled);
        assert_eq!(outcome.state.get("progress"), Some(&json!("before model call")));
    }

    #[tokio::test]
    async fn test_model_error_surfaces() {
        let workflow = Workflow::builder("slow").register(SlowModel).build().unwrap();
        let mut engine = Engine::new(workflow);
        engine.set_services(
            Services::new().with_completion(
                ScriptedCompletion::new(Vec::<Value>::new()).with_error(ModelError::Empty),
            ),
        );

        let result = engine.run(Payload::new()).await.result;
        assert!(matches!(
            result,
            Err(RunError::Model { ref step, source: ModelError::Empty }) if step == "slow"
        ));
    }

    #[tokio::test]
    async fn test_stream_reports_run_in_order() {
        let engine = slow_engine(Duration::from_millis(1), Duration::from_secs(5));
        let stream = engine.stream_events();

        let outcome = engine.run(Payload::new()).await;
        assert_eq!(outcome.result.unwrap(), json!("eventually"));

        let events = stream.collect().await;
        let kinds: Vec<&LifecycleKind> = events.iter().map(|e| &e.kind).collect();

        assert!(matches!(kinds.first(), Some(LifecycleKind::RunStarted { workflow }) if workflow == "slow"));
        assert!(matches!(kinds[1], LifecycleKind::StepStarted { step, event_kind } if step == "slow" && *event_kind == EventKind::Start));
        assert!(matches!(kinds[2], LifecycleKind::StepProduced { event_kind, .. } if *event_kind == EventKind::Stop));
        assert!(matches!(
            kinds.last(),
            Some(LifecycleKind::RunFinished { status: RunStatus::Stopped })
        ));
        assert!(events.iter().all(|e| e.run_id == outcome.run_id));
    }
}

mod state {
    use super::*;
    use steprunner::workflow::SharedState;

    #[tokio::test]
    async fn test_scoped_edit_round_trip() {
        let state = SharedState::new();
        state.set("order", json!({"items": [], "total": 0})).await.unwrap();

        let mut order = state.scoped_edit("order").await;
        order["items"] = json!(["tea"]);
        order["total"] = json!(3);
        order.commit();

        assert_eq!(
            state.get("order").await,
            Some(json!({"items": ["tea"], "total": 3}))
        );
    }

    #[tokio::test]
    async fn test_discarded_edit_leaves_value() {
        let state = SharedState::new();
        state.set("count", 1).await.unwrap();

        let mut count = state.scoped_edit("count").await;
        *count = json!(99);
        count.discard();

        assert_eq!(state.get_or("count", 0).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_edit_excludes_concurrent_writers() {
        let state = SharedState::new();
        state.set("pair", json!({"a": 0, "b": 0})).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let state = state.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..25 {
                    let mut pair = state.scoped_edit("pair").await;
                    let a = pair["a"].as_i64().unwrap_or(0);
                    tokio::task::yield_now().await;
                    pair["a"] = json!(a + 1);
                    pair["b"] = json!(a + 1);
                    pair.commit();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(state.get("pair").await, Some(json!({"a": 200, "b": 200})));
    }

    #[tokio::test]
    async fn test_state_visible_to_later_steps() {
        let workflow = Workflow::builder("relay")
            .register(Emit::new("a", &["start"], &["next"], vec![Event::custom("next")]))
            .register(Emit::new("b", &["next"], &["stop"], vec![Event::stop(true)]))
            .build()
            .unwrap();

        let outcome = Engine::new(workflow).run(Payload::new()).await;
        assert_eq!(outcome.state.get("ran_a"), Some(&json!(1)));
        assert_eq!(outcome.state.get("ran_b"), Some(&json!(1)));
    }
}
