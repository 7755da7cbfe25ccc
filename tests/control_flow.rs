//! Control Flow Integration Tests
//!
//! Branch predicates, caller gotos and stops.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sagaflow::{Context, Engine, Flow, InstanceStatus, StepInput};
use tokio::sync::Notify;

async fn mark(input: StepInput) -> anyhow::Result<Context> {
    Ok(Context::new().with(format!("ran{}", input.step), true))
}

fn branching() -> Flow {
    Flow::new("pricing", "1", "quote", "", mark, false, "tests")
        .if_else("amount > 100", 3, 1)
        .step("standard", "", mark, false)
        .step("review", "", mark, false)
        .step("premium", "", mark, false)
}

#[tokio::test]
async fn test_branch_on_high_amount() {
    let engine = Engine::in_memory();
    engine.register(branching()).await.unwrap();

    engine
        .run("high", "pricing", 0, Context::new(), Context::new().with("amount", 150))
        .await
        .unwrap();

    let instance = engine.instance("high", "pricing").await.unwrap();
    assert_eq!(instance.current, 3);
    assert_eq!(instance.status, InstanceStatus::Running);
    assert_eq!(instance.history.last().unwrap().note, "goto 3");
}

#[tokio::test]
async fn test_branch_on_low_amount() {
    let engine = Engine::in_memory();
    engine.register(branching()).await.unwrap();

    engine
        .run("low", "pricing", 0, Context::new(), Context::new().with("amount", 50))
        .await
        .unwrap();

    let instance = engine.instance("low", "pricing").await.unwrap();
    assert_eq!(instance.current, 1);

    // Continue runs the remaining steps in order
    let ctx = engine.resume("low", "pricing", Context::new()).await.unwrap();
    assert_eq!(ctx.get_bool("ran1"), Some(true));
    assert_eq!(ctx.get_bool("ran2"), Some(true));
    assert_eq!(ctx.get_bool("ran3"), Some(true));
    assert_eq!(
        engine.instance("low", "pricing").await.unwrap().status,
        InstanceStatus::Done
    );
}

#[tokio::test]
async fn test_branch_to_terminal_completes() {
    let engine = Engine::in_memory();
    let flow = Flow::new("short", "1", "check", "", mark, false, "tests")
        .if_else("skip", 2, 1)
        .step("work", "", mark, false);
    engine.register(flow).await.unwrap();

    engine
        .run("t", "short", 0, Context::new(), Context::new().with("skip", true))
        .await
        .unwrap();

    let instance = engine.instance("t", "short").await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Done);
    assert!(instance.result(1).is_none());
}

#[tokio::test]
async fn test_stop_during_in_flight_step() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let third_calls = Arc::new(AtomicUsize::new(0));

    let flow = {
        let entered = Arc::clone(&entered);
        let release = Arc::clone(&release);
        let third_calls = Arc::clone(&third_calls);
        Flow::new("stoppable", "1", "first", "", mark, false, "tests")
            .step(
                "slow",
                "",
                move |input: StepInput| {
                    let entered = Arc::clone(&entered);
                    let release = Arc::clone(&release);
                    async move {
                        entered.notify_one();
                        release.notified().await;
                        Ok::<_, anyhow::Error>(input.ctx)
                    }
                },
                false,
            )
            .step(
                "third",
                "",
                move |_input: StepInput| {
                    let third_calls = Arc::clone(&third_calls);
                    async move {
                        third_calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, anyhow::Error>(Context::new())
                    }
                },
                false,
            )
    };

    let engine = Engine::in_memory();
    engine.register(flow).await.unwrap();

    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .run("s", "stoppable", 0, Context::new(), Context::new())
                .await
        })
    };

    entered.notified().await;
    engine.stop("s", "stoppable").await.unwrap();
    release.notify_one();

    runner.await.unwrap().unwrap();

    let instance = engine.instance("s", "stoppable").await.unwrap();
    assert_eq!(instance.current, 2);
    assert_eq!(instance.status, InstanceStatus::Running);
    assert!(instance.stops.contains(&1));
    assert_eq!(third_calls.load(Ordering::SeqCst), 0);

    // Continuing runs the last step
    engine.resume("s", "stoppable", Context::new()).await.unwrap();
    assert_eq!(third_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_goto_during_in_flight_step() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    let flow = {
        let entered = Arc::clone(&entered);
        let release = Arc::clone(&release);
        Flow::new(
            "jumpy",
            "1",
            "slow",
            "",
            move |input: StepInput| {
                let entered = Arc::clone(&entered);
                let release = Arc::clone(&release);
                async move {
                    entered.notify_one();
                    release.notified().await;
                    Ok::<_, anyhow::Error>(input.ctx)
                }
            },
            false,
            "tests",
        )
        .step("skipped", "", mark, false)
        .step("target", "", mark, false)
    };

    let engine = Engine::in_memory();
    engine.register(flow).await.unwrap();

    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .run("g", "jumpy", 0, Context::new(), Context::new())
                .await
        })
    };

    entered.notified().await;
    engine.goto("g", "jumpy", 2).await.unwrap();
    release.notify_one();
    runner.await.unwrap().unwrap();

    let instance = engine.instance("g", "jumpy").await.unwrap();
    assert_eq!(instance.current, 2);
    assert!(instance.result(1).is_none());
}

#[tokio::test]
async fn test_goto_on_idle_instance_moves_cursor() {
    let engine = Engine::in_memory();
    engine.register(branching()).await.unwrap();

    engine
        .run("i", "pricing", 0, Context::new(), Context::new().with("amount", 50))
        .await
        .unwrap();
    engine.goto("i", "pricing", 3).await.unwrap();

    let ctx = engine.resume("i", "pricing", Context::new()).await.unwrap();
    assert!(!ctx.contains_key("ran1"));
    assert_eq!(ctx.get_bool("ran3"), Some(true));

    let err = engine.goto("i", "pricing", 9).await.unwrap_err();
    assert!(matches!(err, sagaflow::EngineError::Validation(_)));
}

#[tokio::test]
async fn test_stop_on_idle_instance_applies_on_next_run() {
    let engine = Engine::in_memory();
    engine.register(branching()).await.unwrap();

    engine
        .run("p", "pricing", 0, Context::new(), Context::new().with("amount", 50))
        .await
        .unwrap();
    engine.stop("p", "pricing").await.unwrap();

    engine.resume("p", "pricing", Context::new()).await.unwrap();
    let instance = engine.instance("p", "pricing").await.unwrap();
    assert_eq!(instance.current, 2);
    assert!(instance.result(2).is_none());
}
