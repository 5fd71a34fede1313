//! quaygrid-pipeline — reversible step execution.
//!
//! A pipeline is an ordered list of actions over a typed context. Forward
//! steps run serially; when one fails, the `backward` compensations of the
//! steps that already completed run serially in reverse, and the original
//! error is returned. Compensation is best-effort: a backward step can
//! never fail the pipeline, and panics are contained behind a fault
//! barrier.
//!
//! Each pipeline threads its own context type through the steps instead of
//! passing untyped values between them, so the compiler checks what every
//! step consumes and produces. Rollback never reaches across pipeline
//! boundaries.

use std::fmt::Display;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures_util::FutureExt;
use tracing::{debug, error, warn};

/// One reversible step of a pipeline.
#[async_trait]
pub trait Action<C, E>: Send + Sync
where
    C: Send,
    E: Send,
{
    /// Step name used in logs.
    fn name(&self) -> &'static str;

    /// Synchronous precondition check, run for every action before any
    /// forward step. Lets a misconfigured pipeline fail before it has side
    /// effects.
    fn check(&self, _ctx: &C) -> Result<(), E> {
        Ok(())
    }

    async fn forward(&self, ctx: &mut C) -> Result<(), E>;

    /// Compensate a completed forward step. Must not fail; errors are the
    /// implementation's to log.
    async fn backward(&self, _ctx: &mut C) {}
}

/// An ordered list of actions sharing a context type.
pub struct Pipeline<C, E> {
    actions: Vec<Box<dyn Action<C, E>>>,
}

impl<C, E> Pipeline<C, E>
where
    C: Send,
    E: Send + Display,
{
    pub fn new(actions: Vec<Box<dyn Action<C, E>>>) -> Self {
        Pipeline { actions }
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run the pipeline to completion, or roll back and return the first
    /// forward error.
    pub async fn execute(&self, ctx: &mut C) -> Result<(), E> {
        for action in &self.actions {
            action.check(ctx)?;
        }
        for (index, action) in self.actions.iter().enumerate() {
            debug!(action = action.name(), "pipeline forward");
            if let Err(err) = action.forward(ctx).await {
                warn!(
                    action = action.name(),
                    error = %err,
                    "pipeline step failed, rolling back"
                );
                self.rollback(ctx, index).await;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Run compensations for actions `[0, upto)` in reverse order.
    async fn rollback(&self, ctx: &mut C, upto: usize) {
        for action in self.actions[..upto].iter().rev() {
            debug!(action = action.name(), "pipeline backward");
            let barrier = AssertUnwindSafe(action.backward(ctx)).catch_unwind();
            if barrier.await.is_err() {
                error!(action = action.name(), "compensation panicked, continuing");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, thiserror::Error)]
    #[error("{0}")]
    struct TestError(String);

    #[derive(Default)]
    struct Trace {
        events: Mutex<Vec<String>>,
        value: AtomicUsize,
    }

    impl Trace {
        fn push(&self, event: &str) {
            self.events.lock().unwrap().push(event.to_string());
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    type Ctx = Arc<Trace>;

    struct Step {
        name: &'static str,
        fail: bool,
        panic_backward: bool,
    }

    impl Step {
        fn ok(name: &'static str) -> Box<dyn Action<Ctx, TestError>> {
            Box::new(Step {
                name,
                fail: false,
                panic_backward: false,
            })
        }

        fn failing(name: &'static str) -> Box<dyn Action<Ctx, TestError>> {
            Box::new(Step {
                name,
                fail: true,
                panic_backward: false,
            })
        }
    }

    #[async_trait]
    impl Action<Ctx, TestError> for Step {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn forward(&self, ctx: &mut Ctx) -> Result<(), TestError> {
            if self.fail {
                return Err(TestError(format!("{} exploded", self.name)));
            }
            ctx.value.fetch_add(1, Ordering::SeqCst);
            ctx.push(&format!("forward:{}", self.name));
            Ok(())
        }

        async fn backward(&self, ctx: &mut Ctx) {
            if self.panic_backward {
                panic!("backward panic");
            }
            ctx.value.fetch_sub(1, Ordering::SeqCst);
            ctx.push(&format!("backward:{}", self.name));
        }
    }

    #[tokio::test]
    async fn all_forwards_run_in_order() {
        let pipeline = Pipeline::new(vec![Step::ok("one"), Step::ok("two"), Step::ok("three")]);
        let mut ctx = Arc::new(Trace::default());

        pipeline.execute(&mut ctx).await.unwrap();

        assert_eq!(
            ctx.events(),
            vec!["forward:one", "forward:two", "forward:three"]
        );
        assert_eq!(ctx.value.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failure_rolls_back_completed_steps_in_reverse() {
        let pipeline = Pipeline::new(vec![
            Step::ok("one"),
            Step::ok("two"),
            Step::failing("three"),
        ]);
        let mut ctx = Arc::new(Trace::default());

        let err = pipeline.execute(&mut ctx).await.unwrap_err();
        assert_eq!(err.to_string(), "three exploded");

        assert_eq!(
            ctx.events(),
            vec![
                "forward:one",
                "forward:two",
                "backward:two",
                "backward:one"
            ]
        );
        // Side effects cancel out: state equals the state before step 0.
        assert_eq!(ctx.value.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failing_first_step_has_nothing_to_roll_back() {
        let pipeline = Pipeline::new(vec![Step::failing("first"), Step::ok("never")]);
        let mut ctx = Arc::new(Trace::default());

        pipeline.execute(&mut ctx).await.unwrap_err();
        assert!(ctx.events().is_empty());
    }

    #[tokio::test]
    async fn panicking_compensation_does_not_stop_rollback() {
        let pipeline = Pipeline::new(vec![
            Step::ok("one"),
            Box::new(Step {
                name: "two",
                fail: false,
                panic_backward: true,
            }),
            Step::failing("three"),
        ]);
        let mut ctx = Arc::new(Trace::default());

        pipeline.execute(&mut ctx).await.unwrap_err();

        // "two" panicked during rollback, "one" still compensated.
        assert_eq!(
            ctx.events(),
            vec!["forward:one", "forward:two", "backward:one"]
        );
    }

    struct Guarded;

    #[async_trait]
    impl Action<Ctx, TestError> for Guarded {
        fn name(&self) -> &'static str {
            "guarded"
        }

        fn check(&self, _ctx: &Ctx) -> Result<(), TestError> {
            Err(TestError("misconfigured".to_string()))
        }

        async fn forward(&self, ctx: &mut Ctx) -> Result<(), TestError> {
            ctx.push("forward:guarded");
            Ok(())
        }
    }

    #[tokio::test]
    async fn check_rejects_before_any_forward() {
        let pipeline: Pipeline<Ctx, TestError> =
            Pipeline::new(vec![Step::ok("one"), Box::new(Guarded)]);
        let mut ctx = Arc::new(Trace::default());

        let err = pipeline.execute(&mut ctx).await.unwrap_err();
        assert_eq!(err.to_string(), "misconfigured");
        assert!(ctx.events().is_empty());
    }
}
