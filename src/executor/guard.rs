use super::command::Command;
use super::context::ExecutionContext;
use crate::core::Result;
use async_trait::async_trait;

/// Precondition checked before a command runs.
///
/// A failing guard aborts the command before it touches any state.
#[async_trait]
pub trait Guard: Send + Sync {
    async fn check(&self, ctx: &mut ExecutionContext) -> Result<()>;
}

/// A command that only runs once its guard passed.
pub struct Guarded<G, C> {
    guard: G,
    command: C,
}

impl<G, C> Guarded<G, C> {
    pub fn new(guard: G, command: C) -> Self {
        Self { guard, command }
    }

    pub fn inner(&self) -> &C {
        &self.command
    }
}

#[async_trait]
impl<G: Guard, C: Command> Command for Guarded<G, C> {
    type Output = C::Output;

    fn name(&self) -> &'static str {
        self.command.name()
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<Self::Output> {
        self.guard.check(ctx).await?;
        self.command.execute(ctx).await
    }
}

pub trait CommandExt: Command + Sized {
    fn guarded_by<G: Guard>(self, guard: G) -> Guarded<G, Self> {
        Guarded::new(guard, self)
    }
}

impl<C: Command> CommandExt for C {}
