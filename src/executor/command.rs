use super::ExecutionContext;
use crate::core::Result;
use async_trait::async_trait;
use std::any::Any;

/// Boxed command result as it travels through the interceptor chain.
pub type CommandOutput = Box<dyn Any + Send>;

/// A unit of work run through the interceptor chain.
///
/// Commands only touch state through the supplied context; any effect they
/// have is committed or discarded together with that context.
#[async_trait]
pub trait Command: Send + Sync {
    type Output: Send + 'static;

    /// Name used in logs and spans.
    fn name(&self) -> &'static str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<Self::Output>;
}

/// Object-safe view of a [`Command`], used inside the chain.
#[async_trait]
pub trait DynCommand: Send + Sync {
    fn command_name(&self) -> &'static str;

    async fn execute_boxed(&self, ctx: &mut ExecutionContext) -> Result<CommandOutput>;
}

#[async_trait]
impl<C: Command> DynCommand for C {
    fn command_name(&self) -> &'static str {
        self.name()
    }

    async fn execute_boxed(&self, ctx: &mut ExecutionContext) -> Result<CommandOutput> {
        let output = self.execute(ctx).await?;
        Ok(Box::new(output))
    }
}

pub(crate) fn downcast_output<T: 'static>(output: CommandOutput) -> Result<T> {
    output.downcast::<T>().map(|boxed| *boxed).map_err(|_| {
        crate::core::EngineError::Fatal(format!(
            "command output is not a {}",
            std::any::type_name::<T>()
        ))
    })
}
