// ============================================================================
// Interceptor Chain
// ============================================================================
//
// Every command runs through the same ordered list of interceptors, outermost
// first:
//
//   LogInterceptor -> RetryInterceptor -> (custom) -> ContextInterceptor -> command
//
// Nested commands issued through `ExecutionContext::execute` walk the same
// list, but arrive with the caller's context already attached. The context
// interceptor then reuses it instead of opening a new unit of work.
//
// ============================================================================

use super::command::{CommandOutput, DynCommand};
use super::context::ExecutionContext;
use super::EngineServices;
use crate::config::ConflictRetryPolicy;
use crate::core::{EngineError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{Instrument, debug, info_span, warn};

/// Cross-cutting behaviour wrapped around every command.
#[async_trait]
pub trait CommandInterceptor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Do work around `invocation.proceed()`. An interceptor may also return
    /// without proceeding.
    async fn intercept(&self, invocation: Invocation<'_>) -> Result<CommandOutput>;
}

/// A command positioned somewhere along the chain.
pub struct Invocation<'a> {
    command: &'a dyn DynCommand,
    services: &'a Arc<EngineServices>,
    remaining: &'a [Arc<dyn CommandInterceptor>],
    context: Option<&'a mut ExecutionContext>,
}

impl<'a> Invocation<'a> {
    pub(crate) fn top_level(command: &'a dyn DynCommand, services: &'a Arc<EngineServices>) -> Self {
        Self {
            command,
            services,
            remaining: &services.interceptors,
            context: None,
        }
    }

    pub(crate) fn nested(
        command: &'a dyn DynCommand,
        context: &'a mut ExecutionContext,
        services: &'a Arc<EngineServices>,
    ) -> Self {
        Self {
            command,
            services,
            remaining: &services.interceptors,
            context: Some(context),
        }
    }

    pub fn command_name(&self) -> &'static str {
        self.command.command_name()
    }

    /// True when the command was issued from inside another command.
    pub fn is_nested(&self) -> bool {
        self.context.is_some()
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        self.services
    }

    /// A fresh copy of a top-level invocation at the same chain position, so
    /// an interceptor can run the rest of the chain more than once. Nested
    /// invocations share their caller's context and cannot be reissued.
    pub fn reissue(&self) -> Option<Invocation<'a>> {
        if self.context.is_some() {
            return None;
        }
        Some(Invocation {
            command: self.command,
            services: self.services,
            remaining: self.remaining,
            context: None,
        })
    }

    /// Hand over to the next interceptor, or run the command once the chain
    /// is exhausted.
    pub async fn proceed(self) -> Result<CommandOutput> {
        match self.remaining.split_first() {
            Some((next, rest)) => {
                let invocation = Invocation {
                    command: self.command,
                    services: self.services,
                    remaining: rest,
                    context: self.context,
                };
                next.intercept(invocation).await
            }
            None => match self.context {
                Some(ctx) => self.command.execute_boxed(ctx).await,
                None => Err(EngineError::Fatal(format!(
                    "{} reached the end of the interceptor chain without an execution context",
                    self.command.command_name()
                ))),
            },
        }
    }

    fn with_context<'b>(self, context: &'b mut ExecutionContext) -> Invocation<'b>
    where
        'a: 'b,
    {
        Invocation {
            command: self.command,
            services: self.services,
            remaining: self.remaining,
            context: Some(context),
        }
    }
}

// ============================================================================
// Built-in interceptors
// ============================================================================

/// Span and timing around each command.
pub struct LogInterceptor;

#[async_trait]
impl CommandInterceptor for LogInterceptor {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn intercept(&self, invocation: Invocation<'_>) -> Result<CommandOutput> {
        let command = invocation.command_name();
        let span = info_span!("command", command, nested = invocation.is_nested());
        let started = Instant::now();

        let result = invocation.proceed().instrument(span).await;
        let elapsed_us = started.elapsed().as_micros() as u64;

        match &result {
            Ok(_) => debug!(command, elapsed_us, "command finished"),
            Err(err) if matches!(err, EngineError::Fatal(_)) => {
                warn!(command, elapsed_us, error = %err, "command aborted")
            }
            Err(err) => debug!(command, elapsed_us, error = %err, "command failed"),
        }
        result
    }
}

/// Re-runs a top-level command that lost an optimistic-concurrency race.
///
/// Each attempt goes through the context interceptor again, so it opens a
/// new unit of work and re-reads current state. Nested commands are never
/// retried: their caller decides what a conflict means.
pub struct RetryInterceptor {
    policy: ConflictRetryPolicy,
}

impl RetryInterceptor {
    pub fn new(policy: ConflictRetryPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl CommandInterceptor for RetryInterceptor {
    fn name(&self) -> &'static str {
        "retry"
    }

    async fn intercept(&self, invocation: Invocation<'_>) -> Result<CommandOutput> {
        if invocation.is_nested() || self.policy.max_attempts <= 1 {
            return invocation.proceed().await;
        }

        let mut attempt = 1;
        loop {
            let Some(this_attempt) = invocation.reissue() else {
                return invocation.proceed().await;
            };
            match this_attempt.proceed().await {
                Err(err) if err.is_revision_conflict() && attempt < self.policy.max_attempts => {
                    let backoff = self.policy.backoff_for(attempt);
                    debug!(
                        command = invocation.command_name(),
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "retrying after revision conflict"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Opens, reuses and closes execution contexts.
///
/// Only the invocation that opened a context commits or rolls it back. A
/// failing nested invocation marks the shared context rollback-only and
/// passes the error up to its caller.
pub struct ContextInterceptor;

#[async_trait]
impl CommandInterceptor for ContextInterceptor {
    fn name(&self) -> &'static str {
        "context"
    }

    async fn intercept(&self, mut invocation: Invocation<'_>) -> Result<CommandOutput> {
        match invocation.context.take() {
            Some(ctx) => {
                ctx.enter();
                let result = invocation.with_context(&mut *ctx).proceed().await;
                ctx.exit();
                if result.is_err() {
                    ctx.set_rollback_only();
                }
                result
            }
            None => {
                let mut ctx = ExecutionContext::open(invocation.services.clone());
                ctx.enter();
                let result = invocation.with_context(&mut ctx).proceed().await;
                ctx.exit();
                ctx.close(result).await
            }
        }
    }
}
