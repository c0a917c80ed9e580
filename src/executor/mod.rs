pub mod command;
pub mod context;
pub mod event;
pub mod executor;
pub mod guard;
pub mod interceptor;

pub use command::{Command, CommandOutput, DynCommand};
pub use context::{EntityManager, ExecutionContext};
pub use event::{EngineEvent, EventListener, EventLog};
pub use executor::{CommandExecutor, CommandExecutorBuilder, EngineServices};
pub use guard::{CommandExt, Guard, Guarded};
pub use interceptor::{
    CommandInterceptor, ContextInterceptor, Invocation, LogInterceptor, RetryInterceptor,
};
