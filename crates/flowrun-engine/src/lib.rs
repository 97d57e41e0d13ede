pub mod approval;
pub mod condition;
pub mod executor;
pub mod interpreter;
pub mod invocation;
pub mod looping;
pub mod notify;
pub mod oracle;
pub mod parallel;
pub mod resolver;
pub mod retry;
pub mod selector;

pub use approval::{ApprovalBroker, ApprovalGate};
pub use condition::ConditionEvaluator;
pub use executor::{Collaborators, ExecutionOutcome, WorkflowExecutor};
pub use interpreter::{Interpreter, Run, Step};
pub use invocation::AgentInvoker;
pub use looping::{IterationError, LoopOutcome};
pub use notify::{notify_failure, LogNotifier};
pub use resolver::Recovery;
pub use retry::RetryPolicy;
pub use selector::{AgentSelector, StaticProfiles};
