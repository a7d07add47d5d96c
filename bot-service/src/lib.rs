#![allow(async_fn_in_trait)]

pub mod dispatcher;
pub mod evaluator;
pub mod notifier;
pub mod orchestrator;
pub mod summary;

pub use dispatcher::{DispatchOutcome, DispatchPlan, Dispatcher};
pub use evaluator::{milestone_to_summarize, Evaluator};
pub use notifier::{LogNotifier, Notifier, RunNotifier, WebhookNotifier};
pub use orchestrator::{build_plans, Orchestrator};
pub use summary::{FailureStage, IntentFailure, RunSummary};
