use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::Mutex;

use shutterdesk_core::audit::AuditContext;
use shutterdesk_core::config::AgentConfig;
use shutterdesk_core::domain::decision::Verdict;
use shutterdesk_db::AgentStores;

use crate::context::AgentContext;
use crate::executor::{
    ActionExecutor, AllowedCall, ToolCallError, ToolCallOutcome, ToolCallRequest, ToolCallResult,
};
use crate::llm::{LlmClient, TurnMessage};
use crate::memory::WorkingMemoryStore;
use crate::tools::{ActionPayload, Tool, ToolRegistry};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RuntimeLimits {
    pub max_tool_rounds: u32,
    pub max_calls_per_turn: usize,
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        Self { max_tool_rounds: 6, max_calls_per_turn: 8 }
    }
}

impl From<&AgentConfig> for RuntimeLimits {
    fn from(config: &AgentConfig) -> Self {
        Self {
            max_tool_rounds: config.max_tool_rounds,
            max_calls_per_turn: config.max_calls_per_turn,
        }
    }
}

/// Result of driving the model until it stops asking for tools.
#[derive(Clone, Debug)]
pub struct Conversation {
    pub reply: Option<String>,
    pub transcript: Vec<TurnMessage>,
    pub results: Vec<ToolCallResult>,
    pub rounds: u32,
    pub round_limit_reached: bool,
}

enum Step {
    Ready { tool: Arc<dyn Tool>, payload: ActionPayload },
    Done(ToolCallOutcome),
}

pub struct AgentRuntime {
    registry: Arc<ToolRegistry>,
    executor: ActionExecutor,
    limits: RuntimeLimits,
}

impl AgentRuntime {
    pub fn new(registry: Arc<ToolRegistry>, stores: AgentStores, limits: RuntimeLimits) -> Self {
        Self { registry, executor: ActionExecutor::new(stores), limits }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn memory(&self) -> &WorkingMemoryStore {
        self.executor.memory()
    }

    /// Runs every requested call and returns one result per call, in request
    /// order. A failing call never stops its siblings.
    pub async fn execute_turn(
        &self,
        context: &AgentContext,
        calls: Vec<ToolCallRequest>,
    ) -> Vec<ToolCallResult> {
        let audit = context.audit_context();
        let prepared: Vec<(ToolCallRequest, Step)> = calls
            .into_iter()
            .enumerate()
            .map(|(index, call)| {
                let step = if index < self.limits.max_calls_per_turn {
                    self.prepare(context, &call)
                } else {
                    Step::Done(ToolCallOutcome::Failed {
                        error: ToolCallError::CallLimitExceeded {
                            limit: self.limits.max_calls_per_turn,
                        },
                    })
                };
                (call, step)
            })
            .collect();

        let locks = entity_locks(&prepared);
        let pending = prepared.into_iter().map(|(call, step)| {
            let lock = target_key(&step).and_then(|key| locks.get(&key).cloned());
            let audit = &audit;
            async move {
                let outcome = match step {
                    Step::Done(outcome) => outcome,
                    Step::Ready { tool, payload } => {
                        let _guard = match lock {
                            Some(lock) => Some(lock.lock_owned().await),
                            None => None,
                        };
                        self.dispatch(context, audit, tool, &payload).await
                    }
                };
                ToolCallResult { call_id: call.call_id, tool_name: call.tool_name, outcome }
            }
        });

        let results = join_all(pending).await;
        tracing::info!(
            event_name = "agent.turn.completed",
            studio_id = %context.studio_id,
            session_id = %context.session_id,
            calls = results.len(),
            executed = results.iter().filter(|result| result.outcome.is_executed()).count(),
            "turn completed"
        );
        results
    }

    /// Alternates model rounds and tool turns until the model answers without
    /// requesting tools or the round limit is reached.
    pub async fn converse(
        &self,
        llm: &dyn LlmClient,
        context: &AgentContext,
        user_message: impl Into<String>,
    ) -> Result<Conversation> {
        let specs = self.registry.specs();
        let mut transcript = vec![TurnMessage::User { content: user_message.into() }];
        let mut results = Vec::new();

        for round in 1..=self.limits.max_tool_rounds {
            let turn = llm.next_turn(&transcript, &specs).await?;
            transcript.push(TurnMessage::Assistant {
                content: turn.text.clone(),
                tool_calls: turn.tool_calls.clone(),
            });
            if turn.tool_calls.is_empty() {
                return Ok(Conversation {
                    reply: turn.text,
                    transcript,
                    results,
                    rounds: round,
                    round_limit_reached: false,
                });
            }

            let turn_results = self.execute_turn(context, turn.tool_calls).await;
            for result in &turn_results {
                let content = serde_json::to_value(&result.outcome).unwrap_or(Value::Null);
                transcript.push(TurnMessage::Tool { call_id: result.call_id.clone(), content });
            }
            results.extend(turn_results);
        }

        tracing::warn!(
            event_name = "agent.conversation.round_limit",
            studio_id = %context.studio_id,
            session_id = %context.session_id,
            max_tool_rounds = self.limits.max_tool_rounds,
            "model still requesting tools at round limit"
        );
        Ok(Conversation {
            reply: None,
            transcript,
            results,
            rounds: self.limits.max_tool_rounds,
            round_limit_reached: true,
        })
    }

    fn prepare(&self, context: &AgentContext, call: &ToolCallRequest) -> Step {
        let tool = match self.registry.resolve(&call.tool_name) {
            Ok(tool) => tool,
            Err(error) => {
                tracing::warn!(
                    event_name = "agent.tool_call.rejected",
                    studio_id = %context.studio_id,
                    tool = %call.tool_name,
                    reason_code = error.reason_code(),
                    "unknown tool requested"
                );
                return Step::Done(ToolCallOutcome::Failed {
                    error: ToolCallError::UnknownTool { tool: call.tool_name.clone() },
                });
            }
        };

        match tool.validate(&call.arguments) {
            Ok(payload) => Step::Ready { tool, payload },
            Err(error) => {
                tracing::warn!(
                    event_name = "agent.tool_call.rejected",
                    studio_id = %context.studio_id,
                    tool = %call.tool_name,
                    reason_code = "validation_error",
                    error = %error,
                    "tool arguments failed validation"
                );
                Step::Done(ToolCallOutcome::Failed {
                    error: ToolCallError::ValidationError { message: error.message },
                })
            }
        }
    }

    async fn dispatch(
        &self,
        context: &AgentContext,
        audit: &AuditContext,
        tool: Arc<dyn Tool>,
        payload: &ActionPayload,
    ) -> ToolCallOutcome {
        let decision = context.decide(tool.action_kind(), payload);
        match decision.verdict {
            Verdict::Deny => self.executor.deny(audit, tool.as_ref(), payload, decision).await,
            Verdict::Propose => {
                self.executor
                    .propose(audit, &context.policy, tool.as_ref(), payload, &decision)
                    .await
            }
            Verdict::Allow => {
                let call = AllowedCall {
                    audit,
                    tool,
                    payload,
                    decision: &decision,
                    proposal_id: None,
                };
                self.executor.run(call).await
            }
        }
    }
}

fn target_key(step: &Step) -> Option<String> {
    match step {
        Step::Ready { payload, .. } => payload.target.as_ref().map(|id| id.0.clone()),
        Step::Done(_) => None,
    }
}

/// One lock per record targeted by more than one call in the turn.
fn entity_locks(prepared: &[(ToolCallRequest, Step)]) -> HashMap<String, Arc<Mutex<()>>> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for (_, step) in prepared {
        if let Some(key) = target_key(step) {
            *counts.entry(key).or_default() += 1;
        }
    }
    counts
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(key, _)| (key, Arc::new(Mutex::new(()))))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;

    use serde_json::json;

    use shutterdesk_core::domain::policy::{ActionKind, Policy, PolicyMode};
    use shutterdesk_core::domain::record::{RecordId, Table};
    use shutterdesk_core::domain::tenant::{SessionId, StudioId, UserId};
    use shutterdesk_db::AgentStores;

    use super::{AgentRuntime, RuntimeLimits};
    use crate::catalog::crm_registry;
    use crate::context::AgentContext;
    use crate::executor::{ToolCallError, ToolCallOutcome, ToolCallRequest};
    use crate::llm::{LlmTurn, ScriptedLlmClient, TurnMessage};

    fn context(mode: PolicyMode) -> AgentContext {
        let policy = Policy {
            mode,
            authorities: vec![ActionKind::ReadLeads, ActionKind::CreateLead, ActionKind::UpdateLead],
            restricted_fields: BTreeSet::new(),
            auto_approve_thresholds: BTreeMap::new(),
            domain_rules: Vec::new(),
        };
        AgentContext::new(
            StudioId("studio-a".to_string()),
            UserId("user-1".to_string()),
            SessionId("s-1".to_string()),
            policy,
        )
    }

    fn runtime(limits: RuntimeLimits) -> (AgentRuntime, AgentStores) {
        let (stores, _audit) = AgentStores::in_memory();
        let registry = Arc::new(crm_registry().expect("registry"));
        (AgentRuntime::new(registry, stores.clone(), limits), stores)
    }

    #[tokio::test]
    async fn calls_over_the_turn_limit_fail_without_running() {
        let (runtime, _) = runtime(RuntimeLimits { max_tool_rounds: 2, max_calls_per_turn: 1 });
        let calls = vec![
            ToolCallRequest::new("c1", "list_leads", json!({})),
            ToolCallRequest::new("c2", "list_leads", json!({})),
        ];

        let results = runtime.execute_turn(&context(PolicyMode::ReadOnly), calls).await;
        assert!(results[0].outcome.is_executed());
        assert_eq!(
            results[1].outcome.error(),
            Some(&ToolCallError::CallLimitExceeded { limit: 1 })
        );
    }

    #[tokio::test]
    async fn updates_to_the_same_lead_are_both_applied() {
        let (runtime, stores) = runtime(RuntimeLimits::default());
        let context = context(PolicyMode::FullWrite);
        let created = runtime
            .execute_turn(
                &context,
                vec![ToolCallRequest::new("c1", "create_lead", json!({"name": "Ana Ruiz"}))],
            )
            .await;
        let ToolCallOutcome::Executed { output, .. } = &created[0].outcome else {
            panic!("lead should be created: {:?}", created[0].outcome);
        };
        let lead_id = output["id"].as_str().expect("id").to_string();

        let results = runtime
            .execute_turn(
                &context,
                vec![
                    ToolCallRequest::new(
                        "c2",
                        "update_lead",
                        json!({"id": lead_id, "changes": {"status": "contacted"}}),
                    ),
                    ToolCallRequest::new(
                        "c3",
                        "update_lead",
                        json!({"id": lead_id, "changes": {"source": "instagram"}}),
                    ),
                ],
            )
            .await;
        assert!(results.iter().all(|result| result.outcome.is_executed()), "{results:?}");

        let lead = stores
            .records
            .find(&context.studio_id, Table::Leads, &RecordId(lead_id))
            .await
            .expect("find")
            .expect("lead exists");
        assert_eq!(lead.field_str("status"), Some("contacted"));
        assert_eq!(lead.field_str("source"), Some("instagram"));
    }

    #[tokio::test]
    async fn converse_feeds_tool_results_back_to_the_model() {
        let (runtime, _) = runtime(RuntimeLimits::default());
        let llm = ScriptedLlmClient::new([
            LlmTurn::calls(vec![ToolCallRequest::new("c1", "list_leads", json!({"limit": 5}))]),
            LlmTurn::reply("You have no leads yet."),
        ]);

        let conversation = runtime
            .converse(&llm, &context(PolicyMode::ReadOnly), "any new leads?")
            .await
            .expect("conversation");

        assert_eq!(conversation.reply.as_deref(), Some("You have no leads yet."));
        assert_eq!(conversation.rounds, 2);
        assert_eq!(conversation.results.len(), 1);
        let transcripts = llm.transcripts().await;
        let TurnMessage::Tool { call_id, content } = &transcripts[1][2] else {
            panic!("second round should include the tool result");
        };
        assert_eq!(call_id, "c1");
        assert_eq!(content["status"], "executed");
    }

    #[tokio::test]
    async fn converse_stops_at_the_round_limit() {
        let (runtime, _) = runtime(RuntimeLimits { max_tool_rounds: 2, max_calls_per_turn: 8 });
        let looping = || LlmTurn::calls(vec![ToolCallRequest::new("c", "list_leads", json!({}))]);
        let llm = ScriptedLlmClient::new([looping(), looping(), looping()]);

        let conversation = runtime
            .converse(&llm, &context(PolicyMode::ReadOnly), "loop")
            .await
            .expect("conversation");
        assert!(conversation.round_limit_reached);
        assert!(conversation.reply.is_none());
        assert_eq!(conversation.results.len(), 2);
    }
}
