use std::sync::Arc;

use serde_json::{json, Map, Value};

use shutterdesk_agent::{
    crm_registry, AgentContext, AgentRuntime, CatalogPolicyProvider, RuntimeLimits,
    ToolCallError, ToolCallOutcome, ToolCallRequest,
};
use shutterdesk_core::audit::{AuditEntry, AuditOutcome, AuditQuery};
use shutterdesk_core::domain::decision::{ReasonCode, Verdict};
use shutterdesk_core::domain::proposal::ProposalStatus;
use shutterdesk_core::domain::record::{RecordFilter, Table};
use shutterdesk_core::domain::tenant::{SessionId, StudioId, UserId};
use shutterdesk_core::policy::PolicyCatalog;
use shutterdesk_db::repositories::InMemoryAuditLogRepository;
use shutterdesk_db::{connect_and_migrate, AgentStores, DbPool};

const POLICIES: &str = r#"
[default]
mode = "read_only"
authorities = ["READ_LEADS", "READ_CLIENTS"]

[studios.guarded]
mode = "guarded_write"
authorities = ["READ_LEADS", "READ_CLIENTS", "CREATE_LEAD", "CREATE_INVOICE", "UPDATE_MEMORY"]
restricted_fields = ["studio_id"]

[studios.guarded.auto_approve_thresholds]
CREATE_INVOICE = "100"

[studios.open]
mode = "full_write"
authorities = ["READ_LEADS", "READ_CLIENTS", "CREATE_LEAD", "UPDATE_LEAD", "CREATE_CLIENT", "UPDATE_CLIENT", "UPDATE_MEMORY"]
restricted_fields = ["studio_id"]
"#;

struct Harness {
    runtime: AgentRuntime,
    stores: AgentStores,
    audit: Arc<InMemoryAuditLogRepository>,
    provider: CatalogPolicyProvider,
}

impl Harness {
    fn new() -> Self {
        let (stores, audit) = AgentStores::in_memory();
        let registry = Arc::new(crm_registry().expect("registry"));
        let runtime = AgentRuntime::new(registry, stores.clone(), RuntimeLimits::default());
        let provider =
            CatalogPolicyProvider::new(PolicyCatalog::parse(POLICIES).expect("policy catalog"));
        Self { runtime, stores, audit, provider }
    }

    fn context(&self, studio: &str) -> AgentContext {
        AgentContext::resolve(
            &self.provider,
            StudioId(studio.to_string()),
            UserId("assistant-user".to_string()),
            SessionId(format!("{studio}-session")),
        )
    }

    async fn leads(&self, studio: &str) -> usize {
        self.stores
            .records
            .select(&StudioId(studio.to_string()), Table::Leads, &RecordFilter::all(), 100)
            .await
            .expect("select leads")
            .len()
    }
}

fn call(id: &str, tool: &str, arguments: Value) -> ToolCallRequest {
    ToolCallRequest::new(id, tool, arguments)
}

fn fields(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[tokio::test]
async fn unknown_tool_fails_alone_and_siblings_still_run() {
    let harness = Harness::new();
    let context = harness.context("open");

    let results = harness
        .runtime
        .execute_turn(
            &context,
            vec![
                call("c1", "delete_everything", json!({})),
                call("c2", "create_lead", json!({"name": "Ana Ruiz", "source": "referral"})),
                call("c3", "list_leads", json!({})),
            ],
        )
        .await;

    assert_eq!(results.len(), 3);
    assert_eq!(results[0].call_id, "c1");
    assert_eq!(
        results[0].outcome.error(),
        Some(&ToolCallError::UnknownTool { tool: "delete_everything".to_string() })
    );
    assert!(results[1].outcome.is_executed(), "{:?}", results[1].outcome);
    assert!(results[2].outcome.is_executed(), "{:?}", results[2].outcome);

    let entries = harness.audit.snapshot().await;
    assert_eq!(entries.len(), 2, "unknown tools never reach the audit log");
    assert!(entries.iter().all(|entry| entry.tool_name.as_deref() != Some("delete_everything")));
}

#[tokio::test]
async fn guarded_write_without_threshold_creates_a_proposal_and_no_lead() {
    let harness = Harness::new();
    let context = harness.context("guarded");

    let results = harness
        .runtime
        .execute_turn(&context, vec![call("c1", "create_lead", json!({"name": "Bo Chen"}))])
        .await;

    let ToolCallOutcome::Proposed { proposal_id, proposal_status, .. } = &results[0].outcome else {
        panic!("expected a proposal, got {:?}", results[0].outcome);
    };
    assert_eq!(*proposal_status, ProposalStatus::Pending);
    assert_eq!(harness.leads("guarded").await, 0);

    let pending = harness
        .stores
        .proposals
        .list(&context.studio_id, Some(ProposalStatus::Pending), 10)
        .await
        .expect("list proposals");
    assert_eq!(pending.len(), 1);
    assert_eq!(&pending[0].id, proposal_id);
    assert_eq!(pending[0].payload["name"], "Bo Chen");

    let entries = harness.audit.snapshot().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, AuditOutcome::Proposed);
    assert_eq!(entries[0].decision, Verdict::Propose);
    assert_eq!(entries[0].proposal_id.as_ref(), Some(proposal_id));
}

#[tokio::test]
async fn restricted_field_is_denied_in_full_write_without_running_the_handler() {
    let harness = Harness::new();
    let context = harness.context("open");

    let results = harness
        .runtime
        .execute_turn(
            &context,
            vec![call("c1", "create_lead", json!({"name": "Cy", "studio_id": "guarded"}))],
        )
        .await;

    let Some(ToolCallError::PolicyDenied { decision }) = results[0].outcome.error() else {
        panic!("expected a policy denial, got {:?}", results[0].outcome);
    };
    assert_eq!(decision.reason, ReasonCode::RestrictedField);
    assert_eq!(harness.leads("open").await, 0);
    assert_eq!(harness.leads("guarded").await, 0);

    let entries = harness.audit.snapshot().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, AuditOutcome::Denied);
    assert!(entries[0].after_state.is_none());
}

#[tokio::test]
async fn invoice_under_threshold_executes_in_guarded_write() {
    let harness = Harness::new();
    let context = harness.context("guarded");
    let client = harness
        .stores
        .records
        .insert(&context.studio_id, Table::Clients, fields(json!({"name": "Dee"})))
        .await
        .expect("seed client");

    let results = harness
        .runtime
        .execute_turn(
            &context,
            vec![call("c1", "create_invoice", json!({"client_id": client.id.0, "amount": "50"}))],
        )
        .await;
    assert!(results[0].outcome.is_executed(), "{:?}", results[0].outcome);

    let entries = harness.audit.snapshot().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, AuditOutcome::Executed);
    assert_eq!(entries[0].reason_code, ReasonCode::UnderAutoApproveThreshold);
    let after = entries[0].after_state.as_ref().expect("after state");
    assert_eq!(after["status"], "draft");
    assert!(entries[0].before_state.is_none());
}

#[tokio::test]
async fn validation_errors_are_reported_separately_from_denials() {
    let harness = Harness::new();
    let context = harness.context("open");

    let results = harness
        .runtime
        .execute_turn(&context, vec![call("c1", "create_lead", json!({"email": "x@y.z"}))])
        .await;

    let error = results[0].outcome.error().expect("validation failure");
    assert_eq!(error.reason_code(), "validation_error");
    assert_eq!(harness.audit.entry_count().await, 0);
}

#[tokio::test]
async fn audit_outage_rolls_the_write_back() {
    let harness = Harness::new();
    let context = harness.context("open");
    harness.audit.set_unavailable(true);

    let results = harness
        .runtime
        .execute_turn(&context, vec![call("c1", "create_lead", json!({"name": "Eve"}))])
        .await;

    let error = results[0].outcome.error().expect("audit failure");
    assert_eq!(error.reason_code(), "audit_write_failure");
    assert_eq!(harness.leads("open").await, 0);
}

#[tokio::test]
async fn handler_failures_are_audited_once() {
    let harness = Harness::new();
    let context = harness.context("open");

    let results = harness
        .runtime
        .execute_turn(
            &context,
            vec![call("c1", "update_lead", json!({"id": "lead_missing", "changes": {"status": "lost"}}))],
        )
        .await;

    let error = results[0].outcome.error().expect("handler failure");
    assert_eq!(error.reason_code(), "handler_execution_error");
    let entries = harness.audit.snapshot().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, AuditOutcome::Failed);
    assert!(entries[0].error.is_some());
}

#[tokio::test]
async fn studios_never_see_each_others_rows() {
    let harness = Harness::new();
    let open = harness.context("open");
    let other = harness.context("elsewhere");

    let created = harness
        .runtime
        .execute_turn(&open, vec![call("c1", "create_client", json!({"name": "Fay"}))])
        .await;
    let ToolCallOutcome::Executed { output, .. } = &created[0].outcome else {
        panic!("client should be created: {:?}", created[0].outcome);
    };
    let client_id = output["id"].as_str().expect("client id").to_string();

    let results = harness
        .runtime
        .execute_turn(
            &other,
            vec![
                call("c1", "list_clients", json!({})),
                call("c2", "get_client", json!({"client_id": client_id})),
            ],
        )
        .await;

    let ToolCallOutcome::Executed { output, .. } = &results[0].outcome else {
        panic!("listing is a read: {:?}", results[0].outcome);
    };
    assert_eq!(output["count"], 0);
    assert_eq!(
        results[1].outcome.error().map(ToolCallError::reason_code),
        Some("handler_execution_error")
    );

    let elsewhere = harness
        .stores
        .audit
        .list(&other.studio_id, &AuditQuery::default())
        .await
        .expect("audit list");
    assert_eq!(elsewhere.len(), 2);
    assert!(elsewhere.iter().all(|entry| entry.studio_id == other.studio_id));
}

#[tokio::test]
async fn get_client_selects_it_in_working_memory() {
    let harness = Harness::new();
    let context = harness.context("open");
    let client = harness
        .stores
        .records
        .insert(&context.studio_id, Table::Clients, fields(json!({"name": "Gus"})))
        .await
        .expect("seed client");

    let results = harness
        .runtime
        .execute_turn(
            &context,
            vec![
                call("c1", "get_client", json!({"client_id": client.id.0})),
                call("c2", "remember", json!({"goal": "send the gallery link"})),
            ],
        )
        .await;
    assert!(results.iter().all(|result| result.outcome.is_executed()), "{results:?}");

    let memory = harness
        .runtime
        .memory()
        .get(&context.studio_id, &context.session_id)
        .await
        .expect("memory");
    assert_eq!(memory.selected_client_id.as_deref(), Some(client.id.0.as_str()));
    assert_eq!(memory.current_goal.as_deref(), Some("send the gallery link"));
}

#[tokio::test]
async fn audit_outage_leaves_working_memory_untouched() {
    let harness = Harness::new();
    let context = harness.context("open");
    let client = harness
        .stores
        .records
        .insert(&context.studio_id, Table::Clients, fields(json!({"name": "Jan"})))
        .await
        .expect("seed client");
    harness.audit.set_unavailable(true);

    let results = harness
        .runtime
        .execute_turn(
            &context,
            vec![
                call("c1", "remember", json!({"goal": "reschedule the shoot"})),
                call("c2", "get_client", json!({"client_id": client.id.0})),
            ],
        )
        .await;

    for result in &results {
        assert_eq!(
            result.outcome.error().map(ToolCallError::reason_code),
            Some("audit_write_failure"),
            "{}",
            result.call_id
        );
    }
    let memory = harness.runtime.memory().get(&context.studio_id, &context.session_id).await;
    assert_eq!(memory.expect_err("nothing was merged").reason_code(), "session_not_found");
    assert_eq!(harness.audit.entry_count().await, 0);
}

struct SqlHarness {
    pool: DbPool,
    runtime: AgentRuntime,
    stores: AgentStores,
    context: AgentContext,
}

impl SqlHarness {
    async fn new(studio: &str) -> Self {
        let pool = connect_and_migrate("sqlite::memory:", 1, 30).await.expect("database");
        let stores = AgentStores::sql(pool.clone());
        let registry = Arc::new(crm_registry().expect("registry"));
        let runtime = AgentRuntime::new(registry, stores.clone(), RuntimeLimits::default());
        let provider = CatalogPolicyProvider::new(PolicyCatalog::parse(POLICIES).expect("catalog"));
        let context = AgentContext::resolve(
            &provider,
            StudioId(studio.to_string()),
            UserId("assistant-user".to_string()),
            SessionId("sql-session".to_string()),
        );
        Self { pool, runtime, stores, context }
    }

    async fn drop_table(&self, table: &str) {
        sqlx::query(&format!("DROP TABLE {table}")).execute(&self.pool).await.expect("drop table");
    }

    async fn audit_entries(&self) -> Vec<AuditEntry> {
        self.stores.audit.list(&self.context.studio_id, &AuditQuery::default()).await.expect("audit")
    }
}

#[tokio::test]
async fn sql_write_failures_are_handler_errors_with_one_failed_entry() {
    let sql = SqlHarness::new("open").await;
    sql.drop_table("crm_record").await;

    let results = sql
        .runtime
        .execute_turn(&sql.context, vec![call("c1", "create_lead", json!({"name": "Kai"}))])
        .await;

    assert_eq!(
        results[0].outcome.error().map(ToolCallError::reason_code),
        Some("handler_execution_error")
    );
    let entries = sql.audit_entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, AuditOutcome::Failed);
    assert_eq!(entries[0].tool_name.as_deref(), Some("create_lead"));
    assert!(entries[0].after_state.is_none());
}

#[tokio::test]
async fn sql_proposal_store_failures_are_handler_errors() {
    let sql = SqlHarness::new("guarded").await;
    sql.drop_table("agent_proposal").await;

    let results = sql
        .runtime
        .execute_turn(&sql.context, vec![call("c1", "create_lead", json!({"name": "Mia"}))])
        .await;

    assert_eq!(
        results[0].outcome.error().map(ToolCallError::reason_code),
        Some("handler_execution_error")
    );
    let entries = sql.audit_entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, AuditOutcome::Failed);
    assert!(entries[0].proposal_id.is_none());
}

#[tokio::test]
async fn sql_audit_failures_roll_back_records_and_memory() {
    let sql = SqlHarness::new("open").await;
    sql.drop_table("audit_log_entry").await;

    let results = sql
        .runtime
        .execute_turn(
            &sql.context,
            vec![
                call("c1", "create_lead", json!({"name": "Lia"})),
                call("c2", "remember", json!({"goal": "send a quote"})),
            ],
        )
        .await;

    for result in &results {
        assert_eq!(
            result.outcome.error().map(ToolCallError::reason_code),
            Some("audit_write_failure"),
            "{}",
            result.call_id
        );
    }
    let leads = sql
        .stores
        .records
        .select(&sql.context.studio_id, Table::Leads, &RecordFilter::all(), 10)
        .await
        .expect("leads");
    assert!(leads.is_empty());
    let memory = sql.runtime.memory().get(&sql.context.studio_id, &sql.context.session_id).await;
    assert!(memory.is_err(), "memory must not outlive a failed audit entry");
}

#[tokio::test]
async fn sql_stores_commit_writes_with_their_audit_entries() {
    let SqlHarness { runtime, stores, context, .. } = SqlHarness::new("open").await;

    let results = runtime
        .execute_turn(
            &context,
            vec![
                call("c1", "create_lead", json!({"name": "Hal", "email": "hal@example.com"})),
                call("c2", "create_lead", json!({"name": "Ivy", "studio_id": "guarded"})),
            ],
        )
        .await;
    assert!(results[0].outcome.is_executed(), "{:?}", results[0].outcome);
    assert_eq!(results[1].outcome.error().map(ToolCallError::reason_code), Some("policy_denied"));

    let entries =
        stores.audit.list(&context.studio_id, &AuditQuery::default()).await.expect("audit");
    assert_eq!(entries.len(), 2);
    let executed = entries
        .iter()
        .find(|entry| entry.outcome == AuditOutcome::Executed)
        .expect("executed entry");
    assert!(executed.after_state.is_some());
    let denied =
        entries.iter().find(|entry| entry.outcome == AuditOutcome::Denied).expect("denied entry");
    assert!(denied.after_state.is_none());

    let leads = stores
        .records
        .select(&context.studio_id, Table::Leads, &RecordFilter::all(), 10)
        .await
        .expect("leads");
    assert_eq!(leads.len(), 1);
    assert_eq!(leads[0].field_str("name"), Some("Hal"));
}
