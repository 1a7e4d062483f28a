// ABOUTME: wires translation, extraction, reconciliation and remote execution into one request path.
// ABOUTME: tags every failure with the class the boundary layer reports and serializes rule changes.

use fwintent_common::{extract, Command, CommandAction, ErrorClass, ServiceResult};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::reconcile::{reconcile, ReconcileOutcome, RuleBackend};
use crate::translator::Translator;

pub struct CommandService<B, T> {
    backend: B,
    translator: T,
    // one rule-set-affecting request at a time
    mutations: Mutex<()>,
}

impl<B, T> CommandService<B, T>
where
    B: RuleBackend + Sync,
    T: Translator + Sync,
{
    pub fn new(backend: B, translator: T) -> Self {
        Self {
            backend,
            translator,
            mutations: Mutex::new(()),
        }
    }

    /// Full path for a user utterance: translate, then `handle`.
    pub async fn handle_text(&self, text: &str) -> ServiceResult {
        if text.trim().is_empty() {
            return ServiceResult::error(ErrorClass::Validation, "no text");
        }
        info!(text = %text.trim(), "intent received");

        let raw = match self.translator.translate(text).await {
            Ok(raw) => raw,
            Err(err) => {
                error!(error = %err, "translation failed");
                return ServiceResult::error(ErrorClass::Llm, err.to_string());
            }
        };
        self.handle(&raw).await
    }

    pub async fn handle(&self, raw: &str) -> ServiceResult {
        let command = match extract(raw) {
            Ok(command) => command,
            Err(err) => {
                warn!(error = %err, code = err.code(), "model response rejected");
                return ServiceResult::error(ErrorClass::Llm, err.to_string());
            }
        };
        info!(action = %command.action, ip = ?command.ip, port = %command.port, "command extracted");

        let outcome = if command.action == CommandAction::List {
            reconcile(&command, &self.backend).await
        } else {
            let _guard = self.mutations.lock().await;
            reconcile(&command, &self.backend).await
        };

        match outcome {
            Ok(outcome) => render(&command, outcome),
            Err(err) => {
                error!(error = %err, "firewall operation failed");
                ServiceResult::error(ErrorClass::Firewall, err.to_string())
            }
        }
    }

    pub async fn list_rules(&self) -> ServiceResult {
        match self.backend.list_rules().await {
            Ok(rules) => ServiceResult::rules(rules),
            Err(err) => {
                error!(error = %err, "rule listing failed");
                ServiceResult::error(ErrorClass::Firewall, err.to_string())
            }
        }
    }
}

fn render(command: &Command, outcome: ReconcileOutcome) -> ServiceResult {
    match outcome {
        ReconcileOutcome::Listed(rules) => ServiceResult::rules(rules),
        ReconcileOutcome::Inserted(key) => ServiceResult::message(format!(
            "rule added: {} {}:{}",
            command.action, key.source_address, key.destination_port
        )),
        ReconcileOutcome::AlreadyExists(key) => {
            ServiceResult::already_exists(command.action, key.source_address, key.destination_port)
        }
        ReconcileOutcome::Removed { key, count } => ServiceResult::message(format!(
            "removed {count} block rule(s) for {}:{}",
            key.source_address, key.destination_port
        )),
        ReconcileOutcome::NothingToRemove(key) => ServiceResult::message(format!(
            "no block rule found to remove for {}:{}",
            key.source_address, key.destination_port
        )),
        ReconcileOutcome::BulkRemoved(bulk) => ServiceResult::bulk(bulk.deleted, bulk.failed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::tests::FakeBackend;
    use crate::translator::{Passthrough, TranslateError};
    use fwintent_common::{FirewallRule, RuleAction, RuleKey, Status};
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    /// Stands in for the language model with a fixed reply.
    struct StubModel(Result<String, TranslateError>);

    impl Translator for StubModel {
        async fn translate(&self, _text: &str) -> Result<String, TranslateError> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn spoken_block_request_inserts_one_rule() {
        let model = StubModel(Ok(r#"{"action":"block","ip":"10.0.0.5","port":"8080"}"#.to_string()));
        let service = CommandService::new(FakeBackend::default(), model);

        let result = service.handle_text("please block 10.0.0.5 on port 8080").await;
        assert_eq!(result, ServiceResult::message("rule added: block 10.0.0.5:8080"));
        assert_eq!(service.backend.rules().len(), 1);

        let again = service.handle_text("please block 10.0.0.5 on port 8080").await;
        assert_eq!(again, ServiceResult::already_exists(CommandAction::Block, "10.0.0.5", "8080"));
        assert_eq!(service.backend.rules().len(), 1);
    }

    #[tokio::test]
    async fn invalid_port_never_reaches_remote() {
        let service = CommandService::new(FakeBackend::default(), Passthrough);
        let result = service
            .handle(r#"{"action":"block","ip":"10.0.0.5","port":"70000"}"#)
            .await;
        assert_eq!(result.error_class(), Some(ErrorClass::Llm));
        assert_eq!(service.backend.calls(), 0);
    }

    #[tokio::test]
    async fn translator_failure_is_llm_class() {
        let service = CommandService::new(FakeBackend::default(), StubModel(Err(TranslateError::Timeout)));
        let result = service.handle_text("block 10.0.0.5").await;
        assert_eq!(result.error_class(), Some(ErrorClass::Llm));
    }

    #[tokio::test]
    async fn blank_text_is_validation_class() {
        let service = CommandService::new(FakeBackend::default(), Passthrough);
        assert_eq!(service.handle_text("   ").await.error_class(), Some(ErrorClass::Validation));
    }

    #[tokio::test]
    async fn remote_failure_is_firewall_class() {
        let backend = FakeBackend {
            fail_list: true,
            ..FakeBackend::default()
        };
        let service = CommandService::new(backend, Passthrough);
        let result = service.handle(r#"{"action":"list","ip":"","port":""}"#).await;
        assert_eq!(result.error_class(), Some(ErrorClass::Firewall));
        assert_eq!(service.list_rules().await.error_class(), Some(ErrorClass::Firewall));
    }

    #[tokio::test]
    async fn bulk_unblock_renders_partial_status() {
        let ip = Ipv4Addr::new(10, 0, 0, 9);
        let rules: Vec<FirewallRule> = [22u16, 80]
            .iter()
            .map(|p| FirewallRule::from_key(&RuleKey::new(RuleAction::Block, ip, *p)))
            .collect();
        let mut backend = FakeBackend::with_rules(rules);
        backend.failing_ports.insert("22".to_string());
        let service = CommandService::new(backend, Passthrough);

        match service.handle("```json\n{\"action\":\"unblock\",\"ip\":\"10.0.0.9\",\"port\":\"all\"}\n```").await {
            ServiceResult::Bulk { status, deleted, failed } => {
                assert_eq!(status, Status::Partial);
                assert_eq!(deleted.len(), 1);
                assert_eq!(failed[0].port, "22");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_blocks_collapse_to_one_rule() {
        let service = Arc::new(CommandService::new(FakeBackend::default(), Passthrough));
        let raw = r#"{"action":"block","ip":"10.0.0.5","port":"22"}"#;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = Arc::clone(&service);
            handles.push(tokio::spawn(async move { service.handle(raw).await }));
        }
        let mut added = 0;
        for h in handles {
            if let ServiceResult::Message { .. } = h.await.unwrap() {
                added += 1;
            }
        }
        assert_eq!(added, 1);
        assert_eq!(service.backend.rules().len(), 1);
    }

    #[tokio::test]
    async fn nothing_to_remove_is_reported_as_ok() {
        let service = CommandService::new(FakeBackend::default(), Passthrough);
        let result = service.handle(r#"{"action":"remove","ip":"10.0.0.5","port":"22"}"#).await;
        match result {
            ServiceResult::Message { status, result } => {
                assert_eq!(status, Status::Ok);
                assert!(result.starts_with("no block rule found"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
