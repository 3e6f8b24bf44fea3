#[path = "adversarial/tamper_ledger.rs"]
mod tamper_ledger;

#[path = "adversarial/forge_approvals.rs"]
mod forge_approvals;

#[path = "adversarial/tamper_audit_log.rs"]
mod tamper_audit_log;

#[path = "adversarial/tamper_bundle.rs"]
mod tamper_bundle;
