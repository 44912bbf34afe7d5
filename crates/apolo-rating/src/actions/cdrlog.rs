//! `*cdrlog`: one CDR per balance-changing sibling action
//!
//! Field templates are `;`-separated parts; a part starting with `^` is a
//! literal, any other part names an attribute of the account or the logged
//! action. The parts are concatenated.

use std::collections::BTreeMap;

use apolo_core::constants::{CDRLOG_SOURCE, META_PREPAID, MONETARY};
use apolo_core::models::{Account, Action, ActionKind, Cdr};
use apolo_core::traits::CdrSink;
use apolo_core::utils::gen_uuid;
use apolo_core::AppResult;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::debug;

fn default_template() -> BTreeMap<String, String> {
    [
        ("TOR", "BalanceType"),
        ("OriginHost", "^127.0.0.1"),
        ("Direction", "Directions"),
        ("RequestType", "^*prepaid"),
        ("Tenant", "Tenant"),
        ("Account", "Account"),
        ("Subject", "Account"),
        ("Cost", "ActionValue"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn logged(action: &Action) -> bool {
    matches!(
        action.kind(),
        Ok(ActionKind::Debit | ActionKind::DebitReset | ActionKind::Topup | ActionKind::TopupReset)
    )
}

/// Attribute `name` of `action` run on `acc`
fn attribute(name: &str, acc: &Account, action: &Action, value: Decimal) -> String {
    let spec = action
        .parsed_params()
        .map(|p| p.balance_spec())
        .unwrap_or_default();
    let joined = |items: &Option<Vec<String>>| items.as_ref().map(|v| v.join(";")).unwrap_or_default();
    match name {
        "AccountID" => acc.full_id(),
        "Tenant" => acc.tenant.clone(),
        "Account" => acc.name.clone(),
        "ActionType" => action.action_type.clone(),
        "ActionValue" => value.to_string(),
        "BalanceType" => {
            if action.tor.is_empty() {
                MONETARY.to_string()
            } else {
                action.tor.clone()
            }
        }
        "BalanceUUID" => spec.uuid.unwrap_or_default(),
        "BalanceID" => spec.id.unwrap_or_default(),
        "BalanceValue" => spec.value.map(|v| v.to_string()).unwrap_or_default(),
        "Directions" => joined(&spec.directions),
        "DestinationIDs" => joined(&spec.destination_ids),
        "Categories" => joined(&spec.categories),
        "SharedGroups" => joined(&spec.shared_groups),
        "RatingSubject" => spec.rating_subject.unwrap_or_default(),
        "ExtraParameters" => action.params.clone(),
        _ => String::new(),
    }
}

fn render(template: &str, acc: &Account, action: &Action, value: Decimal) -> String {
    template
        .split(';')
        .map(|part| match part.strip_prefix('^') {
            Some(literal) => literal.to_string(),
            None => attribute(part.trim(), acc, action, value),
        })
        .collect()
}

/// Write the CDRs for `siblings` through `sink`
///
/// `values[i]` is the amount moved by `siblings[i]` when it ran.
pub(crate) async fn log_cdrs(
    sink: &dyn CdrSink,
    acc: &Account,
    action: &Action,
    siblings: &[Action],
    values: &[Option<Decimal>],
    now: DateTime<Utc>,
) -> AppResult<Vec<Cdr>> {
    let mut template = default_template();
    if let Some(custom) = action.parsed_params()?.cdr_log_template {
        template.extend(custom);
    }

    let mut cdrs = Vec::new();
    for (idx, sibling) in siblings.iter().enumerate() {
        if !logged(sibling) {
            continue;
        }
        let value = values.get(idx).copied().flatten().unwrap_or(Decimal::ZERO);
        let mut cdr = Cdr {
            origin_id: gen_uuid(),
            source: CDRLOG_SOURCE.to_string(),
            request_type: META_PREPAID.to_string(),
            setup_time: now,
            answer_time: now,
            usage: Duration::seconds(1),
            ..Default::default()
        };
        cdr.cdr_id = Cdr::compute_id(&cdr.origin_id, &now.to_rfc3339());
        cdr.extra_fields
            .insert("RunID".to_string(), sibling.action_type.clone());
        for (field, tpl) in &template {
            cdr.set_field(field, &render(tpl, acc, sibling, value));
        }
        sink.set_cdr(&cdr, true).await?;
        debug!("Logged {} for {} as CDR {}", sibling.action_type, acc.full_id(), cdr.cdr_id);
        cdrs.push(cdr);
    }
    Ok(cdrs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use apolo_core::AppError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;

    #[derive(Default)]
    struct RecordingSink {
        cdrs: Mutex<Vec<Cdr>>,
    }

    #[async_trait]
    impl CdrSink for RecordingSink {
        async fn set_cdr(&self, cdr: &Cdr, _allow_update: bool) -> Result<(), AppError> {
            self.cdrs.lock().push(cdr.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_default_template() {
        let sink = RecordingSink::default();
        let acc = Account::new("t1", "rif");
        let topup = Action::new(
            ActionKind::Topup,
            MONETARY,
            r#"{"Balance":{"ID":"main","Value":10,"Directions":["*out"]}}"#,
        );
        let log = Action::new(ActionKind::CdrLog, "", "");
        let siblings = vec![topup, Action::new(ActionKind::Log, "", ""), log.clone()];

        let cdrs = log_cdrs(&sink, &acc, &log, &siblings, &[Some(dec!(10)), None, None], Utc::now())
            .await
            .unwrap();
        assert_eq!(cdrs.len(), 1);
        let cdr = &sink.cdrs.lock()[0];
        assert_eq!(cdr.tor, MONETARY);
        assert_eq!(cdr.origin_host, "127.0.0.1");
        assert_eq!(cdr.request_type, "*prepaid");
        assert_eq!(cdr.direction, "*out");
        assert_eq!(cdr.account, "rif");
        assert_eq!(cdr.subject, "rif");
        assert_eq!(cdr.cost, dec!(10));
        assert_eq!(cdr.source, CDRLOG_SOURCE);
        assert_eq!(cdr.extra_fields["RunID"], "*topup");
    }

    #[tokio::test]
    async fn test_custom_template() {
        let sink = RecordingSink::default();
        let acc = Account::new("t1", "rif");
        let debit = Action::new(ActionKind::Debit, MONETARY, r#"{"Balance":{"ID":"main","Value":2}}"#);
        let log = Action::new(
            ActionKind::CdrLog,
            "",
            r#"{"CdrLogTemplate":{"Subject":"^acc_;Account","Category":"^topups","Note":"BalanceID"}}"#,
        );
        let siblings = vec![debit, log.clone()];
        log_cdrs(&sink, &acc, &log, &siblings, &[Some(dec!(-2)), None], Utc::now())
            .await
            .unwrap();
        let cdr = &sink.cdrs.lock()[0];
        assert_eq!(cdr.subject, "acc_rif");
        assert_eq!(cdr.category, "topups");
        assert_eq!(cdr.cost, dec!(-2));
        assert_eq!(cdr.extra_fields["Note"], "main");
    }
}
