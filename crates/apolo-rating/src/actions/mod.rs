//! Action runtime
//!
//! Executes action groups on behalf of triggers and action plans. Actions
//! run in the order given (callers sort by weight); the first failing action
//! aborts the rest of the group and nothing already applied is rolled back.
//! Notification actions run detached and only log their failures.

mod balance;
mod cdrlog;
mod template;

use std::sync::Arc;

use apolo_core::constants::{DDC_DESTINATION_PREFIX, MAIL_SUBJECT_PREFIX};
use apolo_core::filter::Filter;
use apolo_core::models::{Account, Action, ActionKind, ActionTrigger, StatsSnapshot};
use apolo_core::traits::CdrSink;
use apolo_core::{AppError, AppResult};
use apolo_store::{AccountStore, Catalog};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::notify::{spool_file_name, HttpPoster, LogMailer, MailMessage, Mailer, JsonTcpRpcClient, RpcClient, RpcRequest};
use crate::settings::ActionSettings;

/// What the actions run on
pub struct ActionContext<'a> {
    pub tenant: String,
    pub account: Option<&'a mut Account>,
    /// Triggers of the account, re-evaluated after balance changes
    pub triggers: &'a [ActionTrigger],
    pub stats: Option<&'a StatsSnapshot>,
    pub now: DateTime<Utc>,
}

impl<'a> ActionContext<'a> {
    pub fn for_account(account: &'a mut Account, triggers: &'a [ActionTrigger], now: DateTime<Utc>) -> Self {
        Self {
            tenant: account.tenant.clone(),
            account: Some(account),
            triggers,
            stats: None,
            now,
        }
    }

    /// Context without an account, for stats triggers and unbound plans
    pub fn detached(tenant: &str, stats: Option<&'a StatsSnapshot>, now: DateTime<Utc>) -> Self {
        Self {
            tenant: tenant.to_string(),
            account: None,
            triggers: &[],
            stats,
            now,
        }
    }

    fn account_mut(&mut self, kind: ActionKind) -> AppResult<&mut Account> {
        self.account
            .as_deref_mut()
            .ok_or_else(|| AppError::MandatoryMissing(format!("account for {}", kind.as_str())))
    }
}

#[derive(Debug, Default)]
pub struct ActionOutcome {
    /// The context account was deleted and must not be saved
    pub account_removed: bool,
    /// Account triggers fired by the actions, already marked executed
    pub fired: Vec<String>,
}

/// Whether `kind` needs an account to run on
pub fn requires_account(kind: ActionKind) -> bool {
    !matches!(
        kind,
        ActionKind::Log
            | ActionKind::CallUrl
            | ActionKind::CallUrlAsync
            | ActionKind::MailAsync
            | ActionKind::Rpc
            | ActionKind::RemoveAccount
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RpcParams {
    address: String,
    #[serde(default)]
    transport: String,
    method: String,
    #[serde(default)]
    attempts: u32,
    #[serde(default, rename = "Async")]
    run_async: bool,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AccountRef {
    #[serde(default)]
    tenant: String,
    #[serde(default)]
    account: String,
}

pub struct ActionRuntime {
    catalog: Arc<Catalog>,
    accounts: Arc<AccountStore>,
    cdrs: Arc<dyn CdrSink>,
    poster: HttpPoster,
    mailer: Arc<dyn Mailer>,
    rpc: Arc<dyn RpcClient>,
    settings: ActionSettings,
}

impl ActionRuntime {
    /// Runtime with the logging mailer and the TCP RPC client
    ///
    /// # Errors
    ///
    /// Returns `AppError::Http` if the HTTP client cannot be built
    pub fn new(
        catalog: Arc<Catalog>,
        accounts: Arc<AccountStore>,
        cdrs: Arc<dyn CdrSink>,
        settings: ActionSettings,
    ) -> AppResult<Self> {
        let poster = HttpPoster::new(&settings)?;
        let rpc = Arc::new(JsonTcpRpcClient::new(settings.connect_timeout, settings.reply_timeout));
        Ok(Self {
            catalog,
            accounts,
            cdrs,
            poster,
            mailer: Arc::new(LogMailer::new(&Default::default())),
            rpc,
            settings,
        })
    }

    pub fn with_mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = mailer;
        self
    }

    pub fn with_rpc_client(mut self, rpc: Arc<dyn RpcClient>) -> Self {
        self.rpc = rpc;
        self
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Run `actions` in order against `ctx`
    ///
    /// Actions whose exec filter matches no balance of the account are
    /// skipped. After balance or trigger changes the account triggers are
    /// evaluated again and the fired ids returned in the outcome.
    ///
    /// # Errors
    ///
    /// - `AppError::UnknownActionKind` for unsupported kinds
    /// - the first error of an action; earlier actions stay applied
    #[instrument(skip_all, fields(tenant = %ctx.tenant, actions = actions.len()))]
    pub async fn execute(&self, ctx: &mut ActionContext<'_>, actions: &[Action]) -> AppResult<ActionOutcome> {
        let mut outcome = ActionOutcome::default();
        let mut values: Vec<Option<Decimal>> = vec![None; actions.len()];
        let mut reevaluate = false;

        for (idx, action) in actions.iter().enumerate() {
            let kind = action.kind()?;
            if let Some(acc) = ctx.account.as_deref() {
                if !acc.matches_exec_filter(&action.exec_filter) {
                    debug!("Skipping {} on {}: exec filter", action.action_type, acc.full_id());
                    continue;
                }
            }
            let moved = self
                .dispatch(kind, ctx, action, actions, &values, &mut outcome)
                .await?;
            values[idx] = moved;
            reevaluate |= matches!(
                kind,
                ActionKind::Topup
                    | ActionKind::TopupReset
                    | ActionKind::Debit
                    | ActionKind::DebitReset
                    | ActionKind::SetBalance
                    | ActionKind::RemoveBalance
                    | ActionKind::TransferMonetaryDefault
                    | ActionKind::ResetTriggers
            );
            if outcome.account_removed {
                return Ok(outcome);
            }
        }

        if reevaluate {
            let now = ctx.now;
            let triggers = ctx.triggers;
            if let Some(acc) = ctx.account.as_deref_mut() {
                outcome.fired = acc.evaluate_triggers(triggers, None, now);
                acc.remove_expired_balances(now);
            }
        }
        Ok(outcome)
    }

    async fn dispatch(
        &self,
        kind: ActionKind,
        ctx: &mut ActionContext<'_>,
        action: &Action,
        siblings: &[Action],
        values: &[Option<Decimal>],
        outcome: &mut ActionOutcome,
    ) -> AppResult<Option<Decimal>> {
        let now = ctx.now;
        let filter = (!action.filter.is_empty()).then_some(&action.filter);
        match kind {
            ActionKind::Log => {
                self.log(ctx, action);
            }
            ActionKind::ResetTriggers => ctx.account_mut(kind)?.reset_trigger_records(filter),
            ActionKind::SetRecurrent => ctx.account_mut(kind)?.set_recurrent(filter, true),
            ActionKind::UnsetRecurrent => ctx.account_mut(kind)?.set_recurrent(filter, false),
            ActionKind::AllowNegative => ctx.account_mut(kind)?.allow_negative = true,
            ActionKind::DenyNegative => ctx.account_mut(kind)?.allow_negative = false,
            ActionKind::EnableAccount => ctx.account_mut(kind)?.disabled = false,
            ActionKind::DisableAccount => ctx.account_mut(kind)?.disabled = true,
            ActionKind::ResetAccount => {
                let acc = ctx.account_mut(kind)?;
                acc.reset_balances();
                acc.reset_counters("", &Filter::default());
                acc.reset_trigger_records(None);
            }
            ActionKind::ResetCounters => {
                ctx.account_mut(kind)?.reset_counters(&action.tor, &action.filter);
            }
            ActionKind::Topup | ActionKind::TopupReset | ActionKind::Debit | ActionKind::DebitReset => {
                let reset = matches!(kind, ActionKind::TopupReset | ActionKind::DebitReset);
                let debit = matches!(kind, ActionKind::Debit | ActionKind::DebitReset);
                let params = action.parsed_params()?;
                let acc = ctx.account_mut(kind)?;
                let moved = balance::change_balance(&self.catalog, acc, action, &params, reset, debit, now).await?;
                return Ok(Some(moved));
            }
            ActionKind::SetBalance => {
                let params = action.parsed_params()?;
                let acc = ctx.account_mut(kind)?;
                let value = balance::set_balance(&self.catalog, acc, action, &params, now).await?;
                return Ok(Some(value));
            }
            ActionKind::RemoveBalance => {
                let params = action.parsed_params()?;
                balance::remove_balance(ctx.account_mut(kind)?, action, &params)?;
            }
            ActionKind::TransferMonetaryDefault => {
                let params = action.parsed_params()?;
                let moved = balance::transfer_monetary_default(ctx.account_mut(kind)?, action, &params)?;
                return Ok(Some(moved));
            }
            ActionKind::RemoveAccount => self.remove_account(ctx, action, outcome).await?,
            ActionKind::CdrLog => {
                let acc = ctx.account_mut(kind)?;
                cdrlog::log_cdrs(self.cdrs.as_ref(), acc, action, siblings, values, now).await?;
            }
            ActionKind::CallUrl => {
                let (url, body) = self.call_url_request(ctx, action)?;
                let file = spool_file_name(kind.as_str(), &url);
                self.poster.post_or_spool(&url, &body, &file).await?;
            }
            ActionKind::CallUrlAsync => {
                let (url, body) = self.call_url_request(ctx, action)?;
                let file = spool_file_name(kind.as_str(), &url);
                let poster = self.poster.clone();
                tokio::spawn(async move {
                    if let Err(e) = poster.post_or_spool(&url, &body, &file).await {
                        warn!("Async post to {} failed: {}", url, e);
                    }
                });
            }
            ActionKind::MailAsync => self.mail_async(ctx, action)?,
            ActionKind::SetDdestinations => self.set_ddestinations(ctx).await?,
            ActionKind::Rpc => self.rpc(ctx, action, siblings).await?,
        }
        Ok(None)
    }

    fn log(&self, ctx: &ActionContext<'_>, action: &Action) {
        let payload = match (ctx.account.as_deref(), ctx.stats) {
            (Some(acc), _) => serde_json::to_string(&acc.summary()),
            (None, Some(sq)) => serde_json::to_string(sq),
            (None, None) => Ok(String::new()),
        }
        .unwrap_or_default();
        info!(
            tenant = %ctx.tenant,
            account = ctx.account.as_deref().map(|a| a.name.as_str()).unwrap_or(""),
            params = %action.params,
            "Action log: {}",
            payload
        );
    }

    async fn remove_account(
        &self,
        ctx: &mut ActionContext<'_>,
        action: &Action,
        outcome: &mut ActionOutcome,
    ) -> AppResult<()> {
        let (tenant, name) = match ctx.account.as_deref() {
            Some(acc) => (acc.tenant.clone(), acc.name.clone()),
            None => {
                let target: AccountRef = if action.params.trim().is_empty() {
                    AccountRef::default()
                } else {
                    serde_json::from_str(&action.params)
                        .map_err(|e| AppError::Parser(format!("*remove_account params: {}", e)))?
                };
                (target.tenant, target.account)
            }
        };
        if tenant.is_empty() || name.is_empty() {
            return Err(AppError::MandatoryMissing("account for *remove_account".to_string()));
        }
        self.accounts.remove_account(&tenant, &name).await.map_err(|e| {
            error!("Could not remove account {}:{}: {}", tenant, name, e);
            e
        })?;
        self.catalog.remove_action_plan_bindings(&tenant, &name).await?;
        info!("Removed account {}:{}", tenant, name);
        outcome.account_removed = ctx.account.is_some();
        Ok(())
    }

    /// URL and JSON body of a `*call_url` action
    fn call_url_request(&self, ctx: &ActionContext<'_>, action: &Action) -> AppResult<(String, Value)> {
        let url = action.params.trim().to_string();
        if url.is_empty() {
            return Err(AppError::MandatoryMissing(format!("url for {}", action.action_type)));
        }
        let body = match (ctx.account.as_deref(), ctx.stats) {
            (Some(acc), _) => serde_json::to_value(acc)?,
            (None, Some(sq)) => serde_json::to_value(sq)?,
            (None, None) => {
                return Err(AppError::MandatoryMissing(format!(
                    "account or stats for {}",
                    action.action_type
                )))
            }
        };
        Ok((url, body))
    }

    fn mail_async(&self, ctx: &ActionContext<'_>, action: &Action) -> AppResult<()> {
        let to: Vec<String> = action
            .params
            .split([',', ';'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if to.is_empty() {
            return Err(AppError::MandatoryMissing("addresses for *mail_async".to_string()));
        }

        let (subject, body) = match (ctx.account.as_deref(), ctx.stats) {
            (Some(acc), _) => (
                format!("{}: {}", MAIL_SUBJECT_PREFIX, acc.full_id()),
                format!(
                    "Time:\n\t{}\n\nBalance:\n\t{}\n",
                    ctx.now.to_rfc3339(),
                    serde_json::to_string(&acc.summary())?
                ),
            ),
            (None, Some(sq)) => (
                format!("[Apolo Notification] Threshold hit on StatsQueue: {}", sq.id),
                format!(
                    "Time:\n\t{}\n\nMetrics:\n\t{}\n",
                    ctx.now.to_rfc3339(),
                    serde_json::to_string(&sq.metrics)?
                ),
            ),
            (None, None) => {
                return Err(AppError::MandatoryMissing("account or stats for *mail_async".to_string()))
            }
        };

        let message = MailMessage {
            from: self.mailer.from_address().to_string(),
            to,
            subject,
            body,
        };
        let mailer = Arc::clone(&self.mailer);
        let attempts = self.settings.mail_attempts.max(1);
        let backoff = self.settings.mail_backoff;
        tokio::spawn(async move {
            for attempt in 0..attempts {
                match mailer.send(&message).await {
                    Ok(()) => return,
                    Err(e) if attempt + 1 == attempts => {
                        error!("Giving up mail to {:?} after {} attempts: {}", message.to, attempts, e);
                    }
                    Err(e) => {
                        warn!("Mail to {:?} failed (attempt {}): {}", message.to, attempt + 1, e);
                        tokio::time::sleep(backoff * (attempt + 1)).await;
                    }
                }
            }
        });
        Ok(())
    }

    /// Rebuild the account's dynamic destination from the stats metric keys
    async fn set_ddestinations(&self, ctx: &mut ActionContext<'_>) -> AppResult<()> {
        let stats = ctx
            .stats
            .ok_or_else(|| AppError::MandatoryMissing("stats for *set_ddestinations".to_string()))?;
        let acc = ctx.account_mut(ActionKind::SetDdestinations)?;
        let ddc = acc
            .balance_map
            .values()
            .flatten()
            .flat_map(|b| b.destination_ids.keys())
            .find(|name| name.starts_with(DDC_DESTINATION_PREFIX))
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("{} destination of {}", DDC_DESTINATION_PREFIX, acc.full_id())))?;
        self.catalog
            .replace_destination(&acc.tenant, &ddc, &stats.metric_keys)
            .await?;
        info!("Rebuilt {} with {} codes", ddc, stats.metric_keys.len());
        Ok(())
    }

    async fn rpc(&self, ctx: &ActionContext<'_>, action: &Action, siblings: &[Action]) -> AppResult<()> {
        let scope = serde_json::json!({
            "Account": ctx.account.as_deref(),
            "Action": action,
            "Actions": siblings,
            "Sq": ctx.stats,
        });
        let rendered = template::render(&action.params, &scope)?;
        let params: RpcParams = serde_json::from_str(&rendered)
            .map_err(|e| AppError::Parser(format!("*rpc params: {}", e)))?;
        let request = RpcRequest {
            address: params.address,
            transport: params.transport,
            method: params.method,
            params: params.params,
        };
        let attempts = params.attempts.max(1);
        let client = Arc::clone(&self.rpc);

        let call = async move {
            let mut last = None;
            for _ in 0..attempts {
                match client.call(&request).await {
                    Ok(reply) => {
                        debug!("RPC {} replied {}", request.method, reply);
                        return Ok(());
                    }
                    Err(e) => {
                        warn!("RPC {} to {} failed: {}", request.method, request.address, e);
                        last = Some(e);
                    }
                }
            }
            Err(last.unwrap_or_else(|| AppError::Rpc(request.method.clone())))
        };

        if params.run_async {
            tokio::spawn(async move {
                if let Err(e) = call.await {
                    error!("Async RPC failed: {}", e);
                }
            });
            Ok(())
        } else {
            call.await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apolo_core::constants::MONETARY;
    use apolo_core::models::{ActionPlanBinding, Balance, Destination, ThresholdType};
    use apolo_core::utils::string_map;
    use apolo_store::{MemoryStore, StoreCdrSink};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use tokio::sync::mpsc;

    use crate::fixtures::TENANT;

    struct ChannelMailer {
        fail_first: Mutex<u32>,
        tx: mpsc::UnboundedSender<MailMessage>,
    }

    #[async_trait]
    impl Mailer for ChannelMailer {
        fn from_address(&self) -> &str {
            "rater@localhost"
        }

        async fn send(&self, message: &MailMessage) -> AppResult<()> {
            let mut fail = self.fail_first.lock();
            if *fail > 0 {
                *fail -= 1;
                return Err(AppError::Mail("busy".to_string()));
            }
            let _ = self.tx.send(message.clone());
            Ok(())
        }
    }

    struct RecordingRpc {
        calls: Mutex<Vec<RpcRequest>>,
    }

    #[async_trait]
    impl RpcClient for RecordingRpc {
        async fn call(&self, request: &RpcRequest) -> AppResult<Value> {
            self.calls.lock().push(request.clone());
            Ok(Value::String("OK".into()))
        }
    }

    fn runtime(store: Arc<MemoryStore>) -> ActionRuntime {
        let settings = ActionSettings {
            mail_backoff: Duration::from_millis(1),
            ..Default::default()
        };
        ActionRuntime::new(
            Arc::new(Catalog::new(store.clone(), Duration::from_millis(100))),
            Arc::new(AccountStore::new(store.clone())),
            Arc::new(StoreCdrSink::new(store)),
            settings,
        )
        .unwrap()
    }

    fn account() -> Account {
        let mut acc = Account::new(TENANT, "rif");
        acc.balance_map
            .insert(MONETARY.into(), vec![Balance::new("main", dec!(10))]);
        acc
    }

    #[tokio::test]
    async fn test_flags_and_unknown_kind() {
        let rt = runtime(Arc::new(MemoryStore::new()));
        let mut acc = account();
        let actions = vec![
            Action::new(ActionKind::AllowNegative, "", ""),
            Action::new(ActionKind::DisableAccount, "", ""),
            Action {
                action_type: "*teleport".into(),
                ..Default::default()
            },
            Action::new(ActionKind::EnableAccount, "", ""),
        ];
        let mut ctx = ActionContext::for_account(&mut acc, &[], Utc::now());
        let err = rt.execute(&mut ctx, &actions).await.unwrap_err();
        assert_eq!(err.error_code(), "unknown_action_kind");
        assert!(acc.allow_negative);
        assert!(acc.disabled);
    }

    #[tokio::test]
    async fn test_exec_filter_skips() {
        let rt = runtime(Arc::new(MemoryStore::new()));
        let mut acc = account();
        let mut topup = Action::new(ActionKind::Topup, MONETARY, r#"{"Balance":{"ID":"main","Value":5}}"#);
        topup.exec_filter = Filter::compile(r#"{"Value":{"$gt":100}}"#).unwrap();
        let mut ctx = ActionContext::for_account(&mut acc, &[], Utc::now());
        rt.execute(&mut ctx, &[topup]).await.unwrap();
        assert_eq!(acc.balances(MONETARY)[0].value, dec!(10));
    }

    #[tokio::test]
    async fn test_topup_fires_balance_trigger() {
        let rt = runtime(Arc::new(MemoryStore::new()));
        let mut acc = account();
        let mut at = ActionTrigger::new("big", ThresholdType::MaxBalance, dec!(12), "NOTIFY");
        at.tor = MONETARY.into();
        let triggers = vec![at];
        acc.init_trigger_records(&triggers);

        let topup = Action::new(ActionKind::Topup, MONETARY, r#"{"Balance":{"ID":"main","Value":5}}"#);
        let mut ctx = ActionContext::for_account(&mut acc, &triggers, Utc::now());
        let outcome = rt.execute(&mut ctx, &[topup]).await.unwrap();
        assert_eq!(outcome.fired, vec!["big".to_string()]);
        assert!(acc.trigger_records["big"].executed);
    }

    #[tokio::test]
    async fn test_reset_account() {
        let rt = runtime(Arc::new(MemoryStore::new()));
        let mut acc = account();
        acc.trigger_records.insert(
            "t".into(),
            apolo_core::models::ActionTriggerRecord {
                unique_id: "t".into(),
                executed: true,
                ..Default::default()
            },
        );
        let mut ctx = ActionContext::for_account(&mut acc, &[], Utc::now());
        rt.execute(&mut ctx, &[Action::new(ActionKind::ResetAccount, "", "")])
            .await
            .unwrap();
        assert!(acc.balance_map.is_empty());
        assert!(!acc.trigger_records["t"].executed);
    }

    #[tokio::test]
    async fn test_reset_then_topups_match_fresh_account() {
        let rt = runtime(Arc::new(MemoryStore::new()));
        let topups = vec![
            Action::new(ActionKind::Topup, MONETARY, r#"{"Balance":{"ID":"main","Value":5}}"#),
            Action::new(ActionKind::Topup, MONETARY, r#"{"Balance":{"ID":"bonus","Value":2}}"#),
        ];
        let now = Utc::now();

        let mut used = account();
        let mut actions = vec![Action::new(ActionKind::ResetAccount, "", "")];
        actions.extend(topups.iter().cloned());
        let mut ctx = ActionContext::for_account(&mut used, &[], now);
        rt.execute(&mut ctx, &actions).await.unwrap();

        let mut fresh = Account::new(TENANT, "rif");
        let mut ctx = ActionContext::for_account(&mut fresh, &[], now);
        rt.execute(&mut ctx, &topups).await.unwrap();

        let fields = |acc: &Account| {
            let mut map = acc.balance_map.clone();
            for b in map.values_mut().flatten() {
                b.uuid.clear();
            }
            map
        };
        assert_eq!(fields(&used), fields(&fresh));
        assert_eq!(fresh.balances(MONETARY).len(), 2);
    }

    #[tokio::test]
    async fn test_remove_account() {
        let store = Arc::new(MemoryStore::new());
        let rt = runtime(store.clone());
        let accounts = AccountStore::new(store);
        let mut acc = account();
        accounts.set_account(&acc).await.unwrap();
        rt.catalog()
            .set_action_plan_binding(&ActionPlanBinding::new(TENANT, "rif", "MONTHLY"))
            .await
            .unwrap();

        let actions = vec![
            Action::new(ActionKind::RemoveAccount, "", ""),
            Action::new(ActionKind::DisableAccount, "", ""),
        ];
        let mut ctx = ActionContext::for_account(&mut acc, &[], Utc::now());
        let outcome = rt.execute(&mut ctx, &actions).await.unwrap();
        assert!(outcome.account_removed);
        assert!(!acc.disabled);
        assert!(accounts.find_account(TENANT, "rif").await.unwrap().is_none());
        assert!(rt
            .catalog()
            .plans_for_account(TENANT, "rif")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_account_required() {
        let rt = runtime(Arc::new(MemoryStore::new()));
        let mut ctx = ActionContext::detached(TENANT, None, Utc::now());
        let err = rt
            .execute(&mut ctx, &[Action::new(ActionKind::Topup, MONETARY, "")])
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "mandatory_missing");
        assert!(!requires_account(ActionKind::Log));
        assert!(requires_account(ActionKind::SetDdestinations));
    }

    #[tokio::test]
    async fn test_mail_retries() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let rt = runtime(Arc::new(MemoryStore::new())).with_mailer(Arc::new(ChannelMailer {
            fail_first: Mutex::new(2),
            tx,
        }));
        let mut acc = account();
        let mut ctx = ActionContext::for_account(&mut acc, &[], Utc::now());
        rt.execute(
            &mut ctx,
            &[Action::new(ActionKind::MailAsync, "", "ops@example.com;billing@example.com")],
        )
        .await
        .unwrap();

        let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.to, vec!["ops@example.com", "billing@example.com"]);
        assert!(message.subject.starts_with(MAIL_SUBJECT_PREFIX));
        assert!(message.subject.ends_with("t1:rif"));
    }

    #[tokio::test]
    async fn test_set_ddestinations() {
        let rt = runtime(Arc::new(MemoryStore::new()));
        rt.catalog()
            .set_destination(&Destination::new(TENANT, "111", "*ddc_rif"))
            .await
            .unwrap();
        let mut acc = account();
        let mut b = Balance::new("ddc", dec!(5));
        b.destination_ids = string_map(&["*ddc_rif"]);
        acc.balance_map.insert("*voice".into(), vec![b]);
        let stats = StatsSnapshot {
            tenant: TENANT.into(),
            id: "Q1".into(),
            metric_keys: vec!["222".into(), "333".into()],
            ..Default::default()
        };
        let mut ctx = ActionContext::for_account(&mut acc, &[], Utc::now());
        ctx.stats = Some(&stats);
        rt.execute(&mut ctx, &[Action::new(ActionKind::SetDdestinations, "", "")])
            .await
            .unwrap();

        let mut codes = rt.catalog().destination_codes(TENANT, "*ddc_rif").await.unwrap();
        codes.sort();
        assert_eq!(codes, vec!["222", "333"]);
    }

    #[tokio::test]
    async fn test_rpc_template() {
        let rpc = Arc::new(RecordingRpc {
            calls: Mutex::new(Vec::new()),
        });
        let rt = runtime(Arc::new(MemoryStore::new())).with_rpc_client(rpc.clone());
        let mut acc = account();
        let action = Action::new(
            ActionKind::Rpc,
            "",
            r#"{"Address":"127.0.0.1:2012","Transport":"*json","Method":"Accounts.Notify","Attempts":1,"Async":false,"Params":{"Tenant":"<< .Account.tenant >>","Name":"<< .Account.name >>"}}"#,
        );
        let mut ctx = ActionContext::for_account(&mut acc, &[], Utc::now());
        rt.execute(&mut ctx, &[action]).await.unwrap();

        let calls = rpc.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].method, "Accounts.Notify");
        assert_eq!(calls[0].params["Name"], "rif");
        assert_eq!(calls[0].params["Tenant"], TENANT);
    }
}
