//! Storage key constants and builders
//!
//! Provides standardized key naming patterns for every stored entity so the
//! in-memory and Redis backends lay data out the same way.
//!
//! # Key Patterns
//!
//! - `{kind}:{tenant}:{key}` - Catalog entities (rating plans, profiles, ...)
//! - `dst:{tenant}:{name}` - Set of prefix codes of a destination
//! - `rdst:{tenant}:{code}` - Set of destination names sharing a code
//! - `acc:{tenant}:{name}` - Accounts
//! - `apb:{tenant}:{plan}` - Set of accounts bound to an action plan
//! - `aap:{tenant}:{account}` - Set of action plans bound to an account
//! - `tsk` - FIFO list of pending tasks
//! - `cdr:{cdr_id}` - CDRs written by the sink
//!
//! # Example
//!
//! ```
//! use apolo_store::keys;
//!
//! assert_eq!(keys::account_key("t1", "1001"), "acc:t1:1001");
//! assert_eq!(keys::reverse_destination_key("t1", "4917"), "rdst:t1:4917");
//! ```

/// Prefix for destination code sets
pub const DESTINATION_PREFIX: &str = "dst";

/// Prefix for the reverse destination index
pub const REVERSE_DESTINATION_PREFIX: &str = "rdst";

/// Prefix for accounts
pub const ACCOUNT_PREFIX: &str = "acc";

/// Prefix for plan to accounts bindings
pub const PLAN_BINDINGS_PREFIX: &str = "apb";

/// Prefix for account to plans bindings
pub const ACCOUNT_PLANS_PREFIX: &str = "aap";

/// List holding pending tasks
pub const TASKS_KEY: &str = "tsk";

/// Prefix for CDRs
pub const CDR_PREFIX: &str = "cdr";

/// Build the key of a catalog entity
///
/// Format: `{kind}:{tenant}:{key}`
pub fn entity_key(kind: &str, tenant: &str, key: &str) -> String {
    format!("{}:{}:{}", kind, tenant, key)
}

/// Prefix shared by every entity of `kind` in `tenant`
pub fn entity_prefix(kind: &str, tenant: &str) -> String {
    format!("{}:{}:", kind, tenant)
}

/// Build the key of a destination code set
///
/// Format: `dst:{tenant}:{name}`
pub fn destination_key(tenant: &str, name: &str) -> String {
    format!("{}:{}:{}", DESTINATION_PREFIX, tenant, name)
}

/// Build the key of the names bound to a prefix code
///
/// Format: `rdst:{tenant}:{code}`
pub fn reverse_destination_key(tenant: &str, code: &str) -> String {
    format!("{}:{}:{}", REVERSE_DESTINATION_PREFIX, tenant, code)
}

/// Build the key of an account
///
/// Format: `acc:{tenant}:{name}`
pub fn account_key(tenant: &str, name: &str) -> String {
    format!("{}:{}:{}", ACCOUNT_PREFIX, tenant, name)
}

/// Build the key of the accounts bound to a plan
///
/// Format: `apb:{tenant}:{plan}`
pub fn plan_bindings_key(tenant: &str, plan: &str) -> String {
    format!("{}:{}:{}", PLAN_BINDINGS_PREFIX, tenant, plan)
}

/// Build the key of the plans bound to an account
///
/// Format: `aap:{tenant}:{account}`
pub fn account_plans_key(tenant: &str, account: &str) -> String {
    format!("{}:{}:{}", ACCOUNT_PLANS_PREFIX, tenant, account)
}

/// Build the key of a CDR
///
/// Format: `cdr:{cdr_id}`
pub fn cdr_key(cdr_id: &str) -> String {
    format!("{}:{}", CDR_PREFIX, cdr_id)
}

/// Strip a builder prefix, returning the trailing identifier
pub fn suffix<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    key.strip_prefix(prefix)
}
