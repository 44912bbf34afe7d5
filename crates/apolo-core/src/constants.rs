//! Well-known identifiers shared across the engine

/// Wildcard destination, subject and filter value
pub const ANY: &str = "*any";

/// Identifier of the default monetary balance
pub const META_DEFAULT: &str = "*default";

/// Rating plan identifier recorded for spans rated outside any plan
pub const META_NONE: &str = "*none";

/// Rating subjects starting with this prefix grant flat zero-cost units
pub const ZERO_RATING_SUBJECT_PREFIX: &str = "*zero";

/// Subject tried when a rating profile is missing
pub const FALLBACK_SUBJECT: &str = ANY;

/// Start time marking a timing for immediate execution
pub const ASAP: &str = "*asap";

/// Default call direction
pub const OUT: &str = "*out";

/// Minimum destination prefix length used for matching
pub const MIN_PREFIX_MATCH: usize = 2;

/// Maximum depth followed through rating profile fallback subjects
pub const RECURSION_MAX_DEPTH: usize = 10;

/// Prefix of dynamic destination identifiers maintained by `*set_ddestinations`
pub const DDC_DESTINATION_PREFIX: &str = "*ddc";

/// Separator used when building composite identifiers
pub const CONCATENATED_KEY_SEP: &str = ":";

/// Global rounding scale used when nothing else is configured
pub const DEFAULT_ROUNDING_DECIMALS: u32 = 6;

/// Delivery attempts for mail notifications
pub const MAIL_ATTEMPTS: u32 = 5;

/// Default request type stamped on CDRs written by `*cdrlog`
pub const META_PREPAID: &str = "*prepaid";

/// Source written on CDRs generated by actions
pub const CDRLOG_SOURCE: &str = "*cdrlog";

/// Subject line prefix of threshold notification mails
pub const MAIL_SUBJECT_PREFIX: &str = "[Apolo Notification] Threshold hit on Balance";

/// Money balances
pub const MONETARY: &str = "*monetary";

/// Voice usage, measured in seconds
pub const VOICE: &str = "*voice";

/// Data usage
pub const DATA: &str = "*data";

/// Message usage
pub const SMS: &str = "*sms";

/// Unit balances usable for every non-monetary TOR
pub const GENERIC: &str = "*generic";
