//! Core domain model for the customer-bought-product index.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cbp-core";

/// Value substituted for missing or malformed identifiers.
pub const UNKNOWN_ID: &str = "0";

/// Longest digit string accepted as an identifier; keeps every id inside `i64`.
const MAX_ID_DIGITS: usize = 18;

/// Identifier columns of the staging relation that get repaired before the merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdColumn {
    Product,
    Variation,
    Customer,
}

impl IdColumn {
    pub const ALL: [IdColumn; 3] = [IdColumn::Product, IdColumn::Variation, IdColumn::Customer];

    pub fn column_name(self) -> &'static str {
        match self {
            IdColumn::Product => "product_id",
            IdColumn::Variation => "variation_id",
            IdColumn::Customer => "customer_id",
        }
    }
}

impl fmt::Display for IdColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column_name())
    }
}

/// True when `value` is a plain non-negative integer that fits the final schema.
pub fn is_numeric_id(value: &str) -> bool {
    !value.is_empty() && value.len() <= MAX_ID_DIGITS && value.bytes().all(|b| b.is_ascii_digit())
}

/// Coerce a missing, empty or non-numeric identifier to [`UNKNOWN_ID`].
///
/// Returns whether the value was changed.
pub fn repair_id(value: &mut Option<String>) -> bool {
    match value {
        Some(v) if is_numeric_id(v) => false,
        _ => {
            *value = Some(UNKNOWN_ID.to_string());
            true
        }
    }
}

/// How the extraction step treats line items lacking one of the required metadata keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingMetaPolicy {
    /// Exclude the line item from the batch.
    #[default]
    Strict,
    /// Keep the line item; missing ids are repaired to `0`, missing emails become empty.
    Lenient,
}

impl FromStr for MissingMetaPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "lenient" => Ok(Self::Lenient),
            other => Err(format!("unknown missing-meta policy `{other}`")),
        }
    }
}

/// One order line as it comes out of the source relations. Metadata values are raw text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOrderLine {
    pub product_id: Option<String>,
    pub variation_id: Option<String>,
    pub order_id: i64,
    pub order_status: String,
    pub customer_id: Option<String>,
    pub customer_email: Option<String>,
}

impl SourceOrderLine {
    pub fn has_required_meta(&self) -> bool {
        self.product_id.is_some()
            && self.variation_id.is_some()
            && self.customer_id.is_some()
            && self.customer_email.is_some()
    }
}

/// Working-memory mirror of a source line for the duration of one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingRow {
    pub product_id: Option<String>,
    pub variation_id: Option<String>,
    pub order_id: String,
    pub customer_id: Option<String>,
    pub customer_email: Option<String>,
}

impl StagingRow {
    pub fn column_mut(&mut self, column: IdColumn) -> &mut Option<String> {
        match column {
            IdColumn::Product => &mut self.product_id,
            IdColumn::Variation => &mut self.variation_id,
            IdColumn::Customer => &mut self.customer_id,
        }
    }

    /// Uniqueness key of the final row this staging row merges into.
    ///
    /// Unrepaired identifiers read as `0`, matching what the repair passes produce.
    pub fn purchase_key(&self) -> PurchaseKey {
        PurchaseKey {
            product_id: parse_id(self.product_id.as_deref()),
            variation_id: parse_id(self.variation_id.as_deref()),
            customer_id: parse_id(self.customer_id.as_deref()),
            customer_email: normalize_email(self.customer_email.as_deref().unwrap_or_default()),
            order_id: parse_id(Some(&self.order_id)),
        }
    }
}

impl From<&SourceOrderLine> for StagingRow {
    fn from(line: &SourceOrderLine) -> Self {
        Self {
            product_id: line.product_id.clone(),
            variation_id: line.variation_id.clone(),
            order_id: line.order_id.to_string(),
            customer_id: line.customer_id.clone(),
            customer_email: line.customer_email.clone(),
        }
    }
}

fn parse_id(value: Option<&str>) -> i64 {
    value
        .filter(|v| is_numeric_id(v))
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// The columns the final relation is unique on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PurchaseKey {
    pub product_id: i64,
    pub variation_id: i64,
    pub customer_id: i64,
    pub customer_email: String,
    pub order_id: i64,
}

/// Durable denormalized purchase fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalRow {
    pub id: i64,
    pub product_id: i64,
    pub variation_id: i64,
    pub order_id: i64,
    pub customer_id: i64,
    pub customer_email: String,
}

impl FinalRow {
    pub fn from_key(id: i64, key: PurchaseKey) -> Self {
        Self {
            id,
            product_id: key.product_id,
            variation_id: key.variation_id,
            order_id: key.order_id,
            customer_id: key.customer_id,
            customer_email: key.customer_email,
        }
    }

    pub fn key(&self) -> PurchaseKey {
        PurchaseKey {
            product_id: self.product_id,
            variation_id: self.variation_id,
            customer_id: self.customer_id,
            customer_email: self.customer_email.clone(),
            order_id: self.order_id,
        }
    }

    pub fn matches_product(&self, product_id: i64) -> bool {
        self.product_id == product_id || self.variation_id == product_id
    }

    pub fn references(&self, source_id: i64) -> bool {
        self.product_id == source_id || self.variation_id == source_id || self.order_id == source_id
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn email_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9!#$%&'*+/=?^_`{|}~.-]+@[A-Za-z0-9-]+(\.[A-Za-z0-9-]+)+$")
            .expect("email pattern compiles")
    })
}

/// Syntactic email check used before an address is allowed into a lookup.
pub fn is_valid_email(email: &str) -> bool {
    let email = email.trim();
    email.len() >= 6
        && email.len() <= 254
        && !email.contains("..")
        && email_pattern().is_match(email)
}

/// An address that cannot exist in the final relation.
pub fn no_match_sentinel() -> String {
    format!("no-match-{}@invalid.invalid", Uuid::new_v4().simple())
}

/// Build the normalized, deduplicated email list for a lookup.
///
/// Never empty: with no usable address a fresh [`no_match_sentinel`] is returned.
pub fn candidate_emails(account_email: Option<&str>, customer_email: &str) -> Vec<String> {
    let mut emails: Vec<String> = Vec::with_capacity(2);
    for email in account_email.into_iter().chain(std::iter::once(customer_email)) {
        if !is_valid_email(email) {
            continue;
        }
        let email = normalize_email(email);
        if !emails.contains(&email) {
            emails.push(email);
        }
    }
    if emails.is_empty() {
        emails.push(no_match_sentinel());
    }
    emails
}

/// Payload of one queued sync task: the offset of the next batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchTask {
    pub offset: u64,
}

impl BatchTask {
    pub fn start() -> Self {
        Self { offset: 0 }
    }

    pub fn advance(self, limit: u64) -> Self {
        Self {
            offset: self.offset.saturating_add(limit),
        }
    }
}

/// Persisted sync flags.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncState {
    pub has_synced: bool,
    pub notice_dismissed: bool,
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
}

impl SyncState {
    /// Record a completed full run. Returns true only on the first completion.
    pub fn mark_synced(&mut self, now: DateTime<Utc>) -> bool {
        if self.has_synced {
            return false;
        }
        self.has_synced = true;
        self.synced_at = Some(now);
        true
    }

    pub fn dismiss_notice(&mut self) {
        self.notice_dismissed = true;
    }

    pub fn notice(&self, updating: bool) -> Notice {
        if updating {
            Notice::Updating
        } else if !self.has_synced {
            Notice::Update
        } else if !self.notice_dismissed {
            Notice::Updated
        } else {
            Notice::None
        }
    }
}

/// Operator-facing notice derived from [`SyncState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Notice {
    Update,
    Updating,
    Updated,
    None,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn repair_coerces_empty_missing_and_garbage() {
        let mut empty = Some(String::new());
        let mut missing = None;
        let mut garbage = Some("12a".to_string());
        let mut valid = Some("42".to_string());

        assert!(repair_id(&mut empty));
        assert!(repair_id(&mut missing));
        assert!(repair_id(&mut garbage));
        assert!(!repair_id(&mut valid));

        assert_eq!(empty.as_deref(), Some("0"));
        assert_eq!(missing.as_deref(), Some("0"));
        assert_eq!(garbage.as_deref(), Some("0"));
        assert_eq!(valid.as_deref(), Some("42"));
    }

    #[test]
    fn repair_rejects_ids_that_overflow_the_final_schema() {
        let mut huge = Some("9".repeat(19));
        assert!(repair_id(&mut huge));
        assert_eq!(huge.as_deref(), Some(UNKNOWN_ID));
    }

    #[test]
    fn staging_key_normalizes_email_and_ids() {
        let row = StagingRow {
            product_id: Some("5".into()),
            variation_id: Some(String::new()),
            order_id: "100".into(),
            customer_id: None,
            customer_email: Some("  A@X.com ".into()),
        };
        assert_eq!(
            row.purchase_key(),
            PurchaseKey {
                product_id: 5,
                variation_id: 0,
                customer_id: 0,
                customer_email: "a@x.com".into(),
                order_id: 100,
            }
        );
    }

    #[test]
    fn email_validation() {
        assert!(is_valid_email("a@x.com"));
        assert!(is_valid_email(" first.last+tag@shop.example.org "));
        assert!(!is_valid_email(""));
        assert!(!is_valid_email("not-an-email"));
        assert!(!is_valid_email("a@localhost"));
        assert!(!is_valid_email("a..b@x.com"));
    }

    #[test]
    fn candidate_emails_dedupe_case_insensitively() {
        let emails = candidate_emails(Some("Buyer@Shop.com"), "buyer@shop.com");
        assert_eq!(emails, vec!["buyer@shop.com".to_string()]);

        let emails = candidate_emails(Some("one@shop.com"), "two@shop.com");
        assert_eq!(emails.len(), 2);
    }

    #[test]
    fn candidate_emails_fall_back_to_unique_sentinel() {
        let first = candidate_emails(None, "");
        let second = candidate_emails(None, "garbage");
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_ne!(first[0], second[0]);
        assert!(first[0].starts_with("no-match-"));
    }

    #[test]
    fn sync_state_marks_synced_once() {
        let at = Utc.with_ymd_and_hms(2026, 10, 1, 8, 0, 0).single().unwrap();
        let later = Utc.with_ymd_and_hms(2026, 10, 2, 8, 0, 0).single().unwrap();
        let mut state = SyncState::default();

        assert!(state.mark_synced(at));
        assert!(!state.mark_synced(later));
        assert_eq!(state.synced_at, Some(at));
    }

    #[test]
    fn notice_follows_state() {
        let mut state = SyncState::default();
        assert_eq!(state.notice(false), Notice::Update);
        assert_eq!(state.notice(true), Notice::Updating);

        state.mark_synced(Utc::now());
        assert_eq!(state.notice(false), Notice::Updated);

        state.dismiss_notice();
        assert_eq!(state.notice(false), Notice::None);
    }

    #[test]
    fn sync_state_deserializes_without_timestamp() {
        let state: SyncState =
            serde_json::from_str(r#"{"has_synced":true,"notice_dismissed":false}"#).unwrap();
        assert!(state.has_synced);
        assert_eq!(state.synced_at, None);
    }

    #[test]
    fn batch_task_advances_by_limit() {
        assert_eq!(BatchTask::start().advance(10).advance(10), BatchTask { offset: 20 });
    }

    #[test]
    fn missing_meta_policy_parses() {
        assert_eq!("Lenient".parse::<MissingMetaPolicy>().unwrap(), MissingMetaPolicy::Lenient);
        assert!("loose".parse::<MissingMetaPolicy>().is_err());
    }
}
