use std::collections::{BTreeMap, BTreeSet};
use std::convert::Infallible;
use std::fmt::{Display, Formatter};

use serde::Serialize;
use time::macros::offset;
use time::{Date, Month, OffsetDateTime, UtcOffset};
use ulid::Ulid;
use uuid::Uuid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SegmentError {
    #[error("invalid format of parameter 'slug'")]
    InvalidSlug,
    #[error("invalid format of parameter 'userID'")]
    InvalidUserId,
    #[error("invalid format of parameter 'period'")]
    InvalidPeriod,
    #[error("missing required parameters")]
    MissingParameters,
    #[error("segment with this slug already exists")]
    SegmentAlreadyExists,
    #[error("segment not found")]
    SegmentNotFound,
    #[error("validation error: {0}")]
    Validation(String),
}

/// Human-chosen segment identifier. Letters, digits, underscore, hyphen;
/// matching is exact and case-sensitive.
#[derive(Debug, Clone, Serialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct Slug(String);

impl Slug {
    /// Parses and validates a slug against `^[\w-]+$`.
    ///
    /// # Errors
    /// Returns [`SegmentError::InvalidSlug`] for an empty value or any
    /// character outside ASCII letters, digits, `_` and `-`.
    pub fn parse(raw: &str) -> Result<Self, SegmentError> {
        if raw.is_empty() {
            return Err(SegmentError::InvalidSlug);
        }
        if !raw
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
        {
            return Err(SegmentError::InvalidSlug);
        }
        Ok(Self(raw.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Slug {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Externally issued 128-bit user identifier. Existence is assumed, never
/// checked against a user registry.
#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    /// Parses the canonical textual UUID form.
    ///
    /// # Errors
    /// Returns [`SegmentError::InvalidUserId`] when the value is not a
    /// well-formed UUID.
    pub fn parse(raw: &str) -> Result<Self, SegmentError> {
        Uuid::parse_str(raw)
            .map(Self)
            .map_err(|_| SegmentError::InvalidUserId)
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Opaque internal catalog key for a segment, used for joins only.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SegmentKey(pub i64);

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Add,
    Remove,
}

impl AuditAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "add" => Some(Self::Add),
            "remove" => Some(Self::Remove),
            _ => None,
        }
    }
}

/// One immutable record of an effective membership state transition.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct AuditEntry {
    pub entry_seq: i64,
    pub entry_id: Ulid,
    pub user_id: UserId,
    pub slug: Slug,
    pub action: AuditAction,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

/// An audit entry before the log assigns its sequence number.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct AuditEntryInput {
    pub entry_id: Ulid,
    pub user_id: UserId,
    pub slug: Slug,
    pub action: AuditAction,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

/// A calendar month, parsed from `yyyy-mm`. Queries interpret it as the
/// half-open window `[first day, first day of next month)`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Period {
    first_day: Date,
    next_month: Date,
}

impl Period {
    /// Parses a `yyyy-mm` period designator.
    ///
    /// # Errors
    /// Returns [`SegmentError::InvalidPeriod`] for anything that is not four
    /// digits, a hyphen, and a month number in `01..=12`.
    pub fn parse(raw: &str) -> Result<Self, SegmentError> {
        let bytes = raw.as_bytes();
        if bytes.len() != 7
            || bytes[4] != b'-'
            || !bytes[..4].iter().all(u8::is_ascii_digit)
            || !bytes[5..].iter().all(u8::is_ascii_digit)
        {
            return Err(SegmentError::InvalidPeriod);
        }

        let year: i32 = raw[..4].parse().map_err(|_| SegmentError::InvalidPeriod)?;
        let month_number: u8 = raw[5..].parse().map_err(|_| SegmentError::InvalidPeriod)?;
        let month = Month::try_from(month_number).map_err(|_| SegmentError::InvalidPeriod)?;

        let first_day =
            Date::from_calendar_date(year, month, 1).map_err(|_| SegmentError::InvalidPeriod)?;
        let next_month = match month {
            Month::December => Date::from_calendar_date(year + 1, Month::January, 1),
            other => Date::from_calendar_date(year, other.next(), 1),
        }
        .map_err(|_| SegmentError::InvalidPeriod)?;

        Ok(Self {
            first_day,
            next_month,
        })
    }

    #[must_use]
    pub fn start(&self) -> OffsetDateTime {
        self.first_day.midnight().assume_utc()
    }

    #[must_use]
    pub fn end(&self) -> OffsetDateTime {
        self.next_month.midnight().assume_utc()
    }

    #[must_use]
    pub fn contains(&self, value: OffsetDateTime) -> bool {
        value >= self.start() && value < self.end()
    }
}

impl Display for Period {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04}-{:02}",
            self.first_day.year(),
            u8::from(self.first_day.month())
        )
    }
}

/// The transaction-scoped contract the mutation engine runs against.
///
/// One implementor bundles the three collaborator contracts: the catalog
/// (`resolve_segment`), the membership store (`membership_exists`,
/// `add_membership`, `remove_membership`) and the audit log (`append_audit`).
/// Implementations exist over a SQLite transaction and over in-process maps;
/// the engine cannot tell them apart.
pub trait UnitOfWork {
    type Error: std::error::Error + Send + Sync + 'static;

    fn resolve_segment(&mut self, slug: &Slug) -> Result<Option<SegmentKey>, Self::Error>;

    fn membership_exists(&mut self, user: UserId, segment: SegmentKey)
        -> Result<bool, Self::Error>;
    fn add_membership(&mut self, user: UserId, segment: SegmentKey) -> Result<(), Self::Error>;
    fn remove_membership(&mut self, user: UserId, segment: SegmentKey)
        -> Result<(), Self::Error>;

    fn append_audit(&mut self, entry: &AuditEntryInput) -> Result<(), Self::Error>;
}

#[derive(Debug, thiserror::Error)]
pub enum MutationError<E: std::error::Error + 'static> {
    #[error("segment not found")]
    SegmentNotFound(Slug),
    #[error(transparent)]
    Storage(#[from] E),
}

/// One effective change applied by a mutation request.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct AppliedMutation {
    pub slug: Slug,
    pub action: AuditAction,
}

/// Applies a batch of segment removals and additions for one user.
///
/// Every slug across both lists is resolved against the catalog before any
/// row is touched, so an unknown slug anywhere leaves the store unchanged.
/// Removals are then fully processed before additions: a slug present in both
/// lists nets to "added". Only effective changes mutate the membership store,
/// and each one appends exactly one audit entry stamped with `now`; no-ops
/// (removing a non-member, re-adding a member, duplicates within a list) are
/// skipped silently and never audited.
///
/// The caller owns the transaction boundary: all reads and writes issued here
/// must commit together or not at all.
///
/// # Errors
/// [`MutationError::SegmentNotFound`] when a slug does not resolve, before
/// any mutation; [`MutationError::Storage`] when the unit of work fails.
pub fn apply_mutation<U: UnitOfWork>(
    uow: &mut U,
    user: UserId,
    to_add: &[Slug],
    to_remove: &[Slug],
    now: OffsetDateTime,
) -> Result<Vec<AppliedMutation>, MutationError<U::Error>> {
    let mut removals = Vec::with_capacity(to_remove.len());
    for slug in to_remove {
        match uow.resolve_segment(slug)? {
            Some(key) => removals.push((slug, key)),
            None => return Err(MutationError::SegmentNotFound(slug.clone())),
        }
    }

    let mut additions = Vec::with_capacity(to_add.len());
    for slug in to_add {
        match uow.resolve_segment(slug)? {
            Some(key) => additions.push((slug, key)),
            None => return Err(MutationError::SegmentNotFound(slug.clone())),
        }
    }

    let mut applied = Vec::new();

    for (slug, key) in removals {
        if uow.membership_exists(user, key)? {
            uow.remove_membership(user, key)?;
            uow.append_audit(&AuditEntryInput {
                entry_id: Ulid::new(),
                user_id: user,
                slug: slug.clone(),
                action: AuditAction::Remove,
                recorded_at: now,
            })?;
            applied.push(AppliedMutation {
                slug: slug.clone(),
                action: AuditAction::Remove,
            });
        }
    }

    for (slug, key) in additions {
        if !uow.membership_exists(user, key)? {
            uow.add_membership(user, key)?;
            uow.append_audit(&AuditEntryInput {
                entry_id: Ulid::new(),
                user_id: user,
                slug: slug.clone(),
                action: AuditAction::Add,
                recorded_at: now,
            })?;
            applied.push(AppliedMutation {
                slug: slug.clone(),
                action: AuditAction::Add,
            });
        }
    }

    Ok(applied)
}

/// Fixed offset the report renders timestamps in.
pub const REPORT_DISPLAY_OFFSET: UtcOffset = offset!(+3);

/// One flat report row, rendered from an audit entry.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct ReportRow {
    pub user_id: String,
    pub slug: String,
    pub action: String,
    pub timestamp: String,
}

/// Renders audit entries as flat report rows: user id as text, slug, action
/// as text, and the timestamp at second precision in the fixed display
/// offset. Entry order is preserved.
///
/// # Errors
/// Returns [`SegmentError::Validation`] when timestamp formatting fails.
pub fn report_rows(entries: &[AuditEntry]) -> Result<Vec<ReportRow>, SegmentError> {
    let format = time::macros::format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second]"
    );

    let mut rows = Vec::with_capacity(entries.len());
    for entry in entries {
        let timestamp = entry
            .recorded_at
            .to_offset(REPORT_DISPLAY_OFFSET)
            .format(format)
            .map_err(|err| {
                SegmentError::Validation(format!("failed to format report timestamp: {err}"))
            })?;
        rows.push(ReportRow {
            user_id: entry.user_id.to_string(),
            slug: entry.slug.to_string(),
            action: entry.action.as_str().to_string(),
            timestamp,
        });
    }
    Ok(rows)
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`SegmentError::Validation`] when parsing fails or the input is
/// not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, SegmentError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| SegmentError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(SegmentError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`SegmentError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, SegmentError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            SegmentError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

/// Current UTC time truncated to whole seconds. Audit timestamps live at
/// second precision so their stored RFC3339 forms are fixed-width and compare
/// in chronological order.
#[must_use]
pub fn now_utc() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc().to_offset(UtcOffset::UTC);
    now.replace_nanosecond(0).unwrap_or(now)
}

/// In-process store over plain maps: the swappable counterpart of the SQLite
/// implementation, used by engine tests and as an executable description of
/// the mutation semantics.
#[derive(Debug, Default)]
pub struct MemoryStore {
    next_key: i64,
    next_seq: i64,
    segments: BTreeMap<Slug, SegmentKey>,
    memberships: BTreeSet<(SegmentKey, UserId)>,
    audit: Vec<AuditEntry>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns [`SegmentError::SegmentAlreadyExists`] when the slug already
    /// resolves.
    pub fn create_segment(&mut self, slug: &Slug) -> Result<SegmentKey, SegmentError> {
        if self.segments.contains_key(slug) {
            return Err(SegmentError::SegmentAlreadyExists);
        }
        self.next_key += 1;
        let key = SegmentKey(self.next_key);
        self.segments.insert(slug.clone(), key);
        Ok(key)
    }

    /// Deletes a segment and all memberships referencing it. The cascade is
    /// structural: no audit entries are written for the removed memberships.
    ///
    /// # Errors
    /// Returns [`SegmentError::SegmentNotFound`] when the slug is absent.
    pub fn delete_segment(&mut self, slug: &Slug) -> Result<(), SegmentError> {
        let Some(key) = self.segments.remove(slug) else {
            return Err(SegmentError::SegmentNotFound);
        };
        self.memberships.retain(|(member_key, _)| *member_key != key);
        Ok(())
    }

    /// # Errors
    /// Returns [`SegmentError::SegmentNotFound`] when any slug in either
    /// list does not resolve; no change is applied in that case.
    pub fn apply(
        &mut self,
        user: UserId,
        to_add: &[Slug],
        to_remove: &[Slug],
    ) -> Result<Vec<AppliedMutation>, SegmentError> {
        self.apply_at(user, to_add, to_remove, now_utc())
    }

    /// Same as [`MemoryStore::apply`] with a caller-controlled timestamp.
    ///
    /// # Errors
    /// See [`MemoryStore::apply`].
    pub fn apply_at(
        &mut self,
        user: UserId,
        to_add: &[Slug],
        to_remove: &[Slug],
        now: OffsetDateTime,
    ) -> Result<Vec<AppliedMutation>, SegmentError> {
        apply_mutation(self, user, to_add, to_remove, now).map_err(|err| match err {
            MutationError::SegmentNotFound(_) => SegmentError::SegmentNotFound,
            MutationError::Storage(never) => match never {},
        })
    }

    #[must_use]
    pub fn user_segments(&self, user: UserId) -> Vec<Slug> {
        self.segments
            .iter()
            .filter(|(_, key)| self.memberships.contains(&(**key, user)))
            .map(|(slug, _)| slug.clone())
            .collect()
    }

    #[must_use]
    pub fn audit_entries(&self, period: Period, user: Option<UserId>) -> Vec<AuditEntry> {
        let mut entries: Vec<AuditEntry> = self
            .audit
            .iter()
            .filter(|entry| period.contains(entry.recorded_at))
            .filter(|entry| user.map_or(true, |filter| entry.user_id == filter))
            .cloned()
            .collect();
        entries.sort_by(|lhs, rhs| {
            lhs.recorded_at
                .cmp(&rhs.recorded_at)
                .then(lhs.entry_seq.cmp(&rhs.entry_seq))
        });
        entries
    }
}

impl UnitOfWork for MemoryStore {
    type Error = Infallible;

    fn resolve_segment(&mut self, slug: &Slug) -> Result<Option<SegmentKey>, Self::Error> {
        Ok(self.segments.get(slug).copied())
    }

    fn membership_exists(
        &mut self,
        user: UserId,
        segment: SegmentKey,
    ) -> Result<bool, Self::Error> {
        Ok(self.memberships.contains(&(segment, user)))
    }

    fn add_membership(&mut self, user: UserId, segment: SegmentKey) -> Result<(), Self::Error> {
        self.memberships.insert((segment, user));
        Ok(())
    }

    fn remove_membership(&mut self, user: UserId, segment: SegmentKey) -> Result<(), Self::Error> {
        self.memberships.remove(&(segment, user));
        Ok(())
    }

    fn append_audit(&mut self, entry: &AuditEntryInput) -> Result<(), Self::Error> {
        self.next_seq += 1;
        self.audit.push(AuditEntry {
            entry_seq: self.next_seq,
            entry_id: entry.entry_id,
            user_id: entry.user_id,
            slug: entry.slug.clone(),
            action: entry.action,
            recorded_at: entry.recorded_at,
        });
        Ok(())
    }
}
