//! Physical inventory sessions.
//!
//! A session snapshots theoretical quantities per (article, location),
//! collects counts and records the decision taken for every line. Ledger
//! adjustments are posted on the stock cells by the caller; the session
//! keeps the resulting `Adjustment` records.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use depotledger_core::{
    AdjustmentId, Aggregate, AggregateRoot, ArticleId, DomainError, DomainResult, EntityRef,
    InventoryLineId, InventorySessionId, LocationId, MovementId, UserId, WarehouseId, ZoneId,
};
use depotledger_events::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Draft,
    InProgress,
    Closed,
    Cancelled,
}

impl SessionStatus {
    const TRANSITIONS: &'static [(SessionStatus, SessionStatus)] = &[
        (SessionStatus::Draft, SessionStatus::InProgress),
        (SessionStatus::Draft, SessionStatus::Cancelled),
        (SessionStatus::InProgress, SessionStatus::Closed),
        (SessionStatus::InProgress, SessionStatus::Cancelled),
    ];

    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        Self::TRANSITIONS.contains(&(self, next))
    }

    pub fn is_open(self) -> bool {
        matches!(self, SessionStatus::Draft | SessionStatus::InProgress)
    }
}

impl core::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            SessionStatus::Draft => "draft",
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Closed => "closed",
            SessionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineStatus {
    Pending,
    Counted,
    Validated,
    Adjusted,
    Excluded,
}

impl LineStatus {
    const TRANSITIONS: &'static [(LineStatus, LineStatus)] = &[
        (LineStatus::Pending, LineStatus::Counted),
        (LineStatus::Counted, LineStatus::Counted),
        (LineStatus::Counted, LineStatus::Validated),
        (LineStatus::Counted, LineStatus::Adjusted),
        (LineStatus::Pending, LineStatus::Excluded),
        (LineStatus::Counted, LineStatus::Excluded),
    ];

    pub fn can_transition_to(self, next: LineStatus) -> bool {
        Self::TRANSITIONS.contains(&(self, next))
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LineStatus::Validated | LineStatus::Adjusted | LineStatus::Excluded
        )
    }
}

impl core::fmt::Display for LineStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            LineStatus::Pending => "pending",
            LineStatus::Counted => "counted",
            LineStatus::Validated => "validated",
            LineStatus::Adjusted => "adjusted",
            LineStatus::Excluded => "excluded",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineDecision {
    /// Count was wrong and has been corrected; no posting.
    Accept,
    /// Post the variance to the ledger.
    Adjust,
    /// Leave the line out of the session.
    Exclude,
}

impl LineDecision {
    fn outcome(self, variance: i64) -> LineStatus {
        match self {
            LineDecision::Accept => LineStatus::Validated,
            LineDecision::Adjust if variance == 0 => LineStatus::Validated,
            LineDecision::Adjust => LineStatus::Adjusted,
            LineDecision::Exclude => LineStatus::Excluded,
        }
    }
}

/// What a session counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryScope {
    pub warehouse_id: WarehouseId,
    pub zone_id: Option<ZoneId>,
    pub category: Option<String>,
}

impl InventoryScope {
    pub fn warehouse(warehouse_id: WarehouseId) -> Self {
        Self {
            warehouse_id,
            zone_id: None,
            category: None,
        }
    }

    pub fn in_zone(mut self, zone_id: ZoneId) -> Self {
        self.zone_id = Some(zone_id);
        self
    }

    pub fn in_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }
}

/// Theoretical position of one (article, location) when a line is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSnapshot {
    pub article_id: ArticleId,
    pub location_id: Option<LocationId>,
    pub theoretical: i64,
    pub unit_cost: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryLine {
    pub id: InventoryLineId,
    pub article_id: ArticleId,
    pub location_id: Option<LocationId>,
    pub theoretical: i64,
    pub counted: Option<i64>,
    /// Number of counts recorded so far.
    pub rounds: u32,
    pub unit_cost: Decimal,
    pub status: LineStatus,
    pub recount_required: bool,
    pub decision: Option<LineDecision>,
}

impl InventoryLine {
    fn from_snapshot(snapshot: &LineSnapshot) -> Self {
        Self {
            id: InventoryLineId::new(),
            article_id: snapshot.article_id,
            location_id: snapshot.location_id,
            theoretical: snapshot.theoretical,
            counted: None,
            rounds: 0,
            unit_cost: snapshot.unit_cost,
            status: LineStatus::Pending,
            recount_required: false,
            decision: None,
        }
    }

    /// counted − theoretical, once counted.
    pub fn variance(&self) -> Option<i64> {
        self.counted.map(|c| c - self.theoretical)
    }

    pub fn variance_value(&self) -> Option<Decimal> {
        self.variance().map(|v| Decimal::from(v) * self.unit_cost)
    }
}

/// Ledger correction made from a validated line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Adjustment {
    pub id: AdjustmentId,
    pub line_id: InventoryLineId,
    pub article_id: ArticleId,
    pub location_id: Option<LocationId>,
    pub quantity: i64,
    pub value: Decimal,
    pub movements: Vec<MovementId>,
    pub created_at: DateTime<Utc>,
}

/// When a first count must be repeated before validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecountPolicy {
    /// |variance| / theoretical above which a recount is asked for.
    pub variance_ratio: Decimal,
    /// |variance| × unit cost above which a recount is asked for.
    pub variance_value: Option<Decimal>,
}

impl Default for RecountPolicy {
    fn default() -> Self {
        Self {
            variance_ratio: Decimal::new(10, 2),
            variance_value: None,
        }
    }
}

impl RecountPolicy {
    pub fn requires_recount(&self, theoretical: i64, counted: i64, unit_cost: Decimal) -> bool {
        let variance = (counted - theoretical).abs();
        if variance == 0 {
            return false;
        }
        let over_ratio = theoretical == 0
            || Decimal::from(variance) / Decimal::from(theoretical) > self.variance_ratio;
        let over_value = self
            .variance_value
            .is_some_and(|limit| Decimal::from(variance) * unit_cost > limit);
        over_ratio || over_value
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenSession {
    pub session_id: InventorySessionId,
    pub scope: InventoryScope,
    pub lines: Vec<LineSnapshot>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordCount {
    pub line_id: InventoryLineId,
    pub counted: i64,
    pub policy: RecountPolicy,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateLine {
    pub line_id: InventoryLineId,
    pub decision: LineDecision,
    /// Proceed although the line still asks for a recount.
    pub acknowledge_recount: bool,
    /// Ledger movements already posted for an `Adjust` decision.
    pub movements: Vec<MovementId>,
    /// Quantity those movements posted; the snapshot variance when unset.
    pub posted: Option<i64>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionCommand {
    Open(OpenSession),
    Start { occurred_at: DateTime<Utc> },
    AddLine { snapshot: LineSnapshot, occurred_at: DateTime<Utc> },
    RecordCount(RecordCount),
    ValidateLine(ValidateLine),
    Close { occurred_at: DateTime<Utc> },
    Cancel { reason: Option<String>, occurred_at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOpened {
    pub session_id: InventorySessionId,
    pub scope: InventoryScope,
    pub lines: Vec<InventoryLine>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountRecorded {
    pub line_id: InventoryLineId,
    pub counted: i64,
    pub recount_required: bool,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineValidated {
    pub line_id: InventoryLineId,
    pub decision: LineDecision,
    pub status: LineStatus,
    pub adjustment: Option<Adjustment>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    Opened(SessionOpened),
    Started { occurred_at: DateTime<Utc> },
    LineAdded { line: InventoryLine, occurred_at: DateTime<Utc> },
    CountRecorded(CountRecorded),
    LineValidated(LineValidated),
    Closed { occurred_at: DateTime<Utc> },
    Cancelled { reason: Option<String>, occurred_at: DateTime<Utc> },
}

impl Event for SessionEvent {
    fn event_type(&self) -> &'static str {
        match self {
            SessionEvent::Opened(_) => "inventory.session.opened",
            SessionEvent::Started { .. } => "inventory.session.started",
            SessionEvent::LineAdded { .. } => "inventory.session.line_added",
            SessionEvent::CountRecorded(_) => "inventory.session.count_recorded",
            SessionEvent::LineValidated(_) => "inventory.session.line_validated",
            SessionEvent::Closed { .. } => "inventory.session.closed",
            SessionEvent::Cancelled { .. } => "inventory.session.cancelled",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            SessionEvent::Opened(e) => e.occurred_at,
            SessionEvent::Started { occurred_at }
            | SessionEvent::LineAdded { occurred_at, .. }
            | SessionEvent::Closed { occurred_at }
            | SessionEvent::Cancelled { occurred_at, .. } => *occurred_at,
            SessionEvent::CountRecorded(e) => e.occurred_at,
            SessionEvent::LineValidated(e) => e.occurred_at,
        }
    }
}

/// Aggregate root: InventorySession.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventorySession {
    id: InventorySessionId,
    scope: Option<InventoryScope>,
    status: SessionStatus,
    lines: Vec<InventoryLine>,
    adjustments: Vec<Adjustment>,
    opened_by: Option<UserId>,
    opened_at: Option<DateTime<Utc>>,
    closed_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl InventorySession {
    /// Create an empty, not-yet-opened aggregate instance for rehydration.
    pub fn empty(id: InventorySessionId) -> Self {
        Self {
            id,
            scope: None,
            status: SessionStatus::Draft,
            lines: Vec::new(),
            adjustments: Vec::new(),
            opened_by: None,
            opened_at: None,
            closed_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> InventorySessionId {
        self.id
    }

    pub fn scope(&self) -> Option<&InventoryScope> {
        self.scope.as_ref()
    }

    pub fn warehouse_id(&self) -> Option<WarehouseId> {
        self.scope.as_ref().map(|s| s.warehouse_id)
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn lines(&self) -> &[InventoryLine] {
        &self.lines
    }

    pub fn line(&self, line_id: InventoryLineId) -> Option<&InventoryLine> {
        self.lines.iter().find(|l| l.id == line_id)
    }

    pub fn adjustments(&self) -> &[Adjustment] {
        &self.adjustments
    }

    pub fn closed_at(&self) -> Option<DateTime<Utc>> {
        self.closed_at
    }

    fn entity(&self) -> EntityRef {
        EntityRef::InventorySession(self.id)
    }

    fn line_or_not_found(&self, line_id: InventoryLineId) -> DomainResult<&InventoryLine> {
        self.line(line_id)
            .ok_or_else(|| DomainError::not_found(EntityRef::InventoryLine(line_id)))
    }

    fn ensure_open(&self, action: &str) -> DomainResult<()> {
        if !self.created {
            return Err(DomainError::not_found(self.entity()));
        }
        if !self.status.is_open() {
            return Err(DomainError::transition(self.entity(), self.status, action));
        }
        Ok(())
    }

    /// Checks a validation without recording it.
    ///
    /// Callers run this before posting an adjustment so that a rejected
    /// decision never reaches the ledger.
    pub fn check_validation(
        &self,
        line_id: InventoryLineId,
        decision: LineDecision,
        acknowledge_recount: bool,
    ) -> DomainResult<&InventoryLine> {
        self.ensure_open("validate a line")?;
        let line = self.line_or_not_found(line_id)?;
        let variance = line.variance().unwrap_or(0);
        let next = decision.outcome(variance);
        if !line.status.can_transition_to(next) {
            return Err(DomainError::transition(
                EntityRef::InventoryLine(line.id),
                line.status,
                format!("become {next}"),
            ));
        }
        if line.recount_required && !acknowledge_recount && decision != LineDecision::Exclude {
            return Err(DomainError::RecountRequired { line: line.id });
        }
        Ok(line)
    }

    fn handle_open(&self, cmd: &OpenSession) -> DomainResult<Vec<SessionEvent>> {
        if self.created {
            return Err(DomainError::conflict(format!(
                "inventory session {} already exists",
                self.id
            )));
        }
        let mut lines: Vec<InventoryLine> = Vec::with_capacity(cmd.lines.len());
        for snapshot in &cmd.lines {
            if lines
                .iter()
                .any(|l| l.article_id == snapshot.article_id && l.location_id == snapshot.location_id)
            {
                return Err(DomainError::validation(format!(
                    "article {} is listed twice for the same location",
                    snapshot.article_id
                )));
            }
            lines.push(InventoryLine::from_snapshot(snapshot));
        }
        Ok(vec![SessionEvent::Opened(SessionOpened {
            session_id: cmd.session_id,
            scope: cmd.scope.clone(),
            lines,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_add_line(&self, snapshot: &LineSnapshot, occurred_at: DateTime<Utc>) -> DomainResult<Vec<SessionEvent>> {
        self.ensure_open("add a line")?;
        if self
            .lines
            .iter()
            .any(|l| l.article_id == snapshot.article_id && l.location_id == snapshot.location_id)
        {
            return Err(DomainError::conflict(format!(
                "article {} already has a line for that location",
                snapshot.article_id
            )));
        }
        Ok(vec![SessionEvent::LineAdded {
            line: InventoryLine::from_snapshot(snapshot),
            occurred_at,
        }])
    }

    fn handle_count(&self, cmd: &RecordCount) -> DomainResult<Vec<SessionEvent>> {
        self.ensure_open("record a count")?;
        if cmd.counted < 0 {
            return Err(DomainError::validation("counted quantity cannot be negative"));
        }
        let line = self.line_or_not_found(cmd.line_id)?;
        if !line.status.can_transition_to(LineStatus::Counted) {
            return Err(DomainError::transition(
                EntityRef::InventoryLine(line.id),
                line.status,
                "record a count",
            ));
        }

        // Only a first count can trip the recount rule; any later count clears it.
        let recount_required = line.rounds == 0
            && cmd
                .policy
                .requires_recount(line.theoretical, cmd.counted, line.unit_cost);

        let mut events = Vec::with_capacity(2);
        if self.status == SessionStatus::Draft {
            events.push(SessionEvent::Started {
                occurred_at: cmd.occurred_at,
            });
        }
        events.push(SessionEvent::CountRecorded(CountRecorded {
            line_id: line.id,
            counted: cmd.counted,
            recount_required,
            occurred_at: cmd.occurred_at,
        }));
        Ok(events)
    }

    fn handle_validate(&self, cmd: &ValidateLine) -> DomainResult<Vec<SessionEvent>> {
        let line = self.check_validation(cmd.line_id, cmd.decision, cmd.acknowledge_recount)?;
        let quantity = cmd.posted.or(line.variance()).unwrap_or(0);
        let status = cmd.decision.outcome(quantity);

        let adjustment = (status == LineStatus::Adjusted).then(|| Adjustment {
            id: AdjustmentId::new(),
            line_id: line.id,
            article_id: line.article_id,
            location_id: line.location_id,
            quantity,
            value: Decimal::from(quantity) * line.unit_cost,
            movements: cmd.movements.clone(),
            created_at: cmd.occurred_at,
        });
        if adjustment.as_ref().is_some_and(|a| a.movements.is_empty()) {
            return Err(DomainError::invalid_movement(
                "an adjusted line must reference its ledger movements",
            ));
        }

        Ok(vec![SessionEvent::LineValidated(LineValidated {
            line_id: line.id,
            decision: cmd.decision,
            status,
            adjustment,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_close(&self, occurred_at: DateTime<Utc>) -> DomainResult<Vec<SessionEvent>> {
        self.ensure_open("close")?;
        if !self.status.can_transition_to(SessionStatus::Closed) {
            return Err(DomainError::transition(self.entity(), self.status, "close"));
        }
        let open = self.lines.iter().filter(|l| !l.status.is_terminal()).count();
        if open > 0 {
            return Err(DomainError::validation(format!(
                "{open} line(s) still pending or counted"
            )));
        }
        Ok(vec![SessionEvent::Closed { occurred_at }])
    }
}

impl AggregateRoot for InventorySession {
    type Id = InventorySessionId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl Aggregate for InventorySession {
    type Command = SessionCommand;
    type Event = SessionEvent;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            SessionEvent::Opened(e) => {
                self.id = e.session_id;
                self.scope = Some(e.scope.clone());
                self.lines = e.lines.clone();
                self.opened_by = Some(e.actor);
                self.opened_at = Some(e.occurred_at);
                self.status = SessionStatus::Draft;
                self.created = true;
            }
            SessionEvent::Started { .. } => self.status = SessionStatus::InProgress,
            SessionEvent::LineAdded { line, .. } => self.lines.push(line.clone()),
            SessionEvent::CountRecorded(e) => {
                if let Some(line) = self.lines.iter_mut().find(|l| l.id == e.line_id) {
                    line.counted = Some(e.counted);
                    line.rounds += 1;
                    line.recount_required = e.recount_required;
                    line.status = LineStatus::Counted;
                }
            }
            SessionEvent::LineValidated(e) => {
                if let Some(line) = self.lines.iter_mut().find(|l| l.id == e.line_id) {
                    line.status = e.status;
                    line.decision = Some(e.decision);
                }
                if let Some(adjustment) = &e.adjustment {
                    self.adjustments.push(adjustment.clone());
                }
            }
            SessionEvent::Closed { occurred_at } => {
                self.status = SessionStatus::Closed;
                self.closed_at = Some(*occurred_at);
            }
            SessionEvent::Cancelled { .. } => self.status = SessionStatus::Cancelled,
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> DomainResult<Vec<Self::Event>> {
        match command {
            SessionCommand::Open(cmd) => self.handle_open(cmd),
            SessionCommand::Start { occurred_at } => {
                self.ensure_open("start")?;
                if !self.status.can_transition_to(SessionStatus::InProgress) {
                    return Err(DomainError::transition(self.entity(), self.status, "start"));
                }
                Ok(vec![SessionEvent::Started {
                    occurred_at: *occurred_at,
                }])
            }
            SessionCommand::AddLine { snapshot, occurred_at } => self.handle_add_line(snapshot, *occurred_at),
            SessionCommand::RecordCount(cmd) => self.handle_count(cmd),
            SessionCommand::ValidateLine(cmd) => self.handle_validate(cmd),
            SessionCommand::Close { occurred_at } => self.handle_close(*occurred_at),
            SessionCommand::Cancel { reason, occurred_at } => {
                self.ensure_open("cancel")?;
                Ok(vec![SessionEvent::Cancelled {
                    reason: reason.clone(),
                    occurred_at: *occurred_at,
                }])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depotledger_core::ErrorKind;
    use rust_decimal_macros::dec;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn session(theoretical: &[i64]) -> InventorySession {
        let id = InventorySessionId::new();
        let mut s = InventorySession::empty(id);
        s.execute(&SessionCommand::Open(OpenSession {
            session_id: id,
            scope: InventoryScope::warehouse(WarehouseId::new()),
            lines: theoretical
                .iter()
                .map(|q| LineSnapshot {
                    article_id: ArticleId::new(),
                    location_id: None,
                    theoretical: *q,
                    unit_cost: dec!(2),
                })
                .collect(),
            actor: UserId::new(),
            occurred_at: now(),
        }))
        .unwrap();
        s
    }

    fn count(s: &mut InventorySession, idx: usize, counted: i64) -> DomainResult<Vec<SessionEvent>> {
        let line_id = s.lines()[idx].id;
        s.execute(&SessionCommand::RecordCount(RecordCount {
            line_id,
            counted,
            policy: RecountPolicy::default(),
            occurred_at: now(),
        }))
    }

    fn validate(
        s: &mut InventorySession,
        idx: usize,
        decision: LineDecision,
        acknowledge_recount: bool,
    ) -> DomainResult<Vec<SessionEvent>> {
        let line_id = s.lines()[idx].id;
        s.execute(&SessionCommand::ValidateLine(ValidateLine {
            line_id,
            decision,
            acknowledge_recount,
            movements: vec![MovementId::new()],
            posted: None,
            occurred_at: now(),
        }))
    }

    #[test]
    fn first_count_starts_the_session() {
        let mut s = session(&[100]);
        assert_eq!(s.status(), SessionStatus::Draft);
        let events = count(&mut s, 0, 95).unwrap();
        assert!(matches!(events[0], SessionEvent::Started { .. }));
        assert_eq!(s.status(), SessionStatus::InProgress);
        assert_eq!(s.lines()[0].variance(), Some(-5));
    }

    #[test]
    fn adjusting_a_five_unit_shortfall_records_the_variance() {
        let mut s = session(&[100]);
        count(&mut s, 0, 95).unwrap();
        validate(&mut s, 0, LineDecision::Adjust, false).unwrap();

        let adjustment = &s.adjustments()[0];
        assert_eq!(adjustment.quantity, -5);
        assert_eq!(adjustment.value, dec!(-10));
        assert_eq!(s.lines()[0].status, LineStatus::Adjusted);
    }

    #[test]
    fn adjustment_records_what_was_actually_posted() {
        let mut s = session(&[100, 50]);
        count(&mut s, 0, 95).unwrap();
        count(&mut s, 1, 48).unwrap();

        let line_id = s.lines()[0].id;
        s.execute(&SessionCommand::ValidateLine(ValidateLine {
            line_id,
            decision: LineDecision::Adjust,
            acknowledge_recount: false,
            movements: vec![MovementId::new()],
            posted: Some(-3),
            occurred_at: now(),
        }))
        .unwrap();
        assert_eq!(s.adjustments()[0].quantity, -3);
        assert_eq!(s.adjustments()[0].value, dec!(-6));

        // Stock already moved to the counted figure: nothing left to post.
        let line_id = s.lines()[1].id;
        s.execute(&SessionCommand::ValidateLine(ValidateLine {
            line_id,
            decision: LineDecision::Adjust,
            acknowledge_recount: false,
            movements: Vec::new(),
            posted: Some(0),
            occurred_at: now(),
        }))
        .unwrap();
        assert_eq!(s.lines()[1].status, LineStatus::Validated);
        assert_eq!(s.adjustments().len(), 1);
    }

    #[test]
    fn large_variance_needs_a_recount_or_acknowledgement() {
        let mut s = session(&[10, 10]);
        count(&mut s, 0, 5).unwrap();
        assert!(s.lines()[0].recount_required);

        let err = validate(&mut s, 0, LineDecision::Adjust, false).unwrap_err();
        assert!(matches!(err, DomainError::RecountRequired { .. }));
        assert_eq!(err.kind(), ErrorKind::Validation);

        count(&mut s, 0, 6).unwrap();
        assert!(!s.lines()[0].recount_required);
        assert_eq!(s.lines()[0].rounds, 2);
        validate(&mut s, 0, LineDecision::Adjust, false).unwrap();

        count(&mut s, 1, 2).unwrap();
        validate(&mut s, 1, LineDecision::Accept, true).unwrap();
        assert_eq!(s.lines()[1].status, LineStatus::Validated);
    }

    #[test]
    fn value_threshold_trips_recount_under_the_ratio() {
        let policy = RecountPolicy {
            variance_ratio: dec!(0.10),
            variance_value: Some(dec!(50)),
        };
        assert!(!policy.requires_recount(1000, 995, dec!(5)));
        assert!(policy.requires_recount(1000, 980, dec!(5)));
        assert!(policy.requires_recount(0, 1, dec!(0)));
        assert!(!policy.requires_recount(7, 7, dec!(100)));
    }

    #[test]
    fn pending_lines_can_only_be_excluded() {
        let mut s = session(&[3, 4]);
        count(&mut s, 1, 4).unwrap();

        let err = validate(&mut s, 0, LineDecision::Accept, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);

        validate(&mut s, 0, LineDecision::Exclude, false).unwrap();
        assert_eq!(s.lines()[0].status, LineStatus::Excluded);
        assert!(s.adjustments().is_empty());
    }

    #[test]
    fn adjusting_a_matching_count_validates_without_adjustment() {
        let mut s = session(&[8]);
        count(&mut s, 0, 8).unwrap();
        validate(&mut s, 0, LineDecision::Adjust, false).unwrap();
        assert_eq!(s.lines()[0].status, LineStatus::Validated);
        assert!(s.adjustments().is_empty());
    }

    #[test]
    fn close_requires_every_line_terminal() {
        let mut s = session(&[5, 5]);
        count(&mut s, 0, 5).unwrap();
        validate(&mut s, 0, LineDecision::Accept, false).unwrap();
        count(&mut s, 1, 5).unwrap();

        let err = s.handle(&SessionCommand::Close { occurred_at: now() }).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        validate(&mut s, 1, LineDecision::Accept, false).unwrap();
        s.execute(&SessionCommand::Close { occurred_at: now() }).unwrap();
        assert_eq!(s.status(), SessionStatus::Closed);

        let err = s
            .handle(&SessionCommand::Cancel {
                reason: None,
                occurred_at: now(),
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);
    }

    #[test]
    fn unexpected_stock_gets_its_own_line() {
        let mut s = session(&[5]);
        let article = ArticleId::new();
        let snapshot = LineSnapshot {
            article_id: article,
            location_id: Some(LocationId::new()),
            theoretical: 0,
            unit_cost: dec!(1.5),
        };
        s.execute(&SessionCommand::AddLine {
            snapshot: snapshot.clone(),
            occurred_at: now(),
        })
        .unwrap();
        assert_eq!(s.lines().len(), 2);

        let err = s
            .handle(&SessionCommand::AddLine {
                snapshot,
                occurred_at: now(),
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }
}
