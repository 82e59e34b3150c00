use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keystone_core::{Aggregate, AggregateId, DomainError, SnapshotError};
use keystone_events::{Command, Event};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseStatus {
    /// Never issued. The initial state of every stream.
    Unissued,
    Active,
    Suspended,
    /// Terminal.
    Revoked,
}

/// Aggregate root: License.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct License {
    id: AggregateId,
    status: LicenseStatus,
    product: String,
    holder: String,
    seats: u32,
    expires_at: Option<DateTime<Utc>>,
    renewals: u32,
    suspension_reason: Option<String>,
}

impl License {
    pub fn id(&self) -> AggregateId {
        self.id
    }

    pub fn status(&self) -> LicenseStatus {
        self.status
    }

    pub fn product(&self) -> &str {
        &self.product
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn seats(&self) -> u32 {
        self.seats
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn renewals(&self) -> u32 {
        self.renewals
    }

    pub fn suspension_reason(&self) -> Option<&str> {
        self.suspension_reason.as_deref()
    }

    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.status == LicenseStatus::Active && self.expires_at.is_some_and(|exp| at < exp)
    }
}

// Commands

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueLicense {
    pub license_id: AggregateId,
    pub product: String,
    pub holder: String,
    pub seats: u32,
    pub expires_at: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewLicense {
    pub license_id: AggregateId,
    pub expires_at: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSeats {
    pub license_id: AggregateId,
    pub seats: u32,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspendLicense {
    pub license_id: AggregateId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReinstateLicense {
    pub license_id: AggregateId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokeLicense {
    pub license_id: AggregateId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LicenseCommand {
    Issue(IssueLicense),
    Renew(RenewLicense),
    ChangeSeats(ChangeSeats),
    Suspend(SuspendLicense),
    Reinstate(ReinstateLicense),
    Revoke(RevokeLicense),
}

impl Command for LicenseCommand {
    fn target_aggregate_id(&self) -> AggregateId {
        match self {
            LicenseCommand::Issue(c) => c.license_id,
            LicenseCommand::Renew(c) => c.license_id,
            LicenseCommand::ChangeSeats(c) => c.license_id,
            LicenseCommand::Suspend(c) => c.license_id,
            LicenseCommand::Reinstate(c) => c.license_id,
            LicenseCommand::Revoke(c) => c.license_id,
        }
    }
}

// Events

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseIssued {
    pub license_id: AggregateId,
    pub product: String,
    pub holder: String,
    pub seats: u32,
    pub expires_at: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseRenewed {
    pub license_id: AggregateId,
    pub previous_expires_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatsChanged {
    pub license_id: AggregateId,
    pub previous_seats: u32,
    pub seats: u32,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseSuspended {
    pub license_id: AggregateId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseReinstated {
    pub license_id: AggregateId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseRevoked {
    pub license_id: AggregateId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LicenseEvent {
    Issued(LicenseIssued),
    Renewed(LicenseRenewed),
    SeatsChanged(SeatsChanged),
    Suspended(LicenseSuspended),
    Reinstated(LicenseReinstated),
    Revoked(LicenseRevoked),
}

impl Event for LicenseEvent {
    fn event_type(&self) -> &'static str {
        match self {
            LicenseEvent::Issued(_) => "licensing.license.issued",
            LicenseEvent::Renewed(_) => "licensing.license.renewed",
            LicenseEvent::SeatsChanged(_) => "licensing.license.seats_changed",
            LicenseEvent::Suspended(_) => "licensing.license.suspended",
            LicenseEvent::Reinstated(_) => "licensing.license.reinstated",
            LicenseEvent::Revoked(_) => "licensing.license.revoked",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            LicenseEvent::Issued(e) => e.occurred_at,
            LicenseEvent::Renewed(e) => e.occurred_at,
            LicenseEvent::SeatsChanged(e) => e.occurred_at,
            LicenseEvent::Suspended(e) => e.occurred_at,
            LicenseEvent::Reinstated(e) => e.occurred_at,
            LicenseEvent::Revoked(e) => e.occurred_at,
        }
    }
}

/// Serialized license state used for snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseSnapshot {
    pub status: LicenseStatus,
    pub product: String,
    pub holder: String,
    pub seats: u32,
    pub expires_at: Option<DateTime<Utc>>,
    pub renewals: u32,
    #[serde(default)]
    pub suspension_reason: Option<String>,
}

impl Aggregate for License {
    type Command = LicenseCommand;
    type Event = LicenseEvent;
    type Error = DomainError;
    type Snapshot = LicenseSnapshot;

    fn aggregate_type() -> &'static str {
        "licensing.license"
    }

    fn empty(id: AggregateId) -> Self {
        Self {
            id,
            status: LicenseStatus::Unissued,
            product: String::new(),
            holder: String::new(),
            seats: 0,
            expires_at: None,
            renewals: 0,
            suspension_reason: None,
        }
    }

    fn apply(&mut self, event: &Self::Event) {
        match event {
            LicenseEvent::Issued(e) => {
                self.status = LicenseStatus::Active;
                self.product = e.product.clone();
                self.holder = e.holder.clone();
                self.seats = e.seats;
                self.expires_at = Some(e.expires_at);
            }
            LicenseEvent::Renewed(e) => {
                self.expires_at = Some(e.expires_at);
                self.renewals += 1;
            }
            LicenseEvent::SeatsChanged(e) => {
                self.seats = e.seats;
            }
            LicenseEvent::Suspended(e) => {
                self.status = LicenseStatus::Suspended;
                self.suspension_reason = Some(e.reason.clone());
            }
            LicenseEvent::Reinstated(_) => {
                self.status = LicenseStatus::Active;
                self.suspension_reason = None;
            }
            LicenseEvent::Revoked(_) => {
                self.status = LicenseStatus::Revoked;
            }
        }
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            LicenseCommand::Issue(cmd) => self.handle_issue(cmd),
            LicenseCommand::Renew(cmd) => self.handle_renew(cmd),
            LicenseCommand::ChangeSeats(cmd) => self.handle_change_seats(cmd),
            LicenseCommand::Suspend(cmd) => self.handle_suspend(cmd),
            LicenseCommand::Reinstate(cmd) => self.handle_reinstate(cmd),
            LicenseCommand::Revoke(cmd) => self.handle_revoke(cmd),
        }
    }

    fn snapshot(&self) -> Option<Self::Snapshot> {
        Some(LicenseSnapshot {
            status: self.status,
            product: self.product.clone(),
            holder: self.holder.clone(),
            seats: self.seats,
            expires_at: self.expires_at,
            renewals: self.renewals,
            suspension_reason: self.suspension_reason.clone(),
        })
    }

    fn restore(id: AggregateId, snapshot: Self::Snapshot) -> Result<Self, SnapshotError> {
        if snapshot.status != LicenseStatus::Unissued && snapshot.expires_at.is_none() {
            return Err(SnapshotError::Incompatible {
                aggregate_type: Self::aggregate_type().to_string(),
                reason: "issued license snapshot has no expiry".to_string(),
            });
        }
        Ok(Self {
            id,
            status: snapshot.status,
            product: snapshot.product,
            holder: snapshot.holder,
            seats: snapshot.seats,
            expires_at: snapshot.expires_at,
            renewals: snapshot.renewals,
            suspension_reason: snapshot.suspension_reason,
        })
    }
}

impl License {
    fn ensure_license_id(&self, license_id: AggregateId) -> Result<(), DomainError> {
        if self.id != license_id {
            return Err(DomainError::invariant("license_id mismatch"));
        }
        Ok(())
    }

    fn ensure_issued(&self) -> Result<(), DomainError> {
        match self.status {
            LicenseStatus::Unissued => Err(DomainError::not_found()),
            LicenseStatus::Revoked => Err(DomainError::invariant("license is revoked")),
            LicenseStatus::Active | LicenseStatus::Suspended => Ok(()),
        }
    }

    fn handle_issue(&self, cmd: &IssueLicense) -> Result<Vec<LicenseEvent>, DomainError> {
        self.ensure_license_id(cmd.license_id)?;
        if self.status != LicenseStatus::Unissued {
            return Err(DomainError::conflict("license already issued"));
        }
        if cmd.product.trim().is_empty() {
            return Err(DomainError::validation("product cannot be empty"));
        }
        if cmd.holder.trim().is_empty() {
            return Err(DomainError::validation("holder cannot be empty"));
        }
        if cmd.seats == 0 {
            return Err(DomainError::validation("seats must be at least 1"));
        }
        if cmd.expires_at <= cmd.occurred_at {
            return Err(DomainError::validation("expiry must be after issue time"));
        }

        Ok(vec![LicenseEvent::Issued(LicenseIssued {
            license_id: cmd.license_id,
            product: cmd.product.trim().to_string(),
            holder: cmd.holder.trim().to_string(),
            seats: cmd.seats,
            expires_at: cmd.expires_at,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_renew(&self, cmd: &RenewLicense) -> Result<Vec<LicenseEvent>, DomainError> {
        self.ensure_license_id(cmd.license_id)?;
        self.ensure_issued()?;

        let previous = self
            .expires_at
            .ok_or_else(|| DomainError::invariant("issued license has no expiry"))?;
        if cmd.expires_at <= previous {
            return Err(DomainError::validation(
                "renewal must extend the current expiry",
            ));
        }

        Ok(vec![LicenseEvent::Renewed(LicenseRenewed {
            license_id: cmd.license_id,
            previous_expires_at: previous,
            expires_at: cmd.expires_at,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_change_seats(&self, cmd: &ChangeSeats) -> Result<Vec<LicenseEvent>, DomainError> {
        self.ensure_license_id(cmd.license_id)?;
        self.ensure_issued()?;

        if self.status != LicenseStatus::Active {
            return Err(DomainError::invariant("seats can only change on an active license"));
        }
        if cmd.seats == 0 {
            return Err(DomainError::validation("seats must be at least 1"));
        }
        if cmd.seats == self.seats {
            return Err(DomainError::validation("seat count unchanged"));
        }

        Ok(vec![LicenseEvent::SeatsChanged(SeatsChanged {
            license_id: cmd.license_id,
            previous_seats: self.seats,
            seats: cmd.seats,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_suspend(&self, cmd: &SuspendLicense) -> Result<Vec<LicenseEvent>, DomainError> {
        self.ensure_license_id(cmd.license_id)?;
        self.ensure_issued()?;

        if self.status == LicenseStatus::Suspended {
            return Err(DomainError::conflict("license already suspended"));
        }
        if cmd.reason.trim().is_empty() {
            return Err(DomainError::validation("suspension reason cannot be empty"));
        }

        Ok(vec![LicenseEvent::Suspended(LicenseSuspended {
            license_id: cmd.license_id,
            reason: cmd.reason.trim().to_string(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_reinstate(&self, cmd: &ReinstateLicense) -> Result<Vec<LicenseEvent>, DomainError> {
        self.ensure_license_id(cmd.license_id)?;
        self.ensure_issued()?;

        if self.status != LicenseStatus::Suspended {
            return Err(DomainError::invariant("only a suspended license can be reinstated"));
        }

        Ok(vec![LicenseEvent::Reinstated(LicenseReinstated {
            license_id: cmd.license_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_revoke(&self, cmd: &RevokeLicense) -> Result<Vec<LicenseEvent>, DomainError> {
        self.ensure_license_id(cmd.license_id)?;
        self.ensure_issued()?;

        if cmd.reason.trim().is_empty() {
            return Err(DomainError::validation("revocation reason cannot be empty"));
        }

        Ok(vec![LicenseEvent::Revoked(LicenseRevoked {
            license_id: cmd.license_id,
            reason: cmd.reason.trim().to_string(),
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use keystone_core::AggregateRoot;
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn issue(id: AggregateId, seats: u32) -> LicenseCommand {
        LicenseCommand::Issue(IssueLicense {
            license_id: id,
            product: "keystone".to_string(),
            holder: "acme".to_string(),
            seats,
            expires_at: t0() + Duration::days(365),
            occurred_at: t0(),
        })
    }

    fn issued(id: AggregateId) -> AggregateRoot<License> {
        let mut root = AggregateRoot::<License>::new(id);
        root.execute(&issue(id, 5)).unwrap();
        root
    }

    #[test]
    fn issue_emits_event_and_activates() {
        let id = AggregateId::new();
        let root = issued(id);

        assert_eq!(root.version(), 1);
        assert_eq!(root.state().status(), LicenseStatus::Active);
        assert_eq!(root.state().seats(), 5);
        assert_eq!(
            root.uncommitted_events()[0].event_type(),
            "licensing.license.issued"
        );
        assert!(root.state().is_valid_at(t0() + Duration::days(1)));
        assert!(!root.state().is_valid_at(t0() + Duration::days(400)));
    }

    #[test]
    fn issuing_twice_is_a_conflict() {
        let id = AggregateId::new();
        let mut root = issued(id);
        let err = root.execute(&issue(id, 5)).unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
        assert_eq!(root.version(), 1);
    }

    #[test]
    fn commands_for_unissued_license_are_not_found() {
        let id = AggregateId::new();
        let license = License::empty(id);
        let err = license
            .handle(&LicenseCommand::Reinstate(ReinstateLicense {
                license_id: id,
                occurred_at: t0(),
            }))
            .unwrap_err();
        assert_eq!(err, DomainError::NotFound);
    }

    #[test]
    fn renewal_must_extend_expiry() {
        let id = AggregateId::new();
        let mut root = issued(id);

        let err = root
            .execute(&LicenseCommand::Renew(RenewLicense {
                license_id: id,
                expires_at: t0() + Duration::days(30),
                occurred_at: t0(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        root.execute(&LicenseCommand::Renew(RenewLicense {
            license_id: id,
            expires_at: t0() + Duration::days(730),
            occurred_at: t0(),
        }))
        .unwrap();
        assert_eq!(root.state().renewals(), 1);
        assert_eq!(root.state().expires_at(), Some(t0() + Duration::days(730)));
    }

    #[test]
    fn suspend_and_reinstate() {
        let id = AggregateId::new();
        let mut root = issued(id);

        root.execute(&LicenseCommand::Suspend(SuspendLicense {
            license_id: id,
            reason: "unpaid invoice".to_string(),
            occurred_at: t0(),
        }))
        .unwrap();
        assert_eq!(root.state().status(), LicenseStatus::Suspended);
        assert_eq!(root.state().suspension_reason(), Some("unpaid invoice"));

        let err = root
            .execute(&LicenseCommand::ChangeSeats(ChangeSeats {
                license_id: id,
                seats: 10,
                occurred_at: t0(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));

        root.execute(&LicenseCommand::Reinstate(ReinstateLicense {
            license_id: id,
            occurred_at: t0(),
        }))
        .unwrap();
        assert_eq!(root.state().status(), LicenseStatus::Active);
        assert_eq!(root.state().suspension_reason(), None);
    }

    #[test]
    fn revoked_license_rejects_everything() {
        let id = AggregateId::new();
        let mut root = issued(id);
        root.execute(&LicenseCommand::Revoke(RevokeLicense {
            license_id: id,
            reason: "terms violation".to_string(),
            occurred_at: t0(),
        }))
        .unwrap();

        let err = root
            .execute(&LicenseCommand::Suspend(SuspendLicense {
                license_id: id,
                reason: "again".to_string(),
                occurred_at: t0(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
        assert_eq!(root.state().status(), LicenseStatus::Revoked);
    }

    #[test]
    fn command_for_another_license_is_rejected() {
        let id = AggregateId::new();
        let root = issued(id);
        let err = root.state().handle(&issue(AggregateId::new(), 1)).unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn event_types_are_valid_subject_tokens() {
        let id = AggregateId::new();
        let root = issued(id);
        let event_type = root.uncommitted_events()[0].event_type();
        assert!(event_type.split('.').all(|t| !t.is_empty()));
        assert!(!event_type.contains(char::is_whitespace));
    }

    #[test]
    fn snapshot_state_is_serializable() {
        let id = AggregateId::new();
        let mut root = issued(id);
        root.mark_events_as_committed();

        let snapshot = root.create_snapshot().unwrap().unwrap();
        assert_eq!(snapshot.aggregate_type, "licensing.license");
        assert_eq!(snapshot.sequence_number, 1);

        let json = serde_json::to_string(&snapshot).unwrap();
        let mut restored = AggregateRoot::<License>::new(id);
        restored
            .restore_from_snapshot(serde_json::from_str(&json).unwrap())
            .unwrap();
        assert_eq!(restored.state(), root.state());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Issue(u32),
        Renew(i64),
        Seats(u32),
        Suspend,
        Reinstate,
        Revoke,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u32..20).prop_map(Op::Issue),
            (-30i64..800).prop_map(Op::Renew),
            (0u32..50).prop_map(Op::Seats),
            Just(Op::Suspend),
            Just(Op::Reinstate),
            Just(Op::Revoke),
        ]
    }

    fn to_command(id: AggregateId, op: &Op) -> LicenseCommand {
        match op {
            Op::Issue(seats) => issue(id, *seats),
            Op::Renew(days) => LicenseCommand::Renew(RenewLicense {
                license_id: id,
                expires_at: t0() + Duration::days(*days),
                occurred_at: t0(),
            }),
            Op::Seats(seats) => LicenseCommand::ChangeSeats(ChangeSeats {
                license_id: id,
                seats: *seats,
                occurred_at: t0(),
            }),
            Op::Suspend => LicenseCommand::Suspend(SuspendLicense {
                license_id: id,
                reason: "audit".to_string(),
                occurred_at: t0(),
            }),
            Op::Reinstate => LicenseCommand::Reinstate(ReinstateLicense {
                license_id: id,
                occurred_at: t0(),
            }),
            Op::Revoke => LicenseCommand::Revoke(RevokeLicense {
                license_id: id,
                reason: "audit".to_string(),
                occurred_at: t0(),
            }),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: replaying the events a command sequence produced rebuilds the
        /// same state and version as executing it.
        #[test]
        fn replay_equals_live_state(ops in prop::collection::vec(op_strategy(), 0..40)) {
            let id = AggregateId::new();
            let mut live = AggregateRoot::<License>::new(id);
            for op in &ops {
                let _ = live.execute(&to_command(id, op));
            }
            let history = live.take_uncommitted_events();

            let mut replayed = AggregateRoot::<License>::new(id);
            replayed.rehydrate(history.clone(), 0);

            prop_assert_eq!(replayed.state(), live.state());
            prop_assert_eq!(replayed.version(), live.version());
            prop_assert_eq!(replayed.version(), history.len() as u64);
            prop_assert!(!replayed.has_uncommitted_events());
        }

        /// Property: snapshot at any point plus the remaining events equals full replay.
        #[test]
        fn snapshot_plus_tail_equals_full_replay(
            ops in prop::collection::vec(op_strategy(), 1..40),
            cut in 0usize..40,
        ) {
            let id = AggregateId::new();
            let mut live = AggregateRoot::<License>::new(id);
            for op in &ops {
                let _ = live.execute(&to_command(id, op));
            }
            let history = live.take_uncommitted_events();
            let cut = cut.min(history.len());

            let mut head = AggregateRoot::<License>::new(id);
            head.rehydrate(history[..cut].to_vec(), 0);
            let snapshot = head.create_snapshot().unwrap().unwrap();

            let mut restored = AggregateRoot::<License>::new(id);
            restored.restore_from_snapshot(snapshot).unwrap();
            restored.rehydrate(history[cut..].to_vec(), cut as u64);

            prop_assert_eq!(restored.state(), live.state());
            prop_assert_eq!(restored.version(), live.version());
        }
    }
}
