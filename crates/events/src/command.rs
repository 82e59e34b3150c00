use keystone_core::AggregateId;

/// A command targets a specific aggregate.
///
/// Commands are intent ("renew this license"); events are the facts the aggregate
/// emits when it accepts one. Commands are never persisted.
///
/// Tenancy is not part of the command: the dispatcher receives the tenant from the
/// caller's context and stamps it on every event it persists.
pub trait Command: Clone + core::fmt::Debug + Send + Sync + 'static {
    fn target_aggregate_id(&self) -> AggregateId;
}
