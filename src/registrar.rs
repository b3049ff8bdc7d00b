//! Member address registration and registry reconciliation.
//!
//! The registrar keeps the durable member registry in step with reality:
//! it loads seed addresses for the bootstrap phase, writes this process's
//! own registration, and reconciles the canonical address list against the
//! live topology whenever membership changes. Reconciliation writes are
//! serialized across all processes through a [`DistributedLock`].
//!
//! Registration state moves strictly forward:
//!
//! ```text
//! Unregistered -> Registered(id) -> Deregistered
//! ```
//!
//! A fresh registration id is minted per attempt (`<epochMillis>@<uuid>`,
//! UUID fixed per process) so a process can recognize and retire its own
//! earlier entries while the timestamp dates every entry for cutoff checks.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::address::{MemberAddress, RegistrationId};
use crate::config::RendezvousConfig;
use crate::error::{Error, Result};
use crate::events::ClusterRuntime;
use crate::lock::{DistributedLock, LockError};
use crate::registry::{current_time_ms, KeyPrefix, MemberRegistry, RegistryKey, RegistryValue};
use crate::translator::AddressTranslator;

#[cfg(feature = "metrics")]
use crate::metrics;

/// Registry namespace for member registrations, also used as the name of the
/// reconciliation lock.
pub const MEMBER_NAMESPACE: &str = "cluster-instance-members";

/// Where a process stands in the registration lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// No registration written yet.
    Unregistered,
    /// Registered under the contained id.
    Registered(RegistrationId),
    /// Registrations removed at shutdown; the registrar is done.
    Deregistered,
}

/// Result of one reconciliation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The canonical list was rewritten.
    Written,
    /// Registry and topology already agreed; nothing written.
    Unchanged,
    /// The lock was contended; the attempt was skipped.
    Skipped,
}

/// A compensating action to undo part of a multi-step operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupAction {
    /// Remove a registration entry that was written.
    RemoveRegistration(RegistryKey),
}

/// Caller-owned list of compensating actions.
///
/// Operations that write push an undo action here; if the enclosing
/// operation later fails, the caller hands the list to
/// [`MemberAddressRegistrar::run_cleanup`]. Actions run in reverse push
/// order, best-effort.
#[derive(Debug, Default)]
pub struct FailureCleanup {
    actions: Vec<CleanupAction>,
}

impl FailureCleanup {
    /// Create an empty cleanup list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a compensating action.
    pub fn push(&mut self, action: CleanupAction) {
        self.actions.push(action);
    }

    /// Number of recorded actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether no actions are recorded.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Orchestrates the registration lifecycle against the shared registry.
///
/// Generic over the node id type `I` and the three collaborator seams:
/// registry `R`, lock `L`, and cluster runtime `C`. All state mutations are
/// process-local mutexes with short critical sections; the only cross-process
/// coordination is the reconciliation lock.
pub struct MemberAddressRegistrar<I, R, L, C> {
    config: RendezvousConfig,
    translator: Arc<AddressTranslator>,
    registry: Arc<R>,
    lock: Arc<L>,
    runtime: Arc<C>,
    registration_uuid: Uuid,
    state: Mutex<RegistrationState>,
    addresses_by_member: Mutex<HashMap<I, Vec<MemberAddress>>>,
    pending_exclusions: Mutex<HashSet<MemberAddress>>,
}

impl<I, R, L, C> MemberAddressRegistrar<I, R, L, C>
where
    I: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    R: MemberRegistry,
    L: DistributedLock,
    C: ClusterRuntime<I>,
{
    /// Create a registrar. Validates the configuration.
    pub fn new(
        config: RendezvousConfig,
        translator: Arc<AddressTranslator>,
        registry: Arc<R>,
        lock: Arc<L>,
        runtime: Arc<C>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            translator,
            registry,
            lock,
            runtime,
            registration_uuid: Uuid::new_v4(),
            state: Mutex::new(RegistrationState::Unregistered),
            addresses_by_member: Mutex::new(HashMap::new()),
            pending_exclusions: Mutex::new(HashSet::new()),
        })
    }

    /// The UUID identifying this process's registrations.
    pub const fn registration_uuid(&self) -> Uuid {
        self.registration_uuid
    }

    /// Current lifecycle state.
    pub fn registration_state(&self) -> RegistrationState {
        *self.state.lock()
    }

    /// The addresses this process advertises: local candidates with loopback
    /// substitution applied, translated to their external form, deduplicated.
    pub fn advertised_addresses(&self) -> Vec<MemberAddress> {
        let mut out = Vec::new();
        for addr in self.runtime.local_addresses() {
            if addr.is_any_local() {
                debug!(%addr, "skipping wildcard local address");
                continue;
            }
            let Some(addr) = self.substitute_loopback(addr) else {
                continue;
            };
            let external = self.first_resolved(&addr);
            if !out.contains(&external) {
                out.push(external);
            }
        }
        out
    }

    /// Load seed addresses for the bootstrap phase.
    ///
    /// Enumerates this instance's registration entries, purging entries older
    /// than the cutoff age and entries matching this process's own addresses
    /// (remnants of a previous run of this host). Whatever remains becomes
    /// the seed set; if nothing remains, the configured `initial_members`
    /// are returned instead.
    pub async fn initialize_seed_addresses(&self) -> Result<Vec<MemberAddress>> {
        let prefix = KeyPrefix::instance(MEMBER_NAMESPACE, &self.config.instance_name);
        let mut rows: Vec<(RegistryKey, RegistryValue)> = Vec::new();
        self.registry
            .visit(&prefix, |key, value| {
                if !key.is_canonical() {
                    rows.push((key.clone(), value.clone()));
                }
                true
            })
            .await?;

        let now = current_time_ms();
        let cutoff_ms = self.config.cutoff_age_ms();
        let own: Vec<MemberAddress> = {
            let mut own = self.runtime.local_addresses();
            for addr in self.advertised_addresses() {
                if !own.contains(&addr) {
                    own.push(addr);
                }
            }
            own
        };

        let mut seeds: Vec<MemberAddress> = Vec::new();
        let mut purge: Vec<RegistryKey> = Vec::new();
        let mut expired = 0usize;
        let mut stale_self = 0usize;

        for (key, value) in rows {
            let Some(id) = key.registration().copied() else {
                continue;
            };
            if id.age_ms(now) >= cutoff_ms {
                debug!(%key, age_ms = id.age_ms(now), "purging expired registration entry");
                expired += 1;
                purge.push(key);
                continue;
            }

            let addresses = self.parse_value_addresses(&key, &value);
            if addresses.iter().any(|a| own.contains(a)) {
                debug!(%key, "purging stale self-registration from a previous run");
                stale_self += 1;
                purge.push(key);
                continue;
            }
            for addr in addresses {
                if !seeds.contains(&addr) {
                    seeds.push(addr);
                }
            }
        }

        for key in purge {
            self.registry.remove(&key).await?;
        }

        if seeds.is_empty() {
            let fallback = self.config.initial_member_addresses()?;
            if !fallback.is_empty() {
                info!(
                    count = fallback.len(),
                    "registry yielded no seeds, falling back to configured initial members"
                );
            }
            #[cfg(feature = "metrics")]
            metrics::record_seed_load(fallback.len());
            return Ok(fallback);
        }

        info!(
            seeds = seeds.len(),
            expired, stale_self, "loaded seed addresses from member registry"
        );
        #[cfg(feature = "metrics")]
        metrics::record_seed_load(seeds.len());
        Ok(seeds)
    }

    /// Write this process's registration entry under a fresh id.
    ///
    /// On success a compensating remove is pushed onto `cleanup`, to be run
    /// by the caller if the enclosing operation fails later.
    pub async fn register_addresses(
        &self,
        cleanup: &mut FailureCleanup,
    ) -> Result<RegistrationId> {
        let addresses = self.advertised_addresses();
        if addresses.is_empty() {
            return Err(Error::Config(
                "no registrable addresses: all local candidates were loopback or wildcard".into(),
            ));
        }

        let id = RegistrationId::new(self.registration_uuid);
        let key = RegistryKey::entry(MEMBER_NAMESPACE, &self.config.instance_name, id);
        self.registry
            .set(key.clone(), RegistryValue::from_addresses(&addresses))
            .await?;
        cleanup.push(CleanupAction::RemoveRegistration(key));
        *self.state.lock() = RegistrationState::Registered(id);

        info!(registration = %id, count = addresses.len(), "registered member addresses");
        #[cfg(feature = "metrics")]
        metrics::record_registration();
        Ok(id)
    }

    /// Re-register under a fresh id, then retire this process's older entries.
    ///
    /// A no-op after [`Self::remove_address_registrations`], so a timer
    /// firing during shutdown does not resurrect the registration. If
    /// retiring an older entry fails the new registration is kept; the
    /// leftover ages out via the cutoff.
    pub async fn refresh_address_registration(&self) -> Result<()> {
        if self.registration_state() == RegistrationState::Deregistered {
            debug!("skipping refresh, registrar already deregistered");
            return Ok(());
        }

        let mut cleanup = FailureCleanup::new();
        let newest = self.register_addresses(&mut cleanup).await?;

        let stale = self.own_entry_keys(Some(newest)).await?;
        for key in stale {
            debug!(%key, "removing superseded registration entry");
            self.registry.remove(&key).await?;
        }
        Ok(())
    }

    /// Delete all entries owned by this process. Invoked at clean shutdown.
    pub async fn remove_address_registrations(&self) -> Result<()> {
        let keys = self.own_entry_keys(None).await?;
        let count = keys.len();
        for key in keys {
            self.registry.remove(&key).await?;
        }
        *self.state.lock() = RegistrationState::Deregistered;
        info!(count, "removed member address registrations");
        Ok(())
    }

    /// Routine reconciliation: single lock attempt, contention skips.
    pub async fn reconcile(&self) -> Result<ReconcileOutcome> {
        match self.reconcile_with_lock(Duration::ZERO, 1).await {
            Ok(result) => result,
            Err(LockContention { attempts }) => {
                debug!(attempts, "reconcile lock contended, skipping this attempt");
                #[cfg(feature = "metrics")]
                metrics::record_reconcile(ReconcileOutcome::Skipped);
                Ok(ReconcileOutcome::Skipped)
            }
        }
    }

    /// Startup reconciliation: bounded retry, contention is fatal.
    ///
    /// A member that cannot get itself registered at startup may never become
    /// discoverable by later nodes, which can split the cluster into parallel
    /// grids; the caller is expected to abort startup on this error.
    pub async fn reconcile_startup(&self) -> Result<ReconcileOutcome> {
        match self
            .reconcile_with_lock(
                self.config.startup_lock_retry_wait,
                self.config.startup_lock_retry_count,
            )
            .await
        {
            Ok(result) => result,
            Err(LockContention { attempts }) => {
                warn!(
                    lock = MEMBER_NAMESPACE,
                    attempts,
                    "could not acquire registration lock at startup; this member may stay \
                     undiscoverable and the cluster may form parallel grids"
                );
                Err(Error::LockAcquisition {
                    name: MEMBER_NAMESPACE.to_owned(),
                    attempts,
                })
            }
        }
    }

    /// Record the last known addresses of a departed member for exclusion.
    ///
    /// Called synchronously from the event listener; takes no distributed
    /// lock. The recorded addresses are consumed by the next reconciliation
    /// so a mid-departure member is not misclassified as foreign. A member
    /// unknown to the current snapshot contributes nothing.
    pub fn record_member_departure(&self, member: &I) {
        let Some(addresses) = self.addresses_by_member.lock().remove(member) else {
            debug!(?member, "departed member had no recorded addresses");
            return;
        };
        let mut pending = self.pending_exclusions.lock();
        for addr in addresses {
            pending.insert(addr);
        }
        debug!(?member, pending = pending.len(), "recorded departure exclusions");
    }

    /// Run compensating actions, best-effort, in reverse push order.
    pub async fn run_cleanup(&self, cleanup: &mut FailureCleanup) {
        for action in cleanup.actions.drain(..).rev() {
            match action {
                CleanupAction::RemoveRegistration(key) => {
                    debug!(%key, "cleanup: removing registration entry");
                    if let Err(err) = self.registry.remove(&key).await {
                        warn!(%key, error = %err, "cleanup failed to remove registration entry");
                    }
                }
            }
        }
    }

    async fn reconcile_with_lock(
        &self,
        retry_wait: Duration,
        attempts: u32,
    ) -> std::result::Result<Result<ReconcileOutcome>, LockContention> {
        let token = match self
            .lock
            .acquire(MEMBER_NAMESPACE, self.config.lock_ttl, retry_wait, attempts)
            .await
        {
            Ok(token) => token,
            Err(LockError::Contended { attempts, .. }) => {
                return Err(LockContention { attempts });
            }
            Err(LockError::Backend(err)) => return Ok(Err(Error::Store(err))),
        };

        let outcome = self.reconcile_locked().await;

        // The lock is released no matter how reconciliation went.
        if let Err(err) = self.lock.release(MEMBER_NAMESPACE, token).await {
            warn!(lock = MEMBER_NAMESPACE, error = %err, "failed to release reconcile lock");
        }
        Ok(outcome)
    }

    async fn reconcile_locked(&self) -> Result<ReconcileOutcome> {
        let members = self.runtime.members();
        if members.is_empty() {
            debug!("topology snapshot empty, skipping reconciliation");
            return Ok(ReconcileOutcome::Unchanged);
        }

        // Live set and per-member snapshot from the current topology.
        let mut live: BTreeSet<MemberAddress> = BTreeSet::new();
        {
            let mut snapshot = self.addresses_by_member.lock();
            snapshot.clear();
            for member in &members {
                if member.is_client {
                    continue;
                }
                snapshot.insert(member.id.clone(), member.addresses.clone());
                live.extend(member.addresses.iter().cloned());
            }
        }

        let canonical = RegistryKey::canonical(MEMBER_NAMESPACE, &self.config.instance_name);
        let registered: BTreeSet<MemberAddress> = match self.registry.get(&canonical).await? {
            Some(value) => self.parse_value_addresses(&canonical, &value).into_iter().collect(),
            None => BTreeSet::new(),
        };

        let excluded: HashSet<MemberAddress> =
            std::mem::take(&mut *self.pending_exclusions.lock());

        let foreign: Vec<&MemberAddress> = registered
            .iter()
            .filter(|a| !live.contains(*a) && !excluded.contains(*a))
            .collect();
        let new_count = live.iter().filter(|a| !registered.contains(*a)).count();
        let obsolete_count = excluded.iter().filter(|a| registered.contains(*a)).count();

        let outcome = if !foreign.is_empty() {
            warn!(
                foreign = ?foreign,
                "registered addresses match neither the live topology nor a recent departure; \
                 possibly remnants of a parallel grid; overwriting the canonical list"
            );
            #[cfg(feature = "metrics")]
            metrics::record_foreign_addresses(foreign.len());
            self.registry
                .set(canonical, RegistryValue::from_addresses(&live))
                .await?;
            ReconcileOutcome::Written
        } else if new_count > 0 || obsolete_count > 0 {
            debug!(
                new = new_count,
                obsolete = obsolete_count,
                "canonical list out of date, overwriting"
            );
            self.registry
                .set(canonical, RegistryValue::from_addresses(&live))
                .await?;
            ReconcileOutcome::Written
        } else {
            debug!("canonical list already matches the live topology");
            ReconcileOutcome::Unchanged
        };

        info!(
            live = live.len(),
            registered = registered.len(),
            excluded = excluded.len(),
            ?outcome,
            "reconciled member registry"
        );
        #[cfg(feature = "metrics")]
        metrics::record_reconcile(outcome);
        Ok(outcome)
    }

    /// Keys of all entries owned by this process, except `keep`.
    async fn own_entry_keys(&self, keep: Option<RegistrationId>) -> Result<Vec<RegistryKey>> {
        let prefix = KeyPrefix::instance(MEMBER_NAMESPACE, &self.config.instance_name);
        let uuid = self.registration_uuid;
        let mut keys = Vec::new();
        self.registry
            .visit(&prefix, |key, _| {
                if let Some(id) = key.registration() {
                    if id.uuid() == uuid && keep.map(|k| *id != k).unwrap_or(true) {
                        keys.push(key.clone());
                    }
                }
                true
            })
            .await?;
        Ok(keys)
    }

    fn parse_value_addresses(
        &self,
        key: &RegistryKey,
        value: &RegistryValue,
    ) -> Vec<MemberAddress> {
        let mut out = Vec::new();
        for parsed in value.member_addresses() {
            match parsed {
                Ok(addr) => out.push(addr),
                Err(err) => {
                    warn!(%key, error = %err, "skipping unparseable registered address");
                }
            }
        }
        out
    }

    fn substitute_loopback(&self, addr: MemberAddress) -> Option<MemberAddress> {
        if !addr.is_loopback() {
            return Some(addr);
        }
        match self
            .config
            .local_host
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
        {
            Some(host) => {
                let substituted = addr.with_host(host);
                debug!(%addr, %substituted, "substituted loopback address");
                Some(substituted)
            }
            None => {
                warn!(%addr, "skipping loopback address, no local host configured");
                None
            }
        }
    }

    fn first_resolved(&self, addr: &MemberAddress) -> MemberAddress {
        let mut resolved = self.translator.resolve(addr);
        resolved.remove(0)
    }
}

struct LockContention {
    attempts: u32,
}
