use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, trace};

use crate::sync::transport::{Cookie, PatchOperation};

/// Query half of a subscription: scans the materialized rows and returns a
/// derived value. Must be a pure function of the view.
pub type QueryFn = Box<dyn Fn(&ReadView<'_>) -> Value + Send>;

/// Listener half of a subscription, invoked whenever a recompute changes the
/// query result. Listeners must not call back into the store.
pub type ListenerFn = Box<dyn Fn(&Value) + Send>;

/// Handle returned by [`ReplicaStore::subscribe`], used to unsubscribe.
#[derive(Debug)]
pub struct SubscriptionHandle(u64);

struct Subscription {
    query: QueryFn,
    cache: Value,
    listener: ListenerFn,
}

/// Read access to the materialized replica rows.
pub struct ReadView<'a> {
    rows: &'a BTreeMap<String, Value>,
}

impl ReadView<'_> {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.rows.get(key)
    }

    /// Iterate rows whose key starts with `prefix`, in key order.
    pub fn scan_prefix<'b>(
        &'b self,
        prefix: &'b str,
    ) -> impl Iterator<Item = (&'b String, &'b Value)> {
        self.rows
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(move |(k, _)| k.starts_with(prefix))
    }
}

/// Write access handed to mutators. Writes target the materialized rows only;
/// the authoritative base is replaced wholesale by [`ReplicaStore::rebase`].
pub struct WriteTx<'a> {
    rows: &'a mut BTreeMap<String, Value>,
}

impl WriteTx<'_> {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.rows.get(key)
    }

    pub fn set(&mut self, key: String, value: Value) {
        self.rows.insert(key, value);
    }

    pub fn del(&mut self, key: &str) {
        self.rows.remove(key);
    }
}

struct Inner {
    /// Authoritative state as of the last pull.
    base: BTreeMap<String, Value>,
    /// Base plus replayed unconfirmed mutations. This is what reads see.
    rows: BTreeMap<String, Value>,
    cookie: Option<Cookie>,
    /// Bumped on every apply and rebase; subscriptions recompute when it moves.
    revision: u64,
    subscriptions: HashMap<u64, Subscription>,
    next_subscription_id: u64,
}

/// The durable replica: a key-ordered map of entity records, versioned as a
/// whole by the pull cookie, with live-query subscriptions.
///
/// Single-writer rule: only the mutation log and sync coordinator mutate this
/// store; every other component reads it through subscriptions.
pub struct ReplicaStore {
    inner: Mutex<Inner>,
}

impl ReplicaStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                base: BTreeMap::new(),
                rows: BTreeMap::new(),
                cookie: None,
                revision: 0,
                subscriptions: HashMap::new(),
                next_subscription_id: 0,
            }),
        }
    }

    /// Seed base and materialized rows from a persisted snapshot. Pending
    /// mutations are replayed separately via [`ReplicaStore::replay`].
    pub fn load_snapshot(&self, rows: BTreeMap<String, Value>, cookie: Option<Cookie>) {
        let mut inner = self.inner.lock();
        inner.base = rows.clone();
        inner.rows = rows;
        inner.cookie = cookie;
        inner.revision += 1;
        Self::recompute(&mut inner);
    }

    pub fn cookie(&self) -> Option<Cookie> {
        self.inner.lock().cookie.clone()
    }

    pub fn revision(&self) -> u64 {
        self.inner.lock().revision
    }

    /// Run a read-only closure against the materialized rows.
    pub fn read<R>(&self, f: impl FnOnce(&ReadView<'_>) -> R) -> R {
        let inner = self.inner.lock();
        f(&ReadView { rows: &inner.rows })
    }

    /// Apply a synchronous write to the materialized rows (optimistic effect),
    /// then recompute subscriptions. Runs to completion without interleaving.
    pub fn apply(&self, f: impl FnOnce(&mut WriteTx<'_>)) {
        let mut inner = self.inner.lock();
        f(&mut WriteTx {
            rows: &mut inner.rows,
        });
        inner.revision += 1;
        Self::recompute(&mut inner);
    }

    /// Replace the authoritative base with the pulled patch, advance the
    /// cookie, and rebuild the materialized rows by replaying `replay` (the
    /// still-unconfirmed mutations, in original order) on top of the new base.
    pub fn rebase(
        &self,
        patch: &[PatchOperation],
        cookie: Cookie,
        replay: &[crate::sync::MutationRecord],
    ) {
        let mut inner = self.inner.lock();
        for op in patch {
            match op {
                PatchOperation::Clear => inner.base.clear(),
                PatchOperation::Delete { key } => {
                    inner.base.remove(key);
                }
                PatchOperation::Put { key, value } => {
                    inner.base.insert(key.clone(), value.clone());
                }
            }
        }
        inner.cookie = Some(cookie);
        Self::rematerialize(&mut inner, replay);
        debug!(
            patch_ops = patch.len(),
            replayed = replay.len(),
            revision = inner.revision,
            "Rebased replica onto pulled state"
        );
    }

    /// Rebuild the materialized rows from the unchanged base plus `replay`.
    /// Used at startup to re-apply persisted unconfirmed mutations.
    pub fn replay(&self, replay: &[crate::sync::MutationRecord]) {
        let mut inner = self.inner.lock();
        Self::rematerialize(&mut inner, replay);
    }

    fn rematerialize(inner: &mut Inner, replay: &[crate::sync::MutationRecord]) {
        inner.rows = inner.base.clone();
        let mut tx = WriteTx {
            rows: &mut inner.rows,
        };
        for record in replay {
            record.mutation.apply(&mut tx);
        }
        inner.revision += 1;
        Self::recompute(inner);
    }

    /// Register a live query. The listener fires immediately with the initial
    /// result, then again whenever a recompute produces a different value.
    pub fn subscribe(&self, query: QueryFn, listener: ListenerFn) -> SubscriptionHandle {
        let mut inner = self.inner.lock();
        let id = inner.next_subscription_id;
        inner.next_subscription_id += 1;

        let initial = query(&ReadView { rows: &inner.rows });
        listener(&initial);

        inner.subscriptions.insert(
            id,
            Subscription {
                query,
                cache: initial,
                listener,
            },
        );
        trace!(subscription_id = id, "Registered replica subscription");
        SubscriptionHandle(id)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        let mut inner = self.inner.lock();
        if inner.subscriptions.remove(&handle.0).is_some() {
            trace!(subscription_id = handle.0, "Removed replica subscription");
        }
    }

    fn recompute(inner: &mut Inner) {
        let Inner {
            rows,
            subscriptions,
            ..
        } = inner;
        let view = ReadView { rows };
        for sub in subscriptions.values_mut() {
            let next = (sub.query)(&view);
            if next != sub.cache {
                sub.cache = next;
                (sub.listener)(&sub.cache);
            }
        }
    }
}

impl Default for ReplicaStore {
    fn default() -> Self {
        Self::new()
    }
}
