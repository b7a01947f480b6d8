//! Per-identifier session state with independently expiring slots.
//!
//! Entries are only touched from the service's single thread, so interior
//! mutability is a plain `RefCell`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use futures::future::{LocalBoxFuture, Shared};
use tokio::time::Instant;

use crate::bundle::{Bundle, CacheBlob, Target};
use crate::config::ServiceConfig;
use crate::error::Error;

/// A client build started ahead of the explicit bundle request.
pub type PendingBundle = Shared<LocalBoxFuture<'static, Result<Bundle, Rc<Error>>>>;

struct Slot<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Slot<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

struct SessionEntry<U> {
    server_cache: Option<Slot<CacheBlob>>,
    client_cache: Option<Slot<CacheBlob>>,
    render_unit: Option<Slot<U>>,
    pending_bundle: Option<Slot<PendingBundle>>,
}

impl<U> Default for SessionEntry<U> {
    fn default() -> Self {
        Self {
            server_cache: None,
            client_cache: None,
            render_unit: None,
            pending_bundle: None,
        }
    }
}

impl<U> SessionEntry<U> {
    fn cache_slot(&mut self, target: Target) -> &mut Option<Slot<CacheBlob>> {
        match target {
            Target::Server => &mut self.server_cache,
            Target::Client => &mut self.client_cache,
        }
    }

    fn is_empty(&self) -> bool {
        self.server_cache.is_none()
            && self.client_cache.is_none()
            && self.render_unit.is_none()
            && self.pending_bundle.is_none()
    }
}

/// Drops `slot` if it has expired and returns a reference to what is left.
fn live<T>(slot: &mut Option<Slot<T>>, now: Instant) -> Option<&T> {
    if slot.as_ref().is_some_and(|s| !s.is_live(now)) {
        *slot = None;
    }
    slot.as_ref().map(|s| &s.value)
}

/// Session state keyed by caller identifier.
///
/// With a zero session TTL nothing but pending bundles is kept: every build
/// starts from scratch and no render unit survives its render.
pub struct SessionCache<U> {
    ttl: Duration,
    preparation_ttl: Duration,
    entries: RefCell<HashMap<String, SessionEntry<U>>>,
}

impl<U: Clone> SessionCache<U> {
    pub fn new(ttl: Duration, preparation_ttl: Duration) -> Self {
        Self {
            ttl,
            preparation_ttl,
            entries: RefCell::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(config.session_ttl(), config.preparation_ttl)
    }

    pub fn cache_blob(&self, identifier: &str, target: Target) -> Option<CacheBlob> {
        let mut entries = self.entries.borrow_mut();
        let entry = entries.get_mut(identifier)?;
        live(entry.cache_slot(target), Instant::now()).cloned()
    }

    pub fn store_cache_blob(&self, identifier: &str, target: Target, blob: CacheBlob) {
        if self.ttl.is_zero() {
            return;
        }
        let mut entries = self.entries.borrow_mut();
        let entry = entries.entry(identifier.to_string()).or_default();
        *entry.cache_slot(target) = Some(Slot::new(blob, self.ttl));
    }

    pub fn render_unit(&self, identifier: &str) -> Option<U> {
        let mut entries = self.entries.borrow_mut();
        let entry = entries.get_mut(identifier)?;
        live(&mut entry.render_unit, Instant::now()).cloned()
    }

    /// Replaces the unit for `identifier`. The previous unit is removed
    /// before the new one is stored.
    pub fn store_render_unit(&self, identifier: &str, unit: U) {
        drop(self.remove_render_unit(identifier));
        if self.ttl.is_zero() {
            return;
        }
        let mut entries = self.entries.borrow_mut();
        let entry = entries.entry(identifier.to_string()).or_default();
        entry.render_unit = Some(Slot::new(unit, self.ttl));
    }

    /// Detaches the unit for `identifier`, handing it to the caller so it is
    /// dropped outside the cache borrow.
    pub fn remove_render_unit(&self, identifier: &str) -> Option<U> {
        let mut entries = self.entries.borrow_mut();
        entries
            .get_mut(identifier)?
            .render_unit
            .take()
            .map(|slot| slot.value)
    }

    pub fn pending_bundle(&self, identifier: &str) -> Option<PendingBundle> {
        let mut entries = self.entries.borrow_mut();
        let entry = entries.get_mut(identifier)?;
        live(&mut entry.pending_bundle, Instant::now()).cloned()
    }

    /// Joins the live pending bundle for `identifier`, or stores the one
    /// produced by `start`.
    pub fn prepare_bundle(
        &self,
        identifier: &str,
        start: impl FnOnce() -> PendingBundle,
    ) -> PendingBundle {
        if let Some(pending) = self.pending_bundle(identifier) {
            return pending;
        }
        let pending = start();
        let mut entries = self.entries.borrow_mut();
        let entry = entries.entry(identifier.to_string()).or_default();
        entry.pending_bundle = Some(Slot::new(pending.clone(), self.preparation_ttl));
        pending
    }

    pub fn take_pending_bundle(&self, identifier: &str) -> Option<PendingBundle> {
        let mut entries = self.entries.borrow_mut();
        let entry = entries.get_mut(identifier)?;
        let now = Instant::now();
        entry
            .pending_bundle
            .take()
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.value)
    }

    /// Drops every expired slot and every entry left empty.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        let mut expired_units = Vec::new();
        {
            let mut entries = self.entries.borrow_mut();
            for entry in entries.values_mut() {
                live(&mut entry.server_cache, now);
                live(&mut entry.client_cache, now);
                live(&mut entry.pending_bundle, now);
                if entry.render_unit.as_ref().is_some_and(|s| !s.is_live(now)) {
                    expired_units.extend(entry.render_unit.take());
                }
            }
            entries.retain(|_, entry| !entry.is_empty());
        }
        if !expired_units.is_empty() {
            tracing::debug!(count = expired_units.len(), "Evicted render units");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use futures::FutureExt;
    use serde_json::json;

    use super::*;
    use crate::config::{DEVELOPMENT_SESSION_TTL, PREPARATION_TTL};

    fn development() -> SessionCache<Rc<&'static str>> {
        SessionCache::new(DEVELOPMENT_SESSION_TTL, PREPARATION_TTL)
    }

    fn ready(bundle: Bundle) -> PendingBundle {
        async move { Ok::<_, Rc<Error>>(bundle) }
            .boxed_local()
            .shared()
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_live_for_the_session_ttl() {
        let cache = development();
        cache.store_cache_blob("sess1", Target::Server, CacheBlob(json!({"run": 1})));

        tokio::time::advance(Duration::from_secs(599)).await;
        assert_eq!(
            cache.cache_blob("sess1", Target::Server),
            Some(CacheBlob(json!({"run": 1})))
        );

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.cache_blob("sess1", Target::Server), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_targets_do_not_share_blobs() {
        let cache = development();
        cache.store_cache_blob("sess1", Target::Client, CacheBlob(json!("client")));
        assert_eq!(cache.cache_blob("sess1", Target::Server), None);
        assert_eq!(
            cache.cache_blob("sess1", Target::Client),
            Some(CacheBlob(json!("client")))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_keeps_nothing() {
        let cache: SessionCache<Rc<&str>> = SessionCache::new(Duration::ZERO, PREPARATION_TTL);
        cache.store_cache_blob("sess1", Target::Server, CacheBlob(json!(1)));
        cache.store_render_unit("sess1", Rc::new("unit"));

        assert_eq!(cache.cache_blob("sess1", Target::Server), None);
        assert!(cache.render_unit("sess1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_storing_a_unit_releases_the_previous_one() {
        let cache = development();
        let first = Rc::new("first");
        cache.store_render_unit("sess1", Rc::clone(&first));
        assert_eq!(Rc::strong_count(&first), 2);

        cache.store_render_unit("sess1", Rc::new("second"));
        assert_eq!(Rc::strong_count(&first), 1);
        assert_eq!(cache.render_unit("sess1").as_deref(), Some(&"second"));

        assert!(cache.remove_render_unit("sess1").is_some());
        assert!(cache.render_unit("sess1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_preparation_wins_and_is_consumed_once() {
        let cache = development();
        let started = Cell::new(0);
        let start = || {
            started.set(started.get() + 1);
            ready(Bundle::new())
        };

        let first = cache.prepare_bundle("sess1", start);
        let joined = cache.prepare_bundle("sess1", start);
        assert_eq!(started.get(), 1);
        assert!(first.await.is_ok());
        assert!(joined.await.is_ok());

        assert!(cache.take_pending_bundle("sess1").is_some());
        assert!(cache.take_pending_bundle("sess1").is_none());
        assert!(cache.pending_bundle("sess1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_preparation_expires_before_session_state() {
        let cache = development();
        cache.store_cache_blob("sess1", Target::Client, CacheBlob(json!(1)));
        cache.prepare_bundle("sess1", || ready(Bundle::new()));

        tokio::time::advance(PREPARATION_TTL + Duration::from_secs(1)).await;
        assert!(cache.pending_bundle("sess1").is_none());
        assert!(cache.cache_blob("sess1", Target::Client).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_drops_empty_entries() {
        let cache = development();
        cache.store_render_unit("old", Rc::new("old"));
        tokio::time::advance(Duration::from_secs(300)).await;
        cache.store_render_unit("new", Rc::new("new"));

        tokio::time::advance(Duration::from_secs(301)).await;
        cache.purge_expired();

        assert_eq!(cache.len(), 1);
        assert!(cache.render_unit("old").is_none());
        assert!(cache.render_unit("new").is_some());
    }
}
