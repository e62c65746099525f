//! Resource limits attached to bound identities.
//!
//! Limit values come from a [`LimitSource`] keyed by DN. Each connection
//! caches the values for its current identity; the cache is rebuilt on
//! bind and on first activity.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tracing::debug;

use crate::config::DaemonConfig;
use crate::connection::Connection;

/// Attribute holding a per-identity idle timeout in seconds.
pub const IDLE_TIMEOUT_LIMIT: &str = "nsIdleTimeout";

/// Handle to a registered limit attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LimitHandle(usize);

/// Per-identity limit attributes.
pub trait LimitSource: Send + Sync {
    /// Integer limits stored on `dn`, or `None` if the identity has none.
    fn limits_for(&self, dn: &str) -> Option<HashMap<String, i64>>;
}

/// In-memory [`LimitSource`], keyed by case-insensitive DN.
#[derive(Debug, Clone, Default)]
pub struct StaticLimits {
    entries: HashMap<String, HashMap<String, i64>>,
}

impl StaticLimits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set `attr` to `value` for `dn`.
    pub fn with_limit(mut self, dn: &str, attr: &str, value: i64) -> Self {
        self.entries
            .entry(normalize_dn(dn))
            .or_default()
            .insert(attr.to_ascii_lowercase(), value);
        self
    }
}

impl LimitSource for StaticLimits {
    fn limits_for(&self, dn: &str) -> Option<HashMap<String, i64>> {
        self.entries.get(&normalize_dn(dn)).cloned()
    }
}

/// Resolves limits for connections.
pub struct ResourceLimits {
    registry: RwLock<Vec<String>>,
    source: Box<dyn LimitSource>,
    root_dn: String,
    anon_limits_dn: Option<String>,
    default_idle_timeout: u64,
    idle_timeout: LimitHandle,
}

impl ResourceLimits {
    /// Creates a resolver and registers [`IDLE_TIMEOUT_LIMIT`].
    pub fn new(source: Box<dyn LimitSource>, config: &DaemonConfig) -> Self {
        let mut limits = Self {
            registry: RwLock::new(Vec::new()),
            source,
            root_dn: normalize_dn(&config.root_dn),
            anon_limits_dn: config.anon_limits_dn.clone(),
            default_idle_timeout: config.idle_timeout,
            idle_timeout: LimitHandle(0),
        };
        limits.idle_timeout = limits.register(IDLE_TIMEOUT_LIMIT);
        limits
    }

    /// Registers a limit attribute, returning the existing handle if it is
    /// already known.
    pub fn register(&self, attr: &str) -> LimitHandle {
        let attr = attr.to_ascii_lowercase();
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(pos) = registry.iter().position(|a| *a == attr) {
            return LimitHandle(pos);
        }
        registry.push(attr);
        LimitHandle(registry.len() - 1)
    }

    /// Server-wide idle timeout.
    pub fn default_idle_timeout(&self) -> u64 {
        self.default_idle_timeout
    }

    /// True if `dn` is the unrestricted administrator.
    pub fn is_root(&self, dn: &str) -> bool {
        normalize_dn(dn) == self.root_dn
    }

    /// Reloads the connection's cached limits from `dn`.
    ///
    /// `None` clears the cache.
    pub fn update_from_dn(&self, conn: &mut Connection, dn: Option<&str>) {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        let values = dn.and_then(|dn| self.source.limits_for(dn));
        conn.limits = match values {
            Some(values) => {
                let values: HashMap<String, i64> = values
                    .into_iter()
                    .map(|(k, v)| (k.to_ascii_lowercase(), v))
                    .collect();
                registry.iter().map(|attr| values.get(attr).copied()).collect()
            }
            None => Vec::new(),
        };
    }

    /// Cached integer limit, if the bound identity defines one.
    pub fn integer_limit(&self, conn: &Connection, handle: LimitHandle) -> Option<i64> {
        conn.limits.get(handle.0).copied().flatten()
    }

    /// Resolves and stores the connection's idle timeout in seconds,
    /// 0 meaning unlimited.
    ///
    /// The administrator is always unlimited. Otherwise a limit on the bound
    /// identity wins; anonymous connections use the anonymous-limits
    /// identity when one is configured; everything else gets the server
    /// default. Negative limits mean unlimited.
    pub fn resolve_idle_timeout(&self, conn: &mut Connection) -> u64 {
        let timeout = if conn.is_root() {
            0
        } else {
            let identity = conn
                .bind_dn()
                .map(str::to_string)
                .or_else(|| self.anon_limits_dn.clone());
            self.update_from_dn(conn, identity.as_deref());
            match self.integer_limit(conn, self.idle_timeout) {
                Some(secs) => u64::try_from(secs).unwrap_or(0),
                None => self.default_idle_timeout,
            }
        };
        conn.limits_resolved = true;
        conn.set_idle_timeout(timeout);
        debug!(
            conn = conn.id(),
            dn = conn.bind_dn().unwrap_or(""),
            idle_timeout = timeout,
            "Resolved idle timeout"
        );
        timeout
    }

    /// Resolves limits on first activity; later calls are no-ops until the
    /// identity changes.
    pub fn ensure_resolved(&self, conn: &mut Connection) {
        if !conn.limits_resolved {
            self.resolve_idle_timeout(conn);
        }
    }
}

fn normalize_dn(dn: &str) -> String {
    dn.split(',')
        .map(|rdn| rdn.trim().to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::local_connection;

    fn limits(source: StaticLimits, config: DaemonConfig) -> ResourceLimits {
        ResourceLimits::new(Box::new(source), &config)
    }

    #[test]
    fn default_without_binder_limit() {
        let limits = limits(StaticLimits::new(), DaemonConfig::default().with_idle_timeout(120));
        let (mut conn, _client) = local_connection();

        assert_eq!(limits.resolve_idle_timeout(&mut conn), 120);
        assert_eq!(conn.idle_timeout(), 120);

        conn.set_bind(Some("uid=alice,ou=people,dc=example,dc=com"), false);
        assert_eq!(limits.resolve_idle_timeout(&mut conn), 120);
    }

    #[test]
    fn root_is_unlimited() {
        let source = StaticLimits::new().with_limit("cn=Directory Manager", IDLE_TIMEOUT_LIMIT, 30);
        let limits = limits(source, DaemonConfig::default().with_idle_timeout(120));
        let (mut conn, _client) = local_connection();

        assert!(limits.is_root("CN=directory manager"));
        conn.set_bind(Some("cn=Directory Manager"), true);
        assert_eq!(limits.resolve_idle_timeout(&mut conn), 0);
    }

    #[test]
    fn binder_limit_wins() {
        let source = StaticLimits::new().with_limit("uid=bob, dc=example, dc=com", "NSIDLETIMEOUT", 15);
        let limits = limits(source, DaemonConfig::default().with_idle_timeout(120));
        let (mut conn, _client) = local_connection();

        conn.set_bind(Some("uid=bob,dc=example,dc=com"), false);
        assert_eq!(limits.resolve_idle_timeout(&mut conn), 15);
    }

    #[test]
    fn anonymous_uses_anon_limits_identity() {
        let source = StaticLimits::new().with_limit("cn=anon,dc=example", IDLE_TIMEOUT_LIMIT, 5);
        let config = DaemonConfig::default()
            .with_idle_timeout(120)
            .with_anon_limits_dn("cn=anon,dc=example");
        let limits = limits(source, config);
        let (mut conn, _client) = local_connection();

        assert_eq!(limits.resolve_idle_timeout(&mut conn), 5);

        conn.set_bind(Some("uid=carol,dc=example"), false);
        assert_eq!(limits.resolve_idle_timeout(&mut conn), 120);
    }

    #[test]
    fn negative_limit_is_unlimited() {
        let source = StaticLimits::new().with_limit("uid=svc", IDLE_TIMEOUT_LIMIT, -1);
        let limits = limits(source, DaemonConfig::default().with_idle_timeout(60));
        let (mut conn, _client) = local_connection();

        conn.set_bind(Some("uid=svc"), false);
        assert_eq!(limits.resolve_idle_timeout(&mut conn), 0);
    }

    #[test]
    fn register_is_idempotent() {
        let limits = limits(StaticLimits::new(), DaemonConfig::default());
        let a = limits.register("nsSizeLimit");
        let b = limits.register("NSSIZELIMIT");
        assert_eq!(a, b);
        assert_eq!(limits.register(IDLE_TIMEOUT_LIMIT), limits.idle_timeout);
    }

    #[test]
    fn ensure_resolved_runs_once_per_identity() {
        let source = StaticLimits::new().with_limit("uid=dave", IDLE_TIMEOUT_LIMIT, 9);
        let limits = limits(source, DaemonConfig::default().with_idle_timeout(60));
        let (mut conn, _client) = local_connection();

        limits.ensure_resolved(&mut conn);
        assert_eq!(conn.idle_timeout(), 60);

        conn.set_bind(Some("uid=dave"), false);
        limits.ensure_resolved(&mut conn);
        assert_eq!(conn.idle_timeout(), 9);
    }
}
