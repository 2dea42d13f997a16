//! Tenancy strategies mapping logical topics to physical broker resources.
//!
//! A strategy is a pure function from `(logical_topic, tenant_context)`
//! to `(physical_topic, routing_key)`. It is consulted at both publish
//! and subscribe time so producer and consumer agree on physical naming
//! without either side hard-coding it.

use serde::{Deserialize, Serialize};

/// Isolation tier of a tenant, used by [`HybridStrategy`] to decide
/// between shared and namespaced placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantTier {
    /// Default tier; shares physical topics with other tenants.
    Standard,
    /// Large or compliance-sensitive tenants that get their own
    /// physical topics.
    Isolated,
}

/// Tenant identity plus placement-relevant attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContext {
    /// Stable tenant identifier. Used verbatim in physical names, so it
    /// must be broker-safe (the caller's provisioning layer enforces
    /// the character set).
    pub tenant_id: String,
    /// Isolation tier.
    pub tier: TenantTier,
}

impl TenantContext {
    /// Creates a standard-tier tenant context.
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self { tenant_id: tenant_id.into(), tier: TenantTier::Standard }
    }

    /// Creates an isolated-tier tenant context.
    pub fn isolated(tenant_id: impl Into<String>) -> Self {
        Self { tenant_id: tenant_id.into(), tier: TenantTier::Isolated }
    }
}

/// Physical resolution of a logical topic for one tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalAddress {
    /// Physical topic name on the broker.
    pub topic: String,
    /// Routing/partition key.
    pub key: String,
}

/// Pure mapping from logical topic and tenant context to physical
/// topic and routing key.
///
/// Implementations must be deterministic: the same inputs always
/// resolve to the same address, whichever side of the pipeline asks.
pub trait TenancyStrategy: Send + Sync {
    /// Resolves the physical address for a logical topic under a tenant.
    fn resolve(&self, logical_topic: &str, context: &TenantContext) -> PhysicalAddress;
}

/// All tenants share one physical topic; isolation comes from consumers
/// filtering on the tenant carried in the routing key (and the
/// [`crate::envelope::TENANT_HEADER`] header).
///
/// Cheapest operationally, weakest isolation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SharedTopicStrategy;

impl TenancyStrategy for SharedTopicStrategy {
    fn resolve(&self, logical_topic: &str, context: &TenantContext) -> PhysicalAddress {
        PhysicalAddress { topic: logical_topic.to_string(), key: context.tenant_id.clone() }
    }
}

/// One physical topic per tenant, named by composing the tenant
/// identifier with the logical topic.
///
/// Strongest isolation, highest topic-count overhead.
#[derive(Debug, Clone)]
pub struct NamespacedStrategy {
    separator: String,
}

impl NamespacedStrategy {
    /// Creates a namespaced strategy with the given separator between
    /// tenant and logical topic.
    pub fn new(separator: impl Into<String>) -> Self {
        Self { separator: separator.into() }
    }
}

impl Default for NamespacedStrategy {
    fn default() -> Self {
        Self::new(".")
    }
}

impl TenancyStrategy for NamespacedStrategy {
    fn resolve(&self, logical_topic: &str, context: &TenantContext) -> PhysicalAddress {
        PhysicalAddress {
            topic: format!("{}{}{}", context.tenant_id, self.separator, logical_topic),
            key: String::new(),
        }
    }
}

/// Delegates to [`NamespacedStrategy`] for isolated-tier tenants and to
/// [`SharedTopicStrategy`] for everyone else.
#[derive(Debug, Clone, Default)]
pub struct HybridStrategy {
    shared: SharedTopicStrategy,
    namespaced: NamespacedStrategy,
}

impl HybridStrategy {
    /// Creates a hybrid strategy with a custom namespace separator.
    pub fn new(separator: impl Into<String>) -> Self {
        Self { shared: SharedTopicStrategy, namespaced: NamespacedStrategy::new(separator) }
    }
}

impl TenancyStrategy for HybridStrategy {
    fn resolve(&self, logical_topic: &str, context: &TenantContext) -> PhysicalAddress {
        match context.tier {
            TenantTier::Isolated => self.namespaced.resolve(logical_topic, context),
            TenantTier::Standard => self.shared.resolve(logical_topic, context),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn shared_keeps_topic_and_keys_by_tenant() {
        let strategy = SharedTopicStrategy;
        let address = strategy.resolve("orders", &TenantContext::new("acme"));
        assert_eq!(address.topic, "orders");
        assert_eq!(address.key, "acme");
    }

    #[test]
    fn namespaced_composes_tenant_into_topic() {
        let strategy = NamespacedStrategy::default();
        let address = strategy.resolve("orders", &TenantContext::new("acme"));
        assert_eq!(address.topic, "acme.orders");
        assert_eq!(address.key, "");
    }

    #[test]
    fn namespaced_separates_tenants() {
        let strategy = NamespacedStrategy::default();
        let a = strategy.resolve("orders", &TenantContext::new("acme"));
        let b = strategy.resolve("orders", &TenantContext::new("globex"));
        assert_ne!(a.topic, b.topic);
    }

    #[test]
    fn hybrid_delegates_by_tier() {
        let strategy = HybridStrategy::default();

        let standard = strategy.resolve("orders", &TenantContext::new("acme"));
        assert_eq!(standard.topic, "orders");
        assert_eq!(standard.key, "acme");

        let isolated = strategy.resolve("orders", &TenantContext::isolated("megacorp"));
        assert_eq!(isolated.topic, "megacorp.orders");
    }

    proptest! {
        #[test]
        fn resolution_is_deterministic(
            topic in "[a-z][a-z0-9._-]{0,30}",
            tenant in "[a-z][a-z0-9-]{0,20}",
            isolated in any::<bool>(),
        ) {
            let context = if isolated {
                TenantContext::isolated(tenant)
            } else {
                TenantContext::new(tenant)
            };
            let strategy = HybridStrategy::default();
            prop_assert_eq!(
                strategy.resolve(&topic, &context),
                strategy.resolve(&topic, &context)
            );
        }

        #[test]
        fn distinct_tenants_never_collide_under_namespacing(
            topic in "[a-z][a-z0-9._-]{0,30}",
            tenant_a in "[a-z][a-z0-9-]{0,20}",
            tenant_b in "[a-z][a-z0-9-]{0,20}",
        ) {
            prop_assume!(tenant_a != tenant_b);
            let strategy = NamespacedStrategy::default();
            let a = strategy.resolve(&topic, &TenantContext::new(tenant_a));
            let b = strategy.resolve(&topic, &TenantContext::new(tenant_b));
            prop_assert_ne!(a.topic, b.topic);
        }
    }
}
