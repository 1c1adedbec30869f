//! Service account, role and role binding for the in-pod agent

use super::primitive::{ensure_owned, Child};
use super::{Context, ReconcileError};
use crate::api::{
    Kind, ObjectMeta, OwnerReference, PolicyRule, Role, RoleBinding, ServiceAccount, Subject,
};

impl Child for ServiceAccount {
    fn semantically_equal(&self, other: &Self) -> bool {
        self.metadata.labels == other.metadata.labels
    }
}

impl Child for Role {
    fn semantically_equal(&self, other: &Self) -> bool {
        self.rules == other.rules
    }
}

impl Child for RoleBinding {
    fn semantically_equal(&self, other: &Self) -> bool {
        self.role_name == other.role_name && self.subjects == other.subjects
    }
}

/// Rules letting an agent watch its parent kind and report back
///
/// Read access to the parent, write access to its status, and event
/// creation.
pub fn agent_rules(api_group: &str, parent: Kind) -> Vec<PolicyRule> {
    let plural = parent.plural();
    let status = format!("{}/status", plural);
    vec![
        PolicyRule::new(api_group, &[plural], &["get", "list", "watch"]),
        PolicyRule::new(api_group, &[status.as_str()], &["get", "update", "patch"]),
        PolicyRule::new("", &["events"], &["create", "update", "patch"]),
    ]
}

/// Ensure the agent's service account, role and binding
pub async fn ensure_agent_rbac(
    ctx: &Context,
    owner: &OwnerReference,
    namespace: &str,
    resource_name: &str,
) -> Result<(), ReconcileError> {
    let names = &ctx.config.names;
    let sa_name = names.service_account(resource_name);
    let role_name = names.role(resource_name);

    ensure_owned(&ctx.api::<ServiceAccount>(namespace), owner, &sa_name, |_| {
        Ok(ServiceAccount {
            metadata: ObjectMeta::new(namespace, &sa_name),
        })
    })
    .await?;

    let rules = agent_rules(&ctx.config.api_group, owner.kind);
    ensure_owned(&ctx.api::<Role>(namespace), owner, &role_name, |_| {
        Ok(Role {
            metadata: ObjectMeta::new(namespace, &role_name),
            rules,
        })
    })
    .await?;

    ensure_owned(&ctx.api::<RoleBinding>(namespace), owner, &role_name, |_| {
        Ok(RoleBinding {
            metadata: ObjectMeta::new(namespace, &role_name),
            role_name: role_name.clone(),
            subjects: vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: sa_name.clone(),
                namespace: namespace.to_string(),
            }],
        })
    })
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_rules() {
        let rules = agent_rules("tor.k8s.torproject.org", Kind::BalancedFleet);
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].resources, vec!["balancedfleets"]);
        assert_eq!(rules[0].verbs, vec!["get", "list", "watch"]);
        assert_eq!(rules[1].resources, vec!["balancedfleets/status"]);
        assert_eq!(rules[2].api_groups, vec![""]);
        assert_eq!(rules[2].resources, vec!["events"]);
    }
}
