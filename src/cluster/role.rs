//! Role scoping for downing decisions
//!
//! With a role configured, only nodes carrying it are counted and only they
//! can be downed. Other nodes stay in the view but are transparent to the
//! strategies.

use crate::types::ClusterNode;

/// Restricts decisions to nodes carrying a role
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleFilter {
    role: Option<String>,
}

impl RoleFilter {
    pub fn new(role: Option<String>) -> Self {
        Self { role }
    }

    /// Filter that admits every node
    pub fn all() -> Self {
        Self::default()
    }

    pub fn role(&self) -> Option<&str> {
        self.role.as_deref()
    }

    /// Whether the node participates in sizing and downing
    pub fn admits(&self, node: &ClusterNode) -> bool {
        match &self.role {
            Some(role) => node.has_role(role),
            None => true,
        }
    }

    /// Participating nodes, in the iteration order of `nodes`
    pub fn participants<'n>(&self, nodes: impl IntoIterator<Item = &'n ClusterNode>) -> Vec<&'n ClusterNode> {
        nodes.into_iter().filter(|node| self.admits(node)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeAddress;

    fn node(address: &str, roles: &[&str]) -> ClusterNode {
        ClusterNode::new(NodeAddress::new(address).unwrap(), 0).with_roles(roles.iter().copied())
    }

    #[test]
    fn test_unscoped_filter_admits_everyone() {
        let filter = RoleFilter::all();
        assert!(filter.admits(&node("a:1", &[])));
        assert!(filter.admits(&node("b:1", &["frontend"])));
    }

    #[test]
    fn test_scoped_filter() {
        let filter = RoleFilter::new(Some("backend".to_string()));
        let nodes = vec![
            node("a:1", &["backend"]),
            node("b:1", &["frontend"]),
            node("c:1", &["backend", "frontend"]),
        ];
        let admitted: Vec<_> = filter
            .participants(&nodes)
            .into_iter()
            .map(|n| n.address.as_str().to_string())
            .collect();
        assert_eq!(admitted, vec!["a:1", "c:1"]);
    }
}
