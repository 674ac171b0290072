use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::dispatch::{GroupDirectory, Recipient};

/// Group membership resolved once from configuration and immutable afterwards,
/// so concurrent dispatches read it without locking.
#[derive(Debug)]
pub struct StaticDirectory {
    groups: HashMap<String, Vec<Recipient>>,
}

impl StaticDirectory {
    /// Build from the `[directory.groups]` table of raw recipient strings.
    pub fn from_config(raw: &HashMap<String, Vec<String>>) -> Result<Arc<Self>> {
        let mut groups = HashMap::new();
        for (group_id, members) in raw {
            let mut resolved = Vec::with_capacity(members.len());
            for member in members {
                let recipient = Recipient::parse(member)
                    .with_context(|| format!("group {group_id:?} has an invalid member"))?;
                resolved.push(recipient);
            }
            groups.insert(group_id.clone(), resolved);
        }
        Ok(Arc::new(Self { groups }))
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

impl GroupDirectory for StaticDirectory {
    fn members(&self, group_id: &str) -> Option<Vec<Recipient>> {
        self.groups.get(group_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_groups(entries: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
        entries
            .iter()
            .map(|(id, members)| {
                (
                    id.to_string(),
                    members.iter().map(|m| m.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn members_preserve_configured_order() {
        let raw = raw_groups(&[("team-a", &["slack:u1", "group:team-b", "slack:u2"])]);
        let directory = StaticDirectory::from_config(&raw).unwrap();

        let members = directory.members("team-a").expect("group present");
        assert_eq!(
            members,
            vec![
                Recipient::individual("slack", "u1"),
                Recipient::group("team-b"),
                Recipient::individual("slack", "u2"),
            ]
        );
    }

    #[test]
    fn unknown_group_is_none() {
        let directory = StaticDirectory::from_config(&HashMap::new()).unwrap();
        assert!(directory.members("nobody").is_none());
    }

    #[test]
    fn invalid_member_string_fails_construction() {
        let raw = raw_groups(&[("broken", &["slack:u1", "not-a-recipient"])]);
        let err = StaticDirectory::from_config(&raw).unwrap_err();
        assert!(err.to_string().contains("broken"));
    }
}
