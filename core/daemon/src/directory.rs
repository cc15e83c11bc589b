use std::collections::HashMap;

use crate::config::UserEntry;

/// Resolves a user id to display attributes.
pub trait UserDirectory: Send + Sync {
    fn display_name(&self, user_id: &str) -> Option<String>;
}

/// Directory backed by the `[users]` table of the daemon config.
#[derive(Debug, Default, Clone)]
pub struct ConfigDirectory {
    names: HashMap<String, String>,
}

impl ConfigDirectory {
    pub fn from_entries(entries: &HashMap<String, UserEntry>) -> Self {
        let names = entries
            .iter()
            .filter(|(_, entry)| !entry.display_name.trim().is_empty())
            .map(|(user_id, entry)| (user_id.clone(), entry.display_name.trim().to_string()))
            .collect();
        Self { names }
    }
}

impl UserDirectory for ConfigDirectory {
    fn display_name(&self, user_id: &str) -> Option<String> {
        self.names.get(user_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_blank_entries() {
        let mut entries = HashMap::new();
        entries.insert(
            "u-1".to_string(),
            UserEntry {
                display_name: " Grace ".to_string(),
            },
        );
        entries.insert(
            "u-2".to_string(),
            UserEntry {
                display_name: "  ".to_string(),
            },
        );

        let directory = ConfigDirectory::from_entries(&entries);
        assert_eq!(directory.display_name("u-1").as_deref(), Some("Grace"));
        assert_eq!(directory.display_name("u-2"), None);
        assert_eq!(directory.display_name("u-3"), None);
    }
}
