use std::collections::BTreeMap;

use parking_lot::RwLock;
use tokio::sync::watch;

use crate::error::{LatticeError, Result};
use crate::types::AgentAdvert;
use crate::util::is_subject_token;

/// Agents hosted by this station.
///
/// Every change bumps a version published through a watch channel so the
/// presence publisher can announce the new set right away.
pub struct AgentCatalog {
    agents: RwLock<BTreeMap<String, AgentAdvert>>,
    version: watch::Sender<u64>,
}

impl AgentCatalog {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            agents: RwLock::new(BTreeMap::new()),
            version,
        }
    }

    /// Add or replace an agent. Returns whether the advertised set changed.
    pub fn register(&self, advert: AgentAdvert) -> Result<bool> {
        if !is_subject_token(&advert.name) {
            return Err(LatticeError::InvalidRequest(format!(
                "agent name '{}' must not contain '.', '*', '>' or whitespace",
                advert.name
            )));
        }
        let changed = {
            let mut agents = self.agents.write();
            let previous = agents.insert(advert.name.clone(), advert.clone());
            previous.as_ref() != Some(&advert)
        };
        if changed {
            self.bump();
        }
        Ok(changed)
    }

    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.agents.write().remove(name).is_some();
        if removed {
            self.bump();
        }
        removed
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.read().contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<AgentAdvert> {
        self.agents.read().get(name).cloned()
    }

    /// Current agent set, sorted by name.
    pub fn agents(&self) -> Vec<AgentAdvert> {
        self.agents.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    pub fn watch(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}

impl Default for AgentCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_unregister_track_changes() {
        let catalog = AgentCatalog::new();
        let rx = catalog.watch();

        assert!(catalog.register(AgentAdvert::new("reporter")).unwrap());
        assert!(!catalog.register(AgentAdvert::new("reporter")).unwrap());
        assert!(catalog
            .register(AgentAdvert::new("reporter").with_capabilities(["summaries"]))
            .unwrap());
        assert_eq!(*rx.borrow(), 2);

        assert!(catalog.contains("reporter"));
        assert!(catalog.unregister("reporter"));
        assert!(!catalog.unregister("reporter"));
        assert!(catalog.is_empty());
        assert_eq!(*rx.borrow(), 3);
    }

    #[test]
    fn rejects_names_that_are_not_subject_tokens() {
        let catalog = AgentCatalog::new();
        assert!(catalog.register(AgentAdvert::new("bad.name")).is_err());
        assert!(catalog.register(AgentAdvert::new("")).is_err());
    }

    #[test]
    fn watchers_wake_only_on_real_changes() {
        let catalog = AgentCatalog::new();
        let mut rx = catalog.watch();

        {
            let mut changed = tokio_test::task::spawn(rx.changed());
            tokio_test::assert_pending!(changed.poll());
            assert!(!catalog.unregister("missing"));
            assert!(!changed.is_woken());
            catalog.register(AgentAdvert::new("reporter")).unwrap();
            assert!(changed.is_woken());
            tokio_test::assert_ready_ok!(changed.poll());
        }

        let mut changed = tokio_test::task::spawn(rx.changed());
        catalog.register(AgentAdvert::new("reporter")).unwrap();
        tokio_test::assert_pending!(changed.poll());
    }

    #[test]
    fn agents_are_sorted() {
        let catalog = AgentCatalog::new();
        catalog.register(AgentAdvert::new("zeta")).unwrap();
        catalog.register(AgentAdvert::new("alpha")).unwrap();
        let names: Vec<String> = catalog.agents().into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
