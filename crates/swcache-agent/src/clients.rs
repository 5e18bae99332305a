//! Open page sessions and which cache version controls them.

use hashbrown::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use swcache_net::same_origin;
use url::Url;

/// A client (controlled page).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Client URL.
    pub url: Url,

    /// Cache version serving this client, if any.
    pub controller: Option<String>,
}

/// Clients API.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly opened, uncontrolled page. Returns its ID.
    pub fn add(&mut self, url: Url) -> String {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let id = format!("client-{}", COUNTER.fetch_add(1, Ordering::Relaxed));
        self.clients.insert(
            id.clone(),
            Client {
                id: id.clone(),
                url,
                controller: None,
            },
        );
        id
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Remove a client.
    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Clients currently served by `version`.
    pub fn controlled_by(&self, version: &str) -> Vec<&Client> {
        self.clients
            .values()
            .filter(|c| c.controller.as_deref() == Some(version))
            .collect()
    }

    /// Take control of every client in `origin` for `version`.
    ///
    /// Returns the IDs whose controller changed.
    pub fn claim(&mut self, origin: &Url, version: &str) -> Vec<String> {
        let mut changed: Vec<String> = self
            .clients
            .values_mut()
            .filter(|c| same_origin(&c.url, origin))
            .filter(|c| c.controller.as_deref() != Some(version))
            .map(|c| {
                c.controller = Some(version.to_string());
                c.id.clone()
            })
            .collect();
        changed.sort();
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_add_get_remove() {
        let mut clients = Clients::new();
        let id = clients.add(url("http://localhost:5000/user/1"));

        assert_eq!(clients.get(&id).unwrap().controller, None);
        assert_eq!(clients.len(), 1);

        assert!(clients.remove(&id).is_some());
        assert!(clients.is_empty());
    }

    #[test]
    fn test_claim_only_same_origin() {
        let origin = url("http://localhost:5000/");
        let mut clients = Clients::new();
        let ours = clients.add(url("http://localhost:5000/project/3"));
        let theirs = clients.add(url("https://cdn.example.com/"));

        let changed = clients.claim(&origin, "v2");

        assert_eq!(changed, vec![ours.clone()]);
        assert_eq!(clients.get(&ours).unwrap().controller.as_deref(), Some("v2"));
        assert_eq!(clients.get(&theirs).unwrap().controller, None);
        assert_eq!(clients.controlled_by("v2").len(), 1);
    }

    #[test]
    fn test_claim_replaces_old_controller_once() {
        let origin = url("http://localhost:5000/");
        let mut clients = Clients::new();
        let id = clients.add(url("http://localhost:5000/"));

        clients.claim(&origin, "v1");
        assert_eq!(clients.claim(&origin, "v2"), vec![id.clone()]);
        assert!(clients.claim(&origin, "v2").is_empty());
        assert!(clients.controlled_by("v1").is_empty());
    }
}
