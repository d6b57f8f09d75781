//! Contact graphs, one per disease.
//!
//! A [`DiseaseGraph`] is an immutable-per-run snapshot: the registered users,
//! their symmetric contact relation and the per-user health payload for one
//! disease. The payload type is generic so the same traversal serves
//! encrypted health (`H = Ciphertext`), plaintext oracles (`H = f64`) and
//! unresolved snapshots (`H = ContentId`).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::Error;

/// Opaque user identifier.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Clone, Debug)]
pub struct DiseaseGraph<H> {
    disease_id: String,
    users: BTreeSet<UserId>,
    contacts: BTreeMap<UserId, BTreeSet<UserId>>,
    health: BTreeMap<UserId, H>,
    max_contacts: Option<usize>,
}

impl<H> DiseaseGraph<H> {
    pub fn new(disease_id: impl Into<String>) -> Self {
        Self {
            disease_id: disease_id.into(),
            users: BTreeSet::new(),
            contacts: BTreeMap::new(),
            health: BTreeMap::new(),
            max_contacts: None,
        }
    }

    /// Caps the number of contacts any user may have.
    pub fn with_max_contacts(mut self, limit: usize) -> Self {
        self.max_contacts = Some(limit);
        self
    }

    /// Builds a graph from a user list and an edge list.
    pub fn from_edges<U, E>(disease_id: impl Into<String>, users: U, edges: E) -> Result<Self, Error>
    where
        U: IntoIterator,
        U::Item: Into<UserId>,
        E: IntoIterator,
        E::Item: Into<(UserId, UserId)>,
    {
        let mut graph = Self::new(disease_id);
        for user in users {
            graph.add_user(user);
        }
        for edge in edges {
            let (a, b) = edge.into();
            graph.add_contact(&a, &b)?;
        }
        Ok(graph)
    }

    pub fn disease_id(&self) -> &str {
        &self.disease_id
    }

    /// Registers a user; returns `false` if already present.
    pub fn add_user(&mut self, user: impl Into<UserId>) -> bool {
        self.users.insert(user.into())
    }

    /// Records a contact in both directions. Re-adding an existing contact
    /// is a no-op.
    pub fn add_contact(&mut self, a: &UserId, b: &UserId) -> Result<(), Error> {
        if a == b {
            return Err(Error::MalformedInput(format!("user {a} cannot be their own contact")));
        }
        for user in [a, b] {
            if !self.users.contains(user) {
                return Err(Error::UnknownUser(user.to_string()));
            }
        }
        if self.contacts.get(a).is_some_and(|set| set.contains(b)) {
            return Ok(());
        }
        if let Some(limit) = self.max_contacts {
            for user in [a, b] {
                if self.contacts.get(user).map_or(0, BTreeSet::len) >= limit {
                    return Err(Error::TooManyContacts {
                        user: user.to_string(),
                        limit,
                    });
                }
            }
        }
        self.contacts.entry(a.clone()).or_default().insert(b.clone());
        self.contacts.entry(b.clone()).or_default().insert(a.clone());
        Ok(())
    }

    /// Sets the health payload of a registered user, returning the previous one.
    pub fn set_health(&mut self, user: &UserId, health: H) -> Result<Option<H>, Error> {
        if !self.users.contains(user) {
            return Err(Error::UnknownUser(user.to_string()));
        }
        Ok(self.health.insert(user.clone(), health))
    }

    pub fn users(&self) -> impl Iterator<Item = &UserId> {
        self.users.iter()
    }

    pub fn contains(&self, user: &UserId) -> bool {
        self.users.contains(user)
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn edge_count(&self) -> usize {
        self.contacts.values().map(BTreeSet::len).sum::<usize>() / 2
    }

    pub fn contacts_of(&self, user: &UserId) -> impl Iterator<Item = &UserId> {
        self.contacts.get(user).into_iter().flatten()
    }

    pub fn health(&self, user: &UserId) -> Option<&H> {
        self.health.get(user)
    }

    pub fn health_entries(&self) -> impl Iterator<Item = (&UserId, &H)> {
        self.health.iter()
    }

    /// Users grouped by BFS depth from `source`, up to `max_depth`
    /// inclusive. Every reachable user appears once, at its shortest-path
    /// distance. Unknown sources yield no layers.
    pub fn bfs_layers(&self, source: &UserId, max_depth: usize) -> Vec<Vec<UserId>> {
        let mut layers = Vec::new();
        if !self.users.contains(source) {
            return layers;
        }
        let mut visited = BTreeSet::from([source.clone()]);
        let mut frontier = vec![source.clone()];
        for depth in 0..=max_depth {
            if frontier.is_empty() {
                break;
            }
            if depth < max_depth {
                // discoveries are marked after the whole layer is expanded
                let mut next = BTreeSet::new();
                for user in &frontier {
                    for contact in self.contacts_of(user) {
                        if !visited.contains(contact) {
                            next.insert(contact.clone());
                        }
                    }
                }
                visited.extend(next.iter().cloned());
                layers.push(std::mem::replace(&mut frontier, next.into_iter().collect()));
            } else {
                layers.push(std::mem::take(&mut frontier));
            }
        }
        layers
    }

    /// Converts every health payload with `resolve`; users whose payload
    /// fails to resolve keep no health entry and are reported.
    pub fn resolve_health<G, F>(self, mut resolve: F) -> (DiseaseGraph<G>, BTreeMap<UserId, Error>)
    where
        F: FnMut(&UserId, H) -> Result<G, Error>,
    {
        let mut health = BTreeMap::new();
        let mut failures = BTreeMap::new();
        for (user, payload) in self.health {
            match resolve(&user, payload) {
                Ok(resolved) => {
                    health.insert(user, resolved);
                }
                Err(err) => {
                    failures.insert(user, err);
                }
            }
        }
        let graph = DiseaseGraph {
            disease_id: self.disease_id,
            users: self.users,
            contacts: self.contacts,
            health,
            max_contacts: self.max_contacts,
        };
        (graph, failures)
    }
}
