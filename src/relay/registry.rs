//! Pattern registry
//!
//! Registrations are grouped by [`Route`]; each route maps to one transport
//! subscription. Every route on a subject receives its own copy of a call, so
//! a call is resolved against all registrations on the subject and only the
//! route holding the best match answers it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::addressing::Route;
use super::handler::Handler;
use crate::types::Pattern;

/// Identifier returned by `add`, used to remove the registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId(pub u64);

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reg-{}", self.0)
    }
}

pub struct Registration {
    pub id: RegistrationId,
    /// Pattern as registered, qualifiers included
    pub pattern: Pattern,
    pub route: Route,
    pub handler: Arc<dyn Handler>,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .field("route", &self.route)
            .finish_non_exhaustive()
    }
}

/// Outcome of resolving an inbound call on one route
#[derive(Debug, Clone)]
pub enum Resolution {
    /// This route serves the call
    Handle(Arc<Registration>),
    /// A sibling route on the same subject serves it; stay silent
    Defer,
    /// Nothing on the subject matches
    NotFound,
}

/// Most specific registration accepting `request`; ties go to the earliest
fn best_match(entries: &[Arc<Registration>], request: &Pattern) -> Option<Arc<Registration>> {
    let mut best: Option<&Arc<Registration>> = None;
    for candidate in entries.iter().filter(|r| r.pattern.matches(request)) {
        let better = best.map_or(true, |current| {
            candidate.pattern.specificity() > current.pattern.specificity()
        });
        if better {
            best = Some(candidate);
        }
    }
    best.cloned()
}

#[derive(Default)]
pub struct Registry {
    next_id: u64,
    routes: BTreeMap<Route, Vec<Arc<Registration>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a registration
    ///
    /// The flag reports whether it is the first on its route, i.e. whether a
    /// transport subscription must be opened.
    pub fn insert(
        &mut self,
        pattern: Pattern,
        route: Route,
        handler: Arc<dyn Handler>,
    ) -> (Arc<Registration>, bool) {
        self.next_id += 1;
        let registration = Arc::new(Registration {
            id: RegistrationId(self.next_id),
            pattern,
            route: route.clone(),
            handler,
        });
        let entries = self.routes.entry(route).or_default();
        let first = entries.is_empty();
        entries.push(Arc::clone(&registration));
        (registration, first)
    }

    /// Drop a registration
    ///
    /// The flag reports whether its route is now empty and its subscription
    /// can be released.
    pub fn remove(&mut self, id: RegistrationId) -> Option<(Arc<Registration>, bool)> {
        let route = self
            .routes
            .iter()
            .find(|(_, entries)| entries.iter().any(|r| r.id == id))
            .map(|(route, _)| route.clone())?;

        let entries = self.routes.get_mut(&route)?;
        let index = entries.iter().position(|r| r.id == id)?;
        let removed = entries.remove(index);
        let emptied = entries.is_empty();
        if emptied {
            self.routes.remove(&route);
        }
        Some((removed, emptied))
    }

    /// Decide what `route` does with a call that arrived on it
    ///
    /// The route handles the call when its best match is at least as specific
    /// as any match on a sibling route of the same subject, and defers to the
    /// sibling otherwise. When nothing on the subject matches, only the
    /// subject's first route answers with "not found".
    pub fn resolve(&self, route: &Route, request: &Pattern) -> Resolution {
        let own = self.routes.get(route).and_then(|entries| best_match(entries, request));
        let elsewhere = self
            .routes
            .iter()
            .filter(|(other, _)| other.subject == route.subject && *other != route)
            .filter_map(|(_, entries)| best_match(entries, request))
            .map(|r| r.pattern.specificity())
            .max();

        match (own, elsewhere) {
            (Some(own), Some(other)) if other > own.pattern.specificity() => Resolution::Defer,
            (Some(own), _) => Resolution::Handle(own),
            (None, Some(_)) => Resolution::Defer,
            (None, None) => {
                let first = self.routes.keys().find(|r| r.subject == route.subject);
                if first.map_or(true, |first| first == route) {
                    Resolution::NotFound
                } else {
                    Resolution::Defer
                }
            }
        }
    }

    /// Routing identities of every registration, sorted
    pub fn list(&self) -> Vec<String> {
        let mut methods: Vec<String> = self
            .routes
            .values()
            .flatten()
            .map(|r| r.pattern.method())
            .collect();
        methods.sort();
        methods
    }

    pub fn routes(&self) -> Vec<Route> {
        self.routes.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.routes.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn clear(&mut self) {
        self.routes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::handler::{HandlerStream, Request};
    use serde_json::json;

    struct Noop;

    impl Handler for Noop {
        fn call(&self, _request: Request) -> HandlerStream {
            Box::pin(futures::stream::empty())
        }
    }

    fn pattern(value: serde_json::Value) -> Pattern {
        Pattern::from_value(value).unwrap()
    }

    fn register(registry: &mut Registry, value: serde_json::Value) -> (Arc<Registration>, bool) {
        let p = pattern(value);
        let route = Route::for_registration(&p).unwrap();
        registry.insert(p, route, Arc::new(Noop))
    }

    #[test]
    fn test_first_registration_on_route_is_flagged() {
        let mut registry = Registry::new();
        let (_, first) = register(&mut registry, json!({"topic": "math", "cmd": "add"}));
        let (_, second) = register(&mut registry, json!({"topic": "math", "cmd": "sub"}));
        assert!(first);
        assert!(!second);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.routes().len(), 1);
    }

    fn handled(resolution: Resolution) -> RegistrationId {
        match resolution {
            Resolution::Handle(registration) => registration.id,
            other => panic!("expected a handler, got {:?}", other),
        }
    }

    #[test]
    fn test_resolve_prefers_most_specific() {
        let mut registry = Registry::new();
        register(&mut registry, json!({"topic": "math"}));
        let (specific, _) = register(&mut registry, json!({"topic": "math", "cmd": "add"}));
        let route = specific.route.clone();

        let request = pattern(json!({"topic": "math", "cmd": "add", "a": 1}));
        assert_eq!(handled(registry.resolve(&route, &request)), specific.id);
    }

    #[test]
    fn test_resolve_ties_go_to_first_registered() {
        let mut registry = Registry::new();
        let (first, _) = register(&mut registry, json!({"topic": "math", "cmd": "add"}));
        register(&mut registry, json!({"topic": "math", "cmd": "add"}));
        let request = pattern(json!({"topic": "math", "cmd": "add"}));
        assert_eq!(handled(registry.resolve(&first.route, &request)), first.id);
    }

    #[test]
    fn test_route_without_match_defers_to_sibling() {
        let mut registry = Registry::new();
        let (custom, _) = register(
            &mut registry,
            json!({"topic": "email", "cmd": "send", "queue$": "zz"}),
        );
        let (stats, _) = register(&mut registry, json!({"topic": "email", "cmd": "stats"}));
        let request = pattern(json!({"topic": "email", "cmd": "send"}));

        assert_eq!(handled(registry.resolve(&custom.route, &request)), custom.id);
        assert!(matches!(registry.resolve(&stats.route, &request), Resolution::Defer));
    }

    #[test]
    fn test_less_specific_route_defers() {
        let mut registry = Registry::new();
        let (generic, _) = register(&mut registry, json!({"topic": "email"}));
        let (custom, _) = register(
            &mut registry,
            json!({"topic": "email", "cmd": "send", "queue$": "A"}),
        );
        let request = pattern(json!({"topic": "email", "cmd": "send"}));

        assert!(matches!(registry.resolve(&generic.route, &request), Resolution::Defer));
        assert_eq!(handled(registry.resolve(&custom.route, &request)), custom.id);
    }

    #[test]
    fn test_equal_matches_in_distinct_groups_both_handle() {
        let mut registry = Registry::new();
        let (a, _) = register(
            &mut registry,
            json!({"topic": "email", "cmd": "send", "queue$": "A"}),
        );
        let (b, _) = register(
            &mut registry,
            json!({"topic": "email", "cmd": "send", "queue$": "B"}),
        );
        let request = pattern(json!({"topic": "email", "cmd": "send"}));

        assert_eq!(handled(registry.resolve(&a.route, &request)), a.id);
        assert_eq!(handled(registry.resolve(&b.route, &request)), b.id);
    }

    #[test]
    fn test_unmatched_call_is_reported_once_per_subject() {
        let mut registry = Registry::new();
        let (a, _) = register(
            &mut registry,
            json!({"topic": "email", "cmd": "send", "queue$": "A"}),
        );
        let (b, _) = register(
            &mut registry,
            json!({"topic": "email", "cmd": "send", "queue$": "B"}),
        );
        let request = pattern(json!({"topic": "email", "cmd": "archive"}));

        let not_found = [&a.route, &b.route]
            .into_iter()
            .filter(|route| matches!(registry.resolve(route, &request), Resolution::NotFound))
            .count();
        assert_eq!(not_found, 1);
    }

    #[test]
    fn test_remove_reports_emptied_route() {
        let mut registry = Registry::new();
        let (a, _) = register(&mut registry, json!({"topic": "math", "cmd": "add"}));
        let (b, _) = register(&mut registry, json!({"topic": "math", "cmd": "sub"}));

        let (_, emptied) = registry.remove(a.id).unwrap();
        assert!(!emptied);
        let (_, emptied) = registry.remove(b.id).unwrap();
        assert!(emptied);
        assert!(registry.is_empty());
        assert!(registry.remove(b.id).is_none());
    }

    #[test]
    fn test_list_is_sorted() {
        let mut registry = Registry::new();
        register(&mut registry, json!({"topic": "math", "cmd": "sub"}));
        register(&mut registry, json!({"topic": "health", "cmd": "check"}));
        assert_eq!(
            registry.list(),
            vec!["cmd:check,topic:health", "cmd:sub,topic:math"]
        );
    }
}
