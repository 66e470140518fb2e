use bazaar_shared::{EventId, MerchItemId, VendorId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Role a viewer holds on one event, as asserted by the auth collaborator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventRole {
    Owner,
    Manager,
    Staff,
}

impl EventRole {
    /// Owners and managers organize the event; staff do not.
    pub fn is_organizer(&self) -> bool {
        matches!(self, EventRole::Owner | EventRole::Manager)
    }
}

/// Who is looking at an order. Supplied whole by the auth collaborator;
/// this core never looks roles up itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ViewerContext {
    pub viewer_id: VendorId,
    #[serde(default)]
    pub event_roles: HashMap<EventId, EventRole>,
    #[serde(default)]
    pub brand_items: HashSet<MerchItemId>,
}

impl ViewerContext {
    pub fn new(viewer_id: VendorId) -> Self {
        Self {
            viewer_id,
            event_roles: HashMap::new(),
            brand_items: HashSet::new(),
        }
    }

    pub fn with_event_role(mut self, event_id: EventId, role: EventRole) -> Self {
        self.event_roles.insert(event_id, role);
        self
    }

    pub fn with_brand_item(mut self, item: MerchItemId) -> Self {
        self.brand_items.insert(item);
        self
    }

    pub fn is_organizer_of(&self, event_id: &EventId) -> bool {
        self.event_roles
            .get(event_id)
            .map(EventRole::is_organizer)
            .unwrap_or(false)
    }

    pub fn owns_brand_item(&self, item: &MerchItemId) -> bool {
        self.brand_items.contains(item)
    }
}

/// Author of a timeline event or ledger entry. Rendered as `system`,
/// `vendor:<id>` or `user:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Actor {
    System,
    Vendor(VendorId),
    User(String),
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::System => f.write_str("system"),
            Actor::Vendor(id) => write!(f, "vendor:{}", id),
            Actor::User(id) => write!(f, "user:{}", id),
        }
    }
}

impl std::str::FromStr for Actor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "system" {
            return Ok(Actor::System);
        }
        match s.split_once(':') {
            Some(("vendor", id)) if !id.is_empty() => Ok(Actor::Vendor(VendorId::new(id))),
            Some(("user", id)) if !id.is_empty() => Ok(Actor::User(id.to_string())),
            _ => Err(format!("unrecognised actor: {}", s)),
        }
    }
}

impl Serialize for Actor {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Actor {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staff_is_not_organizer() {
        let event = EventId::new("evt-1");
        let viewer = ViewerContext::new(VendorId::new("v-1")).with_event_role(event.clone(), EventRole::Staff);
        assert!(!viewer.is_organizer_of(&event));

        let viewer = viewer.with_event_role(event.clone(), EventRole::Manager);
        assert!(viewer.is_organizer_of(&event));
    }

    #[test]
    fn test_actor_round_trips_through_text() {
        let actor = Actor::Vendor(VendorId::new("acme"));
        assert_eq!(actor.to_string(), "vendor:acme");
        assert_eq!("vendor:acme".parse::<Actor>().unwrap(), actor);
        assert_eq!("system".parse::<Actor>().unwrap(), Actor::System);
        assert!("vendor:".parse::<Actor>().is_err());
    }
}
