//! Entities exposed to the rest of the application.
//!
//! The registry holds the inquiry switch and one presence sensor per
//! monitored device. Registration is idempotent: adding an entity whose id is
//! already taken returns the registered one.

pub mod inquiry_switch;
pub mod presence_sensor;

pub use inquiry_switch::{INQUIRY_SWITCH_ID, InquirySwitch};
pub use presence_sensor::{NOT_HOME, PresenceSensor};

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
pub enum Entity {
    Sensor(Arc<PresenceSensor>),
    Switch(Arc<InquirySwitch>),
}

impl Entity {
    pub fn id(&self) -> &str {
        match self {
            Entity::Sensor(sensor) => sensor.id(),
            Entity::Switch(switch) => switch.id(),
        }
    }

    pub fn as_sensor(&self) -> Option<&Arc<PresenceSensor>> {
        match self {
            Entity::Sensor(sensor) => Some(sensor),
            Entity::Switch(_) => None,
        }
    }

    pub fn as_switch(&self) -> Option<&Arc<InquirySwitch>> {
        match self {
            Entity::Switch(switch) => Some(switch),
            Entity::Sensor(_) => None,
        }
    }
}

#[derive(Default)]
pub struct EntityRegistry {
    entities: RwLock<HashMap<String, Entity>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `entity` unless its id is taken; returns the registered entity.
    pub fn add(&self, entity: Entity) -> Entity {
        self.entities
            .write()
            .entry(entity.id().to_string())
            .or_insert(entity)
            .clone()
    }

    pub fn get(&self, id: &str) -> Option<Entity> {
        self.entities.read().get(id).cloned()
    }

    pub fn has(&self, id: &str) -> bool {
        self.entities.read().contains_key(id)
    }

    pub fn sensors(&self) -> Vec<Arc<PresenceSensor>> {
        self.entities
            .read()
            .values()
            .filter_map(|e| e.as_sensor().cloned())
            .collect()
    }
}
