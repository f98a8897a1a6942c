//! Hierarchy registry.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use ember_props::PropertyStore;
use ember_time::Timing;
use tracing::warn;

use crate::database::{self, HierarchyRecord};
use crate::hierarchy::{Hierarchy, NodeId};

/// Maps hierarchy ids to live hierarchies.
pub struct DomainManager {
    timing: Rc<Timing>,
    props: Rc<PropertyStore>,
    hierarchies: HashMap<u8, Rc<RefCell<Hierarchy>>>,
}

impl DomainManager {
    pub fn new(timing: Rc<Timing>, props: Rc<PropertyStore>) -> Self {
        Self {
            timing,
            props,
            hierarchies: HashMap::new(),
        }
    }

    pub fn properties(&self) -> &Rc<PropertyStore> {
        &self.props
    }

    /// Takes the built-in database record `id` into use.
    ///
    /// Succeeds only when the id exists in the database and is not already
    /// registered.
    pub fn add_hierarchy_from_database(&mut self, id: u8) -> bool {
        let Some(record) = database::find_hierarchy(id) else {
            return false;
        };
        self.add_hierarchy(record)
    }

    /// Registers a hierarchy built from an arbitrary record.
    pub fn add_hierarchy(&mut self, record: &HierarchyRecord) -> bool {
        if self.hierarchies.contains_key(&record.id) {
            return false;
        }
        match Hierarchy::from_record(record, &self.timing, &self.props) {
            Ok(hier) => {
                self.hierarchies.insert(record.id, hier);
                true
            }
            Err(err) => {
                warn!(hierarchy = record.id, error = %err, "rejecting hierarchy record");
                false
            }
        }
    }

    /// A missing id is not an error; callers translate `None` themselves.
    pub fn lookup_hierarchy(&self, id: u8) -> Option<Rc<RefCell<Hierarchy>>> {
        self.hierarchies.get(&id).cloned()
    }

    pub fn lookup_domain(
        &self,
        hierarchy_id: u8,
        domain_id: u16,
    ) -> Option<(Rc<RefCell<Hierarchy>>, NodeId)> {
        let hier = self.lookup_hierarchy(hierarchy_id)?;
        let node = hier.borrow().lookup(domain_id)?;
        Some((hier, node))
    }
}
