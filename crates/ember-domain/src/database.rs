//! Built-in hierarchy database.
//!
//! Read-only records describing the hierarchies a guest may take into use.
//! Constructors read these field by field and never mutate them.

use thiserror::Error;

use crate::hierarchy::{FailPolicy, TraverseDirection};

/// A malformed hierarchy record.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseError {
    #[error("hierarchy {hierarchy}: domain id 0 is reserved for the sentinel root")]
    ReservedDomainId { hierarchy: u8 },

    #[error("hierarchy {hierarchy}: duplicate domain id {domain}")]
    DuplicateDomain { hierarchy: u8, domain: u16 },

    #[error("hierarchy {hierarchy}: domain {domain} references unknown parent {parent}")]
    DanglingParent {
        hierarchy: u8,
        domain: u16,
        parent: u16,
    },
}

/// One domain of a hierarchy. `parent` refers to another record's `id`, or
/// `0` for a top-level domain attached to the hierarchy's sentinel root.
#[derive(Debug, Clone, Copy)]
pub struct DomainRecord {
    pub id: u16,
    pub parent: u16,
    pub init_state: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct HierarchyRecord {
    pub id: u8,
    pub positive_dir: TraverseDirection,
    pub negative_dir: TraverseDirection,
    pub fail_policy: FailPolicy,
    pub trans_timeout_ticks: u64,
    pub domains: &'static [DomainRecord],
}

impl HierarchyRecord {
    /// Checks the record's tree shape before any construction happens.
    ///
    /// A parent reference must name an earlier (or any) record in the same
    /// hierarchy or `0` for the sentinel root; ids must be unique and
    /// non-zero.
    pub fn validate(&self) -> Result<(), DatabaseError> {
        for (index, dom) in self.domains.iter().enumerate() {
            if dom.id == 0 {
                return Err(DatabaseError::ReservedDomainId { hierarchy: self.id });
            }
            if self.domains[..index].iter().any(|d| d.id == dom.id) {
                return Err(DatabaseError::DuplicateDomain {
                    hierarchy: self.id,
                    domain: dom.id,
                });
            }
            if dom.parent != 0 && !self.domains.iter().any(|d| d.id == dom.parent) {
                return Err(DatabaseError::DanglingParent {
                    hierarchy: self.id,
                    domain: dom.id,
                    parent: dom.parent,
                });
            }
        }
        Ok(())
    }
}

pub const POWER_HIERARCHY_ID: u8 = 1;
pub const STARTUP_HIERARCHY_ID: u8 = 2;

pub const POWER_DOMAIN_ROOT: u16 = 1;
pub const POWER_DOMAIN_APPS: u16 = 2;
pub const POWER_DOMAIN_UI_APPS: u16 = 3;

pub const POWER_STATE_ACTIVE: i32 = 1;
pub const POWER_STATE_STANDBY: i32 = 2;
pub const POWER_STATE_OFF: i32 = 3;

pub const STARTUP_DOMAIN_CRITICAL_STATIC: u16 = 1;
pub const STARTUP_DOMAIN_CRITICAL_DYNAMIC: u16 = 2;
pub const STARTUP_DOMAIN_NON_CRITICAL: u16 = 3;

static POWER_DOMAINS: &[DomainRecord] = &[
    DomainRecord {
        id: POWER_DOMAIN_ROOT,
        parent: 0,
        init_state: POWER_STATE_ACTIVE,
    },
    DomainRecord {
        id: POWER_DOMAIN_APPS,
        parent: POWER_DOMAIN_ROOT,
        init_state: POWER_STATE_ACTIVE,
    },
    DomainRecord {
        id: POWER_DOMAIN_UI_APPS,
        parent: POWER_DOMAIN_ROOT,
        init_state: POWER_STATE_ACTIVE,
    },
];

static STARTUP_DOMAINS: &[DomainRecord] = &[
    DomainRecord {
        id: STARTUP_DOMAIN_CRITICAL_STATIC,
        parent: 0,
        init_state: 0,
    },
    DomainRecord {
        id: STARTUP_DOMAIN_CRITICAL_DYNAMIC,
        parent: STARTUP_DOMAIN_CRITICAL_STATIC,
        init_state: 0,
    },
    DomainRecord {
        id: STARTUP_DOMAIN_NON_CRITICAL,
        parent: STARTUP_DOMAIN_CRITICAL_DYNAMIC,
        init_state: 0,
    },
];

/// Every hierarchy a guest may register.
pub static HIERARCHIES: &[HierarchyRecord] = &[
    HierarchyRecord {
        id: POWER_HIERARCHY_ID,
        // Powering up walks parents before children; powering down reverses.
        positive_dir: TraverseDirection::ParentFirst,
        negative_dir: TraverseDirection::ChildrenFirst,
        fail_policy: FailPolicy::Stop,
        trans_timeout_ticks: 5_000_000,
        domains: POWER_DOMAINS,
    },
    HierarchyRecord {
        id: STARTUP_HIERARCHY_ID,
        positive_dir: TraverseDirection::ParentFirst,
        negative_dir: TraverseDirection::ChildrenFirst,
        fail_policy: FailPolicy::Continue,
        trans_timeout_ticks: 10_000_000,
        domains: STARTUP_DOMAINS,
    },
];

pub fn find_hierarchy(id: u8) -> Option<&'static HierarchyRecord> {
    HIERARCHIES.iter().find(|h| h.id == id)
}
