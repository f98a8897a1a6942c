//! Guest-facing request handlers for the domain and manager services.
//!
//! Transport is external: each handler receives an [`IpcContext`] plus a
//! typed request and either completes the context or parks its status cell
//! into the transition machine.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use ember_ipc::{IpcContext, SessionId, SysError};

use crate::hierarchy::{Hierarchy, NodeId, ObserveFlags, TraverseDirection};
use crate::manager::DomainManager;
use crate::{DM_CATEGORY, DM_INIT_KEY};

/// Operations of the domain service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainRequest {
    Join { hierarchy: u8, domain: u16 },
    RequestTransitionNof,
    CancelTransitionNof,
    AcknowledgeLastState { property_value: i32, error: i32 },
    DeferAcknowledge,
    CancelDeferAcknowledge,
}

/// Operations of the domain manager service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerRequest {
    AddHierarchy {
        hierarchy: u8,
    },
    JoinHierarchy {
        hierarchy: u8,
    },
    RequestDomainTransition {
        domain: u16,
        target_state: i32,
        direction: TraverseDirection,
    },
    RequestSystemTransition {
        target_state: i32,
        direction: TraverseDirection,
    },
    CancelTransition,
    TransitionFailureCount,
    ObserverJoin,
    ObserverStart {
        domain: u16,
        notify: ObserveFlags,
    },
    ObserverCancel,
    ObserverNotify,
    ObservedCount,
}

/// Server sessions attach to one domain each and acknowledge its state
/// changes.
pub struct DomainServer {
    mngr: Rc<RefCell<DomainManager>>,
    nof_enable: HashMap<SessionId, Rc<Cell<bool>>>,
    control_domains: HashMap<SessionId, (Rc<RefCell<Hierarchy>>, NodeId)>,
}

impl DomainServer {
    pub fn new(mngr: Rc<RefCell<DomainManager>>) -> Self {
        Self {
            mngr,
            nof_enable: HashMap::new(),
            control_domains: HashMap::new(),
        }
    }

    fn nof_flag(&mut self, session: SessionId) -> Rc<Cell<bool>> {
        self.nof_enable.entry(session).or_default().clone()
    }

    pub fn handle(&mut self, ctx: &IpcContext, request: DomainRequest) {
        match request {
            DomainRequest::Join { hierarchy, domain } => self.join_domain(ctx, hierarchy, domain),
            DomainRequest::RequestTransitionNof => {
                self.nof_flag(ctx.session).set(true);
                ctx.complete_err(SysError::Success);
            }
            DomainRequest::CancelTransitionNof => {
                self.nof_flag(ctx.session).set(false);
                ctx.complete_err(SysError::Success);
            }
            DomainRequest::AcknowledgeLastState {
                property_value,
                error,
            } => self.acknowledge_last_state(ctx, property_value, error),
            DomainRequest::DeferAcknowledge => self.defer_acknowledge(ctx),
            DomainRequest::CancelDeferAcknowledge => self.cancel_defer_acknowledge(ctx),
        }
    }

    fn join_domain(&mut self, ctx: &IpcContext, hierarchy: u8, domain: u16) {
        let mngr = self.mngr.borrow();
        let Some(hier) = mngr.lookup_hierarchy(hierarchy) else {
            ctx.complete_err(SysError::BadHierarchyId);
            return;
        };
        let Some(node) = hier.borrow().lookup(domain) else {
            ctx.complete_err(SysError::BadDomainId);
            return;
        };
        drop(mngr);

        let nof = self.nof_flag(ctx.session);
        hier.borrow_mut().attach_session(node, ctx.session, nof);
        self.control_domains.insert(ctx.session, (hier, node));
        ctx.complete_err(SysError::Success);
    }

    fn acknowledge_last_state(&mut self, ctx: &IpcContext, property_value: i32, error: i32) {
        let Some((hier, node)) = self.control_domains.get(&ctx.session).cloned() else {
            ctx.complete_err(SysError::NotJoined);
            return;
        };
        let mut h = hier.borrow_mut();

        let matches = h.acknowledge_pending_for(ctx.session)
            && h.nodes[node.0].state_prop.get_int() == property_value;
        if !matches {
            ctx.complete_err(SysError::NotFound);
            return;
        }

        if let Some((cell, _thread)) = h.deferral_statuses.remove(&ctx.session) {
            cell.resolve(SysError::Success.code());
        }
        h.complete_acknowledge_with_err(node, error);
        h.acknowledge_pending.insert(ctx.session, false);
        ctx.complete_err(SysError::Success);
    }

    fn defer_acknowledge(&mut self, ctx: &IpcContext) {
        let Some((hier, _node)) = self.control_domains.get(&ctx.session).cloned() else {
            ctx.complete_err(SysError::NotJoined);
            return;
        };
        let mut h = hier.borrow_mut();

        if h.deferral_statuses.contains_key(&ctx.session) {
            ctx.complete_err(SysError::InUse);
            return;
        }
        if h.acknowledge_pending_for(ctx.session) {
            // Parked; resolved by a timeout quantum, an acknowledgement or a
            // cancellation.
            h.deferral_statuses
                .insert(ctx.session, (ctx.status.clone(), ctx.thread));
            return;
        }
        ctx.complete_err(SysError::NotReady);
    }

    fn cancel_defer_acknowledge(&mut self, ctx: &IpcContext) {
        let Some((hier, _node)) = self.control_domains.get(&ctx.session).cloned() else {
            ctx.complete_err(SysError::NotJoined);
            return;
        };
        let mut h = hier.borrow_mut();

        if let Some((cell, _thread)) = h.deferral_statuses.remove(&ctx.session) {
            cell.resolve(SysError::InUse.code());
        }
        ctx.complete_err(SysError::Success);
    }
}

/// Control sessions join a hierarchy and drive its transitions.
pub struct DomainManagerServer {
    mngr: Rc<RefCell<DomainManager>>,
    control_hierarchies: HashMap<SessionId, Rc<RefCell<Hierarchy>>>,
}

impl DomainManagerServer {
    pub fn new(mngr: Rc<RefCell<DomainManager>>) -> Self {
        // Manager-started marker for guests that poll before connecting.
        let props = mngr.borrow().properties().clone();
        props.define(DM_CATEGORY, DM_INIT_KEY).set_int(1);

        Self {
            mngr,
            control_hierarchies: HashMap::new(),
        }
    }

    pub fn manager(&self) -> &Rc<RefCell<DomainManager>> {
        &self.mngr
    }

    fn joined(&self, session: SessionId) -> Option<Rc<RefCell<Hierarchy>>> {
        self.control_hierarchies.get(&session).cloned()
    }

    pub fn handle(&mut self, ctx: &IpcContext, request: ManagerRequest) {
        match request {
            ManagerRequest::AddHierarchy { hierarchy } => self.add_new_hierarchy(ctx, hierarchy),
            ManagerRequest::JoinHierarchy { hierarchy } => self.join_hierarchy(ctx, hierarchy),
            ManagerRequest::RequestDomainTransition {
                domain,
                target_state,
                direction,
            } => self.request_transition(ctx, domain, target_state, direction),
            ManagerRequest::RequestSystemTransition {
                target_state,
                direction,
            } => self.request_transition(ctx, 0, target_state, direction),
            ManagerRequest::CancelTransition => self.cancel_transition(ctx),
            ManagerRequest::TransitionFailureCount => self.transition_failure_count(ctx),
            ManagerRequest::ObserverJoin => self.observer_join(ctx),
            ManagerRequest::ObserverStart { domain, notify } => {
                self.observer_start(ctx, domain, notify)
            }
            ManagerRequest::ObserverCancel => self.observer_cancel(ctx),
            ManagerRequest::ObserverNotify => self.observer_notify(ctx),
            ManagerRequest::ObservedCount => self.observed_count(ctx),
        }
    }

    fn add_new_hierarchy(&mut self, ctx: &IpcContext, hierarchy: u8) {
        let mut mngr = self.mngr.borrow_mut();
        if mngr.lookup_hierarchy(hierarchy).is_some() {
            // Adding a live hierarchy again is not an error.
            ctx.complete_err(SysError::Success);
            return;
        }
        if !mngr.add_hierarchy_from_database(hierarchy) {
            ctx.complete_err(SysError::BadHierarchyId);
            return;
        }
        ctx.complete_err(SysError::Success);
    }

    fn join_hierarchy(&mut self, ctx: &IpcContext, hierarchy: u8) {
        let Some(hier) = self.mngr.borrow().lookup_hierarchy(hierarchy) else {
            ctx.complete_err(SysError::BadHierarchyId);
            return;
        };
        {
            let mut h = hier.borrow_mut();
            if h.control_session.is_some() {
                ctx.complete_err(SysError::InUse);
                return;
            }
            h.control_session = Some(ctx.session);
        }
        self.control_hierarchies.insert(ctx.session, hier);
        ctx.complete_err(SysError::Success);
    }

    fn request_transition(
        &mut self,
        ctx: &IpcContext,
        domain: u16,
        target_state: i32,
        direction: TraverseDirection,
    ) {
        let Some(hier) = self.joined(ctx.session) else {
            ctx.complete_err(SysError::BadHierarchyId);
            return;
        };
        let started = hier.borrow_mut().transition(
            ctx.status.clone(),
            ctx.thread,
            domain,
            target_state,
            direction,
        );
        if !started {
            ctx.complete_err(SysError::BadDomainId);
        }
        // Otherwise the status is parked as the transit status and resolves
        // when the transition concludes.
    }

    fn cancel_transition(&mut self, ctx: &IpcContext) {
        let Some(hier) = self.joined(ctx.session) else {
            ctx.complete_err(SysError::BadHierarchyId);
            return;
        };
        hier.borrow_mut().cancel_request();
        ctx.complete_err(SysError::Success);
    }

    fn transition_failure_count(&mut self, ctx: &IpcContext) {
        let Some(hier) = self.joined(ctx.session) else {
            ctx.complete_err(SysError::BadHierarchyId);
            return;
        };
        let count = hier.borrow().transition_fail_count();
        ctx.complete(count as i32);
    }

    fn observer_join(&mut self, ctx: &IpcContext) {
        let Some(hier) = self.joined(ctx.session) else {
            ctx.complete_err(SysError::BadHierarchyId);
            return;
        };
        let mut h = hier.borrow_mut();
        if h.observe_session.is_some() {
            ctx.complete_err(SysError::BadSequence);
            return;
        }
        h.observe_session = Some(ctx.session);
        h.transitions.clear();
        ctx.complete_err(SysError::Success);
    }

    fn observer_start(&mut self, ctx: &IpcContext, domain: u16, notify: ObserveFlags) {
        let Some(hier) = self.joined(ctx.session) else {
            ctx.complete_err(SysError::BadHierarchyId);
            return;
        };
        let mut h = hier.borrow_mut();
        if h.observe_session != Some(ctx.session) || h.observer_started {
            ctx.complete_err(SysError::BadSequence);
            return;
        }
        let Some(node) = h.lookup(domain) else {
            ctx.complete_err(SysError::BadDomainId);
            return;
        };

        h.observe_type = notify;
        h.observer_started = true;
        h.set_observe(node, true);
        h.observed_domain = Some(node);
        ctx.complete_err(SysError::Success);
    }

    fn observer_cancel(&mut self, ctx: &IpcContext) {
        let Some(hier) = self.joined(ctx.session) else {
            ctx.complete_err(SysError::BadHierarchyId);
            return;
        };
        let mut h = hier.borrow_mut();
        if h.observe_session.is_none() {
            ctx.complete_err(SysError::BadSequence);
            return;
        }
        if h.observer_started {
            h.observer_started = false;
            if let Some(node) = h.observed_domain.take() {
                h.set_observe(node, false);
            }
        }
        ctx.complete_err(SysError::Success);
    }

    fn observer_notify(&mut self, ctx: &IpcContext) {
        let Some(hier) = self.joined(ctx.session) else {
            ctx.complete_err(SysError::BadHierarchyId);
            return;
        };
        let mut h = hier.borrow_mut();
        if h.observe_session != Some(ctx.session) || !h.observer_started {
            ctx.complete_err(SysError::BadSequence);
            return;
        }
        if !h.transitions.is_empty() {
            // Undelivered events already waiting.
            ctx.complete_err(SysError::Success);
            return;
        }
        h.observe_status = Some((ctx.status.clone(), ctx.thread));
    }

    fn observed_count(&mut self, ctx: &IpcContext) {
        let Some(hier) = self.joined(ctx.session) else {
            ctx.complete_err(SysError::BadHierarchyId);
            return;
        };
        let h = hier.borrow();
        if h.observe_session != Some(ctx.session) || !h.observer_started {
            ctx.complete_err(SysError::BadSequence);
            return;
        }
        ctx.complete(h.observed_children());
    }
}
