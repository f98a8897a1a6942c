//! Domain tree and the transition state machine.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use bitflags::bitflags;
use ember_ipc::{ClientThread, SessionId, StatusCell, SysError};
use ember_props::{Property, PropertyStore};
use ember_time::{EventType, Timing};
use tracing::{error, warn};

use crate::database::{DatabaseError, HierarchyRecord};
use crate::{make_state_domain_key, make_state_domain_value, DM_CATEGORY};

bitflags! {
    /// Which transition outcomes an observer wants to hear about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObserveFlags: u32 {
        const PASS = 1 << 0;
        const FAIL = 1 << 1;
        const TRANS_REQUEST = 1 << 2;
    }
}

/// Tree traversal order of a transition.
///
/// As a *request argument*, `ParentFirst` means "pick automatically from the
/// hierarchy policy by comparing the target state to the current one"; the
/// policy's own directions are concrete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraverseDirection {
    ParentFirst,
    ChildrenFirst,
}

/// What the hierarchy does when one domain fails to transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPolicy {
    Stop,
    Continue,
}

/// Arena handle of a domain node within its hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

/// Observer log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionEvent {
    pub domain: u16,
    pub previous_state: i32,
    pub error: i32,
}

/// Per-hierarchy failure record of the current transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionFailure {
    pub domain: u16,
    pub error: i32,
}

pub(crate) struct AttachedSession {
    pub(crate) session: SessionId,
    /// Transition-notification flag, shared with the domain server.
    pub(crate) nof: Rc<Cell<bool>>,
}

/// One node of the domain tree.
pub(crate) struct Domain {
    pub(crate) id: u16,
    pub(crate) parent: Option<NodeId>,
    pub(crate) peer: Option<NodeId>,
    pub(crate) child: Option<NodeId>,
    pub(crate) child_count: u32,
    /// Outstanding member acknowledgements, or outstanding child subtrees
    /// while a children phase runs. The phases never overlap on one node.
    pub(crate) transition_count: u32,
    pub(crate) state: i32,
    pub(crate) previous_state: i32,
    pub(crate) observed: bool,
    pub(crate) attached: Vec<AttachedSession>,
    pub(crate) trans_timeout_event: EventType,
    pub(crate) state_prop: Rc<Property>,
}

/// A rooted tree of domains with a single in-flight transition.
pub struct Hierarchy {
    pub(crate) id: u8,
    timing: Rc<Timing>,
    pub(crate) nodes: Vec<Domain>,
    root: NodeId,

    positive_dir: TraverseDirection,
    negative_dir: TraverseDirection,
    pub(crate) fail_policy: FailPolicy,
    trans_timeout: u64,

    traverse_dir: TraverseDirection,
    transition_id: u32,
    trans_state: i32,
    transition_prop_value: i32,
    pub(crate) trans_domain: Option<NodeId>,

    pub(crate) trans_status: Option<(StatusCell, ClientThread)>,
    pub(crate) observe_status: Option<(StatusCell, ClientThread)>,

    pub(crate) control_session: Option<SessionId>,
    pub(crate) observe_session: Option<SessionId>,
    pub(crate) observed_domain: Option<NodeId>,
    pub(crate) observe_type: ObserveFlags,
    pub(crate) observer_started: bool,
    pub(crate) observed_children: i32,

    pub(crate) acknowledge_pending: HashMap<SessionId, bool>,
    pub(crate) deferral_statuses: HashMap<SessionId, (StatusCell, ClientThread)>,

    pub(crate) transitions: Vec<TransitionEvent>,
    pub(crate) transitions_fail: Vec<TransitionFailure>,
}

impl Hierarchy {
    /// Builds a hierarchy from a database record: sentinel root (id 0) plus
    /// one node per record domain, linked in record order.
    pub(crate) fn from_record(
        record: &HierarchyRecord,
        timing: &Rc<Timing>,
        props: &Rc<PropertyStore>,
    ) -> Result<Rc<RefCell<Hierarchy>>, DatabaseError> {
        record.validate()?;

        let hier = Rc::new(RefCell::new(Hierarchy {
            id: record.id,
            timing: timing.clone(),
            nodes: Vec::with_capacity(record.domains.len() + 1),
            root: NodeId(0),
            positive_dir: record.positive_dir,
            negative_dir: record.negative_dir,
            fail_policy: record.fail_policy,
            trans_timeout: record.trans_timeout_ticks,
            traverse_dir: record.positive_dir,
            transition_id: 0,
            trans_state: 0,
            transition_prop_value: 0,
            trans_domain: None,
            trans_status: None,
            observe_status: None,
            control_session: None,
            observe_session: None,
            observed_domain: None,
            observe_type: ObserveFlags::empty(),
            observer_started: false,
            observed_children: 0,
            acknowledge_pending: HashMap::new(),
            deferral_statuses: HashMap::new(),
            transitions: Vec::new(),
            transitions_fail: Vec::new(),
        }));

        Self::add_node(&hier, timing, props, 0, 0, 0);
        for dom in record.domains {
            Self::add_node(&hier, timing, props, dom.id, dom.parent, dom.init_state);
        }
        Ok(hier)
    }

    fn add_node(
        hier: &Rc<RefCell<Hierarchy>>,
        timing: &Rc<Timing>,
        props: &Rc<PropertyStore>,
        id: u16,
        parent_id: u16,
        init_state: i32,
    ) {
        let hier_id = hier.borrow().id;

        let event = {
            let weak: Weak<RefCell<Hierarchy>> = Rc::downgrade(hier);
            timing.register_event(
                &format!("hier{hier_id}_trans_timeout_domain{id}"),
                Box::new(move |payload, ticks_late| {
                    if let Some(h) = weak.upgrade() {
                        h.borrow_mut()
                            .transition_timeout(NodeId(payload as usize), ticks_late);
                    }
                }),
            )
        };

        let prop = props.define(DM_CATEGORY, make_state_domain_key(hier_id as u32, id as u32));
        prop.set_int(make_state_domain_value(0, init_state));

        let mut h = hier.borrow_mut();
        let node = NodeId(h.nodes.len());
        let parent = if node.0 == 0 {
            None
        } else {
            Some(h.lookup(parent_id).expect("record validated"))
        };

        h.nodes.push(Domain {
            id,
            parent,
            peer: None,
            child: None,
            child_count: 0,
            transition_count: 0,
            state: init_state,
            previous_state: init_state,
            observed: false,
            attached: Vec::new(),
            trans_timeout_event: event,
            state_prop: prop,
        });

        if let Some(p) = parent {
            // Append to the sibling tail so traversal follows record order.
            match h.nodes[p.0].child {
                None => h.nodes[p.0].child = Some(node),
                Some(first) => {
                    let mut tail = first;
                    while let Some(next) = h.nodes[tail.0].peer {
                        tail = next;
                    }
                    h.nodes[tail.0].peer = Some(node);
                }
            }
            h.nodes[p.0].child_count += 1;
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    /// Resolves a guest-visible domain id. Id 0 is the sentinel root.
    pub fn lookup(&self, domain_id: u16) -> Option<NodeId> {
        if domain_id == 0 {
            return self.nodes.first().map(|_| self.root);
        }
        self.nodes
            .iter()
            .position(|d| d.id == domain_id)
            .map(NodeId)
    }

    pub fn domain_id(&self, node: NodeId) -> u16 {
        self.nodes[node.0].id
    }

    pub fn domain_state(&self, node: NodeId) -> i32 {
        self.nodes[node.0].state
    }

    pub fn child_count(&self, node: NodeId) -> u32 {
        self.nodes[node.0].child_count
    }

    /// Children of `node` in sibling-list order.
    pub fn children(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut next = self.nodes[node.0].child;
        while let Some(c) = next {
            out.push(c);
            next = self.nodes[c.0].peer;
        }
        out
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn observed_children(&self) -> i32 {
        self.observed_children
    }

    pub fn transition_fail_count(&self) -> usize {
        self.transitions_fail.len()
    }

    pub fn transition_failures(&self) -> &[TransitionFailure] {
        &self.transitions_fail
    }

    /// Drains the observer event log.
    pub fn take_transition_events(&mut self) -> Vec<TransitionEvent> {
        std::mem::take(&mut self.transitions)
    }

    pub fn acknowledge_pending_for(&self, session: SessionId) -> bool {
        self.acknowledge_pending
            .get(&session)
            .copied()
            .unwrap_or(false)
    }

    pub(crate) fn attach_session(&mut self, node: NodeId, session: SessionId, nof: Rc<Cell<bool>>) {
        self.nodes[node.0].attached.push(AttachedSession { session, nof });
    }

    /// Starts a transition of the subtree rooted at `domain_id` towards
    /// `target_state`.
    ///
    /// Returns `false` when the domain id does not resolve; the caller
    /// reports the bad id. Otherwise the transit status is parked and
    /// resolved when the transition concludes.
    pub fn transition(
        &mut self,
        status: StatusCell,
        thread: ClientThread,
        domain_id: u16,
        target_state: i32,
        dir: TraverseDirection,
    ) -> bool {
        let Some(target) = self.lookup(domain_id) else {
            return false;
        };

        self.trans_domain = Some(target);
        self.set_state(target_state, dir);
        self.trans_status = Some((status, thread));
        self.transitions_fail.clear();
        self.transition_id = self.transition_id.wrapping_add(1);
        self.transition_prop_value =
            make_state_domain_value(self.transition_id, self.trans_state);

        self.do_domain_transition(target);
        true
    }

    /// Picks the traversal direction and records the target state.
    ///
    /// `ParentFirst` as the requested direction means "auto": ascend with the
    /// policy's positive direction when the target state is not below the
    /// subroot's current state, descend with the negative one otherwise.
    fn set_state(&mut self, next_state: i32, dir: TraverseDirection) {
        self.traverse_dir = match dir {
            TraverseDirection::ParentFirst => {
                let current = self
                    .trans_domain
                    .map(|n| self.nodes[n.0].state)
                    .unwrap_or(0);
                if next_state >= current {
                    self.positive_dir
                } else {
                    self.negative_dir
                }
            }
            TraverseDirection::ChildrenFirst => TraverseDirection::ChildrenFirst,
        };
        self.trans_state = next_state;
    }

    fn do_domain_transition(&mut self, node: NodeId) {
        match self.traverse_dir {
            TraverseDirection::ChildrenFirst => self.do_children_transition(node),
            TraverseDirection::ParentFirst => self.do_members_transition(node),
        }
    }

    /// Requests a transition from every child subtree of `node`.
    ///
    /// The node's outstanding count tracks unfinished child subtrees; with no
    /// children the phase completes immediately.
    fn do_children_transition(&mut self, node: NodeId) {
        let count = self.nodes[node.0].child_count;
        if count == 0 {
            self.complete_children_transition(node);
            return;
        }

        self.nodes[node.0].transition_count = count;
        let mut next = self.nodes[node.0].child;
        while let Some(child) = next {
            next = self.nodes[child.0].peer;
            self.do_domain_transition(child);
        }
    }

    /// Solicits acknowledgements from the node's attached sessions and
    /// publishes the node's new state.
    fn do_members_transition(&mut self, node: NodeId) {
        let previous = self.nodes[node.0].state_prop.get_int() & 0x00FF_FFFF;

        let mut soliciting = Vec::new();
        for attached in &self.nodes[node.0].attached {
            if attached.nof.get() {
                attached.nof.set(false);
                soliciting.push(attached.session);
            }
        }
        for session in &soliciting {
            self.acknowledge_pending.insert(*session, true);
        }
        self.nodes[node.0].transition_count = soliciting.len() as u32;

        if self.nodes[node.0].observed && self.observe_type.contains(ObserveFlags::TRANS_REQUEST) {
            self.add_transition(self.nodes[node.0].id, previous, SysError::Outstanding.code());
            if self.is_observe_nof_outstanding() {
                self.finish_observe_request(SysError::Success.code());
            }
        }

        // Publish before soliciting: the acknowledging side reads the
        // property value back to us.
        self.nodes[node.0].previous_state = previous;
        self.nodes[node.0].state = self.trans_state;
        self.nodes[node.0]
            .state_prop
            .set_int(self.transition_prop_value);

        if self.nodes[node.0].transition_count > 0 {
            self.timing.schedule_event(
                self.trans_timeout,
                self.nodes[node.0].trans_timeout_event,
                node.0 as u64,
            );
        } else {
            self.complete_members_transition(node);
        }
    }

    fn complete_members_transition(&mut self, node: NodeId) {
        match self.traverse_dir {
            // Members ran last; this subtree is done.
            TraverseDirection::ChildrenFirst => self.complete_domain_transition(node),
            // Members ran first; descend.
            TraverseDirection::ParentFirst => self.do_children_transition(node),
        }
    }

    fn complete_children_transition(&mut self, node: NodeId) {
        match self.traverse_dir {
            TraverseDirection::ChildrenFirst => self.do_members_transition(node),
            TraverseDirection::ParentFirst => self.complete_domain_transition(node),
        }
    }

    fn complete_domain_transition(&mut self, node: NodeId) {
        if Some(node) == self.trans_domain {
            let err = self
                .transitions_fail
                .first()
                .map(|f| f.error)
                .unwrap_or(SysError::Success.code());
            self.cancel_transition(node);
            self.finish_trans_request(err);
        } else if let Some(parent) = self.nodes[node.0].parent {
            debug_assert!(self.nodes[parent.0].transition_count > 0);
            self.nodes[parent.0].transition_count -= 1;
            if self.nodes[parent.0].transition_count == 0 {
                self.complete_children_transition(parent);
            }
        }
    }

    /// Applies one member acknowledgement carrying `err` to `node`.
    pub fn complete_acknowledge_with_err(&mut self, node: NodeId, err: i32) {
        let id = self.nodes[node.0].id;
        let previous = self.nodes[node.0].previous_state;

        if err != SysError::Success.code() {
            self.add_transition_failure(id, err);

            if self.nodes[node.0].observed && self.observe_type.contains(ObserveFlags::FAIL) {
                self.add_transition(id, previous, err);
                if self.is_observe_nof_outstanding() {
                    self.finish_observe_request(SysError::Success.code());
                }
            }

            if self.fail_policy == FailPolicy::Stop {
                error!(
                    hierarchy = self.id,
                    domain = id,
                    error = err,
                    "domain transition failed, stopping per failure policy"
                );
                self.finish_trans_request(err);
                if let Some(target) = self.trans_domain {
                    self.cancel_transition(target);
                }
                return;
            }
        } else if self.nodes[node.0].observed && self.observe_type.contains(ObserveFlags::PASS) {
            self.add_transition(id, previous, err);
            if self.is_observe_nof_outstanding() {
                self.finish_observe_request(SysError::Success.code());
            }
        }

        debug_assert!(self.nodes[node.0].transition_count > 0);
        self.nodes[node.0].transition_count -= 1;
        if self.nodes[node.0].transition_count == 0 {
            self.timing
                .unschedule_event(self.nodes[node.0].trans_timeout_event, node.0 as u64);
            self.complete_members_transition(node);
        }
    }

    /// Fired when a member phase outlives its acknowledgement window.
    ///
    /// Live deferrals buy one more quantum: every deferral cell resolves
    /// success, the set clears, and the timeout is rescheduled. Without
    /// deferrals the node is recorded as timed out; the Stop policy ends the
    /// whole transition, Continue advances past the node.
    pub fn transition_timeout(&mut self, node: NodeId, _ticks_late: i64) {
        if !self.deferral_statuses.is_empty() {
            self.timing.schedule_event(
                self.trans_timeout,
                self.nodes[node.0].trans_timeout_event,
                node.0 as u64,
            );
            for (_, (cell, _thread)) in self.deferral_statuses.drain() {
                cell.resolve(SysError::Success.code());
            }
            return;
        }

        let id = self.nodes[node.0].id;
        self.add_transition_failure(id, SysError::TimedOut.code());

        if self.fail_policy == FailPolicy::Stop {
            error!(
                hierarchy = self.id,
                domain = id,
                "transition timed out, stopping per failure policy"
            );
            self.finish_trans_request(SysError::TimedOut.code());
            self.cancel_transition(node);
            return;
        }

        if self.nodes[node.0].transition_count > 0 {
            for pending in self.acknowledge_pending.values_mut() {
                *pending = false;
            }
            self.nodes[node.0].transition_count = 0;
            self.complete_members_transition(node);
        }
    }

    /// Recursively abandons the in-flight transition below `node`: child
    /// subtrees first, then every parked deferral resolves `Cancel` and the
    /// pending bookkeeping clears.
    fn cancel_transition(&mut self, node: NodeId) {
        let mut next = self.nodes[node.0].child;
        while let Some(child) = next {
            next = self.nodes[child.0].peer;
            self.cancel_transition(child);
        }

        for (_, (cell, _thread)) in self.deferral_statuses.drain() {
            cell.resolve(SysError::Cancel.code());
        }
        for pending in self.acknowledge_pending.values_mut() {
            *pending = false;
        }
        self.nodes[node.0].transition_count = 0;
        self.timing
            .unschedule_event(self.nodes[node.0].trans_timeout_event, node.0 as u64);
    }

    /// Cancels the in-flight transition on behalf of the control session:
    /// transit and observer statuses resolve `Cancel`, the subtree's
    /// bookkeeping and observed flags clear.
    pub fn cancel_request(&mut self) {
        if let Some((cell, _thread)) = self.trans_status.take() {
            cell.resolve(SysError::Cancel.code());
        }
        if self.observer_started {
            if let Some((cell, _thread)) = self.observe_status.take() {
                cell.resolve(SysError::Cancel.code());
            }
        }
        if let Some(target) = self.trans_domain {
            self.cancel_transition(target);
            if self.nodes[target.0].observed {
                self.set_observe(target, false);
            }
        }
    }

    /// Toggles observation over the whole subtree rooted at `node`,
    /// maintaining the hierarchy's observed-node count. Idempotent per node.
    pub fn set_observe(&mut self, node: NodeId, observe: bool) {
        if self.nodes[node.0].observed != observe {
            self.nodes[node.0].observed = observe;
            self.observed_children += if observe { 1 } else { -1 };
        }

        let mut next = self.nodes[node.0].child;
        while let Some(child) = next {
            next = self.nodes[child.0].peer;
            self.set_observe(child, observe);
        }
    }

    pub(crate) fn is_observe_nof_outstanding(&self) -> bool {
        self.observe_status.is_some()
    }

    pub(crate) fn finish_observe_request(&mut self, code: i32) {
        if let Some((cell, _thread)) = self.observe_status.take() {
            cell.resolve(code);
        }
    }

    fn finish_trans_request(&mut self, code: i32) {
        if let Some((cell, _thread)) = self.trans_status.take() {
            cell.resolve(code);
        }
    }

    fn add_transition(&mut self, domain: u16, previous_state: i32, error: i32) {
        self.transitions.push(TransitionEvent {
            domain,
            previous_state,
            error,
        });
    }

    fn add_transition_failure(&mut self, domain: u16, error: i32) {
        warn!(
            hierarchy = self.id,
            domain, error, "recording domain transition failure"
        );
        self.transitions_fail.push(TransitionFailure { domain, error });
    }
}

impl Drop for Hierarchy {
    fn drop(&mut self) {
        // Release pending timer registrations held by the domains.
        for (index, node) in self.nodes.iter().enumerate() {
            self.timing
                .unschedule_event(node.trans_timeout_event, index as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{DomainRecord, HierarchyRecord};

    static DOMAINS: &[DomainRecord] = &[
        DomainRecord { id: 1, parent: 0, init_state: 0 },
        DomainRecord { id: 2, parent: 1, init_state: 0 },
        DomainRecord { id: 3, parent: 1, init_state: 0 },
        DomainRecord { id: 4, parent: 2, init_state: 0 },
    ];

    fn record() -> HierarchyRecord {
        HierarchyRecord {
            id: 9,
            positive_dir: TraverseDirection::ParentFirst,
            negative_dir: TraverseDirection::ChildrenFirst,
            fail_policy: FailPolicy::Continue,
            trans_timeout_ticks: 100,
            domains: DOMAINS,
        }
    }

    fn build() -> Rc<RefCell<Hierarchy>> {
        let timing = Rc::new(Timing::new());
        let props = Rc::new(PropertyStore::new());
        Hierarchy::from_record(&record(), &timing, &props).unwrap()
    }

    #[test]
    fn child_count_matches_sibling_chain_everywhere() {
        let hier = build();
        let h = hier.borrow();
        for index in 0..h.node_count() {
            let node = NodeId(index);
            assert_eq!(
                h.child_count(node) as usize,
                h.children(node).len(),
                "domain {}",
                h.domain_id(node)
            );
        }
    }

    #[test]
    fn children_link_in_record_order() {
        let hier = build();
        let h = hier.borrow();
        let root = h.lookup(0).unwrap();
        let top = h.children(root);
        assert_eq!(top.len(), 1);

        let dom1 = h.lookup(1).unwrap();
        let ids: Vec<u16> = h.children(dom1).iter().map(|&n| h.domain_id(n)).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn lookup_resolves_ids_anywhere_in_the_tree() {
        let hier = build();
        let h = hier.borrow();
        assert_eq!(h.domain_id(h.lookup(4).unwrap()), 4);
        assert_eq!(h.domain_id(h.lookup(0).unwrap()), 0);
        assert!(h.lookup(0x99).is_none());
    }

    #[test]
    fn observe_toggles_the_whole_subtree_once() {
        let hier = build();
        let mut h = hier.borrow_mut();
        let dom1 = h.lookup(1).unwrap();

        h.set_observe(dom1, true);
        assert_eq!(h.observed_children(), 4);

        // Idempotent: flags already set, count unchanged.
        h.set_observe(dom1, true);
        assert_eq!(h.observed_children(), 4);

        h.set_observe(dom1, false);
        assert_eq!(h.observed_children(), 0);
    }
}
