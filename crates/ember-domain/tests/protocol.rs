//! Request-handler contracts: registration, joining, cancellation and the
//! protocol error paths.

mod common;

use common::{completed, Rig};

use ember_domain::database::POWER_HIERARCHY_ID;
use ember_domain::{
    make_state_domain_key, DomainRequest, ManagerRequest, TraverseDirection, DM_CATEGORY,
    DM_INIT_KEY,
};
use ember_ipc::SysError;
use pretty_assertions::assert_eq;

const CTRL: u64 = 100;
const OTHER_CTRL: u64 = 101;
const MEMBER: u64 = 1;

#[test]
fn manager_startup_publishes_the_init_property() {
    let rig = Rig::new();
    let prop = rig.props.get(DM_CATEGORY, DM_INIT_KEY).expect("defined");
    assert_eq!(prop.get_int(), 1);
}

#[test]
fn adding_a_hierarchy_is_idempotent() {
    let mut rig = Rig::new();
    let ctx = rig.manager_req(
        CTRL,
        ManagerRequest::AddHierarchy {
            hierarchy: POWER_HIERARCHY_ID,
        },
    );
    assert_eq!(completed(&ctx), SysError::Success.code());

    // Adding again is silently fine.
    let ctx = rig.manager_req(
        CTRL,
        ManagerRequest::AddHierarchy {
            hierarchy: POWER_HIERARCHY_ID,
        },
    );
    assert_eq!(completed(&ctx), SysError::Success.code());

    let ctx = rig.manager_req(CTRL, ManagerRequest::AddHierarchy { hierarchy: 0x55 });
    assert_eq!(completed(&ctx), SysError::BadHierarchyId.code());
}

#[test]
fn exactly_one_control_session_per_hierarchy() {
    let mut rig = Rig::new();
    rig.manager_req(
        CTRL,
        ManagerRequest::AddHierarchy {
            hierarchy: POWER_HIERARCHY_ID,
        },
    );

    let ctx = rig.manager_req(
        CTRL,
        ManagerRequest::JoinHierarchy {
            hierarchy: POWER_HIERARCHY_ID,
        },
    );
    assert_eq!(completed(&ctx), SysError::Success.code());

    let ctx = rig.manager_req(
        OTHER_CTRL,
        ManagerRequest::JoinHierarchy {
            hierarchy: POWER_HIERARCHY_ID,
        },
    );
    assert_eq!(completed(&ctx), SysError::InUse.code());

    let ctx = rig.manager_req(CTRL, ManagerRequest::JoinHierarchy { hierarchy: 0x55 });
    assert_eq!(completed(&ctx), SysError::BadHierarchyId.code());
}

#[test]
fn joining_domains_validates_both_ids() {
    let mut rig = Rig::new();
    rig.manager_req(
        CTRL,
        ManagerRequest::AddHierarchy {
            hierarchy: POWER_HIERARCHY_ID,
        },
    );

    let ctx = rig.domain_req(
        MEMBER,
        DomainRequest::Join {
            hierarchy: 0x55,
            domain: 1,
        },
    );
    assert_eq!(completed(&ctx), SysError::BadHierarchyId.code());

    let ctx = rig.domain_req(
        MEMBER,
        DomainRequest::Join {
            hierarchy: POWER_HIERARCHY_ID,
            domain: 0x7777,
        },
    );
    assert_eq!(completed(&ctx), SysError::BadDomainId.code());

    let ctx = rig.domain_req(
        MEMBER,
        DomainRequest::Join {
            hierarchy: POWER_HIERARCHY_ID,
            domain: 2,
        },
    );
    assert_eq!(completed(&ctx), SysError::Success.code());
}

#[test]
fn acknowledging_without_joining_is_rejected() {
    let mut rig = Rig::new();
    let ctx = rig.domain_req(
        MEMBER,
        DomainRequest::AcknowledgeLastState {
            property_value: 0,
            error: 0,
        },
    );
    assert_eq!(completed(&ctx), SysError::NotJoined.code());
}

#[test]
fn acknowledging_a_stale_property_value_is_not_found() {
    let mut rig = Rig::new();
    rig.manager_req(
        CTRL,
        ManagerRequest::AddHierarchy {
            hierarchy: POWER_HIERARCHY_ID,
        },
    );
    rig.manager_req(
        CTRL,
        ManagerRequest::JoinHierarchy {
            hierarchy: POWER_HIERARCHY_ID,
        },
    );
    rig.join_member(MEMBER, POWER_HIERARCHY_ID, 2);

    // Nothing pending at all.
    let ctx = rig.acknowledge(MEMBER, POWER_HIERARCHY_ID, 2, SysError::Success);
    assert_eq!(completed(&ctx), SysError::NotFound.code());

    let trans = rig.manager_req(
        CTRL,
        ManagerRequest::RequestDomainTransition {
            domain: 2,
            target_state: 2,
            direction: TraverseDirection::ParentFirst,
        },
    );
    assert!(trans.status.is_pending());

    // Pending, but a stale property value does not match.
    let stale = rig.prop_value(POWER_HIERARCHY_ID, 2) ^ 1;
    let ctx = rig.domain_req(
        MEMBER,
        DomainRequest::AcknowledgeLastState {
            property_value: stale,
            error: 0,
        },
    );
    assert_eq!(completed(&ctx), SysError::NotFound.code());

    let ctx = rig.acknowledge(MEMBER, POWER_HIERARCHY_ID, 2, SysError::Success);
    assert_eq!(completed(&ctx), SysError::Success.code());
    assert_eq!(completed(&trans), SysError::Success.code());
}

#[test]
fn transitions_require_a_joined_hierarchy() {
    let mut rig = Rig::new();
    let ctx = rig.manager_req(
        CTRL,
        ManagerRequest::RequestDomainTransition {
            domain: 1,
            target_state: 1,
            direction: TraverseDirection::ParentFirst,
        },
    );
    assert_eq!(completed(&ctx), SysError::BadHierarchyId.code());
}

#[test]
fn transitions_reject_unknown_domains() {
    let mut rig = Rig::new();
    rig.manager_req(
        CTRL,
        ManagerRequest::AddHierarchy {
            hierarchy: POWER_HIERARCHY_ID,
        },
    );
    rig.manager_req(
        CTRL,
        ManagerRequest::JoinHierarchy {
            hierarchy: POWER_HIERARCHY_ID,
        },
    );

    let ctx = rig.manager_req(
        CTRL,
        ManagerRequest::RequestDomainTransition {
            domain: 0x4444,
            target_state: 1,
            direction: TraverseDirection::ParentFirst,
        },
    );
    assert_eq!(completed(&ctx), SysError::BadDomainId.code());
}

#[test]
fn cancelling_resolves_transit_and_deferral_cells() {
    let mut rig = Rig::new();
    rig.manager_req(
        CTRL,
        ManagerRequest::AddHierarchy {
            hierarchy: POWER_HIERARCHY_ID,
        },
    );
    rig.manager_req(
        CTRL,
        ManagerRequest::JoinHierarchy {
            hierarchy: POWER_HIERARCHY_ID,
        },
    );
    rig.join_member(MEMBER, POWER_HIERARCHY_ID, 2);

    let trans = rig.manager_req(
        CTRL,
        ManagerRequest::RequestDomainTransition {
            domain: 2,
            target_state: 2,
            direction: TraverseDirection::ParentFirst,
        },
    );
    assert!(trans.status.is_pending());

    let deferral = rig.domain_req(MEMBER, DomainRequest::DeferAcknowledge);
    assert!(deferral.status.is_pending());

    let cancel = rig.manager_req(CTRL, ManagerRequest::CancelTransition);
    assert_eq!(completed(&cancel), SysError::Success.code());
    assert_eq!(completed(&trans), SysError::Cancel.code());
    assert_eq!(completed(&deferral), SysError::Cancel.code());

    let count = rig.manager_req(CTRL, ManagerRequest::TransitionFailureCount);
    assert_eq!(completed(&count), 0);
}

#[test]
fn notification_flags_can_be_disarmed() {
    let mut rig = Rig::new();
    rig.manager_req(
        CTRL,
        ManagerRequest::AddHierarchy {
            hierarchy: POWER_HIERARCHY_ID,
        },
    );
    rig.manager_req(
        CTRL,
        ManagerRequest::JoinHierarchy {
            hierarchy: POWER_HIERARCHY_ID,
        },
    );
    rig.join_member(MEMBER, POWER_HIERARCHY_ID, 2);

    // Disarm again before any transition.
    let ctx = rig.domain_req(MEMBER, DomainRequest::CancelTransitionNof);
    assert_eq!(completed(&ctx), SysError::Success.code());

    // With no armed member, the transition completes synchronously.
    let trans = rig.manager_req(
        CTRL,
        ManagerRequest::RequestDomainTransition {
            domain: 2,
            target_state: 2,
            direction: TraverseDirection::ParentFirst,
        },
    );
    assert_eq!(completed(&trans), SysError::Success.code());
}

#[test]
fn state_property_keys_follow_the_documented_formula() {
    let rig = {
        let mut rig = Rig::new();
        rig.manager_req(
            CTRL,
            ManagerRequest::AddHierarchy {
                hierarchy: POWER_HIERARCHY_ID,
            },
        );
        rig
    };

    for domain in [0u16, 1, 2, 3] {
        let key = make_state_domain_key(POWER_HIERARCHY_ID as u32, domain as u32);
        assert!(
            rig.props.get(DM_CATEGORY, key).is_some(),
            "missing state property for domain {domain}"
        );
    }
}
