//! Shared test rig: timing, property store, manager and both servers wired
//! the way the emulator boots them.

// Each integration test binary uses a different subset of the rig.
#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use ember_domain::database::HierarchyRecord;
use ember_domain::{
    make_state_domain_key, DomainManager, DomainManagerServer, DomainRequest, DomainServer,
    ManagerRequest, DM_CATEGORY,
};
use ember_ipc::{ClientThread, IpcContext, SessionId, SysError};
use ember_props::PropertyStore;
use ember_time::Timing;

pub struct Rig {
    pub timing: Rc<Timing>,
    pub props: Rc<PropertyStore>,
    pub mngr: Rc<RefCell<DomainManager>>,
    pub manager_server: DomainManagerServer,
    pub domain_server: DomainServer,
}

impl Rig {
    pub fn new() -> Self {
        let timing = Rc::new(Timing::new());
        let props = Rc::new(PropertyStore::new());
        let mngr = Rc::new(RefCell::new(DomainManager::new(
            timing.clone(),
            props.clone(),
        )));
        let manager_server = DomainManagerServer::new(mngr.clone());
        let domain_server = DomainServer::new(mngr.clone());
        Self {
            timing,
            props,
            mngr,
            manager_server,
            domain_server,
        }
    }

    /// Registers a custom hierarchy record, bypassing the built-in database.
    pub fn with_record(record: &HierarchyRecord) -> Self {
        let rig = Self::new();
        assert!(rig.mngr.borrow_mut().add_hierarchy(record));
        rig
    }

    pub fn manager_req(&mut self, session: SessionId, request: ManagerRequest) -> IpcContext {
        let ctx = IpcContext::new(session, ClientThread(session));
        self.manager_server.handle(&ctx, request);
        ctx
    }

    pub fn domain_req(&mut self, session: SessionId, request: DomainRequest) -> IpcContext {
        let ctx = IpcContext::new(session, ClientThread(session));
        self.domain_server.handle(&ctx, request);
        ctx
    }

    /// Joins `session` to a domain and enables its transition notification.
    pub fn join_member(&mut self, session: SessionId, hierarchy: u8, domain: u16) {
        let ctx = self.domain_req(session, DomainRequest::Join { hierarchy, domain });
        assert_eq!(ctx.status.value(), Some(SysError::Success.code()));
        let ctx = self.domain_req(session, DomainRequest::RequestTransitionNof);
        assert_eq!(ctx.status.value(), Some(SysError::Success.code()));
    }

    pub fn prop_value(&self, hierarchy: u8, domain: u16) -> i32 {
        self.props
            .get(
                DM_CATEGORY,
                make_state_domain_key(hierarchy as u32, domain as u32),
            )
            .expect("state property defined at construction")
            .get_int()
    }

    /// Acknowledges the current state of `domain` with `error`.
    pub fn acknowledge(
        &mut self,
        session: SessionId,
        hierarchy: u8,
        domain: u16,
        error: SysError,
    ) -> IpcContext {
        let property_value = self.prop_value(hierarchy, domain);
        self.domain_req(
            session,
            DomainRequest::AcknowledgeLastState {
                property_value,
                error: error.code(),
            },
        )
    }
}

/// Completion code of a context, panicking while it is still pending.
pub fn completed(ctx: &IpcContext) -> i32 {
    ctx.status.value().expect("request should have completed")
}
