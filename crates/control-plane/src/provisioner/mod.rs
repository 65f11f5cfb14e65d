//! Credential and capability provisioning for worker identities.

mod grant;

pub use grant::{
    callback_resource, grant_for, CapabilityGrant, GrantStatement, ProvisionError,
    GET_SECRET_VALUE, PUT_OBJECT, SEND_TASK_FAILURE, SEND_TASK_HEARTBEAT, SEND_TASK_SUCCESS,
};
