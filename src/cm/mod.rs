//! Connection-manager glue: the singleton event channel, per-connection
//! event queues, the cancellable fd poller, and the identifier wrapper.

pub(crate) mod events;
mod id;
mod poller;

pub(crate) use id::CmId;
pub(crate) use poller::FdPoller;
