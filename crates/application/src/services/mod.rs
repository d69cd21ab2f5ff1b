mod calls;
mod gateway;

pub use calls::{CallCoordinator, CallCoordinatorDependencies};
pub use gateway::{
    CreateMessageRequest, GatewayLimits, MessageDestination, PersistenceGateway,
    PersistenceGatewayDependencies, StoredMessage,
};
