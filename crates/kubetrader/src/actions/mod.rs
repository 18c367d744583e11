pub mod move_pod;
pub mod pod_mover;
pub mod registry;
pub mod resolver;
pub mod resize;
pub mod scale;
pub mod types;
pub mod workload;

pub use move_pod::MoveExecutor;
pub use move_pod::SccAllowSet;
pub use registry::run_dispatcher;
pub use registry::ActionExecutor;
pub use registry::ExecutorRegistry;
pub use resize::ResizeExecutor;
pub use resize::ResizeResource;
pub use resolver::NodeResolver;
pub use resolver::ResolvedNode;
pub use scale::ScaleDirection;
pub use scale::ScaleExecutor;
pub use types::ActionError;
pub use types::ActionItem;
pub use types::ActionOutcome;
pub use types::ActionSuccess;
pub use types::ActionType;
pub use types::EntityDescriptor;
