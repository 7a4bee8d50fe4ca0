pub mod bus;
pub mod events;

pub use bus::{EventBus, EventHandler, HandlerFuture, SubscriptionHandle};
pub use events::{DomainEvent, QueueEventType};
