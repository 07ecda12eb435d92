pub mod active_model;
pub mod chats;
pub mod messages;

pub use active_model::ActiveModelStore;
pub use chats::ChatsStore;
pub use messages::MessagesStore;
