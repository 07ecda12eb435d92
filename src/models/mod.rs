pub mod active_model;
pub mod chat;
pub mod message;

pub use active_model::{ActiveModel, ActiveModelUpdate, ReasoningEffort};
pub use chat::{Chat, ChatUpdate, ForkChatArgs};
pub use message::{Message, MessageUpdate, Role};
