pub mod message;

pub use message::{
    MAX_ERROR_MESSAGE_LEN, MAX_SENDER_LEN, MessageStatus, NewMessage, QueueStats, QueuedMessage,
    Transition,
};
