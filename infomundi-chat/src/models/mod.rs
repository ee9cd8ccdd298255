pub mod input;
mod message;

pub use message::{
    DeliveryStatus, MessageBody, Notification, TranscriptEntry, UNDECRYPTABLE_PLACEHOLDER,
};
