pub mod epoll;
pub mod waker;

pub use epoll::{Events, ReadyEvent, Selector};
pub use waker::Waker;
