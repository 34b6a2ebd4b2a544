pub mod button;
pub mod reset;

pub use button::{ButtonEvent, UpdateButton};
