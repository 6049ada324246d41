//! 会话层：每个 identity 一份会话状态，经 SessionStore 原子读改写

mod model;
mod store;

pub use model::{AppointmentDraft, Session, SessionSummary, SessionUpdate, UserProfile};
pub use store::{SessionGuard, SessionStore};
