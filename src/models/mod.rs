pub mod barbershop;
pub mod booking;
pub mod event;
pub mod message;
pub mod opening_hours;
pub mod user;

pub use barbershop::{Barbershop, BarbershopService};
pub use booking::{Booking, BookingStatus};
pub use event::{ChatEvent, FinishMetadata, FinishReason};
pub use message::{new_message_id, ChatMessage, MessagePart, Role, ToolInvocation, ToolState};
pub use opening_hours::{OpeningHours, OpeningPeriod};
pub use user::User;
