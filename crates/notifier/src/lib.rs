//! Channel providers: the seam between the dispatch engine and the outside world.
//!
//! Each provider hands a rendered message to an HTTP delivery gateway and reports
//! the outcome as a transport code, so the engine can classify failures the same
//! way for every channel.

pub mod email;
pub mod gateway;
pub mod mock;
pub mod provider;
pub mod push;
pub mod sms;
pub mod webhook;

pub use email::EmailProvider;
pub use gateway::GatewayClient;
pub use mock::ScriptedProvider;
pub use provider::{ChannelProvider, DeliveryReceipt, TransportError};
pub use push::PushProvider;
pub use sms::SmsProvider;
pub use webhook::WebhookProvider;
